//! Collision-free names for machines, drives and image files.
//!
//! Every generator walks a bounded sequence of candidates and returns the first one that is free.
//! When all [`MAX_NAME_ATTEMPTS`] candidates are taken the result is a random unique token.

use std::path::Path;

use crate::core::machine::{BUNDLE_EXTENSION, ImageType};

pub const MAX_NAME_ATTEMPTS: usize = 1000;

/// Globally unique token used once the candidate sequence is exhausted.
pub fn unique_token() -> String {
    uuid::Uuid::new_v4().hyphenated().to_string().to_uppercase()
}

fn first_free(
    attempts: impl Iterator<Item = usize>,
    candidate: impl Fn(usize) -> String,
    is_free: impl Fn(&str) -> bool,
) -> Option<String> {
    attempts.map(candidate).find(|name| is_free(name))
}

/// File name inside `dir` derived from `file_name`: `base.ext`, `base-2.ext`, `base-3.ext`, …
///
/// `extension` replaces the original extension when given. Existence is checked against the
/// filesystem at call time.
pub fn unique_file_name(dir: &Path, file_name: &str, extension: Option<&str>) -> String {
    unique_file_name_with(file_name, extension, |candidate| {
        !dir.join(candidate).exists()
    })
}

pub(crate) fn unique_file_name_with(
    file_name: &str,
    extension: Option<&str>,
    is_free: impl Fn(&str) -> bool,
) -> String {
    let original = Path::new(file_name);
    let stem = original
        .file_stem()
        .and_then(|value| value.to_str())
        .unwrap_or(file_name)
        .to_string();
    let ext = extension
        .map(str::to_string)
        .or_else(|| {
            original
                .extension()
                .and_then(|value| value.to_str())
                .map(str::to_string)
        })
        .filter(|value| !value.is_empty());

    let with_ext = |name: String| match &ext {
        Some(ext) => format!("{name}.{ext}"),
        None => name,
    };

    first_free(
        1..MAX_NAME_ATTEMPTS,
        |i| {
            if i == 1 {
                with_ext(stem.clone())
            } else {
                with_ext(format!("{stem}-{i}"))
            }
        },
        is_free,
    )
    .unwrap_or_else(|| with_ext(unique_token()))
}

/// Drive name not present in `taken`: `drive0`, `drive1`, …
pub fn unique_drive_name<'a>(taken: impl IntoIterator<Item = &'a str>) -> String {
    let taken: Vec<&str> = taken.into_iter().collect();
    first_free(
        0..MAX_NAME_ATTEMPTS,
        |i| format!("drive{i}"),
        |candidate| !taken.contains(&candidate),
    )
    .unwrap_or_else(unique_token)
}

/// Image file name for a freshly created drive: `disk-0.qcow2`, `disk-1.qcow2`, …
pub fn unique_drive_path(dir: &Path, image_type: ImageType, extension: &str) -> String {
    first_free(
        0..MAX_NAME_ATTEMPTS,
        |i| format!("{}-{i}.{extension}", image_type.as_str()),
        |candidate| !dir.join(candidate).exists(),
    )
    .unwrap_or_else(unique_token)
}

/// Machine name whose bundle does not exist under `parent`: `base`, `base 2`, `base 3`, …
pub fn unique_machine_name(parent: &Path, base: &str) -> String {
    unique_machine_name_with(base, |candidate| {
        !parent
            .join(format!("{candidate}.{BUNDLE_EXTENSION}"))
            .exists()
    })
}

pub(crate) fn unique_machine_name_with(base: &str, is_free: impl Fn(&str) -> bool) -> String {
    first_free(
        1..MAX_NAME_ATTEMPTS,
        |i| {
            if i <= 1 {
                base.to_string()
            } else {
                format!("{base} {i}")
            }
        },
        is_free,
    )
    .unwrap_or_else(unique_token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn file_names_follow_dash_numbering() {
        let dir = tempdir().unwrap();
        assert_eq!(unique_file_name(dir.path(), "disk.img", None), "disk.img");
        fs::write(dir.path().join("disk.img"), b"").unwrap();
        assert_eq!(unique_file_name(dir.path(), "disk.img", None), "disk-2.img");
        fs::write(dir.path().join("disk-2.img"), b"").unwrap();
        assert_eq!(unique_file_name(dir.path(), "disk.img", None), "disk-3.img");
    }

    #[test]
    fn file_names_reuse_the_first_gap() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("disk.img"), b"").unwrap();
        fs::write(dir.path().join("disk-3.img"), b"").unwrap();
        assert_eq!(unique_file_name(dir.path(), "disk.img", None), "disk-2.img");
    }

    #[test]
    fn file_names_can_swap_extension() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("disk.qcow2"), b"").unwrap();
        assert_eq!(
            unique_file_name(dir.path(), "disk.img", Some("qcow2")),
            "disk-2.qcow2"
        );
    }

    #[test]
    fn file_names_without_extension_stay_bare() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("firmware"), b"").unwrap();
        assert_eq!(unique_file_name(dir.path(), "firmware", None), "firmware-2");
    }

    #[test]
    fn exhausted_file_names_fall_back_to_token() {
        let name = unique_file_name_with("disk.img", None, |_| false);
        assert!(name.ends_with(".img"));
        let stem = name.trim_end_matches(".img");
        assert!(uuid::Uuid::parse_str(stem).is_ok());
    }

    #[test]
    fn drive_names_skip_taken_entries() {
        assert_eq!(unique_drive_name([]), "drive0");
        assert_eq!(unique_drive_name(["drive0", "drive2"]), "drive1");
        assert_eq!(unique_drive_name(["drive0", "drive1"]), "drive2");
    }

    #[test]
    fn exhausted_drive_names_fall_back_to_token() {
        let taken: Vec<String> = (0..MAX_NAME_ATTEMPTS).map(|i| format!("drive{i}")).collect();
        let name = unique_drive_name(taken.iter().map(String::as_str));
        assert!(uuid::Uuid::parse_str(&name).is_ok());
    }

    #[test]
    fn drive_paths_are_typed_and_numbered() {
        let dir = tempdir().unwrap();
        assert_eq!(
            unique_drive_path(dir.path(), ImageType::Disk, "qcow2"),
            "disk-0.qcow2"
        );
        fs::write(dir.path().join("disk-0.qcow2"), b"").unwrap();
        assert_eq!(
            unique_drive_path(dir.path(), ImageType::Disk, "qcow2"),
            "disk-1.qcow2"
        );
        assert_eq!(unique_drive_path(dir.path(), ImageType::Cd, "raw"), "cd-0.raw");
    }

    #[test]
    fn machine_names_use_space_numbering() {
        let dir = tempdir().unwrap();
        assert_eq!(unique_machine_name(dir.path(), "Debian"), "Debian");
        fs::create_dir(dir.path().join("Debian.vmbundle")).unwrap();
        assert_eq!(unique_machine_name(dir.path(), "Debian"), "Debian 2");
    }

    #[test]
    fn exhausted_machine_names_fall_back_to_token() {
        let name = unique_machine_name_with("Debian", |_| false);
        assert!(uuid::Uuid::parse_str(&name).is_ok());
    }
}
