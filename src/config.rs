use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

pub const DEFAULT_SETTINGS_FILE: &str = "vmshelf.toml";
pub const DEFAULT_PREFERENCES_FILE: &str = "preferences.json";
pub const STORAGE_ENV: &str = "VMSHELF_HOME";

/// Resolved library settings.
#[derive(Debug, Clone)]
pub struct LibrarySettings {
    /// Settings file these values were read from, if any.
    pub file_path: Option<PathBuf>,
    /// Directory holding managed machine bundles.
    pub storage_root: PathBuf,
    /// JSON preferences file holding the ordered machine list.
    pub preferences_path: PathBuf,
    /// `qemu-img` binary used for conversion, resize and size queries.
    pub qemu_img: Option<PathBuf>,
    /// Whether shortcut entries may be written to the persisted list.
    pub persist_shortcuts: bool,
    /// Whether imports may convert images to qcow2.
    pub convert_images: bool,
    pub warnings: Vec<String>,
}

impl LibrarySettings {
    /// Settings rooted at `storage_root` with every other value defaulted.
    pub fn with_storage_root(storage_root: impl Into<PathBuf>) -> Self {
        let storage_root = storage_root.into();
        Self {
            file_path: None,
            preferences_path: storage_root.join(DEFAULT_PREFERENCES_FILE),
            storage_root,
            qemu_img: find_executable(&["qemu-img", "qemu-img.exe"]),
            persist_shortcuts: true,
            convert_images: true,
            warnings: Vec::new(),
        }
    }

    /// Settings for the default storage location (`$VMSHELF_HOME`, then
    /// `$HOME/.local/share/vmshelf`).
    pub fn defaults() -> Self {
        Self::with_storage_root(default_storage_root())
    }

    /// Directory new-machine sessions stage their images under.
    pub fn staging_root(&self) -> PathBuf {
        self.storage_root.join(".staging")
    }

    /// Directory in-flight downloads are written to.
    pub fn downloads_root(&self) -> PathBuf {
        self.storage_root.join(".downloads")
    }

    /// Directory whose bundles are moved (not linked) into storage on import.
    pub fn inbox_root(&self) -> PathBuf {
        self.storage_root.join("Inbox")
    }
}

pub fn default_storage_root() -> PathBuf {
    if let Some(explicit) = env::var_os(STORAGE_ENV).filter(|value| !value.is_empty()) {
        return PathBuf::from(explicit);
    }
    user_home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".local")
        .join("share")
        .join("vmshelf")
}

pub(crate) fn user_home_dir() -> Option<PathBuf> {
    if let Some(home) = env::var_os("HOME") {
        if !home.is_empty() {
            return Some(PathBuf::from(home));
        }
    }

    #[cfg(windows)]
    {
        if let Some(profile) = env::var_os("USERPROFILE") {
            if !profile.is_empty() {
                return Some(PathBuf::from(profile));
            }
        }
    }

    None
}

/// Load settings from a TOML file.
///
/// Relative paths are resolved against the directory containing the file. Unknown keys are
/// reported through [`LibrarySettings::warnings`] rather than rejected.
pub fn load_settings(path: &Path) -> Result<LibrarySettings> {
    let contents = fs::read_to_string(path).map_err(|source| Error::ReadSettings {
        path: path.to_path_buf(),
        source,
    })?;

    let value: toml::Value = toml::from_str(&contents).map_err(|source| Error::ParseSettings {
        path: path.to_path_buf(),
        source,
    })?;

    let mut warnings = detect_unknown_fields(&value);

    let raw = RawSettings::deserialize(value).map_err(|source| Error::ParseSettings {
        path: path.to_path_buf(),
        source,
    })?;

    raw.into_validated(path, &mut warnings)
}

/// Load settings from `explicit` when given, otherwise from `<storage>/vmshelf.toml` if it exists,
/// otherwise fall back to defaults.
pub fn resolve_settings(explicit: Option<&Path>) -> Result<LibrarySettings> {
    if let Some(path) = explicit {
        return load_settings(path);
    }
    let candidate = default_storage_root().join(DEFAULT_SETTINGS_FILE);
    if candidate.is_file() {
        load_settings(&candidate)
    } else {
        Ok(LibrarySettings::defaults())
    }
}

fn detect_unknown_fields(value: &toml::Value) -> Vec<String> {
    let mut warnings = Vec::new();
    if let toml::Value::Table(table) = value {
        warn_table(table, &["storage", "images"], "root", &mut warnings);

        match table.get("storage") {
            Some(toml::Value::Table(storage)) => warn_table(
                storage,
                &["root", "preferences", "persist_shortcuts"],
                "[storage]",
                &mut warnings,
            ),
            Some(_) => warnings.push("Expected [storage] to be a table.".to_string()),
            None => {}
        }

        match table.get("images") {
            Some(toml::Value::Table(images)) => {
                warn_table(images, &["qemu_img", "convert"], "[images]", &mut warnings)
            }
            Some(_) => warnings.push("Expected [images] to be a table.".to_string()),
            None => {}
        }
    }
    warnings
}

fn warn_table(
    table: &toml::map::Map<String, toml::Value>,
    allowed: &[&str],
    context: &str,
    warnings: &mut Vec<String>,
) {
    for key in table.keys() {
        if !allowed.contains(&key.as_str()) {
            warnings.push(format!(
                "Unknown field `{key}` at {context}; this value will be ignored."
            ));
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawSettings {
    #[serde(default)]
    storage: RawStorage,
    #[serde(default)]
    images: RawImages,
}

#[derive(Debug, Default, Deserialize)]
struct RawStorage {
    root: Option<String>,
    preferences: Option<String>,
    persist_shortcuts: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct RawImages {
    qemu_img: Option<String>,
    convert: Option<bool>,
}

impl RawSettings {
    fn into_validated(self, path: &Path, warnings: &mut Vec<String>) -> Result<LibrarySettings> {
        let base = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let storage_root = match self.storage.root {
            Some(root) if root.trim().is_empty() => {
                return Err(Error::InvalidSettings {
                    path: path.to_path_buf(),
                    message: "`storage.root` must not be empty.".to_string(),
                });
            }
            Some(root) => resolve_relative(&base, &root),
            None => default_storage_root(),
        };

        let preferences_path = self
            .storage
            .preferences
            .map(|value| resolve_relative(&base, &value))
            .unwrap_or_else(|| storage_root.join(DEFAULT_PREFERENCES_FILE));

        let qemu_img = match self.images.qemu_img {
            Some(binary) => {
                let resolved = resolve_relative(&base, &binary);
                if !resolved.is_file() {
                    warnings.push(format!(
                        "Configured qemu-img {} does not exist; image conversion will be unavailable.",
                        resolved.display()
                    ));
                }
                Some(resolved)
            }
            None => find_executable(&["qemu-img", "qemu-img.exe"]),
        };

        Ok(LibrarySettings {
            file_path: Some(path.to_path_buf()),
            storage_root,
            preferences_path,
            qemu_img,
            persist_shortcuts: self.storage.persist_shortcuts.unwrap_or(true),
            convert_images: self.images.convert.unwrap_or(true),
            warnings: std::mem::take(warnings),
        })
    }
}

fn resolve_relative(base: &Path, value: &str) -> PathBuf {
    let expanded = if let Some(rest) = value.strip_prefix("~/") {
        user_home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(value))
    } else {
        PathBuf::from(value)
    };
    if expanded.is_absolute() {
        expanded
    } else {
        base.join(expanded)
    }
}

pub(crate) fn find_executable(candidates: &[&str]) -> Option<PathBuf> {
    for candidate in candidates {
        let path = Path::new(candidate);
        if path.is_absolute() && path.is_file() {
            return Some(path.to_path_buf());
        }
    }

    let path_var = env::var_os("PATH")?;
    for dir in env::split_paths(&path_var) {
        for candidate in candidates {
            let full = dir.join(candidate);
            if full.is_file() {
                return Some(full);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use temp_env::with_var;
    use tempfile::tempdir;

    #[test]
    fn load_settings_resolves_relative_paths() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(DEFAULT_SETTINGS_FILE);
        fs::write(
            &path,
            r#"
[storage]
root = "machines"
preferences = "state/prefs.json"
persist_shortcuts = false

[images]
convert = false
"#,
        )
        .unwrap();

        let settings = load_settings(&path).unwrap();
        assert_eq!(settings.storage_root, dir.path().join("machines"));
        assert_eq!(settings.preferences_path, dir.path().join("state/prefs.json"));
        assert!(!settings.persist_shortcuts);
        assert!(!settings.convert_images);
        assert!(settings.warnings.is_empty());
    }

    #[test]
    fn unknown_fields_become_warnings() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(DEFAULT_SETTINGS_FILE);
        fs::write(
            &path,
            r#"
colour = "blue"
[storage]
root = "machines"
shelf = 3
"#,
        )
        .unwrap();

        let settings = load_settings(&path).unwrap();
        assert_eq!(settings.warnings.len(), 2);
        assert!(settings.warnings.iter().any(|w| w.contains("`colour`")));
        assert!(settings.warnings.iter().any(|w| w.contains("[storage]")));
    }

    #[test]
    fn empty_storage_root_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(DEFAULT_SETTINGS_FILE);
        fs::write(&path, "[storage]\nroot = \"  \"\n").unwrap();
        let err = load_settings(&path).unwrap_err();
        assert!(matches!(err, Error::InvalidSettings { .. }));
    }

    #[test]
    fn malformed_settings_report_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(DEFAULT_SETTINGS_FILE);
        fs::write(&path, "[storage\n").unwrap();
        let err = load_settings(&path).unwrap_err();
        assert!(matches!(err, Error::ParseSettings { .. }));
    }

    #[test]
    fn default_storage_root_prefers_explicit_env() {
        let dir = tempdir().unwrap();
        with_var(STORAGE_ENV, Some(dir.path().to_str().unwrap()), || {
            assert_eq!(default_storage_root(), dir.path());
        });
    }

    #[test]
    fn default_storage_root_falls_back_to_home() {
        let home = tempdir().unwrap();
        with_var(STORAGE_ENV, None::<&str>, || {
            with_var("HOME", Some(home.path().to_str().unwrap()), || {
                assert_eq!(
                    default_storage_root(),
                    home.path().join(".local/share/vmshelf")
                );
            });
        });
    }

    #[test]
    fn derived_directories_live_under_storage_root() {
        let settings = LibrarySettings::with_storage_root("/srv/vms");
        assert_eq!(settings.staging_root(), PathBuf::from("/srv/vms/.staging"));
        assert_eq!(settings.downloads_root(), PathBuf::from("/srv/vms/.downloads"));
        assert_eq!(settings.inbox_root(), PathBuf::from("/srv/vms/Inbox"));
        assert_eq!(
            settings.preferences_path,
            PathBuf::from("/srv/vms/preferences.json")
        );
    }
}
