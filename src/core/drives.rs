//! Drive image lifecycle: import, create, remove, resize and reclaim.
//!
//! Operations that produce files are split in two. A `stage_*` function does the file and backend
//! work and may run on any worker; [`EditSession::adopt`] registers the result and must run on the
//! thread that owns the session.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use sysinfo::Disks;

use crate::core::backend::ImageBackend;
use crate::core::machine::{
    self, DriveImage, ImageType, Machine, default_interface, image_path,
};
use crate::core::naming::{unique_drive_name, unique_drive_path, unique_file_name};
use crate::core::session::EditSession;
use crate::error::{Error, Result};

pub const MIB: u64 = 1_048_576;

/// Request to bring an existing image file into a machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRequest {
    pub source: PathBuf,
    pub image_type: ImageType,
    pub interface: String,
    /// Keep the source format instead of converting to qcow2.
    pub raw: bool,
    /// Copy the source; when false the source file is moved.
    pub copy: bool,
}

impl ImportRequest {
    /// Import that copies and converts `source`, with type and interface picked from the file
    /// name and architecture.
    pub fn for_source(source: impl Into<PathBuf>, architecture: Option<&str>) -> Self {
        let source = source.into();
        let image_type = ImageType::for_file(&source);
        Self {
            interface: default_interface(architecture, image_type).to_string(),
            source,
            image_type,
            raw: image_type == ImageType::Cd,
            copy: true,
        }
    }
}

/// Request to create a new drive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveSpec {
    pub image_type: ImageType,
    pub interface: String,
    pub removable: bool,
    pub raw: bool,
    pub size_mib: u64,
}

/// Outcome of a staging step, waiting to be adopted by a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StagedDrive {
    Image {
        path: PathBuf,
        image_type: ImageType,
        interface: String,
    },
    Removable {
        image_type: ImageType,
        interface: String,
        source: Option<PathBuf>,
    },
}

impl StagedDrive {
    /// Delete the staged file when the session it was meant for is gone.
    pub fn abandon(self) {
        if let StagedDrive::Image { path, .. } = self {
            if let Err(err) = fs::remove_file(&path) {
                log::warn!("failed to remove abandoned image {}: {err}", path.display());
            }
        }
    }
}

fn ensure_images_dir(images_dir: &Path) -> Result<()> {
    fs::create_dir_all(images_dir)
        .map_err(|source| Error::io("create image directory", images_dir, source))
}

fn validate_source(source: &Path) -> Result<()> {
    if source.is_dir() {
        return Err(if machine::is_bundle(source) {
            Error::BundleAsDrive {
                path: source.to_path_buf(),
            }
        } else {
            Error::DirectoryAsDrive {
                path: source.to_path_buf(),
            }
        });
    }
    if !source.exists() {
        return Err(Error::SourceMissing {
            path: source.to_path_buf(),
        });
    }
    Ok(())
}

/// Remove a file or directory left behind by a failed operation, logging anything but absence.
pub(crate) fn discard_partial(path: &Path) {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => log::warn!("failed to remove partial {}: {err}", path.display()),
    }
}

/// Move `source` to `destination`, falling back to copy and delete across filesystems.
pub(crate) fn move_file(source: &Path, destination: &Path) -> Result<()> {
    if fs::rename(source, destination).is_ok() {
        return Ok(());
    }
    fs::copy(source, destination).map_err(|err| {
        discard_partial(destination);
        Error::io("copy", source, err)
    })?;
    fs::remove_file(source).map_err(|err| Error::io("remove", source, err))
}

/// Copy, move or convert `request.source` into `images_dir` under a collision-free name.
pub fn stage_import(
    request: &ImportRequest,
    images_dir: &Path,
    backend: &dyn ImageBackend,
) -> Result<StagedDrive> {
    validate_source(&request.source)?;
    ensure_images_dir(images_dir)?;

    let file_name = request
        .source
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| Error::SourceMissing {
            path: request.source.clone(),
        })?;

    let convert = request.copy && !request.raw && backend.supports_conversion();
    let destination = if convert {
        images_dir.join(unique_file_name(images_dir, file_name, Some("qcow2")))
    } else {
        images_dir.join(unique_file_name(images_dir, file_name, None))
    };

    if convert {
        log::info!(
            "converting {} into {}",
            request.source.display(),
            destination.display()
        );
        backend.convert(&request.source, &destination, false)?;
    } else if request.copy {
        fs::copy(&request.source, &destination).map_err(|source| {
            discard_partial(&destination);
            Error::io("copy", &request.source, source)
        })?;
    } else {
        move_file(&request.source, &destination)?;
    }

    Ok(StagedDrive::Image {
        path: destination,
        image_type: request.image_type,
        interface: request.interface.clone(),
    })
}

/// Allocate the backing file for a new drive, or nothing for a removable one.
pub fn stage_create(
    spec: &DriveSpec,
    images_dir: &Path,
    removable_source: Option<&Path>,
    backend: &dyn ImageBackend,
) -> Result<StagedDrive> {
    if spec.removable {
        return Ok(StagedDrive::Removable {
            image_type: spec.image_type,
            interface: spec.interface.clone(),
            source: removable_source.map(Path::to_path_buf),
        });
    }
    if spec.size_mib == 0 {
        return Err(Error::InvalidSize {
            size_mib: spec.size_mib,
        });
    }
    let size_bytes = spec.size_mib.checked_mul(MIB).ok_or(Error::InvalidSize {
        size_mib: spec.size_mib,
    })?;

    ensure_images_dir(images_dir)?;
    let extension = if spec.raw { "raw" } else { "qcow2" };
    let path = images_dir.join(unique_drive_path(images_dir, spec.image_type, extension));

    if spec.raw {
        let file = File::create(&path).map_err(|source| Error::io("create", &path, source))?;
        if let Err(source) = file.set_len(size_bytes) {
            drop(file);
            discard_partial(&path);
            return Err(Error::io("allocate", &path, source));
        }
    } else {
        backend.create(&path, size_bytes)?;
    }

    Ok(StagedDrive::Image {
        path,
        image_type: spec.image_type,
        interface: spec.interface.clone(),
    })
}

impl EditSession {
    /// Register a staged drive in this session and return its generated drive name.
    pub fn adopt(&mut self, staged: StagedDrive) -> Result<String> {
        let name = unique_drive_name(self.draft.drive_names());
        match staged {
            StagedDrive::Image {
                path,
                image_type,
                interface,
            } => {
                let file_name = path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .map(str::to_string)
                    .ok_or_else(|| Error::SourceMissing { path: path.clone() })?;
                self.track_unsaved(path);
                self.draft
                    .new_drive(name.clone(), file_name, image_type, interface);
            }
            StagedDrive::Removable {
                image_type,
                interface,
                source,
            } => {
                if let Some(source) = source {
                    self.stage_removable(name.clone(), source);
                }
                self.draft
                    .new_removable_drive(name.clone(), image_type, interface);
            }
        }
        Ok(name)
    }

    /// Stage and adopt an import in one step.
    pub fn import_drive(
        &mut self,
        request: &ImportRequest,
        backend: &dyn ImageBackend,
    ) -> Result<String> {
        let staged = stage_import(request, self.images_dir(), backend)?;
        self.adopt(staged)
    }

    /// Stage and adopt a new drive in one step.
    pub fn create_drive(
        &mut self,
        spec: &DriveSpec,
        removable_source: Option<&Path>,
        backend: &dyn ImageBackend,
    ) -> Result<String> {
        let staged = stage_create(spec, self.images_dir(), removable_source, backend)?;
        self.adopt(staged)
    }

    /// Remove the drive at `index`, deleting its backing file best-effort.
    pub fn remove_drive(&mut self, index: usize) -> Result<DriveImage> {
        let drive = self.draft.drive(index).cloned().ok_or(Error::DriveIndexOutOfRange {
            index,
            count: self.draft.drives.len(),
        })?;

        if let Some(file) = drive.path.as_deref() {
            let path = image_path(self.images_dir(), file)?;
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => log::warn!("failed to delete drive image {}: {err}", path.display()),
            }
            self.untrack_unsaved(&path);
        }
        if drive.removable {
            self.purge_removable(&drive.name);
        }
        self.draft.remove_drive(index)
    }
}

/// Resize `image` to exactly `size_mib` MiB.
pub fn resize_drive(backend: &dyn ImageBackend, image: &Path, size_mib: u64) -> Result<()> {
    if size_mib == 0 {
        return Err(Error::InvalidSize { size_mib });
    }
    let size_bytes = size_mib
        .checked_mul(MIB)
        .ok_or(Error::InvalidSize { size_mib })?;
    backend.resize(image, size_bytes)
}

/// Rewrite `image` through the backend to shrink it, replacing the original only on success.
pub fn reclaim_space(backend: &dyn ImageBackend, image: &Path, compress: bool) -> Result<()> {
    let parent = image.parent().ok_or_else(|| Error::SourceMissing {
        path: image.to_path_buf(),
    })?;
    let file_name = image
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| Error::SourceMissing {
            path: image.to_path_buf(),
        })?;
    let current = file_size(image)?;
    ensure_headroom(image, parent, current)?;

    let temporary = parent.join(unique_file_name(parent, file_name, Some("qcow2")));
    backend.convert(image, &temporary, compress)?;

    if let Err(source) = fs::rename(&temporary, image) {
        if let Err(err) = fs::remove_file(&temporary) {
            log::warn!(
                "failed to remove reclaim output {}: {err}",
                temporary.display()
            );
        }
        return Err(Error::io("replace", image, source));
    }

    let reclaimed = current.saturating_sub(file_size(image).unwrap_or(current));
    log::info!("reclaimed {reclaimed} bytes from {}", image.display());
    Ok(())
}

fn ensure_headroom(image: &Path, parent: &Path, required: u64) -> Result<()> {
    let disks = Disks::new_with_refreshed_list();
    match available_disk_space(&disks, parent) {
        Some(available) if available < required => Err(Error::InsufficientSpace {
            path: image.to_path_buf(),
            required,
            available,
        }),
        _ => Ok(()),
    }
}

fn available_disk_space(disks: &Disks, path: &Path) -> Option<u64> {
    let canonical = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    disks
        .iter()
        .filter(|disk| canonical.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().components().count())
        .map(|disk| disk.available_space())
}

/// Virtual size of `image`, or 0 when the backend cannot tell.
pub fn drive_size(backend: &dyn ImageBackend, image: &Path) -> u64 {
    backend.query_size(image).unwrap_or_else(|err| {
        log::debug!("size query for {} failed: {err}", image.display());
        0
    })
}

/// Bytes `path` occupies on disk.
pub fn file_size(path: &Path) -> Result<u64> {
    fs::metadata(path)
        .map(|meta| meta.len())
        .map_err(|source| Error::io("stat", path, source))
}

/// Result of binding cached removable media to a machine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitSummary {
    pub bound: Vec<String>,
    pub missing: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl CommitSummary {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.failed.is_empty()
    }
}

/// Bind every cached medium to the machine's drive of the same name. The cache is consumed, so
/// no entry is ever retried.
pub fn commit_removable_images(
    cache: BTreeMap<String, PathBuf>,
    machine: &mut Machine,
) -> CommitSummary {
    let mut summary = CommitSummary::default();
    for (drive, source) in cache {
        if machine.config.drive_by_name(&drive).is_none() {
            log::warn!(
                "removable drive `{drive}` is no longer configured on `{}`",
                machine.name()
            );
            summary.missing.push(drive);
            continue;
        }
        match machine.change_medium(&drive, &source) {
            Ok(()) => summary.bound.push(drive),
            Err(err) => {
                log::warn!("failed to insert {} into `{drive}`: {err}", source.display());
                summary.failed.push((drive, err.to_string()));
            }
        }
    }
    summary
}

impl EditSession {
    /// Commit this session's removable cache into `machine`, leaving the cache empty.
    pub fn commit_removable(&mut self, machine: &mut Machine) -> CommitSummary {
        commit_removable_images(self.take_removable(), machine)
    }
}
