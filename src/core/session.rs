use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::core::machine::{IMAGES_DIR, Machine, MachineConfig, MachineId};
use crate::core::naming::unique_token;
use crate::error::{Error, Result};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What an edit session will be saved into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionTarget {
    /// A machine already in the registry.
    Existing(MachineId),
    /// A machine that does not exist yet; images wait under `staging_dir`.
    New { staging_dir: PathBuf },
}

/// Edits to one machine configuration that have not been saved yet.
///
/// Owns the unsaved-images set (files written during the session that no persisted configuration
/// references) and the removable-drives cache (drive name to media source). Both are emptied by
/// exactly one save or discard.
#[derive(Debug)]
pub struct EditSession {
    id: SessionId,
    target: SessionTarget,
    pub draft: MachineConfig,
    images_dir: PathBuf,
    unsaved: BTreeSet<PathBuf>,
    removable: BTreeMap<String, PathBuf>,
}

impl EditSession {
    /// Session editing a copy of `machine`'s configuration.
    pub fn for_machine(machine: &Machine) -> Result<Self> {
        let images_dir = machine.images_dir().ok_or_else(|| Error::StaleMachine {
            path: None,
            message: format!("machine `{}` has no bundle to edit", machine.name()),
        })?;
        Ok(Self {
            id: SessionId::next(),
            target: SessionTarget::Existing(machine.id()),
            draft: machine.config.clone(),
            images_dir,
            unsaved: BTreeSet::new(),
            removable: BTreeMap::new(),
        })
    }

    /// Session for a machine that will be created from `draft`; images are staged under a fresh
    /// directory inside `staging_root`.
    pub fn for_new(draft: MachineConfig, staging_root: &Path) -> Self {
        let staging_dir = staging_root.join(unique_token());
        Self {
            id: SessionId::next(),
            images_dir: staging_dir.join(IMAGES_DIR),
            target: SessionTarget::New { staging_dir },
            draft,
            unsaved: BTreeSet::new(),
            removable: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn target(&self) -> &SessionTarget {
        &self.target
    }

    pub fn machine_id(&self) -> Option<MachineId> {
        match self.target {
            SessionTarget::Existing(id) => Some(id),
            SessionTarget::New { .. } => None,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self.target, SessionTarget::New { .. })
    }

    pub fn images_dir(&self) -> &Path {
        &self.images_dir
    }

    pub fn unsaved_images(&self) -> &BTreeSet<PathBuf> {
        &self.unsaved
    }

    pub fn removable_cache(&self) -> &BTreeMap<String, PathBuf> {
        &self.removable
    }

    pub(crate) fn track_unsaved(&mut self, path: PathBuf) {
        self.unsaved.insert(path);
    }

    pub(crate) fn untrack_unsaved(&mut self, path: &Path) -> bool {
        self.unsaved.remove(path)
    }

    pub(crate) fn stage_removable(&mut self, drive: String, source: PathBuf) {
        self.removable.insert(drive, source);
    }

    pub(crate) fn purge_removable(&mut self, drive: &str) -> Option<PathBuf> {
        self.removable.remove(drive)
    }

    /// Hand the removable cache to the caller, leaving it empty.
    pub(crate) fn take_removable(&mut self) -> BTreeMap<String, PathBuf> {
        std::mem::take(&mut self.removable)
    }

    /// Mark every unsaved image as persisted.
    pub(crate) fn clear_unsaved(&mut self) {
        self.unsaved.clear();
    }

    /// Delete every unsaved image (best-effort) and empty both session collections.
    pub fn discard_files(&mut self) -> usize {
        let mut removed = 0;
        for path in std::mem::take(&mut self.unsaved) {
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => log::warn!("failed to delete unsaved image {}: {err}", path.display()),
            }
        }
        self.removable.clear();
        removed
    }

    /// Point the session at `images_dir`, rewriting unsaved paths that lived in the old directory.
    pub(crate) fn relocate_images(&mut self, images_dir: PathBuf) {
        let previous = std::mem::replace(&mut self.images_dir, images_dir);
        self.unsaved = std::mem::take(&mut self.unsaved)
            .into_iter()
            .map(|path| match path.strip_prefix(&previous) {
                Ok(relative) => self.images_dir.join(relative),
                Err(_) => path,
            })
            .collect();
    }

    /// Remove the staging directory of a new-machine session, if any.
    pub(crate) fn remove_staging(&self) {
        if let SessionTarget::New { staging_dir } = &self.target {
            if staging_dir.exists() {
                if let Err(err) = fs::remove_dir_all(staging_dir) {
                    log::warn!(
                        "failed to remove staging directory {}: {err}",
                        staging_dir.display()
                    );
                }
            }
        }
    }
}
