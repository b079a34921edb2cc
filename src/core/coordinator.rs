//! Save, discard and whole-bundle operations.
//!
//! Bundle-level operations come in three parts so the heavy file work can leave the writer thread:
//! a `plan_*` step reads registry state, a free `perform_*` function touches the filesystem, and a
//! `finish_*` step applies the result to the registry. The plain methods chain all three for
//! callers already on the writer.

use std::fs;
use std::path::{Path, PathBuf};

use crate::core::drives::{discard_partial, move_file};
use crate::core::library::LibraryState;
use crate::core::machine::{
    Entry, IMAGES_DIR, Machine, MachineConfig, MachineId, bundle_path, validate_machine_name,
};
use crate::core::naming::unique_machine_name_with;
use crate::core::session::{EditSession, SessionId, SessionTarget};
use crate::error::{Error, Result};

/// Outcome of a save, including the recovery path taken after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveState {
    Saved,
    /// The on-disk configuration was reloaded over the edits.
    Reloaded,
    /// The machine was rebuilt from its bundle and swapped into the same slot.
    Reconstructed(MachineId),
    /// Neither reload nor reconstruction worked; the entry is stale.
    Exhausted,
}

/// Copy of a bundle into a new location.
#[derive(Debug, Clone)]
pub struct ClonePlan {
    pub anchor: MachineId,
    pub source: PathBuf,
    pub destination: PathBuf,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct MovePlan {
    pub id: MachineId,
    pub source: PathBuf,
    pub destination: PathBuf,
}

#[derive(Debug, Clone)]
pub enum ImportPlan {
    /// The bundle is already listed; it has been selected.
    Listed(MachineId),
    /// Move out of the inbox into storage.
    Move { source: PathBuf, destination: PathBuf },
    /// Register in place as a shortcut.
    Shortcut { source: PathBuf },
    /// Copy into storage.
    Copy { source: PathBuf, destination: PathBuf },
}

impl LibraryState {
    /// Open an edit session over machine `id`. Orphaned image files are re-attached to the draft
    /// so they can be removed.
    pub fn open_session(&mut self, id: MachineId) -> Result<SessionId> {
        let machine = self.registry.machine(id)?;
        let mut session = EditSession::for_machine(machine)?;
        let images_dir = session.images_dir().to_path_buf();
        let recovered = session.draft.recover_orphaned_drives(&images_dir);
        if recovered > 0 {
            log::info!(
                "recovered {recovered} orphaned image(s) for `{}`",
                machine.name()
            );
        }
        let session_id = session.id();
        self.sessions.insert(session_id, session);
        self.registry.select(Some(id));
        Ok(session_id)
    }

    /// Open an edit session for a machine that does not exist yet.
    pub fn new_session(&mut self, draft: MachineConfig) -> SessionId {
        let session = EditSession::for_new(draft, &self.settings.staging_root());
        let session_id = session.id();
        self.sessions.insert(session_id, session);
        session_id
    }

    pub fn session(&self, id: SessionId) -> Result<&EditSession> {
        self.sessions
            .get(&id)
            .ok_or(Error::SessionNotFound { id: id.get() })
    }

    pub fn session_mut(&mut self, id: SessionId) -> Result<&mut EditSession> {
        self.sessions
            .get_mut(&id)
            .ok_or(Error::SessionNotFound { id: id.get() })
    }

    fn take_session(&mut self, id: SessionId) -> Result<EditSession> {
        self.sessions
            .remove(&id)
            .ok_or(Error::SessionNotFound { id: id.get() })
    }

    /// Persist the session's draft into its machine and close the session.
    ///
    /// A failed save discards the session's edits and, if that fails too, rebuilds the machine
    /// from its bundle. The original error is returned either way.
    pub fn save(&mut self, session_id: SessionId) -> Result<()> {
        let mut session = self.take_session(session_id)?;
        let id = match session.target() {
            SessionTarget::Existing(id) => *id,
            SessionTarget::New { .. } => {
                return self.create_from(&mut session).map(|_| ());
            }
        };
        let result = self.save_into(id, &mut session);
        let state = match &result {
            Ok(()) => SaveState::Saved,
            Err(err) => {
                log::warn!("saving machine {id} failed: {err}");
                self.recover_failed_save(id, &mut session)
            }
        };
        log::debug!("save of machine {id} ended as {state:?}");
        result
    }

    fn save_into(&mut self, id: MachineId, session: &mut EditSession) -> Result<()> {
        let machine = self.registry.machine_mut(id)?;
        machine.config = session.draft.clone();
        machine.save()?;
        let summary = session.commit_removable(machine);
        if !summary.is_clean() {
            log::warn!(
                "{} removable medium/media could not be bound to `{}`",
                summary.missing.len() + summary.failed.len(),
                machine.name()
            );
        }
        session.clear_unsaved();
        self.registry.touch();
        Ok(())
    }

    fn recover_failed_save(&mut self, id: MachineId, session: &mut EditSession) -> SaveState {
        let reload_err = match self.discard_session(session) {
            Ok(()) => return SaveState::Reloaded,
            Err(err) => err,
        };
        log::warn!("reloading machine {id} after a failed save failed: {reload_err}");

        let path = self
            .registry
            .machine(id)
            .ok()
            .and_then(|machine| machine.path().map(Path::to_path_buf));
        let Some(path) = path else {
            log::error!(
                "{}",
                Error::StaleMachine {
                    path: None,
                    message: "machine has no bundle to rebuild from".to_string(),
                }
            );
            return SaveState::Exhausted;
        };
        match Machine::open(&path) {
            Ok(machine) => {
                let new_id = machine.id();
                match self.registry.replace(id, machine.into()) {
                    Ok(_) => {
                        self.registry.select(Some(new_id));
                        SaveState::Reconstructed(new_id)
                    }
                    Err(err) => {
                        log::error!("failed to swap rebuilt machine into the list: {err}");
                        SaveState::Exhausted
                    }
                }
            }
            Err(err) => {
                log::error!(
                    "{}",
                    Error::StaleMachine {
                        path: Some(path),
                        message: err.to_string(),
                    }
                );
                SaveState::Exhausted
            }
        }
    }

    /// Throw away the session's edits and close it.
    ///
    /// Unsaved images are deleted even when reloading the machine fails; the reload error is
    /// returned afterwards.
    pub fn discard(&mut self, session_id: SessionId) -> Result<()> {
        let mut session = self.take_session(session_id)?;
        self.discard_session(&mut session)
    }

    fn discard_session(&mut self, session: &mut EditSession) -> Result<()> {
        let reload = match session.machine_id() {
            Some(id) => self.registry.machine_mut(id).and_then(Machine::reload),
            None => Ok(()),
        };
        if reload.is_ok() && session.machine_id().is_some() {
            self.registry.touch();
        }
        let removed = session.discard_files();
        if removed > 0 {
            log::info!("deleted {removed} unsaved image(s)");
        }
        session.remove_staging();
        reload
    }

    /// Create a machine from a new-machine session and select it.
    pub fn create(&mut self, session_id: SessionId) -> Result<MachineId> {
        let mut session = self.take_session(session_id)?;
        if let Some(id) = session.machine_id() {
            self.sessions.insert(session_id, session);
            return self.save(session_id).map(|()| id);
        }
        self.create_from(&mut session)
    }

    fn create_from(&mut self, session: &mut EditSession) -> Result<MachineId> {
        let result = self
            .check_new_name(&session.draft.name)
            .and_then(|bundle| self.materialise(session, &bundle));
        if result.is_err() {
            session.discard_files();
        }
        session.remove_staging();
        result
    }

    /// Bundle path for a new machine called `name`, rejecting names already in use.
    fn check_new_name(&self, name: &str) -> Result<PathBuf> {
        validate_machine_name(name)?;
        let bundle = bundle_path(&self.settings.storage_root, name);
        if self.registry.has_name(name) || bundle.exists() {
            return Err(Error::DuplicateName {
                name: name.to_string(),
            });
        }
        Ok(bundle)
    }

    fn materialise(&mut self, session: &mut EditSession, bundle: &Path) -> Result<MachineId> {
        let machine = match build_bundle(session, bundle, &self.settings.storage_root) {
            Ok(machine) => machine,
            Err(err) => {
                if bundle.exists() {
                    if let Err(cleanup) = fs::remove_dir_all(bundle) {
                        log::warn!(
                            "failed to remove half-created bundle {}: {cleanup}",
                            bundle.display()
                        );
                    }
                }
                return Err(err);
            }
        };
        let id = machine.id();
        log::info!("created machine `{}`", machine.name());
        self.registry.add(machine.into(), None);
        self.registry.select(Some(id));
        Ok(id)
    }

    /// Machine name based on `base` that collides with neither a bundle nor a listed machine.
    pub fn unique_name(&self, base: &str) -> String {
        let root = &self.settings.storage_root;
        unique_machine_name_with(base, |candidate| {
            !bundle_path(root, candidate).exists() && !self.registry.has_name(candidate)
        })
    }

    fn live_path(&self, id: MachineId) -> Result<PathBuf> {
        let machine = self.registry.machine(id)?;
        machine
            .path()
            .map(Path::to_path_buf)
            .ok_or_else(|| Error::StaleMachine {
                path: None,
                message: format!("machine `{}` has never been saved", machine.name()),
            })
    }

    /// Bundle path to delete for `id`; placeholders have nothing on disk to remove.
    pub fn plan_delete(&self, id: MachineId) -> Result<Option<PathBuf>> {
        match self.registry.require(id)? {
            Entry::Live(machine) => Ok(machine.path().map(Path::to_path_buf)),
            Entry::Placeholder(_) => Ok(None),
        }
    }

    pub fn finish_delete(&mut self, id: MachineId) -> Option<usize> {
        self.sessions
            .retain(|_, session| session.machine_id() != Some(id));
        self.registry.remove(id)
    }

    /// Delete the bundle of `id` and remove it from the list.
    pub fn delete(&mut self, id: MachineId) -> Result<Option<usize>> {
        if let Some(path) = self.plan_delete(id)? {
            perform_delete(&path)?;
        }
        Ok(self.finish_delete(id))
    }

    /// Remove `id` from the list without touching its files.
    pub fn forget(&mut self, id: MachineId) -> Result<Option<usize>> {
        self.registry.require(id)?;
        Ok(self.finish_delete(id))
    }

    pub fn plan_clone(&self, id: MachineId) -> Result<ClonePlan> {
        let source = self.live_path(id)?;
        let name = self.unique_name(self.registry.machine(id)?.name());
        Ok(ClonePlan {
            anchor: id,
            destination: bundle_path(&self.settings.storage_root, &name),
            source,
            name,
        })
    }

    /// Insert a cloned machine right after its original and select it.
    pub fn finish_clone(&mut self, anchor: MachineId, machine: Machine) -> MachineId {
        let id = machine.id();
        let at = self.registry.position(anchor).map(|index| index + 1);
        self.registry.add(machine.into(), at);
        self.registry.select(Some(id));
        id
    }

    pub fn clone_machine(&mut self, id: MachineId) -> Result<MachineId> {
        let plan = self.plan_clone(id)?;
        let machine = perform_clone(&plan)?;
        Ok(self.finish_clone(plan.anchor, machine))
    }

    pub fn plan_export(&self, id: MachineId) -> Result<PathBuf> {
        self.live_path(id)
    }

    /// Replace `destination` with a copy of the bundle of `id`.
    pub fn export(&self, id: MachineId, destination: &Path) -> Result<()> {
        let source = self.plan_export(id)?;
        perform_export(&source, destination)
    }

    pub fn plan_move(&self, id: MachineId, destination: &Path) -> Result<MovePlan> {
        Ok(MovePlan {
            id,
            source: self.live_path(id)?,
            destination: destination.to_path_buf(),
        })
    }

    /// Swap the original entry for the shortcut at the same position, carrying the selection.
    pub fn finish_move(&mut self, plan: &MovePlan, shortcut: Machine) -> Result<MachineId> {
        let was_selected = self.registry.selected() == Some(plan.id);
        let index = self.finish_delete(plan.id);
        let new_id = shortcut.id();
        self.registry.add(shortcut.into(), index);
        if was_selected {
            self.registry.select(Some(new_id));
        }
        if !self.registry.persists_shortcuts() {
            return Err(Error::NotSupported {
                feature: "Persisting shortcuts",
                reason: format!(
                    "the moved machine at {} will not be listed after a restart",
                    plan.destination.display()
                ),
            });
        }
        Ok(new_id)
    }

    /// Move the bundle of `id` to `destination` and list it there as a shortcut.
    pub fn move_machine(&mut self, id: MachineId, destination: &Path) -> Result<MachineId> {
        let plan = self.plan_move(id, destination)?;
        let shortcut = perform_move(&plan)?;
        self.finish_move(&plan, shortcut)
    }

    /// Create a new machine from the configuration of `id`, without its drives.
    pub fn template(&mut self, id: MachineId) -> Result<MachineId> {
        let machine = self.registry.machine(id)?;
        let mut config = machine.config.clone();
        config.system_uuid = uuid::Uuid::new_v4().to_string();
        config.drives.clear();
        config.name = self.unique_name(&config.name);
        let session_id = self.new_session(config);
        self.create(session_id)
    }

    /// Decide how to bring the bundle at `path` into the library. Already-listed bundles are
    /// selected here, and placeholders for them are re-opened in place.
    pub fn plan_import(&mut self, path: &Path, as_shortcut: bool) -> Result<ImportPlan> {
        if let Some(entry) = self.registry.find_by_path(path) {
            let id = entry.id();
            let reopened = match entry {
                Entry::Placeholder(placeholder) => placeholder.reopen(),
                Entry::Live(_) => None,
            };
            let selected = match reopened {
                Some(machine) => {
                    let new_id = machine.id();
                    self.registry.replace(id, machine.into())?;
                    new_id
                }
                None => id,
            };
            self.registry.select(Some(selected));
            return Ok(ImportPlan::Listed(selected));
        }

        let file_name = path.file_name().ok_or_else(|| Error::InvalidBundle {
            path: path.to_path_buf(),
            reason: "path has no file name".to_string(),
        })?;
        let destination = self.settings.storage_root.join(file_name);
        let from_inbox = path
            .parent()
            .map(|parent| same_path(parent, &self.settings.inbox_root()))
            .unwrap_or(false);
        if from_inbox || !as_shortcut {
            self.ensure_name_free(path)?;
        }

        let plan = if from_inbox {
            ImportPlan::Move {
                source: path.to_path_buf(),
                destination,
            }
        } else if as_shortcut {
            ImportPlan::Shortcut {
                source: path.to_path_buf(),
            }
        } else {
            ImportPlan::Copy {
                source: path.to_path_buf(),
                destination,
            }
        };
        Ok(plan)
    }

    /// Refuse a bundle whose configured name is already listed, before any of it is copied.
    fn ensure_name_free(&self, bundle: &Path) -> Result<()> {
        // Unreadable bundles are reported by `perform_import`.
        let Ok(config) = MachineConfig::load(bundle) else {
            return Ok(());
        };
        if self.registry.has_name(&config.name) {
            return Err(Error::DuplicateName { name: config.name });
        }
        Ok(())
    }

    /// Register an imported machine at the end of the list and select it.
    pub fn finish_import(&mut self, machine: Machine) -> Result<MachineId> {
        if !machine.is_shortcut() && self.registry.has_name(machine.name()) {
            return Err(Error::DuplicateName {
                name: machine.name().to_string(),
            });
        }
        let id = machine.id();
        self.registry.add(machine.into(), None);
        self.registry.select(Some(id));
        Ok(id)
    }

    pub fn import_bundle(&mut self, path: &Path, as_shortcut: bool) -> Result<MachineId> {
        match self.plan_import(path, as_shortcut)? {
            ImportPlan::Listed(id) => Ok(id),
            plan => {
                let machine = perform_import(&plan)?;
                self.finish_import(machine).inspect_err(|_| undo_import(&plan))
            }
        }
    }

    /// Total bytes under the bundle of `id`.
    pub fn compute_size(&self, id: MachineId) -> Result<u64> {
        Ok(dir_size(&self.live_path(id)?))
    }
}

/// Move the session's staged images into `bundle` and write the machine there.
fn build_bundle(session: &mut EditSession, bundle: &Path, storage_root: &Path) -> Result<Machine> {
    fs::create_dir_all(bundle).map_err(|source| Error::io("create bundle", bundle, source))?;
    let images_dir = bundle.join(IMAGES_DIR);
    if session.images_dir().is_dir() {
        move_images(session.images_dir(), &images_dir)?;
    }
    session.relocate_images(images_dir);

    let mut machine = Machine::with_destination(session.draft.clone(), storage_root);
    machine.save()?;
    session.commit_removable(&mut machine);
    session.clear_unsaved();
    Ok(machine)
}

fn same_path(left: &Path, right: &Path) -> bool {
    match (fs::canonicalize(left), fs::canonicalize(right)) {
        (Ok(left), Ok(right)) => left == right,
        _ => left == right,
    }
}

/// Move the contents of a staging image directory into `destination`.
fn move_images(staging: &Path, destination: &Path) -> Result<()> {
    if fs::rename(staging, destination).is_ok() {
        return Ok(());
    }
    fs::create_dir_all(destination)
        .map_err(|source| Error::io("create image directory", destination, source))?;
    let entries =
        fs::read_dir(staging).map_err(|source| Error::io("read staging directory", staging, source))?;
    for entry in entries {
        let entry = entry.map_err(|source| Error::io("read staging directory", staging, source))?;
        move_file(&entry.path(), &destination.join(entry.file_name()))?;
    }
    Ok(())
}

/// Recursively copy `source` into `destination`, which must not exist yet.
pub fn copy_dir(source: &Path, destination: &Path) -> Result<()> {
    fs::create_dir(destination).map_err(|err| Error::io("create", destination, err))?;
    let entries = fs::read_dir(source).map_err(|err| Error::io("read", source, err))?;
    for entry in entries {
        let entry = entry.map_err(|err| Error::io("read", source, err))?;
        let from = entry.path();
        let to = destination.join(entry.file_name());
        if from.is_dir() {
            copy_dir(&from, &to)?;
        } else {
            fs::copy(&from, &to).map_err(|err| Error::io("copy", &from, err))?;
        }
    }
    Ok(())
}

/// Total size of every file under `path`; unreadable entries count as zero.
pub fn dir_size(path: &Path) -> u64 {
    let Ok(entries) = fs::read_dir(path) else {
        return fs::metadata(path).map(|meta| meta.len()).unwrap_or(0);
    };
    entries
        .filter_map(|entry| entry.ok())
        .map(|entry| {
            let path = entry.path();
            if path.is_dir() {
                dir_size(&path)
            } else {
                entry.metadata().map(|meta| meta.len()).unwrap_or(0)
            }
        })
        .sum()
}

fn remove_path(path: &Path) -> Result<()> {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    result.map_err(|source| Error::io("remove", path, source))
}

pub fn perform_delete(bundle: &Path) -> Result<()> {
    log::info!("deleting {}", bundle.display());
    remove_path(bundle)
}

/// Copy the source bundle and rename the copy; the partial copy is removed on failure.
pub fn perform_clone(plan: &ClonePlan) -> Result<Machine> {
    let result = copy_dir(&plan.source, &plan.destination).and_then(|()| {
        let mut machine = Machine::open(&plan.destination)?;
        machine.config.name = plan.name.clone();
        machine.save()?;
        Ok(machine)
    });
    if result.is_err() && plan.destination.exists() {
        if let Err(err) = fs::remove_dir_all(&plan.destination) {
            log::warn!(
                "failed to remove partial clone {}: {err}",
                plan.destination.display()
            );
        }
    }
    result
}

pub fn perform_export(source: &Path, destination: &Path) -> Result<()> {
    if destination.exists() {
        remove_path(destination)?;
    }
    copy_dir(source, destination)
}

/// Export to the destination, open it as a shortcut, then delete the original bundle.
pub fn perform_move(plan: &MovePlan) -> Result<Machine> {
    perform_export(&plan.source, &plan.destination)?;
    let shortcut = Machine::open_shortcut(&plan.destination)?;
    perform_delete(&plan.source)?;
    Ok(shortcut)
}

pub fn perform_import(plan: &ImportPlan) -> Result<Machine> {
    match plan {
        ImportPlan::Listed(id) => Err(Error::MachineNotFound { id: id.get() }),
        ImportPlan::Shortcut { source } => Machine::open_shortcut(source),
        ImportPlan::Move {
            source,
            destination,
        }
        | ImportPlan::Copy {
            source,
            destination,
        } => {
            Machine::open(source)?;
            if destination.exists() {
                let name = destination
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().into_owned())
                    .unwrap_or_default();
                return Err(Error::DuplicateName { name });
            }
            if matches!(plan, ImportPlan::Move { .. }) {
                log::info!("moving {} out of the inbox", source.display());
                if fs::rename(source, destination).is_err() {
                    copy_into_storage(source, destination)?;
                    remove_path(source)?;
                }
            } else {
                copy_into_storage(source, destination)?;
            }
            Machine::open(destination).inspect_err(|_| undo_import(plan))
        }
    }
}

fn copy_into_storage(source: &Path, destination: &Path) -> Result<()> {
    copy_dir(source, destination).inspect_err(|_| discard_partial(destination))
}

/// Reverse the file work of an import whose machine was not registered. Copies are deleted and
/// moved bundles go back to the inbox.
pub fn undo_import(plan: &ImportPlan) {
    let result = match plan {
        ImportPlan::Copy { destination, .. } => remove_path(destination),
        ImportPlan::Move {
            source,
            destination,
        } => match fs::rename(destination, source) {
            Ok(()) => Ok(()),
            Err(_) => copy_dir(destination, source).and_then(|()| remove_path(destination)),
        },
        ImportPlan::Listed(_) | ImportPlan::Shortcut { .. } => Ok(()),
    };
    if let Err(err) = result {
        log::warn!("failed to undo import: {err}");
    }
}
