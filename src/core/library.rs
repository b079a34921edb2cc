//! The library: a writer thread that owns all mutable state, and the worker-facing handle.
//!
//! Every mutation of the registry or of an edit session runs as a command on the writer thread.
//! Long operations run on task threads and hop onto the writer through
//! [`LibraryContext::with_state`] for each mutation.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use async_channel::{Receiver, Sender};
use time::OffsetDateTime;

use crate::config::LibrarySettings;
use crate::core::backend::{ImageBackend, backend_for};
use crate::core::coordinator::{self, ImportPlan};
use crate::core::drives::{self, DriveSpec, ImportRequest};
use crate::core::events::{EVENT_CAPACITY, Event, EventSink};
use crate::core::machine::{DriveImage, Entry, MachineConfig, MachineId, image_path};
use crate::core::record::ListStore;
use crate::core::registry::{Registry, plan_refresh};
use crate::core::session::{EditSession, SessionId};
use crate::core::tasks::{Alert, StatusBoard, TaskHandle, spawn_busy};
use crate::downloads::{HttpTransport, PendingId, Transport};
use crate::error::{Error, Result};

type Command = Box<dyn FnOnce(&mut LibraryState) + Send>;

/// State owned by the writer thread.
pub struct LibraryState {
    pub(crate) settings: LibrarySettings,
    pub(crate) registry: Registry,
    pub(crate) sessions: BTreeMap<SessionId, EditSession>,
    pub(crate) backend: Arc<dyn ImageBackend>,
}

impl LibraryState {
    /// State for `settings`, with the machine list restored from the preferences file.
    pub fn new(settings: LibrarySettings, backend: Arc<dyn ImageBackend>, events: EventSink) -> Self {
        let registry = Registry::restore(
            ListStore::new(&settings.preferences_path),
            &settings.storage_root,
            settings.persist_shortcuts,
            events,
        );
        Self {
            settings,
            registry,
            sessions: BTreeMap::new(),
            backend,
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests(settings: LibrarySettings) -> Self {
        Self::new(
            settings,
            Arc::new(crate::core::backend::Unavailable),
            EventSink::disabled(),
        )
    }

    pub fn settings(&self) -> &LibrarySettings {
        &self.settings
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    pub fn backend(&self) -> &dyn ImageBackend {
        self.backend.as_ref()
    }

    /// First listed machine called `name`.
    pub fn machine_id(&self, name: &str) -> Result<MachineId> {
        self.registry
            .entries()
            .iter()
            .find(|entry| entry.name() == name)
            .map(Entry::id)
            .ok_or_else(|| Error::UnknownMachine {
                name: name.to_string(),
            })
    }

    /// Backing file of the drive `drive` on machine `id`.
    pub fn drive_path(&self, id: MachineId, drive: &str) -> Result<PathBuf> {
        let machine = self.registry.machine(id)?;
        let image = machine
            .config
            .drive_by_name(drive)
            .ok_or_else(|| Error::DriveNotFound {
                name: drive.to_string(),
            })?;
        let file = image.path.as_deref().ok_or_else(|| Error::NotSupported {
            feature: "Image operations on removable drives",
            reason: format!("drive `{drive}` has no backing file"),
        })?;
        let images_dir = machine.images_dir().ok_or_else(|| Error::StaleMachine {
            path: None,
            message: format!("machine `{}` has never been saved", machine.name()),
        })?;
        image_path(&images_dir, file)
    }

    pub fn snapshot(&self) -> LibrarySnapshot {
        LibrarySnapshot {
            entries: self.registry.entries().iter().map(EntrySummary::from).collect(),
            pending: self
                .registry
                .pending()
                .iter()
                .map(|pending| PendingSummary {
                    id: pending.id(),
                    name: pending.name().to_string(),
                    url: pending.url().to_string(),
                    started: pending.started(),
                })
                .collect(),
            selected: self.registry.selected(),
            generation: self.registry.generation(),
            busy: false,
            alert: None,
        }
    }
}

/// Read-only view of one list entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntrySummary {
    pub id: MachineId,
    pub name: String,
    pub path: Option<PathBuf>,
    pub shortcut: bool,
    pub placeholder: bool,
    pub architecture: Option<String>,
    pub drives: Vec<DriveImage>,
}

impl From<&Entry> for EntrySummary {
    fn from(entry: &Entry) -> Self {
        let machine = entry.as_machine();
        Self {
            id: entry.id(),
            name: entry.name().to_string(),
            path: entry.backing_path().map(Path::to_path_buf),
            shortcut: entry.is_shortcut(),
            placeholder: entry.is_placeholder(),
            architecture: machine.and_then(|machine| machine.config.architecture.clone()),
            drives: machine
                .map(|machine| machine.config.drives.clone())
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSummary {
    pub id: PendingId,
    pub name: String,
    pub url: String,
    pub started: OffsetDateTime,
}

/// Point-in-time copy of everything an observer can see.
#[derive(Debug, Clone)]
pub struct LibrarySnapshot {
    pub entries: Vec<EntrySummary>,
    pub pending: Vec<PendingSummary>,
    pub selected: Option<MachineId>,
    pub generation: u64,
    pub busy: bool,
    pub alert: Option<Alert>,
}

/// Handle used by worker threads to run closures on the writer thread.
#[derive(Clone)]
pub struct LibraryContext {
    commands: Sender<Command>,
    writer: ThreadId,
}

impl LibraryContext {
    /// Run `op` against the library state on the writer thread and wait for its result.
    ///
    /// Must not be called from the writer thread itself.
    pub fn with_state<R, F>(&self, op: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut LibraryState) -> R + Send + 'static,
    {
        if thread::current().id() == self.writer {
            return Err(Error::NotSupported {
                feature: "Nested library access",
                reason: "the writer thread cannot wait on itself".to_string(),
            });
        }
        let (reply, response) = async_channel::bounded(1);
        let command: Command = Box::new(move |state| {
            if reply.send_blocking(op(state)).is_err() {
                log::debug!("library caller left before its reply arrived");
            }
        });
        self.commands
            .send_blocking(command)
            .map_err(|_| Error::LibraryClosed)?;
        response.recv_blocking().map_err(|_| Error::LibraryClosed)
    }

    /// Like [`LibraryContext::with_state`] for closures that already return a `Result`.
    pub fn try_with_state<R, F>(&self, op: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut LibraryState) -> Result<R> + Send + 'static,
    {
        self.with_state(op)?
    }
}

/// Everything a task thread needs.
#[derive(Clone)]
pub(crate) struct Worker {
    pub(crate) context: LibraryContext,
    pub(crate) backend: Arc<dyn ImageBackend>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) settings: LibrarySettings,
}

/// Managed collection of virtual machines.
pub struct Library {
    worker: Worker,
    status: Arc<StatusBoard>,
    events: Receiver<Event>,
    writer: Option<JoinHandle<()>>,
}

impl Library {
    /// Open the library described by `settings`, using `qemu-img` and HTTP downloads.
    pub fn open(settings: LibrarySettings) -> Result<Self> {
        let backend: Arc<dyn ImageBackend> = Arc::from(backend_for(settings.qemu_img.as_deref()));
        Self::with_collaborators(settings, backend, Arc::new(HttpTransport::new()))
    }

    pub fn with_collaborators(
        settings: LibrarySettings,
        backend: Arc<dyn ImageBackend>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        fs::create_dir_all(&settings.storage_root)
            .map_err(|source| Error::io("create storage directory", &settings.storage_root, source))?;
        for warning in &settings.warnings {
            log::warn!("{warning}");
        }

        let (sink, events) = EventSink::channel(EVENT_CAPACITY);
        let state = LibraryState::new(settings.clone(), Arc::clone(&backend), sink.clone());
        let (commands, inbox) = async_channel::unbounded::<Command>();
        let writer = thread::Builder::new()
            .name("vmshelf-writer".to_string())
            .spawn(move || {
                let mut state = state;
                while let Ok(command) = inbox.recv_blocking() {
                    command(&mut state);
                }
                log::debug!("library writer stopped");
            })
            .map_err(|source| Error::io("start writer for", &settings.storage_root, source))?;

        let context = LibraryContext {
            commands,
            writer: writer.thread().id(),
        };
        Ok(Self {
            worker: Worker {
                context,
                backend,
                transport,
                settings,
            },
            status: Arc::new(StatusBoard::new(sink)),
            events,
            writer: Some(writer),
        })
    }

    pub fn context(&self) -> LibraryContext {
        self.worker.context.clone()
    }

    pub fn settings(&self) -> &LibrarySettings {
        &self.worker.settings
    }

    pub fn status(&self) -> &Arc<StatusBoard> {
        &self.status
    }

    /// Stream of state changes. Events are dropped while the channel is full.
    pub fn events(&self) -> Receiver<Event> {
        self.events.clone()
    }

    /// Run `op` on a task thread with the busy indicator set.
    pub(crate) fn spawn<T, F>(&self, label: impl Into<String>, op: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(Worker) -> Result<T> + Send + 'static,
    {
        let worker = self.worker.clone();
        spawn_busy(&self.status, label, move || op(worker))
    }

    pub fn snapshot(&self) -> Result<LibrarySnapshot> {
        let mut snapshot = self.worker.context.with_state(|state| state.snapshot())?;
        snapshot.busy = self.status.is_busy();
        snapshot.alert = self.status.alert();
        Ok(snapshot)
    }

    pub fn machine_id(&self, name: &str) -> Result<MachineId> {
        let name = name.to_string();
        self.worker
            .context
            .try_with_state(move |state| state.machine_id(&name))
    }

    pub fn select(&self, id: Option<MachineId>) -> Result<()> {
        self.worker
            .context
            .with_state(move |state| state.registry.select(id))
    }

    pub fn move_entries(&self, from: Vec<usize>, to: usize) -> Result<()> {
        self.worker
            .context
            .with_state(move |state| state.registry.move_entries(&from, to))
    }

    /// Reconcile the list with the storage directory. The scan runs on the task thread.
    pub fn refresh(&self) -> TaskHandle<bool> {
        self.spawn("refresh", |worker| {
            let (entries, generation, root) = worker.context.with_state(|state| {
                (
                    state.registry.entries().to_vec(),
                    state.registry.generation(),
                    state.registry.storage_root().to_path_buf(),
                )
            })?;
            let plan = plan_refresh(&entries, &root);
            worker.context.with_state(move |state| {
                if state.registry.generation() == generation {
                    state.registry.replace_all(plan)
                } else {
                    log::debug!("list changed during refresh; rescanning on the writer");
                    state.registry.refresh()
                }
            })
        })
    }

    pub fn open_session(&self, id: MachineId) -> Result<SessionId> {
        self.worker
            .context
            .try_with_state(move |state| state.open_session(id))
    }

    pub fn new_session(&self, draft: MachineConfig) -> Result<SessionId> {
        self.worker
            .context
            .with_state(move |state| state.new_session(draft))
    }

    /// Draft configuration of an open session.
    pub fn draft(&self, session: SessionId) -> Result<MachineConfig> {
        self.worker
            .context
            .try_with_state(move |state| Ok(state.session(session)?.draft.clone()))
    }

    fn session_images_dir(worker: &Worker, session: SessionId) -> Result<PathBuf> {
        worker
            .context
            .try_with_state(move |state| Ok(state.session(session)?.images_dir().to_path_buf()))
    }

    fn adopt(worker: &Worker, session: SessionId, staged: drives::StagedDrive) -> Result<String> {
        worker.context.try_with_state(move |state| match state.session_mut(session) {
            Ok(edit) => edit.adopt(staged),
            Err(err) => {
                staged.abandon();
                Err(err)
            }
        })
    }

    /// Stage `request` into the session. Conversion is skipped when the settings disable it.
    pub fn import_drive(&self, session: SessionId, mut request: ImportRequest) -> TaskHandle<String> {
        request.raw |= !self.worker.settings.convert_images;
        self.spawn("import drive", move |worker| {
            let images_dir = Self::session_images_dir(&worker, session)?;
            let staged = drives::stage_import(&request, &images_dir, worker.backend.as_ref())?;
            Self::adopt(&worker, session, staged)
        })
    }

    pub fn create_drive(
        &self,
        session: SessionId,
        spec: DriveSpec,
        removable_source: Option<PathBuf>,
    ) -> TaskHandle<String> {
        self.spawn("create drive", move |worker| {
            let images_dir = Self::session_images_dir(&worker, session)?;
            let staged = drives::stage_create(
                &spec,
                &images_dir,
                removable_source.as_deref(),
                worker.backend.as_ref(),
            )?;
            Self::adopt(&worker, session, staged)
        })
    }

    pub fn remove_drive(&self, session: SessionId, index: usize) -> Result<DriveImage> {
        self.worker
            .context
            .try_with_state(move |state| state.session_mut(session)?.remove_drive(index))
    }

    fn resolve_drive(worker: &Worker, id: MachineId, drive: String) -> Result<PathBuf> {
        worker
            .context
            .try_with_state(move |state| state.drive_path(id, &drive))
    }

    pub fn resize_drive(&self, id: MachineId, drive: String, size_mib: u64) -> TaskHandle<()> {
        self.spawn("resize drive", move |worker| {
            let path = Self::resolve_drive(&worker, id, drive)?;
            drives::resize_drive(worker.backend.as_ref(), &path, size_mib)
        })
    }

    pub fn reclaim_space(&self, id: MachineId, drive: String, compress: bool) -> TaskHandle<()> {
        self.spawn("reclaim space", move |worker| {
            let path = Self::resolve_drive(&worker, id, drive)?;
            drives::reclaim_space(worker.backend.as_ref(), &path, compress)
        })
    }

    /// Virtual and on-disk size of a drive, in bytes.
    pub fn drive_size(&self, id: MachineId, drive: String) -> TaskHandle<(u64, u64)> {
        self.spawn("drive size", move |worker| {
            let path = Self::resolve_drive(&worker, id, drive)?;
            let virtual_size = drives::drive_size(worker.backend.as_ref(), &path);
            Ok((virtual_size, drives::file_size(&path)?))
        })
    }

    pub fn save(&self, session: SessionId) -> TaskHandle<()> {
        self.spawn("save", move |worker| {
            worker.context.try_with_state(move |state| state.save(session))
        })
    }

    pub fn discard(&self, session: SessionId) -> TaskHandle<()> {
        self.spawn("discard", move |worker| {
            worker
                .context
                .try_with_state(move |state| state.discard(session))
        })
    }

    pub fn create(&self, session: SessionId) -> TaskHandle<MachineId> {
        self.spawn("create", move |worker| {
            worker
                .context
                .try_with_state(move |state| state.create(session))
        })
    }

    pub fn delete(&self, id: MachineId) -> TaskHandle<Option<usize>> {
        self.spawn("delete", move |worker| {
            let bundle = worker
                .context
                .try_with_state(move |state| state.plan_delete(id))?;
            if let Some(bundle) = bundle {
                coordinator::perform_delete(&bundle)?;
            }
            worker
                .context
                .with_state(move |state| state.finish_delete(id))
        })
    }

    pub fn forget(&self, id: MachineId) -> Result<Option<usize>> {
        self.worker
            .context
            .try_with_state(move |state| state.forget(id))
    }

    pub fn clone_machine(&self, id: MachineId) -> TaskHandle<MachineId> {
        self.spawn("clone", move |worker| {
            let plan = worker
                .context
                .try_with_state(move |state| state.plan_clone(id))?;
            let machine = coordinator::perform_clone(&plan)?;
            worker
                .context
                .with_state(move |state| state.finish_clone(plan.anchor, machine))
        })
    }

    pub fn export(&self, id: MachineId, destination: PathBuf) -> TaskHandle<()> {
        self.spawn("export", move |worker| {
            let source = worker
                .context
                .try_with_state(move |state| state.plan_export(id))?;
            coordinator::perform_export(&source, &destination)
        })
    }

    pub fn move_machine(&self, id: MachineId, destination: PathBuf) -> TaskHandle<MachineId> {
        self.spawn("move", move |worker| {
            let plan = worker
                .context
                .try_with_state(move |state| state.plan_move(id, &destination))?;
            let shortcut = coordinator::perform_move(&plan)?;
            worker
                .context
                .try_with_state(move |state| state.finish_move(&plan, shortcut))
        })
    }

    pub fn template(&self, id: MachineId) -> TaskHandle<MachineId> {
        self.spawn("template", move |worker| {
            worker
                .context
                .try_with_state(move |state| state.template(id))
        })
    }

    pub fn import_bundle(&self, path: PathBuf, as_shortcut: bool) -> TaskHandle<MachineId> {
        self.spawn("import", move |worker| {
            let plan = worker
                .context
                .try_with_state(move |state| state.plan_import(&path, as_shortcut))?;
            if let ImportPlan::Listed(id) = plan {
                return Ok(id);
            }
            let machine = coordinator::perform_import(&plan)?;
            worker
                .context
                .try_with_state(move |state| state.finish_import(machine))
                .inspect_err(|_| coordinator::undo_import(&plan))
        })
    }

    pub fn compute_size(&self, id: MachineId) -> TaskHandle<u64> {
        self.spawn("compute size", move |worker| {
            let bundle = worker
                .context
                .try_with_state(move |state| state.plan_export(id))?;
            Ok(coordinator::dir_size(&bundle))
        })
    }
}

impl Drop for Library {
    fn drop(&mut self) {
        self.worker.context.commands.close();
        if let Some(writer) = self.writer.take() {
            if writer.join().is_err() {
                log::error!("library writer panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn library(root: &Path) -> Library {
        let settings = LibrarySettings::with_storage_root(root);
        Library::with_collaborators(
            settings,
            Arc::new(crate::core::backend::Unavailable),
            Arc::new(HttpTransport::new()),
        )
        .unwrap()
    }

    #[test]
    fn with_state_runs_on_the_writer_thread() {
        let dir = tempdir().unwrap();
        let library = library(dir.path());
        let writer = library
            .context()
            .with_state(|_| thread::current().name().map(str::to_string))
            .unwrap();
        assert_eq!(writer.as_deref(), Some("vmshelf-writer"));
    }

    #[test]
    fn nested_access_from_writer_is_refused() {
        let dir = tempdir().unwrap();
        let library = library(dir.path());
        let context = library.context();
        let nested = library
            .context()
            .with_state(move |_| context.with_state(|_| ()).is_err())
            .unwrap();
        assert!(nested);
    }

    #[test]
    fn closed_library_reports_closed() {
        let dir = tempdir().unwrap();
        let library = library(dir.path());
        let context = library.context();
        drop(library);
        assert!(matches!(
            context.with_state(|_| ()),
            Err(Error::LibraryClosed)
        ));
    }

    #[test]
    fn unknown_sessions_surface_as_alerts() {
        let dir = tempdir().unwrap();
        let library = library(dir.path());
        let session = library.new_session(MachineConfig::new("Gone")).unwrap();
        library.discard(session).wait().unwrap();

        let err = library.save(session).wait().unwrap_err();
        assert!(matches!(err, Error::SessionNotFound { .. }));
        let alert = library.snapshot().unwrap().alert.unwrap();
        assert_eq!(alert.task, "save");
    }
}
