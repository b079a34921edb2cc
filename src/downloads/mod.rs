//! Background downloads that end in a new machine.
//!
//! A download shows up in the pending list for its whole lifetime and is removed from it once it
//! finishes, whatever the outcome.

use std::fmt::Debug;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use ureq::Agent;
use zip::ZipArchive;

use crate::core::coordinator::copy_dir;
use crate::core::drives::{ImportRequest, discard_partial, stage_import};
use crate::core::library::{Library, LibraryContext, Worker};
use crate::core::machine::{self, ImageType, Machine, MachineConfig, MachineId, default_interface};
use crate::core::naming::unique_token;
use crate::core::session::SessionId;
use crate::core::tasks::TaskHandle;
use crate::error::{Error, Result};

static NEXT_PENDING_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PendingId(u64);

impl PendingId {
    fn next() -> Self {
        Self(NEXT_PENDING_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for PendingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cooperative cancellation flag checked by transports between chunks.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A machine that is still being downloaded.
#[derive(Debug, Clone)]
pub struct PendingMachine {
    id: PendingId,
    name: String,
    url: String,
    started: OffsetDateTime,
    cancel: CancelToken,
}

impl PendingMachine {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: PendingId::next(),
            name: name.into(),
            url: url.into(),
            started: OffsetDateTime::now_utc(),
            cancel: CancelToken::default(),
        }
    }

    pub fn id(&self) -> PendingId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn started(&self) -> OffsetDateTime {
        self.started
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Fetches a URL into a local file.
pub trait Transport: Send + Sync + Debug {
    /// Download `url` into `destination`, resuming from its current length when possible.
    /// Returns the final file length.
    fn fetch(&self, url: &str, destination: &Path, cancel: &CancelToken) -> Result<u64>;
}

/// HTTP(S) transport with `Range` resume.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    agent: Agent,
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpTransport {
    pub fn new() -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(30))
            .build();
        Self { agent }
    }
}

fn download_error(url: &str, message: impl Into<String>) -> Error {
    Error::DownloadFailed {
        url: url.to_string(),
        message: message.into(),
    }
}

impl Transport for HttpTransport {
    fn fetch(&self, url: &str, destination: &Path, cancel: &CancelToken) -> Result<u64> {
        let mut start = fs::metadata(destination)
            .map(|meta| meta.len())
            .unwrap_or(0);

        let mut request = self.agent.get(url);
        if start > 0 {
            request = request.set("Range", &format!("bytes={start}-"));
        }
        log::info!("downloading {url} (resume offset {start})");

        let response = request
            .call()
            .map_err(|err| download_error(url, err.to_string()))?;
        if start > 0 && response.status() == 200 {
            // Range ignored by the server.
            start = 0;
        }

        let mut file = if start > 0 {
            OpenOptions::new().append(true).open(destination)
        } else {
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(destination)
        }
        .map_err(|source| Error::io("open download", destination, source))?;

        let mut reader = response.into_reader();
        let mut buffer = [0u8; 8192];
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled {
                    url: url.to_string(),
                });
            }
            let bytes = reader
                .read(&mut buffer)
                .map_err(|err| download_error(url, format!("read failed: {err}")))?;
            if bytes == 0 {
                break;
            }
            file.write_all(&buffer[..bytes])
                .map_err(|source| Error::io("write download", destination, source))?;
        }

        Ok(fs::metadata(destination)
            .map(|meta| meta.len())
            .unwrap_or_default())
    }
}

pub fn compute_sha256(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|source| Error::io("open", path, source))?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let bytes = file
            .read(&mut buffer)
            .map_err(|source| Error::io("hash", path, source))?;
        if bytes == 0 {
            break;
        }
        hasher.update(&buffer[..bytes]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn verify_checksum(url: &str, path: &Path, expected: &str) -> Result<()> {
    let actual = compute_sha256(path)?;
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(download_error(
            url,
            format!("hash mismatch: expected {expected}, found {actual}"),
        ))
    }
}

fn is_safe_relative(path: &Path) -> bool {
    path.components()
        .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
}

/// Extract `archive` into `destination` and return the first machine bundle found at its top
/// level or one directory below.
pub fn extract_bundle(archive: &Path, destination: &Path) -> Result<PathBuf> {
    let file = File::open(archive).map_err(|source| Error::io("open", archive, source))?;
    let invalid = |message: String| Error::InvalidBundle {
        path: archive.to_path_buf(),
        reason: message,
    };
    let mut zip = ZipArchive::new(file).map_err(|err| invalid(err.to_string()))?;
    fs::create_dir_all(destination).map_err(|source| Error::io("create", destination, source))?;

    for index in 0..zip.len() {
        let mut entry = zip.by_index(index).map_err(|err| invalid(err.to_string()))?;
        let Some(relative) = entry.enclosed_name().filter(|path| is_safe_relative(path)) else {
            log::warn!("skipping unsafe archive entry `{}`", entry.name());
            continue;
        };
        let out_path = destination.join(relative);
        if entry.is_dir() {
            fs::create_dir_all(&out_path)
                .map_err(|source| Error::io("create", &out_path, source))?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent).map_err(|source| Error::io("create", parent, source))?;
        }
        let mut output =
            File::create(&out_path).map_err(|source| Error::io("create", &out_path, source))?;
        io::copy(&mut entry, &mut output)
            .map_err(|source| Error::io("extract", &out_path, source))?;
    }

    find_bundle(destination).ok_or_else(|| invalid("archive contains no machine bundle".into()))
}

fn find_bundle(root: &Path) -> Option<PathBuf> {
    let mut level: Vec<PathBuf> = sorted_dirs(root);
    for _ in 0..2 {
        if let Some(found) = level.iter().find(|path| machine::is_bundle(path)) {
            return Some(found.clone());
        }
        level = level.iter().flat_map(|dir| sorted_dirs(dir)).collect();
    }
    None
}

fn sorted_dirs(root: &Path) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = fs::read_dir(root)
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|path| path.is_dir())
                .filter(|path| {
                    !path
                        .file_name()
                        .map(|name| name.to_string_lossy().starts_with("__MACOSX"))
                        .unwrap_or(false)
                })
                .collect()
        })
        .unwrap_or_default();
    dirs.sort();
    dirs
}

/// A zipped machine bundle to download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZipDownload {
    pub url: String,
    /// Expected SHA-256 of the archive, hex encoded.
    pub sha256: Option<String>,
}

impl ZipDownload {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            sha256: None,
        }
    }

    fn display_name(&self) -> String {
        display_name(&self.url)
    }
}

/// A disk image to download and wrap in a new machine built from `config`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDownloadRequest {
    pub config: MachineConfig,
    pub url: String,
    pub sha256: Option<String>,
    pub image_type: Option<ImageType>,
}

fn display_name(url: &str) -> String {
    url.rsplit('/')
        .find(|segment| !segment.is_empty())
        .map(|segment| segment.split(['?', '#']).next().unwrap_or(segment))
        .filter(|segment| !segment.is_empty())
        .unwrap_or(url)
        .to_string()
}

/// Scratch files of one download, removed when dropped.
struct Scratch {
    root: PathBuf,
}

impl Scratch {
    fn new(downloads_root: &Path) -> Result<Self> {
        let root = downloads_root.join(unique_token());
        fs::create_dir_all(&root).map_err(|source| Error::io("create", &root, source))?;
        Ok(Self { root })
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_dir_all(&self.root) {
            if err.kind() != io::ErrorKind::NotFound {
                log::warn!("failed to remove download scratch {}: {err}", self.root.display());
            }
        }
    }
}

fn fetch_verified(
    worker: &Worker,
    url: &str,
    destination: &Path,
    sha256: Option<&str>,
    cancel: &CancelToken,
) -> Result<()> {
    let bytes = worker.transport.fetch(url, destination, cancel)?;
    if cancel.is_cancelled() {
        return Err(Error::Cancelled {
            url: url.to_string(),
        });
    }
    log::info!("downloaded {bytes} bytes from {url}");
    if let Some(expected) = sha256 {
        verify_checksum(url, destination, expected)?;
    }
    Ok(())
}

fn download_zip(worker: &Worker, download: &ZipDownload, cancel: &CancelToken) -> Result<MachineId> {
    let scratch = Scratch::new(&worker.settings.downloads_root())?;
    let archive = scratch.path("download.zip");
    fetch_verified(
        worker,
        &download.url,
        &archive,
        download.sha256.as_deref(),
        cancel,
    )?;

    let extracted = extract_bundle(&archive, &scratch.path("extracted"))?;
    let downloaded = Machine::open(&extracted)?;
    let base = downloaded.name().to_string();
    let (name, destination) = worker.context.with_state(move |state| {
        let name = state.unique_name(&base);
        let destination = machine::bundle_path(&state.settings().storage_root, &name);
        (name, destination)
    })?;

    if destination.exists() {
        return Err(Error::DuplicateName { name });
    }
    let registered = move_bundle(&extracted, &destination)
        .and_then(|()| Machine::open(&destination))
        .and_then(|mut machine| {
            if machine.name() != name {
                machine.config.name = name;
                machine.save()?;
            }
            worker
                .context
                .try_with_state(move |state| state.finish_import(machine))
        });
    if registered.is_err() {
        discard_partial(&destination);
    }
    registered
}

fn move_bundle(source: &Path, destination: &Path) -> Result<()> {
    if fs::rename(source, destination).is_ok() {
        return Ok(());
    }
    copy_dir(source, destination)
}

fn discard_session(worker: &Worker, session: SessionId) {
    if let Err(err) = worker
        .context
        .try_with_state(move |state| state.discard(session))
    {
        log::warn!("failed to discard download session {session}: {err}");
    }
}

fn download_image(
    worker: &Worker,
    request: ImageDownloadRequest,
    cancel: &CancelToken,
) -> Result<MachineId> {
    let scratch = Scratch::new(&worker.settings.downloads_root())?;
    let file_name = display_name(&request.url);
    let image = scratch.path(&file_name);
    fetch_verified(
        worker,
        &request.url,
        &image,
        request.sha256.as_deref(),
        cancel,
    )?;

    let image_type = request
        .image_type
        .unwrap_or_else(|| ImageType::for_file(&image));
    let import = ImportRequest {
        interface: default_interface(request.config.architecture.as_deref(), image_type)
            .to_string(),
        source: image,
        image_type,
        raw: true,
        copy: false,
    };

    let config = request.config;
    let (session, images_dir) = worker.context.try_with_state(move |state| {
        let session = state.new_session(config);
        Ok((session, state.session(session)?.images_dir().to_path_buf()))
    })?;

    let staged = match stage_import(&import, &images_dir, worker.backend.as_ref()) {
        Ok(staged) => staged,
        Err(err) => {
            discard_session(worker, session);
            return Err(err);
        }
    };
    worker.context.try_with_state(move |state| {
        if let Err(err) = state.session_mut(session).and_then(|edit| edit.adopt(staged)) {
            if let Err(discard_err) = state.discard(session) {
                log::warn!("failed to discard download session {session}: {discard_err}");
            }
            return Err(err);
        }
        state.create(session)
    })
}

/// Drops a download's pending entry once its task ends, whether it returns or unwinds.
struct PendingGuard {
    context: LibraryContext,
    id: PendingId,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let id = self.id;
        if let Err(err) = self
            .context
            .with_state(move |state| state.registry_mut().remove_pending(id))
        {
            log::warn!("failed to clear pending download {id}: {err}");
        }
    }
}

impl Library {
    fn track_download<F>(&self, pending: PendingMachine, label: &str, op: F) -> Result<(PendingId, TaskHandle<MachineId>)>
    where
        F: FnOnce(&Worker, &CancelToken) -> Result<MachineId> + Send + 'static,
    {
        let id = pending.id();
        let cancel = pending.cancel_token();
        self.context()
            .with_state(move |state| state.registry_mut().add_pending(pending))?;

        let handle = self.spawn(label.to_string(), move |worker| {
            let _pending = PendingGuard {
                context: worker.context.clone(),
                id,
            };
            op(&worker, &cancel)
        });
        Ok((id, handle))
    }

    /// Download a zipped bundle and register the machine inside it.
    pub fn start_zip_download(
        &self,
        download: ZipDownload,
    ) -> Result<(PendingId, TaskHandle<MachineId>)> {
        let pending = PendingMachine::new(download.display_name(), download.url.clone());
        self.track_download(pending, "download", move |worker, cancel| {
            download_zip(worker, &download, cancel)
        })
    }

    /// Download a disk image and create a machine from `request.config` around it.
    ///
    /// Names already taken are rejected before anything is downloaded.
    pub fn start_image_download(
        &self,
        request: ImageDownloadRequest,
    ) -> Result<(PendingId, TaskHandle<MachineId>)> {
        let name = request.config.name.clone();
        let taken = self.context().with_state(move |state| {
            state.registry().has_name(&name)
                || machine::bundle_path(&state.settings().storage_root, &name).exists()
        })?;
        if taken {
            let err = Error::DuplicateName {
                name: request.config.name.clone(),
            };
            self.status().report("download", &err);
            return Err(err);
        }

        let pending = PendingMachine::new(request.config.name.clone(), request.url.clone());
        self.track_download(pending, "download", move |worker, cancel| {
            download_image(worker, request, cancel)
        })
    }

    /// Ask a pending download to stop. Cleanup runs on the download's own task.
    pub fn cancel_download(&self, id: PendingId) -> Result<()> {
        self.context().try_with_state(move |state| {
            let pending = state
                .registry()
                .pending_by_id(id)
                .ok_or(Error::PendingNotFound { id: id.get() })?;
            log::info!("cancelling download of {}", pending.url());
            pending.cancel();
            Ok(())
        })
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{FakeTransport, zipped_bundle};
    use super::*;
    use crate::config::LibrarySettings;
    use tempfile::tempdir;

    #[test]
    fn pending_entry_is_listed_while_the_fetch_runs() {
        let dir = tempdir().unwrap();
        let url = "https://mirror.test/Held.zip";
        let (release, gate) = std::sync::mpsc::channel();
        let transport = FakeTransport::serving(url, zipped_bundle("Held"));
        *transport.gate.lock().unwrap() = Some(gate);
        let library = Library::with_collaborators(
            LibrarySettings::with_storage_root(dir.path()),
            Arc::new(crate::core::backend::Unavailable),
            Arc::new(transport),
        )
        .unwrap();

        let (id, handle) = library.start_zip_download(ZipDownload::new(url)).unwrap();
        let pending = library.snapshot().unwrap().pending;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);
        assert_eq!(pending[0].name, "Held.zip");
        assert!(library.status().is_busy());

        release.send(()).unwrap();
        handle.wait().unwrap();
        let snapshot = library.snapshot().unwrap();
        assert!(snapshot.pending.is_empty());
        assert_eq!(snapshot.entries[0].name, "Held");
    }

    #[test]
    fn panicking_transfer_clears_its_pending_entry_and_alerts() {
        #[derive(Debug)]
        struct Crashing;

        impl Transport for Crashing {
            fn fetch(&self, _url: &str, _destination: &Path, _cancel: &CancelToken) -> Result<u64> {
                panic!("transport crashed");
            }
        }

        let dir = tempdir().unwrap();
        let library = Library::with_collaborators(
            LibrarySettings::with_storage_root(dir.path()),
            Arc::new(crate::core::backend::Unavailable),
            Arc::new(Crashing),
        )
        .unwrap();

        let (_, handle) = library
            .start_zip_download(ZipDownload::new("https://mirror.test/Crash.zip"))
            .unwrap();
        assert!(matches!(handle.wait(), Err(Error::TaskPanicked { .. })));

        let snapshot = library.snapshot().unwrap();
        assert!(snapshot.pending.is_empty());
        assert!(!snapshot.busy);
        assert_eq!(snapshot.alert.unwrap().task, "download");
    }

    #[test]
    fn display_names_come_from_the_last_segment() {
        assert_eq!(display_name("https://host/vms/debian.zip?sig=1"), "debian.zip");
        assert_eq!(display_name("https://host/vms/"), "vms");
    }

    #[test]
    fn cancel_token_is_shared_by_clones() {
        let pending = PendingMachine::new("vm", "https://host/vm.zip");
        let token = pending.cancel_token();
        pending.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn sha256_matches_known_digest() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data");
        fs::write(&path, b"abc").unwrap();
        assert_eq!(
            compute_sha256(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert!(verify_checksum("u", &path, "00").is_err());
    }

    #[test]
    fn extract_finds_nested_bundle() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("vm.zip");
        fs::write(&archive, zipped_bundle("Zipped")).unwrap();

        let bundle = extract_bundle(&archive, &dir.path().join("out")).unwrap();
        assert!(bundle.ends_with("Zipped.vmbundle"));
        assert_eq!(Machine::open(&bundle).unwrap().name(), "Zipped");
        assert!(bundle.join("Images/disk.qcow2").is_file());
    }

    #[test]
    fn extract_rejects_archives_without_bundles() {
        use zip::write::SimpleFileOptions;

        let dir = tempdir().unwrap();
        let archive = dir.path().join("empty.zip");
        {
            let file = File::create(&archive).unwrap();
            let mut writer = zip::ZipWriter::new(file);
            writer
                .start_file("readme.txt", SimpleFileOptions::default())
                .unwrap();
            writer.write_all(b"hello").unwrap();
            writer.finish().unwrap();
        }
        let err = extract_bundle(&archive, &dir.path().join("out")).unwrap_err();
        assert!(matches!(err, Error::InvalidBundle { .. }));
    }

    #[test]
    fn unsafe_paths_are_detected() {
        assert!(is_safe_relative(Path::new("a/b.txt")));
        assert!(!is_safe_relative(Path::new("../escape")));
        assert!(!is_safe_relative(Path::new("/etc/passwd")));
    }
}
