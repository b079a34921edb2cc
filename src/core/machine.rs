//! Machine bundles, their configuration, and the registry entry variants.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::core::drives::discard_partial;
use crate::error::{Error, Result};

pub const BUNDLE_EXTENSION: &str = "vmbundle";
pub const CONFIG_FILE: &str = "config.toml";
pub const IMAGES_DIR: &str = "Images";

static NEXT_MACHINE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MachineId(u64);

impl MachineId {
    fn next() -> Self {
        Self(NEXT_MACHINE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for MachineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Deletion flag shared by every clone of a machine so observers can react after removal.
#[derive(Debug, Clone, Default)]
pub struct Tombstone(Arc<AtomicBool>);

impl Tombstone {
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn set(&self) {
        self.0.store(true, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageType {
    Disk,
    Cd,
    Bios,
    Kernel,
    Initrd,
    Dtb,
}

impl ImageType {
    pub fn as_str(self) -> &'static str {
        match self {
            ImageType::Disk => "disk",
            ImageType::Cd => "cd",
            ImageType::Bios => "bios",
            ImageType::Kernel => "kernel",
            ImageType::Initrd => "initrd",
            ImageType::Dtb => "dtb",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.to_ascii_lowercase().as_str() {
            "disk" => Some(Self::Disk),
            "cd" | "cdrom" => Some(Self::Cd),
            "bios" => Some(Self::Bios),
            "kernel" => Some(Self::Kernel),
            "initrd" => Some(Self::Initrd),
            "dtb" => Some(Self::Dtb),
            _ => None,
        }
    }

    /// Type inferred from a file name: `.iso` images are optical media, everything else a disk.
    pub fn for_file(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("iso") => ImageType::Cd,
            _ => ImageType::Disk,
        }
    }
}

impl std::fmt::Display for ImageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bus interface used when the architecture gives no better answer.
pub const FALLBACK_INTERFACE: &str = "none";

/// Default drive interface for an architecture and image type.
pub fn default_interface(architecture: Option<&str>, image_type: ImageType) -> &'static str {
    match (architecture, image_type) {
        (Some("x86_64" | "i386"), ImageType::Disk | ImageType::Cd) => "ide",
        (Some("aarch64" | "arm" | "riscv64"), ImageType::Disk) => "virtio",
        (Some("aarch64" | "arm" | "riscv64"), ImageType::Cd) => "usb",
        (Some(_), ImageType::Disk) => "virtio",
        _ => FALLBACK_INTERFACE,
    }
}

/// A drive bound to a machine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveImage {
    pub name: String,
    /// File name under the bundle's `Images/` directory; always `None` for removable drives.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub image_type: ImageType,
    pub interface: String,
    #[serde(default)]
    pub removable: bool,
}

/// Resolve a drive's file name against `images_dir`.
///
/// Drive paths come from `config.toml`, which may belong to an imported or downloaded bundle, so
/// anything other than a plain file name is refused.
pub fn image_path(images_dir: &Path, file: &str) -> Result<PathBuf> {
    let mut components = Path::new(file).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(images_dir.join(file)),
        _ => Err(Error::InvalidBundle {
            path: images_dir.to_path_buf(),
            reason: format!("drive path `{file}` is not a file name inside {IMAGES_DIR}/"),
        }),
    }
}

/// Persisted machine configuration (`config.toml` inside the bundle).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default = "fresh_system_uuid")]
    pub system_uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, rename = "drive")]
    pub drives: Vec<DriveImage>,
}

fn fresh_system_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self::new("")
    }
}

impl MachineConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            architecture: None,
            target: None,
            system_uuid: fresh_system_uuid(),
            notes: None,
            drives: Vec::new(),
        }
    }

    pub fn with_architecture(mut self, architecture: impl Into<String>) -> Self {
        self.architecture = Some(architecture.into());
        self
    }

    pub fn drive_names(&self) -> impl Iterator<Item = &str> {
        self.drives.iter().map(|drive| drive.name.as_str())
    }

    pub fn drive(&self, index: usize) -> Option<&DriveImage> {
        self.drives.get(index)
    }

    pub fn drive_by_name(&self, name: &str) -> Option<&DriveImage> {
        self.drives.iter().find(|drive| drive.name == name)
    }

    pub fn new_drive(
        &mut self,
        name: impl Into<String>,
        path: impl Into<String>,
        image_type: ImageType,
        interface: impl Into<String>,
    ) -> &DriveImage {
        self.drives.push(DriveImage {
            name: name.into(),
            path: Some(path.into()),
            image_type,
            interface: interface.into(),
            removable: false,
        });
        let last = self.drives.len() - 1;
        &self.drives[last]
    }

    pub fn new_removable_drive(
        &mut self,
        name: impl Into<String>,
        image_type: ImageType,
        interface: impl Into<String>,
    ) -> &DriveImage {
        self.drives.push(DriveImage {
            name: name.into(),
            path: None,
            image_type,
            interface: interface.into(),
            removable: true,
        });
        let last = self.drives.len() - 1;
        &self.drives[last]
    }

    pub fn remove_drive(&mut self, index: usize) -> Result<DriveImage> {
        if index >= self.drives.len() {
            return Err(Error::DriveIndexOutOfRange {
                index,
                count: self.drives.len(),
            });
        }
        Ok(self.drives.remove(index))
    }

    /// Image files in `images_dir` that no drive references.
    pub fn orphaned_images(&self, images_dir: &Path) -> Vec<String> {
        let Ok(entries) = fs::read_dir(images_dir) else {
            return Vec::new();
        };
        let mut orphans: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|ft| ft.is_file()).unwrap_or(false))
            .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
            .filter(|name| !name.starts_with('.'))
            .filter(|name| {
                !self
                    .drives
                    .iter()
                    .any(|drive| drive.path.as_deref() == Some(name.as_str()))
            })
            .collect();
        orphans.sort();
        orphans
    }

    /// Re-attach orphaned image files as drives so they can be inspected or removed.
    pub fn recover_orphaned_drives(&mut self, images_dir: &Path) -> usize {
        let orphans = self.orphaned_images(images_dir);
        for file in &orphans {
            let name = crate::core::naming::unique_drive_name(self.drive_names());
            let image_type = ImageType::for_file(Path::new(file));
            let interface = default_interface(self.architecture.as_deref(), image_type);
            self.new_drive(name, file.clone(), image_type, interface);
        }
        orphans.len()
    }

    pub fn load(bundle: &Path) -> Result<Self> {
        let path = bundle.join(CONFIG_FILE);
        let contents =
            fs::read_to_string(&path).map_err(|source| Error::io("read", &path, source))?;
        let config: Self =
            toml::from_str(&contents).map_err(|source| Error::ParseBundle { path, source })?;
        let images_dir = bundle.join(IMAGES_DIR);
        for file in config.drives.iter().filter_map(|drive| drive.path.as_deref()) {
            image_path(&images_dir, file)?;
        }
        Ok(config)
    }

    /// Write `config.toml` into `bundle`, replacing any previous file atomically.
    pub fn store(&self, bundle: &Path) -> Result<()> {
        fs::create_dir_all(bundle.join(IMAGES_DIR))
            .map_err(|source| Error::io("create bundle", bundle, source))?;
        let path = bundle.join(CONFIG_FILE);
        let serialized = toml::to_string_pretty(self).map_err(|source| Error::SerializeBundle {
            path: path.clone(),
            source,
        })?;
        let staging = bundle.join(format!(".{CONFIG_FILE}.tmp"));
        fs::write(&staging, serialized).map_err(|source| Error::io("write", &staging, source))?;
        fs::rename(&staging, &path).map_err(|source| {
            discard_partial(&staging);
            Error::io("replace", &path, source)
        })
    }
}

/// Path of the bundle for a machine named `name` under `parent`.
pub fn bundle_path(parent: &Path, name: &str) -> PathBuf {
    parent.join(format!("{name}.{BUNDLE_EXTENSION}"))
}

/// Whether `path` looks like a machine bundle: a directory with the bundle extension or a
/// configuration file inside.
pub fn is_bundle(path: &Path) -> bool {
    if !path.is_dir() {
        return false;
    }
    let has_extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case(BUNDLE_EXTENSION))
        .unwrap_or(false);
    has_extension || path.join(CONFIG_FILE).is_file()
}

/// Reject names that cannot become a bundle directory.
pub fn validate_machine_name(name: &str) -> Result<()> {
    let reason = if name.trim().is_empty() {
        Some("names must not be empty")
    } else if name.contains(['/', '\\', '\0']) {
        Some("names must not contain path separators or NUL bytes")
    } else if name.starts_with('.') {
        Some("names must not start with a dot")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(Error::InvalidName {
            name: name.to_string(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}

/// A live virtual machine backed by a bundle.
#[derive(Debug, Clone)]
pub struct Machine {
    id: MachineId,
    path: Option<PathBuf>,
    pub config: MachineConfig,
    shortcut: bool,
    tombstone: Tombstone,
    media: BTreeMap<String, PathBuf>,
}

impl Machine {
    /// A machine that has never been saved.
    pub fn new(config: MachineConfig) -> Self {
        Self {
            id: MachineId::next(),
            path: None,
            config,
            shortcut: false,
            tombstone: Tombstone::default(),
            media: BTreeMap::new(),
        }
    }

    /// A machine that will be saved into `<parent>/<name>.vmbundle`.
    pub fn with_destination(config: MachineConfig, parent: &Path) -> Self {
        let path = bundle_path(parent, &config.name);
        let mut machine = Self::new(config);
        machine.path = Some(path);
        machine
    }

    pub fn open(path: &Path) -> Result<Self> {
        if !path.is_dir() {
            return Err(Error::InvalidBundle {
                path: path.to_path_buf(),
                reason: "not a directory".to_string(),
            });
        }
        let config = MachineConfig::load(path).map_err(|err| Error::InvalidBundle {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
        let mut machine = Self::new(config);
        machine.path = Some(path.to_path_buf());
        Ok(machine)
    }

    /// Open a bundle that lives outside managed storage.
    pub fn open_shortcut(path: &Path) -> Result<Self> {
        let mut machine = Self::open(path)?;
        machine.shortcut = true;
        Ok(machine)
    }

    pub fn id(&self) -> MachineId {
        self.id
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn is_shortcut(&self) -> bool {
        self.shortcut
    }

    pub(crate) fn set_shortcut(&mut self, shortcut: bool) {
        self.shortcut = shortcut;
    }

    pub fn tombstone(&self) -> Tombstone {
        self.tombstone.clone()
    }

    pub fn is_deleted(&self) -> bool {
        self.tombstone.is_set()
    }

    pub fn images_dir(&self) -> Option<PathBuf> {
        self.path.as_ref().map(|path| path.join(IMAGES_DIR))
    }

    pub fn save(&self) -> Result<()> {
        let path = self.path.as_ref().ok_or_else(|| Error::StaleMachine {
            path: None,
            message: format!("machine `{}` has no storage location", self.config.name),
        })?;
        self.config.store(path)
    }

    /// Replace the in-memory configuration with the one on disk.
    pub fn reload(&mut self) -> Result<()> {
        let path = self.path.as_ref().ok_or_else(|| Error::StaleMachine {
            path: None,
            message: format!("machine `{}` has never been saved", self.config.name),
        })?;
        self.config = MachineConfig::load(path)?;
        Ok(())
    }

    /// Insert `source` as the medium of the removable drive `drive_name`.
    pub fn change_medium(&mut self, drive_name: &str, source: &Path) -> Result<()> {
        let drive = self
            .config
            .drive_by_name(drive_name)
            .filter(|drive| drive.removable)
            .ok_or_else(|| Error::DriveNotFound {
                name: drive_name.to_string(),
            })?;
        if !source.exists() {
            return Err(Error::SourceMissing {
                path: source.to_path_buf(),
            });
        }
        self.media.insert(drive.name.clone(), source.to_path_buf());
        Ok(())
    }

    pub fn medium(&self, drive_name: &str) -> Option<&Path> {
        self.media.get(drive_name).map(PathBuf::as_path)
    }
}

/// Stand-in for a machine whose bundle is missing or unreadable.
#[derive(Debug, Clone)]
pub struct Placeholder {
    id: MachineId,
    path: PathBuf,
    name: String,
    shortcut: bool,
    tombstone: Tombstone,
}

impl Placeholder {
    /// Placeholder keeping `machine`'s identity and position; `None` when it was never saved.
    pub fn for_machine(machine: &Machine) -> Option<Self> {
        let path = machine.path()?.to_path_buf();
        Some(Self {
            id: machine.id,
            path,
            name: machine.config.name.clone(),
            shortcut: machine.shortcut,
            tombstone: machine.tombstone.clone(),
        })
    }

    pub fn new(path: PathBuf, name: Option<String>, shortcut: bool) -> Self {
        let name = name.unwrap_or_else(|| {
            path.file_stem()
                .and_then(|stem| stem.to_str())
                .unwrap_or("Unknown")
                .to_string()
        });
        Self {
            id: MachineId::next(),
            path,
            name,
            shortcut,
            tombstone: Tombstone::default(),
        }
    }

    pub fn id(&self) -> MachineId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_shortcut(&self) -> bool {
        self.shortcut
    }

    /// Try to re-open the bundle behind this placeholder.
    pub fn reopen(&self) -> Option<Machine> {
        let mut machine = Machine::open(&self.path).ok()?;
        machine.shortcut = self.shortcut;
        Some(machine)
    }
}

/// One slot in the machine list.
#[derive(Debug, Clone)]
pub enum Entry {
    Live(Machine),
    Placeholder(Placeholder),
}

impl Entry {
    pub fn id(&self) -> MachineId {
        match self {
            Entry::Live(machine) => machine.id(),
            Entry::Placeholder(placeholder) => placeholder.id(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Entry::Live(machine) => machine.name(),
            Entry::Placeholder(placeholder) => placeholder.name(),
        }
    }

    pub fn backing_path(&self) -> Option<&Path> {
        match self {
            Entry::Live(machine) => machine.path(),
            Entry::Placeholder(placeholder) => Some(placeholder.path()),
        }
    }

    pub fn is_shortcut(&self) -> bool {
        match self {
            Entry::Live(machine) => machine.is_shortcut(),
            Entry::Placeholder(placeholder) => placeholder.is_shortcut(),
        }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, Entry::Placeholder(_))
    }

    /// Whether drive operations can be performed on this entry.
    pub fn has_drives(&self) -> bool {
        matches!(self, Entry::Live(_))
    }

    /// Whether the configuration can be edited and saved.
    pub fn is_editable(&self) -> bool {
        matches!(self, Entry::Live(machine) if machine.path().is_some())
    }

    pub fn tombstone(&self) -> Tombstone {
        match self {
            Entry::Live(machine) => machine.tombstone(),
            Entry::Placeholder(placeholder) => placeholder.tombstone.clone(),
        }
    }

    pub fn as_machine(&self) -> Option<&Machine> {
        match self {
            Entry::Live(machine) => Some(machine),
            Entry::Placeholder(_) => None,
        }
    }

    pub fn as_machine_mut(&mut self) -> Option<&mut Machine> {
        match self {
            Entry::Live(machine) => Some(machine),
            Entry::Placeholder(_) => None,
        }
    }

    /// Identity plus variant; two lists with equal signatures are observably the same.
    pub(crate) fn signature(&self) -> (MachineId, bool) {
        (self.id(), self.is_placeholder())
    }
}

impl From<Machine> for Entry {
    fn from(machine: Machine) -> Self {
        Entry::Live(machine)
    }
}

impl From<Placeholder> for Entry {
    fn from(placeholder: Placeholder) -> Self {
        Entry::Placeholder(placeholder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn saved_machine(parent: &Path, name: &str) -> Machine {
        let machine = Machine::with_destination(
            MachineConfig::new(name).with_architecture("aarch64"),
            parent,
        );
        machine.save().unwrap();
        machine
    }

    #[test]
    fn save_then_open_round_trips_drives() {
        let dir = tempdir().unwrap();
        let mut machine = Machine::with_destination(MachineConfig::new("Arch"), dir.path());
        machine
            .config
            .new_drive("drive0", "disk-0.qcow2", ImageType::Disk, "virtio");
        machine
            .config
            .new_removable_drive("drive1", ImageType::Cd, "usb");
        machine.save().unwrap();

        let bundle = dir.path().join("Arch.vmbundle");
        assert!(bundle.join(CONFIG_FILE).is_file());
        assert!(bundle.join(IMAGES_DIR).is_dir());

        let reopened = Machine::open(&bundle).unwrap();
        assert_eq!(reopened.config, machine.config);
        assert_ne!(reopened.id(), machine.id());
        assert!(reopened.config.drives[1].path.is_none());
    }

    #[test]
    fn open_rejects_directory_without_configuration() {
        let dir = tempdir().unwrap();
        let err = Machine::open(dir.path()).unwrap_err();
        assert!(matches!(err, Error::InvalidBundle { .. }));
    }

    #[test]
    fn open_rejects_drive_paths_outside_images() {
        let dir = tempdir().unwrap();
        let bundle = dir.path().join("Escape.vmbundle");
        fs::create_dir_all(bundle.join(IMAGES_DIR)).unwrap();
        fs::write(
            bundle.join(CONFIG_FILE),
            "name = \"Escape\"\n\n[[drive]]\nname = \"drive0\"\npath = \"../../victim.txt\"\nimage_type = \"disk\"\ninterface = \"virtio\"\n",
        )
        .unwrap();

        let err = MachineConfig::load(&bundle).unwrap_err();
        assert!(matches!(err, Error::InvalidBundle { .. }));
    }

    #[test]
    fn image_paths_must_be_plain_file_names() {
        let images = Path::new("/lib/Debian.vmbundle/Images");
        assert_eq!(
            image_path(images, "disk.qcow2").unwrap(),
            images.join("disk.qcow2")
        );
        for file in ["../disk.qcow2", "/etc/passwd", "sub/disk.qcow2", "..", ".", ""] {
            assert!(image_path(images, file).is_err(), "{file} accepted");
        }
    }

    #[test]
    fn reload_discards_in_memory_edits() {
        let dir = tempdir().unwrap();
        let mut machine = saved_machine(dir.path(), "Alpine");
        machine.config.notes = Some("scratch".into());
        machine.reload().unwrap();
        assert!(machine.config.notes.is_none());
    }

    #[test]
    fn save_without_path_is_stale() {
        let machine = Machine::new(MachineConfig::new("Loose"));
        let err = machine.save().unwrap_err();
        assert!(matches!(err, Error::StaleMachine { path: None, .. }));
    }

    #[test]
    fn change_medium_requires_removable_drive() {
        let dir = tempdir().unwrap();
        let iso = dir.path().join("installer.iso");
        fs::write(&iso, b"iso").unwrap();

        let mut machine = Machine::new(MachineConfig::new("Media"));
        machine
            .config
            .new_drive("drive0", "disk-0.qcow2", ImageType::Disk, "virtio");
        machine
            .config
            .new_removable_drive("drive1", ImageType::Cd, "usb");

        assert!(matches!(
            machine.change_medium("drive0", &iso),
            Err(Error::DriveNotFound { .. })
        ));
        machine.change_medium("drive1", &iso).unwrap();
        assert_eq!(machine.medium("drive1"), Some(iso.as_path()));
    }

    #[test]
    fn placeholder_reopens_once_bundle_returns() {
        let dir = tempdir().unwrap();
        let machine = saved_machine(dir.path(), "Comeback");
        let placeholder = Placeholder::for_machine(&machine).unwrap();
        assert_eq!(placeholder.id(), machine.id());
        assert_eq!(placeholder.name(), "Comeback");

        let bundle = machine.path().unwrap().to_path_buf();
        let moved = dir.path().join("elsewhere");
        fs::rename(&bundle, &moved).unwrap();
        assert!(placeholder.reopen().is_none());

        fs::rename(&moved, &bundle).unwrap();
        let unwrapped = placeholder.reopen().unwrap();
        assert_eq!(unwrapped.name(), "Comeback");
    }

    #[test]
    fn placeholder_requires_a_path() {
        let machine = Machine::new(MachineConfig::new("Draft"));
        assert!(Placeholder::for_machine(&machine).is_none());
    }

    #[test]
    fn entry_capabilities_follow_variant() {
        let dir = tempdir().unwrap();
        let machine = saved_machine(dir.path(), "Caps");
        let placeholder = Entry::from(Placeholder::for_machine(&machine).unwrap());
        let live = Entry::from(machine);

        assert!(live.has_drives());
        assert!(live.is_editable());
        assert!(!placeholder.has_drives());
        assert!(!placeholder.is_editable());
        assert_eq!(live.backing_path(), placeholder.backing_path());
        assert_eq!(live.id(), placeholder.id());
        assert_ne!(live.signature(), placeholder.signature());
    }

    #[test]
    fn tombstone_is_shared_between_clones() {
        let machine = Machine::new(MachineConfig::new("Shared"));
        let observer = machine.clone();
        machine.tombstone().set();
        assert!(observer.is_deleted());
    }

    #[test]
    fn orphaned_images_are_recovered_as_drives() {
        let dir = tempdir().unwrap();
        let images = dir.path().join(IMAGES_DIR);
        fs::create_dir_all(&images).unwrap();
        fs::write(images.join("disk-0.qcow2"), b"").unwrap();
        fs::write(images.join("stray.iso"), b"").unwrap();

        let mut config = MachineConfig::new("Orphans").with_architecture("x86_64");
        config.new_drive("drive0", "disk-0.qcow2", ImageType::Disk, "ide");

        assert_eq!(config.orphaned_images(&images), vec!["stray.iso".to_string()]);
        assert_eq!(config.recover_orphaned_drives(&images), 1);
        let recovered = config.drive_by_name("drive1").unwrap();
        assert_eq!(recovered.path.as_deref(), Some("stray.iso"));
        assert_eq!(recovered.image_type, ImageType::Cd);
        assert_eq!(recovered.interface, "ide");
    }

    #[test]
    fn machine_names_are_validated() {
        assert!(validate_machine_name("Ubuntu 24.04").is_ok());
        assert!(validate_machine_name("").is_err());
        assert!(validate_machine_name("a/b").is_err());
        assert!(validate_machine_name(".hidden").is_err());
    }

    #[test]
    fn default_interfaces_depend_on_architecture() {
        assert_eq!(default_interface(Some("x86_64"), ImageType::Cd), "ide");
        assert_eq!(default_interface(Some("aarch64"), ImageType::Disk), "virtio");
        assert_eq!(default_interface(Some("aarch64"), ImageType::Cd), "usb");
        assert_eq!(default_interface(None, ImageType::Disk), FALLBACK_INTERFACE);
    }
}
