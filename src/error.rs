use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of failures, stable across error variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A directory or bundle was offered where a drive image file was expected.
    InvalidSource,
    /// A machine with the same name already exists.
    DuplicateName,
    /// A drive size that is not strictly positive.
    InvalidSize,
    /// The image backend failed to produce its output.
    ConversionFailed,
    /// A machine could neither be reloaded nor reconstructed after a failed save.
    StaleMachine,
    /// Generic filesystem failure.
    IoFailure,
    /// The operation is unavailable on this host or for this kind of entry.
    NotSupported,
    /// A background download failed.
    DownloadFailed,
    /// A background download was cancelled.
    Cancelled,
    /// The request referenced something that does not exist or is malformed.
    InvalidRequest,
    /// The settings file is missing, unreadable or invalid.
    Configuration,
}

impl ErrorKind {
    pub fn describe(self) -> &'static str {
        match self {
            ErrorKind::InvalidSource => "invalid source",
            ErrorKind::DuplicateName => "duplicate name",
            ErrorKind::InvalidSize => "invalid size",
            ErrorKind::ConversionFailed => "conversion failed",
            ErrorKind::StaleMachine => "stale machine",
            ErrorKind::IoFailure => "i/o failure",
            ErrorKind::NotSupported => "not supported",
            ErrorKind::DownloadFailed => "download failed",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::InvalidRequest => "invalid request",
            ErrorKind::Configuration => "configuration",
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(
        "{path} is a virtual machine bundle and cannot be imported as a drive. \
         Open it as a machine instead."
    )]
    BundleAsDrive { path: PathBuf },
    #[error("{path} is a directory and cannot be imported as a drive.")]
    DirectoryAsDrive { path: PathBuf },
    #[error("Drive source {path} does not exist.")]
    SourceMissing { path: PathBuf },
    #[error("{path} is not a valid virtual machine bundle: {reason}")]
    InvalidBundle { path: PathBuf, reason: String },
    #[error("A virtual machine named `{name}` already exists.")]
    DuplicateName { name: String },
    #[error("`{name}` is not a usable machine name: {reason}")]
    InvalidName { name: String, reason: String },
    #[error("Invalid drive size of {size_mib} MiB; drives must be at least 1 MiB.")]
    InvalidSize { size_mib: u64 },
    #[error("Image operation on {path} failed: {message}")]
    ConversionFailed { path: PathBuf, message: String },
    #[error("Machine {} is stale and could not be recovered: {message}", describe_path(.path))]
    StaleMachine {
        path: Option<PathBuf>,
        message: String,
    },
    #[error("Failed to {action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(
        "Not enough free space next to {path} to rewrite it: {required} bytes required, {available} available."
    )]
    InsufficientSpace {
        path: PathBuf,
        required: u64,
        available: u64,
    },
    #[error("{feature} is not supported: {reason}")]
    NotSupported {
        feature: &'static str,
        reason: String,
    },
    #[error("Download of {url} failed: {message}")]
    DownloadFailed { url: String, message: String },
    #[error("Download of {url} was cancelled.")]
    Cancelled { url: String },
    #[error("No machine with id {id} is registered.")]
    MachineNotFound { id: u64 },
    #[error("No machine named `{name}` is registered.")]
    UnknownMachine { name: String },
    #[error("No pending download with id {id}.")]
    PendingNotFound { id: u64 },
    #[error("Edit session {id} is not open.")]
    SessionNotFound { id: u64 },
    #[error("Drive index {index} is out of range ({count} drives configured).")]
    DriveIndexOutOfRange { index: usize, count: usize },
    #[error("Drive `{name}` is not configured on this machine.")]
    DriveNotFound { name: String },
    #[error("Configuration at {path} could not be parsed: {source}")]
    ParseBundle {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Configuration for {path} could not be serialized: {source}")]
    SerializeBundle {
        path: PathBuf,
        #[source]
        source: toml::ser::Error,
    },
    #[error("Machine list record at {path} is unusable: {message}")]
    ListRecord { path: PathBuf, message: String },
    #[error("Failed to read settings file at {path}: {source}")]
    ReadSettings {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Settings at {path} could not be parsed: {source}")]
    ParseSettings {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Settings validation failed for {path}: {message}")]
    InvalidSettings { path: PathBuf, message: String },
    #[error("The library worker has shut down.")]
    LibraryClosed,
    #[error("Background task `{label}` panicked.")]
    TaskPanicked { label: String },
}

fn describe_path(path: &Option<PathBuf>) -> String {
    path.as_ref()
        .map(|path| path.display().to_string())
        .unwrap_or_else(|| "<unsaved>".to_string())
}

impl Error {
    pub fn io(action: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            action,
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::BundleAsDrive { .. }
            | Error::DirectoryAsDrive { .. }
            | Error::SourceMissing { .. }
            | Error::InvalidBundle { .. } => ErrorKind::InvalidSource,
            Error::DuplicateName { .. } => ErrorKind::DuplicateName,
            Error::InvalidSize { .. } => ErrorKind::InvalidSize,
            Error::ConversionFailed { .. } => ErrorKind::ConversionFailed,
            Error::StaleMachine { .. } => ErrorKind::StaleMachine,
            Error::Io { .. }
            | Error::InsufficientSpace { .. }
            | Error::ParseBundle { .. }
            | Error::SerializeBundle { .. }
            | Error::ListRecord { .. }
            | Error::TaskPanicked { .. } => ErrorKind::IoFailure,
            Error::NotSupported { .. } => ErrorKind::NotSupported,
            Error::DownloadFailed { .. } => ErrorKind::DownloadFailed,
            Error::Cancelled { .. } => ErrorKind::Cancelled,
            Error::InvalidName { .. }
            | Error::MachineNotFound { .. }
            | Error::UnknownMachine { .. }
            | Error::PendingNotFound { .. }
            | Error::SessionNotFound { .. }
            | Error::DriveIndexOutOfRange { .. }
            | Error::DriveNotFound { .. }
            | Error::LibraryClosed => ErrorKind::InvalidRequest,
            Error::ReadSettings { .. }
            | Error::ParseSettings { .. }
            | Error::InvalidSettings { .. } => ErrorKind::Configuration,
        }
    }
}
