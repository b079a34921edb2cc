//! Machine library core: registry, drive images, save/discard and background tasks.

pub mod backend;
pub mod coordinator;
pub mod drives;
pub mod events;
pub mod library;
pub mod machine;
pub mod naming;
pub mod record;
pub mod registry;
pub mod session;
pub mod tasks;

pub use backend::{ImageBackend, QemuImg, Unavailable, backend_for};
pub use coordinator::{ImportPlan, SaveState};
pub use drives::{CommitSummary, DriveSpec, ImportRequest, StagedDrive};
pub use events::{Event, EventSink};
pub use library::{
    EntrySummary, Library, LibraryContext, LibrarySnapshot, LibraryState, PendingSummary,
};
pub use machine::{
    DriveImage, Entry, ImageType, Machine, MachineConfig, MachineId, Placeholder, Tombstone,
};
pub use registry::Registry;
pub use session::{EditSession, SessionId, SessionTarget};
pub use tasks::{Alert, StatusBoard, TaskHandle, spawn_busy};
