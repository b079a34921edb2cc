//! vmshelf library crate.

/// Machine registry, drive images and the library actor.
pub mod core;

/// Background downloads that produce machines.
pub mod downloads;

/// CLI argument parsing and adapters (only when the `cli` feature is enabled).
#[cfg(feature = "cli")]
pub mod cli;

#[cfg(feature = "cli")]
pub mod app;

mod config;
mod error;

pub use config::*;
pub use error::*;
