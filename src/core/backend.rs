//! Disk-image backend: conversion, resize, size queries and creation.

use std::fmt::Debug;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde_json::Value;

use crate::error::{Error, Result};

/// Operations on disk-image binary formats.
///
/// Implementations must not leave a partial destination behind when `convert` or `create` fails.
pub trait ImageBackend: Send + Sync + Debug {
    fn convert(&self, source: &Path, destination: &Path, compress: bool) -> Result<()>;
    fn resize(&self, image: &Path, size_bytes: u64) -> Result<()>;
    /// Virtual size of `image` in bytes.
    fn query_size(&self, image: &Path) -> Result<u64>;
    /// Create an empty qcow2 image of `size_bytes`.
    fn create(&self, destination: &Path, size_bytes: u64) -> Result<()>;
    fn supports_conversion(&self) -> bool {
        true
    }
}

/// Backend that drives the `qemu-img` binary.
#[derive(Debug, Clone)]
pub struct QemuImg {
    binary: PathBuf,
}

impl QemuImg {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    fn run(&self, command: &mut Command, subject: &Path) -> Result<()> {
        let output = command.output().map_err(|err| Error::ConversionFailed {
            path: subject.to_path_buf(),
            message: format!("failed to invoke `{}`: {err}", self.binary.display()),
        })?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(Error::ConversionFailed {
            path: subject.to_path_buf(),
            message: format!(
                "`{}` exited with code {}: {}",
                self.binary.display(),
                output.status.code().unwrap_or(-1),
                stderr.trim()
            ),
        })
    }
}

fn clear_output(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_file(path).map_err(|source| Error::io("clear previous output", path, source))?;
    }
    Ok(())
}

fn discard_partial(path: &Path) {
    if path.exists() {
        if let Err(err) = fs::remove_file(path) {
            log::warn!("failed to remove partial image {}: {err}", path.display());
        }
    }
}

impl ImageBackend for QemuImg {
    fn convert(&self, source: &Path, destination: &Path, compress: bool) -> Result<()> {
        clear_output(destination)?;
        let mut command = Command::new(&self.binary);
        command.arg("convert");
        if compress {
            command.arg("-c");
        }
        command.arg("-O").arg("qcow2").arg(source).arg(destination);
        let result = self.run(&mut command, source);
        if result.is_err() {
            discard_partial(destination);
        }
        result
    }

    fn resize(&self, image: &Path, size_bytes: u64) -> Result<()> {
        let mut command = Command::new(&self.binary);
        command
            .arg("resize")
            .arg(image)
            .arg(size_bytes.to_string());
        self.run(&mut command, image)
    }

    fn query_size(&self, image: &Path) -> Result<u64> {
        let output = Command::new(&self.binary)
            .arg("info")
            .arg("--output=json")
            .arg(image)
            .output()
            .map_err(|err| Error::ConversionFailed {
                path: image.to_path_buf(),
                message: format!("failed to invoke `{}`: {err}", self.binary.display()),
            })?;
        if !output.status.success() {
            return Err(Error::ConversionFailed {
                path: image.to_path_buf(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        parse_virtual_size(&output.stdout).ok_or_else(|| Error::ConversionFailed {
            path: image.to_path_buf(),
            message: "`qemu-img info` did not report a virtual size".to_string(),
        })
    }

    fn create(&self, destination: &Path, size_bytes: u64) -> Result<()> {
        clear_output(destination)?;
        let mut command = Command::new(&self.binary);
        command
            .arg("create")
            .arg("-f")
            .arg("qcow2")
            .arg(destination)
            .arg(size_bytes.to_string());
        let result = self.run(&mut command, destination);
        if result.is_err() {
            discard_partial(destination);
        }
        result
    }
}

fn parse_virtual_size(stdout: &[u8]) -> Option<u64> {
    let value: Value = serde_json::from_slice(stdout).ok()?;
    let object = match value.as_array() {
        Some(array) => array.first()?.as_object()?,
        None => value.as_object()?,
    };
    object.get("virtual-size").and_then(Value::as_u64)
}

/// Backend used when no `qemu-img` is available: every operation reports `NotSupported`.
#[derive(Debug, Clone, Default)]
pub struct Unavailable;

impl Unavailable {
    fn refuse<T>(&self, feature: &'static str) -> Result<T> {
        Err(Error::NotSupported {
            feature,
            reason: "no `qemu-img` binary was found; install QEMU or set `images.qemu_img`"
                .to_string(),
        })
    }
}

impl ImageBackend for Unavailable {
    fn convert(&self, _source: &Path, _destination: &Path, _compress: bool) -> Result<()> {
        self.refuse("Image conversion")
    }

    fn resize(&self, _image: &Path, _size_bytes: u64) -> Result<()> {
        self.refuse("Image resize")
    }

    fn query_size(&self, _image: &Path) -> Result<u64> {
        self.refuse("Image size query")
    }

    fn create(&self, _destination: &Path, _size_bytes: u64) -> Result<()> {
        self.refuse("qcow2 image creation")
    }

    fn supports_conversion(&self) -> bool {
        false
    }
}

/// Pick the backend for the configured `qemu-img`, falling back to [`Unavailable`].
pub fn backend_for(qemu_img: Option<&Path>) -> Box<dyn ImageBackend> {
    match qemu_img {
        Some(binary) if binary.is_file() => Box::new(QemuImg::new(binary)),
        Some(binary) => {
            log::warn!(
                "qemu-img {} not found; image operations are unavailable",
                binary.display()
            );
            Box::new(Unavailable)
        }
        None => Box::new(Unavailable),
    }
}
