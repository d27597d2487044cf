/// Target description files.
///
/// A target description is everything a guess needs about a suspended thread, written down by
/// whatever suspended it: the runtime's layout, the thread's registers, where to find its last
/// managed frame and, optionally, a copy of the memory around its stack. Descriptions are JSON
/// objects with a top-level `version` field:
///
/// ```text
/// {"version": 1, "layout": {...}, "registers": {...}, "memory": [...]}
/// ```
///
/// The version is checked before anything else is parsed, so an old binary reading a newer file
/// says so instead of complaining about unknown fields.
use std::fmt;
use std::fs::File;
use std::io::prelude::*;
use std::io::BufReader;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use thiserror::Error;

use crate::core::layout::LayoutError;
use crate::core::types::MemoryCopyError;

mod v1;

pub use self::v1::{MemorySegment, TargetDescription};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(pub u64);

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub const CURRENT_VERSION: Version = Version(1);

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Unsupported target description version {}. This build reads versions up to {}", _0, CURRENT_VERSION)]
    UnsupportedVersion(Version),
    #[error("Target description has no version field")]
    MissingVersion,
    #[error("Invalid target description: {}", _0)]
    Json(#[from] serde_json::Error),
    #[error("Invalid runtime layout: {}", _0)]
    Layout(#[from] LayoutError),
    #[error("Invalid memory segment: {}", _0)]
    Memory(#[from] MemoryCopyError),
    #[error("Target description gives both a checkpoint and an anchor address")]
    ConflictingCheckpoint,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub(crate) trait Storage: Sized {
    fn from_value(value: serde_json::Value) -> Result<Self, StorageError>;
    fn version() -> Version;
}

#[derive(Deserialize)]
struct Header {
    version: Option<Version>,
}

pub fn from_reader<R: Read>(r: R) -> Result<TargetDescription, StorageError> {
    let value: serde_json::Value = serde_json::from_reader(BufReader::new(r))?;
    let header = Header::deserialize(&value)?;
    match header.version {
        Some(v) if v == v1::TargetDescription::version() => TargetDescription::from_value(value),
        Some(v) => Err(StorageError::UnsupportedVersion(v)),
        None => Err(StorageError::MissingVersion),
    }
}

pub fn load(path: &Path) -> Result<TargetDescription> {
    let file = File::open(path).context(format!("open target description {}", path.display()))?;
    let description =
        from_reader(file).context(format!("read target description {}", path.display()))?;
    debug!(
        "loaded target description {} with {} memory segments",
        path.display(),
        description.memory.len()
    );
    Ok(description)
}

pub fn save(description: &TargetDescription, path: &Path) -> Result<()> {
    let file =
        File::create(path).context(format!("create target description {}", path.display()))?;
    serde_json::to_writer_pretty(file, description)
        .context(format!("write target description {}", path.display()))?;
    Ok(())
}
