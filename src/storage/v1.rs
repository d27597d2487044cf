use crate::amd64::CheckpointSource;
use crate::core::layout::VmLayout;
use crate::core::memory::MemorySnapshot;
use crate::core::types::{Address, Checkpoint, RegisterSnapshot};

use super::*;

/// A run of consecutive target words. Words are always stored as 64-bit numbers; with 4-byte
/// pointers each must fit in 32 bits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemorySegment {
    pub base: usize,
    pub words: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetDescription {
    pub version: Version,
    pub layout: VmLayout,
    pub registers: RegisterSnapshot,
    /// The thread's last managed SP/FP, when already known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<Checkpoint>,
    /// Address of the thread's frame anchor, to read the checkpoint from memory instead.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor: Option<Address>,
    #[serde(default)]
    pub memory: Vec<MemorySegment>,
}

impl TargetDescription {
    pub fn memory(&self) -> Result<MemorySnapshot, StorageError> {
        let mut snapshot = MemorySnapshot::new();
        for segment in &self.memory {
            snapshot.add_words(segment.base, &segment.words, self.layout.pointer_size)?;
        }
        Ok(snapshot)
    }

    pub fn checkpoint_source(&self) -> Result<CheckpointSource, StorageError> {
        match (self.checkpoint, self.anchor) {
            (Some(_), Some(_)) => Err(StorageError::ConflictingCheckpoint),
            (Some(checkpoint), None) => Ok(CheckpointSource::Recorded(checkpoint)),
            (None, Some(anchor)) => Ok(CheckpointSource::Anchor(anchor)),
            (None, None) => Ok(CheckpointSource::None),
        }
    }
}

impl Storage for TargetDescription {
    fn from_value(value: serde_json::Value) -> Result<TargetDescription, StorageError> {
        let description: TargetDescription = serde_json::from_value(value)?;
        description.layout.validate()?;
        Ok(description)
    }

    fn version() -> Version {
        Version(1)
    }
}
