/*
 * x86-64 frames over target memory.
 *
 * Frames are rbp-chained for the interpreter and native code; compiled frames have a fixed size
 * taken from their code blob and are unwound without a frame pointer. Everything the frames need
 * to know about the runtime comes from `VmLayout`.
 */
pub mod frame;

use crate::core::layout::VmLayout;
use crate::core::memory::TargetMemory;
use crate::core::types::{Address, Checkpoint, FrameError, RegisterSnapshot};
use crate::guesser::{FramePlatform, ManagedThread};

pub use self::frame::Amd64Frame;

/// The last managed frame a thread recorded before it left managed code. Entry frames point at
/// one through their call wrapper, and threads keep one of their own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Anchor {
    pub sp: Option<Address>,
    pub fp: Option<Address>,
    pub pc: Option<Address>,
}

pub struct Amd64Platform<'a, M> {
    pub memory: &'a M,
    pub layout: &'a VmLayout,
}

// Derived impls would require `M: Clone`.
impl<'a, M> Clone for Amd64Platform<'a, M> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, M> Copy for Amd64Platform<'a, M> {}

impl<'a, M: TargetMemory> Amd64Platform<'a, M> {
    pub fn new(memory: &'a M, layout: &'a VmLayout) -> Amd64Platform<'a, M> {
        Amd64Platform { memory, layout }
    }

    pub fn read(&self, addr: Address) -> Result<Option<Address>, FrameError> {
        Ok(self.memory.read_address(addr, self.layout.pointer_size)?)
    }

    fn field(&self, base: Address, offset: usize) -> Result<Option<Address>, FrameError> {
        let addr = isize::try_from(offset)
            .ok()
            .and_then(|offset| base.offset(offset))
            .ok_or(FrameError::OutOfRange("anchor field"))?;
        self.read(addr)
    }

    pub fn read_anchor(&self, anchor: Address) -> Result<Anchor, FrameError> {
        let offsets = self.layout.anchor;
        Ok(Anchor {
            sp: self.field(anchor, offsets.last_sp_offset)?,
            fp: self.field(anchor, offsets.last_fp_offset)?,
            pc: self.field(anchor, offsets.last_pc_offset)?,
        })
    }
}

impl<'a, M: TargetMemory> FramePlatform for Amd64Platform<'a, M> {
    type Frame = Amd64Frame<'a, M>;

    fn frame(
        &self,
        sp: Address,
        fp: Option<Address>,
        pc: Option<Address>,
    ) -> Result<Amd64Frame<'a, M>, FrameError> {
        Amd64Frame::new(*self, sp, sp, fp, pc)
    }

    fn read_address(&self, addr: Address) -> Result<Option<Address>, FrameError> {
        self.read(addr)
    }
}

/// Where a thread's last managed frame comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointSource {
    /// Already known, e.g. written down by whoever suspended the thread.
    Recorded(Checkpoint),
    /// Read from the thread's frame anchor in target memory.
    Anchor(Address),
    None,
}

/// A suspended thread: its registers and how to find its last managed frame.
pub struct ThreadState<'a, M> {
    platform: Amd64Platform<'a, M>,
    registers: RegisterSnapshot,
    checkpoint: CheckpointSource,
}

impl<'a, M: TargetMemory> ThreadState<'a, M> {
    pub fn new(
        platform: Amd64Platform<'a, M>,
        registers: RegisterSnapshot,
        checkpoint: CheckpointSource,
    ) -> ThreadState<'a, M> {
        ThreadState {
            platform,
            registers,
            checkpoint,
        }
    }
}

impl<'a, M: TargetMemory> ManagedThread for ThreadState<'a, M> {
    fn registers(&self) -> &RegisterSnapshot {
        &self.registers
    }

    fn checkpoint(&self) -> Result<Checkpoint, FrameError> {
        match self.checkpoint {
            CheckpointSource::Recorded(checkpoint) => Ok(checkpoint),
            CheckpointSource::Anchor(anchor) => {
                let anchor = self.platform.read_anchor(anchor)?;
                Ok(Checkpoint {
                    sp: anchor.sp,
                    fp: anchor.fp,
                })
            }
            CheckpointSource::None => Ok(Checkpoint::default()),
        }
    }
}
