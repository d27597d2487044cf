use thiserror::Error;

use crate::core::types::Address;
use crate::guesser::CodeRegionOracle;

/*
 * Description of the target runtime: where its generated code lives and how its frames and
 * metadata are laid out in memory. Nothing here is read from the target; a description is
 * produced by whatever attached to the runtime (usually from its exported structure offsets) and
 * handed to us alongside the register state.
 */

#[derive(Error, Debug, PartialEq, Eq)]
pub enum LayoutError {
    #[error("Unsupported pointer size {}", _0)]
    PointerSize(usize),
    #[error("Empty or inverted code range {:#x}..{:#x} for {}", _1, _2, _0)]
    BadRange(&'static str, usize, usize),
    #[error("Code blob {} at {:#x} lies outside the code cache", _0, _1)]
    BlobOutsideCodeCache(String, usize),
    #[error("Frame size {} of code blob {} is not a multiple of the pointer size", _1, _0)]
    UnalignedFrameSize(String, usize),
}

/// A half-open range `[start, end)` of code addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeRange {
    pub start: usize,
    pub end: usize,
}

impl CodeRange {
    pub fn contains(&self, addr: Address) -> bool {
        let addr = addr.as_usize();
        addr >= self.start && addr < self.end
    }

    fn check(&self, name: &'static str) -> Result<(), LayoutError> {
        if self.start >= self.end {
            return Err(LayoutError::BadRange(name, self.start, self.end));
        }
        Ok(())
    }
}

/// A compiled method or stub in the code cache whose frames have a fixed size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeBlob {
    pub name: String,
    pub start: usize,
    pub end: usize,
    /// Frame size in bytes, including the return address and saved frame pointer.
    pub frame_size: usize,
}

impl CodeBlob {
    pub fn contains(&self, addr: Address) -> bool {
        CodeRange {
            start: self.start,
            end: self.end,
        }
        .contains(addr)
    }
}

/// Word offsets of frame slots, relative to the frame pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameSlots {
    pub link: isize,
    pub return_addr: isize,
    pub sender_sp: isize,
    pub interpreter_sender_sp: isize,
    pub interpreter_method: isize,
    pub interpreter_bcp: isize,
    pub entry_call_wrapper: isize,
}

impl Default for FrameSlots {
    fn default() -> FrameSlots {
        FrameSlots {
            link: 0,
            return_addr: 1,
            sender_sp: 2,
            interpreter_sender_sp: -1,
            interpreter_method: -3,
            interpreter_bcp: -8,
            entry_call_wrapper: -6,
        }
    }
}

/// Byte offsets inside method metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MethodLayout {
    /// Offset of the const-method pointer inside a method.
    pub const_method_offset: usize,
    /// Size of the const-method header; bytecodes follow it directly.
    pub const_method_size: usize,
    /// Offset of the `u16` bytecode length inside a const method.
    pub code_size_offset: usize,
    /// When set, the first word of every method must equal this value.
    pub vtable: Option<usize>,
}

impl Default for MethodLayout {
    fn default() -> MethodLayout {
        MethodLayout {
            const_method_offset: 8,
            const_method_size: 0x38,
            code_size_offset: 0x2c,
            vtable: None,
        }
    }
}

/// Byte offsets inside a frame anchor (the record of the last managed frame a thread left)
/// and inside the call wrapper an entry frame points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnchorLayout {
    pub last_sp_offset: usize,
    pub last_pc_offset: usize,
    pub last_fp_offset: usize,
    /// Offset of the anchor inside an entry frame's call wrapper.
    pub call_wrapper_anchor_offset: usize,
}

impl Default for AnchorLayout {
    fn default() -> AnchorLayout {
        AnchorLayout {
            last_sp_offset: 0,
            last_pc_offset: 8,
            last_fp_offset: 16,
            call_wrapper_anchor_offset: 0x20,
        }
    }
}

fn default_pointer_size() -> usize {
    8
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmLayout {
    #[serde(default = "default_pointer_size")]
    pub pointer_size: usize,
    pub interpreter: CodeRange,
    pub code_cache: CodeRange,
    #[serde(default)]
    pub code_blobs: Vec<CodeBlob>,
    /// The address managed code returns to when it leaves an entry frame.
    #[serde(default)]
    pub call_stub_return_address: Option<usize>,
    /// Whether the runtime runs with the fast compiler that keeps no usable frame-pointer chain
    /// metadata to repair.
    #[serde(default)]
    pub frame_pointer_omitting_compiler: bool,
    #[serde(default)]
    pub frame: FrameSlots,
    #[serde(default)]
    pub method: MethodLayout,
    #[serde(default)]
    pub anchor: AnchorLayout,
}

impl VmLayout {
    pub fn new(interpreter: CodeRange, code_cache: CodeRange) -> VmLayout {
        VmLayout {
            pointer_size: default_pointer_size(),
            interpreter,
            code_cache,
            code_blobs: Vec::new(),
            call_stub_return_address: None,
            frame_pointer_omitting_compiler: false,
            frame: FrameSlots::default(),
            method: MethodLayout::default(),
            anchor: AnchorLayout::default(),
        }
    }

    pub fn validate(&self) -> Result<(), LayoutError> {
        if self.pointer_size != 4 && self.pointer_size != 8 {
            return Err(LayoutError::PointerSize(self.pointer_size));
        }
        self.interpreter.check("interpreter")?;
        self.code_cache.check("code cache")?;
        for blob in &self.code_blobs {
            let range = CodeRange {
                start: blob.start,
                end: blob.end,
            };
            range.check("code blob")?;
            if blob.start < self.code_cache.start || blob.end > self.code_cache.end {
                return Err(LayoutError::BlobOutsideCodeCache(
                    blob.name.clone(),
                    blob.start,
                ));
            }
            if blob.frame_size % self.pointer_size != 0 {
                return Err(LayoutError::UnalignedFrameSize(
                    blob.name.clone(),
                    blob.frame_size,
                ));
            }
        }
        Ok(())
    }

    pub fn find_blob(&self, pc: Address) -> Option<&CodeBlob> {
        self.code_blobs.iter().find(|blob| blob.contains(pc))
    }

    pub fn is_call_stub_return(&self, pc: Address) -> bool {
        self.call_stub_return_address == Some(pc.as_usize())
    }
}

impl CodeRegionOracle for VmLayout {
    fn is_managed_code(&self, addr: Address) -> bool {
        self.interpreter.contains(addr) || self.code_cache.contains(addr)
    }

    fn interpreter_contains(&self, addr: Address) -> bool {
        self.interpreter.contains(addr)
    }

    fn is_frame_pointer_omitting_compiler_mode(&self) -> bool {
        self.frame_pointer_omitting_compiler
    }

    fn pointer_size(&self) -> usize {
        self.pointer_size
    }
}
