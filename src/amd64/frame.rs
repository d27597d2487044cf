use crate::amd64::Amd64Platform;
use crate::core::layout::VmLayout;
use crate::core::memory::TargetMemory;
use crate::core::types::{Address, FrameError, MaybeAddress};
use crate::guesser::{CodeRegionOracle, FrameKind, FrameView, Method, RegisterMap};

/// An rbp-chained x86-64 frame over target memory.
///
/// `unextended_sp` differs from `sp` only for frames whose caller is the interpreter, which may
/// have extended the caller's stack to pass arguments.
pub struct Amd64Frame<'a, M> {
    platform: Amd64Platform<'a, M>,
    sp: Address,
    unextended_sp: Address,
    fp: Option<Address>,
    pc: Address,
    kind: FrameKind,
    frame_size: usize,
}

impl<'a, M: TargetMemory> Amd64Frame<'a, M> {
    /// Builds a frame. Without a pc, the return address just below `sp` is used, which is what
    /// the last call left there.
    pub fn new(
        platform: Amd64Platform<'a, M>,
        sp: Address,
        unextended_sp: Address,
        fp: Option<Address>,
        pc: Option<Address>,
    ) -> Result<Amd64Frame<'a, M>, FrameError> {
        let pc = match pc {
            Some(pc) => pc,
            None => {
                let slot = sp
                    .offset_words(-1, platform.layout.pointer_size)
                    .ok_or(FrameError::OutOfRange("return address slot"))?;
                platform
                    .read(slot)?
                    .ok_or(FrameError::NullPointer("return address"))?
            }
        };

        let layout = platform.layout;
        let (kind, frame_size) = if layout.is_call_stub_return(pc) {
            (FrameKind::Entry, 0)
        } else if layout.interpreter_contains(pc) {
            (FrameKind::Interpreted, 0)
        } else if let Some(blob) = layout.find_blob(pc) {
            (FrameKind::Compiled, blob.frame_size)
        } else {
            (FrameKind::Native, 0)
        };

        Ok(Amd64Frame {
            platform,
            sp,
            unextended_sp,
            fp,
            pc,
            kind,
            frame_size,
        })
    }

    fn layout(&self) -> &'a VmLayout {
        self.platform.layout
    }

    fn word_size(&self) -> usize {
        self.layout().pointer_size
    }

    /// Address of the frame slot `words` words away from fp.
    fn slot(&self, words: isize) -> Result<Address, FrameError> {
        self.fp
            .ok_or(FrameError::NullPointer("frame pointer"))?
            .offset_words(words, self.word_size())
            .ok_or(FrameError::OutOfRange("frame slot"))
    }

    fn read_slot(&self, words: isize) -> Result<Option<Address>, FrameError> {
        self.platform.read(self.slot(words)?)
    }

    fn call_wrapper_anchor(&self) -> Result<Address, FrameError> {
        let wrapper = self
            .read_slot(self.layout().frame.entry_call_wrapper)?
            .ok_or(FrameError::NullPointer("call wrapper"))?;
        wrapper
            .offset(self.layout().anchor.call_wrapper_anchor_offset as isize)
            .ok_or(FrameError::OutOfRange("call wrapper anchor"))
    }

    fn sender_for_entry_frame(&self, map: &mut RegisterMap) -> Result<Self, FrameError> {
        map.clear();
        let anchor = self.platform.read_anchor(self.call_wrapper_anchor()?)?;
        let sp = anchor
            .sp
            .ok_or(FrameError::NullPointer("entry frame's last managed sp"))?;
        Amd64Frame::new(self.platform, sp, sp, anchor.fp, anchor.pc)
    }

    fn sender_for_interpreter_frame(&self, map: &mut RegisterMap) -> Result<Self, FrameError> {
        let frame = self.layout().frame;
        let sender_sp = self.slot(frame.sender_sp)?;
        let unextended_sp = self
            .read_slot(frame.interpreter_sender_sp)?
            .unwrap_or(sender_sp);
        self.sender_via_link(map, sender_sp, unextended_sp)
    }

    fn sender_for_compiled_frame(&self, map: &mut RegisterMap) -> Result<Self, FrameError> {
        let word = self.word_size();
        let sender_sp = self
            .unextended_sp
            .offset(self.frame_size as isize)
            .ok_or(FrameError::OutOfRange("compiled sender sp"))?;
        let return_address = sender_sp
            .offset_words(-1, word)
            .ok_or(FrameError::OutOfRange("return address slot"))?;
        let saved_fp = sender_sp
            .offset_words(-2, word)
            .ok_or(FrameError::OutOfRange("saved fp slot"))?;

        let pc = self.platform.read(return_address)?;
        map.set_link_location(saved_fp);
        let fp = self.platform.read(saved_fp)?;
        Amd64Frame::new(self.platform, sender_sp, sender_sp, fp, pc)
    }

    /// Unwinds through the saved frame pointer and return address next to it.
    fn sender_via_link(
        &self,
        map: &mut RegisterMap,
        sender_sp: Address,
        unextended_sp: Address,
    ) -> Result<Self, FrameError> {
        let frame = self.layout().frame;
        let link = self.slot(frame.link)?;
        map.set_link_location(link);
        let fp = self.platform.read(link)?;
        let pc = self.read_slot(frame.return_addr)?;
        Amd64Frame::new(self.platform, sender_sp, unextended_sp, fp, pc)
    }
}

impl<'a, M: TargetMemory> FrameView for Amd64Frame<'a, M> {
    fn sp(&self) -> Address {
        self.sp
    }

    fn fp(&self) -> Option<Address> {
        self.fp
    }

    fn pc(&self) -> Option<Address> {
        Some(self.pc)
    }

    fn kind(&self) -> FrameKind {
        self.kind
    }

    fn interpreter_method(&self) -> Result<Method, FrameError> {
        let layout = self.layout();
        let method = self
            .read_slot(layout.frame.interpreter_method)?
            .ok_or(FrameError::NullPointer("method"))?;

        if let Some(expected) = layout.method.vtable {
            let found = self.platform.memory.read_word(method, self.word_size())?;
            if found != expected {
                return Err(FrameError::TypeMismatch {
                    addr: method,
                    expected,
                    found,
                });
            }
        }

        let const_method = method
            .offset(layout.method.const_method_offset as isize)
            .ok_or(FrameError::OutOfRange("const method field"))?;
        let const_method = self
            .platform
            .read(const_method)?
            .ok_or(FrameError::NullPointer("const method"))?;
        let code_size = const_method
            .offset(layout.method.code_size_offset as isize)
            .ok_or(FrameError::OutOfRange("code size field"))?;
        let code_size = self.platform.memory.read_u16(code_size)? as usize;
        let bytecode_start = const_method
            .offset(layout.method.const_method_size as isize)
            .ok_or(FrameError::OutOfRange("bytecodes"))?;

        Ok(Method {
            address: method,
            bytecode_start,
            code_size,
        })
    }

    fn interpreter_bcp(&self) -> Result<Option<Address>, FrameError> {
        self.read_slot(self.layout().frame.interpreter_bcp)
    }

    fn sender_pc(&self) -> Result<Option<Address>, FrameError> {
        self.read_slot(self.layout().frame.return_addr)
    }

    fn sender_sp(&self) -> Result<Option<Address>, FrameError> {
        Ok(Some(self.slot(self.layout().frame.sender_sp)?))
    }

    fn saved_link(&self) -> Result<Option<Address>, FrameError> {
        self.read_slot(self.layout().frame.link)
    }

    fn is_first_entry_frame(&self) -> Result<bool, FrameError> {
        if self.kind != FrameKind::Entry {
            return Ok(false);
        }
        let anchor = self.platform.read_anchor(self.call_wrapper_anchor()?)?;
        Ok(anchor.sp.is_none())
    }

    fn sender(&self, map: &mut RegisterMap) -> Result<Self, FrameError> {
        let sender = match self.kind {
            FrameKind::Entry => self.sender_for_entry_frame(map),
            FrameKind::Interpreted => self.sender_for_interpreter_frame(map),
            FrameKind::Compiled => self.sender_for_compiled_frame(map),
            FrameKind::Native => {
                let sender_sp = self.slot(self.layout().frame.sender_sp)?;
                self.sender_via_link(map, sender_sp, sender_sp)
            }
        }?;
        trace!(
            "{} frame sp = {} unwound to {} frame sp = {}, fp = {}, pc = {}",
            self.kind,
            self.sp,
            sender.kind,
            sender.sp,
            MaybeAddress(sender.fp),
            sender.pc
        );
        Ok(sender)
    }
}

impl<'a, M: TargetMemory> std::fmt::Debug for Amd64Frame<'a, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Amd64Frame")
            .field("sp", &self.sp)
            .field("unextended_sp", &self.unextended_sp)
            .field("fp", &self.fp)
            .field("pc", &self.pc)
            .field("kind", &self.kind)
            .finish()
    }
}
