//! Scripted collaborators for exercising the guesser without a real frame layout.

use std::cell::RefCell;
use std::collections::HashMap;
use std::ops::Range;
use std::rc::Rc;

use super::{CodeRegionOracle, FrameKind, FramePlatform, FrameView, ManagedThread, Method, RegisterMap};
use crate::core::types::{Address, Checkpoint, FrameError, MemoryCopyError, RegisterSnapshot};

pub const INTERPRETER_PC: usize = 0x10100;
pub const COMPILED_PC: usize = 0x20100;
pub const NATIVE_PC: usize = 0x7f00_0000_1000;

pub fn addr(raw: usize) -> Address {
    Address::new(raw).unwrap()
}

pub fn registers(sp: usize, fp: Option<usize>, pc: Option<usize>) -> RegisterSnapshot {
    RegisterSnapshot {
        sp: Address::new(sp),
        fp: fp.and_then(Address::new),
        pc: pc.and_then(Address::new),
        return_value: None,
    }
}

pub struct MockOracle {
    pub interpreter: Range<usize>,
    pub code_cache: Range<usize>,
    pub frame_pointer_omitting: bool,
}

impl MockOracle {
    pub fn new() -> MockOracle {
        MockOracle {
            interpreter: 0x10000..0x11000,
            code_cache: 0x20000..0x30000,
            frame_pointer_omitting: false,
        }
    }
}

impl CodeRegionOracle for MockOracle {
    fn is_managed_code(&self, addr: Address) -> bool {
        self.interpreter_contains(addr) || self.code_cache.contains(&addr.as_usize())
    }

    fn interpreter_contains(&self, addr: Address) -> bool {
        self.interpreter.contains(&addr.as_usize())
    }

    fn is_frame_pointer_omitting_compiler_mode(&self) -> bool {
        self.frame_pointer_omitting
    }

    fn pointer_size(&self) -> usize {
        8
    }
}

/// What a frame at a given SP answers when asked.
#[derive(Debug, Clone, Default)]
pub struct MockFrame {
    sp: usize,
    method: Option<(usize, usize)>,
    bcp: Option<usize>,
    sender_pc: Option<usize>,
    sender_sp: Option<usize>,
    saved_link: Option<usize>,
    entry: bool,
    first_entry: bool,
    sender: Option<usize>,
}

impl MockFrame {
    pub fn at(sp: usize) -> MockFrame {
        MockFrame {
            sp,
            ..MockFrame::default()
        }
    }

    pub fn with_method(mut self, bytecode_start: usize, code_size: usize) -> MockFrame {
        self.method = Some((bytecode_start, code_size));
        self
    }

    pub fn with_bcp(mut self, bcp: usize) -> MockFrame {
        self.bcp = Some(bcp);
        self
    }

    pub fn with_sender_pc(mut self, pc: usize) -> MockFrame {
        self.sender_pc = Some(pc);
        self
    }

    pub fn with_sender_sp(mut self, sp: usize) -> MockFrame {
        self.sender_sp = Some(sp);
        self
    }

    pub fn with_saved_link(mut self, fp: usize) -> MockFrame {
        self.saved_link = Some(fp);
        self
    }

    /// The frame `sender()` unwinds to.
    pub fn with_sender(mut self, sp: usize) -> MockFrame {
        self.sender = Some(sp);
        self
    }

    pub fn entry(mut self) -> MockFrame {
        self.entry = true;
        self
    }

    pub fn first_entry(mut self) -> MockFrame {
        self.entry = true;
        self.first_entry = true;
        self
    }
}

#[derive(Default)]
struct MockState {
    frames: HashMap<usize, MockFrame>,
    words: HashMap<usize, usize>,
    constructed: RefCell<Vec<usize>>,
    unwound: RefCell<Vec<usize>>,
}

pub struct MockPlatform {
    state: Rc<MockState>,
}

impl MockPlatform {
    pub fn new() -> MockPlatform {
        MockPlatform {
            state: Rc::new(MockState::default()),
        }
    }

    fn state_mut(&mut self) -> &mut MockState {
        Rc::get_mut(&mut self.state).expect("mock platform is still borrowed by a frame")
    }

    pub fn add(&mut self, frame: MockFrame) {
        self.state_mut().frames.insert(frame.sp, frame);
    }

    pub fn add_word(&mut self, addr: usize, value: usize) {
        self.state_mut().words.insert(addr, value);
    }

    /// SPs passed to `frame()`, in order.
    pub fn constructed(&self) -> Vec<usize> {
        self.state.constructed.borrow().clone()
    }

    /// SPs of the frames `sender()` was called on, in order.
    pub fn unwound(&self) -> Vec<usize> {
        self.state.unwound.borrow().clone()
    }

    pub fn reset(&self) {
        self.state.constructed.borrow_mut().clear();
        self.state.unwound.borrow_mut().clear();
    }
}

impl FramePlatform for MockPlatform {
    type Frame = MockView;

    fn frame(
        &self,
        sp: Address,
        fp: Option<Address>,
        pc: Option<Address>,
    ) -> Result<MockView, FrameError> {
        self.state.constructed.borrow_mut().push(sp.as_usize());
        let script = self
            .state
            .frames
            .get(&sp.as_usize())
            .cloned()
            .ok_or(MemoryCopyError::InvalidAddressError(sp.as_usize()))?;
        Ok(MockView {
            script,
            fp,
            pc,
            state: self.state.clone(),
        })
    }

    fn read_address(&self, addr: Address) -> Result<Option<Address>, FrameError> {
        match self.state.words.get(&addr.as_usize()) {
            Some(word) => Ok(Address::new(*word)),
            None => Err(MemoryCopyError::InvalidAddressError(addr.as_usize()).into()),
        }
    }
}

pub struct MockView {
    script: MockFrame,
    fp: Option<Address>,
    pc: Option<Address>,
    state: Rc<MockState>,
}

impl FrameView for MockView {
    fn sp(&self) -> Address {
        addr(self.script.sp)
    }

    fn fp(&self) -> Option<Address> {
        self.fp
    }

    fn pc(&self) -> Option<Address> {
        self.pc
    }

    fn kind(&self) -> FrameKind {
        if self.script.entry {
            FrameKind::Entry
        } else {
            FrameKind::Compiled
        }
    }

    fn interpreter_method(&self) -> Result<Method, FrameError> {
        let (start, code_size) = self.script.method.ok_or(FrameError::NullPointer("method"))?;
        Ok(Method {
            address: addr(start - 0x1000),
            bytecode_start: addr(start),
            code_size,
        })
    }

    fn interpreter_bcp(&self) -> Result<Option<Address>, FrameError> {
        Ok(self.script.bcp.and_then(Address::new))
    }

    fn sender_pc(&self) -> Result<Option<Address>, FrameError> {
        self.script
            .sender_pc
            .map(Address::new)
            .ok_or(MemoryCopyError::InvalidAddressError(self.script.sp).into())
    }

    fn sender_sp(&self) -> Result<Option<Address>, FrameError> {
        Ok(self.script.sender_sp.and_then(Address::new))
    }

    fn saved_link(&self) -> Result<Option<Address>, FrameError> {
        Ok(self.script.saved_link.and_then(Address::new))
    }

    fn is_first_entry_frame(&self) -> Result<bool, FrameError> {
        Ok(self.script.first_entry)
    }

    fn sender(&self, _map: &mut RegisterMap) -> Result<MockView, FrameError> {
        self.state.unwound.borrow_mut().push(self.script.sp);
        let sender_sp = self.script.sender.ok_or(FrameError::NullPointer("sender"))?;
        let script = self
            .state
            .frames
            .get(&sender_sp)
            .cloned()
            .unwrap_or_else(|| MockFrame::at(sender_sp));
        Ok(MockView {
            script,
            fp: self.script.saved_link.and_then(Address::new),
            pc: self.script.sender_pc.and_then(Address::new),
            state: self.state.clone(),
        })
    }
}

pub struct MockThread {
    registers: RegisterSnapshot,
    checkpoint: Checkpoint,
}

impl MockThread {
    pub fn new(registers: RegisterSnapshot) -> MockThread {
        MockThread {
            registers,
            checkpoint: Checkpoint::default(),
        }
    }

    pub fn with_checkpoint(mut self, sp: Option<usize>, fp: Option<usize>) -> MockThread {
        self.checkpoint = Checkpoint {
            sp: sp.and_then(Address::new),
            fp: fp.and_then(Address::new),
        };
        self
    }
}

impl ManagedThread for MockThread {
    fn registers(&self) -> &RegisterSnapshot {
        &self.registers
    }

    fn checkpoint(&self) -> Result<Checkpoint, FrameError> {
        Ok(self.checkpoint)
    }
}
