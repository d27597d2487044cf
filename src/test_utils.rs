// Synthetic targets for use in tests :-)
//
// All stacks live in one 0x200-byte segment at 0x8000 and use 8-byte words. The runtime has its
// interpreter at 0x10000..0x11000 and its code cache at 0x20000..0x30000, with one compiled
// method whose frames are 0x30 bytes.

use crate::core::layout::{CodeBlob, CodeRange, VmLayout};
use crate::core::memory::MemorySnapshot;
use crate::core::types::{Address, RegisterSnapshot};

pub const INTERPRETER_PC: usize = 0x10100;
pub const COMPILED_PC: usize = 0x20100;
pub const CALL_STUB_RETURN: usize = 0x21080;
pub const NATIVE_PC: usize = 0x7f00_0000_1000;

pub const STACK_BASE: usize = 0x8000;
pub const ENTRY_FP: usize = 0x8100;
pub const CALL_WRAPPER: usize = 0x9000;
pub const METHOD: usize = 0x40000;
pub const CONST_METHOD: usize = 0x41000;

pub fn addr(raw: usize) -> Address {
    Address::new(raw).unwrap()
}

pub fn addr_opt(raw: usize) -> Option<Address> {
    Address::new(raw)
}

pub fn regs(sp: usize, fp: Option<usize>, pc: Option<usize>) -> RegisterSnapshot {
    RegisterSnapshot {
        sp: Address::new(sp),
        fp: fp.and_then(Address::new),
        pc: pc.and_then(Address::new),
        return_value: None,
    }
}

pub fn layout() -> VmLayout {
    let mut layout = VmLayout::new(
        CodeRange {
            start: 0x10000,
            end: 0x11000,
        },
        CodeRange {
            start: 0x20000,
            end: 0x30000,
        },
    );
    layout.code_blobs.push(CodeBlob {
        name: "compiled".to_string(),
        start: 0x20000,
        end: 0x20800,
        frame_size: 0x30,
    });
    layout.call_stub_return_address = Some(CALL_STUB_RETURN);
    layout
}

/// An empty stack.
pub fn stack() -> MemorySnapshot {
    let mut memory = MemorySnapshot::new();
    memory.add_words(STACK_BASE, &[0; 64], 8).unwrap();
    memory
}

/// An interpreter frame at sp = 0x8000, fp = 0x8040 whose method has 0x20 bytes of bytecode and
/// whose bcp points 8 bytes into them.
pub fn interpreted_stack() -> MemorySnapshot {
    let mut memory = stack();
    // fp - 3 words
    memory.write_word(0x8028, METHOD as u64, 8).unwrap();
    // fp - 8 words
    memory.write_word(0x8000, (CONST_METHOD + 0x40) as u64, 8).unwrap();
    memory.add_words(METHOD, &[0, CONST_METHOD as u64], 8).unwrap();
    memory.add_words(CONST_METHOD, &[0; 12], 8).unwrap();
    memory.write_bytes(CONST_METHOD + 0x2c, &0x20u16.to_le_bytes()).unwrap();
    memory
}

/// A compiled frame at sp = 0x8010 called from the thread's first entry frame, which sits at
/// sp = 0x8040 with fp = 0x8100.
pub fn compiled_stack() -> MemorySnapshot {
    let mut memory = stack();
    memory.write_word(0x8030, ENTRY_FP as u64, 8).unwrap();
    memory.write_word(0x8038, CALL_STUB_RETURN as u64, 8).unwrap();
    // the entry frame's call wrapper, fp - 6 words
    memory.write_word(0x80d0, CALL_WRAPPER as u64, 8).unwrap();
    // its anchor has no last managed sp: nothing older to go back to
    memory.add_words(CALL_WRAPPER, &[0; 8], 8).unwrap();
    memory
}
