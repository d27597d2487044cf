/*
 * Guessing the current frame of a suspended thread.
 *
 * The register state of a thread stopped at an arbitrary instruction does not always describe a
 * frame we can walk: the interpreter may be halfway through pushing a frame, compiled code does
 * not keep a frame pointer, and the thread may be off in native code altogether. The guesser
 * tries, in order:
 *
 *   * trusting the registers outright (fast-compiler mode),
 *   * validating and, if needed, repairing an interpreter frame (`interpreter`),
 *   * scanning up the stack for an SP from which the sender chain reaches the thread's first
 *     entry frame (`scan`),
 *   * falling back to the SP/FP the thread recorded when it last left managed code
 *     (`checkpoint`).
 *
 * Nothing here knows about a particular architecture: frame layout is behind `FramePlatform` and
 * `FrameView`, and everything about the runtime's code regions is behind `CodeRegionOracle`.
 */
mod checkpoint;
mod interpreter;
mod scan;

#[cfg(test)]
pub(crate) mod mock;

use std::fmt;

use crate::core::types::{
    Address, Checkpoint, FrameError, Guess, GuessResult, MaybeAddress, Register, RegisterSnapshot,
};

/// How far above the register SP a display guess looks for a usable frame.
pub const DEFAULT_SEARCH_BYTES: usize = 128 * 1024;

pub trait CodeRegionOracle {
    /// Interpreter or compiled code generated by the runtime.
    fn is_managed_code(&self, addr: Address) -> bool;
    fn interpreter_contains(&self, addr: Address) -> bool;
    fn is_frame_pointer_omitting_compiler_mode(&self) -> bool;
    fn pointer_size(&self) -> usize;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    Entry,
    Interpreted,
    Compiled,
    Native,
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            FrameKind::Entry => "entry",
            FrameKind::Interpreted => "interpreted",
            FrameKind::Compiled => "compiled",
            FrameKind::Native => "native",
        };
        write!(f, "{}", name)
    }
}

/// Method metadata read out of an interpreter frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Method {
    pub address: Address,
    pub bytecode_start: Address,
    pub code_size: usize,
}

impl Method {
    pub fn contains_bcp(&self, bcp: Address) -> bool {
        let start = self.bytecode_start.as_usize();
        let bcp = bcp.as_usize();
        bcp >= start && bcp - start < self.code_size
    }
}

/// Per-walk record of where callee-saved state was found while unwinding. A fresh map is used
/// for every starting SP the scan tries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterMap {
    link_location: Option<Address>,
}

impl RegisterMap {
    pub fn new() -> RegisterMap {
        RegisterMap::default()
    }

    /// Where the most recently unwound frame's saved frame pointer lives.
    pub fn link_location(&self) -> Option<Address> {
        self.link_location
    }

    pub fn set_link_location(&mut self, location: Address) {
        self.link_location = Some(location);
    }

    pub fn clear(&mut self) {
        self.link_location = None;
    }
}

/// A candidate frame interpreted over target memory. Constructing one reads as little as
/// possible; every accessor that needs target memory can fail.
pub trait FrameView: Sized {
    fn sp(&self) -> Address;
    fn fp(&self) -> Option<Address>;
    fn pc(&self) -> Option<Address>;
    fn kind(&self) -> FrameKind;

    fn interpreter_method(&self) -> Result<Method, FrameError>;
    fn interpreter_bcp(&self) -> Result<Option<Address>, FrameError>;
    /// The return address this frame's layout says it would return to.
    fn sender_pc(&self) -> Result<Option<Address>, FrameError>;
    fn sender_sp(&self) -> Result<Option<Address>, FrameError>;
    /// The caller's frame pointer as saved by this frame.
    fn saved_link(&self) -> Result<Option<Address>, FrameError>;

    fn is_entry_frame(&self) -> bool {
        self.kind() == FrameKind::Entry
    }

    /// Whether this entry frame is the bottom of the thread's managed call chain.
    fn is_first_entry_frame(&self) -> Result<bool, FrameError>;

    fn sender(&self, map: &mut RegisterMap) -> Result<Self, FrameError>;
}

/// Builds frames for one architecture.
pub trait FramePlatform {
    type Frame: FrameView;

    fn frame(
        &self,
        sp: Address,
        fp: Option<Address>,
        pc: Option<Address>,
    ) -> Result<Self::Frame, FrameError>;

    /// Reads one word of target memory, such as the slot at the top of the stack.
    fn read_address(&self, addr: Address) -> Result<Option<Address>, FrameError>;
}

/// The suspended thread being guessed about.
pub trait ManagedThread {
    fn registers(&self) -> &RegisterSnapshot;
    fn checkpoint(&self) -> Result<Checkpoint, FrameError>;
}

/// Downgrades a failed read to "unavailable", logging what was lost.
fn available<T>(what: &str, result: Result<T, FrameError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            debug!("{} unavailable: {}", what, e);
            None
        }
    }
}

/// Guesses the current frame of one thread. Instances are cheap; use one per thread.
pub struct CurrentFrameGuesser<'a, O, P, T> {
    oracle: &'a O,
    platform: &'a P,
    thread: &'a T,
    found: GuessResult,
}

impl<'a, O, P, T> CurrentFrameGuesser<'a, O, P, T>
where
    O: CodeRegionOracle,
    P: FramePlatform,
    T: ManagedThread,
{
    pub fn new(oracle: &'a O, platform: &'a P, thread: &'a T) -> Self {
        CurrentFrameGuesser {
            oracle,
            platform,
            thread,
            found: GuessResult::default(),
        }
    }

    /// Runs a guess, searching at most `max_bytes` of stack above the register SP, and keeps
    /// its result for `sp()`, `fp()` and `pc()`. Returns whether the result is trustworthy.
    pub fn guess(&mut self, max_bytes: usize) -> bool {
        self.found = GuessResult::default();
        let guess = self.guess_frame(max_bytes);
        self.found = guess.result;
        guess.success
    }

    pub fn sp(&self) -> Option<Address> {
        self.found.sp
    }

    pub fn fp(&self) -> Option<Address> {
        self.found.fp
    }

    pub fn pc(&self) -> Option<Address> {
        self.found.pc
    }

    pub fn result(&self) -> GuessResult {
        self.found
    }

    /// Same as `guess`, without recording anything on `self`.
    pub fn guess_frame(&self, max_bytes: usize) -> Guess {
        let registers = self.thread.registers();
        let sp = match registers.get(Register::StackPointer) {
            Some(sp) => sp,
            None => {
                debug!("no stack pointer in register context");
                return self.last_checkpoint();
            }
        };
        let pc = registers.get(Register::InstructionPointer);
        let fp = registers.get(Register::FramePointer);
        debug!(
            "guessing frame for sp = {}, fp = {}, pc = {}, searching up to {}",
            sp,
            MaybeAddress(fp),
            MaybeAddress(pc),
            MaybeAddress(isize::try_from(max_bytes).ok().and_then(|b| sp.offset(b)))
        );

        let pc = match pc {
            Some(pc) if self.oracle.is_managed_code(pc) => pc,
            _ => {
                debug!("pc {} is not managed code", MaybeAddress(pc));
                return self.last_checkpoint();
            }
        };

        if self.oracle.is_frame_pointer_omitting_compiler_mode() {
            // In this mode the top managed frame always comes with a usable FP.
            return Guess::found(GuessResult::new(Some(sp), fp, Some(pc)));
        }

        let (mut sp, mut pc) = (sp, pc);
        if self.oracle.interpreter_contains(pc) {
            let validated = self.validate_interpreter_frame(sp, fp, pc);
            if validated.success {
                return validated;
            }
            let corrected = validated.result;
            pc = match corrected.pc {
                None => return Guess::failed(corrected),
                Some(pc) if !self.oracle.is_managed_code(pc) => {
                    debug!("corrected pc {} is not managed code", pc);
                    return self.last_checkpoint();
                }
                Some(pc) => pc,
            };
            sp = match corrected.sp {
                Some(sp) => sp,
                None => return Guess::failed(corrected),
            };
            debug!("interpreter frame not valid, continuing from {}", corrected);
        }

        self.scan_for_entry_frame(sp, pc, max_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::mock::*;
    use super::*;

    #[test]
    fn test_method_contains_bcp() {
        let method = Method {
            address: addr(0x40000),
            bytecode_start: addr(0x41038),
            code_size: 0x20,
        };
        assert!(method.contains_bcp(addr(0x41038)));
        assert!(method.contains_bcp(addr(0x41057)));
        assert!(!method.contains_bcp(addr(0x41058)));
        assert!(!method.contains_bcp(addr(0x41030)));
    }

    #[test]
    fn test_no_stack_pointer_uses_checkpoint() {
        let oracle = MockOracle::new();
        let platform = MockPlatform::new();
        let thread = MockThread::new(RegisterSnapshot::default())
            .with_checkpoint(Some(0x2000), Some(0x2040));

        let mut guesser = CurrentFrameGuesser::new(&oracle, &platform, &thread);
        assert!(guesser.guess(64));
        assert_eq!(guesser.sp(), Some(addr(0x2000)));
        assert_eq!(guesser.fp(), Some(addr(0x2040)));
        assert_eq!(guesser.pc(), None);
        assert!(platform.constructed().is_empty());
    }

    #[test]
    fn test_unmanaged_pc_uses_checkpoint() {
        let oracle = MockOracle::new();
        let platform = MockPlatform::new();
        let thread = MockThread::new(registers(0x1000, Some(0x1040), Some(NATIVE_PC)))
            .with_checkpoint(Some(0x2000), Some(0x2040));

        let mut guesser = CurrentFrameGuesser::new(&oracle, &platform, &thread);
        assert!(guesser.guess(64));
        assert_eq!(
            guesser.result(),
            GuessResult::new(Some(addr(0x2000)), Some(addr(0x2040)), None)
        );
        // neither interpreter validation nor the scan ran
        assert!(platform.constructed().is_empty());
    }

    #[test]
    fn test_missing_pc_uses_checkpoint() {
        let oracle = MockOracle::new();
        let platform = MockPlatform::new();
        let thread = MockThread::new(registers(0x1000, Some(0x1040), None))
            .with_checkpoint(Some(0x2000), None);

        let mut guesser = CurrentFrameGuesser::new(&oracle, &platform, &thread);
        assert!(guesser.guess(64));
        assert_eq!(
            guesser.result(),
            GuessResult::new(Some(addr(0x2000)), None, None)
        );
        assert!(platform.constructed().is_empty());
    }

    #[test]
    fn test_native_pc_without_checkpoint_fails() {
        let oracle = MockOracle::new();
        let platform = MockPlatform::new();
        let thread = MockThread::new(registers(0x1000, Some(0x1040), Some(NATIVE_PC)));

        let mut guesser = CurrentFrameGuesser::new(&oracle, &platform, &thread);
        assert!(!guesser.guess(64));
        assert_eq!(guesser.result(), GuessResult::default());
    }

    #[test]
    fn test_frame_pointer_omitting_mode_trusts_registers() {
        let mut oracle = MockOracle::new();
        oracle.frame_pointer_omitting = true;
        let platform = MockPlatform::new();
        let thread = MockThread::new(registers(0x1000, Some(0x1040), Some(COMPILED_PC)));

        let mut guesser = CurrentFrameGuesser::new(&oracle, &platform, &thread);
        assert!(guesser.guess(64));
        assert_eq!(
            guesser.result(),
            GuessResult::new(Some(addr(0x1000)), Some(addr(0x1040)), Some(addr(COMPILED_PC)))
        );
        assert!(platform.constructed().is_empty());
    }

    #[test]
    fn test_valid_interpreter_frame() {
        // sp = 0x1000, fp = 0x1040, pc in the interpreter, method and bcp both good
        let oracle = MockOracle::new();
        let mut platform = MockPlatform::new();
        platform.add(
            MockFrame::at(0x1000)
                .with_method(0x41000, 0x20)
                .with_bcp(0x41010),
        );
        let thread = MockThread::new(registers(0x1000, Some(0x1040), Some(INTERPRETER_PC)));

        let mut guesser = CurrentFrameGuesser::new(&oracle, &platform, &thread);
        assert!(guesser.guess(64));
        assert_eq!(
            guesser.result(),
            GuessResult::new(
                Some(addr(0x1000)),
                Some(addr(0x1040)),
                Some(addr(INTERPRETER_PC))
            )
        );
    }

    #[test]
    fn test_pushed_frame_with_interpreted_sender() {
        // the bcp is out of range, rax holds an interpreter return address that matches the
        // frame's own sender pc: the sender is the frame to report
        let mut oracle = MockOracle::new();
        oracle.interpreter = 0x6000..0x8000;
        let mut platform = MockPlatform::new();
        platform.add(
            MockFrame::at(0x1000)
                .with_method(0x41000, 0x20)
                .with_bcp(0x50000)
                .with_sender_pc(0x7000)
                .with_sender_sp(0x1020)
                .with_saved_link(0x1038),
        );
        let mut regs = registers(0x1000, Some(0x1040), Some(0x6100));
        regs.return_value = Address::new(0x7000);
        let thread = MockThread::new(regs);

        let mut guesser = CurrentFrameGuesser::new(&oracle, &platform, &thread);
        assert!(guesser.guess(64));
        assert_eq!(
            guesser.result(),
            GuessResult::new(Some(addr(0x1020)), Some(addr(0x1038)), Some(addr(0x7000)))
        );
    }

    #[test]
    fn test_pushed_frame_with_compiled_sender_scans_from_sender() {
        let oracle = MockOracle::new();
        let mut platform = MockPlatform::new();
        platform.add(
            MockFrame::at(0x1000)
                .with_method(0x41000, 0x20)
                .with_bcp(0x50000)
                .with_sender_pc(COMPILED_PC)
                .with_sender_sp(0x1020)
                .with_saved_link(0x1038),
        );
        platform.add(MockFrame::at(0x1020).first_entry());
        let mut regs = registers(0x1000, Some(0x1040), Some(INTERPRETER_PC));
        regs.return_value = Address::new(COMPILED_PC);
        let thread = MockThread::new(regs);

        let mut guesser = CurrentFrameGuesser::new(&oracle, &platform, &thread);
        assert!(guesser.guess(64));
        // the scan starts at the sender's SP, with the sender's PC, and no FP
        assert_eq!(
            guesser.result(),
            GuessResult::new(Some(addr(0x1020)), None, Some(addr(COMPILED_PC)))
        );
        assert_eq!(platform.constructed(), vec![0x1000, 0x1020]);
    }

    #[test]
    fn test_unvalidated_frame_without_return_address_falls_through_to_scan() {
        let oracle = MockOracle::new();
        let mut platform = MockPlatform::new();
        platform.add(MockFrame::at(0x1000));
        let thread = MockThread::new(registers(0x1000, Some(0x1040), Some(INTERPRETER_PC)))
            .with_checkpoint(Some(0x3000), Some(0x3040));

        // nothing identifies a return address, so validation hands back the registers and the
        // scan runs from them without finding an entry frame
        let mut guesser = CurrentFrameGuesser::new(&oracle, &platform, &thread);
        assert!(!guesser.guess(32));
        assert_eq!(
            guesser.result(),
            GuessResult::new(Some(addr(0x1000)), None, Some(addr(INTERPRETER_PC)))
        );
        assert_eq!(
            platform.constructed(),
            vec![0x1000, 0x1000, 0x1008, 0x1010, 0x1018]
        );
    }

    #[test]
    fn test_compiled_pc_goes_straight_to_scan() {
        let oracle = MockOracle::new();
        let mut platform = MockPlatform::new();
        platform.add(MockFrame::at(0x1008).first_entry());
        let thread = MockThread::new(registers(0x1000, Some(0x1040), Some(COMPILED_PC)));

        let mut guesser = CurrentFrameGuesser::new(&oracle, &platform, &thread);
        assert!(guesser.guess(64));
        assert_eq!(
            guesser.result(),
            GuessResult::new(Some(addr(0x1008)), None, Some(addr(COMPILED_PC)))
        );
    }

    #[test]
    fn test_guess_clears_previous_result() {
        let oracle = MockOracle::new();
        let mut platform = MockPlatform::new();
        platform.add(MockFrame::at(0x1000).first_entry());
        let good = MockThread::new(registers(0x1000, None, Some(COMPILED_PC)));

        let mut guesser = CurrentFrameGuesser::new(&oracle, &platform, &good);
        assert!(guesser.guess(64));
        assert_eq!(guesser.sp(), Some(addr(0x1000)));

        let bad = MockThread::new(registers(0x1000, None, Some(NATIVE_PC)));
        let mut guesser = CurrentFrameGuesser::new(&oracle, &platform, &bad);
        guesser.found = GuessResult::new(Some(addr(0x1000)), None, None);
        assert!(!guesser.guess(64));
        assert_eq!(guesser.sp(), None);
    }

    #[test]
    fn test_guess_is_repeatable() {
        let oracle = MockOracle::new();
        let mut platform = MockPlatform::new();
        platform.add(MockFrame::at(0x1010).with_sender(0x1030));
        platform.add(MockFrame::at(0x1030).first_entry());
        let thread = MockThread::new(registers(0x1000, None, Some(COMPILED_PC)));

        let guesser = CurrentFrameGuesser::new(&oracle, &platform, &thread);
        let first = guesser.guess_frame(64);
        let first_constructed = platform.constructed();
        platform.reset();
        let second = guesser.guess_frame(64);
        assert!(first.success);
        assert_eq!(first, second);
        assert_eq!(first_constructed, platform.constructed());
    }
}
