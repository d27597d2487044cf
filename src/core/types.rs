/// Core types used throughout frameguess: addresses, register snapshots, guess results and the
/// errors raised while reading a target's memory.
use std::convert::TryFrom;
use std::fmt;

use thiserror::Error;

/// A non-null address in the target process.
///
/// Null is never a valid `Address`; places where the target may legitimately hold a null
/// pointer use `Option<Address>` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "usize", into = "usize")]
pub struct Address(usize);

impl Address {
    pub fn new(raw: usize) -> Option<Address> {
        if raw == 0 {
            None
        } else {
            Some(Address(raw))
        }
    }

    pub fn as_usize(self) -> usize {
        self.0
    }

    /// Adds a signed byte offset. Overflow, underflow and landing on null all yield `None`.
    pub fn offset(self, bytes: isize) -> Option<Address> {
        let raw = if bytes >= 0 {
            self.0.checked_add(bytes as usize)?
        } else {
            self.0.checked_sub(bytes.unsigned_abs())?
        };
        Address::new(raw)
    }

    pub fn offset_words(self, words: isize, pointer_size: usize) -> Option<Address> {
        self.offset(words.checked_mul(pointer_size as isize)?)
    }

    pub fn is_aligned(self, align: usize) -> bool {
        align == 0 || self.0 % align == 0
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("null is not a valid address")]
pub struct NullAddress;

impl TryFrom<usize> for Address {
    type Error = NullAddress;

    fn try_from(raw: usize) -> Result<Self, Self::Error> {
        Address::new(raw).ok_or(NullAddress)
    }
}

impl From<Address> for usize {
    fn from(addr: Address) -> usize {
        addr.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::LowerHex for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Formats an optional address the way the rest of the tool prints them: hex, or `null`.
pub struct MaybeAddress(pub Option<Address>);

impl fmt::Display for MaybeAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.0 {
            Some(addr) => write!(f, "{}", addr),
            None => write!(f, "null"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Register {
    StackPointer,
    FramePointer,
    InstructionPointer,
    /// The scratch register that may hold a return address while a frame is being pushed
    /// (rax on x86-64).
    ReturnValue,
}

/// Register state captured for one suspended thread. Owned by the caller and never changed by
/// a guess.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterSnapshot {
    #[serde(default)]
    pub sp: Option<Address>,
    #[serde(default)]
    pub fp: Option<Address>,
    #[serde(default)]
    pub pc: Option<Address>,
    #[serde(default)]
    pub return_value: Option<Address>,
}

impl RegisterSnapshot {
    pub fn get(&self, register: Register) -> Option<Address> {
        match register {
            Register::StackPointer => self.sp,
            Register::FramePointer => self.fp,
            Register::InstructionPointer => self.pc,
            Register::ReturnValue => self.return_value,
        }
    }
}

/// The SP/FP/PC triple a guess settled on. Any field may be unknown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuessResult {
    pub sp: Option<Address>,
    pub fp: Option<Address>,
    pub pc: Option<Address>,
}

impl GuessResult {
    pub fn new(sp: Option<Address>, fp: Option<Address>, pc: Option<Address>) -> GuessResult {
        GuessResult { sp, fp, pc }
    }
}

impl fmt::Display for GuessResult {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "sp = {}, fp = {}, pc = {}",
            MaybeAddress(self.sp),
            MaybeAddress(self.fp),
            MaybeAddress(self.pc)
        )
    }
}

/// Outcome of a guess or of one of its fallback tiers. `result` is filled in even on failure,
/// but then only describes what was being looked at and must not be treated as a real frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Guess {
    pub success: bool,
    pub result: GuessResult,
}

impl Guess {
    pub fn found(result: GuessResult) -> Guess {
        Guess {
            success: true,
            result,
        }
    }

    pub fn failed(result: GuessResult) -> Guess {
        Guess {
            success: false,
            result,
        }
    }
}

/// The SP/FP a thread recorded when it last left managed code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(default)]
    pub sp: Option<Address>,
    #[serde(default)]
    pub fp: Option<Address>,
}

#[derive(Error, Debug)]
pub enum MemoryCopyError {
    #[error("Permission denied when reading from process. If you're not running as root, try again with sudo. If you're using Docker, try passing `--cap-add=SYS_PTRACE` to `docker run`")]
    PermissionDenied,
    #[error("Failed to copy memory address {:x}", _0)]
    Io(usize, std::io::Error),
    #[error("Process isn't running")]
    ProcessEnded,
    #[error("Copy error: {}", _0)]
    Message(String),
    #[error("Too much memory requested when copying: {}", _0)]
    RequestTooLarge(usize),
    #[error("Tried to read invalid memory address {:x}", _0)]
    InvalidAddressError(usize),
    #[error("Tried to read {} bytes at misaligned address {:x}", _1, _0)]
    Misaligned(usize, usize),
}

impl MemoryCopyError {
    /// Maps an OS error from a failed cross-process read onto the cases callers care about.
    pub fn from_os_error(addr: usize, error: std::io::Error) -> MemoryCopyError {
        if error.kind() == std::io::ErrorKind::PermissionDenied {
            return MemoryCopyError::PermissionDenied;
        }

        match error.raw_os_error() {
            /* On Mac, 60 seems to correspond to the process ended */
            /* On Windows, 299 happens when the process ended */
            Some(3) | Some(60) | Some(299) => MemoryCopyError::ProcessEnded,
            // On *nix EFAULT means that the address was invalid
            Some(14) => MemoryCopyError::InvalidAddressError(addr),
            _ => MemoryCopyError::Io(addr, error),
        }
    }
}

/// Reasons a candidate frame could not be interpreted. None of these are fatal to a guess: they
/// only mean "this candidate is not usable".
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("address error: {0}")]
    Address(#[from] MemoryCopyError),
    #[error("type mismatch at {addr}: expected {expected:#x}, found {found:#x}")]
    TypeMismatch {
        addr: Address,
        expected: usize,
        found: usize,
    },
    #[error("null {0}")]
    NullPointer(&'static str),
    #[error("{0} is out of the address space")]
    OutOfRange(&'static str),
}
