use std::fmt;

use crate::core::types::{Address, FrameError, GuessResult, MaybeAddress};
use crate::guesser::{FrameKind, FramePlatform, FrameView, RegisterMap};

/// Default number of frames a walk reports before giving up.
pub const DEFAULT_MAX_FRAMES: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WalkedFrame {
    pub sp: Address,
    pub fp: Option<Address>,
    pub pc: Option<Address>,
    pub kind: FrameKind,
}

impl fmt::Display for WalkedFrame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:<11} sp = {}, fp = {}, pc = {}",
            self.kind.to_string(),
            self.sp,
            MaybeAddress(self.fp),
            MaybeAddress(self.pc)
        )
    }
}

/// Why a walk ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WalkStop {
    FirstEntryFrame,
    /// A sender's SP was not above its callee's.
    NoProgress,
    /// Target memory needed for the next frame could not be read or made no sense.
    Unreadable,
    FrameLimit,
}

impl fmt::Display for WalkStop {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let reason = match self {
            WalkStop::FirstEntryFrame => "reached the first entry frame",
            WalkStop::NoProgress => "sender's stack pointer did not advance",
            WalkStop::Unreadable => "couldn't read the next frame",
            WalkStop::FrameLimit => "frame limit reached",
        };
        write!(f, "{}", reason)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StackWalk {
    pub frames: Vec<WalkedFrame>,
    pub stop: WalkStop,
}

fn walked<F: FrameView>(frame: &F) -> WalkedFrame {
    WalkedFrame {
        sp: frame.sp(),
        fp: frame.fp(),
        pc: frame.pc(),
        kind: frame.kind(),
    }
}

/// Walks the sender chain starting at a guessed frame, for display. Only building the first
/// frame can fail; anything that goes wrong further up ends the walk instead.
pub fn walk<P: FramePlatform>(
    platform: &P,
    guess: &GuessResult,
    max_frames: usize,
) -> Result<StackWalk, FrameError> {
    let sp = guess
        .sp
        .ok_or(FrameError::NullPointer("guessed stack pointer"))?;
    let mut frame = platform.frame(sp, guess.fp, guess.pc)?;
    let mut map = RegisterMap::new();
    let mut frames = Vec::new();

    let stop = loop {
        frames.push(walked(&frame));

        if frame.is_entry_frame() {
            match frame.is_first_entry_frame() {
                Ok(true) => break WalkStop::FirstEntryFrame,
                Ok(false) => {}
                Err(e) => {
                    debug!("couldn't tell whether entry frame at {} is the first: {}", frame.sp(), e);
                    break WalkStop::Unreadable;
                }
            }
        }
        if frames.len() >= max_frames {
            break WalkStop::FrameLimit;
        }

        let sender = match frame.sender(&mut map) {
            Ok(sender) => sender,
            Err(e) => {
                debug!("couldn't unwind frame at {}: {}", frame.sp(), e);
                break WalkStop::Unreadable;
            }
        };
        if sender.sp() <= frame.sp() {
            break WalkStop::NoProgress;
        }
        frame = sender;
    };

    debug!("walked {} frames: {}", frames.len(), stop);
    Ok(StackWalk { frames, stop })
}
