use super::{
    CodeRegionOracle, CurrentFrameGuesser, FramePlatform, FrameView, ManagedThread, RegisterMap,
};
use crate::core::types::{Address, FrameError, Guess, GuessResult};

impl<'a, O, P, T> CurrentFrameGuesser<'a, O, P, T>
where
    O: CodeRegionOracle,
    P: FramePlatform,
    T: ManagedThread,
{
    /// Takes `pc` as given and looks for the SP that goes with it: for each word-aligned offset
    /// below `limit_bytes` above `start_sp`, builds a frame there and walks its senders. The
    /// first SP whose walk reaches the thread's first entry frame wins.
    ///
    /// Compiled frames have no frame pointer to go by, and the register SP may be mid-prologue
    /// or mid-epilogue, so the frame does not necessarily start at `start_sp`.
    pub(super) fn scan_for_entry_frame(
        &self,
        start_sp: Address,
        pc: Address,
        limit_bytes: usize,
    ) -> Guess {
        let step = self.oracle.pointer_size().max(1);
        for offset in (0..limit_bytes).step_by(step) {
            let candidate = match start_sp.offset(offset as isize) {
                Some(candidate) => candidate,
                None => break,
            };
            match self.walks_to_first_entry_frame(candidate, pc) {
                Ok(true) => {
                    debug!("choosing sp = {}, pc = {}", candidate, pc);
                    return Guess::found(GuessResult::new(Some(candidate), None, Some(pc)));
                }
                Ok(false) => {}
                Err(e) => debug!("bad sp {} at offset {:#x}: {}", candidate, offset, e),
            }
        }
        debug!(
            "no sp within {:#x} bytes of {} reaches the first entry frame",
            limit_bytes, start_sp
        );
        Guess::failed(GuessResult::new(Some(start_sp), None, Some(pc)))
    }

    fn walks_to_first_entry_frame(&self, sp: Address, pc: Address) -> Result<bool, FrameError> {
        let mut frame = self.platform.frame(sp, None, Some(pc))?;
        let mut map = RegisterMap::new();
        loop {
            if frame.is_entry_frame() && frame.is_first_entry_frame()? {
                return Ok(true);
            }
            let sender = frame.sender(&mut map)?;
            if sender.sp() <= frame.sp() {
                // A frame pointing at itself or the wrong way: this SP is no good.
                debug!(
                    "sender sp {} does not advance past {} (starting sp {})",
                    sender.sp(),
                    frame.sp(),
                    sp
                );
                return Ok(false);
            }
            frame = sender;
        }
    }
}
