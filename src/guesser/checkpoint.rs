use super::{CodeRegionOracle, CurrentFrameGuesser, FramePlatform, ManagedThread};
use crate::core::types::{Checkpoint, Guess, GuessResult, MaybeAddress};

impl<'a, O, P, T> CurrentFrameGuesser<'a, O, P, T>
where
    O: CodeRegionOracle,
    P: FramePlatform,
    T: ManagedThread,
{
    /// Falls back to the SP/FP the thread recorded when it last left managed code. No pc was
    /// recorded with them, so the result never has one.
    pub(super) fn last_checkpoint(&self) -> Guess {
        match self.thread.checkpoint() {
            Ok(Checkpoint { sp: Some(sp), fp }) => {
                debug!(
                    "choosing last managed frame: sp = {}, fp = {}",
                    sp,
                    MaybeAddress(fp)
                );
                Guess::found(GuessResult::new(Some(sp), fp, None))
            }
            Ok(_) => {
                debug!("thread has no last managed frame");
                Guess::failed(GuessResult::default())
            }
            Err(e) => {
                debug!("couldn't read the thread's last managed frame: {}", e);
                Guess::failed(GuessResult::default())
            }
        }
    }
}
