use super::{
    available, CodeRegionOracle, CurrentFrameGuesser, FramePlatform, FrameView, ManagedThread,
};
use crate::core::types::{Address, Guess, GuessResult, Register};

impl<'a, O, P, T> CurrentFrameGuesser<'a, O, P, T>
where
    O: CodeRegionOracle,
    P: FramePlatform,
    T: ManagedThread,
{
    /// Checks whether (sp, fp, pc) with pc in the interpreter describes a complete interpreter
    /// frame. The frame may instead be
    ///
    ///   * pushed, with SP already adjusted but the header not yet written, in which case the
    ///     sender is the most recent frame we can trust, or
    ///   * not pushed at all, in which case pc's caller is the real pc.
    ///
    /// On failure the returned result is the best correction we could make, for the caller to
    /// carry on from.
    pub(super) fn validate_interpreter_frame(
        &self,
        sp: Address,
        fp: Option<Address>,
        pc: Address,
    ) -> Guess {
        let as_given = GuessResult::new(Some(sp), fp, Some(pc));
        let frame = available("interpreter frame", self.platform.frame(sp, fp, Some(pc)));

        if let Some(frame) = &frame {
            if let Some(method) = available("frame method", frame.interpreter_method()) {
                match available("frame bcp", frame.interpreter_bcp()).flatten() {
                    Some(bcp) if method.contains_bcp(bcp) => {
                        debug!("interpreter frame at sp = {} is valid", sp);
                        return Guess::found(as_given);
                    }
                    bcp => debug!(
                        "bcp {:?} is outside the bytecodes of method at {}",
                        bcp, method.address
                    ),
                }
            }
        }

        let return_address = match self.return_address_candidate(sp) {
            Some(addr) => addr,
            None => {
                debug!("no return address candidate at sp = {}", sp);
                return Guess::failed(as_given);
            }
        };

        let sender_pc = frame
            .as_ref()
            .and_then(|f| available("sender pc", f.sender_pc()))
            .flatten();

        if sender_pc != Some(return_address) {
            // Not pushed yet: we are still in the caller, which returns to the candidate.
            debug!(
                "frame at sp = {} not pushed yet, caller pc = {}",
                sp, return_address
            );
            return Guess::failed(GuessResult::new(Some(sp), fp, Some(return_address)));
        }

        // Pushed but not initialized: report the sender.
        let (sender_sp, link) = match &frame {
            Some(frame) => (
                available("sender sp", frame.sender_sp()).flatten(),
                available("saved link", frame.saved_link()).flatten(),
            ),
            None => (None, None),
        };
        let sender = GuessResult::new(sender_sp, link, Some(return_address));
        debug!("frame at sp = {} pushed but not initialized, sender {}", sp, sender);
        if sender_sp.is_some() && self.oracle.interpreter_contains(return_address) {
            Guess::found(sender)
        } else {
            Guess::failed(sender)
        }
    }

    /// The return address of a frame that may be mid-push: the scratch register if it points
    /// into managed code, otherwise the word on top of the stack if that does.
    fn return_address_candidate(&self, sp: Address) -> Option<Address> {
        let registers = self.thread.registers();
        if let Some(addr) = registers.get(Register::ReturnValue) {
            if self.oracle.is_managed_code(addr) {
                return Some(addr);
            }
        }
        available("top of stack", self.platform.read_address(sp))
            .flatten()
            .filter(|addr| self.oracle.is_managed_code(*addr))
    }
}
