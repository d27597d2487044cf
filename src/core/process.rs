use std::time::Duration;

use anyhow::{Context, Result};
pub use remoteprocess::{Pid, Process};

pub trait ProcessRetry {
    fn new_with_retry(pid: Pid, retries: u32) -> Result<Process>;
}

impl ProcessRetry for remoteprocess::Process {
    // A debugger that has just suspended the target may still be holding it when we get here,
    // which makes the first attach attempts fail on some platforms. Retry for a little while
    // before giving up.
    fn new_with_retry(pid: Pid, retries: u32) -> Result<Process> {
        let retry_interval = Duration::from_millis(10);
        let mut remaining = retries;
        loop {
            match Process::new(pid) {
                Ok(p) => return Ok(p),
                Err(e) => {
                    if remaining == 0 {
                        return Err(e).context(format!("attach to process {}", pid));
                    }
                    debug!("attach to process {} failed, retrying: {}", pid, e);
                    std::thread::sleep(retry_interval);
                    remaining -= 1;
                }
            }
        }
    }
}
