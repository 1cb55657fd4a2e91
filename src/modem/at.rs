//! The AT command stream capability.
//!
//! The UART plumbing and line tokenising live with the embedder; this trait
//! is the narrow waist the registration machine talks through.
//! `wait_response` and `wait_line` are suspension points: they block the
//! caller until the expected data arrives or the deadline passes.

use std::time::Duration;

use crate::modem::{CellError, CellResult};

/// Final response of a successful command
pub const OK: &str = "OK";
/// Final response of a rejected command
pub const ERROR: &str = "ERROR";

/// Default deadline for ordinary command finals
pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);
/// Deadline for reading the data line of a report
pub(crate) const LINE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Outcome of waiting on the command stream
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AtResponse {
    /// The expected token at this index arrived
    Matched(usize),
    /// Nothing expected arrived before the deadline
    Timeout,
    /// The module published a +CME/+CMS error report instead
    CmeError,
}

/// Serial command channel to the modem
pub trait AtChannel {
    /// Queue `cmd` with the `AT` prefix and final CR applied
    fn send_at(&mut self, cmd: &str);
    /// Write raw bytes without framing
    fn send_raw(&mut self, bytes: &[u8]);
    /// Consume the stream until one of `expected` appears or the deadline
    /// passes, returning the index of the earliest match
    fn wait_response(&mut self, timeout: Duration, expected: &[&str]) -> AtResponse;
    /// Receive the next non-empty response line
    fn wait_line(&mut self, timeout: Duration) -> Option<String>;
    /// Drain up to `dest.len()` raw bytes from the receive buffer
    fn retrieve_buffer(&mut self, dest: &mut [u8]) -> usize;
    /// Discard everything buffered
    fn clear_buffer(&mut self);
}

/// Command patterns shared by the registration logic
pub(crate) trait AtChannelExt: AtChannel {
    /// Send `cmd` and wait for the final OK
    fn command(&mut self, cmd: &str, timeout: Duration) -> CellResult<()> {
        self.send_at(cmd);
        self.finish(timeout)
    }

    /// Wait for the final OK or ERROR of the pending command
    fn finish(&mut self, timeout: Duration) -> CellResult<()> {
        match self.wait_response(timeout, &[OK, ERROR]) {
            AtResponse::Matched(0) => Ok(()),
            AtResponse::Matched(_) | AtResponse::CmeError => Err(CellError::Module),
            AtResponse::Timeout => Err(CellError::Timeout),
        }
    }

    /// Send `cmd`, wait for the `report` prefix and return the rest of its
    /// line; the final OK is consumed and discarded
    fn query(&mut self, cmd: &str, report: &str, timeout: Duration) -> CellResult<String> {
        self.send_at(cmd);
        match self.wait_response(timeout, &[report, ERROR]) {
            AtResponse::Matched(0) => {}
            AtResponse::Matched(_) | AtResponse::CmeError => return Err(CellError::Module),
            AtResponse::Timeout => return Err(CellError::Timeout),
        }
        let line = self.wait_line(LINE_TIMEOUT).ok_or(CellError::Timeout)?;
        let _ = self.wait_response(DEFAULT_TIMEOUT, &[OK, ERROR]);
        Ok(line)
    }
}

impl<T: AtChannel + ?Sized> AtChannelExt for T {}
