//! Cellular modem control: the AT command capability, operator bookkeeping
//! and the network registration state machine.

use thiserror::Error;

pub mod at;
pub mod operators;
pub mod registration;

/// Failure of a single modem interaction
///
/// Every AT-level operation resolves to `Ok` or one of these, so the
/// registration machine can match exhaustively instead of juggling boolean
/// flags and out-parameters.
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum CellError {
    /// The module answered, but not with what the operation needed
    #[error("unexpected modem response")]
    Failed,
    /// The module reported an error (ERROR or a +CME/+CMS report)
    #[error("modem reported an error")]
    Module,
    /// No usable response before the deadline
    #[error("timed out waiting for the modem")]
    Timeout,
}

pub type CellResult<T> = Result<T, CellError>;

/// GPIO control over the module power key line
pub trait PowerPin {
    fn set_high(&mut self);
    fn set_low(&mut self);
}

/// Stand-in for sessions without GPIO control over the module
#[derive(Debug, Default, Copy, Clone)]
pub struct NoPowerPin;

impl PowerPin for NoPowerPin {
    fn set_high(&mut self) {}
    fn set_low(&mut self) {}
}
