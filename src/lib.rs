//! Telemetry uplink core for battery-powered air-quality sensor nodes.
//!
//! This crate performs no I/O whatsoever. The three subsystems (the binary
//! payload codec, the CoAP request engine and the cellular registration state
//! machine) drive all their side effects through capability traits supplied
//! by the embedder: [`Transport`] for UDP datagrams and DNS, [`AtChannel`] for
//! the modem command stream, [`Clock`] for time and [`EntropySource`] for
//! token generation. This keeps the protocol logic deterministic and testable
//! against simulated peers.
//!
//! The core is strictly single threaded. Blocking waits are bounded by
//! explicit timeouts passed to the capabilities; there is no cancellation
//! mechanism beyond those deadlines.

use std::time::{Duration, Instant};

mod coding;

pub mod coap;
pub mod modem;
pub mod payload;

mod client;
pub use crate::client::{SensorProfile, UplinkClient, UplinkError};

mod transport;
pub use crate::transport::{EndpointAddr, Transport, TransportError};

#[cfg(test)]
mod tests;

pub use crate::coap::block::{Block1, BLOCK_SIZE};
pub use crate::coap::engine::{RequestConfig, RequestEngine, RequestError};
pub use crate::coap::packet::{CoapCode, CoapPacket, CoapType, PacketError, Token};
pub use crate::modem::at::{AtChannel, AtResponse};
pub use crate::modem::operators::OperatorInfo;
pub use crate::modem::registration::{
    CellTechnology, ModemSession, RegistrationError, RegistrationState, RegistrationStatus,
};
pub use crate::modem::{CellError, CellResult, NoPowerPin, PowerPin};
pub use crate::payload::{
    DecodeError, EncodeError, PayloadBatch, SensorField, SensorReading, MAX_BATCH_SIZE,
};

/// Source of randomness for CoAP tokens and message ids
///
/// A single draw covers one logical request: the high half becomes the token,
/// the low half the base message id. Implemented for every [`rand::RngCore`];
/// tests inject a scripted sequence to make exchanges reproducible.
pub trait EntropySource {
    fn next_u32(&mut self) -> u32;
}

impl<T: rand::RngCore> EntropySource for T {
    fn next_u32(&mut self) -> u32 {
        rand::RngCore::next_u32(self)
    }
}

/// Monotonic time and bounded sleeps
///
/// The registration state machine stores its timers as deadlines derived from
/// `now()` and parks between polls with `sleep()`. Production code uses
/// [`SystemClock`]; tests substitute a simulated clock whose `sleep` merely
/// advances `now`.
pub trait Clock {
    fn now(&self) -> Instant;
    fn sleep(&mut self, duration: Duration);
}

/// [`Clock`] backed by the operating system
#[derive(Debug, Default, Copy, Clone)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}
