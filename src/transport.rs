use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;

use thiserror::Error;

/// Where the ingestion service lives
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum EndpointAddr {
    Ip(Ipv4Addr),
    Name(String),
}

impl fmt::Display for EndpointAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointAddr::Ip(ip) => write!(f, "{}", ip),
            EndpointAddr::Name(name) => write!(f, "{}", name),
        }
    }
}

/// Failure of a transport operation
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum TransportError {
    /// Nothing arrived before the deadline
    #[error("transport operation timed out")]
    Timeout,
    /// The bearer reported a hard error; the link needs reinitialisation
    /// before further traffic
    #[error("transport I/O error")]
    Io,
}

/// UDP datagram and DNS capability of the bearer
///
/// Exposed by the modem once registration reaches its terminal ready state.
/// The request engine performs all its network I/O through this trait and
/// nothing else; implementations are free to back it with a socket, an AT
/// command set or a test double.
///
/// `udp_receive` is one of the three suspension points of the core: it blocks
/// the caller until a datagram arrives or `timeout` passes.
pub trait Transport {
    fn udp_connect(&mut self, host: &EndpointAddr, port: u16) -> Result<(), TransportError>;
    fn udp_disconnect(&mut self) -> Result<(), TransportError>;
    fn udp_send(&mut self, datagram: &[u8], host: &EndpointAddr, port: u16)
        -> Result<(), TransportError>;
    fn udp_receive(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError>;
    fn resolve_dns(&mut self, name: &str) -> Result<String, TransportError>;
}
