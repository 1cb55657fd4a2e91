//! The CoAP request engine.
//!
//! One logical request is a strictly ordered send, receive, acknowledge
//! sequence; nothing else is in flight while it runs. Oversized POST bodies
//! are fragmented into sequential Block1 sub-exchanges, each with its own
//! retry budget. When the compiled-in endpoint address stops answering
//! entirely, the engine re-resolves the ingestion domain over DNS once and
//! repeats the request against the fresh address.

use std::cmp;
use std::net::Ipv4Addr;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::coap::block::{Block1, BLOCK_SIZE};
use crate::coap::packet::{
    CoapCode, CoapOption, CoapPacket, CoapType, PacketError, Token, CONTENT_FORMAT, OCTET_STREAM,
    SIZE1, URI_PATH,
};
use crate::transport::{EndpointAddr, Transport, TransportError};
use crate::EntropySource;

/// Compiled-in address of the ingestion service
pub const DEFAULT_HOST: Ipv4Addr = Ipv4Addr::new(152, 67, 89, 21);
/// Ingestion domain, consulted only when the static address stops answering
pub const DEFAULT_DOMAIN: &str = "hw.aerolink.io";
/// Standard CoAP port
pub const DEFAULT_PORT: u16 = 5683;

/// Tunables of the request machinery
#[derive(Debug, Copy, Clone)]
pub struct RequestConfig {
    /// How long to wait for each datagram from the peer
    pub receive_timeout: Duration,
    /// Attempts per logical request; for a block transfer, per block
    pub max_retries: usize,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            receive_timeout: Duration::from_secs(10),
            max_retries: 3,
        }
    }
}

/// Why a request did not produce a validated response
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum RequestError {
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),
    #[error("malformed response: {0}")]
    Malformed(#[from] PacketError),
    #[error("response message id mismatch (expected {expected:#06x}, got {actual:#06x})")]
    IdMismatch { expected: u16, actual: u16 },
    #[error("response token mismatch")]
    TokenMismatch,
    #[error("unexpected response code {0} during block transfer")]
    UnexpectedResponse(CoapCode),
    #[error("server replied {0}")]
    ErrorResponse(CoapCode),
}

impl RequestError {
    fn is_timeout(&self) -> bool {
        matches!(self, RequestError::Transport(TransportError::Timeout))
    }
}

/// Issues requests and validates responses over an injected [`Transport`]
///
/// Performs no I/O of its own and holds no socket; the sticky `connected`
/// flag mirrors the state of the bearer's single UDP connection.
pub struct RequestEngine {
    endpoint: EndpointAddr,
    port: u16,
    connected: bool,
    config: RequestConfig,
}

impl Default for RequestEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestEngine {
    pub fn new() -> Self {
        Self::with_config(RequestConfig::default())
    }

    pub fn with_config(config: RequestConfig) -> Self {
        Self {
            endpoint: EndpointAddr::Ip(DEFAULT_HOST),
            port: DEFAULT_PORT,
            connected: false,
            config,
        }
    }

    /// Current target endpoint
    pub fn endpoint(&self) -> (&EndpointAddr, u16) {
        (&self.endpoint, self.port)
    }

    /// Point the engine somewhere other than the compiled-in default
    pub fn set_endpoint(&mut self, endpoint: EndpointAddr, port: u16) {
        self.endpoint = endpoint;
        self.port = port;
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Issue a confirmable GET for `uri_path` and return the validated
    /// response, whatever its code class
    pub fn get(
        &mut self,
        transport: &mut dyn Transport,
        rng: &mut dyn EntropySource,
        uri_path: &str,
    ) -> Result<CoapPacket, RequestError> {
        self.connect(transport)?;
        let (token, message_id) = draw_ids(rng);
        let mut request = CoapPacket::new(CoapType::Con, CoapCode::GET, message_id);
        request.token = token;
        request.push_option(CoapOption::new(URI_PATH, uri_path.as_bytes()));
        self.exchange_with_fallback(transport, &request, token)
    }

    /// POST `payload` to `uri_path`, fragmenting into Block1 sub-exchanges
    /// when it exceeds one block
    pub fn post(
        &mut self,
        transport: &mut dyn Transport,
        rng: &mut dyn EntropySource,
        uri_path: &str,
        payload: &[u8],
    ) -> Result<CoapPacket, RequestError> {
        self.connect(transport)?;
        let (token, base_mid) = draw_ids(rng);
        if payload.len() <= BLOCK_SIZE {
            let mut request = CoapPacket::new(CoapType::Con, CoapCode::POST, base_mid);
            request.token = token;
            request.push_option(CoapOption::new(URI_PATH, uri_path.as_bytes()));
            request.push_option(CoapOption::uint(CONTENT_FORMAT, u32::from(OCTET_STREAM)));
            request.payload = Bytes::copy_from_slice(payload);
            return self.exchange_with_fallback(transport, &request, token);
        }
        self.post_blockwise(transport, uri_path, payload, token, base_mid)
    }

    /// Tear the connection down unless the caller wants it kept
    pub fn close(&mut self, transport: &mut dyn Transport, keep_connection: bool) {
        if keep_connection || !self.connected {
            return;
        }
        match transport.udp_disconnect() {
            Ok(()) => self.connected = false,
            // leave the flag set; the bearer still holds the socket
            Err(err) => warn!("failed to close UDP connection: {}", err),
        }
    }

    fn post_blockwise(
        &mut self,
        transport: &mut dyn Transport,
        uri_path: &str,
        payload: &[u8],
        token: Token,
        base_mid: u16,
    ) -> Result<CoapPacket, RequestError> {
        let total = payload.len();
        let blocks = (total + BLOCK_SIZE - 1) / BLOCK_SIZE;
        debug!("block transfer of {} bytes in {} blocks", total, blocks);

        for num in 0..blocks {
            let more = num + 1 < blocks;
            let start = num * BLOCK_SIZE;
            let end = cmp::min(start + BLOCK_SIZE, total);

            let mut request =
                CoapPacket::new(CoapType::Con, CoapCode::POST, base_mid.wrapping_add(num as u16));
            request.token = token;
            request.push_option(CoapOption::new(URI_PATH, uri_path.as_bytes()));
            request.push_option(CoapOption::uint(CONTENT_FORMAT, u32::from(OCTET_STREAM)));
            request.push_option(Block1::new(num as u32, more).to_option());
            if num == 0 {
                request.push_option(CoapOption::uint(SIZE1, total as u32));
            }
            request.payload = Bytes::copy_from_slice(&payload[start..end]);

            let response = self.exchange_with_fallback(transport, &request, token)?;
            if !more {
                return Ok(response);
            }
            if response.code != CoapCode::CONTINUE {
                warn!(
                    "peer answered block {} with {} instead of {}",
                    num,
                    response.code,
                    CoapCode::CONTINUE
                );
                return Err(RequestError::UnexpectedResponse(response.code));
            }
            trace!("block {} acknowledged", num);
        }
        unreachable!("a block transfer always contains a final block")
    }

    /// Run the retry loop; if every attempt timed out against the compiled-in
    /// address, re-resolve the ingestion domain and run it once more
    fn exchange_with_fallback(
        &mut self,
        transport: &mut dyn Transport,
        request: &CoapPacket,
        token: Token,
    ) -> Result<CoapPacket, RequestError> {
        let mut datagram = Vec::new();
        request.encode(&mut datagram)?;

        let (result, all_timeouts) =
            self.run_attempts(transport, &datagram, request.message_id, token);
        let err = match result {
            Ok(response) => return Ok(response),
            Err(err) => err,
        };
        if !all_timeouts || self.endpoint != EndpointAddr::Ip(DEFAULT_HOST) {
            return Err(err);
        }

        info!(
            "endpoint {} unresponsive, falling back to DNS resolution of {}",
            self.endpoint, DEFAULT_DOMAIN
        );
        self.refresh_endpoint(transport)?;
        let (result, _) = self.run_attempts(transport, &datagram, request.message_id, token);
        result
    }

    fn run_attempts(
        &mut self,
        transport: &mut dyn Transport,
        datagram: &[u8],
        expected_mid: u16,
        token: Token,
    ) -> (Result<CoapPacket, RequestError>, bool) {
        let attempts = cmp::max(self.config.max_retries, 1);
        let mut all_timeouts = true;
        let mut last = RequestError::Transport(TransportError::Timeout);
        for attempt in 1..=attempts {
            trace!("request attempt {}/{}", attempt, attempts);
            match self.exchange(transport, datagram, expected_mid, token) {
                Ok(response) => return (Ok(response), all_timeouts),
                Err(err) => {
                    if attempt < attempts {
                        warn!("request attempt failed ({}), retrying", err);
                    }
                    all_timeouts &= err.is_timeout();
                    last = err;
                }
            }
        }
        warn!("request failed after {} attempts", attempts);
        (Err(last), all_timeouts)
    }

    /// One send, receive, acknowledge round
    fn exchange(
        &mut self,
        transport: &mut dyn Transport,
        datagram: &[u8],
        expected_mid: u16,
        token: Token,
    ) -> Result<CoapPacket, RequestError> {
        transport
            .udp_send(datagram, &self.endpoint, self.port)
            .map_err(RequestError::Transport)?;
        trace!("request sent, waiting for response");

        let received = transport
            .udp_receive(self.config.receive_timeout)
            .map_err(RequestError::Transport)?;
        let response = CoapPacket::decode(&received)?;
        if response.message_id != expected_mid {
            return Err(RequestError::IdMismatch {
                expected: expected_mid,
                actual: response.message_id,
            });
        }

        if response.kind == CoapType::Ack && response.code == CoapCode::EMPTY {
            // Separate response: the peer will follow up with the real reply
            // under its own message id. The token is checked there; an empty
            // ACK carries none.
            debug!("empty ACK received, waiting for separate response");
            let received = transport
                .udp_receive(self.config.receive_timeout)
                .map_err(RequestError::Transport)?;
            let response = CoapPacket::decode(&received)?;
            if response.token != token {
                return Err(RequestError::TokenMismatch);
            }
            if response.kind == CoapType::Con {
                self.acknowledge(transport, response.message_id);
            }
            return Ok(response);
        }

        if response.token != token {
            return Err(RequestError::TokenMismatch);
        }
        if response.kind == CoapType::Con {
            self.acknowledge(transport, response.message_id);
        }
        Ok(response)
    }

    /// Send an empty ACK echoing `message_id`; best effort only
    fn acknowledge(&mut self, transport: &mut dyn Transport, message_id: u16) {
        let ack = CoapPacket::new(CoapType::Ack, CoapCode::EMPTY, message_id);
        let mut datagram = Vec::new();
        if ack.encode(&mut datagram).is_ok() {
            match transport.udp_send(&datagram, &self.endpoint, self.port) {
                Ok(()) => trace!("ACK sent for mid {:#06x}", message_id),
                Err(err) => warn!("failed to send ACK: {}", err),
            }
        }
    }

    /// Idempotent lazy connect
    fn connect(&mut self, transport: &mut dyn Transport) -> Result<(), RequestError> {
        if self.connected {
            trace!("already connected to {}", self.endpoint);
            return Ok(());
        }
        transport
            .udp_connect(&self.endpoint, self.port)
            .map_err(RequestError::Transport)?;
        self.connected = true;
        Ok(())
    }

    /// Swap the endpoint for a freshly resolved address and reconnect
    fn refresh_endpoint(&mut self, transport: &mut dyn Transport) -> Result<(), RequestError> {
        if let Err(err) = transport.udp_disconnect() {
            warn!("failed to close UDP connection before fallback: {}", err);
        }
        self.connected = false;

        let resolved = transport
            .resolve_dns(DEFAULT_DOMAIN)
            .map_err(RequestError::Transport)?;
        self.endpoint = match resolved.parse::<Ipv4Addr>() {
            Ok(ip) => EndpointAddr::Ip(ip),
            Err(_) => EndpointAddr::Name(resolved),
        };
        info!("ingestion endpoint switched to {}", self.endpoint);
        self.connect(transport)
    }
}

/// Draw the token and base message id of one logical request from a single
/// 32-bit sample
fn draw_ids(rng: &mut dyn EntropySource) -> (Token, u16) {
    let raw = rng.next_u32();
    let token = Token::new(&[(raw >> 24) as u8, (raw >> 16) as u8]);
    (token, raw as u16)
}
