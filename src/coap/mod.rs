//! Confirmable CoAP messaging over unreliable UDP.
//!
//! [`packet`] models the wire format, [`block`] the block-wise transfer
//! option, and [`engine`] the request/response machinery: retries, separate
//! responses, block fragmentation and the DNS fallback for the compiled-in
//! endpoint.

pub mod block;
pub mod engine;
pub mod packet;
