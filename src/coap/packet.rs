//! CoAP packet model and codec.
//!
//! Wire layout: `ver(2) | type(2) | tkl(4)` in the first byte, then the code
//! byte, a big-endian message id, `tkl` token bytes, delta-encoded options
//! and, after a `0xff` marker, the payload.

use std::fmt;
use std::ops;

use bytes::{Buf, BufMut, Bytes};
use thiserror::Error;

use crate::coding::{self, BufExt, BufMutExt};

/// The CoAP protocol version implemented
const VERSION: u8 = 1;

/// Longest token the wire format can carry
pub const MAX_TOKEN_LEN: usize = 8;

const PAYLOAD_MARKER: u8 = 0xff;

/// Uri-Path option number
pub const URI_PATH: u16 = 11;
/// Content-Format option number
pub const CONTENT_FORMAT: u16 = 12;
/// Block1 option number (block-wise request transfer)
pub const BLOCK1: u16 = 27;
/// Size1 option number (total request payload size)
pub const SIZE1: u16 = 60;

/// Content-Format registry value for application/octet-stream
pub const OCTET_STREAM: u16 = 42;

/// CoAP message types
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CoapType {
    Con = 0,
    Non = 1,
    Ack = 2,
    Rst = 3,
}

impl CoapType {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x3 {
            0 => CoapType::Con,
            1 => CoapType::Non,
            2 => CoapType::Ack,
            _ => CoapType::Rst,
        }
    }
}

/// A request method or response code, split as class.detail on display
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct CoapCode(u8);

impl CoapCode {
    pub const EMPTY: Self = CoapCode(0x00);
    pub const GET: Self = CoapCode(0x01);
    pub const POST: Self = CoapCode(0x02);
    /// 2.01 Created
    pub const CREATED: Self = CoapCode(0x41);
    /// 2.04 Changed
    pub const CHANGED: Self = CoapCode(0x44);
    /// 2.05 Content
    pub const CONTENT: Self = CoapCode(0x45);
    /// 2.31 Continue, acknowledging a non-final block
    pub const CONTINUE: Self = CoapCode(0x5f);
    /// 4.00 Bad Request
    pub const BAD_REQUEST: Self = CoapCode(0x80);

    pub fn new(class: u8, detail: u8) -> Self {
        CoapCode((class & 0x7) << 5 | (detail & 0x1f))
    }

    pub fn class(self) -> u8 {
        self.0 >> 5
    }

    pub fn detail(self) -> u8 {
        self.0 & 0x1f
    }
}

impl From<CoapCode> for u8 {
    fn from(code: CoapCode) -> u8 {
        code.0
    }
}

impl From<u8> for CoapCode {
    fn from(raw: u8) -> Self {
        CoapCode(raw)
    }
}

impl fmt::Display for CoapCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.class(), self.detail())
    }
}

/// Request correlation token, 0 to 8 bytes
#[derive(Copy, Clone, Eq, PartialEq, Hash, Default)]
pub struct Token {
    len: u8,
    bytes: [u8; MAX_TOKEN_LEN],
}

impl Token {
    pub fn new(data: &[u8]) -> Self {
        debug_assert!(data.len() <= MAX_TOKEN_LEN);
        let mut bytes = [0; MAX_TOKEN_LEN];
        bytes[..data.len()].copy_from_slice(data);
        Self {
            len: data.len() as u8,
            bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl ops::Deref for Token {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.iter() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// One option of a packet
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CoapOption {
    pub number: u16,
    pub value: Vec<u8>,
}

impl CoapOption {
    pub fn new(number: u16, value: impl Into<Vec<u8>>) -> Self {
        Self {
            number,
            value: value.into(),
        }
    }

    /// Option carrying a minimal-length big-endian unsigned integer
    pub fn uint(number: u16, value: u32) -> Self {
        let bytes = value.to_be_bytes();
        let skip = value.leading_zeros() as usize / 8;
        Self {
            number,
            value: bytes[skip..].to_vec(),
        }
    }

    /// Interpret the value as a minimal-length unsigned integer
    pub fn uint_value(&self) -> Option<u32> {
        if self.value.len() > 4 {
            return None;
        }
        Some(
            self.value
                .iter()
                .fold(0u32, |acc, &b| acc << 8 | u32::from(b)),
        )
    }
}

/// Errors produced when a datagram does not parse as a CoAP packet
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum PacketError {
    #[error("unsupported CoAP version {0}")]
    UnsupportedVersion(u8),
    #[error("malformed packet: {0}")]
    Invalid(&'static str),
}

impl From<coding::UnexpectedEnd> for PacketError {
    fn from(_: coding::UnexpectedEnd) -> Self {
        PacketError::Invalid("unexpected end of packet")
    }
}

/// A CoAP message
///
/// Options must be kept in ascending option-number order; [`push_option`]
/// maintains that, and [`encode`] refuses to emit an unordered list.
///
/// [`push_option`]: Self::push_option
/// [`encode`]: Self::encode
#[derive(Debug, Clone)]
pub struct CoapPacket {
    pub kind: CoapType,
    pub code: CoapCode,
    pub message_id: u16,
    pub token: Token,
    pub options: Vec<CoapOption>,
    pub payload: Bytes,
}

impl CoapPacket {
    pub fn new(kind: CoapType, code: CoapCode, message_id: u16) -> Self {
        Self {
            kind,
            code,
            message_id,
            token: Token::default(),
            options: Vec::new(),
            payload: Bytes::new(),
        }
    }

    pub fn code_class(&self) -> u8 {
        self.code.class()
    }

    pub fn code_detail(&self) -> u8 {
        self.code.detail()
    }

    /// First option with the given number, if any
    pub fn option(&self, number: u16) -> Option<&CoapOption> {
        self.options.iter().find(|opt| opt.number == number)
    }

    /// Insert an option, keeping the list sorted by number
    pub fn push_option(&mut self, option: CoapOption) {
        let at = self
            .options
            .iter()
            .position(|o| o.number > option.number)
            .unwrap_or(self.options.len());
        self.options.insert(at, option);
    }

    /// Append the wire image of this packet to `w`
    pub fn encode(&self, w: &mut Vec<u8>) -> Result<(), PacketError> {
        w.write(VERSION << 6 | (self.kind as u8) << 4 | self.token.len() as u8);
        w.write(u8::from(self.code));
        w.write(self.message_id);
        w.put_slice(&self.token);

        let mut previous = 0u16;
        for option in &self.options {
            if option.number < previous {
                return Err(PacketError::Invalid("options not in ascending order"));
            }
            if option.value.len() > usize::from(u16::MAX) {
                return Err(PacketError::Invalid("option value too long"));
            }
            let delta = option.number - previous;
            previous = option.number;

            let (delta_nibble, delta_ext) = split_ext(delta);
            let (len_nibble, len_ext) = split_ext(option.value.len() as u16);
            w.write(delta_nibble << 4 | len_nibble);
            delta_ext.encode(w);
            len_ext.encode(w);
            w.put_slice(&option.value);
        }

        if !self.payload.is_empty() {
            w.write(PAYLOAD_MARKER);
            w.put_slice(&self.payload);
        }
        Ok(())
    }

    /// Parse a received datagram
    pub fn decode(data: &[u8]) -> Result<Self, PacketError> {
        let mut buf = data;
        let first: u8 = BufExt::get::<u8>(&mut buf)?;
        let version = first >> 6;
        if version != VERSION {
            return Err(PacketError::UnsupportedVersion(version));
        }
        let kind = CoapType::from_bits(first >> 4);
        let token_len = usize::from(first & 0x0f);
        if token_len > MAX_TOKEN_LEN {
            return Err(PacketError::Invalid("token longer than eight bytes"));
        }

        let code = CoapCode(BufExt::get::<u8>(&mut buf)?);
        let message_id: u16 = BufExt::get::<u16>(&mut buf)?;

        if buf.remaining() < token_len {
            return Err(PacketError::Invalid("token longer than packet"));
        }
        let mut token_bytes = [0; MAX_TOKEN_LEN];
        buf.copy_to_slice(&mut token_bytes[..token_len]);
        let token = Token::new(&token_bytes[..token_len]);

        let mut options = Vec::new();
        let mut payload = Bytes::new();
        let mut previous = 0u16;
        while buf.has_remaining() {
            let header: u8 = BufExt::get::<u8>(&mut buf)?;
            if header == PAYLOAD_MARKER {
                if !buf.has_remaining() {
                    return Err(PacketError::Invalid("payload marker without payload"));
                }
                payload = buf.copy_to_bytes(buf.remaining());
                break;
            }
            let delta_nibble = header >> 4;
            let len_nibble = header & 0x0f;
            if delta_nibble == 15 || len_nibble == 15 {
                return Err(PacketError::Invalid("reserved option nibble"));
            }
            let delta = read_ext(delta_nibble, &mut buf)?;
            let len = usize::from(read_ext(len_nibble, &mut buf)?);
            let number = previous
                .checked_add(delta)
                .ok_or(PacketError::Invalid("option number overflow"))?;
            previous = number;

            if buf.remaining() < len {
                return Err(PacketError::Invalid("option value longer than packet"));
            }
            let mut value = vec![0; len];
            buf.copy_to_slice(&mut value);
            options.push(CoapOption { number, value });
        }

        Ok(Self {
            kind,
            code,
            message_id,
            token,
            options,
            payload,
        })
    }
}

enum Ext {
    None,
    One(u8),
    Two(u16),
}

impl Ext {
    fn encode(&self, w: &mut Vec<u8>) {
        match *self {
            Ext::None => {}
            Ext::One(x) => w.write(x),
            Ext::Two(x) => w.write(x),
        }
    }
}

/// Split an option delta or length into its nibble and extension field
fn split_ext(value: u16) -> (u8, Ext) {
    if value < 13 {
        (value as u8, Ext::None)
    } else if value < 269 {
        (13, Ext::One((value - 13) as u8))
    } else {
        (14, Ext::Two(value - 269))
    }
}

fn read_ext<B: Buf>(nibble: u8, buf: &mut B) -> Result<u16, PacketError> {
    match nibble {
        13 => Ok(u16::from(buf.get::<u8>()?) + 13),
        14 => buf
            .get::<u16>()?
            .checked_add(269)
            .ok_or(PacketError::Invalid("option field overflow")),
        _ => Ok(u16::from(nibble)),
    }
}
