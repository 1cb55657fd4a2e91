//! Block-wise request transfer (Block1 option).

use crate::coap::packet::{CoapOption, PacketError, BLOCK1};

/// Fixed transfer block size; SZX 6 encodes 2^(6+4) bytes
pub const BLOCK_SIZE: usize = 1024;
/// Block-size exponent used for every transfer
pub const BLOCK_SZX: u8 = 6;

/// Decoded Block1 option value: `NUM(20) | M(1) | SZX(3)`
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Block1 {
    /// Block number within the transfer
    pub num: u32,
    /// Whether more blocks follow
    pub more: bool,
    /// Block-size exponent
    pub szx: u8,
}

impl Block1 {
    pub fn new(num: u32, more: bool) -> Self {
        Self {
            num,
            more,
            szx: BLOCK_SZX,
        }
    }

    /// Byte size of the blocks in this transfer
    pub fn size(self) -> usize {
        1 << (self.szx + 4)
    }

    fn value(self) -> u32 {
        self.num << 4 | u32::from(self.more) << 3 | u32::from(self.szx & 0x7)
    }

    /// Minimal-length option encoding of this value
    pub fn to_option(self) -> CoapOption {
        CoapOption::uint(BLOCK1, self.value())
    }

    /// Parse a received Block1 option value (zero to three bytes)
    pub fn parse(value: &[u8]) -> Result<Self, PacketError> {
        if value.len() > 3 {
            return Err(PacketError::Invalid("oversized Block1 option"));
        }
        let raw = value.iter().fold(0u32, |acc, &b| acc << 8 | u32::from(b));
        let szx = (raw & 0x7) as u8;
        if szx == 7 {
            return Err(PacketError::Invalid("reserved Block1 size exponent"));
        }
        Ok(Self {
            num: raw >> 4,
            more: raw & 0x8 != 0,
            szx,
        })
    }
}
