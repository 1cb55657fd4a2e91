//! Compact binary encoding of measurement batches.
//!
//! A batch serialises to:
//!
//! ```text
//! byte 0   metadata: version (bits 0-4) | shared mask flag (bit 5) | reserved
//! byte 1   measurement interval in minutes
//! then     either one shared 8-byte presence mask followed by the field data
//!          of every reading, or per reading an 8-byte mask and its data
//! ```
//!
//! Presence masks are little-endian u64; a set bit means the corresponding
//! field's bytes appear in the data section, in ascending bit order. All
//! multi-byte field values are little-endian. The shared-mask form is chosen
//! exactly when every reading in the batch carries the same non-zero mask.

use bytes::{Buf, BufMut};
use thiserror::Error;

use crate::coding::{self, BufExt};

/// Maximum number of readings carried by one batch
pub const MAX_BATCH_SIZE: usize = 20;

/// Payload schema version carried in the metadata byte
const VERSION: u8 = 0;
const VERSION_BITS: u8 = 0x1f;
const SHARED_MASK_BIT: u8 = 1 << 5;

/// Bits of the presence mask with a defined field assignment
const DEFINED_FIELDS: u64 = (1 << 30) - 1;

/// Field identifiers, by presence-mask bit position
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(u8)]
pub enum SensorField {
    /// Temperature, °C × 100, signed
    Temp = 0,
    /// Relative humidity, % × 100
    Hum = 1,
    /// CO2, ppm
    Co2 = 2,
    /// TVOC index
    Tvoc = 3,
    /// TVOC raw signal
    TvocRaw = 4,
    /// NOx index
    Nox = 5,
    /// NOx raw signal
    NoxRaw = 6,
    /// PM1.0 atmospheric, µg/m³ × 10
    Pm01 = 7,
    Pm25Ch1 = 8,
    Pm25Ch2 = 9,
    Pm10 = 10,
    /// PM1.0 standard particle, µg/m³ × 10
    Pm01Sp = 11,
    Pm25SpCh1 = 12,
    Pm25SpCh2 = 13,
    Pm10Sp = 14,
    /// PM0.3 particle count
    Pm03PcCh1 = 15,
    Pm03PcCh2 = 16,
    Pm05Pc = 17,
    Pm01Pc = 18,
    Pm25Pc = 19,
    Pm5Pc = 20,
    Pm10Pc = 21,
    /// Battery voltage, mV
    Vbat = 22,
    /// Panel voltage, mV
    Vpanel = 23,
    /// O3 working electrode, µV
    O3We = 24,
    O3Ae = 25,
    No2We = 26,
    No2Ae = 27,
    /// Analog front end temperature, °C × 10
    AfeTemp = 28,
    /// Radio signal strength, dBm, signed
    Signal = 29,
}

impl SensorField {
    const VALUES: [Self; 30] = [
        SensorField::Temp,
        SensorField::Hum,
        SensorField::Co2,
        SensorField::Tvoc,
        SensorField::TvocRaw,
        SensorField::Nox,
        SensorField::NoxRaw,
        SensorField::Pm01,
        SensorField::Pm25Ch1,
        SensorField::Pm25Ch2,
        SensorField::Pm10,
        SensorField::Pm01Sp,
        SensorField::Pm25SpCh1,
        SensorField::Pm25SpCh2,
        SensorField::Pm10Sp,
        SensorField::Pm03PcCh1,
        SensorField::Pm03PcCh2,
        SensorField::Pm05Pc,
        SensorField::Pm01Pc,
        SensorField::Pm25Pc,
        SensorField::Pm5Pc,
        SensorField::Pm10Pc,
        SensorField::Vbat,
        SensorField::Vpanel,
        SensorField::O3We,
        SensorField::O3Ae,
        SensorField::No2We,
        SensorField::No2Ae,
        SensorField::AfeTemp,
        SensorField::Signal,
    ];

    /// Presence-mask bit for this field
    pub fn bit(self) -> u64 {
        1 << (self as u8)
    }

    /// Number of bytes the field occupies on the wire
    pub fn wire_width(self) -> usize {
        use self::SensorField::*;
        match self {
            Signal => 1,
            O3We | O3Ae | No2We | No2Ae => 4,
            _ => 2,
        }
    }

    /// Iterate all defined fields in ascending bit order
    pub fn iter() -> impl Iterator<Item = Self> {
        Self::VALUES.iter().copied()
    }
}

/// Errors produced by batch encoding
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum EncodeError {
    #[error("batch contains no readings")]
    EmptyBatch,
    #[error("every reading in the batch has an empty presence mask")]
    AllMasksZero,
    #[error("destination buffer too small: needed {needed}, available {available}")]
    BufferTooSmall { needed: usize, available: usize },
    #[error("batch already holds the maximum of {MAX_BATCH_SIZE} readings")]
    BatchFull,
}

/// Errors produced by batch decoding
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum DecodeError {
    #[error("unsupported payload version {0}")]
    UnsupportedVersion(u8),
    #[error("invalid payload: {0}")]
    Invalid(&'static str),
}

impl From<coding::UnexpectedEnd> for DecodeError {
    fn from(_: coding::UnexpectedEnd) -> Self {
        DecodeError::Invalid("unexpected end of payload")
    }
}

/// One measurement cycle
///
/// Fields become part of the wire image only once their setter has been
/// called; the presence mask tracks which setters ran. Values use the fixed
/// scalings documented on [`SensorField`].
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct SensorReading {
    mask: u64,
    temp: i16,
    hum: u16,
    co2: u16,
    tvoc: u16,
    tvoc_raw: u16,
    nox: u16,
    nox_raw: u16,
    pm_01: u16,
    pm_25_ch1: u16,
    pm_25_ch2: u16,
    pm_10: u16,
    pm_01_sp: u16,
    pm_25_sp_ch1: u16,
    pm_25_sp_ch2: u16,
    pm_10_sp: u16,
    pm_03_pc_ch1: u16,
    pm_03_pc_ch2: u16,
    pm_05_pc: u16,
    pm_01_pc: u16,
    pm_25_pc: u16,
    pm_5_pc: u16,
    pm_10_pc: u16,
    vbat: u16,
    vpanel: u16,
    o3_we: u32,
    o3_ae: u32,
    no2_we: u32,
    no2_ae: u32,
    afe_temp: u16,
    signal: i8,
}

macro_rules! reading_field {
    ($set:ident, $get:ident, $field:ident, $ty:ty, $flag:ident) => {
        pub fn $set(&mut self, value: $ty) -> &mut Self {
            self.$field = value;
            self.mask |= SensorField::$flag.bit();
            self
        }

        pub fn $get(&self) -> Option<$ty> {
            self.contains(SensorField::$flag).then(|| self.$field)
        }
    };
}

impl SensorReading {
    pub fn new() -> Self {
        Self::default()
    }

    /// The 64-bit presence mask of this reading
    pub fn presence_mask(&self) -> u64 {
        self.mask
    }

    /// Whether `field` is part of this reading
    pub fn contains(&self, field: SensorField) -> bool {
        self.mask & field.bit() != 0
    }

    reading_field!(set_temp, temp, temp, i16, Temp);
    reading_field!(set_hum, hum, hum, u16, Hum);
    reading_field!(set_co2, co2, co2, u16, Co2);
    reading_field!(set_tvoc, tvoc, tvoc, u16, Tvoc);
    reading_field!(set_tvoc_raw, tvoc_raw, tvoc_raw, u16, TvocRaw);
    reading_field!(set_nox, nox, nox, u16, Nox);
    reading_field!(set_nox_raw, nox_raw, nox_raw, u16, NoxRaw);
    reading_field!(set_pm_01, pm_01, pm_01, u16, Pm01);
    reading_field!(set_pm_25_ch1, pm_25_ch1, pm_25_ch1, u16, Pm25Ch1);
    reading_field!(set_pm_25_ch2, pm_25_ch2, pm_25_ch2, u16, Pm25Ch2);
    reading_field!(set_pm_10, pm_10, pm_10, u16, Pm10);
    reading_field!(set_pm_01_sp, pm_01_sp, pm_01_sp, u16, Pm01Sp);
    reading_field!(set_pm_25_sp_ch1, pm_25_sp_ch1, pm_25_sp_ch1, u16, Pm25SpCh1);
    reading_field!(set_pm_25_sp_ch2, pm_25_sp_ch2, pm_25_sp_ch2, u16, Pm25SpCh2);
    reading_field!(set_pm_10_sp, pm_10_sp, pm_10_sp, u16, Pm10Sp);
    reading_field!(set_pm_03_pc_ch1, pm_03_pc_ch1, pm_03_pc_ch1, u16, Pm03PcCh1);
    reading_field!(set_pm_03_pc_ch2, pm_03_pc_ch2, pm_03_pc_ch2, u16, Pm03PcCh2);
    reading_field!(set_pm_05_pc, pm_05_pc, pm_05_pc, u16, Pm05Pc);
    reading_field!(set_pm_01_pc, pm_01_pc, pm_01_pc, u16, Pm01Pc);
    reading_field!(set_pm_25_pc, pm_25_pc, pm_25_pc, u16, Pm25Pc);
    reading_field!(set_pm_5_pc, pm_5_pc, pm_5_pc, u16, Pm5Pc);
    reading_field!(set_pm_10_pc, pm_10_pc, pm_10_pc, u16, Pm10Pc);
    reading_field!(set_vbat, vbat, vbat, u16, Vbat);
    reading_field!(set_vpanel, vpanel, vpanel, u16, Vpanel);
    reading_field!(set_o3_we, o3_we, o3_we, u32, O3We);
    reading_field!(set_o3_ae, o3_ae, o3_ae, u32, O3Ae);
    reading_field!(set_no2_we, no2_we, no2_we, u32, No2We);
    reading_field!(set_no2_ae, no2_ae, no2_ae, u32, No2Ae);
    reading_field!(set_afe_temp, afe_temp, afe_temp, u16, AfeTemp);
    reading_field!(set_signal, signal, signal, i8, Signal);

    /// Append the data section of this reading, as selected by `mask`
    fn encode_data<W: BufMut>(&self, mask: u64, w: &mut W) {
        use self::SensorField::*;
        for field in SensorField::iter() {
            if mask & field.bit() == 0 {
                continue;
            }
            match field {
                Temp => w.put_i16_le(self.temp),
                Hum => w.put_u16_le(self.hum),
                Co2 => w.put_u16_le(self.co2),
                Tvoc => w.put_u16_le(self.tvoc),
                TvocRaw => w.put_u16_le(self.tvoc_raw),
                Nox => w.put_u16_le(self.nox),
                NoxRaw => w.put_u16_le(self.nox_raw),
                Pm01 => w.put_u16_le(self.pm_01),
                Pm25Ch1 => w.put_u16_le(self.pm_25_ch1),
                Pm25Ch2 => w.put_u16_le(self.pm_25_ch2),
                Pm10 => w.put_u16_le(self.pm_10),
                Pm01Sp => w.put_u16_le(self.pm_01_sp),
                Pm25SpCh1 => w.put_u16_le(self.pm_25_sp_ch1),
                Pm25SpCh2 => w.put_u16_le(self.pm_25_sp_ch2),
                Pm10Sp => w.put_u16_le(self.pm_10_sp),
                Pm03PcCh1 => w.put_u16_le(self.pm_03_pc_ch1),
                Pm03PcCh2 => w.put_u16_le(self.pm_03_pc_ch2),
                Pm05Pc => w.put_u16_le(self.pm_05_pc),
                Pm01Pc => w.put_u16_le(self.pm_01_pc),
                Pm25Pc => w.put_u16_le(self.pm_25_pc),
                Pm5Pc => w.put_u16_le(self.pm_5_pc),
                Pm10Pc => w.put_u16_le(self.pm_10_pc),
                Vbat => w.put_u16_le(self.vbat),
                Vpanel => w.put_u16_le(self.vpanel),
                O3We => w.put_u32_le(self.o3_we),
                O3Ae => w.put_u32_le(self.o3_ae),
                No2We => w.put_u32_le(self.no2_we),
                No2Ae => w.put_u32_le(self.no2_ae),
                AfeTemp => w.put_u16_le(self.afe_temp),
                Signal => w.put_i8(self.signal),
            }
        }
    }

    /// Read the data section of one reading described by `mask`
    fn decode_data<B: Buf>(mask: u64, buf: &mut B) -> Result<Self, DecodeError> {
        use self::SensorField::*;
        let mut reading = SensorReading {
            mask,
            ..Self::default()
        };
        for field in SensorField::iter() {
            if mask & field.bit() == 0 {
                continue;
            }
            if buf.remaining() < field.wire_width() {
                return Err(DecodeError::Invalid("unexpected end of payload"));
            }
            match field {
                Temp => reading.temp = buf.get_i16_le(),
                Hum => reading.hum = buf.get_u16_le(),
                Co2 => reading.co2 = buf.get_u16_le(),
                Tvoc => reading.tvoc = buf.get_u16_le(),
                TvocRaw => reading.tvoc_raw = buf.get_u16_le(),
                Nox => reading.nox = buf.get_u16_le(),
                NoxRaw => reading.nox_raw = buf.get_u16_le(),
                Pm01 => reading.pm_01 = buf.get_u16_le(),
                Pm25Ch1 => reading.pm_25_ch1 = buf.get_u16_le(),
                Pm25Ch2 => reading.pm_25_ch2 = buf.get_u16_le(),
                Pm10 => reading.pm_10 = buf.get_u16_le(),
                Pm01Sp => reading.pm_01_sp = buf.get_u16_le(),
                Pm25SpCh1 => reading.pm_25_sp_ch1 = buf.get_u16_le(),
                Pm25SpCh2 => reading.pm_25_sp_ch2 = buf.get_u16_le(),
                Pm10Sp => reading.pm_10_sp = buf.get_u16_le(),
                Pm03PcCh1 => reading.pm_03_pc_ch1 = buf.get_u16_le(),
                Pm03PcCh2 => reading.pm_03_pc_ch2 = buf.get_u16_le(),
                Pm05Pc => reading.pm_05_pc = buf.get_u16_le(),
                Pm01Pc => reading.pm_01_pc = buf.get_u16_le(),
                Pm25Pc => reading.pm_25_pc = buf.get_u16_le(),
                Pm5Pc => reading.pm_5_pc = buf.get_u16_le(),
                Pm10Pc => reading.pm_10_pc = buf.get_u16_le(),
                Vbat => reading.vbat = buf.get_u16_le(),
                Vpanel => reading.vpanel = buf.get_u16_le(),
                O3We => reading.o3_we = buf.get_u32_le(),
                O3Ae => reading.o3_ae = buf.get_u32_le(),
                No2We => reading.no2_we = buf.get_u32_le(),
                No2Ae => reading.no2_ae = buf.get_u32_le(),
                AfeTemp => reading.afe_temp = buf.get_u16_le(),
                Signal => reading.signal = buf.get_i8(),
            }
        }
        Ok(reading)
    }
}

/// Number of data bytes a reading with `mask` occupies, excluding the mask
fn data_size(mask: u64) -> usize {
    SensorField::iter()
        .filter(|f| mask & f.bit() != 0)
        .map(|f| f.wire_width())
        .sum()
}

/// An ordered batch of readings plus the interval they were taken at
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct PayloadBatch {
    interval_minutes: u8,
    readings: Vec<SensorReading>,
}

impl PayloadBatch {
    pub fn new(interval_minutes: u8) -> Self {
        Self {
            interval_minutes,
            readings: Vec::new(),
        }
    }

    pub fn interval_minutes(&self) -> u8 {
        self.interval_minutes
    }

    pub fn readings(&self) -> &[SensorReading] {
        &self.readings
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    /// Append a reading, preserving order
    pub fn push(&mut self, reading: SensorReading) -> Result<(), EncodeError> {
        if self.readings.len() >= MAX_BATCH_SIZE {
            return Err(EncodeError::BatchFull);
        }
        self.readings.push(reading);
        Ok(())
    }

    /// The mask shared by every reading, if the batch qualifies for the
    /// shared-mask form
    fn shared_mask(&self) -> Option<u64> {
        let first = self.readings.first()?.mask;
        if first == 0 || self.readings.iter().any(|r| r.mask != first) {
            return None;
        }
        Some(first)
    }

    /// Exact number of bytes [`encode`](Self::encode) will produce
    pub fn calculate_total_size(&self) -> Result<usize, EncodeError> {
        if self.readings.is_empty() {
            return Err(EncodeError::EmptyBatch);
        }
        if self.readings.iter().all(|r| r.mask == 0) {
            return Err(EncodeError::AllMasksZero);
        }
        Ok(match self.shared_mask() {
            Some(mask) => 2 + 8 + self.readings.len() * data_size(mask),
            None => {
                2 + self
                    .readings
                    .iter()
                    .map(|r| 8 + data_size(r.mask))
                    .sum::<usize>()
            }
        })
    }

    /// Serialise the batch into `buf`, returning the number of bytes written
    ///
    /// No byte of `buf` is touched before the precomputed total size is known
    /// to fit.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, EncodeError> {
        let needed = self.calculate_total_size()?;
        if needed > buf.len() {
            return Err(EncodeError::BufferTooSmall {
                needed,
                available: buf.len(),
            });
        }

        let shared = self.shared_mask();
        let mut metadata = VERSION & VERSION_BITS;
        if shared.is_some() {
            metadata |= SHARED_MASK_BIT;
        }

        let mut w = &mut buf[..needed];
        w.put_u8(metadata);
        w.put_u8(self.interval_minutes);
        match shared {
            Some(mask) => {
                w.put_u64_le(mask);
                for reading in &self.readings {
                    reading.encode_data(mask, &mut w);
                }
            }
            None => {
                for reading in &self.readings {
                    w.put_u64_le(reading.mask);
                    reading.encode_data(reading.mask, &mut w);
                }
            }
        }
        debug_assert!(w.is_empty());
        Ok(needed)
    }

    /// Serialise into a freshly sized buffer
    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodeError> {
        let mut buf = vec![0; self.calculate_total_size()?];
        self.encode(&mut buf)?;
        Ok(buf)
    }

    /// Reconstruct a batch from its wire image
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let mut buf = data;
        let metadata: u8 = BufExt::get::<u8>(&mut buf)?;
        let version = metadata & VERSION_BITS;
        if version != VERSION {
            return Err(DecodeError::UnsupportedVersion(version));
        }
        let interval_minutes: u8 = BufExt::get::<u8>(&mut buf)?;

        let mut batch = PayloadBatch::new(interval_minutes);
        if metadata & SHARED_MASK_BIT != 0 {
            let mask = Self::decode_mask(&mut buf)?;
            if mask == 0 {
                return Err(DecodeError::Invalid("shared presence mask is empty"));
            }
            let size = data_size(mask);
            while buf.has_remaining() {
                if buf.remaining() < size {
                    return Err(DecodeError::Invalid("truncated reading"));
                }
                batch
                    .push(SensorReading::decode_data(mask, &mut buf)?)
                    .map_err(|_| DecodeError::Invalid("too many readings"))?;
            }
        } else {
            while buf.has_remaining() {
                let mask = Self::decode_mask(&mut buf)?;
                batch
                    .push(SensorReading::decode_data(mask, &mut buf)?)
                    .map_err(|_| DecodeError::Invalid("too many readings"))?;
            }
        }

        if batch.is_empty() {
            return Err(DecodeError::Invalid("batch contains no readings"));
        }
        Ok(batch)
    }

    fn decode_mask<B: Buf>(buf: &mut B) -> Result<u64, DecodeError> {
        if buf.remaining() < 8 {
            return Err(DecodeError::Invalid("truncated presence mask"));
        }
        let mask = buf.get_u64_le();
        if mask & !DEFINED_FIELDS != 0 {
            return Err(DecodeError::Invalid("presence mask has undefined bits"));
        }
        Ok(mask)
    }
}
