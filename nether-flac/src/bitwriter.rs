//! MSB-first bit writer
//!
//! Bits collect in a 64-bit accumulator and are flushed to the word buffer 32 at a
//! time. The buffer grows on demand up to [`MAX_BUFFER_BYTES`], the largest size a
//! metadata length field can describe.

use crate::crc;
use crate::error::FlacError;

/// Hard ceiling on the encoded size
pub const MAX_BUFFER_BYTES: usize = 1 << 24;

const DEFAULT_CAPACITY_WORDS: usize = 32768 / 4;
const MAX_WORDS: usize = MAX_BUFFER_BYTES / 4;

/// Growable big-endian bit buffer
#[derive(Debug, Clone)]
pub struct BitWriter {
    /// Completed words
    words: Vec<u32>,
    /// Pending bits, right-justified
    accum: u64,
    /// Number of pending bits (always < 32 between calls)
    bits: u32,
    /// Capacity in words, grown by [`BitWriter::ensure`]
    capacity: usize,
    /// Byte view handed out by [`BitWriter::get_buffer`]
    view: Vec<u8>,
}

impl Default for BitWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl BitWriter {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY_WORDS)
    }

    /// Writer with room for `words` 32-bit words before the first growth
    pub fn with_capacity(words: usize) -> Self {
        let capacity = words.clamp(1, MAX_WORDS);
        Self {
            words: Vec::with_capacity(capacity),
            accum: 0,
            bits: 0,
            capacity,
            view: Vec::new(),
        }
    }

    /// Drop everything written so far, keeping the allocation
    pub fn clear(&mut self) {
        self.words.clear();
        self.accum = 0;
        self.bits = 0;
    }

    /// Current capacity in words
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total bits written
    pub fn bits_written(&self) -> u64 {
        self.words.len() as u64 * 32 + self.bits as u64
    }

    pub fn is_byte_aligned(&self) -> bool {
        self.bits % 8 == 0
    }

    /// Make room for `extra` more bits
    ///
    /// Grows by at least a quarter of the current capacity, or exactly what the
    /// write needs if that is more.
    fn ensure(&mut self, extra: u64) -> Result<(), FlacError> {
        let needed = self.words.len() as u64 + (self.bits as u64 + extra).div_ceil(32);
        if needed <= self.capacity as u64 {
            return Ok(());
        }
        if needed > MAX_WORDS as u64 {
            return Err(FlacError::BufferLimit {
                max: MAX_BUFFER_BYTES,
            });
        }
        let new_capacity = (needed as usize)
            .max(self.capacity + self.capacity / 4)
            .min(MAX_WORDS);
        self.words
            .reserve_exact(new_capacity.saturating_sub(self.words.len()));
        self.capacity = new_capacity;
        Ok(())
    }

    /// Append up to 32 bits without a capacity check
    #[inline]
    fn push_bits(&mut self, value: u32, bits: u32) {
        debug_assert!(bits <= 32);
        if bits == 0 {
            return;
        }
        let value = if bits == 32 {
            value
        } else {
            value & ((1u32 << bits) - 1)
        };
        self.accum = (self.accum << bits) | value as u64;
        self.bits += bits;
        if self.bits >= 32 {
            self.bits -= 32;
            self.words.push((self.accum >> self.bits) as u32);
            self.accum &= (1u64 << self.bits) - 1;
        }
    }

    /// Write the low `bits` bits of `value` (`bits` <= 32)
    pub fn write_raw_u32(&mut self, value: u32, bits: u32) -> Result<(), FlacError> {
        if bits > 32 {
            return Err(FlacError::InvalidParameter("more than 32 bits"));
        }
        self.ensure(bits as u64)?;
        self.push_bits(value, bits);
        Ok(())
    }

    /// Write `value` as a `bits`-wide two's complement field
    pub fn write_raw_i32(&mut self, value: i32, bits: u32) -> Result<(), FlacError> {
        self.write_raw_u32(value as u32, bits)
    }

    /// Write the low `bits` bits of `value` (`bits` <= 64)
    pub fn write_raw_u64(&mut self, value: u64, bits: u32) -> Result<(), FlacError> {
        if bits > 64 {
            return Err(FlacError::InvalidParameter("more than 64 bits"));
        }
        if bits > 32 {
            self.ensure(bits as u64)?;
            self.push_bits((value >> 32) as u32, bits - 32);
            self.push_bits(value as u32, 32);
            Ok(())
        } else {
            self.write_raw_u32(value as u32, bits)
        }
    }

    /// Write a 32-bit little-endian field (metadata blocks use these)
    pub fn write_raw_u32_le(&mut self, value: u32) -> Result<(), FlacError> {
        self.write_byte_block(&value.to_le_bytes())
    }

    pub fn write_zeroes(&mut self, bits: u32) -> Result<(), FlacError> {
        self.ensure(bits as u64)?;
        let mut left = bits;
        while left > 0 {
            let n = left.min(32);
            self.push_bits(0, n);
            left -= n;
        }
        Ok(())
    }

    pub fn write_byte_block(&mut self, bytes: &[u8]) -> Result<(), FlacError> {
        self.ensure(bytes.len() as u64 * 8)?;
        for &b in bytes {
            self.push_bits(b as u32, 8);
        }
        Ok(())
    }

    /// `value` zero bits followed by a one bit
    pub fn write_unary_unsigned(&mut self, value: u32) -> Result<(), FlacError> {
        self.ensure(value as u64 + 1)?;
        let mut zeros = value;
        while zeros >= 32 {
            self.push_bits(0, 32);
            zeros -= 32;
        }
        self.push_bits(1, zeros + 1);
        Ok(())
    }

    /// Rice-code one signed value after zig-zag folding
    pub fn write_rice_signed(&mut self, value: i32, parameter: u32) -> Result<(), FlacError> {
        check_rice_parameter(parameter)?;
        let folded = fold(value);
        let msbs = folded >> parameter;
        self.ensure(msbs as u64 + 1 + parameter as u64)?;
        self.push_rice(folded, msbs, parameter);
        Ok(())
    }

    /// Rice-code a block of residuals with one parameter
    ///
    /// The capacity check covers the whole block up front, so the per-value path is
    /// only accumulator arithmetic.
    pub fn write_rice_signed_block(
        &mut self,
        values: &[i32],
        parameter: u32,
    ) -> Result<(), FlacError> {
        check_rice_parameter(parameter)?;
        let total: u64 = values
            .iter()
            .map(|&v| (fold(v) >> parameter) as u64 + 1 + parameter as u64)
            .sum();
        self.ensure(total)?;
        for &v in values {
            let folded = fold(v);
            self.push_rice(folded, folded >> parameter, parameter);
        }
        Ok(())
    }

    #[inline]
    fn push_rice(&mut self, folded: u32, msbs: u32, parameter: u32) {
        let mut zeros = msbs;
        while zeros >= 32 {
            self.push_bits(0, 32);
            zeros -= 32;
        }
        // Stop bit and remainder fit one push when the quotient is short
        let stop_and_lsbs = (1u64 << parameter) | (folded as u64 & ((1u64 << parameter) - 1));
        let width = zeros + 1 + parameter;
        if width <= 32 {
            self.push_bits(stop_and_lsbs as u32, width);
        } else {
            self.push_bits(0, zeros);
            self.push_bits(stop_and_lsbs as u32, parameter + 1);
        }
    }

    /// UTF-8 style variable-length code for values below 2^31
    pub fn write_utf8_u32(&mut self, value: u32) -> Result<(), FlacError> {
        if value >= 0x8000_0000 {
            return Err(FlacError::InvalidParameter("utf-8 value exceeds 31 bits"));
        }
        self.write_utf8(value as u64)
    }

    /// UTF-8 style variable-length code for values below 2^36
    pub fn write_utf8_u64(&mut self, value: u64) -> Result<(), FlacError> {
        if value >= 1 << 36 {
            return Err(FlacError::InvalidParameter("utf-8 value exceeds 36 bits"));
        }
        self.write_utf8(value)
    }

    fn write_utf8(&mut self, value: u64) -> Result<(), FlacError> {
        if value < 0x80 {
            return self.write_raw_u32(value as u32, 8);
        }
        // Continuation bytes carry 6 bits each; the lead byte carries the rest
        let continuation = match value {
            ..0x800 => 1,
            ..0x1_0000 => 2,
            ..0x20_0000 => 3,
            ..0x400_0000 => 4,
            ..0x8000_0000 => 5,
            _ => 6,
        };
        let lead_marker = (0xFF00u32 >> (continuation + 1)) as u8;
        let lead = lead_marker | (value >> (6 * continuation)) as u8;
        self.ensure(8 * (continuation as u64 + 1))?;
        self.push_bits(lead as u32, 8);
        for i in (0..continuation).rev() {
            self.push_bits(0x80 | ((value >> (6 * i)) & 0x3F) as u32, 8);
        }
        Ok(())
    }

    /// Pad with zero bits up to the next byte boundary
    pub fn zero_pad_to_byte_boundary(&mut self) -> Result<(), FlacError> {
        if self.bits % 8 != 0 {
            self.write_zeroes(8 - self.bits % 8)?;
        }
        Ok(())
    }

    /// Byte view of everything written, including the partial trailing word
    ///
    /// The writer must be byte aligned.
    pub fn get_buffer(&mut self) -> Result<&[u8], FlacError> {
        if !self.is_byte_aligned() {
            return Err(FlacError::InvalidParameter("bit writer is not byte aligned"));
        }
        self.view.clear();
        self.view.reserve(self.words.len() * 4 + 4);
        for w in &self.words {
            self.view.extend_from_slice(&w.to_be_bytes());
        }
        for i in (0..self.bits / 8).rev() {
            self.view.push((self.accum >> (8 * i)) as u8);
        }
        Ok(&self.view)
    }

    /// CRC-8 of everything written
    pub fn crc8(&mut self) -> Result<u8, FlacError> {
        Ok(crc::crc8(self.get_buffer()?))
    }

    /// CRC-16 of everything written
    pub fn crc16(&mut self) -> Result<u16, FlacError> {
        Ok(crc::crc16(self.get_buffer()?))
    }
}

/// Zig-zag fold: 0, -1, 1, -2, ... to 0, 1, 2, 3, ...
#[inline]
pub(crate) fn fold(value: i32) -> u32 {
    ((value << 1) ^ (value >> 31)) as u32
}

pub(crate) fn check_rice_parameter(parameter: u32) -> Result<(), FlacError> {
    if parameter > crate::MAX_RICE_PARAMETER {
        return Err(FlacError::InvalidParameter("rice parameter"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_bits() {
        let mut w = BitWriter::new();
        w.write_raw_u32(0b101, 3).unwrap();
        w.write_raw_u32(0x1F, 5).unwrap();
        w.write_raw_u32(0xABCD, 16).unwrap();
        w.write_raw_i32(-1, 8).unwrap();
        assert_eq!(w.bits_written(), 32);
        assert_eq!(w.get_buffer().unwrap(), &[0xBF, 0xAB, 0xCD, 0xFF]);
    }

    #[test]
    fn test_wide_fields() {
        let mut w = BitWriter::new();
        w.write_raw_u64(0x1_2345_6789, 36).unwrap();
        w.write_raw_u32(0, 4).unwrap();
        assert_eq!(w.get_buffer().unwrap(), &[0x12, 0x34, 0x56, 0x78, 0x90]);
    }

    #[test]
    fn test_unary_and_padding() {
        let mut w = BitWriter::new();
        w.write_unary_unsigned(3).unwrap();
        assert!(!w.is_byte_aligned());
        assert!(w.get_buffer().is_err());
        w.zero_pad_to_byte_boundary().unwrap();
        assert_eq!(w.get_buffer().unwrap(), &[0b0001_0000]);

        let mut w = BitWriter::new();
        w.write_unary_unsigned(40).unwrap();
        w.zero_pad_to_byte_boundary().unwrap();
        assert_eq!(w.get_buffer().unwrap(), &[0, 0, 0, 0, 0, 0x40]);
    }

    #[test]
    fn test_rice() {
        // 0 -> "1", -1 -> "01", 1 -> "001" at parameter 0
        let mut w = BitWriter::new();
        w.write_rice_signed_block(&[0, -1, 1], 0).unwrap();
        w.zero_pad_to_byte_boundary().unwrap();
        assert_eq!(w.get_buffer().unwrap(), &[0b1010_0100]);

        // Parameter 2: 5 folds to 10 = 0b10_10 -> "001" + "10"
        let mut w = BitWriter::new();
        w.write_rice_signed(5, 2).unwrap();
        w.zero_pad_to_byte_boundary().unwrap();
        assert_eq!(w.get_buffer().unwrap(), &[0b0011_0000]);

        assert!(BitWriter::new().write_rice_signed(0, 31).is_err());
    }

    #[test]
    fn test_utf8() {
        let mut w = BitWriter::new();
        w.write_utf8_u32(0x41).unwrap();
        w.write_utf8_u32(0x7FF).unwrap();
        w.write_utf8_u64(0xF_FFFF_FFFF).unwrap();
        assert_eq!(
            w.get_buffer().unwrap(),
            &[0x41, 0xDF, 0xBF, 0xFE, 0xBF, 0xBF, 0xBF, 0xBF, 0xBF, 0xBF]
        );
        assert!(w.write_utf8_u32(0x8000_0000).is_err());
        assert!(w.write_utf8_u64(1 << 36).is_err());
    }

    #[test]
    fn test_growth() {
        let mut w = BitWriter::with_capacity(4);
        w.write_byte_block(&[0x55; 16]).unwrap();
        assert_eq!(w.capacity(), 4);
        w.write_raw_u32(1, 8).unwrap();
        // Grows by exactly what is needed when that beats a quarter step
        assert_eq!(w.capacity(), 5);

        let mut w = BitWriter::with_capacity(100);
        w.write_zeroes(100 * 32 + 1).unwrap();
        assert_eq!(w.capacity(), 125);
    }

    #[test]
    fn test_buffer_limit() {
        let mut w = BitWriter::with_capacity(1);
        let err = w.write_zeroes(u32::MAX).unwrap_err();
        assert!(matches!(err, FlacError::BufferLimit { .. }));
        assert_eq!(w.bits_written(), 0);
    }

    #[test]
    fn test_crc() {
        let mut w = BitWriter::new();
        w.write_byte_block(b"123456789").unwrap();
        assert_eq!(w.crc8().unwrap(), 0xF4);
        assert_eq!(w.crc16().unwrap(), 0xFEE8);
    }
}
