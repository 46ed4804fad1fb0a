//! MSB-first bit reader over any byte source
//!
//! Input is buffered as big-endian 32-bit words. The last word may be partial: its
//! `bytes` valid bytes sit in the high end and the rest is zero. Consumed words are
//! shifted out on refill, after the running CRC-16 has caught up with them.

use std::io::{ErrorKind, Read};

use tracing::trace;

use crate::crc;
use crate::error::FlacError;

const DEFAULT_CAPACITY_WORDS: usize = 2048;

/// Buffered bit cursor over `R`
#[derive(Debug)]
pub struct BitReader<R> {
    source: R,
    /// `words` complete words, then the partial tail word when `bytes > 0`
    buffer: Vec<u32>,
    words: usize,
    bytes: usize,
    consumed_words: usize,
    consumed_bits: u32,
    capacity_words: usize,
    /// Bits still allowed before [`FlacError::ReadLimit`]
    read_limit: Option<u64>,
    crc16: u16,
    /// First buffered byte not yet folded into `crc16`
    crc_pos: usize,
    /// Bit position of the last frame sync within the buffer
    framesync: Option<usize>,
    scratch: Vec<u8>,
}

impl<R: Read> BitReader<R> {
    pub fn new(source: R) -> Self {
        Self::with_capacity(source, DEFAULT_CAPACITY_WORDS)
    }

    /// Reader buffering at most `words` 32-bit words (at least 2)
    pub fn with_capacity(source: R, words: usize) -> Self {
        let capacity_words = words.max(2);
        Self {
            source,
            buffer: Vec::with_capacity(capacity_words),
            words: 0,
            bytes: 0,
            consumed_words: 0,
            consumed_bits: 0,
            capacity_words,
            read_limit: None,
            crc16: 0,
            crc_pos: 0,
            framesync: None,
            scratch: vec![0; capacity_words * 4],
        }
    }

    pub fn into_inner(self) -> R {
        self.source
    }

    /// Buffered bits not yet consumed
    pub fn bits_unconsumed(&self) -> u64 {
        let total = self.words as u64 * 32 + self.bytes as u64 * 8;
        total - self.bit_pos() as u64
    }

    fn bit_pos(&self) -> usize {
        self.consumed_words * 32 + self.consumed_bits as usize
    }

    pub fn is_consumed_byte_aligned(&self) -> bool {
        self.consumed_bits % 8 == 0
    }

    /// Bits to skip before the cursor is byte aligned (0 when it already is)
    pub fn bits_left_for_byte_alignment(&self) -> u32 {
        (8 - self.consumed_bits % 8) % 8
    }

    /// Allow at most `bits` more bits to be consumed
    pub fn set_read_limit(&mut self, bits: u64) {
        self.read_limit = Some(bits);
    }

    pub fn remove_read_limit(&mut self) {
        self.read_limit = None;
    }

    pub fn read_limit(&self) -> Option<u64> {
        self.read_limit
    }

    fn take_limit(&mut self, bits: u64) -> Result<(), FlacError> {
        if let Some(left) = self.read_limit {
            if bits > left {
                return Err(FlacError::ReadLimit);
            }
            self.read_limit = Some(left - bits);
        }
        Ok(())
    }

    fn byte_at(&self, index: usize) -> u8 {
        (self.buffer[index / 4] >> (24 - 8 * (index % 4))) as u8
    }

    fn update_crc_to(&mut self, end: usize) {
        while self.crc_pos < end {
            self.crc16 = crc::crc16_update(self.crc16, self.byte_at(self.crc_pos));
            self.crc_pos += 1;
        }
    }

    /// Drop fully consumed words from the front of the buffer
    fn shift_consumed(&mut self) {
        let shift = self.consumed_words;
        if shift == 0 {
            return;
        }
        let shift_bytes = shift * 4;
        self.update_crc_to(shift_bytes);
        self.crc_pos -= shift_bytes;
        self.framesync = self
            .framesync
            .and_then(|mark| mark.checked_sub(shift * 32));
        self.buffer.drain(..shift);
        self.words -= shift;
        self.consumed_words = 0;
    }

    /// Pull more bytes from the source; `false` once it is exhausted
    fn refill(&mut self) -> Result<bool, FlacError> {
        self.shift_consumed();
        let tail = self.bytes;
        let free = (self.capacity_words - self.words) * 4 - tail;
        if free == 0 {
            return Ok(false);
        }
        for i in 0..tail {
            let b = self.byte_at(self.words * 4 + i);
            self.scratch[i] = b;
        }
        let n = loop {
            match self.source.read(&mut self.scratch[tail..tail + free]) {
                Ok(n) => break n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        };
        if n == 0 {
            return Ok(false);
        }

        if tail > 0 {
            self.buffer.pop();
        }
        self.bytes = 0;
        for chunk in self.scratch[..tail + n].chunks(4) {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            self.buffer.push(u32::from_be_bytes(word));
            if chunk.len() == 4 {
                self.words += 1;
            } else {
                self.bytes = chunk.len();
            }
        }
        trace!("bitreader: refilled {n} bytes");
        Ok(true)
    }

    fn ensure_bits(&mut self, bits: u32) -> Result<(), FlacError> {
        while self.bits_unconsumed() < bits as u64 {
            if !self.refill()? {
                return Err(FlacError::EndOfStream);
            }
        }
        Ok(())
    }

    /// Next 32 bits from the cursor, left-justified, zero past the buffered data
    #[inline]
    fn peek_word(&self) -> u32 {
        let Some(&head) = self.buffer.get(self.consumed_words) else {
            return 0;
        };
        let head = head << self.consumed_bits;
        if self.consumed_bits == 0 {
            return head;
        }
        let next = self
            .buffer
            .get(self.consumed_words + 1)
            .map_or(0, |&w| w >> (32 - self.consumed_bits));
        head | next
    }

    #[inline]
    fn advance(&mut self, bits: u32) {
        let pos = self.consumed_bits + bits;
        self.consumed_words += (pos / 32) as usize;
        self.consumed_bits = pos % 32;
    }

    /// Read `bits` (<= 32) bits as an unsigned value
    pub fn read_raw_u32(&mut self, bits: u32) -> Result<u32, FlacError> {
        if bits > 32 {
            return Err(FlacError::InvalidParameter("more than 32 bits"));
        }
        if bits == 0 {
            return Ok(0);
        }
        self.ensure_bits(bits)?;
        self.take_limit(bits as u64)?;
        let value = self.peek_word() >> (32 - bits);
        self.advance(bits);
        Ok(value)
    }

    /// Read a `bits`-wide two's complement field
    pub fn read_raw_i32(&mut self, bits: u32) -> Result<i32, FlacError> {
        let value = self.read_raw_u32(bits)?;
        if bits == 0 {
            return Ok(0);
        }
        Ok(((value << (32 - bits)) as i32) >> (32 - bits))
    }

    /// Read `bits` (<= 64) bits as an unsigned value
    pub fn read_raw_u64(&mut self, bits: u32) -> Result<u64, FlacError> {
        if bits > 64 {
            return Err(FlacError::InvalidParameter("more than 64 bits"));
        }
        if bits <= 32 {
            return self.read_raw_u32(bits).map(u64::from);
        }
        let hi = self.read_raw_u32(bits - 32)? as u64;
        let lo = self.read_raw_u32(32)? as u64;
        Ok(hi << 32 | lo)
    }

    /// Read a 32-bit little-endian field
    pub fn read_u32_le(&mut self) -> Result<u32, FlacError> {
        let mut bytes = [0u8; 4];
        for b in &mut bytes {
            *b = self.read_raw_u32(8)? as u8;
        }
        Ok(u32::from_le_bytes(bytes))
    }

    pub fn skip_bits(&mut self, bits: u64) -> Result<(), FlacError> {
        let mut left = bits;
        while left > 0 {
            let n = left.min(32) as u32;
            self.read_raw_u32(n)?;
            left -= n as u64;
        }
        Ok(())
    }

    /// Count zero bits up to and including the next one bit
    pub fn read_unary_unsigned(&mut self) -> Result<u32, FlacError> {
        let mut zeros = 0u32;
        loop {
            if self.bits_unconsumed() == 0 && !self.refill()? {
                return Err(FlacError::EndOfStream);
            }
            let avail = self.bits_unconsumed().min(32) as u32;
            let lead = self.peek_word().leading_zeros();
            if lead < avail {
                self.take_limit(lead as u64 + 1)?;
                self.advance(lead + 1);
                return Ok(zeros.saturating_add(lead));
            }
            self.take_limit(avail as u64)?;
            self.advance(avail);
            zeros = zeros.saturating_add(avail);
        }
    }

    /// Decode one Rice-coded signed value
    pub fn read_rice_signed(&mut self, parameter: u32) -> Result<i32, FlacError> {
        crate::bitwriter::check_rice_parameter(parameter)?;
        self.read_rice(parameter)
    }

    #[inline]
    fn read_rice(&mut self, parameter: u32) -> Result<i32, FlacError> {
        let msbs = self.read_unary_unsigned()?;
        let lsbs = if parameter == 0 {
            0
        } else {
            self.read_raw_u32(parameter)?
        };
        Ok(unfold((msbs << parameter) | lsbs))
    }

    /// Decode `out.len()` Rice-coded signed values sharing one parameter
    ///
    /// Codes that fit the next buffered word are decoded straight from it; the rest
    /// go through the unary and raw readers.
    pub fn read_rice_signed_block(
        &mut self,
        out: &mut [i32],
        parameter: u32,
    ) -> Result<(), FlacError> {
        crate::bitwriter::check_rice_parameter(parameter)?;
        for value in out.iter_mut() {
            if self.bits_unconsumed() >= 32 {
                let word = self.peek_word();
                let zeros = word.leading_zeros();
                let len = zeros + 1 + parameter;
                if len <= 32 && self.read_limit.is_none_or(|left| len as u64 <= left) {
                    let lsbs = (((word as u64) << (zeros + 1)) & 0xFFFF_FFFF) >> (32 - parameter);
                    self.take_limit(len as u64)?;
                    self.advance(len);
                    *value = unfold((zeros << parameter) | lsbs as u32);
                    continue;
                }
            }
            *value = self.read_rice(parameter)?;
        }
        Ok(())
    }

    /// Decode a UTF-8 style number of up to 31 bits
    ///
    /// Structurally invalid codes yield `u32::MAX`; only source exhaustion is an error.
    pub fn read_utf8_u32(&mut self) -> Result<u32, FlacError> {
        Ok(self
            .read_utf8(5)?
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(u32::MAX))
    }

    /// Decode a UTF-8 style number of up to 36 bits
    ///
    /// Structurally invalid codes yield `u64::MAX`.
    pub fn read_utf8_u64(&mut self) -> Result<u64, FlacError> {
        Ok(self.read_utf8(6)?.unwrap_or(u64::MAX))
    }

    fn read_utf8(&mut self, max_continuation: u32) -> Result<Option<u64>, FlacError> {
        let lead = self.read_raw_u32(8)? as u8;
        let ones = lead.leading_ones();
        if ones == 0 {
            return Ok(Some(lead as u64));
        }
        let continuation = ones - 1;
        if continuation == 0 || continuation > max_continuation {
            return Ok(None);
        }
        let mut value = (lead & (0x7F >> ones)) as u64;
        for _ in 0..continuation {
            let b = self.read_raw_u32(8)?;
            if b & 0xC0 != 0x80 {
                return Ok(None);
            }
            value = value << 6 | (b & 0x3F) as u64;
        }
        Ok(Some(value))
    }

    /// Fill `out` from a byte-aligned cursor
    pub fn read_byte_block_aligned(&mut self, out: &mut [u8]) -> Result<(), FlacError> {
        if !self.is_consumed_byte_aligned() {
            return Err(FlacError::InvalidParameter("bit reader is not byte aligned"));
        }
        for b in out {
            *b = self.read_raw_u32(8)? as u8;
        }
        Ok(())
    }

    pub fn skip_byte_block_aligned(&mut self, count: usize) -> Result<(), FlacError> {
        if !self.is_consumed_byte_aligned() {
            return Err(FlacError::InvalidParameter("bit reader is not byte aligned"));
        }
        self.skip_bits(count as u64 * 8)
    }

    /// Start a CRC-16 at the cursor, which must be byte aligned
    pub fn reset_read_crc16(&mut self, seed: u16) -> Result<(), FlacError> {
        if !self.is_consumed_byte_aligned() {
            return Err(FlacError::InvalidParameter("bit reader is not byte aligned"));
        }
        self.crc16 = seed;
        self.crc_pos = self.bit_pos() / 8;
        Ok(())
    }

    /// CRC-16 of the bytes consumed since [`BitReader::reset_read_crc16`]
    pub fn get_read_crc16(&mut self) -> Result<u16, FlacError> {
        if !self.is_consumed_byte_aligned() {
            return Err(FlacError::InvalidParameter("bit reader is not byte aligned"));
        }
        self.update_crc_to(self.bit_pos() / 8);
        Ok(self.crc16)
    }

    /// Remember the cursor as the start of a frame sync code
    pub fn set_framesync_location(&mut self) {
        self.framesync = Some(self.bit_pos());
    }

    /// Move the cursor to the byte after the last remembered frame sync
    ///
    /// Returns `false` when no sync is remembered or it has left the buffer.
    pub fn rewind_to_after_last_framesync(&mut self) -> bool {
        let Some(mark) = self.framesync.take() else {
            return false;
        };
        let byte = mark / 8 + 1;
        let limit = self.words * 4 + self.bytes;
        if byte > limit {
            return false;
        }
        self.consumed_words = byte / 4;
        self.consumed_bits = (byte % 4) as u32 * 8;
        self.crc_pos = byte;
        true
    }
}

/// Zig-zag unfold: 0, 1, 2, 3, ... to 0, -1, 1, -2, ...
#[inline]
fn unfold(value: u32) -> i32 {
    (value >> 1) as i32 ^ -((value & 1) as i32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BitWriter;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// Source handing out at most three bytes per read
    struct Trickle<'a>(&'a [u8]);

    impl Read for Trickle<'_> {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = buf.len().min(self.0.len()).min(3);
            buf[..n].copy_from_slice(&self.0[..n]);
            self.0 = &self.0[n..];
            Ok(n)
        }
    }

    fn written(w: &mut BitWriter) -> Vec<u8> {
        w.zero_pad_to_byte_boundary().unwrap();
        w.get_buffer().unwrap().to_vec()
    }

    #[test]
    fn test_raw_reads() {
        let data = [0xBF, 0xAB, 0xCD, 0xFF, 0x80];
        let mut r = BitReader::new(&data[..]);
        assert_eq!(r.read_raw_u32(3).unwrap(), 0b101);
        assert_eq!(r.read_raw_u32(5).unwrap(), 0x1F);
        assert_eq!(r.read_raw_u32(16).unwrap(), 0xABCD);
        assert_eq!(r.read_raw_i32(8).unwrap(), -1);
        assert_eq!(r.read_raw_i32(1).unwrap(), -1);
        assert_eq!(r.read_raw_u32(7).unwrap(), 0);
        assert!(matches!(r.read_raw_u32(1), Err(FlacError::EndOfStream)));
    }

    #[test]
    fn test_raw_round_trip() {
        let mut rng = StdRng::seed_from_u64(7);
        let fields: Vec<(u64, u32)> = (0..2000)
            .map(|_| {
                let bits = rng.random_range(1..=64u32);
                let value = rng.random::<u64>() >> (64 - bits);
                (value, bits)
            })
            .collect();

        let mut w = BitWriter::new();
        for &(value, bits) in &fields {
            w.write_raw_u64(value, bits).unwrap();
        }
        let data = written(&mut w);

        let mut r = BitReader::with_capacity(Trickle(&data), 4);
        for &(value, bits) in &fields {
            assert_eq!(r.read_raw_u64(bits).unwrap(), value, "{bits} bits");
        }
    }

    #[test]
    fn test_unary_across_refills() {
        let mut w = BitWriter::new();
        for zeros in [0, 1, 31, 32, 33, 100, 7] {
            w.write_unary_unsigned(zeros).unwrap();
        }
        let data = written(&mut w);
        let mut r = BitReader::with_capacity(Trickle(&data), 2);
        for zeros in [0, 1, 31, 32, 33, 100, 7] {
            assert_eq!(r.read_unary_unsigned().unwrap(), zeros);
        }
    }

    #[test]
    fn test_rice_unary_only() {
        // "1" and "01" are 0 and -1 at parameter 0
        let mut r = BitReader::new(&[0b1010_0000u8][..]);
        let mut out = [0i32; 2];
        r.read_rice_signed_block(&mut out, 0).unwrap();
        assert_eq!(out, [0, -1]);

        // Stop bits 1,1,0,1,1,1,0
        let mut r = BitReader::new(&[0b1101_1100u8][..]);
        let mut out = [0i32; 5];
        r.read_rice_signed_block(&mut out, 0).unwrap();
        assert_eq!(out, [0, 0, -1, 0, 0]);
    }

    #[test]
    fn test_rice_round_trip() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for parameter in 0..=30 {
            let span = 1i64 << (parameter + 4);
            let values: Vec<i32> = (0..300)
                .map(|_| rng.random_range(-span..span).clamp(i32::MIN as i64, i32::MAX as i64) as i32)
                .collect();

            let mut w = BitWriter::new();
            w.write_rice_signed_block(&values, parameter).unwrap();
            w.write_rice_signed(values[0], parameter).unwrap();
            let data = written(&mut w);

            let mut r = BitReader::with_capacity(Trickle(&data), 3);
            let mut out = vec![0i32; values.len()];
            r.read_rice_signed_block(&mut out, parameter).unwrap();
            assert_eq!(out, values, "parameter {parameter}");
            assert_eq!(r.read_rice_signed(parameter).unwrap(), values[0]);
        }
    }

    #[test]
    fn test_rice_extremes() {
        let values = [i32::MAX, i32::MIN, 0, -1];
        let mut w = BitWriter::new();
        w.write_rice_signed_block(&values, 30).unwrap();
        let data = written(&mut w);
        let mut r = BitReader::new(&data[..]);
        let mut out = [0i32; 4];
        r.read_rice_signed_block(&mut out, 30).unwrap();
        assert_eq!(out, values);
    }

    #[test]
    fn test_utf8_round_trip() {
        let values = [0u64, 0x7F, 0x80, 0x7FF, 0x800, 0xFFFF, 0x1F_FFFF, 0x3FF_FFFF, 0x7FFF_FFFF];
        let mut w = BitWriter::new();
        for &v in &values {
            w.write_utf8_u32(v as u32).unwrap();
        }
        w.write_utf8_u64(0xF_FFFF_FFFF).unwrap();
        let data = written(&mut w);

        let mut r = BitReader::new(&data[..]);
        for &v in &values {
            assert_eq!(r.read_utf8_u32().unwrap() as u64, v);
        }
        assert_eq!(r.read_utf8_u64().unwrap(), 0xF_FFFF_FFFF);
    }

    #[test]
    fn test_utf8_invalid_is_sentinel() {
        // Stray continuation byte as lead
        let mut r = BitReader::new(&[0x80u8, 0x41][..]);
        assert_eq!(r.read_utf8_u32().unwrap(), u32::MAX);
        assert_eq!(r.read_utf8_u32().unwrap(), 0x41);

        // Lead byte followed by a non-continuation byte
        let mut r = BitReader::new(&[0xC2u8, 0x41][..]);
        assert_eq!(r.read_utf8_u32().unwrap(), u32::MAX);

        // Seven-byte codes only exist in the 36-bit form
        let seven = [0xFEu8, 0x80, 0x80, 0x80, 0x80, 0x80, 0x81];
        assert_eq!(BitReader::new(&seven[..]).read_utf8_u32().unwrap(), u32::MAX);
        assert_eq!(BitReader::new(&seven[..]).read_utf8_u64().unwrap(), 1);
        assert_eq!(BitReader::new(&[0xFFu8][..]).read_utf8_u64().unwrap(), u64::MAX);

        // Running out mid-code is still an error
        assert!(BitReader::new(&[0xE0u8, 0x80][..]).read_utf8_u32().is_err());
    }

    #[test]
    fn test_read_limit() {
        let mut r = BitReader::new(&[0u8; 8][..]);
        r.set_read_limit(12);
        r.read_raw_u32(8).unwrap();
        assert!(matches!(r.read_raw_u32(8), Err(FlacError::ReadLimit)));
        assert_eq!(r.read_limit(), Some(4));
        r.remove_read_limit();
        r.read_raw_u32(16).unwrap();
    }

    #[test]
    fn test_crc16_spans_refills() {
        let mut data = b"xx123456789".to_vec();
        data.extend_from_slice(&[0u8; 16]);
        let mut r = BitReader::with_capacity(Trickle(&data), 2);
        r.skip_byte_block_aligned(2).unwrap();
        r.reset_read_crc16(0).unwrap();
        let mut body = [0u8; 9];
        r.read_byte_block_aligned(&mut body).unwrap();
        assert_eq!(&body, b"123456789");
        assert_eq!(r.get_read_crc16().unwrap(), 0xFEE8);

        r.read_raw_u32(3).unwrap();
        assert!(r.get_read_crc16().is_err());
        assert_eq!(r.bits_left_for_byte_alignment(), 5);
    }

    #[test]
    fn test_framesync_rewind() {
        let data = [0xFFu8, 0xF8, 0x12, 0x34, 0xFF, 0xF8];
        let mut r = BitReader::new(&data[..]);
        assert!(!r.rewind_to_after_last_framesync());

        r.set_framesync_location();
        assert_eq!(r.read_raw_u32(16).unwrap(), 0xFFF8);
        r.read_raw_u32(13).unwrap();
        assert!(r.rewind_to_after_last_framesync());
        assert_eq!(r.read_raw_u32(8).unwrap(), 0xF8);
        // The mark is used up
        assert!(!r.rewind_to_after_last_framesync());
    }
}
