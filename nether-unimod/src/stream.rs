//! Seekable module reader
//!
//! Every read returns `Err(UniError::EndOfStream)` when the data runs out and also
//! latches [`ModuleStream::is_eof`], so loaders can either propagate with `?` or read a
//! block of fields and check the flag once.

use std::io::{Cursor, Read, Seek, SeekFrom};

use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use codepage_strings::Coding;

use crate::error::UniError;

/// DOS code page used by most trackers for names
const IBM850: u16 = 850;

/// Byte reader over an in-memory module file
pub struct ModuleStream<'a> {
    cursor: Cursor<&'a [u8]>,
    eof: bool,
    codepage: Option<Coding>,
}

impl std::fmt::Debug for ModuleStream<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleStream")
            .field("len", &self.len())
            .field("pos", &self.pos())
            .field("eof", &self.eof)
            .finish()
    }
}

macro_rules! read_fn {
    ($name:ident, $ty:ty, $call:ident) => {
        #[inline]
        pub fn $name(&mut self) -> Result<$ty, UniError> {
            let value = self.cursor.$call();
            self.check(value)
        }
    };
    ($name:ident, $ty:ty, $call:ident, $order:ty) => {
        #[inline]
        pub fn $name(&mut self) -> Result<$ty, UniError> {
            let value = self.cursor.$call::<$order>();
            self.check(value)
        }
    };
}

impl<'a> ModuleStream<'a> {
    /// Reader decoding names as IBM850
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(data),
            eof: false,
            codepage: Coding::new(IBM850).ok(),
        }
    }

    /// Reader decoding names as Latin-1
    pub fn latin1(data: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(data),
            eof: false,
            codepage: None,
        }
    }

    /// The whole underlying buffer
    pub fn data(&self) -> &'a [u8] {
        *self.cursor.get_ref()
    }

    /// Total length in bytes
    pub fn len(&self) -> u64 {
        self.cursor.get_ref().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.cursor.get_ref().is_empty()
    }

    /// Current position
    pub fn pos(&self) -> u64 {
        self.cursor.position()
    }

    /// Bytes left after the current position
    pub fn remaining(&self) -> u64 {
        self.len().saturating_sub(self.pos())
    }

    /// Whether a read ran past the end since the last seek
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    fn check<T>(&mut self, value: std::io::Result<T>) -> Result<T, UniError> {
        value.map_err(|_| {
            self.eof = true;
            UniError::EndOfStream
        })
    }

    /// Seek; positions beyond the end are allowed (the next read fails) but
    /// positions before the start are not
    pub fn seek(&mut self, to: SeekFrom) -> Result<u64, UniError> {
        let target = match to {
            SeekFrom::Start(p) => p as i64,
            SeekFrom::Current(d) => self.pos() as i64 + d,
            SeekFrom::End(d) => self.len() as i64 + d,
        };
        if target < 0 {
            return Err(UniError::SeekOutOfRange(target));
        }
        self.eof = false;
        self.cursor
            .seek(SeekFrom::Start(target as u64))
            .map_err(|_| UniError::SeekOutOfRange(target))
    }

    /// Seek to an absolute position
    pub fn seek_to(&mut self, pos: u64) -> Result<(), UniError> {
        self.seek(SeekFrom::Start(pos)).map(|_| ())
    }

    /// Skip `count` bytes forward
    pub fn skip(&mut self, count: u64) -> Result<(), UniError> {
        self.seek(SeekFrom::Current(count as i64)).map(|_| ())
    }

    read_fn!(read_u8, u8, read_u8);
    read_fn!(read_i8, i8, read_i8);
    read_fn!(read_u16_le, u16, read_u16, LittleEndian);
    read_fn!(read_i16_le, i16, read_i16, LittleEndian);
    read_fn!(read_u32_le, u32, read_u32, LittleEndian);
    read_fn!(read_i32_le, i32, read_i32, LittleEndian);
    read_fn!(read_u16_be, u16, read_u16, BigEndian);
    read_fn!(read_i16_be, i16, read_i16, BigEndian);
    read_fn!(read_u32_be, u32, read_u32, BigEndian);
    read_fn!(read_i32_be, i32, read_i32, BigEndian);

    /// Fill `buf` completely
    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), UniError> {
        let result = self.cursor.read_exact(buf);
        self.check(result)
    }

    /// Read a fixed-size byte array
    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], UniError> {
        let mut buf = [0u8; N];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Borrow the next `count` bytes without copying
    pub fn read_slice(&mut self, count: usize) -> Result<&'a [u8], UniError> {
        let start = self.pos() as usize;
        let data: &'a [u8] = *self.cursor.get_ref();
        let end = start.checked_add(count).filter(|&e| e <= data.len());
        match end {
            Some(end) => {
                self.cursor.set_position(end as u64);
                Ok(&data[start..end])
            }
            None => {
                self.eof = true;
                Err(UniError::EndOfStream)
            }
        }
    }

    /// Read `count` little-endian 16-bit values
    pub fn read_u16_le_vec(&mut self, count: usize) -> Result<Vec<u16>, UniError> {
        let bytes = self.read_slice(count * 2)?;
        Ok(bytes
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect())
    }

    /// Read `count` big-endian 16-bit values
    pub fn read_u16_be_vec(&mut self, count: usize) -> Result<Vec<u16>, UniError> {
        let bytes = self.read_slice(count * 2)?;
        Ok(bytes
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect())
    }

    /// Read a fixed-width name: stops at the first NUL, trims trailing whitespace
    pub fn read_string(&mut self, width: usize) -> Result<String, UniError> {
        let bytes = self.read_slice(width)?;
        Ok(self.decode(bytes))
    }

    /// Read a string prefixed by a 16-bit big-endian length
    pub fn read_pstring_be(&mut self) -> Result<String, UniError> {
        let len = self.read_u16_be()? as usize;
        self.read_string(len)
    }

    /// Read a string prefixed by a 16-bit little-endian length
    pub fn read_pstring_le(&mut self) -> Result<String, UniError> {
        let len = self.read_u16_le()? as usize;
        self.read_string(len)
    }

    /// Decode a name field with the stream's code page
    pub fn decode(&self, bytes: &[u8]) -> String {
        let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        let bytes = &bytes[..len];
        let text = match &self.codepage {
            Some(coding) => coding.decode_lossy(bytes).to_string(),
            None => bytes.iter().map(|&b| b as char).collect(),
        };
        text.trim_end().to_string()
    }

    /// Peek at bytes at an absolute offset without moving
    pub fn peek_at(&self, offset: u64, count: usize) -> Option<&'a [u8]> {
        let data: &'a [u8] = *self.cursor.get_ref();
        let start = usize::try_from(offset).ok()?;
        data.get(start..start.checked_add(count)?)
    }
}
