//! Unified track encoder
//!
//! Loaders translate one pattern channel at a time: [`UniWriter::reset`], then for each
//! source row any number of event calls followed by exactly one
//! [`UniWriter::new_row`], then [`UniWriter::finalize`] to obtain the track.
//!
//! Identical consecutive rows are merged into one entry with a repeat count. Finalized
//! tracks can be shared between identical (pattern, channel) pairs.

use std::sync::Arc;

use hashbrown::HashSet;
use tracing::trace;

use crate::error::UniError;
use crate::module::ModuleFlags;
use crate::opcodes;
use crate::track::validate_track;

/// Longest row the 5-bit length field can describe, header included
const MAX_ROW_LEN: usize = 0x1F;

/// Highest repeat count a row header can hold
const MAX_REPEAT: u8 = 8;

/// Unified track encoder
#[derive(Debug)]
pub struct UniWriter {
    buf: Vec<u8>,
    /// Header offset of the row being written
    row_start: usize,
    /// Header offset of the previous row
    last_row: usize,
    /// First structural error seen since reset
    pending: Option<UniError>,
    dedup: Option<HashSet<Arc<[u8]>>>,
}

impl Default for UniWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl UniWriter {
    /// Create an encoder with track deduplication enabled
    pub fn new() -> Self {
        Self::with_dedup(true)
    }

    /// Create an encoder, optionally sharing identical finalized tracks
    pub fn with_dedup(dedup: bool) -> Self {
        let mut writer = Self {
            buf: Vec::with_capacity(256),
            row_start: 0,
            last_row: 0,
            pending: None,
            dedup: dedup.then(HashSet::new),
        };
        writer.reset();
        writer
    }

    /// Begin a new track
    pub fn reset(&mut self) {
        self.buf.clear();
        self.buf.push(0);
        self.row_start = 0;
        self.last_row = 0;
        self.pending = None;
    }

    /// Number of distinct tracks handed out since creation
    pub fn unique_tracks(&self) -> usize {
        self.dedup.as_ref().map_or(0, |d| d.len())
    }

    /// Events written so far for the current row
    pub fn current_row(&self) -> &[u8] {
        &self.buf[self.row_start + 1..]
    }

    fn write_byte(&mut self, value: u8) {
        self.buf.push(value);
    }

    fn write_word(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Append an effect with its operand
    ///
    /// Opcode 0 is ignored. Out-of-range opcodes are written as-is and rejected by
    /// [`UniWriter::finalize`].
    pub fn effect(&mut self, opcode: u8, param: u16) {
        if opcode == 0 {
            return;
        }
        self.write_byte(opcode);
        match opcodes::operand_len(opcode) {
            Some(2) => self.write_word(param),
            Some(1) => self.write_byte(param as u8),
            Some(_) => {}
            None => {
                self.pending.get_or_insert(UniError::InvalidOpcode {
                    opcode,
                    offset: self.buf.len() - 1,
                });
            }
        }
    }

    /// Trigger a note (`octave * 12 + semitone`)
    pub fn note(&mut self, note: u8) {
        self.effect(opcodes::NOTE, note as u16);
    }

    /// Select an instrument (zero-based)
    pub fn instrument(&mut self, index: u8) {
        self.effect(opcodes::INSTRUMENT, index as u16);
    }

    /// Note off
    pub fn key_off(&mut self) {
        self.effect(opcodes::KEYOFF, 0);
    }

    /// Volume column event; nothing is written when both kind and value are zero
    pub fn vol_effect(&mut self, kind: u8, value: u8) {
        if kind != 0 || value != 0 {
            self.write_byte(opcodes::VOLEFFECTS);
            self.write_byte(kind);
            self.write_byte(value);
        }
    }

    /// ProTracker effect `0x0`-`0xF`
    ///
    /// An empty `000` command is dropped unless the module keeps arpeggio memory, in
    /// which case it is significant.
    pub fn pt_effect(&mut self, effect: u8, param: u8, flags: ModuleFlags) {
        if effect != 0 || param != 0 || flags.contains(ModuleFlags::ARPMEM) {
            self.effect(opcodes::PTEFFECT0 + (effect & 0x0F), param as u16);
        }
    }

    /// Close the current row
    pub fn new_row(&mut self) {
        let prev_repeat = (self.buf[self.last_row] >> 5) + 1;
        let prev_len = (self.buf[self.last_row] & 0x1F) as usize;
        let len = self.buf.len() - self.row_start;

        if self.row_start != self.last_row
            && prev_repeat < MAX_REPEAT
            && len == prev_len
            && self.buf[self.last_row + 1..self.last_row + prev_len]
                == self.buf[self.row_start + 1..]
        {
            self.buf[self.last_row] += 0x20;
            self.buf.truncate(self.row_start + 1);
        } else {
            if len > MAX_ROW_LEN {
                self.pending.get_or_insert(UniError::RowTooLong(len));
            }
            self.buf[self.row_start] = len as u8 & 0x1F;
            self.last_row = self.row_start;
            self.row_start = self.buf.len();
            self.buf.push(0);
        }
    }

    /// Terminate and validate the current track
    ///
    /// Returns a shared buffer; when deduplication is enabled an earlier identical
    /// track is returned instead of a new allocation.
    pub fn finalize(&mut self) -> Result<Arc<[u8]>, UniError> {
        self.buf[self.row_start] = 0;
        self.buf.truncate(self.row_start + 1);

        if let Some(err) = self.pending.take() {
            return Err(err);
        }
        validate_track(&self.buf)?;

        match &mut self.dedup {
            Some(seen) => {
                if let Some(existing) = seen.get(self.buf.as_slice()) {
                    trace!("uniwriter: sharing identical {}-byte track", existing.len());
                    return Ok(Arc::clone(existing));
                }
                let track: Arc<[u8]> = Arc::from(self.buf.as_slice());
                seen.insert(Arc::clone(&track));
                Ok(track)
            }
            None => Ok(Arc::from(self.buf.as_slice())),
        }
    }

    /// Finalize a track of `rows` empty rows
    pub fn empty_track(&mut self, rows: u16) -> Result<Arc<[u8]>, UniError> {
        self.reset();
        for _ in 0..rows {
            self.new_row();
        }
        self.finalize()
    }
}
