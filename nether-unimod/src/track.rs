//! Reading and validating finalized unified tracks
//!
//! A track is a sequence of rows terminated by a zero byte. Each row starts with a
//! header byte: the low 5 bits hold the row length (header included) and the high
//! 3 bits hold the number of extra times the row repeats.

use crate::error::UniError;
use crate::opcodes;

/// A single decoded row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Row<'a> {
    /// How many pattern rows this entry covers (1-8)
    pub repeat: u8,
    /// Event bytes following the header
    pub data: &'a [u8],
}

impl<'a> Row<'a> {
    /// Iterate the events in this row
    pub fn events(&self) -> Events<'a> {
        Events {
            data: self.data,
            pos: 0,
        }
    }
}

/// A decoded track event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Note(u8),
    Instrument(u8),
    KeyOff,
    /// Volume column event (kind from [`opcodes::vol`], value)
    Volume { kind: u8, value: u8 },
    /// Any other effect opcode with its operand (0 for operand-less opcodes)
    Effect { opcode: u8, param: u16 },
}

/// Iterator over the rows of a track
pub struct Rows<'a> {
    track: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for Rows<'a> {
    type Item = Row<'a>;

    fn next(&mut self) -> Option<Row<'a>> {
        let header = *self.track.get(self.pos)?;
        if header == 0 {
            return None;
        }
        let len = (header & 0x1F) as usize;
        if len == 0 {
            return None;
        }
        let end = (self.pos + len).min(self.track.len());
        let data = &self.track[self.pos + 1..end];
        self.pos += len;
        Some(Row {
            repeat: (header >> 5) + 1,
            data,
        })
    }
}

/// Iterator over the events of a row
///
/// Stops at the first malformed event; run [`validate_track`] first when the
/// track comes from an untrusted source.
pub struct Events<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Iterator for Events<'_> {
    type Item = Event;

    fn next(&mut self) -> Option<Event> {
        let opcode = *self.data.get(self.pos)?;
        let len = opcodes::operand_len(opcode)?;
        let operands = self.data.get(self.pos + 1..self.pos + 1 + len)?;
        self.pos += 1 + len;

        let event = match (opcode, operands) {
            (opcodes::NOTE, [n]) => Event::Note(*n),
            (opcodes::INSTRUMENT, [i]) => Event::Instrument(*i),
            (opcodes::KEYOFF, []) => Event::KeyOff,
            (opcodes::VOLEFFECTS, [kind, value]) => Event::Volume {
                kind: *kind,
                value: *value,
            },
            (_, []) => Event::Effect { opcode, param: 0 },
            (_, [p]) => Event::Effect {
                opcode,
                param: *p as u16,
            },
            (_, [hi, lo]) => Event::Effect {
                opcode,
                param: u16::from_be_bytes([*hi, *lo]),
            },
            _ => return None,
        };
        Some(event)
    }
}

/// Iterate the rows of a track
pub fn rows(track: &[u8]) -> Rows<'_> {
    Rows { track, pos: 0 }
}

/// Locate the row covering pattern row `row`, honoring repeat counts
///
/// Returns `None` when the track ends before `row`.
pub fn find_row(track: &[u8], mut row: u16) -> Option<Row<'_>> {
    for entry in rows(track) {
        let repeat = entry.repeat as u16;
        if repeat > row {
            return Some(entry);
        }
        row -= repeat;
    }
    None
}

/// Total number of pattern rows a track covers
pub fn row_count(track: &[u8]) -> usize {
    rows(track).map(|r| r.repeat as usize).sum()
}

/// Check a track's structure
///
/// Every row header must be non-empty and fit in the buffer, every opcode must be in
/// range, operands must end exactly at the row boundary and the track must end with a
/// zero terminator. Returns the number of pattern rows covered.
pub fn validate_track(track: &[u8]) -> Result<usize, UniError> {
    let mut pos = 0;
    let mut total = 0;

    loop {
        let header = *track.get(pos).ok_or(UniError::Unterminated)?;
        if header == 0 {
            return Ok(total);
        }

        let len = (header & 0x1F) as usize;
        if len == 0 {
            return Err(UniError::EmptyRow(pos));
        }
        let row_end = pos + len;
        if row_end > track.len() {
            return Err(UniError::Unterminated);
        }

        let mut p = pos + 1;
        while p < row_end {
            let opcode = track[p];
            let operands =
                opcodes::operand_len(opcode).ok_or(UniError::InvalidOpcode { opcode, offset: p })?;
            if p + 1 + operands > row_end {
                return Err(UniError::OperandOverrun { opcode, offset: p });
            }
            p += 1 + operands;
        }

        total += ((header >> 5) + 1) as usize;
        pos = row_end;
    }
}
