//! Instrument and envelope descriptors

use bitflags::bitflags;

use crate::{NUM_NOTES, PAN_CENTER};

/// New Note Action - what happens to the old note when a new one is played
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NewNoteAction {
    #[default]
    Cut,
    Continue,
    NoteOff,
    NoteFade,
}

impl NewNoteAction {
    /// Decode the two-bit IT/IMF encoding
    pub fn from_u8(value: u8) -> Self {
        match value & 3 {
            0 => Self::Cut,
            1 => Self::Continue,
            2 => Self::NoteOff,
            _ => Self::NoteFade,
        }
    }
}

/// Duplicate Check Type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DuplicateCheckType {
    #[default]
    Off,
    Note,
    Sample,
    Instrument,
}

impl DuplicateCheckType {
    pub fn from_u8(value: u8) -> Self {
        match value & 3 {
            0 => Self::Off,
            1 => Self::Note,
            2 => Self::Sample,
            _ => Self::Instrument,
        }
    }
}

/// Duplicate Check Action
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DuplicateCheckAction {
    #[default]
    Cut,
    NoteOff,
    NoteFade,
}

impl DuplicateCheckAction {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::NoteOff,
            2 => Self::NoteFade,
            _ => Self::Cut,
        }
    }
}

bitflags! {
    /// Envelope flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EnvelopeFlags: u8 {
        const ON = 0x01;
        const SUSTAIN = 0x02;
        const LOOP = 0x04;
        /// Pitch envelope drives the filter instead of pitch
        const FILTER = 0x08;
    }
}

bitflags! {
    /// Instrument flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct InstrumentFlags: u8 {
        /// Instrument panning overrides sample panning
        const OWNPAN = 0x01;
        /// Pitch-pan separation is active
        const PITCHPAN = 0x02;
    }
}

/// A single envelope node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnvelopePoint {
    /// Position in ticks
    pub pos: i16,
    /// Value (format-dependent range)
    pub val: i16,
}

/// An envelope with loop and sustain markers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    pub flags: EnvelopeFlags,
    pub points: Vec<EnvelopePoint>,
    /// Sustain loop start point index
    pub sus_begin: u8,
    /// Sustain loop end point index
    pub sus_end: u8,
    /// Loop start point index
    pub loop_begin: u8,
    /// Loop end point index
    pub loop_end: u8,
}

impl Envelope {
    /// Whether the envelope is active
    pub fn is_enabled(&self) -> bool {
        self.flags.contains(EnvelopeFlags::ON) && !self.points.is_empty()
    }

    /// Clamp loop and sustain indices to the point count
    pub fn clamp_markers(&mut self) {
        let last = self.points.len().saturating_sub(1) as u8;
        self.sus_begin = self.sus_begin.min(last);
        self.sus_end = self.sus_end.min(last);
        self.loop_begin = self.loop_begin.min(last);
        self.loop_end = self.loop_end.min(last);
    }
}

/// A multi-sample instrument
#[derive(Debug, Clone, PartialEq)]
pub struct Instrument {
    pub name: String,
    pub flags: InstrumentFlags,
    /// Sample played for each note (zero-based, `u16::MAX` = none)
    pub sample_number: [u16; NUM_NOTES],
    /// Note actually played for each note
    pub sample_note: [u8; NUM_NOTES],
    pub nna: NewNoteAction,
    pub dct: DuplicateCheckType,
    pub dca: DuplicateCheckAction,
    /// Global volume (0-64)
    pub global_volume: u8,
    /// Default panning (0-255)
    pub panning: u16,
    /// Pitch-pan separation (-32..32)
    pub pitch_pan_separation: i8,
    /// Pitch-pan center note
    pub pitch_pan_center: u8,
    /// Random volume variation (percent)
    pub random_volume: u8,
    /// Random panning variation
    pub random_panning: u8,
    /// Fadeout speed
    pub volume_fade: u16,
    pub volume_envelope: Envelope,
    pub panning_envelope: Envelope,
    pub pitch_envelope: Envelope,
}

impl Default for Instrument {
    fn default() -> Self {
        let mut sample_note = [0u8; NUM_NOTES];
        for (i, note) in sample_note.iter_mut().enumerate() {
            *note = i as u8;
        }
        Self {
            name: String::new(),
            flags: InstrumentFlags::empty(),
            sample_number: [u16::MAX; NUM_NOTES],
            sample_note,
            nna: NewNoteAction::Cut,
            dct: DuplicateCheckType::Off,
            dca: DuplicateCheckAction::Cut,
            global_volume: 64,
            panning: PAN_CENTER,
            pitch_pan_separation: 0,
            pitch_pan_center: 60,
            random_volume: 0,
            random_panning: 0,
            volume_fade: 0,
            volume_envelope: Envelope::default(),
            panning_envelope: Envelope::default(),
            pitch_envelope: Envelope::default(),
        }
    }
}

impl Instrument {
    /// Map every note to one sample
    pub fn map_all(&mut self, sample: u16) {
        self.sample_number = [sample; NUM_NOTES];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nna_from_u8() {
        assert_eq!(NewNoteAction::from_u8(0), NewNoteAction::Cut);
        assert_eq!(NewNoteAction::from_u8(3), NewNoteAction::NoteFade);
        assert_eq!(DuplicateCheckType::from_u8(2), DuplicateCheckType::Sample);
        assert_eq!(DuplicateCheckAction::from_u8(9), DuplicateCheckAction::Cut);
    }

    #[test]
    fn test_instrument_defaults() {
        let ins = Instrument::default();
        assert_eq!(ins.sample_note[60], 60);
        assert_eq!(ins.sample_number[0], u16::MAX);
    }

    #[test]
    fn test_clamp_markers() {
        let mut env = Envelope {
            points: vec![EnvelopePoint::default(); 3],
            loop_end: 10,
            ..Default::default()
        };
        env.clamp_markers();
        assert_eq!(env.loop_end, 2);
    }
}
