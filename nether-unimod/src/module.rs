//! Module descriptor
//!
//! Loaders fill in the header counts first, then size the arrays through the
//! `alloc_*` calls in order: positions, samples, patterns/tracks, instruments.

use std::sync::Arc;

use bitflags::bitflags;
use tracing::trace;

use crate::error::UniError;
use crate::instrument::Instrument;
use crate::sample::{Sample, SampleFlags};
use crate::track::validate_track;
use crate::{LAST_PATTERN, MAX_CHANNELS, PAN_CENTER};

/// Upper bound on the order list length
pub const MAX_POSITIONS: usize = 0x1000;
/// Upper bound on the number of tracks
pub const MAX_TRACKS: usize = 0x10000;

bitflags! {
    /// Module-wide playback semantics
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ModuleFlags: u16 {
        /// Use Fasttracker 2 period tables
        const XMPERIODS = 0x0001;
        /// Linear frequency slides
        const LINEAR = 0x0002;
        /// Module uses instruments rather than bare samples
        const INST = 0x0004;
        /// Module uses new note actions
        const NNA = 0x0008;
        /// Scream Tracker 3 volume slide quirks
        const S3MSLIDES = 0x0010;
        /// Continue volume slides in the background
        const BGSLIDES = 0x0020;
        /// Tempo may exceed 255 BPM
        const HIGHBPM = 0x0040;
        /// Song does not wrap around at the end
        const NOWRAP = 0x0080;
        /// Arpeggio has memory
        const ARPMEM = 0x0100;
        /// Emulate Fasttracker 2 replay quirks
        const FT2QUIRKS = 0x0200;
        /// Module carries its own channel panning
        const PANNING = 0x0400;
    }
}

/// Allocation progress
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
enum Stage {
    #[default]
    Header,
    Positions,
    Samples,
    Patterns,
    Tracks,
    Instruments,
}

/// A loaded module in the unified representation
#[derive(Debug, Clone)]
pub struct Module {
    /// Song title
    pub song_name: String,
    /// Format and tracker description, e.g. "Scream Tracker 3.20"
    pub mod_type: String,
    /// Song message
    pub comment: String,
    pub flags: ModuleFlags,

    /// Channels actually used
    pub num_chn: u16,
    /// Order list length
    pub num_pos: u16,
    pub num_pat: u16,
    pub num_ins: u16,
    pub num_smp: u16,
    pub num_trk: u32,

    /// Restart position
    pub rep_pos: u16,
    /// Ticks per row
    pub init_speed: u8,
    /// Beats per minute
    pub init_tempo: u16,
    /// Global volume (0-128)
    pub init_volume: u8,
    /// Lowest tempo the song may set
    pub bpm_limit: u16,

    /// Initial channel panning (0-255 or [`crate::PAN_SURROUND`])
    pub panning: [u16; MAX_CHANNELS],
    /// Initial channel volume (0-64)
    pub chan_vol: [u8; MAX_CHANNELS],

    /// Order list; values are pattern indices or [`LAST_PATTERN`]
    pub positions: Vec<u16>,
    /// Rows per pattern
    pub pattern_rows: Vec<u16>,
    /// Track index for every (pattern, channel) pair, row-major by pattern
    pub patterns: Vec<u32>,
    /// Finalized tracks; `None` marks a silent placeholder
    pub tracks: Vec<Option<Arc<[u8]>>>,
    pub samples: Vec<Sample>,
    pub instruments: Vec<Instrument>,

    stage: Stage,
}

impl Default for Module {
    fn default() -> Self {
        Self {
            song_name: String::new(),
            mod_type: String::new(),
            comment: String::new(),
            flags: ModuleFlags::empty(),
            num_chn: 0,
            num_pos: 0,
            num_pat: 0,
            num_ins: 0,
            num_smp: 0,
            num_trk: 0,
            rep_pos: 0,
            init_speed: 6,
            init_tempo: 125,
            init_volume: 128,
            bpm_limit: 32,
            panning: [PAN_CENTER; MAX_CHANNELS],
            chan_vol: [64; MAX_CHANNELS],
            positions: Vec::new(),
            pattern_rows: Vec::new(),
            patterns: Vec::new(),
            tracks: Vec::new(),
            samples: Vec::new(),
            instruments: Vec::new(),
            stage: Stage::Header,
        }
    }
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    fn advance(&mut self, to: Stage, what: &'static str) -> Result<(), UniError> {
        if to < self.stage {
            return Err(UniError::AllocationOrder(what));
        }
        self.stage = to;
        Ok(())
    }

    /// Size the order list and set `num_pos`
    pub fn alloc_positions(&mut self, count: usize) -> Result<(), UniError> {
        self.advance(Stage::Positions, "positions")?;
        if count > MAX_POSITIONS {
            return Err(UniError::AllocationSize {
                what: "positions",
                count,
            });
        }
        self.positions = vec![0; count];
        self.num_pos = count as u16;
        Ok(())
    }

    /// Size the sample table from `num_smp`
    pub fn alloc_samples(&mut self) -> Result<(), UniError> {
        self.advance(Stage::Samples, "samples")?;
        self.samples = vec![Sample::default(); self.num_smp as usize];
        Ok(())
    }

    /// Size the pattern tables from `num_pat` and `num_chn`
    ///
    /// Every pattern defaults to 64 rows and to the tracks
    /// `pattern * num_chn .. (pattern + 1) * num_chn`.
    pub fn alloc_patterns(&mut self) -> Result<(), UniError> {
        self.advance(Stage::Patterns, "patterns")?;
        if self.num_chn == 0 || self.num_chn as usize > MAX_CHANNELS {
            return Err(UniError::AllocationSize {
                what: "channels",
                count: self.num_chn as usize,
            });
        }
        let count = self.num_pat as usize * self.num_chn as usize;
        if count > MAX_TRACKS {
            return Err(UniError::AllocationSize {
                what: "patterns",
                count,
            });
        }
        self.pattern_rows = vec![64; self.num_pat as usize];
        self.patterns = (0..count as u32).collect();
        Ok(())
    }

    /// Size the track table from `num_trk`, defaulting it to `num_pat * num_chn`
    pub fn alloc_tracks(&mut self) -> Result<(), UniError> {
        self.advance(Stage::Tracks, "tracks")?;
        if self.num_trk == 0 {
            self.num_trk = self.num_pat as u32 * self.num_chn as u32;
        }
        if self.num_trk as usize > MAX_TRACKS {
            return Err(UniError::AllocationSize {
                what: "tracks",
                count: self.num_trk as usize,
            });
        }
        self.tracks = vec![None; self.num_trk as usize];
        trace!(
            "module: {} patterns x {} channels, {} tracks",
            self.num_pat, self.num_chn, self.num_trk
        );
        Ok(())
    }

    /// Size the instrument table from `num_ins`
    pub fn alloc_instruments(&mut self) -> Result<(), UniError> {
        self.advance(Stage::Instruments, "instruments")?;
        self.instruments = vec![Instrument::default(); self.num_ins as usize];
        Ok(())
    }

    /// Track index of `channel` in `pattern`
    pub fn track_index(&self, pattern: usize, channel: usize) -> Option<u32> {
        self.patterns
            .get(pattern * self.num_chn as usize + channel)
            .copied()
    }

    /// Track data of `channel` in `pattern`
    pub fn track(&self, pattern: usize, channel: usize) -> Option<&[u8]> {
        let index = self.track_index(pattern, channel)?;
        self.tracks.get(index as usize)?.as_deref()
    }

    /// Number of order list entries before the end marker
    pub fn song_length(&self) -> usize {
        self.positions
            .iter()
            .position(|&p| p == LAST_PATTERN)
            .unwrap_or(self.positions.len())
    }

    /// Check the structural invariants every loader must uphold
    pub fn validate(&self) -> Result<(), UniError> {
        let invalid = |msg: String| Err(UniError::InvalidModule(msg));

        if self.num_chn as usize > MAX_CHANNELS {
            return invalid(format!("{} channels", self.num_chn));
        }
        if self.positions.len() != self.num_pos as usize {
            return invalid(format!(
                "{} positions declared, {} present",
                self.num_pos,
                self.positions.len()
            ));
        }
        if let Some(p) = self
            .positions
            .iter()
            .find(|&&p| p != LAST_PATTERN && p >= self.num_pat)
        {
            return invalid(format!("position refers to pattern {p} of {}", self.num_pat));
        }
        if self.pattern_rows.len() != self.num_pat as usize
            || self.patterns.len() != self.num_pat as usize * self.num_chn as usize
        {
            return invalid("pattern tables do not match pattern count".into());
        }
        if self.tracks.len() != self.num_trk as usize
            || self.tracks.len() < self.patterns.len()
        {
            return invalid(format!(
                "{} tracks for {} patterns x {} channels",
                self.tracks.len(),
                self.num_pat,
                self.num_chn
            ));
        }
        if let Some(t) = self.patterns.iter().find(|&&t| t >= self.num_trk) {
            return invalid(format!("pattern refers to track {t} of {}", self.num_trk));
        }
        for (i, track) in self.tracks.iter().enumerate() {
            if let Some(track) = track {
                validate_track(track).map_err(|e| {
                    UniError::InvalidModule(format!("track {i}: {e}"))
                })?;
            }
        }
        if self.samples.len() != self.num_smp as usize {
            return invalid("sample table does not match sample count".into());
        }
        for (i, s) in self.samples.iter().enumerate() {
            if s.flags.contains(SampleFlags::LOOP) {
                if s.loop_start > s.loop_end {
                    return invalid(format!("sample {i} loop start after loop end"));
                }
                if s.loop_end > s.length {
                    return invalid(format!(
                        "sample {i} loop end {} past length {}",
                        s.loop_end, s.length
                    ));
                }
            }
        }
        if self.flags.contains(ModuleFlags::INST) && self.instruments.len() != self.num_ins as usize
        {
            return invalid("instrument table does not match instrument count".into());
        }
        Ok(())
    }
}
