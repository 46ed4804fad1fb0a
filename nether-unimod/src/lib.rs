//! Nether-Unimod: unified tracker module representation
//!
//! Every module loader in Nethercore converts its format into the same in-memory
//! [`Module`]: header counts, an order list, sample and instrument descriptors, and one
//! byte-coded *track* per (pattern, channel) pair.
//!
//! # Track Format
//!
//! ```text
//! track := row* 0x00
//! row   := header event*
//! header: bits 0-4 = row length in bytes (header included)
//!         bits 5-7 = extra repeats of this row (0-7)
//! event := opcode operand*     (operand count fixed per opcode, see opcodes::OPERANDS)
//! ```
//!
//! Tracks are produced with [`UniWriter`] and read back with the functions in
//! [`track`].
//!
//! # Usage
//!
//! ```ignore
//! use nether_unimod::{Module, UniWriter};
//!
//! let mut module = Module::new();
//! module.num_chn = 4;
//! module.num_pat = 1;
//! module.alloc_positions(1)?;
//! module.alloc_samples()?;
//! module.alloc_patterns()?;
//! module.alloc_tracks()?;
//!
//! let mut writer = UniWriter::new();
//! for channel in 0..4 {
//!     writer.reset();
//!     writer.note(48);
//!     writer.new_row();
//!     module.tracks[channel] = Some(writer.finalize()?);
//! }
//! module.validate()?;
//! ```

mod error;
mod instrument;
mod module;
pub mod opcodes;
mod sample;
mod stream;
pub mod track;
mod writer;

pub use error::UniError;
pub use instrument::{
    DuplicateCheckAction, DuplicateCheckType, Envelope, EnvelopeFlags, EnvelopePoint, Instrument,
    InstrumentFlags, NewNoteAction,
};
pub use module::{MAX_POSITIONS, MAX_TRACKS, Module, ModuleFlags};
pub use sample::{Sample, SampleFlags};
pub use stream::ModuleStream;
pub use writer::UniWriter;

// =============================================================================
// Constants
// =============================================================================

/// Order list value marking the end of the song
pub const LAST_PATTERN: u16 = 0xFFFF;

/// Maximum number of channels any module may use
pub const MAX_CHANNELS: usize = 64;

/// Number of notes in the unified note range (10 octaves)
pub const NUM_NOTES: usize = 120;

/// Semitones per octave in unified note numbering
pub const OCTAVE: u8 = 12;

/// Hard left panning
pub const PAN_LEFT: u16 = 0;
/// Center panning
pub const PAN_CENTER: u16 = 128;
/// Hard right panning
pub const PAN_RIGHT: u16 = 255;
/// Surround panning
pub const PAN_SURROUND: u16 = 512;
