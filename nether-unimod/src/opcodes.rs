//! Unified track opcodes
//!
//! Every event in a unified track is an opcode byte followed by a fixed number of
//! operand bytes. The operand count of each opcode is fixed by [`OPERANDS`]; two-byte
//! operands are stored big-endian.

// =============================================================================
// Core events
// =============================================================================

/// Note trigger (operand: note number, `octave * 12 + semitone`)
pub const NOTE: u8 = 1;
/// Instrument (or sample) change (operand: zero-based index)
pub const INSTRUMENT: u8 = 2;

// =============================================================================
// ProTracker effects 0-F
// =============================================================================

/// First of the sixteen ProTracker effects; `PTEFFECT0 + n` is effect `n`
pub const PTEFFECT0: u8 = 3;
pub const PTEFFECT1: u8 = 4;
pub const PTEFFECT2: u8 = 5;
pub const PTEFFECT3: u8 = 6;
pub const PTEFFECT4: u8 = 7;
pub const PTEFFECT5: u8 = 8;
pub const PTEFFECT6: u8 = 9;
pub const PTEFFECT7: u8 = 10;
pub const PTEFFECT8: u8 = 11;
pub const PTEFFECT9: u8 = 12;
pub const PTEFFECTA: u8 = 13;
pub const PTEFFECTB: u8 = 14;
pub const PTEFFECTC: u8 = 15;
pub const PTEFFECTD: u8 = 16;
pub const PTEFFECTE: u8 = 17;
pub const PTEFFECTF: u8 = 18;

// =============================================================================
// Scream Tracker 3 effects
// =============================================================================

/// Set speed
pub const S3MEFFECTA: u8 = 19;
/// Volume slide with fine variants
pub const S3MEFFECTD: u8 = 20;
/// Portamento down
pub const S3MEFFECTE: u8 = 21;
/// Portamento up
pub const S3MEFFECTF: u8 = 22;
/// Tremor
pub const S3MEFFECTI: u8 = 23;
/// Retrig with volume change
pub const S3MEFFECTQ: u8 = 24;
/// Tremolo
pub const S3MEFFECTR: u8 = 25;
/// Set tempo
pub const S3MEFFECTT: u8 = 26;
/// Fine vibrato
pub const S3MEFFECTU: u8 = 27;
/// Note off (no operand)
pub const KEYOFF: u8 = 28;

// =============================================================================
// Fasttracker 2 effects
// =============================================================================

/// Key fade after the given number of ticks
pub const KEYFADE: u8 = 29;
/// Volume column event (operands: kind, value)
pub const VOLEFFECTS: u8 = 30;
pub const XMEFFECT4: u8 = 31;
pub const XMEFFECT6: u8 = 32;
pub const XMEFFECTA: u8 = 33;
pub const XMEFFECTE1: u8 = 34;
pub const XMEFFECTE2: u8 = 35;
pub const XMEFFECTEA: u8 = 36;
pub const XMEFFECTEB: u8 = 37;
pub const XMEFFECTG: u8 = 38;
pub const XMEFFECTH: u8 = 39;
pub const XMEFFECTL: u8 = 40;
pub const XMEFFECTP: u8 = 41;
pub const XMEFFECTX1: u8 = 42;
pub const XMEFFECTX2: u8 = 43;

// =============================================================================
// Impulse Tracker effects
// =============================================================================

pub const ITEFFECTG: u8 = 44;
pub const ITEFFECTH: u8 = 45;
pub const ITEFFECTI: u8 = 46;
pub const ITEFFECTM: u8 = 47;
pub const ITEFFECTN: u8 = 48;
pub const ITEFFECTP: u8 = 49;
pub const ITEFFECTT: u8 = 50;
pub const ITEFFECTU: u8 = 51;
pub const ITEFFECTW: u8 = 52;
pub const ITEFFECTY: u8 = 53;
/// Resonant filter (operands: filter kind, value)
pub const ITEFFECTZ: u8 = 54;
/// Extended S0x-SFx commands
pub const ITEFFECTS0: u8 = 55;

// =============================================================================
// Other trackers
// =============================================================================

/// UltraTracker sample offset (16-bit operand, offset in 256-byte units)
pub const ULTEFFECT9: u8 = 56;
/// MED speed (16-bit operand)
pub const MEDSPEED: u8 = 57;
pub const MEDEFFECTF1: u8 = 58;
pub const MEDEFFECTF2: u8 = 59;
pub const MEDEFFECTF3: u8 = 60;
/// Oktalyzer arpeggio
pub const OKTARP: u8 = 61;
/// Farandole portamento up
pub const FAREFFECT1: u8 = 62;
/// Farandole portamento down
pub const FAREFFECT2: u8 = 63;
/// Farandole tone portamento
pub const FAREFFECT3: u8 = 64;
/// Farandole retrigger
pub const FAREFFECT4: u8 = 65;
/// Farandole vibrato
pub const FAREFFECT6: u8 = 66;
/// Farandole fine tempo down
pub const FAREFFECTD: u8 = 67;
/// Farandole fine tempo up
pub const FAREFFECTE: u8 = 68;
/// Farandole set tempo
pub const FAREFFECTF: u8 = 69;

/// One past the highest valid opcode
pub const LAST: u8 = 70;

/// Operand byte count for every opcode, indexed by opcode
pub const OPERANDS: [u8; LAST as usize] = [
    0, // unused
    1, // NOTE
    1, // INSTRUMENT
    1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, // PTEFFECT0-F
    1, // S3MEFFECTA
    1, // S3MEFFECTD
    1, // S3MEFFECTE
    1, // S3MEFFECTF
    1, // S3MEFFECTI
    1, // S3MEFFECTQ
    1, // S3MEFFECTR
    1, // S3MEFFECTT
    1, // S3MEFFECTU
    0, // KEYOFF
    1, // KEYFADE
    2, // VOLEFFECTS
    1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, // XMEFFECT4-X2
    1, 1, 1, 1, 1, 1, 1, 1, 1, 1, // ITEFFECTG-Y
    2, // ITEFFECTZ
    1, // ITEFFECTS0
    2, // ULTEFFECT9
    2, // MEDSPEED
    0, // MEDEFFECTF1
    0, // MEDEFFECTF2
    0, // MEDEFFECTF3
    1, // OKTARP
    1, 1, 1, 1, 1, 1, 1, 1, // FAREFFECT1-F
];

/// Number of operand bytes for `opcode`, or `None` if the opcode is out of range
#[inline]
pub fn operand_len(opcode: u8) -> Option<usize> {
    if opcode == 0 || opcode >= LAST {
        None
    } else {
        Some(OPERANDS[opcode as usize] as usize)
    }
}

/// Human-readable opcode name, used by track dumps
pub fn name(opcode: u8) -> &'static str {
    const PT: [&str; 16] = [
        "PT0", "PT1", "PT2", "PT3", "PT4", "PT5", "PT6", "PT7", "PT8", "PT9", "PTA", "PTB", "PTC",
        "PTD", "PTE", "PTF",
    ];
    match opcode {
        NOTE => "NOTE",
        INSTRUMENT => "INS",
        PTEFFECT0..=PTEFFECTF => PT[(opcode - PTEFFECT0) as usize],
        S3MEFFECTA => "S3MA",
        S3MEFFECTD => "S3MD",
        S3MEFFECTE => "S3ME",
        S3MEFFECTF => "S3MF",
        S3MEFFECTI => "S3MI",
        S3MEFFECTQ => "S3MQ",
        S3MEFFECTR => "S3MR",
        S3MEFFECTT => "S3MT",
        S3MEFFECTU => "S3MU",
        KEYOFF => "KEYOFF",
        KEYFADE => "KEYFADE",
        VOLEFFECTS => "VOL",
        XMEFFECT4 => "XM4",
        XMEFFECT6 => "XM6",
        XMEFFECTA => "XMA",
        XMEFFECTE1 => "XME1",
        XMEFFECTE2 => "XME2",
        XMEFFECTEA => "XMEA",
        XMEFFECTEB => "XMEB",
        XMEFFECTG => "XMG",
        XMEFFECTH => "XMH",
        XMEFFECTL => "XML",
        XMEFFECTP => "XMP",
        XMEFFECTX1 => "XMX1",
        XMEFFECTX2 => "XMX2",
        ITEFFECTG => "ITG",
        ITEFFECTH => "ITH",
        ITEFFECTI => "ITI",
        ITEFFECTM => "ITM",
        ITEFFECTN => "ITN",
        ITEFFECTP => "ITP",
        ITEFFECTT => "ITT",
        ITEFFECTU => "ITU",
        ITEFFECTW => "ITW",
        ITEFFECTY => "ITY",
        ITEFFECTZ => "ITZ",
        ITEFFECTS0 => "ITS0",
        ULTEFFECT9 => "ULT9",
        MEDSPEED => "MEDSPEED",
        MEDEFFECTF1 => "MEDF1",
        MEDEFFECTF2 => "MEDF2",
        MEDEFFECTF3 => "MEDF3",
        OKTARP => "OKTARP",
        FAREFFECT1 => "FAR1",
        FAREFFECT2 => "FAR2",
        FAREFFECT3 => "FAR3",
        FAREFFECT4 => "FAR4",
        FAREFFECT6 => "FAR6",
        FAREFFECTD => "FARD",
        FAREFFECTE => "FARE",
        FAREFFECTF => "FARF",
        _ => "???",
    }
}

// =============================================================================
// Volume column events (first operand of VOLEFFECTS)
// =============================================================================

/// Volume column event kinds
pub mod vol {
    /// Set volume (0-64)
    pub const VOLUME: u8 = 1;
    /// Set panning (0-255)
    pub const PANNING: u8 = 2;
    /// Volume slide, `0xX0` up or `0x0X` down; `0xXF`/`0xFX` fine
    pub const VOLSLIDE: u8 = 3;
    /// Pitch slide down
    pub const PITCHSLIDEDN: u8 = 4;
    /// Pitch slide up
    pub const PITCHSLIDEUP: u8 = 5;
    /// Tone portamento
    pub const PORTAMENTO: u8 = 6;
    /// Vibrato depth
    pub const VIBRATO: u8 = 7;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operand_table() {
        assert_eq!(OPERANDS.len(), LAST as usize);
        assert_eq!(operand_len(0), None);
        assert_eq!(operand_len(LAST), None);
        assert_eq!(operand_len(NOTE), Some(1));
        assert_eq!(operand_len(KEYOFF), Some(0));
        assert_eq!(operand_len(VOLEFFECTS), Some(2));
        assert_eq!(operand_len(ULTEFFECT9), Some(2));
        assert_eq!(operand_len(ITEFFECTZ), Some(2));
        assert_eq!(operand_len(MEDEFFECTF3), Some(0));
        assert_eq!(operand_len(FAREFFECTF), Some(1));
    }

    #[test]
    fn test_names() {
        assert_eq!(name(PTEFFECT0 + 0xC), "PTC");
        assert_eq!(name(ITEFFECTS0), "ITS0");
        assert_eq!(name(LAST), "???");
    }
}
