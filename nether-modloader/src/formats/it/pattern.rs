//! Pattern parsing and track conversion

use std::sync::Arc;

use nether_unimod::{ModuleStream, UniError, UniWriter, opcodes, opcodes::vol};

use crate::remap::ChannelRemap;
use crate::s3mit::CommandTranslator;

/// Highest row count a pattern may declare
pub(crate) const MAX_PATTERN_ROWS: u16 = 200;

/// Note value for a note cut
const NOTE_CUT: u8 = 254;
/// Note value for a note off, after translation from the file's 255
const NOTE_OFF: u8 = 253;
/// Empty note slot
const NOTE_NONE: u8 = 255;
/// Highest playable note
const NOTE_MAX: u8 = 119;

/// Volume column portamento speeds (193-202)
const PORTA_TABLE: [u8; 10] = [0, 1, 4, 8, 16, 32, 64, 96, 128, 255];

/// One pattern cell after mask expansion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ItNote {
    pub note: u8,
    pub ins: u8,
    pub volpan: u8,
    pub cmd: u8,
    pub inf: u8,
}

impl ItNote {
    pub const EMPTY: Self = Self {
        note: NOTE_NONE,
        ins: 0,
        volpan: 255,
        cmd: 255,
        inf: 0,
    };
}

/// Pattern header: packed length, row count
pub(crate) fn read_pattern_header(s: &mut ModuleStream) -> Result<(u16, u16), UniError> {
    let packed_length = s.read_u16_le()?;
    let rows = s.read_u16_le()?;
    // Reserved (4 bytes)
    s.skip(4)?;
    Ok((packed_length, rows))
}

/// Mark the channels a pattern uses
pub(crate) fn scan_channels(
    s: &mut ModuleStream,
    rows: u16,
    remap: &mut ChannelRemap,
) -> Result<(), UniError> {
    let mut masks = [0u8; 64];
    let mut row = 0;

    while row < rows {
        let flag = s.read_u8()?;
        if flag == 0 {
            row += 1;
            continue;
        }
        let channel = (flag.wrapping_sub(1) & 63) as usize;
        remap.mark(channel);
        if flag & 0x80 != 0 {
            masks[channel] = s.read_u8()?;
        }
        let mask = masks[channel];
        if mask & 0x01 != 0 {
            s.skip(1)?;
        }
        if mask & 0x02 != 0 {
            s.skip(1)?;
        }
        if mask & 0x04 != 0 {
            s.skip(1)?;
        }
        if mask & 0x08 != 0 {
            s.skip(2)?;
        }
    }
    Ok(())
}

/// Decode one packed pattern into `buf` (channel-major, `rows` rows per channel)
///
/// The mask and the last note/instrument/volume/command are cached per source
/// channel; mask bits 4-7 reuse the cached values.
pub(crate) fn read_pattern(
    s: &mut ModuleStream,
    rows: u16,
    remap: &ChannelRemap,
    buf: &mut [ItNote],
) -> Result<(), UniError> {
    let rows_len = rows as usize;
    buf.fill(ItNote::EMPTY);

    let mut masks = [0u8; 64];
    let mut last = [ItNote::EMPTY; 64];
    let mut dummy = ItNote::EMPTY;
    let mut row = 0usize;

    while row < rows_len {
        let flag = s.read_u8()?;
        if flag == 0 {
            row += 1;
            continue;
        }
        let channel = (flag.wrapping_sub(1) & 63) as usize;
        if flag & 0x80 != 0 {
            masks[channel] = s.read_u8()?;
        }
        let mask = masks[channel];
        let prev = &mut last[channel];
        let n = match remap.get(channel) {
            Some(ch) => &mut buf[ch * rows_len + row],
            None => &mut dummy,
        };

        if mask & 0x01 != 0 {
            let note = match s.read_u8()? {
                255 => NOTE_OFF,
                other => other,
            };
            prev.note = note;
            n.note = note;
        }
        if mask & 0x02 != 0 {
            prev.ins = s.read_u8()?;
            n.ins = prev.ins;
        }
        if mask & 0x04 != 0 {
            prev.volpan = s.read_u8()?;
            n.volpan = prev.volpan;
        }
        if mask & 0x08 != 0 {
            prev.cmd = s.read_u8()?;
            prev.inf = s.read_u8()?;
            n.cmd = prev.cmd;
            n.inf = prev.inf;
        }
        if mask & 0x10 != 0 {
            n.note = prev.note;
        }
        if mask & 0x20 != 0 {
            n.ins = prev.ins;
        }
        if mask & 0x40 != 0 {
            n.volpan = prev.volpan;
        }
        if mask & 0x80 != 0 {
            n.cmd = prev.cmd;
            n.inf = prev.inf;
        }
    }
    Ok(())
}

/// Volume column: one byte range-partitioned into volume, slides, panning,
/// portamento and vibrato
pub(crate) fn convert_volpan(w: &mut UniWriter, volpan: u8) -> Result<(), String> {
    match volpan {
        0..=64 => w.vol_effect(vol::VOLUME, volpan),
        65 => w.vol_effect(vol::VOLSLIDE, 0),
        66..=74 => w.vol_effect(vol::VOLSLIDE, 0x0F + ((volpan - 65) << 4)),
        75 => w.vol_effect(vol::VOLSLIDE, 0),
        76..=84 => w.vol_effect(vol::VOLSLIDE, 0xF0 + (volpan - 75)),
        85..=94 => w.vol_effect(vol::VOLSLIDE, (volpan - 85) << 4),
        95..=104 => w.vol_effect(vol::VOLSLIDE, volpan - 95),
        105..=114 => w.vol_effect(vol::PITCHSLIDEDN, volpan - 105),
        115..=124 => w.vol_effect(vol::PITCHSLIDEUP, volpan - 115),
        128..=192 => {
            let pan = volpan - 128;
            w.vol_effect(vol::PANNING, if pan == 64 { 255 } else { pan << 2 });
        }
        193..=202 => w.vol_effect(vol::PORTAMENTO, PORTA_TABLE[(volpan - 193) as usize]),
        203..=212 => w.vol_effect(vol::VIBRATO, volpan - 203),
        239 | 255 => {}
        _ => return Err(format!("invalid volume column value {volpan}")),
    }
    Ok(())
}

/// Translate one channel of a pattern
pub(crate) fn convert_track(
    w: &mut UniWriter,
    translator: &mut CommandTranslator,
    cells: &[ItNote],
) -> Result<Arc<[u8]>, String> {
    let mf = translator.module_flags;
    w.reset();

    for n in cells {
        let mut volpan = n.volpan;

        match n.note {
            NOTE_NONE => {}
            NOTE_OFF => w.key_off(),
            NOTE_CUT => {
                w.pt_effect(0xC, 0, mf);
                w.vol_effect(vol::VOLUME, 0);
                volpan = 255;
            }
            note if note <= NOTE_MAX => w.note(note),
            // Everything else in 120..=252 is a note fade
            _ => w.effect(opcodes::KEYFADE, 0),
        }

        match n.ins {
            0 => {}
            1..=99 => w.instrument(n.ins - 1),
            253 => w.key_off(),
            255 => {}
            ins => return Err(format!("invalid instrument {ins}")),
        }

        convert_volpan(w, volpan)?;
        translator.process(w, n.cmd, n.inf);
        w.new_row();
    }
    w.finalize().map_err(|e| e.to_string())
}
