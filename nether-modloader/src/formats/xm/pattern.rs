//! Pattern unpacking and XM effect translation

use std::sync::Arc;

use nether_unimod::{ModuleFlags, ModuleStream, UniError, UniWriter, opcodes};

/// Maximum pattern length (rows)
pub(crate) const MAX_PATTERN_ROWS: u16 = 256;

/// Highest playable note; anything above is a note off
const XM_NOTE_COUNT: u8 = 96;

/// Single note event in an XM pattern
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct XmNote {
    /// Note value (0 = none, 1-96 = C-0 to B-7, 97 = note off)
    pub note: u8,
    /// Instrument number (0 = none, 1-128)
    pub instrument: u8,
    /// Volume column byte
    pub volume: u8,
    /// Effect type (0-35)
    pub effect: u8,
    /// Effect parameter
    pub effect_param: u8,
}

/// Pattern header: (rows, packed data size)
///
/// The header length INCLUDES its own 4-byte length field. Version 0x0102 stores the
/// row count minus one in a single byte.
pub(crate) fn read_pattern_header(
    s: &mut ModuleStream,
    version: u16,
) -> Result<Result<(u16, u16), String>, UniError> {
    let header_start = s.pos();
    let header_length = s.read_u32_le()?;
    let min_length = if version == 0x0102 { 8 } else { 9 };
    if header_length < min_length {
        return Ok(Err(format!("header length {header_length}")));
    }

    let packing_type = s.read_u8()?;
    if packing_type != 0 {
        return Ok(Err(format!("unknown packing type {packing_type}")));
    }
    let num_rows = if version == 0x0102 {
        s.read_u8()? as u16 + 1
    } else {
        s.read_u16_le()?
    };
    let packed_size = s.read_u16_le()?;

    s.seek_to(header_start + header_length as u64)?;
    Ok(Ok((num_rows, packed_size)))
}

/// Unpack `rows` rows into channel-major `cells`
///
/// Packed data that ends early leaves the remaining cells empty; a note cut off in
/// the middle is an error.
pub(crate) fn read_pattern(
    s: &mut ModuleStream,
    rows: u16,
    channels: usize,
    packed_size: u16,
    cells: &mut [XmNote],
) -> Result<(), UniError> {
    cells.fill(XmNote::default());
    let packed = s.read_slice(packed_size as usize)?;
    let mut p = ModuleStream::new(packed);

    'rows: for row in 0..rows as usize {
        for ch in 0..channels {
            if p.is_eof() {
                break 'rows;
            }
            cells[ch * rows as usize + row] = unpack_note(&mut p)?;
        }
    }
    Ok(())
}

/// Unpack a single note from the pattern data
pub(crate) fn unpack_note(s: &mut ModuleStream) -> Result<XmNote, UniError> {
    let first_byte = s.read_u8()?;

    // Packed format: the first byte says which fields follow
    if first_byte & 0x80 != 0 {
        let mut note = XmNote::default();
        if first_byte & 0x01 != 0 {
            note.note = s.read_u8()?;
        }
        if first_byte & 0x02 != 0 {
            note.instrument = s.read_u8()?;
        }
        if first_byte & 0x04 != 0 {
            note.volume = s.read_u8()?;
        }
        if first_byte & 0x08 != 0 {
            note.effect = s.read_u8()?;
        }
        if first_byte & 0x10 != 0 {
            note.effect_param = s.read_u8()?;
        }
        Ok(note)
    } else {
        Ok(XmNote {
            note: first_byte,
            instrument: s.read_u8()?,
            volume: s.read_u8()?,
            effect: s.read_u8()?,
            effect_param: s.read_u8()?,
        })
    }
}

/// Volume column: 0x10-0x50 volume, then one command per high nibble
fn convert_volume(w: &mut UniWriter, vol: u8, flags: ModuleFlags) {
    let lo = vol & 0x0F;
    match vol >> 4 {
        // Volume slide down / up
        0x6 if lo != 0 => w.effect(opcodes::XMEFFECTA, lo as u16),
        0x7 if lo != 0 => w.effect(opcodes::XMEFFECTA, (lo << 4) as u16),
        // Fine volume slide down / up
        0x8 => w.pt_effect(0xE, 0xB0 | lo, flags),
        0x9 => w.pt_effect(0xE, 0xA0 | lo, flags),
        // Vibrato speed / depth
        0xA => w.effect(opcodes::XMEFFECT4, (lo << 4) as u16),
        0xB => w.effect(opcodes::XMEFFECT4, lo as u16),
        0xC => w.pt_effect(0x8, lo << 4, flags),
        // Panning slide left / right
        0xD if lo != 0 => w.effect(opcodes::XMEFFECTP, lo as u16),
        0xE if lo != 0 => w.effect(opcodes::XMEFFECTP, (lo << 4) as u16),
        0xF => w.pt_effect(0x3, lo << 4, flags),
        _ => {
            if (0x10..=0x50).contains(&vol) {
                w.pt_effect(0xC, vol - 0x10, flags);
            }
        }
    }
}

/// Effect column: 0-F ProTracker, then letters G onward (G = 16)
fn convert_effect(w: &mut UniWriter, eff: u8, dat: u8, flags: ModuleFlags) {
    const fn letter(c: u8) -> u8 {
        c - b'A' + 10
    }

    match eff {
        0x4 => w.effect(opcodes::XMEFFECT4, dat as u16),
        0x6 => w.effect(opcodes::XMEFFECT6, dat as u16),
        0xA => w.effect(opcodes::XMEFFECTA, dat as u16),
        0xE => match dat >> 4 {
            0x1 => w.effect(opcodes::XMEFFECTE1, (dat & 0x0F) as u16),
            0x2 => w.effect(opcodes::XMEFFECTE2, (dat & 0x0F) as u16),
            0xA => w.effect(opcodes::XMEFFECTEA, (dat & 0x0F) as u16),
            0xB => w.effect(opcodes::XMEFFECTEB, (dat & 0x0F) as u16),
            _ => w.pt_effect(eff, dat, flags),
        },
        e if e == letter(b'G') => w.effect(opcodes::XMEFFECTG, dat as u16),
        e if e == letter(b'H') => w.effect(opcodes::XMEFFECTH, dat as u16),
        e if e == letter(b'K') => w.effect(opcodes::KEYFADE, dat as u16),
        e if e == letter(b'L') => w.effect(opcodes::XMEFFECTL, dat as u16),
        e if e == letter(b'P') => w.effect(opcodes::XMEFFECTP, dat as u16),
        e if e == letter(b'R') => w.effect(opcodes::S3MEFFECTQ, dat as u16),
        e if e == letter(b'T') => w.effect(opcodes::S3MEFFECTI, dat as u16),
        e if e == letter(b'X') => match dat >> 4 {
            0x1 => w.effect(opcodes::XMEFFECTX1, (dat & 0x0F) as u16),
            0x2 => w.effect(opcodes::XMEFFECTX2, (dat & 0x0F) as u16),
            _ => {}
        },
        0xD => {
            // Break rows are written in decimal, except by some editors that use
            // plain hex; leave values that cannot be decimal alone
            let dat = if dat >> 4 <= 9 && dat & 0x0F <= 9 {
                (dat >> 4) * 10 + (dat & 0x0F)
            } else {
                dat
            };
            w.pt_effect(eff, dat, flags);
        }
        0x0..=0xF => w.pt_effect(eff, dat, flags),
        _ => {}
    }
}

/// Translate one channel of an unpacked pattern into a unified track
pub(crate) fn convert_track(
    w: &mut UniWriter,
    flags: ModuleFlags,
    cells: &[XmNote],
) -> Result<Arc<[u8]>, UniError> {
    w.reset();
    for n in cells {
        if n.note != 0 {
            if n.note > XM_NOTE_COUNT {
                w.effect(opcodes::KEYFADE, 0);
            } else {
                w.note(n.note - 1);
            }
        }
        if n.instrument != 0 {
            w.instrument(n.instrument - 1);
        }
        convert_volume(w, n.volume, flags);
        convert_effect(w, n.effect, n.effect_param, flags);
        w.new_row();
    }
    w.finalize()
}
