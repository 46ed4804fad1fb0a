//! DSMI Advanced Module Format (AMF) loader
//!
//! AMF files are written by M2AMF and the DSMI library. Patterns are lists of track
//! numbers; tracks are stored once as packed (row, command, argument) triplets. The
//! layout changed several times; the version byte selects field widths:
//!
//! | Version | Change |
//! |---------|--------|
//! | 9 | channel count and 16-entry channel remap table |
//! | 10 | direct track table, 32-bit sample length and loop fields |
//! | 11 | signed panning table replaces the remap table |
//! | 13 | 32-entry panning table, initial tempo and speed |
//! | 14 | per-pattern row counts |

use std::sync::Arc;

use nether_unimod::{
    Module, ModuleFlags, ModuleStream, OCTAVE, PAN_LEFT, PAN_RIGHT, PAN_SURROUND, Sample,
    SampleFlags, UniError, UniWriter, opcodes,
};
use tracing::{debug, warn};

use crate::error::{Context, LoadError};
use crate::{LoadOptions, ModuleLoader, new_writer, open_stream};

const AMF_MAGIC: &[u8; 3] = b"AMF";

/// Magic, version, name, counts
const MIN_HEADER: usize = 3 + 1 + 32 + 1 + 1 + 2;

const MIN_VERSION: u8 = 8;
const MAX_VERSION: u8 = 14;

/// Channel count before version 9
const OLD_CHANNELS: u8 = 4;

/// Rows in a packed track
const TRACK_ROWS: usize = 64;

/// Simultaneous effects per cell
const MAX_EFFECTS: usize = 3;

/// Triplet commands
const CMD_DUPLICATE_ROW: u8 = 0x7F;
const CMD_INSTRUMENT: u8 = 0x80;
const CMD_VOLUME: u8 = 0x83;
const CMD_LAST_EFFECT: u8 = 0x97;
const CMD_BLANK: u8 = 0xFF;

#[derive(Debug, Clone)]
struct AmfHeader {
    version: u8,
    song_name: String,
    num_samples: u8,
    num_orders: u8,
    num_tracks: u16,
    num_channels: u8,
    /// Output channel of each stored channel (versions 9 and 10)
    channel_remap: [u8; 16],
    pan_pos: [i8; 32],
    has_panning: bool,
    bpm: u8,
    speed: u8,
}

fn read_header(s: &mut ModuleStream) -> Result<AmfHeader, LoadError> {
    s.skip(3).section("header")?;
    let version = s.read_u8().section("header")?;
    let song_name = s.read_string(32).section("header")?;
    let num_samples = s.read_u8().section("header")?;
    let num_orders = s.read_u8().section("header")?;
    let num_tracks = s.read_u16_le().section("header")?;
    let num_channels = if version >= 9 {
        s.read_u8().section("header")?
    } else {
        OLD_CHANNELS
    };
    let max_channels = if version >= 12 { 32 } else { 16 };
    if num_channels == 0 || num_channels > max_channels {
        return Err(LoadError::header(format!(
            "{num_channels} channels in a version {version} file"
        )));
    }

    let mut channel_remap: [u8; 16] = std::array::from_fn(|i| i as u8);
    let mut pan_pos = [0i8; 32];
    let has_panning = version >= 11;
    if has_panning {
        let count = if version >= 13 { 32 } else { 16 };
        for pan in &mut pan_pos[..count] {
            *pan = s.read_i8().section("header")?;
        }
    } else if version >= 9 {
        channel_remap = s.read_array().section("header")?;
        if let Some(&bad) = channel_remap[..num_channels as usize]
            .iter()
            .find(|&&c| c >= num_channels)
        {
            return Err(LoadError::header(format!("channel remap to {bad}")));
        }
    }

    let (bpm, speed) = if version >= 13 {
        let bpm = s.read_u8().section("header")?;
        let speed = s.read_u8().section("header")?;
        if bpm < 32 || speed > 32 {
            return Err(LoadError::header(format!("tempo {bpm} speed {speed}")));
        }
        (bpm, speed)
    } else {
        (125, 6)
    };

    Ok(AmfHeader {
        version,
        song_name,
        num_samples,
        num_orders,
        num_tracks,
        num_channels,
        channel_remap,
        pan_pos,
        has_panning,
        bpm,
        speed,
    })
}

/// Channel panning from the signed table: -64..63 span the field, 64 is hard right,
/// anything above is surround
fn channel_panning(pan: i8) -> u16 {
    match pan {
        65.. => PAN_SURROUND,
        64 => PAN_RIGHT,
        _ => ((pan as i16 + 64) << 1).clamp(0, 255) as u16,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct AmfNote {
    note: u8,
    instrument: u8,
    /// Volume + 1; 0 means none
    volume: u8,
    effects: [(u8, i8); MAX_EFFECTS],
    fx_count: usize,
}

/// Unpack one track's triplets into 64 cells
fn unpack_track(s: &mut ModuleStream, index: usize) -> Result<[AmfNote; TRACK_ROWS], LoadError> {
    let section = "track";
    let mut track = [AmfNote::default(); TRACK_ROWS];
    let lo = s.read_u16_le().section(section)? as usize;
    let hi = s.read_u8().section(section)? as usize;
    let count = lo | (hi << 16);

    let bad = |reason: String| LoadError::Header(format!("track {index}: {reason}"));
    for i in 0..count {
        let row = s.read_u8().section(section)? as usize;
        let cmd = s.read_u8().section(section)?;
        let arg = s.read_i8().section(section)?;

        if i + 1 == count {
            if row == 0xFF && cmd == 0xFF && arg == -1 {
                break;
            }
            // M2AMF does not always write the FF FF FF terminator
            warn!("AMF track {index}: last triplet is not a terminator");
        }
        if row >= TRACK_ROWS {
            return Err(bad(format!("row {row}")));
        }
        match cmd {
            0x00..CMD_DUPLICATE_ROW => {
                track[row].note = cmd;
                track[row].volume = (arg as u8).wrapping_add(1);
            }
            CMD_DUPLICATE_ROW => {
                let from = row as isize + arg as isize;
                if arg < 0 && from >= 0 {
                    track[row] = track[from as usize];
                }
            }
            CMD_INSTRUMENT => track[row].instrument = (arg as u8).wrapping_add(1),
            CMD_VOLUME => track[row].volume = (arg as u8).wrapping_add(1),
            // Dead triplets from M2AMF overestimating the track size
            CMD_BLANK => {}
            0x81..=CMD_LAST_EFFECT => {
                let n = &mut track[row];
                if n.fx_count >= MAX_EFFECTS {
                    return Err(bad(format!("more than {MAX_EFFECTS} effects on row {row}")));
                }
                n.effects[n.fx_count] = (cmd & 0x7F, arg);
                n.fx_count += 1;
            }
            _ => debug!("AMF track {index}: ignoring command {cmd:#04x}"),
        }
    }
    Ok(track)
}

/// Emit a signed slide as an S3M-style nibble pair: positive slides up
fn volume_slide(w: &mut UniWriter, inf: i8, fine: bool) {
    if inf == 0 {
        return;
    }
    let param = if inf > 0 {
        let up = (inf as u8 & 0x0F) << 4;
        if fine { up | 0x0F } else { up }
    } else {
        let down = inf.unsigned_abs() & 0x0F;
        if fine { 0xF0 | down } else { down }
    };
    w.effect(opcodes::S3MEFFECTD, param as u16);
}

/// Convert one unpacked track; sets `panning` when a panning command is present
fn convert_track(
    w: &mut UniWriter,
    track: &[AmfNote; TRACK_ROWS],
    panning: &mut bool,
) -> Result<Arc<[u8]>, UniError> {
    let flags = ModuleFlags::S3MSLIDES;
    w.reset();
    for cell in track {
        let mut volume = cell.volume;
        if cell.instrument != 0 {
            w.instrument(cell.instrument - 1);
        }
        if cell.note > OCTAVE {
            w.note(cell.note - OCTAVE);
        }
        for &(effect, inf) in cell.effects[..cell.fx_count].iter().rev() {
            let raw = inf as u8;
            match effect {
                0x01 => w.effect(opcodes::S3MEFFECTA, raw as u16),
                0x02 => volume_slide(w, inf, false),
                // Positive values slide down
                0x04 => {
                    if inf >= 0 {
                        w.effect(opcodes::S3MEFFECTE, raw as u16);
                    } else {
                        w.effect(opcodes::S3MEFFECTF, inf.unsigned_abs() as u16);
                    }
                }
                0x06 => w.effect(opcodes::ITEFFECTG, raw as u16),
                0x07 => w.effect(opcodes::S3MEFFECTI, raw as u16),
                0x08 => w.pt_effect(0x0, raw, flags),
                0x09 => w.pt_effect(0x4, raw, flags),
                0x0A => {
                    w.pt_effect(0x3, 0, flags);
                    volume_slide(w, inf, false);
                }
                0x0B => {
                    w.pt_effect(0x4, 0, flags);
                    volume_slide(w, inf, false);
                }
                0x0C => w.pt_effect(0xD, raw, flags),
                0x0D => w.pt_effect(0xB, raw, flags),
                0x0F => w.effect(opcodes::S3MEFFECTQ, (raw & 0x0F) as u16),
                0x10 => w.pt_effect(0x9, raw, flags),
                0x11 => volume_slide(w, inf, true),
                0x12 => match inf {
                    0 => {}
                    1.. => w.effect(opcodes::S3MEFFECTE, (0xF0 | (raw & 0x0F)) as u16),
                    _ => w.effect(
                        opcodes::S3MEFFECTF,
                        (0xF0 | (inf.unsigned_abs() & 0x0F)) as u16,
                    ),
                },
                0x13 => w.pt_effect(0xE, 0xD0 | (raw & 0x0F), flags),
                0x14 => {
                    w.pt_effect(0xC, 0, flags);
                    volume = 0;
                }
                0x15 => w.effect(opcodes::S3MEFFECTT, raw as u16),
                0x16 => match inf {
                    0 => {}
                    1.. => w.effect(opcodes::S3MEFFECTE, (0xE0 | ((raw >> 2) & 0x0F)) as u16),
                    _ => w.effect(
                        opcodes::S3MEFFECTF,
                        (0xE0 | ((inf.unsigned_abs() >> 2) & 0x0F)) as u16,
                    ),
                },
                0x17 => {
                    match inf {
                        65.. => w.effect(opcodes::ITEFFECTS0, 0x91),
                        64 => w.pt_effect(0x8, 255, flags),
                        _ => w.pt_effect(0x8, ((inf as i16 + 64) << 1).clamp(0, 255) as u8, flags),
                    }
                    *panning = true;
                }
                // Absolute portamento and sync are not supported
                _ => {}
            }
        }
        if volume != 0 {
            w.vol_effect(opcodes::vol::VOLUME, volume - 1);
        }
        w.new_row();
    }
    w.finalize()
}

fn read_sample(s: &mut ModuleStream, version: u8) -> Result<Sample, UniError> {
    let kind = s.read_u8()?;
    let name = s.read_string(32)?;
    // DOS filename
    s.skip(13)?;
    // Ordinal of the data block, resolved after the tracks are read
    let offset = s.read_u32_le()?;
    let wide = version >= 10;
    let length = if wide {
        s.read_u32_le()?
    } else {
        s.read_u16_le()? as u32
    };
    let mut speed = s.read_u16_le()? as u32;
    // M2AMF writes 8368 for the default rate
    if speed == 8368 {
        speed = 8363;
    }
    let volume = s.read_u8()?;
    let (loop_start, loop_end) = if wide {
        (s.read_u32_le()?, s.read_u32_le()?)
    } else {
        (s.read_u16_le()? as u32, s.read_u16_le()? as u32)
    };

    let mut q = Sample {
        name,
        speed,
        volume: volume.min(64),
        ..Sample::default()
    };
    if kind != 0 {
        q.seek_pos = offset as u64;
        q.length = length;
        q.loop_start = loop_start;
        q.loop_end = loop_end;
        if loop_end.saturating_sub(loop_start) > 2 {
            q.flags |= SampleFlags::LOOP;
        }
        q.fix_loop();
    } else {
        q.flags |= SampleFlags::NO_DATA;
    }
    Ok(q)
}

/// DSMI AMF loader
#[derive(Debug, Default, Clone, Copy)]
pub struct AmfLoader;

impl ModuleLoader for AmfLoader {
    fn name(&self) -> &'static str {
        "AMF"
    }

    fn description(&self) -> &'static str {
        "DSMI Advanced Module Format"
    }

    fn identify(&self, data: &[u8]) -> bool {
        data.len() >= MIN_HEADER
            && data.starts_with(AMF_MAGIC)
            && (MIN_VERSION..=MAX_VERSION).contains(&data[3])
    }

    fn load(&self, data: &[u8], options: &LoadOptions) -> Result<Module, LoadError> {
        if !self.identify(data) {
            return Err(LoadError::Unknown);
        }
        let mut s = open_stream(data, options);
        let h = read_header(&mut s)?;
        let chn = h.num_channels as usize;
        if chn > options.channel_limit(32) {
            return Err(LoadError::limit("channels", chn, options.max_channels));
        }
        let num_pat = h.num_orders as usize;
        if num_pat == 0 {
            return Err(LoadError::header("no orders"));
        }

        let mut m = Module::new();
        m.song_name = h.song_name.clone();
        m.mod_type = format!("DSMI {}.{} AMF", h.version / 10, h.version % 10);
        m.flags = ModuleFlags::S3MSLIDES;
        m.num_chn = chn as u16;
        m.init_speed = h.speed.max(1);
        m.init_tempo = h.bpm as u16;
        m.bpm_limit = 32;

        // Use the stored table only when it differs from a plain LRRL layout
        let mut custom_panning = false;
        if h.has_panning {
            for (ch, pan) in m.panning.iter_mut().enumerate().take(32) {
                *pan = channel_panning(h.pan_pos[ch]);
                if *pan == PAN_SURROUND {
                    custom_panning = true;
                }
            }
            custom_panning |= (0..chn).any(|ch| {
                let lrrl = if (ch + 1) & 2 != 0 { PAN_RIGHT } else { PAN_LEFT };
                m.panning[ch] != lrrl
            });
        }

        // Every order is its own pattern, made of per-channel track numbers
        let mut pattern_rows = vec![TRACK_ROWS as u16; num_pat];
        let mut track_refs = vec![0u16; num_pat * chn];
        for (pat, rows) in pattern_rows.iter_mut().enumerate() {
            if h.version >= 14 {
                let stored = s.read_u16_le().section("pattern table")?;
                *rows = if stored == 0 {
                    TRACK_ROWS as u16
                } else {
                    stored.min(TRACK_ROWS as u16)
                };
            }
            let refs = &mut track_refs[pat * chn..(pat + 1) * chn];
            for ch in 0..chn {
                let r = s.read_u16_le().section("pattern table")?;
                if h.version >= 10 {
                    refs[ch] = r;
                } else {
                    refs[h.channel_remap[ch] as usize] = r;
                }
            }
        }

        let mut samples = Vec::with_capacity(h.num_samples as usize);
        for _ in 0..h.num_samples {
            samples.push(read_sample(&mut s, h.version).section("sample header")?);
        }

        // File track number -> stored track (1-based, 0 = empty)
        let mut track_map = vec![0u16; h.num_tracks as usize + 1];
        for t in track_map.iter_mut().skip(1) {
            *t = s.read_u16_le().section("track table")?;
        }
        let real_tracks = track_map.iter().copied().max().unwrap_or(0) as usize;
        let empty_track = real_tracks as u32;

        let mut w = new_writer(options);
        let mut tracks = Vec::with_capacity(real_tracks + 1);
        for t in 0..real_tracks {
            let cells = unpack_track(&mut s, t)?;
            tracks.push(convert_track(&mut w, &cells, &mut custom_panning)?);
        }
        tracks.push(w.empty_track(TRACK_ROWS as u16)?);

        if custom_panning {
            m.flags |= ModuleFlags::PANNING;
        }

        // Sample data follows the tracks in ordinal order
        let mut data_pos = s.pos();
        let last_ordinal = samples.iter().map(|q| q.seek_pos).max().unwrap_or(0);
        for ordinal in 1..=last_ordinal {
            let q = samples
                .iter_mut()
                .find(|q| q.seek_pos == ordinal && !q.flags.contains(SampleFlags::NO_DATA))
                .ok_or_else(|| LoadError::header(format!("no sample with data block {ordinal}")))?;
            q.seek_pos = data_pos;
            data_pos += q.length as u64;
        }

        m.alloc_positions(num_pat)?;
        for (i, p) in m.positions.iter_mut().enumerate() {
            *p = i as u16;
        }

        m.num_smp = samples.len() as u16;
        m.num_ins = m.num_smp;
        m.alloc_samples()?;
        m.samples = samples;

        m.num_pat = num_pat as u16;
        m.num_trk = (num_pat * chn).max(h.num_tracks as usize) as u32 + 1;
        m.alloc_patterns()?;
        m.pattern_rows = pattern_rows;
        for (slot, &r) in m.patterns.iter_mut().zip(&track_refs) {
            *slot = match track_map.get(r as usize) {
                Some(&real) if real != 0 => real as u32 - 1,
                _ => empty_track,
            };
        }
        m.alloc_tracks()?;
        if tracks.len() > m.tracks.len() {
            return Err(LoadError::header(format!(
                "{} stored tracks for {} track slots",
                real_tracks,
                h.num_tracks
            )));
        }
        for (slot, track) in m.tracks.iter_mut().zip(tracks) {
            *slot = Some(track);
        }

        debug!(
            "AMF '{}' v{}: {} channels, {} orders, {} tracks",
            m.song_name, h.version, m.num_chn, m.num_pos, real_tracks
        );
        Ok(m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{Bytes, assert_rejects_truncated, row_events};
    use nether_unimod::track::Event;

    fn triplet(b: &mut Bytes, row: u8, cmd: u8, arg: i8) {
        b.u8(row).u8(cmd).u8(arg as u8);
    }

    /// Version 14, two channels, one order, two tracks, one sample
    fn build_amf() -> Vec<u8> {
        let mut b = Bytes::new();
        b.bytes(AMF_MAGIC).u8(14).str("amf song", 32);
        b.u8(1).u8(1).u16le(2).u8(2);
        // Hard left, hard right, rest centered
        b.u8(0xC0).u8(64).zeros(30);
        b.u8(125).u8(6);
        // Pattern 0: 64 rows, tracks 1 and 2
        b.u16le(64).u16le(1).u16le(2);
        // Sample using data block 1
        b.u8(1).str("sample", 32).zeros(13).u32le(1).u32le(10);
        b.u16le(8368).u8(48).u32le(2).u32le(8);
        // File track 1 is stored second, file track 2 first
        b.u16le(2).u16le(1);

        // Stored track 1: note with volume, instrument, speed, duplicated to row 2
        b.u16le(5).u8(0);
        triplet(&mut b, 0, 60, 0x20);
        triplet(&mut b, 0, CMD_INSTRUMENT, 0);
        triplet(&mut b, 0, 0x81, 4);
        triplet(&mut b, 2, CMD_DUPLICATE_ROW, -2);
        triplet(&mut b, 0xFF, 0xFF, -1);
        // Stored track 2: hard right pan, an unknown command, no terminator
        b.u16le(2).u8(0);
        triplet(&mut b, 1, 0x97, 64);
        triplet(&mut b, 3, 0xA0, 5);

        b.fill(0x80, 10);
        b.build()
    }

    #[test]
    fn test_identify() {
        let data = build_amf();
        assert!(AmfLoader.identify(&data));
        assert_rejects_truncated(&AmfLoader, &data, MIN_HEADER);

        let mut old = data.clone();
        old[3] = 7;
        assert!(!AmfLoader.identify(&old));
    }

    #[test]
    fn test_load() {
        let data = build_amf();
        let m = AmfLoader.load(&data, &LoadOptions::default()).unwrap();
        m.validate().unwrap();

        assert_eq!(m.song_name, "amf song");
        assert_eq!(m.mod_type, "DSMI 1.4 AMF");
        assert_eq!(m.num_chn, 2);
        assert_eq!(m.positions, vec![0]);
        assert_eq!(m.panning[0], PAN_LEFT);
        assert_eq!(m.panning[1], PAN_RIGHT);
        assert!(m.flags.contains(ModuleFlags::PANNING));

        // Channel 0 plays file track 1, which was stored second
        assert_eq!(m.patterns, vec![1, 0]);
        assert_eq!(m.num_trk, 3);

        let note_row = vec![
            Event::Instrument(0),
            Event::Note(48),
            Event::Effect {
                opcode: opcodes::S3MEFFECTA,
                param: 4,
            },
            Event::Volume {
                kind: opcodes::vol::VOLUME,
                value: 0x20,
            },
        ];
        assert_eq!(row_events(&m, 0, 1, 0), note_row);
        assert_eq!(row_events(&m, 0, 1, 2), note_row);
        assert!(row_events(&m, 0, 1, 1).is_empty());
        assert_eq!(
            row_events(&m, 0, 0, 1),
            vec![Event::Effect {
                opcode: opcodes::PTEFFECT8,
                param: 255,
            }]
        );
        assert!(row_events(&m, 0, 0, 3).is_empty());

        let q = &m.samples[0];
        assert_eq!(q.speed, 8363);
        assert_eq!(q.volume, 48);
        assert!(q.has_loop());
        assert_eq!(q.seek_pos, (data.len() - 10) as u64);
    }

    #[test]
    fn test_missing_track_reference_plays_empty() {
        let mut b = Bytes::new();
        b.bytes(AMF_MAGIC).u8(10).str("", 32);
        b.u8(0).u8(1).u16le(1).u8(1);
        // Identity remap table
        b.zeros(16);
        // Pattern 0 references track 0 (none)
        b.u16le(0);
        b.u16le(1);
        b.u16le(1).u8(0);
        triplet(&mut b, 0xFF, 0xFF, -1);
        let m = AmfLoader.load(&b.build(), &LoadOptions::default()).unwrap();
        m.validate().unwrap();
        assert_eq!(m.patterns, vec![1]);
        assert!(row_events(&m, 0, 0, 0).is_empty());
    }

    #[test]
    fn test_bad_row_rejected() {
        let mut data = build_amf();
        // First triplet of stored track 1
        let pos = data.len() - 10 - 3 * 2 - 3 - 3 * 5;
        data[pos] = 64;
        assert!(AmfLoader.load(&data, &LoadOptions::default()).is_err());
    }
}
