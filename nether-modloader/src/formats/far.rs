//! Farandole Composer (FAR) loader

use std::sync::Arc;

use nether_unimod::{
    Module, ModuleFlags, ModuleStream, OCTAVE, Sample, SampleFlags, UniError, UniWriter, opcodes,
};
use tracing::debug;

use crate::error::{Context, LoadError};
use crate::{LoadOptions, ModuleLoader, new_writer, open_stream};

/// "FAR" 0xFE
const FAR_MAGIC: &[u8; 4] = b"FAR\xFE";

/// CR LF EOF after the song name
const NAME_TERMINATOR: &[u8; 3] = b"\x0D\x0A\x1A";

/// First header: magic, name, terminator, header length ... song text length
const HEADER1_SIZE: usize = 98;
/// Second header: orders, counts, pattern sizes
const HEADER2_SIZE: usize = 256 + 3 + 512;

const FAR_CHANNELS: usize = 16;
const MAX_PATTERNS: usize = 256;
const MAX_SAMPLES: usize = 64;
const ORDER_END: u8 = 0xFF;

/// Width of one song text line
const TEXT_LINE: usize = 132;

#[derive(Debug, Clone)]
struct FarHeader {
    name: String,
    header_len: u16,
    speed: u8,
    panning: [u8; FAR_CHANNELS],
    text_len: u16,
}

fn read_header(s: &mut ModuleStream) -> Result<FarHeader, UniError> {
    s.skip(4)?;
    let name = s.read_string(40)?;
    s.skip(3)?;
    let header_len = s.read_u16_le()?;
    // Version, channel on/off map, editor state
    s.skip(1 + 16 + 9)?;
    let speed = s.read_u8()?;
    let panning = s.read_array()?;
    // Editor state
    s.skip(4)?;
    let text_len = s.read_u16_le()?;
    Ok(FarHeader {
        name,
        header_len,
        speed,
        panning,
        text_len,
    })
}

#[derive(Debug, Clone, Copy, Default)]
struct FarNote {
    note: u8,
    ins: u8,
    vol: u8,
    eff: u8,
}

fn convert_track(
    w: &mut UniWriter,
    cells: &[FarNote],
    rows: usize,
    channel: usize,
) -> Result<Arc<[u8]>, UniError> {
    let flags = ModuleFlags::empty();
    let mut vib_depth = 1u8;
    w.reset();
    for row in 0..rows {
        let n = cells
            .get(row * FAR_CHANNELS + channel)
            .copied()
            .unwrap_or_default();
        if n.note != 0 {
            w.instrument(n.ins);
            w.note(n.note.saturating_add(3 * OCTAVE - 1));
        }
        if (0x01..=0x10).contains(&n.vol) {
            w.pt_effect(0xC, (n.vol - 1) << 2, flags);
        }
        let param = n.eff & 0x0F;
        match n.eff >> 4 {
            0x1 => w.effect(opcodes::FAREFFECT1, param as u16),
            0x2 => w.effect(opcodes::FAREFFECT2, param as u16),
            0x3 => w.effect(opcodes::FAREFFECT3, param as u16),
            0x4 => w.effect(opcodes::FAREFFECT4, param as u16),
            0x5 => vib_depth = param,
            // Vibrato and sustained vibrato
            0x6 | 0x9 => w.effect(opcodes::FAREFFECT6, ((param << 4) | vib_depth) as u16),
            0x7 => w.pt_effect(0xA, param << 4, flags),
            0x8 => w.pt_effect(0xA, param, flags),
            0xB => w.pt_effect(0x8, param << 4, flags),
            0xD => w.effect(opcodes::FAREFFECTD, param as u16),
            0xE => w.effect(opcodes::FAREFFECTE, param as u16),
            0xF => w.effect(opcodes::FAREFFECTF, param as u16),
            // Global commands, volume/note offset effects
            _ => {}
        }
        w.new_row();
    }
    w.finalize()
}

fn read_sample(s: &mut ModuleStream) -> Result<Sample, UniError> {
    let name = s.read_string(32)?;
    let length = s.read_u32_le()?;
    // Finetune
    s.skip(1)?;
    let volume = s.read_u8()?;
    let loop_start = s.read_u32_le()?;
    let loop_end = s.read_u32_le()?;
    let kind = s.read_u8()?;
    let looping = s.read_u8()?;

    let mut q = Sample {
        name,
        length,
        loop_start,
        loop_end,
        volume: (volume as u16 * 4).min(64) as u8,
        flags: SampleFlags::SIGNED,
        seek_pos: s.pos(),
        ..Sample::default()
    };
    s.skip(length as u64)?;

    if kind & 0x01 != 0 {
        q.flags |= SampleFlags::BITS16;
        q.length >>= 1;
        q.loop_start >>= 1;
        q.loop_end >>= 1;
    }
    if looping & 0x08 != 0 {
        q.flags |= SampleFlags::LOOP;
    }
    q.fix_loop();
    Ok(q)
}

/// Farandole Composer loader
#[derive(Debug, Default, Clone, Copy)]
pub struct FarLoader;

impl ModuleLoader for FarLoader {
    fn name(&self) -> &'static str {
        "FAR"
    }

    fn description(&self) -> &'static str {
        "Farandole Composer"
    }

    fn identify(&self, data: &[u8]) -> bool {
        data.len() >= HEADER1_SIZE
            && data.starts_with(FAR_MAGIC)
            && &data[44..47] == NAME_TERMINATOR
    }

    fn load(&self, data: &[u8], options: &LoadOptions) -> Result<Module, LoadError> {
        if !self.identify(data) {
            return Err(LoadError::Unknown);
        }
        let mut s = open_stream(data, options);
        let h = read_header(&mut s).section("header")?;

        let text = s.read_slice(h.text_len as usize).section("song text")?;
        let comment: Vec<String> = text.chunks(TEXT_LINE).map(|line| s.decode(line)).collect();

        let orders = s.read_array::<256>().section("header")?;
        // Stored pattern count
        s.skip(1).section("header")?;
        let song_length = s.read_u8().section("header")?;
        let loop_to = s.read_u8().section("header")?;
        let pattern_sizes = s.read_u16_le_vec(MAX_PATTERNS).section("header")?;

        let min_header = HEADER1_SIZE + h.text_len as usize + HEADER2_SIZE;
        if (h.header_len as usize) < min_header {
            return Err(LoadError::header(format!(
                "header length {} below {min_header}",
                h.header_len
            )));
        }
        s.seek_to(h.header_len as u64).section("header")?;

        let num_pat = pattern_sizes
            .iter()
            .rposition(|&size| size != 0)
            .map_or(0, |last| last + 1);

        let positions: Vec<u16> = orders[..song_length as usize]
            .iter()
            .take_while(|&&o| o != ORDER_END)
            .map(|&o| o as u16)
            .collect();
        if let Some(&bad) = positions.iter().find(|&&p| p as usize >= num_pat) {
            return Err(LoadError::header(format!("order refers to missing pattern {bad}")));
        }

        // Patterns: break row, tempo, then 4-byte cells for 16 channels
        let mut w = new_writer(options);
        let mut patterns: Vec<(u16, Vec<Arc<[u8]>>)> = Vec::with_capacity(num_pat);
        let mut cells = Vec::new();
        for (pat, &size) in pattern_sizes[..num_pat].iter().enumerate() {
            if size == 0 {
                let blank = w.empty_track(64)?;
                patterns.push((64, vec![blank; FAR_CHANNELS]));
                continue;
            }
            let rows = s.read_u8().section("pattern")? as usize + 2;
            // Tempo
            s.skip(1).section("pattern")?;
            if (size as usize) < 2 + rows * FAR_CHANNELS * 4 {
                return Err(LoadError::pattern(
                    pat,
                    format!("{size} bytes for {rows} rows"),
                ));
            }
            let raw = s.read_slice(size as usize - 2).section("pattern")?;
            cells.clear();
            cells.extend(raw.chunks_exact(4).map(|c| FarNote {
                note: c[0],
                ins: c[1],
                vol: c[2],
                eff: c[3],
            }));
            let tracks = (0..FAR_CHANNELS)
                .map(|ch| convert_track(&mut w, &cells, rows, ch))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| LoadError::pattern(pat, e.to_string()))?;
            patterns.push((rows as u16, tracks));
        }

        // Sample map: one bit per sample slot
        let map = s.read_array::<8>().section("sample map")?;
        let present = |i: usize| map[i / 8] & (1 << (i % 8)) != 0;
        let num_smp = (0..MAX_SAMPLES).rposition(present).map_or(0, |last| last + 1);
        let mut samples = Vec::with_capacity(num_smp);
        for i in 0..num_smp {
            if present(i) {
                samples.push(read_sample(&mut s).section("sample")?);
            } else {
                samples.push(Sample {
                    flags: SampleFlags::NO_DATA,
                    ..Sample::default()
                });
            }
        }

        let mut m = Module::new();
        m.song_name = h.name.clone();
        m.mod_type = "Farandole".to_string();
        m.comment = comment.join("\n").trim_end().to_string();
        m.flags = ModuleFlags::PANNING;
        m.num_chn = FAR_CHANNELS as u16;
        m.init_speed = h.speed.max(1);
        m.init_tempo = 80;
        for (pan, &p) in m.panning.iter_mut().zip(h.panning.iter()) {
            *pan = ((p & 0x0F) as u16) << 4;
        }

        m.alloc_positions(positions.len())?;
        m.positions.copy_from_slice(&positions);
        m.rep_pos = if (loop_to as usize) < positions.len() {
            loop_to as u16
        } else {
            0
        };

        m.num_smp = num_smp as u16;
        m.num_ins = num_smp as u16;
        m.alloc_samples()?;
        m.samples = samples;

        m.num_pat = num_pat as u16;
        m.alloc_patterns()?;
        m.alloc_tracks()?;
        for (pat, (rows, tracks)) in patterns.into_iter().enumerate() {
            m.pattern_rows[pat] = rows;
            for (ch, track) in tracks.into_iter().enumerate() {
                m.tracks[pat * FAR_CHANNELS + ch] = Some(track);
            }
        }

        debug!(
            "FAR '{}': {} patterns, {} samples, {} positions",
            m.song_name, m.num_pat, m.num_smp, m.num_pos
        );
        Ok(m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{Bytes, assert_rejects_truncated, row_events};
    use nether_unimod::track::Event;

    const TEXT: &str = "hello";

    fn build_far() -> Vec<u8> {
        let mut b = Bytes::new();
        b.bytes(FAR_MAGIC).str("far song", 40).bytes(NAME_TERMINATOR);
        let header_len = HEADER1_SIZE + TEXT.len() + HEADER2_SIZE;
        b.u16le(header_len as u16).u8(0x10).fill(1, 16).zeros(9);
        b.u8(4);
        for ch in 0..16u8 {
            b.u8(ch);
        }
        b.zeros(4).u16le(TEXT.len() as u16);
        assert_eq!(b.len(), HEADER1_SIZE);
        b.bytes(TEXT.as_bytes());

        let mut orders = [ORDER_END; 256];
        orders[..3].copy_from_slice(&[0, 2, 0]);
        b.bytes(&orders);
        b.u8(3).u8(3).u8(1);
        // Pattern 0: 4 rows stored as 2; pattern 1 empty; pattern 2: 2 rows stored as 0
        let p0 = 2 + 4 * 64;
        let p2 = 2 + 2 * 64;
        b.u16le(p0 as u16).u16le(0).u16le(p2 as u16);
        b.zeros(253 * 2);
        assert_eq!(b.len(), header_len);

        b.u8(2).u8(0);
        for row in 0..4 {
            for ch in 0..16 {
                if row == 1 && ch == 3 {
                    // Note 1, instrument 2, volume 9, vibrato depth then vibrato
                    b.u8(1).u8(2).u8(9).u8(0x63);
                } else if row == 0 && ch == 3 {
                    b.u8(0).u8(0).u8(0).u8(0x55);
                } else {
                    b.zeros(4);
                }
            }
        }
        b.u8(0).u8(0).zeros(2 * 64);

        // Samples 0 and 2 present
        b.u8(0b101).zeros(7);
        for name in ["first", "third"] {
            b.str(name, 32).u32le(8).u8(0).u8(15).u32le(2).u32le(6).u8(0).u8(8);
            b.fill(0x11, 8);
        }
        b.build()
    }

    #[test]
    fn test_identify() {
        let data = build_far();
        assert!(FarLoader.identify(&data));
        assert_rejects_truncated(&FarLoader, &data, HEADER1_SIZE);
    }

    #[test]
    fn test_load() {
        let data = build_far();
        let m = FarLoader.load(&data, &LoadOptions::default()).unwrap();
        m.validate().unwrap();

        assert_eq!(m.song_name, "far song");
        assert_eq!(m.comment, TEXT);
        assert_eq!(m.positions, vec![0, 2, 0]);
        assert_eq!(m.rep_pos, 1);
        assert_eq!(m.num_pat, 3);
        assert_eq!(m.pattern_rows, vec![4, 64, 2]);
        assert_eq!(m.panning[2], 0x20);

        assert_eq!(m.num_smp, 3);
        assert_eq!(m.samples[0].name, "first");
        assert!(m.samples[1].flags.contains(SampleFlags::NO_DATA));
        assert_eq!(m.samples[2].name, "third");
        assert!(m.samples[2].flags.contains(SampleFlags::LOOP));
        assert_eq!(m.samples[2].volume, 60);
        assert_eq!(m.samples[2].seek_pos, (data.len() - 8) as u64);

        assert_eq!(
            row_events(&m, 0, 3, 1),
            vec![
                Event::Instrument(2),
                Event::Note(36),
                Event::Effect {
                    opcode: opcodes::PTEFFECTC,
                    param: 32
                },
                Event::Effect {
                    opcode: opcodes::FAREFFECT6,
                    param: 0x35
                },
            ]
        );
        assert!(row_events(&m, 1, 0, 63).is_empty());
    }

    #[test]
    fn test_short_pattern_rejected() {
        let mut data = build_far();
        // Pattern 0 claims more rows than it stores
        let offset = HEADER1_SIZE + TEXT.len() + HEADER2_SIZE;
        data[offset] = 10;
        assert!(matches!(
            FarLoader.load(&data, &LoadOptions::default()),
            Err(LoadError::Pattern { pattern: 0, .. })
        ));
    }
}
