//! UltraTracker (ULT) loader

use std::sync::Arc;

use nether_unimod::{
    LAST_PATTERN, Module, ModuleFlags, ModuleStream, NUM_NOTES, OCTAVE, Sample, SampleFlags,
    UniError, UniWriter, opcodes,
};
use tracing::debug;

use crate::error::{Context, LoadError};
use crate::{LoadOptions, ModuleLoader, new_writer, open_stream};

/// "MAS_UTrack_V00" followed by the format digit '1'..'4'
const ULT_MAGIC: &[u8; 14] = b"MAS_UTrack_V00";

/// Magic, version digit, title, text line count
const HEADER_SIZE: usize = 15 + 32 + 1;

/// Width of one song text line
const TEXT_LINE: usize = 32;

const ULT_ROWS: usize = 64;
const MAX_ORDERS: usize = 256;
const ORDER_END: u8 = 0xFF;

/// Event prefix introducing a repeat count
const REPEAT_MARK: u8 = 0xFC;

const SAMPLE_16BIT: u8 = 0x04;
const SAMPLE_LOOP: u8 = 0x08;
const SAMPLE_REVERSE: u8 = 0x10;

const TRACKERS: [&str; 4] = [
    "Ultra Tracker 1.3",
    "Ultra Tracker 1.4",
    "Ultra Tracker 1.5",
    "Ultra Tracker 1.6",
];

#[derive(Debug, Clone, Copy, Default)]
struct UltEvent {
    note: u8,
    sample: u8,
    /// Two effects: high nibble uses `dat2`, low nibble uses `dat1`
    eff: u8,
    dat1: u8,
    dat2: u8,
}

/// Read one event and its repeat count
fn read_event(s: &mut ModuleStream) -> Result<(UltEvent, usize), UniError> {
    let mut repeat = 1;
    let mut note = s.read_u8()?;
    if note == REPEAT_MARK {
        repeat = s.read_u8()? as usize;
        note = s.read_u8()?;
    }
    let event = UltEvent {
        note,
        sample: s.read_u8()?,
        eff: s.read_u8()?,
        dat1: s.read_u8()?,
        dat2: s.read_u8()?,
    };
    Ok((event, repeat))
}

/// Track state carried between rows
#[derive(Debug, Default)]
struct TrackState {
    /// The previous row slid towards a note
    porta_active: bool,
    /// A panning command was seen
    panning: bool,
}

/// Emit one of the two effects of an event
///
/// Returns whether the effect was a tone portamento.
fn convert_effect(w: &mut UniWriter, st: &mut TrackState, ev: &UltEvent, second: bool) -> bool {
    let flags = ModuleFlags::empty();
    let (eff, dat) = if second {
        (ev.eff & 0x0F, ev.dat1)
    } else {
        (ev.eff >> 4, ev.dat2)
    };
    match eff {
        0x3 => {
            // A zero speed only continues a slide started on the rows above
            if dat != 0 || st.porta_active {
                w.effect(opcodes::ITEFFECTG, dat as u16);
                return true;
            }
        }
        // Special commands (no loop, reverse) are not supported
        0x5 => {}
        0x9 => {
            if !second {
                let lo = if ev.eff & 0x0F == 0x9 { ev.dat1 } else { 0 };
                w.effect(opcodes::ULTEFFECT9, ((dat as u16) << 8) | lo as u16);
            } else if ev.eff >> 4 != 0x9 {
                w.effect(opcodes::ULTEFFECT9, (dat as u16) << 8);
            }
        }
        0xB => {
            w.pt_effect(0x8, dat.wrapping_mul(0x0F), flags);
            st.panning = true;
        }
        0xC => w.pt_effect(0xC, dat >> 2, flags),
        _ => w.pt_effect(eff, dat, flags),
    }
    false
}

/// Convert one track of 64 rows; repeats past the last row are dropped
fn read_track(
    s: &mut ModuleStream,
    w: &mut UniWriter,
    st: &mut TrackState,
) -> Result<Arc<[u8]>, UniError> {
    w.reset();
    st.porta_active = false;
    let mut row = 0;
    while row < ULT_ROWS {
        let (ev, repeat) = read_event(s)?;
        for _ in 0..repeat.min(ULT_ROWS - row) {
            if ev.sample != 0 {
                w.instrument(ev.sample - 1);
            }
            if ev.note != 0 {
                let note = ev.note as usize + 2 * OCTAVE as usize - 1;
                if note < NUM_NOTES {
                    w.note(note as u8);
                }
            }
            let first = convert_effect(w, st, &ev, false);
            let second = convert_effect(w, st, &ev, true);
            st.porta_active = first || second;
            w.new_row();
            row += 1;
        }
    }
    w.finalize()
}

fn read_sample(s: &mut ModuleStream, version: u8) -> Result<Sample, UniError> {
    let name = s.read_string(32)?;
    // DOS filename
    s.skip(12)?;
    let loop_start = s.read_u32_le()?;
    let loop_end = s.read_u32_le()?;
    let size_start = s.read_u32_le()?;
    let size_end = s.read_u32_le()?;
    let volume = s.read_u8()?;
    let flags = s.read_u8()?;
    let speed = if version >= b'4' {
        s.read_u16_le()? as u32
    } else {
        8363
    };
    // Finetune
    s.skip(2)?;

    let mut q = Sample {
        name,
        speed,
        length: size_end.saturating_sub(size_start),
        volume: volume >> 2,
        loop_start,
        loop_end,
        flags: SampleFlags::SIGNED,
        ..Sample::default()
    };
    if flags & SAMPLE_LOOP != 0 {
        q.flags |= SampleFlags::LOOP;
    }
    if flags & SAMPLE_REVERSE != 0 {
        q.flags |= SampleFlags::REVERSE;
    }
    if flags & SAMPLE_16BIT != 0 {
        q.flags |= SampleFlags::BITS16;
        q.loop_start >>= 1;
        q.loop_end >>= 1;
    }
    q.fix_loop();
    Ok(q)
}

/// UltraTracker loader
#[derive(Debug, Default, Clone, Copy)]
pub struct UltLoader;

impl ModuleLoader for UltLoader {
    fn name(&self) -> &'static str {
        "ULT"
    }

    fn description(&self) -> &'static str {
        "UltraTracker"
    }

    fn identify(&self, data: &[u8]) -> bool {
        data.len() >= HEADER_SIZE
            && data.starts_with(ULT_MAGIC)
            && (b'1'..=b'4').contains(&data[14])
    }

    fn load(&self, data: &[u8], options: &LoadOptions) -> Result<Module, LoadError> {
        if !self.identify(data) {
            return Err(LoadError::Unknown);
        }
        let mut s = open_stream(data, options);
        s.skip(14).section("header")?;
        let version = s.read_u8().section("header")?;
        let title = s.read_string(32).section("header")?;
        let text_lines = s.read_u8().section("header")? as usize;

        let mut m = Module::new();
        m.song_name = title;
        m.mod_type = TRACKERS[(version - b'1') as usize].to_string();

        if version > b'1' && text_lines > 0 {
            let text = s.read_slice(text_lines * TEXT_LINE).section("song text")?;
            let lines: Vec<String> = text.chunks(TEXT_LINE).map(|l| s.decode(l)).collect();
            m.comment = lines.join("\n").trim_end().to_string();
        }

        let num_smp = s.read_u8().section("header")?;
        let mut samples = Vec::with_capacity(num_smp as usize);
        for _ in 0..num_smp {
            samples.push(read_sample(&mut s, version).section("sample header")?);
        }

        let orders = s.read_array::<MAX_ORDERS>().section("orders")?;
        let song_length = orders
            .iter()
            .position(|&o| o == ORDER_END)
            .unwrap_or(MAX_ORDERS);
        let num_chn = s.read_u8().section("header")? as usize + 1;
        let num_pat = s.read_u8().section("header")? as usize + 1;
        if num_chn > options.channel_limit(32) {
            return Err(LoadError::limit("channels", num_chn, options.max_channels));
        }
        if let Some(&bad) = orders[..song_length]
            .iter()
            .find(|&&o| o as usize >= num_pat)
        {
            return Err(LoadError::header(format!("order refers to missing pattern {bad}")));
        }

        m.num_chn = num_chn as u16;
        if version >= b'3' {
            let pans = s.read_slice(num_chn).section("panning")?;
            for (pan, &p) in m.panning.iter_mut().zip(pans) {
                *pan = ((p & 0x0F) as u16) << 4;
            }
            m.flags |= ModuleFlags::PANNING;
        }

        // End marker kept so the player stops
        let with_end = (song_length + 1).min(MAX_ORDERS);
        m.alloc_positions(with_end)?;
        for (p, &o) in m.positions.iter_mut().zip(&orders[..with_end]) {
            *p = if o == ORDER_END { LAST_PATTERN } else { o as u16 };
        }

        m.num_smp = num_smp as u16;
        m.num_ins = m.num_smp;
        m.alloc_samples()?;
        m.samples = samples;

        // Tracks are stored channel by channel
        m.num_pat = num_pat as u16;
        m.alloc_patterns()?;
        for pat in 0..num_pat {
            for ch in 0..num_chn {
                m.patterns[pat * num_chn + ch] = (ch * num_pat + pat) as u32;
            }
        }
        m.alloc_tracks()?;

        let mut w = new_writer(options);
        let mut st = TrackState::default();
        for t in 0..m.num_trk as usize {
            let track = read_track(&mut s, &mut w, &mut st).map_err(|e| match e {
                UniError::EndOfStream => LoadError::Truncated("track"),
                other => LoadError::pattern(t % num_pat, other.to_string()),
            })?;
            m.tracks[t] = Some(track);
        }
        if st.panning {
            m.flags |= ModuleFlags::PANNING;
        }

        let mut data_pos = s.pos();
        for q in &mut m.samples {
            q.seek_pos = data_pos;
            data_pos += (q.length * q.frame_size()) as u64;
        }

        debug!(
            "ULT '{}': {} channels, {} patterns, {} samples",
            m.song_name, m.num_chn, m.num_pat, m.num_smp
        );
        Ok(m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{Bytes, assert_rejects_truncated, row_events};
    use nether_unimod::track::Event;

    fn event(b: &mut Bytes, repeat: u8, ev: [u8; 5]) {
        if repeat != 1 {
            b.u8(REPEAT_MARK).u8(repeat);
        }
        b.bytes(&ev);
    }

    fn build_ult() -> Vec<u8> {
        let mut b = Bytes::new();
        b.bytes(ULT_MAGIC).u8(b'4').str("ult song", 32).u8(1);
        b.str("ultra comment", TEXT_LINE);
        // One 16-bit looping sample of 20 frames
        b.u8(1).str("sample", 32).zeros(12);
        b.u32le(4).u32le(16).u32le(0).u32le(20);
        b.u8(0xFF).u8(SAMPLE_LOOP | SAMPLE_16BIT).u16le(8363).u16le(0);
        let mut orders = [ORDER_END; MAX_ORDERS];
        orders[..2].copy_from_slice(&[0, 0]);
        b.bytes(&orders);
        // Two channels, one pattern, panning
        b.u8(1).u8(0).u8(3).u8(12);

        // Channel 0: two identical note rows, then silence
        event(&mut b, 2, [13, 1, 0x0C, 0x80, 0]);
        event(&mut b, 62, [0; 5]);

        // Channel 1: portamento, continued, dropped, orphan continue, offset
        event(&mut b, 1, [0, 0, 0x30, 0, 0x10]);
        event(&mut b, 1, [0, 0, 0x30, 0, 0]);
        event(&mut b, 1, [0; 5]);
        event(&mut b, 1, [0, 0, 0x30, 0, 0]);
        event(&mut b, 1, [0, 0, 0x99, 0x34, 0x12]);
        // Repeat running past the end of the track
        event(&mut b, 200, [0; 5]);

        b.fill(0, 40);
        b.build()
    }

    #[test]
    fn test_identify() {
        let data = build_ult();
        assert!(UltLoader.identify(&data));
        assert_rejects_truncated(&UltLoader, &data, HEADER_SIZE);

        let mut bad = data.clone();
        bad[14] = b'5';
        assert!(!UltLoader.identify(&bad));
    }

    #[test]
    fn test_load() {
        let data = build_ult();
        let m = UltLoader.load(&data, &LoadOptions::default()).unwrap();
        m.validate().unwrap();

        assert_eq!(m.song_name, "ult song");
        assert_eq!(m.mod_type, "Ultra Tracker 1.6");
        assert_eq!(m.comment, "ultra comment");
        assert_eq!(m.positions, vec![0, 0, LAST_PATTERN]);
        assert_eq!(m.song_length(), 2);
        assert_eq!(m.num_chn, 2);
        assert_eq!(&m.panning[..2], &[0x30, 0xC0]);

        let q = &m.samples[0];
        assert_eq!(q.length, 20);
        assert_eq!((q.loop_start, q.loop_end), (2, 8));
        assert_eq!(q.volume, 63);
        assert_eq!(q.seek_pos, (data.len() - 40) as u64);

        let note_row = vec![
            Event::Instrument(0),
            Event::Note(36),
            Event::Effect {
                opcode: opcodes::PTEFFECTC,
                param: 0x20,
            },
        ];
        assert_eq!(row_events(&m, 0, 0, 0), note_row);
        assert_eq!(row_events(&m, 0, 0, 1), note_row);
        assert!(row_events(&m, 0, 0, 2).is_empty());

        let porta = |param| Event::Effect {
            opcode: opcodes::ITEFFECTG,
            param,
        };
        assert_eq!(row_events(&m, 0, 1, 0), vec![porta(0x10)]);
        assert_eq!(row_events(&m, 0, 1, 1), vec![porta(0)]);
        assert!(row_events(&m, 0, 1, 2).is_empty());
        assert!(row_events(&m, 0, 1, 3).is_empty());
        assert_eq!(
            row_events(&m, 0, 1, 4),
            vec![Event::Effect {
                opcode: opcodes::ULTEFFECT9,
                param: 0x1234,
            }]
        );
    }

    #[test]
    fn test_truncated_track() {
        let data = build_ult();
        let cut = data.len() - 40 - 7;
        assert!(matches!(
            UltLoader.load(&data[..cut], &LoadOptions::default()),
            Err(LoadError::Truncated("track"))
        ));
    }
}
