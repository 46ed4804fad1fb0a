//! Impulse Tracker (IT) loader

mod instrument;
mod pattern;

use nether_unimod::{
    Module, ModuleFlags, ModuleStream, PAN_CENTER, PAN_RIGHT, PAN_SURROUND, Sample, SampleFlags,
    UniError,
};
use tracing::{debug, warn};

use crate::error::{Context, LoadError};
use crate::remap::ChannelRemap;
use crate::s3mit::{CmdFlags, CommandTranslator, FilterMacros, ORDER_END, ORDER_SKIP, OrderList};
use crate::{LoadOptions, ModuleLoader, new_writer, open_stream};

use instrument::{read_instrument, read_old_instrument};
use pattern::{
    ItNote, MAX_PATTERN_ROWS, convert_track, read_pattern, read_pattern_header, scan_channels,
};

/// "IMPM"
pub const IT_MAGIC: &[u8; 4] = b"IMPM";

/// "IMPS"
const SAMPLE_MAGIC: &[u8; 4] = b"IMPS";

/// Size of the fixed header before the order list
const HEADER_SIZE: usize = 0xC0;

const MAX_ORDERS: usize = 256;
const MAX_INSTRUMENTS: usize = 255;
const MAX_SAMPLES: usize = 255;
const MAX_PATTERNS: usize = 256;

/// Embedded MIDI configuration: 9 global, 16 SFx and 128 Zxx lines of 32 bytes
const MIDI_GLOBAL_LINES: usize = 9;
const MIDI_SFX_LINES: usize = 16;
const MIDI_ZXX_LINES: usize = 128;

mod flags {
    pub const INSTRUMENTS: u16 = 0x0004;
    pub const LINEAR_SLIDES: u16 = 0x0008;
    pub const OLD_EFFECTS: u16 = 0x0010;
}

mod special {
    pub const MESSAGE: u16 = 0x0001;
    pub const EDIT_HISTORY: u16 = 0x0002;
    pub const MIDI_CONFIG: u16 = 0x0008;
}

#[derive(Debug, Clone)]
struct ItHeader {
    song_name: String,
    ord_num: u16,
    ins_num: u16,
    smp_num: u16,
    pat_num: u16,
    created_with: u16,
    compatible_with: u16,
    flags: u16,
    special: u16,
    global_volume: u8,
    initial_speed: u8,
    initial_tempo: u8,
    message_length: u16,
    message_offset: u32,
    channel_pan: [u8; 64],
    channel_vol: [u8; 64],
}

fn read_header(s: &mut ModuleStream) -> Result<ItHeader, UniError> {
    // "IMPM"
    s.skip(4)?;
    let song_name = s.read_string(26)?;
    // Pattern row highlight
    s.skip(2)?;
    let ord_num = s.read_u16_le()?;
    let ins_num = s.read_u16_le()?;
    let smp_num = s.read_u16_le()?;
    let pat_num = s.read_u16_le()?;
    let created_with = s.read_u16_le()?;
    let compatible_with = s.read_u16_le()?;
    let flags = s.read_u16_le()?;
    let special = s.read_u16_le()?;
    let global_volume = s.read_u8()?;
    // Mix volume
    s.skip(1)?;
    let initial_speed = s.read_u8()?;
    let initial_tempo = s.read_u8()?;
    // Panning separation, pitch wheel depth
    s.skip(2)?;
    let message_length = s.read_u16_le()?;
    let message_offset = s.read_u32_le()?;
    s.skip(4)?;
    let channel_pan = s.read_array::<64>()?;
    let channel_vol = s.read_array::<64>()?;

    Ok(ItHeader {
        song_name,
        ord_num,
        ins_num,
        smp_num,
        pat_num,
        created_with,
        compatible_with,
        flags,
        special,
        global_volume,
        initial_speed,
        initial_tempo,
        message_length,
        message_offset,
        channel_pan,
        channel_vol,
    })
}

/// Name of the tracker that wrote a file, from the "created with" field
fn tracker_name(created_with: u16) -> String {
    match created_with >> 12 {
        0 if created_with == 0x0888 => "OpenMPT".to_string(),
        0 => format!(
            "Impulse Tracker {}.{:02X}",
            (created_with >> 8) & 0x0F,
            created_with & 0xFF
        ),
        1 => "Schism Tracker".to_string(),
        5 => "OpenMPT".to_string(),
        _ => "Unknown tracker (IT format)".to_string(),
    }
}

/// Channel pan: 0-64 position, 100 surround, high bit mutes
fn channel_panning(pan: u8) -> u16 {
    match pan & 0x7F {
        p @ 0..=63 => (p as u16) << 2,
        64 => PAN_RIGHT,
        100 => PAN_SURROUND,
        _ => PAN_CENTER,
    }
}

fn read_sample(s: &mut ModuleStream, index: usize) -> Result<Sample, LoadError> {
    let section = "sample header";
    let magic = s.read_array::<4>().section(section)?;
    if &magic != SAMPLE_MAGIC {
        return Err(LoadError::Sample {
            index,
            reason: "missing IMPS signature".into(),
        });
    }
    // DOS filename (12 bytes), reserved
    s.skip(13).section(section)?;
    let global_volume = s.read_u8().section(section)?;
    let flag = s.read_u8().section(section)?;
    let volume = s.read_u8().section(section)?;
    let name = s.read_string(26).section(section)?;
    let convert = s.read_u8().section(section)?;
    let pan = s.read_u8().section(section)?;
    let length = s.read_u32_le().section(section)?;
    let loop_start = s.read_u32_le().section(section)?;
    let loop_end = s.read_u32_le().section(section)?;
    let c5_speed = s.read_u32_le().section(section)?;
    let sus_begin = s.read_u32_le().section(section)?;
    let sus_end = s.read_u32_le().section(section)?;
    let data_offset = s.read_u32_le().section(section)?;
    let vib_speed = s.read_u8().section(section)?;
    let vib_depth = s.read_u8().section(section)?;
    let vib_rate = s.read_u8().section(section)?;
    let vib_type = s.read_u8().section(section)?;

    let mut q = Sample {
        name,
        speed: if c5_speed == 0 { 8363 } else { c5_speed },
        volume: volume.min(64),
        global_volume: global_volume.min(64),
        length,
        loop_start,
        loop_end,
        sus_begin,
        sus_end,
        vib_type,
        vib_sweep: vib_rate,
        vib_depth,
        vib_rate: vib_speed,
        seek_pos: data_offset as u64,
        ..Sample::default()
    };

    if flag & 0x01 == 0 {
        q.length = 0;
        q.flags |= SampleFlags::NO_DATA;
    }
    if flag & 0x02 != 0 {
        q.flags |= SampleFlags::BITS16;
    }
    if flag & 0x04 != 0 {
        q.flags |= SampleFlags::STEREO;
    }
    if flag & 0x08 != 0 {
        q.flags |= SampleFlags::ITPACKED;
        if convert & 0x04 != 0 {
            q.flags |= SampleFlags::IT215;
        }
    }
    if flag & 0x10 != 0 {
        q.flags |= SampleFlags::LOOP;
    }
    if flag & 0x20 != 0 {
        q.flags |= SampleFlags::SUSTAIN;
    }
    if flag & 0x40 != 0 {
        q.flags |= SampleFlags::BIDI;
    }
    if flag & 0x80 != 0 {
        q.flags |= SampleFlags::SUSTAIN_BIDI;
    }
    if convert & 0x01 != 0 {
        q.flags |= SampleFlags::SIGNED;
    }
    if convert & 0x04 != 0 && flag & 0x08 == 0 {
        q.flags |= SampleFlags::DELTA;
    }
    // Bit 7 of the sample pan means "use it"
    if pan & 0x80 != 0 {
        q.flags |= SampleFlags::OWNPAN;
    }
    let pan = pan & 0x7F;
    q.panning = if pan >= 64 { PAN_RIGHT } else { (pan as u16) << 2 };

    q.fix_loop();
    if q.flags.contains(SampleFlags::SUSTAIN) && q.sus_begin > q.sus_end {
        q.flags.remove(SampleFlags::SUSTAIN | SampleFlags::SUSTAIN_BIDI);
    }
    Ok(q)
}

/// Song message; carriage returns become newlines
fn read_message(s: &ModuleStream, offset: u32, length: u16) -> Option<String> {
    let bytes = s.peek_at(offset as u64, length as usize)?;
    Some(s.decode(bytes).replace('\r', "\n"))
}

/// Impulse Tracker loader
#[derive(Debug, Default, Clone, Copy)]
pub struct ItLoader;

impl ModuleLoader for ItLoader {
    fn name(&self) -> &'static str {
        "IT"
    }

    fn description(&self) -> &'static str {
        "Impulse Tracker"
    }

    fn identify(&self, data: &[u8]) -> bool {
        data.len() >= HEADER_SIZE && data.starts_with(IT_MAGIC)
    }

    fn load(&self, data: &[u8], options: &LoadOptions) -> Result<Module, LoadError> {
        if !self.identify(data) {
            return Err(LoadError::Unknown);
        }
        let mut s = open_stream(data, options);
        let h = read_header(&mut s).section("header")?;

        if h.ord_num as usize > MAX_ORDERS {
            return Err(LoadError::limit("orders", h.ord_num as usize, MAX_ORDERS));
        }
        if h.ins_num as usize > MAX_INSTRUMENTS {
            return Err(LoadError::limit(
                "instruments",
                h.ins_num as usize,
                MAX_INSTRUMENTS,
            ));
        }
        if h.smp_num as usize > MAX_SAMPLES {
            return Err(LoadError::limit("samples", h.smp_num as usize, MAX_SAMPLES));
        }
        if h.pat_num as usize > MAX_PATTERNS {
            return Err(LoadError::limit("patterns", h.pat_num as usize, MAX_PATTERNS));
        }

        let instrument_mode = h.flags & flags::INSTRUMENTS != 0;
        let mut m = Module::new();
        m.song_name = h.song_name.clone();
        m.mod_type = tracker_name(h.created_with);
        m.num_pat = h.pat_num;
        m.num_smp = h.smp_num;
        m.num_ins = if instrument_mode { h.ins_num } else { 0 };
        m.init_speed = h.initial_speed;
        m.init_tempo = h.initial_tempo as u16;
        m.init_volume = h.global_volume.min(128);
        m.bpm_limit = 32;
        m.flags = ModuleFlags::PANNING | ModuleFlags::NNA;
        if h.flags & flags::LINEAR_SLIDES != 0 {
            m.flags |= ModuleFlags::XMPERIODS | ModuleFlags::LINEAR;
        }
        if instrument_mode {
            m.flags |= ModuleFlags::INST;
        }

        let mut orders = s.read_slice(h.ord_num as usize).section("orders")?.to_vec();
        for o in orders.iter_mut() {
            if *o as u16 >= h.pat_num && *o < ORDER_SKIP {
                *o = ORDER_END;
            }
        }
        m.alloc_positions(orders.len())?;
        let orders = OrderList::new(orders, options.curious);

        let ins_para = read_u32_vec(&mut s, h.ins_num as usize).section("parapointers")?;
        let smp_para = read_u32_vec(&mut s, h.smp_num as usize).section("parapointers")?;
        let pat_para = read_u32_vec(&mut s, h.pat_num as usize).section("parapointers")?;

        if h.special & special::EDIT_HISTORY != 0 {
            let entries = s.read_u16_le().section("edit history")?;
            s.skip(entries as u64 * 8).section("edit history")?;
        }
        let filters = if h.special & special::MIDI_CONFIG != 0 {
            s.skip((MIDI_GLOBAL_LINES * 32) as u64).section("MIDI config")?;
            let sfx = read_midi_lines(&mut s, MIDI_SFX_LINES).section("MIDI config")?;
            let zxx = read_midi_lines(&mut s, MIDI_ZXX_LINES).section("MIDI config")?;
            FilterMacros::from_midi_config(&sfx, &zxx)
        } else {
            FilterMacros::default()
        };

        if h.special & special::MESSAGE != 0 && h.message_length > 0 {
            match read_message(&s, h.message_offset, h.message_length) {
                Some(text) => m.comment = text,
                None => warn!("IT song message lies outside the file"),
            }
        }

        // Samples
        m.alloc_samples()?;
        for (i, &p) in smp_para.iter().enumerate() {
            s.seek_to(p as u64).section("sample header")?;
            m.samples[i] = read_sample(&mut s, i)?;
        }

        // Channel usage
        let mut remap = ChannelRemap::new();
        let mut pattern_rows = vec![64u16; h.pat_num as usize];
        for (pat, &p) in pat_para.iter().enumerate() {
            if p == 0 {
                continue;
            }
            s.seek_to(p as u64).section("pattern")?;
            let (_, rows) = read_pattern_header(&mut s).section("pattern")?;
            if rows == 0 || rows > MAX_PATTERN_ROWS {
                return Err(LoadError::pattern(pat, format!("{rows} rows")));
            }
            pattern_rows[pat] = rows;
            scan_channels(&mut s, rows, &mut remap).section("pattern")?;
        }
        let num_chn = remap.build();
        if num_chn > options.channel_limit(64) {
            return Err(LoadError::limit("channels", num_chn, options.max_channels));
        }
        m.num_chn = num_chn.max(1) as u16;
        for (src, dst) in remap.iter() {
            m.panning[dst] = channel_panning(h.channel_pan[src]);
            m.chan_vol[dst] = h.channel_vol[src].min(64);
        }

        // Patterns
        m.alloc_patterns()?;
        m.pattern_rows.copy_from_slice(&pattern_rows);
        m.alloc_tracks()?;

        let mut cmd_flags = CmdFlags::IT;
        if h.created_with >= 0x106 && h.flags & flags::OLD_EFFECTS != 0 {
            cmd_flags |= CmdFlags::OLDSTYLE;
        }
        let mut translator = CommandTranslator::new(cmd_flags, m.flags, orders);
        translator.filters = Some(filters);

        let mut w = new_writer(options);
        let chn = m.num_chn as usize;
        let mut buf = vec![ItNote::EMPTY; MAX_PATTERN_ROWS as usize * chn];

        for (pat, &p) in pat_para.iter().enumerate() {
            let rows = pattern_rows[pat];
            let cells = &mut buf[..rows as usize * chn];
            if p == 0 {
                cells.fill(ItNote::EMPTY);
            } else {
                s.seek_to(p as u64 + 8).section("pattern")?;
                read_pattern(&mut s, rows, &remap, cells).section("pattern")?;
            }
            for ch in 0..chn {
                let start = ch * rows as usize;
                let track = convert_track(
                    &mut w,
                    &mut translator,
                    &cells[start..start + rows as usize],
                )
                .map_err(|reason| LoadError::pattern(pat, reason))?;
                m.tracks[pat * chn + ch] = Some(track);
            }
        }

        // Instruments
        if instrument_mode {
            m.alloc_instruments()?;
            for (i, &p) in ins_para.iter().enumerate() {
                s.seek_to(p as u64).section("instrument")?;
                let parsed = if h.compatible_with < 0x200 {
                    read_old_instrument(&mut s)
                } else {
                    read_instrument(&mut s)
                }
                .section("instrument")?;
                match parsed {
                    Some(ins) => m.instruments[i] = ins,
                    None => debug!("IT instrument {i} has no IMPI header"),
                }
            }
        }

        translator.orders.apply(&mut m);
        debug!(
            "IT '{}': {} channels, {} patterns, {} samples, {} instruments",
            m.song_name, m.num_chn, m.num_pat, m.num_smp, m.num_ins
        );
        Ok(m)
    }
}

fn read_u32_vec(s: &mut ModuleStream, count: usize) -> Result<Vec<u32>, UniError> {
    (0..count).map(|_| s.read_u32_le()).collect()
}

fn read_midi_lines(s: &mut ModuleStream, count: usize) -> Result<Vec<[u8; 32]>, UniError> {
    (0..count).map(|_| s.read_array::<32>()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{Bytes, assert_rejects_truncated, row_events};
    use super::instrument::build_instrument;
    use nether_unimod::opcodes::{self, vol};
    use nether_unimod::track::Event;

    const INS_OFFSET: usize = 0x100;
    const SMP_OFFSET: usize = 0x340;
    const PAT_OFFSET: usize = 0x3A0;
    const MSG_OFFSET: usize = 0x400;

    /// One instrument, one sample, one 2-row pattern using only channel 2
    fn build_it(header_flags: u16, volpan: u8) -> Vec<u8> {
        let mut b = Bytes::new();
        b.bytes(IT_MAGIC).str("Impulse Song", 26).zeros(2);
        b.u16le(2) // orders
            .u16le(1) // instruments
            .u16le(1) // samples
            .u16le(1) // patterns
            .u16le(0x0214)
            .u16le(0x0214)
            .u16le(header_flags)
            .u16le(special::MESSAGE);
        b.u8(128).u8(48).u8(6).u8(125).u8(128).u8(0);
        b.u16le(8).u32le(MSG_OFFSET as u32).zeros(4);
        b.fill(32, 64);
        b.fill(64, 64);
        b.bytes(&[0, 255]);
        b.u32le(INS_OFFSET as u32)
            .u32le(SMP_OFFSET as u32)
            .u32le(PAT_OFFSET as u32);

        b.pad_to(INS_OFFSET);
        b.bytes(&build_instrument("Piano", 1));

        b.pad_to(SMP_OFFSET);
        b.bytes(SAMPLE_MAGIC).str("", 12).u8(0);
        b.u8(64).u8(0x11).u8(48).str("Piano C", 26);
        b.u8(0x01).u8(0x80 | 32);
        b.u32le(1000).u32le(10).u32le(500).u32le(22050);
        b.u32le(0).u32le(0).u32le(0x500);
        b.u8(0).u8(0).u8(0).u8(0);

        b.pad_to(PAT_OFFSET);
        let packed = [0x83, 0x0F, 60, 1, volpan, 1, 3, 0, 0x83, 0x01, 254, 0];
        b.u16le(packed.len() as u16).u16le(2).zeros(4).bytes(&packed);

        b.pad_to(MSG_OFFSET);
        b.bytes(b"Hi\rthere");
        b.build()
    }

    #[test]
    fn test_identify() {
        let data = build_it(0x0C, 32);
        assert!(ItLoader.identify(&data));
        assert_rejects_truncated(&ItLoader, &data, HEADER_SIZE);
    }

    #[test]
    fn test_load_instrument_mode() {
        let data = build_it(0x0C, 32);
        let m = ItLoader.load(&data, &LoadOptions::default()).unwrap();
        m.validate().unwrap();

        assert_eq!(m.song_name, "Impulse Song");
        assert_eq!(m.mod_type, "Impulse Tracker 2.14");
        assert_eq!(m.comment, "Hi\nthere");
        assert!(m.flags.contains(ModuleFlags::INST | ModuleFlags::NNA));
        assert_eq!(m.num_chn, 1);
        assert_eq!(m.panning[0], 128);
        assert_eq!(m.positions, vec![0]);
        assert_eq!(m.pattern_rows, vec![2]);

        let smp = &m.samples[0];
        assert_eq!(smp.name, "Piano C");
        assert_eq!(smp.speed, 22050);
        assert!(smp.flags.contains(SampleFlags::LOOP | SampleFlags::SIGNED | SampleFlags::OWNPAN));
        assert_eq!(smp.seek_pos, 0x500);

        assert_eq!(m.instruments.len(), 1);
        assert_eq!(m.instruments[0].name, "Piano");
        assert_eq!(m.instruments[0].sample_number[60], 0);

        assert_eq!(
            row_events(&m, 0, 0, 0),
            vec![
                Event::Note(60),
                Event::Instrument(0),
                Event::Volume {
                    kind: vol::VOLUME,
                    value: 32
                },
                Event::Effect {
                    opcode: opcodes::S3MEFFECTA,
                    param: 3
                },
            ]
        );
        assert_eq!(
            row_events(&m, 0, 0, 1),
            vec![
                Event::Effect {
                    opcode: opcodes::PTEFFECTC,
                    param: 0
                },
                Event::Volume {
                    kind: vol::VOLUME,
                    value: 0
                },
            ]
        );
    }

    #[test]
    fn test_loop_end_clamped_to_length() {
        let mut data = build_it(0x0C, 32);
        let loop_end = SMP_OFFSET + 0x38;
        data[loop_end..loop_end + 4].copy_from_slice(&5000u32.to_le_bytes());
        let m = ItLoader.load(&data, &LoadOptions::default()).unwrap();
        m.validate().unwrap();

        let smp = &m.samples[0];
        assert_eq!(smp.length, 1000);
        assert_eq!(smp.loop_start, 10);
        assert_eq!(smp.loop_end, 1000);
        assert!(smp.flags.contains(SampleFlags::LOOP));
    }

    #[test]
    fn test_linear_slides_flag() {
        let data = build_it(0x0008, 32);
        let m = ItLoader.load(&data, &LoadOptions::default()).unwrap();
        assert!(m.flags.contains(ModuleFlags::XMPERIODS | ModuleFlags::LINEAR));
        assert!(!m.flags.contains(ModuleFlags::INST));
        assert!(m.instruments.is_empty());

        let data = build_it(0x0004, 32);
        let m = ItLoader.load(&data, &LoadOptions::default()).unwrap();
        assert!(!m.flags.intersects(ModuleFlags::XMPERIODS | ModuleFlags::LINEAR));
    }

    #[test]
    fn test_invalid_volume_column() {
        let data = build_it(0x0C, 126);
        let err = ItLoader.load(&data, &LoadOptions::default()).unwrap_err();
        assert!(matches!(err, LoadError::Pattern { pattern: 0, .. }));
    }

    #[test]
    fn test_truncated_pattern() {
        let data = build_it(0x0C, 32);
        let err = ItLoader
            .load(&data[..PAT_OFFSET + 12], &LoadOptions::default())
            .unwrap_err();
        assert!(matches!(err, LoadError::Truncated(_)));
    }

    #[test]
    fn test_channel_panning() {
        assert_eq!(channel_panning(0), 0);
        assert_eq!(channel_panning(32), 128);
        assert_eq!(channel_panning(64), PAN_RIGHT);
        assert_eq!(channel_panning(100), PAN_SURROUND);
        assert_eq!(channel_panning(0x80 | 16), 64);
    }

    #[test]
    fn test_tracker_names() {
        assert_eq!(tracker_name(0x0217), "Impulse Tracker 2.17");
        assert_eq!(tracker_name(0x0888), "OpenMPT");
        assert_eq!(tracker_name(0x1050), "Schism Tracker");
    }
}
