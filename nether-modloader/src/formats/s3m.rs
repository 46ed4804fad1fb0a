//! Scream Tracker 3 (S3M) loader

use std::sync::Arc;

use nether_unimod::{
    Module, ModuleFlags, ModuleStream, OCTAVE, SampleFlags, UniError, UniWriter,
};
use tracing::debug;

use crate::error::{Context, LoadError};
use crate::remap::ChannelRemap;
use crate::s3mit::{CmdFlags, CommandTranslator, ORDER_END, ORDER_SKIP, OrderList};
use crate::{LoadOptions, ModuleLoader, new_writer, open_stream};

/// "SCRM" at offset 0x2C
pub const S3M_MAGIC: &[u8; 4] = b"SCRM";

/// Sample header tag
const SAMPLE_MAGIC: &[u8; 4] = b"SCRS";

/// Rows per pattern (fixed by the format)
pub(crate) const S3M_ROWS: usize = 64;

/// Channel slots in the header
const S3M_CHANNELS: usize = 32;

const MAX_ORDERS: usize = 256;
const MAX_INSTRUMENTS: usize = 255;
const MAX_PATTERNS: usize = 256;

/// Sample lengths above this are clipped (Scream Tracker's own limit)
const MAX_SAMPLE_LENGTH: u32 = 64000;

#[derive(Debug, Clone)]
struct S3mHeader {
    song_name: String,
    ord_num: u16,
    ins_num: u16,
    pat_num: u16,
    flags: u16,
    tracker: u16,
    file_format: u16,
    master_volume: u8,
    initial_speed: u8,
    initial_tempo: u8,
    default_pan: u8,
    channels: [u8; S3M_CHANNELS],
}

fn read_header(s: &mut ModuleStream) -> Result<S3mHeader, UniError> {
    // Song name (28 bytes), 0x1A marker, type, 2 unused
    let song_name = s.read_string(28)?;
    s.skip(4)?;
    let ord_num = s.read_u16_le()?;
    let ins_num = s.read_u16_le()?;
    let pat_num = s.read_u16_le()?;
    let flags = s.read_u16_le()?;
    let tracker = s.read_u16_le()?;
    let file_format = s.read_u16_le()?;
    // "SCRM"
    s.skip(4)?;
    let master_volume = s.read_u8()?;
    let initial_speed = s.read_u8()?;
    let initial_tempo = s.read_u8()?;
    // Master multiplier, ultraclick removal
    s.skip(2)?;
    let default_pan = s.read_u8()?;
    // Reserved (8 bytes), special pointer (2 bytes)
    s.skip(10)?;
    let channels = s.read_array::<S3M_CHANNELS>()?;

    Ok(S3mHeader {
        song_name,
        ord_num,
        ins_num,
        pat_num,
        flags,
        tracker,
        file_format,
        master_volume,
        initial_speed,
        initial_tempo,
        default_pan,
        channels,
    })
}

/// Name of the tracker that wrote a file, from the "created with" field
pub(crate) fn tracker_name(tracker: u16) -> String {
    let major = (tracker >> 8) & 0x0F;
    let minor = tracker & 0xFF;
    let name = match tracker >> 12 {
        1 => "Scream Tracker",
        2 => "Imago Orpheus",
        3 if (0x3215..=0x3217).contains(&tracker) => {
            return format!("Impulse Tracker 2.14p{} (S3M format)", tracker - 0x3214);
        }
        3 => "Impulse Tracker",
        4 => "Schism Tracker",
        5 => "OpenMPT",
        _ => return "Unknown tracker (S3M format)".to_string(),
    };
    if tracker >> 12 == 1 {
        format!("{name} {major}.{minor:02X}")
    } else {
        format!("{name} {major}.{minor:02X} (S3M format)")
    }
}

/// One decoded pattern cell; 255 means "empty" in every field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct S3mNote {
    pub note: u8,
    pub ins: u8,
    pub vol: u8,
    pub cmd: u8,
    pub inf: u8,
}

impl S3mNote {
    pub const EMPTY: Self = Self {
        note: 255,
        ins: 255,
        vol: 255,
        cmd: 255,
        inf: 255,
    };
}

/// Mark the channels a packed S3M pattern uses
///
/// `enabled` filters out channels the header switches off.
pub(crate) fn scan_channels(
    s: &mut ModuleStream,
    remap: &mut ChannelRemap,
    enabled: impl Fn(usize) -> bool,
) -> Result<(), UniError> {
    let mut row = 0;
    while row < S3M_ROWS {
        let flag = s.read_u8()?;
        if flag == 0 {
            row += 1;
            continue;
        }
        let ch = (flag & 31) as usize;
        if enabled(ch) {
            remap.mark(ch);
        }
        if flag & 32 != 0 {
            s.skip(2)?;
        }
        if flag & 64 != 0 {
            s.skip(1)?;
        }
        if flag & 128 != 0 {
            s.skip(2)?;
        }
        if s.pos() > s.len() {
            return Err(UniError::EndOfStream);
        }
    }
    Ok(())
}

/// Decode one packed S3M pattern into `buf` (channel-major, 64 rows per channel)
pub(crate) fn read_pattern(
    s: &mut ModuleStream,
    remap: &ChannelRemap,
    buf: &mut [S3mNote],
) -> Result<(), UniError> {
    buf.fill(S3mNote::EMPTY);
    let mut dummy = S3mNote::EMPTY;
    let mut row = 0;

    while row < S3M_ROWS {
        let flag = s.read_u8()?;
        if flag == 0 {
            row += 1;
            continue;
        }
        let n = match remap.get((flag & 31) as usize) {
            Some(ch) => &mut buf[ch * S3M_ROWS + row],
            None => &mut dummy,
        };
        if flag & 32 != 0 {
            n.note = s.read_u8()?;
            n.ins = s.read_u8()?;
        }
        if flag & 64 != 0 {
            n.vol = s.read_u8()?.min(64);
        }
        if flag & 128 != 0 {
            n.cmd = s.read_u8()?;
            n.inf = s.read_u8()?;
        }
    }
    Ok(())
}

/// Translate one channel's 64 rows
pub(crate) fn convert_track(
    w: &mut UniWriter,
    translator: &mut CommandTranslator,
    track: &[S3mNote],
) -> Result<Arc<[u8]>, UniError> {
    let mf = translator.module_flags;
    w.reset();
    for n in track {
        let mut vol = n.vol;
        if n.ins != 0 && n.ins != 255 {
            w.instrument(n.ins - 1);
        }
        if n.note != 255 {
            if n.note == 254 {
                // Note cut
                w.pt_effect(0xC, 0, mf);
                vol = 255;
            } else {
                w.note((n.note >> 4) * OCTAVE + (n.note & 0x0F));
            }
        }
        if vol < 255 {
            w.pt_effect(0xC, vol, mf);
        }
        translator.process(w, n.cmd, n.inf);
        w.new_row();
    }
    w.finalize()
}

/// Scream Tracker 3 loader
#[derive(Debug, Default, Clone, Copy)]
pub struct S3mLoader;

impl ModuleLoader for S3mLoader {
    fn name(&self) -> &'static str {
        "S3M"
    }

    fn description(&self) -> &'static str {
        "Scream Tracker 3"
    }

    fn identify(&self, data: &[u8]) -> bool {
        data.get(0x2C..0x30) == Some(&S3M_MAGIC[..])
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
        if h.pat_num as usize > MAX_PATTERNS {
            return Err(LoadError::limit("patterns", h.pat_num as usize, MAX_PATTERNS));
        }

        let mut m = Module::new();
        m.song_name = h.song_name.clone();
        m.mod_type = tracker_name(h.tracker);
        m.num_pat = h.pat_num;
        m.num_ins = h.ins_num;
        m.num_smp = h.ins_num;
        m.init_speed = h.initial_speed;
        m.init_tempo = h.initial_tempo as u16;
        m.init_volume = (h.master_volume as u16 * 2).min(128) as u8;
        m.flags = ModuleFlags::ARPMEM | ModuleFlags::PANNING;
        if h.tracker == 0x1300 || h.flags & 64 != 0 {
            m.flags |= ModuleFlags::S3MSLIDES;
        }
        m.bpm_limit = 32;

        // Order list; references to missing patterns end the song
        let mut orders = s.read_slice(h.ord_num as usize).section("orders")?.to_vec();
        for o in orders.iter_mut() {
            if *o as u16 >= h.pat_num && *o < ORDER_SKIP {
                *o = ORDER_END;
            }
        }
        m.alloc_positions(orders.len())?;
        let orders = OrderList::new(orders, options.curious);

        // Instrument and pattern parapointers
        let para = s
            .read_u16_le_vec(h.ins_num as usize + h.pat_num as usize)
            .section("parapointers")?;
        let (ins_para, pat_para) = para.split_at(h.ins_num as usize);
        let pan_table = if h.default_pan == 252 {
            Some(s.read_array::<S3M_CHANNELS>().section("panning table")?)
        } else {
            None
        };

        // Samples
        m.alloc_samples()?;
        for (i, &p) in ins_para.iter().enumerate() {
            s.seek_to((p as u64) << 4).section("sample header")?;
            read_sample(&mut s, &mut m, i, h.file_format).section("sample header")?;
        }

        // Channel usage
        let enabled = |ch: usize| h.channels[ch] < 32;
        let mut remap = ChannelRemap::new();
        for &p in pat_para {
            if p == 0 {
                continue;
            }
            s.seek_to(((p as u64) << 4) + 2).section("pattern")?;
            scan_channels(&mut s, &mut remap, enabled).section("pattern")?;
        }
        let num_chn = remap.build();
        if num_chn > options.channel_limit(S3M_CHANNELS) {
            return Err(LoadError::limit("channels", num_chn, options.max_channels));
        }
        m.num_chn = num_chn.max(1) as u16;

        for (src, dst) in remap.iter() {
            if h.channels[src] < 8 {
                m.panning[dst] = 0x30;
            } else {
                m.panning[dst] = 0xC0;
            }
            if let Some(pan) = &pan_table
                && pan[src] & 0x20 != 0
            {
                m.panning[dst] = ((pan[src] & 0x0F) << 4) as u16;
            }
        }

        // Patterns
        m.alloc_patterns()?;
        m.alloc_tracks()?;

        let mut cmd_flags = CmdFlags::OLDSTYLE;
        if h.tracker >> 12 == 1 {
            cmd_flags |= CmdFlags::SCREAM;
        }
        let mut translator = CommandTranslator::new(cmd_flags, m.flags, orders);
        let mut w = new_writer(options);
        let chn = m.num_chn as usize;
        let mut buf = vec![S3mNote::EMPTY; S3M_ROWS * chn];

        for (pat, &p) in pat_para.iter().enumerate() {
            if p == 0 {
                buf.fill(S3mNote::EMPTY);
            } else {
                s.seek_to(((p as u64) << 4) + 2).section("pattern")?;
                read_pattern(&mut s, &remap, &mut buf).section("pattern")?;
            }
            for ch in 0..chn {
                let track = convert_track(
                    &mut w,
                    &mut translator,
                    &buf[ch * S3M_ROWS..(ch + 1) * S3M_ROWS],
                )
                .map_err(|e| LoadError::pattern(pat, e.to_string()))?;
                m.tracks[pat * chn + ch] = Some(track);
            }
        }

        translator.orders.apply(&mut m);
        debug!(
            "S3M '{}': {} channels, {} patterns, {} samples",
            m.song_name, m.num_chn, m.num_pat, m.num_smp
        );
        Ok(m)
    }
}

/// S3M-style sample header; `file_format` 1 means signed data
pub(crate) fn read_sample(
    s: &mut ModuleStream,
    m: &mut Module,
    index: usize,
    file_format: u16,
) -> Result<(), UniError> {
    // Type, DOS filename (12 bytes)
    s.skip(13)?;
    let mem_seg_hi = s.read_u8()?;
    let mem_seg_lo = s.read_u16_le()?;
    let length = s.read_u32_le()?;
    let loop_start = s.read_u32_le()?;
    let loop_end = s.read_u32_le()?;
    let volume = s.read_u8()?;
    // Reserved, pack
    s.skip(2)?;
    let flags = s.read_u8()?;
    let c2spd = s.read_u32_le()?;
    s.skip(12)?;
    let name = s.read_string(28)?;
    let tag = s.read_array::<4>()?;

    let q = &mut m.samples[index];
    q.name = name;
    q.speed = c2spd;
    q.length = length.min(MAX_SAMPLE_LENGTH);
    q.loop_start = loop_start;
    q.loop_end = loop_end;
    q.volume = volume.min(64);
    q.seek_pos = (((mem_seg_hi as u64) << 16) | mem_seg_lo as u64) << 4;
    if flags & 1 != 0 {
        q.flags |= SampleFlags::LOOP;
    }
    if flags & 2 != 0 {
        q.flags |= SampleFlags::STEREO;
    }
    if flags & 4 != 0 {
        q.flags |= SampleFlags::BITS16;
    }
    if file_format == 1 {
        q.flags |= SampleFlags::SIGNED;
    }
    // Adlib instruments and empty slots carry no sample data
    if &tag != SAMPLE_MAGIC {
        q.length = 0;
        q.flags |= SampleFlags::NO_DATA;
    }
    q.fix_loop();
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::testutil::{Bytes, assert_rejects_truncated, row_events};
    use nether_unimod::opcodes;
    use nether_unimod::track::Event;

    /// One sample, two patterns, orders [0, 1, 255]
    pub(crate) fn build_s3m() -> Vec<u8> {
        let mut b = Bytes::new();
        b.str("Test Song", 28).u8(0x1A).u8(16).zeros(2);
        b.u16le(3) // orders
            .u16le(1) // instruments
            .u16le(2) // patterns
            .u16le(0) // flags
            .u16le(0x1320) // tracker
            .u16le(2); // file format
        b.bytes(S3M_MAGIC);
        b.u8(64).u8(6).u8(125).u8(0xB0).u8(0).u8(0);
        b.zeros(8).u16le(0);
        // Channels 0-1 left, 8 right, others off
        let mut channels = [255u8; 32];
        channels[0] = 0;
        channels[1] = 1;
        channels[2] = 8;
        b.bytes(&channels);
        b.bytes(&[0, 1, 255]);
        // Parapointers: sample at 0x70, patterns at 0xA0 and 0x100
        b.u16le(0x07).u16le(0x0A).u16le(0x10);
        b.pad_to(0x70);

        // Sample header
        b.u8(1).str("", 12).u8(0).u16le(0);
        b.u32le(1000).u32le(100).u32le(900);
        b.u8(48).u8(0).u8(0).u8(1);
        b.u32le(8363).zeros(12);
        b.str("Lead", 28).bytes(SAMPLE_MAGIC);

        // Pattern 0: row 0 ch0 C-5 ins 1 vol 32 cmd A06; row 1 ch2 note cut; rest empty
        b.pad_to(0xA0);
        let p0 = b.len();
        b.u16le(0);
        b.u8(0x20 | 0x40 | 0x80 | 0).u8(0x50).u8(1).u8(32).u8(1).u8(6);
        b.u8(0);
        b.u8(0x20 | 2).u8(254).u8(0);
        b.u8(0);
        b.zeros(62);
        let len0 = (b.len() - p0) as u16;
        b.patch_u16le(p0, len0);

        // Pattern 1: row 0 ch0 pattern break C32 (decimal), rest empty
        b.pad_to(0x100);
        b.u16le(0);
        b.u8(0x80).u8(3).u8(0x32);
        b.zeros(64);
        b.build()
    }

    #[test]
    fn test_identify() {
        let data = build_s3m();
        assert!(S3mLoader.identify(&data));
        assert_rejects_truncated(&S3mLoader, &data, 0x30);
        assert!(!S3mLoader.identify(b"not a module at all"));
    }

    #[test]
    fn test_load() {
        let data = build_s3m();
        let m = S3mLoader.load(&data, &LoadOptions::default()).unwrap();
        m.validate().unwrap();

        assert_eq!(m.song_name, "Test Song");
        assert_eq!(m.mod_type, "Scream Tracker 3.20");
        // Only channels 0 and 2 carry data
        assert_eq!(m.num_chn, 2);
        assert_eq!(m.panning[0], 0x30);
        assert_eq!(m.panning[1], 0xC0);
        assert_eq!(m.positions, vec![0, 1]);
        assert_eq!(m.num_trk, 4);
        assert!(m.flags.contains(ModuleFlags::ARPMEM));

        let smp = &m.samples[0];
        assert_eq!(smp.name, "Lead");
        assert_eq!(smp.length, 1000);
        assert_eq!(smp.volume, 48);
        assert!(smp.flags.contains(SampleFlags::LOOP));
        assert!(!smp.flags.contains(SampleFlags::SIGNED));

        assert_eq!(
            row_events(&m, 0, 0, 0),
            vec![
                Event::Instrument(0),
                Event::Note(5 * 12),
                Event::Effect {
                    opcode: opcodes::PTEFFECTC,
                    param: 32
                },
                Event::Effect {
                    opcode: opcodes::S3MEFFECTA,
                    param: 6
                },
            ]
        );
        assert_eq!(
            row_events(&m, 0, 1, 1),
            vec![Event::Effect {
                opcode: opcodes::PTEFFECTC,
                param: 0
            }]
        );
        assert_eq!(
            row_events(&m, 1, 0, 0),
            vec![Event::Effect {
                opcode: opcodes::PTEFFECTD,
                param: 32
            }]
        );
    }

    #[test]
    fn test_loop_end_clamped_to_length() {
        let mut data = build_s3m();
        data[0x88..0x8C].copy_from_slice(&5000u32.to_le_bytes());
        let m = S3mLoader.load(&data, &LoadOptions::default()).unwrap();
        m.validate().unwrap();

        let smp = &m.samples[0];
        assert_eq!(smp.length, 1000);
        assert_eq!(smp.loop_start, 100);
        assert_eq!(smp.loop_end, 1000);
        assert!(smp.flags.contains(SampleFlags::LOOP));

        // A loop starting past the data disappears
        data[0x84..0x88].copy_from_slice(&2000u32.to_le_bytes());
        let m = S3mLoader.load(&data, &LoadOptions::default()).unwrap();
        m.validate().unwrap();
        assert!(!m.samples[0].flags.contains(SampleFlags::LOOP));
    }

    #[test]
    fn test_curious_keeps_hidden_orders() {
        let mut data = build_s3m();
        // Orders [0, 255, 1]
        data[0x61] = 255;
        data[0x62] = 1;

        let m = S3mLoader.load(&data, &LoadOptions::default()).unwrap();
        assert_eq!(m.positions, vec![0]);

        let options = LoadOptions {
            curious: true,
            ..LoadOptions::default()
        };
        let m = S3mLoader.load(&data, &options).unwrap();
        m.validate().unwrap();
        assert_eq!(m.positions, vec![0, 1]);
    }

    #[test]
    fn test_truncated_pattern_fails() {
        let data = build_s3m();
        let err = S3mLoader
            .load(&data[..0x108], &LoadOptions::default())
            .unwrap_err();
        assert!(matches!(err, LoadError::Truncated(_)));
    }

    #[test]
    fn test_tracker_names() {
        assert_eq!(tracker_name(0x1301), "Scream Tracker 3.01");
        assert_eq!(tracker_name(0x3216), "Impulse Tracker 2.14p2 (S3M format)");
        assert_eq!(tracker_name(0x4050), "Schism Tracker 0.50 (S3M format)");
        assert_eq!(tracker_name(0x9000), "Unknown tracker (S3M format)");
    }
}
