//! General Digital Music (GDM) loader
//!
//! GDM is the output of 2GDM, a converter from several DOS formats. Every section is
//! located through an absolute offset in the header, so the reader seeks around instead
//! of reading sequentially.

use std::sync::Arc;

use nether_unimod::{
    Module, ModuleFlags, ModuleStream, OCTAVE, PAN_SURROUND, SampleFlags, UniError, UniWriter,
    opcodes,
};
use tracing::{debug, warn};

use crate::error::{Context, LoadError};
use crate::s3mit::{ORDER_END, ORDER_SKIP, OrderList};
use crate::{LoadOptions, ModuleLoader, new_writer, open_stream};

const GDM_MAGIC: &[u8; 4] = b"GDM\xFE";
const GMFS_MAGIC: &[u8; 4] = b"GMFS";
/// Offset of "GMFS"
const GMFS_OFFSET: usize = 71;

const HEADER_SIZE: usize = 157;

const GDM_CHANNELS: usize = 32;
const GDM_ROWS: usize = 64;

/// Panning table value for an unused channel
const PAN_UNUSED: u8 = 255;
/// Panning table value for surround
const PAN_TABLE_SURROUND: u8 = 16;

/// Effect slots per cell
const EFFECT_SLOTS: usize = 4;

/// Cell flag bits
const CELL_NOTE: u8 = 0x20;
const CELL_EFFECTS: u8 = 0x40;
/// Set in an effect byte when another effect follows
const EFFECT_MORE: u8 = 0x20;

#[derive(Debug, Clone)]
struct GdmHeader {
    song_name: String,
    tracker_major: u8,
    tracker_minor: u8,
    pan_table: [u8; GDM_CHANNELS],
    master_volume: u8,
    tempo: u8,
    bpm: u8,
    order_loc: u32,
    order_num: u8,
    pattern_loc: u32,
    pattern_num: u8,
    sample_head: u32,
    sample_data: u32,
    sample_num: u8,
    message_loc: u32,
    message_len: u32,
}

fn read_header(s: &mut ModuleStream) -> Result<GdmHeader, UniError> {
    s.skip(4)?;
    let song_name = s.read_string(32)?;
    // Author, EOF marker, "GMFS", format version, tracker id
    s.skip(32 + 3 + 4 + 2 + 2)?;
    let tracker_major = s.read_u8()?;
    let tracker_minor = s.read_u8()?;
    let pan_table = s.read_array()?;
    let master_volume = s.read_u8()?;
    let tempo = s.read_u8()?;
    let bpm = s.read_u8()?;
    // Original format
    s.skip(2)?;
    let order_loc = s.read_u32_le()?;
    let order_num = s.read_u8()?;
    let pattern_loc = s.read_u32_le()?;
    let pattern_num = s.read_u8()?;
    let sample_head = s.read_u32_le()?;
    let sample_data = s.read_u32_le()?;
    let sample_num = s.read_u8()?;
    let message_loc = s.read_u32_le()?;
    let message_len = s.read_u32_le()?;
    // Scrolly text and graphic are not used
    s.skip(4 + 2 + 4 + 2)?;
    Ok(GdmHeader {
        song_name,
        tracker_major,
        tracker_minor,
        pan_table,
        master_volume,
        tempo,
        bpm,
        order_loc,
        order_num,
        pattern_loc,
        pattern_num,
        sample_head,
        sample_data,
        sample_num,
        message_loc,
        message_len,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct GdmNote {
    /// Octave in the high nibble, 1-based note in the low nibble
    note: Option<u8>,
    sample: u8,
    effects: [(u8, u8); EFFECT_SLOTS],
}

impl GdmNote {
    const EMPTY: Self = Self {
        note: None,
        sample: 0,
        effects: [(0, 0); EFFECT_SLOTS],
    };
}

/// Decode one pattern into `buf` (channel-major, 64 rows per channel)
///
/// A zero flag byte ends the current row; any other flag names a channel in its low
/// five bits and carries a note and/or a chain of effects.
fn read_pattern(
    s: &mut ModuleStream,
    buf: &mut [GdmNote],
    channels: usize,
) -> Result<(), UniError> {
    buf.fill(GdmNote::EMPTY);
    let length = s.read_u16_le()?.saturating_sub(2) as usize;
    let mut p = ModuleStream::new(s.read_slice(length)?);

    let mut row = 0usize;
    while !p.is_eof() {
        let flag = p.read_u8()?;
        if flag == 0 {
            row += 1;
            continue;
        }
        let mut n = GdmNote::EMPTY;
        if flag & CELL_NOTE != 0 {
            n.note = Some(p.read_u8()? & 0x7F);
            n.sample = p.read_u8()?;
        }
        if flag & CELL_EFFECTS != 0 {
            loop {
                let e = p.read_u8()?;
                let param = p.read_u8()?;
                n.effects[(e >> 6) as usize] = (e & 0x1F, param);
                if e & EFFECT_MORE == 0 {
                    break;
                }
            }
        }
        let channel = (flag & 0x1F) as usize;
        if flag & (CELL_NOTE | CELL_EFFECTS) != 0 && channel < channels && row < GDM_ROWS {
            buf[channel * GDM_ROWS + row] = n;
        }
    }
    Ok(())
}

fn convert_effect(w: &mut UniWriter, effect: u8, inf: u8, flags: ModuleFlags) {
    let lo = inf & 0x0F;
    match effect {
        0x01 => w.effect(opcodes::S3MEFFECTF, inf as u16),
        0x02 => w.effect(opcodes::S3MEFFECTE, inf as u16),
        0x03 => w.effect(opcodes::ITEFFECTG, inf as u16),
        0x04 => w.effect(opcodes::ITEFFECTH, inf as u16),
        // Portamento/vibrato continued with a volume slide
        0x05 => {
            w.effect(opcodes::ITEFFECTG, 0);
            w.effect(opcodes::S3MEFFECTD, inf as u16);
        }
        0x06 => {
            w.effect(opcodes::ITEFFECTH, 0);
            w.effect(opcodes::S3MEFFECTD, inf as u16);
        }
        0x07 => w.effect(opcodes::S3MEFFECTR, inf as u16),
        0x08 => w.effect(opcodes::S3MEFFECTI, inf as u16),
        0x09 => w.pt_effect(0x9, inf, flags),
        0x0A => w.effect(opcodes::S3MEFFECTD, inf as u16),
        0x0B => w.pt_effect(0xB, inf, flags),
        0x0C => w.pt_effect(0xC, inf, flags),
        0x0D => w.pt_effect(0xD, inf, flags),
        0x0E => match inf & 0xF0 {
            0x10 => w.effect(opcodes::S3MEFFECTF, (0xF0 | lo) as u16),
            0x20 => w.effect(opcodes::S3MEFFECTE, (0xF0 | lo) as u16),
            0x30 => w.pt_effect(0xE, 0x30 | lo, flags),
            0x40 => w.effect(opcodes::ITEFFECTS0, (0x30 | lo) as u16),
            0x50 => w.effect(opcodes::ITEFFECTS0, (0x20 | lo) as u16),
            0x60 => w.effect(opcodes::ITEFFECTS0, (0xB0 | lo) as u16),
            0x70 => w.effect(opcodes::ITEFFECTS0, (0x40 | lo) as u16),
            0x80 => w.effect(opcodes::S3MEFFECTF, (0xE0 | lo) as u16),
            0x90 => w.effect(opcodes::S3MEFFECTE, (0xE0 | lo) as u16),
            0xA0 => w.effect(opcodes::S3MEFFECTD, ((lo << 4) | 0x0F) as u16),
            0xB0 => w.effect(opcodes::S3MEFFECTD, (0xF0 | lo) as u16),
            0xC0 => w.effect(opcodes::ITEFFECTS0, (0xC0 | lo) as u16),
            0xD0 => w.effect(opcodes::ITEFFECTS0, (0xD0 | lo) as u16),
            0xE0 => w.effect(opcodes::ITEFFECTS0, (0xE0 | lo) as u16),
            _ => {}
        },
        0x0F => w.effect(opcodes::S3MEFFECTA, inf as u16),
        0x10 => w.pt_effect(0x0, inf, flags),
        0x12 => w.effect(opcodes::S3MEFFECTQ, inf as u16),
        0x13 => w.effect(opcodes::XMEFFECTG, (inf as u16) << 1),
        0x14 => w.effect(opcodes::ITEFFECTU, inf as u16),
        // Special: 8x sets panning
        0x1E => {
            if inf & 0xF0 == 0x80 {
                w.pt_effect(0x8, lo << 4, flags);
            }
        }
        0x1F => {
            if inf >= 0x20 {
                w.effect(opcodes::S3MEFFECTT, inf as u16);
            }
        }
        _ => {}
    }
}

fn convert_track(w: &mut UniWriter, cells: &[GdmNote]) -> Result<Arc<[u8]>, UniError> {
    let flags = ModuleFlags::S3MSLIDES;
    w.reset();
    for n in cells {
        if n.sample != 0 && n.sample != 255 {
            w.instrument(n.sample - 1);
        }
        if let Some(note) = n.note {
            let semitone = note & 0x0F;
            if semitone != 0 {
                w.note((note >> 4) * OCTAVE + semitone - 1);
            }
        }
        for &(effect, inf) in &n.effects {
            convert_effect(w, effect, inf, flags);
        }
        w.new_row();
    }
    w.finalize()
}

fn read_sample(s: &mut ModuleStream, m: &mut Module, index: usize) -> Result<(), UniError> {
    let name = s.read_string(32)?;
    // DOS filename, EMS handle
    s.skip(12 + 1)?;
    let length = s.read_u32_le()?;
    let loop_start = s.read_u32_le()?;
    let loop_end = s.read_u32_le()?;
    let flags = s.read_u8()?;
    let c4spd = s.read_u16_le()?;
    let volume = s.read_u8()?;
    let pan = s.read_u8()?;

    let q = &mut m.samples[index];
    q.name = name;
    q.speed = c4spd as u32;
    q.length = length;
    q.loop_start = loop_start;
    q.loop_end = loop_end;
    if flags & 0x01 != 0 {
        q.flags |= SampleFlags::LOOP;
    }
    if flags & 0x02 != 0 {
        q.flags |= SampleFlags::BITS16;
        q.length >>= 1;
        q.loop_start >>= 1;
        q.loop_end >>= 1;
    }
    if flags & 0x04 != 0 {
        q.volume = volume.min(64);
    }
    if flags & 0x08 != 0 {
        q.flags |= SampleFlags::OWNPAN;
        q.panning = if pan == PAN_TABLE_SURROUND {
            PAN_SURROUND
        } else {
            ((pan & 0x0F) as u16) << 4
        };
    }
    q.fix_loop();
    Ok(())
}

/// General Digital Music loader
#[derive(Debug, Default, Clone, Copy)]
pub struct GdmLoader;

impl ModuleLoader for GdmLoader {
    fn name(&self) -> &'static str {
        "GDM"
    }

    fn description(&self) -> &'static str {
        "General DigiMusic"
    }

    fn identify(&self, data: &[u8]) -> bool {
        data.len() >= HEADER_SIZE
            && data.starts_with(GDM_MAGIC)
            && &data[GMFS_OFFSET..GMFS_OFFSET + 4] == GMFS_MAGIC
    }

    fn load(&self, data: &[u8], options: &LoadOptions) -> Result<Module, LoadError> {
        if !self.identify(data) {
            return Err(LoadError::Unknown);
        }
        let mut s = open_stream(data, options);
        let h = read_header(&mut s).section("header")?;

        let mut m = Module::new();
        m.song_name = h.song_name.clone();
        m.mod_type = format!(
            "General DigiMusic {}.{:02}",
            h.tracker_major, h.tracker_minor
        );
        m.flags = ModuleFlags::S3MSLIDES | ModuleFlags::PANNING;
        m.init_speed = h.tempo.max(1);
        m.init_tempo = h.bpm as u16;
        m.init_volume = (h.master_volume as u16 * 2).min(128) as u8;
        m.bpm_limit = 32;

        let num_chn = h
            .pan_table
            .iter()
            .rposition(|&p| p != PAN_UNUSED)
            .map_or(0, |last| last + 1);
        if num_chn == 0 {
            return Err(LoadError::header("no channels enabled"));
        }
        if num_chn > options.channel_limit(GDM_CHANNELS) {
            return Err(LoadError::limit("channels", num_chn, options.max_channels));
        }
        m.num_chn = num_chn as u16;
        for (pan, &p) in m.panning.iter_mut().zip(&h.pan_table[..num_chn]) {
            *pan = match p {
                PAN_TABLE_SURROUND => PAN_SURROUND,
                PAN_UNUSED => *pan,
                p => ((p & 0x0F) as u16) << 4,
            };
        }

        if h.message_len > 0 {
            let message = s
                .peek_at(h.message_loc as u64, h.message_len as usize)
                .ok_or(LoadError::Truncated("message"))?;
            m.comment = s.decode(message);
        }

        // Orders; references to missing patterns end the song
        let num_pat = h.pattern_num as usize + 1;
        s.seek_to(h.order_loc as u64).section("orders")?;
        let mut orders = s.read_slice(h.order_num as usize + 1).section("orders")?.to_vec();
        for o in orders.iter_mut() {
            if *o as usize >= num_pat && *o < ORDER_SKIP {
                warn!("order refers to missing pattern {o}");
                *o = ORDER_END;
            }
        }
        m.alloc_positions(orders.len())?;
        OrderList::new(orders, options.curious).apply(&mut m);

        // Sample headers; data is stored back to back
        m.num_smp = h.sample_num as u16 + 1;
        m.num_ins = m.num_smp;
        m.alloc_samples()?;
        s.seek_to(h.sample_head as u64).section("sample header")?;
        let mut data_pos = h.sample_data as u64;
        for i in 0..m.num_smp as usize {
            read_sample(&mut s, &mut m, i).section("sample header")?;
            let q = &mut m.samples[i];
            q.seek_pos = data_pos;
            data_pos += (q.length * q.frame_size()) as u64;
        }

        // Patterns
        m.num_pat = num_pat as u16;
        m.alloc_patterns()?;
        m.alloc_tracks()?;
        let mut w = new_writer(options);
        let mut buf = vec![GdmNote::EMPTY; GDM_ROWS * num_chn];
        s.seek_to(h.pattern_loc as u64).section("pattern")?;
        for pat in 0..num_pat {
            read_pattern(&mut s, &mut buf, num_chn).section("pattern")?;
            for ch in 0..num_chn {
                let track = convert_track(&mut w, &buf[ch * GDM_ROWS..(ch + 1) * GDM_ROWS])
                    .map_err(|e| LoadError::pattern(pat, e.to_string()))?;
                m.tracks[pat * num_chn + ch] = Some(track);
            }
        }

        debug!(
            "GDM '{}': {} channels, {} patterns, {} samples",
            m.song_name, m.num_chn, m.num_pat, m.num_smp
        );
        Ok(m)
    }
}
