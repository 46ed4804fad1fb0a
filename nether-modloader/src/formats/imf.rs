//! Imago Orpheus (IMF) loader

use std::sync::Arc;

use nether_unimod::{
    Envelope, EnvelopeFlags, EnvelopePoint, Instrument, Module, ModuleFlags, ModuleStream,
    NUM_NOTES, OCTAVE, Sample, SampleFlags, UniError, UniWriter, opcodes,
};
use tracing::{debug, warn};

use crate::error::{Context, LoadError};
use crate::remap::ChannelRemap;
use crate::{LoadOptions, ModuleLoader, new_writer, open_stream};

/// "IM10" at offset 0x3C
const IMF_MAGIC: &[u8; 4] = b"IM10";
const MAGIC_OFFSET: usize = 0x3C;
const INSTRUMENT_MAGIC: &[u8; 4] = b"II10";
const SAMPLE_MAGIC: &[u8; 4] = b"IS10";

/// Song header, channel table and order list
const HEADER_SIZE: usize = 0x40 + IMF_CHANNELS * 16 + MAX_ORDERS;

const IMF_CHANNELS: usize = 32;
const MAX_ORDERS: usize = 256;
const MAX_PATTERNS: usize = 256;
const MAX_INSTRUMENTS: usize = 255;
const MAX_ROWS: usize = 256;
const ENVELOPE_POINTS: usize = 16;

/// Order list value for a skipped entry
const ORDER_SKIP: u8 = 0xFF;

/// Note value for note-off
const NOTE_OFF: u8 = 0xA0;

/// Channel status values
const STATUS_ENABLED: u8 = 0;
const STATUS_MUTED: u8 = 1;
const STATUS_DISABLED: u8 = 2;

#[derive(Debug, Clone, Copy)]
struct ImfChannel {
    pan: u8,
    status: u8,
}

#[derive(Debug, Clone)]
struct ImfHeader {
    song_name: String,
    ord_num: u16,
    pat_num: u16,
    ins_num: u16,
    flags: u16,
    tempo: u8,
    bpm: u8,
    master: u8,
    channels: [ImfChannel; IMF_CHANNELS],
    orders: [u8; MAX_ORDERS],
}

fn read_header(s: &mut ModuleStream) -> Result<ImfHeader, UniError> {
    let song_name = s.read_string(32)?;
    let ord_num = s.read_u16_le()?;
    let pat_num = s.read_u16_le()?;
    let ins_num = s.read_u16_le()?;
    let flags = s.read_u16_le()?;
    s.skip(8)?;
    let tempo = s.read_u8()?;
    let bpm = s.read_u8()?;
    let master = s.read_u8()?;
    // Amplification, reserved, "IM10"
    s.skip(1 + 8 + 4)?;

    let mut channels = [ImfChannel { pan: 0, status: 0 }; IMF_CHANNELS];
    for c in channels.iter_mut() {
        // Name, chorus, reverb
        s.skip(12 + 2)?;
        c.pan = s.read_u8()?;
        c.status = s.read_u8()?;
    }
    let orders = s.read_array()?;
    Ok(ImfHeader {
        song_name,
        ord_num,
        pat_num,
        ins_num,
        flags,
        tempo,
        bpm,
        master,
        channels,
        orders,
    })
}

/// Imago Orpheus reports a 16-channel song as "channel 1 on, 2-16 muted"; treat that
/// layout as all 16 channels enabled. Returns whether the fix was applied.
fn fix_channel_status(channels: &mut [ImfChannel; IMF_CHANNELS]) -> bool {
    let bugged = channels[0].status == STATUS_ENABLED
        && channels[1..16].iter().all(|c| c.status == STATUS_MUTED);
    if bugged {
        for c in &mut channels[1..16] {
            c.status = STATUS_ENABLED;
        }
    }
    bugged
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct ImfNote {
    note: Option<u8>,
    ins: u8,
    eff1: u8,
    dat1: u8,
    eff2: u8,
    dat2: u8,
}

/// Decode `rows` rows into `buf` (channel-major)
fn read_pattern(
    s: &mut ModuleStream,
    remap: &ChannelRemap,
    rows: usize,
    buf: &mut [ImfNote],
) -> Result<(), UniError> {
    let mut row = 0;
    while row < rows {
        let flag = s.read_u8()?;
        if flag == 0 {
            row += 1;
            continue;
        }
        let mut n = ImfNote::default();
        if flag & 0x20 != 0 {
            n.note = Some(s.read_u8()?.min(NOTE_OFF));
            n.ins = s.read_u8()?;
        }
        if flag & 0x40 != 0 {
            n.eff2 = s.read_u8()?;
            n.dat2 = s.read_u8()?;
        }
        if flag & 0x80 != 0 {
            n.eff1 = s.read_u8()?;
            n.dat1 = s.read_u8()?;
        }
        if let Some(ch) = remap.get((flag & 0x1F) as usize) {
            buf[ch * rows + row] = n;
        }
    }
    Ok(())
}

fn process_cmd(w: &mut UniWriter, eff: u8, inf: u8, flags: ModuleFlags) {
    let lo = inf & 0x0F;
    match eff {
        0x01 => w.effect(opcodes::S3MEFFECTA, inf as u16),
        0x02 => {
            if inf >= 0x20 {
                w.effect(opcodes::S3MEFFECTT, inf as u16);
            }
        }
        0x03 => w.effect(opcodes::ITEFFECTG, inf as u16),
        0x04 => {
            w.effect(opcodes::ITEFFECTG, inf as u16);
            w.effect(opcodes::S3MEFFECTD, 0);
        }
        0x05 => w.effect(opcodes::XMEFFECT4, inf as u16),
        0x06 => w.effect(opcodes::XMEFFECT6, inf as u16),
        0x07 => w.effect(opcodes::ITEFFECTU, inf as u16),
        0x08 => w.effect(opcodes::S3MEFFECTR, inf as u16),
        0x09 => w.pt_effect(0x0, inf, flags),
        0x0A => w.pt_effect(0x8, if inf >= 128 { 255 } else { inf << 1 }, flags),
        0x0B => w.effect(opcodes::XMEFFECTP, inf as u16),
        0x0C => {
            if inf <= 64 {
                w.pt_effect(0xC, inf, flags);
            }
        }
        0x0D => w.effect(opcodes::S3MEFFECTD, inf as u16),
        // Fine volume slide
        0x0E => {
            let param = match inf {
                0 => 0,
                _ if inf >> 4 != 0 => 0x0F | inf,
                _ => 0xF0 | inf,
            };
            w.effect(opcodes::S3MEFFECTD, param as u16);
        }
        0x0F => w.pt_effect(0xE, 0x50 | (inf >> 4), flags),
        0x12 => w.effect(opcodes::S3MEFFECTF, inf as u16),
        0x13 => w.effect(opcodes::S3MEFFECTE, inf as u16),
        // Fine and extra fine slides
        0x14 | 0x15 => {
            let opcode = if eff == 0x14 {
                opcodes::S3MEFFECTF
            } else {
                opcodes::S3MEFFECTE
            };
            let param = match inf {
                0 => 0,
                0x01..0x40 => 0xE0 | (inf >> 2),
                _ => 0xF0 | (inf >> 4),
            };
            w.effect(opcode, param as u16);
        }
        0x16 => w.effect(opcodes::ITEFFECTS0, (0xC0 | lo) as u16),
        0x17 => w.effect(opcodes::ITEFFECTS0, (0xD0 | lo) as u16),
        0x18 => w.pt_effect(0x9, inf, flags),
        0x1A => w.key_off(),
        0x1B => w.effect(opcodes::S3MEFFECTQ, inf as u16),
        0x1C => w.effect(opcodes::S3MEFFECTI, inf as u16),
        0x1D => w.pt_effect(0xB, inf, flags),
        0x1E => w.pt_effect(0xD, (inf >> 4) * 10 + lo, flags),
        0x1F => {
            if inf <= 64 {
                w.effect(opcodes::XMEFFECTG, (inf as u16) << 1);
            }
        }
        0x20 => w.effect(opcodes::XMEFFECTH, inf as u16),
        0x21 => match inf >> 4 {
            0x5 => w.effect(opcodes::ITEFFECTS0, (0x30 | lo) as u16),
            0x8 => w.effect(opcodes::ITEFFECTS0, (0x40 | lo) as u16),
            0xA => w.pt_effect(0xE, 0x60 | lo, flags),
            0xB => w.pt_effect(0xE, 0xE0 | lo, flags),
            0x3 | 0xC | 0xD | 0xE | 0xF => w.pt_effect(0xE, inf, flags),
            _ => {}
        },
        _ => {}
    }
}

fn convert_track(
    w: &mut UniWriter,
    cells: &[ImfNote],
    flags: ModuleFlags,
) -> Result<Arc<[u8]>, UniError> {
    w.reset();
    for &cell in cells {
        let mut n = cell;
        if n.ins != 0 && n.ins != 255 {
            w.instrument(n.ins - 1);
        }
        match n.note {
            Some(NOTE_OFF) => {
                w.pt_effect(0xC, 0, flags);
                // Volume commands would undo the cut
                if n.eff1 == 0x0C {
                    n.eff1 = 0;
                }
                if n.eff2 == 0x0C {
                    n.eff2 = 0;
                }
            }
            Some(note) => {
                let note = (note >> 4) * OCTAVE + (note & 0x0F);
                if (note as usize) < NUM_NOTES {
                    w.note(note);
                }
            }
            None => {}
        }
        process_cmd(w, n.eff1, n.dat1, flags);
        process_cmd(w, n.eff2, n.dat2, flags);
        w.new_row();
    }
    w.finalize()
}

#[derive(Debug, Clone, Copy, Default)]
struct EnvelopeInfo {
    points: u8,
    sustain: u8,
    loop_start: u8,
    loop_end: u8,
    flags: u8,
}

fn build_envelope(nodes: &[u16], info: EnvelopeInfo) -> Envelope {
    let count = (info.points as usize).min(ENVELOPE_POINTS);
    let mut flags = EnvelopeFlags::empty();
    if info.flags & 0x01 != 0 && count > 0 {
        flags |= EnvelopeFlags::ON;
    }
    if info.flags & 0x02 != 0 {
        flags |= EnvelopeFlags::SUSTAIN;
    }
    if info.flags & 0x04 != 0 {
        flags |= EnvelopeFlags::LOOP;
    }
    let mut env = Envelope {
        flags,
        points: nodes
            .chunks_exact(2)
            .take(count)
            .map(|p| EnvelopePoint {
                pos: p[0].min(i16::MAX as u16) as i16,
                val: p[1].min(i16::MAX as u16) as i16,
            })
            .collect(),
        sus_begin: info.sustain,
        sus_end: info.sustain,
        loop_begin: info.loop_start,
        loop_end: info.loop_end,
    };
    env.clamp_markers();
    env
}

/// Read one instrument and its sample headers; `first_sample` is the global index of
/// the instrument's first sample
fn read_instrument(
    s: &mut ModuleStream,
    index: usize,
    first_sample: usize,
    samples: &mut Vec<Sample>,
) -> Result<Instrument, LoadError> {
    let section = "instrument";
    let name = s.read_string(32).section(section)?;
    let map = s.read_array::<NUM_NOTES>().section(section)?;
    s.skip(8).section(section)?;
    let vol_nodes = s.read_u16_le_vec(ENVELOPE_POINTS * 2).section(section)?;
    let pan_nodes = s.read_u16_le_vec(ENVELOPE_POINTS * 2).section(section)?;
    // Pitch envelope
    s.skip(ENVELOPE_POINTS as u64 * 4).section(section)?;
    let mut infos = [EnvelopeInfo::default(); 3];
    for info in infos.iter_mut() {
        let raw = s.read_array::<8>().section(section)?;
        *info = EnvelopeInfo {
            points: raw[0],
            sustain: raw[1],
            loop_start: raw[2],
            loop_end: raw[3],
            flags: raw[4],
        };
    }
    let fadeout = s.read_u16_le().section(section)?;
    let num_smp = s.read_u16_le().section(section)? as usize;
    let tag = s.read_array::<4>().section(section)?;
    if &tag != INSTRUMENT_MAGIC {
        return Err(LoadError::Instrument {
            index,
            reason: "missing II10 tag".to_string(),
        });
    }

    let mut d = Instrument {
        name,
        volume_fade: fadeout,
        volume_envelope: build_envelope(&vol_nodes, infos[0]),
        panning_envelope: build_envelope(&pan_nodes, infos[1]),
        ..Instrument::default()
    };
    for (slot, &smp) in d.sample_number.iter_mut().zip(map.iter()) {
        if (smp as usize) < num_smp {
            *slot = (first_sample + smp as usize) as u16;
        }
    }

    for i in 0..num_smp {
        samples.push(read_sample(s).map_err(|e| match e {
            UniError::EndOfStream | UniError::SeekOutOfRange(_) => LoadError::Truncated("sample"),
            UniError::InvalidModule(reason) => LoadError::Sample {
                index: first_sample + i,
                reason,
            },
            other => LoadError::Unimod(other),
        })?);
    }
    Ok(d)
}

fn read_sample(s: &mut ModuleStream) -> Result<Sample, UniError> {
    let name = s.read_string(13)?;
    s.skip(3)?;
    let length = s.read_u32_le()?;
    let loop_start = s.read_u32_le()?;
    let loop_end = s.read_u32_le()?;
    let rate = s.read_u32_le()?;
    let volume = s.read_u8()?;
    let pan = s.read_u8()?;
    s.skip(14)?;
    let flags = s.read_u8()?;
    // Reserved, EMS/DRAM handles
    s.skip(5 + 2 + 4)?;
    if &s.read_array::<4>()? != SAMPLE_MAGIC {
        return Err(UniError::InvalidModule("missing IS10 tag".to_string()));
    }

    let mut q = Sample {
        name,
        speed: rate,
        length,
        loop_start,
        loop_end,
        volume: volume.min(64),
        panning: pan as u16,
        flags: SampleFlags::SIGNED,
        seek_pos: s.pos(),
        ..Sample::default()
    };
    s.skip(length as u64)?;

    if flags & 0x01 != 0 {
        q.flags |= SampleFlags::LOOP;
    }
    if flags & 0x02 != 0 {
        q.flags |= SampleFlags::BIDI;
    }
    if flags & 0x04 != 0 {
        q.flags |= SampleFlags::BITS16;
        q.length >>= 1;
        q.loop_start >>= 1;
        q.loop_end >>= 1;
    }
    if flags & 0x08 != 0 {
        q.flags |= SampleFlags::OWNPAN;
    }
    q.fix_loop();
    Ok(q)
}

/// Imago Orpheus loader
#[derive(Debug, Default, Clone, Copy)]
pub struct ImfLoader;

impl ModuleLoader for ImfLoader {
    fn name(&self) -> &'static str {
        "IMF"
    }

    fn description(&self) -> &'static str {
        "Imago Orpheus"
    }

    fn identify(&self, data: &[u8]) -> bool {
        data.len() >= HEADER_SIZE && &data[MAGIC_OFFSET..MAGIC_OFFSET + 4] == IMF_MAGIC
    }

    fn load(&self, data: &[u8], options: &LoadOptions) -> Result<Module, LoadError> {
        if !self.identify(data) {
            return Err(LoadError::Unknown);
        }
        let mut s = open_stream(data, options);
        let mut h = read_header(&mut s).section("header")?;

        if h.ord_num as usize > MAX_ORDERS {
            return Err(LoadError::limit("orders", h.ord_num as usize, MAX_ORDERS));
        }
        if h.pat_num as usize > MAX_PATTERNS {
            return Err(LoadError::limit("patterns", h.pat_num as usize, MAX_PATTERNS));
        }
        if h.ins_num as usize > MAX_INSTRUMENTS {
            return Err(LoadError::limit(
                "instruments",
                h.ins_num as usize,
                MAX_INSTRUMENTS,
            ));
        }

        if fix_channel_status(&mut h.channels) {
            warn!("IMF: only channel 1 enabled with 2-16 muted, enabling 16 channels");
        }
        let mut remap = ChannelRemap::new();
        for (ch, c) in h.channels.iter().enumerate() {
            if c.status != STATUS_DISABLED {
                remap.mark(ch);
            }
        }
        let num_chn = remap.build();
        if num_chn == 0 {
            return Err(LoadError::header("no channels enabled"));
        }
        if num_chn > options.channel_limit(IMF_CHANNELS) {
            return Err(LoadError::limit("channels", num_chn, options.max_channels));
        }

        let mut flags = ModuleFlags::INST | ModuleFlags::ARPMEM | ModuleFlags::PANNING;
        if h.flags & 1 != 0 {
            flags |= ModuleFlags::LINEAR;
        }

        let mut positions = Vec::with_capacity(h.ord_num as usize);
        for &o in &h.orders[..h.ord_num as usize] {
            if o == ORDER_SKIP {
                continue;
            }
            if o as u16 >= h.pat_num {
                warn!("IMF: order refers to missing pattern {o}");
                continue;
            }
            positions.push(o as u16);
        }

        // Patterns come first in the file; keep the converted tracks until the
        // samples are known
        let mut w = new_writer(options);
        let mut patterns = Vec::with_capacity(h.pat_num as usize);
        let mut buf = Vec::new();
        for pat in 0..h.pat_num as usize {
            let size = s.read_u16_le().section("pattern")? as usize;
            let rows = s.read_u16_le().section("pattern")? as usize;
            if rows == 0 || rows > MAX_ROWS || size < 4 {
                return Err(LoadError::pattern(
                    pat,
                    format!("{rows} rows in {size} bytes"),
                ));
            }
            let mut p = ModuleStream::new(s.read_slice(size - 4).section("pattern")?);
            buf.clear();
            buf.resize(rows * num_chn, ImfNote::default());
            read_pattern(&mut p, &remap, rows, &mut buf).section("pattern")?;
            let tracks = buf
                .chunks_exact(rows)
                .map(|cells| convert_track(&mut w, cells, flags))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| LoadError::pattern(pat, e.to_string()))?;
            patterns.push((rows as u16, tracks));
        }

        let mut instruments = Vec::with_capacity(h.ins_num as usize);
        let mut samples = Vec::new();
        for i in 0..h.ins_num as usize {
            let first = samples.len();
            instruments.push(read_instrument(&mut s, i, first, &mut samples)?);
        }
        if samples.len() > u16::MAX as usize {
            return Err(LoadError::limit("samples", samples.len(), u16::MAX as usize));
        }

        let mut m = Module::new();
        m.song_name = h.song_name.clone();
        m.mod_type = "Imago Orpheus".to_string();
        m.flags = flags;
        m.num_chn = num_chn as u16;
        m.init_speed = h.tempo.max(1);
        m.init_tempo = h.bpm as u16;
        m.init_volume = (h.master as u16 * 2).min(128) as u8;
        m.bpm_limit = 32;
        for (src, dst) in remap.iter() {
            let c = h.channels[src];
            m.panning[dst] = c.pan as u16;
            m.chan_vol[dst] = if c.status == STATUS_MUTED { 0 } else { 64 };
        }

        m.alloc_positions(positions.len())?;
        m.positions.copy_from_slice(&positions);

        m.num_smp = samples.len() as u16;
        m.alloc_samples()?;
        m.samples = samples;

        m.num_pat = h.pat_num;
        m.alloc_patterns()?;
        m.alloc_tracks()?;
        for (pat, (rows, tracks)) in patterns.into_iter().enumerate() {
            m.pattern_rows[pat] = rows;
            for (ch, track) in tracks.into_iter().enumerate() {
                m.tracks[pat * num_chn + ch] = Some(track);
            }
        }

        m.num_ins = h.ins_num;
        m.alloc_instruments()?;
        m.instruments = instruments;

        debug!(
            "IMF '{}': {} channels, {} patterns, {} instruments, {} samples",
            m.song_name, m.num_chn, m.num_pat, m.num_ins, m.num_smp
        );
        Ok(m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{Bytes, assert_rejects_truncated, row_events};
    use nether_unimod::track::Event;

    fn header(b: &mut Bytes, statuses: &[u8], orders: &[u8], patterns: u16) {
        b.str("imf song", 32);
        b.u16le(orders.len() as u16).u16le(patterns).u16le(1).u16le(1);
        b.zeros(8).u8(6).u8(125).u8(48).u8(48).zeros(8);
        b.bytes(IMF_MAGIC);
        for ch in 0..IMF_CHANNELS {
            let status = statuses.get(ch).copied().unwrap_or(STATUS_DISABLED);
            b.str("chan", 12).u8(0).u8(0).u8(ch as u8 * 16).u8(status);
        }
        let mut list = [0u8; MAX_ORDERS];
        list[..orders.len()].copy_from_slice(orders);
        b.bytes(&list);
        assert_eq!(b.len(), HEADER_SIZE);
    }

    fn instrument(b: &mut Bytes) {
        b.str("inst", 32).zeros(NUM_NOTES).zeros(8);
        // Volume envelope: (0, 64), (10, 0)
        b.u16le(0).u16le(64).u16le(10).u16le(0).zeros(ENVELOPE_POINTS * 4 - 8);
        b.zeros(ENVELOPE_POINTS * 4 * 2);
        b.bytes(&[2, 0, 0, 1, 0x01, 0, 0, 0]).zeros(16);
        b.u16le(256).u16le(1).bytes(INSTRUMENT_MAGIC);
        // 16-bit looping sample of 4 frames
        b.str("smp", 13).zeros(3).u32le(8).u32le(2).u32le(6).u32le(22050);
        b.u8(50).u8(0x80).zeros(14).u8(0x01 | 0x04).zeros(11);
        b.bytes(SAMPLE_MAGIC).zeros(8);
    }

    fn build_imf() -> Vec<u8> {
        let mut b = Bytes::new();
        // Channels 0, 1 (muted) and 3 in use
        header(
            &mut b,
            &[STATUS_ENABLED, STATUS_MUTED, STATUS_DISABLED, STATUS_ENABLED],
            &[0, ORDER_SKIP, 0],
            1,
        );
        let cells: &[u8] = &[
            // Row 0: channel 0 note C-4 ins 1; channel 3 speed; disabled channel 2 note
            0x20, 0x40, 1, 0x83, 0x01, 5, 0x22, 0x40, 1, 0,
            // Row 1: channel 1 fine volume slide and key off; channel 0 note off
            0xC1, 0x0E, 0x30, 0x1A, 0x00, 0x20, 0xA5, 0, 0,
        ];
        b.u16le(cells.len() as u16 + 4).u16le(2).bytes(cells);
        instrument(&mut b);
        b.build()
    }

    #[test]
    fn test_identify() {
        let data = build_imf();
        assert!(ImfLoader.identify(&data));
        assert_rejects_truncated(&ImfLoader, &data, HEADER_SIZE);
    }

    #[test]
    fn test_load() {
        let data = build_imf();
        let m = ImfLoader.load(&data, &LoadOptions::default()).unwrap();
        m.validate().unwrap();

        assert_eq!(m.song_name, "imf song");
        assert_eq!(m.num_chn, 3);
        assert_eq!(&m.chan_vol[..3], &[64, 0, 64]);
        assert_eq!(m.panning[2], 48);
        assert_eq!(m.positions, vec![0, 0]);
        assert_eq!(m.pattern_rows, vec![2]);
        assert!(m.flags.contains(ModuleFlags::LINEAR | ModuleFlags::INST));

        assert_eq!(
            row_events(&m, 0, 0, 0),
            vec![Event::Instrument(0), Event::Note(4 * OCTAVE)]
        );
        assert_eq!(
            row_events(&m, 0, 2, 0),
            vec![Event::Effect {
                opcode: opcodes::S3MEFFECTA,
                param: 5
            }]
        );
        assert_eq!(
            row_events(&m, 0, 1, 1),
            vec![
                Event::KeyOff,
                Event::Effect {
                    opcode: opcodes::S3MEFFECTD,
                    param: 0x3F
                },
            ]
        );
        assert_eq!(
            row_events(&m, 0, 0, 1),
            vec![Event::Effect {
                opcode: opcodes::PTEFFECTC,
                param: 0
            }]
        );

        let d = &m.instruments[0];
        assert_eq!(d.name, "inst");
        assert_eq!(d.sample_number[60], 0);
        assert_eq!(d.volume_fade, 256);
        assert!(d.volume_envelope.is_enabled());
        assert_eq!(d.volume_envelope.points[1], EnvelopePoint { pos: 10, val: 0 });
        assert_eq!(d.volume_envelope.loop_end, 1);

        let q = &m.samples[0];
        assert_eq!(q.name, "smp");
        assert_eq!(q.length, 4);
        assert_eq!((q.loop_start, q.loop_end), (1, 3));
        assert_eq!(q.speed, 22050);
        assert!(q.flags.contains(SampleFlags::BITS16 | SampleFlags::LOOP));
        assert_eq!(q.seek_pos, (data.len() - 8) as u64);
    }

    #[test]
    fn test_single_enabled_channel_quirk() {
        let mut channels = [ImfChannel {
            pan: 0,
            status: STATUS_DISABLED,
        }; IMF_CHANNELS];
        channels[0].status = STATUS_ENABLED;
        for c in &mut channels[1..16] {
            c.status = STATUS_MUTED;
        }
        assert!(fix_channel_status(&mut channels));
        assert!(channels[..16].iter().all(|c| c.status == STATUS_ENABLED));
        assert_eq!(channels[16].status, STATUS_DISABLED);

        // A genuinely muted channel elsewhere keeps the layout as is
        channels[5].status = STATUS_MUTED;
        channels[7].status = STATUS_DISABLED;
        assert!(!fix_channel_status(&mut channels));
        assert_eq!(channels[5].status, STATUS_MUTED);
    }

    #[test]
    fn test_quirk_applies_on_load() {
        let mut statuses = vec![STATUS_ENABLED];
        statuses.extend([STATUS_MUTED; 15]);
        let mut b = Bytes::new();
        header(&mut b, &statuses, &[0], 1);
        b.u16le(4 + 64).u16le(64).zeros(64);
        instrument(&mut b);
        let m = ImfLoader.load(&b.build(), &LoadOptions::default()).unwrap();
        assert_eq!(m.num_chn, 16);
        assert!(m.chan_vol[..16].iter().all(|&v| v == 64));
    }

    #[test]
    fn test_missing_instrument_tag() {
        let mut data = build_imf();
        let tag = data.len() - 8 - 64 - 4;
        data[tag] = b'X';
        assert!(matches!(
            ImfLoader.load(&data, &LoadOptions::default()),
            Err(LoadError::Instrument { index: 0, .. })
        ));
    }
}
