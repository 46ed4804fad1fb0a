//! Unified module (UNI) loader
//!
//! UNI files are dumps of the unified representation itself, so tracks are stored
//! already encoded. The catch is that the opcode numbering changed as effects were
//! added over the years; older files have their opcodes renumbered through
//! [`OPCODE_REMAPS`] before validation.
//!
//! | Tag | Revision | Byte order | Notes |
//! |-----|----------|------------|-------|
//! | `UN04`, `UN05` | 4, 5 | little | MikCvt; instruments own their samples |
//! | `UN06` | 6 | big | samples and instruments stored separately |
//! | `APUN` + u16 | 0x101-0x106 | big | revision follows the tag |

use std::ops::RangeInclusive;
use std::sync::Arc;

use nether_unimod::{
    DuplicateCheckAction, DuplicateCheckType, Envelope, EnvelopeFlags, EnvelopePoint,
    Instrument, InstrumentFlags, LAST_PATTERN, Module, ModuleFlags, ModuleStream,
    NUM_NOTES, NewNoteAction, Sample, SampleFlags, UniError, opcodes, track::validate_track,
};
use tracing::{debug, warn};

use crate::error::{Context, LoadError};
use crate::{LoadOptions, ModuleLoader, open_stream};

/// First APlayer revision; anything below is a MikCvt `UN0x` revision
const APLAYER: u16 = 0x100;

/// Notes covered by a revision 4/5 instrument sample map
const LEGACY_NOTES: usize = 96;

type Remap = fn(u8) -> Option<u8>;

/// Opcode renumbering steps, applied in order to every revision inside the range
///
/// Each APlayer revision inserted one opcode into the middle of the table, so a file
/// from revision `v` needs every later insertion undone.
const OPCODE_REMAPS: &[(RangeInclusive<u16>, Remap)] = &[
    (0..=5, remap_mikcvt),
    (6..=0x104, before_xmeffect6),
    (6..=0x102, before_iteffectt),
    (6..=0x101, before_iteffectz),
];

/// Revision 4/5 files know only 29 opcodes; the first 24 are unchanged
fn remap_mikcvt(op: u8) -> Option<u8> {
    match op {
        25 => Some(opcodes::S3MEFFECTT),
        26 => Some(opcodes::XMEFFECTA),
        27 => Some(opcodes::XMEFFECTG),
        28 => Some(opcodes::XMEFFECTH),
        29 => Some(opcodes::XMEFFECTP),
        30..=u8::MAX => None,
        _ => Some(op),
    }
}

fn shift_from(op: u8, inserted: u8) -> Option<u8> {
    if op >= inserted { op.checked_add(1) } else { Some(op) }
}

/// XMEFFECT6 arrived in 0x105
fn before_xmeffect6(op: u8) -> Option<u8> {
    shift_from(op, opcodes::XMEFFECT6)
}

/// ITEFFECTT arrived in 0x103
fn before_iteffectt(op: u8) -> Option<u8> {
    shift_from(op, opcodes::ITEFFECTT)
}

/// ITEFFECTZ arrived in 0x102
fn before_iteffectz(op: u8) -> Option<u8> {
    shift_from(op, opcodes::ITEFFECTZ)
}

/// Current opcode for `op` as stored by `version`, `None` if it has no equivalent
fn remap_opcode(op: u8, version: u16) -> Option<u8> {
    let op = OPCODE_REMAPS
        .iter()
        .filter(|(range, _)| range.contains(&version))
        .try_fold(op, |op, (_, remap)| remap(op))?;
    opcodes::operand_len(op).map(|_| op)
}

/// Renumber the opcodes of a stored track in place, then validate it
fn remap_track(track: &mut [u8], version: u16) -> Result<(), UniError> {
    let mut pos = 0;
    loop {
        let header = *track.get(pos).ok_or(UniError::Unterminated)?;
        if header == 0 {
            break;
        }
        let len = (header & 0x1F) as usize;
        if len == 0 {
            return Err(UniError::EmptyRow(pos));
        }
        let end = pos + len;
        if end > track.len() {
            return Err(UniError::Unterminated);
        }

        let mut p = pos + 1;
        while p < end {
            let raw = track[p];
            let opcode = remap_opcode(raw, version).ok_or(UniError::InvalidOpcode {
                opcode: raw,
                offset: p,
            })?;
            track[p] = opcode;
            p += 1 + opcodes::operand_len(opcode).unwrap_or(0);
        }
        pos = end;
    }
    validate_track(track).map(|_| ())
}

/// Parsed tag: revision number
fn parse_tag(data: &[u8]) -> Option<u16> {
    match data {
        [b'U', b'N', b'0', v @ b'4'..=b'6', ..] => Some((v - b'0') as u16),
        [b'A', b'P', b'U', b'N', 0x01, v @ 0x01..=0x06, ..] => Some(APLAYER | *v as u16),
        _ => None,
    }
}

/// 16-bit word in the revision's byte order
fn word(s: &mut ModuleStream, version: u16) -> Result<u16, UniError> {
    if version >= 6 {
        s.read_u16_be()
    } else {
        s.read_u16_le()
    }
}

/// Length-prefixed string; the length is little-endian in every revision
fn string(s: &mut ModuleStream) -> Result<String, UniError> {
    s.read_pstring_le()
}

#[derive(Debug, Default)]
struct Header {
    flags: ModuleFlags,
    num_chn: u16,
    num_pos: u16,
    rep_pos: u16,
    num_pat: u16,
    num_trk: u16,
    num_ins: u16,
    num_smp: u16,
    init_speed: u8,
    init_tempo: u8,
    init_volume: Option<u8>,
    bpm_limit: u16,
    /// Revision 4/5 keep order and panning tables in the header
    positions: Vec<u8>,
    panning: Vec<u8>,
}

fn read_header(s: &mut ModuleStream, version: &mut u16) -> Result<Header, UniError> {
    s.seek_to(4)?;
    let mut h = Header::default();

    if *version >= 6 {
        if *version == 6 {
            s.skip(1)?;
        } else {
            *version = s.read_u16_be()?;
        }
        let flags = s.read_u16_be()?;
        h.num_chn = s.read_u8()? as u16;
        // Voice count
        s.skip(1)?;
        h.num_pos = s.read_u16_be()?;
        h.num_pat = s.read_u16_be()?;
        h.num_trk = s.read_u16_be()?;
        h.num_ins = s.read_u16_be()?;
        h.num_smp = s.read_u16_be()?;
        h.rep_pos = s.read_u16_be()?;
        h.init_speed = s.read_u8()?;
        h.init_tempo = s.read_u8()?;
        h.init_volume = Some(s.read_u8()?);
        h.bpm_limit = if *version >= 0x106 { s.read_u16_be()? } else { 32 };

        h.flags = ModuleFlags::from_bits_truncate(flags)
            & (ModuleFlags::XMPERIODS | ModuleFlags::LINEAR | ModuleFlags::INST | ModuleFlags::NNA);
        h.flags |= ModuleFlags::PANNING;
    } else {
        h.num_chn = s.read_u8()? as u16;
        h.num_pos = s.read_u16_le()?;
        h.rep_pos = if *version == 5 { s.read_u16_le()? } else { 0 };
        h.num_pat = s.read_u16_le()?;
        h.num_trk = s.read_u16_le()?;
        h.num_ins = s.read_u16_le()?;
        h.init_speed = s.read_u8()?;
        h.init_tempo = s.read_u8()?;
        h.positions = s.read_slice(256)?.to_vec();
        h.panning = s.read_slice(32)?.to_vec();
        let flags = s.read_u8()? as u16;
        h.bpm_limit = 32;

        h.flags = ModuleFlags::from_bits_truncate(flags)
            & (ModuleFlags::XMPERIODS | ModuleFlags::LINEAR);
        h.flags |= ModuleFlags::INST | ModuleFlags::NOWRAP | ModuleFlags::PANNING;
    }
    Ok(h)
}

/// Sample flag bits by revision, beyond the shared 16-bit/signed/stereo bits
fn sample_flag_table(version: u16) -> &'static [(u16, SampleFlags)] {
    if version >= 0x104 {
        &[
            (0x1000, SampleFlags::OWNPAN),
            (0x0800, SampleFlags::SUSTAIN),
            (0x0400, SampleFlags::REVERSE),
            (0x0200, SampleFlags::BIDI),
            (0x0100, SampleFlags::LOOP),
            (0x0020, SampleFlags::ITPACKED),
            (0x0010, SampleFlags::DELTA),
            (0x0008, SampleFlags::BIG_ENDIAN),
        ]
    } else if version >= 0x102 {
        &[
            (0x0400, SampleFlags::OWNPAN),
            (0x0200, SampleFlags::SUSTAIN),
            (0x0100, SampleFlags::REVERSE),
            (0x0080, SampleFlags::BIDI),
            (0x0040, SampleFlags::LOOP),
            (0x0020, SampleFlags::ITPACKED),
            (0x0010, SampleFlags::DELTA),
            (0x0008, SampleFlags::BIG_ENDIAN),
        ]
    } else {
        &[
            (0x0200, SampleFlags::OWNPAN),
            (0x0100, SampleFlags::REVERSE),
            (0x0080, SampleFlags::SUSTAIN),
            (0x0040, SampleFlags::BIDI),
            (0x0020, SampleFlags::LOOP),
            (0x0010, SampleFlags::BIG_ENDIAN),
            (0x0008, SampleFlags::DELTA),
        ]
    }
}

fn convert_sample_flags(bits: u16, version: u16) -> SampleFlags {
    let mut flags = SampleFlags::empty();
    for (bit, flag) in [
        (0x0004, SampleFlags::STEREO),
        (0x0002, SampleFlags::SIGNED),
        (0x0001, SampleFlags::BITS16),
    ]
    .iter()
    .chain(sample_flag_table(version))
    {
        if bits & bit != 0 {
            flags |= *flag;
        }
    }
    flags
}

fn read_sample(s: &mut ModuleStream, version: u16) -> Result<Sample, UniError> {
    let flags = s.read_u16_be()?;
    let mut q = Sample {
        flags: convert_sample_flags(flags, version),
        speed: s.read_u32_be()?,
        volume: s.read_u8()?.min(64),
        panning: s.read_u16_be()?,
        length: s.read_u32_be()?,
        loop_start: s.read_u32_be()?,
        loop_end: s.read_u32_be()?,
        sus_begin: s.read_u32_be()?,
        sus_end: s.read_u32_be()?,
        global_volume: s.read_u8()?.min(64),
        ..Sample::default()
    };
    // Vibrato flags
    s.skip(1)?;
    q.vib_type = s.read_u8()?;
    q.vib_sweep = s.read_u8()?;
    q.vib_depth = s.read_u8()?;
    q.vib_rate = s.read_u8()?;
    q.name = string(s)?;
    q.fix_loop();
    Ok(q)
}

fn read_envelope(
    s: &mut ModuleStream,
    version: u16,
    index: usize,
) -> Result<Envelope, LoadError> {
    let flags = s.read_u8().section("envelope")?;
    let count = s.read_u8().section("envelope")? as usize;
    let mut env = Envelope {
        flags: EnvelopeFlags::from_bits_truncate(flags),
        ..Envelope::default()
    };

    // Revision 4/5 envelopes have a single sustain point and 12 stored nodes
    let stored = if version >= 6 {
        env.sus_begin = s.read_u8().section("envelope")?;
        env.sus_end = s.read_u8().section("envelope")?;
        if version >= APLAYER { 32 } else { count }
    } else {
        env.sus_begin = s.read_u8().section("envelope")?;
        env.sus_end = env.sus_begin;
        12
    };
    env.loop_begin = s.read_u8().section("envelope")?;
    env.loop_end = s.read_u8().section("envelope")?;
    let limit = if version >= 6 { 32 } else { 12 };
    if count > limit {
        return Err(LoadError::Instrument {
            index,
            reason: format!("{count} envelope points"),
        });
    }

    for i in 0..stored {
        let (pos, val) = if version >= 6 {
            (s.read_i16_be(), s.read_i16_be())
        } else {
            (s.read_i16_le(), s.read_i16_le())
        };
        let point = EnvelopePoint {
            pos: pos.section("envelope")?,
            val: val.section("envelope")?,
        };
        if i < count {
            env.points.push(point);
        }
    }
    env.clamp_markers();
    Ok(env)
}

fn read_instrument(
    s: &mut ModuleStream,
    version: u16,
    index: usize,
) -> Result<Instrument, LoadError> {
    let mut ins = Instrument {
        flags: InstrumentFlags::from_bits_truncate(s.read_u8().section("instrument")?),
        nna: NewNoteAction::from_u8(s.read_u8().section("instrument")?),
        dca: DuplicateCheckAction::from_u8(s.read_u8().section("instrument")?),
        dct: DuplicateCheckType::from_u8(s.read_u8().section("instrument")?),
        global_volume: s.read_u8().section("instrument")?,
        panning: s.read_u16_be().section("instrument")?,
        pitch_pan_separation: s.read_i8().section("instrument")?,
        pitch_pan_center: s.read_u8().section("instrument")?,
        random_volume: s.read_u8().section("instrument")?,
        random_panning: s.read_u8().section("instrument")?,
        volume_fade: s.read_u16_be().section("instrument")?,
        ..Instrument::default()
    };
    ins.volume_envelope = read_envelope(s, version, index)?;
    ins.panning_envelope = read_envelope(s, version, index)?;
    ins.pitch_envelope = read_envelope(s, version, index)?;

    if version >= 0x103 {
        let map = s.read_u16_be_vec(NUM_NOTES).section("instrument")?;
        ins.sample_number.copy_from_slice(&map);
    } else {
        let map = s.read_slice(NUM_NOTES).section("instrument")?;
        for (dst, &b) in ins.sample_number.iter_mut().zip(map) {
            *dst = if b == 0xFF { u16::MAX } else { b as u16 };
        }
    }
    let notes = s.read_slice(NUM_NOTES).section("instrument")?;
    ins.sample_note.copy_from_slice(notes);
    ins.name = string(s).section("instrument")?;
    Ok(ins)
}

/// Revision 4/5 instrument with its embedded samples
struct LegacyInstrument {
    instrument: Instrument,
    samples: Vec<(Sample, i8)>,
}

fn convert_legacy_sample_flags(bits: u16) -> SampleFlags {
    let mut flags = SampleFlags::empty();
    for (bit, flag) in [
        (0x80, SampleFlags::REVERSE),
        (0x40, SampleFlags::SUSTAIN),
        (0x20, SampleFlags::BIDI),
        (0x10, SampleFlags::LOOP),
        (0x08, SampleFlags::BIG_ENDIAN),
        (0x04, SampleFlags::DELTA),
        (0x02, SampleFlags::SIGNED),
        (0x01, SampleFlags::BITS16),
    ] {
        if bits & bit != 0 {
            flags |= flag;
        }
    }
    flags
}

fn read_legacy_instrument(
    s: &mut ModuleStream,
    version: u16,
    index: usize,
    first_sample: usize,
) -> Result<LegacyInstrument, LoadError> {
    let num_smp = s.read_u8().section("instrument")? as usize;
    let map = s.read_slice(LEGACY_NOTES).section("instrument")?;
    let mut ins = Instrument::default();
    for (dst, &b) in ins.sample_number.iter_mut().zip(map) {
        *dst = (first_sample + b as usize) as u16;
    }
    ins.volume_envelope = read_envelope(s, version, index)?;
    ins.panning_envelope = read_envelope(s, version, index)?;

    let vib: [u8; 4] = s.read_array().section("instrument")?;
    ins.volume_fade = s.read_u16_le().section("instrument")?;
    ins.name = string(s).section("instrument")?;

    let mut samples = Vec::with_capacity(num_smp);
    for _ in 0..num_smp {
        let speed = s.read_u16_le().section("sample header")? as u32;
        let transpose = s.read_i8().section("sample header")?;
        let mut q = Sample {
            speed,
            volume: s.read_u8().section("sample header")?.min(64),
            panning: s.read_u8().section("sample header")? as u16,
            length: s.read_u32_le().section("sample header")?,
            loop_start: s.read_u32_le().section("sample header")?,
            loop_end: s.read_u32_le().section("sample header")?,
            flags: convert_legacy_sample_flags(s.read_u16_le().section("sample header")?),
            vib_type: vib[0],
            vib_sweep: vib[1],
            vib_depth: vib[2],
            vib_rate: vib[3],
            ..Sample::default()
        };
        q.name = string(s).section("sample header")?;
        q.fix_loop();
        samples.push((q, transpose));
    }
    Ok(LegacyInstrument {
        instrument: ins,
        samples,
    })
}

/// Whether every instrument just plays the sample of the same number untransposed
fn is_sample_only(instruments: &[Instrument]) -> bool {
    instruments.iter().enumerate().all(|(i, ins)| {
        (0..LEGACY_NOTES)
            .all(|n| ins.sample_number[n] as usize == i && ins.sample_note[n] as usize == n)
    })
}

/// Unified module loader
#[derive(Debug, Default, Clone, Copy)]
pub struct UniLoader;

impl ModuleLoader for UniLoader {
    fn name(&self) -> &'static str {
        "UNI"
    }

    fn description(&self) -> &'static str {
        "MikMod/APlayer unified module"
    }

    fn identify(&self, data: &[u8]) -> bool {
        parse_tag(data).is_some()
    }

    fn load(&self, data: &[u8], options: &LoadOptions) -> Result<Module, LoadError> {
        let mut version = parse_tag(data).ok_or(LoadError::Unknown)?;
        let mut s = open_stream(data, options);
        let h = read_header(&mut s, &mut version).section("header")?;
        debug!("UNI: revision {version:#x}");

        let max_chn = options.channel_limit(if version >= 6 { 64 } else { 32 });
        if h.num_chn as usize > max_chn {
            return Err(LoadError::limit("channels", h.num_chn as usize, max_chn));
        }
        if version < 6 && h.num_pos > 256 {
            return Err(LoadError::limit("positions", h.num_pos as usize, 256));
        }

        let mut m = Module::new();
        m.flags = h.flags;
        m.num_chn = h.num_chn;
        m.num_pat = h.num_pat;
        m.num_ins = h.num_ins;
        m.rep_pos = h.rep_pos;
        m.init_speed = h.init_speed;
        m.init_tempo = h.init_tempo as u16;
        if let Some(volume) = h.init_volume {
            m.init_volume = volume;
        }
        m.bpm_limit = if h.bpm_limit != 0 { h.bpm_limit } else { 32 };

        m.song_name = string(&mut s).section("header")?;
        let old_type = if version < 0x102 {
            string(&mut s).section("header")?
        } else {
            String::new()
        };
        m.mod_type = match (version >= APLAYER, old_type.is_empty()) {
            (true, true) => "APlayer".to_string(),
            (true, false) => format!("APlayer (was {old_type})"),
            (false, true) => "MikCvt3".to_string(),
            (false, false) => format!("MikCvt2 (was {old_type})"),
        };
        m.comment = string(&mut s).section("header")?;

        m.alloc_positions(h.num_pos as usize)?;
        let num_chn = m.num_chn as usize;
        if version >= 6 {
            if version >= APLAYER {
                let positions = s.read_u16_be_vec(m.positions.len()).section("orders")?;
                m.positions.copy_from_slice(&positions);
            } else {
                let positions = s.read_slice(m.positions.len()).section("orders")?;
                for (dst, &p) in m.positions.iter_mut().zip(positions) {
                    *dst = p as u16;
                }
            }
            let panning = s.read_u16_be_vec(num_chn).section("panning")?;
            m.panning[..num_chn].copy_from_slice(&panning);
            let volumes = s.read_slice(num_chn).section("panning")?;
            m.chan_vol[..num_chn].copy_from_slice(volumes);
        } else {
            for (dst, &p) in m.positions.iter_mut().zip(&h.positions) {
                *dst = p as u16;
            }
            for (dst, &p) in m.panning.iter_mut().zip(&h.panning[..num_chn]) {
                *dst = p as u16;
            }
        }
        if version < 0x106 {
            for p in m.positions.iter_mut().filter(|p| **p == 0xFF) {
                *p = LAST_PATTERN;
            }
        }
        if let Some(&bad) = m
            .positions
            .iter()
            .find(|&&p| p != LAST_PATTERN && p >= m.num_pat)
        {
            return Err(LoadError::header(format!("order refers to missing pattern {bad}")));
        }

        let instruments = if version >= 6 {
            m.num_smp = h.num_smp;
            m.alloc_samples()?;
            for q in &mut m.samples {
                *q = read_sample(&mut s, version).section("sample header")?;
            }
            let mut instruments = Vec::new();
            if m.flags.contains(ModuleFlags::INST) {
                for i in 0..m.num_ins as usize {
                    instruments.push(read_instrument(&mut s, version, i)?);
                }
            }
            instruments
        } else {
            let mut instruments = Vec::with_capacity(m.num_ins as usize);
            let mut samples = Vec::new();
            for i in 0..m.num_ins as usize {
                let legacy = read_legacy_instrument(&mut s, version, i, samples.len())?;
                instruments.push(legacy.instrument);
                samples.extend(legacy.samples);
            }
            if samples.is_empty() {
                return Err(LoadError::header("module has no samples"));
            }
            if samples.len() > u16::MAX as usize {
                return Err(LoadError::limit("samples", samples.len(), u16::MAX as usize));
            }

            // Bake each sample's transpose into the note maps
            for ins in &mut instruments {
                for (n, (&smp, note)) in ins
                    .sample_number
                    .iter()
                    .zip(ins.sample_note.iter_mut())
                    .enumerate()
                {
                    *note = match samples.get(smp as usize) {
                        Some((_, transpose)) => {
                            (n as i32 + *transpose as i32).clamp(0, NUM_NOTES as i32 - 1) as u8
                        }
                        None => 0xFF,
                    };
                }
            }

            m.num_smp = samples.len() as u16;
            m.alloc_samples()?;
            for (dst, (q, _)) in m.samples.iter_mut().zip(samples) {
                *dst = q;
            }

            if m.num_smp == m.num_ins && is_sample_only(&instruments) {
                debug!("UNI: instruments map samples one to one, dropping them");
                m.flags.remove(ModuleFlags::INST | ModuleFlags::NOWRAP);
                m.num_ins = 0;
                instruments.clear();
            }
            instruments
        };

        m.alloc_patterns()?;
        let num_pat = m.num_pat as usize;
        let (rows, patterns) = if version >= 6 {
            (
                s.read_u16_be_vec(num_pat).section("patterns")?,
                s.read_u16_be_vec(num_pat * num_chn).section("patterns")?,
            )
        } else {
            (
                s.read_u16_le_vec(num_pat).section("patterns")?,
                s.read_u16_le_vec(num_pat * num_chn).section("patterns")?,
            )
        };
        m.pattern_rows.copy_from_slice(&rows);
        if let Some(&t) = patterns.iter().find(|&&t| t >= h.num_trk) {
            return Err(LoadError::header(format!(
                "pattern refers to track {t} of {}",
                h.num_trk
            )));
        }
        for (dst, &t) in m.patterns.iter_mut().zip(&patterns) {
            *dst = t as u32;
        }

        // Stored tracks are shared between patterns; pad the table so every
        // pattern/channel slot could still own a track
        m.num_trk = (h.num_trk as u32).max((num_pat * num_chn) as u32);
        m.alloc_tracks()?;
        for t in 0..h.num_trk as usize {
            let len = word(&mut s, version).section("track")? as usize;
            if len == 0 {
                continue;
            }
            let mut track = s.read_slice(len).section("track")?.to_vec();
            remap_track(&mut track, version)?;
            m.tracks[t] = Some(Arc::from(track));
        }

        // Sample data follows the tracks back to back; packed sizes are unknown up front
        let mut data_pos = s.pos();
        let num_smp = m.samples.len();
        for (i, q) in m.samples.iter_mut().enumerate() {
            q.seek_pos = data_pos;
            if q.flags.contains(SampleFlags::ITPACKED) {
                if i + 1 < num_smp {
                    warn!("UNI: sample {i} is packed, later sample offsets are unknown");
                }
                break;
            }
            data_pos += q.length as u64 * q.frame_size() as u64;
        }

        if m.flags.contains(ModuleFlags::INST) {
            m.alloc_instruments()?;
            m.instruments = instruments;
        }

        debug!(
            "UNI: {} channels, {} patterns, {} tracks",
            m.num_chn, m.num_pat, h.num_trk
        );
        Ok(m)
    }
}
