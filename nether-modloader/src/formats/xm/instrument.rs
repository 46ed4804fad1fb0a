//! Instrument, envelope and sample header parsing

use nether_unimod::{
    Envelope, EnvelopeFlags, EnvelopePoint, Instrument, ModuleStream, Sample, SampleFlags,
};
use tracing::warn;

use crate::error::{Context, LoadError};

/// Envelope nodes stored per envelope
const MAX_ENVELOPE_POINTS: usize = 12;

/// Notes covered by the sample map
const XM_NOTE_COUNT: usize = 96;

/// Smallest header that carries the sample map and envelopes
const MIN_FULL_HEADER: u32 = 29;

/// Bytes per sample header as written by Fasttracker 2
const SAMPLE_HEADER_SIZE: u32 = 40;

/// Parsed instrument with its samples
///
/// Sample `seek_pos` values are relative to the start of this instrument's sample
/// data; `data_len` is the size of that data.
#[derive(Debug, Clone)]
pub(crate) struct XmInstrument {
    pub instrument: Instrument,
    pub samples: Vec<Sample>,
    pub data_len: u64,
}

/// Envelope block as stored: 12 (x, y) nodes plus markers and flags
#[derive(Debug, Clone, Copy, Default)]
struct RawEnvelope {
    points: [(u16, u16); MAX_ENVELOPE_POINTS],
    count: u8,
    sustain: u8,
    loop_start: u8,
    loop_end: u8,
    kind: u8,
}

/// Some editors only store the low byte of node positions. When a position goes
/// backwards, borrow the previous node's high byte and step up one page if still behind.
///
/// Returns whether any position was rewritten.
pub(crate) fn fix_truncated_positions(points: &mut [EnvelopePoint]) -> bool {
    let mut fixed = false;
    for i in 1..points.len() {
        let prev = points[i - 1].pos as i32;
        let cur = points[i].pos as i32;
        if cur < prev {
            let mut pos = (prev & !0xFF) | (cur & 0xFF);
            if pos < prev {
                pos += 0x100;
            }
            points[i].pos = pos.min(i16::MAX as i32) as i16;
            fixed = true;
        }
    }
    fixed
}

fn build_envelope(raw: &RawEnvelope, what: &str, index: usize) -> Envelope {
    let mut count = raw.count as usize;
    if count > MAX_ENVELOPE_POINTS {
        warn!("XM instrument {index}: {count} {what} envelope points, keeping 12");
        count = MAX_ENVELOPE_POINTS;
    }

    let mut flags = EnvelopeFlags::empty();
    if raw.kind & 0x01 != 0 {
        flags |= EnvelopeFlags::ON;
    }
    if raw.kind & 0x02 != 0 {
        flags |= EnvelopeFlags::SUSTAIN;
    }
    if raw.kind & 0x04 != 0 {
        flags |= EnvelopeFlags::LOOP;
    }
    // A single node is not an envelope
    if count < 2 {
        flags.remove(EnvelopeFlags::ON);
    }

    let mut points: Vec<EnvelopePoint> = raw.points[..count]
        .iter()
        .map(|&(x, y)| EnvelopePoint {
            pos: x.min(i16::MAX as u16) as i16,
            val: (y as i16) << 2,
        })
        .collect();
    if fix_truncated_positions(&mut points) {
        warn!("XM instrument {index}: rebuilt truncated {what} envelope positions");
    }

    let mut env = Envelope {
        flags,
        points,
        sus_begin: raw.sustain,
        sus_end: raw.sustain,
        loop_begin: raw.loop_start,
        loop_end: raw.loop_end,
    };
    env.clamp_markers();
    env
}

/// Sample rate for C-4 from the relative note and finetune (1/128 semitone)
pub(crate) fn sample_rate(relative_note: i8, finetune: i8) -> u32 {
    let semitones = relative_note as f64 + finetune as f64 / 128.0;
    (8363.0 * (semitones / 12.0).exp2()).round() as u32
}

/// Read one instrument header and its sample headers; sample data is left in place
pub(crate) fn read_instrument(
    s: &mut ModuleStream,
    index: usize,
) -> Result<XmInstrument, LoadError> {
    let section = "instrument";
    let header_start = s.pos();
    let header_size = s.read_u32_le().section(section)?;

    let mut instrument = Instrument {
        name: s.read_string(22).section(section)?,
        ..Instrument::default()
    };
    // Instrument type, always 0
    s.skip(1).section(section)?;
    let num_samples = s.read_u16_le().section(section)? as usize;

    if header_size < MIN_FULL_HEADER || num_samples == 0 {
        if header_size >= MIN_FULL_HEADER {
            s.seek_to(header_start + header_size as u64).section(section)?;
        }
        return Ok(XmInstrument {
            instrument,
            samples: Vec::new(),
            data_len: 0,
        });
    }
    if num_samples > XM_NOTE_COUNT {
        return Err(LoadError::Instrument {
            index,
            reason: format!("{num_samples} samples"),
        });
    }

    let sample_header_size = s.read_u32_le().section(section)?;
    let sample_map = s.read_array::<XM_NOTE_COUNT>().section(section)?;

    let mut vol = RawEnvelope::default();
    let mut pan = RawEnvelope::default();
    for p in vol.points.iter_mut() {
        *p = (s.read_u16_le().section(section)?, s.read_u16_le().section(section)?);
    }
    for p in pan.points.iter_mut() {
        *p = (s.read_u16_le().section(section)?, s.read_u16_le().section(section)?);
    }
    vol.count = s.read_u8().section(section)?;
    pan.count = s.read_u8().section(section)?;
    vol.sustain = s.read_u8().section(section)?;
    vol.loop_start = s.read_u8().section(section)?;
    vol.loop_end = s.read_u8().section(section)?;
    pan.sustain = s.read_u8().section(section)?;
    pan.loop_start = s.read_u8().section(section)?;
    pan.loop_end = s.read_u8().section(section)?;
    vol.kind = s.read_u8().section(section)?;
    pan.kind = s.read_u8().section(section)?;
    let vib_type = s.read_u8().section(section)?;
    let vib_sweep = s.read_u8().section(section)?;
    let vib_depth = s.read_u8().section(section)?;
    let vib_rate = s.read_u8().section(section)?;
    let fadeout = s.read_u16_le().section(section)?;

    // Reserved bytes up to the declared header size
    s.seek_to(header_start + header_size as u64).section(section)?;

    instrument.volume_fade = fadeout;
    instrument.volume_envelope = build_envelope(&vol, "volume", index);
    instrument.panning_envelope = build_envelope(&pan, "panning", index);
    for (note, &smp) in sample_map.iter().enumerate() {
        if (smp as usize) < num_samples {
            instrument.sample_number[note] = smp as u16;
        }
    }

    let mut samples = Vec::with_capacity(num_samples);
    let mut data_len = 0u64;
    for _ in 0..num_samples {
        let length = s.read_u32_le().section("sample header")?;
        let loop_start = s.read_u32_le().section("sample header")?;
        let loop_length = s.read_u32_le().section("sample header")?;
        let volume = s.read_u8().section("sample header")?;
        let finetune = s.read_i8().section("sample header")?;
        let kind = s.read_u8().section("sample header")?;
        let panning = s.read_u8().section("sample header")?;
        let relative_note = s.read_i8().section("sample header")?;
        // Reserved
        s.skip(1).section("sample header")?;
        let name = s.read_string(22).section("sample header")?;
        if sample_header_size > SAMPLE_HEADER_SIZE {
            s.skip((sample_header_size - SAMPLE_HEADER_SIZE) as u64)
                .section("sample header")?;
        }

        let mut q = Sample {
            name,
            speed: sample_rate(relative_note, finetune),
            volume: volume.min(64),
            panning: panning as u16,
            length,
            loop_start,
            loop_end: loop_start.saturating_add(loop_length),
            vib_type,
            vib_sweep,
            vib_depth,
            vib_rate,
            seek_pos: data_len,
            flags: SampleFlags::OWNPAN | SampleFlags::DELTA | SampleFlags::SIGNED,
            ..Sample::default()
        };
        data_len += length as u64;

        if kind & 0x03 != 0 && loop_length > 0 {
            q.flags |= SampleFlags::LOOP;
            if kind & 0x02 != 0 {
                q.flags |= SampleFlags::BIDI;
            }
        }
        // Lengths are stored in bytes
        if kind & 0x10 != 0 {
            q.flags |= SampleFlags::BITS16;
            q.length >>= 1;
            q.loop_start >>= 1;
            q.loop_end >>= 1;
        }
        q.fix_loop();
        samples.push(q);
    }

    Ok(XmInstrument {
        instrument,
        samples,
        data_len,
    })
}

/// Serialized instrument header with one sample header per entry of `samples`
/// (length in bytes, loop start, loop length, type)
#[cfg(test)]
pub(crate) fn build_instrument(
    name: &str,
    samples: &[(u32, u32, u32, u8)],
    vol_points: &[(u16, u16)],
) -> Vec<u8> {
    let mut b = crate::testutil::Bytes::new();
    b.u32le(263).str(name, 22).u8(0).u16le(samples.len() as u16);
    if samples.is_empty() {
        b.pad_to(263);
        return b.build();
    }
    b.u32le(SAMPLE_HEADER_SIZE);
    for note in 0..XM_NOTE_COUNT {
        b.u8(if note >= 48 && samples.len() > 1 { 1 } else { 0 });
    }
    for i in 0..MAX_ENVELOPE_POINTS {
        let (x, y) = vol_points.get(i).copied().unwrap_or((0, 0));
        b.u16le(x).u16le(y);
    }
    b.zeros(MAX_ENVELOPE_POINTS * 4);
    b.u8(vol_points.len() as u8).u8(0);
    b.u8(1).u8(0).u8(vol_points.len().saturating_sub(1) as u8);
    b.u8(0).u8(0).u8(0);
    b.u8(0x03).u8(0);
    b.u8(0).u8(0).u8(0).u8(0);
    b.u16le(0x200);
    b.pad_to(263);
    for (i, &(length, loop_start, loop_length, kind)) in samples.iter().enumerate() {
        b.u32le(length).u32le(loop_start).u32le(loop_length);
        b.u8(48).u8(0).u8(kind).u8(0x80).u8(0).u8(0);
        b.str(&format!("smp{i}"), 22);
    }
    b.build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_instrument() {
        let data = build_instrument(
            "Lead",
            &[(1000, 100, 400, 0x01), (2000, 0, 2000, 0x12)],
            &[(0, 64), (10, 32), (40, 0)],
        );
        let mut s = ModuleStream::new(&data);
        let xi = read_instrument(&mut s, 0).unwrap();
        assert_eq!(s.pos(), data.len() as u64);

        let ins = &xi.instrument;
        assert_eq!(ins.name, "Lead");
        assert_eq!(ins.volume_fade, 0x200);
        assert_eq!(ins.sample_number[0], 0);
        assert_eq!(ins.sample_number[60], 1);
        assert_eq!(ins.sample_number[100], u16::MAX);
        assert!(ins.volume_envelope.flags.contains(EnvelopeFlags::ON | EnvelopeFlags::SUSTAIN));
        assert_eq!(ins.volume_envelope.points[0], EnvelopePoint { pos: 0, val: 256 });
        assert_eq!(ins.volume_envelope.loop_end, 2);
        assert!(!ins.panning_envelope.is_enabled());

        assert_eq!(xi.samples.len(), 2);
        assert_eq!(xi.data_len, 3000);
        let q = &xi.samples[0];
        assert_eq!(q.name, "smp0");
        assert_eq!(q.loop_end, 500);
        assert_eq!(q.volume, 48);
        assert_eq!(q.panning, 0x80);
        assert!(q.flags.contains(SampleFlags::LOOP | SampleFlags::DELTA));

        let q = &xi.samples[1];
        assert_eq!(q.seek_pos, 1000);
        assert_eq!(q.length, 1000);
        assert_eq!(q.loop_end, 1000);
        assert!(q.flags.contains(SampleFlags::BITS16 | SampleFlags::BIDI));
    }

    #[test]
    fn test_empty_instrument() {
        let data = build_instrument("Empty", &[], &[]);
        let mut s = ModuleStream::new(&data);
        let xi = read_instrument(&mut s, 3).unwrap();
        assert_eq!(xi.instrument.name, "Empty");
        assert!(xi.samples.is_empty());
        assert_eq!(s.pos(), 263);
    }

    #[test]
    fn test_truncated_envelope_positions() {
        // 0, 200, 300, 400 stored with the high byte dropped
        let mut points: Vec<EnvelopePoint> = [0i16, 200, 44, 144]
            .iter()
            .map(|&pos| EnvelopePoint { pos, val: 0 })
            .collect();
        assert!(fix_truncated_positions(&mut points));
        let positions: Vec<i16> = points.iter().map(|p| p.pos).collect();
        assert_eq!(positions, vec![0, 200, 300, 400]);
        assert!(positions.windows(2).all(|w| w[0] <= w[1]));

        let mut sorted = points.clone();
        assert!(!fix_truncated_positions(&mut sorted));
    }

    #[test]
    fn test_sample_rate() {
        assert_eq!(sample_rate(0, 0), 8363);
        assert_eq!(sample_rate(12, 0), 16726);
        assert_eq!(sample_rate(-12, 0), 4182);
    }
}
