//! Instrument and envelope parsing

use nether_unimod::{
    DuplicateCheckAction, DuplicateCheckType, Envelope, EnvelopeFlags, EnvelopePoint, Instrument,
    InstrumentFlags, ModuleStream, NUM_NOTES, NewNoteAction, UniError,
};

/// "IMPI"
pub(crate) const INSTRUMENT_MAGIC: &[u8; 4] = b"IMPI";

/// Node slots stored per envelope
const MAX_ENVELOPE_POINTS: usize = 25;

/// Sample map entry: (note, 1-based sample)
fn apply_sample_table(ins: &mut Instrument, table: &[u8; NUM_NOTES * 2]) {
    for (i, pair) in table.chunks_exact(2).enumerate() {
        ins.sample_note[i] = pair[0];
        ins.sample_number[i] = match pair[1] {
            0 => u16::MAX,
            n => (n - 1) as u16,
        };
    }
}

/// Instrument flags bit 0 = on, bit 1 = loop, bit 2 = sustain loop
fn envelope_flags(flags: u8) -> EnvelopeFlags {
    let mut out = EnvelopeFlags::empty();
    if flags & 0x01 != 0 {
        out |= EnvelopeFlags::ON;
    }
    if flags & 0x02 != 0 {
        out |= EnvelopeFlags::LOOP;
    }
    if flags & 0x04 != 0 {
        out |= EnvelopeFlags::SUSTAIN;
    }
    out
}

/// Impulse Tracker 1.x instrument (compatible version below 2.00)
pub(crate) fn read_old_instrument(s: &mut ModuleStream) -> Result<Option<Instrument>, UniError> {
    let magic = s.read_array::<4>()?;
    if &magic != INSTRUMENT_MAGIC {
        return Ok(None);
    }
    let mut ins = Instrument::default();

    // DOS filename (12 bytes), reserved
    s.skip(13)?;
    let flags = s.read_u8()?;
    let vol_loop_begin = s.read_u8()?;
    let vol_loop_end = s.read_u8()?;
    let sus_begin = s.read_u8()?;
    let sus_end = s.read_u8()?;
    s.skip(2)?;
    let fadeout = s.read_u16_le()?;
    ins.nna = NewNoteAction::from_u8(s.read_u8()?);
    if s.read_u8()? != 0 {
        ins.dct = DuplicateCheckType::Note;
    }
    // Tracker version, sample count, reserved
    s.skip(4)?;
    ins.name = s.read_string(26)?;
    s.skip(6)?;
    let table = s.read_array::<{ NUM_NOTES * 2 }>()?;
    apply_sample_table(&mut ins, &table);

    // Precomputed volume envelope (200 bytes), then 25 (tick, value) nodes
    s.skip(200)?;
    let mut env = Envelope {
        flags: envelope_flags(flags),
        loop_begin: vol_loop_begin,
        loop_end: vol_loop_end,
        sus_begin,
        sus_end,
        ..Envelope::default()
    };
    for _ in 0..MAX_ENVELOPE_POINTS {
        let tick = s.read_u8()?;
        let value = s.read_u8()?;
        if tick == 0xFF || env.points.len() == MAX_ENVELOPE_POINTS {
            continue;
        }
        if env.points.last().is_some_and(|p| p.pos > tick as i16) {
            continue;
        }
        env.points.push(EnvelopePoint {
            pos: tick as i16,
            val: value as i16,
        });
    }
    if env.points.is_empty() {
        env.flags = EnvelopeFlags::empty();
    }
    env.clamp_markers();
    ins.volume_envelope = env;
    ins.volume_fade = fadeout << 6;
    Ok(Some(ins))
}

/// Impulse Tracker 2.x instrument
pub(crate) fn read_instrument(s: &mut ModuleStream) -> Result<Option<Instrument>, UniError> {
    let magic = s.read_array::<4>()?;
    if &magic != INSTRUMENT_MAGIC {
        return Ok(None);
    }
    let mut ins = Instrument::default();

    // DOS filename (12 bytes), reserved
    s.skip(13)?;
    ins.nna = NewNoteAction::from_u8(s.read_u8()?);
    ins.dct = DuplicateCheckType::from_u8(s.read_u8()?);
    ins.dca = DuplicateCheckAction::from_u8(s.read_u8()?);
    let fadeout = s.read_u16_le()?;
    ins.pitch_pan_separation = s.read_i8()?;
    ins.pitch_pan_center = s.read_u8()?;
    ins.global_volume = s.read_u8()? >> 1;
    let pan = s.read_u8()?;
    ins.random_volume = s.read_u8()?;
    ins.random_panning = s.read_u8()?;
    // Tracker version, sample count, reserved
    s.skip(4)?;
    ins.name = s.read_string(26)?;
    // Initial filter cutoff and resonance, MIDI channel, program and bank
    s.skip(6)?;
    let table = s.read_array::<{ NUM_NOTES * 2 }>()?;
    apply_sample_table(&mut ins, &table);

    ins.volume_envelope = read_envelope(s)?;
    ins.panning_envelope = read_envelope(s)?;
    ins.pitch_envelope = read_envelope(s)?;

    // Bit 7 of the default pan means "don't use"
    if pan & 0x80 == 0 {
        ins.flags |= InstrumentFlags::OWNPAN;
    }
    let pan = pan & 0x7F;
    ins.panning = if pan >= 64 { 255 } else { (pan as u16) << 2 };
    if ins.pitch_pan_separation != 0 {
        ins.flags |= InstrumentFlags::PITCHPAN;
    }
    ins.volume_fade = fadeout << 5;
    Ok(Some(ins))
}

/// Envelope block: flags, count, loop and sustain markers, 25 (value, tick) nodes
fn read_envelope(s: &mut ModuleStream) -> Result<Envelope, UniError> {
    let flags = s.read_u8()?;
    let count = (s.read_u8()? as usize).min(MAX_ENVELOPE_POINTS);
    let loop_begin = s.read_u8()?;
    let loop_end = s.read_u8()?;
    let sus_begin = s.read_u8()?;
    let sus_end = s.read_u8()?;

    let mut points = Vec::with_capacity(count);
    for i in 0..MAX_ENVELOPE_POINTS {
        let val = s.read_i8()?;
        let tick = s.read_u16_le()?;
        if i < count {
            points.push(EnvelopePoint {
                pos: tick as i16,
                val: val as i16,
            });
        }
    }
    // Reserved
    s.skip(1)?;

    let mut env = Envelope {
        flags: envelope_flags(flags),
        points,
        sus_begin,
        sus_end,
        loop_begin,
        loop_end,
    };
    if flags & 0x80 != 0 {
        env.flags |= EnvelopeFlags::FILTER;
    }
    env.clamp_markers();
    Ok(env)
}

#[cfg(test)]
fn envelope_block(b: &mut crate::testutil::Bytes, flags: u8, points: &[(i8, u16)]) {
    b.u8(flags).u8(points.len() as u8).u8(0).u8(1).u8(0).u8(0);
    for i in 0..MAX_ENVELOPE_POINTS {
        let (val, tick) = points.get(i).copied().unwrap_or((0, 0));
        b.u8(val as u8).u16le(tick);
    }
    b.u8(0);
}

/// Serialized 2.x instrument mapping every note to `sample`
#[cfg(test)]
pub(crate) fn build_instrument(name: &str, sample: u8) -> Vec<u8> {
    let mut b = crate::testutil::Bytes::new();
    b.bytes(INSTRUMENT_MAGIC).str("", 12).u8(0);
    b.u8(3).u8(1).u8(2).u16le(128);
    b.u8(0).u8(60).u8(128).u8(32).u8(0).u8(0);
    b.zeros(4).str(name, 26).zeros(6);
    for note in 0..NUM_NOTES as u8 {
        b.u8(note).u8(sample);
    }
    envelope_block(&mut b, 0x03, &[(64, 0), (32, 10), (0, 20)]);
    envelope_block(&mut b, 0x00, &[]);
    envelope_block(&mut b, 0x81, &[(0, 0), (16, 8)]);
    b.build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_format_instrument() {
        let data = build_instrument("Pad", 2);
        let mut s = ModuleStream::new(&data);
        let ins = read_instrument(&mut s).unwrap().unwrap();

        assert_eq!(ins.name, "Pad");
        assert_eq!(ins.nna, NewNoteAction::NoteFade);
        assert_eq!(ins.dct, DuplicateCheckType::Note);
        assert_eq!(ins.volume_fade, 128 << 5);
        assert_eq!(ins.global_volume, 64);
        assert_eq!(ins.panning, 128);
        assert!(ins.flags.contains(InstrumentFlags::OWNPAN));
        assert_eq!(ins.sample_number[60], 1);
        assert_eq!(ins.sample_note[60], 60);

        let env = &ins.volume_envelope;
        assert!(env.flags.contains(EnvelopeFlags::ON | EnvelopeFlags::LOOP));
        assert_eq!(env.points.len(), 3);
        assert_eq!(env.points[1], EnvelopePoint { pos: 10, val: 32 });
        assert!(!ins.panning_envelope.is_enabled());
        assert!(ins.pitch_envelope.flags.contains(EnvelopeFlags::FILTER));
    }

    #[test]
    fn test_missing_magic_is_empty_slot() {
        let data = vec![0u8; 600];
        let mut s = ModuleStream::new(&data);
        assert!(read_instrument(&mut s).unwrap().is_none());
    }

    #[test]
    fn test_truncated_instrument() {
        let data = build_instrument("Pad", 1);
        let mut s = ModuleStream::new(&data[..300]);
        assert_eq!(read_instrument(&mut s), Err(UniError::EndOfStream));
    }
}
