//! Fasttracker 2 Extended Module (XM) loader
//!
//! # Layout
//!
//! - Header with song metadata (name, speed, BPM, channels) and a 256-entry order table
//! - Patterns (packed note data)
//! - Instruments, each followed by its sample headers and, from version 0x0104 on,
//!   by its sample data
//!
//! Versions before 0x0104 store every instrument before the patterns and all sample
//! data after them.
//!
//! # Format Reference
//!
//! - FastTracker 2 XM format specification v0104
//! - <https://github.com/milkytracker/MilkyTracker/blob/master/resources/reference/xm-form.txt>

mod instrument;
mod pattern;

use std::sync::Arc;

use nether_unimod::{Instrument, Module, ModuleFlags, ModuleStream, Sample, UniError};
use tracing::{debug, warn};

use crate::error::{Context, LoadError};
use crate::{LoadOptions, ModuleLoader, new_writer, open_stream};

use instrument::{XmInstrument, read_instrument};
use pattern::{MAX_PATTERN_ROWS, XmNote, convert_track, read_pattern, read_pattern_header};

/// XM format magic string
pub const XM_MAGIC: &[u8; 17] = b"Extended Module: ";

/// Magic, name, 0x1A marker, tracker name and version
const MIN_SIZE: usize = 60;

const MAX_CHANNELS: usize = 64;
const MAX_PATTERNS: usize = 256;
const MAX_INSTRUMENTS: usize = 128;
const MAX_ORDERS: usize = 256;

/// First version storing patterns before instruments
const VERSION_PATTERNS_FIRST: u16 = 0x0104;

#[derive(Debug, Clone)]
struct XmHeader {
    name: String,
    tracker: String,
    version: u16,
    header_size: u32,
    song_length: u16,
    restart_position: u16,
    num_channels: u16,
    num_patterns: u16,
    num_instruments: u16,
    flags: u16,
    default_speed: u16,
    default_bpm: u16,
    order_table: [u8; MAX_ORDERS],
}

fn read_header(s: &mut ModuleStream) -> Result<XmHeader, UniError> {
    s.skip(XM_MAGIC.len() as u64)?;
    let name = s.read_string(20)?;
    // 0x1A marker
    s.skip(1)?;
    let tracker = s.read_string(20)?;
    let version = s.read_u16_le()?;
    let header_size = s.read_u32_le()?;

    Ok(XmHeader {
        name,
        tracker,
        version,
        header_size,
        song_length: s.read_u16_le()?,
        restart_position: s.read_u16_le()?,
        num_channels: s.read_u16_le()?,
        num_patterns: s.read_u16_le()?,
        num_instruments: s.read_u16_le()?,
        flags: s.read_u16_le()?,
        default_speed: s.read_u16_le()?,
        default_bpm: s.read_u16_le()?,
        order_table: s.read_array()?,
    })
}

/// Decoded pattern: row count and one track per channel
struct XmPattern {
    rows: u16,
    tracks: Vec<Arc<[u8]>>,
}

/// Read and translate every stored pattern
fn load_patterns(
    s: &mut ModuleStream,
    h: &XmHeader,
    flags: ModuleFlags,
    options: &LoadOptions,
) -> Result<Vec<XmPattern>, LoadError> {
    let channels = h.num_channels as usize;
    let mut w = new_writer(options);
    let mut cells = vec![XmNote::default(); MAX_PATTERN_ROWS as usize * channels];
    let mut patterns = Vec::with_capacity(h.num_patterns as usize);

    for pat in 0..h.num_patterns as usize {
        let (mut rows, packed_size) = read_pattern_header(s, h.version)
            .section("pattern")?
            .map_err(|reason| LoadError::pattern(pat, reason))?;
        if rows > MAX_PATTERN_ROWS {
            return Err(LoadError::pattern(pat, format!("{rows} rows")));
        }
        // An empty pattern plays as 64 blank rows
        if rows == 0 {
            rows = 64;
        }
        let cells = &mut cells[..rows as usize * channels];
        read_pattern(s, rows, channels, packed_size, cells).section("pattern")?;

        let tracks = cells
            .chunks_exact(rows as usize)
            .map(|column| convert_track(&mut w, flags, column))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| LoadError::pattern(pat, e.to_string()))?;
        patterns.push(XmPattern { rows, tracks });
    }
    Ok(patterns)
}

fn load_instruments(
    s: &mut ModuleStream,
    h: &XmHeader,
) -> Result<Vec<XmInstrument>, LoadError> {
    let mut instruments = Vec::with_capacity(h.num_instruments as usize);
    for i in 0..h.num_instruments as usize {
        let mut xi = read_instrument(s, i)?;
        if h.version >= VERSION_PATTERNS_FIRST {
            // Sample data directly follows this instrument's sample headers
            let data_start = s.pos();
            for q in xi.samples.iter_mut() {
                q.seek_pos += data_start;
            }
            s.skip(xi.data_len).section("sample data")?;
        }
        instruments.push(xi);
    }
    Ok(instruments)
}

/// Fasttracker 2 loader
#[derive(Debug, Default, Clone, Copy)]
pub struct XmLoader;

impl ModuleLoader for XmLoader {
    fn name(&self) -> &'static str {
        "XM"
    }

    fn description(&self) -> &'static str {
        "Fasttracker 2 Extended Module"
    }

    fn identify(&self, data: &[u8]) -> bool {
        data.len() >= MIN_SIZE && data.starts_with(XM_MAGIC)
    }

    fn load(&self, data: &[u8], options: &LoadOptions) -> Result<Module, LoadError> {
        if !self.identify(data) {
            return Err(LoadError::Unknown);
        }
        let mut s = open_stream(data, options);
        let h = read_header(&mut s).section("header")?;

        if !(0x0102..=0x0104).contains(&h.version) {
            return Err(LoadError::header(format!(
                "unsupported XM version {:#06x}",
                h.version
            )));
        }
        if h.num_channels == 0 {
            return Err(LoadError::header("no channels"));
        }
        let max_channels = options.channel_limit(MAX_CHANNELS);
        if h.num_channels as usize > max_channels {
            return Err(LoadError::limit(
                "channels",
                h.num_channels as usize,
                max_channels,
            ));
        }
        if h.num_patterns as usize > MAX_PATTERNS {
            return Err(LoadError::limit(
                "patterns",
                h.num_patterns as usize,
                MAX_PATTERNS,
            ));
        }
        if h.num_instruments as usize > MAX_INSTRUMENTS {
            return Err(LoadError::limit(
                "instruments",
                h.num_instruments as usize,
                MAX_INSTRUMENTS,
            ));
        }
        if h.song_length as usize > MAX_ORDERS {
            return Err(LoadError::limit("orders", h.song_length as usize, MAX_ORDERS));
        }

        let mut flags = ModuleFlags::XMPERIODS
            | ModuleFlags::INST
            | ModuleFlags::NOWRAP
            | ModuleFlags::FT2QUIRKS
            | ModuleFlags::PANNING;
        if h.flags & 0x01 != 0 {
            flags |= ModuleFlags::LINEAR;
        }

        // Header size counts from its own field at offset 60
        s.seek_to(MIN_SIZE as u64 + h.header_size as u64)
            .section("header")?;

        let (patterns, mut instruments) = if h.version < VERSION_PATTERNS_FIRST {
            let instruments = load_instruments(&mut s, &h)?;
            let patterns = load_patterns(&mut s, &h, flags, options)?;
            (patterns, instruments)
        } else {
            let patterns = load_patterns(&mut s, &h, flags, options)?;
            let instruments = load_instruments(&mut s, &h)?;
            (patterns, instruments)
        };
        if h.version < VERSION_PATTERNS_FIRST {
            // All sample data follows the patterns
            let mut offset = s.pos();
            for xi in instruments.iter_mut() {
                for q in xi.samples.iter_mut() {
                    q.seek_pos += offset;
                }
                offset += xi.data_len;
            }
        }

        let mut m = Module::new();
        m.song_name = h.name.clone();
        let tracker = if h.tracker.is_empty() {
            "Unknown tracker"
        } else {
            h.tracker.as_str()
        };
        m.mod_type = format!(
            "{tracker} (XM format {}.{:02})",
            h.version >> 8,
            h.version & 0xFF
        );
        m.flags = flags;
        m.num_chn = h.num_channels;
        m.init_speed = h.default_speed.clamp(1, 255) as u8;
        m.init_tempo = h.default_bpm;
        m.bpm_limit = 32;
        m.num_ins = h.num_instruments;

        // Orders past the last pattern play an extra blank pattern
        let mut num_pat = h.num_patterns;
        let mut positions: Vec<u16> = h.order_table[..h.song_length as usize]
            .iter()
            .map(|&o| o as u16)
            .collect();
        let needs_blank = positions.iter().any(|&p| p >= num_pat);
        if needs_blank {
            warn!("XM order list refers to missing patterns, adding a blank pattern");
            for p in positions.iter_mut().filter(|p| **p >= h.num_patterns) {
                *p = h.num_patterns;
            }
            num_pat += 1;
        }
        m.num_pat = num_pat;
        m.alloc_positions(positions.len())?;
        m.positions.copy_from_slice(&positions);
        m.rep_pos = if h.restart_position < h.song_length {
            h.restart_position
        } else {
            0
        };

        let mut samples: Vec<Sample> = Vec::new();
        let mut unified: Vec<Instrument> = Vec::with_capacity(instruments.len());
        for xi in instruments {
            let first = samples.len() as u16;
            let mut ins = xi.instrument;
            for n in ins.sample_number.iter_mut().filter(|n| **n != u16::MAX) {
                *n += first;
            }
            unified.push(ins);
            samples.extend(xi.samples);
        }
        m.num_smp = u16::try_from(samples.len())
            .map_err(|_| LoadError::limit("samples", samples.len(), u16::MAX as usize))?;
        m.alloc_samples()?;
        m.samples = samples;

        m.alloc_patterns()?;
        m.alloc_tracks()?;
        let chn = m.num_chn as usize;
        let mut w = new_writer(options);
        for (pat, p) in patterns.into_iter().enumerate() {
            m.pattern_rows[pat] = p.rows;
            for (ch, track) in p.tracks.into_iter().enumerate() {
                m.tracks[pat * chn + ch] = Some(track);
            }
        }
        if needs_blank {
            let pat = h.num_patterns as usize;
            let blank = w.empty_track(64)?;
            for ch in 0..chn {
                m.tracks[pat * chn + ch] = Some(Arc::clone(&blank));
            }
        }

        m.alloc_instruments()?;
        m.instruments = unified;

        debug!(
            "XM '{}': version {:#06x}, {} channels, {} patterns, {} instruments, {} samples",
            m.song_name, h.version, m.num_chn, m.num_pat, m.num_ins, m.num_smp
        );
        Ok(m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{Bytes, assert_rejects_truncated, row_events};
    use instrument::build_instrument;
    use nether_unimod::track::Event;
    use nether_unimod::{EnvelopePoint, SampleFlags, opcodes};

    /// Two channels, `num_patterns` one-row patterns, one instrument with one sample
    fn build_xm(
        version: u16,
        orders: &[u8],
        num_patterns: u16,
        vol_points: &[(u16, u16)],
    ) -> Vec<u8> {
        let mut b = Bytes::new();
        b.bytes(XM_MAGIC).str("xm song", 20).u8(0x1A).str("FastTracker v2.00", 20);
        b.u16le(version).u32le(276);
        b.u16le(orders.len() as u16).u16le(0).u16le(2);
        b.u16le(num_patterns).u16le(1).u16le(1);
        b.u16le(6).u16le(125);
        let mut table = [0u8; MAX_ORDERS];
        table[..orders.len()].copy_from_slice(orders);
        b.bytes(&table);
        assert_eq!(b.len(), 336);

        let instrument = build_instrument("Piano", &[(16, 0, 0, 0)], vol_points);
        let pattern = |b: &mut Bytes| {
            for _ in 0..num_patterns {
                // C-4, instrument 1, volume 0x40, then a packed empty cell
                b.u32le(9).u8(0).u16le(1).u16le(7);
                b.u8(49).u8(1).u8(0x50).u8(0).u8(0).u8(0x80).u8(0x80);
            }
        };
        if version >= VERSION_PATTERNS_FIRST {
            pattern(&mut b);
            b.bytes(&instrument);
            b.zeros(16);
        } else {
            b.bytes(&instrument);
            pattern(&mut b);
            b.zeros(16);
        }
        b.build()
    }

    #[test]
    fn test_identify() {
        let data = build_xm(0x0104, &[0], 1, &[]);
        assert!(XmLoader.identify(&data));
        assert_rejects_truncated(&XmLoader, &data, MIN_SIZE);
        assert!(!XmLoader.identify(b"Extended Module:"));
    }

    #[test]
    fn test_load() {
        let data = build_xm(0x0104, &[0, 0], 1, &[(0, 64), (16, 0)]);
        let m = XmLoader.load(&data, &LoadOptions::default()).unwrap();
        m.validate().unwrap();

        assert_eq!(m.song_name, "xm song");
        assert_eq!(m.mod_type, "FastTracker v2.00 (XM format 1.04)");
        assert!(m.flags.contains(ModuleFlags::XMPERIODS | ModuleFlags::INST));
        assert!(!m.flags.contains(ModuleFlags::LINEAR));
        assert_eq!(m.num_chn, 2);
        assert_eq!(m.positions, vec![0, 0]);
        assert_eq!(m.pattern_rows, vec![1]);
        assert_eq!(m.num_smp, 1);
        assert_eq!(m.instruments[0].name, "Piano");
        assert_eq!(m.instruments[0].sample_number[0], 0);

        let q = &m.samples[0];
        assert_eq!(q.length, 16);
        assert!(q.flags.contains(SampleFlags::DELTA | SampleFlags::SIGNED));
        assert_eq!(q.seek_pos, (data.len() - 16) as u64);

        assert_eq!(
            row_events(&m, 0, 0, 0),
            vec![
                Event::Note(48),
                Event::Instrument(0),
                Event::Effect {
                    opcode: opcodes::PTEFFECTC,
                    param: 0x40
                },
            ]
        );
        assert!(row_events(&m, 0, 1, 0).is_empty());
    }

    #[test]
    fn test_old_version_order() {
        let data = build_xm(0x0103, &[0], 1, &[]);
        let m = XmLoader.load(&data, &LoadOptions::default()).unwrap();
        m.validate().unwrap();
        assert_eq!(m.mod_type, "FastTracker v2.00 (XM format 1.03)");
        assert_eq!(row_events(&m, 0, 0, 0)[0], Event::Note(48));
        // Sample data sits after the pattern data
        assert_eq!(m.samples[0].seek_pos, (data.len() - 16) as u64);
    }

    #[test]
    fn test_missing_pattern_gets_blank() {
        let data = build_xm(0x0104, &[0, 7, 0], 1, &[]);
        let m = XmLoader.load(&data, &LoadOptions::default()).unwrap();
        m.validate().unwrap();
        assert_eq!(m.num_pat, 2);
        assert_eq!(m.positions, vec![0, 1, 0]);
        assert!(row_events(&m, 1, 0, 0).is_empty());
    }

    #[test]
    fn test_truncated_envelope_positions_rebuilt() {
        // Positions 0, 200, 300, 400 with the high byte lost
        let data = build_xm(
            0x0104,
            &[0],
            1,
            &[(0, 64), (200, 48), (44, 32), (144, 0)],
        );
        let m = XmLoader.load(&data, &LoadOptions::default()).unwrap();
        let env = &m.instruments[0].volume_envelope;
        let positions: Vec<i16> = env.points.iter().map(|p| p.pos).collect();
        assert_eq!(positions, vec![0, 200, 300, 400]);
        assert!(positions.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(env.points[1], EnvelopePoint { pos: 200, val: 48 << 2 });
    }

    #[test]
    fn test_rejects_bad_version_and_truncation() {
        let mut data = build_xm(0x0104, &[0], 1, &[]);
        data[58] = 0x05;
        data[59] = 0x02;
        assert!(matches!(
            XmLoader.load(&data, &LoadOptions::default()),
            Err(LoadError::Header(_))
        ));

        let data = build_xm(0x0104, &[0], 1, &[]);
        assert!(matches!(
            XmLoader.load(&data[..340], &LoadOptions::default()),
            Err(LoadError::Truncated(_))
        ));
    }
}
