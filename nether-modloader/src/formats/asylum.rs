//! Asylum Music Format (AMF, from Crusader games) loader
//!
//! Unlike DSMI AMF, every section sits at a fixed offset: song parameters at 0x20, the
//! order list at 0x26, 64 sample header slots at 0x126 and the patterns right after.

use std::sync::Arc;

use nether_unimod::{
    Module, ModuleFlags, ModuleStream, NUM_NOTES, OCTAVE, PAN_LEFT, PAN_RIGHT, Sample,
    SampleFlags, UniError, UniWriter,
};
use tracing::debug;

use crate::error::{Context, LoadError};
use crate::{LoadOptions, ModuleLoader, new_writer, open_stream};

const ASYLUM_MAGIC: &[u8; 25] = b"ASYLUM Music Format V1.0\0";

const PARAMS_OFFSET: u64 = 0x20;
const ORDERS_OFFSET: u64 = 0x26;
const SAMPLES_OFFSET: u64 = 0x126;
const SAMPLE_HEADER: u64 = 37;
const SAMPLE_SLOTS: u64 = 64;
const PATTERNS_OFFSET: u64 = SAMPLES_OFFSET + SAMPLE_SLOTS * SAMPLE_HEADER;

/// Only the first 31 sample slots are ever used
const NUM_SAMPLES: usize = 31;
const ASYLUM_CHANNELS: usize = 8;
const ASYLUM_ROWS: usize = 64;
const PATTERN_SIZE: usize = ASYLUM_ROWS * ASYLUM_CHANNELS * 4;

/// Amiga finetune (signed nibble) to C-4 rate
const FINETUNE: [u32; 16] = [
    8363, 8413, 8463, 8529, 8581, 8651, 8723, 8757, 7895, 7941, 7985, 8046, 8107, 8169, 8232, 8280,
];

fn read_sample(s: &mut ModuleStream, index: u64) -> Result<Sample, UniError> {
    s.seek_to(SAMPLES_OFFSET + index * SAMPLE_HEADER)?;
    let name = s.read_string(22)?;
    let finetune = s.read_u8()?;
    let volume = s.read_u8()?;
    s.skip(1)?;
    let length = s.read_u32_le()?;
    let loop_start = s.read_u32_le()?;
    let loop_len = s.read_u32_le()?;

    let mut q = Sample {
        name,
        speed: FINETUNE[(finetune & 0x0F) as usize],
        volume: (volume & 0x7F).min(64),
        length,
        loop_start,
        loop_end: loop_start.saturating_add(loop_len),
        flags: SampleFlags::SIGNED,
        ..Sample::default()
    };
    if loop_len > 2 {
        q.flags |= SampleFlags::LOOP;
    }
    q.fix_loop();
    Ok(q)
}

fn convert_track(
    w: &mut UniWriter,
    pattern: &[u8],
    channel: usize,
) -> Result<Arc<[u8]>, UniError> {
    let flags = ModuleFlags::empty();
    w.reset();
    for row in 0..ASYLUM_ROWS {
        let at = (row * ASYLUM_CHANNELS + channel) * 4;
        let [note, ins, effect, mut param] = [
            pattern[at],
            pattern[at + 1],
            pattern[at + 2],
            pattern[at + 3],
        ];
        let ins = ins & 0x1F;
        if ins != 0 {
            w.instrument(ins - 1);
        }
        if note != 0 {
            let note = note as usize + 2 * OCTAVE as usize - 1;
            if note < NUM_NOTES {
                w.note(note as u8);
            }
        }
        match effect {
            // Pattern break rows are decimal
            0xD => param = (param >> 4) * 10 + (param & 0x0F),
            // Volume slide up wins over down
            0xA if param & 0x0F != 0 && param & 0xF0 != 0 => param &= 0xF0,
            _ => {}
        }
        if effect <= 0xF {
            w.pt_effect(effect, param, flags);
        }
        w.new_row();
    }
    w.finalize()
}

/// Asylum Music Format loader
#[derive(Debug, Default, Clone, Copy)]
pub struct AsylumLoader;

impl ModuleLoader for AsylumLoader {
    fn name(&self) -> &'static str {
        "ASYLUM"
    }

    fn description(&self) -> &'static str {
        "Asylum Music Format"
    }

    fn identify(&self, data: &[u8]) -> bool {
        data.len() >= PATTERNS_OFFSET as usize && data.starts_with(ASYLUM_MAGIC)
    }

    fn load(&self, data: &[u8], options: &LoadOptions) -> Result<Module, LoadError> {
        if !self.identify(data) {
            return Err(LoadError::Unknown);
        }
        let mut s = open_stream(data, options);

        s.seek_to(PARAMS_OFFSET).section("header")?;
        let speed = s.read_u8().section("header")?;
        let tempo = s.read_u8().section("header")?;
        // Sample count (always 64 slots)
        s.skip(1).section("header")?;
        let num_pat = s.read_u8().section("header")? as usize;
        let num_orders = s.read_u8().section("header")? as usize;
        let restart = s.read_u8().section("header")?;
        s.seek_to(ORDERS_OFFSET).section("header")?;
        let orders = s.read_slice(num_orders).section("orders")?;
        if let Some(&bad) = orders.iter().find(|&&o| o as usize >= num_pat) {
            return Err(LoadError::header(format!("order refers to missing pattern {bad}")));
        }

        let mut m = Module::new();
        m.mod_type = "Asylum Music Format 1.0".to_string();
        m.num_chn = ASYLUM_CHANNELS as u16;
        if speed != 0 {
            m.init_speed = speed;
        }
        if tempo >= 32 {
            m.init_tempo = tempo as u16;
        }
        for (ch, pan) in m.panning.iter_mut().take(ASYLUM_CHANNELS).enumerate() {
            *pan = if (ch + 1) & 2 != 0 { PAN_RIGHT } else { PAN_LEFT };
        }

        m.alloc_positions(num_orders)?;
        for (p, &o) in m.positions.iter_mut().zip(orders) {
            *p = o as u16;
        }
        if (restart as usize) < num_orders {
            m.rep_pos = restart as u16;
        }

        m.num_smp = NUM_SAMPLES as u16;
        m.num_ins = m.num_smp;
        m.alloc_samples()?;
        for i in 0..NUM_SAMPLES {
            m.samples[i] = read_sample(&mut s, i as u64).section("sample header")?;
        }

        m.num_pat = num_pat as u16;
        m.alloc_patterns()?;
        m.alloc_tracks()?;
        s.seek_to(PATTERNS_OFFSET).section("pattern")?;
        let mut w = new_writer(options);
        for pat in 0..num_pat {
            let pattern = s.read_slice(PATTERN_SIZE).section("pattern")?;
            for ch in 0..ASYLUM_CHANNELS {
                let track = convert_track(&mut w, pattern, ch)
                    .map_err(|e| LoadError::pattern(pat, e.to_string()))?;
                m.tracks[pat * ASYLUM_CHANNELS + ch] = Some(track);
            }
        }

        // Sample data follows the patterns back to back
        let mut data_pos = s.pos();
        for q in &mut m.samples {
            q.seek_pos = data_pos;
            data_pos += q.length as u64;
        }

        debug!("Asylum: {} patterns, {} positions", m.num_pat, m.num_pos);
        Ok(m)
    }
}
