//! Composer 669 / UNIS 669 loader

use nether_unimod::{
    Module, ModuleStream, OCTAVE, PAN_LEFT, PAN_RIGHT, SampleFlags, UniError, UniWriter, opcodes,
};
use tracing::{debug, warn};

use crate::error::{Context, LoadError};
use crate::{LoadOptions, ModuleLoader, new_writer, open_stream};

/// "if": Composer 669
const MARKER_COMPOSER: &[u8; 2] = b"if";
/// "JN": UNIS 669 (extended)
const MARKER_UNIS: &[u8; 2] = b"JN";

const HEADER_SIZE: usize = 0x1F1;
const MESSAGE_LINE: usize = 36;
const NUM_ORDERS: usize = 128;
const MAX_SAMPLES: u8 = 64;
const MAX_PATTERNS: u8 = 128;
const CHANNELS: usize = 8;
const ROWS: usize = 64;
const ORDER_END: u8 = 0xFF;

/// Loop ends at or above this are a known broken-file marker
const LOOP_END_SENTINEL: u32 = 0xFFFFF;

/// Empty effect byte, also used as "no slide remembered"
const NO_EFFECT: u8 = 0xFF;

#[derive(Debug, Clone)]
struct Header669 {
    unis: bool,
    message: [String; 3],
    num_samples: u8,
    num_patterns: u8,
    loop_order: u8,
    orders: [u8; NUM_ORDERS],
    tempos: [u8; NUM_ORDERS],
    breaks: [u8; NUM_ORDERS],
}

fn read_header(s: &mut ModuleStream) -> Result<Header669, UniError> {
    let marker = s.read_array::<2>()?;
    let message = [
        s.read_string(MESSAGE_LINE)?,
        s.read_string(MESSAGE_LINE)?,
        s.read_string(MESSAGE_LINE)?,
    ];
    Ok(Header669 {
        unis: &marker == MARKER_UNIS,
        message,
        num_samples: s.read_u8()?,
        num_patterns: s.read_u8()?,
        loop_order: s.read_u8()?,
        orders: s.read_array()?,
        tempos: s.read_array()?,
        breaks: s.read_array()?,
    })
}

/// Per-channel slide memory: a slide keeps running until the next note
#[derive(Debug, Clone, Copy)]
struct SlideMemory {
    effect: u8,
    param: u8,
}

fn convert_cell(
    w: &mut UniWriter,
    cell: [u8; 3],
    last: &mut SlideMemory,
    unis: bool,
) {
    let [a, b, c] = cell;
    let flags = Default::default();

    if a < 0xFF {
        if a < 0xFE {
            let note = a >> 2;
            let ins = ((a & 0x03) << 4) | (b >> 4);
            w.instrument(ins);
            w.note(note + 2 * OCTAVE);
            last.effect = NO_EFFECT;
        }
        w.pt_effect(0xC, (b & 0x0F) << 2, flags);
    }

    if c == NO_EFFECT && last.effect == NO_EFFECT {
        return;
    }
    let (effect, param) = if c == NO_EFFECT {
        (last.effect, last.param)
    } else {
        (c >> 4, c & 0x0F)
    };
    match effect {
        // Portamento up/down, tone portamento, vibrato: these continue
        0 => w.pt_effect(0x1, param, flags),
        1 => w.pt_effect(0x2, param, flags),
        2 => w.pt_effect(0x3, param, flags),
        4 => w.pt_effect(0x4, param, flags),
        // Frequency adjust
        3 => {
            w.effect(opcodes::S3MEFFECTF, 0xF0 | param as u16);
            return;
        }
        5 => {
            if param != 0 {
                w.pt_effect(0xF, param, flags);
            } else if unis {
                warn!("669: super fast tempo is not supported");
            }
            return;
        }
        _ => return,
    }
    *last = SlideMemory { effect, param };
}

/// Composer 669 loader
#[derive(Debug, Default, Clone, Copy)]
pub struct Loader669;

impl ModuleLoader for Loader669 {
    fn name(&self) -> &'static str {
        "669"
    }

    fn description(&self) -> &'static str {
        "Composer 669, Unis 669"
    }

    fn identify(&self, data: &[u8]) -> bool {
        if data.len() < HEADER_SIZE {
            return false;
        }
        if &data[0..2] != MARKER_COMPOSER && &data[0..2] != MARKER_UNIS {
            return false;
        }
        if data[110] > MAX_SAMPLES || data[111] > MAX_PATTERNS || data[112] > 127 {
            return false;
        }
        let orders = &data[113..113 + NUM_ORDERS];
        let tempos = &data[113 + NUM_ORDERS..113 + 2 * NUM_ORDERS];
        let breaks = &data[113 + 2 * NUM_ORDERS..113 + 3 * NUM_ORDERS];
        orders.iter().all(|&o| o <= 0x7F || o == ORDER_END)
            && tempos.iter().all(|&t| t != 0 && t <= 32)
            && breaks.iter().all(|&b| b <= 0x3F)
    }

    fn load(&self, data: &[u8], options: &LoadOptions) -> Result<Module, LoadError> {
        if !self.identify(data) {
            return Err(LoadError::Unknown);
        }
        let mut s = open_stream(data, options);
        let h = read_header(&mut s).section("header")?;

        let mut m = Module::new();
        m.song_name = h.message[0].clone();
        m.comment = h.message.join("\n").trim_end().to_string();
        m.mod_type = if h.unis {
            "Extended 669".to_string()
        } else {
            "Composer 669".to_string()
        };
        m.num_chn = CHANNELS as u16;
        m.num_pat = h.num_patterns as u16;
        m.num_ins = h.num_samples as u16;
        m.num_smp = h.num_samples as u16;
        m.init_speed = 4;
        m.init_tempo = 78;
        for (ch, pan) in m.panning.iter_mut().take(CHANNELS).enumerate() {
            *pan = if ch & 1 != 0 { PAN_RIGHT } else { PAN_LEFT };
        }

        let positions: Vec<u16> = h
            .orders
            .iter()
            .take_while(|&&o| o != ORDER_END)
            .map(|&o| o as u16)
            .collect();
        if let Some(&bad) = positions.iter().find(|&&p| p >= m.num_pat) {
            return Err(LoadError::header(format!(
                "order refers to pattern {bad} of {}",
                m.num_pat
            )));
        }
        m.alloc_positions(positions.len())?;
        m.positions.copy_from_slice(&positions);
        m.rep_pos = if (h.loop_order as usize) < positions.len() {
            h.loop_order as u16
        } else {
            0
        };

        m.alloc_samples()?;
        for (i, q) in m.samples.iter_mut().enumerate() {
            q.name = s.read_string(13).section("sample header")?;
            q.length = s.read_u32_le().section("sample header")?;
            q.loop_start = s.read_u32_le().section("sample header")?;
            let loop_end = s.read_u32_le().section("sample header")?;
            q.loop_end = if loop_end >= LOOP_END_SENTINEL {
                warn!("669: sample {i} loop end {loop_end:#x} treated as no loop");
                0
            } else {
                loop_end
            };
            if q.loop_end > q.loop_start {
                q.flags |= SampleFlags::LOOP;
                q.fix_loop();
            }
        }

        m.alloc_patterns()?;
        m.alloc_tracks()?;

        let mut w = new_writer(options);
        let mut cells = vec![[0u8; 3]; ROWS * CHANNELS];
        for pat in 0..m.num_pat as usize {
            for cell in cells.iter_mut() {
                *cell = s.read_array::<3>().section("pattern")?;
            }
            for ch in 0..CHANNELS {
                let mut last = SlideMemory {
                    effect: NO_EFFECT,
                    param: 0,
                };
                w.reset();
                for row in 0..ROWS {
                    convert_cell(&mut w, cells[row * CHANNELS + ch], &mut last, h.unis);
                    if ch == 0 {
                        if row == 0 {
                            w.pt_effect(0xF, h.tempos[pat], Default::default());
                        }
                        if row == h.breaks[pat] as usize && row < ROWS - 1 {
                            w.pt_effect(0xD, 0, Default::default());
                        }
                    }
                    w.new_row();
                }
                let track = w
                    .finalize()
                    .map_err(|e| LoadError::pattern(pat, e.to_string()))?;
                m.tracks[pat * CHANNELS + ch] = Some(track);
            }
        }

        // 8-bit unsigned sample data follows the patterns
        let mut offset = s.pos();
        for q in m.samples.iter_mut() {
            q.seek_pos = offset;
            offset += q.length as u64;
        }

        debug!(
            "669 '{}': {} patterns, {} samples, {} positions",
            m.song_name, m.num_pat, m.num_smp, m.num_pos
        );
        Ok(m)
    }
}
