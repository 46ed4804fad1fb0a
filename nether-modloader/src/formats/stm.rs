//! Scream Tracker 2 (STM) loader

use nether_unimod::{
    Module, ModuleFlags, ModuleStream, OCTAVE, PAN_LEFT, PAN_RIGHT, SampleFlags, UniError,
    UniWriter, opcodes,
};
use tracing::debug;

use crate::error::{Context, LoadError};
use crate::{LoadOptions, ModuleLoader, new_writer, open_stream};

/// Tracker tags found at offset 0x14
const TRACKER_TAGS: [(&[u8; 8], &str); 3] = [
    (b"!Scream!", "Scream Tracker"),
    (b"BMOD2STM", "BMOD2STM"),
    (b"WUZAMOD!", "Wuzamod"),
];

/// File type byte for songs (2 = module, 1 = song without samples)
const FILETYPE_MODULE: u8 = 2;

const HEADER_SIZE: usize = 48;
const NUM_SAMPLES: usize = 31;
const SAMPLE_HEADER_SIZE: usize = 32;
const NUM_ORDERS: usize = 128;
const STM_CHANNELS: usize = 4;
const STM_ROWS: usize = 64;
const MAX_PATTERNS: usize = 64;

/// Note byte values with special meaning
const NOTE_EMPTY: u8 = 251;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StmNote {
    note: u8,
    ins_vol: u8,
    vol_cmd: u8,
    cmd_inf: u8,
}

#[derive(Debug, Clone)]
struct StmHeader {
    song_name: String,
    tracker: &'static str,
    ver_major: u8,
    ver_minor: u8,
    tempo: u8,
    pat_num: u8,
    global_volume: u8,
}

fn read_header(s: &mut ModuleStream) -> Result<StmHeader, UniError> {
    let song_name = s.read_string(20)?;
    let tag = s.read_array::<8>()?;
    let tracker = TRACKER_TAGS
        .iter()
        .find(|(t, _)| **t == tag)
        .map_or("Unknown", |(_, name)| *name);
    // 0x1A, file type
    s.skip(2)?;
    let ver_major = s.read_u8()?;
    let ver_minor = s.read_u8()?;
    let tempo = s.read_u8()?;
    let pat_num = s.read_u8()?;
    let global_volume = s.read_u8()?;
    s.skip(13)?;
    Ok(StmHeader {
        song_name,
        tracker,
        ver_major,
        ver_minor,
        tempo,
        pat_num,
        global_volume,
    })
}

/// Scream Tracker 2 effect letters (A=1 .. J=10)
fn convert_effect(w: &mut UniWriter, cmd: u8, inf: u8, flags: ModuleFlags) {
    match cmd {
        // Axx speed, kept in the high nibble
        1 => w.pt_effect(0xF, inf >> 4, flags),
        2 => w.pt_effect(0xB, inf, flags),
        // Cxx break, parameter written in decimal
        3 => w.pt_effect(0xD, (inf >> 4) * 10 + (inf & 0x0F), flags),
        4 => w.effect(opcodes::S3MEFFECTD, inf as u16),
        5 => w.effect(opcodes::S3MEFFECTE, inf as u16),
        6 => w.effect(opcodes::S3MEFFECTF, inf as u16),
        7 => w.pt_effect(0x3, inf, flags),
        8 => w.pt_effect(0x4, inf, flags),
        9 => w.effect(opcodes::S3MEFFECTI, inf as u16),
        0 | 10 if inf != 0 => w.pt_effect(0x0, inf, flags),
        // K and L exist in the file format but Scream Tracker 2 never plays them
        11 => {
            w.pt_effect(0x4, 0, flags);
            w.effect(opcodes::S3MEFFECTD, inf as u16);
        }
        12 => {
            w.pt_effect(0x3, 0, flags);
            w.effect(opcodes::S3MEFFECTD, inf as u16);
        }
        _ => {}
    }
}

fn convert_note(w: &mut UniWriter, n: &StmNote, flags: ModuleFlags) {
    let ins = n.ins_vol >> 3;
    let vol = (n.ins_vol & 7) + ((n.vol_cmd & 0xF0) >> 1);
    let cmd = n.vol_cmd & 0x0F;
    let mut cut = false;

    if ins != 0 && ins < 32 {
        w.instrument(ins - 1);
    }
    match n.note {
        252 | 254 => {
            w.pt_effect(0xC, 0, flags);
            cut = true;
        }
        note if note < NOTE_EMPTY => w.note(((note >> 4) + 2) * OCTAVE + (note & 0x0F)),
        _ => {}
    }
    if !cut && vol <= 64 {
        w.pt_effect(0xC, vol, flags);
    }
    convert_effect(w, cmd, n.cmd_inf, flags);
}

/// Scream Tracker 2 loader
#[derive(Debug, Default, Clone, Copy)]
pub struct StmLoader;

impl ModuleLoader for StmLoader {
    fn name(&self) -> &'static str {
        "STM"
    }

    fn description(&self) -> &'static str {
        "Scream Tracker 2"
    }

    fn identify(&self, data: &[u8]) -> bool {
        if data.len() < 0x40 || data[29] != FILETYPE_MODULE {
            return false;
        }
        // STX files share the tag but carry SCRM at 0x3C
        if &data[0x3C..0x40] == b"SCRM" {
            return false;
        }
        TRACKER_TAGS.iter().any(|(tag, _)| &data[20..28] == *tag)
    }

    fn load(&self, data: &[u8], options: &LoadOptions) -> Result<Module, LoadError> {
        if !self.identify(data) {
            return Err(LoadError::Unknown);
        }
        let mut s = open_stream(data, options);
        let h = read_header(&mut s).section("header")?;
        if h.pat_num as usize > MAX_PATTERNS {
            return Err(LoadError::limit("patterns", h.pat_num as usize, MAX_PATTERNS));
        }

        let mut m = Module::new();
        m.song_name = h.song_name.clone();
        m.mod_type = if h.tracker == "Scream Tracker" {
            format!("Scream Tracker {}.{:02}", h.ver_major, h.ver_minor)
        } else {
            format!("{} (STM format)", h.tracker)
        };
        m.num_chn = STM_CHANNELS as u16;
        m.num_pat = h.pat_num as u16;
        m.num_ins = NUM_SAMPLES as u16;
        m.num_smp = NUM_SAMPLES as u16;
        m.init_volume = (h.global_volume as u16 * 2).min(128) as u8;
        m.flags = ModuleFlags::S3MSLIDES;

        // Before 2.21 the tempo byte was written in decimal
        let tempo = if h.ver_major == 2 && h.ver_minor < 21 {
            ((h.tempo / 10) << 4) + h.tempo % 10
        } else {
            h.tempo
        };
        m.init_speed = (tempo >> 4).max(1);
        m.init_tempo = 125;
        for (ch, pan) in m.panning.iter_mut().take(STM_CHANNELS).enumerate() {
            *pan = if (ch + 1) & 2 != 0 { PAN_RIGHT } else { PAN_LEFT };
        }

        // Orders live after the sample headers; read them first for allocation order
        s.seek_to((HEADER_SIZE + NUM_SAMPLES * SAMPLE_HEADER_SIZE) as u64)
            .section("orders")?;
        let raw_orders = s.read_slice(NUM_ORDERS).section("orders")?;
        let positions: Vec<u16> = raw_orders
            .iter()
            .take_while(|&&o| o < h.pat_num)
            .map(|&o| o as u16)
            .collect();
        m.alloc_positions(positions.len())?;
        m.positions.copy_from_slice(&positions);

        s.seek_to(HEADER_SIZE as u64).section("sample header")?;
        m.alloc_samples()?;
        for q in m.samples.iter_mut() {
            let name = s.read_string(12).section("sample header")?;
            // Unused, instrument disk
            s.skip(2).section("sample header")?;
            let paragraph = s.read_u16_le().section("sample header")?;
            let length = s.read_u16_le().section("sample header")?;
            let loop_start = s.read_u16_le().section("sample header")?;
            let loop_end = s.read_u16_le().section("sample header")?;
            let volume = s.read_u8().section("sample header")?;
            s.skip(1).section("sample header")?;
            let c2spd = s.read_u16_le().section("sample header")?;
            s.skip(6).section("sample header")?;

            q.name = name;
            q.length = length as u32;
            q.loop_start = loop_start as u32;
            q.loop_end = loop_end as u32;
            q.volume = volume.min(64);
            q.speed = c2spd as u32;
            q.seek_pos = (paragraph as u64) << 4;
            q.flags = SampleFlags::SIGNED;
            if loop_end != 0 && loop_end != 0xFFFF {
                q.flags |= SampleFlags::LOOP;
                q.fix_loop();
            }
        }

        m.alloc_patterns()?;
        m.alloc_tracks()?;

        s.seek_to((HEADER_SIZE + NUM_SAMPLES * SAMPLE_HEADER_SIZE + NUM_ORDERS) as u64)
            .section("pattern")?;
        let mut w = new_writer(options);
        let mut buf = vec![
            StmNote {
                note: NOTE_EMPTY,
                ins_vol: 0,
                vol_cmd: 0,
                cmd_inf: 0
            };
            STM_ROWS * STM_CHANNELS
        ];

        for pat in 0..m.num_pat as usize {
            // Row-major on disk
            for n in buf.iter_mut() {
                let cell = s.read_array::<4>().section("pattern")?;
                *n = StmNote {
                    note: cell[0],
                    ins_vol: cell[1],
                    vol_cmd: cell[2],
                    cmd_inf: cell[3],
                };
            }
            for ch in 0..STM_CHANNELS {
                w.reset();
                for row in 0..STM_ROWS {
                    convert_note(&mut w, &buf[row * STM_CHANNELS + ch], m.flags);
                    w.new_row();
                }
                let track = w
                    .finalize()
                    .map_err(|e| LoadError::pattern(pat, e.to_string()))?;
                m.tracks[pat * STM_CHANNELS + ch] = Some(track);
            }
        }

        debug!(
            "STM '{}': {} patterns, {} positions",
            m.song_name, m.num_pat, m.num_pos
        );
        Ok(m)
    }
}
