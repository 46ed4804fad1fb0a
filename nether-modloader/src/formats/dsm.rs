//! DSIK internal format (DSM) loader
//!
//! A RIFF container ("RIFF" len "DSMF") holding one SONG chunk followed by INST
//! (sample header + data) and PATT (packed pattern) chunks in any order. Unknown
//! chunks are skipped by length.

use std::sync::Arc;

use nether_unimod::{
    LAST_PATTERN, Module, ModuleFlags, ModuleStream, PAN_SURROUND, SampleFlags, UniError,
    UniWriter, opcodes,
};
use tracing::{debug, warn};

use crate::error::{Context, LoadError};
use crate::{LoadOptions, ModuleLoader, new_writer, open_stream};

const RIFF_MAGIC: &[u8; 4] = b"RIFF";
const DSM_MAGIC: &[u8; 4] = b"DSMF";
const SONG_ID: &[u8; 4] = b"SONG";
const INST_ID: &[u8; 4] = b"INST";
const PATT_ID: &[u8; 4] = b"PATT";

const DSM_CHANNELS: usize = 16;
const DSM_ROWS: usize = 64;
const NUM_ORDERS: usize = 128;
const MAX_SAMPLES: usize = 255;
const MAX_PATTERNS: usize = 255;

const ORDER_SKIP: u8 = 254;
const ORDER_END: u8 = 255;

/// Surround marker in the panning table and in the 8xx parameter
const SURROUND: u8 = 0xA4;

#[derive(Debug, Clone)]
struct DsmSong {
    name: String,
    num_ord: u16,
    num_smp: u16,
    num_pat: u16,
    global_vol: u8,
    speed: u8,
    bpm: u8,
    pan_pos: [u8; DSM_CHANNELS],
    orders: [u8; NUM_ORDERS],
}

fn read_song(s: &mut ModuleStream) -> Result<DsmSong, UniError> {
    let name = s.read_string(28)?;
    // Version, flags, reserved
    s.skip(8)?;
    let num_ord = s.read_u16_le()?;
    let num_smp = s.read_u16_le()?;
    let num_pat = s.read_u16_le()?;
    // Track count
    s.skip(2)?;
    let global_vol = s.read_u8()?;
    // Master volume
    s.skip(1)?;
    Ok(DsmSong {
        name,
        num_ord,
        num_smp,
        num_pat,
        global_vol,
        speed: s.read_u8()?,
        bpm: s.read_u8()?,
        pan_pos: s.read_array()?,
        orders: s.read_array()?,
    })
}

/// Chunk id and the byte range of its body
#[derive(Debug, Clone, Copy)]
struct Chunk {
    id: [u8; 4],
    start: u64,
    len: u64,
}

/// Walk the chunks following the RIFF header; a chunk running past the end stops the walk
fn read_chunks(s: &mut ModuleStream) -> Result<Vec<Chunk>, UniError> {
    let mut chunks = Vec::new();
    s.seek_to(12)?;
    while s.remaining() >= 8 {
        let id = s.read_array::<4>()?;
        let len = s.read_u32_le()? as u64;
        let start = s.pos();
        chunks.push(Chunk { id, start, len });
        s.skip(len)?;
    }
    Ok(chunks)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DsmNote {
    note: u8,
    ins: u8,
    vol: u8,
    cmd: u8,
    inf: u8,
}

impl DsmNote {
    const EMPTY: Self = Self {
        note: 255,
        ins: 255,
        vol: 255,
        cmd: 255,
        inf: 255,
    };
}

/// One flag byte per cell: low nibble channel, high bits select note, instrument,
/// volume and command; a zero flag ends the row
fn read_pattern(s: &mut ModuleStream, cells: &mut [DsmNote]) -> Result<(), UniError> {
    cells.fill(DsmNote::EMPTY);
    // Packed length, bounded by the chunk instead
    s.skip(2)?;
    let mut row = 0;
    while row < DSM_ROWS {
        let flag = s.read_u8()?;
        if flag == 0 {
            row += 1;
            continue;
        }
        let n = &mut cells[(flag & 0x0F) as usize * DSM_ROWS + row];
        if flag & 0x80 != 0 {
            n.note = s.read_u8()?;
        }
        if flag & 0x40 != 0 {
            n.ins = s.read_u8()?;
        }
        if flag & 0x20 != 0 {
            n.vol = s.read_u8()?;
        }
        if flag & 0x10 != 0 {
            n.cmd = s.read_u8()?;
            n.inf = s.read_u8()?;
        }
    }
    Ok(())
}

fn convert_track(w: &mut UniWriter, cells: &[DsmNote]) -> Result<Arc<[u8]>, UniError> {
    let flags = ModuleFlags::empty();
    w.reset();
    for n in cells {
        if n.ins != 0 && n.ins != 255 {
            w.instrument(n.ins - 1);
        }
        if n.note != 255 && n.note != 0 {
            w.note(n.note - 1);
        }
        if n.vol < 65 {
            w.pt_effect(0xC, n.vol, flags);
        }
        if n.cmd != 255 {
            match n.cmd {
                0x8 if n.inf == SURROUND => w.effect(opcodes::ITEFFECTS0, 0x91),
                0x8 if n.inf <= 0x80 => {
                    let pan = if n.inf < 0x80 { n.inf << 1 } else { 255 };
                    w.pt_effect(0x8, pan, flags);
                }
                0x8 => {}
                0xB if n.inf <= 0x7F => w.pt_effect(0xB, n.inf, flags),
                0xB => {}
                // Break rows are decimal
                0xD => w.pt_effect(0xD, (n.inf >> 4) * 10 + (n.inf & 0x0F), flags),
                cmd => w.pt_effect(cmd, n.inf, flags),
            }
        }
        w.new_row();
    }
    w.finalize()
}

/// DSIK loader
#[derive(Debug, Default, Clone, Copy)]
pub struct DsmLoader;

impl ModuleLoader for DsmLoader {
    fn name(&self) -> &'static str {
        "DSM"
    }

    fn description(&self) -> &'static str {
        "DSIK internal format"
    }

    fn identify(&self, data: &[u8]) -> bool {
        data.len() >= 12 && data.starts_with(RIFF_MAGIC) && &data[8..12] == DSM_MAGIC
    }

    fn load(&self, data: &[u8], options: &LoadOptions) -> Result<Module, LoadError> {
        if !self.identify(data) {
            return Err(LoadError::Unknown);
        }
        let mut s = open_stream(data, options);
        let chunks = read_chunks(&mut s).section("chunks")?;

        let song_chunk = chunks
            .iter()
            .find(|c| &c.id == SONG_ID)
            .ok_or_else(|| LoadError::header("no SONG chunk"))?;
        s.seek_to(song_chunk.start).section("song")?;
        let song = read_song(&mut s).section("song")?;

        if song.num_smp as usize > MAX_SAMPLES {
            return Err(LoadError::limit("samples", song.num_smp as usize, MAX_SAMPLES));
        }
        if song.num_pat as usize > MAX_PATTERNS {
            return Err(LoadError::limit("patterns", song.num_pat as usize, MAX_PATTERNS));
        }
        if song.num_ord as usize > NUM_ORDERS {
            return Err(LoadError::limit("orders", song.num_ord as usize, NUM_ORDERS));
        }

        let mut m = Module::new();
        m.song_name = song.name.clone();
        m.mod_type = "DSIK DSM-format".to_string();
        m.flags = ModuleFlags::PANNING;
        m.num_chn = DSM_CHANNELS as u16;
        m.num_pat = song.num_pat;
        m.num_ins = song.num_smp;
        m.num_smp = song.num_smp;
        m.init_speed = song.speed.max(1);
        m.init_tempo = song.bpm as u16;
        m.init_volume = song.global_vol.min(64) << 1;
        for (pan, &p) in m.panning.iter_mut().zip(song.pan_pos.iter()) {
            *pan = if p == SURROUND {
                PAN_SURROUND
            } else {
                ((p & 0x7F) as u16) << 1
            };
        }

        let mut positions = Vec::with_capacity(song.num_ord as usize);
        for &order in &song.orders[..song.num_ord as usize] {
            match order {
                ORDER_SKIP => {}
                ORDER_END => positions.push(LAST_PATTERN),
                o if (o as u16) < song.num_pat => positions.push(o as u16),
                o => return Err(LoadError::header(format!("order refers to pattern {o}"))),
            }
        }
        m.alloc_positions(positions.len())?;
        m.positions.copy_from_slice(&positions);

        let inst_chunks: Vec<&Chunk> = chunks.iter().filter(|c| &c.id == INST_ID).collect();
        let patt_chunks: Vec<&Chunk> = chunks.iter().filter(|c| &c.id == PATT_ID).collect();
        if inst_chunks.len() < m.num_smp as usize {
            return Err(LoadError::Truncated("sample chunks"));
        }
        if patt_chunks.len() < m.num_pat as usize {
            return Err(LoadError::Truncated("pattern chunks"));
        }

        m.alloc_samples()?;
        for (q, chunk) in m.samples.iter_mut().zip(inst_chunks) {
            let section = "sample header";
            s.seek_to(chunk.start).section(section)?;
            // DOS filename
            s.skip(13).section(section)?;
            let flags = s.read_u16_le().section(section)?;
            q.volume = s.read_u8().section(section)?.min(64);
            q.length = s.read_u32_le().section(section)?;
            q.loop_start = s.read_u32_le().section(section)?;
            // Kept as stored: DSM has no loop end sentinel
            q.loop_end = s.read_u32_le().section(section)?;
            // Reserved
            s.skip(4).section(section)?;
            q.speed = s.read_u16_le().section(section)? as u32;
            // Period
            s.skip(2).section(section)?;
            q.name = s.read_string(28).section(section)?;
            q.seek_pos = s.pos();

            if flags & 0x01 != 0 && q.loop_start < q.loop_end {
                if q.loop_end <= q.length {
                    q.flags |= SampleFlags::LOOP;
                } else {
                    warn!(
                        "dsm: sample '{}' loop end {} past length {}, loop disabled",
                        q.name, q.loop_end, q.length
                    );
                }
            }
            if flags & 0x02 != 0 {
                q.flags |= SampleFlags::SIGNED;
            }
        }

        m.alloc_patterns()?;
        m.alloc_tracks()?;
        let mut w = new_writer(options);
        let mut cells = vec![DsmNote::EMPTY; DSM_CHANNELS * DSM_ROWS];
        for (pat, chunk) in patt_chunks.into_iter().take(m.num_pat as usize).enumerate() {
            let body = s
                .peek_at(chunk.start, chunk.len as usize)
                .ok_or(LoadError::Truncated("pattern"))?;
            let mut p = ModuleStream::new(body);
            read_pattern(&mut p, &mut cells)
                .map_err(|e| LoadError::pattern(pat, e.to_string()))?;
            for ch in 0..DSM_CHANNELS {
                let track = convert_track(&mut w, &cells[ch * DSM_ROWS..(ch + 1) * DSM_ROWS])
                    .map_err(|e| LoadError::pattern(pat, e.to_string()))?;
                m.tracks[pat * DSM_CHANNELS + ch] = Some(track);
            }
        }

        debug!(
            "DSM '{}': {} patterns, {} samples, {} positions",
            m.song_name, m.num_pat, m.num_smp, m.num_pos
        );
        Ok(m)
    }
}
