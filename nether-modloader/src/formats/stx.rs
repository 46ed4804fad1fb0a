//! Scream Tracker Music Interface Kit (STX) loader
//!
//! STX files carry Scream Tracker 2 songs in S3M-style packed patterns, with the
//! S3M sample header layout but a different main header and order list.

use nether_unimod::{Module, ModuleFlags, ModuleStream, UniError};
use tracing::debug;

use super::s3m::{S3M_ROWS, S3mNote, convert_track, read_pattern, read_sample};
use crate::error::{Context, LoadError};
use crate::remap::ChannelRemap;
use crate::s3mit::{CmdFlags, CommandTranslator, OrderList};
use crate::{LoadOptions, ModuleLoader, new_writer, open_stream};

/// "SCRM" at offset 0x3C
const STX_MAGIC: &[u8; 4] = b"SCRM";

/// Tracker tags found at offset 0x14
const TRACKER_TAGS: [&[u8; 8]; 3] = [b"!Scream!", b"BMOD2STM", b"WUZAMOD!"];

const HEADER_SIZE: usize = 0x40;
const STX_CHANNELS: usize = 4;
const MAX_PATTERNS: usize = 64;
const MAX_INSTRUMENTS: usize = 31;
const MAX_ORDERS: usize = 256;

/// Bytes per order list entry (pattern number + 4 unused)
const ORDER_ENTRY_SIZE: u64 = 5;

#[derive(Debug, Clone)]
struct StxHeader {
    song_name: String,
    pattern_ptr: u16,
    instrument_ptr: u16,
    channel_ptr: u16,
    initial_speed: u8,
    pat_num: u16,
    ins_num: u16,
    ord_num: u16,
}

fn read_header(s: &mut ModuleStream) -> Result<StxHeader, UniError> {
    let song_name = s.read_string(20)?;
    // Tracker tag, pattern size, unknown
    s.skip(12)?;
    let pattern_ptr = s.read_u16_le()?;
    let instrument_ptr = s.read_u16_le()?;
    let channel_ptr = s.read_u16_le()?;
    // Two unknown words, master multiplier
    s.skip(5)?;
    let initial_speed = s.read_u8()?;
    s.skip(4)?;
    let pat_num = s.read_u16_le()?;
    let ins_num = s.read_u16_le()?;
    let ord_num = s.read_u16_le()?;

    Ok(StxHeader {
        song_name,
        pattern_ptr,
        instrument_ptr,
        channel_ptr,
        initial_speed,
        pat_num,
        ins_num,
        ord_num,
    })
}

/// STMIK loader
#[derive(Debug, Default, Clone, Copy)]
pub struct StxLoader;

impl ModuleLoader for StxLoader {
    fn name(&self) -> &'static str {
        "STX"
    }

    fn description(&self) -> &'static str {
        "Scream Tracker Music Interface Kit"
    }

    fn identify(&self, data: &[u8]) -> bool {
        if data.len() < HEADER_SIZE || &data[0x3C..0x40] != STX_MAGIC {
            return false;
        }
        TRACKER_TAGS.iter().any(|tag| &data[0x14..0x1C] == *tag)
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
        if h.ins_num as usize > MAX_INSTRUMENTS {
            return Err(LoadError::limit(
                "instruments",
                h.ins_num as usize,
                MAX_INSTRUMENTS,
            ));
        }
        if h.ord_num as usize > MAX_ORDERS {
            return Err(LoadError::limit("orders", h.ord_num as usize, MAX_ORDERS));
        }

        let mut m = Module::new();
        m.song_name = h.song_name.clone();
        m.mod_type = "STM2STX 1.x".to_string();
        m.num_chn = STX_CHANNELS as u16;
        m.num_pat = h.pat_num;
        m.num_ins = h.ins_num;
        m.num_smp = h.ins_num;
        // Scream Tracker 2 keeps the speed in the high nibble
        m.init_speed = if h.initial_speed >= 0x10 {
            h.initial_speed >> 4
        } else {
            h.initial_speed
        }
        .max(1);
        m.init_tempo = 125;
        m.flags = ModuleFlags::S3MSLIDES;
        for (ch, pan) in m.panning.iter_mut().take(STX_CHANNELS).enumerate() {
            *pan = if matches!(ch, 0 | 3) { 0x30 } else { 0xC0 };
        }

        // Parapointer tables
        s.seek_to((h.pattern_ptr as u64) << 4).section("parapointers")?;
        let pat_para = s.read_u16_le_vec(h.pat_num as usize).section("parapointers")?;
        s.seek_to((h.instrument_ptr as u64) << 4).section("parapointers")?;
        let ins_para = s.read_u16_le_vec(h.ins_num as usize).section("parapointers")?;

        // Order list: 5-byte entries after the 32-byte channel table, ended by the
        // first reference to a missing pattern
        s.seek_to(((h.channel_ptr as u64) << 4) + 32).section("orders")?;
        let mut orders = Vec::with_capacity(h.ord_num as usize);
        for _ in 0..h.ord_num {
            let order = s.read_u8().section("orders")?;
            s.skip(ORDER_ENTRY_SIZE - 1).section("orders")?;
            if order as u16 >= h.pat_num {
                break;
            }
            orders.push(order);
        }
        m.alloc_positions(orders.len())?;
        let orders = OrderList::new(orders, options.curious);

        m.alloc_samples()?;
        for (i, &p) in ins_para.iter().enumerate() {
            s.seek_to((p as u64) << 4).section("sample header")?;
            read_sample(&mut s, &mut m, i, 1).section("sample header")?;
        }

        m.alloc_patterns()?;
        m.alloc_tracks()?;

        let mut remap = ChannelRemap::new();
        for ch in 0..STX_CHANNELS {
            remap.mark(ch);
        }
        remap.build();

        let mut translator = CommandTranslator::new(
            CmdFlags::OLDSTYLE | CmdFlags::SCREAM,
            m.flags,
            orders,
        );
        let mut w = new_writer(options);
        let mut buf = vec![S3mNote::EMPTY; S3M_ROWS * STX_CHANNELS];

        for (pat, &p) in pat_para.iter().enumerate() {
            s.seek_to(((p as u64) << 4) + 2).section("pattern")?;
            read_pattern(&mut s, &remap, &mut buf).section("pattern")?;
            for ch in 0..STX_CHANNELS {
                let track = convert_track(
                    &mut w,
                    &mut translator,
                    &buf[ch * S3M_ROWS..(ch + 1) * S3M_ROWS],
                )
                .map_err(|e| LoadError::pattern(pat, e.to_string()))?;
                m.tracks[pat * STX_CHANNELS + ch] = Some(track);
            }
        }

        translator.orders.apply(&mut m);
        debug!(
            "STX '{}': {} patterns, {} samples, {} positions",
            m.song_name, m.num_pat, m.num_smp, m.num_pos
        );
        Ok(m)
    }
}
