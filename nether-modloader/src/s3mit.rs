//! Effect translation shared by the Scream Tracker 3 family (S3M, IT, and formats
//! that reuse S3M command letters)

use bitflags::bitflags;
use nether_unimod::{LAST_PATTERN, Module, ModuleFlags, UniWriter, opcodes};
use tracing::debug;

bitflags! {
    /// Command interpretation variants
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct CmdFlags: u8 {
        /// Scream Tracker semantics for G/H/I/U/X and decimal pattern breaks
        const OLDSTYLE = 0x01;
        /// Impulse Tracker file (pattern breaks are never decimal)
        const IT = 0x02;
        /// Written by Scream Tracker itself (no SAx high offset)
        const SCREAM = 0x04;
    }
}

/// Order list value for a skipped ("+++") entry
pub(crate) const ORDER_SKIP: u8 = 254;
/// Order list value for the end marker ("---")
pub(crate) const ORDER_END: u8 = 255;

/// Order list with a lookup from file order index to output position
#[derive(Debug, Clone)]
pub(crate) struct OrderList {
    original: Vec<u8>,
    lookup: Vec<Option<u16>>,
    positions: Vec<u16>,
    num_pos: usize,
}

impl OrderList {
    /// Build from raw order bytes; `curious` keeps going past one end marker
    pub fn new(original: Vec<u8>, curious: bool) -> Self {
        let mut list = Self {
            lookup: vec![None; original.len()],
            positions: vec![0; original.len()],
            original,
            num_pos: 0,
        };
        list.create(curious);
        list
    }

    fn create(&mut self, curious: bool) {
        let mut ends_to_skip = u32::from(curious);
        self.num_pos = 0;
        self.positions.fill(0);
        self.lookup.fill(None);

        for (index, &order) in self.original.iter().enumerate() {
            let value = if order == ORDER_END {
                LAST_PATTERN
            } else {
                order as u16
            };
            self.positions[self.num_pos] = value;
            self.lookup[index] = Some(self.num_pos as u16);
            if order < ORDER_SKIP {
                self.num_pos += 1;
            } else if order == ORDER_END {
                if ends_to_skip == 0 {
                    break;
                }
                ends_to_skip -= 1;
            }
        }
    }

    /// Output position of file order index `index`
    pub fn lookup(&self, index: usize) -> Option<u16> {
        self.lookup.get(index).copied().flatten()
    }

    /// Raw order value at `index`
    pub fn original(&self, index: usize) -> Option<u8> {
        self.original.get(index).copied()
    }

    /// Positions in song order
    pub fn positions(&self) -> &[u16] {
        &self.positions[..self.num_pos]
    }

    /// Store the order list in the module (positions must already be allocated)
    pub fn apply(&self, module: &mut Module) {
        module.positions = self.positions().to_vec();
        module.num_pos = self.num_pos as u16;
    }
}

/// Resonant filter kinds carried by ITEFFECTZ
pub(crate) const FILT_CUT: u8 = 0x80;
pub(crate) const FILT_RESONANT: u8 = 0x81;

/// Number of SFx parametered macros
const NUM_MACROS: usize = 16;

/// MIDI macro state for the IT Zxx command
#[derive(Debug, Clone)]
pub(crate) struct FilterMacros {
    macros: [u8; NUM_MACROS],
    settings: [(u8, u8); 256],
    active: u8,
}

impl Default for FilterMacros {
    /// Impulse Tracker's default configuration: Z00-Z7F cutoff, Z80-Z8F resonance
    fn default() -> Self {
        let mut f = Self {
            macros: [0; NUM_MACROS],
            settings: [(0, 0); 256],
            active: 0,
        };
        f.macros[0] = FILT_CUT;
        for i in 0x80..0x90 {
            f.settings[i] = (FILT_RESONANT, ((i & 0x7F) << 3) as u8);
        }
        f.reset_parametered();
        f
    }
}

impl FilterMacros {
    /// Parse an embedded MIDI configuration block (global, SFx and Zxx macros)
    pub fn from_midi_config(sfx: &[[u8; 32]], zxx: &[[u8; 32]]) -> Self {
        let mut f = Self {
            macros: [0; NUM_MACROS],
            settings: [(0, 0); 256],
            active: 0,
        };
        for (slot, line) in f.macros.iter_mut().zip(sfx) {
            if let Some(kind) = filter_kind(line) {
                *slot = kind;
            }
        }
        for (i, line) in zxx.iter().enumerate().take(0x80) {
            if let Some(kind) = filter_kind(line)
                && let Some(value) = hex_byte(line[6], line[7])
            {
                f.settings[0x80 + i] = (kind, value);
            }
        }
        f.reset_parametered();
        f
    }

    fn reset_parametered(&mut self) {
        let filter = self.macros[self.active as usize];
        for (i, setting) in self.settings.iter_mut().enumerate().take(0x80) {
            *setting = (filter, i as u8);
        }
    }

    /// SFx: select the macro used by Z00-Z7F
    fn select(&mut self, macro_index: u8) {
        if macro_index != self.active {
            self.active = macro_index;
            let filter = self.macros[macro_index as usize];
            for setting in self.settings.iter_mut().take(0x80) {
                setting.0 = filter;
            }
        }
    }
}

/// `F0F00x`: cutoff (x = 0) or resonance (x = 1)
fn filter_kind(line: &[u8; 32]) -> Option<u8> {
    if &line[..5] != b"F0F00" {
        return None;
    }
    match line[5] {
        b'0' => Some(FILT_CUT),
        b'1' => Some(FILT_RESONANT),
        _ => None,
    }
}

fn hex_byte(hi: u8, lo: u8) -> Option<u8> {
    let digit = |c: u8| (c as char).to_digit(16).map(|d| d as u8);
    Some(digit(hi)? << 4 | digit(lo)?)
}

/// Translates S3M/IT command letters (A=1 .. Z=26) into unified effects
#[derive(Debug)]
pub(crate) struct CommandTranslator {
    pub flags: CmdFlags,
    pub module_flags: ModuleFlags,
    pub orders: OrderList,
    pub filters: Option<FilterMacros>,
}

impl CommandTranslator {
    pub fn new(flags: CmdFlags, module_flags: ModuleFlags, orders: OrderList) -> Self {
        Self {
            flags,
            module_flags,
            orders,
            filters: None,
        }
    }

    fn old_style(&self) -> bool {
        self.flags.contains(CmdFlags::OLDSTYLE)
    }

    /// Emit the unified form of command `cmd` with parameter `inf`
    ///
    /// Command 255 (and 0) mean "no command".
    pub fn process(&mut self, w: &mut UniWriter, cmd: u8, inf: u8) {
        let lo = inf & 0x0F;
        let mf = self.module_flags;

        match cmd {
            // Axx set speed
            1 => w.effect(opcodes::S3MEFFECTA, inf as u16),
            // Bxx position jump
            2 => {
                let index = inf as usize;
                if let Some(order) = self.orders.original(index) {
                    if self.orders.lookup(index).is_none() && order != ORDER_END {
                        debug!("jump to hidden order {index}, rebuilding order list");
                        self.orders.create(true);
                    }
                    if let Some(pos) = self.orders.lookup(index) {
                        w.pt_effect(0xB, pos as u8, mf);
                    }
                }
            }
            // Cxx pattern break
            3 => {
                if self.old_style() && !self.flags.contains(CmdFlags::IT) {
                    w.pt_effect(0xD, (inf >> 4) * 10 + lo, mf);
                } else {
                    w.pt_effect(0xD, inf, mf);
                }
            }
            // Dxy volume slide
            4 => w.effect(opcodes::S3MEFFECTD, inf as u16),
            // Exy slide down
            5 => w.effect(opcodes::S3MEFFECTE, inf as u16),
            // Fxy slide up
            6 => w.effect(opcodes::S3MEFFECTF, inf as u16),
            // Gxx tone portamento
            7 => {
                if self.old_style() {
                    w.pt_effect(0x3, inf, mf);
                } else {
                    w.effect(opcodes::ITEFFECTG, inf as u16);
                }
            }
            // Hxy vibrato
            8 => {
                if self.old_style() {
                    w.pt_effect(0x4, inf, mf);
                } else {
                    w.effect(opcodes::ITEFFECTH, inf as u16);
                }
            }
            // Ixy tremor
            9 => {
                if self.old_style() {
                    w.effect(opcodes::S3MEFFECTI, inf as u16);
                } else {
                    w.effect(opcodes::ITEFFECTI, inf as u16);
                }
            }
            // Jxy arpeggio
            0x0A => w.pt_effect(0x0, inf, mf),
            // Kxy vibrato + volume slide
            0x0B => {
                if self.old_style() {
                    w.pt_effect(0x4, 0, mf);
                } else {
                    w.effect(opcodes::ITEFFECTH, 0);
                }
                w.effect(opcodes::S3MEFFECTD, inf as u16);
            }
            // Lxy tone portamento + volume slide
            0x0C => {
                if self.old_style() {
                    w.pt_effect(0x3, 0, mf);
                } else {
                    w.effect(opcodes::ITEFFECTG, 0);
                }
                w.effect(opcodes::S3MEFFECTD, inf as u16);
            }
            // Mxx channel volume
            0x0D => w.effect(opcodes::ITEFFECTM, inf as u16),
            // Nxy channel volume slide
            0x0E => w.effect(opcodes::ITEFFECTN, inf as u16),
            // Oxx sample offset
            0x0F => w.pt_effect(0x9, inf, mf),
            // Pxy panning slide
            0x10 => w.effect(opcodes::ITEFFECTP, inf as u16),
            // Qxy retrig
            0x11 => {
                let param = if inf != 0 && lo == 0 && !self.old_style() {
                    1
                } else {
                    inf
                };
                w.effect(opcodes::S3MEFFECTQ, param as u16);
            }
            // Rxy tremolo
            0x12 => w.effect(opcodes::S3MEFFECTR, inf as u16),
            // Sxx special
            0x13 => {
                if inf >= 0xF0 {
                    if let Some(filters) = &mut self.filters {
                        filters.select(lo);
                    }
                } else if !(self.flags.contains(CmdFlags::SCREAM) && inf & 0xF0 == 0xA0) {
                    w.effect(opcodes::ITEFFECTS0, inf as u16);
                }
            }
            // Txx tempo / tempo slide
            0x14 => {
                if inf >= 0x20 {
                    w.effect(opcodes::S3MEFFECTT, inf as u16);
                } else if !self.old_style() {
                    w.effect(opcodes::ITEFFECTT, inf as u16);
                }
            }
            // Uxy fine vibrato
            0x15 => {
                if self.old_style() {
                    w.effect(opcodes::S3MEFFECTU, inf as u16);
                } else {
                    w.effect(opcodes::ITEFFECTU, inf as u16);
                }
            }
            // Vxx global volume
            0x16 => w.effect(opcodes::XMEFFECTG, inf as u16),
            // Wxy global volume slide
            0x17 => w.effect(opcodes::ITEFFECTW, inf as u16),
            // Xxx set panning
            0x18 => {
                if self.old_style() {
                    if inf > 128 {
                        w.effect(opcodes::ITEFFECTS0, 0x91);
                    } else {
                        w.pt_effect(0x8, if inf == 128 { 255 } else { inf << 1 }, mf);
                    }
                } else {
                    w.pt_effect(0x8, inf, mf);
                }
            }
            // Yxy panbrello
            0x19 => w.effect(opcodes::ITEFFECTY, inf as u16),
            // Zxx MIDI macro
            0x1A => {
                if let Some(filters) = &self.filters {
                    let (filter, value) = filters.settings[inf as usize];
                    if filter != 0 {
                        w.effect(opcodes::ITEFFECTZ, u16::from_be_bytes([filter, value]));
                    }
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nether_unimod::track::{Event, rows};

    fn events(w: &mut UniWriter) -> Vec<Event> {
        w.new_row();
        let track = w.finalize().unwrap();
        rows(&track).flat_map(|r| r.events()).collect()
    }

    #[test]
    fn test_order_list_skips_and_stops() {
        let orders = OrderList::new(vec![0, ORDER_SKIP, 1, ORDER_END, 2, ORDER_END], false);
        assert_eq!(orders.positions(), &[0, 1]);
        assert_eq!(orders.lookup(1), Some(1));
        assert_eq!(orders.lookup(2), Some(1));
        assert_eq!(orders.lookup(4), None);

        let curious = OrderList::new(vec![0, ORDER_SKIP, 1, ORDER_END, 2, ORDER_END], true);
        assert_eq!(curious.positions(), &[0, 1, 2]);
        assert_eq!(curious.lookup(4), Some(2));
    }

    #[test]
    fn test_jump_to_hidden_order_turns_curious() {
        let orders = OrderList::new(vec![0, ORDER_END, 1], false);
        let mut t = CommandTranslator::new(CmdFlags::OLDSTYLE, ModuleFlags::empty(), orders);
        let mut w = UniWriter::new();
        w.reset();
        t.process(&mut w, 2, 2);
        assert_eq!(t.orders.positions(), &[0, 1]);
        assert_eq!(
            events(&mut w),
            vec![Event::Effect {
                opcode: opcodes::PTEFFECTB,
                param: 1
            }]
        );
    }

    #[test]
    fn test_decimal_pattern_break() {
        let orders = OrderList::new(vec![0], false);
        let mut t = CommandTranslator::new(CmdFlags::OLDSTYLE, ModuleFlags::empty(), orders);
        let mut w = UniWriter::new();
        w.reset();
        t.process(&mut w, 3, 0x32);
        assert_eq!(
            events(&mut w),
            vec![Event::Effect {
                opcode: opcodes::PTEFFECTD,
                param: 32
            }]
        );

        t.flags |= CmdFlags::IT;
        w.reset();
        t.process(&mut w, 3, 0x32);
        assert_eq!(
            events(&mut w),
            vec![Event::Effect {
                opcode: opcodes::PTEFFECTD,
                param: 0x32
            }]
        );
    }

    #[test]
    fn test_old_style_panning() {
        let orders = OrderList::new(vec![0], false);
        let mut t = CommandTranslator::new(CmdFlags::OLDSTYLE, ModuleFlags::empty(), orders);
        let mut w = UniWriter::new();
        w.reset();
        t.process(&mut w, 0x18, 0xA4);
        t.process(&mut w, 0x18, 0x80);
        assert_eq!(
            events(&mut w),
            vec![
                Event::Effect {
                    opcode: opcodes::ITEFFECTS0,
                    param: 0x91
                },
                Event::Effect {
                    opcode: opcodes::PTEFFECT8,
                    param: 255
                }
            ]
        );
    }

    #[test]
    fn test_default_filter_macros() {
        let orders = OrderList::new(vec![0], false);
        let mut t = CommandTranslator::new(CmdFlags::IT, ModuleFlags::empty(), orders);
        t.filters = Some(FilterMacros::default());
        let mut w = UniWriter::new();
        w.reset();
        t.process(&mut w, 0x1A, 0x40);
        t.process(&mut w, 0x1A, 0x81);
        t.process(&mut w, 0x1A, 0xA0);
        assert_eq!(
            events(&mut w),
            vec![
                Event::Effect {
                    opcode: opcodes::ITEFFECTZ,
                    param: u16::from_be_bytes([FILT_CUT, 0x40])
                },
                Event::Effect {
                    opcode: opcodes::ITEFFECTZ,
                    param: u16::from_be_bytes([FILT_RESONANT, 8])
                }
            ]
        );
    }

    #[test]
    fn test_embedded_midi_config() {
        let mut sfx = [[0u8; 32]; 16];
        sfx[1][..6].copy_from_slice(b"F0F001");
        let mut zxx = [[0u8; 32]; 128];
        zxx[0][..8].copy_from_slice(b"F0F0007F");
        let mut f = FilterMacros::from_midi_config(&sfx, &zxx);
        assert_eq!(f.settings[0x10], (0, 0x10));
        assert_eq!(f.settings[0x80], (FILT_CUT, 0x7F));
        f.select(1);
        assert_eq!(f.settings[0x10], (FILT_RESONANT, 0x10));
    }
}
