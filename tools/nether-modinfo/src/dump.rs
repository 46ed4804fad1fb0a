//! Dump command - print the unified track events of a module

use anyhow::{Context, Result, bail};
use clap::Args;
use nether_modloader::Registry;
use nether_unimod::track::{self, Event};
use nether_unimod::{Module, OCTAVE, opcodes};
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;

use crate::config::OptionArgs;

/// Arguments for the dump command
#[derive(Args)]
pub struct DumpArgs {
    /// Module file to load
    pub file: PathBuf,

    /// Only dump this pattern
    #[arg(long, short)]
    pub pattern: Option<usize>,

    /// Only dump this channel
    #[arg(long, short)]
    pub channel: Option<usize>,

    /// Print every row, including empty ones
    #[arg(long)]
    pub all_rows: bool,

    #[command(flatten)]
    pub options: OptionArgs,
}

const NOTE_NAMES: [&str; 12] = [
    "C-", "C#", "D-", "D#", "E-", "F-", "F#", "G-", "G#", "A-", "A#", "B-",
];

fn note_name(note: u8) -> String {
    format!("{}{}", NOTE_NAMES[(note % OCTAVE) as usize], note / OCTAVE)
}

/// Short text form of one event
pub fn format_event(event: &Event) -> String {
    match *event {
        Event::Note(n) => note_name(n),
        Event::Instrument(i) => format!("i{:02}", i as u16 + 1),
        Event::KeyOff => "===".to_string(),
        Event::Volume { kind, value } => format!("v{kind}:{value:02X}"),
        Event::Effect { opcode, param } => {
            if opcodes::operand_len(opcode) == Some(0) {
                opcodes::name(opcode).to_string()
            } else {
                format!("{}:{param:02X}", opcodes::name(opcode))
            }
        }
    }
}

/// Write one channel's track as `row: events` lines
pub fn dump_track(out: &mut impl Write, track: &[u8], all_rows: bool) -> io::Result<()> {
    let mut row = 0usize;
    for entry in track::rows(track) {
        let events: Vec<String> = entry.events().map(|e| format_event(&e)).collect();
        if all_rows || !events.is_empty() {
            let repeat = if entry.repeat > 1 {
                format!(" (x{})", entry.repeat)
            } else {
                String::new()
            };
            writeln!(out, "    {row:3}{repeat}: {}", events.join(" "))?;
        }
        row += entry.repeat as usize;
    }
    Ok(())
}

/// Write the selected patterns and channels of `m`
pub fn dump_module(
    out: &mut impl Write,
    m: &Module,
    pattern: Option<usize>,
    channel: Option<usize>,
    all_rows: bool,
) -> Result<()> {
    let patterns: Vec<usize> = match pattern {
        Some(p) if p >= m.num_pat as usize => {
            bail!("pattern {p} out of range (module has {})", m.num_pat)
        }
        Some(p) => vec![p],
        None => (0..m.num_pat as usize).collect(),
    };
    let channels: Vec<usize> = match channel {
        Some(c) if c >= m.num_chn as usize => {
            bail!("channel {c} out of range (module has {})", m.num_chn)
        }
        Some(c) => vec![c],
        None => (0..m.num_chn as usize).collect(),
    };

    for &p in &patterns {
        let rows = m.pattern_rows.get(p).copied().unwrap_or(0);
        writeln!(out, "Pattern {p} ({rows} rows)")?;
        for &c in &channels {
            match m.track(p, c) {
                Some(data) => {
                    if let Err(e) = track::validate_track(data) {
                        writeln!(out, "  Channel {c}: invalid track ({e})")?;
                        continue;
                    }
                    writeln!(out, "  Channel {c} ({} bytes)", data.len())?;
                    dump_track(out, data, all_rows)?;
                }
                None => writeln!(out, "  Channel {c}: empty")?,
            }
        }
    }
    Ok(())
}

/// Execute the dump command
pub fn execute(args: DumpArgs) -> Result<()> {
    let options = args.options.load_options()?;
    let data =
        fs::read(&args.file).with_context(|| format!("Failed to read {}", args.file.display()))?;
    let (format, module) = Registry::new()
        .load_any(&data, &options)
        .with_context(|| format!("Failed to load {}", args.file.display()))?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    writeln!(out, "{format}: {}", module.song_name)?;
    dump_module(&mut out, &module, args.pattern, args.channel, args.all_rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nether_unimod::{ModuleFlags, UniWriter};

    fn module_with_notes() -> Module {
        let mut m = Module::new();
        m.num_chn = 2;
        m.num_pat = 1;
        m.alloc_positions(1).unwrap();
        m.alloc_samples().unwrap();
        m.alloc_patterns().unwrap();
        m.alloc_tracks().unwrap();

        let mut w = UniWriter::new();
        w.reset();
        w.instrument(0);
        w.note(48);
        w.pt_effect(0xC, 0x20, ModuleFlags::empty());
        w.new_row();
        for _ in 0..3 {
            w.new_row();
        }
        w.key_off();
        w.new_row();
        m.tracks[0] = Some(w.finalize().unwrap());
        m.tracks[1] = Some(w.empty_track(64).unwrap());
        m
    }

    #[test]
    fn test_format_event() {
        assert_eq!(format_event(&Event::Note(48)), "C-4");
        assert_eq!(format_event(&Event::Note(61)), "C#5");
        assert_eq!(format_event(&Event::Instrument(9)), "i10");
        assert_eq!(format_event(&Event::KeyOff), "===");
        assert_eq!(
            format_event(&Event::Volume { kind: 1, value: 0x40 }),
            "v1:40"
        );
    }

    #[test]
    fn test_dump_module() {
        let m = module_with_notes();
        let mut out = Vec::new();
        dump_module(&mut out, &m, None, None, false).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.starts_with("Pattern 0 (64 rows)\n"));
        assert!(text.contains("      0: i01 C-4 PTC:20\n"));
        assert!(text.contains("      4: ===\n"));
        assert!(text.contains("  Channel 1 ("));
        // Empty rows are skipped unless asked for
        assert!(!text.contains("      1"));

        let mut out = Vec::new();
        dump_module(&mut out, &m, Some(0), Some(0), true).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("      1 (x3): \n"));
        assert!(!text.contains("Channel 1"));
    }

    #[test]
    fn test_dump_range_checks() {
        let m = module_with_notes();
        let mut out = Vec::new();
        assert!(dump_module(&mut out, &m, Some(1), None, false).is_err());
        assert!(dump_module(&mut out, &m, None, Some(2), false).is_err());
    }
}
