//! Info command - load a module and summarize it

use anyhow::{Context, Result};
use clap::Args;
use nether_modloader::Registry;
use nether_unimod::{LAST_PATTERN, Module};
use serde::Serialize;
use std::fs;
use std::path::PathBuf;

use crate::config::OptionArgs;

/// Arguments for the info command
#[derive(Args)]
pub struct InfoArgs {
    /// Module file to load
    pub file: PathBuf,

    /// Print the summary as JSON
    #[arg(long)]
    pub json: bool,

    /// Also list every sample
    #[arg(long, short)]
    pub samples: bool,

    #[command(flatten)]
    pub options: OptionArgs,
}

/// Module header and tables, as printed by `info`
#[derive(Debug, Serialize)]
pub struct ModuleSummary {
    pub format: String,
    pub song_name: String,
    pub mod_type: String,
    pub flags: Vec<String>,
    pub channels: u16,
    pub positions: u16,
    pub song_length: usize,
    pub restart: u16,
    pub patterns: u16,
    pub tracks: u32,
    pub shared_tracks: usize,
    pub instruments: u16,
    pub speed: u8,
    pub tempo: u16,
    pub volume: u8,
    pub orders: Vec<Option<u16>>,
    pub samples: Vec<SampleSummary>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub comment: String,
}

#[derive(Debug, Serialize)]
pub struct SampleSummary {
    pub name: String,
    pub length: u32,
    pub rate: u32,
    pub volume: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loop_range: Option<(u32, u32)>,
    pub flags: Vec<String>,
    pub offset: u64,
}

impl ModuleSummary {
    pub fn new(format: &str, m: &Module) -> Self {
        let present = m.tracks.iter().flatten().count();
        let mut unique: Vec<*const u8> = m.tracks.iter().flatten().map(|t| t.as_ptr()).collect();
        unique.sort_unstable();
        unique.dedup();

        Self {
            format: format.to_string(),
            song_name: m.song_name.clone(),
            mod_type: m.mod_type.clone(),
            flags: m.flags.iter_names().map(|(name, _)| name.to_string()).collect(),
            channels: m.num_chn,
            positions: m.num_pos,
            song_length: m.song_length(),
            restart: m.rep_pos,
            patterns: m.num_pat,
            tracks: m.num_trk,
            shared_tracks: present - unique.len(),
            instruments: m.num_ins,
            speed: m.init_speed,
            tempo: m.init_tempo,
            volume: m.init_volume,
            orders: m
                .positions
                .iter()
                .map(|&p| (p != LAST_PATTERN).then_some(p))
                .collect(),
            samples: m
                .samples
                .iter()
                .map(|q| SampleSummary {
                    name: q.name.clone(),
                    length: q.length,
                    rate: q.speed,
                    volume: q.volume,
                    loop_range: q.has_loop().then_some((q.loop_start, q.loop_end)),
                    flags: q.flags.iter_names().map(|(name, _)| name.to_string()).collect(),
                    offset: q.seek_pos,
                })
                .collect(),
            comment: m.comment.clone(),
        }
    }

    /// Human-readable report
    pub fn render(&self, with_samples: bool) -> String {
        let mut out = String::new();
        let orders: Vec<String> = self
            .orders
            .iter()
            .map(|o| o.map_or_else(|| "--".to_string(), |p| p.to_string()))
            .collect();

        out.push_str(&format!("Format:      {} ({})\n", self.format, self.mod_type));
        out.push_str(&format!("Title:       {}\n", self.song_name));
        out.push_str(&format!("Channels:    {}\n", self.channels));
        out.push_str(&format!(
            "Orders:      {} ({} playable, restart at {})\n",
            self.positions, self.song_length, self.restart
        ));
        out.push_str(&format!("             {}\n", orders.join(" ")));
        out.push_str(&format!(
            "Patterns:    {} ({} tracks, {} shared)\n",
            self.patterns, self.tracks, self.shared_tracks
        ));
        out.push_str(&format!(
            "Samples:     {} / instruments: {}\n",
            self.samples.len(),
            self.instruments
        ));
        out.push_str(&format!(
            "Speed/tempo: {}/{}, global volume {}\n",
            self.speed, self.tempo, self.volume
        ));
        if !self.flags.is_empty() {
            out.push_str(&format!("Flags:       {}\n", self.flags.join(" ")));
        }

        if with_samples {
            out.push_str("\n  #  Name                    Length     Rate Vol  Loop\n");
            for (i, q) in self.samples.iter().enumerate() {
                let loop_range = q
                    .loop_range
                    .map_or_else(String::new, |(start, end)| format!("{start}-{end}"));
                out.push_str(&format!(
                    "{:>3}  {:<22} {:>8} {:>8} {:>3}  {}\n",
                    i + 1,
                    q.name,
                    q.length,
                    q.rate,
                    q.volume,
                    loop_range
                ));
            }
        }

        if !self.comment.is_empty() {
            out.push_str("\nComment:\n");
            for line in self.comment.lines() {
                out.push_str(&format!("  {line}\n"));
            }
        }
        out
    }
}

/// Execute the info command
pub fn execute(args: InfoArgs) -> Result<()> {
    let options = args.options.load_options()?;
    let data =
        fs::read(&args.file).with_context(|| format!("Failed to read {}", args.file.display()))?;

    let (format, module) = Registry::new()
        .load_any(&data, &options)
        .with_context(|| format!("Failed to load {}", args.file.display()))?;
    if let Err(e) = module.validate() {
        tracing::warn!("module failed validation: {e}");
    }

    let summary = ModuleSummary::new(format, &module);
    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print!("{}", summary.render(args.samples));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nether_unimod::{ModuleFlags, Sample, SampleFlags, UniWriter};

    fn small_module() -> Module {
        let mut m = Module::new();
        m.song_name = "demo".to_string();
        m.mod_type = "Test Tracker".to_string();
        m.flags = ModuleFlags::LINEAR | ModuleFlags::PANNING;
        m.num_chn = 2;
        m.num_pat = 1;
        m.num_smp = 1;
        m.alloc_positions(2).unwrap();
        m.positions[1] = LAST_PATTERN;
        m.alloc_samples().unwrap();
        m.samples[0] = Sample {
            name: "kick".to_string(),
            length: 1000,
            loop_start: 10,
            loop_end: 900,
            flags: SampleFlags::LOOP | SampleFlags::SIGNED,
            ..Sample::default()
        };
        m.alloc_patterns().unwrap();
        m.alloc_tracks().unwrap();

        let mut w = UniWriter::new();
        let empty = w.empty_track(64).unwrap();
        m.tracks[0] = Some(empty.clone());
        m.tracks[1] = Some(empty);
        m
    }

    #[test]
    fn test_summary() {
        let summary = ModuleSummary::new("S3M", &small_module());
        assert_eq!(summary.flags, vec!["LINEAR", "PANNING"]);
        assert_eq!(summary.orders, vec![Some(0), None]);
        assert_eq!(summary.song_length, 1);
        assert_eq!(summary.shared_tracks, 1);
        assert_eq!(summary.samples[0].loop_range, Some((10, 900)));
        assert_eq!(summary.samples[0].flags, vec!["SIGNED", "LOOP"]);
    }

    #[test]
    fn test_render() {
        let summary = ModuleSummary::new("S3M", &small_module());
        let text = summary.render(true);
        assert!(text.contains("Format:      S3M (Test Tracker)"));
        assert!(text.contains("0 --"));
        assert!(text.contains("kick"));
        assert!(text.contains("10-900"));
        assert!(!summary.render(false).contains("kick"));
    }

    #[test]
    fn test_json() {
        let summary = ModuleSummary::new("S3M", &small_module());
        let json: serde_json::Value = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["format"], "S3M");
        assert_eq!(json["orders"][1], serde_json::Value::Null);
        assert!(json.get("comment").is_none());
    }
}
