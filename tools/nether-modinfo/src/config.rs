//! Loader options from a TOML file plus command-line overrides

use anyhow::{Context, Result};
use clap::Args;
use nether_modloader::LoadOptions;
use std::fs;
use std::path::{Path, PathBuf};

/// Loader options shared by the commands that load modules
#[derive(Args, Debug, Default, Clone)]
pub struct OptionArgs {
    /// TOML file with loader options
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Keep order list entries past the first end marker
    #[arg(long)]
    pub curious: bool,

    /// Do not share identical tracks between patterns
    #[arg(long)]
    pub no_dedup: bool,

    /// Reject modules with more channels than this
    #[arg(long)]
    pub max_channels: Option<usize>,

    /// Decode names as Latin-1 instead of IBM850
    #[arg(long)]
    pub latin1: bool,
}

/// Parse a loader options file; missing keys keep their defaults
pub fn read_options_file(path: &Path) -> Result<LoadOptions> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("Invalid config {}", path.display()))
}

impl OptionArgs {
    /// Options from `--config` (or defaults) with the flags applied on top
    pub fn load_options(&self) -> Result<LoadOptions> {
        let mut options = match &self.config {
            Some(path) => read_options_file(path)?,
            None => LoadOptions::default(),
        };
        if self.curious {
            options.curious = true;
        }
        if self.no_dedup {
            options.dedup_tracks = false;
        }
        if let Some(max) = self.max_channels {
            options.max_channels = max;
        }
        if self.latin1 {
            options.ibm850_names = false;
        }
        tracing::debug!("loader options: {options:?}");
        Ok(options)
    }
}
