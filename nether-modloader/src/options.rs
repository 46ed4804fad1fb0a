//! Loader configuration

use serde::{Deserialize, Serialize};

use nether_unimod::MAX_CHANNELS;

/// Options shared by every loader
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadOptions {
    /// Keep order list entries past the first end marker (hidden subsongs)
    ///
    /// Read by the S3M, IT, STX and GDM loaders. The other formats have no end
    /// marker inside the order list and ignore it.
    pub curious: bool,
    /// Share byte-identical tracks between patterns
    #[serde(default = "default_dedup_tracks")]
    pub dedup_tracks: bool,
    /// Reject modules using more channels than this
    #[serde(default = "default_max_channels")]
    pub max_channels: usize,
    /// Decode names with the IBM850 code page instead of Latin-1
    #[serde(default = "default_ibm850_names")]
    pub ibm850_names: bool,
}

fn default_dedup_tracks() -> bool {
    true
}

fn default_max_channels() -> usize {
    MAX_CHANNELS
}

fn default_ibm850_names() -> bool {
    true
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            curious: false,
            dedup_tracks: default_dedup_tracks(),
            max_channels: default_max_channels(),
            ibm850_names: default_ibm850_names(),
        }
    }
}

impl LoadOptions {
    /// Channel ceiling for a format, never above the global limit
    pub fn channel_limit(&self, format_max: usize) -> usize {
        format_max.min(self.max_channels).min(MAX_CHANNELS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = LoadOptions::default();
        assert!(!opts.curious);
        assert!(opts.dedup_tracks);
        assert_eq!(opts.max_channels, 64);
        assert_eq!(opts.channel_limit(32), 32);
    }

    #[test]
    fn test_partial_toml() {
        let opts: LoadOptions = toml::from_str("curious = true\nmax_channels = 16\n").unwrap();
        assert!(opts.curious);
        assert!(opts.dedup_tracks);
        assert_eq!(opts.channel_limit(32), 16);
    }
}
