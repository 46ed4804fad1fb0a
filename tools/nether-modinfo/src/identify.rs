//! Identify command - report the loader for each file

use anyhow::{Context, Result};
use clap::Args;
use nether_modloader::Registry;
use std::fs;
use std::path::PathBuf;

/// Arguments for the identify command
#[derive(Args)]
pub struct IdentifyArgs {
    /// Module files to check
    #[arg(required = true)]
    pub files: Vec<PathBuf>,
}

/// One line of identify output
pub fn describe(registry: &Registry, data: &[u8]) -> String {
    match registry.identify(data) {
        Some(loader) => format!("{} ({})", loader.name(), loader.description()),
        None => "unknown format".to_string(),
    }
}

/// Execute the identify command
pub fn execute(args: IdentifyArgs) -> Result<()> {
    let registry = Registry::new();
    for path in &args.files {
        let data =
            fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        println!("{}: {}", path.display(), describe(&registry, &data));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe() {
        let registry = Registry::new();
        assert_eq!(describe(&registry, b"not a module"), "unknown format");

        let mut asylum = b"ASYLUM Music Format V1.0\0".to_vec();
        asylum.resize(0x126 + 64 * 37, 0);
        assert_eq!(
            describe(&registry, &asylum),
            "ASYLUM (Asylum Music Format)"
        );
    }
}
