//! Loader lookup by file signature

use nether_unimod::Module;
use tracing::{debug, info};

use crate::formats::{
    AmfLoader, AsylumLoader, DsmLoader, FarLoader, GdmLoader, ImfLoader, ItLoader, Loader669,
    S3mLoader, StmLoader, StxLoader, UltLoader, UmxLoader, UniLoader, XmLoader,
};
use crate::{LoadError, LoadOptions, ModuleLoader};

/// Ordered set of loaders
///
/// Loaders with strong signatures are probed before the ones that can only guess
/// from header plausibility (669, STM).
pub struct Registry {
    loaders: Vec<Box<dyn ModuleLoader>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Registry holding every built-in loader
    pub fn new() -> Self {
        Self {
            loaders: vec![
                Box::new(UniLoader),
                Box::new(ItLoader),
                Box::new(XmLoader),
                Box::new(S3mLoader),
                Box::new(StxLoader),
                Box::new(ImfLoader),
                Box::new(GdmLoader),
                Box::new(FarLoader),
                Box::new(UltLoader),
                Box::new(AmfLoader),
                Box::new(AsylumLoader),
                Box::new(DsmLoader),
                Box::new(UmxLoader),
                Box::new(StmLoader),
                Box::new(Loader669),
            ],
        }
    }

    /// Empty registry, for callers that want a subset of formats
    pub fn empty() -> Self {
        Self {
            loaders: Vec::new(),
        }
    }

    /// Append a loader; it is probed after the existing ones
    pub fn register(&mut self, loader: Box<dyn ModuleLoader>) {
        self.loaders.push(loader);
    }

    /// All loaders in probe order
    pub fn loaders(&self) -> impl Iterator<Item = &dyn ModuleLoader> {
        self.loaders.iter().map(|l| l.as_ref())
    }

    /// First loader that recognizes `data`
    pub fn identify(&self, data: &[u8]) -> Option<&dyn ModuleLoader> {
        self.loaders().find(|l| l.identify(data))
    }

    /// Loader by its short name (case-insensitive)
    pub fn by_name(&self, name: &str) -> Option<&dyn ModuleLoader> {
        self.loaders().find(|l| l.name().eq_ignore_ascii_case(name))
    }

    /// Identify and load `data`, returning the format tag alongside the module
    pub fn load_any(
        &self,
        data: &[u8],
        options: &LoadOptions,
    ) -> Result<(&'static str, Module), LoadError> {
        let loader = self.identify(data).ok_or(LoadError::Unknown)?;
        debug!("identified as {}", loader.name());
        let module = loader.load(data, options)?;
        info!(
            "loaded {} module '{}' ({} channels, {} positions)",
            loader.name(),
            module.song_name,
            module.num_chn,
            module.num_pos
        );
        Ok((loader.name(), module))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_covers_every_format() {
        let registry = Registry::new();
        let names: Vec<_> = registry.loaders().map(|l| l.name()).collect();
        assert_eq!(names.len(), 15);
        for name in [
            "669", "AMF", "ASYLUM", "DSM", "FAR", "GDM", "IMF", "IT", "S3M", "STM", "STX", "ULT",
            "UNI", "XM", "UMX",
        ] {
            assert!(names.contains(&name), "missing {name}");
            assert!(registry.by_name(name).is_some());
        }
    }

    #[test]
    fn test_unknown_data() {
        let registry = Registry::new();
        assert!(registry.identify(&[]).is_none());
        let err = registry
            .load_any(&[0u8; 16], &LoadOptions::default())
            .unwrap_err();
        assert!(matches!(err, LoadError::Unknown));
    }

    #[test]
    fn test_empty_registry() {
        let mut registry = Registry::empty();
        assert!(registry.identify(b"IMPM").is_none());
        registry.register(Box::new(ItLoader));
        assert_eq!(registry.loaders().count(), 1);
    }
}
