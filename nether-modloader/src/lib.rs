//! Nether-Modloader: legacy tracker module loaders
//!
//! Converts historical tracker formats into the unified [`nether_unimod::Module`]
//! representation.
//!
//! # Supported Formats
//!
//! | Loader | Format | Signature |
//! |--------|--------|-----------|
//! | [`Loader669`] | Composer 669 / UNIS 669 | `if` / `JN` |
//! | [`AmfLoader`] | DSMI Advanced Module Format | `AMF` + version |
//! | [`AsylumLoader`] | Asylum Music Format | `ASYLUM Music Format V1.0` |
//! | [`DsmLoader`] | DSIK RIFF module | `RIFF` .. `DSMF` |
//! | [`FarLoader`] | Farandole Composer | `FAR\xFE` |
//! | [`GdmLoader`] | General Digital Music (2GDM) | `GDM\xFE` .. `GMFS` |
//! | [`ImfLoader`] | Imago Orpheus | `IM10` at 0x3C |
//! | [`ItLoader`] | Impulse Tracker | `IMPM` |
//! | [`S3mLoader`] | Scream Tracker 3 | `SCRM` at 0x2C |
//! | [`StmLoader`] | Scream Tracker 2 | `!Scream!` etc. at 0x14 |
//! | [`StxLoader`] | Scream Tracker Music Interface Kit | `SCRM` at 0x3C |
//! | [`UltLoader`] | UltraTracker | `MAS_UTrack_V00` |
//! | [`UniLoader`] | Unified module (UNI) | `UN05`/`UN06`/`APUN` |
//! | [`XmLoader`] | Fasttracker 2 | `Extended Module: ` |
//! | [`UmxLoader`] | Unreal music package | `0x9E2A83C1` |
//!
//! # Usage
//!
//! ```ignore
//! use nether_modloader::{LoadOptions, Registry};
//!
//! let data = std::fs::read("song.s3m")?;
//! let registry = Registry::new();
//! let (format, module) = registry.load_any(&data, &LoadOptions::default())?;
//! println!("{format}: {} ({} channels)", module.song_name, module.num_chn);
//! ```
//!
//! Each loader only ever reads from the byte slice it is given and keeps its scratch
//! buffers on the stack of the `load` call, so loaders may run on several threads at
//! once.

mod error;
mod formats;
mod options;
mod registry;
mod remap;
mod s3mit;
#[cfg(test)]
mod testutil;

pub use error::LoadError;
pub use formats::{
    AmfLoader, AsylumLoader, DsmLoader, FarLoader, GdmLoader, ImfLoader, ItLoader, Loader669,
    S3mLoader, StmLoader, StxLoader, UltLoader, UmxLoader, UniLoader, XmLoader,
};
pub use options::LoadOptions;
pub use registry::Registry;

use nether_unimod::{Module, ModuleStream, UniWriter};

/// A loader for one module format
pub trait ModuleLoader: Send + Sync {
    /// Short format tag, e.g. "S3M"
    fn name(&self) -> &'static str;

    /// Long format name
    fn description(&self) -> &'static str;

    /// Cheap signature check; never fails, never reads past the end of `data`
    fn identify(&self, data: &[u8]) -> bool;

    /// Full parse into the unified representation
    fn load(&self, data: &[u8], options: &LoadOptions) -> Result<Module, LoadError>;
}

/// Reader honoring the configured name code page
pub(crate) fn open_stream<'a>(data: &'a [u8], options: &LoadOptions) -> ModuleStream<'a> {
    if options.ibm850_names {
        ModuleStream::new(data)
    } else {
        ModuleStream::latin1(data)
    }
}

/// Track encoder honoring the configured deduplication
pub(crate) fn new_writer(options: &LoadOptions) -> UniWriter {
    UniWriter::with_dedup(options.dedup_tracks)
}
