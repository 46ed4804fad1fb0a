//! Unreal music package (UMX) loader
//!
//! A UMX file is an Unreal engine package holding a single `Music` object whose
//! payload is a plain IT, S3M or XM module. The loader walks the package header,
//! the name table and the first export entry to find the payload, then hands the
//! payload to the matching module loader.

use nether_unimod::{Module, ModuleStream, UniError};
use tracing::{debug, warn};

use crate::error::{Context, LoadError};
use crate::formats::{ItLoader, S3mLoader, XmLoader};
use crate::{LoadOptions, ModuleLoader, Registry, open_stream};

const UPKG_TAG: u32 = 0x9E2A_83C1;
const HEADER_SIZE: usize = 36;

/// Package versions known to carry music
const KNOWN_VERSIONS: &[u16] = &[35, 37, 40, 41, 61, 62, 63, 64, 66, 68, 69, 75, 76, 83];

#[derive(Debug, Clone, Copy)]
struct PackageHeader {
    version: u16,
    name_count: u32,
    name_offset: u32,
    export_count: u32,
    export_offset: u32,
}

fn parse_header(data: &[u8]) -> Option<PackageHeader> {
    let field = |at: usize| -> Option<u32> {
        let bytes = data.get(at..at + 4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    };
    if field(0)? != UPKG_TAG {
        return None;
    }
    let version = u16::from_le_bytes([*data.get(4)?, *data.get(5)?]);
    let h = PackageHeader {
        version,
        name_count: field(12)?,
        name_offset: field(16)?,
        export_count: field(20)?,
        export_offset: field(24)?,
    };
    let import_offset = field(32)?;

    let offsets_sane = [h.name_offset, h.export_offset, import_offset]
        .iter()
        .all(|&o| o as usize >= HEADER_SIZE);
    (KNOWN_VERSIONS.contains(&version) && offsets_sane && h.export_count > 0).then_some(h)
}

/// Read an `FCompactIndex`: a sign bit, a continuation bit and 6 value bits in the
/// first byte, then up to four more bytes of 7 value bits plus a continuation bit
pub(crate) fn read_compact(s: &mut ModuleStream) -> Result<i32, UniError> {
    let first = s.read_u8()?;
    let mut value = (first & 0x3F) as i32;
    let mut more = first & 0x40 != 0;
    let mut shift = 6;
    while more {
        let b = s.read_u8()?;
        if shift == 27 {
            value |= ((b & 0x1F) as i32) << shift;
            break;
        }
        value |= ((b & 0x7F) as i32) << shift;
        more = b & 0x80 != 0;
        shift += 7;
    }
    Ok(if first & 0x80 != 0 { -value } else { value })
}

fn read_names(s: &mut ModuleStream, h: &PackageHeader) -> Result<Vec<String>, UniError> {
    s.seek_to(h.name_offset as u64)?;
    // Every entry takes at least five bytes
    if h.name_count as u64 > s.remaining() / 5 {
        return Err(UniError::EndOfStream);
    }
    let mut names = Vec::with_capacity(h.name_count as usize);
    for _ in 0..h.name_count {
        let name = if h.version < 64 {
            let rest = s.peek_at(s.pos(), s.remaining() as usize).unwrap_or_default();
            let len = rest.iter().position(|&b| b == 0).ok_or(UniError::EndOfStream)?;
            s.read_string(len + 1)?
        } else {
            let len = read_compact(s)?;
            s.read_string(len.max(0) as usize)?
        };
        // Object flags
        s.skip(4)?;
        names.push(name);
    }
    Ok(names)
}

/// Location of the first exported object's serialized data
fn read_first_export(s: &mut ModuleStream, h: &PackageHeader) -> Result<(u64, u64), UniError> {
    s.seek_to(h.export_offset as u64)?;
    let _class = read_compact(s)?;
    let _super = read_compact(s)?;
    // Package index
    s.skip(4)?;
    let _object_name = read_compact(s)?;
    // Object flags
    s.skip(4)?;
    let size = read_compact(s)?;
    let offset = if size > 0 { read_compact(s)? } else { 0 };
    Ok((offset.max(0) as u64, size.max(0) as u64))
}

/// Payload start, payload size and format name index inside a `Music` object
fn read_music_object(
    s: &mut ModuleStream,
    h: &PackageHeader,
    offset: u64,
) -> Result<(u64, u64, i32), UniError> {
    s.seek_to(offset)?;
    if h.version < 40 {
        s.skip(8)?;
    }
    if h.version < 60 {
        s.skip(16)?;
    }
    // Property list terminator
    let _none = read_compact(s)?;
    let format = read_compact(s)?;
    if h.version >= 61 {
        // Offset of the next object
        s.skip(4)?;
    }
    let size = read_compact(s)?;
    Ok((s.pos(), size.max(0) as u64, format))
}

/// Loaders for the formats a package may embed
fn payload_registry() -> Registry {
    let mut registry = Registry::empty();
    registry.register(Box::new(ItLoader));
    registry.register(Box::new(S3mLoader));
    registry.register(Box::new(XmLoader));
    registry
}

/// Unreal music package loader
#[derive(Debug, Default, Clone, Copy)]
pub struct UmxLoader;

impl ModuleLoader for UmxLoader {
    fn name(&self) -> &'static str {
        "UMX"
    }

    fn description(&self) -> &'static str {
        "Unreal music package"
    }

    fn identify(&self, data: &[u8]) -> bool {
        data.len() >= HEADER_SIZE && parse_header(data).is_some()
    }

    fn load(&self, data: &[u8], options: &LoadOptions) -> Result<Module, LoadError> {
        if data.len() < HEADER_SIZE {
            return Err(LoadError::Unknown);
        }
        let h = parse_header(data).ok_or(LoadError::Unknown)?;
        let mut s = open_stream(data, options);

        let names = read_names(&mut s, &h).section("name table")?;
        let (object, object_size) = read_first_export(&mut s, &h).section("export table")?;
        if object_size == 0 {
            return Err(LoadError::header("first export has no data"));
        }
        let (start, size, format) =
            read_music_object(&mut s, &h, object).section("music object")?;
        let format_name = usize::try_from(format)
            .ok()
            .and_then(|i| names.get(i))
            .map(String::as_str)
            .unwrap_or("");
        debug!(
            "UMX: version {}, '{format_name}' payload of {size} bytes at {start:#x}",
            h.version
        );

        let payload = usize::try_from(start)
            .ok()
            .zip(usize::try_from(size).ok())
            .and_then(|(start, size)| data.get(start..start.checked_add(size)?))
            .ok_or(LoadError::Truncated("music data"))?;

        let registry = payload_registry();
        let loader = registry.identify(payload).ok_or_else(|| {
            LoadError::header(format!("unsupported music payload '{format_name}'"))
        })?;
        if !format_name.is_empty() && !loader.name().eq_ignore_ascii_case(format_name) {
            warn!(
                "UMX: payload tagged '{format_name}' looks like {}",
                loader.name()
            );
        }

        let mut m = loader.load(payload, options)?;
        for q in &mut m.samples {
            q.seek_pos += start;
        }
        m.mod_type = format!("{} (Unreal package)", m.mod_type);
        Ok(m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::s3m::tests::build_s3m;
    use crate::testutil::{Bytes, assert_rejects_truncated};

    fn compact(v: i32) -> Vec<u8> {
        let mut rest = v.unsigned_abs();
        let mut out = vec![(rest & 0x3F) as u8 | if v < 0 { 0x80 } else { 0 }];
        rest >>= 6;
        if rest > 0 {
            out[0] |= 0x40;
        }
        while rest > 0 {
            let mut b = (rest & 0x7F) as u8;
            rest >>= 7;
            if rest > 0 {
                b |= 0x80;
            }
            out.push(b);
        }
        out
    }

    /// Version 61 package wrapping `payload` as the only export
    fn build_umx(payload: &[u8], format: &str) -> (Vec<u8>, usize) {
        const EXPORTS: usize = 64;
        const OBJECT: usize = 96;

        let mut b = Bytes::new();
        b.u32le(UPKG_TAG).u16le(61).u16le(0).u32le(0);
        b.u32le(3).u32le(HEADER_SIZE as u32);
        b.u32le(1).u32le(EXPORTS as u32);
        b.u32le(0).u32le(HEADER_SIZE as u32);
        for name in ["None", format, "Music"] {
            b.bytes(name.as_bytes()).u8(0).u32le(0);
        }

        let mut object = Bytes::new();
        object.u8(0).bytes(&compact(1)).u32le(0);
        object.bytes(&compact(payload.len() as i32));
        let payload_start = OBJECT + object.len();
        object.bytes(payload);

        b.pad_to(EXPORTS);
        b.bytes(&compact(-1)).bytes(&compact(0)).u32le(0);
        b.bytes(&compact(2)).u32le(0);
        b.bytes(&compact(object.len() as i32))
            .bytes(&compact(OBJECT as i32));
        b.pad_to(OBJECT).bytes(&object.build());
        (b.build(), payload_start)
    }

    #[test]
    fn test_compact_index() {
        for v in [0, 1, 63, 64, -1, -64, 1000, 100_000, 1 << 26] {
            let bytes = compact(v);
            let mut s = ModuleStream::new(&bytes);
            assert_eq!(read_compact(&mut s).unwrap(), v, "value {v}");
            assert!(s.is_eof() || s.remaining() == 0);
        }
        // 5 | 1 << 6
        let mut s = ModuleStream::new(&[0x45, 0x01]);
        assert_eq!(read_compact(&mut s).unwrap(), 69);
        let mut s = ModuleStream::new(&[0x45]);
        assert_eq!(read_compact(&mut s), Err(UniError::EndOfStream));
    }

    #[test]
    fn test_identify() {
        let (data, _) = build_umx(&build_s3m(), "s3m");
        assert!(UmxLoader.identify(&data));
        assert_rejects_truncated(&UmxLoader, &data, HEADER_SIZE);

        let mut bad_version = data.clone();
        bad_version[4] = 99;
        assert!(!UmxLoader.identify(&bad_version));
    }

    #[test]
    fn test_load_s3m_payload() {
        let payload = build_s3m();
        let (data, start) = build_umx(&payload, "s3m");
        let m = UmxLoader.load(&data, &LoadOptions::default()).unwrap();
        m.validate().unwrap();

        assert_eq!(m.song_name, "Test Song");
        assert_eq!(m.mod_type, "Scream Tracker 3.20 (Unreal package)");
        assert_eq!(m.positions, vec![0, 1]);
        assert_eq!(m.samples[0].seek_pos, start as u64);
    }

    #[test]
    fn test_registry_delegates() {
        let (data, _) = build_umx(&build_s3m(), "s3m");
        let (format, m) = Registry::new()
            .load_any(&data, &LoadOptions::default())
            .unwrap();
        assert_eq!(format, "UMX");
        assert_eq!(m.num_chn, 2);
    }

    #[test]
    fn test_unsupported_payload() {
        let (data, _) = build_umx(&[0u8; 200], "mod");
        assert!(matches!(
            UmxLoader.load(&data, &LoadOptions::default()),
            Err(LoadError::Header(_))
        ));
    }

    #[test]
    fn test_truncated_payload() {
        let (mut data, _) = build_umx(&build_s3m(), "s3m");
        data.truncate(data.len() - 10);
        assert!(matches!(
            UmxLoader.load(&data, &LoadOptions::default()),
            Err(LoadError::Truncated("music data"))
        ));
    }
}
