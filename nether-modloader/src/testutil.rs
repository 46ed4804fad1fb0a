//! Binary builders for synthesizing module files in tests

/// Growable little/big-endian byte writer
#[derive(Debug, Default, Clone)]
pub(crate) struct Bytes {
    pub data: Vec<u8>,
}

impl Bytes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.data.push(v);
        self
    }

    pub fn u16le(&mut self, v: u16) -> &mut Self {
        self.data.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn u32le(&mut self, v: u32) -> &mut Self {
        self.data.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn u16be(&mut self, v: u16) -> &mut Self {
        self.data.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn u32be(&mut self, v: u32) -> &mut Self {
        self.data.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn bytes(&mut self, v: &[u8]) -> &mut Self {
        self.data.extend_from_slice(v);
        self
    }

    /// Write `s` padded with zeros to exactly `width` bytes
    pub fn str(&mut self, s: &str, width: usize) -> &mut Self {
        let mut field = vec![0u8; width];
        let n = s.len().min(width);
        field[..n].copy_from_slice(&s.as_bytes()[..n]);
        self.data.extend_from_slice(&field);
        self
    }

    pub fn zeros(&mut self, count: usize) -> &mut Self {
        self.data.resize(self.data.len() + count, 0);
        self
    }

    pub fn fill(&mut self, value: u8, count: usize) -> &mut Self {
        self.data.resize(self.data.len() + count, value);
        self
    }

    /// Zero-pad up to absolute offset `offset`
    pub fn pad_to(&mut self, offset: usize) -> &mut Self {
        if self.data.len() < offset {
            self.data.resize(offset, 0);
        }
        self
    }

    /// Overwrite a little-endian u16 at `offset`
    pub fn patch_u16le(&mut self, offset: usize, v: u16) -> &mut Self {
        self.data[offset..offset + 2].copy_from_slice(&v.to_le_bytes());
        self
    }

    /// Overwrite a little-endian u32 at `offset`
    pub fn patch_u32le(&mut self, offset: usize, v: u32) -> &mut Self {
        self.data[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
        self
    }

    pub fn build(&self) -> Vec<u8> {
        self.data.clone()
    }
}

/// Every prefix of `data` shorter than `min_len` must be rejected by `identify`
pub(crate) fn assert_rejects_truncated(loader: &dyn crate::ModuleLoader, data: &[u8], min_len: usize) {
    for len in 0..min_len.min(data.len()) {
        assert!(
            !loader.identify(&data[..len]),
            "{} accepted a {len}-byte prefix",
            loader.name()
        );
    }
}

/// Events of one decoded row
pub(crate) fn row_events(
    module: &nether_unimod::Module,
    pattern: usize,
    channel: usize,
    row: u16,
) -> Vec<nether_unimod::track::Event> {
    let track = module.track(pattern, channel).expect("track present");
    nether_unimod::track::find_row(track, row)
        .map(|r| r.events().collect())
        .unwrap_or_default()
}
