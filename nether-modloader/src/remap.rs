//! Channel usage scan
//!
//! Many formats declare far more channels than a song touches. Loaders mark every
//! channel that carries data, then [`ChannelRemap::build`] packs the used ones into
//! consecutive output channels.

use nether_unimod::MAX_CHANNELS;

#[derive(Debug, Clone)]
pub(crate) struct ChannelRemap {
    used: [bool; MAX_CHANNELS],
    map: [Option<u8>; MAX_CHANNELS],
}

impl Default for ChannelRemap {
    fn default() -> Self {
        Self {
            used: [false; MAX_CHANNELS],
            map: [None; MAX_CHANNELS],
        }
    }
}

impl ChannelRemap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that source channel `channel` carries data
    pub fn mark(&mut self, channel: usize) {
        if let Some(used) = self.used.get_mut(channel) {
            *used = true;
        }
    }

    /// Assign output channels in source order; returns the number of used channels
    pub fn build(&mut self) -> usize {
        let mut next = 0u8;
        for (used, slot) in self.used.iter().zip(self.map.iter_mut()) {
            *slot = if *used {
                next += 1;
                Some(next - 1)
            } else {
                None
            };
        }
        next as usize
    }

    /// Output channel for a source channel, if it is used
    pub fn get(&self, channel: usize) -> Option<usize> {
        self.map.get(channel).copied().flatten().map(usize::from)
    }

    /// `(source, output)` pairs of every used channel
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.map
            .iter()
            .enumerate()
            .filter_map(|(src, dst)| dst.map(|d| (src, d as usize)))
    }
}
