//! Sample descriptors

use bitflags::bitflags;

use crate::PAN_CENTER;

bitflags! {
    /// Sample storage and playback flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SampleFlags: u16 {
        /// 16-bit sample data
        const BITS16 = 0x0001;
        /// Interleaved stereo sample data
        const STEREO = 0x0002;
        /// Signed sample data
        const SIGNED = 0x0004;
        /// Big-endian 16-bit data
        const BIG_ENDIAN = 0x0008;
        /// Delta-encoded data
        const DELTA = 0x0010;
        /// IT 2.14 compressed data
        const ITPACKED = 0x0020;
        /// IT 2.15 compressed data (with ITPACKED)
        const IT215 = 0x0040;
        /// Loop enabled
        const LOOP = 0x0100;
        /// Ping-pong loop
        const BIDI = 0x0200;
        /// Play backwards
        const REVERSE = 0x0400;
        /// Sustain loop enabled
        const SUSTAIN = 0x0800;
        /// Ping-pong sustain loop
        const SUSTAIN_BIDI = 0x1000;
        /// Sample carries its own panning
        const OWNPAN = 0x2000;
        /// Sample data is stored outside the module (or missing)
        const NO_DATA = 0x4000;
    }
}

/// A sample as declared by a module
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Sample name
    pub name: String,
    /// Storage/playback flags
    pub flags: SampleFlags,
    /// Playback rate for C-4 (Hz)
    pub speed: u32,
    /// Default volume (0-64)
    pub volume: u8,
    /// Default panning (0-255, or [`crate::PAN_SURROUND`])
    pub panning: u16,
    /// Length in sample frames
    pub length: u32,
    /// Loop start in frames
    pub loop_start: u32,
    /// Loop end in frames
    pub loop_end: u32,
    /// Sustain loop start in frames
    pub sus_begin: u32,
    /// Sustain loop end in frames
    pub sus_end: u32,
    /// Global volume (0-64)
    pub global_volume: u8,
    /// Auto-vibrato waveform
    pub vib_type: u8,
    /// Auto-vibrato sweep
    pub vib_sweep: u8,
    /// Auto-vibrato depth
    pub vib_depth: u8,
    /// Auto-vibrato rate
    pub vib_rate: u8,
    /// Byte offset of the sample data in the module file
    pub seek_pos: u64,
}

impl Default for Sample {
    fn default() -> Self {
        Self {
            name: String::new(),
            flags: SampleFlags::empty(),
            speed: 8363,
            volume: 64,
            panning: PAN_CENTER,
            length: 0,
            loop_start: 0,
            loop_end: 0,
            sus_begin: 0,
            sus_end: 0,
            global_volume: 64,
            vib_type: 0,
            vib_sweep: 0,
            vib_depth: 0,
            vib_rate: 0,
            seek_pos: 0,
        }
    }
}

impl Sample {
    /// Bytes per frame of the stored data
    pub fn frame_size(&self) -> u32 {
        let width = if self.flags.contains(SampleFlags::BITS16) {
            2
        } else {
            1
        };
        if self.flags.contains(SampleFlags::STEREO) {
            width * 2
        } else {
            width
        }
    }

    /// Whether the loop points are usable
    pub fn has_loop(&self) -> bool {
        self.flags.contains(SampleFlags::LOOP) && self.loop_end > self.loop_start
    }

    /// Drop the loop flag when the loop points are degenerate and clamp the loop end
    /// to the sample length
    pub fn fix_loop(&mut self) {
        if self.loop_end > self.length {
            self.loop_end = self.length;
        }
        if self.loop_start >= self.loop_end {
            self.flags.remove(SampleFlags::LOOP | SampleFlags::BIDI);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_size() {
        let mut s = Sample::default();
        assert_eq!(s.frame_size(), 1);
        s.flags = SampleFlags::BITS16 | SampleFlags::STEREO;
        assert_eq!(s.frame_size(), 4);
    }

    #[test]
    fn test_fix_loop() {
        let mut s = Sample {
            length: 100,
            loop_start: 10,
            loop_end: 200,
            flags: SampleFlags::LOOP,
            ..Default::default()
        };
        s.fix_loop();
        assert_eq!(s.loop_end, 100);
        assert!(s.has_loop());

        s.loop_start = 100;
        s.fix_loop();
        assert!(!s.flags.contains(SampleFlags::LOOP));
    }
}
