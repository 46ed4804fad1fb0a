//! Nether-FLAC: FLAC bitstream primitives
//!
//! The building blocks a FLAC encoder or decoder is made of, without the frame and
//! stream layers on top:
//!
//! - [`BitReader`] / [`BitWriter`]: MSB-first bit I/O with Rice coding, UTF-8 style
//!   frame numbers, CRC-16 tracking and frame sync recovery
//! - [`crc`]: table-driven CRC-8 and CRC-16
//! - [`fixed`]: fixed polynomial predictors of order 0-4
//! - [`lpc`]: autocorrelation, Levinson-Durbin, coefficient quantization and the
//!   quantized predictor loops
//!
//! Every predictor comes in a 32-bit flavour (wrapping math, for blocks known to
//! fit), a wide flavour (64-bit prediction) and a 33-bit flavour for the side
//! channel of 32-bit stereo.
//!
//! # Rice Coding
//!
//! ```text
//! signed v -> u = (v << 1) ^ (v >> 31)     (0, -1, 1, -2, ... -> 0, 1, 2, 3, ...)
//! code     := '0' * (u >> k)  '1'  low k bits of u
//! ```
//!
//! # Usage
//!
//! ```
//! use nether_flac::{BitReader, BitWriter};
//!
//! let mut writer = BitWriter::new();
//! writer.write_rice_signed_block(&[3, -1, 0, 7], 2).unwrap();
//! writer.zero_pad_to_byte_boundary().unwrap();
//! let bytes = writer.get_buffer().unwrap().to_vec();
//!
//! let mut reader = BitReader::new(&bytes[..]);
//! let mut residual = [0i32; 4];
//! reader.read_rice_signed_block(&mut residual, 2).unwrap();
//! assert_eq!(residual, [3, -1, 0, 7]);
//! ```

mod bitreader;
mod bitwriter;
pub mod crc;
mod error;
pub mod fixed;
pub mod lpc;

pub use bitreader::BitReader;
pub use bitwriter::{BitWriter, MAX_BUFFER_BYTES};
pub use error::FlacError;
pub use fixed::FixedEstimate;
pub use lpc::{LpCoefficients, QuantizeStatus};

/// Highest fixed predictor order
pub const MAX_FIXED_ORDER: usize = 4;
/// Highest LPC order
pub const MAX_LPC_ORDER: usize = 32;
/// Highest Rice parameter (5-bit partition parameter, escape code excluded)
pub const MAX_RICE_PARAMETER: u32 = 30;
/// Widest quantized LPC coefficient, sign included
pub const MAX_QLP_COEFF_PRECISION: u32 = 15;
/// Quantization shift range (5-bit signed field)
pub const MAX_QLP_SHIFT: i32 = 15;
pub const MIN_QLP_SHIFT: i32 = -16;
