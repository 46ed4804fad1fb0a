//! Error type for the FLAC primitives

use thiserror::Error;

/// Errors raised by the bit reader, bit writer and parameter checks
#[derive(Debug, Error)]
pub enum FlacError {
    /// The byte source ran dry before the requested bits were available
    #[error("unexpected end of stream")]
    EndOfStream,
    /// A read would cross the limit set with `BitReader::set_read_limit`
    #[error("read limit exceeded")]
    ReadLimit,
    /// The bit writer would have to grow past its hard maximum
    #[error("bit buffer would exceed {max} bytes")]
    BufferLimit { max: usize },
    /// An argument is outside the range the bitstream can express
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),
    /// The byte source failed
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
