//! Error types for module loading

use nether_unimod::UniError;
use thiserror::Error;

/// Errors that can occur while loading a module
#[derive(Debug, Error)]
pub enum LoadError {
    /// The data is not in this loader's format
    #[error("unrecognized module format")]
    Unknown,
    /// The file ended in the middle of a structure
    #[error("unexpected end of file while reading {0}")]
    Truncated(&'static str),
    /// A header field holds an impossible value
    #[error("invalid header: {0}")]
    Header(String),
    /// A declared count exceeds what the format allows
    #[error("too many {what}: {value} (max {max})")]
    Limit {
        what: &'static str,
        value: usize,
        max: usize,
    },
    /// Pattern data could not be decoded
    #[error("invalid pattern {pattern}: {reason}")]
    Pattern { pattern: usize, reason: String },
    /// Sample header is inconsistent
    #[error("invalid sample {index}: {reason}")]
    Sample { index: usize, reason: String },
    /// Instrument header is inconsistent
    #[error("invalid instrument {index}: {reason}")]
    Instrument { index: usize, reason: String },
    /// Error from the unified module layer (track validation, allocation, stream)
    #[error(transparent)]
    Unimod(#[from] UniError),
    /// IO error while reading a file
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl LoadError {
    pub(crate) fn header(msg: impl Into<String>) -> Self {
        Self::Header(msg.into())
    }

    pub(crate) fn pattern(pattern: usize, reason: impl Into<String>) -> Self {
        Self::Pattern {
            pattern,
            reason: reason.into(),
        }
    }

    pub(crate) fn limit(what: &'static str, value: usize, max: usize) -> Self {
        Self::Limit { what, value, max }
    }
}

/// Map end-of-stream errors to a [`LoadError::Truncated`] naming the section being read
pub(crate) trait Context<T> {
    fn section(self, what: &'static str) -> Result<T, LoadError>;
}

impl<T> Context<T> for Result<T, UniError> {
    fn section(self, what: &'static str) -> Result<T, LoadError> {
        self.map_err(|e| match e {
            UniError::EndOfStream | UniError::SeekOutOfRange(_) => LoadError::Truncated(what),
            other => LoadError::Unimod(other),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            LoadError::limit("channels", 70, 64).to_string(),
            "too many channels: 70 (max 64)"
        );
        assert_eq!(
            LoadError::Truncated("header").to_string(),
            "unexpected end of file while reading header"
        );
        assert_eq!(
            LoadError::from(UniError::RowTooLong(40)).to_string(),
            "row too long: 40 bytes (max 31)"
        );
    }

    #[test]
    fn test_section_context() {
        let r: Result<u8, UniError> = Err(UniError::EndOfStream);
        assert!(matches!(r.section("samples"), Err(LoadError::Truncated("samples"))));
        let r: Result<u8, UniError> = Err(UniError::Unterminated);
        assert!(matches!(r.section("samples"), Err(LoadError::Unimod(_))));
    }
}
