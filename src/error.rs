// Error taxonomy for bucket reads and the Git decoders.
//
// `Eof` and `WouldBlock` are ordinary results of streaming, not failures:
// every caller that loops over `read` is expected to test them with the
// predicates below instead of bailing out. Everything else is fatal to the
// current read and must not be retried silently.

use std::io;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, BucketError>;

#[derive(Debug, thiserror::Error)]
pub enum BucketError {
    /// Normal end of the stream. Not a failure.
    #[error("end of stream")]
    Eof,

    /// A non-blocking source has no data ready yet. Retry later.
    #[error("no data available yet")]
    WouldBlock,

    /// The bucket cannot perform this operation. Callers may fall back.
    #[error("operation not supported by '{0}' bucket")]
    NotSupported(&'static str),

    /// The operation is recognized but not implemented.
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    /// Structurally invalid input (bad signature, varint, delta command, ...).
    #[error("malformed data: {0}")]
    Malformed(String),

    /// A checksum computed over the stream did not match the expected value.
    #[error("checksum mismatch: expected {expected}, found {found}")]
    ChecksumMismatch { expected: String, found: String },

    /// The underlying compression engine reported an error.
    #[error("codec failure: {0}")]
    Codec(String),

    /// I/O failure from the file-handle collaborator.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// A contextual message wrapped around an underlying failure.
    #[error("{message}")]
    Context {
        message: String,
        #[source]
        source: Box<BucketError>,
    },
}

impl BucketError {
    pub fn is_eof(&self) -> bool {
        matches!(self, BucketError::Eof)
    }

    pub fn is_would_block(&self) -> bool {
        matches!(self, BucketError::WouldBlock)
    }

    /// True for errors that abort the current read. `Eof` and `WouldBlock`
    /// are expected streaming states and return false.
    pub fn is_read_error(&self) -> bool {
        !self.is_eof() && !self.is_would_block()
    }

    /// Wrap a real error with a context message. `Eof` and `WouldBlock` pass
    /// through unchanged so the predicates above keep working on them.
    pub fn with_context(self, message: impl Into<String>) -> BucketError {
        if self.is_read_error() {
            BucketError::Context {
                message: message.into(),
                source: Box::new(self),
            }
        } else {
            self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predicates() {
        assert!(BucketError::Eof.is_eof());
        assert!(!BucketError::Eof.is_read_error());
        assert!(BucketError::WouldBlock.is_would_block());
        assert!(!BucketError::WouldBlock.is_read_error());
        assert!(BucketError::NotSupported("x").is_read_error());
        assert!(BucketError::Malformed("bad".into()).is_read_error());
    }

    #[test]
    fn context_skips_streaming_states() {
        let e = BucketError::Eof.with_context("reading header");
        assert!(e.is_eof());

        let e = BucketError::Malformed("bad byte".into()).with_context("reading header");
        assert_eq!(e.to_string(), "reading header");
        assert!(std::error::Error::source(&e).is_some());
    }
}
