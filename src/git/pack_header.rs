// Decoder for the fixed 12-byte header of a git pack stream.

use crate::bucket::Bucket;
use crate::error::{BucketError, Result};

const HEADER_LEN: usize = 12;
const SIGNATURE: &[u8; 4] = b"PACK";

/// Parses `"PACK" <u32be version> <u32be object_count>`.
///
/// The bucket itself produces no payload bytes: reading it drives the parse
/// and then reports `Eof`, leaving the wrapped bucket positioned at the
/// first object frame.
pub struct PackHeaderBucket<B: Bucket> {
    inner: B,
    buf: [u8; HEADER_LEN],
    filled: usize,
    version: u32,
    object_count: u32,
}

impl<B: Bucket> PackHeaderBucket<B> {
    pub const NAME: &'static str = "git.packheader";

    pub fn new(inner: B) -> Self {
        Self {
            inner,
            buf: [0; HEADER_LEN],
            filled: 0,
            version: 0,
            object_count: 0,
        }
    }

    /// Parse (once) and return `(version, object_count)`.
    pub fn read_pack_info(&mut self) -> Result<(u32, u32)> {
        while self.filled < HEADER_LEN {
            let data = match self.inner.read(HEADER_LEN - self.filled) {
                Ok(data) => data,
                Err(e) if e.is_eof() => {
                    return Err(BucketError::Malformed(format!(
                        "pack header truncated after {} of {HEADER_LEN} bytes",
                        self.filled
                    )));
                }
                Err(e) => return Err(e),
            };
            self.buf[self.filled..self.filled + data.len()].copy_from_slice(data);
            let was_empty = data.is_empty();
            self.filled += data.len();
            if was_empty {
                return Err(BucketError::WouldBlock);
            }

            if self.filled == HEADER_LEN {
                if &self.buf[..4] != SIGNATURE {
                    return Err(BucketError::Malformed(format!(
                        "not a pack stream: signature {:02x?} instead of \"PACK\"",
                        &self.buf[..4]
                    )));
                }
                self.version = u32::from_be_bytes(self.buf[4..8].try_into().unwrap());
                self.object_count = u32::from_be_bytes(self.buf[8..12].try_into().unwrap());
                log::debug!(
                    "pack header: version {} with {} objects",
                    self.version,
                    self.object_count
                );
            }
        }
        Ok((self.version, self.object_count))
    }

    pub fn version(&self) -> Option<u32> {
        (self.filled == HEADER_LEN).then_some(self.version)
    }

    pub fn object_count(&self) -> Option<u32> {
        (self.filled == HEADER_LEN).then_some(self.object_count)
    }

    /// Hand the wrapped bucket back, positioned after the header if the
    /// parse completed.
    pub fn into_inner(self) -> B {
        self.inner
    }
}

impl<B: Bucket> Bucket for PackHeaderBucket<B> {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn read(&mut self, _requested: usize) -> Result<&[u8]> {
        self.read_pack_info()?;
        Err(BucketError::Eof)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::SimpleBucket;

    fn header(version: u32, count: u32) -> Vec<u8> {
        let mut v = b"PACK".to_vec();
        v.extend_from_slice(&version.to_be_bytes());
        v.extend_from_slice(&count.to_be_bytes());
        v
    }

    #[test]
    fn parses_version_and_count() {
        let mut b = PackHeaderBucket::new(SimpleBucket::from_vec(header(2, 1234)));
        assert_eq!(b.version(), None);
        assert_eq!(b.read_pack_info().unwrap(), (2, 1234));
        assert_eq!(b.version(), Some(2));
        assert_eq!(b.object_count(), Some(1234));
        // Parsing is idempotent.
        assert_eq!(b.read_pack_info().unwrap(), (2, 1234));
    }

    #[test]
    fn read_drives_parse_then_eof() {
        let mut b = PackHeaderBucket::new(SimpleBucket::from_vec(header(2, 7)));
        assert!(b.read(1).unwrap_err().is_eof());
        assert_eq!(b.object_count(), Some(7));
    }

    #[test]
    fn leaves_inner_at_first_frame() {
        let mut bytes = header(2, 0);
        bytes.extend_from_slice(b"FRAME");
        let mut b = PackHeaderBucket::new(SimpleBucket::from_vec(bytes));
        b.read_pack_info().unwrap();
        let mut inner = b.into_inner();
        assert_eq!(inner.read(crate::bucket::READ_ALL).unwrap(), b"FRAME");
    }

    #[test]
    fn rejects_bad_signature() {
        let mut bytes = header(2, 0);
        bytes[0] = b'J';
        let mut b = PackHeaderBucket::new(SimpleBucket::from_vec(bytes));
        assert!(matches!(
            b.read_pack_info().unwrap_err(),
            BucketError::Malformed(_)
        ));
    }

    #[test]
    fn rejects_truncation() {
        let mut b = PackHeaderBucket::new(SimpleBucket::copied(b"PACK\0\0"));
        assert!(matches!(
            b.read_pack_info().unwrap_err(),
            BucketError::Malformed(_)
        ));
    }
}
