// Transparent wrapper that blocks embedded-bucket extraction.

use crate::bucket::{Bucket, Newline, NewlineSet};
use crate::error::Result;

/// Forwards every read operation to the wrapped bucket but refuses
/// [`Bucket::read_bucket`], so an outer reader cannot steal a raw source
/// (e.g. a file bucket) out of a framed sub-region.
///
/// A block bucket does not logically own what it wraps: the wrapped bucket
/// is meant to outlive the framing and is recovered with
/// [`BlockBucket::into_inner`]. The one exception is `duplicate`, whose
/// result belongs to the duplicator.
pub struct BlockBucket<B: Bucket> {
    wrapped: B,
}

impl<B: Bucket> BlockBucket<B> {
    pub const NAME: &'static str = "block";

    pub fn new(wrapped: B) -> Self {
        Self { wrapped }
    }

    /// Return ownership of the wrapped bucket to the caller.
    pub fn into_inner(self) -> B {
        self.wrapped
    }
}

impl<B: Bucket> Bucket for BlockBucket<B> {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn read(&mut self, requested: usize) -> Result<&[u8]> {
        self.wrapped.read(requested)
    }

    fn read_until_eol(
        &mut self,
        acceptable: NewlineSet,
        requested: usize,
    ) -> Result<(&[u8], Newline)> {
        self.wrapped.read_until_eol(acceptable, requested)
    }

    fn peek(&mut self, no_poll: bool) -> Result<&[u8]> {
        self.wrapped.peek(no_poll)
    }

    fn read_skip(&mut self, requested: u64) -> Result<u64> {
        self.wrapped.read_skip(requested)
    }

    fn remaining_bytes(&mut self) -> Result<u64> {
        self.wrapped.remaining_bytes()
    }

    fn reset(&mut self) -> Result<()> {
        self.wrapped.reset()
    }

    fn duplicate(&mut self, for_reset: bool) -> Result<Box<dyn Bucket>> {
        self.wrapped.duplicate(for_reset)
    }

    fn position(&self) -> Option<u64> {
        self.wrapped.position()
    }

    // read_bucket: default. Extracting inner buckets would break the
    // blocking.
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::{AggregateBucket, READ_ALL, SimpleBucket};

    #[test]
    fn forwards_reads() {
        let mut b = BlockBucket::new(SimpleBucket::copied(b"payload"));
        assert_eq!(b.peek(false).unwrap(), b"payload");
        assert_eq!(b.read(READ_ALL).unwrap(), b"payload");
        assert!(b.read(1).unwrap_err().is_eof());
    }

    #[test]
    fn refuses_extraction() {
        let mut agg = AggregateBucket::new();
        agg.append(BlockBucket::new(SimpleBucket::copied(b"hidden")));
        // The front child is a block bucket, not a simple bucket; neither
        // tag hands out the inner bucket.
        assert!(agg.read_bucket(SimpleBucket::NAME).is_none());
        let mut blocked = agg.read_bucket(BlockBucket::<SimpleBucket>::NAME).unwrap();
        assert!(blocked.read_bucket(SimpleBucket::NAME).is_none());
        assert_eq!(blocked.read(READ_ALL).unwrap(), b"hidden");
    }

    #[test]
    fn into_inner_returns_ownership() {
        let mut b = BlockBucket::new(SimpleBucket::copied(b"abc"));
        b.read(1).unwrap();
        let mut inner = b.into_inner();
        assert_eq!(inner.read(READ_ALL).unwrap(), b"bc");
    }
}
