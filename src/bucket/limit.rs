// Caps the number of bytes exposed from a wrapped bucket.

use crate::bucket::{Bucket, Newline, NewlineSet};
use crate::error::{BucketError, Result};

/// Exposes at most `limit` bytes from the wrapped bucket.
///
/// Once the budget is exhausted the wrapped bucket is dropped and every
/// further read reports `Eof`, so a limit bucket can hand out a bounded
/// sub-region of a stream without the consumer ever touching bytes past it.
pub struct LimitBucket<B: Bucket> {
    wrapped: Option<B>,
    limit: u64,
    remaining: u64,
    consumed: u64,
}

impl<B: Bucket> std::fmt::Debug for LimitBucket<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimitBucket")
            .field("limit", &self.limit)
            .field("remaining", &self.remaining)
            .field("consumed", &self.consumed)
            .finish_non_exhaustive()
    }
}

impl<B: Bucket> LimitBucket<B> {
    pub const NAME: &'static str = "limit";

    pub fn new(wrapped: B, limit: u64) -> Self {
        Self {
            wrapped: Some(wrapped),
            limit,
            remaining: limit,
            consumed: 0,
        }
    }

    fn clamp(&self, requested: usize) -> usize {
        requested.min(usize::try_from(self.remaining).unwrap_or(usize::MAX))
    }

    /// Drop the wrapped bucket once the budget is gone.
    fn retire_if_done(&mut self) -> Result<()> {
        if self.remaining == 0 {
            self.wrapped = None;
            return Err(BucketError::Eof);
        }
        Ok(())
    }
}

impl<B: Bucket> Bucket for LimitBucket<B> {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn read(&mut self, requested: usize) -> Result<&[u8]> {
        self.retire_if_done()?;
        let requested = self.clamp(requested);
        let wrapped = self.wrapped.as_mut().ok_or(BucketError::Eof)?;
        let data = wrapped.read(requested)?;
        self.remaining -= data.len() as u64;
        self.consumed += data.len() as u64;
        Ok(data)
    }

    fn read_until_eol(
        &mut self,
        acceptable: NewlineSet,
        requested: usize,
    ) -> Result<(&[u8], Newline)> {
        self.retire_if_done()?;
        let requested = self.clamp(requested);
        let wrapped = self.wrapped.as_mut().ok_or(BucketError::Eof)?;
        let (data, found) = wrapped.read_until_eol(acceptable, requested)?;
        self.remaining -= data.len() as u64;
        self.consumed += data.len() as u64;
        Ok((data, found))
    }

    fn peek(&mut self, no_poll: bool) -> Result<&[u8]> {
        let Some(wrapped) = self.wrapped.as_mut() else {
            return Err(BucketError::Eof);
        };
        if self.remaining == 0 {
            return Err(BucketError::Eof);
        }
        let data = wrapped.peek(no_poll)?;
        let visible = data.len().min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
        Ok(&data[..visible])
    }

    fn read_skip(&mut self, requested: u64) -> Result<u64> {
        self.retire_if_done()?;
        let requested = requested.min(self.remaining);
        let wrapped = self.wrapped.as_mut().ok_or(BucketError::Eof)?;
        let skipped = wrapped.read_skip(requested)?;
        self.remaining -= skipped;
        self.consumed += skipped;
        Ok(skipped)
    }

    fn remaining_bytes(&mut self) -> Result<u64> {
        Ok(self.remaining)
    }

    fn reset(&mut self) -> Result<()> {
        let Some(wrapped) = self.wrapped.as_mut() else {
            return Err(BucketError::NotSupported(Self::NAME));
        };
        wrapped.reset()?;
        self.remaining = self.limit;
        self.consumed = 0;
        Ok(())
    }

    fn duplicate(&mut self, for_reset: bool) -> Result<Box<dyn Bucket>> {
        let Some(wrapped) = self.wrapped.as_mut() else {
            return Err(BucketError::NotSupported(Self::NAME));
        };
        let dup_inner = wrapped.duplicate(for_reset)?;
        let mut dup = LimitBucket::new(dup_inner, self.limit);
        dup.remaining = self.remaining;
        dup.consumed = self.consumed;
        Ok(Box::new(dup))
    }

    fn position(&self) -> Option<u64> {
        Some(self.consumed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::{READ_ALL, SimpleBucket};

    #[test]
    fn caps_total_bytes() {
        let mut b = LimitBucket::new(SimpleBucket::copied(b"0123456789"), 4);
        assert_eq!(b.read(READ_ALL).unwrap(), b"0123");
        assert!(b.read(1).unwrap_err().is_eof());
        assert_eq!(b.position(), Some(4));
    }

    #[test]
    fn peek_clamps_to_budget() {
        let mut b = LimitBucket::new(SimpleBucket::copied(b"0123456789"), 4);
        assert_eq!(b.peek(false).unwrap(), b"0123");
        b.read(2).unwrap();
        assert_eq!(b.peek(false).unwrap(), b"23");
    }

    #[test]
    fn skip_counts_against_budget() {
        let mut b = LimitBucket::new(SimpleBucket::copied(b"0123456789"), 6);
        assert_eq!(b.read_skip(100).unwrap(), 6);
        assert!(b.read(1).unwrap_err().is_eof());
    }

    #[test]
    fn reset_restores_budget() {
        let mut b = LimitBucket::new(SimpleBucket::copied(b"0123456789"), 4);
        b.read(3).unwrap();
        b.reset().unwrap();
        assert_eq!(b.remaining_bytes().unwrap(), 4);
        assert_eq!(b.read(READ_ALL).unwrap(), b"0123");
    }

    #[test]
    fn reset_after_exhaustion_is_not_supported() {
        let mut b = LimitBucket::new(SimpleBucket::copied(b"0123"), 2);
        b.read(READ_ALL).unwrap();
        assert!(b.read(1).unwrap_err().is_eof());
        // The wrapped bucket has been released with the budget.
        assert!(matches!(
            b.reset().unwrap_err(),
            BucketError::NotSupported(_)
        ));
    }

    #[test]
    fn duplicate_keeps_progress() {
        let mut b = LimitBucket::new(SimpleBucket::copied(b"0123456789"), 6);
        b.read(2).unwrap();
        let mut dup = b.duplicate(false).unwrap();
        assert_eq!(dup.read(READ_ALL).unwrap(), b"2345");
        assert_eq!(b.read(READ_ALL).unwrap(), b"2345");
    }
}
