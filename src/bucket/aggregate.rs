// Sequences a list of child buckets into one logical stream.

use crate::bucket::{Bucket, Newline, NewlineSet};
use crate::error::{BucketError, Result};

/// A bucket that drains its children in order.
///
/// A child that raises `Eof` is unlinked and dropped (the `Eof` is cleared,
/// not propagated) and reading continues with the next child. A bucket
/// created with [`AggregateBucket::keep_open`] retains exhausted children so
/// that a pre-seeded queue can be replayed with `reset`.
pub struct AggregateBucket {
    children: Vec<Box<dyn Bucket>>,
    cur: usize,
    keep_open: bool,
}

enum Probe {
    Ready,
    Exhausted,
}

impl AggregateBucket {
    pub const NAME: &'static str = "aggregate";

    pub fn new() -> Self {
        Self::with_mode(false)
    }

    pub fn keep_open() -> Self {
        Self::with_mode(true)
    }

    fn with_mode(keep_open: bool) -> Self {
        Self {
            children: Vec::new(),
            cur: 0,
            keep_open,
        }
    }

    /// Add a bucket at the end of the sequence.
    pub fn append(&mut self, bucket: impl Bucket + 'static) {
        self.children.push(Box::new(bucket));
    }

    /// Add a bucket to be read next, before the remaining children.
    pub fn prepend(&mut self, bucket: impl Bucket + 'static) {
        self.children.insert(self.cur, Box::new(bucket));
    }

    /// Drop consumed children unless the bucket keeps them for reset.
    fn cleanup(&mut self) {
        if !self.keep_open && self.cur > 0 {
            self.children.drain(..self.cur);
            self.cur = 0;
        }
    }

    /// Advance `cur` to the first child that reports data, dropping
    /// exhausted ones along the way. Returns false when all are exhausted.
    fn settle(&mut self, no_poll: bool) -> Result<bool> {
        loop {
            self.cleanup();
            if self.cur >= self.children.len() {
                return Ok(false);
            }
            let probe = match self.children[self.cur].peek(no_poll) {
                Ok(_) => Probe::Ready,
                Err(e) if e.is_eof() => Probe::Exhausted,
                Err(e) => return Err(e),
            };
            match probe {
                Probe::Ready => return Ok(true),
                Probe::Exhausted => self.cur += 1,
            }
        }
    }
}

impl Default for AggregateBucket {
    fn default() -> Self {
        Self::new()
    }
}

impl Bucket for AggregateBucket {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn read(&mut self, requested: usize) -> Result<&[u8]> {
        if !self.settle(false)? {
            return Err(BucketError::Eof);
        }
        self.children[self.cur].read(requested)
    }

    fn read_until_eol(
        &mut self,
        acceptable: NewlineSet,
        requested: usize,
    ) -> Result<(&[u8], Newline)> {
        if !self.settle(false)? {
            return Err(BucketError::Eof);
        }
        self.children[self.cur].read_until_eol(acceptable, requested)
    }

    fn peek(&mut self, no_poll: bool) -> Result<&[u8]> {
        if !self.settle(no_poll)? {
            return Err(BucketError::Eof);
        }
        self.children[self.cur].peek(no_poll)
    }

    fn read_skip(&mut self, requested: u64) -> Result<u64> {
        let mut skipped = 0u64;
        while skipped < requested {
            self.cleanup();
            if self.cur >= self.children.len() {
                break;
            }
            match self.children[self.cur].read_skip(requested - skipped) {
                Ok(0) => self.cur += 1,
                Ok(n) => skipped += n,
                Err(e) if e.is_eof() => self.cur += 1,
                Err(e) => return Err(e),
            }
        }
        if skipped == 0 && self.cur >= self.children.len() {
            return Err(BucketError::Eof);
        }
        Ok(skipped)
    }

    fn remaining_bytes(&mut self) -> Result<u64> {
        let mut total = 0u64;
        for child in &mut self.children[self.cur..] {
            total += child.remaining_bytes()?;
        }
        Ok(total)
    }

    fn reset(&mut self) -> Result<()> {
        if !self.keep_open {
            return Err(BucketError::NotSupported(Self::NAME));
        }
        let upto = self.children.len().min(self.cur + 1);
        for child in &mut self.children[..upto] {
            child.reset()?;
        }
        self.cur = 0;
        Ok(())
    }

    fn duplicate(&mut self, for_reset: bool) -> Result<Box<dyn Bucket>> {
        let mut dup = AggregateBucket::with_mode(self.keep_open);
        for child in &mut self.children {
            dup.children.push(child.duplicate(for_reset)?);
        }
        dup.cur = self.cur;
        Ok(Box::new(dup))
    }

    fn read_bucket(&mut self, type_name: &str) -> Option<Box<dyn Bucket>> {
        self.cleanup();
        if self.cur < self.children.len() && self.children[self.cur].name() == type_name {
            // `cur` now indexes the next child.
            Some(self.children.remove(self.cur))
        } else {
            None
        }
    }
}
