// Pull-based byte streams ("buckets") and their composable adapters.
//
// A bucket hands out borrowed slices of its current data; the borrow rules
// make the lifetime contract explicit: a slice returned by `read`, `peek` or
// `read_until_eol` is valid until the next call on the same bucket.
//
// # Modules
//
// - `simple`    — in-memory leaf bucket (static / owned / copied)
// - `file`      — buffered view over a shared file handle
// - `aggregate` — sequences multiple buckets into one stream
// - `limit`     — caps the number of bytes exposed from a wrapped bucket
// - `block`     — hides embedded-bucket introspection, returns ownership
// - `compress`  — streaming deflate/zlib/gzip compression and decompression
// - `hash`      — transparent checksum computation / verification

pub mod aggregate;
pub mod block;
pub mod compress;
pub mod file;
pub mod hash;
pub mod limit;
pub mod simple;

pub use aggregate::AggregateBucket;
pub use block::BlockBucket;
pub use compress::{CompressBucket, CompressionFormat, DecompressBucket};
pub use file::{FileBucket, FileHandle};
pub use hash::{HashAlgorithm, HashBucket, HashResult, HashResultSlot};
pub use limit::LimitBucket;
pub use simple::SimpleBucket;

use crate::error::{BucketError, Result};

/// Request "everything currently available".
pub const READ_ALL: usize = usize::MAX;

bitflags::bitflags! {
    /// Set of acceptable line terminators for [`Bucket::read_until_eol`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NewlineSet: u8 {
        const LF = 0x01;
        const CR = 0x02;
        const CRLF = 0x04;
        /// NUL pseudo-terminator, used by length-prefixed binary headers.
        /// Not part of `ANY`.
        const NUL = 0x08;
        const ANY = Self::LF.bits() | Self::CR.bits() | Self::CRLF.bits();
    }
}

/// The terminator actually found by [`Bucket::read_until_eol`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Newline {
    /// No terminator in the returned data.
    None,
    Lf,
    Cr,
    CrLf,
    /// The data ends in `\r` and a following `\n` may still arrive.
    CrLfSplit,
    Nul,
}

/// A lazily-pulled, possibly-transforming byte stream.
///
/// # Contract
///
/// - `read` consumes up to `requested` bytes and may return fewer; it fails
///   with [`BucketError::Eof`] only when nothing remains, and with
///   [`BucketError::WouldBlock`] when a non-blocking source has no data yet.
/// - `peek` is non-destructive and never returns `WouldBlock`; it may return
///   an empty slice without error. It must return `Eof` only when the stream
///   is truly exhausted: after a successful non-`Eof` peek, the next `read`
///   must not report `Eof`.
/// - A slice returned from any read operation is invalidated by the next
///   call on the same bucket (the borrow checker enforces this).
/// - `reset` and `duplicate` either fully succeed or leave the bucket
///   untouched, reporting [`BucketError::NotSupported`].
pub trait Bucket {
    /// Stable type tag, used by [`Bucket::read_bucket`] extraction.
    fn name(&self) -> &'static str;

    /// Read and consume up to `requested` bytes.
    fn read(&mut self, requested: usize) -> Result<&[u8]>;

    /// Look at available data without consuming it.
    ///
    /// With `no_poll` set the bucket must not pull from upstream; it may
    /// then legitimately return an empty slice.
    fn peek(&mut self, no_poll: bool) -> Result<&[u8]> {
        let _ = no_poll;
        Ok(&[])
    }

    /// Read up to and including the next acceptable line terminator.
    ///
    /// Returns the data (terminator included, if present) and which
    /// terminator was found. A lone trailing `\r` while `CRLF` is acceptable
    /// is reported as [`Newline::CrLfSplit`] unless the read was deliberately
    /// bounded at that `\r` because the next byte was already known not to
    /// be `\n`.
    fn read_until_eol(
        &mut self,
        acceptable: NewlineSet,
        requested: usize,
    ) -> Result<(&[u8], Newline)> {
        read_until_eol_scan(self, acceptable, requested)
    }

    /// Discard up to `requested` bytes without exposing them.
    fn read_skip(&mut self, requested: u64) -> Result<u64> {
        let mut skipped = 0u64;
        while skipped < requested {
            let chunk = usize::try_from(requested - skipped).unwrap_or(READ_ALL);
            match self.read(chunk) {
                Ok(data) => {
                    if data.is_empty() {
                        break;
                    }
                    skipped += data.len() as u64;
                }
                Err(e) if e.is_eof() => {
                    if skipped == 0 {
                        return Err(e);
                    }
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(skipped)
    }

    /// Total bytes left in the stream, when determinable without consuming.
    fn remaining_bytes(&mut self) -> Result<u64> {
        Err(BucketError::NotSupported(self.name()))
    }

    /// Rewind to the bucket's original start.
    fn reset(&mut self) -> Result<()> {
        Err(BucketError::NotSupported(self.name()))
    }

    /// Produce an independent reader over the same logical data.
    ///
    /// With `for_reset` the duplicate must survive a future `reset`, which
    /// may require copying already-consumed prefix bytes.
    fn duplicate(&mut self, for_reset: bool) -> Result<Box<dyn Bucket>> {
        let _ = for_reset;
        Err(BucketError::NotSupported(self.name()))
    }

    /// Current position in the produced stream, if known.
    fn position(&self) -> Option<u64> {
        None
    }

    /// Extract an embedded bucket of the given type tag if it is the very
    /// next data, transferring ownership to the caller.
    fn read_bucket(&mut self, type_name: &str) -> Option<Box<dyn Bucket>> {
        let _ = type_name;
        None
    }
}

impl<T: Bucket + ?Sized> Bucket for Box<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn read(&mut self, requested: usize) -> Result<&[u8]> {
        (**self).read(requested)
    }

    fn peek(&mut self, no_poll: bool) -> Result<&[u8]> {
        (**self).peek(no_poll)
    }

    fn read_until_eol(
        &mut self,
        acceptable: NewlineSet,
        requested: usize,
    ) -> Result<(&[u8], Newline)> {
        (**self).read_until_eol(acceptable, requested)
    }

    fn read_skip(&mut self, requested: u64) -> Result<u64> {
        (**self).read_skip(requested)
    }

    fn remaining_bytes(&mut self) -> Result<u64> {
        (**self).remaining_bytes()
    }

    fn reset(&mut self) -> Result<()> {
        (**self).reset()
    }

    fn duplicate(&mut self, for_reset: bool) -> Result<Box<dyn Bucket>> {
        (**self).duplicate(for_reset)
    }

    fn position(&self) -> Option<u64> {
        (**self).position()
    }

    fn read_bucket(&mut self, type_name: &str) -> Option<Box<dyn Bucket>> {
        (**self).read_bucket(type_name)
    }
}

// ---------------------------------------------------------------------------
// Newline scanning
// ---------------------------------------------------------------------------

/// Shared implementation of [`Bucket::read_until_eol`], in terms of
/// `peek` + `read`. Buckets with their own buffering (the file bucket) call
/// this after priming their buffer.
pub(crate) fn read_until_eol_scan<B: Bucket + ?Sized>(
    bucket: &mut B,
    acceptable: NewlineSet,
    requested: usize,
) -> Result<(&[u8], Newline)> {
    assert!(
        acceptable.intersects(NewlineSet::ANY | NewlineSet::NUL),
        "empty newline set"
    );
    assert!(requested > 0);

    // Per-byte terminators that end a line on their own.
    let want_cr = acceptable.intersects(NewlineSet::CR | NewlineSet::CRLF);
    let want_lf = acceptable.intersects(NewlineSet::LF | NewlineSet::CRLF);
    let want_nul = acceptable.contains(NewlineSet::NUL);
    // When only CRLF is acceptable a terminator needs two bytes of room.
    let extra = if acceptable & NewlineSet::ANY == NewlineSet::CRLF {
        2
    } else {
        1
    };

    let mut single_cr_requested = false;
    let want = match bucket.peek(false) {
        Err(e) => return Err(e),
        Ok(peeked) if peeked.is_empty() => extra.min(requested),
        Ok(peeked) => {
            let window = peeked.len().min(requested);
            let cr = want_cr.then(|| memchr(b'\r', &peeked[..window])).flatten();
            let lf = want_lf.then(|| memchr(b'\n', &peeked[..window])).flatten();
            let nul = want_nul.then(|| memchr(b'\0', &peeked[..window])).flatten();
            let first = [cr, lf, nul].into_iter().flatten().min();

            match first {
                Some(i) if peeked[i] == b'\r' => {
                    if acceptable.contains(NewlineSet::CRLF)
                        && i + 1 < peeked.len()
                        && peeked[i + 1] == b'\n'
                    {
                        i + 2
                    } else {
                        if acceptable.contains(NewlineSet::CRLF) && i + 1 < peeked.len() {
                            // The next byte is visible and is not '\n', so
                            // stopping right after this CR is a complete CR.
                            single_cr_requested = true;
                        }
                        i + 1
                    }
                }
                Some(i) => i + 1,
                None => (window + extra).min(requested),
            }
        }
    };

    let data = bucket.read(want)?;
    let found = classify_eol(data, acceptable, single_cr_requested && data.len() == want);
    Ok((data, found))
}

fn classify_eol(data: &[u8], acceptable: NewlineSet, cr_was_bounded: bool) -> Newline {
    let Some(&last) = data.last() else {
        return Newline::None;
    };

    if acceptable.contains(NewlineSet::CRLF) && data.len() >= 2 && data.ends_with(b"\r\n") {
        Newline::CrLf
    } else if acceptable.contains(NewlineSet::LF) && last == b'\n' {
        Newline::Lf
    } else if acceptable & (NewlineSet::CRLF | NewlineSet::CR) == NewlineSet::CR && last == b'\r' {
        Newline::Cr
    } else if acceptable.contains(NewlineSet::CRLF) && last == b'\r' {
        if cr_was_bounded {
            Newline::Cr
        } else {
            Newline::CrLfSplit
        }
    } else if acceptable.contains(NewlineSet::NUL) && last == b'\0' {
        Newline::Nul
    } else {
        Newline::None
    }
}

fn memchr(needle: u8, haystack: &[u8]) -> Option<usize> {
    haystack.iter().position(|&b| b == needle)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
