// Transparent checksum computation/verification over a wrapped bucket.

use std::cell::RefCell;
use std::rc::Rc;

use md5::Md5;
use sha1::{Digest, Sha1};
use sha2::Sha256;

use crate::bucket::{Bucket, Newline, NewlineSet};
use crate::error::{BucketError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Md5,
    Sha1,
    Sha256,
    Crc32,
    Adler32,
}

impl HashAlgorithm {
    pub fn digest_len(self) -> usize {
        match self {
            HashAlgorithm::Md5 => 16,
            HashAlgorithm::Sha1 => 20,
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Crc32 | HashAlgorithm::Adler32 => 4,
        }
    }
}

/// A finalized checksum plus the number of bytes it covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashResult {
    pub algorithm: HashAlgorithm,
    pub digest: Vec<u8>,
    pub bytes_hashed: u64,
}

impl HashResult {
    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(self.digest.len() * 2);
        for b in &self.digest {
            s.push_str(&format!("{b:02x}"));
        }
        s
    }

    /// Parse an expected digest from its hex rendering. The byte count is
    /// unknown for an expectation and set to 0.
    pub fn from_hex(algorithm: HashAlgorithm, hex: &str) -> Result<Self> {
        let hex = hex.trim();
        if hex.len() != algorithm.digest_len() * 2 {
            return Err(BucketError::Malformed(format!(
                "digest '{hex}' has {} hex chars, expected {}",
                hex.len(),
                algorithm.digest_len() * 2
            )));
        }
        let mut digest = Vec::with_capacity(algorithm.digest_len());
        for i in (0..hex.len()).step_by(2) {
            let byte = u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|_| BucketError::Malformed(format!("invalid hex digest '{hex}'")))?;
            digest.push(byte);
        }
        Ok(Self {
            algorithm,
            digest,
            bytes_hashed: 0,
        })
    }
}

/// Shared slot the creator of a fill-mode hash bucket keeps; filled once the
/// wrapped stream reaches EOF.
pub type HashResultSlot = Rc<RefCell<Option<HashResult>>>;

/// Running state, one strongly-typed payload per algorithm.
enum Hasher {
    Md5(Md5),
    Sha1(Sha1),
    Sha256(Sha256),
    Crc32(crc32fast::Hasher),
    Adler32(simd_adler32::Adler32),
}

impl Hasher {
    fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Md5 => Hasher::Md5(Md5::new()),
            HashAlgorithm::Sha1 => Hasher::Sha1(Sha1::new()),
            HashAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
            HashAlgorithm::Crc32 => Hasher::Crc32(crc32fast::Hasher::new()),
            HashAlgorithm::Adler32 => Hasher::Adler32(simd_adler32::Adler32::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Md5(h) => h.update(data),
            Hasher::Sha1(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
            Hasher::Crc32(h) => h.update(data),
            Hasher::Adler32(h) => h.write(data),
        }
    }

    fn finalize(self) -> Vec<u8> {
        match self {
            Hasher::Md5(h) => h.finalize().to_vec(),
            Hasher::Sha1(h) => h.finalize().to_vec(),
            Hasher::Sha256(h) => h.finalize().to_vec(),
            Hasher::Crc32(h) => h.finalize().to_be_bytes().to_vec(),
            Hasher::Adler32(h) => h.finish().to_be_bytes().to_vec(),
        }
    }
}

/// Hashes every byte that flows through `read`/`read_until_eol`, leaving
/// `peek` side-effect free.
///
/// Construction picks exactly one of two modes: fill a result slot, or
/// verify against an expected digest. Internally both share one path;
/// verification fills a throwaway result and compares it at finalize time.
/// The hash finalizes once, on the first EOF; a verification mismatch
/// replaces that EOF with a checksum error.
pub struct HashBucket<B: Bucket> {
    inner: B,
    algorithm: HashAlgorithm,
    hasher: Option<Hasher>,
    slot: Option<HashResultSlot>,
    expected: Option<HashResult>,
    bytes_hashed: u64,
    finished: bool,
}

impl<B: Bucket> HashBucket<B> {
    pub const NAME: &'static str = "hash";

    /// Hash the stream and publish the result into the returned slot at EOF.
    pub fn new_fill(inner: B, algorithm: HashAlgorithm) -> (Self, HashResultSlot) {
        let slot: HashResultSlot = Rc::new(RefCell::new(None));
        let bucket = Self {
            inner,
            algorithm,
            hasher: Some(Hasher::new(algorithm)),
            slot: Some(Rc::clone(&slot)),
            expected: None,
            bytes_hashed: 0,
            finished: false,
        };
        (bucket, slot)
    }

    /// Verify the stream against `expected`; the EOF read fails with
    /// [`BucketError::ChecksumMismatch`] when the digests differ.
    pub fn new_verify(inner: B, expected: HashResult) -> Self {
        Self {
            inner,
            algorithm: expected.algorithm,
            hasher: Some(Hasher::new(expected.algorithm)),
            slot: None,
            expected: Some(expected),
            bytes_hashed: 0,
            finished: false,
        }
    }

    pub fn into_inner(self) -> B {
        self.inner
    }

    /// Finalizes the hash once, on the first EOF; split over individual
    /// fields so it can run while `self.inner` is still borrowed for the
    /// lifetime of a returned read buffer.
    fn finalize_hash(
        finished: &mut bool,
        hasher: &mut Option<Hasher>,
        algorithm: HashAlgorithm,
        bytes_hashed: u64,
        expected: &Option<HashResult>,
        slot: &Option<HashResultSlot>,
    ) -> Result<()> {
        if *finished {
            return Ok(());
        }
        *finished = true;

        let Some(hasher) = hasher.take() else {
            return Ok(());
        };
        let result = HashResult {
            algorithm,
            digest: hasher.finalize(),
            bytes_hashed,
        };

        if let Some(expected) = expected
            && expected.digest != result.digest
        {
            return Err(BucketError::ChecksumMismatch {
                expected: expected.to_hex(),
                found: result.to_hex(),
            });
        }
        if let Some(slot) = slot {
            *slot.borrow_mut() = Some(result);
        }
        Ok(())
    }
}

impl<B: Bucket> Bucket for HashBucket<B> {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn read(&mut self, requested: usize) -> Result<&[u8]> {
        let eof_err = match self.inner.read(requested) {
            Ok(data) => {
                if let Some(h) = self.hasher.as_mut() {
                    h.update(data);
                    self.bytes_hashed += data.len() as u64;
                }
                return Ok(data);
            }
            Err(e) if e.is_eof() => e,
            Err(e) => return Err(e),
        };
        // Compose the finalize outcome with the EOF instead of discarding it.
        Self::finalize_hash(
            &mut self.finished,
            &mut self.hasher,
            self.algorithm,
            self.bytes_hashed,
            &self.expected,
            &self.slot,
        )?;
        Err(eof_err)
    }

    fn read_until_eol(
        &mut self,
        acceptable: NewlineSet,
        requested: usize,
    ) -> Result<(&[u8], Newline)> {
        let eof_err = match self.inner.read_until_eol(acceptable, requested) {
            Ok((data, found)) => {
                if let Some(h) = self.hasher.as_mut() {
                    h.update(data);
                    self.bytes_hashed += data.len() as u64;
                }
                return Ok((data, found));
            }
            Err(e) if e.is_eof() => e,
            Err(e) => return Err(e),
        };
        Self::finalize_hash(
            &mut self.finished,
            &mut self.hasher,
            self.algorithm,
            self.bytes_hashed,
            &self.expected,
            &self.slot,
        )?;
        Err(eof_err)
    }

    fn peek(&mut self, no_poll: bool) -> Result<&[u8]> {
        self.inner.peek(no_poll)
    }

    fn reset(&mut self) -> Result<()> {
        self.inner.reset()?;
        self.hasher = Some(Hasher::new(self.algorithm));
        self.bytes_hashed = 0;
        self.finished = false;
        Ok(())
    }

    fn duplicate(&mut self, for_reset: bool) -> Result<Box<dyn Bucket>> {
        if self.slot.is_none() {
            // Verify-only: nobody observes a clone's verification, so the
            // duplicate drops hashing entirely.
            self.inner.duplicate(for_reset)
        } else {
            let (dup, _slot) = HashBucket::new_fill(self.inner.duplicate(for_reset)?, self.algorithm);
            Ok(Box::new(dup))
        }
    }
}
