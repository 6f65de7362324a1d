// Decoder for git's generic chunk-indexed container format.
//
// Commit-graph and multi-pack-index files share one framing: a 4-byte
// signature, oid-type and version bytes, a chunk count, caller-declared
// reserved header bytes, then `(count + 1)` table entries of 4-byte id and
// 8-byte big-endian offset. The final entry is a sentinel whose offset
// marks the end of the last chunk.

use crate::bucket::{Bucket, LimitBucket};
use crate::error::{BucketError, Result};

/// One chunk directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkEntry {
    pub id: [u8; 4],
    pub offset: u64,
}

/// Parses the chunk directory and hands out per-chunk readers.
pub struct ChunkFileBucket<B: Bucket> {
    inner: B,
    signature: [u8; 4],
    extra_header_len: usize,
    scratch: Vec<u8>,
    oid_type: u8,
    version: u8,
    /// Directory including the trailing sentinel entry.
    entries: Vec<ChunkEntry>,
    parsed: bool,
}

impl<B: Bucket> ChunkFileBucket<B> {
    pub const NAME: &'static str = "git.chunkfile";

    /// `extra_header_len` is the number of reserved header bytes between
    /// the chunk count and the table, fixed per file format.
    pub fn new(inner: B, signature: [u8; 4], extra_header_len: usize) -> Self {
        Self {
            inner,
            signature,
            extra_header_len,
            scratch: Vec::new(),
            oid_type: 0,
            version: 0,
            entries: Vec::new(),
            parsed: false,
        }
    }

    fn fill_scratch(&mut self, want_total: usize) -> Result<()> {
        while self.scratch.len() < want_total {
            let data = match self.inner.read(want_total - self.scratch.len()) {
                Ok(data) => data,
                Err(e) if e.is_eof() => {
                    return Err(BucketError::Malformed(format!(
                        "chunk file truncated after {} of {want_total} header bytes",
                        self.scratch.len()
                    )));
                }
                Err(e) => return Err(e),
            };
            if data.is_empty() {
                return Err(BucketError::WouldBlock);
            }
            self.scratch.extend_from_slice(data);
        }
        Ok(())
    }

    /// Parse the header and chunk directory (once); returns
    /// `(oid_type, version, chunk_count)`.
    pub fn read_info(&mut self) -> Result<(u8, u8, u8)> {
        if self.parsed {
            return Ok((self.oid_type, self.version, (self.entries.len() - 1) as u8));
        }

        let fixed = 7 + self.extra_header_len;
        self.fill_scratch(fixed)?;

        if self.scratch[..4] != self.signature {
            return Err(BucketError::Malformed(format!(
                "chunk file signature {:02x?} does not match expected {:02x?} (\"{}\")",
                &self.scratch[..4],
                self.signature,
                String::from_utf8_lossy(&self.signature),
            )));
        }
        let oid_type = self.scratch[4];
        let version = self.scratch[5];
        let chunk_count = self.scratch[6] as usize;

        let table_len = 12 * (chunk_count + 1);
        self.fill_scratch(fixed + table_len)?;

        let mut entries = Vec::with_capacity(chunk_count + 1);
        for i in 0..=chunk_count {
            let at = fixed + 12 * i;
            let mut id = [0u8; 4];
            id.copy_from_slice(&self.scratch[at..at + 4]);
            let offset = u64::from_be_bytes(self.scratch[at + 4..at + 12].try_into().unwrap());
            if let Some(prev) = entries.last().map(|e: &ChunkEntry| e.offset)
                && offset < prev
            {
                return Err(BucketError::Malformed(format!(
                    "chunk table offset {offset} for entry {i} goes backwards (previous {prev})"
                )));
            }
            entries.push(ChunkEntry { id, offset });
        }

        self.oid_type = oid_type;
        self.version = version;
        self.entries = entries;
        self.parsed = true;
        self.scratch = Vec::new();
        log::debug!(
            "chunk file '{}': oid type {}, version {}, {} chunks",
            String::from_utf8_lossy(&self.signature),
            oid_type,
            version,
            chunk_count
        );
        Ok((self.oid_type, self.version, chunk_count as u8))
    }

    pub fn oid_type(&self) -> Option<u8> {
        self.parsed.then_some(self.oid_type)
    }

    pub fn version(&self) -> Option<u8> {
        self.parsed.then_some(self.version)
    }

    pub fn chunk_count(&self) -> Option<u8> {
        self.parsed.then_some((self.entries.len() - 1) as u8)
    }

    /// The parsed directory, sentinel included.
    pub fn entries(&self) -> &[ChunkEntry] {
        &self.entries
    }

    /// Open a bounded reader over the chunk with the given 4-byte id.
    ///
    /// Duplicates the underlying stream, rewinds it to the chunk's offset
    /// and caps it at the next entry's offset.
    pub fn read_chunk_bucket(&mut self, id: &[u8; 4]) -> Result<LimitBucket<Box<dyn Bucket>>> {
        self.read_info()?;

        let idx = self.entries[..self.entries.len() - 1]
            .iter()
            .position(|e| &e.id == id)
            .ok_or_else(|| {
                BucketError::Malformed(format!(
                    "chunk '{}' not found in file",
                    String::from_utf8_lossy(id)
                ))
            })?;

        let start = self.entries[idx].offset;
        let length = self.entries[idx + 1].offset - start;

        let mut dup = self.inner.duplicate(true)?;
        dup.reset()?;
        let mut to_skip = start;
        while to_skip > 0 {
            match dup.read_skip(to_skip) {
                Ok(0) => return Err(BucketError::WouldBlock),
                Ok(n) => to_skip -= n,
                Err(e) if e.is_eof() => {
                    return Err(BucketError::Malformed(format!(
                        "chunk offset {start} is outside the file"
                    )));
                }
                Err(e) => return Err(e),
            }
        }

        Ok(LimitBucket::new(dup, length))
    }
}

impl<B: Bucket> Bucket for ChunkFileBucket<B> {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn read(&mut self, _requested: usize) -> Result<&[u8]> {
        self.read_info()?;
        Err(BucketError::Eof)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::{READ_ALL, SimpleBucket};

    /// Build a container: signature, oid type 1, version 1, two chunks and
    /// the sentinel.
    fn sample_file() -> Vec<u8> {
        let chunk_a = b"chunk A payload".to_vec();
        let chunk_b = b"B data".to_vec();

        let mut v = Vec::new();
        v.extend_from_slice(b"CGPH");
        v.push(1); // oid type
        v.push(1); // version
        v.push(2); // chunk count
        let table_start = v.len() + 12 * 3;
        let a_start = table_start as u64;
        let b_start = a_start + chunk_a.len() as u64;
        let end = b_start + chunk_b.len() as u64;

        v.extend_from_slice(b"AAAA");
        v.extend_from_slice(&a_start.to_be_bytes());
        v.extend_from_slice(b"BBBB");
        v.extend_from_slice(&b_start.to_be_bytes());
        v.extend_from_slice(b"\0\0\0\0");
        v.extend_from_slice(&end.to_be_bytes());

        v.extend_from_slice(&chunk_a);
        v.extend_from_slice(&chunk_b);
        v
    }

    #[test]
    fn parses_directory() {
        let mut b = ChunkFileBucket::new(SimpleBucket::from_vec(sample_file()), *b"CGPH", 0);
        let (oid_type, version, chunks) = b.read_info().unwrap();
        assert_eq!((oid_type, version, chunks), (1, 1, 2));
        assert_eq!(b.entries().len(), 3);
    }

    #[test]
    fn chunk_lengths_come_from_offset_deltas() {
        let mut b = ChunkFileBucket::new(SimpleBucket::from_vec(sample_file()), *b"CGPH", 0);

        let mut a = b.read_chunk_bucket(b"AAAA").unwrap();
        assert_eq!(a.remaining_bytes().unwrap(), 15);
        assert_eq!(a.read(READ_ALL).unwrap(), b"chunk A payload");
        assert!(a.read(1).unwrap_err().is_eof());

        let mut bb = b.read_chunk_bucket(b"BBBB").unwrap();
        assert_eq!(bb.remaining_bytes().unwrap(), 6);
        assert_eq!(bb.read(READ_ALL).unwrap(), b"B data");
    }

    #[test]
    fn absent_chunk_id_fails() {
        let mut b = ChunkFileBucket::new(SimpleBucket::from_vec(sample_file()), *b"CGPH", 0);
        let err = b.read_chunk_bucket(b"ZZZZ").unwrap_err();
        assert!(matches!(err, BucketError::Malformed(_)), "got {err:?}");
        // The sentinel id is not a real chunk.
        assert!(b.read_chunk_bucket(b"\0\0\0\0").is_err());
    }

    #[test]
    fn rejects_wrong_signature() {
        let mut b = ChunkFileBucket::new(SimpleBucket::from_vec(sample_file()), *b"MIDX", 0);
        assert!(matches!(
            b.read_info().unwrap_err(),
            BucketError::Malformed(_)
        ));
    }

    #[test]
    fn rejects_truncated_table() {
        let mut data = sample_file();
        data.truncate(20);
        let mut b = ChunkFileBucket::new(SimpleBucket::from_vec(data), *b"CGPH", 0);
        assert!(matches!(
            b.read_info().unwrap_err(),
            BucketError::Malformed(_)
        ));
    }

    #[test]
    fn reserved_header_bytes_shift_the_table() {
        // Same layout with 4 reserved bytes after the chunk count.
        let mut v = Vec::new();
        v.extend_from_slice(b"MIDX");
        v.push(1);
        v.push(1);
        v.push(1);
        v.extend_from_slice(&[0xEE; 4]);
        let table_start = (v.len() + 12 * 2) as u64;
        v.extend_from_slice(b"OIDF");
        v.extend_from_slice(&table_start.to_be_bytes());
        v.extend_from_slice(b"\0\0\0\0");
        v.extend_from_slice(&(table_start + 4).to_be_bytes());
        v.extend_from_slice(b"oidf");

        let mut b = ChunkFileBucket::new(SimpleBucket::from_vec(v), *b"MIDX", 4);
        assert_eq!(b.read_info().unwrap(), (1, 1, 1));
        let mut c = b.read_chunk_bucket(b"OIDF").unwrap();
        assert_eq!(c.read(READ_ALL).unwrap(), b"oidf");
    }
}
