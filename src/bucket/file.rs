// Buffered bucket over a shared, positionally-read file handle.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use crate::bucket::{Bucket, Newline, NewlineSet, read_until_eol_scan};
use crate::error::{BucketError, Result};

/// Modern disks and OS caches work in 4 KiB blocks; keep reads aligned.
const BUFFER_MIN_ALIGN: usize = 4096;
const BUFFER_SIZE: usize = 65536;

/// Positional-I/O file handle shared between duplicated file buckets.
///
/// All reads are offset-based so duplicates never fight over one seek
/// cursor.
#[derive(Debug)]
pub struct FileHandle {
    file: File,
}

impl FileHandle {
    pub fn new(file: File) -> Arc<Self> {
        Arc::new(Self { file })
    }

    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Arc<Self>> {
        Ok(Self::new(File::open(path)?))
    }

    /// Read into `buf` at the absolute `offset`. Returns the byte count;
    /// 0 means end of file.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            self.file.read_at(buf, offset)
        }
        #[cfg(windows)]
        {
            use std::os::windows::fs::FileExt;
            self.file.seek_read(buf, offset)
        }
    }

    /// Write all of `data` at the absolute `offset`.
    pub fn write_full(&self, offset: u64, data: &[u8]) -> std::io::Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            self.file.write_all_at(data, offset)
        }
        #[cfg(windows)]
        {
            use std::os::windows::fs::FileExt;
            let mut offset = offset;
            let mut data = data;
            while !data.is_empty() {
                let n = self.file.seek_write(data, offset)?;
                offset += n as u64;
                data = &data[n..];
            }
            Ok(())
        }
    }

    pub fn current_size(&self) -> std::io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn truncate(&self, len: u64) -> std::io::Result<()> {
        self.file.set_len(len)
    }

    /// Flush buffered writes; with `to_disk` also force them to stable
    /// storage.
    pub fn flush(&self, to_disk: bool) -> std::io::Result<()> {
        if to_disk {
            self.file.sync_all()
        } else {
            self.file.sync_data()
        }
    }
}

/// A bucket reading a file through an internal block-aligned buffer.
///
/// The total size is sampled once at construction (best effort, `None` if
/// unknown); duplicates share the handle but carry their own buffer and
/// cursor.
pub struct FileBucket {
    handle: Arc<FileHandle>,
    buffer: Vec<u8>,
    buf_pos: usize,
    available: usize,
    /// Offset of the next handle read; the logical stream position is this
    /// minus the unread bytes still buffered.
    file_position: u64,
    size: Option<u64>,
}

impl FileBucket {
    pub const NAME: &'static str = "file";

    pub fn new(handle: Arc<FileHandle>) -> Self {
        let size = handle.current_size().ok();
        Self {
            handle,
            buffer: vec![0; BUFFER_SIZE],
            buf_pos: 0,
            available: 0,
            file_position: 0,
            size,
        }
    }

    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        Ok(Self::new(FileHandle::open(path)?))
    }

    fn stream_position(&self) -> u64 {
        self.file_position - self.available as u64
    }

    fn refill(&mut self, requested: usize) -> Result<()> {
        if self.available > BUFFER_MIN_ALIGN || self.available >= requested {
            // Nothing to refill, or we would move more data than wanted.
            return Ok(());
        }

        let mask = BUFFER_MIN_ALIGN - 1;
        let fixup = (BUFFER_MIN_ALIGN - (self.file_position as usize & mask)) & mask;

        if self.available > 0 {
            if self.buf_pos > 2 * BUFFER_MIN_ALIGN {
                // Compact live data towards the front, keeping the next
                // handle read block-aligned.
                let new_pos = (self.buf_pos & mask) + fixup;
                self.buffer
                    .copy_within(self.buf_pos..self.buf_pos + self.available, new_pos);
                self.buf_pos = new_pos;
            }
            let start = self.buf_pos + self.available;
            let n = self.handle.read_at(self.file_position, &mut self.buffer[start..])?;
            self.available += n;
            self.file_position += n as u64;
        } else {
            self.buf_pos = fixup;
            let n = self
                .handle
                .read_at(self.file_position, &mut self.buffer[fixup..])?;
            self.available = n;
            self.file_position += n as u64;
        }

        Ok(())
    }
}

impl Bucket for FileBucket {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn read(&mut self, requested: usize) -> Result<&[u8]> {
        if self.available == 0 {
            self.refill(requested)?;
            if self.available == 0 {
                return Err(BucketError::Eof);
            }
        }
        let take = requested.min(self.available);
        let start = self.buf_pos;
        self.buf_pos += take;
        self.available -= take;
        Ok(&self.buffer[start..start + take])
    }

    fn read_until_eol(
        &mut self,
        acceptable: NewlineSet,
        requested: usize,
    ) -> Result<(&[u8], Newline)> {
        // Prime the buffer so the scan peeks real data instead of dribbling
        // through one-byte reads.
        match self.refill(requested) {
            Ok(()) => {}
            Err(e) if !e.is_read_error() => {}
            Err(e) => return Err(e),
        }
        read_until_eol_scan(self, acceptable, requested)
    }

    fn peek(&mut self, no_poll: bool) -> Result<&[u8]> {
        if self.available == 0 && !no_poll {
            self.refill(crate::bucket::READ_ALL)?;
            if self.available == 0 {
                return Err(BucketError::Eof);
            }
        }
        Ok(&self.buffer[self.buf_pos..self.buf_pos + self.available])
    }

    fn read_skip(&mut self, requested: u64) -> Result<u64> {
        let mut skipped = requested.min(self.available as u64);
        self.buf_pos += skipped as usize;
        self.available -= skipped as usize;
        if skipped == requested {
            return Ok(skipped);
        }

        match self.size {
            Some(size) => {
                // Jump the file cursor without reading the bytes.
                let ahead = (requested - skipped).min(size.saturating_sub(self.file_position));
                self.file_position += ahead;
                skipped += ahead;
                if skipped == 0 {
                    return Err(BucketError::Eof);
                }
                Ok(skipped)
            }
            None => {
                // Unknown size: fall back to reading through the buffer.
                let mut rest = requested - skipped;
                while rest > 0 {
                    match self.read(usize::try_from(rest).unwrap_or(usize::MAX)) {
                        Ok(data) => {
                            skipped += data.len() as u64;
                            rest -= data.len() as u64;
                        }
                        Err(e) if e.is_eof() => break,
                        Err(e) => return Err(e),
                    }
                }
                if skipped == 0 {
                    return Err(BucketError::Eof);
                }
                Ok(skipped)
            }
        }
    }

    fn remaining_bytes(&mut self) -> Result<u64> {
        match self.size {
            Some(size) => Ok(size.saturating_sub(self.stream_position())),
            None => Err(BucketError::NotSupported(Self::NAME)),
        }
    }

    fn reset(&mut self) -> Result<()> {
        self.buf_pos = 0;
        self.available = 0;
        self.file_position = 0;
        Ok(())
    }

    fn duplicate(&mut self, _for_reset: bool) -> Result<Box<dyn Bucket>> {
        // Duplicates share the ref-counted handle but not the buffer.
        let mut dup = FileBucket::new(Arc::clone(&self.handle));
        dup.size = self.size;
        dup.file_position = self.stream_position();
        Ok(Box::new(dup))
    }

    fn position(&self) -> Option<u64> {
        Some(self.stream_position())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::READ_ALL;
    use std::io::Write;

    fn temp_bucket(contents: &[u8]) -> (tempfile::NamedTempFile, FileBucket) {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents).unwrap();
        f.flush().unwrap();
        let bucket = FileBucket::open(f.path()).unwrap();
        (f, bucket)
    }

    #[test]
    fn read_whole_file() {
        let (_f, mut b) = temp_bucket(b"hello file bucket");
        assert_eq!(b.remaining_bytes().unwrap(), 17);
        assert_eq!(b.read(READ_ALL).unwrap(), b"hello file bucket");
        assert!(b.read(1).unwrap_err().is_eof());
    }

    #[test]
    fn skip_jumps_without_reading() {
        let (_f, mut b) = temp_bucket(b"0123456789");
        assert_eq!(b.read_skip(6).unwrap(), 6);
        assert_eq!(b.read(READ_ALL).unwrap(), b"6789");
    }

    #[test]
    fn reset_rewinds() {
        let (_f, mut b) = temp_bucket(b"abcdef");
        b.read(4).unwrap();
        b.reset().unwrap();
        assert_eq!(b.position(), Some(0));
        assert_eq!(b.read(READ_ALL).unwrap(), b"abcdef");
    }

    #[test]
    fn duplicate_shares_handle_not_cursor() {
        let (_f, mut b) = temp_bucket(b"abcdef");
        b.read(2).unwrap();
        let mut dup = b.duplicate(true).unwrap();
        assert_eq!(dup.read(READ_ALL).unwrap(), b"cdef");
        dup.reset().unwrap();
        assert_eq!(dup.read(READ_ALL).unwrap(), b"abcdef");
        // Original cursor unaffected.
        assert_eq!(b.read(READ_ALL).unwrap(), b"cdef");
    }

    #[test]
    fn eol_scan_over_file() {
        let (_f, mut b) = temp_bucket(b"first\nsecond\r\n");
        let (data, found) = b.read_until_eol(NewlineSet::ANY, READ_ALL).unwrap();
        assert_eq!(data, b"first\n");
        assert_eq!(found, Newline::Lf);
        let (data, found) = b.read_until_eol(NewlineSet::ANY, READ_ALL).unwrap();
        assert_eq!(data, b"second\r\n");
        assert_eq!(found, Newline::CrLf);
    }

    #[test]
    fn handle_write_and_truncate() {
        let f = tempfile::NamedTempFile::new().unwrap();
        let handle = FileHandle::open(f.path()).unwrap();
        // Reopen writable through the tempfile handle.
        let writable = FileHandle::new(f.reopen().unwrap());
        writable.write_full(0, b"0123456789").unwrap();
        writable.flush(false).unwrap();
        assert_eq!(handle.current_size().unwrap(), 10);
        writable.truncate(4).unwrap();
        assert_eq!(handle.current_size().unwrap(), 4);

        let mut buf = [0u8; 16];
        let n = handle.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"0123");
    }
}
