// Streaming compression/decompression buckets over the deflate family.
//
// Input handling must never overread the wrapped bucket: a zlib stream
// embedded in a larger stream (a git pack frame) ends mid-stream, and the
// bytes after it belong to the next reader. The refill loop therefore peeks
// the source, feeds the codec from the peeked span, and only then performs
// the matching read for exactly the bytes the codec consumed.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::bucket::Bucket;
use crate::error::{BucketError, Result};

const DEFAULT_BUFFER_SIZE: usize = 8192;
const INPUT_CHUNK: usize = 8192;

/// Wire format for the deflate family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionFormat {
    /// Raw deflate, no header or trailer.
    Deflate,
    /// Deflate with a zlib header and Adler-32 trailer.
    Zlib,
    /// Deflate with gzip framing.
    Gzip,
}

fn new_decompress(format: CompressionFormat) -> Decompress {
    match format {
        CompressionFormat::Deflate => Decompress::new(false),
        CompressionFormat::Zlib => Decompress::new(true),
        CompressionFormat::Gzip => Decompress::new_gzip(15),
    }
}

fn new_compress(format: CompressionFormat, level: u32) -> Compress {
    let level = Compression::new(level);
    match format {
        CompressionFormat::Deflate => Compress::new(level, false),
        CompressionFormat::Zlib => Compress::new(level, true),
        CompressionFormat::Gzip => Compress::new_gzip(level, 15),
    }
}

/// One inflate pass. Returns (consumed, produced, stream_end).
fn pump_inflate(
    codec: &mut Decompress,
    input: &[u8],
    output: &mut [u8],
    finish: bool,
) -> Result<(usize, usize, bool)> {
    let flush = if finish {
        FlushDecompress::Finish
    } else {
        FlushDecompress::None
    };
    let before_in = codec.total_in();
    let before_out = codec.total_out();
    let status = codec
        .decompress(input, output, flush)
        .map_err(|e| BucketError::Codec(format!("inflate failed: {e}")))?;
    Ok((
        (codec.total_in() - before_in) as usize,
        (codec.total_out() - before_out) as usize,
        status == Status::StreamEnd,
    ))
}

/// One deflate pass. Returns (consumed, produced, stream_end).
fn pump_deflate(
    codec: &mut Compress,
    input: &[u8],
    output: &mut [u8],
    finish: bool,
) -> Result<(usize, usize, bool)> {
    let flush = if finish {
        FlushCompress::Finish
    } else {
        FlushCompress::None
    };
    let before_in = codec.total_in();
    let before_out = codec.total_out();
    let status = codec
        .compress(input, output, flush)
        .map_err(|e| BucketError::Codec(format!("deflate failed: {e}")))?;
    Ok((
        (codec.total_in() - before_in) as usize,
        (codec.total_out() - before_out) as usize,
        status == Status::StreamEnd,
    ))
}

// ---------------------------------------------------------------------------
// Decompression
// ---------------------------------------------------------------------------

/// Wraps a bucket with streaming inflate.
///
/// Stops consuming the wrapped bucket exactly at the end of the compressed
/// stream; trailing bytes remain readable by whoever owns the source next.
pub struct DecompressBucket<B: Bucket> {
    inner: B,
    codec: Decompress,
    out: Vec<u8>,
    out_start: usize,
    out_end: usize,
    /// Fallback storage for input bytes already consumed from the source
    /// but not yet accepted by the codec.
    carry: Vec<u8>,
    carry_pos: usize,
    src_eof: bool,
    stream_end: bool,
    delivered: u64,
}

impl<B: Bucket> DecompressBucket<B> {
    pub const NAME: &'static str = "decompress";

    pub fn new(inner: B, format: CompressionFormat) -> Self {
        Self::with_buffer_size(inner, format, DEFAULT_BUFFER_SIZE)
    }

    pub fn with_buffer_size(inner: B, format: CompressionFormat, buffer_size: usize) -> Self {
        assert!(buffer_size >= 512);
        Self {
            inner,
            codec: new_decompress(format),
            out: vec![0; buffer_size],
            out_start: 0,
            out_end: 0,
            carry: Vec::new(),
            carry_pos: 0,
            src_eof: false,
            stream_end: false,
            delivered: 0,
        }
    }

    /// Return the wrapped bucket, abandoning any undelivered output.
    pub fn into_inner(self) -> B {
        self.inner
    }

    fn refill(&mut self, requested: usize) -> Result<()> {
        debug_assert!(self.out_start >= self.out_end);
        self.out_start = 0;
        self.out_end = 0;
        let cap = self.out.len().min(requested.max(1));

        while self.out_end == 0 && !self.stream_end {
            if self.carry_pos < self.carry.len() {
                let (consumed, produced, end) = pump_inflate(
                    &mut self.codec,
                    &self.carry[self.carry_pos..],
                    &mut self.out[..cap],
                    self.src_eof,
                )?;
                self.carry_pos += consumed;
                if self.carry_pos >= self.carry.len() {
                    self.carry.clear();
                    self.carry_pos = 0;
                }
                self.out_end += produced;
                if end {
                    self.stream_end = true;
                } else if consumed == 0 && produced == 0 && self.src_eof {
                    return Err(BucketError::Codec(
                        "unexpected end of compressed stream".into(),
                    ));
                }
            } else if !self.src_eof {
                // Feed straight from the source's peeked span, then consume
                // exactly what the codec accepted.
                let pass = match self.inner.peek(false) {
                    Ok(data) if !data.is_empty() => Some(pump_inflate(
                        &mut self.codec,
                        data,
                        &mut self.out[..cap],
                        false,
                    )?),
                    Ok(_) => None,
                    Err(e) if e.is_eof() => {
                        self.src_eof = true;
                        continue;
                    }
                    Err(e) => return Err(e),
                };

                match pass {
                    Some((consumed, produced, end)) => {
                        self.out_end += produced;
                        if end {
                            self.stream_end = true;
                        }
                        if consumed > 0 {
                            let taken = self.inner.read(consumed)?;
                            debug_assert_eq!(taken.len(), consumed);
                        } else if produced == 0 && !end {
                            return Err(BucketError::Codec("inflate made no progress".into()));
                        }
                    }
                    None => {
                        // The source cannot peek; pull a single byte so we
                        // never take more than the codec will accept.
                        match self.inner.read(1) {
                            Ok(data) if data.is_empty() => return Err(BucketError::WouldBlock),
                            Ok(data) => {
                                let (consumed, produced, end) = pump_inflate(
                                    &mut self.codec,
                                    data,
                                    &mut self.out[..cap],
                                    false,
                                )?;
                                if consumed < data.len() {
                                    let rest = data[consumed..].to_vec();
                                    self.carry = rest;
                                    self.carry_pos = 0;
                                }
                                self.out_end += produced;
                                if end {
                                    self.stream_end = true;
                                }
                            }
                            Err(e) if e.is_eof() => self.src_eof = true,
                            Err(e) => return Err(e),
                        }
                    }
                }
            } else {
                // Source exhausted: drain the codec with Finish.
                let (_, produced, end) =
                    pump_inflate(&mut self.codec, &[], &mut self.out[..cap], true)?;
                self.out_end += produced;
                if end {
                    self.stream_end = true;
                } else if produced == 0 {
                    return Err(BucketError::Codec(
                        "unexpected end of compressed stream".into(),
                    ));
                }
            }
        }

        Ok(())
    }
}

impl<B: Bucket> Bucket for DecompressBucket<B> {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn read(&mut self, requested: usize) -> Result<&[u8]> {
        if self.out_start >= self.out_end {
            if self.stream_end {
                return Err(BucketError::Eof);
            }
            self.refill(requested)?;
            if self.out_end == 0 {
                return Err(BucketError::Eof);
            }
        }
        let take = requested.min(self.out_end - self.out_start);
        let start = self.out_start;
        self.out_start += take;
        self.delivered += take as u64;
        Ok(&self.out[start..start + take])
    }

    fn peek(&mut self, no_poll: bool) -> Result<&[u8]> {
        if self.out_start >= self.out_end && !no_poll && !self.stream_end {
            self.refill(crate::bucket::READ_ALL)?;
        }
        if self.out_start >= self.out_end && self.stream_end {
            return Err(BucketError::Eof);
        }
        Ok(&self.out[self.out_start..self.out_end])
    }

    fn position(&self) -> Option<u64> {
        Some(self.delivered)
    }
}

// ---------------------------------------------------------------------------
// Compression
// ---------------------------------------------------------------------------

/// Wraps a bucket with streaming deflate in the chosen format.
pub struct CompressBucket<B: Bucket> {
    inner: B,
    codec: Compress,
    out: Vec<u8>,
    out_start: usize,
    out_end: usize,
    carry: Vec<u8>,
    carry_pos: usize,
    src_eof: bool,
    stream_end: bool,
    delivered: u64,
}

impl<B: Bucket> CompressBucket<B> {
    pub const NAME: &'static str = "compress";

    pub fn new(inner: B, format: CompressionFormat, level: u32) -> Self {
        Self::with_buffer_size(inner, format, level, DEFAULT_BUFFER_SIZE)
    }

    pub fn with_buffer_size(
        inner: B,
        format: CompressionFormat,
        level: u32,
        buffer_size: usize,
    ) -> Self {
        assert!(buffer_size >= 512);
        Self {
            inner,
            codec: new_compress(format, level),
            out: vec![0; buffer_size],
            out_start: 0,
            out_end: 0,
            carry: Vec::new(),
            carry_pos: 0,
            src_eof: false,
            stream_end: false,
            delivered: 0,
        }
    }

    pub fn into_inner(self) -> B {
        self.inner
    }

    fn refill(&mut self, requested: usize) -> Result<()> {
        self.out_start = 0;
        self.out_end = 0;
        let cap = self.out.len().min(requested.max(1));

        while self.out_end == 0 && !self.stream_end {
            if self.carry_pos < self.carry.len() {
                let (consumed, produced, end) = pump_deflate(
                    &mut self.codec,
                    &self.carry[self.carry_pos..],
                    &mut self.out[..cap],
                    self.src_eof,
                )?;
                self.carry_pos += consumed;
                if self.carry_pos >= self.carry.len() {
                    self.carry.clear();
                    self.carry_pos = 0;
                }
                self.out_end += produced;
                if end {
                    self.stream_end = true;
                } else if consumed == 0 && produced == 0 {
                    return Err(BucketError::Codec("deflate made no progress".into()));
                }
            } else if !self.src_eof {
                match self.inner.read(INPUT_CHUNK) {
                    Ok(data) if data.is_empty() => return Err(BucketError::WouldBlock),
                    Ok(data) => {
                        let (consumed, produced, end) =
                            pump_deflate(&mut self.codec, data, &mut self.out[..cap], false)?;
                        if consumed < data.len() {
                            let rest = data[consumed..].to_vec();
                            self.carry = rest;
                            self.carry_pos = 0;
                        }
                        self.out_end += produced;
                        if end {
                            self.stream_end = true;
                        }
                    }
                    Err(e) if e.is_eof() => self.src_eof = true,
                    Err(e) => return Err(e),
                }
            } else {
                let (_, produced, end) =
                    pump_deflate(&mut self.codec, &[], &mut self.out[..cap], true)?;
                self.out_end += produced;
                if end {
                    self.stream_end = true;
                } else if produced == 0 {
                    return Err(BucketError::Codec("deflate made no progress".into()));
                }
            }
        }

        Ok(())
    }
}

impl<B: Bucket> Bucket for CompressBucket<B> {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn read(&mut self, requested: usize) -> Result<&[u8]> {
        if self.out_start >= self.out_end {
            if self.stream_end {
                return Err(BucketError::Eof);
            }
            self.refill(requested)?;
            if self.out_end == 0 {
                return Err(BucketError::Eof);
            }
        }
        let take = requested.min(self.out_end - self.out_start);
        let start = self.out_start;
        self.out_start += take;
        self.delivered += take as u64;
        Ok(&self.out[start..start + take])
    }

    fn peek(&mut self, no_poll: bool) -> Result<&[u8]> {
        if self.out_start >= self.out_end && !no_poll && !self.stream_end {
            self.refill(crate::bucket::READ_ALL)?;
        }
        if self.out_start >= self.out_end && self.stream_end {
            return Err(BucketError::Eof);
        }
        Ok(&self.out[self.out_start..self.out_end])
    }

    fn position(&self) -> Option<u64> {
        Some(self.delivered)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
