// Applies git's binary delta encoding against a base bucket.
//
// A delta instruction stream starts with two little-endian varints (the
// expected base size and the target size), followed by commands:
//
// - `0xxxxxxx` — insert: the low 7 bits count literal bytes that follow in
//   the instruction stream.
// - `1ooools s` — copy: bits 0-3 select little-endian offset bytes, bits
//   4-6 select length bytes; a length of 0 means 65536. The bytes come
//   from the base at that offset.
//
// The output position must land exactly on the declared target size; an
// instruction-stream EOF before that is a decode error, not a normal end.

use crate::bucket::Bucket;
use crate::error::{BucketError, Result};
use crate::git::varint::LeVarintParser;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeltaState {
    /// Parsing the expected base size varint.
    BaseSize,
    /// Parsing the target size varint.
    TargetSize,
    /// Between commands.
    Command,
    /// Copying literal bytes out of the instruction stream.
    SrcCopy,
    /// Copying bytes out of the base bucket.
    BaseCopy,
    Eof,
}

/// Reconstructs a delta target from an instruction stream and a base.
///
/// Both sources are owned; the base must support `position`, `reset` and
/// `read_skip` well enough to seek, since copy commands can address any
/// base offset in any order.
pub struct DeltaBucket<S: Bucket> {
    src: S,
    base: Box<dyn Bucket>,
    state: DeltaState,
    varint: LeVarintParser,
    target_size: u64,
    position: u64,
    /// Partial copy command bytes carried across reads.
    cmd_buf: [u8; 8],
    cmd_have: usize,
    copy_size: u64,
    /// Base offset still to seek to before the current copy starts.
    pending_seek: Option<u64>,
}

impl<S: Bucket> DeltaBucket<S> {
    pub const NAME: &'static str = "git.delta";

    pub fn new(src: S, base: Box<dyn Bucket>) -> Self {
        Self {
            src,
            base,
            state: DeltaState::BaseSize,
            varint: LeVarintParser::new(),
            target_size: 0,
            position: 0,
            cmd_buf: [0; 8],
            cmd_have: 0,
            copy_size: 0,
            pending_seek: None,
        }
    }

    /// Split the engine back into its two sources.
    pub fn into_parts(self) -> (S, Box<dyn Bucket>) {
        (self.src, self.base)
    }

    fn read_src_byte(&mut self) -> Result<u8> {
        let data = self.src.read(1)?;
        if data.is_empty() {
            return Err(BucketError::WouldBlock);
        }
        Ok(data[0])
    }

    /// Drive the state machine until it is ready to produce bytes (or hits
    /// the end). Propagates `Eof` from the instruction stream; the caller
    /// decides whether that is legal.
    fn advance(&mut self) -> Result<()> {
        while self.state == DeltaState::BaseSize {
            let byte = self.read_src_byte()?;
            if self.varint.push(byte)? {
                let declared = self.varint.value();
                match self.base.remaining_bytes() {
                    Ok(actual) => {
                        if actual != declared {
                            return Err(BucketError::Malformed(format!(
                                "delta expects a base of {declared} bytes, source has {actual}"
                            )));
                        }
                    }
                    // A base that cannot report its length skips the check.
                    Err(e) if !e.is_read_error() => {}
                    Err(BucketError::NotSupported(_)) => {}
                    Err(e) => return Err(e),
                }
                self.varint.reset();
                self.state = DeltaState::TargetSize;
            }
        }

        while self.state == DeltaState::TargetSize {
            let byte = self.read_src_byte()?;
            if self.varint.push(byte)? {
                self.target_size = self.varint.value();
                self.state = if self.target_size == 0 {
                    DeltaState::Eof
                } else {
                    DeltaState::Command
                };
            }
        }

        while self.state == DeltaState::Command {
            if self.cmd_have == 0 {
                self.cmd_buf[0] = self.read_src_byte()?;
                self.cmd_have = 1;
            }

            let control = self.cmd_buf[0];
            if control & 0x80 == 0 {
                // Insert command; zero is reserved.
                if control == 0 {
                    return Err(BucketError::Malformed(
                        "delta command byte 0 is reserved".into(),
                    ));
                }
                self.copy_size = u64::from(control & 0x7F);
                self.cmd_have = 0;
                self.state = DeltaState::SrcCopy;
                break;
            }

            // Copy command: the control byte's set bits say how many
            // operand bytes follow (the high bit pays for the control byte
            // itself).
            let want = control.count_ones() as usize;
            while self.cmd_have < want {
                let have = self.cmd_have;
                let data = self.src.read(want - have)?;
                if data.is_empty() {
                    return Err(BucketError::WouldBlock);
                }
                self.cmd_buf[have..have + data.len()].copy_from_slice(data);
                self.cmd_have += data.len();
            }

            let mut operands = self.cmd_buf[1..want].iter();
            let mut offset = 0u64;
            let mut size = 0u64;
            for shift in 0..4 {
                if control & (1 << shift) != 0 {
                    offset |= u64::from(*operands.next().unwrap()) << (8 * shift);
                }
            }
            for shift in 0..3 {
                if control & (0x10 << shift) != 0 {
                    size |= u64::from(*operands.next().unwrap()) << (8 * shift);
                }
            }
            if size == 0 {
                size = 0x10000;
            }

            log::trace!("delta copy: {size} bytes from base offset {offset}");
            self.copy_size = size;
            self.pending_seek = Some(offset);
            self.cmd_have = 0;
            self.state = DeltaState::BaseCopy;
        }

        if self.state == DeltaState::BaseCopy
            && let Some(offset) = self.pending_seek
        {
            let mut at = self.base.position().unwrap_or(0);
            if offset < at {
                self.base.reset()?;
                at = 0;
            }
            while at < offset {
                match self.base.read_skip(offset - at) {
                    Ok(0) => return Err(BucketError::WouldBlock),
                    Ok(n) => at += n,
                    Err(e) if e.is_eof() => {
                        return Err(BucketError::Malformed(format!(
                            "delta copy offset {offset} is past the end of the base"
                        )));
                    }
                    Err(e) => return Err(e),
                }
            }
            self.pending_seek = None;
        }

        Ok(())
    }
}

impl<S: Bucket> Bucket for DeltaBucket<S> {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn read(&mut self, requested: usize) -> Result<&[u8]> {
        match self.advance() {
            Ok(()) => {}
            Err(e) if e.is_eof() => {
                return Err(BucketError::Malformed(
                    "unexpected end of delta command stream".into(),
                ));
            }
            Err(e) => return Err(e),
        }

        let clamp = requested.min(usize::try_from(self.copy_size).unwrap_or(usize::MAX));
        match self.state {
            DeltaState::SrcCopy => {
                let data = match self.src.read(clamp) {
                    Ok(data) => data,
                    Err(e) if e.is_eof() => {
                        return Err(BucketError::Malformed(
                            "unexpected end of delta literal data".into(),
                        ));
                    }
                    Err(e) => return Err(e),
                };
                self.position += data.len() as u64;
                self.copy_size -= data.len() as u64;
                if self.copy_size == 0 {
                    self.state = if self.position == self.target_size {
                        DeltaState::Eof
                    } else {
                        DeltaState::Command
                    };
                }
                Ok(data)
            }
            DeltaState::BaseCopy => {
                let data = match self.base.read(clamp) {
                    Ok(data) => data,
                    Err(e) if e.is_eof() => {
                        return Err(BucketError::Malformed(
                            "unexpected end of delta base stream".into(),
                        ));
                    }
                    Err(e) => return Err(e),
                };
                self.position += data.len() as u64;
                self.copy_size -= data.len() as u64;
                if self.copy_size == 0 {
                    self.state = if self.position == self.target_size {
                        DeltaState::Eof
                    } else {
                        DeltaState::Command
                    };
                }
                Ok(data)
            }
            DeltaState::Eof => Err(BucketError::Eof),
            _ => Err(BucketError::WouldBlock),
        }
    }

    fn peek(&mut self, no_poll: bool) -> Result<&[u8]> {
        if !no_poll {
            self.advance()?;
        }
        let clamp = usize::try_from(self.copy_size).unwrap_or(usize::MAX);
        match self.state {
            DeltaState::SrcCopy => {
                let data = self.src.peek(no_poll)?;
                Ok(&data[..data.len().min(clamp)])
            }
            DeltaState::BaseCopy => {
                let data = self.base.peek(no_poll)?;
                Ok(&data[..data.len().min(clamp)])
            }
            DeltaState::Eof => Err(BucketError::Eof),
            _ => Ok(&[]),
        }
    }

    fn remaining_bytes(&mut self) -> Result<u64> {
        self.advance()?;
        if matches!(self.state, DeltaState::BaseSize | DeltaState::TargetSize) {
            return Err(BucketError::WouldBlock);
        }
        Ok(self.target_size - self.position)
    }

    fn position(&self) -> Option<u64> {
        Some(self.position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::{READ_ALL, SimpleBucket};

    fn le_varint(mut value: u64) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let mut byte = (value & 0x7F) as u8;
            value >>= 7;
            if value != 0 {
                byte |= 0x80;
            }
            out.push(byte);
            if value == 0 {
                return out;
            }
        }
    }

    /// Build a delta script from (offset, length) copies and literal
    /// inserts.
    enum Op<'a> {
        Copy { offset: u32, len: u32 },
        Insert(&'a [u8]),
    }

    fn script(base_size: u64, target_size: u64, ops: &[Op<'_>]) -> Vec<u8> {
        let mut out = le_varint(base_size);
        out.extend_from_slice(&le_varint(target_size));
        for op in ops {
            match op {
                Op::Insert(data) => {
                    assert!(!data.is_empty() && data.len() <= 0x7F);
                    out.push(data.len() as u8);
                    out.extend_from_slice(data);
                }
                Op::Copy { offset, len } => {
                    let mut control = 0x80u8;
                    let mut operands = Vec::new();
                    for shift in 0..4 {
                        let byte = (offset >> (8 * shift)) as u8;
                        if byte != 0 {
                            control |= 1 << shift;
                            operands.push(byte);
                        }
                    }
                    let encoded_len = if *len == 0x10000 { 0 } else { *len };
                    for shift in 0..3 {
                        let byte = (encoded_len >> (8 * shift)) as u8;
                        if byte != 0 {
                            control |= 0x10 << shift;
                            operands.push(byte);
                        }
                    }
                    out.push(control);
                    out.extend_from_slice(&operands);
                }
            }
        }
        out
    }

    fn apply(base: &[u8], delta: &[u8]) -> Result<Vec<u8>> {
        let mut bucket = DeltaBucket::new(
            SimpleBucket::copied(delta),
            Box::new(SimpleBucket::copied(base)),
        );
        let mut out = Vec::new();
        loop {
            match bucket.read(READ_ALL) {
                Ok(data) => out.extend_from_slice(data),
                Err(e) if e.is_eof() => return Ok(out),
                Err(e) => return Err(e),
            }
        }
    }

    const BASE: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";

    #[test]
    fn insert_only() {
        let delta = script(26, 5, &[Op::Insert(b"hello")]);
        assert_eq!(apply(BASE, &delta).unwrap(), b"hello");
    }

    #[test]
    fn copy_then_insert_then_copy() {
        let delta = script(
            26,
            16,
            &[
                Op::Copy { offset: 0, len: 10 },
                Op::Insert(b"xyz"),
                Op::Copy { offset: 23, len: 3 },
            ],
        );
        assert_eq!(apply(BASE, &delta).unwrap(), b"ABCDEFGHIJxyzXYZ");
    }

    #[test]
    fn backward_copy_reseeks_the_base() {
        // The second copy addresses an offset before the first's end, which
        // forces a reset-and-skip on the base bucket.
        let delta = script(
            26,
            10,
            &[
                Op::Copy { offset: 20, len: 5 },
                Op::Copy { offset: 2, len: 5 },
            ],
        );
        assert_eq!(apply(BASE, &delta).unwrap(), b"UVWXYCDEFG");
    }

    #[test]
    fn zero_length_copy_means_65536() {
        let base: Vec<u8> = (0u8..=255).cycle().take(0x10000 + 10).collect();
        let delta = script(base.len() as u64, 0x10000, &[Op::Copy { offset: 5, len: 0x10000 }]);
        let out = apply(&base, &delta).unwrap();
        assert_eq!(out.len(), 0x10000);
        assert_eq!(out[..], base[5..5 + 0x10000]);
    }

    #[test]
    fn base_size_mismatch_is_detected() {
        let delta = script(25, 5, &[Op::Insert(b"hello")]);
        let err = apply(BASE, &delta).unwrap_err();
        assert!(matches!(err, BucketError::Malformed(_)), "got {err:?}");
    }

    #[test]
    fn truncated_command_stream_is_an_error() {
        let mut delta = script(26, 10, &[Op::Copy { offset: 0, len: 10 }]);
        delta.truncate(delta.len() - 1); // drop a copy operand
        let err = apply(BASE, &delta).unwrap_err();
        assert!(matches!(err, BucketError::Malformed(_)), "got {err:?}");
    }

    #[test]
    fn missing_commands_before_target_size_is_an_error() {
        // Declares 10 output bytes but only provides 5.
        let delta = script(26, 10, &[Op::Insert(b"hello")]);
        let err = apply(BASE, &delta).unwrap_err();
        assert!(matches!(err, BucketError::Malformed(_)), "got {err:?}");
    }

    #[test]
    fn reserved_command_zero_is_rejected() {
        let mut delta = le_varint(26);
        delta.extend_from_slice(&le_varint(4));
        delta.push(0x00);
        let err = apply(BASE, &delta).unwrap_err();
        assert!(matches!(err, BucketError::Malformed(_)), "got {err:?}");
    }

    #[test]
    fn copy_past_base_end_is_rejected() {
        let delta = script(26, 4, &[Op::Copy { offset: 30, len: 4 }]);
        let err = apply(BASE, &delta).unwrap_err();
        assert!(matches!(err, BucketError::Malformed(_)), "got {err:?}");
    }

    #[test]
    fn remaining_and_position_track_target() {
        let delta = script(26, 8, &[Op::Copy { offset: 0, len: 8 }]);
        let mut bucket = DeltaBucket::new(
            SimpleBucket::copied(&delta),
            Box::new(SimpleBucket::copied(BASE)),
        );
        assert_eq!(bucket.position(), Some(0));
        assert_eq!(bucket.remaining_bytes().unwrap(), 8);
        let first = bucket.read(3).unwrap().len() as u64;
        assert_eq!(bucket.position(), Some(first));
        assert_eq!(bucket.remaining_bytes().unwrap(), 8 - first);
    }

    #[test]
    fn empty_target_is_immediate_eof() {
        let delta = script(26, 0, &[]);
        assert_eq!(apply(BASE, &delta).unwrap(), b"");
    }
}
