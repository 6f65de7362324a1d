// Decoder for one object frame inside a git pack stream.
//
// A frame is a `(type, size)` varint header, optional delta-base fields,
// and a zlib stream. Reading the frame yields the fully decompressed and,
// for deltas, fully reconstructed object bytes; resolving an OFS delta
// duplicates the underlying pack stream, rewinds it to the base frame and
// recursively decodes it there.

use crate::bucket::{
    BlockBucket, Bucket, CompressionFormat, DecompressBucket, Newline, NewlineSet,
};
use crate::error::{BucketError, Result};
use crate::git::delta::DeltaBucket;
use crate::git::varint::{ObjectHeaderParser, OfsOffsetParser, varint_request_len};
use crate::git::{GitObjectType, GitOid, GitOidKind};

const MAX_VARINT_SCAN: usize = 16;

/// Hard ceiling on delta recursion, far beyond anything git produces.
const MAX_DELTA_CHAIN: u32 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameState {
    /// Parsing the `(type, size)` header varint.
    Start,
    /// Parsing the delta-base reference, if any.
    SizeDone,
    /// Base fields parsed; the delta base still needs resolving.
    FindBase,
    /// Streaming the object body.
    Body,
}

/// The composed pipeline a frame reads its body through.
enum FrameBody<B: Bucket> {
    Plain(DecompressBucket<BlockBucket<B>>),
    Delta(DeltaBucket<DecompressBucket<BlockBucket<B>>>),
}

impl<B: Bucket> FrameBody<B> {
    fn into_wrapped(self) -> B {
        match self {
            FrameBody::Plain(d) => d.into_inner().into_inner(),
            FrameBody::Delta(d) => d.into_parts().0.into_inner().into_inner(),
        }
    }
}

impl<B: Bucket> Bucket for FrameBody<B> {
    fn name(&self) -> &'static str {
        match self {
            FrameBody::Plain(d) => d.name(),
            FrameBody::Delta(d) => d.name(),
        }
    }

    fn read(&mut self, requested: usize) -> Result<&[u8]> {
        match self {
            FrameBody::Plain(d) => d.read(requested),
            FrameBody::Delta(d) => d.read(requested),
        }
    }

    fn peek(&mut self, no_poll: bool) -> Result<&[u8]> {
        match self {
            FrameBody::Plain(d) => d.peek(no_poll),
            FrameBody::Delta(d) => d.peek(no_poll),
        }
    }

    fn read_until_eol(
        &mut self,
        acceptable: NewlineSet,
        requested: usize,
    ) -> Result<(&[u8], Newline)> {
        match self {
            FrameBody::Plain(d) => d.read_until_eol(acceptable, requested),
            FrameBody::Delta(d) => d.read_until_eol(acceptable, requested),
        }
    }

    fn read_skip(&mut self, requested: u64) -> Result<u64> {
        match self {
            FrameBody::Plain(d) => d.read_skip(requested),
            FrameBody::Delta(d) => d.read_skip(requested),
        }
    }

    fn remaining_bytes(&mut self) -> Result<u64> {
        match self {
            FrameBody::Plain(d) => d.remaining_bytes(),
            FrameBody::Delta(d) => d.remaining_bytes(),
        }
    }

    fn position(&self) -> Option<u64> {
        match self {
            FrameBody::Plain(d) => d.position(),
            FrameBody::Delta(d) => d.position(),
        }
    }
}

/// Decodes one pack object, delta chains included.
pub struct PackFrameBucket<B: Bucket> {
    /// The raw pack stream; moved into `reader` once the body starts.
    wrapped: Option<B>,
    reader: Option<FrameBody<B>>,
    state: FrameState,
    oid_kind: GitOidKind,
    header: ObjectHeaderParser,
    ofs: OfsOffsetParser,
    /// Effective type: for deltas this becomes the resolved base type.
    git_type: Option<GitObjectType>,
    /// Declared (inflated) body size of this frame.
    body_size: u64,
    /// Byte offset of the frame header in the pack stream, when known.
    frame_position: Option<u64>,
    /// Absolute offset of the OFS delta base.
    base_offset: u64,
    base_oid: Option<GitOid>,
    oid_buf: [u8; 32],
    oid_filled: usize,
    delta_depth: u32,
    /// Remaining recursion allowance for base resolution.
    depth_budget: u32,
}

impl<B: Bucket> PackFrameBucket<B> {
    pub const NAME: &'static str = "git.packframe";

    pub fn new(wrapped: B, oid_kind: GitOidKind) -> Self {
        Self {
            wrapped: Some(wrapped),
            reader: None,
            state: FrameState::Start,
            oid_kind,
            header: ObjectHeaderParser::new(),
            ofs: OfsOffsetParser::new(),
            git_type: None,
            body_size: 0,
            frame_position: None,
            base_offset: 0,
            base_oid: None,
            oid_buf: [0; 32],
            oid_filled: 0,
            delta_depth: 0,
            depth_budget: MAX_DELTA_CHAIN,
        }
    }

    /// The declared inflated size of this frame's own body (for a delta
    /// frame, the size of the delta instruction stream).
    pub fn declared_size(&self) -> Option<u64> {
        (self.state != FrameState::Start).then_some(self.body_size)
    }

    /// Length of the delta chain below this frame; 0 for non-delta objects.
    pub fn delta_depth(&self) -> u32 {
        self.delta_depth
    }

    /// The base object id of a REF delta, once parsed.
    pub fn base_oid(&self) -> Option<&GitOid> {
        self.base_oid.as_ref()
    }

    /// Drive the header state machine to completion and return the
    /// effective object type and the delta chain depth.
    pub fn read_frame_info(&mut self) -> Result<(GitObjectType, u32)> {
        while self.state == FrameState::Start {
            let wrapped = self.wrapped.as_mut().expect("stream present before body");
            if !self.header.started() {
                self.frame_position = wrapped.position();
            }

            let rq = match wrapped.peek(false) {
                Ok(peeked) => varint_request_len(peeked, MAX_VARINT_SCAN),
                Err(e) if e.is_eof() && !self.header.started() => return Err(e),
                Err(e) if e.is_eof() => {
                    return Err(BucketError::Malformed(
                        "pack frame header truncated".into(),
                    ));
                }
                Err(e) => return Err(e),
            };

            let data = match wrapped.read(rq) {
                Ok(data) => data,
                Err(e) if e.is_eof() && !self.header.started() => return Err(e),
                Err(e) if e.is_eof() => {
                    return Err(BucketError::Malformed(
                        "pack frame header truncated".into(),
                    ));
                }
                Err(e) => return Err(e),
            };
            if data.is_empty() {
                return Err(BucketError::WouldBlock);
            }

            for &byte in data {
                if self.header.push(byte)? {
                    let git_type = GitObjectType::from_pack_type(self.header.type_bits())
                        .map_err(|e| match self.frame_position {
                            Some(offset) => e.with_context(format!(
                                "invalid object header at pack offset {offset}"
                            )),
                            None => e,
                        })?;
                    self.body_size = self.header.size();
                    self.git_type = Some(git_type);
                    self.state = FrameState::SizeDone;
                    log::debug!(
                        "pack frame at {:?}: {} of {} bytes",
                        self.frame_position,
                        git_type.name(),
                        self.body_size
                    );
                }
            }
        }

        while self.state == FrameState::SizeDone {
            match self.git_type.expect("type known after header") {
                GitObjectType::RefDelta => {
                    // The body starts with the object id of the base.
                    let need = self.oid_kind.len() - self.oid_filled;
                    let wrapped = self.wrapped.as_mut().expect("stream present before body");
                    let data = match wrapped.read(need) {
                        Ok(data) => data,
                        Err(e) if e.is_eof() => {
                            return Err(BucketError::Malformed(
                                "pack frame truncated inside delta base id".into(),
                            ));
                        }
                        Err(e) => return Err(e),
                    };
                    if data.is_empty() {
                        return Err(BucketError::WouldBlock);
                    }
                    self.oid_buf[self.oid_filled..self.oid_filled + data.len()]
                        .copy_from_slice(data);
                    self.oid_filled += data.len();
                    if self.oid_filled == self.oid_kind.len() {
                        self.base_oid = Some(GitOid::from_bytes(
                            self.oid_kind,
                            &self.oid_buf[..self.oid_kind.len()],
                        )?);
                        self.state = FrameState::FindBase;
                    }
                }
                GitObjectType::OfsDelta => {
                    // The body starts with the backward distance to the base.
                    let wrapped = self.wrapped.as_mut().expect("stream present before body");
                    let rq = match wrapped.peek(false) {
                        Ok(peeked) => varint_request_len(peeked, MAX_VARINT_SCAN),
                        Err(e) if e.is_eof() => {
                            return Err(BucketError::Malformed(
                                "pack frame truncated inside delta offset".into(),
                            ));
                        }
                        Err(e) => return Err(e),
                    };
                    let data = match wrapped.read(rq) {
                        Ok(data) => data,
                        Err(e) if e.is_eof() => {
                            return Err(BucketError::Malformed(
                                "pack frame truncated inside delta offset".into(),
                            ));
                        }
                        Err(e) => return Err(e),
                    };
                    if data.is_empty() {
                        return Err(BucketError::WouldBlock);
                    }
                    for &byte in data {
                        if self.ofs.push(byte)? {
                            let distance = self.ofs.value();
                            let Some(frame_position) = self.frame_position else {
                                return Err(BucketError::Malformed(
                                    "cannot resolve delta offset without a known stream position"
                                        .into(),
                                ));
                            };
                            // The base must start strictly before this frame.
                            if distance == 0 || distance > frame_position {
                                return Err(BucketError::Malformed(format!(
                                    "delta offset {distance} at pack offset {frame_position} \
                                     does not point to an earlier object"
                                )));
                            }
                            self.base_offset = frame_position - distance;
                            self.state = FrameState::FindBase;
                        }
                    }
                }
                _ => {
                    let wrapped = self.wrapped.take().expect("stream present before body");
                    self.reader = Some(FrameBody::Plain(DecompressBucket::new(
                        BlockBucket::new(wrapped),
                        CompressionFormat::Zlib,
                    )));
                    self.state = FrameState::Body;
                }
            }
        }

        if self.state == FrameState::FindBase {
            match self.git_type.expect("type known after header") {
                GitObjectType::OfsDelta => {
                    log::debug!(
                        "resolving delta base at pack offset {}",
                        self.base_offset
                    );
                    if self.depth_budget == 0 {
                        return Err(BucketError::Malformed(format!(
                            "delta chain deeper than {MAX_DELTA_CHAIN}"
                        )));
                    }
                    let wrapped = self.wrapped.as_mut().expect("stream present before body");
                    // The pack stream was designed to be duplicated for
                    // exactly this backward walk.
                    let mut src = wrapped.duplicate(true).map_err(|e| {
                        e.with_context("cannot duplicate pack stream to resolve delta base")
                    })?;
                    src.reset()?;
                    let mut to_skip = self.base_offset;
                    while to_skip > 0 {
                        match src.read_skip(to_skip) {
                            Ok(0) => return Err(BucketError::WouldBlock),
                            Ok(n) => to_skip -= n,
                            Err(e) if e.is_eof() => {
                                return Err(BucketError::Malformed(format!(
                                    "delta base offset {} is outside the pack stream",
                                    self.base_offset
                                )));
                            }
                            Err(e) => return Err(e),
                        }
                    }

                    let mut base = PackFrameBucket::new(src, self.oid_kind);
                    base.depth_budget = self.depth_budget - 1;
                    let (base_type, base_depth) = base.read_frame_info().map_err(|e| {
                        e.with_context(format!(
                            "while decoding delta base at pack offset {}",
                            self.base_offset
                        ))
                    })?;

                    // The delta adopts its base's resolved type.
                    self.git_type = Some(base_type);
                    self.delta_depth = base_depth + 1;

                    let wrapped = self.wrapped.take().expect("stream present before body");
                    let delta_src = DecompressBucket::new(
                        BlockBucket::new(wrapped),
                        CompressionFormat::Zlib,
                    );
                    self.reader = Some(FrameBody::Delta(DeltaBucket::new(
                        delta_src,
                        Box::new(base),
                    )));
                    self.state = FrameState::Body;
                }
                GitObjectType::RefDelta => {
                    return Err(BucketError::NotImplemented(
                        "resolving a delta base by object id",
                    ));
                }
                _ => unreachable!("find-base state only exists for delta types"),
            }
        }

        Ok((
            self.git_type.expect("type known in body state"),
            self.delta_depth,
        ))
    }
}

impl<B: Bucket> Bucket for PackFrameBucket<B> {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn read(&mut self, requested: usize) -> Result<&[u8]> {
        if self.state != FrameState::Body {
            self.read_frame_info()?;
        }
        self.reader.as_mut().expect("reader in body state").read(requested)
    }

    fn read_until_eol(
        &mut self,
        acceptable: NewlineSet,
        requested: usize,
    ) -> Result<(&[u8], Newline)> {
        if self.state != FrameState::Body {
            self.read_frame_info()?;
        }
        self.reader
            .as_mut()
            .expect("reader in body state")
            .read_until_eol(acceptable, requested)
    }

    fn peek(&mut self, no_poll: bool) -> Result<&[u8]> {
        if self.state != FrameState::Body {
            if no_poll {
                return Ok(&[]);
            }
            self.read_frame_info()?;
        }
        self.reader.as_mut().expect("reader in body state").peek(no_poll)
    }

    fn read_skip(&mut self, requested: u64) -> Result<u64> {
        if self.state != FrameState::Body {
            self.read_frame_info()?;
        }
        self.reader
            .as_mut()
            .expect("reader in body state")
            .read_skip(requested)
    }

    fn remaining_bytes(&mut self) -> Result<u64> {
        if self.state != FrameState::Body {
            self.read_frame_info()?;
        }
        let reader = self.reader.as_mut().expect("reader in body state");
        if self.delta_depth > 0 {
            reader.remaining_bytes()
        } else {
            // The decompressor cannot know its total output in advance, but
            // the frame header declared it.
            Ok(self.body_size - reader.position().unwrap_or(0))
        }
    }

    fn reset(&mut self) -> Result<()> {
        let Some(frame_position) = self.frame_position else {
            return Err(BucketError::NotSupported(Self::NAME));
        };

        fn rewind<B: Bucket>(stream: &mut B, offset: u64) -> Result<()> {
            stream.reset()?;
            let mut to_skip = offset;
            while to_skip > 0 {
                match stream.read_skip(to_skip) {
                    Ok(0) => return Err(BucketError::WouldBlock),
                    Ok(n) => to_skip -= n,
                    Err(e) => return Err(e),
                }
            }
            Ok(())
        }

        // Recover the raw stream from whichever stage of the pipeline
        // currently holds it, then restart the state machine. The machine
        // goes back to `Start` even if the rewind fails, so the bucket
        // stays coherent and the failure surfaces to the caller.
        let mut wrapped = match self.reader.take() {
            Some(body) => body.into_wrapped(),
            None => self
                .wrapped
                .take()
                .expect("stream present before body"),
        };
        let outcome = rewind(&mut wrapped, frame_position);
        self.wrapped = Some(wrapped);

        self.state = FrameState::Start;
        self.header = ObjectHeaderParser::new();
        self.ofs = OfsOffsetParser::new();
        self.git_type = None;
        self.body_size = 0;
        self.frame_position = None;
        self.base_offset = 0;
        self.base_oid = None;
        self.oid_filled = 0;
        self.delta_depth = 0;
        outcome
    }

    fn position(&self) -> Option<u64> {
        match &self.reader {
            None => Some(0),
            Some(reader) => reader.position(),
        }
    }
}
