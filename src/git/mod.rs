// Git pack/delta/chunk-file binary format decoding, built on buckets.
//
// The decoders never perform I/O themselves: they compose limit, block,
// decompression and delta buckets over whatever source they are given and
// only ever call the bucket contract on it.
//
// # Modules
//
// - `varint`      — the two 7-bit-group integer encodings used by packs
// - `pack_header` — 12-byte pack signature/version/object-count decoder
// - `pack_frame`  — per-object frame state machine with delta resolution
// - `delta`       — copy/insert delta application engine
// - `chunk_file`  — generic chunk-indexed container (commit-graph, midx)

pub mod chunk_file;
pub mod delta;
pub mod pack_frame;
pub mod pack_header;
pub mod varint;

pub use chunk_file::ChunkFileBucket;
pub use delta::DeltaBucket;
pub use pack_frame::PackFrameBucket;
pub use pack_header::PackHeaderBucket;

use crate::error::{BucketError, Result};

/// Object kinds appearing in a pack stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitObjectType {
    Commit = 1,
    Tree = 2,
    Blob = 3,
    Tag = 4,
    /// Delta against a base located by backward byte offset.
    OfsDelta = 6,
    /// Delta against a base located by object id.
    RefDelta = 7,
}

impl GitObjectType {
    /// Decode the 3-bit type field of a pack object header. Types 0 and 5
    /// are invalid on disk.
    pub fn from_pack_type(raw: u8) -> Result<Self> {
        match raw {
            1 => Ok(GitObjectType::Commit),
            2 => Ok(GitObjectType::Tree),
            3 => Ok(GitObjectType::Blob),
            4 => Ok(GitObjectType::Tag),
            6 => Ok(GitObjectType::OfsDelta),
            7 => Ok(GitObjectType::RefDelta),
            0 => Err(BucketError::Malformed(
                "git pack object type 0 is invalid".into(),
            )),
            5 => Err(BucketError::Malformed(
                "git pack object type 5 is unsupported".into(),
            )),
            other => Err(BucketError::Malformed(format!(
                "git pack object type {other} out of range"
            ))),
        }
    }

    pub fn is_delta(self) -> bool {
        matches!(self, GitObjectType::OfsDelta | GitObjectType::RefDelta)
    }

    pub fn name(self) -> &'static str {
        match self {
            GitObjectType::Commit => "commit",
            GitObjectType::Tree => "tree",
            GitObjectType::Blob => "blob",
            GitObjectType::Tag => "tag",
            GitObjectType::OfsDelta => "<offset-delta>",
            GitObjectType::RefDelta => "<oid-delta>",
        }
    }
}

/// Object-id flavor of a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitOidKind {
    Sha1,
    Sha256,
}

impl GitOidKind {
    pub fn len(self) -> usize {
        match self {
            GitOidKind::Sha1 => 20,
            GitOidKind::Sha256 => 32,
        }
    }
}

/// A fixed-size object identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GitOid {
    kind: GitOidKind,
    bytes: [u8; 32],
}

impl GitOid {
    pub fn from_bytes(kind: GitOidKind, raw: &[u8]) -> Result<Self> {
        if raw.len() != kind.len() {
            return Err(BucketError::Malformed(format!(
                "object id needs {} bytes, got {}",
                kind.len(),
                raw.len()
            )));
        }
        let mut bytes = [0u8; 32];
        bytes[..raw.len()].copy_from_slice(raw);
        Ok(Self { kind, bytes })
    }

    pub fn kind(&self) -> GitOidKind {
        self.kind
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.kind.len()]
    }
}

impl std::fmt::Display for GitOid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in self.as_bytes() {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// The `"<type> <size>\0"` prefix of a loose object file.
pub fn loose_object_header(object_type: GitObjectType, size: u64) -> Vec<u8> {
    format!("{} {size}\0", object_type.name()).into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_type_decoding() {
        assert_eq!(GitObjectType::from_pack_type(3).unwrap(), GitObjectType::Blob);
        assert_eq!(
            GitObjectType::from_pack_type(6).unwrap(),
            GitObjectType::OfsDelta
        );
        assert!(GitObjectType::from_pack_type(0).is_err());
        assert!(GitObjectType::from_pack_type(5).is_err());
    }

    #[test]
    fn oid_roundtrip() {
        let raw: Vec<u8> = (0..20).collect();
        let oid = GitOid::from_bytes(GitOidKind::Sha1, &raw).unwrap();
        assert_eq!(oid.as_bytes(), &raw[..]);
        assert_eq!(
            oid.to_string(),
            "000102030405060708090a0b0c0d0e0f10111213"
        );
        assert!(GitOid::from_bytes(GitOidKind::Sha256, &raw).is_err());
    }

    #[test]
    fn loose_header_format() {
        assert_eq!(
            loose_object_header(GitObjectType::Blob, 26),
            b"blob 26\0".to_vec()
        );
    }
}
