//! Oxipack: streaming bucket I/O and Git pack/delta decoding.
//!
//! A *bucket* is a lazily-pulled, possibly-transforming byte stream:
//! reading one transparently triggers decompression, checksum verification,
//! size limiting or delta reconstruction in the layer below, without ever
//! materializing whole objects in memory.
//!
//! The crate provides:
//! - The [`bucket::Bucket`] contract and its composable implementations
//!   (simple, file, aggregate, limit, block, compression, hash)
//! - Git binary-format decoders built from them (`git`): pack header, pack
//!   object frames with OFS/REF delta resolution, the delta-application
//!   engine, and the generic chunk-table container format
//!
//! # Quick Start
//!
//! ```
//! use oxipack::bucket::{Bucket, CompressBucket, CompressionFormat, DecompressBucket,
//!                       READ_ALL, SimpleBucket};
//!
//! # fn main() -> Result<(), oxipack::BucketError> {
//! let source = SimpleBucket::copied(b"hello bucket world");
//! let compressor = CompressBucket::new(source, CompressionFormat::Zlib, 6);
//! let mut reader = DecompressBucket::new(compressor, CompressionFormat::Zlib);
//!
//! let mut restored = Vec::new();
//! loop {
//!     match reader.read(READ_ALL) {
//!         Ok(data) => restored.extend_from_slice(data),
//!         Err(e) if e.is_eof() => break,
//!         Err(e) => return Err(e),
//!     }
//! }
//! assert_eq!(restored, b"hello bucket world");
//! # Ok(())
//! # }
//! ```

pub mod bucket;
pub mod error;
pub mod git;

pub use error::{BucketError, Result};
