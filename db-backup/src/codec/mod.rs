//! Byte-level codecs applied to dump streams: compression on the way in and
//! out of the store, SHA-256 over the finished artifact.

pub mod checksum;
pub mod compression;

pub use checksum::{compute_file_digest, FileDigest};
pub use compression::Compression;
