//! Streaming compression for dump artifacts.
//!
//! Encoders wrap the artifact file on the write side, decoders wrap a
//! buffered reader on the restore side. Neither ever holds more than one
//! chunk of the dump in memory.

use async_compression::tokio::bufread::{GzipDecoder, ZstdDecoder};
use async_compression::tokio::write::{GzipEncoder, ZstdEncoder};
use async_compression::Level;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, BufReader};

pub type BoxAsyncRead = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxAsyncWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Compression algorithm used for an artifact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    Gzip,
    Zstd,
}

impl Compression {
    /// Name as recorded in the metadata sidecar
    pub fn name(&self) -> &'static str {
        match self {
            Compression::Gzip => "gzip",
            Compression::Zstd => "zstd",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "gzip" | "gz" => Some(Compression::Gzip),
            "zstd" | "zst" => Some(Compression::Zstd),
            _ => None,
        }
    }

    /// Artifact filename suffix, including the `.sql` part
    pub fn artifact_suffix(&self) -> &'static str {
        match self {
            Compression::Gzip => ".sql.gz",
            Compression::Zstd => ".sql.zst",
        }
    }

    pub fn level_range(&self) -> (i32, i32) {
        match self {
            Compression::Gzip => (0, 9),
            Compression::Zstd => {
                let range = zstd::compression_level_range();
                (*range.start(), *range.end())
            }
        }
    }

    fn level(&self, level: Option<i32>) -> Level {
        match (self, level) {
            (_, Some(level)) => Level::Precise(level),
            (Compression::Zstd, None) => Level::Precise(zstd::DEFAULT_COMPRESSION_LEVEL),
            (Compression::Gzip, None) => Level::Default,
        }
    }

    /// Wrap `writer` in a compressing encoder.
    ///
    /// The returned writer must be shut down (`AsyncWriteExt::shutdown`) to
    /// emit the trailer; dropping it early leaves a truncated stream.
    pub fn encoder<W>(&self, writer: W, level: Option<i32>) -> BoxAsyncWrite
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let level = self.level(level);
        match self {
            Compression::Gzip => Box::new(GzipEncoder::with_quality(writer, level)),
            Compression::Zstd => Box::new(ZstdEncoder::with_quality(writer, level)),
        }
    }

    /// Wrap `reader` in a decompressing decoder.
    pub fn decoder<R>(&self, reader: R) -> BoxAsyncRead
    where
        R: AsyncBufRead + Send + Unpin + 'static,
    {
        match self {
            Compression::Gzip => {
                let mut decoder = GzipDecoder::new(reader);
                decoder.multiple_members(true);
                Box::new(decoder)
            }
            Compression::Zstd => {
                let mut decoder = ZstdDecoder::new(reader);
                decoder.multiple_members(true);
                Box::new(decoder)
            }
        }
    }

    /// Open an artifact on disk as a decompressed stream read in
    /// `chunk_size` pieces.
    pub async fn open_decoded(&self, path: &Path, chunk_size: usize) -> std::io::Result<BoxAsyncRead> {
        let file = tokio::fs::File::open(path).await?;
        Ok(self.decoder(BufReader::with_capacity(chunk_size, file)))
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
