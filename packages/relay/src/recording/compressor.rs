// packages/relay/src/recording/compressor.rs
//! Archive segment compression
//!
//! Archives are JSON-lines; this module turns the assembled bytes into the
//! on-disk form for the configured codec and back again.

use crate::utils::errors::{PipelineError, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use tracing::debug;

/// Archive codecs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionCodec {
    /// Plain `.jsonl`
    None,

    /// `.jsonl.gz`
    Gzip,

    /// `.jsonl.zst`
    Zstd,
}

impl CompressionCodec {
    /// File suffix for archives written with this codec
    pub fn extension(&self) -> &'static str {
        match self {
            CompressionCodec::None => ".jsonl",
            CompressionCodec::Gzip => ".jsonl.gz",
            CompressionCodec::Zstd => ".jsonl.zst",
        }
    }

    /// Detect the codec from an archive file name
    pub fn from_file_name(name: &str) -> Option<Self> {
        if name.ends_with(".jsonl.gz") {
            Some(CompressionCodec::Gzip)
        } else if name.ends_with(".jsonl.zst") {
            Some(CompressionCodec::Zstd)
        } else if name.ends_with(".jsonl") {
            Some(CompressionCodec::None)
        } else {
            None
        }
    }
}

/// Compression levels
#[derive(Debug, Clone, Copy)]
pub enum CompressionLevel {
    /// Fast compression
    Fast,

    /// Balanced
    Balanced,

    /// Best compression
    Best,
}

impl CompressionLevel {
    fn gzip(&self) -> Compression {
        match self {
            CompressionLevel::Fast => Compression::fast(),
            CompressionLevel::Balanced => Compression::default(),
            CompressionLevel::Best => Compression::best(),
        }
    }

    fn zstd(&self) -> i32 {
        match self {
            CompressionLevel::Fast => 1,
            CompressionLevel::Balanced => 3,
            CompressionLevel::Best => 19,
        }
    }
}

/// Codec + level pair applied to archive payloads
#[derive(Debug, Clone, Copy)]
pub struct Compressor {
    codec: CompressionCodec,
    level: CompressionLevel,
}

impl Compressor {
    pub fn new(codec: CompressionCodec, level: CompressionLevel) -> Self {
        Self { codec, level }
    }

    pub fn codec(&self) -> CompressionCodec {
        self.codec
    }

    /// Compress data
    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let compressed = match self.codec {
            CompressionCodec::None => return Ok(data.to_vec()),
            CompressionCodec::Gzip => {
                let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 4), self.level.gzip());
                encoder.write_all(data).map_err(compression_error)?;
                encoder.finish().map_err(compression_error)?
            }
            CompressionCodec::Zstd => {
                zstd::encode_all(data, self.level.zstd()).map_err(compression_error)?
            }
        };

        debug!(
            codec = ?self.codec,
            raw = data.len(),
            compressed = compressed.len(),
            "Compressed archive payload"
        );

        Ok(compressed)
    }

    /// Decompress data written with `codec`
    pub fn decompress(codec: CompressionCodec, data: &[u8]) -> Result<Vec<u8>> {
        match codec {
            CompressionCodec::None => Ok(data.to_vec()),
            CompressionCodec::Gzip => {
                let mut out = Vec::with_capacity(data.len() * 4);
                GzDecoder::new(data)
                    .read_to_end(&mut out)
                    .map_err(compression_error)?;
                Ok(out)
            }
            CompressionCodec::Zstd => zstd::decode_all(data).map_err(compression_error),
        }
    }
}

impl Default for Compressor {
    fn default() -> Self {
        Self::new(CompressionCodec::Gzip, CompressionLevel::Balanced)
    }
}

fn compression_error(e: std::io::Error) -> PipelineError {
    PipelineError::CompressionFailed(e.to_string())
}
