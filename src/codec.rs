//! Compression codecs for stored and fetched model artifacts
//!
//! The codec is selected by the compression tag recorded in a model's
//! metadata. Checksums are always computed over the decompressed payload,
//! so the codec choice never affects integrity verification.

use crate::error::{DeliveryError, DeliveryResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Cursor, Read, Write};
use std::str::FromStr;

const BROTLI_BUFFER_SIZE: usize = 4096;
const BROTLI_QUALITY: u32 = 9;
const BROTLI_LG_WINDOW: u32 = 22;
const ZSTD_LEVEL: i32 = 9;

/// Compression type tag stored alongside every artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionType {
    /// Pass-through
    #[default]
    None,
    /// Generic deflate in a gzip frame
    Gzip,
    /// Zstandard
    Zstd,
    /// Brotli
    Brotli,
}

impl CompressionType {
    pub const ALL: [CompressionType; 4] = [Self::None, Self::Gzip, Self::Zstd, Self::Brotli];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Zstd => "zstd",
            Self::Brotli => "brotli",
        }
    }
}

impl fmt::Display for CompressionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompressionType {
    type Err = DeliveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "" => Ok(Self::None),
            "gzip" => Ok(Self::Gzip),
            "zstd" => Ok(Self::Zstd),
            "brotli" => Ok(Self::Brotli),
            other => Err(DeliveryError::UnsupportedCompression(other.to_string())),
        }
    }
}

/// One-shot compress/decompress operations
pub trait Codec: Send + Sync {
    fn compression_type(&self) -> CompressionType;

    fn compress(&self, input: &[u8]) -> DeliveryResult<Vec<u8>>;

    fn decompress(&self, input: &[u8]) -> DeliveryResult<Vec<u8>>;
}

/// Get the codec implementation for a compression tag
pub fn codec_for(compression: CompressionType) -> &'static dyn Codec {
    match compression {
        CompressionType::None => &PassThrough,
        CompressionType::Gzip => &GzipCodec,
        CompressionType::Zstd => &ZstdCodec,
        CompressionType::Brotli => &BrotliCodec,
    }
}

/// Compress `input` with the codec named by `compression`
pub fn compress(input: &[u8], compression: CompressionType) -> DeliveryResult<Vec<u8>> {
    codec_for(compression).compress(input)
}

/// Decompress `input` with the codec named by `compression`
pub fn decompress(input: &[u8], compression: CompressionType) -> DeliveryResult<Vec<u8>> {
    codec_for(compression).decompress(input)
}

fn codec_error(compression: CompressionType, op: &str, err: impl fmt::Display) -> DeliveryError {
    DeliveryError::InternalFailure(format!("{} {} failed: {}", compression, op, err))
}

pub struct PassThrough;

impl Codec for PassThrough {
    fn compression_type(&self) -> CompressionType {
        CompressionType::None
    }

    fn compress(&self, input: &[u8]) -> DeliveryResult<Vec<u8>> {
        Ok(input.to_vec())
    }

    fn decompress(&self, input: &[u8]) -> DeliveryResult<Vec<u8>> {
        Ok(input.to_vec())
    }
}

pub struct GzipCodec;

impl Codec for GzipCodec {
    fn compression_type(&self) -> CompressionType {
        CompressionType::Gzip
    }

    fn compress(&self, input: &[u8]) -> DeliveryResult<Vec<u8>> {
        let mut encoder = flate2::write::GzEncoder::new(
            Vec::with_capacity(input.len() / 2),
            flate2::Compression::default(),
        );
        encoder
            .write_all(input)
            .map_err(|e| codec_error(CompressionType::Gzip, "compression", e))?;
        encoder
            .finish()
            .map_err(|e| codec_error(CompressionType::Gzip, "compression", e))
    }

    fn decompress(&self, input: &[u8]) -> DeliveryResult<Vec<u8>> {
        let mut decoder = flate2::read::GzDecoder::new(input);
        let mut out = Vec::with_capacity(input.len() * 2);
        decoder
            .read_to_end(&mut out)
            .map_err(|e| codec_error(CompressionType::Gzip, "decompression", e))?;
        Ok(out)
    }
}

pub struct ZstdCodec;

impl Codec for ZstdCodec {
    fn compression_type(&self) -> CompressionType {
        CompressionType::Zstd
    }

    fn compress(&self, input: &[u8]) -> DeliveryResult<Vec<u8>> {
        zstd::encode_all(Cursor::new(input), ZSTD_LEVEL)
            .map_err(|e| codec_error(CompressionType::Zstd, "compression", e))
    }

    fn decompress(&self, input: &[u8]) -> DeliveryResult<Vec<u8>> {
        zstd::decode_all(Cursor::new(input))
            .map_err(|e| codec_error(CompressionType::Zstd, "decompression", e))
    }
}

pub struct BrotliCodec;

impl Codec for BrotliCodec {
    fn compression_type(&self) -> CompressionType {
        CompressionType::Brotli
    }

    fn compress(&self, input: &[u8]) -> DeliveryResult<Vec<u8>> {
        let mut writer = brotli::CompressorWriter::new(
            Vec::with_capacity(input.len() / 2),
            BROTLI_BUFFER_SIZE,
            BROTLI_QUALITY,
            BROTLI_LG_WINDOW,
        );
        writer
            .write_all(input)
            .map_err(|e| codec_error(CompressionType::Brotli, "compression", e))?;
        writer
            .flush()
            .map_err(|e| codec_error(CompressionType::Brotli, "compression", e))?;
        Ok(writer.into_inner())
    }

    fn decompress(&self, input: &[u8]) -> DeliveryResult<Vec<u8>> {
        let mut reader = brotli::Decompressor::new(input, BROTLI_BUFFER_SIZE);
        let mut out = Vec::with_capacity(input.len() * 2);
        reader
            .read_to_end(&mut out)
            .map_err(|e| codec_error(CompressionType::Brotli, "decompression", e))?;
        Ok(out)
    }
}
