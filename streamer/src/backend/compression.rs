//! Block decompressors.
//!
//! Decompression is a pure function of the compressed bytes and the codec.
//! The compression node runs it on the job system, one call per block.

use crate::request::CompressionCodec;
use flate2::read::DeflateDecoder;
use std::io::Read;
use std::sync::Arc;
use thiserror::Error;

/// Errors from decompressing one block.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecompressError {
    #[error("No decompressor for codec {0:?}")]
    UnsupportedCodec(CompressionCodec),

    #[error("Corrupt block: {0}")]
    Corrupt(String),

    #[error("Block decompressed to {actual} bytes, expected {expected}")]
    SizeMismatch { expected: u64, actual: u64 },
}

/// Turns one compressed block into its uncompressed bytes.
pub trait Decompressor: Send + Sync + 'static {
    /// Returns true if this decompressor handles `codec`.
    fn supports(&self, codec: CompressionCodec) -> bool;

    /// Decompresses `input`, which must expand to exactly
    /// `uncompressed_size` bytes.
    fn decompress(
        &self,
        codec: CompressionCodec,
        input: &[u8],
        uncompressed_size: u64,
    ) -> Result<Vec<u8>, DecompressError>;
}

fn check_size(output: Vec<u8>, expected: u64) -> Result<Vec<u8>, DecompressError> {
    if output.len() as u64 == expected {
        Ok(output)
    } else {
        Err(DecompressError::SizeMismatch {
            expected,
            actual: output.len() as u64,
        })
    }
}

/// Passes stored blocks through unchanged.
#[derive(Clone, Copy, Debug, Default)]
pub struct StoredDecompressor;

impl Decompressor for StoredDecompressor {
    fn supports(&self, codec: CompressionCodec) -> bool {
        codec == CompressionCodec::Stored
    }

    fn decompress(
        &self,
        _codec: CompressionCodec,
        input: &[u8],
        uncompressed_size: u64,
    ) -> Result<Vec<u8>, DecompressError> {
        check_size(input.to_vec(), uncompressed_size)
    }
}

/// Raw deflate blocks, decoded with `flate2`.
#[derive(Clone, Copy, Debug, Default)]
pub struct DeflateDecompressor;

impl Decompressor for DeflateDecompressor {
    fn supports(&self, codec: CompressionCodec) -> bool {
        codec == CompressionCodec::Deflate
    }

    fn decompress(
        &self,
        _codec: CompressionCodec,
        input: &[u8],
        uncompressed_size: u64,
    ) -> Result<Vec<u8>, DecompressError> {
        let mut output = Vec::with_capacity(uncompressed_size as usize);
        DeflateDecoder::new(input)
            .read_to_end(&mut output)
            .map_err(|e| DecompressError::Corrupt(e.to_string()))?;
        check_size(output, uncompressed_size)
    }
}

/// Dispatches to the first registered decompressor supporting a codec.
#[derive(Clone)]
pub struct DecompressorSet {
    decompressors: Vec<Arc<dyn Decompressor>>,
}

impl DecompressorSet {
    pub fn empty() -> Self {
        Self {
            decompressors: Vec::new(),
        }
    }

    /// Adds a decompressor, typically for an [`CompressionCodec::Other`] tag.
    pub fn with(mut self, decompressor: Arc<dyn Decompressor>) -> Self {
        self.decompressors.push(decompressor);
        self
    }
}

impl Default for DecompressorSet {
    /// Stored and deflate.
    fn default() -> Self {
        Self::empty()
            .with(Arc::new(StoredDecompressor))
            .with(Arc::new(DeflateDecompressor))
    }
}

impl Decompressor for DecompressorSet {
    fn supports(&self, codec: CompressionCodec) -> bool {
        self.decompressors.iter().any(|d| d.supports(codec))
    }

    fn decompress(
        &self,
        codec: CompressionCodec,
        input: &[u8],
        uncompressed_size: u64,
    ) -> Result<Vec<u8>, DecompressError> {
        self.decompressors
            .iter()
            .find(|d| d.supports(codec))
            .ok_or(DecompressError::UnsupportedCodec(codec))?
            .decompress(codec, input, uncompressed_size)
    }
}

impl std::fmt::Debug for DecompressorSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecompressorSet")
            .field("count", &self.decompressors.len())
            .finish()
    }
}
