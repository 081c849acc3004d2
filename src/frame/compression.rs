//! Frame body compression negotiated in STARTUP.

use std::fmt::Debug;
use std::sync::Arc;

use crate::error::{DriverError, DriverResult};

/// A body transform selected by its STARTUP name
pub trait Compressor: Send + Sync + Debug {
    /// Value sent under the `COMPRESSION` STARTUP key
    fn name(&self) -> &'static str;

    fn compress(&self, data: &[u8]) -> DriverResult<Vec<u8>>;

    fn decompress(&self, data: &[u8]) -> DriverResult<Vec<u8>>;
}

/// LZ4 block format with a 4-byte big-endian uncompressed length prefix
#[derive(Debug, Default, Clone, Copy)]
pub struct Lz4Compressor;

impl Compressor for Lz4Compressor {
    fn name(&self) -> &'static str {
        "lz4"
    }

    fn compress(&self, data: &[u8]) -> DriverResult<Vec<u8>> {
        let compressed = lz4_flex::block::compress(data);
        let mut out = Vec::with_capacity(4 + compressed.len());
        out.extend_from_slice(&(data.len() as u32).to_be_bytes());
        out.extend_from_slice(&compressed);
        Ok(out)
    }

    fn decompress(&self, data: &[u8]) -> DriverResult<Vec<u8>> {
        if data.len() < 4 {
            return Err(DriverError::Compression(
                "lz4 body shorter than its length prefix".to_string(),
            ));
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if len > super::header::MAX_FRAME_SIZE {
            return Err(DriverError::Compression(format!(
                "lz4 uncompressed length {} exceeds frame limit",
                len
            )));
        }
        lz4_flex::block::decompress(&data[4..], len)
            .map_err(|e| DriverError::Compression(format!("lz4 decompression failed: {}", e)))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SnappyCompressor;

impl Compressor for SnappyCompressor {
    fn name(&self) -> &'static str {
        "snappy"
    }

    fn compress(&self, data: &[u8]) -> DriverResult<Vec<u8>> {
        snap::raw::Encoder::new()
            .compress_vec(data)
            .map_err(|e| DriverError::Compression(format!("snappy compression failed: {}", e)))
    }

    fn decompress(&self, data: &[u8]) -> DriverResult<Vec<u8>> {
        snap::raw::Decoder::new()
            .decompress_vec(data)
            .map_err(|e| DriverError::Compression(format!("snappy decompression failed: {}", e)))
    }
}

/// Resolve a configured algorithm name
pub fn compressor_by_name(name: &str) -> DriverResult<Arc<dyn Compressor>> {
    match name.to_ascii_lowercase().as_str() {
        "lz4" => Ok(Arc::new(Lz4Compressor)),
        "snappy" => Ok(Arc::new(SnappyCompressor)),
        other => Err(DriverError::Config(format!(
            "unknown compression algorithm '{}'",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        b"SELECT * FROM system.local WHERE key = 'local'"
            .repeat(20)
            .to_vec()
    }

    #[test]
    fn test_lz4_length_prefix_is_big_endian() {
        let data = sample();
        let compressed = Lz4Compressor.compress(&data).unwrap();
        assert_eq!(&compressed[..4], &(data.len() as u32).to_be_bytes());
        assert!(compressed.len() < data.len());
        assert_eq!(Lz4Compressor.decompress(&compressed).unwrap(), data);
    }

    #[test]
    fn test_snappy_round_trip() {
        let data = sample();
        let compressed = SnappyCompressor.compress(&data).unwrap();
        assert_eq!(SnappyCompressor.decompress(&compressed).unwrap(), data);
    }

    #[test]
    fn test_corrupt_input() {
        assert!(Lz4Compressor.decompress(&[0, 0]).is_err());
        assert!(SnappyCompressor.decompress(&[0xff, 0xff, 0xff]).is_err());
    }

    #[test]
    fn test_lookup_by_name() {
        assert_eq!(compressor_by_name("LZ4").unwrap().name(), "lz4");
        assert_eq!(compressor_by_name("snappy").unwrap().name(), "snappy");
        assert!(matches!(
            compressor_by_name("zstd"),
            Err(DriverError::Config(_))
        ));
    }
}
