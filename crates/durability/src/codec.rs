//! Storage codec abstraction.
//!
//! WAL record payloads pass through a codec before hitting disk. The log
//! uses LZ4; the identity codec exists for tests and for inspecting raw
//! payloads.

use thiserror::Error;

/// Codec application errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Encoded input could not be decoded.
    #[error("decode failed: {0}")]
    Decode(String),
}

/// Encode/decode seam for record payloads.
pub trait StorageCodec: Send + Sync {
    /// Codec name, for diagnostics.
    fn name(&self) -> &'static str;

    /// Encode a payload.
    fn encode(&self, data: &[u8]) -> Vec<u8>;

    /// Decode a payload.
    fn decode(&self, data: &[u8]) -> Result<Vec<u8>, CodecError>;
}

/// Pass-through codec.
pub struct IdentityCodec;

impl StorageCodec for IdentityCodec {
    fn name(&self) -> &'static str {
        "identity"
    }

    fn encode(&self, data: &[u8]) -> Vec<u8> {
        data.to_vec()
    }

    fn decode(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(data.to_vec())
    }
}

/// LZ4 codec with a length-prepended frame.
pub struct Lz4Codec;

impl StorageCodec for Lz4Codec {
    fn name(&self) -> &'static str {
        "lz4"
    }

    fn encode(&self, data: &[u8]) -> Vec<u8> {
        lz4_flex::compress_prepend_size(data)
    }

    fn decode(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        lz4_flex::decompress_size_prepended(data).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_roundtrip() {
        let codec = IdentityCodec;
        let data = b"some payload";
        assert_eq!(codec.decode(&codec.encode(data)).unwrap(), data);
    }

    #[test]
    fn test_lz4_roundtrip() {
        let codec = Lz4Codec;
        let data = vec![7u8; 10_000];
        let encoded = codec.encode(&data);
        assert!(encoded.len() < data.len());
        assert_eq!(codec.decode(&encoded).unwrap(), data);
    }

    #[test]
    fn test_lz4_decode_garbage() {
        let codec = Lz4Codec;
        assert!(codec.decode(&[0xff, 0x00, 0x12]).is_err());
    }

    #[test]
    fn test_lz4_empty() {
        let codec = Lz4Codec;
        assert_eq!(codec.decode(&codec.encode(&[])).unwrap(), Vec::<u8>::new());
    }
}
