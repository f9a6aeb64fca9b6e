//! Serialization seam
//!
//! The facade never serializes values itself. A [`Codec`] turns values into
//! bytes for the disk tier and back; the caller picks the format.

/// Error type codecs report; wrapped into [`crate::Error::Codec`].
pub type CodecError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Encodes values for the disk tier and decodes them on the way back.
pub trait Codec: Send + Sync + 'static {
    /// The in-memory value type this codec handles.
    type Value: Send + Sync + 'static;

    /// Turn a value into the bytes persisted on disk.
    fn encode(&self, value: &Self::Value) -> Result<Vec<u8>, CodecError>;

    /// Rebuild a value from persisted bytes.
    fn decode(&self, bytes: &[u8]) -> Result<Self::Value, CodecError>;
}

/// Identity codec for callers whose values already are byte vectors.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesCodec;

impl Codec for BytesCodec {
    type Value = Vec<u8>;

    fn encode(&self, value: &Self::Value) -> Result<Vec<u8>, CodecError> {
        Ok(value.clone())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Self::Value, CodecError> {
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_codec_is_identity() {
        let codec = BytesCodec;
        let value = b"payload".to_vec();

        let encoded = codec.encode(&value).unwrap();
        assert_eq!(encoded, value);
        assert_eq!(codec.decode(&encoded).unwrap(), value);
    }
}
