use std::io::{Read, Write};

use serde::{Serialize, de::DeserializeOwned};

use crate::error::{Error, Result};

/// Serialization format for outbound payloads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    /// JSON format (human-readable, good for debugging).
    #[default]
    Json,

    /// CBOR format (compact binary, better for high-volume telemetry).
    Cbor,
}

/// Compression codec applied to telemetry batches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    /// Payload is sent as encoded.
    #[default]
    None,

    /// gzip at maximum compression level.
    Gzip,

    /// xz/lzma at preset 9.
    Lzma,
}

/// Encode a value to bytes using the specified format.
pub fn encode<T: Serialize>(value: &T, format: Format) -> Result<Vec<u8>> {
    match format {
        Format::Json => serde_json::to_vec(value).map_err(Error::from),
        Format::Cbor => {
            let mut buf = Vec::new();
            ciborium::into_writer(value, &mut buf)?;
            Ok(buf)
        }
    }
}

/// Decode bytes to a value using the specified format.
pub fn decode<T: DeserializeOwned>(data: &[u8], format: Format) -> Result<T> {
    match format {
        Format::Json => serde_json::from_slice(data).map_err(Error::from),
        Format::Cbor => ciborium::from_reader(data).map_err(|e| Error::Cbor(e.to_string())),
    }
}

/// Compress raw bytes with the given codec.
pub fn compress(data: &[u8], compression: Compression) -> Result<Vec<u8>> {
    match compression {
        Compression::None => Ok(data.to_vec()),
        Compression::Gzip => {
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::best());
            encoder
                .write_all(data)
                .map_err(|e| Error::Compression(e.to_string()))?;
            encoder
                .finish()
                .map_err(|e| Error::Compression(e.to_string()))
        }
        Compression::Lzma => {
            let mut encoder = xz2::write::XzEncoder::new(Vec::new(), 9);
            encoder
                .write_all(data)
                .map_err(|e| Error::Compression(e.to_string()))?;
            encoder
                .finish()
                .map_err(|e| Error::Compression(e.to_string()))
        }
    }
}

/// Reverse [`compress`].
pub fn decompress(data: &[u8], compression: Compression) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    match compression {
        Compression::None => out.extend_from_slice(data),
        Compression::Gzip => {
            flate2::read::GzDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(|e| Error::Compression(e.to_string()))?;
        }
        Compression::Lzma => {
            xz2::read::XzDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(|e| Error::Compression(e.to_string()))?;
        }
    }
    Ok(out)
}

/// Encode a value and compress the result in one step.
pub fn encode_compressed<T: Serialize>(
    value: &T,
    format: Format,
    compression: Compression,
) -> Result<Vec<u8>> {
    let encoded = encode(value, format)?;
    compress(&encoded, compression)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{ReadingResult, TelemetryEvent};

    fn sample_batch() -> Vec<TelemetryEvent> {
        (0..20)
            .map(|i| {
                TelemetryEvent::new(
                    format!("temperature_{}", i),
                    3,
                    ReadingResult::Values(vec![215, 0, 1]),
                )
            })
            .collect()
    }

    #[test]
    fn test_cbor_is_smaller() {
        let batch = sample_batch();

        let json = encode(&batch, Format::Json).unwrap();
        let cbor = encode(&batch, Format::Cbor).unwrap();

        assert!(cbor.len() < json.len(), "CBOR should be smaller than JSON");
    }

    #[test]
    fn test_gzip_and_lzma_shrink_repetitive_batches() {
        let batch = sample_batch();
        let plain = encode(&batch, Format::Json).unwrap();

        for codec in [Compression::Gzip, Compression::Lzma] {
            let packed = encode_compressed(&batch, Format::Json, codec).unwrap();
            assert!(packed.len() < plain.len(), "{:?} did not shrink", codec);
            assert_eq!(decompress(&packed, codec).unwrap(), plain);
        }
    }

    #[test]
    fn test_no_compression_is_identity() {
        let data = b"[1,2,3]";
        assert_eq!(compress(data, Compression::None).unwrap(), data.to_vec());
    }

    #[test]
    fn test_codec_names() {
        let codec: Compression = serde_json::from_str("\"lzma\"").unwrap();
        assert_eq!(codec, Compression::Lzma);
        let format: Format = serde_json::from_str("\"cbor\"").unwrap();
        assert_eq!(format, Format::Cbor);
    }

    #[test]
    fn test_corrupt_gzip_is_reported() {
        let result = decompress(b"definitely not gzip", Compression::Gzip);
        assert!(matches!(result, Err(Error::Compression(_))));
    }
}
