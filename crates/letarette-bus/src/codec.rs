//! Payload encoding: JSON, zlib-compressed behind a marker byte once it
//! grows past [`COMPRESSION_LIMIT`].

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;

use letarette_core::{Error, Result};

pub const COMPRESSION_MARKER: u8 = 0xf8;
pub const COMPRESSION_LIMIT: usize = 1024;

pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(value)?;
    if json.len() <= COMPRESSION_LIMIT {
        return Ok(json);
    }

    let mut buf = Vec::with_capacity(json.len() / 4);
    buf.push(COMPRESSION_MARKER);
    let mut encoder = ZlibEncoder::new(buf, Compression::fast());
    encoder.write_all(&json)?;
    Ok(encoder.finish()?)
}

pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    match payload.split_first() {
        Some((&COMPRESSION_MARKER, compressed)) => {
            let mut json = Vec::new();
            ZlibDecoder::new(compressed).read_to_end(&mut json)?;
            Ok(serde_json::from_slice(&json)?)
        }
        Some(_) => Ok(serde_json::from_slice(payload)?),
        None => Err(Error::Protocol("empty payload".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use letarette_core::protocol::DocumentRequest;

    #[test]
    fn test_small_payload_is_plain_json() {
        let req = DocumentRequest {
            space: "docs".into(),
            wanted: vec!["a".into(), "b".into()],
        };
        let payload = encode(&req).unwrap();
        assert_eq!(payload[0], b'{');
        assert_eq!(decode::<DocumentRequest>(&payload).unwrap(), req);
    }

    #[test]
    fn test_large_payload_is_compressed() {
        let req = DocumentRequest {
            space: "docs".into(),
            wanted: (0..500).map(|i| format!("document-{}", i)).collect(),
        };
        let payload = encode(&req).unwrap();
        assert_eq!(payload[0], COMPRESSION_MARKER);
        assert!(payload.len() < serde_json::to_vec(&req).unwrap().len());
        assert_eq!(decode::<DocumentRequest>(&payload).unwrap(), req);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode::<DocumentRequest>(&[]).is_err());
        assert!(decode::<DocumentRequest>(&[COMPRESSION_MARKER, 1, 2, 3]).is_err());
        assert!(decode::<DocumentRequest>(b"not json").is_err());
    }
}
