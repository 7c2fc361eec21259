//! Shared CBOR encode/decode helpers used by the object tree (C7) for change
//! envelopes and root metadata.

use ciborium::{from_reader, into_writer};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("CBOR encode error: {0}")]
    Encode(String),
    #[error("CBOR decode error: {0}")]
    Decode(String),
}

pub fn encode_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::new();
    into_writer(value, &mut buf).map_err(|e| CodecError::Encode(e.to_string()))?;
    Ok(buf)
}

pub fn decode_cbor<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, CodecError> {
    from_reader(bytes).map_err(|e| CodecError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize as De, Serialize as Se};

    #[derive(Debug, Se, De, PartialEq)]
    struct Sample {
        a: u32,
        b: String,
    }

    #[test]
    fn roundtrip() {
        let value = Sample { a: 1, b: "x".into() };
        let bytes = encode_cbor(&value).unwrap();
        let decoded: Sample = decode_cbor(&bytes).unwrap();
        assert_eq!(value, decoded);
    }
}
