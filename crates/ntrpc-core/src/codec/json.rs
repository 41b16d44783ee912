use bytes::Bytes;

use super::{CodecError, Encoder};
use crate::domain::Data;

/// `application/json`
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEncoder;

impl Encoder for JsonEncoder {
    fn encode(&self, data: &Data) -> Result<Bytes, CodecError> {
        match data {
            Data::Json(value) => serde_json::to_vec(value)
                .map(Bytes::from)
                .map_err(|e| CodecError::Malformed(e.to_string())),
            Data::Binary(_) => Err(CodecError::UnsupportedData {
                encoder: "json",
                found: data.variant(),
            }),
        }
    }

    fn decode(&self, bytes: &[u8]) -> Result<Data, CodecError> {
        serde_json::from_slice(bytes)
            .map(Data::Json)
            .map_err(|e| CodecError::Malformed(e.to_string()))
    }
}
