use bytes::Bytes;

use super::{CodecError, Encoder};
use crate::domain::Data;

/// `application/octet-stream`: bytes pass through untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryEncoder;

impl Encoder for BinaryEncoder {
    fn encode(&self, data: &Data) -> Result<Bytes, CodecError> {
        match data {
            Data::Binary(bytes) => Ok(bytes.clone()),
            Data::Json(_) => Err(CodecError::UnsupportedData {
                encoder: "binary",
                found: data.variant(),
            }),
        }
    }

    fn decode(&self, bytes: &[u8]) -> Result<Data, CodecError> {
        Ok(Data::Binary(Bytes::copy_from_slice(bytes)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passes_bytes_through() {
        let data = Data::from(vec![0u8, 159, 146, 150]);
        let bytes = BinaryEncoder.encode(&data).unwrap();
        assert_eq!(BinaryEncoder.decode(&bytes).unwrap(), data);
    }

    #[test]
    fn refuses_json() {
        assert!(BinaryEncoder.encode(&Data::null()).is_err());
    }
}
