//! Payload values carried by envelopes.

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::errors::{ErrorKind, RpcError};

/// A decoded payload.
///
/// Encoders turn bytes into one of these variants and back. JSON payloads stay
/// as `serde_json::Value` until a typed handler deserializes them.
#[derive(Debug, Clone, PartialEq)]
pub enum Data {
    Json(Value),
    Binary(Bytes),
}

impl Data {
    /// Serialize any value into a JSON payload.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, RpcError> {
        serde_json::to_value(value).map(Data::Json).map_err(|e| {
            RpcError::new(ErrorKind::UnknownDataType, "value cannot be represented as JSON")
                .with_cause(e)
        })
    }

    pub fn null() -> Self {
        Data::Json(Value::Null)
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Data::Json(v) => Some(v),
            Data::Binary(_) => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Data::Binary(b) => Some(b),
            Data::Json(_) => None,
        }
    }

    /// Variant name used in error messages.
    pub fn variant(&self) -> &'static str {
        match self {
            Data::Json(_) => "json",
            Data::Binary(_) => "binary",
        }
    }

    /// Deserialize a JSON payload into `T`. Binary payloads and shape
    /// mismatches are `INVALID_DATA`.
    pub fn decode_json<T: DeserializeOwned>(&self) -> Result<T, RpcError> {
        let Data::Json(value) = self else {
            return Err(RpcError::invalid_data(format!(
                "expected a json payload, got {}",
                self.variant()
            )));
        };
        T::deserialize(value)
            .map_err(|e| RpcError::invalid_data("payload does not match the expected shape").with_cause(e))
    }
}

impl Default for Data {
    fn default() -> Self {
        Data::null()
    }
}

impl From<Value> for Data {
    fn from(value: Value) -> Self {
        Data::Json(value)
    }
}

impl From<Bytes> for Data {
    fn from(bytes: Bytes) -> Self {
        Data::Binary(bytes)
    }
}

impl From<Vec<u8>> for Data {
    fn from(bytes: Vec<u8>) -> Self {
        Data::Binary(Bytes::from(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Point {
        x: i64,
        y: i64,
    }

    #[test]
    fn decode_json_deserializes_matching_payload() {
        let data = Data::from(json!({"x": 1, "y": 2}));
        assert_eq!(data.decode_json::<Point>().unwrap(), Point { x: 1, y: 2 });
    }

    #[test]
    fn decode_json_rejects_binary_and_mismatches() {
        let bin = Data::from(vec![1u8, 2, 3]);
        assert!(bin.decode_json::<Point>().unwrap_err().is(ErrorKind::InvalidData));

        let wrong = Data::from(json!({"x": "one"}));
        let err = wrong.decode_json::<Point>().unwrap_err();
        assert!(err.is(ErrorKind::InvalidData));
        assert!(err.cause().is_some());
    }
}
