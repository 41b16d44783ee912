//! Codec - payload encoders and the envelope header mapping.
//!
//! Encoders are looked up by MIME key only. A key without an encoder is always
//! an error; there is no fallback encoding.

pub mod binary;
pub mod envelope;
pub mod json;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::domain::{Data, ErrorKind, MimeType, RpcError};

pub use self::binary::BinaryEncoder;
pub use self::envelope::{OutboundMetadata, decode_inbound, headers};
pub use self::json::JsonEncoder;

pub const JSON: &str = "application/json";
pub const BINARY: &str = "application/octet-stream";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("{encoder} encoder cannot handle {found} data")]
    UnsupportedData {
        encoder: &'static str,
        found: &'static str,
    },

    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// Converts between payload bytes and `Data`.
pub trait Encoder: Send + Sync {
    fn encode(&self, data: &Data) -> Result<Bytes, CodecError>;

    fn decode(&self, bytes: &[u8]) -> Result<Data, CodecError>;
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("cannot register encoder: {0}")]
    InvalidMime(#[source] RpcError),
}

/// Encoders keyed by MIME type.
///
/// `Encoders::default()` is the base registry: JSON and octet-stream.
#[derive(Clone)]
pub struct Encoders {
    encoders: HashMap<String, Arc<dyn Encoder>>,
}

impl Default for Encoders {
    fn default() -> Self {
        let mut encoders: HashMap<String, Arc<dyn Encoder>> = HashMap::new();
        encoders.insert(JSON.to_owned(), Arc::new(JsonEncoder));
        encoders.insert(BINARY.to_owned(), Arc::new(BinaryEncoder));
        Self { encoders }
    }
}

impl Encoders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the encoder for `mime`.
    pub fn register(
        &mut self,
        mime: &str,
        encoder: impl Encoder + 'static,
    ) -> Result<(), RegistryError> {
        let key = MimeType::parse(mime).map_err(RegistryError::InvalidMime)?;
        self.encoders.insert(key.as_str().to_owned(), Arc::new(encoder));
        Ok(())
    }

    /// Builder-style `register`.
    pub fn with(mut self, mime: &str, encoder: impl Encoder + 'static) -> Result<Self, RegistryError> {
        self.register(mime, encoder)?;
        Ok(self)
    }

    pub fn get(&self, mime: &str) -> Option<&Arc<dyn Encoder>> {
        self.encoders.get(mime)
    }

    pub fn contains(&self, mime: &str) -> bool {
        self.encoders.contains_key(mime)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.encoders.keys().map(String::as_str)
    }

    /// Encode outbound data. Unregistered key is `UNKNOWN_ENCODER`, a refused
    /// variant is `UNKNOWN_DATA_TYPE`.
    pub fn encode(&self, mime: &str, data: &Data) -> Result<Bytes, RpcError> {
        let encoder = self
            .get(mime)
            .ok_or_else(|| RpcError::unknown_encoder(format!("no encoder registered for '{mime}'")))?;
        encoder.encode(data).map_err(|e| {
            let kind = match e {
                CodecError::UnsupportedData { .. } => ErrorKind::UnknownDataType,
                CodecError::Malformed(_) => ErrorKind::InternalError,
            };
            RpcError::new(kind, format!("failed to encode payload as '{mime}'")).with_cause(e)
        })
    }
}

impl fmt::Debug for Encoders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&str> = self.keys().collect();
        keys.sort_unstable();
        f.debug_struct("Encoders").field("keys", &keys).finish()
    }
}
