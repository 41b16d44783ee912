//! Envelope - CloudEvents-shaped metadata around a payload.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::RpcError;

/// Protocol version stamped on every envelope.
pub const SPEC_VERSION: &str = "1.0";

/// Outcome marker carried by reply envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeStatus {
    Success,
    Error,
}

impl EnvelopeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EnvelopeStatus::Success => "success",
            EnvelopeStatus::Error => "error",
        }
    }
}

impl fmt::Display for EnvelopeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnvelopeStatus {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(EnvelopeStatus::Success),
            "error" => Ok(EnvelopeStatus::Error),
            other => Err(RpcError::invalid_data(format!("invalid envelope status '{other}'"))),
        }
    }
}

/// A `type/subtype` content type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MimeType(String);

impl MimeType {
    /// Accepts exactly two non-empty tokens separated by `/`.
    pub fn parse(value: &str) -> Result<Self, RpcError> {
        let mut parts = value.split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(kind), Some(sub), None)
                if !kind.trim().is_empty() && !sub.trim().is_empty() =>
            {
                Ok(Self(value.to_owned()))
            }
            _ => Err(RpcError::invalid_data(format!("'{value}' is not a valid mime type"))),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for MimeType {
    type Error = RpcError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        MimeType::parse(&value)
    }
}

impl From<MimeType> for String {
    fn from(value: MimeType) -> Self {
        value.0
    }
}

/// One logical message.
///
/// Built by `codec::envelope::decode_inbound`, which guarantees every required
/// field was present and well formed.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<T> {
    pub id: String,
    /// Id of the envelope this one answers.
    pub parent_id: Option<String>,
    pub subject: String,
    /// Instance id of the sender.
    pub source: String,
    pub specversion: String,
    /// Logical procedure path (the `type` header).
    pub event_type: String,
    pub datacontenttype: MimeType,
    pub time: DateTime<Utc>,
    pub status: Option<EnvelopeStatus>,
    pub data: T,
}

impl<T> Envelope<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Envelope<U> {
        Envelope {
            id: self.id,
            parent_id: self.parent_id,
            subject: self.subject,
            source: self.source,
            specversion: self.specversion,
            event_type: self.event_type,
            datacontenttype: self.datacontenttype,
            time: self.time,
            status: self.status,
            data: f(self.data),
        }
    }

    pub fn is_error(&self) -> bool {
        self.status == Some(EnvelopeStatus::Error)
    }
}
