//! Errors - error kinds and classification.
//!
//! `RpcError` is the only error that crosses a procedure boundary. Anything
//! else raised by application code is folded into `INTERNAL_ERROR` by
//! [`classify`], keeping the original value reachable through `source()`.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Error type accepted from resolvers, middlewares and validators.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

type Cause = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// The error vocabulary shared by server and client.
///
/// Serialized as SCREAMING_SNAKE_CASE so the names on the wire match the
/// protocol (`INVALID_DATA`, `INTERNAL_ERROR`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Malformed envelope, failed decode, failed input validation.
    InvalidData,
    InvalidRequest,
    /// A namespace path does not lead to a procedure of the requested kind.
    ProcedureNotFound,
    InvalidMethodParams,
    /// Unclassified failure, missing resolver, infrastructure fault.
    InternalError,
    /// An encoder was handed a payload variant it cannot represent.
    UnknownDataType,
    /// No encoder is registered for a requested content type.
    UnknownEncoder,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidData => "INVALID_DATA",
            ErrorKind::InvalidRequest => "INVALID_REQUEST",
            ErrorKind::ProcedureNotFound => "PROCEDURE_NOT_FOUND",
            ErrorKind::InvalidMethodParams => "INVALID_METHOD_PARAMS",
            ErrorKind::InternalError => "INTERNAL_ERROR",
            ErrorKind::UnknownDataType => "UNKNOWN_DATA_TYPE",
            ErrorKind::UnknownEncoder => "UNKNOWN_ENCODER",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INVALID_DATA" => Ok(ErrorKind::InvalidData),
            "INVALID_REQUEST" => Ok(ErrorKind::InvalidRequest),
            "PROCEDURE_NOT_FOUND" => Ok(ErrorKind::ProcedureNotFound),
            "INVALID_METHOD_PARAMS" => Ok(ErrorKind::InvalidMethodParams),
            "INTERNAL_ERROR" => Ok(ErrorKind::InternalError),
            "UNKNOWN_DATA_TYPE" => Ok(ErrorKind::UnknownDataType),
            "UNKNOWN_ENCODER" => Ok(ErrorKind::UnknownEncoder),
            other => Err(RpcError::invalid_data(format!("unknown error kind '{other}'"))),
        }
    }
}

/// A classified error.
///
/// Cloneable so a single failure can be logged, answered to a caller and
/// reported to the process at the same time.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct RpcError {
    kind: ErrorKind,
    message: String,
    #[source]
    cause: Option<Cause>,
}

impl RpcError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
        }
    }

    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidData, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalError, message)
    }

    pub fn procedure_not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProcedureNotFound, message)
    }

    pub fn unknown_encoder(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnknownEncoder, message)
    }

    /// Attach the underlying error.
    pub fn with_cause(mut self, cause: impl Into<BoxError>) -> Self {
        self.cause = Some(Arc::from(cause.into()));
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn cause(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        self.cause.as_deref()
    }

    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }

    /// Wire representation sent in error envelopes. The cause stays local.
    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            code: self.kind,
            message: self.message.clone(),
        }
    }
}

impl From<ErrorPayload> for RpcError {
    fn from(payload: ErrorPayload) -> Self {
        RpcError::new(payload.code, payload.message)
    }
}

/// JSON body of an error envelope: `{"code": "...", "message": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorKind,
    pub message: String,
}

/// Apply the classification rule: an `RpcError` passes through unchanged,
/// anything else becomes `INTERNAL_ERROR` with the original as cause.
pub fn classify(error: BoxError) -> RpcError {
    match error.downcast::<RpcError>() {
        Ok(rpc) => *rpc,
        Err(other) => RpcError::internal("unhandled error while running procedure").with_cause(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(ErrorKind::InvalidData, "INVALID_DATA")]
    #[case(ErrorKind::ProcedureNotFound, "PROCEDURE_NOT_FOUND")]
    #[case(ErrorKind::UnknownEncoder, "UNKNOWN_ENCODER")]
    #[case(ErrorKind::UnknownDataType, "UNKNOWN_DATA_TYPE")]
    fn kinds_serialize_as_wire_names(#[case] kind: ErrorKind, #[case] expected: &str) {
        let s = serde_json::to_string(&kind).unwrap();
        assert_eq!(s, format!("\"{expected}\""));
        assert_eq!(kind.as_str(), expected);
        assert_eq!(expected.parse::<ErrorKind>().unwrap(), kind);
    }

    #[test]
    fn classify_passes_rpc_errors_through() {
        let original = RpcError::invalid_data("bad payload");
        let boxed: BoxError = Box::new(original);
        let classified = classify(boxed);
        assert_eq!(classified.kind(), ErrorKind::InvalidData);
        assert_eq!(classified.message(), "bad payload");
    }

    #[test]
    fn classify_wraps_foreign_errors_as_internal() {
        let io = std::io::Error::other("disk on fire");
        let classified = classify(Box::new(io));
        assert_eq!(classified.kind(), ErrorKind::InternalError);

        let cause = std::error::Error::source(&classified).expect("cause is kept");
        assert_eq!(cause.to_string(), "disk on fire");
    }

    #[test]
    fn payload_omits_cause() {
        let err = RpcError::internal("boom").with_cause(std::io::Error::other("inner"));
        let v = serde_json::to_value(err.to_payload()).unwrap();
        assert_eq!(v, serde_json::json!({"code": "INTERNAL_ERROR", "message": "boom"}));

        let back: RpcError = serde_json::from_value::<ErrorPayload>(v).unwrap().into();
        assert!(back.is(ErrorKind::InternalError));
        assert!(back.cause().is_none());
    }
}
