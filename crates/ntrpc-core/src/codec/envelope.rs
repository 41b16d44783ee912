//! Envelope codec - header mapping between `Message` and `Envelope<Data>`.
//!
//! Every key is the configured prefix followed by one of the names in
//! [`headers`]. Decoding resolves the payload encoder from
//! `datacontenttype`, decodes, checks the required metadata and only then runs
//! the optional input validator.

use chrono::{DateTime, SecondsFormat, Utc};

use super::Encoders;
use crate::config::Configuration;
use crate::domain::{Data, Envelope, EnvelopeStatus, MimeType, RpcError, SPEC_VERSION};
use crate::ports::{Clock, Headers, IdGenerator, Message};
use crate::typed::Validator;

/// Header names, without prefix.
pub mod headers {
    pub const ID: &str = "id";
    pub const PARENT_ID: &str = "parent-id";
    pub const SOURCE: &str = "source";
    pub const SPECVERSION: &str = "specversion";
    pub const TYPE: &str = "type";
    pub const TIME: &str = "time";
    pub const DATACONTENTTYPE: &str = "datacontenttype";
    pub const STATUS: &str = "status";
    /// Queue only: dedup / job-state key.
    pub const MESSAGE_ID: &str = "message-id";
    /// Queue only: deferred execution instant.
    pub const SCHEDULED_AT: &str = "scheduledAt";
}

/// Per-send metadata. Everything else is stamped by `build_outbound_headers`.
#[derive(Debug, Clone, Copy)]
pub struct OutboundMetadata<'a> {
    pub event_type: &'a str,
    pub content_type: &'a str,
    pub parent_id: Option<&'a str>,
    pub status: Option<EnvelopeStatus>,
}

impl<'a> OutboundMetadata<'a> {
    pub fn new(event_type: &'a str, content_type: &'a str) -> Self {
        Self {
            event_type,
            content_type,
            parent_id: None,
            status: None,
        }
    }

    pub fn parent_id(mut self, parent_id: Option<&'a str>) -> Self {
        self.parent_id = parent_id;
        self
    }

    pub fn status(mut self, status: EnvelopeStatus) -> Self {
        self.status = Some(status);
        self
    }
}

/// Fresh id, `source`, `time` and `specversion`, plus the given metadata.
pub fn build_outbound_headers(
    config: &Configuration,
    ids: &dyn IdGenerator,
    clock: &dyn Clock,
    metadata: OutboundMetadata<'_>,
) -> Headers {
    let mut out = Headers::new();
    out.insert(config.header(headers::ID), ids.envelope_id());
    out.insert(config.header(headers::SOURCE), config.instance_id.as_str());
    out.insert(config.header(headers::SPECVERSION), SPEC_VERSION);
    out.insert(config.header(headers::TYPE), metadata.event_type);
    out.insert(
        config.header(headers::TIME),
        clock.now().to_rfc3339_opts(SecondsFormat::Millis, true),
    );
    out.insert(config.header(headers::DATACONTENTTYPE), metadata.content_type);
    if let Some(parent_id) = metadata.parent_id {
        out.insert(config.header(headers::PARENT_ID), parent_id);
    }
    if let Some(status) = metadata.status {
        out.insert(config.header(headers::STATUS), status.as_str());
    }
    out
}

/// Raw header value by unprefixed name, without any validation.
pub fn raw_header<'m>(config: &Configuration, message: &'m Message, name: &str) -> Option<&'m str> {
    message.headers.get(&config.header(name))
}

/// Decode and validate an inbound message. Every failure is `INVALID_DATA`.
pub fn decode_inbound(
    config: &Configuration,
    encoders: &Encoders,
    message: &Message,
    validator: Option<&dyn Validator>,
) -> Result<Envelope<Data>, RpcError> {
    if message.headers.is_empty() {
        return Err(RpcError::invalid_data("no headers found on message"));
    }

    let content_type = required(config, message, headers::DATACONTENTTYPE)?;
    let datacontenttype = MimeType::parse(content_type)?;
    let encoder = encoders.get(datacontenttype.as_str()).ok_or_else(|| {
        RpcError::invalid_data(format!(
            "no encoder can handle received envelope of type '{datacontenttype}'"
        ))
    })?;
    let data = encoder.decode(&message.payload).map_err(|e| {
        RpcError::invalid_data(format!("failed to decode '{datacontenttype}' payload")).with_cause(e)
    })?;

    let id = required(config, message, headers::ID)?.to_owned();
    let source = required(config, message, headers::SOURCE)?.to_owned();
    let event_type = required(config, message, headers::TYPE)?.to_owned();

    let specversion = required(config, message, headers::SPECVERSION)?;
    if specversion != SPEC_VERSION {
        return Err(RpcError::invalid_data(format!(
            "unsupported specversion '{specversion}'"
        )));
    }

    let raw_time = required(config, message, headers::TIME)?;
    let time = DateTime::parse_from_rfc3339(raw_time)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| RpcError::invalid_data(format!("invalid time '{raw_time}'")).with_cause(e))?;

    let parent_id = raw_header(config, message, headers::PARENT_ID)
        .filter(|v| !v.is_empty())
        .map(str::to_owned);
    let status = raw_header(config, message, headers::STATUS)
        .map(str::parse::<EnvelopeStatus>)
        .transpose()?;

    let data = match validator {
        Some(validator) => validator.validate(data).map_err(|e| {
            RpcError::invalid_data(format!("input validation failed: {e}")).with_cause(e)
        })?,
        None => data,
    };

    Ok(Envelope {
        id,
        parent_id,
        subject: message.subject.clone(),
        source,
        specversion: specversion.to_owned(),
        event_type,
        datacontenttype,
        time,
        status,
        data,
    })
}

fn required<'m>(config: &Configuration, message: &'m Message, name: &str) -> Result<&'m str, RpcError> {
    match raw_header(config, message, name) {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(RpcError::invalid_data(format!(
            "missing required header '{}'",
            config.header(name)
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{BINARY, JSON};
    use crate::domain::{BoxError, ErrorKind};
    use crate::ports::{FixedClock, UlidGenerator};
    use crate::typed::validator_fn;
    use chrono::TimeZone;
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 1, 8, 30, 0).unwrap()
    }

    fn config() -> Configuration {
        Configuration::default().with_instance_id("server-1")
    }

    fn outbound(config: &Configuration, payload: &[u8], content_type: &str) -> Message {
        let clock = FixedClock::new(t0());
        let ids = UlidGenerator::new(FixedClock::new(t0()));
        let headers = build_outbound_headers(
            config,
            &ids,
            &clock,
            OutboundMetadata::new("math.add", content_type).parent_id(Some("parent-1")),
        );
        Message::new("math.add", payload.to_vec()).with_headers(headers)
    }

    #[test]
    fn outbound_headers_use_prefix() {
        let config = config().with_headers_prefix("x-");
        let msg = outbound(&config, b"{}", JSON);
        assert_eq!(msg.headers.get("x-source"), Some("server-1"));
        assert_eq!(msg.headers.get("x-specversion"), Some("1.0"));
        assert_eq!(msg.headers.get("x-type"), Some("math.add"));
        assert_eq!(msg.headers.get("x-time"), Some("2026-04-01T08:30:00.000Z"));
        assert_eq!(msg.headers.get("x-parent-id"), Some("parent-1"));
        assert!(msg.headers.get("x-status").is_none());
        assert!(msg.headers.contains_key("x-id"));
    }

    #[test]
    fn outbound_headers_decode_back() {
        let config = config();
        let msg = outbound(&config, br#"{"a":1}"#, JSON);

        let env = decode_inbound(&config, &Encoders::default(), &msg, None).unwrap();
        assert_eq!(env.subject, "math.add");
        assert_eq!(env.event_type, "math.add");
        assert_eq!(env.source, "server-1");
        assert_eq!(env.parent_id.as_deref(), Some("parent-1"));
        assert_eq!(env.time, t0());
        assert_eq!(env.datacontenttype.as_str(), JSON);
        assert_eq!(env.data, Data::Json(json!({"a": 1})));
        assert_eq!(Some(env.id.as_str()), msg.headers.get("ntrpc-id"));
    }

    #[test]
    fn binary_payload_decodes_as_bytes() {
        let config = config();
        let msg = outbound(&config, &[1, 2, 3], BINARY);
        let env = decode_inbound(&config, &Encoders::default(), &msg, None).unwrap();
        assert_eq!(env.data, Data::from(vec![1u8, 2, 3]));
    }

    #[test]
    fn unregistered_content_type_is_invalid_data() {
        let config = config();
        let msg = outbound(&config, b"\x81\xa1a\x01", "application/x-msgpack");
        let err = decode_inbound(&config, &Encoders::default(), &msg, None).unwrap_err();
        assert!(err.is(ErrorKind::InvalidData));
        assert!(err.message().contains("application/x-msgpack"));
    }

    #[test]
    fn missing_headers_are_invalid_data() {
        let config = config();
        let bare = Message::new("math.add", b"{}".to_vec());
        let err = decode_inbound(&config, &Encoders::default(), &bare, None).unwrap_err();
        assert!(err.is(ErrorKind::InvalidData));

        let mut msg = outbound(&config, b"{}", JSON);
        msg.headers.remove("ntrpc-source");
        let err = decode_inbound(&config, &Encoders::default(), &msg, None).unwrap_err();
        assert!(err.is(ErrorKind::InvalidData));
        assert!(err.message().contains("ntrpc-source"));
    }

    #[test]
    fn bad_time_and_version_are_invalid_data() {
        let config = config();
        let mut msg = outbound(&config, b"{}", JSON);
        msg.headers.insert("ntrpc-time", "last tuesday");
        assert!(decode_inbound(&config, &Encoders::default(), &msg, None)
            .unwrap_err()
            .is(ErrorKind::InvalidData));

        let mut msg = outbound(&config, b"{}", JSON);
        msg.headers.insert("ntrpc-specversion", "0.3");
        assert!(decode_inbound(&config, &Encoders::default(), &msg, None)
            .unwrap_err()
            .is(ErrorKind::InvalidData));
    }

    #[test]
    fn undecodable_payload_is_invalid_data() {
        let config = config();
        let msg = outbound(&config, b"{not json", JSON);
        let err = decode_inbound(&config, &Encoders::default(), &msg, None).unwrap_err();
        assert!(err.is(ErrorKind::InvalidData));
        assert!(err.cause().is_some());
    }

    #[test]
    fn validator_failure_carries_cause() {
        let config = config();
        let msg = outbound(&config, br#"{"a":-1}"#, JSON);
        let positive = validator_fn(|data: Data| -> Result<Data, BoxError> {
            match data.as_json().and_then(|v| v["a"].as_i64()) {
                Some(a) if a > 0 => Ok(data),
                _ => Err("a must be positive".into()),
            }
        });

        let err = decode_inbound(&config, &Encoders::default(), &msg, Some(&positive)).unwrap_err();
        assert!(err.is(ErrorKind::InvalidData));
        assert_eq!(err.cause().map(|c| c.to_string()).as_deref(), Some("a must be positive"));
    }
}
