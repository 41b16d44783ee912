//! Shared fixtures for unit tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use crate::app::runtime::{FailureReporter, RuntimeContext};
use crate::codec::JSON;
use crate::codec::envelope::OutboundMetadata;
use crate::config::Configuration;
use crate::domain::{Context, Data, Envelope, MimeType, SPEC_VERSION};
use crate::impls::{InMemoryBroker, MemoryDataStore};
use crate::ports::{Acker, Delivery, DeliveryInfo, Message, TransportError};
use crate::typed::Request;

pub(crate) fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0)
        .single()
        .unwrap_or_default()
}

pub(crate) fn envelope(data: Data) -> Envelope<Data> {
    Envelope {
        id: "01TESTENVELOPE".to_owned(),
        parent_id: None,
        subject: "svc.op".to_owned(),
        source: "test-instance".to_owned(),
        specversion: SPEC_VERSION.to_owned(),
        event_type: "svc.op".to_owned(),
        datacontenttype: MimeType::parse(JSON).unwrap(),
        time: t0(),
        status: None,
        data,
    }
}

pub(crate) fn request(data: Data) -> Request {
    Request {
        ctx: Context::new(),
        envelope: envelope(data),
        message: Message::new("svc.op", b"null".to_vec()),
        delivery: None,
    }
}

/// Broker as transport and streams, in-memory store, fixed instance id.
pub(crate) fn runtime_with(failures: FailureReporter) -> (Arc<InMemoryBroker>, RuntimeContext) {
    let broker = Arc::new(InMemoryBroker::new());
    let runtime = RuntimeContext::new(broker.clone())
        .with_streams(broker.clone())
        .with_data_store(Arc::new(MemoryDataStore::new()))
        .with_configuration(Configuration::default().with_instance_id("test-instance"))
        .with_failures(failures);
    (broker, runtime)
}

/// A well formed JSON request as a client would send it.
pub(crate) fn outbound_message(runtime: &RuntimeContext, subject: &str, value: Value) -> Message {
    let payload = runtime.encoders().encode(JSON, &Data::Json(value)).unwrap();
    let headers = runtime.outbound_headers(OutboundMetadata::new(subject, JSON));
    Message::new(subject, payload).with_headers(headers)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum AckCall {
    Ack,
    Nak(Option<Duration>),
    Term(String),
}

#[derive(Default)]
pub(crate) struct RecordingAcker {
    calls: Mutex<Vec<AckCall>>,
}

impl RecordingAcker {
    pub(crate) fn calls(&self) -> Vec<AckCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: AckCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Acker for RecordingAcker {
    async fn ack(&self) -> Result<(), TransportError> {
        self.record(AckCall::Ack);
        Ok(())
    }

    async fn nak(&self, delay: Option<Duration>) -> Result<(), TransportError> {
        self.record(AckCall::Nak(delay));
        Ok(())
    }

    async fn term(&self, reason: &str) -> Result<(), TransportError> {
        self.record(AckCall::Term(reason.to_owned()));
        Ok(())
    }
}

pub(crate) fn delivery(message: Message) -> (Delivery, Arc<RecordingAcker>) {
    let acker = Arc::new(RecordingAcker::default());
    let info = DeliveryInfo {
        stream: "c-jobs-email".to_owned(),
        consumer: "c-c-jobs-email".to_owned(),
        stream_sequence: 1,
        delivered: 1,
    };
    (Delivery::new(message, info, acker.clone()), acker)
}
