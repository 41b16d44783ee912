//! Client - procedure の呼び出し側
//!
//! # フロー (query)
//! 1. 選んだ encoding で payload を encode
//! 2. outbound header を付与 (`type` = subject)
//! 3. request/reply (default 15s timeout)
//! 4. 返信 envelope を decode。`status = error` なら相手側の `RpcError` に戻す
//!
//! dispatch は publish のみ。queue は `message-id` (省略時は生成) と任意の
//! `scheduledAt` を付けて publish し、message id を返す。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::app::runtime::RuntimeContext;
use crate::codec::envelope::{OutboundMetadata, build_outbound_headers, decode_inbound, headers};
use crate::codec::{Encoders, JSON};
use crate::config::Configuration;
use crate::domain::{Data, Envelope, EnvelopeStatus, ErrorPayload, RpcError};
use crate::namespace::Manifest;
use crate::ports::{Clock, Headers, IdGenerator, Message, SystemClock, Transport, UlidGenerator};
use crate::procedures::ProcedureKind;

pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// MIME key of the request payload.
    pub encoding: String,
    pub timeout: Duration,
    pub parent_id: Option<String>,
    /// Extra headers. Envelope headers take precedence.
    pub headers: Headers,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            encoding: JSON.to_owned(),
            timeout: DEFAULT_QUERY_TIMEOUT,
            parent_id: None,
            headers: Headers::new(),
        }
    }
}

impl QueryOptions {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn encoding(mut self, mime: impl Into<String>) -> Self {
        self.encoding = mime.into();
        self
    }
}

#[derive(Debug, Clone)]
pub struct DispatchOptions {
    pub encoding: String,
    pub parent_id: Option<String>,
    pub headers: Headers,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            encoding: JSON.to_owned(),
            parent_id: None,
            headers: Headers::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub encoding: String,
    pub parent_id: Option<String>,
    pub headers: Headers,
    /// Dedup key. Generated when absent.
    pub message_id: Option<String>,
    /// Do not execute before this instant.
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            encoding: JSON.to_owned(),
            parent_id: None,
            headers: Headers::new(),
            message_id: None,
            scheduled_at: None,
        }
    }
}

impl QueueOptions {
    pub fn message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }
}

/// Successful query reply.
#[derive(Debug, Clone)]
pub struct Response {
    pub envelope: Envelope<Data>,
    pub message: Message,
}

impl Response {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, RpcError> {
        self.envelope.data.decode_json()
    }
}

#[derive(Clone)]
pub struct Client {
    transport: Arc<dyn Transport>,
    configuration: Configuration,
    encoders: Encoders,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    manifest: Option<Manifest>,
}

impl Client {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Self {
            transport,
            configuration: Configuration::default(),
            encoders: Encoders::default(),
            ids: Arc::new(UlidGenerator::new(Arc::clone(&clock))),
            clock,
            manifest: None,
        }
    }

    /// Share transport, configuration and encoders with a server runtime.
    pub fn from_runtime(runtime: &RuntimeContext) -> Self {
        Self::new(Arc::clone(runtime.transport()))
            .with_configuration(runtime.configuration().clone())
            .with_encoders(runtime.encoders().clone())
    }

    pub fn with_configuration(mut self, configuration: Configuration) -> Self {
        self.configuration = configuration;
        self
    }

    pub fn with_encoders(mut self, encoders: Encoders) -> Self {
        self.encoders = encoders;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.ids = Arc::new(UlidGenerator::new(Arc::clone(&clock)));
        self.clock = clock;
        self
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    /// Reject subjects that are not procedures of the called kind.
    pub fn with_manifest(mut self, manifest: Manifest) -> Self {
        self.manifest = Some(manifest);
        self
    }

    fn check(&self, subject: &str, kind: ProcedureKind) -> Result<(), RpcError> {
        let Some(manifest) = &self.manifest else {
            return Ok(());
        };
        match manifest.get(subject) {
            Some(descriptor) if descriptor.kind == kind => Ok(()),
            Some(descriptor) => Err(RpcError::procedure_not_found(format!(
                "'{subject}' is a {} procedure, not a {kind}",
                descriptor.kind
            ))),
            None => Err(RpcError::procedure_not_found(format!(
                "no {kind} procedure at '{subject}'"
            ))),
        }
    }

    fn outbound(
        &self,
        subject: &str,
        data: &Data,
        encoding: &str,
        parent_id: Option<&str>,
        extra: &Headers,
    ) -> Result<Message, RpcError> {
        let payload = self.encoders.encode(encoding, data)?;
        let envelope_headers = build_outbound_headers(
            &self.configuration,
            self.ids.as_ref(),
            self.clock.as_ref(),
            OutboundMetadata::new(subject, encoding).parent_id(parent_id),
        );
        let mut headers = extra.clone();
        headers.extend(&envelope_headers);
        Ok(Message::new(subject, payload).with_headers(headers))
    }

    pub async fn query(&self, subject: &str, data: Data, options: QueryOptions) -> Result<Response, RpcError> {
        self.check(subject, ProcedureKind::Query)?;
        let message = self.outbound(
            subject,
            &data,
            &options.encoding,
            options.parent_id.as_deref(),
            &options.headers,
        )?;

        let reply = self
            .transport
            .request(message, options.timeout)
            .await
            .map_err(|e| RpcError::internal("error sending request").with_cause(e))?;
        let envelope = decode_inbound(&self.configuration, &self.encoders, &reply, None)?;

        if envelope.status == Some(EnvelopeStatus::Error) {
            let payload: ErrorPayload = envelope.data.decode_json()?;
            debug!(subject, code = %payload.code, "query answered with an error");
            return Err(payload.into());
        }
        Ok(Response {
            envelope,
            message: reply,
        })
    }

    /// JSON query with serde types on both ends.
    pub async fn query_json<I, O>(&self, subject: &str, input: &I) -> Result<O, RpcError>
    where
        I: Serialize + ?Sized + Sync,
        O: DeserializeOwned,
    {
        let response = self
            .query(subject, Data::json(input)?, QueryOptions::default())
            .await?;
        response.json()
    }

    pub async fn dispatch(&self, subject: &str, data: Data, options: DispatchOptions) -> Result<(), RpcError> {
        self.check(subject, ProcedureKind::Dispatch)?;
        let message = self.outbound(
            subject,
            &data,
            &options.encoding,
            options.parent_id.as_deref(),
            &options.headers,
        )?;
        self.publish(message).await
    }

    pub async fn dispatch_json<I>(&self, subject: &str, input: &I) -> Result<(), RpcError>
    where
        I: Serialize + ?Sized + Sync,
    {
        self.dispatch(subject, Data::json(input)?, DispatchOptions::default())
            .await
    }

    /// Returns the message id the job is tracked under.
    pub async fn queue(&self, subject: &str, data: Data, options: QueueOptions) -> Result<String, RpcError> {
        self.check(subject, ProcedureKind::Queue)?;
        let mut message = self.outbound(
            subject,
            &data,
            &options.encoding,
            options.parent_id.as_deref(),
            &options.headers,
        )?;

        let message_id = options
            .message_id
            .unwrap_or_else(|| self.ids.message_id());
        message
            .headers
            .insert(self.configuration.header(headers::MESSAGE_ID), message_id.as_str());
        if let Some(at) = options.scheduled_at {
            message.headers.insert(
                self.configuration.header(headers::SCHEDULED_AT),
                at.to_rfc3339_opts(SecondsFormat::Millis, true),
            );
        }

        self.publish(message).await?;
        debug!(subject, message_id = %message_id, "job queued");
        Ok(message_id)
    }

    pub async fn queue_json<I>(&self, subject: &str, input: &I) -> Result<String, RpcError>
    where
        I: Serialize + ?Sized + Sync,
    {
        self.queue(subject, Data::json(input)?, QueueOptions::default())
            .await
    }

    async fn publish(&self, message: Message) -> Result<(), RpcError> {
        self.transport
            .publish(message)
            .await
            .map_err(|e| RpcError::internal("error publishing message").with_cause(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::middleware::Pipeline;
    use crate::app::runtime::FailureReporter;
    use crate::domain::{BoxError, Context, ErrorKind};
    use crate::namespace::Namespace;
    use crate::ports::{FixedClock, SubscribeOptions};
    use crate::procedures::Query;
    use crate::test_support::{runtime_with, t0};
    use crate::typed::{Request, handler_fn, resolver_fn};
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Serialize, Deserialize)]
    struct Greeting {
        name: String,
    }

    fn greeter() -> Query {
        Query::new(Pipeline::new()).handler(handler_fn(|_ctx: Context, input: Greeting| async move {
            if input.name.is_empty() {
                return Err::<String, BoxError>(
                    RpcError::new(ErrorKind::InvalidMethodParams, "name is required").into(),
                );
            }
            Ok(format!("hello {}", input.name))
        }))
    }

    #[tokio::test]
    async fn query_round_trip_and_remote_errors() {
        let (_broker, runtime) = runtime_with(FailureReporter::detached());
        let handle = greeter().start(&runtime, "greet").await.unwrap();
        let client = Client::from_runtime(&runtime);

        let greeting: String = client
            .query_json("greet", &json!({"name": "ada"}))
            .await
            .unwrap();
        assert_eq!(greeting, "hello ada");

        let err = client
            .query_json::<_, String>("greet", &json!({"name": ""}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidMethodParams);
        assert_eq!(err.message(), "name is required");

        handle.stop().await;
    }

    #[tokio::test]
    async fn reply_carries_request_id_as_parent() {
        let (_broker, runtime) = runtime_with(FailureReporter::detached());
        let handle = greeter().start(&runtime, "greet").await.unwrap();
        let client = Client::from_runtime(&runtime);

        let response = client
            .query(
                "greet",
                Data::Json(json!({"name": "bo"})),
                QueryOptions {
                    parent_id: Some("outer".to_owned()),
                    ..QueryOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(response.envelope.status, Some(EnvelopeStatus::Success));
        assert!(response.envelope.parent_id.is_some());
        assert_ne!(response.envelope.parent_id.as_deref(), Some("outer"));
        assert_eq!(response.json::<String>().unwrap(), "hello bo");

        handle.stop().await;
    }

    #[tokio::test]
    async fn transport_failures_are_internal() {
        let (_broker, runtime) = runtime_with(FailureReporter::detached());
        let client = Client::from_runtime(&runtime);

        let err = client
            .query("nobody.home", Data::null(), QueryOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InternalError);
        assert_eq!(err.message(), "error sending request");
        assert!(err.cause().is_some());
    }

    #[tokio::test]
    async fn unknown_request_encoding_fails_before_sending() {
        let (broker, runtime) = runtime_with(FailureReporter::detached());
        let mut everything = broker.subscribe(">", SubscribeOptions::default()).await.unwrap();
        let client = Client::from_runtime(&runtime);

        let err = client
            .dispatch(
                "audit",
                Data::null(),
                DispatchOptions {
                    encoding: "text/csv".to_owned(),
                    ..DispatchOptions::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownEncoder);
        assert!(everything.try_next().is_none());
    }

    #[tokio::test]
    async fn queue_stamps_message_id_and_schedule() {
        let (broker, runtime) = runtime_with(FailureReporter::detached());
        let mut jobs = broker.subscribe("jobs.email", SubscribeOptions::default()).await.unwrap();
        let client = Client::from_runtime(&runtime).with_clock(Arc::new(FixedClock::new(t0())));

        let generated = client.queue_json("jobs.email", &json!({})).await.unwrap();
        let first = jobs.next().await.unwrap();
        assert_eq!(first.headers.get("ntrpc-message-id"), Some(generated.as_str()));
        assert!(!first.headers.contains_key("ntrpc-scheduledAt"));

        let at = t0() + chrono::Duration::minutes(5);
        let id = client
            .queue(
                "jobs.email",
                Data::Json(json!({})),
                QueueOptions::default().message_id("welcome-42").scheduled_at(at),
            )
            .await
            .unwrap();
        assert_eq!(id, "welcome-42");
        let second = jobs.next().await.unwrap();
        assert_eq!(second.headers.get("ntrpc-message-id"), Some("welcome-42"));
        assert_eq!(
            second.headers.get("ntrpc-scheduledAt"),
            Some("2026-03-01T12:05:00.000Z")
        );
    }

    #[tokio::test]
    async fn extra_headers_never_override_envelope_headers() {
        let (broker, runtime) = runtime_with(FailureReporter::detached());
        let mut audit = broker.subscribe("audit", SubscribeOptions::default()).await.unwrap();
        let client = Client::from_runtime(&runtime);

        let options = DispatchOptions {
            headers: Headers::new().with("ntrpc-type", "spoofed").with("trace", "t-1"),
            ..DispatchOptions::default()
        };
        client.dispatch("audit", Data::null(), options).await.unwrap();

        let sent = audit.next().await.unwrap();
        assert_eq!(sent.headers.get("ntrpc-type"), Some("audit"));
        assert_eq!(sent.headers.get("trace"), Some("t-1"));
    }

    #[tokio::test]
    async fn manifest_check_rejects_wrong_kinds() {
        let (_broker, runtime) = runtime_with(FailureReporter::detached());
        let noop = resolver_fn(|_req: Request| async move { Ok::<_, BoxError>(Data::null()) });
        let manifest = Namespace::new()
            .with("audit", crate::procedures::Dispatch::new(Pipeline::new()).resolve(noop))
            .manifest();
        let client = Client::from_runtime(&runtime).with_manifest(manifest);

        let err = client
            .query("audit", Data::null(), QueryOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProcedureNotFound);

        let err = client.queue_json("missing", &json!({})).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProcedureNotFound);

        client.dispatch_json("audit", &json!({})).await.unwrap();
    }
}
