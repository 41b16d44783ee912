//! Queue - durable worker procedure.
//!
//! Backed by a durable stream and consumer (provisioned on `start`) and by job
//! records in the data store. For each delivery:
//!
//! 1. no `message-id` -> term
//! 2. `scheduledAt` in the future -> nak until then, SCHEDULED
//! 3. stored state -> `Decider` (skip = ack)
//! 4. decode, RUNNING + attempt + start, pipeline
//!    - ok -> EXECUTED, aux keys cleared, ack (auto_ack)
//!    - INVALID_DATA -> term, raise
//!    - other -> ERROR, nak(retry_delay), raise
//!
//! `stop()` only ends the local loop. Stream and consumer stay.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, warn};

use super::ProcedureKind;
use crate::app::middleware::Pipeline;
use crate::app::runtime::RuntimeContext;
use crate::app::worker_loop::{MessageHandler, ProcedureHandle, spawn_loop};
use crate::codec::envelope::{headers, raw_header};
use crate::domain::subject::{default_consumer_name, default_stream_name};
use crate::domain::{Decider, DefaultDecider, ErrorKind, RpcError};
use crate::ports::{ConsumeOptions, Delivery, Message};
use crate::queue::{JobRecords, JobStatus, RetryPolicy, provision};
use crate::typed::{Handler, Resolver, TypedResolver, Validator};

/// Per-procedure overrides. `None` falls back to the default.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueConfig {
    /// Durable stream capturing the subject. Default `c-<durable subject>`.
    pub stream_name: Option<String>,
    /// Durable consumer shared by every instance. Default `c-c-<durable subject>`.
    pub consumer_name: Option<String>,
    /// Broker redelivers an unsettled delivery after this long. Default 30s.
    pub wait_for_ack: Option<Duration>,
    /// A RUNNING attempt older than this is presumed stalled. Default 30s.
    pub timeout: Option<Duration>,
    /// Retries allowed after the first attempt. Default 1.
    pub execution_retry: Option<u32>,
    /// `nak` delay after a failed attempt. Default 1s.
    pub retry_delay: Option<Duration>,
    /// Ack on success. With `false` the resolver settles the delivery
    /// through `Request::acker`. Default true.
    pub auto_ack: Option<bool>,
    /// Honour `scheduledAt` by deferring. With `false` a future
    /// `scheduledAt` only warns. Default true.
    pub allow_scheduled_messages: Option<bool>,
    /// Passed as is to `StreamManager::consume`. Default `ConsumeOptions::default()`.
    pub consume: Option<ConsumeOptions>,
}

impl QueueConfig {
    /// Fields set in `overrides` win.
    pub fn merge(self, overrides: QueueConfig) -> QueueConfig {
        QueueConfig {
            stream_name: overrides.stream_name.or(self.stream_name),
            consumer_name: overrides.consumer_name.or(self.consumer_name),
            wait_for_ack: overrides.wait_for_ack.or(self.wait_for_ack),
            timeout: overrides.timeout.or(self.timeout),
            execution_retry: overrides.execution_retry.or(self.execution_retry),
            retry_delay: overrides.retry_delay.or(self.retry_delay),
            auto_ack: overrides.auto_ack.or(self.auto_ack),
            allow_scheduled_messages: overrides
                .allow_scheduled_messages
                .or(self.allow_scheduled_messages),
            consume: overrides.consume.or(self.consume),
        }
    }

    pub fn resolve(&self, subject: &str) -> QueueSettings {
        let defaults = RetryPolicy::default();
        QueueSettings {
            stream_name: self
                .stream_name
                .clone()
                .unwrap_or_else(|| default_stream_name(subject)),
            consumer_name: self
                .consumer_name
                .clone()
                .unwrap_or_else(|| default_consumer_name(subject)),
            wait_for_ack: self.wait_for_ack.unwrap_or(Duration::from_millis(30_000)),
            retry: RetryPolicy {
                execution_retry: self.execution_retry.unwrap_or(defaults.execution_retry),
                retry_delay: self.retry_delay.unwrap_or(defaults.retry_delay),
                timeout: self.timeout.unwrap_or(defaults.timeout),
            },
            auto_ack: self.auto_ack.unwrap_or(true),
            allow_scheduled_messages: self.allow_scheduled_messages.unwrap_or(true),
            consume: self.consume.clone().unwrap_or_default(),
        }
    }
}

/// Effective configuration of a Queue on one subject.
///
/// Fields mean the same as in [`QueueConfig`] with defaults applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSettings {
    pub stream_name: String,
    pub consumer_name: String,
    /// Consumer `ack_wait`.
    pub wait_for_ack: Duration,
    /// `execution_retry`, `retry_delay` and `timeout`.
    pub retry: RetryPolicy,
    pub auto_ack: bool,
    pub allow_scheduled_messages: bool,
    pub consume: ConsumeOptions,
}

#[derive(Clone)]
pub struct Queue {
    pipeline: Pipeline,
    input: Option<Arc<dyn Validator>>,
    resolver: Option<Arc<dyn Resolver>>,
    config: QueueConfig,
    decider: Option<Arc<dyn Decider>>,
}

impl Queue {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline,
            input: None,
            resolver: None,
            config: QueueConfig::default(),
            decider: None,
        }
    }

    pub fn input(mut self, validator: impl Validator + 'static) -> Self {
        self.input = Some(Arc::new(validator));
        self
    }

    pub fn resolve(mut self, resolver: impl Resolver + 'static) -> Self {
        self.resolver = Some(Arc::new(resolver));
        self
    }

    pub fn handler<I, H>(self, handler: H) -> Self
    where
        I: DeserializeOwned + Send + 'static,
        H: Handler<I> + 'static,
    {
        self.resolve(TypedResolver::<I, H>::new(handler))
    }

    pub fn config(mut self, overrides: QueueConfig) -> Self {
        self.config = self.config.merge(overrides);
        self
    }

    pub fn consume_options(self, options: ConsumeOptions) -> Self {
        self.config(QueueConfig {
            consume: Some(options),
            ..QueueConfig::default()
        })
    }

    /// Replace the retry policy driven `DefaultDecider`.
    pub fn decider(mut self, decider: impl Decider + 'static) -> Self {
        self.decider = Some(Arc::new(decider));
        self
    }

    pub fn has_input_schema(&self) -> bool {
        self.input.is_some()
    }

    pub fn has_resolver(&self) -> bool {
        self.resolver.is_some()
    }

    pub fn settings(&self, subject: &str) -> QueueSettings {
        self.config.resolve(subject)
    }

    /// Provision the stream and consumer, then start consuming.
    pub async fn start(&self, runtime: &RuntimeContext, subject: &str) -> Result<ProcedureHandle, RpcError> {
        let resolver = self.resolver.clone().ok_or_else(|| {
            RpcError::internal(format!("no resolver defined for queue handler '{subject}'"))
        })?;
        let streams = runtime.streams().cloned().ok_or_else(|| {
            RpcError::internal(format!("queue '{subject}' requires a stream manager"))
        })?;
        let store = runtime.data_store().cloned().ok_or_else(|| {
            RpcError::internal(format!("queue '{subject}' requires a data store"))
        })?;

        let settings = self.settings(subject);
        provision::ensure_stream(streams.as_ref(), &settings.stream_name, subject).await?;
        let consumer = provision::ensure_consumer(
            streams.as_ref(),
            &settings.stream_name,
            &settings.consumer_name,
            subject,
            settings.wait_for_ack,
        )
        .await?;

        let deliveries = streams
            .consume(&settings.stream_name, &consumer.name, settings.consume.clone())
            .await
            .map_err(|e| {
                RpcError::internal(format!("failed to consume from '{}'", consumer.name)).with_cause(e)
            })?;

        let decider = self
            .decider
            .clone()
            .unwrap_or_else(|| Arc::new(DefaultDecider::new(settings.retry.clone())));
        let worker = Arc::new(QueueWorker {
            runtime: runtime.clone(),
            subject: subject.to_owned(),
            pipeline: self.pipeline.clone(),
            input: self.input.clone(),
            resolver,
            records: JobRecords::new(store),
            decider,
            settings,
        });
        Ok(spawn_loop(
            subject,
            ProcedureKind::Queue,
            deliveries,
            worker,
            runtime.failures().clone(),
        ))
    }
}

struct QueueWorker {
    runtime: RuntimeContext,
    subject: String,
    pipeline: Pipeline,
    input: Option<Arc<dyn Validator>>,
    resolver: Arc<dyn Resolver>,
    records: JobRecords,
    decider: Arc<dyn Decider>,
    settings: QueueSettings,
}

impl QueueWorker {
    fn message_id(&self, message: &Message) -> Option<String> {
        raw_header(self.runtime.configuration(), message, headers::MESSAGE_ID)
            .filter(|id| !id.trim().is_empty())
            .map(str::to_owned)
    }

    /// Unparsable values are logged and ignored.
    fn scheduled_at(&self, message: &Message, message_id: &str) -> Option<DateTime<Utc>> {
        let raw = raw_header(self.runtime.configuration(), message, headers::SCHEDULED_AT)?;
        match DateTime::parse_from_rfc3339(raw) {
            Ok(at) => Some(at.with_timezone(&Utc)),
            Err(error) => {
                warn!(subject = %self.subject, message_id, raw, %error, "ignoring unparsable scheduledAt");
                None
            }
        }
    }

    async fn execute(&self, delivery: &Delivery, message_id: &str) -> Result<(), RpcError> {
        let envelope = match self.runtime.decode(&delivery.message, self.input.as_deref()) {
            Ok(envelope) => envelope,
            Err(error) => return self.reject(delivery, message_id, error).await,
        };

        let attempt = self
            .records
            .start_attempt(message_id, self.runtime.clock().now())
            .await?;
        debug!(subject = %self.subject, message_id, attempt, "executing job");

        let outcome = self
            .pipeline
            .run(
                self.runtime.context_builder(),
                &delivery.message,
                &envelope,
                Some(delivery),
                self.resolver.as_ref(),
            )
            .await;

        match outcome.and_then(|out| out.result) {
            Ok(_) => {
                self.records.complete(message_id).await?;
                if self.settings.auto_ack {
                    delivery.ack().await?;
                }
                info!(subject = %self.subject, message_id, attempt, "job executed");
                Ok(())
            }
            Err(error) if error.is(ErrorKind::InvalidData) => {
                self.reject(delivery, message_id, error).await
            }
            Err(error) => {
                error!(
                    subject = %self.subject,
                    message_id,
                    attempt,
                    kind = %error.kind(),
                    error = %error,
                    "job failed"
                );
                let stored = self.records.set_status(message_id, JobStatus::Error).await;
                delivery.nak(Some(self.settings.retry.retry_delay)).await?;
                stored?;
                Err(error)
            }
        }
    }

    /// Malformed payloads will never succeed.
    async fn reject(&self, delivery: &Delivery, message_id: &str, error: RpcError) -> Result<(), RpcError> {
        warn!(subject = %self.subject, message_id, error = %error, "invalid job payload, terminating");
        delivery.term(error.message()).await?;
        Err(error)
    }
}

#[async_trait]
impl MessageHandler<Delivery> for QueueWorker {
    async fn handle(&self, delivery: Delivery) -> Result<(), RpcError> {
        let Some(message_id) = self.message_id(&delivery.message) else {
            warn!(subject = %self.subject, "message without message id, terminating");
            let header = self.runtime.configuration().header(headers::MESSAGE_ID);
            delivery.term(&format!("missing {header} header")).await?;
            return Ok(());
        };
        let now = self.runtime.clock().now();

        if let Some(scheduled_at) = self.scheduled_at(&delivery.message, &message_id) {
            if scheduled_at > now {
                if self.settings.allow_scheduled_messages {
                    let delay = (scheduled_at - now).to_std().unwrap_or_default();
                    delivery.nak(Some(delay)).await?;
                    self.records.set_status(&message_id, JobStatus::Scheduled).await?;
                    debug!(
                        subject = %self.subject,
                        message_id = %message_id,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "job deferred"
                    );
                    return Ok(());
                }
                warn!(
                    subject = %self.subject,
                    message_id = %message_id,
                    "scheduled messages are disabled, executing immediately"
                );
            }
        }

        let snapshot = self.records.snapshot(&message_id).await?;
        let decision = self.decider.decide(&snapshot, now);
        if !decision.should_execute() {
            debug!(subject = %self.subject, message_id = %message_id, ?decision, "skipping delivery");
            delivery.ack().await?;
            return Ok(());
        }

        self.execute(&delivery, &message_id).await
    }
}
