//! Query - request/reply procedure.
//!
//! Per message: skip when there is no reply address, decode, run the
//! pipeline, answer. Failures are answered with a JSON error envelope.
//! `INVALID_DATA` stops there; every other error is also raised to the
//! failure channel.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, warn};

use super::ProcedureKind;
use crate::app::middleware::Pipeline;
use crate::app::runtime::RuntimeContext;
use crate::app::worker_loop::{MessageHandler, ProcedureHandle, spawn_loop};
use crate::codec::envelope::{OutboundMetadata, headers, raw_header};
use crate::codec::{Encoder, JSON, JsonEncoder};
use crate::domain::{Data, EnvelopeStatus, ErrorKind, RpcError};
use crate::ports::{Message, SubscribeOptions};
use crate::typed::{Handler, Resolver, TypedResolver, Validator};

#[derive(Clone)]
pub struct Query {
    pipeline: Pipeline,
    input: Option<Arc<dyn Validator>>,
    resolver: Option<Arc<dyn Resolver>>,
    response_encoding: String,
    subscribe: SubscribeOptions,
}

impl Query {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline,
            input: None,
            resolver: None,
            response_encoding: JSON.to_owned(),
            subscribe: SubscribeOptions::default(),
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

    /// MIME key of the encoder used for successful replies.
    pub fn response_encoding(mut self, mime: impl Into<String>) -> Self {
        self.response_encoding = mime.into();
        self
    }

    pub fn subscribe_options(mut self, options: SubscribeOptions) -> Self {
        self.subscribe = options;
        self
    }

    pub fn encoding(&self) -> &str {
        &self.response_encoding
    }

    pub fn has_input_schema(&self) -> bool {
        self.input.is_some()
    }

    pub fn has_resolver(&self) -> bool {
        self.resolver.is_some()
    }

    pub async fn start(&self, runtime: &RuntimeContext, subject: &str) -> Result<ProcedureHandle, RpcError> {
        let resolver = self.resolver.clone().ok_or_else(|| {
            RpcError::internal(format!("no resolver defined for query handler '{subject}'"))
        })?;

        let subscription = runtime
            .transport()
            .subscribe(subject, self.subscribe.clone())
            .await
            .map_err(|e| RpcError::internal(format!("failed to subscribe to '{subject}'")).with_cause(e))?;

        let worker = Arc::new(QueryWorker {
            runtime: runtime.clone(),
            subject: subject.to_owned(),
            pipeline: self.pipeline.clone(),
            input: self.input.clone(),
            resolver,
            response_encoding: self.response_encoding.clone(),
        });
        Ok(spawn_loop(
            subject,
            ProcedureKind::Query,
            subscription,
            worker,
            runtime.failures().clone(),
        ))
    }
}

pub(crate) struct QueryWorker {
    runtime: RuntimeContext,
    subject: String,
    pipeline: Pipeline,
    input: Option<Arc<dyn Validator>>,
    resolver: Arc<dyn Resolver>,
    response_encoding: String,
}

impl QueryWorker {
    async fn fail(&self, reply: &str, parent_id: Option<&str>, error: RpcError) -> Result<(), RpcError> {
        if let Err(publish_error) = self.reply_error(reply, parent_id, &error).await {
            warn!(subject = %self.subject, error = %publish_error, "failed to publish error reply");
        }

        if error.is(ErrorKind::InvalidData) {
            info!(subject = %self.subject, error = %error, "rejected malformed query");
            Ok(())
        } else {
            error!(subject = %self.subject, kind = %error.kind(), error = %error, "query failed");
            Err(error)
        }
    }

    /// Error envelopes are always JSON.
    async fn reply_error(&self, reply: &str, parent_id: Option<&str>, error: &RpcError) -> Result<(), RpcError> {
        let body = Data::json(&error.to_payload())?;
        let payload = JsonEncoder
            .encode(&body)
            .map_err(|e| RpcError::internal("failed to encode error reply").with_cause(e))?;
        let headers = self.runtime.outbound_headers(
            OutboundMetadata::new(&self.subject, JSON)
                .parent_id(parent_id)
                .status(EnvelopeStatus::Error),
        );
        self.runtime
            .transport()
            .publish(Message::new(reply, payload).with_headers(headers))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl MessageHandler<Message> for QueryWorker {
    async fn handle(&self, message: Message) -> Result<(), RpcError> {
        let Some(reply) = message.reply.clone() else {
            info!(subject = %self.subject, "no reply subject set, skipping message");
            return Ok(());
        };

        let envelope = match self.runtime.decode(&message, self.input.as_deref()) {
            Ok(envelope) => envelope,
            Err(error) => {
                let parent_id = raw_header(self.runtime.configuration(), &message, headers::ID);
                return self.fail(&reply, parent_id, error).await;
            }
        };

        let outcome = self
            .pipeline
            .run(
                self.runtime.context_builder(),
                &message,
                &envelope,
                None,
                self.resolver.as_ref(),
            )
            .await;
        let output = match outcome.and_then(|out| out.result) {
            Ok(output) => output,
            Err(error) => return self.fail(&reply, Some(envelope.id.as_str()), error).await,
        };

        let payload = match self.runtime.encoders().encode(&self.response_encoding, &output) {
            Ok(payload) => payload,
            Err(error) => return self.fail(&reply, Some(envelope.id.as_str()), error).await,
        };

        let headers = self.runtime.outbound_headers(
            OutboundMetadata::new(&self.subject, &self.response_encoding)
                .parent_id(Some(envelope.id.as_str()))
                .status(EnvelopeStatus::Success),
        );
        self.runtime
            .transport()
            .publish(Message::new(reply, payload).with_headers(headers))
            .await
            .map_err(|e| {
                error!(subject = %self.subject, error = %e, "failed to publish reply");
                RpcError::internal("failed to publish reply").with_cause(e)
            })?;

        debug!(subject = %self.subject, request_id = %envelope.id, "query answered");
        Ok(())
    }
}
