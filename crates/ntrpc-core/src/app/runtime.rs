//! Runtime - 全 procedure が共有する依存の束
//!
//! transport / stream manager / data store / 設定 / encoders / context builder /
//! 時計 / ID 生成器 / failure 通知先をまとめて持つ。clone は Arc の clone のみ。

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::warn;

use crate::codec::envelope::{OutboundMetadata, build_outbound_headers, decode_inbound};
use crate::codec::Encoders;
use crate::config::Configuration;
use crate::domain::{BoxError, Context, Data, Envelope, RpcError};
use crate::ports::{
    Clock, DataStore, Headers, IdGenerator, Message, StreamManager, SystemClock, Transport,
    UlidGenerator,
};
use crate::procedures::ProcedureKind;
use crate::typed::Validator;

/// Produces the base context of a message, before any middleware runs.
#[async_trait]
pub trait ContextBuilder: Send + Sync {
    async fn build(&self, message: &Message, envelope: &Envelope<Data>) -> Result<Context, BoxError>;
}

/// Starts every message with an empty context.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyContext;

#[async_trait]
impl ContextBuilder for EmptyContext {
    async fn build(&self, _message: &Message, _envelope: &Envelope<Data>) -> Result<Context, BoxError> {
        Ok(Context::new())
    }
}

/// Context builder from a synchronous function.
pub struct FnContext<F>(F);

pub fn context_fn<F>(f: F) -> FnContext<F>
where
    F: Fn(&Message, &Envelope<Data>) -> Context + Send + Sync,
{
    FnContext(f)
}

#[async_trait]
impl<F> ContextBuilder for FnContext<F>
where
    F: Fn(&Message, &Envelope<Data>) -> Context + Send + Sync,
{
    async fn build(&self, message: &Message, envelope: &Envelope<Data>) -> Result<Context, BoxError> {
        Ok((self.0)(message, envelope))
    }
}

/// An error raised past a procedure loop.
#[derive(Debug, Clone)]
pub struct ProcedureFailure {
    pub subject: String,
    pub kind: ProcedureKind,
    pub error: RpcError,
}

/// Failures buffered before new ones are dropped.
pub const FAILURE_CHANNEL_CAPACITY: usize = 1024;

/// Sending half of the process-level failure channel.
///
/// A detached reporter drops failures; the loops log them either way.
/// When the receiver falls behind, newer failures are dropped with a warning.
#[derive(Debug, Clone, Default)]
pub struct FailureReporter {
    sender: Option<mpsc::Sender<ProcedureFailure>>,
}

impl FailureReporter {
    pub fn channel() -> (Self, mpsc::Receiver<ProcedureFailure>) {
        Self::with_capacity(FAILURE_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> (Self, mpsc::Receiver<ProcedureFailure>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { sender: Some(tx) }, rx)
    }

    pub fn detached() -> Self {
        Self::default()
    }

    pub fn report(&self, failure: ProcedureFailure) {
        let Some(sender) = &self.sender else {
            return;
        };
        match sender.try_send(failure) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(failure)) => {
                warn!(
                    subject = %failure.subject,
                    kind = %failure.kind,
                    error = %failure.error,
                    "failure channel full, dropping failure"
                );
            }
            // nobody is listening anymore
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

#[derive(Clone)]
pub struct RuntimeContext {
    transport: Arc<dyn Transport>,
    streams: Option<Arc<dyn StreamManager>>,
    data_store: Option<Arc<dyn DataStore>>,
    configuration: Configuration,
    encoders: Encoders,
    context_builder: Arc<dyn ContextBuilder>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    failures: FailureReporter,
}

impl RuntimeContext {
    /// Defaults: fresh configuration, base encoders, empty context, system
    /// clock, ULID ids, detached failure reporter.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Self {
            transport,
            streams: None,
            data_store: None,
            configuration: Configuration::default(),
            encoders: Encoders::default(),
            context_builder: Arc::new(EmptyContext),
            ids: Arc::new(UlidGenerator::new(Arc::clone(&clock))),
            clock,
            failures: FailureReporter::detached(),
        }
    }

    pub fn with_streams(mut self, streams: Arc<dyn StreamManager>) -> Self {
        self.streams = Some(streams);
        self
    }

    pub fn with_data_store(mut self, store: Arc<dyn DataStore>) -> Self {
        self.data_store = Some(store);
        self
    }

    pub fn with_configuration(mut self, configuration: Configuration) -> Self {
        self.configuration = configuration;
        self
    }

    pub fn with_encoders(mut self, encoders: Encoders) -> Self {
        self.encoders = encoders;
        self
    }

    pub fn with_context_builder(mut self, builder: Arc<dyn ContextBuilder>) -> Self {
        self.context_builder = builder;
        self
    }

    /// Also rebuilds the id generator on the new clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.ids = Arc::new(UlidGenerator::new(Arc::clone(&clock)));
        self.clock = clock;
        self
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn with_failures(mut self, failures: FailureReporter) -> Self {
        self.failures = failures;
        self
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn streams(&self) -> Option<&Arc<dyn StreamManager>> {
        self.streams.as_ref()
    }

    pub fn data_store(&self) -> Option<&Arc<dyn DataStore>> {
        self.data_store.as_ref()
    }

    pub fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    pub fn encoders(&self) -> &Encoders {
        &self.encoders
    }

    pub fn context_builder(&self) -> &dyn ContextBuilder {
        self.context_builder.as_ref()
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn ids(&self) -> &dyn IdGenerator {
        self.ids.as_ref()
    }

    pub fn failures(&self) -> &FailureReporter {
        &self.failures
    }

    pub fn outbound_headers(&self, metadata: OutboundMetadata<'_>) -> Headers {
        build_outbound_headers(&self.configuration, self.ids(), self.clock(), metadata)
    }

    pub fn decode(&self, message: &Message, validator: Option<&dyn Validator>) -> Result<Envelope<Data>, RpcError> {
        decode_inbound(&self.configuration, &self.encoders, message, validator)
    }
}

impl fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("configuration", &self.configuration)
            .field("encoders", &self.encoders)
            .field("streams", &self.streams.is_some())
            .field("data_store", &self.data_store.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(n: usize) -> ProcedureFailure {
        ProcedureFailure {
            subject: format!("jobs.{n}"),
            kind: ProcedureKind::Queue,
            error: RpcError::internal("boom"),
        }
    }

    #[tokio::test]
    async fn full_failure_channel_drops_newer_failures() {
        let (reporter, mut failures) = FailureReporter::with_capacity(2);
        for n in 0..5 {
            reporter.report(failure(n));
        }
        drop(reporter);

        let mut seen = Vec::new();
        while let Some(f) = failures.recv().await {
            seen.push(f.subject);
        }
        assert_eq!(seen, vec!["jobs.0", "jobs.1"]);
    }

    #[test]
    fn reporting_after_the_receiver_is_gone_is_silent() {
        let (reporter, failures) = FailureReporter::channel();
        drop(failures);
        reporter.report(failure(0));
        FailureReporter::detached().report(failure(1));
    }
}
