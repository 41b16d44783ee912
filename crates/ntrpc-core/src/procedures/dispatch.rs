//! Dispatch - fire-and-forget procedure. Never replies.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::{debug, error, info};

use super::ProcedureKind;
use crate::app::middleware::Pipeline;
use crate::app::runtime::RuntimeContext;
use crate::app::worker_loop::{MessageHandler, ProcedureHandle, spawn_loop};
use crate::domain::{ErrorKind, RpcError};
use crate::ports::{Message, SubscribeOptions};
use crate::typed::{Handler, Resolver, TypedResolver, Validator};

#[derive(Clone)]
pub struct Dispatch {
    pipeline: Pipeline,
    input: Option<Arc<dyn Validator>>,
    resolver: Option<Arc<dyn Resolver>>,
    subscribe: SubscribeOptions,
}

impl Dispatch {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline,
            input: None,
            resolver: None,
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

    pub fn subscribe_options(mut self, options: SubscribeOptions) -> Self {
        self.subscribe = options;
        self
    }

    pub fn has_input_schema(&self) -> bool {
        self.input.is_some()
    }

    pub fn has_resolver(&self) -> bool {
        self.resolver.is_some()
    }

    pub async fn start(&self, runtime: &RuntimeContext, subject: &str) -> Result<ProcedureHandle, RpcError> {
        let resolver = self.resolver.clone().ok_or_else(|| {
            RpcError::internal(format!("no resolver defined for dispatch handler '{subject}'"))
        })?;

        let subscription = runtime
            .transport()
            .subscribe(subject, self.subscribe.clone())
            .await
            .map_err(|e| RpcError::internal(format!("failed to subscribe to '{subject}'")).with_cause(e))?;

        let worker = Arc::new(DispatchWorker {
            runtime: runtime.clone(),
            subject: subject.to_owned(),
            pipeline: self.pipeline.clone(),
            input: self.input.clone(),
            resolver,
        });
        Ok(spawn_loop(
            subject,
            ProcedureKind::Dispatch,
            subscription,
            worker,
            runtime.failures().clone(),
        ))
    }
}

struct DispatchWorker {
    runtime: RuntimeContext,
    subject: String,
    pipeline: Pipeline,
    input: Option<Arc<dyn Validator>>,
    resolver: Arc<dyn Resolver>,
}

impl DispatchWorker {
    async fn process(&self, message: &Message) -> Result<(), RpcError> {
        let envelope = self.runtime.decode(message, self.input.as_deref())?;
        let outcome = self
            .pipeline
            .run(
                self.runtime.context_builder(),
                message,
                &envelope,
                None,
                self.resolver.as_ref(),
            )
            .await?;
        outcome.result?;
        debug!(subject = %self.subject, id = %envelope.id, "dispatch handled");
        Ok(())
    }
}

#[async_trait]
impl MessageHandler<Message> for DispatchWorker {
    async fn handle(&self, message: Message) -> Result<(), RpcError> {
        match self.process(&message).await {
            Ok(()) => Ok(()),
            Err(error) if error.is(ErrorKind::InvalidData) => {
                info!(subject = %self.subject, error = %error, "rejected malformed dispatch");
                Ok(())
            }
            Err(error) => {
                error!(subject = %self.subject, kind = %error.kind(), error = %error, "dispatch failed");
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::runtime::FailureReporter;
    use crate::domain::{BoxError, Data};
    use crate::ports::Transport;
    use crate::test_support::{outbound_message, runtime_with};
    use crate::typed::{Request, resolver_fn};
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    fn recorder(seen: Arc<Mutex<Vec<Data>>>) -> Dispatch {
        Dispatch::new(Pipeline::new()).resolve(resolver_fn(move |req: Request| {
            let seen = Arc::clone(&seen);
            async move {
                if req.input().as_json() == Some(&json!("boom")) {
                    return Err::<Data, BoxError>("exploded".into());
                }
                seen.lock().unwrap().push(req.envelope.data.clone());
                Ok(Data::null())
            }
        }))
    }

    #[tokio::test]
    async fn start_without_resolver_is_internal_error() {
        let (_broker, runtime) = runtime_with(FailureReporter::detached());
        let err = Dispatch::new(Pipeline::new())
            .start(&runtime, "audit.record")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InternalError);
    }

    #[tokio::test]
    async fn handles_published_messages_and_reports_failures() {
        let (reporter, mut failures) = FailureReporter::channel();
        let (broker, runtime) = runtime_with(reporter);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handle = recorder(Arc::clone(&seen))
            .start(&runtime, "audit.record")
            .await
            .unwrap();

        broker
            .publish(Message::new("audit.record", b"garbage".to_vec()))
            .await
            .unwrap();
        broker
            .publish(outbound_message(&runtime, "audit.record", json!("boom")))
            .await
            .unwrap();
        broker
            .publish(outbound_message(&runtime, "audit.record", json!({"user": 7})))
            .await
            .unwrap();

        let failure = tokio::time::timeout(Duration::from_secs(1), failures.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failure.kind, ProcedureKind::Dispatch);
        assert_eq!(failure.error.kind(), ErrorKind::InternalError);

        tokio::time::timeout(Duration::from_secs(1), async {
            while seen.lock().unwrap().is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        handle.stop().await;

        assert_eq!(seen.lock().unwrap().clone(), vec![Data::Json(json!({"user": 7}))]);
        // the malformed message was absorbed
        assert!(failures.try_recv().is_err());
    }
}
