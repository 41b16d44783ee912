//! AppBuilder - アプリケーションの構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンで ports と namespace をまとめる
//! - 起動時検証 (Fail-fast): 足りない procedure や依存は `build()` で弾く
//! - `App::start()` が全 procedure を起動し、`RunningApp` が停止と失敗通知を持つ

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::mpsc;
use tracing::info;

use super::runtime::{ContextBuilder, FailureReporter, ProcedureFailure, RuntimeContext};
use super::worker_loop::ProcedureHandle;
use crate::codec::Encoders;
use crate::config::Configuration;
use crate::domain::RpcError;
use crate::namespace::{Manifest, Namespace};
use crate::ports::{Clock, DataStore, IdGenerator, StreamManager, Transport};
use crate::procedures::ProcedureKind;

/// # 使用例
/// ```ignore
/// let app = AppBuilder::new(broker.clone())
///     .streams(broker.clone())
///     .data_store(Arc::new(MemoryDataStore::new()))
///     .namespace(namespace)
///     .expect_procedures(&["math.add"])
///     .build()?;
/// let running = app.start().await?;
/// ```
pub struct AppBuilder {
    runtime: RuntimeContext,
    namespace: Namespace,
    expected: Option<Vec<String>>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("missing procedures: {0:?}. These subjects were expected but not declared.")]
    MissingProcedures(Vec<String>),

    #[error("invalid procedure names: {0:?}. A name must be a single subject token.")]
    InvalidName(Vec<String>),

    #[error("queue procedures {0:?} need a stream manager")]
    QueueRequiresStreams(Vec<String>),

    #[error("queue procedures {0:?} need a data store")]
    QueueRequiresDataStore(Vec<String>),
}

impl AppBuilder {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            runtime: RuntimeContext::new(transport),
            namespace: Namespace::new(),
            expected: None,
        }
    }

    pub fn streams(mut self, streams: Arc<dyn StreamManager>) -> Self {
        self.runtime = self.runtime.with_streams(streams);
        self
    }

    pub fn data_store(mut self, store: Arc<dyn DataStore>) -> Self {
        self.runtime = self.runtime.with_data_store(store);
        self
    }

    pub fn configuration(mut self, configuration: Configuration) -> Self {
        self.runtime = self.runtime.with_configuration(configuration);
        self
    }

    pub fn encoders(mut self, encoders: Encoders) -> Self {
        self.runtime = self.runtime.with_encoders(encoders);
        self
    }

    pub fn context_builder(mut self, builder: impl ContextBuilder + 'static) -> Self {
        self.runtime = self.runtime.with_context_builder(Arc::new(builder));
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.runtime = self.runtime.with_clock(clock);
        self
    }

    /// Call after `clock`, which resets the generator.
    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.runtime = self.runtime.with_id_generator(ids);
        self
    }

    pub fn namespace(mut self, namespace: Namespace) -> Self {
        self.namespace = namespace;
        self
    }

    pub fn expect_procedures(mut self, subjects: &[&str]) -> Self {
        self.expected = Some(subjects.iter().map(|s| s.to_string()).collect());
        self
    }

    /// # 検証
    /// - namespace の名前がすべて subject token として正しい
    /// - `expect_procedures` の subject がすべて procedure として存在する
    /// - Queue があれば stream manager と data store が設定されている
    pub fn build(self) -> Result<App, BuildError> {
        let invalid = self.namespace.invalid_names();
        if !invalid.is_empty() {
            return Err(BuildError::InvalidName(invalid));
        }

        if let Some(expected) = &self.expected {
            let declared = self.namespace.subjects();
            let missing: Vec<String> = expected
                .iter()
                .filter(|s| !declared.contains(s))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingProcedures(missing));
            }
        }

        let queues: Vec<String> = self
            .namespace
            .procedures()
            .into_iter()
            .filter(|(_, p)| p.kind() == ProcedureKind::Queue)
            .map(|(subject, _)| subject)
            .collect();
        if !queues.is_empty() {
            if self.runtime.streams().is_none() {
                return Err(BuildError::QueueRequiresStreams(queues));
            }
            if self.runtime.data_store().is_none() {
                return Err(BuildError::QueueRequiresDataStore(queues));
            }
        }

        Ok(App {
            runtime: self.runtime,
            namespace: self.namespace,
        })
    }
}

/// A validated application, ready to start.
#[derive(Debug)]
pub struct App {
    runtime: RuntimeContext,
    namespace: Namespace,
}

impl App {
    pub fn runtime(&self) -> &RuntimeContext {
        &self.runtime
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn manifest(&self) -> Manifest {
        self.namespace.manifest()
    }

    /// Start every procedure. Errors raised later by the loops arrive on
    /// `RunningApp::failures()`.
    pub async fn start(&self) -> Result<RunningApp, RpcError> {
        let (reporter, failures) = FailureReporter::channel();
        let runtime = self.runtime.clone().with_failures(reporter);
        let handles = self.namespace.start(&runtime).await?;
        info!(
            procedures = handles.len(),
            instance_id = %runtime.configuration().instance_id,
            "app started"
        );
        Ok(RunningApp { handles, failures })
    }
}

#[derive(Debug)]
pub struct RunningApp {
    handles: Vec<ProcedureHandle>,
    failures: mpsc::Receiver<ProcedureFailure>,
}

impl RunningApp {
    pub fn subjects(&self) -> Vec<&str> {
        self.handles.iter().map(ProcedureHandle::subject).collect()
    }

    pub fn failures(&mut self) -> &mut mpsc::Receiver<ProcedureFailure> {
        &mut self.failures
    }

    pub async fn next_failure(&mut self) -> Option<ProcedureFailure> {
        self.failures.recv().await
    }

    /// Drain every procedure concurrently.
    pub async fn shutdown(self) {
        let count = self.handles.len();
        join_all(self.handles.into_iter().map(ProcedureHandle::stop)).await;
        info!(procedures = count, "app stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Client, QueryOptions, QueueOptions};
    use crate::domain::{BoxError, Data, ErrorKind};
    use crate::impls::{InMemoryBroker, MemoryDataStore};
    use crate::procedures::ProcedureBuilder;
    use crate::typed::{Request, resolver_fn};
    use serde_json::json;
    use std::time::Duration;

    fn namespace() -> Namespace {
        let p = ProcedureBuilder::new();
        Namespace::new()
            .with(
                "math",
                Namespace::new().with(
                    "double",
                    p.query().resolve(resolver_fn(|req: Request| async move {
                        let n: i64 = req.json()?;
                        Ok::<_, BoxError>(Data::Json(json!(n * 2)))
                    })),
                ),
            )
            .with(
                "jobs",
                Namespace::new().with(
                    "fail",
                    p.queue().resolve(resolver_fn(|_req: Request| async move {
                        Err::<Data, BoxError>("always broken".into())
                    })),
                ),
            )
    }

    #[test]
    fn build_success() {
        let broker = Arc::new(InMemoryBroker::new());
        let app = AppBuilder::new(broker.clone())
            .streams(broker)
            .data_store(Arc::new(MemoryDataStore::new()))
            .namespace(namespace())
            .expect_procedures(&["math.double", "jobs.fail"])
            .build();
        assert!(app.is_ok());
    }

    #[test]
    fn build_missing_procedures() {
        let broker = Arc::new(InMemoryBroker::new());
        let app = AppBuilder::new(broker.clone())
            .streams(broker)
            .data_store(Arc::new(MemoryDataStore::new()))
            .namespace(namespace())
            .expect_procedures(&["math.double", "math.triple", "math"])
            .build();
        assert!(matches!(
            app,
            Err(BuildError::MissingProcedures(missing)) if missing == vec!["math.triple".to_owned(), "math".to_owned()]
        ));
    }

    #[test]
    fn build_rejects_queue_without_dependencies() {
        let broker = Arc::new(InMemoryBroker::new());
        let no_streams = AppBuilder::new(broker.clone()).namespace(namespace()).build();
        assert!(matches!(
            no_streams,
            Err(BuildError::QueueRequiresStreams(q)) if q == vec!["jobs.fail".to_owned()]
        ));

        let no_store = AppBuilder::new(broker.clone())
            .streams(broker)
            .namespace(namespace())
            .build();
        assert!(matches!(no_store, Err(BuildError::QueueRequiresDataStore(_))));
    }

    #[test]
    fn build_rejects_invalid_names() {
        let p = ProcedureBuilder::new();
        let app = AppBuilder::new(Arc::new(InMemoryBroker::new()))
            .namespace(Namespace::new().with("bad name", p.query()))
            .build();
        assert!(matches!(app, Err(BuildError::InvalidName(_))));
    }

    #[tokio::test]
    async fn running_app_serves_and_reports_failures() {
        let broker = Arc::new(InMemoryBroker::new());
        let app = AppBuilder::new(broker.clone())
            .streams(broker.clone())
            .data_store(Arc::new(MemoryDataStore::new()))
            .namespace(namespace())
            .build()
            .unwrap();
        let mut running = app.start().await.unwrap();
        assert_eq!(running.subjects(), vec!["math.double", "jobs.fail"]);

        let client = Client::from_runtime(app.runtime());
        let response = client
            .query("math.double", Data::Json(json!(21)), QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(response.envelope.data, Data::Json(json!(42)));

        client
            .queue("jobs.fail", Data::Json(json!({})), QueueOptions::default())
            .await
            .unwrap();
        let failure = tokio::time::timeout(Duration::from_secs(5), running.next_failure())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failure.subject, "jobs.fail");
        assert_eq!(failure.kind, ProcedureKind::Queue);
        assert_eq!(failure.error.kind(), ErrorKind::InternalError);

        running.shutdown().await;
        assert_eq!(broker.subscriber_count(), 0);
    }
}
