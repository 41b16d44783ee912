use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::time::{Duration, sleep};
use tracing::info;

use ntrpc_core::impls::{InMemoryBroker, MemoryDataStore};
use ntrpc_core::observability::init_tracing;
use ntrpc_core::ports::DataStore;
use ntrpc_core::queue::JobStatus;
use ntrpc_core::queue::record::status_key;
use ntrpc_core::typed::{Handler, handler_fn, schema};
use ntrpc_core::{
    AppBuilder, BoxError, Client, Context, Namespace, ProcedureBuilder, QueueConfig,
};

#[derive(Debug, Serialize, Deserialize)]
struct AddInput {
    a: i64,
    b: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct AddOutput {
    sum: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct AuditEvent {
    action: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct EmailJob {
    to: String,
}

struct EmailHandler {
    remaining_failures: AtomicU32,
}

impl EmailHandler {
    fn new(n: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(n),
        }
    }
}

#[async_trait]
impl Handler<EmailJob> for EmailHandler {
    type Output = ();

    async fn handle(&self, _ctx: Context, job: EmailJob) -> Result<(), BoxError> {
        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(format!("intentional failure (left={left})").into());
        }
        println!("email sent to {}", job.to);
        Ok(())
    }
}

fn namespace() -> Namespace {
    let p = ProcedureBuilder::new();
    Namespace::new()
        .with(
            "math",
            Namespace::new().with(
                "add",
                p.query()
                    .input(schema::<AddInput>())
                    .handler(handler_fn(|_ctx: Context, input: AddInput| async move {
                        Ok::<_, BoxError>(AddOutput { sum: input.a + input.b })
                    })),
            ),
        )
        .with(
            "audit",
            Namespace::new().with(
                "record",
                p.dispatch()
                    .handler(handler_fn(|_ctx: Context, event: AuditEvent| async move {
                        println!("audit: {}", event.action);
                        Ok::<_, BoxError>(())
                    })),
            ),
        )
        .with(
            "jobs",
            Namespace::new().with(
                "email",
                p.queue()
                    .config(QueueConfig {
                        retry_delay: Some(Duration::from_millis(100)),
                        execution_retry: Some(2),
                        ..QueueConfig::default()
                    })
                    .handler(EmailHandler::new(1)),
            ),
        )
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    init_tracing();

    // (A) broker と store を用意
    let broker = Arc::new(InMemoryBroker::new());
    let store = Arc::new(MemoryDataStore::new());

    // (B) app を組み立てて起動
    let app = AppBuilder::new(broker.clone())
        .streams(broker.clone())
        .data_store(store.clone())
        .namespace(namespace())
        .expect_procedures(&["math.add", "audit.record", "jobs.email"])
        .build()?;
    let mut running = app.start().await?;
    info!(subjects = ?running.subjects(), "procedures ready");

    // (C) client から 3 種類を呼ぶ
    let client = Client::from_runtime(app.runtime()).with_manifest(app.manifest());

    let out: AddOutput = client
        .query_json("math.add", &serde_json::json!({ "a": 2, "b": 40 }))
        .await?;
    println!("math.add -> {}", out.sum);

    client
        .dispatch_json("audit.record", &AuditEvent { action: "login".into() })
        .await?;

    let id = client
        .queue_json("jobs.email", &EmailJob { to: "ops@example.com".into() })
        .await?;
    println!("queued job: {id}");

    // (D) job:<id> が EXECUTED になるまでポーリング (途中の失敗は failures に届く)
    let key = status_key(&id);
    loop {
        tokio::select! {
            Some(failure) = running.next_failure() => {
                println!("failure on {}: {}", failure.subject, failure.error);
            }
            _ = sleep(Duration::from_millis(50)) => {
                let status = store.get(&key).await?;
                if status.as_deref() == Some(JobStatus::Executed.as_str()) {
                    println!("final status: {key}={}", JobStatus::Executed);
                    break;
                }
            }
        }
    }

    // (E) 全 procedure を止める
    running.shutdown().await;
    Ok(())
}
