//! Receive loop - 1 procedure = 1 tokio task
//!
//! # フロー
//! 1. shutdown が要求されていれば終了
//! 2. 次のメッセージを待つ (shutdown 通知と biased select、shutdown 優先)
//! 3. handler を最後まで実行 (返信 publish / ストア書き込みを含む)
//! 4. Err は failure channel に流し、ループは継続
//!
//! `stop()` は実行中のメッセージを中断しない (drain)。

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::runtime::{FailureReporter, ProcedureFailure};
use crate::domain::RpcError;
use crate::ports::{Delivery, DeliveryStream, Message, Subscription};
use crate::procedures::ProcedureKind;

/// Where a loop takes its messages from.
#[async_trait]
pub trait MessageSource: Send + 'static {
    type Item: Send + 'static;

    /// Must be cancel safe.
    async fn next_item(&mut self) -> Option<Self::Item>;

    async fn close(&mut self);
}

#[async_trait]
impl MessageSource for Subscription {
    type Item = Message;

    async fn next_item(&mut self) -> Option<Message> {
        self.next().await
    }

    async fn close(&mut self) {
        Subscription::close(self);
    }
}

#[async_trait]
impl MessageSource for Box<dyn DeliveryStream> {
    type Item = Delivery;

    async fn next_item(&mut self) -> Option<Delivery> {
        self.next().await
    }

    async fn close(&mut self) {
        DeliveryStream::close(self.as_mut()).await;
    }
}

/// Handles one item to completion.
#[async_trait]
pub trait MessageHandler<T>: Send + Sync + 'static {
    async fn handle(&self, item: T) -> Result<(), RpcError>;
}

/// Running procedure.
/// - `stop()` で drain してから task の終了を待つ
/// - handle を drop しても loop は止まる
#[derive(Debug)]
pub struct ProcedureHandle {
    subject: String,
    kind: ProcedureKind,
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ProcedureHandle {
    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn kind(&self) -> ProcedureKind {
        self.kind
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Request shutdown without waiting.
    pub fn request_stop(&self) {
        // ignore send error: the loop may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    /// Finish the in-flight message, take no new ones, then join.
    pub async fn stop(self) {
        self.request_stop();
        if let Err(e) = self.join.await {
            error!(subject = %self.subject, kind = %self.kind, error = %e, "procedure loop panicked");
        }
    }
}

pub fn spawn_loop<S, H>(
    subject: &str,
    kind: ProcedureKind,
    source: S,
    handler: Arc<H>,
    failures: FailureReporter,
) -> ProcedureHandle
where
    S: MessageSource,
    H: MessageHandler<S::Item>,
{
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let loop_subject = subject.to_owned();
    let join = tokio::spawn(async move {
        receive_loop(loop_subject, kind, source, handler, failures, shutdown_rx).await;
    });

    ProcedureHandle {
        subject: subject.to_owned(),
        kind,
        shutdown_tx,
        join,
    }
}

async fn receive_loop<S, H>(
    subject: String,
    kind: ProcedureKind,
    mut source: S,
    handler: Arc<H>,
    failures: FailureReporter,
    mut shutdown_rx: watch::Receiver<bool>,
) where
    S: MessageSource,
    H: MessageHandler<S::Item>,
{
    info!(subject = %subject, kind = %kind, "procedure started");

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let item = tokio::select! {
            // shutdown wins over a ready item
            biased;
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    // handle dropped
                    break;
                }
                continue;
            }
            item = source.next_item() => item,
        };

        let Some(item) = item else {
            debug!(subject = %subject, "message source closed");
            break;
        };
        if *shutdown_rx.borrow() {
            // unsettled deliveries are redelivered after ack_wait
            debug!(subject = %subject, "stop requested, leaving item unhandled");
            break;
        }

        if let Err(error) = handler.handle(item).await {
            failures.report(ProcedureFailure {
                subject: subject.clone(),
                kind,
                error,
            });
        }
    }

    source.close().await;
    info!(subject = %subject, kind = %kind, "procedure stopped");
}
