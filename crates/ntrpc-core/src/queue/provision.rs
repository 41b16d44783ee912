//! Provisioning of the durable stream and consumer behind a Queue.
//!
//! Both operations are idempotent. Several processes may start the same
//! Queue at once: losing a creation race (`AlreadyExists`) re-lists and
//! reconciles instead of failing.

use std::time::Duration;

use tracing::debug;

use crate::domain::RpcError;
use crate::ports::{ConsumerConfig, ConsumerInfo, StreamConfig, StreamInfo, StreamManager, TransportError};

/// Make sure stream `name` exists and captures `subject`.
pub async fn ensure_stream(
    streams: &dyn StreamManager,
    name: &str,
    subject: &str,
) -> Result<StreamInfo, RpcError> {
    if let Some(existing) = find_stream(streams, name).await? {
        return add_subject(streams, existing, subject).await;
    }

    let config = StreamConfig {
        name: name.to_owned(),
        subjects: vec![subject.to_owned()],
    };
    match streams.add_stream(config).await {
        Ok(info) => {
            debug!(stream = name, subject, "stream created");
            Ok(info)
        }
        Err(TransportError::AlreadyExists(_)) => {
            debug!(stream = name, "stream created concurrently, reconciling");
            let existing = find_stream(streams, name)
                .await?
                .ok_or_else(|| RpcError::internal(format!("stream '{name}' vanished while provisioning")))?;
            add_subject(streams, existing, subject).await
        }
        Err(error) => Err(provision_error(format!("failed to create stream '{name}'"), error)),
    }
}

/// Make sure durable consumer `name` exists on `stream`.
///
/// An existing consumer is returned as is, whatever its filter.
pub async fn ensure_consumer(
    streams: &dyn StreamManager,
    stream: &str,
    name: &str,
    subject: &str,
    ack_wait: Duration,
) -> Result<ConsumerInfo, RpcError> {
    if let Some(existing) = find_consumer(streams, stream, name).await? {
        return Ok(existing);
    }

    let config = ConsumerConfig::durable(name, subject, ack_wait);
    match streams.add_consumer(stream, config).await {
        Ok(info) => {
            debug!(stream, consumer = name, subject, "consumer created");
            Ok(info)
        }
        Err(TransportError::AlreadyExists(_)) => find_consumer(streams, stream, name)
            .await?
            .ok_or_else(|| RpcError::internal(format!("consumer '{name}' vanished while provisioning"))),
        Err(error) => Err(provision_error(
            format!("failed to create consumer '{name}' on '{stream}'"),
            error,
        )),
    }
}

async fn find_stream(streams: &dyn StreamManager, name: &str) -> Result<Option<StreamInfo>, RpcError> {
    let all = streams
        .list_streams()
        .await
        .map_err(|e| provision_error("failed to list streams".to_owned(), e))?;
    Ok(all.into_iter().find(|s| s.config.name == name))
}

async fn find_consumer(
    streams: &dyn StreamManager,
    stream: &str,
    name: &str,
) -> Result<Option<ConsumerInfo>, RpcError> {
    let all = streams
        .list_consumers(stream)
        .await
        .map_err(|e| provision_error(format!("failed to list consumers of '{stream}'"), e))?;
    Ok(all.into_iter().find(|c| c.name == name))
}

async fn add_subject(
    streams: &dyn StreamManager,
    existing: StreamInfo,
    subject: &str,
) -> Result<StreamInfo, RpcError> {
    if existing.config.subjects.iter().any(|s| s == subject) {
        return Ok(existing);
    }

    let mut config = existing.config;
    config.subjects.push(subject.to_owned());
    let name = config.name.clone();
    let info = streams
        .update_stream(config)
        .await
        .map_err(|e| provision_error(format!("failed to update stream '{name}'"), e))?;
    debug!(stream = %name, subject, "subject added to stream");
    Ok(info)
}

fn provision_error(message: String, cause: TransportError) -> RpcError {
    RpcError::internal(message).with_cause(cause)
}
