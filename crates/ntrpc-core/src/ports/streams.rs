//! Durable stream port - streams, durable consumers and ack-capable deliveries.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::transport::{Message, TransportError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub name: String,
    /// Subjects captured by the stream. Wildcards allowed.
    pub subjects: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub config: StreamConfig,
    /// Messages still retained by the stream.
    pub messages: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AckPolicy {
    #[default]
    Explicit,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    pub name: String,
    pub durable_name: Option<String>,
    pub filter_subject: Option<String>,
    pub ack_policy: AckPolicy,
    /// Redelivery deadline for an unacknowledged delivery.
    pub ack_wait: Duration,
}

impl ConsumerConfig {
    /// Durable explicit-ack consumer filtered to `subject`.
    pub fn durable(name: impl Into<String>, subject: impl Into<String>, ack_wait: Duration) -> Self {
        let name = name.into();
        Self {
            durable_name: Some(name.clone()),
            name,
            filter_subject: Some(subject.into()),
            ack_policy: AckPolicy::Explicit,
            ack_wait,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerInfo {
    pub stream: String,
    pub name: String,
    pub config: ConsumerConfig,
    /// Messages waiting for delivery.
    pub num_pending: u64,
}

/// Options forwarded to `StreamManager::consume`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Upper bound of deliveries buffered client side.
    pub max_messages: Option<usize>,
    /// Idle time after which the backend may send a heartbeat.
    pub idle_heartbeat: Option<Duration>,
}

/// Acknowledgement operations for one delivery.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<(), TransportError>;

    /// Request redelivery, no earlier than `delay` when given.
    async fn nak(&self, delay: Option<Duration>) -> Result<(), TransportError>;

    /// Never redeliver.
    async fn term(&self, reason: &str) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryInfo {
    pub stream: String,
    pub consumer: String,
    pub stream_sequence: u64,
    /// Delivery count for this message, starting at 1.
    pub delivered: u32,
}

/// A message handed out by a durable consumer.
#[derive(Clone)]
pub struct Delivery {
    pub message: Message,
    pub info: DeliveryInfo,
    acker: Arc<dyn Acker>,
}

impl Delivery {
    pub fn new(message: Message, info: DeliveryInfo, acker: Arc<dyn Acker>) -> Self {
        Self {
            message,
            info,
            acker,
        }
    }

    pub fn acker(&self) -> Arc<dyn Acker> {
        Arc::clone(&self.acker)
    }

    pub async fn ack(&self) -> Result<(), TransportError> {
        self.acker.ack().await
    }

    pub async fn nak(&self, delay: Option<Duration>) -> Result<(), TransportError> {
        self.acker.nak(delay).await
    }

    pub async fn term(&self, reason: &str) -> Result<(), TransportError> {
        self.acker.term(reason).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

/// Pull side of a durable consumer.
#[async_trait]
pub trait DeliveryStream: Send {
    /// Next delivery, `None` once closed. Must be cancel safe.
    async fn next(&mut self) -> Option<Delivery>;

    /// Stop receiving. The durable consumer itself is kept.
    async fn close(&mut self);
}

/// Stream and consumer administration plus consumption.
#[async_trait]
pub trait StreamManager: Send + Sync {
    async fn list_streams(&self) -> Result<Vec<StreamInfo>, TransportError>;

    /// Fails with `TransportError::AlreadyExists` when the name is taken.
    async fn add_stream(&self, config: StreamConfig) -> Result<StreamInfo, TransportError>;

    async fn update_stream(&self, config: StreamConfig) -> Result<StreamInfo, TransportError>;

    async fn list_consumers(&self, stream: &str) -> Result<Vec<ConsumerInfo>, TransportError>;

    /// Fails with `TransportError::AlreadyExists` when the name is taken.
    async fn add_consumer(
        &self,
        stream: &str,
        config: ConsumerConfig,
    ) -> Result<ConsumerInfo, TransportError>;

    async fn consume(
        &self,
        stream: &str,
        consumer: &str,
        options: ConsumeOptions,
    ) -> Result<Box<dyn DeliveryStream>, TransportError>;
}
