//! Transport port - core publish/subscribe with request/reply.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

/// Message headers. Keys are case sensitive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(BTreeMap<String, String>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Copy every entry of `other` over `self`.
    pub fn extend(&mut self, other: &Headers) {
        for (k, v) in other.iter() {
            self.insert(k, v);
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// A transport message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub subject: String,
    /// Reply address for request/reply.
    pub reply: Option<String>,
    pub headers: Headers,
    pub payload: Bytes,
}

impl Message {
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            reply: None,
            headers: Headers::new(),
            payload: payload.into(),
        }
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.reply = Some(reply.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Queue group. Members of a group share the subject's messages.
    pub queue: Option<String>,
}

impl SubscribeOptions {
    pub fn queue_group(name: impl Into<String>) -> Self {
        Self {
            queue: Some(name.into()),
        }
    }
}

/// Stream of messages for one subscription.
///
/// Dropping it (or calling `close`) unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    subject: String,
    receiver: mpsc::UnboundedReceiver<Message>,
}

impl Subscription {
    pub fn new(subject: impl Into<String>, receiver: mpsc::UnboundedReceiver<Message>) -> Self {
        Self {
            subject: subject.into(),
            receiver,
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Next message, `None` once the subscription is closed. Cancel safe.
    pub async fn next(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }

    /// Next message if one is already buffered.
    pub fn try_next(&mut self) -> Option<Message> {
        self.receiver.try_recv().ok()
    }

    pub fn close(&mut self) {
        self.receiver.close();
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,

    #[error("request to '{0}' timed out")]
    Timeout(String),

    #[error("no responders for '{0}'")]
    NoResponders(String),

    #[error("'{0}' already exists")]
    AlreadyExists(String),

    #[error("'{0}' not found")]
    NotFound(String),

    #[error("transport error: {0}")]
    Backend(String),
}

/// Core pub/sub transport shared by every procedure loop.
///
/// Implementations must allow concurrent use from many tasks.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn subscribe(
        &self,
        subject: &str,
        options: SubscribeOptions,
    ) -> Result<Subscription, TransportError>;

    /// Publish one message. `message.reply` is forwarded as is.
    async fn publish(&self, message: Message) -> Result<(), TransportError>;

    /// Publish and wait for the first reply. Any reply address already set on
    /// `message` is replaced.
    async fn request(&self, message: Message, timeout: Duration) -> Result<Message, TransportError>;
}

impl From<TransportError> for crate::domain::RpcError {
    fn from(error: TransportError) -> Self {
        crate::domain::RpcError::internal("transport operation failed").with_cause(error)
    }
}
