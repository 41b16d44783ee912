//! InMemoryBroker - 開発・テスト用の broker
//!
//! # 学習ポイント
//! - core pub/sub: subject の wildcard マッチと queue group の round robin
//! - request/reply: `_INBOX.<ulid>` を一時 subscribe して最初の返信を待つ
//! - durable stream: publish 時に stream へ記録し、consumer ごとのキューに積む
//! - consumer: ack_wait を過ぎた未 ack の配送は再配送、`nak(delay)` は遅延再配送
//!
//! Mutex は同期処理の間だけ保持し、await を跨がない。

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;
use tracing::{debug, trace};
use ulid::Ulid;

use crate::domain::subject::matches;
use crate::ports::{
    AckPolicy, Acker, ConsumeOptions, ConsumerConfig, ConsumerInfo, Delivery, DeliveryInfo,
    DeliveryStream, Message, StreamConfig, StreamInfo, StreamManager, SubscribeOptions,
    Subscription, Transport, TransportError,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // poisoned でもデータ構造は壊れていない
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Transport and stream manager in one process.
///
/// # 使用例
/// ```ignore
/// let broker = Arc::new(InMemoryBroker::new());
/// let runtime = RuntimeContext::new(broker.clone()).with_streams(broker.clone());
/// ```
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

#[derive(Default)]
struct BrokerState {
    subscribers: Vec<Subscriber>,
    /// (pattern, queue group) -> next member
    round_robin: HashMap<(String, String), usize>,
    streams: BTreeMap<String, StreamState>,
}

struct Subscriber {
    pattern: String,
    queue: Option<String>,
    sender: mpsc::UnboundedSender<Message>,
}

/// `log` keeps only what some consumer may still need. Without consumers
/// everything is kept so a later consumer can start from the beginning.
struct StreamState {
    config: StreamConfig,
    log: BTreeMap<u64, Message>,
    last_seq: u64,
    consumers: BTreeMap<String, Arc<ConsumerQueue>>,
}

impl StreamState {
    fn captures(&self, subject: &str) -> bool {
        self.config.subjects.iter().any(|p| matches(p, subject))
    }

    fn info(&self) -> StreamInfo {
        StreamInfo {
            config: self.config.clone(),
            messages: self.log.len() as u64,
        }
    }

    /// Drop messages every consumer has settled.
    fn prune(&mut self) {
        let next = self.last_seq + 1;
        let Some(floor) = self
            .consumers
            .values()
            .map(|c| c.oldest_pending().unwrap_or(next))
            .min()
        else {
            return;
        };
        self.log = self.log.split_off(&floor);
    }

    fn append(&mut self, message: &Message) {
        self.prune();
        self.last_seq += 1;
        let seq = self.last_seq;
        self.log.insert(seq, message.clone());
        for consumer in self.consumers.values() {
            consumer.offer(seq, message);
        }
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live core subscriptions, for tests and diagnostics.
    pub fn subscriber_count(&self) -> usize {
        let mut state = lock(&self.state);
        state.subscribers.retain(|s| !s.sender.is_closed());
        state.subscribers.len()
    }
}

/// Append to every stream capturing the subject.
fn capture(state: &mut BrokerState, message: &Message) {
    for stream in state.streams.values_mut() {
        if stream.captures(&message.subject) {
            stream.append(message);
        }
    }
}

/// Fan out to core subscribers. Returns how many received the message.
fn route(state: &mut BrokerState, message: &Message) -> usize {
    state.subscribers.retain(|s| !s.sender.is_closed());

    let mut delivered = 0;
    let mut groups: BTreeMap<(String, String), Vec<usize>> = BTreeMap::new();
    for (index, sub) in state.subscribers.iter().enumerate() {
        if !matches(&sub.pattern, &message.subject) {
            continue;
        }
        match &sub.queue {
            None => {
                if sub.sender.send(message.clone()).is_ok() {
                    delivered += 1;
                }
            }
            Some(queue) => groups
                .entry((sub.pattern.clone(), queue.clone()))
                .or_default()
                .push(index),
        }
    }

    for (key, members) in groups {
        let turn = state.round_robin.entry(key).or_insert(0);
        let pick = members[*turn % members.len()];
        *turn = turn.wrapping_add(1);
        if state.subscribers[pick].sender.send(message.clone()).is_ok() {
            delivered += 1;
        }
    }
    delivered
}

#[async_trait]
impl Transport for InMemoryBroker {
    async fn subscribe(
        &self,
        subject: &str,
        options: SubscribeOptions,
    ) -> Result<Subscription, TransportError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        lock(&self.state).subscribers.push(Subscriber {
            pattern: subject.to_owned(),
            queue: options.queue,
            sender,
        });
        debug!(subject, "subscribed");
        Ok(Subscription::new(subject, receiver))
    }

    async fn publish(&self, message: Message) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        capture(&mut state, &message);
        let receivers = route(&mut state, &message);
        trace!(subject = %message.subject, receivers, "published");
        Ok(())
    }

    async fn request(&self, mut message: Message, timeout: Duration) -> Result<Message, TransportError> {
        let subject = message.subject.clone();
        let inbox = format!("_INBOX.{}", Ulid::new());
        let (sender, mut receiver) = mpsc::unbounded_channel();
        message.reply = Some(inbox.clone());

        {
            let mut state = lock(&self.state);
            state.subscribers.push(Subscriber {
                pattern: inbox,
                queue: None,
                sender,
            });
            capture(&mut state, &message);
            if route(&mut state, &message) == 0 {
                return Err(TransportError::NoResponders(subject));
            }
        }

        match tokio::time::timeout(timeout, receiver.recv()).await {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::Timeout(subject)),
        }
    }
}

#[async_trait]
impl StreamManager for InMemoryBroker {
    async fn list_streams(&self) -> Result<Vec<StreamInfo>, TransportError> {
        let mut state = lock(&self.state);
        Ok(state
            .streams
            .values_mut()
            .map(|stream| {
                stream.prune();
                stream.info()
            })
            .collect())
    }

    async fn add_stream(&self, config: StreamConfig) -> Result<StreamInfo, TransportError> {
        let mut state = lock(&self.state);
        if state.streams.contains_key(&config.name) {
            return Err(TransportError::AlreadyExists(config.name));
        }
        let stream = StreamState {
            config: config.clone(),
            log: BTreeMap::new(),
            last_seq: 0,
            consumers: BTreeMap::new(),
        };
        let info = stream.info();
        state.streams.insert(config.name, stream);
        Ok(info)
    }

    async fn update_stream(&self, config: StreamConfig) -> Result<StreamInfo, TransportError> {
        let mut state = lock(&self.state);
        let stream = state
            .streams
            .get_mut(&config.name)
            .ok_or_else(|| TransportError::NotFound(config.name.clone()))?;
        stream.config = config;
        Ok(stream.info())
    }

    async fn list_consumers(&self, stream: &str) -> Result<Vec<ConsumerInfo>, TransportError> {
        let state = lock(&self.state);
        let stream = state
            .streams
            .get(stream)
            .ok_or_else(|| TransportError::NotFound(stream.to_owned()))?;
        Ok(stream.consumers.values().map(|c| c.info()).collect())
    }

    /// The new consumer starts from the oldest retained message.
    async fn add_consumer(
        &self,
        stream: &str,
        config: ConsumerConfig,
    ) -> Result<ConsumerInfo, TransportError> {
        let mut state = lock(&self.state);
        let entry = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| TransportError::NotFound(stream.to_owned()))?;
        if entry.consumers.contains_key(&config.name) {
            return Err(TransportError::AlreadyExists(config.name));
        }

        let name = config.name.clone();
        let queue = Arc::new(ConsumerQueue::new(stream, config));
        for (seq, message) in &entry.log {
            queue.offer(*seq, message);
        }
        let info = queue.info();
        entry.consumers.insert(name, queue);
        Ok(info)
    }

    async fn consume(
        &self,
        stream: &str,
        consumer: &str,
        _options: ConsumeOptions,
    ) -> Result<Box<dyn DeliveryStream>, TransportError> {
        let state = lock(&self.state);
        let queue = state
            .streams
            .get(stream)
            .ok_or_else(|| TransportError::NotFound(stream.to_owned()))?
            .consumers
            .get(consumer)
            .cloned()
            .ok_or_else(|| TransportError::NotFound(consumer.to_owned()))?;
        Ok(Box::new(BrokerDeliveries {
            queue,
            closed: false,
        }))
    }
}

/// Per-consumer delivery state.
///
/// - `ready`: deliverable now, in stream order
/// - `delayed`: nak'ed with a delay
/// - `in_flight`: handed out, waiting for ack until the deadline
struct ConsumerQueue {
    stream: String,
    config: ConsumerConfig,
    state: Mutex<ConsumerState>,
    notify: Notify,
}

#[derive(Default)]
struct ConsumerState {
    entries: HashMap<u64, Entry>,
    ready: VecDeque<u64>,
    delayed: BTreeSet<(Instant, u64)>,
    in_flight: BTreeMap<u64, InFlight>,
}

struct Entry {
    message: Message,
    delivered: u32,
}

struct InFlight {
    deadline: Instant,
    delivered: u32,
}

enum Polled {
    Ready(Delivery),
    /// Nothing ready. `Some` is the next instant something may become ready.
    Wait(Option<Instant>),
}

enum Settle {
    Ack,
    Nak(Option<Duration>),
    Term,
}

impl ConsumerState {
    fn promote(&mut self, now: Instant) {
        while let Some(&(at, seq)) = self.delayed.first() {
            if at > now {
                break;
            }
            self.delayed.pop_first();
            self.ready.push_back(seq);
        }

        let expired: Vec<u64> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.deadline <= now)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in expired {
            self.in_flight.remove(&seq);
            self.ready.push_back(seq);
        }
    }

    fn next_wake(&self) -> Option<Instant> {
        let delayed = self.delayed.first().map(|(at, _)| *at);
        let deadline = self.in_flight.values().map(|f| f.deadline).min();
        match (delayed, deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

impl ConsumerQueue {
    fn new(stream: &str, config: ConsumerConfig) -> Self {
        Self {
            stream: stream.to_owned(),
            config,
            state: Mutex::new(ConsumerState::default()),
            notify: Notify::new(),
        }
    }

    fn accepts(&self, subject: &str) -> bool {
        self.config
            .filter_subject
            .as_deref()
            .is_none_or(|filter| matches(filter, subject))
    }

    fn offer(&self, seq: u64, message: &Message) {
        if !self.accepts(&message.subject) {
            return;
        }
        {
            let mut state = lock(&self.state);
            state.entries.insert(
                seq,
                Entry {
                    message: message.clone(),
                    delivered: 0,
                },
            );
            state.ready.push_back(seq);
        }
        self.notify.notify_waiters();
    }

    /// Lowest sequence not yet acked or termed.
    fn oldest_pending(&self) -> Option<u64> {
        lock(&self.state).entries.keys().min().copied()
    }

    fn info(&self) -> ConsumerInfo {
        let state = lock(&self.state);
        ConsumerInfo {
            stream: self.stream.clone(),
            name: self.config.name.clone(),
            config: self.config.clone(),
            num_pending: (state.ready.len() + state.delayed.len()) as u64,
        }
    }

    fn poll(self: &Arc<Self>, now: Instant) -> Polled {
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        state.promote(now);

        while let Some(seq) = state.ready.pop_front() {
            let Some(entry) = state.entries.get_mut(&seq) else {
                continue;
            };
            entry.delivered += 1;
            let delivered = entry.delivered;
            let message = entry.message.clone();

            match self.config.ack_policy {
                AckPolicy::Explicit => {
                    state.in_flight.insert(
                        seq,
                        InFlight {
                            deadline: now + self.config.ack_wait,
                            delivered,
                        },
                    );
                }
                AckPolicy::None => {
                    state.entries.remove(&seq);
                }
            }

            let info = DeliveryInfo {
                stream: self.stream.clone(),
                consumer: self.config.name.clone(),
                stream_sequence: seq,
                delivered,
            };
            let acker = Arc::new(BrokerAcker {
                queue: Arc::clone(self),
                seq,
                delivered,
            });
            return Polled::Ready(Delivery::new(message, info, acker));
        }

        Polled::Wait(state.next_wake())
    }

    /// Acks for a superseded delivery and repeated acks are ignored.
    fn settle(&self, seq: u64, delivered: u32, settle: Settle) {
        {
            let mut guard = lock(&self.state);
            let state = &mut *guard;
            match state.in_flight.get(&seq) {
                Some(flight) if flight.delivered == delivered => {}
                _ => return,
            }
            state.in_flight.remove(&seq);

            match settle {
                Settle::Ack | Settle::Term => {
                    state.entries.remove(&seq);
                }
                Settle::Nak(Some(delay)) if !delay.is_zero() => {
                    state.delayed.insert((Instant::now() + delay, seq));
                }
                Settle::Nak(_) => state.ready.push_back(seq),
            }
        }
        self.notify.notify_waiters();
    }
}

struct BrokerAcker {
    queue: Arc<ConsumerQueue>,
    seq: u64,
    delivered: u32,
}

#[async_trait]
impl Acker for BrokerAcker {
    async fn ack(&self) -> Result<(), TransportError> {
        self.queue.settle(self.seq, self.delivered, Settle::Ack);
        Ok(())
    }

    async fn nak(&self, delay: Option<Duration>) -> Result<(), TransportError> {
        self.queue.settle(self.seq, self.delivered, Settle::Nak(delay));
        Ok(())
    }

    async fn term(&self, reason: &str) -> Result<(), TransportError> {
        debug!(stream = %self.queue.stream, seq = self.seq, reason, "delivery terminated");
        self.queue.settle(self.seq, self.delivered, Settle::Term);
        Ok(())
    }
}

struct BrokerDeliveries {
    queue: Arc<ConsumerQueue>,
    closed: bool,
}

#[async_trait]
impl DeliveryStream for BrokerDeliveries {
    async fn next(&mut self) -> Option<Delivery> {
        loop {
            if self.closed {
                return None;
            }

            // register before polling so a concurrent offer is not missed
            let notified = self.queue.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.queue.poll(Instant::now()) {
                Polled::Ready(delivery) => return Some(delivery),
                Polled::Wait(Some(at)) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                Polled::Wait(None) => notified.await,
            }
        }
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}
