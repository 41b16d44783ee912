//! Ports - 外部システムの抽象化レイヤー
//!
//! transport / durable stream / data store / 時刻 / ID 生成はすべて trait で受け取る。
//! in-memory 実装は `crate::impls` にある。

pub mod clock;
pub mod data_store;
pub mod id_generator;
pub mod streams;
pub mod transport;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::data_store::{DataStore, StoreError};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::streams::{
    AckPolicy, Acker, ConsumeOptions, ConsumerConfig, ConsumerInfo, Delivery, DeliveryInfo,
    DeliveryStream, StreamConfig, StreamInfo, StreamManager,
};
pub use self::transport::{
    Headers, Message, SubscribeOptions, Subscription, Transport, TransportError,
};
