//! Impls - ports の in-memory 実装
//!
//! # 含まれる実装
//! - **InMemoryBroker**: Transport + StreamManager
//! - **MemoryDataStore**: DataStore
//!
//! 本番用の adapter (実 broker / 永続ストア) は別クレートで ports を実装する。

pub mod inmem_broker;
pub mod inmem_store;

pub use self::inmem_broker::InMemoryBroker;
pub use self::inmem_store::MemoryDataStore;
