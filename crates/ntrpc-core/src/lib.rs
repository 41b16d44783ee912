//! ntrpc-core
//!
//! subject ベースの RPC / ワーカー基盤。
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（envelope, data, context, errors, subject, decision）
//! - **ports**: 抽象化レイヤー（Transport, StreamManager, DataStore, Clock, IdGenerator）
//! - **codec**: payload encoder と envelope ヘッダの対応
//! - **config**: 環境変数からの設定
//! - **typed**: 型付き resolver / input validator
//! - **procedures**: Query / Dispatch / Queue
//! - **queue**: ジョブ状態、リトライ、stream / consumer の用意
//! - **namespace**: procedure をツリーで登録し subject を決める
//! - **app**: builder, runtime, middleware, worker_loop
//! - **client**: 呼び出し側 API
//! - **impls**: 開発用 in-memory 実装
//! - **observability**: tracing の初期化

pub mod app;
pub mod client;
pub mod codec;
pub mod config;
pub mod domain;
pub mod impls;
pub mod namespace;
pub mod observability;
pub mod ports;
pub mod procedures;
pub mod queue;
pub mod typed;

#[cfg(test)]
mod test_support;

pub use app::{App, AppBuilder, BuildError, Middleware, RunningApp, middleware_fn};
pub use client::{Client, DispatchOptions, QueryOptions, QueueOptions, Response};
pub use config::Configuration;
pub use domain::{BoxError, Context, Data, Envelope, ErrorKind, RpcError};
pub use namespace::{Manifest, Namespace};
pub use procedures::{Procedure, ProcedureBuilder, ProcedureKind, QueueConfig};
