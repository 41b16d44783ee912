//! App - アプリケーション層
//!
//! ports と procedures を組み合わせて実行する。
//!
//! # 主要コンポーネント
//! - **AppBuilder / App / RunningApp**: 構築、起動時検証、停止
//! - **RuntimeContext**: 全 procedure が共有する依存
//! - **Pipeline**: middleware の連鎖と resolver 呼び出し
//! - **worker_loop**: 1 procedure = 1 task の受信ループ

pub mod builder;
pub mod middleware;
pub mod runtime;
pub mod worker_loop;

pub use self::builder::{App, AppBuilder, BuildError, RunningApp};
pub use self::middleware::{FnMiddleware, Middleware, Next, NextOutput, Pipeline, middleware_fn};
pub use self::runtime::{
    ContextBuilder, EmptyContext, FailureReporter, FnContext, ProcedureFailure, RuntimeContext,
    context_fn,
};
pub use self::worker_loop::{MessageHandler, MessageSource, ProcedureHandle};
