//! Procedures - subject に紐づく 3 種類の処理単位
//!
//! # 学習ポイント
//! - `Procedure` は tagged union。`match` で kind ごとの start に振り分ける
//! - builder メソッドは `self` を消費して新しい値を返す (元の値は変わらない)
//! - 同じ `ProcedureBuilder` から作った procedure は同じ middleware を共有する
//!
//! # 使用例
//! ```ignore
//! let procedures = ProcedureBuilder::new().middleware(auth);
//! let add = procedures.query().input(schema::<AddInput>()).handler(AddHandler);
//! ```

pub mod dispatch;
pub mod query;
pub mod queue;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use dispatch::Dispatch;
pub use query::Query;
pub use queue::{Queue, QueueConfig, QueueSettings};

use crate::app::middleware::{Middleware, Pipeline};
use crate::app::runtime::RuntimeContext;
use crate::app::worker_loop::ProcedureHandle;
use crate::domain::RpcError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcedureKind {
    Query,
    Dispatch,
    Queue,
}

impl ProcedureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcedureKind::Query => "query",
            ProcedureKind::Dispatch => "dispatch",
            ProcedureKind::Queue => "queue",
        }
    }
}

impl fmt::Display for ProcedureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone)]
pub enum Procedure {
    Query(Query),
    Dispatch(Dispatch),
    Queue(Queue),
}

impl Procedure {
    pub fn kind(&self) -> ProcedureKind {
        match self {
            Procedure::Query(_) => ProcedureKind::Query,
            Procedure::Dispatch(_) => ProcedureKind::Dispatch,
            Procedure::Queue(_) => ProcedureKind::Queue,
        }
    }

    pub fn has_input_schema(&self) -> bool {
        match self {
            Procedure::Query(q) => q.has_input_schema(),
            Procedure::Dispatch(d) => d.has_input_schema(),
            Procedure::Queue(q) => q.has_input_schema(),
        }
    }

    /// Only Query replies.
    pub fn response_encoding(&self) -> Option<&str> {
        match self {
            Procedure::Query(q) => Some(q.encoding()),
            Procedure::Dispatch(_) | Procedure::Queue(_) => None,
        }
    }

    pub async fn start(&self, runtime: &RuntimeContext, subject: &str) -> Result<ProcedureHandle, RpcError> {
        match self {
            Procedure::Query(q) => q.start(runtime, subject).await,
            Procedure::Dispatch(d) => d.start(runtime, subject).await,
            Procedure::Queue(q) => q.start(runtime, subject).await,
        }
    }
}

impl fmt::Debug for Procedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Procedure")
            .field("kind", &self.kind())
            .field("has_input_schema", &self.has_input_schema())
            .finish_non_exhaustive()
    }
}

impl From<Query> for Procedure {
    fn from(query: Query) -> Self {
        Procedure::Query(query)
    }
}

impl From<Dispatch> for Procedure {
    fn from(dispatch: Dispatch) -> Self {
        Procedure::Dispatch(dispatch)
    }
}

impl From<Queue> for Procedure {
    fn from(queue: Queue) -> Self {
        Procedure::Queue(queue)
    }
}

/// Entry point for declaring procedures that share a middleware pipeline.
#[derive(Debug, Clone, Default)]
pub struct ProcedureBuilder {
    pipeline: Pipeline,
}

impl ProcedureBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// New builder with `middleware` appended. `self` is unchanged.
    pub fn middleware(&self, middleware: impl Middleware + 'static) -> Self {
        Self {
            pipeline: self.pipeline.with(middleware),
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn query(&self) -> Query {
        Query::new(self.pipeline.clone())
    }

    pub fn dispatch(&self) -> Dispatch {
        Dispatch::new(self.pipeline.clone())
    }

    pub fn queue(&self) -> Queue {
        Queue::new(self.pipeline.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::middleware::{Next, NextOutput};
    use crate::codec::{BINARY, JSON};
    use crate::domain::{BoxError, Context};
    use crate::typed::schema;
    use async_trait::async_trait;
    use rstest::rstest;

    struct Noop;

    #[async_trait]
    impl Middleware for Noop {
        async fn handle(&self, _ctx: Context, next: Next<'_>) -> Result<NextOutput, BoxError> {
            next.run(None).await
        }
    }

    #[rstest]
    #[case::query(ProcedureKind::Query, "\"query\"")]
    #[case::dispatch(ProcedureKind::Dispatch, "\"dispatch\"")]
    #[case::queue(ProcedureKind::Queue, "\"queue\"")]
    fn kind_serialises_lowercase(#[case] kind: ProcedureKind, #[case] json: &str) {
        assert_eq!(serde_json::to_string(&kind).unwrap(), json);
        assert_eq!(kind.to_string(), json.trim_matches('"'));
    }

    #[test]
    fn builder_middleware_does_not_leak_into_the_parent() {
        let base = ProcedureBuilder::new();
        let guarded = base.middleware(Noop);
        assert!(base.pipeline().is_empty());
        assert_eq!(guarded.pipeline().len(), 1);
        assert_eq!(guarded.middleware(Noop).pipeline().len(), 2);
    }

    #[test]
    fn procedure_describes_itself() {
        let procedures = ProcedureBuilder::new();

        let q: Procedure = procedures.query().response_encoding(BINARY).into();
        assert_eq!(q.kind(), ProcedureKind::Query);
        assert_eq!(q.response_encoding(), Some(BINARY));
        assert!(!q.has_input_schema());

        let d: Procedure = procedures.dispatch().input(schema::<serde_json::Value>()).into();
        assert_eq!(d.kind(), ProcedureKind::Dispatch);
        assert_eq!(d.response_encoding(), None);
        assert!(d.has_input_schema());

        let plain: Procedure = procedures.query().into();
        assert_eq!(plain.response_encoding(), Some(JSON));
        let job: Procedure = procedures.queue().into();
        assert_eq!(job.kind(), ProcedureKind::Queue);
    }
}
