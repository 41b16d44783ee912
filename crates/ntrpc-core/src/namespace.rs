//! Namespace - procedure tree addressed by dotted subjects.
//!
//! Entries keep declaration order, so `subjects()`, the manifest and start
//! order are stable. A name is one subject token: non-empty, without `.`,
//! wildcards or whitespace.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::app::runtime::RuntimeContext;
use crate::app::worker_loop::ProcedureHandle;
use crate::domain::RpcError;
use crate::domain::subject::join;
use crate::procedures::{Dispatch, Procedure, ProcedureKind, Query, Queue};

#[derive(Debug, Clone)]
pub enum Node {
    Procedure(Procedure),
    Namespace(Namespace),
}

impl From<Procedure> for Node {
    fn from(procedure: Procedure) -> Self {
        Node::Procedure(procedure)
    }
}

impl From<Namespace> for Node {
    fn from(namespace: Namespace) -> Self {
        Node::Namespace(namespace)
    }
}

impl From<Query> for Node {
    fn from(query: Query) -> Self {
        Node::Procedure(query.into())
    }
}

impl From<Dispatch> for Node {
    fn from(dispatch: Dispatch) -> Self {
        Node::Procedure(dispatch.into())
    }
}

impl From<Queue> for Node {
    fn from(queue: Queue) -> Self {
        Node::Procedure(queue.into())
    }
}

#[derive(Debug, Clone, Default)]
pub struct Namespace {
    entries: Vec<(String, Node)>,
}

pub(crate) fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && !name
            .chars()
            .any(|c| c == '.' || c == '*' || c == '>' || c.is_whitespace())
}

impl Namespace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace `name`. A replaced entry keeps its position.
    pub fn with(mut self, name: impl Into<String>, node: impl Into<Node>) -> Self {
        let name = name.into();
        let node = node.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = node,
            None => self.entries.push((name, node)),
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<&Node> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, node)| node)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn lookup(&self, path: &str) -> Option<&Node> {
        let mut tokens = path.split('.');
        let mut node = self.get(tokens.next()?)?;
        for token in tokens {
            match node {
                Node::Namespace(ns) => node = ns.get(token)?,
                Node::Procedure(_) => return None,
            }
        }
        Some(node)
    }

    /// Resolve a dotted path to a procedure.
    pub fn procedure(&self, path: &str) -> Result<&Procedure, RpcError> {
        match self.lookup(path) {
            Some(Node::Procedure(procedure)) => Ok(procedure),
            Some(Node::Namespace(_)) => Err(RpcError::procedure_not_found(format!(
                "'{path}' is a namespace, not a procedure"
            ))),
            None => Err(RpcError::procedure_not_found(format!("no procedure at '{path}'"))),
        }
    }

    /// Resolve a dotted path to a nested namespace. The empty path is `self`.
    pub fn namespace(&self, path: &str) -> Result<&Namespace, RpcError> {
        if path.is_empty() {
            return Ok(self);
        }
        match self.lookup(path) {
            Some(Node::Namespace(namespace)) => Ok(namespace),
            Some(Node::Procedure(_)) => Err(RpcError::procedure_not_found(format!(
                "'{path}' is a procedure, not a namespace"
            ))),
            None => Err(RpcError::procedure_not_found(format!("no namespace at '{path}'"))),
        }
    }

    /// Every procedure with its dotted subject, depth first.
    pub fn procedures(&self) -> Vec<(String, &Procedure)> {
        let mut out = Vec::new();
        self.collect("", &mut out);
        out
    }

    fn collect<'a>(&'a self, prefix: &str, out: &mut Vec<(String, &'a Procedure)>) {
        for (name, node) in &self.entries {
            let subject = join(prefix, name);
            match node {
                Node::Procedure(procedure) => out.push((subject, procedure)),
                Node::Namespace(ns) => ns.collect(&subject, out),
            }
        }
    }

    pub fn subjects(&self) -> Vec<String> {
        self.procedures().into_iter().map(|(subject, _)| subject).collect()
    }

    /// Dotted paths of entries whose name is not a single subject token.
    pub fn invalid_names(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_invalid("", &mut out);
        out
    }

    fn collect_invalid(&self, prefix: &str, out: &mut Vec<String>) {
        for (name, node) in &self.entries {
            let path = join(prefix, name);
            if !is_valid_name(name) {
                out.push(path.clone());
            }
            if let Node::Namespace(ns) = node {
                ns.collect_invalid(&path, out);
            }
        }
    }

    pub fn manifest(&self) -> Manifest {
        let procedures = self
            .procedures()
            .into_iter()
            .map(|(subject, procedure)| {
                let descriptor = ProcedureDescriptor {
                    kind: procedure.kind(),
                    has_input_schema: procedure.has_input_schema(),
                    response_encoding: procedure.response_encoding().map(str::to_owned),
                };
                (subject, descriptor)
            })
            .collect();
        Manifest { procedures }
    }

    /// Start every procedure under its subject. On failure the procedures
    /// started so far are stopped again.
    pub async fn start(&self, runtime: &RuntimeContext) -> Result<Vec<ProcedureHandle>, RpcError> {
        let mut handles = Vec::new();
        for (subject, procedure) in self.procedures() {
            match procedure.start(runtime, &subject).await {
                Ok(handle) => {
                    debug!(subject = %subject, kind = %procedure.kind(), "procedure registered");
                    handles.push(handle);
                }
                Err(error) => {
                    warn!(subject = %subject, error = %error, "procedure failed to start, stopping the others");
                    for handle in handles {
                        handle.stop().await;
                    }
                    return Err(error);
                }
            }
        }
        Ok(handles)
    }
}

/// Runtime description of a namespace, keyed by subject.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest {
    procedures: BTreeMap<String, ProcedureDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcedureDescriptor {
    pub kind: ProcedureKind,
    pub has_input_schema: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_encoding: Option<String>,
}

impl Manifest {
    pub fn get(&self, subject: &str) -> Option<&ProcedureDescriptor> {
        self.procedures.get(subject)
    }

    pub fn contains(&self, subject: &str) -> bool {
        self.procedures.contains_key(subject)
    }

    pub fn len(&self) -> usize {
        self.procedures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procedures.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ProcedureDescriptor)> {
        self.procedures.iter().map(|(s, d)| (s.as_str(), d))
    }

    /// Subjects of the given kind, sorted.
    pub fn subjects_of(&self, kind: ProcedureKind) -> Vec<&str> {
        self.iter()
            .filter(|(_, d)| d.kind == kind)
            .map(|(s, _)| s)
            .collect()
    }
}
