//! Module: exec::sync
//! Responsibility: pull-based synchronous interpretation of query plans.
//! Does not own: operator state shared with the async family (see
//! `exec::ops`).
//! Boundary: every operator is opened lazily and releases its cursors
//! when it ends, fails, or is dropped.

mod operators;

use crate::{
    exec::{EvalHost, ExecutionError, QueryBuffer, QueryContext, QueryResult, Scope},
    model::Model,
    query::QueryPlan,
    value::Value,
};
use std::{fmt, sync::Arc};

pub(crate) use operators::open;

///
/// Operator
///
/// One node of a running plan. `pull` yields the next item, or `None`
/// once the node is exhausted.
///

pub(crate) trait Operator {
    fn pull(&mut self) -> Result<Option<QueryResult>, ExecutionError>;
}

///
/// QueryStream
///
/// Synchronous result sequence of a compiled query. The stream ends after
/// the first error; dropping it early closes every cursor it opened.
///

pub struct QueryStream {
    op: Option<Box<dyn Operator>>,
}

impl QueryStream {
    pub(crate) fn new(op: Box<dyn Operator>) -> Self {
        Self { op: Some(op) }
    }

    /// True once the stream has ended or failed.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.op.is_none()
    }
}

impl Iterator for QueryStream {
    type Item = Result<QueryResult, ExecutionError>;

    fn next(&mut self) -> Option<Self::Item> {
        let op = self.op.as_mut()?;

        match op.pull() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.op = None;
                None
            }
            Err(err) => {
                self.op = None;
                Some(Err(err))
            }
        }
    }
}

impl fmt::Debug for QueryStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryStream")
            .field("finished", &self.is_finished())
            .finish()
    }
}

///
/// SyncHost
///

pub(crate) struct SyncHost<'a> {
    pub ctx: &'a Arc<QueryContext>,
}

impl EvalHost for SyncHost<'_> {
    fn model(&self) -> &Model {
        self.ctx.model()
    }

    fn parameter(&self, name: &str) -> Option<Value> {
        self.ctx.client_parameter(name)
    }

    fn query_buffer(&self) -> &dyn QueryBuffer {
        self.ctx.query_buffer()
    }

    fn subquery(&self, plan: &QueryPlan, scope: &Arc<Scope>) -> Result<QueryResult, ExecutionError> {
        run(self.ctx, plan, Some(Arc::clone(scope)))
    }
}

/// Run `plan` to completion. Scalar plans yield their only item.
pub(crate) fn run(
    ctx: &Arc<QueryContext>,
    plan: &QueryPlan,
    parent: Option<Arc<Scope>>,
) -> Result<QueryResult, ExecutionError> {
    let mut op = open(ctx, plan, parent);

    if plan.is_scalar() {
        return Ok(op.pull()?.unwrap_or(QueryResult::NULL));
    }

    let mut items = Vec::new();
    while let Some(item) = op.pull()? {
        items.push(item);
    }

    Ok(QueryResult::Sequence(items))
}
