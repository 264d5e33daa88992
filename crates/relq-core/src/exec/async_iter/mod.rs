//! Module: exec::async_iter
//! Responsibility: asynchronous interpretation of query plans, cancellable
//! through a `CancellationToken`.
//! Does not own: operator state shared with the sync family (see
//! `exec::ops`).
//! Boundary: correlated subqueries are run ahead of client evaluation so
//! evaluation itself stays synchronous.

mod operators;

use crate::{
    error::InternalError,
    exec::{AsyncQueryContext, EvalHost, ExecutionError, QueryBuffer, QueryResult, Scope, evaluate},
    model::Model,
    query::{ClientExpr, QueryPlan},
    value::Value,
};
use async_trait::async_trait;
use std::{collections::BTreeMap, fmt, future::Future, pin::Pin, sync::Arc};
use tokio_util::sync::CancellationToken;

pub(crate) use operators::open;

///
/// AsyncOperator
///

#[async_trait]
pub(crate) trait AsyncOperator: Send {
    async fn pull(&mut self) -> Result<Option<QueryResult>, ExecutionError>;
}

///
/// AsyncQueryStream
///
/// Asynchronous result sequence of a compiled query. Dropping the stream
/// before it ends closes every cursor it opened.
///

pub struct AsyncQueryStream {
    op: Option<Box<dyn AsyncOperator>>,
}

impl AsyncQueryStream {
    pub(crate) fn new(op: Box<dyn AsyncOperator>) -> Self {
        Self { op: Some(op) }
    }

    /// Next item, or `None` once the stream has ended. The stream ends
    /// after the first error.
    pub async fn next(&mut self) -> Option<Result<QueryResult, ExecutionError>> {
        let op = self.op.as_mut()?;

        match op.pull().await {
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

    /// Drain the stream.
    pub async fn to_vec(mut self) -> Result<Vec<QueryResult>, ExecutionError> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await {
            items.push(item?);
        }

        Ok(items)
    }

    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.op.is_none()
    }
}

impl fmt::Debug for AsyncQueryStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncQueryStream")
            .field("finished", &self.is_finished())
            .finish()
    }
}

///
/// AsyncEnv
///
/// Context, cancellation token, and outer scope of one running plan.
///

#[derive(Clone)]
pub(crate) struct AsyncEnv {
    pub ctx: Arc<AsyncQueryContext>,
    pub cancel: CancellationToken,
    pub parent: Option<Arc<Scope>>,
}

type RunFuture = Pin<Box<dyn Future<Output = Result<QueryResult, ExecutionError>> + Send>>;

impl AsyncEnv {
    #[must_use]
    pub(crate) fn with_parent(&self, parent: Option<Arc<Scope>>) -> Self {
        Self {
            ctx: Arc::clone(&self.ctx),
            cancel: self.cancel.clone(),
            parent,
        }
    }

    pub(crate) fn host(&self) -> AsyncHost<'_> {
        AsyncHost {
            ctx: &self.ctx,
            prefetched: BTreeMap::new(),
        }
    }

    pub(crate) fn scope(&self, item: &QueryResult) -> Arc<Scope> {
        Scope::for_item(item, self.parent.as_ref())
    }

    pub(crate) fn ensure_not_cancelled(&self) -> Result<(), ExecutionError> {
        Ok(crate::storage::ensure_not_cancelled(&self.cancel)?)
    }

    /// Evaluate `expr` against `item`.
    pub(crate) async fn eval(
        &self,
        expr: &ClientExpr,
        item: &QueryResult,
    ) -> Result<QueryResult, ExecutionError> {
        self.eval_in(expr, self.scope(item)).await
    }

    /// Evaluate `expr` in the outer scope only.
    pub(crate) async fn eval_outer(&self, expr: &ClientExpr) -> Result<QueryResult, ExecutionError> {
        self.eval_in(expr, Scope::root(self.parent.clone())).await
    }

    async fn eval_in(
        &self,
        expr: &ClientExpr,
        scope: Arc<Scope>,
    ) -> Result<QueryResult, ExecutionError> {
        let mut host = self.host();
        for plan in expr.subqueries() {
            let result = run(self.clone(), plan.clone(), Some(Arc::clone(&scope))).await?;
            host.prefetched.insert(plan_key(plan), result);
        }

        evaluate(expr, &scope, &host)
    }
}

/// Run `plan` to completion. Scalar plans yield their only item.
pub(crate) fn run(env: AsyncEnv, plan: QueryPlan, parent: Option<Arc<Scope>>) -> RunFuture {
    Box::pin(async move {
        let env = env.with_parent(parent);
        let mut op = open(&env, &plan);

        if plan.is_scalar() {
            return Ok(op.pull().await?.unwrap_or(QueryResult::NULL));
        }

        let mut items = Vec::new();
        while let Some(item) = op.pull().await? {
            items.push(item);
        }

        Ok(QueryResult::Sequence(items))
    })
}

fn plan_key(plan: &QueryPlan) -> usize {
    std::ptr::from_ref(plan) as usize
}

///
/// AsyncHost
///
/// Synchronous evaluation host over subquery results computed ahead of
/// time.
///

pub(crate) struct AsyncHost<'a> {
    ctx: &'a Arc<AsyncQueryContext>,
    prefetched: BTreeMap<usize, QueryResult>,
}

impl EvalHost for AsyncHost<'_> {
    fn model(&self) -> &Model {
        self.ctx.model()
    }

    fn parameter(&self, name: &str) -> Option<Value> {
        self.ctx.client_parameter(name)
    }

    fn query_buffer(&self) -> &dyn QueryBuffer {
        self.ctx.query_buffer()
    }

    fn subquery(&self, plan: &QueryPlan, _: &Arc<Scope>) -> Result<QueryResult, ExecutionError> {
        self.prefetched.get(&plan_key(plan)).cloned().ok_or_else(|| {
            InternalError::executor_invariant(format!(
                "{} subquery was not run ahead of evaluation",
                plan.method_name()
            ))
            .into()
        })
    }
}
