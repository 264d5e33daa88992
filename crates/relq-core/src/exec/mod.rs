//! Module: exec
//! Responsibility: stream compiled plans against a provider connection.
//! Does not own: deciding what runs in SQL (see `query`).
//! Boundary: every provider cursor opened here is registered with the
//! query context and released on completion, error, or early drop.

mod async_iter;
mod buffer;
mod context;
mod cursor;
mod eval;
mod ops;
mod sync;


use crate::{
    error::{ErrorClass, InternalError},
    model::EntityRef,
    query::{MethodProvider, QueryPlan, QuerySourceId, ValueBuffer},
    storage::{CommandError, ProviderError},
    value::Value,
};
use std::{collections::BTreeMap, sync::Arc};
use thiserror::Error as ThisError;
use tokio_util::sync::CancellationToken;

// re-exports
pub use async_iter::AsyncQueryStream;
pub use buffer::{FixupQueryBuffer, QueryBuffer};
pub use context::{AsyncQueryContext, QueryContext, QueryContextBuilder};
pub use sync::QueryStream;

pub(crate) use eval::{EvalHost, evaluate};

/// Synchronous stream over `plan`; nothing runs until the first item is
/// requested.
pub(crate) fn start(ctx: &Arc<QueryContext>, plan: &QueryPlan) -> QueryStream {
    QueryStream::new(sync::open(ctx, plan, None))
}

pub(crate) fn start_async(
    ctx: &Arc<AsyncQueryContext>,
    cancel: CancellationToken,
    plan: &QueryPlan,
) -> AsyncQueryStream {
    let env = async_iter::AsyncEnv {
        ctx: Arc::clone(ctx),
        cancel,
        parent: None,
    };

    AsyncQueryStream::new(async_iter::open(&env, plan))
}

///
/// ExecutionError
///

#[derive(Debug, ThisError)]
pub enum ExecutionError {
    #[error(transparent)]
    Command(CommandError),

    #[error("sequence contains no elements")]
    EmptySequence,

    #[error("sequence contains more than one element")]
    MoreThanOneElement,

    #[error("query execution was cancelled")]
    Cancelled,

    #[error("{operator} input is not ordered by its key: '{key}' reappeared after its run ended")]
    OrderingViolation { operator: &'static str, key: String },

    #[error("query was compiled for {compiled} execution but executed {requested}")]
    ModeMismatch {
        compiled: MethodProvider,
        requested: MethodProvider,
    },

    #[error("invalid operand for '{operation}': {detail}")]
    InvalidOperand { operation: String, detail: String },

    #[error(transparent)]
    Invariant(#[from] InternalError),
}

impl ExecutionError {
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::Command(err) => err.class(),
            Self::EmptySequence
            | Self::MoreThanOneElement
            | Self::ModeMismatch { .. }
            | Self::InvalidOperand { .. } => ErrorClass::ContractViolation,
            Self::Cancelled => ErrorClass::Cancelled,
            Self::OrderingViolation { .. } => ErrorClass::InvariantViolation,
            Self::Invariant(err) => err.class,
        }
    }

    pub(crate) fn invalid_operand(operation: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::InvalidOperand {
            operation: operation.into(),
            detail: detail.into(),
        }
    }
}

impl From<CommandError> for ExecutionError {
    fn from(err: CommandError) -> Self {
        match err {
            CommandError::Provider(ProviderError::Cancelled) => Self::Cancelled,
            other => Self::Command(other),
        }
    }
}

impl From<ProviderError> for ExecutionError {
    fn from(err: ProviderError) -> Self {
        CommandError::Provider(err).into()
    }
}

///
/// QueryResult
///
/// One item flowing through a plan: a scalar, an entity, a raw row block,
/// the bindings of a row, or a client-built composite.
///

#[derive(Clone, Debug, PartialEq)]
pub enum QueryResult {
    Value(Value),
    Entity(EntityRef),
    Buffer(ValueBuffer),
    Row(Bindings),
    Record(Vec<(String, Self)>),
    Sequence(Vec<Self>),
    Grouping {
        key: Box<Self>,
        elements: Vec<Self>,
    },
}

impl QueryResult {
    pub const NULL: Self = Self::Value(Value::Null);

    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Value(Value::Null))
    }

    #[must_use]
    pub const fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Value(value) => Some(value),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_entity(&self) -> Option<&EntityRef> {
        match self {
            Self::Entity(entity) => Some(entity),
            _ => None,
        }
    }

    /// Only `Value(Bool(true))` passes a client filter.
    #[must_use]
    pub const fn is_true(&self) -> bool {
        matches!(self, Self::Value(Value::Bool(true)))
    }

    /// Comparable view used for client keys, equality, and ordering.
    #[must_use]
    pub fn as_key(&self) -> Value {
        match self {
            Self::Value(value) => value.clone(),
            Self::Entity(entity) => {
                entity.with(|instance| Value::List(instance.values.values().cloned().collect()))
            }
            Self::Buffer(buffer) => Value::List(buffer.as_slice().to_vec()),
            Self::Row(bindings) => Value::List(bindings.sources.values().map(Self::as_key).collect()),
            Self::Record(fields) => Value::List(fields.iter().map(|(_, v)| v.as_key()).collect()),
            Self::Sequence(items) => Value::List(items.iter().map(Self::as_key).collect()),
            Self::Grouping { key, .. } => key.as_key(),
        }
    }
}

impl From<Value> for QueryResult {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

///
/// Bindings
///
/// Query-source bindings of one row, plus the physical row they were
/// shaped from.
///

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Bindings {
    sources: BTreeMap<QuerySourceId, QueryResult>,
    buffer: Option<ValueBuffer>,
}

impl Bindings {
    #[must_use]
    pub fn new(buffer: ValueBuffer) -> Self {
        Self {
            sources: BTreeMap::new(),
            buffer: Some(buffer),
        }
    }

    pub fn bind(&mut self, source: QuerySourceId, value: QueryResult) {
        self.sources.insert(source, value);
    }

    #[must_use]
    pub fn get(&self, source: QuerySourceId) -> Option<&QueryResult> {
        self.sources.get(&source)
    }

    #[must_use]
    pub fn remove(&mut self, source: QuerySourceId) -> Option<QueryResult> {
        self.sources.remove(&source)
    }

    pub fn sources(&self) -> impl Iterator<Item = (QuerySourceId, &QueryResult)> {
        self.sources.iter().map(|(id, value)| (*id, value))
    }

    #[must_use]
    pub const fn buffer(&self) -> Option<&ValueBuffer> {
        self.buffer.as_ref()
    }

    /// Union of both binding sets; `other` wins on conflicts.
    #[must_use]
    pub fn merged(mut self, other: Self) -> Self {
        self.sources.extend(other.sources);
        if self.buffer.is_none() {
            self.buffer = other.buffer;
        }

        self
    }
}

///
/// Scope
///
/// Evaluation environment of one item. `parent` links a correlated
/// subquery to the row of its outer query.
///

#[derive(Debug, Default)]
pub struct Scope {
    row: Option<Bindings>,
    current: Option<QueryResult>,
    parent: Option<Arc<Self>>,
}

impl Scope {
    #[must_use]
    pub fn root(parent: Option<Arc<Self>>) -> Arc<Self> {
        Arc::new(Self {
            row: None,
            current: None,
            parent,
        })
    }

    /// Scope of `item`; rows expose their bindings, anything else is only
    /// reachable as the current element.
    #[must_use]
    pub fn for_item(item: &QueryResult, parent: Option<&Arc<Self>>) -> Arc<Self> {
        let row = match item {
            QueryResult::Row(bindings) => Some(bindings.clone()),
            _ => None,
        };

        Arc::new(Self {
            row,
            current: Some(item.clone()),
            parent: parent.cloned(),
        })
    }

    #[must_use]
    pub fn lookup(&self, source: QuerySourceId) -> Option<&QueryResult> {
        self.row
            .as_ref()
            .and_then(|row| row.get(source))
            .or_else(|| self.parent.as_ref().and_then(|p| p.lookup(source)))
    }

    #[must_use]
    pub fn current(&self) -> Option<&QueryResult> {
        self.current
            .as_ref()
            .or_else(|| self.parent.as_ref().and_then(|p| p.current()))
    }

    #[must_use]
    pub const fn parent(&self) -> Option<&Arc<Self>> {
        self.parent.as_ref()
    }
}
