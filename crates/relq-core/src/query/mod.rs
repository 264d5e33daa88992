//! Module: query
//! Responsibility: query-model IR, translation to SQL, and the executable
//! plan handed to the execution layer.
//! Does not own: running commands or iterating rows (see `exec`).
//! Boundary: compilation is pure; the only side effects are diagnostics
//! events recorded through the configured sink.

pub mod client;
pub mod compiler;
pub mod context;
pub mod expr;
pub mod model;
pub mod plan;
pub mod shaper;
pub mod sql;
pub mod translate;
pub mod value_buffer;
pub mod visitor;

#[cfg(test)]
mod tests;

use crate::error::{ErrorClass, InternalError};
use std::fmt;
use thiserror::Error as ThisError;

// re-exports
pub use client::ClientExpr;
pub use compiler::{CompiledQuery, QueryCompiler, QuerySummary};
pub use context::{MethodProvider, ProviderCapabilities, QueryCompilationContext};
pub use expr::{BinaryOp, ClientFunction, Expr};
pub use model::{
    BodyClause, FromClause, GroupJoinClause, JoinClause, OrderDirection, Ordering, QueryModel,
    QueryModelBuilder, QuerySourceId, ResultOperator, SourceAllocator,
};
pub use plan::{ClientOp, QueryPlan, ShapedQuery};
pub use shaper::{ReferenceInclude, Shaper};
pub use sql::SelectExpression;
pub use value_buffer::ValueBuffer;
pub use visitor::ClientEvalFlags;

///
/// QueryError
///
/// Compilation failures. Untranslatable fragments are not errors; they
/// only surface here when the client-evaluation policy is `throw`.
///

#[derive(Debug, ThisError)]
pub enum QueryError {
    #[error(
        "the {clause} expression '{expression}' could not be translated and client evaluation is disabled"
    )]
    ClientEvaluation {
        clause: ClientEvalClause,
        expression: String,
    },

    #[error("entity type '{0}' is not part of the model")]
    UnknownEntityType(String),

    #[error("entity type '{entity}' has no property '{property}'")]
    UnknownProperty { entity: String, property: String },

    #[error("entity type '{entity}' has no navigation '{navigation}'")]
    UnknownNavigation { entity: String, navigation: String },

    #[error(transparent)]
    Invariant(#[from] InternalError),
}

impl QueryError {
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::ClientEvaluation { .. } => ErrorClass::ClientEvaluation,
            Self::UnknownEntityType(_)
            | Self::UnknownProperty { .. }
            | Self::UnknownNavigation { .. } => ErrorClass::NotFound,
            Self::Invariant(err) => err.class,
        }
    }
}

///
/// ClientEvalClause
///
/// Clause kind whose sticky client-evaluation flag just turned on.
///

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ClientEvalClause {
    SelectMany,
    Join,
    Filter,
    Projection,
    OrderBy,
    ResultOperator,
}

impl fmt::Display for ClientEvalClause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::SelectMany => "select_many",
            Self::Join => "join",
            Self::Filter => "filter",
            Self::Projection => "projection",
            Self::OrderBy => "order_by",
            Self::ResultOperator => "result_operator",
        };
        write!(f, "{label}")
    }
}
