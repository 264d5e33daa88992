//! Core of relq: translates query models over a mapped entity model into
//! SQL plus client-side plan operators, and streams the results through a
//! pluggable provider, synchronously or asynchronously.
#![warn(unreachable_pub)]

// public exports are one module level down
pub mod config;
pub mod error;
pub mod exec;
pub mod model;
pub mod obs;
pub mod query;
pub mod storage;
pub mod value;

// test
#[cfg(test)]
pub(crate) mod test_support;

pub use error::Error;

///
/// Prelude
///
/// Vocabulary needed to describe a model, build a query, compile it, and
/// read its results. Provider traits and diagnostics stay in their modules.
///

pub mod prelude {
    pub use crate::{
        config::{ClientEvalPolicy, QueryOptions},
        exec::{AsyncQueryContext, QueryContext, QueryResult},
        model::{EntityBuilder, EntityRef, Model},
        query::{
            BinaryOp, ClientFunction, CompiledQuery, Expr, ProviderCapabilities, QueryCompiler,
            QueryModel, QueryModelBuilder, ResultOperator,
        },
        storage::{ParamValue, RelationalConnection},
        value::Value,
    };
}
