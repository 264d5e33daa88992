//! ## Crate layout
//! - `core`: query model, translation, execution, providers, and diagnostics.
//!
//! The `prelude` module re-exports the vocabulary most callers need to
//! compile and run queries.

pub use relq_core as core;

pub use relq_core::{Error, config, exec, model, obs, query, storage, value};

/// Workspace version re-export for downstream tooling/tests.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

///
/// Prelude
///

pub mod prelude {
    pub use relq_core::prelude::*;
}
