//! Observability: diagnostics events and sink abstractions.
//!
//! Command execution and query compilation never log directly; every
//! lifecycle event flows through `DiagnosticEvent` and a `DiagnosticsSink`.

mod format;
pub(crate) mod sink;

#[cfg(test)]
mod tests;

// re-exports
pub use format::{CommandLog, ParameterLog, format_command};
pub use sink::{DiagnosticEvent, DiagnosticsSink, ExecutedResult, NoopSink, TracingSink};
