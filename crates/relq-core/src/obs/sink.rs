//! Diagnostics sink boundary.
//!
//! Core command and query logic MUST NOT call `tracing` for lifecycle
//! events directly. All instrumentation flows through `DiagnosticEvent`
//! and the `DiagnosticsSink` handed to the execution context.

use crate::{
    obs::format::{CommandLog, format_command},
    query::ClientEvalClause,
    storage::ProviderError,
    value::Value,
};
use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

///
/// ExecutedResult
///

#[derive(Clone, Debug, PartialEq)]
pub enum ExecutedResult {
    RowsAffected(u64),
    Scalar(Value),
    Reader,
}

///
/// DiagnosticEvent
///

#[derive(Clone, Copy, Debug)]
pub enum DiagnosticEvent<'a> {
    CommandExecuting {
        command: &'a CommandLog,
    },
    CommandExecuted {
        command: &'a CommandLog,
        elapsed: Duration,
        result: &'a ExecutedResult,
    },
    CommandError {
        command: &'a CommandLog,
        elapsed: Duration,
        error: &'a ProviderError,
    },
    ClientEvaluation {
        clause: ClientEvalClause,
        expression: &'a str,
    },
    CursorBuffered {
        rows: usize,
    },
}

///
/// DiagnosticsSink
///

pub trait DiagnosticsSink: Send + Sync {
    fn record(&self, event: &DiagnosticEvent<'_>);
}

///
/// NoopSink
///

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopSink;

impl DiagnosticsSink for NoopSink {
    fn record(&self, _: &DiagnosticEvent<'_>) {}
}

///
/// TracingSink
///
/// Default sink: forwards every event to `tracing`. Warns once per sink
/// when a command log carries parameter values.
///

#[derive(Debug, Default)]
pub struct TracingSink {
    sensitive_warned: AtomicBool,
}

impl TracingSink {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            sensitive_warned: AtomicBool::new(false),
        }
    }

    fn warn_sensitive_once(&self, command: &CommandLog) {
        if command.sensitive && !self.sensitive_warned.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                target: "relq::command",
                "sensitive data logging is enabled; parameter values will appear in command logs"
            );
        }
    }
}

impl DiagnosticsSink for TracingSink {
    fn record(&self, event: &DiagnosticEvent<'_>) {
        match *event {
            DiagnosticEvent::CommandExecuting { command } => {
                self.warn_sensitive_once(command);
                tracing::debug!(
                    target: "relq::command",
                    command_id = %command.command_id,
                    method = command.mode.method_name(),
                    is_async = command.is_async,
                    "executing DbCommand {}",
                    format_command(command)
                );
            }
            DiagnosticEvent::CommandExecuted {
                command,
                elapsed,
                result,
            } => {
                tracing::info!(
                    target: "relq::command",
                    command_id = %command.command_id,
                    method = command.mode.method_name(),
                    is_async = command.is_async,
                    elapsed_ms = elapsed.as_millis(),
                    result = ?result,
                    "executed DbCommand ({}ms) {}",
                    elapsed.as_millis(),
                    format_command(command)
                );
            }
            DiagnosticEvent::CommandError {
                command,
                elapsed,
                error,
            } => {
                tracing::error!(
                    target: "relq::command",
                    command_id = %command.command_id,
                    method = command.mode.method_name(),
                    is_async = command.is_async,
                    elapsed_ms = elapsed.as_millis(),
                    error = %error,
                    "failed executing DbCommand ({}ms) {}",
                    elapsed.as_millis(),
                    format_command(command)
                );
            }
            DiagnosticEvent::ClientEvaluation { clause, expression } => {
                tracing::warn!(
                    target: "relq::query",
                    clause = %clause,
                    "the expression '{expression}' could not be translated and will be evaluated locally"
                );
            }
            DiagnosticEvent::CursorBuffered { rows } => {
                tracing::debug!(
                    target: "relq::query",
                    rows,
                    "buffered open cursor to release the connection"
                );
            }
        }
    }
}
