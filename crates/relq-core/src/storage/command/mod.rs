//! Module: storage::command
//! Responsibility: execute one SQL command with parameters and log its lifecycle.
//! Does not own: retries (an outer execution strategy re-runs whole queries).
//! Boundary: sole owner of the provider command and its connection reference
//! for the duration of one execution, unless a reader is handed back.

mod reader;

#[cfg(test)]
mod tests;

use crate::{
    config::QueryOptions,
    error::{ErrorClass, ErrorOrigin},
    obs::{CommandLog, DiagnosticEvent, DiagnosticsSink, ExecutedResult},
    storage::{
        connection::RelationalConnection,
        dialect::SqlDialect,
        parameter::{ParameterError, ParameterValues, RelationalParameter},
        provider::{DbCommand, DbDataReader, ProviderError},
        type_mapping::TypeMappingSource,
    },
    value::Value,
};
use std::time::Instant;
use thiserror::Error as ThisError;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

// re-exports
pub use reader::RelationalDataReader;

///
/// CommandError
///

#[derive(Debug, ThisError)]
pub enum CommandError {
    #[error(transparent)]
    Parameter(#[from] ParameterError),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl CommandError {
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::Parameter(_) => ErrorClass::ContractViolation,
            Self::Provider(ProviderError::Cancelled) => ErrorClass::Cancelled,
            Self::Provider(_) => ErrorClass::Provider,
        }
    }

    #[must_use]
    pub const fn origin(&self) -> ErrorOrigin {
        match self {
            Self::Parameter(_) => ErrorOrigin::Parameter,
            Self::Provider(_) => ErrorOrigin::Provider,
        }
    }
}

///
/// ExecuteMode
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExecuteMode {
    NonQuery,
    Scalar,
    Reader,
}

impl ExecuteMode {
    #[must_use]
    pub const fn method_name(self) -> &'static str {
        match self {
            Self::NonQuery => "ExecuteNonQuery",
            Self::Scalar => "ExecuteScalar",
            Self::Reader => "ExecuteReader",
        }
    }
}

///
/// CommandResult
///

#[derive(Debug)]
pub enum CommandResult {
    NonQuery(u64),
    Scalar(Value),
    Reader(RelationalDataReader),
}

impl CommandResult {
    #[must_use]
    pub const fn mode(&self) -> ExecuteMode {
        match self {
            Self::NonQuery(_) => ExecuteMode::NonQuery,
            Self::Scalar(_) => ExecuteMode::Scalar,
            Self::Reader(_) => ExecuteMode::Reader,
        }
    }

    pub fn into_rows_affected(self) -> Result<u64, CommandError> {
        match self {
            Self::NonQuery(rows) => Ok(rows),
            other => Err(other.mismatch(ExecuteMode::NonQuery)),
        }
    }

    pub fn into_scalar(self) -> Result<Value, CommandError> {
        match self {
            Self::Scalar(value) => Ok(value),
            other => Err(other.mismatch(ExecuteMode::Scalar)),
        }
    }

    pub fn into_reader(self) -> Result<RelationalDataReader, CommandError> {
        match self {
            Self::Reader(reader) => Ok(reader),
            other => Err(other.mismatch(ExecuteMode::Reader)),
        }
    }

    fn mismatch(&self, expected: ExecuteMode) -> CommandError {
        ProviderError::fault(format!(
            "{} returned an {} result",
            expected.method_name(),
            self.mode().method_name()
        ))
        .into()
    }
}

///
/// CommandContext
///
/// Collaborators one execution borrows: connection, type mappings,
/// dialect hook, diagnostics sink, and options.
///

#[derive(Clone, Copy)]
pub struct CommandContext<'a> {
    pub connection: &'a RelationalConnection,
    pub type_mappings: &'a dyn TypeMappingSource,
    pub dialect: &'a dyn SqlDialect,
    pub sink: &'a dyn DiagnosticsSink,
    pub options: &'a QueryOptions,
}

///
/// RelationalCommand
///
/// Immutable command text plus its ordered parameter list. Produces one
/// provider command per execution.
///

#[derive(Clone, Debug, PartialEq)]
pub struct RelationalCommand {
    command_text: String,
    parameters: Vec<RelationalParameter>,
}

impl RelationalCommand {
    pub fn new(command_text: impl Into<String>, parameters: Vec<RelationalParameter>) -> Self {
        Self {
            command_text: command_text.into(),
            parameters,
        }
    }

    #[must_use]
    pub fn command_text(&self) -> &str {
        &self.command_text
    }

    #[must_use]
    pub fn parameters(&self) -> &[RelationalParameter] {
        &self.parameters
    }

    pub fn execute(
        &self,
        ctx: &CommandContext<'_>,
        mode: ExecuteMode,
        values: Option<&ParameterValues>,
    ) -> Result<CommandResult, CommandError> {
        self.ensure_values_supplied(values)?;
        let mut cleanup = self.prepare(ctx, values)?;

        ctx.connection.open()?;
        cleanup.connection = Some(ctx.connection.clone());

        let log = self.command_log(ctx, cleanup.command.as_ref(), mode, false);
        ctx.sink
            .record(&DiagnosticEvent::CommandExecuting { command: &log });
        let start = Instant::now();

        let outcome = match mode {
            ExecuteMode::NonQuery => cleanup.command.execute_non_query().map(Outcome::NonQuery),
            ExecuteMode::Scalar => cleanup
                .command
                .execute_scalar()
                .map(|raw| Outcome::Scalar(raw.into_value())),
            ExecuteMode::Reader => cleanup.command.execute_reader().map(Outcome::Reader),
        };

        finish(ctx, &log, start, outcome, cleanup)
    }

    pub async fn execute_async(
        &self,
        ctx: &CommandContext<'_>,
        mode: ExecuteMode,
        values: Option<&ParameterValues>,
        cancel: &CancellationToken,
    ) -> Result<CommandResult, CommandError> {
        self.ensure_values_supplied(values)?;
        let mut cleanup = self.prepare(ctx, values)?;

        ctx.connection.open_async(cancel).await?;
        cleanup.connection = Some(ctx.connection.clone());

        let log = self.command_log(ctx, cleanup.command.as_ref(), mode, true);
        ctx.sink
            .record(&DiagnosticEvent::CommandExecuting { command: &log });
        let start = Instant::now();

        let outcome = match mode {
            ExecuteMode::NonQuery => cleanup
                .command
                .execute_non_query_async(cancel)
                .await
                .map(Outcome::NonQuery),
            ExecuteMode::Scalar => cleanup
                .command
                .execute_scalar_async(cancel)
                .await
                .map(|raw| Outcome::Scalar(raw.into_value())),
            ExecuteMode::Reader => cleanup
                .command
                .execute_reader_async(cancel)
                .await
                .map(Outcome::Reader),
        };

        finish(ctx, &log, start, outcome, cleanup)
    }

    pub fn execute_non_query(
        &self,
        ctx: &CommandContext<'_>,
        values: Option<&ParameterValues>,
    ) -> Result<u64, CommandError> {
        self.execute(ctx, ExecuteMode::NonQuery, values)?
            .into_rows_affected()
    }

    pub fn execute_scalar(
        &self,
        ctx: &CommandContext<'_>,
        values: Option<&ParameterValues>,
    ) -> Result<Value, CommandError> {
        self.execute(ctx, ExecuteMode::Scalar, values)?.into_scalar()
    }

    pub fn execute_reader(
        &self,
        ctx: &CommandContext<'_>,
        values: Option<&ParameterValues>,
    ) -> Result<RelationalDataReader, CommandError> {
        self.execute(ctx, ExecuteMode::Reader, values)?.into_reader()
    }

    pub async fn execute_reader_async(
        &self,
        ctx: &CommandContext<'_>,
        values: Option<&ParameterValues>,
        cancel: &CancellationToken,
    ) -> Result<RelationalDataReader, CommandError> {
        self.execute_async(ctx, ExecuteMode::Reader, values, cancel)
            .await?
            .into_reader()
    }

    // Declared parameters with no value map fail before any provider call.
    fn ensure_values_supplied(&self, values: Option<&ParameterValues>) -> Result<(), CommandError> {
        if values.is_none()
            && let Some(first) = self.parameters.first()
        {
            return Err(ParameterError::MissingValue {
                name: first.invariant_name().to_string(),
            }
            .into());
        }

        Ok(())
    }

    fn prepare(
        &self,
        ctx: &CommandContext<'_>,
        values: Option<&ParameterValues>,
    ) -> Result<CommandCleanup, CommandError> {
        let mut cleanup = CommandCleanup::new(ctx.connection.create_command()?);
        let command = cleanup.command.as_mut();

        command.set_command_text(&ctx.dialect.adjust_command_text(&self.command_text));
        command.set_transaction(ctx.connection.current_transaction());
        command.set_timeout(
            ctx.connection
                .command_timeout()
                .or_else(|| ctx.options.command_timeout()),
        );

        if let Some(values) = values {
            for parameter in &self.parameters {
                parameter.add_db_parameter_from(command, values, ctx.type_mappings)?;
            }
        }

        Ok(cleanup)
    }

    fn command_log(
        &self,
        ctx: &CommandContext<'_>,
        command: &dyn DbCommand,
        mode: ExecuteMode,
        is_async: bool,
    ) -> CommandLog {
        CommandLog::capture(
            Ulid::new(),
            mode,
            is_async,
            &self.command_text,
            command.parameters(),
            ctx.connection
                .command_timeout()
                .or_else(|| ctx.options.command_timeout()),
            ctx.options.sensitive_data_logging,
        )
    }
}

enum Outcome {
    NonQuery(u64),
    Scalar(Value),
    Reader(Box<dyn DbDataReader>),
}

fn finish(
    ctx: &CommandContext<'_>,
    log: &CommandLog,
    start: Instant,
    outcome: Result<Outcome, ProviderError>,
    cleanup: CommandCleanup,
) -> Result<CommandResult, CommandError> {
    let elapsed = start.elapsed();

    let (result, executed) = match outcome {
        Err(error) => {
            ctx.sink.record(&DiagnosticEvent::CommandError {
                command: log,
                elapsed,
                error: &error,
            });
            return Err(error.into());
        }
        Ok(Outcome::NonQuery(rows)) => (
            CommandResult::NonQuery(rows),
            ExecutedResult::RowsAffected(rows),
        ),
        Ok(Outcome::Scalar(value)) => {
            let executed = ExecutedResult::Scalar(value.clone());
            (CommandResult::Scalar(value), executed)
        }
        Ok(Outcome::Reader(reader)) => (
            CommandResult::Reader(RelationalDataReader::new(reader, cleanup, log.command_id)),
            ExecutedResult::Reader,
        ),
    };

    ctx.sink.record(&DiagnosticEvent::CommandExecuted {
        command: log,
        elapsed,
        result: &executed,
    });

    Ok(result)
}

///
/// CommandCleanup
///
/// Guaranteed release of one provider command and, once opened, its
/// connection reference. Dropped at the end of an execution, or owned by
/// the `RelationalDataReader` handed back to the caller.
///

pub(crate) struct CommandCleanup {
    command: Box<dyn DbCommand>,
    connection: Option<RelationalConnection>,
}

impl CommandCleanup {
    fn new(command: Box<dyn DbCommand>) -> Self {
        Self {
            command,
            connection: None,
        }
    }
}

impl Drop for CommandCleanup {
    fn drop(&mut self) {
        self.command.clear_parameters();
        self.command.dispose();

        if let Some(connection) = self.connection.take()
            && let Err(err) = connection.close()
        {
            tracing::warn!(target: "relq::command", error = %err, "failed to close connection");
        }
    }
}
