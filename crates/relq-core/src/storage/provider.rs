//! Module: storage::provider
//! Responsibility: provider-native connection, command, reader, and parameter contracts.
//! Does not own: connection reference counting or command lifecycle logging.
//! Boundary: everything above this module talks to the database only through these traits.

use crate::value::Value;
use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use thiserror::Error as ThisError;
use tokio_util::sync::CancellationToken;

///
/// ProviderError
///
/// Fault raised by the underlying provider. Propagated unchanged through
/// the command layer.
///

#[derive(Clone, Debug, Eq, PartialEq, ThisError)]
pub enum ProviderError {
    #[error("provider fault: {message}")]
    Fault { message: String, code: Option<i32> },

    #[error("provider operation was cancelled")]
    Cancelled,
}

impl ProviderError {
    pub fn fault(message: impl Into<String>) -> Self {
        Self::Fault {
            message: message.into(),
            code: None,
        }
    }
}

/// Fail with `ProviderError::Cancelled` once the token has fired.
pub fn ensure_not_cancelled(cancel: &CancellationToken) -> Result<(), ProviderError> {
    if cancel.is_cancelled() {
        return Err(ProviderError::Cancelled);
    }

    Ok(())
}

///
/// RawValue
///
/// One column value as reported by a provider reader, before null
/// normalization.
///

#[derive(Clone, Debug, PartialEq)]
pub enum RawValue {
    DbNull,
    Value(Value),
}

impl RawValue {
    #[must_use]
    pub fn into_value(self) -> Value {
        match self {
            Self::DbNull => Value::Null,
            Self::Value(value) => value,
        }
    }
}

impl From<Value> for RawValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::DbNull,
            other => Self::Value(other),
        }
    }
}

///
/// TransactionId
///

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct TransactionId(pub u64);

///
/// ParameterDirection
///

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ParameterDirection {
    #[default]
    Input,
    Output,
    InputOutput,
    ReturnValue,
}

///
/// DbType
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DbType {
    Boolean,
    Int64,
    Double,
    String,
    Binary,
    Object,
}

///
/// DbParameter
///
/// Provider-native parameter object attached to a command.
///

#[derive(Clone, Debug, PartialEq)]
pub struct DbParameter {
    pub name: String,
    pub value: Value,
    pub direction: ParameterDirection,
    pub db_type: Option<DbType>,
    pub store_type: Option<String>,
    pub nullable: bool,
    pub size: Option<u32>,
    pub precision: Option<u8>,
    pub scale: Option<u8>,
    pub cloneable: bool,
}

impl DbParameter {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            nullable: value.is_null(),
            value,
            direction: ParameterDirection::Input,
            db_type: None,
            store_type: None,
            size: None,
            precision: None,
            scale: None,
            cloneable: true,
        }
    }

    #[must_use]
    pub const fn with_direction(mut self, direction: ParameterDirection) -> Self {
        self.direction = direction;
        self
    }

    #[must_use]
    pub const fn with_cloneable(mut self, cloneable: bool) -> Self {
        self.cloneable = cloneable;
        self
    }

    /// Copy of this parameter, if the provider allows cloning it.
    #[must_use]
    pub fn try_clone(&self) -> Option<Self> {
        self.cloneable.then(|| self.clone())
    }
}

///
/// DbConnection
///
/// Physical provider connection. Open/close calls arrive already
/// reference-counted by `RelationalConnection`.
///

#[async_trait]
pub trait DbConnection: Send + Sync {
    fn open(&self) -> Result<(), ProviderError>;

    async fn open_async(&self, cancel: &CancellationToken) -> Result<(), ProviderError> {
        ensure_not_cancelled(cancel)?;
        self.open()
    }

    fn close(&self) -> Result<(), ProviderError>;

    fn create_command(&self) -> Result<Box<dyn DbCommand>, ProviderError>;

    fn supports_multiple_active_result_sets(&self) -> bool {
        false
    }
}

///
/// DbCommand
///

#[async_trait]
pub trait DbCommand: Send {
    fn set_command_text(&mut self, text: &str);

    fn set_transaction(&mut self, transaction: Option<TransactionId>);

    fn set_timeout(&mut self, timeout: Option<Duration>);

    fn add_parameter(&mut self, parameter: Arc<DbParameter>);

    fn parameters(&self) -> &[Arc<DbParameter>];

    fn clear_parameters(&mut self);

    fn execute_non_query(&mut self) -> Result<u64, ProviderError>;

    fn execute_scalar(&mut self) -> Result<RawValue, ProviderError>;

    fn execute_reader(&mut self) -> Result<Box<dyn DbDataReader>, ProviderError>;

    async fn execute_non_query_async(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<u64, ProviderError> {
        ensure_not_cancelled(cancel)?;
        self.execute_non_query()
    }

    async fn execute_scalar_async(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<RawValue, ProviderError> {
        ensure_not_cancelled(cancel)?;
        self.execute_scalar()
    }

    async fn execute_reader_async(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn DbDataReader>, ProviderError> {
        ensure_not_cancelled(cancel)?;
        self.execute_reader()
    }

    fn dispose(&mut self);
}

///
/// DbDataReader
///

#[async_trait]
pub trait DbDataReader: Send {
    fn field_count(&self) -> usize;

    /// Advance to the next row; `false` once the result set is exhausted.
    fn read(&mut self) -> Result<bool, ProviderError>;

    async fn read_async(&mut self, cancel: &CancellationToken) -> Result<bool, ProviderError> {
        ensure_not_cancelled(cancel)?;
        self.read()
    }

    fn get_value(&self, ordinal: usize) -> RawValue;

    fn close(&mut self);
}
