//! Storage: the relational plumbing beneath query execution.
//!
//! Parameters, commands, connections, and the provider contracts they drive.
//! Nothing here knows about query models or shapers.

pub mod command;
pub mod connection;
pub mod dialect;
pub mod parameter;
pub mod provider;
pub mod type_mapping;

// re-exports
pub use command::{
    CommandContext, CommandError, CommandResult, ExecuteMode, RelationalCommand,
    RelationalDataReader,
};
pub use connection::RelationalConnection;
pub use dialect::{AnsiDialect, SqlDialect};
pub use parameter::{ParamValue, ParameterError, ParameterValues, RelationalParameter};
pub use provider::{
    DbCommand, DbConnection, DbDataReader, DbParameter, DbType, ParameterDirection,
    ProviderError, RawValue, TransactionId, ensure_not_cancelled,
};
pub use type_mapping::{DefaultTypeMappingSource, TypeMapping, TypeMappingSource};
