use crate::{
    config::ConfigError,
    exec::ExecutionError,
    model::ModelError,
    query::QueryError,
    storage::{CommandError, ParameterError, ProviderError},
};
use std::fmt;
use thiserror::Error as ThisError;

///
/// Error
///
/// Public error surface of the crate. Every subsystem error converts into
/// this type; `class()` and `origin()` expose a stable classification.
///

#[derive(Debug, ThisError)]
pub enum Error {
    #[error(transparent)]
    Parameter(#[from] ParameterError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Internal(#[from] InternalError),
}

impl Error {
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::Parameter(_) | Self::Config(_) | Self::Model(_) => ErrorClass::ContractViolation,
            Self::Command(err) => err.class(),
            Self::Query(err) => err.class(),
            Self::Execution(err) => err.class(),
            Self::Internal(err) => err.class,
        }
    }

    #[must_use]
    pub const fn origin(&self) -> ErrorOrigin {
        match self {
            Self::Parameter(_) => ErrorOrigin::Parameter,
            Self::Command(err) => err.origin(),
            Self::Query(_) => ErrorOrigin::Query,
            Self::Execution(_) => ErrorOrigin::Executor,
            Self::Config(_) => ErrorOrigin::Config,
            Self::Model(_) => ErrorOrigin::Model,
            Self::Internal(err) => err.origin,
        }
    }

    #[must_use]
    pub fn display_with_class(&self) -> String {
        format!("{}:{}: {self}", self.origin(), self.class())
    }
}

impl From<ProviderError> for Error {
    fn from(err: ProviderError) -> Self {
        Self::Command(CommandError::Provider(err))
    }
}

///
/// InternalError
///
/// Structured runtime error with a stable internal classification.
/// Raised when a compile-time or execution-time invariant is broken.
///

#[derive(Debug, ThisError)]
#[error("{message}")]
pub struct InternalError {
    pub class: ErrorClass,
    pub origin: ErrorOrigin,
    pub message: String,
}

impl InternalError {
    pub fn new(class: ErrorClass, origin: ErrorOrigin, message: impl Into<String>) -> Self {
        Self {
            class,
            origin,
            message: message.into(),
        }
    }

    /// Construct a query-origin invariant violation.
    pub(crate) fn query_invariant(message: impl Into<String>) -> Self {
        Self::new(
            ErrorClass::InvariantViolation,
            ErrorOrigin::Query,
            message.into(),
        )
    }

    /// Construct an executor-origin invariant violation.
    pub(crate) fn executor_invariant(message: impl Into<String>) -> Self {
        Self::new(
            ErrorClass::InvariantViolation,
            ErrorOrigin::Executor,
            message.into(),
        )
    }

    #[must_use]
    pub fn display_with_class(&self) -> String {
        format!("{}:{}: {}", self.origin, self.class, self.message)
    }
}

///
/// ErrorClass
/// Error taxonomy for runtime classification.
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorClass {
    /// Caller broke an API contract (missing parameter, malformed shape, bad config).
    ContractViolation,
    /// Translation policy refused client evaluation.
    ClientEvaluation,
    /// The underlying provider failed.
    Provider,
    Cancelled,
    NotFound,
    Unsupported,
    Internal,
    InvariantViolation,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::ContractViolation => "contract_violation",
            Self::ClientEvaluation => "client_evaluation",
            Self::Provider => "provider",
            Self::Cancelled => "cancelled",
            Self::NotFound => "not_found",
            Self::Unsupported => "unsupported",
            Self::Internal => "internal",
            Self::InvariantViolation => "invariant_violation",
        };
        write!(f, "{label}")
    }
}

///
/// ErrorOrigin
/// Origin taxonomy for runtime classification.
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorOrigin {
    Parameter,
    Command,
    Provider,
    Query,
    Executor,
    Config,
    Model,
}

impl fmt::Display for ErrorOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Parameter => "parameter",
            Self::Command => "command",
            Self::Provider => "provider",
            Self::Query => "query",
            Self::Executor => "executor",
            Self::Config => "config",
            Self::Model => "model",
        };
        write!(f, "{label}")
    }
}
