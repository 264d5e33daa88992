use crate::{
    storage::{
        command::CommandCleanup,
        provider::{DbDataReader, ProviderError, RawValue},
    },
    value::Value,
};
use std::fmt;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

///
/// RelationalDataReader
///
/// Open provider reader handed back from a reader-mode execution. Owns
/// the command and the connection reference; closing or dropping the
/// reader closes the provider reader, disposes the command, and closes
/// the connection.
///

pub struct RelationalDataReader {
    reader: Box<dyn DbDataReader>,
    cleanup: Option<CommandCleanup>,
    command_id: Ulid,
}

impl RelationalDataReader {
    pub(crate) fn new(
        reader: Box<dyn DbDataReader>,
        cleanup: CommandCleanup,
        command_id: Ulid,
    ) -> Self {
        Self {
            reader,
            cleanup: Some(cleanup),
            command_id,
        }
    }

    #[must_use]
    pub const fn command_id(&self) -> Ulid {
        self.command_id
    }

    #[must_use]
    pub fn field_count(&self) -> usize {
        self.reader.field_count()
    }

    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.cleanup.is_none()
    }

    pub fn read(&mut self) -> Result<bool, ProviderError> {
        if self.is_closed() {
            return Ok(false);
        }

        self.reader.read()
    }

    pub async fn read_async(&mut self, cancel: &CancellationToken) -> Result<bool, ProviderError> {
        if self.is_closed() {
            return Ok(false);
        }

        self.reader.read_async(cancel).await
    }

    #[must_use]
    pub fn get_value(&self, ordinal: usize) -> RawValue {
        self.reader.get_value(ordinal)
    }

    /// Current row with provider nulls normalized.
    #[must_use]
    pub fn current_values(&self) -> Vec<Value> {
        (0..self.field_count())
            .map(|i| self.get_value(i).into_value())
            .collect()
    }

    pub fn close(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            self.reader.close();
            drop(cleanup);
        }
    }
}

impl Drop for RelationalDataReader {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for RelationalDataReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelationalDataReader")
            .field("command_id", &self.command_id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
