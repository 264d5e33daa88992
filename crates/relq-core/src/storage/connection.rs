use crate::storage::provider::{DbCommand, DbConnection, ProviderError, TransactionId};
use parking_lot::Mutex;
use std::{fmt, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

///
/// RelationalConnection
///
/// Shared handle over one physical provider connection. Open and close
/// are reference-counted: the physical connection opens on the first
/// `open` and closes when the last holder calls `close`.
///

#[derive(Clone)]
pub struct RelationalConnection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    db: Box<dyn DbConnection>,
    state: Mutex<ConnectionState>,
}

#[derive(Debug, Default)]
struct ConnectionState {
    open_count: usize,
    transaction: Option<TransactionId>,
    command_timeout: Option<Duration>,
}

impl RelationalConnection {
    #[must_use]
    pub fn new(db: impl DbConnection + 'static) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                db: Box::new(db),
                state: Mutex::new(ConnectionState::default()),
            }),
        }
    }

    #[must_use]
    pub fn supports_multiple_active_result_sets(&self) -> bool {
        self.inner.db.supports_multiple_active_result_sets()
    }

    #[must_use]
    pub fn current_transaction(&self) -> Option<TransactionId> {
        self.inner.state.lock().transaction
    }

    pub fn set_transaction(&self, transaction: Option<TransactionId>) {
        self.inner.state.lock().transaction = transaction;
    }

    #[must_use]
    pub fn command_timeout(&self) -> Option<Duration> {
        self.inner.state.lock().command_timeout
    }

    pub fn set_command_timeout(&self, timeout: Option<Duration>) {
        self.inner.state.lock().command_timeout = timeout;
    }

    #[must_use]
    pub fn open_count(&self) -> usize {
        self.inner.state.lock().open_count
    }

    pub(crate) fn create_command(&self) -> Result<Box<dyn DbCommand>, ProviderError> {
        self.inner.db.create_command()
    }

    pub fn open(&self) -> Result<(), ProviderError> {
        if self.acquire() {
            self.inner.db.open().inspect_err(|_| self.release())?;
        }

        Ok(())
    }

    /// Async `open`. Dropping the future before the physical open finishes
    /// gives the reference back.
    pub async fn open_async(&self, cancel: &CancellationToken) -> Result<(), ProviderError> {
        if self.acquire() {
            let pending = PendingOpen {
                connection: self,
                committed: false,
            };
            self.inner.db.open_async(cancel).await?;
            pending.commit();
        }

        Ok(())
    }

    /// Drop one open reference; the last reference closes the physical connection.
    pub fn close(&self) -> Result<(), ProviderError> {
        let last = {
            let mut state = self.inner.state.lock();
            if state.open_count == 0 {
                return Ok(());
            }
            state.open_count -= 1;
            state.open_count == 0
        };

        if last {
            self.inner.db.close()?;
        }

        Ok(())
    }

    // Returns true when this call must perform the physical open.
    fn acquire(&self) -> bool {
        let mut state = self.inner.state.lock();
        state.open_count += 1;
        state.open_count == 1
    }

    fn release(&self) {
        let mut state = self.inner.state.lock();
        state.open_count = state.open_count.saturating_sub(1);
    }
}

///
/// PendingOpen
///
/// Reference taken by an async open that has not completed yet; released
/// on drop unless committed.
///

struct PendingOpen<'a> {
    connection: &'a RelationalConnection,
    committed: bool,
}

impl PendingOpen<'_> {
    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for PendingOpen<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.connection.release();
        }
    }
}

impl fmt::Debug for RelationalConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelationalConnection")
            .field("state", &*self.inner.state.lock())
            .finish_non_exhaustive()
    }
}
