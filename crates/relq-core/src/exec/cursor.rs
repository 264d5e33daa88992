use crate::{
    query::ValueBuffer,
    storage::{ProviderError, RelationalDataReader},
};
use std::{collections::VecDeque, sync::Arc};
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

///
/// Cursor
///
/// One open provider reader plus the rows pulled ahead of the consumer
/// when the connection had to be released.
///

#[derive(Debug)]
pub(crate) struct Cursor {
    command_id: Ulid,
    reader: Option<RelationalDataReader>,
    buffered: VecDeque<ValueBuffer>,
}

impl Cursor {
    pub(crate) fn new(reader: RelationalDataReader) -> Self {
        Self {
            command_id: reader.command_id(),
            reader: Some(reader),
            buffered: VecDeque::new(),
        }
    }

    #[must_use]
    pub(crate) const fn command_id(&self) -> Ulid {
        self.command_id
    }

    /// True while the provider reader is still attached.
    #[must_use]
    pub(crate) const fn is_open(&self) -> bool {
        self.reader.is_some()
    }

    /// Next row: buffered rows first, then the reader. The reader closes
    /// as soon as it is exhausted.
    pub(crate) fn next_row(&mut self) -> Result<Option<ValueBuffer>, ProviderError> {
        if let Some(row) = self.buffered.pop_front() {
            return Ok(Some(row));
        }
        let Some(reader) = self.reader.as_mut() else {
            return Ok(None);
        };

        if reader.read()? {
            return Ok(Some(ValueBuffer::new(reader.current_values())));
        }
        self.close();

        Ok(None)
    }

    pub(crate) async fn next_row_async(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<ValueBuffer>, ProviderError> {
        if let Some(row) = self.buffered.pop_front() {
            return Ok(Some(row));
        }
        let Some(reader) = self.reader.as_mut() else {
            return Ok(None);
        };

        if reader.read_async(cancel).await? {
            return Ok(Some(ValueBuffer::new(reader.current_values())));
        }
        self.close();

        Ok(None)
    }

    /// Drain the reader into memory and release it. Returns the number of
    /// rows pulled.
    pub(crate) fn buffer_all(&mut self) -> Result<usize, ProviderError> {
        let mut rows = 0;
        if let Some(reader) = self.reader.as_mut() {
            while reader.read()? {
                self.buffered.push_back(ValueBuffer::new(reader.current_values()));
                rows += 1;
            }
        }
        self.close();

        Ok(rows)
    }

    pub(crate) async fn buffer_all_async(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<usize, ProviderError> {
        let mut rows = 0;
        if let Some(reader) = self.reader.as_mut() {
            while reader.read_async(cancel).await? {
                self.buffered.push_back(ValueBuffer::new(reader.current_values()));
                rows += 1;
            }
        }
        self.close();

        Ok(rows)
    }

    pub(crate) fn close(&mut self) {
        if let Some(mut reader) = self.reader.take() {
            reader.close();
        }
    }
}

///
/// CursorRegistry
///
/// Open cursors of one query context in registration order, plus the
/// include cursors indexed by 1-based include depth.
///

#[derive(Debug)]
pub(crate) struct CursorRegistry<T> {
    active: Vec<Arc<T>>,
    includes: Vec<Option<Arc<T>>>,
}

impl<T> Default for CursorRegistry<T> {
    fn default() -> Self {
        Self {
            active: Vec::new(),
            includes: Vec::new(),
        }
    }
}

impl<T> CursorRegistry<T> {
    /// Cursors registered before the next registration.
    #[must_use]
    pub(crate) fn active(&self) -> Vec<Arc<T>> {
        self.active.clone()
    }

    #[must_use]
    pub(crate) fn len(&self) -> usize {
        self.active.len()
    }

    pub(crate) fn register(&mut self, cursor: &Arc<T>, include_depth: Option<usize>) {
        self.active.push(Arc::clone(cursor));

        if let Some(depth) = include_depth.filter(|d| *d > 0) {
            if self.includes.len() < depth {
                self.includes.resize_with(depth, || None);
            }
            self.includes[depth - 1] = Some(Arc::clone(cursor));
        }
    }

    pub(crate) fn deregister(&mut self, cursor: &Arc<T>) {
        self.active.retain(|c| !Arc::ptr_eq(c, cursor));
        for slot in &mut self.includes {
            if slot.as_ref().is_some_and(|c| Arc::ptr_eq(c, cursor)) {
                *slot = None;
            }
        }
    }

    #[must_use]
    pub(crate) fn include_cursor(&self, depth: usize) -> Option<&Arc<T>> {
        depth
            .checked_sub(1)
            .and_then(|i| self.includes.get(i))
            .and_then(Option::as_ref)
    }
}
