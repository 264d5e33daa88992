use crate::{
    config::QueryOptions,
    error::InternalError,
    exec::{
        ExecutionError,
        buffer::{FixupQueryBuffer, QueryBuffer},
        cursor::{Cursor, CursorRegistry},
    },
    model::Model,
    obs::{DiagnosticEvent, DiagnosticsSink, TracingSink},
    query::ValueBuffer,
    storage::{
        AnsiDialect, CommandContext, DefaultTypeMappingSource, ParamValue, ParameterValues,
        RelationalCommand, RelationalConnection, SqlDialect, TypeMappingSource,
    },
    value::Value,
};
use parking_lot::Mutex;
use std::{fmt, sync::Arc};
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tokio_util::sync::CancellationToken;

///
/// QueryContextBuilder
///

pub struct QueryContextBuilder {
    model: Arc<Model>,
    connection: RelationalConnection,
    type_mappings: Arc<dyn TypeMappingSource>,
    dialect: Arc<dyn SqlDialect>,
    sink: Arc<dyn DiagnosticsSink>,
    options: QueryOptions,
    query_buffer: Arc<dyn QueryBuffer>,
    parameters: ParameterValues,
}

impl QueryContextBuilder {
    #[must_use]
    pub fn new(model: Arc<Model>, connection: RelationalConnection) -> Self {
        Self {
            model,
            connection,
            type_mappings: Arc::new(DefaultTypeMappingSource),
            dialect: Arc::new(AnsiDialect),
            sink: Arc::new(TracingSink::new()),
            options: QueryOptions::default(),
            query_buffer: Arc::new(FixupQueryBuffer::new()),
            parameters: ParameterValues::new(),
        }
    }

    #[must_use]
    pub fn type_mappings(mut self, type_mappings: Arc<dyn TypeMappingSource>) -> Self {
        self.type_mappings = type_mappings;
        self
    }

    #[must_use]
    pub fn dialect(mut self, dialect: Arc<dyn SqlDialect>) -> Self {
        self.dialect = dialect;
        self
    }

    #[must_use]
    pub fn sink(mut self, sink: Arc<dyn DiagnosticsSink>) -> Self {
        self.sink = sink;
        self
    }

    #[must_use]
    pub fn options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn query_buffer(mut self, query_buffer: Arc<dyn QueryBuffer>) -> Self {
        self.query_buffer = query_buffer;
        self
    }

    /// Values for the parameters the query itself declares.
    #[must_use]
    pub fn parameters(mut self, parameters: ParameterValues) -> Self {
        self.parameters = parameters;
        self
    }

    #[must_use]
    pub fn build(self) -> Arc<QueryContext> {
        let (core, parameters) = self.into_core();

        Arc::new(QueryContext {
            core,
            state: Mutex::new(ContextState::new(parameters)),
        })
    }

    #[must_use]
    pub fn build_async(self) -> Arc<AsyncQueryContext> {
        let (core, parameters) = self.into_core();

        Arc::new(AsyncQueryContext {
            core,
            state: Mutex::new(ContextState::new(parameters)),
            registration: Semaphore::new(1),
        })
    }

    fn into_core(self) -> (ContextCore, ParameterValues) {
        let core = ContextCore {
            model: self.model,
            connection: self.connection,
            type_mappings: self.type_mappings,
            dialect: self.dialect,
            sink: self.sink,
            options: self.options,
            query_buffer: self.query_buffer,
        };

        (core, self.parameters)
    }
}

///
/// ContextCore
///
/// Collaborators shared by both context flavours.
///

pub(crate) struct ContextCore {
    model: Arc<Model>,
    connection: RelationalConnection,
    type_mappings: Arc<dyn TypeMappingSource>,
    dialect: Arc<dyn SqlDialect>,
    sink: Arc<dyn DiagnosticsSink>,
    options: QueryOptions,
    query_buffer: Arc<dyn QueryBuffer>,
}

impl ContextCore {
    fn command_context(&self) -> CommandContext<'_> {
        CommandContext {
            connection: &self.connection,
            type_mappings: self.type_mappings.as_ref(),
            dialect: self.dialect.as_ref(),
            sink: self.sink.as_ref(),
            options: &self.options,
        }
    }

    fn needs_buffering(&self) -> bool {
        !self.connection.supports_multiple_active_result_sets()
    }

    fn record_buffered(&self, rows: usize) {
        self.sink.record(&DiagnosticEvent::CursorBuffered { rows });
    }
}

///
/// ContextState
///
/// Mutable per-execution state: registered parameter values and the
/// open cursors.
///

struct ContextState<C> {
    parameters: ParameterValues,
    cursors: CursorRegistry<C>,
}

impl<C> ContextState<C> {
    fn new(parameters: ParameterValues) -> Self {
        Self {
            parameters,
            cursors: CursorRegistry::default(),
        }
    }

    fn inject(&mut self, names: &[String], values: Vec<Value>) -> SavedParameters {
        let mut saved = Vec::with_capacity(names.len());
        for (name, value) in names.iter().zip(values) {
            let previous = self.parameters.insert(name.clone(), ParamValue::Value(value));
            saved.push((name.clone(), previous));
        }

        SavedParameters(saved)
    }

    fn restore(&mut self, saved: SavedParameters) {
        for (name, previous) in saved.0.into_iter().rev() {
            match previous {
                Some(value) => {
                    self.parameters.insert(name, value);
                }
                None => {
                    self.parameters.remove(&name);
                }
            }
        }
    }
}

/// Parameter values shadowed by an injection, restored when it ends.
#[derive(Debug, Default)]
pub(crate) struct SavedParameters(Vec<(String, Option<ParamValue>)>);

/// Client view of a registered parameter value.
fn client_value(value: &ParamValue) -> Value {
    match value {
        ParamValue::Value(value) => value.clone(),
        ParamValue::Array(items) => Value::List(items.iter().map(client_value).collect()),
        ParamValue::Native(parameter) => parameter.value.clone(),
    }
}

macro_rules! context_accessors {
    () => {
        #[must_use]
        pub fn model(&self) -> &Arc<Model> {
            &self.core.model
        }

        #[must_use]
        pub const fn connection(&self) -> &RelationalConnection {
            &self.core.connection
        }

        #[must_use]
        pub const fn options(&self) -> &QueryOptions {
            &self.core.options
        }

        #[must_use]
        pub fn sink(&self) -> &dyn DiagnosticsSink {
            self.core.sink.as_ref()
        }

        #[must_use]
        pub fn query_buffer(&self) -> &dyn QueryBuffer {
            self.core.query_buffer.as_ref()
        }

        pub fn set_parameter(&self, name: impl Into<String>, value: impl Into<ParamValue>) {
            self.state.lock().parameters.insert(name.into(), value.into());
        }

        #[must_use]
        pub fn parameter(&self, name: &str) -> Option<ParamValue> {
            self.state.lock().parameters.get(name).cloned()
        }

        /// Number of provider cursors currently registered.
        #[must_use]
        pub fn active_cursors(&self) -> usize {
            self.state.lock().cursors.len()
        }

        pub(crate) fn client_parameter(&self, name: &str) -> Option<Value> {
            self.state.lock().parameters.get(name).map(client_value)
        }

        pub(crate) fn inject_parameters(&self, names: &[String], values: Vec<Value>) -> SavedParameters {
            self.state.lock().inject(names, values)
        }

        pub(crate) fn restore_parameters(&self, saved: SavedParameters) {
            self.state.lock().restore(saved);
        }

        /// Command id of the cursor feeding include depth `depth`.
        #[must_use]
        pub fn include_cursor_id(&self, depth: usize) -> Option<ulid::Ulid> {
            let cursor = self.state.lock().cursors.include_cursor(depth).cloned()?;
            Self::cursor_id(&cursor)
        }
    };
}

///
/// QueryContext
///
/// Per-execution state of the synchronous operator family.
///

pub struct QueryContext {
    core: ContextCore,
    state: Mutex<ContextState<Mutex<Cursor>>>,
}

impl QueryContext {
    #[must_use]
    pub fn builder(model: Arc<Model>, connection: RelationalConnection) -> QueryContextBuilder {
        QueryContextBuilder::new(model, connection)
    }

    context_accessors!();

    fn cursor_id(cursor: &Arc<Mutex<Cursor>>) -> Option<ulid::Ulid> {
        Some(cursor.lock().command_id())
    }

    /// Execute `command` and register its reader. Without MARS, every
    /// cursor still open is drained into memory first.
    pub(crate) fn open_cursor(
        self: &Arc<Self>,
        command: &RelationalCommand,
        include_depth: Option<usize>,
    ) -> Result<SyncCursor, ExecutionError> {
        if self.core.needs_buffering() {
            let earlier = self.state.lock().cursors.active();
            for cursor in earlier {
                let mut cursor = cursor.lock();
                if cursor.is_open() {
                    let rows = cursor.buffer_all()?;
                    self.core.record_buffered(rows);
                }
            }
        }

        let values = self.state.lock().parameters.clone();
        let reader = command.execute_reader(&self.core.command_context(), Some(&values))?;
        let cursor = Arc::new(Mutex::new(Cursor::new(reader)));
        self.state.lock().cursors.register(&cursor, include_depth);

        Ok(SyncCursor {
            ctx: Arc::clone(self),
            cursor,
        })
    }

    fn release(&self, cursor: &Arc<Mutex<Cursor>>) {
        self.state.lock().cursors.deregister(cursor);
        cursor.lock().close();
    }
}

impl fmt::Debug for QueryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryContext")
            .field("connection", &self.core.connection)
            .field("active_cursors", &self.active_cursors())
            .finish_non_exhaustive()
    }
}

///
/// SyncCursor
///
/// Registered cursor; dropping it deregisters and closes the reader.
///

pub(crate) struct SyncCursor {
    ctx: Arc<QueryContext>,
    cursor: Arc<Mutex<Cursor>>,
}

impl SyncCursor {
    pub(crate) fn next_row(&self) -> Result<Option<ValueBuffer>, ExecutionError> {
        Ok(self.cursor.lock().next_row()?)
    }
}

impl Drop for SyncCursor {
    fn drop(&mut self) {
        self.ctx.release(&self.cursor);
    }
}

///
/// AsyncQueryContext
///
/// Per-execution state of the asynchronous operator family. One permit
/// serializes cursor registration.
///

pub struct AsyncQueryContext {
    core: ContextCore,
    state: Mutex<ContextState<AsyncMutex<Cursor>>>,
    registration: Semaphore,
}

impl AsyncQueryContext {
    #[must_use]
    pub fn builder(model: Arc<Model>, connection: RelationalConnection) -> QueryContextBuilder {
        QueryContextBuilder::new(model, connection)
    }

    context_accessors!();

    fn cursor_id(cursor: &Arc<AsyncMutex<Cursor>>) -> Option<ulid::Ulid> {
        cursor.try_lock().ok().map(|c| c.command_id())
    }

    pub(crate) async fn open_cursor(
        self: &Arc<Self>,
        command: &RelationalCommand,
        include_depth: Option<usize>,
        cancel: &CancellationToken,
    ) -> Result<AsyncCursor, ExecutionError> {
        let _permit = self
            .registration
            .acquire()
            .await
            .map_err(|_| InternalError::executor_invariant("cursor registration is closed"))?;

        if self.core.needs_buffering() {
            let earlier = self.state.lock().cursors.active();
            for cursor in earlier {
                let mut cursor = cursor.lock().await;
                if cursor.is_open() {
                    let rows = cursor.buffer_all_async(cancel).await?;
                    self.core.record_buffered(rows);
                }
            }
        }

        let values = self.state.lock().parameters.clone();
        let reader = command
            .execute_reader_async(&self.core.command_context(), Some(&values), cancel)
            .await?;
        let cursor = Arc::new(AsyncMutex::new(Cursor::new(reader)));
        self.state.lock().cursors.register(&cursor, include_depth);

        Ok(AsyncCursor {
            ctx: Arc::clone(self),
            cursor,
        })
    }

    fn release(&self, cursor: &Arc<AsyncMutex<Cursor>>) {
        self.state.lock().cursors.deregister(cursor);
        if let Ok(mut cursor) = cursor.try_lock() {
            cursor.close();
        }
    }
}

impl fmt::Debug for AsyncQueryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncQueryContext")
            .field("connection", &self.core.connection)
            .field("active_cursors", &self.active_cursors())
            .finish_non_exhaustive()
    }
}

///
/// AsyncCursor
///

pub(crate) struct AsyncCursor {
    ctx: Arc<AsyncQueryContext>,
    cursor: Arc<AsyncMutex<Cursor>>,
}

impl AsyncCursor {
    pub(crate) async fn next_row(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<ValueBuffer>, ExecutionError> {
        let mut cursor = self.cursor.lock().await;

        Ok(cursor.next_row_async(cancel).await?)
    }
}

impl Drop for AsyncCursor {
    fn drop(&mut self) {
        self.ctx.release(&self.cursor);
    }
}
