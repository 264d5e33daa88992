//! Module: query::compiler
//! Responsibility: the public compile entry point and the compiled query
//! handed to the execution layer.
//! Does not own: clause translation (see `query::visitor`) or operator
//! semantics (see `exec`).
//! Boundary: a `CompiledQuery` only runs in the mode it was compiled for.

use crate::{
    config::QueryOptions,
    exec::{self, AsyncQueryContext, AsyncQueryStream, ExecutionError, QueryContext, QueryStream},
    model::Model,
    obs::{DiagnosticsSink, TracingSink},
    query::{
        ClientEvalFlags, MethodProvider, ProviderCapabilities, QueryError, QueryModel, QueryPlan,
        QuerySourceId, SelectExpression,
        context::QueryCompilationContext,
        visitor::compile_plan,
    },
    storage::{AnsiDialect, SqlDialect},
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

///
/// QueryCompiler
///
/// Compiles query models against one entity model and provider profile.
/// Cheap to clone; every `compile` call gets a fresh compilation context.
///

#[derive(Clone)]
pub struct QueryCompiler {
    model: Arc<Model>,
    capabilities: ProviderCapabilities,
    options: QueryOptions,
    sink: Arc<dyn DiagnosticsSink>,
    dialect: Arc<dyn SqlDialect>,
}

impl QueryCompiler {
    #[must_use]
    pub fn new(model: Arc<Model>) -> Self {
        Self {
            model,
            capabilities: ProviderCapabilities::default(),
            options: QueryOptions::default(),
            sink: Arc::new(TracingSink::new()),
            dialect: Arc::new(AnsiDialect),
        }
    }

    #[must_use]
    pub const fn with_capabilities(mut self, capabilities: ProviderCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    #[must_use]
    pub fn with_options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn DiagnosticsSink>) -> Self {
        self.sink = sink;
        self
    }

    #[must_use]
    pub fn with_dialect(mut self, dialect: Arc<dyn SqlDialect>) -> Self {
        self.dialect = dialect;
        self
    }

    #[must_use]
    pub const fn options(&self) -> &QueryOptions {
        &self.options
    }

    /// Compile `query` for the synchronous operator family.
    pub fn compile(&self, query: &QueryModel) -> Result<CompiledQuery, QueryError> {
        self.compile_for(query, MethodProvider::Sync)
    }

    /// Compile `query` for the asynchronous operator family.
    pub fn compile_async(&self, query: &QueryModel) -> Result<CompiledQuery, QueryError> {
        self.compile_for(query, MethodProvider::Async)
    }

    fn compile_for(&self, query: &QueryModel, mode: MethodProvider) -> Result<CompiledQuery, QueryError> {
        let highest = query
            .declared_sources()
            .into_iter()
            .max()
            .unwrap_or(QuerySourceId::new(0));

        let mut ctx = QueryCompilationContext::new(
            Arc::clone(&self.model),
            self.capabilities,
            self.options.clone(),
            Arc::clone(&self.sink),
            Arc::clone(&self.dialect),
            mode,
        )
        .with_sources_above(highest);

        let (mut plan, flags) = compile_plan(&mut ctx, query)?;

        let mut selects = Vec::new();
        plan.walk_mut(&mut |node| {
            if let QueryPlan::Shaped(shaped) = node
                && let Some(select) = ctx.arena.get(shaped.select)
            {
                selects.push(select.clone());
            }
        });

        Ok(CompiledQuery {
            plan: Arc::new(plan),
            mode,
            flags,
            selects,
        })
    }
}

///
/// CompiledQuery
///

#[derive(Clone, Debug)]
pub struct CompiledQuery {
    plan: Arc<QueryPlan>,
    mode: MethodProvider,
    flags: ClientEvalFlags,
    selects: Vec<SelectExpression>,
}

impl CompiledQuery {
    #[must_use]
    pub fn plan(&self) -> &QueryPlan {
        &self.plan
    }

    #[must_use]
    pub const fn mode(&self) -> MethodProvider {
        self.mode
    }

    #[must_use]
    pub const fn flags(&self) -> ClientEvalFlags {
        self.flags
    }

    /// Selects read by the shaped leaves, in plan order.
    #[must_use]
    pub fn selects(&self) -> &[SelectExpression] {
        &self.selects
    }

    #[must_use]
    pub fn summary(&self) -> QuerySummary {
        let mut commands = Vec::new();
        let mut copy = (*self.plan).clone();
        copy.walk_mut(&mut |node| match node {
            QueryPlan::Shaped(shaped) => {
                if let Some(command) = &shaped.command {
                    commands.push(command.command_text().to_string());
                }
            }
            QueryPlan::Include { collections, .. } => {
                for collection in collections.iter() {
                    if let Some(command) = &collection.command {
                        commands.push(command.command_text().to_string());
                    }
                }
            }
            _ => {}
        });

        QuerySummary {
            flags: self.flags,
            commands,
            selects: self.selects.clone(),
            method_names: self.plan.method_names(),
        }
    }

    /// Stream the results synchronously.
    pub fn execute(&self, ctx: &Arc<QueryContext>) -> Result<QueryStream, ExecutionError> {
        self.expect_mode(MethodProvider::Sync)?;

        Ok(exec::start(ctx, &self.plan))
    }

    /// Stream the results asynchronously; `cancel` aborts pending reads.
    pub fn execute_async(
        &self,
        ctx: &Arc<AsyncQueryContext>,
        cancel: CancellationToken,
    ) -> Result<AsyncQueryStream, ExecutionError> {
        self.expect_mode(MethodProvider::Async)?;

        Ok(exec::start_async(ctx, cancel, &self.plan))
    }

    const fn expect_mode(&self, requested: MethodProvider) -> Result<(), ExecutionError> {
        match (self.mode, requested) {
            (MethodProvider::Sync, MethodProvider::Sync)
            | (MethodProvider::Async, MethodProvider::Async) => Ok(()),
            (compiled, requested) => Err(ExecutionError::ModeMismatch {
                compiled,
                requested,
            }),
        }
    }
}

///
/// QuerySummary
///
/// Inspection view of a compiled query.
///

#[derive(Clone, Debug)]
pub struct QuerySummary {
    pub flags: ClientEvalFlags,

    /// SQL of every command in plan order, root first.
    pub commands: Vec<String>,
    pub selects: Vec<SelectExpression>,
    pub method_names: Vec<&'static str>,
}

impl QuerySummary {
    /// The only command, when the query compiled to exactly one.
    #[must_use]
    pub fn single_command(&self) -> Option<&str> {
        match self.commands.as_slice() {
            [command] => Some(command.as_str()),
            _ => None,
        }
    }
}
