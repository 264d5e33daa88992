//! Module: query::context
//! Responsibility: per-compilation state shared by the translating visitors:
//! the select arena, query-source scopes, column offsets, and options.
//! Does not own: clause translation rules (see `query::visitor`).
//! Boundary: one context per `compile` call; nothing outlives it except the
//! finished plan.

mod arena;


use crate::{
    config::QueryOptions,
    model::Model,
    obs::DiagnosticsSink,
    query::{
        Expr, QuerySourceId, SourceAllocator,
        sql::AliasGenerator,
    },
    storage::SqlDialect,
};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::Arc,
};

// re-exports
pub use arena::{SelectArena, SelectId};

///
/// ProviderCapabilities
///

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ProviderCapabilities {
    /// `CROSS JOIN LATERAL` over correlated derived tables.
    pub lateral_join: bool,

    /// Several readers may stay open on one connection.
    pub multiple_active_result_sets: bool,
}

impl ProviderCapabilities {
    #[must_use]
    pub const fn with_lateral_join(mut self, enabled: bool) -> Self {
        self.lateral_join = enabled;
        self
    }

    #[must_use]
    pub const fn with_multiple_active_result_sets(mut self, enabled: bool) -> Self {
        self.multiple_active_result_sets = enabled;
        self
    }
}

///
/// MethodProvider
///
/// Operator family a plan is compiled for.
///

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum MethodProvider {
    #[default]
    Sync,
    Async,
}

impl fmt::Display for MethodProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync => write!(f, "sync"),
            Self::Async => write!(f, "async"),
        }
    }
}

///
/// ScopeId
///

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ScopeId(usize);

#[derive(Debug, Default)]
struct ScopeData {
    parent: Option<ScopeId>,
    sources: BTreeMap<QuerySourceId, Option<SelectId>>,
}

///
/// QueryCompilationContext
///

pub struct QueryCompilationContext {
    model: Arc<Model>,
    capabilities: ProviderCapabilities,
    options: QueryOptions,
    sink: Arc<dyn DiagnosticsSink>,
    dialect: Arc<dyn SqlDialect>,
    method_provider: MethodProvider,

    pub(crate) arena: SelectArena,
    pub(crate) aliases: AliasGenerator,

    /// Start column of each query source's block within its select.
    pub(crate) offsets: BTreeMap<QuerySourceId, usize>,

    scopes: Vec<ScopeData>,
    sources: SourceAllocator,
    source_types: BTreeMap<QuerySourceId, String>,
    materialized: BTreeSet<QuerySourceId>,
    projections: BTreeMap<QuerySourceId, Expr>,
    outer_parameter_names: BTreeSet<String>,
    replaying: bool,
}

impl QueryCompilationContext {
    #[must_use]
    pub fn new(
        model: Arc<Model>,
        capabilities: ProviderCapabilities,
        options: QueryOptions,
        sink: Arc<dyn DiagnosticsSink>,
        dialect: Arc<dyn SqlDialect>,
        method_provider: MethodProvider,
    ) -> Self {
        Self {
            model,
            capabilities,
            options,
            sink,
            dialect,
            method_provider,
            arena: SelectArena::new(),
            aliases: AliasGenerator::new(),
            offsets: BTreeMap::new(),
            scopes: vec![ScopeData::default()],
            sources: SourceAllocator::new(),
            source_types: BTreeMap::new(),
            materialized: BTreeSet::new(),
            projections: BTreeMap::new(),
            outer_parameter_names: BTreeSet::new(),
            replaying: false,
        }
    }

    /// Synthetic query sources start above every id a query model declares.
    #[must_use]
    pub fn with_sources_above(mut self, highest: QuerySourceId) -> Self {
        self.sources = SourceAllocator::starting_at(highest.get() + 1);
        self
    }

    #[must_use]
    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    #[must_use]
    pub const fn capabilities(&self) -> ProviderCapabilities {
        self.capabilities
    }

    #[must_use]
    pub const fn options(&self) -> &QueryOptions {
        &self.options
    }

    #[must_use]
    pub fn sink(&self) -> &dyn DiagnosticsSink {
        self.sink.as_ref()
    }

    #[must_use]
    pub fn dialect(&self) -> &dyn SqlDialect {
        self.dialect.as_ref()
    }

    #[must_use]
    pub const fn method_provider(&self) -> MethodProvider {
        self.method_provider
    }

    ///
    /// SCOPES
    ///

    #[must_use]
    pub const fn root_scope(&self) -> ScopeId {
        ScopeId(0)
    }

    pub fn child_scope(&mut self, parent: ScopeId) -> ScopeId {
        self.scopes.push(ScopeData {
            parent: Some(parent),
            sources: BTreeMap::new(),
        });

        ScopeId(self.scopes.len() - 1)
    }

    /// Bind `source` in `scope`. `None` marks a source produced on the
    /// client with no select behind it.
    pub fn bind_source(&mut self, scope: ScopeId, source: QuerySourceId, select: Option<SelectId>) {
        if let Some(data) = self.scopes.get_mut(scope.0) {
            data.sources.insert(source, select);
        }
    }

    /// Live select producing `source`, searching enclosing scopes.
    #[must_use]
    pub fn select_for(&self, scope: ScopeId, source: QuerySourceId) -> Option<SelectId> {
        let mut current = Some(scope);
        while let Some(id) = current {
            let data = self.scopes.get(id.0)?;
            if let Some(binding) = data.sources.get(&source) {
                return binding.map(|select| self.arena.resolve(select));
            }
            current = data.parent;
        }

        None
    }

    /// True when `source` is bound by an enclosing scope rather than `scope`.
    #[must_use]
    pub fn is_outer(&self, scope: ScopeId, source: QuerySourceId) -> bool {
        let Some(data) = self.scopes.get(scope.0) else {
            return false;
        };
        if data.sources.contains_key(&source) {
            return false;
        }

        let mut current = data.parent;
        while let Some(id) = current {
            let Some(parent) = self.scopes.get(id.0) else {
                return false;
            };
            if parent.sources.contains_key(&source) {
                return true;
            }
            current = parent.parent;
        }

        false
    }

    /// Every query source, in any scope, whose rows come from `select`.
    #[must_use]
    pub fn sources_of(&self, select: SelectId) -> Vec<QuerySourceId> {
        let target = self.arena.resolve(select);
        let mut out: Vec<QuerySourceId> = self
            .scopes
            .iter()
            .flat_map(|scope| scope.sources.iter())
            .filter(|(_, bound)| bound.is_some_and(|s| self.arena.resolve(s) == target))
            .map(|(source, _)| *source)
            .collect();
        out.sort_unstable();
        out.dedup();

        out
    }

    pub fn shift_offsets(&mut self, sources: &[QuerySourceId], by: usize) {
        for source in sources {
            if let Some(offset) = self.offsets.get_mut(source) {
                *offset += by;
            }
        }
    }

    pub fn allocate_source(&self) -> QuerySourceId {
        self.sources.next()
    }

    ///
    /// SOURCE FACTS
    ///

    #[must_use]
    pub fn source_type(&self, source: QuerySourceId) -> Option<&str> {
        self.source_types.get(&source).map(String::as_str)
    }

    pub fn set_source_type(&mut self, source: QuerySourceId, entity_type: impl Into<String>) {
        self.source_types.insert(source, entity_type.into());
    }

    #[must_use]
    pub fn is_materialized(&self, source: QuerySourceId) -> bool {
        self.materialized.contains(&source)
    }

    pub fn mark_materialized(&mut self, source: QuerySourceId) -> bool {
        self.materialized.insert(source)
    }

    /// Selector of a lifted subquery whose source is not an entity.
    #[must_use]
    pub fn projection_of(&self, source: QuerySourceId) -> Option<&Expr> {
        self.projections.get(&source)
    }

    pub fn set_projection(&mut self, source: QuerySourceId, selector: Expr) {
        self.projections.insert(source, selector);
    }

    #[must_use]
    pub const fn outer_parameter_names(&self) -> &BTreeSet<String> {
        &self.outer_parameter_names
    }

    pub fn commit_outer_parameter(&mut self, name: impl Into<String>) {
        self.outer_parameter_names.insert(name.into());
    }

    /// While replaying, client-evaluation notifications are suppressed.
    #[must_use]
    pub const fn is_replaying(&self) -> bool {
        self.replaying
    }

    pub const fn set_replaying(&mut self, replaying: bool) -> bool {
        let previous = self.replaying;
        self.replaying = replaying;
        previous
    }
}
