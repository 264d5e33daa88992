//! Module: query::visitor
//! Responsibility: walk a query model clause by clause, translating what
//! SQL can express onto selects and lowering the rest into client plan
//! operators.
//! Does not own: expression translation (see `query::translate`) or SQL
//! text (see `query::sql`).
//! Boundary: one root visitor per compilation; child visitors share the
//! compilation context and report back a `Compiled` outcome.

mod analysis;
mod clauses;
mod include;
mod joins;
mod lower;
mod result_ops;

#[cfg(test)]
mod tests;

use crate::{
    config::ClientEvalPolicy,
    error::InternalError,
    obs::DiagnosticEvent,
    query::{
        ClientEvalClause, ClientExpr, Expr, QueryError, QueryModel, QueryPlan, QuerySourceId,
        SelectExpression, ShapedQuery, Shaper,
        context::{QueryCompilationContext, ScopeId, SelectId},
        plan::{ClientOp, CollectionInclude},
        sql::{SqlExpr, generate_command},
        translate::SqlTranslator,
    },
    value::Value,
};
use std::sync::Arc;

///
/// ClientEvalFlags
///
/// Sticky per-clause markers recording which parts of a query run on the
/// client. `requires_client_eval` overrides every clause flag.
///

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ClientEvalFlags {
    pub select_many: bool,
    pub join: bool,
    pub filter: bool,
    pub projection: bool,
    pub order_by: bool,
    pub result_operator: bool,
    pub requires_client_eval: bool,
}

impl ClientEvalFlags {
    #[must_use]
    pub const fn requires(&self, clause: ClientEvalClause) -> bool {
        self.requires_client_eval || self.clause(clause)
    }

    /// True when any part of the query runs on the client.
    #[must_use]
    pub const fn any(&self) -> bool {
        self.select_many
            || self.join
            || self.filter
            || self.projection
            || self.order_by
            || self.result_operator
            || self.requires_client_eval
    }

    const fn clause(&self, clause: ClientEvalClause) -> bool {
        match clause {
            ClientEvalClause::SelectMany => self.select_many,
            ClientEvalClause::Join => self.join,
            ClientEvalClause::Filter => self.filter,
            ClientEvalClause::Projection => self.projection,
            ClientEvalClause::OrderBy => self.order_by,
            ClientEvalClause::ResultOperator => self.result_operator,
        }
    }

    // Returns true when the flag was newly set.
    const fn set(&mut self, clause: ClientEvalClause) -> bool {
        let flag = match clause {
            ClientEvalClause::SelectMany => &mut self.select_many,
            ClientEvalClause::Join => &mut self.join,
            ClientEvalClause::Filter => &mut self.filter,
            ClientEvalClause::Projection => &mut self.projection,
            ClientEvalClause::OrderBy => &mut self.order_by,
            ClientEvalClause::ResultOperator => &mut self.result_operator,
        };
        let newly = !*flag;
        *flag = true;

        newly
    }
}

///
/// Compiled
///
/// Outcome of one visitor run. Parents lift a child's select from here
/// or fall back to its client plan.
///

pub(crate) struct Compiled {
    pub flags: ClientEvalFlags,
    pub main_source: QuerySourceId,
    pub select: Option<SelectId>,
    pub live_selects: usize,
    pub rows_shaper: Option<Shaper>,
    pub selector: Expr,
    pub lowered_selector: Option<ClientExpr>,
    pub plan: QueryPlan,
    pub outer_parameters: Vec<(String, Expr)>,
    pub correlated: bool,
}

impl Compiled {
    /// True when nothing runs on the client and no outer values are needed.
    #[must_use]
    pub const fn is_inlinable(&self) -> bool {
        !self.flags.any() && self.outer_parameters.is_empty()
    }

    /// True when the parent can absorb this query's only select. An ordered
    /// select lifts only when a limit or offset pins its order to the rows.
    pub fn is_liftable(&self, ctx: &QueryCompilationContext) -> bool {
        self.select
            .and_then(|id| ctx.arena.get(id))
            .is_some_and(|select| {
                select.order_by().is_empty() || select.limit().is_some() || select.offset().is_some()
            })
            && self.is_inlinable()
            && self.live_selects == 1
            && self.rows_shaper.is_some()
    }
}

/// Compile `query` with the root visitor and finish the plan: shaper
/// offsets, include selects, predicate normalization, and commands.
pub(crate) fn compile_plan(
    ctx: &mut QueryCompilationContext,
    query: &QueryModel,
) -> Result<(QueryPlan, ClientEvalFlags), QueryError> {
    let model = Arc::clone(ctx.model());
    let query = analysis::rewrite_type_tests(&model, query);
    analysis::collect_source_types(ctx, &query);
    analysis::collect_materialization(ctx, &query);

    let root = ctx.root_scope();
    let compiled = QueryModelVisitor::new(ctx, root, false).run(&query)?;

    let mut plan = compiled.plan;
    finalize(ctx, &mut plan)?;

    Ok((plan, compiled.flags))
}

fn finalize(ctx: &mut QueryCompilationContext, plan: &mut QueryPlan) -> Result<(), QueryError> {
    let mut failure = None;

    plan.walk_mut(&mut |node| {
        if let QueryPlan::Include { collections, .. } = node {
            for collection in collections {
                match include::build_collection_select(ctx, collection) {
                    Ok(select) => collection.select = Some(select),
                    Err(err) => failure = Some(err),
                }
            }
        }
    });
    if let Some(err) = failure {
        return Err(err);
    }

    for id in ctx.arena.live_ids() {
        if let Some(select) = ctx.arena.get_mut(id) {
            select.normalize();
        }
    }

    plan.walk_mut(&mut |node| match node {
        QueryPlan::Shaped(shaped) => {
            shaped.shaper.set_offsets(&ctx.offsets);
            match command_for(ctx, shaped.select) {
                Ok(command) => shaped.command = Some(command),
                Err(err) => failure = Some(err),
            }
        }
        QueryPlan::Include { collections, .. } => {
            for collection in collections.iter_mut() {
                let Some(select) = collection.select else {
                    continue;
                };
                match command_for(ctx, select) {
                    Ok(command) => collection.command = Some(command),
                    Err(err) => failure = Some(err),
                }
            }
        }
        _ => {}
    });

    failure.map_or(Ok(()), Err)
}

fn command_for(
    ctx: &QueryCompilationContext,
    select: SelectId,
) -> Result<Arc<crate::storage::RelationalCommand>, QueryError> {
    let select = ctx
        .arena
        .get(select)
        .ok_or_else(|| InternalError::query_invariant(format!("{select} is not live")))?;

    Ok(Arc::new(generate_command(select, ctx.dialect())))
}

///
/// QueryModelVisitor
///

pub(crate) struct QueryModelVisitor<'c> {
    ctx: &'c mut QueryCompilationContext,
    scope: ScopeId,
    flags: ClientEvalFlags,

    bind_outer_properties: bool,
    bind_outer_parameters: bool,
    outer_parameters: Vec<(String, Expr)>,
    correlated: bool,

    main_source: QuerySourceId,
    select: Option<SelectId>,
    created: Vec<SelectId>,

    /// Plan yielding one `Row` of bindings per result row.
    rows: QueryPlan,
    selector: Expr,

    /// Plan over selected items, once a result operator needed one.
    items: Option<QueryPlan>,

    /// Set once client operators consume the SQL result; later result
    /// operators cannot reach the select anymore.
    sql_closed: bool,

    collections: Vec<CollectionInclude>,
}

impl<'c> QueryModelVisitor<'c> {
    fn new(ctx: &'c mut QueryCompilationContext, scope: ScopeId, is_child: bool) -> Self {
        Self {
            ctx,
            scope,
            flags: ClientEvalFlags::default(),
            bind_outer_properties: false,
            bind_outer_parameters: is_child,
            outer_parameters: Vec::new(),
            correlated: false,
            main_source: QuerySourceId::new(0),
            select: None,
            created: Vec::new(),
            rows: empty_plan(),
            selector: Expr::Current,
            items: None,
            sql_closed: false,
            collections: Vec::new(),
        }
    }

    /// Child visitor over `scope`; `lateral` binds outer columns directly
    /// instead of turning them into parameters.
    fn child(ctx: &'c mut QueryCompilationContext, scope: ScopeId, lateral: bool) -> Self {
        let mut visitor = Self::new(ctx, scope, true);
        visitor.bind_outer_properties = lateral;
        visitor.bind_outer_parameters = !lateral;
        visitor
    }

    fn run(mut self, query: &QueryModel) -> Result<Compiled, QueryError> {
        self.main_source = query.main_from.id;
        self.selector = query.select.clone();

        self.visit_main_from(&query.main_from)?;
        for clause in &query.body {
            self.visit_body_clause(clause)?;
        }
        self.visit_selector(&query.select)?;
        self.visit_result_operators(&query.result_operators)?;

        self.finish()
    }

    fn finish(mut self) -> Result<Compiled, QueryError> {
        let (plan, rows_shaper, lowered_selector) = match self.items.take() {
            Some(items) => (items, None, None),
            None => {
                let selector = self.selector.clone();
                let lowered = self.lower(&selector)?;
                let shaper = match &self.rows {
                    QueryPlan::Shaped(shaped) => Some(shaped.shaper.clone()),
                    _ => None,
                };
                let rows = std::mem::replace(&mut self.rows, empty_plan());
                let plan = QueryPlan::Select {
                    input: Box::new(rows),
                    selector: lowered.clone(),
                };
                (plan, shaper, Some(lowered))
            }
        };

        let live_selects = self
            .created
            .iter()
            .filter(|id| self.ctx.arena.is_live(**id))
            .count();

        Ok(Compiled {
            flags: self.flags,
            main_source: self.main_source,
            select: self.select,
            live_selects,
            rows_shaper,
            selector: self.selector,
            lowered_selector,
            plan,
            outer_parameters: self.outer_parameters,
            correlated: self.correlated,
        })
    }

    ///
    /// CLIENT EVALUATION
    ///

    /// Mark `clause` as client-evaluated; the configured policy applies the
    /// first time the flag turns on.
    fn require(
        &mut self,
        clause: ClientEvalClause,
        expression: impl FnOnce() -> String,
    ) -> Result<(), QueryError> {
        let global = self.flags.requires_client_eval;
        if !self.flags.set(clause) || global || self.ctx.is_replaying() {
            return Ok(());
        }

        let expression = expression();
        match self.ctx.options().client_eval {
            ClientEvalPolicy::Throw => Err(QueryError::ClientEvaluation { clause, expression }),
            ClientEvalPolicy::Warn => {
                self.ctx.sink().record(&DiagnosticEvent::ClientEvaluation {
                    clause,
                    expression: &expression,
                });
                Ok(())
            }
            ClientEvalPolicy::Ignore => Ok(()),
        }
    }

    ///
    /// TRANSLATION
    ///

    /// Run `f` with a translator for `target`; outer parameters it invents
    /// are merged into this query's injection list.
    fn translate_with<T>(
        &mut self,
        target: SelectId,
        f: impl FnOnce(&mut SqlTranslator<'_>) -> T,
    ) -> T {
        let mut translator = SqlTranslator::new(&mut *self.ctx, self.scope, target)
            .with_outer_properties(self.bind_outer_properties)
            .with_outer_parameters(self.bind_outer_parameters, &self.outer_parameters);

        let out = f(&mut translator);
        let correlated = translator.is_correlated();
        let parameters = translator.into_outer_parameters();

        self.correlated |= correlated;
        for (name, value) in parameters {
            if !self.outer_parameters.iter().any(|(n, _)| *n == name) {
                self.outer_parameters.push((name, value));
            }
        }

        out
    }

    ///
    /// SELECTS
    ///

    fn select_mut(&mut self, id: SelectId) -> Result<&mut SelectExpression, QueryError> {
        self.ctx
            .arena
            .get_mut(id)
            .ok_or_else(|| InternalError::query_invariant(format!("{id} is not live")).into())
    }

    /// Push the select down when it carries a limit, offset, or DISTINCT
    /// that later clauses must not reach into.
    fn push_down_if_bounded(&mut self, id: SelectId, include_distinct: bool) -> Result<(), QueryError> {
        let ctx = &mut *self.ctx;
        let select = ctx
            .arena
            .get_mut(id)
            .ok_or_else(|| InternalError::query_invariant(format!("{id} is not live")))?;

        if select.needs_push_down_for_filter() || (include_distinct && select.is_distinct()) {
            select.push_down_subquery(&mut ctx.aliases);
        }

        Ok(())
    }

    /// New select over `entity_type` bound to `source` in this scope.
    fn entity_select(
        &mut self,
        source: QuerySourceId,
        entity_type: &str,
    ) -> Result<(SelectId, Shaper), QueryError> {
        let select = include::entity_projection(self.ctx, source, entity_type)?;
        let id = self.ctx.arena.alloc(select);

        self.created.push(id);
        self.ctx.bind_source(self.scope, source, Some(id));
        self.ctx.offsets.insert(source, 0);

        let shaper = if self.ctx.is_materialized(source) {
            Shaper::Entity {
                query_source: source,
                entity_type: entity_type.to_string(),
                offset: 0,
                includes: Vec::new(),
            }
        } else {
            Shaper::ValueBuffer {
                query_source: source,
                offset: 0,
            }
        };

        Ok((id, shaper))
    }

    ///
    /// PLANS
    ///

    fn wrap_rows(&mut self, f: impl FnOnce(Box<QueryPlan>) -> QueryPlan) {
        let rows = std::mem::replace(&mut self.rows, empty_plan());
        self.rows = f(Box::new(rows));
    }

    /// Shaped leaf the rows plan reads, through row-preserving wrappers.
    fn rows_leaf_mut(&mut self) -> Option<&mut ShapedQuery> {
        fn leaf(plan: &mut QueryPlan) -> Option<&mut ShapedQuery> {
            match plan {
                QueryPlan::Shaped(shaped) => Some(shaped),
                QueryPlan::Where { input, .. } | QueryPlan::Include { input, .. } => leaf(input),
                _ => None,
            }
        }

        leaf(&mut self.rows)
    }

    fn extend_rows_shaper(&mut self, inner: Shaper) -> Result<(), QueryError> {
        let leaf = self
            .rows_leaf_mut()
            .ok_or_else(|| InternalError::query_invariant("rows have no shaped leaf"))?;
        let outer = std::mem::replace(&mut leaf.shaper, Shaper::Scalar { index: 0 });
        leaf.shaper = Shaper::composite(outer, inner);

        Ok(())
    }

    /// Items plan: the explicit one, or the selector applied to the rows.
    fn take_items(&mut self) -> Result<QueryPlan, QueryError> {
        if let Some(items) = self.items.take() {
            return Ok(items);
        }

        let selector = self.selector.clone();
        let selector = self.lower(&selector)?;
        let rows = std::mem::replace(&mut self.rows, empty_plan());

        Ok(QueryPlan::Select {
            input: Box::new(rows),
            selector,
        })
    }

    /// Replace the items with the first column of every row of `select`.
    fn set_scalar_items(&mut self, select: SelectId) {
        self.items = Some(QueryPlan::Shaped(ShapedQuery::new(
            select,
            Shaper::Scalar { index: 0 },
        )));
    }

    /// Replace the items with the single value `select` computes.
    fn set_scalar_result(&mut self, select: SelectId) {
        self.set_scalar_items(select);
        if let Some(items) = self.items.take() {
            self.items = Some(QueryPlan::ResultOp {
                input: Box::new(items),
                op: ClientOp::First { or_default: false },
            });
        }
        self.sql_closed = true;
    }

    /// Wrap `plan` so the outer values it references are registered as
    /// parameters for the duration of its enumeration.
    fn inject_parameters(
        &mut self,
        plan: QueryPlan,
        parameters: &[(String, Expr)],
    ) -> Result<QueryPlan, QueryError> {
        if parameters.is_empty() {
            return Ok(plan);
        }

        let mut names = Vec::with_capacity(parameters.len());
        let mut values = Vec::with_capacity(parameters.len());
        for (name, value) in parameters {
            names.push(name.clone());
            values.push(self.lower(value)?);
        }

        Ok(QueryPlan::InjectParameters {
            input: Box::new(plan),
            names,
            values,
        })
    }

    /// Compile `query` with a child visitor in a fresh child scope.
    fn compile_child(&mut self, query: &QueryModel, lateral: bool) -> Result<Compiled, QueryError> {
        let scope = self.ctx.child_scope(self.scope);

        QueryModelVisitor::child(&mut *self.ctx, scope, lateral).run(query)
    }
}

// Placeholder plan; evaluates to an empty sequence.
const fn empty_plan() -> QueryPlan {
    QueryPlan::Sequence(ClientExpr::Constant(Value::Null))
}

/// `CASE WHEN` wrapper for conditions used as values.
fn as_value(sql: SqlExpr) -> SqlExpr {
    if sql.is_condition() {
        sql.to_boolean_case()
    } else {
        sql
    }
}
