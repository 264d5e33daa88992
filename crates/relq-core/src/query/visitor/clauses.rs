use super::{Compiled, QueryModelVisitor, as_value};
use crate::{
    error::InternalError,
    query::{
        BodyClause, ClientEvalClause, Expr, FromClause, Ordering, QueryError, QueryPlan,
        QuerySourceId, ShapedQuery, Shaper,
        context::SelectId,
        sql::SqlOrdering,
    },
};

impl QueryModelVisitor<'_> {
    pub(super) fn visit_main_from(&mut self, from: &FromClause) -> Result<(), QueryError> {
        match &from.source {
            Expr::EntitySet(entity_type) => {
                let (select, shaper) = self.entity_select(from.id, entity_type)?;
                self.select = Some(select);
                self.rows = QueryPlan::Shaped(ShapedQuery::new(select, shaper));
            }
            Expr::SubQuery(query) => {
                let child = self.compile_child(query, false)?;
                if child.is_liftable(self.ctx) {
                    let (select, shaper) = self.lift(from.id, child)?;
                    self.select = Some(select);
                    self.rows = QueryPlan::Shaped(ShapedQuery::new(select, shaper));
                } else {
                    self.ctx.bind_source(self.scope, from.id, None);
                    let plan = self.inject_parameters(child.plan, &child.outer_parameters)?;
                    self.rows = QueryPlan::FromSequence {
                        source: from.id,
                        input: Box::new(plan),
                    };
                    self.flags.requires_client_eval = true;
                }
            }
            source => {
                self.ctx.bind_source(self.scope, from.id, None);
                let sequence = self.lower(source)?;
                self.rows = QueryPlan::FromSequence {
                    source: from.id,
                    input: Box::new(QueryPlan::Sequence(sequence)),
                };
                self.flags.requires_client_eval = true;
            }
        }

        Ok(())
    }

    pub(super) fn visit_body_clause(&mut self, clause: &BodyClause) -> Result<(), QueryError> {
        match clause {
            BodyClause::Where(predicate) => self.visit_where(predicate),
            BodyClause::OrderBy(orderings) => self.visit_order_by(orderings),
            BodyClause::AdditionalFrom(from) => self.visit_additional_from(from),
            BodyClause::Join(join) => self.visit_join(join),
            BodyClause::GroupJoin(group) => self.visit_group_join(group),
        }
    }

    fn visit_where(&mut self, predicate: &Expr) -> Result<(), QueryError> {
        let mut residual = Some(predicate.clone());

        if let Some(select) = self.select
            && !self.flags.requires_client_eval
        {
            self.push_down_if_bounded(select, false)?;

            let (sql, leftover) = self.translate_with(select, |t| {
                let sql = t.translate_predicate(predicate);
                (sql, t.take_residual())
            });
            if let Some(sql) = sql {
                self.select_mut(select)?.add_predicate(sql);
                residual = leftover;
            }
        }

        if let Some(residual) = residual {
            self.require(ClientEvalClause::Filter, || residual.to_string())?;
            let predicate = self.lower(&residual)?;
            self.wrap_rows(|input| QueryPlan::Where { input, predicate });
        }

        Ok(())
    }

    fn visit_order_by(&mut self, orderings: &[Ordering]) -> Result<(), QueryError> {
        if let Some(select) = self.select
            && !self.flags.requires(ClientEvalClause::OrderBy)
        {
            self.push_down_if_bounded(select, false)?;

            let bind_parameters = std::mem::replace(&mut self.bind_outer_parameters, false);
            let translated: Option<Vec<SqlOrdering>> = self.translate_with(select, |t| {
                orderings
                    .iter()
                    .map(|o| {
                        t.translate(&o.expr)
                            .map(|sql| SqlOrdering::new(as_value(sql), o.direction))
                    })
                    .collect()
            });
            self.bind_outer_parameters = bind_parameters;

            if let Some(translated) = translated {
                self.select_mut(select)?.prepend_to_order_by(translated);
                return Ok(());
            }
        }

        self.require(ClientEvalClause::OrderBy, || {
            orderings
                .iter()
                .map(|o| o.expr.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        })?;

        let mut lowered = Vec::with_capacity(orderings.len());
        for ordering in orderings {
            lowered.push((self.lower(&ordering.expr)?, ordering.direction));
        }
        self.wrap_rows(|input| QueryPlan::OrderBy {
            input,
            orderings: lowered,
        });

        Ok(())
    }

    pub(super) fn visit_selector(&mut self, selector: &Expr) -> Result<(), QueryError> {
        if self.needs_client_projection(selector) {
            self.require(ClientEvalClause::Projection, || selector.to_string())?;
        }

        Ok(())
    }

    // Constructs with no column behind them: client functions, subqueries,
    // type tests, computed properties, and navigation reads.
    fn needs_client_projection(&self, expr: &Expr) -> bool {
        match expr {
            Expr::Constant(_) | Expr::Parameter(_) | Expr::QuerySource(_) | Expr::Current => false,
            Expr::EntitySet(_) | Expr::TypeIs(..) | Expr::Call(..) | Expr::SubQuery(_) => true,
            Expr::Member(target, name) => match **target {
                Expr::QuerySource(source) => self.ctx.source_type(source).is_some_and(|ty| {
                    self.ctx
                        .model()
                        .entity(ty)
                        .and_then(|entity| entity.property(name))
                        .and_then(|property| property.column())
                        .is_none()
                }),
                _ => true,
            },
            Expr::Binary(_, l, r) => self.needs_client_projection(l) || self.needs_client_projection(r),
            Expr::Not(inner) | Expr::IsNull(inner) => self.needs_client_projection(inner),
            Expr::Conditional(t, a, b) => {
                self.needs_client_projection(t)
                    || self.needs_client_projection(a)
                    || self.needs_client_projection(b)
            }
            Expr::New(fields) => fields.iter().any(|(_, e)| self.needs_client_projection(e)),
        }
    }

    /// Take over the only select of `child` as the select producing `id`.
    /// An identity selector retargets the child's source to `id`; any other
    /// selector is evaluated by a projection shaper per row.
    pub(super) fn lift(
        &mut self,
        id: QuerySourceId,
        child: Compiled,
    ) -> Result<(SelectId, Shaper), QueryError> {
        let select = child
            .select
            .map(|s| self.ctx.arena.resolve(s))
            .ok_or_else(|| InternalError::query_invariant("lifted query has no select"))?;
        let mut shaper = child
            .rows_shaper
            .ok_or_else(|| InternalError::query_invariant("lifted query has no row shaper"))?;

        for source in self.ctx.sources_of(select) {
            self.ctx.bind_source(self.scope, source, Some(select));
        }
        self.ctx.bind_source(self.scope, id, Some(select));
        self.created.push(select);

        if child.selector == Expr::QuerySource(child.main_source) {
            let materialize = self.ctx.is_materialized(id);
            shaper.update_query_source(child.main_source, id, materialize);
            self.select_mut(select)?
                .update_query_source(child.main_source, id);

            if let Some(offset) = self.ctx.offsets.get(&child.main_source).copied() {
                self.ctx.offsets.insert(id, offset);
            }
            if self.ctx.source_type(id).is_none()
                && let Some(entity_type) = self.ctx.source_type(child.main_source).map(str::to_string)
            {
                self.ctx.set_source_type(id, entity_type);
            }

            return Ok((select, shaper));
        }

        let selector = child
            .lowered_selector
            .ok_or_else(|| InternalError::query_invariant("lifted query has no selector"))?;
        self.ctx.set_projection(id, child.selector);

        Ok((
            select,
            Shaper::Projection {
                query_source: id,
                inner: Box::new(shaper),
                selector,
            },
        ))
    }
}
