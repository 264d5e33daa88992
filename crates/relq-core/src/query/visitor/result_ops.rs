use super::{QueryModelVisitor, as_value};
use crate::{
    error::InternalError,
    query::{
        ClientEvalClause, ClientOp, Expr, QueryError, QueryPlan, ResultOperator, SelectExpression,
        context::SelectId,
        sql::{JoinKind, SqlExpr, SqlOrdering, TableExpr},
    },
    value::Value,
};

impl QueryModelVisitor<'_> {
    pub(super) fn visit_result_operators(
        &mut self,
        operators: &[ResultOperator],
    ) -> Result<(), QueryError> {
        for op in operators {
            if let ResultOperator::Include(navigation) = op {
                self.visit_include(navigation)?;
            }
        }
        if !self.collections.is_empty() {
            let collections = std::mem::take(&mut self.collections);
            self.wrap_rows(|input| QueryPlan::Include { input, collections });
        }

        for op in operators {
            if matches!(op, ResultOperator::Include(_)) {
                continue;
            }
            if !(self.can_translate() && self.translate_result_operator(op)?) {
                self.require(ClientEvalClause::ResultOperator, || format!("{}()", op.name()))?;
                self.apply_client_operator(op)?;
            }
        }

        Ok(())
    }

    fn can_translate(&self) -> bool {
        !self.sql_closed
            && self.select.is_some()
            && !self.flags.requires(ClientEvalClause::Filter)
            && !self.flags.requires(ClientEvalClause::SelectMany)
            && !self.flags.requires(ClientEvalClause::Join)
            && !self.flags.requires(ClientEvalClause::OrderBy)
            && !self.flags.requires(ClientEvalClause::ResultOperator)
            && self.rows.shaped_leaf().is_some()
            && self
                .items
                .as_ref()
                .is_none_or(|items| matches!(items, QueryPlan::Shaped(_)))
    }

    // Returns false when `op` has to run on the client instead.
    fn translate_result_operator(&mut self, op: &ResultOperator) -> Result<bool, QueryError> {
        let Some(select) = self.select else {
            return Ok(false);
        };

        match op {
            ResultOperator::Count | ResultOperator::LongCount => {
                self.push_down_if_bounded(select, true)?;
                let outer = self.select_mut(select)?;
                outer.set_scalar_projection(SqlExpr::function("COUNT", vec![SqlExpr::Star]), "count");
                outer.clear_order_by();
                self.set_scalar_result(select);

                Ok(true)
            }

            ResultOperator::Any => {
                let mut inner = std::mem::take(self.select_mut(select)?);
                if inner.limit().is_none() && inner.offset().is_none() {
                    inner.clear_order_by();
                }
                self.replace_with_exists(select, SqlExpr::Exists(Box::new(inner)), "any")?;

                Ok(true)
            }

            ResultOperator::All(predicate) => {
                self.push_down_if_bounded(select, false)?;
                let condition = predicate.replace_current(&self.selector);
                let Some(sql) = self.translate_with(select, |t| t.translate_condition(&condition))
                else {
                    return Ok(false);
                };

                let mut inner = std::mem::take(self.select_mut(select)?);
                inner.clear_order_by();
                inner.add_predicate(sql.negate());
                self.replace_with_exists(select, SqlExpr::Exists(Box::new(inner)).negate(), "all")?;

                Ok(true)
            }

            ResultOperator::First { .. } => {
                self.limit(select, 1)?;
                self.apply_client_operator(op)?;

                Ok(true)
            }

            ResultOperator::Single { .. } => {
                self.limit(select, 2)?;
                self.apply_client_operator(op)?;

                Ok(true)
            }

            ResultOperator::Last { or_default } => {
                if self.ctx.arena.get(select).is_none_or(|s| s.order_by().is_empty()) {
                    return Ok(false);
                }
                self.push_down_if_bounded(select, false)?;
                self.select_mut(select)?.reverse_order_by();
                self.limit(select, 1)?;
                self.apply_client_operator(&ResultOperator::First {
                    or_default: *or_default,
                })?;

                Ok(true)
            }

            ResultOperator::Take(count) | ResultOperator::Skip(count) => {
                // Literal counts clamp like the client operators; anything
                // but an integer is left for the client to reject.
                let sql = match count {
                    Expr::Constant(Value::Int(n)) => SqlExpr::literal((*n).max(0)),
                    Expr::Parameter(name) => SqlExpr::Parameter(name.clone()),
                    _ => return Ok(false),
                };

                let ctx = &mut *self.ctx;
                let outer = ctx
                    .arena
                    .get_mut(select)
                    .ok_or_else(|| InternalError::query_invariant(format!("{select} is not live")))?;
                if matches!(op, ResultOperator::Take(_)) {
                    outer.set_limit(sql, &mut ctx.aliases);
                } else {
                    outer.set_offset(sql, &mut ctx.aliases);
                }

                Ok(true)
            }

            ResultOperator::Distinct => self.translate_distinct(select),

            ResultOperator::Min
            | ResultOperator::Max
            | ResultOperator::Sum
            | ResultOperator::Average => self.translate_aggregate(select, op),

            ResultOperator::DefaultIfEmpty => {
                self.translate_default_if_empty(select)?;
                self.apply_client_operator(op)?;

                Ok(true)
            }

            ResultOperator::GroupBy { key, element } => {
                self.push_down_if_bounded(select, true)?;
                let key_expr = key.replace_current(&self.selector);
                let Some(sql) = self.translate_with(select, |t| t.translate(&key_expr)) else {
                    return Ok(false);
                };
                self.select_mut(select)?
                    .prepend_to_order_by(vec![SqlOrdering::asc(as_value(sql))]);

                let input = self.take_items()?;
                let key = self.lower(key)?;
                let element = self.lower(element)?;
                self.items = Some(QueryPlan::StreamingGroupBy {
                    input: Box::new(input),
                    key,
                    element,
                });
                self.sql_closed = true;

                Ok(true)
            }

            ResultOperator::Contains(_) | ResultOperator::Include(_) => Ok(false),
        }
    }

    fn translate_distinct(&mut self, select: SelectId) -> Result<bool, QueryError> {
        if self.items.is_some() {
            self.select_mut(select)?.set_distinct();
            return Ok(true);
        }

        if let Expr::QuerySource(source) = self.selector
            && self
                .rows
                .shaped_leaf()
                .is_some_and(|leaf| leaf.shaper.query_sources() == [source])
        {
            self.push_down_if_bounded(select, false)?;
            self.select_mut(select)?.set_distinct();
            return Ok(true);
        }

        self.push_down_if_bounded(select, false)?;
        let selector = self.selector.clone();
        let Some(sql) = self.translate_with(select, |t| t.translate(&selector)) else {
            return Ok(false);
        };

        let alias = projection_alias(&sql);
        let outer = self.select_mut(select)?;
        outer.set_scalar_projection(as_value(sql), &alias);
        outer.clear_order_by();
        outer.set_distinct();
        self.set_scalar_items(select);

        Ok(true)
    }

    fn translate_aggregate(
        &mut self,
        select: SelectId,
        op: &ResultOperator,
    ) -> Result<bool, QueryError> {
        if self.items.is_some() {
            return Ok(false);
        }

        self.push_down_if_bounded(select, true)?;
        let selector = self.selector.clone();
        let Some(sql) = self.translate_with(select, |t| t.translate(&selector)) else {
            return Ok(false);
        };
        let sql = as_value(sql);

        let (aggregate, alias) = match op {
            ResultOperator::Min => (SqlExpr::function("MIN", vec![sql]), "min"),
            ResultOperator::Max => (SqlExpr::function("MAX", vec![sql]), "max"),
            ResultOperator::Sum => (
                SqlExpr::function(
                    "COALESCE",
                    vec![SqlExpr::function("SUM", vec![sql]), SqlExpr::literal(0_i64)],
                ),
                "sum",
            ),
            _ => (SqlExpr::function("AVG", vec![sql]), "average"),
        };

        let outer = self.select_mut(select)?;
        outer.set_scalar_projection(aggregate, alias);
        outer.clear_order_by();
        self.set_scalar_result(select);

        Ok(true)
    }

    // SELECT ... FROM (SELECT NULL AS "empty") AS "e" LEFT JOIN (rows) ON 1 = 1;
    // the row block keeps its offsets and an unmatched row is all null.
    fn translate_default_if_empty(&mut self, select: SelectId) -> Result<(), QueryError> {
        let ctx = &mut *self.ctx;
        let current = ctx
            .arena
            .get_mut(select)
            .ok_or_else(|| InternalError::query_invariant(format!("{select} is not live")))?;

        let mut inner = std::mem::take(current);
        inner.push_down_subquery(&mut ctx.aliases);
        let orderings = inner.order_by().to_vec();
        inner.clear_order_by();

        let mut empty = SelectExpression::new();
        empty.set_scalar_projection(SqlExpr::Literal(Value::Null), "empty");

        let mut outer = SelectExpression::new();
        outer.add_table(TableExpr::derived(empty, ctx.aliases.unique("empty")));
        outer.add_join(
            inner,
            JoinKind::LeftOuter(SqlExpr::equal(SqlExpr::literal(1_i64), SqlExpr::literal(1_i64))),
        );
        for ordering in orderings {
            outer.append_to_order_by(ordering);
        }
        *current = outer;

        let leaf = match self.items.as_mut() {
            Some(items) => items.shaped_leaf_mut(),
            None => self.rows.shaped_leaf_mut(),
        };
        leaf.ok_or_else(|| InternalError::query_invariant("DefaultIfEmpty has no shaped rows"))?
            .default_if_empty = true;

        Ok(())
    }

    fn limit(&mut self, select: SelectId, rows: i64) -> Result<(), QueryError> {
        let ctx = &mut *self.ctx;
        ctx.arena
            .get_mut(select)
            .ok_or_else(|| InternalError::query_invariant(format!("{select} is not live")))?
            .set_limit(SqlExpr::literal(rows), &mut ctx.aliases);

        Ok(())
    }

    // Replace the select with `SELECT CASE WHEN <test> THEN TRUE ELSE FALSE END`.
    fn replace_with_exists(
        &mut self,
        select: SelectId,
        test: SqlExpr,
        alias: &str,
    ) -> Result<(), QueryError> {
        let mut outer = SelectExpression::new();
        outer.set_scalar_projection(test.to_boolean_case(), alias);
        *self.select_mut(select)? = outer;
        self.set_scalar_result(select);

        Ok(())
    }

    /// Apply `op` to the items in memory.
    pub(super) fn apply_client_operator(&mut self, op: &ResultOperator) -> Result<(), QueryError> {
        let input = self.take_items()?;

        let op = self.lower_operator(op)?;
        self.items = Some(QueryPlan::ResultOp {
            input: Box::new(input),
            op,
        });
        self.sql_closed = true;

        Ok(())
    }

    fn lower_operator(&mut self, op: &ResultOperator) -> Result<ClientOp, QueryError> {
        Ok(match op {
            ResultOperator::First { or_default } => ClientOp::First {
                or_default: *or_default,
            },
            ResultOperator::Single { or_default } => ClientOp::Single {
                or_default: *or_default,
            },
            ResultOperator::Last { or_default } => ClientOp::Last {
                or_default: *or_default,
            },
            ResultOperator::Count => ClientOp::Count,
            ResultOperator::LongCount => ClientOp::LongCount,
            ResultOperator::Any => ClientOp::Any,
            ResultOperator::All(predicate) => ClientOp::All(self.lower(predicate)?),
            ResultOperator::Contains(item) => ClientOp::Contains(self.lower(item)?),
            ResultOperator::Distinct => ClientOp::Distinct,
            ResultOperator::Take(count) => ClientOp::Take(self.lower(count)?),
            ResultOperator::Skip(count) => ClientOp::Skip(self.lower(count)?),
            ResultOperator::DefaultIfEmpty => ClientOp::DefaultIfEmpty,
            ResultOperator::Min => ClientOp::Min,
            ResultOperator::Max => ClientOp::Max,
            ResultOperator::Sum => ClientOp::Sum,
            ResultOperator::Average => ClientOp::Average,
            ResultOperator::GroupBy { key, element } => ClientOp::GroupBy {
                key: self.lower(key)?,
                element: self.lower(element)?,
            },
            ResultOperator::Include(navigation) => {
                return Err(InternalError::query_invariant(format!(
                    "Include({navigation}) cannot run as a client operator"
                ))
                .into());
            }
        })
    }
}

fn projection_alias(sql: &SqlExpr) -> String {
    match sql {
        SqlExpr::Column { column, .. } => column.clone(),
        _ => "value".to_string(),
    }
}
