//! Module: query::translate
//! Responsibility: translate query-model expressions into SQL expressions
//! against one target select.
//! Does not own: deciding what to do with untranslatable fragments.
//! Boundary: translation never fails loudly; `None` means "evaluate on the
//! client", and any outer parameters it invented are rolled back.

#[cfg(test)]
mod tests;

use crate::{
    model::PropertyKind,
    query::{
        BinaryOp, Expr, QuerySourceId,
        context::{QueryCompilationContext, ScopeId, SelectId},
        sql::{SqlExpr, unique_name},
    },
    value::Value,
};
use std::collections::BTreeSet;

///
/// SqlTranslator
///
/// Translates expressions for the select `target`, resolving query
/// sources through `scope`. References to sources of enclosing queries
/// either bind the outer column directly (lateral correlation) or become
/// `_outer_<Property>` parameters supplied at execution time.
///

pub struct SqlTranslator<'c> {
    ctx: &'c mut QueryCompilationContext,
    scope: ScopeId,
    target: SelectId,
    bind_outer_properties: bool,
    bind_outer_parameters: bool,
    known_parameters: Vec<(String, Expr)>,
    pending: Vec<(String, Expr)>,
    correlated: bool,
    residual: Option<Expr>,
}

impl<'c> SqlTranslator<'c> {
    pub fn new(ctx: &'c mut QueryCompilationContext, scope: ScopeId, target: SelectId) -> Self {
        Self {
            ctx,
            scope,
            target,
            bind_outer_properties: false,
            bind_outer_parameters: false,
            known_parameters: Vec::new(),
            pending: Vec::new(),
            correlated: false,
            residual: None,
        }
    }

    /// Allow outer columns to be referenced directly.
    #[must_use]
    pub const fn with_outer_properties(mut self, enabled: bool) -> Self {
        self.bind_outer_properties = enabled;
        self
    }

    /// Allow outer references to become parameters. `known` are the
    /// parameters this query already declared; equal expressions reuse them.
    #[must_use]
    pub fn with_outer_parameters(mut self, enabled: bool, known: &[(String, Expr)]) -> Self {
        self.bind_outer_parameters = enabled;
        self.known_parameters = known.to_vec();
        self
    }

    /// Translate a value expression.
    pub fn translate(&mut self, expr: &Expr) -> Option<SqlExpr> {
        self.attempt(|t| t.expr(expr))
    }

    /// Translate a search condition; non-condition values compare to TRUE.
    pub fn translate_condition(&mut self, expr: &Expr) -> Option<SqlExpr> {
        self.attempt(|t| t.condition(expr))
    }

    /// Translate a filter. A top-level AND with one untranslatable side
    /// yields the translatable side and keeps the other as the residual.
    pub fn translate_predicate(&mut self, predicate: &Expr) -> Option<SqlExpr> {
        self.residual = None;

        if let Expr::Binary(BinaryOp::And, left, right) = predicate {
            let l = self.translate_condition(left);
            let r = self.translate_condition(right);

            return match (l, r) {
                (Some(l), Some(r)) => Some(SqlExpr::binary(BinaryOp::And, l, r)),
                (Some(l), None) => {
                    self.residual = Some((**right).clone());
                    Some(l)
                }
                (None, Some(r)) => {
                    self.residual = Some((**left).clone());
                    Some(r)
                }
                (None, None) => None,
            };
        }

        self.translate_condition(predicate)
    }

    /// Client-side part left over by the last `translate_predicate`.
    pub const fn take_residual(&mut self) -> Option<Expr> {
        self.residual.take()
    }

    #[must_use]
    pub const fn is_correlated(&self) -> bool {
        self.correlated
    }

    /// Outer parameters invented by successful translations.
    #[must_use]
    pub fn outer_parameters(&self) -> &[(String, Expr)] {
        &self.pending
    }

    /// Finish, registering the invented parameter names with the context.
    pub fn into_outer_parameters(self) -> Vec<(String, Expr)> {
        for (name, _) in &self.pending {
            self.ctx.commit_outer_parameter(name.clone());
        }

        self.pending
    }

    // Run `f`, discarding outer parameters and correlation it introduced
    // when it fails.
    fn attempt(&mut self, f: impl FnOnce(&mut Self) -> Option<SqlExpr>) -> Option<SqlExpr> {
        let mark = self.pending.len();
        let correlated = self.correlated;

        let out = f(self);
        if out.is_none() {
            self.pending.truncate(mark);
            self.correlated = correlated;
        }

        out
    }

    fn condition(&mut self, expr: &Expr) -> Option<SqlExpr> {
        let sql = self.expr(expr)?;
        if sql.is_condition() {
            Some(sql)
        } else {
            Some(SqlExpr::equal(sql, SqlExpr::literal(true)))
        }
    }

    fn expr(&mut self, expr: &Expr) -> Option<SqlExpr> {
        match expr {
            Expr::Constant(value) => Some(SqlExpr::Literal(value.clone())),
            Expr::Parameter(name) => Some(SqlExpr::Parameter(name.clone())),
            Expr::Member(target, name) => match **target {
                Expr::QuerySource(source) => self.source_member(source, name),
                _ => None,
            },
            Expr::Binary(op, left, right) => self.binary(*op, left, right),
            Expr::Not(inner) => Some(self.condition(inner)?.negate()),
            Expr::IsNull(inner) => Some(SqlExpr::IsNull(Box::new(self.expr(inner)?))),
            Expr::Conditional(test, then, otherwise) => Some(SqlExpr::Case {
                condition: Box::new(self.condition(test)?),
                then: Box::new(self.expr(then)?),
                otherwise: Box::new(self.expr(otherwise)?),
            }),
            Expr::EntitySet(_)
            | Expr::QuerySource(_)
            | Expr::Current
            | Expr::TypeIs(..)
            | Expr::Call(..)
            | Expr::SubQuery(_)
            | Expr::New(_) => None,
        }
    }

    fn binary(&mut self, op: BinaryOp, left: &Expr, right: &Expr) -> Option<SqlExpr> {
        if op.is_logical() {
            let l = self.condition(left)?;
            let r = self.condition(right)?;
            return Some(SqlExpr::binary(op, l, r));
        }

        let l = self.expr(left)?;
        let r = self.expr(right)?;

        if matches!(op, BinaryOp::Eq | BinaryOp::Ne) {
            let operand = match (&l, &r) {
                (_, SqlExpr::Literal(Value::Null)) => Some(l.clone()),
                (SqlExpr::Literal(Value::Null), _) => Some(r.clone()),
                _ => None,
            };
            if let Some(operand) = operand {
                let operand = Box::new(operand);
                return Some(if op == BinaryOp::Eq {
                    SqlExpr::IsNull(operand)
                } else {
                    SqlExpr::IsNotNull(operand)
                });
            }
        }

        Some(SqlExpr::binary(op, l, r))
    }

    fn source_member(&mut self, source: QuerySourceId, name: &str) -> Option<SqlExpr> {
        if self.ctx.is_outer(self.scope, source) {
            return self.outer_member(source, name);
        }

        let Some(column) = self.column_name(source, name) else {
            // Lifted subquery with a projected record: translate the field.
            let field = match self.ctx.projection_of(source)? {
                Expr::New(fields) => fields.iter().find(|(n, _)| n == name)?.1.clone(),
                _ => return None,
            };
            return self.expr(&field);
        };

        let owner = self.ctx.select_for(self.scope, source)?;
        if owner != self.ctx.arena.resolve(self.target) {
            return None;
        }

        self.ctx.arena.get_mut(owner)?.column_for(source, &column)
    }

    fn outer_member(&mut self, source: QuerySourceId, name: &str) -> Option<SqlExpr> {
        if self.bind_outer_properties
            && let Some(column) = self.column_name(source, name)
            && let Some(owner) = self.ctx.select_for(self.scope, source)
            && let Some(sql) = self
                .ctx
                .arena
                .get_mut(owner)
                .and_then(|select| select.column_for(source, &column))
        {
            self.correlated = true;
            return Some(sql);
        }

        if !self.bind_outer_parameters {
            return None;
        }

        // Only mapped columns can be supplied as parameter values.
        self.column_name(source, name)?;

        let value = Expr::source(source).member(name);
        if let Some((existing, _)) = self
            .known_parameters
            .iter()
            .chain(self.pending.iter())
            .find(|(_, e)| *e == value)
        {
            return Some(SqlExpr::Parameter(existing.clone()));
        }

        let mut used: BTreeSet<String> = self.ctx.outer_parameter_names().clone();
        used.extend(self.known_parameters.iter().map(|(n, _)| n.clone()));
        used.extend(self.pending.iter().map(|(n, _)| n.clone()));
        let parameter = unique_name(&mut used, &format!("_outer_{name}"));

        self.pending.push((parameter.clone(), value));

        Some(SqlExpr::Parameter(parameter))
    }

    // Column backing `name` on a typed source; computed properties and
    // navigations have none.
    fn column_name(&self, source: QuerySourceId, name: &str) -> Option<String> {
        let entity_type = self.ctx.source_type(source)?;
        let model = self.ctx.model();
        let property = model.entity(entity_type)?.property(name)?;

        match &property.kind {
            PropertyKind::Column { column } => Some(column.clone()),
            PropertyKind::Computed(_) => None,
        }
    }
}
