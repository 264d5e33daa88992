use super::QueryModelVisitor;
use crate::query::{ClientExpr, Expr, QueryError, QueryModel, QuerySourceId};
use std::sync::Arc;

impl QueryModelVisitor<'_> {
    /// Lower `expr` for in-memory evaluation. Columns of raw-buffer sources
    /// read by ordinal; subqueries compile into nested plans.
    pub(super) fn lower(&mut self, expr: &Expr) -> Result<ClientExpr, QueryError> {
        let lowered = match expr {
            Expr::Constant(value) => ClientExpr::Constant(value.clone()),
            Expr::Parameter(name) => ClientExpr::Parameter(name.clone()),
            Expr::QuerySource(source) => ClientExpr::Source(*source),
            Expr::Current => ClientExpr::Current,

            Expr::Member(target, name) => match **target {
                Expr::QuerySource(source) => self.lower_source_member(source, name)?,
                _ => ClientExpr::member(self.lower(target)?, name.clone()),
            },

            Expr::Binary(op, left, right) => ClientExpr::Binary(
                *op,
                Box::new(self.lower(left)?),
                Box::new(self.lower(right)?),
            ),
            Expr::Not(inner) => ClientExpr::Not(Box::new(self.lower(inner)?)),
            Expr::IsNull(inner) => ClientExpr::IsNull(Box::new(self.lower(inner)?)),
            Expr::Conditional(test, then, otherwise) => ClientExpr::Conditional(
                Box::new(self.lower(test)?),
                Box::new(self.lower(then)?),
                Box::new(self.lower(otherwise)?),
            ),
            Expr::TypeIs(inner, entity_type) => {
                ClientExpr::TypeIs(Box::new(self.lower(inner)?), entity_type.clone())
            }
            Expr::Call(function, args) => {
                let mut lowered = Vec::with_capacity(args.len());
                for arg in args {
                    lowered.push(self.lower(arg)?);
                }
                ClientExpr::Call(function.clone(), lowered)
            }
            Expr::New(fields) => {
                let mut lowered = Vec::with_capacity(fields.len());
                for (name, field) in fields {
                    lowered.push((name.clone(), self.lower(field)?));
                }
                ClientExpr::New(lowered)
            }

            Expr::SubQuery(query) => self.lower_subquery(query)?,

            // A bare set reads as the sequence of its entities.
            Expr::EntitySet(entity_type) => {
                let source = self.ctx.allocate_source();
                self.ctx.set_source_type(source, entity_type.clone());
                self.ctx.mark_materialized(source);

                let query = QueryModel::builder(source, "e", expr.clone()).build();
                self.lower_subquery(&query)?
            }
        };

        Ok(lowered)
    }

    fn lower_source_member(
        &mut self,
        source: QuerySourceId,
        name: &str,
    ) -> Result<ClientExpr, QueryError> {
        let Some(entity_type) = self.ctx.source_type(source).map(str::to_string) else {
            return Ok(ClientExpr::member(ClientExpr::Source(source), name));
        };

        let model = Arc::clone(self.ctx.model());
        let entity = model
            .entity(&entity_type)
            .ok_or_else(|| QueryError::UnknownEntityType(entity_type.clone()))?;

        match entity.property(name) {
            Some(property) if property.column().is_some() && !self.ctx.is_materialized(source) => {
                let index = model
                    .hierarchy_columns(&entity_type)
                    .iter()
                    .position(|(property, _)| property == name)
                    .ok_or_else(|| QueryError::UnknownProperty {
                        entity: entity_type.clone(),
                        property: name.to_string(),
                    })?;

                Ok(ClientExpr::BufferRead {
                    source,
                    index,
                    property: name.to_string(),
                })
            }
            Some(_) => Ok(ClientExpr::member(ClientExpr::Source(source), name)),
            None if entity.navigation(name).is_some() => {
                Ok(ClientExpr::member(ClientExpr::Source(source), name))
            }
            None => Err(QueryError::UnknownProperty {
                entity: entity_type,
                property: name.to_string(),
            }),
        }
    }

    fn lower_subquery(&mut self, query: &QueryModel) -> Result<ClientExpr, QueryError> {
        let child = self.compile_child(query, false)?;
        let plan = self.inject_parameters(child.plan, &child.outer_parameters)?;

        Ok(ClientExpr::SubQuery(Box::new(plan)))
    }
}
