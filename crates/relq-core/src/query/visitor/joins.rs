use super::QueryModelVisitor;
use crate::{
    error::InternalError,
    query::{
        ClientEvalClause, Expr, FromClause, GroupJoinClause, JoinClause, QueryError, QueryPlan,
        QuerySourceId, ShapedQuery, Shaper,
        context::SelectId,
        sql::{SqlExpr, SqlOrdering},
    },
};

///
/// InnerSource
///
/// Right-hand side of a join or additional from: a select that may be
/// flattened into the outer one, or a client plan.
///

enum InnerSource {
    Sql {
        select: SelectId,
        shaper: Shaper,
        correlated: bool,
    },
    Client(QueryPlan),
}

impl InnerSource {
    fn into_plan(self) -> QueryPlan {
        match self {
            Self::Sql { select, shaper, .. } => QueryPlan::Shaped(ShapedQuery::new(select, shaper)),
            Self::Client(plan) => plan,
        }
    }
}

impl QueryModelVisitor<'_> {
    pub(super) fn visit_join(&mut self, join: &JoinClause) -> Result<(), QueryError> {
        self.prepare_main_for_join()?;

        let inner = self.inner_source(join.id, &join.inner, false)?;
        let inner = match inner {
            InnerSource::Sql { select, shaper, .. } if self.can_flatten() => {
                match self.flatten_join(select, shaper, join)? {
                    None => return Ok(()),
                    Some(shaper) => InnerSource::Sql {
                        select,
                        shaper,
                        correlated: false,
                    },
                }
            }
            other => other,
        };

        self.require(ClientEvalClause::Join, || {
            format!("{} equals {}", join.outer_key, join.inner_key)
        })?;

        let outer_key = self.lower(&join.outer_key)?;
        let inner_key = self.lower(&join.inner_key)?;
        let inner = inner.into_plan();
        self.wrap_rows(|outer| QueryPlan::Join {
            outer,
            inner: Box::new(inner),
            outer_key,
            inner_key,
        });

        Ok(())
    }

    pub(super) fn visit_group_join(&mut self, group: &GroupJoinClause) -> Result<(), QueryError> {
        let join = &group.join;
        self.ctx.bind_source(self.scope, group.id, None);
        self.prepare_main_for_join()?;

        let inner = self.inner_source(join.id, &join.inner, false)?;
        let inner = match inner {
            InnerSource::Sql { select, shaper, .. } if self.can_flatten() => {
                match self.flatten_group_join(select, shaper, group)? {
                    None => return Ok(()),
                    Some(shaper) => InnerSource::Sql {
                        select,
                        shaper,
                        correlated: false,
                    },
                }
            }
            other => other,
        };

        self.require(ClientEvalClause::Join, || {
            format!("{} equals {}", join.outer_key, join.inner_key)
        })?;

        let outer_key = self.lower(&join.outer_key)?;
        let inner_key = self.lower(&join.inner_key)?;
        let inner = inner.into_plan();
        self.wrap_rows(|outer| QueryPlan::GroupJoin {
            outer,
            inner: Box::new(inner),
            outer_key,
            inner_key,
            element: join.id,
            group: group.id,
        });

        Ok(())
    }

    pub(super) fn visit_additional_from(&mut self, from: &FromClause) -> Result<(), QueryError> {
        let lateral = self.ctx.capabilities().lateral_join
            && self.can_flatten()
            && matches!(from.source, Expr::SubQuery(_));

        self.prepare_main_for_join()?;

        let inner = self.inner_source(from.id, &from.source, lateral)?;
        if let InnerSource::Sql {
            select,
            shaper,
            correlated,
        } = inner
        {
            if let Some(main) = self.select
                && self.can_flatten()
            {
                let moved = self.ctx.sources_of(select);
                let ctx = &mut *self.ctx;
                let absorbed = ctx
                    .arena
                    .absorb(select, main)
                    .ok_or_else(|| InternalError::query_invariant(format!("{select} is not absorbable")))?;
                let outer = ctx
                    .arena
                    .get_mut(main)
                    .ok_or_else(|| InternalError::query_invariant(format!("{main} is not live")))?;

                let offset = if correlated {
                    outer.add_cross_join_lateral(absorbed, &mut ctx.aliases)
                } else {
                    let mut absorbed = absorbed;
                    absorbed.prepare_for_join(&mut ctx.aliases);
                    outer.add_cross_join(absorbed)
                };

                self.ctx.shift_offsets(&moved, offset);
                self.extend_rows_shaper(shaper)?;

                return Ok(());
            }

            return self.client_select_many(
                from,
                InnerSource::Sql {
                    select,
                    shaper,
                    correlated,
                },
            );
        }

        self.client_select_many(from, inner)
    }

    fn client_select_many(&mut self, from: &FromClause, inner: InnerSource) -> Result<(), QueryError> {
        self.require(ClientEvalClause::SelectMany, || from.source.to_string())?;

        let inner = inner.into_plan();
        self.wrap_rows(|outer| QueryPlan::SelectMany {
            outer,
            inner: Box::new(inner),
        });

        Ok(())
    }

    /// Flattening is possible while the rows still read one select directly.
    fn can_flatten(&mut self) -> bool {
        self.select.is_some()
            && !self.flags.requires(ClientEvalClause::Join)
            && !self.flags.requires(ClientEvalClause::SelectMany)
            && self.rows_leaf_mut().is_some()
    }

    // Joined rows must not reach into a limited or distinct outer select.
    fn prepare_main_for_join(&mut self) -> Result<(), QueryError> {
        if let Some(main) = self.select
            && self.can_flatten()
        {
            self.push_down_if_bounded(main, true)?;
        }

        Ok(())
    }

    fn inner_source(
        &mut self,
        id: QuerySourceId,
        source: &Expr,
        lateral: bool,
    ) -> Result<InnerSource, QueryError> {
        match source {
            Expr::EntitySet(entity_type) => {
                let (select, shaper) = self.entity_select(id, entity_type)?;
                Ok(InnerSource::Sql {
                    select,
                    shaper,
                    correlated: false,
                })
            }
            Expr::SubQuery(query) => {
                let child = self.compile_child(query, lateral)?;
                if child.is_liftable(self.ctx) {
                    let correlated = child.correlated;
                    let (select, shaper) = self.lift(id, child)?;
                    return Ok(InnerSource::Sql {
                        select,
                        shaper,
                        correlated,
                    });
                }

                // Correlated selects cannot run on their own; compile again
                // with outer values supplied as parameters.
                let child = if child.correlated {
                    let replaying = self.ctx.set_replaying(true);
                    let replay = self.compile_child(query, false);
                    self.ctx.set_replaying(replaying);
                    replay?
                } else {
                    child
                };

                self.ctx.bind_source(self.scope, id, None);
                let plan = self.inject_parameters(child.plan, &child.outer_parameters)?;

                Ok(InnerSource::Client(QueryPlan::FromSequence {
                    source: id,
                    input: Box::new(plan),
                }))
            }
            other => {
                self.ctx.bind_source(self.scope, id, None);
                let sequence = self.lower(other)?;

                Ok(InnerSource::Client(QueryPlan::FromSequence {
                    source: id,
                    input: Box::new(QueryPlan::Sequence(sequence)),
                }))
            }
        }
    }

    // Absorb `inner` with an INNER JOIN on the translated keys. Hands the
    // shaper back when a key does not translate.
    fn flatten_join(
        &mut self,
        inner: SelectId,
        shaper: Shaper,
        join: &JoinClause,
    ) -> Result<Option<Shaper>, QueryError> {
        let Some(main) = self.select else {
            return Ok(Some(shaper));
        };

        self.prepare_inner_for_join(inner)?;
        let outer_key = self.translate_with(main, |t| t.translate(&join.outer_key));
        let inner_key = self.translate_with(inner, |t| t.translate(&join.inner_key));
        let (Some(outer_key), Some(inner_key)) = (outer_key, inner_key) else {
            return Ok(Some(shaper));
        };

        let moved = self.ctx.sources_of(inner);
        let absorbed = self.absorb(inner, main)?;
        let offset = self
            .select_mut(main)?
            .add_inner_join(absorbed, SqlExpr::equal(outer_key, inner_key));

        self.ctx.shift_offsets(&moved, offset);
        self.extend_rows_shaper(shaper)?;

        Ok(None)
    }

    // Absorb `inner` with a LEFT JOIN ordered by the outer key, then stream
    // the joined rows into groups.
    fn flatten_group_join(
        &mut self,
        inner: SelectId,
        shaper: Shaper,
        group: &GroupJoinClause,
    ) -> Result<Option<Shaper>, QueryError> {
        let join = &group.join;
        let Some(main) = self.select else {
            return Ok(Some(shaper));
        };

        let unlimited_order = self.ctx.arena.get(inner).is_some_and(|s| {
            !s.order_by().is_empty() && s.limit().is_none() && s.offset().is_none()
        });
        if unlimited_order {
            return Ok(Some(shaper));
        }

        self.prepare_inner_for_join(inner)?;
        let outer_key = self.translate_with(main, |t| t.translate(&join.outer_key));
        let inner_key = self.translate_with(inner, |t| t.translate(&join.inner_key));
        let (Some(outer_key), Some(inner_key)) = (outer_key, inner_key) else {
            return Ok(Some(shaper));
        };

        let inner_orderings = self
            .ctx
            .arena
            .get(inner)
            .map(|s| s.order_by().to_vec())
            .unwrap_or_default();
        let outer_keys = self.outer_key_columns(main)?;

        let moved = self.ctx.sources_of(inner);
        let absorbed = self.absorb(inner, main)?;
        let outer = self.select_mut(main)?;
        let offset = outer.add_left_outer_join(absorbed, SqlExpr::equal(outer_key.clone(), inner_key));

        outer.append_to_order_by(SqlOrdering::asc(outer_key));
        for column in outer_keys {
            outer.append_to_order_by(SqlOrdering::asc(column));
        }
        for ordering in inner_orderings {
            outer.append_to_order_by(ordering);
        }

        self.ctx.shift_offsets(&moved, offset);
        self.extend_rows_shaper(shaper)?;

        let outer_key = self.lower(&join.outer_key)?;
        let inner_key = self.lower(&join.inner_key)?;
        self.wrap_rows(|input| QueryPlan::StreamingGroupJoin {
            input,
            outer_width: offset,
            element: join.id,
            group: group.id,
            outer_key,
            inner_key,
        });

        Ok(None)
    }

    // Primary-key columns of every entity source already in `main`.
    fn outer_key_columns(&mut self, main: SelectId) -> Result<Vec<SqlExpr>, QueryError> {
        let model = std::sync::Arc::clone(self.ctx.model());
        let mut columns = Vec::new();

        for source in self.ctx.sources_of(main) {
            let Some(entity) = self.ctx.source_type(source).and_then(|ty| model.entity(ty)) else {
                continue;
            };
            for key in &entity.key {
                let Some(column) = entity.property(key).and_then(|p| p.column()) else {
                    continue;
                };
                if let Some(sql) = self.select_mut(main)?.column_for(source, column) {
                    columns.push(sql);
                }
            }
        }

        Ok(columns)
    }

    fn prepare_inner_for_join(&mut self, inner: SelectId) -> Result<(), QueryError> {
        let ctx = &mut *self.ctx;
        ctx.arena
            .get_mut(inner)
            .ok_or_else(|| InternalError::query_invariant(format!("{inner} is not live")))?
            .prepare_for_join(&mut ctx.aliases);

        Ok(())
    }

    fn absorb(
        &mut self,
        inner: SelectId,
        main: SelectId,
    ) -> Result<crate::query::SelectExpression, QueryError> {
        self.ctx.arena.absorb(inner, main).ok_or_else(|| {
            InternalError::query_invariant(format!("{inner} cannot be absorbed into {main}")).into()
        })
    }
}
