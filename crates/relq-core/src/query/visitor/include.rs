use super::QueryModelVisitor;
use crate::{
    error::InternalError,
    model::{Model, Navigation, NavigationKind},
    query::{
        Expr, QueryError, QuerySourceId, ReferenceInclude, SelectExpression,
        context::{QueryCompilationContext, SelectId},
        plan::CollectionInclude,
        sql::{JoinKind, ProjectionItem, SqlExpr, SqlOrdering, TableExpr, TableSource},
    },
};
use std::sync::Arc;

/// Select over the table of `entity_type` projecting its hierarchy row
/// block, labelled with `source`. Derived types filter on the
/// discriminator.
pub(super) fn entity_projection(
    ctx: &mut QueryCompilationContext,
    source: QuerySourceId,
    entity_type: &str,
) -> Result<SelectExpression, QueryError> {
    let model = Arc::clone(ctx.model());
    let ty = model
        .entity(entity_type)
        .ok_or_else(|| QueryError::UnknownEntityType(entity_type.to_string()))?;

    let alias = ctx.aliases.unique(entity_type);
    let mut select = SelectExpression::new();
    select.add_table(TableExpr::table(&ty.table, &alias, source));
    for (property, column) in model.hierarchy_columns(entity_type) {
        select.add_to_projection(
            ProjectionItem::new(SqlExpr::column(&alias, &column), column.clone())
                .for_source(source, property),
        );
    }

    if ty.base.is_some()
        && let Some(column) = ty
            .discriminator_property
            .as_deref()
            .and_then(|d| ty.property(d))
            .and_then(|p| p.column())
    {
        let mut matches: Vec<SqlExpr> = model
            .concrete_types(entity_type)
            .into_iter()
            .filter_map(|t| t.discriminator_value.clone())
            .map(|value| SqlExpr::equal(SqlExpr::column(&alias, column), SqlExpr::Literal(value)))
            .collect();

        let predicate = match matches.len() {
            0 => SqlExpr::literal(false),
            1 => matches.remove(0),
            _ => SqlExpr::Or(matches),
        };
        select.add_predicate(predicate);
    }

    ctx.set_source_type(source, entity_type);

    Ok(select)
}

/// Secondary select loading one collection include: the target rows
/// INNER JOINed to the principal keys of the outer select, in the outer
/// select's order.
pub(super) fn build_collection_select(
    ctx: &mut QueryCompilationContext,
    include: &CollectionInclude,
) -> Result<SelectId, QueryError> {
    let model = Arc::clone(ctx.model());
    let mut keys = ctx
        .arena
        .get(include.outer_select)
        .cloned()
        .ok_or_else(|| InternalError::query_invariant(format!("{} is not live", include.outer_select)))?;

    let orderings = keys.order_by().to_vec();
    keys.clear_projection();

    let mut ordering_aliases = Vec::with_capacity(orderings.len());
    for ordering in &orderings {
        let index = keys.add_to_projection(ProjectionItem::new(
            ordering.expr.clone(),
            alias_hint(&ordering.expr),
        ));
        ordering_aliases.push((keys.projection()[index].alias.clone(), ordering.direction));
    }

    let mut key_aliases = Vec::with_capacity(include.principal_key.len());
    for property in &include.principal_key {
        let column = column_of(&model, &include.principal_type, property)?;
        let sql = keys.column_for(include.source, &column).ok_or_else(|| {
            InternalError::query_invariant(format!(
                "principal key '{property}' is not reachable from {}",
                include.outer_select
            ))
        })?;
        let index = keys.add_to_projection(ProjectionItem::new(sql, column));
        key_aliases.push(keys.projection()[index].alias.clone());
    }

    if keys.limit().is_none() && keys.offset().is_none() {
        keys.clear_order_by();
    }

    let target = ctx.allocate_source();
    let mut secondary = entity_projection(ctx, target, &include.target_type)?;
    let target_alias = secondary
        .tables()
        .first()
        .map(|t| t.alias.clone())
        .ok_or_else(|| InternalError::query_invariant("include target has no table"))?;
    let derived_alias = ctx.aliases.unique("t");

    let mut join = Vec::with_capacity(key_aliases.len());
    for (property, key_alias) in include.foreign_key.iter().zip(&key_aliases) {
        let column = column_of(&model, &include.target_type, property)?;
        join.push(SqlExpr::equal(
            SqlExpr::column(&target_alias, column),
            SqlExpr::column(&derived_alias, key_alias),
        ));
    }
    let join = SqlExpr::conjunction(join)
        .ok_or_else(|| InternalError::query_invariant("collection include has no key"))?;

    secondary.add_table(TableExpr {
        alias: derived_alias.clone(),
        query_source: None,
        source: TableSource::Derived(Box::new(keys)),
        join: JoinKind::Inner(join),
    });
    for (alias, direction) in ordering_aliases {
        secondary.append_to_order_by(SqlOrdering::new(
            SqlExpr::column(&derived_alias, alias),
            direction,
        ));
    }

    Ok(ctx.arena.alloc(secondary))
}

/// Ordinals of `properties` within the hierarchy row block of `entity_type`.
pub(super) fn hierarchy_ordinals(
    model: &Model,
    entity_type: &str,
    properties: &[String],
) -> Result<Vec<usize>, QueryError> {
    let columns = model.hierarchy_columns(entity_type);

    properties
        .iter()
        .map(|property| {
            columns
                .iter()
                .position(|(name, _)| name == property)
                .ok_or_else(|| QueryError::UnknownProperty {
                    entity: entity_type.to_string(),
                    property: property.clone(),
                })
        })
        .collect()
}

fn column_of(model: &Model, entity_type: &str, property: &str) -> Result<String, QueryError> {
    model
        .entity(entity_type)
        .and_then(|ty| ty.property(property))
        .and_then(|p| p.column())
        .map(str::to_string)
        .ok_or_else(|| QueryError::UnknownProperty {
            entity: entity_type.to_string(),
            property: property.to_string(),
        })
}

fn alias_hint(expr: &SqlExpr) -> String {
    match expr {
        SqlExpr::Column { column, .. } => column.clone(),
        _ => "c".to_string(),
    }
}

impl QueryModelVisitor<'_> {
    pub(super) fn visit_include(&mut self, navigation: &str) -> Result<(), QueryError> {
        let Expr::QuerySource(source) = self.selector else {
            return Err(InternalError::query_invariant(format!(
                "Include({navigation}) needs a query selecting an entity, not '{}'",
                self.selector
            ))
            .into());
        };
        let entity_type = self
            .ctx
            .source_type(source)
            .map(str::to_string)
            .ok_or_else(|| {
                InternalError::query_invariant(format!("Include({navigation}) source is not an entity"))
            })?;
        let select = self
            .ctx
            .select_for(self.scope, source)
            .ok_or_else(|| {
                InternalError::query_invariant(format!("Include({navigation}) source has no select"))
            })?;

        let model = Arc::clone(self.ctx.model());
        let nav = model
            .entity(&entity_type)
            .ok_or_else(|| QueryError::UnknownEntityType(entity_type.clone()))?
            .navigation(navigation)
            .cloned()
            .ok_or_else(|| QueryError::UnknownNavigation {
                entity: entity_type.clone(),
                navigation: navigation.to_string(),
            })?;

        self.push_down_if_bounded(select, false)?;

        match nav.kind {
            NavigationKind::Reference => self.include_reference(source, select, &entity_type, &nav),
            NavigationKind::Collection => {
                self.include_collection(source, select, &entity_type, &nav)
            }
        }
    }

    fn include_reference(
        &mut self,
        source: QuerySourceId,
        select: SelectId,
        entity_type: &str,
        navigation: &Navigation,
    ) -> Result<(), QueryError> {
        let model = Arc::clone(self.ctx.model());
        let target = self.ctx.allocate_source();
        let mut joined = entity_projection(self.ctx, target, &navigation.target)?;
        let target_alias = joined
            .tables()
            .first()
            .map(|t| t.alias.clone())
            .ok_or_else(|| InternalError::query_invariant("include target has no table"))?;

        let mut on = Vec::with_capacity(navigation.source_properties.len() + 1);
        for (from, to) in navigation
            .source_properties
            .iter()
            .zip(&navigation.target_properties)
        {
            let from = column_of(&model, entity_type, from)?;
            let to = column_of(&model, &navigation.target, to)?;
            let outer = self.select_mut(select)?.column_for(source, &from).ok_or_else(|| {
                InternalError::query_invariant(format!("column '{from}' is not reachable"))
            })?;
            on.push(SqlExpr::equal(outer, SqlExpr::column(&target_alias, to)));
        }
        if let Some(discriminator) = joined.predicate().cloned() {
            on.push(discriminator);
        }
        let on = SqlExpr::conjunction(on)
            .ok_or_else(|| InternalError::query_invariant("reference include has no key"))?;
        joined.explode_star_projection();

        let offset = self.select_mut(select)?.add_left_outer_join(joined, on);
        self.ctx.offsets.insert(target, offset);
        self.ctx.bind_source(self.scope, target, Some(select));

        let includes = self
            .rows_leaf_mut()
            .and_then(|leaf| leaf.shaper.includes_mut(source))
            .ok_or_else(|| {
                InternalError::query_invariant(format!(
                    "Include({}) source is not materialized",
                    navigation.name
                ))
            })?;
        includes.push(ReferenceInclude {
            navigation: navigation.name.clone(),
            target_type: navigation.target.clone(),
            source: target,
            offset,
        });

        Ok(())
    }

    fn include_collection(
        &mut self,
        source: QuerySourceId,
        select: SelectId,
        entity_type: &str,
        navigation: &Navigation,
    ) -> Result<(), QueryError> {
        let model = Arc::clone(self.ctx.model());

        for property in &navigation.source_properties {
            let column = column_of(&model, entity_type, property)?;
            let outer = self.select_mut(select)?;
            let sql = outer.column_for(source, &column).ok_or_else(|| {
                InternalError::query_invariant(format!("column '{column}' is not reachable"))
            })?;
            outer.append_to_order_by(SqlOrdering::asc(sql));
        }

        let foreign_ordinals =
            hierarchy_ordinals(&model, &navigation.target, &navigation.target_properties)?;

        self.collections.push(CollectionInclude {
            navigation: navigation.name.clone(),
            source,
            principal_type: entity_type.to_string(),
            target_type: navigation.target.clone(),
            depth: self.collections.len() + 1,
            outer_select: select,
            select: None,
            command: None,
            principal_key: navigation.source_properties.clone(),
            foreign_key: navigation.target_properties.clone(),
            foreign_ordinals,
        });

        Ok(())
    }
}
