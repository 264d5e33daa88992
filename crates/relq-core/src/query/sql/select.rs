use crate::query::{
    model::QuerySourceId,
    sql::{
        AliasGenerator, JoinKind, ProjectionItem, SqlExpr, SqlOrdering, TableExpr, TableSource,
        normalize::normalize_predicate, unique_name,
    },
};
use std::collections::BTreeSet;

///
/// SelectExpression
///
/// One SQL SELECT under construction. Projection only ever grows at the
/// end, so a column index handed out stays valid across push-downs and
/// joins.
///

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SelectExpression {
    tables: Vec<TableExpr>,
    projection: Vec<ProjectionItem>,
    project_star: Option<String>,
    predicate: Option<SqlExpr>,
    order_by: Vec<SqlOrdering>,
    limit: Option<SqlExpr>,
    offset: Option<SqlExpr>,
    distinct: bool,
}

impl SelectExpression {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn tables(&self) -> &[TableExpr] {
        &self.tables
    }

    #[must_use]
    pub fn projection(&self) -> &[ProjectionItem] {
        &self.projection
    }

    #[must_use]
    pub fn project_star(&self) -> Option<&str> {
        self.project_star.as_deref()
    }

    #[must_use]
    pub const fn predicate(&self) -> Option<&SqlExpr> {
        self.predicate.as_ref()
    }

    #[must_use]
    pub fn order_by(&self) -> &[SqlOrdering] {
        &self.order_by
    }

    #[must_use]
    pub const fn limit(&self) -> Option<&SqlExpr> {
        self.limit.as_ref()
    }

    #[must_use]
    pub const fn offset(&self) -> Option<&SqlExpr> {
        self.offset.as_ref()
    }

    #[must_use]
    pub const fn is_distinct(&self) -> bool {
        self.distinct
    }

    pub fn add_table(&mut self, table: TableExpr) {
        self.tables.push(table);
    }

    /// Number of columns a row of this select carries.
    #[must_use]
    pub fn row_width(&self) -> usize {
        match (&self.project_star, self.projection.is_empty()) {
            (Some(alias), true) => self
                .derived(alias)
                .map_or(0, Self::row_width),
            _ => self.projection.len(),
        }
    }

    /// Append `item` unless an equal expression is already projected.
    /// Returns the column index.
    pub fn add_to_projection(&mut self, mut item: ProjectionItem) -> usize {
        self.explode_star_projection();

        if let Some(index) = self.projection.iter().position(|p| p.expr == item.expr) {
            return index;
        }

        let mut used: BTreeSet<String> = self.projection.iter().map(|p| p.alias.clone()).collect();
        item.alias = unique_name(&mut used, &item.alias);
        self.projection.push(item);

        self.projection.len() - 1
    }

    /// Replace the projection with a single computed column.
    pub fn set_scalar_projection(&mut self, expr: SqlExpr, alias: &str) {
        self.project_star = None;
        self.projection = vec![ProjectionItem::new(expr, alias)];
    }

    /// Drop every projected column, star included.
    pub fn clear_projection(&mut self) {
        self.project_star = None;
        self.projection.clear();
    }

    /// Turn a star projection over a derived table into explicit columns.
    pub fn explode_star_projection(&mut self) {
        let Some(alias) = self.project_star.take() else {
            return;
        };
        let Some(derived) = self.derived(&alias) else {
            return;
        };

        let exploded: Vec<ProjectionItem> = derived
            .projection
            .iter()
            .map(|item| ProjectionItem {
                expr: SqlExpr::column(alias.clone(), item.alias.clone()),
                alias: item.alias.clone(),
                query_source: item.query_source,
                property: item.property.clone(),
            })
            .collect();
        self.projection.splice(0..0, exploded);
    }

    pub fn add_predicate(&mut self, predicate: SqlExpr) {
        self.predicate = Some(match self.predicate.take() {
            None => predicate,
            Some(existing) => SqlExpr::And(vec![existing, predicate]),
        });
    }

    /// Filters compose only below any row limit.
    #[must_use]
    pub const fn needs_push_down_for_filter(&self) -> bool {
        self.limit.is_some() || self.offset.is_some()
    }

    /// Put `orderings` ahead of the existing ones, dropping existing
    /// entries they repeat.
    pub fn prepend_to_order_by(&mut self, orderings: Vec<SqlOrdering>) {
        self.order_by
            .retain(|existing| !orderings.iter().any(|o| o.expr == existing.expr));
        self.order_by.splice(0..0, orderings);
    }

    pub fn append_to_order_by(&mut self, ordering: SqlOrdering) {
        if !self.order_by.iter().any(|o| o.expr == ordering.expr) {
            self.order_by.push(ordering);
        }
    }

    pub fn clear_order_by(&mut self) {
        self.order_by.clear();
    }

    pub fn reverse_order_by(&mut self) {
        for ordering in &mut self.order_by {
            ordering.direction = ordering.direction.reversed();
        }
    }

    /// Apply a row limit; a second limit first pushes this select down.
    pub fn set_limit(&mut self, limit: SqlExpr, aliases: &mut AliasGenerator) {
        if self.limit.is_some() {
            self.push_down_subquery(aliases);
        }
        self.limit = Some(limit);
    }

    /// Apply a row offset; pushes down when a limit or offset exists.
    pub fn set_offset(&mut self, offset: SqlExpr, aliases: &mut AliasGenerator) {
        if self.limit.is_some() || self.offset.is_some() {
            self.push_down_subquery(aliases);
        }
        self.offset = Some(offset);
    }

    pub const fn set_distinct(&mut self) {
        self.distinct = true;
    }

    /// True when this select can be joined by appending its table as-is.
    #[must_use]
    pub fn is_plain_table(&self) -> bool {
        matches!(
            self.tables.as_slice(),
            [TableExpr {
                source: TableSource::Table(_),
                join: JoinKind::Root,
                ..
            }]
        ) && self.predicate.is_none()
            && self.order_by.is_empty()
            && self.limit.is_none()
            && self.offset.is_none()
            && !self.distinct
            && self.project_star.is_none()
    }

    /// Wrap the current select into a derived table of a new, empty outer
    /// select that projects it by star. Column order is preserved.
    /// Returns the derived table alias.
    pub fn push_down_subquery(&mut self, aliases: &mut AliasGenerator) -> String {
        let alias = aliases.unique("t");
        let mut inner = std::mem::take(self);

        // Orderings only survive inside when they feed a limit.
        let lifted = inner.order_by.clone();
        if inner.limit.is_none() && inner.offset.is_none() {
            inner.order_by.clear();
        }

        let mut outer_order = Vec::with_capacity(lifted.len());
        for ordering in lifted {
            let index = inner.add_to_projection(ProjectionItem::new(
                ordering.expr.clone(),
                projection_alias_hint(&ordering.expr),
            ));
            let column = inner.projection[index].alias.clone();
            outer_order.push(SqlOrdering::new(
                SqlExpr::column(alias.clone(), column),
                ordering.direction,
            ));
        }

        self.tables.push(TableExpr::derived(inner, alias.clone()));
        self.project_star = Some(alias.clone());
        self.order_by = outer_order;

        alias
    }

    /// Make this select joinable: plain tables join directly, anything else
    /// is pushed down first.
    pub fn prepare_for_join(&mut self, aliases: &mut AliasGenerator) {
        if !self.is_plain_table() {
            self.push_down_subquery(aliases);
        }
        self.explode_star_projection();
    }

    /// Absorb `inner` (already prepared for join) with `join`. The inner
    /// columns land after the current ones; returns their start index.
    pub fn add_join(&mut self, mut inner: Self, join: JoinKind) -> usize {
        self.explode_star_projection();
        inner.explode_star_projection();

        let offset = self.projection.len();
        let mut used: BTreeSet<String> = self.projection.iter().map(|p| p.alias.clone()).collect();
        for mut item in inner.projection {
            item.alias = unique_name(&mut used, &item.alias);
            self.projection.push(item);
        }

        let mut tables = inner.tables.into_iter();
        if let Some(mut first) = tables.next() {
            first.join = join;
            self.tables.push(first);
        }
        self.tables.extend(tables);

        offset
    }

    /// Join `inner` as a derived table regardless of its shape.
    pub fn add_derived_join(
        &mut self,
        mut inner: Self,
        join: JoinKind,
        aliases: &mut AliasGenerator,
    ) -> usize {
        inner.push_down_subquery(aliases);
        self.add_join(inner, join)
    }

    pub fn add_inner_join(&mut self, inner: Self, predicate: SqlExpr) -> usize {
        self.add_join(inner, JoinKind::Inner(predicate))
    }

    pub fn add_left_outer_join(&mut self, inner: Self, predicate: SqlExpr) -> usize {
        self.add_join(inner, JoinKind::LeftOuter(predicate))
    }

    pub fn add_cross_join(&mut self, inner: Self) -> usize {
        self.add_join(inner, JoinKind::Cross)
    }

    pub fn add_cross_join_lateral(&mut self, inner: Self, aliases: &mut AliasGenerator) -> usize {
        self.add_derived_join(inner, JoinKind::CrossLateral, aliases)
    }

    #[must_use]
    pub fn contains_source(&self, query_source: QuerySourceId) -> bool {
        self.tables.iter().any(|t| match &t.source {
            TableSource::Table(_) => t.query_source == Some(query_source),
            TableSource::Derived(inner) => inner.contains_source(query_source),
        })
    }

    /// Column expression for `column` of `query_source`, as seen from this
    /// select. Columns of derived tables are projected on demand.
    pub fn column_for(&mut self, query_source: QuerySourceId, column: &str) -> Option<SqlExpr> {
        for table in &mut self.tables {
            match &mut table.source {
                TableSource::Table(_) if table.query_source == Some(query_source) => {
                    return Some(SqlExpr::column(table.alias.clone(), column));
                }
                TableSource::Table(_) => {}
                TableSource::Derived(inner) => {
                    let Some(inner_expr) = inner.column_for(query_source, column) else {
                        continue;
                    };
                    let index = inner.add_to_projection(ProjectionItem::new(
                        inner_expr,
                        column.to_string(),
                    ));
                    return Some(SqlExpr::column(
                        table.alias.clone(),
                        inner.projection[index].alias.clone(),
                    ));
                }
            }
        }

        None
    }

    /// Retarget every label of `from` to `to`.
    pub fn update_query_source(&mut self, from: QuerySourceId, to: QuerySourceId) {
        for table in &mut self.tables {
            if table.query_source == Some(from) {
                table.query_source = Some(to);
            }
            if let TableSource::Derived(inner) = &mut table.source {
                inner.update_query_source(from, to);
            }
        }
        for item in &mut self.projection {
            if item.query_source == Some(from) {
                item.query_source = Some(to);
            }
        }
    }

    /// Normalize the WHERE and join predicates of this select and every
    /// nested select.
    pub fn normalize(&mut self) {
        self.predicate = self.predicate.take().and_then(|p| {
            let normalized = normalize_predicate(&p);
            (normalized != SqlExpr::Literal(true.into())).then_some(normalized)
        });

        for table in &mut self.tables {
            match &mut table.join {
                JoinKind::Inner(p) | JoinKind::LeftOuter(p) => *p = normalize_predicate(p),
                JoinKind::Root | JoinKind::Cross | JoinKind::CrossLateral => {}
            }
            if let TableSource::Derived(inner) = &mut table.source {
                inner.normalize();
            }
        }
    }

    /// Rewrite column references throughout, nested selects included.
    #[must_use]
    pub fn map_columns(&self, f: &mut dyn FnMut(&str, &str) -> Option<SqlExpr>) -> Self {
        let mut out = self.clone();
        for table in &mut out.tables {
            table.join = match &table.join {
                JoinKind::Inner(p) => JoinKind::Inner(p.map_columns(f)),
                JoinKind::LeftOuter(p) => JoinKind::LeftOuter(p.map_columns(f)),
                other => other.clone(),
            };
            if let TableSource::Derived(inner) = &table.source {
                table.source = TableSource::Derived(Box::new(inner.map_columns(f)));
            }
        }
        for item in &mut out.projection {
            item.expr = item.expr.map_columns(f);
        }
        out.predicate = self.predicate.as_ref().map(|p| p.map_columns(f));
        for ordering in &mut out.order_by {
            ordering.expr = ordering.expr.map_columns(f);
        }

        out
    }

    /// Aliases of every table in this select and nested ones.
    #[must_use]
    pub fn table_aliases(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        for table in &self.tables {
            out.insert(table.alias.clone());
            if let TableSource::Derived(inner) = &table.source {
                out.extend(inner.table_aliases());
            }
        }

        out
    }

    fn derived(&self, alias: &str) -> Option<&Self> {
        self.tables.iter().find_map(|t| match &t.source {
            TableSource::Derived(inner) if t.alias == alias => Some(inner.as_ref()),
            _ => None,
        })
    }
}

fn projection_alias_hint(expr: &SqlExpr) -> String {
    match expr {
        SqlExpr::Column { column, .. } => column.clone(),
        _ => "c".to_string(),
    }
}
