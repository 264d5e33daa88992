//! Module: query::sql
//! Responsibility: the SQL expression tree a query is translated into, its
//! predicate normalization, and SQL text generation.
//! Does not own: deciding what is translatable (see `query::translate`).
//! Boundary: `SelectExpression` is plain data; arena handles live in the
//! compilation context.

mod generate;
mod normalize;
mod select;

#[cfg(test)]
mod tests;

use crate::{
    query::{
        expr::BinaryOp,
        model::{OrderDirection, QuerySourceId},
    },
    value::Value,
};
use std::collections::BTreeSet;

// re-exports
pub use generate::{generate_command, generate_sql};
pub use normalize::normalize_predicate;
pub use select::SelectExpression;

///
/// SqlExpr
///

#[derive(Clone, Debug, PartialEq)]
pub enum SqlExpr {
    Column { table: String, column: String },
    Literal(Value),
    Parameter(String),
    Binary(BinaryOp, Box<Self>, Box<Self>),
    And(Vec<Self>),
    Or(Vec<Self>),
    Not(Box<Self>),
    IsNull(Box<Self>),
    IsNotNull(Box<Self>),
    Case {
        condition: Box<Self>,
        then: Box<Self>,
        otherwise: Box<Self>,
    },
    Exists(Box<SelectExpression>),
    Function { name: String, args: Vec<Self> },
    Star,
}

impl SqlExpr {
    pub fn column(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self::Column {
            table: table.into(),
            column: column.into(),
        }
    }

    pub fn literal(value: impl Into<Value>) -> Self {
        Self::Literal(value.into())
    }

    #[must_use]
    pub fn binary(op: BinaryOp, left: Self, right: Self) -> Self {
        match op {
            BinaryOp::And => Self::And(vec![left, right]),
            BinaryOp::Or => Self::Or(vec![left, right]),
            _ => Self::Binary(op, Box::new(left), Box::new(right)),
        }
    }

    #[must_use]
    pub fn equal(left: Self, right: Self) -> Self {
        Self::binary(BinaryOp::Eq, left, right)
    }

    #[must_use]
    pub fn negate(self) -> Self {
        Self::Not(Box::new(self))
    }

    #[must_use]
    pub fn function(name: impl Into<String>, args: Vec<Self>) -> Self {
        Self::Function {
            name: name.into(),
            args,
        }
    }

    /// `CASE WHEN self THEN TRUE ELSE FALSE END`.
    #[must_use]
    pub fn to_boolean_case(self) -> Self {
        Self::Case {
            condition: Box::new(self),
            then: Box::new(Self::Literal(Value::Bool(true))),
            otherwise: Box::new(Self::Literal(Value::Bool(false))),
        }
    }

    /// AND of all parts; `None` when there are none.
    #[must_use]
    pub fn conjunction(mut parts: Vec<Self>) -> Option<Self> {
        match parts.len() {
            0 => None,
            1 => parts.pop(),
            _ => Some(Self::And(parts)),
        }
    }

    /// True for expressions producing a search condition rather than a value.
    #[must_use]
    pub const fn is_condition(&self) -> bool {
        match self {
            Self::Binary(op, _, _) => op.is_comparison(),
            Self::And(_)
            | Self::Or(_)
            | Self::Not(_)
            | Self::IsNull(_)
            | Self::IsNotNull(_)
            | Self::Exists(_) => true,
            _ => false,
        }
    }

    /// Rewrite column references, descending into nested selects.
    #[must_use]
    pub fn map_columns(&self, f: &mut dyn FnMut(&str, &str) -> Option<Self>) -> Self {
        match self {
            Self::Column { table, column } => f(table, column).unwrap_or_else(|| self.clone()),
            Self::Literal(_) | Self::Parameter(_) | Self::Star => self.clone(),
            Self::Binary(op, l, r) => {
                Self::Binary(*op, Box::new(l.map_columns(f)), Box::new(r.map_columns(f)))
            }
            Self::And(parts) => Self::And(parts.iter().map(|p| p.map_columns(f)).collect()),
            Self::Or(parts) => Self::Or(parts.iter().map(|p| p.map_columns(f)).collect()),
            Self::Not(inner) => Self::Not(Box::new(inner.map_columns(f))),
            Self::IsNull(inner) => Self::IsNull(Box::new(inner.map_columns(f))),
            Self::IsNotNull(inner) => Self::IsNotNull(Box::new(inner.map_columns(f))),
            Self::Case {
                condition,
                then,
                otherwise,
            } => Self::Case {
                condition: Box::new(condition.map_columns(f)),
                then: Box::new(then.map_columns(f)),
                otherwise: Box::new(otherwise.map_columns(f)),
            },
            Self::Exists(select) => Self::Exists(Box::new(select.map_columns(f))),
            Self::Function { name, args } => Self::Function {
                name: name.clone(),
                args: args.iter().map(|a| a.map_columns(f)).collect(),
            },
        }
    }

    /// Table aliases referenced anywhere in this expression.
    #[must_use]
    pub fn referenced_tables(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        let _ = self.map_columns(&mut |table, _| {
            out.insert(table.to_string());
            None
        });

        out
    }
}

///
/// SqlOrdering
///

#[derive(Clone, Debug, PartialEq)]
pub struct SqlOrdering {
    pub expr: SqlExpr,
    pub direction: OrderDirection,
}

impl SqlOrdering {
    #[must_use]
    pub const fn new(expr: SqlExpr, direction: OrderDirection) -> Self {
        Self { expr, direction }
    }

    #[must_use]
    pub const fn asc(expr: SqlExpr) -> Self {
        Self::new(expr, OrderDirection::Ascending)
    }

    #[must_use]
    pub const fn desc(expr: SqlExpr) -> Self {
        Self::new(expr, OrderDirection::Descending)
    }
}

///
/// ProjectionItem
///
/// One projected column. `query_source` and `property` label columns that
/// belong to a query source's row block.
///

#[derive(Clone, Debug, PartialEq)]
pub struct ProjectionItem {
    pub expr: SqlExpr,
    pub alias: String,
    pub query_source: Option<QuerySourceId>,
    pub property: Option<String>,
}

impl ProjectionItem {
    pub fn new(expr: SqlExpr, alias: impl Into<String>) -> Self {
        Self {
            expr,
            alias: alias.into(),
            query_source: None,
            property: None,
        }
    }

    #[must_use]
    pub fn for_source(mut self, query_source: QuerySourceId, property: impl Into<String>) -> Self {
        self.query_source = Some(query_source);
        self.property = Some(property.into());
        self
    }
}

///
/// JoinKind
///

#[derive(Clone, Debug, PartialEq)]
pub enum JoinKind {
    Root,
    Inner(SqlExpr),
    LeftOuter(SqlExpr),
    Cross,
    CrossLateral,
}

impl JoinKind {
    #[must_use]
    pub const fn predicate(&self) -> Option<&SqlExpr> {
        match self {
            Self::Inner(p) | Self::LeftOuter(p) => Some(p),
            Self::Root | Self::Cross | Self::CrossLateral => None,
        }
    }
}

///
/// TableSource
///

#[derive(Clone, Debug, PartialEq)]
pub enum TableSource {
    Table(String),
    Derived(Box<SelectExpression>),
}

///
/// TableExpr
///

#[derive(Clone, Debug, PartialEq)]
pub struct TableExpr {
    pub alias: String,
    pub query_source: Option<QuerySourceId>,
    pub source: TableSource,
    pub join: JoinKind,
}

impl TableExpr {
    pub fn table(
        name: impl Into<String>,
        alias: impl Into<String>,
        query_source: QuerySourceId,
    ) -> Self {
        Self {
            alias: alias.into(),
            query_source: Some(query_source),
            source: TableSource::Table(name.into()),
            join: JoinKind::Root,
        }
    }

    #[must_use]
    pub fn derived(select: SelectExpression, alias: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            query_source: None,
            source: TableSource::Derived(Box::new(select)),
            join: JoinKind::Root,
        }
    }
}

///
/// AliasGenerator
///
/// Hands out table aliases unique across one compilation: `c`, `c0`, `c1`.
///

#[derive(Clone, Debug, Default)]
pub struct AliasGenerator {
    used: BTreeSet<String>,
}

impl AliasGenerator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unique(&mut self, hint: &str) -> String {
        let base = hint
            .chars()
            .find(char::is_ascii_alphabetic)
            .map_or_else(|| "t".to_string(), |c| c.to_ascii_lowercase().to_string());

        unique_name(&mut self.used, &base)
    }
}

// First free name among `base`, `base0`, `base1`, ...
pub(crate) fn unique_name(used: &mut BTreeSet<String>, base: &str) -> String {
    if used.insert(base.to_string()) {
        return base.to_string();
    }

    let mut n = 0usize;
    loop {
        let candidate = format!("{base}{n}");
        if used.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}
