use crate::query::expr::Expr;
use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering as AtomicOrdering},
    },
};

///
/// QuerySourceId
///
/// Opaque identity of one from/join clause.
///

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct QuerySourceId(u32);

impl QuerySourceId {
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for QuerySourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

///
/// SourceAllocator
///
/// Shared id counter. Clones hand out ids from the same sequence, so a
/// subquery built with a clone never collides with its outer query.
///

#[derive(Clone, Debug, Default)]
pub struct SourceAllocator(Arc<AtomicU32>);

impl SourceAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocator whose first id is `first`.
    #[must_use]
    pub fn starting_at(first: u32) -> Self {
        Self(Arc::new(AtomicU32::new(first)))
    }

    #[must_use]
    pub fn next(&self) -> QuerySourceId {
        QuerySourceId(self.0.fetch_add(1, AtomicOrdering::Relaxed))
    }
}

///
/// FromClause
///

#[derive(Clone, Debug, PartialEq)]
pub struct FromClause {
    pub id: QuerySourceId,
    pub item_name: String,
    pub source: Expr,
}

///
/// JoinClause
///
/// Inner equi-join of `inner` on `outer_key == inner_key`.
///

#[derive(Clone, Debug, PartialEq)]
pub struct JoinClause {
    pub id: QuerySourceId,
    pub item_name: String,
    pub inner: Expr,
    pub outer_key: Expr,
    pub inner_key: Expr,
}

///
/// GroupJoinClause
///
/// Join whose matches are bound as one sequence under `id`; `join.id`
/// names a single inner element inside the key selectors.
///

#[derive(Clone, Debug, PartialEq)]
pub struct GroupJoinClause {
    pub id: QuerySourceId,
    pub item_name: String,
    pub join: JoinClause,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum OrderDirection {
    #[default]
    Ascending,
    Descending,
}

impl OrderDirection {
    #[must_use]
    pub const fn reversed(self) -> Self {
        match self {
            Self::Ascending => Self::Descending,
            Self::Descending => Self::Ascending,
        }
    }
}

///
/// Ordering
///

#[derive(Clone, Debug, PartialEq)]
pub struct Ordering {
    pub expr: Expr,
    pub direction: OrderDirection,
}

impl Ordering {
    #[must_use]
    pub const fn asc(expr: Expr) -> Self {
        Self {
            expr,
            direction: OrderDirection::Ascending,
        }
    }

    #[must_use]
    pub const fn desc(expr: Expr) -> Self {
        Self {
            expr,
            direction: OrderDirection::Descending,
        }
    }
}

///
/// BodyClause
///

#[derive(Clone, Debug, PartialEq)]
pub enum BodyClause {
    Where(Expr),
    OrderBy(Vec<Ordering>),
    AdditionalFrom(FromClause),
    Join(JoinClause),
    GroupJoin(GroupJoinClause),
}

///
/// ResultOperator
///
/// Operators applied to the selected sequence, in order. Predicates and
/// selectors refer to the selected element through `Expr::Current`.
///

#[derive(Clone, Debug, PartialEq)]
pub enum ResultOperator {
    First { or_default: bool },
    Single { or_default: bool },
    Last { or_default: bool },
    Count,
    LongCount,
    Any,
    All(Expr),
    Contains(Expr),
    Distinct,
    Take(Expr),
    Skip(Expr),
    DefaultIfEmpty,
    Min,
    Max,
    Sum,
    Average,
    GroupBy { key: Expr, element: Expr },
    Include(String),
}

impl ResultOperator {
    /// True when the operator reduces the sequence to one value.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::First { .. }
                | Self::Single { .. }
                | Self::Last { .. }
                | Self::Count
                | Self::LongCount
                | Self::Any
                | Self::All(_)
                | Self::Contains(_)
                | Self::Min
                | Self::Max
                | Self::Sum
                | Self::Average
        )
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::First { or_default: false } => "First",
            Self::First { or_default: true } => "FirstOrDefault",
            Self::Single { or_default: false } => "Single",
            Self::Single { or_default: true } => "SingleOrDefault",
            Self::Last { or_default: false } => "Last",
            Self::Last { or_default: true } => "LastOrDefault",
            Self::Count => "Count",
            Self::LongCount => "LongCount",
            Self::Any => "Any",
            Self::All(_) => "All",
            Self::Contains(_) => "Contains",
            Self::Distinct => "Distinct",
            Self::Take(_) => "Take",
            Self::Skip(_) => "Skip",
            Self::DefaultIfEmpty => "DefaultIfEmpty",
            Self::Min => "Min",
            Self::Max => "Max",
            Self::Sum => "Sum",
            Self::Average => "Average",
            Self::GroupBy { .. } => "GroupBy",
            Self::Include(_) => "Include",
        }
    }
}

///
/// QueryModel
///
/// One query: a main source, body clauses, a selector, and result
/// operators. Immutable once built.
///

#[derive(Clone, Debug, PartialEq)]
pub struct QueryModel {
    pub main_from: FromClause,
    pub body: Vec<BodyClause>,
    pub select: Expr,
    pub result_operators: Vec<ResultOperator>,
}

impl QueryModel {
    pub fn builder(
        id: QuerySourceId,
        item_name: impl Into<String>,
        source: Expr,
    ) -> QueryModelBuilder {
        QueryModelBuilder::new(id, item_name, source)
    }

    /// Visit every expression of this model, nested subqueries included.
    pub fn walk_expressions(&self, f: &mut dyn FnMut(&Expr)) {
        self.main_from.source.walk(f);
        for clause in &self.body {
            match clause {
                BodyClause::Where(predicate) => predicate.walk(f),
                BodyClause::OrderBy(orderings) => orderings.iter().for_each(|o| o.expr.walk(f)),
                BodyClause::AdditionalFrom(from) => from.source.walk(f),
                BodyClause::Join(join) => walk_join(join, f),
                BodyClause::GroupJoin(group) => walk_join(&group.join, f),
            }
        }
        self.select.walk(f);
        for op in &self.result_operators {
            match op {
                ResultOperator::All(e)
                | ResultOperator::Contains(e)
                | ResultOperator::Take(e)
                | ResultOperator::Skip(e) => e.walk(f),
                ResultOperator::GroupBy { key, element } => {
                    key.walk(f);
                    element.walk(f);
                }
                _ => {}
            }
        }
    }

    /// Every query source declared by this model and its subqueries.
    #[must_use]
    pub fn declared_sources(&self) -> Vec<QuerySourceId> {
        let mut out = clause_sources(self);
        self.walk_expressions(&mut |expr| {
            if let Expr::SubQuery(model) = expr {
                out.extend(clause_sources(model));
            }
        });

        out
    }
}

fn clause_sources(model: &QueryModel) -> Vec<QuerySourceId> {
    let mut out = vec![model.main_from.id];
    for clause in &model.body {
        match clause {
            BodyClause::AdditionalFrom(from) => out.push(from.id),
            BodyClause::Join(join) => out.push(join.id),
            BodyClause::GroupJoin(group) => {
                out.push(group.id);
                out.push(group.join.id);
            }
            BodyClause::Where(_) | BodyClause::OrderBy(_) => {}
        }
    }

    out
}

fn walk_join(join: &JoinClause, f: &mut dyn FnMut(&Expr)) {
    join.inner.walk(f);
    join.outer_key.walk(f);
    join.inner_key.walk(f);
}

impl fmt::Display for QueryModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "from {} in {}",
            self.main_from.item_name, self.main_from.source
        )?;
        for clause in &self.body {
            match clause {
                BodyClause::Where(predicate) => write!(f, " where {predicate}")?,
                BodyClause::OrderBy(orderings) => {
                    write!(f, " orderby ")?;
                    for (i, o) in orderings.iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        let dir = match o.direction {
                            OrderDirection::Ascending => "asc",
                            OrderDirection::Descending => "desc",
                        };
                        write!(f, "{} {dir}", o.expr)?;
                    }
                }
                BodyClause::AdditionalFrom(from) => {
                    write!(f, " from {} in {}", from.item_name, from.source)?;
                }
                BodyClause::Join(join) => write!(
                    f,
                    " join {} in {} on {} equals {}",
                    join.item_name, join.inner, join.outer_key, join.inner_key
                )?,
                BodyClause::GroupJoin(group) => write!(
                    f,
                    " join {} in {} on {} equals {} into {}",
                    group.join.item_name,
                    group.join.inner,
                    group.join.outer_key,
                    group.join.inner_key,
                    group.item_name
                )?,
            }
        }
        write!(f, " select {}", self.select)?;
        for op in &self.result_operators {
            write!(f, " => {}()", op.name())?;
        }

        Ok(())
    }
}

///
/// QueryModelBuilder
///

#[derive(Debug)]
pub struct QueryModelBuilder {
    model: QueryModel,
}

impl QueryModelBuilder {
    pub fn new(id: QuerySourceId, item_name: impl Into<String>, source: Expr) -> Self {
        Self {
            model: QueryModel {
                main_from: FromClause {
                    id,
                    item_name: item_name.into(),
                    source,
                },
                body: Vec::new(),
                select: Expr::QuerySource(id),
                result_operators: Vec::new(),
            },
        }
    }

    #[must_use]
    pub fn filter(mut self, predicate: Expr) -> Self {
        self.model.body.push(BodyClause::Where(predicate));
        self
    }

    #[must_use]
    pub fn order_by(mut self, orderings: Vec<Ordering>) -> Self {
        self.model.body.push(BodyClause::OrderBy(orderings));
        self
    }

    #[must_use]
    pub fn additional_from(
        mut self,
        id: QuerySourceId,
        item_name: impl Into<String>,
        source: Expr,
    ) -> Self {
        self.model.body.push(BodyClause::AdditionalFrom(FromClause {
            id,
            item_name: item_name.into(),
            source,
        }));
        self
    }

    #[must_use]
    pub fn join(
        mut self,
        id: QuerySourceId,
        item_name: impl Into<String>,
        inner: Expr,
        outer_key: Expr,
        inner_key: Expr,
    ) -> Self {
        self.model.body.push(BodyClause::Join(JoinClause {
            id,
            item_name: item_name.into(),
            inner,
            outer_key,
            inner_key,
        }));
        self
    }

    /// Group join binding matches under `group`; `element` names one inner
    /// row inside `inner_key`.
    #[must_use]
    pub fn group_join(
        mut self,
        group: QuerySourceId,
        item_name: impl Into<String>,
        element: QuerySourceId,
        inner: Expr,
        outer_key: Expr,
        inner_key: Expr,
    ) -> Self {
        let item_name = item_name.into();
        self.model.body.push(BodyClause::GroupJoin(GroupJoinClause {
            id: group,
            item_name: item_name.clone(),
            join: JoinClause {
                id: element,
                item_name,
                inner,
                outer_key,
                inner_key,
            },
        }));
        self
    }

    #[must_use]
    pub fn select(mut self, selector: Expr) -> Self {
        self.model.select = selector;
        self
    }

    #[must_use]
    pub fn result(mut self, op: ResultOperator) -> Self {
        self.model.result_operators.push(op);
        self
    }

    #[must_use]
    pub fn build(self) -> QueryModel {
        self.model
    }
}
