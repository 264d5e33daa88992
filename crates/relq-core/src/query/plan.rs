use crate::{
    query::{ClientExpr, OrderDirection, QuerySourceId, Shaper, context::SelectId},
    storage::RelationalCommand,
};
use std::sync::Arc;

///
/// ShapedQuery
///
/// Leaf of a plan: one SQL command and the shaper applied to its rows.
///

#[derive(Clone, Debug)]
pub struct ShapedQuery {
    pub select: SelectId,
    pub command: Option<Arc<RelationalCommand>>,
    pub shaper: Shaper,

    /// An all-null first row means the sequence is empty.
    pub default_if_empty: bool,
}

impl ShapedQuery {
    #[must_use]
    pub const fn new(select: SelectId, shaper: Shaper) -> Self {
        Self {
            select,
            command: None,
            shaper,
            default_if_empty: false,
        }
    }
}

///
/// CollectionInclude
///
/// Collection navigation loaded through a secondary cursor ordered like
/// the principal rows. `depth` is the 1-based include depth.
///

#[derive(Clone, Debug)]
pub struct CollectionInclude {
    pub navigation: String,
    pub source: QuerySourceId,
    pub principal_type: String,
    pub target_type: String,
    pub depth: usize,
    pub outer_select: SelectId,
    pub select: Option<SelectId>,
    pub command: Option<Arc<RelationalCommand>>,
    pub principal_key: Vec<String>,
    pub foreign_key: Vec<String>,

    /// Ordinals of `foreign_key` within one secondary row.
    pub foreign_ordinals: Vec<usize>,
}

///
/// ClientOp
///
/// Result operator evaluated over materialized items.
///

#[derive(Clone, Debug)]
pub enum ClientOp {
    First { or_default: bool },
    Single { or_default: bool },
    Last { or_default: bool },
    Count,
    LongCount,
    Any,
    All(ClientExpr),
    Contains(ClientExpr),
    Distinct,
    Take(ClientExpr),
    Skip(ClientExpr),
    DefaultIfEmpty,
    Min,
    Max,
    Sum,
    Average,
    GroupBy { key: ClientExpr, element: ClientExpr },
}

impl ClientOp {
    /// True when the operator reduces its input to one value.
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
            Self::GroupBy { .. } => "ClientGroupBy",
        }
    }

    fn exprs_mut(&mut self) -> Vec<&mut ClientExpr> {
        match self {
            Self::All(e) | Self::Contains(e) | Self::Take(e) | Self::Skip(e) => vec![e],
            Self::GroupBy { key, element } => vec![key, element],
            _ => Vec::new(),
        }
    }
}

///
/// QueryPlan
///
/// Executable query: a tree of tagged query methods interpreted by the
/// sync or async operator family.
///

#[derive(Clone, Debug)]
pub enum QueryPlan {
    Shaped(ShapedQuery),

    /// Client value evaluated once and iterated.
    Sequence(ClientExpr),

    /// Bind every element of `input` to `source`.
    FromSequence {
        source: QuerySourceId,
        input: Box<Self>,
    },

    Where {
        input: Box<Self>,
        predicate: ClientExpr,
    },
    OrderBy {
        input: Box<Self>,
        orderings: Vec<(ClientExpr, OrderDirection)>,
    },

    /// Hash join; outer order is preserved.
    Join {
        outer: Box<Self>,
        inner: Box<Self>,
        outer_key: ClientExpr,
        inner_key: ClientExpr,
    },

    /// Client group join. `element` is bound per inner row while the
    /// inner key is evaluated; matches are bound as a sequence to `group`.
    GroupJoin {
        outer: Box<Self>,
        inner: Box<Self>,
        outer_key: ClientExpr,
        inner_key: ClientExpr,
        element: QuerySourceId,
        group: QuerySourceId,
    },

    /// Nested iteration of `inner` per outer row, with the outer row in scope.
    SelectMany {
        outer: Box<Self>,
        inner: Box<Self>,
    },

    /// Group join over LEFT JOINed rows ordered by the outer block.
    StreamingGroupJoin {
        input: Box<Self>,
        outer_width: usize,
        element: QuerySourceId,
        group: QuerySourceId,
        outer_key: ClientExpr,
        inner_key: ClientExpr,
    },

    Include {
        input: Box<Self>,
        collections: Vec<CollectionInclude>,
    },

    /// Register named parameter values, evaluated in the outer scope, for
    /// the lifetime of the enumeration of `input`.
    InjectParameters {
        input: Box<Self>,
        names: Vec<String>,
        values: Vec<ClientExpr>,
    },

    Select {
        input: Box<Self>,
        selector: ClientExpr,
    },

    /// Group consecutive equal keys of an input ordered by the key.
    StreamingGroupBy {
        input: Box<Self>,
        key: ClientExpr,
        element: ClientExpr,
    },

    ResultOp {
        input: Box<Self>,
        op: ClientOp,
    },
}

impl QueryPlan {
    #[must_use]
    pub fn method_name(&self) -> &'static str {
        match self {
            Self::Shaped(shaped) if shaped.default_if_empty => "DefaultIfEmptyShapedQuery",
            Self::Shaped(_) => "ShapedQuery",
            Self::Sequence(_) => "Sequence",
            Self::FromSequence { .. } => "FromSequence",
            Self::Where { .. } => "Where",
            Self::OrderBy { .. } => "OrderBy",
            Self::Join { .. } => "Join",
            Self::GroupJoin { .. } => "ClientGroupJoin",
            Self::SelectMany { .. } => "SelectMany",
            Self::StreamingGroupJoin { .. } => "GroupJoin",
            Self::Include { .. } => "Include",
            Self::InjectParameters { .. } => "InjectParameters",
            Self::Select { .. } => "Select",
            Self::StreamingGroupBy { .. } => "GroupBy",
            Self::ResultOp { op, .. } => op.name(),
        }
    }

    /// True when the plan yields exactly one value.
    #[must_use]
    pub fn is_scalar(&self) -> bool {
        match self {
            Self::ResultOp { op, .. } => op.is_terminal(),
            Self::InjectParameters { input, .. } | Self::Include { input, .. } => {
                input.is_scalar()
            }
            _ => false,
        }
    }

    /// The shaped leaf feeding this plan through row-preserving wrappers.
    #[must_use]
    pub fn shaped_leaf(&self) -> Option<&ShapedQuery> {
        match self {
            Self::Shaped(shaped) => Some(shaped),
            Self::Include { input, .. } => input.shaped_leaf(),
            _ => None,
        }
    }

    pub fn shaped_leaf_mut(&mut self) -> Option<&mut ShapedQuery> {
        match self {
            Self::Shaped(shaped) => Some(shaped),
            Self::Include { input, .. } => input.shaped_leaf_mut(),
            _ => None,
        }
    }

    /// Direct child plans, including plans nested in client expressions.
    pub fn for_each_child_mut(&mut self, f: &mut dyn FnMut(&mut Self)) {
        match self {
            Self::Shaped(shaped) => {
                shaper_exprs_mut(&mut shaped.shaper, &mut |e| e.for_each_plan_mut(f));
            }
            Self::Sequence(expr) => expr.for_each_plan_mut(f),
            Self::FromSequence { input, .. } => f(input),
            Self::Where { input, predicate } => {
                f(input);
                predicate.for_each_plan_mut(f);
            }
            Self::OrderBy { input, orderings } => {
                f(input);
                for (expr, _) in orderings {
                    expr.for_each_plan_mut(f);
                }
            }
            Self::Join {
                outer,
                inner,
                outer_key,
                inner_key,
            }
            | Self::GroupJoin {
                outer,
                inner,
                outer_key,
                inner_key,
                ..
            } => {
                f(outer);
                f(inner);
                outer_key.for_each_plan_mut(f);
                inner_key.for_each_plan_mut(f);
            }
            Self::SelectMany { outer, inner } => {
                f(outer);
                f(inner);
            }
            Self::StreamingGroupJoin {
                input,
                outer_key,
                inner_key,
                ..
            } => {
                f(input);
                outer_key.for_each_plan_mut(f);
                inner_key.for_each_plan_mut(f);
            }
            Self::Include { input, .. } => f(input),
            Self::InjectParameters { input, values, .. } => {
                f(input);
                for value in values {
                    value.for_each_plan_mut(f);
                }
            }
            Self::Select { input, selector } => {
                f(input);
                selector.for_each_plan_mut(f);
            }
            Self::StreamingGroupBy {
                input,
                key,
                element,
            } => {
                f(input);
                key.for_each_plan_mut(f);
                element.for_each_plan_mut(f);
            }
            Self::ResultOp { input, op } => {
                f(input);
                for expr in op.exprs_mut() {
                    expr.for_each_plan_mut(f);
                }
            }
        }
    }

    /// Visit this plan and every nested plan, root first.
    pub fn walk_mut(&mut self, f: &mut dyn FnMut(&mut Self)) {
        f(self);
        self.for_each_child_mut(&mut |child| child.walk_mut(f));
    }

    /// Method names of this plan and its nested plans, root first.
    #[must_use]
    pub fn method_names(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        let mut copy = self.clone();
        copy.walk_mut(&mut |plan| out.push(plan.method_name()));

        out
    }
}

fn shaper_exprs_mut(shaper: &mut Shaper, f: &mut dyn FnMut(&mut ClientExpr)) {
    match shaper {
        Shaper::Projection {
            inner, selector, ..
        } => {
            shaper_exprs_mut(inner, f);
            f(selector);
        }
        Shaper::Composite { outer, inner } => {
            shaper_exprs_mut(outer, f);
            shaper_exprs_mut(inner, f);
        }
        Shaper::Entity { .. } | Shaper::ValueBuffer { .. } | Shaper::Scalar { .. } => {}
    }
}
