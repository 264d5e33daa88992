use crate::{
    query::{
        expr::{BinaryOp, ClientFunction},
        model::QuerySourceId,
        plan::QueryPlan,
    },
    value::Value,
};
use std::fmt;

///
/// ClientExpr
///
/// Expression evaluated in memory against the bindings of one row.
/// Lowered from `Expr` once translation has decided what stays client-side;
/// subqueries are already compiled into plans.
///

#[derive(Clone, Debug)]
pub enum ClientExpr {
    Constant(Value),
    Parameter(String),
    Source(QuerySourceId),
    Current,

    /// Column of a source shaped as a raw buffer, by ordinal within its
    /// row block. Falls back to `property` when the source is an entity.
    BufferRead {
        source: QuerySourceId,
        index: usize,
        property: String,
    },

    Member {
        target: Box<Self>,
        name: String,
    },
    Binary(BinaryOp, Box<Self>, Box<Self>),
    Not(Box<Self>),
    IsNull(Box<Self>),
    Conditional(Box<Self>, Box<Self>, Box<Self>),
    TypeIs(Box<Self>, String),
    Call(ClientFunction, Vec<Self>),
    SubQuery(Box<QueryPlan>),
    New(Vec<(String, Self)>),
}

impl ClientExpr {
    #[must_use]
    pub fn member(target: Self, name: impl Into<String>) -> Self {
        Self::Member {
            target: Box::new(target),
            name: name.into(),
        }
    }

    /// Subquery plans reachable without entering another plan, in
    /// evaluation order.
    #[must_use]
    pub fn subqueries(&self) -> Vec<&QueryPlan> {
        let mut out = Vec::new();
        self.collect_subqueries(&mut out);

        out
    }

    /// Apply `f` to every subquery plan reachable without entering
    /// another plan.
    pub fn for_each_plan_mut(&mut self, f: &mut dyn FnMut(&mut QueryPlan)) {
        match self {
            Self::Constant(_)
            | Self::Parameter(_)
            | Self::Source(_)
            | Self::Current
            | Self::BufferRead { .. } => {}
            Self::Member { target, .. } => target.for_each_plan_mut(f),
            Self::Binary(_, l, r) => {
                l.for_each_plan_mut(f);
                r.for_each_plan_mut(f);
            }
            Self::Not(inner) | Self::IsNull(inner) | Self::TypeIs(inner, _) => {
                inner.for_each_plan_mut(f);
            }
            Self::Conditional(t, a, b) => {
                t.for_each_plan_mut(f);
                a.for_each_plan_mut(f);
                b.for_each_plan_mut(f);
            }
            Self::Call(_, args) => args.iter_mut().for_each(|a| a.for_each_plan_mut(f)),
            Self::SubQuery(plan) => f(plan),
            Self::New(fields) => fields.iter_mut().for_each(|(_, e)| e.for_each_plan_mut(f)),
        }
    }

    fn collect_subqueries<'a>(&'a self, out: &mut Vec<&'a QueryPlan>) {
        match self {
            Self::Constant(_)
            | Self::Parameter(_)
            | Self::Source(_)
            | Self::Current
            | Self::BufferRead { .. } => {}
            Self::Member { target, .. } => target.collect_subqueries(out),
            Self::Binary(_, l, r) => {
                l.collect_subqueries(out);
                r.collect_subqueries(out);
            }
            Self::Not(inner) | Self::IsNull(inner) | Self::TypeIs(inner, _) => {
                inner.collect_subqueries(out);
            }
            Self::Conditional(t, a, b) => {
                t.collect_subqueries(out);
                a.collect_subqueries(out);
                b.collect_subqueries(out);
            }
            Self::Call(_, args) => args.iter().for_each(|a| a.collect_subqueries(out)),
            Self::SubQuery(plan) => out.push(plan),
            Self::New(fields) => fields.iter().for_each(|(_, e)| e.collect_subqueries(out)),
        }
    }
}

impl fmt::Display for ClientExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Constant(Value::Text(s)) => write!(f, "\"{s}\""),
            Self::Constant(value) => write!(f, "{value}"),
            Self::Parameter(name) => write!(f, "@{name}"),
            Self::Source(id) => write!(f, "[{id}]"),
            Self::Current => write!(f, "[current]"),
            Self::BufferRead {
                source, property, ..
            } => write!(f, "[{source}].{property}"),
            Self::Member { target, name } => write!(f, "{target}.{name}"),
            Self::Binary(op, l, r) => write!(f, "({l} {} {r})", op.symbol()),
            Self::Not(inner) => write!(f, "NOT({inner})"),
            Self::IsNull(inner) => write!(f, "({inner} IS NULL)"),
            Self::Conditional(t, a, b) => write!(f, "IIF({t}, {a}, {b})"),
            Self::TypeIs(inner, ty) => write!(f, "({inner} is {ty})"),
            Self::Call(function, args) => {
                write!(f, "{}(", function.name())?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
            Self::SubQuery(plan) => write!(f, "{{{}}}", plan.method_name()),
            Self::New(fields) => {
                write!(f, "new {{ ")?;
                for (i, (name, expr)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{name} = {expr}")?;
                }
                write!(f, " }}")
            }
        }
    }
}
