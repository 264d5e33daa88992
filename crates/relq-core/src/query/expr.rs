use crate::{
    query::model::{QueryModel, QuerySourceId},
    value::{ArithmeticOp, Value},
};
use std::{fmt, sync::Arc};

///
/// BinaryOp
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BinaryOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl BinaryOp {
    #[must_use]
    pub const fn is_comparison(self) -> bool {
        matches!(
            self,
            Self::Eq | Self::Ne | Self::Lt | Self::Le | Self::Gt | Self::Ge
        )
    }

    #[must_use]
    pub const fn is_logical(self) -> bool {
        matches!(self, Self::And | Self::Or)
    }

    #[must_use]
    pub const fn arithmetic(self) -> Option<ArithmeticOp> {
        match self {
            Self::Add => Some(ArithmeticOp::Add),
            Self::Sub => Some(ArithmeticOp::Sub),
            Self::Mul => Some(ArithmeticOp::Mul),
            Self::Div => Some(ArithmeticOp::Div),
            Self::Mod => Some(ArithmeticOp::Mod),
            _ => None,
        }
    }

    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "<>",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::And => "AND",
            Self::Or => "OR",
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Mod => "%",
        }
    }

    /// Binding strength used when parenthesizing generated text.
    #[must_use]
    pub const fn precedence(self) -> u8 {
        match self {
            Self::Or => 1,
            Self::And => 2,
            Self::Eq | Self::Ne | Self::Lt | Self::Le | Self::Gt | Self::Ge => 4,
            Self::Add | Self::Sub => 5,
            Self::Mul | Self::Div | Self::Mod => 6,
        }
    }
}

/// Body of a client-only function.
pub type ClientFn = Arc<dyn Fn(&[Value]) -> Value + Send + Sync>;

///
/// ClientFunction
///
/// Named function with no SQL translation. Any expression calling one is
/// evaluated in memory.
///

#[derive(Clone)]
pub struct ClientFunction {
    name: String,
    body: ClientFn,
}

impl ClientFunction {
    pub fn new(
        name: impl Into<String>,
        body: impl Fn(&[Value]) -> Value + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            body: Arc::new(body),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn call(&self, args: &[Value]) -> Value {
        (self.body)(args)
    }
}

impl fmt::Debug for ClientFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ClientFunction").field(&self.name).finish()
    }
}

impl PartialEq for ClientFunction {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && Arc::ptr_eq(&self.body, &other.body)
    }
}

///
/// Expr
///
/// Expression tree of the query model. Query sources are referenced by id;
/// `Current` is the element flowing into a result operator.
///

#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Constant(Value),
    Parameter(String),
    EntitySet(String),
    QuerySource(QuerySourceId),
    Current,
    Member(Box<Self>, String),
    Binary(BinaryOp, Box<Self>, Box<Self>),
    Not(Box<Self>),
    IsNull(Box<Self>),
    Conditional(Box<Self>, Box<Self>, Box<Self>),
    TypeIs(Box<Self>, String),
    Call(ClientFunction, Vec<Self>),
    SubQuery(Box<QueryModel>),
    New(Vec<(String, Self)>),
}

impl Expr {
    pub fn constant(value: impl Into<Value>) -> Self {
        Self::Constant(value.into())
    }

    pub fn param(name: impl Into<String>) -> Self {
        Self::Parameter(name.into())
    }

    pub fn entity_set(entity: impl Into<String>) -> Self {
        Self::EntitySet(entity.into())
    }

    #[must_use]
    pub const fn source(id: QuerySourceId) -> Self {
        Self::QuerySource(id)
    }

    #[must_use]
    pub fn member(self, name: impl Into<String>) -> Self {
        Self::Member(Box::new(self), name.into())
    }

    #[must_use]
    pub fn binary(op: BinaryOp, left: Self, right: Self) -> Self {
        Self::Binary(op, Box::new(left), Box::new(right))
    }

    #[must_use]
    pub fn equal(self, other: Self) -> Self {
        Self::binary(BinaryOp::Eq, self, other)
    }

    #[must_use]
    pub fn not_equal(self, other: Self) -> Self {
        Self::binary(BinaryOp::Ne, self, other)
    }

    #[must_use]
    pub fn less_than(self, other: Self) -> Self {
        Self::binary(BinaryOp::Lt, self, other)
    }

    #[must_use]
    pub fn greater_than(self, other: Self) -> Self {
        Self::binary(BinaryOp::Gt, self, other)
    }

    #[must_use]
    pub fn and(self, other: Self) -> Self {
        Self::binary(BinaryOp::And, self, other)
    }

    #[must_use]
    pub fn or(self, other: Self) -> Self {
        Self::binary(BinaryOp::Or, self, other)
    }

    #[must_use]
    pub fn negate(self) -> Self {
        Self::Not(Box::new(self))
    }

    #[must_use]
    pub fn is_null(self) -> Self {
        Self::IsNull(Box::new(self))
    }

    #[must_use]
    pub fn type_is(self, entity: impl Into<String>) -> Self {
        Self::TypeIs(Box::new(self), entity.into())
    }

    #[must_use]
    pub fn conditional(test: Self, then: Self, otherwise: Self) -> Self {
        Self::Conditional(Box::new(test), Box::new(then), Box::new(otherwise))
    }

    #[must_use]
    pub fn call(function: ClientFunction, args: Vec<Self>) -> Self {
        Self::Call(function, args)
    }

    #[must_use]
    pub fn subquery(model: QueryModel) -> Self {
        Self::SubQuery(Box::new(model))
    }

    #[must_use]
    pub fn new_record<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = (S, Self)>,
        S: Into<String>,
    {
        Self::New(fields.into_iter().map(|(n, e)| (n.into(), e)).collect())
    }

    /// Replace every `Current` outside nested subqueries with `with`.
    #[must_use]
    pub fn replace_current(&self, with: &Self) -> Self {
        self.rewrite(&mut |expr| matches!(expr, Self::Current).then(|| with.clone()))
    }

    /// Top-down rewrite: `f` may replace a node; children of a replaced
    /// node are not visited. Subquery bodies are left untouched.
    #[must_use]
    pub fn rewrite(&self, f: &mut dyn FnMut(&Self) -> Option<Self>) -> Self {
        if let Some(replaced) = f(self) {
            return replaced;
        }

        match self {
            Self::Constant(_)
            | Self::Parameter(_)
            | Self::EntitySet(_)
            | Self::QuerySource(_)
            | Self::Current
            | Self::SubQuery(_) => self.clone(),
            Self::Member(target, name) => Self::Member(Box::new(target.rewrite(f)), name.clone()),
            Self::Binary(op, l, r) => Self::binary(*op, l.rewrite(f), r.rewrite(f)),
            Self::Not(inner) => Self::Not(Box::new(inner.rewrite(f))),
            Self::IsNull(inner) => Self::IsNull(Box::new(inner.rewrite(f))),
            Self::Conditional(t, a, b) => Self::conditional(t.rewrite(f), a.rewrite(f), b.rewrite(f)),
            Self::TypeIs(inner, ty) => Self::TypeIs(Box::new(inner.rewrite(f)), ty.clone()),
            Self::Call(function, args) => {
                Self::Call(function.clone(), args.iter().map(|a| a.rewrite(f)).collect())
            }
            Self::New(fields) => Self::New(
                fields
                    .iter()
                    .map(|(n, e)| (n.clone(), e.rewrite(f)))
                    .collect(),
            ),
        }
    }

    /// Pre-order walk, descending into subquery models.
    pub fn walk(&self, f: &mut dyn FnMut(&Self)) {
        f(self);
        match self {
            Self::Constant(_)
            | Self::Parameter(_)
            | Self::EntitySet(_)
            | Self::QuerySource(_)
            | Self::Current => {}
            Self::Member(inner, _) | Self::Not(inner) | Self::IsNull(inner) | Self::TypeIs(inner, _) => {
                inner.walk(f);
            }
            Self::Binary(_, l, r) => {
                l.walk(f);
                r.walk(f);
            }
            Self::Conditional(t, a, b) => {
                t.walk(f);
                a.walk(f);
                b.walk(f);
            }
            Self::Call(_, args) => args.iter().for_each(|a| a.walk(f)),
            Self::SubQuery(model) => model.walk_expressions(f),
            Self::New(fields) => fields.iter().for_each(|(_, e)| e.walk(f)),
        }
    }

    /// Query source referenced directly as `source.member`, if any.
    #[must_use]
    pub fn as_source_member(&self) -> Option<(QuerySourceId, &String)> {
        match self {
            Self::Member(target, name) => match **target {
                Self::QuerySource(id) => Some((id, name)),
                _ => None,
            },
            _ => None,
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Constant(Value::Text(s)) => write!(f, "\"{s}\""),
            Self::Constant(value) => write!(f, "{value}"),
            Self::Parameter(name) => write!(f, "@{name}"),
            Self::EntitySet(entity) => write!(f, "Set<{entity}>"),
            Self::QuerySource(id) => write!(f, "[{id}]"),
            Self::Current => write!(f, "[current]"),
            Self::Member(target, name) => write!(f, "{target}.{name}"),
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
            Self::SubQuery(model) => write!(f, "{{{model}}}"),
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
