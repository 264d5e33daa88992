use crate::{
    error::InternalError,
    exec::{ExecutionError, QueryBuffer, QueryResult, Scope},
    model::{Model, NavigationKind, NavigationValue, PropertyKind},
    query::{BinaryOp, ClientExpr, QueryPlan},
    storage::{CommandError, ParameterError},
    value::{Value, strict_order_cmp},
};
use std::{cmp::Ordering, sync::Arc};

///
/// EvalHost
///
/// What client evaluation needs from the running query: the model, the
/// registered parameter values, the query buffer, and a way to run
/// nested plans.
///

pub(crate) trait EvalHost {
    fn model(&self) -> &Model;

    fn parameter(&self, name: &str) -> Option<Value>;

    fn query_buffer(&self) -> &dyn QueryBuffer;

    /// Run `plan` with `scope` as its outer environment. Scalar plans
    /// yield their single value, sequences yield `QueryResult::Sequence`.
    fn subquery(&self, plan: &QueryPlan, scope: &Arc<Scope>)
    -> Result<QueryResult, ExecutionError>;
}

/// Evaluate `expr` in `scope`.
pub(crate) fn evaluate(
    expr: &ClientExpr,
    scope: &Arc<Scope>,
    host: &dyn EvalHost,
) -> Result<QueryResult, ExecutionError> {
    match expr {
        ClientExpr::Constant(value) => Ok(QueryResult::Value(value.clone())),

        ClientExpr::Parameter(name) => host.parameter(name).map(QueryResult::Value).ok_or_else(|| {
            ExecutionError::Command(CommandError::Parameter(ParameterError::MissingValue {
                name: name.clone(),
            }))
        }),

        ClientExpr::Source(source) => scope.lookup(*source).cloned().ok_or_else(|| {
            InternalError::executor_invariant(format!("query source {source} is not bound")).into()
        }),

        ClientExpr::Current => scope.current().cloned().ok_or_else(|| {
            InternalError::executor_invariant("no current element is in scope").into()
        }),

        ClientExpr::BufferRead {
            source,
            index,
            property,
        } => match scope.lookup(*source) {
            Some(QueryResult::Buffer(buffer)) => Ok(QueryResult::Value(buffer.get(*index).clone())),
            Some(other) => member(other.clone(), property, host),
            None => Err(
                InternalError::executor_invariant(format!("query source {source} is not bound"))
                    .into(),
            ),
        },

        ClientExpr::Member { target, name } => member(evaluate(target, scope, host)?, name, host),

        ClientExpr::Binary(op, left, right) => binary(*op, left, right, scope, host),

        ClientExpr::Not(inner) => match evaluate(inner, scope, host)? {
            QueryResult::Value(Value::Bool(b)) => Ok(Value::Bool(!b).into()),
            QueryResult::Value(Value::Null) => Ok(QueryResult::NULL),
            other => Err(ExecutionError::invalid_operand(
                "NOT",
                format!("expected a boolean, found {:?}", other.as_key()),
            )),
        },

        ClientExpr::IsNull(inner) => Ok(Value::Bool(evaluate(inner, scope, host)?.is_null()).into()),

        ClientExpr::Conditional(test, then, otherwise) => {
            if evaluate(test, scope, host)?.is_true() {
                evaluate(then, scope, host)
            } else {
                evaluate(otherwise, scope, host)
            }
        }

        ClientExpr::TypeIs(inner, entity_type) => {
            let matches = match evaluate(inner, scope, host)? {
                QueryResult::Entity(entity) => host
                    .model()
                    .is_assignable(&entity.entity_type(), entity_type),
                _ => false,
            };

            Ok(Value::Bool(matches).into())
        }

        ClientExpr::Call(function, args) => {
            let values = args
                .iter()
                .map(|arg| evaluate(arg, scope, host).map(|v| v.as_key()))
                .collect::<Result<Vec<_>, _>>()?;

            Ok(QueryResult::Value(function.call(&values)))
        }

        ClientExpr::SubQuery(plan) => host.subquery(plan, scope),

        ClientExpr::New(fields) => {
            let fields = fields
                .iter()
                .map(|(name, expr)| evaluate(expr, scope, host).map(|v| (name.clone(), v)))
                .collect::<Result<Vec<_>, _>>()?;

            Ok(QueryResult::Record(fields))
        }
    }
}

/// Client equality: two nulls are equal, a null never equals a value.
#[must_use]
pub(crate) fn client_eq(left: &Value, right: &Value) -> bool {
    left.sql_eq(right)
        .unwrap_or_else(|| left.is_null() && right.is_null())
}

fn binary(
    op: BinaryOp,
    left: &ClientExpr,
    right: &ClientExpr,
    scope: &Arc<Scope>,
    host: &dyn EvalHost,
) -> Result<QueryResult, ExecutionError> {
    match op {
        BinaryOp::And => {
            let outcome =
                evaluate(left, scope, host)?.is_true() && evaluate(right, scope, host)?.is_true();
            return Ok(Value::Bool(outcome).into());
        }
        BinaryOp::Or => {
            let outcome =
                evaluate(left, scope, host)?.is_true() || evaluate(right, scope, host)?.is_true();
            return Ok(Value::Bool(outcome).into());
        }
        _ => {}
    }

    let l = evaluate(left, scope, host)?.as_key();
    let r = evaluate(right, scope, host)?.as_key();

    if let Some(arithmetic) = op.arithmetic() {
        return l
            .arithmetic(arithmetic, &r)
            .map(QueryResult::Value)
            .ok_or_else(|| ExecutionError::invalid_operand(op.symbol(), format!("{l} and {r}")));
    }

    let outcome = match op {
        BinaryOp::Eq => client_eq(&l, &r),
        BinaryOp::Ne => !client_eq(&l, &r),
        _ if l.is_null() || r.is_null() => false,
        _ => {
            let ordering = strict_order_cmp(&l, &r).ok_or_else(|| {
                ExecutionError::invalid_operand(op.symbol(), format!("{l} and {r}"))
            })?;
            match op {
                BinaryOp::Lt => ordering == Ordering::Less,
                BinaryOp::Le => ordering != Ordering::Greater,
                BinaryOp::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            }
        }
    };

    Ok(Value::Bool(outcome).into())
}

/// Read member `name` of an evaluated value.
pub(crate) fn member(
    target: QueryResult,
    name: &str,
    host: &dyn EvalHost,
) -> Result<QueryResult, ExecutionError> {
    match target {
        QueryResult::Value(Value::Null) => Ok(QueryResult::NULL),

        QueryResult::Entity(entity) => {
            let entity_type = entity.entity_type();
            let Some(ty) = host.model().entity(&entity_type) else {
                return Ok(QueryResult::Value(entity.get(name)));
            };

            if let Some(property) = ty.property(name) {
                return Ok(QueryResult::Value(match &property.kind {
                    PropertyKind::Column { .. } => entity.get(name),
                    PropertyKind::Computed(compute) => entity.with(|instance| compute(instance)),
                }));
            }

            let Some(navigation) = ty.navigation(name) else {
                return Err(ExecutionError::invalid_operand(
                    name,
                    format!("entity type '{entity_type}' has no such member"),
                ));
            };

            Ok(match (entity.navigation(name), navigation.kind) {
                (Some(NavigationValue::Reference(Some(related))), _) => {
                    QueryResult::Entity(related)
                }
                (Some(NavigationValue::Collection(items)), _) => {
                    QueryResult::Sequence(items.into_iter().map(QueryResult::Entity).collect())
                }
                (None, NavigationKind::Collection) => QueryResult::Sequence(Vec::new()),
                (Some(NavigationValue::Reference(None)) | None, _) => QueryResult::NULL,
            })
        }

        QueryResult::Record(fields) => fields
            .into_iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value)
            .ok_or_else(|| ExecutionError::invalid_operand(name, "record has no such field")),

        QueryResult::Grouping { key, .. } if name == "Key" => Ok(*key),

        other => Err(ExecutionError::invalid_operand(
            name,
            format!("cannot read a member of {:?}", other.as_key()),
        )),
    }
}
