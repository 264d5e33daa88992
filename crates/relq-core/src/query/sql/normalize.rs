use crate::{
    query::{expr::BinaryOp, sql::SqlExpr},
    value::Value,
};

///
/// Normalize a SQL search condition into a canonical form.
///
/// Normalization guarantees:
/// - Logical equivalence is preserved
/// - Nested AND / OR nodes are flattened
/// - Neutral elements are removed (TRUE / FALSE)
/// - Double negation is eliminated
/// - Identical operands of one AND / OR appear once
/// - `x IS NOT NULL AND x = <non-null literal>` keeps only the equality
///
/// Operand order is preserved so generated SQL follows the query text.
/// Applying the pass twice yields the same tree as applying it once.
///
#[must_use]
pub fn normalize_predicate(predicate: &SqlExpr) -> SqlExpr {
    match predicate {
        SqlExpr::And(children) => normalize_and(children),
        SqlExpr::Or(children) => normalize_or(children),
        SqlExpr::Not(inner) => normalize_not(inner),
        SqlExpr::Case {
            condition,
            then,
            otherwise,
        } => SqlExpr::Case {
            condition: Box::new(normalize_predicate(condition)),
            then: then.clone(),
            otherwise: otherwise.clone(),
        },
        SqlExpr::Exists(select) => {
            let mut select = select.as_ref().clone();
            select.normalize();
            SqlExpr::Exists(Box::new(select))
        }
        other => other.clone(),
    }
}

///
/// Normalize an AND expression.
///
/// Rules:
/// - AND(TRUE, x)        → x
/// - AND(FALSE, x)       → FALSE
/// - AND(AND(a, b), c)   → AND(a, b, c)
/// - AND(x, x)           → x
/// - AND()               → TRUE
///
fn normalize_and(children: &[SqlExpr]) -> SqlExpr {
    let mut out: Vec<SqlExpr> = Vec::new();

    for child in children {
        match normalize_predicate(child) {
            SqlExpr::Literal(Value::Bool(true)) => {}
            SqlExpr::Literal(Value::Bool(false)) => return SqlExpr::Literal(Value::Bool(false)),
            SqlExpr::And(grandchildren) => {
                for grandchild in grandchildren {
                    push_unique(&mut out, grandchild);
                }
            }
            other => push_unique(&mut out, other),
        }
    }

    let equalities: Vec<SqlExpr> = out.iter().filter_map(non_null_equality_operand).collect();
    out.retain(|part| match part {
        SqlExpr::IsNotNull(operand) => !equalities.contains(operand),
        _ => true,
    });

    match out.len() {
        0 => SqlExpr::Literal(Value::Bool(true)),
        1 => out.remove(0),
        _ => SqlExpr::And(out),
    }
}

///
/// Normalize an OR expression.
///
/// Rules:
/// - OR(FALSE, x)        → x
/// - OR(TRUE, x)         → TRUE
/// - OR(OR(a, b), c)     → OR(a, b, c)
/// - OR(x, x)            → x
/// - OR()                → FALSE
///
fn normalize_or(children: &[SqlExpr]) -> SqlExpr {
    let mut out: Vec<SqlExpr> = Vec::new();

    for child in children {
        match normalize_predicate(child) {
            SqlExpr::Literal(Value::Bool(false)) => {}
            SqlExpr::Literal(Value::Bool(true)) => return SqlExpr::Literal(Value::Bool(true)),
            SqlExpr::Or(grandchildren) => {
                for grandchild in grandchildren {
                    push_unique(&mut out, grandchild);
                }
            }
            other => push_unique(&mut out, other),
        }
    }

    match out.len() {
        0 => SqlExpr::Literal(Value::Bool(false)),
        1 => out.remove(0),
        _ => SqlExpr::Or(out),
    }
}

fn normalize_not(inner: &SqlExpr) -> SqlExpr {
    match normalize_predicate(inner) {
        SqlExpr::Not(double) => *double,
        SqlExpr::Literal(Value::Bool(b)) => SqlExpr::Literal(Value::Bool(!b)),
        SqlExpr::IsNull(operand) => SqlExpr::IsNotNull(operand),
        SqlExpr::IsNotNull(operand) => SqlExpr::IsNull(operand),
        other => SqlExpr::Not(Box::new(other)),
    }
}

fn push_unique(out: &mut Vec<SqlExpr>, expr: SqlExpr) {
    if !out.contains(&expr) {
        out.push(expr);
    }
}

// `x` of `x = literal` / `literal = x` when the literal is not null.
fn non_null_equality_operand(expr: &SqlExpr) -> Option<SqlExpr> {
    let SqlExpr::Binary(BinaryOp::Eq, left, right) = expr else {
        return None;
    };

    match (left.as_ref(), right.as_ref()) {
        (operand, SqlExpr::Literal(value)) | (SqlExpr::Literal(value), operand)
            if !value.is_null() =>
        {
            Some(operand.clone())
        }
        _ => None,
    }
}
