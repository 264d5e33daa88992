use crate::value::{ArithmeticOp, OrderedValue, Value, canonical_cmp, strict_order_cmp};
use std::{cmp::Ordering, collections::BTreeMap};

fn v_txt(s: &str) -> Value {
    Value::Text(s.to_string())
}

#[test]
fn canonical_cmp_orders_null_first() {
    let mut values = vec![v_txt("b"), Value::Int(3), Value::Null, Value::Bool(false)];
    values.sort_by(canonical_cmp);

    assert_eq!(
        values,
        vec![Value::Null, Value::Bool(false), Value::Int(3), v_txt("b")]
    );
}

#[test]
fn canonical_cmp_compares_int_and_float_numerically() {
    assert_eq!(
        canonical_cmp(&Value::Int(2), &Value::Float(2.5)),
        Ordering::Less
    );
    assert_eq!(
        canonical_cmp(&Value::Float(3.0), &Value::Int(3)),
        Ordering::Equal
    );
}

#[test]
fn strict_order_cmp_rejects_mixed_kinds_and_null() {
    assert_eq!(strict_order_cmp(&Value::Int(1), &v_txt("1")), None);
    assert_eq!(strict_order_cmp(&Value::Null, &Value::Null), None);
    assert_eq!(
        strict_order_cmp(&v_txt("a"), &v_txt("b")),
        Some(Ordering::Less)
    );
}

#[test]
fn sql_eq_is_unknown_for_null_operands() {
    assert_eq!(Value::Null.sql_eq(&Value::Null), None);
    assert_eq!(Value::Int(1).sql_eq(&Value::Null), None);
    assert_eq!(Value::Int(1).sql_eq(&Value::Float(1.0)), Some(true));
    assert_eq!(v_txt("x").sql_eq(&v_txt("y")), Some(false));
}

#[test]
fn arithmetic_promotes_and_propagates_null() {
    assert_eq!(
        Value::Int(2).arithmetic(ArithmeticOp::Add, &Value::Int(3)),
        Some(Value::Int(5))
    );
    assert_eq!(
        Value::Int(1).arithmetic(ArithmeticOp::Mul, &Value::Float(1.5)),
        Some(Value::Float(1.5))
    );
    assert_eq!(
        Value::Null.arithmetic(ArithmeticOp::Sub, &Value::Int(1)),
        Some(Value::Null)
    );
    assert_eq!(
        Value::Int(1).arithmetic(ArithmeticOp::Div, &Value::Int(0)),
        None,
        "integer division by zero must not panic"
    );
    assert_eq!(
        v_txt("a").arithmetic(ArithmeticOp::Add, &v_txt("b")),
        Some(v_txt("ab"))
    );
}

#[test]
fn ordered_value_groups_equal_numbers_under_one_key() {
    let mut map = BTreeMap::new();
    map.entry(OrderedValue(Value::Int(1)))
        .or_insert_with(Vec::new)
        .push("a");
    map.entry(OrderedValue(Value::Float(1.0)))
        .or_insert_with(Vec::new)
        .push("b");

    assert_eq!(map.len(), 1);
    assert_eq!(map.values().next().map(Vec::len), Some(2));
}

#[test]
fn option_into_value_maps_none_to_null() {
    let none: Option<i64> = None;
    assert_eq!(Value::from(none), Value::Null);
    assert_eq!(Value::from(Some("x")), v_txt("x"));
}
