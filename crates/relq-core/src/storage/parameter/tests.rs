use crate::{
    storage::{
        DbCommand, DbParameter, DbType, DefaultTypeMappingSource, ParamValue, ParameterDirection,
        ParameterError, ParameterValues, RelationalParameter, TypeMapping,
    },
    test_support::FakeCommand,
    value::Value,
};
use std::sync::Arc;

fn names(command: &FakeCommand) -> Vec<String> {
    command.parameters().iter().map(|p| p.name.clone()).collect()
}

#[test]
fn type_mapped_parameter_applies_mapping_facets() {
    let mapping = TypeMapping::new("NVARCHAR(20)", Some(DbType::String))
        .with_size(20)
        .with_precision_scale(4, 2);
    let parameter = RelationalParameter::type_mapped("name", "@p0", mapping, Some(false));
    let mut command = FakeCommand::default();

    parameter
        .add_db_parameter(
            &mut command,
            &ParamValue::Value(Value::from("Seattle")),
            &DefaultTypeMappingSource,
        )
        .expect("type-mapped parameter should bind");

    let bound = &command.parameters()[0];
    assert_eq!(bound.name, "@p0");
    assert_eq!(bound.db_type, Some(DbType::String));
    assert_eq!(bound.store_type.as_deref(), Some("NVARCHAR(20)"));
    assert_eq!(bound.size, Some(20));
    assert_eq!(bound.precision, Some(4));
    assert_eq!(bound.scale, Some(2));
    assert!(!bound.nullable);
}

#[test]
fn type_mapped_parameter_infers_nullability_when_unknown() {
    let mapping = TypeMapping::new("BIGINT", Some(DbType::Int64));
    let parameter = RelationalParameter::type_mapped("id", "@id", mapping, None);
    let mut command = FakeCommand::default();

    parameter
        .add_db_parameter(
            &mut command,
            &ParamValue::Value(Value::Null),
            &DefaultTypeMappingSource,
        )
        .expect("null binds");

    assert!(command.parameters()[0].nullable);
}

#[test]
fn dynamic_parameter_resolves_mapping_from_runtime_value() {
    let parameter = RelationalParameter::dynamic("total", "@total");
    let mut command = FakeCommand::default();

    parameter
        .add_db_parameter(
            &mut command,
            &ParamValue::Value(Value::Float(1.5)),
            &DefaultTypeMappingSource,
        )
        .expect("dynamic float binds");

    assert_eq!(command.parameters()[0].db_type, Some(DbType::Double));
}

#[test]
fn dynamic_parameter_uses_null_mapping_for_null() {
    let parameter = RelationalParameter::dynamic("total", "@total");
    let mut command = FakeCommand::default();

    parameter
        .add_db_parameter(
            &mut command,
            &ParamValue::Value(Value::Null),
            &DefaultTypeMappingSource,
        )
        .expect("dynamic null binds");

    let bound = &command.parameters()[0];
    assert_eq!(bound.db_type, None);
    assert_eq!(bound.store_type.as_deref(), Some("NULL"));
    assert!(bound.nullable);
}

#[test]
fn dynamic_parameter_passes_native_parameter_through() {
    let native = Arc::new(DbParameter::new("@native", Value::Int(7)));
    let parameter = RelationalParameter::dynamic("native", "@native");
    let mut command = FakeCommand::default();

    parameter
        .add_db_parameter(
            &mut command,
            &ParamValue::Native(Arc::clone(&native)),
            &DefaultTypeMappingSource,
        )
        .expect("native binds");

    assert!(Arc::ptr_eq(&command.parameters()[0], &native));
}

#[test]
fn raw_input_parameter_is_cloned_before_attach() {
    let native = Arc::new(DbParameter::new("@raw", Value::Int(1)));
    let parameter = RelationalParameter::raw("raw", "@raw");
    let mut command = FakeCommand::default();

    parameter
        .add_db_parameter(
            &mut command,
            &ParamValue::Native(Arc::clone(&native)),
            &DefaultTypeMappingSource,
        )
        .expect("raw binds");

    let attached = &command.parameters()[0];
    assert!(
        !Arc::ptr_eq(attached, &native),
        "input parameters must be attached as a distinct clone"
    );
    assert_eq!(**attached, *native);
}

#[test]
fn raw_directional_parameters_are_attached_unchanged() {
    for direction in [
        ParameterDirection::Output,
        ParameterDirection::InputOutput,
        ParameterDirection::ReturnValue,
    ] {
        let native = Arc::new(DbParameter::new("@out", Value::Null).with_direction(direction));
        let parameter = RelationalParameter::raw("out", "@out");
        let mut command = FakeCommand::default();

        parameter
            .add_db_parameter(
                &mut command,
                &ParamValue::Native(Arc::clone(&native)),
                &DefaultTypeMappingSource,
            )
            .expect("raw binds");

        assert!(
            Arc::ptr_eq(&command.parameters()[0], &native),
            "{direction:?} parameters must not be cloned"
        );
    }
}

#[test]
fn raw_input_parameter_without_clone_support_is_attached_unchanged() {
    let native = Arc::new(DbParameter::new("@raw", Value::Int(1)).with_cloneable(false));
    let parameter = RelationalParameter::raw("raw", "@raw");
    let mut command = FakeCommand::default();

    parameter
        .add_db_parameter(
            &mut command,
            &ParamValue::Native(Arc::clone(&native)),
            &DefaultTypeMappingSource,
        )
        .expect("raw binds");

    assert!(Arc::ptr_eq(&command.parameters()[0], &native));
}

#[test]
fn raw_parameter_rejects_non_native_value() {
    let parameter = RelationalParameter::raw("raw", "@raw");
    let mut command = FakeCommand::default();

    let err = parameter
        .add_db_parameter(
            &mut command,
            &ParamValue::Value(Value::Int(1)),
            &DefaultTypeMappingSource,
        )
        .expect_err("plain values are not provider parameters");

    assert_eq!(
        err,
        ParameterError::NotNative {
            name: "raw".to_string()
        }
    );
    assert!(command.parameters().is_empty());
}

fn composite() -> RelationalParameter {
    RelationalParameter::composite(
        "ids",
        vec![
            RelationalParameter::dynamic("ids_0", "@ids_0"),
            RelationalParameter::dynamic("ids_1", "@ids_1"),
            RelationalParameter::dynamic("ids_2", "@ids_2"),
        ],
    )
}

#[test]
fn composite_binds_every_sub_parameter_once_in_declared_order() {
    let mut command = FakeCommand::default();
    let value = ParamValue::Array(vec![
        Value::Int(10).into(),
        Value::Int(20).into(),
        Value::Int(30).into(),
    ]);

    composite()
        .add_db_parameter(&mut command, &value, &DefaultTypeMappingSource)
        .expect("full array binds");

    assert_eq!(names(&command), vec!["@ids_0", "@ids_1", "@ids_2"]);
    let values: Vec<_> = command.parameters().iter().map(|p| p.value.clone()).collect();
    assert_eq!(values, vec![Value::Int(10), Value::Int(20), Value::Int(30)]);
}

#[test]
fn composite_with_short_array_names_first_missing_sub_parameter() {
    let mut command = FakeCommand::default();
    let value = ParamValue::Array(vec![Value::Int(10).into()]);

    let err = composite()
        .add_db_parameter(&mut command, &value, &DefaultTypeMappingSource)
        .expect_err("short array must fail");

    assert_eq!(
        err,
        ParameterError::MissingValue {
            name: "ids_1".to_string()
        }
    );
    assert!(
        command.parameters().is_empty(),
        "no sub-parameter binds when the array is short"
    );
}

#[test]
fn composite_rejects_non_array_value() {
    let mut command = FakeCommand::default();

    let err = composite()
        .add_db_parameter(
            &mut command,
            &ParamValue::Value(Value::Int(1)),
            &DefaultTypeMappingSource,
        )
        .expect_err("scalar is not an array");

    assert_eq!(
        err,
        ParameterError::NotArray {
            name: "ids".to_string()
        }
    );
}

#[test]
fn lookup_by_invariant_name_fails_when_value_is_missing() {
    let mut command = FakeCommand::default();
    let values = ParameterValues::new().with("other", Value::Int(1));

    let err = RelationalParameter::dynamic("city", "@city")
        .add_db_parameter_from(&mut command, &values, &DefaultTypeMappingSource)
        .expect_err("missing value must fail");

    assert_eq!(
        err,
        ParameterError::MissingValue {
            name: "city".to_string()
        }
    );
}

#[test]
fn lookup_by_invariant_name_binds_under_placeholder_name() {
    let mut command = FakeCommand::default();
    let values = ParameterValues::new().with("city", Value::from("Oslo"));

    RelationalParameter::dynamic("city", "@__city_0")
        .add_db_parameter_from(&mut command, &values, &DefaultTypeMappingSource)
        .expect("present value binds");

    assert_eq!(names(&command), vec!["@__city_0"]);
    assert_eq!(command.parameters()[0].value, Value::from("Oslo"));
}
