use crate::{
    model::{EntityBuilder, Model, ModelError, NavigationKind},
    test_support::{sample_model, text},
};

#[test]
fn derived_types_inherit_table_key_and_columns() {
    let model = sample_model();
    let cat = model.entity("Cat").expect("Cat is mapped");

    assert_eq!(cat.table, "Animals");
    assert_eq!(cat.key, vec!["Id".to_string()]);
    assert_eq!(cat.discriminator_property.as_deref(), Some("Kind"));
    assert_eq!(cat.discriminator_value, Some(text("Cat")));
    assert_eq!(
        cat.column_properties().map(|(p, _)| p).collect::<Vec<_>>(),
        vec!["Id", "Name", "Kind"]
    );
}

#[test]
fn concrete_types_skip_abstract_root() {
    let model = sample_model();

    let names: Vec<_> = model
        .concrete_types("Animal")
        .into_iter()
        .map(|t| t.name.clone())
        .collect();
    assert_eq!(names, vec!["Cat", "Dog"]);

    let names: Vec<_> = model
        .concrete_types("Cat")
        .into_iter()
        .map(|t| t.name.clone())
        .collect();
    assert_eq!(names, vec!["Cat"]);
}

#[test]
fn discriminator_value_resolves_concrete_type() {
    let model = sample_model();
    let animal = model.entity("Animal").expect("Animal is mapped");

    let dog = model
        .type_for_discriminator(animal, &text("Dog"))
        .expect("Dog discriminator resolves");
    assert_eq!(dog.name, "Dog");
    assert!(model.type_for_discriminator(animal, &text("Fish")).is_none());
}

#[test]
fn computed_properties_have_no_column_ordinal() {
    let model = sample_model();
    let customer = model.entity("Customer").expect("Customer is mapped");

    assert_eq!(customer.column_ordinal("City"), Some(2));
    assert_eq!(customer.column_ordinal("Nickname"), None);
    assert!(customer.property("Nickname").is_some());
    assert_eq!(
        customer.navigation("Orders").map(|n| n.kind),
        Some(NavigationKind::Collection)
    );
}

#[test]
fn builder_rejects_unknown_base_and_missing_key() {
    let err = Model::builder()
        .entity(EntityBuilder::new("Orphan").base("Ghost").column("Id"))
        .build()
        .expect_err("unknown base");
    assert!(matches!(err, ModelError::UnknownBaseType { .. }));

    let err = Model::builder()
        .entity(EntityBuilder::new("Keyless").column("Id"))
        .build()
        .expect_err("missing key");
    assert_eq!(err, ModelError::MissingKey("Keyless".to_string()));
}

#[test]
fn builder_rejects_unknown_navigation_target() {
    let err = Model::builder()
        .entity(
            EntityBuilder::new("Order")
                .column("Id")
                .key(["Id"])
                .reference("Customer", "Customer", "CustomerId", "Id"),
        )
        .build()
        .expect_err("unknown target");

    assert!(matches!(err, ModelError::UnknownNavigationTarget { .. }));
}

#[test]
fn hierarchy_columns_cover_every_concrete_type_once() {
    let model = sample_model();

    let columns: Vec<String> = model
        .hierarchy_columns("Animal")
        .into_iter()
        .map(|(property, _)| property)
        .collect();
    assert_eq!(columns, vec!["Id", "Name", "Kind"]);

    let customer: Vec<String> = model
        .hierarchy_columns("Customer")
        .into_iter()
        .map(|(property, _)| property)
        .collect();
    assert_eq!(
        customer,
        vec!["Id", "Name", "City"],
        "computed properties have no column"
    );
}
