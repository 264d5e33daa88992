use crate::{
    config::{ClientEvalPolicy, QueryOptions},
    query::{
        ClientEvalClause, CompiledQuery, Expr, Ordering, ProviderCapabilities, QueryCompiler,
        QueryError, QueryModel, QueryModelBuilder, QuerySourceId, ResultOperator,
    },
    test_support::{RecordingSink, sample_model},
};
use std::sync::Arc;

const CUSTOMER: QuerySourceId = QuerySourceId::new(0);
const ORDER: QuerySourceId = QuerySourceId::new(1);
const GROUP: QuerySourceId = QuerySourceId::new(2);
const ANIMAL: QuerySourceId = QuerySourceId::new(3);
const SUB: QuerySourceId = QuerySourceId::new(4);

fn customer(property: &str) -> Expr {
    Expr::source(CUSTOMER).member(property)
}

fn order(property: &str) -> Expr {
    Expr::source(ORDER).member(property)
}

fn customers() -> QueryModelBuilder {
    QueryModel::builder(CUSTOMER, "c", Expr::entity_set("Customer"))
}

fn compile_with(
    policy: ClientEvalPolicy,
    query: &QueryModel,
) -> (Result<CompiledQuery, QueryError>, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::default());
    let compiled = QueryCompiler::new(sample_model())
        .with_options(QueryOptions::default().with_client_eval(policy))
        .with_sink(sink.clone())
        .compile(query);

    (compiled, sink)
}

fn compile(query: &QueryModel) -> CompiledQuery {
    compile_with(ClientEvalPolicy::Warn, query)
        .0
        .expect("query should compile")
}

fn only_command(compiled: &CompiledQuery) -> String {
    let summary = compiled.summary();
    summary
        .single_command()
        .map(str::to_string)
        .unwrap_or_else(|| panic!("expected exactly one command, found {:?}", summary.commands))
}

///
/// FILTERS
///

#[test]
fn translatable_filter_lands_in_where() {
    let compiled = compile(
        &customers()
            .filter(customer("Name").equal(Expr::constant("Seattle")))
            .build(),
    );

    assert_eq!(
        only_command(&compiled),
        "SELECT \"c\".\"Id\", \"c\".\"Name\", \"c\".\"City\"\n\
         FROM \"Customers\" AS \"c\"\n\
         WHERE \"c\".\"Name\" = 'Seattle'"
    );
    assert!(!compiled.flags().any());
}

#[test]
fn computed_property_filter_runs_on_client_with_warning() {
    let query = customers()
        .filter(customer("Nickname").equal(Expr::constant("~Ann")))
        .build();
    let (compiled, sink) = compile_with(ClientEvalPolicy::Warn, &query);
    let compiled = compiled.expect("warn policy compiles");

    let sql = only_command(&compiled);
    assert!(!sql.contains("WHERE"), "nothing translates: {sql}");
    assert!(compiled.flags().filter);
    assert!(compiled.summary().method_names.contains(&"Where"));
    assert_eq!(sink.count_prefix("client_eval filter"), 1, "{:?}", sink.events());
}

#[test]
fn throw_policy_rejects_client_filter() {
    let query = customers()
        .filter(customer("Nickname").equal(Expr::constant("~Ann")))
        .build();
    let (compiled, sink) = compile_with(ClientEvalPolicy::Throw, &query);

    let err = compiled.expect_err("throw policy rejects client evaluation");
    assert!(
        matches!(
            err,
            QueryError::ClientEvaluation {
                clause: ClientEvalClause::Filter,
                ..
            }
        ),
        "{err:?}"
    );
    assert_eq!(sink.count_prefix("client_eval"), 0);
}

#[test]
fn ignore_policy_stays_silent() {
    let query = customers()
        .filter(customer("Nickname").equal(Expr::constant("~Ann")))
        .build();
    let (compiled, sink) = compile_with(ClientEvalPolicy::Ignore, &query);

    assert!(compiled.expect("ignore policy compiles").flags().filter);
    assert!(sink.events().is_empty(), "{:?}", sink.events());
}

#[test]
fn mixed_conjunction_splits_between_sql_and_client() {
    let compiled = compile(
        &customers()
            .filter(
                customer("City")
                    .equal(Expr::constant("Oslo"))
                    .and(customer("Nickname").equal(Expr::constant("~Ann"))),
            )
            .build(),
    );

    let sql = only_command(&compiled);
    assert!(sql.contains("WHERE \"c\".\"City\" = 'Oslo'"), "{sql}");
    assert!(!sql.contains("Nickname"), "{sql}");
    assert!(compiled.flags().filter, "the residual runs on the client");
}

///
/// ORDERING
///

#[test]
fn order_by_translates_all_or_nothing() {
    let translated = compile(
        &customers()
            .order_by(vec![Ordering::asc(customer("City")), Ordering::desc(customer("Name"))])
            .build(),
    );
    let sql = only_command(&translated);
    assert!(sql.ends_with("ORDER BY \"c\".\"City\", \"c\".\"Name\" DESC"), "{sql}");

    let client = compile(
        &customers()
            .order_by(vec![Ordering::asc(customer("City")), Ordering::desc(customer("Nickname"))])
            .build(),
    );
    let sql = only_command(&client);
    assert!(!sql.contains("ORDER BY"), "one untranslatable key keeps every key off SQL: {sql}");
    assert!(client.flags().order_by);
    assert!(client.summary().method_names.contains(&"OrderBy"));
}

///
/// JOINS
///

#[test]
fn translatable_join_flattens_into_one_command() {
    let compiled = compile(
        &customers()
            .join(ORDER, "o", Expr::entity_set("Order"), customer("Id"), order("CustomerId"))
            .select(order("Total"))
            .build(),
    );

    let sql = only_command(&compiled);
    assert!(sql.contains("INNER JOIN"), "{sql}");
    assert!(sql.contains("\"c\".\"Id\" = \"o\".\"CustomerId\""), "{sql}");
    assert!(!compiled.flags().join);
}

#[test]
fn join_on_computed_key_runs_on_client() {
    let compiled = compile(
        &customers()
            .join(ORDER, "o", Expr::entity_set("Order"), customer("Nickname"), order("CustomerId"))
            .build(),
    );

    let summary = compiled.summary();
    assert!(summary.flags.join);
    assert_eq!(summary.commands.len(), 2, "each side queries alone: {:?}", summary.commands);
    assert!(summary.method_names.contains(&"Join"));
    assert!(summary.commands.iter().all(|sql| !sql.contains("JOIN")), "{:?}", summary.commands);
}

#[test]
fn group_join_orders_by_outer_key_for_streaming() {
    let compiled = compile(
        &customers()
            .group_join(GROUP, "g", ORDER, Expr::entity_set("Order"), customer("Id"), order("CustomerId"))
            .select(Expr::source(GROUP))
            .build(),
    );

    let sql = only_command(&compiled);
    assert!(sql.contains("LEFT JOIN"), "{sql}");
    assert!(sql.contains("ORDER BY \"c\".\"Id\""), "{sql}");
    assert!(compiled.summary().method_names.contains(&"GroupJoin"));
    assert!(!compiled.flags().join);
}

///
/// RESULT OPERATORS
///

#[test]
fn count_becomes_a_scalar_select() {
    let compiled = compile(&customers().result(ResultOperator::Count).build());

    let sql = only_command(&compiled);
    assert!(sql.starts_with("SELECT COUNT(*)"), "{sql}");
    assert_eq!(compiled.summary().method_names, vec!["First", "ShapedQuery"]);
    assert!(compiled.plan().is_scalar());
}

#[test]
fn first_limits_the_select_and_picks_on_client() {
    let compiled = compile(
        &customers()
            .result(ResultOperator::First { or_default: true })
            .build(),
    );

    let sql = only_command(&compiled);
    assert!(sql.contains("LIMIT 1"), "{sql}");
    assert_eq!(compiled.summary().method_names.first(), Some(&"FirstOrDefault"));
    assert!(!compiled.flags().result_operator, "First still translates");
}

#[test]
fn take_with_parameter_renders_limit_parameter() {
    let compiled = compile(
        &customers()
            .result(ResultOperator::Take(Expr::param("n")))
            .build(),
    );

    let sql = only_command(&compiled);
    assert!(sql.contains("LIMIT @n"), "{sql}");
}

#[test]
fn negative_take_and_skip_literals_clamp_to_zero() {
    let take = compile(&customers().result(ResultOperator::Take(Expr::constant(-1_i64))).build());
    let sql = only_command(&take);
    assert!(sql.contains("LIMIT 0"), "{sql}");
    assert!(!sql.contains("-1"), "{sql}");

    let skip = compile(&customers().result(ResultOperator::Skip(Expr::constant(-5_i64))).build());
    let sql = only_command(&skip);
    assert!(sql.contains("OFFSET 0"), "{sql}");
    assert!(!sql.contains("-5"), "{sql}");
}

#[test]
fn group_by_orders_by_key_and_streams_groups() {
    let compiled = compile(
        &customers()
            .result(ResultOperator::GroupBy {
                key: Expr::Current.member("City"),
                element: Expr::Current.member("Name"),
            })
            .build(),
    );

    let sql = only_command(&compiled);
    assert!(sql.contains("ORDER BY \"c\".\"City\""), "{sql}");
    assert_eq!(compiled.summary().method_names.first(), Some(&"GroupBy"));
}

#[test]
fn default_if_empty_left_joins_against_one_null_row() {
    let compiled = compile(&customers().result(ResultOperator::DefaultIfEmpty).build());

    let sql = only_command(&compiled);
    assert!(sql.contains("AS \"empty\""), "{sql}");
    assert!(sql.contains("LEFT JOIN"), "{sql}");

    let names = compiled.summary().method_names;
    assert!(names.contains(&"DefaultIfEmpty"), "{names:?}");
    assert!(names.contains(&"DefaultIfEmptyShapedQuery"), "{names:?}");
}

///
/// INCLUDE
///

#[test]
fn collection_include_adds_ordered_secondary_command() {
    let compiled = compile(
        &customers()
            .result(ResultOperator::Include("Orders".to_string()))
            .build(),
    );

    let summary = compiled.summary();
    assert_eq!(summary.commands.len(), 2, "{:?}", summary.commands);
    assert!(summary.method_names.contains(&"Include"));

    let principal = summary
        .commands
        .iter()
        .find(|sql| sql.contains("FROM \"Customers\" AS \"c\"\nORDER BY"))
        .unwrap_or_else(|| panic!("principal query should be ordered by key: {:?}", summary.commands));
    assert!(principal.ends_with("ORDER BY \"c\".\"Id\""), "{principal}");

    let secondary = summary
        .commands
        .iter()
        .find(|sql| sql.contains("FROM \"Orders\" AS \"o\""))
        .unwrap_or_else(|| panic!("secondary query should read orders: {:?}", summary.commands));
    assert!(secondary.contains("INNER JOIN ("), "{secondary}");
    assert!(secondary.contains("\"o\".\"CustomerId\" = \"t\".\"Id\""), "{secondary}");
    assert!(secondary.ends_with("ORDER BY \"t\".\"Id\""), "{secondary}");
}

#[test]
fn reference_include_left_joins_into_the_same_command() {
    let compiled = compile(
        &QueryModel::builder(ORDER, "o", Expr::entity_set("Order"))
            .result(ResultOperator::Include("Customer".to_string()))
            .build(),
    );

    let sql = only_command(&compiled);
    assert!(sql.contains("LEFT JOIN \"Customers\""), "{sql}");
    assert!(sql.contains("\"o\".\"CustomerId\" = \"c\".\"Id\""), "{sql}");
}

#[test]
fn include_of_unknown_navigation_fails() {
    let (compiled, _) = compile_with(
        ClientEvalPolicy::Warn,
        &customers()
            .result(ResultOperator::Include("Invoices".to_string()))
            .build(),
    );

    assert!(matches!(
        compiled,
        Err(QueryError::UnknownNavigation { ref navigation, .. }) if navigation == "Invoices"
    ));
}

///
/// INHERITANCE
///

#[test]
fn type_test_becomes_discriminator_comparison() {
    let compiled = compile(
        &QueryModel::builder(ANIMAL, "a", Expr::entity_set("Animal"))
            .filter(Expr::source(ANIMAL).type_is("Cat"))
            .build(),
    );

    let sql = only_command(&compiled);
    assert!(sql.contains("WHERE \"a\".\"Kind\" = 'Cat'"), "{sql}");
    assert!(!compiled.flags().any());
}

#[test]
fn derived_entity_set_filters_on_discriminator() {
    let compiled = compile(&QueryModel::builder(ANIMAL, "d", Expr::entity_set("Dog")).build());

    let sql = only_command(&compiled);
    assert!(sql.contains("FROM \"Animals\""), "{sql}");
    assert!(sql.contains("\"Kind\" = 'Dog'"), "{sql}");
}

///
/// SUBQUERIES
///

#[test]
fn identity_subquery_source_is_lifted() {
    let inner = QueryModel::builder(ORDER, "x", Expr::entity_set("Customer"))
        .filter(Expr::source(ORDER).member("City").equal(Expr::constant("Oslo")))
        .build();
    let compiled = compile(
        &QueryModel::builder(CUSTOMER, "c", Expr::subquery(inner))
            .filter(customer("Name").equal(Expr::constant("Ann")))
            .build(),
    );

    let sql = only_command(&compiled);
    assert!(sql.contains("'Oslo'"), "{sql}");
    assert!(sql.contains("'Ann'"), "{sql}");
    assert!(!compiled.flags().any(), "{:?}", compiled.flags());
}

fn customers_by_name() -> QueryModelBuilder {
    QueryModel::builder(SUB, "x", Expr::entity_set("Customer"))
        .order_by(vec![Ordering::asc(Expr::source(SUB).member("Name"))])
}

#[test]
fn ordered_subquery_source_stays_on_client() {
    let compiled = compile(
        &QueryModel::builder(CUSTOMER, "c", Expr::subquery(customers_by_name().build())).build(),
    );

    let sql = only_command(&compiled);
    assert!(sql.contains("ORDER BY \"c\".\"Name\""), "the subquery keeps its order: {sql}");
    assert!(compiled.flags().requires_client_eval, "{:?}", compiled.flags());
    assert!(compiled.summary().method_names.contains(&"FromSequence"));
}

#[test]
fn ordered_subquery_with_limit_is_lifted() {
    let inner = customers_by_name()
        .result(ResultOperator::Take(Expr::constant(3_i64)))
        .build();
    let compiled = compile(&QueryModel::builder(CUSTOMER, "c", Expr::subquery(inner)).build());

    let sql = only_command(&compiled);
    assert!(sql.contains("ORDER BY \"c\".\"Name\""), "{sql}");
    assert!(sql.contains("LIMIT 3"), "{sql}");
    assert!(!compiled.flags().any(), "{:?}", compiled.flags());
    assert!(!compiled.summary().method_names.contains(&"FromSequence"));
}

#[test]
fn ordered_join_inner_stays_on_client() {
    let inner = QueryModel::builder(SUB, "x", Expr::entity_set("Order"))
        .order_by(vec![Ordering::desc(Expr::source(SUB).member("Total"))])
        .build();
    let compiled = compile(
        &customers()
            .join(ORDER, "o", Expr::subquery(inner), customer("Id"), order("CustomerId"))
            .select(order("Total"))
            .build(),
    );

    let summary = compiled.summary();
    assert!(summary.flags.join, "{:?}", summary.flags);
    assert_eq!(summary.commands.len(), 2, "{:?}", summary.commands);
    assert!(
        summary.commands.iter().any(|sql| sql.contains("ORDER BY \"o\".\"Total\" DESC")),
        "the inner command keeps its order: {:?}",
        summary.commands
    );
    assert!(summary.commands.iter().all(|sql| !sql.contains("JOIN")), "{:?}", summary.commands);
}

///
/// ADDITIONAL FROM
///

fn orders_of_customer() -> QueryModel {
    QueryModel::builder(SUB, "x", Expr::entity_set("Order"))
        .filter(Expr::source(SUB).member("CustomerId").equal(customer("Id")))
        .build()
}

fn compile_lateral(query: &QueryModel) -> CompiledQuery {
    QueryCompiler::new(sample_model())
        .with_capabilities(ProviderCapabilities::default().with_lateral_join(true))
        .compile(query)
        .expect("query should compile")
}

#[test]
fn uncorrelated_additional_from_becomes_cross_join() {
    let compiled = compile(
        &customers()
            .additional_from(ORDER, "o", Expr::entity_set("Order"))
            .select(order("Total"))
            .build(),
    );

    let sql = only_command(&compiled);
    assert!(sql.contains("CROSS JOIN \"Orders\" AS \"o\""), "{sql}");
    assert!(!compiled.flags().any(), "{:?}", compiled.flags());
}

#[test]
fn correlated_additional_from_uses_lateral_join_when_supported() {
    let compiled = compile_lateral(
        &customers()
            .additional_from(ORDER, "o", Expr::subquery(orders_of_customer()))
            .select(order("Total"))
            .build(),
    );

    let sql = only_command(&compiled);
    assert!(sql.contains("CROSS JOIN LATERAL ("), "{sql}");
    assert!(sql.contains("\"o\".\"CustomerId\" = \"c\".\"Id\""), "{sql}");
    assert!(!compiled.flags().select_many, "{:?}", compiled.flags());
}

#[test]
fn correlated_additional_from_without_lateral_runs_per_outer_row() {
    let compiled = compile(
        &customers()
            .additional_from(ORDER, "o", Expr::subquery(orders_of_customer()))
            .select(order("Total"))
            .build(),
    );

    let summary = compiled.summary();
    assert!(summary.flags.select_many, "{:?}", summary.flags);
    assert_eq!(summary.commands.len(), 2, "{:?}", summary.commands);
    assert!(
        summary.commands.iter().any(|sql| sql.contains("@_outer_Id")),
        "outer values arrive as parameters: {:?}",
        summary.commands
    );
    assert!(summary.commands.iter().all(|sql| !sql.contains("LATERAL")), "{:?}", summary.commands);
    for name in ["SelectMany", "InjectParameters", "FromSequence"] {
        assert!(summary.method_names.contains(&name), "{name} in {:?}", summary.method_names);
    }
}
