use super::*;
use crate::{
    exec::{ExecutionError, QueryContext, QueryResult},
    storage::RawValue,
    test_support::{FakeDatabase, RecordingSink, sample_model, text},
    value::Value,
};
use proptest::prelude::*;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const CUSTOMER: QuerySourceId = QuerySourceId::new(0);

// ---------------------------------------------------------------------
// ValueBuffer
// ---------------------------------------------------------------------

#[test]
fn offset_views_share_storage_and_clamp() {
    let row = ValueBuffer::new(vec![Value::Int(1), text("a"), Value::Null]);
    let view = row.with_offset(1);

    assert!(view.shares_storage(&row), "offset views never copy");
    assert_eq!(view.len(), 2);
    assert_eq!(view.get(0), &text("a"));
    assert_eq!(view.get(5), &Value::Null, "out of range reads as null");

    let past_end = row.with_offset(10);
    assert!(past_end.is_empty(), "offsets clamp to the row width");
    assert!(past_end.is_all_null(), "an empty view is vacuously all null");
}

#[test]
fn raw_rows_normalize_provider_nulls() {
    let row = ValueBuffer::from_raw(vec![RawValue::DbNull, RawValue::from(Value::Int(3))]);

    assert_eq!(row.as_slice(), &[Value::Null, Value::Int(3)]);
    assert_eq!(row.prefix(1), vec![Value::Null]);
    assert!(!row.is_all_null());
}

fn arb_value() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Int),
        "[a-z]{0,4}".prop_map(Value::Text),
    ]
}

proptest! {
    #[test]
    fn nested_offsets_compose(
        values in prop::collection::vec(arb_value(), 0..8),
        first in 0usize..10,
        second in 0usize..10,
    ) {
        let row = ValueBuffer::new(values.clone());
        let nested = row.with_offset(first).with_offset(second);
        let direct = row.with_offset(first + second);

        prop_assert_eq!(&nested, &direct);
        prop_assert_eq!(nested.len(), values.len().saturating_sub(first + second));
    }

    #[test]
    fn view_reads_match_the_backing_row(
        values in prop::collection::vec(arb_value(), 1..8),
        offset in 0usize..8,
    ) {
        let row = ValueBuffer::new(values.clone());
        let view = row.with_offset(offset);

        for index in 0..view.len() {
            prop_assert_eq!(view.get(index), &values[offset + index]);
        }
    }
}

// ---------------------------------------------------------------------
// Compiler
// ---------------------------------------------------------------------

fn seattle_customers() -> QueryModel {
    QueryModel::builder(CUSTOMER, "c", Expr::entity_set("Customer"))
        .filter(
            Expr::source(CUSTOMER)
                .member("Name")
                .equal(Expr::constant("Seattle")),
        )
        .build()
}

#[test]
fn compiled_query_reports_one_command_and_no_client_work() {
    let compiled = QueryCompiler::new(sample_model())
        .compile(&seattle_customers())
        .expect("query should compile");

    let summary = compiled.summary();
    assert!(!summary.flags.any(), "everything translates: {:?}", summary.flags);
    assert_eq!(
        summary.single_command(),
        Some(
            "SELECT \"c\".\"Id\", \"c\".\"Name\", \"c\".\"City\"\n\
             FROM \"Customers\" AS \"c\"\n\
             WHERE \"c\".\"Name\" = 'Seattle'"
        )
    );
    assert_eq!(summary.method_names, vec!["Select", "ShapedQuery"]);
    assert_eq!(compiled.selects().len(), 1);
    assert_eq!(compiled.mode(), MethodProvider::Sync);
}

#[test]
fn compiled_query_streams_entities() {
    let db = FakeDatabase::new().with_rows(
        "FROM \"Customers\"",
        vec![vec![Value::Int(7), text("Seattle"), text("WA")]],
    );
    let sink = Arc::new(RecordingSink::default());
    let ctx = QueryContext::builder(sample_model(), db.connection())
        .sink(sink.clone())
        .build();

    let compiled = QueryCompiler::new(sample_model())
        .compile(&seattle_customers())
        .expect("query should compile");
    let items: Vec<QueryResult> = compiled
        .execute(&ctx)
        .expect("sync query runs synchronously")
        .collect::<Result<_, _>>()
        .expect("query should stream");

    assert_eq!(items.len(), 1);
    let customer = items[0].as_entity().expect("customers materialize");
    assert_eq!(customer.get("Id"), Value::Int(7));
    assert_eq!(sink.count_prefix("executing ExecuteReader"), 1, "{:?}", sink.events());
    assert_eq!(ctx.active_cursors(), 0);
}

#[test]
fn client_select_many_binds_outer_values_per_row() {
    const ORDER: QuerySourceId = QuerySourceId::new(1);
    const SUB: QuerySourceId = QuerySourceId::new(2);

    let orders = vec![
        vec![Value::Int(10), Value::Int(1), Value::Int(5)],
        vec![Value::Int(11), Value::Int(2), Value::Int(8)],
    ];
    let db = FakeDatabase::new()
        .with_rows("FROM \"Orders\"", orders.clone())
        .with_rows(
            "FROM \"Customers\"",
            vec![
                vec![Value::Int(1), text("Ann"), text("Oslo")],
                vec![Value::Int(2), text("Bo"), text("Rome")],
            ],
        );
    let ctx = QueryContext::builder(sample_model(), db.connection()).build();

    let inner = QueryModel::builder(SUB, "x", Expr::entity_set("Order"))
        .filter(
            Expr::source(SUB)
                .member("CustomerId")
                .equal(Expr::source(CUSTOMER).member("Id")),
        )
        .build();
    let query = QueryModel::builder(CUSTOMER, "c", Expr::entity_set("Customer"))
        .additional_from(ORDER, "o", Expr::subquery(inner))
        .select(Expr::source(ORDER))
        .build();
    let compiled = QueryCompiler::new(sample_model())
        .compile(&query)
        .expect("query should compile");
    assert!(compiled.flags().select_many, "{:?}", compiled.flags());

    let items: Vec<QueryResult> = compiled
        .execute(&ctx)
        .expect("sync query runs synchronously")
        .collect::<Result<_, _>>()
        .expect("query should stream");

    // the fake ignores the filter, so each customer sees every order
    assert_eq!(items.len(), 2 * orders.len());
    assert!(items.iter().all(|item| item.as_entity().is_some()), "{items:?}");

    let bound: Vec<Value> = db
        .executed()
        .into_iter()
        .filter(|command| command.text.contains("FROM \"Orders\""))
        .flat_map(|command| command.parameters)
        .filter(|(name, _)| name.ends_with("_outer_Id"))
        .map(|(_, value)| value)
        .collect();
    assert_eq!(bound, vec![Value::Int(1), Value::Int(2)], "one inner command per customer");
    assert_eq!(ctx.active_cursors(), 0);
}

#[test]
fn execution_mode_must_match_compilation_mode() {
    let db = FakeDatabase::new();
    let compiler = QueryCompiler::new(sample_model());

    let sync = compiler.compile(&seattle_customers()).expect("compiles");
    let async_ctx = QueryContext::builder(sample_model(), db.connection()).build_async();
    let err = sync
        .execute_async(&async_ctx, CancellationToken::new())
        .expect_err("sync plan cannot run async");
    assert!(matches!(
        err,
        ExecutionError::ModeMismatch {
            compiled: MethodProvider::Sync,
            requested: MethodProvider::Async,
        }
    ));

    let asynchronous = compiler.compile_async(&seattle_customers()).expect("compiles");
    let ctx = QueryContext::builder(sample_model(), db.connection()).build();
    assert!(matches!(
        asynchronous.execute(&ctx),
        Err(ExecutionError::ModeMismatch { .. })
    ));
    assert!(db.log().is_empty(), "a rejected execution touches no provider");
}

#[tokio::test]
async fn async_compiled_query_streams_entities() {
    let db = FakeDatabase::new().with_rows(
        "FROM \"Customers\"",
        vec![
            vec![Value::Int(1), text("Seattle"), text("WA")],
            vec![Value::Int(2), text("Seattle"), text("WA")],
        ],
    );
    let ctx = QueryContext::builder(sample_model(), db.connection()).build_async();

    let compiled = QueryCompiler::new(sample_model())
        .compile_async(&seattle_customers())
        .expect("query should compile");
    let items = compiled
        .execute_async(&ctx, CancellationToken::new())
        .expect("async plan runs async")
        .to_vec()
        .await
        .expect("query should stream");

    assert_eq!(items.len(), 2);
    assert_eq!(ctx.active_cursors(), 0);
}

#[test]
fn query_error_classes() {
    let unknown = QueryCompiler::new(sample_model())
        .compile(&QueryModel::builder(CUSTOMER, "x", Expr::entity_set("Nope")).build())
        .expect_err("unknown entity set");

    assert!(matches!(unknown, QueryError::UnknownEntityType(ref name) if name == "Nope"));
    assert_eq!(unknown.class(), crate::error::ErrorClass::NotFound);
}
