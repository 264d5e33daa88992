use super::*;
use crate::{
    config::QueryOptions,
    obs::NoopSink,
    query::{
        MethodProvider, ProviderCapabilities, SelectExpression,
        sql::{ProjectionItem, TableExpr},
    },
    storage::AnsiDialect,
    test_support::sample_model,
};
use std::sync::Arc;

const CUSTOMER: QuerySourceId = QuerySourceId::new(0);
const ORDER: QuerySourceId = QuerySourceId::new(1);

struct Fixture {
    ctx: QueryCompilationContext,
    customers: SelectId,
    orders: SelectId,
    child: ScopeId,
}

fn fixture() -> Fixture {
    let mut ctx = QueryCompilationContext::new(
        sample_model(),
        ProviderCapabilities::default(),
        QueryOptions::default(),
        Arc::new(NoopSink),
        Arc::new(AnsiDialect),
        MethodProvider::Sync,
    );

    let customers = ctx.arena.alloc(select_of("Customers", "c", CUSTOMER, &["Id", "Name", "City"]));
    let orders = ctx.arena.alloc(select_of("Orders", "o", ORDER, &["Id", "CustomerId", "Total"]));

    let root = ctx.root_scope();
    ctx.bind_source(root, CUSTOMER, Some(customers));
    ctx.set_source_type(CUSTOMER, "Customer");

    let child = ctx.child_scope(root);
    ctx.bind_source(child, ORDER, Some(orders));
    ctx.set_source_type(ORDER, "Order");

    Fixture {
        ctx,
        customers,
        orders,
        child,
    }
}

fn select_of(table: &str, alias: &str, source: QuerySourceId, columns: &[&str]) -> SelectExpression {
    let mut select = SelectExpression::new();
    select.add_table(TableExpr::table(table, alias, source));
    for column in columns {
        select.add_to_projection(
            ProjectionItem::new(SqlExpr::column(alias, *column), *column).for_source(source, *column),
        );
    }
    select
}

fn customer(property: &str) -> Expr {
    Expr::source(CUSTOMER).member(property)
}

fn order(property: &str) -> Expr {
    Expr::source(ORDER).member(property)
}

#[test]
fn column_comparison_translates_against_the_owning_select() {
    let mut f = fixture();
    let root = f.ctx.root_scope();
    let mut t = SqlTranslator::new(&mut f.ctx, root, f.customers);

    let sql = t.translate_predicate(&customer("Name").equal(Expr::constant("Seattle")));

    assert_eq!(
        sql,
        Some(SqlExpr::equal(
            SqlExpr::column("c", "Name"),
            SqlExpr::literal("Seattle")
        ))
    );
    assert_eq!(t.take_residual(), None);
}

#[test]
fn null_comparisons_become_null_tests() {
    let mut f = fixture();
    let root = f.ctx.root_scope();
    let mut t = SqlTranslator::new(&mut f.ctx, root, f.customers);

    let is_null = t.translate(&customer("City").equal(Expr::Constant(Value::Null)));
    let not_null = t.translate(&Expr::Constant(Value::Null).not_equal(customer("City")));

    assert_eq!(
        is_null,
        Some(SqlExpr::IsNull(Box::new(SqlExpr::column("c", "City"))))
    );
    assert_eq!(
        not_null,
        Some(SqlExpr::IsNotNull(Box::new(SqlExpr::column("c", "City"))))
    );
}

#[test]
fn logical_operands_that_are_values_compare_to_true() {
    let mut f = fixture();
    let root = f.ctx.root_scope();
    let mut t = SqlTranslator::new(&mut f.ctx, root, f.customers);

    let sql = t.translate_condition(&Expr::param("flag").or(customer("Id").greater_than(Expr::constant(3_i64))));

    assert_eq!(
        sql,
        Some(SqlExpr::Or(vec![
            SqlExpr::equal(SqlExpr::Parameter("flag".into()), SqlExpr::literal(true)),
            SqlExpr::binary(
                BinaryOp::Gt,
                SqlExpr::column("c", "Id"),
                SqlExpr::literal(3_i64)
            ),
        ]))
    );
}

#[test]
fn computed_properties_and_calls_are_not_translatable() {
    let mut f = fixture();
    let root = f.ctx.root_scope();
    let mut t = SqlTranslator::new(&mut f.ctx, root, f.customers);

    assert_eq!(t.translate(&customer("Nickname")), None);
    assert_eq!(t.translate(&Expr::source(CUSTOMER)), None);
    assert_eq!(
        t.translate(&Expr::source(CUSTOMER).type_is("Customer")),
        None,
        "type tests only translate after the discriminator rewrite"
    );
}

#[test]
fn top_level_and_keeps_the_untranslatable_side_as_residual() {
    let mut f = fixture();
    let root = f.ctx.root_scope();
    let mut t = SqlTranslator::new(&mut f.ctx, root, f.customers);

    let client = customer("Nickname").equal(Expr::constant("~Ann"));
    let predicate = client.clone().and(customer("City").equal(Expr::constant("Oslo")));

    let sql = t.translate_predicate(&predicate);

    assert_eq!(
        sql,
        Some(SqlExpr::equal(SqlExpr::column("c", "City"), SqlExpr::literal("Oslo")))
    );
    assert_eq!(t.take_residual(), Some(client));
}

#[test]
fn sources_of_other_selects_are_not_translatable() {
    let mut f = fixture();
    let root = f.ctx.root_scope();
    let child = f.child;
    f.ctx.bind_source(root, ORDER, Some(f.orders));

    let mut t = SqlTranslator::new(&mut f.ctx, child, f.customers);
    assert_eq!(
        t.translate(&order("Total")),
        None,
        "orders live in another select"
    );
}

#[test]
fn outer_references_become_deduplicated_parameters() {
    let mut f = fixture();
    let mut t = SqlTranslator::new(&mut f.ctx, f.child, f.orders).with_outer_parameters(true, &[]);

    let first = t.translate_predicate(&order("CustomerId").equal(customer("Id")));
    let second = t.translate(&customer("Id"));

    assert_eq!(
        first,
        Some(SqlExpr::equal(
            SqlExpr::column("o", "CustomerId"),
            SqlExpr::Parameter("_outer_Id".into())
        ))
    );
    assert_eq!(second, Some(SqlExpr::Parameter("_outer_Id".into())));
    assert!(!t.is_correlated(), "parameters do not correlate the select");

    let parameters = t.into_outer_parameters();
    assert_eq!(parameters, vec![("_outer_Id".to_string(), customer("Id"))]);
    assert!(
        f.ctx.outer_parameter_names().contains("_outer_Id"),
        "finished translation should commit the name"
    );
}

#[test]
fn failed_translations_roll_back_invented_parameters() {
    let mut f = fixture();
    let mut t = SqlTranslator::new(&mut f.ctx, f.child, f.orders).with_outer_parameters(true, &[]);

    let sql = t.translate(&customer("Name").equal(Expr::call(
        crate::query::ClientFunction::new("upper", |args| args[0].clone()),
        vec![order("Id")],
    )));

    assert_eq!(sql, None);
    assert!(t.outer_parameters().is_empty(), "rolled-back parameter must not leak");
}

#[test]
fn parameter_names_avoid_names_already_committed() {
    let mut f = fixture();
    f.ctx.commit_outer_parameter("_outer_Id");

    let mut t = SqlTranslator::new(&mut f.ctx, f.child, f.orders).with_outer_parameters(true, &[]);
    let sql = t.translate(&customer("Id"));

    assert_eq!(sql, Some(SqlExpr::Parameter("_outer_Id0".into())));
}

#[test]
fn outer_properties_bind_columns_and_mark_correlation() {
    let mut f = fixture();
    let mut t = SqlTranslator::new(&mut f.ctx, f.child, f.orders).with_outer_properties(true);

    let sql = t.translate_predicate(&order("CustomerId").equal(customer("Id")));

    assert_eq!(
        sql,
        Some(SqlExpr::equal(
            SqlExpr::column("o", "CustomerId"),
            SqlExpr::column("c", "Id")
        ))
    );
    assert!(t.is_correlated());
}

#[test]
fn outer_references_without_binding_stay_on_the_client() {
    let mut f = fixture();
    let mut t = SqlTranslator::new(&mut f.ctx, f.child, f.orders);

    assert_eq!(t.translate(&order("CustomerId").equal(customer("Id"))), None);
}
