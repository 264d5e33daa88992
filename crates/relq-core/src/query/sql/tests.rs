use crate::{
    query::{
        expr::BinaryOp,
        model::QuerySourceId,
        sql::{
            AliasGenerator, ProjectionItem, SelectExpression, SqlExpr, SqlOrdering, TableExpr,
            generate_command, generate_sql, normalize_predicate,
        },
    },
    storage::AnsiDialect,
    value::Value,
};
use proptest::prelude::*;

const CUSTOMERS: QuerySourceId = QuerySourceId::new(0);
const ORDERS: QuerySourceId = QuerySourceId::new(1);

fn table_select(
    aliases: &mut AliasGenerator,
    table: &str,
    hint: &str,
    qs: QuerySourceId,
    columns: &[&str],
) -> SelectExpression {
    let alias = aliases.unique(hint);
    let mut select = SelectExpression::new();
    select.add_table(TableExpr::table(table, alias.clone(), qs));
    for column in columns {
        select.add_to_projection(
            ProjectionItem::new(SqlExpr::column(alias.clone(), *column), *column)
                .for_source(qs, *column),
        );
    }

    select
}

fn customers(aliases: &mut AliasGenerator) -> SelectExpression {
    table_select(
        aliases,
        "Customers",
        "Customer",
        CUSTOMERS,
        &["Id", "Name", "City"],
    )
}

fn orders(aliases: &mut AliasGenerator) -> SelectExpression {
    table_select(
        aliases,
        "Orders",
        "Order",
        ORDERS,
        &["Id", "CustomerId", "Total"],
    )
}

fn col(column: &str) -> SqlExpr {
    SqlExpr::column("c", column)
}

fn text(s: &str) -> SqlExpr {
    SqlExpr::literal(s)
}

fn truth(b: bool) -> SqlExpr {
    SqlExpr::Literal(Value::Bool(b))
}

// ---------------------------------------------------------------------
// Generation
// ---------------------------------------------------------------------

#[test]
fn simple_filter_generates_single_select() {
    let mut aliases = AliasGenerator::new();
    let mut select = customers(&mut aliases);
    select.add_predicate(SqlExpr::equal(col("Name"), text("Seattle")));

    assert_eq!(
        generate_sql(&select, &AnsiDialect),
        "SELECT \"c\".\"Id\", \"c\".\"Name\", \"c\".\"City\"\n\
         FROM \"Customers\" AS \"c\"\n\
         WHERE \"c\".\"Name\" = 'Seattle'"
    );
}

#[test]
fn ordering_and_paging_render_in_clause_order() {
    let mut aliases = AliasGenerator::new();
    let mut select = customers(&mut aliases);
    select.prepend_to_order_by(vec![SqlOrdering::desc(col("City")), SqlOrdering::asc(col("Id"))]);
    select.set_limit(SqlExpr::literal(10), &mut aliases);
    select.set_offset(SqlExpr::Parameter("skip".to_string()), &mut aliases);

    let sql = generate_sql(&select, &AnsiDialect);
    assert!(
        sql.contains("ORDER BY \"t\".\"City\" DESC, \"t\".\"Id\"\nOFFSET @skip"),
        "offset after a limit pushes down and keeps the lifted order: {sql}"
    );
    assert!(
        sql.contains("    ORDER BY \"c\".\"City\" DESC, \"c\".\"Id\"\n    LIMIT 10"),
        "the limited inner select keeps its ordering: {sql}"
    );
}

#[test]
fn literals_render_with_sql_quoting() {
    let mut select = SelectExpression::new();
    select.set_scalar_projection(
        SqlExpr::function(
            "F",
            vec![
                SqlExpr::literal("O'Brien"),
                SqlExpr::literal(1.0),
                SqlExpr::Literal(Value::Blob(vec![0x0a, 0xff])),
                SqlExpr::Literal(Value::Null),
                truth(false),
            ],
        ),
        "value",
    );

    assert_eq!(
        generate_sql(&select, &AnsiDialect),
        "SELECT F('O''Brien', 1.0, X'0AFF', NULL, FALSE) AS \"value\""
    );
}

#[test]
fn operator_precedence_adds_only_needed_parentheses() {
    let mut select = SelectExpression::new();
    let sum = SqlExpr::binary(BinaryOp::Add, col("Id"), SqlExpr::literal(1));
    let product = SqlExpr::binary(BinaryOp::Mul, sum, SqlExpr::literal(2));
    let either = SqlExpr::Or(vec![
        SqlExpr::equal(col("Name"), text("a")),
        SqlExpr::equal(col("Name"), text("b")),
    ]);
    select.set_scalar_projection(
        SqlExpr::Case {
            condition: Box::new(SqlExpr::And(vec![
                either,
                SqlExpr::binary(BinaryOp::Gt, product, SqlExpr::literal(4)),
            ])),
            then: Box::new(truth(true)),
            otherwise: Box::new(truth(false)),
        },
        "value",
    );

    assert_eq!(
        generate_sql(&select, &AnsiDialect),
        "SELECT CASE WHEN (\"c\".\"Name\" = 'a' OR \"c\".\"Name\" = 'b') AND \
         (\"c\".\"Id\" + 1) * 2 > 4 THEN TRUE ELSE FALSE END AS \"value\""
    );
}

#[test]
fn exists_renders_a_projectionless_subquery() {
    let mut aliases = AliasGenerator::new();
    let mut inner = customers(&mut aliases);
    inner.prepend_to_order_by(vec![SqlOrdering::asc(col("Name"))]);
    let mut select = SelectExpression::new();
    select.set_scalar_projection(
        SqlExpr::Exists(Box::new(inner)).to_boolean_case(),
        "value",
    );

    assert_eq!(
        generate_sql(&select, &AnsiDialect),
        "SELECT CASE WHEN EXISTS (\n    SELECT 1\n    FROM \"Customers\" AS \"c\"\n) \
         THEN TRUE ELSE FALSE END AS \"value\""
    );
}

#[test]
fn command_parameters_follow_first_use() {
    let mut aliases = AliasGenerator::new();
    let mut select = customers(&mut aliases);
    select.add_predicate(SqlExpr::equal(
        col("City"),
        SqlExpr::Parameter("city".to_string()),
    ));
    select.add_predicate(SqlExpr::binary(
        BinaryOp::Gt,
        col("Id"),
        SqlExpr::Parameter("min".to_string()),
    ));
    select.add_predicate(SqlExpr::equal(
        col("Name"),
        SqlExpr::Parameter("city".to_string()),
    ));

    let command = generate_command(&select, &AnsiDialect);
    let names: Vec<&str> = command
        .parameters()
        .iter()
        .map(|p| p.invariant_name())
        .collect();

    assert_eq!(names, vec!["city", "min"], "parameters are deduplicated");
    assert!(command.command_text().contains("\"c\".\"City\" = @city"));
}

// ---------------------------------------------------------------------
// Composition
// ---------------------------------------------------------------------

#[test]
fn second_limit_pushes_the_select_down() {
    let mut aliases = AliasGenerator::new();
    let mut select = customers(&mut aliases);
    select.set_limit(SqlExpr::literal(10), &mut aliases);
    select.set_limit(SqlExpr::literal(5), &mut aliases);

    assert_eq!(
        generate_sql(&select, &AnsiDialect),
        "SELECT \"t\".*\n\
         FROM (\n    \
         SELECT \"c\".\"Id\", \"c\".\"Name\", \"c\".\"City\"\n    \
         FROM \"Customers\" AS \"c\"\n    \
         LIMIT 10\n\
         ) AS \"t\"\n\
         LIMIT 5"
    );
    assert_eq!(select.row_width(), 3, "star projection keeps the row width");
}

#[test]
fn offset_after_limit_pushes_down() {
    let mut aliases = AliasGenerator::new();
    let mut select = customers(&mut aliases);
    select.set_limit(SqlExpr::literal(10), &mut aliases);
    select.set_offset(SqlExpr::literal(5), &mut aliases);

    assert!(select.limit().is_none(), "the outer select carries only the offset");
    assert_eq!(select.offset(), Some(&SqlExpr::literal(5)));
    assert_eq!(select.tables().len(), 1);
}

#[test]
fn push_down_without_limit_lifts_orderings_out() {
    let mut aliases = AliasGenerator::new();
    let mut select = customers(&mut aliases);
    select.prepend_to_order_by(vec![SqlOrdering::asc(col("Name"))]);
    let alias = select.push_down_subquery(&mut aliases);

    assert_eq!(alias, "t");
    assert_eq!(
        select.order_by(),
        &[SqlOrdering::asc(SqlExpr::column("t", "Name"))],
        "ordering now refers to the derived column"
    );
    let sql = generate_sql(&select, &AnsiDialect);
    assert!(
        !sql.contains("    ORDER BY"),
        "an unlimited inner select drops its ordering: {sql}"
    );
}

#[test]
fn push_down_projects_computed_orderings() {
    let mut aliases = AliasGenerator::new();
    let mut select = customers(&mut aliases);
    let computed = SqlExpr::binary(BinaryOp::Add, col("Id"), SqlExpr::literal(1));
    select.prepend_to_order_by(vec![SqlOrdering::desc(computed)]);
    select.push_down_subquery(&mut aliases);

    assert_eq!(select.row_width(), 4, "the ordering key joins the inner projection");
    assert_eq!(
        select.order_by(),
        &[SqlOrdering::desc(SqlExpr::column("t", "c"))]
    );
}

#[test]
fn column_lookup_projects_through_derived_tables() {
    let mut aliases = AliasGenerator::new();
    let mut select = customers(&mut aliases);
    select.set_limit(SqlExpr::literal(3), &mut aliases);
    select.push_down_subquery(&mut aliases);

    assert_eq!(
        select.column_for(CUSTOMERS, "City"),
        Some(SqlExpr::column("t", "City")),
        "already projected columns are reused"
    );
    assert_eq!(
        select.column_for(CUSTOMERS, "Secret"),
        Some(SqlExpr::column("t", "Secret"))
    );
    assert_eq!(select.row_width(), 4, "a new column is appended to the inner select");
    assert_eq!(select.column_for(ORDERS, "Id"), None);
}

#[test]
fn join_appends_inner_columns_with_unique_aliases() {
    let mut aliases = AliasGenerator::new();
    let mut outer = customers(&mut aliases);
    let inner = orders(&mut aliases);

    let offset = outer.add_inner_join(
        inner,
        SqlExpr::equal(col("Id"), SqlExpr::column("o", "CustomerId")),
    );

    assert_eq!(offset, 3, "inner block starts after the outer block");
    let aliases: Vec<&str> = outer.projection().iter().map(|p| p.alias.as_str()).collect();
    assert_eq!(aliases, vec!["Id", "Name", "City", "Id0", "CustomerId", "Total"]);
    assert_eq!(
        generate_sql(&outer, &AnsiDialect),
        "SELECT \"c\".\"Id\", \"c\".\"Name\", \"c\".\"City\", \"o\".\"Id\" AS \"Id0\", \
         \"o\".\"CustomerId\", \"o\".\"Total\"\n\
         FROM \"Customers\" AS \"c\"\n\
         INNER JOIN \"Orders\" AS \"o\" ON \"c\".\"Id\" = \"o\".\"CustomerId\""
    );
    assert!(outer.contains_source(ORDERS));
}

#[test]
fn joining_a_filtered_select_uses_a_derived_table() {
    let mut aliases = AliasGenerator::new();
    let mut outer = customers(&mut aliases);
    let mut inner = orders(&mut aliases);
    inner.add_predicate(SqlExpr::binary(
        BinaryOp::Gt,
        SqlExpr::column("o", "Total"),
        SqlExpr::literal(10),
    ));
    inner.prepare_for_join(&mut aliases);

    let offset = outer.add_left_outer_join(inner, truth(true));

    assert_eq!(offset, 3);
    assert_eq!(outer.projection()[3].expr, SqlExpr::column("t", "Id"));
    assert!(outer.contains_source(ORDERS), "sources are found inside derived tables");
}

#[test]
fn retargeting_relabels_tables_and_projection() {
    let mut aliases = AliasGenerator::new();
    let mut select = customers(&mut aliases);
    let target = QuerySourceId::new(9);
    select.update_query_source(CUSTOMERS, target);

    assert!(select.contains_source(target));
    assert!(!select.contains_source(CUSTOMERS));
    assert!(select.projection().iter().all(|p| p.query_source == Some(target)));
}

// ---------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------

#[test]
fn and_drops_true_and_short_circuits_false() {
    let a = SqlExpr::equal(col("Name"), text("a"));

    assert_eq!(normalize_predicate(&SqlExpr::And(vec![truth(true), a.clone()])), a);
    assert_eq!(
        normalize_predicate(&SqlExpr::And(vec![a.clone(), truth(false)])),
        truth(false)
    );
    assert_eq!(normalize_predicate(&SqlExpr::And(vec![])), truth(true));
}

#[test]
fn or_drops_false_and_short_circuits_true() {
    let a = SqlExpr::equal(col("Name"), text("a"));

    assert_eq!(normalize_predicate(&SqlExpr::Or(vec![truth(false), a.clone()])), a);
    assert_eq!(
        normalize_predicate(&SqlExpr::Or(vec![a, truth(true)])),
        truth(true)
    );
    assert_eq!(normalize_predicate(&SqlExpr::Or(vec![])), truth(false));
}

#[test]
fn nested_junctions_flatten_and_dedupe() {
    let a = SqlExpr::equal(col("Name"), text("a"));
    let b = SqlExpr::equal(col("City"), text("b"));
    let c = SqlExpr::IsNull(Box::new(col("Id")));
    let nested = SqlExpr::And(vec![SqlExpr::And(vec![a.clone(), b.clone()]), a.clone(), c.clone()]);

    assert_eq!(normalize_predicate(&nested), SqlExpr::And(vec![a, b, c]));
}

#[test]
fn negations_fold() {
    let a = SqlExpr::equal(col("Name"), text("a"));

    assert_eq!(normalize_predicate(&a.clone().negate().negate()), a);
    assert_eq!(normalize_predicate(&truth(true).negate()), truth(false));
    assert_eq!(
        normalize_predicate(&SqlExpr::IsNull(Box::new(col("Id"))).negate()),
        SqlExpr::IsNotNull(Box::new(col("Id")))
    );
}

#[test]
fn redundant_not_null_check_collapses_into_equality() {
    let equality = SqlExpr::equal(col("Name"), text("a"));
    let predicate = SqlExpr::And(vec![
        SqlExpr::IsNotNull(Box::new(col("Name"))),
        equality.clone(),
    ]);

    assert_eq!(normalize_predicate(&predicate), equality);

    let null_equality = SqlExpr::equal(col("Name"), SqlExpr::Literal(Value::Null));
    let kept = SqlExpr::And(vec![
        SqlExpr::IsNotNull(Box::new(col("Name"))),
        null_equality,
    ]);
    assert_eq!(
        normalize_predicate(&kept),
        kept,
        "a null literal does not imply a non-null column"
    );
}

#[test]
fn select_normalization_removes_trivial_predicates() {
    let mut aliases = AliasGenerator::new();
    let mut select = customers(&mut aliases);
    select.add_predicate(truth(true));
    select.add_predicate(SqlExpr::And(vec![truth(true)]));
    select.normalize();

    assert_eq!(select.predicate(), None);
}

fn arb_literal() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        (-3i64..3).prop_map(Value::Int),
        "[a-c]".prop_map(Value::Text),
    ]
}

fn arb_column() -> impl Strategy<Value = SqlExpr> {
    prop::sample::select(vec!["Id", "Name", "City"]).prop_map(col)
}

fn arb_predicate() -> impl Strategy<Value = SqlExpr> {
    let leaf = prop_oneof![
        arb_literal().prop_map(SqlExpr::Literal),
        arb_column().prop_map(|c| SqlExpr::IsNull(Box::new(c))),
        arb_column().prop_map(|c| SqlExpr::IsNotNull(Box::new(c))),
        (arb_column(), arb_literal())
            .prop_map(|(c, v)| SqlExpr::equal(c, SqlExpr::Literal(v))),
    ];

    leaf.prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(SqlExpr::And),
            prop::collection::vec(inner.clone(), 0..4).prop_map(SqlExpr::Or),
            inner.prop_map(|p| SqlExpr::Not(Box::new(p))),
        ]
    })
}

proptest! {
    #[test]
    fn normalization_is_idempotent(predicate in arb_predicate()) {
        let once = normalize_predicate(&predicate);
        let twice = normalize_predicate(&once);
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn normalized_junctions_are_flat(predicate in arb_predicate()) {
        let normalized = normalize_predicate(&predicate);
        match &normalized {
            SqlExpr::And(parts) => {
                prop_assert!(parts.len() > 1);
                prop_assert!(!parts.iter().any(|p| matches!(p, SqlExpr::And(_))));
            }
            SqlExpr::Or(parts) => {
                prop_assert!(parts.len() > 1);
                prop_assert!(!parts.iter().any(|p| matches!(p, SqlExpr::Or(_))));
            }
            _ => {}
        }
    }
}
