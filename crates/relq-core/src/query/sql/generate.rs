use crate::{
    query::{
        model::OrderDirection,
        sql::{JoinKind, SelectExpression, SqlExpr, TableSource},
    },
    storage::{RelationalCommand, RelationalParameter, SqlDialect},
    value::Value,
};
use std::fmt::Write as _;

const INDENT: &str = "    ";

/// Generate the command for `select`. Every referenced parameter becomes a
/// dynamic relational parameter, in first-use order.
#[must_use]
pub fn generate_command(select: &SelectExpression, dialect: &dyn SqlDialect) -> RelationalCommand {
    let mut generator = SqlGenerator::new(dialect);
    let text = generator.select(select);
    let parameters = generator
        .parameters
        .into_iter()
        .map(|name| RelationalParameter::dynamic(name.clone(), name))
        .collect();

    RelationalCommand::new(text, parameters)
}

/// SQL text of `select` alone.
#[must_use]
pub fn generate_sql(select: &SelectExpression, dialect: &dyn SqlDialect) -> String {
    SqlGenerator::new(dialect).select(select)
}

///
/// SqlGenerator
///

struct SqlGenerator<'a> {
    dialect: &'a dyn SqlDialect,
    parameters: Vec<String>,
}

impl<'a> SqlGenerator<'a> {
    fn new(dialect: &'a dyn SqlDialect) -> Self {
        Self {
            dialect,
            parameters: Vec::new(),
        }
    }

    fn select(&mut self, select: &SelectExpression) -> String {
        self.select_with(select, false)
    }

    fn select_with(&mut self, select: &SelectExpression, exists: bool) -> String {
        let mut lines: Vec<String> = Vec::new();

        let mut head = String::from("SELECT ");
        if select.is_distinct() {
            head.push_str("DISTINCT ");
        }
        head.push_str(&self.projection(select, exists));
        lines.push(head);

        for (i, table) in select.tables().iter().enumerate() {
            let source = self.table_source(&table.source, &table.alias);
            let line = match (&table.join, i) {
                (JoinKind::Root, 0) => format!("FROM {source}"),
                (JoinKind::Root | JoinKind::Cross, _) => format!("CROSS JOIN {source}"),
                (JoinKind::CrossLateral, _) => format!("CROSS JOIN LATERAL {source}"),
                (JoinKind::Inner(p), _) => format!("INNER JOIN {source} ON {}", self.expr(p)),
                (JoinKind::LeftOuter(p), _) => format!("LEFT JOIN {source} ON {}", self.expr(p)),
            };
            lines.push(line);
        }

        if let Some(predicate) = select.predicate() {
            lines.push(format!("WHERE {}", self.expr(predicate)));
        }

        if !select.order_by().is_empty() && !exists {
            let parts: Vec<String> = select
                .order_by()
                .iter()
                .map(|o| match o.direction {
                    OrderDirection::Ascending => self.expr(&o.expr),
                    OrderDirection::Descending => {
                        format!("{} DESC", self.expr(&o.expr))
                    }
                })
                .collect();
            lines.push(format!("ORDER BY {}", parts.join(", ")));
        }

        let mut paging = Vec::new();
        if let Some(limit) = select.limit() {
            paging.push(format!("LIMIT {}", self.expr(limit)));
        }
        if let Some(offset) = select.offset() {
            paging.push(format!("OFFSET {}", self.expr(offset)));
        }
        if !paging.is_empty() {
            lines.push(paging.join(" "));
        }

        lines.join("\n")
    }

    fn projection(&mut self, select: &SelectExpression, exists: bool) -> String {
        if exists {
            return "1".to_string();
        }
        if let Some(alias) = select.project_star() {
            return format!("{}.*", self.dialect.quote_identifier(alias));
        }
        if select.projection().is_empty() {
            return "1".to_string();
        }

        let parts: Vec<String> = select
            .projection()
            .iter()
            .map(|item| {
                let text = self.expr(&item.expr);
                match &item.expr {
                    SqlExpr::Column { column, .. } if *column == item.alias => text,
                    _ => format!("{text} AS {}", self.dialect.quote_identifier(&item.alias)),
                }
            })
            .collect();

        parts.join(", ")
    }

    fn table_source(&mut self, source: &TableSource, alias: &str) -> String {
        let alias = self.dialect.quote_identifier(alias);
        match source {
            TableSource::Table(name) => {
                format!("{} AS {alias}", self.dialect.quote_identifier(name))
            }
            TableSource::Derived(inner) => {
                format!("({}\n) AS {alias}", indent(&self.select(inner)))
            }
        }
    }

    fn expr(&mut self, expr: &SqlExpr) -> String {
        match expr {
            SqlExpr::Column { table, column } => format!(
                "{}.{}",
                self.dialect.quote_identifier(table),
                self.dialect.quote_identifier(column)
            ),
            SqlExpr::Literal(value) => self.literal(value),
            SqlExpr::Parameter(name) => {
                if !self.parameters.contains(name) {
                    self.parameters.push(name.clone());
                }
                self.dialect.parameter_placeholder(name)
            }
            SqlExpr::Binary(op, left, right) => {
                let precedence = op.precedence();
                let l = self.operand(left, precedence, false);
                let r = self.operand(right, precedence, true);
                format!("{l} {} {r}", op.symbol())
            }
            SqlExpr::And(parts) => self.junction(parts, " AND ", 2),
            SqlExpr::Or(parts) => self.junction(parts, " OR ", 1),
            SqlExpr::Not(inner) => format!("NOT ({})", self.expr(inner)),
            SqlExpr::IsNull(inner) => format!("{} IS NULL", self.operand(inner, 4, false)),
            SqlExpr::IsNotNull(inner) => format!("{} IS NOT NULL", self.operand(inner, 4, false)),
            SqlExpr::Case {
                condition,
                then,
                otherwise,
            } => format!(
                "CASE WHEN {} THEN {} ELSE {} END",
                self.expr(condition),
                self.expr(then),
                self.expr(otherwise)
            ),
            SqlExpr::Exists(select) => {
                format!("EXISTS ({}\n)", indent(&self.select_with(select, true)))
            }
            SqlExpr::Function { name, args } => {
                let args: Vec<String> = args.iter().map(|a| self.expr(a)).collect();
                format!("{name}({})", args.join(", "))
            }
            SqlExpr::Star => "*".to_string(),
        }
    }

    fn junction(&mut self, parts: &[SqlExpr], separator: &str, precedence: u8) -> String {
        let rendered: Vec<String> = parts
            .iter()
            .map(|p| self.operand(p, precedence, false))
            .collect();

        rendered.join(separator)
    }

    // Parenthesize `expr` when it binds looser than its parent.
    fn operand(&mut self, expr: &SqlExpr, parent: u8, right: bool) -> String {
        let own = match expr {
            SqlExpr::Or(_) => Some(1),
            SqlExpr::And(_) => Some(2),
            SqlExpr::Binary(op, _, _) => Some(op.precedence()),
            _ => None,
        };
        let text = self.expr(expr);
        match own {
            Some(p) if p < parent || (right && p == parent && parent > 2) => format!("({text})"),
            _ => text,
        }
    }

    fn literal(&self, value: &Value) -> String {
        match value {
            Value::Null => "NULL".to_string(),
            Value::Bool(true) => self.dialect.true_literal().to_string(),
            Value::Bool(false) => self.dialect.false_literal().to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => {
                let text = f.to_string();
                if text.contains(['.', 'e', 'E', 'N', 'i']) {
                    text
                } else {
                    format!("{text}.0")
                }
            }
            Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
            Value::Blob(bytes) => {
                let mut hex = String::with_capacity(bytes.len() * 2 + 3);
                hex.push_str("X'");
                for byte in bytes {
                    let _ = write!(hex, "{byte:02X}");
                }
                hex.push('\'');
                hex
            }
            Value::List(items) => {
                let items: Vec<String> = items.iter().map(|i| self.literal(i)).collect();
                format!("({})", items.join(", "))
            }
        }
    }
}

fn indent(text: &str) -> String {
    text.lines()
        .map(|line| format!("\n{INDENT}{line}"))
        .collect()
}
