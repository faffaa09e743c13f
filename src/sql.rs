use sqlparser::ast::{
    self, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::limits::DEFAULT_LOW_STOCK_THRESHOLD;

/// A holder addressed either by id or by its contact key.
#[derive(Debug, Clone, PartialEq)]
pub enum HolderRef {
    Id(Ulid),
    Contact(String),
}

impl HolderRef {
    /// A value that parses as a ULID is an id; anything else is a contact.
    fn from_text(s: &str) -> Self {
        match Ulid::from_string(s.trim()) {
            Ok(id) => HolderRef::Id(id),
            Err(_) => HolderRef::Contact(s.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResourceFilter {
    All,
    Available,
    LowStock(u32),
    ById(Ulid),
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertResource {
        id: Ulid,
        name: Option<String>,
        description: Option<String>,
        stock: u32,
    },
    InsertHolder {
        id: Ulid,
        contact: String,
    },
    Reserve {
        holder: HolderRef,
        resource_id: Ulid,
    },
    Release {
        holder: HolderRef,
        resource_id: Ulid,
    },
    SelectResources {
        filter: ResourceFilter,
    },
    SelectTopResource,
    SelectClaims {
        holder: HolderRef,
    },
}

const RESOURCE_COLUMNS: &[&str] = &["id", "name", "description", "stock"];
const HOLDER_COLUMNS: &[&str] = &["id", "contact"];
const CLAIM_COLUMNS: &[&str] = &["holder", "resource_id"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "resources" => {
            let cols = align_values(insert, &values, "resources", RESOURCE_COLUMNS)?;
            let stock = match cols[3] {
                Some(expr) => parse_u32(expr)?,
                None => 1,
            };
            Ok(Command::InsertResource {
                id: parse_ulid_expr(required(&cols, 0, "resources", "id")?)?,
                name: cols[1].map(parse_string_or_null).transpose()?.flatten(),
                description: cols[2].map(parse_string_or_null).transpose()?.flatten(),
                stock,
            })
        }
        "holders" => {
            let cols = align_values(insert, &values, "holders", HOLDER_COLUMNS)?;
            Ok(Command::InsertHolder {
                id: parse_ulid_expr(required(&cols, 0, "holders", "id")?)?,
                contact: parse_string(required(&cols, 1, "holders", "contact")?)?,
            })
        }
        "claims" => {
            let cols = align_values(insert, &values, "claims", CLAIM_COLUMNS)?;
            Ok(Command::Reserve {
                holder: parse_holder_expr(required(&cols, 0, "claims", "holder")?)?,
                resource_id: parse_ulid_expr(required(&cols, 1, "claims", "resource_id")?)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    if table != "claims" {
        return Err(SqlError::UnknownTable(table));
    }

    let mut filters = Vec::new();
    if let Some(selection) = &delete.selection {
        collect_filters(selection, &mut filters)?;
    }
    Ok(Command::Release {
        holder: parse_holder_expr(find_eq(&filters, "holder")?)?,
        resource_id: parse_ulid_expr(find_eq(&filters, "resource_id")?)?,
    })
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "resources" => Ok(Command::SelectResources {
            filter: resource_filter(&filters)?,
        }),
        "low_stock" => Ok(Command::SelectResources {
            filter: ResourceFilter::LowStock(DEFAULT_LOW_STOCK_THRESHOLD),
        }),
        "top_resource" => Ok(Command::SelectTopResource),
        "claims" => Ok(Command::SelectClaims {
            holder: parse_holder_expr(find_eq(&filters, "holder")?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn resource_filter(filters: &[Filter<'_>]) -> Result<ResourceFilter, SqlError> {
    match filters {
        [] => Ok(ResourceFilter::All),
        [(col, BinaryOperator::Eq, value)] if col == "id" => Ok(ResourceFilter::ById(parse_ulid_expr(value)?)),
        [(col, BinaryOperator::Gt, value)] if col == "stock" && parse_i64_expr(value).ok() == Some(0) => {
            Ok(ResourceFilter::Available)
        }
        [(col, BinaryOperator::Lt, value)] if col == "stock" => Ok(ResourceFilter::LowStock(parse_u32(value)?)),
        _ => Err(SqlError::Unsupported(
            "resources filter must be one of: id = .., stock > 0, stock < n".into(),
        )),
    }
}

// ── Helpers ───────────────────────────────────────────────────

/// One `column <op> value` comparison from a WHERE clause.
type Filter<'a> = (String, BinaryOperator, &'a Expr);

/// Flatten a conjunction of simple comparisons.
fn collect_filters<'a>(expr: &'a Expr, out: &mut Vec<Filter<'a>>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            collect_filters(left, out)?;
            collect_filters(right, out)
        }
        Expr::BinaryOp { left, op, right } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.push((col, op.clone(), right.as_ref()));
            Ok(())
        }
        Expr::Nested(inner) => collect_filters(inner, out),
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

fn find_eq<'a>(filters: &[Filter<'a>], column: &'static str) -> Result<&'a Expr, SqlError> {
    filters
        .iter()
        .find(|(col, op, _)| col == column && *op == BinaryOperator::Eq)
        .map(|(_, _, value)| *value)
        .ok_or(SqlError::MissingFilter(column))
}

/// Line VALUES up with `order`, honoring an explicit column list if present.
fn align_values<'a>(
    insert: &ast::Insert,
    values: &'a [Expr],
    table: &'static str,
    order: &[&'static str],
) -> Result<Vec<Option<&'a Expr>>, SqlError> {
    if insert.columns.is_empty() {
        if values.len() > order.len() {
            return Err(SqlError::WrongArity(table, order.len(), values.len()));
        }
        return Ok((0..order.len()).map(|i| values.get(i)).collect());
    }
    if insert.columns.len() != values.len() {
        return Err(SqlError::WrongArity(table, insert.columns.len(), values.len()));
    }
    let mut out = vec![None; order.len()];
    for (col, value) in insert.columns.iter().zip(values) {
        let name = col.value.to_lowercase();
        let pos = order
            .iter()
            .position(|c| *c == name)
            .ok_or(SqlError::UnknownColumn(table, name))?;
        out[pos] = Some(value);
    }
    Ok(out)
}

fn required<'a>(
    cols: &[Option<&'a Expr>],
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<&'a Expr, SqlError> {
    cols[idx].ok_or(SqlError::MissingColumn(table, column))
}

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) | Value::Number(s, _) => {
                Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_holder_expr(expr: &Expr) -> Result<HolderRef, SqlError> {
    parse_string(expr).map(|s| HolderRef::from_text(&s))
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    parse_string_or_null(expr)?.ok_or_else(|| SqlError::Parse("unexpected NULL".into()))
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) => Ok(Some(s.clone())),
        Some(other) => Err(SqlError::Parse(format!("expected string or NULL, got {other:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(&'static str, String),
    MissingColumn(&'static str, &'static str),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(t, c) => write!(f, "{t}: unknown column {c}"),
            SqlError::MissingColumn(t, c) => write!(f, "{t}: missing value for {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
