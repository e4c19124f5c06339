use chrono::{DateTime, NaiveDateTime};
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// The writable table.
pub const SLOTS_TABLE: &str = "featured_slots";
/// Read-only view of the slots effectively active at an instant.
pub const FEATURED_VIEW: &str = "featured_now";

/// Column order of a positional `INSERT ... VALUES`.
const INSERT_COLUMNS: [&str; 5] = ["event_id", "rank", "is_active", "starts_at", "ends_at"];

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertSlot {
        slot: NewSlot,
        returning: bool,
    },
    UpdateSlot {
        id: Ulid,
        patch: SlotPatch,
    },
    DeleteSlot {
        id: Ulid,
    },
    SelectSlots {
        id: Option<Ulid>,
    },
    SelectFeatured {
        at: Option<Ms>,
    },
}

/// Parse exactly one statement.
pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let mut commands = parse_batch(sql)?;
    if commands.len() > 1 {
        return Err(SqlError::Unsupported(format!(
            "{} statements where one was expected",
            commands.len()
        )));
    }
    commands.pop().ok_or(SqlError::Empty)
}

/// Parse every statement of a `;`-separated batch. Nothing is returned
/// unless all of them parse.
pub fn parse_batch(sql: &str) -> Result<Vec<Command>, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    stmts.iter().map(parse_statement).collect()
}

fn parse_statement(stmt: &Statement) -> Result<Command, SqlError> {
    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    if table != SLOTS_TABLE {
        return Err(SqlError::UnknownTable(table));
    }
    let values = extract_insert_values(insert)?;

    let columns: Vec<String> = if insert.columns.is_empty() {
        if values.len() > INSERT_COLUMNS.len() {
            return Err(SqlError::WrongArity(SLOTS_TABLE, INSERT_COLUMNS.len(), values.len()));
        }
        INSERT_COLUMNS.iter().map(|c| c.to_string()).collect()
    } else {
        if insert.columns.len() != values.len() {
            return Err(SqlError::WrongArity(SLOTS_TABLE, insert.columns.len(), values.len()));
        }
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };

    let mut event_id = None;
    let mut slot = NewSlot::new(String::new());
    for (column, value) in columns.iter().zip(&values) {
        match column.as_str() {
            "event_id" => event_id = Some(parse_text(value)?),
            "rank" => slot.rank = parse_rank_or_null(value)?,
            "is_active" => slot.is_active = parse_bool(value)?,
            "starts_at" => slot.window.starts_at = parse_timestamp_or_null(value)?,
            "ends_at" => slot.window.ends_at = parse_timestamp_or_null(value)?,
            "id" | "created_at" | "updated_at" => {
                return Err(SqlError::ReadOnlyColumn(column.clone()));
            }
            _ => return Err(SqlError::UnknownColumn(column.clone())),
        }
    }
    slot.event_id = event_id.ok_or(SqlError::MissingColumn("event_id"))?;

    Ok(Command::InsertSlot {
        slot,
        returning: insert.returning.is_some(),
    })
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let name = table_factor_name(&table.relation)?;
    if name != SLOTS_TABLE {
        return Err(SqlError::UnknownTable(name));
    }

    let mut patch = SlotPatch::default();
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name)
                .ok_or_else(|| SqlError::Parse("empty column name".into()))?,
            AssignmentTarget::Tuple(_) => {
                return Err(SqlError::Unsupported("tuple assignment".into()));
            }
        };
        let value = &assignment.value;
        match column.as_str() {
            "rank" => {
                let rank = parse_rank_or_null(value)?.ok_or(SqlError::NotNull("rank"))?;
                patch.rank = Some(rank);
            }
            "is_active" => patch.is_active = Some(parse_bool(value)?),
            "starts_at" => patch.starts_at = Some(parse_timestamp_or_null(value)?),
            "ends_at" => patch.ends_at = Some(parse_timestamp_or_null(value)?),
            "id" | "event_id" | "created_at" | "updated_at" => {
                return Err(SqlError::ReadOnlyColumn(column));
            }
            _ => return Err(SqlError::UnknownColumn(column)),
        }
    }

    let id = extract_where_eq(selection, "id")?
        .map(parse_ulid)
        .transpose()?
        .ok_or(SqlError::MissingFilter("id"))?;
    Ok(Command::UpdateSlot { id, patch })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    if table != SLOTS_TABLE {
        return Err(SqlError::UnknownTable(table));
    }
    let id = extract_where_eq(&delete.selection, "id")?
        .map(parse_ulid)
        .transpose()?
        .ok_or(SqlError::MissingFilter("id"))?;
    Ok(Command::DeleteSlot { id })
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;

    match table.as_str() {
        SLOTS_TABLE => {
            let id = extract_where_eq(&select.selection, "id")?
                .map(parse_ulid)
                .transpose()?;
            Ok(Command::SelectSlots { id })
        }
        FEATURED_VIEW => {
            let at = extract_where_eq(&select.selection, "at")?
                .map(parse_timestamp)
                .transpose()?;
            Ok(Command::SelectFeatured { at })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── Helpers ───────────────────────────────────────────────────

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
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
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

/// The single VALUES row of an INSERT.
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

/// Right-hand side of `WHERE <column> = <value>`, if there is a WHERE.
fn extract_where_eq<'a>(
    selection: &'a Option<Expr>,
    column: &'static str,
) -> Result<Option<&'a Expr>, SqlError> {
    let Some(sel) = selection else {
        return Ok(None);
    };
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some(column) => Ok(Some(right)),
        _ => Err(SqlError::MissingFilter(column)),
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

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_text(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return parse_i64(expr)?
            .checked_neg()
            .ok_or_else(|| SqlError::Parse("integer out of range".into()));
    }
    match extract_value(expr) {
        Some(Value::Number(s, _) | Value::SingleQuotedString(s)) => s
            .trim()
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_rank_or_null(expr: &Expr) -> Result<Option<Rank>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    let v = parse_i64(expr)?;
    Rank::try_from(v)
        .map(Some)
        .map_err(|_| SqlError::Parse(format!("rank {v} out of range")))
}

/// Integer milliseconds, or an RFC 3339 string. Seconds may be left out
/// (`2025-06-01T00:00Z`).
fn parse_timestamp(expr: &Expr) -> Result<Ms, SqlError> {
    if let Some(Value::SingleQuotedString(s)) = extract_value(expr)
        && s.trim().parse::<i64>().is_err()
    {
        return parse_datetime(s.trim())
            .ok_or_else(|| SqlError::Parse(format!("bad timestamp {s:?}")));
    }
    parse_i64(expr)
}

fn parse_datetime(s: &str) -> Option<Ms> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis());
    }
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M%:z") {
        return Some(dt.timestamp_millis());
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%MZ")
        .ok()
        .map(|dt| dt.and_utc().timestamp_millis())
}

fn parse_timestamp_or_null(expr: &Expr) -> Result<Option<Ms>, SqlError> {
    if is_null(expr) {
        Ok(None)
    } else {
        parse_timestamp(expr).map(Some)
    }
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(Value::Null) => Err(SqlError::NotNull("is_active")),
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    ReadOnlyColumn(String),
    MissingColumn(&'static str),
    NotNull(&'static str),
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
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::ReadOnlyColumn(c) => write!(f, "column {c} cannot be written"),
            SqlError::MissingColumn(c) => write!(f, "missing column: {c}"),
            SqlError::NotNull(c) => write!(f, "{c} cannot be NULL"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col} = ..."),
        }
    }
}

impl std::error::Error for SqlError {}
