use std::collections::HashMap;

use chrono::NaiveDate;
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::StayRequest;
use crate::limits::MAX_BATCH_ROWS;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    OpenEntries {
        entries: Vec<(EntryKey, EntrySpec)>,
    },
    ReserveStay(StayRequest),
    ReleaseStay {
        room: RoomTypeKey,
        check_in: NaiveDate,
        check_out: NaiveDate,
        reservation_id: Ulid,
    },
    UpdateEntry {
        key: EntryKey,
        change: EntryChange,
    },
    SetRate {
        key: EntryKey,
        channel: Channel,
        rate: Rate,
    },
    SelectAvailability {
        room: RoomTypeKey,
        check_in: NaiveDate,
        check_out: NaiveDate,
        channel: Option<Channel>,
    },
}

/// The one assignment of an `UPDATE entries` statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryChange {
    TotalCapacity(u32),
    Block(u32),
    Unblock(u32),
    Status(EntryStatus),
    CloseChannel(Channel),
    OpenChannel(Channel),
    Restrictions(StayRestrictions),
}

const ENTRY_COLUMNS: &[&str] = &[
    "property_id",
    "room_type_id",
    "date",
    "total_capacity",
    "base_price",
    "currency",
    "min_stay",
    "max_stay",
];
const STAY_COLUMNS: &[&str] = &[
    "reservation_id",
    "property_id",
    "room_type_id",
    "check_in",
    "check_out",
    "channel",
    "label",
];
const RATE_COLUMNS: &[&str] = &["property_id", "room_type_id", "date", "channel", "price", "currency"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── Rows by column name ───────────────────────────────────────

/// One VALUES row, addressable by column name. Without an explicit column
/// list, values map positionally onto the table's declared columns.
struct Row<'a> {
    table: &'static str,
    index: HashMap<String, usize>,
    values: &'a [Expr],
}

impl<'a> Row<'a> {
    fn new(table: &'static str, declared: &[&str], columns: &[ast::Ident], values: &'a [Expr]) -> Result<Self, SqlError> {
        let names: Vec<String> = if columns.is_empty() {
            declared.iter().map(|c| c.to_string()).collect()
        } else {
            columns.iter().map(|c| c.value.to_lowercase()).collect()
        };
        if values.len() > names.len() {
            return Err(SqlError::WrongArity(table, names.len(), values.len()));
        }
        if let Some(unknown) = names.iter().find(|n| !declared.contains(&n.as_str())) {
            return Err(SqlError::UnknownColumn(table, unknown.clone()));
        }
        let index = names.into_iter().enumerate().map(|(i, n)| (n, i)).collect();
        Ok(Self { table, index, values })
    }

    fn get(&self, column: &str) -> Option<&'a Expr> {
        let values: &'a [Expr] = self.values;
        self.index.get(column).and_then(|i| values.get(*i)).filter(|e| !is_null(e))
    }

    fn required(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(self.table, column))
    }
}

// ── INSERT ────────────────────────────────────────────────────

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let rows = extract_all_insert_rows(insert)?;

    match table.as_str() {
        "entries" => {
            if rows.len() > MAX_BATCH_ROWS {
                return Err(SqlError::TooManyRows(rows.len()));
            }
            let mut entries = Vec::with_capacity(rows.len());
            for (i, values) in rows.iter().enumerate() {
                let row = Row::new("entries", ENTRY_COLUMNS, &insert.columns, values)?;
                entries.push(parse_entry_row(&row).map_err(|e| e.in_row(i, rows.len()))?);
            }
            Ok(Command::OpenEntries { entries })
        }
        "stays" => {
            let values = single_row("stays", &rows)?;
            let row = Row::new("stays", STAY_COLUMNS, &insert.columns, values)?;
            Ok(Command::ReserveStay(StayRequest {
                reservation_id: parse_ulid_expr(row.required("reservation_id")?)?,
                property_id: parse_ulid_expr(row.required("property_id")?)?,
                room_type_id: parse_ulid_expr(row.required("room_type_id")?)?,
                check_in: parse_date_expr(row.required("check_in")?)?,
                check_out: parse_date_expr(row.required("check_out")?)?,
                channel: parse_string_expr(row.required("channel")?)?.parse()?,
                label: row.get("label").map(parse_string_expr).transpose()?,
            }))
        }
        "rates" => {
            let values = single_row("rates", &rows)?;
            let row = Row::new("rates", RATE_COLUMNS, &insert.columns, values)?;
            let key = parse_key(&row)?;
            let currency = Currency::new(&parse_string_expr(row.required("currency")?)?)?;
            Ok(Command::SetRate {
                key,
                channel: parse_string_expr(row.required("channel")?)?.parse()?,
                rate: Rate::new(parse_i64_expr(row.required("price")?)?, currency)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_entry_row(row: &Row<'_>) -> Result<(EntryKey, EntrySpec), SqlError> {
    let key = parse_key(row)?;
    let currency = Currency::new(&parse_string_expr(row.required("currency")?)?)?;
    let base_rate = Rate::new(parse_i64_expr(row.required("base_price")?)?, currency)?;
    let defaults = StayRestrictions::default();
    let min_stay = row.get("min_stay").map(parse_u32).transpose()?.unwrap_or(defaults.min_stay);
    let max_stay = row.get("max_stay").map(parse_u32).transpose()?.unwrap_or(defaults.max_stay);
    let spec = EntrySpec::new(parse_u32(row.required("total_capacity")?)?, base_rate)
        .with_restrictions(min_stay, max_stay);
    Ok((key, spec))
}

fn parse_key(row: &Row<'_>) -> Result<EntryKey, SqlError> {
    Ok(EntryKey::new(
        parse_ulid_expr(row.required("property_id")?)?,
        parse_ulid_expr(row.required("room_type_id")?)?,
        parse_date_expr(row.required("date")?)?,
    ))
}

fn single_row<'a>(table: &'static str, rows: &'a [Vec<Expr>]) -> Result<&'a [Expr], SqlError> {
    match rows {
        [row] => Ok(row),
        _ => Err(SqlError::Unsupported(format!("multi-row INSERT into {table}"))),
    }
}

// ── DELETE / UPDATE ───────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    if table != "stays" {
        return Err(SqlError::UnknownTable(table));
    }
    let filters = Filters::collect(delete.selection.as_ref())?;
    Ok(Command::ReleaseStay {
        room: RoomTypeKey::new(
            parse_ulid_expr(filters.required("property_id")?)?,
            parse_ulid_expr(filters.required("room_type_id")?)?,
        ),
        check_in: parse_date_expr(filters.required("check_in")?)?,
        check_out: parse_date_expr(filters.required("check_out")?)?,
        reservation_id: parse_ulid_expr(filters.required("reservation_id")?)?,
    })
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    if table != "entries" {
        return Err(SqlError::UnknownTable(table));
    }
    let filters = Filters::collect(selection.as_ref())?;
    let key = EntryKey::new(
        parse_ulid_expr(filters.required("property_id")?)?,
        parse_ulid_expr(filters.required("room_type_id")?)?,
        parse_date_expr(filters.required("date")?)?,
    );

    let mut set: HashMap<String, &Expr> = HashMap::new();
    for a in assignments {
        let column = match &a.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        set.insert(column, &a.value);
    }

    let mut columns: Vec<&str> = set.keys().map(String::as_str).collect();
    columns.sort_unstable();
    let change = match columns.as_slice() {
        ["total_capacity"] => EntryChange::TotalCapacity(parse_u32(set["total_capacity"])?),
        ["block"] => EntryChange::Block(parse_u32(set["block"])?),
        ["unblock"] => EntryChange::Unblock(parse_u32(set["unblock"])?),
        ["status"] => EntryChange::Status(parse_string_expr(set["status"])?.parse()?),
        ["close_channel"] => EntryChange::CloseChannel(parse_string_expr(set["close_channel"])?.parse()?),
        ["open_channel"] => EntryChange::OpenChannel(parse_string_expr(set["open_channel"])?.parse()?),
        ["max_stay", "min_stay"] => EntryChange::Restrictions(StayRestrictions {
            min_stay: parse_u32(set["min_stay"])?,
            max_stay: parse_u32(set["max_stay"])?,
        }),
        other => {
            return Err(SqlError::Unsupported(format!(
                "UPDATE entries SET {}",
                other.join(", ")
            )));
        }
    };
    Ok(Command::UpdateEntry { key, change })
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    if table != "availability" {
        return Err(SqlError::UnknownTable(table));
    }

    let filters = Filters::collect(select.selection.as_ref())?;
    Ok(Command::SelectAvailability {
        room: RoomTypeKey::new(
            parse_ulid_expr(filters.required("property_id")?)?,
            parse_ulid_expr(filters.required("room_type_id")?)?,
        ),
        check_in: parse_date_expr(filters.required("check_in")?)?,
        check_out: parse_date_expr(filters.required("check_out")?)?,
        channel: filters
            .get("channel")
            .map(|e| -> Result<Channel, SqlError> { Ok(parse_string_expr(e)?.parse()?) })
            .transpose()?,
    })
}

/// `col = value` conjuncts of a WHERE clause.
struct Filters<'a> {
    eq: HashMap<String, &'a Expr>,
}

impl<'a> Filters<'a> {
    fn collect(selection: Option<&'a Expr>) -> Result<Self, SqlError> {
        let mut eq = HashMap::new();
        if let Some(expr) = selection {
            collect_equalities(expr, &mut eq)?;
        }
        Ok(Self { eq })
    }

    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.eq.get(column).copied()
    }

    fn required(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingFilter(column))
    }
}

fn collect_equalities<'a>(expr: &'a Expr, out: &mut HashMap<String, &'a Expr>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_equalities(inner, out),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_equalities(left, out)?;
            collect_equalities(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.insert(col, right);
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
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

fn extract_all_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows.clone())
        }
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

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
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

/// `'YYYY-MM-DD'`.
fn parse_date_expr(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let raw = parse_string_expr(expr)?;
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|e| SqlError::Parse(format!("bad date {raw:?}: {e}")))
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

#[derive(Debug, thiserror::Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: unknown column {1}")]
    UnknownColumn(&'static str, String),
    #[error("{0}: expected at most {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("{0}: missing column {1}")]
    MissingColumn(&'static str, &'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("too many rows: {0} (max {MAX_BATCH_ROWS})")]
    TooManyRows(usize),
    #[error(transparent)]
    Model(#[from] ModelError),
}

impl SqlError {
    fn in_row(self, row: usize, rows: usize) -> Self {
        if rows == 1 {
            return self;
        }
        SqlError::Parse(format!("row {row}: {self}"))
    }
}
