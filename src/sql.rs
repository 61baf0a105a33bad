use std::collections::BTreeSet;

use chrono::{NaiveDate, NaiveTime};
use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::{parse_date, parse_time_of_day, EngineError};
use crate::model::*;

const VENUE_COLUMNS: &[&str] = &["id", "name", "opening", "closing", "rate", "games"];
const BOOKING_COLUMNS: &[&str] = &["customer_id", "venue_id", "date", "start", "end", "game"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookingFilter {
    Id(Ulid),
    Customer(Ulid),
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertVenue {
        venue: Venue,
    },
    DeleteVenue {
        id: Ulid,
    },
    SelectVenues {
        id: Option<Ulid>,
    },
    SelectAvailability {
        venue_id: Ulid,
        date: NaiveDate,
    },
    SelectSlots {
        venue_id: Ulid,
        date: NaiveDate,
    },
    InsertBooking {
        request: BookingRequest,
        returning: bool,
    },
    SelectBookings {
        filter: BookingFilter,
    },
    DeleteBooking {
        id: Ulid,
    },
}

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

/// One VALUES row keyed by column. Without a column list the table's
/// declared column order applies.
struct Row<'a> {
    table: &'static str,
    columns: Vec<String>,
    values: &'a [Expr],
}

impl<'a> Row<'a> {
    fn new(
        table: &'static str,
        declared: &[&str],
        insert: &ast::Insert,
        values: &'a [Expr],
    ) -> Result<Self, SqlError> {
        let columns: Vec<String> = if insert.columns.is_empty() {
            declared.iter().map(|c| c.to_string()).collect()
        } else {
            insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
        };
        if let Some(unknown) = columns.iter().find(|c| !declared.contains(&c.as_str())) {
            return Err(SqlError::UnknownColumn(table, unknown.clone()));
        }
        if values.len() != columns.len() {
            return Err(SqlError::WrongArity(table, columns.len(), values.len()));
        }
        Ok(Self { table, columns, values })
    }

    fn get(&self, column: &'static str) -> Option<&'a Expr> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|i| &self.values[i])
    }

    fn require(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column)
            .ok_or(SqlError::MissingColumn(self.table, column))
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "venues" => {
            let row = Row::new("venues", VENUE_COLUMNS, insert, &values)?;
            let name = match row.get("name") {
                Some(expr) => parse_string_or_null(expr)?,
                None => None,
            };
            let games = match row.get("games") {
                Some(expr) => parse_games(&parse_string_or_null(expr)?.unwrap_or_default()),
                None => BTreeSet::new(),
            };
            Ok(Command::InsertVenue {
                venue: Venue {
                    id: parse_ulid(row.require("id")?)?,
                    name,
                    opening: parse_time(row.require("opening")?)?,
                    closing: parse_time(row.require("closing")?)?,
                    rate_per_hour: parse_u64(row.require("rate")?)?,
                    games,
                },
            })
        }
        "bookings" => {
            let row = Row::new("bookings", BOOKING_COLUMNS, insert, &values)?;
            Ok(Command::InsertBooking {
                request: BookingRequest {
                    customer_id: parse_ulid(row.require("customer_id")?)?,
                    venue_id: parse_ulid(row.require("venue_id")?)?,
                    date: parse_date_expr(row.require("date")?)?,
                    start: parse_time(row.require("start")?)?,
                    end: parse_time(row.require("end")?)?,
                    game: parse_string(row.require("game")?)?,
                },
                returning: insert.returning.is_some(),
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "venues" => Ok(Command::DeleteVenue { id }),
        "bookings" => Ok(Command::DeleteBooking { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Equality filters collected from a WHERE clause of `col = value` terms
/// joined by AND.
#[derive(Default)]
struct Filters<'a> {
    terms: Vec<(String, &'a Expr)>,
}

impl<'a> Filters<'a> {
    fn collect(expr: &'a Expr, out: &mut Self) -> Result<(), SqlError> {
        match expr {
            Expr::BinaryOp { left, op, right } => match op {
                ast::BinaryOperator::And => {
                    Self::collect(left, out)?;
                    Self::collect(right, out)?;
                }
                ast::BinaryOperator::Eq => {
                    let col = expr_column_name(left)
                        .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
                    out.terms.push((col, right));
                }
                _ => return Err(SqlError::Unsupported(format!("operator {op}"))),
            },
            Expr::Nested(inner) => Self::collect(inner, out)?,
            other => return Err(SqlError::Unsupported(format!("filter {other}"))),
        }
        Ok(())
    }

    fn from_selection(selection: &'a Option<Expr>) -> Result<Self, SqlError> {
        let mut filters = Self::default();
        if let Some(expr) = selection {
            Self::collect(expr, &mut filters)?;
        }
        Ok(filters)
    }

    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.terms
            .iter()
            .find(|(c, _)| c == column)
            .map(|(_, e)| *e)
    }

    fn ulid(&self, column: &'static str) -> Result<Option<Ulid>, SqlError> {
        self.get(column).map(parse_ulid).transpose()
    }

    fn venue_day(&self) -> Result<(Ulid, NaiveDate), SqlError> {
        let venue_id = self.ulid("venue_id")?.ok_or(SqlError::MissingFilter("venue_id"))?;
        let date = self
            .get("date")
            .map(parse_date_expr)
            .transpose()?
            .ok_or(SqlError::MissingFilter("date"))?;
        Ok((venue_id, date))
    }
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
    let filters = Filters::from_selection(&select.selection)?;

    match table.as_str() {
        "venues" => Ok(Command::SelectVenues {
            id: filters.ulid("id")?,
        }),
        "availability" => {
            let (venue_id, date) = filters.venue_day()?;
            Ok(Command::SelectAvailability { venue_id, date })
        }
        "slots" => {
            let (venue_id, date) = filters.venue_day()?;
            Ok(Command::SelectSlots { venue_id, date })
        }
        "bookings" => {
            let filter = if let Some(id) = filters.ulid("id")? {
                BookingFilter::Id(id)
            } else if let Some(customer) = filters.ulid("customer_id")? {
                BookingFilter::Customer(customer)
            } else {
                return Err(SqlError::MissingFilter("id or customer_id"));
            };
            Ok(Command::SelectBookings { filter })
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

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            if expr_column_name(left).as_deref() == Some("id") {
                parse_ulid(right)
            } else {
                Err(SqlError::MissingFilter("id"))
            }
        }
        _ => Err(SqlError::MissingFilter("id")),
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

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) => Ok(Some(s.clone())),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    parse_string_or_null(expr)?.ok_or_else(|| SqlError::Parse("unexpected NULL".into()))
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
}

fn parse_time(expr: &Expr) -> Result<NaiveTime, SqlError> {
    Ok(parse_time_of_day(&parse_string(expr)?)?)
}

fn parse_date_expr(expr: &Expr) -> Result<NaiveDate, SqlError> {
    Ok(parse_date(&parse_string(expr)?)?)
}

fn parse_u64(expr: &Expr) -> Result<u64, SqlError> {
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad amount {s}: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

/// Comma-separated game list.
fn parse_games(s: &str) -> BTreeSet<String> {
    s.split(',')
        .map(|g| g.trim().to_lowercase())
        .filter(|g| !g.is_empty())
        .collect()
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
    /// A well-formed statement carrying a value the engine rejects.
    Engine(EngineError),
}

impl From<EngineError> for SqlError {
    fn from(e: EngineError) -> Self {
        SqlError::Engine(e)
    }
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(t, c) => write!(f, "{t}: unknown column {c}"),
            SqlError::MissingColumn(t, c) => write!(f, "{t}: missing column {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::Engine(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SqlError {}
