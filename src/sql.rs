use chrono::NaiveDate;
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::model::DateRange;

/// How a SELECT on bookings or blocks is narrowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    All,
    ById(Ulid),
    ByProperty(Ulid),
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertProperty {
        id: Ulid,
        name: String,
        kind: String,
    },
    UpdateProperty {
        id: Ulid,
        name: String,
        kind: String,
    },
    DeleteProperty {
        id: Ulid,
    },
    InsertGuest {
        id: Ulid,
        name: String,
        email: String,
    },
    UpdateGuest {
        id: Ulid,
        name: String,
        email: String,
    },
    DeleteGuest {
        id: Ulid,
    },
    InsertBooking {
        id: Ulid,
        property_id: Ulid,
        guest_id: Ulid,
        range: DateRange,
    },
    UpdateBooking {
        id: Ulid,
        guest_id: Ulid,
        range: DateRange,
    },
    CancelBooking {
        id: Ulid,
    },
    ReactivateBooking {
        id: Ulid,
    },
    DeleteBooking {
        id: Ulid,
    },
    InsertBlock {
        id: Ulid,
        property_id: Ulid,
        range: DateRange,
        reason: Option<String>,
    },
    UpdateBlock {
        id: Ulid,
        range: DateRange,
        reason: Option<String>,
    },
    DeleteBlock {
        id: Ulid,
    },
    SelectProperties,
    SelectGuests,
    SelectBookings {
        filter: Lookup,
    },
    SelectBlocks {
        filter: Lookup,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// Values are positional, in the column order documented on each table.
fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        // (id, name, kind)
        "properties" => {
            expect_arity("properties", &values, 3)?;
            Ok(Command::InsertProperty {
                id: parse_ulid(&values[0])?,
                name: parse_string(&values[1])?,
                kind: parse_string(&values[2])?,
            })
        }
        // (id, name, email)
        "guests" => {
            expect_arity("guests", &values, 3)?;
            Ok(Command::InsertGuest {
                id: parse_ulid(&values[0])?,
                name: parse_string(&values[1])?,
                email: parse_string(&values[2])?,
            })
        }
        // (id, property_id, guest_id, start, "end")
        "bookings" => {
            expect_arity("bookings", &values, 5)?;
            Ok(Command::InsertBooking {
                id: parse_ulid(&values[0])?,
                property_id: parse_ulid(&values[1])?,
                guest_id: parse_ulid(&values[2])?,
                range: DateRange::new(parse_date(&values[3])?, parse_date(&values[4])?),
            })
        }
        // (id, property_id, start, "end"[, reason])
        "blocks" => {
            expect_arity("blocks", &values, 4)?;
            let reason = match values.get(4) {
                Some(expr) => parse_string_or_null(expr)?,
                None => None,
            };
            Ok(Command::InsertBlock {
                id: parse_ulid(&values[0])?,
                property_id: parse_ulid(&values[1])?,
                range: DateRange::new(parse_date(&values[2])?, parse_date(&values[3])?),
                reason,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// SET clause as (column, value) pairs.
struct Assignments<'a>(Vec<(String, &'a Expr)>);

impl<'a> Assignments<'a> {
    fn from_ast(assignments: &'a [ast::Assignment]) -> Result<Self, SqlError> {
        let mut out = Vec::with_capacity(assignments.len());
        for a in assignments {
            let column = match &a.target {
                AssignmentTarget::ColumnName(name) => object_name_last(name),
                AssignmentTarget::Tuple(_) => None,
            }
            .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
            out.push((column, &a.value));
        }
        Ok(Self(out))
    }

    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.0.iter().find(|(c, _)| c == column).map(|(_, e)| *e)
    }

    fn require(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(column))
    }
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let set = Assignments::from_ast(assignments)?;
    let id = extract_where_id(selection)?;

    match table.as_str() {
        "properties" => Ok(Command::UpdateProperty {
            id,
            name: parse_string(set.require("name")?)?,
            kind: parse_string(set.require("kind")?)?,
        }),
        "guests" => Ok(Command::UpdateGuest {
            id,
            name: parse_string(set.require("name")?)?,
            email: parse_string(set.require("email")?)?,
        }),
        "bookings" => {
            if let Some(status) = set.get("status") {
                if set.0.len() > 1 {
                    return Err(SqlError::Unsupported(
                        "status cannot be changed together with other columns".into(),
                    ));
                }
                return match parse_string(status)?.to_lowercase().as_str() {
                    "cancelled" => Ok(Command::CancelBooking { id }),
                    "reactivated" => Ok(Command::ReactivateBooking { id }),
                    other => Err(SqlError::Parse(format!(
                        "status must be 'cancelled' or 'reactivated', got '{other}'"
                    ))),
                };
            }
            Ok(Command::UpdateBooking {
                id,
                guest_id: parse_ulid(set.require("guest_id")?)?,
                range: DateRange::new(
                    parse_date(set.require("start")?)?,
                    parse_date(set.require("end")?)?,
                ),
            })
        }
        "blocks" => Ok(Command::UpdateBlock {
            id,
            range: DateRange::new(
                parse_date(set.require("start")?)?,
                parse_date(set.require("end")?)?,
            ),
            reason: match set.get("reason") {
                Some(expr) => parse_string_or_null(expr)?,
                None => None,
            },
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "properties" => Ok(Command::DeleteProperty { id }),
        "guests" => Ok(Command::DeleteGuest { id }),
        "bookings" => Ok(Command::DeleteBooking { id }),
        "blocks" => Ok(Command::DeleteBlock { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
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
        "properties" => Ok(Command::SelectProperties),
        "guests" => Ok(Command::SelectGuests),
        "bookings" => Ok(Command::SelectBookings {
            filter: extract_lookup(&select.selection)?,
        }),
        "blocks" => Ok(Command::SelectBlocks {
            filter: extract_lookup(&select.selection)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// No WHERE, `WHERE id = '...'` or `WHERE property_id = '...'`.
fn extract_lookup(selection: &Option<Expr>) -> Result<Lookup, SqlError> {
    if selection.is_none() {
        return Ok(Lookup::All);
    }
    let missing = SqlError::MissingFilter("id or property_id");
    let Some(Expr::BinaryOp {
        left,
        op: ast::BinaryOperator::Eq,
        right,
    }) = selection
    else {
        return Err(missing);
    };
    match expr_column_name(left).as_deref() {
        Some("id") => Ok(Lookup::ById(parse_ulid(right)?)),
        Some("property_id") => Ok(Lookup::ByProperty(parse_ulid(right)?)),
        _ => Err(missing),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn expect_arity(table: &'static str, values: &[Expr], min: usize) -> Result<(), SqlError> {
    if values.len() < min {
        return Err(SqlError::WrongArity(table, min, values.len()));
    }
    Ok(())
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
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid(right),
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

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string(expr).map(Some),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID '{s}': {e}")))
}

/// `'YYYY-MM-DD'`.
fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date '{s}': {e}")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("missing column in SET: {0}")]
    MissingColumn(&'static str),
}
