use chrono::NaiveDate;
use sqlparser::ast::{
    self, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, UnaryOperator, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::engine::{NewHotel, NewRoom, ReserveRequest};
use crate::model::*;

#[derive(Debug, Clone, PartialEq)]
pub enum HotelFilter {
    All,
    Id(Ulid),
    /// `city = '...'`, case-insensitive.
    CityEquals(String),
    /// `city ILIKE '%...%'`, case-insensitive substring.
    CityContains(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomFilter {
    Hotel(Ulid),
    Id(Ulid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookingFilter {
    User(Ulid),
    Room(Ulid),
    Id(Ulid),
}

/// Parsed command from SQL input.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    InsertHotel(NewHotel),
    DeleteHotel { id: Ulid },
    SelectHotels(HotelFilter),
    InsertRoom(NewRoom),
    DeleteRoom { id: Ulid },
    SelectRooms(RoomFilter),
    SelectAvailability { hotel_id: Ulid, stay: Stay },
    InsertReservation(ReserveRequest),
    /// Retry payment for a PENDING booking.
    InsertPayment { booking_id: Ulid, method: PaymentMethod },
    /// Cancel.
    DeleteBooking { id: Ulid },
    SelectBookings(BookingFilter),
    SelectPayments { booking_id: Ulid },
}

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
    #[error("{table}: unknown column {column}")]
    UnknownColumn { table: &'static str, column: String },
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing value for column: {0}")]
    MissingColumn(&'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}

const HOTEL_COLUMNS: &[&str] = &[
    "id", "name", "city", "address", "description", "rating", "image_url", "amenities",
];
const ROOM_COLUMNS: &[&str] = &[
    "id", "hotel_id", "room_number", "room_type", "price_per_night", "max_occupancy",
    "is_available", "description", "image_url",
];
const RESERVATION_COLUMNS: &[&str] = &[
    "id", "user_id", "hotel_id", "room_id", "check_in", "check_out", "guest_count", "guest_name",
    "guest_email", "guest_phone", "payment_method", "special_requests",
];
const PAYMENT_COLUMNS: &[&str] = &["booking_id", "payment_method"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    match table.as_str() {
        "hotels" => {
            let row = Row::new("hotels", HOTEL_COLUMNS, insert)?;
            Ok(Command::InsertHotel(NewHotel {
                id: parse_ulid(row.required("id")?)?,
                name: parse_string(row.required("name")?)?,
                city: parse_string(row.required("city")?)?,
                address: parse_string(row.required("address")?)?,
                description: row.optional("description", parse_string)?,
                rating: row.optional("rating", parse_f32)?.unwrap_or(0.0),
                amenities: row.optional("amenities", parse_string_list)?.unwrap_or_default(),
                image_url: row.optional("image_url", parse_string)?,
                created_by: None,
            }))
        }
        "rooms" => {
            let row = Row::new("rooms", ROOM_COLUMNS, insert)?;
            Ok(Command::InsertRoom(NewRoom {
                id: parse_ulid(row.required("id")?)?,
                hotel_id: parse_ulid(row.required("hotel_id")?)?,
                room_number: parse_string(row.required("room_number")?)?,
                room_type: parse_string(row.required("room_type")?)?,
                description: row.optional("description", parse_string)?,
                price_per_night: parse_i64(row.required("price_per_night")?)?,
                max_occupancy: row.optional("max_occupancy", parse_u32)?.unwrap_or(2),
                image_url: row.optional("image_url", parse_string)?,
                is_available: row.optional("is_available", parse_bool)?.unwrap_or(true),
            }))
        }
        "reservations" => {
            let row = Row::new("reservations", RESERVATION_COLUMNS, insert)?;
            Ok(Command::InsertReservation(ReserveRequest {
                id: parse_ulid(row.required("id")?)?,
                user_id: parse_ulid(row.required("user_id")?)?,
                hotel_id: parse_ulid(row.required("hotel_id")?)?,
                room_id: parse_ulid(row.required("room_id")?)?,
                stay: Stay::new(
                    parse_date(row.required("check_in")?)?,
                    parse_date(row.required("check_out")?)?,
                ),
                guest: GuestInfo {
                    name: parse_string(row.required("guest_name")?)?,
                    email: parse_string(row.required("guest_email")?)?,
                    phone: row.optional("guest_phone", parse_string)?.unwrap_or_default(),
                    count: row.optional("guest_count", parse_u32)?.unwrap_or(1),
                    special_requests: row.optional("special_requests", parse_string)?,
                },
                method: parse_method(row.required("payment_method")?)?,
            }))
        }
        "payments" => {
            let row = Row::new("payments", PAYMENT_COLUMNS, insert)?;
            Ok(Command::InsertPayment {
                booking_id: parse_ulid(row.required("booking_id")?)?,
                method: parse_method(row.required("payment_method")?)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = where_filters(delete.selection.as_ref())?;
    let id = filter_ulid(&filters, "id")?.ok_or(SqlError::MissingFilter("id"))?;

    match table.as_str() {
        "hotels" => Ok(Command::DeleteHotel { id }),
        "rooms" => Ok(Command::DeleteRoom { id }),
        "bookings" => Ok(Command::DeleteBooking { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let SetExpr::Select(select) = query.body.as_ref() else {
        return Err(SqlError::Unsupported("non-SELECT query".into()));
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let filters = where_filters(select.selection.as_ref())?;

    match table.as_str() {
        "hotels" => {
            if let Some(id) = filter_ulid(&filters, "id")? {
                return Ok(Command::SelectHotels(HotelFilter::Id(id)));
            }
            let filter = match find_filter(&filters, "city") {
                None => HotelFilter::All,
                Some(f) => {
                    let city = parse_string(f.value)?;
                    match f.op {
                        FilterOp::Eq => HotelFilter::CityEquals(city),
                        FilterOp::Like => {
                            HotelFilter::CityContains(city.trim_matches('%').to_string())
                        }
                    }
                }
            };
            Ok(Command::SelectHotels(filter))
        }
        "rooms" => {
            if let Some(id) = filter_ulid(&filters, "id")? {
                return Ok(Command::SelectRooms(RoomFilter::Id(id)));
            }
            let hotel_id =
                filter_ulid(&filters, "hotel_id")?.ok_or(SqlError::MissingFilter("hotel_id"))?;
            Ok(Command::SelectRooms(RoomFilter::Hotel(hotel_id)))
        }
        "availability" => {
            let hotel_id =
                filter_ulid(&filters, "hotel_id")?.ok_or(SqlError::MissingFilter("hotel_id"))?;
            let check_in = find_filter(&filters, "check_in").ok_or(SqlError::MissingFilter("check_in"))?;
            let check_out =
                find_filter(&filters, "check_out").ok_or(SqlError::MissingFilter("check_out"))?;
            Ok(Command::SelectAvailability {
                hotel_id,
                stay: Stay::new(parse_date(check_in.value)?, parse_date(check_out.value)?),
            })
        }
        "bookings" => {
            let filter = if let Some(id) = filter_ulid(&filters, "id")? {
                BookingFilter::Id(id)
            } else if let Some(user) = filter_ulid(&filters, "user_id")? {
                BookingFilter::User(user)
            } else if let Some(room) = filter_ulid(&filters, "room_id")? {
                BookingFilter::Room(room)
            } else {
                return Err(SqlError::MissingFilter("user_id"));
            };
            Ok(Command::SelectBookings(filter))
        }
        "payments" => {
            let booking_id = filter_ulid(&filters, "booking_id")?
                .ok_or(SqlError::MissingFilter("booking_id"))?;
            Ok(Command::SelectPayments { booking_id })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── INSERT rows ───────────────────────────────────────────────

/// One VALUES row keyed by column name. Without a column list the values are
/// taken in the table's declared order.
struct Row<'a> {
    table: &'static str,
    columns: Vec<String>,
    values: &'a [Expr],
}

impl<'a> Row<'a> {
    fn new(
        table: &'static str,
        declared: &[&str],
        insert: &'a ast::Insert,
    ) -> Result<Self, SqlError> {
        let values = first_values_row(insert)?;
        let columns: Vec<String> = if insert.columns.is_empty() {
            declared.iter().take(values.len()).map(|c| c.to_string()).collect()
        } else {
            insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
        };
        if columns.len() != values.len() {
            return Err(SqlError::WrongArity(table, columns.len(), values.len()));
        }
        if let Some(unknown) = columns.iter().find(|c| !declared.contains(&c.as_str())) {
            return Err(SqlError::UnknownColumn {
                table,
                column: unknown.clone(),
            });
        }
        Ok(Self {
            table,
            columns,
            values,
        })
    }

    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|i| &self.values[i])
    }

    fn required(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        match self.get(column) {
            Some(expr) if !is_null(expr) => Ok(expr),
            _ => Err(SqlError::MissingColumn(column)),
        }
    }

    /// Absent and NULL both read as `None`.
    fn optional<T>(
        &self,
        column: &str,
        parse: impl FnOnce(&Expr) -> Result<T, SqlError>,
    ) -> Result<Option<T>, SqlError> {
        match self.get(column) {
            None => Ok(None),
            Some(expr) if is_null(expr) => Ok(None),
            Some(expr) => parse(expr)
                .map(Some)
                .map_err(|e| SqlError::Parse(format!("{}.{column}: {e}", self.table))),
        }
    }
}

fn first_values_row(insert: &ast::Insert) -> Result<&[Expr], SqlError> {
    let source = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match source.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [row] => Ok(row),
            [] => Err(SqlError::Parse("empty VALUES".into())),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

// ── WHERE filters ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterOp {
    Eq,
    Like,
}

struct Filter<'a> {
    column: String,
    op: FilterOp,
    value: &'a Expr,
}

/// Flatten a conjunction of `col = value` and `col [I]LIKE pattern` terms.
fn where_filters(selection: Option<&Expr>) -> Result<Vec<Filter<'_>>, SqlError> {
    let mut out = Vec::new();
    if let Some(expr) = selection {
        collect_filters(expr, &mut out)?;
    }
    Ok(out)
}

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
        Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.push(Filter {
                column,
                op: FilterOp::Eq,
                value: right,
            });
            Ok(())
        }
        Expr::ILike {
            negated: false,
            expr,
            pattern,
            ..
        }
        | Expr::Like {
            negated: false,
            expr,
            pattern,
            ..
        } => {
            let column = expr_column_name(expr)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {expr}")))?;
            out.push(Filter {
                column,
                op: FilterOp::Like,
                value: pattern,
            });
            Ok(())
        }
        Expr::Nested(inner) => collect_filters(inner, out),
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

fn find_filter<'f, 'a>(filters: &'f [Filter<'a>], column: &str) -> Option<&'f Filter<'a>> {
    filters.iter().find(|f| f.column == column)
}

fn filter_ulid(filters: &[Filter<'_>], column: &str) -> Result<Option<Ulid>, SqlError> {
    match find_filter(filters, column) {
        Some(f) if f.op == FilterOp::Eq => parse_ulid(f.value).map(Some),
        Some(_) => Err(SqlError::Unsupported(format!("LIKE on {column}"))),
        None => Ok(None),
    }
}

// ── Names ─────────────────────────────────────────────────────

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
    let (FromTable::WithFromKeyword(tables) | FromTable::WithoutKeyword(tables)) = &delete.from;
    match tables.first() {
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

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

// ── Values ────────────────────────────────────────────────────

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(Value::Number(n, _)) => Ok(n.clone()),
        _ => Err(SqlError::Parse(format!("expected string, got {expr}"))),
    }
}

/// `ARRAY['a', 'b']`, a JSON array string `'["a", "b"]'`, or `'a, b'`.
fn parse_string_list(expr: &Expr) -> Result<Vec<String>, SqlError> {
    if let Expr::Array(array) = expr {
        return array.elem.iter().map(parse_string).collect();
    }
    let raw = parse_string(expr)?;
    if raw.trim_start().starts_with('[') {
        return serde_json::from_str(&raw)
            .map_err(|e| SqlError::Parse(format!("bad JSON list {raw:?}: {e}")));
    }
    Ok(raw
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect())
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}")))
}

fn parse_method(expr: &Expr) -> Result<PaymentMethod, SqlError> {
    let s = parse_string(expr)?;
    PaymentMethod::parse(&s).ok_or_else(|| SqlError::Parse(format!("unknown payment method {s:?}")))
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: UnaryOperator::Minus,
        expr,
    } = expr
    {
        return parse_i64(expr).map(|v| -v);
    }
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s
            .trim()
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
        _ => Err(SqlError::Parse(format!("expected number, got {expr}"))),
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_f32(expr: &Expr) -> Result<f32, SqlError> {
    if let Expr::UnaryOp {
        op: UnaryOperator::Minus,
        expr,
    } = expr
    {
        return parse_f32(expr).map(|v| -v);
    }
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s
            .trim()
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad number {s:?}: {e}"))),
        _ => Err(SqlError::Parse(format!("expected number, got {expr}"))),
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
        _ => Err(SqlError::Parse(format!("expected bool, got {expr}"))),
    }
}
