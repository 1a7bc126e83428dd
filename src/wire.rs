use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::StaybookAuthSource;
use crate::engine::{Engine, EngineError, Reservation};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, BookingFilter, Command, HotelFilter, RoomFilter, SqlError};

pub struct StaybookHandler {
    engine: Arc<Engine>,
    query_parser: Arc<StaybookQueryParser>,
}

impl StaybookHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(StaybookQueryParser),
        }
    }

    /// Parse and run one statement, recording query metrics.
    async fn run(&self, sql: &str) -> PgWireResult<Response> {
        let cmd = match sql::parse_sql(sql) {
            Ok(cmd) => cmd,
            Err(e) => {
                metrics::counter!(QUERIES_TOTAL, "command" => "unparsed", "status" => "error")
                    .increment(1);
                return Err(sql_err(e));
            }
        };

        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertHotel(new) => {
                engine.create_hotel(new).await.map_err(engine_err)?;
                Ok(inserted())
            }
            Command::DeleteHotel { id } => {
                engine.delete_hotel(id).await.map_err(engine_err)?;
                Ok(deleted())
            }
            Command::SelectHotels(filter) => {
                let hotels = match filter {
                    HotelFilter::All => engine.list_hotels(),
                    HotelFilter::Id(id) => engine.get_hotel(&id).into_iter().collect(),
                    HotelFilter::CityContains(city) => engine.search_hotels_by_city(&city),
                    HotelFilter::CityEquals(city) => {
                        let city = city.trim().to_lowercase();
                        engine
                            .list_hotels()
                            .into_iter()
                            .filter(|h| h.city.to_lowercase() == city)
                            .collect()
                    }
                };
                Ok(rows(hotel_schema(), &hotels, encode_hotel))
            }
            Command::InsertRoom(new) => {
                engine.create_room(new).await.map_err(engine_err)?;
                Ok(inserted())
            }
            Command::DeleteRoom { id } => {
                engine.delete_room(id).await.map_err(engine_err)?;
                Ok(deleted())
            }
            Command::SelectRooms(filter) => {
                let rooms = match filter {
                    RoomFilter::Hotel(hotel_id) => engine.list_rooms_for_hotel(&hotel_id).await,
                    RoomFilter::Id(id) => engine.get_room_info(&id).await.into_iter().collect(),
                };
                Ok(rows(room_schema(), &rooms, encode_room))
            }
            Command::SelectAvailability { hotel_id, stay } => {
                let rooms = engine
                    .find_available_rooms(hotel_id, stay)
                    .await
                    .map_err(engine_err)?;
                Ok(rows(room_schema(), &rooms, encode_room))
            }
            Command::InsertReservation(req) => {
                let reservation = engine.reserve(req).await.map_err(engine_err)?;
                Ok(rows(reservation_schema(), &[reservation], encode_reservation))
            }
            Command::InsertPayment { booking_id, method } => {
                let reservation = engine
                    .retry_payment(booking_id, method)
                    .await
                    .map_err(engine_err)?;
                Ok(rows(reservation_schema(), &[reservation], encode_reservation))
            }
            Command::DeleteBooking { id } => {
                engine.cancel_booking(id).await.map_err(engine_err)?;
                Ok(deleted())
            }
            Command::SelectBookings(filter) => {
                let bookings = match filter {
                    BookingFilter::User(user_id) => engine.list_user_bookings(&user_id).await,
                    BookingFilter::Room(room_id) => engine.list_room_bookings(&room_id).await,
                    BookingFilter::Id(id) => engine.get_booking(id).await.into_iter().collect(),
                };
                Ok(rows(booking_schema(), &bookings, encode_booking))
            }
            Command::SelectPayments { booking_id } => {
                let payments = engine.get_payments_for_booking(&booking_id);
                Ok(rows(payment_schema(), &payments, encode_payment))
            }
        }
    }
}

fn inserted() -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(1))
}

fn deleted() -> Response {
    Response::Execution(Tag::new("DELETE").with_rows(1))
}

// ── Result sets ──────────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn hotel_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("city", Type::VARCHAR),
        field("address", Type::VARCHAR),
        field("description", Type::VARCHAR),
        field("rating", Type::FLOAT4),
        field("amenities", Type::VARCHAR),
        field("image_url", Type::VARCHAR),
        field("created_at", Type::INT8),
    ]
}

fn room_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("hotel_id", Type::VARCHAR),
        field("room_number", Type::VARCHAR),
        field("room_type", Type::VARCHAR),
        field("description", Type::VARCHAR),
        field("price_per_night", Type::INT8),
        field("max_occupancy", Type::INT4),
        field("is_available", Type::BOOL),
        field("image_url", Type::VARCHAR),
    ]
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("user_id", Type::VARCHAR),
        field("hotel_id", Type::VARCHAR),
        field("room_id", Type::VARCHAR),
        field("check_in", Type::VARCHAR),
        field("check_out", Type::VARCHAR),
        field("nights", Type::INT4),
        field("total_amount", Type::INT8),
        field("guest_count", Type::INT4),
        field("guest_name", Type::VARCHAR),
        field("guest_email", Type::VARCHAR),
        field("guest_phone", Type::VARCHAR),
        field("special_requests", Type::VARCHAR),
        field("status", Type::VARCHAR),
        field("created_at", Type::INT8),
        field("updated_at", Type::INT8),
    ]
}

fn payment_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("booking_id", Type::VARCHAR),
        field("amount", Type::INT8),
        field("payment_method", Type::VARCHAR),
        field("status", Type::VARCHAR),
        field("transaction_id", Type::VARCHAR),
        field("created_at", Type::INT8),
    ]
}

/// Returned by a reservation or a payment retry that succeeded.
fn reservation_schema() -> Vec<FieldInfo> {
    vec![
        field("booking_id", Type::VARCHAR),
        field("status", Type::VARCHAR),
        field("nights", Type::INT4),
        field("total_amount", Type::INT8),
        field("payment_id", Type::VARCHAR),
        field("payment_status", Type::VARCHAR),
        field("transaction_id", Type::VARCHAR),
    ]
}

fn rows<T>(
    schema: Vec<FieldInfo>,
    items: &[T],
    encode: impl Fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn encode_hotel(e: &mut DataRowEncoder, h: &Hotel) -> PgWireResult<()> {
    e.encode_field(&h.id.to_string())?;
    e.encode_field(&h.name)?;
    e.encode_field(&h.city)?;
    e.encode_field(&h.address)?;
    e.encode_field(&h.description)?;
    e.encode_field(&h.rating)?;
    // JSON array text, so names containing commas survive the round trip.
    let amenities = serde_json::to_string(&h.amenities).map_err(|e| PgWireError::ApiError(Box::new(e)))?;
    e.encode_field(&amenities)?;
    e.encode_field(&h.image_url)?;
    e.encode_field(&h.created_at)
}

fn encode_room(e: &mut DataRowEncoder, r: &Room) -> PgWireResult<()> {
    e.encode_field(&r.id.to_string())?;
    e.encode_field(&r.hotel_id.to_string())?;
    e.encode_field(&r.room_number)?;
    e.encode_field(&r.room_type)?;
    e.encode_field(&r.description)?;
    e.encode_field(&r.price_per_night)?;
    e.encode_field(&(r.max_occupancy as i32))?;
    e.encode_field(&r.is_available)?;
    e.encode_field(&r.image_url)
}

fn encode_booking(e: &mut DataRowEncoder, b: &Booking) -> PgWireResult<()> {
    e.encode_field(&b.id.to_string())?;
    e.encode_field(&b.user_id.to_string())?;
    e.encode_field(&b.hotel_id.to_string())?;
    e.encode_field(&b.room_id.to_string())?;
    e.encode_field(&b.stay.check_in.to_string())?;
    e.encode_field(&b.stay.check_out.to_string())?;
    e.encode_field(&(b.nights as i32))?;
    e.encode_field(&b.total_amount)?;
    e.encode_field(&(b.guest.count as i32))?;
    e.encode_field(&b.guest.name)?;
    e.encode_field(&b.guest.email)?;
    e.encode_field(&b.guest.phone)?;
    e.encode_field(&b.guest.special_requests)?;
    e.encode_field(&b.status.as_str())?;
    e.encode_field(&b.created_at)?;
    e.encode_field(&b.updated_at)
}

fn encode_payment(e: &mut DataRowEncoder, p: &Payment) -> PgWireResult<()> {
    e.encode_field(&p.id.to_string())?;
    e.encode_field(&p.booking_id.to_string())?;
    e.encode_field(&p.amount)?;
    e.encode_field(&p.method.as_str())?;
    e.encode_field(&p.status.as_str())?;
    e.encode_field(&p.transaction_id)?;
    e.encode_field(&p.created_at)
}

fn encode_reservation(e: &mut DataRowEncoder, r: &Reservation) -> PgWireResult<()> {
    e.encode_field(&r.booking.id.to_string())?;
    e.encode_field(&r.booking.status.as_str())?;
    e.encode_field(&(r.booking.nights as i32))?;
    e.encode_field(&r.booking.total_amount)?;
    e.encode_field(&r.payment.id.to_string())?;
    e.encode_field(&r.payment.status.as_str())?;
    e.encode_field(&r.payment.transaction_id)
}

/// Result columns a statement will produce, decided from its text alone since
/// bound parameters are not known at describe time.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let words: Vec<String> = sql
        .split(|c: char| c.is_whitespace() || c == '(' || c == ';')
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect();
    let after = |keyword: &str| {
        words
            .iter()
            .position(|w| w == keyword)
            .and_then(|i| words.get(i + 1))
            .map(String::as_str)
    };

    match words.first().map(String::as_str) {
        Some("select") => match after("from") {
            Some("hotels") => hotel_schema(),
            Some("rooms") | Some("availability") => room_schema(),
            Some("bookings") => booking_schema(),
            Some("payments") => payment_schema(),
            _ => vec![],
        },
        Some("insert") => match after("into") {
            Some("reservations") | Some("payments") => reservation_schema(),
            _ => vec![],
        },
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for StaybookHandler {
    async fn do_query<C>(&self, _client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct StaybookQueryParser;

#[async_trait]
impl QueryParser for StaybookQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for StaybookHandler {
    type Statement = String;
    type QueryParser = StaybookQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.run(&substitute_params(portal)).await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            result_schema(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    let mut max = 0;
    let mut rest = sql;
    while let Some(pos) = rest.find('$') {
        rest = &rest[pos + 1..];
        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        if let Ok(n) = rest[..digits].parse::<usize>() {
            max = max.max(n);
        }
        rest = &rest[digits..];
    }
    max
}

/// Inline bound parameters (text format) as quoted literals.
fn substitute_params(portal: &Portal<String>) -> String {
    inline_params(&portal.statement.statement, &portal.parameters)
}

/// Single pass over the statement: inlined values are never rescanned, and a
/// `$N` inside one of the statement's own quoted literals is left alone.
fn inline_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut in_literal = false;
    let mut rest = sql;
    while let Some(pos) = rest.find(['$', '\'']) {
        out.push_str(&rest[..pos]);
        let marker = rest.as_bytes()[pos];
        rest = &rest[pos + 1..];
        if marker == b'\'' {
            in_literal = !in_literal;
            out.push('\'');
            continue;
        }
        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        let param = match rest[..digits].parse::<usize>() {
            Ok(n) if n >= 1 && !in_literal => params.get(n - 1),
            _ => None,
        };
        match param {
            Some(Some(bytes)) => {
                out.push('\'');
                out.push_str(&String::from_utf8_lossy(bytes.as_ref()).replace('\'', "''"));
                out.push('\'');
            }
            Some(None) => out.push_str("NULL"),
            None => {
                out.push('$');
                out.push_str(&rest[..digits]);
            }
        }
        rest = &rest[digits..];
    }
    out.push_str(rest);
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct StaybookFactory {
    handler: Arc<StaybookHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<StaybookAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl StaybookFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        Self {
            handler: Arc::new(StaybookHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                StaybookAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for StaybookFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    factory: Arc<StaybookFactory>,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::RoomUnavailable { .. } => "23P01",
        e if e.is_validation() => "22023",
        EngineError::NotFound(_) => "P0002",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::InvalidStateTransition { .. } => "55000",
        EngineError::PaymentFailed { .. } => "P0001",
        EngineError::PaymentInProgress(_) => "55006",
        EngineError::HasRooms(_) | EngineError::HasActiveBookings(_) => "23503",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::StoreUnavailable(_) => "58030",
        // Validation variants are matched by the guard above.
        EngineError::InvalidDateRange(_)
        | EngineError::OccupancyExceeded { .. }
        | EngineError::Invalid(_) => "22023",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
