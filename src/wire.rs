use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{
    AuthSource, DefaultServerParameterProvider, LoginInfo, Password, StartupHandler,
};
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
use pgwire::messages::data::DataRow;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::engine::{format_time_of_day, Engine, EngineError};
use crate::model::*;
use crate::observability::{self, command_label};
use crate::sql::{self, BookingFilter, Command};

pub struct SlotbookHandler {
    engine: Arc<Engine>,
    query_parser: Arc<SlotbookQueryParser>,
}

impl SlotbookHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(SlotbookQueryParser),
        }
    }

    /// Run one command, recording RED metrics under its label.
    async fn run(&self, cmd: Command) -> PgWireResult<Vec<Response>> {
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Vec<Response>> {
        let engine = &self.engine;
        match cmd {
            Command::InsertVenue { venue } => {
                engine.register_venue(venue).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeleteVenue { id } => {
                engine.remove_venue(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectVenues { id } => {
                let venues = match id {
                    Some(id) => vec![engine.get_venue(&id).map_err(engine_err)?],
                    None => engine.list_venues(),
                };
                let schema = Arc::new(venue_schema());
                let rows: Vec<PgWireResult<_>> = venues
                    .iter()
                    .map(|v| encode_venue(&schema, v))
                    .collect();
                Ok(vec![query_response(schema, rows)])
            }
            Command::SelectAvailability { venue_id, date } => {
                let free = engine
                    .check_availability(venue_id, date)
                    .await
                    .map_err(engine_err)?;

                let schema = Arc::new(availability_schema());
                let vid_str = venue_id.to_string();
                let date_str = date.to_string();
                let rows: Vec<PgWireResult<_>> = free
                    .into_iter()
                    .map(|range| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&vid_str)?;
                        encoder.encode_field(&date_str)?;
                        encoder.encode_field(&format_time_of_day(range.start))?;
                        encoder.encode_field(&format_time_of_day(range.end))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![query_response(schema, rows)])
            }
            Command::SelectSlots { venue_id, date } => {
                let slots = engine.list_slots(venue_id, date).await.map_err(engine_err)?;

                let schema = Arc::new(slots_schema());
                let vid_str = venue_id.to_string();
                let date_str = date.to_string();
                let rows: Vec<PgWireResult<_>> = slots
                    .into_iter()
                    .map(|slot| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&slot.id.to_string())?;
                        encoder.encode_field(&vid_str)?;
                        encoder.encode_field(&date_str)?;
                        encoder.encode_field(&format_time_of_day(slot.range.start))?;
                        encoder.encode_field(&format_time_of_day(slot.range.end))?;
                        encoder.encode_field(&slot.status.as_str().to_string())?;
                        encoder.encode_field(&slot.booking_id.map(|b| b.to_string()))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![query_response(schema, rows)])
            }
            Command::InsertBooking { request, returning } => {
                let receipt = engine.book_slot(request).await.map_err(engine_err)?;
                if !returning {
                    return Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))]);
                }
                let schema = Arc::new(receipt_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&receipt.booking_id.to_string())?;
                encoder.encode_field(&amount_i64(receipt.amount)?)?;
                Ok(vec![query_response(schema, vec![Ok(encoder.take_row())])])
            }
            Command::SelectBookings { filter } => {
                let bookings = match filter {
                    BookingFilter::Id(id) => match engine.get_booking(id).await {
                        Ok(b) => vec![b],
                        Err(EngineError::BookingNotFound(_)) => Vec::new(),
                        Err(e) => return Err(engine_err(e)),
                    },
                    BookingFilter::Customer(customer) => {
                        engine.list_bookings(customer).await.map_err(engine_err)?
                    }
                };
                let schema = Arc::new(bookings_schema());
                let rows: Vec<PgWireResult<_>> = bookings
                    .iter()
                    .map(|b| encode_booking(&schema, b))
                    .collect();
                Ok(vec![query_response(schema, rows)])
            }
            Command::DeleteBooking { id } => {
                engine.cancel_booking(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
        }
    }
}

fn query_response(schema: Arc<Vec<FieldInfo>>, rows: Vec<PgWireResult<DataRow>>) -> Response {
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn amount_i64(amount: u64) -> PgWireResult<i64> {
    i64::try_from(amount)
        .map_err(|_| engine_err(EngineError::LimitExceeded("booking amount overflows")))
}

fn encode_venue(schema: &Arc<Vec<FieldInfo>>, venue: &Venue) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&venue.id.to_string())?;
    encoder.encode_field(&venue.name)?;
    encoder.encode_field(&format_time_of_day(venue.opening))?;
    encoder.encode_field(&format_time_of_day(venue.closing))?;
    encoder.encode_field(&amount_i64(venue.rate_per_hour)?)?;
    let games: Vec<&str> = venue.games.iter().map(String::as_str).collect();
    encoder.encode_field(&games.join(","))?;
    Ok(encoder.take_row())
}

fn encode_booking(schema: &Arc<Vec<FieldInfo>>, booking: &Booking) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&booking.id.to_string())?;
    encoder.encode_field(&booking.customer_id.to_string())?;
    encoder.encode_field(&booking.venue_id.to_string())?;
    encoder.encode_field(&booking.date.to_string())?;
    encoder.encode_field(&format_time_of_day(booking.range.start))?;
    encoder.encode_field(&format_time_of_day(booking.range.end))?;
    encoder.encode_field(&booking.game)?;
    encoder.encode_field(&amount_i64(booking.amount)?)?;
    encoder.encode_field(&booking.booked_at.to_rfc3339())?;
    Ok(encoder.take_row())
}

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn venue_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("name"),
        text_field("opening"),
        text_field("closing"),
        int_field("rate"),
        text_field("games"),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        text_field("venue_id"),
        text_field("date"),
        text_field("start"),
        text_field("end"),
    ]
}

fn slots_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("venue_id"),
        text_field("date"),
        text_field("start"),
        text_field("end"),
        text_field("status"),
        text_field("booking_id"),
    ]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("customer_id"),
        text_field("venue_id"),
        text_field("date"),
        text_field("start"),
        text_field("end"),
        text_field("game"),
        int_field("amount"),
        text_field("booked_at"),
    ]
}

fn receipt_schema() -> Vec<FieldInfo> {
    vec![text_field("id"), int_field("amount")]
}

/// Result columns for a statement, judged from its text alone so that
/// unbound `$N` placeholders do not matter.
fn result_schema(stmt: &str) -> Vec<FieldInfo> {
    let upper = stmt.to_uppercase();
    let words: Vec<&str> = upper.split_whitespace().collect();
    let from = words
        .iter()
        .position(|w| *w == "FROM")
        .and_then(|i| words.get(i + 1))
        .map(|t| t.trim_end_matches(';'));
    match words.first().copied() {
        Some("SELECT") => match from {
            Some("VENUES") => venue_schema(),
            Some("AVAILABILITY") => availability_schema(),
            Some("SLOTS") => slots_schema(),
            Some("BOOKINGS") => bookings_schema(),
            _ => vec![],
        },
        Some("INSERT") if words.contains(&"RETURNING") => receipt_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for SlotbookHandler {
    async fn do_query<C>(
        &self,
        _client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        self.run(cmd).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotbookQueryParser;

#[async_trait]
impl QueryParser for SlotbookQueryParser {
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
impl ExtendedQueryHandler for SlotbookHandler {
    type Statement = String;
    type QueryParser = SlotbookQueryParser;

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
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        let mut responses = self.run(cmd).await?;
        Ok(responses.remove(0))
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

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
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

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
/// Replaced from the highest index down so `$1` never clobbers `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Auth ─────────────────────────────────────────────────────────

/// Every user authenticates with the one configured password.
#[derive(Debug)]
pub struct SharedPasswordSource {
    password: String,
}

impl SharedPasswordSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for SharedPasswordSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

// ── Factory ──────────────────────────────────────────────────────

type PasswordStartup =
    CleartextPasswordAuthStartupHandler<SharedPasswordSource, DefaultServerParameterProvider>;

pub struct SlotbookFactory {
    handler: Arc<SlotbookHandler>,
    auth_handler: Arc<PasswordStartup>,
    noop: Arc<NoopHandler>,
}

impl SlotbookFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        let auth_source = SharedPasswordSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SlotbookHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotbookFactory {
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

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = SlotbookFactory::new(engine, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        e.sqlstate().into(),
        e.to_string(),
    )))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    if let crate::sql::SqlError::Engine(e) = e {
        return engine_err(e);
    }
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
