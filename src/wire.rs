use std::fmt::Debug;
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

use crate::auth::VacancyAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, Lookup, SqlError};

pub struct VacancyHandler {
    engine: Arc<Engine>,
    query_parser: Arc<VacancyQueryParser>,
}

fn done(tag: &str) -> Vec<Response> {
    vec![Response::Execution(Tag::new(tag).with_rows(1))]
}

impl VacancyHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(VacancyQueryParser),
        }
    }

    /// Parse, run and record metrics for one statement.
    async fn run(&self, query: &str) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result.map_err(engine_err)
    }

    async fn execute_command(&self, cmd: Command) -> Result<Vec<Response>, EngineError> {
        let engine = &self.engine;
        match cmd {
            Command::InsertProperty { id, name, kind } => {
                engine.create_property(id, name, kind).await?;
                Ok(done("INSERT"))
            }
            Command::UpdateProperty { id, name, kind } => {
                engine.update_property(id, name, kind).await?;
                Ok(done("UPDATE"))
            }
            Command::DeleteProperty { id } => {
                engine.delete_property(id).await?;
                Ok(done("DELETE"))
            }
            Command::InsertGuest { id, name, email } => {
                engine.create_guest(id, name, email).await?;
                Ok(done("INSERT"))
            }
            Command::UpdateGuest { id, name, email } => {
                engine.update_guest(id, name, email).await?;
                Ok(done("UPDATE"))
            }
            Command::DeleteGuest { id } => {
                engine.delete_guest(id).await?;
                Ok(done("DELETE"))
            }
            Command::InsertBooking {
                id,
                property_id,
                guest_id,
                range,
            } => {
                engine.create_booking(id, property_id, guest_id, range).await?;
                Ok(done("INSERT"))
            }
            Command::UpdateBooking { id, guest_id, range } => {
                engine.update_booking(id, guest_id, range).await?;
                Ok(done("UPDATE"))
            }
            Command::CancelBooking { id } => {
                engine.cancel_booking(id).await?;
                Ok(done("UPDATE"))
            }
            Command::ReactivateBooking { id } => {
                engine.reactivate_booking(id).await?;
                Ok(done("UPDATE"))
            }
            Command::DeleteBooking { id } => {
                engine.delete_booking(id).await?;
                Ok(done("DELETE"))
            }
            Command::InsertBlock {
                id,
                property_id,
                range,
                reason,
            } => {
                engine.create_block(id, property_id, range, reason).await?;
                Ok(done("INSERT"))
            }
            Command::UpdateBlock { id, range, reason } => {
                engine.update_block(id, range, reason).await?;
                Ok(done("UPDATE"))
            }
            Command::DeleteBlock { id } => {
                engine.delete_block(id).await?;
                Ok(done("DELETE"))
            }
            Command::SelectProperties => {
                let rows = engine.list_properties().await;
                Ok(vec![property_rows(rows)])
            }
            Command::SelectGuests => {
                let rows = engine.list_guests().await;
                Ok(vec![guest_rows(rows)])
            }
            Command::SelectBookings { filter } => {
                let rows = match filter {
                    Lookup::All => engine.list_all_bookings().await,
                    Lookup::ById(id) => vec![engine.get_booking(id).await?],
                    Lookup::ByProperty(pid) => engine.list_bookings(pid).await?,
                };
                Ok(vec![booking_rows(rows)])
            }
            Command::SelectBlocks { filter } => {
                let rows = match filter {
                    Lookup::All => engine.list_all_blocks().await,
                    Lookup::ById(id) => vec![engine.get_block(id).await?],
                    Lookup::ByProperty(pid) => engine.list_blocks(pid).await?,
                };
                Ok(vec![block_rows(rows)])
            }
        }
    }
}

// ── Row encoding ─────────────────────────────────────────────────

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn property_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("name", Type::VARCHAR),
        text_field("kind", Type::VARCHAR),
    ]
}

fn guest_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("name", Type::VARCHAR),
        text_field("email", Type::VARCHAR),
    ]
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("property_id", Type::VARCHAR),
        text_field("guest_id", Type::VARCHAR),
        text_field("start", Type::VARCHAR),
        text_field("end", Type::VARCHAR),
        text_field("nights", Type::INT8),
        text_field("status", Type::VARCHAR),
    ]
}

fn block_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("property_id", Type::VARCHAR),
        text_field("start", Type::VARCHAR),
        text_field("end", Type::VARCHAR),
        text_field("reason", Type::VARCHAR),
    ]
}

/// Build a query response by running `encode` over each record.
fn rows<T, F>(schema: Vec<FieldInfo>, records: Vec<T>, encode: F) -> Response
where
    F: Fn(&mut DataRowEncoder, T) -> PgWireResult<()>,
{
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = records
        .into_iter()
        .map(|record| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, record)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn property_rows(records: Vec<PropertyInfo>) -> Response {
    rows(property_schema(), records, |enc, p| {
        enc.encode_field(&p.id.to_string())?;
        enc.encode_field(&p.name)?;
        enc.encode_field(&p.kind)
    })
}

fn guest_rows(records: Vec<GuestInfo>) -> Response {
    rows(guest_schema(), records, |enc, g| {
        enc.encode_field(&g.id.to_string())?;
        enc.encode_field(&g.name)?;
        enc.encode_field(&g.email)
    })
}

fn booking_rows(records: Vec<BookingInfo>) -> Response {
    rows(booking_schema(), records, |enc, b| {
        enc.encode_field(&b.id.to_string())?;
        enc.encode_field(&b.property_id.to_string())?;
        enc.encode_field(&b.guest_id.to_string())?;
        enc.encode_field(&b.range.start.to_string())?;
        enc.encode_field(&b.range.end.to_string())?;
        enc.encode_field(&b.range.nights())?;
        enc.encode_field(&b.status.to_string())
    })
}

fn block_rows(records: Vec<BlockInfo>) -> Response {
    rows(block_schema(), records, |enc, b| {
        enc.encode_field(&b.id.to_string())?;
        enc.encode_field(&b.property_id.to_string())?;
        enc.encode_field(&b.range.start.to_string())?;
        enc.encode_field(&b.range.end.to_string())?;
        enc.encode_field(&b.reason)
    })
}

/// Result columns for a statement, judged from its text before parameters are bound.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.trim_start().to_uppercase();
    if !upper.starts_with("SELECT") {
        return vec![];
    }
    if upper.contains("BOOKINGS") {
        booking_schema()
    } else if upper.contains("BLOCKS") {
        block_schema()
    } else if upper.contains("GUESTS") {
        guest_schema()
    } else if upper.contains("PROPERTIES") {
        property_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for VacancyHandler {
    async fn do_query<C>(&self, _client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.run(query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct VacancyQueryParser;

#[async_trait]
impl QueryParser for VacancyQueryParser {
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
impl ExtendedQueryHandler for VacancyHandler {
    type Statement = String;
    type QueryParser = VacancyQueryParser;

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
        self.run(&sql)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                PgWireError::UserError(Box::new(ErrorInfo::new(
                    "ERROR".into(),
                    "XX000".into(),
                    "statement produced no response".into(),
                )))
            })
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

/// Byte spans and numbers of the `$N` placeholders that sit outside quoted
/// literals and quoted identifiers.
fn placeholders(sql: &str) -> Vec<(usize, usize, usize)> {
    let bytes = sql.as_bytes();
    let mut out = Vec::new();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            // A doubled quote closes and reopens, which leaves us inside.
            Some(q) => {
                if b == q {
                    quote = None;
                }
                i += 1;
            }
            None if b == b'\'' || b == b'"' => {
                quote = Some(b);
                i += 1;
            }
            None if b == b'$' => {
                let start = i;
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if let Ok(n) = sql[start + 1..i].parse::<usize>() {
                    out.push((start, i, n));
                }
            }
            None => i += 1,
        }
    }
    out
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    placeholders(sql).iter().map(|&(_, _, n)| n).max().unwrap_or(0)
}

/// Replace each `$N` with the N-th bound value as a quoted literal, in one pass,
/// so bound text is never scanned again.
fn bind_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut copied = 0;
    for (start, end, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|i| params.get(i)) else {
            continue;
        };
        out.push_str(&sql[copied..start]);
        match param {
            Some(bytes) => {
                out.push('\'');
                out.push_str(&String::from_utf8_lossy(bytes.as_ref()).replace('\'', "''"));
                out.push('\'');
            }
            None => out.push_str("NULL"),
        }
        copied = end;
    }
    out.push_str(&sql[copied..]);
    out
}

fn substitute_params(portal: &Portal<String>) -> String {
    bind_params(&portal.statement.statement, &portal.parameters)
}

// ── Factory ──────────────────────────────────────────────────────

pub struct VacancyFactory {
    handler: Arc<VacancyHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<VacancyAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl VacancyFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        Self {
            handler: Arc::new(VacancyHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                VacancyAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for VacancyFactory {
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
    let factory = VacancyFactory::new(engine, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

/// SQLSTATE for each engine failure.
pub fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::PropertyNotFound(_)
        | EngineError::BookingNotFound(_)
        | EngineError::BlockNotFound(_)
        | EngineError::GuestNotFound(_) => "P0002",
        EngineError::DateAlreadyReserved(_) => "23P01",
        EngineError::InvalidDateRange { .. } => "22008",
        EngineError::InvalidLifecycleTransition { .. } => "55000",
        EngineError::LockTimeout(_) => "55P03",
        EngineError::HasReservations(_) | EngineError::GuestInUse(_) => "23503",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "XX000",
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Conflict;
    use ulid::Ulid;

    #[test]
    fn count_params_finds_highest() {
        assert_eq!(count_params("SELECT * FROM guests"), 0);
        assert_eq!(
            count_params("UPDATE bookings SET guest_id = $2, start = $3, \"end\" = $4 WHERE id = $1"),
            4
        );
        assert_eq!(count_params("SELECT $10, $2"), 10);
        assert_eq!(count_params("SELECT * FROM guests WHERE name = 'cost $9' AND id = $1"), 1);
    }

    fn bind(sql: &str, params: &[Option<&str>]) -> String {
        let params: Vec<Option<&[u8]>> = params.iter().map(|p| p.map(str::as_bytes)).collect();
        bind_params(sql, &params)
    }

    #[test]
    fn bound_values_are_not_rescanned() {
        let sql = "INSERT INTO guests (id, name, email) VALUES ($1, $2, $3)";
        assert_eq!(
            bind(sql, &[Some("G1"), Some("Room $1 guest"), Some("a@example.com")]),
            "INSERT INTO guests (id, name, email) VALUES ('G1', 'Room $1 guest', 'a@example.com')"
        );
    }

    #[test]
    fn bound_quotes_stay_inside_literal() {
        let sql = "UPDATE guests SET name = $2, email = $3 WHERE id = $1";
        let id = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
        let bound = bind(sql, &[Some(id), Some("x', email = 'hijack"), Some("o'neil@example.com")]);
        assert_eq!(
            bound,
            format!(
                "UPDATE guests SET name = 'x'', email = ''hijack', email = 'o''neil@example.com' WHERE id = '{id}'"
            )
        );
        assert!(matches!(
            sql::parse_sql(&bound),
            Ok(Command::UpdateGuest { name, email, .. })
                if name == "x', email = 'hijack" && email == "o'neil@example.com"
        ));
    }

    #[test]
    fn placeholders_inside_literals_and_unbound_left_alone() {
        assert_eq!(
            bind("SELECT '$1', \"$2\", $1, $3", &[Some("a"), Some("b")]),
            "SELECT '$1', \"$2\", 'a', $3"
        );
        assert_eq!(bind("VALUES ($1, $10)", &[None]), "VALUES (NULL, $10)");
    }

    #[test]
    fn result_schema_by_table() {
        assert_eq!(result_schema("SELECT * FROM bookings WHERE property_id = $1").len(), 7);
        assert_eq!(result_schema("select * from blocks where id = $1").len(), 5);
        assert_eq!(result_schema("SELECT * FROM guests").len(), 3);
        assert_eq!(result_schema("SELECT * FROM properties").len(), 3);
        assert!(result_schema("DELETE FROM bookings WHERE id = $1").is_empty());
    }

    #[test]
    fn sqlstate_mapping() {
        let id = Ulid::new();
        assert_eq!(sqlstate(&EngineError::BookingNotFound(id)), "P0002");
        assert_eq!(
            sqlstate(&EngineError::DateAlreadyReserved(Conflict::Blocked(id))),
            "23P01"
        );
        assert_eq!(sqlstate(&EngineError::LockTimeout(id)), "55P03");
        assert_eq!(sqlstate(&EngineError::GuestInUse(id)), "23503");
        assert_eq!(sqlstate(&EngineError::AlreadyExists(id)), "23505");
    }
}
