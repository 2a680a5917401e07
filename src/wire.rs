use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{AuthSource, DefaultServerParameterProvider, LoginInfo, Password, StartupHandler};
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

use crate::engine::{DateAvailability, ErrorKind, Ledger, LedgerError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, EntryChange};

pub const SQLSTATE_BUSINESS: &str = "P0001";
pub const SQLSTATE_SETUP: &str = "22023";
pub const SQLSTATE_STORAGE: &str = "58030";
pub const SQLSTATE_RETRY: &str = "40001";
pub const SQLSTATE_SYNTAX: &str = "42601";

// ── Auth ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct LedgerAuthSource {
    password: String,
}

impl LedgerAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for LedgerAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

// ── Handler ──────────────────────────────────────────────────────

pub struct LedgerHandler {
    ledger: Arc<Ledger>,
    query_parser: Arc<LedgerQueryParser>,
    request_timeout: Duration,
}

impl LedgerHandler {
    pub fn new(ledger: Arc<Ledger>, request_timeout: Duration) -> Self {
        Self {
            ledger,
            query_parser: Arc::new(LedgerQueryParser),
            request_timeout,
        }
    }

    /// Parse, run under the request timeout, and record RED metrics.
    async fn run(&self, sql: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let start = Instant::now();

        let result = match tokio::time::timeout(self.request_timeout, self.execute_command(cmd)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!("{label} exceeded {:?}", self.request_timeout);
                metrics::counter!(observability::REQUEST_TIMEOUTS_TOTAL).increment(1);
                Err(timeout_err(self.request_timeout))
            }
        };

        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Response> {
        let ledger = &self.ledger;
        match cmd {
            Command::OpenEntries { entries } => {
                let count = entries.len();
                // Rows before a failing one stay opened.
                for (key, spec) in entries {
                    ledger.open(key, spec).await.map_err(ledger_err)?;
                }
                Ok(Response::Execution(Tag::new("INSERT").with_rows(count)))
            }
            Command::ReserveStay(req) => {
                ledger.reserve_stay(req).await.map_err(ledger_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::ReleaseStay {
                room,
                check_in,
                check_out,
                reservation_id,
            } => {
                let report = ledger
                    .release_stay(room, check_in, check_out, reservation_id)
                    .await
                    .map_err(ledger_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(report.released.len())))
            }
            Command::UpdateEntry { key, change } => {
                match change {
                    EntryChange::TotalCapacity(n) => ledger.adjust_capacity(key, n).await,
                    EntryChange::Block(n) => ledger.block(key, n).await,
                    EntryChange::Unblock(n) => ledger.unblock(key, n).await,
                    EntryChange::Status(status) => ledger.set_status(key, status).await,
                    EntryChange::CloseChannel(channel) => ledger.close_channel(key, channel).await,
                    EntryChange::OpenChannel(channel) => ledger.reopen_channel(key, channel).await,
                    EntryChange::Restrictions(r) => ledger.set_restrictions(key, r).await,
                }
                .map_err(ledger_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::SetRate { key, channel, rate } => {
                ledger.set_rate(key, channel, rate).await.map_err(ledger_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::SelectAvailability {
                room,
                check_in,
                check_out,
                channel,
            } => {
                let dates = ledger
                    .query_availability(room, check_in, check_out, channel)
                    .await
                    .map_err(ledger_err)?;

                let schema = Arc::new(availability_schema());
                let rows: Vec<PgWireResult<_>> = dates
                    .iter()
                    .map(|d| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encode_availability(&mut encoder, d)?;
                        Ok(encoder.take_row())
                    })
                    .collect();

                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
        }
    }
}

fn encode_availability(encoder: &mut DataRowEncoder, d: &DateAvailability) -> PgWireResult<()> {
    let closed: Vec<&str> = d.closed_channels.iter().map(|c| c.as_str()).collect();
    let by_channel = serde_json::Value::Object(
        d.occupied_by_channel
            .iter()
            .map(|(c, n)| (c.as_str().to_string(), serde_json::Value::from(*n)))
            .collect(),
    );

    encoder.encode_field(&d.date.to_string())?;
    encoder.encode_field(&d.status.as_str())?;
    encoder.encode_field(&i64::from(d.total_capacity))?;
    encoder.encode_field(&i64::from(d.blocked_units))?;
    encoder.encode_field(&i64::from(d.occupied_units))?;
    encoder.encode_field(&i64::from(d.available_units))?;
    encoder.encode_field(&d.rate.amount_minor)?;
    encoder.encode_field(&d.rate.currency.as_str())?;
    encoder.encode_field(&i64::from(d.restrictions.min_stay))?;
    encoder.encode_field(&i64::from(d.restrictions.max_stay))?;
    encoder.encode_field(&closed.join(","))?;
    encoder.encode_field(&by_channel.to_string())?;
    encoder.encode_field(&d.bookable)?;
    Ok(())
}

fn availability_schema() -> Vec<FieldInfo> {
    let field = |name: &str, ty: Type| FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text);
    vec![
        field("date", Type::VARCHAR),
        field("status", Type::VARCHAR),
        field("total_capacity", Type::INT8),
        field("blocked_units", Type::INT8),
        field("occupied_units", Type::INT8),
        field("available_units", Type::INT8),
        field("rate", Type::INT8),
        field("currency", Type::VARCHAR),
        field("min_stay", Type::INT8),
        field("max_stay", Type::INT8),
        field("closed_channels", Type::VARCHAR),
        field("occupied_by_channel", Type::VARCHAR),
        field("bookable", Type::BOOL),
    ]
}

fn is_availability_select(sql: &str) -> bool {
    let upper = sql.to_uppercase();
    upper.contains("SELECT") && upper.contains("AVAILABILITY")
}

#[async_trait]
impl SimpleQueryHandler for LedgerHandler {
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
        Ok(vec![self.run(query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct LedgerQueryParser;

#[async_trait]
impl QueryParser for LedgerQueryParser {
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
        if is_availability_select(stmt) {
            Ok(availability_schema())
        } else {
            Ok(vec![])
        }
    }
}

#[async_trait]
impl ExtendedQueryHandler for LedgerHandler {
    type Statement = String;
    type QueryParser = LedgerQueryParser;

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
        self.run(&sql).await
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
        if is_availability_select(&target.statement) {
            Ok(DescribeStatementResponse::new(param_types, availability_schema()))
        } else {
            Ok(DescribeStatementResponse::new(param_types, vec![]))
        }
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
        if is_availability_select(&target.statement.statement) {
            Ok(DescribePortalResponse::new(availability_schema()))
        } else {
            Ok(DescribePortalResponse::new(vec![]))
        }
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i > start
                && let Ok(n) = sql[start..i].parse::<usize>()
            {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
/// Highest index first, so `$1` never matches inside `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    substitute_text(&portal.statement.statement, &portal.parameters)
}

fn substitute_text(sql: &str, params: &[Option<Bytes>]) -> String {
    let mut result = sql.to_string();
    for (i, param) in params.iter().enumerate().rev() {
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

// ── Factory ──────────────────────────────────────────────────────

pub struct LedgerFactory {
    handler: Arc<LedgerHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<LedgerAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl LedgerFactory {
    pub fn new(ledger: Arc<Ledger>, password: String, request_timeout: Duration) -> Self {
        let auth_source = LedgerAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(LedgerHandler::new(ledger, request_timeout)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for LedgerFactory {
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
    ledger: Arc<Ledger>,
    password: String,
    tls: Option<TlsAcceptor>,
    request_timeout: Duration,
) -> std::io::Result<()> {
    let factory = Arc::new(LedgerFactory::new(ledger, password, request_timeout));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Error mapping ────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

pub fn sqlstate(e: &LedgerError) -> &'static str {
    match e.kind() {
        ErrorKind::Business => SQLSTATE_BUSINESS,
        ErrorKind::Setup => SQLSTATE_SETUP,
        ErrorKind::Storage => SQLSTATE_STORAGE,
    }
}

fn ledger_err(e: LedgerError) -> PgWireError {
    if e.kind() == ErrorKind::Storage {
        tracing::error!("{e}");
    }
    user_error(sqlstate(&e), e.to_string())
}

fn timeout_err(after: Duration) -> PgWireError {
    user_error(
        SQLSTATE_RETRY,
        format!("request timed out after {}ms; retry", after.as_millis()),
    )
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    let code = match &e {
        sql::SqlError::Model(_) => SQLSTATE_SETUP,
        _ => SQLSTATE_SYNTAX,
    };
    user_error(code, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::date;
    use ulid::Ulid;

    #[test]
    fn count_params_finds_highest() {
        assert_eq!(count_params("SELECT 1"), 0);
        assert_eq!(count_params("... $1 AND $3 AND $2"), 3);
        assert_eq!(count_params("... $10"), 10);
    }

    #[test]
    fn substitute_quotes_and_nulls() {
        let params = vec![Some(Bytes::from_static(b"O'Brien")), None, Some(Bytes::from_static(b"x"))];
        let sql = substitute_text("VALUES ($1, $2, $3)", &params);
        assert_eq!(sql, "VALUES ('O''Brien', NULL, 'x')");
    }

    #[test]
    fn error_kinds_map_to_sqlstate() {
        let key = EntryKey::new(Ulid::new(), Ulid::new(), date("2025-11-15"));
        assert_eq!(sqlstate(&LedgerError::CapacityExhausted(key)), "P0001");
        assert_eq!(
            sqlstate(&LedgerError::CrossDateReservationFailure { failures: vec![] }),
            "P0001"
        );
        assert_eq!(sqlstate(&LedgerError::DuplicateEntry(key)), "22023");
        assert_eq!(sqlstate(&LedgerError::InvalidCapacity(0)), "22023");
        assert_eq!(sqlstate(&LedgerError::Storage("disk full".into())), "58030");
    }
}
