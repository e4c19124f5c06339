use std::fmt::Debug;
use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{AuthSource, DefaultServerParameterProvider, LoginInfo, Password, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldInfo, QueryResponse,
    Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::engine::{now_ms, Engine, EngineError, StoreError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, SqlError};
use crate::tenant::TenantManager;

// ── Auth ─────────────────────────────────────────────────────────

/// One shared cleartext password for every user and tenant.
#[derive(Debug)]
pub struct FeaturedAuthSource {
    password: String,
}

impl FeaturedAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for FeaturedAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

// ── Handler ──────────────────────────────────────────────────────

pub struct FeaturedHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<FeaturedQueryParser>,
}

impl FeaturedHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(FeaturedQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("tenant error: {e}"),
            )))
        })
    }

    /// Execute with RED metrics recorded per command.
    async fn run(
        &self,
        engine: &Engine,
        cmd: Command,
        format: &Format,
    ) -> PgWireResult<Vec<Response>> {
        let label = observability::command_label(&cmd);
        let start = Instant::now();
        let result = self.execute_command(engine, cmd, format).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        cmd: Command,
        format: &Format,
    ) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::InsertSlot { slot, returning } => {
                let outcome = engine.add(slot).await.map_err(engine_err)?;
                if returning {
                    let schema = Arc::new(id_schema(format));
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&outcome.id.to_string())?;
                    let rows = vec![Ok(encoder.take_row())];
                    Ok(vec![Response::Query(QueryResponse::new(
                        schema,
                        stream::iter(rows),
                    ))])
                } else {
                    Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
                }
            }
            Command::UpdateSlot { id, patch } => {
                engine.update(id, patch).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteSlot { id } => {
                engine.remove(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectSlots { id: Some(id) } => {
                // Missing id is an empty result, not an error.
                let slots: Vec<_> = engine.get_slot(id).await.ok().into_iter().collect();
                Ok(vec![slot_rows(slots, format)])
            }
            Command::SelectSlots { id: None } => {
                Ok(vec![slot_rows(engine.list_slots().await, format)])
            }
            Command::SelectFeatured { at } => {
                let slots = engine.featured_at(at.unwrap_or_else(now_ms)).await;
                Ok(vec![slot_rows(slots, format)])
            }
        }
    }
}

fn slot_schema(format: &Format) -> Vec<FieldInfo> {
    let columns = [
        ("id", Type::VARCHAR),
        ("event_id", Type::VARCHAR),
        ("rank", Type::INT4),
        ("is_active", Type::BOOL),
        ("starts_at", Type::INT8),
        ("ends_at", Type::INT8),
        ("created_at", Type::INT8),
        ("updated_at", Type::INT8),
    ];
    columns
        .into_iter()
        .enumerate()
        .map(|(idx, (name, ty))| FieldInfo::new(name.into(), None, None, ty, format.format_for(idx)))
        .collect()
}

fn id_schema(format: &Format) -> Vec<FieldInfo> {
    vec![FieldInfo::new(
        "id".into(),
        None,
        None,
        Type::VARCHAR,
        format.format_for(0),
    )]
}

fn slot_rows(slots: Vec<FeaturedSlot>, format: &Format) -> Response {
    let schema = Arc::new(slot_schema(format));
    let rows: Vec<PgWireResult<_>> = slots
        .into_iter()
        .map(|slot| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&slot.id.to_string())?;
            encoder.encode_field(&slot.event_id)?;
            encoder.encode_field(&slot.rank)?;
            encoder.encode_field(&slot.is_active)?;
            encoder.encode_field(&slot.window.starts_at)?;
            encoder.encode_field(&slot.window.ends_at)?;
            encoder.encode_field(&slot.created_at)?;
            encoder.encode_field(&slot.updated_at)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

/// Result columns of a statement, judged from its text.
fn describe_schema(sql: &str, format: &Format) -> Vec<FieldInfo> {
    let upper = sql.trim_start().to_uppercase();
    if upper.starts_with("SELECT") {
        slot_schema(format)
    } else if upper.starts_with("INSERT") && upper.contains("RETURNING") {
        id_schema(format)
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for FeaturedHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let commands = sql::parse_batch(query).map_err(sql_err)?;
        let mut responses = Vec::with_capacity(commands.len());
        for cmd in commands {
            match self.run(&engine, cmd, &Format::UnifiedText).await {
                Ok(mut out) => responses.append(&mut out),
                // Statements before the failure stay committed; the rest never run.
                Err(PgWireError::UserError(info)) => {
                    responses.push(Response::Error(info));
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(responses)
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct FeaturedQueryParser;

#[async_trait]
impl QueryParser for FeaturedQueryParser {
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
        column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(describe_schema(stmt, column_format.unwrap_or(&Format::UnifiedText)))
    }
}

#[async_trait]
impl ExtendedQueryHandler for FeaturedHandler {
    type Statement = String;
    type QueryParser = FeaturedQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        let mut responses = self
            .run(&engine, cmd, &portal.result_column_format)
            .await?;
        responses
            .pop()
            .ok_or_else(|| PgWireError::ApiError("statement produced no response".into()))
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
            describe_schema(&target.statement, &Format::UnifiedText),
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
        Ok(DescribePortalResponse::new(describe_schema(
            &target.statement.statement,
            &target.result_column_format,
        )))
    }
}

/// Byte ranges and 1-based indices of the `$N` placeholders outside
/// quoted literals and identifiers.
fn placeholders(sql: &str) -> Vec<(Range<usize>, usize)> {
    let mut found = Vec::new();
    let mut quote = None;
    let mut chars = sql.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '$') => {
                let mut end = i + 1;
                while let Some((j, _)) = chars.next_if(|(_, d)| d.is_ascii_digit()) {
                    end = j + 1;
                }
                if let Ok(n) = sql[i + 1..end].parse::<usize>() {
                    found.push((i..end, n));
                }
            }
            (None, _) => {}
        }
    }
    found
}

/// Highest `$N` placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, n)| n).max().unwrap_or(0)
}

/// Replace each placeholder once with its bound value as a quoted literal.
/// Bound text is never rescanned, so a value containing `$1` stays as is.
fn bind_params<P: AsRef<[u8]>>(sql: &str, params: &[Option<P>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut copied = 0;
    for (range, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|k| params.get(k)) else {
            continue;
        };
        out.push_str(&sql[copied..range.start]);
        match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                out.push('\'');
                out.push_str(&text.replace('\'', "''"));
                out.push('\'');
            }
            None => out.push_str("NULL"),
        }
        copied = range.end;
    }
    out.push_str(&sql[copied..]);
    out
}

fn substitute_params(portal: &Portal<String>) -> String {
    bind_params(&portal.statement.statement, &portal.parameters)
}

// ── Factory ──────────────────────────────────────────────────────

pub struct FeaturedFactory {
    handler: Arc<FeaturedHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<FeaturedAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl FeaturedFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = FeaturedAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(FeaturedHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for FeaturedFactory {
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
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let factory = Arc::new(FeaturedFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await?;
    Ok(())
}

// ── Errors ───────────────────────────────────────────────────────

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::InvalidInput(_) => "22023",
        EngineError::InvalidWindow { .. } => "23514",
        EngineError::CapacityExceeded { .. } | EngineError::LimitExceeded(_) => "54000",
        EngineError::NotFound(_) => "P0002",
        EngineError::Store(StoreError::UniqueViolation(_)) => "23505",
        EngineError::Store(_) => "58030",
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
