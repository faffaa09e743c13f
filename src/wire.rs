use std::fmt::Debug;
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
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldInfo, QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use ulid::Ulid;

use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{self, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, HolderRef, ResourceFilter, SqlError};
use crate::tenant::TenantManager;

pub struct HoldfastHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<HoldfastQueryParser>,
}

impl HoldfastHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(HoldfastQueryParser),
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

    /// Parse and run one statement, recording query metrics.
    async fn run(&self, engine: &Engine, sql: &str, format: &Format) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let start = Instant::now();
        let result = self.execute_command(engine, cmd, format).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label).record(start.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command, format: &Format) -> PgWireResult<Response> {
        match cmd {
            Command::InsertResource {
                id,
                name,
                description,
                stock,
            } => {
                engine
                    .create_resource(id, name, description, stock)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertHolder { id, contact } => {
                engine.create_holder(id, contact).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::Reserve { holder, resource_id } => {
                let holder_id = resolve_holder(engine, &holder)?;
                let info = engine.reserve(holder_id, resource_id).await.map_err(engine_err)?;
                resource_rows(vec![info], format)
            }
            Command::Release { holder, resource_id } => {
                let holder_id = resolve_holder(engine, &holder)?;
                engine.release(holder_id, resource_id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectResources { filter } => {
                let rows = match filter {
                    ResourceFilter::All => engine.list_resources().await,
                    ResourceFilter::Available => engine.available_resources().await,
                    ResourceFilter::LowStock(threshold) => engine.low_stock(threshold).await,
                    ResourceFilter::ById(id) => vec![engine.get_resource_info(id).await.map_err(engine_err)?],
                };
                resource_rows(rows, format)
            }
            Command::SelectTopResource => {
                let info = engine.top_resource().await.map_err(engine_err)?;
                resource_rows(vec![info], format)
            }
            Command::SelectClaims { holder } => {
                let holder_id = resolve_holder(engine, &holder)?;
                let claims = engine.claims_for_holder(holder_id).await.map_err(engine_err)?;
                claim_rows(claims, format)
            }
        }
    }
}

fn resolve_holder(engine: &Engine, holder: &HolderRef) -> PgWireResult<Ulid> {
    match holder {
        HolderRef::Id(id) => Ok(*id),
        HolderRef::Contact(contact) => engine.resolve_holder(contact).map_err(engine_err),
    }
}

fn resource_rows(rows: Vec<ResourceInfo>, format: &Format) -> PgWireResult<Response> {
    let schema = Arc::new(resource_schema(format));
    let rows: Vec<PgWireResult<_>> = rows
        .into_iter()
        .map(|r| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&r.id.to_string())?;
            encoder.encode_field(&r.name)?;
            encoder.encode_field(&r.description)?;
            encoder.encode_field(&i64::from(r.stock))?;
            encoder.encode_field(&i64::from(r.initial_stock))?;
            encoder.encode_field(&(r.popularity as i64))?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn claim_rows(claims: Vec<Claim>, format: &Format) -> PgWireResult<Response> {
    let schema = Arc::new(claim_schema(format));
    let rows: Vec<PgWireResult<_>> = claims
        .into_iter()
        .map(|c| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&c.id.to_string())?;
            encoder.encode_field(&c.holder_id.to_string())?;
            encoder.encode_field(&c.resource_id.to_string())?;
            encoder.encode_field(&c.claimed_at)?;
            encoder.encode_field(&c.released_at)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn fields(columns: &[(&str, Type)], format: &Format) -> Vec<FieldInfo> {
    columns
        .iter()
        .enumerate()
        .map(|(i, (name, ty))| FieldInfo::new((*name).into(), None, None, ty.clone(), format.format_for(i)))
        .collect()
}

fn resource_schema(format: &Format) -> Vec<FieldInfo> {
    fields(
        &[
            ("id", Type::VARCHAR),
            ("name", Type::VARCHAR),
            ("description", Type::VARCHAR),
            ("stock", Type::INT8),
            ("initial_stock", Type::INT8),
            ("popularity", Type::INT8),
        ],
        format,
    )
}

fn claim_schema(format: &Format) -> Vec<FieldInfo> {
    fields(
        &[
            ("id", Type::VARCHAR),
            ("holder_id", Type::VARCHAR),
            ("resource_id", Type::VARCHAR),
            ("claimed_at", Type::INT8),
            ("released_at", Type::INT8),
        ],
        format,
    )
}

/// Row shape a statement will produce, decided without executing it.
fn result_schema(sql: &str, format: &Format) -> Vec<FieldInfo> {
    match sql::parse_sql(sql) {
        Ok(Command::Reserve { .. } | Command::SelectResources { .. } | Command::SelectTopResource) => {
            resource_schema(format)
        }
        Ok(Command::SelectClaims { .. }) => claim_schema(format),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for HoldfastHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let response = self.run(&engine, query, &Format::UnifiedText).await?;
        Ok(vec![response])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct HoldfastQueryParser;

#[async_trait]
impl QueryParser for HoldfastQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(&self, stmt: &String, column_format: Option<&Format>) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(
            &with_placeholder_params(stmt),
            column_format.unwrap_or(&Format::UnifiedText),
        ))
    }
}

#[async_trait]
impl ExtendedQueryHandler for HoldfastHandler {
    type Statement = String;
    type QueryParser = HoldfastQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(&self, client: &mut C, portal: &Portal<Self::Statement>, _max_rows: usize) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let sql = substitute_params(portal);
        self.run(&engine, &sql, &portal.result_column_format).await
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
        let schema = result_schema(&with_placeholder_params(&target.statement), &Format::UnifiedText);
        Ok(DescribeStatementResponse::new(param_types, schema))
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
        let sql = substitute_params(target);
        Ok(DescribePortalResponse::new(result_schema(&sql, &target.result_column_format)))
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

/// Replace each `$N` token in one left-to-right pass. Substituted values are
/// never rescanned; tokens with no bound value are kept as written.
fn replace_params(sql: &str, values: &[String]) -> String {
    let mut result = String::with_capacity(sql.len());
    let bytes = sql.as_bytes();
    let mut copied = 0;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        let start = i + 1;
        let mut end = start;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }
        if end > start
            && let Ok(n) = sql[start..end].parse::<usize>()
            && let Some(value) = n.checked_sub(1).and_then(|idx| values.get(idx))
        {
            result.push_str(&sql[copied..i]);
            result.push_str(value);
            copied = end;
        }
        i = end.max(i + 1);
    }
    result.push_str(&sql[copied..]);
    result
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let values: Vec<String> = portal
        .parameters
        .iter()
        .map(|param| match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        })
        .collect();
    replace_params(&portal.statement.statement, &values)
}

/// Fill placeholders with a literal that reads as both the nil ULID and the
/// number 0, so an unbound statement still parses to its final shape.
fn with_placeholder_params(sql: &str) -> String {
    let nil = format!("'{}'", Ulid::nil());
    replace_params(sql, &vec![nil; count_params(sql)])
}

// ── Auth ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct PasswordSource {
    password: String,
}

impl PasswordSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for PasswordSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

// ── Factory ──────────────────────────────────────────────────────

pub struct HoldfastFactory {
    handler: Arc<HoldfastHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<PasswordSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl HoldfastFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = PasswordSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(HoldfastHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(auth_source, param_provider)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for HoldfastFactory {
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
) -> std::io::Result<()> {
    let factory = HoldfastFactory::new(tenant_manager, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Error mapping ────────────────────────────────────────────────

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::HolderNotFound(_) | EngineError::ResourceNotFound(_) | EngineError::NoResources => "P0002",
        EngineError::OutOfStock(_) | EngineError::HolderHasOpenClaim { .. } | EngineError::NoOpenClaim { .. } => {
            "P0001"
        }
        EngineError::AlreadyExists(_) | EngineError::DuplicateContact(_) => "23505",
        EngineError::InvalidContact(_) => "22023",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::StoreBusy => "55P03",
        EngineError::StoreUnavailable(_) => "58030",
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
