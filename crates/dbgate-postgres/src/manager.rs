//! Connection Manager (C5) and Access-Mode Gate (C6).
//!
//! Owns every pool the gateway holds open, the single process-wide
//! `ConnectionState`, and the read-only gate every query routes through
//! before it reaches a pool. `parking_lot` locks guard the pool table and
//! state the same way the teacher crate guards its shared registries —
//! short critical sections, no lock held across an `.await`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::RwLock;
use serde_json::{Map, Value};
use sqlx::postgres::PgArguments;
use sqlx::{Column, Row, TypeInfo};
use tracing::{info, instrument, warn};

use dbgate_common::{GatewayError, Result};

use crate::catalog::{require_server, ServerCatalog, ServerConfig};
use crate::connection::{clamp_statement_timeout_ms, Connection, PoolConfig};
use crate::rowconv::{bind_param, row_to_json};
use crate::validator::{classify_read_only, validate_database_name, validate_identifier};

/// `(server, database)` key identifying one pool.
type PoolKey = (String, String);

/// Process-wide connection state. Mutated only by `switch_server`/`switch_database`.
#[derive(Debug, Clone, Default)]
pub struct ConnectionState {
    pub current_server: Option<String>,
    pub current_database: Option<String>,
    pub current_schema: Option<String>,
}

/// One column's name and reported PostgreSQL type, alongside a result row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: String,
    pub type_name: String,
}

/// The result of a single executed statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecuteResult {
    pub rows: Vec<Map<String, Value>>,
    pub row_count: usize,
    pub fields: Vec<FieldDescriptor>,
    pub execution_time_ms: f64,
    pub offset: Option<usize>,
    pub has_more: Option<bool>,
    pub truncated: Option<bool>,
    pub output_file: Option<String>,
}

/// A server/database pair used to reach outside the current connection
/// state without mutating it (see `query_with_override`).
#[derive(Debug, Clone)]
pub struct ConnectionOverride {
    pub server: String,
    pub database: Option<String>,
}

/// Owns every pool, the connection state, and the read-only gate.
pub struct ConnectionManager {
    catalog: ServerCatalog,
    pool_template: PoolConfig,
    pools: RwLock<HashMap<PoolKey, Connection>>,
    state: RwLock<ConnectionState>,
    read_only: AtomicBool,
    /// Set when a transaction session is in play; overrides are rejected
    /// while this is true (SPEC_FULL.md §4.7).
    transaction_in_progress: AtomicBool,
}

impl ConnectionManager {
    pub fn new(catalog: ServerCatalog, pool_template: PoolConfig, read_only: bool) -> Self {
        Self {
            catalog,
            pool_template,
            pools: RwLock::new(HashMap::new()),
            state: RwLock::new(ConnectionState::default()),
            read_only: AtomicBool::new(read_only),
            transaction_in_progress: AtomicBool::new(false),
        }
    }

    pub fn catalog(&self) -> &ServerCatalog {
        &self.catalog
    }

    pub fn current_state(&self) -> ConnectionState {
        self.state.read().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state.read().current_server.is_some()
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    pub fn set_read_only_mode(&self, enabled: bool) {
        self.read_only.store(enabled, Ordering::SeqCst);
    }

    pub(crate) fn mark_transaction_in_progress(&self, in_progress: bool) {
        self.transaction_in_progress.store(in_progress, Ordering::SeqCst);
    }

    fn build_uri(server: &ServerConfig, database: &str) -> String {
        let user = urlencode(&server.username);
        let pass = urlencode(&server.password);
        format!(
            "postgres://{user}:{pass}@{host}:{port}/{database}",
            host = server.host,
            port = server.port,
        )
    }

    /// Switches the active server/database/schema.
    ///
    /// On failure, `ConnectionState` is left untouched (SPEC_FULL.md §3
    /// invariant: current* fields move atomically or not at all).
    #[instrument(skip(self), fields(server = name))]
    pub async fn switch_server(
        &self,
        name: &str,
        database: Option<&str>,
        schema: Option<&str>,
    ) -> Result<()> {
        let server = require_server(&self.catalog, name)?.clone();

        if let Some(db) = database {
            validate_database_name(db)?;
        }

        let resolved_database = database
            .map(str::to_string)
            .or_else(|| server.default_database.clone())
            .unwrap_or_else(|| "postgres".to_string());

        let key = (name.to_string(), resolved_database.clone());
        let previous_key = {
            let state = self.state.read();
            match (state.current_server.clone(), state.current_database.clone()) {
                (Some(s), Some(d)) => Some((s, d)),
                _ => None,
            }
        };
        let needs_new_pool = previous_key.as_ref() != Some(&key);

        if needs_new_pool && !self.pools.read().contains_key(&key) {
            let uri = Self::build_uri(&server, &resolved_database);
            let conn = Connection::new(&uri, self.pool_template.clone()).await?;
            self.pools.write().insert(key.clone(), conn);
        }

        let resolved_schema = schema
            .map(str::to_string)
            .or_else(|| server.default_schema.clone());

        {
            let mut state = self.state.write();
            state.current_server = Some(name.to_string());
            state.current_database = Some(resolved_database);
            state.current_schema = resolved_schema;
        }

        if needs_new_pool {
            if let Some(stale) = previous_key.filter(|k| *k != key) {
                if let Some(conn) = self.pools.write().remove(&stale) {
                    conn.close().await;
                }
            }
        }

        info!(server = name, "switched active server");
        Ok(())
    }

    /// Shorthand for `switch_server(currentServer, database)`.
    pub async fn switch_database(&self, database: &str) -> Result<()> {
        let current_server = self
            .state
            .read()
            .current_server
            .clone()
            .ok_or(GatewayError::NoConnection)?;
        self.switch_server(&current_server, Some(database), None).await
    }

    fn current_pool(&self) -> Result<Connection> {
        let state = self.state.read();
        let server = state.current_server.clone().ok_or(GatewayError::NoConnection)?;
        let database = state.current_database.clone().ok_or(GatewayError::NoConnection)?;
        drop(state);
        self.pools
            .read()
            .get(&(server, database))
            .cloned()
            .ok_or(GatewayError::NoConnection)
    }

    /// Runs `sql` against the current pool, subject to the read-only gate.
    #[instrument(skip(self, sql, params))]
    pub async fn query(
        &self,
        sql: &str,
        params: &[Value],
        timeout_ms: Option<u64>,
    ) -> Result<ExecuteResult> {
        if sql.trim().is_empty() {
            return Err(GatewayError::InvalidArgument("sql cannot be empty".to_string()));
        }
        self.gate(sql)?;
        let conn = self.current_pool()?;
        run_query(&conn, sql, params, timeout_ms).await
    }

    /// Checks out a dedicated connection from the current pool. Release is
    /// the caller's responsibility.
    pub async fn get_client(&self) -> Result<sqlx::pool::PoolConnection<sqlx::Postgres>> {
        let conn = self.current_pool()?;
        Ok(conn.pool().acquire().await?)
    }

    /// Runs `sql` against a transient pool for `override_`, without
    /// touching persistent connection state. Rejected while a transaction
    /// session is active.
    pub async fn query_with_override(
        &self,
        sql: &str,
        params: &[Value],
        override_: &ConnectionOverride,
        timeout_ms: Option<u64>,
    ) -> Result<ExecuteResult> {
        if self.transaction_in_progress.load(Ordering::SeqCst) {
            return Err(GatewayError::TransactionInUse(
                "cannot use a connection override while a transaction session is open".to_string(),
            ));
        }
        if sql.trim().is_empty() {
            return Err(GatewayError::InvalidArgument("sql cannot be empty".to_string()));
        }
        self.gate(sql)?;
        let conn = self.override_pool(override_).await?;
        run_query(&conn, sql, params, timeout_ms).await
    }

    /// Checks out a connection from a transient override pool.
    pub async fn get_client_with_override(
        &self,
        override_: &ConnectionOverride,
    ) -> Result<sqlx::pool::PoolConnection<sqlx::Postgres>> {
        if self.transaction_in_progress.load(Ordering::SeqCst) {
            return Err(GatewayError::TransactionInUse(
                "cannot use a connection override while a transaction session is open".to_string(),
            ));
        }
        let conn = self.override_pool(override_).await?;
        Ok(conn.pool().acquire().await?)
    }

    async fn override_pool(&self, override_: &ConnectionOverride) -> Result<Connection> {
        let server = require_server(&self.catalog, &override_.server)?.clone();
        let database = override_
            .database
            .clone()
            .or_else(|| server.default_database.clone())
            .unwrap_or_else(|| "postgres".to_string());

        let key = (override_.server.clone(), database.clone());
        if let Some(existing) = self.pools.read().get(&key).cloned() {
            return Ok(existing);
        }

        let uri = Self::build_uri(&server, &database);
        let conn = Connection::new(&uri, self.pool_template.clone()).await?;
        self.pools.write().insert(key, conn.clone());
        Ok(conn)
    }

    /// Re-creates the current pool with the same parameters. Used by the
    /// retry wrapper after a connection error.
    pub async fn reconnect(&self) -> Result<bool> {
        let (server_name, database) = {
            let state = self.state.read();
            match (state.current_server.clone(), state.current_database.clone()) {
                (Some(s), Some(d)) => (s, d),
                _ => return Ok(false),
            }
        };

        let server = require_server(&self.catalog, &server_name)?.clone();
        let uri = Self::build_uri(&server, &database);
        let conn = Connection::new(&uri, self.pool_template.clone()).await?;
        self.pools.write().insert((server_name, database), conn);
        Ok(true)
    }

    /// True for driver errors indicating a dropped/terminated connection.
    pub fn is_connection_error(&self, err: &GatewayError) -> bool {
        err.is_connection_error()
    }

    /// Runs `op` once; on a connection error with a retry budget remaining,
    /// reconnects and retries exactly once.
    pub async fn with_retry<F, Fut, T>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        match op().await {
            Ok(v) => Ok(v),
            Err(e) if self.is_connection_error(&e) => {
                warn!(error = %e, "connection error, attempting one reconnect-and-retry");
                if self.reconnect().await.unwrap_or(false) {
                    op().await
                } else {
                    Err(e)
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Routes `sql` through C1's classifier when read-only mode is active.
    fn gate(&self, sql: &str) -> Result<()> {
        if !self.is_read_only() {
            return Ok(());
        }
        match classify_read_only(sql) {
            crate::validator::ReadOnlyVerdict::ReadOnly => Ok(()),
            crate::validator::ReadOnlyVerdict::NotReadOnly { reason } => {
                Err(GatewayError::ReadOnlyViolation(reason))
            }
        }
    }
}

async fn run_query(
    conn: &Connection,
    sql: &str,
    params: &[Value],
    timeout_ms: Option<u64>,
) -> Result<ExecuteResult> {
    let clamped_timeout = clamp_statement_timeout_ms(timeout_ms);
    let start = Instant::now();

    let mut arguments = PgArguments::default();
    for param in params {
        bind_param(&mut arguments, param)?;
    }

    let query = sqlx::query_with(sql, arguments);
    let rows = tokio::time::timeout(
        std::time::Duration::from_millis(clamped_timeout),
        query.fetch_all(conn.pool()),
    )
    .await
    .map_err(|_| GatewayError::Timeout(format!("statement exceeded {clamped_timeout}ms")))??;

    let fields = rows
        .first()
        .map(|row| {
            row.columns()
                .iter()
                .map(|c| FieldDescriptor {
                    name: c.name().to_string(),
                    type_name: c.type_info().name().to_string(),
                })
                .collect()
        })
        .unwrap_or_default();

    let mut json_rows = Vec::with_capacity(rows.len());
    for row in &rows {
        json_rows.push(row_to_json(row)?);
    }

    Ok(ExecuteResult {
        row_count: json_rows.len(),
        rows: json_rows,
        fields,
        execution_time_ms: start.elapsed().as_secs_f64() * 1000.0,
        offset: None,
        has_more: None,
        truncated: None,
        output_file: None,
    })
}

fn urlencode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for b in raw.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(b as char),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

/// Reports whether a schema-qualified or bare identifier is valid,
/// surfaced for callers of the introspection tool surface (`list_objects`,
/// `get_object_details`) that must reject a malformed schema/object name
/// before it ever reaches a pool.
pub fn validate_object_identifier(name: &str, allow_qualified: bool) -> Result<()> {
    validate_identifier(name, allow_qualified)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ServerCatalog;

    fn test_catalog() -> ServerCatalog {
        ServerCatalog::from_json(
            r#"{"primary": {"host": "127.0.0.1", "port": 5432, "username": "u", "password": "p", "defaultDatabase": "app"}}"#,
        )
    }

    #[test]
    fn test_connection_state_default() {
        let mgr = ConnectionManager::new(test_catalog(), PoolConfig::default(), false);
        assert!(!mgr.is_connected());
        assert!(mgr.current_state().current_server.is_none());
    }

    #[test]
    fn test_read_only_toggle() {
        let mgr = ConnectionManager::new(test_catalog(), PoolConfig::default(), false);
        assert!(!mgr.is_read_only());
        mgr.set_read_only_mode(true);
        assert!(mgr.is_read_only());
    }

    #[test]
    fn test_gate_blocks_writes_in_read_only_mode() {
        let mgr = ConnectionManager::new(test_catalog(), PoolConfig::default(), true);
        assert!(mgr.gate("SELECT 1").is_ok());
        assert!(matches!(
            mgr.gate("DELETE FROM t"),
            Err(GatewayError::ReadOnlyViolation(_))
        ));
    }

    #[test]
    fn test_gate_allows_writes_when_disabled() {
        let mgr = ConnectionManager::new(test_catalog(), PoolConfig::default(), false);
        assert!(mgr.gate("DELETE FROM t").is_ok());
    }

    #[test]
    fn test_urlencode_escapes_reserved_characters() {
        assert_eq!(urlencode("p@ss:word/"), "p%40ss%3Aword%2F");
        assert_eq!(urlencode("simple"), "simple");
    }

    #[test]
    fn test_validate_object_identifier() {
        assert!(validate_object_identifier("public.users", true).is_ok());
        assert!(validate_object_identifier("public.users", false).is_err());
    }

    #[tokio::test]
    async fn test_switch_server_unknown_name_leaves_state_untouched() {
        let mgr = ConnectionManager::new(test_catalog(), PoolConfig::default(), false);
        let result = mgr.switch_server("missing", None, None).await;
        assert!(matches!(result, Err(GatewayError::ServerNotFound(_))));
        assert!(mgr.current_state().current_server.is_none());
    }

    #[tokio::test]
    async fn test_switch_server_rejects_invalid_database_name() {
        let mgr = ConnectionManager::new(test_catalog(), PoolConfig::default(), false);
        let result = mgr.switch_server("primary", Some("bad; name"), None).await;
        assert!(matches!(result, Err(GatewayError::InvalidIdentifier(_))));
    }

    #[tokio::test]
    async fn test_query_without_connection_is_no_connection() {
        let mgr = ConnectionManager::new(test_catalog(), PoolConfig::default(), false);
        let result = mgr.query("SELECT 1", &[], None).await;
        assert!(matches!(result, Err(GatewayError::NoConnection)));
    }

    #[tokio::test]
    async fn test_query_rejects_empty_sql() {
        let mgr = ConnectionManager::new(test_catalog(), PoolConfig::default(), false);
        let result = mgr.query("   ", &[], None).await;
        assert!(matches!(result, Err(GatewayError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_query_with_override_rejected_during_transaction() {
        let mgr = ConnectionManager::new(test_catalog(), PoolConfig::default(), false);
        mgr.mark_transaction_in_progress(true);
        let result = mgr
            .query_with_override(
                "SELECT 1",
                &[],
                &ConnectionOverride { server: "primary".to_string(), database: None },
                None,
            )
            .await;
        assert!(matches!(result, Err(GatewayError::TransactionInUse(_))));
    }
}
