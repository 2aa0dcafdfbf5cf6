//! Transaction Session Registry (C7).
//!
//! Tracks long-lived, explicitly-opened transactions an agent drives across
//! multiple tool calls: `BEGIN` in one call, a handful of `exec`s, then
//! `COMMIT`/`ROLLBACK` in a later call. Each session owns its checked-out
//! client exclusively until it ends, which is why [`crate::transaction::Transaction`]
//! wraps a `'static` sqlx transaction rather than borrowing a pool.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use sqlx::postgres::PgArguments;
use sqlx::{Column, Row, TypeInfo};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use dbgate_common::{GatewayError, Result};

use crate::connection::Connection;
use crate::manager::{ConnectionManager, ExecuteResult, FieldDescriptor};
use crate::rowconv::{bind_param, row_to_json};
use crate::transaction::{Transaction, TransactionOptions};
use crate::validator::{classify_read_only, ReadOnlyVerdict};

const IDLE_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const HARD_TIMEOUT: Duration = Duration::from_secs(45 * 60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// `tx` is `None` only in the brief window between a commit/rollback taking
/// it out and the entry being dropped from the registry map; no caller can
/// observe that state since both happen under the same session lock.
struct Session {
    tx: Option<Transaction>,
    server: String,
    database: String,
    created_at: Instant,
    last_activity_at: Instant,
}

/// Registry of open transaction sessions, keyed by an opaque id handed back
/// to the agent on `begin_transaction`.
///
/// The map lock (`sessions`) only ever guards pointer-sized operations —
/// lookup, insert, remove. Each session's own `AsyncMutex` is what's held
/// across the `.await` on its query or commit/rollback, so one session's
/// round-trip never blocks another's.
pub struct TransactionSessionRegistry {
    sessions: Mutex<HashMap<String, Arc<AsyncMutex<Session>>>>,
}

impl Default for TransactionSessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionSessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Opens a transaction on a dedicated client, registers it, and
    /// returns the session id. Marks the manager's transaction-in-progress
    /// flag immediately so overrides (C5) are rejected without waiting on
    /// the sweeper.
    #[instrument(skip(self, conn, manager))]
    pub async fn begin_transaction(
        &self,
        conn: &Connection,
        manager: &ConnectionManager,
        server: &str,
        database: &str,
        options: TransactionOptions,
    ) -> Result<String> {
        let tx = Transaction::begin_with_options(conn, options).await?;
        let id = Uuid::new_v4().to_string();
        let now = Instant::now();

        self.sessions.lock().insert(
            id.clone(),
            Arc::new(AsyncMutex::new(Session {
                tx: Some(tx),
                server: server.to_string(),
                database: database.to_string(),
                created_at: now,
                last_activity_at: now,
            })),
        );
        manager.mark_transaction_in_progress(true);

        info!(tx_id = %id, server, database, "opened transaction session");
        Ok(id)
    }

    /// Runs `sql` inside an open session, gated by read-only mode the same
    /// way an ungated query would be.
    pub async fn exec(
        &self,
        tx_id: &str,
        sql: &str,
        params: &[Value],
        read_only: bool,
    ) -> Result<ExecuteResult> {
        if read_only {
            if let ReadOnlyVerdict::NotReadOnly { reason } = classify_read_only(sql) {
                return Err(GatewayError::ReadOnlyViolation(reason));
            }
        }

        let start = Instant::now();
        let session_arc = self
            .sessions
            .lock()
            .get(tx_id)
            .cloned()
            .ok_or_else(|| GatewayError::TransactionNotFound(tx_id.to_string()))?;

        let mut session = session_arc.lock().await;
        let tx = session
            .tx
            .as_mut()
            .ok_or_else(|| GatewayError::TransactionNotFound(tx_id.to_string()))?;

        let mut arguments = PgArguments::default();
        for param in params {
            bind_param(&mut arguments, param)?;
        }

        let query = sqlx::query_with(sql, arguments);
        let rows = query.fetch_all(&mut **tx.as_mut_transaction()).await?;

        session.last_activity_at = Instant::now();

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

    /// Commits and removes the session, then refreshes the manager's
    /// transaction-in-progress flag for any sessions still open.
    pub async fn commit(&self, tx_id: &str, manager: &ConnectionManager) -> Result<()> {
        let session_arc = self
            .sessions
            .lock()
            .remove(tx_id)
            .ok_or_else(|| GatewayError::TransactionNotFound(tx_id.to_string()))?;

        let tx = session_arc
            .lock()
            .await
            .tx
            .take()
            .ok_or_else(|| GatewayError::TransactionNotFound(tx_id.to_string()))?;

        tx.commit().await?;
        manager.mark_transaction_in_progress(!self.is_empty());
        info!(tx_id, "committed transaction session");
        Ok(())
    }

    /// Rolls back and removes the session, then refreshes the manager's
    /// transaction-in-progress flag for any sessions still open.
    pub async fn rollback(&self, tx_id: &str, manager: &ConnectionManager) -> Result<()> {
        let session_arc = self
            .sessions
            .lock()
            .remove(tx_id)
            .ok_or_else(|| GatewayError::TransactionNotFound(tx_id.to_string()))?;

        let tx = session_arc
            .lock()
            .await
            .tx
            .take()
            .ok_or_else(|| GatewayError::TransactionNotFound(tx_id.to_string()))?;

        tx.rollback().await?;
        manager.mark_transaction_in_progress(!self.is_empty());
        info!(tx_id, "rolled back transaction session");
        Ok(())
    }

    pub fn is_open(&self, tx_id: &str) -> bool {
        self.sessions.lock().contains_key(tx_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes any session idle past `IDLE_TIMEOUT` or alive past
    /// `HARD_TIMEOUT`, rolling each back. Intended to be driven by a
    /// periodic task every `SWEEP_INTERVAL`.
    pub async fn sweep_expired(&self) -> Vec<String> {
        let now = Instant::now();
        let candidates: Vec<(String, Arc<AsyncMutex<Session>>)> =
            self.sessions.lock().iter().map(|(id, s)| (id.clone(), Arc::clone(s))).collect();

        // A session whose lock is currently held is mid-exec, not idle, so a
        // failed `try_lock` just means "skip it this round" rather than an error.
        let expired_ids: Vec<String> = candidates
            .into_iter()
            .filter_map(|(id, arc)| match arc.try_lock() {
                Ok(s) => (now.duration_since(s.last_activity_at) > IDLE_TIMEOUT
                    || now.duration_since(s.created_at) > HARD_TIMEOUT)
                    .then_some(id),
                Err(_) => None,
            })
            .collect();

        let mut closed = Vec::new();
        for id in expired_ids {
            let session_arc = self.sessions.lock().remove(&id);
            if let Some(session_arc) = session_arc {
                let tx = session_arc.lock().await.tx.take();
                if let Some(tx) = tx {
                    if let Err(e) = tx.rollback().await {
                        warn!(tx_id = %id, error = %e, "failed to roll back expired session");
                    }
                }
                closed.push(id);
            }
        }
        closed
    }

    /// Runs the sweeper in a loop at `SWEEP_INTERVAL` until cancelled.
    /// Callers spawn this as a background task alongside the gateway. This
    /// is a correctness backstop for the flag `begin_transaction`/`commit`/
    /// `rollback` already maintain on every call — it only matters if a
    /// session is dropped without going through either path.
    pub async fn run_sweeper_loop(&self, manager: &ConnectionManager) {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            let closed = self.sweep_expired().await;
            if !closed.is_empty() {
                warn!(count = closed.len(), "swept expired transaction sessions");
            }
            manager.mark_transaction_in_progress(!self.is_empty());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_starts_empty() {
        let registry = TransactionSessionRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(registry.len(), 0);
        assert!(!registry.is_open("nonexistent"));
    }

    #[tokio::test]
    async fn test_exec_unknown_session_is_not_found() {
        let registry = TransactionSessionRegistry::new();
        let result = registry.exec("nope", "SELECT 1", &[], false).await;
        assert!(matches!(result, Err(GatewayError::TransactionNotFound(_))));
    }

    fn test_manager() -> ConnectionManager {
        ConnectionManager::new(
            crate::catalog::ServerCatalog::from_json(r#"{"primary": {"host": "h", "isDefault": true}}"#),
            crate::connection::PoolConfig::default(),
            false,
        )
    }

    #[tokio::test]
    async fn test_commit_unknown_session_is_not_found() {
        let registry = TransactionSessionRegistry::new();
        assert!(matches!(
            registry.commit("nope", &test_manager()).await,
            Err(GatewayError::TransactionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_rollback_unknown_session_is_not_found() {
        let registry = TransactionSessionRegistry::new();
        assert!(matches!(
            registry.rollback("nope", &test_manager()).await,
            Err(GatewayError::TransactionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_sweep_expired_on_empty_registry_is_noop() {
        let registry = TransactionSessionRegistry::new();
        let closed = registry.sweep_expired().await;
        assert!(closed.is_empty());
    }
}
