//! Read-safe, multi-server PostgreSQL operations gateway for AI agents.
//!
//! This crate is the pure-Rust engine behind the gateway: given a catalog of
//! PostgreSQL servers and an access mode (read-only or read-write), it lets a
//! caller switch between servers/databases, run single statements or whole
//! scripts, hold multi-call transaction sessions open, and get results back
//! in a shape safe to hand to an agent (paginated, size-capped, spooled to
//! disk when large).
//!
//! # Architecture
//!
//! ```text
//! Gateway (gateway.rs)
//!   ├── ServerCatalog (catalog.rs)        -- which servers exist, how to reach them
//!   ├── ConnectionManager (manager.rs)     -- pools, current server/db/schema, access gate
//!   └── TransactionSessionRegistry (session.rs) -- long-lived agent-driven transactions
//!
//! validator.rs   -- identifier + read-only SQL classification (C1)
//! splitter.rs    -- SQL tokenizer / statement splitter (C2)
//! nonrollback.rs -- non-rollbackable statement detector (C3)
//! rowconv.rs     -- PgRow <-> serde_json::Value conversion, param binding
//! script.rs      -- dry-run / multi-statement script executor (C8)
//! packager.rs    -- pagination, truncation, large-result spooling (C9)
//! config.rs      -- environment-driven bootstrap (CA2)
//! connection.rs / transaction.rs -- pooled connections and savepoint-capable transactions
//! ```
//!
//! # Safety
//!
//! Every entry point that can run arbitrary SQL is routed through the
//! read-only classifier (`validator::classify_read_only`) whenever the
//! gateway is configured read-only. Identifiers interpolated into SQL
//! (schema/table/column/database names from introspection calls) are always
//! validated with `validator::validate_identifier` before use; values are
//! always passed as bind parameters, never interpolated.
//!
//! # Thread Safety
//!
//! `ConnectionManager` and `TransactionSessionRegistry` are `Send + Sync`
//! and meant to be shared behind an `Arc` across request handlers. Each
//! transaction session owns its checked-out client exclusively until it
//! commits, rolls back, or is swept for inactivity.

/// Pooled PostgreSQL connections with configurable timeouts and retry policy.
pub mod connection;

/// Savepoint-capable transactions over a dedicated client (C7 building block).
pub mod transaction;

/// Identifier and SQL validation, including read-only classification (C1).
pub mod validator;

/// SQL tokenizer and statement splitter (C2).
pub mod splitter;

/// Non-rollbackable PostgreSQL statement detector (C3).
pub mod nonrollback;

/// Server catalog parsing and lookup (C4).
pub mod catalog;

/// Row-to-JSON conversion and JSON-to-bind-parameter conversion.
pub mod rowconv;

/// Connection manager: pools, current server/database/schema, access gate (C5 + C6).
pub mod manager;

/// Transaction session registry for multi-call agent-driven transactions (C7).
pub mod session;

/// Dry-run / script executor (C8).
pub mod script;

/// Result packaging: pagination, truncation, large-result spooling (C9).
pub mod packager;

/// Environment-driven configuration bootstrap (CA2).
pub mod config;

/// Top-level wiring: owns the catalog, connection manager, and session registry.
pub mod gateway;

/// The agent-facing tool surface (§6): list/switch/introspect/execute/explain.
pub mod tools;

pub use connection::{clamp_statement_timeout_ms, Connection, PoolConfig, RetryConfig};
pub use transaction::{AccessMode, IsolationLevel, Transaction, TransactionOptions};

pub use catalog::{parse_access_mode, require_server, ServerCatalog, ServerConfig, SslMode};
pub use config::GatewayConfig;
pub use gateway::Gateway;
pub use manager::{validate_object_identifier, ConnectionManager, ConnectionOverride, ConnectionState, ExecuteResult, FieldDescriptor};
pub use nonrollback::{classify as classify_non_rollbackable, get_skip_reason, has_must_skip_warning, NonRollbackWarning};
pub use packager::{create_execution_summary, create_file_summary, format_file_size, handle_large_output, paginate_rows, truncate_sql, LargeOutputResult, PaginatedRows};
pub use rowconv::{bind_param, row_to_json};
pub use script::{run_script, ExecuteMode, ScriptResult, StatementOutcome, StatementState};
pub use session::TransactionSessionRegistry;
pub use splitter::{detect_statement_kind, extract_referenced_tables, split_statements, strip_leading_comments, SplitResult, SplitStatement, SplitWarning, WarningKind};
pub use tools::{execute_sql, explain_query, get_object_details, list_objects, list_schemas, list_servers_and_dbs, switch_server_db, ExecuteSqlOutcome, ObjectDetails, ServerSummary};
pub use validator::{classify_read_only, validate_database_name, validate_identifier, validate_schema_name, ReadOnlyVerdict};

pub use dbgate_common::{DbErrorDetail, GatewayError, Result};
