//! Unified error vocabulary for the gateway.
//!
//! Every component (identifier validation, the tokenizer, the connection
//! manager, the script executor, ...) returns `Result<T>` from this module.
//! Driver errors are classified into this vocabulary by the `postgres-errors`
//! feature's `From<sqlx::Error>` impl so that a SQLSTATE code never has to be
//! re-parsed by a caller.

use thiserror::Error;

/// Result type alias used throughout the gateway.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Structured fields extracted from a PostgreSQL error response.
///
/// Mirrors the fields PostgreSQL actually sends on the wire (see
/// `https://www.postgresql.org/docs/current/protocol-error-fields.html`);
/// callers that need to show an agent "why" a statement failed get the raw
/// fields rather than a pre-formatted string.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DbErrorDetail {
    pub message: String,
    pub code: Option<String>,
    pub severity: Option<String>,
    pub detail: Option<String>,
    pub hint: Option<String>,
    pub schema: Option<String>,
    pub table: Option<String>,
    pub column: Option<String>,
    pub constraint: Option<String>,
    pub position: Option<i32>,
    pub internal_position: Option<i32>,
    pub internal_query: Option<String>,
    pub where_: Option<String>,
    pub file: Option<String>,
    pub line: Option<i32>,
    pub routine: Option<String>,
    pub data_type: Option<String>,
}

impl DbErrorDetail {
    /// Coerces a plain message into a detail record with every other field empty.
    pub fn from_message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }
}

/// Unified error type for all gateway operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("server not found: {0}")]
    ServerNotFound(String),

    #[error("no connection established")]
    NoConnection,

    #[error("failed to connect: {0}")]
    ConnectFailed(String),

    #[error("read-only violation: {0}")]
    ReadOnlyViolation(String),

    #[error("failed to parse SQL: {0}")]
    ParseFailed(String),

    #[error("database error: {}", .0.message)]
    DatabaseError(DbErrorDetail),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("transaction not found: {0}")]
    TransactionNotFound(String),

    #[error("transaction already in use: {0}")]
    TransactionInUse(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// True for errors that indicate a dropped/terminated connection rather
    /// than a problem with the statement itself. Used by the Connection
    /// Manager's retry wrapper (SPEC_FULL.md §4.5) to decide whether a single
    /// reconnect-and-retry is warranted.
    pub fn is_connection_error(&self) -> bool {
        match self {
            GatewayError::NoConnection | GatewayError::ConnectFailed(_) => true,
            GatewayError::DatabaseError(detail) => {
                if let Some(code) = &detail.code {
                    if code.starts_with("08") {
                        return true;
                    }
                }
                let msg = detail.message.to_ascii_lowercase();
                msg.contains("econnreset")
                    || msg.contains("terminating connection")
                    || msg.contains("connection terminated")
                    || msg.contains("server closed the connection unexpectedly")
            }
            _ => false,
        }
    }

    /// Non-rollbackable skips are informational by design (SPEC_FULL.md
    /// §4.3/§7) and never surface through this enum; this helper documents
    /// that absence rather than leaving readers to wonder where the variant
    /// went.
    pub fn is_database_error(&self) -> bool {
        matches!(self, GatewayError::DatabaseError(_))
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Internal(format!("serialization error: {err}"))
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::Internal(format!("io error: {err}"))
    }
}

#[cfg(feature = "postgres-errors")]
impl From<sqlx::Error> for GatewayError {
    fn from(err: sqlx::Error) -> Self {
        use sqlx::Error;
        match &err {
            Error::Configuration(_) => GatewayError::ConnectFailed(err.to_string()),
            Error::Database(db_err) => {
                let pg = db_err.try_downcast_ref::<sqlx::postgres::PgDatabaseError>();
                let detail = match pg {
                    Some(pg) => DbErrorDetail {
                        message: pg.message().to_string(),
                        code: Some(pg.code().to_string()),
                        severity: Some(
                            match pg.severity() {
                                sqlx::postgres::PgSeverity::Panic => "PANIC",
                                sqlx::postgres::PgSeverity::Fatal => "FATAL",
                                sqlx::postgres::PgSeverity::Error => "ERROR",
                                sqlx::postgres::PgSeverity::Warning => "WARNING",
                                sqlx::postgres::PgSeverity::Notice => "NOTICE",
                                sqlx::postgres::PgSeverity::Debug => "DEBUG",
                                sqlx::postgres::PgSeverity::Info => "INFO",
                                sqlx::postgres::PgSeverity::Log => "LOG",
                            }
                            .to_string(),
                        ),
                        detail: pg.detail().map(str::to_string),
                        hint: pg.hint().map(str::to_string),
                        schema: pg.schema().map(str::to_string),
                        table: pg.table().map(str::to_string),
                        column: pg.column().map(str::to_string),
                        constraint: pg.constraint().map(str::to_string),
                        position: pg.position().map(|p| match p {
                            sqlx::postgres::PgErrorPosition::Original(n) => n as i32,
                            sqlx::postgres::PgErrorPosition::Internal { position, .. } => {
                                position as i32
                            }
                        }),
                        internal_position: match pg.position() {
                            Some(sqlx::postgres::PgErrorPosition::Internal { position, .. }) => {
                                Some(position as i32)
                            }
                            _ => None,
                        },
                        internal_query: match pg.position() {
                            Some(sqlx::postgres::PgErrorPosition::Internal { query, .. }) => {
                                Some(query.to_string())
                            }
                            _ => None,
                        },
                        where_: pg.r#where().map(str::to_string),
                        file: pg.file().map(str::to_string),
                        line: pg.line().map(|l| l as i32),
                        routine: pg.routine().map(str::to_string),
                        data_type: pg.data_type().map(str::to_string),
                    },
                    None => DbErrorDetail::from_message(db_err.message().to_string()),
                };
                let code = detail.code.clone();
                match code.as_deref() {
                    Some("23505") | Some("23503") | Some("23502") | Some("23514")
                    | Some("23P01") => GatewayError::DatabaseError(detail),
                    Some("40P01") | Some("40001") => GatewayError::DatabaseError(detail),
                    Some(c) if c.starts_with("08") => GatewayError::ConnectFailed(detail.message),
                    Some("57P01") | Some("57P02") | Some("57P03") => {
                        GatewayError::DatabaseError(detail)
                    }
                    _ => GatewayError::DatabaseError(detail),
                }
            }
            Error::Io(_) | Error::Tls(_) | Error::Protocol(_) => {
                GatewayError::ConnectFailed(err.to_string())
            }
            Error::RowNotFound => {
                GatewayError::DatabaseError(DbErrorDetail::from_message("row not found"))
            }
            Error::PoolTimedOut => GatewayError::Timeout("connection pool timed out".to_string()),
            Error::PoolClosed => GatewayError::NoConnection,
            Error::WorkerCrashed => GatewayError::Internal("worker thread crashed".to_string()),
            _ => GatewayError::DatabaseError(DbErrorDetail::from_message(err.to_string())),
        }
    }
}
