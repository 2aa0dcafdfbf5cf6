//! Environment-driven config bootstrap (CA2).
//!
//! Reads the two opaque configuration strings described in SPEC_FULL.md §6
//! — the server catalog JSON and the access-mode string — plus pool-sizing
//! knobs, all from environment variables. Constructing a `ServerCatalog`/
//! `ConnectionManager` directly from in-memory strings remains supported
//! for embedding and tests; this is only the default bootstrap path.

use dbgate_common::{GatewayError, Result};

use crate::connection::PoolConfig;

const ENV_SERVERS: &str = "PG_GATEWAY_SERVERS";
const ENV_ACCESS_MODE: &str = "PG_GATEWAY_ACCESS_MODE";
const ENV_MAX_CONNECTIONS: &str = "PG_GATEWAY_POOL_MAX_CONNECTIONS";
const ENV_MIN_CONNECTIONS: &str = "PG_GATEWAY_POOL_MIN_CONNECTIONS";
const ENV_STATEMENT_TIMEOUT_MS: &str = "PG_GATEWAY_STATEMENT_TIMEOUT_MS";

/// The gateway's top-level configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub server_catalog_json: String,
    pub access_mode: String,
    pub pool: PoolConfig,
}

impl GatewayConfig {
    /// Builds a config directly from explicit values, bypassing the
    /// environment entirely. Used by tests and embedders.
    pub fn new(server_catalog_json: impl Into<String>, access_mode: impl Into<String>, pool: PoolConfig) -> Self {
        Self {
            server_catalog_json: server_catalog_json.into(),
            access_mode: access_mode.into(),
            pool,
        }
    }

    /// Loads config from the environment. `PG_GATEWAY_SERVERS` is required;
    /// everything else has a default.
    pub fn from_env() -> Result<Self> {
        Self::from_env_vars(|key| std::env::var(key).ok())
    }

    /// Testable variant of `from_env` that takes a lookup function instead
    /// of reading the real process environment.
    pub fn from_env_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let server_catalog_json = lookup(ENV_SERVERS).ok_or_else(|| {
            GatewayError::InvalidArgument(format!("{ENV_SERVERS} must be set"))
        })?;

        let access_mode = lookup(ENV_ACCESS_MODE).unwrap_or_default();

        let mut pool = PoolConfig::default();

        if let Some(raw) = lookup(ENV_MAX_CONNECTIONS) {
            pool.max_connections = parse_env_u32(ENV_MAX_CONNECTIONS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_MIN_CONNECTIONS) {
            pool.min_connections = parse_env_u32(ENV_MIN_CONNECTIONS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_STATEMENT_TIMEOUT_MS) {
            let requested = parse_env_u32(ENV_STATEMENT_TIMEOUT_MS, &raw)? as u64;
            pool.statement_timeout_ms = crate::connection::clamp_statement_timeout_ms(Some(requested));
        }

        Ok(Self {
            server_catalog_json,
            access_mode,
            pool,
        })
    }

    /// True when `access_mode` selects one of the read-only spellings.
    pub fn is_read_only(&self) -> bool {
        crate::catalog::parse_access_mode(&self.access_mode)
    }
}

fn parse_env_u32(key: &str, raw: &str) -> Result<u32> {
    raw.trim()
        .parse::<u32>()
        .map_err(|_| GatewayError::InvalidArgument(format!("{key} must be a non-negative integer, got '{raw}'")))
}
