//! Server fleet catalog (C4).
//!
//! The catalog is loaded from one opaque string — in production this is an
//! environment variable's value, but nothing here depends on that; tests
//! construct it from a literal. Availability wins over fail-fast: a malformed
//! entry is dropped rather than aborting the whole catalog.

use serde::Deserialize;
use serde_json::Value;

use dbgate_common::{GatewayError, Result};

/// SSL posture for a server connection.
#[derive(Debug, Clone, PartialEq)]
pub enum SslMode {
    Off,
    RequireInsecure,
    Strict {
        ca: Option<String>,
        cert: Option<String>,
        key: Option<String>,
    },
}

/// Configuration for a single catalog entry. Immutable once loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub default_database: Option<String>,
    pub default_schema: Option<String>,
    pub is_default: bool,
    pub ssl: SslMode,
}

#[derive(Debug, Deserialize)]
struct RawServerConfig {
    host: Option<Value>,
    port: Option<u16>,
    username: Option<String>,
    password: Option<String>,
    #[serde(rename = "defaultDatabase")]
    default_database: Option<String>,
    #[serde(rename = "defaultSchema")]
    default_schema: Option<String>,
    #[serde(rename = "isDefault")]
    is_default: Option<bool>,
    ssl: Option<Value>,
}

/// Parses the `ssl` field per SPEC_FULL.md §6: booleans and the enum
/// strings `require | prefer | allow | disable` collapse to `Off` or the
/// permissive insecure mode; the object form is passed through strictly.
fn parse_ssl(value: Option<&Value>) -> SslMode {
    match value {
        None => SslMode::Off,
        Some(Value::Bool(false)) => SslMode::Off,
        Some(Value::Bool(true)) => SslMode::RequireInsecure,
        Some(Value::String(s)) => match s.to_ascii_lowercase().as_str() {
            "disable" => SslMode::Off,
            "require" | "prefer" | "allow" => SslMode::RequireInsecure,
            _ => SslMode::Off,
        },
        Some(Value::Object(obj)) => SslMode::Strict {
            ca: obj.get("ca").and_then(Value::as_str).map(str::to_string),
            cert: obj.get("cert").and_then(Value::as_str).map(str::to_string),
            key: obj.get("key").and_then(Value::as_str).map(str::to_string),
        },
        _ => SslMode::Off,
    }
}

/// The fleet: a name-to-config mapping plus the resolved default server.
#[derive(Debug, Clone, Default)]
pub struct ServerCatalog {
    servers: Vec<ServerConfig>,
}

impl ServerCatalog {
    /// Parses the catalog from a JSON object string mapping name to config.
    ///
    /// Parse failure or a non-object top level yields an empty catalog
    /// rather than an error — the gateway still starts, with
    /// `getServerNames()` reporting nothing configured.
    pub fn from_json(raw: &str) -> Self {
        let parsed: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(_) => return Self::default(),
        };

        let Value::Object(map) = parsed else {
            return Self::default();
        };

        let mut servers = Vec::new();
        for (name, entry) in map {
            let raw_config: RawServerConfig = match serde_json::from_value(entry) {
                Ok(c) => c,
                Err(_) => continue,
            };

            let host = match raw_config.host {
                Some(Value::String(h)) if !h.is_empty() => h,
                _ => continue,
            };

            servers.push(ServerConfig {
                name,
                host,
                port: raw_config.port.unwrap_or(5432),
                username: raw_config.username.unwrap_or_default(),
                password: raw_config.password.unwrap_or_default(),
                default_database: raw_config.default_database,
                default_schema: raw_config.default_schema,
                is_default: raw_config.is_default.unwrap_or(false),
                ssl: parse_ssl(raw_config.ssl.as_ref()),
            });
        }

        Self { servers }
    }

    /// Names of every configured server, in catalog order.
    pub fn get_server_names(&self) -> Vec<&str> {
        self.servers.iter().map(|s| s.name.as_str()).collect()
    }

    /// Looks up one server's config by name.
    pub fn get_server_config(&self, name: &str) -> Option<&ServerConfig> {
        self.servers.iter().find(|s| s.name == name)
    }

    /// The server marked `isDefault`, or the first in iteration order if
    /// none is, or `None` if the catalog is empty.
    pub fn get_default_server_name(&self) -> Option<&str> {
        self.servers
            .iter()
            .find(|s| s.is_default)
            .or_else(|| self.servers.first())
            .map(|s| s.name.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }
}

/// Parses the access-mode string per SPEC_FULL.md §6: `readonly`,
/// `read-only`, or `ro` (any case) enable read-only mode; anything else
/// disables it.
pub fn parse_access_mode(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "readonly" | "read-only" | "ro"
    )
}

/// Validates that a server name exists in the catalog before a caller tries
/// to switch to it.
pub fn require_server<'a>(catalog: &'a ServerCatalog, name: &str) -> Result<&'a ServerConfig> {
    catalog
        .get_server_config(name)
        .ok_or_else(|| GatewayError::ServerNotFound(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_minimal_entry() {
        let catalog = ServerCatalog::from_json(r#"{"primary": {"host": "db.internal"}}"#);
        assert_eq!(catalog.len(), 1);
        let cfg = catalog.get_server_config("primary").unwrap();
        assert_eq!(cfg.host, "db.internal");
        assert_eq!(cfg.port, 5432);
    }

    #[test]
    fn test_invalid_json_yields_empty_catalog() {
        let catalog = ServerCatalog::from_json("not json");
        assert!(catalog.is_empty());
        assert!(catalog.get_default_server_name().is_none());
    }

    #[test]
    fn test_non_object_top_level_yields_empty_catalog() {
        let catalog = ServerCatalog::from_json("[1, 2, 3]");
        assert!(catalog.is_empty());
    }

    #[test]
    fn test_entry_missing_host_is_dropped_not_fatal() {
        let catalog = ServerCatalog::from_json(
            r#"{"bad": {"port": 5432}, "good": {"host": "db.internal"}}"#,
        );
        assert_eq!(catalog.len(), 1);
        assert!(catalog.get_server_config("bad").is_none());
        assert!(catalog.get_server_config("good").is_some());
    }

    #[test]
    fn test_explicit_default_wins() {
        let catalog = ServerCatalog::from_json(
            r#"{"a": {"host": "h1"}, "b": {"host": "h2", "isDefault": true}}"#,
        );
        assert_eq!(catalog.get_default_server_name(), Some("b"));
    }

    #[test]
    fn test_first_server_is_default_when_none_marked() {
        let catalog = ServerCatalog::from_json(r#"{"only": {"host": "h1"}}"#);
        assert_eq!(catalog.get_default_server_name(), Some("only"));
    }

    #[test]
    fn test_ssl_boolean_variants() {
        let catalog = ServerCatalog::from_json(
            r#"{"a": {"host": "h", "ssl": true}, "b": {"host": "h", "ssl": false}}"#,
        );
        assert_eq!(
            catalog.get_server_config("a").unwrap().ssl,
            SslMode::RequireInsecure
        );
        assert_eq!(catalog.get_server_config("b").unwrap().ssl, SslMode::Off);
    }

    #[test]
    fn test_ssl_string_variants() {
        for value in ["require", "prefer", "allow", "REQUIRE"] {
            let json = format!(r#"{{"a": {{"host": "h", "ssl": "{value}"}}}}"#);
            let catalog = ServerCatalog::from_json(&json);
            assert_eq!(
                catalog.get_server_config("a").unwrap().ssl,
                SslMode::RequireInsecure
            );
        }
        let catalog = ServerCatalog::from_json(r#"{"a": {"host": "h", "ssl": "disable"}}"#);
        assert_eq!(catalog.get_server_config("a").unwrap().ssl, SslMode::Off);
    }

    #[test]
    fn test_ssl_strict_object() {
        let catalog = ServerCatalog::from_json(
            r#"{"a": {"host": "h", "ssl": {"ca": "ca.pem", "cert": "c.pem", "key": "k.pem"}}}"#,
        );
        match &catalog.get_server_config("a").unwrap().ssl {
            SslMode::Strict { ca, cert, key } => {
                assert_eq!(ca.as_deref(), Some("ca.pem"));
                assert_eq!(cert.as_deref(), Some("c.pem"));
                assert_eq!(key.as_deref(), Some("k.pem"));
            }
            other => panic!("expected strict ssl, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_access_mode() {
        for v in ["readonly", "read-only", "ro", "RO", "ReadOnly"] {
            assert!(parse_access_mode(v), "expected '{v}' to enable read-only");
        }
        for v in ["full", "", "rw", "write"] {
            assert!(!parse_access_mode(v), "expected '{v}' to disable read-only");
        }
    }

    #[test]
    fn test_require_server() {
        let catalog = ServerCatalog::from_json(r#"{"primary": {"host": "h"}}"#);
        assert!(require_server(&catalog, "primary").is_ok());
        assert!(matches!(
            require_server(&catalog, "missing"),
            Err(GatewayError::ServerNotFound(_))
        ));
    }
}
