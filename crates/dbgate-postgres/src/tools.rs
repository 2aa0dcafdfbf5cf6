//! The tool surface named in SPEC_FULL.md §6: the public functions an
//! external collaborator (the agent-facing request/response layer) calls to
//! drive the gateway. Everything here is a thin composition of C1-C9 —
//! catalog lookups, the connection manager's gated `query`, and the
//! packager's pagination/truncation/spooling — never new SQL-safety logic.

use serde_json::{Map, Value};
use tracing::instrument;

use dbgate_common::Result;

use crate::catalog::ServerConfig;
use crate::gateway::Gateway;
use crate::manager::{ConnectionOverride, ExecuteResult};
use crate::packager::{self, LargeOutputResult, PaginatedRows};
use crate::validator::{validate_database_name, validate_identifier, validate_schema_name};

/// One entry of `list_servers_and_dbs`'s catalog listing.
#[derive(Debug, Clone)]
pub struct ServerSummary {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub is_default: bool,
    pub default_database: Option<String>,
    /// Populated only when the caller asked to probe live databases.
    pub databases: Option<Vec<String>>,
}

fn summarize(server: &ServerConfig) -> ServerSummary {
    ServerSummary {
        name: server.name.clone(),
        host: server.host.clone(),
        port: server.port,
        is_default: server.is_default,
        default_database: server.default_database.clone(),
        databases: None,
    }
}

/// Lists every server in the catalog. When `probe` is true, connects to each
/// server's default database and lists its non-template databases.
pub async fn list_servers_and_dbs(gateway: &Gateway, probe: bool) -> Result<Vec<ServerSummary>> {
    let names: Vec<String> = gateway
        .manager
        .catalog()
        .get_server_names()
        .into_iter()
        .map(str::to_string)
        .collect();

    let mut summaries = Vec::with_capacity(names.len());
    for name in names {
        let server = match gateway.manager.catalog().get_server_config(&name) {
            Some(s) => s,
            None => continue,
        };
        let mut summary = summarize(server);

        if probe {
            let override_ = ConnectionOverride {
                server: name.clone(),
                database: server.default_database.clone(),
            };
            let result = gateway
                .manager
                .query_with_override(
                    "SELECT datname FROM pg_database WHERE datistemplate = false ORDER BY datname",
                    &[],
                    &override_,
                    None,
                )
                .await?;
            summary.databases = Some(extract_strings(&result, "datname"));
        }

        summaries.push(summary);
    }

    Ok(summaries)
}

fn extract_strings(result: &ExecuteResult, column: &str) -> Vec<String> {
    result
        .rows
        .iter()
        .filter_map(|row| row.get(column).and_then(Value::as_str).map(str::to_string))
        .collect()
}

/// Switches the active server, and optionally database/schema.
#[instrument(skip(gateway), fields(server))]
pub async fn switch_server_db(
    gateway: &Gateway,
    server: &str,
    database: Option<&str>,
    schema: Option<&str>,
) -> Result<()> {
    if let Some(db) = database {
        validate_database_name(db)?;
    }
    if let Some(s) = schema {
        validate_schema_name(s)?;
    }
    gateway.manager.switch_server(server, database, schema).await
}

const SYSTEM_SCHEMAS: &[&str] = &["pg_catalog", "information_schema", "pg_toast"];

/// Lists schemas in the current database, excluding system schemas unless
/// `include_system_schemas` is set.
pub async fn list_schemas(gateway: &Gateway, include_system_schemas: bool) -> Result<Vec<String>> {
    let result = gateway
        .manager
        .query(
            "SELECT schema_name FROM information_schema.schemata ORDER BY schema_name",
            &[],
            None,
        )
        .await?;

    let names = extract_strings(&result, "schema_name");
    if include_system_schemas {
        return Ok(names);
    }

    Ok(names
        .into_iter()
        .filter(|n| !SYSTEM_SCHEMAS.contains(&n.as_str()) && !n.starts_with("pg_toast_") && !n.starts_with("pg_temp_"))
        .collect())
}

/// Lists tables and views in `schema`, paginated. Each row has `name` and
/// `kind` columns.
pub async fn list_objects(gateway: &Gateway, schema: &str, offset: usize, limit: usize) -> Result<PaginatedRows> {
    validate_schema_name(schema)?;

    let result = gateway
        .manager
        .query(
            "SELECT table_name AS name, table_type AS kind FROM information_schema.tables \
             WHERE table_schema = $1 ORDER BY table_name",
            &[Value::String(schema.to_string())],
            None,
        )
        .await?;

    Ok(packager::paginate_rows(&result.rows, offset, limit))
}

/// Column, constraint, index, and size details for one object.
#[derive(Debug, Clone)]
pub struct ObjectDetails {
    pub columns: Vec<Map<String, Value>>,
    pub constraints: Vec<Map<String, Value>>,
    pub indexes: Vec<Map<String, Value>>,
    pub size_bytes: Option<i64>,
}

/// Full introspection of one table/view: columns, constraints, indexes, and
/// on-disk size.
pub async fn get_object_details(gateway: &Gateway, schema: &str, object_name: &str) -> Result<ObjectDetails> {
    validate_schema_name(schema)?;
    validate_identifier(object_name, false)?;

    let schema_val = Value::String(schema.to_string());
    let object_val = Value::String(object_name.to_string());

    let columns = gateway
        .manager
        .query(
            "SELECT column_name, data_type, is_nullable, column_default \
             FROM information_schema.columns \
             WHERE table_schema = $1 AND table_name = $2 \
             ORDER BY ordinal_position",
            &[schema_val.clone(), object_val.clone()],
            None,
        )
        .await?
        .rows;

    let constraints = gateway
        .manager
        .query(
            "SELECT constraint_name, constraint_type \
             FROM information_schema.table_constraints \
             WHERE table_schema = $1 AND table_name = $2",
            &[schema_val.clone(), object_val.clone()],
            None,
        )
        .await?
        .rows;

    let indexes = gateway
        .manager
        .query(
            "SELECT indexname AS index_name, indexdef AS definition \
             FROM pg_indexes \
             WHERE schemaname = $1 AND tablename = $2",
            &[schema_val.clone(), object_val.clone()],
            None,
        )
        .await?
        .rows;

    let qualified = format!("{schema}.{object_name}");
    let size_bytes = gateway
        .manager
        .query(
            "SELECT pg_total_relation_size($1::regclass) AS size_bytes",
            &[Value::String(qualified)],
            None,
        )
        .await
        .ok()
        .and_then(|r| r.rows.first().and_then(|row| row.get("size_bytes")).and_then(Value::as_i64));

    Ok(ObjectDetails {
        columns,
        constraints,
        indexes,
        size_bytes,
    })
}

/// Outcome of `execute_sql`: either the rows fit inline or they were spooled
/// to a file, always with pagination applied first.
#[derive(Debug, Clone)]
pub struct ExecuteSqlOutcome {
    pub result: ExecuteResult,
    pub large_output: LargeOutputResult,
}

/// Runs `sql`, gated by the current read-only mode, then paginates and
/// (if still too large) spools the result per C9.
#[instrument(skip(gateway, sql, params))]
pub async fn execute_sql(
    gateway: &Gateway,
    sql: &str,
    params: &[Value],
    timeout_ms: Option<u64>,
    offset: usize,
    limit: usize,
    max_chars: Option<usize>,
) -> Result<ExecuteSqlOutcome> {
    let mut result = gateway.manager.query(sql, params, timeout_ms).await?;

    let page = packager::paginate_rows(&result.rows, offset, limit);
    result.offset = Some(page.offset);
    result.has_more = Some(page.has_more);

    let large_output = packager::handle_large_output(page.rows, max_chars)?;
    result.truncated = Some(large_output.truncated);
    result.output_file = large_output.output_file.clone();

    Ok(ExecuteSqlOutcome { result, large_output })
}

/// Wraps `sql` in `EXPLAIN (FORMAT JSON[, ANALYZE])`, gated the same way as
/// `execute_sql` (an `ANALYZE` explain actually runs the query).
pub async fn explain_query(gateway: &Gateway, sql: &str, analyze: bool) -> Result<ExecuteResult> {
    let explain_sql = if analyze {
        format!("EXPLAIN (FORMAT JSON, ANALYZE) {sql}")
    } else {
        format!("EXPLAIN (FORMAT JSON) {sql}")
    };
    gateway.manager.query(&explain_sql, &[], None).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::PoolConfig;

    fn test_gateway() -> Gateway {
        Gateway::new(
            crate::catalog::ServerCatalog::from_json(
                r#"{"primary": {"host": "h", "isDefault": true, "defaultDatabase": "app"}}"#,
            ),
            PoolConfig::default(),
            false,
        )
    }

    #[tokio::test]
    async fn test_list_servers_and_dbs_without_probe() {
        let gateway = test_gateway();
        let summaries = list_servers_and_dbs(&gateway, false).await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].name, "primary");
        assert!(summaries[0].databases.is_none());
    }

    #[tokio::test]
    async fn test_switch_server_db_rejects_bad_database_name() {
        let gateway = test_gateway();
        let result = switch_server_db(&gateway, "primary", Some("bad; name"), None).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_list_objects_rejects_bad_schema_name() {
        let gateway = test_gateway();
        let result = list_objects(&gateway, "bad.schema", 0, 10).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_get_object_details_rejects_bad_object_name() {
        let gateway = test_gateway();
        let result = get_object_details(&gateway, "public", "bad; drop").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_execute_sql_without_connection_errors() {
        let gateway = test_gateway();
        let result = execute_sql(&gateway, "SELECT 1", &[], None, 0, 100, None).await;
        assert!(result.is_err());
    }
}
