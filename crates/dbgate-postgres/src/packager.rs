//! Result Packager (C9).
//!
//! Keeps large result sets out of an agent's context window by spooling
//! them to a temp file instead of inlining them, and turns raw results into
//! the human-readable summary fragments the script executor and tool
//! surface hand back to the agent.

use std::io::Write;

use serde_json::{Map, Value};
use tempfile::Builder;

use dbgate_common::Result;

const DEFAULT_MAX_CHARS: usize = 50_000;
const DEFAULT_TRUNCATE_SQL_LEN: usize = 200;

/// Outcome of `handle_large_output`: either the rows fit inline, or they
/// were spooled to a file and the caller must not also return them inline.
#[derive(Debug, Clone)]
pub struct LargeOutputResult {
    pub truncated: bool,
    pub rows: Vec<Map<String, Value>>,
    pub output_file: Option<String>,
}

/// Serializes `rows` to JSON; if the serialized length is within
/// `max_chars`, returns them inline. Otherwise writes the JSON to a
/// `0o600` temp file named `sql-result-<uuid>.json` and returns an empty
/// row set plus the file path.
pub fn handle_large_output(
    rows: Vec<Map<String, Value>>,
    max_chars: Option<usize>,
) -> Result<LargeOutputResult> {
    let max_chars = max_chars.unwrap_or(DEFAULT_MAX_CHARS);
    let serialized = serde_json::to_string(&rows)?;

    if serialized.len() <= max_chars {
        return Ok(LargeOutputResult {
            truncated: false,
            rows,
            output_file: None,
        });
    }

    let file_name = format!("sql-result-{}.json", uuid::Uuid::new_v4());
    let mut file = Builder::new()
        .prefix("sql-result-")
        .suffix(".json")
        .rand_bytes(0)
        .tempfile_in(std::env::temp_dir())?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = file.as_file().metadata()?.permissions();
        perms.set_mode(0o600);
        file.as_file().set_permissions(perms)?;
    }

    file.write_all(serialized.as_bytes())?;
    file.flush()?;

    let (_, path) = file.keep().map_err(|e| {
        dbgate_common::GatewayError::Internal(format!("failed to persist spooled result: {e}"))
    })?;

    let final_path = path.with_file_name(&file_name);
    std::fs::rename(&path, &final_path)?;

    Ok(LargeOutputResult {
        truncated: true,
        rows: Vec::new(),
        output_file: Some(final_path.to_string_lossy().into_owned()),
    })
}

/// A page of rows plus the pagination envelope.
#[derive(Debug, Clone)]
pub struct PaginatedRows {
    pub rows: Vec<Map<String, Value>>,
    pub offset: usize,
    pub has_more: bool,
    pub total_count: usize,
}

/// Slices `rows[offset..offset+limit]`, clamping past the end.
pub fn paginate_rows(rows: &[Map<String, Value>], offset: usize, limit: usize) -> PaginatedRows {
    let total_count = rows.len();
    let start = offset.min(total_count);
    let end = (start + limit).min(total_count);
    PaginatedRows {
        rows: rows[start..end].to_vec(),
        offset: start,
        has_more: end < total_count,
        total_count,
    }
}

/// Trims `sql` to `max` characters, appending an ellipsis if it was cut.
pub fn truncate_sql(sql: &str, max: Option<usize>) -> String {
    let max = max.unwrap_or(DEFAULT_TRUNCATE_SQL_LEN);
    if sql.chars().count() <= max {
        return sql.to_string();
    }
    let truncated: String = sql.chars().take(max).collect();
    format!("{truncated}...")
}

/// Formats a byte count using binary units (`B/KB/MB/GB`), one decimal
/// place at KB and above.
pub fn format_file_size(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;

    let bytes_f = bytes as f64;
    if bytes_f < KB {
        format!("{bytes}B")
    } else if bytes_f < MB {
        format!("{:.1}KB", bytes_f / KB)
    } else if bytes_f < GB {
        format!("{:.1}MB", bytes_f / MB)
    } else {
        format!("{:.1}GB", bytes_f / GB)
    }
}

/// Human-readable summary of a non-script single-statement execution.
pub fn create_execution_summary(row_count: usize, execution_time_ms: f64, truncated: bool) -> String {
    let base = format!("{row_count} row(s) in {execution_time_ms:.1}ms");
    if truncated {
        format!("{base} (result spooled to file due to size)")
    } else {
        base
    }
}

/// Human-readable summary for a spooled-to-file result.
pub fn create_file_summary(output_file: &str, byte_len: u64) -> String {
    format!(
        "Result too large for inline output ({}), written to {output_file}",
        format_file_size(byte_len)
    )
}
