//! Dry-Run / Script Executor (C8).
//!
//! Drives a whole script — possibly several statements — through one
//! transaction on a dedicated client. Every statement is classified before
//! it runs: a must-skip statement (VACUUM, CREATE DATABASE, ...) is never
//! sent to the server at all, and in dry-run mode the transaction is always
//! rolled back regardless of how the statements behaved.

use std::time::Instant;

use serde_json::Value;
use sqlx::postgres::PgArguments;
use sqlx::{Column, Row, TypeInfo};
use tracing::{instrument, warn};

use dbgate_common::{DbErrorDetail, GatewayError, Result};

use crate::connection::Connection;
use crate::manager::{ExecuteResult, FieldDescriptor};
use crate::nonrollback::{self, NonRollbackWarning};
use crate::rowconv::{bind_param, row_to_json};
use crate::splitter::{self, SplitWarning, WarningKind};
use crate::transaction::Transaction;
use crate::validator::{classify_read_only, ReadOnlyVerdict};

/// Whether the executor commits on success or always rolls back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecuteMode {
    Execute,
    DryRun,
}

/// Per-statement terminal state, matching the PARSED → CLASSIFIED →
/// READ_ONLY_CHECKED → SKIPPED|EXECUTED{OK|FAIL} state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum StatementState {
    Skipped { reason: String },
    ExecutedOk(ExecuteResult),
    ExecutedFail(DbErrorDetail),
}

#[derive(Debug, Clone)]
pub struct StatementOutcome {
    pub index: usize,
    pub line_number: usize,
    pub sql: String,
    pub kind: String,
    pub non_rollbackable: Vec<NonRollbackWarning>,
    pub state: StatementState,
}

#[derive(Debug, Clone)]
pub struct ScriptResult {
    pub summary: String,
    pub statements: Vec<StatementOutcome>,
    pub rolled_back: bool,
    pub warnings: Vec<SplitWarning>,
}

/// Converts a gateway error into the flat, serializable shape
/// `extractDryRunError` is specified to produce: the full `DbErrorDetail`
/// when the error came from the database, or a message-only detail for
/// anything else (e.g. a read-only violation raised before the statement
/// ever reached the server).
pub fn extract_dry_run_error(err: &GatewayError) -> DbErrorDetail {
    match err {
        GatewayError::DatabaseError(detail) => detail.clone(),
        other => DbErrorDetail::from_message(other.to_string()),
    }
}

/// Runs `sql_text` as a script against a fresh client from `conn`.
///
/// `params` supplies optional bind parameters per statement index; a
/// statement with no entry (or an index past the end) runs unparameterized.
#[instrument(skip(conn, sql_text, params), fields(mode = ?mode))]
pub async fn run_script(
    conn: &Connection,
    sql_text: &str,
    mode: ExecuteMode,
    read_only: bool,
    params: &[Vec<Value>],
) -> Result<ScriptResult> {
    let split = splitter::split_statements(sql_text);

    let fatal_warning = split.warnings.iter().any(|w| w.kind.is_fatal());
    if fatal_warning && mode == ExecuteMode::Execute {
        return Err(GatewayError::ParseFailed(
            "script contains an unclosed string or dollar-quoted literal".to_string(),
        ));
    }

    let mut tx = Transaction::begin(conn, crate::transaction::IsolationLevel::ReadCommitted).await?;

    let mut outcomes = Vec::with_capacity(split.statements.len());
    let mut aborted = false;
    let mut succeeded = 0usize;
    let mut failed = 0usize;
    let mut skipped = 0usize;

    for (index, statement) in split.statements.iter().enumerate() {
        if aborted {
            break;
        }

        let kind = splitter::detect_statement_kind(&statement.text);
        let non_rollbackable = nonrollback::classify(&statement.text);

        if nonrollback::has_must_skip_warning(&non_rollbackable) {
            let reason = nonrollback::get_skip_reason(&non_rollbackable)
                .unwrap_or_else(|| "statement cannot run inside a transaction".to_string());
            skipped += 1;
            outcomes.push(StatementOutcome {
                index,
                line_number: statement.line_number,
                sql: statement.text.clone(),
                kind,
                non_rollbackable,
                state: StatementState::Skipped { reason },
            });
            continue;
        }

        if read_only {
            if let ReadOnlyVerdict::NotReadOnly { reason } = classify_read_only(&statement.text) {
                failed += 1;
                aborted = true;
                outcomes.push(StatementOutcome {
                    index,
                    line_number: statement.line_number,
                    sql: statement.text.clone(),
                    kind,
                    non_rollbackable,
                    state: StatementState::ExecutedFail(DbErrorDetail::from_message(format!(
                        "read-only violation: {reason}"
                    ))),
                });
                break;
            }
        }

        let stmt_params = params.get(index).map(Vec::as_slice).unwrap_or(&[]);
        match execute_one(&mut tx, &statement.text, stmt_params).await {
            Ok(result) => {
                succeeded += 1;
                outcomes.push(StatementOutcome {
                    index,
                    line_number: statement.line_number,
                    sql: statement.text.clone(),
                    kind,
                    non_rollbackable,
                    state: StatementState::ExecutedOk(result),
                });
            }
            Err(e) => {
                failed += 1;
                aborted = true;
                outcomes.push(StatementOutcome {
                    index,
                    line_number: statement.line_number,
                    sql: statement.text.clone(),
                    kind,
                    non_rollbackable,
                    state: StatementState::ExecutedFail(extract_dry_run_error(&e)),
                });
            }
        }
    }

    let rolled_back = aborted || mode == ExecuteMode::DryRun;
    if rolled_back {
        if let Err(e) = tx.rollback().await {
            warn!(error = %e, "rollback on cleanup path failed, swallowing");
        }
    } else if let Err(e) = tx.commit().await {
        failed += 1;
        succeeded = succeeded.saturating_sub(1);
        warn!(error = %e, "commit failed");
        return Err(e);
    }

    let total = outcomes.len();
    let summary = if mode == ExecuteMode::DryRun {
        format!(
            "Dry-run of {total} statements: {succeeded} succeeded, {failed} failed, {skipped} skipped (non-rollbackable). All changes rolled back."
        )
    } else if aborted {
        format!(
            "Executed {total} statements: {succeeded} succeeded, {failed} failed, {skipped} skipped (non-rollbackable). All changes rolled back."
        )
    } else {
        format!(
            "Executed {total} statements: {succeeded} succeeded, {failed} failed, {skipped} skipped (non-rollbackable). Changes committed."
        )
    };

    Ok(ScriptResult {
        summary,
        statements: outcomes,
        rolled_back,
        warnings: split.warnings,
    })
}

async fn execute_one(tx: &mut Transaction, sql: &str, params: &[Value]) -> Result<ExecuteResult> {
    let start = Instant::now();
    let mut arguments = PgArguments::default();
    for param in params {
        bind_param(&mut arguments, param)?;
    }
    let query = sqlx::query_with(sql, arguments);
    let rows = query.fetch_all(&mut **tx.as_mut_transaction()).await?;

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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_dry_run_error_database_error_passthrough() {
        let mut detail = DbErrorDetail::from_message("duplicate key");
        detail.code = Some("23505".to_string());
        let err = GatewayError::DatabaseError(detail.clone());
        assert_eq!(extract_dry_run_error(&err), detail);
    }

    #[test]
    fn test_extract_dry_run_error_non_database_coerces_to_message() {
        let err = GatewayError::ReadOnlyViolation("contains write keyword 'DELETE'".to_string());
        let detail = extract_dry_run_error(&err);
        assert!(detail.message.contains("read-only violation"));
        assert!(detail.code.is_none());
    }

    #[test]
    fn test_warning_kind_fatality() {
        assert!(WarningKind::UnclosedDollarQuote.is_fatal());
        assert!(WarningKind::UnclosedString.is_fatal());
        assert!(!WarningKind::UnclosedBlockComment.is_fatal());
    }
}
