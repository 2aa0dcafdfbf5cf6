//! Identifier and SQL safety validation (C1).
//!
//! Three independent checks live here: identifier syntax (`validate_identifier`,
//! `validate_database_name`, `validate_schema_name`), the read-only
//! classifier (`classify_read_only`), and the dangerous-function scan baked
//! into that classifier. None of these touch the network; they are pure
//! string checks that run before any statement reaches a pool.

use once_cell::sync::Lazy;
use regex::Regex;

use dbgate_common::{GatewayError, Result};

const MAX_IDENTIFIER_LEN: usize = 63;
const MAX_CLASSIFIER_INPUT_LEN: usize = 100_000;

static UNQUOTED_IDENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_$]*$").expect("valid regex"));
static SCHEMA_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_]\w*$").expect("valid regex"));
static DATABASE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_-]*$").expect("valid regex"));
static DATABASE_NAME_REJECT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"[;'"`]"#).expect("valid regex"));

/// Splits a possibly schema-qualified identifier on an unquoted `.`.
///
/// A `.` inside a double-quoted part is literal, not a separator.
fn split_qualified(raw: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = raw.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                current.push(c);
                if in_quotes && chars.peek() == Some(&'"') {
                    current.push(chars.next().unwrap());
                } else {
                    in_quotes = !in_quotes;
                }
            }
            '.' if !in_quotes => {
                parts.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    parts.push(current);
    parts
}

/// Validates one unquoted or double-quoted identifier part (no dots).
fn validate_identifier_part(part: &str) -> Result<()> {
    if part.is_empty() {
        return Err(GatewayError::InvalidIdentifier(
            "identifier part cannot be empty".to_string(),
        ));
    }

    if part.contains(';') || part.contains("--") || part.contains("/*") || part.contains("*/") {
        return Err(GatewayError::InvalidIdentifier(format!(
            "identifier part '{part}' contains a disallowed sequence"
        )));
    }

    if let Some(inner) = part.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        if part.len() < 2 {
            return Err(GatewayError::InvalidIdentifier(format!(
                "identifier part '{part}' is not a valid quoted identifier"
            )));
        }
        let unescaped = inner.replace("\"\"", "\"");
        if unescaped.contains('"') {
            return Err(GatewayError::InvalidIdentifier(format!(
                "identifier part '{part}' has an unterminated quote escape"
            )));
        }
        if unescaped.len() > MAX_IDENTIFIER_LEN {
            return Err(GatewayError::InvalidIdentifier(format!(
                "identifier part '{part}' exceeds {MAX_IDENTIFIER_LEN} characters"
            )));
        }
        return Ok(());
    }

    if part.len() > MAX_IDENTIFIER_LEN {
        return Err(GatewayError::InvalidIdentifier(format!(
            "identifier part '{part}' exceeds {MAX_IDENTIFIER_LEN} characters"
        )));
    }

    if !UNQUOTED_IDENT.is_match(part) {
        return Err(GatewayError::InvalidIdentifier(format!(
            "identifier part '{part}' is not a valid unquoted identifier"
        )));
    }

    Ok(())
}

/// Validates an identifier that may be schema-qualified (`schema.name`).
///
/// When `allow_qualified` is `false`, any `.` is rejected outright — used by
/// callers (e.g. a bare table name parameter) that must not accept a schema
/// prefix.
pub fn validate_identifier(raw: &str, allow_qualified: bool) -> Result<()> {
    if raw.is_empty() {
        return Err(GatewayError::InvalidIdentifier(
            "identifier cannot be empty".to_string(),
        ));
    }

    let parts = split_qualified(raw);

    if parts.len() > 2 {
        return Err(GatewayError::InvalidIdentifier(format!(
            "identifier '{raw}' has more than two dot-separated parts"
        )));
    }

    if parts.len() == 2 && !allow_qualified {
        return Err(GatewayError::InvalidIdentifier(format!(
            "identifier '{raw}' must not be schema-qualified"
        )));
    }

    for part in &parts {
        validate_identifier_part(part)?;
    }

    Ok(())
}

/// Validates a bare schema name against the stricter schema-name pattern.
pub fn validate_schema_name(name: &str) -> Result<()> {
    if !SCHEMA_NAME.is_match(name) {
        return Err(GatewayError::InvalidIdentifier(format!(
            "'{name}' is not a valid schema name"
        )));
    }
    Ok(())
}

/// Validates a database name: `^[A-Za-z_][A-Za-z0-9_-]*$` plus an explicit
/// reject-pattern for characters that have no business in a database name.
pub fn validate_database_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(GatewayError::InvalidIdentifier(
            "database name cannot be empty".to_string(),
        ));
    }
    if name.contains("--") || DATABASE_NAME_REJECT.is_match(name) {
        return Err(GatewayError::InvalidIdentifier(format!(
            "database name '{name}' contains a disallowed character"
        )));
    }
    if !DATABASE_NAME.is_match(name) {
        return Err(GatewayError::InvalidIdentifier(format!(
            "'{name}' is not a valid database name"
        )));
    }
    Ok(())
}

/// The verdict of the read-only classifier, with the reason a statement was
/// rejected when it was.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOnlyVerdict {
    ReadOnly,
    NotReadOnly { reason: String },
}

impl ReadOnlyVerdict {
    pub fn is_read_only(&self) -> bool {
        matches!(self, ReadOnlyVerdict::ReadOnly)
    }
}

const WRITE_KEYWORDS: &[&str] = &[
    "INSERT",
    "UPDATE",
    "DELETE",
    "MERGE",
    "UPSERT",
    "DROP",
    "CREATE",
    "ALTER",
    "TRUNCATE",
    "COMMENT ON",
    "GRANT",
    "REVOKE",
    "REASSIGN OWNED",
    "SECURITY LABEL",
    "COPY",
    "VACUUM",
    "REINDEX",
    "CLUSTER",
    "ANALYZE",
    "REFRESH MATERIALIZED VIEW",
    "LOCK",
    "DISCARD",
    "RESET",
    "SET ",
    "SET LOCAL",
    "SET SESSION",
    "DO",
    "CALL",
    "EXECUTE",
    "BEGIN",
    "COMMIT",
    "ROLLBACK",
    "SAVEPOINT",
    "RELEASE SAVEPOINT",
    "LOAD",
    "IMPORT FOREIGN SCHEMA",
    "CREATE SERVER",
    "CREATE FOREIGN",
    "NOTIFY",
    "LISTEN",
    "UNLISTEN",
];

const DANGEROUS_FUNCTIONS: &[&str] = &[
    "LO_IMPORT",
    "LO_EXPORT",
    "LO_UNLINK",
    "LO_CREATE",
    "LO_OPEN",
    "LO_WRITE",
    "LO_PUT",
    "PG_READ_FILE",
    "PG_READ_BINARY_FILE",
    "PG_WRITE_FILE",
    "PG_FILE_WRITE",
    "PG_FILE_UNLINK",
    "PG_FILE_RENAME",
    "DBLINK",
    "DBLINK_CONNECT",
    "DBLINK_EXEC",
    "COPY_TO",
    "COPY_FROM",
    "PG_TERMINATE_BACKEND",
    "PG_CANCEL_BACKEND",
    "PG_RELOAD_CONF",
    "PG_ROTATE_LOGFILE",
    "PG_SWITCH_WAL",
    "PG_SWITCH_XLOG",
    "NEXTVAL",
    "SETVAL",
    "CURRVAL",
    "PG_ADVISORY_LOCK",
];

static DATA_MODIFYING_CTE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\bAS\s{0,10}\(\s{0,10}(INSERT|UPDATE|DELETE|MERGE)\b").expect("valid regex")
});

/// Strips `--` line comments and `/* ... */` block comments (non-greedy),
/// collapses whitespace, and uppercases — the normalization step every
/// classifier check runs against.
fn normalize(sql: &str) -> String {
    static LINE_COMMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"--[^\n]*").expect("valid regex"));
    static BLOCK_COMMENT: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?s)/\*.*?\*/").expect("valid regex"));
    static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid regex"));

    let without_line_comments = LINE_COMMENT.replace_all(sql, " ");
    let without_block_comments = BLOCK_COMMENT.replace_all(&without_line_comments, " ");
    let collapsed = WHITESPACE.replace_all(&without_block_comments, " ");
    collapsed.trim().to_uppercase()
}

fn keyword_boundary_regex(keyword: &str) -> Regex {
    let escaped = regex::escape(keyword.trim());
    Regex::new(&format!(r"(?:^|[(;])\s{{0,10}}{escaped}(?:$|[\s(])")).expect("valid regex")
}

fn function_call_regex(name: &str) -> Regex {
    let escaped = regex::escape(name);
    Regex::new(&format!(r"\b{escaped}\s{{0,10}}\(")).expect("valid regex")
}

/// Classifies normalized SQL as read-only or not, with a specific reason.
///
/// All regexes used here are bounded (`\s{0,10}`) per the ReDoS-safety
/// contract in SPEC_FULL.md §4.1/§9.
pub fn classify_read_only(sql: &str) -> ReadOnlyVerdict {
    let normalized = normalize(sql);

    if normalized.len() > MAX_CLASSIFIER_INPUT_LEN {
        return ReadOnlyVerdict::NotReadOnly {
            reason: "too large to validate safely".to_string(),
        };
    }

    for keyword in WRITE_KEYWORDS {
        if keyword_boundary_regex(keyword).is_match(&normalized) {
            return ReadOnlyVerdict::NotReadOnly {
                reason: format!("contains write keyword '{}'", keyword.trim()),
            };
        }
    }

    if normalized.contains("WITH") && DATA_MODIFYING_CTE.is_match(&normalized) {
        return ReadOnlyVerdict::NotReadOnly {
            reason: "contains a data-modifying common table expression".to_string(),
        };
    }

    for func in DANGEROUS_FUNCTIONS {
        if function_call_regex(func).is_match(&normalized) {
            return ReadOnlyVerdict::NotReadOnly {
                reason: format!("calls dangerous function '{func}'"),
            };
        }
    }

    ReadOnlyVerdict::ReadOnly
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_identifier_simple() {
        assert!(validate_identifier("users", false).is_ok());
        assert!(validate_identifier("_private", false).is_ok());
        assert!(validate_identifier("col$1", false).is_ok());
    }

    #[test]
    fn test_validate_identifier_qualified() {
        assert!(validate_identifier("public.users", true).is_ok());
        assert!(validate_identifier("public.users", false).is_err());
    }

    #[test]
    fn test_validate_identifier_too_many_parts() {
        assert!(validate_identifier("a.b.c", true).is_err());
    }

    #[test]
    fn test_validate_identifier_quoted() {
        assert!(validate_identifier(r#""My Table""#, false).is_ok());
        assert!(validate_identifier(r#""has ""quote"" inside""#, false).is_ok());
    }

    #[test]
    fn test_validate_identifier_rejects_dangerous_sequences() {
        assert!(validate_identifier("users; DROP TABLE x", false).is_err());
        assert!(validate_identifier("users--comment", false).is_err());
        assert!(validate_identifier("users/*comment*/", false).is_err());
    }

    #[test]
    fn test_validate_identifier_leading_digit() {
        assert!(validate_identifier("1users", false).is_err());
    }

    #[test]
    fn test_validate_identifier_too_long() {
        let long = "a".repeat(64);
        assert!(validate_identifier(&long, false).is_err());
        let ok = "a".repeat(63);
        assert!(validate_identifier(&ok, false).is_ok());
    }

    #[test]
    fn test_validate_schema_name() {
        assert!(validate_schema_name("public").is_ok());
        assert!(validate_schema_name("public.users").is_err());
        assert!(validate_schema_name("1public").is_err());
    }

    #[test]
    fn test_validate_database_name_rejections() {
        for bad in [
            "db; DROP",
            "db'--",
            "db\"x",
            "db`x",
            "db--c",
            "",
            "1db",
        ] {
            assert!(
                validate_database_name(bad).is_err(),
                "expected '{bad}' to be rejected"
            );
        }
    }

    #[test]
    fn test_validate_database_name_accepts() {
        assert!(validate_database_name("db_1-prod").is_ok());
    }

    #[test]
    fn test_classify_read_only_blocked_set() {
        let blocked = [
            "INSERT INTO t VALUES (1)",
            "UPDATE t SET x = 1",
            "DELETE FROM t",
            "DROP TABLE t",
            "CREATE TABLE t (x int)",
            "VACUUM t",
            "WITH x AS (DELETE FROM t RETURNING *) SELECT * FROM x",
            "SELECT pg_terminate_backend(1)",
            "SELECT nextval('s')",
        ];
        for sql in blocked {
            let verdict = classify_read_only(sql);
            assert!(!verdict.is_read_only(), "expected '{sql}' to be blocked");
            if let ReadOnlyVerdict::NotReadOnly { reason } = verdict {
                assert!(!reason.is_empty());
            }
        }
    }

    #[test]
    fn test_classify_read_only_safe_set() {
        let safe = [
            "SELECT * FROM t",
            "EXPLAIN SELECT * FROM t",
            "WITH x AS (SELECT 1) SELECT * FROM x",
        ];
        for sql in safe {
            assert!(
                classify_read_only(sql).is_read_only(),
                "expected '{sql}' to be read-only"
            );
        }
    }

    #[test]
    fn test_classify_read_only_size_limit() {
        let huge = format!("SELECT '{}'", "x".repeat(MAX_CLASSIFIER_INPUT_LEN + 1));
        let verdict = classify_read_only(&huge);
        match verdict {
            ReadOnlyVerdict::NotReadOnly { reason } => {
                assert_eq!(reason, "too large to validate safely");
            }
            _ => panic!("expected oversized input to be rejected"),
        }
    }

    #[test]
    fn test_classify_read_only_strips_comments() {
        let sql = "-- comment\nSELECT 1 /* inline */";
        assert!(classify_read_only(sql).is_read_only());
    }
}
