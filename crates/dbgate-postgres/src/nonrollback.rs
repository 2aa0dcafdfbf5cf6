//! Non-rollbackable statement detector (C3).
//!
//! Some statements either cannot run inside a transaction at all (`VACUUM`,
//! `CREATE DATABASE`) or behave in a way a rollback can't undo (`NOTIFY`).
//! The script executor (see [`crate::script`]) consults this module once per
//! statement before deciding whether to run it inside the script's shared
//! transaction.

use once_cell::sync::Lazy;
use regex::Regex;

/// One detected concern about running a statement inside a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonRollbackWarning {
    pub tag: &'static str,
    pub must_skip: bool,
}

struct Rule {
    tag: &'static str,
    must_skip: bool,
    matcher: fn(&str) -> bool,
}

static VACUUM_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bVACUUM\b").unwrap());
static CLUSTER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bCLUSTER\b").unwrap());
static CREATE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bCREATE\b").unwrap());
static REINDEX_CONCURRENTLY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bREINDEX\b.{0,200}\bCONCURRENTLY\b").unwrap());
static CREATE_INDEX_CONCURRENTLY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bCREATE\s{1,10}INDEX\b.{0,200}\bCONCURRENTLY\b").unwrap());
static CREATE_DATABASE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bCREATE\s{1,10}DATABASE\b").unwrap());
static DROP_DATABASE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bDROP\s{1,10}DATABASE\b").unwrap());
static NEXTVAL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bNEXTVAL\s{0,10}\(").unwrap());
static SETVAL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bSETVAL\s{0,10}\(").unwrap());
static INSERT_INTO_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bINSERT\s{1,10}INTO\b").unwrap());
static NOTIFY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bNOTIFY\b").unwrap());

static RULES: Lazy<Vec<Rule>> = Lazy::new(|| {
    vec![
        Rule { tag: "VACUUM", must_skip: true, matcher: |s| VACUUM_RE.is_match(s) },
        Rule {
            tag: "CLUSTER",
            must_skip: true,
            matcher: |s| CLUSTER_RE.is_match(s) && !CREATE_RE.is_match(s),
        },
        Rule {
            tag: "REINDEX_CONCURRENTLY",
            must_skip: true,
            matcher: |s| REINDEX_CONCURRENTLY_RE.is_match(s),
        },
        Rule {
            tag: "CREATE_INDEX_CONCURRENTLY",
            must_skip: true,
            matcher: |s| CREATE_INDEX_CONCURRENTLY_RE.is_match(s),
        },
        Rule { tag: "CREATE_DATABASE", must_skip: true, matcher: |s| CREATE_DATABASE_RE.is_match(s) },
        Rule { tag: "DROP_DATABASE", must_skip: true, matcher: |s| DROP_DATABASE_RE.is_match(s) },
        Rule { tag: "SEQUENCE/NEXTVAL", must_skip: true, matcher: |s| NEXTVAL_RE.is_match(s) },
        Rule { tag: "SEQUENCE/SETVAL", must_skip: true, matcher: |s| SETVAL_RE.is_match(s) },
        Rule { tag: "SEQUENCE/INSERT", must_skip: false, matcher: |s| INSERT_INTO_RE.is_match(s) },
        Rule { tag: "NOTIFY", must_skip: false, matcher: |s| NOTIFY_RE.is_match(s) },
    ]
});

/// Classifies a single statement against the ordered rule table, returning
/// every rule that matched (a statement can trip more than one).
pub fn classify(sql: &str) -> Vec<NonRollbackWarning> {
    RULES
        .iter()
        .filter(|rule| (rule.matcher)(sql))
        .map(|rule| NonRollbackWarning {
            tag: rule.tag,
            must_skip: rule.must_skip,
        })
        .collect()
}

/// True if any warning in the set demands the statement be skipped entirely.
pub fn has_must_skip_warning(warnings: &[NonRollbackWarning]) -> bool {
    warnings.iter().any(|w| w.must_skip)
}

/// Human-readable reason for a must-skip verdict, or `None` if the set has
/// no must-skip warning.
pub fn get_skip_reason(warnings: &[NonRollbackWarning]) -> Option<String> {
    let tags: Vec<&str> = warnings
        .iter()
        .filter(|w| w.must_skip)
        .map(|w| w.tag)
        .collect();
    if tags.is_empty() {
        None
    } else {
        Some(format!(
            "statement cannot run inside a transaction ({})",
            tags.join(", ")
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vacuum_must_skip() {
        let warnings = classify("VACUUM ANALYZE t");
        assert!(has_must_skip_warning(&warnings));
        assert_eq!(warnings[0].tag, "VACUUM");
    }

    #[test]
    fn test_cluster_must_skip_but_not_create() {
        let warnings = classify("CLUSTER t USING idx");
        assert!(has_must_skip_warning(&warnings));
    }

    #[test]
    fn test_create_cluster_statement_is_not_flagged_as_cluster() {
        let warnings = classify("CREATE TABLE t (x int)");
        assert!(!warnings.iter().any(|w| w.tag == "CLUSTER"));
    }

    #[test]
    fn test_reindex_concurrently() {
        let warnings = classify("REINDEX INDEX CONCURRENTLY idx_name");
        assert!(has_must_skip_warning(&warnings));
        assert_eq!(warnings[0].tag, "REINDEX_CONCURRENTLY");
    }

    #[test]
    fn test_reindex_without_concurrently_is_not_flagged() {
        let warnings = classify("REINDEX INDEX idx_name");
        assert!(!has_must_skip_warning(&warnings));
    }

    #[test]
    fn test_create_index_concurrently() {
        let warnings = classify("CREATE INDEX CONCURRENTLY idx ON t (x)");
        assert!(has_must_skip_warning(&warnings));
    }

    #[test]
    fn test_create_database() {
        let warnings = classify("CREATE DATABASE newdb");
        assert!(has_must_skip_warning(&warnings));
        assert_eq!(get_skip_reason(&warnings).unwrap().contains("CREATE_DATABASE"), true);
    }

    #[test]
    fn test_drop_database() {
        let warnings = classify("DROP DATABASE olddb");
        assert!(has_must_skip_warning(&warnings));
    }

    #[test]
    fn test_nextval_and_setval() {
        assert!(has_must_skip_warning(&classify("SELECT nextval('s')")));
        assert!(has_must_skip_warning(&classify("SELECT setval('s', 5)")));
    }

    #[test]
    fn test_insert_is_warn_only() {
        let warnings = classify("INSERT INTO t VALUES (1)");
        assert!(!has_must_skip_warning(&warnings));
        assert_eq!(warnings[0].tag, "SEQUENCE/INSERT");
    }

    #[test]
    fn test_notify_is_warn_only() {
        let warnings = classify("NOTIFY channel, 'payload'");
        assert!(!has_must_skip_warning(&warnings));
        assert_eq!(warnings[0].tag, "NOTIFY");
    }

    #[test]
    fn test_clean_select_has_no_warnings() {
        let warnings = classify("SELECT * FROM t");
        assert!(warnings.is_empty());
        assert!(get_skip_reason(&warnings).is_none());
    }

    #[test]
    fn test_multiple_warnings_on_one_statement() {
        // Contrived, but exercises the "aggregate verdict" contract.
        let warnings = classify("INSERT INTO t SELECT nextval('s')");
        assert!(has_must_skip_warning(&warnings));
        assert!(warnings.iter().any(|w| w.tag == "SEQUENCE/INSERT"));
        assert!(warnings.iter().any(|w| w.tag == "SEQUENCE/NEXTVAL"));
    }
}
