//! Cross-module tests for the SQL safety pipeline: splitting a script into
//! statements, classifying each one read-only/not, and flagging
//! non-rollbackable statements — the same sequence `run_script` drives
//! internally, exercised here without a database.

use dbgate_postgres::{classify_non_rollbackable, classify_read_only, detect_statement_kind, split_statements};

#[test]
fn test_mixed_script_splits_and_classifies_each_statement() {
    let script = "SELECT * FROM users; \
                  INSERT INTO users (name) VALUES ('x'); \
                  WITH recent AS (SELECT * FROM orders) SELECT * FROM recent;";

    let split = split_statements(script);
    assert!(split.warnings.is_empty());
    assert_eq!(split.statements.len(), 3);

    let verdicts: Vec<bool> = split
        .statements
        .iter()
        .map(|s| classify_read_only(&s.text).is_read_only())
        .collect();
    assert_eq!(verdicts, vec![true, false, true]);

    let kinds: Vec<String> = split
        .statements
        .iter()
        .map(|s| detect_statement_kind(&s.text))
        .collect();
    assert_eq!(kinds, vec!["SELECT", "INSERT", "WITH SELECT"]);
}

#[test]
fn test_non_rollbackable_statement_is_flagged_and_classified_as_write() {
    let script = "VACUUM ANALYZE big_table;";
    let split = split_statements(script);
    assert_eq!(split.statements.len(), 1);

    let warnings = classify_non_rollbackable(&split.statements[0].text);
    assert!(!warnings.is_empty());
    assert!(dbgate_postgres::has_must_skip_warning(&warnings));

    // VACUUM is also a write keyword, so read-only mode would reject it
    // before the non-rollbackable check even runs.
    assert!(!classify_read_only(&split.statements[0].text).is_read_only());
}

#[test]
fn test_dollar_quoted_function_body_is_one_statement_and_stays_read_only_safe() {
    let script = "CREATE FUNCTION f() RETURNS int AS $$ BEGIN RETURN 1; END; $$ LANGUAGE plpgsql;";
    let split = split_statements(script);
    assert_eq!(split.statements.len(), 1);
    assert!(split.warnings.is_empty());
    assert!(!classify_read_only(&split.statements[0].text).is_read_only());
}

#[test]
fn test_unclosed_dollar_quote_is_a_fatal_warning() {
    let script = "SELECT 1; CREATE FUNCTION f() AS $$ BEGIN RETURN 1;";
    let split = split_statements(script);
    assert!(split.warnings.iter().any(|w| w.kind.is_fatal()));
}
