//! SQL tokenizer and statement splitter (C2).
//!
//! A single linear scan over the raw script text that never needs a full SQL
//! grammar: it only has to find statement boundaries, track line numbers,
//! and not get confused by comments, quoted strings, or dollar-quoted
//! literals. Downstream classification (read-only check, non-rollbackable
//! detection) runs per statement on the slices this module produces.

use once_cell::sync::Lazy;
use regex::Regex;

/// One statement recovered from a script, with its source line number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitStatement {
    /// 1-based line number of the statement's first non-whitespace,
    /// non-comment character.
    pub line_number: usize,
    pub text: String,
}

/// A non-fatal (or, for a dollar-quote/string, fatal-in-execute-mode) issue
/// noticed while scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitWarning {
    pub kind: WarningKind,
    /// Line number where the offending construct opened.
    pub line_number: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningKind {
    UnclosedDollarQuote,
    UnclosedBlockComment,
    UnclosedString,
}

impl WarningKind {
    /// Fatal in `execute` mode per the Dry-Run/Script Executor contract.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            WarningKind::UnclosedDollarQuote | WarningKind::UnclosedString
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitResult {
    pub statements: Vec<SplitStatement>,
    pub warnings: Vec<SplitWarning>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Normal,
    LineComment,
    BlockComment,
    SingleQuote,
    DoubleQuote,
    DollarQuote,
}

/// Splits a raw SQL script into individual statements.
///
/// This is the only entry point; it owns the state machine described in
/// SPEC_FULL.md §4.2 (NORMAL / IN_LINE_COMMENT / IN_BLOCK_COMMENT with
/// nesting / IN_SQUOTE / IN_DQUOTE / IN_DOLLAR).
pub fn split_statements(input: &str) -> SplitResult {
    let chars: Vec<char> = input.chars().collect();
    let len = chars.len();

    let mut mode = Mode::Normal;
    let mut block_comment_depth: u32 = 0;
    let mut dollar_tag: String = String::new();
    let mut dollar_tag_progress: usize = 0;

    let mut line = 1usize;
    let mut stmt_start_line: Option<usize> = None;
    let mut opening_line: usize = 1;

    let mut current = String::new();
    let mut statements = Vec::new();
    let mut warnings = Vec::new();

    let mut i = 0usize;
    while i < len {
        let c = chars[i];

        if c == '\n' {
            line += 1;
        }

        match mode {
            Mode::Normal => {
                if stmt_start_line.is_none() && !c.is_whitespace() {
                    stmt_start_line = Some(line);
                }

                if c == '-' && i + 1 < len && chars[i + 1] == '-' {
                    mode = Mode::LineComment;
                    current.push(c);
                } else if c == '/' && i + 1 < len && chars[i + 1] == '*' {
                    mode = Mode::BlockComment;
                    block_comment_depth = 1;
                    opening_line = line;
                    current.push(c);
                    current.push(chars[i + 1]);
                    i += 1;
                } else if c == '\'' {
                    mode = Mode::SingleQuote;
                    opening_line = line;
                    current.push(c);
                } else if c == '"' {
                    mode = Mode::DoubleQuote;
                    opening_line = line;
                    current.push(c);
                } else if c == '$' {
                    if let Some((tag, tag_len)) = match_dollar_tag(&chars, i) {
                        mode = Mode::DollarQuote;
                        dollar_tag = tag;
                        dollar_tag_progress = 0;
                        opening_line = line;
                        current.push_str(&chars[i..i + tag_len].iter().collect::<String>());
                        i += tag_len - 1;
                    } else {
                        current.push(c);
                    }
                } else if c == ';' {
                    current.push(c);
                    let start = stmt_start_line.unwrap_or(line);
                    statements.push(SplitStatement {
                        line_number: start,
                        text: std::mem::take(&mut current),
                    });
                    stmt_start_line = None;
                } else {
                    current.push(c);
                }
            }
            Mode::LineComment => {
                current.push(c);
                if c == '\n' {
                    mode = Mode::Normal;
                }
            }
            Mode::BlockComment => {
                current.push(c);
                if c == '/' && i + 1 < len && chars[i + 1] == '*' {
                    block_comment_depth += 1;
                    current.push(chars[i + 1]);
                    i += 1;
                } else if c == '*' && i + 1 < len && chars[i + 1] == '/' {
                    block_comment_depth -= 1;
                    current.push(chars[i + 1]);
                    i += 1;
                    if block_comment_depth == 0 {
                        mode = Mode::Normal;
                    }
                }
            }
            Mode::SingleQuote => {
                current.push(c);
                if c == '\'' {
                    if i + 1 < len && chars[i + 1] == '\'' {
                        current.push(chars[i + 1]);
                        i += 1;
                    } else {
                        mode = Mode::Normal;
                    }
                }
            }
            Mode::DoubleQuote => {
                current.push(c);
                if c == '"' {
                    if i + 1 < len && chars[i + 1] == '"' {
                        current.push(chars[i + 1]);
                        i += 1;
                    } else {
                        mode = Mode::Normal;
                    }
                }
            }
            Mode::DollarQuote => {
                current.push(c);
                let tag_bytes: Vec<char> = dollar_tag.chars().collect();
                if c == tag_bytes[dollar_tag_progress] {
                    dollar_tag_progress += 1;
                    if dollar_tag_progress == tag_bytes.len() {
                        mode = Mode::Normal;
                        dollar_tag_progress = 0;
                    }
                } else {
                    dollar_tag_progress = if c == tag_bytes[0] { 1 } else { 0 };
                }
            }
        }

        i += 1;
    }

    match mode {
        Mode::BlockComment => warnings.push(SplitWarning {
            kind: WarningKind::UnclosedBlockComment,
            line_number: opening_line,
        }),
        Mode::SingleQuote | Mode::DoubleQuote => warnings.push(SplitWarning {
            kind: WarningKind::UnclosedString,
            line_number: opening_line,
        }),
        Mode::DollarQuote => warnings.push(SplitWarning {
            kind: WarningKind::UnclosedDollarQuote,
            line_number: opening_line,
        }),
        Mode::Normal | Mode::LineComment => {}
    }

    if !current.trim().is_empty() {
        let start = stmt_start_line.unwrap_or(line);
        statements.push(SplitStatement {
            line_number: start,
            text: current,
        });
    }

    SplitResult {
        statements: filter_executable(statements),
        warnings,
    }
}

/// Attempts to match a dollar-quote opening tag (`$tag$` or `$$`) starting
/// at `start`. Returns the tag text (including both `$`) and its length.
fn match_dollar_tag(chars: &[char], start: usize) -> Option<(String, usize)> {
    let mut j = start + 1;
    while j < chars.len() && (chars[j].is_alphanumeric() || chars[j] == '_') {
        j += 1;
    }
    if j < chars.len() && chars[j] == '$' {
        let tag: String = chars[start..=j].iter().collect();
        Some((tag.clone(), tag.len()))
    } else {
        None
    }
}

/// Strips leading comments (line and nested block) and whitespace from a
/// statement, tolerating an unclosed trailing block comment by returning
/// empty.
pub fn strip_leading_comments(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let len = chars.len();
    let mut i = 0usize;

    loop {
        while i < len && chars[i].is_whitespace() {
            i += 1;
        }
        if i + 1 < len && chars[i] == '-' && chars[i + 1] == '-' {
            while i < len && chars[i] != '\n' {
                i += 1;
            }
            continue;
        }
        if i + 1 < len && chars[i] == '/' && chars[i + 1] == '*' {
            let mut depth = 1u32;
            i += 2;
            while i < len && depth > 0 {
                if i + 1 < len && chars[i] == '/' && chars[i + 1] == '*' {
                    depth += 1;
                    i += 2;
                } else if i + 1 < len && chars[i] == '*' && chars[i + 1] == '/' {
                    depth -= 1;
                    i += 2;
                } else {
                    i += 1;
                }
            }
            if depth > 0 {
                return String::new();
            }
            continue;
        }
        break;
    }

    chars[i..].iter().collect()
}

/// Drops empty or comment-only statements.
fn filter_executable(statements: Vec<SplitStatement>) -> Vec<SplitStatement> {
    statements
        .into_iter()
        .filter(|s| !strip_leading_comments(&s.text).trim().is_empty())
        .collect()
}

const KEYWORD_ORDER: &[&str] = &[
    "SELECT", "INSERT", "UPDATE", "DELETE", "MERGE", "CREATE", "ALTER", "DROP", "TRUNCATE",
    "GRANT", "REVOKE", "EXPLAIN", "VACUUM", "ANALYZE", "REINDEX", "CLUSTER", "COPY", "WITH",
    "BEGIN", "COMMIT", "ROLLBACK", "SAVEPOINT", "SET", "SHOW", "DO", "CALL", "LOCK", "NOTIFY",
    "LISTEN", "UNLISTEN", "DISCARD", "RESET",
];

/// Detects the leading keyword of a statement per SPEC_FULL.md §4.2.
///
/// `WITH` is refined: `SELECT` anywhere in the remainder wins first, then
/// `INSERT`, then `UPDATE`, then `DELETE`; the kind becomes `WITH <keyword>`,
/// or bare `WITH` if none match. This rule is intentionally independent of
/// the read-only classifier's stricter AS-open-paren check for
/// data-modifying CTEs — see the module-level note in `crate::validator`
/// and DESIGN.md.
pub fn detect_statement_kind(text: &str) -> String {
    let stripped = strip_leading_comments(text);
    let upper = stripped.trim().to_uppercase();

    for keyword in KEYWORD_ORDER {
        if matches_keyword_prefix(&upper, keyword) {
            if *keyword == "WITH" {
                return refine_with_kind(&upper);
            }
            return keyword.to_string();
        }
    }

    "UNKNOWN".to_string()
}

fn matches_keyword_prefix(upper: &str, keyword: &str) -> bool {
    if !upper.starts_with(keyword) {
        return false;
    }
    match upper.as_bytes().get(keyword.len()) {
        None => true,
        Some(b) => matches!(b, b' ' | b'\t' | b'\n' | b'\r'),
    }
}

fn refine_with_kind(upper: &str) -> String {
    let remainder = &upper[4.min(upper.len())..];
    for kw in ["SELECT", "INSERT", "UPDATE", "DELETE"] {
        if find_word(remainder, kw).is_some() {
            return format!("WITH {kw}");
        }
    }
    "WITH".to_string()
}

fn find_word(haystack: &str, word: &str) -> Option<usize> {
    static WORD_BOUNDARY: Lazy<regex::Regex> = Lazy::new(|| Regex::new(r"\b").unwrap());
    let _ = &*WORD_BOUNDARY;
    let bytes = haystack.as_bytes();
    let wlen = word.len();
    let mut start = 0usize;
    while let Some(rel) = haystack[start..].find(word) {
        let pos = start + rel;
        let before_ok = pos == 0 || !bytes[pos - 1].is_ascii_alphanumeric() && bytes[pos - 1] != b'_';
        let after_ok = pos + wlen >= bytes.len()
            || (!bytes[pos + wlen].is_ascii_alphanumeric() && bytes[pos + wlen] != b'_');
        if before_ok && after_ok {
            return Some(pos);
        }
        start = pos + 1;
        if start >= haystack.len() {
            break;
        }
    }
    None
}

const TABLE_REF_KEYWORDS: &[&str] = &["FROM", "JOIN", "INTO", "UPDATE", "USING", "COPY", "TABLE"];

const TABLE_NAME_SKIP: &[&str] = &[
    "SELECT", "WHERE", "SET", "VALUES", "AND", "OR", "NOT", "NULL", "TRUE", "FALSE", "AS", "ON",
    "USING", "NATURAL", "CROSS", "INNER", "LEFT", "RIGHT", "FULL", "OUTER", "LATERAL",
];

static TABLE_REF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)\b(FROM|JOIN|INTO|UPDATE|DELETE\s{1,10}FROM|MERGE\s{1,10}INTO|USING|COPY|TABLE)\s{1,10}(["`]?\w+["`]?(?:\s{0,10}\.\s{0,10}["`]?\w+["`]?)?)"#,
    )
    .expect("valid regex")
});

/// Best-effort extraction of table names referenced by a statement, used
/// for hints shown to an agent — not a security boundary. Deduplicated by
/// lowercased `schema.name`, defaulting the schema to `public`.
pub fn extract_referenced_tables(text: &str) -> Vec<String> {
    let mut seen = std::collections::BTreeSet::new();
    let mut out = Vec::new();

    for cap in TABLE_REF.captures_iter(text) {
        let Some(ident_match) = cap.get(2) else { continue };
        let ident_raw = ident_match.as_str();
        let after = &text[ident_match.end()..];
        if after.trim_start().starts_with('(') {
            continue;
        }

        let cleaned = ident_raw.replace(['"', '`'], "");
        let upper_first = cleaned
            .split('.')
            .next()
            .unwrap_or("")
            .to_uppercase();
        if TABLE_NAME_SKIP.contains(&upper_first.as_str()) {
            continue;
        }

        let qualified = if cleaned.contains('.') {
            cleaned.to_lowercase()
        } else {
            format!("public.{}", cleaned.to_lowercase())
        };

        if seen.insert(qualified.clone()) {
            out.push(qualified);
        }
    }

    let _ = TABLE_REF_KEYWORDS;
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_simple_statements() {
        let result = split_statements("SELECT 1; SELECT 2;");
        assert_eq!(result.statements.len(), 2);
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_split_tracks_line_numbers() {
        let sql = "SELECT 1;\n\nSELECT 2;";
        let result = split_statements(sql);
        assert_eq!(result.statements[0].line_number, 1);
        assert_eq!(result.statements[1].line_number, 3);
    }

    #[test]
    fn test_split_semicolon_inside_string_literal() {
        let sql = "SELECT ';' ; SELECT 2;";
        let result = split_statements(sql);
        assert_eq!(result.statements.len(), 2);
    }

    #[test]
    fn test_split_doubled_quote_is_literal() {
        let sql = "SELECT 'it''s; fine';";
        let result = split_statements(sql);
        assert_eq!(result.statements.len(), 1);
    }

    #[test]
    fn test_split_dollar_quoted_body() {
        let sql = "CREATE FUNCTION f() RETURNS int AS $$ BEGIN RETURN 1; END; $$ LANGUAGE plpgsql;";
        let result = split_statements(sql);
        assert_eq!(result.statements.len(), 1);
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_split_tagged_dollar_quote() {
        let sql = "SELECT $tag$ a ; b $tag$;";
        let result = split_statements(sql);
        assert_eq!(result.statements.len(), 1);
    }

    #[test]
    fn test_split_nested_block_comment() {
        let sql = "/* outer /* inner */ still comment */ SELECT 1;";
        let result = split_statements(sql);
        assert_eq!(result.statements.len(), 1);
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_split_unclosed_block_comment_warns() {
        let sql = "SELECT 1; /* unterminated";
        let result = split_statements(sql);
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.warnings[0].kind, WarningKind::UnclosedBlockComment);
    }

    #[test]
    fn test_split_unclosed_string_warns() {
        let sql = "SELECT 'unterminated";
        let result = split_statements(sql);
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.warnings[0].kind, WarningKind::UnclosedString);
    }

    #[test]
    fn test_split_unclosed_dollar_quote_warns() {
        let sql = "SELECT $tag$ unterminated";
        let result = split_statements(sql);
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.warnings[0].kind, WarningKind::UnclosedDollarQuote);
        assert!(result.warnings[0].kind.is_fatal());
    }

    #[test]
    fn test_split_filters_comment_only_statements() {
        let sql = "-- just a comment\n;SELECT 1;";
        let result = split_statements(sql);
        assert_eq!(result.statements.len(), 1);
    }

    #[test]
    fn test_detect_statement_kind_simple() {
        assert_eq!(detect_statement_kind("SELECT * FROM t"), "SELECT");
        assert_eq!(detect_statement_kind("  insert into t values (1)"), "INSERT");
        assert_eq!(detect_statement_kind("-- c\nDELETE FROM t"), "DELETE");
    }

    #[test]
    fn test_detect_statement_kind_with_select() {
        assert_eq!(
            detect_statement_kind("WITH x AS (SELECT 1) SELECT * FROM x"),
            "WITH SELECT"
        );
    }

    #[test]
    fn test_detect_statement_kind_with_insert() {
        assert_eq!(
            detect_statement_kind("WITH x AS (INSERT INTO t DEFAULT VALUES RETURNING id) SELECT * FROM x"),
            "WITH SELECT"
        );
    }

    #[test]
    fn test_detect_statement_kind_bare_with() {
        assert_eq!(detect_statement_kind("WITH RECURSIVE x AS (VALUES (1))"), "WITH");
    }

    #[test]
    fn test_detect_statement_kind_unknown() {
        assert_eq!(detect_statement_kind("VACUUM t"), "VACUUM");
        assert_eq!(detect_statement_kind("frobnicate t"), "UNKNOWN");
    }

    #[test]
    fn test_extract_referenced_tables_basic() {
        let tables = extract_referenced_tables("SELECT * FROM users JOIN orders ON users.id = orders.user_id");
        assert!(tables.contains(&"public.users".to_string()));
        assert!(tables.contains(&"public.orders".to_string()));
    }

    #[test]
    fn test_extract_referenced_tables_qualified() {
        let tables = extract_referenced_tables("SELECT * FROM sales.orders");
        assert_eq!(tables, vec!["sales.orders".to_string()]);
    }

    #[test]
    fn test_extract_referenced_tables_skips_function_calls() {
        let tables = extract_referenced_tables("SELECT * FROM generate_series(1, 10)");
        assert!(tables.is_empty());
    }

    #[test]
    fn test_extract_referenced_tables_skips_keywords() {
        let tables = extract_referenced_tables("UPDATE t SET x = 1 WHERE y = 2");
        assert_eq!(tables, vec!["public.t".to_string()]);
    }

    #[test]
    fn test_strip_leading_comments_tolerates_unclosed() {
        assert_eq!(strip_leading_comments("/* unterminated"), "");
    }

    #[test]
    fn test_strip_leading_comments_nested() {
        assert_eq!(strip_leading_comments("/* a /* b */ c */ SELECT 1"), "SELECT 1");
    }
}
