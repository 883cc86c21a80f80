//! Best-effort SQL introspection for span names and attributes.
//!
//! Nothing here parses SQL properly or fails: unrecognized input yields an
//! empty string.

/// Longest table name reported; anything longer is dropped.
pub const MAX_TABLE_NAME_LEN: usize = 50;

/// Operations whose driver-reported row counts are never recorded.
pub const ROW_COUNT_DENYLIST: [&str; 5] = ["BEGIN", "COMMIT", "ROLLBACK", "CONNECT", "PREPARE"];

/// Span name for statements with no recognizable operation.
pub const FALLBACK_SPAN_NAME: &str = "postgresql";

fn is_token_boundary(c: char) -> bool {
    c.is_whitespace() || c == '(' || c == ')'
}

/// First whitespace- or parenthesis-delimited token of the statement, uppercased.
///
/// ```rust
/// use pg_middleware::telemetry::sql::extract_operation_name;
/// assert_eq!(extract_operation_name("  \n SELECT * FROM users"), "SELECT");
/// assert_eq!(extract_operation_name("(select 1)"), "SELECT");
/// assert_eq!(extract_operation_name(""), "");
/// ```
#[must_use]
pub fn extract_operation_name(sql: &str) -> String {
    sql.trim()
        .split(is_token_boundary)
        .find(|token| !token.is_empty())
        .map(str::to_uppercase)
        .unwrap_or_default()
}

/// Table named after a leading `UPDATE`, or the first ` FROM ` / ` INTO `.
///
/// ```rust
/// use pg_middleware::telemetry::sql::extract_table_name;
/// assert_eq!(extract_table_name("SELECT * FROM users"), "users");
/// assert_eq!(extract_table_name("insert into ledger_entries (id) values ($1)"), "ledger_entries");
/// assert_eq!(extract_table_name("SELECT 1"), "");
/// ```
#[must_use]
pub fn extract_table_name(sql: &str) -> String {
    // Whitespace is flattened to ' ' first so keywords split across lines still
    // match; ASCII uppercasing keeps byte offsets aligned between the two copies.
    let spaced: String = sql
        .trim()
        .chars()
        .map(|c| if c.is_whitespace() { ' ' } else { c })
        .collect();
    let upper = spaced.to_ascii_uppercase();

    let start = if upper.starts_with("UPDATE ") {
        Some("UPDATE ".len())
    } else {
        [" FROM ", " INTO "]
            .iter()
            .filter_map(|keyword| upper.find(keyword).map(|idx| idx + keyword.len()))
            .min()
    };

    let Some(start) = start else {
        return String::new();
    };

    let name = spaced[start..]
        .split(|c: char| c.is_whitespace() || matches!(c, '(' | ')' | ',' | ';'))
        .find(|token| !token.is_empty())
        .unwrap_or_default()
        .trim_matches('"');

    if name.is_empty() || name.chars().count() > MAX_TABLE_NAME_LEN {
        return String::new();
    }
    name.to_string()
}

/// `"<OPERATION> <table>"`, `"<OPERATION>"`, or [`FALLBACK_SPAN_NAME`].
#[must_use]
pub fn span_name(operation: &str, table: &str) -> String {
    match (operation.is_empty(), table.is_empty()) {
        (true, _) => FALLBACK_SPAN_NAME.to_string(),
        (false, true) => operation.to_string(),
        (false, false) => format!("{operation} {table}"),
    }
}

#[must_use]
pub fn is_row_count_denylisted(operation: &str) -> bool {
    ROW_COUNT_DENYLIST.contains(&operation)
}

/// Saturate a row count into the `i32` range used by the row-count attribute.
#[must_use]
pub fn clamp_row_count(rows: u64) -> i32 {
    i32::try_from(rows).unwrap_or(i32::MAX)
}
