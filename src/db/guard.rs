//! Keyword heuristic that keeps write statements away from the database.
//!
//! This is a textual check, not a SQL parser: a comment placed before a
//! keyword gets past it. Sessions are opened with
//! `default_transaction_read_only` as the second line of defence.

use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;

/// Statement prefixes that can modify data, schema, privileges or server state.
pub const WRITE_KEYWORDS: &[&str] = &[
    "delete",
    "insert",
    "update",
    "truncate",
    "create",
    "alter",
    "drop",
    "grant",
    "revoke",
    "lock",
    "vacuum",
    "copy",
    "refresh materialized view",
    "merge",
    "call",
    "do",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuardError {
    #[error("Write operation not permitted: {} statements are not allowed in read-only mode", .keyword.to_uppercase())]
    WriteOperation { keyword: String },
    #[error("Write operation not permitted: common table expression \"{cte}\" contains a {} statement", .keyword.to_uppercase())]
    WriteInCte { cte: String, keyword: String },
    #[error("Query is empty")]
    Empty,
}

static WITH_CLAUSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bwith\b").expect("valid WITH regex"));

// name [(col, ...)] AS [NOT] [MATERIALIZED] (
static CTE_HEAD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"("?[a-z_][a-z0-9_$]*"?)\s*(?:\([^()]*\))?\s+as\s+(?:not\s+)?(?:materialized\s+)?\("#)
        .expect("valid CTE regex")
});

static FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*```[a-zA-Z0-9_-]*\s*$").expect("valid fence regex"));

/// Removes markdown code fences and trailing semicolons, then trims.
pub fn clean_sql(raw: &str) -> String {
    let without_fences = FENCE.replace_all(raw, "");
    let mut cleaned = without_fences.trim().trim_matches('`').trim();
    while let Some(stripped) = cleaned.strip_suffix(';') {
        cleaned = stripped.trim_end();
    }
    cleaned.to_string()
}

/// Cleans `raw` and rejects it if it (or any CTE body) starts with a write keyword.
///
/// Returns the cleaned statement, which is what callers should execute.
pub fn ensure_read_only(raw: &str) -> Result<String, GuardError> {
    let cleaned = clean_sql(raw);
    if cleaned.is_empty() {
        return Err(GuardError::Empty);
    }

    let normalized = cleaned.to_lowercase();
    if let Some(keyword) = leading_write_keyword(&normalized) {
        return Err(GuardError::WriteOperation {
            keyword: keyword.to_string(),
        });
    }

    if WITH_CLAUSE.is_match(&normalized) {
        for captures in CTE_HEAD.captures_iter(&normalized) {
            let Some(whole) = captures.get(0) else {
                continue;
            };
            let body = &normalized[whole.end()..];
            if let Some(keyword) = leading_write_keyword(body) {
                let cte = captures
                    .get(1)
                    .map(|m| m.as_str().trim_matches('"').to_string())
                    .unwrap_or_default();
                return Err(GuardError::WriteInCte {
                    cte,
                    keyword: keyword.to_string(),
                });
            }
        }
    }

    Ok(cleaned)
}

pub fn is_read_only(raw: &str) -> bool {
    ensure_read_only(raw).is_ok()
}

fn leading_write_keyword(text: &str) -> Option<&'static str> {
    let text = text.trim_start();
    WRITE_KEYWORDS.iter().copied().find(|keyword| {
        text.strip_prefix(keyword)
            .and_then(|rest| rest.chars().next())
            .is_some_and(char::is_whitespace)
    })
}
