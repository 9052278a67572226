// SPDX-License-Identifier: Apache-2.0

//! Lightweight statement analysis used by drivers and the materializer.

use sqlparser::ast::Statement;
use sqlparser::parser::{Parser, ParserError};

use crate::dialect::parser_dialect;

const ROW_RETURNING_KEYWORDS: &[&str] = &[
    "SELECT", "WITH", "VALUES", "SHOW", "DESCRIBE", "DESC", "EXPLAIN", "PRAGMA", "TABLE", "FROM",
];

/// Whether every statement in `sql` produces a result set.
///
/// Callers fall back to [`is_select_prefix`] when parsing fails.
pub fn returns_rows(dialect: &str, sql: &str) -> Result<bool, ParserError> {
    let dialect = parser_dialect(dialect);
    let statements = Parser::parse_sql(dialect.as_ref(), sql)?;
    Ok(statements.last().is_some_and(statement_returns_rows))
}

fn statement_returns_rows(statement: &Statement) -> bool {
    if matches!(statement, Statement::Query(_)) {
        return true;
    }
    let rendered = statement.to_string();
    if rendered.to_ascii_uppercase().contains(" RETURNING ") {
        return true;
    }
    first_keyword(&rendered).is_some_and(|keyword| ROW_RETURNING_KEYWORDS.contains(&keyword.as_str()))
}

/// Prefix check used when the parser rejects a statement.
pub fn is_select_prefix(sql: &str) -> bool {
    first_keyword(strip_leading_comments(sql))
        .is_some_and(|keyword| ROW_RETURNING_KEYWORDS.contains(&keyword.as_str()))
}

/// Upper-cased first word of `sql`, ignoring opening parentheses.
pub(crate) fn first_keyword(sql: &str) -> Option<String> {
    sql.trim_start_matches(|c: char| c.is_whitespace() || c == '(')
        .split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .next()
        .filter(|word| !word.is_empty())
        .map(|word| word.to_ascii_uppercase())
}

/// Skips whitespace, `-- line` and `/* block */` comments at the start of `sql`.
pub(crate) fn strip_leading_comments(sql: &str) -> &str {
    let mut rest = sql.trim_start();
    loop {
        if let Some(after) = rest.strip_prefix("--") {
            rest = after.split_once('\n').map(|(_, tail)| tail).unwrap_or("").trim_start();
        } else if let Some(after) = rest.strip_prefix("/*") {
            rest = after.split_once("*/").map(|(_, tail)| tail).unwrap_or("").trim_start();
        } else {
            return rest;
        }
    }
}

/// Removes trailing whitespace and statement terminators.
pub fn strip_trailing_semicolons(sql: &str) -> &str {
    sql.trim_end_matches(|c: char| c.is_whitespace() || c == ';')
}

/// Wraps `sql` in a total-count query.
pub fn count_query(sql: &str) -> String {
    format!("SELECT COUNT(*) FROM ({}) AS _", strip_trailing_semicolons(sql.trim()))
}
