// SPDX-License-Identifier: Apache-2.0

use sqlparser::dialect::{dialect_from_str, Dialect, DuckDbDialect, GenericDialect};

/// Parser dialect for a backend dialect name, falling back to the generic one.
pub fn parser_dialect(name: &str) -> Box<dyn Dialect> {
    match name.to_ascii_lowercase().as_str() {
        "motherduck" | "duckdb" => Box::new(DuckDbDialect {}),
        other => dialect_from_str(other).unwrap_or_else(|| Box::new(GenericDialect {})),
    }
}

/// Identifier quote character used when emitting SQL for a backend.
pub fn quote_char(name: &str) -> char {
    match name.to_ascii_lowercase().as_str() {
        "mysql" | "bigquery" => '`',
        _ => '"',
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlparser::parser::Parser;

    #[test]
    fn unknown_names_fall_back_to_generic() {
        let dialect = parser_dialect("teradata");
        assert!(Parser::parse_sql(dialect.as_ref(), "SELECT 1").is_ok());
    }

    #[test]
    fn backtick_dialects() {
        assert_eq!(quote_char("mysql"), '`');
        assert_eq!(quote_char("BigQuery"), '`');
        assert_eq!(quote_char("postgresql"), '"');
    }
}
