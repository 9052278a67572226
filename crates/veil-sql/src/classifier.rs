// SPDX-License-Identifier: Apache-2.0

//! Write-operation classifier
//!
//! Parses SQL and reports whether any statement mutates data or schema.
//! Parse failures fall back to a keyword prefix match so unparseable input
//! is never silently treated as a read.

use sqlparser::ast::Statement;
use sqlparser::parser::Parser;
use tracing::debug;
use veil_core::{WriteClassification, WriteKind};

use crate::analysis::{first_keyword, strip_leading_comments};
use crate::dialect::parser_dialect;

/// Classifies `sql` with the generic dialect.
pub fn classify(sql: &str) -> WriteClassification {
    classify_for("generic", sql)
}

/// Classifies `sql` for a backend dialect. The first write statement wins.
pub fn classify_for(dialect: &str, sql: &str) -> WriteClassification {
    let parser = parser_dialect(dialect);
    match Parser::parse_sql(parser.as_ref(), sql) {
        Ok(statements) if !statements.is_empty() => statements
            .iter()
            .find_map(statement_kind)
            .map(WriteClassification::write)
            .unwrap_or(WriteClassification::READ),
        Ok(_) => WriteClassification::READ,
        Err(e) => {
            debug!("Classifier falling back to keyword match: {}", e);
            classify_by_prefix(sql)
        }
    }
}

/// Write kind of a parsed statement, taken from its canonical rendering.
fn statement_kind(statement: &Statement) -> Option<WriteKind> {
    match statement {
        // data-modifying bodies behind a WITH clause render as the body itself
        Statement::Query(query) => leading_kind(&query.body.to_string()),
        other => leading_kind(&other.to_string()),
    }
}

fn leading_kind(rendered: &str) -> Option<WriteKind> {
    first_keyword(rendered).and_then(|keyword| WriteKind::from_keyword(&keyword))
}

fn classify_by_prefix(sql: &str) -> WriteClassification {
    leading_kind(strip_leading_comments(sql))
        .map(WriteClassification::write)
        .unwrap_or(WriteClassification::READ)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_each_write_family() {
        let cases = [
            ("DROP TABLE foo", WriteKind::Drop),
            ("create table t (id int)", WriteKind::Create),
            ("INSERT INTO t (a) VALUES (1)", WriteKind::Insert),
            ("UPDATE t SET a = 1 WHERE id = 2", WriteKind::Update),
            ("DELETE FROM t WHERE id = 2", WriteKind::Delete),
            ("ALTER TABLE t ADD COLUMN b INT", WriteKind::Alter),
            ("TRUNCATE TABLE t", WriteKind::Truncate),
        ];
        for (sql, kind) in cases {
            assert_eq!(classify(sql), WriteClassification::write(kind), "{sql}");
        }
    }

    #[test]
    fn reads_are_not_writes() {
        assert_eq!(classify("SELECT 1"), WriteClassification::READ);
        assert_eq!(
            classify("WITH recent AS (SELECT * FROM orders) SELECT count(*) FROM recent"),
            WriteClassification::READ
        );
        assert_eq!(classify("SELECT 'DROP TABLE x' AS s"), WriteClassification::READ);
    }

    #[test]
    fn dialect_specific_writes() {
        assert_eq!(
            classify_for("mysql", "REPLACE INTO t (id) VALUES (1)"),
            WriteClassification::write(WriteKind::Replace)
        );
        assert_eq!(
            classify_for(
                "snowflake",
                "MERGE INTO t USING s ON t.id = s.id WHEN MATCHED THEN UPDATE SET t.a = s.a"
            ),
            WriteClassification::write(WriteKind::Merge)
        );
    }

    #[test]
    fn first_write_in_a_batch_wins() {
        assert_eq!(
            classify("SELECT 1; DELETE FROM t; DROP TABLE t"),
            WriteClassification::write(WriteKind::Delete)
        );
    }

    #[test]
    fn unparseable_input_uses_prefix_match() {
        assert_eq!(
            classify("-- cleanup\nDROP TABLE ??? garbage"),
            WriteClassification::write(WriteKind::Drop)
        );
        assert_eq!(
            classify("LOAD DATA whatever ((("),
            WriteClassification::write(WriteKind::Load)
        );
        assert_eq!(classify("SELEC 1 FROM"), WriteClassification::READ);
    }
}
