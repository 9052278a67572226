// SPDX-License-Identifier: Apache-2.0

//! Assembles flat catalog rows into table snapshots.

use veil_core::{ColumnMetadata, MetadataProgress, TableKind, TableMetadata};

/// Schemas that never hold user data.
pub(crate) const SKIP_SCHEMAS: &[&str] = &[
    "information_schema",
    "pg_catalog",
    "pg_toast",
    "pg_internal",
    "sys",
    "mysql",
    "performance_schema",
];

pub(crate) fn is_system_schema(schema: &str) -> bool {
    let lower = schema.to_ascii_lowercase();
    SKIP_SCHEMAS.contains(&lower.as_str()) || lower.starts_with("pg_temp_")
}

/// SQL list literal of [`SKIP_SCHEMAS`], for `NOT IN` filters.
pub(crate) fn skip_schema_list() -> String {
    SKIP_SCHEMAS
        .iter()
        .map(|schema| format!("'{schema}'"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// One column of one table, as returned by a catalog query.
#[derive(Debug, Clone)]
pub(crate) struct CatalogRow {
    pub schema: String,
    pub table: String,
    pub kind: TableKind,
    pub table_comment: Option<String>,
    pub column: String,
    pub data_type: String,
    pub nullable: bool,
    pub column_comment: Option<String>,
}

pub(crate) fn table_kind(raw: &str) -> TableKind {
    let upper = raw.to_ascii_uppercase();
    if upper.contains("MATERIALIZED") || upper == "M" {
        TableKind::MaterializedView
    } else if upper.contains("VIEW") || upper == "V" {
        TableKind::View
    } else {
        TableKind::Table
    }
}

/// Empty comments are reported as absent.
pub(crate) fn comment(raw: Option<String>) -> Option<String> {
    raw.map(|c| c.trim().to_string()).filter(|c| !c.is_empty())
}

/// Groups rows sorted by (schema, table) into snapshots, reporting progress
/// once per table.
pub(crate) fn group_tables(
    rows: Vec<CatalogRow>,
    progress: Option<MetadataProgress<'_>>,
) -> Vec<TableMetadata> {
    let mut tables: Vec<TableMetadata> = Vec::new();
    for row in rows {
        if is_system_schema(&row.schema) {
            continue;
        }
        let same_table = tables
            .last()
            .is_some_and(|t| t.schema == row.schema && t.table == row.table);
        if !same_table {
            let mut table = TableMetadata::new(&row.schema, &row.table, row.kind);
            table.description = comment(row.table_comment.clone());
            tables.push(table);
        }
        if let Some(table) = tables.last_mut() {
            table.columns.push(ColumnMetadata {
                name: row.column,
                data_type: row.data_type,
                nullable: row.nullable,
                description: comment(row.column_comment),
            });
        }
    }

    report_all(&tables, progress);
    tables
}

pub(crate) fn report_all(tables: &[TableMetadata], progress: Option<MetadataProgress<'_>>) {
    if let Some(progress) = progress {
        let total = tables.len();
        for (index, table) in tables.iter().enumerate() {
            progress(index + 1, total, &table.table);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn row(schema: &str, table: &str, column: &str) -> CatalogRow {
        CatalogRow {
            schema: schema.into(),
            table: table.into(),
            kind: TableKind::Table,
            table_comment: Some("  ".into()),
            column: column.into(),
            data_type: "text".into(),
            nullable: true,
            column_comment: None,
        }
    }

    #[test]
    fn groups_consecutive_rows_and_skips_system_schemas() {
        let seen = Mutex::new(Vec::new());
        let progress = |current: usize, total: usize, name: &str| {
            seen.lock().unwrap().push(format!("{current}/{total} {name}"));
        };
        let tables = group_tables(
            vec![
                row("pg_catalog", "pg_class", "oid"),
                row("public", "users", "id"),
                row("public", "users", "email"),
                row("sales", "orders", "id"),
            ],
            Some(&progress),
        );

        assert_eq!(tables.len(), 2);
        assert_eq!(tables[0].columns.len(), 2);
        assert_eq!(tables[0].description, None);
        assert_eq!(*seen.lock().unwrap(), vec!["1/2 users", "2/2 orders"]);
    }

    #[test]
    fn kinds_from_catalog_labels() {
        assert_eq!(table_kind("BASE TABLE"), TableKind::Table);
        assert_eq!(table_kind("VIEW"), TableKind::View);
        assert_eq!(table_kind("m"), TableKind::MaterializedView);
        assert_eq!(table_kind("MATERIALIZED VIEW"), TableKind::MaterializedView);
    }
}
