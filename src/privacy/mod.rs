// SPDX-License-Identifier: Apache-2.0

//! Privacy rules
//!
//! A [`PrivacyCatalog`] tells the facade which columns a role may not see in
//! plaintext. The rules feed the SQL rewriter for one execution and are never
//! modified by it.

pub mod patterns;

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use veil_core::{EngineResult, PrivacyRule};

pub use patterns::{detect, suggest_rules, SensitiveCategory};

/// Source of the rules active for a role.
#[async_trait]
pub trait PrivacyCatalog: Send + Sync {
    async fn rules_for_role(&self, role: &str) -> EngineResult<Vec<PrivacyRule>>;
}

/// The same rules for every role.
#[derive(Debug, Clone, Default)]
pub struct StaticRules(pub Vec<PrivacyRule>);

#[async_trait]
impl PrivacyCatalog for StaticRules {
    async fn rules_for_role(&self, _role: &str) -> EngineResult<Vec<PrivacyRule>> {
        Ok(self.0.clone())
    }
}

/// Settings that leave a column in plaintext.
const VISIBLE_SETTINGS: [&str; 2] = ["Visible", "Default"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnPrivacy {
    pub name: String,
    /// Role name to setting, e.g. `{"llm": "Encrypted"}`
    #[serde(default)]
    pub privacy: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TablePrivacy {
    pub name: String,
    #[serde(default)]
    pub columns: Vec<ColumnPrivacy>,
}

/// Rules derived from per-column role settings. Any setting other than
/// `Visible` or `Default` hides the column from that role.
#[derive(Debug, Default)]
pub struct ColumnPrivacyCatalog {
    tables: RwLock<Vec<TablePrivacy>>,
}

impl ColumnPrivacyCatalog {
    pub fn new(tables: Vec<TablePrivacy>) -> Self {
        Self {
            tables: RwLock::new(tables),
        }
    }

    /// Replaces the settings, e.g. after a catalog sync.
    pub fn replace(&self, tables: Vec<TablePrivacy>) {
        *self.tables.write() = tables;
    }

    /// Sets one column's setting for one role, adding the table or column if needed.
    pub fn set(&self, table: &str, column: &str, role: &str, setting: &str) {
        let mut tables = self.tables.write();
        let index = match tables.iter().position(|t| t.name == table) {
            Some(index) => index,
            None => {
                tables.push(TablePrivacy {
                    name: table.to_string(),
                    columns: Vec::new(),
                });
                tables.len() - 1
            }
        };
        let columns = &mut tables[index].columns;
        let column_index = match columns.iter().position(|c| c.name == column) {
            Some(index) => index,
            None => {
                columns.push(ColumnPrivacy {
                    name: column.to_string(),
                    privacy: HashMap::new(),
                });
                columns.len() - 1
            }
        };
        columns[column_index]
            .privacy
            .insert(role.to_string(), setting.to_string());
    }

    pub fn rules(&self, role: &str) -> Vec<PrivacyRule> {
        let tables = self.tables.read();
        tables
            .iter()
            .filter(|t| !t.name.is_empty())
            .flat_map(|table| {
                table.columns.iter().filter_map(move |column| {
                    let setting = column.privacy.get(role)?;
                    if setting.is_empty() || VISIBLE_SETTINGS.contains(&setting.as_str()) {
                        return None;
                    }
                    Some(PrivacyRule::encrypted(&table.name, &column.name))
                })
            })
            .collect()
    }
}

#[async_trait]
impl PrivacyCatalog for ColumnPrivacyCatalog {
    async fn rules_for_role(&self, role: &str) -> EngineResult<Vec<PrivacyRule>> {
        Ok(self.rules(role))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> ColumnPrivacyCatalog {
        let tables: Vec<TablePrivacy> = serde_json::from_str(
            r#"[
                {"name": "users", "columns": [
                    {"name": "email", "privacy": {"llm": "Encrypted", "admin": "Visible"}},
                    {"name": "name", "privacy": {"llm": "Default"}},
                    {"name": "id"}
                ]},
                {"name": "orders", "columns": [
                    {"name": "card", "privacy": {"llm": "Masked"}}
                ]}
            ]"#,
        )
        .unwrap();
        ColumnPrivacyCatalog::new(tables)
    }

    #[tokio::test]
    async fn only_hidden_settings_become_rules() {
        let catalog = catalog();
        let rules = catalog.rules_for_role("llm").await.unwrap();
        assert_eq!(
            rules,
            vec![
                PrivacyRule::encrypted("users", "email"),
                PrivacyRule::encrypted("orders", "card"),
            ]
        );
        assert!(catalog.rules_for_role("admin").await.unwrap().is_empty());
        assert!(catalog.rules_for_role("unknown").await.unwrap().is_empty());
    }

    #[test]
    fn set_adds_and_overrides() {
        let catalog = catalog();
        catalog.set("users", "email", "llm", "Visible");
        catalog.set("payments", "iban", "llm", "Encrypted");
        assert_eq!(
            catalog.rules("llm"),
            vec![
                PrivacyRule::encrypted("orders", "card"),
                PrivacyRule::encrypted("payments", "iban"),
            ]
        );
    }
}
