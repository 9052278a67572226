// SPDX-License-Identifier: Apache-2.0

//! Column-name heuristics for spotting sensitive data.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use veil_core::{PrivacyRule, TableMetadata};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SensitiveCategory {
    Name,
    Email,
    Password,
    CardNumber,
    Ssn,
}

impl SensitiveCategory {
    pub fn label(self) -> &'static str {
        match self {
            SensitiveCategory::Name => "NAME",
            SensitiveCategory::Email => "EMAIL",
            SensitiveCategory::Password => "PASSWORD",
            SensitiveCategory::CardNumber => "CARD_NUMBER",
            SensitiveCategory::Ssn => "SSN",
        }
    }

    fn pattern(self) -> &'static str {
        match self {
            SensitiveCategory::Name => r"(?i)(first|last|full)?_?names?|fullname",
            SensitiveCategory::Email => r"(?i)(email|phone|address|city|state|zip|country)",
            SensitiveCategory::Password => r"(?i)(password|secret|token|api_?key|api_?secret)",
            SensitiveCategory::CardNumber => r"(?i)card_(number|cvv|expiry|holder)",
            SensitiveCategory::Ssn => r"(?i)ssn",
        }
    }
}

/// Categories in matching order; the first match wins.
const CATEGORIES: [SensitiveCategory; 5] = [
    SensitiveCategory::Name,
    SensitiveCategory::Email,
    SensitiveCategory::Password,
    SensitiveCategory::CardNumber,
    SensitiveCategory::Ssn,
];

fn patterns() -> &'static [(SensitiveCategory, Regex)] {
    static PATTERNS: OnceLock<Vec<(SensitiveCategory, Regex)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        CATEGORIES
            .iter()
            .filter_map(|&category| Regex::new(category.pattern()).ok().map(|re| (category, re)))
            .collect()
    })
}

/// Category of a column name, if it looks sensitive.
pub fn detect(column: &str) -> Option<SensitiveCategory> {
    patterns()
        .iter()
        .find(|(_, re)| re.is_match(column))
        .map(|(category, _)| *category)
}

/// Rules for every column of `table` whose name looks sensitive.
pub fn suggest_rules(table: &TableMetadata) -> Vec<PrivacyRule> {
    table
        .columns
        .iter()
        .filter_map(|column| {
            detect(&column.name).map(|category| PrivacyRule {
                table: table.table.clone(),
                column: column.name.clone(),
                strategy: category.label().to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use veil_core::{ColumnMetadata, TableKind};

    use super::*;

    #[test]
    fn detects_categories_by_name() {
        assert_eq!(detect("first_name"), Some(SensitiveCategory::Name));
        assert_eq!(detect("EmailAddress"), Some(SensitiveCategory::Email));
        assert_eq!(detect("api_key"), Some(SensitiveCategory::Password));
        assert_eq!(detect("card_cvv"), Some(SensitiveCategory::CardNumber));
        assert_eq!(detect("customer_ssn"), Some(SensitiveCategory::Ssn));
        assert_eq!(detect("created_at"), None);
    }

    #[test]
    fn suggestions_use_category_labels() {
        let mut table = TableMetadata::new("public", "customers", TableKind::Table);
        table.columns = ["id", "full_name", "phone", "amount"]
            .into_iter()
            .map(|name| ColumnMetadata {
                name: name.to_string(),
                data_type: "text".into(),
                nullable: true,
                description: None,
            })
            .collect();

        let rules = suggest_rules(&table);
        let pairs: Vec<_> = rules
            .iter()
            .map(|r| (r.column.as_str(), r.strategy.as_str()))
            .collect();
        assert_eq!(pairs, vec![("full_name", "NAME"), ("phone", "EMAIL")]);
        assert!(rules.iter().all(|r| r.table == "customers"));
    }
}
