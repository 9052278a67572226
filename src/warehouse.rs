// SPDX-License-Identifier: Apache-2.0

//! Warehouse facade
//!
//! Runs one request through the whole pipeline: gate, privacy rewrite,
//! bounded materialization, then pseudonymization of tagged cells.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};
use veil_core::{
    BackendDriver, EngineError, EngineResult, ExecutionResult, MetadataProgress, PrivacyRule,
    SamplePayload, SampleRequest, TableMetadata,
};
use veil_drivers::BackendHandle;
use veil_sql::RewriteOutcome;

use crate::config::VeilConfig;
use crate::gate::{self, QueryOutcome, QueryRequest};
use crate::materializer::{trim_to_cap, BoundedMaterializer, Collapse};
use crate::privacy::PrivacyCatalog;
use crate::pseudonym::PseudonymStore;

struct Privacy {
    catalog: Arc<dyn PrivacyCatalog>,
    store: Arc<PseudonymStore>,
}

pub struct Warehouse {
    driver: Arc<dyn BackendDriver>,
    materializer: BoundedMaterializer,
    config: VeilConfig,
    privacy: Option<Privacy>,
}

impl Warehouse {
    pub fn new(driver: Arc<dyn BackendDriver>, config: VeilConfig) -> Self {
        Self {
            driver,
            materializer: BoundedMaterializer::from_config(&config),
            config,
            privacy: None,
        }
    }

    pub fn from_handle(handle: &BackendHandle, config: VeilConfig) -> Self {
        Self::new(handle.driver(), config)
    }

    /// Enables role-based rewriting and tokenization of results.
    pub fn with_privacy(
        mut self,
        catalog: Arc<dyn PrivacyCatalog>,
        store: Arc<PseudonymStore>,
    ) -> Self {
        self.privacy = Some(Privacy { catalog, store });
        self
    }

    pub fn dialect(&self) -> &'static str {
        self.driver.dialect()
    }

    pub fn config(&self) -> &VeilConfig {
        &self.config
    }

    /// Executes a request, or reports why it did not run.
    ///
    /// Connection and execution failures are errors; a blocked or
    /// unconfirmed write is an outcome.
    #[instrument(skip(self, request), fields(dialect = self.dialect(), role = %request.role))]
    pub async fn execute(&self, request: QueryRequest) -> EngineResult<QueryOutcome> {
        if let Some(outcome) = gate::evaluate(&request, self.dialect()).into_outcome() {
            info!(?outcome, "Query not executed");
            return Ok(outcome);
        }

        let rules = self.rules_for(&request.role).await?;
        let rewrite = veil_sql::rewrite_sql_for(self.dialect(), &request.sql, &rules)?;
        if rewrite.is_rewritten() {
            debug!(sql = %rewrite.sql, "Applied privacy rules");
        }

        let collapse = star_collapse(self.dialect(), &rewrite);
        let mut result = self
            .materializer
            .materialize_collapsed(self.driver.as_ref(), &rewrite.sql, &collapse)
            .await?;

        if self.pseudonymize(&mut result.rows, &rules, &rewrite).await? > 0
            && trim_to_cap(&mut result.rows, self.materializer.max_bytes())
        {
            // tokens can be longer than the values they replace
            result.truncated = true;
            if result.count.is_some_and(|count| count < result.rows.len() as u64) {
                result.count = None;
            }
        }

        Ok(QueryOutcome::Executed(result))
    }

    /// Error-based form of [`Warehouse::execute`] using the configured policy.
    pub async fn query(&self, sql: &str, role: &str) -> EngineResult<ExecutionResult> {
        self.execute(QueryRequest::new(sql, role, self.config.write_policy))
            .await?
            .into_result()
    }

    /// Runs `SELECT 1` through the normal path.
    pub async fn test_connection(&self) -> EngineResult<()> {
        self.query("SELECT 1", "").await.map(|_| ())
    }

    pub async fn load_metadata(&self) -> EngineResult<Vec<TableMetadata>> {
        self.load_metadata_with_progress(None).await
    }

    #[instrument(skip(self, progress), fields(dialect = self.dialect()))]
    pub async fn load_metadata_with_progress(
        &self,
        progress: Option<MetadataProgress<'_>>,
    ) -> EngineResult<Vec<TableMetadata>> {
        let tables = self.driver.load_metadata_with_progress(progress).await?;
        info!(tables = tables.len(), "Metadata loaded");
        Ok(tables)
    }

    /// Random rows of one table, seen through `role`'s privacy rules.
    ///
    /// Sampling bypasses the gate. Failures are reported in the payload.
    #[instrument(skip(self), fields(dialect = self.dialect()))]
    pub async fn sample(&self, request: SampleRequest, role: &str) -> SamplePayload {
        if !request.is_addressable() {
            return SamplePayload::missing_target();
        }
        let requested = match request.limit {
            0 => self.config.default_sample_rows,
            n => n,
        };
        let request = SampleRequest {
            limit: requested.min(self.config.max_sample_rows),
            ..request
        };
        let limit = request.effective_limit();
        let sample_query = self.driver.sample_query(&request);

        match self.sample_rows(&sample_query, role).await {
            Ok((columns, rows)) => SamplePayload::data(sample_query, columns, rows, limit),
            Err(e) => {
                warn!(error = %e, table = %request.table, "Sample failed");
                SamplePayload::failed(e)
            }
        }
    }

    async fn sample_rows(
        &self,
        sample_query: &str,
        role: &str,
    ) -> EngineResult<(Vec<String>, Vec<veil_core::RowMap>)> {
        let rules = self.rules_for(role).await?;
        let rewrite = veil_sql::rewrite_sql_for(self.dialect(), sample_query, &rules)?;
        let mut result = self
            .materializer
            .materialize_collapsed(
                self.driver.as_ref(),
                &rewrite.sql,
                &star_collapse(self.dialect(), &rewrite),
            )
            .await?;
        self.pseudonymize(&mut result.rows, &rules, &rewrite).await?;
        Ok((result.column_names(), result.rows))
    }

    /// Tokens for `plaintexts`, consistent with those placed in query results.
    pub async fn tokenize_batch(&self, plaintexts: &[String]) -> EngineResult<HashMap<String, String>> {
        match &self.privacy {
            Some(privacy) => privacy.store.tokenize_batch(plaintexts).await,
            None => Err(EngineError::not_supported("No pseudonym store configured")),
        }
    }

    async fn rules_for(&self, role: &str) -> EngineResult<Vec<PrivacyRule>> {
        match &self.privacy {
            Some(privacy) => privacy.catalog.rules_for_role(role).await,
            None => Ok(Vec::new()),
        }
    }

    async fn pseudonymize(
        &self,
        rows: &mut [veil_core::RowMap],
        rules: &[PrivacyRule],
        rewrite: &RewriteOutcome,
    ) -> EngineResult<usize> {
        let Some(privacy) = &self.privacy else {
            return Ok(0);
        };
        if !rewrite.is_rewritten() || rows.is_empty() {
            return Ok(0);
        }
        privacy
            .store
            .pseudonymize_rows(rows, &strategy_labels(rules, rewrite))
            .await
    }
}

/// Encrypted columns of star-expanded aliases. The plaintext copy precedes
/// the tagged override in the result and must be dropped.
fn star_collapse(dialect: &str, rewrite: &RewriteOutcome) -> Collapse {
    Collapse::for_dialect(
        dialect,
        rewrite
            .encrypted
            .iter()
            .filter(|(alias, _)| rewrite.star_aliases.contains(alias))
            .flat_map(|(_, columns)| columns.iter().cloned()),
    )
}

/// Lower-cased encrypted column name to the strategy of its rule.
///
/// Result rows only carry output names, so two tables encrypting a column of
/// the same name under different strategies both render with the strategy of
/// the first matching rule.
fn strategy_labels(rules: &[PrivacyRule], rewrite: &RewriteOutcome) -> HashMap<String, String> {
    let mut labels = HashMap::new();
    for (_, columns) in &rewrite.encrypted {
        for column in columns {
            let lowered = column.to_ascii_lowercase();
            if labels.contains_key(&lowered) {
                continue;
            }
            if let Some(rule) = rules
                .iter()
                .find(|rule| rule.column.eq_ignore_ascii_case(column))
            {
                labels.insert(lowered, rule.strategy.clone());
            }
        }
    }
    labels
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(encrypted: &[(&str, &[&str])], star: &[&str]) -> RewriteOutcome {
        RewriteOutcome {
            sql: String::new(),
            encrypted: encrypted
                .iter()
                .map(|(alias, cols)| {
                    (alias.to_string(), cols.iter().map(|c| c.to_string()).collect())
                })
                .collect(),
            star_aliases: star.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn collapse_only_covers_star_aliases() {
        let rewrite = outcome(&[("u", &["email"]), ("o", &["card"])], &["u"]);
        let collapse = star_collapse("sqlite", &rewrite);
        assert!(!collapse.is_empty());
        assert!(star_collapse("sqlite", &outcome(&[("u", &["email"])], &[])).is_empty());
    }

    #[test]
    fn labels_follow_rule_strategies() {
        let rules = vec![
            PrivacyRule {
                table: "users".into(),
                column: "Email".into(),
                strategy: "EMAIL".into(),
            },
            PrivacyRule::encrypted("orders", "card"),
        ];
        let labels = strategy_labels(&rules, &outcome(&[("u", &["email"]), ("o", &["card"])], &[]));
        assert_eq!(labels["email"], "EMAIL");
        assert_eq!(labels["card"], "Encrypted");
    }

    #[test]
    fn shared_column_names_take_the_first_rule() {
        let rules = vec![
            PrivacyRule {
                table: "users".into(),
                column: "email".into(),
                strategy: "EMAIL".into(),
            },
            PrivacyRule {
                table: "leads".into(),
                column: "email".into(),
                strategy: "CONTACT".into(),
            },
        ];
        let labels = strategy_labels(
            &rules,
            &outcome(&[("u", &["email"]), ("l", &["email"])], &[]),
        );
        assert_eq!(labels.len(), 1);
        assert_eq!(labels["email"], "EMAIL");
    }
}
