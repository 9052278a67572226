// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use veil::{
    BackendHandle, ColumnPrivacyCatalog, ConnectionDescriptor, EngineError, PrivacyRule,
    PseudonymStore, QueryOutcome, QueryRequest, SamplePayload, SampleRequest,
    SqlitePseudonymRepository, StaticRules, VeilConfig, Warehouse, WriteKind, WritePolicy,
};
use veil_core::{
    BackendDriver, EngineResult, MetadataProgress, SqlDescriptor, StreamEvent, StreamSender,
    TableMetadata,
};

const SEED: [&str; 3] = [
    "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL, email TEXT)",
    "INSERT INTO users (name, email) VALUES ('ada', 'ada@example.com'), ('bob', 'bob@example.com'), ('cy', NULL)",
    "CREATE TABLE orders (id INTEGER PRIMARY KEY, user_id INTEGER, total REAL)",
];

async fn sqlite_handle() -> BackendHandle {
    let descriptor = ConnectionDescriptor::Sql(SqlDescriptor::from_url("sqlite::memory:").unwrap());
    BackendHandle::connect(&descriptor).await.unwrap()
}

async fn seeded(privacy: Option<Vec<PrivacyRule>>) -> Warehouse {
    let handle = sqlite_handle().await;
    let mut warehouse = Warehouse::from_handle(&handle, VeilConfig::default());
    for sql in SEED {
        warehouse
            .execute(QueryRequest::new(sql, "", WritePolicy::SkipConfirmation))
            .await
            .unwrap();
    }
    if let Some(rules) = privacy {
        let repo = SqlitePseudonymRepository::open("sqlite::memory:").await.unwrap();
        warehouse = warehouse.with_privacy(
            Arc::new(StaticRules(rules)),
            Arc::new(PseudonymStore::new(Arc::new(repo))),
        );
    }
    warehouse
}

fn email_rule() -> Vec<PrivacyRule> {
    vec![PrivacyRule::encrypted("users", "email")]
}

fn is_token(value: &serde_json::Value) -> bool {
    value
        .as_str()
        .is_some_and(|s| s.starts_with("[Encrypted_") && s.ends_with(']') && s.len() == 20)
}

#[tokio::test]
async fn encrypted_columns_come_back_as_tokens() {
    let warehouse = seeded(Some(email_rule())).await;
    let result = warehouse
        .query("SELECT name, email FROM users ORDER BY id", "analyst")
        .await
        .unwrap();

    assert_eq!(result.count, Some(3));
    let names: Vec<_> = result.rows.iter().map(|r| r["name"].clone()).collect();
    assert_eq!(names, vec!["ada", "bob", "cy"]);
    assert!(is_token(&result.rows[0]["email"]));
    assert!(is_token(&result.rows[1]["email"]));
    assert_ne!(result.rows[0]["email"], result.rows[1]["email"]);
    assert!(result.rows[2]["email"].is_null());

    // the same plaintext always renders the same token
    let again = warehouse
        .query("SELECT email FROM users WHERE name = 'ada'", "analyst")
        .await
        .unwrap();
    assert_eq!(again.rows[0]["email"], result.rows[0]["email"]);
}

#[tokio::test]
async fn wildcard_queries_never_return_plaintext() {
    let warehouse = seeded(Some(email_rule())).await;
    let result = warehouse
        .query("SELECT * FROM users ORDER BY id", "analyst")
        .await
        .unwrap();

    let row = &result.rows[0];
    assert_eq!(row.len(), 3);
    assert_eq!(row["name"], "ada");
    assert!(is_token(&row["email"]));
    let serialized = serde_json::to_string(&result.rows).unwrap();
    assert!(!serialized.contains("@example.com"));
}

#[tokio::test]
async fn subqueries_under_a_wildcard_never_return_plaintext() {
    let warehouse = seeded(Some(email_rule())).await;
    for sql in [
        "WITH u AS (SELECT id, email FROM users) SELECT * FROM u ORDER BY id",
        "SELECT * FROM (SELECT id, email FROM users) AS s ORDER BY id",
        "SELECT * FROM users WHERE id IN (SELECT id FROM users WHERE email IS NOT NULL) ORDER BY id",
    ] {
        let result = warehouse.query(sql, "analyst").await.unwrap();
        assert!(is_token(&result.rows[0]["email"]), "{sql}");
        let serialized = serde_json::to_string(&result.rows).unwrap();
        assert!(!serialized.contains("@example.com"), "{sql}");
    }
}

#[tokio::test]
async fn roles_see_what_their_settings_allow() {
    let handle = sqlite_handle().await;
    let warehouse = Warehouse::from_handle(&handle, VeilConfig::default());
    for sql in SEED {
        warehouse
            .execute(QueryRequest::new(sql, "", WritePolicy::SkipConfirmation))
            .await
            .unwrap();
    }
    let catalog = ColumnPrivacyCatalog::default();
    catalog.set("users", "email", "llm", "Encrypted");
    catalog.set("users", "email", "admin", "Visible");
    let repo = SqlitePseudonymRepository::open("sqlite::memory:").await.unwrap();
    let warehouse = warehouse.with_privacy(
        Arc::new(catalog),
        Arc::new(PseudonymStore::new(Arc::new(repo))),
    );

    let sql = "SELECT email FROM users WHERE id = 1";
    let hidden = warehouse.query(sql, "llm").await.unwrap();
    let visible = warehouse.query(sql, "admin").await.unwrap();
    assert!(is_token(&hidden.rows[0]["email"]));
    assert_eq!(visible.rows[0]["email"], "ada@example.com");
}

#[tokio::test]
async fn confirm_policy_returns_the_exact_sql() {
    let warehouse = seeded(None).await;
    let sql = "DELETE FROM users WHERE id = 3";

    let outcome = warehouse
        .execute(QueryRequest::new(sql, "", WritePolicy::Confirm))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        QueryOutcome::NeedsConfirmation {
            kind: WriteKind::Delete,
            sql: sql.to_string(),
        }
    );

    // nothing ran
    let rows = warehouse.query("SELECT id FROM users", "").await.unwrap();
    assert_eq!(rows.count, Some(3));

    let confirmed = warehouse
        .execute(QueryRequest::new(sql, "", WritePolicy::Confirm).confirmed())
        .await
        .unwrap();
    assert!(confirmed.is_executed());
    let rows = warehouse.query("SELECT id FROM users", "").await.unwrap();
    assert_eq!(rows.count, Some(2));
}

#[tokio::test]
async fn error_form_of_the_confirmation_signal() {
    let warehouse = seeded(None).await;
    let err = warehouse
        .query("UPDATE users SET name = 'x'", "")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::WriteOperation { ref sql, .. } if sql == "UPDATE users SET name = 'x'"
    ));
}

#[tokio::test]
async fn ddl_yields_an_empty_result() {
    let warehouse = seeded(None).await;
    let outcome = warehouse
        .execute(QueryRequest::new(
            "CREATE TABLE audit (id INTEGER)",
            "",
            WritePolicy::SkipConfirmation,
        ))
        .await
        .unwrap();
    let result = outcome.into_result().unwrap();
    assert!(result.rows.is_empty());
    assert_eq!(result.count, Some(0));
    assert!(!result.truncated);
}

#[tokio::test]
async fn connection_test_and_metadata() {
    let warehouse = seeded(None).await;
    warehouse.test_connection().await.unwrap();

    let calls = AtomicUsize::new(0);
    let progress = |_: usize, _: usize, _: &str| {
        calls.fetch_add(1, Ordering::SeqCst);
    };
    let tables = warehouse
        .load_metadata_with_progress(Some(&progress))
        .await
        .unwrap();
    let names: Vec<_> = tables.iter().map(|t| t.table.as_str()).collect();
    assert_eq!(names, vec!["orders", "users"]);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn samples_go_through_privacy_rules() {
    let warehouse = seeded(Some(email_rule())).await;

    let payload = warehouse
        .sample(SampleRequest::new("main", "users", 50), "analyst")
        .await;
    let SamplePayload::Data {
        sample_size, data, ..
    } = payload
    else {
        panic!("expected data, got {payload:?}");
    };
    assert_eq!(sample_size, 3);
    for row in &data {
        assert!(row["email"].is_null() || is_token(&row["email"]));
    }

    let missing = warehouse
        .sample(SampleRequest::new("", "users", 5), "analyst")
        .await;
    assert!(missing.is_error());
}

#[tokio::test]
async fn tokenize_batch_matches_query_tokens() {
    let warehouse = seeded(Some(email_rule())).await;
    let result = warehouse
        .query("SELECT email FROM users WHERE id = 1", "analyst")
        .await
        .unwrap();
    let tokens = warehouse
        .tokenize_batch(&["ada@example.com".to_string()])
        .await
        .unwrap();
    assert_eq!(
        result.rows[0]["email"],
        format!("[Encrypted_{}]", tokens["ada@example.com"])
    );

    let plain = seeded(None).await;
    assert!(plain.tokenize_batch(&["x".to_string()]).await.is_err());
}

/// Counts every statement that reaches it.
#[derive(Default)]
struct CountingDriver {
    executed: AtomicUsize,
}

#[async_trait]
impl BackendDriver for CountingDriver {
    fn dialect(&self) -> &'static str {
        "postgresql"
    }

    async fn load_metadata_with_progress(
        &self,
        _progress: Option<MetadataProgress<'_>>,
    ) -> EngineResult<Vec<TableMetadata>> {
        Ok(Vec::new())
    }

    async fn execute_stream(&self, _sql: &str, sender: StreamSender) -> EngineResult<()> {
        self.executed.fetch_add(1, Ordering::SeqCst);
        let _ = sender.send(StreamEvent::Done(0)).await;
        Ok(())
    }
}

#[tokio::test]
async fn read_only_writes_never_reach_the_driver() {
    let driver = Arc::new(CountingDriver::default());
    let warehouse = Warehouse::new(driver.clone(), VeilConfig::default());

    for sql in [
        "DROP TABLE users",
        "INSERT INTO users VALUES (1)",
        "truncate table users",
        "SELECT 1; DELETE FROM users",
    ] {
        let outcome = warehouse
            .execute(QueryRequest::new(sql, "", WritePolicy::ReadOnly))
            .await
            .unwrap();
        assert!(matches!(outcome, QueryOutcome::Blocked { .. }), "{sql}");
    }
    assert_eq!(driver.executed.load(Ordering::SeqCst), 0);

    warehouse
        .execute(QueryRequest::new("SELECT 1", "", WritePolicy::ReadOnly))
        .await
        .unwrap();
    assert_eq!(driver.executed.load(Ordering::SeqCst), 1);
}
