// SPDX-License-Identifier: Apache-2.0

//! Pseudonymization Store
//!
//! Maps each plaintext to a stable random token. The SHA-256 digest of the
//! plaintext is the key; the token is created on first sight and never
//! changes afterwards. A read-through cache sits in front of the repository.

pub mod repository;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use rand::Rng;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};
use veil_core::{EngineError, EngineResult, RowMap};
use veil_sql::ENCRYPTION_TAG;

pub use repository::{
    PostgresPseudonymRepository, PseudonymEntry, PseudonymRepository, SqlitePseudonymRepository,
};

const TOKEN_LENGTH: usize = 8;
const TOKEN_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
/// Insert rounds before giving up on hashes whose tokens keep colliding.
const MAX_INSERT_ATTEMPTS: usize = 4;

/// Label used when a column has no rule-specific strategy.
pub const DEFAULT_STRATEGY: &str = "Encrypted";

/// SHA-256 hex digest of `plaintext`.
pub fn content_hash(plaintext: &str) -> String {
    format!("{:x}", Sha256::digest(plaintext.as_bytes()))
}

fn random_token() -> String {
    let mut rng = rand::thread_rng();
    (0..TOKEN_LENGTH)
        .map(|_| TOKEN_CHARSET[rng.gen_range(0..TOKEN_CHARSET.len())] as char)
        .collect()
}

/// How a token is shown to callers.
pub fn render_token(strategy: &str, token: &str) -> String {
    format!("[{strategy}_{token}]")
}

pub struct PseudonymStore {
    repository: Arc<dyn PseudonymRepository>,
    /// hash -> token
    cache: RwLock<HashMap<String, String>>,
}

impl PseudonymStore {
    pub fn new(repository: Arc<dyn PseudonymRepository>) -> Self {
        Self {
            repository,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the token of every plaintext, creating missing ones in one
    /// batched write.
    #[instrument(skip(self, plaintexts), fields(count = plaintexts.len()))]
    pub async fn tokenize_batch(&self, plaintexts: &[String]) -> EngineResult<HashMap<String, String>> {
        let mut by_hash: HashMap<String, &str> = HashMap::new();
        for plaintext in plaintexts {
            by_hash
                .entry(content_hash(plaintext))
                .or_insert(plaintext.as_str());
        }

        let mut resolved: HashMap<String, String> = HashMap::with_capacity(by_hash.len());
        let mut missing: Vec<String> = Vec::new();
        {
            let cache = self.cache.read();
            for hash in by_hash.keys() {
                match cache.get(hash) {
                    Some(token) => {
                        resolved.insert(hash.clone(), token.clone());
                    }
                    None => missing.push(hash.clone()),
                }
            }
        }

        if !missing.is_empty() {
            let found = self.repository.find(&missing).await?;
            missing.retain(|hash| !found.contains_key(hash));
            self.remember(&found);
            resolved.extend(found);
        }

        let mut attempts = 0;
        while !missing.is_empty() {
            if attempts == MAX_INSERT_ATTEMPTS {
                return Err(EngineError::store(format!(
                    "Could not assign tokens to {} values",
                    missing.len()
                )));
            }
            attempts += 1;

            let entries: Vec<PseudonymEntry> = missing
                .iter()
                .map(|hash| PseudonymEntry {
                    hash: hash.clone(),
                    token: random_token(),
                })
                .collect();
            self.repository.insert_missing(&entries).await?;

            // re-read: a concurrent writer may have won, or a token collided
            let stored = self.repository.find(&missing).await?;
            missing.retain(|hash| !stored.contains_key(hash));
            if !missing.is_empty() {
                warn!(remaining = missing.len(), attempts, "Token collision; retrying");
            }
            self.remember(&stored);
            resolved.extend(stored);
        }

        debug!(values = by_hash.len(), "Tokenized batch");
        Ok(by_hash
            .into_iter()
            .filter_map(|(hash, plaintext)| {
                resolved
                    .get(&hash)
                    .map(|token| (plaintext.to_string(), token.clone()))
            })
            .collect())
    }

    fn remember(&self, entries: &HashMap<String, String>) {
        if entries.is_empty() {
            return;
        }
        let mut cache = self.cache.write();
        for (hash, token) in entries {
            cache.insert(hash.clone(), token.clone());
        }
    }

    /// Replaces every `ENCRYPT:`-tagged string cell with its rendered token.
    ///
    /// `strategies` maps lower-cased column names to their label; other
    /// columns use [`DEFAULT_STRATEGY`]. Untagged and non-string cells are
    /// left as they are.
    pub async fn pseudonymize_rows(
        &self,
        rows: &mut [RowMap],
        strategies: &HashMap<String, String>,
    ) -> EngineResult<usize> {
        let mut plaintexts = HashSet::new();
        for row in rows.iter() {
            for value in row.values() {
                collect_tagged(value, &mut plaintexts);
            }
        }
        if plaintexts.is_empty() {
            return Ok(0);
        }

        let plaintexts: Vec<String> = plaintexts.into_iter().collect();
        let tokens = self.tokenize_batch(&plaintexts).await?;

        let mut replaced = 0;
        for row in rows.iter_mut() {
            for (column, value) in row.iter_mut() {
                let strategy = strategies
                    .get(&column.to_ascii_lowercase())
                    .map_or(DEFAULT_STRATEGY, String::as_str);
                replaced += replace_tagged(value, strategy, &tokens);
            }
        }
        Ok(replaced)
    }
}

fn collect_tagged(value: &serde_json::Value, out: &mut HashSet<String>) {
    match value {
        serde_json::Value::String(s) => {
            if let Some(plaintext) = s.strip_prefix(ENCRYPTION_TAG) {
                out.insert(plaintext.to_string());
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                collect_tagged(item, out);
            }
        }
        _ => {}
    }
}

fn replace_tagged(
    value: &mut serde_json::Value,
    strategy: &str,
    tokens: &HashMap<String, String>,
) -> usize {
    match value {
        serde_json::Value::String(s) => {
            let token = s
                .strip_prefix(ENCRYPTION_TAG)
                .and_then(|plaintext| tokens.get(plaintext));
            match token {
                Some(token) => {
                    *s = render_token(strategy, token);
                    1
                }
                None => 0,
            }
        }
        serde_json::Value::Array(items) => items
            .iter_mut()
            .map(|item| replace_tagged(item, strategy, tokens))
            .sum(),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;

    async fn sqlite_store() -> PseudonymStore {
        let repo = SqlitePseudonymRepository::open("sqlite::memory:").await.unwrap();
        PseudonymStore::new(Arc::new(repo))
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn hashes_are_sha256_hex() {
        assert_eq!(
            content_hash("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn tokens_are_eight_uppercase_alphanumerics() {
        let token = random_token();
        assert_eq!(token.len(), TOKEN_LENGTH);
        assert!(token
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
    }

    #[tokio::test]
    async fn tokens_are_stable_across_calls() {
        let store = sqlite_store().await;
        let first = store.tokenize_batch(&strings(&["alice@example.com"])).await.unwrap();
        let second = store.tokenize_batch(&strings(&["alice@example.com"])).await.unwrap();
        assert_eq!(first, second);

        let third = store
            .tokenize_batch(&strings(&["bob@example.com", "alice@example.com"]))
            .await
            .unwrap();
        assert_eq!(third["alice@example.com"], first["alice@example.com"]);
        assert_ne!(third["bob@example.com"], first["alice@example.com"]);
    }

    #[tokio::test]
    async fn tokens_survive_a_fresh_cache() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("pseudonyms.db").display());

        let first = PseudonymStore::new(Arc::new(SqlitePseudonymRepository::open(&url).await.unwrap()))
            .tokenize_batch(&strings(&["secret"]))
            .await
            .unwrap();
        let second = PseudonymStore::new(Arc::new(SqlitePseudonymRepository::open(&url).await.unwrap()))
            .tokenize_batch(&strings(&["secret"]))
            .await
            .unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn concurrent_first_writers_agree() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("pseudonyms.db").display());
        let repo: Arc<dyn PseudonymRepository> =
            Arc::new(SqlitePseudonymRepository::open(&url).await.unwrap());

        let tasks: Vec<_> = (0..6)
            .map(|_| {
                let store = PseudonymStore::new(Arc::clone(&repo));
                tokio::spawn(async move { store.tokenize_batch(&strings(&["same"])).await })
            })
            .collect();

        let mut tokens = HashSet::new();
        for task in tasks {
            tokens.insert(task.await.unwrap().unwrap()["same"].clone());
        }
        assert_eq!(tokens.len(), 1);
    }

    /// Accepts nothing on the first insert, as if every token had collided.
    struct CollidingRepository {
        inner: SqlitePseudonymRepository,
        inserts: AtomicUsize,
    }

    #[async_trait]
    impl PseudonymRepository for CollidingRepository {
        async fn init_schema(&self) -> EngineResult<()> {
            self.inner.init_schema().await
        }

        async fn find(&self, hashes: &[String]) -> EngineResult<HashMap<String, String>> {
            self.inner.find(hashes).await
        }

        async fn insert_missing(&self, entries: &[PseudonymEntry]) -> EngineResult<()> {
            if self.inserts.fetch_add(1, Ordering::SeqCst) == 0 {
                return Ok(());
            }
            self.inner.insert_missing(entries).await
        }
    }

    #[tokio::test]
    async fn collisions_are_retried() {
        let repo = Arc::new(CollidingRepository {
            inner: SqlitePseudonymRepository::open("sqlite::memory:").await.unwrap(),
            inserts: AtomicUsize::new(0),
        });
        let store = PseudonymStore::new(repo.clone());
        let tokens = store.tokenize_batch(&strings(&["x"])).await.unwrap();

        assert_eq!(tokens.len(), 1);
        assert_eq!(repo.inserts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn only_tagged_strings_are_replaced() {
        let store = sqlite_store().await;
        let mut rows: Vec<RowMap> = vec![
            json!({"name": "ada", "email": "ENCRYPT:ada@example.com", "n": 1}),
            json!({"name": "bob", "email": "ENCRYPT:ada@example.com", "n": null}),
            json!({"name": "eve", "email": ["ENCRYPT:eve@example.com"], "n": 3}),
        ]
        .into_iter()
        .map(|v| v.as_object().cloned().unwrap())
        .collect();

        let mut strategies = HashMap::new();
        strategies.insert("email".to_string(), "EMAIL".to_string());
        let replaced = store.pseudonymize_rows(&mut rows, &strategies).await.unwrap();

        assert_eq!(replaced, 3);
        assert_eq!(rows[0]["name"], "ada");
        assert_eq!(rows[0]["n"], 1);
        let token = rows[0]["email"].as_str().unwrap();
        assert!(token.starts_with("[EMAIL_") && token.ends_with(']'));
        assert_eq!(token.len(), "[EMAIL_]".len() + TOKEN_LENGTH);
        assert_eq!(rows[1]["email"], rows[0]["email"]);
        assert!(rows[2]["email"][0].as_str().unwrap().starts_with("[EMAIL_"));
    }

    #[tokio::test]
    async fn rows_without_tags_skip_the_store() {
        let store = sqlite_store().await;
        let mut rows: Vec<RowMap> = vec![json!({"id": 1}).as_object().cloned().unwrap()];
        assert_eq!(store.pseudonymize_rows(&mut rows, &HashMap::new()).await.unwrap(), 0);
    }
}
