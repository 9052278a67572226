// SPDX-License-Identifier: Apache-2.0

//! Connection descriptors
//!
//! A descriptor fully identifies one backend connection. Descriptors are
//! hashable so the registry can key its handle cache on them.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{EngineError, EngineResult};
use crate::sensitive::Sensitive;

/// Identifies a backend connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "engine")]
pub enum ConnectionDescriptor {
    #[serde(rename = "sql")]
    Sql(SqlDescriptor),
    #[serde(rename = "snowflake")]
    Snowflake(SnowflakeDescriptor),
    #[serde(rename = "bigquery")]
    BigQuery(BigQueryDescriptor),
    #[serde(rename = "motherduck")]
    MotherDuck(MotherDuckDescriptor),
}

impl ConnectionDescriptor {
    /// Dialect name used for parsing and quoting.
    pub fn dialect(&self) -> &'static str {
        match self {
            Self::Sql(sql) => sql.dialect.name(),
            Self::Snowflake(_) => "snowflake",
            Self::BigQuery(_) => "bigquery",
            Self::MotherDuck(_) => "motherduck",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SqlDialect {
    #[serde(alias = "postgresql")]
    Postgres,
    Mysql,
    Sqlite,
}

impl SqlDialect {
    pub fn name(self) -> &'static str {
        match self {
            SqlDialect::Postgres => "postgresql",
            SqlDialect::Mysql => "mysql",
            SqlDialect::Sqlite => "sqlite",
        }
    }

    fn scheme(self) -> &'static str {
        match self {
            SqlDialect::Postgres => "postgres",
            SqlDialect::Mysql => "mysql",
            SqlDialect::Sqlite => "sqlite",
        }
    }

    pub fn default_port(self) -> Option<u16> {
        match self {
            SqlDialect::Postgres => Some(5432),
            SqlDialect::Mysql => Some(3306),
            SqlDialect::Sqlite => None,
        }
    }

    /// Detects the dialect from a connection URL scheme.
    pub fn from_url(url: &str) -> EngineResult<Self> {
        let scheme = url
            .split_once(':')
            .map(|(scheme, _)| scheme.to_ascii_lowercase())
            .ok_or_else(|| EngineError::validation("Connection URL has no scheme"))?;
        // driver suffixes such as `postgresql+psycopg2`
        let base = scheme.split('+').next().unwrap_or_default();
        match base {
            "postgres" | "postgresql" => Ok(SqlDialect::Postgres),
            "mysql" | "mariadb" => Ok(SqlDialect::Mysql),
            "sqlite" => Ok(SqlDialect::Sqlite),
            other => Err(EngineError::not_supported(format!(
                "Unsupported SQL backend scheme: {other}"
            ))),
        }
    }
}

/// Pool tuning knobs for connection-URL backends
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
    pub idle_timeout_secs: Option<u64>,
    /// Connections older than this are recycled.
    pub max_lifetime_secs: Option<u64>,
    /// Ping a pooled connection before handing it out.
    pub test_before_acquire: bool,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 0,
            acquire_timeout_secs: 30,
            idle_timeout_secs: Some(600),
            max_lifetime_secs: Some(3600),
            test_before_acquire: true,
        }
    }
}

/// Postgres, MySQL or SQLite reached through a connection URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SqlDescriptor {
    pub dialect: SqlDialect,
    pub url: Sensitive<String>,
    #[serde(default)]
    pub pool: PoolSettings,
}

impl SqlDescriptor {
    pub fn from_url(url: impl Into<String>) -> EngineResult<Self> {
        let url = url.into();
        let dialect = SqlDialect::from_url(&url)?;
        let url = match dialect {
            // the sqlx drivers only accept their canonical schemes
            SqlDialect::Postgres | SqlDialect::Mysql => normalize_scheme(&url, dialect.scheme()),
            SqlDialect::Sqlite => url,
        };
        Ok(Self {
            dialect,
            url: Sensitive::new(url),
            pool: PoolSettings::default(),
        })
    }

    /// Builds a URL from discrete parts, percent-encoding the credentials.
    pub fn from_parts(
        dialect: SqlDialect,
        host: &str,
        port: Option<u16>,
        username: &str,
        password: &str,
        database: &str,
    ) -> EngineResult<Self> {
        if dialect == SqlDialect::Sqlite {
            return Self::from_url(format!("sqlite:{database}"));
        }

        let base = format!("{}://{}", dialect.scheme(), host);
        let mut url =
            Url::parse(&base).map_err(|e| EngineError::validation(format!("Invalid host: {e}")))?;
        url.set_port(port.or(dialect.default_port()))
            .and_then(|_| url.set_username(username))
            .and_then(|_| url.set_password(Some(password).filter(|p| !p.is_empty())))
            .map_err(|_| EngineError::validation("Connection URL cannot carry credentials"))?;
        url.set_path(database);

        Ok(Self {
            dialect,
            url: Sensitive::new(url.to_string()),
            pool: PoolSettings::default(),
        })
    }

    pub fn with_pool(mut self, pool: PoolSettings) -> Self {
        self.pool = pool;
        self
    }

    /// True for `sqlite::memory:` style URLs, whose data lives in one connection.
    pub fn is_in_memory(&self) -> bool {
        self.dialect == SqlDialect::Sqlite && self.url.expose().contains(":memory:")
    }
}

fn normalize_scheme(url: &str, scheme: &str) -> String {
    match url.split_once("://") {
        Some((_, rest)) => format!("{scheme}://{rest}"),
        None => url.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SnowflakeTokenType {
    #[default]
    #[serde(rename = "OAUTH")]
    OAuth,
    #[serde(rename = "KEYPAIR_JWT")]
    KeypairJwt,
}

impl SnowflakeTokenType {
    pub fn header_value(self) -> &'static str {
        match self {
            SnowflakeTokenType::OAuth => "OAUTH",
            SnowflakeTokenType::KeypairJwt => "KEYPAIR_JWT",
        }
    }
}

/// Snowflake through its SQL API.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnowflakeDescriptor {
    pub account: String,
    pub token: Sensitive<String>,
    #[serde(default)]
    pub token_type: SnowflakeTokenType,
    pub database: String,
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub warehouse: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default = "default_statement_timeout")]
    pub statement_timeout_secs: u64,
    #[serde(default = "default_max_metadata_tables")]
    pub max_metadata_tables: usize,
    #[serde(default = "default_snowflake_concurrency")]
    pub metadata_concurrency: usize,
    /// Overrides `https://{account}.snowflakecomputing.com`.
    #[serde(default)]
    pub base_url: Option<String>,
}

impl SnowflakeDescriptor {
    pub fn new(account: impl Into<String>, database: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            token: Sensitive::new(token.into()),
            token_type: SnowflakeTokenType::default(),
            database: database.into(),
            schema: None,
            warehouse: None,
            role: None,
            statement_timeout_secs: default_statement_timeout(),
            max_metadata_tables: default_max_metadata_tables(),
            metadata_concurrency: default_snowflake_concurrency(),
            base_url: None,
        }
    }

    pub fn endpoint(&self) -> String {
        self.base_url
            .clone()
            .unwrap_or_else(|| format!("https://{}.snowflakecomputing.com", self.account))
    }
}

/// BigQuery through its REST API.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BigQueryDescriptor {
    pub project_id: String,
    pub access_token: Sensitive<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default = "default_statement_timeout")]
    pub statement_timeout_secs: u64,
    #[serde(default = "default_max_metadata_tables")]
    pub max_metadata_tables: usize,
    #[serde(default = "default_bigquery_concurrency")]
    pub metadata_concurrency: usize,
    /// Overrides `https://bigquery.googleapis.com/bigquery/v2`.
    #[serde(default)]
    pub base_url: Option<String>,
}

impl BigQueryDescriptor {
    pub fn new(project_id: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            access_token: Sensitive::new(access_token.into()),
            location: None,
            statement_timeout_secs: default_statement_timeout(),
            max_metadata_tables: default_max_metadata_tables(),
            metadata_concurrency: default_bigquery_concurrency(),
            base_url: None,
        }
    }

    pub fn endpoint(&self) -> String {
        self.base_url
            .clone()
            .unwrap_or_else(|| "https://bigquery.googleapis.com/bigquery/v2".to_string())
    }
}

/// MotherDuck, or a local DuckDB file when no token is given.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MotherDuckDescriptor {
    /// Database name on MotherDuck; a file path or `:memory:` locally.
    pub database: String,
    #[serde(default)]
    pub token: Option<Sensitive<String>>,
}

impl MotherDuckDescriptor {
    pub fn cloud(database: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            token: Some(Sensitive::new(token.into())),
        }
    }

    pub fn local(path: impl Into<String>) -> Self {
        Self {
            database: path.into(),
            token: None,
        }
    }

    /// The string handed to DuckDB's `open`. Contains the token when present.
    pub fn open_target(&self) -> String {
        match &self.token {
            Some(token) => format!("md:{}?motherduck_token={}", self.database, token.expose()),
            None => self.database.clone(),
        }
    }
}

fn default_statement_timeout() -> u64 {
    120
}

fn default_max_metadata_tables() -> usize {
    10_000
}

fn default_snowflake_concurrency() -> usize {
    20
}

fn default_bigquery_concurrency() -> usize {
    50
}
