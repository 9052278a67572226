// SPDX-License-Identifier: Apache-2.0

//! Closed set of live backends.

use std::sync::Arc;

use veil_core::{BackendDriver, ConnectionDescriptor, EngineResult};

use crate::bigquery::BigQueryBackend;
use crate::motherduck::MotherDuckBackend;
use crate::snowflake::SnowflakeBackend;
use crate::sql::SqlBackend;

/// A connected backend. Cloning shares the underlying pool or client.
#[derive(Clone)]
pub enum BackendHandle {
    Sql(Arc<SqlBackend>),
    Snowflake(Arc<SnowflakeBackend>),
    BigQuery(Arc<BigQueryBackend>),
    MotherDuck(Arc<MotherDuckBackend>),
}

impl BackendHandle {
    /// Opens the backend a descriptor points at.
    pub async fn connect(descriptor: &ConnectionDescriptor) -> EngineResult<Self> {
        Ok(match descriptor {
            ConnectionDescriptor::Sql(d) => Self::Sql(Arc::new(SqlBackend::connect(d).await?)),
            ConnectionDescriptor::Snowflake(d) => {
                Self::Snowflake(Arc::new(SnowflakeBackend::connect(d).await?))
            }
            ConnectionDescriptor::BigQuery(d) => {
                Self::BigQuery(Arc::new(BigQueryBackend::connect(d).await?))
            }
            ConnectionDescriptor::MotherDuck(d) => {
                Self::MotherDuck(Arc::new(MotherDuckBackend::connect(d).await?))
            }
        })
    }

    /// The backend as a trait object, for code that does not care which it is.
    pub fn driver(&self) -> Arc<dyn BackendDriver> {
        match self {
            Self::Sql(b) => b.clone(),
            Self::Snowflake(b) => b.clone(),
            Self::BigQuery(b) => b.clone(),
            Self::MotherDuck(b) => b.clone(),
        }
    }

    pub fn dialect(&self) -> &'static str {
        match self {
            Self::Sql(b) => b.dialect(),
            Self::Snowflake(b) => b.dialect(),
            Self::BigQuery(b) => b.dialect(),
            Self::MotherDuck(b) => b.dialect(),
        }
    }

    /// Whether two handles share the same connection.
    pub fn same_backend(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Sql(a), Self::Sql(b)) => Arc::ptr_eq(a, b),
            (Self::Snowflake(a), Self::Snowflake(b)) => Arc::ptr_eq(a, b),
            (Self::BigQuery(a), Self::BigQuery(b)) => Arc::ptr_eq(a, b),
            (Self::MotherDuck(a), Self::MotherDuck(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub async fn close(&self) {
        match self {
            Self::Sql(b) => b.close().await,
            Self::Snowflake(b) => b.close().await,
            Self::BigQuery(b) => b.close().await,
            Self::MotherDuck(b) => b.close().await,
        }
    }
}
