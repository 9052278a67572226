// SPDX-License-Identifier: Apache-2.0

//! Veil backends
//!
//! Each backend implements [`veil_core::BackendDriver`]. The
//! [`ConnectionRegistry`] hands out shared [`BackendHandle`]s keyed by
//! connection descriptor.

mod catalog;
mod http;

pub mod bigquery;
pub mod handle;
pub mod motherduck;
pub mod registry;
pub mod snowflake;
pub mod sql;

pub use bigquery::BigQueryBackend;
pub use handle::BackendHandle;
pub use motherduck::MotherDuckBackend;
pub use registry::ConnectionRegistry;
pub use snowflake::SnowflakeBackend;
pub use sql::{SqlBackend, SqlPool};
