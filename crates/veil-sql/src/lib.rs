// SPDX-License-Identifier: Apache-2.0

//! SQL analysis shared by the gate, the drivers and the privacy layer.

pub mod analysis;
pub mod classifier;
pub mod dialect;
pub mod rewrite;

pub use analysis::{count_query, is_select_prefix, returns_rows, strip_trailing_semicolons};
pub use classifier::{classify, classify_for};
pub use dialect::parser_dialect;
pub use rewrite::{rewrite_sql, rewrite_sql_for, RewriteOutcome, ENCRYPTION_TAG};
