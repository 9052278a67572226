// SPDX-License-Identifier: Apache-2.0

//! Shared plumbing for the REST-based backends.

use std::time::Duration;

use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use veil_core::{EngineError, EngineResult};

pub(crate) fn build_client(timeout_secs: u64) -> EngineResult<Client> {
    Client::builder()
        .user_agent(concat!("veil/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(30))
        .timeout(Duration::from_secs(timeout_secs.max(1) + 30))
        .build()
        .map_err(|e| EngineError::internal(format!("Failed to build HTTP client: {e}")))
}

pub(crate) fn transport_error(e: reqwest::Error) -> EngineError {
    if e.is_timeout() {
        EngineError::connection_failed(format!("Request timed out: {e}"))
    } else {
        EngineError::connection_failed(e.to_string())
    }
}

/// Decodes a success body, or maps the status and error body to an engine error.
///
/// `message_of` extracts the backend's error message from a JSON error body.
pub(crate) async fn decode<T, F>(response: Response, message_of: F) -> EngineResult<T>
where
    T: DeserializeOwned,
    F: Fn(&serde_json::Value) -> Option<String>,
{
    let status = response.status();
    if status.is_success() {
        return response
            .json::<T>()
            .await
            .map_err(|e| EngineError::execution_error(format!("Malformed response: {e}")));
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|json| message_of(&json))
        .unwrap_or_else(|| format!("HTTP {status}: {}", truncate(&body, 500)));
    Err(status_error(status, message))
}

fn status_error(status: StatusCode, message: String) -> EngineError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => EngineError::auth_failed(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            EngineError::connection_failed(message)
        }
        s if s.is_server_error() => EngineError::connection_failed(message),
        _ if message.to_lowercase().contains("syntax") => EngineError::syntax_error(message),
        _ => EngineError::execution_error(message),
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
