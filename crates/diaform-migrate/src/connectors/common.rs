//! Common utilities shared across connectors.

use crate::error::{Error, Result};
use reqwest::Client;
use std::time::Duration;

/// Default HTTP timeout for all connectors.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum size of a JSON dump accepted by the file connector (1GB).
pub const MAX_FILE_SIZE: u64 = 1024 * 1024 * 1024;

/// Creates a configured HTTP client with timeout.
#[must_use]
pub fn create_http_client() -> Client {
    Client::builder()
        .timeout(DEFAULT_TIMEOUT)
        .connect_timeout(Duration::from_secs(10))
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// Validates an HTTP(S) endpoint URL.
pub fn validate_http_url(url: &str) -> Result<()> {
    let has_valid_scheme = ["http://", "https://"].iter().any(|s| url.starts_with(s));
    if !has_valid_scheme {
        return Err(Error::Config(format!(
            "Invalid URL scheme in '{}'. Allowed: http, https",
            url
        )));
    }

    let host = url.split("://").nth(1).unwrap_or_default();
    if host.is_empty() || host.starts_with('/') {
        return Err(Error::Config(format!("Invalid URL format: {}", url)));
    }

    Ok(())
}

/// Maps an HTTP error response onto the error taxonomy.
pub fn handle_http_error(status_code: u16, body: &str, source_name: &str) -> Error {
    match status_code {
        429 => Error::RateLimit(60),
        401 | 403 => Error::Authentication(format!("{} auth failed: {}", source_name, body)),
        _ => Error::SourceConnection(format!("{} error {}: {}", source_name, status_code, body)),
    }
}

/// Renders a MongoDB identifier, unwrapping extended JSON `{"$oid": ...}`.
pub fn document_id(doc: &serde_json::Value) -> Option<String> {
    doc.get("_id").map(|v| match v {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Object(obj) => obj
            .get("$oid")
            .and_then(|v| v.as_str())
            .map(String::from)
            .unwrap_or_else(|| v.to_string()),
        _ => v.to_string(),
    })
}
