//! MongoDB Data API connector.
//!
//! Reads the `users`, `things` and `connections` collections through the
//! Atlas Data API (REST) for deployments that still expose it; the
//! [`mongodb`](super::mongodb) driver connector is the default. Pages are
//! sorted by `_id` so repeated scans see documents in the same order.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::connectors::common::{create_http_client, handle_http_error, validate_http_url};
use crate::connectors::{Collection, ExtractedBatch, SourceConnector};
use crate::error::{Error, Result};

/// Configuration for the MongoDB Data API source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DataApiConfig {
    /// MongoDB Data API endpoint URL.
    /// Format: https://data.mongodb-api.com/app/<app-id>/endpoint/data/v1
    pub data_api_url: String,
    /// MongoDB Data API key.
    pub api_key: String,
    /// Database name.
    #[serde(default = "default_database")]
    pub database: String,
    /// Data source (cluster) name.
    #[serde(default = "default_data_source")]
    pub data_source: String,
}

fn default_database() -> String {
    "diaform".to_string()
}

fn default_data_source() -> String {
    "mongodb-atlas".to_string()
}

/// Request body for the `find` action.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FindRequest<'a> {
    data_source: &'a str,
    database: &'a str,
    collection: &'a str,
    filter: serde_json::Value,
    sort: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    skip: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit: Option<u64>,
}

/// Response from the `find` action.
#[derive(Debug, Deserialize)]
struct FindResponse {
    documents: Vec<serde_json::Value>,
}

/// Request body for the `aggregate` action (used for counting).
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AggregateRequest<'a> {
    data_source: &'a str,
    database: &'a str,
    collection: &'a str,
    pipeline: Vec<serde_json::Value>,
}

/// Response from the `aggregate` action.
#[derive(Debug, Deserialize)]
struct AggregateResponse {
    documents: Vec<serde_json::Value>,
}

/// MongoDB Data API connector.
pub struct DataApiConnector {
    config: DataApiConfig,
    client: Client,
    connected: bool,
}

impl DataApiConnector {
    /// Creates a new MongoDB connector with configured HTTP client.
    pub fn new(config: DataApiConfig) -> Self {
        Self {
            config,
            client: create_http_client(),
            connected: false,
        }
    }

    /// Builds the API URL for a specific action.
    fn build_url(&self, action: &str) -> String {
        format!(
            "{}/action/{}",
            self.config.data_api_url.trim_end_matches('/'),
            action
        )
    }

    fn find_request<'a>(
        &'a self,
        collection: Collection,
        skip: Option<u64>,
        limit: u64,
    ) -> FindRequest<'a> {
        FindRequest {
            data_source: &self.config.data_source,
            database: &self.config.database,
            collection: collection.name(),
            filter: serde_json::json!({}),
            sort: serde_json::json!({ "_id": 1 }),
            skip,
            limit: Some(limit),
        }
    }

    /// Makes a POST request to the MongoDB Data API.
    async fn api_request<T: Serialize + Sync, R: for<'de> Deserialize<'de>>(
        &self,
        action: &str,
        body: &T,
    ) -> Result<R> {
        let url = self.build_url(action);

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("api-key", &self.config.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::SourceConnection(format!("MongoDB API request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());

            return Err(handle_http_error(status.as_u16(), &body, "MongoDB"));
        }

        response
            .json()
            .await
            .map_err(|e| Error::Extraction(format!("Failed to parse MongoDB response: {}", e)))
    }
}

#[async_trait]
impl SourceConnector for DataApiConnector {
    fn source_type(&self) -> &'static str {
        "mongodb_data_api"
    }

    async fn connect(&mut self) -> Result<()> {
        validate_http_url(&self.config.data_api_url)?;
        if self.config.api_key.is_empty() {
            return Err(Error::Config("MongoDB api_key is empty".to_string()));
        }

        // One small read so bad credentials fail before any phase starts
        let check = self.find_request(Collection::Users, None, 1);
        let _: FindResponse = self
            .api_request("find", &check)
            .await
            .map_err(|e| match e {
                Error::Authentication(_) | Error::RateLimit(_) => e,
                other => Error::SourceConnection(format!(
                    "Cannot reach MongoDB Data API at {}: {}",
                    self.config.data_api_url, other
                )),
            })?;

        self.connected = true;
        debug!(database = %self.config.database, "connected to MongoDB Data API");
        Ok(())
    }

    async fn count(&self, collection: Collection) -> Result<Option<u64>> {
        let request = AggregateRequest {
            data_source: &self.config.data_source,
            database: &self.config.database,
            collection: collection.name(),
            pipeline: vec![serde_json::json!({ "$count": "total" })],
        };

        let response: AggregateResponse = self.api_request("aggregate", &request).await?;

        // An empty collection yields no documents at all from `$count`
        Ok(Some(
            response
                .documents
                .first()
                .and_then(|doc| doc.get("total"))
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
        ))
    }

    async fn extract_batch(
        &self,
        collection: Collection,
        offset: Option<serde_json::Value>,
        batch_size: usize,
    ) -> Result<ExtractedBatch> {
        if !self.connected {
            return Err(Error::SourceConnection("Not connected".to_string()));
        }

        let skip = offset.and_then(|v| v.as_u64()).unwrap_or(0);
        let request = self.find_request(collection, Some(skip), batch_size as u64);
        let response: FindResponse = self.api_request("find", &request).await?;

        let fetched = response.documents.len() as u64;
        let has_more = fetched == batch_size as u64 && fetched > 0;
        let next_offset = has_more.then(|| serde_json::json!(skip + fetched));

        Ok(ExtractedBatch {
            documents: response.documents,
            next_offset,
            has_more,
        })
    }

    async fn close(&mut self) -> Result<()> {
        self.connected = false;
        Ok(())
    }
}

#[cfg(test)]
#[path = "data_api_tests.rs"]
mod tests;
