//! MongoDB driver connector.
//!
//! Connects with a `mongodb://` or `mongodb+srv://` connection string, the
//! form `DIAFORM_DATABASE` has always held. Pages come from `find` sorted by
//! `_id`, so repeated scans see documents in the same order. Documents are
//! handed on as relaxed extended JSON (`{"$oid": ...}` for object ids).

use ::mongodb::bson::{doc, Bson, Document};
use ::mongodb::error::ErrorKind;
use ::mongodb::options::ClientOptions;
use ::mongodb::{Client, Database};
use async_trait::async_trait;
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::connectors::{Collection, ExtractedBatch, SourceConnector};
use crate::error::{Error, Result};

/// Connection string schemes the driver accepts.
pub const URI_SCHEMES: [&str; 2] = ["mongodb://", "mongodb+srv://"];

/// Configuration for the MongoDB driver source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MongoDBConfig {
    /// Connection string, e.g. `mongodb://localhost:27017`.
    pub uri: String,
    /// Database name.
    #[serde(default = "default_database")]
    pub database: String,
}

fn default_database() -> String {
    "diaform".to_string()
}

/// True if `uri` uses a MongoDB connection string scheme.
pub fn is_mongodb_uri(uri: &str) -> bool {
    URI_SCHEMES.iter().any(|scheme| uri.starts_with(scheme))
}

/// Validates a MongoDB connection string.
pub fn validate_uri(uri: &str) -> Result<()> {
    let host = URI_SCHEMES
        .iter()
        .find_map(|scheme| uri.strip_prefix(scheme))
        .ok_or_else(|| {
            Error::Config(format!(
                "Invalid MongoDB URI scheme in '{}'. Allowed: mongodb, mongodb+srv",
                redact_uri(uri)
            ))
        })?;
    if host.is_empty() || host.starts_with('/') {
        return Err(Error::Config(format!(
            "MongoDB URI has no host: {}",
            redact_uri(uri)
        )));
    }
    Ok(())
}

/// Hides the credentials of a connection string.
pub fn redact_uri(uri: &str) -> String {
    let Some((scheme, rest)) = uri.split_once("://") else {
        return uri.to_string();
    };
    let authority_end = rest.find('/').unwrap_or(rest.len());
    match rest[..authority_end].rfind('@') {
        Some(at) => format!("{}://***@{}", scheme, &rest[at + 1..]),
        None => uri.to_string(),
    }
}

fn driver_error(error: ::mongodb::error::Error) -> Error {
    match error.kind.as_ref() {
        ErrorKind::Authentication { .. } => {
            Error::Authentication(format!("MongoDB auth failed: {}", error))
        }
        ErrorKind::InvalidArgument { .. } => {
            Error::Config(format!("Invalid MongoDB option: {}", error))
        }
        _ => Error::SourceConnection(format!("MongoDB error: {}", error)),
    }
}

/// MongoDB connector using the official driver.
pub struct MongoDBConnector {
    config: MongoDBConfig,
    database: Option<Database>,
}

impl MongoDBConnector {
    /// Creates an unconnected connector.
    pub fn new(config: MongoDBConfig) -> Self {
        Self {
            config,
            database: None,
        }
    }

    fn database(&self) -> Result<&Database> {
        self.database
            .as_ref()
            .ok_or_else(|| Error::SourceConnection("Not connected".to_string()))
    }
}

#[async_trait]
impl SourceConnector for MongoDBConnector {
    fn source_type(&self) -> &'static str {
        "mongodb"
    }

    async fn connect(&mut self) -> Result<()> {
        validate_uri(&self.config.uri)?;
        let options = ClientOptions::parse(&self.config.uri)
            .await
            .map_err(|e| Error::Config(format!("Invalid MongoDB URI: {}", e)))?;
        let client = Client::with_options(options).map_err(driver_error)?;
        let database = client.database(&self.config.database);

        // Bad credentials or an unreachable server fail before any phase starts
        database
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(driver_error)?;

        debug!(
            uri = %redact_uri(&self.config.uri),
            database = %self.config.database,
            "connected to MongoDB"
        );
        self.database = Some(database);
        Ok(())
    }

    async fn count(&self, collection: Collection) -> Result<Option<u64>> {
        let total = self
            .database()?
            .collection::<Document>(collection.name())
            .count_documents(doc! {})
            .await
            .map_err(driver_error)?;
        Ok(Some(total))
    }

    async fn extract_batch(
        &self,
        collection: Collection,
        offset: Option<serde_json::Value>,
        batch_size: usize,
    ) -> Result<ExtractedBatch> {
        let skip = offset.and_then(|v| v.as_u64()).unwrap_or(0);
        let limit = i64::try_from(batch_size).unwrap_or(i64::MAX);

        let cursor = self
            .database()?
            .collection::<Document>(collection.name())
            .find(doc! {})
            .sort(doc! { "_id": 1 })
            .skip(skip)
            .limit(limit)
            .await
            .map_err(driver_error)?;
        let page: Vec<Document> = cursor.try_collect().await.map_err(driver_error)?;

        let fetched = page.len() as u64;
        let has_more = fetched == batch_size as u64 && fetched > 0;
        let documents = page
            .into_iter()
            .map(|document| Bson::Document(document).into_relaxed_extjson())
            .collect();

        Ok(ExtractedBatch {
            documents,
            next_offset: has_more.then(|| serde_json::json!(skip + fetched)),
            has_more,
        })
    }

    async fn close(&mut self) -> Result<()> {
        self.database = None;
        Ok(())
    }
}

#[cfg(test)]
#[path = "mongodb_tests.rs"]
mod tests;
