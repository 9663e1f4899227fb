//! Source connectors for the document store holding the knowledge base.

pub mod common;
pub mod data_api;
pub mod json_file;
pub mod mongodb;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A collection of the source knowledge base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    /// User accounts.
    Users,
    /// Graph nodes with content.
    Things,
    /// Ordered parent-child edges.
    Connections,
}

impl Collection {
    /// All collections in migration order.
    pub const ALL: [Collection; 3] = [Self::Users, Self::Things, Self::Connections];

    /// Collection name in the source store.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Users => "users",
            Self::Things => "things",
            Self::Connections => "connections",
        }
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A page of raw documents.
#[derive(Debug, Clone)]
pub struct ExtractedBatch {
    /// Documents in this page, in stable source order.
    pub documents: Vec<serde_json::Value>,
    /// Offset/cursor for the next page.
    pub next_offset: Option<serde_json::Value>,
    /// Whether there are more pages.
    pub has_more: bool,
}

/// Trait for source store connectors.
///
/// Implementations must return documents of a collection in the same order
/// on every scan so that re-runs are deterministic.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    /// Get the source type name.
    fn source_type(&self) -> &'static str;

    /// Connect to the source and validate configuration.
    async fn connect(&mut self) -> Result<()>;

    /// Number of documents in `collection`, if the source can tell.
    async fn count(&self, collection: Collection) -> Result<Option<u64>>;

    /// Extract a page of documents starting from an optional offset.
    async fn extract_batch(
        &self,
        collection: Collection,
        offset: Option<serde_json::Value>,
        batch_size: usize,
    ) -> Result<ExtractedBatch>;

    /// Close the connection and cleanup resources.
    async fn close(&mut self) -> Result<()>;
}

/// Create a source connector from configuration.
pub fn create_connector(config: &crate::config::SourceConfig) -> Result<Box<dyn SourceConnector>> {
    match config {
        crate::config::SourceConfig::MongoDB(cfg) => {
            Ok(Box::new(crate::connectors::mongodb::MongoDBConnector::new(
                cfg.clone(),
            )))
        }
        crate::config::SourceConfig::DataApi(cfg) => {
            Ok(Box::new(data_api::DataApiConnector::new(cfg.clone())))
        }
        crate::config::SourceConfig::JsonFile(cfg) => {
            Ok(Box::new(json_file::JsonFileConnector::new(cfg.clone())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_names() {
        let names: Vec<_> = Collection::ALL.iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["users", "things", "connections"]);
        assert_eq!(Collection::Things.to_string(), "things");
    }

    #[test]
    fn test_create_json_file_connector() {
        let config = crate::config::SourceConfig::JsonFile(json_file::JsonFileConfig {
            path: "dump.json".into(),
        });
        let connector = create_connector(&config).unwrap();
        assert_eq!(connector.source_type(), "json_file");
    }

    #[test]
    fn test_create_mongodb_connectors() {
        use crate::connectors::mongodb::MongoDBConfig;

        let driver = crate::config::SourceConfig::MongoDB(MongoDBConfig {
            uri: "mongodb://localhost:27017".into(),
            database: "diaform".into(),
        });
        assert_eq!(create_connector(&driver).unwrap().source_type(), "mongodb");

        let data_api = crate::config::SourceConfig::DataApi(data_api::DataApiConfig {
            data_api_url: "https://data.example.com/app/x/endpoint/data/v1".into(),
            api_key: "k".into(),
            database: "diaform".into(),
            data_source: "mongodb-atlas".into(),
        });
        assert_eq!(
            create_connector(&data_api).unwrap().source_type(),
            "mongodb_data_api"
        );
    }
}
