//! JSON dump connector.
//!
//! Reads a single JSON file shaped like
//! `{"users": [...], "things": [...], "connections": [...]}`, the layout
//! produced by exporting the three MongoDB collections. Missing arrays are
//! treated as empty collections. The whole file is loaded on connect, so
//! this connector is meant for offline runs and tests rather than full-size
//! production databases.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use crate::connectors::common::MAX_FILE_SIZE;
use crate::connectors::{Collection, ExtractedBatch, SourceConnector};
use crate::error::{Error, Result};

/// Configuration for a JSON dump source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JsonFileConfig {
    /// Path to the dump file.
    pub path: PathBuf,
}

#[derive(Debug, Default, Deserialize)]
struct Dump {
    #[serde(default)]
    users: Vec<serde_json::Value>,
    #[serde(default)]
    things: Vec<serde_json::Value>,
    #[serde(default)]
    connections: Vec<serde_json::Value>,
}

impl Dump {
    fn collection(&self, collection: Collection) -> &[serde_json::Value] {
        match collection {
            Collection::Users => &self.users,
            Collection::Things => &self.things,
            Collection::Connections => &self.connections,
        }
    }
}

/// JSON dump connector.
pub struct JsonFileConnector {
    config: JsonFileConfig,
    dump: Option<Dump>,
}

impl JsonFileConnector {
    /// Creates a new JSON dump connector.
    #[must_use]
    pub fn new(config: JsonFileConfig) -> Self {
        Self { config, dump: None }
    }

    fn dump(&self) -> Result<&Dump> {
        self.dump
            .as_ref()
            .ok_or_else(|| Error::SourceConnection("Not connected".to_string()))
    }
}

#[async_trait]
impl SourceConnector for JsonFileConnector {
    fn source_type(&self) -> &'static str {
        "json_file"
    }

    async fn connect(&mut self) -> Result<()> {
        let file = File::open(&self.config.path).map_err(|e| {
            Error::Config(format!(
                "Failed to open JSON dump '{}': {}",
                self.config.path.display(),
                e
            ))
        })?;

        let size = file.metadata()?.len();
        if size > MAX_FILE_SIZE {
            return Err(Error::Config(format!(
                "JSON dump '{}' is {} bytes, larger than the {} byte limit",
                self.config.path.display(),
                size,
                MAX_FILE_SIZE
            )));
        }

        let dump: Dump = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| Error::Config(format!("Failed to parse JSON dump: {}", e)))?;
        self.dump = Some(dump);
        Ok(())
    }

    async fn count(&self, collection: Collection) -> Result<Option<u64>> {
        Ok(Some(self.dump()?.collection(collection).len() as u64))
    }

    async fn extract_batch(
        &self,
        collection: Collection,
        offset: Option<serde_json::Value>,
        batch_size: usize,
    ) -> Result<ExtractedBatch> {
        let documents = self.dump()?.collection(collection);
        let start = offset
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .unwrap_or(0)
            .min(documents.len());
        let end = (start + batch_size).min(documents.len());
        let has_more = end < documents.len();

        Ok(ExtractedBatch {
            documents: documents[start..end].to_vec(),
            next_offset: has_more.then(|| serde_json::json!(end)),
            has_more,
        })
    }

    async fn close(&mut self) -> Result<()> {
        self.dump = None;
        Ok(())
    }
}

#[cfg(test)]
#[path = "json_file_tests.rs"]
mod tests;
