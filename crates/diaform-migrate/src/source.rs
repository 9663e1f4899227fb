//! Typed, lazy scans over the source collections.
//!
//! Each scan pages through a [`SourceConnector`] one batch at a time, so at
//! most `batch_size` raw documents are held in memory. Scans are finite and
//! not restartable; call the method again to re-query from the start.
//!
//! A document that fails to decode is yielded as an [`Error::Decode`] item
//! and the scan continues. A page that cannot be fetched (after retries) is
//! yielded as an error and ends the scan.

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde::de::DeserializeOwned;

use crate::connectors::common::document_id;
use crate::connectors::{Collection, SourceConnector};
use crate::error::{Error, Result};
use crate::model::{SourceConnection, SourceThing, SourceUser, ThingOrdering};
use crate::retry::{with_retry, RetryConfig};

/// Pagination state of one scan.
#[derive(Debug, Clone, Default)]
struct Cursor {
    offset: Option<serde_json::Value>,
    exhausted: bool,
}

/// Reads users, things and connections from a connected source.
pub struct SourceReader<'a> {
    connector: &'a dyn SourceConnector,
    batch_size: usize,
    retry: RetryConfig,
}

impl<'a> SourceReader<'a> {
    /// Creates a reader over an already connected connector.
    pub fn new(connector: &'a dyn SourceConnector, batch_size: usize, retry: RetryConfig) -> Self {
        Self {
            connector,
            batch_size: batch_size.max(1),
            retry,
        }
    }

    /// Number of documents in `collection`, if known. Advisory only.
    pub async fn count(&self, collection: Collection) -> Result<Option<u64>> {
        with_retry(&self.retry, collection.name(), || {
            self.connector.count(collection)
        })
        .await
    }

    /// Full scan of users.
    pub fn users(&self) -> BoxStream<'a, Result<SourceUser>> {
        self.decoded(Collection::Users)
    }

    /// Full scan of things.
    pub fn things(&self) -> BoxStream<'a, Result<SourceThing>> {
        self.decoded(Collection::Things)
    }

    /// Full scan of connections.
    pub fn connections(&self) -> BoxStream<'a, Result<SourceConnection>> {
        self.decoded(Collection::Connections)
    }

    /// Re-scan of things, keeping only their recorded connection ordering.
    ///
    /// Things without a `connections` list yield an empty ordering.
    pub fn orderings(&self) -> BoxStream<'a, Result<ThingOrdering>> {
        self.things()
            .map_ok(|thing| ThingOrdering {
                user: thing.user,
                thing: thing.name,
                connections: thing.connections.unwrap_or_default(),
            })
            .boxed()
    }

    /// Raw documents of `collection` in source order.
    pub fn documents(&self, collection: Collection) -> BoxStream<'a, Result<serde_json::Value>> {
        let connector = self.connector;
        let batch_size = self.batch_size;
        let retry = self.retry.clone();

        stream::try_unfold(Cursor::default(), move |cursor| {
            let retry = retry.clone();
            async move {
                if cursor.exhausted {
                    return Ok::<_, Error>(None);
                }
                let batch = with_retry(&retry, collection.name(), || {
                    connector.extract_batch(collection, cursor.offset.clone(), batch_size)
                })
                .await?;

                let next = Cursor {
                    exhausted: !batch.has_more || batch.documents.is_empty(),
                    offset: batch.next_offset,
                };
                Ok(Some((batch.documents, next)))
            }
        })
        .map_ok(|documents| stream::iter(documents.into_iter().map(Ok::<_, Error>)))
        .try_flatten()
        .boxed()
    }

    fn decoded<T>(&self, collection: Collection) -> BoxStream<'a, Result<T>>
    where
        T: DeserializeOwned + Send + 'a,
    {
        self.documents(collection)
            .map(move |item| item.and_then(|doc| decode(collection, doc)))
            .boxed()
    }
}

/// Decodes one document, naming it by `_id` (or `name`) on failure.
fn decode<T: DeserializeOwned>(collection: Collection, doc: serde_json::Value) -> Result<T> {
    let label = document_id(&doc)
        .or_else(|| doc.get("name").and_then(|n| n.as_str()).map(String::from))
        .unwrap_or_else(|| "<unnamed>".to_string());
    serde_json::from_value(doc).map_err(|e| Error::Decode {
        collection: collection.name(),
        reason: format!("document {}: {}", label, e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::ExtractedBatch;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Serves `things` from memory, failing the first `failures` page fetches.
    struct FlakySource {
        things: Vec<serde_json::Value>,
        failures: AtomicU32,
        fetches: AtomicU32,
    }

    impl FlakySource {
        fn new(things: Vec<serde_json::Value>, failures: u32) -> Self {
            Self {
                things,
                failures: AtomicU32::new(failures),
                fetches: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl SourceConnector for FlakySource {
        fn source_type(&self) -> &'static str {
            "flaky"
        }

        async fn connect(&mut self) -> Result<()> {
            Ok(())
        }

        async fn count(&self, _collection: Collection) -> Result<Option<u64>> {
            Ok(Some(self.things.len() as u64))
        }

        async fn extract_batch(
            &self,
            collection: Collection,
            offset: Option<serde_json::Value>,
            batch_size: usize,
        ) -> Result<ExtractedBatch> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(Error::SourceConnection("connection reset".to_string()));
            }
            let docs: &[serde_json::Value] = match collection {
                Collection::Things => &self.things,
                _ => &[],
            };
            let start = offset.and_then(|v| v.as_u64()).unwrap_or(0) as usize;
            let end = (start + batch_size).min(docs.len());
            let has_more = end < docs.len();
            Ok(ExtractedBatch {
                documents: docs[start..end].to_vec(),
                next_offset: has_more.then(|| serde_json::json!(end)),
                has_more,
            })
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn thing(name: &str) -> serde_json::Value {
        serde_json::json!({"user": "ann", "name": name, "content": "", "connections": ["c"]})
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_retries: 2,
            initial_delay: std::time::Duration::from_millis(1),
            max_delay: std::time::Duration::from_millis(2),
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    #[tokio::test]
    async fn test_things_scan_pages_lazily() {
        let source = FlakySource::new((0..7).map(|i| thing(&format!("t{}", i))).collect(), 0);
        let reader = SourceReader::new(&source, 3, RetryConfig::no_retry());

        let things: Vec<SourceThing> = reader.things().try_collect().await.unwrap();

        assert_eq!(things.len(), 7);
        assert_eq!(things[6].name, "t6");
        assert_eq!(source.fetches.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_scan_retries_transient_page_errors() {
        let source = FlakySource::new(vec![thing("a"), thing("b")], 2);
        let reader = SourceReader::new(&source, 10, fast_retry());

        let things: Vec<SourceThing> = reader.things().try_collect().await.unwrap();
        assert_eq!(things.len(), 2);
    }

    #[tokio::test]
    async fn test_scan_ends_with_error_when_retries_exhausted() {
        let source = FlakySource::new(vec![thing("a")], 5);
        let reader = SourceReader::new(&source, 10, fast_retry());

        let items: Vec<Result<SourceThing>> = reader.things().collect().await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(Error::SourceConnection(_))));
    }

    #[tokio::test]
    async fn test_undecodable_document_does_not_end_scan() {
        let source = FlakySource::new(
            vec![thing("a"), serde_json::json!({"name": "broken"}), thing("c")],
            0,
        );
        let reader = SourceReader::new(&source, 10, RetryConfig::no_retry());

        let items: Vec<Result<SourceThing>> = reader.things().collect().await;
        assert_eq!(items.len(), 3);
        assert!(items[0].is_ok());
        match &items[1] {
            Err(Error::Decode { collection, reason }) => {
                assert_eq!(*collection, "things");
                assert!(reason.contains("broken"));
            }
            other => panic!("expected decode error, got {:?}", other),
        }
        assert!(items[2].is_ok());
    }

    #[tokio::test]
    async fn test_orderings_and_empty_collections() {
        let source = FlakySource::new(vec![thing("a")], 0);
        let reader = SourceReader::new(&source, 10, RetryConfig::no_retry());

        let orderings: Vec<ThingOrdering> = reader.orderings().try_collect().await.unwrap();
        assert_eq!(orderings[0].connections, vec!["c".to_string()]);

        let users: Vec<SourceUser> = reader.users().try_collect().await.unwrap();
        assert!(users.is_empty());
        assert_eq!(reader.count(Collection::Things).await.unwrap(), Some(1));
    }
}
