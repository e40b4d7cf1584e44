//! Document-store abstraction backing the listing catalog.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "ofc-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io failure on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("collection {collection} holds invalid JSON: {source}")]
    Corrupt {
        collection: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Generic document-store surface consumed by the catalog pipeline.
///
/// `fetch_all` returns documents ordered by key; the catalog keys listings
/// by their zero-padded issued ids, so key order equals assignment order.
///
/// Projection rebuilds replace whole collections with `delete_all`
/// followed by fresh upserts. That sequence is not transactional: a
/// failure in between leaves the collection partially deleted or
/// partially repopulated. Callers surface the error for a manual rerun
/// rather than retrying; implementations keep `delete_all` and
/// `upsert_many` as close to atomic as their backing technology allows.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn fetch_all(&self, collection: &str) -> Result<Vec<Value>, StoreError>;

    async fn get(&self, collection: &str, key: &str) -> Result<Option<Value>, StoreError>;

    async fn upsert(&self, collection: &str, key: &str, document: Value)
        -> Result<(), StoreError>;

    async fn delete_all(&self, collection: &str) -> Result<(), StoreError>;

    /// Insert a batch of keyed documents. The default is a sequential
    /// upsert loop; backends override it when they can do better.
    async fn upsert_many(
        &self,
        collection: &str,
        documents: Vec<(String, Value)>,
    ) -> Result<(), StoreError> {
        for (key, document) in documents {
            self.upsert(collection, &key, document).await?;
        }
        Ok(())
    }
}

/// In-memory store used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: Mutex<HashMap<String, BTreeMap<String, Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn fetch_all(&self, collection: &str) -> Result<Vec<Value>, StoreError> {
        let collections = self.collections.lock().await;
        Ok(collections
            .get(collection)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn get(&self, collection: &str, key: &str) -> Result<Option<Value>, StoreError> {
        let collections = self.collections.lock().await;
        Ok(collections
            .get(collection)
            .and_then(|docs| docs.get(key))
            .cloned())
    }

    async fn upsert(
        &self,
        collection: &str,
        key: &str,
        document: Value,
    ) -> Result<(), StoreError> {
        let mut collections = self.collections.lock().await;
        collections
            .entry(collection.to_string())
            .or_default()
            .insert(key.to_string(), document);
        Ok(())
    }

    async fn delete_all(&self, collection: &str) -> Result<(), StoreError> {
        let mut collections = self.collections.lock().await;
        collections.remove(collection);
        Ok(())
    }
}

/// File-backed store: one `<collection>.json` file per collection under
/// the root, holding a key-ordered document map.
///
/// Writes go through a temp file and an atomic rename; `delete_all` is a
/// single unlink. Those are the closest this backend gets to atomic
/// collection replacement, which bounds the partial-failure window the
/// trait contract describes.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    root: PathBuf,
}

impl JsonFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn collection_path(&self, collection: &str) -> PathBuf {
        self.root.join(format!("{collection}.json"))
    }

    async fn read_collection(
        &self,
        collection: &str,
    ) -> Result<BTreeMap<String, Value>, StoreError> {
        let path = self.collection_path(collection);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(BTreeMap::new());
            }
            Err(err) => return Err(StoreError::Io { path, source: err }),
        };
        serde_json::from_slice(&bytes).map_err(|err| StoreError::Corrupt {
            collection: collection.to_string(),
            source: err,
        })
    }

    async fn write_collection(
        &self,
        collection: &str,
        documents: &BTreeMap<String, Value>,
    ) -> Result<(), StoreError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|err| StoreError::Io {
                path: self.root.clone(),
                source: err,
            })?;

        let bytes = serde_json::to_vec_pretty(documents).map_err(|err| StoreError::Corrupt {
            collection: collection.to_string(),
            source: err,
        })?;

        let path = self.collection_path(collection);
        let temp_path = self.root.join(format!(".{}.tmp", Uuid::new_v4()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|err| StoreError::Io {
                path: temp_path.clone(),
                source: err,
            })?;
        file.write_all(&bytes).await.map_err(|err| StoreError::Io {
            path: temp_path.clone(),
            source: err,
        })?;
        file.flush().await.map_err(|err| StoreError::Io {
            path: temp_path.clone(),
            source: err,
        })?;
        drop(file);

        match fs::rename(&temp_path, &path).await {
            Ok(()) => {
                debug!(collection, documents = documents.len(), "collection file replaced");
                Ok(())
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(StoreError::Io { path, source: err })
            }
        }
    }
}

#[async_trait]
impl DocumentStore for JsonFileStore {
    async fn fetch_all(&self, collection: &str) -> Result<Vec<Value>, StoreError> {
        let documents = self.read_collection(collection).await?;
        Ok(documents.into_values().collect())
    }

    async fn get(&self, collection: &str, key: &str) -> Result<Option<Value>, StoreError> {
        let mut documents = self.read_collection(collection).await?;
        Ok(documents.remove(key))
    }

    async fn upsert(
        &self,
        collection: &str,
        key: &str,
        document: Value,
    ) -> Result<(), StoreError> {
        let mut documents = self.read_collection(collection).await?;
        documents.insert(key.to_string(), document);
        self.write_collection(collection, &documents).await
    }

    async fn delete_all(&self, collection: &str) -> Result<(), StoreError> {
        let path = self.collection_path(collection);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StoreError::Io { path, source: err }),
        }
    }

    /// One read-modify-write for the whole batch, so a rebuild's reinsert
    /// pass lands in a single atomic rename.
    async fn upsert_many(
        &self,
        collection: &str,
        batch: Vec<(String, Value)>,
    ) -> Result<(), StoreError> {
        let mut documents = self.read_collection(collection).await?;
        for (key, document) in batch {
            documents.insert(key, document);
        }
        self.write_collection(collection, &documents).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn memory_store_orders_documents_by_key() {
        let store = MemoryStore::new();
        store.upsert("listings", "OF0000002", json!({"n": 2})).await.expect("upsert");
        store.upsert("listings", "OF0000001", json!({"n": 1})).await.expect("upsert");
        store.upsert("listings", "OF0000010", json!({"n": 10})).await.expect("upsert");

        let all = store.fetch_all("listings").await.expect("fetch");
        let order: Vec<i64> = all.iter().map(|v| v["n"].as_i64().expect("n")).collect();
        assert_eq!(order, vec![1, 2, 10]);
    }

    #[tokio::test]
    async fn memory_store_upsert_replaces_existing_document() {
        let store = MemoryStore::new();
        store.upsert("meta", "meta", json!({"count": 1})).await.expect("upsert");
        store.upsert("meta", "meta", json!({"count": 2})).await.expect("upsert");

        let doc = store.get("meta", "meta").await.expect("get").expect("present");
        assert_eq!(doc["count"], 2);
        assert_eq!(store.fetch_all("meta").await.expect("fetch").len(), 1);
    }

    #[tokio::test]
    async fn memory_store_delete_all_targets_one_collection() {
        let store = MemoryStore::new();
        store.upsert("meta_city", "Toronto", json!({})).await.expect("upsert");
        store.upsert("meta_province", "Ontario", json!({})).await.expect("upsert");

        store.delete_all("meta_city").await.expect("delete");
        assert!(store.fetch_all("meta_city").await.expect("fetch").is_empty());
        assert_eq!(store.fetch_all("meta_province").await.expect("fetch").len(), 1);
    }

    #[tokio::test]
    async fn file_store_round_trips_across_instances() {
        let dir = tempdir().expect("tempdir");
        {
            let store = JsonFileStore::new(dir.path());
            store
                .upsert("listings", "OF0000001", json!({"business_name": "Bakery"}))
                .await
                .expect("upsert");
        }

        let reopened = JsonFileStore::new(dir.path());
        let doc = reopened
            .get("listings", "OF0000001")
            .await
            .expect("get")
            .expect("present");
        assert_eq!(doc["business_name"], "Bakery");
    }

    #[tokio::test]
    async fn file_store_orders_documents_by_key() {
        let dir = tempdir().expect("tempdir");
        let store = JsonFileStore::new(dir.path());
        for key in ["OF0000003", "OF0000001", "OF0000002"] {
            store.upsert("listings", key, json!({"listing_id": key})).await.expect("upsert");
        }

        let all = store.fetch_all("listings").await.expect("fetch");
        let keys: Vec<&str> = all
            .iter()
            .map(|v| v["listing_id"].as_str().expect("listing_id"))
            .collect();
        assert_eq!(keys, vec!["OF0000001", "OF0000002", "OF0000003"]);
    }

    #[tokio::test]
    async fn file_store_delete_all_is_idempotent_and_leaves_no_temp_files() {
        let dir = tempdir().expect("tempdir");
        let store = JsonFileStore::new(dir.path());
        store
            .upsert_many(
                "hist_price",
                vec![
                    ("10".to_string(), json!({"lower": 10})),
                    ("12".to_string(), json!({"lower": 12})),
                ],
            )
            .await
            .expect("upsert_many");

        store.delete_all("hist_price").await.expect("delete");
        store.delete_all("hist_price").await.expect("second delete");
        assert!(store.fetch_all("hist_price").await.expect("fetch").is_empty());

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn file_store_missing_collection_reads_as_empty() {
        let dir = tempdir().expect("tempdir");
        let store = JsonFileStore::new(dir.path());
        assert!(store.fetch_all("meta_industry").await.expect("fetch").is_empty());
        assert!(store.get("meta", "meta").await.expect("get").is_none());
    }
}
