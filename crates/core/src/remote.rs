use providers::postgrest::PostgrestClient;
use providers::ProviderError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use storage::models::TagRow;

/// The columns mirrored to the remote table (everything but the local
/// bookkeeping and the embedding).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteTag {
    pub name: String,
    pub native_category: Option<i64>,
    pub usage_count: i64,
    pub main_category: Option<String>,
    pub sub_category: Option<String>,
    pub classification_source: Option<String>,
    pub classification_confidence: Option<f64>,
    pub classification_reasoning: Option<String>,
}

impl From<&TagRow> for RemoteTag {
    fn from(row: &TagRow) -> Self {
        Self {
            name: row.name.clone(),
            native_category: row.native_category,
            usage_count: row.usage_count,
            main_category: row.main_category.clone(),
            sub_category: row.sub_category.clone(),
            classification_source: row.classification_source.clone(),
            classification_confidence: row.classification_confidence,
            classification_reasoning: row.classification_reasoning.clone(),
        }
    }
}

pub const TAG_COLUMNS: &[&str] = &[
    "name",
    "native_category",
    "usage_count",
    "main_category",
    "sub_category",
    "classification_source",
    "classification_confidence",
    "classification_reasoning",
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmbeddedTag {
    #[serde(flatten)]
    pub tag: RemoteTag,
    pub embedding: Vec<f32>,
}

/// Destination table keyed by tag name. Every write is an idempotent upsert.
#[async_trait::async_trait]
pub trait RemoteStore: Send + Sync {
    async fn ping(&self) -> Result<(), ProviderError>;
    /// Upserts tag rows without touching any stored embedding.
    async fn upsert_tags(&self, rows: &[RemoteTag]) -> Result<(), ProviderError>;
    /// Upserts tag rows together with their embedding.
    async fn upsert_embeddings(&self, rows: &[EmbeddedTag]) -> Result<(), ProviderError>;
    async fn count_tags(&self) -> Result<u64, ProviderError>;
    /// Rows with an embedding and `usage_count >= min_usage_count`.
    async fn count_embedded(&self, min_usage_count: i64) -> Result<u64, ProviderError>;
}

pub struct PostgrestStore {
    client: PostgrestClient,
}

impl PostgrestStore {
    pub fn new(client: PostgrestClient) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl RemoteStore for PostgrestStore {
    async fn ping(&self) -> Result<(), ProviderError> {
        self.client.ping().await
    }

    async fn upsert_tags(&self, rows: &[RemoteTag]) -> Result<(), ProviderError> {
        self.client.upsert(rows, TAG_COLUMNS).await
    }

    async fn upsert_embeddings(&self, rows: &[EmbeddedTag]) -> Result<(), ProviderError> {
        let mut columns = TAG_COLUMNS.to_vec();
        columns.push("embedding");
        self.client.upsert(rows, &columns).await
    }

    async fn count_tags(&self) -> Result<u64, ProviderError> {
        self.client.count(&[]).await
    }

    async fn count_embedded(&self, min_usage_count: i64) -> Result<u64, ProviderError> {
        self.client
            .count(&[
                ("embedding", "not.is.null".to_string()),
                ("usage_count", format!("gte.{min_usage_count}")),
            ])
            .await
    }
}

#[derive(Debug, Clone)]
struct MemoryRow {
    tag: RemoteTag,
    embedding: Option<Vec<f32>>,
}

/// Process-local remote store. Queued failures are returned by the next
/// upsert calls, one per call.
#[derive(Default)]
pub struct MemoryRemoteStore {
    rows: Mutex<BTreeMap<String, MemoryRow>>,
    failures: Mutex<VecDeque<ProviderError>>,
    upserts: AtomicUsize,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_failure(&self, err: ProviderError) {
        if let Ok(mut queue) = self.failures.lock() {
            queue.push_back(err);
        }
    }

    /// Number of upsert calls, failed ones included.
    pub fn upsert_calls(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.rows.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, name: &str) -> Option<RemoteTag> {
        self.rows
            .lock()
            .ok()
            .and_then(|r| r.get(name).map(|row| row.tag.clone()))
    }

    pub fn embedding(&self, name: &str) -> Option<Vec<f32>> {
        self.rows
            .lock()
            .ok()
            .and_then(|r| r.get(name).and_then(|row| row.embedding.clone()))
    }

    fn begin_upsert(&self) -> Result<(), ProviderError> {
        self.upserts.fetch_add(1, Ordering::SeqCst);
        match self.failures.lock() {
            Ok(mut queue) => queue.pop_front().map_or(Ok(()), Err),
            Err(_) => Err(ProviderError::RequestFailed("memory store poisoned".into())),
        }
    }

    fn with_rows<T>(
        &self,
        f: impl FnOnce(&mut BTreeMap<String, MemoryRow>) -> T,
    ) -> Result<T, ProviderError> {
        let mut rows = self
            .rows
            .lock()
            .map_err(|_| ProviderError::RequestFailed("memory store poisoned".into()))?;
        Ok(f(&mut rows))
    }
}

#[async_trait::async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn ping(&self) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn upsert_tags(&self, rows: &[RemoteTag]) -> Result<(), ProviderError> {
        self.begin_upsert()?;
        self.with_rows(|stored| {
            for tag in rows {
                stored
                    .entry(tag.name.clone())
                    .and_modify(|row| row.tag = tag.clone())
                    .or_insert_with(|| MemoryRow {
                        tag: tag.clone(),
                        embedding: None,
                    });
            }
        })
    }

    async fn upsert_embeddings(&self, rows: &[EmbeddedTag]) -> Result<(), ProviderError> {
        self.begin_upsert()?;
        self.with_rows(|stored| {
            for row in rows {
                stored.insert(
                    row.tag.name.clone(),
                    MemoryRow {
                        tag: row.tag.clone(),
                        embedding: Some(row.embedding.clone()),
                    },
                );
            }
        })
    }

    async fn count_tags(&self) -> Result<u64, ProviderError> {
        self.with_rows(|stored| stored.len() as u64)
    }

    async fn count_embedded(&self, min_usage_count: i64) -> Result<u64, ProviderError> {
        self.with_rows(|stored| {
            stored
                .values()
                .filter(|r| r.embedding.is_some() && r.tag.usage_count >= min_usage_count)
                .count() as u64
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote_tag(name: &str, usage: i64) -> RemoteTag {
        RemoteTag {
            name: name.into(),
            native_category: Some(0),
            usage_count: usage,
            main_category: Some("OBJECTS".into()),
            sub_category: None,
            classification_source: Some("rule_engine".into()),
            classification_confidence: None,
            classification_reasoning: None,
        }
    }

    #[tokio::test]
    async fn tag_upsert_keeps_embedding() {
        let store = MemoryRemoteStore::new();
        store
            .upsert_embeddings(&[EmbeddedTag {
                tag: remote_tag("cup", 10),
                embedding: vec![1.0, 0.0],
            }])
            .await
            .unwrap();
        let mut updated = remote_tag("cup", 20);
        updated.sub_category = Some("FOOD".into());
        store.upsert_tags(&[updated.clone()]).await.unwrap();
        store.upsert_tags(&[updated.clone()]).await.unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.get("cup"), Some(updated));
        assert_eq!(store.embedding("cup"), Some(vec![1.0, 0.0]));
        assert_eq!(store.count_embedded(15).await.unwrap(), 1);
        assert_eq!(store.count_embedded(25).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn queued_failures_are_returned_in_order() {
        let store = MemoryRemoteStore::new();
        store.push_failure(ProviderError::Status {
            code: 503,
            body: "down".into(),
        });
        assert!(store.upsert_tags(&[remote_tag("a", 1)]).await.is_err());
        assert!(store.upsert_tags(&[remote_tag("a", 1)]).await.is_ok());
        assert_eq!(store.upsert_calls(), 2);
        assert_eq!(store.count_tags().await.unwrap(), 1);
    }

    #[test]
    fn embedded_tag_serializes_flat() {
        let value = serde_json::to_value(EmbeddedTag {
            tag: remote_tag("a", 1),
            embedding: vec![0.5],
        })
        .unwrap();
        assert_eq!(value["name"], "a");
        assert_eq!(value["embedding"][0], 0.5);
        for column in TAG_COLUMNS {
            assert!(value.get(column).is_some(), "{column}");
        }
    }
}
