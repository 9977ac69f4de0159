use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One row of the `tags` table.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct TagRow {
    pub name: String,
    pub native_category: Option<i64>,
    pub usage_count: i64,
    pub main_category: Option<String>,
    pub sub_category: Option<String>,
    pub classification_source: Option<String>,
    pub classification_confidence: Option<f64>,
    pub classification_reasoning: Option<String>,
    pub classified_at: Option<i64>,
    /// JSON-encoded vector.
    pub embedding: Option<String>,
    pub embedded_at: Option<i64>,
}

impl TagRow {
    pub fn embedding_vector(&self) -> Option<Vec<f32>> {
        self.embedding
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
    }
}

/// Minimal projection used when feeding classifiers.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct PendingTag {
    pub name: String,
    pub native_category: Option<i64>,
    pub usage_count: i64,
}
