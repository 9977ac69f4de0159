//! Provider abstractions for the classification oracle, embeddings and the
//! remote tag table.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

pub mod noop;
pub mod openai;
pub mod postgrest;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("not implemented")]
    NotImplemented,
    #[error("request failed: {0}")]
    RequestFailed(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("status {code}: {body}")]
    Status { code: u16, body: String },
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("unknown provider: {0}")]
    UnknownProvider(String),
}

impl ProviderError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::RequestFailed(_)
            | ProviderError::RateLimited(_)
            | ProviderError::Malformed(_) => true,
            ProviderError::Status { code, .. } => *code == 429 || *code >= 500,
            ProviderError::NotImplemented | ProviderError::UnknownProvider(_) => false,
        }
    }

    pub(crate) fn from_status(code: u16, body: String) -> Self {
        if code == 429 {
            ProviderError::RateLimited(body)
        } else {
            ProviderError::Status { code, body }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedResponse {
    pub vectors: Vec<Vec<f32>>,
}

/// A tag handed to the oracle, with the upstream category as a hint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleTag {
    pub name: String,
    pub native_category: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct OracleRequest {
    /// Fully rendered instructions, including the tag list.
    pub prompt: String,
    pub tags: Vec<OracleTag>,
}

/// One structured answer from the oracle. Fields are kept raw; the caller
/// validates them against its taxonomy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleVerdict {
    pub tag: String,
    pub main_category: Option<String>,
    pub sub_category: Option<String>,
    pub confidence: Option<f64>,
    pub reasoning: Option<String>,
}

impl OracleVerdict {
    /// Lenient conversion from a JSON object. Returns `None` when the object
    /// does not name a tag.
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        let tag = value.get("tag").and_then(|t| t.as_str())?.trim().to_string();
        if tag.is_empty() {
            return None;
        }
        let text = |key: &str| {
            value
                .get(key)
                .and_then(|v| v.as_str())
                .map(|s| s.trim().to_string())
        };
        let confidence = match value.get("confidence") {
            Some(serde_json::Value::Number(n)) => n.as_f64(),
            Some(serde_json::Value::String(s)) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        Some(Self {
            tag,
            main_category: text("main_category"),
            sub_category: text("sub_category"),
            confidence,
            reasoning: text("reasoning"),
        })
    }
}

#[async_trait::async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<EmbedResponse, ProviderError>;
}

/// Black-box LLM classification service.
#[async_trait::async_trait]
pub trait ClassificationOracle: Send + Sync {
    /// Identifier recorded as the classification source.
    fn model_id(&self) -> &str;

    /// Cheap reachability check run once before a classification pass.
    async fn ping(&self) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn classify(&self, request: &OracleRequest) -> Result<Vec<OracleVerdict>, ProviderError>;
}

#[derive(Default, Clone)]
pub struct ProviderRegistry {
    embeddings: HashMap<String, Arc<dyn EmbeddingProvider>>,
    oracles: HashMap<String, Arc<dyn ClassificationOracle>>,
    pub preferred_embedding: Option<String>,
    pub preferred_oracle: Option<String>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_embedding(mut self, name: &str, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.embeddings.insert(name.to_string(), provider);
        self
    }

    pub fn with_oracle(mut self, name: &str, provider: Arc<dyn ClassificationOracle>) -> Self {
        self.oracles.insert(name.to_string(), provider);
        self
    }

    pub fn set_preferred_embedding(mut self, name: &str) -> Self {
        self.preferred_embedding = Some(name.to_string());
        self
    }

    pub fn set_preferred_oracle(mut self, name: &str) -> Self {
        self.preferred_oracle = Some(name.to_string());
        self
    }

    pub fn embedding(
        &self,
        name: Option<&str>,
    ) -> Result<Arc<dyn EmbeddingProvider>, ProviderError> {
        let key = name
            .map(str::to_string)
            .or_else(|| self.preferred_embedding.clone())
            .ok_or_else(|| {
                ProviderError::UnknownProvider("no embedding provider configured".into())
            })?;
        self.embeddings
            .get(&key)
            .cloned()
            .ok_or_else(|| ProviderError::UnknownProvider(key))
    }

    pub fn oracle(
        &self,
        name: Option<&str>,
    ) -> Result<Arc<dyn ClassificationOracle>, ProviderError> {
        let key = name
            .map(str::to_string)
            .or_else(|| self.preferred_oracle.clone())
            .ok_or_else(|| ProviderError::UnknownProvider("no oracle configured".into()))?;
        self.oracles
            .get(&key)
            .cloned()
            .ok_or_else(|| ProviderError::UnknownProvider(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(ProviderError::RequestFailed("timeout".into()).is_transient());
        assert!(ProviderError::from_status(429, String::new()).is_transient());
        assert!(ProviderError::from_status(503, String::new()).is_transient());
        assert!(!ProviderError::from_status(401, String::new()).is_transient());
        assert!(!ProviderError::UnknownProvider("x".into()).is_transient());
    }

    #[test]
    fn verdict_from_value_is_lenient_about_confidence() {
        let v = serde_json::json!({
            "tag": "long_hair",
            "main_category": "CHARACTER_RELATED",
            "sub_category": null,
            "confidence": "0.9",
        });
        let verdict = OracleVerdict::from_value(&v).unwrap();
        assert_eq!(verdict.tag, "long_hair");
        assert_eq!(verdict.sub_category, None);
        assert_eq!(verdict.confidence, Some(0.9));
        assert!(OracleVerdict::from_value(&serde_json::json!({"main_category": "X"})).is_none());
    }

    #[test]
    fn registry_falls_back_to_preferred() {
        let reg = ProviderRegistry::new()
            .with_embedding("noop", Arc::new(noop::NoopProvider))
            .set_preferred_embedding("noop");
        assert!(reg.embedding(None).is_ok());
        assert!(matches!(
            reg.embedding(Some("missing")),
            Err(ProviderError::UnknownProvider(_))
        ));
        assert!(reg.oracle(None).is_err());
    }
}
