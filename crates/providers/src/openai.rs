use crate::{
    ClassificationOracle, EmbedResponse, EmbeddingProvider, OracleRequest, OracleVerdict,
    ProviderError,
};
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

/// Settings for any OpenAI-compatible endpoint (OpenAI, OpenRouter, local servers).
#[derive(Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: String,
    pub embedding_model: String,
    pub chat_model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_secs: u64,
}

#[derive(Clone)]
pub struct OpenAiProvider {
    client: Client,
    cfg: Arc<OpenAiConfig>,
}

impl OpenAiProvider {
    pub fn new(cfg: OpenAiConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs.max(1)))
            .build()
            .map_err(|e| ProviderError::RequestFailed(e.to_string()))?;
        Ok(Self {
            client,
            cfg: Arc::new(cfg),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.cfg.base_url.trim_end_matches('/'), path)
    }
}

#[derive(Deserialize)]
struct EmbeddingApiResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let code = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    Err(ProviderError::from_status(code, body))
}

#[async_trait::async_trait]
impl EmbeddingProvider for OpenAiProvider {
    async fn embed(&self, texts: &[String]) -> Result<EmbedResponse, ProviderError> {
        #[derive(serde::Serialize)]
        struct EmbedRequest<'a> {
            model: &'a str,
            input: &'a [String],
        }

        let body = EmbedRequest {
            model: &self.cfg.embedding_model,
            input: texts,
        };

        let resp = self
            .client
            .post(self.url("embeddings"))
            .bearer_auth(&self.cfg.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::RequestFailed(e.to_string()))?;
        let resp = check_status(resp).await?;

        let parsed: EmbeddingApiResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;

        Ok(EmbedResponse {
            vectors: parsed.data.into_iter().map(|d| d.embedding).collect(),
        })
    }
}

#[async_trait::async_trait]
impl ClassificationOracle for OpenAiProvider {
    fn model_id(&self) -> &str {
        &self.cfg.chat_model
    }

    async fn ping(&self) -> Result<(), ProviderError> {
        let resp = self
            .client
            .get(self.url("models"))
            .bearer_auth(&self.cfg.api_key)
            .send()
            .await
            .map_err(|e| ProviderError::RequestFailed(e.to_string()))?;
        check_status(resp).await?;
        Ok(())
    }

    async fn classify(&self, request: &OracleRequest) -> Result<Vec<OracleVerdict>, ProviderError> {
        #[derive(serde::Serialize)]
        struct ChatMessage<'a> {
            role: &'static str,
            content: &'a str,
        }
        #[derive(serde::Serialize)]
        struct ChatRequest<'a> {
            model: &'a str,
            messages: Vec<ChatMessage<'a>>,
            temperature: f32,
            max_tokens: u32,
        }
        #[derive(Deserialize)]
        struct Choice {
            message: ChatMessageResp,
        }
        #[derive(Deserialize)]
        struct ChatMessageResp {
            content: Option<String>,
        }
        #[derive(Deserialize)]
        struct ChatApiResponse {
            choices: Vec<Choice>,
        }

        let body = ChatRequest {
            model: &self.cfg.chat_model,
            messages: vec![ChatMessage {
                role: "user",
                content: &request.prompt,
            }],
            temperature: self.cfg.temperature,
            max_tokens: self.cfg.max_tokens,
        };

        tracing::debug!(
            model = %self.cfg.chat_model,
            tags = request.tags.len(),
            "sending classification request"
        );

        let resp = self
            .client
            .post(self.url("chat/completions"))
            .bearer_auth(&self.cfg.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::RequestFailed(e.to_string()))?;
        let resp = check_status(resp).await?;

        let parsed: ChatApiResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        parse_verdicts(&content)
    }
}

/// Pulls the classification list out of a chat completion body. Accepts a
/// bare JSON object, a top-level array, or either wrapped in a code fence.
pub fn parse_verdicts(content: &str) -> Result<Vec<OracleVerdict>, ProviderError> {
    let json = extract_json(content)
        .ok_or_else(|| ProviderError::Malformed(format!("no JSON in response: {}", preview(content))))?;
    let value: serde_json::Value =
        serde_json::from_str(json).map_err(|e| ProviderError::Malformed(e.to_string()))?;
    let items = match &value {
        serde_json::Value::Array(items) => items,
        serde_json::Value::Object(obj) => obj
            .get("classifications")
            .and_then(|c| c.as_array())
            .ok_or_else(|| ProviderError::Malformed("missing classifications array".into()))?,
        _ => return Err(ProviderError::Malformed("unexpected JSON shape".into())),
    };
    Ok(items.iter().filter_map(OracleVerdict::from_value).collect())
}

fn extract_json(content: &str) -> Option<&str> {
    let mut body = content.trim();
    if let Some(start) = body.find("```") {
        let after = &body[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(end) = after.find("```") {
            body = after[..end].trim();
        }
    }
    let open = body.find(&['{', '['][..])?;
    let close_char = if body[open..].starts_with('{') { '}' } else { ']' };
    let close = body.rfind(close_char)?;
    (close > open).then(|| &body[open..=close])
}

fn preview(content: &str) -> String {
    content.chars().take(200).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_object() {
        let body = r#"{"classifications": [
            {"tag": "thighhighs", "main_category": "CHARACTER_RELATED", "sub_category": "CLOTHING", "confidence": 0.95, "reasoning": "legwear"}
        ]}"#;
        let verdicts = parse_verdicts(body).unwrap();
        assert_eq!(verdicts.len(), 1);
        assert_eq!(verdicts[0].sub_category.as_deref(), Some("CLOTHING"));
        assert_eq!(verdicts[0].confidence, Some(0.95));
    }

    #[test]
    fn parses_fenced_array() {
        let body = "Sure!\n```json\n[{\"tag\": \"zzz\", \"main_category\": \"ACTION_POSE\", \"confidence\": 0.7}]\n```";
        let verdicts = parse_verdicts(body).unwrap();
        assert_eq!(verdicts[0].tag, "zzz");
        assert_eq!(verdicts[0].reasoning, None);
    }

    #[test]
    fn other_wrapper_keys_are_malformed() {
        let body = r#"{"results": [{"tag": "zzz", "main_category": "OBJECTS"}]}"#;
        assert!(matches!(parse_verdicts(body), Err(ProviderError::Malformed(_))));
    }

    #[test]
    fn garbage_is_malformed_and_transient() {
        let err = parse_verdicts("I cannot help with that").unwrap_err();
        assert!(matches!(err, ProviderError::Malformed(_)));
        assert!(err.is_transient());
    }
}
