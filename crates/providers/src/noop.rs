use crate::{
    ClassificationOracle, EmbedResponse, EmbeddingProvider, OracleRequest, OracleVerdict,
    ProviderError,
};

#[derive(Debug, Default)]
pub struct NoopProvider;

#[async_trait::async_trait]
impl EmbeddingProvider for NoopProvider {
    async fn embed(&self, texts: &[String]) -> Result<EmbedResponse, ProviderError> {
        Ok(EmbedResponse {
            vectors: vec![vec![]; texts.len()],
        })
    }
}

#[async_trait::async_trait]
impl ClassificationOracle for NoopProvider {
    fn model_id(&self) -> &str {
        "noop"
    }

    async fn ping(&self) -> Result<(), ProviderError> {
        Err(ProviderError::NotImplemented)
    }

    async fn classify(&self, _request: &OracleRequest) -> Result<Vec<OracleVerdict>, ProviderError> {
        Err(ProviderError::NotImplemented)
    }
}
