use crate::remote::{EmbeddedTag, RemoteStore, RemoteTag};
use crate::retry::{self, RetryPolicy};
use crate::store::TagStore;
use anyhow::Context;
use futures::stream::{self, StreamExt};
use providers::{EmbeddingProvider, ProviderError};
use serde::Serialize;
use std::sync::Arc;
use storage::models::TagRow;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct TierSettings {
    /// Usage thresholds, strictly decreasing.
    pub thresholds: Vec<i64>,
    pub batch_size: usize,
    pub concurrency: usize,
    /// Expected vector length; unchecked when `None`.
    pub dimensions: Option<usize>,
    pub min_stage_coverage: f64,
    /// Only classified tags are embedded, matching the migration selection.
    pub classified_only: bool,
    pub retry: RetryPolicy,
}

impl Default for TierSettings {
    fn default() -> Self {
        Self {
            thresholds: vec![100_000, 50_000, 10_000, 1_000],
            batch_size: 100,
            concurrency: 2,
            dimensions: None,
            min_stage_coverage: 0.99,
            classified_only: false,
            retry: RetryPolicy::default(),
        }
    }
}

pub fn validate_tiers(thresholds: &[i64]) -> anyhow::Result<()> {
    if thresholds.is_empty() {
        anyhow::bail!("at least one embedding tier is required");
    }
    if thresholds.windows(2).any(|w| w[0] <= w[1]) {
        anyhow::bail!("embedding tiers must be strictly decreasing: {thresholds:?}");
    }
    Ok(())
}

/// Text submitted to the embedding service for a tag.
pub fn embedding_text(row: &TagRow) -> String {
    let mut text = row.name.replace('_', " ");
    if let Some(main) = &row.main_category {
        text.push_str(" | ");
        text.push_str(main);
        if let Some(sub) = &row.sub_category {
            text.push('/');
            text.push_str(sub);
        }
    }
    text
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageSummary {
    pub stage: usize,
    pub threshold: i64,
    /// Tags at or above the threshold.
    pub eligible: i64,
    /// Tags embedded during this run of the stage.
    pub embedded: u64,
    pub failed: u64,
    /// Embedded / eligible after the stage ran.
    pub coverage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageHalt {
    pub stage: usize,
    pub threshold: i64,
    pub previous_coverage: f64,
    pub required: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EmbeddingRunSummary {
    pub stages: Vec<StageSummary>,
    pub halted: Option<StageHalt>,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Copy, Default)]
struct BatchOutcome {
    embedded: u64,
    failed: u64,
}

/// Rolls embeddings out from the most used tags down, one usage tier at a
/// time. A tier starts only once the previous one is sufficiently covered.
pub struct TieredEmbedder {
    store: TagStore,
    provider: Arc<dyn EmbeddingProvider>,
    remote: Arc<dyn RemoteStore>,
    settings: TierSettings,
    cancel: CancellationToken,
}

impl TieredEmbedder {
    pub fn new(
        store: TagStore,
        provider: Arc<dyn EmbeddingProvider>,
        remote: Arc<dyn RemoteStore>,
        settings: TierSettings,
    ) -> anyhow::Result<Self> {
        validate_tiers(&settings.thresholds)?;
        if !(0.0..=1.0).contains(&settings.min_stage_coverage) {
            anyhow::bail!(
                "min_stage_coverage {} is outside [0, 1]",
                settings.min_stage_coverage
            );
        }
        Ok(Self {
            store,
            provider,
            remote,
            settings,
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    async fn coverage(&self, threshold: i64) -> anyhow::Result<(i64, f64)> {
        let (eligible, embedded) = self.store
            .embedding_coverage(threshold, self.settings.classified_only)
            .await?;
        let coverage = if eligible == 0 {
            1.0
        } else {
            embedded as f64 / eligible as f64
        };
        Ok((eligible, coverage))
    }

    /// Runs stages in order, at most `max_stages` of them.
    pub async fn run(&self, max_stages: Option<usize>) -> anyhow::Result<EmbeddingRunSummary> {
        self.remote.ping().await.context("remote store unreachable")?;
        let mut summary = EmbeddingRunSummary::default();
        let stages = max_stages
            .unwrap_or(self.settings.thresholds.len())
            .min(self.settings.thresholds.len());
        for stage in 0..stages {
            if self.cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            let threshold = self.settings.thresholds[stage];
            if stage > 0 {
                let previous = self.settings.thresholds[stage - 1];
                let (_, previous_coverage) = self.coverage(previous).await?;
                if previous_coverage < self.settings.min_stage_coverage {
                    warn!(
                        stage,
                        threshold,
                        previous_coverage,
                        required = self.settings.min_stage_coverage,
                        "previous tier under-covered, halting rollout"
                    );
                    summary.halted = Some(StageHalt {
                        stage,
                        threshold,
                        previous_coverage,
                        required: self.settings.min_stage_coverage,
                    });
                    break;
                }
            }
            let result = self.run_stage(stage, threshold).await?;
            summary.cancelled |= self.cancel.is_cancelled();
            summary.stages.push(result);
        }
        Ok(summary)
    }

    async fn run_stage(&self, stage: usize, threshold: i64) -> anyhow::Result<StageSummary> {
        let candidates = self
            .store
            .embedding_candidates(threshold, self.settings.classified_only)
            .await?;
        let batches: Vec<Vec<TagRow>> = candidates
            .chunks(self.settings.batch_size.max(1))
            .map(|c| c.to_vec())
            .collect();
        info!(
            stage,
            threshold,
            candidates = candidates.len(),
            batches = batches.len(),
            "embedding stage started"
        );
        let outcomes: Vec<BatchOutcome> = stream::iter(batches.into_iter().enumerate())
            .map(|(idx, batch)| self.embed_batch(stage, idx, batch))
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect()
            .await;

        let (eligible, coverage) = self.coverage(threshold).await?;
        let summary = StageSummary {
            stage,
            threshold,
            eligible,
            embedded: outcomes.iter().map(|o| o.embedded).sum(),
            failed: outcomes.iter().map(|o| o.failed).sum(),
            coverage,
        };
        info!(
            stage,
            threshold,
            eligible,
            embedded = summary.embedded,
            failed = summary.failed,
            coverage,
            "embedding stage complete"
        );
        Ok(summary)
    }

    async fn request_vectors(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let response = self.provider.embed(texts).await?;
        if response.vectors.len() != texts.len() {
            return Err(ProviderError::Malformed(format!(
                "expected {} vectors, got {}",
                texts.len(),
                response.vectors.len()
            )));
        }
        for vector in &response.vectors {
            let wrong_size = match self.settings.dimensions {
                Some(dims) => vector.len() != dims,
                None => vector.is_empty(),
            };
            if wrong_size {
                return Err(ProviderError::Malformed(format!(
                    "vector of length {} (expected {:?})",
                    vector.len(),
                    self.settings.dimensions
                )));
            }
        }
        Ok(response.vectors)
    }

    async fn embed_batch(&self, stage: usize, idx: usize, batch: Vec<TagRow>) -> BatchOutcome {
        if self.cancel.is_cancelled() {
            return BatchOutcome::default();
        }
        let failed = BatchOutcome {
            embedded: 0,
            failed: batch.len() as u64,
        };
        let texts: Vec<String> = batch.iter().map(embedding_text).collect();
        let vectors = match retry::with_backoff("embed", &self.settings.retry, || {
            self.request_vectors(&texts)
        })
        .await
        {
            Ok(vectors) => vectors,
            Err(err) => {
                error!(stage, batch = idx, error = %err, "embedding batch failed");
                return failed;
            }
        };

        let rows: Vec<EmbeddedTag> = batch
            .iter()
            .zip(&vectors)
            .map(|(row, vector)| EmbeddedTag {
                tag: RemoteTag::from(row),
                embedding: vector.clone(),
            })
            .collect();
        if let Err(err) = retry::with_backoff("remote upsert embeddings", &self.settings.retry, || {
            self.remote.upsert_embeddings(&rows)
        })
        .await
        {
            error!(stage, batch = idx, error = %err, "remote embedding upsert failed");
            return failed;
        }

        let local: Vec<(String, Vec<f32>)> = batch
            .into_iter()
            .map(|row| row.name)
            .zip(vectors)
            .collect();
        match self.store.record_embeddings(&local).await {
            Ok(written) => BatchOutcome {
                embedded: written,
                failed: local.len() as u64 - written,
            },
            Err(err) => {
                error!(stage, batch = idx, error = %err, "failed to record embeddings locally");
                failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemoteStore;
    use crate::store::tests::{memory_store, tag};
    use providers::EmbedResponse;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct CountingEmbedder {
        dims: usize,
        submitted: Mutex<Vec<String>>,
        calls: AtomicUsize,
        /// Calls whose response drops the last vector.
        short_calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl EmbeddingProvider for CountingEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<EmbedResponse, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.submitted.lock().unwrap().extend(texts.iter().cloned());
            let mut vectors: Vec<Vec<f32>> = texts.iter().map(|_| vec![0.25; self.dims]).collect();
            if self.short_calls.load(Ordering::SeqCst) > 0 {
                self.short_calls.fetch_sub(1, Ordering::SeqCst);
                vectors.pop();
            }
            Ok(EmbedResponse { vectors })
        }
    }

    fn settings(thresholds: Vec<i64>) -> TierSettings {
        TierSettings {
            thresholds,
            batch_size: 2,
            concurrency: 2,
            dimensions: Some(3),
            min_stage_coverage: 0.99,
            classified_only: false,
            retry: RetryPolicy {
                max_attempts: 2,
                initial_backoff_ms: 1,
                max_backoff_ms: 2,
            },
        }
    }

    async fn seeded() -> TagStore {
        let store = memory_store().await;
        store
            .upsert_source_tags(&[
                tag("long_hair", Some(0), 900_000),
                tag("school_uniform", Some(0), 120_000),
                tag("mid_tag", Some(0), 60_000),
                tag("low_tag", Some(0), 20_000),
                tag("rare_tag", Some(0), 10),
            ])
            .await
            .unwrap();
        store
    }

    #[test]
    fn tiers_must_strictly_decrease() {
        assert!(validate_tiers(&[100, 10, 1]).is_ok());
        assert!(validate_tiers(&[100, 100]).is_err());
        assert!(validate_tiers(&[10, 100]).is_err());
        assert!(validate_tiers(&[]).is_err());
    }

    #[test]
    fn text_carries_category_context() {
        let row = TagRow {
            name: "school_uniform".into(),
            native_category: Some(0),
            usage_count: 1,
            main_category: Some("CHARACTER_RELATED".into()),
            sub_category: Some("CLOTHING".into()),
            classification_source: Some("rule_engine".into()),
            classification_confidence: None,
            classification_reasoning: None,
            classified_at: None,
            embedding: None,
            embedded_at: None,
        };
        assert_eq!(embedding_text(&row), "school uniform | CHARACTER_RELATED/CLOTHING");
    }

    #[tokio::test]
    async fn tag_enters_at_its_tier_and_is_never_resubmitted() {
        let store = seeded().await;
        let provider = Arc::new(CountingEmbedder {
            dims: 3,
            ..Default::default()
        });
        let remote = Arc::new(MemoryRemoteStore::new());
        let embedder = TieredEmbedder::new(
            store.clone(),
            provider.clone(),
            remote.clone(),
            settings(vec![100_000, 50_000, 10_000]),
        )
        .unwrap();

        let first = embedder.run(Some(1)).await.unwrap();
        assert_eq!(first.stages.len(), 1);
        assert_eq!(first.stages[0].embedded, 2);
        assert!(store.get("mid_tag").await.unwrap().unwrap().embedding.is_none());

        let full = embedder.run(None).await.unwrap();
        assert_eq!(full.stages.len(), 3);
        assert_eq!(full.stages[0].embedded, 0);
        assert_eq!(full.stages[1].embedded, 1);
        assert_eq!(full.stages[2].embedded, 1);
        assert_eq!(full.stages[2].coverage, 1.0);
        assert!(full.halted.is_none());

        let submitted = provider.submitted.lock().unwrap().clone();
        assert_eq!(submitted.len(), 4);
        assert!(submitted.iter().any(|t| t.starts_with("mid tag")));
        assert!(!submitted.iter().any(|t| t.starts_with("rare tag")));
        assert_eq!(remote.count_embedded(50_000).await.unwrap(), 3);
        assert_eq!(
            store.get("mid_tag").await.unwrap().unwrap().embedding_vector(),
            Some(vec![0.25; 3])
        );
    }

    #[tokio::test]
    async fn under_covered_tier_halts_rollout() {
        let store = seeded().await;
        let provider = Arc::new(CountingEmbedder {
            dims: 3,
            ..Default::default()
        });
        // fails every attempt of the first batch
        provider.short_calls.store(2, Ordering::SeqCst);
        let remote = Arc::new(MemoryRemoteStore::new());
        let mut cfg = settings(vec![100_000, 50_000]);
        cfg.concurrency = 1;
        let embedder = TieredEmbedder::new(store.clone(), provider, remote, cfg).unwrap();

        let summary = embedder.run(None).await.unwrap();
        assert_eq!(summary.stages.len(), 1);
        assert_eq!(summary.stages[0].failed, 2);
        assert_eq!(summary.stages[0].coverage, 0.0);
        let halt = summary.halted.unwrap();
        assert_eq!(halt.stage, 1);
        assert_eq!(halt.threshold, 50_000);
        assert!(store.get("mid_tag").await.unwrap().unwrap().embedding.is_none());
    }

    #[tokio::test]
    async fn wrong_dimensions_are_not_recorded() {
        let store = seeded().await;
        let provider = Arc::new(CountingEmbedder {
            dims: 5,
            ..Default::default()
        });
        let remote = Arc::new(MemoryRemoteStore::new());
        let embedder =
            TieredEmbedder::new(store.clone(), provider, remote.clone(), settings(vec![100_000]))
                .unwrap();
        let summary = embedder.run(None).await.unwrap();
        assert_eq!(summary.stages[0].embedded, 0);
        assert_eq!(summary.stages[0].failed, 2);
        assert!(remote.is_empty());
        assert_eq!(store.counts().await.unwrap().embedded, 0);
    }

    #[tokio::test]
    async fn remote_failure_leaves_local_state_untouched() {
        let store = seeded().await;
        let provider = Arc::new(CountingEmbedder {
            dims: 3,
            ..Default::default()
        });
        let remote = Arc::new(MemoryRemoteStore::new());
        remote.push_failure(ProviderError::Status {
            code: 400,
            body: "rejected".into(),
        });
        let embedder =
            TieredEmbedder::new(store.clone(), provider, remote, settings(vec![100_000])).unwrap();
        let summary = embedder.run(None).await.unwrap();
        assert_eq!(summary.stages[0].failed, 2);
        assert_eq!(store.counts().await.unwrap().embedded, 0);
    }

    #[tokio::test]
    async fn rejects_bad_settings() {
        let store = memory_store().await;
        let build = |s: TierSettings| {
            TieredEmbedder::new(
                store.clone(),
                Arc::new(CountingEmbedder::default()),
                Arc::new(MemoryRemoteStore::new()),
                s,
            )
        };
        assert!(build(settings(vec![10, 100])).is_err());
        let mut bad = settings(vec![100, 10]);
        bad.min_stage_coverage = 1.5;
        assert!(build(bad).is_err());
        assert!(build(settings(vec![100, 10])).is_ok());
    }
}
