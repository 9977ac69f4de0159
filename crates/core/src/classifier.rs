//! Oracle-backed classification of the tags the rule engine leaves behind.

use crate::models::{Confidence, ConfidenceError};
use crate::retry::{self, RetryPolicy};
use crate::store::TagStore;
use crate::taxonomy::{Classification, Taxonomy, TaxonomyError};
use anyhow::Context;
use futures::stream::{self, StreamExt};
use providers::{ClassificationOracle, OracleRequest, OracleTag, OracleVerdict};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;
use storage::models::PendingTag;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub batch_size: usize,
    pub concurrency: usize,
    /// Mean batch confidence below this logs a warning.
    pub quality_floor: f64,
    pub retry: RetryPolicy,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            batch_size: 20,
            concurrency: 2,
            quality_floor: 0.70,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClassifySummary {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    /// Valid verdicts for tags that were classified elsewhere in the meantime.
    pub skipped: u64,
    pub cancelled: bool,
}

impl ClassifySummary {
    fn absorb(&mut self, other: ClassifySummary) {
        self.total += other.total;
        self.success += other.success;
        self.failed += other.failed;
        self.skipped += other.skipped;
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum VerdictRejection {
    #[error("no verdict returned for tag")]
    Missing,
    #[error("verdict has no main category")]
    MissingMain,
    #[error(transparent)]
    Taxonomy(#[from] TaxonomyError),
    #[error("verdict has no confidence")]
    MissingConfidence,
    #[error(transparent)]
    Confidence(#[from] ConfidenceError),
}

fn normalized_field(raw: Option<&str>) -> Option<&str> {
    raw.map(str::trim)
        .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("null"))
}

/// Checks an oracle verdict against the taxonomy and the confidence range.
pub fn validate_verdict(
    taxonomy: &Taxonomy,
    verdict: Option<&OracleVerdict>,
) -> Result<(Classification, Confidence), VerdictRejection> {
    let verdict = verdict.ok_or(VerdictRejection::Missing)?;
    let main =
        normalized_field(verdict.main_category.as_deref()).ok_or(VerdictRejection::MissingMain)?;
    let sub = normalized_field(verdict.sub_category.as_deref());
    let classification = taxonomy.classification(main, sub)?;
    let confidence = Confidence::new(
        verdict
            .confidence
            .ok_or(VerdictRejection::MissingConfidence)?,
    )?;
    Ok((classification, confidence))
}

fn native_hint(native: Option<i64>) -> String {
    match native {
        Some(0) => "general".to_string(),
        Some(code) => format!("source category {code}"),
        None => "unknown".to_string(),
    }
}

/// Renders the instructions for one batch from the taxonomy.
pub fn build_prompt(taxonomy: &Taxonomy, tags: &[PendingTag]) -> String {
    let mut prompt = String::from(
        "You classify image-board tags into a fixed two-level taxonomy.\n\n\
         Main categories (code: description) and their allowed sub categories:\n",
    );
    for main in taxonomy.categories() {
        let _ = writeln!(prompt, "- {}: {}", main.code, main.description);
        if main.subs.is_empty() {
            let _ = writeln!(prompt, "    (no sub categories, use null)");
        }
        for sub in &main.subs {
            let _ = writeln!(prompt, "    - {}: {}", sub.code, sub.description);
        }
    }
    prompt.push_str(
        "\nGuidelines:\n\
         - Pick exactly one main category code from the list.\n\
         - Use a sub category only if it is listed under that main category, otherwise null.\n\
         - Names of specific characters, series and artists belong to CHARACTER, COPYRIGHT and ARTIST.\n\
         - Background and scenery tags belong to ENVIRONMENT.\n\
         - confidence is a number in [0, 1]: 0.9 or more when the meaning is unambiguous, \
         0.6 to 0.9 when a reasonable alternative exists, below 0.6 when guessing.\n\
         - reasoning is one short sentence.\n\nTags (name, source hint):\n",
    );
    for (i, tag) in tags.iter().enumerate() {
        let _ = writeln!(
            prompt,
            "{}. {} ({})",
            i + 1,
            tag.name,
            native_hint(tag.native_category)
        );
    }
    prompt.push_str(
        "\nAnswer with JSON only, one entry per tag:\n\
         {\"classifications\": [{\"tag\": \"...\", \"main_category\": \"...\", \
         \"sub_category\": null, \"confidence\": 0.0, \"reasoning\": \"...\"}]}\n",
    );
    prompt
}

fn key(name: &str) -> String {
    name.trim().to_lowercase()
}

pub struct LlmClassifier {
    store: TagStore,
    oracle: Arc<dyn ClassificationOracle>,
    taxonomy: Arc<Taxonomy>,
    settings: LlmSettings,
    cancel: CancellationToken,
}

impl LlmClassifier {
    pub fn new(
        store: TagStore,
        oracle: Arc<dyn ClassificationOracle>,
        taxonomy: Arc<Taxonomy>,
        settings: LlmSettings,
    ) -> Self {
        Self {
            store,
            oracle,
            taxonomy,
            settings,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Classifies unclassified general tags with `usage_count >= min_usage_count`,
    /// most used first. Per-tag and per-batch failures are counted, not returned.
    pub async fn process_unclassified_tags(
        &self,
        min_usage_count: i64,
        limit: Option<i64>,
    ) -> anyhow::Result<ClassifySummary> {
        self.oracle
            .ping()
            .await
            .with_context(|| format!("oracle {} is unreachable", self.oracle.model_id()))?;

        let pending = self.store.llm_candidates(min_usage_count, limit).await?;
        let batch_size = self.settings.batch_size.max(1);
        let batches: Vec<Vec<PendingTag>> =
            pending.chunks(batch_size).map(|c| c.to_vec()).collect();
        info!(
            model = self.oracle.model_id(),
            tags = pending.len(),
            batches = batches.len(),
            min_usage_count,
            "starting oracle classification"
        );

        let outcomes: Vec<Option<ClassifySummary>> = stream::iter(batches.into_iter().enumerate())
            .map(|(idx, batch)| self.run_batch(idx, batch))
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect()
            .await;

        let mut summary = ClassifySummary::default();
        for outcome in outcomes {
            match outcome {
                Some(batch) => summary.absorb(batch),
                None => summary.cancelled = true,
            }
        }
        info!(
            total = summary.total,
            success = summary.success,
            failed = summary.failed,
            skipped = summary.skipped,
            cancelled = summary.cancelled,
            "oracle classification complete"
        );
        Ok(summary)
    }

    /// `None` when the batch was never started because of cancellation.
    async fn run_batch(&self, idx: usize, batch: Vec<PendingTag>) -> Option<ClassifySummary> {
        if self.cancel.is_cancelled() {
            return None;
        }
        let request = OracleRequest {
            prompt: build_prompt(&self.taxonomy, &batch),
            tags: batch
                .iter()
                .map(|t| OracleTag {
                    name: t.name.clone(),
                    native_category: t.native_category,
                })
                .collect(),
        };
        let mut summary = ClassifySummary {
            total: batch.len() as u64,
            ..Default::default()
        };

        let verdicts = match retry::with_backoff("oracle classify", &self.settings.retry, || {
            self.oracle.classify(&request)
        })
        .await
        {
            Ok(verdicts) => verdicts,
            Err(err) => {
                error!(batch = idx, tags = batch.len(), error = %err, "oracle batch failed");
                summary.failed = summary.total;
                return Some(summary);
            }
        };

        let mut by_tag: HashMap<String, OracleVerdict> = HashMap::with_capacity(verdicts.len());
        for verdict in verdicts {
            by_tag.entry(key(&verdict.tag)).or_insert(verdict);
        }

        let mut confidence_sum = 0.0;
        for tag in &batch {
            let verdict = by_tag.get(&key(&tag.name));
            let (classification, confidence) = match validate_verdict(&self.taxonomy, verdict) {
                Ok(accepted) => accepted,
                Err(reason) => {
                    debug!(tag = %tag.name, %reason, "verdict rejected");
                    summary.failed += 1;
                    continue;
                }
            };
            let reasoning = verdict.and_then(|v| v.reasoning.as_deref());
            match self
                .store
                .apply_llm_classification(
                    &tag.name,
                    &classification,
                    self.oracle.model_id(),
                    confidence,
                    reasoning,
                )
                .await
            {
                Ok(true) => {
                    summary.success += 1;
                    confidence_sum += confidence.value();
                }
                Ok(false) => summary.skipped += 1,
                Err(err) => {
                    error!(tag = %tag.name, error = %err, "failed to store classification");
                    summary.failed += 1;
                }
            }
        }

        let success_rate = summary.success as f64 / summary.total.max(1) as f64;
        let mean_confidence = if summary.success > 0 {
            confidence_sum / summary.success as f64
        } else {
            0.0
        };
        info!(
            batch = idx,
            success = summary.success,
            failed = summary.failed,
            skipped = summary.skipped,
            success_rate,
            mean_confidence,
            "batch quality"
        );
        if summary.success > 0 && mean_confidence < self.settings.quality_floor {
            warn!(
                batch = idx,
                mean_confidence,
                floor = self.settings.quality_floor,
                "batch confidence below floor"
            );
        }
        Some(summary)
    }
}
