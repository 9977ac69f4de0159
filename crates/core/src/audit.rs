//! Read-only coverage and quality statistics over the tag store.

use crate::models::{ClassificationSource, MANUAL_SOURCE, RULE_ENGINE_SOURCE};
use crate::rules::PatternKind;
use crate::taxonomy::Taxonomy;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpotCheckSpec {
    pub kind: PatternKind,
    pub pattern: String,
    pub expected_main: String,
    #[serde(default = "default_min_accuracy")]
    pub min_accuracy: f64,
}

fn default_min_accuracy() -> f64 {
    0.9
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub bucket_edges: Vec<i64>,
    pub confidence_floor: f64,
    /// How many misclassified names a spot check reports.
    pub sample_size: i64,
    pub spot_checks: Vec<SpotCheckSpec>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            bucket_edges: vec![1000, 3000, 5000, 10000, 20000, 30000, 50000, 100000],
            confidence_floor: 0.70,
            sample_size: 10,
            spot_checks: vec![SpotCheckSpec {
                kind: PatternKind::Substring,
                pattern: "background".into(),
                expected_main: "ENVIRONMENT".into(),
                min_accuracy: default_min_accuracy(),
            }],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoverageRow {
    pub native_category: Option<i64>,
    pub total: i64,
    pub classified: i64,
    pub coverage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoverageReport {
    pub total: i64,
    pub classified: i64,
    pub coverage: f64,
    pub by_native_category: Vec<CoverageRow>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageBucket {
    pub min_usage: i64,
    /// Exclusive; `None` for the open-ended top bucket.
    pub max_usage: Option<i64>,
    pub unclassified: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceQuality {
    pub source: String,
    /// The source is an oracle model rather than the rules or a person.
    pub llm: bool,
    pub tags: i64,
    pub total_usage: i64,
    pub mean_confidence: f64,
    pub min_confidence: f64,
    pub max_confidence: f64,
    pub flagged: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ConfidenceHistogram {
    pub high: i64,
    pub medium: i64,
    pub low: i64,
    pub very_low: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Misclassified {
    pub name: String,
    pub main_category: String,
    pub usage_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpotCheckResult {
    pub kind: PatternKind,
    pub pattern: String,
    pub expected_main: String,
    /// Classified tags matching the pattern.
    pub matched: i64,
    pub correct: i64,
    pub unclassified: i64,
    pub accuracy: f64,
    pub misclassified: Vec<Misclassified>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct IntegrityReport {
    pub source_mismatch: i64,
    pub sub_without_main: i64,
    pub null_strings: i64,
    pub unknown_main: i64,
    pub invalid_sub: i64,
    pub llm_missing_confidence: i64,
}

impl IntegrityReport {
    pub fn violations(&self) -> i64 {
        self.source_mismatch
            + self.sub_without_main
            + self.null_strings
            + self.unknown_main
            + self.invalid_sub
            + self.llm_missing_confidence
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditAlert {
    LowConfidenceSource {
        severity: Severity,
        source: String,
        mean_confidence: f64,
    },
    SpotCheckFailed {
        severity: Severity,
        pattern: String,
        expected_main: String,
        accuracy: f64,
    },
    IntegrityViolation {
        severity: Severity,
        violations: i64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditReport {
    pub generated_at: String,
    pub coverage: CoverageReport,
    pub unclassified_by_usage: Vec<UsageBucket>,
    pub sources: Vec<SourceQuality>,
    pub confidence_histogram: ConfidenceHistogram,
    pub spot_checks: Vec<SpotCheckResult>,
    pub integrity: IntegrityReport,
    pub alerts: Vec<AuditAlert>,
}

fn ratio(part: i64, whole: i64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

/// SQL predicate on `lower(name)` for a spot-check pattern bound as `?1`.
/// `instr`/`substr` are used instead of LIKE so `_` stays literal.
fn pattern_predicate(kind: PatternKind) -> &'static str {
    match kind {
        PatternKind::Exact => "lower(name) = ?1",
        PatternKind::Suffix => {
            "length(name) >= length(?1) AND substr(lower(name), length(name) - length(?1) + 1) = ?1"
        }
        PatternKind::Prefix => "substr(lower(name), 1, length(?1)) = ?1",
        PatternKind::Substring => "instr(lower(name), ?1) > 0",
    }
}

pub struct CoverageAuditor {
    pool: SqlitePool,
    taxonomy: Arc<Taxonomy>,
}

impl CoverageAuditor {
    pub fn new(pool: SqlitePool, taxonomy: Arc<Taxonomy>) -> Self {
        Self { pool, taxonomy }
    }

    pub async fn coverage(&self) -> anyhow::Result<CoverageReport> {
        let (total, classified): (i64, i64) =
            sqlx::query_as("SELECT COUNT(*), COUNT(main_category) FROM tags")
                .fetch_one(&self.pool)
                .await?;
        let rows: Vec<(Option<i64>, i64, i64)> = sqlx::query_as(
            r#"
            SELECT native_category, COUNT(*), COUNT(main_category)
            FROM tags GROUP BY native_category ORDER BY native_category
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(CoverageReport {
            total,
            classified,
            coverage: ratio(classified, total),
            by_native_category: rows
                .into_iter()
                .map(|(native_category, total, classified)| CoverageRow {
                    native_category,
                    total,
                    classified,
                    coverage: ratio(classified, total),
                })
                .collect(),
        })
    }

    /// Unclassified tags per usage bucket. `edges` must be strictly
    /// increasing.
    pub async fn unclassified_by_usage(&self, edges: &[i64]) -> anyhow::Result<Vec<UsageBucket>> {
        if edges.windows(2).any(|w| w[0] >= w[1]) {
            anyhow::bail!("bucket edges must be strictly increasing: {edges:?}");
        }
        let mut buckets = Vec::with_capacity(edges.len());
        for (i, &min_usage) in edges.iter().enumerate() {
            let max_usage = edges.get(i + 1).copied();
            let unclassified: i64 = sqlx::query_scalar(
                r#"
                SELECT COUNT(*) FROM tags
                WHERE main_category IS NULL
                  AND usage_count >= ?1
                  AND (?2 IS NULL OR usage_count < ?2)
                "#,
            )
            .bind(min_usage)
            .bind(max_usage)
            .fetch_one(&self.pool)
            .await?;
            buckets.push(UsageBucket {
                min_usage,
                max_usage,
                unclassified,
            });
        }
        Ok(buckets)
    }

    /// Per-source statistics, weakest mean confidence first. Rows without a
    /// confidence count as 1.0.
    pub async fn source_quality(&self, floor: f64) -> anyhow::Result<Vec<SourceQuality>> {
        let rows: Vec<(String, i64, i64, f64, f64, f64)> = sqlx::query_as(
            r#"
            SELECT classification_source,
                   COUNT(*),
                   COALESCE(SUM(usage_count), 0),
                   AVG(COALESCE(classification_confidence, 1.0)),
                   MIN(COALESCE(classification_confidence, 1.0)),
                   MAX(COALESCE(classification_confidence, 1.0))
            FROM tags
            WHERE classification_source IS NOT NULL
            GROUP BY classification_source
            ORDER BY 4 ASC, classification_source ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(source, tags, total_usage, mean, min, max)| SourceQuality {
                llm: ClassificationSource::parse(&source).is_llm(),
                source,
                tags,
                total_usage,
                mean_confidence: mean,
                min_confidence: min,
                max_confidence: max,
                flagged: mean < floor,
            })
            .collect())
    }

    /// Confidence bands over rows that carry a confidence from the oracle.
    pub async fn confidence_histogram(&self) -> anyhow::Result<ConfidenceHistogram> {
        let (high, medium, low, very_low): (i64, i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN classification_confidence >= 0.90 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN classification_confidence >= 0.75 AND classification_confidence < 0.90 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN classification_confidence >= 0.60 AND classification_confidence < 0.75 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN classification_confidence < 0.60 THEN 1 ELSE 0 END), 0)
            FROM tags
            WHERE classification_confidence IS NOT NULL
              AND classification_source NOT IN (?1, ?2)
            "#,
        )
        .bind(RULE_ENGINE_SOURCE)
        .bind(MANUAL_SOURCE)
        .fetch_one(&self.pool)
        .await?;
        Ok(ConfidenceHistogram {
            high,
            medium,
            low,
            very_low,
        })
    }

    pub async fn spot_check(
        &self,
        kind: PatternKind,
        pattern: &str,
        expected_main: &str,
        sample_size: i64,
    ) -> anyhow::Result<SpotCheckResult> {
        let pattern = pattern.trim().to_lowercase();
        let predicate = pattern_predicate(kind);
        let (matched, correct, unclassified): (i64, i64, i64) = sqlx::query_as(&format!(
            r#"
            SELECT
                COUNT(main_category),
                COALESCE(SUM(CASE WHEN main_category = ?2 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN main_category IS NULL THEN 1 ELSE 0 END), 0)
            FROM tags WHERE {predicate}
            "#
        ))
        .bind(&pattern)
        .bind(expected_main)
        .fetch_one(&self.pool)
        .await?;
        let misclassified: Vec<(String, String, i64)> = sqlx::query_as(&format!(
            r#"
            SELECT name, main_category, usage_count FROM tags
            WHERE {predicate} AND main_category IS NOT NULL AND main_category != ?2
            ORDER BY usage_count DESC, name ASC
            LIMIT ?3
            "#
        ))
        .bind(&pattern)
        .bind(expected_main)
        .bind(sample_size)
        .fetch_all(&self.pool)
        .await?;
        Ok(SpotCheckResult {
            kind,
            pattern,
            expected_main: expected_main.to_string(),
            matched,
            correct,
            unclassified,
            accuracy: if matched == 0 { 1.0 } else { ratio(correct, matched) },
            misclassified: misclassified
                .into_iter()
                .map(|(name, main_category, usage_count)| Misclassified {
                    name,
                    main_category,
                    usage_count,
                })
                .collect(),
        })
    }

    /// Counts rows that break the classification invariants. Nothing is
    /// repaired.
    pub async fn integrity(&self) -> anyhow::Result<IntegrityReport> {
        let (source_mismatch, sub_without_main, null_strings, llm_missing_confidence): (
            i64,
            i64,
            i64,
            i64,
        ) = sqlx::query_as(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN (main_category IS NULL) != (classification_source IS NULL) THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN sub_category IS NOT NULL AND main_category IS NULL THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN lower(main_category) IN ('null', '') OR lower(sub_category) IN ('null', '') THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN classification_source NOT IN (?1, ?2) AND classification_confidence IS NULL THEN 1 ELSE 0 END), 0)
            FROM tags
            "#,
        )
        .bind(RULE_ENGINE_SOURCE)
        .bind(MANUAL_SOURCE)
        .fetch_one(&self.pool)
        .await?;

        let pairs: Vec<(String, Option<String>, i64)> = sqlx::query_as(
            r#"
            SELECT main_category, sub_category, COUNT(*) FROM tags
            WHERE main_category IS NOT NULL
            GROUP BY main_category, sub_category
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        let mut unknown_main = 0;
        let mut invalid_sub = 0;
        for (main, sub, count) in pairs {
            if main.eq_ignore_ascii_case("null") || main.is_empty() {
                continue;
            }
            if !self.taxonomy.contains_main(&main) {
                unknown_main += count;
            } else if let Some(sub) = sub.filter(|s| !s.eq_ignore_ascii_case("null") && !s.is_empty()) {
                if !self.taxonomy.permits(&main, &sub) {
                    invalid_sub += count;
                }
            }
        }
        Ok(IntegrityReport {
            source_mismatch,
            sub_without_main,
            null_strings,
            unknown_main,
            invalid_sub,
            llm_missing_confidence,
        })
    }

    /// Runs every check and derives alerts.
    pub async fn run(&self, config: &AuditConfig) -> anyhow::Result<AuditReport> {
        let coverage = self.coverage().await?;
        let unclassified_by_usage = self.unclassified_by_usage(&config.bucket_edges).await?;
        let sources = self.source_quality(config.confidence_floor).await?;
        let confidence_histogram = self.confidence_histogram().await?;
        let mut spot_checks = Vec::with_capacity(config.spot_checks.len());
        for spec in &config.spot_checks {
            spot_checks.push(
                self.spot_check(spec.kind, &spec.pattern, &spec.expected_main, config.sample_size)
                    .await?,
            );
        }
        let integrity = self.integrity().await?;

        let mut alerts = Vec::new();
        for source in sources.iter().filter(|s| s.flagged) {
            alerts.push(AuditAlert::LowConfidenceSource {
                severity: Severity::Warning,
                source: source.source.clone(),
                mean_confidence: source.mean_confidence,
            });
        }
        for (spec, result) in config.spot_checks.iter().zip(&spot_checks) {
            if result.accuracy < spec.min_accuracy {
                alerts.push(AuditAlert::SpotCheckFailed {
                    severity: Severity::Warning,
                    pattern: result.pattern.clone(),
                    expected_main: result.expected_main.clone(),
                    accuracy: result.accuracy,
                });
            }
        }
        if integrity.violations() > 0 {
            alerts.push(AuditAlert::IntegrityViolation {
                severity: Severity::Error,
                violations: integrity.violations(),
            });
        }
        for alert in &alerts {
            tracing::warn!(?alert, "audit alert");
        }
        tracing::info!(
            total = coverage.total,
            classified = coverage.classified,
            coverage = coverage.coverage,
            alerts = alerts.len(),
            "audit complete"
        );

        Ok(AuditReport {
            generated_at: chrono::Utc::now().to_rfc3339(),
            coverage,
            unclassified_by_usage,
            sources,
            confidence_histogram,
            spot_checks,
            integrity,
            alerts,
        })
    }
}
