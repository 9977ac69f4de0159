//! Persistent classification state of every tag.
//!
//! Classifier writes are guarded by `main_category IS NULL` and embedding
//! writes by `embedding IS NULL`, so concurrent passes can never overwrite
//! each other. Only [`TagStore::set_manual_override`] replaces an existing
//! classification.

use crate::models::{ClassificationSource, Confidence, SourceTag, MANUAL_SOURCE};
use crate::taxonomy::Classification;
use anyhow::Context;
use serde::Serialize;
use sqlx::SqlitePool;
use storage::models::{PendingTag, TagRow};

const NOW: &str = "CAST(strftime('%s','now') AS INTEGER)";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreCounts {
    pub total: i64,
    pub classified: i64,
    pub embedded: i64,
}

#[derive(Clone)]
pub struct TagStore {
    pool: SqlitePool,
}

impl TagStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Creates or refreshes tags. `usage_count` never decreases and
    /// classification or embedding fields are left alone.
    pub async fn upsert_source_tags(&self, tags: &[SourceTag]) -> anyhow::Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut written = 0;
        for tag in tags {
            let res = sqlx::query(
                r#"
                INSERT INTO tags (name, native_category, usage_count)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(name) DO UPDATE SET
                    native_category = COALESCE(excluded.native_category, tags.native_category),
                    usage_count = MAX(tags.usage_count, excluded.usage_count)
                "#,
            )
            .bind(&tag.name)
            .bind(tag.native_category)
            .bind(tag.usage_count)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("upsert tag {}", tag.name))?;
            written += res.rows_affected();
        }
        tx.commit().await?;
        Ok(written)
    }

    pub async fn get(&self, name: &str) -> anyhow::Result<Option<TagRow>> {
        let row = sqlx::query_as::<_, TagRow>("SELECT * FROM tags WHERE name = ?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn counts(&self) -> anyhow::Result<StoreCounts> {
        let (total, classified, embedded): (i64, i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COUNT(main_category), COUNT(embedding) FROM tags",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(StoreCounts {
            total,
            classified,
            embedded,
        })
    }

    /// Every unclassified tag, most used first.
    pub async fn unclassified(&self) -> anyhow::Result<Vec<PendingTag>> {
        let rows = sqlx::query_as::<_, PendingTag>(
            r#"
            SELECT name, native_category, usage_count FROM tags
            WHERE main_category IS NULL
            ORDER BY usage_count DESC, name ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Unclassified general-category tags worth an oracle call.
    pub async fn llm_candidates(
        &self,
        min_usage_count: i64,
        limit: Option<i64>,
    ) -> anyhow::Result<Vec<PendingTag>> {
        let rows = sqlx::query_as::<_, PendingTag>(
            r#"
            SELECT name, native_category, usage_count FROM tags
            WHERE main_category IS NULL
              AND (native_category IS NULL OR native_category = 0)
              AND usage_count >= ?1
            ORDER BY usage_count DESC, name ASC
            LIMIT ?2
            "#,
        )
        .bind(min_usage_count)
        .bind(limit.unwrap_or(-1))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Writes rule-engine matches in one transaction and returns how many
    /// rows were actually classified.
    pub async fn apply_rule_matches(
        &self,
        matches: &[(String, Classification)],
    ) -> anyhow::Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut applied = 0;
        for (name, classification) in matches {
            let res = sqlx::query(&format!(
                r#"
                UPDATE tags SET
                    main_category = ?2,
                    sub_category = ?3,
                    classification_source = ?4,
                    classification_confidence = NULL,
                    classification_reasoning = NULL,
                    classified_at = {NOW}
                WHERE name = ?1 AND main_category IS NULL
                "#
            ))
            .bind(name)
            .bind(classification.main())
            .bind(classification.sub())
            .bind(ClassificationSource::RuleEngine.as_str())
            .execute(&mut *tx)
            .await?;
            applied += res.rows_affected();
        }
        tx.commit().await?;
        Ok(applied)
    }

    /// Records an oracle verdict. Returns `false` when the tag was already
    /// classified (or no longer exists).
    pub async fn apply_llm_classification(
        &self,
        name: &str,
        classification: &Classification,
        model: &str,
        confidence: Confidence,
        reasoning: Option<&str>,
    ) -> anyhow::Result<bool> {
        let res = sqlx::query(&format!(
            r#"
            UPDATE tags SET
                main_category = ?2,
                sub_category = ?3,
                classification_source = ?4,
                classification_confidence = ?5,
                classification_reasoning = ?6,
                classified_at = {NOW}
            WHERE name = ?1 AND main_category IS NULL
            "#
        ))
        .bind(name)
        .bind(classification.main())
        .bind(classification.sub())
        .bind(model)
        .bind(confidence.value())
        .bind(reasoning)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    /// Unconditionally sets a manual classification. Returns `false` for an
    /// unknown tag.
    pub async fn set_manual_override(
        &self,
        name: &str,
        classification: &Classification,
        reasoning: Option<&str>,
    ) -> anyhow::Result<bool> {
        let res = sqlx::query(&format!(
            r#"
            UPDATE tags SET
                main_category = ?2,
                sub_category = ?3,
                classification_source = ?4,
                classification_confidence = ?6,
                classification_reasoning = ?5,
                classified_at = {NOW}
            WHERE name = ?1
            "#
        ))
        .bind(name)
        .bind(classification.main())
        .bind(classification.sub())
        .bind(MANUAL_SOURCE)
        .bind(reasoning)
        .bind(Confidence::FULL.value())
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    /// Clears every classification produced by `source` so it can be redone.
    /// Manual overrides are final and cannot be reset.
    pub async fn reset_source(&self, source: &str) -> anyhow::Result<u64> {
        if ClassificationSource::parse(source) == ClassificationSource::Manual {
            anyhow::bail!("manual overrides cannot be reset");
        }
        let res = sqlx::query(
            r#"
            UPDATE tags SET
                main_category = NULL,
                sub_category = NULL,
                classification_source = NULL,
                classification_confidence = NULL,
                classification_reasoning = NULL,
                classified_at = NULL
            WHERE classification_source = ?1
            "#,
        )
        .bind(source)
        .execute(&self.pool)
        .await?;
        tracing::info!(source, rows = res.rows_affected(), "classification source reset");
        Ok(res.rows_affected())
    }

    /// Rows selected for migration, in export order.
    pub async fn export_rows(&self, classified_only: bool) -> anyhow::Result<Vec<TagRow>> {
        let rows = sqlx::query_as::<_, TagRow>(
            r#"
            SELECT * FROM tags
            WHERE (?1 = 0 OR main_category IS NOT NULL)
            ORDER BY usage_count DESC, name ASC
            "#,
        )
        .bind(classified_only)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn count_export(&self, classified_only: bool) -> anyhow::Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM tags WHERE (?1 = 0 OR main_category IS NOT NULL)",
        )
        .bind(classified_only)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Tags at or above `min_usage_count` that still lack an embedding,
    /// restricted to the export selection.
    pub async fn embedding_candidates(
        &self,
        min_usage_count: i64,
        classified_only: bool,
    ) -> anyhow::Result<Vec<TagRow>> {
        let rows = sqlx::query_as::<_, TagRow>(
            r#"
            SELECT * FROM tags
            WHERE embedding IS NULL AND usage_count >= ?1
              AND (?2 = 0 OR main_category IS NOT NULL)
            ORDER BY usage_count DESC, name ASC
            "#,
        )
        .bind(min_usage_count)
        .bind(classified_only)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// `(eligible, embedded)` for tags at or above `min_usage_count` within
    /// the export selection.
    pub async fn embedding_coverage(
        &self,
        min_usage_count: i64,
        classified_only: bool,
    ) -> anyhow::Result<(i64, i64)> {
        let counts: (i64, i64) = sqlx::query_as(
            r#"
            SELECT COUNT(*), COUNT(embedding) FROM tags
            WHERE usage_count >= ?1 AND (?2 = 0 OR main_category IS NOT NULL)
            "#,
        )
        .bind(min_usage_count)
        .bind(classified_only)
        .fetch_one(&self.pool)
        .await?;
        Ok(counts)
    }

    /// Stores vectors for tags that do not have one yet. Returns how many
    /// rows were written.
    pub async fn record_embeddings(&self, items: &[(String, Vec<f32>)]) -> anyhow::Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut written = 0;
        for (name, vector) in items {
            let encoded = serde_json::to_string(vector)?;
            let res = sqlx::query(&format!(
                "UPDATE tags SET embedding = ?2, embedded_at = {NOW} WHERE name = ?1 AND embedding IS NULL"
            ))
            .bind(name)
            .bind(encoded)
            .execute(&mut *tx)
            .await?;
            written += res.rows_affected();
        }
        tx.commit().await?;
        Ok(written)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::taxonomy::Taxonomy;

    pub(crate) async fn memory_store() -> TagStore {
        let pool = storage::connect("sqlite::memory:").await.unwrap();
        storage::migrate(&pool).await.unwrap();
        TagStore::new(pool)
    }

    pub(crate) fn tag(name: &str, native: Option<i64>, usage: i64) -> SourceTag {
        SourceTag {
            name: name.to_string(),
            native_category: native,
            usage_count: usage,
        }
    }

    #[tokio::test]
    async fn usage_count_never_decreases() {
        let store = memory_store().await;
        store.upsert_source_tags(&[tag("smile", Some(0), 500)]).await.unwrap();
        store.upsert_source_tags(&[tag("smile", Some(0), 300)]).await.unwrap();
        assert_eq!(store.get("smile").await.unwrap().unwrap().usage_count, 500);
        store.upsert_source_tags(&[tag("smile", None, 900)]).await.unwrap();
        let row = store.get("smile").await.unwrap().unwrap();
        assert_eq!(row.usage_count, 900);
        assert_eq!(row.native_category, Some(0));
    }

    #[tokio::test]
    async fn classifier_writes_are_guarded() {
        let store = memory_store().await;
        let tax = Taxonomy::builtin();
        store.upsert_source_tags(&[tag("sky", Some(0), 10)]).await.unwrap();
        let env = tax.classification("ENVIRONMENT", Some("NATURE")).unwrap();
        let obj = tax.classification("OBJECTS", None).unwrap();
        let conf = Confidence::new(0.8).unwrap();

        assert!(store
            .apply_llm_classification("sky", &env, "model-a", conf, Some("outdoor"))
            .await
            .unwrap());
        assert!(!store
            .apply_llm_classification("sky", &obj, "model-b", conf, None)
            .await
            .unwrap());
        assert_eq!(
            store.apply_rule_matches(&[("sky".into(), obj)]).await.unwrap(),
            0
        );
        let row = store.get("sky").await.unwrap().unwrap();
        assert_eq!(row.main_category.as_deref(), Some("ENVIRONMENT"));
        assert_eq!(row.classification_source.as_deref(), Some("model-a"));
        assert!(row.classified_at.is_some());
    }

    #[tokio::test]
    async fn manual_override_is_final() {
        let store = memory_store().await;
        let tax = Taxonomy::builtin();
        store.upsert_source_tags(&[tag("cat", Some(0), 10)]).await.unwrap();
        let objects = tax.classification("OBJECTS", Some("ANIMALS")).unwrap();
        assert!(store
            .set_manual_override("cat", &objects, Some("curated"))
            .await
            .unwrap());
        assert!(!store.set_manual_override("dog", &objects, None).await.unwrap());

        let env = tax.classification("ENVIRONMENT", None).unwrap();
        assert_eq!(store.apply_rule_matches(&[("cat".into(), env)]).await.unwrap(), 0);
        assert!(store.reset_source(MANUAL_SOURCE).await.is_err());
        let row = store.get("cat").await.unwrap().unwrap();
        assert_eq!(row.classification_source.as_deref(), Some(MANUAL_SOURCE));
        assert_eq!(row.sub_category.as_deref(), Some("ANIMALS"));
        assert_eq!(row.classification_confidence, Some(1.0));
    }

    #[tokio::test]
    async fn reset_source_clears_only_that_source() {
        let store = memory_store().await;
        let tax = Taxonomy::builtin();
        store
            .upsert_source_tags(&[tag("a", Some(0), 1), tag("b", Some(0), 1)])
            .await
            .unwrap();
        let c = tax.classification("OBJECTS", None).unwrap();
        let conf = Confidence::new(0.5).unwrap();
        store.apply_llm_classification("a", &c, "weak-model", conf, None).await.unwrap();
        store.apply_rule_matches(&[("b".into(), c.clone())]).await.unwrap();

        assert_eq!(store.reset_source("weak-model").await.unwrap(), 1);
        let a = store.get("a").await.unwrap().unwrap();
        assert!(a.main_category.is_none() && a.classification_source.is_none());
        assert!(a.classification_confidence.is_none());
        assert!(store.get("b").await.unwrap().unwrap().main_category.is_some());
    }

    #[tokio::test]
    async fn llm_candidates_select_general_tags_by_usage() {
        let store = memory_store().await;
        store
            .upsert_source_tags(&[
                tag("b_tag", Some(0), 5000),
                tag("a_tag", None, 5000),
                tag("artist_x", Some(1), 9000),
                tag("rare", Some(0), 10),
                tag("top", Some(0), 8000),
            ])
            .await
            .unwrap();
        let names: Vec<String> = store
            .llm_candidates(1000, None)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, vec!["top", "a_tag", "b_tag"]);
        assert_eq!(store.llm_candidates(1000, Some(1)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn embeddings_are_written_once() {
        let store = memory_store().await;
        store.upsert_source_tags(&[tag("x", Some(0), 10)]).await.unwrap();
        assert_eq!(
            store.record_embeddings(&[("x".into(), vec![0.1, 0.2])]).await.unwrap(),
            1
        );
        assert_eq!(
            store.record_embeddings(&[("x".into(), vec![0.9, 0.9])]).await.unwrap(),
            0
        );
        let row = store.get("x").await.unwrap().unwrap();
        assert_eq!(row.embedding_vector(), Some(vec![0.1, 0.2]));
        assert_eq!(store.embedding_coverage(0, false).await.unwrap(), (1, 1));
        assert_eq!(store.embedding_coverage(0, true).await.unwrap(), (0, 0));
        assert!(store.embedding_candidates(0, false).await.unwrap().is_empty());
    }
}
