use providers::{
    ClassificationOracle, EmbedResponse, EmbeddingProvider, OracleRequest, OracleVerdict,
    ProviderError, ProviderRegistry,
};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tagflow_core::config::AppConfig;
use tagflow_core::models::RULE_ENGINE_SOURCE;
use tagflow_core::pipeline::{Pipeline, PipelineMode};
use tagflow_core::remote::{MemoryRemoteStore, RemoteStore};
use tempfile::tempdir;

const DUMP: &str = r#"
{"name": "school_uniform", "category": 0, "post_count": 60000}
{"name": "long_hair", "category": 0, "post_count": 55000}
{"name": "hatsune_miku", "category": 4, "post_count": 40000}
{"name": "mystery_thing", "category": 0, "post_count": 20000}
{"name": "odd_gadget", "category": 0, "post_count": 8000}
{"name": "city_background", "category": 0, "post_count": 3000}
{"name": "rare_tag", "category": 0, "post_count": 500}
{"name": "", "category": 0, "post_count": 1}
"#;

/// Answers OBJECTS for every tag except `odd_gadget`, which gets an
/// out-of-range confidence.
struct FakeOracle;

#[async_trait::async_trait]
impl ClassificationOracle for FakeOracle {
    fn model_id(&self) -> &str {
        "fake-oracle"
    }

    async fn classify(&self, request: &OracleRequest) -> Result<Vec<OracleVerdict>, ProviderError> {
        Ok(request
            .tags
            .iter()
            .map(|t| OracleVerdict {
                tag: t.name.clone(),
                main_category: Some("OBJECTS".into()),
                sub_category: None,
                confidence: Some(if t.name == "odd_gadget" { 1.2 } else { 0.9 }),
                reasoning: Some("looks like a thing".into()),
            })
            .collect())
    }
}

#[derive(Default)]
struct FakeEmbedder {
    calls: AtomicUsize,
}

#[async_trait::async_trait]
impl EmbeddingProvider for FakeEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<EmbedResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(EmbedResponse {
            vectors: texts.iter().map(|t| vec![t.len() as f32, 1.0, 0.0]).collect(),
        })
    }
}

fn test_config(root: &Path) -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.database.path = root.join("tags.db").to_string_lossy().into_owned();
    cfg.migration.artifact_dir = root.join("migration").to_string_lossy().into_owned();
    cfg.migration.batch_size = 2;
    cfg.migration.concurrency = 1;
    cfg.llm.provider = "fake".into();
    cfg.llm.batch_size = 2;
    cfg.embeddings.provider = "fake".into();
    cfg.embeddings.dimensions = Some(3);
    cfg.embeddings.tiers = vec![50_000, 1_000];
    cfg.retry.max_attempts = 2;
    cfg.retry.initial_backoff_ms = 1;
    cfg.retry.max_backoff_ms = 2;
    cfg
}

async fn open(root: &Path, remote: Arc<MemoryRemoteStore>, embedder: Arc<FakeEmbedder>) -> Pipeline {
    open_with(test_config(root), remote, embedder).await
}

async fn open_with(cfg: AppConfig, remote: Arc<MemoryRemoteStore>, embedder: Arc<FakeEmbedder>) -> Pipeline {
    let registry = ProviderRegistry::new()
        .with_oracle("fake", Arc::new(FakeOracle))
        .with_embedding("fake", embedder);
    Pipeline::open(cfg)
        .await
        .unwrap()
        .with_registry(registry)
        .with_remote(remote)
}

#[tokio::test]
async fn test_full_pipeline() {
    let temp = tempdir().unwrap();
    let dump = temp.path().join("tags.jsonl");
    fs::write(&dump, DUMP).unwrap();
    let remote = Arc::new(MemoryRemoteStore::new());
    let embedder = Arc::new(FakeEmbedder::default());
    let pipeline = open(temp.path(), remote.clone(), embedder.clone()).await;

    let summary = pipeline.run(PipelineMode::Ingest(dump)).await.unwrap();
    let ingest = summary.ingest.unwrap();
    assert_eq!((ingest.read, ingest.invalid), (7, 1));

    let summary = pipeline.run(PipelineMode::All).await.unwrap();
    assert!(!summary.cancelled);

    let rules = summary.rules.unwrap();
    assert_eq!(rules.classified, 4);
    let store = pipeline.store();
    let uniform = store.get("school_uniform").await.unwrap().unwrap();
    assert_eq!(uniform.main_category.as_deref(), Some("CHARACTER_RELATED"));
    assert_eq!(uniform.sub_category.as_deref(), Some("CLOTHING"));
    assert_eq!(uniform.classification_source.as_deref(), Some(RULE_ENGINE_SOURCE));
    let miku = store.get("hatsune_miku").await.unwrap().unwrap();
    assert_eq!(miku.main_category.as_deref(), Some("CHARACTER"));
    assert_eq!(miku.sub_category, None);

    // odd_gadget came back with confidence 1.2; rare_tag is below the usage floor.
    let llm = summary.llm.unwrap();
    assert_eq!((llm.total, llm.success, llm.failed), (2, 1, 1));
    let mystery = store.get("mystery_thing").await.unwrap().unwrap();
    assert_eq!(mystery.classification_source.as_deref(), Some("fake-oracle"));
    assert_eq!(mystery.classification_confidence, Some(0.9));
    let gadget = store.get("odd_gadget").await.unwrap().unwrap();
    assert_eq!(gadget.main_category, None);
    assert_eq!(gadget.classification_source, None);

    let audit = summary.audit.unwrap();
    assert_eq!(audit.coverage.total, 7);
    assert_eq!(audit.coverage.classified, 5);
    assert_eq!(audit.integrity.violations(), 0);

    let upload = summary.upload.unwrap();
    assert_eq!(upload.failed, 0);
    assert_eq!(upload.rows_uploaded, 7);

    let embeddings = summary.embeddings.unwrap();
    assert!(embeddings.halted.is_none());
    assert_eq!(embeddings.stages.len(), 2);
    assert_eq!(embeddings.stages[0].embedded, 2);
    assert_eq!(embeddings.stages[1].embedded, 4);
    assert!(remote.embedding("school_uniform").is_some());
    assert!(remote.embedding("rare_tag").is_none());

    let verification = summary.verification.unwrap();
    assert!(verification.is_consistent(), "{:?}", verification.mismatches);
    assert_eq!(remote.len(), 7);

    // A second full run changes nothing that is already done.
    let calls_before = embedder.calls.load(Ordering::SeqCst);
    let again = pipeline.run(PipelineMode::All).await.unwrap();
    assert_eq!(again.rules.unwrap().classified, 0);
    assert_eq!(again.upload.unwrap().skipped, 4);
    assert_eq!(embedder.calls.load(Ordering::SeqCst), calls_before);
    assert!(again.verification.unwrap().is_consistent());
    for row in store.export_rows(false).await.unwrap() {
        assert_eq!(
            row.classification_source.is_some(),
            row.main_category.is_some(),
            "{}",
            row.name
        );
        if row.usage_count >= 1_000 {
            assert_eq!(row.embedding_vector().map(|v| v.len()), Some(3), "{}", row.name);
        }
    }
}

#[tokio::test]
async fn interrupted_upload_resumes_only_the_failed_batch() {
    let temp = tempdir().unwrap();
    let dump = temp.path().join("tags.jsonl");
    fs::write(&dump, DUMP).unwrap();
    let remote = Arc::new(MemoryRemoteStore::new());
    let pipeline = open(temp.path(), remote.clone(), Arc::new(FakeEmbedder::default())).await;
    pipeline.run(PipelineMode::Ingest(dump)).await.unwrap();
    pipeline.run(PipelineMode::Rules).await.unwrap();

    remote.push_failure(ProviderError::Status {
        code: 400,
        body: "bad request".into(),
    });
    let first = pipeline.run(PipelineMode::Migrate).await.unwrap();
    let upload = first.upload.unwrap();
    assert_eq!(upload.batches, 4);
    assert_eq!((upload.uploaded, upload.failed), (3, 1));
    assert_eq!(remote.len(), 5);

    let second = pipeline.run(PipelineMode::Migrate).await.unwrap();
    assert!(second.export.unwrap().reused);
    let upload = second.upload.unwrap();
    assert_eq!((upload.uploaded, upload.skipped, upload.failed), (1, 3, 0));
    assert_eq!(remote.len(), 7);

    let calls = remote.upsert_calls();
    let third = pipeline.run(PipelineMode::Migrate).await.unwrap();
    assert_eq!(third.upload.unwrap().skipped, 4);
    assert_eq!(remote.upsert_calls(), calls);
    assert_eq!(remote.count_tags().await.unwrap(), 7);
}

#[tokio::test]
async fn reclassified_tag_reaches_the_remote_on_the_next_migrate() {
    let temp = tempdir().unwrap();
    let dump = temp.path().join("tags.jsonl");
    fs::write(&dump, DUMP).unwrap();
    let remote = Arc::new(MemoryRemoteStore::new());
    let pipeline = open(temp.path(), remote.clone(), Arc::new(FakeEmbedder::default())).await;
    pipeline.run(PipelineMode::Ingest(dump)).await.unwrap();
    pipeline.run(PipelineMode::Rules).await.unwrap();
    let first = pipeline.run(PipelineMode::Migrate).await.unwrap();
    assert_eq!(first.upload.unwrap().uploaded, 4);
    assert_eq!(remote.get("odd_gadget").unwrap().main_category, None);

    let objects = pipeline.taxonomy().classification("OBJECTS", None).unwrap();
    assert!(pipeline
        .store()
        .set_manual_override("odd_gadget", &objects, None)
        .await
        .unwrap());

    let second = pipeline.run(PipelineMode::Migrate).await.unwrap();
    assert!(!second.export.unwrap().reused);
    let upload = second.upload.unwrap();
    assert_eq!((upload.uploaded, upload.skipped, upload.failed), (1, 3, 0));
    let gadget = remote.get("odd_gadget").unwrap();
    assert_eq!(gadget.main_category.as_deref(), Some("OBJECTS"));
    assert_eq!(gadget.classification_source.as_deref(), Some("manual_override"));
    assert_eq!(remote.len(), 7);

    let verify = pipeline.run(PipelineMode::Verify).await.unwrap();
    assert!(verify.verification.unwrap().is_consistent());
}

#[tokio::test]
async fn classified_only_migration_embeds_only_uploaded_rows() {
    let temp = tempdir().unwrap();
    let dump = temp.path().join("tags.jsonl");
    fs::write(&dump, DUMP).unwrap();
    let remote = Arc::new(MemoryRemoteStore::new());
    let mut cfg = test_config(temp.path());
    cfg.migration.classified_only = true;
    let pipeline = open_with(cfg, remote.clone(), Arc::new(FakeEmbedder::default())).await;
    pipeline.run(PipelineMode::Ingest(dump)).await.unwrap();

    let summary = pipeline.run(PipelineMode::All).await.unwrap();
    assert_eq!(summary.upload.unwrap().rows_uploaded, 5);
    let embeddings = summary.embeddings.unwrap();
    assert!(embeddings.halted.is_none());
    assert_eq!(embeddings.stages[0].embedded, 2);
    assert_eq!(embeddings.stages[1].embedded, 3);
    assert!(remote.get("odd_gadget").is_none());
    assert!(remote.get("rare_tag").is_none());
    assert_eq!(remote.len(), 5);

    let verification = summary.verification.unwrap();
    assert!(verification.is_consistent(), "{:?}", verification.mismatches);
}

#[tokio::test]
async fn manual_override_survives_reruns() {
    let temp = tempdir().unwrap();
    let dump = temp.path().join("tags.jsonl");
    fs::write(&dump, DUMP).unwrap();
    let pipeline = open(
        temp.path(),
        Arc::new(MemoryRemoteStore::new()),
        Arc::new(FakeEmbedder::default()),
    )
    .await;
    pipeline.run(PipelineMode::Ingest(dump)).await.unwrap();

    let c = pipeline
        .taxonomy()
        .classification("OBJECTS", None)
        .unwrap();
    assert!(pipeline
        .store()
        .set_manual_override("odd_gadget", &c, Some("checked by hand"))
        .await
        .unwrap());
    pipeline.run(PipelineMode::Rules).await.unwrap();
    pipeline.run(PipelineMode::Llm).await.unwrap();
    assert!(pipeline.store().reset_source("manual_override").await.is_err());
    assert_eq!(pipeline.store().reset_source("fake-oracle").await.unwrap(), 1);

    let gadget = pipeline.store().get("odd_gadget").await.unwrap().unwrap();
    assert_eq!(gadget.main_category.as_deref(), Some("OBJECTS"));
    assert_eq!(gadget.classification_source.as_deref(), Some("manual_override"));
    assert_eq!(gadget.classification_confidence, Some(1.0));
}

#[tokio::test]
async fn rule_engine_is_deterministic() {
    let temp = tempdir().unwrap();
    let pipeline = open(
        temp.path(),
        Arc::new(MemoryRemoteStore::new()),
        Arc::new(FakeEmbedder::default()),
    )
    .await;
    let engine = pipeline.rule_engine().unwrap();
    for (name, native) in [
        ("school_uniform", None),
        ("hatsune_miku", Some(4)),
        ("unknown_tag_xyz", None),
        ("silver_hair", Some(0)),
    ] {
        assert_eq!(engine.classify(name, native), engine.classify(name, native));
    }
    let hair = engine.classify("silver_hair", None).unwrap();
    assert_eq!((hair.main(), hair.sub()), ("CHARACTER_RELATED", Some("HAIR")));
    assert!(engine.classify("unknown_tag_xyz", None).is_none());
}
