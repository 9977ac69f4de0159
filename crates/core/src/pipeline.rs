use crate::audit::{AuditReport, CoverageAuditor};
use crate::classifier::{ClassifySummary, LlmClassifier};
use crate::config::AppConfig;
use crate::embeddings::{validate_tiers, EmbeddingRunSummary, TieredEmbedder};
use crate::ingest::{self, IngestSummary};
use crate::migration::{ExportSummary, MigrationStager, UploadSummary, VerificationReport};
use crate::remote::{MemoryRemoteStore, PostgrestStore, RemoteStore};
use crate::rules::{self, RulePassSummary, RuleEngine};
use crate::store::TagStore;
use crate::taxonomy::Taxonomy;
use anyhow::Context;
use providers::noop::NoopProvider;
use providers::openai::{OpenAiConfig, OpenAiProvider};
use providers::postgrest::{PostgrestClient, PostgrestConfig};
use providers::ProviderRegistry;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use storage::{connect, migrate};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const DEFAULT_OPENAI_BASE: &str = "https://api.openai.com";

#[derive(Debug, Clone)]
pub enum PipelineMode {
    Ingest(PathBuf),
    Rules,
    Llm,
    Audit,
    Export { force: bool },
    /// Export (reusing an existing manifest) and upload.
    Migrate,
    Embed { max_stages: Option<usize> },
    Verify,
    /// rules, llm, audit, export, upload, embed, verify.
    All,
}

impl PipelineMode {
    /// Modes that write to or read from the remote store.
    pub fn touches_remote(&self) -> bool {
        matches!(
            self,
            PipelineMode::Migrate | PipelineMode::Embed { .. } | PipelineMode::Verify | PipelineMode::All
        )
    }
}

#[derive(Debug, Default, Serialize)]
pub struct PipelineSummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingest: Option<IngestSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rules: Option<RulePassSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm: Option<ClassifySummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit: Option<AuditReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub export: Option<ExportSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload: Option<UploadSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embeddings: Option<EmbeddingRunSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationReport>,
    pub cancelled: bool,
}

/// Everything a pipeline run needs, set up once.
pub struct Pipeline {
    config: AppConfig,
    store: TagStore,
    taxonomy: Arc<Taxonomy>,
    registry: ProviderRegistry,
    remote: Arc<dyn RemoteStore>,
    /// Set while the remote is a config-built memory store, which is gone
    /// when the process exits.
    ephemeral_remote: bool,
    cancel: CancellationToken,
}

impl Pipeline {
    pub async fn open(config: AppConfig) -> anyhow::Result<Self> {
        let pool = connect(&config.database.path).await.context("db connect")?;
        migrate(&pool).await.context("db migrate")?;
        let taxonomy = Taxonomy::load(config.taxonomy.path.as_deref().map(Path::new))
            .context("load taxonomy")?;
        validate_tiers(&config.embeddings.tiers).context("embedding tiers")?;
        let registry = build_registry(&config)?;
        let remote = build_remote_store(&config)?;
        Ok(Self {
            store: TagStore::new(pool),
            taxonomy: Arc::new(taxonomy),
            registry,
            remote,
            ephemeral_remote: config.remote.provider == "memory",
            cancel: CancellationToken::new(),
            config,
        })
    }

    pub fn with_registry(mut self, registry: ProviderRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_remote(mut self, remote: Arc<dyn RemoteStore>) -> Self {
        self.remote = remote;
        self.ephemeral_remote = false;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &TagStore {
        &self.store
    }

    pub fn taxonomy(&self) -> Arc<Taxonomy> {
        self.taxonomy.clone()
    }

    /// Built-in rules plus any rule files under `rules.path`.
    pub fn rule_engine(&self) -> anyhow::Result<RuleEngine> {
        let extra = match &self.config.rules.path {
            Some(dir) => rules::load_rules_from_dir(Path::new(dir))
                .with_context(|| format!("load rules from {dir}"))?,
            None => Vec::new(),
        };
        Ok(RuleEngine::with_builtin_rules(self.taxonomy.clone(), extra)
            .context("invalid rule")?)
    }

    pub fn auditor(&self) -> CoverageAuditor {
        CoverageAuditor::new(self.store.pool().clone(), self.taxonomy.clone())
    }

    pub fn stager(&self) -> MigrationStager {
        MigrationStager::new(
            self.store.clone(),
            self.remote.clone(),
            self.config.migration_settings(),
        )
        .with_cancellation(self.cancel.clone())
    }

    pub async fn run(&self, mode: PipelineMode) -> anyhow::Result<PipelineSummary> {
        let mut summary = PipelineSummary::default();
        let all = matches!(mode, PipelineMode::All);

        // Done markers outlive the process; rows in a memory remote do not.
        if self.ephemeral_remote && mode.touches_remote() {
            anyhow::bail!(
                "remote.provider = \"memory\" does not persist between runs; \
                 set remote.provider = \"postgrest\" and remote.url to migrate"
            );
        }

        if let PipelineMode::Ingest(path) = &mode {
            info!(path = %path.display(), "Starting ingest phase...");
            summary.ingest = Some(ingest::ingest_file(&self.store, path).await?);
        }

        if all || matches!(mode, PipelineMode::Rules) {
            info!("Starting rule phase...");
            let engine = self.rule_engine()?;
            summary.rules = Some(rules::run_rule_pass(&self.store, &engine).await?);
            let stats = engine.get_stats();
            info!(
                coverage_rate = stats.coverage_rate,
                native = stats.counters.native,
                exact = stats.counters.exact,
                suffix = stats.counters.suffix,
                prefix = stats.counters.prefix,
                substring = stats.counters.substring,
                "Rule phase complete."
            );
        }

        if (all || matches!(mode, PipelineMode::Llm)) && !self.stop(&mut summary) {
            match self.registry.oracle(Some(&self.config.llm.provider)) {
                Ok(oracle) => {
                    info!(model = oracle.model_id(), "Starting oracle phase...");
                    let classifier = LlmClassifier::new(
                        self.store.clone(),
                        oracle,
                        self.taxonomy.clone(),
                        self.config.llm_settings(),
                    )
                    .with_cancellation(self.cancel.clone());
                    summary.llm = Some(
                        classifier
                            .process_unclassified_tags(
                                self.config.llm.min_usage_count,
                                self.config.llm.limit,
                            )
                            .await?,
                    );
                }
                Err(err) if all => warn!(error = %err, "Oracle not configured, skipping oracle phase."),
                Err(err) => return Err(err).context("oracle"),
            }
        }

        if all || matches!(mode, PipelineMode::Audit) {
            info!("Starting audit phase...");
            summary.audit = Some(self.auditor().run(&self.config.audit).await?);
        }

        let stager = self.stager();
        let force = matches!(mode, PipelineMode::Export { force: true });
        if (all || matches!(mode, PipelineMode::Export { .. } | PipelineMode::Migrate))
            && !self.stop(&mut summary)
        {
            info!("Starting export phase...");
            summary.export = Some(stager.export(force).await?);
        }

        if (all || matches!(mode, PipelineMode::Migrate)) && !self.stop(&mut summary) {
            info!("Starting upload phase...");
            summary.upload = Some(stager.upload().await?);
        }

        if (all || matches!(mode, PipelineMode::Embed { .. })) && !self.stop(&mut summary) {
            let max_stages = match &mode {
                PipelineMode::Embed { max_stages } => *max_stages,
                _ => None,
            };
            match self.registry.embedding(Some(&self.config.embeddings.provider)) {
                Ok(provider) => {
                    info!("Starting embedding phase...");
                    let embedder = TieredEmbedder::new(
                        self.store.clone(),
                        provider,
                        self.remote.clone(),
                        self.config.tier_settings(),
                    )?
                    .with_cancellation(self.cancel.clone());
                    summary.embeddings = Some(embedder.run(max_stages).await?);
                }
                Err(err) if all => {
                    warn!(error = %err, "Embedding provider not configured, skipping embedding phase.")
                }
                Err(err) => return Err(err).context("embedding provider"),
            }
        }

        if (all || matches!(mode, PipelineMode::Verify)) && !self.stop(&mut summary) {
            info!("Starting verification phase...");
            summary.verification = Some(stager.verify(&self.config.embeddings.tiers).await?);
        }

        summary.cancelled |= self.cancel.is_cancelled();
        Ok(summary)
    }

    fn stop(&self, summary: &mut PipelineSummary) -> bool {
        if self.cancel.is_cancelled() {
            summary.cancelled = true;
        }
        summary.cancelled
    }
}

pub async fn run_with_mode_summary(
    config: AppConfig,
    mode: PipelineMode,
) -> anyhow::Result<PipelineSummary> {
    Pipeline::open(config).await?.run(mode).await
}

/// The no-op provider is always registered; the OpenAI-compatible provider is
/// added when `OPENAI_API_KEY` is set.
pub fn build_registry(config: &AppConfig) -> anyhow::Result<ProviderRegistry> {
    let noop = Arc::new(NoopProvider);
    let mut reg = ProviderRegistry::new()
        .with_embedding("noop", noop.clone())
        .with_oracle("noop", noop);

    if let Some(key) = std::env::var_os("OPENAI_API_KEY") {
        let base_url = config
            .llm
            .base_url
            .clone()
            .or_else(|| std::env::var("OPENAI_BASE_URL").ok())
            .unwrap_or_else(|| DEFAULT_OPENAI_BASE.to_string());
        let provider = Arc::new(OpenAiProvider::new(OpenAiConfig {
            api_key: key.to_string_lossy().into_owned(),
            base_url,
            embedding_model: config.embeddings.model.clone(),
            chat_model: config.llm.model.clone(),
            temperature: config.llm.temperature,
            max_tokens: config.llm.max_tokens,
            timeout_secs: config.llm.timeout_secs,
        })?);
        reg = reg
            .with_embedding("openai", provider.clone())
            .with_oracle("openai", provider);
    }

    Ok(reg
        .set_preferred_embedding(&config.embeddings.provider)
        .set_preferred_oracle(&config.llm.provider))
}

pub fn build_remote_store(config: &AppConfig) -> anyhow::Result<Arc<dyn RemoteStore>> {
    match config.remote.provider.as_str() {
        "memory" => Ok(Arc::new(MemoryRemoteStore::new())),
        "postgrest" => {
            let url = config
                .remote
                .url
                .clone()
                .ok_or_else(|| anyhow::anyhow!("remote.url is required for postgrest"))?;
            let client = PostgrestClient::new(PostgrestConfig {
                url,
                table: config.remote.table.clone(),
                api_key: std::env::var("REMOTE_API_KEY").ok(),
                key_column: config.remote.key_column.clone(),
            });
            Ok(Arc::new(PostgrestStore::new(client)))
        }
        other => anyhow::bail!("unknown remote provider `{other}`"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_store_selection() {
        let mut cfg = AppConfig::default();
        assert!(build_remote_store(&cfg).is_ok());
        cfg.remote.provider = "postgrest".into();
        assert!(build_remote_store(&cfg).is_err());
        cfg.remote.url = Some("http://localhost:3000".into());
        assert!(build_remote_store(&cfg).is_ok());
        cfg.remote.provider = "ftp".into();
        assert!(build_remote_store(&cfg).is_err());
    }

    #[tokio::test]
    async fn memory_remote_from_config_refuses_to_migrate() {
        let temp = tempfile::tempdir().unwrap();
        let mut cfg = AppConfig::default();
        cfg.database.path = temp.path().join("tags.db").to_string_lossy().into_owned();
        cfg.migration.artifact_dir = temp.path().join("migration").to_string_lossy().into_owned();
        let pipeline = Pipeline::open(cfg).await.unwrap();
        pipeline
            .store()
            .upsert_source_tags(&[crate::store::tests::tag("long_hair", Some(0), 100)])
            .await
            .unwrap();

        for mode in [
            PipelineMode::Migrate,
            PipelineMode::All,
            PipelineMode::Embed { max_stages: None },
            PipelineMode::Verify,
        ] {
            let err = pipeline.run(mode).await.unwrap_err();
            assert!(err.to_string().contains("remote.provider"), "{err}");
        }
        assert!(pipeline.stager().completed_batches().await.unwrap().is_empty());

        // exporting only writes local artifacts
        let summary = pipeline.run(PipelineMode::Export { force: false }).await.unwrap();
        assert_eq!(summary.export.unwrap().rows, 1);
        assert!(pipeline.stager().completed_batches().await.unwrap().is_empty());

        // an injected store is the caller's to keep
        let pipeline = pipeline.with_remote(Arc::new(MemoryRemoteStore::new()));
        let summary = pipeline.run(PipelineMode::Migrate).await.unwrap();
        assert_eq!(summary.upload.unwrap().uploaded, 1);
    }

    #[tokio::test]
    async fn open_rejects_non_decreasing_tiers() {
        let mut cfg = AppConfig::default();
        cfg.database.path = "sqlite::memory:".into();
        cfg.embeddings.tiers = vec![1000, 1000];
        assert!(Pipeline::open(cfg).await.is_err());
    }

    #[tokio::test]
    async fn open_rejects_missing_taxonomy_file() {
        let mut cfg = AppConfig::default();
        cfg.database.path = "sqlite::memory:".into();
        cfg.taxonomy.path = Some("/nonexistent/taxonomy.toml".into());
        assert!(Pipeline::open(cfg).await.is_err());
    }

    #[tokio::test]
    async fn noop_oracle_fails_ping() {
        let mut cfg = AppConfig::default();
        cfg.database.path = "sqlite::memory:".into();
        cfg.llm.provider = "noop".into();
        let pipeline = Pipeline::open(cfg).await.unwrap();
        assert!(pipeline.run(PipelineMode::Llm).await.is_err());
    }

    #[tokio::test]
    async fn llm_mode_requires_an_oracle() {
        let mut cfg = AppConfig::default();
        cfg.database.path = "sqlite::memory:".into();
        cfg.llm.provider = "missing".into();
        let pipeline = Pipeline::open(cfg).await.unwrap();
        assert!(pipeline.run(PipelineMode::Llm).await.is_err());
    }
}
