use crate::audit::AuditConfig;
use crate::classifier::LlmSettings;
use crate::embeddings::TierSettings;
use crate::migration::MigrationSettings;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub taxonomy: TaxonomyConfig,
    pub rules: RuleConfig,
    pub llm: LlmConfig,
    pub embeddings: EmbeddingConfig,
    pub remote: RemoteConfig,
    pub migration: MigrationConfig,
    pub retry: RetryPolicy,
    pub audit: AuditConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "data/tags.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaxonomyConfig {
    /// TOML file replacing the built-in taxonomy.
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleConfig {
    /// Directory of extra `*.toml` rule files.
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_secs: u64,
    pub batch_size: usize,
    pub concurrency: usize,
    pub min_usage_count: i64,
    pub limit: Option<i64>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            temperature: 0.1,
            max_tokens: 4000,
            timeout_secs: 120,
            batch_size: 20,
            concurrency: 2,
            min_usage_count: 1000,
            limit: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: String,
    pub model: String,
    pub batch_size: usize,
    pub concurrency: usize,
    pub dimensions: Option<usize>,
    pub tiers: Vec<i64>,
    pub min_stage_coverage: f64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        let tiers = TierSettings::default();
        Self {
            provider: "openai".to_string(),
            model: "text-embedding-3-small".to_string(),
            batch_size: tiers.batch_size,
            concurrency: tiers.concurrency,
            dimensions: Some(1536),
            tiers: tiers.thresholds,
            min_stage_coverage: tiers.min_stage_coverage,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// `postgrest` or `memory`. A memory remote lives only as long as the
    /// process, so the pipeline refuses remote phases against it.
    pub provider: String,
    pub url: Option<String>,
    pub table: String,
    pub key_column: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            provider: "memory".to_string(),
            url: None,
            table: "tags".to_string(),
            key_column: "name".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    pub artifact_dir: String,
    pub batch_size: usize,
    pub concurrency: usize,
    pub classified_only: bool,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            artifact_dir: "data/migration".to_string(),
            batch_size: 500,
            concurrency: 2,
            classified_only: false,
        }
    }
}

impl AppConfig {
    pub fn llm_settings(&self) -> LlmSettings {
        LlmSettings {
            batch_size: self.llm.batch_size,
            concurrency: self.llm.concurrency,
            quality_floor: self.audit.confidence_floor,
            retry: self.retry.clone(),
        }
    }

    pub fn tier_settings(&self) -> TierSettings {
        TierSettings {
            thresholds: self.embeddings.tiers.clone(),
            batch_size: self.embeddings.batch_size,
            concurrency: self.embeddings.concurrency,
            dimensions: self.embeddings.dimensions,
            min_stage_coverage: self.embeddings.min_stage_coverage,
            classified_only: self.migration.classified_only,
            retry: self.retry.clone(),
        }
    }

    pub fn migration_settings(&self) -> MigrationSettings {
        MigrationSettings {
            artifact_dir: PathBuf::from(&self.migration.artifact_dir),
            batch_size: self.migration.batch_size,
            concurrency: self.migration.concurrency,
            classified_only: self.migration.classified_only,
            retry: self.retry.clone(),
        }
    }
}

/// Loads `path` (or `config/default` when absent, if present) and applies
/// `TAGFLOW__SECTION__KEY` environment overrides.
pub fn load(path: Option<&str>) -> anyhow::Result<AppConfig> {
    let mut settings = config::Config::builder();
    if let Some(p) = path {
        settings = settings.add_source(config::File::with_name(p));
    } else {
        settings = settings.add_source(config::File::with_name("config/default").required(false));
    }
    settings = settings.add_source(
        config::Environment::with_prefix("TAGFLOW")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );
    let cfg = settings.build()?;
    Ok(cfg.try_deserialize()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.llm.batch_size, 20);
        assert_eq!(cfg.llm.concurrency, 2);
        assert_eq!(cfg.embeddings.tiers, vec![100_000, 50_000, 10_000, 1_000]);
        assert_eq!(cfg.embeddings.min_stage_coverage, 0.99);
        assert_eq!(cfg.migration.batch_size, 500);
        assert_eq!(cfg.audit.confidence_floor, 0.70);
        assert_eq!(cfg.remote.provider, "memory");
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
            [database]
            path = "/tmp/tags.db"

            [embeddings]
            tiers = [5000, 500]

            [retry]
            max_attempts = 7
            "#
        )
        .unwrap();
        file.flush().unwrap();
        let cfg = load(file.path().to_str()).unwrap();
        assert_eq!(cfg.database.path, "/tmp/tags.db");
        assert_eq!(cfg.embeddings.tiers, vec![5000, 500]);
        assert_eq!(cfg.embeddings.batch_size, 100);
        assert_eq!(cfg.retry.max_attempts, 7);
        assert_eq!(cfg.retry.initial_backoff_ms, 500);
        assert_eq!(cfg.tier_settings().retry.max_attempts, 7);
        assert_eq!(cfg.llm.min_usage_count, 1000);
    }
}
