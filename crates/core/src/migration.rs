//! Checkpointed export of the tag table and idempotent upload to the remote
//! store.
//!
//! Export writes numbered `batch_NNNN.json` artifacts and, last, a
//! `manifest.json` with one blake3 checksum per batch. Upload pushes each
//! batch and only then drops a `batch_NNNN.done` marker, so an interrupted
//! run resumes with exactly the batches that never completed.

use crate::remote::{RemoteStore, RemoteTag};
use crate::retry::{self, RetryPolicy};
use crate::store::TagStore;
use anyhow::Context;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub const MANIFEST_FILE: &str = "manifest.json";
const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone)]
pub struct MigrationSettings {
    pub artifact_dir: PathBuf,
    pub batch_size: usize,
    pub concurrency: usize,
    /// Export only classified rows.
    pub classified_only: bool,
    pub retry: RetryPolicy,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            artifact_dir: PathBuf::from("data/migration"),
            batch_size: 500,
            concurrency: 2,
            classified_only: false,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub created_at: String,
    pub batch_size: usize,
    pub total_rows: usize,
    pub batch_count: usize,
    pub classified_only: bool,
    pub checksums: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct BatchArtifact {
    index: usize,
    rows: Vec<RemoteTag>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DoneMarker {
    index: usize,
    rows: usize,
    checksum: String,
    completed_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExportSummary {
    pub batches: usize,
    pub rows: usize,
    /// An existing manifest was kept.
    pub reused: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UploadSummary {
    pub batches: usize,
    pub uploaded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub rows_uploaded: usize,
    pub cancelled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TierParity {
    pub threshold: i64,
    pub local: i64,
    pub remote: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationReport {
    pub local_rows: i64,
    pub remote_rows: u64,
    pub tiers: Vec<TierParity>,
    pub mismatches: Vec<String>,
}

impl VerificationReport {
    pub fn is_consistent(&self) -> bool {
        self.mismatches.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchStatus {
    Uploaded(usize),
    Skipped,
    Failed,
    NotStarted,
}

fn batch_file(index: usize) -> String {
    format!("batch_{index:04}.json")
}

fn done_file(index: usize) -> String {
    format!("batch_{index:04}.done")
}

/// Writes through a hidden temp file and a rename so readers never see a
/// partial file.
async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow::anyhow!("invalid artifact path {}", path.display()))?;
    let tmp = path.with_file_name(format!(".{name}.tmp"));
    tokio::fs::write(&tmp, bytes)
        .await
        .with_context(|| format!("write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}

pub struct MigrationStager {
    store: TagStore,
    remote: Arc<dyn RemoteStore>,
    settings: MigrationSettings,
    cancel: CancellationToken,
}

impl MigrationStager {
    pub fn new(store: TagStore, remote: Arc<dyn RemoteStore>, settings: MigrationSettings) -> Self {
        Self {
            store,
            remote,
            settings,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    fn path(&self, file: &str) -> PathBuf {
        self.settings.artifact_dir.join(file)
    }

    pub async fn read_manifest(&self) -> anyhow::Result<Option<Manifest>> {
        let path = self.path(MANIFEST_FILE);
        if !tokio::fs::try_exists(&path).await? {
            return Ok(None);
        }
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("read {}", path.display()))?;
        let manifest: Manifest = serde_json::from_slice(&bytes)
            .with_context(|| format!("parse {}", path.display()))?;
        if manifest.version != MANIFEST_VERSION {
            anyhow::bail!("unsupported manifest version {}", manifest.version);
        }
        Ok(Some(manifest))
    }

    /// Removes the manifest and batch artifacts. Done markers are kept unless
    /// `markers` is set; a kept marker only counts while its checksum matches.
    async fn clear_artifacts(&self, markers: bool) -> anyhow::Result<()> {
        let mut entries = tokio::fs::read_dir(&self.settings.artifact_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let artifact = name.starts_with("batch_") && name.ends_with(".json");
            let marker = name.starts_with("batch_") && name.ends_with(".done");
            if artifact || name == MANIFEST_FILE || (markers && marker) {
                tokio::fs::remove_file(entry.path()).await?;
            }
        }
        Ok(())
    }

    fn same_layout(&self, manifest: &Manifest) -> bool {
        manifest.batch_size == self.settings.batch_size.max(1)
            && manifest.classified_only == self.settings.classified_only
    }

    /// Partitions the exported selection into batch artifacts.
    ///
    /// Without `force`, an existing manifest is kept while some of its
    /// batches are still pending upload. Once every batch is done the
    /// selection is re-read; batches whose content changed get new artifacts
    /// and their old done markers stop matching. `force` replaces everything.
    pub async fn export(&self, force: bool) -> anyhow::Result<ExportSummary> {
        let previous = if force { None } else { self.read_manifest().await? };
        if let Some(manifest) = &previous {
            let done = self.completed_batches().await?.len();
            if done < manifest.batch_count && self.same_layout(manifest) {
                info!(
                    batches = manifest.batch_count,
                    done,
                    rows = manifest.total_rows,
                    "resuming existing export"
                );
                return Ok(ExportSummary {
                    batches: manifest.batch_count,
                    rows: manifest.total_rows,
                    reused: true,
                });
            }
        }

        let rows = self.store.export_rows(self.settings.classified_only).await?;
        let batch_size = self.settings.batch_size.max(1);
        let artifacts = rows
            .chunks(batch_size)
            .enumerate()
            .map(|(index, chunk)| {
                serde_json::to_vec(&BatchArtifact {
                    index,
                    rows: chunk.iter().map(RemoteTag::from).collect(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let checksums: Vec<String> = artifacts
            .iter()
            .map(|bytes| blake3::hash(bytes).to_hex().to_string())
            .collect();

        if let Some(manifest) = &previous {
            if self.same_layout(manifest) && manifest.checksums == checksums {
                info!(
                    batches = manifest.batch_count,
                    rows = manifest.total_rows,
                    "selection unchanged since last export"
                );
                return Ok(ExportSummary {
                    batches: manifest.batch_count,
                    rows: manifest.total_rows,
                    reused: true,
                });
            }
        }

        tokio::fs::create_dir_all(&self.settings.artifact_dir)
            .await
            .with_context(|| format!("create {}", self.settings.artifact_dir.display()))?;
        self.clear_artifacts(force).await?;
        for (index, bytes) in artifacts.iter().enumerate() {
            write_atomic(&self.path(&batch_file(index)), bytes).await?;
        }
        let manifest = Manifest {
            version: MANIFEST_VERSION,
            created_at: chrono::Utc::now().to_rfc3339(),
            batch_size,
            total_rows: rows.len(),
            batch_count: checksums.len(),
            classified_only: self.settings.classified_only,
            checksums,
        };
        write_atomic(
            &self.path(MANIFEST_FILE),
            &serde_json::to_vec_pretty(&manifest)?,
        )
        .await?;
        info!(
            batches = manifest.batch_count,
            rows = manifest.total_rows,
            dir = %self.settings.artifact_dir.display(),
            "export complete"
        );
        Ok(ExportSummary {
            batches: manifest.batch_count,
            rows: manifest.total_rows,
            reused: false,
        })
    }

    /// Whether batch `index` has a done marker for exactly `checksum`.
    async fn is_done(&self, index: usize, checksum: &str) -> anyhow::Result<bool> {
        let marker = self.path(&done_file(index));
        if !tokio::fs::try_exists(&marker).await? {
            return Ok(false);
        }
        let bytes = tokio::fs::read(&marker)
            .await
            .with_context(|| format!("read {}", marker.display()))?;
        Ok(serde_json::from_slice::<DoneMarker>(&bytes)
            .map(|done| done.checksum == checksum)
            .unwrap_or(false))
    }

    /// Indices of batches whose done marker matches the current manifest.
    pub async fn completed_batches(&self) -> anyhow::Result<Vec<usize>> {
        let Some(manifest) = self.read_manifest().await? else {
            return Ok(Vec::new());
        };
        let mut done = Vec::new();
        for (index, checksum) in manifest.checksums.iter().enumerate() {
            if self.is_done(index, checksum).await? {
                done.push(index);
            }
        }
        Ok(done)
    }

    async fn upload_batch(&self, index: usize, checksum: &str) -> anyhow::Result<BatchStatus> {
        if self.is_done(index, checksum).await? {
            return Ok(BatchStatus::Skipped);
        }
        if self.cancel.is_cancelled() {
            return Ok(BatchStatus::NotStarted);
        }
        let path = self.path(&batch_file(index));
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("read {}", path.display()))?;
        let actual = blake3::hash(&bytes).to_hex().to_string();
        if actual != checksum {
            anyhow::bail!("checksum mismatch for {}", path.display());
        }
        let artifact: BatchArtifact = serde_json::from_slice(&bytes)
            .with_context(|| format!("parse {}", path.display()))?;

        retry::with_backoff("remote upsert tags", &self.settings.retry, || {
            self.remote.upsert_tags(&artifact.rows)
        })
        .await
        .with_context(|| format!("upsert batch {index}"))?;

        let done = DoneMarker {
            index,
            rows: artifact.rows.len(),
            checksum: actual,
            completed_at: chrono::Utc::now().to_rfc3339(),
        };
        write_atomic(&self.path(&done_file(index)), &serde_json::to_vec(&done)?).await?;
        info!(batch = index, rows = done.rows, "batch uploaded");
        Ok(BatchStatus::Uploaded(done.rows))
    }

    /// Uploads every batch without a matching done marker. Failed batches are counted
    /// and left unmarked for the next run.
    pub async fn upload(&self) -> anyhow::Result<UploadSummary> {
        self.remote.ping().await.context("remote store unreachable")?;
        let manifest = self
            .read_manifest()
            .await?
            .ok_or_else(|| anyhow::anyhow!("no export manifest found, run export first"))?;

        let statuses: Vec<BatchStatus> = stream::iter(manifest.checksums.iter().enumerate())
            .map(|(index, checksum)| async move {
                match self.upload_batch(index, checksum).await {
                    Ok(status) => status,
                    Err(err) => {
                        error!(batch = index, error = %err, "batch upload failed");
                        BatchStatus::Failed
                    }
                }
            })
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect()
            .await;

        let mut summary = UploadSummary {
            batches: manifest.batch_count,
            ..Default::default()
        };
        for status in statuses {
            match status {
                BatchStatus::Uploaded(rows) => {
                    summary.uploaded += 1;
                    summary.rows_uploaded += rows;
                }
                BatchStatus::Skipped => summary.skipped += 1,
                BatchStatus::Failed => summary.failed += 1,
                BatchStatus::NotStarted => summary.cancelled = true,
            }
        }
        if summary.failed > 0 {
            warn!(failed = summary.failed, "some batches failed; rerun upload to resume");
        }
        info!(
            batches = summary.batches,
            uploaded = summary.uploaded,
            skipped = summary.skipped,
            failed = summary.failed,
            rows = summary.rows_uploaded,
            "upload complete"
        );
        Ok(summary)
    }

    /// Compares remote counts with the local selection. Differences are
    /// reported, never repaired.
    pub async fn verify(&self, tiers: &[i64]) -> anyhow::Result<VerificationReport> {
        let local_rows = self.store.count_export(self.settings.classified_only).await?;
        let remote_rows = self.remote.count_tags().await.context("count remote rows")?;
        let mut mismatches = Vec::new();
        if remote_rows != local_rows as u64 {
            mismatches.push(format!(
                "row count: local {local_rows}, remote {remote_rows}"
            ));
        }
        let mut parity = Vec::with_capacity(tiers.len());
        for &threshold in tiers {
            let (_, local) = self
                .store
                .embedding_coverage(threshold, self.settings.classified_only)
                .await?;
            let remote = self
                .remote
                .count_embedded(threshold)
                .await
                .with_context(|| format!("count remote embeddings >= {threshold}"))?;
            if remote != local as u64 {
                mismatches.push(format!(
                    "embedded with usage >= {threshold}: local {local}, remote {remote}"
                ));
            }
            parity.push(TierParity {
                threshold,
                local,
                remote,
            });
        }
        for mismatch in &mismatches {
            warn!(%mismatch, "verification mismatch");
        }
        Ok(VerificationReport {
            local_rows,
            remote_rows,
            tiers: parity,
            mismatches,
        })
    }
}
