//! Bulk loading of the upstream tag dump (JSON Lines).

use crate::models::SourceTag;
use crate::store::TagStore;
use anyhow::Context;
use serde::Serialize;
use std::io::BufRead;
use std::path::Path;

const CHUNK: usize = 1000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub read: u64,
    pub invalid: u64,
    pub written: u64,
}

/// Parses one dump line. Blank lines yield `Ok(None)`.
pub fn parse_line(line: &str) -> anyhow::Result<Option<SourceTag>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let mut tag: SourceTag = serde_json::from_str(line)?;
    tag.name = tag.name.trim().to_string();
    if tag.name.is_empty() {
        anyhow::bail!("empty tag name");
    }
    if let Some(native) = tag.native_category {
        if !(0..=5).contains(&native) {
            anyhow::bail!("native category {native} out of range for {}", tag.name);
        }
    }
    if tag.usage_count < 0 {
        anyhow::bail!("negative usage count for {}", tag.name);
    }
    Ok(Some(tag))
}

/// Streams `path` into the store. Malformed lines are logged and counted,
/// never fatal.
pub async fn ingest_file(store: &TagStore, path: &Path) -> anyhow::Result<IngestSummary> {
    let file = std::fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
    let reader = std::io::BufReader::new(file);
    let mut summary = IngestSummary::default();
    let mut chunk = Vec::with_capacity(CHUNK);
    for (lineno, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("read {}", path.display()))?;
        match parse_line(&line) {
            Ok(Some(tag)) => {
                summary.read += 1;
                chunk.push(tag);
            }
            Ok(None) => {}
            Err(err) => {
                summary.invalid += 1;
                tracing::warn!(line = lineno + 1, error = %err, "skipping malformed tag line");
            }
        }
        if chunk.len() >= CHUNK {
            summary.written += store.upsert_source_tags(&chunk).await?;
            chunk.clear();
        }
    }
    if !chunk.is_empty() {
        summary.written += store.upsert_source_tags(&chunk).await?;
    }
    tracing::info!(
        read = summary.read,
        invalid = summary.invalid,
        written = summary.written,
        "ingest complete"
    );
    Ok(summary)
}
