use tagflow_core::audit::AuditAlert;
use tagflow_core::pipeline::PipelineSummary;

/// Plain-text lines for a pipeline summary, one per phase that ran.
pub fn render(mode: &str, summary: &PipelineSummary) -> Vec<String> {
    let mut lines = Vec::new();
    if let Some(s) = &summary.ingest {
        lines.push(format!(
            "ingest: read {}, invalid {}, written {}",
            s.read, s.invalid, s.written
        ));
    }
    if let Some(s) = &summary.rules {
        lines.push(format!(
            "rules: scanned {}, classified {}, unmatched {}",
            s.scanned, s.classified, s.unmatched
        ));
    }
    if let Some(s) = &summary.llm {
        lines.push(format!(
            "llm: total {}, success {}, failed {}, skipped {}",
            s.total, s.success, s.failed, s.skipped
        ));
    }
    if let Some(a) = &summary.audit {
        lines.push(format!(
            "audit: {}/{} classified ({}), {} integrity violations",
            a.coverage.classified,
            a.coverage.total,
            percent(a.coverage.coverage),
            a.integrity.violations()
        ));
        lines.extend(a.alerts.iter().map(|alert| format!("  alert: {}", alert_line(alert))));
    }
    if let Some(s) = &summary.export {
        lines.push(format!(
            "export: {} rows in {} batches{}",
            s.rows,
            s.batches,
            if s.reused { " (manifest reused)" } else { "" }
        ));
    }
    if let Some(s) = &summary.upload {
        lines.push(format!(
            "upload: {}/{} batches uploaded, {} skipped, {} failed, {} rows",
            s.uploaded, s.batches, s.skipped, s.failed, s.rows_uploaded
        ));
    }
    if let Some(e) = &summary.embeddings {
        for stage in &e.stages {
            lines.push(format!(
                "embed stage {} (>= {}): embedded {}, failed {}, coverage {}",
                stage.stage,
                stage.threshold,
                stage.embedded,
                stage.failed,
                percent(stage.coverage)
            ));
        }
        if let Some(halt) = &e.halted {
            lines.push(format!(
                "embed halted before stage {} (>= {}): previous coverage {} below {}",
                halt.stage,
                halt.threshold,
                percent(halt.previous_coverage),
                percent(halt.required)
            ));
        }
    }
    if let Some(v) = &summary.verification {
        lines.push(format!(
            "verify: local {}, remote {}, {}",
            v.local_rows,
            v.remote_rows,
            if v.is_consistent() { "consistent" } else { "MISMATCH" }
        ));
        lines.extend(v.mismatches.iter().map(|m| format!("  {m}")));
    }
    if summary.cancelled {
        lines.push("cancelled before completion".to_string());
    }
    if lines.is_empty() {
        lines.push(format!("{mode}: nothing to do"));
    }
    lines
}

fn alert_line(alert: &AuditAlert) -> String {
    match alert {
        AuditAlert::LowConfidenceSource {
            source,
            mean_confidence,
            ..
        } => format!("source {source} mean confidence {mean_confidence:.2}"),
        AuditAlert::SpotCheckFailed {
            pattern,
            expected_main,
            accuracy,
            ..
        } => format!("spot check `{pattern}` -> {expected_main} at {}", percent(*accuracy)),
        AuditAlert::IntegrityViolation { violations, .. } => {
            format!("{violations} integrity violations")
        }
    }
}

fn percent(rate: f64) -> String {
    format!("{:.1}%", rate * 100.0)
}
