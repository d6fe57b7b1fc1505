//! Per-run report directory (`digest.md`, `run.json`, `manifest.json`) and the multi-run summary.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use scout_core::{RejectedPosting, Rejection};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;

use crate::ScanOutcome;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportManifest {
    pub schema_version: u32,
    pub files: Vec<ReportManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportManifestFile {
    pub name: String,
    pub sha256: String,
    pub bytes: u64,
}

fn manifest_entry(name: &str, bytes: &[u8]) -> ReportManifestFile {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    ReportManifestFile {
        name: name.to_string(),
        sha256: hex::encode(hasher.finalize()),
        bytes: bytes.len() as u64,
    }
}

/// Validation-stage rejections first (the real near misses), then intake drops.
fn near_misses(rejected: &[RejectedPosting], limit: usize) -> Vec<&RejectedPosting> {
    let (validated, intake): (Vec<_>, Vec<_>) = rejected
        .iter()
        .partition(|r| matches!(r.rejection, Rejection::Validation { .. }));
    validated.into_iter().chain(intake).take(limit).collect()
}

fn rejection_label(rejection: &Rejection) -> String {
    match rejection {
        Rejection::Validation { status, .. } => status.to_string(),
        Rejection::Intake { .. } => "intake".to_string(),
        Rejection::AlreadyDelivered => "delivered".to_string(),
    }
}

pub fn render_digest(outcome: &ScanOutcome, near_miss_limit: usize) -> String {
    let summary = &outcome.summary;
    let counts = &summary.counts;
    let mut lines = vec![
        "# Internship Scout Digest".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!(
            "- Mode: {}{}",
            if summary.options.force { "forced" } else { "normal" },
            if summary.options.dry_run { " (dry run)" } else { "" }
        ),
        format!(
            "- Candidates: {} | validated: {} | notified: {} | rejected: {} | errored: {} | \
             suspicious: {}",
            counts.candidates,
            counts.validated,
            counts.notified,
            counts.rejected,
            counts.errored,
            counts.suspicious
        ),
        String::new(),
        "## Notify".to_string(),
    ];

    if outcome.notify.is_empty() {
        lines.push("_No new open postings._".to_string());
    }
    for (i, posting) in outcome.notify.iter().enumerate() {
        let url = posting.canonical_url.as_deref().unwrap_or(&posting.source_url);
        lines.push(format!("{}. {} <{}>", i + 1, posting.label(), url));
    }

    let shown = near_misses(&outcome.rejected, near_miss_limit);
    lines.push(String::new());
    lines.push(format!(
        "## Near Misses ({} of {})",
        shown.len(),
        outcome.rejected.len()
    ));
    for rejected in shown {
        lines.push(format!(
            "- [{}] {}: {}",
            rejection_label(&rejected.rejection),
            rejected.posting.label(),
            rejected.rejection.reasons().join("; ")
        ));
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Writes `<reports_root>/<run_id>/` and returns its path.
pub async fn write_run_reports(
    reports_root: &Path,
    outcome: &ScanOutcome,
    near_miss_limit: usize,
) -> Result<PathBuf> {
    let dir = reports_root.join(outcome.summary.run_id.to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let digest = render_digest(outcome, near_miss_limit).into_bytes();
    let run_json = serde_json::to_vec_pretty(outcome).context("serializing run.json")?;

    let mut manifest = ReportManifest {
        schema_version: 1,
        files: Vec::new(),
    };
    for (name, bytes) in [("digest.md", &digest), ("run.json", &run_json)] {
        let path = dir.join(name);
        fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        manifest.files.push(manifest_entry(name, bytes));
    }

    let manifest_path = dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing report manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    Ok(dir)
}

/// Markdown summary of the latest `runs` report directories, newest first.
pub fn report_markdown(runs: usize, reports_root: &Path) -> Result<String> {
    let mut outcomes = Vec::new();
    let entries = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("listing {}", reports_root.display()))?;
        let run_path = entry.path().join("run.json");
        if !run_path.is_file() {
            continue;
        }
        let text = std::fs::read_to_string(&run_path)
            .with_context(|| format!("reading {}", run_path.display()))?;
        let outcome: ScanOutcome =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", run_path.display()))?;
        outcomes.push((entry.path(), outcome));
    }
    outcomes.sort_by(|a, b| b.1.summary.started_at.cmp(&a.1.summary.started_at));

    let mut lines = vec!["# Internship Scout Runs".to_string(), String::new()];
    if outcomes.is_empty() {
        lines.push("_No runs recorded._".to_string());
    }
    for (dir, outcome) in outcomes.into_iter().take(runs.max(1)) {
        let summary = &outcome.summary;
        let counts = &summary.counts;
        lines.push(format!("## Run `{}`", summary.run_id));
        lines.push(format!("- started: {}", summary.started_at));
        if summary.options.dry_run {
            lines.push("- dry run".to_string());
        }
        lines.push(format!(
            "- candidates: {}, notified: {}, rejected: {}, errored: {}, suspicious: {}",
            counts.candidates, counts.notified, counts.rejected, counts.errored, counts.suspicious
        ));
        for posting in &outcome.notify {
            lines.push(format!("  - {}", posting.label()));
        }
        lines.push(format!("- digest: `{}`", dir.join("digest.md").display()));
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}
