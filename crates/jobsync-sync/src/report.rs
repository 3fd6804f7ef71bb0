//! Per-run report bundle under `reports/<run_id>/` and the markdown digest of
//! recent runs.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use jobsync_storage::write_atomic;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::reconcile::ReconcilePlan;
use crate::RunSummary;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportManifest {
    pub schema_version: u32,
    pub run_id: String,
    pub files: Vec<ReportManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

pub fn reports_root(workspace_root: &Path) -> PathBuf {
    workspace_root.join("reports")
}

pub(crate) async fn write_reports(
    workspace_root: &Path,
    summary: &RunSummary,
    plan: &ReconcilePlan,
) -> Result<PathBuf> {
    let reports_dir = reports_root(workspace_root).join(summary.run_id.to_string());
    tokio::fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let brief = render_run_brief(summary);
    let mutations = serde_json::to_vec_pretty(&serde_json::json!({
        "summary": summary,
        "plan": plan,
    }))
    .context("serializing mutations report")?;

    let mut files = Vec::new();
    for (name, file, bytes) in [
        ("run_summary", "run_summary.md", brief.into_bytes()),
        ("mutations", "mutations.json", mutations),
    ] {
        write_atomic(&reports_dir.join(file), &bytes).await?;
        files.push(manifest_entry(name, file, &bytes));
    }

    let manifest = ReportManifest {
        schema_version: 1,
        run_id: summary.run_id.to_string(),
        files,
    };
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing report manifest")?;
    write_atomic(&reports_dir.join("manifest.json"), &bytes).await?;

    Ok(reports_dir)
}

fn manifest_entry(name: &str, path: &str, bytes: &[u8]) -> ReportManifestFile {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    ReportManifestFile {
        name: name.to_string(),
        path: path.to_string(),
        sha256: hex::encode(hasher.finalize()),
        bytes: bytes.len() as u64,
    }
}

fn render_run_brief(summary: &RunSummary) -> String {
    let list = |tabs: &[String]| {
        if tabs.is_empty() {
            "none".to_string()
        } else {
            tabs.join(", ")
        }
    };
    format!(
        "# Sync Run `{}`\n\n- Started: {}\n- Finished: {}\n- Elapsed: {:.2}s\n- New jobs: {}\n- Status updates: {}\n- Unchanged: {}\n- Duplicate sightings: {}\n- Rejected rows: {}\n- Failed mutations: {}\n\n## Tabs ({}/{})\n- Succeeded: {}\n- Failed: {}\n",
        summary.run_id,
        summary.started_at,
        summary.finished_at,
        summary.elapsed_secs,
        summary.new_jobs,
        summary.updated_jobs,
        summary.unchanged_jobs,
        summary.duplicate_sightings,
        summary.rejected_rows,
        summary.failed_mutations,
        summary.successful_tabs.len(),
        summary.total_tabs,
        list(&summary.successful_tabs),
        list(&summary.failed_tabs),
    )
}

/// Markdown digest of the `runs` most recent report bundles, newest first.
pub fn report_recent_markdown(runs: usize, workspace_root: Option<PathBuf>) -> Result<String> {
    let root = workspace_root.unwrap_or_else(|| PathBuf::from("."));
    let reports_root = reports_root(&root);
    let mut summaries = Vec::new();
    for entry in std::fs::read_dir(&reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
    {
        let entry = entry?;
        if !entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false) {
            continue;
        }
        let path = entry.path().join("mutations.json");
        let Ok(text) = std::fs::read_to_string(&path) else {
            continue;
        };
        let value: serde_json::Value = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        let summary: RunSummary = serde_json::from_value(value["summary"].clone())
            .with_context(|| format!("reading run summary from {}", path.display()))?;
        summaries.push((summary, entry.path()));
    }
    summaries.sort_by(|a, b| b.0.started_at.cmp(&a.0.started_at));

    let mut lines = vec!["# Job Sync Report".to_string(), String::new()];
    if summaries.is_empty() {
        lines.push("No runs recorded yet.".to_string());
    }
    for (summary, dir) in summaries.into_iter().take(runs.max(1)) {
        lines.push(format!("## Run `{}` ({})", summary.run_id, summary.started_at));
        lines.push(format!(
            "- new: {}, updated: {}, unchanged: {}, failed mutations: {}",
            summary.new_jobs, summary.updated_jobs, summary.unchanged_jobs, summary.failed_mutations
        ));
        lines.push(format!(
            "- tabs: {}/{} succeeded",
            summary.successful_tabs.len(),
            summary.total_tabs
        ));
        if !summary.failed_tabs.is_empty() {
            lines.push(format!("- failed tabs: {}", summary.failed_tabs.join(", ")));
        }
        let brief = dir.join("run_summary.md");
        if brief.exists() {
            lines.push(format!("- brief: `{}`", brief.display()));
        }
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}
