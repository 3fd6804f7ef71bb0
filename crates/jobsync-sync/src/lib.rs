//! Job sync orchestration: read the master sheet, scrape every configured tab,
//! reconcile, apply, notify and report.

mod activity;
mod apply;
pub mod config;
mod existing;
mod normalize;
mod reconcile;
mod report;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use jobsync_adapters::{FetchContext, SnapshotTabSource, TabSource};
use jobsync_core::{TabSpec, TabTable};
use jobsync_storage::{
    JsonFileSheet, LineNotifier, LineNotifyConfig, LogNotifier, Notifier, SheetStore, StoreError,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use activity::{ActivityLog, ACTIVITY_HEADERS};
pub use apply::{apply_plan, ApplyReport};
pub use config::{SyncConfig, TabConfig, TabRegistry};
pub use existing::{ExistingEntry, ExistingIndex};
pub use normalize::{identifier_column, normalize_row, NormalizedRow, RowRejection};
pub use reconcile::{
    NotificationEvent, Outcome, ReconcileCounts, ReconcilePlan, Reconciler,
};
pub use report::{report_recent_markdown, reports_root, ReportManifest, ReportManifestFile};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("master sheet unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
    #[error(transparent)]
    Setup(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_secs: f64,
    pub new_jobs: usize,
    pub updated_jobs: usize,
    pub unchanged_jobs: usize,
    pub duplicate_sightings: usize,
    pub rejected_rows: usize,
    pub failed_mutations: usize,
    pub successful_tabs: Vec<String>,
    pub failed_tabs: Vec<String>,
    pub total_tabs: usize,
    #[serde(default)]
    pub sheet_url: Option<String>,
    #[serde(default)]
    pub reports_dir: Option<String>,
}

impl RunSummary {
    pub fn is_partial(&self) -> bool {
        !self.failed_tabs.is_empty() || self.failed_mutations > 0
    }

    pub fn status_label(&self) -> &'static str {
        if self.is_partial() {
            "Partial Success"
        } else {
            "Success"
        }
    }

    /// One-line form for the activity log.
    pub fn log_details(&self) -> String {
        format!(
            "Added {} new jobs, updated {} statuses. Tabs succeeded: {}. Tabs failed: {}.",
            self.new_jobs,
            self.updated_jobs,
            self.successful_tabs.len(),
            self.failed_tabs.len()
        )
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Job sync complete!")?;
        writeln!(f)?;
        writeln!(f, "- New jobs added: {}", self.new_jobs)?;
        writeln!(f, "- Status updates: {}", self.updated_jobs)?;
        writeln!(f, "- Unchanged jobs: {}", self.unchanged_jobs)?;
        writeln!(
            f,
            "- Tabs fetched: {}/{}",
            self.successful_tabs.len(),
            self.total_tabs
        )?;
        if !self.failed_tabs.is_empty() {
            writeln!(f, "- Failed tabs: {}", self.failed_tabs.join(", "))?;
        }
        if self.failed_mutations > 0 {
            writeln!(f, "- Failed sheet writes: {}", self.failed_mutations)?;
        }
        write!(f, "- Elapsed: {:.2} s", self.elapsed_secs)?;
        if let Some(url) = &self.sheet_url {
            write!(f, "\n\nMaster sheet: {url}")?;
        }
        Ok(())
    }
}

/// Chat notifier for a config: LINE when a token is set, log-only otherwise.
pub fn notifier_for(config: &SyncConfig) -> Arc<dyn Notifier> {
    if config.line_notify_token.is_empty() {
        return Arc::new(LogNotifier);
    }
    let line = LineNotifyConfig {
        url: config.line_notify_url.clone(),
        ..LineNotifyConfig::new(config.line_notify_token.clone())
    };
    match LineNotifier::new(line) {
        Ok(notifier) => Arc::new(notifier),
        Err(err) => {
            warn!(error = %err, "could not build LINE notifier; notifications go to the log");
            Arc::new(LogNotifier)
        }
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    tabs: Vec<TabSpec>,
    source: Arc<dyn TabSource>,
    store: Arc<dyn SheetStore>,
    activity: ActivityLog,
    notifier: Arc<dyn Notifier>,
}

impl SyncPipeline {
    /// Pipeline over the workspace's `tabs.yaml`, captures and sheet files.
    pub fn new(config: SyncConfig) -> anyhow::Result<Self> {
        let registry = TabRegistry::load(&config.workspace_root)?;
        Ok(Self::with_tabs(config, registry.enabled_tabs()))
    }

    pub fn with_tabs(config: SyncConfig, tabs: Vec<TabSpec>) -> Self {
        let source = Arc::new(SnapshotTabSource::new(config.capture_dir.clone()));
        let store = Arc::new(JsonFileSheet::new(config.store_path.clone()));
        let activity = ActivityLog::new(
            Arc::new(JsonFileSheet::new(config.log_path.clone())),
            config.offset(),
        );
        let notifier = notifier_for(&config);
        Self {
            config,
            tabs,
            source,
            store,
            activity,
            notifier,
        }
    }

    pub fn with_source(mut self, source: Arc<dyn TabSource>) -> Self {
        self.source = source;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn SheetStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_activity_store(mut self, store: Arc<dyn SheetStore>) -> Self {
        self.activity = ActivityLog::new(store, self.config.offset());
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn tabs(&self) -> &[TabSpec] {
        &self.tabs
    }

    pub async fn run_once(&self) -> Result<RunSummary, RunError> {
        let run_id = Uuid::new_v4();
        self.run(run_id)
            .instrument(info_span!("sync_run", %run_id))
            .await
    }

    async fn run(&self, run_id: Uuid) -> Result<RunSummary, RunError> {
        let started_at = Utc::now();
        let clock = Instant::now();
        info!(tabs = self.tabs.len(), "sync started");
        self.activity
            .record("Sync Start", "Starting job sync", "Success")
            .await;

        let rows = match self.store.read_all().await {
            Ok(rows) => rows,
            Err(err) => {
                error!(error = %err, "cannot read master sheet; aborting run");
                self.notifier
                    .send(&format!("Critical error: job sync aborted, master sheet unavailable ({err})"))
                    .await;
                self.activity
                    .record("Sync Failed", &err.to_string(), "Failed")
                    .await;
                return Err(RunError::StoreUnavailable(err));
            }
        };
        let index = ExistingIndex::load(&rows);
        let mut reconciler = Reconciler::new(&index, started_at);

        let ctx = FetchContext {
            run_id,
            fetched_at: started_at,
        };
        let mut successful_tabs = Vec::new();
        let mut failed_tabs = Vec::new();
        for tab in &self.tabs {
            let span = info_span!("tab", tag = tab.tag, name = %tab.display_name);
            match self.source.fetch_tab(&ctx, tab).instrument(span.clone()).await {
                Ok(table) if !table.is_empty() => {
                    span.in_scope(|| reconcile_table(&mut reconciler, &table, tab));
                    successful_tabs.push(tab.display_name.clone());
                }
                Ok(_) => {
                    span.in_scope(|| warn!("tab returned no rows; counting it as failed"));
                    failed_tabs.push(tab.display_name.clone());
                }
                Err(err) => {
                    span.in_scope(|| warn!(error = %err, "could not fetch tab"));
                    failed_tabs.push(tab.display_name.clone());
                }
            }
        }

        let plan = reconciler.finish();
        let applied = apply_plan(self.store.as_ref(), &plan, self.config.offset()).await;

        for event in &applied.events {
            self.notifier.send(&event.to_string()).await;
        }

        let mut summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            elapsed_secs: clock.elapsed().as_secs_f64(),
            new_jobs: applied.appended_rows,
            updated_jobs: applied.status_updates,
            unchanged_jobs: plan.counts.unchanged,
            duplicate_sightings: plan.counts.duplicates,
            rejected_rows: plan.counts.rejected,
            failed_mutations: applied.failed,
            successful_tabs,
            failed_tabs,
            total_tabs: self.tabs.len(),
            sheet_url: self.config.sheet_url.clone(),
            reports_dir: None,
        };

        self.notifier.send(&summary.to_string()).await;
        self.activity
            .record("Sync Complete", &summary.log_details(), summary.status_label())
            .await;

        match report::write_reports(&self.config.workspace_root, &summary, &plan).await {
            Ok(dir) => summary.reports_dir = Some(dir.display().to_string()),
            Err(err) => warn!(error = %err, "could not write run reports"),
        }

        info!(
            new = summary.new_jobs,
            updated = summary.updated_jobs,
            unchanged = summary.unchanged_jobs,
            failed_mutations = summary.failed_mutations,
            failed_tabs = summary.failed_tabs.len(),
            elapsed_secs = summary.elapsed_secs,
            "sync finished"
        );
        Ok(summary)
    }
}

fn reconcile_table(reconciler: &mut Reconciler<'_>, table: &TabTable, tab: &TabSpec) {
    if identifier_column(&table.headers).is_none() {
        warn!(rows = table.rows.len(), "tab has no job-number column; rejecting its rows");
    }
    let mut accepted = 0usize;
    for (i, row) in table.rows.iter().enumerate() {
        match normalize_row(&table.headers, row, &tab.display_name) {
            Ok(normalized) => {
                reconciler.observe(normalized);
                accepted += 1;
            }
            Err(RowRejection::NoIdentifierColumn) => reconciler.record_rejection(),
            Err(reason) => {
                warn!(row = i + 1, %reason, "skipping row");
                reconciler.record_rejection();
            }
        }
    }
    info!(rows = table.rows.len(), accepted, "reconciled tab");
}

/// Build a pipeline from the environment and run it once. Setup failures are
/// reported to the notifier before being returned.
pub async fn run_sync_once_from_env() -> anyhow::Result<RunSummary> {
    let config = SyncConfig::from_env();
    let pipeline = match SyncPipeline::new(config.clone()) {
        Ok(pipeline) => pipeline,
        Err(err) => {
            let detail = format!("{err:#}");
            error!(error = %detail, "sync setup failed");
            notifier_for(&config)
                .send(&format!("Critical error: job sync could not start ({detail})"))
                .await;
            return Err(err);
        }
    };
    Ok(pipeline.run_once().await?)
}

/// Default workspace root for commands that only read reports.
pub fn workspace_root_from_env() -> PathBuf {
    SyncConfig::from_env().workspace_root
}
