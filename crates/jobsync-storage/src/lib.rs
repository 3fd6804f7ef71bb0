//! Sheet stores (the master sheet and the activity log) plus best-effort
//! chat notification delivery over HTTP.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sheet has no header row")]
    MissingHeader,
    #[error("row {row} is outside the sheet ({data_rows} data rows)")]
    RowOutOfRange { row: usize, data_rows: usize },
    #[error("column {col} is outside the header ({width} columns)")]
    ColumnOutOfRange { col: usize, width: usize },
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Spreadsheet-like persisted table. Row 0 of `read_all` is the header.
///
/// Calls are independent; there are no transactions. `row` arguments are
/// 1-based data-row ordinals (the header is not counted) and `col` is the
/// 0-based header index.
#[async_trait]
pub trait SheetStore: Send + Sync {
    async fn read_all(&self) -> Result<Vec<Vec<String>>, StoreError>;

    async fn append_rows(&self, rows: Vec<Vec<String>>) -> Result<(), StoreError>;

    async fn update_cell(&self, row: usize, col: usize, value: &str) -> Result<(), StoreError>;

    /// Replace the header row. Existing data rows are re-laid by column name
    /// so every value stays under its column.
    async fn rewrite_header(&self, headers: Vec<String>) -> Result<(), StoreError>;
}

/// Plain row grid shared by the in-memory and file-backed sheets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetGrid {
    pub rows: Vec<Vec<String>>,
}

impl SheetGrid {
    pub fn data_rows(&self) -> usize {
        self.rows.len().saturating_sub(1)
    }

    pub fn append(&mut self, rows: Vec<Vec<String>>) -> Result<(), StoreError> {
        if self.rows.is_empty() {
            return Err(StoreError::MissingHeader);
        }
        self.rows.extend(rows);
        Ok(())
    }

    pub fn update_cell(&mut self, row: usize, col: usize, value: &str) -> Result<(), StoreError> {
        let width = self.rows.first().ok_or(StoreError::MissingHeader)?.len();
        if col >= width {
            return Err(StoreError::ColumnOutOfRange { col, width });
        }
        let data_rows = self.data_rows();
        if row == 0 || row > data_rows {
            return Err(StoreError::RowOutOfRange { row, data_rows });
        }
        let cells = &mut self.rows[row];
        if cells.len() <= col {
            cells.resize(col + 1, String::new());
        }
        cells[col] = value.to_string();
        Ok(())
    }

    /// Replace the header and move every value under its column's new
    /// position. Names match exactly, then ignoring surrounding whitespace,
    /// each old column claimed at most once. Old columns the new header does
    /// not mention are kept at the end when they are named or hold data.
    pub fn rewrite_header(&mut self, headers: Vec<String>) {
        let Some(old_header) = self.rows.first().cloned() else {
            self.rows.push(headers);
            return;
        };

        let mut claimed = vec![false; old_header.len()];
        let mut mapping: Vec<Option<usize>> = vec![None; headers.len()];
        for (slot, name) in headers.iter().enumerate() {
            if let Some(i) = (0..old_header.len()).find(|&i| !claimed[i] && old_header[i] == *name) {
                claimed[i] = true;
                mapping[slot] = Some(i);
            }
        }
        for (slot, name) in headers.iter().enumerate() {
            if mapping[slot].is_some() {
                continue;
            }
            if let Some(i) = (0..old_header.len())
                .find(|&i| !claimed[i] && old_header[i].trim() == name.trim())
            {
                claimed[i] = true;
                mapping[slot] = Some(i);
            }
        }

        let mut header = headers;
        for i in 0..old_header.len() {
            if claimed[i] {
                continue;
            }
            let holds_data = self
                .rows
                .iter()
                .skip(1)
                .any(|row| row.get(i).is_some_and(|v| !v.trim().is_empty()));
            if holds_data || !old_header[i].trim().is_empty() {
                warn!(column = %old_header[i], "column missing from new header; keeping it at the end");
                header.push(old_header[i].clone());
                mapping.push(Some(i));
            }
        }

        for row in self.rows.iter_mut().skip(1) {
            let relaid = mapping
                .iter()
                .map(|idx| idx.and_then(|i| row.get(i).cloned()).unwrap_or_default())
                .collect();
            *row = relaid;
        }
        self.rows[0] = header;
    }
}

/// In-process sheet, used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemorySheet {
    grid: Mutex<SheetGrid>,
}

impl MemorySheet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(rows: Vec<Vec<String>>) -> Self {
        Self {
            grid: Mutex::new(SheetGrid { rows }),
        }
    }

    pub async fn snapshot(&self) -> Vec<Vec<String>> {
        self.grid.lock().await.rows.clone()
    }
}

#[async_trait]
impl SheetStore for MemorySheet {
    async fn read_all(&self) -> Result<Vec<Vec<String>>, StoreError> {
        Ok(self.grid.lock().await.rows.clone())
    }

    async fn append_rows(&self, rows: Vec<Vec<String>>) -> Result<(), StoreError> {
        self.grid.lock().await.append(rows)
    }

    async fn update_cell(&self, row: usize, col: usize, value: &str) -> Result<(), StoreError> {
        self.grid.lock().await.update_cell(row, col, value)
    }

    async fn rewrite_header(&self, headers: Vec<String>) -> Result<(), StoreError> {
        self.grid.lock().await.rewrite_header(headers);
        Ok(())
    }
}

/// Sheet persisted as a JSON document. Every write goes through a temp file
/// in the same directory followed by an atomic rename.
#[derive(Debug)]
pub struct JsonFileSheet {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileSheet {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> anyhow::Result<SheetGrid> {
        if !fs::try_exists(&self.path)
            .await
            .with_context(|| format!("checking sheet path {}", self.path.display()))?
        {
            return Ok(SheetGrid::default());
        }
        let text = fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", self.path.display()))
    }

    async fn save(&self, grid: &SheetGrid) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(grid).context("serializing sheet")?;
        write_atomic(&self.path, &bytes).await
    }

    async fn modify<F>(&self, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut SheetGrid) -> Result<(), StoreError> + Send,
    {
        let _guard = self.lock.lock().await;
        let mut grid = self.load().await?;
        f(&mut grid)?;
        self.save(&grid).await?;
        Ok(())
    }
}

#[async_trait]
impl SheetStore for JsonFileSheet {
    async fn read_all(&self) -> Result<Vec<Vec<String>>, StoreError> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.rows)
    }

    async fn append_rows(&self, rows: Vec<Vec<String>>) -> Result<(), StoreError> {
        self.modify(|grid| grid.append(rows)).await
    }

    async fn update_cell(&self, row: usize, col: usize, value: &str) -> Result<(), StoreError> {
        self.modify(|grid| grid.update_cell(row, col, value)).await
    }

    async fn rewrite_header(&self, headers: Vec<String>) -> Result<(), StoreError> {
        self.modify(|grid| {
            grid.rewrite_header(headers);
            Ok(())
        })
        .await
    }
}

/// Write `bytes` to `path` via a uniquely named temp file and rename.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

/// How one failed delivery attempt is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryFailure {
    /// Quota exhausted (429), endpoint outage (5xx) or a network hiccup.
    Transient,
    /// Bad token, revoked token, malformed request.
    Permanent,
}

impl DeliveryFailure {
    pub fn from_status(status: StatusCode) -> Self {
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            Self::Transient
        } else {
            Self::Permanent
        }
    }

    pub fn from_request_error(err: &reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            Self::Transient
        } else {
            Self::Permanent
        }
    }
}

/// Delivery attempts per message and the pauses between them.
#[derive(Debug, Clone, Copy)]
pub struct NotifyRetry {
    pub attempts: u32,
    pub first_pause: Duration,
    pub pause_cap: Duration,
}

impl Default for NotifyRetry {
    fn default() -> Self {
        Self {
            attempts: 3,
            first_pause: Duration::from_millis(500),
            pause_cap: Duration::from_secs(5),
        }
    }
}

impl NotifyRetry {
    /// Pause after the `failed`-th failed attempt (1-based), doubling each
    /// time. A `Retry-After` hint from the endpoint replaces the computed
    /// pause; either way the cap applies.
    pub fn pause_after(&self, failed: u32, retry_after: Option<Duration>) -> Duration {
        let doubled = self
            .first_pause
            .saturating_mul(1u32 << failed.saturating_sub(1).min(16));
        retry_after.unwrap_or(doubled).min(self.pause_cap)
    }
}

fn retry_after_hint(resp: &reqwest::Response) -> Option<Duration> {
    resp.headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
        .map(Duration::from_secs)
}

/// Best-effort chat notification. A `false` return never fails a run.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, message: &str) -> bool;
}

/// Used when no chat token is configured: messages only reach the log.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, message: &str) -> bool {
        info!(%message, "notification (no chat token configured)");
        false
    }
}

pub const LINE_NOTIFY_URL: &str = "https://notify-api.line.me/api/notify";

#[derive(Debug, Clone)]
pub struct LineNotifyConfig {
    pub url: String,
    pub token: String,
    pub timeout: Duration,
    pub retry: NotifyRetry,
}

impl LineNotifyConfig {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            url: LINE_NOTIFY_URL.to_string(),
            token: token.into(),
            timeout: Duration::from_secs(10),
            retry: NotifyRetry::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notifier token is not configured")]
    MissingToken,
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// LINE-Notify style endpoint: form POST with a bearer token.
#[derive(Debug)]
pub struct LineNotifier {
    client: reqwest::Client,
    config: LineNotifyConfig,
}

impl LineNotifier {
    pub fn new(config: LineNotifyConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("building reqwest client")?;
        Ok(Self { client, config })
    }

    pub async fn try_send(&self, message: &str) -> Result<(), NotifyError> {
        if self.config.token.trim().is_empty() {
            return Err(NotifyError::MissingToken);
        }

        let retry = self.config.retry;
        let mut failed = 0u32;
        loop {
            let sent = self
                .client
                .post(&self.config.url)
                .bearer_auth(&self.config.token)
                .form(&[("message", message)])
                .send()
                .await;

            let (kind, hint, error) = match sent {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => (
                    DeliveryFailure::from_status(resp.status()),
                    retry_after_hint(&resp),
                    NotifyError::HttpStatus {
                        status: resp.status().as_u16(),
                        url: resp.url().to_string(),
                    },
                ),
                Err(err) => (
                    DeliveryFailure::from_request_error(&err),
                    None,
                    NotifyError::Request(err),
                ),
            };

            failed += 1;
            if kind == DeliveryFailure::Permanent || failed >= retry.attempts {
                return Err(error);
            }
            let pause = retry.pause_after(failed, hint);
            debug!(attempt = failed, ?pause, %error, "notification attempt failed; retrying");
            tokio::time::sleep(pause).await;
        }
    }
}

#[async_trait]
impl Notifier for LineNotifier {
    async fn send(&self, message: &str) -> bool {
        let span = info_span!("notify", url = %self.config.url);
        match self.try_send(message).instrument(span).await {
            Ok(()) => {
                info!("notification sent");
                true
            }
            Err(err) => {
                warn!(error = %err, "notification failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn row(cells: &[&str]) -> Vec<String> {
        cells.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn rewrite_header_keeps_values_under_their_columns() {
        let mut grid = SheetGrid {
            rows: vec![row(&["Job_No", "Source_Tab", "B"]), row(&["J-1", "New", "b1"])],
        };
        grid.rewrite_header(row(&["Job_No", "Last_Updated", "Source_Tab", "A", "B"]));
        assert_eq!(grid.rows[1], row(&["J-1", "", "New", "", "b1"]));
    }

    #[test]
    fn rewrite_header_never_loses_padded_or_unnamed_columns() {
        let mut grid = SheetGrid {
            rows: vec![
                row(&["Job_No", "Area ", "", "", "Old"]),
                row(&["J-1", "North", "note", "", ""]),
            ],
        };
        grid.rewrite_header(row(&["Job_No", "Area", "Zone"]));
        assert_eq!(grid.rows[0], row(&["Job_No", "Area", "Zone", "", "Old"]));
        assert_eq!(grid.rows[1], row(&["J-1", "North", "", "note", ""]));
    }

    #[test]
    fn update_cell_rejects_header_and_out_of_range_addresses() {
        let mut grid = SheetGrid {
            rows: vec![row(&["Job_No", "Source_Tab"]), row(&["J-1"])],
        };
        assert!(matches!(
            grid.update_cell(0, 1, "x"),
            Err(StoreError::RowOutOfRange { .. })
        ));
        assert!(matches!(
            grid.update_cell(1, 2, "x"),
            Err(StoreError::ColumnOutOfRange { col: 2, width: 2 })
        ));
        grid.update_cell(1, 1, "Done").unwrap();
        assert_eq!(grid.rows[1], row(&["J-1", "Done"]));
    }

    #[tokio::test]
    async fn append_requires_a_header() {
        let sheet = MemorySheet::new();
        let err = sheet.append_rows(vec![row(&["J-1"])]).await.unwrap_err();
        assert!(matches!(err, StoreError::MissingHeader));
    }

    #[tokio::test]
    async fn json_file_sheet_round_trips_through_atomic_writes() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("data").join("master.json");
        let sheet = JsonFileSheet::new(&path);

        assert!(sheet.read_all().await.unwrap().is_empty());
        sheet.rewrite_header(row(&["Job_No", "Source_Tab"])).await.unwrap();
        sheet.append_rows(vec![row(&["J-1", "New"])]).await.unwrap();
        sheet.update_cell(1, 1, "Done").await.unwrap();

        let reopened = JsonFileSheet::new(&path);
        assert_eq!(
            reopened.read_all().await.unwrap(),
            vec![row(&["Job_No", "Source_Tab"]), row(&["J-1", "Done"])]
        );
        let leftovers = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn corrupt_sheet_file_is_a_read_error() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("master.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            JsonFileSheet::new(&path).read_all().await,
            Err(StoreError::Backend(_))
        ));
    }

    #[tokio::test]
    async fn line_notifier_without_token_does_not_send() {
        let notifier = LineNotifier::new(LineNotifyConfig::new("  ")).unwrap();
        assert!(matches!(
            notifier.try_send("hello").await,
            Err(NotifyError::MissingToken)
        ));
        assert!(!notifier.send("hello").await);
    }

    #[test]
    fn quota_and_outages_are_retried_but_auth_errors_are_not() {
        assert_eq!(
            DeliveryFailure::from_status(StatusCode::TOO_MANY_REQUESTS),
            DeliveryFailure::Transient
        );
        assert_eq!(
            DeliveryFailure::from_status(StatusCode::SERVICE_UNAVAILABLE),
            DeliveryFailure::Transient
        );
        assert_eq!(
            DeliveryFailure::from_status(StatusCode::UNAUTHORIZED),
            DeliveryFailure::Permanent
        );
    }

    #[test]
    fn pauses_double_then_cap_and_honour_retry_after() {
        let retry = NotifyRetry {
            attempts: 6,
            first_pause: Duration::from_millis(100),
            pause_cap: Duration::from_millis(350),
        };
        assert_eq!(retry.pause_after(1, None), Duration::from_millis(100));
        assert_eq!(retry.pause_after(2, None), Duration::from_millis(200));
        assert_eq!(retry.pause_after(3, None), Duration::from_millis(350));
        assert_eq!(
            retry.pause_after(1, Some(Duration::from_millis(250))),
            Duration::from_millis(250)
        );
        assert_eq!(retry.pause_after(1, Some(Duration::from_secs(60))), Duration::from_millis(350));
    }
}
