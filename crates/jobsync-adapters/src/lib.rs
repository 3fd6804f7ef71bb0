//! Tab source contracts: turn captured portal tab pages into header + row
//! tables for the sync pipeline.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobsync_core::{RawRow, TabSpec, TabTable};
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("no capture found for tab {tag} under {dir}")]
    MissingCapture { tag: u32, dir: String },
    #[error("no job table found in capture {0}")]
    NoJobTable(String),
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// "Fetch tab → rows". An empty table is a valid (if suspicious) result.
#[async_trait]
pub trait TabSource: Send + Sync {
    async fn fetch_tab(&self, ctx: &FetchContext, tab: &TabSpec) -> Result<TabTable, AdapterError>;
}

/// Reads tab captures written by the browser-side scraper:
/// `<dir>/tab_<tag>.html` (the rendered page) or `<dir>/tab_<tag>.json`
/// (a table dump).
#[derive(Debug, Clone)]
pub struct SnapshotTabSource {
    dir: PathBuf,
}

impl SnapshotTabSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn capture_paths(&self, tag: u32) -> [PathBuf; 2] {
        [
            self.dir.join(format!("tab_{tag}.html")),
            self.dir.join(format!("tab_{tag}.json")),
        ]
    }
}

#[async_trait]
impl TabSource for SnapshotTabSource {
    async fn fetch_tab(&self, ctx: &FetchContext, tab: &TabSpec) -> Result<TabTable, AdapterError> {
        let [html_path, json_path] = self.capture_paths(tab.tag);

        let table = if exists(&html_path).await {
            let html = read_capture(&html_path).await?;
            select_job_table(parse_html_tables(&html)?)
                .ok_or_else(|| AdapterError::NoJobTable(html_path.display().to_string()))?
        } else if exists(&json_path).await {
            parse_json_table(&read_capture(&json_path).await?)?
        } else {
            return Err(AdapterError::MissingCapture {
                tag: tab.tag,
                dir: self.dir.display().to_string(),
            });
        };

        info!(
            run_id = %ctx.run_id,
            tab = tab.tag,
            rows = table.rows.len(),
            "loaded tab capture"
        );
        Ok(table)
    }
}

async fn exists(path: &Path) -> bool {
    fs::try_exists(path).await.unwrap_or(false)
}

async fn read_capture(path: &Path) -> Result<String, AdapterError> {
    fs::read_to_string(path)
        .await
        .map_err(|e| AdapterError::Message(format!("reading {}: {e}", path.display())))
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(e.to_string()))
}

fn cell_text(cell: ElementRef<'_>) -> String {
    cell.text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("nan") {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Extract every `<table>` on a page. Headers come from `<th>` cells (or the
/// first row when a table has none). Placeholder rows rendered as a single
/// spanning cell ("No data available in table") are dropped.
pub fn parse_html_tables(html: &str) -> Result<Vec<TabTable>, AdapterError> {
    let document = Html::parse_document(html);
    let table_sel = selector("table")?;
    let row_sel = selector("tr")?;
    let th_sel = selector("th")?;
    let cell_sel = selector("th, td")?;

    let mut tables = Vec::new();
    for table in document.select(&table_sel) {
        let mut rows = table.select(&row_sel).peekable();

        let header_row = rows.next_if(|tr| tr.select(&th_sel).next().is_some());
        let headers: Vec<String> = match header_row {
            Some(tr) => tr.select(&cell_sel).map(cell_text).collect(),
            None => match rows.next() {
                Some(tr) => tr.select(&cell_sel).map(cell_text).collect(),
                None => continue,
            },
        };
        if headers.is_empty() {
            continue;
        }

        let mut grid = Vec::new();
        for tr in rows {
            let cells: Vec<ElementRef<'_>> = tr.select(&cell_sel).collect();
            let placeholder = cells.len() == 1
                && headers.len() > 1
                && cells[0].value().attr("colspan").is_some();
            if cells.is_empty() || placeholder {
                continue;
            }
            grid.push(cells.into_iter().map(|c| text_or_none(cell_text(c))).collect());
        }

        tables.push(TabTable::from_grid(headers, grid));
    }
    Ok(tables)
}

/// The job table is the first non-empty table with a header mentioning "job".
pub fn select_job_table(tables: Vec<TabTable>) -> Option<TabTable> {
    let picked = tables.into_iter().find(|t| {
        !t.is_empty() && t.headers.iter().any(|h| h.to_lowercase().contains("job"))
    });
    if picked.is_none() {
        debug!("no table with a job column found");
    }
    picked
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum JsonTableDump {
    Grid {
        headers: Vec<String>,
        rows: Vec<Vec<JsonValue>>,
    },
    Records(Vec<serde_json::Map<String, JsonValue>>),
}

fn json_cell(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => text_or_none(s.clone()),
        other => text_or_none(other.to_string()),
    }
}

/// Parse a JSON table dump: either `{ "headers": [...], "rows": [[...]] }` or
/// an array of flat records (headers are the union of their keys).
pub fn parse_json_table(text: &str) -> Result<TabTable, AdapterError> {
    let dump: JsonTableDump = serde_json::from_str(text)
        .map_err(|e| AdapterError::Message(format!("parsing tab dump: {e}")))?;
    Ok(match dump {
        JsonTableDump::Grid { headers, rows } => TabTable::from_grid(
            headers,
            rows.iter()
                .map(|r| r.iter().map(json_cell).collect())
                .collect(),
        ),
        JsonTableDump::Records(records) => {
            let mut headers: Vec<String> = Vec::new();
            for record in &records {
                for key in record.keys() {
                    if !headers.contains(key) {
                        headers.push(key.clone());
                    }
                }
            }
            let rows = records
                .iter()
                .map(|record| {
                    RawRow::new(
                        headers
                            .iter()
                            .map(|h| (h.clone(), record.get(h).and_then(json_cell)))
                            .collect(),
                    )
                })
                .collect();
            TabTable { headers, rows }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
        <html><body>
          <table class="menu"><tr><td>Home</td><td>Logout</td></tr></table>
          <table id="jobs">
            <thead><tr><th>Job No.</th><th>Description</th><th>Due Date</th></tr></thead>
            <tbody>
              <tr><td> JOB-100 </td><td>Replace
                  pump</td><td></td></tr>
              <tr><td>JOB-101</td><td>Inspect valve</td><td>01/03/2026</td></tr>
            </tbody>
          </table>
        </body></html>"#;

    #[test]
    fn html_job_table_is_picked_over_layout_tables() {
        let tables = parse_html_tables(PAGE).unwrap();
        assert_eq!(tables.len(), 2);
        let table = select_job_table(tables).unwrap();
        assert_eq!(table.headers, vec!["Job No.", "Description", "Due Date"]);
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[0].get("Job No."), Some("JOB-100"));
        assert_eq!(table.rows[0].get("Description"), Some("Replace pump"));
        assert_eq!(table.rows[0].get("Due Date"), None);
    }

    #[test]
    fn datatables_placeholder_row_is_dropped() {
        let html = r#"<table><thead><tr><th>Job No.</th><th>Desc</th></tr></thead>
            <tbody><tr><td colspan="2">No data available in table</td></tr></tbody></table>"#;
        let tables = parse_html_tables(html).unwrap();
        assert!(tables[0].is_empty());
        assert!(select_job_table(tables).is_none());
    }

    #[test]
    fn json_grid_and_record_dumps_are_accepted() {
        let grid = parse_json_table(
            r#"{"headers": ["Job No.", "Qty"], "rows": [["J-1", 3], ["J-2", null]]}"#,
        )
        .unwrap();
        assert_eq!(grid.rows[0].get("Qty"), Some("3"));
        assert_eq!(grid.rows[1].get("Qty"), None);

        let records =
            parse_json_table(r#"[{"JobNo": "J-1", "Area": "N"}, {"JobNo": "J-2", "Zone": "S"}]"#)
                .unwrap();
        assert_eq!(records.headers.len(), 3);
        assert_eq!(records.rows[1].get("Zone"), Some("S"));
        assert_eq!(records.rows[1].get("Area"), None);
    }

    #[tokio::test]
    async fn missing_capture_is_reported_per_tab() {
        let source = SnapshotTabSource::new("/nonexistent/captures");
        let ctx = FetchContext {
            run_id: Uuid::new_v4(),
            fetched_at: Utc::now(),
        };
        let err = source
            .fetch_tab(
                &ctx,
                &TabSpec {
                    tag: 99,
                    display_name: "Nowhere".into(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::MissingCapture { tag: 99, .. }));
    }
}
