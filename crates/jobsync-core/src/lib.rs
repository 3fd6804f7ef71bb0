//! Core domain model for jobsync: scraped tab tables, job records and the
//! mutations the reconciler plans against the master sheet.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

pub const JOB_ID_COLUMN: &str = "Job_No";
pub const FIRST_SEEN_COLUMN: &str = "First_Seen";
pub const LAST_UPDATED_COLUMN: &str = "Last_Updated";
pub const STATUS_COLUMN: &str = "Source_Tab";

/// Rendering pattern for timestamps written to the sheet.
pub const TIMESTAMP_FORMAT: &str = "%d/%m/%Y %H:%M:%S";

pub fn format_timestamp(ts: DateTime<Utc>, offset: FixedOffset) -> String {
    ts.with_timezone(&offset).format(TIMESTAMP_FORMAT).to_string()
}

/// A portal tab (queue) as configured in the tab registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabSpec {
    pub tag: u32,
    pub display_name: String,
}

/// One scraped table row. Cell order follows the table's header order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RawRow {
    pub cells: Vec<(String, Option<String>)>,
}

impl RawRow {
    pub fn new(cells: Vec<(String, Option<String>)>) -> Self {
        Self { cells }
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.cells
            .iter()
            .find(|(name, _)| name == column)
            .and_then(|(_, value)| value.as_deref())
    }
}

/// Everything scraped from one tab: its header schema plus rows.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TabTable {
    pub headers: Vec<String>,
    pub rows: Vec<RawRow>,
}

impl TabTable {
    /// Zip a header row with value rows; short rows get `None` cells.
    pub fn from_grid(headers: Vec<String>, grid: Vec<Vec<Option<String>>>) -> Self {
        let rows = grid
            .into_iter()
            .map(|values| {
                let mut values = values.into_iter();
                RawRow::new(
                    headers
                        .iter()
                        .map(|h| (h.clone(), values.next().flatten()))
                        .collect(),
                )
            })
            .collect();
        Self { headers, rows }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Canonical persisted job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub source_tab: String,
    pub first_seen: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub fields: BTreeMap<String, String>,
}

impl JobRecord {
    pub fn new(
        job_id: impl Into<String>,
        source_tab: impl Into<String>,
        fields: BTreeMap<String, String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            source_tab: source_tab.into(),
            first_seen: now,
            last_updated: now,
            fields,
        }
    }
}

/// Address of the sheet row a mutation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RowHandle {
    /// 1-based data-row ordinal captured when the run read the sheet.
    Stored { row: usize },
    /// The n-th (0-based) insert of the current run; resolved once appended.
    Pending { insert_seq: usize },
}

/// A computed, not yet applied, change to the master sheet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Mutation {
    RewriteHeader { headers: Vec<String> },
    Insert { record: JobRecord },
    UpdateStatus {
        job_id: String,
        previous_status: String,
        new_status: String,
        handle: RowHandle,
    },
    Touch { job_id: String, handle: RowHandle },
}

impl Mutation {
    pub fn job_id(&self) -> Option<&str> {
        match self {
            Mutation::RewriteHeader { .. } => None,
            Mutation::Insert { record } => Some(&record.job_id),
            Mutation::UpdateStatus { job_id, .. } | Mutation::Touch { job_id, .. } => Some(job_id),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Mutation::RewriteHeader { .. } => "rewrite_header",
            Mutation::Insert { .. } => "insert",
            Mutation::UpdateStatus { .. } => "update_status",
            Mutation::Touch { .. } => "touch",
        }
    }
}

/// Column layout of the master sheet: four leading columns, then every other
/// field in alphabetical order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetLayout {
    pub id_column: String,
    pub first_seen_column: String,
    pub last_updated_column: String,
    pub status_column: String,
    pub field_columns: BTreeSet<String>,
}

impl Default for SheetLayout {
    fn default() -> Self {
        Self {
            id_column: JOB_ID_COLUMN.to_string(),
            first_seen_column: FIRST_SEEN_COLUMN.to_string(),
            last_updated_column: LAST_UPDATED_COLUMN.to_string(),
            status_column: STATUS_COLUMN.to_string(),
            field_columns: BTreeSet::new(),
        }
    }
}

impl SheetLayout {
    pub fn leading_columns(&self) -> [&str; 4] {
        [
            &self.id_column,
            &self.first_seen_column,
            &self.last_updated_column,
            &self.status_column,
        ]
    }

    pub fn headers(&self) -> Vec<String> {
        let leading = self.leading_columns();
        leading
            .iter()
            .map(|s| s.to_string())
            .chain(
                self.field_columns
                    .iter()
                    .filter(|c| !leading.contains(&c.as_str()))
                    .cloned(),
            )
            .collect()
    }

    /// Render a record as a value row in the order of `headers`. Header cells
    /// match with surrounding whitespace ignored; unnamed cells stay blank.
    pub fn render_record(
        &self,
        record: &JobRecord,
        headers: &[String],
        offset: FixedOffset,
    ) -> Vec<String> {
        headers
            .iter()
            .map(|h| {
                let h = h.trim();
                if h == self.id_column {
                    record.job_id.clone()
                } else if h == self.first_seen_column {
                    format_timestamp(record.first_seen, offset)
                } else if h == self.last_updated_column {
                    format_timestamp(record.last_updated, offset)
                } else if h == self.status_column {
                    record.source_tab.clone()
                } else {
                    record.fields.get(h).cloned().unwrap_or_default()
                }
            })
            .collect()
    }
}

/// Does this header name look like a job-number column ("Job No.", "JobNo",
/// "Job Number", "Job_No")?
pub fn is_job_id_header(name: &str) -> bool {
    let lower = name.to_lowercase();
    lower.contains("job") && (lower.contains("no") || lower.contains("number"))
}

/// Does this header name look like the status/category column?
pub fn is_status_header(name: &str) -> bool {
    let lower = name.to_lowercase();
    (lower.contains("source") && lower.contains("tab")) || lower.contains("status")
}

/// Locate the identifier column: exact `Job_No`, then the heuristic. With
/// several heuristic matches the first in column order wins.
pub fn locate_job_id_column(headers: &[String]) -> Option<usize> {
    locate_column(headers, JOB_ID_COLUMN, is_job_id_header)
}

pub fn locate_status_column(headers: &[String]) -> Option<usize> {
    locate_column(headers, STATUS_COLUMN, is_status_header)
}

fn locate_column(headers: &[String], exact: &str, heuristic: fn(&str) -> bool) -> Option<usize> {
    headers
        .iter()
        .position(|h| h.trim() == exact)
        .or_else(|| headers.iter().position(|h| heuristic(h.trim())))
}
