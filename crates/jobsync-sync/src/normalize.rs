//! Raw scraped row → `(job_id, fields)`.

use std::collections::BTreeMap;

use jobsync_core::{
    is_job_id_header, locate_job_id_column, RawRow, FIRST_SEEN_COLUMN, LAST_UPDATED_COLUMN,
    STATUS_COLUMN,
};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedRow {
    pub job_id: String,
    pub source_tab: String,
    pub fields: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RowRejection {
    #[error("no job-number column in the tab schema")]
    NoIdentifierColumn,
    #[error("job-number cell is empty")]
    EmptyIdentifier,
}

/// Pick the job-number column of a tab schema: exact `Job_No`, else the only
/// heuristic match, else the first heuristic match in column order.
pub fn identifier_column(headers: &[String]) -> Option<&str> {
    let idx = locate_job_id_column(headers)?;
    let matches = headers.iter().filter(|h| is_job_id_header(h.trim())).count();
    if matches > 1 {
        debug!(chosen = %headers[idx], matches, "several job-number columns in tab schema");
    }
    Some(headers[idx].as_str())
}

fn clean_value(value: Option<&str>) -> String {
    match value.map(str::trim) {
        Some(v) if v.eq_ignore_ascii_case("nan") => String::new(),
        Some(v) => v.to_string(),
        None => String::new(),
    }
}

/// Columns the sheet layout owns; scraped columns with these names would
/// shadow them.
fn is_reserved(name: &str) -> bool {
    matches!(name, FIRST_SEEN_COLUMN | LAST_UPDATED_COLUMN | STATUS_COLUMN)
}

pub fn normalize_row(
    headers: &[String],
    row: &RawRow,
    source_tab: &str,
) -> Result<NormalizedRow, RowRejection> {
    let id_column = identifier_column(headers).ok_or(RowRejection::NoIdentifierColumn)?;
    let job_id = clean_value(row.get(id_column));
    if job_id.is_empty() {
        return Err(RowRejection::EmptyIdentifier);
    }

    let fields = row
        .cells
        .iter()
        .filter_map(|(name, value)| {
            let key = name.trim();
            if key.is_empty() || is_job_id_header(key) || is_reserved(key) {
                return None;
            }
            Some((key.to_string(), clean_value(value.as_deref())))
        })
        .collect();

    Ok(NormalizedRow {
        job_id,
        source_tab: source_tab.to_string(),
        fields,
    })
}
