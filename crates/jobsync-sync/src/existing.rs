//! Point-in-time index of the jobs already in the master sheet.

use std::collections::HashMap;

use jobsync_core::{
    locate_job_id_column, locate_status_column, SheetLayout, FIRST_SEEN_COLUMN,
    LAST_UPDATED_COLUMN,
};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistingEntry {
    /// 1-based data-row ordinal (the header is not counted).
    pub row_position: usize,
    pub current_status: String,
}

/// Built once per run from a full read of the sheet. Row positions are only
/// valid for the run that read them. The header is kept exactly as stored;
/// names are compared with surrounding whitespace ignored.
#[derive(Debug, Clone, Default)]
pub struct ExistingIndex {
    entries: HashMap<String, ExistingEntry>,
    header: Vec<String>,
    data_rows: usize,
    id_column: Option<String>,
    status_column: Option<String>,
    first_seen_column: Option<String>,
    last_updated_column: Option<String>,
}

impl ExistingIndex {
    pub fn load(rows: &[Vec<String>]) -> Self {
        let Some((header, data)) = rows.split_first() else {
            return Self::default();
        };
        let header = header.to_vec();
        let position = |name: &str| header.iter().position(|h| h.trim() == name);
        let status_idx = locate_status_column(&header);
        let named = |idx: Option<usize>| idx.map(|i| header[i].trim().to_string());

        let mut index = Self {
            header: header.clone(),
            data_rows: data.len(),
            status_column: named(status_idx),
            first_seen_column: named(position(FIRST_SEEN_COLUMN)),
            last_updated_column: named(position(LAST_UPDATED_COLUMN)),
            ..Self::default()
        };

        let Some(id_idx) = locate_job_id_column(&header) else {
            warn!(columns = header.len(), "no job-number column in sheet header; treating sheet as empty");
            return index;
        };
        index.id_column = named(Some(id_idx));

        for (offset, row) in data.iter().enumerate() {
            let cell = |idx: usize| row.get(idx).map(|v| v.trim().to_string()).unwrap_or_default();
            let job_id = cell(id_idx);
            if job_id.is_empty() {
                continue;
            }

            let entry = ExistingEntry {
                row_position: offset + 1,
                current_status: status_idx.map(cell).unwrap_or_default(),
            };
            if let Some(previous) = index.entries.insert(job_id.clone(), entry) {
                warn!(
                    %job_id,
                    earlier_row = previous.row_position,
                    later_row = offset + 1,
                    "duplicate job number in sheet; keeping the later row"
                );
            }
        }

        info!(jobs = index.entries.len(), rows = index.data_rows, "indexed existing sheet");
        index
    }

    pub fn get(&self, job_id: &str) -> Option<&ExistingEntry> {
        self.entries.get(job_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn header(&self) -> &[String] {
        &self.header
    }

    pub fn data_rows(&self) -> usize {
        self.data_rows
    }

    /// Does the stored header already have a column for this field?
    pub fn has_column(&self, name: &str) -> bool {
        let name = name.trim();
        self.header.iter().any(|h| h.trim() == name)
    }

    /// All four leading columns were found in the stored header.
    pub fn has_leading_columns(&self) -> bool {
        self.id_column.is_some()
            && self.status_column.is_some()
            && self.first_seen_column.is_some()
            && self.last_updated_column.is_some()
    }

    /// Layout implied by the current header: located leading columns keep
    /// their (trimmed) names, missing ones take the canonical names, and every
    /// other named column carries over as a field column.
    pub fn layout(&self) -> SheetLayout {
        let mut layout = SheetLayout::default();
        if let Some(c) = &self.id_column {
            layout.id_column = c.clone();
        }
        if let Some(c) = &self.status_column {
            layout.status_column = c.clone();
        }
        if let Some(c) = &self.first_seen_column {
            layout.first_seen_column = c.clone();
        }
        if let Some(c) = &self.last_updated_column {
            layout.last_updated_column = c.clone();
        }
        let leading = layout.leading_columns().map(str::to_string);
        layout.field_columns = self
            .header
            .iter()
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty() && !leading.contains(h))
            .collect();
        layout
    }
}
