use std::sync::Arc;

use chrono::{FixedOffset, Utc};
use jobsync_core::format_timestamp;
use jobsync_storage::{SheetStore, StoreError};
use tracing::warn;

pub const ACTIVITY_HEADERS: [&str; 4] = ["Timestamp", "Activity", "Details", "Status"];

/// Run history kept in its own sheet, next to the master sheet.
#[derive(Clone)]
pub struct ActivityLog {
    store: Arc<dyn SheetStore>,
    offset: FixedOffset,
}

impl ActivityLog {
    pub fn new(store: Arc<dyn SheetStore>, offset: FixedOffset) -> Self {
        Self { store, offset }
    }

    /// Never fails the caller; a log that cannot be written is only warned about.
    pub async fn record(&self, activity: &str, details: &str, status: &str) {
        if let Err(err) = self.try_record(activity, details, status).await {
            warn!(error = %err, activity, "could not write activity log entry");
        }
    }

    async fn try_record(&self, activity: &str, details: &str, status: &str) -> Result<(), StoreError> {
        let rows = self.store.read_all().await?;
        let has_header = rows
            .first()
            .map(|h| h.iter().map(String::as_str).eq(ACTIVITY_HEADERS))
            .unwrap_or(false);
        if !has_header {
            self.store
                .rewrite_header(ACTIVITY_HEADERS.map(str::to_string).to_vec())
                .await?;
        }
        let stamp = format_timestamp(Utc::now(), self.offset);
        self.store
            .append_rows(vec![vec![
                stamp,
                activity.to_string(),
                details.to_string(),
                status.to_string(),
            ]])
            .await
    }
}
