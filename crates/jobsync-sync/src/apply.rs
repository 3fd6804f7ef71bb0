//! Drive a [`ReconcilePlan`] against a [`SheetStore`], one call at a time.

use chrono::FixedOffset;
use jobsync_core::{format_timestamp, Mutation, RowHandle};
use jobsync_storage::SheetStore;
use serde::Serialize;
use tracing::{info, warn};

use crate::reconcile::{NotificationEvent, ReconcilePlan};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    pub applied: usize,
    pub failed: usize,
    pub header_rewritten: bool,
    pub appended_rows: usize,
    /// Status moves that reached the sheet.
    pub status_updates: usize,
    /// Plan events whose mutation reached the sheet, in plan order.
    pub events: Vec<NotificationEvent>,
}

/// Apply the plan in order: header rewrite, one batched append of every
/// insert, then cell updates. A failed call is logged and counted; the
/// remaining mutations still run.
///
/// Column offsets resolve against the header actually in effect, so a failed
/// header rewrite degrades to the old layout instead of writing into the
/// wrong columns. Updates of rows inserted this run only resolve when the
/// append succeeded.
pub async fn apply_plan(
    store: &dyn SheetStore,
    plan: &ReconcilePlan,
    offset: FixedOffset,
) -> ApplyReport {
    let mut report = ApplyReport::default();
    let mut landed = Vec::new();
    let mut active_header = plan.header_before.clone();

    for mutation in &plan.mutations {
        if let Mutation::RewriteHeader { headers } = mutation {
            match store.rewrite_header(headers.clone()).await {
                Ok(()) => {
                    info!(columns = headers.len(), "rewrote sheet header");
                    active_header = headers.clone();
                    report.header_rewritten = true;
                    report.applied += 1;
                }
                Err(err) => {
                    warn!(error = %err, "header rewrite failed; keeping existing layout");
                    report.failed += 1;
                }
            }
        }
    }

    let inserts: Vec<_> = plan
        .mutations
        .iter()
        .filter(|m| matches!(m, Mutation::Insert { .. }))
        .collect();

    let mut pending_base = None;
    if !inserts.is_empty() {
        let rows = inserts
            .iter()
            .filter_map(|m| match m {
                Mutation::Insert { record } => {
                    Some(plan.layout.render_record(record, &active_header, offset))
                }
                _ => None,
            })
            .collect::<Vec<_>>();
        match store.append_rows(rows).await {
            Ok(()) => {
                info!(rows = inserts.len(), "appended new jobs");
                pending_base = Some(plan.data_rows_before);
                report.applied += inserts.len();
                report.appended_rows = inserts.len();
                landed.extend(inserts.iter().copied().filter_map(NotificationEvent::for_mutation));
            }
            Err(err) => {
                warn!(error = %err, rows = inserts.len(), "appending new jobs failed");
                report.failed += inserts.len();
            }
        }
    }

    let column = |name: &str| active_header.iter().position(|h| h.trim() == name);
    let status_col = column(&plan.layout.status_column);
    let last_updated_col = column(&plan.layout.last_updated_column);
    let stamp = format_timestamp(plan.now, offset);

    for mutation in &plan.mutations {
        let (job_id, handle, new_status) = match mutation {
            Mutation::UpdateStatus {
                job_id,
                new_status,
                handle,
                ..
            } => (job_id, handle, Some(new_status)),
            Mutation::Touch { job_id, handle } => (job_id, handle, None),
            _ => continue,
        };

        let row = match *handle {
            RowHandle::Stored { row } => Some(row),
            RowHandle::Pending { insert_seq } => pending_base.map(|base| base + insert_seq + 1),
        };
        let Some(row) = row else {
            warn!(%job_id, "row was never appended; skipping update");
            report.failed += 1;
            continue;
        };

        let result = write_update(
            store,
            row,
            new_status.map(|s| (s.as_str(), status_col)),
            last_updated_col,
            &stamp,
        )
        .await;

        match result {
            Ok(()) => {
                report.applied += 1;
                if let Some(event) = NotificationEvent::for_mutation(mutation) {
                    report.status_updates += 1;
                    landed.push(event);
                }
            }
            Err(error) => {
                warn!(%job_id, row, %error, kind = mutation.kind(), "sheet update failed");
                report.failed += 1;
            }
        }
    }

    report.events = plan
        .events
        .iter()
        .filter(|e| landed.contains(e))
        .cloned()
        .collect();
    report
}

async fn write_update(
    store: &dyn SheetStore,
    row: usize,
    status: Option<(&str, Option<usize>)>,
    last_updated_col: Option<usize>,
    stamp: &str,
) -> Result<(), String> {
    if let Some((value, col)) = status {
        let col = col.ok_or("status column missing from sheet header")?;
        store
            .update_cell(row, col, value)
            .await
            .map_err(|e| e.to_string())?;
    }
    match last_updated_col {
        Some(col) => store
            .update_cell(row, col, stamp)
            .await
            .map_err(|e| e.to_string()),
        // A status move on a sheet without a last-updated column still counts.
        None if status.is_some() => Ok(()),
        None => Err("last-updated column missing from sheet header".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::existing::ExistingIndex;
    use crate::normalize::NormalizedRow;
    use crate::reconcile::Reconciler;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use jobsync_storage::{MemorySheet, StoreError};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn row(cells: &[&str]) -> Vec<String> {
        cells.iter().map(|s| s.to_string()).collect()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 2, 0, 0).single().unwrap()
    }

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    fn observed(job_id: &str, tab: &str, fields: &[(&str, &str)]) -> NormalizedRow {
        NormalizedRow {
            job_id: job_id.into(),
            source_tab: tab.into(),
            fields: fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    async fn plan_for(store: &dyn SheetStore, rows: Vec<NormalizedRow>) -> ReconcilePlan {
        let index = ExistingIndex::load(&store.read_all().await.unwrap());
        let mut rec = Reconciler::new(&index, now());
        for r in rows {
            rec.observe(r);
        }
        rec.finish()
    }

    /// Memory sheet whose appends can be made to fail.
    struct FlakySheet {
        inner: MemorySheet,
        fail_appends: AtomicBool,
        fail_header: AtomicBool,
    }

    #[async_trait]
    impl SheetStore for FlakySheet {
        async fn read_all(&self) -> Result<Vec<Vec<String>>, StoreError> {
            self.inner.read_all().await
        }

        async fn append_rows(&self, rows: Vec<Vec<String>>) -> Result<(), StoreError> {
            if self.fail_appends.load(Ordering::SeqCst) {
                return Err(StoreError::Backend(anyhow::anyhow!("quota exceeded")));
            }
            self.inner.append_rows(rows).await
        }

        async fn update_cell(&self, row: usize, col: usize, value: &str) -> Result<(), StoreError> {
            self.inner.update_cell(row, col, value).await
        }

        async fn rewrite_header(&self, headers: Vec<String>) -> Result<(), StoreError> {
            if self.fail_header.load(Ordering::SeqCst) {
                return Err(StoreError::Backend(anyhow::anyhow!("permission denied")));
            }
            self.inner.rewrite_header(headers).await
        }
    }

    #[tokio::test]
    async fn inserts_then_layered_update_land_on_the_appended_row() {
        let store = MemorySheet::new();
        let plan = plan_for(
            &store,
            vec![
                observed("J1", "S1", &[("Area", "N")]),
                observed("J1", "S2", &[]),
            ],
        )
        .await;

        let report = apply_plan(&store, &plan, utc()).await;
        assert_eq!(report.failed, 0);
        assert_eq!(report.applied, 3);
        assert_eq!(
            store.snapshot().await,
            vec![
                row(&["Job_No", "First_Seen", "Last_Updated", "Source_Tab", "Area"]),
                row(&["J1", "01/03/2026 02:00:00", "01/03/2026 02:00:00", "S2", "N"]),
            ]
        );
    }

    #[tokio::test]
    async fn touch_refreshes_only_last_updated() {
        let store = MemorySheet::with_rows(vec![
            row(&["Job_No", "First_Seen", "Last_Updated", "Source_Tab"]),
            row(&["J1", "01/01/2026 00:00:00", "01/01/2026 00:00:00", "S1"]),
        ]);
        let plan = plan_for(&store, vec![observed("J1", "S1", &[])]).await;
        let report = apply_plan(&store, &plan, utc()).await;
        assert_eq!(
            report,
            ApplyReport { applied: 1, failed: 0, ..ApplyReport::default() }
        );
        assert_eq!(
            store.snapshot().await[1],
            row(&["J1", "01/01/2026 00:00:00", "01/03/2026 02:00:00", "S1"])
        );
    }

    #[tokio::test]
    async fn failed_append_counts_inserts_and_their_updates_but_not_others() {
        let store = FlakySheet {
            inner: MemorySheet::with_rows(vec![
                row(&["Job_No", "First_Seen", "Last_Updated", "Source_Tab"]),
                row(&["OLD", "t", "t", "S1"]),
            ]),
            fail_appends: AtomicBool::new(true),
            fail_header: AtomicBool::new(false),
        };
        let plan = plan_for(
            &store,
            vec![
                observed("NEW", "S1", &[]),
                observed("OLD", "S2", &[]),
                observed("NEW", "S2", &[]),
            ],
        )
        .await;

        let report = apply_plan(&store, &plan, utc()).await;
        assert_eq!(report.failed, 2);
        assert_eq!(report.applied, 1);
        assert_eq!(report.appended_rows, 0);
        assert_eq!(report.status_updates, 1);
        assert_eq!(store.inner.snapshot().await[1][3], "S2");
        assert_eq!(
            report.events,
            vec![NotificationEvent::StatusChanged {
                job_id: "OLD".into(),
                from: "S1".into(),
                to: "S2".into(),
            }]
        );
    }

    #[tokio::test]
    async fn padded_header_cells_keep_their_data_through_touch_and_growth() {
        let store = MemorySheet::with_rows(vec![
            row(&["Job_No", "First_Seen", "Last_Updated", "Source_Tab", "Area ", ""]),
            row(&["J1", "t", "t", "S1", "North", "handwritten note"]),
        ]);
        let plan = plan_for(&store, vec![observed("J1", "S1", &[("Area", "North")])]).await;
        let report = apply_plan(&store, &plan, utc()).await;
        assert!(!report.header_rewritten);
        assert_eq!(
            store.snapshot().await,
            vec![
                row(&["Job_No", "First_Seen", "Last_Updated", "Source_Tab", "Area ", ""]),
                row(&["J1", "t", "01/03/2026 02:00:00", "S1", "North", "handwritten note"]),
            ]
        );

        let plan = plan_for(
            &store,
            vec![
                observed("J1", "S1", &[("Area", "North")]),
                observed("J2", "S1", &[("Area", "South"), ("Zone", "Z")]),
            ],
        )
        .await;
        let report = apply_plan(&store, &plan, utc()).await;
        assert!(report.header_rewritten);
        assert_eq!(report.failed, 0);
        let rows = store.snapshot().await;
        assert_eq!(
            rows[0],
            row(&["Job_No", "First_Seen", "Last_Updated", "Source_Tab", "Area", "Zone", ""])
        );
        assert_eq!(
            rows[1],
            row(&["J1", "t", "01/03/2026 02:00:00", "S1", "North", "", "handwritten note"])
        );
        assert_eq!(rows[2][4..6], row(&["South", "Z"]));
    }

    #[tokio::test]
    async fn failed_header_rewrite_falls_back_to_old_columns() {
        let store = FlakySheet {
            inner: MemorySheet::with_rows(vec![
                row(&["Job_No", "First_Seen", "Source_Tab"]),
                row(&["J1", "t", "S1"]),
            ]),
            fail_appends: AtomicBool::new(false),
            fail_header: AtomicBool::new(true),
        };
        let plan = plan_for(
            &store,
            vec![observed("J1", "S2", &[]), observed("J2", "S1", &[("Extra", "e")])],
        )
        .await;

        let report = apply_plan(&store, &plan, utc()).await;
        assert!(!report.header_rewritten);
        assert_eq!(report.failed, 1);
        assert_eq!(
            store.inner.snapshot().await,
            vec![
                row(&["Job_No", "First_Seen", "Source_Tab"]),
                row(&["J1", "t", "S2"]),
                row(&["J2", "01/03/2026 02:00:00", "S1"]),
            ]
        );
    }
}
