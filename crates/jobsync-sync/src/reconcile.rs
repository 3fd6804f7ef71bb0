//! Classify each observed row as new, moved or unchanged and plan the sheet
//! mutations for the run.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use jobsync_core::{JobRecord, Mutation, RowHandle, SheetLayout};
use serde::Serialize;
use tracing::debug;

use crate::existing::ExistingIndex;
use crate::normalize::NormalizedRow;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NotificationEvent {
    NewJob {
        job_id: String,
        source_tab: String,
    },
    StatusChanged {
        job_id: String,
        from: String,
        to: String,
    },
}

impl fmt::Display for NotificationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotificationEvent::NewJob { job_id, source_tab } => {
                write!(f, "New job found: {job_id} (tab: {source_tab})")
            }
            NotificationEvent::StatusChanged { job_id, from, to } => {
                write!(f, "Job {job_id}: status changed from {from} to {to}")
            }
        }
    }
}

impl NotificationEvent {
    /// The event a mutation announces once it has been written.
    pub fn for_mutation(mutation: &Mutation) -> Option<Self> {
        match mutation {
            Mutation::Insert { record } => Some(NotificationEvent::NewJob {
                job_id: record.job_id.clone(),
                source_tab: record.source_tab.clone(),
            }),
            Mutation::UpdateStatus {
                job_id,
                previous_status,
                new_status,
                ..
            } => Some(NotificationEvent::StatusChanged {
                job_id: job_id.clone(),
                from: previous_status.clone(),
                to: new_status.clone(),
            }),
            Mutation::RewriteHeader { .. } | Mutation::Touch { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    New,
    StatusChanged,
    Unchanged,
    /// Seen earlier in this run with the same status; nothing to do.
    Duplicate,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileCounts {
    pub new: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub duplicates: usize,
    pub rejected: usize,
}

/// Everything the applier needs, in application order.
#[derive(Debug, Clone, Serialize)]
pub struct ReconcilePlan {
    pub now: DateTime<Utc>,
    pub header_before: Vec<String>,
    pub data_rows_before: usize,
    pub layout: SheetLayout,
    pub mutations: Vec<Mutation>,
    pub events: Vec<NotificationEvent>,
    pub counts: ReconcileCounts,
}

impl ReconcilePlan {
    /// Header the sheet will carry once the plan is applied.
    pub fn planned_header(&self) -> &[String] {
        self.mutations
            .iter()
            .find_map(|m| match m {
                Mutation::RewriteHeader { headers } => Some(headers.as_slice()),
                _ => None,
            })
            .unwrap_or(self.header_before.as_slice())
    }
}

#[derive(Debug, Clone)]
struct SeenJob {
    status: String,
    handle: RowHandle,
}

/// One reconciler per run. Feed rows tab by tab in priority order, then
/// call [`Reconciler::finish`].
pub struct Reconciler<'a> {
    index: &'a ExistingIndex,
    now: DateTime<Utc>,
    seen: HashMap<String, SeenJob>,
    field_keys: BTreeSet<String>,
    inserts: Vec<Mutation>,
    updates: Vec<Mutation>,
    events: Vec<NotificationEvent>,
    counts: ReconcileCounts,
}

impl<'a> Reconciler<'a> {
    pub fn new(index: &'a ExistingIndex, now: DateTime<Utc>) -> Self {
        Self {
            index,
            now,
            seen: HashMap::new(),
            field_keys: BTreeSet::new(),
            inserts: Vec::new(),
            updates: Vec::new(),
            events: Vec::new(),
            counts: ReconcileCounts::default(),
        }
    }

    pub fn record_rejection(&mut self) {
        self.counts.rejected += 1;
    }

    pub fn observe(&mut self, row: NormalizedRow) -> Outcome {
        let NormalizedRow {
            job_id,
            source_tab,
            fields,
        } = row;
        self.field_keys.extend(fields.keys().cloned());

        if let Some(seen) = self.seen.get_mut(&job_id) {
            if seen.status == source_tab {
                debug!(%job_id, %source_tab, "job already handled this run");
                self.counts.duplicates += 1;
                return Outcome::Duplicate;
            }
            let previous = std::mem::replace(&mut seen.status, source_tab.clone());
            let handle = seen.handle;
            self.push_status_change(job_id, previous, source_tab, handle);
            return Outcome::StatusChanged;
        }

        let index = self.index;
        if let Some(existing) = index.get(&job_id) {
            let handle = RowHandle::Stored {
                row: existing.row_position,
            };
            self.seen.insert(
                job_id.clone(),
                SeenJob {
                    status: source_tab.clone(),
                    handle,
                },
            );
            if existing.current_status == source_tab {
                self.counts.unchanged += 1;
                self.updates.push(Mutation::Touch { job_id, handle });
                return Outcome::Unchanged;
            }
            let previous = existing.current_status.clone();
            self.push_status_change(job_id, previous, source_tab, handle);
            return Outcome::StatusChanged;
        }

        let handle = RowHandle::Pending {
            insert_seq: self.inserts.len(),
        };
        self.seen.insert(
            job_id.clone(),
            SeenJob {
                status: source_tab.clone(),
                handle,
            },
        );
        self.counts.new += 1;
        self.events.push(NotificationEvent::NewJob {
            job_id: job_id.clone(),
            source_tab: source_tab.clone(),
        });
        self.inserts.push(Mutation::Insert {
            record: JobRecord::new(job_id, source_tab, fields, self.now),
        });
        Outcome::New
    }

    fn push_status_change(
        &mut self,
        job_id: String,
        previous_status: String,
        new_status: String,
        handle: RowHandle,
    ) {
        self.counts.updated += 1;
        self.events.push(NotificationEvent::StatusChanged {
            job_id: job_id.clone(),
            from: previous_status.clone(),
            to: new_status.clone(),
        });
        self.updates.push(Mutation::UpdateStatus {
            job_id,
            previous_status,
            new_status,
            handle,
        });
    }

    /// Header rewrite first (only when a leading column or an observed field
    /// has no column yet), then inserts, then status updates and touches in
    /// observation order.
    pub fn finish(self) -> ReconcilePlan {
        let index = self.index;
        let grows = !index.has_leading_columns()
            || self.field_keys.iter().any(|k| !index.has_column(k));
        let mut layout = index.layout();
        layout.field_columns.extend(self.field_keys);

        let mut mutations = Vec::with_capacity(1 + self.inserts.len() + self.updates.len());
        if grows {
            mutations.push(Mutation::RewriteHeader {
                headers: layout.headers(),
            });
        }
        mutations.extend(self.inserts);
        mutations.extend(self.updates);

        ReconcilePlan {
            now: self.now,
            header_before: index.header().to_vec(),
            data_rows_before: index.data_rows(),
            layout,
            mutations,
            events: self.events,
            counts: self.counts,
        }
    }
}
