use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::error::MarksError;
use crate::store::ScoreStore;

/// One row of a bulk save. `persisted_id` is `None` for a create.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertRequest {
    pub persisted_id: Option<String>,
    pub student_id: String,
    pub sessional: f64,
    pub attendance: f64,
    pub total: f64,
    pub subject_id: String,
    pub term: String,
}

/// Per-request answer from a sink, in request order.
#[derive(Debug, Clone, PartialEq)]
pub enum UpsertAck {
    Created(String),
    Updated,
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("sink answered {got} of {expected} requests")]
    AckCountMismatch { expected: usize, got: usize },

    #[error("sink confirmed an update for {0}, which has no stored id")]
    AckKindMismatch(String),

    #[error("{0}")]
    Rejected(String),
}

/// Destination of a bulk save. A call either applies the whole batch or
/// reports failure having applied none of it.
pub trait PersistenceSink {
    fn upsert_batch(&mut self, batch: &[UpsertRequest]) -> Result<Vec<UpsertAck>, SinkError>;
}

/// Point-in-time copy of the dirty subset, taken when a save starts.
#[derive(Debug, Clone)]
pub struct PendingBatch {
    requests: Vec<UpsertRequest>,
    revisions: Vec<u64>,
}

impl PendingBatch {
    pub fn requests(&self) -> &[UpsertRequest] {
        &self.requests
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveSummary {
    pub submitted: usize,
    pub created: usize,
    pub updated: usize,
    /// Records edited again while the batch was in flight.
    pub still_dirty: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    NoChanges,
    Saved(SaveSummary),
}

/// Copy the dirty records out of the store. Returns `None` when nothing
/// needs saving.
pub fn snapshot_dirty(store: &ScoreStore) -> Option<PendingBatch> {
    let ctx = store.context();
    let mut requests = Vec::new();
    let mut revisions = Vec::new();
    for r in store.dirty_records() {
        requests.push(UpsertRequest {
            persisted_id: r.persisted_id().map(str::to_string),
            student_id: r.student_id().to_string(),
            sessional: r.sessional(),
            attendance: r.attendance(),
            total: r.total(),
            subject_id: ctx.subject_id.clone(),
            term: ctx.term.clone(),
        });
        revisions.push(r.revision());
    }
    if requests.is_empty() {
        None
    } else {
        Some(PendingBatch {
            requests,
            revisions,
        })
    }
}

fn check_acks(batch: &PendingBatch, acks: &[UpsertAck]) -> Result<(), SinkError> {
    if acks.len() != batch.requests.len() {
        return Err(SinkError::AckCountMismatch {
            expected: batch.requests.len(),
            got: acks.len(),
        });
    }
    for (req, ack) in batch.requests.iter().zip(acks) {
        if req.persisted_id.is_none() && *ack == UpsertAck::Updated {
            return Err(SinkError::AckKindMismatch(req.student_id.clone()));
        }
    }
    Ok(())
}

/// Apply a successful sink answer to the store.
///
/// Acks are validated before anything is touched; a mismatch leaves every
/// record dirty and unbound, so the next save resends the whole subset.
/// Assigned ids are bound even when the record changed after the snapshot,
/// but such records stay dirty.
pub fn apply_acks(
    store: &mut ScoreStore,
    batch: PendingBatch,
    acks: Vec<UpsertAck>,
) -> Result<SaveSummary, MarksError> {
    if let Err(source) = check_acks(&batch, &acks) {
        warn!(attempted = batch.len(), error = %source, "sink answer does not match the batch");
        return Err(MarksError::Unconfirmed {
            attempted: batch.len(),
            source,
        });
    }

    let mut summary = SaveSummary {
        submitted: batch.len(),
        created: 0,
        updated: 0,
        still_dirty: 0,
    };
    for ((req, revision), ack) in batch.requests.iter().zip(batch.revisions).zip(acks) {
        let assigned = match &ack {
            UpsertAck::Created(id) => {
                summary.created += 1;
                Some(id.as_str())
            }
            UpsertAck::Updated => {
                summary.updated += 1;
                None
            }
        };
        let Some(record) = store.get_mut(&req.student_id) else {
            continue;
        };
        if !record.mark_saved(revision, assigned) {
            summary.still_dirty += 1;
        }
    }
    Ok(summary)
}

/// Save every dirty record through `sink` as one batch.
///
/// On failure no dirty flag is cleared and no id is bound, so the same batch
/// can be retried. There is no check against concurrent writers: the last
/// save wins.
pub fn reconcile<S: PersistenceSink + ?Sized>(
    store: &mut ScoreStore,
    sink: &mut S,
) -> Result<ReconcileOutcome, MarksError> {
    let Some(batch) = snapshot_dirty(store) else {
        return Ok(ReconcileOutcome::NoChanges);
    };

    let attempted = batch.len();
    let acks = match sink.upsert_batch(batch.requests()) {
        Ok(acks) => acks,
        Err(source) => {
            warn!(attempted, error = %source, "bulk save failed; nothing saved");
            return Err(MarksError::Persistence { attempted, source });
        }
    };

    let summary = apply_acks(store, batch, acks)?;
    info!(
        subject_id = %store.context().subject_id,
        term = %store.context().term,
        submitted = summary.submitted,
        created = summary.created,
        updated = summary.updated,
        still_dirty = summary.still_dirty,
        "bulk save complete"
    );
    Ok(ReconcileOutcome::Saved(summary))
}
