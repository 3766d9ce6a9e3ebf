//! SQLite-backed collaborators: roster, stored marks and attendance
//! percentages in, bulk saves out.

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Transaction};
use tracing::warn;
use uuid::Uuid;

use crate::reconcile::{PersistenceSink, SinkError, UpsertAck, UpsertRequest};
use crate::store::{AttendancePercentage, PersistedScore, RosterEntry};

pub struct SqliteMarks<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteMarks<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Active students of a subject in roster order.
    pub fn roster(&self, subject_id: &str) -> rusqlite::Result<Vec<RosterEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, roll_no, last_name, first_name
             FROM students
             WHERE subject_id = ? AND active = 1
             ORDER BY sort_order",
        )?;
        let rows = stmt.query_map([subject_id], |r| {
            let last: String = r.get(2)?;
            let first: String = r.get(3)?;
            Ok(RosterEntry {
                student_id: r.get(0)?,
                roll_no: r.get(1)?,
                display_name: format!("{}, {}", last, first),
            })
        })?;
        rows.collect()
    }

    pub fn persisted_scores(&self, subject_id: &str, term: &str) -> rusqlite::Result<Vec<PersistedScore>> {
        let mut stmt = self.conn.prepare(
            "SELECT student_id, id, sessional, attendance, total
             FROM internal_marks
             WHERE subject_id = ? AND term = ?",
        )?;
        let rows = stmt.query_map((subject_id, term), |r| {
            Ok(PersistedScore {
                student_id: r.get(0)?,
                persisted_id: r.get(1)?,
                sessional: r.get(2)?,
                attendance: r.get(3)?,
                total: r.get(4)?,
            })
        })?;
        rows.collect()
    }

    pub fn attendance_percentages(&self, subject_id: &str) -> rusqlite::Result<Vec<AttendancePercentage>> {
        let mut stmt = self.conn.prepare(
            "SELECT student_id, percentage FROM attendance_percentages WHERE subject_id = ?",
        )?;
        let rows = stmt.query_map([subject_id], |r| {
            Ok(AttendancePercentage {
                student_id: r.get(0)?,
                percentage: r.get(1)?,
            })
        })?;
        rows.collect()
    }
}

/// Insert a row for (subject, term, student), or overwrite the one already
/// there. Returns the id the row ends up with.
fn insert_or_overwrite(
    tx: &Transaction<'_>,
    id: &str,
    req: &UpsertRequest,
    now: &str,
) -> rusqlite::Result<String> {
    tx.query_row(
        "INSERT INTO internal_marks(
            id, subject_id, term, student_id, sessional, attendance, total, updated_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(subject_id, term, student_id) DO UPDATE SET
           sessional = excluded.sessional,
           attendance = excluded.attendance,
           total = excluded.total,
           updated_at = excluded.updated_at
         RETURNING id",
        (
            id,
            &req.subject_id,
            &req.term,
            &req.student_id,
            req.sessional,
            req.attendance,
            req.total,
            now,
        ),
        |r| r.get(0),
    )
}

impl PersistenceSink for SqliteMarks<'_> {
    /// Runs the whole batch in one transaction; any failure rolls back
    /// every row.
    ///
    /// A create for a (subject, term, student) that already has a stored row
    /// overwrites it and returns the existing id. An update whose row was
    /// deleted recreates it under the same id, or joins whatever row another
    /// editor has stored for that student since.
    fn upsert_batch(&mut self, batch: &[UpsertRequest]) -> Result<Vec<UpsertAck>, SinkError> {
        let tx = self.conn.unchecked_transaction()?;
        let now = Utc::now().to_rfc3339();
        let mut acks = Vec::with_capacity(batch.len());

        for req in batch {
            match &req.persisted_id {
                Some(id) => {
                    let changed = tx.execute(
                        "UPDATE internal_marks
                         SET sessional = ?, attendance = ?, total = ?, updated_at = ?
                         WHERE id = ? AND subject_id = ? AND term = ? AND student_id = ?",
                        (
                            req.sessional,
                            req.attendance,
                            req.total,
                            &now,
                            id,
                            &req.subject_id,
                            &req.term,
                            &req.student_id,
                        ),
                    )?;
                    if changed > 0 {
                        acks.push(UpsertAck::Updated);
                        continue;
                    }
                    let exists = tx
                        .query_row("SELECT 1 FROM internal_marks WHERE id = ?", [id], |r| {
                            r.get::<_, i64>(0)
                        })
                        .optional()?
                        .is_some();
                    if exists {
                        return Err(SinkError::Rejected(format!(
                            "stored mark {} does not belong to student {}",
                            id, req.student_id
                        )));
                    }
                    let stored = insert_or_overwrite(&tx, id, req, &now)?;
                    warn!(student_id = %req.student_id, stored_id = %stored, "stored mark was missing; recreated");
                    if stored == *id {
                        acks.push(UpsertAck::Updated);
                    } else {
                        acks.push(UpsertAck::Created(stored));
                    }
                }
                None => {
                    let new_id = Uuid::new_v4().to_string();
                    let stored = insert_or_overwrite(&tx, &new_id, req, &now)?;
                    acks.push(UpsertAck::Created(stored));
                }
            }
        }

        tx.commit()?;
        Ok(acks)
    }
}
