use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::calc::{self, derive_attendance_mark, Grade, MAX_ATTENDANCE, MAX_SESSIONAL};
use crate::error::{MarkField, MarksError};

/// The (subject, term) selection a store is scoped to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarksContext {
    pub subject_id: String,
    pub term: String,
}

/// One roster row as supplied by the roster provider.
#[derive(Debug, Clone, PartialEq)]
pub struct RosterEntry {
    pub student_id: String,
    pub roll_no: Option<String>,
    pub display_name: String,
}

/// A previously saved composite mark.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedScore {
    pub student_id: String,
    pub persisted_id: String,
    pub sessional: f64,
    pub attendance: f64,
    pub total: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttendancePercentage {
    pub student_id: String,
    pub percentage: f64,
}

/// Composite internal mark for one student.
///
/// The total is never stored; it is always `sessional + attendance`.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreRecord {
    student_id: String,
    roll_no: Option<String>,
    display_name: String,
    sessional: f64,
    attendance: f64,
    attendance_percentage: f64,
    persisted_id: Option<String>,
    dirty: bool,
    revision: u64,
}

impl ScoreRecord {
    pub fn student_id(&self) -> &str {
        &self.student_id
    }

    pub fn roll_no(&self) -> Option<&str> {
        self.roll_no.as_deref()
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn sessional(&self) -> f64 {
        self.sessional
    }

    pub fn attendance(&self) -> f64 {
        self.attendance
    }

    pub fn total(&self) -> f64 {
        self.sessional + self.attendance
    }

    pub fn grade(&self) -> Grade {
        calc::grade_for_total(self.total())
    }

    pub fn attendance_percentage(&self) -> f64 {
        self.attendance_percentage
    }

    pub fn persisted_id(&self) -> Option<&str> {
        self.persisted_id.as_deref()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Bumped on every accepted edit; a save only clears `dirty` when the
    /// revision it snapshotted is still current.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub(crate) fn mark_saved(&mut self, snapshot_revision: u64, assigned_id: Option<&str>) -> bool {
        if let Some(id) = assigned_id {
            self.persisted_id = Some(id.to_string());
        }
        if self.revision == snapshot_revision {
            self.dirty = false;
            true
        } else {
            false
        }
    }
}

/// Parse a mark as typed into an editor. A cleared field means 0; anything
/// else must be a finite number.
pub fn parse_mark_input(field: MarkField, raw: &str) -> Result<f64, MarksError> {
    let t = raw.trim();
    if t.is_empty() {
        return Ok(0.0);
    }
    match t.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(MarksError::MalformedValue {
            field,
            raw: raw.to_string(),
        }),
    }
}

fn check_bounds(field: MarkField, value: f64) -> Result<(), MarksError> {
    let max = field.max();
    if !value.is_finite() || value < 0.0 || value > max {
        return Err(MarksError::OutOfRange { field, max, value });
    }
    Ok(())
}

fn percentage_lookup(
    attendance: Vec<AttendancePercentage>,
) -> Result<HashMap<String, f64>, MarksError> {
    let mut percentages = HashMap::with_capacity(attendance.len());
    for a in attendance {
        if !a.percentage.is_finite() || !(0.0..=100.0).contains(&a.percentage) {
            return Err(MarksError::InvalidSeed {
                student_id: a.student_id,
                reason: format!("attendance percentage {} outside 0..=100", a.percentage),
            });
        }
        percentages.insert(a.student_id, a.percentage);
    }
    Ok(percentages)
}

/// In-memory cohort of composite marks for one (subject, term) selection,
/// kept in roster order.
#[derive(Debug, Clone)]
pub struct ScoreStore {
    context: MarksContext,
    records: Vec<ScoreRecord>,
    index: HashMap<String, usize>,
    mark_noop_edits_dirty: bool,
}

impl ScoreStore {
    /// Build the cohort from the three collaborator inputs.
    ///
    /// Every roster student gets exactly one record. Persisted rows for
    /// students no longer on the roster are ignored.
    pub fn build(
        context: MarksContext,
        roster: Vec<RosterEntry>,
        persisted: Vec<PersistedScore>,
        attendance: Vec<AttendancePercentage>,
    ) -> Result<Self, MarksError> {
        let percentages = percentage_lookup(attendance)?;

        let mut saved: HashMap<String, PersistedScore> = HashMap::new();
        for p in persisted {
            saved.insert(p.student_id.clone(), p);
        }

        let mut records = Vec::with_capacity(roster.len());
        let mut index = HashMap::with_capacity(roster.len());
        for entry in roster {
            if index.contains_key(&entry.student_id) {
                return Err(MarksError::InvalidSeed {
                    student_id: entry.student_id,
                    reason: "duplicate roster entry".to_string(),
                });
            }
            let percentage = percentages.get(&entry.student_id).copied().unwrap_or(0.0);

            let (sessional, attendance, persisted_id) = match saved.remove(&entry.student_id) {
                Some(p) => {
                    if check_bounds(MarkField::Sessional, p.sessional).is_err()
                        || check_bounds(MarkField::Attendance, p.attendance).is_err()
                    {
                        return Err(MarksError::InvalidSeed {
                            student_id: entry.student_id,
                            reason: format!(
                                "stored marks {}/{} outside 0..={}/0..={}",
                                p.sessional, p.attendance, MAX_SESSIONAL, MAX_ATTENDANCE
                            ),
                        });
                    }
                    if (p.total - (p.sessional + p.attendance)).abs() > 1e-9 {
                        warn!(
                            student_id = %entry.student_id,
                            stored_total = p.total,
                            "stored total disagrees with its components; recomputing"
                        );
                    }
                    (p.sessional, p.attendance, Some(p.persisted_id))
                }
                None => (0.0, derive_attendance_mark(percentage), None),
            };

            index.insert(entry.student_id.clone(), records.len());
            records.push(ScoreRecord {
                student_id: entry.student_id,
                roll_no: entry.roll_no,
                display_name: entry.display_name,
                sessional,
                attendance,
                attendance_percentage: percentage,
                persisted_id,
                dirty: false,
                revision: 0,
            });
        }

        if !saved.is_empty() {
            warn!(
                orphaned = saved.len(),
                subject_id = %context.subject_id,
                term = %context.term,
                "ignoring stored marks for students not on the roster"
            );
        }

        Ok(Self {
            context,
            records,
            index,
            mark_noop_edits_dirty: true,
        })
    }

    /// When false, an edit that leaves the value unchanged does not mark the
    /// record dirty.
    pub fn set_mark_noop_edits_dirty(&mut self, on: bool) {
        self.mark_noop_edits_dirty = on;
    }

    pub fn context(&self) -> &MarksContext {
        &self.context
    }

    pub fn records(&self) -> &[ScoreRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn get(&self, student_id: &str) -> Option<&ScoreRecord> {
        self.index.get(student_id).map(|&i| &self.records[i])
    }

    pub(crate) fn get_mut(&mut self, student_id: &str) -> Option<&mut ScoreRecord> {
        match self.index.get(student_id) {
            Some(&i) => Some(&mut self.records[i]),
            None => None,
        }
    }

    pub fn dirty_records(&self) -> impl Iterator<Item = &ScoreRecord> + '_ {
        self.records.iter().filter(|r| r.dirty)
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty_records().count()
    }

    pub fn set_sessional(&mut self, student_id: &str, value: f64) -> Result<&ScoreRecord, MarksError> {
        self.apply_edit(student_id, MarkField::Sessional, value)
    }

    pub fn set_attendance(&mut self, student_id: &str, value: f64) -> Result<&ScoreRecord, MarksError> {
        self.apply_edit(student_id, MarkField::Attendance, value)
    }

    fn apply_edit(
        &mut self,
        student_id: &str,
        field: MarkField,
        value: f64,
    ) -> Result<&ScoreRecord, MarksError> {
        check_bounds(field, value)?;
        let mark_noop = self.mark_noop_edits_dirty;
        let Some(&i) = self.index.get(student_id) else {
            return Err(MarksError::UnknownStudent(student_id.to_string()));
        };
        let record = &mut self.records[i];

        let slot = match field {
            MarkField::Sessional => &mut record.sessional,
            MarkField::Attendance => &mut record.attendance,
        };
        let changed = *slot != value;
        *slot = value;
        if changed || mark_noop {
            record.dirty = true;
            record.revision += 1;
        }
        debug!(
            student_id,
            field = field.as_str(),
            value,
            total = record.total(),
            dirty = record.dirty,
            "mark edited"
        );
        Ok(&self.records[i])
    }

    /// Replace every record's attendance percentage with a fresh reading.
    /// Students missing from `attendance` get 0. Marks and dirty flags are
    /// left alone; `recalculate_attendance` applies the new percentages.
    pub fn refresh_percentages(
        &mut self,
        attendance: Vec<AttendancePercentage>,
    ) -> Result<(), MarksError> {
        let percentages = percentage_lookup(attendance)?;
        for record in &mut self.records {
            record.attendance_percentage = percentages
                .get(&record.student_id)
                .copied()
                .unwrap_or(0.0);
        }
        Ok(())
    }

    /// Re-derive every attendance mark from its source percentage. Returns
    /// the number of records marked dirty.
    pub fn recalculate_attendance(&mut self) -> usize {
        let mark_noop = self.mark_noop_edits_dirty;
        let mut touched = 0;
        for record in &mut self.records {
            let derived = derive_attendance_mark(record.attendance_percentage);
            let changed = record.attendance != derived;
            record.attendance = derived;
            if changed || mark_noop {
                record.dirty = true;
                record.revision += 1;
                touched += 1;
            }
        }
        touched
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn roster(ids: &[&str]) -> Vec<RosterEntry> {
        ids.iter()
            .enumerate()
            .map(|(i, id)| RosterEntry {
                student_id: id.to_string(),
                roll_no: Some(format!("R{:02}", i + 1)),
                display_name: format!("Student, {}", id),
            })
            .collect()
    }

    pub(crate) fn pct(id: &str, p: f64) -> AttendancePercentage {
        AttendancePercentage {
            student_id: id.to_string(),
            percentage: p,
        }
    }

    pub(crate) fn ctx() -> MarksContext {
        MarksContext {
            subject_id: "subj-1".to_string(),
            term: "2025-T1".to_string(),
        }
    }

    pub(crate) fn two_student_store() -> ScoreStore {
        ScoreStore::build(
            ctx(),
            roster(&["S1", "S2"]),
            vec![],
            vec![pct("S1", 90.0), pct("S2", 40.0)],
        )
        .expect("build")
    }

    fn assert_invariants(store: &ScoreStore) {
        for r in store.records() {
            assert_eq!(r.total(), r.sessional() + r.attendance());
            assert!((0.0..=MAX_SESSIONAL).contains(&r.sessional()));
            assert!((0.0..=MAX_ATTENDANCE).contains(&r.attendance()));
        }
    }

    #[test]
    fn seeds_attendance_from_percentage() {
        let store = two_student_store();
        assert_eq!(store.get("S1").expect("S1").attendance(), 27.0);
        assert_eq!(store.get("S2").expect("S2").attendance(), 12.0);
        assert_eq!(store.get("S1").expect("S1").sessional(), 0.0);
        assert_eq!(store.dirty_count(), 0);
        assert_invariants(&store);
    }

    #[test]
    fn sessional_edit_recomputes_total_and_marks_dirty() {
        let mut store = two_student_store();
        let r = store.set_sessional("S1", 65.0).expect("edit");
        assert_eq!(r.total(), 92.0);
        assert_eq!(r.grade(), Grade::APlus);
        assert!(r.is_dirty());
        assert!(!store.get("S2").expect("S2").is_dirty());
        assert_invariants(&store);
    }

    #[test]
    fn out_of_range_edit_leaves_record_untouched() {
        let mut store = two_student_store();
        store.set_sessional("S1", 50.0).expect("edit");
        let before = store.get("S1").cloned().expect("S1");

        for bad in [-1.0, 71.0, f64::NAN] {
            let e = store.set_sessional("S1", bad).expect_err("reject");
            assert!(matches!(e, MarksError::OutOfRange { field: MarkField::Sessional, .. }));
        }
        let e = store.set_attendance("S1", 30.5).expect_err("reject");
        assert!(matches!(e, MarksError::OutOfRange { field: MarkField::Attendance, .. }));

        assert_eq!(store.get("S1"), Some(&before));
    }

    #[test]
    fn bounds_are_inclusive() {
        let mut store = two_student_store();
        store.set_sessional("S2", 70.0).expect("max sessional");
        store.set_attendance("S2", 30.0).expect("max attendance");
        assert_eq!(store.get("S2").expect("S2").total(), 100.0);
        store.set_sessional("S2", 0.0).expect("zero");
        assert_invariants(&store);
    }

    #[test]
    fn unknown_student_is_rejected() {
        let mut store = two_student_store();
        let e = store.set_sessional("nobody", 10.0).expect_err("unknown");
        assert!(matches!(e, MarksError::UnknownStudent(_)));
    }

    #[test]
    fn noop_edit_policy() {
        let mut store = two_student_store();
        store.set_attendance("S1", 27.0).expect("edit");
        assert!(store.get("S1").expect("S1").is_dirty());

        let mut quiet = two_student_store();
        quiet.set_mark_noop_edits_dirty(false);
        quiet.set_attendance("S1", 27.0).expect("edit");
        assert!(!quiet.get("S1").expect("S1").is_dirty());
        quiet.set_attendance("S1", 20.0).expect("edit");
        assert!(quiet.get("S1").expect("S1").is_dirty());
    }

    #[test]
    fn parse_input_treats_blank_as_zero_but_rejects_garbage() {
        assert_eq!(parse_mark_input(MarkField::Sessional, "").expect("blank"), 0.0);
        assert_eq!(parse_mark_input(MarkField::Sessional, "  ").expect("blank"), 0.0);
        assert_eq!(parse_mark_input(MarkField::Sessional, " 42.5 ").expect("num"), 42.5);
        assert!(matches!(
            parse_mark_input(MarkField::Sessional, "4O"),
            Err(MarksError::MalformedValue { .. })
        ));
        assert!(parse_mark_input(MarkField::Attendance, "inf").is_err());
    }

    #[test]
    fn recalculate_overwrites_overrides_and_marks_dirty() {
        let mut store = two_student_store();
        store.set_attendance("S1", 5.0).expect("override");
        let touched = store.recalculate_attendance();
        assert_eq!(touched, 2);
        assert_eq!(store.get("S1").expect("S1").attendance(), 27.0);
        assert!(store.records().iter().all(|r| r.is_dirty()));
        assert_invariants(&store);
    }

    #[test]
    fn build_prefers_persisted_values_and_ignores_orphans() {
        let persisted = vec![
            PersistedScore {
                student_id: "S1".to_string(),
                persisted_id: "p-1".to_string(),
                sessional: 60.0,
                attendance: 10.0,
                total: 70.0,
            },
            PersistedScore {
                student_id: "gone".to_string(),
                persisted_id: "p-9".to_string(),
                sessional: 1.0,
                attendance: 1.0,
                total: 2.0,
            },
        ];
        let store = ScoreStore::build(
            ctx(),
            roster(&["S1", "S2"]),
            persisted,
            vec![pct("S1", 90.0)],
        )
        .expect("build");

        let s1 = store.get("S1").expect("S1");
        assert_eq!(s1.attendance(), 10.0);
        assert_eq!(s1.attendance_percentage(), 90.0);
        assert_eq!(s1.persisted_id(), Some("p-1"));
        assert!(!s1.is_dirty());

        let s2 = store.get("S2").expect("S2");
        assert_eq!(s2.attendance(), 0.0);
        assert_eq!(s2.persisted_id(), None);

        assert_eq!(store.len(), 2);
        assert!(store.get("gone").is_none());
    }

    #[test]
    fn build_rejects_bad_seeds() {
        let dup = ScoreStore::build(ctx(), roster(&["S1", "S1"]), vec![], vec![]);
        assert!(matches!(dup, Err(MarksError::InvalidSeed { .. })));

        let bad_pct = ScoreStore::build(ctx(), roster(&["S1"]), vec![], vec![pct("S1", -5.0)]);
        assert!(matches!(bad_pct, Err(MarksError::InvalidSeed { .. })));

        let bad_stored = ScoreStore::build(
            ctx(),
            roster(&["S1"]),
            vec![PersistedScore {
                student_id: "S1".to_string(),
                persisted_id: "p-1".to_string(),
                sessional: 75.0,
                attendance: 0.0,
                total: 75.0,
            }],
            vec![],
        );
        assert!(matches!(bad_stored, Err(MarksError::InvalidSeed { .. })));
    }

    #[test]
    fn records_keep_roster_order() {
        let store = ScoreStore::build(ctx(), roster(&["b", "a", "c"]), vec![], vec![]).expect("build");
        let ids: Vec<&str> = store.records().iter().map(|r| r.student_id()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
    }

    #[test]
    fn refreshed_percentages_feed_the_next_recalculation() {
        let mut store = two_student_store();
        store.refresh_percentages(vec![pct("S1", 50.0)]).expect("refresh");
        let s1 = store.get("S1").expect("S1");
        assert_eq!(s1.attendance_percentage(), 50.0);
        assert_eq!(s1.attendance(), 27.0);
        assert!(!s1.is_dirty());
        assert_eq!(store.get("S2").expect("S2").attendance_percentage(), 0.0);

        store.recalculate_attendance();
        assert_eq!(store.get("S1").expect("S1").attendance(), 15.0);
        assert_eq!(store.get("S2").expect("S2").attendance(), 0.0);

        let bad = store.refresh_percentages(vec![pct("S1", 50.0), pct("S2", 101.0)]);
        assert!(matches!(bad, Err(MarksError::InvalidSeed { .. })));
        assert_eq!(store.get("S1").expect("S1").attendance_percentage(), 50.0);
    }
}
