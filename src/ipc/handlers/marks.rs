use crate::calc;
use crate::error::{MarkField, MarksError};
use crate::export;
use crate::ipc::error::{err, marks_err, ok};
use crate::ipc::handlers::setup::load_marks_settings;
use crate::ipc::helpers::{get_optional_bool, get_required_str, require_subject, unsaved_changes};
use crate::ipc::types::{AppState, Request};
use crate::persist::SqliteMarks;
use crate::reconcile::{self, ReconcileOutcome};
use crate::store::{parse_mark_input, MarksContext, ScoreRecord, ScoreStore};
use serde_json::json;
use std::path::PathBuf;
use tracing::info;

const TERM_MAX_LEN: usize = 32;

fn record_json(r: &ScoreRecord) -> serde_json::Value {
    json!({
        "studentId": r.student_id(),
        "rollNo": r.roll_no(),
        "displayName": r.display_name(),
        "sessional": r.sessional(),
        "attendance": r.attendance(),
        "total": r.total(),
        "grade": r.grade(),
        "attendancePercentage": r.attendance_percentage(),
        "persistedId": r.persisted_id(),
        "dirty": r.is_dirty(),
    })
}

fn store_json(store: &ScoreStore) -> serde_json::Value {
    let rows: Vec<serde_json::Value> = store.records().iter().map(record_json).collect();
    json!({
        "context": store.context(),
        "rows": rows,
        "dirtyCount": store.dirty_count(),
    })
}

/// Mark value as sent by an editor: a number, a numeric string, or a
/// cleared field (empty string or null, meaning 0).
fn parse_mark_value(field: MarkField, value: &serde_json::Value) -> Result<f64, MarksError> {
    match value {
        serde_json::Value::Null => Ok(0.0),
        serde_json::Value::Number(n) => n.as_f64().ok_or_else(|| MarksError::MalformedValue {
            field,
            raw: n.to_string(),
        }),
        serde_json::Value::String(s) => parse_mark_input(field, s),
        other => Err(MarksError::MalformedValue {
            field,
            raw: other.to_string(),
        }),
    }
}

fn handle_marks_open(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let subject_id = match get_required_str(&req.params, "subjectId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let term = match get_required_str(&req.params, "term") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    if term.len() > TERM_MAX_LEN {
        return err(
            &req.id,
            "bad_params",
            format!("term length must be <= {}", TERM_MAX_LEN),
            None,
        );
    }
    let discard = match get_optional_bool(&req.params, "discardUnsaved") {
        Ok(v) => v.unwrap_or(false),
        Err(e) => return e.response(&req.id),
    };
    if let Some(open) = state.marks.as_ref() {
        if open.dirty_count() > 0 && !discard {
            return unsaved_changes(open).response(&req.id);
        }
    }
    if let Err(e) = require_subject(conn, &subject_id) {
        return e.response(&req.id);
    }

    let settings = match load_marks_settings(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let source = SqliteMarks::new(conn);
    let roster = match source.roster(&subject_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let persisted = match source.persisted_scores(&subject_id, &term) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let attendance = match source.attendance_percentages(&subject_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let context = MarksContext { subject_id, term };
    let mut store = match ScoreStore::build(context, roster, persisted, attendance) {
        Ok(v) => v,
        Err(e) => return marks_err(&req.id, &e),
    };
    store.set_mark_noop_edits_dirty(settings.mark_noop_edits_dirty);
    info!(
        subject_id = %store.context().subject_id,
        term = %store.context().term,
        students = store.len(),
        "marks opened"
    );

    let result = store_json(&store);
    state.marks = Some(store);
    ok(&req.id, result)
}

fn handle_marks_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(store) = state.marks.as_ref() else {
        return err(&req.id, "no_marks_open", "open a subject and term first", None);
    };
    match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(student_id) => match store.get(student_id) {
            Some(record) => ok(&req.id, json!({ "record": record_json(record) })),
            None => marks_err(&req.id, &MarksError::UnknownStudent(student_id.to_string())),
        },
        None => ok(&req.id, store_json(store)),
    }
}

fn handle_marks_set(state: &mut AppState, req: &Request, field: MarkField) -> serde_json::Value {
    let Some(store) = state.marks.as_mut() else {
        return err(&req.id, "no_marks_open", "open a subject and term first", None);
    };
    let student_id = match get_required_str(&req.params, "studentId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let Some(raw_value) = req.params.get("value") else {
        return err(&req.id, "bad_params", "missing value", None);
    };
    let value = match parse_mark_value(field, raw_value) {
        Ok(v) => v,
        Err(e) => return marks_err(&req.id, &e),
    };
    let updated = match field {
        MarkField::Sessional => store.set_sessional(&student_id, value),
        MarkField::Attendance => store.set_attendance(&student_id, value),
    };
    match updated {
        Ok(record) => ok(&req.id, json!({ "record": record_json(record) })),
        Err(e) => marks_err(&req.id, &e),
    }
}

/// Re-read attendance percentages from the workspace, then re-derive every
/// attendance mark from them.
fn handle_marks_recalculate_attendance(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(store) = state.marks.as_mut() else {
        return err(&req.id, "no_marks_open", "open a subject and term first", None);
    };
    let attendance = match SqliteMarks::new(conn).attendance_percentages(&store.context().subject_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(e) = store.refresh_percentages(attendance) {
        return marks_err(&req.id, &e);
    }
    let touched = store.recalculate_attendance();
    info!(touched, "attendance marks recalculated");
    let mut result = store_json(store);
    result["touched"] = json!(touched);
    ok(&req.id, result)
}

fn handle_marks_dirty(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(store) = state.marks.as_ref() else {
        return err(&req.id, "no_marks_open", "open a subject and term first", None);
    };
    let ids: Vec<&str> = store.dirty_records().map(|r| r.student_id()).collect();
    ok(&req.id, json!({ "studentIds": ids, "count": ids.len() }))
}

fn handle_marks_save(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(store) = state.marks.as_mut() else {
        return err(&req.id, "no_marks_open", "open a subject and term first", None);
    };

    let mut sink = SqliteMarks::new(conn);
    match reconcile::reconcile(store, &mut sink) {
        Ok(ReconcileOutcome::NoChanges) => ok(&req.id, json!({ "status": "no_changes" })),
        Ok(ReconcileOutcome::Saved(summary)) => {
            let mut result = json!({ "status": "saved" });
            if let (Some(obj), Ok(serde_json::Value::Object(extra))) =
                (result.as_object_mut(), serde_json::to_value(&summary))
            {
                obj.extend(extra);
            }
            ok(&req.id, result)
        }
        Err(e) => marks_err(&req.id, &e),
    }
}

fn handle_marks_stats(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(store) = state.marks.as_ref() else {
        return err(&req.id, "no_marks_open", "open a subject and term first", None);
    };
    match calc::summarize(store) {
        Ok(stats) => match serde_json::to_value(&stats) {
            Ok(v) => ok(&req.id, v),
            Err(e) => err(&req.id, "internal", e.to_string(), None),
        },
        Err(e) => marks_err(&req.id, &e),
    }
}

fn handle_marks_export_csv(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(store) = state.marks.as_ref() else {
        return err(&req.id, "no_marks_open", "open a subject and term first", None);
    };
    let settings = match load_marks_settings(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let csv = export::marks_csv(store, settings.export);
    let out_path = req
        .params
        .get("outPath")
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .map(PathBuf::from);
    match out_path {
        Some(path) => {
            if let Err(e) = std::fs::write(&path, &csv) {
                return err(
                    &req.id,
                    "io_failed",
                    e.to_string(),
                    Some(json!({ "path": path.to_string_lossy() })),
                );
            }
            ok(
                &req.id,
                json!({ "path": path.to_string_lossy(), "rows": store.len() }),
            )
        }
        None => ok(&req.id, json!({ "csv": csv, "rows": store.len() })),
    }
}

fn handle_marks_close(state: &mut AppState, req: &Request) -> serde_json::Value {
    let discard = match get_optional_bool(&req.params, "discardUnsaved") {
        Ok(v) => v.unwrap_or(false),
        Err(e) => return e.response(&req.id),
    };
    if let Some(open) = state.marks.as_ref() {
        if open.dirty_count() > 0 && !discard {
            return unsaved_changes(open).response(&req.id);
        }
    }
    let was_open = state.marks.take().is_some();
    ok(&req.id, json!({ "closed": was_open }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "marks.open" => Some(handle_marks_open(state, req)),
        "marks.get" => Some(handle_marks_get(state, req)),
        "marks.setSessional" => Some(handle_marks_set(state, req, MarkField::Sessional)),
        "marks.setAttendance" => Some(handle_marks_set(state, req, MarkField::Attendance)),
        "marks.recalculateAttendance" => Some(handle_marks_recalculate_attendance(state, req)),
        "marks.dirty" => Some(handle_marks_dirty(state, req)),
        "marks.save" => Some(handle_marks_save(state, req)),
        "marks.stats" => Some(handle_marks_stats(state, req)),
        "marks.exportCsv" => Some(handle_marks_export_csv(state, req)),
        "marks.close" => Some(handle_marks_close(state, req)),
        _ => None,
    }
}
