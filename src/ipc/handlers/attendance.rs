use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_required_str, require_subject, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;

fn parse_percentage(v: Option<&serde_json::Value>, index: usize) -> Result<f64, HandlerErr> {
    let Some(p) = v.and_then(|v| v.as_f64()) else {
        return Err(HandlerErr::bad_params(format!(
            "entries[{}] missing numeric percentage",
            index
        )));
    };
    if !(0.0..=100.0).contains(&p) {
        return Err(HandlerErr {
            code: "bad_params",
            message: "percentage must be between 0 and 100".to_string(),
            details: Some(json!({ "index": index, "percentage": p })),
        });
    }
    Ok(p)
}

/// Record precomputed attendance percentages. The whole payload is checked
/// before anything is written.
fn attendance_set_percentages(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let subject_id = get_required_str(params, "subjectId")?;
    require_subject(conn, &subject_id)?;
    let Some(entries) = params.get("entries").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("missing entries[]"));
    };

    let mut parsed: Vec<(String, f64)> = Vec::with_capacity(entries.len());
    for (i, entry) in entries.iter().enumerate() {
        let student_id = get_required_str(entry, "studentId")
            .map_err(|_| HandlerErr::bad_params(format!("entries[{}] missing studentId", i)))?;
        let percentage = parse_percentage(entry.get("percentage"), i)?;
        parsed.push((student_id, percentage));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    for (student_id, percentage) in &parsed {
        let on_roster: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM students WHERE id = ? AND subject_id = ?",
                (student_id, &subject_id),
                |r| r.get(0),
            )
            .map_err(|e| HandlerErr::db("db_query_failed", e))?;
        if on_roster == 0 {
            return Err(HandlerErr {
                code: "not_found",
                message: "student not on subject roster".to_string(),
                details: Some(json!({ "studentId": student_id })),
            });
        }
        tx.execute(
            "INSERT INTO attendance_percentages(subject_id, student_id, percentage)
             VALUES(?, ?, ?)
             ON CONFLICT(subject_id, student_id) DO UPDATE SET
               percentage = excluded.percentage",
            (&subject_id, student_id, percentage),
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "attendance_percentages" })),
        })?;
    }
    tx.commit().map_err(|e| HandlerErr::db("db_commit_failed", e))?;

    Ok(json!({ "updated": parsed.len() }))
}

fn attendance_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let subject_id = get_required_str(params, "subjectId")?;
    require_subject(conn, &subject_id)?;
    let mut stmt = conn
        .prepare(
            "SELECT a.student_id, a.percentage
             FROM attendance_percentages a
             JOIN students s ON s.id = a.student_id
             WHERE a.subject_id = ?
             ORDER BY s.sort_order",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let entries = stmt
        .query_map([&subject_id], |r| {
            Ok(json!({
                "studentId": r.get::<_, String>(0)?,
                "percentage": r.get::<_, f64>(1)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(json!({ "entries": entries }))
}

fn handle_attendance_set_percentages(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match attendance_set_percentages(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_attendance_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match attendance_list(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.setPercentages" => Some(handle_attendance_set_percentages(state, req)),
        "attendance.list" => Some(handle_attendance_list(state, req)),
        _ => None,
    }
}
