use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    get_optional_bool, get_required_str, require_subject, unsaved_changes, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashSet;
use tracing::info;
use uuid::Uuid;

const SUBJECT_CODE_MAX_LEN: usize = 32;
const ROSTER_MAX_STUDENTS: usize = 2000;

fn subjects_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let code = get_required_str(params, "code")?;
    let name = get_required_str(params, "name")?;
    if code.len() > SUBJECT_CODE_MAX_LEN {
        return Err(HandlerErr::bad_params(format!(
            "code length must be <= {}",
            SUBJECT_CODE_MAX_LEN
        )));
    }

    let subject_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO subjects(id, code, name) VALUES(?, ?, ?)",
        (&subject_id, &code, &name),
    )
    .map_err(|e| match e {
        rusqlite::Error::SqliteFailure(f, _)
            if f.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            HandlerErr {
                code: "conflict",
                message: "subject code already exists".to_string(),
                details: Some(json!({ "code": code })),
            }
        }
        other => HandlerErr::db("db_insert_failed", other),
    })?;

    Ok(json!({ "subjectId": subject_id }))
}

fn subjects_list(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.code, s.name,
                    (SELECT COUNT(*) FROM students st WHERE st.subject_id = s.id AND st.active = 1)
             FROM subjects s
             ORDER BY s.code",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let subjects = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "code": r.get::<_, String>(1)?,
                "name": r.get::<_, String>(2)?,
                "studentCount": r.get::<_, i64>(3)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(json!({ "subjects": subjects }))
}

struct RosterRow {
    id: String,
    roll_no: Option<String>,
    last_name: String,
    first_name: String,
    active: bool,
}

fn parse_roster_rows(params: &serde_json::Value) -> Result<Vec<RosterRow>, HandlerErr> {
    let Some(arr) = params.get("students").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("missing students[]"));
    };
    if arr.len() > ROSTER_MAX_STUDENTS {
        return Err(HandlerErr {
            code: "bad_params",
            message: "roster is too large".to_string(),
            details: Some(json!({ "count": arr.len(), "max": ROSTER_MAX_STUDENTS })),
        });
    }

    let mut seen = HashSet::new();
    let mut rows = Vec::with_capacity(arr.len());
    for (i, item) in arr.iter().enumerate() {
        let last_name = get_required_str(item, "lastName")
            .map_err(|_| HandlerErr::bad_params(format!("students[{}] missing lastName", i)))?;
        let first_name = get_required_str(item, "firstName")
            .map_err(|_| HandlerErr::bad_params(format!("students[{}] missing firstName", i)))?;
        let id = item
            .get("id")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        if !seen.insert(id.clone()) {
            return Err(HandlerErr {
                code: "bad_params",
                message: "duplicate student id in roster".to_string(),
                details: Some(json!({ "id": id })),
            });
        }
        let roll_no = item
            .get("rollNo")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        let active = item.get("active").and_then(|v| v.as_bool()).unwrap_or(true);
        rows.push(RosterRow {
            id,
            roll_no,
            last_name,
            first_name,
            active,
        });
    }
    Ok(rows)
}

/// Replace a subject's roster. Students dropped from the list are marked
/// inactive rather than deleted so their stored marks stay referenced.
fn roster_set(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let subject_id = get_required_str(params, "subjectId")?;
    require_subject(conn, &subject_id)?;
    let rows = parse_roster_rows(params)?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    tx.execute(
        "UPDATE students SET active = 0 WHERE subject_id = ?",
        [&subject_id],
    )
    .map_err(|e| HandlerErr::db("db_update_failed", e))?;

    for (i, row) in rows.iter().enumerate() {
        let owner: Option<String> = tx
            .query_row(
                "SELECT subject_id FROM students WHERE id = ?",
                [&row.id],
                |r| r.get(0),
            )
            .optional()
            .map_err(|e| HandlerErr::db("db_query_failed", e))?;
        if let Some(owner) = owner {
            if owner != subject_id {
                return Err(HandlerErr {
                    code: "conflict",
                    message: "student id belongs to another subject".to_string(),
                    details: Some(json!({ "id": row.id })),
                });
            }
        }

        tx.execute(
            "INSERT INTO students(id, subject_id, roll_no, last_name, first_name, active, sort_order)
             VALUES(?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
               roll_no = excluded.roll_no,
               last_name = excluded.last_name,
               first_name = excluded.first_name,
               active = excluded.active,
               sort_order = excluded.sort_order",
            (
                &row.id,
                &subject_id,
                &row.roll_no,
                &row.last_name,
                &row.first_name,
                row.active as i64,
                i as i64,
            ),
        )
        .map_err(|e| HandlerErr {
            code: "db_insert_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "students" })),
        })?;
    }
    tx.commit().map_err(|e| HandlerErr::db("db_commit_failed", e))?;

    let ids: Vec<&str> = rows.iter().map(|r| r.id.as_str()).collect();
    Ok(json!({ "count": rows.len(), "studentIds": ids }))
}

fn roster_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let subject_id = get_required_str(params, "subjectId")?;
    require_subject(conn, &subject_id)?;
    let mut stmt = conn
        .prepare(
            "SELECT id, roll_no, last_name, first_name, active, sort_order
             FROM students
             WHERE subject_id = ?
             ORDER BY active DESC, sort_order",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let students = stmt
        .query_map([&subject_id], |r| {
            let last: String = r.get(2)?;
            let first: String = r.get(3)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "rollNo": r.get::<_, Option<String>>(1)?,
                "lastName": last,
                "firstName": first,
                "displayName": format!("{}, {}", last, first),
                "active": r.get::<_, i64>(4)? != 0,
                "sortOrder": r.get::<_, i64>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(json!({ "students": students }))
}

fn handle_subjects_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match subjects_create(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_subjects_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match subjects_list(conn) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

/// An open marks session for the same subject was built from the old roster,
/// so it is closed once the new roster is stored. Unsaved edits in it block
/// the change unless `discardUnsaved` is set.
fn handle_roster_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let discard = match get_optional_bool(&req.params, "discardUnsaved") {
        Ok(v) => v.unwrap_or(false),
        Err(e) => return e.response(&req.id),
    };
    let subject_id = req.params.get("subjectId").and_then(|v| v.as_str()).map(str::trim);
    let affected = state
        .marks
        .as_ref()
        .filter(|open| Some(open.context().subject_id.as_str()) == subject_id);
    if let Some(open) = affected {
        if open.dirty_count() > 0 && !discard {
            return unsaved_changes(open).response(&req.id);
        }
    }
    let close_session = affected.is_some();

    let mut result = match roster_set(conn, &req.params) {
        Ok(result) => result,
        Err(error) => return error.response(&req.id),
    };
    if close_session {
        if let Some(store) = state.marks.take() {
            info!(
                subject_id = %store.context().subject_id,
                term = %store.context().term,
                discarded = store.dirty_count(),
                "roster replaced; closing marks session"
            );
        }
    }
    result["marksClosed"] = json!(close_session);
    ok(&req.id, result)
}

fn handle_roster_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match roster_list(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "subjects.create" => Some(handle_subjects_create(state, req)),
        "subjects.list" => Some(handle_subjects_list(state, req)),
        "roster.set" => Some(handle_roster_set(state, req)),
        "roster.list" => Some(handle_roster_list(state, req)),
        _ => None,
    }
}
