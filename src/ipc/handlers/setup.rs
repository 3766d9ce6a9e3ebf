use crate::db;
use crate::export::ExportOptions;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Map, Value};

#[derive(Clone, Copy)]
enum SetupSection {
    Marks,
    Export,
}

impl SetupSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "marks" => Some(Self::Marks),
            "export" => Some(Self::Export),
            _ => None,
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Marks => "setup.marks",
            Self::Export => "setup.export",
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Marks => json!({
            "markNoOpEditsDirty": true
        }),
        SetupSection::Export => json!({
            "includeRollNo": true,
            "includeGrade": false
        }),
    }
}

fn as_object_mut(value: &mut Value) -> Result<&mut Map<String, Value>, String> {
    value
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool()
        .ok_or_else(|| format!("{} must be boolean", key))
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = as_object_mut(current)?;
    for (k, v) in patch {
        match section {
            SetupSection::Marks => match k.as_str() {
                "markNoOpEditsDirty" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                _ => return Err(format!("unknown marks field: {}", k)),
            },
            SetupSection::Export => match k.as_str() {
                "includeRollNo" | "includeGrade" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                _ => return Err(format!("unknown export field: {}", k)),
            },
        }
    }
    Ok(())
}

fn load_section(conn: &rusqlite::Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Malformed historical values fall back to defaults.
            let _ = merge_section_patch(section, &mut current, saved_obj);
        }
    }
    Ok(current)
}

/// Workspace settings that shape a marks session.
#[derive(Debug, Clone, Copy)]
pub struct MarksSettings {
    pub mark_noop_edits_dirty: bool,
    pub export: ExportOptions,
}

pub fn load_marks_settings(conn: &rusqlite::Connection) -> anyhow::Result<MarksSettings> {
    let marks = load_section(conn, SetupSection::Marks)?;
    let export = load_section(conn, SetupSection::Export)?;
    let defaults = ExportOptions::default();
    Ok(MarksSettings {
        mark_noop_edits_dirty: marks
            .get("markNoOpEditsDirty")
            .and_then(|v| v.as_bool())
            .unwrap_or(true),
        export: ExportOptions {
            include_roll_no: export
                .get("includeRollNo")
                .and_then(|v| v.as_bool())
                .unwrap_or(defaults.include_roll_no),
            include_grade: export
                .get("includeGrade")
                .and_then(|v| v.as_bool())
                .unwrap_or(defaults.include_grade),
        },
    })
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let marks = match load_section(conn, SetupSection::Marks) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let export = match load_section(conn, SetupSection::Export) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "marks": marks,
            "export": export
        }),
    )
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let Some(section) = SetupSection::parse(section_raw) else {
        return err(&req.id, "bad_params", "unknown section", None);
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut current = match load_section(conn, section) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(msg) = merge_section_patch(section, &mut current, patch_obj) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(e) = db::settings_set_json(conn, section.key(), &current) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    // An open session picks up the edit policy immediately.
    if let SetupSection::Marks = section {
        if let (Some(store), Some(on)) = (
            state.marks.as_mut(),
            current.get("markNoOpEditsDirty").and_then(|v| v.as_bool()),
        ) {
            store.set_mark_noop_edits_dirty(on);
        }
    }
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_setup_get(state, req)),
        "setup.update" => Some(handle_setup_update(state, req)),
        _ => None,
    }
}
