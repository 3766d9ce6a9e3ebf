mod common;

use common::{code, seed_two_students, Sidecar};
use serde_json::json;

#[test]
fn envelope_errors_and_unknown_methods() {
    let mut sc = Sidecar::spawn();

    let health = sc.request_ok("health", json!({}));
    assert_eq!(health["workspacePath"], serde_json::Value::Null);
    assert_eq!(health["marksOpen"], json!(false));
    assert!(health["version"].as_str().is_some());

    let bad = sc.send_raw("{not json");
    assert_eq!(bad["ok"], json!(false));
    assert_eq!(bad["error"]["code"], json!("bad_json"));

    let e = sc.request_err("grades.publish", json!({}));
    assert_eq!(code(&e), "not_implemented");

    for method in ["subjects.list", "roster.list", "attendance.list", "setup.get", "marks.open"] {
        let e = sc.request_err(method, json!({ "subjectId": "x", "term": "T1" }));
        assert_eq!(code(&e), "no_workspace", "{}", method);
    }

    let e = sc.request_err("workspace.select", json!({}));
    assert_eq!(code(&e), "bad_params");
}

#[test]
fn unsaved_changes_guard_open_and_close() {
    let workspace = tempfile::tempdir().expect("temp workspace");
    let mut sc = Sidecar::spawn();
    let subject_id = seed_two_students(&mut sc, workspace.path());

    sc.request_ok("marks.open", json!({ "subjectId": subject_id, "term": "T1" }));
    sc.request_ok("marks.setSessional", json!({ "studentId": "s1", "value": 44 }));

    let e = sc.request_err("marks.open", json!({ "subjectId": subject_id, "term": "T2" }));
    assert_eq!(code(&e), "unsaved_changes");
    assert_eq!(e["details"]["dirtyCount"], json!(1));
    assert_eq!(e["details"]["context"]["term"], json!("T1"));

    let e = sc.request_err("marks.close", json!({}));
    assert_eq!(code(&e), "unsaved_changes");

    // The session survived both refusals.
    let still = sc.request_ok("marks.get", json!({}));
    assert_eq!(still["context"]["term"], json!("T1"));
    assert_eq!(still["rows"][0]["sessional"], json!(44.0));

    let t2 = sc.request_ok(
        "marks.open",
        json!({ "subjectId": subject_id, "term": "T2", "discardUnsaved": true }),
    );
    assert_eq!(t2["rows"][0]["sessional"], json!(0.0));

    let closed = sc.request_ok("marks.close", json!({}));
    assert_eq!(closed["closed"], json!(true));
    let closed = sc.request_ok("marks.close", json!({}));
    assert_eq!(closed["closed"], json!(false));

    let health = sc.request_ok("health", json!({}));
    assert_eq!(health["marksOpen"], json!(false));
}

#[test]
fn export_to_unwritable_path_reports_io_failure() {
    let workspace = tempfile::tempdir().expect("temp workspace");
    let mut sc = Sidecar::spawn();
    let subject_id = seed_two_students(&mut sc, workspace.path());
    sc.request_ok("marks.open", json!({ "subjectId": subject_id, "term": "T1" }));

    let bad = workspace.path().join("missing-dir").join("out.csv");
    let e = sc.request_err("marks.exportCsv", json!({ "outPath": bad.to_string_lossy() }));
    assert_eq!(code(&e), "io_failed");
}

#[test]
fn switching_workspace_drops_open_session() {
    let first = tempfile::tempdir().expect("first workspace");
    let second = tempfile::tempdir().expect("second workspace");
    let mut sc = Sidecar::spawn();
    let subject_id = seed_two_students(&mut sc, first.path());
    sc.request_ok("marks.open", json!({ "subjectId": subject_id, "term": "T1" }));

    let selected = sc.request_ok("workspace.select", json!({ "path": second.path().to_string_lossy() }));
    assert_eq!(selected["workspacePath"], json!(second.path().to_string_lossy()));
    let e = sc.request_err("marks.get", json!({}));
    assert_eq!(code(&e), "no_marks_open");
    let subjects = sc.request_ok("subjects.list", json!({}));
    assert_eq!(subjects["subjects"], json!([]));
}
