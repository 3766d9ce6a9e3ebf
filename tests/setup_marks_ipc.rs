mod common;

use common::{code, seed_two_students, Sidecar};
use serde_json::json;

#[test]
fn setup_defaults_and_patch_validation() {
    let workspace = tempfile::tempdir().expect("temp workspace");
    let mut sc = Sidecar::spawn();
    sc.request_ok("workspace.select", json!({ "path": workspace.path().to_string_lossy() }));

    let setup = sc.request_ok("setup.get", json!({}));
    assert_eq!(setup["marks"]["markNoOpEditsDirty"], json!(true));
    assert_eq!(setup["export"]["includeRollNo"], json!(true));
    assert_eq!(setup["export"]["includeGrade"], json!(false));

    let e = sc.request_err(
        "setup.update",
        json!({ "section": "marks", "patch": { "markNoOpEditsDirty": "no" } }),
    );
    assert_eq!(code(&e), "bad_params");
    let e = sc.request_err(
        "setup.update",
        json!({ "section": "export", "patch": { "delimiter": ";" } }),
    );
    assert_eq!(code(&e), "bad_params");
    let e = sc.request_err("setup.update", json!({ "section": "reports", "patch": {} }));
    assert_eq!(code(&e), "bad_params");

    sc.request_ok(
        "setup.update",
        json!({ "section": "export", "patch": { "includeGrade": true } }),
    );
    drop(sc);

    let mut sc = Sidecar::spawn_with_args(&["--workspace", &workspace.path().to_string_lossy()]);
    let setup = sc.request_ok("setup.get", json!({}));
    assert_eq!(setup["export"]["includeGrade"], json!(true));
    assert_eq!(setup["export"]["includeRollNo"], json!(true));
}

#[test]
fn noop_edit_policy_controls_dirty_flag() {
    let workspace = tempfile::tempdir().expect("temp workspace");
    let mut sc = Sidecar::spawn();
    let subject_id = seed_two_students(&mut sc, workspace.path());
    sc.request_ok("marks.open", json!({ "subjectId": subject_id, "term": "T1" }));

    // Default: re-entering the same value still marks the record dirty.
    let r = sc.request_ok("marks.setSessional", json!({ "studentId": "s1", "value": 0 }));
    assert_eq!(r["record"]["dirty"], json!(true));
    sc.request_ok("marks.save", json!({}));

    // Applies to the open session straight away.
    sc.request_ok(
        "setup.update",
        json!({ "section": "marks", "patch": { "markNoOpEditsDirty": false } }),
    );
    let r = sc.request_ok("marks.setSessional", json!({ "studentId": "s2", "value": 0 }));
    assert_eq!(r["record"]["dirty"], json!(false));
    let r = sc.request_ok("marks.setSessional", json!({ "studentId": "s2", "value": 1 }));
    assert_eq!(r["record"]["dirty"], json!(true));

    let dirty = sc.request_ok("marks.dirty", json!({}));
    assert_eq!(dirty["studentIds"], json!(["s2"]));
}

#[test]
fn export_follows_column_settings() {
    let workspace = tempfile::tempdir().expect("temp workspace");
    let mut sc = Sidecar::spawn();
    let subject_id = seed_two_students(&mut sc, workspace.path());
    sc.request_ok("marks.open", json!({ "subjectId": subject_id, "term": "2025-T1" }));
    sc.request_ok("marks.setSessional", json!({ "studentId": "s1", "value": 65 }));

    let out = sc.request_ok("marks.exportCsv", json!({}));
    assert_eq!(out["rows"], json!(2));
    let csv = out["csv"].as_str().expect("csv");
    let lines: Vec<&str> = csv.lines().collect();
    assert_eq!(
        lines[0],
        "student_id,roll_no,name,sessional,attendance,total,attendance_percentage,term"
    );
    assert_eq!(lines[1], "s1,R1,\"Ames, Pat\",65.0,27.0,92.0,90.0,2025-T1");
    assert_eq!(lines[2], "s2,R2,\"Bose, Lee\",0.0,12.0,12.0,40.0,2025-T1");

    sc.request_ok(
        "setup.update",
        json!({ "section": "export", "patch": { "includeGrade": true, "includeRollNo": false } }),
    );
    let out = sc.request_ok("marks.exportCsv", json!({}));
    let csv = out["csv"].as_str().expect("csv");
    let lines: Vec<&str> = csv.lines().collect();
    assert_eq!(
        lines[0],
        "student_id,name,sessional,attendance,total,grade,attendance_percentage,term"
    );
    assert_eq!(lines[1], "s1,\"Ames, Pat\",65.0,27.0,92.0,A+,90.0,2025-T1");

    let path = workspace.path().join("marks.csv");
    let written = sc.request_ok("marks.exportCsv", json!({ "outPath": path.to_string_lossy() }));
    assert_eq!(written["rows"], json!(2));
    let on_disk = std::fs::read_to_string(&path).expect("read export");
    assert_eq!(on_disk, csv);
}
