#![allow(dead_code)]

use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

pub struct Sidecar {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    next_id: u64,
}

impl Sidecar {
    pub fn spawn() -> Self {
        Self::spawn_with_args(&[])
    }

    pub fn spawn_with_args(args: &[&str]) -> Self {
        let exe = env!("CARGO_BIN_EXE_internalsd");
        let mut child = Command::new(exe)
            .args(args)
            .env_remove("INTERNALSD_LOG")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn internalsd");
        let stdin = child.stdin.take().expect("child stdin");
        let stdout = child.stdout.take().expect("child stdout");
        Self {
            child,
            stdin,
            reader: BufReader::new(stdout),
            next_id: 0,
        }
    }

    pub fn send_raw(&mut self, line: &str) -> serde_json::Value {
        writeln!(self.stdin, "{}", line).expect("write request");
        self.stdin.flush().expect("flush request");
        let mut out = String::new();
        self.reader.read_line(&mut out).expect("read response line");
        assert!(!out.trim().is_empty(), "empty response for {}", line);
        serde_json::from_str(out.trim()).expect("parse response json")
    }

    pub fn request(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        self.next_id += 1;
        let id = self.next_id.to_string();
        let payload = json!({ "id": id, "method": method, "params": params });
        let value = self.send_raw(&payload.to_string());
        assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id.as_str()));
        value
    }

    pub fn request_ok(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        let value = self.request(method, params);
        assert_eq!(
            value.get("ok").and_then(|v| v.as_bool()),
            Some(true),
            "{} failed: {}",
            method,
            value
        );
        value.get("result").cloned().unwrap_or(serde_json::Value::Null)
    }

    /// Expects an error envelope and returns its `error` object.
    pub fn request_err(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        let value = self.request(method, params);
        assert_eq!(
            value.get("ok").and_then(|v| v.as_bool()),
            Some(false),
            "{} unexpectedly succeeded: {}",
            method,
            value
        );
        value.get("error").cloned().expect("error object")
    }
}

impl Drop for Sidecar {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

pub fn code(error: &serde_json::Value) -> &str {
    error.get("code").and_then(|v| v.as_str()).unwrap_or("")
}

/// Select `workspace`, create subject CS101 with students s1 (Ames) and
/// s2 (Bose), and record 90% / 40% attendance. Returns the subject id.
pub fn seed_two_students(sc: &mut Sidecar, workspace: &std::path::Path) -> String {
    sc.request_ok("workspace.select", json!({ "path": workspace.to_string_lossy() }));
    let created = sc.request_ok("subjects.create", json!({ "code": "CS101", "name": "Programming" }));
    let subject_id = created["subjectId"].as_str().expect("subjectId").to_string();
    sc.request_ok(
        "roster.set",
        json!({
            "subjectId": subject_id,
            "students": [
                { "id": "s1", "rollNo": "R1", "lastName": "Ames", "firstName": "Pat" },
                { "id": "s2", "rollNo": "R2", "lastName": "Bose", "firstName": "Lee" }
            ]
        }),
    );
    sc.request_ok(
        "attendance.setPercentages",
        json!({
            "subjectId": subject_id,
            "entries": [
                { "studentId": "s1", "percentage": 90 },
                { "studentId": "s2", "percentage": 40 }
            ]
        }),
    );
    subject_id
}
