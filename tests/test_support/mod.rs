#![allow(dead_code)]

use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn temp_dir(prefix: &str) -> PathBuf {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let p = std::env::temp_dir().join(format!(
        "{}-{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos(),
        SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

pub struct Sidecar {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    next_id: u64,
}

impl Sidecar {
    pub fn spawn() -> Self {
        Self::spawn_with_env(&[])
    }

    /// Spawns with extra `CAMPUSD__*` overrides layered over the defaults.
    pub fn spawn_with_env(vars: &[(&str, &str)]) -> Self {
        let exe = env!("CARGO_BIN_EXE_campusd");
        let mut cmd = Command::new(exe);
        cmd.env_remove("CAMPUSD__WORKSPACE__DEFAULT_PATH")
            .env("CAMPUSD_CONFIG", "campusd-test-none");
        for (k, v) in vars {
            cmd.env(k, v);
        }
        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn campusd");
        let stdin = child.stdin.take().expect("child stdin");
        let stdout = child.stdout.take().expect("child stdout");
        Self {
            child,
            stdin,
            reader: BufReader::new(stdout),
            next_id: 0,
        }
    }

    /// Spawns a sidecar with a fresh workspace already selected.
    pub fn with_workspace(prefix: &str) -> (Self, PathBuf) {
        Self::with_workspace_env(prefix, &[])
    }

    pub fn with_workspace_env(prefix: &str, vars: &[(&str, &str)]) -> (Self, PathBuf) {
        let workspace = temp_dir(prefix);
        let mut s = Self::spawn_with_env(vars);
        s.ok("workspace.select", json!({ "path": workspace.to_string_lossy() }));
        (s, workspace)
    }

    pub fn write_line(&mut self, line: &str) -> Value {
        writeln!(self.stdin, "{}", line).expect("write request");
        self.stdin.flush().expect("flush request");
        let mut out = String::new();
        self.reader.read_line(&mut out).expect("read response line");
        assert!(!out.trim().is_empty(), "empty response for {}", line);
        serde_json::from_str(out.trim()).expect("parse response json")
    }

    pub fn request(&mut self, method: &str, params: Value) -> Value {
        self.next_id += 1;
        let id = self.next_id.to_string();
        let payload = json!({ "id": id, "method": method, "params": params });
        let value = self.write_line(&payload.to_string());
        assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id.as_str()));
        value
    }

    pub fn ok(&mut self, method: &str, params: Value) -> Value {
        let value = self.request(method, params);
        assert!(
            value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
            "{} failed: {}",
            method,
            value
        );
        value.get("result").cloned().unwrap_or(Value::Null)
    }

    /// Sends a request expected to fail and returns its error code.
    pub fn fail(&mut self, method: &str, params: Value) -> String {
        let value = self.request(method, params);
        assert_eq!(
            value.get("ok").and_then(|v| v.as_bool()),
            Some(false),
            "{} unexpectedly succeeded: {}",
            method,
            value
        );
        value["error"]["code"].as_str().unwrap_or("").to_string()
    }

    pub fn create_school(&mut self, code: &str) -> String {
        let res = self.ok(
            "schools.create",
            json!({ "name": format!("School {code}"), "code": code }),
        );
        res["schoolId"].as_str().expect("schoolId").to_string()
    }

    pub fn create_class(&mut self, school_id: &str, name: &str, capacity: Option<i64>) -> String {
        let res = self.ok(
            "classes.create",
            json!({ "schoolId": school_id, "name": name, "section": "A", "capacity": capacity }),
        );
        res["classId"].as_str().expect("classId").to_string()
    }

    pub fn create_student(
        &mut self,
        school_id: &str,
        class_id: &str,
        admission_no: &str,
        first: &str,
        last: &str,
    ) -> String {
        let res = self.ok(
            "students.create",
            json!({
                "schoolId": school_id,
                "classId": class_id,
                "admissionNo": admission_no,
                "firstName": first,
                "lastName": last,
            }),
        );
        res["studentId"].as_str().expect("studentId").to_string()
    }

    pub fn create_user(&mut self, school_id: Option<&str>, username: &str, roles: Value) -> String {
        let res = self.ok(
            "users.create",
            json!({
                "schoolId": school_id,
                "username": username,
                "password": "secret123",
                "displayName": username,
                "roles": roles,
            }),
        );
        res["userId"].as_str().expect("userId").to_string()
    }
}

impl Drop for Sidecar {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
