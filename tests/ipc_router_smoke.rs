mod test_support;

use serde_json::json;
use test_support::{temp_dir, Sidecar};

#[test]
fn health_reports_version_and_workspace() {
    let mut s = Sidecar::spawn();
    let health = s.ok("health", json!({}));
    assert_eq!(health["version"], env!("CARGO_PKG_VERSION"));
    assert!(health["workspacePath"].is_null());

    let workspace = temp_dir("campus-health");
    s.ok("workspace.select", json!({ "path": workspace.to_string_lossy() }));
    let health = s.ok("health", json!({}));
    assert_eq!(
        health["workspacePath"].as_str(),
        Some(workspace.to_string_lossy().as_ref())
    );
    assert!(health["schemaVersion"].as_i64().unwrap_or(0) >= 1);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn selecting_a_fresh_directory_creates_the_schema() {
    let root = temp_dir("campus-fresh");
    let workspace = root.join("not").join("there").join("yet");
    let mut s = Sidecar::spawn();
    let selected = s.request("workspace.select", json!({ "path": workspace.to_string_lossy() }));
    assert_eq!(selected["ok"], true, "{selected}");
    assert!(workspace.join("campus.sqlite3").is_file());
    s.create_school("NEW");
    drop(s);

    // Reopening an existing workspace keeps its data.
    let mut s = Sidecar::spawn();
    s.ok("workspace.select", json!({ "path": workspace.to_string_lossy() }));
    let schools = s.ok("schools.list", json!({}));
    assert_eq!(schools["schools"][0]["code"], "NEW");
    drop(s);
    let _ = std::fs::remove_dir_all(root);
}

#[test]
fn unknown_method_and_missing_workspace_are_reported() {
    let mut s = Sidecar::spawn();
    assert_eq!(s.fail("nope.nothing", json!({})), "not_implemented");
    assert_eq!(s.fail("schools.list", json!({})), "no_workspace");
    assert_eq!(s.fail("workspace.select", json!({})), "bad_params");
}

#[test]
fn malformed_line_gets_bad_json_and_loop_continues() {
    let mut s = Sidecar::spawn();
    let resp = s.write_line("{ not json");
    assert_eq!(resp["ok"], false);
    assert_eq!(resp["error"]["code"], "bad_json");
    assert!(resp.get("id").is_none());
    s.ok("health", json!({}));
}

#[test]
fn every_family_is_routed() {
    let (mut s, workspace) = Sidecar::with_workspace("campus-router-smoke");
    let school_id = s.create_school("SMK");

    let methods = [
        ("workspace.info", json!({})),
        ("schools.list", json!({})),
        ("users.list", json!({ "schoolId": school_id })),
        ("classes.list", json!({ "schoolId": school_id })),
        ("students.list", json!({ "schoolId": school_id })),
        ("employees.list", json!({ "schoolId": school_id })),
        ("attendance.stats", json!({ "schoolId": school_id })),
        ("fees.heads.list", json!({ "schoolId": school_id })),
        ("fees.payments.list", json!({ "schoolId": school_id })),
        ("accounts.list", json!({ "schoolId": school_id })),
        ("inventory.categories.list", json!({ "schoolId": school_id })),
        ("inventory.items.list", json!({ "schoolId": school_id })),
        ("inventory.lowStock", json!({ "schoolId": school_id })),
        ("payroll.list", json!({ "schoolId": school_id, "month": "2024-05" })),
        ("messages.inbox", json!({ "schoolId": school_id })),
        ("events.list", json!({ "schoolId": school_id, "date": "2024-05-01" })),
        ("reports.dashboard", json!({ "schoolId": school_id })),
        ("nav.menu", json!({ "roles": { "isAdmin": true } })),
        ("backup.exportWorkspaceBundle", json!({})),
    ];
    for (method, params) in methods {
        let resp = s.request(method, params);
        if resp["ok"] == false {
            assert_ne!(resp["error"]["code"], "not_implemented", "{method} is not routed");
        }
    }

    let info = s.ok("workspace.info", json!({}));
    assert_eq!(info["counts"]["schools"], 1);
    drop(s);
    let _ = std::fs::remove_dir_all(workspace);
}
