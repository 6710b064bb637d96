mod test_support;

use serde_json::{json, Value};
use test_support::{temp_dir, Sidecar};

struct Fixture {
    school: String,
    class_id: String,
    students: Vec<String>,
}

fn fixture(s: &mut Sidecar) -> Fixture {
    let school = s.create_school("ATT");
    let class_id = s.create_class(&school, "Grade 6", None);
    let students = ["Ana", "Bo", "Cy", "Di"]
        .iter()
        .enumerate()
        .map(|(i, first)| s.create_student(&school, &class_id, &format!("A-{i}"), first, "Roe"))
        .collect();
    Fixture {
        school,
        class_id,
        students,
    }
}

fn status_of<'a>(sheet: &'a Value, student_id: &str) -> &'a Value {
    &sheet["students"]
        .as_array()
        .expect("students")
        .iter()
        .find(|r| r["studentId"] == student_id)
        .expect("student row")["status"]
}

#[test]
fn late_counts_as_attended_and_leave_counts_in_total() {
    let (mut s, workspace) = Sidecar::with_workspace("campus-attendance-pct");
    let f = fixture(&mut s);

    let opened = s.ok(
        "attendance.open",
        json!({ "schoolId": f.school, "classId": f.class_id, "date": "2024-05-06" }),
    );
    assert!(opened["attendanceId"].is_null());
    assert_eq!(opened["students"].as_array().map(|v| v.len()), Some(4));

    let saved = s.ok(
        "attendance.save",
        json!({
            "schoolId": f.school,
            "classId": f.class_id,
            "date": "2024-05-06",
            "entries": [
                { "studentId": f.students[0], "status": "present" },
                { "studentId": f.students[1], "status": "absent", "remark": "sick" },
                { "studentId": f.students[2], "status": "late" },
                { "studentId": f.students[3], "status": "leave" },
            ],
        }),
    );
    assert!(saved["attendanceId"].is_string());
    assert_eq!(saved["stats"]["total"], 4);
    assert_eq!(saved["stats"]["attended"], 2);
    assert_eq!(saved["stats"]["percentage"].as_f64(), Some(50.0));
    assert_eq!(status_of(&saved, &f.students[1]), "absent");

    // Saving again updates in place and a null status clears the mark.
    let resaved = s.ok(
        "attendance.save",
        json!({
            "schoolId": f.school,
            "classId": f.class_id,
            "date": "2024-05-06",
            "entries": [
                { "studentId": f.students[1], "status": "present" },
                { "studentId": f.students[3], "status": null },
            ],
        }),
    );
    assert_eq!(resaved["attendanceId"], saved["attendanceId"]);
    assert_eq!(resaved["stats"]["total"], 3);
    assert_eq!(resaved["stats"]["attended"], 3);
    assert_eq!(resaved["stats"]["percentage"].as_f64(), Some(100.0));
    assert!(status_of(&resaved, &f.students[3]).is_null());
    drop(s);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn future_dates_and_outsiders_are_refused() {
    let (mut s, workspace) = Sidecar::with_workspace("campus-attendance-guard");
    let f = fixture(&mut s);
    let other_class = s.create_class(&f.school, "Grade 7", None);
    let outsider = s.create_student(&f.school, &other_class, "O-1", "Out", "Sider");

    let future = s.request(
        "attendance.markAll",
        json!({
            "schoolId": f.school,
            "classId": f.class_id,
            "date": "2999-01-01",
            "status": "present",
        }),
    );
    assert_eq!(future["error"]["details"]["field"], "date");

    let stranger = s.request(
        "attendance.save",
        json!({
            "schoolId": f.school,
            "classId": f.class_id,
            "date": "2024-05-06",
            "entries": [{ "studentId": outsider, "status": "present" }],
        }),
    );
    assert_eq!(stranger["error"]["code"], "validation_failed");

    let bad_status = s.request(
        "attendance.markAll",
        json!({
            "schoolId": f.school,
            "classId": f.class_id,
            "date": "2024-05-06",
            "status": "asleep",
        }),
    );
    assert_eq!(bad_status["error"]["code"], "validation_failed");
    drop(s);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn range_stats_sum_over_days() {
    let (mut s, workspace) = Sidecar::with_workspace("campus-attendance-range");
    let f = fixture(&mut s);
    for date in ["2024-05-06", "2024-05-07"] {
        s.ok(
            "attendance.markAll",
            json!({ "schoolId": f.school, "classId": f.class_id, "date": date, "status": "present" }),
        );
    }
    s.ok(
        "attendance.save",
        json!({
            "schoolId": f.school,
            "classId": f.class_id,
            "date": "2024-05-07",
            "entries": [{ "studentId": f.students[0], "status": "absent" }],
        }),
    );

    let stats = s.ok(
        "attendance.stats",
        json!({ "schoolId": f.school, "classId": f.class_id, "from": "2024-05-01", "to": "2024-05-31" }),
    );
    assert_eq!(stats["daysRecorded"], 2);
    assert_eq!(stats["classStats"]["total"], 8);
    assert_eq!(stats["classStats"]["attended"], 7);
    let first = stats["students"]
        .as_array()
        .expect("students")
        .iter()
        .find(|r| r["studentId"] == f.students[0].as_str())
        .expect("row")
        .clone();
    assert_eq!(first["stats"]["percentage"].as_f64(), Some(50.0));

    let reversed = s.request(
        "attendance.stats",
        json!({ "schoolId": f.school, "classId": f.class_id, "from": "2024-05-31", "to": "2024-05-01" }),
    );
    assert_eq!(reversed["error"]["details"]["field"], "to");

    let monthly = s.ok(
        "reports.attendanceMonthly",
        json!({ "schoolId": f.school, "classId": f.class_id, "month": "2024-05" }),
    );
    assert_eq!(monthly["month"], "2024-05");
    assert_eq!(monthly["classStats"]["attended"], 7);
    drop(s);
    let _ = std::fs::remove_dir_all(workspace);
}

fn two_of_three_present(s: &mut Sidecar, f: &Fixture) -> Value {
    s.ok(
        "attendance.save",
        json!({
            "schoolId": f.school,
            "classId": f.class_id,
            "date": "2024-05-08",
            "entries": [
                { "studentId": f.students[0], "status": "present" },
                { "studentId": f.students[1], "status": "present" },
                { "studentId": f.students[2], "status": "absent" },
            ],
        }),
    )
}

#[test]
fn percentages_use_the_configured_precision() {
    let (mut s, workspace) = Sidecar::with_workspace("campus-attendance-default");
    let f = fixture(&mut s);
    let saved = two_of_three_present(&mut s, &f);
    assert_eq!(saved["stats"]["percentage"].as_f64(), Some(67.0));
    drop(s);
    let _ = std::fs::remove_dir_all(workspace);

    // A config file sets two places and EUR; the environment overrides the places.
    let config_dir = temp_dir("campus-attendance-config");
    std::fs::write(
        config_dir.join("campusd.toml"),
        "[attendance]\npercent_decimals = 2\n\n[fees]\ncurrency = \"EUR\"\n",
    )
    .expect("write config");
    let config_base = config_dir.join("campusd");
    let config_base = config_base.to_string_lossy();

    let (mut s, workspace) = Sidecar::with_workspace_env(
        "campus-attendance-file",
        &[("CAMPUSD_CONFIG", config_base.as_ref())],
    );
    let f = fixture(&mut s);
    let saved = two_of_three_present(&mut s, &f);
    assert_eq!(saved["stats"]["percentage"].as_f64(), Some(66.67));
    let heads = s.ok("fees.heads.list", json!({ "schoolId": f.school }));
    assert_eq!(heads["currency"], "EUR");
    drop(s);
    let _ = std::fs::remove_dir_all(workspace);

    let (mut s, workspace) = Sidecar::with_workspace_env(
        "campus-attendance-env",
        &[
            ("CAMPUSD_CONFIG", config_base.as_ref()),
            ("CAMPUSD__ATTENDANCE__PERCENT_DECIMALS", "1"),
        ],
    );
    let f = fixture(&mut s);
    let saved = two_of_three_present(&mut s, &f);
    assert_eq!(saved["stats"]["percentage"].as_f64(), Some(66.7));
    drop(s);
    let _ = std::fs::remove_dir_all(workspace);
    let _ = std::fs::remove_dir_all(config_dir);
}

#[test]
fn deleted_classes_and_students_are_off_the_roster() {
    let (mut s, workspace) = Sidecar::with_workspace("campus-attendance-deleted");
    let f = fixture(&mut s);
    s.ok("students.delete", json!({ "schoolId": f.school, "studentId": f.students[3] }));

    let opened = s.ok(
        "attendance.open",
        json!({ "schoolId": f.school, "classId": f.class_id, "date": "2024-05-06" }),
    );
    assert_eq!(opened["students"].as_array().map(|v| v.len()), Some(3));

    let gone = s.request(
        "attendance.save",
        json!({
            "schoolId": f.school,
            "classId": f.class_id,
            "date": "2024-05-06",
            "entries": [{ "studentId": f.students[3], "status": "present" }],
        }),
    );
    assert_eq!(gone["error"]["details"]["field"], "entries");

    let empty = s.create_class(&f.school, "Grade 12", None);
    s.ok("classes.delete", json!({ "schoolId": f.school, "classId": empty }));
    let code = s.fail(
        "attendance.save",
        json!({
            "schoolId": f.school,
            "classId": empty,
            "date": "2024-05-06",
            "entries": [],
        }),
    );
    assert_eq!(code, "not_found");
    drop(s);
    let _ = std::fs::remove_dir_all(workspace);
}
