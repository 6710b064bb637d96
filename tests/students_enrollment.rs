mod test_support;

use serde_json::json;
use test_support::Sidecar;

#[test]
fn class_capacity_caps_enrollment() {
    let (mut s, workspace) = Sidecar::with_workspace("campus-capacity");
    let school = s.create_school("CAP");
    let class_id = s.create_class(&school, "Grade 3", Some(2));
    s.create_student(&school, &class_id, "C-1", "Amy", "Ng");
    s.create_student(&school, &class_id, "C-2", "Ben", "Ortiz");

    let full = s.request(
        "students.create",
        json!({
            "schoolId": school,
            "classId": class_id,
            "admissionNo": "C-3",
            "firstName": "Cal",
            "lastName": "Park",
        }),
    );
    assert_eq!(full["error"]["code"], "validation_failed");

    let dup = s.fail(
        "students.create",
        json!({
            "schoolId": school,
            "classId": class_id,
            "admissionNo": "c-1",
            "firstName": "Dup",
            "lastName": "Entry",
        }),
    );
    assert_eq!(dup, "conflict");

    let shrink = s.request(
        "classes.update",
        json!({ "schoolId": school, "classId": class_id, "patch": { "capacity": 1 } }),
    );
    assert_eq!(shrink["error"]["details"]["field"], "capacity");

    let listed = s.ok("classes.list", json!({ "schoolId": school }));
    assert_eq!(listed["classes"][0]["studentCount"], 2);
    assert_eq!(
        s.fail("classes.delete", json!({ "schoolId": school, "classId": class_id })),
        "conflict"
    );
    drop(s);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn students_list_is_filtered_and_named() {
    let (mut s, workspace) = Sidecar::with_workspace("campus-students-list");
    let school = s.create_school("LST");
    let one = s.create_class(&school, "Grade 1", None);
    let two = s.create_class(&school, "Grade 2", None);
    let ada = s.create_student(&school, &one, "L-1", "Ada", "Lovelace");
    s.create_student(&school, &two, "L-2", "Alan", "Turing");

    let res = s.ok("students.list", json!({ "schoolId": school, "classId": one }));
    let students = res["students"].as_array().expect("students");
    assert_eq!(students.len(), 1);
    assert_eq!(students[0]["displayName"], "Lovelace, Ada");
    assert_eq!(students[0]["className"], "Grade 1 A");

    let res = s.ok("students.list", json!({ "schoolId": school, "search": "tur" }));
    assert_eq!(res["students"].as_array().map(|v| v.len()), Some(1));

    let bad = s.request(
        "students.update",
        json!({ "schoolId": school, "studentId": ada, "patch": { "gender": "robot" } }),
    );
    assert_eq!(bad["error"]["details"]["field"], "gender");

    let upd = s.ok(
        "students.update",
        json!({ "schoolId": school, "studentId": ada, "patch": { "guardianName": "Lord Byron" } }),
    );
    assert_eq!(upd["student"]["guardianName"], "Lord Byron");
    assert_eq!(upd["student"]["modFlag"], true);
    assert_eq!(upd["student"]["actionType"], "update");

    s.ok("students.delete", json!({ "schoolId": school, "studentId": ada }));
    let res = s.ok("students.list", json!({ "schoolId": school, "classId": one }));
    assert_eq!(res["students"].as_array().map(|v| v.len()), Some(0));
    let res = s.ok(
        "students.list",
        json!({ "schoolId": school, "classId": one, "includeDeleted": true }),
    );
    assert_eq!(res["students"][0]["delFlag"], true);
    drop(s);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn promotion_moves_selected_students_and_clears_roll_numbers() {
    let (mut s, workspace) = Sidecar::with_workspace("campus-promote");
    let school = s.create_school("PRM");
    let from = s.create_class(&school, "Grade 4", None);
    let to = s.create_class(&school, "Grade 5", Some(2));
    let res = s.ok(
        "students.create",
        json!({
            "schoolId": school,
            "classId": from,
            "admissionNo": "P-1",
            "firstName": "Mia",
            "lastName": "Chen",
            "rollNo": 7,
        }),
    );
    let mia = res["studentId"].as_str().expect("id").to_string();
    let leo = s.create_student(&school, &from, "P-2", "Leo", "Diaz");
    let kai = s.create_student(&school, &from, "P-3", "Kai", "Ito");

    // All three would overflow the target class.
    let over = s.request(
        "students.promote",
        json!({ "schoolId": school, "fromClassId": from, "toClassId": to }),
    );
    assert_eq!(over["error"]["code"], "validation_failed");

    let moved = s.ok(
        "students.promote",
        json!({
            "schoolId": school,
            "fromClassId": from,
            "toClassId": to,
            "studentIds": [mia, leo, mia],
        }),
    );
    // A repeated id fills one seat and is reported once.
    assert_eq!(moved["moved"], 2);
    assert_eq!(moved["studentIds"], json!([mia, leo]));

    let got = s.ok("students.get", json!({ "schoolId": school, "studentId": mia }));
    assert_eq!(got["student"]["classId"], to.as_str());
    assert!(got["student"]["rollNo"].is_null());

    let left = s.ok("students.list", json!({ "schoolId": school, "classId": from }));
    let ids: Vec<&str> = left["students"]
        .as_array()
        .expect("students")
        .iter()
        .filter_map(|v| v["id"].as_str())
        .collect();
    assert_eq!(ids, vec![kai.as_str()]);

    let stranger = s.request(
        "students.promote",
        json!({
            "schoolId": school,
            "fromClassId": from,
            "toClassId": to,
            "studentIds": [mia],
        }),
    );
    assert_eq!(stranger["error"]["details"]["field"], "studentIds");
    drop(s);
    let _ = std::fs::remove_dir_all(workspace);
}
