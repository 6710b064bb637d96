mod test_support;

use serde_json::json;
use test_support::Sidecar;

#[test]
fn school_codes_are_unique_ignoring_case() {
    let (mut s, workspace) = Sidecar::with_workspace("campus-school-codes");
    let id = s.create_school("NORTH");
    let code = s.fail("schools.create", json!({ "name": "Other", "code": "north" }));
    assert_eq!(code, "conflict");

    let got = s.ok("schools.get", json!({ "schoolId": id }));
    assert_eq!(got["school"]["code"], "NORTH");
    assert_eq!(got["school"]["academicYearStartMonth"], 4);
    assert_eq!(got["school"]["createdBy"], "system");
    assert_eq!(got["school"]["actionType"], "create");

    let bad = s.request(
        "schools.create",
        json!({ "name": "Bad", "code": "BAD", "academicYearStartMonth": 13 }),
    );
    assert_eq!(bad["error"]["code"], "validation_failed");
    assert_eq!(bad["error"]["details"]["field"], "academicYearStartMonth");
    drop(s);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn records_of_one_school_are_invisible_to_another() {
    let (mut s, workspace) = Sidecar::with_workspace("campus-tenancy");
    let a = s.create_school("AAA");
    let b = s.create_school("BBB");
    let class_a = s.create_class(&a, "Grade 1", None);
    let student_a = s.create_student(&a, &class_a, "A-001", "Ada", "Lovelace");

    assert_eq!(
        s.fail("students.get", json!({ "schoolId": b, "studentId": student_a })),
        "not_found"
    );
    assert_eq!(
        s.fail(
            "students.create",
            json!({
                "schoolId": b,
                "classId": class_a,
                "admissionNo": "B-001",
                "firstName": "Bob",
                "lastName": "Smith",
            })
        ),
        "not_found"
    );
    let listed = s.ok("classes.list", json!({ "schoolId": b }));
    assert_eq!(listed["classes"].as_array().map(|v| v.len()), Some(0));

    // A staff member of school A cannot act on school B.
    let admin_a = s.create_user(Some(&a), "admin.a", json!({ "isAdmin": true }));
    let code = s.fail(
        "classes.create",
        json!({ "schoolId": b, "name": "Grade 2", "actorId": admin_a }),
    );
    assert_eq!(code, "forbidden");

    let created = s.ok(
        "classes.create",
        json!({ "schoolId": a, "name": "Grade 2", "actorId": admin_a }),
    );
    assert_eq!(created["class"]["createdBy"], admin_a);
    drop(s);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn soft_deleted_school_drops_out_of_lists() {
    let (mut s, workspace) = Sidecar::with_workspace("campus-school-delete");
    let id = s.create_school("GONE");
    s.create_school("STAY");

    s.ok("schools.delete", json!({ "schoolId": id }));
    let live = s.ok("schools.list", json!({}));
    let codes: Vec<&str> = live["schools"]
        .as_array()
        .expect("schools")
        .iter()
        .filter_map(|v| v["code"].as_str())
        .collect();
    assert_eq!(codes, vec!["STAY"]);

    let all = s.ok("schools.list", json!({ "includeDeleted": true }));
    let gone = all["schools"]
        .as_array()
        .expect("schools")
        .iter()
        .find(|v| v["id"] == id.as_str())
        .cloned()
        .expect("deleted school still stored");
    assert_eq!(gone["delFlag"], true);
    assert_eq!(gone["actionType"], "delete");

    assert_eq!(s.fail("schools.get", json!({ "schoolId": id })), "not_found");
    assert_eq!(s.fail("classes.list", json!({ "schoolId": id })), "not_found");
    assert_eq!(s.fail("schools.delete", json!({ "schoolId": id })), "not_found");

    // The code of a deleted school is free again.
    s.create_school("GONE");
    drop(s);
    let _ = std::fs::remove_dir_all(workspace);
}
