mod test_support;

use serde_json::json;
use test_support::Sidecar;

#[test]
fn dashboard_and_fee_reports_agree_with_collections() {
    let (mut s, workspace) = Sidecar::with_workspace("campus-reports");
    let school = s.create_school("REP");
    let seven = s.create_class(&school, "Grade 7", None);
    let eight = s.create_class(&school, "Grade 8", None);
    let ann = s.create_student(&school, &seven, "R-1", "Ann", "Bell");
    let bob = s.create_student(&school, &eight, "R-2", "Bob", "Cole");
    s.ok(
        "employees.create",
        json!({
            "schoolId": school,
            "employeeNo": "E-1",
            "firstName": "Tess",
            "lastName": "Moss",
            "designation": "Clerk",
            "basicSalary": 1000,
        }),
    );
    let exam = s.ok(
        "fees.heads.create",
        json!({ "schoolId": school, "name": "Exam", "amount": 300, "frequency": "annual" }),
    )["feeHeadId"]
        .as_str()
        .expect("head id")
        .to_string();

    for (student, method, amount, date) in [
        (&ann, "cash", 300.0, "2024-05-02"),
        (&bob, "bank", 100.0, "2024-05-03"),
    ] {
        s.ok(
            "fees.collect",
            json!({
                "schoolId": school,
                "studentId": student,
                "paidOn": date,
                "method": method,
                "lines": [{ "feeHeadId": exam, "period": "AY2024", "paidAmount": amount }],
            }),
        );
    }

    let dash = s.ok("reports.dashboard", json!({ "schoolId": school, "date": "2024-05-20" }));
    assert_eq!(dash["counts"]["students"], 2);
    assert_eq!(dash["counts"]["employees"], 1);
    assert_eq!(dash["counts"]["classes"], 2);
    assert_eq!(dash["feesCollectedThisMonth"].as_f64(), Some(400.0));
    assert_eq!(dash["attendance"]["total"], 0);
    assert!(dash["unreadMessages"].is_null());

    let collection = s.ok(
        "reports.feesCollection",
        json!({ "schoolId": school, "from": "2024-05-01", "to": "2024-05-31" }),
    );
    assert_eq!(collection["total"].as_f64(), Some(400.0));
    assert_eq!(collection["byHead"][0]["paid"].as_f64(), Some(400.0));
    let methods: Vec<&str> = collection["byMethod"]
        .as_array()
        .expect("byMethod")
        .iter()
        .filter_map(|m| m["method"].as_str())
        .collect();
    assert_eq!(methods, vec!["bank", "cash"]);
    assert_eq!(collection["byDay"].as_array().map(|v| v.len()), Some(2));

    let outstanding = s.ok(
        "reports.feesOutstanding",
        json!({ "schoolId": school, "asOf": "2024-05" }),
    );
    let rows = outstanding["students"].as_array().expect("students");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["studentId"], bob.as_str());
    assert_eq!(rows[0]["totals"]["balance"].as_f64(), Some(200.0));
    assert_eq!(outstanding["totalOutstanding"].as_f64(), Some(200.0));

    let only_seven = s.ok(
        "reports.feesOutstanding",
        json!({ "schoolId": school, "classId": seven, "asOf": "2024-05" }),
    );
    assert_eq!(only_seven["students"].as_array().map(|v| v.len()), Some(0));
    drop(s);
    let _ = std::fs::remove_dir_all(workspace);
}
