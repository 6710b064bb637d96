mod test_support;

use serde_json::{json, Value};
use test_support::Sidecar;

struct Fixture {
    school: String,
    student: String,
    tuition: String,
    admission: String,
    account: String,
}

fn fixture(s: &mut Sidecar) -> Fixture {
    let school = s.create_school("FEE");
    let class_id = s.create_class(&school, "Grade 8", None);
    let student = s.create_student(&school, &class_id, "F-1", "Noor", "Ali");
    let tuition = s.ok(
        "fees.heads.create",
        json!({
            "schoolId": school,
            "classId": class_id,
            "name": "Tuition",
            "amount": 1000,
            "frequency": "monthly",
        }),
    )["feeHeadId"]
        .as_str()
        .expect("head id")
        .to_string();
    let admission = s.ok(
        "fees.heads.create",
        json!({ "schoolId": school, "name": "Admission", "amount": 500, "frequency": "one_time" }),
    )["feeHeadId"]
        .as_str()
        .expect("head id")
        .to_string();
    let account = s.ok(
        "accounts.create",
        json!({ "schoolId": school, "name": "Cash Box", "kind": "asset" }),
    )["accountId"]
        .as_str()
        .expect("account id")
        .to_string();
    Fixture {
        school,
        student,
        tuition,
        admission,
        account,
    }
}

fn due(s: &mut Sidecar, f: &Fixture) -> Value {
    s.ok(
        "fees.due",
        json!({ "schoolId": f.school, "studentId": f.student, "asOf": "2024-05" }),
    )
}

fn line<'a>(due: &'a Value, head: &str, period: &str) -> &'a Value {
    due["lines"]
        .as_array()
        .expect("lines")
        .iter()
        .find(|l| l["feeHeadId"] == head && l["period"] == period)
        .expect("due line")
}

fn account_balance(s: &mut Sidecar, f: &Fixture) -> f64 {
    let res = s.ok("accounts.list", json!({ "schoolId": f.school }));
    res["accounts"][0]["balance"].as_f64().expect("balance")
}

#[test]
fn dues_cover_every_elapsed_period() {
    let (mut s, workspace) = Sidecar::with_workspace("campus-fees-due");
    let f = fixture(&mut s);
    let d = due(&mut s, &f);
    // Academic year starts in April: April and May tuition plus the one-time fee.
    assert_eq!(d["lines"].as_array().map(|v| v.len()), Some(3));
    assert_eq!(d["totals"]["amount"].as_f64(), Some(2500.0));
    assert_eq!(d["totals"]["balance"].as_f64(), Some(2500.0));
    assert_eq!(line(&d, &f.admission, "ONCE")["balance"].as_f64(), Some(500.0));
    assert_eq!(d["currency"], "INR");
    drop(s);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn collection_never_exceeds_the_fee() {
    let (mut s, workspace) = Sidecar::with_workspace("campus-fees-collect");
    let f = fixture(&mut s);

    let paid = s.ok(
        "fees.collect",
        json!({
            "schoolId": f.school,
            "studentId": f.student,
            "paidOn": "2024-05-10",
            "method": "cash",
            "accountId": f.account,
            "lines": [{ "feeHeadId": f.tuition, "period": "2024-04", "paidAmount": 600, "discount": 100 }],
        }),
    );
    assert_eq!(paid["receiptNo"], "R2024-00001");
    assert_eq!(paid["payment"]["total"].as_f64(), Some(600.0));
    assert_eq!(account_balance(&mut s, &f), 600.0);

    let d = due(&mut s, &f);
    let april = line(&d, &f.tuition, "2024-04");
    assert_eq!(april["paid"].as_f64(), Some(600.0));
    assert_eq!(april["discount"].as_f64(), Some(100.0));
    assert_eq!(april["balance"].as_f64(), Some(300.0));

    let over = s.request(
        "fees.collect",
        json!({
            "schoolId": f.school,
            "studentId": f.student,
            "paidOn": "2024-05-11",
            "method": "cash",
            "lines": [{ "feeHeadId": f.tuition, "period": "2024-04", "paidAmount": 301 }],
        }),
    );
    assert_eq!(over["error"]["code"], "validation_failed");
    assert_eq!(over["error"]["details"]["field"], "lines");

    // Two lines for the same period are checked together.
    let split = s.request(
        "fees.collect",
        json!({
            "schoolId": f.school,
            "studentId": f.student,
            "paidOn": "2024-05-11",
            "method": "cash",
            "lines": [
                { "feeHeadId": f.tuition, "period": "2024-04", "paidAmount": 200 },
                { "feeHeadId": f.tuition, "period": "2024-04", "paidAmount": 200 },
            ],
        }),
    );
    assert_eq!(split["error"]["code"], "validation_failed");

    let wrong_period = s.request(
        "fees.collect",
        json!({
            "schoolId": f.school,
            "studentId": f.student,
            "paidOn": "2024-05-11",
            "method": "cash",
            "lines": [{ "feeHeadId": f.admission, "period": "2024-04", "paidAmount": 100 }],
        }),
    );
    assert_eq!(wrong_period["error"]["details"]["field"], "period");

    let bad_method = s.request(
        "fees.collect",
        json!({
            "schoolId": f.school,
            "studentId": f.student,
            "paidOn": "2024-05-11",
            "method": "barter",
            "lines": [{ "feeHeadId": f.admission, "period": "ONCE", "paidAmount": 100 }],
        }),
    );
    assert_eq!(bad_method["error"]["details"]["field"], "method");

    let exact = s.ok(
        "fees.collect",
        json!({
            "schoolId": f.school,
            "studentId": f.student,
            "paidOn": "2024-05-12",
            "method": "bank",
            "lines": [
                { "feeHeadId": f.tuition, "period": "2024-04", "paidAmount": 300 },
                { "feeHeadId": f.admission, "period": "once", "paidAmount": 500 },
            ],
        }),
    );
    assert_eq!(exact["receiptNo"], "R2024-00002");

    let d = due(&mut s, &f);
    assert_eq!(line(&d, &f.tuition, "2024-04")["balance"].as_f64(), Some(0.0));
    assert_eq!(d["totals"]["balance"].as_f64(), Some(1000.0));

    let list = s.ok(
        "fees.payments.list",
        json!({ "schoolId": f.school, "studentId": f.student }),
    );
    assert_eq!(list["payments"].as_array().map(|v| v.len()), Some(2));
    assert_eq!(list["total"].as_f64(), Some(1400.0));
    drop(s);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn voiding_restores_dues_and_reverses_the_ledger() {
    let (mut s, workspace) = Sidecar::with_workspace("campus-fees-void");
    let f = fixture(&mut s);
    let paid = s.ok(
        "fees.collect",
        json!({
            "schoolId": f.school,
            "studentId": f.student,
            "paidOn": "2024-05-10",
            "method": "cash",
            "accountId": f.account,
            "lines": [{ "feeHeadId": f.admission, "period": "ONCE", "paidAmount": 500 }],
        }),
    );
    let payment_id = paid["paymentId"].as_str().expect("payment id").to_string();
    assert_eq!(account_balance(&mut s, &f), 500.0);

    let voided = s.ok("fees.payments.void", json!({ "paymentId": payment_id }));
    assert_eq!(voided["reversedEntries"], 1);
    assert_eq!(voided["payment"]["delFlag"], true);
    assert_eq!(account_balance(&mut s, &f), 0.0);
    assert_eq!(
        s.fail("fees.payments.void", json!({ "schoolId": f.school, "paymentId": payment_id })),
        "not_found"
    );

    let d = due(&mut s, &f);
    assert_eq!(line(&d, &f.admission, "ONCE")["balance"].as_f64(), Some(500.0));

    let live = s.ok("fees.payments.list", json!({ "schoolId": f.school }));
    assert_eq!(live["payments"].as_array().map(|v| v.len()), Some(0));
    let all = s.ok(
        "fees.payments.list",
        json!({ "schoolId": f.school, "includeDeleted": true }),
    );
    assert_eq!(all["payments"].as_array().map(|v| v.len()), Some(1));

    // Receipt numbers are never reused.
    let again = s.ok(
        "fees.collect",
        json!({
            "schoolId": f.school,
            "studentId": f.student,
            "paidOn": "2024-05-13",
            "method": "cash",
            "lines": [{ "feeHeadId": f.admission, "period": "ONCE", "paidAmount": 500 }],
        }),
    );
    assert_eq!(again["receiptNo"], "R2024-00002");
    drop(s);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn head_changes_cannot_undercut_settled_periods() {
    let (mut s, workspace) = Sidecar::with_workspace("campus-fees-head-update");
    let f = fixture(&mut s);
    s.ok(
        "fees.collect",
        json!({
            "schoolId": f.school,
            "studentId": f.student,
            "paidOn": "2024-05-10",
            "method": "cash",
            "lines": [{ "feeHeadId": f.admission, "period": "ONCE", "paidAmount": 400 }],
        }),
    );

    let lowered = s.request(
        "fees.heads.update",
        json!({ "schoolId": f.school, "feeHeadId": f.admission, "patch": { "amount": 100 } }),
    );
    assert_eq!(lowered["error"]["code"], "validation_failed");
    assert_eq!(lowered["error"]["details"]["field"], "amount");

    let refreq = s.request(
        "fees.heads.update",
        json!({ "schoolId": f.school, "feeHeadId": f.admission, "patch": { "frequency": "annual" } }),
    );
    assert_eq!(refreq["error"]["details"]["field"], "frequency");

    let elsewhere = s.create_class(&f.school, "Grade 9", None);
    let narrowed = s.request(
        "fees.heads.update",
        json!({ "schoolId": f.school, "feeHeadId": f.admission, "patch": { "classId": elsewhere } }),
    );
    assert_eq!(narrowed["error"]["details"]["field"], "classId");

    let updated = s.ok(
        "fees.heads.update",
        json!({
            "schoolId": f.school,
            "feeHeadId": f.admission,
            "patch": { "amount": 450, "name": "Admission fee" },
        }),
    );
    assert_eq!(updated["feeHead"]["amount"].as_f64(), Some(450.0));
    assert_eq!(updated["feeHead"]["name"], "Admission fee");
    let d = due(&mut s, &f);
    assert_eq!(line(&d, &f.admission, "ONCE")["balance"].as_f64(), Some(50.0));

    // Tuition has no payments yet, so its schedule may still change.
    s.ok(
        "fees.heads.update",
        json!({ "schoolId": f.school, "feeHeadId": f.tuition, "patch": { "frequency": "annual" } }),
    );
    drop(s);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn deleted_students_cannot_be_billed() {
    let (mut s, workspace) = Sidecar::with_workspace("campus-fees-deleted");
    let f = fixture(&mut s);
    s.ok("students.delete", json!({ "schoolId": f.school, "studentId": f.student }));
    let code = s.fail(
        "fees.collect",
        json!({
            "schoolId": f.school,
            "studentId": f.student,
            "paidOn": "2024-05-10",
            "method": "cash",
            "lines": [{ "feeHeadId": f.admission, "period": "ONCE", "paidAmount": 100 }],
        }),
    );
    assert_eq!(code, "not_found");
    assert_eq!(
        s.fail("fees.due", json!({ "schoolId": f.school, "studentId": f.student, "asOf": "2024-05" })),
        "not_found"
    );
    drop(s);
    let _ = std::fs::remove_dir_all(workspace);
}
