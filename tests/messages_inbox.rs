mod test_support;

use serde_json::{json, Value};
use test_support::Sidecar;

fn subjects(inbox: &Value) -> Vec<String> {
    let mut out: Vec<String> = inbox["messages"]
        .as_array()
        .expect("messages")
        .iter()
        .filter_map(|m| m["subject"].as_str().map(str::to_string))
        .collect();
    out.sort();
    out
}

#[test]
fn inbox_resolves_every_audience_kind() {
    let (mut s, workspace) = Sidecar::with_workspace("campus-inbox");
    let school = s.create_school("MSG");
    let class_id = s.create_class(&school, "Grade 9", None);
    let pupil = s.create_student(&school, &class_id, "M-1", "Pia", "Lund");

    let admin = s.create_user(Some(&school), "admin", json!({ "isAdmin": true }));
    let teacher = s.create_user(Some(&school), "teacher", json!({ "isTeacher": true }));
    let parent = s.create_user(Some(&school), "parent", json!({ "isParent": true }));
    let student_user = s.ok(
        "users.create",
        json!({
            "schoolId": school,
            "username": "pia",
            "password": "secret123",
            "displayName": "Pia Lund",
            "roles": { "isStudent": true },
            "studentId": pupil,
        }),
    )["userId"]
        .as_str()
        .expect("user id")
        .to_string();

    for (audience, audience_ref, subject) in [
        ("all", None, "everyone"),
        ("role", Some("teacher"), "staff"),
        ("class", Some(class_id.as_str()), "grade nine"),
        ("user", Some(parent.as_str()), "direct"),
    ] {
        s.ok(
            "messages.send",
            json!({
                "schoolId": school,
                "senderId": admin,
                "audience": audience,
                "audienceRef": audience_ref,
                "subject": subject,
                "body": "hello",
            }),
        );
    }

    let inbox = s.ok("messages.inbox", json!({ "schoolId": school, "userId": teacher }));
    assert_eq!(subjects(&inbox), vec!["everyone", "staff"]);
    assert_eq!(inbox["unread"], 2);
    assert_eq!(inbox["messages"][0]["senderName"], "admin");

    let inbox = s.ok("messages.inbox", json!({ "schoolId": school, "userId": student_user }));
    assert_eq!(subjects(&inbox), vec!["everyone", "grade nine"]);

    let inbox = s.ok("messages.inbox", json!({ "schoolId": school, "userId": parent }));
    assert_eq!(subjects(&inbox), vec!["direct", "everyone"]);

    let inbox = s.ok("messages.inbox", json!({ "schoolId": school, "userId": admin }));
    assert_eq!(subjects(&inbox), vec!["everyone"]);
    drop(s);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn reading_and_deleting_update_the_inbox() {
    let (mut s, workspace) = Sidecar::with_workspace("campus-inbox-read");
    let school = s.create_school("MSR");
    let other = s.create_school("OTH");
    let other_class = s.create_class(&other, "Elsewhere", None);
    let admin = s.create_user(Some(&school), "admin", json!({ "isAdmin": true }));
    let teacher = s.create_user(Some(&school), "teacher", json!({ "isTeacher": true }));

    let first = s.ok(
        "messages.send",
        json!({ "schoolId": school, "senderId": admin, "audience": "all", "subject": "one", "body": "x" }),
    )["messageId"]
        .as_str()
        .expect("message id")
        .to_string();
    s.ok(
        "messages.send",
        json!({ "schoolId": school, "senderId": admin, "audience": "all", "subject": "two", "body": "y" }),
    );

    s.ok(
        "messages.markRead",
        json!({ "messageId": first, "userId": teacher }),
    );
    // Marking twice is harmless.
    s.ok(
        "messages.markRead",
        json!({ "schoolId": school, "messageId": first, "userId": teacher }),
    );
    let inbox = s.ok("messages.inbox", json!({ "schoolId": school, "userId": teacher }));
    assert_eq!(inbox["unread"], 1);

    let dash = s.ok("reports.dashboard", json!({ "schoolId": school, "userId": teacher }));
    assert_eq!(dash["unreadMessages"], 1);

    assert_eq!(
        s.fail("messages.delete", json!({ "schoolId": other, "messageId": first })),
        "not_found"
    );
    s.ok("messages.delete", json!({ "messageId": first }));
    let inbox = s.ok("messages.inbox", json!({ "schoolId": school, "userId": teacher }));
    assert_eq!(subjects(&inbox), vec!["two"]);

    let bad_role = s.request(
        "messages.send",
        json!({
            "schoolId": school,
            "senderId": admin,
            "audience": "role",
            "audienceRef": "janitor",
            "subject": "s",
            "body": "b",
        }),
    );
    assert_eq!(bad_role["error"]["details"]["field"], "audienceRef");

    let foreign_class = s.fail(
        "messages.send",
        json!({
            "schoolId": school,
            "senderId": admin,
            "audience": "class",
            "audienceRef": other_class,
            "subject": "s",
            "body": "b",
        }),
    );
    assert_eq!(foreign_class, "not_found");
    drop(s);
    let _ = std::fs::remove_dir_all(workspace);
}
