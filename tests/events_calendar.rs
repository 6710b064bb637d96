mod test_support;

use serde_json::{json, Value};
use test_support::Sidecar;

fn cell<'a>(view: &'a Value, date: &str) -> &'a Value {
    view["weeks"]
        .as_array()
        .expect("weeks")
        .iter()
        .flat_map(|w| w.as_array().expect("week").iter())
        .find(|c| c["date"] == date)
        .expect("grid cell")
}

#[test]
fn month_view_is_a_sunday_first_grid() {
    let (mut s, workspace) = Sidecar::with_workspace("campus-calendar-grid");
    let school = s.create_school("CAL");
    let trip = s.ok(
        "events.create",
        json!({
            "schoolId": school,
            "title": "Field trip",
            "startsAt": "2024-02-28",
            "endsAt": "2024-03-01",
            "category": "trip",
        }),
    );
    let trip_id = trip["eventId"].as_str().expect("event id").to_string();
    assert_eq!(trip["event"]["allDay"], true);
    assert_eq!(trip["event"]["startsAt"], "2024-02-28T00:00:00");

    let meeting = s.ok(
        "events.create",
        json!({ "schoolId": school, "title": "PTA", "startsAt": "2024-02-05T18:30" }),
    );
    assert_eq!(meeting["event"]["allDay"], false);
    assert_eq!(meeting["event"]["endsAt"], "2024-02-05T18:30:00");

    s.ok(
        "events.create",
        json!({ "schoolId": school, "title": "Spring break", "startsAt": "2024-04-01" }),
    );

    let feb = s.ok(
        "events.list",
        json!({ "schoolId": school, "view": "month", "date": "2024-02-14" }),
    );
    assert_eq!(feb["from"], "2024-02-01");
    assert_eq!(feb["to"], "2024-02-29");
    assert_eq!(feb["events"].as_array().map(|v| v.len()), Some(2));

    let weeks = feb["weeks"].as_array().expect("weeks");
    assert_eq!(weeks.len(), 5);
    assert_eq!(weeks[0][0]["date"], "2024-01-28");
    assert_eq!(weeks[0][0]["inMonth"], false);
    assert_eq!(weeks[4][6]["date"], "2024-03-02");

    assert_eq!(cell(&feb, "2024-02-29")["eventIds"], json!([trip_id]));
    assert_eq!(cell(&feb, "2024-03-01")["eventIds"], json!([trip_id]));
    assert_eq!(cell(&feb, "2024-03-02")["eventIds"], json!([]));

    let week = s.ok(
        "events.list",
        json!({ "schoolId": school, "view": "week", "date": "2024-03-01" }),
    );
    assert_eq!(week["from"], "2024-02-25");
    assert_eq!(week["to"], "2024-03-02");
    assert!(week.get("weeks").is_none());
    assert_eq!(week["events"][0]["id"], trip_id.as_str());
    drop(s);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn event_times_must_be_ordered() {
    let (mut s, workspace) = Sidecar::with_workspace("campus-calendar-order");
    let school = s.create_school("CLO");
    let backwards = s.request(
        "events.create",
        json!({ "schoolId": school, "title": "Oops", "startsAt": "2024-05-02", "endsAt": "2024-05-01" }),
    );
    assert_eq!(backwards["error"]["details"]["field"], "endsAt");

    let event_id = s.ok(
        "events.create",
        json!({ "schoolId": school, "title": "Exam", "startsAt": "2024-05-10T09:00", "endsAt": "2024-05-10T12:00" }),
    )["eventId"]
        .as_str()
        .expect("event id")
        .to_string();

    let moved = s.request(
        "events.update",
        json!({ "schoolId": school, "eventId": event_id, "patch": { "startsAt": "2024-05-10T13:00" } }),
    );
    assert_eq!(moved["error"]["code"], "validation_failed");

    let updated = s.ok(
        "events.update",
        json!({ "schoolId": school, "eventId": event_id, "patch": { "endsAt": "2024-05-11T12:00", "title": "Long exam" } }),
    );
    assert_eq!(updated["event"]["endsAt"], "2024-05-11T12:00:00");
    assert_eq!(updated["event"]["title"], "Long exam");

    let bad_view = s.request(
        "events.list",
        json!({ "schoolId": school, "view": "decade", "date": "2024-05-10" }),
    );
    assert_eq!(bad_view["error"]["details"]["field"], "view");

    s.ok("events.delete", json!({ "schoolId": school, "eventId": event_id }));
    let day = s.ok(
        "events.list",
        json!({ "schoolId": school, "view": "day", "date": "2024-05-10" }),
    );
    assert_eq!(day["events"].as_array().map(|v| v.len()), Some(0));
    drop(s);
    let _ = std::fs::remove_dir_all(workspace);
}
