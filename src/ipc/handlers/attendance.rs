use crate::calc::{self, AttendanceStatus, AttendanceTally};
use crate::ipc::error::ActionError;
use crate::ipc::helpers::{
    actor_id, dispatch, ensure_in_school, new_id, now, required_date, required_str, school_ref,
    today, Action, Ctx,
};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use std::collections::HashMap;

#[derive(Debug, Clone)]
struct RosterStudent {
    id: String,
    display_name: String,
    roll_no: Option<i64>,
}

fn fmt_date(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

fn roster(conn: &Connection, class_id: &str) -> Result<Vec<RosterStudent>, ActionError> {
    let mut stmt = conn.prepare(
        "SELECT id, last_name, first_name, roll_no
         FROM students
         WHERE class_id = ? AND del_flag = 0 AND active = 1
         ORDER BY roll_no IS NULL, roll_no, last_name, first_name",
    )?;
    let rows = stmt.query_map([class_id], |r| {
        let last: String = r.get(1)?;
        let first: String = r.get(2)?;
        Ok(RosterStudent {
            id: r.get(0)?,
            display_name: format!("{}, {}", last, first),
            roll_no: r.get(3)?,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

fn find_sheet(conn: &Connection, class_id: &str, date: &str) -> Result<Option<String>, ActionError> {
    Ok(conn
        .query_row(
            "SELECT id FROM attendance WHERE class_id = ? AND date = ? AND del_flag = 0",
            (class_id, date),
            |r| r.get(0),
        )
        .optional()?)
}

fn sheet_entries(
    conn: &Connection,
    attendance_id: &str,
) -> Result<HashMap<String, (String, Option<String>)>, ActionError> {
    let mut stmt = conn.prepare(
        "SELECT student_id, status, remark FROM attendance_entries WHERE attendance_id = ?",
    )?;
    let rows = stmt.query_map([attendance_id], |r| {
        Ok((r.get::<_, String>(0)?, (r.get::<_, String>(1)?, r.get::<_, Option<String>>(2)?)))
    })?;
    Ok(rows.collect::<Result<HashMap<_, _>, _>>()?)
}

fn class_and_date(ctx: &Ctx, params: &Value) -> Result<(String, String, NaiveDate), ActionError> {
    let school = school_ref(ctx.conn, params)?;
    let class_id = required_str(params, "classId")?;
    ensure_in_school(ctx.conn, "classes", "class", &class_id, &school.id)?;
    let date = required_date(params, "date")?;
    Ok((school.id, class_id, date))
}

fn sheet_view(ctx: &Ctx, class_id: &str, date: NaiveDate) -> Result<Value, ActionError> {
    let day = fmt_date(date);
    let students = roster(ctx.conn, class_id)?;
    let sheet_id = find_sheet(ctx.conn, class_id, &day)?;
    let entries = match &sheet_id {
        Some(id) => sheet_entries(ctx.conn, id)?,
        None => HashMap::new(),
    };

    let mut tally = AttendanceTally::default();
    let mut rows = Vec::with_capacity(students.len());
    for s in &students {
        let entry = entries.get(&s.id);
        if let Some(status) = entry.and_then(|(st, _)| AttendanceStatus::parse(st)) {
            tally.add(status);
        }
        rows.push(json!({
            "studentId": s.id,
            "displayName": s.display_name,
            "rollNo": s.roll_no,
            "status": entry.map(|(st, _)| st.clone()),
            "remark": entry.and_then(|(_, rm)| rm.clone()),
        }));
    }
    let stats = tally.finish(ctx.settings.attendance.percent_decimals);
    Ok(json!({
        "attendanceId": sheet_id,
        "classId": class_id,
        "date": day,
        "students": rows,
        "stats": stats,
    }))
}

fn refuse_future(date: NaiveDate) -> Result<(), ActionError> {
    if date > today() {
        return Err(ActionError::invalid("date", "attendance cannot be taken for a future date"));
    }
    Ok(())
}

/// Returns the sheet id for (class, date), creating the sheet when missing.
fn upsert_sheet(
    conn: &Connection,
    school_id: &str,
    class_id: &str,
    date: &str,
    actor: &str,
) -> Result<String, ActionError> {
    let ts = now();
    if let Some(id) = find_sheet(conn, class_id, date)? {
        conn.execute(
            "UPDATE attendance
             SET mod_flag = 1, action_type = 'update', modified_by = ?, updated_at = ?
             WHERE id = ?",
            (actor, &ts, &id),
        )?;
        return Ok(id);
    }
    let id = new_id();
    conn.execute(
        "INSERT INTO attendance(id, school_id, class_id, date, created_by, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (&id, school_id, class_id, date, actor, &ts, &ts),
    )?;
    Ok(id)
}

fn put_entry(
    conn: &Connection,
    attendance_id: &str,
    student_id: &str,
    status: AttendanceStatus,
    remark: Option<&str>,
) -> Result<(), ActionError> {
    conn.execute(
        "INSERT INTO attendance_entries(attendance_id, student_id, status, remark)
         VALUES(?, ?, ?, ?)
         ON CONFLICT(attendance_id, student_id) DO UPDATE SET
           status = excluded.status,
           remark = excluded.remark",
        (attendance_id, student_id, status.as_str(), remark),
    )?;
    Ok(())
}

fn parse_status(raw: &str, field: &str) -> Result<AttendanceStatus, ActionError> {
    AttendanceStatus::parse(raw).ok_or_else(|| {
        ActionError::invalid(field, "status must be one of: present, absent, late, leave")
    })
}

fn attendance_open(ctx: &Ctx, params: &Value) -> Result<Value, ActionError> {
    let (_, class_id, date) = class_and_date(ctx, params)?;
    sheet_view(ctx, &class_id, date)
}

fn attendance_save(ctx: &Ctx, params: &Value) -> Result<Value, ActionError> {
    let (school_id, class_id, date) = class_and_date(ctx, params)?;
    let actor = actor_id(ctx.conn, params, Some(&school_id))?;
    refuse_future(date)?;
    let Some(entries) = params.get("entries").and_then(|v| v.as_array()) else {
        return Err(ActionError::bad_params("missing entries"));
    };

    let members: Vec<String> = roster(ctx.conn, &class_id)?.into_iter().map(|s| s.id).collect();
    let mut parsed: Vec<(String, Option<AttendanceStatus>, Option<String>)> = Vec::new();
    for (i, e) in entries.iter().enumerate() {
        let student_id = required_str(e, "studentId")
            .map_err(|_| ActionError::bad_params(format!("entries[{i}].studentId missing")))?;
        if !members.contains(&student_id) {
            return Err(ActionError::invalid(
                "entries",
                format!("student {student_id} is not an active member of this class"),
            ));
        }
        let status = match e.get("status") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(parse_status(s, "entries")?),
            Some(_) => return Err(ActionError::bad_params(format!("entries[{i}].status must be a string"))),
        };
        let remark = e
            .get("remark")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        parsed.push((student_id, status, remark));
    }

    let day = fmt_date(date);
    let tx = ctx.conn.unchecked_transaction()?;
    let sheet_id = upsert_sheet(&tx, &school_id, &class_id, &day, &actor)?;
    for (student_id, status, remark) in &parsed {
        match status {
            Some(s) => put_entry(&tx, &sheet_id, student_id, *s, remark.as_deref())?,
            None => {
                tx.execute(
                    "DELETE FROM attendance_entries WHERE attendance_id = ? AND student_id = ?",
                    (&sheet_id, student_id),
                )?;
            }
        }
    }
    tx.commit()?;
    tracing::info!(attendance_id = %sheet_id, %school_id, %class_id, date = %day, entries = parsed.len(), "attendance saved");
    sheet_view(ctx, &class_id, date)
}

fn attendance_mark_all(ctx: &Ctx, params: &Value) -> Result<Value, ActionError> {
    let (school_id, class_id, date) = class_and_date(ctx, params)?;
    let actor = actor_id(ctx.conn, params, Some(&school_id))?;
    refuse_future(date)?;
    let status = parse_status(&required_str(params, "status")?, "status")?;

    let day = fmt_date(date);
    let students = roster(ctx.conn, &class_id)?;
    let tx = ctx.conn.unchecked_transaction()?;
    let sheet_id = upsert_sheet(&tx, &school_id, &class_id, &day, &actor)?;
    for s in &students {
        put_entry(&tx, &sheet_id, &s.id, status, None)?;
    }
    tx.commit()?;
    tracing::info!(attendance_id = %sheet_id, %school_id, %class_id, date = %day, status = status.as_str(), "attendance marked for class");
    sheet_view(ctx, &class_id, date)
}

/// Per-student tallies for a class over an inclusive date range.
pub fn range_stats(
    ctx: &Ctx,
    class_id: &str,
    from: NaiveDate,
    to: NaiveDate,
) -> Result<Value, ActionError> {
    let decimals = ctx.settings.attendance.percent_decimals;
    let students = roster(ctx.conn, class_id)?;
    let mut per_student: HashMap<String, AttendanceTally> = HashMap::new();
    let days: i64 = ctx.conn.query_row(
        "SELECT COUNT(*) FROM attendance
         WHERE class_id = ? AND del_flag = 0 AND date >= ? AND date <= ?",
        (class_id, fmt_date(from), fmt_date(to)),
        |r| r.get(0),
    )?;
    let mut stmt = ctx.conn.prepare(
        "SELECT e.student_id, e.status
         FROM attendance_entries e
         JOIN attendance a ON a.id = e.attendance_id
         WHERE a.class_id = ? AND a.del_flag = 0 AND a.date >= ? AND a.date <= ?",
    )?;
    let rows = stmt.query_map((class_id, fmt_date(from), fmt_date(to)), |r| {
        Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
    })?;
    for row in rows {
        let (student_id, status) = row?;
        if let Some(s) = AttendanceStatus::parse(&status) {
            per_student.entry(student_id).or_default().add(s);
        }
    }

    let mut class_total = AttendanceTally::default();
    let mut rows = Vec::with_capacity(students.len());
    for s in &students {
        let t = per_student.remove(&s.id).unwrap_or_default();
        class_total.merge(&t);
        rows.push(json!({
            "studentId": s.id,
            "displayName": s.display_name,
            "rollNo": s.roll_no,
            "stats": t.finish(decimals),
        }));
    }
    Ok(json!({
        "classId": class_id,
        "from": fmt_date(from),
        "to": fmt_date(to),
        "daysRecorded": days,
        "students": rows,
        "classStats": class_total.finish(decimals),
    }))
}

fn attendance_stats(ctx: &Ctx, params: &Value) -> Result<Value, ActionError> {
    let school = school_ref(ctx.conn, params)?;
    let class_id = required_str(params, "classId")?;
    ensure_in_school(ctx.conn, "classes", "class", &class_id, &school.id)?;
    let from = required_date(params, "from")?;
    let to = required_date(params, "to")?;
    if to < from {
        return Err(ActionError::invalid("to", "to must not be before from"));
    }
    range_stats(ctx, &class_id, from, to)
}

/// Attendance percentage across every sheet of a school on one day.
pub fn school_day_percentage(ctx: &Ctx, school_id: &str, date: NaiveDate) -> Result<Value, ActionError> {
    let mut stmt = ctx.conn.prepare(
        "SELECT e.status
         FROM attendance_entries e
         JOIN attendance a ON a.id = e.attendance_id
         WHERE a.school_id = ? AND a.date = ? AND a.del_flag = 0",
    )?;
    let rows = stmt.query_map((school_id, fmt_date(date)), |r| r.get::<_, String>(0))?;
    let mut statuses = Vec::new();
    for r in rows {
        if let Some(s) = AttendanceStatus::parse(&r?) {
            statuses.push(s);
        }
    }
    let tally = calc::tally_attendance(statuses, ctx.settings.attendance.percent_decimals);
    Ok(serde_json::to_value(tally).map_err(anyhow::Error::from)?)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let action: Action = match req.method.as_str() {
        "attendance.open" => attendance_open,
        "attendance.save" => attendance_save,
        "attendance.markAll" => attendance_mark_all,
        "attendance.stats" => attendance_stats,
        _ => return None,
    };
    Some(dispatch(state, req, action))
}
