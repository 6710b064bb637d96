use crate::calc;
use crate::ipc::error::ActionError;
use crate::ipc::handlers::{attendance, fees, inventory, messages};
use crate::ipc::helpers::{
    dispatch, ensure_in_school, optional_date, optional_str, query_json, required_date,
    required_month, required_str, school_ref, today, Action, Ctx,
};
use crate::ipc::types::{AppState, Request};
use chrono::Datelike;
use rusqlite::Connection;
use serde_json::{json, Value};

fn live_count(conn: &Connection, table: &str, school_id: &str) -> Result<i64, ActionError> {
    Ok(conn.query_row(
        &format!("SELECT COUNT(*) FROM {table} WHERE school_id = ? AND del_flag = 0"),
        [school_id],
        |r| r.get(0),
    )?)
}

fn collected_between(conn: &Connection, school_id: &str, from: &str, to: &str) -> Result<f64, ActionError> {
    let total: f64 = conn.query_row(
        "SELECT COALESCE(SUM(total), 0) FROM fee_payments
         WHERE school_id = ? AND del_flag = 0 AND paid_on >= ? AND paid_on <= ?",
        (school_id, from, to),
        |r| r.get(0),
    )?;
    Ok(calc::round_money(total))
}

fn reports_dashboard(ctx: &Ctx, params: &Value) -> Result<Value, ActionError> {
    let school = school_ref(ctx.conn, params)?;
    let date = optional_date(params, "date")?.unwrap_or_else(today);
    let (first, last) = calc::month_bounds(date.year(), date.month())
        .ok_or_else(|| ActionError::invalid("date", "date is out of range"))?;
    let fees_month = collected_between(
        ctx.conn,
        &school.id,
        &first.format("%Y-%m-%d").to_string(),
        &last.format("%Y-%m-%d").to_string(),
    )?;
    let unread = match optional_str(params, "userId")? {
        Some(user_id) => Some(messages::unread_count(ctx.conn, &school.id, &user_id)?),
        None => None,
    };
    Ok(json!({
        "date": date.format("%Y-%m-%d").to_string(),
        "counts": {
            "students": live_count(ctx.conn, "students", &school.id)?,
            "employees": live_count(ctx.conn, "employees", &school.id)?,
            "classes": live_count(ctx.conn, "classes", &school.id)?,
        },
        "attendance": attendance::school_day_percentage(ctx, &school.id, date)?,
        "feesCollectedThisMonth": fees_month,
        "lowStockItems": inventory::low_stock_items(ctx.conn, &school.id)?.len(),
        "unreadMessages": unread,
        "currency": ctx.settings.fees.currency,
    }))
}

fn reports_attendance_monthly(ctx: &Ctx, params: &Value) -> Result<Value, ActionError> {
    let school = school_ref(ctx.conn, params)?;
    let class_id = required_str(params, "classId")?;
    ensure_in_school(ctx.conn, "classes", "class", &class_id, &school.id)?;
    let (year, month) = required_month(params, "month")?;
    let (first, last) = calc::month_bounds(year, month)
        .ok_or_else(|| ActionError::invalid("month", "month is out of range"))?;
    let mut report = attendance::range_stats(ctx, &class_id, first, last)?;
    report["month"] = json!(format!("{year:04}-{month:02}"));
    Ok(report)
}

fn reports_fees_collection(ctx: &Ctx, params: &Value) -> Result<Value, ActionError> {
    let school = school_ref(ctx.conn, params)?;
    let from = required_date(params, "from")?.format("%Y-%m-%d").to_string();
    let to = required_date(params, "to")?.format("%Y-%m-%d").to_string();
    if to < from {
        return Err(ActionError::invalid("to", "to must not be before from"));
    }
    let range = (&school.id, &from, &to);

    let by_head = query_json(
        ctx.conn,
        "SELECT l.fee_head_id, h.name, SUM(l.paid_amount), SUM(l.discount), COUNT(*)
         FROM fee_payment_lines l
         JOIN fee_payments p ON p.id = l.payment_id
         LEFT JOIN fee_heads h ON h.id = l.fee_head_id
         WHERE p.school_id = ? AND p.del_flag = 0 AND p.paid_on >= ? AND p.paid_on <= ?
         GROUP BY l.fee_head_id, h.name
         ORDER BY h.name",
        range,
        |r| {
            Ok(json!({
                "feeHeadId": r.get::<_, String>(0)?,
                "feeHeadName": r.get::<_, Option<String>>(1)?,
                "paid": calc::round_money(r.get::<_, f64>(2)?),
                "discount": calc::round_money(r.get::<_, f64>(3)?),
                "lines": r.get::<_, i64>(4)?,
            }))
        },
    )?;
    let by_method = query_json(
        ctx.conn,
        "SELECT method, SUM(total), COUNT(*)
         FROM fee_payments
         WHERE school_id = ? AND del_flag = 0 AND paid_on >= ? AND paid_on <= ?
         GROUP BY method
         ORDER BY method",
        range,
        |r| {
            Ok(json!({
                "method": r.get::<_, String>(0)?,
                "total": calc::round_money(r.get::<_, f64>(1)?),
                "payments": r.get::<_, i64>(2)?,
            }))
        },
    )?;
    let by_day = query_json(
        ctx.conn,
        "SELECT paid_on, SUM(total), COUNT(*)
         FROM fee_payments
         WHERE school_id = ? AND del_flag = 0 AND paid_on >= ? AND paid_on <= ?
         GROUP BY paid_on
         ORDER BY paid_on",
        range,
        |r| {
            Ok(json!({
                "date": r.get::<_, String>(0)?,
                "total": calc::round_money(r.get::<_, f64>(1)?),
                "payments": r.get::<_, i64>(2)?,
            }))
        },
    )?;
    Ok(json!({
        "from": from,
        "to": to,
        "total": collected_between(ctx.conn, &school.id, &from, &to)?,
        "byHead": by_head,
        "byMethod": by_method,
        "byDay": by_day,
        "currency": ctx.settings.fees.currency,
    }))
}

fn reports_fees_outstanding(ctx: &Ctx, params: &Value) -> Result<Value, ActionError> {
    let school = school_ref(ctx.conn, params)?;
    let class_filter = optional_str(params, "classId")?;
    if let Some(c) = &class_filter {
        ensure_in_school(ctx.conn, "classes", "class", c, &school.id)?;
    }
    let as_of = fees::as_of_month(params)?;

    let students: Vec<(String, String, String, Option<String>)> = {
        let mut stmt = ctx.conn.prepare(
            "SELECT s.id, s.last_name || ', ' || s.first_name, s.class_id,
                    TRIM(c.name || ' ' || c.section)
             FROM students s
             LEFT JOIN classes c ON c.id = s.class_id
             WHERE s.school_id = ?1 AND s.del_flag = 0 AND s.active = 1
               AND (?2 IS NULL OR s.class_id = ?2)
             ORDER BY c.name, c.section, s.last_name, s.first_name",
        )?;
        let rows = stmt.query_map(rusqlite::params![school.id, class_filter], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
        })?;
        rows.collect::<Result<Vec<_>, _>>()?
    };

    let mut rows = Vec::new();
    let mut grand = 0.0;
    for (student_id, name, class_id, class_name) in students {
        let (_, totals) = fees::student_dues(ctx.conn, &school, &student_id, &class_id, as_of)?;
        if totals.balance <= 0.0 {
            continue;
        }
        grand += totals.balance;
        rows.push(json!({
            "studentId": student_id,
            "displayName": name,
            "classId": class_id,
            "className": class_name,
            "totals": totals,
        }));
    }
    Ok(json!({
        "asOf": format!("{:04}-{:02}", as_of.0, as_of.1),
        "students": rows,
        "totalOutstanding": calc::round_money(grand),
        "currency": ctx.settings.fees.currency,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let action: Action = match req.method.as_str() {
        "reports.dashboard" => reports_dashboard,
        "reports.attendanceMonthly" => reports_attendance_monthly,
        "reports.feesCollection" => reports_fees_collection,
        "reports.feesOutstanding" => reports_fees_outstanding,
        _ => return None,
    };
    Some(dispatch(state, req, action))
}
