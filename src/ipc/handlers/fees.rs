use crate::calc::{self, Direction, FeeFrequency};
use crate::ipc::error::ActionError;
use crate::ipc::handlers::accounts::{self, Posting, Source};
use crate::ipc::helpers::{
    actor_id, dispatch, ensure_in_school, include_deleted, new_id, now, optional_date,
    optional_f64, optional_str, owning_school, patch_obj, query_json, required_date, required_f64,
    required_str, school_ref, soft_delete, today, with_audit, Action, Ctx, PatchSet, SchoolRef,
    AUDIT_COLS,
};
use crate::ipc::types::{AppState, Request};
use chrono::Datelike;
use rusqlite::{types::Value as SqlValue, Connection, OptionalExtension, Row};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;

const METHODS: &[&str] = &["cash", "bank", "cheque", "online"];

fn parse_frequency(raw: &str) -> Result<FeeFrequency, ActionError> {
    FeeFrequency::parse(raw).ok_or_else(|| {
        ActionError::invalid("frequency", "frequency must be one of: one_time, monthly, annual")
    })
}

fn head_json(r: &Row<'_>) -> rusqlite::Result<Value> {
    with_audit(
        json!({
            "id": r.get::<_, String>(0)?,
            "schoolId": r.get::<_, String>(1)?,
            "classId": r.get::<_, Option<String>>(2)?,
            "name": r.get::<_, String>(3)?,
            "amount": r.get::<_, f64>(4)?,
            "frequency": r.get::<_, String>(5)?,
        }),
        r,
        6,
    )
}

fn head_sql(filter: &str) -> String {
    format!(
        "SELECT id, school_id, class_id, name, amount, frequency, {AUDIT_COLS}
         FROM fee_heads {filter}"
    )
}

fn load_head(conn: &Connection, head_id: &str, school_id: &str) -> Result<Value, ActionError> {
    conn.query_row(
        &head_sql("WHERE id = ? AND school_id = ? AND del_flag = 0"),
        (head_id, school_id),
        head_json,
    )
    .optional()?
    .ok_or_else(|| ActionError::not_found("fee head"))
}

#[derive(Debug, Clone)]
struct HeadRow {
    id: String,
    name: String,
    amount: f64,
    frequency: FeeFrequency,
}

/// Live heads that apply to a class: class-specific ones plus school-wide ones.
fn heads_for_class(conn: &Connection, school_id: &str, class_id: &str) -> Result<Vec<HeadRow>, ActionError> {
    let mut stmt = conn.prepare(
        "SELECT id, name, amount, frequency
         FROM fee_heads
         WHERE school_id = ? AND del_flag = 0 AND (class_id IS NULL OR class_id = ?)
         ORDER BY name",
    )?;
    let rows = stmt.query_map((school_id, class_id), |r| {
        Ok((
            r.get::<_, String>(0)?,
            r.get::<_, String>(1)?,
            r.get::<_, f64>(2)?,
            r.get::<_, String>(3)?,
        ))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let (id, name, amount, freq) = row?;
        let frequency = FeeFrequency::parse(&freq)
            .ok_or_else(|| anyhow::anyhow!("fee head {id} has unknown frequency {freq}"))?;
        out.push(HeadRow {
            id,
            name,
            amount,
            frequency,
        });
    }
    Ok(out)
}

/// (paid, discount) already recorded against a head and period for a student.
fn settled(
    conn: &Connection,
    student_id: &str,
    head_id: &str,
    period: &str,
) -> Result<(f64, f64), ActionError> {
    Ok(conn.query_row(
        "SELECT COALESCE(SUM(l.paid_amount), 0), COALESCE(SUM(l.discount), 0)
         FROM fee_payment_lines l
         JOIN fee_payments p ON p.id = l.payment_id
         WHERE p.student_id = ? AND p.del_flag = 0 AND l.fee_head_id = ? AND l.period = ?",
        (student_id, head_id, period),
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DueLine {
    pub fee_head_id: String,
    pub fee_head_name: String,
    pub frequency: &'static str,
    pub period: String,
    pub amount: f64,
    pub paid: f64,
    pub discount: f64,
    pub balance: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DueTotals {
    pub amount: f64,
    pub paid: f64,
    pub discount: f64,
    pub balance: f64,
}

impl DueTotals {
    fn of(lines: &[DueLine]) -> Self {
        let mut t = Self::default();
        for l in lines {
            t.amount += l.amount;
            t.paid += l.paid;
            t.discount += l.discount;
            t.balance += l.balance;
        }
        t.amount = calc::round_money(t.amount);
        t.paid = calc::round_money(t.paid);
        t.discount = calc::round_money(t.discount);
        t.balance = calc::round_money(t.balance);
        t
    }
}

/// Every (head, period) billed to a student up to `as_of` with what remains.
pub fn student_dues(
    conn: &Connection,
    school: &SchoolRef,
    student_id: &str,
    class_id: &str,
    as_of: (i32, u32),
) -> Result<(Vec<DueLine>, DueTotals), ActionError> {
    let mut lines = Vec::new();
    for head in heads_for_class(conn, &school.id, class_id)? {
        for period in calc::fee_periods(head.frequency, school.academic_year_start_month, as_of) {
            let (paid, discount) = settled(conn, student_id, &head.id, &period)?;
            lines.push(DueLine {
                fee_head_id: head.id.clone(),
                fee_head_name: head.name.clone(),
                frequency: head.frequency.as_str(),
                period,
                amount: head.amount,
                paid: calc::round_money(paid),
                discount: calc::round_money(discount),
                balance: calc::round_money(head.amount - paid - discount).max(0.0),
            });
        }
    }
    let totals = DueTotals::of(&lines);
    Ok((lines, totals))
}

/// Student's class, failing with `not_found` outside the school.
pub fn student_class(conn: &Connection, student_id: &str, school_id: &str) -> Result<String, ActionError> {
    conn.query_row(
        "SELECT class_id FROM students WHERE id = ? AND school_id = ? AND del_flag = 0",
        (student_id, school_id),
        |r| r.get(0),
    )
    .optional()?
    .ok_or_else(|| ActionError::not_found("student"))
}

pub fn as_of_month(params: &Value) -> Result<(i32, u32), ActionError> {
    match optional_str(params, "asOf")? {
        Some(raw) => calc::parse_month(&raw)
            .ok_or_else(|| ActionError::invalid("asOf", "asOf must be YYYY-MM")),
        None => {
            let t = today();
            Ok((t.year(), t.month()))
        }
    }
}

fn heads_list(ctx: &Ctx, params: &Value) -> Result<Value, ActionError> {
    let school = school_ref(ctx.conn, params)?;
    let mut filter = String::from("WHERE school_id = ?");
    let mut values = vec![SqlValue::Text(school.id.clone())];
    if !include_deleted(params) {
        filter.push_str(" AND del_flag = 0");
    }
    if let Some(class_id) = optional_str(params, "classId")? {
        filter.push_str(" AND (class_id IS NULL OR class_id = ?)");
        values.push(SqlValue::Text(class_id));
    }
    filter.push_str(" ORDER BY name");
    let heads = query_json(
        ctx.conn,
        &head_sql(&filter),
        rusqlite::params_from_iter(values),
        head_json,
    )?;
    Ok(json!({ "feeHeads": heads, "currency": ctx.settings.fees.currency }))
}

fn heads_create(ctx: &Ctx, params: &Value) -> Result<Value, ActionError> {
    let school = school_ref(ctx.conn, params)?;
    let actor = actor_id(ctx.conn, params, Some(&school.id))?;
    let class_id = optional_str(params, "classId")?;
    if let Some(c) = &class_id {
        ensure_in_school(ctx.conn, "classes", "class", c, &school.id)?;
    }
    let name = required_str(params, "name")?;
    let amount = required_f64(params, "amount")?;
    if amount <= 0.0 {
        return Err(ActionError::invalid("amount", "amount must be greater than zero"));
    }
    let frequency = parse_frequency(&required_str(params, "frequency")?)?;

    let id = new_id();
    let ts = now();
    ctx.conn.execute(
        "INSERT INTO fee_heads(id, school_id, class_id, name, amount, frequency,
                               created_by, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            &school.id,
            &class_id,
            &name,
            calc::round_money(amount),
            frequency.as_str(),
            &actor,
            &ts,
            &ts,
        ),
    )?;
    tracing::info!(fee_head_id = %id, school_id = %school.id, frequency = frequency.as_str(), "fee head created");
    Ok(json!({ "feeHeadId": id, "feeHead": load_head(ctx.conn, &id, &school.id)? }))
}

/// Largest amount already settled (paid plus discount) for one student and
/// period of the head, across live payments.
fn settled_max(conn: &Connection, head_id: &str) -> Result<f64, ActionError> {
    Ok(conn.query_row(
        "SELECT COALESCE(MAX(settled), 0) FROM (
             SELECT SUM(l.paid_amount + l.discount) AS settled
             FROM fee_payment_lines l
             JOIN fee_payments p ON p.id = l.payment_id
             WHERE l.fee_head_id = ? AND p.del_flag = 0
             GROUP BY p.student_id, l.period
         )",
        [head_id],
        |r| r.get(0),
    )?)
}

/// Live settled lines of the head whose student is not in `class_id`.
fn settled_outside_class(conn: &Connection, head_id: &str, class_id: &str) -> Result<i64, ActionError> {
    Ok(conn.query_row(
        "SELECT COUNT(*)
         FROM fee_payment_lines l
         JOIN fee_payments p ON p.id = l.payment_id
         JOIN students s ON s.id = p.student_id
         WHERE l.fee_head_id = ? AND p.del_flag = 0 AND s.class_id IS NOT ?",
        (head_id, class_id),
        |r| r.get(0),
    )?)
}

fn heads_update(ctx: &Ctx, params: &Value) -> Result<Value, ActionError> {
    let school = school_ref(ctx.conn, params)?;
    let actor = actor_id(ctx.conn, params, Some(&school.id))?;
    let head_id = required_str(params, "feeHeadId")?;
    let current = load_head(ctx.conn, &head_id, &school.id)?;
    let patch = patch_obj(params)?;

    let mut set = PatchSet::new(patch);
    set.text("name", "name")?;
    if let Some(amount) = set.real("amount", "amount", 0.0)? {
        if amount == 0.0 {
            return Err(ActionError::invalid("amount", "amount must be greater than zero"));
        }
        let settled = settled_max(ctx.conn, &head_id)?;
        if calc::round_money(amount) < settled {
            return Err(ActionError::invalid(
                "amount",
                format!("amount cannot drop below the {settled} already settled for a period"),
            ));
        }
    }
    if let Some(raw) = patch.get("frequency") {
        let f = parse_frequency(raw.as_str().unwrap_or_default())?;
        if current["frequency"] != f.as_str() && settled_max(ctx.conn, &head_id)? > 0.0 {
            return Err(ActionError::invalid(
                "frequency",
                "frequency cannot change once payments are recorded",
            ));
        }
        set.push("frequency", SqlValue::Text(f.as_str().to_string()));
    }
    if let Some(Some(c)) = set.nullable_text("classId", "class_id")? {
        ensure_in_school(ctx.conn, "classes", "class", &c, &school.id)?;
        if current["classId"] != c.as_str() && settled_outside_class(ctx.conn, &head_id, &c)? > 0 {
            return Err(ActionError::invalid(
                "classId",
                "students outside the class already paid this fee",
            ));
        }
    }
    set.apply(ctx.conn, "fee_heads", "fee head", &head_id, Some(&school.id), &actor)?;
    Ok(json!({ "feeHead": load_head(ctx.conn, &head_id, &school.id)? }))
}

fn heads_delete(ctx: &Ctx, params: &Value) -> Result<Value, ActionError> {
    let school = school_ref(ctx.conn, params)?;
    let actor = actor_id(ctx.conn, params, Some(&school.id))?;
    let head_id = required_str(params, "feeHeadId")?;
    soft_delete(ctx.conn, "fee_heads", "fee head", &head_id, Some(&school.id), &actor)?;
    tracing::info!(fee_head_id = %head_id, school_id = %school.id, "fee head deleted");
    Ok(json!({ "ok": true }))
}

fn fees_due(ctx: &Ctx, params: &Value) -> Result<Value, ActionError> {
    let school = school_ref(ctx.conn, params)?;
    let student_id = required_str(params, "studentId")?;
    let class_id = student_class(ctx.conn, &student_id, &school.id)?;
    let as_of = as_of_month(params)?;
    let (lines, totals) = student_dues(ctx.conn, &school, &student_id, &class_id, as_of)?;
    Ok(json!({
        "studentId": student_id,
        "asOf": format!("{:04}-{:02}", as_of.0, as_of.1),
        "currency": ctx.settings.fees.currency,
        "lines": lines,
        "totals": totals,
    }))
}

struct CollectLine {
    head_id: String,
    period: String,
    fee_amount: f64,
    paid: f64,
    discount: f64,
}

fn next_receipt_no(conn: &Connection, school_id: &str, year: i32) -> Result<String, ActionError> {
    let issued: i64 = conn.query_row(
        "SELECT COUNT(*) FROM fee_payments WHERE school_id = ?",
        [school_id],
        |r| r.get(0),
    )?;
    Ok(format!("R{}-{:05}", year, issued + 1))
}

fn fees_collect(ctx: &Ctx, params: &Value) -> Result<Value, ActionError> {
    let school = school_ref(ctx.conn, params)?;
    let actor = actor_id(ctx.conn, params, Some(&school.id))?;
    let student_id = required_str(params, "studentId")?;
    let class_id = student_class(ctx.conn, &student_id, &school.id)?;
    let paid_on = required_date(params, "paidOn")?;
    let method = required_str(params, "method")?.to_ascii_lowercase();
    if !METHODS.contains(&method.as_str()) {
        return Err(ActionError::invalid(
            "method",
            "method must be one of: cash, bank, cheque, online",
        ));
    }
    let account_id = optional_str(params, "accountId")?;
    if let Some(a) = &account_id {
        ensure_in_school(ctx.conn, "accounts", "account", a, &school.id)?;
    }
    let raw_lines = match params.get("lines").and_then(|v| v.as_array()) {
        Some(l) if !l.is_empty() => l,
        Some(_) => return Err(ActionError::invalid("lines", "at least one line is required")),
        None => return Err(ActionError::bad_params("missing lines")),
    };

    let heads: HashMap<String, HeadRow> = heads_for_class(ctx.conn, &school.id, &class_id)?
        .into_iter()
        .map(|h| (h.id.clone(), h))
        .collect();
    // Settled amounts per (head, period), including earlier lines of this request.
    let mut running: HashMap<(String, String), f64> = HashMap::new();
    let mut lines = Vec::with_capacity(raw_lines.len());
    for line in raw_lines {
        let head_id = required_str(line, "feeHeadId")?;
        let Some(head) = heads.get(&head_id) else {
            return Err(ActionError::not_found("fee head"));
        };
        let period = required_str(line, "period")?.to_ascii_uppercase();
        if !calc::period_matches(head.frequency, &period) {
            return Err(ActionError::invalid(
                "period",
                format!("period {period} does not fit a {} fee", head.frequency.as_str()),
            ));
        }
        let paid = required_f64(line, "paidAmount")?;
        let discount = optional_f64(line, "discount")?.unwrap_or(0.0);
        if paid == 0.0 && discount == 0.0 {
            return Err(ActionError::invalid(
                "lines",
                "each line needs a positive paid amount or discount",
            ));
        }
        let key = (head_id.clone(), period.clone());
        let before = match running.get(&key) {
            Some(v) => *v,
            None => {
                let (p, d) = settled(ctx.conn, &student_id, &head_id, &period)?;
                p + d
            }
        };
        calc::check_fee_line(head.amount, before, paid, discount).map_err(|e| {
            ActionError::invalid("lines", format!("{} {}: {e}", head.name, period))
        })?;
        running.insert(key, before + paid + discount);
        lines.push(CollectLine {
            head_id,
            period,
            fee_amount: head.amount,
            paid: calc::round_money(paid),
            discount: calc::round_money(discount),
        });
    }
    let total = calc::round_money(lines.iter().map(|l| l.paid).sum());
    let paid_on_s = paid_on.format("%Y-%m-%d").to_string();

    let tx = ctx.conn.unchecked_transaction()?;
    let receipt_no = next_receipt_no(&tx, &school.id, paid_on.year())?;
    let payment_id = new_id();
    let ts = now();
    tx.execute(
        "INSERT INTO fee_payments(id, school_id, student_id, receipt_no, paid_on, method,
                                  account_id, total, remark, created_by, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            payment_id,
            school.id,
            student_id,
            receipt_no,
            paid_on_s,
            method,
            account_id,
            total,
            optional_str(params, "remark")?,
            actor,
            ts,
            ts,
        ],
    )?;
    for l in &lines {
        tx.execute(
            "INSERT INTO fee_payment_lines(id, payment_id, fee_head_id, period, fee_amount,
                                           discount, paid_amount)
             VALUES(?, ?, ?, ?, ?, ?, ?)",
            (new_id(), &payment_id, &l.head_id, &l.period, l.fee_amount, l.discount, l.paid),
        )?;
    }
    if let (Some(account), true) = (&account_id, total > 0.0) {
        accounts::post(
            &tx,
            &Posting {
                school_id: &school.id,
                account_id: account,
                date: &paid_on_s,
                direction: Direction::Debit,
                amount: total,
                source: Source::FeePayment,
                source_id: Some(&payment_id),
                memo: Some(&format!("fee receipt {receipt_no}")),
            },
            &actor,
        )?;
    }
    tx.commit()?;
    tracing::info!(%payment_id, %receipt_no, school_id = %school.id, %student_id, total, "fee collected");
    Ok(json!({
        "paymentId": payment_id,
        "receiptNo": receipt_no,
        "payment": load_payment(ctx.conn, &payment_id, &school.id, true)?,
    }))
}

fn payment_json(r: &Row<'_>) -> rusqlite::Result<Value> {
    with_audit(
        json!({
            "id": r.get::<_, String>(0)?,
            "schoolId": r.get::<_, String>(1)?,
            "studentId": r.get::<_, String>(2)?,
            "studentName": r.get::<_, Option<String>>(3)?,
            "receiptNo": r.get::<_, String>(4)?,
            "paidOn": r.get::<_, String>(5)?,
            "method": r.get::<_, String>(6)?,
            "accountId": r.get::<_, Option<String>>(7)?,
            "total": r.get::<_, f64>(8)?,
            "remark": r.get::<_, Option<String>>(9)?,
        }),
        r,
        10,
    )
}

fn payment_sql(filter: &str) -> String {
    format!(
        "SELECT p.id, p.school_id, p.student_id, s.last_name || ', ' || s.first_name,
           p.receipt_no, p.paid_on, p.method, p.account_id, p.total, p.remark,
           p.mod_flag, p.del_flag, p.created_by, p.modified_by, p.action_type,
           p.created_at, p.updated_at
         FROM fee_payments p
         LEFT JOIN students s ON s.id = p.student_id
         {filter}"
    )
}

fn payment_lines(conn: &Connection, payment_id: &str) -> Result<Vec<Value>, ActionError> {
    query_json(
        conn,
        "SELECT l.fee_head_id, h.name, l.period, l.fee_amount, l.discount, l.paid_amount
         FROM fee_payment_lines l
         LEFT JOIN fee_heads h ON h.id = l.fee_head_id
         WHERE l.payment_id = ?
         ORDER BY h.name, l.period",
        [payment_id],
        |r| {
            Ok(json!({
                "feeHeadId": r.get::<_, String>(0)?,
                "feeHeadName": r.get::<_, Option<String>>(1)?,
                "period": r.get::<_, String>(2)?,
                "feeAmount": r.get::<_, f64>(3)?,
                "discount": r.get::<_, f64>(4)?,
                "paidAmount": r.get::<_, f64>(5)?,
            }))
        },
    )
}

fn load_payment(
    conn: &Connection,
    payment_id: &str,
    school_id: &str,
    live_only: bool,
) -> Result<Value, ActionError> {
    let filter = if live_only {
        "WHERE p.id = ? AND p.school_id = ? AND p.del_flag = 0"
    } else {
        "WHERE p.id = ? AND p.school_id = ?"
    };
    let mut payment = conn
        .query_row(&payment_sql(filter), (payment_id, school_id), payment_json)
        .optional()?
        .ok_or_else(|| ActionError::not_found("payment"))?;
    payment["lines"] = Value::Array(payment_lines(conn, payment_id)?);
    Ok(payment)
}

fn payments_list(ctx: &Ctx, params: &Value) -> Result<Value, ActionError> {
    let school = school_ref(ctx.conn, params)?;
    let mut filter = String::from("WHERE p.school_id = ?");
    let mut values = vec![SqlValue::Text(school.id.clone())];
    if !include_deleted(params) {
        filter.push_str(" AND p.del_flag = 0");
    }
    if let Some(student_id) = optional_str(params, "studentId")? {
        filter.push_str(" AND p.student_id = ?");
        values.push(SqlValue::Text(student_id));
    }
    if let Some(from) = optional_date(params, "from")? {
        filter.push_str(" AND p.paid_on >= ?");
        values.push(SqlValue::Text(from.format("%Y-%m-%d").to_string()));
    }
    if let Some(to) = optional_date(params, "to")? {
        filter.push_str(" AND p.paid_on <= ?");
        values.push(SqlValue::Text(to.format("%Y-%m-%d").to_string()));
    }
    filter.push_str(" ORDER BY p.paid_on DESC, p.receipt_no DESC");
    let mut payments = query_json(
        ctx.conn,
        &payment_sql(&filter),
        rusqlite::params_from_iter(values),
        payment_json,
    )?;
    for p in payments.iter_mut() {
        let id = p["id"].as_str().unwrap_or_default().to_string();
        p["lines"] = Value::Array(payment_lines(ctx.conn, &id)?);
    }
    let total = calc::round_money(payments.iter().filter_map(|p| p["total"].as_f64()).sum());
    Ok(json!({
        "payments": payments,
        "total": total,
        "currency": ctx.settings.fees.currency,
    }))
}

fn payments_void(ctx: &Ctx, params: &Value) -> Result<Value, ActionError> {
    let payment_id = required_str(params, "paymentId")?;
    let school = owning_school(ctx.conn, params, "fee_payments", "payment", &payment_id)?;
    let actor = actor_id(ctx.conn, params, Some(&school.id))?;
    load_payment(ctx.conn, &payment_id, &school.id, true)?;

    let tx = ctx.conn.unchecked_transaction()?;
    soft_delete(&tx, "fee_payments", "payment", &payment_id, Some(&school.id), &actor)?;
    let reversed = accounts::reverse_postings(
        &tx,
        Source::FeePayment,
        &payment_id,
        Source::FeePaymentVoid,
        &today().format("%Y-%m-%d").to_string(),
        &actor,
    )?;
    tx.commit()?;
    tracing::info!(%payment_id, school_id = %school.id, reversed, "fee payment voided");
    Ok(json!({
        "payment": load_payment(ctx.conn, &payment_id, &school.id, false)?,
        "reversedEntries": reversed,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let action: Action = match req.method.as_str() {
        "fees.heads.list" => heads_list,
        "fees.heads.create" => heads_create,
        "fees.heads.update" => heads_update,
        "fees.heads.delete" => heads_delete,
        "fees.due" => fees_due,
        "fees.collect" => fees_collect,
        "fees.payments.list" => payments_list,
        "fees.payments.void" => payments_void,
        _ => return None,
    };
    Some(dispatch(state, req, action))
}
