use crate::calc::{self, Direction};
use crate::ipc::error::ActionError;
use crate::ipc::handlers::accounts::{self, Posting, Source};
use crate::ipc::helpers::{
    actor_id, dispatch, ensure_in_school, new_id, now, optional_str, owning_school, query_json,
    required_date, required_month, required_str, school_ref, with_audit, Action, Ctx,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::{json, Value};

fn payslip_json(r: &Row<'_>) -> rusqlite::Result<Value> {
    with_audit(
        json!({
            "id": r.get::<_, String>(0)?,
            "schoolId": r.get::<_, String>(1)?,
            "employeeId": r.get::<_, String>(2)?,
            "employeeName": r.get::<_, Option<String>>(3)?,
            "month": r.get::<_, String>(4)?,
            "basic": r.get::<_, f64>(5)?,
            "allowances": r.get::<_, f64>(6)?,
            "deductions": r.get::<_, f64>(7)?,
            "net": r.get::<_, f64>(8)?,
            "status": r.get::<_, String>(9)?,
            "paidOn": r.get::<_, Option<String>>(10)?,
            "accountId": r.get::<_, Option<String>>(11)?,
        }),
        r,
        12,
    )
}

fn payslip_sql(filter: &str) -> String {
    format!(
        "SELECT p.id, p.school_id, p.employee_id, e.last_name || ', ' || e.first_name, p.month,
           p.basic, p.allowances, p.deductions, p.net, p.status, p.paid_on, p.account_id,
           p.mod_flag, p.del_flag, p.created_by, p.modified_by, p.action_type,
           p.created_at, p.updated_at
         FROM payslips p
         LEFT JOIN employees e ON e.id = p.employee_id
         {filter}"
    )
}

fn load_payslip(conn: &Connection, payslip_id: &str, school_id: &str) -> Result<Value, ActionError> {
    conn.query_row(
        &payslip_sql("WHERE p.id = ? AND p.school_id = ? AND p.del_flag = 0"),
        (payslip_id, school_id),
        payslip_json,
    )
    .optional()?
    .ok_or_else(|| ActionError::not_found("payslip"))
}

fn payroll_generate(ctx: &Ctx, params: &Value) -> Result<Value, ActionError> {
    let school = school_ref(ctx.conn, params)?;
    let actor = actor_id(ctx.conn, params, Some(&school.id))?;
    let (year, month) = required_month(params, "month")?;
    let month_key = format!("{year:04}-{month:02}");

    let employees: Vec<(String, String, f64, f64, f64, bool)> = {
        let mut stmt = ctx.conn.prepare(
            "SELECT e.id, e.last_name || ', ' || e.first_name,
                    e.basic_salary, e.allowances, e.deductions,
                    EXISTS(SELECT 1 FROM payslips p WHERE p.employee_id = e.id AND p.month = ?2)
             FROM employees e
             WHERE e.school_id = ?1 AND e.del_flag = 0 AND e.active = 1
             ORDER BY e.last_name, e.first_name",
        )?;
        let rows = stmt.query_map((&school.id, &month_key), |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?))
        })?;
        rows.collect::<Result<Vec<_>, _>>()?
    };

    let tx = ctx.conn.unchecked_transaction()?;
    let ts = now();
    let mut created = Vec::new();
    let mut skipped = Vec::new();
    let mut existing = 0usize;
    for (employee_id, name, basic, allowances, deductions, has_slip) in employees {
        if has_slip {
            existing += 1;
            continue;
        }
        let net = calc::payroll_net(basic, allowances, deductions);
        if net < 0.0 {
            skipped.push(json!({
                "employeeId": employee_id,
                "employeeName": name,
                "net": net,
                "reason": "deductions exceed basic salary plus allowances",
            }));
            continue;
        }
        let id = new_id();
        tx.execute(
            "INSERT INTO payslips(id, school_id, employee_id, month, basic, allowances, deductions,
                                  net, status, created_by, created_at, updated_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?, ?)",
            rusqlite::params![
                id, school.id, employee_id, month_key, basic, allowances, deductions, net, actor,
                ts, ts,
            ],
        )?;
        created.push(id);
    }
    tx.commit()?;
    tracing::info!(school_id = %school.id, month = %month_key, created = created.len(), skipped = skipped.len(), "payroll generated");

    let payslips = created
        .iter()
        .map(|id| load_payslip(ctx.conn, id, &school.id))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({
        "month": month_key,
        "created": payslips,
        "skipped": skipped,
        "existing": existing,
    }))
}

fn payroll_list(ctx: &Ctx, params: &Value) -> Result<Value, ActionError> {
    let school = school_ref(ctx.conn, params)?;
    let (year, month) = required_month(params, "month")?;
    let month_key = format!("{year:04}-{month:02}");
    let payslips = query_json(
        ctx.conn,
        &payslip_sql(
            "WHERE p.school_id = ? AND p.month = ? AND p.del_flag = 0
             ORDER BY e.last_name, e.first_name",
        ),
        (&school.id, &month_key),
        payslip_json,
    )?;
    let mut total_net = 0.0;
    let mut paid_net = 0.0;
    for p in &payslips {
        let net = p["net"].as_f64().unwrap_or(0.0);
        total_net += net;
        if p["status"] == "paid" {
            paid_net += net;
        }
    }
    Ok(json!({
        "month": month_key,
        "payslips": payslips,
        "totalNet": calc::round_money(total_net),
        "paidNet": calc::round_money(paid_net),
        "currency": ctx.settings.fees.currency,
    }))
}

fn payroll_mark_paid(ctx: &Ctx, params: &Value) -> Result<Value, ActionError> {
    let payslip_id = required_str(params, "payslipId")?;
    let school = owning_school(ctx.conn, params, "payslips", "payslip", &payslip_id)?;
    let actor = actor_id(ctx.conn, params, Some(&school.id))?;
    let paid_on = required_date(params, "paidOn")?.format("%Y-%m-%d").to_string();
    let account_id = optional_str(params, "accountId")?;
    if let Some(a) = &account_id {
        ensure_in_school(ctx.conn, "accounts", "account", a, &school.id)?;
    }
    let slip = load_payslip(ctx.conn, &payslip_id, &school.id)?;
    if slip["status"] == "paid" {
        return Err(ActionError::conflict("payslip is already paid"));
    }
    let net = slip["net"].as_f64().unwrap_or(0.0);

    let tx = ctx.conn.unchecked_transaction()?;
    tx.execute(
        "UPDATE payslips
         SET status = 'paid', paid_on = ?, account_id = ?, mod_flag = 1, action_type = 'update',
             modified_by = ?, updated_at = ?
         WHERE id = ?",
        (&paid_on, &account_id, &actor, now(), &payslip_id),
    )?;
    if let (Some(account), true) = (&account_id, net > 0.0) {
        let memo = format!(
            "salary {} {}",
            slip["month"].as_str().unwrap_or_default(),
            slip["employeeName"].as_str().unwrap_or_default()
        );
        accounts::post(
            &tx,
            &Posting {
                school_id: &school.id,
                account_id: account,
                date: &paid_on,
                direction: Direction::Credit,
                amount: net,
                source: Source::Payroll,
                source_id: Some(&payslip_id),
                memo: Some(&memo),
            },
            &actor,
        )?;
    }
    tx.commit()?;
    tracing::info!(%payslip_id, school_id = %school.id, net, "payslip paid");
    Ok(json!({ "payslip": load_payslip(ctx.conn, &payslip_id, &school.id)? }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let action: Action = match req.method.as_str() {
        "payroll.generate" => payroll_generate,
        "payroll.list" => payroll_list,
        "payroll.markPaid" => payroll_mark_paid,
        _ => return None,
    };
    Some(dispatch(state, req, action))
}
