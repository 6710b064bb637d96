use crate::calc;
use crate::ipc::error::ActionError;
use crate::ipc::helpers::{
    actor_id, dispatch, exists, include_deleted, new_id, now, optional_bool, optional_date,
    optional_f64, optional_str, patch_obj, query_json, required_f64, required_str, school_ref,
    soft_delete, with_audit, Action, Ctx, PatchSet,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{types::Value as SqlValue, Connection, OptionalExtension, Row};
use serde_json::{json, Value};

fn employee_json(r: &Row<'_>) -> rusqlite::Result<Value> {
    let basic: f64 = r.get(10)?;
    let allowances: f64 = r.get(11)?;
    let deductions: f64 = r.get(12)?;
    with_audit(
        json!({
            "id": r.get::<_, String>(0)?,
            "schoolId": r.get::<_, String>(1)?,
            "employeeNo": r.get::<_, String>(2)?,
            "firstName": r.get::<_, String>(3)?,
            "lastName": r.get::<_, String>(4)?,
            "designation": r.get::<_, String>(5)?,
            "department": r.get::<_, Option<String>>(6)?,
            "joinDate": r.get::<_, Option<String>>(7)?,
            "phone": r.get::<_, Option<String>>(8)?,
            "email": r.get::<_, Option<String>>(9)?,
            "basicSalary": basic,
            "allowances": allowances,
            "deductions": deductions,
            "netSalary": calc::payroll_net(basic, allowances, deductions),
            "active": r.get::<_, bool>(13)?,
        }),
        r,
        14,
    )
}

fn select_sql(filter: &str) -> String {
    format!(
        "SELECT id, school_id, employee_no, first_name, last_name, designation, department,
           join_date, phone, email, basic_salary, allowances, deductions, active,
           mod_flag, del_flag, created_by, modified_by, action_type, created_at, updated_at
         FROM employees {filter}"
    )
}

fn load_employee(conn: &Connection, employee_id: &str, school_id: &str) -> Result<Value, ActionError> {
    conn.query_row(
        &select_sql("WHERE id = ? AND school_id = ? AND del_flag = 0"),
        (employee_id, school_id),
        employee_json,
    )
    .optional()?
    .ok_or_else(|| ActionError::not_found("employee"))
}

fn employee_no_taken(
    conn: &Connection,
    school_id: &str,
    employee_no: &str,
    except_id: &str,
) -> Result<bool, ActionError> {
    exists(
        conn,
        "SELECT 1 FROM employees
         WHERE school_id = ? AND employee_no = ? COLLATE NOCASE AND del_flag = 0 AND id <> ?",
        (school_id, employee_no, except_id),
    )
}

fn non_negative(key: &str, v: f64) -> Result<f64, ActionError> {
    if v < 0.0 {
        return Err(ActionError::invalid(key, format!("{key} must not be negative")));
    }
    Ok(calc::round_money(v))
}

fn employees_list(ctx: &Ctx, params: &Value) -> Result<Value, ActionError> {
    let school = school_ref(ctx.conn, params)?;
    let mut filter = String::from("WHERE school_id = ?");
    let mut values = vec![SqlValue::Text(school.id.clone())];
    if !include_deleted(params) {
        filter.push_str(" AND del_flag = 0");
    }
    if let Some(dept) = optional_str(params, "department")? {
        filter.push_str(" AND department = ? COLLATE NOCASE");
        values.push(SqlValue::Text(dept));
    }
    filter.push_str(" ORDER BY last_name, first_name");
    let employees = query_json(
        ctx.conn,
        &select_sql(&filter),
        rusqlite::params_from_iter(values),
        employee_json,
    )?;
    Ok(json!({ "employees": employees }))
}

fn employees_get(ctx: &Ctx, params: &Value) -> Result<Value, ActionError> {
    let school = school_ref(ctx.conn, params)?;
    let employee_id = required_str(params, "employeeId")?;
    Ok(json!({ "employee": load_employee(ctx.conn, &employee_id, &school.id)? }))
}

fn employees_create(ctx: &Ctx, params: &Value) -> Result<Value, ActionError> {
    let school = school_ref(ctx.conn, params)?;
    let actor = actor_id(ctx.conn, params, Some(&school.id))?;
    let employee_no = required_str(params, "employeeNo")?;
    let first_name = required_str(params, "firstName")?;
    let last_name = required_str(params, "lastName")?;
    let designation = required_str(params, "designation")?;
    let join_date = optional_date(params, "joinDate")?.map(|d| d.format("%Y-%m-%d").to_string());
    let basic = non_negative("basicSalary", required_f64(params, "basicSalary")?)?;
    let allowances = non_negative("allowances", optional_f64(params, "allowances")?.unwrap_or(0.0))?;
    let deductions = non_negative("deductions", optional_f64(params, "deductions")?.unwrap_or(0.0))?;
    if employee_no_taken(ctx.conn, &school.id, &employee_no, "")? {
        return Err(ActionError::conflict(format!(
            "employee number {employee_no} is already in use"
        )));
    }

    let id = new_id();
    let ts = now();
    ctx.conn.execute(
        "INSERT INTO employees(id, school_id, employee_no, first_name, last_name, designation,
                               department, join_date, phone, email, basic_salary, allowances,
                               deductions, active, created_by, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            id,
            school.id,
            employee_no,
            first_name,
            last_name,
            designation,
            optional_str(params, "department")?,
            join_date,
            optional_str(params, "phone")?,
            optional_str(params, "email")?,
            basic,
            allowances,
            deductions,
            optional_bool(params, "active")?.unwrap_or(true),
            actor,
            ts,
            ts,
        ],
    )?;
    tracing::info!(employee_id = %id, school_id = %school.id, "employee created");
    Ok(json!({ "employeeId": id, "employee": load_employee(ctx.conn, &id, &school.id)? }))
}

fn employees_update(ctx: &Ctx, params: &Value) -> Result<Value, ActionError> {
    let school = school_ref(ctx.conn, params)?;
    let actor = actor_id(ctx.conn, params, Some(&school.id))?;
    let employee_id = required_str(params, "employeeId")?;
    load_employee(ctx.conn, &employee_id, &school.id)?;
    let patch = patch_obj(params)?;

    let mut set = PatchSet::new(patch);
    if let Some(no) = set.text("employeeNo", "employee_no")? {
        if employee_no_taken(ctx.conn, &school.id, &no, &employee_id)? {
            return Err(ActionError::conflict(format!(
                "employee number {no} is already in use"
            )));
        }
    }
    set.text("firstName", "first_name")?;
    set.text("lastName", "last_name")?;
    set.text("designation", "designation")?;
    set.nullable_text("department", "department")?;
    if let Some(Some(d)) = set.nullable_text("joinDate", "join_date")? {
        if calc::parse_date(&d).is_none() {
            return Err(ActionError::invalid("joinDate", "joinDate must be YYYY-MM-DD"));
        }
    }
    set.nullable_text("phone", "phone")?;
    set.nullable_text("email", "email")?;
    set.real("basicSalary", "basic_salary", 0.0)?;
    set.real("allowances", "allowances", 0.0)?;
    set.real("deductions", "deductions", 0.0)?;
    set.flag("active", "active")?;
    set.apply(ctx.conn, "employees", "employee", &employee_id, Some(&school.id), &actor)?;
    Ok(json!({ "employee": load_employee(ctx.conn, &employee_id, &school.id)? }))
}

fn employees_delete(ctx: &Ctx, params: &Value) -> Result<Value, ActionError> {
    let school = school_ref(ctx.conn, params)?;
    let actor = actor_id(ctx.conn, params, Some(&school.id))?;
    let employee_id = required_str(params, "employeeId")?;
    soft_delete(ctx.conn, "employees", "employee", &employee_id, Some(&school.id), &actor)?;
    tracing::info!(%employee_id, school_id = %school.id, "employee deleted");
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let action: Action = match req.method.as_str() {
        "employees.list" => employees_list,
        "employees.get" => employees_get,
        "employees.create" => employees_create,
        "employees.update" => employees_update,
        "employees.delete" => employees_delete,
        _ => return None,
    };
    Some(dispatch(state, req, action))
}
