use crate::ipc::error::ActionError;
use crate::ipc::helpers::{
    actor_id, dispatch, Action, exists, include_deleted, new_id, now, optional_i64, optional_str,
    patch_obj, query_json, required_str, soft_delete, with_audit, Ctx, PatchSet, AUDIT_COLS,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::{json, Value};

fn school_json(r: &Row<'_>) -> rusqlite::Result<Value> {
    with_audit(
        json!({
            "id": r.get::<_, String>(0)?,
            "name": r.get::<_, String>(1)?,
            "code": r.get::<_, String>(2)?,
            "address": r.get::<_, Option<String>>(3)?,
            "phone": r.get::<_, Option<String>>(4)?,
            "email": r.get::<_, Option<String>>(5)?,
            "academicYearStartMonth": r.get::<_, i64>(6)?,
        }),
        r,
        7,
    )
}

fn select_sql(filter: &str) -> String {
    format!(
        "SELECT id, name, code, address, phone, email, academic_year_start_month, {AUDIT_COLS}
         FROM schools {filter}"
    )
}

fn load_school(conn: &Connection, school_id: &str) -> Result<Value, ActionError> {
    conn.query_row(
        &select_sql("WHERE id = ? AND del_flag = 0"),
        [school_id],
        school_json,
    )
    .optional()?
    .ok_or_else(|| ActionError::not_found("school"))
}

fn code_taken(conn: &Connection, code: &str, except_id: Option<&str>) -> Result<bool, ActionError> {
    exists(
        conn,
        "SELECT 1 FROM schools WHERE code = ? COLLATE NOCASE AND del_flag = 0 AND id <> ?",
        (code, except_id.unwrap_or("")),
    )
}

fn start_month(v: Option<i64>) -> Result<i64, ActionError> {
    let m = v.unwrap_or(4);
    if !(1..=12).contains(&m) {
        return Err(ActionError::invalid(
            "academicYearStartMonth",
            "academicYearStartMonth must be between 1 and 12",
        ));
    }
    Ok(m)
}

fn schools_list(ctx: &Ctx, params: &Value) -> Result<Value, ActionError> {
    let filter = if include_deleted(params) {
        "ORDER BY name"
    } else {
        "WHERE del_flag = 0 ORDER BY name"
    };
    let schools = query_json(ctx.conn, &select_sql(filter), [], school_json)?;
    Ok(json!({ "schools": schools }))
}

fn schools_get(ctx: &Ctx, params: &Value) -> Result<Value, ActionError> {
    let school_id = required_str(params, "schoolId")?;
    Ok(json!({ "school": load_school(ctx.conn, &school_id)? }))
}

fn schools_create(ctx: &Ctx, params: &Value) -> Result<Value, ActionError> {
    let actor = actor_id(ctx.conn, params, None)?;
    let name = required_str(params, "name")?;
    let code = required_str(params, "code")?.to_ascii_uppercase();
    let month = start_month(optional_i64(params, "academicYearStartMonth")?)?;
    if code_taken(ctx.conn, &code, None)? {
        return Err(ActionError::conflict(format!("school code {code} already exists")));
    }

    let id = new_id();
    let ts = now();
    ctx.conn.execute(
        "INSERT INTO schools(id, name, code, address, phone, email, academic_year_start_month,
                             created_by, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            &name,
            &code,
            optional_str(params, "address")?,
            optional_str(params, "phone")?,
            optional_str(params, "email")?,
            month,
            &actor,
            &ts,
            &ts,
        ),
    )?;
    tracing::info!(school_id = %id, %code, "school created");
    Ok(json!({ "schoolId": id, "school": load_school(ctx.conn, &id)? }))
}

fn schools_update(ctx: &Ctx, params: &Value) -> Result<Value, ActionError> {
    let school_id = required_str(params, "schoolId")?;
    let actor = actor_id(ctx.conn, params, Some(&school_id))?;
    let patch = patch_obj(params)?;
    let mut set = PatchSet::new(patch);
    set.text("name", "name")?;
    if let Some(code) = patch.get("code").and_then(|v| v.as_str()) {
        let code = code.trim().to_ascii_uppercase();
        if code.is_empty() {
            return Err(ActionError::invalid("code", "code must not be empty"));
        }
        if code_taken(ctx.conn, &code, Some(&school_id))? {
            return Err(ActionError::conflict(format!("school code {code} already exists")));
        }
        set.push("code", rusqlite::types::Value::Text(code));
    }
    set.nullable_text("address", "address")?;
    set.nullable_text("phone", "phone")?;
    set.nullable_text("email", "email")?;
    if set.has("academicYearStartMonth") {
        let m = patch
            .get("academicYearStartMonth")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| {
                ActionError::invalid("academicYearStartMonth", "academicYearStartMonth must be an integer")
            })?;
        set.push(
            "academic_year_start_month",
            rusqlite::types::Value::Integer(start_month(Some(m))?),
        );
    }
    set.apply(ctx.conn, "schools", "school", &school_id, None, &actor)?;
    Ok(json!({ "school": load_school(ctx.conn, &school_id)? }))
}

fn schools_delete(ctx: &Ctx, params: &Value) -> Result<Value, ActionError> {
    let school_id = required_str(params, "schoolId")?;
    let actor = actor_id(ctx.conn, params, Some(&school_id))?;
    soft_delete(ctx.conn, "schools", "school", &school_id, None, &actor)?;
    tracing::info!(%school_id, "school deleted");
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let action: Action = match req.method.as_str() {
        "schools.list" => schools_list,
        "schools.get" => schools_get,
        "schools.create" => schools_create,
        "schools.update" => schools_update,
        "schools.delete" => schools_delete,
        _ => return None,
    };
    Some(dispatch(state, req, action))
}
