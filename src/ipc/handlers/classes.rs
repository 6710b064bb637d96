use crate::ipc::error::ActionError;
use crate::ipc::helpers::{
    actor_id, dispatch, ensure_in_school, exists, include_deleted, new_id, now, optional_i64,
    optional_str, patch_obj, query_json, required_str, school_ref, soft_delete, with_audit,
    Action, Ctx, PatchSet,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::{json, Value};

fn class_json(r: &Row<'_>) -> rusqlite::Result<Value> {
    with_audit(
        json!({
            "id": r.get::<_, String>(0)?,
            "schoolId": r.get::<_, String>(1)?,
            "name": r.get::<_, String>(2)?,
            "section": r.get::<_, String>(3)?,
            "capacity": r.get::<_, Option<i64>>(4)?,
            "classTeacherId": r.get::<_, Option<String>>(5)?,
            "studentCount": r.get::<_, i64>(6)?,
        }),
        r,
        7,
    )
}

fn select_sql(filter: &str) -> String {
    format!(
        "SELECT c.id, c.school_id, c.name, c.section, c.capacity, c.class_teacher_id,
           (SELECT COUNT(*) FROM students s WHERE s.class_id = c.id AND s.del_flag = 0),
           c.mod_flag, c.del_flag, c.created_by, c.modified_by, c.action_type,
           c.created_at, c.updated_at
         FROM classes c {filter}"
    )
}

fn load_class(conn: &Connection, class_id: &str, school_id: &str) -> Result<Value, ActionError> {
    conn.query_row(
        &select_sql("WHERE c.id = ? AND c.school_id = ? AND c.del_flag = 0"),
        (class_id, school_id),
        class_json,
    )
    .optional()?
    .ok_or_else(|| ActionError::not_found("class"))
}

/// Live (non-deleted) students enrolled in a class.
pub fn enrolled_count(conn: &Connection, class_id: &str) -> Result<i64, ActionError> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM students WHERE class_id = ? AND del_flag = 0",
        [class_id],
        |r| r.get(0),
    )?)
}

pub fn class_capacity(conn: &Connection, class_id: &str) -> Result<Option<i64>, ActionError> {
    Ok(conn
        .query_row(
            "SELECT capacity FROM classes WHERE id = ?",
            [class_id],
            |r| r.get::<_, Option<i64>>(0),
        )
        .optional()?
        .flatten())
}

/// Refuses to place `adding` more students into a full class.
pub fn ensure_capacity(conn: &Connection, class_id: &str, adding: i64) -> Result<(), ActionError> {
    if let Some(cap) = class_capacity(conn, class_id)? {
        let current = enrolled_count(conn, class_id)?;
        if current + adding > cap {
            return Err(ActionError::rule(format!(
                "class capacity {cap} would be exceeded ({current} enrolled, adding {adding})"
            )));
        }
    }
    Ok(())
}

fn name_taken(
    conn: &Connection,
    school_id: &str,
    name: &str,
    section: &str,
    except_id: &str,
) -> Result<bool, ActionError> {
    exists(
        conn,
        "SELECT 1 FROM classes
         WHERE school_id = ? AND name = ? COLLATE NOCASE AND section = ? COLLATE NOCASE
           AND del_flag = 0 AND id <> ?",
        (school_id, name, section, except_id),
    )
}

fn classes_list(ctx: &Ctx, params: &Value) -> Result<Value, ActionError> {
    let school = school_ref(ctx.conn, params)?;
    let deleted = if include_deleted(params) { "" } else { "AND c.del_flag = 0" };
    let classes = query_json(
        ctx.conn,
        &select_sql(&format!(
            "WHERE c.school_id = ? {deleted} ORDER BY c.name, c.section"
        )),
        [&school.id],
        class_json,
    )?;
    Ok(json!({ "classes": classes }))
}

fn classes_create(ctx: &Ctx, params: &Value) -> Result<Value, ActionError> {
    let school = school_ref(ctx.conn, params)?;
    let actor = actor_id(ctx.conn, params, Some(&school.id))?;
    let name = required_str(params, "name")?;
    let section = optional_str(params, "section")?.unwrap_or_default();
    let capacity = optional_i64(params, "capacity")?;
    if matches!(capacity, Some(c) if c < 1) {
        return Err(ActionError::invalid("capacity", "capacity must be at least 1"));
    }
    let teacher = optional_str(params, "classTeacherId")?;
    if let Some(t) = &teacher {
        ensure_in_school(ctx.conn, "employees", "class teacher", t, &school.id)?;
    }
    if name_taken(ctx.conn, &school.id, &name, &section, "")? {
        return Err(ActionError::conflict(format!(
            "class {name} {section} already exists"
        )));
    }

    let id = new_id();
    let ts = now();
    ctx.conn.execute(
        "INSERT INTO classes(id, school_id, name, section, capacity, class_teacher_id,
                             created_by, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (&id, &school.id, &name, &section, capacity, &teacher, &actor, &ts, &ts),
    )?;
    tracing::info!(class_id = %id, school_id = %school.id, "class created");
    Ok(json!({ "classId": id, "class": load_class(ctx.conn, &id, &school.id)? }))
}

fn classes_update(ctx: &Ctx, params: &Value) -> Result<Value, ActionError> {
    let school = school_ref(ctx.conn, params)?;
    let actor = actor_id(ctx.conn, params, Some(&school.id))?;
    let class_id = required_str(params, "classId")?;
    let current = load_class(ctx.conn, &class_id, &school.id)?;
    let patch = patch_obj(params)?;

    let mut set = PatchSet::new(patch);
    let name = set.text("name", "name")?;
    // Section is NOT NULL; clearing it stores ''.
    let section = match patch.get("section") {
        None => None,
        Some(Value::Null) => Some(String::new()),
        Some(Value::String(s)) => Some(s.trim().to_string()),
        Some(_) => return Err(ActionError::invalid("section", "section must be a string")),
    };
    if let Some(s) = &section {
        set.push("section", rusqlite::types::Value::Text(s.clone()));
    }
    if name.is_some() || section.is_some() {
        let name = name.unwrap_or_else(|| current["name"].as_str().unwrap_or("").to_string());
        let section = section
            .unwrap_or_else(|| current["section"].as_str().unwrap_or("").to_string());
        if name_taken(ctx.conn, &school.id, &name, &section, &class_id)? {
            return Err(ActionError::conflict(format!(
                "class {name} {section} already exists"
            )));
        }
    }
    if let Some(Some(cap)) = set.nullable_int("capacity", "capacity", 1)? {
        if enrolled_count(ctx.conn, &class_id)? > cap {
            return Err(ActionError::invalid(
                "capacity",
                "capacity is below the number of enrolled students",
            ));
        }
    }
    if let Some(Some(t)) = set.nullable_text("classTeacherId", "class_teacher_id")? {
        ensure_in_school(ctx.conn, "employees", "class teacher", &t, &school.id)?;
    }
    set.apply(ctx.conn, "classes", "class", &class_id, Some(&school.id), &actor)?;
    Ok(json!({ "class": load_class(ctx.conn, &class_id, &school.id)? }))
}

fn classes_delete(ctx: &Ctx, params: &Value) -> Result<Value, ActionError> {
    let school = school_ref(ctx.conn, params)?;
    let actor = actor_id(ctx.conn, params, Some(&school.id))?;
    let class_id = required_str(params, "classId")?;
    ensure_in_school(ctx.conn, "classes", "class", &class_id, &school.id)?;
    let enrolled = enrolled_count(ctx.conn, &class_id)?;
    if enrolled > 0 {
        return Err(ActionError::conflict(format!(
            "class still has {enrolled} enrolled students"
        )));
    }
    soft_delete(ctx.conn, "classes", "class", &class_id, Some(&school.id), &actor)?;
    tracing::info!(%class_id, school_id = %school.id, "class deleted");
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let action: Action = match req.method.as_str() {
        "classes.list" => classes_list,
        "classes.create" => classes_create,
        "classes.update" => classes_update,
        "classes.delete" => classes_delete,
        _ => return None,
    };
    Some(dispatch(state, req, action))
}
