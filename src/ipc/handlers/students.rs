use crate::calc;
use crate::ipc::error::ActionError;
use crate::ipc::helpers::{
    actor_id, dispatch, ensure_in_school, exists, include_deleted, new_id, now, optional_bool,
    optional_i64, optional_str, patch_obj, query_json, required_str, school_ref, soft_delete,
    string_list, today, with_audit, Action, Ctx, PatchSet,
};
use crate::ipc::handlers::classes::ensure_capacity;
use crate::ipc::types::{AppState, Request};
use rusqlite::{types::Value as SqlValue, Connection, OptionalExtension, Row};
use serde_json::{json, Value};

const GENDERS: &[&str] = &["male", "female", "other"];

fn student_json(r: &Row<'_>) -> rusqlite::Result<Value> {
    let first: String = r.get(4)?;
    let last: String = r.get(5)?;
    with_audit(
        json!({
            "id": r.get::<_, String>(0)?,
            "schoolId": r.get::<_, String>(1)?,
            "classId": r.get::<_, String>(2)?,
            "admissionNo": r.get::<_, String>(3)?,
            "displayName": format!("{}, {}", last, first),
            "firstName": first,
            "lastName": last,
            "gender": r.get::<_, Option<String>>(6)?,
            "birthDate": r.get::<_, Option<String>>(7)?,
            "guardianName": r.get::<_, Option<String>>(8)?,
            "guardianPhone": r.get::<_, Option<String>>(9)?,
            "rollNo": r.get::<_, Option<i64>>(10)?,
            "active": r.get::<_, bool>(11)?,
            "className": r.get::<_, Option<String>>(12)?,
        }),
        r,
        13,
    )
}

fn select_sql(filter: &str) -> String {
    format!(
        "SELECT s.id, s.school_id, s.class_id, s.admission_no, s.first_name, s.last_name,
           s.gender, s.birth_date, s.guardian_name, s.guardian_phone, s.roll_no, s.active,
           TRIM(c.name || ' ' || c.section),
           s.mod_flag, s.del_flag, s.created_by, s.modified_by, s.action_type,
           s.created_at, s.updated_at
         FROM students s
         LEFT JOIN classes c ON c.id = s.class_id
         {filter}"
    )
}

fn load_student(conn: &Connection, student_id: &str, school_id: &str) -> Result<Value, ActionError> {
    conn.query_row(
        &select_sql("WHERE s.id = ? AND s.school_id = ? AND s.del_flag = 0"),
        (student_id, school_id),
        student_json,
    )
    .optional()?
    .ok_or_else(|| ActionError::not_found("student"))
}

fn admission_taken(
    conn: &Connection,
    school_id: &str,
    admission_no: &str,
    except_id: &str,
) -> Result<bool, ActionError> {
    exists(
        conn,
        "SELECT 1 FROM students
         WHERE school_id = ? AND admission_no = ? COLLATE NOCASE AND del_flag = 0 AND id <> ?",
        (school_id, admission_no, except_id),
    )
}

fn check_gender(v: Option<&str>) -> Result<(), ActionError> {
    match v {
        Some(g) if !GENDERS.contains(&g) => Err(ActionError::invalid(
            "gender",
            "gender must be one of: male, female, other",
        )),
        _ => Ok(()),
    }
}

fn check_birth_date(v: Option<&str>) -> Result<(), ActionError> {
    if let Some(d) = v {
        let parsed = calc::parse_date(d)
            .ok_or_else(|| ActionError::invalid("birthDate", "birthDate must be YYYY-MM-DD"))?;
        if parsed > today() {
            return Err(ActionError::invalid("birthDate", "birthDate is in the future"));
        }
    }
    Ok(())
}

fn students_list(ctx: &Ctx, params: &Value) -> Result<Value, ActionError> {
    let school = school_ref(ctx.conn, params)?;
    let mut filter = String::from("WHERE s.school_id = ?");
    let mut values: Vec<SqlValue> = vec![SqlValue::Text(school.id.clone())];
    if !include_deleted(params) {
        filter.push_str(" AND s.del_flag = 0");
    }
    if let Some(class_id) = optional_str(params, "classId")? {
        filter.push_str(" AND s.class_id = ?");
        values.push(SqlValue::Text(class_id));
    }
    if let Some(search) = optional_str(params, "search")? {
        filter.push_str(
            " AND (s.first_name LIKE ? OR s.last_name LIKE ? OR s.admission_no LIKE ?)",
        );
        let pattern = format!("%{}%", search.replace('%', "").replace('_', ""));
        for _ in 0..3 {
            values.push(SqlValue::Text(pattern.clone()));
        }
    }
    filter.push_str(
        " ORDER BY c.name, c.section, s.roll_no IS NULL, s.roll_no, s.last_name, s.first_name",
    );
    let students = query_json(
        ctx.conn,
        &select_sql(&filter),
        rusqlite::params_from_iter(values),
        student_json,
    )?;
    Ok(json!({ "students": students }))
}

fn students_get(ctx: &Ctx, params: &Value) -> Result<Value, ActionError> {
    let school = school_ref(ctx.conn, params)?;
    let student_id = required_str(params, "studentId")?;
    Ok(json!({ "student": load_student(ctx.conn, &student_id, &school.id)? }))
}

fn students_create(ctx: &Ctx, params: &Value) -> Result<Value, ActionError> {
    let school = school_ref(ctx.conn, params)?;
    let actor = actor_id(ctx.conn, params, Some(&school.id))?;
    let class_id = required_str(params, "classId")?;
    ensure_in_school(ctx.conn, "classes", "class", &class_id, &school.id)?;
    let admission_no = required_str(params, "admissionNo")?;
    let first_name = required_str(params, "firstName")?;
    let last_name = required_str(params, "lastName")?;
    let gender = optional_str(params, "gender")?.map(|g| g.to_ascii_lowercase());
    check_gender(gender.as_deref())?;
    let birth_date = optional_str(params, "birthDate")?;
    check_birth_date(birth_date.as_deref())?;
    let roll_no = optional_i64(params, "rollNo")?;
    if matches!(roll_no, Some(r) if r < 1) {
        return Err(ActionError::invalid("rollNo", "rollNo must be at least 1"));
    }
    if admission_taken(ctx.conn, &school.id, &admission_no, "")? {
        return Err(ActionError::conflict(format!(
            "admission number {admission_no} is already in use"
        )));
    }
    ensure_capacity(ctx.conn, &class_id, 1)?;

    let id = new_id();
    let ts = now();
    ctx.conn.execute(
        "INSERT INTO students(id, school_id, class_id, admission_no, first_name, last_name,
                              gender, birth_date, guardian_name, guardian_phone, roll_no, active,
                              created_by, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            &school.id,
            &class_id,
            &admission_no,
            &first_name,
            &last_name,
            &gender,
            &birth_date,
            optional_str(params, "guardianName")?,
            optional_str(params, "guardianPhone")?,
            roll_no,
            optional_bool(params, "active")?.unwrap_or(true),
            &actor,
            &ts,
            &ts,
        ),
    )?;
    tracing::info!(student_id = %id, school_id = %school.id, %class_id, "student created");
    Ok(json!({ "studentId": id, "student": load_student(ctx.conn, &id, &school.id)? }))
}

fn students_update(ctx: &Ctx, params: &Value) -> Result<Value, ActionError> {
    let school = school_ref(ctx.conn, params)?;
    let actor = actor_id(ctx.conn, params, Some(&school.id))?;
    let student_id = required_str(params, "studentId")?;
    let current = load_student(ctx.conn, &student_id, &school.id)?;
    let patch = patch_obj(params)?;

    let mut set = PatchSet::new(patch);
    if let Some(admission_no) = set.text("admissionNo", "admission_no")? {
        if admission_taken(ctx.conn, &school.id, &admission_no, &student_id)? {
            return Err(ActionError::conflict(format!(
                "admission number {admission_no} is already in use"
            )));
        }
    }
    set.text("firstName", "first_name")?;
    set.text("lastName", "last_name")?;
    match set.nullable_text("classId", "class_id")? {
        Some(Some(class_id)) => {
            ensure_in_school(ctx.conn, "classes", "class", &class_id, &school.id)?;
            if current["classId"].as_str() != Some(class_id.as_str()) {
                ensure_capacity(ctx.conn, &class_id, 1)?;
            }
        }
        Some(None) => {
            return Err(ActionError::invalid("classId", "classId must not be empty"));
        }
        None => {}
    }
    if let Some(gender) = patch.get("gender") {
        let g = match gender {
            Value::Null => None,
            Value::String(s) if s.trim().is_empty() => None,
            Value::String(s) => Some(s.trim().to_ascii_lowercase()),
            _ => return Err(ActionError::invalid("gender", "gender must be a string")),
        };
        check_gender(g.as_deref())?;
        set.push("gender", g.map(SqlValue::Text).unwrap_or(SqlValue::Null));
    }
    if let Some(Some(d)) = set.nullable_text("birthDate", "birth_date")? {
        check_birth_date(Some(&d))?;
    }
    set.nullable_text("guardianName", "guardian_name")?;
    set.nullable_text("guardianPhone", "guardian_phone")?;
    set.nullable_int("rollNo", "roll_no", 1)?;
    set.flag("active", "active")?;
    set.apply(ctx.conn, "students", "student", &student_id, Some(&school.id), &actor)?;
    Ok(json!({ "student": load_student(ctx.conn, &student_id, &school.id)? }))
}

fn students_delete(ctx: &Ctx, params: &Value) -> Result<Value, ActionError> {
    let school = school_ref(ctx.conn, params)?;
    let actor = actor_id(ctx.conn, params, Some(&school.id))?;
    let student_id = required_str(params, "studentId")?;
    soft_delete(ctx.conn, "students", "student", &student_id, Some(&school.id), &actor)?;
    tracing::info!(%student_id, school_id = %school.id, "student deleted");
    Ok(json!({ "ok": true }))
}

fn students_promote(ctx: &Ctx, params: &Value) -> Result<Value, ActionError> {
    let school = school_ref(ctx.conn, params)?;
    let actor = actor_id(ctx.conn, params, Some(&school.id))?;
    let from_class = required_str(params, "fromClassId")?;
    let to_class = required_str(params, "toClassId")?;
    if from_class == to_class {
        return Err(ActionError::invalid("toClassId", "toClassId must differ from fromClassId"));
    }
    ensure_in_school(ctx.conn, "classes", "class", &from_class, &school.id)?;
    ensure_in_school(ctx.conn, "classes", "class", &to_class, &school.id)?;

    let candidates: Vec<String> = {
        let mut stmt = ctx.conn.prepare(
            "SELECT id FROM students
             WHERE class_id = ? AND school_id = ? AND del_flag = 0 AND active = 1",
        )?;
        let rows = stmt.query_map((&from_class, &school.id), |r| r.get::<_, String>(0))?;
        rows.collect::<Result<Vec<_>, _>>()?
    };
    let selected: Vec<String> = match string_list(params, "studentIds")? {
        None => candidates,
        Some(ids) => {
            let mut unique: Vec<String> = Vec::with_capacity(ids.len());
            for id in ids {
                if !candidates.contains(&id) {
                    return Err(ActionError::invalid(
                        "studentIds",
                        format!("student {id} is not an active member of the source class"),
                    ));
                }
                if !unique.contains(&id) {
                    unique.push(id);
                }
            }
            unique
        }
    };
    ensure_capacity(ctx.conn, &to_class, selected.len() as i64)?;

    let tx = ctx.conn.unchecked_transaction()?;
    let ts = now();
    for id in &selected {
        tx.execute(
            "UPDATE students
             SET class_id = ?, roll_no = NULL, mod_flag = 1, action_type = 'update',
                 modified_by = ?, updated_at = ?
             WHERE id = ?",
            (&to_class, &actor, &ts, id),
        )?;
    }
    tx.commit()?;
    tracing::info!(school_id = %school.id, %from_class, %to_class, moved = selected.len(), "students promoted");
    Ok(json!({ "moved": selected.len(), "studentIds": selected }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let action: Action = match req.method.as_str() {
        "students.list" => students_list,
        "students.get" => students_get,
        "students.create" => students_create,
        "students.update" => students_update,
        "students.delete" => students_delete,
        "students.promote" => students_promote,
        _ => return None,
    };
    Some(dispatch(state, req, action))
}
