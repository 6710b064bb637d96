use chrono::NaiveDate;
use rusqlite::{params_from_iter, types::Value as SqlValue, Connection, OptionalExtension, Row};
use serde_json::{json, Map, Value};

use crate::calc;
use crate::config::Settings;
use crate::ipc::error::{ok, ActionError};
use crate::ipc::types::{AppState, Request};

pub const SYSTEM_ACTOR: &str = "system";

pub struct Ctx<'a> {
    pub conn: &'a Connection,
    pub settings: &'a Settings,
}

pub type Action = fn(&Ctx, &Value) -> Result<Value, ActionError>;

/// Runs an action against the open workspace and wraps the outcome.
pub fn dispatch(state: &AppState, req: &Request, action: Action) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return ActionError::NoWorkspace.response(&req.id);
    };
    let ctx = Ctx {
        conn,
        settings: &state.settings,
    };
    match action(&ctx, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(e) => {
            tracing::warn!(method = %req.method, id = %req.id, code = e.code(), error = %e, "action failed");
            e.response(&req.id)
        }
    }
}

pub fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn required_str(params: &Value, key: &str) -> Result<String, ActionError> {
    match params.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        Some(Value::String(_)) => Err(ActionError::invalid(key, format!("{key} must not be empty"))),
        None | Some(Value::Null) => Err(ActionError::bad_params(format!("missing {key}"))),
        Some(_) => Err(ActionError::bad_params(format!("{key} must be a string"))),
    }
}

pub fn optional_str(params: &Value, key: &str) -> Result<Option<String>, ActionError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => {
            let t = s.trim();
            Ok(if t.is_empty() { None } else { Some(t.to_string()) })
        }
        Some(_) => Err(ActionError::bad_params(format!("{key} must be a string"))),
    }
}

pub fn optional_f64(params: &Value, key: &str) -> Result<Option<f64>, ActionError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_f64()
            .filter(|f| f.is_finite())
            .map(Some)
            .ok_or_else(|| ActionError::invalid(key, format!("{key} must be a number"))),
    }
}

pub fn required_f64(params: &Value, key: &str) -> Result<f64, ActionError> {
    optional_f64(params, key)?.ok_or_else(|| ActionError::bad_params(format!("missing {key}")))
}

pub fn optional_i64(params: &Value, key: &str) -> Result<Option<i64>, ActionError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| ActionError::invalid(key, format!("{key} must be an integer"))),
    }
}

pub fn optional_bool(params: &Value, key: &str) -> Result<Option<bool>, ActionError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(ActionError::bad_params(format!("{key} must be a boolean"))),
    }
}

pub fn required_date(params: &Value, key: &str) -> Result<NaiveDate, ActionError> {
    let raw = required_str(params, key)?;
    calc::parse_date(&raw).ok_or_else(|| ActionError::invalid(key, format!("{key} must be YYYY-MM-DD")))
}

pub fn optional_date(params: &Value, key: &str) -> Result<Option<NaiveDate>, ActionError> {
    match optional_str(params, key)? {
        None => Ok(None),
        Some(raw) => calc::parse_date(&raw)
            .map(Some)
            .ok_or_else(|| ActionError::invalid(key, format!("{key} must be YYYY-MM-DD"))),
    }
}

pub fn required_month(params: &Value, key: &str) -> Result<(i32, u32), ActionError> {
    let raw = required_str(params, key)?;
    calc::parse_month(&raw).ok_or_else(|| ActionError::invalid(key, format!("{key} must be YYYY-MM")))
}

pub fn string_list(params: &Value, key: &str) -> Result<Option<Vec<String>>, ActionError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(|s| s.to_string())
                    .ok_or_else(|| ActionError::bad_params(format!("{key} must contain strings")))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some),
        Some(_) => Err(ActionError::bad_params(format!("{key} must be an array"))),
    }
}

pub fn include_deleted(params: &Value) -> bool {
    params
        .get("includeDeleted")
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}

pub fn patch_obj(params: &Value) -> Result<&Map<String, Value>, ActionError> {
    params
        .get("patch")
        .and_then(|v| v.as_object())
        .ok_or_else(|| ActionError::bad_params("missing patch"))
}

#[derive(Debug, Clone)]
pub struct SchoolRef {
    pub id: String,
    pub academic_year_start_month: u32,
}

/// Resolves `params.schoolId` to an active tenant.
pub fn school_ref(conn: &Connection, params: &Value) -> Result<SchoolRef, ActionError> {
    let school_id = required_str(params, "schoolId")?;
    let start: Option<i64> = conn
        .query_row(
            "SELECT academic_year_start_month FROM schools WHERE id = ? AND del_flag = 0",
            [&school_id],
            |r| r.get(0),
        )
        .optional()?;
    let Some(start) = start else {
        return Err(ActionError::not_found("school"));
    };
    Ok(SchoolRef {
        id: school_id,
        academic_year_start_month: start.clamp(1, 12) as u32,
    })
}

/// Resolves the tenant that owns `id` in `table`. A `params.schoolId` that
/// names a different school reports the record as missing.
pub fn owning_school(
    conn: &Connection,
    params: &Value,
    table: &str,
    entity: &str,
    id: &str,
) -> Result<SchoolRef, ActionError> {
    let sql = format!(
        "SELECT s.id, s.academic_year_start_month FROM {table} t
         JOIN schools s ON s.id = t.school_id
         WHERE t.id = ? AND s.del_flag = 0"
    );
    let row: Option<(String, i64)> = conn
        .query_row(&sql, [id], |r| Ok((r.get(0)?, r.get(1)?)))
        .optional()?;
    let Some((school_id, start)) = row else {
        return Err(ActionError::not_found(entity));
    };
    if let Some(given) = optional_str(params, "schoolId")? {
        if given != school_id {
            return Err(ActionError::not_found(entity));
        }
    }
    Ok(SchoolRef {
        id: school_id,
        academic_year_start_month: start.clamp(1, 12) as u32,
    })
}

/// Validates `params.actorId` (when given) against the tenant and returns the
/// id stamped into audit columns.
pub fn actor_id(
    conn: &Connection,
    params: &Value,
    school_id: Option<&str>,
) -> Result<String, ActionError> {
    let Some(actor) = optional_str(params, "actorId")? else {
        return Ok(SYSTEM_ACTOR.to_string());
    };
    let row: Option<(Option<String>, bool, bool)> = conn
        .query_row(
            "SELECT school_id, is_super_admin, active FROM users WHERE id = ? AND del_flag = 0",
            [&actor],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?;
    let Some((user_school, is_super_admin, active)) = row else {
        return Err(ActionError::Forbidden("unknown actor".to_string()));
    };
    if !active {
        return Err(ActionError::Forbidden("actor is inactive".to_string()));
    }
    if is_super_admin {
        return Ok(actor);
    }
    match school_id {
        Some(s) if user_school.as_deref() != Some(s) => Err(ActionError::Forbidden(
            "actor belongs to another school".to_string(),
        )),
        _ => Ok(actor),
    }
}

pub fn exists<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<bool, ActionError> {
    Ok(conn
        .query_row(sql, params, |r| r.get::<_, i64>(0))
        .optional()?
        .is_some())
}

/// Fails with `not_found` unless `id` is a live row of `table` in the school.
pub fn ensure_in_school(
    conn: &Connection,
    table: &str,
    entity: &str,
    id: &str,
    school_id: &str,
) -> Result<(), ActionError> {
    let sql = format!("SELECT 1 FROM {table} WHERE id = ? AND school_id = ? AND del_flag = 0");
    if exists(conn, &sql, (id, school_id))? {
        Ok(())
    } else {
        Err(ActionError::not_found(entity))
    }
}

pub fn query_json<P, F>(
    conn: &Connection,
    sql: &str,
    params: P,
    f: F,
) -> Result<Vec<Value>, ActionError>
where
    P: rusqlite::Params,
    F: FnMut(&Row<'_>) -> rusqlite::Result<Value>,
{
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, f)?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

pub const AUDIT_COLS: &str =
    "mod_flag, del_flag, created_by, modified_by, action_type, created_at, updated_at";

/// Reads the `AUDIT_COLS` block starting at column `start` into `obj`.
pub fn with_audit(mut obj: Value, r: &Row<'_>, start: usize) -> rusqlite::Result<Value> {
    let audit = json!({
        "modFlag": r.get::<_, bool>(start)?,
        "delFlag": r.get::<_, bool>(start + 1)?,
        "createdBy": r.get::<_, String>(start + 2)?,
        "modifiedBy": r.get::<_, Option<String>>(start + 3)?,
        "actionType": r.get::<_, String>(start + 4)?,
        "createdAt": r.get::<_, String>(start + 5)?,
        "updatedAt": r.get::<_, String>(start + 6)?,
    });
    if let (Some(dst), Value::Object(src)) = (obj.as_object_mut(), audit) {
        dst.extend(src);
    }
    Ok(obj)
}

/// Soft-deletes a live row, stamping the audit columns.
pub fn soft_delete(
    conn: &Connection,
    table: &str,
    entity: &str,
    id: &str,
    school_id: Option<&str>,
    actor: &str,
) -> Result<(), ActionError> {
    let ts = now();
    let changed = match school_id {
        Some(s) => conn.execute(
            &format!(
                "UPDATE {table}
                 SET del_flag = 1, action_type = 'delete', modified_by = ?, updated_at = ?
                 WHERE id = ? AND school_id = ? AND del_flag = 0"
            ),
            (actor, &ts, id, s),
        )?,
        None => conn.execute(
            &format!(
                "UPDATE {table}
                 SET del_flag = 1, action_type = 'delete', modified_by = ?, updated_at = ?
                 WHERE id = ? AND del_flag = 0"
            ),
            (actor, &ts, id),
        )?,
    };
    if changed == 0 {
        return Err(ActionError::not_found(entity));
    }
    Ok(())
}

/// Column assignments collected from a `patch` object.
pub struct PatchSet<'a> {
    src: &'a Map<String, Value>,
    sets: Vec<(&'static str, SqlValue)>,
}

impl<'a> PatchSet<'a> {
    pub fn new(src: &'a Map<String, Value>) -> Self {
        Self {
            src,
            sets: Vec::new(),
        }
    }

    pub fn has(&self, key: &str) -> bool {
        self.src.contains_key(key)
    }

    /// Non-empty text column.
    pub fn text(&mut self, key: &str, col: &'static str) -> Result<Option<String>, ActionError> {
        match self.src.get(key) {
            None => Ok(None),
            Some(Value::String(s)) if !s.trim().is_empty() => {
                let t = s.trim().to_string();
                self.sets.push((col, SqlValue::Text(t.clone())));
                Ok(Some(t))
            }
            Some(_) => Err(ActionError::invalid(key, format!("{key} must be a non-empty string"))),
        }
    }

    /// Nullable text column; null or empty clears it.
    pub fn nullable_text(
        &mut self,
        key: &str,
        col: &'static str,
    ) -> Result<Option<Option<String>>, ActionError> {
        match self.src.get(key) {
            None => Ok(None),
            Some(Value::Null) => {
                self.sets.push((col, SqlValue::Null));
                Ok(Some(None))
            }
            Some(Value::String(s)) => {
                let t = s.trim();
                if t.is_empty() {
                    self.sets.push((col, SqlValue::Null));
                    Ok(Some(None))
                } else {
                    self.sets.push((col, SqlValue::Text(t.to_string())));
                    Ok(Some(Some(t.to_string())))
                }
            }
            Some(_) => Err(ActionError::invalid(key, format!("{key} must be a string or null"))),
        }
    }

    pub fn real(
        &mut self,
        key: &str,
        col: &'static str,
        min: f64,
    ) -> Result<Option<f64>, ActionError> {
        match self.src.get(key) {
            None => Ok(None),
            Some(v) => {
                let f = v
                    .as_f64()
                    .filter(|f| f.is_finite())
                    .ok_or_else(|| ActionError::invalid(key, format!("{key} must be a number")))?;
                if f < min {
                    return Err(ActionError::invalid(key, format!("{key} must be at least {min}")));
                }
                self.sets.push((col, SqlValue::Real(f)));
                Ok(Some(f))
            }
        }
    }

    pub fn nullable_int(
        &mut self,
        key: &str,
        col: &'static str,
        min: i64,
    ) -> Result<Option<Option<i64>>, ActionError> {
        match self.src.get(key) {
            None => Ok(None),
            Some(Value::Null) => {
                self.sets.push((col, SqlValue::Null));
                Ok(Some(None))
            }
            Some(v) => {
                let i = v
                    .as_i64()
                    .ok_or_else(|| ActionError::invalid(key, format!("{key} must be an integer")))?;
                if i < min {
                    return Err(ActionError::invalid(key, format!("{key} must be at least {min}")));
                }
                self.sets.push((col, SqlValue::Integer(i)));
                Ok(Some(Some(i)))
            }
        }
    }

    pub fn flag(&mut self, key: &str, col: &'static str) -> Result<Option<bool>, ActionError> {
        match self.src.get(key) {
            None => Ok(None),
            Some(Value::Bool(b)) => {
                self.sets.push((col, SqlValue::Integer(*b as i64)));
                Ok(Some(*b))
            }
            Some(_) => Err(ActionError::invalid(key, format!("{key} must be a boolean"))),
        }
    }

    pub fn push(&mut self, col: &'static str, value: SqlValue) {
        self.sets.push((col, value));
    }

    /// Applies the assignments to a live row and marks it modified.
    pub fn apply(
        self,
        conn: &Connection,
        table: &str,
        entity: &str,
        id: &str,
        school_id: Option<&str>,
        actor: &str,
    ) -> Result<(), ActionError> {
        if self.sets.is_empty() {
            return Err(ActionError::bad_params("patch has no recognised fields"));
        }
        let mut assignments: Vec<String> =
            self.sets.iter().map(|(c, _)| format!("{c} = ?")).collect();
        assignments.push("mod_flag = 1".to_string());
        assignments.push("action_type = 'update'".to_string());
        assignments.push("modified_by = ?".to_string());
        assignments.push("updated_at = ?".to_string());

        let mut values: Vec<SqlValue> = self.sets.into_iter().map(|(_, v)| v).collect();
        values.push(SqlValue::Text(actor.to_string()));
        values.push(SqlValue::Text(now()));
        values.push(SqlValue::Text(id.to_string()));

        let mut sql = format!(
            "UPDATE {table} SET {} WHERE id = ? AND del_flag = 0",
            assignments.join(", ")
        );
        if let Some(s) = school_id {
            sql.push_str(" AND school_id = ?");
            values.push(SqlValue::Text(s.to_string()));
        }
        let changed = conn.execute(&sql, params_from_iter(values))?;
        if changed == 0 {
            return Err(ActionError::not_found(entity));
        }
        Ok(())
    }
}
