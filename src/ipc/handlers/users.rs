use crate::auth;
use crate::ipc::error::{ok, ActionError};
use crate::ipc::helpers::{
    actor_id, dispatch, ensure_in_school, exists, include_deleted, new_id, now, optional_bool,
    optional_str, patch_obj, query_json, required_str, school_ref, soft_delete, with_audit,
    Action, Ctx, PatchSet, AUDIT_COLS,
};
use crate::ipc::types::{AppState, Request};
use crate::nav::{self, RoleFlags};
use rusqlite::{types::Value as SqlValue, Connection, OptionalExtension, Row};
use serde_json::{json, Value};

const USER_COLS: &str = "id, school_id, username, display_name,
    is_super_admin, is_admin, is_teacher, is_accountant, is_inventory_manager, is_student, is_parent,
    student_id, employee_id, active, last_login_at";

fn roles_from_row(r: &Row<'_>, start: usize) -> rusqlite::Result<RoleFlags> {
    Ok(RoleFlags {
        is_super_admin: r.get(start)?,
        is_admin: r.get(start + 1)?,
        is_teacher: r.get(start + 2)?,
        is_accountant: r.get(start + 3)?,
        is_inventory_manager: r.get(start + 4)?,
        is_student: r.get(start + 5)?,
        is_parent: r.get(start + 6)?,
    })
}

fn user_json(r: &Row<'_>) -> rusqlite::Result<Value> {
    let roles = roles_from_row(r, 4)?;
    with_audit(
        json!({
            "id": r.get::<_, String>(0)?,
            "schoolId": r.get::<_, Option<String>>(1)?,
            "username": r.get::<_, String>(2)?,
            "displayName": r.get::<_, String>(3)?,
            "roles": roles,
            "studentId": r.get::<_, Option<String>>(11)?,
            "employeeId": r.get::<_, Option<String>>(12)?,
            "active": r.get::<_, bool>(13)?,
            "lastLoginAt": r.get::<_, Option<String>>(14)?,
        }),
        r,
        15,
    )
}

fn load_user(conn: &Connection, user_id: &str) -> Result<Value, ActionError> {
    conn.query_row(
        &format!("SELECT {USER_COLS}, {AUDIT_COLS} FROM users WHERE id = ? AND del_flag = 0"),
        [user_id],
        user_json,
    )
    .optional()?
    .ok_or_else(|| ActionError::not_found("user"))
}

/// Role flags of a live user.
pub fn user_roles(conn: &Connection, user_id: &str) -> Result<RoleFlags, ActionError> {
    conn.query_row(
        "SELECT is_super_admin, is_admin, is_teacher, is_accountant, is_inventory_manager,
                is_student, is_parent
         FROM users WHERE id = ? AND del_flag = 0",
        [user_id],
        |r| roles_from_row(r, 0),
    )
    .optional()?
    .ok_or_else(|| ActionError::not_found("user"))
}

fn parse_roles(params: &Value) -> Result<RoleFlags, ActionError> {
    match params.get("roles") {
        None | Some(Value::Null) => Ok(RoleFlags::default()),
        Some(v) => serde_json::from_value(v.clone())
            .map_err(|e| ActionError::invalid("roles", format!("invalid roles: {e}"))),
    }
}

fn check_password(password: &str) -> Result<(), ActionError> {
    if password.chars().count() < auth::MIN_PASSWORD_LEN {
        return Err(ActionError::invalid(
            "password",
            format!("password must be at least {} characters", auth::MIN_PASSWORD_LEN),
        ));
    }
    Ok(())
}

fn username_taken(conn: &Connection, username: &str, except_id: &str) -> Result<bool, ActionError> {
    exists(
        conn,
        "SELECT 1 FROM users WHERE username = ? COLLATE NOCASE AND del_flag = 0 AND id <> ?",
        (username, except_id),
    )
}

fn users_create(ctx: &Ctx, params: &Value) -> Result<Value, ActionError> {
    let roles = parse_roles(params)?;
    if !roles.any() {
        return Err(ActionError::invalid("roles", "at least one role is required"));
    }
    let school_id = if roles.is_super_admin {
        match optional_str(params, "schoolId")? {
            Some(_) => Some(school_ref(ctx.conn, params)?.id),
            None => None,
        }
    } else {
        Some(school_ref(ctx.conn, params)?.id)
    };
    let actor = actor_id(ctx.conn, params, school_id.as_deref())?;
    let username = required_str(params, "username")?.to_ascii_lowercase();
    let password = params
        .get("password")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ActionError::bad_params("missing password"))?;
    check_password(password)?;
    let display_name = required_str(params, "displayName")?;
    if username_taken(ctx.conn, &username, "")? {
        return Err(ActionError::conflict(format!("username {username} is taken")));
    }

    let student_id = optional_str(params, "studentId")?;
    let employee_id = optional_str(params, "employeeId")?;
    if let (Some(sid), Some(school)) = (&student_id, &school_id) {
        ensure_in_school(ctx.conn, "students", "student", sid, school)?;
    }
    if let (Some(eid), Some(school)) = (&employee_id, &school_id) {
        ensure_in_school(ctx.conn, "employees", "employee", eid, school)?;
    }

    let id = new_id();
    let salt = auth::new_salt();
    let hash = auth::hash_password(&salt, password);
    let ts = now();
    ctx.conn.execute(
        "INSERT INTO users(id, school_id, username, password_hash, password_salt, display_name,
                           is_super_admin, is_admin, is_teacher, is_accountant,
                           is_inventory_manager, is_student, is_parent,
                           student_id, employee_id, active, created_by, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            id,
            school_id,
            username,
            hash,
            salt,
            display_name,
            roles.is_super_admin,
            roles.is_admin,
            roles.is_teacher,
            roles.is_accountant,
            roles.is_inventory_manager,
            roles.is_student,
            roles.is_parent,
            student_id,
            employee_id,
            optional_bool(params, "active")?.unwrap_or(true),
            actor,
            ts,
            ts,
        ],
    )?;
    tracing::info!(user_id = %id, %username, "user created");
    Ok(json!({ "userId": id, "user": load_user(ctx.conn, &id)? }))
}

fn users_list(ctx: &Ctx, params: &Value) -> Result<Value, ActionError> {
    let school = school_ref(ctx.conn, params)?;
    let deleted = if include_deleted(params) { "" } else { "AND del_flag = 0" };
    let users = query_json(
        ctx.conn,
        &format!(
            "SELECT {USER_COLS}, {AUDIT_COLS} FROM users
             WHERE school_id = ? {deleted}
             ORDER BY display_name, username"
        ),
        [&school.id],
        user_json,
    )?;
    Ok(json!({ "users": users }))
}

fn user_school(conn: &Connection, user_id: &str) -> Result<Option<String>, ActionError> {
    conn.query_row(
        "SELECT school_id FROM users WHERE id = ? AND del_flag = 0",
        [user_id],
        |r| r.get::<_, Option<String>>(0),
    )
    .optional()?
    .ok_or_else(|| ActionError::not_found("user"))
}

fn users_update(ctx: &Ctx, params: &Value) -> Result<Value, ActionError> {
    let user_id = required_str(params, "userId")?;
    let school_id = user_school(ctx.conn, &user_id)?;
    let actor = actor_id(ctx.conn, params, school_id.as_deref())?;
    let patch = patch_obj(params)?;

    let mut set = PatchSet::new(patch);
    set.text("displayName", "display_name")?;
    set.flag("active", "active")?;
    if let Some(Some(sid)) = set.nullable_text("studentId", "student_id")? {
        if let Some(school) = &school_id {
            ensure_in_school(ctx.conn, "students", "student", &sid, school)?;
        }
    }
    if let Some(Some(eid)) = set.nullable_text("employeeId", "employee_id")? {
        if let Some(school) = &school_id {
            ensure_in_school(ctx.conn, "employees", "employee", &eid, school)?;
        }
    }
    if let Some(v) = patch.get("roles") {
        let roles: RoleFlags = serde_json::from_value(v.clone())
            .map_err(|e| ActionError::invalid("roles", format!("invalid roles: {e}")))?;
        if !roles.any() {
            return Err(ActionError::invalid("roles", "at least one role is required"));
        }
        if school_id.is_none() && !roles.is_super_admin {
            return Err(ActionError::invalid(
                "roles",
                "a user without a school must stay a super admin",
            ));
        }
        for (col, on) in [
            ("is_super_admin", roles.is_super_admin),
            ("is_admin", roles.is_admin),
            ("is_teacher", roles.is_teacher),
            ("is_accountant", roles.is_accountant),
            ("is_inventory_manager", roles.is_inventory_manager),
            ("is_student", roles.is_student),
            ("is_parent", roles.is_parent),
        ] {
            set.push(col, SqlValue::Integer(on as i64));
        }
    }
    if let Some(v) = patch.get("password") {
        let password = v
            .as_str()
            .ok_or_else(|| ActionError::invalid("password", "password must be a string"))?;
        check_password(password)?;
        let salt = auth::new_salt();
        set.push("password_hash", SqlValue::Text(auth::hash_password(&salt, password)));
        set.push("password_salt", SqlValue::Text(salt));
    }
    set.apply(ctx.conn, "users", "user", &user_id, None, &actor)?;
    Ok(json!({ "user": load_user(ctx.conn, &user_id)? }))
}

fn users_delete(ctx: &Ctx, params: &Value) -> Result<Value, ActionError> {
    let user_id = required_str(params, "userId")?;
    let school_id = user_school(ctx.conn, &user_id)?;
    let actor = actor_id(ctx.conn, params, school_id.as_deref())?;
    soft_delete(ctx.conn, "users", "user", &user_id, None, &actor)?;
    Ok(json!({ "ok": true }))
}

fn auth_login(ctx: &Ctx, params: &Value) -> Result<Value, ActionError> {
    let username = required_str(params, "username")?.to_ascii_lowercase();
    let password = params
        .get("password")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ActionError::bad_params("missing password"))?;

    let row: Option<(String, String, String, bool)> = ctx
        .conn
        .query_row(
            "SELECT id, password_salt, password_hash, active
             FROM users WHERE username = ? COLLATE NOCASE AND del_flag = 0",
            [&username],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()?;
    let Some((user_id, salt, hash, active)) = row else {
        tracing::warn!(%username, "login for unknown user");
        return Err(ActionError::Unauthorized("invalid username or password".to_string()));
    };
    if !auth::verify_password(&salt, password, &hash) {
        tracing::warn!(%username, "login with wrong password");
        return Err(ActionError::Unauthorized("invalid username or password".to_string()));
    }
    if !active {
        return Err(ActionError::Unauthorized("account is inactive".to_string()));
    }

    ctx.conn.execute(
        "UPDATE users SET last_login_at = ? WHERE id = ?",
        (now(), &user_id),
    )?;
    let roles = user_roles(ctx.conn, &user_id)?;
    tracing::info!(%user_id, "user logged in");
    Ok(json!({
        "user": load_user(ctx.conn, &user_id)?,
        "roles": roles,
        "menu": nav::menu_for(&roles),
    }))
}

fn nav_menu_for_user(ctx: &Ctx, params: &Value) -> Result<Value, ActionError> {
    let user_id = required_str(params, "userId")?;
    let roles = user_roles(ctx.conn, &user_id)?;
    Ok(json!({ "roles": roles, "menu": nav::menu_for(&roles) }))
}

/// Menus for explicit role flags need no workspace.
fn handle_nav_menu(state: &mut AppState, req: &Request) -> Value {
    if req.params.get("userId").is_some() {
        return dispatch(state, req, nav_menu_for_user);
    }
    match parse_roles(&req.params) {
        Ok(roles) => ok(
            &req.id,
            json!({ "roles": roles, "menu": nav::menu_for(&roles) }),
        ),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let action: Action = match req.method.as_str() {
        "users.list" => users_list,
        "users.create" => users_create,
        "users.update" => users_update,
        "users.delete" => users_delete,
        "auth.login" => auth_login,
        "nav.menu" => return Some(handle_nav_menu(state, req)),
        _ => return None,
    };
    Some(dispatch(state, req, action))
}
