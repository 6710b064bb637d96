use crate::ipc::error::ActionError;
use crate::ipc::handlers::users::user_roles;
use crate::ipc::helpers::{
    actor_id, dispatch, ensure_in_school, new_id, now, optional_str, owning_school, query_json,
    required_str, school_ref, soft_delete, with_audit, Action, Ctx,
};
use crate::ipc::types::{AppState, Request};
use crate::nav::Role;
use rusqlite::{types::Value as SqlValue, Connection, OptionalExtension, Row};
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Audience {
    All,
    Role,
    Class,
    User,
}

impl Audience {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Some(Self::All),
            "role" => Some(Self::Role),
            "class" => Some(Self::Class),
            "user" => Some(Self::User),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Role => "role",
            Self::Class => "class",
            Self::User => "user",
        }
    }
}

/// Fails unless `user_id` is a live user of the school (super admins belong everywhere).
fn ensure_school_user(conn: &Connection, user_id: &str, school_id: &str) -> Result<(), ActionError> {
    let row: Option<(Option<String>, bool)> = conn
        .query_row(
            "SELECT school_id, is_super_admin FROM users WHERE id = ? AND del_flag = 0",
            [user_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    match row {
        Some((_, true)) => Ok(()),
        Some((Some(s), false)) if s == school_id => Ok(()),
        _ => Err(ActionError::not_found("user")),
    }
}

fn message_json(r: &Row<'_>) -> rusqlite::Result<Value> {
    with_audit(
        json!({
            "id": r.get::<_, String>(0)?,
            "schoolId": r.get::<_, String>(1)?,
            "senderId": r.get::<_, String>(2)?,
            "senderName": r.get::<_, Option<String>>(3)?,
            "audience": r.get::<_, String>(4)?,
            "audienceRef": r.get::<_, Option<String>>(5)?,
            "subject": r.get::<_, String>(6)?,
            "body": r.get::<_, String>(7)?,
            "read": r.get::<_, bool>(8)?,
        }),
        r,
        9,
    )
}

fn messages_send(ctx: &Ctx, params: &Value) -> Result<Value, ActionError> {
    let school = school_ref(ctx.conn, params)?;
    let sender_id = required_str(params, "senderId")?;
    ensure_school_user(ctx.conn, &sender_id, &school.id)?;
    let actor = match optional_str(params, "actorId")? {
        Some(_) => actor_id(ctx.conn, params, Some(&school.id))?,
        None => sender_id.clone(),
    };
    let audience = Audience::parse(&required_str(params, "audience")?).ok_or_else(|| {
        ActionError::invalid("audience", "audience must be one of: all, role, class, user")
    })?;
    let audience_ref = match audience {
        Audience::All => None,
        Audience::Role => {
            let raw = required_str(params, "audienceRef")?;
            let role = Role::parse(&raw)
                .ok_or_else(|| ActionError::invalid("audienceRef", format!("unknown role {raw}")))?;
            Some(role.as_str().to_string())
        }
        Audience::Class => {
            let class_id = required_str(params, "audienceRef")?;
            ensure_in_school(ctx.conn, "classes", "class", &class_id, &school.id)?;
            Some(class_id)
        }
        Audience::User => {
            let user_id = required_str(params, "audienceRef")?;
            ensure_school_user(ctx.conn, &user_id, &school.id)?;
            Some(user_id)
        }
    };
    let subject = required_str(params, "subject")?;
    let body = required_str(params, "body")?;

    let id = new_id();
    let ts = now();
    ctx.conn.execute(
        "INSERT INTO messages(id, school_id, sender_id, audience, audience_ref, subject, body,
                              created_by, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            &school.id,
            &sender_id,
            audience.as_str(),
            &audience_ref,
            &subject,
            &body,
            &actor,
            &ts,
            &ts,
        ),
    )?;
    tracing::info!(message_id = %id, school_id = %school.id, audience = audience.as_str(), "message sent");
    Ok(json!({ "messageId": id }))
}

/// SQL predicate and values selecting the live messages addressed to a user.
fn inbox_filter(conn: &Connection, school_id: &str, user_id: &str) -> Result<(String, Vec<SqlValue>), ActionError> {
    let roles = user_roles(conn, user_id)?;
    let class_id: Option<String> = conn
        .query_row(
            "SELECT s.class_id FROM users u
             JOIN students s ON s.id = u.student_id AND s.del_flag = 0
             WHERE u.id = ?",
            [user_id],
            |r| r.get(0),
        )
        .optional()?;

    let mut clauses = vec![
        "m.audience = 'all'".to_string(),
        "(m.audience = 'user' AND m.audience_ref = ?)".to_string(),
    ];
    // Bound in order: the read-join user, the school, then one value per clause.
    let mut values = vec![
        SqlValue::Text(user_id.to_string()),
        SqlValue::Text(school_id.to_string()),
        SqlValue::Text(user_id.to_string()),
    ];
    if let Some(c) = class_id {
        clauses.push("(m.audience = 'class' AND m.audience_ref = ?)".to_string());
        values.push(SqlValue::Text(c));
    }
    for role in roles.held() {
        clauses.push("(m.audience = 'role' AND m.audience_ref = ?)".to_string());
        values.push(SqlValue::Text(role.as_str().to_string()));
    }
    let filter = format!(
        "WHERE m.school_id = ? AND m.del_flag = 0 AND ({})",
        clauses.join(" OR ")
    );
    Ok((filter, values))
}

fn inbox_sql(filter: &str) -> String {
    format!(
        "SELECT m.id, m.school_id, m.sender_id, u.display_name, m.audience, m.audience_ref,
           m.subject, m.body, r.user_id IS NOT NULL,
           m.mod_flag, m.del_flag, m.created_by, m.modified_by, m.action_type,
           m.created_at, m.updated_at
         FROM messages m
         LEFT JOIN users u ON u.id = m.sender_id
         LEFT JOIN message_reads r ON r.message_id = m.id AND r.user_id = ?
         {filter}"
    )
}

/// Unread messages addressed to a user.
pub fn unread_count(conn: &Connection, school_id: &str, user_id: &str) -> Result<usize, ActionError> {
    let (filter, values) = inbox_filter(conn, school_id, user_id)?;
    let rows = query_json(
        conn,
        &inbox_sql(&format!("{filter} AND r.user_id IS NULL")),
        rusqlite::params_from_iter(values),
        message_json,
    )?;
    Ok(rows.len())
}

fn messages_inbox(ctx: &Ctx, params: &Value) -> Result<Value, ActionError> {
    let school = school_ref(ctx.conn, params)?;
    let user_id = required_str(params, "userId")?;
    ensure_school_user(ctx.conn, &user_id, &school.id)?;
    let (filter, values) = inbox_filter(ctx.conn, &school.id, &user_id)?;
    let messages = query_json(
        ctx.conn,
        &inbox_sql(&format!("{filter} ORDER BY m.created_at DESC, m.rowid DESC")),
        rusqlite::params_from_iter(values),
        message_json,
    )?;
    let unread = messages.iter().filter(|m| m["read"] == false).count();
    Ok(json!({ "messages": messages, "unread": unread }))
}

fn messages_mark_read(ctx: &Ctx, params: &Value) -> Result<Value, ActionError> {
    let message_id = required_str(params, "messageId")?;
    let user_id = required_str(params, "userId")?;
    let school = owning_school(ctx.conn, params, "messages", "message", &message_id)?;
    ensure_in_school(ctx.conn, "messages", "message", &message_id, &school.id)?;
    ensure_school_user(ctx.conn, &user_id, &school.id)?;
    ctx.conn.execute(
        "INSERT OR IGNORE INTO message_reads(message_id, user_id, read_at) VALUES(?, ?, ?)",
        (&message_id, &user_id, now()),
    )?;
    Ok(json!({ "ok": true }))
}

fn messages_delete(ctx: &Ctx, params: &Value) -> Result<Value, ActionError> {
    let message_id = required_str(params, "messageId")?;
    let school = owning_school(ctx.conn, params, "messages", "message", &message_id)?;
    let actor = actor_id(ctx.conn, params, Some(&school.id))?;
    soft_delete(ctx.conn, "messages", "message", &message_id, Some(&school.id), &actor)?;
    tracing::info!(%message_id, school_id = %school.id, "message deleted");
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let action: Action = match req.method.as_str() {
        "messages.send" => messages_send,
        "messages.inbox" => messages_inbox,
        "messages.markRead" => messages_mark_read,
        "messages.delete" => messages_delete,
        _ => return None,
    };
    Some(dispatch(state, req, action))
}
