use crate::calendar::{self, CalendarView};
use crate::ipc::error::ActionError;
use crate::ipc::helpers::{
    actor_id, dispatch, new_id, now, optional_bool, optional_str, patch_obj, query_json,
    required_date, required_str, school_ref, soft_delete, with_audit, Action, Ctx, PatchSet,
    AUDIT_COLS,
};
use crate::ipc::types::{AppState, Request};
use chrono::{Datelike, NaiveDate, NaiveDateTime};
use rusqlite::{types::Value as SqlValue, Connection, OptionalExtension, Row};
use serde_json::{json, Map, Value};

fn event_json(r: &Row<'_>) -> rusqlite::Result<Value> {
    with_audit(
        json!({
            "id": r.get::<_, String>(0)?,
            "schoolId": r.get::<_, String>(1)?,
            "title": r.get::<_, String>(2)?,
            "description": r.get::<_, Option<String>>(3)?,
            "category": r.get::<_, Option<String>>(4)?,
            "startsAt": r.get::<_, String>(5)?,
            "endsAt": r.get::<_, String>(6)?,
            "allDay": r.get::<_, bool>(7)?,
        }),
        r,
        8,
    )
}

fn event_sql(filter: &str) -> String {
    format!(
        "SELECT id, school_id, title, description, category, starts_at, ends_at, all_day,
           {AUDIT_COLS}
         FROM events {filter}"
    )
}

fn load_event(conn: &Connection, event_id: &str, school_id: &str) -> Result<Value, ActionError> {
    conn.query_row(
        &event_sql("WHERE id = ? AND school_id = ? AND del_flag = 0"),
        (event_id, school_id),
        event_json,
    )
    .optional()?
    .ok_or_else(|| ActionError::not_found("event"))
}

fn parse_time(key: &str, raw: &str) -> Result<NaiveDateTime, ActionError> {
    calendar::parse_event_time(raw).ok_or_else(|| {
        ActionError::invalid(key, format!("{key} must be YYYY-MM-DD or YYYY-MM-DDTHH:MM[:SS]"))
    })
}

fn is_date_only(raw: &str) -> bool {
    raw.trim().len() == 10
}

fn time_field(patch: &Map<String, Value>, key: &str) -> Result<Option<NaiveDateTime>, ActionError> {
    match patch.get(key) {
        None => Ok(None),
        Some(Value::String(raw)) => parse_time(key, raw).map(Some),
        Some(_) => Err(ActionError::invalid(key, format!("{key} must be a string"))),
    }
}

fn check_order(starts: NaiveDateTime, ends: NaiveDateTime) -> Result<(), ActionError> {
    if ends < starts {
        return Err(ActionError::invalid("endsAt", "endsAt must not be before startsAt"));
    }
    Ok(())
}

fn events_create(ctx: &Ctx, params: &Value) -> Result<Value, ActionError> {
    let school = school_ref(ctx.conn, params)?;
    let actor = actor_id(ctx.conn, params, Some(&school.id))?;
    let title = required_str(params, "title")?;
    let starts_raw = required_str(params, "startsAt")?;
    let starts = parse_time("startsAt", &starts_raw)?;
    let ends = match optional_str(params, "endsAt")? {
        Some(raw) => parse_time("endsAt", &raw)?,
        None => starts,
    };
    check_order(starts, ends)?;
    let all_day = optional_bool(params, "allDay")?.unwrap_or_else(|| is_date_only(&starts_raw));

    let id = new_id();
    let ts = now();
    ctx.conn.execute(
        "INSERT INTO events(id, school_id, title, description, category, starts_at, ends_at,
                            all_day, created_by, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            id,
            school.id,
            title,
            optional_str(params, "description")?,
            optional_str(params, "category")?,
            calendar::format_event_time(starts),
            calendar::format_event_time(ends),
            all_day,
            actor,
            ts,
            ts,
        ],
    )?;
    tracing::info!(event_id = %id, school_id = %school.id, "event created");
    Ok(json!({ "eventId": id, "event": load_event(ctx.conn, &id, &school.id)? }))
}

fn events_update(ctx: &Ctx, params: &Value) -> Result<Value, ActionError> {
    let school = school_ref(ctx.conn, params)?;
    let actor = actor_id(ctx.conn, params, Some(&school.id))?;
    let event_id = required_str(params, "eventId")?;
    let current = load_event(ctx.conn, &event_id, &school.id)?;
    let patch = patch_obj(params)?;

    let mut set = PatchSet::new(patch);
    set.text("title", "title")?;
    set.nullable_text("description", "description")?;
    set.nullable_text("category", "category")?;
    set.flag("allDay", "all_day")?;

    let starts_new = time_field(patch, "startsAt")?;
    let ends_new = time_field(patch, "endsAt")?;
    if starts_new.is_some() || ends_new.is_some() {
        let starts = match starts_new {
            Some(t) => t,
            None => parse_time("startsAt", current["startsAt"].as_str().unwrap_or_default())?,
        };
        let ends = match ends_new {
            Some(t) => t,
            None => parse_time("endsAt", current["endsAt"].as_str().unwrap_or_default())?,
        };
        check_order(starts, ends)?;
        if starts_new.is_some() {
            set.push("starts_at", SqlValue::Text(calendar::format_event_time(starts)));
        }
        if ends_new.is_some() {
            set.push("ends_at", SqlValue::Text(calendar::format_event_time(ends)));
        }
    }
    set.apply(ctx.conn, "events", "event", &event_id, Some(&school.id), &actor)?;
    Ok(json!({ "event": load_event(ctx.conn, &event_id, &school.id)? }))
}

fn events_delete(ctx: &Ctx, params: &Value) -> Result<Value, ActionError> {
    let school = school_ref(ctx.conn, params)?;
    let actor = actor_id(ctx.conn, params, Some(&school.id))?;
    let event_id = required_str(params, "eventId")?;
    soft_delete(ctx.conn, "events", "event", &event_id, Some(&school.id), &actor)?;
    tracing::info!(%event_id, school_id = %school.id, "event deleted");
    Ok(json!({ "ok": true }))
}

fn fmt_day(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

fn events_list(ctx: &Ctx, params: &Value) -> Result<Value, ActionError> {
    let school = school_ref(ctx.conn, params)?;
    let view = match optional_str(params, "view")? {
        Some(raw) => CalendarView::parse(&raw).ok_or_else(|| {
            ActionError::invalid("view", "view must be one of: month, week, day")
        })?,
        None => CalendarView::Month,
    };
    let anchor = required_date(params, "date")?;
    let (first, last) = calendar::view_range(view, anchor);

    let candidates = query_json(
        ctx.conn,
        &event_sql(
            "WHERE school_id = ? AND del_flag = 0 AND starts_at <= ?
             ORDER BY starts_at, title",
        ),
        (&school.id, format!("{}T23:59:59", fmt_day(last))),
        event_json,
    )?;
    let mut events = Vec::new();
    let mut spans = Vec::new();
    for e in candidates {
        let starts = calendar::parse_event_time(e["startsAt"].as_str().unwrap_or_default());
        let ends = calendar::parse_event_time(e["endsAt"].as_str().unwrap_or_default());
        if let (Some(s), Some(t)) = (starts, ends) {
            if calendar::overlaps(s, t, first, last) {
                spans.push((e["id"].clone(), s.date(), t.date()));
                events.push(e);
            }
        }
    }

    let mut out = json!({
        "view": view.as_str(),
        "date": fmt_day(anchor),
        "from": fmt_day(first),
        "to": fmt_day(last),
        "events": events,
    });
    if view == CalendarView::Month {
        let weeks: Vec<Value> = calendar::month_grid(anchor)
            .iter()
            .map(|week| {
                Value::Array(
                    week.iter()
                        .map(|day| {
                            let ids: Vec<Value> = spans
                                .iter()
                                .filter(|(_, s, t)| s <= day && day <= t)
                                .map(|(id, _, _)| id.clone())
                                .collect();
                            json!({
                                "date": fmt_day(*day),
                                "inMonth": day.month() == anchor.month(),
                                "eventIds": ids,
                            })
                        })
                        .collect(),
                )
            })
            .collect();
        out["weeks"] = Value::Array(weeks);
    }
    Ok(out)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let action: Action = match req.method.as_str() {
        "events.create" => events_create,
        "events.update" => events_update,
        "events.delete" => events_delete,
        "events.list" => events_list,
        _ => return None,
    };
    Some(dispatch(state, req, action))
}
