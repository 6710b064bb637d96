use crate::calc::{self, StockError, StockMove};
use crate::ipc::error::ActionError;
use crate::ipc::helpers::{
    actor_id, dispatch, ensure_in_school, exists, include_deleted, new_id, now, optional_date,
    optional_f64, optional_str, patch_obj, query_json, required_f64, required_str, school_ref,
    soft_delete, today, with_audit, Action, Ctx, PatchSet,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{types::Value as SqlValue, Connection, OptionalExtension, Row};
use serde_json::{json, Value};

fn category_json(r: &Row<'_>) -> rusqlite::Result<Value> {
    with_audit(
        json!({
            "id": r.get::<_, String>(0)?,
            "schoolId": r.get::<_, String>(1)?,
            "name": r.get::<_, String>(2)?,
            "itemCount": r.get::<_, i64>(3)?,
        }),
        r,
        4,
    )
}

fn category_sql(filter: &str) -> String {
    format!(
        "SELECT c.id, c.school_id, c.name,
           (SELECT COUNT(*) FROM inventory_items i WHERE i.category_id = c.id AND i.del_flag = 0),
           c.mod_flag, c.del_flag, c.created_by, c.modified_by, c.action_type,
           c.created_at, c.updated_at
         FROM inventory_categories c {filter}"
    )
}

fn item_json(r: &Row<'_>) -> rusqlite::Result<Value> {
    let quantity: f64 = r.get(6)?;
    let reorder: f64 = r.get(7)?;
    with_audit(
        json!({
            "id": r.get::<_, String>(0)?,
            "schoolId": r.get::<_, String>(1)?,
            "categoryId": r.get::<_, String>(2)?,
            "categoryName": r.get::<_, Option<String>>(3)?,
            "name": r.get::<_, String>(4)?,
            "unit": r.get::<_, String>(5)?,
            "quantity": quantity,
            "reorderLevel": reorder,
            "unitPrice": r.get::<_, Option<f64>>(8)?,
            "lowStock": quantity <= reorder,
        }),
        r,
        9,
    )
}

fn item_sql(filter: &str) -> String {
    format!(
        "SELECT i.id, i.school_id, i.category_id, c.name, i.name, i.unit, i.quantity,
           i.reorder_level, i.unit_price,
           i.mod_flag, i.del_flag, i.created_by, i.modified_by, i.action_type,
           i.created_at, i.updated_at
         FROM inventory_items i
         LEFT JOIN inventory_categories c ON c.id = i.category_id
         {filter}"
    )
}

fn load_item(conn: &Connection, item_id: &str, school_id: &str) -> Result<Value, ActionError> {
    conn.query_row(
        &item_sql("WHERE i.id = ? AND i.school_id = ? AND i.del_flag = 0"),
        (item_id, school_id),
        item_json,
    )
    .optional()?
    .ok_or_else(|| ActionError::not_found("item"))
}

fn categories_list(ctx: &Ctx, params: &Value) -> Result<Value, ActionError> {
    let school = school_ref(ctx.conn, params)?;
    let deleted = if include_deleted(params) { "" } else { "AND c.del_flag = 0" };
    let categories = query_json(
        ctx.conn,
        &category_sql(&format!("WHERE c.school_id = ? {deleted} ORDER BY c.name")),
        [&school.id],
        category_json,
    )?;
    Ok(json!({ "categories": categories }))
}

fn categories_create(ctx: &Ctx, params: &Value) -> Result<Value, ActionError> {
    let school = school_ref(ctx.conn, params)?;
    let actor = actor_id(ctx.conn, params, Some(&school.id))?;
    let name = required_str(params, "name")?;
    if exists(
        ctx.conn,
        "SELECT 1 FROM inventory_categories
         WHERE school_id = ? AND name = ? COLLATE NOCASE AND del_flag = 0",
        (&school.id, &name),
    )? {
        return Err(ActionError::conflict(format!("category {name} already exists")));
    }
    let id = new_id();
    let ts = now();
    ctx.conn.execute(
        "INSERT INTO inventory_categories(id, school_id, name, created_by, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&id, &school.id, &name, &actor, &ts, &ts),
    )?;
    tracing::info!(category_id = %id, school_id = %school.id, "inventory category created");
    let category = ctx.conn.query_row(
        &category_sql("WHERE c.id = ?"),
        [&id],
        category_json,
    )?;
    Ok(json!({ "categoryId": id, "category": category }))
}

fn categories_delete(ctx: &Ctx, params: &Value) -> Result<Value, ActionError> {
    let school = school_ref(ctx.conn, params)?;
    let actor = actor_id(ctx.conn, params, Some(&school.id))?;
    let category_id = required_str(params, "categoryId")?;
    ensure_in_school(ctx.conn, "inventory_categories", "category", &category_id, &school.id)?;
    if exists(
        ctx.conn,
        "SELECT 1 FROM inventory_items WHERE category_id = ? AND del_flag = 0",
        [&category_id],
    )? {
        return Err(ActionError::conflict("category still has items"));
    }
    soft_delete(
        ctx.conn,
        "inventory_categories",
        "category",
        &category_id,
        Some(&school.id),
        &actor,
    )?;
    tracing::info!(%category_id, school_id = %school.id, "inventory category deleted");
    Ok(json!({ "ok": true }))
}

fn items_list(ctx: &Ctx, params: &Value) -> Result<Value, ActionError> {
    let school = school_ref(ctx.conn, params)?;
    let mut filter = String::from("WHERE i.school_id = ?");
    let mut values = vec![SqlValue::Text(school.id.clone())];
    if !include_deleted(params) {
        filter.push_str(" AND i.del_flag = 0");
    }
    if let Some(category_id) = optional_str(params, "categoryId")? {
        filter.push_str(" AND i.category_id = ?");
        values.push(SqlValue::Text(category_id));
    }
    filter.push_str(" ORDER BY i.name");
    let items = query_json(
        ctx.conn,
        &item_sql(&filter),
        rusqlite::params_from_iter(values),
        item_json,
    )?;
    Ok(json!({ "items": items }))
}

fn non_negative(key: &str, v: Option<f64>) -> Result<Option<f64>, ActionError> {
    match v {
        Some(x) if x < 0.0 => Err(ActionError::invalid(key, format!("{key} must not be negative"))),
        other => Ok(other),
    }
}

fn items_create(ctx: &Ctx, params: &Value) -> Result<Value, ActionError> {
    let school = school_ref(ctx.conn, params)?;
    let actor = actor_id(ctx.conn, params, Some(&school.id))?;
    let category_id = required_str(params, "categoryId")?;
    ensure_in_school(ctx.conn, "inventory_categories", "category", &category_id, &school.id)?;
    let name = required_str(params, "name")?;
    let unit = required_str(params, "unit")?;
    let reorder = non_negative("reorderLevel", optional_f64(params, "reorderLevel")?)?.unwrap_or(0.0);
    let unit_price = non_negative("unitPrice", optional_f64(params, "unitPrice")?)?;

    let id = new_id();
    let ts = now();
    ctx.conn.execute(
        "INSERT INTO inventory_items(id, school_id, category_id, name, unit, quantity,
                                     reorder_level, unit_price, created_by, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, 0, ?, ?, ?, ?, ?)",
        (&id, &school.id, &category_id, &name, &unit, reorder, unit_price, &actor, &ts, &ts),
    )?;
    tracing::info!(item_id = %id, school_id = %school.id, "inventory item created");
    Ok(json!({ "itemId": id, "item": load_item(ctx.conn, &id, &school.id)? }))
}

fn items_update(ctx: &Ctx, params: &Value) -> Result<Value, ActionError> {
    let school = school_ref(ctx.conn, params)?;
    let actor = actor_id(ctx.conn, params, Some(&school.id))?;
    let item_id = required_str(params, "itemId")?;
    load_item(ctx.conn, &item_id, &school.id)?;
    let patch = patch_obj(params)?;

    let mut set = PatchSet::new(patch);
    if let Some(category_id) = set.text("categoryId", "category_id")? {
        ensure_in_school(ctx.conn, "inventory_categories", "category", &category_id, &school.id)?;
    }
    set.text("name", "name")?;
    set.text("unit", "unit")?;
    set.real("reorderLevel", "reorder_level", 0.0)?;
    match patch.get("unitPrice") {
        None => {}
        Some(Value::Null) => set.push("unit_price", SqlValue::Null),
        Some(_) => {
            set.real("unitPrice", "unit_price", 0.0)?;
        }
    }
    if set.has("quantity") {
        return Err(ActionError::invalid(
            "quantity",
            "quantity changes only through inventory.move",
        ));
    }
    set.apply(ctx.conn, "inventory_items", "item", &item_id, Some(&school.id), &actor)?;
    Ok(json!({ "item": load_item(ctx.conn, &item_id, &school.id)? }))
}

fn items_delete(ctx: &Ctx, params: &Value) -> Result<Value, ActionError> {
    let school = school_ref(ctx.conn, params)?;
    let actor = actor_id(ctx.conn, params, Some(&school.id))?;
    let item_id = required_str(params, "itemId")?;
    soft_delete(ctx.conn, "inventory_items", "item", &item_id, Some(&school.id), &actor)?;
    tracing::info!(%item_id, school_id = %school.id, "inventory item deleted");
    Ok(json!({ "ok": true }))
}

fn inventory_move(ctx: &Ctx, params: &Value) -> Result<Value, ActionError> {
    let school = school_ref(ctx.conn, params)?;
    let actor = actor_id(ctx.conn, params, Some(&school.id))?;
    let item_id = required_str(params, "itemId")?;
    let kind = StockMove::parse(&required_str(params, "kind")?).ok_or_else(|| {
        ActionError::invalid("kind", "kind must be one of: purchase, return, issue, adjust")
    })?;
    let quantity = required_f64(params, "quantity")?;
    let moved_on = optional_date(params, "movedOn")?.unwrap_or_else(today);

    let tx = ctx.conn.unchecked_transaction()?;
    let on_hand: f64 = tx
        .query_row(
            "SELECT quantity FROM inventory_items WHERE id = ? AND school_id = ? AND del_flag = 0",
            (&item_id, &school.id),
            |r| r.get(0),
        )
        .optional()?
        .ok_or_else(|| ActionError::not_found("item"))?;
    let after = calc::apply_stock(on_hand, kind, quantity).map_err(|e| match e {
        StockError::Insufficient { .. } => ActionError::rule(e.to_string()),
        _ => ActionError::invalid("quantity", e.to_string()),
    })?;
    let ts = now();
    tx.execute(
        "UPDATE inventory_items
         SET quantity = ?, mod_flag = 1, action_type = 'update', modified_by = ?, updated_at = ?
         WHERE id = ?",
        (after, &actor, &ts, &item_id),
    )?;
    let movement_id = new_id();
    tx.execute(
        "INSERT INTO inventory_movements(id, school_id, item_id, kind, quantity, balance_after,
                                         party, note, moved_on, created_by, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            movement_id,
            school.id,
            item_id,
            kind.as_str(),
            quantity,
            after,
            optional_str(params, "party")?,
            optional_str(params, "note")?,
            moved_on.format("%Y-%m-%d").to_string(),
            actor,
            ts,
        ],
    )?;
    tx.commit()?;
    tracing::info!(%movement_id, %item_id, school_id = %school.id, kind = kind.as_str(), quantity, after, "stock moved");
    Ok(json!({
        "movementId": movement_id,
        "item": load_item(ctx.conn, &item_id, &school.id)?,
    }))
}

fn inventory_movements(ctx: &Ctx, params: &Value) -> Result<Value, ActionError> {
    let school = school_ref(ctx.conn, params)?;
    let item_id = required_str(params, "itemId")?;
    let item = load_item(ctx.conn, &item_id, &school.id)?;
    let movements = query_json(
        ctx.conn,
        "SELECT id, kind, quantity, balance_after, party, note, moved_on, created_by, created_at
         FROM inventory_movements
         WHERE item_id = ? AND school_id = ?
         ORDER BY created_at DESC, rowid DESC",
        (&item_id, &school.id),
        |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "kind": r.get::<_, String>(1)?,
                "quantity": r.get::<_, f64>(2)?,
                "balanceAfter": r.get::<_, f64>(3)?,
                "party": r.get::<_, Option<String>>(4)?,
                "note": r.get::<_, Option<String>>(5)?,
                "movedOn": r.get::<_, String>(6)?,
                "createdBy": r.get::<_, String>(7)?,
                "createdAt": r.get::<_, String>(8)?,
            }))
        },
    )?;
    Ok(json!({ "item": item, "movements": movements }))
}

/// Live items at or below their reorder level.
pub fn low_stock_items(conn: &Connection, school_id: &str) -> Result<Vec<Value>, ActionError> {
    query_json(
        conn,
        &item_sql(
            "WHERE i.school_id = ? AND i.del_flag = 0 AND i.quantity <= i.reorder_level
             ORDER BY i.quantity - i.reorder_level, i.name",
        ),
        [school_id],
        item_json,
    )
}

fn inventory_low_stock(ctx: &Ctx, params: &Value) -> Result<Value, ActionError> {
    let school = school_ref(ctx.conn, params)?;
    Ok(json!({ "items": low_stock_items(ctx.conn, &school.id)? }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let action: Action = match req.method.as_str() {
        "inventory.categories.list" => categories_list,
        "inventory.categories.create" => categories_create,
        "inventory.categories.delete" => categories_delete,
        "inventory.items.list" => items_list,
        "inventory.items.create" => items_create,
        "inventory.items.update" => items_update,
        "inventory.items.delete" => items_delete,
        "inventory.move" => inventory_move,
        "inventory.movements" => inventory_movements,
        "inventory.lowStock" => inventory_low_stock,
        _ => return None,
    };
    Some(dispatch(state, req, action))
}
