use crate::db;
use crate::ipc::error::{err, ok, ActionError};
use crate::ipc::helpers::{dispatch, Ctx};
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Map, Value};
use std::path::PathBuf;

fn handle_health(state: &mut AppState, req: &Request) -> Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "schemaVersion": db::SCHEMA_VERSION,
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string())
        }),
    )
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> Value {
    let p = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .map(PathBuf::from);
    let Some(path) = p else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };

    match db::open_db(&path) {
        Ok(conn) => {
            tracing::info!(workspace = %path.display(), "workspace selected");
            state.workspace = Some(path.clone());
            state.db = Some(conn);
            ok(&req.id, json!({ "workspacePath": path.to_string_lossy() }))
        }
        Err(e) => {
            tracing::warn!(workspace = %path.display(), error = %e, "workspace open failed");
            err(&req.id, "db_failed", format!("{e:#}"), None)
        }
    }
}

const COUNTED_TABLES: &[(&str, &str)] = &[
    ("schools", "schools"),
    ("users", "users"),
    ("classes", "classes"),
    ("students", "students"),
    ("employees", "employees"),
    ("feeHeads", "fee_heads"),
    ("feePayments", "fee_payments"),
    ("accounts", "accounts"),
    ("inventoryItems", "inventory_items"),
    ("payslips", "payslips"),
    ("messages", "messages"),
    ("events", "events"),
];

fn workspace_info(ctx: &Ctx, _params: &Value) -> Result<Value, ActionError> {
    let mut counts = Map::new();
    for (key, table) in COUNTED_TABLES {
        let n: i64 = ctx.conn.query_row(
            &format!("SELECT COUNT(*) FROM {table} WHERE del_flag = 0"),
            [],
            |r| r.get(0),
        )?;
        counts.insert(key.to_string(), json!(n));
    }
    Ok(json!({ "counts": counts }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        "workspace.info" => Some(dispatch(state, req, workspace_info)),
        _ => None,
    }
}
