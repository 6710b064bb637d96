use crate::backup;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

fn path_param(req: &Request, key: &str) -> Option<PathBuf> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
}

fn target_workspace(state: &AppState, req: &Request) -> Option<PathBuf> {
    path_param(req, "workspacePath").or_else(|| state.workspace.clone())
}

fn is_active(state: &AppState, workspace: &Path) -> bool {
    state.workspace.as_deref() == Some(workspace)
}

fn backup_export(state: &mut AppState, req: &Request) -> Value {
    let Some(out_path) = path_param(req, "outPath") else {
        return err(&req.id, "bad_params", "missing params.outPath", None);
    };
    let Some(workspace) = target_workspace(state, req) else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    match backup::export_workspace_bundle(&workspace, &out_path) {
        Ok(summary) => {
            tracing::info!(
                workspace = %workspace.display(),
                out = %out_path.display(),
                "workspace bundle exported"
            );
            ok(
                &req.id,
                json!({
                    "path": out_path.to_string_lossy(),
                    "bundleFormat": summary.bundle_format,
                    "entryCount": summary.entry_count,
                    "dbSha256": summary.db_sha256,
                }),
            )
        }
        Err(e) => {
            tracing::warn!(error = %e, "bundle export failed");
            err(
                &req.id,
                "internal",
                format!("{e:#}"),
                Some(json!({ "path": out_path.to_string_lossy() })),
            )
        }
    }
}

fn backup_import(state: &mut AppState, req: &Request) -> Value {
    let Some(in_path) = path_param(req, "inPath") else {
        return err(&req.id, "bad_params", "missing params.inPath", None);
    };
    let Some(workspace) = target_workspace(state, req) else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    if !in_path.is_file() {
        return err(
            &req.id,
            "not_found",
            "bundle file not found",
            Some(json!({ "path": in_path.to_string_lossy() })),
        );
    }

    // The open connection must be released before its file is replaced.
    let active = is_active(state, &workspace);
    if active {
        state.db = None;
    }
    let imported = backup::import_workspace_bundle(&in_path, &workspace);
    let reopened = if active {
        db::open_db(&workspace).map(|conn| state.db = Some(conn))
    } else {
        Ok(())
    };

    let summary = match imported {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, "bundle import failed");
            return match e.downcast_ref::<backup::RejectedBundle>() {
                Some(rejected) => err(
                    &req.id,
                    "validation_failed",
                    rejected.to_string(),
                    Some(json!({ "field": "inPath", "path": in_path.to_string_lossy() })),
                ),
                None => err(
                    &req.id,
                    "internal",
                    format!("{e:#}"),
                    Some(json!({ "path": in_path.to_string_lossy() })),
                ),
            };
        }
    };
    if let Err(e) = reopened {
        state.workspace = None;
        return err(&req.id, "db_failed", format!("{e:#}"), None);
    }
    tracing::info!(
        workspace = %workspace.display(),
        format = %summary.bundle_format_detected,
        "workspace bundle imported"
    );
    ok(
        &req.id,
        json!({
            "workspacePath": workspace.to_string_lossy(),
            "bundleFormatDetected": summary.bundle_format_detected,
            "dbSha256": summary.db_sha256,
            "reopened": active,
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "backup.exportWorkspaceBundle" => Some(backup_export(state, req)),
        "backup.importWorkspaceBundle" => Some(backup_import(state, req)),
        _ => None,
    }
}
