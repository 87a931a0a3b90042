use crate::backup;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::PathBuf;
use tracing::{error, info};

fn path_param(req: &Request, key: &str) -> Option<PathBuf> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .map(PathBuf::from)
}

/// Explicit `workspacePath`, else the selected workspace.
fn workspace_param(state: &AppState, req: &Request) -> Option<PathBuf> {
    path_param(req, "workspacePath").or_else(|| state.workspace.clone())
}

fn handle_export(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(workspace) = workspace_param(state, req) else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(out_path) = path_param(req, "outPath") else {
        return err(&req.id, "bad_params", "missing outPath", None);
    };
    match backup::export_workspace_bundle(&workspace, &out_path) {
        Ok(summary) => {
            info!(out = %out_path.display(), bytes = summary.db_bytes, "workspace exported");
            ok(
                &req.id,
                json!({
                    "ok": true,
                    "bundleFormat": summary.bundle_format,
                    "dbSha256": summary.db_sha256,
                    "dbBytes": summary.db_bytes
                }),
            )
        }
        Err(e) => err(&req.id, "io_failed", format!("{e:#}"), None),
    }
}

fn handle_import(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(workspace) = workspace_param(state, req) else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(in_path) = path_param(req, "inPath") else {
        return err(&req.id, "bad_params", "missing inPath", None);
    };

    // Release the connection before its file is swapped out.
    let importing_current = state.is_current(&workspace);
    if importing_current {
        state.release_db();
    }
    let summary = match backup::import_workspace_bundle(&in_path, &workspace) {
        Ok(s) => s,
        Err(e) => {
            error!(bundle = %in_path.display(), error = %e, "workspace import failed");
            if importing_current {
                let _ = state.open_workspace(&workspace);
            }
            return err(&req.id, "io_failed", format!("{e:#}"), None);
        }
    };
    if importing_current {
        if let Err(e) = state.open_workspace(&workspace) {
            return err(&req.id, "db_open_failed", format!("{e:#}"), None);
        }
    }
    info!(bundle = %in_path.display(), workspace = %workspace.display(), "workspace imported");
    ok(
        &req.id,
        json!({
            "ok": true,
            "bundleFormat": summary.bundle_format,
            "dbSha256": summary.db_sha256,
            "workspacePath": workspace.to_string_lossy()
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "backup.exportWorkspaceBundle" => Some(handle_export(state, req)),
        "backup.importWorkspaceBundle" => Some(handle_import(state, req)),
        _ => None,
    }
}
