use std::path::PathBuf;

use serde_json::json;
use tracing::info;

use crate::gradebook::Gradebook;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::optional_str;
use crate::ipc::types::{AppState, Request};

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string()),
            "course": state.gradebook.as_ref().map(|gb| gb.course_id().to_string())
        }),
    )
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let p = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from);
    let Some(path) = p else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };
    // One store serves one course; unnamed callers get the stock course id.
    let course = optional_str(req, "course").unwrap_or_else(|| "default".to_string());

    match Gradebook::open(&path, &course) {
        Ok(gb) => {
            info!(workspace = %path.display(), course = %course, "workspace opened");
            state.workspace = Some(path.clone());
            state.gradebook = Some(gb);
            ok(
                &req.id,
                json!({
                    "workspacePath": path.to_string_lossy(),
                    "course": course
                }),
            )
        }
        Err(e) => err(&req.id, "db_open_failed", format!("{e:?}"), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        _ => None,
    }
}
