//! Param extraction shared by the handlers. Every helper returns the ready
//! error response on failure so handlers can `match`-and-return without
//! rebuilding the same `bad_params` objects.

use chrono::NaiveDateTime;

use super::error::err;
use super::types::{AppState, Request};
use crate::gradebook::Gradebook;
use crate::model::{parse_timestamp, NotebookCell};

pub fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.to_string())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

pub fn optional_str(req: &Request, key: &str) -> Option<String> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.to_string())
}

pub fn optional_f64(req: &Request, key: &str) -> Option<f64> {
    req.params.get(key).and_then(|v| v.as_f64())
}

pub fn optional_i64(req: &Request, key: &str) -> Option<i64> {
    req.params.get(key).and_then(|v| v.as_i64())
}

pub fn flag(req: &Request, key: &str) -> bool {
    req.params
        .get(key)
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}

pub fn gradebook<'a>(
    state: &'a AppState,
    req: &Request,
) -> Result<&'a Gradebook, serde_json::Value> {
    state
        .gradebook
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

/// Optional timestamp param; present-but-malformed is a bad_params error, not
/// a silent None.
pub fn optional_timestamp(
    req: &Request,
    key: &str,
) -> Result<Option<NaiveDateTime>, serde_json::Value> {
    let Some(raw) = req.params.get(key).and_then(|v| v.as_str()) else {
        return Ok(None);
    };
    parse_timestamp(raw)
        .map(Some)
        .map_err(|e| err(&req.id, "bad_params", e.to_string(), None))
}

/// The `cells` array every submission-shaped request carries.
pub fn required_cells(req: &Request) -> Result<Vec<NotebookCell>, serde_json::Value> {
    let Some(value) = req.params.get("cells") else {
        return Err(err(&req.id, "bad_params", "missing cells[]", None));
    };
    serde_json::from_value(value.clone()).map_err(|e| {
        err(
            &req.id,
            "bad_params",
            format!("malformed cells[]: {}", e),
            None,
        )
    })
}
