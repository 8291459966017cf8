use serde_json::json;

use crate::ipc::error::{domain_err, ok};
use crate::ipc::helpers::{
    flag, gradebook, optional_str, optional_timestamp, required_cells, required_str,
};
use crate::ipc::types::{AppState, Request};
use crate::model::{format_timestamp, AssignmentRecord, NotebookDefinition, NotebookKey, NotebookRecord};

fn assignment_json(a: &AssignmentRecord) -> serde_json::Value {
    json!({
        "name": a.name,
        "duedate": a.duedate.map(format_timestamp),
    })
}

fn notebook_json(n: &NotebookRecord) -> serde_json::Value {
    json!({
        "name": n.name,
        "kernelspec": n.kernelspec,
    })
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let gb = match gradebook(state, req) {
        Ok(gb) => gb,
        Err(resp) => return resp,
    };
    match gb.list_assignments() {
        Ok(assignments) => ok(
            &req.id,
            json!({ "assignments": assignments.iter().map(assignment_json).collect::<Vec<_>>() }),
        ),
        Err(e) => domain_err(&req.id, &e),
    }
}

fn handle_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let gb = match gradebook(state, req) {
        Ok(gb) => gb,
        Err(resp) => return resp,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let duedate = match optional_timestamp(req, "duedate") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match gb.add_assignment(&name, duedate) {
        Ok(record) => ok(&req.id, json!({ "assignment": assignment_json(&record) })),
        Err(e) => domain_err(&req.id, &e),
    }
}

fn handle_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let gb = match gradebook(state, req) {
        Ok(gb) => gb,
        Err(resp) => return resp,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let duedate = match optional_timestamp(req, "duedate") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match gb.update_or_create_assignment(&name, duedate) {
        Ok((record, created)) => ok(
            &req.id,
            json!({ "assignment": assignment_json(&record), "created": created }),
        ),
        Err(e) => domain_err(&req.id, &e),
    }
}

fn handle_remove(state: &mut AppState, req: &Request) -> serde_json::Value {
    let gb = match gradebook(state, req) {
        Ok(gb) => gb,
        Err(resp) => return resp,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match gb.remove_assignment(&name, flag(req, "force")) {
        Ok(()) => ok(&req.id, json!({ "ok": true })),
        Err(e) => domain_err(&req.id, &e),
    }
}

/// The assign step: project the master notebook's cells into the template
/// tables. Structure only; student rows are never touched here.
fn handle_put_notebook(state: &mut AppState, req: &Request) -> serde_json::Value {
    let gb = match gradebook(state, req) {
        Ok(gb) => gb,
        Err(resp) => return resp,
    };
    let assignment = match required_str(req, "assignment") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let notebook = match required_str(req, "notebook") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let cells = match required_cells(req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let def = NotebookDefinition::from_cells(&notebook, optional_str(req, "kernelspec"), &cells);
    match gb.put_notebook(&assignment, &def, flag(req, "force")) {
        Ok(record) => ok(
            &req.id,
            json!({
                "notebook": notebook_json(&record),
                "cells": def.cells.len(),
            }),
        ),
        Err(e) => domain_err(&req.id, &e),
    }
}

fn handle_notebooks_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let gb = match gradebook(state, req) {
        Ok(gb) => gb,
        Err(resp) => return resp,
    };
    let assignment = match required_str(req, "assignment") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match gb.list_notebooks(&assignment) {
        Ok(notebooks) => ok(
            &req.id,
            json!({ "notebooks": notebooks.iter().map(notebook_json).collect::<Vec<_>>() }),
        ),
        Err(e) => domain_err(&req.id, &e),
    }
}

fn handle_notebooks_remove(state: &mut AppState, req: &Request) -> serde_json::Value {
    let gb = match gradebook(state, req) {
        Ok(gb) => gb,
        Err(resp) => return resp,
    };
    let assignment = match required_str(req, "assignment") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let notebook = match required_str(req, "notebook") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let key = NotebookKey {
        assignment: &assignment,
        notebook: &notebook,
    };
    match gb.remove_notebook(key, flag(req, "force")) {
        Ok(()) => ok(&req.id, json!({ "ok": true })),
        Err(e) => domain_err(&req.id, &e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "assignments.list" => Some(handle_list(state, req)),
        "assignments.create" => Some(handle_create(state, req)),
        "assignments.update" => Some(handle_update(state, req)),
        "assignments.remove" => Some(handle_remove(state, req)),
        "assignments.putNotebook" => Some(handle_put_notebook(state, req)),
        "notebooks.list" => Some(handle_notebooks_list(state, req)),
        "notebooks.remove" => Some(handle_notebooks_remove(state, req)),
        _ => None,
    }
}
