use serde_json::json;

use crate::calc;
use crate::ipc::error::{domain_err, ok};
use crate::ipc::helpers::{gradebook, required_str};
use crate::ipc::types::{AppState, Request};
use crate::model::{NotebookKey, SubmissionKey};

fn handle_notebook(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    match calc::notebook_report(gb, key) {
        Ok(report) => ok(&req.id, json!(report)),
        Err(e) => domain_err(&req.id, &e),
    }
}

fn handle_assignment(state: &mut AppState, req: &Request) -> serde_json::Value {
    let gb = match gradebook(state, req) {
        Ok(gb) => gb,
        Err(resp) => return resp,
    };
    let assignment = match required_str(req, "assignment") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match calc::assignment_report(gb, &assignment) {
        Ok(report) => ok(&req.id, json!(report)),
        Err(e) => domain_err(&req.id, &e),
    }
}

fn handle_student(state: &mut AppState, req: &Request) -> serde_json::Value {
    let gb = match gradebook(state, req) {
        Ok(gb) => gb,
        Err(resp) => return resp,
    };
    let student = match required_str(req, "student") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match calc::student_report(gb, &student) {
        Ok(report) => ok(&req.id, json!(report)),
        Err(e) => domain_err(&req.id, &e),
    }
}

/// One submission's full per-notebook, per-cell breakdown: what a manual
/// grading UI renders.
fn handle_submission(state: &mut AppState, req: &Request) -> serde_json::Value {
    let gb = match gradebook(state, req) {
        Ok(gb) => gb,
        Err(resp) => return resp,
    };
    let assignment = match required_str(req, "assignment") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let student = match required_str(req, "student") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let key = SubmissionKey {
        assignment: &assignment,
        student: &student,
    };
    match calc::submission_report(gb, key) {
        Ok(report) => ok(&req.id, json!(report)),
        Err(e) => domain_err(&req.id, &e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.notebook" => Some(handle_notebook(state, req)),
        "reports.assignment" => Some(handle_assignment(state, req)),
        "reports.student" => Some(handle_student(state, req)),
        "reports.submission" => Some(handle_submission(state, req)),
        _ => None,
    }
}
