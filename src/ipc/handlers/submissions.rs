use serde_json::json;

use crate::ipc::error::{domain_err, ok};
use crate::ipc::helpers::{
    flag, gradebook, optional_f64, optional_i64, optional_str, optional_timestamp, required_cells,
    required_str,
};
use crate::ipc::types::{AppState, Request};
use crate::model::{
    format_timestamp, GradeKey, NotebookKey, SubmissionKey, SubmittedNotebookKey,
};
use crate::reconcile::{self, ReconcileOptions};

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let gb = match gradebook(state, req) {
        Ok(gb) => gb,
        Err(resp) => return resp,
    };
    let assignment = match required_str(req, "assignment") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let duedate = match gb.find_assignment(&assignment) {
        Ok(a) => a.duedate,
        Err(e) => return domain_err(&req.id, &e),
    };
    match gb.list_submissions(&assignment) {
        Ok(submissions) => {
            let rows: Vec<_> = submissions
                .iter()
                .map(|s| {
                    json!({
                        "studentId": s.student_id,
                        "timestamp": s.timestamp.map(format_timestamp),
                        "extensionSeconds": s.extension_seconds,
                        "secondsLate": s.total_seconds_late(duedate),
                    })
                })
                .collect();
            ok(&req.id, json!({ "submissions": rows }))
        }
        Err(e) => domain_err(&req.id, &e),
    }
}

/// Runs the submitted cells against the recorded structure and returns the
/// corrected cells plus the change log. Read-only; nothing is persisted.
fn handle_reconcile(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let key = NotebookKey {
        assignment: &assignment,
        notebook: &notebook,
    };
    let options = ReconcileOptions {
        restore_missing: flag(req, "restoreMissing"),
    };
    match reconcile::reconcile_notebook(gb, key, &cells, options) {
        Ok(outcome) => ok(
            &req.id,
            json!({
                "cells": outcome.cells,
                "changes": outcome.changes,
                "kernelspec": outcome.kernelspec,
            }),
        ),
        Err(e) => domain_err(&req.id, &e),
    }
}

fn handle_record_execution(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let student = match required_str(req, "student") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let timestamp = match optional_timestamp(req, "timestamp") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let cells = match required_cells(req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let key = SubmittedNotebookKey {
        assignment: &assignment,
        notebook: &notebook,
        student: &student,
    };
    match gb.record_execution(key, timestamp, &cells) {
        Ok(summary) => ok(
            &req.id,
            json!({
                "gradedCells": summary.graded_cells,
                "needsManual": summary.needs_manual,
                "commentsCreated": summary.comments_created,
            }),
        ),
        Err(e) => domain_err(&req.id, &e),
    }
}

fn grade_key<'a>(
    assignment: &'a str,
    notebook: &'a str,
    cell: &'a str,
    student: &'a str,
) -> GradeKey<'a> {
    GradeKey {
        assignment,
        notebook,
        cell,
        student,
    }
}

/// Manual score and extra credit for one cell. Absent params clear the
/// stored value, so a grader can undo an override.
fn handle_update_manual(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let cell = match required_str(req, "cell") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let student = match required_str(req, "student") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let key = grade_key(&assignment, &notebook, &cell, &student);
    if let Err(e) = gb.set_manual_score(key, optional_f64(req, "score")) {
        return domain_err(&req.id, &e);
    }
    if req.params.get("extraCredit").is_some() {
        if let Err(e) = gb.set_extra_credit(key, optional_f64(req, "extraCredit")) {
            return domain_err(&req.id, &e);
        }
    }
    match gb.find_grade(key) {
        Ok(grade) => ok(
            &req.id,
            json!({
                "autoScore": grade.auto_score,
                "manualScore": grade.manual_score,
                "extraCredit": grade.extra_credit,
                "score": grade.score(),
            }),
        ),
        Err(e) => domain_err(&req.id, &e),
    }
}

fn handle_update_comment(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let cell = match required_str(req, "cell") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let student = match required_str(req, "student") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let key = grade_key(&assignment, &notebook, &cell, &student);
    match gb.set_comment(key, optional_str(req, "comment")) {
        Ok(()) => ok(&req.id, json!({ "ok": true })),
        Err(e) => domain_err(&req.id, &e),
    }
}

fn handle_flag_notebook(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let student = match required_str(req, "student") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let key = SubmittedNotebookKey {
        assignment: &assignment,
        notebook: &notebook,
        student: &student,
    };
    match gb.flag_submitted_notebook(key, flag(req, "flagged")) {
        Ok(()) => ok(&req.id, json!({ "ok": true })),
        Err(e) => domain_err(&req.id, &e),
    }
}

fn handle_set_late_penalty(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let student = match required_str(req, "student") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let key = SubmittedNotebookKey {
        assignment: &assignment,
        notebook: &notebook,
        student: &student,
    };
    match gb.set_late_penalty(key, optional_f64(req, "penalty")) {
        Ok(()) => ok(&req.id, json!({ "ok": true })),
        Err(e) => domain_err(&req.id, &e),
    }
}

fn handle_set_extension(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    match gb.set_submission_extension(key, optional_i64(req, "extensionSeconds")) {
        Ok(()) => ok(&req.id, json!({ "ok": true })),
        Err(e) => domain_err(&req.id, &e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "submissions.list" => Some(handle_list(state, req)),
        "submissions.reconcile" => Some(handle_reconcile(state, req)),
        "submissions.recordExecution" => Some(handle_record_execution(state, req)),
        "submissions.flagNotebook" => Some(handle_flag_notebook(state, req)),
        "submissions.setLatePenalty" => Some(handle_set_late_penalty(state, req)),
        "submissions.setExtension" => Some(handle_set_extension(state, req)),
        "grades.updateManual" => Some(handle_update_manual(state, req)),
        "comments.update" => Some(handle_update_comment(state, req)),
        _ => None,
    }
}
