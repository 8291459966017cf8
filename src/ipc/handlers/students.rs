use serde_json::json;

use crate::ipc::error::{domain_err, ok};
use crate::ipc::helpers::{flag, gradebook, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use crate::model::StudentRecord;

fn student_json(s: &StudentRecord) -> serde_json::Value {
    json!({
        "studentId": s.id,
        "firstName": s.first_name,
        "lastName": s.last_name,
        "email": s.email,
        "lmsUserId": s.lms_user_id,
    })
}

fn record_from_params(req: &Request, id: String) -> StudentRecord {
    StudentRecord {
        id,
        first_name: optional_str(req, "firstName"),
        last_name: optional_str(req, "lastName"),
        email: optional_str(req, "email"),
        lms_user_id: optional_str(req, "lmsUserId"),
    }
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let gb = match gradebook(state, req) {
        Ok(gb) => gb,
        Err(resp) => return resp,
    };
    match gb.list_students() {
        Ok(students) => ok(
            &req.id,
            json!({ "students": students.iter().map(student_json).collect::<Vec<_>>() }),
        ),
        Err(e) => domain_err(&req.id, &e),
    }
}

fn handle_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let gb = match gradebook(state, req) {
        Ok(gb) => gb,
        Err(resp) => return resp,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let record = record_from_params(req, student_id);
    match gb.add_student(&record) {
        Ok(()) => ok(&req.id, json!({ "student": student_json(&record) })),
        Err(e) => domain_err(&req.id, &e),
    }
}

fn handle_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let gb = match gradebook(state, req) {
        Ok(gb) => gb,
        Err(resp) => return resp,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let record = record_from_params(req, student_id);
    match gb.update_or_create_student(&record) {
        Ok(created) => ok(
            &req.id,
            json!({ "student": student_json(&record), "created": created }),
        ),
        Err(e) => domain_err(&req.id, &e),
    }
}

fn handle_remove(state: &mut AppState, req: &Request) -> serde_json::Value {
    let gb = match gradebook(state, req) {
        Ok(gb) => gb,
        Err(resp) => return resp,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match gb.remove_student(&student_id, flag(req, "force")) {
        Ok(()) => ok(&req.id, json!({ "ok": true })),
        Err(e) => domain_err(&req.id, &e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(handle_list(state, req)),
        "students.create" => Some(handle_create(state, req)),
        "students.update" => Some(handle_update(state, req)),
        "students.remove" => Some(handle_remove(state, req)),
        _ => None,
    }
}
