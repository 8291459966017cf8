use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use serde_json::json;

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_gradebookd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn gradebookd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> &str {
    assert_eq!(value.get("ok").and_then(|v| v.as_bool()), Some(false));
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|c| c.as_str())
        .unwrap_or("")
}

fn master_cells() -> serde_json::Value {
    json!([
        {
            "cell_type": "code",
            "source": "assert add(1, 1) == 2",
            "metadata": { "grade": true, "grade_id": "test_add", "points": 1.0 }
        },
        {
            "cell_type": "markdown",
            "source": "YOUR ANSWER HERE",
            "metadata": {
                "grade": true,
                "solution": true,
                "grade_id": "answer_essay",
                "points": 2.0
            }
        }
    ])
}

#[test]
fn full_grading_walk_over_the_wire() {
    let workspace = tempfile::tempdir().expect("tempdir");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    // Nothing works before a workspace is selected.
    let resp = request(&mut stdin, &mut reader, "1", "students.list", json!({}));
    assert_eq!(error_code(&resp), "no_workspace");

    let selected = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.select",
        json!({ "path": workspace.path().to_string_lossy() }),
    );
    assert_eq!(
        selected.get("course").and_then(|v| v.as_str()),
        Some("default")
    );

    let health = request_ok(&mut stdin, &mut reader, "3", "health", json!({}));
    assert_eq!(
        health.get("course").and_then(|v| v.as_str()),
        Some("default")
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "assignments.create",
        json!({ "name": "ps1", "duedate": "2026-01-15T23:59:00" }),
    );
    let dupe = request(
        &mut stdin,
        &mut reader,
        "5",
        "assignments.create",
        json!({ "name": "ps1" }),
    );
    assert_eq!(error_code(&dupe), "invalid_entry");

    let put = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "assignments.putNotebook",
        json!({
            "assignment": "ps1",
            "notebook": "p1",
            "kernelspec": "python3",
            "cells": master_cells()
        }),
    );
    assert_eq!(put.get("cells").and_then(|v| v.as_i64()), Some(2));

    let notebooks = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "notebooks.list",
        json!({ "assignment": "ps1" }),
    );
    assert_eq!(
        notebooks
            .get("notebooks")
            .and_then(|v| v.as_array())
            .map(|v| v.len()),
        Some(1)
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "students.create",
        json!({ "studentId": "alyssa", "firstName": "Alyssa" }),
    );

    // The driver reconciles the raw submission first, then records the
    // executed cells it got back.
    let mut submission = master_cells();
    submission[1]["source"] = json!("Because 1 + 1 = 2.");
    let reconciled = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "submissions.reconcile",
        json!({ "assignment": "ps1", "notebook": "p1", "cells": submission }),
    );
    assert_eq!(
        reconciled.get("kernelspec").and_then(|v| v.as_str()),
        Some("python3")
    );
    let corrected = reconciled.get("cells").cloned().expect("corrected cells");

    let recorded = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "submissions.recordExecution",
        json!({
            "assignment": "ps1",
            "notebook": "p1",
            "student": "alyssa",
            "timestamp": "2026-01-16T00:59:00",
            "cells": corrected
        }),
    );
    assert_eq!(recorded.get("gradedCells").and_then(|v| v.as_i64()), Some(2));
    assert_eq!(recorded.get("needsManual").and_then(|v| v.as_i64()), Some(1));

    let graded = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "grades.updateManual",
        json!({
            "assignment": "ps1",
            "notebook": "p1",
            "cell": "answer_essay",
            "student": "alyssa",
            "score": 2.0
        }),
    );
    assert_eq!(graded.get("score").and_then(|v| v.as_f64()), Some(2.0));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "comments.update",
        json!({
            "assignment": "ps1",
            "notebook": "p1",
            "cell": "answer_essay",
            "student": "alyssa",
            "comment": "Good reasoning."
        }),
    );

    let report = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "reports.submission",
        json!({ "assignment": "ps1", "student": "alyssa" }),
    );
    assert_eq!(report.get("score").and_then(|v| v.as_f64()), Some(3.0));
    assert_eq!(report.get("maxScore").and_then(|v| v.as_f64()), Some(3.0));
    assert_eq!(
        report.get("totalSecondsLate").and_then(|v| v.as_i64()),
        Some(3600)
    );
    assert_eq!(
        report
            .get("needsManualGrade")
            .and_then(|v| v.as_bool()),
        Some(false)
    );

    // An extension turns the hour of lateness into an on-time submission.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "submissions.setExtension",
        json!({ "assignment": "ps1", "student": "alyssa", "extensionSeconds": 7200 }),
    );
    let report = request_ok(
        &mut stdin,
        &mut reader,
        "15",
        "reports.submission",
        json!({ "assignment": "ps1", "student": "alyssa" }),
    );
    assert_eq!(
        report.get("totalSecondsLate").and_then(|v| v.as_i64()),
        Some(0)
    );

    let nb_report = request_ok(
        &mut stdin,
        &mut reader,
        "16",
        "reports.notebook",
        json!({ "assignment": "ps1", "notebook": "p1" }),
    );
    assert_eq!(
        nb_report.get("numSubmissions").and_then(|v| v.as_i64()),
        Some(1)
    );
    assert_eq!(
        nb_report.get("averageScore").and_then(|v| v.as_f64()),
        Some(3.0)
    );

    let student_report = request_ok(
        &mut stdin,
        &mut reader,
        "17",
        "reports.student",
        json!({ "student": "alyssa" }),
    );
    assert_eq!(
        student_report.get("score").and_then(|v| v.as_f64()),
        Some(3.0)
    );

    // Removal guards surface over the wire too.
    let refused = request(
        &mut stdin,
        &mut reader,
        "18",
        "assignments.remove",
        json!({ "name": "ps1" }),
    );
    assert_eq!(error_code(&refused), "has_submissions");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "19",
        "assignments.remove",
        json!({ "name": "ps1", "force": true }),
    );
    let listed = request_ok(&mut stdin, &mut reader, "20", "assignments.list", json!({}));
    assert_eq!(
        listed
            .get("assignments")
            .and_then(|v| v.as_array())
            .map(|v| v.len()),
        Some(0)
    );
}

#[test]
fn restore_missing_over_the_wire() {
    let workspace = tempfile::tempdir().expect("tempdir");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.path().to_string_lossy() }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "assignments.create",
        json!({ "name": "ps1" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "assignments.putNotebook",
        json!({ "assignment": "ps1", "notebook": "p1", "cells": master_cells() }),
    );

    // The student deleted the autograded test entirely.
    let submission = json!([
        {
            "cell_type": "markdown",
            "source": "My answer.",
            "metadata": {
                "grade": true,
                "solution": true,
                "grade_id": "answer_essay",
                "points": 2.0
            }
        }
    ]);
    let outcome = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "submissions.reconcile",
        json!({
            "assignment": "ps1",
            "notebook": "p1",
            "cells": submission,
            "restoreMissing": true
        }),
    );
    let cells = outcome
        .get("cells")
        .and_then(|v| v.as_array())
        .expect("cells");
    assert_eq!(cells.len(), 2);
    assert_eq!(
        cells[0]
            .get("metadata")
            .and_then(|m| m.get("grade_id"))
            .and_then(|v| v.as_str()),
        Some("test_add"),
        "the deleted first cell is restored at the start"
    );
    let changes = outcome
        .get("changes")
        .and_then(|v| v.as_array())
        .expect("changes");
    assert!(changes.iter().any(|c| {
        c.get("change").and_then(|v| v.as_str()) == Some("cellRestored")
            && c.get("cell").and_then(|v| v.as_str()) == Some("test_add")
    }));
}

#[test]
fn protocol_level_errors_have_stable_codes() {
    let workspace = tempfile::tempdir().expect("tempdir");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let resp = request(&mut stdin, &mut reader, "1", "nope.nothing", json!({}));
    assert_eq!(error_code(&resp), "not_implemented");

    let resp = request(&mut stdin, &mut reader, "2", "workspace.select", json!({}));
    assert_eq!(error_code(&resp), "bad_params");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "workspace.select",
        json!({ "path": workspace.path().to_string_lossy() }),
    );

    let resp = request(
        &mut stdin,
        &mut reader,
        "4",
        "submissions.list",
        json!({ "assignment": "ghost" }),
    );
    assert_eq!(error_code(&resp), "missing_entry");

    let resp = request(
        &mut stdin,
        &mut reader,
        "5",
        "assignments.create",
        json!({ "name": "ps1", "duedate": "not a timestamp" }),
    );
    assert_eq!(error_code(&resp), "bad_params");

    let resp = request(
        &mut stdin,
        &mut reader,
        "6",
        "submissions.recordExecution",
        json!({ "assignment": "ps1", "notebook": "p1", "student": "alyssa" }),
    );
    assert_eq!(error_code(&resp), "bad_params", "cells[] is required");

    // A line that is not JSON at all still gets an answer.
    writeln!(stdin, "this is not json").expect("write");
    stdin.flush().expect("flush");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse");
    assert_eq!(
        value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|c| c.as_str()),
        Some("bad_json")
    );
}
