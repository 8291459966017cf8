//! Derived score aggregation.
//!
//! Nothing here is ever persisted. Every rollup recomputes from grade and
//! cell rows on read, so a manual-score edit shows up in every report without
//! a cache invalidation path that could drift.

use std::collections::HashMap;

use serde::Serialize;

use crate::error::{GradebookError, Result};
use crate::gradebook::Gradebook;
use crate::model::{
    format_timestamp, CellType, GradeRecord, NotebookKey, SubmissionKey, SubmittedNotebookKey,
};

/// One grade joined with its template cell, the unit every rollup consumes.
#[derive(Debug, Clone)]
pub struct GradedCell {
    pub cell_name: String,
    pub cell_type: CellType,
    pub graded: bool,
    pub task: bool,
    pub max_score: f64,
    pub grade: GradeRecord,
}

impl GradedCell {
    pub fn score(&self) -> f64 {
        self.grade.score()
    }

    pub fn needs_manual_grade(&self) -> bool {
        self.grade.needs_manual_grade()
    }

    /// An autogradable code cell that scored below its maximum.
    pub fn failed_tests(&self) -> bool {
        self.graded && self.cell_type == CellType::Code && self.score() < self.max_score
    }
}

/// The score shape shared by every rollup level: totals, the per-kind
/// sub-splits, and the two OR-combined flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreBreakdown {
    pub score: f64,
    pub max_score: f64,
    pub code_score: f64,
    pub max_code_score: f64,
    pub written_score: f64,
    pub max_written_score: f64,
    pub task_score: f64,
    pub max_task_score: f64,
    pub needs_manual_grade: bool,
    pub failed_tests: bool,
}

impl ScoreBreakdown {
    fn absorb(&mut self, other: &ScoreBreakdown) {
        self.score += other.score;
        self.max_score += other.max_score;
        self.code_score += other.code_score;
        self.max_code_score += other.max_code_score;
        self.written_score += other.written_score;
        self.max_written_score += other.max_written_score;
        self.task_score += other.task_score;
        self.max_task_score += other.max_task_score;
        self.needs_manual_grade |= other.needs_manual_grade;
        self.failed_tests |= other.failed_tests;
    }
}

/// Rolls one submitted notebook's graded cells up. The late penalty comes off
/// the total, clamped at zero; the sub-splits stay raw.
pub fn notebook_breakdown(cells: &[GradedCell], late_penalty: Option<f64>) -> ScoreBreakdown {
    let mut out = ScoreBreakdown::default();
    for cell in cells {
        let score = cell.score();
        out.score += score;
        out.max_score += cell.max_score;
        if cell.task {
            out.task_score += score;
            out.max_task_score += cell.max_score;
        } else if cell.cell_type == CellType::Code {
            out.code_score += score;
            out.max_code_score += cell.max_score;
        } else {
            out.written_score += score;
            out.max_written_score += cell.max_score;
        }
        out.needs_manual_grade |= cell.needs_manual_grade();
        out.failed_tests |= cell.failed_tests();
    }
    if let Some(penalty) = late_penalty {
        out.score = (out.score - penalty).max(0.0);
    }
    out
}

/// Mean that treats an empty population as zero, so reports never see NaN.
pub fn mean_or_zero(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

// ---------------------------------------------------------------------------
// Report models
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmittedNotebookReport {
    pub student: String,
    pub notebook: String,
    pub flagged: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub late_penalty: Option<f64>,
    #[serde(flatten)]
    pub scores: ScoreBreakdown,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionReport {
    pub student: String,
    pub assignment: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extension_seconds: Option<i64>,
    pub total_seconds_late: i64,
    pub notebooks: Vec<SubmittedNotebookReport>,
    #[serde(flatten)]
    pub scores: ScoreBreakdown,
}

/// Template-level rollup for one notebook across every submission of it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotebookReport {
    pub assignment: String,
    pub notebook: String,
    pub num_submissions: usize,
    pub max_score: f64,
    pub max_code_score: f64,
    pub max_written_score: f64,
    pub max_task_score: f64,
    pub average_score: f64,
    pub average_code_score: f64,
    pub average_written_score: f64,
    pub average_task_score: f64,
    pub needs_manual_grade: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentSubmissionSummary {
    pub student: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    pub total_seconds_late: i64,
    #[serde(flatten)]
    pub scores: ScoreBreakdown,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentReport {
    pub assignment: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duedate: Option<String>,
    pub num_submissions: usize,
    pub max_score: f64,
    pub max_code_score: f64,
    pub max_written_score: f64,
    pub max_task_score: f64,
    pub average_score: f64,
    pub average_code_score: f64,
    pub average_written_score: f64,
    pub average_task_score: f64,
    pub needs_manual_grade: bool,
    pub submissions: Vec<AssignmentSubmissionSummary>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentReport {
    pub student: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lms_user_id: Option<String>,
    /// Sum over the student's submissions (penalties applied).
    pub score: f64,
    /// Sum over ALL assignments' template max, submitted or not.
    pub max_score: f64,
}

// ---------------------------------------------------------------------------
// Row loading
// ---------------------------------------------------------------------------

fn load_graded_cells(gb: &Gradebook, submitted_notebook_id: &str) -> Result<Vec<GradedCell>> {
    let mut stmt = gb.conn().prepare(
        "SELECT c.name, c.cell_type, c.graded, c.task, c.max_score,
                g.id, g.cell_id, g.submitted_notebook_id,
                g.auto_score, g.manual_score, g.extra_credit
         FROM grades g
         JOIN cells c ON c.id = g.cell_id
         WHERE g.submitted_notebook_id = ?
         ORDER BY c.position",
    )?;
    let raw = stmt
        .query_map([submitted_notebook_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, i64>(2)? != 0,
                r.get::<_, i64>(3)? != 0,
                r.get::<_, Option<f64>>(4)?,
                GradeRecord {
                    id: r.get(5)?,
                    cell_id: r.get(6)?,
                    submitted_notebook_id: r.get(7)?,
                    auto_score: r.get(8)?,
                    manual_score: r.get(9)?,
                    extra_credit: r.get(10)?,
                },
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut out = Vec::with_capacity(raw.len());
    for (cell_name, cell_type, graded, task, max_score, grade) in raw {
        out.push(GradedCell {
            cell_name,
            cell_type: CellType::from_str(&cell_type)?,
            graded,
            task,
            max_score: max_score.unwrap_or(0.0),
            grade,
        });
    }
    Ok(out)
}

/// Maximum points a notebook template is worth, split the same way the
/// per-submission breakdown splits. Folded in authoritative cell order so the
/// sum matches a full submission's sum exactly.
#[derive(Debug, Clone, Copy, Default)]
struct TemplateMax {
    max_score: f64,
    code: f64,
    written: f64,
    task: f64,
}

fn template_max(gb: &Gradebook, notebook_id: &str) -> Result<TemplateMax> {
    let mut stmt = gb.conn().prepare(
        "SELECT cell_type, graded, task, max_score FROM cells
         WHERE notebook_id = ? AND (graded = 1 OR task = 1)
         ORDER BY position",
    )?;
    let rows = stmt
        .query_map([notebook_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, i64>(1)? != 0,
                r.get::<_, i64>(2)? != 0,
                r.get::<_, Option<f64>>(3)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut out = TemplateMax::default();
    for (cell_type, graded, task, max_score) in rows {
        let max = max_score.unwrap_or(0.0);
        out.max_score += max;
        if task {
            out.task += max;
        } else if graded && CellType::from_str(&cell_type)? == CellType::Code {
            out.code += max;
        } else {
            out.written += max;
        }
    }
    Ok(out)
}

#[derive(Debug)]
struct SubmittedNotebookRow {
    id: String,
    notebook_id: String,
    notebook_name: String,
    flagged: bool,
    late_penalty: Option<f64>,
}

fn load_submitted_notebooks_of_submission(
    gb: &Gradebook,
    submitted_assignment_id: &str,
) -> Result<Vec<SubmittedNotebookRow>> {
    let mut stmt = gb.conn().prepare(
        "SELECT sn.id, sn.notebook_id, n.name, sn.flagged, sn.late_penalty
         FROM submitted_notebooks sn
         JOIN notebooks n ON n.id = sn.notebook_id
         WHERE sn.submitted_assignment_id = ?
         ORDER BY n.name",
    )?;
    let rows = stmt
        .query_map([submitted_assignment_id], |r| {
            Ok(SubmittedNotebookRow {
                id: r.get(0)?,
                notebook_id: r.get(1)?,
                notebook_name: r.get(2)?,
                flagged: r.get::<_, i64>(3)? != 0,
                late_penalty: r.get(4)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ---------------------------------------------------------------------------
// Report builders
// ---------------------------------------------------------------------------

/// Score rollup for one student's submission of one notebook.
pub fn submitted_notebook_report(
    gb: &Gradebook,
    key: SubmittedNotebookKey<'_>,
) -> Result<SubmittedNotebookReport> {
    let record = gb.find_submitted_notebook(key)?;
    let cells = load_graded_cells(gb, &record.id)?;
    Ok(SubmittedNotebookReport {
        student: key.student.to_string(),
        notebook: key.notebook.to_string(),
        flagged: record.flagged,
        late_penalty: record.late_penalty,
        scores: notebook_breakdown(&cells, record.late_penalty),
    })
}

/// Full breakdown of one student's submission of one assignment, the
/// per-submission read model graders consume.
pub fn submission_report(gb: &Gradebook, key: SubmissionKey<'_>) -> Result<SubmissionReport> {
    let assignment = gb.find_assignment(key.assignment)?;
    let submission = gb.find_submission(key)?;

    let mut notebooks = Vec::new();
    let mut total = ScoreBreakdown::default();
    for row in load_submitted_notebooks_of_submission(gb, &submission.id)? {
        let cells = load_graded_cells(gb, &row.id)?;
        let scores = notebook_breakdown(&cells, row.late_penalty);
        total.absorb(&scores);
        notebooks.push(SubmittedNotebookReport {
            student: key.student.to_string(),
            notebook: row.notebook_name,
            flagged: row.flagged,
            late_penalty: row.late_penalty,
            scores,
        });
    }

    Ok(SubmissionReport {
        student: key.student.to_string(),
        assignment: key.assignment.to_string(),
        timestamp: submission.timestamp.map(format_timestamp),
        extension_seconds: submission.extension_seconds,
        total_seconds_late: submission.total_seconds_late(assignment.duedate),
        notebooks,
        scores: total,
    })
}

/// Averages for one notebook template across every submission of it. Zero
/// submissions average to zero. Fails with InconsistentMaxScore when any
/// submission carries a partial or stale grade set, since max_score is a
/// template property that must agree across students.
pub fn notebook_report(gb: &Gradebook, key: NotebookKey<'_>) -> Result<NotebookReport> {
    let notebook = gb.find_notebook(key)?;
    let template = template_max(gb, &notebook.id)?;

    let mut stmt = gb.conn().prepare(
        "SELECT id, late_penalty FROM submitted_notebooks WHERE notebook_id = ?",
    )?;
    let submissions = stmt
        .query_map([&notebook.id], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, Option<f64>>(1)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut scores = Vec::with_capacity(submissions.len());
    let mut code_scores = Vec::with_capacity(submissions.len());
    let mut written_scores = Vec::with_capacity(submissions.len());
    let mut task_scores = Vec::with_capacity(submissions.len());
    let mut needs_manual_grade = false;
    for (submitted_notebook_id, late_penalty) in &submissions {
        let cells = load_graded_cells(gb, submitted_notebook_id)?;
        let bd = notebook_breakdown(&cells, *late_penalty);
        if bd.max_score != template.max_score {
            return Err(GradebookError::InconsistentMaxScore {
                notebook: key.notebook.to_string(),
                expected: template.max_score,
                got: bd.max_score,
            });
        }
        scores.push(bd.score);
        code_scores.push(bd.code_score);
        written_scores.push(bd.written_score);
        task_scores.push(bd.task_score);
        needs_manual_grade |= bd.needs_manual_grade;
    }

    Ok(NotebookReport {
        assignment: key.assignment.to_string(),
        notebook: key.notebook.to_string(),
        num_submissions: submissions.len(),
        max_score: template.max_score,
        max_code_score: template.code,
        max_written_score: template.written,
        max_task_score: template.task,
        average_score: mean_or_zero(&scores),
        average_code_score: mean_or_zero(&code_scores),
        average_written_score: mean_or_zero(&written_scores),
        average_task_score: mean_or_zero(&task_scores),
        needs_manual_grade,
    })
}

/// Per-student scores and averages for one assignment. Students who never
/// submitted are excluded from the averages entirely, not counted as zero.
pub fn assignment_report(gb: &Gradebook, assignment_name: &str) -> Result<AssignmentReport> {
    let assignment = gb.find_assignment(assignment_name)?;

    let mut stmt = gb
        .conn()
        .prepare("SELECT id, name FROM notebooks WHERE assignment_id = ? ORDER BY name")?;
    let notebooks: Vec<(String, String)> = stmt
        .query_map([&assignment.id], |r| Ok((r.get(0)?, r.get(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    drop(stmt);

    let mut template_total = ScoreBreakdown::default();
    let mut template_by_id: HashMap<String, TemplateMax> = HashMap::new();
    for (notebook_id, _) in &notebooks {
        let t = template_max(gb, notebook_id)?;
        template_total.max_score += t.max_score;
        template_total.max_code_score += t.code;
        template_total.max_written_score += t.written;
        template_total.max_task_score += t.task;
        template_by_id.insert(notebook_id.clone(), t);
    }

    let mut summaries = Vec::new();
    let mut scores = Vec::new();
    let mut code_scores = Vec::new();
    let mut written_scores = Vec::new();
    let mut task_scores = Vec::new();
    let mut needs_manual_grade = false;
    for submission in gb.list_submissions(assignment_name)? {
        let mut total = ScoreBreakdown::default();
        for row in load_submitted_notebooks_of_submission(gb, &submission.id)? {
            let cells = load_graded_cells(gb, &row.id)?;
            let bd = notebook_breakdown(&cells, row.late_penalty);
            let expected = template_by_id
                .get(&row.notebook_id)
                .map(|t| t.max_score)
                .unwrap_or(0.0);
            if bd.max_score != expected {
                return Err(GradebookError::InconsistentMaxScore {
                    notebook: row.notebook_name,
                    expected,
                    got: bd.max_score,
                });
            }
            total.absorb(&bd);
        }
        scores.push(total.score);
        code_scores.push(total.code_score);
        written_scores.push(total.written_score);
        task_scores.push(total.task_score);
        needs_manual_grade |= total.needs_manual_grade;
        summaries.push(AssignmentSubmissionSummary {
            student: submission.student_id.clone(),
            timestamp: submission.timestamp.map(format_timestamp),
            total_seconds_late: submission.total_seconds_late(assignment.duedate),
            scores: total,
        });
    }

    Ok(AssignmentReport {
        assignment: assignment_name.to_string(),
        duedate: assignment.duedate.map(format_timestamp),
        num_submissions: summaries.len(),
        max_score: template_total.max_score,
        max_code_score: template_total.max_code_score,
        max_written_score: template_total.max_written_score,
        max_task_score: template_total.max_task_score,
        average_score: mean_or_zero(&scores),
        average_code_score: mean_or_zero(&code_scores),
        average_written_score: mean_or_zero(&written_scores),
        average_task_score: mean_or_zero(&task_scores),
        needs_manual_grade,
        submissions: summaries,
    })
}

/// One student's totals across the whole course. The denominator counts every
/// assignment whether or not the student submitted it.
pub fn student_report(gb: &Gradebook, student_id: &str) -> Result<StudentReport> {
    let student = gb.find_student(student_id)?;

    let max_score: f64 = gb.conn().query_row(
        "SELECT COALESCE(SUM(c.max_score), 0.0)
         FROM cells c
         JOIN notebooks n ON n.id = c.notebook_id
         JOIN assignments a ON a.id = n.assignment_id
         WHERE a.course_id = ? AND (c.graded = 1 OR c.task = 1)",
        [gb.course_id()],
        |r| r.get(0),
    )?;

    let mut stmt = gb.conn().prepare(
        "SELECT sn.id, sn.late_penalty
         FROM submitted_notebooks sn
         JOIN submitted_assignments sa ON sa.id = sn.submitted_assignment_id
         JOIN assignments a ON a.id = sa.assignment_id
         WHERE a.course_id = ? AND sa.student_id = ?",
    )?;
    let rows = stmt
        .query_map((gb.course_id(), student_id), |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, Option<f64>>(1)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut score = 0.0;
    for (submitted_notebook_id, late_penalty) in rows {
        let cells = load_graded_cells(gb, &submitted_notebook_id)?;
        score += notebook_breakdown(&cells, late_penalty).score;
    }

    Ok(StudentReport {
        student: student.id,
        first_name: student.first_name,
        last_name: student.last_name,
        email: student.email,
        lms_user_id: student.lms_user_id,
        score,
        max_score,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graded_cell(
        name: &str,
        cell_type: CellType,
        max: f64,
        auto: Option<f64>,
        manual: Option<f64>,
    ) -> GradedCell {
        GradedCell {
            cell_name: name.to_string(),
            cell_type,
            graded: true,
            task: false,
            max_score: max,
            grade: GradeRecord {
                id: String::new(),
                cell_id: String::new(),
                submitted_notebook_id: String::new(),
                auto_score: auto,
                manual_score: manual,
                extra_credit: None,
            },
        }
    }

    fn task_cell(name: &str, max: f64, manual: Option<f64>) -> GradedCell {
        let mut cell = graded_cell(name, CellType::Markdown, max, None, manual);
        cell.graded = false;
        cell.task = true;
        cell
    }

    #[test]
    fn breakdown_splits_code_and_written() {
        let cells = vec![
            graded_cell("test1", CellType::Code, 1.0, Some(1.0), None),
            graded_cell("test2", CellType::Markdown, 2.0, None, Some(2.0)),
        ];
        let bd = notebook_breakdown(&cells, None);
        assert_eq!(bd.score, 3.0);
        assert_eq!(bd.max_score, 3.0);
        assert_eq!(bd.code_score, 1.0);
        assert_eq!(bd.max_code_score, 1.0);
        assert_eq!(bd.written_score, 2.0);
        assert_eq!(bd.max_written_score, 2.0);
        assert!(!bd.needs_manual_grade);
        assert!(!bd.failed_tests);
    }

    #[test]
    fn unscored_grade_counts_zero_but_flags_manual() {
        let cells = vec![
            graded_cell("test1", CellType::Code, 1.0, Some(1.0), None),
            graded_cell("test2", CellType::Markdown, 2.0, None, None),
        ];
        let bd = notebook_breakdown(&cells, None);
        assert_eq!(bd.score, 1.0);
        assert!(bd.needs_manual_grade);
    }

    #[test]
    fn task_cells_split_separately() {
        let cells = vec![
            graded_cell("test1", CellType::Code, 1.0, Some(1.0), None),
            task_cell("essay", 4.0, Some(3.0)),
        ];
        let bd = notebook_breakdown(&cells, None);
        assert_eq!(bd.score, 4.0);
        assert_eq!(bd.task_score, 3.0);
        assert_eq!(bd.max_task_score, 4.0);
        assert_eq!(bd.code_score, 1.0);
        assert_eq!(bd.written_score, 0.0);
    }

    #[test]
    fn late_penalty_subtracts_but_never_below_zero() {
        let cells = vec![graded_cell("test1", CellType::Code, 3.0, Some(3.0), None)];
        assert_eq!(notebook_breakdown(&cells, Some(1.0)).score, 2.0);
        assert_eq!(notebook_breakdown(&cells, Some(5.0)).score, 0.0);
        // Splits stay raw.
        assert_eq!(notebook_breakdown(&cells, Some(5.0)).code_score, 3.0);
    }

    #[test]
    fn failed_tests_only_for_code_graded_cells() {
        let short = graded_cell("test1", CellType::Code, 2.0, Some(1.0), None);
        assert!(short.failed_tests());

        let full = graded_cell("test2", CellType::Code, 2.0, Some(2.0), None);
        assert!(!full.failed_tests());

        let written = graded_cell("essay", CellType::Markdown, 2.0, Some(1.0), None);
        assert!(!written.failed_tests());

        let task = task_cell("task1", 2.0, Some(1.0));
        assert!(!task.failed_tests());
    }

    #[test]
    fn manual_score_overrides_auto() {
        let cell = graded_cell("test1", CellType::Code, 2.0, Some(2.0), Some(0.5));
        assert_eq!(cell.score(), 0.5);
        assert!(!cell.needs_manual_grade());
    }

    #[test]
    fn extra_credit_needs_a_base_score() {
        let mut cell = graded_cell("test1", CellType::Code, 2.0, Some(1.0), None);
        cell.grade.extra_credit = Some(0.5);
        assert_eq!(cell.score(), 1.5);

        cell.grade.auto_score = None;
        assert_eq!(cell.score(), 0.0);
        assert!(cell.needs_manual_grade());
    }

    #[test]
    fn empty_mean_is_zero() {
        assert_eq!(mean_or_zero(&[]), 0.0);
        assert_eq!(mean_or_zero(&[1.0, 2.0, 3.0]), 2.0);
    }

    #[test]
    fn absorb_sums_fields_and_ors_flags() {
        let cells_a = vec![graded_cell("a", CellType::Code, 1.0, Some(1.0), None)];
        let cells_b = vec![graded_cell("b", CellType::Markdown, 2.0, None, None)];
        let mut total = notebook_breakdown(&cells_a, None);
        total.absorb(&notebook_breakdown(&cells_b, None));
        assert_eq!(total.score, 1.0);
        assert_eq!(total.max_score, 3.0);
        assert!(total.needs_manual_grade);
    }
}
