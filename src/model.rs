use chrono::{NaiveDateTime, TimeDelta};
use serde::{Deserialize, Serialize};

use crate::checksum;
use crate::error::{GradebookError, Result};

/// Notebook cell flavor, stored as TEXT in the `cells` table and carried
/// verbatim in the JSON cell records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellType {
    Code,
    Markdown,
    Raw,
}

impl CellType {
    pub fn as_str(self) -> &'static str {
        match self {
            CellType::Code => "code",
            CellType::Markdown => "markdown",
            CellType::Raw => "raw",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "code" => Ok(CellType::Code),
            "markdown" => Ok(CellType::Markdown),
            "raw" => Ok(CellType::Raw),
            other => Err(GradebookError::invalid(
                "cell_type",
                other,
                "must be one of: code, markdown, raw",
            )),
        }
    }
}

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

pub fn format_timestamp(ts: NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Accepts the canonical `T`-separated form, the space-separated form many
/// transports emit, and a bare date (taken as midnight).
pub fn parse_timestamp(raw: &str) -> Result<NaiveDateTime> {
    let t = raw.trim();
    NaiveDateTime::parse_from_str(t, TIMESTAMP_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(t, "%Y-%m-%d %H:%M:%S%.f"))
        .or_else(|_| NaiveDateTime::parse_from_str(&format!("{t}T00:00:00"), TIMESTAMP_FORMAT))
        .map_err(|e| GradebookError::invalid("timestamp", t, e.to_string()))
}

// ---------------------------------------------------------------------------
// Persisted records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AssignmentRecord {
    pub id: String,
    pub course_id: String,
    pub name: String,
    pub duedate: Option<NaiveDateTime>,
}

#[derive(Debug, Clone)]
pub struct NotebookRecord {
    pub id: String,
    pub assignment_id: String,
    pub name: String,
    pub kernelspec: Option<String>,
}

/// One row of the `cells` table: a single cell descriptor carrying a
/// capability set instead of the four sibling-entity split (grade / solution
/// / source / task). A cell may be graded+solution+source at once; graded
/// and task are mutually exclusive.
#[derive(Debug, Clone)]
pub struct CellRecord {
    pub id: String,
    pub notebook_id: String,
    pub name: String,
    pub cell_type: CellType,
    /// Authoritative order within the notebook; the anchor for missing-cell
    /// restoration.
    pub position: i64,
    pub graded: bool,
    pub solution: bool,
    pub task: bool,
    pub has_source: bool,
    pub max_score: Option<f64>,
    pub source: Option<String>,
    pub checksum: Option<String>,
    pub locked: bool,
}

impl CellRecord {
    /// Points the cell is worth via either grading path.
    pub fn points(&self) -> f64 {
        if self.graded || self.task {
            self.max_score.unwrap_or(0.0)
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StudentRecord {
    pub id: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub lms_user_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SubmittedAssignmentRecord {
    pub id: String,
    pub assignment_id: String,
    pub student_id: String,
    pub timestamp: Option<NaiveDateTime>,
    /// Per-student extension in whole seconds, added to the assignment
    /// duedate for this submission only.
    pub extension_seconds: Option<i64>,
}

impl SubmittedAssignmentRecord {
    pub fn effective_duedate(
        &self,
        assignment_duedate: Option<NaiveDateTime>,
    ) -> Option<NaiveDateTime> {
        let due = assignment_duedate?;
        let Some(secs) = self.extension_seconds else {
            return Some(due);
        };
        // The extension arrives over the wire as an arbitrary i64; one large
        // enough to leave the calendar saturates instead of overflowing.
        Some(
            TimeDelta::try_seconds(secs)
                .and_then(|ext| due.checked_add_signed(ext))
                .unwrap_or(if secs >= 0 {
                    NaiveDateTime::MAX
                } else {
                    NaiveDateTime::MIN
                }),
        )
    }

    /// Seconds past the (extended) duedate, clamped at zero. Zero when either
    /// the duedate or the submission timestamp is unknown.
    pub fn total_seconds_late(&self, assignment_duedate: Option<NaiveDateTime>) -> i64 {
        let (Some(due), Some(ts)) = (self.effective_duedate(assignment_duedate), self.timestamp)
        else {
            return 0;
        };
        (ts - due).num_seconds().max(0)
    }
}

#[derive(Debug, Clone)]
pub struct SubmittedNotebookRecord {
    pub id: String,
    pub submitted_assignment_id: String,
    pub notebook_id: String,
    pub flagged: bool,
    /// Late-submission penalty recorded by the autograder; subtracted from
    /// the notebook's raw score, never below zero.
    pub late_penalty: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct GradeRecord {
    pub id: String,
    pub cell_id: String,
    pub submitted_notebook_id: String,
    pub auto_score: Option<f64>,
    pub manual_score: Option<f64>,
    pub extra_credit: Option<f64>,
}

impl GradeRecord {
    /// Manual score wins over auto score; extra credit lands on top of a
    /// present base only. With neither score set the grade counts zero.
    pub fn score(&self) -> f64 {
        match self.manual_score.or(self.auto_score) {
            Some(base) => base + self.extra_credit.unwrap_or(0.0),
            None => 0.0,
        }
    }

    pub fn needs_manual_grade(&self) -> bool {
        self.manual_score.is_none() && self.auto_score.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct CommentRecord {
    pub id: String,
    pub cell_id: String,
    pub submitted_notebook_id: String,
    pub manual_comment: Option<String>,
}

// ---------------------------------------------------------------------------
// Typed natural keys
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct NotebookKey<'a> {
    pub assignment: &'a str,
    pub notebook: &'a str,
}

#[derive(Debug, Clone, Copy)]
pub struct CellKey<'a> {
    pub assignment: &'a str,
    pub notebook: &'a str,
    pub cell: &'a str,
}

#[derive(Debug, Clone, Copy)]
pub struct SubmissionKey<'a> {
    pub assignment: &'a str,
    pub student: &'a str,
}

#[derive(Debug, Clone, Copy)]
pub struct SubmittedNotebookKey<'a> {
    pub assignment: &'a str,
    pub notebook: &'a str,
    pub student: &'a str,
}

#[derive(Debug, Clone, Copy)]
pub struct GradeKey<'a> {
    pub assignment: &'a str,
    pub notebook: &'a str,
    pub cell: &'a str,
    pub student: &'a str,
}

// ---------------------------------------------------------------------------
// Cells as consumed from the Execution Engine
// ---------------------------------------------------------------------------

fn is_false(b: &bool) -> bool {
    !*b
}

/// Grading metadata carried on a notebook cell. Flat on purpose: this is the
/// record shape the execution side hands over, not the notebook file format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CellMetadata {
    #[serde(default, skip_serializing_if = "is_false")]
    pub grade: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub solution: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub task: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub locked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grade_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub points: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub editable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletable: Option<bool>,
    /// Human-visible annotation, e.g. the auto-restored notice.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notice: Option<String>,
}

/// One output record from executing a code cell. Only `output_type` and the
/// stream `name` matter to grading; everything else passes through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CellOutput {
    pub output_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl CellOutput {
    /// An `error` output, or anything written to stderr, fails the cell.
    pub fn is_error(&self) -> bool {
        self.output_type == "error"
            || (self.output_type == "stream" && self.name.as_deref() == Some("stderr"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotebookCell {
    pub cell_type: CellType,
    #[serde(default)]
    pub source: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<CellOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_count: Option<i64>,
    #[serde(default)]
    pub metadata: CellMetadata,
}

impl NotebookCell {
    pub fn grade_id(&self) -> Option<&str> {
        self.metadata.grade_id.as_deref()
    }
}

// ---------------------------------------------------------------------------
// Authoring input for the assign step
// ---------------------------------------------------------------------------

/// One cell of the instructor's master notebook, reduced to what the store
/// keeps. `source`/`checksum` hold the authoritative copy used for tamper
/// detection and restoration.
#[derive(Debug, Clone)]
pub struct CellDefinition {
    pub name: String,
    pub cell_type: CellType,
    pub graded: bool,
    pub solution: bool,
    pub task: bool,
    pub max_score: Option<f64>,
    pub source: Option<String>,
    pub checksum: Option<String>,
    pub locked: bool,
}

impl CellDefinition {
    pub fn validate(&self) -> Result<()> {
        if self.graded && self.task {
            return Err(GradebookError::invalid(
                "cell",
                &self.name,
                "a cell cannot be both graded and task",
            ));
        }
        if (self.graded || self.task) && self.max_score.map(|m| m < 0.0).unwrap_or(true) {
            return Err(GradebookError::invalid(
                "cell",
                &self.name,
                "graded and task cells need a max score >= 0",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct NotebookDefinition {
    pub name: String,
    pub kernelspec: Option<String>,
    pub cells: Vec<CellDefinition>,
}

impl NotebookDefinition {
    /// Builds the template structure from the master notebook's cells. Cells
    /// without a grade_id carry no grading metadata and are skipped; every
    /// kept cell records its authoritative source and checksum.
    pub fn from_cells(name: &str, kernelspec: Option<String>, cells: &[NotebookCell]) -> Self {
        let mut defs = Vec::new();
        for cell in cells {
            let Some(grade_id) = cell.grade_id() else {
                continue;
            };
            defs.push(CellDefinition {
                name: grade_id.to_string(),
                cell_type: cell.cell_type,
                graded: cell.metadata.grade,
                solution: cell.metadata.solution,
                task: cell.metadata.task,
                max_score: if cell.metadata.grade || cell.metadata.task {
                    Some(cell.metadata.points.unwrap_or(0.0))
                } else {
                    None
                },
                source: Some(cell.source.clone()),
                checksum: Some(checksum::compute_checksum(cell)),
                locked: checksum::is_locked(cell),
            });
        }
        NotebookDefinition {
            name: name.to_string(),
            kernelspec,
            cells: defs,
        }
    }
}
