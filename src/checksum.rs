//! Cell fingerprinting and automatic grade determination.
//!
//! The checksum is a content+metadata fingerprint: the instructor's machine
//! records it at assign time, the autograder recomputes it on the submitted
//! cell, and any difference on locked content means the cell was tampered
//! with. For solution cells an *unchanged* checksum means the student never
//! replaced the placeholder, i.e. left the answer blank.

use sha2::{Digest, Sha256};

use crate::error::{GradebookError, Result};
use crate::model::{CellType, NotebookCell};

pub fn is_grade(cell: &NotebookCell) -> bool {
    cell.metadata.grade
}

pub fn is_solution(cell: &NotebookCell) -> bool {
    cell.metadata.solution
}

pub fn is_task(cell: &NotebookCell) -> bool {
    cell.metadata.task
}

/// A solution cell is never locked, whatever its metadata claims: the student
/// has to be able to edit it. Grade cells are always locked; anything else is
/// locked only when marked so explicitly.
pub fn is_locked(cell: &NotebookCell) -> bool {
    if cell.metadata.solution {
        false
    } else if cell.metadata.grade {
        true
    } else {
        cell.metadata.locked
    }
}

/// Fingerprint of a cell's content and grading metadata.
///
/// Feeds, in fixed order: source bytes, cell type, the grade/solution/locked
/// flags, the grade id, and (grade cells only) the point value. Identical
/// inputs produce identical digests on any host, which is what lets the
/// instructor-side and student-side copies be compared at all.
pub fn compute_checksum(cell: &NotebookCell) -> String {
    let mut hasher = Sha256::new();
    hasher.update(cell.source.as_bytes());
    hasher.update(cell.cell_type.as_str().as_bytes());
    hasher.update(if is_grade(cell) { "true" } else { "false" });
    hasher.update(if is_solution(cell) { "true" } else { "false" });
    hasher.update(if is_locked(cell) { "true" } else { "false" });
    hasher.update(cell.grade_id().unwrap_or(""));
    if is_grade(cell) {
        hasher.update(format!("{}", cell.metadata.points.unwrap_or(0.0)));
    }
    format!("{:x}", hasher.finalize())
}

/// Automatic score for one executed grade cell: `(score, max_score)` with
/// `score = None` when only a human can judge the answer.
///
/// Solution cells are scored zero when the checksum proves the placeholder
/// was never touched; a modified solution cell is free text and needs manual
/// grading. Non-solution code cells are binary pass/fail on their outputs.
pub fn determine_grade(cell: &NotebookCell) -> Result<(Option<f64>, f64)> {
    if !is_grade(cell) {
        return Err(GradebookError::NotAGradeCell(
            cell.grade_id().unwrap_or("<unnamed>").to_string(),
        ));
    }
    let max_score = cell.metadata.points.unwrap_or(0.0);

    if is_solution(cell) {
        let unanswered = cell
            .metadata
            .checksum
            .as_deref()
            .map(|recorded| recorded == compute_checksum(cell))
            .unwrap_or(false);
        if unanswered {
            return Ok((Some(0.0), max_score));
        }
        return Ok((None, max_score));
    }

    if cell.cell_type == CellType::Code {
        if cell.outputs.iter().any(|o| o.is_error()) {
            return Ok((Some(0.0), max_score));
        }
        return Ok((Some(max_score), max_score));
    }

    // A grade cell that is neither a solution nor executable carries no
    // signal the autograder can score.
    Ok((None, max_score))
}
