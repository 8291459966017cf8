//! Cell reconciliation: corrects a submitted notebook's grading-relevant
//! cells against the instructor's authoritative copy without destroying the
//! student's answer text.
//!
//! Anomalies degrade per cell (warn, correct, keep going); the one fatal case
//! is a locked cell whose checksum still mismatches after its source was
//! restored, which means the stored source or the checksum function itself is
//! corrupt.

use serde::Serialize;
use tracing::warn;

use crate::checksum;
use crate::error::{GradebookError, Result};
use crate::gradebook::Gradebook;
use crate::model::{CellRecord, CellType, NotebookCell, NotebookKey};

const RESTORED_NOTICE: &str =
    "Restored from the original assignment because it was missing from the submission.";

#[derive(Debug, Clone, Copy, Default)]
pub struct ReconcileOptions {
    /// Re-insert graded/task cells the student deleted.
    pub restore_missing: bool,
}

/// One correction applied to the submission; the change log callers surface
/// to graders.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "change", rename_all = "camelCase")]
pub enum CellChange {
    /// The submission names a cell the source never defined; its id was
    /// stripped and the cell left alone otherwise.
    UnknownCell { cell: String },
    /// The same id appeared on several cells; none can be trusted, so all of
    /// them were stripped.
    DuplicateCell { cell: String },
    TypeConverted {
        cell: String,
        from: CellType,
        to: CellType,
    },
    LockedFlagRestored { cell: String, locked: bool },
    PointsRestored { cell: String, points: f64 },
    /// Locked content was edited; the authoritative source was put back.
    SourceRestored { cell: String },
    /// A deleted graded/task cell was synthesized from the authoritative
    /// copy at the given index.
    CellRestored { cell: String, position: usize },
}

#[derive(Debug, Clone, Default)]
pub struct ReconcileOutcome {
    pub cells: Vec<NotebookCell>,
    pub changes: Vec<CellChange>,
    /// Authoritative kernelspec when reconciling against the store.
    pub kernelspec: Option<String>,
}

/// Reconciles a submission against the recorded cell structure of the given
/// notebook.
pub fn reconcile_notebook(
    gb: &Gradebook,
    key: NotebookKey<'_>,
    submitted: &[NotebookCell],
    options: ReconcileOptions,
) -> Result<ReconcileOutcome> {
    let notebook = gb.find_notebook(key)?;
    let authoritative = gb.list_cells(key)?;
    let mut outcome = reconcile_cells(&authoritative, submitted, options)?;
    outcome.kernelspec = notebook.kernelspec;
    Ok(outcome)
}

/// The pure core: authoritative cell descriptors in, corrected cells and a
/// change log out.
pub fn reconcile_cells(
    authoritative: &[CellRecord],
    submitted: &[NotebookCell],
    options: ReconcileOptions,
) -> Result<ReconcileOutcome> {
    let mut cells: Vec<NotebookCell> = submitted.to_vec();
    let mut changes = Vec::new();

    strip_duplicate_ids(&mut cells, &mut changes);

    for cell in &mut cells {
        let Some(name) = cell.grade_id().map(str::to_string) else {
            continue;
        };
        let Some(auth) = authoritative.iter().find(|a| a.name == name) else {
            warn!(cell = %name, "submission names a cell the source never defined; stripping id");
            cell.metadata.grade_id = None;
            changes.push(CellChange::UnknownCell { cell: name });
            continue;
        };
        reconcile_one(cell, auth, &mut changes)?;
    }

    if options.restore_missing {
        restore_missing_cells(authoritative, &mut cells, &mut changes);
    }

    Ok(ReconcileOutcome {
        cells,
        changes,
        kernelspec: None,
    })
}

/// An id carried by more than one cell is untrustworthy on every one of
/// them: strip the grading metadata from all occurrences. With restoration
/// enabled the authoritative copy comes back in afterwards.
fn strip_duplicate_ids(cells: &mut [NotebookCell], changes: &mut Vec<CellChange>) {
    let mut seen = Vec::new();
    let mut duplicated = Vec::new();
    for cell in cells.iter() {
        if let Some(name) = cell.grade_id() {
            if seen.contains(&name.to_string()) {
                duplicated.push(name.to_string());
            } else {
                seen.push(name.to_string());
            }
        }
    }
    for cell in cells.iter_mut() {
        let Some(name) = cell.grade_id().map(str::to_string) else {
            continue;
        };
        if duplicated.contains(&name) {
            warn!(cell = %name, "id appears on more than one cell; stripping all of them");
            cell.metadata.grade_id = None;
            cell.metadata.grade = false;
            cell.metadata.solution = false;
            cell.metadata.task = false;
            cell.metadata.locked = false;
            changes.push(CellChange::DuplicateCell { cell: name });
        }
    }
}

fn reconcile_one(
    cell: &mut NotebookCell,
    auth: &CellRecord,
    changes: &mut Vec<CellChange>,
) -> Result<()> {
    // Cell type drift: force-convert back, clearing execution state either
    // way since it belongs to the old type.
    if cell.cell_type != auth.cell_type {
        warn!(
            cell = %auth.name,
            from = cell.cell_type.as_str(),
            to = auth.cell_type.as_str(),
            "cell type changed; converting back"
        );
        changes.push(CellChange::TypeConverted {
            cell: auth.name.clone(),
            from: cell.cell_type,
            to: auth.cell_type,
        });
        cell.cell_type = auth.cell_type;
        cell.outputs.clear();
        cell.execution_count = None;
    }

    // Locked flag drift, judged on the computed flag (grade cells lock
    // implicitly, solution cells never lock).
    if checksum::is_locked(cell) != auth.locked {
        warn!(cell = %auth.name, locked = auth.locked, "locked flag changed; restoring");
        changes.push(CellChange::LockedFlagRestored {
            cell: auth.name.clone(),
            locked: auth.locked,
        });
        cell.metadata.locked = auth.locked;
    }

    // Points are never student-controlled.
    if auth.graded {
        let points = auth.max_score.unwrap_or(0.0);
        if cell.metadata.points != Some(points) {
            warn!(cell = %auth.name, points, "point value changed; restoring");
            changes.push(CellChange::PointsRestored {
                cell: auth.name.clone(),
                points,
            });
            cell.metadata.points = Some(points);
        }
    }

    // Always refresh the checksum metadata to the recorded authored value;
    // grade determination compares the current content against it.
    cell.metadata.checksum = auth.checksum.clone();

    // Locked content must still hash to the recorded checksum. If not, the
    // student edited it: put the authoritative source back and re-verify.
    if auth.locked {
        if let Some(recorded) = auth.checksum.as_deref() {
            if checksum::compute_checksum(cell) != recorded {
                warn!(cell = %auth.name, "locked content was edited; restoring source");
                changes.push(CellChange::SourceRestored {
                    cell: auth.name.clone(),
                });
                cell.source = auth.source.clone().unwrap_or_default();
                if checksum::compute_checksum(cell) != recorded {
                    return Err(GradebookError::InconsistentChecksum(auth.name.clone()));
                }
            }
        }
    }

    Ok(())
}

/// Synthesizes deleted graded/task cells from the authoritative copy.
///
/// Graded cells go back immediately after the last preceding authoritative
/// cell the student kept (walking the authoritative order, so each prior
/// restoration becomes the next one's anchor), or at the start when nothing
/// precedes them. Task cells carry no reliable anchor and are appended at the
/// end in their original relative order.
fn restore_missing_cells(
    authoritative: &[CellRecord],
    cells: &mut Vec<NotebookCell>,
    changes: &mut Vec<CellChange>,
) {
    let position_of =
        |cells: &[NotebookCell], name: &str| cells.iter().position(|c| c.grade_id() == Some(name));

    let mut anchor: Option<usize> = None;
    for auth in authoritative {
        if let Some(idx) = position_of(cells, &auth.name) {
            anchor = Some(idx);
            continue;
        }
        if auth.task || !auth.graded {
            continue;
        }
        let insert_at = anchor.map(|i| i + 1).unwrap_or(0);
        warn!(cell = %auth.name, position = insert_at, "graded cell missing; restoring");
        cells.insert(insert_at, synthesize_cell(auth));
        changes.push(CellChange::CellRestored {
            cell: auth.name.clone(),
            position: insert_at,
        });
        anchor = Some(insert_at);
    }

    for auth in authoritative {
        if !auth.task || position_of(cells, &auth.name).is_some() {
            continue;
        }
        warn!(cell = %auth.name, "task cell missing; appending");
        cells.push(synthesize_cell(auth));
        changes.push(CellChange::CellRestored {
            cell: auth.name.clone(),
            position: cells.len() - 1,
        });
    }
}

fn synthesize_cell(auth: &CellRecord) -> NotebookCell {
    let mut cell = NotebookCell {
        cell_type: auth.cell_type,
        source: auth.source.clone().unwrap_or_default(),
        outputs: Vec::new(),
        execution_count: None,
        metadata: Default::default(),
    };
    cell.metadata.grade = auth.graded;
    cell.metadata.solution = auth.solution;
    cell.metadata.task = auth.task;
    cell.metadata.locked = auth.locked;
    cell.metadata.grade_id = Some(auth.name.clone());
    if auth.graded || auth.task {
        cell.metadata.points = Some(auth.max_score.unwrap_or(0.0));
    }
    cell.metadata.checksum = auth.checksum.clone();
    // Students must not remove it again; solution regions stay editable.
    cell.metadata.deletable = Some(false);
    cell.metadata.editable = Some(auth.solution);
    cell.metadata.notice = Some(RESTORED_NOTICE.to_string());
    cell
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CellMetadata;

    /// Builds the authored master cell and its recorded descriptor, the way
    /// the assign step records them.
    fn authored(
        name: &str,
        cell_type: CellType,
        graded: bool,
        solution: bool,
        task: bool,
        points: f64,
        source: &str,
        position: i64,
    ) -> (CellRecord, NotebookCell) {
        let master = NotebookCell {
            cell_type,
            source: source.to_string(),
            outputs: Vec::new(),
            execution_count: None,
            metadata: CellMetadata {
                grade: graded,
                solution,
                task,
                locked: false,
                grade_id: Some(name.to_string()),
                points: if graded || task { Some(points) } else { None },
                ..CellMetadata::default()
            },
        };
        let digest = checksum::compute_checksum(&master);
        let record = CellRecord {
            id: format!("cell-{name}"),
            notebook_id: "nb-1".to_string(),
            name: name.to_string(),
            cell_type,
            position,
            graded,
            solution,
            task,
            has_source: true,
            max_score: if graded || task { Some(points) } else { None },
            source: Some(source.to_string()),
            checksum: Some(digest.clone()),
            locked: checksum::is_locked(&master),
        };
        // What the student receives: the master cell with its checksum
        // stamped into the metadata.
        let mut released = master;
        released.metadata.checksum = Some(digest);
        (record, released)
    }

    fn names(cells: &[NotebookCell]) -> Vec<&str> {
        cells.iter().filter_map(|c| c.grade_id()).collect()
    }

    #[test]
    fn untouched_submission_reconciles_cleanly() {
        let (rec1, cell1) = authored("test1", CellType::Code, true, false, false, 1.0, "assert", 0);
        let (rec2, cell2) = authored("answer", CellType::Code, false, true, false, 0.0, "# here", 1);
        let outcome = reconcile_cells(
            &[rec1, rec2],
            &[cell1, cell2],
            ReconcileOptions::default(),
        )
        .unwrap();
        assert!(outcome.changes.is_empty());
        assert_eq!(outcome.cells.len(), 2);
    }

    #[test]
    fn unknown_cell_gets_its_id_stripped() {
        let (rec, cell) = authored("test1", CellType::Code, true, false, false, 1.0, "assert", 0);
        let mut bogus = cell.clone();
        bogus.metadata.grade_id = Some("made_up".to_string());
        let outcome =
            reconcile_cells(&[rec], &[cell, bogus], ReconcileOptions::default()).unwrap();
        assert_eq!(
            outcome.changes,
            vec![CellChange::UnknownCell {
                cell: "made_up".to_string()
            }]
        );
        assert_eq!(outcome.cells[1].grade_id(), None);
    }

    #[test]
    fn duplicated_ids_are_stripped_everywhere() {
        let (rec, cell) = authored("test1", CellType::Code, true, false, false, 1.0, "assert", 0);
        let copy = cell.clone();
        let outcome =
            reconcile_cells(&[rec], &[cell, copy], ReconcileOptions::default()).unwrap();
        assert_eq!(outcome.changes.len(), 2);
        assert!(outcome
            .changes
            .iter()
            .all(|c| matches!(c, CellChange::DuplicateCell { .. })));
        assert!(names(&outcome.cells).is_empty());
    }

    #[test]
    fn changed_type_is_converted_back() {
        let (rec, mut cell) =
            authored("test1", CellType::Code, true, false, false, 1.0, "assert", 0);
        cell.cell_type = CellType::Markdown;
        cell.execution_count = Some(3);
        let outcome = reconcile_cells(&[rec], &[cell], ReconcileOptions::default()).unwrap();
        assert!(matches!(
            outcome.changes[0],
            CellChange::TypeConverted {
                from: CellType::Markdown,
                to: CellType::Code,
                ..
            }
        ));
        assert_eq!(outcome.cells[0].cell_type, CellType::Code);
        assert_eq!(outcome.cells[0].execution_count, None);
    }

    #[test]
    fn student_controlled_points_are_overwritten() {
        let (rec, mut cell) =
            authored("test1", CellType::Code, true, false, false, 1.0, "assert", 0);
        cell.metadata.points = Some(100.0);
        let outcome = reconcile_cells(&[rec], &[cell], ReconcileOptions::default()).unwrap();
        assert!(outcome
            .changes
            .contains(&CellChange::PointsRestored {
                cell: "test1".to_string(),
                points: 1.0
            }));
        assert_eq!(outcome.cells[0].metadata.points, Some(1.0));
    }

    #[test]
    fn edited_locked_source_is_restored() {
        let (rec, mut cell) =
            authored("test1", CellType::Code, true, false, false, 1.0, "assert x", 0);
        cell.source = "assert True".to_string();
        let outcome = reconcile_cells(&[rec], &[cell], ReconcileOptions::default()).unwrap();
        assert!(outcome
            .changes
            .contains(&CellChange::SourceRestored {
                cell: "test1".to_string()
            }));
        assert_eq!(outcome.cells[0].source, "assert x");
    }

    #[test]
    fn corrupt_recorded_checksum_is_fatal() {
        let (mut rec, mut cell) =
            authored("test1", CellType::Code, true, false, false, 1.0, "assert x", 0);
        rec.checksum = Some("0000".to_string());
        cell.source = "assert True".to_string();
        let err = reconcile_cells(&[rec], &[cell], ReconcileOptions::default()).unwrap_err();
        assert!(matches!(err, GradebookError::InconsistentChecksum(_)));
    }

    #[test]
    fn tampered_locked_flag_is_restored() {
        let (rec, mut cell) =
            authored("readme", CellType::Markdown, false, false, false, 0.0, "rules", 0);
        // Authored unlocked; the student marks it locked.
        cell.metadata.locked = true;
        let outcome = reconcile_cells(&[rec], &[cell], ReconcileOptions::default()).unwrap();
        assert!(outcome
            .changes
            .contains(&CellChange::LockedFlagRestored {
                cell: "readme".to_string(),
                locked: false
            }));
        assert!(!outcome.cells[0].metadata.locked);
    }

    #[test]
    fn deleted_graded_cell_is_restored_after_its_predecessor() {
        let (rec1, cell1) = authored("intro", CellType::Markdown, false, false, false, 0.0, "hi", 0);
        let (rec2, _cell2) =
            authored("test1", CellType::Code, true, false, false, 2.0, "assert f()", 1);
        let (rec3, cell3) = authored("test2", CellType::Code, true, false, false, 1.0, "assert g()", 2);

        // The student deleted test1 but kept intro and test2.
        let outcome = reconcile_cells(
            &[rec1, rec2.clone(), rec3],
            &[cell1, cell3],
            ReconcileOptions {
                restore_missing: true,
            },
        )
        .unwrap();

        assert_eq!(names(&outcome.cells), vec!["intro", "test1", "test2"]);
        assert!(outcome
            .changes
            .contains(&CellChange::CellRestored {
                cell: "test1".to_string(),
                position: 1
            }));

        let restored = &outcome.cells[1];
        assert_eq!(restored.source, "assert f()");
        assert_eq!(restored.metadata.points, Some(2.0));
        assert!(restored.metadata.locked);
        assert_eq!(restored.metadata.deletable, Some(false));
        assert_eq!(restored.metadata.editable, Some(false));
        assert!(restored.metadata.notice.is_some());
        assert_eq!(restored.metadata.checksum.as_deref(), rec2.checksum.as_deref());
    }

    #[test]
    fn cell_with_no_kept_predecessor_is_restored_at_the_start() {
        let (rec1, _cell1) =
            authored("test1", CellType::Code, true, false, false, 1.0, "assert", 0);
        let (rec2, cell2) = authored("outro", CellType::Markdown, false, false, false, 0.0, "bye", 1);
        let outcome = reconcile_cells(
            &[rec1, rec2],
            &[cell2],
            ReconcileOptions {
                restore_missing: true,
            },
        )
        .unwrap();
        assert_eq!(names(&outcome.cells), vec!["test1", "outro"]);
    }

    #[test]
    fn consecutive_restorations_anchor_on_each_other() {
        let (rec1, cell1) = authored("intro", CellType::Markdown, false, false, false, 0.0, "hi", 0);
        let (rec2, _) = authored("test1", CellType::Code, true, false, false, 1.0, "a", 1);
        let (rec3, _) = authored("test2", CellType::Code, true, false, false, 1.0, "b", 2);
        let outcome = reconcile_cells(
            &[rec1, rec2, rec3],
            &[cell1],
            ReconcileOptions {
                restore_missing: true,
            },
        )
        .unwrap();
        assert_eq!(names(&outcome.cells), vec!["intro", "test1", "test2"]);
    }

    #[test]
    fn missing_task_cells_are_appended_in_order() {
        let (rec1, cell1) = authored("test1", CellType::Code, true, false, false, 1.0, "a", 0);
        let (rec2, _) = authored("taskA", CellType::Markdown, false, false, true, 3.0, "do A", 1);
        let (rec3, _) = authored("taskB", CellType::Markdown, false, false, true, 2.0, "do B", 2);
        let outcome = reconcile_cells(
            &[rec1, rec2, rec3],
            &[cell1],
            ReconcileOptions {
                restore_missing: true,
            },
        )
        .unwrap();
        assert_eq!(names(&outcome.cells), vec!["test1", "taskA", "taskB"]);
        assert_eq!(outcome.cells[1].metadata.points, Some(3.0));
        // Solution regions stay editable; tasks do not.
        assert_eq!(outcome.cells[1].metadata.editable, Some(false));
    }

    #[test]
    fn restored_solution_cell_stays_editable() {
        let (rec, _) = authored("answer", CellType::Code, true, true, false, 2.0, "# here", 0);
        let outcome = reconcile_cells(
            &[rec],
            &[],
            ReconcileOptions {
                restore_missing: true,
            },
        )
        .unwrap();
        assert_eq!(outcome.cells[0].metadata.editable, Some(true));
        assert_eq!(outcome.cells[0].metadata.deletable, Some(false));
    }

    #[test]
    fn restoration_is_off_by_default() {
        let (rec, _) = authored("test1", CellType::Code, true, false, false, 1.0, "a", 0);
        let outcome = reconcile_cells(&[rec], &[], ReconcileOptions::default()).unwrap();
        assert!(outcome.cells.is_empty());
        assert!(outcome.changes.is_empty());
    }
}
