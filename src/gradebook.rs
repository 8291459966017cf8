//! The gradebook handle: every operation the grading pipeline and the
//! reporting layers perform against one course's store.
//!
//! Template entities (assignments, notebooks, cells) are written by the
//! instructor-facing assign step and guarded against accidental grade loss:
//! removing anything that already has submissions requires `force`. Instance
//! entities (submissions, grades, comments) materialize lazily through
//! find-or-create keyed by natural-key tuples, so the autograder never has to
//! pre-provision rows.

use std::collections::HashSet;
use std::path::Path;

use chrono::NaiveDateTime;
use rusqlite::{Connection, OptionalExtension};
use tracing::warn;
use uuid::Uuid;

use crate::checksum;
use crate::db;
use crate::error::{is_unique_violation, GradebookError, Result};
use crate::model::{
    format_timestamp, parse_timestamp, AssignmentRecord, CellKey, CellRecord, CellType,
    CommentRecord, GradeKey, GradeRecord, NotebookCell, NotebookDefinition, NotebookKey,
    NotebookRecord, StudentRecord, SubmissionKey, SubmittedAssignmentRecord,
    SubmittedNotebookKey, SubmittedNotebookRecord,
};

/// What `record_execution` did for one submitted notebook.
#[derive(Debug, Clone, Default)]
pub struct ExecutionSummary {
    pub graded_cells: usize,
    pub needs_manual: usize,
    pub comments_created: usize,
}

pub struct Gradebook {
    conn: Connection,
    course_id: String,
}

impl Gradebook {
    /// Opens (creating if needed) the store under `workspace` and scopes
    /// every subsequent operation to `course_id`.
    pub fn open(workspace: &Path, course_id: &str) -> anyhow::Result<Self> {
        let conn = db::open_db(workspace)?;
        conn.execute("INSERT OR IGNORE INTO courses(id) VALUES(?)", [course_id])?;
        Ok(Gradebook {
            conn,
            course_id: course_id.to_string(),
        })
    }

    pub fn open_in_memory(course_id: &str) -> anyhow::Result<Self> {
        let conn = db::open_in_memory()?;
        conn.execute("INSERT OR IGNORE INTO courses(id) VALUES(?)", [course_id])?;
        Ok(Gradebook {
            conn,
            course_id: course_id.to_string(),
        })
    }

    pub fn course_id(&self) -> &str {
        &self.course_id
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    // -----------------------------------------------------------------------
    // Students
    // -----------------------------------------------------------------------

    pub fn add_student(&self, student: &StudentRecord) -> Result<()> {
        let res = self.conn.execute(
            "INSERT INTO students(id, first_name, last_name, email, lms_user_id)
             VALUES(?, ?, ?, ?, ?)",
            (
                &student.id,
                &student.first_name,
                &student.last_name,
                &student.email,
                &student.lms_user_id,
            ),
        );
        match res {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(GradebookError::invalid(
                "student",
                &student.id,
                "already exists",
            )),
            Err(e) => Err(e.into()),
        }
    }

    /// Upserts the student record; returns true when a new row was created.
    pub fn update_or_create_student(&self, student: &StudentRecord) -> Result<bool> {
        if self.conn.execute(
            "UPDATE students SET first_name = ?, last_name = ?, email = ?, lms_user_id = ?
             WHERE id = ?",
            (
                &student.first_name,
                &student.last_name,
                &student.email,
                &student.lms_user_id,
                &student.id,
            ),
        )? > 0
        {
            return Ok(false);
        }
        self.add_student(student)?;
        Ok(true)
    }

    pub fn find_student(&self, student_id: &str) -> Result<StudentRecord> {
        self.conn
            .query_row(
                "SELECT id, first_name, last_name, email, lms_user_id
                 FROM students WHERE id = ?",
                [student_id],
                |r| {
                    Ok(StudentRecord {
                        id: r.get(0)?,
                        first_name: r.get(1)?,
                        last_name: r.get(2)?,
                        email: r.get(3)?,
                        lms_user_id: r.get(4)?,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| GradebookError::missing("student", student_id))
    }

    pub fn list_students(&self) -> Result<Vec<StudentRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, first_name, last_name, email, lms_user_id
             FROM students ORDER BY id",
        )?;
        let rows = stmt
            .query_map([], |r| {
                Ok(StudentRecord {
                    id: r.get(0)?,
                    first_name: r.get(1)?,
                    last_name: r.get(2)?,
                    email: r.get(3)?,
                    lms_user_id: r.get(4)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Removing a student destroys their submissions and grades, so it is
    /// refused while any exist unless forced.
    pub fn remove_student(&self, student_id: &str, force: bool) -> Result<()> {
        self.find_student(student_id)?;
        let submissions: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM submitted_assignments WHERE student_id = ?",
            [student_id],
            |r| r.get(0),
        )?;
        if submissions > 0 && !force {
            return Err(GradebookError::HasSubmissions {
                kind: "student",
                key: student_id.to_string(),
            });
        }

        let tx = self.conn.unchecked_transaction()?;
        // Explicitly delete in dependency order (no ON DELETE CASCADE).
        tx.execute(
            "DELETE FROM grades WHERE submitted_notebook_id IN (
               SELECT sn.id FROM submitted_notebooks sn
               JOIN submitted_assignments sa ON sa.id = sn.submitted_assignment_id
               WHERE sa.student_id = ?)",
            [student_id],
        )?;
        tx.execute(
            "DELETE FROM comments WHERE submitted_notebook_id IN (
               SELECT sn.id FROM submitted_notebooks sn
               JOIN submitted_assignments sa ON sa.id = sn.submitted_assignment_id
               WHERE sa.student_id = ?)",
            [student_id],
        )?;
        tx.execute(
            "DELETE FROM submitted_notebooks WHERE submitted_assignment_id IN (
               SELECT id FROM submitted_assignments WHERE student_id = ?)",
            [student_id],
        )?;
        tx.execute(
            "DELETE FROM submitted_assignments WHERE student_id = ?",
            [student_id],
        )?;
        tx.execute("DELETE FROM students WHERE id = ?", [student_id])?;
        tx.commit()?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Assignments
    // -----------------------------------------------------------------------

    pub fn add_assignment(
        &self,
        name: &str,
        duedate: Option<NaiveDateTime>,
    ) -> Result<AssignmentRecord> {
        let record = AssignmentRecord {
            id: Uuid::new_v4().to_string(),
            course_id: self.course_id.clone(),
            name: name.to_string(),
            duedate,
        };
        let res = self.conn.execute(
            "INSERT INTO assignments(id, course_id, name, duedate) VALUES(?, ?, ?, ?)",
            (
                &record.id,
                &record.course_id,
                &record.name,
                record.duedate.map(format_timestamp),
            ),
        );
        match res {
            Ok(_) => Ok(record),
            Err(e) if is_unique_violation(&e) => {
                Err(GradebookError::invalid("assignment", name, "already exists"))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn update_or_create_assignment(
        &self,
        name: &str,
        duedate: Option<NaiveDateTime>,
    ) -> Result<(AssignmentRecord, bool)> {
        match self.find_assignment(name) {
            Ok(mut existing) => {
                self.conn.execute(
                    "UPDATE assignments SET duedate = ? WHERE id = ?",
                    (duedate.map(format_timestamp), &existing.id),
                )?;
                existing.duedate = duedate;
                Ok((existing, false))
            }
            Err(GradebookError::MissingEntry { .. }) => {
                Ok((self.add_assignment(name, duedate)?, true))
            }
            Err(e) => Err(e),
        }
    }

    pub fn find_assignment(&self, name: &str) -> Result<AssignmentRecord> {
        Self::find_assignment_on(&self.conn, &self.course_id, name)
    }

    fn find_assignment_on(
        conn: &Connection,
        course_id: &str,
        name: &str,
    ) -> Result<AssignmentRecord> {
        let row = conn
            .query_row(
                "SELECT id, course_id, name, duedate FROM assignments
                 WHERE course_id = ? AND name = ?",
                (course_id, name),
                |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, String>(2)?,
                        r.get::<_, Option<String>>(3)?,
                    ))
                },
            )
            .optional()?;
        let Some((id, course_id, name, duedate)) = row else {
            return Err(GradebookError::missing("assignment", name));
        };
        Ok(AssignmentRecord {
            id,
            course_id,
            name,
            duedate: duedate.as_deref().map(parse_timestamp).transpose()?,
        })
    }

    pub fn list_assignments(&self) -> Result<Vec<AssignmentRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, course_id, name, duedate FROM assignments
             WHERE course_id = ? ORDER BY name",
        )?;
        let raw = stmt
            .query_map([&self.course_id], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, Option<String>>(3)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let mut out = Vec::with_capacity(raw.len());
        for (id, course_id, name, duedate) in raw {
            out.push(AssignmentRecord {
                id,
                course_id,
                name,
                duedate: duedate.as_deref().map(parse_timestamp).transpose()?,
            });
        }
        Ok(out)
    }

    pub fn remove_assignment(&self, name: &str, force: bool) -> Result<()> {
        let assignment = self.find_assignment(name)?;
        let submissions: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM submitted_assignments WHERE assignment_id = ?",
            [&assignment.id],
            |r| r.get(0),
        )?;
        if submissions > 0 && !force {
            return Err(GradebookError::HasSubmissions {
                kind: "assignment",
                key: name.to_string(),
            });
        }

        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "DELETE FROM grades WHERE submitted_notebook_id IN (
               SELECT sn.id FROM submitted_notebooks sn
               JOIN submitted_assignments sa ON sa.id = sn.submitted_assignment_id
               WHERE sa.assignment_id = ?)",
            [&assignment.id],
        )?;
        tx.execute(
            "DELETE FROM comments WHERE submitted_notebook_id IN (
               SELECT sn.id FROM submitted_notebooks sn
               JOIN submitted_assignments sa ON sa.id = sn.submitted_assignment_id
               WHERE sa.assignment_id = ?)",
            [&assignment.id],
        )?;
        tx.execute(
            "DELETE FROM submitted_notebooks WHERE submitted_assignment_id IN (
               SELECT id FROM submitted_assignments WHERE assignment_id = ?)",
            [&assignment.id],
        )?;
        tx.execute(
            "DELETE FROM submitted_assignments WHERE assignment_id = ?",
            [&assignment.id],
        )?;
        tx.execute(
            "DELETE FROM cells WHERE notebook_id IN (
               SELECT id FROM notebooks WHERE assignment_id = ?)",
            [&assignment.id],
        )?;
        tx.execute(
            "DELETE FROM notebooks WHERE assignment_id = ?",
            [&assignment.id],
        )?;
        tx.execute("DELETE FROM assignments WHERE id = ?", [&assignment.id])?;
        tx.commit()?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Notebooks and cells (the template structure)
    // -----------------------------------------------------------------------

    /// Creates the bare notebook row. The assign step (`put_notebook`) is the
    /// upserting counterpart and the only writer of cell structure.
    pub fn add_notebook(
        &self,
        assignment: &str,
        name: &str,
        kernelspec: Option<&str>,
    ) -> Result<NotebookRecord> {
        let assignment = self.find_assignment(assignment)?;
        let record = NotebookRecord {
            id: Uuid::new_v4().to_string(),
            assignment_id: assignment.id,
            name: name.to_string(),
            kernelspec: kernelspec.map(str::to_string),
        };
        let res = self.conn.execute(
            "INSERT INTO notebooks(id, assignment_id, name, kernelspec)
             VALUES(?, ?, ?, ?)",
            (
                &record.id,
                &record.assignment_id,
                &record.name,
                &record.kernelspec,
            ),
        );
        match res {
            Ok(_) => Ok(record),
            Err(e) if is_unique_violation(&e) => {
                Err(GradebookError::invalid("notebook", name, "already exists"))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// The assign step: upserts the notebook and its grading-relevant cell
    /// structure from the instructor's master copy. Cells that disappeared
    /// from the master are deleted — refused while grades exist for them,
    /// unless forced.
    pub fn put_notebook(
        &self,
        assignment: &str,
        def: &NotebookDefinition,
        force: bool,
    ) -> Result<NotebookRecord> {
        let mut seen = HashSet::with_capacity(def.cells.len());
        for cell in &def.cells {
            cell.validate()?;
            // (notebook, name) is the cell's natural key; a name repeated
            // within one master copy is a collision, not an update.
            if !seen.insert(cell.name.as_str()) {
                return Err(GradebookError::invalid(
                    "cell",
                    &cell.name,
                    "appears more than once in the notebook",
                ));
            }
        }
        let assignment = self.find_assignment(assignment)?;

        let tx = self.conn.unchecked_transaction()?;

        let existing_id: Option<String> = tx
            .query_row(
                "SELECT id FROM notebooks WHERE assignment_id = ? AND name = ?",
                (&assignment.id, &def.name),
                |r| r.get(0),
            )
            .optional()?;
        let notebook_id = match existing_id {
            Some(id) => {
                tx.execute(
                    "UPDATE notebooks SET kernelspec = ? WHERE id = ?",
                    (&def.kernelspec, &id),
                )?;
                id
            }
            None => {
                let id = Uuid::new_v4().to_string();
                tx.execute(
                    "INSERT INTO notebooks(id, assignment_id, name, kernelspec)
                     VALUES(?, ?, ?, ?)",
                    (&id, &assignment.id, &def.name, &def.kernelspec),
                )?;
                id
            }
        };

        for (position, cell) in def.cells.iter().enumerate() {
            tx.execute(
                "INSERT INTO cells(id, notebook_id, name, cell_type, position,
                                   graded, solution, task, has_source,
                                   max_score, source, checksum, locked)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(notebook_id, name) DO UPDATE SET
                   cell_type = excluded.cell_type,
                   position = excluded.position,
                   graded = excluded.graded,
                   solution = excluded.solution,
                   task = excluded.task,
                   has_source = excluded.has_source,
                   max_score = excluded.max_score,
                   source = excluded.source,
                   checksum = excluded.checksum,
                   locked = excluded.locked",
                (
                    Uuid::new_v4().to_string(),
                    &notebook_id,
                    &cell.name,
                    cell.cell_type.as_str(),
                    position as i64,
                    cell.graded as i64,
                    cell.solution as i64,
                    cell.task as i64,
                    cell.source.is_some() as i64,
                    cell.max_score,
                    &cell.source,
                    &cell.checksum,
                    cell.locked as i64,
                ),
            )?;
        }

        // Cells dropped from the master copy. Grades recorded against them
        // are the thing the force flag protects.
        let kept: Vec<&str> = def.cells.iter().map(|c| c.name.as_str()).collect();
        let mut stmt = tx.prepare("SELECT id, name FROM cells WHERE notebook_id = ?")?;
        let stale: Vec<(String, String)> = stmt
            .query_map([&notebook_id], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?
            .into_iter()
            .filter(|(_, name)| !kept.contains(&name.as_str()))
            .collect();
        drop(stmt);

        for (cell_id, cell_name) in stale {
            let graded_rows: i64 = tx.query_row(
                "SELECT COUNT(*) FROM grades WHERE cell_id = ?",
                [&cell_id],
                |r| r.get(0),
            )?;
            let commented_rows: i64 = tx.query_row(
                "SELECT COUNT(*) FROM comments WHERE cell_id = ?",
                [&cell_id],
                |r| r.get(0),
            )?;
            if (graded_rows > 0 || commented_rows > 0) && !force {
                // The transaction unwinds on drop; nothing is half-applied.
                return Err(GradebookError::HasSubmissions {
                    kind: "cell",
                    key: cell_name,
                });
            }
            tx.execute("DELETE FROM grades WHERE cell_id = ?", [&cell_id])?;
            tx.execute("DELETE FROM comments WHERE cell_id = ?", [&cell_id])?;
            tx.execute("DELETE FROM cells WHERE id = ?", [&cell_id])?;
        }

        tx.commit()?;
        Ok(NotebookRecord {
            id: notebook_id,
            assignment_id: assignment.id,
            name: def.name.clone(),
            kernelspec: def.kernelspec.clone(),
        })
    }

    pub fn find_notebook(&self, key: NotebookKey<'_>) -> Result<NotebookRecord> {
        Self::find_notebook_on(&self.conn, &self.course_id, key)
    }

    fn find_notebook_on(
        conn: &Connection,
        course_id: &str,
        key: NotebookKey<'_>,
    ) -> Result<NotebookRecord> {
        let assignment = Self::find_assignment_on(conn, course_id, key.assignment)?;
        conn.query_row(
            "SELECT id, assignment_id, name, kernelspec FROM notebooks
             WHERE assignment_id = ? AND name = ?",
            (&assignment.id, key.notebook),
            |r| {
                Ok(NotebookRecord {
                    id: r.get(0)?,
                    assignment_id: r.get(1)?,
                    name: r.get(2)?,
                    kernelspec: r.get(3)?,
                })
            },
        )
        .optional()?
        .ok_or_else(|| GradebookError::missing("notebook", key.notebook))
    }

    pub fn list_notebooks(&self, assignment: &str) -> Result<Vec<NotebookRecord>> {
        let assignment = self.find_assignment(assignment)?;
        let mut stmt = self.conn.prepare(
            "SELECT id, assignment_id, name, kernelspec FROM notebooks
             WHERE assignment_id = ? ORDER BY name",
        )?;
        let rows = stmt
            .query_map([&assignment.id], |r| {
                Ok(NotebookRecord {
                    id: r.get(0)?,
                    assignment_id: r.get(1)?,
                    name: r.get(2)?,
                    kernelspec: r.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn remove_notebook(&self, key: NotebookKey<'_>, force: bool) -> Result<()> {
        let notebook = self.find_notebook(key)?;
        let submissions: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM submitted_notebooks WHERE notebook_id = ?",
            [&notebook.id],
            |r| r.get(0),
        )?;
        if submissions > 0 && !force {
            return Err(GradebookError::HasSubmissions {
                kind: "notebook",
                key: key.notebook.to_string(),
            });
        }

        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "DELETE FROM grades WHERE submitted_notebook_id IN (
               SELECT id FROM submitted_notebooks WHERE notebook_id = ?)",
            [&notebook.id],
        )?;
        tx.execute(
            "DELETE FROM comments WHERE submitted_notebook_id IN (
               SELECT id FROM submitted_notebooks WHERE notebook_id = ?)",
            [&notebook.id],
        )?;
        tx.execute(
            "DELETE FROM submitted_notebooks WHERE notebook_id = ?",
            [&notebook.id],
        )?;
        tx.execute("DELETE FROM cells WHERE notebook_id = ?", [&notebook.id])?;
        tx.execute("DELETE FROM notebooks WHERE id = ?", [&notebook.id])?;
        tx.commit()?;
        Ok(())
    }

    pub fn find_cell(&self, key: CellKey<'_>) -> Result<CellRecord> {
        Self::find_cell_on(&self.conn, &self.course_id, key)
    }

    fn find_cell_on(conn: &Connection, course_id: &str, key: CellKey<'_>) -> Result<CellRecord> {
        let notebook = Self::find_notebook_on(
            conn,
            course_id,
            NotebookKey {
                assignment: key.assignment,
                notebook: key.notebook,
            },
        )?;
        let row = conn
            .query_row(
                "SELECT id, notebook_id, name, cell_type, position, graded, solution,
                        task, has_source, max_score, source, checksum, locked
                 FROM cells WHERE notebook_id = ? AND name = ?",
                (&notebook.id, key.cell),
                Self::map_cell_row,
            )
            .optional()?;
        row.ok_or_else(|| GradebookError::missing("cell", key.cell))
    }

    fn map_cell_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<CellRecord> {
        let cell_type: String = r.get(3)?;
        // Stored values only ever come from CellType::as_str; anything else
        // is store corruption and fails the read.
        let cell_type = CellType::from_str(&cell_type).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
        })?;
        Ok(CellRecord {
            id: r.get(0)?,
            notebook_id: r.get(1)?,
            name: r.get(2)?,
            cell_type,
            position: r.get(4)?,
            graded: r.get::<_, i64>(5)? != 0,
            solution: r.get::<_, i64>(6)? != 0,
            task: r.get::<_, i64>(7)? != 0,
            has_source: r.get::<_, i64>(8)? != 0,
            max_score: r.get(9)?,
            source: r.get(10)?,
            checksum: r.get(11)?,
            locked: r.get::<_, i64>(12)? != 0,
        })
    }

    /// All cell descriptors of a notebook in authoritative order.
    pub fn list_cells(&self, key: NotebookKey<'_>) -> Result<Vec<CellRecord>> {
        let notebook = self.find_notebook(key)?;
        let mut stmt = self.conn.prepare(
            "SELECT id, notebook_id, name, cell_type, position, graded, solution,
                    task, has_source, max_score, source, checksum, locked
             FROM cells WHERE notebook_id = ? ORDER BY position",
        )?;
        let rows = stmt
            .query_map([&notebook.id], Self::map_cell_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // -----------------------------------------------------------------------
    // Submissions
    // -----------------------------------------------------------------------

    pub fn find_submission(&self, key: SubmissionKey<'_>) -> Result<SubmittedAssignmentRecord> {
        let assignment = self.find_assignment(key.assignment)?;
        Self::find_submission_row(&self.conn, &assignment.id, key.student)?
            .ok_or_else(|| GradebookError::missing("submission", key.student))
    }

    fn find_submission_row(
        conn: &Connection,
        assignment_id: &str,
        student_id: &str,
    ) -> Result<Option<SubmittedAssignmentRecord>> {
        let row = conn
            .query_row(
                "SELECT id, assignment_id, student_id, timestamp, extension_seconds
                 FROM submitted_assignments
                 WHERE assignment_id = ? AND student_id = ?",
                (assignment_id, student_id),
                |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, String>(2)?,
                        r.get::<_, Option<String>>(3)?,
                        r.get::<_, Option<i64>>(4)?,
                    ))
                },
            )
            .optional()?;
        let Some((id, assignment_id, student_id, timestamp, extension_seconds)) = row else {
            return Ok(None);
        };
        Ok(Some(SubmittedAssignmentRecord {
            id,
            assignment_id,
            student_id,
            timestamp: timestamp.as_deref().map(parse_timestamp).transpose()?,
            extension_seconds,
        }))
    }

    /// Lazily materializes the student's instance of an assignment. A unique
    /// violation here means a parallel autograder landed the row between our
    /// find and insert; the loser takes the winner's row.
    pub fn find_or_create_submission(
        &self,
        key: SubmissionKey<'_>,
    ) -> Result<(SubmittedAssignmentRecord, bool)> {
        let assignment = self.find_assignment(key.assignment)?;
        self.find_student(key.student)?;
        Self::find_or_create_submission_on(&self.conn, &assignment.id, key.student)
    }

    fn find_or_create_submission_on(
        conn: &Connection,
        assignment_id: &str,
        student_id: &str,
    ) -> Result<(SubmittedAssignmentRecord, bool)> {
        if let Some(found) = Self::find_submission_row(conn, assignment_id, student_id)? {
            return Ok((found, false));
        }
        let record = SubmittedAssignmentRecord {
            id: Uuid::new_v4().to_string(),
            assignment_id: assignment_id.to_string(),
            student_id: student_id.to_string(),
            timestamp: None,
            extension_seconds: None,
        };
        let res = conn.execute(
            "INSERT INTO submitted_assignments(id, assignment_id, student_id)
             VALUES(?, ?, ?)",
            (&record.id, assignment_id, student_id),
        );
        match res {
            Ok(_) => Ok((record, true)),
            Err(e) if is_unique_violation(&e) => {
                let found = Self::find_submission_row(conn, assignment_id, student_id)?
                    .ok_or_else(|| GradebookError::missing("submission", student_id))?;
                Ok((found, false))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn list_submissions(&self, assignment: &str) -> Result<Vec<SubmittedAssignmentRecord>> {
        let assignment = self.find_assignment(assignment)?;
        let mut stmt = self.conn.prepare(
            "SELECT id, assignment_id, student_id, timestamp, extension_seconds
             FROM submitted_assignments WHERE assignment_id = ? ORDER BY student_id",
        )?;
        let raw = stmt
            .query_map([&assignment.id], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, Option<String>>(3)?,
                    r.get::<_, Option<i64>>(4)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let mut out = Vec::with_capacity(raw.len());
        for (id, assignment_id, student_id, timestamp, extension_seconds) in raw {
            out.push(SubmittedAssignmentRecord {
                id,
                assignment_id,
                student_id,
                timestamp: timestamp.as_deref().map(parse_timestamp).transpose()?,
                extension_seconds,
            });
        }
        Ok(out)
    }

    pub fn set_submission_timestamp(
        &self,
        key: SubmissionKey<'_>,
        timestamp: Option<NaiveDateTime>,
    ) -> Result<()> {
        let submission = self.find_submission(key)?;
        self.conn.execute(
            "UPDATE submitted_assignments SET timestamp = ? WHERE id = ?",
            (timestamp.map(format_timestamp), &submission.id),
        )?;
        Ok(())
    }

    /// Per-student duedate extension, in whole seconds.
    pub fn set_submission_extension(
        &self,
        key: SubmissionKey<'_>,
        extension_seconds: Option<i64>,
    ) -> Result<()> {
        let submission = self.find_submission(key)?;
        self.conn.execute(
            "UPDATE submitted_assignments SET extension_seconds = ? WHERE id = ?",
            (extension_seconds, &submission.id),
        )?;
        Ok(())
    }

    pub fn remove_submission(&self, key: SubmissionKey<'_>) -> Result<()> {
        let submission = self.find_submission(key)?;
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "DELETE FROM grades WHERE submitted_notebook_id IN (
               SELECT id FROM submitted_notebooks WHERE submitted_assignment_id = ?)",
            [&submission.id],
        )?;
        tx.execute(
            "DELETE FROM comments WHERE submitted_notebook_id IN (
               SELECT id FROM submitted_notebooks WHERE submitted_assignment_id = ?)",
            [&submission.id],
        )?;
        tx.execute(
            "DELETE FROM submitted_notebooks WHERE submitted_assignment_id = ?",
            [&submission.id],
        )?;
        tx.execute(
            "DELETE FROM submitted_assignments WHERE id = ?",
            [&submission.id],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn find_submitted_notebook(
        &self,
        key: SubmittedNotebookKey<'_>,
    ) -> Result<SubmittedNotebookRecord> {
        let notebook = self.find_notebook(NotebookKey {
            assignment: key.assignment,
            notebook: key.notebook,
        })?;
        let submission = self.find_submission(SubmissionKey {
            assignment: key.assignment,
            student: key.student,
        })?;
        Self::find_submitted_notebook_row(&self.conn, &submission.id, &notebook.id)?
            .ok_or_else(|| GradebookError::missing("submitted notebook", key.notebook))
    }

    fn find_submitted_notebook_row(
        conn: &Connection,
        submitted_assignment_id: &str,
        notebook_id: &str,
    ) -> Result<Option<SubmittedNotebookRecord>> {
        let row = conn
            .query_row(
                "SELECT id, submitted_assignment_id, notebook_id, flagged, late_penalty
                 FROM submitted_notebooks
                 WHERE submitted_assignment_id = ? AND notebook_id = ?",
                (submitted_assignment_id, notebook_id),
                |r| {
                    Ok(SubmittedNotebookRecord {
                        id: r.get(0)?,
                        submitted_assignment_id: r.get(1)?,
                        notebook_id: r.get(2)?,
                        flagged: r.get::<_, i64>(3)? != 0,
                        late_penalty: r.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn find_or_create_submitted_notebook(
        &self,
        key: SubmittedNotebookKey<'_>,
    ) -> Result<(SubmittedNotebookRecord, bool)> {
        let notebook = self.find_notebook(NotebookKey {
            assignment: key.assignment,
            notebook: key.notebook,
        })?;
        self.find_student(key.student)?;
        let (submission, _) = Self::find_or_create_submission_on(
            &self.conn,
            &notebook.assignment_id,
            key.student,
        )?;
        Self::find_or_create_submitted_notebook_on(&self.conn, &submission.id, &notebook.id)
    }

    fn find_or_create_submitted_notebook_on(
        conn: &Connection,
        submitted_assignment_id: &str,
        notebook_id: &str,
    ) -> Result<(SubmittedNotebookRecord, bool)> {
        if let Some(found) =
            Self::find_submitted_notebook_row(conn, submitted_assignment_id, notebook_id)?
        {
            return Ok((found, false));
        }
        let record = SubmittedNotebookRecord {
            id: Uuid::new_v4().to_string(),
            submitted_assignment_id: submitted_assignment_id.to_string(),
            notebook_id: notebook_id.to_string(),
            flagged: false,
            late_penalty: None,
        };
        let res = conn.execute(
            "INSERT INTO submitted_notebooks(id, submitted_assignment_id, notebook_id)
             VALUES(?, ?, ?)",
            (&record.id, submitted_assignment_id, notebook_id),
        );
        match res {
            Ok(_) => Ok((record, true)),
            Err(e) if is_unique_violation(&e) => {
                let found =
                    Self::find_submitted_notebook_row(conn, submitted_assignment_id, notebook_id)?
                        .ok_or_else(|| {
                            GradebookError::missing("submitted notebook", notebook_id)
                        })?;
                Ok((found, false))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Manual instructor flag for re-review.
    pub fn flag_submitted_notebook(
        &self,
        key: SubmittedNotebookKey<'_>,
        flagged: bool,
    ) -> Result<()> {
        let record = self.find_submitted_notebook(key)?;
        self.conn.execute(
            "UPDATE submitted_notebooks SET flagged = ? WHERE id = ?",
            (flagged as i64, &record.id),
        )?;
        Ok(())
    }

    pub fn set_late_penalty(
        &self,
        key: SubmittedNotebookKey<'_>,
        penalty: Option<f64>,
    ) -> Result<()> {
        let record = self.find_submitted_notebook(key)?;
        self.conn.execute(
            "UPDATE submitted_notebooks SET late_penalty = ? WHERE id = ?",
            (penalty, &record.id),
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Grades and comments
    // -----------------------------------------------------------------------

    pub fn find_grade(&self, key: GradeKey<'_>) -> Result<GradeRecord> {
        let row = self
            .conn
            .query_row(
                "SELECT g.id, g.cell_id, g.submitted_notebook_id,
                        g.auto_score, g.manual_score, g.extra_credit
                 FROM grades g
                 JOIN cells c ON c.id = g.cell_id
                 JOIN notebooks n ON n.id = c.notebook_id
                 JOIN assignments a ON a.id = n.assignment_id
                 JOIN submitted_notebooks sn ON sn.id = g.submitted_notebook_id
                 JOIN submitted_assignments sa ON sa.id = sn.submitted_assignment_id
                 WHERE a.course_id = ? AND a.name = ? AND n.name = ?
                   AND c.name = ? AND sa.student_id = ?",
                (
                    &self.course_id,
                    key.assignment,
                    key.notebook,
                    key.cell,
                    key.student,
                ),
                |r| {
                    Ok(GradeRecord {
                        id: r.get(0)?,
                        cell_id: r.get(1)?,
                        submitted_notebook_id: r.get(2)?,
                        auto_score: r.get(3)?,
                        manual_score: r.get(4)?,
                        extra_credit: r.get(5)?,
                    })
                },
            )
            .optional()?;
        row.ok_or_else(|| GradebookError::missing("grade", key.cell))
    }

    /// Materializes the whole instance chain (submission, submitted notebook,
    /// grade) on first use. The referenced cell must carry a grading
    /// capability.
    pub fn find_or_create_grade(&self, key: GradeKey<'_>) -> Result<(GradeRecord, bool)> {
        let cell = self.find_cell(CellKey {
            assignment: key.assignment,
            notebook: key.notebook,
            cell: key.cell,
        })?;
        if !cell.graded && !cell.task {
            return Err(GradebookError::NotAGradeCell(key.cell.to_string()));
        }
        let (submitted_notebook, _) = self.find_or_create_submitted_notebook(
            SubmittedNotebookKey {
                assignment: key.assignment,
                notebook: key.notebook,
                student: key.student,
            },
        )?;
        Self::find_or_create_grade_on(&self.conn, &cell.id, &submitted_notebook.id)
    }

    fn find_or_create_grade_on(
        conn: &Connection,
        cell_id: &str,
        submitted_notebook_id: &str,
    ) -> Result<(GradeRecord, bool)> {
        let found = conn
            .query_row(
                "SELECT id, cell_id, submitted_notebook_id, auto_score, manual_score, extra_credit
                 FROM grades WHERE cell_id = ? AND submitted_notebook_id = ?",
                (cell_id, submitted_notebook_id),
                |r| {
                    Ok(GradeRecord {
                        id: r.get(0)?,
                        cell_id: r.get(1)?,
                        submitted_notebook_id: r.get(2)?,
                        auto_score: r.get(3)?,
                        manual_score: r.get(4)?,
                        extra_credit: r.get(5)?,
                    })
                },
            )
            .optional()?;
        if let Some(record) = found {
            return Ok((record, false));
        }
        let record = GradeRecord {
            id: Uuid::new_v4().to_string(),
            cell_id: cell_id.to_string(),
            submitted_notebook_id: submitted_notebook_id.to_string(),
            auto_score: None,
            manual_score: None,
            extra_credit: None,
        };
        let res = conn.execute(
            "INSERT INTO grades(id, cell_id, submitted_notebook_id) VALUES(?, ?, ?)",
            (&record.id, cell_id, submitted_notebook_id),
        );
        match res {
            Ok(_) => Ok((record, true)),
            Err(e) if is_unique_violation(&e) => {
                let record = conn.query_row(
                    "SELECT id, cell_id, submitted_notebook_id, auto_score, manual_score, extra_credit
                     FROM grades WHERE cell_id = ? AND submitted_notebook_id = ?",
                    (cell_id, submitted_notebook_id),
                    |r| {
                        Ok(GradeRecord {
                            id: r.get(0)?,
                            cell_id: r.get(1)?,
                            submitted_notebook_id: r.get(2)?,
                            auto_score: r.get(3)?,
                            manual_score: r.get(4)?,
                            extra_credit: r.get(5)?,
                        })
                    },
                )?;
                Ok((record, false))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn set_auto_score(&self, key: GradeKey<'_>, score: Option<f64>) -> Result<()> {
        let (grade, _) = self.find_or_create_grade(key)?;
        self.conn.execute(
            "UPDATE grades SET auto_score = ? WHERE id = ?",
            (score, &grade.id),
        )?;
        Ok(())
    }

    /// The human grader's score; overrides the auto score when present.
    pub fn set_manual_score(&self, key: GradeKey<'_>, score: Option<f64>) -> Result<()> {
        let (grade, _) = self.find_or_create_grade(key)?;
        self.conn.execute(
            "UPDATE grades SET manual_score = ? WHERE id = ?",
            (score, &grade.id),
        )?;
        Ok(())
    }

    pub fn set_extra_credit(&self, key: GradeKey<'_>, credit: Option<f64>) -> Result<()> {
        let (grade, _) = self.find_or_create_grade(key)?;
        self.conn.execute(
            "UPDATE grades SET extra_credit = ? WHERE id = ?",
            (credit, &grade.id),
        )?;
        Ok(())
    }

    pub fn find_comment(&self, key: GradeKey<'_>) -> Result<CommentRecord> {
        let row = self
            .conn
            .query_row(
                "SELECT cm.id, cm.cell_id, cm.submitted_notebook_id, cm.manual_comment
                 FROM comments cm
                 JOIN cells c ON c.id = cm.cell_id
                 JOIN notebooks n ON n.id = c.notebook_id
                 JOIN assignments a ON a.id = n.assignment_id
                 JOIN submitted_notebooks sn ON sn.id = cm.submitted_notebook_id
                 JOIN submitted_assignments sa ON sa.id = sn.submitted_assignment_id
                 WHERE a.course_id = ? AND a.name = ? AND n.name = ?
                   AND c.name = ? AND sa.student_id = ?",
                (
                    &self.course_id,
                    key.assignment,
                    key.notebook,
                    key.cell,
                    key.student,
                ),
                |r| {
                    Ok(CommentRecord {
                        id: r.get(0)?,
                        cell_id: r.get(1)?,
                        submitted_notebook_id: r.get(2)?,
                        manual_comment: r.get(3)?,
                    })
                },
            )
            .optional()?;
        row.ok_or_else(|| GradebookError::missing("comment", key.cell))
    }

    pub fn find_or_create_comment(&self, key: GradeKey<'_>) -> Result<(CommentRecord, bool)> {
        let cell = self.find_cell(CellKey {
            assignment: key.assignment,
            notebook: key.notebook,
            cell: key.cell,
        })?;
        if !cell.solution {
            return Err(GradebookError::invalid(
                "comment",
                key.cell,
                "comments attach to solution cells only",
            ));
        }
        let (submitted_notebook, _) = self.find_or_create_submitted_notebook(
            SubmittedNotebookKey {
                assignment: key.assignment,
                notebook: key.notebook,
                student: key.student,
            },
        )?;
        Self::find_or_create_comment_on(&self.conn, &cell.id, &submitted_notebook.id)
    }

    fn find_or_create_comment_on(
        conn: &Connection,
        cell_id: &str,
        submitted_notebook_id: &str,
    ) -> Result<(CommentRecord, bool)> {
        let found = conn
            .query_row(
                "SELECT id, cell_id, submitted_notebook_id, manual_comment
                 FROM comments WHERE cell_id = ? AND submitted_notebook_id = ?",
                (cell_id, submitted_notebook_id),
                |r| {
                    Ok(CommentRecord {
                        id: r.get(0)?,
                        cell_id: r.get(1)?,
                        submitted_notebook_id: r.get(2)?,
                        manual_comment: r.get(3)?,
                    })
                },
            )
            .optional()?;
        if let Some(record) = found {
            return Ok((record, false));
        }
        let record = CommentRecord {
            id: Uuid::new_v4().to_string(),
            cell_id: cell_id.to_string(),
            submitted_notebook_id: submitted_notebook_id.to_string(),
            manual_comment: None,
        };
        let res = conn.execute(
            "INSERT INTO comments(id, cell_id, submitted_notebook_id) VALUES(?, ?, ?)",
            (&record.id, cell_id, submitted_notebook_id),
        );
        match res {
            Ok(_) => Ok((record, true)),
            Err(e) if is_unique_violation(&e) => {
                let record = conn.query_row(
                    "SELECT id, cell_id, submitted_notebook_id, manual_comment
                     FROM comments WHERE cell_id = ? AND submitted_notebook_id = ?",
                    (cell_id, submitted_notebook_id),
                    |r| {
                        Ok(CommentRecord {
                            id: r.get(0)?,
                            cell_id: r.get(1)?,
                            submitted_notebook_id: r.get(2)?,
                            manual_comment: r.get(3)?,
                        })
                    },
                )?;
                Ok((record, false))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn set_comment(&self, key: GradeKey<'_>, text: Option<String>) -> Result<()> {
        let (comment, _) = self.find_or_create_comment(key)?;
        self.conn.execute(
            "UPDATE comments SET manual_comment = ? WHERE id = ?",
            (&text, &comment.id),
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Recording executed submissions
    // -----------------------------------------------------------------------

    /// Records the outcome of one executed, reconciled submission in a single
    /// transaction: materializes the instance chain, writes auto scores for
    /// graded cells, opens grade rows for task cells (manual-only path) and
    /// comment rows for solution cells. Manual scores are never touched.
    pub fn record_execution(
        &self,
        key: SubmittedNotebookKey<'_>,
        timestamp: Option<NaiveDateTime>,
        cells: &[NotebookCell],
    ) -> Result<ExecutionSummary> {
        let notebook = self.find_notebook(NotebookKey {
            assignment: key.assignment,
            notebook: key.notebook,
        })?;
        self.find_student(key.student)?;

        let tx = self.conn.unchecked_transaction()?;
        let (submission, _) =
            Self::find_or_create_submission_on(&tx, &notebook.assignment_id, key.student)?;
        if let Some(ts) = timestamp {
            tx.execute(
                "UPDATE submitted_assignments SET timestamp = ? WHERE id = ?",
                (format_timestamp(ts), &submission.id),
            )?;
        }
        let (submitted_notebook, _) =
            Self::find_or_create_submitted_notebook_on(&tx, &submission.id, &notebook.id)?;

        let mut summary = ExecutionSummary::default();
        for cell in cells {
            let Some(name) = cell.grade_id() else {
                continue;
            };
            let row = tx
                .query_row(
                    "SELECT id, graded, solution, task FROM cells
                     WHERE notebook_id = ? AND name = ?",
                    (&notebook.id, name),
                    |r| {
                        Ok((
                            r.get::<_, String>(0)?,
                            r.get::<_, i64>(1)? != 0,
                            r.get::<_, i64>(2)? != 0,
                            r.get::<_, i64>(3)? != 0,
                        ))
                    },
                )
                .optional()?;
            let Some((cell_id, graded, solution, task)) = row else {
                warn!(cell = name, "submission carries a cell the source never defined; skipping");
                continue;
            };

            if graded {
                let (auto_score, _max) = checksum::determine_grade(cell)?;
                let (grade, _) = Self::find_or_create_grade_on(&tx, &cell_id, &submitted_notebook.id)?;
                tx.execute(
                    "UPDATE grades SET auto_score = ? WHERE id = ?",
                    (auto_score, &grade.id),
                )?;
                summary.graded_cells += 1;
                if auto_score.is_none() {
                    summary.needs_manual += 1;
                }
            } else if task {
                // Task cells have no autograder path; the row exists so the
                // manual grader finds it.
                Self::find_or_create_grade_on(&tx, &cell_id, &submitted_notebook.id)?;
                summary.graded_cells += 1;
                summary.needs_manual += 1;
            }

            if solution {
                let (_, created) =
                    Self::find_or_create_comment_on(&tx, &cell_id, &submitted_notebook.id)?;
                if created {
                    summary.comments_created += 1;
                }
            }
        }

        tx.commit()?;
        Ok(summary)
    }
}
