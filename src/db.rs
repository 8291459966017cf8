use rusqlite::Connection;
use std::path::Path;

pub const DB_FILE_NAME: &str = "gradebook.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    init_schema(&conn)?;
    Ok(conn)
}

/// In-memory store with the same schema; used by tests and one-shot callers
/// that never need the workspace to persist.
pub fn open_in_memory() -> anyhow::Result<Connection> {
    let conn = Connection::open_in_memory()?;
    init_schema(&conn)?;
    Ok(conn)
}

fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS courses(
            id TEXT PRIMARY KEY
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assignments(
            id TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            name TEXT NOT NULL,
            duedate TEXT,
            FOREIGN KEY(course_id) REFERENCES courses(id),
            UNIQUE(course_id, name)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assignments_course ON assignments(course_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS notebooks(
            id TEXT PRIMARY KEY,
            assignment_id TEXT NOT NULL,
            name TEXT NOT NULL,
            kernelspec TEXT,
            FOREIGN KEY(assignment_id) REFERENCES assignments(id),
            UNIQUE(assignment_id, name)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_notebooks_assignment ON notebooks(assignment_id)",
        [],
    )?;

    // One row per grading-relevant cell. Roles are a capability set: a cell
    // may be graded+solution+source at once; graded and task never combine.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS cells(
            id TEXT PRIMARY KEY,
            notebook_id TEXT NOT NULL,
            name TEXT NOT NULL,
            cell_type TEXT NOT NULL,
            position INTEGER NOT NULL,
            graded INTEGER NOT NULL DEFAULT 0,
            solution INTEGER NOT NULL DEFAULT 0,
            task INTEGER NOT NULL DEFAULT 0,
            has_source INTEGER NOT NULL DEFAULT 0,
            max_score REAL,
            source TEXT,
            checksum TEXT,
            locked INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(notebook_id) REFERENCES notebooks(id),
            UNIQUE(notebook_id, name)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_cells_notebook ON cells(notebook_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_cells_notebook_position ON cells(notebook_id, position)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            first_name TEXT,
            last_name TEXT,
            email TEXT,
            lms_user_id TEXT
        )",
        [],
    )?;

    // Existing stores may predate the LMS id column. Add it if needed.
    ensure_students_lms_user_id(conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS submitted_assignments(
            id TEXT PRIMARY KEY,
            assignment_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            timestamp TEXT,
            extension_seconds INTEGER,
            FOREIGN KEY(assignment_id) REFERENCES assignments(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(assignment_id, student_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_submitted_assignments_assignment
         ON submitted_assignments(assignment_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_submitted_assignments_student
         ON submitted_assignments(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS submitted_notebooks(
            id TEXT PRIMARY KEY,
            submitted_assignment_id TEXT NOT NULL,
            notebook_id TEXT NOT NULL,
            flagged INTEGER NOT NULL DEFAULT 0,
            late_penalty REAL,
            FOREIGN KEY(submitted_assignment_id) REFERENCES submitted_assignments(id),
            FOREIGN KEY(notebook_id) REFERENCES notebooks(id),
            UNIQUE(submitted_assignment_id, notebook_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_submitted_notebooks_submission
         ON submitted_notebooks(submitted_assignment_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_submitted_notebooks_notebook
         ON submitted_notebooks(notebook_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grades(
            id TEXT PRIMARY KEY,
            cell_id TEXT NOT NULL,
            submitted_notebook_id TEXT NOT NULL,
            auto_score REAL,
            manual_score REAL,
            extra_credit REAL,
            FOREIGN KEY(cell_id) REFERENCES cells(id),
            FOREIGN KEY(submitted_notebook_id) REFERENCES submitted_notebooks(id),
            UNIQUE(cell_id, submitted_notebook_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_cell ON grades(cell_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_submitted_notebook
         ON grades(submitted_notebook_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS comments(
            id TEXT PRIMARY KEY,
            cell_id TEXT NOT NULL,
            submitted_notebook_id TEXT NOT NULL,
            manual_comment TEXT,
            FOREIGN KEY(cell_id) REFERENCES cells(id),
            FOREIGN KEY(submitted_notebook_id) REFERENCES submitted_notebooks(id),
            UNIQUE(cell_id, submitted_notebook_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_comments_cell ON comments(cell_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_comments_submitted_notebook
         ON comments(submitted_notebook_id)",
        [],
    )?;

    Ok(())
}

fn ensure_students_lms_user_id(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "students", "lms_user_id")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE students ADD COLUMN lms_user_id TEXT", [])?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
