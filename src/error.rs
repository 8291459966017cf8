use thiserror::Error;

/// Errors raised by the gradebook core.
///
/// Reconciliation anomalies that can be auto-corrected (unknown cell ids,
/// drifted cell types, edited locked content) are not errors; they come back
/// as change records and are logged at WARN. Everything here aborts the
/// current operation.
#[derive(Debug, Error)]
pub enum GradebookError {
    /// A find matched zero rows for the given natural key.
    #[error("no {kind} with key {key:?}")]
    MissingEntry { kind: &'static str, key: String },

    /// A create violated a natural-key uniqueness invariant, or the entity
    /// definition itself is malformed (e.g. a cell marked both graded and
    /// task).
    #[error("invalid {kind} {key:?}: {reason}")]
    InvalidEntry {
        kind: &'static str,
        key: String,
        reason: String,
    },

    /// `determine_grade` was called on a cell with no grade capability.
    #[error("cell {0:?} is not a grade cell")]
    NotAGradeCell(String),

    /// A locked cell's checksum still mismatched after its source was
    /// restored from the authoritative copy. The stored source or the
    /// checksum function itself is corrupt; the submission must not be
    /// partially committed.
    #[error("inconsistent checksum for cell {0:?} after restoring its source")]
    InconsistentChecksum(String),

    /// Removal refused because submissions still reference the entity.
    #[error("{kind} {key:?} still has submissions; pass force to remove them too")]
    HasSubmissions { kind: &'static str, key: String },

    /// Per-student max scores diverged for the same template notebook.
    /// max_score is a template property; a divergence means some submission
    /// holds a partial or stale set of grade rows.
    #[error("max score for notebook {notebook:?} differs across submissions ({expected} vs {got})")]
    InconsistentMaxScore {
        notebook: String,
        expected: f64,
        got: f64,
    },

    #[error(transparent)]
    Db(#[from] rusqlite::Error),
}

impl GradebookError {
    pub fn missing(kind: &'static str, key: impl Into<String>) -> Self {
        GradebookError::MissingEntry {
            kind,
            key: key.into(),
        }
    }

    pub fn invalid(kind: &'static str, key: impl Into<String>, reason: impl Into<String>) -> Self {
        GradebookError::InvalidEntry {
            kind,
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Stable protocol code for the sidecar's error objects.
    pub fn code(&self) -> &'static str {
        match self {
            GradebookError::MissingEntry { .. } => "missing_entry",
            GradebookError::InvalidEntry { .. } => "invalid_entry",
            GradebookError::NotAGradeCell(_) => "not_a_grade_cell",
            GradebookError::InconsistentChecksum(_) => "inconsistent_checksum",
            GradebookError::HasSubmissions { .. } => "has_submissions",
            GradebookError::InconsistentMaxScore { .. } => "inconsistent_max_score",
            GradebookError::Db(_) => "db_failed",
        }
    }
}

/// True when SQLite reports that another writer landed the same unique key
/// first. find-or-create treats this as a recoverable race and retries the
/// find.
pub fn is_unique_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => {
            e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
        }
        _ => false,
    }
}

pub type Result<T> = std::result::Result<T, GradebookError>;
