//! Gradebook core for notebook-based assignments: the relational store, the
//! cell checksum/consistency engine, derived score aggregation, and submitted
//! cell reconciliation. The `ipc` module and the `gradebookd` binary wrap the
//! same API in a newline-delimited JSON sidecar protocol for out-of-process
//! callers.

pub mod calc;
pub mod checksum;
pub mod db;
pub mod error;
pub mod gradebook;
pub mod ipc;
pub mod model;
pub mod reconcile;

pub use error::{GradebookError, Result};
pub use gradebook::Gradebook;
