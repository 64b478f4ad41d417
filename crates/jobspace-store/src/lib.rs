//! Storage layer for jobspace: projects, jobs, and their workspace.
//!
//! A project owns a workspace directory with one subdirectory per job,
//! named by the job's id (the content hash of its parameter document).
//! Each job directory holds a manifest recording the canonical parameter
//! document, which is what makes directory↔id integrity checkable and
//! repairable.
//!
//! ```text
//! <root>/
//!   jobspace.rc                      project configuration
//!   jobspace_project_document.json   project-level synced document
//!   jobspace_statepoints.json        optional id -> state point dump
//!   .jobspace_sp_cache.json          opportunistic cache snapshot
//!   workspace/
//!     <job id>/
//!       jobspace_statepoint.json     manifest (canonical state point)
//!       jobspace_job_document.json   job-level synced document
//! ```

pub mod cache;
pub mod config;
mod fsutil;
pub mod index;
pub mod job;
pub mod project;
mod view;

use std::collections::BTreeSet;
use std::path::PathBuf;

use thiserror::Error;

use jobspace_doc::{DocumentError, JobId};
use jobspace_query::FilterError;

pub use cache::RepairReport;
pub use job::Job;
pub use project::{DefaultJobFactory, JobFactory, Project};

/// The project configuration filename.
pub const FN_CONFIG: &str = "jobspace.rc";
/// The manifest filename inside each job workspace.
pub const FN_MANIFEST: &str = "jobspace_statepoint.json";
/// The job document filename inside each job workspace.
pub const FN_JOB_DOCUMENT: &str = "jobspace_job_document.json";
/// The project document filename at the project root.
pub const FN_PROJECT_DOCUMENT: &str = "jobspace_project_document.json";
/// The id -> state point dump filename at the project root.
pub const FN_STATEPOINTS: &str = "jobspace_statepoints.json";
/// The cache snapshot filename at the project root.
pub const FN_CACHE: &str = ".jobspace_sp_cache.json";

/// Errors raised by the storage layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error(transparent)]
    Filter(#[from] FilterError),

    /// One or more workspace directories fail directory↔id integrity.
    /// Collected over a whole scan, raised once.
    #[error("{} corrupted job director{} in workspace", ids.len(), if ids.len() == 1 { "y" } else { "ies" })]
    JobsCorrupted { ids: BTreeSet<String> },

    /// A move or clone found its destination already initialized.
    #[error("destination job '{id}' already exists")]
    DestinationExists { id: JobId },

    #[error("no job with id '{id}'")]
    UnknownId { id: String },

    #[error("abbreviated id '{prefix}' matches more than one job")]
    AmbiguousId { prefix: String },

    /// Re-initializing a project with conflicting parameters.
    #[error("path '{root}' already contains a conflicting project configuration")]
    InitConflict { root: PathBuf },

    #[error("unable to determine project id for path '{path}'")]
    NoProject { path: PathBuf },

    /// `_id` and `statepoint` are reserved index keys.
    #[error("document key '{key}' is reserved")]
    ReservedKey { key: String },

    /// A supplied index does not cover the selected job subset.
    #[error("insufficient index for selected data space")]
    InsufficientIndex,

    /// A supplied index holds conflicting entries under one `_id`.
    #[error("index contains conflicting entries for id '{id}'")]
    DuplicateIndexId { id: String },

    #[error("workspace I/O error at '{path}'")]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub(crate) fn workspace(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| Self::Workspace { path, source }
    }

    pub(crate) fn corrupted_one(id: impl Into<String>) -> Self {
        let mut ids = BTreeSet::new();
        ids.insert(id.into());
        Self::JobsCorrupted { ids }
    }
}
