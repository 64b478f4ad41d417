//! Document layer for jobspace: canonical state-point encoding and the
//! synced JSON document.
//!
//! Everything above this crate identifies a unit of work by the content hash
//! of its parameter document and persists mutable metadata next to it. This
//! crate provides:
//!
//! - `canonical`: deterministic byte encoding of a parameter document and
//!   the job id derived from it
//! - `synced`: a mapping that loads before every read and saves after every
//!   write against a backing JSON file
//! - `buffer`: a reference-counted pool that batches synced-document writes
//!   for the duration of a scope

pub mod buffer;
pub mod canonical;
pub mod synced;

use std::path::PathBuf;

use thiserror::Error;

pub use buffer::{BufferFlushError, BufferGuard, BufferPool};
pub use canonical::{calc_id, canonical_bytes, canonical_string, is_job_id, JobId, JOB_ID_LEN};
pub use synced::{NestedMut, SyncedDocument};

/// Errors raised by the document layer.
#[derive(Debug, Error)]
pub enum DocumentError {
    /// The value has no canonical JSON representation.
    #[error("document has no canonical representation: {0}")]
    Unrepresentable(String),

    /// The backing file exists but does not parse as a JSON object.
    #[error("document file '{path}' is corrupted")]
    Corrupted {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// The backing store could not be read or written.
    #[error("I/O error on document file '{path}'")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
