//! The job handle: identity, parameter document, workspace directory, and
//! the job-level synced document.
//!
//! Lifecycle: *unmaterialized* (no directory) → *initialized* (`init`,
//! idempotent) → *removed* (`remove`; re-`init` yields a fresh workspace).
//! The parameter document is immutable for the lifetime of the handle:
//! changing parameters means opening a different job.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;

use jobspace_doc::{calc_id, canonical_bytes, BufferPool, JobId, SyncedDocument};

use crate::project::Project;
use crate::{fsutil, StoreError, FN_JOB_DOCUMENT, FN_MANIFEST};

/// A handle to the data of one unique state point.
///
/// Usually constructed through [`Project::open_job`].
pub struct Job {
    workspace_root: PathBuf,
    id: JobId,
    statepoint: Value,
    document: Option<SyncedDocument>,
    buffer: Arc<BufferPool>,
}

impl Job {
    /// Bind a handle for `statepoint` under the given workspace root.
    pub fn new(
        workspace_root: PathBuf,
        statepoint: Value,
        buffer: Arc<BufferPool>,
    ) -> Result<Self, StoreError> {
        let id = calc_id(&statepoint)?;
        Ok(Self {
            workspace_root,
            id,
            statepoint,
            document: None,
            buffer,
        })
    }

    /// The unique identifier of the job's state point.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The state point. Immutable once the handle exists.
    pub fn statepoint(&self) -> &Value {
        &self.statepoint
    }

    /// The job's workspace directory.
    pub fn workspace(&self) -> PathBuf {
        self.workspace_root.join(&self.id)
    }

    /// Prepend `name` with the job's workspace path.
    pub fn path_to(&self, name: impl AsRef<Path>) -> PathBuf {
        self.workspace().join(name)
    }

    /// Whether `name` exists as a file in the job's workspace.
    pub fn has_file(&self, name: impl AsRef<Path>) -> bool {
        self.path_to(name).is_file()
    }

    /// Whether the workspace directory and manifest exist.
    pub fn is_initialized(&self) -> bool {
        self.workspace().join(FN_MANIFEST).is_file()
    }

    /// Initialize the workspace directory and manifest.
    ///
    /// Idempotent: the directory is created if absent and the manifest
    /// written with the canonical parameter document if absent. An
    /// existing manifest must match the job's id, else the job is
    /// corrupted. Writes are atomic, so concurrent initialization of the
    /// same state point from independent processes is safe.
    pub fn init(&self) -> Result<(), StoreError> {
        let workspace = self.workspace();
        std::fs::create_dir_all(&workspace).map_err(StoreError::workspace(&workspace))?;
        let manifest = workspace.join(FN_MANIFEST);
        if !manifest.exists() {
            let bytes = canonical_bytes(&self.statepoint)?;
            fsutil::write_atomic(&manifest, &bytes)?;
        }
        self.verify_manifest()
    }

    /// Check that the manifest, if present, re-encodes to this job's id.
    fn verify_manifest(&self) -> Result<(), StoreError> {
        let manifest = self.workspace().join(FN_MANIFEST);
        let bytes = match std::fs::read(&manifest) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(StoreError::workspace(&manifest)(err)),
        };
        let recorded: Value = serde_json::from_slice(&bytes)
            .map_err(|_| StoreError::corrupted_one(self.id.as_str()))?;
        let recorded_id = calc_id(&recorded)?;
        if recorded_id != self.id {
            return Err(StoreError::corrupted_one(self.id.as_str()));
        }
        Ok(())
    }

    /// Remove the job's workspace including the job document. Does
    /// nothing when the workspace does not exist. The job may be
    /// re-initialized afterward with the same parameters.
    pub fn remove(&mut self) -> Result<(), StoreError> {
        let workspace = self.workspace();
        match std::fs::remove_dir_all(&workspace) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(StoreError::workspace(&workspace)(err)),
        }
        self.document = None;
        Ok(())
    }

    /// Relocate the workspace under `target`'s root.
    pub fn move_to(&mut self, target: &Project) -> Result<(), StoreError> {
        let dst_root = target.workspace_dir().to_path_buf();
        std::fs::create_dir_all(&dst_root).map_err(StoreError::workspace(&dst_root))?;
        let dst = dst_root.join(&self.id);
        if dst.exists() {
            return Err(StoreError::DestinationExists {
                id: self.id.clone(),
            });
        }
        let src = self.workspace();
        std::fs::rename(&src, &dst).map_err(|err| {
            // Lost the race: a job with this id appeared at the target.
            if dst.exists() {
                StoreError::DestinationExists {
                    id: self.id.clone(),
                }
            } else {
                StoreError::workspace(&src)(err)
            }
        })?;
        tracing::info!(
            job = %self.id,
            from = %src.display(),
            to = %dst.display(),
            "moved job workspace"
        );
        self.workspace_root = dst_root;
        self.buffer = target.buffer_pool();
        self.document = None;
        target.register_statepoint(&self.id, &self.statepoint);
        Ok(())
    }

    /// The job's synced document. Accessing it initializes the workspace.
    pub fn document(&mut self) -> Result<&mut SyncedDocument, StoreError> {
        if self.document.is_none() {
            self.init()?;
            self.document = Some(SyncedDocument::with_buffer(
                self.workspace().join(FN_JOB_DOCUMENT),
                Arc::clone(&self.buffer),
            ));
        }
        Ok(self.document.as_mut().expect("document just bound"))
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("statepoint", &self.statepoint)
            .field("workspace", &self.workspace())
            .finish()
    }
}

/// Two independently constructed handles for the same id under the same
/// project are interchangeable.
impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.workspace_root == other.workspace_root && self.id == other.id
    }
}

impl Eq for Job {}

impl std::hash::Hash for Job {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.workspace_root.hash(state);
        self.id.hash(state);
    }
}
