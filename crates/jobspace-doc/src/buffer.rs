//! Buffered persistence for synced documents.
//!
//! A [`BufferPool`] is an explicit, reference-counted buffer context shared
//! by every synced document that opts in (there is no process-global
//! toggle). While at least one [`BufferGuard`] is alive:
//!
//! - a document's first touch copies its backing content into the pool
//! - loads read the pooled copy; disk loads are suspended
//! - saves update the pooled copy and mark the document dirty
//!
//! When the outermost guard is released, every dirtied document is flushed
//! exactly once, in first-touched order. `BufferGuard::close` reports flush
//! failures; dropping the guard (including during unwinding) flushes
//! best-effort and logs what could not be written.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::synced::write_atomic;
use crate::DocumentError;

/// Flush failures collected when a buffered scope exits.
#[derive(Debug, Error)]
#[error("failed to flush {} buffered document(s)", failures.len())]
pub struct BufferFlushError {
    /// The backing files that could not be written, with their errors.
    pub failures: Vec<(PathBuf, DocumentError)>,
}

#[derive(Default)]
struct BufferState {
    depth: usize,
    entries: HashMap<PathBuf, Map<String, Value>>,
    /// Paths in the order they were first dirtied.
    dirty: Vec<PathBuf>,
}

/// Shared buffer context for synced documents.
#[derive(Default)]
pub struct BufferPool {
    state: Mutex<BufferState>,
}

impl BufferPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Whether a buffered scope is currently active.
    pub fn is_active(&self) -> bool {
        self.state.lock().depth > 0
    }

    /// Enter a buffered scope. Activation nests; only the release of the
    /// outermost guard flushes.
    pub fn activate(self: &Arc<Self>) -> BufferGuard {
        self.state.lock().depth += 1;
        BufferGuard {
            pool: Arc::clone(self),
            released: false,
        }
    }

    /// Read a document's buffered content, seeding it from the backing
    /// store on first touch.
    pub(crate) fn load_buffered(
        &self,
        path: &Path,
        seed: impl FnOnce() -> Result<Map<String, Value>, DocumentError>,
    ) -> Result<Map<String, Value>, DocumentError> {
        let mut state = self.state.lock();
        if let Some(data) = state.entries.get(path) {
            return Ok(data.clone());
        }
        let data = seed()?;
        state.entries.insert(path.to_path_buf(), data.clone());
        Ok(data)
    }

    /// Record a mutation of a document's content without touching disk.
    pub(crate) fn stage(&self, path: &Path, data: Map<String, Value>) {
        let mut state = self.state.lock();
        if !state.dirty.iter().any(|p| p == path) {
            state.dirty.push(path.to_path_buf());
        }
        state.entries.insert(path.to_path_buf(), data);
    }

    fn release(&self) -> Result<(), BufferFlushError> {
        let (entries, dirty) = {
            let mut state = self.state.lock();
            state.depth -= 1;
            if state.depth > 0 {
                return Ok(());
            }
            let entries = std::mem::take(&mut state.entries);
            let dirty = std::mem::take(&mut state.dirty);
            (entries, dirty)
        };

        let mut failures = Vec::new();
        for path in dirty {
            let Some(data) = entries.get(&path) else {
                continue;
            };
            tracing::debug!(path = %path.display(), "flushing buffered document");
            if let Err(err) = write_atomic(&path, data) {
                failures.push((path, err));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(BufferFlushError { failures })
        }
    }
}

/// Scoped handle on an active buffered scope.
#[must_use = "dropping the guard ends the buffered scope"]
pub struct BufferGuard {
    pool: Arc<BufferPool>,
    released: bool,
}

impl BufferGuard {
    /// Release the scope, flushing if this is the outermost guard.
    pub fn close(mut self) -> Result<(), BufferFlushError> {
        self.released = true;
        self.pool.release()
    }
}

impl Drop for BufferGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.pool.release() {
            for (path, source) in &err.failures {
                tracing::error!(
                    path = %path.display(),
                    error = %source,
                    "failed to flush buffered document on scope exit"
                );
            }
        }
    }
}
