//! The state-point cache: an in-memory `id -> state point` map over the
//! workspace, an opportunistic on-disk snapshot for faster cold starts,
//! and the scan/repair machinery behind `Project::check` and
//! `Project::repair`.
//!
//! A cache entry is valid iff the workspace subdirectory named by that id
//! holds a manifest that re-encodes to the same id. Scans collect every
//! violation instead of failing on the first one; the caller decides
//! whether to raise the aggregate.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde_json::{Map, Value};

use jobspace_doc::{calc_id, canonical_bytes, is_job_id, JobId};

use crate::{fsutil, StoreError, FN_CACHE, FN_MANIFEST, FN_STATEPOINTS};

/// What `repair()` managed to do. Per-entry failures are reported here,
/// never raised; the affected directories are left unmodified.
#[derive(Debug, Default)]
pub struct RepairReport {
    /// Directories restored to a valid `id -> manifest` pairing.
    pub fixed: Vec<String>,
    /// Directories that could not be repaired, with the reason.
    pub failed: Vec<(String, String)>,
}

impl RepairReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug)]
pub(crate) enum ManifestState {
    /// Manifest parses and re-encodes to the directory name.
    Valid { statepoint: Value },
    /// Manifest parses but hashes to a different id.
    Mislocated { id: JobId, statepoint: Value },
    /// No manifest file.
    Missing,
    /// Manifest exists but does not parse.
    Unreadable,
}

#[derive(Debug, Default)]
pub(crate) struct ScanReport {
    pub valid: BTreeMap<JobId, Value>,
    pub corrupted: BTreeSet<String>,
}

pub(crate) struct StatepointCache {
    workspace: PathBuf,
    snapshot_path: PathBuf,
    statepoints_path: PathBuf,
    entries: Mutex<HashMap<JobId, Value>>,
}

impl StatepointCache {
    pub(crate) fn new(workspace: PathBuf, root: &Path) -> Self {
        Self {
            workspace,
            snapshot_path: root.join(FN_CACHE),
            statepoints_path: root.join(FN_STATEPOINTS),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn insert(&self, id: &str, statepoint: &Value) {
        self.entries
            .lock()
            .insert(id.to_owned(), statepoint.clone());
    }

    /// Drop the in-memory map, forcing a full rescan on next access.
    pub(crate) fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Workspace subdirectories whose names have the shape of a job id,
    /// sorted. A missing workspace directory is an empty data space.
    pub(crate) fn job_dirs(&self) -> Result<Vec<String>, StoreError> {
        Ok(self
            .subdirectories()?
            .into_iter()
            .filter(|name| is_job_id(name))
            .collect())
    }

    /// Every workspace subdirectory, sorted, id-shaped or not.
    pub(crate) fn subdirectories(&self) -> Result<Vec<String>, StoreError> {
        let mut names = Vec::new();
        let entries = match std::fs::read_dir(&self.workspace) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(err) => return Err(StoreError::workspace(&self.workspace)(err)),
        };
        for entry in entries {
            let entry = entry.map_err(StoreError::workspace(&self.workspace))?;
            if entry.path().is_dir() {
                if let Ok(name) = entry.file_name().into_string() {
                    names.push(name);
                }
            }
        }
        names.sort_unstable();
        Ok(names)
    }

    pub(crate) fn manifest_state(&self, dir_name: &str) -> ManifestState {
        let manifest = self.workspace.join(dir_name).join(FN_MANIFEST);
        let bytes = match std::fs::read(&manifest) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return ManifestState::Missing
            }
            Err(err) => {
                tracing::warn!(
                    path = %manifest.display(),
                    error = %err,
                    "unable to read manifest"
                );
                return ManifestState::Unreadable;
            }
        };
        let Ok(statepoint) = serde_json::from_slice::<Value>(&bytes) else {
            tracing::warn!(path = %manifest.display(), "manifest does not parse");
            return ManifestState::Unreadable;
        };
        match calc_id(&statepoint) {
            Ok(id) if id == dir_name => ManifestState::Valid { statepoint },
            Ok(id) => ManifestState::Mislocated { id, statepoint },
            Err(_) => ManifestState::Unreadable,
        }
    }

    /// Scan the whole workspace, recording every valid `(id, state point)`
    /// pair and collecting every integrity violation. On a clean pass the
    /// on-disk snapshot is refreshed opportunistically.
    pub(crate) fn scan(&self) -> Result<ScanReport, StoreError> {
        let mut report = ScanReport::default();
        for dir in self.subdirectories()? {
            match self.manifest_state(&dir) {
                ManifestState::Valid { statepoint } => {
                    self.insert(&dir, &statepoint);
                    report.valid.insert(dir, statepoint);
                }
                _ => {
                    report.corrupted.insert(dir);
                }
            }
        }
        if let Err(err) = self.write_snapshot() {
            tracing::warn!(error = %err, "unable to write cache snapshot");
        }
        Ok(report)
    }

    /// Resolve the state point for `id`: memory, then the workspace
    /// manifest, then the recorded snapshots.
    pub(crate) fn statepoint(&self, id: &str) -> Result<Value, StoreError> {
        if let Some(statepoint) = self.entries.lock().get(id) {
            return Ok(statepoint.clone());
        }
        match self.manifest_state(id) {
            ManifestState::Valid { statepoint } => {
                self.insert(id, &statepoint);
                Ok(statepoint)
            }
            ManifestState::Mislocated { .. } | ManifestState::Unreadable => {
                // The directory exists but disagrees with its name; a
                // recorded state point still answers the lookup, repair
                // can fix the directory later.
                self.lookup_recorded(id)
                    .ok_or_else(|| StoreError::corrupted_one(id))
            }
            ManifestState::Missing => match self.lookup_recorded(id) {
                Some(statepoint) => Ok(statepoint),
                None if self.workspace.join(id).is_dir() => {
                    Err(StoreError::corrupted_one(id))
                }
                None => Err(StoreError::UnknownId { id: id.to_owned() }),
            },
        }
    }

    /// Best-effort repair pass over every workspace subdirectory.
    pub(crate) fn repair(&self) -> Result<RepairReport, StoreError> {
        let recorded = self.recorded_statepoints();
        let mut report = RepairReport::default();
        for dir in self.subdirectories()? {
            match self.manifest_state(&dir) {
                ManifestState::Valid { statepoint } => {
                    self.insert(&dir, &statepoint);
                }
                ManifestState::Mislocated { id, statepoint } => {
                    self.relocate(&dir, &id, &statepoint, &mut report);
                }
                ManifestState::Missing | ManifestState::Unreadable => {
                    let Some(statepoint) = recorded.get(&dir) else {
                        tracing::warn!(%dir, "no recorded state point; cannot repair");
                        report
                            .failed
                            .push((dir, "no recorded state point".to_owned()));
                        continue;
                    };
                    // A recorded state point that cannot be re-encoded is
                    // itself a failed entry, not a failed repair pass.
                    let (id, bytes) = match calc_id(statepoint)
                        .and_then(|id| canonical_bytes(statepoint).map(|bytes| (id, bytes)))
                    {
                        Ok(pair) => pair,
                        Err(err) => {
                            report.failed.push((dir, err.to_string()));
                            continue;
                        }
                    };
                    let manifest = self.workspace.join(&dir).join(FN_MANIFEST);
                    if let Err(err) = fsutil::write_atomic(&manifest, &bytes) {
                        report.failed.push((dir, err.to_string()));
                        continue;
                    }
                    if id == dir {
                        tracing::info!(job = %id, "restored manifest from recorded state point");
                        self.insert(&id, statepoint);
                        report.fixed.push(dir);
                    } else {
                        self.relocate(&dir, &id, statepoint, &mut report);
                    }
                }
            }
        }
        Ok(report)
    }

    /// Move a mis-located directory to the subdirectory named by its true
    /// id. Refuses (reports, does not raise) when the destination is
    /// already occupied.
    fn relocate(&self, dir: &str, id: &str, statepoint: &Value, report: &mut RepairReport) {
        let src = self.workspace.join(dir);
        let dst = self.workspace.join(id);
        if dst.exists() {
            tracing::warn!(dir, job = %id, "destination already exists; cannot repair");
            report.failed.push((
                dir.to_owned(),
                format!("destination '{id}' already holds a job"),
            ));
            return;
        }
        if let Err(err) = std::fs::rename(&src, &dst) {
            report.failed.push((dir.to_owned(), err.to_string()));
            return;
        }
        tracing::info!(from = dir, to = %id, "relocated job workspace");
        self.insert(id, statepoint);
        report.fixed.push(dir.to_owned());
    }

    /// Everything we know about `id -> state point` pairings: the
    /// in-memory map, the on-disk snapshot, and the explicit dump file.
    pub(crate) fn recorded_statepoints(&self) -> HashMap<JobId, Value> {
        let mut recorded = HashMap::new();
        if let Some(map) = read_json_map(&self.statepoints_path) {
            recorded.extend(map);
        }
        if let Some(map) = read_json_map(&self.snapshot_path) {
            recorded.extend(map);
        }
        for (id, statepoint) in self.entries.lock().iter() {
            recorded.insert(id.clone(), statepoint.clone());
        }
        recorded
    }

    fn lookup_recorded(&self, id: &str) -> Option<Value> {
        read_json_map(&self.snapshot_path)
            .and_then(|mut map| map.remove(id))
            .or_else(|| read_json_map(&self.statepoints_path).and_then(|mut map| map.remove(id)))
    }

    fn write_snapshot(&self) -> Result<(), StoreError> {
        let entries = self.entries.lock();
        let map: Map<String, Value> = entries
            .iter()
            .map(|(id, statepoint)| (id.clone(), statepoint.clone()))
            .collect();
        drop(entries);
        let bytes = serde_json::to_vec(&map).map_err(|err| {
            StoreError::Workspace {
                path: self.snapshot_path.clone(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidData, err),
            }
        })?;
        fsutil::write_atomic(&self.snapshot_path, &bytes)
    }

    pub(crate) fn remove_snapshot(&self) -> Result<(), StoreError> {
        match std::fs::remove_file(&self.snapshot_path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StoreError::workspace(&self.snapshot_path)(err)),
        }
    }

    /// Read the explicit `id -> state point` dump.
    pub(crate) fn read_statepoints(&self) -> Result<Map<String, Value>, StoreError> {
        match std::fs::read(&self.statepoints_path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|err| StoreError::Workspace {
                path: self.statepoints_path.clone(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidData, err),
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Map::new()),
            Err(err) => Err(StoreError::workspace(&self.statepoints_path)(err)),
        }
    }

    /// Merge `statepoints` into the dump file, keyed by their ids.
    /// Existing entries are preserved.
    pub(crate) fn write_statepoints(&self, statepoints: &[Value]) -> Result<(), StoreError> {
        let mut map = self.read_statepoints()?;
        for statepoint in statepoints {
            map.insert(calc_id(statepoint)?, statepoint.clone());
        }
        let bytes = serde_json::to_vec_pretty(&map).map_err(|err| StoreError::Workspace {
            path: self.statepoints_path.clone(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, err),
        })?;
        fsutil::write_atomic(&self.statepoints_path, &bytes)
    }
}

fn read_json_map(path: &Path) -> Option<Map<String, Value>> {
    let bytes = std::fs::read(path).ok()?;
    serde_json::from_slice(&bytes).ok()
}
