//! The project: a workspace root, its job registry, and the project-level
//! document. Composes the cache, the query engine, the schema detector,
//! and the linked-view builder.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{Map, Value};

use jobspace_doc::{BufferGuard, BufferPool, JobId, SyncedDocument, JOB_ID_LEN};
use jobspace_query::{Filter, ProjectSchema};

use crate::cache::{RepairReport, StatepointCache};
use crate::config::{expand_env, ProjectConfig};
use crate::index::FormatSpec;
use crate::job::Job;
use crate::{
    fsutil, index, view, StoreError, FN_CONFIG, FN_JOB_DOCUMENT, FN_PROJECT_DOCUMENT,
};

/// Integrators supply custom job construction by injecting a factory
/// rather than subclassing.
pub trait JobFactory: Send + Sync {
    /// Construct the job handle for `statepoint` under `project`.
    fn open_job(&self, project: &Project, statepoint: &Value) -> Result<Job, StoreError>;
}

#[derive(Debug, Default)]
pub struct DefaultJobFactory;

impl JobFactory for DefaultJobFactory {
    fn open_job(&self, project: &Project, statepoint: &Value) -> Result<Job, StoreError> {
        Job::new(
            project.workspace_dir().to_path_buf(),
            statepoint.clone(),
            project.buffer_pool(),
        )
    }
}

/// The handle on a jobspace project.
pub struct Project {
    name: String,
    root: PathBuf,
    workspace: PathBuf,
    config: ProjectConfig,
    cache: StatepointCache,
    buffer: Arc<BufferPool>,
    document: Option<SyncedDocument>,
    factory: Arc<dyn JobFactory>,
}

impl Project {
    /// Initialize a project with the given name.
    ///
    /// Safe to call repeatedly with the same arguments; conflicting
    /// arguments against an existing configuration are rejected.
    pub fn init(
        name: &str,
        root: impl AsRef<Path>,
        workspace: Option<&str>,
    ) -> Result<Self, StoreError> {
        let root = root.as_ref();
        if root.join(FN_CONFIG).exists() {
            let project = Self::open(root)?;
            if project.name != name {
                return Err(StoreError::InitConflict {
                    root: root.to_path_buf(),
                });
            }
            if let Some(setting) = workspace {
                if resolve_workspace(&project.root, setting) != project.workspace {
                    return Err(StoreError::InitConflict {
                        root: root.to_path_buf(),
                    });
                }
            }
            return Ok(project);
        }
        std::fs::create_dir_all(root).map_err(StoreError::workspace(root))?;
        let mut config = ProjectConfig::default();
        config.set("project", name);
        if let Some(setting) = workspace {
            config.set("workspace_dir", setting);
        }
        config.write(&root.join(FN_CONFIG))?;
        tracing::info!(name, root = %root.display(), "initialized project");
        Self::open(root)
    }

    /// Open the project configured at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        let no_project = || StoreError::NoProject { path: root.clone() };
        let config = ProjectConfig::load(&root.join(FN_CONFIG))?.ok_or_else(no_project)?;
        let name = config.get("project").ok_or_else(no_project)?.to_owned();
        let workspace = resolve_workspace(&root, config.get_or("workspace_dir", "workspace"));
        let cache = StatepointCache::new(workspace.clone(), &root);
        Ok(Self {
            name,
            root,
            workspace,
            config,
            cache,
            buffer: BufferPool::new(),
            document: None,
            factory: Arc::new(DefaultJobFactory),
        })
    }

    /// Replace the injected job factory.
    pub fn with_job_factory(mut self, factory: Arc<dyn JobFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root_dir(&self) -> &Path {
        &self.root
    }

    pub fn workspace_dir(&self) -> &Path {
        &self.workspace
    }

    pub fn config(&self) -> &ProjectConfig {
        &self.config
    }

    pub fn buffer_pool(&self) -> Arc<BufferPool> {
        Arc::clone(&self.buffer)
    }

    /// Enter a buffered scope covering the project document and every job
    /// document opened from this project.
    pub fn buffered(&self) -> BufferGuard {
        self.buffer.activate()
    }

    /// The project-level synced document.
    pub fn document(&mut self) -> &mut SyncedDocument {
        if self.document.is_none() {
            self.document = Some(SyncedDocument::with_buffer(
                self.root.join(FN_PROJECT_DOCUMENT),
                Arc::clone(&self.buffer),
            ));
        }
        self.document.as_mut().expect("document just bound")
    }

    // ========================================================================
    // Job access
    // ========================================================================

    /// Get the job handle for a state point. Never fails for a valid
    /// mapping; the workspace is not touched until `init`.
    pub fn open_job(&self, statepoint: &Value) -> Result<Job, StoreError> {
        let job = self.factory.open_job(self, statepoint)?;
        self.cache.insert(job.id(), job.statepoint());
        Ok(job)
    }

    /// Get the job handle for a (possibly abbreviated) id. Requires the
    /// state point to be resolvable from the workspace or a recorded
    /// snapshot.
    pub fn open_job_by_id(&self, id: &str) -> Result<Job, StoreError> {
        let full = if id.len() < JOB_ID_LEN {
            let dirs = self.cache.job_dirs()?;
            let matches: Vec<&String> = dirs.iter().filter(|d| d.starts_with(id)).collect();
            match matches.len() {
                0 => id.to_owned(),
                1 => matches[0].clone(),
                _ => {
                    return Err(StoreError::AmbiguousId {
                        prefix: id.to_owned(),
                    })
                }
            }
        } else {
            id.to_owned()
        };
        let statepoint = self.cache.statepoint(&full)?;
        let job = self.factory.open_job(self, &statepoint)?;
        if job.id() != full {
            // A recorded state point that does not hash back to the
            // requested id means the record itself is corrupt.
            return Err(StoreError::corrupted_one(full));
        }
        self.cache.insert(job.id(), job.statepoint());
        Ok(job)
    }

    /// Create an identical copy of `job` within this project.
    pub fn clone_job(&self, job: &Job) -> Result<Job, StoreError> {
        let dst = self.open_job(job.statepoint())?;
        let dst_workspace = dst.workspace();
        if dst_workspace.exists() {
            return Err(StoreError::DestinationExists {
                id: dst.id().to_owned(),
            });
        }
        fsutil::copy_dir_recursive(&job.workspace(), &dst_workspace)?;
        tracing::info!(job = %dst.id(), "cloned job into project");
        Ok(dst)
    }

    /// The number of initialized jobs.
    pub fn num_jobs(&self) -> Result<usize, StoreError> {
        Ok(self.cache.job_dirs()?.len())
    }

    /// Whether `job` is initialized within this project's data space.
    pub fn contains(&self, job: &Job) -> bool {
        self.workspace
            .join(job.id())
            .join(crate::FN_MANIFEST)
            .is_file()
    }

    // ========================================================================
    // Search
    // ========================================================================

    /// The ids of all jobs matching the filters. Without filters this is
    /// a plain workspace listing; with filters every candidate manifest
    /// is validated first.
    pub fn find_job_ids(
        &self,
        filter: Option<&Value>,
        doc_filter: Option<&Value>,
    ) -> Result<Vec<JobId>, StoreError> {
        if filter.is_none() && doc_filter.is_none() {
            return self.cache.job_dirs();
        }
        let sp_filter = Filter::parse(filter)?;
        let doc_filter = doc_filter.map(|f| Filter::parse(Some(f))).transpose()?;
        let mut ids = Vec::new();
        for (id, statepoint) in self.checked_entries()? {
            if !sp_filter.matches(&statepoint) {
                continue;
            }
            if let Some(doc_filter) = &doc_filter {
                if !doc_filter.matches(&self.job_document_value(&id)?) {
                    continue;
                }
            }
            ids.push(id);
        }
        Ok(ids)
    }

    /// All jobs matching `filter`, as handles.
    pub fn find_jobs(&self, filter: Option<&Value>) -> Result<Vec<Job>, StoreError> {
        self.find_job_ids(filter, None)?
            .iter()
            .map(|id| self.open_job_by_id(id))
            .collect()
    }

    /// Every initialized job.
    pub fn jobs(&self) -> Result<Vec<Job>, StoreError> {
        self.find_jobs(None)
    }

    /// The minimum id prefix length that is unambiguous in this project.
    pub fn min_len_unique_id(&self) -> Result<usize, StoreError> {
        let ids = self.cache.job_dirs()?;
        for length in 1..=JOB_ID_LEN {
            let mut seen = HashSet::new();
            if ids.iter().all(|id| seen.insert(&id[..length])) {
                return Ok(length);
            }
        }
        Ok(JOB_ID_LEN)
    }

    // ========================================================================
    // Schema and views
    // ========================================================================

    /// Detect the state-point schema over a job subset (default: all
    /// jobs).
    pub fn detect_schema(
        &self,
        exclude_const: bool,
        subset: Option<&[JobId]>,
    ) -> Result<ProjectSchema, StoreError> {
        let entries = self.checked_entries()?;
        let selected: Vec<&Value> = match subset {
            Some(ids) => {
                let want: HashSet<&str> = ids.iter().map(String::as_str).collect();
                entries
                    .iter()
                    .filter(|(id, _)| want.contains(id.as_str()))
                    .map(|(_, statepoint)| statepoint)
                    .collect()
            }
            None => entries.iter().map(|(_, statepoint)| statepoint).collect(),
        };
        Ok(ProjectSchema::detect(selected, exclude_const))
    }

    /// Create or update a linked view of the selected data space under
    /// `prefix` (default: `<root>/view`).
    pub fn create_linked_view(
        &self,
        prefix: Option<&Path>,
        job_ids: Option<&[JobId]>,
        index: Option<&[Value]>,
    ) -> Result<(), StoreError> {
        let default_prefix = self.root.join("view");
        let prefix = prefix.unwrap_or(&default_prefix);

        let pairs = match index {
            Some(docs) => index_pairs(docs)?,
            None => self.checked_entries()?,
        };
        let subset: Vec<(JobId, Value)> = match job_ids {
            Some(ids) => {
                let want: HashSet<&str> = ids.iter().map(String::as_str).collect();
                let selected: Vec<(JobId, Value)> = pairs
                    .into_iter()
                    .filter(|(id, _)| want.contains(id.as_str()))
                    .collect();
                if selected.len() != want.len() {
                    return Err(StoreError::InsufficientIndex);
                }
                selected
            }
            None => pairs,
        };
        let links = view::build_links(&subset, &self.workspace);
        view::update_view(prefix, &links)
    }

    // ========================================================================
    // Integrity
    // ========================================================================

    /// Scan every workspace subdirectory and raise the aggregated
    /// corruption report if anything fails directory↔id integrity.
    pub fn check(&self) -> Result<(), StoreError> {
        tracing::info!(workspace = %self.workspace.display(), "checking workspace integrity");
        let report = self.cache.scan()?;
        if report.corrupted.is_empty() {
            Ok(())
        } else {
            Err(StoreError::JobsCorrupted {
                ids: report.corrupted,
            })
        }
    }

    /// Best-effort workspace repair. Entries that cannot be fixed are
    /// reported, not raised, and left unmodified.
    pub fn repair(&self) -> Result<RepairReport, StoreError> {
        tracing::info!(workspace = %self.workspace.display(), "repairing workspace");
        self.cache.repair()
    }

    /// Drop the in-memory state-point cache, forcing a full re-scan on
    /// next access.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Delete the on-disk cache snapshot.
    pub fn remove_cache_snapshot(&self) -> Result<(), StoreError> {
        self.cache.remove_snapshot()
    }

    /// Write the `id -> state point` dump file (default: every valid
    /// entry in the workspace). `repair` consults it when manifests are
    /// lost.
    pub fn write_statepoints(&self, statepoints: Option<&[Value]>) -> Result<(), StoreError> {
        match statepoints {
            Some(statepoints) => self.cache.write_statepoints(statepoints),
            None => {
                let statepoints: Vec<Value> = self
                    .checked_entries()?
                    .into_iter()
                    .map(|(_, statepoint)| statepoint)
                    .collect();
                self.cache.write_statepoints(&statepoints)
            }
        }
    }

    pub fn read_statepoints(&self) -> Result<Map<String, Value>, StoreError> {
        self.cache.read_statepoints()
    }

    // ========================================================================
    // Indexing
    // ========================================================================

    /// Generate an index of the workspace: one state-point descriptor per
    /// job plus one descriptor per file matching any of `formats`.
    pub fn index(&self, formats: &[FormatSpec]) -> Result<Vec<Value>, StoreError> {
        let mut docs = Vec::new();
        for (id, statepoint) in self.checked_entries()? {
            let content = self.job_document_map(&id)?;
            docs.push(index::statepoint_descriptor(&id, &statepoint, &content)?);
            for spec in formats {
                docs.extend(index::file_descriptors(&id, &self.workspace, spec)?);
            }
        }
        Ok(docs)
    }

    // ========================================================================
    // Internal
    // ========================================================================

    /// Every valid `(id, state point)` pair, or the aggregated corruption
    /// error. Operations requiring correctness go through here.
    fn checked_entries(&self) -> Result<Vec<(JobId, Value)>, StoreError> {
        let report = self.cache.scan()?;
        if !report.corrupted.is_empty() {
            return Err(StoreError::JobsCorrupted {
                ids: report.corrupted,
            });
        }
        Ok(report.valid.into_iter().collect())
    }

    fn job_document_map(&self, id: &str) -> Result<Map<String, Value>, StoreError> {
        let mut document = SyncedDocument::with_buffer(
            self.workspace.join(id).join(FN_JOB_DOCUMENT),
            Arc::clone(&self.buffer),
        );
        Ok(document.to_map()?)
    }

    fn job_document_value(&self, id: &str) -> Result<Value, StoreError> {
        Ok(Value::Object(self.job_document_map(id)?))
    }

    pub(crate) fn register_statepoint(&self, id: &str, statepoint: &Value) {
        self.cache.insert(id, statepoint);
    }
}

impl std::fmt::Debug for Project {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Project")
            .field("name", &self.name)
            .field("root", &self.root)
            .field("workspace", &self.workspace)
            .finish()
    }
}

fn resolve_workspace(root: &Path, setting: &str) -> PathBuf {
    let expanded = expand_env(setting);
    let path = PathBuf::from(expanded);
    if path.is_absolute() {
        path
    } else {
        root.join(path)
    }
}

/// Validate an externally supplied index: every entry must be a mapping
/// with a unique `_id` and a `statepoint`; duplicate ids with divergent
/// content are rejected.
fn index_pairs(docs: &[Value]) -> Result<Vec<(JobId, Value)>, StoreError> {
    let mut pairs: Vec<(JobId, Value)> = Vec::new();
    let mut seen: std::collections::HashMap<&str, &Value> = std::collections::HashMap::new();
    for doc in docs {
        let Some(id) = doc.get("_id").and_then(Value::as_str) else {
            return Err(StoreError::InsufficientIndex);
        };
        let statepoint = doc.get("statepoint").unwrap_or(&Value::Null);
        match seen.get(id) {
            Some(previous) if *previous != statepoint => {
                return Err(StoreError::DuplicateIndexId { id: id.to_owned() });
            }
            Some(_) => continue,
            None => {
                seen.insert(id, statepoint);
                if statepoint.is_object() {
                    pairs.push((id.to_owned(), statepoint.clone()));
                } else {
                    // File descriptors carry no state point; they do not
                    // select jobs.
                    continue;
                }
            }
        }
    }
    Ok(pairs)
}
