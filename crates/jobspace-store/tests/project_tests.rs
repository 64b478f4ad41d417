//! Project and job lifecycle E2E tests.

use std::sync::Arc;

use jobspace_store::{
    DefaultJobFactory, Job, JobFactory, Project, StoreError, FN_MANIFEST,
};
use serde_json::{json, Value};
use tempfile::tempdir;

fn project(dir: &std::path::Path) -> Project {
    Project::init("test", dir, None).unwrap()
}

// ============================================================================
// Initialization and configuration
// ============================================================================

#[test]
fn test_init_is_idempotent() {
    let dir = tempdir().unwrap();
    let first = Project::init("test", dir.path(), None).unwrap();
    let second = Project::init("test", dir.path(), None).unwrap();
    assert_eq!(first.name(), "test");
    assert_eq!(first.root_dir(), second.root_dir());
    assert_eq!(first.workspace_dir(), dir.path().join("workspace"));
}

#[test]
fn test_init_conflict() {
    let dir = tempdir().unwrap();
    Project::init("test", dir.path(), None).unwrap();
    assert!(matches!(
        Project::init("other", dir.path(), None),
        Err(StoreError::InitConflict { .. })
    ));
    assert!(matches!(
        Project::init("test", dir.path(), Some("elsewhere")),
        Err(StoreError::InitConflict { .. })
    ));
}

#[test]
fn test_open_without_config() {
    let dir = tempdir().unwrap();
    assert!(matches!(
        Project::open(dir.path()),
        Err(StoreError::NoProject { .. })
    ));
}

#[test]
fn test_workspace_directory_with_env_variable() {
    let dir = tempdir().unwrap();
    std::env::set_var("JOBSPACE_TEST_WS", dir.path().display().to_string());
    let project = Project::init("test", dir.path(), Some("$JOBSPACE_TEST_WS/ws")).unwrap();
    assert_eq!(project.workspace_dir(), dir.path().join("ws"));
}

#[test]
fn test_custom_workspace_relative_to_root() {
    let dir = tempdir().unwrap();
    let project = Project::init("test", dir.path(), Some("ws2")).unwrap();
    assert_eq!(project.workspace_dir(), dir.path().join("ws2"));
}

// ============================================================================
// Job lifecycle
// ============================================================================

#[test]
fn test_open_job_roundtrip_by_id() {
    let dir = tempdir().unwrap();
    let project = project(dir.path());
    let statepoint = json!({"a": 0, "b": {"c": true}});

    let job = project.open_job(&statepoint).unwrap();
    assert!(!job.is_initialized());
    job.init().unwrap();
    assert!(job.is_initialized());

    // A fresh project instance resolves the state point from the
    // workspace manifest alone.
    let reopened = Project::open(dir.path()).unwrap();
    let by_id = reopened.open_job_by_id(job.id()).unwrap();
    assert_eq!(by_id.statepoint(), &statepoint);
    assert_eq!(by_id.id(), job.id());
}

#[test]
fn test_init_is_idempotent_for_jobs() {
    let dir = tempdir().unwrap();
    let project = project(dir.path());
    let job = project.open_job(&json!({"a": 0})).unwrap();
    job.init().unwrap();
    job.init().unwrap();
    assert_eq!(project.num_jobs().unwrap(), 1);
}

#[test]
fn test_remove_and_reinit() {
    let dir = tempdir().unwrap();
    let project = project(dir.path());
    let mut job = project.open_job(&json!({"a": 0})).unwrap();
    job.init().unwrap();
    job.document().unwrap().insert("note", json!("kept?")).unwrap();

    job.remove().unwrap();
    assert!(!job.is_initialized());
    assert_eq!(project.num_jobs().unwrap(), 0);

    // Re-initialization yields a fresh workspace.
    job.init().unwrap();
    assert!(job.is_initialized());
    assert!(job.document().unwrap().is_empty().unwrap());
}

#[test]
fn test_job_equality_by_project_and_id() {
    let dir = tempdir().unwrap();
    let project = project(dir.path());
    let a = project.open_job(&json!({"a": 0})).unwrap();
    let b = project.open_job(&json!({"a": 0})).unwrap();
    let c = project.open_job(&json!({"a": 1})).unwrap();
    assert_eq!(a, b);
    assert_ne!(a, c);

    let other_dir = tempdir().unwrap();
    let other = Project::init("other", other_dir.path(), None).unwrap();
    let d = other.open_job(&json!({"a": 0})).unwrap();
    assert_eq!(a.id(), d.id());
    assert_ne!(a, d);
}

#[test]
fn test_job_file_helpers() {
    let dir = tempdir().unwrap();
    let project = project(dir.path());
    let job = project.open_job(&json!({"a": 0})).unwrap();
    job.init().unwrap();
    assert!(!job.has_file("out.txt"));
    std::fs::write(job.path_to("out.txt"), b"data").unwrap();
    assert!(job.has_file("out.txt"));
}

#[test]
fn test_job_document_persists() {
    let dir = tempdir().unwrap();
    let project = project(dir.path());
    let mut job = project.open_job(&json!({"a": 0})).unwrap();
    job.document().unwrap().insert("progress", json!(0.5)).unwrap();

    let mut again = project.open_job(&json!({"a": 0})).unwrap();
    assert_eq!(
        again.document().unwrap().get("progress").unwrap(),
        Some(json!(0.5))
    );
}

#[test]
fn test_project_document() {
    let dir = tempdir().unwrap();
    let mut project = project(dir.path());
    project.document().insert("stage", json!("setup")).unwrap();

    let mut reopened = Project::open(dir.path()).unwrap();
    assert_eq!(
        reopened.document().get("stage").unwrap(),
        Some(json!("setup"))
    );
}

// ============================================================================
// Abbreviated ids
// ============================================================================

#[test]
fn test_open_job_by_abbreviated_id() {
    let dir = tempdir().unwrap();
    let project = project(dir.path());
    for i in 0..5 {
        project.open_job(&json!({"a": i})).unwrap().init().unwrap();
    }
    let job = project.open_job(&json!({"a": 0})).unwrap();
    let len = project.min_len_unique_id().unwrap();
    let short = &job.id()[..len];
    assert_eq!(project.open_job_by_id(short).unwrap().id(), job.id());

    // The empty prefix matches every job.
    assert!(matches!(
        project.open_job_by_id(""),
        Err(StoreError::AmbiguousId { .. })
    ));
    assert!(matches!(
        project.open_job_by_id("zzzz"),
        Err(StoreError::UnknownId { .. })
    ));
}

// ============================================================================
// Search
// ============================================================================

#[test]
fn test_find_job_ids_with_filters() {
    let dir = tempdir().unwrap();
    let project = project(dir.path());
    for i in 0..10 {
        project
            .open_job(&json!({"a": i, "b": {"c": i % 2}}))
            .unwrap()
            .init()
            .unwrap();
    }
    assert_eq!(project.find_job_ids(None, None).unwrap().len(), 10);
    assert_eq!(
        project
            .find_job_ids(Some(&json!({"b.c": 0})), None)
            .unwrap()
            .len(),
        5
    );
    for k in 0..=10 {
        assert_eq!(
            project
                .find_job_ids(Some(&json!({"a": {"$lt": k}})), None)
                .unwrap()
                .len(),
            k
        );
    }
    assert_eq!(
        project.find_jobs(Some(&json!({"$and": []}))).unwrap().len(),
        10
    );
    assert_eq!(
        project.find_jobs(Some(&json!({"$or": []}))).unwrap().len(),
        0
    );
}

#[test]
fn test_find_with_doc_filter() {
    let dir = tempdir().unwrap();
    let project = project(dir.path());
    for i in 0..4 {
        let mut job = project.open_job(&json!({"a": i})).unwrap();
        job.document()
            .unwrap()
            .insert("passed", json!(i % 2 == 0))
            .unwrap();
    }
    let ids = project
        .find_job_ids(None, Some(&json!({"passed": true})))
        .unwrap();
    assert_eq!(ids.len(), 2);
}

#[test]
fn test_iteration_and_contains() {
    let dir = tempdir().unwrap();
    let project = project(dir.path());
    let statepoints: Vec<Value> = (0..5).map(|i| json!({"a": i})).collect();
    for statepoint in &statepoints {
        project.open_job(statepoint).unwrap().init().unwrap();
    }
    let jobs = project.jobs().unwrap();
    assert_eq!(jobs.len(), 5);
    for job in &jobs {
        assert!(project.contains(job));
    }
    let unmaterialized = project.open_job(&json!({"a": 99})).unwrap();
    assert!(!project.contains(&unmaterialized));
}

// ============================================================================
// Move and clone
// ============================================================================

#[test]
fn test_job_move() {
    let dir_a = tempdir().unwrap();
    let dir_b = tempdir().unwrap();
    let project_a = Project::init("a", dir_a.path(), None).unwrap();
    let project_b = Project::init("b", dir_b.path(), None).unwrap();

    let mut job = project_a.open_job(&json!({"a": 0})).unwrap();
    job.document().unwrap().insert("d", json!(1)).unwrap();
    job.move_to(&project_b).unwrap();

    assert_eq!(project_a.num_jobs().unwrap(), 0);
    assert_eq!(project_b.num_jobs().unwrap(), 1);
    assert!(job.workspace().starts_with(project_b.workspace_dir()));
    assert_eq!(job.document().unwrap().get("d").unwrap(), Some(json!(1)));
}

#[test]
fn test_job_move_destination_exists() {
    let dir_a = tempdir().unwrap();
    let dir_b = tempdir().unwrap();
    let project_a = Project::init("a", dir_a.path(), None).unwrap();
    let project_b = Project::init("b", dir_b.path(), None).unwrap();

    let mut job = project_a.open_job(&json!({"a": 0})).unwrap();
    job.init().unwrap();
    project_b.open_job(&json!({"a": 0})).unwrap().init().unwrap();

    assert!(matches!(
        job.move_to(&project_b),
        Err(StoreError::DestinationExists { .. })
    ));
    // The source is untouched by the rejected move.
    assert_eq!(project_a.num_jobs().unwrap(), 1);
}

#[test]
fn test_job_clone() {
    let dir_a = tempdir().unwrap();
    let dir_b = tempdir().unwrap();
    let project_a = Project::init("a", dir_a.path(), None).unwrap();
    let project_b = Project::init("b", dir_b.path(), None).unwrap();

    let mut job = project_a.open_job(&json!({"a": 0})).unwrap();
    job.document().unwrap().insert("d", json!(1)).unwrap();
    std::fs::write(job.path_to("out.txt"), b"data").unwrap();

    let mut copy = project_b.clone_job(&job).unwrap();
    assert_eq!(copy.id(), job.id());
    assert!(copy.has_file("out.txt"));
    assert_eq!(copy.document().unwrap().get("d").unwrap(), Some(json!(1)));
    // The original stays initialized in its own project.
    assert_eq!(project_a.num_jobs().unwrap(), 1);
    assert_eq!(project_b.num_jobs().unwrap(), 1);

    assert!(matches!(
        project_b.clone_job(&job),
        Err(StoreError::DestinationExists { .. })
    ));
}

// ============================================================================
// Corruption and repair
// ============================================================================

#[test]
fn test_rename_workspace_check_and_repair() {
    let dir = tempdir().unwrap();
    let project = project(dir.path());
    let job = project.open_job(&json!({"a": 0})).unwrap();
    job.init().unwrap();

    let wrong = project.workspace_dir().join("0".repeat(64));
    std::fs::rename(job.workspace(), &wrong).unwrap();
    assert!(!job.workspace().exists());

    match project.check() {
        Err(StoreError::JobsCorrupted { ids }) => {
            assert!(ids.contains(&"0".repeat(64)));
        }
        other => panic!("expected corruption, got {other:?}"),
    }

    // The manifest inside the misnamed directory still identifies the
    // job, so repair can move it back.
    let report = project.repair().unwrap();
    assert!(report.is_clean());
    assert_eq!(report.fixed.len(), 1);
    project.check().unwrap();
    assert!(job.workspace().exists());

    // Corrupt again, but now re-initialize the job first: the repair
    // destination is occupied, so that entry is reported, not fixed.
    std::fs::rename(job.workspace(), &wrong).unwrap();
    job.init().unwrap();
    let report = project.repair().unwrap();
    assert!(!report.is_clean());
    assert!(project.check().is_err());

    // Manual cleanup unblocks the next repair pass.
    std::fs::remove_dir_all(job.workspace()).unwrap();
    let report = project.repair().unwrap();
    assert!(report.is_clean());
    project.check().unwrap();
}

#[test]
fn test_missing_manifest_detected_and_repaired_from_dump() {
    let dir = tempdir().unwrap();
    let project = project(dir.path());
    let statepoints: Vec<Value> = (0..5).map(|i| json!({"a": i})).collect();
    for statepoint in &statepoints {
        project.open_job(statepoint).unwrap().init().unwrap();
    }
    project.write_statepoints(None).unwrap();

    let job = project.open_job(&statepoints[0]).unwrap();
    std::fs::remove_file(job.workspace().join(FN_MANIFEST)).unwrap();

    project.clear_cache();
    project.remove_cache_snapshot().unwrap();
    assert!(matches!(
        project.check(),
        Err(StoreError::JobsCorrupted { .. })
    ));

    let report = project.repair().unwrap();
    assert!(report.is_clean(), "failed: {:?}", report.failed);
    project.check().unwrap();
    assert_eq!(
        project
            .open_job_by_id(job.id())
            .unwrap()
            .statepoint(),
        &statepoints[0]
    );
}

#[test]
fn test_missing_manifest_without_record_is_reported() {
    let dir = tempdir().unwrap();
    let project = project(dir.path());
    let job = project.open_job(&json!({"a": 0})).unwrap();
    job.init().unwrap();
    std::fs::remove_file(job.workspace().join(FN_MANIFEST)).unwrap();

    project.clear_cache();
    project.remove_cache_snapshot().unwrap();

    // Repair has nothing to recover from; it reports the entry and
    // leaves the workspace unmodified.
    let report = project.repair().unwrap();
    assert_eq!(report.fixed.len(), 0);
    assert_eq!(report.failed.len(), 1);
    assert!(project.check().is_err());
}

#[test]
fn test_corrupted_manifest_detected_on_lookup() {
    let dir = tempdir().unwrap();
    let project = project(dir.path());
    let job = project.open_job(&json!({"a": 0})).unwrap();
    job.init().unwrap();
    std::fs::write(job.workspace().join(FN_MANIFEST), b"").unwrap();

    project.clear_cache();
    project.remove_cache_snapshot().unwrap();
    assert!(matches!(
        project.open_job_by_id(job.id()),
        Err(StoreError::JobsCorrupted { .. })
    ));
    assert!(matches!(job.init(), Err(StoreError::JobsCorrupted { .. })));
}

// ============================================================================
// Indexing
// ============================================================================

#[test]
fn test_index_contains_statepoint_descriptors() {
    let dir = tempdir().unwrap();
    let project = project(dir.path());
    for i in 0..5 {
        let mut job = project.open_job(&json!({"a": i})).unwrap();
        job.document().unwrap().insert("ok", json!(true)).unwrap();
    }
    let docs = project.index(&[]).unwrap();
    assert_eq!(docs.len(), 5);
    for doc in &docs {
        let id = doc.get("_id").and_then(Value::as_str).unwrap();
        let statepoint = doc.get("statepoint").unwrap();
        assert_eq!(project.open_job(statepoint).unwrap().id(), id);
        assert_eq!(doc.get("ok"), Some(&json!(true)));
    }
}

#[test]
fn test_index_with_file_formats() {
    use jobspace_store::index::FormatSpec;

    let dir = tempdir().unwrap();
    let project = project(dir.path());
    for i in 0..3 {
        let job = project.open_job(&json!({"a": i})).unwrap();
        job.init().unwrap();
        std::fs::write(job.path_to("out.txt"), b"data").unwrap();
    }
    let docs = project
        .index(&[FormatSpec::new(r".*\.txt", "TextFile")])
        .unwrap();
    // One state-point descriptor plus one file descriptor per job.
    assert_eq!(docs.len(), 6);
    let files: Vec<&Value> = docs
        .iter()
        .filter(|d| d.get("format").is_some())
        .collect();
    assert_eq!(files.len(), 3);
    for doc in files {
        assert_eq!(doc.get("format"), Some(&json!("TextFile")));
        assert!(doc.get("_id").is_some());
        assert!(doc
            .get("filename")
            .and_then(Value::as_str)
            .unwrap()
            .ends_with("out.txt"));
    }
}

#[test]
fn test_index_rejects_reserved_document_keys() {
    let dir = tempdir().unwrap();
    let project = project(dir.path());
    let mut job = project.open_job(&json!({"a": 0})).unwrap();
    job.document().unwrap().insert("_id", json!(true)).unwrap();
    assert!(matches!(
        project.index(&[]),
        Err(StoreError::ReservedKey { .. })
    ));

    job.document().unwrap().remove("_id").unwrap();
    project.index(&[]).unwrap();

    job.document()
        .unwrap()
        .insert("statepoint", json!(true))
        .unwrap();
    assert!(matches!(
        project.index(&[]),
        Err(StoreError::ReservedKey { .. })
    ));
}

// ============================================================================
// Schema detection through the project
// ============================================================================

#[test]
fn test_detect_schema() {
    let dir = tempdir().unwrap();
    let project = project(dir.path());
    for i in 0..10 {
        project
            .open_job(&json!({"const": 0, "a": i, "b": {"b2": i}}))
            .unwrap()
            .init()
            .unwrap();
    }
    let schema = project.detect_schema(false, None).unwrap();
    assert_eq!(schema.len(), 3);
    assert!(schema.contains("const"));
    assert!(schema.contains("b.b2"));

    let schema = project.detect_schema(true, None).unwrap();
    assert_eq!(schema.len(), 2);
    assert!(!schema.contains("const"));
}

#[test]
fn test_detect_schema_subset() {
    let dir = tempdir().unwrap();
    let project = project(dir.path());
    for i in 0..10 {
        project.open_job(&json!({"a": i})).unwrap().init().unwrap();
    }
    let subset = project
        .find_job_ids(Some(&json!({"a": {"$lt": 5}})), None)
        .unwrap();
    let s_sub = project.detect_schema(false, Some(&subset)).unwrap();
    let s_all = project.detect_schema(false, None).unwrap();
    assert_ne!(s_sub, s_all);
    assert_eq!(s_sub.get("a").unwrap().len(), 5);
}

// ============================================================================
// Custom job factories
// ============================================================================

/// A factory that pre-seeds every opened job's handle, standing in for
/// integrators that customize job construction.
struct CountingFactory {
    inner: DefaultJobFactory,
    opened: std::sync::atomic::AtomicUsize,
}

impl JobFactory for CountingFactory {
    fn open_job(&self, project: &Project, statepoint: &Value) -> Result<Job, StoreError> {
        self.opened
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.inner.open_job(project, statepoint)
    }
}

#[test]
fn test_injected_job_factory() {
    let dir = tempdir().unwrap();
    let factory = Arc::new(CountingFactory {
        inner: DefaultJobFactory,
        opened: std::sync::atomic::AtomicUsize::new(0),
    });
    let project = Project::init("test", dir.path(), None)
        .unwrap()
        .with_job_factory(factory.clone());
    project.open_job(&json!({"a": 0})).unwrap().init().unwrap();
    project.open_job(&json!({"a": 1})).unwrap();
    assert_eq!(factory.opened.load(std::sync::atomic::Ordering::Relaxed), 2);
}
