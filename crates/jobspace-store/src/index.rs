//! Workspace indexing: one state-point descriptor per job, plus one file
//! descriptor per filename-pattern match.
//!
//! Every descriptor is a JSON mapping carrying a unique `_id`. The
//! state-point descriptor additionally carries the `statepoint` field and
//! the job document's content; `_id` and `statepoint` are therefore
//! reserved and rejected in user document content.

use regex::Regex;
use serde_json::{Map, Value};
use walkdir::WalkDir;

use jobspace_query::FilterError;

use crate::{fsutil, StoreError};

/// Keys a job document may not use.
pub const RESERVED_KEYS: [&str; 2] = ["_id", "statepoint"];

/// A filename pattern paired with its format tag.
#[derive(Debug, Clone)]
pub struct FormatSpec {
    pub pattern: String,
    pub format: String,
}

impl FormatSpec {
    pub fn new(pattern: impl Into<String>, format: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            format: format.into(),
        }
    }
}

/// Build the state-point descriptor for one job.
pub(crate) fn statepoint_descriptor(
    id: &str,
    statepoint: &Value,
    document: &Map<String, Value>,
) -> Result<Value, StoreError> {
    for key in RESERVED_KEYS {
        if document.contains_key(key) {
            return Err(StoreError::ReservedKey {
                key: key.to_owned(),
            });
        }
    }
    let mut descriptor = document.clone();
    descriptor.insert("_id".to_owned(), Value::String(id.to_owned()));
    descriptor.insert("statepoint".to_owned(), statepoint.clone());
    Ok(Value::Object(descriptor))
}

/// Build one descriptor per file in the job's workspace matching the
/// pattern. Filenames are matched relative to the workspace root
/// (`<job id>/<relative path>`).
pub(crate) fn file_descriptors(
    id: &str,
    workspace_root: &std::path::Path,
    spec: &FormatSpec,
) -> Result<Vec<Value>, StoreError> {
    let pattern = Regex::new(&spec.pattern).map_err(|err| {
        StoreError::Filter(FilterError::BadRegex {
            pattern: spec.pattern.clone(),
            source: err,
        })
    })?;
    let job_dir = workspace_root.join(id);
    let mut descriptors = Vec::new();
    for entry in WalkDir::new(&job_dir).into_iter().flatten() {
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(workspace_root) else {
            continue;
        };
        let Some(filename) = relative.to_str() else {
            continue;
        };
        if !pattern.is_match(filename) {
            continue;
        }
        let mut descriptor = Map::new();
        descriptor.insert(
            "_id".to_owned(),
            Value::String(fsutil::sha256_hex(
                format!("{filename}|{}", spec.format).as_bytes(),
            )),
        );
        descriptor.insert(
            "root".to_owned(),
            Value::String(workspace_root.display().to_string()),
        );
        descriptor.insert("filename".to_owned(), Value::String(filename.to_owned()));
        descriptor.insert("format".to_owned(), Value::String(spec.format.clone()));
        descriptors.push(Value::Object(descriptor));
    }
    Ok(descriptors)
}
