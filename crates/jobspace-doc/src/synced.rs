//! A JSON mapping synchronized with a backing file.
//!
//! Every read loads from the backing store first and every mutation saves
//! afterward, so two handles on the same file always observe each other's
//! flushed state. When the document's [`BufferPool`] is active, loads and
//! saves go through the pool instead and disk writes are deferred to the
//! end of the buffered scope.
//!
//! Nested values are addressed through [`NestedMut`], an observed container
//! holding the root document and a key path from it: its mutators locate
//! the node by path, mutate through the root, then trigger the root's
//! persistence. Saves are atomic (unique temp file, then rename).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::buffer::BufferPool;
use crate::DocumentError;

/// A mapping whose content lives in a backing JSON file.
pub struct SyncedDocument {
    path: PathBuf,
    data: Map<String, Value>,
    buffer: Option<Arc<BufferPool>>,
}

impl SyncedDocument {
    /// Bind a document to a backing file. No I/O happens until first use.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            data: Map::new(),
            buffer: None,
        }
    }

    /// Bind a document that participates in buffered scopes of `pool`.
    pub fn with_buffer(path: impl Into<PathBuf>, pool: Arc<BufferPool>) -> Self {
        Self {
            path: path.into(),
            data: Map::new(),
            buffer: Some(pool),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the backing content. A missing file is an empty document;
    /// unparsable content is a corruption error.
    pub fn load(&mut self) -> Result<(), DocumentError> {
        let path = self.path.clone();
        if let Some(pool) = self.buffer.as_ref().filter(|p| p.is_active()) {
            self.data = pool.load_buffered(&path, || read_map(&path))?;
        } else {
            self.data = read_map(&path)?;
        }
        Ok(())
    }

    /// Persist the current content, or stage it when buffering is active.
    pub fn save(&self) -> Result<(), DocumentError> {
        if let Some(pool) = self.buffer.as_ref().filter(|p| p.is_active()) {
            pool.stage(&self.path, self.data.clone());
            return Ok(());
        }
        tracing::debug!(path = %self.path.display(), "storing document");
        write_atomic(&self.path, &self.data)
    }

    pub fn get(&mut self, key: &str) -> Result<Option<Value>, DocumentError> {
        self.load()?;
        Ok(self.data.get(key).cloned())
    }

    pub fn insert(
        &mut self,
        key: impl Into<String>,
        value: Value,
    ) -> Result<Option<Value>, DocumentError> {
        self.load()?;
        let previous = self.data.insert(key.into(), value);
        self.save()?;
        Ok(previous)
    }

    pub fn remove(&mut self, key: &str) -> Result<Option<Value>, DocumentError> {
        self.load()?;
        let previous = self.data.remove(key);
        self.save()?;
        Ok(previous)
    }

    /// Merge `mapping` into the document, key by key.
    pub fn update(&mut self, mapping: Map<String, Value>) -> Result<(), DocumentError> {
        self.load()?;
        for (key, value) in mapping {
            self.data.insert(key, value);
        }
        self.save()
    }

    pub fn clear(&mut self) -> Result<(), DocumentError> {
        self.data.clear();
        self.save()
    }

    /// Wholesale replacement of the document content.
    pub fn replace(&mut self, mapping: Map<String, Value>) -> Result<(), DocumentError> {
        self.data = mapping;
        self.save()
    }

    pub fn len(&mut self) -> Result<usize, DocumentError> {
        self.load()?;
        Ok(self.data.len())
    }

    pub fn is_empty(&mut self) -> Result<bool, DocumentError> {
        Ok(self.len()? == 0)
    }

    pub fn contains_key(&mut self, key: &str) -> Result<bool, DocumentError> {
        self.load()?;
        Ok(self.data.contains_key(key))
    }

    pub fn keys(&mut self) -> Result<Vec<String>, DocumentError> {
        self.load()?;
        Ok(self.data.keys().cloned().collect())
    }

    pub fn values(&mut self) -> Result<Vec<Value>, DocumentError> {
        self.load()?;
        Ok(self.data.values().cloned().collect())
    }

    /// A snapshot of the resolved content.
    pub fn to_map(&mut self) -> Result<Map<String, Value>, DocumentError> {
        self.load()?;
        Ok(self.data.clone())
    }

    pub fn to_value(&mut self) -> Result<Value, DocumentError> {
        Ok(Value::Object(self.to_map()?))
    }

    /// Equality by resolved content, not handle identity.
    pub fn content_eq(&mut self, other: &mut SyncedDocument) -> Result<bool, DocumentError> {
        self.load()?;
        other.load()?;
        Ok(self.data == other.data)
    }

    /// Address a nested value by dotted key path.
    pub fn nested<'a>(&'a mut self, path: &str) -> NestedMut<'a> {
        NestedMut {
            doc: self,
            path: path.split('.').map(str::to_owned).collect(),
        }
    }
}

/// An observed container: a nested node addressed by a key path from its
/// root document. Mutators delegate to the root's storage and trigger the
/// root's persistence.
pub struct NestedMut<'a> {
    doc: &'a mut SyncedDocument,
    path: Vec<String>,
}

impl NestedMut<'_> {
    /// The value at this path, if present.
    pub fn get(&mut self) -> Result<Option<Value>, DocumentError> {
        self.doc.load()?;
        let mut node: &Value = &Value::Null;
        let mut map = Some(&self.doc.data);
        for segment in &self.path {
            let Some(next) = map.and_then(|m| m.get(segment)) else {
                return Ok(None);
            };
            node = next;
            map = next.as_object();
        }
        Ok(Some(node.clone()))
    }

    /// Replace the value at this path, creating intermediate mappings.
    pub fn set(&mut self, value: Value) -> Result<(), DocumentError> {
        self.doc.load()?;
        let (parent, last) = navigate(&mut self.doc.data, &self.path)?;
        parent.insert(last.to_owned(), value);
        self.doc.save()
    }

    /// Insert `key` into the mapping at this path, creating it if absent.
    pub fn insert(
        &mut self,
        key: impl Into<String>,
        value: Value,
    ) -> Result<Option<Value>, DocumentError> {
        self.doc.load()?;
        let (parent, last) = navigate(&mut self.doc.data, &self.path)?;
        let node = parent
            .entry(last.to_owned())
            .or_insert_with(|| Value::Object(Map::new()));
        let Some(map) = node.as_object_mut() else {
            return Err(not_a(&self.path, "mapping"));
        };
        let previous = map.insert(key.into(), value);
        self.doc.save()?;
        Ok(previous)
    }

    /// Remove `key` from the mapping at this path.
    pub fn remove(&mut self, key: &str) -> Result<Option<Value>, DocumentError> {
        self.doc.load()?;
        let (parent, last) = navigate(&mut self.doc.data, &self.path)?;
        let previous = match parent.get_mut(last).and_then(Value::as_object_mut) {
            Some(map) => map.remove(key),
            None => None,
        };
        self.doc.save()?;
        Ok(previous)
    }

    /// Append to the sequence at this path, creating it if absent.
    pub fn push(&mut self, value: Value) -> Result<(), DocumentError> {
        self.doc.load()?;
        let (parent, last) = navigate(&mut self.doc.data, &self.path)?;
        let node = parent
            .entry(last.to_owned())
            .or_insert_with(|| Value::Array(Vec::new()));
        let Some(items) = node.as_array_mut() else {
            return Err(not_a(&self.path, "sequence"));
        };
        items.push(value);
        self.doc.save()
    }
}

/// Walk to the parent mapping of the last path segment, creating
/// intermediate mappings as needed.
fn navigate<'a>(
    data: &'a mut Map<String, Value>,
    path: &'a [String],
) -> Result<(&'a mut Map<String, Value>, &'a str), DocumentError> {
    let (last, init) = path.split_last().expect("key path is never empty");
    let mut current = data;
    for segment in init {
        let node = current
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        match node.as_object_mut() {
            Some(map) => current = map,
            None => return Err(not_a(path, "mapping")),
        }
    }
    Ok((current, last))
}

fn not_a(path: &[String], expected: &str) -> DocumentError {
    DocumentError::Unrepresentable(format!(
        "value at '{}' is not a {expected}",
        path.join(".")
    ))
}

fn read_map(path: &Path) -> Result<Map<String, Value>, DocumentError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
        Err(err) => {
            return Err(DocumentError::Io {
                path: path.to_path_buf(),
                source: err,
            })
        }
    };
    tracing::debug!(path = %path.display(), "loading document");
    serde_json::from_slice(&bytes).map_err(|err| DocumentError::Corrupted {
        path: path.to_path_buf(),
        source: err,
    })
}

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Write `data` to `path` via a uniquely-named temp file in the same
/// directory, then rename over the target. Rename within one filesystem is
/// atomic, so concurrent writers of identical content are safe.
pub(crate) fn write_atomic(path: &Path, data: &Map<String, Value>) -> Result<(), DocumentError> {
    let io_err = |source| DocumentError::Io {
        path: path.to_path_buf(),
        source,
    };
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("document");
    let tmp = path.with_file_name(format!(
        ".{}_{}_{file_name}~",
        std::process::id(),
        TMP_COUNTER.fetch_add(1, Ordering::Relaxed),
    ));
    let bytes = serde_json::to_vec(data).map_err(|err| DocumentError::Unrepresentable(
        format!("document not serializable: {err}"),
    ))?;
    std::fs::write(&tmp, bytes).map_err(io_err)?;
    if let Err(err) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(io_err(err));
    }
    Ok(())
}
