//! Small filesystem helpers shared across the storage layer.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use sha2::{Digest, Sha256};

use crate::StoreError;

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Write `bytes` to `path` through a uniquely-named temp file in the same
/// directory, then rename over the target. Concurrent writers of identical
/// content are safe: rename within one filesystem is atomic.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("file");
    let tmp = path.with_file_name(format!(
        ".{}_{}_{file_name}~",
        std::process::id(),
        TMP_COUNTER.fetch_add(1, Ordering::Relaxed),
    ));
    std::fs::write(&tmp, bytes).map_err(StoreError::workspace(&tmp))?;
    if let Err(err) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(StoreError::Workspace {
            path: path.to_path_buf(),
            source: err,
        });
    }
    Ok(())
}

/// Recursively copy a directory tree. Symlinks are followed (job
/// workspaces hold regular files).
pub(crate) fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<(), StoreError> {
    std::fs::create_dir_all(dst).map_err(StoreError::workspace(dst))?;
    for entry in std::fs::read_dir(src).map_err(StoreError::workspace(src))? {
        let entry = entry.map_err(StoreError::workspace(src))?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let file_type = entry.file_type().map_err(StoreError::workspace(&from))?;
        if file_type.is_dir() {
            copy_dir_recursive(&from, &to)?;
        } else {
            std::fs::copy(&from, &to).map_err(StoreError::workspace(&from))?;
        }
    }
    Ok(())
}

/// Lowercase hex SHA-256 of arbitrary bytes.
pub(crate) fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
