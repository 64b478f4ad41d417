//! The linked-view builder: a human-navigable symlink tree over a job
//! subset, organized by discriminating parameter keys.
//!
//! Each selected job gets exactly one `job` leaf pointing at its
//! workspace. Leaf paths are minimal-depth and collision-free:
//!
//! 1. the discriminating key-paths are the non-constant flattened paths
//!    over the subset, plus any additional observed path needed to split
//!    jobs whose paths would otherwise collide
//! 2. path levels follow first-seen order; each level joins the key-path
//!    segments and the job's value with `_` (e.g. `d_c_foo`)
//! 3. jobs lacking a discriminating path omit that level, branching into
//!    an irregular tree rather than failing
//!
//! Rebuilding against a changed subset is an idempotent reconciliation:
//! obsolete leaves are pruned (with their emptied parent chains), valid
//! links are left untouched, stale links are re-targeted, and new leaves
//! are added.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde_json::Value;
use walkdir::WalkDir;

use jobspace_doc::JobId;
use jobspace_query::{flatten, KeyPath, TypedValue};

use crate::StoreError;

/// The name of every leaf link.
const LEAF: &str = "job";

/// Compute the leaf path for every job in the subset, relative to the
/// view prefix. The result maps each relative leaf path to the job's
/// workspace directory; it is a bijection over the subset.
pub(crate) fn build_links(
    subset: &[(JobId, Value)],
    workspace: &Path,
) -> BTreeMap<PathBuf, PathBuf> {
    let mut first_seen: Vec<KeyPath> = Vec::new();
    let mut observed: HashMap<KeyPath, std::collections::BTreeSet<TypedValue>> = HashMap::new();
    let mut flat_jobs: Vec<(&JobId, BTreeMap<KeyPath, TypedValue>)> = Vec::new();

    for (id, statepoint) in subset {
        let mut flat = BTreeMap::new();
        for (path, value) in flatten(statepoint) {
            let Some(typed) = TypedValue::of(value) else {
                continue;
            };
            if !observed.contains_key(&path) {
                first_seen.push(path.clone());
            }
            observed.entry(path.clone()).or_default().insert(typed.clone());
            flat.insert(path, typed);
        }
        flat_jobs.push((id, flat));
    }

    // Start from the non-constant paths, then widen until no two jobs
    // share a leaf path. Jobs with distinct ids have distinct documents,
    // so some observed path always splits a colliding group.
    let mut discriminating: Vec<KeyPath> = first_seen
        .iter()
        .filter(|path| observed[*path].len() > 1)
        .cloned()
        .collect();

    loop {
        let mut by_path: BTreeMap<PathBuf, Vec<usize>> = BTreeMap::new();
        for (index, (_, flat)) in flat_jobs.iter().enumerate() {
            by_path
                .entry(leaf_path(flat, &discriminating))
                .or_default()
                .push(index);
        }
        let colliding: Vec<&Vec<usize>> =
            by_path.values().filter(|group| group.len() > 1).collect();

        let split = if colliding.is_empty() {
            None
        } else {
            first_seen.iter().find(|candidate| {
                !discriminating.contains(*candidate)
                    && colliding
                        .iter()
                        .any(|group| splits(candidate, group, &flat_jobs))
            })
        };
        let Some(split) = split.cloned() else {
            // No collisions left (or, defensively, no path splits one —
            // impossible for distinct ids): emit one link per leaf path.
            let mut links = BTreeMap::new();
            for (path, group) in &by_path {
                let (id, _) = &flat_jobs[group[0]];
                links.insert(path.clone(), workspace.join(id));
            }
            return links;
        };
        // Widen the discriminating set, keeping first-seen order.
        let widened: Vec<KeyPath> = first_seen
            .iter()
            .filter(|path| discriminating.contains(*path) || **path == split)
            .cloned()
            .collect();
        discriminating = widened;
    }
}

/// Whether `candidate` distinguishes (by value or by presence) at least
/// two jobs of `group`.
fn splits(
    candidate: &KeyPath,
    group: &[usize],
    flat_jobs: &[(&JobId, BTreeMap<KeyPath, TypedValue>)],
) -> bool {
    let first = flat_jobs[group[0]].1.get(candidate);
    group[1..]
        .iter()
        .any(|&index| flat_jobs[index].1.get(candidate) != first)
}

fn leaf_path(flat: &BTreeMap<KeyPath, TypedValue>, discriminating: &[KeyPath]) -> PathBuf {
    let mut path = PathBuf::new();
    for key_path in discriminating {
        if let Some(value) = flat.get(key_path) {
            path.push(format!("{}_{}", key_path.join("_"), value.label()));
        }
    }
    path.push(LEAF);
    path
}

/// Bring the tree under `prefix` in line with `links`.
pub(crate) fn update_view(
    prefix: &Path,
    links: &BTreeMap<PathBuf, PathBuf>,
) -> Result<(), StoreError> {
    let existing = find_leaves(prefix);

    let obsolete: Vec<&PathBuf> = existing
        .keys()
        .filter(|path| !links.contains_key(*path))
        .collect();
    let stale: Vec<&PathBuf> = links
        .keys()
        .filter(|path| {
            existing
                .get(*path)
                .is_some_and(|target| target != &links[*path])
        })
        .collect();
    let new: Vec<&PathBuf> = links
        .keys()
        .filter(|path| !existing.contains_key(*path))
        .collect();

    if obsolete.is_empty() && stale.is_empty() && new.is_empty() {
        tracing::info!(prefix = %prefix.display(), "view is up to date");
        return Ok(());
    }
    tracing::info!(
        prefix = %prefix.display(),
        obsolete = obsolete.len(),
        stale = stale.len(),
        new = new.len(),
        "updating linked view"
    );

    for path in &obsolete {
        let absolute = prefix.join(path);
        std::fs::remove_file(&absolute).map_err(StoreError::workspace(&absolute))?;
        prune_empty_parents(prefix, path);
    }
    for path in &stale {
        let absolute = prefix.join(path);
        std::fs::remove_file(&absolute).map_err(StoreError::workspace(&absolute))?;
    }
    for path in stale.into_iter().chain(new) {
        let absolute = prefix.join(path);
        if let Some(parent) = absolute.parent() {
            std::fs::create_dir_all(parent).map_err(StoreError::workspace(parent))?;
        }
        make_link(&links[path], &absolute)?;
    }
    Ok(())
}

/// Existing `job` leaves under `prefix`, with their targets.
fn find_leaves(prefix: &Path) -> BTreeMap<PathBuf, PathBuf> {
    let mut leaves = BTreeMap::new();
    for entry in WalkDir::new(prefix).follow_links(false).into_iter().flatten() {
        if entry.file_name() != LEAF || !entry.path_is_symlink() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(prefix) else {
            continue;
        };
        if let Ok(target) = std::fs::read_link(entry.path()) {
            leaves.insert(relative.to_path_buf(), target);
        }
    }
    leaves
}

/// Remove the emptied directory chain above a pruned leaf, stopping at
/// the first non-empty ancestor (or the prefix itself).
fn prune_empty_parents(prefix: &Path, leaf: &Path) {
    let mut parent = leaf.parent();
    while let Some(relative) = parent {
        if relative.as_os_str().is_empty() {
            break;
        }
        if std::fs::remove_dir(prefix.join(relative)).is_err() {
            break;
        }
        parent = relative.parent();
    }
}

#[cfg(unix)]
fn make_link(target: &Path, link: &Path) -> Result<(), StoreError> {
    std::os::unix::fs::symlink(target, link).map_err(StoreError::workspace(link))
}

#[cfg(not(unix))]
fn make_link(target: &Path, link: &Path) -> Result<(), StoreError> {
    std::os::windows::fs::symlink_dir(target, link).map_err(StoreError::workspace(link))
}
