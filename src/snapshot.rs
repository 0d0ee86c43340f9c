//! Snapshot discovery.
//!
//! A snapshot is a directory under the storage root that holds an engine
//! metadata marker and an environment directory. The newest one is what a
//! run resumes from when the operator does not name an origin.

use std::cmp::Ordering;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::debug;

/// Engine state directory inside a snapshot.
pub const ENGINE_SUBDIR: &str = "reverie";
/// Marker file inside [`ENGINE_SUBDIR`].
pub const META_FILE: &str = "meta.json";
/// Environment directory sibling to [`ENGINE_SUBDIR`].
pub const ENVIRONMENT_SUBDIR: &str = "environment";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotCandidate {
    pub name: String,
    pub path: PathBuf,
    pub modified: SystemTime,
}

/// Returns true when `dir` has both the metadata marker and the environment
/// directory.
pub fn is_valid_snapshot(dir: &Path) -> bool {
    dir.join(ENGINE_SUBDIR).join(META_FILE).exists() && dir.join(ENVIRONMENT_SUBDIR).is_dir()
}

/// List the valid snapshots directly under `storage`. Entries whose
/// metadata can't be read are skipped.
pub fn scan(storage: &Path) -> io::Result<Vec<SnapshotCandidate>> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(storage)? {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                debug!(error = %e, "skipping unreadable storage entry");
                continue;
            }
        };
        let path = entry.path();
        if !path.is_dir() || !is_valid_snapshot(&path) {
            continue;
        }
        let modified = match std::fs::metadata(&path).and_then(|m| m.modified()) {
            Ok(t) => t,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "skipping snapshot without mtime");
                continue;
            }
        };
        let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_owned) else {
            debug!(path = %path.display(), "skipping snapshot with non-UTF-8 name");
            continue;
        };
        out.push(SnapshotCandidate {
            name,
            path,
            modified,
        });
    }
    Ok(out)
}

/// Newest candidate by modification time. On equal times the
/// lexicographically smallest name wins.
pub fn pick_latest(candidates: &[SnapshotCandidate]) -> Option<&SnapshotCandidate> {
    candidates.iter().max_by(|a, b| newer(a, b))
}

fn newer(a: &SnapshotCandidate, b: &SnapshotCandidate) -> Ordering {
    a.modified
        .cmp(&b.modified)
        .then_with(|| b.name.cmp(&a.name))
}

/// Name of the most recently modified valid snapshot in `storage`, or `None`
/// when there isn't one. The caller decides whether that is fatal.
pub fn resolve_latest(storage: &Path) -> io::Result<Option<String>> {
    let candidates = scan(storage)?;
    debug!(count = candidates.len(), "valid snapshots found");
    Ok(pick_latest(&candidates).map(|c| {
        debug!(name = %c.name, path = %c.path.display(), "newest snapshot");
        c.name.clone()
    }))
}
