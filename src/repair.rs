//! Pre-optimization repository repair.
//!
//! Idempotent, best-effort fixups that must succeed (or safely no-op)
//! before any optimization can proceed: the canonical `info/attributes`
//! file, `gc.auto` ownership, stale lock reaping, and temporary packfiles
//! left behind by interrupted fetches. Individual failures are collected
//! rather than short-circuiting, so one stuck lock never shields the rest.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tracing::{debug, warn};

use crate::backend::{BackendError, GitBackend};
use crate::cancel::CancelToken;
use crate::error::Transience;
use crate::gitdir::GitDir;

/// Canonical contents of `info/attributes`, overriding whatever the
/// repository has checked in.
pub const CANONICAL_GIT_ATTRIBUTES: &str = "\
# Managed by gitmaintd; local edits are overwritten.

# Every file must be present in git archive output.
.* !export-ignore
";

// Per-lock-type age bounds. git does not clean up lock files left behind by
// interrupted commands, it just fails on them. Each bound is conservative
// for how long the lock is legitimately held.

/// config.lock is held only while rewriting the config file.
const CONFIG_LOCK_MAX_AGE: Duration = Duration::from_secs(60);
/// packed-refs can be locked across a full reference repack.
const PACKED_REFS_LOCK_MAX_AGE: Duration = Duration::from_secs(60 * 60);
const REF_LOCK_MAX_AGE: Duration = Duration::from_secs(60 * 60);
/// A commit-graph write on a 5GB repository takes under a minute; the lock
/// is held for a fraction of that.
const COMMIT_GRAPH_LOCK_MAX_AGE: Duration = Duration::from_secs(60 * 60);
const MULTI_PACK_INDEX_LOCK_MAX_AGE: Duration = Duration::from_secs(60 * 60);
/// Twice the bound git gc uses internally for its own pid file.
const GC_PID_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RepairError {
    #[error("writing git attributes: {0}")]
    Attributes(#[source] io::Error),

    #[error("unsetting gc.auto: {0}")]
    AutoGc(#[source] BackendError),

    #[error("removing stale lock {path}: {source}")]
    RemoveLock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("walking refs for stale locks: {0}")]
    RefsWalk(#[source] io::Error),

    #[error("removing stale temporary packfile {path}: {source}")]
    RemoveTmpPack {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{} repair steps failed; first: {}", .0.len(), .0.first().map(|e| e.to_string()).unwrap_or_default())]
    Aggregate(Vec<RepairError>),
}

impl RepairError {
    pub fn transience(&self) -> Transience {
        Transience::Retryable
    }

    fn aggregate(mut failures: Vec<RepairError>) -> Result<(), RepairError> {
        match failures.len() {
            0 => Ok(()),
            1 => Err(failures.remove(0)),
            _ => Err(RepairError::Aggregate(failures)),
        }
    }
}

/// Runs all repair steps, continuing past individual failures and returning
/// them in aggregate.
pub fn repair_repo(
    backend: &dyn GitBackend,
    dir: &GitDir,
    token: &CancelToken,
    long_command_timeout: Duration,
) -> Result<(), RepairError> {
    let mut failures = Vec::new();

    if let Err(err) = ensure_git_attributes(dir) {
        failures.push(err);
    }

    // This daemon owns the auto-GC decision; a concurrent git gc racing a
    // repack can corrupt the repository.
    if let Err(err) = backend.config().unset(token, "gc.auto") {
        failures.push(RepairError::AutoGc(err));
    }

    if let Err(err) = remove_stale_locks(dir) {
        failures.push(err);
    }

    if let Err(err) = remove_stale_tmp_packs(dir, long_command_timeout.saturating_mul(2)) {
        failures.push(err);
    }

    RepairError::aggregate(failures)
}

/// Writes the canonical `info/attributes` file, skipping the write when the
/// contents already match so repeated passes don't churn mtimes.
pub fn ensure_git_attributes(dir: &GitDir) -> Result<(), RepairError> {
    let info_dir = dir.info_dir();
    fs::create_dir_all(&info_dir).map_err(RepairError::Attributes)?;

    let path = info_dir.join("attributes");
    if let Ok(existing) = fs::read(&path)
        && existing == CANONICAL_GIT_ATTRIBUTES.as_bytes()
    {
        return Ok(());
    }

    fs::write(&path, CANONICAL_GIT_ATTRIBUTES).map_err(RepairError::Attributes)
}

/// Reaps lock files whose age exceeds the conservative bound for their
/// type. A lock younger than its bound is never touched.
pub fn remove_stale_locks(dir: &GitDir) -> Result<(), RepairError> {
    let mut failures = Vec::new();

    let mut reap = |path: PathBuf, max_age: Duration| -> bool {
        match remove_file_older_than(&path, max_age) {
            Ok(found_stale) => found_stale,
            Err(source) => {
                failures.push(RepairError::RemoveLock { path, source });
                false
            }
        }
    };

    reap(dir.join("config.lock"), CONFIG_LOCK_MAX_AGE);
    reap(dir.join("packed-refs.lock"), PACKED_REFS_LOCK_MAX_AGE);
    reap(
        dir.objects_info_dir().join("commit-graph.lock"),
        COMMIT_GRAPH_LOCK_MAX_AGE,
    );
    reap(
        dir.pack_dir().join("multi-pack-index.lock"),
        MULTI_PACK_INDEX_LOCK_MAX_AGE,
    );

    // gc.pid is written by git gc itself. Finding a stale one means garbage
    // collection died without cleaning up, which warrants attention beyond
    // routine lock contention.
    if reap(dir.join("gc.pid"), GC_PID_MAX_AGE) {
        warn!(
            dir = %dir,
            "removed a stale gc.pid lock; garbage collection did not shut down cleanly, \
             monitor the repository for corruption"
        );
    }

    if let Err(err) = for_each_ref_lock(&dir.refs_dir(), &mut |path| {
        if let Err(source) = remove_file_older_than(&path, REF_LOCK_MAX_AGE) {
            failures.push(RepairError::RemoveLock { path, source });
        }
    }) {
        failures.push(RepairError::RefsWalk(err));
    }

    RepairError::aggregate(failures)
}

fn for_each_ref_lock(
    refs_dir: &Path,
    reap: &mut dyn FnMut(PathBuf),
) -> Result<(), io::Error> {
    let mut pending = vec![refs_dir.to_path_buf()];
    while let Some(path) = pending.pop() {
        let entries = match fs::read_dir(&path) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err),
        };
        for entry in entries {
            let entry = entry?;
            let file_type = match entry.file_type() {
                Ok(file_type) => file_type,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err),
            };
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if entry.file_name().as_encoded_bytes().ends_with(b".lock") {
                reap(entry.path());
            }
        }
    }
    Ok(())
}

/// Sweeps `objects/pack/tmp_pack_*` files older than `max_age` — leftovers
/// from fetches that were interrupted mid-transfer.
pub fn remove_stale_tmp_packs(dir: &GitDir, max_age: Duration) -> Result<(), RepairError> {
    let mut failures = Vec::new();

    let entries = match fs::read_dir(dir.pack_dir()) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => {
            return Err(RepairError::RemoveTmpPack {
                path: dir.pack_dir(),
                source: err,
            });
        }
    };

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(source) => {
                failures.push(RepairError::RemoveTmpPack {
                    path: dir.pack_dir(),
                    source,
                });
                continue;
            }
        };
        if !entry.file_name().as_encoded_bytes().starts_with(b"tmp_pack_") {
            continue;
        }
        if let Err(source) = remove_file_older_than(&entry.path(), max_age) {
            failures.push(RepairError::RemoveTmpPack {
                path: entry.path(),
                source,
            });
        }
    }

    RepairError::aggregate(failures)
}

/// Removes `path` if its mtime is older than `max_age`. A missing file is
/// not an error. Returns whether a stale file was found.
fn remove_file_older_than(path: &Path, max_age: Duration) -> Result<bool, io::Error> {
    let metadata = match fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err),
    };

    let age = SystemTime::now()
        .duration_since(metadata.modified()?)
        .unwrap_or(Duration::ZERO);
    if age < max_age {
        return Ok(false);
    }

    debug!(path = %path.display(), ?age, "removing stale lock file");
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(true),
        Err(err) => Err(err),
    }
}
