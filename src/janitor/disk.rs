//! Disk-pressure eviction.
//!
//! Lazily cloned corpora grow without bound, so when free space falls under
//! the configured target the janitor evicts the least recently used
//! repositories until enough bytes are freed. Evicted repositories are
//! recloned on demand by the fetch path.

use std::io;
use std::path::Path;
use std::time::SystemTime;

use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::gitdir::{GitDir, RepoName};
use crate::metrics::Metrics;
use crate::repofs::{Fs, dir_size, repo_mod_time};
use crate::store::{CloneStatus, RepoStore};

const GIB: f64 = (1024 * 1024 * 1024) as f64;

/// Disk size and free-space probes, separated out for testing.
pub trait DiskSizer {
    fn bytes_free(&self, mount_point: &Path) -> io::Result<u64>;
    fn disk_size(&self, mount_point: &Path) -> io::Result<u64>;
}

/// statvfs-backed probe of the real filesystem.
#[derive(Clone, Copy, Debug, Default)]
pub struct StatDiskSizer;

impl DiskSizer for StatDiskSizer {
    fn bytes_free(&self, mount_point: &Path) -> io::Result<u64> {
        let stat = nix::sys::statvfs::statvfs(mount_point)
            .map_err(|errno| io::Error::from_raw_os_error(errno as i32))?;
        Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
    }

    fn disk_size(&self, mount_point: &Path) -> io::Result<u64> {
        let stat = nix::sys::statvfs::statvfs(mount_point)
            .map_err(|errno| io::Error::from_raw_os_error(errno as i32))?;
        Ok(stat.blocks() as u64 * stat.fragment_size() as u64)
    }
}

/// How many bytes must be freed to reach `desired_percent_free`.
pub fn bytes_to_free(
    sizer: &dyn DiskSizer,
    mount_point: &Path,
    desired_percent_free: u8,
) -> io::Result<u64> {
    let free = sizer.bytes_free(mount_point)?;
    let total = sizer.disk_size(mount_point)?;

    let desired = (f64::from(desired_percent_free) / 100.0 * total as f64) as u64;
    let to_free = desired.saturating_sub(free);

    debug!(
        desired_percent_free,
        actual_percent_free = free as f64 / total as f64 * 100.0,
        to_free_gib = to_free as f64 / GIB,
        "disk pressure check"
    );

    Ok(to_free)
}

/// Removes repositories from least to most recently used until `target`
/// bytes are freed.
pub fn free_up_space(
    fs: &dyn Fs,
    store: &dyn RepoStore,
    metrics: &Metrics,
    token: &CancelToken,
    shard_id: &str,
    target: u64,
) -> io::Result<()> {
    if target == 0 {
        return Ok(());
    }

    let mut repos: Vec<(RepoName, GitDir, SystemTime)> = Vec::new();
    fs.for_each_repo(&mut |name, dir| {
        match repo_mod_time(dir) {
            Ok(mod_time) => repos.push((name.clone(), dir.clone(), mod_time)),
            Err(err) => {
                debug!(repo = %name, error = %err, "cannot stat repository, skipping eviction");
            }
        }
        false
    })?;

    repos.sort_by_key(|(_, _, mod_time)| *mod_time);

    let mut freed = 0u64;
    for (name, dir, mod_time) in repos {
        if freed >= target {
            return Ok(());
        }
        if token.is_cancelled() {
            warn!("eviction interrupted by shutdown");
            return Ok(());
        }

        let delta = dir_size(dir.path());
        fs.remove_repo(&name)?;
        if let Err(err) = store.set_clone_status(&name, CloneStatus::NotCloned, shard_id) {
            warn!(repo = %name, error = %err, "failed to reset clone status after eviction");
        }
        freed += delta;
        metrics.repo_removed_disk_pressure();

        warn!(
            repo = %name,
            age_secs = SystemTime::now()
                .duration_since(mod_time)
                .unwrap_or_default()
                .as_secs(),
            freed_gib = freed as f64 / GIB,
            target_gib = target as f64 / GIB,
            "removed least recently used repository"
        );
    }

    if freed < target {
        return Err(io::Error::other(format!(
            "only freed {freed} bytes, wanted to free {target}"
        )));
    }
    Ok(())
}
