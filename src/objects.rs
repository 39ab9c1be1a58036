//! Objects maintenance executor.
//!
//! Translates a planner decision into calls against the git backend.

use std::time::SystemTime;

use thiserror::Error;

use crate::backend::{BackendError, GitBackend, RepackOptions};
use crate::cancel::CancelToken;
use crate::error::Transience;
use crate::gitdir::GitDir;
use crate::plan::{RepackObjectsConfig, RepackStrategy};
use crate::stats::{self, StatsError};

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum MaintainError {
    /// A caller bug, not a data error: conflicting repack flags are never
    /// silently corrected.
    #[error("invalid repack configuration: {0}")]
    InvalidRepackConfig(&'static str),

    #[error("updating full-repack timestamp: {0}")]
    Timestamp(#[source] StatsError),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl MaintainError {
    pub fn transience(&self) -> Transience {
        match self {
            MaintainError::InvalidRepackConfig(_) => Transience::Permanent,
            MaintainError::Timestamp(_) => Transience::Unknown,
            MaintainError::Backend(err) => err.transience(),
        }
    }
}

/// Rejects conflicting repack configurations.
///
/// Incremental repacks leave existing packfiles alone, so asking for a
/// bitmap or multi-pack-index (which describe the full pack set) makes no
/// sense; cruft expiry only exists for full repacks with cruft packs.
pub fn validate_repacking(config: &RepackObjectsConfig) -> Result<(), MaintainError> {
    if config.strategy == RepackStrategy::IncrementalWithUnreachable {
        if config.write_bitmap {
            return Err(MaintainError::InvalidRepackConfig(
                "cannot write bitmap for an incremental repack",
            ));
        }
        if config.write_multi_pack_index {
            return Err(MaintainError::InvalidRepackConfig(
                "cannot write multi-pack-index for an incremental repack",
            ));
        }
    }

    if config.strategy != RepackStrategy::FullWithCruft && config.cruft_expire_before.is_some() {
        return Err(MaintainError::InvalidRepackConfig(
            "cruft expiry is only valid for a full repack with cruft packs",
        ));
    }

    Ok(())
}

/// Repacks a repository's objects according to `config`.
pub fn repack_objects(
    backend: &dyn GitBackend,
    dir: &GitDir,
    token: &CancelToken,
    config: &RepackObjectsConfig,
) -> Result<(), MaintainError> {
    validate_repacking(config)?;

    match config.strategy {
        RepackStrategy::FullWithCruft => {
            // Record the attempt before running it. A huge repository whose
            // full repack keeps failing must still observe the cooldown, or
            // every pass would redo the most expensive operation we have.
            stats::update_full_repack_timestamp(dir, SystemTime::now())
                .map_err(MaintainError::Timestamp)?;

            backend.maintenance().repack(
                token,
                RepackOptions {
                    cruft: true,
                    cruft_expiration: config.cruft_expire_before,
                    delete_loose: true,
                    local: true,
                    geometric: false,
                    write_multi_pack_index: config.write_multi_pack_index,
                    write_bitmap: config.write_bitmap,
                },
            )?;
        }
        RepackStrategy::IncrementalWithUnreachable => {
            // Two backend calls: no single git repack mode packs all loose
            // objects regardless of reachability without a graph walk.
            backend.maintenance().pack_objects(token)?;
            backend.maintenance().prune_packed(token)?;
        }
        RepackStrategy::Geometric => {
            backend.maintenance().repack(
                token,
                RepackOptions {
                    cruft: false,
                    cruft_expiration: None,
                    delete_loose: true,
                    local: true,
                    geometric: true,
                    write_multi_pack_index: config.write_multi_pack_index,
                    write_bitmap: config.write_bitmap,
                },
            )?;
        }
    }

    Ok(())
}

/// Prunes unreachable loose objects older than `expire_before`.
pub fn prune_objects(
    backend: &dyn GitBackend,
    token: &CancelToken,
    expire_before: SystemTime,
) -> Result<(), MaintainError> {
    backend
        .maintenance()
        .prune_objects(token, expire_before)?;
    Ok(())
}
