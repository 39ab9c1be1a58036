//! Repository statistics derived from Git's on-disk formats.
//!
//! Everything in here is read-only: the readers parse loose-object shards,
//! packfile directories, bitmap/multi-pack-index headers and commit-graph
//! chains straight off disk, without invoking git. Files that vanish while a
//! scan is in flight are expected (live git processes repack concurrently)
//! and are skipped, never reported as errors.

mod bitmap;
mod commit_graph;
mod loose_objects;
mod midx;
mod packfiles;
mod references;

pub use bitmap::{BitmapInfo, bitmap_info};
pub use commit_graph::{CommitGraphInfo, commit_graph_info};
pub use loose_objects::{LooseObjectsInfo, is_valid_loose_object_name, loose_objects_info};
pub use midx::{MultiPackIndexInfo, multi_pack_index_info};
pub use packfiles::{
    FULL_REPACK_TIMESTAMP_FILENAME, PackfilesInfo, full_repack_timestamp, packfiles_info,
    update_full_repack_timestamp,
};
pub use references::{ReferencesInfo, references_info};

use std::io;
use std::time::{Duration, SystemTime};

use thiserror::Error;

use crate::error::Transience;
use crate::gitdir::GitDir;

/// Loose objects younger than this are never considered stale, and pruning
/// passes the same grace window on to the backend so that concurrently
/// written objects survive.
pub const STALE_OBJECTS_GRACE_PERIOD: Duration = Duration::from_secs(10 * 24 * 60 * 60);

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum StatsError {
    #[error("counting loose objects: {0}")]
    LooseObjects(#[source] io::Error),

    #[error("inspecting packfiles: {0}")]
    Packfiles(#[source] io::Error),

    #[error("opening bitmap: {0}")]
    BitmapOpen(#[source] io::Error),

    #[error("reading bitmap header: {0}")]
    BitmapHeader(#[source] io::Error),

    #[error("invalid bitmap signature: {0:?}")]
    BitmapSignature(String),

    #[error("unsupported bitmap version: {0}")]
    BitmapVersion(u16),

    #[error("opening multi-pack-index: {0}")]
    MidxOpen(#[source] io::Error),

    #[error("reading multi-pack-index header: {0}")]
    MidxHeader(#[source] io::Error),

    #[error("invalid multi-pack-index signature: {0:?}")]
    MidxSignature(String),

    #[error("invalid multi-pack-index version: {0}")]
    MidxVersion(u8),

    #[error("unsupported number of multi-pack-index base files: {0}")]
    MidxBaseFiles(u8),

    #[error("reading commit-graph chain: {0}")]
    CommitGraphChain(#[source] io::Error),

    #[error("opening commit-graph: {0}")]
    CommitGraphOpen(#[source] io::Error),

    #[error("reading commit-graph header: {0}")]
    CommitGraphHeader(#[source] io::Error),

    #[error("invalid commit-graph signature: {0:?}")]
    CommitGraphSignature(String),

    #[error("unsupported commit-graph version: {0}")]
    CommitGraphVersion(u8),

    #[error("reading commit-graph chunk table: {0}")]
    CommitGraphChunkTable(#[source] io::Error),

    #[error("counting references: {0}")]
    References(#[source] io::Error),

    #[error("reading full-repack timestamp: {0}")]
    RepackTimestampRead(#[source] io::Error),

    #[error("updating full-repack timestamp: {0}")]
    RepackTimestampWrite(#[source] io::Error),
}

impl StatsError {
    /// Malformed on-disk data won't fix itself, but a later maintenance pass
    /// may well rewrite the offending file, so a retry on the next cycle can
    /// succeed.
    pub fn transience(&self) -> Transience {
        Transience::Unknown
    }
}

/// Point-in-time snapshot of one repository's on-disk state.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RepositoryInfo {
    pub loose_objects: LooseObjectsInfo,
    pub packfiles: PackfilesInfo,
    pub references: ReferencesInfo,
    pub commit_graph: CommitGraphInfo,
}

/// Collects the full statistics snapshot for one repository.
///
/// Fails fast on the first reader error; callers that want best-effort
/// behavior must catch the specific sub-errors themselves.
pub fn repository_info(dir: &GitDir, now: SystemTime) -> Result<RepositoryInfo, StatsError> {
    let cutoff = now
        .checked_sub(STALE_OBJECTS_GRACE_PERIOD)
        .unwrap_or(SystemTime::UNIX_EPOCH);

    Ok(RepositoryInfo {
        loose_objects: loose_objects_info(dir, cutoff)?,
        packfiles: packfiles_info(dir)?,
        references: references_info(dir)?,
        commit_graph: commit_graph_info(dir)?,
    })
}
