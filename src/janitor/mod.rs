//! Fleet cleanup loop.
//!
//! Once per interval the janitor walks every repository on disk and runs an
//! ordered pipeline of mutually exclusive maintenance steps over each one:
//! wrong-shard deletion, corruption removal, database-orphan removal,
//! attribute and gc-config normalization, reclone heuristics, and size
//! recording. The first step that takes terminal action stops the pipeline
//! for that repository; a step error is logged and the pipeline continues.
//! Cancellation is polled between steps, so shutdown aborts the walk
//! without rolling back already-applied changes — the next pass re-derives
//! everything from fresh on-disk state.

mod disk;
mod sgm;
mod steps;

pub use disk::{DiskSizer, StatDiskSizer, bytes_to_free, free_up_space};
pub use sgm::{
    MAINTENANCE_LOG_FILENAME, clear as clear_maintenance_log, read_failure_count, read_log,
    write_failure as write_maintenance_failure,
};

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::addresses::GitserverAddresses;
use crate::backend::{BackendError, BackendProvider};
use crate::cancel::CancelToken;
use crate::config::Config;
use crate::error::Transience;
use crate::gitdir::{GitDir, RepoName};
use crate::metrics::Metrics;
use crate::repair::RepairError;
use crate::repofs::Fs;
use crate::store::{RepoStore, StoreError};

/// Git-config key another component sets when it suspects on-disk
/// corruption; the reclone step consumes and clears it.
pub const MAYBE_CORRUPT_CONFIG_KEY: &str = "gitmaint.maybeCorrupt";
/// Git-config key recording (as unix seconds) when garbage collection
/// started failing for this repository.
pub const GC_FAILED_AT_CONFIG_KEY: &str = "gitmaint.gcFailedAt";
/// Git-config key recording the repository's origin type, e.g. `perforce`.
pub const REPO_TYPE_CONFIG_KEY: &str = "gitmaint.repoType";

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum CleanupError {
    #[error("filesystem: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Repair(#[from] RepairError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CleanupError {
    pub fn transience(&self) -> Transience {
        match self {
            CleanupError::Io(_) => Transience::Unknown,
            CleanupError::Backend(err) => err.transience(),
            CleanupError::Repair(err) => err.transience(),
            CleanupError::Store(err) => err.transience(),
        }
    }
}

/// Outcome of one pipeline step for one repository.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    Continue,
    /// Terminal action taken (the repository was deleted); later steps must
    /// not run.
    Done,
}

/// Mutable state threaded through the walk, flushed once at the end.
#[derive(Debug, Default)]
pub struct CleanupAccumulator {
    pub repo_sizes: HashMap<RepoName, u64>,
    pub wrong_shard_count: u64,
    pub wrong_shard_bytes: u64,
    pub wrong_shard_deleted: u64,
}

/// Shared read-only context for pipeline steps.
pub(crate) struct StepContext<'a> {
    pub config: &'a Config,
    pub fs: &'a dyn Fs,
    pub store: &'a dyn RepoStore,
    pub provider: &'a dyn BackendProvider,
    pub addresses: &'a GitserverAddresses,
    pub metrics: &'a Metrics,
    pub token: &'a CancelToken,
    /// Whether this shard's own identity appears in the address list.
    pub shard_is_known: bool,
}

/// One step of the per-repository cleanup pipeline.
pub(crate) trait CleanupStep {
    fn name(&self) -> &'static str;

    fn run(
        &self,
        ctx: &StepContext<'_>,
        name: &RepoName,
        dir: &GitDir,
        acc: &mut CleanupAccumulator,
    ) -> Result<StepOutcome, CleanupError>;
}

/// Runs the ordered pipeline for one repository. Returns true when the walk
/// should abort entirely (cancellation).
pub(crate) fn run_steps(
    ctx: &StepContext<'_>,
    steps: &[Box<dyn CleanupStep>],
    name: &RepoName,
    dir: &GitDir,
    acc: &mut CleanupAccumulator,
) -> bool {
    for step in steps {
        if ctx.token.is_cancelled() {
            warn!("aborting janitor walk");
            return true;
        }

        let started = Instant::now();
        let result = step.run(ctx, name, dir, acc);
        ctx.metrics
            .job_duration(step.name(), result.is_ok(), started.elapsed());

        match result {
            Ok(StepOutcome::Done) => break,
            Ok(StepOutcome::Continue) => {}
            Err(err) => {
                error!(
                    step = step.name(),
                    repo = %name,
                    error = %err,
                    "cleanup step failed"
                );
            }
        }
    }
    false
}

pub struct Janitor {
    config: Config,
    fs: Arc<dyn Fs>,
    store: Arc<dyn RepoStore>,
    provider: Arc<dyn BackendProvider>,
    addresses: GitserverAddresses,
    metrics: Metrics,
}

impl Janitor {
    pub fn new(
        config: Config,
        fs: Arc<dyn Fs>,
        store: Arc<dyn RepoStore>,
        provider: Arc<dyn BackendProvider>,
        metrics: Metrics,
    ) -> Self {
        let addresses = GitserverAddresses::new(config.addresses.clone());
        Janitor {
            config,
            fs,
            store,
            provider,
            addresses,
            metrics,
        }
    }

    /// Periodic loop; returns once `token` is cancelled.
    pub fn run(&self, token: &CancelToken) {
        info!(
            interval_secs = self.config.janitor_interval_secs,
            shard = %self.config.shard_id,
            "janitor started"
        );
        loop {
            if token.is_cancelled() {
                return;
            }
            let started = Instant::now();
            self.run_once(token);
            if let Some(remaining) = self.config.janitor_interval().checked_sub(started.elapsed())
            {
                token.sleep(remaining);
            }
        }
    }

    /// One full maintenance pass: disk-pressure eviction (when enabled),
    /// then the cleanup walk.
    pub fn run_once(&self, token: &CancelToken) {
        if self.config.evict_on_disk_pressure {
            let sizer = StatDiskSizer;
            match bytes_to_free(&sizer, &self.config.repos_dir, self.config.desired_percent_free)
            {
                Ok(target) => {
                    if let Err(err) = free_up_space(
                        self.fs.as_ref(),
                        self.store.as_ref(),
                        &self.metrics,
                        token,
                        &self.config.shard_id,
                        target,
                    ) {
                        error!(error = %err, "error freeing up disk space");
                    }
                }
                Err(err) => error!(error = %err, "failed to measure free disk space"),
            }
        }

        self.cleanup_repos(token);
    }

    /// Walks every repository and applies the cleanup pipeline.
    pub fn cleanup_repos(&self, token: &CancelToken) {
        self.metrics.janitor_running(true);
        let started = Instant::now();

        let shard_is_known = self.addresses.contains(&self.config.shard_id);
        if !shard_is_known {
            warn!(
                shard = %self.config.shard_id,
                addresses = ?self.addresses.addresses,
                "current shard is not in the known address list, will not delete repositories"
            );
        }

        let steps = steps::build_steps(&self.config);
        let mut acc = CleanupAccumulator::default();
        let ctx = StepContext {
            config: &self.config,
            fs: self.fs.as_ref(),
            store: self.store.as_ref(),
            provider: self.provider.as_ref(),
            addresses: &self.addresses,
            metrics: &self.metrics,
            token,
            shard_is_known,
        };

        let walk = self
            .fs
            .for_each_repo(&mut |name, dir| run_steps(&ctx, &steps, name, dir, &mut acc));
        if let Err(err) = walk {
            error!(error = %err, "error iterating over repositories");
        }

        if !acc.repo_sizes.is_empty()
            && let Err(err) = self
                .store
                .update_repo_sizes(&self.config.shard_id, &acc.repo_sizes)
        {
            error!(error = %err, "failed to update repository sizes");
        }

        self.metrics
            .wrong_shard_repos(acc.wrong_shard_count, acc.wrong_shard_bytes);
        if self.config.wrong_shard_delete_limit > 0 {
            self.metrics
                .wrong_shard_repos_deleted(acc.wrong_shard_deleted);
        }
        self.metrics.janitor_duration(started.elapsed());
        self.metrics.janitor_running(false);
    }
}
