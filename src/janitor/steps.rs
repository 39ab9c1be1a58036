//! The ordered cleanup pipeline steps.

use std::fs;
use std::io;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{info, warn};

use super::{
    CleanupAccumulator, CleanupError, CleanupStep, GC_FAILED_AT_CONFIG_KEY,
    MAYBE_CORRUPT_CONFIG_KEY, REPO_TYPE_CONFIG_KEY, StepContext, StepOutcome, sgm,
};
use crate::addresses::hostname_match;
use crate::backend::GitBackend;
use crate::cancel::CancelToken;
use crate::config::{Config, GcMode};
use crate::gitdir::{GitDir, RepoName};
use crate::jitter::jitter_duration;
use crate::plan::RepositoryType;
use crate::repair;
use crate::repofs::dir_size;
use crate::store::CloneStatus;

/// How long a repository may keep failing garbage collection before it is
/// recloned. Actual deadlines add per-repository jitter of up to a quarter
/// of this, so simultaneous failures don't reclone in a thundering herd.
const GC_FAILURE_TTL: Duration = Duration::from_secs(2 * 24 * 60 * 60);

/// Builds the ordered pipeline. Steps are mutually exclusive: the first one
/// that reports [`StepOutcome::Done`] (it deleted the repository) stops the
/// pipeline for that repository.
pub(crate) fn build_steps(config: &Config) -> Vec<Box<dyn CleanupStep>> {
    let mut steps: Vec<Box<dyn CleanupStep>> = vec![
        Box::new(DeleteWrongShard),
        Box::new(RemoveCorrupt),
        Box::new(RemoveNonExisting),
        Box::new(EnsureGitAttributes),
        Box::new(AutoGcConfig),
    ];

    // Recloning kicks off clone traffic, which is pointless (and surprising)
    // when automatic git updates are off.
    if !config.disable_auto_git_updates {
        steps.push(Box::new(MaybeReclone));
    }

    // Size always runs last so it reflects whatever the earlier steps did.
    steps.push(Box::new(RecordSize));
    steps
}

/// Deletes repositories that hash to another shard's address.
pub(crate) struct DeleteWrongShard;

impl CleanupStep for DeleteWrongShard {
    fn name(&self) -> &'static str {
        "delete wrong shard repos"
    }

    fn run(
        &self,
        ctx: &StepContext<'_>,
        name: &RepoName,
        dir: &GitDir,
        acc: &mut CleanupAccumulator,
    ) -> Result<StepOutcome, CleanupError> {
        let Some(assigned_addr) = ctx.addresses.addr_for_repo(name) else {
            return Ok(StepOutcome::Continue);
        };
        if hostname_match(&ctx.config.shard_id, assigned_addr) {
            return Ok(StepOutcome::Continue);
        }

        let size = dir_size(dir.path());
        acc.wrong_shard_count += 1;
        acc.wrong_shard_bytes += size;

        // Never mass-delete from a shard that isn't itself in the address
        // list: that is a misconfiguration, not a rebalance.
        if !ctx.shard_is_known || ctx.config.disable_delete_repos_on_wrong_shard {
            return Ok(StepOutcome::Continue);
        }
        let limit = ctx.config.wrong_shard_delete_limit;
        if limit <= 0 || acc.wrong_shard_deleted >= limit as u64 {
            return Ok(StepOutcome::Continue);
        }

        info!(
            repo = %name,
            target_shard = assigned_addr,
            current_shard = %ctx.config.shard_id,
            size_bytes = size,
            "removing repository cloned on the wrong shard"
        );
        ctx.fs.remove_repo(name)?;
        acc.wrong_shard_deleted += 1;
        Ok(StepOutcome::Done)
    }
}

/// Removes corrupt repositories: a missing `HEAD`, or a repository that
/// positively reports it is not bare.
pub(crate) struct RemoveCorrupt;

impl CleanupStep for RemoveCorrupt {
    fn name(&self) -> &'static str {
        "maybe remove corrupt"
    }

    fn run(
        &self,
        ctx: &StepContext<'_>,
        name: &RepoName,
        dir: &GitDir,
        _acc: &mut CleanupAccumulator,
    ) -> Result<StepOutcome, CleanupError> {
        // Cloning and fetching both guarantee a HEAD file; its absence means
        // the repository was torn mid-write.
        let mut reason = match fs::metadata(dir.head_file()) {
            Ok(_) => None,
            Err(err) if err.kind() == io::ErrorKind::NotFound => Some("missing-head"),
            Err(err) => return Err(CleanupError::Io(err)),
        };

        // We have seen corruption leave the bare-repo option missing from
        // the config while everything else looks fine, which then fails
        // every fetch. Removing now beats attempting a repair.
        if reason.is_none() {
            let backend = ctx.provider.open(dir);
            if backend.is_non_bare_best_effort(ctx.token) {
                reason = Some("non-bare");
            }
        }

        let Some(reason) = reason else {
            return Ok(StepOutcome::Continue);
        };

        if let Err(err) = ctx.store.log_corruption(
            name,
            &format!("maintenance detected corrupt repo: {reason}"),
            &ctx.config.shard_id,
        ) {
            warn!(repo = %name, error = %err, "failed to log repository corruption");
        }

        info!(repo = %name, reason, "removing corrupt repository");
        ctx.fs.remove_repo(name)?;
        ctx.metrics.repo_removed(reason);
        if let Err(err) =
            ctx.store
                .set_clone_status(name, CloneStatus::NotCloned, &ctx.config.shard_id)
        {
            warn!(repo = %name, error = %err, "failed to reset clone status");
        }
        Ok(StepOutcome::Done)
    }
}

/// Opt-in removal of repositories the database no longer knows about.
pub(crate) struct RemoveNonExisting;

impl CleanupStep for RemoveNonExisting {
    fn name(&self) -> &'static str {
        "maybe remove non existing"
    }

    fn run(
        &self,
        ctx: &StepContext<'_>,
        name: &RepoName,
        _dir: &GitDir,
        _acc: &mut CleanupAccumulator,
    ) -> Result<StepOutcome, CleanupError> {
        if !ctx.config.remove_non_existing_repos {
            return Ok(StepOutcome::Continue);
        }

        match ctx.store.get_by_name(name) {
            Ok(Some(_)) => Ok(StepOutcome::Continue),
            // Can't reach the database: leave the repository alone.
            Err(err) => {
                warn!(repo = %name, error = %err, "failed to look up repository");
                Ok(StepOutcome::Continue)
            }
            Ok(None) => {
                info!(repo = %name, "removing repository unknown to the database");
                ctx.fs.remove_repo(name)?;
                ctx.metrics.non_existing_repo_removed();
                Ok(StepOutcome::Done)
            }
        }
    }
}

/// Idempotent rewrite of the canonical `info/attributes` file.
pub(crate) struct EnsureGitAttributes;

impl CleanupStep for EnsureGitAttributes {
    fn name(&self) -> &'static str {
        "ensure git attributes"
    }

    fn run(
        &self,
        _ctx: &StepContext<'_>,
        _name: &RepoName,
        dir: &GitDir,
        _acc: &mut CleanupAccumulator,
    ) -> Result<StepOutcome, CleanupError> {
        repair::ensure_git_attributes(dir)?;
        Ok(StepOutcome::Continue)
    }
}

/// Keeps `gc.auto` aligned with who owns garbage collection. Concurrent
/// git-gc runs against our repacks can corrupt the repository.
pub(crate) struct AutoGcConfig;

impl CleanupStep for AutoGcConfig {
    fn name(&self) -> &'static str {
        "auto gc config"
    }

    fn run(
        &self,
        ctx: &StepContext<'_>,
        _name: &RepoName,
        dir: &GitDir,
        _acc: &mut CleanupAccumulator,
    ) -> Result<StepOutcome, CleanupError> {
        let backend = ctx.provider.open(dir);
        match ctx.config.gc_mode {
            GcMode::Git => backend.config().unset(ctx.token, "gc.auto")?,
            GcMode::Daemon => backend.config().set(ctx.token, "gc.auto", "0")?,
        }
        Ok(StepOutcome::Continue)
    }
}

/// Deletes repositories that need a fresh clone: flagged as possibly
/// corrupt, failing garbage collection for too long, or failing maintenance
/// more often than the retry limit.
pub(crate) struct MaybeReclone;

const MAYBE_CORRUPT_REASON: &str = "maybe-corrupt";

impl CleanupStep for MaybeReclone {
    fn name(&self) -> &'static str {
        "maybe reclone"
    }

    fn run(
        &self,
        ctx: &StepContext<'_>,
        name: &RepoName,
        dir: &GitDir,
        _acc: &mut CleanupAccumulator,
    ) -> Result<StepOutcome, CleanupError> {
        let backend = ctx.provider.open(dir);

        let repo_type = backend
            .config()
            .get(ctx.token, REPO_TYPE_CONFIG_KEY)?
            .map(|value| RepositoryType::from_config_value(&value))
            .unwrap_or_default();

        let mut reason: Option<String> = None;

        if let Ok(Some(flag)) = backend.config().get(ctx.token, MAYBE_CORRUPT_CONFIG_KEY)
            && !flag.is_empty()
        {
            // The corruption was already logged when the flag was set. Clear
            // it so a failing reclone doesn't loop forever.
            reason = Some(MAYBE_CORRUPT_REASON.to_string());
            let _ = backend.config().unset(ctx.token, MAYBE_CORRUPT_CONFIG_KEY);
        }

        if reason.is_none()
            && let Some(failed_at) = gc_failed_at(backend.as_ref(), ctx.token)
        {
            let deadline = failed_at
                + GC_FAILURE_TTL
                + jitter_duration(&dir.to_string(), GC_FAILURE_TTL / 4);
            if SystemTime::now() > deadline {
                reason = Some(match fs::read_to_string(dir.join("gc.log")) {
                    Ok(log) if !log.trim().is_empty() => {
                        format!("git gc failed: {}", log.trim())
                    }
                    _ => "git gc failed".to_string(),
                });
            }
        }

        if reason.is_none()
            && ctx.config.sgm_retries >= 0
            && sgm::read_failure_count(dir) > ctx.config.sgm_retries
        {
            reason = Some(match sgm::read_log(dir) {
                Some(log) => format!("maintenance failed too often: {log}"),
                None => "maintenance failed too often".to_string(),
            });
        }

        // Converting a Perforce depot to git is expensive enough that
        // age-based reasons never justify redoing it.
        if repo_type == RepositoryType::Perforce
            && reason.as_deref() != Some(MAYBE_CORRUPT_REASON)
        {
            reason = None;
        }

        let Some(reason) = reason else {
            return Ok(StepOutcome::Continue);
        };

        info!(repo = %name, reason, "removing repository for reclone");
        ctx.fs.remove_repo(name)?;
        if let Err(err) =
            ctx.store
                .set_clone_status(name, CloneStatus::NotCloned, &ctx.config.shard_id)
        {
            warn!(repo = %name, error = %err, "failed to reset clone status");
        }
        ctx.metrics.repo_recloned();
        Ok(StepOutcome::Done)
    }
}

fn gc_failed_at(backend: &dyn GitBackend, token: &CancelToken) -> Option<SystemTime> {
    let value = backend.config().get(token, GC_FAILED_AT_CONFIG_KEY).ok()??;
    let secs: i64 = value.trim().parse().ok()?;
    if secs <= 0 {
        return None;
    }
    Some(UNIX_EPOCH + Duration::from_secs(secs as u64))
}

/// Accumulates repository sizes for one batched database flush per walk.
pub(crate) struct RecordSize;

impl CleanupStep for RecordSize {
    fn name(&self) -> &'static str {
        "compute repo size"
    }

    fn run(
        &self,
        _ctx: &StepContext<'_>,
        name: &RepoName,
        dir: &GitDir,
        acc: &mut CleanupAccumulator,
    ) -> Result<StepOutcome, CleanupError> {
        acc.repo_sizes.insert(name.clone(), dir_size(dir.path()));
        Ok(StepOutcome::Continue)
    }
}
