//! Per-repository optimizer loop.
//!
//! A self-contained periodic loop: each pass fans one task per repository
//! out over a bounded worker pool. Every task runs repair, collects
//! statistics, plans, and executes the planned maintenance. A failing step
//! ends that repository's pass only; the next pass re-evaluates from fresh
//! on-disk state, so there is no retry bookkeeping. The pool is joined
//! before the next tick — passes never overlap.

use std::sync::Arc;
use std::time::{Instant, SystemTime};

use tracing::{debug, error, info, warn};

use crate::backend::BackendProvider;
use crate::cancel::CancelToken;
use crate::config::Config;
use crate::gitdir::{GitDir, RepoName};
use crate::janitor::{self, REPO_TYPE_CONFIG_KEY};
use crate::metrics::Metrics;
use crate::objects;
use crate::plan::{self, PlanContext, RepositoryType};
use crate::repair;
use crate::repofs::Fs;
use crate::stats;

pub struct Optimizer {
    config: Config,
    fs: Arc<dyn Fs>,
    provider: Arc<dyn BackendProvider>,
    metrics: Metrics,
}

impl Optimizer {
    /// Panics when the configured concurrency is zero: that is a wiring
    /// bug, not a runtime condition.
    pub fn new(
        config: Config,
        fs: Arc<dyn Fs>,
        provider: Arc<dyn BackendProvider>,
        metrics: Metrics,
    ) -> Self {
        assert!(
            config.optimize_concurrency >= 1,
            "optimizer concurrency must be at least 1"
        );
        Optimizer {
            config,
            fs,
            provider,
            metrics,
        }
    }

    /// Periodic loop; returns once `token` is cancelled.
    pub fn run(&self, token: &CancelToken) {
        info!(
            interval_secs = self.config.optimize_interval_secs,
            concurrency = self.config.optimize_concurrency,
            "optimizer started"
        );
        loop {
            if token.is_cancelled() {
                return;
            }
            let started = Instant::now();
            self.run_pass(token);
            if let Some(remaining) = self
                .config
                .optimize_interval()
                .checked_sub(started.elapsed())
            {
                token.sleep(remaining);
            }
        }
    }

    /// One pass over every repository with bounded parallelism. Two
    /// repositories may be maintained concurrently, but each repository is
    /// touched by exactly one worker per pass.
    pub fn run_pass(&self, token: &CancelToken) {
        let mut repos: Vec<(RepoName, GitDir)> = Vec::new();
        let listing = self.fs.for_each_repo(&mut |name, dir| {
            repos.push((name.clone(), dir.clone()));
            false
        });
        if let Err(err) = listing {
            error!(error = %err, "failed to enumerate repositories");
            return;
        }

        let (tx, rx) = crossbeam::channel::unbounded::<(RepoName, GitDir)>();
        for repo in repos {
            let _ = tx.send(repo);
        }
        drop(tx);

        std::thread::scope(|scope| {
            for _ in 0..self.config.optimize_concurrency {
                let rx = rx.clone();
                scope.spawn(move || {
                    while let Ok((name, dir)) = rx.recv() {
                        if token.is_cancelled() {
                            return;
                        }
                        let started = Instant::now();
                        let result = self.optimize_repo(token, &name, &dir);
                        self.metrics
                            .optimize_duration(result.is_ok(), started.elapsed());
                        match result {
                            Ok(()) => {
                                if let Err(err) = janitor::clear_maintenance_log(&dir) {
                                    debug!(repo = %name, error = %err, "failed to clear maintenance log");
                                }
                            }
                            Err(err) => {
                                error!(repo = %name, error = %err, "repository maintenance failed");
                                // Shutdown is not a maintenance failure; don't
                                // let repeated restarts count toward a reclone.
                                if !token.is_cancelled()
                                    && let Err(log_err) =
                                        janitor::write_maintenance_failure(&dir, &err.to_string())
                                {
                                    debug!(repo = %name, error = %log_err, "failed to write maintenance log");
                                }
                            }
                        }
                    }
                });
            }
        });
    }

    fn optimize_repo(
        &self,
        token: &CancelToken,
        name: &RepoName,
        dir: &GitDir,
    ) -> crate::Result<()> {
        let token = token.with_timeout(self.config.optimize_timeout());
        let backend = self.provider.open(dir);

        // Repair is best-effort: a stuck lock we could not remove is no
        // reason to skip planning.
        if let Err(err) = repair::repair_repo(
            backend.as_ref(),
            dir,
            &token,
            self.config.long_command_timeout(),
        ) {
            warn!(repo = %name, error = %err, "repository repair incomplete");
        }

        let now = SystemTime::now();
        let info = stats::repository_info(dir, now)?;

        let repo_type = backend
            .config()
            .get(&token, REPO_TYPE_CONFIG_KEY)
            .unwrap_or(None)
            .map(|value| RepositoryType::from_config_value(&value))
            .unwrap_or_default();
        let ctx = PlanContext {
            now,
            repo_type,
            triggered_by_corruption: false,
        };

        let plan = plan::heuristic_plan(&info, &ctx);
        if plan.is_empty() {
            debug!(repo = %name, "repository needs no maintenance");
            return Ok(());
        }

        if plan.should_repack {
            objects::repack_objects(backend.as_ref(), dir, &token, &plan.repack_config)?;
        }
        if plan.should_prune_objects
            && let Some(expire_before) = plan.prune_expiration
        {
            objects::prune_objects(backend.as_ref(), &token, expire_before)?;
        }
        if plan.should_repack_references {
            backend.maintenance().pack_refs(&token)?;
        }
        if plan.should_write_commit_graph {
            backend
                .maintenance()
                .write_commit_graph(&token, plan.should_replace_commit_graph_chain)?;
        }

        Ok(())
    }
}
