//! Maintenance planner.
//!
//! Pure decision logic: a [`RepositoryInfo`] snapshot plus the current time
//! map to a [`Plan`] describing which maintenance operations to perform.
//! Nothing in here touches the filesystem, which keeps every threshold
//! testable with constructed snapshots.
//!
//! The thresholds are tuned constants; changing them changes repack
//! frequency and cost trade-offs fleet-wide.

use std::time::{Duration, SystemTime};

use crate::stats::{RepositoryInfo, STALE_OBJECTS_GRACE_PERIOD};

/// Maximum number of loose objects we tolerate before triggering a repack,
/// and of stale loose objects before triggering a prune. Corresponds to an
/// average of four loose objects per shard directory.
pub const LOOSE_OBJECT_LIMIT: u64 = 1024;

/// Minimum time between full repacks. Full repacks rewrite every packfile,
/// so doing them more often than this wastes IO on large repositories.
pub const FULL_REPACK_COOLDOWN_PERIOD: Duration = Duration::from_secs(5 * 24 * 60 * 60);

/// Base of the geometric packfile progression. Copied from the reference
/// housekeeping implementation.
const GEOMETRIC_PACKFILE_BASE: f64 = 1.8;

/// How a repository's object database should be repacked.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RepackStrategy {
    /// Pack all loose objects into a new packfile regardless of their
    /// reachability, leaving existing packfiles alone.
    #[default]
    IncrementalWithUnreachable,
    /// Rewrite all packfiles, moving unreachable objects into a cruft pack.
    FullWithCruft,
    /// Merge just enough packfiles to restore a geometric progression of
    /// their object counts.
    Geometric,
}

impl RepackStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            RepackStrategy::IncrementalWithUnreachable => "incremental_with_unreachable",
            RepackStrategy::FullWithCruft => "full_with_cruft",
            RepackStrategy::Geometric => "geometric",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RepackObjectsConfig {
    pub strategy: RepackStrategy,
    pub write_bitmap: bool,
    pub write_multi_pack_index: bool,
    /// Cruft objects older than this are dropped entirely. Only valid with
    /// [`RepackStrategy::FullWithCruft`].
    pub cruft_expire_before: Option<SystemTime>,
}

/// Where the repository originally came from. Repositories converted from
/// Perforce depots are too expensive to rebuild to subject them to routine
/// age-based maintenance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RepositoryType {
    #[default]
    Git,
    Perforce,
}

impl RepositoryType {
    pub fn from_config_value(value: &str) -> Self {
        if value.eq_ignore_ascii_case("perforce") {
            RepositoryType::Perforce
        } else {
            RepositoryType::Git
        }
    }
}

/// Inputs to planning beyond the statistics snapshot itself.
#[derive(Clone, Copy, Debug)]
pub struct PlanContext {
    pub now: SystemTime,
    pub repo_type: RepositoryType,
    /// True when this pass was triggered by a corruption signal rather than
    /// the periodic schedule. Lifts the Perforce full-repack exemption.
    pub triggered_by_corruption: bool,
}

impl PlanContext {
    pub fn new(now: SystemTime) -> Self {
        PlanContext {
            now,
            repo_type: RepositoryType::Git,
            triggered_by_corruption: false,
        }
    }
}

/// Decision record for one maintenance pass over one repository.
///
/// Produced fresh on every pass and never mutated after construction.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Plan {
    /// Requested by callers that detected repair-worthy state. The heuristic
    /// planner never sets this: repair unconditionally precedes planning.
    pub should_repair_repo: bool,
    pub should_repack: bool,
    pub repack_config: RepackObjectsConfig,
    pub should_prune_objects: bool,
    pub prune_expiration: Option<SystemTime>,
    pub should_repack_references: bool,
    pub should_write_commit_graph: bool,
    pub should_replace_commit_graph_chain: bool,
    /// Any mutation invalidates the cached repository size.
    pub should_recalculate_repo_size: bool,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        !(self.should_repair_repo
            || self.should_repack
            || self.should_prune_objects
            || self.should_repack_references
            || self.should_write_commit_graph)
    }
}

/// Maps a statistics snapshot to a maintenance plan.
///
/// Pure and deterministic: the same snapshot and context always produce the
/// same plan.
pub fn heuristic_plan(info: &RepositoryInfo, ctx: &PlanContext) -> Plan {
    let (should_prune_objects, prune_expiration) = should_prune_objects(info, ctx.now);
    let (should_repack, repack_config) = should_repack_objects(info, ctx);
    let should_repack_references = should_repack_references(info);
    let (should_write_commit_graph, should_replace_commit_graph_chain) =
        should_write_commit_graph(info, ctx);

    let should_recalculate_repo_size = should_repack
        || should_prune_objects
        || should_repack_references
        || should_write_commit_graph;

    Plan {
        should_repair_repo: false,
        should_repack,
        repack_config,
        should_prune_objects,
        prune_expiration,
        should_repack_references,
        should_write_commit_graph,
        should_replace_commit_graph_chain,
        should_recalculate_repo_size,
    }
}

/// Prunes only once enough stale loose objects have accumulated, and leaves
/// the backend a matching grace window so recently unreachable objects
/// survive until the next cycle.
fn should_prune_objects(info: &RepositoryInfo, now: SystemTime) -> (bool, Option<SystemTime>) {
    if info.loose_objects.stale_count <= LOOSE_OBJECT_LIMIT {
        return (false, None);
    }

    let expire_before = now
        .checked_sub(STALE_OBJECTS_GRACE_PERIOD)
        .unwrap_or(SystemTime::UNIX_EPOCH);
    (true, Some(expire_before))
}

fn should_repack_objects(info: &RepositoryInfo, ctx: &PlanContext) -> (bool, RepackObjectsConfig) {
    let packfiles = &info.packfiles;

    if packfiles.count == 0 && info.loose_objects.count == 0 {
        return (false, RepackObjectsConfig::default());
    }

    // A full repack rewrites every packfile, folds unreachable objects into
    // a cruft pack, and refreshes bitmap and multi-pack-index. It is the
    // most expensive strategy, so it only runs once several packfiles have
    // accumulated and the cooldown has passed.
    let non_cruft_packfiles = packfiles.count.saturating_sub(packfiles.cruft_count);
    let full_repack_due = match packfiles.last_full_repack {
        Some(last) => match ctx.now.duration_since(last) {
            Ok(elapsed) => elapsed > FULL_REPACK_COOLDOWN_PERIOD,
            // Timestamp in the future, e.g. clock skew: not due.
            Err(_) => false,
        },
        None => true,
    };
    let perforce_exempt =
        ctx.repo_type == RepositoryType::Perforce && !ctx.triggered_by_corruption;

    if non_cruft_packfiles > 1 && full_repack_due && !perforce_exempt {
        let expire_before = ctx
            .now
            .checked_sub(STALE_OBJECTS_GRACE_PERIOD)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        return (
            true,
            RepackObjectsConfig {
                strategy: RepackStrategy::FullWithCruft,
                write_bitmap: true,
                write_multi_pack_index: true,
                cruft_expire_before: Some(expire_before),
            },
        );
    }

    // Without a multi-pack-index, object lookups walk every packfile index.
    // Geometric repacking rewrites it alongside merging packfiles.
    if packfiles.count > 0 && !packfiles.multi_pack_index.exists {
        return (
            true,
            RepackObjectsConfig {
                strategy: RepackStrategy::Geometric,
                write_bitmap: true,
                write_multi_pack_index: true,
                cruft_expire_before: None,
            },
        );
    }

    // Tolerate a logarithmic number of packfiles not yet tracked by the
    // multi-pack-index before repacking again, so that large repositories
    // aren't repacked on every new packfile.
    let packfile_size_mb = (packfiles.size / 1024 / 1024) as f64;
    let allowed_untracked = (packfile_size_mb.ln() / GEOMETRIC_PACKFILE_BASE.ln()).max(2.0);
    let untracked = packfiles
        .count
        .saturating_sub(packfiles.multi_pack_index.packfile_count);
    if untracked as f64 > allowed_untracked {
        return (
            true,
            RepackObjectsConfig {
                strategy: RepackStrategy::Geometric,
                write_bitmap: true,
                write_multi_pack_index: true,
                cruft_expire_before: None,
            },
        );
    }

    // Loose objects are packed regardless of reachability: a reachability
    // walk costs more than just packing everything, and pruning handles
    // expiry separately.
    if info.loose_objects.count > LOOSE_OBJECT_LIMIT {
        return (
            true,
            RepackObjectsConfig {
                strategy: RepackStrategy::IncrementalWithUnreachable,
                write_bitmap: false,
                write_multi_pack_index: false,
                cruft_expire_before: None,
            },
        );
    }

    (false, RepackObjectsConfig::default())
}

/// Repacks references once the loose reference count reaches a threshold
/// that grows logarithmically with the size of `packed-refs`: rewriting a
/// large packed-refs file for a handful of loose refs is not worth it.
fn should_repack_references(info: &RepositoryInfo) -> bool {
    let loose = info.references.loose_references_count;
    if loose == 0 {
        return false;
    }

    let threshold = ((info.references.packed_references_size as f64 / 100.0).ln()
        / 1.15f64.ln())
    .max(16.0);
    if threshold as u64 > loose {
        return false;
    }

    true
}

/// Decides whether to write the commit-graph and whether the whole chain
/// must be replaced.
///
/// Pruning and cruft expiry can delete objects that an incremental chain
/// still references, so those paths replace the chain outright.
fn should_write_commit_graph(info: &RepositoryInfo, ctx: &PlanContext) -> (bool, bool) {
    // Nothing reachable to graph.
    if info.references.loose_references_count == 0
        && info.references.packed_references_size == 0
    {
        return (false, false);
    }

    let (prune, _) = should_prune_objects(info, ctx.now);
    if prune {
        return (true, true);
    }

    // No chain, or a chain predating bloom filters or generation data: the
    // structure itself needs renewal.
    let graph = &info.commit_graph;
    if graph.chain_length == 0 || !graph.has_bloom_filters || !graph.has_generation_data {
        return (true, true);
    }

    let (repack, config) = should_repack_objects(info, ctx);
    if repack {
        let replace = config.strategy == RepackStrategy::FullWithCruft
            && config.cruft_expire_before.is_some();
        return (true, replace);
    }

    (false, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::{
        BitmapInfo, CommitGraphInfo, LooseObjectsInfo, MultiPackIndexInfo, PackfilesInfo,
        ReferencesInfo,
    };

    fn now() -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000)
    }

    fn healthy_commit_graph() -> CommitGraphInfo {
        CommitGraphInfo {
            exists: true,
            chain_length: 1,
            has_bloom_filters: true,
            has_generation_data: true,
            has_generation_data_overflow: false,
        }
    }

    fn tracked_packfiles(count: u64) -> PackfilesInfo {
        PackfilesInfo {
            count,
            size: count * 1024,
            multi_pack_index: MultiPackIndexInfo {
                exists: true,
                version: 1,
                packfile_count: count,
            },
            multi_pack_index_bitmap: BitmapInfo {
                exists: true,
                version: 1,
                has_hash_cache: true,
                has_lookup_table: true,
            },
            last_full_repack: Some(now()),
            ..PackfilesInfo::default()
        }
    }

    #[test]
    fn empty_repository_needs_nothing() {
        let plan = heuristic_plan(&RepositoryInfo::default(), &PlanContext::new(now()));
        assert!(plan.is_empty());
        assert!(!plan.should_recalculate_repo_size);
    }

    #[test]
    fn planning_is_idempotent() {
        let info = RepositoryInfo {
            loose_objects: LooseObjectsInfo {
                count: 2000,
                size: 1 << 20,
                stale_count: 1500,
                stale_size: 1 << 19,
                ..LooseObjectsInfo::default()
            },
            packfiles: tracked_packfiles(3),
            references: ReferencesInfo {
                loose_references_count: 100,
                packed_references_size: 1000,
            },
            commit_graph: healthy_commit_graph(),
        };
        let ctx = PlanContext::new(now());
        assert_eq!(heuristic_plan(&info, &ctx), heuristic_plan(&info, &ctx));
    }

    #[test]
    fn prune_threshold_boundary() {
        let mut info = RepositoryInfo::default();

        info.loose_objects.stale_count = 1024;
        let (prune, expiration) = should_prune_objects(&info, now());
        assert!(!prune);
        assert_eq!(expiration, None);

        info.loose_objects.stale_count = 1025;
        let (prune, expiration) = should_prune_objects(&info, now());
        assert!(prune);
        assert_eq!(expiration, Some(now() - STALE_OBJECTS_GRACE_PERIOD));
    }

    #[test]
    fn full_repack_cooldown_boundary() {
        let mut info = RepositoryInfo::default();
        info.packfiles = tracked_packfiles(2);
        let ctx = PlanContext::new(now());

        info.packfiles.last_full_repack =
            Some(now() - (FULL_REPACK_COOLDOWN_PERIOD - Duration::from_nanos(1)));
        let (repack, config) = should_repack_objects(&info, &ctx);
        assert!(!repack || config.strategy != RepackStrategy::FullWithCruft);

        info.packfiles.last_full_repack =
            Some(now() - (FULL_REPACK_COOLDOWN_PERIOD + Duration::from_nanos(1)));
        let (repack, config) = should_repack_objects(&info, &ctx);
        assert!(repack);
        assert_eq!(config.strategy, RepackStrategy::FullWithCruft);
        assert!(config.write_bitmap);
        assert!(config.write_multi_pack_index);
        assert_eq!(
            config.cruft_expire_before,
            Some(now() - STALE_OBJECTS_GRACE_PERIOD)
        );
    }

    #[test]
    fn cruft_packs_do_not_count_toward_full_repack() {
        let mut info = RepositoryInfo::default();
        info.packfiles = tracked_packfiles(2);
        info.packfiles.cruft_count = 1;
        info.packfiles.last_full_repack = None;

        let (repack, config) = should_repack_objects(&info, &PlanContext::new(now()));
        // Only one non-cruft packfile left: no full repack.
        assert!(!repack || config.strategy != RepackStrategy::FullWithCruft);
    }

    #[test]
    fn perforce_repositories_skip_age_based_full_repack() {
        let mut info = RepositoryInfo::default();
        info.packfiles = tracked_packfiles(2);
        info.packfiles.last_full_repack = None;

        let mut ctx = PlanContext::new(now());
        ctx.repo_type = RepositoryType::Perforce;
        let (repack, config) = should_repack_objects(&info, &ctx);
        assert!(!repack || config.strategy != RepackStrategy::FullWithCruft);

        // A corruption-triggered pass lifts the exemption.
        ctx.triggered_by_corruption = true;
        let (repack, config) = should_repack_objects(&info, &ctx);
        assert!(repack);
        assert_eq!(config.strategy, RepackStrategy::FullWithCruft);
    }

    #[test]
    fn missing_multi_pack_index_triggers_geometric_repack() {
        let mut info = RepositoryInfo::default();
        info.packfiles.count = 1;
        info.packfiles.size = 100;
        info.packfiles.last_full_repack = Some(now());

        let (repack, config) = should_repack_objects(&info, &PlanContext::new(now()));
        assert!(repack);
        assert_eq!(config.strategy, RepackStrategy::Geometric);
        assert!(config.write_bitmap);
        assert!(config.write_multi_pack_index);
        assert_eq!(config.cruft_expire_before, None);
    }

    #[test]
    fn too_many_untracked_packfiles_trigger_geometric_repack() {
        let mut info = RepositoryInfo::default();
        info.packfiles = tracked_packfiles(10);
        info.packfiles.multi_pack_index.packfile_count = 2;
        // Small total size: the allowance bottoms out at two packfiles.
        info.packfiles.size = 1024;
        info.packfiles.cruft_count = 9;

        let (repack, config) = should_repack_objects(&info, &PlanContext::new(now()));
        assert!(repack);
        assert_eq!(config.strategy, RepackStrategy::Geometric);

        // With everything tracked, nothing to do.
        info.packfiles.multi_pack_index.packfile_count = 10;
        let (repack, _) = should_repack_objects(&info, &PlanContext::new(now()));
        assert!(!repack);
    }

    #[test]
    fn loose_object_pileup_triggers_incremental_repack() {
        let mut info = RepositoryInfo::default();
        info.loose_objects.count = 1025;
        info.packfiles = tracked_packfiles(1);

        let (repack, config) = should_repack_objects(&info, &PlanContext::new(now()));
        assert!(repack);
        assert_eq!(config.strategy, RepackStrategy::IncrementalWithUnreachable);
        assert!(!config.write_bitmap);
        assert!(!config.write_multi_pack_index);

        info.loose_objects.count = 1024;
        let (repack, _) = should_repack_objects(&info, &PlanContext::new(now()));
        assert!(!repack);
    }

    #[test]
    fn reference_repack_threshold() {
        let mut info = RepositoryInfo::default();

        // No loose references: nothing to pack.
        info.references.loose_references_count = 0;
        assert!(!should_repack_references(&info));

        // Below the floor of sixteen.
        info.references.loose_references_count = 15;
        assert!(!should_repack_references(&info));

        // The trigger is not-smaller-than, not strictly-greater.
        info.references.loose_references_count = 16;
        assert!(should_repack_references(&info));

        // A large packed-refs file raises the threshold.
        info.references.packed_references_size = 100 * 1024 * 1024;
        info.references.loose_references_count = 90;
        assert!(!should_repack_references(&info));
        info.references.loose_references_count = 100;
        assert!(should_repack_references(&info));
    }

    #[test]
    fn commit_graph_skipped_without_references() {
        let mut info = RepositoryInfo::default();
        info.loose_objects.stale_count = 5000;
        let (write, _) = should_write_commit_graph(&info, &PlanContext::new(now()));
        assert!(!write);
    }

    #[test]
    fn pruning_replaces_the_commit_graph_chain() {
        let mut info = RepositoryInfo::default();
        info.references.loose_references_count = 1;
        info.loose_objects.stale_count = 1025;
        info.commit_graph = healthy_commit_graph();
        info.packfiles = tracked_packfiles(1);

        let (write, replace) = should_write_commit_graph(&info, &PlanContext::new(now()));
        assert!(write);
        assert!(replace);
    }

    #[test]
    fn stale_chain_structure_is_replaced() {
        let mut info = RepositoryInfo::default();
        info.references.loose_references_count = 1;
        info.packfiles = tracked_packfiles(1);

        for graph in [
            CommitGraphInfo::default(),
            CommitGraphInfo {
                has_bloom_filters: false,
                ..healthy_commit_graph()
            },
            CommitGraphInfo {
                has_generation_data: false,
                ..healthy_commit_graph()
            },
        ] {
            info.commit_graph = graph;
            let (write, replace) = should_write_commit_graph(&info, &PlanContext::new(now()));
            assert!(write);
            assert!(replace);
        }
    }

    #[test]
    fn geometric_repack_writes_graph_without_replacing_chain() {
        let mut info = RepositoryInfo::default();
        info.references.loose_references_count = 1;
        info.commit_graph = healthy_commit_graph();
        info.packfiles.count = 1;
        info.packfiles.size = 100;
        info.packfiles.last_full_repack = Some(now());

        let (write, replace) = should_write_commit_graph(&info, &PlanContext::new(now()));
        assert!(write);
        assert!(!replace);
    }

    #[test]
    fn full_repack_with_cruft_expiry_replaces_chain() {
        let mut info = RepositoryInfo::default();
        info.references.loose_references_count = 1;
        info.commit_graph = healthy_commit_graph();
        info.packfiles = tracked_packfiles(2);
        info.packfiles.last_full_repack = None;

        let (write, replace) = should_write_commit_graph(&info, &PlanContext::new(now()));
        assert!(write);
        assert!(replace);
    }

    #[test]
    fn healthy_repository_writes_no_graph() {
        let mut info = RepositoryInfo::default();
        info.references.loose_references_count = 1;
        info.commit_graph = healthy_commit_graph();
        info.packfiles = tracked_packfiles(1);

        let (write, replace) = should_write_commit_graph(&info, &PlanContext::new(now()));
        assert!(!write);
        assert!(!replace);
    }

    #[test]
    fn recalculate_size_follows_any_mutation() {
        let mut info = RepositoryInfo::default();
        info.loose_objects.count = 2000;
        let plan = heuristic_plan(&info, &PlanContext::new(now()));
        assert!(plan.should_recalculate_repo_size);
        assert!(!plan.is_empty());
    }

    // The end-to-end repack progression: a fresh clone full of loose objects
    // first gets them packed wholesale, then a later pass builds the
    // multi-pack-index geometrically.
    #[test]
    fn repack_progression_from_loose_to_geometric() {
        let mut info = RepositoryInfo::default();
        info.loose_objects.count = 2000;

        let (repack, config) = should_repack_objects(&info, &PlanContext::new(now()));
        assert!(repack);
        assert_eq!(config.strategy, RepackStrategy::IncrementalWithUnreachable);

        // Simulated post-repack state: everything packed, no MIDX yet.
        info.loose_objects.count = 0;
        info.packfiles.count = 1;
        info.packfiles.size = 40 * 1024 * 1024;
        info.packfiles.last_full_repack = Some(now());

        let (repack, config) = should_repack_objects(&info, &PlanContext::new(now()));
        assert!(repack);
        assert_eq!(config.strategy, RepackStrategy::Geometric);
    }
}
