//! Full janitor passes over fabricated repository corpora.

mod fixtures;

use std::sync::Arc;

use gitmaint::cancel::CancelToken;
use gitmaint::config::Config;
use gitmaint::gitdir::RepoName;
use gitmaint::janitor::{
    Janitor, MAYBE_CORRUPT_CONFIG_KEY, REPO_TYPE_CONFIG_KEY, write_maintenance_failure,
};
use gitmaint::jitter::fnv1_64;
use gitmaint::metrics::Metrics;
use gitmaint::repofs::LocalFs;
use gitmaint::store::{CloneStatus, MemoryStore};

use fixtures::{FakeProvider, init_repo};

fn base_config(root: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.repos_dir = root.to_path_buf();
    config.shard_id = "shard-1".to_string();
    config.addresses = vec!["shard-1:3178".to_string()];
    config
}

fn build_janitor(config: Config, root: &std::path::Path, store: Arc<MemoryStore>) -> (Janitor, FakeProvider) {
    let provider = FakeProvider::new();
    let janitor = Janitor::new(
        config,
        Arc::new(LocalFs::new(root)),
        store,
        Arc::new(provider.clone()),
        Metrics::with_tracing(),
    );
    (janitor, provider)
}

#[test]
fn healthy_repository_survives_and_gets_sized() {
    let tmp = tempfile::tempdir().expect("tempdir");
    init_repo(tmp.path(), "github.com/foo/bar");

    let store = Arc::new(MemoryStore::new());
    store.insert(RepoName::from("github.com/foo/bar"));
    let (janitor, provider) = build_janitor(base_config(tmp.path()), tmp.path(), store.clone());

    janitor.cleanup_repos(&CancelToken::new());

    assert!(tmp.path().join("github.com/foo/bar").exists());
    assert!(
        store
            .sizes()
            .contains_key(&RepoName::from("github.com/foo/bar"))
    );
    // The daemon owns gc: the auto-gc step pinned gc.auto to 0.
    assert!(
        provider
            .backend
            .calls()
            .iter()
            .any(|call| call == "config.set gc.auto=0")
    );
}

#[test]
fn too_many_maintenance_failures_trigger_reclone() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let dir = init_repo(tmp.path(), "github.com/foo/flaky");
    for _ in 0..4 {
        write_maintenance_failure(&dir, "pack-objects failed").expect("log failure");
    }

    let store = Arc::new(MemoryStore::new());
    let (janitor, _provider) = build_janitor(base_config(tmp.path()), tmp.path(), store.clone());

    janitor.cleanup_repos(&CancelToken::new());

    assert!(!tmp.path().join("github.com/foo/flaky").exists());
    assert_eq!(
        store.clone_status(&RepoName::from("github.com/foo/flaky")),
        Some(CloneStatus::NotCloned)
    );
}

#[test]
fn failure_count_within_retries_is_tolerated() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let dir = init_repo(tmp.path(), "github.com/foo/flaky");
    for _ in 0..3 {
        write_maintenance_failure(&dir, "pack-objects failed").expect("log failure");
    }

    let store = Arc::new(MemoryStore::new());
    let (janitor, _provider) = build_janitor(base_config(tmp.path()), tmp.path(), store);

    janitor.cleanup_repos(&CancelToken::new());
    assert!(tmp.path().join("github.com/foo/flaky").exists());
}

#[test]
fn maybe_corrupt_flag_triggers_reclone_and_is_cleared() {
    let tmp = tempfile::tempdir().expect("tempdir");
    init_repo(tmp.path(), "github.com/foo/sus");

    let store = Arc::new(MemoryStore::new());
    let (janitor, provider) = build_janitor(base_config(tmp.path()), tmp.path(), store.clone());
    provider.backend.set_config(MAYBE_CORRUPT_CONFIG_KEY, "true");

    janitor.cleanup_repos(&CancelToken::new());

    assert!(!tmp.path().join("github.com/foo/sus").exists());
    assert!(
        provider.backend.config_value(MAYBE_CORRUPT_CONFIG_KEY).is_none(),
        "the flag must be consumed so a failing reclone cannot loop"
    );
}

#[test]
fn perforce_repositories_skip_age_based_reclone() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let dir = init_repo(tmp.path(), "perforce/depot");
    for _ in 0..10 {
        write_maintenance_failure(&dir, "maintenance failed").expect("log failure");
    }

    let store = Arc::new(MemoryStore::new());
    let (janitor, provider) = build_janitor(base_config(tmp.path()), tmp.path(), store);
    provider.backend.set_config(REPO_TYPE_CONFIG_KEY, "perforce");

    janitor.cleanup_repos(&CancelToken::new());
    assert!(
        tmp.path().join("perforce/depot").exists(),
        "converted depots are too expensive to reclone for age-based reasons"
    );
}

#[test]
fn corruption_based_reclone_overrides_the_perforce_exemption() {
    let tmp = tempfile::tempdir().expect("tempdir");
    init_repo(tmp.path(), "perforce/depot");

    let store = Arc::new(MemoryStore::new());
    let (janitor, provider) = build_janitor(base_config(tmp.path()), tmp.path(), store);
    provider.backend.set_config(REPO_TYPE_CONFIG_KEY, "perforce");
    provider.backend.set_config(MAYBE_CORRUPT_CONFIG_KEY, "true");

    janitor.cleanup_repos(&CancelToken::new());
    assert!(!tmp.path().join("perforce/depot").exists());
}

#[test]
fn non_existing_removal_is_opt_in() {
    let tmp = tempfile::tempdir().expect("tempdir");
    init_repo(tmp.path(), "github.com/foo/orphan");

    // Unknown to the database, but the flag is off: survives.
    let store = Arc::new(MemoryStore::new());
    let (janitor, _provider) = build_janitor(base_config(tmp.path()), tmp.path(), store.clone());
    janitor.cleanup_repos(&CancelToken::new());
    assert!(tmp.path().join("github.com/foo/orphan").exists());

    // With the flag on it is removed.
    let mut config = base_config(tmp.path());
    config.remove_non_existing_repos = true;
    let (janitor, _provider) = build_janitor(config, tmp.path(), store);
    janitor.cleanup_repos(&CancelToken::new());
    assert!(!tmp.path().join("github.com/foo/orphan").exists());
}

#[test]
fn wrong_shard_repositories_are_deleted_within_limits() {
    let tmp = tempfile::tempdir().expect("tempdir");

    let addresses = vec!["shard-1:3178".to_string(), "shard-2:3178".to_string()];
    // Find a repository name that hashes to the other shard.
    let name = (0..)
        .map(|i| format!("github.com/foo/repo-{i}"))
        .find(|name| fnv1_64(name.as_bytes()) % 2 == 1)
        .expect("candidate name");
    init_repo(tmp.path(), &name);

    let mut config = base_config(tmp.path());
    config.addresses = addresses.clone();

    // Deletion disabled: counted, not deleted.
    let store = Arc::new(MemoryStore::new());
    let mut disabled = config.clone();
    disabled.disable_delete_repos_on_wrong_shard = true;
    let (janitor, _provider) = build_janitor(disabled, tmp.path(), store.clone());
    janitor.cleanup_repos(&CancelToken::new());
    assert!(tmp.path().join(&name).exists());

    // Deletion enabled and within the per-run limit: removed.
    let (janitor, _provider) = build_janitor(config, tmp.path(), store);
    janitor.cleanup_repos(&CancelToken::new());
    assert!(!tmp.path().join(&name).exists());
}
