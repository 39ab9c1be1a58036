//! Narrow interface to the repository database.
//!
//! The daemon records corruption, clone status and repository sizes; it
//! never reads anything else. Production deployments plug in their database
//! client; [`MemoryStore`] backs tests and single-process setups.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

use thiserror::Error;

use crate::error::Transience;
use crate::gitdir::RepoName;

#[derive(Error, Debug)]
#[error("repository store: {0}")]
pub struct StoreError(pub String);

impl StoreError {
    pub fn transience(&self) -> Transience {
        Transience::Retryable
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloneStatus {
    NotCloned,
    Cloning,
    Cloned,
}

impl CloneStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CloneStatus::NotCloned => "not_cloned",
            CloneStatus::Cloning => "cloning",
            CloneStatus::Cloned => "cloned",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RepoRecord {
    pub name: RepoName,
}

pub trait RepoStore: Send + Sync {
    fn log_corruption(
        &self,
        name: &RepoName,
        reason: &str,
        shard_id: &str,
    ) -> Result<(), StoreError>;

    fn set_clone_status(
        &self,
        name: &RepoName,
        status: CloneStatus,
        shard_id: &str,
    ) -> Result<(), StoreError>;

    /// `Ok(None)` when the repository is unknown or soft-deleted.
    fn get_by_name(&self, name: &RepoName) -> Result<Option<RepoRecord>, StoreError>;

    /// Batched size update; returns the number of rows touched.
    fn update_repo_sizes(
        &self,
        shard_id: &str,
        sizes: &HashMap<RepoName, u64>,
    ) -> Result<usize, StoreError>;
}

/// In-memory store.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryStoreInner>,
}

#[derive(Default)]
struct MemoryStoreInner {
    known: BTreeSet<RepoName>,
    corruption_log: Vec<(RepoName, String)>,
    clone_status: BTreeMap<RepoName, CloneStatus>,
    sizes: BTreeMap<RepoName, u64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    /// Registers a repository as known to the database.
    pub fn insert(&self, name: RepoName) {
        self.inner.lock().expect("store lock").known.insert(name);
    }

    pub fn corruption_log(&self) -> Vec<(RepoName, String)> {
        self.inner.lock().expect("store lock").corruption_log.clone()
    }

    pub fn clone_status(&self, name: &RepoName) -> Option<CloneStatus> {
        self.inner
            .lock()
            .expect("store lock")
            .clone_status
            .get(name)
            .copied()
    }

    pub fn sizes(&self) -> BTreeMap<RepoName, u64> {
        self.inner.lock().expect("store lock").sizes.clone()
    }
}

impl RepoStore for MemoryStore {
    fn log_corruption(
        &self,
        name: &RepoName,
        reason: &str,
        _shard_id: &str,
    ) -> Result<(), StoreError> {
        self.inner
            .lock()
            .expect("store lock")
            .corruption_log
            .push((name.clone(), reason.to_string()));
        Ok(())
    }

    fn set_clone_status(
        &self,
        name: &RepoName,
        status: CloneStatus,
        _shard_id: &str,
    ) -> Result<(), StoreError> {
        self.inner
            .lock()
            .expect("store lock")
            .clone_status
            .insert(name.clone(), status);
        Ok(())
    }

    fn get_by_name(&self, name: &RepoName) -> Result<Option<RepoRecord>, StoreError> {
        let inner = self.inner.lock().expect("store lock");
        Ok(inner.known.contains(name).then(|| RepoRecord {
            name: name.clone(),
        }))
    }

    fn update_repo_sizes(
        &self,
        _shard_id: &str,
        sizes: &HashMap<RepoName, u64>,
    ) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock().expect("store lock");
        for (name, size) in sizes {
            inner.sizes.insert(name.clone(), *size);
        }
        Ok(sizes.len())
    }
}
