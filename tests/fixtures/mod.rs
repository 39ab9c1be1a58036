//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use gitmaint::backend::{
    BackendError, BackendProvider, ConfigAccessor, GitBackend, Maintenance, RepackOptions,
};
use gitmaint::cancel::CancelToken;
use gitmaint::gitdir::GitDir;

/// Creates a repository skeleton under `root/name/.git` and returns its
/// GIT_DIR.
pub fn init_repo(root: &Path, name: &str) -> GitDir {
    let git_dir = root.join(name).join(".git");
    fs::create_dir_all(git_dir.join("objects").join("pack")).expect("create objects/pack");
    fs::create_dir_all(git_dir.join("refs").join("heads")).expect("create refs");
    fs::write(git_dir.join("HEAD"), "ref: refs/heads/main\n").expect("write HEAD");
    GitDir::new(git_dir)
}

/// Writes `count` loose objects with valid hex names, spread over shards.
pub fn write_loose_objects(dir: &GitDir, count: usize) {
    for i in 0..count {
        let shard = dir.objects_dir().join(format!("{:02x}", i % 256));
        fs::create_dir_all(&shard).expect("create shard");
        fs::write(shard.join(format!("{i:038x}")), b"x").expect("write object");
    }
}

pub fn write_ref(dir: &GitDir, rel: &str) {
    let path = dir.refs_dir().join(rel);
    fs::create_dir_all(path.parent().expect("parent")).expect("create ref dir");
    fs::write(path, "0000000000000000000000000000000000000000\n").expect("write ref");
}

#[derive(Default)]
pub struct FakeState {
    pub config: HashMap<String, String>,
    pub calls: Vec<String>,
}

/// Recording backend shared across all repositories a test touches.
#[derive(Clone, Default)]
pub struct FakeBackend {
    pub state: Arc<Mutex<FakeState>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        FakeBackend::default()
    }

    pub fn set_config(&self, key: &str, value: &str) {
        self.state
            .lock()
            .expect("fake lock")
            .config
            .insert(key.to_string(), value.to_string());
    }

    pub fn config_value(&self, key: &str) -> Option<String> {
        self.state.lock().expect("fake lock").config.get(key).cloned()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().expect("fake lock").calls.clone()
    }

    fn record(&self, call: String) {
        self.state.lock().expect("fake lock").calls.push(call);
    }
}

impl ConfigAccessor for FakeBackend {
    fn get(&self, _: &CancelToken, key: &str) -> Result<Option<String>, BackendError> {
        Ok(self.config_value(key))
    }

    fn set(&self, _: &CancelToken, key: &str, value: &str) -> Result<(), BackendError> {
        self.record(format!("config.set {key}={value}"));
        self.set_config(key, value);
        Ok(())
    }

    fn unset(&self, _: &CancelToken, key: &str) -> Result<(), BackendError> {
        self.record(format!("config.unset {key}"));
        self.state.lock().expect("fake lock").config.remove(key);
        Ok(())
    }
}

impl Maintenance for FakeBackend {
    fn pack_objects(&self, _: &CancelToken) -> Result<(), BackendError> {
        self.record("pack_objects".to_string());
        Ok(())
    }

    fn prune_packed(&self, _: &CancelToken) -> Result<(), BackendError> {
        self.record("prune_packed".to_string());
        Ok(())
    }

    fn repack(&self, _: &CancelToken, options: RepackOptions) -> Result<(), BackendError> {
        self.record(format!(
            "repack geometric={} cruft={} midx={} bitmap={}",
            options.geometric, options.cruft, options.write_multi_pack_index, options.write_bitmap
        ));
        Ok(())
    }

    fn prune_objects(&self, _: &CancelToken, _: SystemTime) -> Result<(), BackendError> {
        self.record("prune_objects".to_string());
        Ok(())
    }

    fn pack_refs(&self, _: &CancelToken) -> Result<(), BackendError> {
        self.record("pack_refs".to_string());
        Ok(())
    }

    fn write_commit_graph(&self, _: &CancelToken, replace_chain: bool) -> Result<(), BackendError> {
        self.record(format!("write_commit_graph replace={replace_chain}"));
        Ok(())
    }
}

impl GitBackend for FakeBackend {
    fn config(&self) -> &dyn ConfigAccessor {
        self
    }

    fn maintenance(&self) -> &dyn Maintenance {
        self
    }
}

#[derive(Clone, Default)]
pub struct FakeProvider {
    pub backend: FakeBackend,
}

impl FakeProvider {
    pub fn new() -> Self {
        FakeProvider::default()
    }
}

impl BackendProvider for FakeProvider {
    fn open(&self, _: &GitDir) -> Box<dyn GitBackend> {
        Box::new(self.backend.clone())
    }
}
