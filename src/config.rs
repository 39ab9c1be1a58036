//! Config loading and persistence.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("writing {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Who is responsible for garbage collection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GcMode {
    /// Leave `gc.auto` unset and let git collect on its own.
    Git,
    /// The daemon owns maintenance; `gc.auto` is pinned to 0 so concurrent
    /// git-gc runs can't race our repacks.
    #[default]
    Daemon,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root directory the repository corpus lives under.
    pub repos_dir: PathBuf,
    /// Identity of this shard within the fleet; defaults to the hostname.
    pub shard_id: String,
    /// Addresses of every shard, used for ownership checks.
    pub addresses: Vec<String>,

    pub janitor_interval_secs: u64,
    pub optimize_interval_secs: u64,
    /// Worker-pool width of the optimizer loop. Must be at least 1.
    pub optimize_concurrency: usize,
    /// Per-repository deadline within one optimizer pass.
    pub optimize_timeout_secs: u64,
    /// Upper bound for long-running git commands; interrupted-fetch debris
    /// older than twice this is swept.
    pub long_command_timeout_secs: u64,

    /// Disk-pressure eviction target; eviction runs only when enabled.
    pub desired_percent_free: u8,
    pub evict_on_disk_pressure: bool,

    /// Wrong-shard repositories deleted per janitor run; zero or negative
    /// disables deletion.
    pub wrong_shard_delete_limit: i64,
    /// Failed maintenance runs tolerated before a repository is recloned;
    /// negative disables reclone-on-failure.
    pub sgm_retries: i64,

    pub gc_mode: GcMode,
    pub disable_auto_git_updates: bool,
    pub disable_delete_repos_on_wrong_shard: bool,
    /// Opt-in: delete repositories the database no longer knows about.
    pub remove_non_existing_repos: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            repos_dir: PathBuf::from("/data/repos"),
            shard_id: default_shard_id(),
            addresses: Vec::new(),
            janitor_interval_secs: 60 * 60,
            optimize_interval_secs: 60,
            optimize_concurrency: 1,
            optimize_timeout_secs: 2 * 60 * 60,
            long_command_timeout_secs: 60 * 60,
            desired_percent_free: 10,
            evict_on_disk_pressure: false,
            wrong_shard_delete_limit: 10,
            sgm_retries: 3,
            gc_mode: GcMode::default(),
            disable_auto_git_updates: false,
            disable_delete_repos_on_wrong_shard: false,
            remove_non_existing_repos: false,
        }
    }
}

fn default_shard_id() -> String {
    whoami::fallible::hostname().unwrap_or_else(|_| "unknown".to_string())
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Loads `path` when given, falling back to defaults (with a warning)
    /// when the file is missing or malformed. Environment overrides apply
    /// on top either way.
    pub fn load_or_default(path: Option<&Path>) -> Config {
        let mut config = match path {
            Some(path) => match Config::load(path) {
                Ok(config) => config,
                Err(err) => {
                    tracing::warn!("config load failed, using defaults: {err}");
                    Config::default()
                }
            },
            None => Config::default(),
        };
        config.apply_env();
        config
    }

    /// Applies `GITMAINT_*` environment overrides for the deployment knobs
    /// that are commonly set per-shard rather than in the config file.
    pub fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var("GITMAINT_REPOS_DIR")
            && !dir.trim().is_empty()
        {
            self.repos_dir = PathBuf::from(dir);
        }
        if let Ok(shard) = std::env::var("GITMAINT_SHARD_ID")
            && !shard.trim().is_empty()
        {
            self.shard_id = shard;
        }
        if let Some(value) = env_bool("GITMAINT_REMOVE_NON_EXISTING_REPOS") {
            self.remove_non_existing_repos = value;
        }
        if let Some(value) = env_bool("GITMAINT_DISABLE_AUTO_GIT_UPDATES") {
            self.disable_auto_git_updates = value;
        }
        if let Some(value) = env_bool("GITMAINT_DISABLE_DELETE_REPOS_ON_WRONG_SHARD") {
            self.disable_delete_repos_on_wrong_shard = value;
        }
        if let Some(value) = env_i64("GITMAINT_WRONG_SHARD_DELETE_LIMIT") {
            self.wrong_shard_delete_limit = value;
        }
        if let Some(value) = env_i64("GITMAINT_SGM_RETRIES") {
            self.sgm_retries = value;
        }
    }

    pub fn write(&self, path: &Path) -> Result<(), ConfigError> {
        let write_err = |source: io::Error| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(write_err)?;
        }
        let contents = toml::to_string_pretty(self)
            .map_err(|err| write_err(io::Error::other(err.to_string())))?;

        // Atomic replace so a crashed write never leaves a torn config.
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let temp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
        fs::write(temp.path(), contents.as_bytes()).map_err(write_err)?;
        temp.persist(path)
            .map_err(|err| write_err(err.error))?;
        Ok(())
    }

    pub fn janitor_interval(&self) -> Duration {
        Duration::from_secs(self.janitor_interval_secs)
    }

    pub fn optimize_interval(&self) -> Duration {
        Duration::from_secs(self.optimize_interval_secs)
    }

    pub fn optimize_timeout(&self) -> Duration {
        Duration::from_secs(self.optimize_timeout_secs)
    }

    pub fn long_command_timeout(&self) -> Duration {
        Duration::from_secs(self.long_command_timeout_secs)
    }
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key).ok()?.trim().parse().ok()
}

fn env_i64(key: &str) -> Option<i64> {
    std::env::var(key).ok()?.trim().parse().ok()
}
