//! External git execution backend.
//!
//! Maintenance work mutates repositories exclusively through these traits.
//! The production implementation spawns the `git` binary; git's own
//! filesystem locking keeps that safe against concurrent invocations from
//! the live query path. Tests substitute recording fakes.

use std::io::{self, Read};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;

use crate::cancel::CancelToken;
use crate::error::Transience;
use crate::gitdir::GitDir;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BackendError {
    #[error("spawning git {args:?}: {source}")]
    Spawn {
        args: Vec<String>,
        #[source]
        source: io::Error,
    },

    #[error("waiting for git {args:?}: {source}")]
    Wait {
        args: Vec<String>,
        #[source]
        source: io::Error,
    },

    #[error("git {args:?} exited with {code:?}: {stderr}")]
    Failed {
        args: Vec<String>,
        code: Option<i32>,
        stderr: String,
    },

    #[error("git {args:?} canceled")]
    Canceled { args: Vec<String> },
}

impl BackendError {
    pub fn transience(&self) -> Transience {
        match self {
            // Contention on git's own locks clears up by the next pass.
            BackendError::Canceled { .. } | BackendError::Failed { .. } => Transience::Retryable,
            BackendError::Spawn { .. } | BackendError::Wait { .. } => Transience::Unknown,
        }
    }
}

/// Options for a `git repack` invocation.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RepackOptions {
    pub cruft: bool,
    /// Cruft objects last seen before this time are dropped.
    pub cruft_expiration: Option<SystemTime>,
    pub delete_loose: bool,
    pub local: bool,
    pub geometric: bool,
    pub write_multi_pack_index: bool,
    pub write_bitmap: bool,
}

/// Read/write access to one repository's git config.
pub trait ConfigAccessor {
    /// Returns `None` when the key is unset.
    fn get(&self, token: &CancelToken, key: &str) -> Result<Option<String>, BackendError>;
    fn set(&self, token: &CancelToken, key: &str, value: &str) -> Result<(), BackendError>;
    /// Unsetting a key that is not set is not an error.
    fn unset(&self, token: &CancelToken, key: &str) -> Result<(), BackendError>;
}

/// The expensive repository-mutating operations.
pub trait Maintenance {
    /// Packs all loose objects regardless of reachability; no graph walk.
    fn pack_objects(&self, token: &CancelToken) -> Result<(), BackendError>;
    /// Deletes loose objects that already exist in a packfile.
    fn prune_packed(&self, token: &CancelToken) -> Result<(), BackendError>;
    fn repack(&self, token: &CancelToken, options: RepackOptions) -> Result<(), BackendError>;
    /// Removes unreachable loose objects older than `expire_before`.
    fn prune_objects(
        &self,
        token: &CancelToken,
        expire_before: SystemTime,
    ) -> Result<(), BackendError>;
    fn pack_refs(&self, token: &CancelToken) -> Result<(), BackendError>;
    fn write_commit_graph(
        &self,
        token: &CancelToken,
        replace_chain: bool,
    ) -> Result<(), BackendError>;
}

pub trait GitBackend: Send + Sync {
    fn config(&self) -> &dyn ConfigAccessor;
    fn maintenance(&self) -> &dyn Maintenance;

    /// True only when the repository is positively known to not be bare.
    ///
    /// Lock files can make the check fail transiently; we only want stable
    /// positives here, so failures and bare repositories both report false.
    fn is_non_bare_best_effort(&self, _token: &CancelToken) -> bool {
        false
    }
}

/// Opens a backend for one repository. The janitor walks thousands of
/// repositories per pass, so backends are constructed per `GitDir` rather
/// than held open.
pub trait BackendProvider: Send + Sync {
    fn open(&self, dir: &GitDir) -> Box<dyn GitBackend>;
}

/// Production backend spawning the `git` binary.
#[derive(Clone, Debug)]
pub struct GitCli {
    git_dir: GitDir,
    git_binary: PathBuf,
}

/// How often a running git subprocess is polled for completion and
/// cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

struct CommandOutput {
    stdout: String,
}

impl GitCli {
    pub fn new(git_dir: GitDir) -> Self {
        GitCli {
            git_dir,
            git_binary: PathBuf::from("git"),
        }
    }

    pub fn with_binary(git_dir: GitDir, git_binary: impl Into<PathBuf>) -> Self {
        GitCli {
            git_dir,
            git_binary: git_binary.into(),
        }
    }

    fn run(&self, token: &CancelToken, args: &[&str]) -> Result<CommandOutput, BackendError> {
        let owned_args: Vec<String> = args.iter().map(|arg| arg.to_string()).collect();

        let mut command = Command::new(&self.git_binary);
        command
            .arg("-C")
            .arg(self.git_dir.path())
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|source| BackendError::Spawn {
            args: owned_args.clone(),
            source,
        })?;

        // Drain the pipes from separate threads so a chatty subprocess can
        // never block on a full pipe while we poll for completion.
        let stdout_reader = child.stdout.take().map(|mut stdout| {
            std::thread::spawn(move || {
                let mut buffer = String::new();
                let _ = stdout.read_to_string(&mut buffer);
                buffer
            })
        });
        let stderr_reader = child.stderr.take().map(|mut stderr| {
            std::thread::spawn(move || {
                let mut buffer = String::new();
                let _ = stderr.read_to_string(&mut buffer);
                buffer
            })
        });

        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if token.is_cancelled() {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(BackendError::Canceled { args: owned_args });
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(source) => {
                    let _ = child.kill();
                    return Err(BackendError::Wait {
                        args: owned_args,
                        source,
                    });
                }
            }
        };

        let stdout = stdout_reader
            .map(|reader| reader.join().unwrap_or_default())
            .unwrap_or_default();
        let stderr = stderr_reader
            .map(|reader| reader.join().unwrap_or_default())
            .unwrap_or_default();

        if !status.success() {
            return Err(BackendError::Failed {
                args: owned_args,
                code: status.code(),
                stderr: stderr.trim().to_string(),
            });
        }

        Ok(CommandOutput { stdout })
    }
}

/// Formats a timestamp the way git's date parser expects.
fn git_time(time: SystemTime) -> String {
    let secs = time
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0);
    format!("@{secs}")
}

impl ConfigAccessor for GitCli {
    fn get(&self, token: &CancelToken, key: &str) -> Result<Option<String>, BackendError> {
        match self.run(token, &["config", "--get", key]) {
            Ok(output) => Ok(Some(output.stdout.trim().to_string())),
            // Exit code 1: the key is not set.
            Err(BackendError::Failed { code: Some(1), .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn set(&self, token: &CancelToken, key: &str, value: &str) -> Result<(), BackendError> {
        self.run(token, &["config", key, value]).map(|_| ())
    }

    fn unset(&self, token: &CancelToken, key: &str) -> Result<(), BackendError> {
        match self.run(token, &["config", "--unset-all", key]) {
            Ok(_) => Ok(()),
            // Exit code 5: the key was not set to begin with.
            Err(BackendError::Failed { code: Some(5), .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

impl Maintenance for GitCli {
    fn pack_objects(&self, token: &CancelToken) -> Result<(), BackendError> {
        self.run(
            token,
            &[
                "pack-objects",
                "--all",
                "--pack-loose-unreachable",
                "--honor-pack-keep",
                "--local",
                "--incremental",
                "--quiet",
                "objects/pack/pack",
            ],
        )
        .map(|_| ())
    }

    fn prune_packed(&self, token: &CancelToken) -> Result<(), BackendError> {
        self.run(token, &["prune-packed", "-q"]).map(|_| ())
    }

    fn repack(&self, token: &CancelToken, options: RepackOptions) -> Result<(), BackendError> {
        let mut args: Vec<String> = vec!["repack".to_string()];

        if options.cruft {
            args.push("--cruft".to_string());
            if let Some(expiration) = options.cruft_expiration {
                args.push(format!("--cruft-expiration={}", git_time(expiration)));
            }
            args.push("-a".to_string());
        }
        if options.geometric {
            args.push("--geometric=2".to_string());
        }
        if options.delete_loose {
            args.push("-d".to_string());
        }
        if options.local {
            args.push("-l".to_string());
        }
        if options.write_multi_pack_index {
            args.push("--write-midx".to_string());
        }
        if options.write_bitmap {
            args.push("--write-bitmap-index".to_string());
        } else {
            args.push("--no-write-bitmap-index".to_string());
        }

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run(token, &arg_refs).map(|_| ())
    }

    fn prune_objects(
        &self,
        token: &CancelToken,
        expire_before: SystemTime,
    ) -> Result<(), BackendError> {
        let expire = git_time(expire_before);
        self.run(token, &["prune", "--expire", &expire]).map(|_| ())
    }

    fn pack_refs(&self, token: &CancelToken) -> Result<(), BackendError> {
        self.run(token, &["pack-refs", "--all", "--prune"])
            .map(|_| ())
    }

    fn write_commit_graph(
        &self,
        token: &CancelToken,
        replace_chain: bool,
    ) -> Result<(), BackendError> {
        let split = if replace_chain {
            "--split=replace"
        } else {
            "--split"
        };
        self.run(
            token,
            &[
                "commit-graph",
                "write",
                "--reachable",
                "--changed-paths",
                "--size-multiple=4",
                split,
            ],
        )
        .map(|_| ())
    }
}

impl GitBackend for GitCli {
    fn config(&self) -> &dyn ConfigAccessor {
        self
    }

    fn maintenance(&self) -> &dyn Maintenance {
        self
    }

    fn is_non_bare_best_effort(&self, token: &CancelToken) -> bool {
        match self.run(token, &["rev-parse", "--is-bare-repository"]) {
            Ok(output) => output.stdout.trim() == "false",
            Err(_) => false,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct GitCliProvider {
    git_binary: Option<PathBuf>,
}

impl GitCliProvider {
    pub fn new() -> Self {
        GitCliProvider::default()
    }

    pub fn with_binary(git_binary: impl Into<PathBuf>) -> Self {
        GitCliProvider {
            git_binary: Some(git_binary.into()),
        }
    }
}

impl BackendProvider for GitCliProvider {
    fn open(&self, dir: &GitDir) -> Box<dyn GitBackend> {
        match &self.git_binary {
            Some(binary) => Box::new(GitCli::with_binary(dir.clone(), binary.clone())),
            None => Box::new(GitCli::new(dir.clone())),
        }
    }
}
