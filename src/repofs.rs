//! Filesystem access to the repository corpus.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::debug;

use crate::gitdir::{GitDir, RepoName};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DiskUsage {
    pub total_bytes: u64,
    pub free_bytes: u64,
}

impl DiskUsage {
    pub fn percent_free(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        self.free_bytes as f64 / self.total_bytes as f64 * 100.0
    }
}

pub trait Fs: Send + Sync {
    /// Calls `visit` for every repository on disk until it returns true.
    fn for_each_repo(
        &self,
        visit: &mut dyn FnMut(&RepoName, &GitDir) -> bool,
    ) -> Result<(), io::Error>;

    fn remove_repo(&self, name: &RepoName) -> Result<(), io::Error>;

    fn disk_usage(&self) -> Result<DiskUsage, io::Error>;
}

/// Repositories laid out under a root directory as `<name>/.git`.
pub struct LocalFs {
    repos_dir: PathBuf,
}

impl LocalFs {
    pub fn new(repos_dir: impl Into<PathBuf>) -> Self {
        LocalFs {
            repos_dir: repos_dir.into(),
        }
    }

    pub fn repos_dir(&self) -> &Path {
        &self.repos_dir
    }

    pub fn dir_for(&self, name: &RepoName) -> GitDir {
        GitDir::new(self.repos_dir.join(name.as_str()).join(".git"))
    }
}

impl Fs for LocalFs {
    /// Best-effort depth-first walk: directories that disappear or deny
    /// access are skipped so one broken entry never hides the rest of the
    /// corpus. Entries are visited in sorted order for determinism.
    fn for_each_repo(
        &self,
        visit: &mut dyn FnMut(&RepoName, &GitDir) -> bool,
    ) -> Result<(), io::Error> {
        let mut pending = vec![self.repos_dir.clone()];

        while let Some(path) = pending.pop() {
            let entries = match fs::read_dir(&path) {
                Ok(entries) => entries,
                Err(err) if path == self.repos_dir => return Err(err),
                Err(err) => {
                    debug!(path = %path.display(), error = %err, "skipping unreadable directory");
                    continue;
                }
            };

            let mut subdirs = Vec::new();
            for entry in entries {
                let Ok(entry) = entry else { continue };
                let Ok(file_type) = entry.file_type() else {
                    continue;
                };
                if !file_type.is_dir() {
                    continue;
                }

                if entry.file_name() == ".git" {
                    let repo_root = path.clone();
                    let name = match repo_root.strip_prefix(&self.repos_dir) {
                        Ok(rel) => RepoName::new(rel.to_string_lossy().into_owned()),
                        Err(_) => continue,
                    };
                    let dir = GitDir::new(entry.path());
                    if visit(&name, &dir) {
                        return Ok(());
                    }
                    // A GIT_DIR has no nested repositories.
                    subdirs.clear();
                    break;
                }
                subdirs.push(entry.path());
            }

            subdirs.sort();
            // Reverse so the stack pops in sorted order.
            for subdir in subdirs.into_iter().rev() {
                pending.push(subdir);
            }
        }

        Ok(())
    }

    fn remove_repo(&self, name: &RepoName) -> Result<(), io::Error> {
        match fs::remove_dir_all(self.repos_dir.join(name.as_str())) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn disk_usage(&self) -> Result<DiskUsage, io::Error> {
        let stat = nix::sys::statvfs::statvfs(&self.repos_dir)
            .map_err(|errno| io::Error::from_raw_os_error(errno as i32))?;
        let fragment = stat.fragment_size() as u64;
        Ok(DiskUsage {
            total_bytes: stat.blocks() as u64 * fragment,
            free_bytes: stat.blocks_available() as u64 * fragment,
        })
    }
}

/// Recursively sums file sizes under `path`. Missing or unreadable entries
/// count as zero; live git activity makes both routine.
pub fn dir_size(path: &Path) -> u64 {
    let mut total = 0u64;
    let mut pending = vec![path.to_path_buf()];

    while let Some(path) = pending.pop() {
        let Ok(entries) = fs::read_dir(&path) else {
            continue;
        };
        for entry in entries {
            let Ok(entry) = entry else { continue };
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            if metadata.is_dir() {
                pending.push(entry.path());
            } else {
                total += metadata.len();
            }
        }
    }

    total
}

/// Approximates when a repository was last written: both cloning and
/// fetching rewrite `HEAD`.
pub fn repo_mod_time(dir: &GitDir) -> Result<SystemTime, io::Error> {
    fs::metadata(dir.head_file())?.modified()
}
