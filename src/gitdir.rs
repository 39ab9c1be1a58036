//! Repository identity value types.

use std::fmt;
use std::path::{Path, PathBuf};

/// Name of a repository as known to the database, e.g. `github.com/foo/bar`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RepoName(String);

impl RepoName {
    pub fn new(name: impl Into<String>) -> Self {
        RepoName(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RepoName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RepoName {
    fn from(name: &str) -> Self {
        RepoName(name.to_string())
    }
}

/// Absolute path of a bare repository's `GIT_DIR`.
///
/// All paths into the repository are derived from this value. It carries no
/// ownership semantics; components receive it by value and never cache
/// anything keyed on it beyond a single maintenance pass.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct GitDir(PathBuf);

impl GitDir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        GitDir(path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }

    pub fn join(&self, rel: impl AsRef<Path>) -> PathBuf {
        self.0.join(rel)
    }

    pub fn head_file(&self) -> PathBuf {
        self.join("HEAD")
    }

    pub fn config_file(&self) -> PathBuf {
        self.join("config")
    }

    pub fn info_dir(&self) -> PathBuf {
        self.join("info")
    }

    pub fn objects_dir(&self) -> PathBuf {
        self.join("objects")
    }

    pub fn pack_dir(&self) -> PathBuf {
        self.join("objects").join("pack")
    }

    pub fn objects_info_dir(&self) -> PathBuf {
        self.join("objects").join("info")
    }

    pub fn commit_graph_file(&self) -> PathBuf {
        self.objects_info_dir().join("commit-graph")
    }

    pub fn commit_graphs_dir(&self) -> PathBuf {
        self.objects_info_dir().join("commit-graphs")
    }

    pub fn commit_graph_chain_file(&self) -> PathBuf {
        self.commit_graphs_dir().join("commit-graph-chain")
    }

    pub fn refs_dir(&self) -> PathBuf {
        self.join("refs")
    }

    pub fn packed_refs_file(&self) -> PathBuf {
        self.join("packed-refs")
    }
}

impl fmt::Display for GitDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}
