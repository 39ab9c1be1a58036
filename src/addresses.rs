//! Shard-ownership checks.
//!
//! Each daemon instance owns the repositories that hash to its own address.
//! Repositories found on the wrong shard are counted and, within limits,
//! deleted by the janitor.

use crate::gitdir::RepoName;
use crate::jitter::fnv1_64;

/// The live list of gitserver shard addresses.
#[derive(Clone, Debug, Default)]
pub struct GitserverAddresses {
    pub addresses: Vec<String>,
}

impl GitserverAddresses {
    pub fn new(addresses: Vec<String>) -> Self {
        GitserverAddresses { addresses }
    }

    /// Deterministically assigns a repository to one shard address, or
    /// `None` when no addresses are configured.
    pub fn addr_for_repo(&self, name: &RepoName) -> Option<&str> {
        if self.addresses.is_empty() {
            return None;
        }
        let index = fnv1_64(name.as_str().as_bytes()) % self.addresses.len() as u64;
        Some(&self.addresses[index as usize])
    }

    /// Whether `shard_id` names one of the known shards. An unrecognized
    /// shard must never delete repositories for being "on the wrong shard".
    pub fn contains(&self, shard_id: &str) -> bool {
        self.addresses
            .iter()
            .any(|addr| hostname_match(shard_id, addr))
    }
}

/// True when `addr` refers to the host named `shard_id`: either exactly, or
/// with a domain suffix or port appended.
pub fn hostname_match(shard_id: &str, addr: &str) -> bool {
    if shard_id.is_empty() || !addr.starts_with(shard_id) {
        return false;
    }
    if addr.len() == shard_id.len() {
        return true;
    }
    matches!(addr.as_bytes()[shard_id.len()], b'.' | b':')
}
