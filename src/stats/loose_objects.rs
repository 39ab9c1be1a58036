//! Loose-object shard census.

use std::fs;
use std::io;
use std::time::SystemTime;

use super::StatsError;
use crate::gitdir::GitDir;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LooseObjectsInfo {
    /// Number of valid loose objects, stale ones included.
    pub count: u64,
    /// Total size of valid loose objects in bytes, stale ones included.
    pub size: u64,
    /// Objects whose mtime is strictly before the caller-supplied cutoff.
    pub stale_count: u64,
    pub stale_size: u64,
    /// Entries whose name is not made of lowercase hex characters.
    pub garbage_count: u64,
    pub garbage_size: u64,
}

/// True iff every byte of `name` is a lowercase hex digit.
///
/// Git names loose objects by their object ID, so the length depends on the
/// hash algorithm in use; only checking the alphabet keeps this working for
/// both SHA-1 and SHA-256 repositories.
pub fn is_valid_loose_object_name(name: &[u8]) -> bool {
    name.iter()
        .all(|byte| matches!(byte, b'0'..=b'9' | b'a'..=b'f'))
}

/// Walks the 256 two-hex-digit object shards and classifies every entry.
///
/// Missing shard directories are skipped, as are files removed while the
/// scan is running.
pub fn loose_objects_info(dir: &GitDir, cutoff: SystemTime) -> Result<LooseObjectsInfo, StatsError> {
    let objects_dir = dir.objects_dir();
    let mut info = LooseObjectsInfo::default();

    for shard in 0u16..256 {
        let shard_path = objects_dir.join(format!("{shard:02x}"));
        let entries = match fs::read_dir(&shard_path) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => return Err(StatsError::LooseObjects(err)),
        };

        for entry in entries {
            let entry = entry.map_err(StatsError::LooseObjects)?;
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(StatsError::LooseObjects(err)),
            };
            if metadata.is_dir() {
                continue;
            }

            let name = entry.file_name();
            let size = metadata.len();

            if !is_valid_loose_object_name(name.as_encoded_bytes()) {
                info.garbage_count += 1;
                info.garbage_size += size;
                continue;
            }

            info.count += 1;
            info.size += size;

            let mtime = metadata.modified().map_err(StatsError::LooseObjects)?;
            if mtime < cutoff {
                info.stale_count += 1;
                info.stale_size += size;
            }
        }
    }

    Ok(info)
}
