//! Reference census for the files reference backend.

use std::fs;
use std::io;

use super::StatsError;
use crate::gitdir::GitDir;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReferencesInfo {
    pub loose_references_count: u64,
    pub packed_references_size: u64,
}

/// Counts loose reference files under `refs/` and sizes `packed-refs`.
pub fn references_info(dir: &GitDir) -> Result<ReferencesInfo, StatsError> {
    let mut info = ReferencesInfo::default();

    let mut pending = vec![dir.refs_dir()];
    while let Some(path) = pending.pop() {
        let entries = match fs::read_dir(&path) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => return Err(StatsError::References(err)),
        };

        for entry in entries {
            let entry = entry.map_err(StatsError::References)?;
            let file_type = match entry.file_type() {
                Ok(file_type) => file_type,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(StatsError::References(err)),
            };
            if file_type.is_dir() {
                pending.push(entry.path());
            } else {
                info.loose_references_count += 1;
            }
        }
    }

    match fs::metadata(dir.packed_refs_file()) {
        Ok(metadata) => info.packed_references_size = metadata.len(),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(StatsError::References(err)),
    }

    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn write_ref(root: &Path, rel: &str) {
        let path = root.join("refs").join(rel);
        fs::create_dir_all(path.parent().expect("parent")).expect("create ref dir");
        fs::write(path, "0000000000000000000000000000000000000000\n").expect("write ref");
    }

    #[test]
    fn empty_repository_yields_zeroes() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let info = references_info(&GitDir::new(tmp.path())).expect("info");
        assert_eq!(info, ReferencesInfo::default());
    }

    #[test]
    fn counts_nested_loose_references() {
        let tmp = tempfile::tempdir().expect("tempdir");
        write_ref(tmp.path(), "heads/main");
        write_ref(tmp.path(), "something");
        write_ref(tmp.path(), "merge-requests/1/HEAD");

        let info = references_info(&GitDir::new(tmp.path())).expect("info");
        assert_eq!(info.loose_references_count, 3);
        assert_eq!(info.packed_references_size, 0);
    }

    #[test]
    fn sizes_packed_refs() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(tmp.path().join("packed-refs"), "content").expect("write packed-refs");

        let info = references_info(&GitDir::new(tmp.path())).expect("info");
        assert_eq!(info.loose_references_count, 0);
        assert_eq!(info.packed_references_size, 7);
    }
}
