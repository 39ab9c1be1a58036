//! Packfile directory census.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::time::SystemTime;

use super::{BitmapInfo, MultiPackIndexInfo, StatsError, bitmap_info, multi_pack_index_info};
use crate::gitdir::GitDir;

/// Zero-byte sentinel whose mtime records the last full repack. Repacks are
/// infrequent and too expensive to infer from packfile state alone.
pub const FULL_REPACK_TIMESTAMP_FILENAME: &str = ".full-repack-timestamp";

const MULTI_PACK_INDEX: &str = "multi-pack-index";

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PackfilesInfo {
    /// Number of `*.pack` files, whatever their classification.
    pub count: u64,
    /// Total size of all `*.pack` files in bytes.
    pub size: u64,
    pub reverse_index_count: u64,
    /// Packfiles with a `.mtimes` sidecar, holding unreachable objects.
    pub cruft_count: u64,
    pub cruft_size: u64,
    /// Packfiles with a `.keep` sidecar, never rewritten by repacks.
    pub keep_count: u64,
    pub keep_size: u64,
    /// Files not matching any known git naming convention.
    pub garbage_count: u64,
    pub garbage_size: u64,
    pub bitmap: BitmapInfo,
    pub multi_pack_index: MultiPackIndexInfo,
    pub multi_pack_index_bitmap: BitmapInfo,
    pub last_full_repack: Option<SystemTime>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct PackfileMetadata {
    has_keep: bool,
    has_mtimes: bool,
}

/// Maps every `pack-*` entry to its packfile's sidecar metadata.
///
/// Directory listings return sidecar files in arbitrary order relative to
/// their packfile, so the map is built in full before the census below looks
/// anything up.
fn classify_packfiles(names: &[String]) -> HashMap<String, PackfileMetadata> {
    let mut metadata: HashMap<String, PackfileMetadata> = HashMap::new();

    for name in names {
        if !name.starts_with("pack-") {
            continue;
        }

        let (stem, extension) = match name.rsplit_once('.') {
            Some((stem, extension)) => (stem, extension),
            None => (name.as_str(), ""),
        };

        let entry = metadata.entry(format!("{stem}.pack")).or_default();
        match extension {
            "keep" => entry.has_keep = true,
            "mtimes" => entry.has_mtimes = true,
            _ => {}
        }
    }

    metadata
}

/// Lists `objects/pack/` and classifies every file by naming convention.
///
/// A missing pack directory is an empty census, and files removed while the
/// scan runs (git repacking concurrently) are skipped.
pub fn packfiles_info(dir: &GitDir) -> Result<PackfilesInfo, StatsError> {
    let pack_dir = dir.pack_dir();
    let mut info = PackfilesInfo::default();

    let mut names: Vec<String> = Vec::new();
    match fs::read_dir(&pack_dir) {
        Ok(entries) => {
            for entry in entries {
                let entry = entry.map_err(StatsError::Packfiles)?;
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(StatsError::Packfiles(err)),
    }

    let packfile_metadata = classify_packfiles(&names);

    for name in &names {
        let path = pack_dir.join(name);
        let file_metadata = match fs::metadata(&path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => return Err(StatsError::Packfiles(err)),
        };
        let size = file_metadata.len();

        if name.starts_with("pack-") {
            if name.ends_with(".pack") {
                info.count += 1;
                info.size += size;

                let sidecars = packfile_metadata.get(name).copied().unwrap_or_default();
                if sidecars.has_keep {
                    info.keep_count += 1;
                    info.keep_size += size;
                }
                if sidecars.has_mtimes {
                    info.cruft_count += 1;
                    info.cruft_size += size;
                }
            } else if name.ends_with(".idx") {
                // One per packfile; nothing separate to report.
            } else if name.ends_with(".rev") {
                info.reverse_index_count += 1;
            } else if name.ends_with(".keep") || name.ends_with(".mtimes") {
                // Accounted for via their packfile in the metadata map.
            } else if name.ends_with(".bitmap") {
                match bitmap_info(&path) {
                    Ok(bitmap) => info.bitmap = bitmap,
                    Err(StatsError::BitmapOpen(err))
                        if err.kind() == io::ErrorKind::NotFound => {}
                    Err(err) => return Err(err),
                }
            } else {
                info.garbage_count += 1;
                info.garbage_size += size;
            }
        } else if name == MULTI_PACK_INDEX {
            match multi_pack_index_info(&path) {
                Ok(midx) => info.multi_pack_index = midx,
                Err(StatsError::MidxOpen(err)) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err),
            }
        } else if name.starts_with("multi-pack-index-") && name.ends_with(".bitmap") {
            match bitmap_info(&path) {
                Ok(bitmap) => info.multi_pack_index_bitmap = bitmap,
                Err(StatsError::BitmapOpen(err)) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err),
            }
        } else {
            info.garbage_count += 1;
            info.garbage_size += size;
        }
    }

    info.last_full_repack = full_repack_timestamp(dir)?;

    Ok(info)
}

/// Reads the last-full-repack time from the sentinel's mtime.
///
/// Reading never mutates the sentinel; a missing file means no full repack
/// has been recorded yet.
pub fn full_repack_timestamp(dir: &GitDir) -> Result<Option<SystemTime>, StatsError> {
    match fs::metadata(dir.join(FULL_REPACK_TIMESTAMP_FILENAME)) {
        Ok(metadata) => Ok(Some(
            metadata
                .modified()
                .map_err(StatsError::RepackTimestampRead)?,
        )),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(StatsError::RepackTimestampRead(err)),
    }
}

/// Records `timestamp` as the last full repack, creating the sentinel if
/// needed. Moving the timestamp backwards is allowed.
pub fn update_full_repack_timestamp(dir: &GitDir, timestamp: SystemTime) -> Result<(), StatsError> {
    let path = dir.join(FULL_REPACK_TIMESTAMP_FILENAME);
    let file = fs::File::options()
        .create(true)
        .write(true)
        .open(&path)
        .map_err(StatsError::RepackTimestampWrite)?;
    file.set_modified(timestamp)
        .map_err(StatsError::RepackTimestampWrite)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::time::Duration;

    fn classify(names: &[&str]) -> HashMap<String, PackfileMetadata> {
        let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
        classify_packfiles(&names)
    }

    fn write_pack_file(dir: &Path, name: &str, contents: &[u8]) {
        let pack_dir = dir.join("objects").join("pack");
        fs::create_dir_all(&pack_dir).expect("create pack dir");
        fs::write(pack_dir.join(name), contents).expect("write pack entry");
    }

    #[test]
    fn classify_ignores_unrelated_entries() {
        assert!(classify(&[]).is_empty());
        assert!(classify(&["something something"]).is_empty());
    }

    #[test]
    fn classify_maps_sidecars_to_their_packfile() {
        let metadata = classify(&[
            "pack-1.pack",
            "pack-1.keep",
            "pack-2.pack",
            "pack-2.mtimes",
            "pack-3.pack",
            "pack-3.idx",
            "pack-4.idx",
            "garbage",
        ]);

        assert_eq!(metadata.len(), 4);
        assert_eq!(
            metadata["pack-1.pack"],
            PackfileMetadata {
                has_keep: true,
                has_mtimes: false,
            }
        );
        assert_eq!(
            metadata["pack-2.pack"],
            PackfileMetadata {
                has_keep: false,
                has_mtimes: true,
            }
        );
        assert_eq!(metadata["pack-3.pack"], PackfileMetadata::default());
        // An index without its packfile still yields an entry.
        assert_eq!(metadata["pack-4.pack"], PackfileMetadata::default());
    }

    #[test]
    fn classify_handles_sidecars_listed_before_the_packfile() {
        let metadata = classify(&["pack-5678.keep", "pack-5678.mtimes", "pack-5678.pack"]);
        assert_eq!(
            metadata["pack-5678.pack"],
            PackfileMetadata {
                has_keep: true,
                has_mtimes: true,
            }
        );
    }

    #[test]
    fn empty_repository_yields_zeroes() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let info = packfiles_info(&GitDir::new(tmp.path())).expect("info");
        assert_eq!(info, PackfilesInfo::default());
    }

    #[test]
    fn counts_packfiles_and_sidecar_classes() {
        let tmp = tempfile::tempdir().expect("tempdir");
        write_pack_file(tmp.path(), "pack-foo.pack", b"foobar");
        write_pack_file(tmp.path(), "pack-foo.idx", b"xx");
        write_pack_file(tmp.path(), "pack-foo.rev", b"xx");
        write_pack_file(tmp.path(), "pack-bar.pack", b"123");
        write_pack_file(tmp.path(), "pack-bar.keep", b"");
        write_pack_file(tmp.path(), "pack-baz.pack", b"12");
        write_pack_file(tmp.path(), "pack-baz.mtimes", b"m");
        write_pack_file(tmp.path(), "garbage", b"1");

        let info = packfiles_info(&GitDir::new(tmp.path())).expect("info");
        assert_eq!(info.count, 3);
        assert_eq!(info.size, 11);
        assert_eq!(info.reverse_index_count, 1);
        assert_eq!(info.keep_count, 1);
        assert_eq!(info.keep_size, 3);
        assert_eq!(info.cruft_count, 1);
        assert_eq!(info.cruft_size, 2);
        assert_eq!(info.garbage_count, 1);
        assert_eq!(info.garbage_size, 1);
    }

    #[test]
    fn parses_bitmaps_and_multi_pack_index() {
        let tmp = tempfile::tempdir().expect("tempdir");
        write_pack_file(tmp.path(), "pack-a.pack", b"p");
        write_pack_file(
            tmp.path(),
            "pack-a.bitmap",
            &[b'B', b'I', b'T', b'M', 0, 1, 0, 0x4],
        );
        write_pack_file(
            tmp.path(),
            "multi-pack-index",
            &[b'M', b'I', b'D', b'X', 1, 1, 0, 0, 0, 0, 0, 2],
        );
        write_pack_file(
            tmp.path(),
            "multi-pack-index-abc.bitmap",
            &[b'B', b'I', b'T', b'M', 0, 1, 0, 0x10],
        );

        let info = packfiles_info(&GitDir::new(tmp.path())).expect("info");
        assert!(info.bitmap.exists);
        assert!(info.bitmap.has_hash_cache);
        assert!(!info.bitmap.has_lookup_table);
        assert!(info.multi_pack_index.exists);
        assert_eq!(info.multi_pack_index.packfile_count, 2);
        assert!(info.multi_pack_index_bitmap.exists);
        assert!(info.multi_pack_index_bitmap.has_lookup_table);
        assert_eq!(info.garbage_count, 0);
    }

    #[test]
    fn malformed_bitmap_fails_the_census() {
        let tmp = tempfile::tempdir().expect("tempdir");
        write_pack_file(tmp.path(), "pack-a.bitmap", &[b'B', b'I', b'T', b'O', 0, 1, 0, 0]);

        assert!(matches!(
            packfiles_info(&GitDir::new(tmp.path())),
            Err(StatsError::BitmapSignature(_))
        ));
    }

    #[test]
    fn repack_timestamp_roundtrips_without_mutation_on_read() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = GitDir::new(tmp.path());

        assert_eq!(full_repack_timestamp(&dir).expect("read"), None);

        let t1 = SystemTime::UNIX_EPOCH + Duration::from_secs(946_684_800);
        update_full_repack_timestamp(&dir, t1).expect("update");
        assert_eq!(full_repack_timestamp(&dir).expect("read"), Some(t1));
        // Repeated reads must not shift the value.
        assert_eq!(full_repack_timestamp(&dir).expect("read"), Some(t1));

        // The timestamp may move backwards as well as forwards.
        let earlier = t1 - Duration::from_secs(86_400);
        update_full_repack_timestamp(&dir, earlier).expect("update");
        assert_eq!(full_repack_timestamp(&dir).expect("read"), Some(earlier));

        let later = t1 + Duration::from_secs(86_400);
        update_full_repack_timestamp(&dir, later).expect("update");
        assert_eq!(full_repack_timestamp(&dir).expect("read"), Some(later));
    }
}
