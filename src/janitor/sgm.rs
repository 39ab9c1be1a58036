//! Maintenance failure log bookkeeping.
//!
//! A failed maintenance run leaves `sgm.log` in the repository. The file
//! carries a human-readable header, a `failed=<n>` retry counter and the
//! last error message; the reclone heuristic reads the counter back to
//! decide when a repository has failed maintenance too often to keep.

use std::fs;
use std::io;
use std::path::PathBuf;

use crate::gitdir::GitDir;

pub const MAINTENANCE_LOG_FILENAME: &str = "sgm.log";

const FAILED_PREFIX: &str = "failed=";

const LOG_HEADER: &str = "\
DO NOT EDIT: generated by gitmaintd.
This file records the number of failed maintenance runs and the last error
message. The failure count is compared against the configured retry limit
to decide whether a repository should be recloned.";

pub fn log_path(dir: &GitDir) -> PathBuf {
    dir.join(MAINTENANCE_LOG_FILENAME)
}

/// Number of consecutive failed maintenance runs. Missing or unparsable
/// logs count as zero.
pub fn read_failure_count(dir: &GitDir) -> i64 {
    match fs::read_to_string(log_path(dir)) {
        Ok(contents) => parse_failure_count(&contents),
        Err(_) => 0,
    }
}

pub(crate) fn parse_failure_count(contents: &str) -> i64 {
    let Some(start) = contents.find(FAILED_PREFIX) else {
        return 0;
    };
    let rest = &contents[start + FAILED_PREFIX.len()..];
    let line = rest.split('\n').next().unwrap_or(rest);
    line.trim().parse().unwrap_or(0)
}

/// Returns the log contents when present and non-empty.
pub fn read_log(dir: &GitDir) -> Option<String> {
    match fs::read_to_string(log_path(dir)) {
        Ok(contents) if !contents.trim().is_empty() => Some(contents.trim().to_string()),
        _ => None,
    }
}

/// Records a failed maintenance run, bumping the retry counter.
pub fn write_failure(dir: &GitDir, message: &str) -> io::Result<()> {
    let failed = read_failure_count(dir) + 1;
    fs::write(
        log_path(dir),
        format!("{LOG_HEADER}\n\n{FAILED_PREFIX}{failed}\n\n{message}\n"),
    )
}

/// Clears the log after a successful run.
pub fn clear(dir: &GitDir) -> io::Result<()> {
    match fs::remove_file(log_path(dir)) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_extracts_the_counter_line() {
        assert_eq!(parse_failure_count(""), 0);
        assert_eq!(parse_failure_count("no counter here"), 0);
        assert_eq!(parse_failure_count("header\n\nfailed=3\n\nboom\n"), 3);
        assert_eq!(parse_failure_count("failed=12"), 12);
        assert_eq!(parse_failure_count("failed=notanumber\n"), 0);
    }

    #[test]
    fn write_failure_increments_the_counter() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = GitDir::new(tmp.path());

        assert_eq!(read_failure_count(&dir), 0);
        write_failure(&dir, "pack-objects exploded").expect("write");
        assert_eq!(read_failure_count(&dir), 1);
        write_failure(&dir, "pack-objects exploded again").expect("write");
        assert_eq!(read_failure_count(&dir), 2);

        let contents = read_log(&dir).expect("log present");
        assert!(contents.contains("failed=2"));
        assert!(contents.contains("pack-objects exploded again"));
    }

    #[test]
    fn clear_removes_the_log() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = GitDir::new(tmp.path());

        write_failure(&dir, "boom").expect("write");
        clear(&dir).expect("clear");
        assert_eq!(read_failure_count(&dir), 0);
        assert!(read_log(&dir).is_none());

        // Clearing a missing log is fine.
        clear(&dir).expect("clear again");
    }
}
