//! Packfile bitmap header parser.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use super::StatsError;

const BITMAP_SIGNATURE: &[u8; 4] = b"BITM";
const BITMAP_VERSION: u16 = 1;
/// Flag bit set when the bitmap carries the name-hash cache extension.
const BITMAP_OPT_HASH_CACHE: u16 = 0x4;
/// Flag bit set when the bitmap carries the lookup-table extension.
const BITMAP_OPT_LOOKUP_TABLE: u16 = 0x10;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BitmapInfo {
    pub exists: bool,
    pub version: u16,
    pub has_hash_cache: bool,
    pub has_lookup_table: bool,
}

/// Parses the fixed 8-byte bitmap header at `path`.
///
/// Only version 1 is supported; a signature or version mismatch is a hard
/// parse error. Callers treat that as a statistics-collection failure, not
/// as proof of repository corruption.
pub fn bitmap_info(path: &Path) -> Result<BitmapInfo, StatsError> {
    let mut file = File::open(path).map_err(StatsError::BitmapOpen)?;

    let mut header = [0u8; 8];
    file.read_exact(&mut header)
        .map_err(StatsError::BitmapHeader)?;

    if &header[0..4] != BITMAP_SIGNATURE {
        return Err(StatsError::BitmapSignature(
            String::from_utf8_lossy(&header[0..4]).into_owned(),
        ));
    }

    let version = u16::from_be_bytes([header[4], header[5]]);
    if version != BITMAP_VERSION {
        return Err(StatsError::BitmapVersion(version));
    }

    let flags = u16::from_be_bytes([header[6], header[7]]);

    Ok(BitmapInfo {
        exists: true,
        version,
        has_hash_cache: flags & BITMAP_OPT_HASH_CACHE != 0,
        has_lookup_table: flags & BITMAP_OPT_LOOKUP_TABLE != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_bitmap(bytes: &[u8]) -> (tempfile::TempDir, std::path::PathBuf) {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("pack-1234.bitmap");
        fs::write(&path, bytes).expect("write bitmap");
        (tmp, path)
    }

    #[test]
    fn parses_all_extension_flags() {
        let (_tmp, path) = write_bitmap(&[b'B', b'I', b'T', b'M', 0, 1, 0, 0x14]);
        let info = bitmap_info(&path).expect("parse");
        assert_eq!(
            info,
            BitmapInfo {
                exists: true,
                version: 1,
                has_hash_cache: true,
                has_lookup_table: true,
            }
        );
    }

    #[test]
    fn parses_bare_bitmap() {
        let (_tmp, path) = write_bitmap(&[b'B', b'I', b'T', b'M', 0, 1, 0, 0]);
        let info = bitmap_info(&path).expect("parse");
        assert!(info.exists);
        assert!(!info.has_hash_cache);
        assert!(!info.has_lookup_table);
    }

    #[test]
    fn short_header_is_an_eof_error() {
        let (_tmp, path) = write_bitmap(&[0, 0, 0]);
        match bitmap_info(&path) {
            Err(StatsError::BitmapHeader(err)) => {
                assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
            }
            other => panic!("expected header error, got {other:?}"),
        }
    }

    #[test]
    fn signature_mismatch_is_rejected() {
        let (_tmp, path) = write_bitmap(&[b'B', b'I', b'T', b'O', 0, 0, 0, 0]);
        match bitmap_info(&path) {
            Err(StatsError::BitmapSignature(sig)) => assert_eq!(sig, "BITO"),
            other => panic!("expected signature error, got {other:?}"),
        }
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let (_tmp, path) = write_bitmap(&[b'B', b'I', b'T', b'M', 0, 2, 0, 0]);
        match bitmap_info(&path) {
            Err(StatsError::BitmapVersion(version)) => assert_eq!(version, 2),
            other => panic!("expected version error, got {other:?}"),
        }
    }
}
