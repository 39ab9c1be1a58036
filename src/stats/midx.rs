//! Multi-pack-index header parser.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use super::StatsError;

const MIDX_SIGNATURE: &[u8; 4] = b"MIDX";
const MIDX_VERSION: u8 = 1;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MultiPackIndexInfo {
    pub exists: bool,
    pub version: u8,
    /// Number of packfiles the index tracks.
    pub packfile_count: u64,
}

/// Parses the fixed 12-byte multi-pack-index header at `path`.
///
/// Chained multi-pack-indexes (non-zero base-file count) are not supported.
pub fn multi_pack_index_info(path: &Path) -> Result<MultiPackIndexInfo, StatsError> {
    let mut file = File::open(path).map_err(StatsError::MidxOpen)?;

    let mut header = [0u8; 12];
    file.read_exact(&mut header)
        .map_err(StatsError::MidxHeader)?;

    if &header[0..4] != MIDX_SIGNATURE {
        return Err(StatsError::MidxSignature(
            String::from_utf8_lossy(&header[0..4]).into_owned(),
        ));
    }

    let version = header[4];
    if version != MIDX_VERSION {
        return Err(StatsError::MidxVersion(version));
    }

    // header[5] is the object-ID version, header[6] the chunk count; neither
    // influences the statistics we report.
    let base_files = header[7];
    if base_files != 0 {
        return Err(StatsError::MidxBaseFiles(base_files));
    }

    let packfile_count = u32::from_be_bytes([header[8], header[9], header[10], header[11]]);

    Ok(MultiPackIndexInfo {
        exists: true,
        version,
        packfile_count: u64::from(packfile_count),
    })
}
