//! Commit-graph chain inspection.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::Path;

use super::StatsError;
use crate::gitdir::GitDir;

const COMMIT_GRAPH_SIGNATURE: &[u8; 4] = b"CGPH";
const COMMIT_GRAPH_VERSION: u8 = 1;
const CHUNK_TABLE_ENTRY_SIZE: usize = 12;

const CHUNK_BLOOM_INDEXES: &[u8; 4] = b"BIDX";
const CHUNK_BLOOM_DATA: &[u8; 4] = b"BDAT";
const CHUNK_GENERATION_DATA: &[u8; 4] = b"GDA2";
const CHUNK_GENERATION_DATA_OVERFLOW: &[u8; 4] = b"GDO2";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CommitGraphInfo {
    pub exists: bool,
    /// Number of slices in the incremental chain; zero for a monolithic
    /// commit-graph file.
    pub chain_length: u64,
    pub has_bloom_filters: bool,
    pub has_generation_data: bool,
    pub has_generation_data_overflow: bool,
}

/// Resolves the commit-graph chain, falling back to the monolithic
/// `objects/info/commit-graph` file when no chain exists.
///
/// Chunk flags are the union across all chain slices. Graph files that
/// vanish while the chain is being read (git rewriting the chain) are
/// skipped.
pub fn commit_graph_info(dir: &GitDir) -> Result<CommitGraphInfo, StatsError> {
    let mut info = CommitGraphInfo::default();

    match fs::read_to_string(dir.commit_graph_chain_file()) {
        Ok(chain) => {
            let ids: Vec<&str> = chain.trim().split('\n').collect();
            info.exists = true;
            info.chain_length = ids.len() as u64;

            let graphs_dir = dir.commit_graphs_dir();
            for id in ids {
                read_graph_file(&graphs_dir.join(format!("graph-{id}.graph")), &mut info)?;
            }
            return Ok(info);
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(StatsError::CommitGraphChain(err)),
    }

    if read_graph_file(&dir.commit_graph_file(), &mut info)? {
        info.exists = true;
    }

    Ok(info)
}

/// Parses one graph file's header and chunk table of contents, OR-ing the
/// chunk flags into `info`. Returns false if the file does not exist.
fn read_graph_file(path: &Path, info: &mut CommitGraphInfo) -> Result<bool, StatsError> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(StatsError::CommitGraphOpen(err)),
    };

    let mut header = [0u8; 8];
    file.read_exact(&mut header)
        .map_err(StatsError::CommitGraphHeader)?;

    if &header[0..4] != COMMIT_GRAPH_SIGNATURE {
        return Err(StatsError::CommitGraphSignature(
            String::from_utf8_lossy(&header[0..4]).into_owned(),
        ));
    }

    let version = header[4];
    if version != COMMIT_GRAPH_VERSION {
        return Err(StatsError::CommitGraphVersion(version));
    }

    // header[5] is the hash version and header[7] the base-graph count;
    // neither changes which chunks we look for.
    let chunk_count = usize::from(header[6]);

    // The table of contents has one terminating entry past the last chunk.
    let mut table = vec![0u8; (chunk_count + 1) * CHUNK_TABLE_ENTRY_SIZE];
    file.read_exact(&mut table)
        .map_err(StatsError::CommitGraphChunkTable)?;

    let has_chunk = |tag: &[u8; 4]| table.windows(4).any(|window| window == tag);

    // Changed-path Bloom filters need both the index and the data chunk.
    info.has_bloom_filters |= has_chunk(CHUNK_BLOOM_INDEXES) && has_chunk(CHUNK_BLOOM_DATA);
    info.has_generation_data |= has_chunk(CHUNK_GENERATION_DATA);
    info.has_generation_data_overflow |= has_chunk(CHUNK_GENERATION_DATA_OVERFLOW);

    Ok(true)
}
