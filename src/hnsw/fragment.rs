//! Graph fragment persistence.
//!
//! A fragment file co-located with the segment set saves the whole
//! graph (id table, vectors, per-level adjacency, entry point) plus
//! the coverage stamp it was captured under: the segment ids and the
//! active codec hash. On open the fragment is accepted only when the
//! stamp matches the manifest exactly; anything else means the graph
//! is rebuilt from live records. A corrupt fragment is a rebuild, not
//! an error.
//!
//! Layout: magic, version, bincode body, trailing crc32 over the
//! body. Written via temp + rename like every other durable artifact.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::HnswOptions;
use crate::error::Result;
use crate::hnsw::graph::{HnswGraph, Node};
use crate::metric::Metric;
use crate::pq::CodecHash;
use crate::storage::{fsync_dir, fsync_retry};

const FRAGMENT_MAGIC: [u8; 4] = *b"SVGF";
const FRAGMENT_VERSION: u16 = 1;
const FRAGMENT_FILE: &str = "graph.hnsw";

#[derive(Serialize, Deserialize)]
struct FragmentNode {
    id: Vec<u8>,
    vector: Vec<f32>,
    ghost: bool,
    levels: Vec<Vec<u32>>,
}

/// Serialized graph plus its coverage stamp.
#[derive(Serialize, Deserialize)]
pub struct GraphFragment {
    dim: u32,
    metric: Metric,
    entry: Option<u32>,
    nodes: Vec<FragmentNode>,
    /// Segment ids the graph covered at capture, sorted.
    segment_ids: Vec<u64>,
    /// Active codec at capture.
    codec_hash: Option<CodecHash>,
}

impl GraphFragment {
    /// Snapshot a graph together with its coverage stamp.
    pub fn capture(
        graph: &HnswGraph,
        mut segment_ids: Vec<u64>,
        codec_hash: Option<CodecHash>,
    ) -> Self {
        segment_ids.sort_unstable();
        Self {
            dim: graph.dim() as u32,
            metric: graph.metric(),
            entry: graph.entry(),
            nodes: graph
                .nodes()
                .iter()
                .map(|n| FragmentNode {
                    id: n.id.clone(),
                    vector: n.vector.clone(),
                    ghost: n.ghost,
                    levels: n.levels.clone(),
                })
                .collect(),
            segment_ids,
            codec_hash,
        }
    }

    /// Whether this fragment covers exactly the given state.
    pub fn matches(
        &self,
        dim: usize,
        metric: Metric,
        segment_ids: &[u64],
        codec_hash: Option<CodecHash>,
    ) -> bool {
        let mut expected = segment_ids.to_vec();
        expected.sort_unstable();
        self.dim as usize == dim
            && self.metric == metric
            && self.segment_ids == expected
            && self.codec_hash == codec_hash
    }

    /// Rehydrate the graph.
    pub fn restore(self, opts: &HnswOptions) -> HnswGraph {
        let nodes: Vec<Node> = self
            .nodes
            .into_iter()
            .map(|n| Node {
                id: n.id,
                vector: n.vector,
                ghost: n.ghost,
                levels: n.levels,
            })
            .collect();
        HnswGraph::from_parts(self.dim as usize, self.metric, opts, nodes, self.entry)
    }

    /// Write atomically into the store directory.
    pub fn write_atomic(&self, dir: &Path) -> Result<()> {
        let body = bincode::serialize(self)?;
        let crc = crc32fast::hash(&body);

        let path = dir.join(FRAGMENT_FILE);
        let tmp = dir.join(format!("{}.tmp", FRAGMENT_FILE));
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&FRAGMENT_MAGIC)?;
            file.write_all(&FRAGMENT_VERSION.to_le_bytes())?;
            file.write_all(&(body.len() as u64).to_le_bytes())?;
            file.write_all(&body)?;
            file.write_all(&crc.to_le_bytes())?;
            fsync_retry(&file)?;
        }
        std::fs::rename(&tmp, &path)?;
        fsync_dir(dir)?;
        tracing::debug!(nodes = self.nodes.len(), "graph fragment persisted");
        Ok(())
    }

    /// Load the fragment if present and intact. Absent, truncated, or
    /// corrupt all mean `None`: the caller rebuilds.
    pub fn load(dir: &Path) -> Option<GraphFragment> {
        let path = dir.join(FRAGMENT_FILE);
        let bytes = std::fs::read(&path).ok()?;
        if bytes.len() < 4 + 2 + 8 + 4 || bytes[0..4] != FRAGMENT_MAGIC {
            tracing::warn!("graph fragment unreadable, will rebuild");
            return None;
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != FRAGMENT_VERSION {
            tracing::warn!(version, "graph fragment version mismatch, will rebuild");
            return None;
        }
        let body_len = u64::from_le_bytes(bytes[6..14].try_into().ok()?) as usize;
        if bytes.len() != 14 + body_len + 4 {
            tracing::warn!("graph fragment truncated, will rebuild");
            return None;
        }
        let body = &bytes[14..14 + body_len];
        let declared = u32::from_le_bytes(bytes[14 + body_len..].try_into().ok()?);
        if crc32fast::hash(body) != declared {
            tracing::warn!("graph fragment checksum mismatch, will rebuild");
            return None;
        }
        match bincode::deserialize(body) {
            Ok(fragment) => Some(fragment),
            Err(err) => {
                tracing::warn!(%err, "graph fragment undecodable, will rebuild");
                None
            }
        }
    }

    /// Remove a stale fragment file, if any.
    pub fn remove(dir: &Path) {
        let _ = std::fs::remove_file(dir.join(FRAGMENT_FILE));
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> HnswOptions {
        HnswOptions {
            m: 4,
            ef_construction: 32,
            ef_search: 16,
            ml_max: 8,
        }
    }

    fn sample_graph() -> HnswGraph {
        let mut g = HnswGraph::with_seed(4, Metric::Euclidean, &opts(), 11);
        for i in 0..40u32 {
            let v: Vec<f32> = (0..4).map(|j| ((i + j) % 7) as f32).collect();
            g.insert(format!("n{}", i).as_bytes(), v);
        }
        g.ghost(b"n3");
        g
    }

    #[test]
    fn test_capture_restore_roundtrip() {
        let g = sample_graph();
        let before = g.search(&[1.0, 2.0, 3.0, 4.0], 5, Some(32));

        let frag = GraphFragment::capture(&g, vec![3, 1, 2], None);
        let restored = frag.restore(&opts());

        assert_eq!(restored.len(), g.len());
        assert_eq!(restored.ghost_count(), g.ghost_count());
        assert_eq!(restored.max_level(), g.max_level());
        let after = restored.search(&[1.0, 2.0, 3.0, 4.0], 5, Some(32));
        assert_eq!(before, after);
    }

    #[test]
    fn test_matches_requires_exact_stamp() {
        let g = sample_graph();
        let hash = Some(CodecHash([9u8; 16]));
        let frag = GraphFragment::capture(&g, vec![2, 1], hash);

        assert!(frag.matches(4, Metric::Euclidean, &[1, 2], hash));
        // Order-insensitive, set-sensitive.
        assert!(frag.matches(4, Metric::Euclidean, &[2, 1], hash));
        assert!(!frag.matches(4, Metric::Euclidean, &[1, 2, 3], hash));
        assert!(!frag.matches(4, Metric::Euclidean, &[1, 2], None));
        assert!(!frag.matches(4, Metric::Cosine, &[1, 2], hash));
        assert!(!frag.matches(8, Metric::Euclidean, &[1, 2], hash));
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let g = sample_graph();
        GraphFragment::capture(&g, vec![1], None)
            .write_atomic(dir.path())
            .unwrap();

        let loaded = GraphFragment::load(dir.path()).unwrap();
        assert!(loaded.matches(4, Metric::Euclidean, &[1], None));
        let restored = loaded.restore(&opts());
        assert_eq!(restored.len(), g.len());
    }

    #[test]
    fn test_load_absent_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(GraphFragment::load(dir.path()).is_none());
    }

    #[test]
    fn test_load_corrupt_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let g = sample_graph();
        GraphFragment::capture(&g, vec![1], None)
            .write_atomic(dir.path())
            .unwrap();

        let path = dir.path().join("graph.hnsw");
        let mut bytes = std::fs::read(&path).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        assert!(GraphFragment::load(dir.path()).is_none());
    }

    #[test]
    fn test_remove() {
        let dir = tempfile::tempdir().unwrap();
        let g = sample_graph();
        GraphFragment::capture(&g, vec![], None)
            .write_atomic(dir.path())
            .unwrap();
        assert!(dir.path().join("graph.hnsw").exists());
        GraphFragment::remove(dir.path());
        assert!(!dir.path().join("graph.hnsw").exists());
    }
}
