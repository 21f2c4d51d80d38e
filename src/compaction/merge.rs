//! Merge algorithm for segment compaction.
//!
//! Folds a set of input segments into one sorted, deduplicated record
//! list: the record with the highest sequence wins per id, and a
//! winning tombstone is dropped only when no segment outside the
//! input set still contains the id (a later record may need the
//! shadow). Records are decoded here so the caller can re-encode the
//! output under the active codec.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::error::Result;
use crate::pq::{Codebook, CodecHash};
use crate::storage::segment::Segment;
use crate::storage::store::{decode_segment_payload, not_cancelled};

/// One merged record, decoded. `vector` is `None` for tombstones.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedRecord {
    pub id: Vec<u8>,
    pub seq: u64,
    pub tombstone: bool,
    pub vector: Option<Vec<f32>>,
}

/// Outcome of a merge pass.
pub struct MergeResult {
    /// Records in id order, ready for the output writer.
    pub records: Vec<MergedRecord>,
    /// Tombstoned ids dropped entirely (nothing left to shadow).
    pub tombstones_dropped: u64,
}

/// Merge `inputs` under last-writer-wins, consulting `later` (the
/// segments outside the input set) for the tombstone-drop rule.
///
/// Returns `None` when the cancellation flag fired; the caller leaves
/// the manifest untouched in that case. The flag is checked between
/// segments, not per record.
pub fn merge_segments(
    inputs: &[Arc<Segment>],
    later: &[Arc<Segment>],
    codecs: &HashMap<CodecHash, Arc<Codebook>>,
    cancel: Option<&AtomicBool>,
) -> Result<Option<MergeResult>> {
    // id -> (seq, tombstone, input index, payload copy). The payload
    // is copied so decode can run once, on winners only.
    let mut winners: BTreeMap<Vec<u8>, (u64, bool, usize, Vec<u8>)> = BTreeMap::new();

    for (si, seg) in inputs.iter().enumerate() {
        if !not_cancelled(cancel) {
            return Ok(None);
        }
        for raw in seg.iter() {
            let replace = winners
                .get(raw.id)
                .map_or(true, |(seq, _, _, _)| raw.seq > *seq);
            if replace {
                winners.insert(
                    raw.id.to_vec(),
                    (raw.seq, raw.tombstone, si, raw.payload.to_vec()),
                );
            }
        }
    }
    if !not_cancelled(cancel) {
        return Ok(None);
    }

    let mut records = Vec::with_capacity(winners.len());
    let mut tombstones_dropped = 0u64;
    for (id, (seq, tombstone, si, payload)) in winners {
        if tombstone {
            let shadowing = later.iter().any(|s| s.contains(&id));
            if !shadowing {
                tombstones_dropped += 1;
                continue;
            }
            records.push(MergedRecord {
                id,
                seq,
                tombstone: true,
                vector: None,
            });
        } else {
            let vector = decode_segment_payload(&inputs[si], &payload, codecs)?;
            records.push(MergedRecord {
                id,
                seq,
                tombstone: false,
                vector: Some(vector),
            });
        }
    }

    Ok(Some(MergeResult {
        records,
        tombstones_dropped,
    }))
}

// ── Tests ──────────────────────────────────────────────────────────
