//! Background compaction for the segmented store.
//!
//! Policy decides when a store needs compaction; execution merges the
//! oldest segments into one output, commits the manifest excluding
//! the inputs, and retires input files once readers release them.
//! Transactional at the manifest boundary: a crash between the output
//! write and the commit leaves an orphan that reopen ignores and the
//! next compaction unlinks.

pub mod merge;

use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::error::Result;
use crate::storage::manifest::SegmentEntry;
use crate::storage::segment::Segment;
use crate::storage::store::{encode_payload, store_norms, VectorStore};
use crate::storage::writer::{segment_file_name, SegmentWriter};

pub use merge::{merge_segments, MergeResult, MergedRecord};

/// True when the live segment count exceeds the threshold.
pub fn should_compact(store: &VectorStore, threshold: usize) -> bool {
    store.segment_count() > threshold && store.segment_count() >= 2
}

/// What one compaction pass did.
#[derive(Debug, Clone)]
pub struct CompactionStats {
    pub inputs_merged: usize,
    /// Id of the output segment, if any record survived.
    pub output_segment: Option<u64>,
    pub records_out: usize,
    pub tombstones_dropped: u64,
}

/// A merged-and-written output waiting for its manifest commit.
///
/// Prepared under a shared store snapshot so concurrent readers and
/// the writer never wait on merge or segment IO. The output id is
/// reserved up front, and commit re-reads the current segment list,
/// so a seal landing between the phases is preserved. If the commit
/// never happens the written output is an orphan that reopen ignores
/// and a later pass unlinks.
pub struct PreparedCompaction {
    inputs: Vec<Arc<Segment>>,
    output: Option<Arc<Segment>>,
    records_out: usize,
    tombstones_dropped: u64,
}

/// Phase one: pick the oldest segments, merge them, and write the
/// output segment, re-encoding under the active codec where inputs
/// used an older one. Needs only a shared reference. Returns `None`
/// when there is nothing to do or the cancellation flag fired.
pub fn prepare(
    store: &VectorStore,
    threshold: usize,
    cancel: Option<&AtomicBool>,
) -> Result<Option<PreparedCompaction>> {
    let segments = store.segments();
    let count = segments.len();
    if count < 2 || count <= threshold {
        return Ok(None);
    }
    // Oldest K inputs, where K restores the threshold. The list is
    // newest-first, so inputs come from the tail.
    let k = (count - threshold + 1).clamp(2, count);
    let inputs: Vec<Arc<Segment>> = segments[count - k..].to_vec();
    let later: Vec<Arc<Segment>> = segments[..count - k].to_vec();

    tracing::info!(inputs = k, live = count, "compaction started");

    let merged = match merge_segments(&inputs, &later, store.codecs(), cancel)? {
        Some(m) => m,
        None => {
            tracing::info!("compaction cancelled before commit");
            return Ok(None);
        }
    };

    // Re-encode every surviving record under the active codec.
    let codec = store.active_codec().cloned();
    let metric = store.metric();
    let mut writer = match &codec {
        Some(cb) => SegmentWriter::new_pq(store.dim(), cb.hash(), cb.m(), store_norms(metric)),
        None => SegmentWriter::new_raw(store.dim()),
    };
    let stride = writer.stride();
    for rec in &merged.records {
        let payload = match &rec.vector {
            Some(v) => encode_payload(v, codec.as_deref(), metric, stride)?,
            None => vec![0u8; stride],
        };
        writer.add(rec.id.clone(), rec.tombstone, rec.seq, payload);
    }

    let records_out = writer.len();
    let output = if records_out > 0 {
        let output_id = store.reserve_segment_id();
        let generation = inputs.iter().map(|s| s.generation()).max().unwrap_or(0) + 1;
        Some(store.write_segment(writer, output_id, generation)?)
    } else {
        None
    };

    Ok(Some(PreparedCompaction {
        inputs,
        output,
        records_out,
        tombstones_dropped: merged.tombstones_dropped,
    }))
}

/// Phase two: commit the manifest excluding the inputs and including
/// the output, publish the new segment list, and retire input files.
/// Brief by design; this is the only part that excludes readers.
pub fn commit(store: &mut VectorStore, prepared: PreparedCompaction) -> Result<CompactionStats> {
    let PreparedCompaction {
        inputs,
        output,
        records_out,
        tombstones_dropped,
    } = prepared;

    let input_ids: HashSet<u64> = inputs.iter().map(|s| s.id()).collect();
    let mut manifest = store.manifest().current().clone();
    manifest
        .segments
        .retain(|e| !input_ids.contains(&e.segment_id));
    if let Some(seg) = &output {
        manifest.segments.push(SegmentEntry {
            segment_id: seg.id(),
            path: segment_file_name(seg.id()),
            generation: seg.generation(),
        });
    }
    // Rebuilt from the live list, not the prepare-time snapshot, so
    // a seal that landed in between survives the swap.
    let current = store.segments();
    let mut post: Vec<Arc<Segment>> = current
        .iter()
        .filter(|s| !input_ids.contains(&s.id()))
        .cloned()
        .collect();
    if let Some(seg) = &output {
        post.push(Arc::clone(seg));
    }
    store.prune_codecs(&mut manifest, &post);
    store.manifest_mut().commit(manifest)?;
    store.publish_segments(post);

    // Inputs are durable garbage now: unlink when the last reader
    // snapshot releases them.
    for seg in &inputs {
        seg.mark_unlink_on_drop();
    }
    remove_orphans(store, &inputs)?;

    let stats = CompactionStats {
        inputs_merged: inputs.len(),
        output_segment: output.as_ref().map(|s| s.id()),
        records_out,
        tombstones_dropped,
    };
    tracing::info!(
        inputs = stats.inputs_merged,
        output = ?stats.output_segment,
        records = stats.records_out,
        tombstones_dropped = stats.tombstones_dropped,
        "compaction committed"
    );
    Ok(stats)
}

/// Both phases back to back, for callers that already own the store
/// exclusively.
pub fn compact(
    store: &mut VectorStore,
    threshold: usize,
    cancel: Option<&AtomicBool>,
) -> Result<Option<CompactionStats>> {
    match prepare(store, threshold, cancel)? {
        Some(prepared) => Ok(Some(commit(store, prepared)?)),
        None => Ok(None),
    }
}

/// Unlink segment files that neither the manifest nor a live input
/// reference: leftovers from a crash between a segment write and its
/// manifest commit, plus stale temp files.
fn remove_orphans(store: &VectorStore, inputs: &[Arc<Segment>]) -> Result<()> {
    let Some(dir) = store.dir() else {
        return Ok(());
    };
    let mut known: HashSet<String> = store
        .manifest()
        .current()
        .segments
        .iter()
        .map(|e| e.path.clone())
        .collect();
    for seg in inputs {
        known.insert(segment_file_name(seg.id()));
    }

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        let orphan_seg = name.ends_with(".seg") && !known.contains(&name);
        let stale_tmp = name.ends_with(".tmp");
        if orphan_seg || stale_tmp {
            tracing::warn!(file = %name, "removing orphan file");
            let _ = std::fs::remove_file(entry.path());
        }
    }
    Ok(())
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SvdbError;
    use crate::metric::Metric;

    fn filled_store(segment_batches: &[&[(&str, f32)]]) -> VectorStore {
        let mut s = VectorStore::ephemeral(2, Metric::Euclidean);
        for batch in segment_batches {
            for (id, x) in *batch {
                s.put(id.as_bytes(), vec![*x, 0.0]).unwrap();
            }
            s.seal().unwrap();
        }
        s
    }

    #[test]
    fn test_no_compaction_below_threshold() {
        let mut s = filled_store(&[&[("a", 1.0)], &[("b", 2.0)]]);
        assert!(!should_compact(&s, 4));
        assert!(compact(&mut s, 4, None).unwrap().is_none());
    }

    #[test]
    fn test_compaction_restores_threshold() {
        let mut s = filled_store(&[
            &[("a", 1.0)],
            &[("b", 2.0)],
            &[("c", 3.0)],
            &[("d", 4.0)],
            &[("e", 5.0)],
        ]);
        assert!(should_compact(&s, 3));
        let stats = compact(&mut s, 3, None).unwrap().unwrap();
        assert_eq!(stats.inputs_merged, 3);
        assert_eq!(s.segment_count(), 3);

        for (id, x) in [("a", 1.0), ("b", 2.0), ("c", 3.0), ("d", 4.0), ("e", 5.0)] {
            assert_eq!(s.get(id.as_bytes()).unwrap()[0], x, "id {}", id);
        }
    }

    #[test]
    fn test_compaction_applies_overwrites() {
        let mut s = filled_store(&[&[("a", 1.0)], &[("a", 2.0)], &[("a", 3.0)]]);
        let stats = compact(&mut s, 0, None).unwrap().unwrap();
        assert_eq!(stats.records_out, 1);
        assert_eq!(s.segment_count(), 1);
        assert_eq!(s.get(b"a").unwrap()[0], 3.0);
    }

    #[test]
    fn test_compaction_drops_unshadowed_tombstone() {
        let mut s = filled_store(&[&[("a", 1.0), ("b", 2.0)]]);
        s.tombstone(b"a").unwrap();
        s.seal().unwrap();

        let stats = compact(&mut s, 0, None).unwrap().unwrap();
        assert_eq!(stats.tombstones_dropped, 1);
        assert_eq!(stats.records_out, 1);
        assert!(matches!(s.get(b"a"), Err(SvdbError::NotFound)));
        assert_eq!(s.get(b"b").unwrap()[0], 2.0);
    }

    #[test]
    fn test_compaction_of_everything_tombstoned_yields_no_output() {
        let mut s = filled_store(&[&[("a", 1.0)]]);
        s.tombstone(b"a").unwrap();
        s.seal().unwrap();

        let stats = compact(&mut s, 0, None).unwrap().unwrap();
        assert_eq!(stats.output_segment, None);
        assert_eq!(s.segment_count(), 0);
        assert!(matches!(s.get(b"a"), Err(SvdbError::NotFound)));
    }

    #[test]
    fn test_partial_compaction_keeps_tombstone_shadow() {
        // Oldest two segments merge; the newest one holds a live
        // record that the merged tombstone must not outrank.
        let mut s = filled_store(&[&[("x", 1.0)]]);
        s.tombstone(b"x").unwrap();
        s.seal().unwrap();
        s.put(b"x", vec![9.0, 0.0]).unwrap();
        s.seal().unwrap();

        // threshold 2 → merge the two oldest, keep the newest apart.
        let stats = compact(&mut s, 2, None).unwrap().unwrap();
        assert_eq!(stats.inputs_merged, 2);
        // Tombstone kept: the later segment still contains "x".
        assert_eq!(stats.tombstones_dropped, 0);
        assert_eq!(s.get(b"x").unwrap()[0], 9.0);
    }

    #[test]
    fn test_cancellation_leaves_state_intact() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let mut s = filled_store(&[&[("a", 1.0)], &[("b", 2.0)], &[("c", 3.0)]]);
        let cancel = AtomicBool::new(false);
        cancel.store(true, Ordering::Release);

        let before = s.segment_count();
        let result = compact(&mut s, 0, Some(&cancel)).unwrap();
        assert!(result.is_none());
        assert_eq!(s.segment_count(), before);
        assert_eq!(s.get(b"a").unwrap()[0], 1.0);
    }

    #[test]
    fn test_disk_compaction_unlinks_inputs_and_updates_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = VectorStore::create(dir.path(), 2, Metric::Euclidean).unwrap();
        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            s.put(id.as_bytes(), vec![i as f32, 0.0]).unwrap();
            s.seal().unwrap();
        }

        let stats = compact(&mut s, 0, None).unwrap().unwrap();
        let out_id = stats.output_segment.unwrap();
        assert_eq!(s.manifest().current().segments.len(), 1);
        assert_eq!(s.manifest().current().segments[0].segment_id, out_id);

        // Input files are unlinked once no snapshot holds them.
        for old in 1..=3u64 {
            assert!(!dir.path().join(segment_file_name(old)).exists());
        }
        assert!(dir.path().join(segment_file_name(out_id)).exists());
    }

    #[test]
    fn test_codec_migration_reencodes_under_active() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        use crate::pq::Codebook;

        let mut s = VectorStore::ephemeral(8, Metric::Euclidean);
        let mut rng = StdRng::seed_from_u64(23);
        let samples: Vec<Vec<f32>> = (0..400)
            .map(|_| (0..8).map(|_| rng.gen_range(-1.0..1.0)).collect())
            .collect();

        // Seal one raw segment, then train and seal a PQ one.
        s.put(b"raw", samples[0].clone()).unwrap();
        s.seal().unwrap();
        let cb = Codebook::train(&samples, 8, 4, 6, 15).unwrap();
        let active = s.publish_codec(cb).unwrap();
        s.put(b"pq", samples[1].clone()).unwrap();
        s.seal().unwrap();

        compact(&mut s, 0, None).unwrap().unwrap();
        assert_eq!(s.segment_count(), 1);
        let segments = s.segments();
        let seg = &segments[0];
        assert!(seg.pq_encoded());
        assert_eq!(seg.codec_hash(), active);

        // Both records decode within codec tolerance.
        for (id, original) in [(&b"raw"[..], &samples[0]), (b"pq", &samples[1])] {
            let got = s.get(id).unwrap();
            assert!(Metric::Euclidean.distance(original, &got) < 1.0);
        }
    }
}
