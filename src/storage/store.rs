//! Vector store: memtable + sealed segments + manifest.
//!
//! The single-writer read/write unit of the engine. Writes absorb
//! into the memtable; sealing encodes under the active codec and
//! produces an immutable segment plus a manifest commit. Readers work
//! against a published `Arc` snapshot of the segment list.
//!
//! Segment recency is ordered by `max_sequence`, not by segment id:
//! compaction outputs carry new ids over old sequence ranges, and
//! sequence ranges never interleave (seals are sequence-ordered and
//! compaction merges a sequence-prefix).

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{Result, SvdbError};
use crate::metric::{self, Metric};
use crate::pq::{Codebook, CodecHash, DistanceTable};
use crate::storage::manifest::{Manifest, ManifestStore, SegmentEntry};
use crate::storage::memtable::{Memtable, Record};
use crate::storage::segment::Segment;
use crate::storage::writer::{segment_file_name, SegmentWriter};
use crate::storage::MAX_ID_LEN;

/// A record as surfaced by the change stream and snapshot iterators.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    pub seq: u64,
    pub id: Vec<u8>,
    pub tombstone: bool,
    /// Decoded payload; `None` for tombstones.
    pub vector: Option<Vec<f32>>,
}

pub struct VectorStore {
    dir: Option<PathBuf>,
    dim: usize,
    metric: Metric,
    memtable: Memtable,
    /// Published snapshot, sorted by max_sequence descending.
    segments: Arc<Vec<Arc<Segment>>>,
    manifest: ManifestStore,
    codecs: HashMap<CodecHash, Arc<Codebook>>,
    active_codec: Option<CodecHash>,
    next_seq: u64,
    /// Atomic so a compaction pass can reserve its output id under a
    /// shared borrow while a seal allocates concurrently.
    next_segment_id: AtomicU64,
    /// Segments quarantined during recovery: (segment id, reason).
    degraded: Vec<(u64, String)>,
}

// ── Constructors ───────────────────────────────────────────────────

impl VectorStore {
    /// Create a new store directory with an empty manifest.
    pub fn create(dir: &Path, dim: usize, metric: Metric) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let manifest = ManifestStore::create(dir)?;
        Ok(Self {
            dir: Some(dir.to_path_buf()),
            dim,
            metric,
            memtable: Memtable::new(),
            segments: Arc::new(Vec::new()),
            manifest,
            codecs: HashMap::new(),
            active_codec: None,
            next_seq: 1,
            next_segment_id: AtomicU64::new(1),
            degraded: Vec::new(),
        })
    }

    /// In-memory store for tests; segments live as owned byte blocks.
    pub fn ephemeral(dim: usize, metric: Metric) -> Self {
        Self {
            dir: None,
            dim,
            metric,
            memtable: Memtable::new(),
            segments: Arc::new(Vec::new()),
            manifest: ManifestStore::ephemeral(),
            codecs: HashMap::new(),
            active_codec: None,
            next_seq: 1,
            next_segment_id: AtomicU64::new(1),
            degraded: Vec::new(),
        }
    }

    /// Open an existing store: load the last durable manifest, mmap
    /// referenced segments, quarantine corrupt ones, and restore the
    /// sequence counter. The memtable starts empty; unsealed writes
    /// from before a crash are gone by design.
    pub fn open(dir: &Path, dim: usize, metric: Metric) -> Result<Self> {
        let mut manifest = ManifestStore::open(dir)?;

        let mut codecs = HashMap::new();
        for (hash, file) in &manifest.current().codecs {
            let path = dir.join(file);
            let cb = Codebook::load(&path)?;
            if cb.hash() != *hash {
                return Err(SvdbError::CorruptManifest(format!(
                    "codebook {} content hash does not match manifest",
                    file
                )));
            }
            codecs.insert(*hash, Arc::new(cb));
        }
        let active_codec = manifest.current().active_codec;
        if let Some(h) = active_codec {
            if !codecs.contains_key(&h) {
                return Err(SvdbError::CorruptManifest(format!(
                    "active codec {} not present in manifest",
                    h
                )));
            }
        }

        let mut segments: Vec<Arc<Segment>> = Vec::new();
        let mut degraded = Vec::new();
        for entry in &manifest.current().segments {
            let path = dir.join(&entry.path);
            let opened = Segment::open(&path, entry.segment_id, entry.generation)
                .and_then(|seg| {
                    if seg.header().dim as usize != dim {
                        Err(SvdbError::CorruptSegment(format!(
                            "segment {} has dimension {}, store dimension is {}",
                            entry.segment_id,
                            seg.header().dim,
                            dim
                        )))
                    } else {
                        Ok(seg)
                    }
                });
            match opened {
                Ok(seg) => segments.push(Arc::new(seg)),
                Err(err) => {
                    tracing::warn!(
                        segment_id = entry.segment_id,
                        %err,
                        "quarantining corrupt segment; store opens read-degraded"
                    );
                    degraded.push((entry.segment_id, err.to_string()));
                }
            }
        }
        segments.sort_by(|a, b| b.max_seq().cmp(&a.max_seq()));

        // Rewrite the manifest without quarantined segments so a
        // subsequent open does not trip over them again.
        if !degraded.is_empty() {
            let mut next = manifest.current().clone();
            next.segments
                .retain(|e| !degraded.iter().any(|(id, _)| *id == e.segment_id));
            manifest.commit(next)?;
        }

        let next_seq = segments.iter().map(|s| s.max_seq()).max().unwrap_or(0) + 1;
        let next_segment_id = manifest
            .current()
            .segments
            .iter()
            .map(|e| e.segment_id)
            .chain(degraded.iter().map(|(id, _)| *id))
            .max()
            .unwrap_or(0)
            + 1;

        tracing::info!(
            segments = segments.len(),
            quarantined = degraded.len(),
            next_seq,
            "store opened"
        );

        Ok(Self {
            dir: Some(dir.to_path_buf()),
            dim,
            metric,
            memtable: Memtable::new(),
            segments: Arc::new(segments),
            manifest,
            codecs,
            active_codec,
            next_seq,
            next_segment_id: AtomicU64::new(next_segment_id),
            degraded,
        })
    }
}

// ── Accessors ──────────────────────────────────────────────────────

impl VectorStore {
    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn memtable(&self) -> &Memtable {
        &self.memtable
    }

    /// Snapshot of the sealed segment list, newest-first.
    pub fn segments(&self) -> Arc<Vec<Arc<Segment>>> {
        Arc::clone(&self.segments)
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    pub fn active_codec(&self) -> Option<&Arc<Codebook>> {
        self.active_codec.and_then(|h| self.codecs.get(&h))
    }

    pub fn active_codec_hash(&self) -> Option<CodecHash> {
        self.active_codec
    }

    pub fn codec(&self, hash: CodecHash) -> Option<&Arc<Codebook>> {
        self.codecs.get(&hash)
    }

    pub fn codecs(&self) -> &HashMap<CodecHash, Arc<Codebook>> {
        &self.codecs
    }

    /// Segments quarantined during recovery, if any. Non-empty means
    /// the store is serving in read-degraded mode.
    pub fn degraded(&self) -> &[(u64, String)] {
        &self.degraded
    }
}

// ── Writes ─────────────────────────────────────────────────────────

impl VectorStore {
    fn validate_id(&self, id: &[u8]) -> Result<()> {
        if id.is_empty() || id.len() > MAX_ID_LEN {
            return Err(SvdbError::InvalidShape(format!(
                "identifier length {} outside 1..={}",
                id.len(),
                MAX_ID_LEN
            )));
        }
        Ok(())
    }

    fn validate_vector(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dim {
            return Err(SvdbError::InvalidShape(format!(
                "vector has dimension {}, store dimension is {}",
                vector.len(),
                self.dim
            )));
        }
        Ok(())
    }

    /// Upsert a vector. Returns the assigned sequence number.
    pub fn put(&mut self, id: &[u8], vector: Vec<f32>) -> Result<u64> {
        self.validate_id(id)?;
        self.validate_vector(&vector)?;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.memtable.insert(Record::live(id.to_vec(), vector, seq));
        Ok(seq)
    }

    /// Install a tombstone. Idempotent from the caller's view.
    pub fn tombstone(&mut self, id: &[u8]) -> Result<u64> {
        self.validate_id(id)?;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.memtable.insert(Record::tombstone(id.to_vec(), seq));
        Ok(seq)
    }

    /// Replication ingest: apply a write with a caller-provided
    /// sequence. Idempotent on duplicate or stale sequences; the
    /// counter advances past every applied sequence.
    pub fn apply(&mut self, seq: u64, id: &[u8], tombstone: bool, vector: Vec<f32>) -> Result<bool> {
        self.validate_id(id)?;
        if !tombstone {
            self.validate_vector(&vector)?;
        }
        if let Some((visible, _)) = self.visible_seq(id) {
            if visible >= seq {
                return Ok(false);
            }
        }
        self.memtable.insert(Record {
            id: id.to_vec(),
            vector: if tombstone { Vec::new() } else { vector },
            seq,
            tombstone,
        });
        self.next_seq = self.next_seq.max(seq + 1);
        Ok(true)
    }
}

// ── Reads ──────────────────────────────────────────────────────────

impl VectorStore {
    /// Point lookup: memtable first, then segments newest-first; the
    /// first hit wins, and a tombstone hides the id.
    pub fn get(&self, id: &[u8]) -> Result<Vec<f32>> {
        if let Some(rec) = self.memtable.get(id) {
            if rec.tombstone {
                return Err(SvdbError::NotFound);
            }
            return Ok(rec.vector.clone());
        }
        for seg in self.segments.iter() {
            if let Some(raw) = seg.get(id) {
                if raw.tombstone {
                    return Err(SvdbError::NotFound);
                }
                return decode_segment_payload(seg, raw.payload, &self.codecs);
            }
        }
        Err(SvdbError::NotFound)
    }

    /// Sequence and tombstone flag of the visible record, if any.
    pub fn visible_seq(&self, id: &[u8]) -> Option<(u64, bool)> {
        if let Some(rec) = self.memtable.get(id) {
            return Some((rec.seq, rec.tombstone));
        }
        for seg in self.segments.iter() {
            if let Some(raw) = seg.get(id) {
                return Some((raw.seq, raw.tombstone));
            }
        }
        None
    }

    /// Latest live record per id across memtable and segments,
    /// decoded. Used for graph rebuilds and snapshot export.
    pub fn live_records(&self) -> Result<Vec<Record>> {
        let mut latest: BTreeMap<Vec<u8>, Record> = BTreeMap::new();
        // Oldest segment first so newer records overwrite.
        for seg in self.segments.iter().rev() {
            for raw in seg.iter() {
                let vector = if raw.tombstone {
                    Vec::new()
                } else {
                    decode_segment_payload(seg, raw.payload, &self.codecs)?
                };
                latest.insert(
                    raw.id.to_vec(),
                    Record {
                        id: raw.id.to_vec(),
                        vector,
                        seq: raw.seq,
                        tombstone: raw.tombstone,
                    },
                );
            }
        }
        for rec in self.memtable.iter() {
            latest.insert(rec.id.clone(), rec.clone());
        }
        Ok(latest.into_values().filter(|r| !r.tombstone).collect())
    }

    /// Brute-force top-k over every visible record: exact distances
    /// for raw payloads, asymmetric-table distances for PQ payloads
    /// (query uncompressed, codes looked up per subspace). The
    /// slow-but-simple baseline next to the graph search.
    pub fn scan_search(&self, query: &[f32], k: usize) -> Result<Vec<(Vec<u8>, f32)>> {
        self.validate_vector(query)?;
        let mut tables: HashMap<CodecHash, DistanceTable> = HashMap::new();
        for seg in self.segments.iter() {
            let hash = seg.codec_hash();
            if seg.pq_encoded() && !tables.contains_key(&hash) {
                let cb = self.codecs.get(&hash).ok_or_else(|| {
                    SvdbError::CorruptSegment(format!(
                        "segment {} references unknown codebook {}",
                        seg.id(),
                        hash
                    ))
                })?;
                tables.insert(hash, DistanceTable::build(cb, self.metric, query)?);
            }
        }

        // Oldest-first so newer records overwrite; memtable last.
        let mut best: BTreeMap<Vec<u8>, Option<f32>> = BTreeMap::new();
        for seg in self.segments.iter().rev() {
            for raw in seg.iter() {
                let dist = if raw.tombstone {
                    None
                } else if seg.pq_encoded() {
                    let table = &tables[&seg.codec_hash()];
                    let m = seg.header().m as usize;
                    Some(table.lookup(&raw.payload[..m], payload_norm(seg, raw.payload)))
                } else {
                    let v: Vec<f32> = raw
                        .payload
                        .chunks_exact(4)
                        .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
                        .collect();
                    Some(self.metric.distance(query, &v))
                };
                best.insert(raw.id.to_vec(), dist);
            }
        }
        for rec in self.memtable.iter() {
            let dist = if rec.tombstone {
                None
            } else {
                Some(self.metric.distance(query, &rec.vector))
            };
            best.insert(rec.id.clone(), dist);
        }

        let mut hits: Vec<(Vec<u8>, f32)> = best
            .into_iter()
            .filter_map(|(id, dist)| dist.map(|d| (id, d)))
            .collect();
        hits.sort_by(|a, b| a.1.total_cmp(&b.1));
        hits.truncate(k);
        Ok(hits)
    }

    /// Latest live record per id across sealed segments only: the
    /// snapshot a replication consumer bootstraps from. Unsealed
    /// memtable writes are not durable and stay out.
    pub fn sealed_live_records(&self) -> Result<Vec<Record>> {
        let mut latest: BTreeMap<Vec<u8>, Record> = BTreeMap::new();
        for seg in self.segments.iter().rev() {
            for raw in seg.iter() {
                let vector = if raw.tombstone {
                    Vec::new()
                } else {
                    decode_segment_payload(seg, raw.payload, &self.codecs)?
                };
                latest.insert(
                    raw.id.to_vec(),
                    Record {
                        id: raw.id.to_vec(),
                        vector,
                        seq: raw.seq,
                        tombstone: raw.tombstone,
                    },
                );
            }
        }
        Ok(latest.into_values().filter(|r| !r.tombstone).collect())
    }

    /// Durable change stream: every sealed record with sequence
    /// greater than `since`, ordered by sequence. Compaction folds
    /// shadowed history, so the stream reflects the current segment
    /// set, not every historical write.
    pub fn sealed_changes_since(&self, since: u64) -> Result<Vec<ChangeRecord>> {
        let mut out = Vec::new();
        for seg in self.segments.iter() {
            if seg.max_seq() <= since {
                continue;
            }
            for raw in seg.iter() {
                if raw.seq <= since {
                    continue;
                }
                let vector = if raw.tombstone {
                    None
                } else {
                    Some(decode_segment_payload(seg, raw.payload, &self.codecs)?)
                };
                out.push(ChangeRecord {
                    seq: raw.seq,
                    id: raw.id.to_vec(),
                    tombstone: raw.tombstone,
                    vector,
                });
            }
        }
        out.sort_by_key(|c| c.seq);
        Ok(out)
    }
}

// ── Seal ───────────────────────────────────────────────────────────

impl VectorStore {
    pub fn should_seal(&self, max_records: usize, max_bytes: usize) -> bool {
        self.memtable.is_over(max_records, max_bytes)
    }

    /// Seal the memtable into a new segment and commit the manifest.
    /// Returns the new segment id, or `None` when the memtable was
    /// empty. After a seal the memtable is empty and the published
    /// segment list includes the new segment.
    pub fn seal(&mut self) -> Result<Option<u64>> {
        if self.memtable.is_empty() {
            return Ok(None);
        }

        let segment_id = self.reserve_segment_id();
        let codec = self.active_codec().cloned();
        let mut writer = match &codec {
            Some(cb) => SegmentWriter::new_pq(
                self.dim,
                cb.hash(),
                cb.m(),
                store_norms(self.metric),
            ),
            None => SegmentWriter::new_raw(self.dim),
        };
        let stride = writer.stride();

        for rec in self.memtable.iter() {
            let payload = if rec.tombstone {
                vec![0u8; stride]
            } else {
                encode_payload(&rec.vector, codec.as_deref(), self.metric, stride)?
            };
            writer.add(rec.id.clone(), rec.tombstone, rec.seq, payload);
        }

        let records = writer.len();
        let segment = self.write_segment(writer, segment_id, 0)?;

        let mut manifest = self.manifest.current().clone();
        manifest.segments.push(SegmentEntry {
            segment_id,
            path: segment_file_name(segment_id),
            generation: 0,
        });
        self.manifest.commit(manifest)?;

        let mut list: Vec<Arc<Segment>> = self.segments.as_ref().clone();
        list.push(segment);
        list.sort_by(|a, b| b.max_seq().cmp(&a.max_seq()));
        self.segments = Arc::new(list);
        self.memtable.clear();

        tracing::info!(segment_id, records, "memtable sealed");
        Ok(Some(segment_id))
    }

    /// Write a prepared segment to disk (or memory when ephemeral)
    /// and open it for reading.
    pub(crate) fn write_segment(
        &self,
        writer: SegmentWriter,
        segment_id: u64,
        generation: u32,
    ) -> Result<Arc<Segment>> {
        let segment = match &self.dir {
            Some(dir) => {
                let (path, _meta) = writer.write_atomic(dir, segment_id)?;
                Segment::open(&path, segment_id, generation)?
            }
            None => {
                let mut buf = Vec::new();
                writer.finish(&mut buf)?;
                Segment::from_bytes(buf, segment_id, generation)?
            }
        };
        Ok(Arc::new(segment))
    }

    /// Allocate a strictly increasing segment id. Shared-borrow safe
    /// so compaction can reserve its output id while seals proceed.
    pub(crate) fn reserve_segment_id(&self) -> u64 {
        self.next_segment_id.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn manifest_mut(&mut self) -> &mut ManifestStore {
        &mut self.manifest
    }

    pub(crate) fn manifest(&self) -> &ManifestStore {
        &self.manifest
    }

    pub(crate) fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub(crate) fn publish_segments(&mut self, segments: Vec<Arc<Segment>>) {
        let mut list = segments;
        list.sort_by(|a, b| b.max_seq().cmp(&a.max_seq()));
        self.segments = Arc::new(list);
    }
}

// ── Codec management ───────────────────────────────────────────────

impl VectorStore {
    /// Publish a newly trained codebook and make it active. Existing
    /// segments keep their own codebook reference; codebooks no
    /// longer referenced anywhere are unlinked after the commit.
    pub fn publish_codec(&mut self, codebook: Codebook) -> Result<CodecHash> {
        if codebook.dim() != self.dim {
            return Err(SvdbError::InvalidShape(format!(
                "codebook dimension {} does not match store dimension {}",
                codebook.dim(),
                self.dim
            )));
        }
        let hash = codebook.hash();
        let file = format!("{}.cb", hash.to_hex());
        if let Some(dir) = &self.dir {
            codebook.save(dir)?;
        }
        self.codecs.insert(hash, Arc::new(codebook));
        self.active_codec = Some(hash);

        let mut manifest = self.manifest.current().clone();
        if !manifest.codecs.iter().any(|(h, _)| *h == hash) {
            manifest.codecs.push((hash, file));
        }
        manifest.active_codec = Some(hash);
        let segments = self.segments();
        self.prune_codecs(&mut manifest, &segments);
        self.manifest.commit(manifest)?;

        tracing::info!(codec = %hash, "codebook published");
        Ok(hash)
    }

    /// Drop manifest entries (and files) for codebooks referenced by
    /// no segment in `segments` and not active. Call before
    /// committing `manifest`, passing the post-commit segment list.
    pub(crate) fn prune_codecs(&mut self, manifest: &mut Manifest, segments: &[Arc<Segment>]) {
        let mut referenced: Vec<CodecHash> = segments
            .iter()
            .map(|s| s.codec_hash())
            .filter(|h| !h.is_zero())
            .collect();
        if let Some(h) = manifest.active_codec {
            referenced.push(h);
        }
        let removed: Vec<(CodecHash, String)> = manifest
            .codecs
            .iter()
            .filter(|(h, _)| !referenced.contains(h))
            .cloned()
            .collect();
        manifest.codecs.retain(|(h, _)| referenced.contains(h));
        for (hash, file) in removed {
            self.codecs.remove(&hash);
            if let Some(dir) = &self.dir {
                let _ = std::fs::remove_file(dir.join(&file));
            }
            tracing::debug!(codec = %hash, "unreferenced codebook unlinked");
        }
    }
}

// ── Payload helpers ────────────────────────────────────────────────

/// Whether PQ payloads for this metric carry a trailing vector norm.
pub fn store_norms(metric: Metric) -> bool {
    !metric.adc_decomposable()
}

/// Encode one vector into a segment payload of the given stride.
pub fn encode_payload(
    vector: &[f32],
    codec: Option<&Codebook>,
    metric: Metric,
    stride: usize,
) -> Result<Vec<u8>> {
    let mut payload = match codec {
        Some(cb) => {
            let mut codes = cb.encode(vector)?;
            if store_norms(metric) {
                codes.extend_from_slice(&metric::l2_norm(vector).to_le_bytes());
            }
            codes
        }
        None => vector.iter().flat_map(|f| f.to_le_bytes()).collect(),
    };
    debug_assert_eq!(payload.len(), stride);
    payload.resize(stride, 0);
    Ok(payload)
}

/// Decode a segment payload back into a vector using the segment's
/// codec descriptor.
pub fn decode_segment_payload(
    segment: &Segment,
    payload: &[u8],
    codecs: &HashMap<CodecHash, Arc<Codebook>>,
) -> Result<Vec<f32>> {
    if !segment.pq_encoded() {
        return Ok(payload
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
            .collect());
    }
    let hash = segment.codec_hash();
    let cb = codecs.get(&hash).ok_or_else(|| {
        SvdbError::CorruptSegment(format!(
            "segment {} references unknown codebook {}",
            segment.id(),
            hash
        ))
    })?;
    cb.decode(&payload[..cb.m()])
}

/// The stored norm of a PQ payload, when the stride carries one.
pub fn payload_norm(segment: &Segment, payload: &[u8]) -> Option<f32> {
    let m = segment.header().m as usize;
    if segment.pq_encoded() && payload.len() == m + 4 {
        Some(f32::from_le_bytes(payload[m..m + 4].try_into().unwrap()))
    } else {
        None
    }
}

/// Compaction support: true while the flag allows more work.
pub fn not_cancelled(cancel: Option<&AtomicBool>) -> bool {
    cancel.map_or(true, |c| !c.load(Ordering::Acquire))
}

// ── Tests ──────────────────────────────────────────────────────────
