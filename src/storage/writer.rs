//! Segment writer.
//!
//! Accumulates encoded records in memory, then writes the record
//! block, the sorted id index, and a back-patched-free header in one
//! forward pass (all offsets are computable up front). Durable writes
//! go through a temp file, fsync, rename, directory fsync.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::{Result, SvdbError};
use crate::pq::CodecHash;
use crate::storage::segment::{SegmentHeader, FLAG_PQ_ENCODED, SEGMENT_HEADER_SIZE};
use crate::storage::{fsync_dir, fsync_retry, MAX_ID_LEN};

/// Metadata about a written segment, for the manifest update.
#[derive(Debug, Clone)]
pub struct SegmentMeta {
    pub record_count: u32,
    pub min_seq: u64,
    pub max_seq: u64,
    pub byte_size: u64,
}

/// Builds one immutable segment. Payloads arrive already encoded
/// (raw floats or PQ codes); the writer only owns layout.
pub struct SegmentWriter {
    dim: u32,
    flags: u16,
    codec_hash: CodecHash,
    m: u32,
    stride: usize,
    /// (id, tombstone, seq, payload)
    records: Vec<(Vec<u8>, bool, u64, Vec<u8>)>,
}

impl SegmentWriter {
    /// Writer for raw (uncompressed) payloads: stride is `dim * 4`.
    pub fn new_raw(dim: usize) -> Self {
        Self {
            dim: dim as u32,
            flags: 0,
            codec_hash: CodecHash::ZERO,
            m: 0,
            stride: dim * 4,
            records: Vec::new(),
        }
    }

    /// Writer for PQ payloads: stride is `m` code bytes, plus a
    /// trailing f32 norm when `with_norm` (cosine/angular stores).
    pub fn new_pq(dim: usize, codec_hash: CodecHash, m: usize, with_norm: bool) -> Self {
        Self {
            dim: dim as u32,
            flags: FLAG_PQ_ENCODED,
            codec_hash,
            m: m as u32,
            stride: m + if with_norm { 4 } else { 0 },
            records: Vec::new(),
        }
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Queue a record. Ids and payload widths are the caller's
    /// contract; both are asserted here.
    pub fn add(&mut self, id: Vec<u8>, tombstone: bool, seq: u64, payload: Vec<u8>) {
        debug_assert!(!id.is_empty() && id.len() <= MAX_ID_LEN);
        debug_assert_eq!(payload.len(), self.stride, "payload must match stride");
        self.records.push((id, tombstone, seq, payload));
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Write the segment. Consumes self; records are sorted by id.
    pub fn finish<W: Write>(mut self, w: &mut W) -> Result<SegmentMeta> {
        self.records.sort_by(|a, b| a.0.cmp(&b.0));
        for pair in self.records.windows(2) {
            if pair[0].0 == pair[1].0 {
                return Err(SvdbError::InvalidShape(format!(
                    "duplicate id in segment: {:?}",
                    pair[0].0
                )));
            }
        }

        let n = self.records.len();
        let mut min_seq = u64::MAX;
        let mut max_seq = 0u64;
        let mut record_block = 0usize;
        for (id, _, seq, _) in &self.records {
            min_seq = min_seq.min(*seq);
            max_seq = max_seq.max(*seq);
            record_block += 2 + id.len() + 1 + 8 + self.stride;
        }
        if n == 0 {
            min_seq = 0;
        }
        let id_index_offset = (SEGMENT_HEADER_SIZE + record_block) as u64;

        let header = SegmentHeader {
            flags: self.flags,
            dim: self.dim,
            record_count: n as u32,
            min_seq,
            max_seq,
            codec_hash: self.codec_hash,
            m: self.m,
            stride: self.stride as u32,
            id_index_offset,
            graph_fragment_offset: 0,
        };
        header.write_to(w)?;

        // Record block, tracking each record's offset for the index.
        let mut offsets = Vec::with_capacity(n);
        let mut off = SEGMENT_HEADER_SIZE as u64;
        for (id, tombstone, seq, payload) in &self.records {
            offsets.push(off);
            w.write_all(&(id.len() as u16).to_le_bytes())?;
            w.write_all(id)?;
            w.write_all(&[u8::from(*tombstone)])?;
            w.write_all(&seq.to_le_bytes())?;
            w.write_all(payload)?;
            off += (2 + id.len() + 1 + 8 + self.stride) as u64;
        }

        // Id index (already id-sorted).
        let mut index_bytes = 0u64;
        for ((id, _, _, _), rec_off) in self.records.iter().zip(&offsets) {
            w.write_all(&(id.len() as u16).to_le_bytes())?;
            w.write_all(id)?;
            w.write_all(&rec_off.to_le_bytes())?;
            index_bytes += (2 + id.len() + 8) as u64;
        }
        w.flush()?;

        Ok(SegmentMeta {
            record_count: n as u32,
            min_seq,
            max_seq,
            byte_size: id_index_offset + index_bytes,
        })
    }

    /// Write atomically into `dir` as `segment-<id>.seg`:
    /// temp file, fsync, rename, directory fsync.
    pub fn write_atomic(self, dir: &Path, segment_id: u64) -> Result<(PathBuf, SegmentMeta)> {
        let name = segment_file_name(segment_id);
        let path = dir.join(&name);
        let tmp = dir.join(format!("{}.tmp", name));

        let meta = {
            let file = File::create(&tmp)?;
            let mut buf = BufWriter::new(file);
            let meta = self.finish(&mut buf)?;
            let file = buf
                .into_inner()
                .map_err(|e| SvdbError::Io(e.into_error()))?;
            fsync_retry(&file)?;
            meta
        };
        std::fs::rename(&tmp, &path)?;
        fsync_dir(dir)?;
        Ok((path, meta))
    }
}

/// Canonical segment file name for a segment id.
pub fn segment_file_name(segment_id: u64) -> String {
    format!("segment-{:08}.seg", segment_id)
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::segment::Segment;

    fn payload(v: &[f32]) -> Vec<u8> {
        v.iter().flat_map(|f| f.to_le_bytes()).collect()
    }

    #[test]
    fn test_writer_sorts_by_id() {
        let mut w = SegmentWriter::new_raw(1);
        w.add(b"zz".to_vec(), false, 1, payload(&[1.0]));
        w.add(b"aa".to_vec(), false, 2, payload(&[2.0]));
        let mut buf = Vec::new();
        let meta = w.finish(&mut buf).unwrap();
        assert_eq!(meta.record_count, 2);
        assert_eq!(meta.min_seq, 1);
        assert_eq!(meta.max_seq, 2);

        let seg = Segment::from_bytes(buf, 1, 0).unwrap();
        let ids: Vec<Vec<u8>> = seg.iter().map(|r| r.id.to_vec()).collect();
        assert_eq!(ids, vec![b"aa".to_vec(), b"zz".to_vec()]);
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let mut w = SegmentWriter::new_raw(1);
        w.add(b"a".to_vec(), false, 1, payload(&[1.0]));
        w.add(b"a".to_vec(), false, 2, payload(&[2.0]));
        let mut buf = Vec::new();
        assert!(matches!(
            w.finish(&mut buf),
            Err(SvdbError::InvalidShape(_))
        ));
    }

    #[test]
    fn test_empty_segment() {
        let w = SegmentWriter::new_raw(4);
        let mut buf = Vec::new();
        let meta = w.finish(&mut buf).unwrap();
        assert_eq!(meta.record_count, 0);
        let seg = Segment::from_bytes(buf, 1, 0).unwrap();
        assert_eq!(seg.record_count(), 0);
    }

    #[test]
    fn test_pq_stride_with_norm() {
        let w = SegmentWriter::new_pq(8, CodecHash([1u8; 16]), 4, true);
        assert_eq!(w.stride(), 8);
        let w = SegmentWriter::new_pq(8, CodecHash([1u8; 16]), 4, false);
        assert_eq!(w.stride(), 4);
    }

    #[test]
    fn test_pq_header_fields() {
        let hash = CodecHash([7u8; 16]);
        let mut w = SegmentWriter::new_pq(8, hash, 4, false);
        w.add(b"x".to_vec(), false, 3, vec![0, 1, 2, 3]);
        let mut buf = Vec::new();
        w.finish(&mut buf).unwrap();

        let seg = Segment::from_bytes(buf, 5, 1).unwrap();
        assert!(seg.pq_encoded());
        assert_eq!(seg.codec_hash(), hash);
        assert_eq!(seg.header().m, 4);
        assert_eq!(seg.header().stride, 4);
    }

    #[test]
    fn test_write_atomic_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = SegmentWriter::new_raw(2);
        w.add(b"a".to_vec(), false, 1, payload(&[1.0, 2.0]));
        let (path, meta) = w.write_atomic(dir.path(), 12).unwrap();

        assert_eq!(path.file_name().unwrap().to_str().unwrap(), "segment-00000012.seg");
        assert!(path.exists());
        assert!(meta.byte_size > 0);

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());

        let seg = Segment::open(&path, 12, 0).unwrap();
        assert_eq!(seg.record_count(), 1);
    }

    #[test]
    fn test_byte_size_matches_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = SegmentWriter::new_raw(3);
        for i in 0..20u64 {
            w.add(
                format!("id{:02}", i).into_bytes(),
                i % 5 == 0,
                i,
                payload(&[0.0, 1.0, 2.0]),
            );
        }
        let (path, meta) = w.write_atomic(dir.path(), 1).unwrap();
        let on_disk = std::fs::metadata(&path).unwrap().len();
        assert_eq!(meta.byte_size, on_disk);
    }
}
