//! Immutable segment reader.
//!
//! A segment is the durable unit of the store: a sorted batch of
//! records plus an in-file id index, produced by sealing a memtable
//! or by compaction, read through a shared memory map.
//!
//! ## Binary layout (little-endian)
//!
//! ```text
//! offset  size   field
//! 0       4      magic "SDBS"
//! 4       2      format_version (=1)
//! 6       2      flags (bit0=pq_encoded, bit1=has_graph_fragment)
//! 8       4      dim
//! 12      4      record_count
//! 16      8      min_sequence
//! 24      8      max_sequence
//! 32      16     codec_hash (0 if raw)
//! 48      4      m (PQ subspaces; 0 if raw)
//! 52      4      stride (bytes per record payload)
//! 56      8      id_index_offset
//! 64      8      graph_fragment_offset (0 if absent)
//! 72      ...    record block: u16 id_len, id bytes,
//!                u8 flags (bit0=tombstone), u64 sequence,
//!                stride payload bytes
//! ...     ...    id index: sorted (u16 id_len, id bytes,
//!                u64 record_offset)
//! ```

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use memmap2::Mmap;

use crate::error::{Result, SvdbError};
use crate::pq::CodecHash;

// ── Constants ──────────────────────────────────────────────────────

/// Magic bytes for segment files.
pub const SEGMENT_MAGIC: [u8; 4] = *b"SDBS";

/// Segment format version.
pub const SEGMENT_VERSION: u16 = 1;

/// Fixed header size in bytes.
pub const SEGMENT_HEADER_SIZE: usize = 72;

/// Header flag: payloads are PQ code bytes, not raw floats.
pub const FLAG_PQ_ENCODED: u16 = 1 << 0;

/// Header flag: an in-file graph fragment follows the id index.
/// The current writer keeps the fragment in a co-located file and
/// never sets this bit; readers tolerate it for forward compat.
pub const FLAG_HAS_GRAPH_FRAGMENT: u16 = 1 << 1;

// ── Header ─────────────────────────────────────────────────────────

/// Parsed segment header, exactly `SEGMENT_HEADER_SIZE` bytes on disk.
#[derive(Debug, Clone, Copy)]
pub struct SegmentHeader {
    pub flags: u16,
    pub dim: u32,
    pub record_count: u32,
    pub min_seq: u64,
    pub max_seq: u64,
    pub codec_hash: CodecHash,
    pub m: u32,
    pub stride: u32,
    pub id_index_offset: u64,
    pub graph_fragment_offset: u64,
}

impl SegmentHeader {
    pub fn pq_encoded(&self) -> bool {
        self.flags & FLAG_PQ_ENCODED != 0
    }

    /// Parse and validate from at least `SEGMENT_HEADER_SIZE` bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < SEGMENT_HEADER_SIZE {
            return Err(SvdbError::CorruptSegment(
                "file too small for segment header".into(),
            ));
        }
        if bytes[0..4] != SEGMENT_MAGIC {
            return Err(SvdbError::CorruptSegment(format!(
                "not a segment: expected SDBS, got {:?}",
                &bytes[0..4]
            )));
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != SEGMENT_VERSION {
            return Err(SvdbError::CorruptSegment(format!(
                "unsupported segment version: {}",
                version
            )));
        }
        let mut codec_hash = [0u8; 16];
        codec_hash.copy_from_slice(&bytes[32..48]);
        Ok(Self {
            flags: u16::from_le_bytes([bytes[6], bytes[7]]),
            dim: u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
            record_count: u32::from_le_bytes(bytes[12..16].try_into().unwrap()),
            min_seq: u64::from_le_bytes(bytes[16..24].try_into().unwrap()),
            max_seq: u64::from_le_bytes(bytes[24..32].try_into().unwrap()),
            codec_hash: CodecHash(codec_hash),
            m: u32::from_le_bytes(bytes[48..52].try_into().unwrap()),
            stride: u32::from_le_bytes(bytes[52..56].try_into().unwrap()),
            id_index_offset: u64::from_le_bytes(bytes[56..64].try_into().unwrap()),
            graph_fragment_offset: u64::from_le_bytes(bytes[64..72].try_into().unwrap()),
        })
    }

    /// Write exactly `SEGMENT_HEADER_SIZE` bytes.
    pub fn write_to<W: std::io::Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(&SEGMENT_MAGIC)?;
        w.write_all(&SEGMENT_VERSION.to_le_bytes())?;
        w.write_all(&self.flags.to_le_bytes())?;
        w.write_all(&self.dim.to_le_bytes())?;
        w.write_all(&self.record_count.to_le_bytes())?;
        w.write_all(&self.min_seq.to_le_bytes())?;
        w.write_all(&self.max_seq.to_le_bytes())?;
        w.write_all(&self.codec_hash.0)?;
        w.write_all(&self.m.to_le_bytes())?;
        w.write_all(&self.stride.to_le_bytes())?;
        w.write_all(&self.id_index_offset.to_le_bytes())?;
        w.write_all(&self.graph_fragment_offset.to_le_bytes())?;
        Ok(())
    }
}

// ── Records ────────────────────────────────────────────────────────

/// A record as stored, borrowed from the segment bytes. The payload
/// is raw floats or PQ codes depending on the segment's codec.
#[derive(Debug, Clone, Copy)]
pub struct RawRecord<'a> {
    pub id: &'a [u8],
    pub tombstone: bool,
    pub seq: u64,
    pub payload: &'a [u8],
}

/// One id-index entry, resolved to byte ranges at open.
struct IndexEntry {
    id_start: usize,
    id_len: usize,
    record_offset: usize,
}

enum SegmentData {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl SegmentData {
    fn bytes(&self) -> &[u8] {
        match self {
            SegmentData::Mapped(m) => m,
            SegmentData::Owned(v) => v,
        }
    }
}

// ── Segment ────────────────────────────────────────────────────────

/// Immutable segment reader (memory-mapped or from bytes).
///
/// Shared read-only across readers; the owning store hands out
/// `Arc<Segment>` snapshots. A segment retired by compaction is
/// unlinked when the last reference drops.
pub struct Segment {
    data: SegmentData,
    header: SegmentHeader,
    index: Vec<IndexEntry>,
    segment_id: u64,
    generation: u32,
    path: Option<PathBuf>,
    unlink_on_drop: AtomicBool,
}

impl Segment {
    /// Open a segment file via mmap and validate its structure.
    pub fn open(path: &Path, segment_id: u64, generation: u32) -> Result<Self> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file) }?;
        Self::parse(
            SegmentData::Mapped(mmap),
            segment_id,
            generation,
            Some(path.to_path_buf()),
        )
    }

    /// Build a segment from owned bytes (ephemeral stores, tests).
    pub fn from_bytes(bytes: Vec<u8>, segment_id: u64, generation: u32) -> Result<Self> {
        Self::parse(SegmentData::Owned(bytes), segment_id, generation, None)
    }

    fn parse(
        data: SegmentData,
        segment_id: u64,
        generation: u32,
        path: Option<PathBuf>,
    ) -> Result<Self> {
        let bytes = data.bytes();
        let header = SegmentHeader::from_bytes(bytes)?;

        let n = header.record_count as usize;
        let stride = header.stride as usize;
        let index_off = header.id_index_offset as usize;
        if index_off < SEGMENT_HEADER_SIZE || index_off > bytes.len() {
            return Err(SvdbError::CorruptSegment(format!(
                "id index offset {} out of bounds",
                index_off
            )));
        }
        if header.pq_encoded() && header.m == 0 {
            return Err(SvdbError::CorruptSegment(
                "pq segment with zero subspaces".into(),
            ));
        }
        // Smallest possible index entry is 11 bytes (1-byte id); a
        // record count the file cannot hold is corruption, not an
        // allocation request.
        if (bytes.len() - index_off) / 11 < n {
            return Err(SvdbError::CorruptSegment(format!(
                "record count {} exceeds index capacity",
                n
            )));
        }

        // Walk the id index, bounds-checking every entry and the
        // record it points at. After this pass accessors can slice
        // without re-validating.
        let mut index = Vec::with_capacity(n);
        let mut off = index_off;
        let mut prev_id_end: Option<(usize, usize)> = None;
        for i in 0..n {
            if off + 2 > bytes.len() {
                return Err(SvdbError::CorruptSegment(format!(
                    "id index truncated at entry {}",
                    i
                )));
            }
            let id_len = u16::from_le_bytes([bytes[off], bytes[off + 1]]) as usize;
            let id_start = off + 2;
            if id_start + id_len + 8 > bytes.len() {
                return Err(SvdbError::CorruptSegment(format!(
                    "id index entry {} overruns file",
                    i
                )));
            }
            let record_offset = u64::from_le_bytes(
                bytes[id_start + id_len..id_start + id_len + 8]
                    .try_into()
                    .unwrap(),
            ) as usize;

            // Validate the record this entry points at.
            if record_offset + 2 > index_off {
                return Err(SvdbError::CorruptSegment(format!(
                    "record offset {} outside record block",
                    record_offset
                )));
            }
            let rec_id_len =
                u16::from_le_bytes([bytes[record_offset], bytes[record_offset + 1]]) as usize;
            let rec_end = record_offset + 2 + rec_id_len + 1 + 8 + stride;
            if rec_id_len != id_len || rec_end > index_off {
                return Err(SvdbError::CorruptSegment(format!(
                    "record at {} inconsistent with index entry {}",
                    record_offset, i
                )));
            }

            // Index must be sorted strictly ascending by id.
            let id = &bytes[id_start..id_start + id_len];
            if let Some((ps, pl)) = prev_id_end {
                if id <= &bytes[ps..ps + pl] {
                    return Err(SvdbError::CorruptSegment(
                        "id index not sorted".into(),
                    ));
                }
            }
            prev_id_end = Some((id_start, id_len));

            index.push(IndexEntry {
                id_start,
                id_len,
                record_offset,
            });
            off = id_start + id_len + 8;
        }

        Ok(Self {
            data,
            header,
            index,
            segment_id,
            generation,
            path,
            unlink_on_drop: AtomicBool::new(false),
        })
    }

    // ── Accessors ──────────────────────────────────────────────────

    pub fn id(&self) -> u64 {
        self.segment_id
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn header(&self) -> &SegmentHeader {
        &self.header
    }

    pub fn record_count(&self) -> usize {
        self.header.record_count as usize
    }

    pub fn min_seq(&self) -> u64 {
        self.header.min_seq
    }

    pub fn max_seq(&self) -> u64 {
        self.header.max_seq
    }

    pub fn codec_hash(&self) -> CodecHash {
        self.header.codec_hash
    }

    pub fn pq_encoded(&self) -> bool {
        self.header.pq_encoded()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Schedule file removal for when the last reference drops.
    pub fn mark_unlink_on_drop(&self) {
        self.unlink_on_drop.store(true, Ordering::Release);
    }

    // ── Lookup ─────────────────────────────────────────────────────

    /// Point lookup by id via binary search over the id index.
    pub fn get(&self, id: &[u8]) -> Option<RawRecord<'_>> {
        let bytes = self.data.bytes();
        let found = self
            .index
            .binary_search_by(|e| bytes[e.id_start..e.id_start + e.id_len].cmp(id))
            .ok()?;
        Some(self.record_at(self.index[found].record_offset))
    }

    pub fn contains(&self, id: &[u8]) -> bool {
        self.get(id).is_some()
    }

    /// Records in id order.
    pub fn iter(&self) -> impl Iterator<Item = RawRecord<'_>> {
        self.index
            .iter()
            .map(move |e| self.record_at(e.record_offset))
    }

    fn record_at(&self, offset: usize) -> RawRecord<'_> {
        let bytes = self.data.bytes();
        let id_len = u16::from_le_bytes([bytes[offset], bytes[offset + 1]]) as usize;
        let id = &bytes[offset + 2..offset + 2 + id_len];
        let flags = bytes[offset + 2 + id_len];
        let seq_off = offset + 2 + id_len + 1;
        let seq = u64::from_le_bytes(bytes[seq_off..seq_off + 8].try_into().unwrap());
        let payload = &bytes[seq_off + 8..seq_off + 8 + self.header.stride as usize];
        RawRecord {
            id,
            tombstone: flags & 1 != 0,
            seq,
            payload,
        }
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if self.unlink_on_drop.load(Ordering::Acquire) {
            if let Some(path) = &self.path {
                let _ = std::fs::remove_file(path);
            }
        }
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("segment_id", &self.segment_id)
            .field("generation", &self.generation)
            .field("record_count", &self.header.record_count)
            .field("min_seq", &self.header.min_seq)
            .field("max_seq", &self.header.max_seq)
            .finish()
    }
}

// ── Tests ──────────────────────────────────────────────────────────
