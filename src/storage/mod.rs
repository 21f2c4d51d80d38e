//! Segmented vector storage.
//!
//! An LSM-style layout specialized to fixed-shape vector payloads:
//! writes absorb into an ordered in-memory memtable, seal into
//! immutable mmap'd segment files, and merge under compaction. The
//! manifest records the durable segment set and the active codec.

pub mod manifest;
pub mod memtable;
pub mod segment;
pub mod store;
pub mod writer;

use std::fs::File;
use std::io;

pub use manifest::{Manifest, ManifestStore, SegmentEntry};
pub use memtable::{Memtable, Record};
pub use segment::{RawRecord, Segment, SegmentHeader};
pub use store::VectorStore;
pub use writer::{SegmentMeta, SegmentWriter};

/// Identifiers are length-prefixed with a u16 on disk.
pub const MAX_ID_LEN: usize = u16::MAX as usize;

/// fsync, retrying transient EINTR. The only retry the engine does
/// on its own; everything else is the caller's policy.
pub fn fsync_retry(file: &File) -> io::Result<()> {
    loop {
        match file.sync_all() {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

/// fsync a directory so a rename within it is durable.
pub fn fsync_dir(dir: &std::path::Path) -> io::Result<()> {
    let f = File::open(dir)?;
    fsync_retry(&f)
}
