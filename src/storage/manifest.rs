//! Durable manifest of the active segment set and codec state.
//!
//! Text, line-oriented, one file per committed version:
//!
//! ```text
//! segment <id> <path> <generation>
//! codec <hash> <path>
//! active_codec <hash>|none
//! crc32 <hex>
//! ```
//!
//! The trailing crc32 line seals the file; readers verify it and fall
//! back to the previous version on mismatch. Commits write the next
//! version via temp + rename + directory fsync, then prune versions
//! older than the previous one. Segments on disk but unreferenced by
//! the loaded manifest are orphans and ignored.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Result, SvdbError};
use crate::pq::CodecHash;
use crate::storage::{fsync_dir, fsync_retry};

const MANIFEST_PREFIX: &str = "MANIFEST-";

/// One active segment as recorded in the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentEntry {
    pub segment_id: u64,
    /// File name relative to the store directory.
    pub path: String,
    pub generation: u32,
}

/// Decoded manifest state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Manifest {
    pub segments: Vec<SegmentEntry>,
    /// Every codebook still referenced by some segment or active.
    pub codecs: Vec<(CodecHash, String)>,
    pub active_codec: Option<CodecHash>,
}

impl Manifest {
    pub fn encode(&self) -> String {
        let mut body = String::new();
        for s in &self.segments {
            body.push_str(&format!(
                "segment {} {} {}\n",
                s.segment_id, s.path, s.generation
            ));
        }
        for (hash, path) in &self.codecs {
            body.push_str(&format!("codec {} {}\n", hash.to_hex(), path));
        }
        match &self.active_codec {
            Some(h) => body.push_str(&format!("active_codec {}\n", h.to_hex())),
            None => body.push_str("active_codec none\n"),
        }
        let crc = crc32fast::hash(body.as_bytes());
        body.push_str(&format!("crc32 {:08x}\n", crc));
        body
    }

    pub fn parse(text: &str) -> Result<Self> {
        let crc_line_start = text
            .trim_end_matches('\n')
            .rfind('\n')
            .map(|i| i + 1)
            .unwrap_or(0);
        let (body, seal) = text.split_at(crc_line_start);
        let seal = seal.trim_end();
        let declared = seal
            .strip_prefix("crc32 ")
            .and_then(|h| u32::from_str_radix(h, 16).ok())
            .ok_or_else(|| SvdbError::CorruptManifest("missing crc32 seal line".into()))?;
        let actual = crc32fast::hash(body.as_bytes());
        if declared != actual {
            return Err(SvdbError::CorruptManifest(format!(
                "crc mismatch: declared {:08x}, computed {:08x}",
                declared, actual
            )));
        }

        let mut manifest = Manifest::default();
        let mut saw_active = false;
        for (ln, line) in body.lines().enumerate() {
            let mut parts = line.split_whitespace();
            match parts.next() {
                Some("segment") => {
                    let (id, path, generation) = (parts.next(), parts.next(), parts.next());
                    let entry = match (id, path, generation) {
                        (Some(id), Some(path), Some(generation)) => SegmentEntry {
                            segment_id: id.parse().map_err(|_| bad_line(ln))?,
                            path: path.to_string(),
                            generation: generation.parse().map_err(|_| bad_line(ln))?,
                        },
                        _ => return Err(bad_line(ln)),
                    };
                    manifest.segments.push(entry);
                }
                Some("codec") => {
                    let (hash, path) = (parts.next(), parts.next());
                    match (hash, path) {
                        (Some(hash), Some(path)) => {
                            let hash = CodecHash::from_hex(hash).ok_or_else(|| bad_line(ln))?;
                            manifest.codecs.push((hash, path.to_string()));
                        }
                        _ => return Err(bad_line(ln)),
                    }
                }
                Some("active_codec") => {
                    saw_active = true;
                    match parts.next() {
                        Some("none") => manifest.active_codec = None,
                        Some(h) => {
                            manifest.active_codec =
                                Some(CodecHash::from_hex(h).ok_or_else(|| bad_line(ln))?);
                        }
                        None => return Err(bad_line(ln)),
                    }
                }
                Some(other) => {
                    return Err(SvdbError::CorruptManifest(format!(
                        "unknown directive '{}' on line {}",
                        other,
                        ln + 1
                    )));
                }
                None => {}
            }
        }
        if !saw_active {
            return Err(SvdbError::CorruptManifest(
                "missing active_codec line".into(),
            ));
        }
        Ok(manifest)
    }
}

fn bad_line(ln: usize) -> SvdbError {
    SvdbError::CorruptManifest(format!("malformed line {}", ln + 1))
}

// ── Manifest Store ─────────────────────────────────────────────────

/// Owns the on-disk manifest lineage for one store directory.
#[derive(Debug)]
pub struct ManifestStore {
    dir: Option<PathBuf>,
    version: u64,
    current: Manifest,
}

impl ManifestStore {
    /// Create a fresh lineage with an empty version 1 manifest.
    pub fn create(dir: &Path) -> Result<Self> {
        let mut store = Self {
            dir: Some(dir.to_path_buf()),
            version: 0,
            current: Manifest::default(),
        };
        store.commit(Manifest::default())?;
        Ok(store)
    }

    /// In-memory lineage for ephemeral stores and tests.
    pub fn ephemeral() -> Self {
        Self {
            dir: None,
            version: 1,
            current: Manifest::default(),
        }
    }

    /// Load the newest verifying manifest, falling back across
    /// versions whose seal fails.
    pub fn open(dir: &Path) -> Result<Self> {
        let mut versions: Vec<(u64, PathBuf)> = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(v) = name.strip_prefix(MANIFEST_PREFIX) {
                if let Ok(v) = v.parse::<u64>() {
                    versions.push((v, entry.path()));
                }
            }
        }
        versions.sort_by(|a, b| b.0.cmp(&a.0));
        if versions.is_empty() {
            return Err(SvdbError::CorruptManifest(format!(
                "no manifest in {}",
                dir.display()
            )));
        }

        for (version, path) in &versions {
            match std::fs::read_to_string(path).map_err(SvdbError::Io).and_then(|t| Manifest::parse(&t)) {
                Ok(current) => {
                    if *version != versions[0].0 {
                        tracing::warn!(
                            version,
                            "newest manifest unreadable, fell back to older version"
                        );
                    }
                    return Ok(Self {
                        dir: Some(dir.to_path_buf()),
                        version: *version,
                        current,
                    });
                }
                Err(err) => {
                    tracing::warn!(version, %err, "skipping unreadable manifest");
                }
            }
        }
        Err(SvdbError::CorruptManifest(
            "no manifest version verifies".into(),
        ))
    }

    pub fn current(&self) -> &Manifest {
        &self.current
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Commit a new manifest version atomically, then prune versions
    /// older than the previous one.
    pub fn commit(&mut self, manifest: Manifest) -> Result<()> {
        let next = self.version + 1;
        if let Some(dir) = &self.dir {
            let name = format!("{}{:06}", MANIFEST_PREFIX, next);
            let path = dir.join(&name);
            let tmp = dir.join(format!("{}.tmp", name));
            {
                let mut file = File::create(&tmp)?;
                file.write_all(manifest.encode().as_bytes())?;
                fsync_retry(&file)?;
            }
            std::fs::rename(&tmp, &path)?;
            fsync_dir(dir)?;

            // Keep current + previous; prune the rest.
            for entry in std::fs::read_dir(dir)? {
                let entry = entry?;
                let name = entry.file_name();
                let name = name.to_string_lossy().to_string();
                if let Some(v) = name.strip_prefix(MANIFEST_PREFIX) {
                    if let Ok(v) = v.parse::<u64>() {
                        if v + 1 < next {
                            let _ = std::fs::remove_file(entry.path());
                        }
                    }
                }
            }
        }
        self.version = next;
        self.current = manifest;
        tracing::debug!(version = next, "manifest committed");
        Ok(())
    }
}

// ── Tests ──────────────────────────────────────────────────────────
