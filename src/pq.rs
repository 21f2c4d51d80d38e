//! Product-Quantization codec.
//!
//! Splits vectors into `m` contiguous subspaces, trains `2^nbits`
//! centroids per subspace (k-means++ seeding, Lloyd refinement), and
//! encodes each vector as one centroid index per subspace. Queries
//! stay uncompressed and use asymmetric distance tables.
//!
//! Codebooks are content-addressed: SHA-256 over the parameters and
//! centroid block, truncated to 16 bytes. The hex form is the file
//! name stem. A published codebook is immutable; retraining yields a
//! new hash.

use std::collections::HashSet;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use sha2::{Digest, Sha256};

use crate::error::{Result, SvdbError};
use crate::metric::{self, Metric};
use crate::storage::fsync_retry;

/// Magic bytes for codebook files.
pub const CODEBOOK_MAGIC: [u8; 4] = *b"SDBC";

/// Codebook format version.
pub const CODEBOOK_VERSION: u16 = 1;

/// Codebook header size: magic + version + dim + m + nbits.
pub const CODEBOOK_HEADER_SIZE: usize = 4 + 2 + 4 + 4 + 4;

/// Seed for deterministic training. Same samples, same codebook,
/// same content hash.
const TRAIN_SEED: u64 = 0x5dbc_0de5;

// ── Codec Hash ─────────────────────────────────────────────────────

/// Truncated SHA-256 identifying a codebook. All-zero means "raw".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct CodecHash(pub [u8; 16]);

impl CodecHash {
    pub const ZERO: CodecHash = CodecHash([0u8; 16]);

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 16]
    }

    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(32);
        for b in self.0 {
            s.push_str(&format!("{:02x}", b));
        }
        s
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 32 {
            return None;
        }
        let mut out = [0u8; 16];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hi = (chunk[0] as char).to_digit(16)?;
            let lo = (chunk[1] as char).to_digit(16)?;
            out[i] = ((hi << 4) | lo) as u8;
        }
        Some(CodecHash(out))
    }
}

impl std::fmt::Display for CodecHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

// ── Codebook ───────────────────────────────────────────────────────

/// Trained PQ codebook: `m` subspaces of `2^nbits` centroids each.
#[derive(Debug, Clone)]
pub struct Codebook {
    dim: usize,
    m: usize,
    nbits: usize,
    /// Per-subspace centroid block, `k * (dim/m)` floats flat.
    centroids: Vec<Vec<f32>>,
    hash: CodecHash,
}

impl Codebook {
    /// Train a codebook on sample vectors.
    ///
    /// Fails with `InvalidShape` when `m` does not divide `dim`,
    /// `nbits` is outside 1..=8, or a sample has the wrong length;
    /// with `InsufficientTrainingData` when some subspace has fewer
    /// than `2^nbits` distinct points.
    pub fn train(
        samples: &[Vec<f32>],
        dim: usize,
        m: usize,
        nbits: usize,
        max_iters: usize,
    ) -> Result<Self> {
        if m == 0 || dim % m != 0 {
            return Err(SvdbError::InvalidShape(format!(
                "subspace count {} must divide dimension {}",
                m, dim
            )));
        }
        if nbits == 0 || nbits > 8 {
            return Err(SvdbError::InvalidShape(format!(
                "nbits must be in 1..=8, got {}",
                nbits
            )));
        }
        for v in samples {
            if v.len() != dim {
                return Err(SvdbError::InvalidShape(format!(
                    "training vector has dimension {}, engine dimension is {}",
                    v.len(),
                    dim
                )));
            }
        }
        let k = 1usize << nbits;
        if samples.len() < k {
            return Err(SvdbError::InsufficientTrainingData(format!(
                "{} samples for {} centroids",
                samples.len(),
                k
            )));
        }

        let sub = dim / m;
        let centroids: Vec<Result<Vec<f32>>> = (0..m)
            .into_par_iter()
            .map(|si| {
                let start = si * sub;
                let subvecs: Vec<&[f32]> =
                    samples.iter().map(|v| &v[start..start + sub]).collect();
                let distinct = count_distinct(&subvecs, k + 1);
                if distinct < k {
                    return Err(SvdbError::InsufficientTrainingData(format!(
                        "subspace {} has {} distinct points, need {}",
                        si, distinct, k
                    )));
                }
                let mut rng = StdRng::seed_from_u64(TRAIN_SEED.wrapping_add(si as u64));
                Ok(kmeans(&subvecs, sub, k, max_iters, &mut rng))
            })
            .collect();

        let mut blocks = Vec::with_capacity(m);
        for c in centroids {
            blocks.push(c?);
        }

        let hash = content_hash(dim, m, nbits, &blocks);
        Ok(Self {
            dim,
            m,
            nbits,
            centroids: blocks,
            hash,
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn m(&self) -> usize {
        self.m
    }

    pub fn nbits(&self) -> usize {
        self.nbits
    }

    /// Centroids per subspace.
    pub fn k(&self) -> usize {
        1 << self.nbits
    }

    /// Subspace width.
    pub fn sub_dim(&self) -> usize {
        self.dim / self.m
    }

    pub fn hash(&self) -> CodecHash {
        self.hash
    }

    fn centroid(&self, subspace: usize, code: usize) -> &[f32] {
        let sub = self.sub_dim();
        &self.centroids[subspace][code * sub..(code + 1) * sub]
    }

    /// Encode a vector as `m` code bytes (nearest centroid under L2
    /// per subspace).
    pub fn encode(&self, vector: &[f32]) -> Result<Vec<u8>> {
        if vector.len() != self.dim {
            return Err(SvdbError::InvalidShape(format!(
                "vector has dimension {}, codebook dimension is {}",
                vector.len(),
                self.dim
            )));
        }
        let sub = self.sub_dim();
        let mut codes = Vec::with_capacity(self.m);
        for si in 0..self.m {
            let slice = &vector[si * sub..(si + 1) * sub];
            let mut best = 0usize;
            let mut best_dist = f32::INFINITY;
            for c in 0..self.k() {
                let d = metric::l2_squared(slice, self.centroid(si, c));
                if d < best_dist {
                    best_dist = d;
                    best = c;
                }
            }
            codes.push(best as u8);
        }
        Ok(codes)
    }

    /// Reconstruct the (lossy) vector from code bytes.
    pub fn decode(&self, codes: &[u8]) -> Result<Vec<f32>> {
        if codes.len() != self.m {
            return Err(SvdbError::InvalidShape(format!(
                "{} code bytes for {} subspaces",
                codes.len(),
                self.m
            )));
        }
        let mut out = Vec::with_capacity(self.dim);
        for (si, &c) in codes.iter().enumerate() {
            out.extend_from_slice(self.centroid(si, c as usize));
        }
        Ok(out)
    }

    // ── File IO ────────────────────────────────────────────────────

    /// Serialize: SDBC header then centroid floats, little-endian.
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(&CODEBOOK_MAGIC)?;
        w.write_all(&CODEBOOK_VERSION.to_le_bytes())?;
        w.write_all(&(self.dim as u32).to_le_bytes())?;
        w.write_all(&(self.m as u32).to_le_bytes())?;
        w.write_all(&(self.nbits as u32).to_le_bytes())?;
        for block in &self.centroids {
            for &f in block {
                w.write_all(&f.to_le_bytes())?;
            }
        }
        Ok(())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < CODEBOOK_HEADER_SIZE {
            return Err(SvdbError::CorruptSegment(
                "codebook file too small".into(),
            ));
        }
        if bytes[0..4] != CODEBOOK_MAGIC {
            return Err(SvdbError::CorruptSegment(format!(
                "not a codebook: bad magic {:?}",
                &bytes[0..4]
            )));
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != CODEBOOK_VERSION {
            return Err(SvdbError::CorruptSegment(format!(
                "unsupported codebook version {}",
                version
            )));
        }
        let dim = u32::from_le_bytes(bytes[6..10].try_into().unwrap()) as usize;
        let m = u32::from_le_bytes(bytes[10..14].try_into().unwrap()) as usize;
        let nbits = u32::from_le_bytes(bytes[14..18].try_into().unwrap()) as usize;
        if m == 0 || dim == 0 || dim % m != 0 || nbits == 0 || nbits > 8 {
            return Err(SvdbError::CorruptSegment(format!(
                "codebook shape invalid: dim={} m={} nbits={}",
                dim, m, nbits
            )));
        }
        let k = 1usize << nbits;
        let sub = dim / m;
        let expected = CODEBOOK_HEADER_SIZE + m * k * sub * 4;
        if bytes.len() != expected {
            return Err(SvdbError::CorruptSegment(format!(
                "codebook size {} does not match shape (expected {})",
                bytes.len(),
                expected
            )));
        }

        let mut centroids = Vec::with_capacity(m);
        let mut off = CODEBOOK_HEADER_SIZE;
        for _ in 0..m {
            let mut block = Vec::with_capacity(k * sub);
            for _ in 0..k * sub {
                block.push(f32::from_le_bytes(bytes[off..off + 4].try_into().unwrap()));
                off += 4;
            }
            centroids.push(block);
        }

        let hash = content_hash(dim, m, nbits, &centroids);
        Ok(Self {
            dim,
            m,
            nbits,
            centroids,
            hash,
        })
    }

    /// Write the codebook into `dir`, named by its content hash.
    /// Atomic: temp file, fsync, rename, directory fsync.
    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        let name = format!("{}.cb", self.hash.to_hex());
        let path = dir.join(&name);
        let tmp = dir.join(format!("{}.cb.tmp", self.hash.to_hex()));
        {
            let mut file = File::create(&tmp)?;
            self.write_to(&mut file)?;
            fsync_retry(&file)?;
        }
        std::fs::rename(&tmp, &path)?;
        let dirf = File::open(dir)?;
        fsync_retry(&dirf)?;
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let mut bytes = Vec::new();
        File::open(path)?.read_to_end(&mut bytes)?;
        Self::from_bytes(&bytes)
    }
}

fn content_hash(dim: usize, m: usize, nbits: usize, centroids: &[Vec<f32>]) -> CodecHash {
    let mut hasher = Sha256::new();
    hasher.update((dim as u32).to_le_bytes());
    hasher.update((m as u32).to_le_bytes());
    hasher.update((nbits as u32).to_le_bytes());
    for block in centroids {
        for &f in block {
            hasher.update(f.to_le_bytes());
        }
    }
    let digest = hasher.finalize();
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest[0..16]);
    CodecHash(out)
}

/// Count distinct points, stopping once `cap` is reached.
fn count_distinct(subvecs: &[&[f32]], cap: usize) -> usize {
    let mut seen: HashSet<Vec<u32>> = HashSet::new();
    for v in subvecs {
        seen.insert(v.iter().map(|f| f.to_bits()).collect());
        if seen.len() >= cap {
            break;
        }
    }
    seen.len()
}

// ── K-Means ────────────────────────────────────────────────────────

/// Lloyd's algorithm with k-means++ seeding.
fn kmeans(points: &[&[f32]], dim: usize, k: usize, max_iters: usize, rng: &mut StdRng) -> Vec<f32> {
    let mut centroids = kmeans_pp_init(points, dim, k, rng);
    let mut assignment = vec![0usize; points.len()];

    for _ in 0..max_iters {
        // Assignment step.
        let mut changed = false;
        for (pi, p) in points.iter().enumerate() {
            let mut best = 0usize;
            let mut best_dist = f32::INFINITY;
            for c in 0..k {
                let d = metric::l2_squared(p, &centroids[c * dim..(c + 1) * dim]);
                if d < best_dist {
                    best_dist = d;
                    best = c;
                }
            }
            if assignment[pi] != best {
                assignment[pi] = best;
                changed = true;
            }
        }

        // Update step.
        let mut sums = vec![0.0f64; k * dim];
        let mut counts = vec![0usize; k];
        for (pi, p) in points.iter().enumerate() {
            let c = assignment[pi];
            counts[c] += 1;
            for (j, &x) in p.iter().enumerate() {
                sums[c * dim + j] += x as f64;
            }
        }
        for c in 0..k {
            if counts[c] == 0 {
                // Re-seed a dead centroid on a random point.
                let p = points[rng.gen_range(0..points.len())];
                centroids[c * dim..(c + 1) * dim].copy_from_slice(p);
                changed = true;
                continue;
            }
            for j in 0..dim {
                centroids[c * dim + j] = (sums[c * dim + j] / counts[c] as f64) as f32;
            }
        }

        if !changed {
            break;
        }
    }

    centroids
}

/// K-means++ seeding: first centroid uniform, the rest D²-weighted.
fn kmeans_pp_init(points: &[&[f32]], dim: usize, k: usize, rng: &mut StdRng) -> Vec<f32> {
    let mut centroids = Vec::with_capacity(k * dim);
    let first = points[rng.gen_range(0..points.len())];
    centroids.extend_from_slice(first);

    let mut dists: Vec<f32> = points
        .iter()
        .map(|p| metric::l2_squared(p, first))
        .collect();

    for _ in 1..k {
        let total: f64 = dists.iter().map(|&d| d as f64).sum();
        let pick = if total <= 0.0 {
            rng.gen_range(0..points.len())
        } else {
            let mut target = rng.gen_range(0.0..total);
            let mut idx = points.len() - 1;
            for (i, &d) in dists.iter().enumerate() {
                target -= d as f64;
                if target <= 0.0 {
                    idx = i;
                    break;
                }
            }
            idx
        };
        let chosen = points[pick];
        centroids.extend_from_slice(chosen);
        for (i, p) in points.iter().enumerate() {
            let d = metric::l2_squared(p, chosen);
            if d < dists[i] {
                dists[i] = d;
            }
        }
    }

    centroids
}

// ── Asymmetric Distance ────────────────────────────────────────────

/// Per-query lookup table for asymmetric distance computation.
///
/// Decomposable metrics (euclidean, manhattan, dot) accumulate a
/// per-subspace term. Cosine and angular accumulate subspace dot
/// products and normalize with the query norm and the stored vector
/// norm carried in the segment payload.
pub struct DistanceTable {
    metric: Metric,
    m: usize,
    k: usize,
    /// `m * k` entries, subspace-major.
    table: Vec<f32>,
    query_norm: f32,
}

impl DistanceTable {
    pub fn build(codebook: &Codebook, metric: Metric, query: &[f32]) -> Result<Self> {
        if query.len() != codebook.dim() {
            return Err(SvdbError::InvalidShape(format!(
                "query has dimension {}, codebook dimension is {}",
                query.len(),
                codebook.dim()
            )));
        }
        let m = codebook.m();
        let k = codebook.k();
        let sub = codebook.sub_dim();
        let mut table = vec![0.0f32; m * k];
        for si in 0..m {
            let q = &query[si * sub..(si + 1) * sub];
            for c in 0..k {
                let cent = codebook.centroid(si, c);
                table[si * k + c] = match metric {
                    Metric::Euclidean => metric::l2_squared(q, cent),
                    Metric::Manhattan => q
                        .iter()
                        .zip(cent)
                        .fold(0.0f32, |acc, (a, b)| acc + (a - b).abs()),
                    // Dot-family metrics store the subspace dot product.
                    Metric::Dot | Metric::Cosine | Metric::Angular => metric::dot(q, cent),
                };
            }
        }
        Ok(Self {
            metric,
            m,
            k,
            table,
            query_norm: metric::l2_norm(query),
        })
    }

    /// Approximate distance to an encoded vector. `stored_norm` is
    /// required for cosine/angular and ignored otherwise.
    pub fn lookup(&self, codes: &[u8], stored_norm: Option<f32>) -> f32 {
        debug_assert_eq!(codes.len(), self.m);
        let mut acc = 0.0f32;
        for (si, &c) in codes.iter().enumerate() {
            acc += self.table[si * self.k + c as usize];
        }
        match self.metric {
            Metric::Euclidean => acc.sqrt(),
            Metric::Manhattan => acc,
            Metric::Dot => -acc,
            Metric::Cosine | Metric::Angular => {
                let norm = stored_norm.unwrap_or(0.0);
                let denom = self.query_norm * norm;
                let cos = if denom == 0.0 { 0.0 } else { acc / denom };
                match self.metric {
                    Metric::Cosine => {
                        if denom == 0.0 {
                            1.0
                        } else {
                            1.0 - cos
                        }
                    }
                    _ => cos.clamp(-1.0, 1.0).acos() / std::f32::consts::PI,
                }
            }
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────
