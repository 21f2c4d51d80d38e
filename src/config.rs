//! Engine configuration.
//!
//! Deserializable so hosts can load options from their own config
//! layer; the engine itself never reads config files.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SvdbError};
use crate::metric::Metric;

/// HNSW tuning parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HnswOptions {
    /// Target connectivity M. Level 0 allows 2*M neighbors.
    pub m: usize,
    /// Candidate pool size during insertion.
    pub ef_construction: usize,
    /// Default candidate pool size during search.
    pub ef_search: usize,
    /// Cap on the level drawn for a new node.
    pub ml_max: usize,
}

impl Default for HnswOptions {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 200,
            ef_search: 64,
            ml_max: 16,
        }
    }
}

/// Top-level engine options, fixed at create/open time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineOptions {
    /// Vector dimension. Invariant for the life of the store.
    pub dim: usize,
    /// Distance metric used for search and index construction.
    pub metric: Metric,
    /// Memtable seals when it holds this many records...
    pub memtable_max_records: usize,
    /// ...or this many payload bytes, whichever comes first.
    pub memtable_max_bytes: usize,
    /// Compaction triggers when live segments exceed this count.
    pub compaction_threshold: usize,
    /// Lloyd iteration cap for PQ training.
    pub pq_train_iters: usize,
    /// Run compaction and graph persistence on a worker thread.
    pub background_compaction: bool,
    pub hnsw: HnswOptions,
}

impl EngineOptions {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            ..Self::default()
        }
    }

    /// Validate option ranges before the engine commits to them.
    pub fn validate(&self) -> Result<()> {
        if self.dim == 0 {
            return Err(SvdbError::InvalidShape("dim must be non-zero".into()));
        }
        if self.memtable_max_records == 0 {
            return Err(SvdbError::InvalidShape(
                "memtable_max_records must be non-zero".into(),
            ));
        }
        if self.compaction_threshold < 2 {
            return Err(SvdbError::InvalidShape(
                "compaction_threshold must be at least 2".into(),
            ));
        }
        if self.hnsw.m < 2 {
            return Err(SvdbError::InvalidShape("hnsw.m must be at least 2".into()));
        }
        if self.hnsw.ef_search == 0 || self.hnsw.ef_construction == 0 {
            return Err(SvdbError::InvalidShape(
                "hnsw ef parameters must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            dim: 128,
            metric: Metric::Euclidean,
            memtable_max_records: 4096,
            memtable_max_bytes: 8 * 1024 * 1024,
            compaction_threshold: 8,
            pq_train_iters: 25,
            background_compaction: false,
            hnsw: HnswOptions::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options_validate() {
        EngineOptions::default().validate().unwrap();
        EngineOptions::new(4).validate().unwrap();
    }

    #[test]
    fn test_zero_dim_rejected() {
        let opts = EngineOptions::new(0);
        assert!(matches!(
            opts.validate(),
            Err(SvdbError::InvalidShape(_))
        ));
    }

    #[test]
    fn test_low_compaction_threshold_rejected() {
        let mut opts = EngineOptions::new(8);
        opts.compaction_threshold = 1;
        assert!(opts.validate().is_err());
    }
}
