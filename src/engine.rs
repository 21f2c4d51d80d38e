//! Engine façade.
//!
//! Owns the sequence counter, the memtable, the manifest handle, and
//! the HNSW index, and orchestrates them behind the public API:
//! store/get/delete/search, codec training, compaction, flush, close.
//!
//! Concurrency model: a single logical writer at a time. Write entry
//! points take the writer mutex with `try_lock` and reject a second
//! concurrent writer with `ConcurrentModification`; the background
//! worker is the one internal writer allowed to wait its turn.
//! Readers take consistent snapshots under reader-writer guards and
//! never block on disk.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::background::{BackgroundWorker, Task};
use crate::compaction;
use crate::config::EngineOptions;
use crate::error::{Result, SvdbError};
use crate::hnsw::{GraphFragment, HnswGraph};
use crate::pq::{Codebook, CodecHash};
use crate::storage::store::ChangeRecord;
use crate::storage::{Record, VectorStore};

/// Stable routing hash over an identifier (FNV-1a, 64-bit). Sharding
/// consumers use this as their sole routing input; it must never
/// change across versions.
pub fn route_key(id: &[u8]) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for &b in id {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Shared engine state; the background worker holds a second handle.
pub(crate) struct EngineShared {
    pub(crate) options: EngineOptions,
    pub(crate) store: RwLock<VectorStore>,
    pub(crate) graph: RwLock<HnswGraph>,
    /// Serializes logical writers. User entry points take it with
    /// `try_lock` and reject; the background worker waits its turn
    /// for the brief commit window only.
    pub(crate) writer: Mutex<()>,
    /// Serializes whole compaction passes (prepare through commit) so
    /// two passes never race over the same inputs.
    pub(crate) compactor: Mutex<()>,
    pub(crate) dir: Option<PathBuf>,
}

impl EngineShared {
    /// One compaction pass plus the ghost-shedding graph rebuild, for
    /// a caller that already holds the writer mutex (the guard is the
    /// proof). Merge and output IO run under a shared store snapshot;
    /// only the manifest commit takes the store's write guard.
    pub(crate) fn compact_locked(
        &self,
        _writer: &MutexGuard<'_, ()>,
        threshold: usize,
        cancel: Option<&std::sync::atomic::AtomicBool>,
    ) -> Result<bool> {
        let Some(_pass) = self.compactor.try_lock() else {
            // Another pass is mid-flight; its commit will count.
            return Ok(false);
        };
        let prepared = {
            let store = self.store.read();
            compaction::prepare(&store, threshold, cancel)?
        };
        let Some(prepared) = prepared else {
            return Ok(false);
        };
        {
            let mut store = self.store.write();
            compaction::commit(&mut store, prepared)?;
        }

        // Compaction is the rebuild point that sheds ghost nodes.
        if self.graph.read().ghost_count() > 0 {
            self.rebuild_graph()?;
        }
        Ok(true)
    }

    /// Background-worker variant: prepare without the writer mutex
    /// (readers and the writer stay unblocked through the merge),
    /// then take it for the commit and any graph rebuild.
    pub(crate) fn compact_background(
        &self,
        threshold: usize,
        cancel: Option<&std::sync::atomic::AtomicBool>,
    ) -> Result<bool> {
        let Some(_pass) = self.compactor.try_lock() else {
            return Ok(false);
        };
        let prepared = {
            let store = self.store.read();
            compaction::prepare(&store, threshold, cancel)?
        };
        let Some(prepared) = prepared else {
            return Ok(false);
        };

        let _writer = self.writer.lock();
        {
            let mut store = self.store.write();
            compaction::commit(&mut store, prepared)?;
        }
        if self.graph.read().ghost_count() > 0 {
            self.rebuild_graph()?;
        }
        Ok(true)
    }

    pub(crate) fn rebuild_graph(&self) -> Result<()> {
        let records = {
            let store = self.store.read();
            store.live_records()?
        };
        let count = records.len();
        let rebuilt = HnswGraph::rebuild(
            self.options.dim,
            self.options.metric,
            &self.options.hnsw,
            records.into_iter().map(|r| (r.id, r.vector)),
        );
        *self.graph.write() = rebuilt;
        tracing::info!(nodes = count, "graph rebuilt");
        Ok(())
    }

    /// Persist the graph fragment stamped with the current segment
    /// set and codec. No-op for ephemeral engines. Skipped while the
    /// memtable holds records: a captured graph must describe sealed
    /// state only, or a restore after a crash would surface ids whose
    /// records died with the memtable.
    pub(crate) fn persist_graph(&self) -> Result<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let fragment = {
            let store = self.store.read();
            if !store.memtable().is_empty() {
                tracing::debug!("fragment persist skipped: memtable not empty");
                return Ok(());
            }
            let segment_ids: Vec<u64> = store.segments().iter().map(|s| s.id()).collect();
            let codec_hash = store.active_codec_hash();
            // Graph captured under the store guard so no writer can
            // slip a half-applied record in between.
            let graph = self.graph.read();
            GraphFragment::capture(&graph, segment_ids, codec_hash)
        };
        fragment.write_atomic(dir)
    }
}

/// The embeddable vector engine.
pub struct Engine {
    shared: Arc<EngineShared>,
    worker: Option<BackgroundWorker>,
}

// ── Constructors ───────────────────────────────────────────────────

impl Engine {
    /// Create a new store directory.
    pub fn create<P: AsRef<Path>>(path: P, options: EngineOptions) -> Result<Self> {
        options.validate()?;
        let path = path.as_ref();
        let store = VectorStore::create(path, options.dim, options.metric)?;
        let graph = HnswGraph::new(options.dim, options.metric, &options.hnsw);
        Ok(Self::assemble(options, store, graph, Some(path.to_path_buf())))
    }

    /// In-memory engine for tests and embedding without durability.
    pub fn ephemeral(options: EngineOptions) -> Result<Self> {
        options.validate()?;
        let store = VectorStore::ephemeral(options.dim, options.metric);
        let graph = HnswGraph::new(options.dim, options.metric, &options.hnsw);
        Ok(Self::assemble(options, store, graph, None))
    }

    /// Open an existing store. Loads the last durable manifest, maps
    /// the referenced segments, and either accepts the persisted
    /// graph fragment (exact segment-set + codec match) or rebuilds
    /// the graph from live records. Unsealed writes from before a
    /// crash are gone; seals are the durability unit.
    pub fn open<P: AsRef<Path>>(path: P, options: EngineOptions) -> Result<Self> {
        options.validate()?;
        let path = path.as_ref();
        let store = VectorStore::open(path, options.dim, options.metric)?;

        let segment_ids: Vec<u64> = store.segments().iter().map(|s| s.id()).collect();
        let codec_hash = store.active_codec_hash();
        let graph = match GraphFragment::load(path) {
            Some(frag)
                if frag.matches(options.dim, options.metric, &segment_ids, codec_hash) =>
            {
                tracing::info!("graph fragment accepted");
                frag.restore(&options.hnsw)
            }
            _ => {
                let records = store.live_records()?;
                tracing::info!(nodes = records.len(), "rebuilding graph from segments");
                HnswGraph::rebuild(
                    options.dim,
                    options.metric,
                    &options.hnsw,
                    records.into_iter().map(|r| (r.id, r.vector)),
                )
            }
        };
        Ok(Self::assemble(options, store, graph, Some(path.to_path_buf())))
    }

    fn assemble(
        options: EngineOptions,
        store: VectorStore,
        graph: HnswGraph,
        dir: Option<PathBuf>,
    ) -> Self {
        let background = options.background_compaction;
        let shared = Arc::new(EngineShared {
            options,
            store: RwLock::new(store),
            graph: RwLock::new(graph),
            writer: Mutex::new(()),
            compactor: Mutex::new(()),
            dir,
        });
        let worker = background.then(|| BackgroundWorker::spawn(Arc::clone(&shared)));
        Self { shared, worker }
    }

    fn writer_guard(&self) -> Result<MutexGuard<'_, ()>> {
        self.shared
            .writer
            .try_lock()
            .ok_or(SvdbError::ConcurrentModification)
    }
}

// ── Core operations ────────────────────────────────────────────────

impl Engine {
    /// Upsert a vector. Returns once in-memory state (memtable and
    /// graph) reflects the write; a subsequent `get` from any thread
    /// sees it. May seal and trigger compaction on the way out.
    pub fn store(&self, id: &[u8], vector: Vec<f32>) -> Result<u64> {
        let writer = self.writer_guard()?;
        let seq = self.shared.store.write().put(id, vector.clone())?;
        self.shared.graph.write().insert(id, vector);
        self.maybe_seal(&writer)?;
        Ok(seq)
    }

    /// Point lookup. Tombstones and absent ids are `NotFound`.
    /// Vectors stored under a codec decode lossily.
    pub fn get(&self, id: &[u8]) -> Result<Vec<f32>> {
        self.shared.store.read().get(id)
    }

    /// Install a tombstone. Idempotent: deleting an absent id is not
    /// an error.
    pub fn delete(&self, id: &[u8]) -> Result<u64> {
        let writer = self.writer_guard()?;
        let seq = self.shared.store.write().tombstone(id)?;
        self.shared.graph.write().ghost(id);
        self.maybe_seal(&writer)?;
        Ok(seq)
    }

    /// Top-k ANN search. Reflects every write that completed before
    /// the call started. `ef` defaults to the configured `ef_search`
    /// and is clamped up to `k`.
    pub fn search(&self, query: &[f32], k: usize, ef: Option<usize>) -> Result<Vec<(Vec<u8>, f32)>> {
        if query.len() != self.shared.options.dim {
            return Err(SvdbError::InvalidShape(format!(
                "query has dimension {}, engine dimension is {}",
                query.len(),
                self.shared.options.dim
            )));
        }
        Ok(self.shared.graph.read().search(query, k, ef))
    }

    /// Brute-force top-k over every visible record. Exact under raw
    /// storage; under PQ, database vectors stay compressed and the
    /// distance comes from the codec's asymmetric tables. The
    /// baseline to measure the graph search against.
    pub fn scan_search(&self, query: &[f32], k: usize) -> Result<Vec<(Vec<u8>, f32)>> {
        self.shared.store.read().scan_search(query, k)
    }

    /// Train a PQ codebook on `samples` and publish it as the active
    /// codec. New seals encode under it; existing segments keep their
    /// own codebook until compaction migrates them. CPU-heavy and
    /// blocking by design.
    pub fn train_compression(
        &self,
        samples: &[Vec<f32>],
        m: usize,
        nbits: usize,
    ) -> Result<CodecHash> {
        let _writer = self.writer_guard()?;
        let codebook = Codebook::train(
            samples,
            self.shared.options.dim,
            m,
            nbits,
            self.shared.options.pq_train_iters,
        )?;
        self.shared.store.write().publish_codec(codebook)
    }

    /// Run compaction if the live segment count exceeds the threshold
    /// (the configured one, unless overridden). Returns whether a
    /// pass committed.
    pub fn maybe_compact(&self, threshold: Option<usize>) -> Result<bool> {
        let writer = self.writer_guard()?;
        let threshold = threshold.unwrap_or(self.shared.options.compaction_threshold);
        self.shared.compact_locked(&writer, threshold, None)
    }

    /// Seal any non-empty memtable.
    pub fn flush(&self) -> Result<()> {
        let writer = self.writer_guard()?;
        self.seal_locked(&writer)?;
        Ok(())
    }

    /// Flush, persist the graph fragment, and stop the background
    /// worker.
    pub fn close(mut self) -> Result<()> {
        if let Some(worker) = self.worker.take() {
            worker.shutdown();
        }
        let writer = self.writer_guard()?;
        self.seal_locked(&writer)?;
        self.shared.persist_graph()?;
        tracing::info!("engine closed");
        Ok(())
    }

    fn seal_locked(&self, _writer: &MutexGuard<'_, ()>) -> Result<Option<u64>> {
        self.shared.store.write().seal()
    }

    /// Seal when the memtable crossed a threshold, then hand the
    /// compaction trigger to the worker (or run it inline).
    fn maybe_seal(&self, writer: &MutexGuard<'_, ()>) -> Result<()> {
        let over = {
            let store = self.shared.store.read();
            store.should_seal(
                self.shared.options.memtable_max_records,
                self.shared.options.memtable_max_bytes,
            )
        };
        if !over {
            return Ok(());
        }
        self.seal_locked(writer)?;

        let threshold = self.shared.options.compaction_threshold;
        let needed = {
            let store = self.shared.store.read();
            compaction::should_compact(&store, threshold)
        };
        if needed {
            match &self.worker {
                Some(worker) => worker.submit(Task::MaybeCompact),
                None => {
                    self.shared.compact_locked(writer, threshold, None)?;
                }
            }
        }
        // Keep the persisted fragment trailing the durable state; the
        // queue runs it after any compaction it follows.
        if let Some(worker) = &self.worker {
            worker.submit(Task::PersistGraph);
        }
        Ok(())
    }
}

// ── Introspection ──────────────────────────────────────────────────

impl Engine {
    pub fn options(&self) -> &EngineOptions {
        &self.shared.options
    }

    /// Live sealed segment count.
    pub fn segment_count(&self) -> usize {
        self.shared.store.read().segment_count()
    }

    /// Next sequence number to be assigned.
    pub fn next_seq(&self) -> u64 {
        self.shared.store.read().next_seq()
    }

    /// Active codec hash, if compression is on.
    pub fn active_codec(&self) -> Option<CodecHash> {
        self.shared.store.read().active_codec_hash()
    }

    /// Segments quarantined at open. Non-empty means read-degraded.
    pub fn degraded_segments(&self) -> Vec<(u64, String)> {
        self.shared.store.read().degraded().to_vec()
    }
}

// ── Replication boundary ───────────────────────────────────────────

impl Engine {
    /// Durable change stream derived from sealed segments: every
    /// record with a sequence above `since`, in sequence order.
    pub fn changes_since(&self, since: u64) -> Result<Vec<ChangeRecord>> {
        self.shared.store.read().sealed_changes_since(since)
    }

    /// Snapshot of the sealed live set, for follower bootstrap.
    pub fn snapshot_records(&self) -> Result<Vec<Record>> {
        self.shared.store.read().sealed_live_records()
    }

    /// Apply a replicated write without assigning a new sequence.
    /// Idempotent on duplicate or stale sequences; returns whether
    /// the write was applied.
    pub fn apply_write(
        &self,
        seq: u64,
        id: &[u8],
        tombstone: bool,
        payload: Vec<f32>,
    ) -> Result<bool> {
        let writer = self.writer_guard()?;
        let applied = self
            .shared
            .store
            .write()
            .apply(seq, id, tombstone, payload.clone())?;
        if applied {
            let mut graph = self.shared.graph.write();
            if tombstone {
                graph.ghost(id);
            } else {
                graph.insert(id, payload);
            }
        }
        self.maybe_seal(&writer)?;
        Ok(applied)
    }
}

// ── Tests ──────────────────────────────────────────────────────────
