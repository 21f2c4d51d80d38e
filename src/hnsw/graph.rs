//! The layered proximity graph.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::HnswOptions;
use crate::hnsw::search::{search_layer, Candidate};
use crate::metric::Metric;

/// One graph node. Owns its vector; edges are indices into the node
/// table, never pointers.
#[derive(Debug, Clone)]
pub(crate) struct Node {
    pub id: Vec<u8>,
    pub vector: Vec<f32>,
    /// Ghosts route but never surface in results.
    pub ghost: bool,
    /// Neighbor lists for levels 0..=top.
    pub levels: Vec<Vec<u32>>,
}

impl Node {
    pub fn top_level(&self) -> usize {
        self.levels.len() - 1
    }

    pub fn neighbors(&self, level: usize) -> &[u32] {
        self.levels.get(level).map_or(&[], |v| v.as_slice())
    }
}

/// HNSW graph: node table, external-id mapping, entry point.
pub struct HnswGraph {
    dim: usize,
    metric: Metric,
    m: usize,
    m_max0: usize,
    ef_construction: usize,
    ef_search: usize,
    ml_max: usize,
    /// Level-generation factor 1/ln(M).
    level_factor: f64,
    nodes: Vec<Node>,
    by_id: HashMap<Vec<u8>, u32>,
    entry: Option<u32>,
    max_level: usize,
    ghosts: usize,
    rng: StdRng,
}

impl HnswGraph {
    pub fn new(dim: usize, metric: Metric, opts: &HnswOptions) -> Self {
        Self::with_seed(dim, metric, opts, rand::thread_rng().gen())
    }

    /// Deterministic construction for tests and reproducible builds.
    pub fn with_seed(dim: usize, metric: Metric, opts: &HnswOptions, seed: u64) -> Self {
        Self {
            dim,
            metric,
            m: opts.m,
            m_max0: opts.m * 2,
            ef_construction: opts.ef_construction,
            ef_search: opts.ef_search,
            ml_max: opts.ml_max,
            level_factor: 1.0 / (opts.m as f64).ln(),
            nodes: Vec::new(),
            by_id: HashMap::new(),
            entry: None,
            max_level: 0,
            ghosts: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Rebuild from scratch over a set of live records.
    pub fn rebuild<I>(dim: usize, metric: Metric, opts: &HnswOptions, records: I) -> Self
    where
        I: IntoIterator<Item = (Vec<u8>, Vec<f32>)>,
    {
        let mut graph = Self::new(dim, metric, opts);
        for (id, vector) in records {
            graph.insert(&id, vector);
        }
        graph
    }

    // ── Accessors ──────────────────────────────────────────────────

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Live (non-ghost) node count.
    pub fn len(&self) -> usize {
        self.nodes.len() - self.ghosts
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ghost_count(&self) -> usize {
        self.ghosts
    }

    pub fn max_level(&self) -> usize {
        self.max_level
    }

    /// Whether the id is present and live.
    pub fn contains(&self, id: &[u8]) -> bool {
        self.by_id
            .get(id)
            .is_some_and(|&n| !self.nodes[n as usize].ghost)
    }

    pub(crate) fn node(&self, idx: u32) -> Option<&Node> {
        self.nodes.get(idx as usize)
    }

    pub(crate) fn entry(&self) -> Option<u32> {
        self.entry
    }

    // ── Insertion ──────────────────────────────────────────────────

    /// Insert a vector under `id`. Re-storing an existing id ghosts
    /// the old node and inserts a fresh one; edges built for the old
    /// vector are not representative of the new one.
    pub fn insert(&mut self, id: &[u8], vector: Vec<f32>) {
        debug_assert_eq!(vector.len(), self.dim);
        if let Some(&old) = self.by_id.get(id) {
            self.ghost_index(old);
        }

        let level = self.draw_level();
        let idx = self.nodes.len() as u32;
        self.nodes.push(Node {
            id: id.to_vec(),
            vector,
            ghost: false,
            levels: vec![Vec::new(); level + 1],
        });
        self.by_id.insert(id.to_vec(), idx);

        let Some(entry) = self.entry else {
            self.entry = Some(idx);
            self.max_level = level;
            return;
        };

        let vector = self.nodes[idx as usize].vector.clone();

        // Greedy descent through the levels above the new node's top.
        let mut ep = entry;
        let mut lc = self.max_level;
        while lc > level {
            ep = self.greedy_closest(&vector, ep, lc);
            lc -= 1;
        }

        // Beam-search each level from min(level, max) down to 0,
        // wiring bidirectional edges as we go.
        let mut entries = vec![ep];
        let mut lc = level.min(self.max_level);
        loop {
            let pool = search_layer(self, &vector, &entries, self.ef_construction, lc, true);
            let cap = if lc == 0 { self.m_max0 } else { self.m };
            let chosen = self.select_neighbors(&pool, cap);

            for &nb in &chosen {
                self.nodes[idx as usize].levels[lc].push(nb);
                self.nodes[nb as usize].levels[lc].push(idx);
                if self.nodes[nb as usize].levels[lc].len() > cap {
                    self.prune(nb, lc, cap);
                }
            }
            // Level 0 may keep more neighbors than M.
            if self.nodes[idx as usize].levels[lc].len() > cap {
                self.prune(idx, lc, cap);
            }

            entries = pool.iter().map(|c| c.node).collect();
            if lc == 0 {
                break;
            }
            lc -= 1;
        }

        if level > self.max_level {
            self.entry = Some(idx);
            self.max_level = level;
        }
    }

    /// Mark an id as deleted. The node stays as a routable ghost
    /// until the next rebuild.
    pub fn ghost(&mut self, id: &[u8]) {
        if let Some(&idx) = self.by_id.get(id) {
            self.ghost_index(idx);
        }
    }

    fn ghost_index(&mut self, idx: u32) {
        let node = &mut self.nodes[idx as usize];
        if !node.ghost {
            node.ghost = true;
            self.ghosts += 1;
        }
    }

    /// Geometric level draw: floor(-ln(U) / ln(M)), capped.
    fn draw_level(&mut self) -> usize {
        let u: f64 = self.rng.gen_range(f64::EPSILON..1.0);
        let level = (-u.ln() * self.level_factor).floor() as usize;
        level.min(self.ml_max)
    }

    /// Move greedily toward the query at one level until no neighbor
    /// is closer.
    fn greedy_closest(&self, query: &[f32], start: u32, level: usize) -> u32 {
        let mut best = start;
        let mut best_dist = self.metric.distance(query, &self.nodes[start as usize].vector);
        loop {
            let mut improved = false;
            for &nb in self.nodes[best as usize].neighbors(level) {
                let d = self.metric.distance(query, &self.nodes[nb as usize].vector);
                if d < best_dist {
                    best = nb;
                    best_dist = d;
                    improved = true;
                }
            }
            if !improved {
                return best;
            }
        }
    }

    /// Diversity heuristic: walk candidates in ascending distance to
    /// the base vector and accept `c` iff it is closer to the base
    /// than to every accepted neighbor. Preserves long-range edges
    /// that plain nearest-M selection would discard.
    fn select_neighbors(&self, pool: &[Candidate], max: usize) -> Vec<u32> {
        debug_assert!(pool.windows(2).all(|w| w[0].distance <= w[1].distance));
        let mut selected: Vec<u32> = Vec::with_capacity(max);
        for c in pool {
            if selected.len() >= max {
                break;
            }
            let cv = &self.nodes[c.node as usize].vector;
            let diverse = selected.iter().all(|&r| {
                c.distance < self.metric.distance(cv, &self.nodes[r as usize].vector)
            });
            if diverse {
                selected.push(c.node);
            }
        }
        selected
    }

    /// Re-apply the selection heuristic to a node whose neighbor list
    /// exceeded its cap.
    fn prune(&mut self, idx: u32, level: usize, cap: usize) {
        let base = self.nodes[idx as usize].vector.clone();
        let mut pool: Vec<Candidate> = self.nodes[idx as usize].levels[level]
            .iter()
            .map(|&n| Candidate {
                distance: self
                    .metric
                    .distance(&base, &self.nodes[n as usize].vector),
                node: n,
            })
            .collect();
        pool.sort();
        pool.dedup_by_key(|c| c.node);
        self.nodes[idx as usize].levels[level] = self.select_neighbors(&pool, cap);
    }

    // ── Search ─────────────────────────────────────────────────────

    /// Top-k nearest live ids. `ef` is clamped up to `k`; when `None`
    /// the configured `ef_search` applies.
    pub fn search(&self, query: &[f32], k: usize, ef: Option<usize>) -> Vec<(Vec<u8>, f32)> {
        debug_assert_eq!(query.len(), self.dim);
        let Some(entry) = self.entry else {
            return Vec::new();
        };
        if k == 0 {
            return Vec::new();
        }
        let ef = ef.unwrap_or(self.ef_search).max(k);

        let mut ep = entry;
        for lc in (1..=self.max_level).rev() {
            ep = self.greedy_closest(query, ep, lc);
        }

        let pool = search_layer(self, query, &[ep], ef, 0, false);
        pool.into_iter()
            .take(k)
            .map(|c| (self.nodes[c.node as usize].id.clone(), c.distance))
            .collect()
    }

    // ── Fragment support ───────────────────────────────────────────

    pub(crate) fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub(crate) fn from_parts(
        dim: usize,
        metric: Metric,
        opts: &HnswOptions,
        nodes: Vec<Node>,
        entry: Option<u32>,
    ) -> Self {
        let mut by_id = HashMap::with_capacity(nodes.len());
        let mut ghosts = 0;
        let mut max_level = 0;
        for (i, node) in nodes.iter().enumerate() {
            if node.ghost {
                ghosts += 1;
            } else {
                by_id.insert(node.id.clone(), i as u32);
            }
            max_level = max_level.max(node.top_level());
        }
        // Ghosts with a live successor must not reclaim the mapping;
        // live nodes were inserted after their ghosts, so the pass
        // above (live-only) is already correct.
        let mut graph = Self::with_seed(dim, metric, opts, rand::thread_rng().gen());
        graph.nodes = nodes;
        graph.by_id = by_id;
        graph.entry = entry;
        graph.max_level = max_level;
        graph.ghosts = ghosts;
        graph
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> HnswOptions {
        HnswOptions {
            m: 8,
            ef_construction: 64,
            ef_search: 32,
            ml_max: 12,
        }
    }

    fn graph(dim: usize) -> HnswGraph {
        HnswGraph::with_seed(dim, Metric::Euclidean, &opts(), 42)
    }

    fn grid_vectors(n: usize, dim: usize) -> Vec<Vec<f32>> {
        (0..n)
            .map(|i| {
                (0..dim)
                    .map(|j| ((i * 31 + j * 17) % 997) as f32 / 997.0)
                    .collect()
            })
            .collect()
    }

    #[test]
    fn test_empty_graph() {
        let g = graph(4);
        assert!(g.is_empty());
        assert!(g.search(&[0.0; 4], 3, None).is_empty());
    }

    #[test]
    fn test_single_node() {
        let mut g = graph(4);
        g.insert(b"only", vec![1.0, 0.0, 0.0, 0.0]);
        assert_eq!(g.len(), 1);
        let hits = g.search(&[1.0, 0.0, 0.0, 0.0], 5, None);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, b"only");
        assert!(hits[0].1.abs() < 1e-6);
    }

    #[test]
    fn test_search_returns_sorted_distinct_live_ids() {
        let mut g = graph(8);
        let vectors = grid_vectors(200, 8);
        for (i, v) in vectors.iter().enumerate() {
            g.insert(format!("id_{}", i).as_bytes(), v.clone());
        }

        let hits = g.search(&vectors[50], 10, Some(64));
        assert_eq!(hits.len(), 10);
        for w in hits.windows(2) {
            assert!(w[0].1 <= w[1].1, "results not sorted");
        }
        let ids: std::collections::HashSet<&Vec<u8>> = hits.iter().map(|(id, _)| id).collect();
        assert_eq!(ids.len(), 10, "results not distinct");
        assert_eq!(hits[0].0, b"id_50");
    }

    #[test]
    fn test_overwrite_ghosts_old_node() {
        let mut g = graph(2);
        g.insert(b"a", vec![0.0, 0.0]);
        g.insert(b"b", vec![1.0, 1.0]);
        g.insert(b"a", vec![5.0, 5.0]);

        assert_eq!(g.len(), 2);
        assert_eq!(g.ghost_count(), 1);

        // The old position must not be findable under "a" anymore.
        let hits = g.search(&[5.0, 5.0], 1, Some(16));
        assert_eq!(hits[0].0, b"a");
        assert!(hits[0].1.abs() < 1e-6);
    }

    #[test]
    fn test_delete_filters_from_results_but_routes() {
        let mut g = graph(4);
        let vectors = grid_vectors(60, 4);
        for (i, v) in vectors.iter().enumerate() {
            g.insert(format!("id_{}", i).as_bytes(), v.clone());
        }
        g.ghost(b"id_7");
        assert!(!g.contains(b"id_7"));
        assert_eq!(g.len(), 59);

        let hits = g.search(&vectors[7], 10, Some(64));
        assert!(hits.iter().all(|(id, _)| id != b"id_7"));
        assert_eq!(hits.len(), 10);
    }

    #[test]
    fn test_ghost_is_idempotent() {
        let mut g = graph(2);
        g.insert(b"a", vec![0.0, 0.0]);
        g.ghost(b"a");
        g.ghost(b"a");
        assert_eq!(g.ghost_count(), 1);
        assert_eq!(g.len(), 0);
    }

    #[test]
    fn test_k_larger_than_population() {
        let mut g = graph(2);
        g.insert(b"a", vec![0.0, 0.0]);
        g.insert(b"b", vec![1.0, 0.0]);
        let hits = g.search(&[0.0, 0.0], 10, None);
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn test_neighbor_caps_respected() {
        let mut g = graph(4);
        for (i, v) in grid_vectors(300, 4).into_iter().enumerate() {
            g.insert(format!("id_{}", i).as_bytes(), v);
        }
        for node in g.nodes() {
            for (level, nbs) in node.levels.iter().enumerate() {
                let cap = if level == 0 { g.m_max0 } else { g.m };
                assert!(
                    nbs.len() <= cap,
                    "level {} holds {} neighbors, cap {}",
                    level,
                    nbs.len(),
                    cap
                );
            }
        }
    }

    #[test]
    fn test_edges_symmetric_or_capped() {
        let g = {
            let mut g = graph(8);
            for (i, v) in grid_vectors(250, 8).into_iter().enumerate() {
                g.insert(format!("id_{}", i).as_bytes(), v);
            }
            g
        };
        for (a, node) in g.nodes().iter().enumerate() {
            for (level, nbs) in node.levels.iter().enumerate() {
                let cap = if level == 0 { g.m_max0 } else { g.m };
                for &b in nbs {
                    let back = g.nodes()[b as usize].neighbors(level);
                    // Asymmetry is only legal as a pruning artifact,
                    // and pruning always respects the cap.
                    assert!(
                        back.contains(&(a as u32)) || back.len() <= cap,
                        "edge ({}, {}) at level {} asymmetric and over cap",
                        a,
                        b,
                        level
                    );
                }
            }
        }
    }

    #[test]
    fn test_recall_on_uniform_data() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let dim = 16;
        let n = 1500;
        let mut rng = StdRng::seed_from_u64(7);
        let vectors: Vec<Vec<f32>> = (0..n)
            .map(|_| (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect())
            .collect();

        let mut g = HnswGraph::with_seed(dim, Metric::Euclidean, &opts(), 99);
        for (i, v) in vectors.iter().enumerate() {
            g.insert(format!("id_{}", i).as_bytes(), v.clone());
        }

        let k = 10;
        let mut recall_sum = 0.0;
        let queries = 20;
        for qi in 0..queries {
            let q: Vec<f32> = (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect();
            let mut exact: Vec<(usize, f32)> = vectors
                .iter()
                .enumerate()
                .map(|(i, v)| (i, Metric::Euclidean.distance(&q, v)))
                .collect();
            exact.sort_by(|a, b| a.1.total_cmp(&b.1));
            let truth: Vec<Vec<u8>> = exact
                .iter()
                .take(k)
                .map(|&(i, _)| format!("id_{}", i).into_bytes())
                .collect();

            let hits = g.search(&q, k, Some(10 * k));
            let found = hits.iter().filter(|(id, _)| truth.contains(id)).count();
            recall_sum += found as f64 / k as f64;
            let _ = qi;
        }
        let recall = recall_sum / queries as f64;
        assert!(recall >= 0.9, "recall@10 too low: {:.3}", recall);
    }

    #[test]
    fn test_entry_point_tracks_max_level() {
        let mut g = graph(2);
        for (i, v) in grid_vectors(100, 2).into_iter().enumerate() {
            g.insert(format!("id_{}", i).as_bytes(), v);
        }
        let entry = g.entry().unwrap();
        assert_eq!(g.nodes()[entry as usize].top_level(), g.max_level());
    }
}
