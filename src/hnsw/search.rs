//! Beam search over one graph layer.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};

use crate::hnsw::graph::HnswGraph;

/// A node paired with its distance to the query. Ordered by distance
/// so heaps of candidates behave.
#[derive(Debug, Clone, Copy)]
pub struct Candidate {
    pub distance: f32,
    pub node: u32,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.distance == other.distance && self.node == other.node
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then(self.node.cmp(&other.node))
    }
}

/// Beam search at `level`: expand from `entries`, keeping a min-heap
/// of candidates to explore and a max-heap of the best `ef` results.
/// Ghost nodes always route; they enter the result set only when
/// `include_ghosts` (construction wants them as neighbors, queries do
/// not want them as answers).
///
/// Returns results sorted ascending by distance.
pub(crate) fn search_layer(
    graph: &HnswGraph,
    query: &[f32],
    entries: &[u32],
    ef: usize,
    level: usize,
    include_ghosts: bool,
) -> Vec<Candidate> {
    let mut visited: HashSet<u32> = HashSet::new();
    let mut candidates: BinaryHeap<Reverse<Candidate>> = BinaryHeap::new();
    let mut results: BinaryHeap<Candidate> = BinaryHeap::new();

    for &ep in entries {
        if !visited.insert(ep) {
            continue;
        }
        let Some(node) = graph.node(ep) else { continue };
        if node.top_level() < level {
            continue;
        }
        let c = Candidate {
            distance: graph.metric().distance(query, &node.vector),
            node: ep,
        };
        candidates.push(Reverse(c));
        if include_ghosts || !node.ghost {
            results.push(c);
        }
    }
    while results.len() > ef {
        results.pop();
    }

    while let Some(Reverse(current)) = candidates.pop() {
        if let Some(furthest) = results.peek() {
            if current.distance > furthest.distance && results.len() >= ef {
                break;
            }
        }
        let Some(node) = graph.node(current.node) else {
            continue;
        };
        for &nb in node.neighbors(level) {
            if !visited.insert(nb) {
                continue;
            }
            let Some(nb_node) = graph.node(nb) else {
                continue;
            };
            let dist = graph.metric().distance(query, &nb_node.vector);
            let below_ef = results.len() < ef;
            let closer = results
                .peek()
                .map_or(true, |furthest| dist < furthest.distance);
            if below_ef || closer {
                let c = Candidate {
                    distance: dist,
                    node: nb,
                };
                candidates.push(Reverse(c));
                if include_ghosts || !nb_node.ghost {
                    results.push(c);
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }
    }

    let mut out: Vec<Candidate> = results.into_vec();
    out.sort();
    out
}
