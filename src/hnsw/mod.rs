//! Hierarchical navigable small-world index.
//!
//! A layered proximity graph over the live identifiers in the store.
//! Adjacency is represented as u32 indices into a node table the
//! graph exclusively owns; edges reference by index, so the cycles
//! inherent to bidirectional neighbors never become ownership cycles.
//!
//! Deleted and overwritten ids stay behind as ghost nodes: they keep
//! routing traffic through the graph but are filtered from results.
//! Rebuilds (after compaction, or when the persisted fragment does
//! not match the segment set) shed them wholesale.

pub mod fragment;
pub mod graph;
pub mod search;

pub use fragment::GraphFragment;
pub use graph::HnswGraph;
pub use search::Candidate;
