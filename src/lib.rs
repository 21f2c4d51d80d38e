//! SVDB, an embeddable vector database.
//!
//! Dense f32 vectors keyed by opaque identifiers, persisted in an
//! LSM-style segmented layout (memtable, immutable mmap'd segments,
//! background compaction), optionally compressed with a trained
//! Product-Quantization codec, and searched through an HNSW proximity
//! graph under a configurable distance metric.
//!
//! ```no_run
//! use svdb::{Engine, EngineOptions};
//!
//! let options = EngineOptions::new(4);
//! let engine = Engine::create("/tmp/vectors", options)?;
//! engine.store(b"a", vec![1.0, 0.0, 0.0, 0.0])?;
//! let hits = engine.search(&[1.0, 0.0, 0.0, 0.0], 1, None)?;
//! assert_eq!(hits[0].0, b"a");
//! engine.close()?;
//! # Ok::<(), svdb::SvdbError>(())
//! ```

pub mod background;
pub mod compaction;
pub mod config;
pub mod engine;
pub mod error;
pub mod hnsw;
pub mod metric;
pub mod pq;
pub mod storage;

pub use config::{EngineOptions, HnswOptions};
pub use engine::{route_key, Engine};
pub use error::{Result, SvdbError};
pub use metric::Metric;
pub use pq::{Codebook, CodecHash};
pub use storage::store::ChangeRecord;
pub use storage::Record;
