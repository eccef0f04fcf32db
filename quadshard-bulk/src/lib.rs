//! Offline bulk-loading pipeline for a sharded graph store.
//!
//! Ingests N-Quad triples, interns string labels to 64-bit uids, partitions
//! the resulting edge stream by predicate into *M* map shards, externally
//! sorts each shard into gzip-compressed spill runs, bin-packs the map shards
//! into *R* reduce shards, then k-way merges every reduce shard into sorted
//! posting-list key/value batches that a log-structured table writer can seal
//! directly.
//!
//! The pipeline is a classic map → shuffle → reduce external sort:
//!
//! ```text
//! input files → chunker → (chunk channel) → mapper workers
//!             → per-shard sorted spill files → shuffle planner
//!             → k-way merge → posting-list builder → table sink
//! ```
//!
//! Phases are connected only by the filesystem (spill files are *renamed*
//! into their reduce shard, never copied) and by bounded channels within a
//! phase. There is no crash recovery: a failed run restarts from scratch
//! after clearing the temp tree.

pub mod chunk;
pub mod count_index;
pub mod error;
pub mod key;
pub mod loader;
pub mod mapper;
pub mod merge;
pub mod nquad;
pub mod options;
pub mod posting;
pub mod progress;
pub mod reduce;
pub mod schema;
pub mod shard_map;
pub mod shuffle;
pub mod spill;
pub mod stream;
pub mod throttle;
pub mod wire;
pub mod xid;

pub use error::{BulkError, Result};
pub use loader::Loader;
pub use options::Options;
