//! `flakedb` is an immutable, time-travelling semantic graph database.
//!
//! Data is modeled as atomic assertions ("flakes") kept in five total
//! orders. This crate is intentionally opinionated about correctness first:
//! - Committed state is never mutated; every transaction yields a new
//!   database value sharing structure with its predecessor.
//! - Reads are snapshot-safe (consistent reads at a transaction counter `t`).
//! - Retractions are explicit flakes, visible to history reads.
//! - Index nodes are content-addressed blobs, resolved on demand through a
//!   byte-budget cache and never rewritten in place.
//!
//! The write path layers fresh flakes into an in-memory novelty overlay; a
//! background indexer folds novelty into new on-disk tree nodes and
//! publishes a new root. Query evaluation (JSON-LD selection with graph
//! crawl) always fuses novelty with the on-disk trees via ordered merge.

pub mod cache;
pub mod codec;
pub mod commit;
pub mod comparator;
pub mod db;
pub mod error;
pub mod flake;
pub mod index;
pub mod indexer;
pub mod novelty;
pub mod query;
pub mod session;
pub mod store;
pub mod time_travel;
pub mod transact;

pub use comparator::IndexType;
pub use db::{Db, DbStats};
pub use error::{Error, Result};
pub use flake::{Flake, FlakeMeta, FlakeValue};
pub use session::{Connection, ConnectionOptions, Ledger};
