//! Journal-backed, size-bounded LRU key/value store
//!
//! Each entry maps an opaque string key to a fixed number of byte streams
//! stored as files in the cache directory. Writes go through an [`Editor`]
//! that stages `.tmp` files and renames them into place on commit, so readers
//! never observe a partially written value. An append-only journal records
//! every mutation; on open the journal is replayed to rebuild the in-memory
//! index, and incomplete edits are discarded. When the total stored size
//! exceeds the configured bound, least-recently-used entries are evicted.

mod error;
mod store;

pub use error::{Result, StoreError};
pub use store::{Editor, Snapshot, Store};
