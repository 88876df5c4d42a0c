//! Disk-backed image cache with asynchronous initialization
//!
//! Persists PNG-encoded image payloads in a size-bounded on-disk store that
//! opens in the background. Callers never block on startup: `get` and `add`
//! wait cooperatively until initialization resolves, then run fully
//! serialized against the store handle.
//!
//! The cache is a performance optimization, never a source of truth: a miss
//! and a failure are indistinguishable by design, both yielding `None`.

mod cache;
mod codec;
mod types;

pub use cache::ImageBlobCache;
pub use types::CacheStats;

pub use image::DynamicImage;
