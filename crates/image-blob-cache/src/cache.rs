//! Cache coordinator: asynchronous store startup and serialized get/add/close

use crate::codec;
use crate::types::CacheStats;
use disk_lru_store::Store;
use image::DynamicImage;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

const CACHE_SUBDIR: &str = "image_blob_cache";
const DEFAULT_MAX_SIZE: u64 = 20 * 1024 * 1024; // 20 MiB
const APP_VERSION: u32 = 1;
const STREAM_COUNT: usize = 1;
const VALUE_STREAM: usize = 0;

/// The store handle, exclusively owned by the coordinator. Transitions once
/// from `Uninitialized` to either `Open` (startup succeeded) or `Closed`
/// (startup failed, or `close` ran), never back.
enum CacheHandle {
    Uninitialized,
    Open(Store),
    Closed,
}

struct CacheState {
    handle: CacheHandle,
    /// True from construction until the open attempt completes, exactly once.
    /// No get/add touches the handle while this is set.
    initializing: bool,
}

/// A disk-backed cache for decoded images.
///
/// Construction returns immediately and opens the store on a background
/// task. `get` and `add` wait for that startup to resolve before touching
/// the handle; the wait has no timeout, so an open attempt that never
/// completes would block them indefinitely. A single lock serializes every
/// operation end to end, in arrival order.
///
/// If the store fails to open, the cache degrades to always-miss rather
/// than failing construction. After [`ImageBlobCache::close`] the cache is
/// unusable and must be reconstructed.
///
/// Must be constructed from within a Tokio runtime.
pub struct ImageBlobCache {
    state: Arc<Mutex<CacheState>>,
    init_done: Arc<Notify>,
    cache_dir: PathBuf,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ImageBlobCache {
    /// Create a cache under `base_directory` with the default 20 MiB bound.
    pub fn new(base_directory: impl AsRef<Path>) -> Self {
        Self::with_max_size(base_directory, DEFAULT_MAX_SIZE)
    }

    /// Create a cache under `base_directory` bounded to `max_size` bytes.
    ///
    /// The store lives in a fixed subdirectory beneath `base_directory` and
    /// is opened asynchronously; this constructor does not block.
    pub fn with_max_size(base_directory: impl AsRef<Path>, max_size: u64) -> Self {
        let cache_dir = base_directory.as_ref().join(CACHE_SUBDIR);

        let state = Arc::new(Mutex::new(CacheState {
            handle: CacheHandle::Uninitialized,
            initializing: true,
        }));
        let init_done = Arc::new(Notify::new());

        let init_state = Arc::clone(&state);
        let init_notify = Arc::clone(&init_done);
        let directory = cache_dir.clone();
        tokio::spawn(async move {
            let opened = Store::open(&directory, APP_VERSION, STREAM_COUNT, max_size).await;
            let mut state = init_state.lock().await;
            match opened {
                Ok(store) => {
                    if matches!(state.handle, CacheHandle::Closed) {
                        // close() won the race; don't resurrect the store
                        info!(cache_dir = ?directory, "Cache closed during startup, discarding store");
                        if let Err(e) = store.delete().await {
                            warn!(cache_dir = ?directory, error = %e, "Failed to delete discarded store");
                        }
                    } else {
                        info!(cache_dir = ?directory, max_size, "Disk cache opened");
                        state.handle = CacheHandle::Open(store);
                    }
                }
                Err(e) => {
                    warn!(cache_dir = ?directory, error = %e, "Failed to open disk cache");
                    state.handle = CacheHandle::Closed;
                }
            }
            state.initializing = false;
            drop(state);
            init_notify.notify_waiters();
        });

        Self {
            state,
            init_done,
            cache_dir,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Acquire the coordination lock once initialization has resolved.
    ///
    /// Registers for notification before releasing the lock, so a completion
    /// signal between the check and the wait cannot be lost.
    async fn lock_ready(&self) -> MutexGuard<'_, CacheState> {
        loop {
            let state = self.state.lock().await;
            if !state.initializing {
                return state;
            }
            let notified = self.init_done.notified();
            drop(state);
            notified.await;
        }
    }

    /// Fetch and decode the image stored under `key`.
    ///
    /// Waits for initialization, then holds the coordination lock for the
    /// lookup and stream read. Returns `None` on a miss, an unusable store,
    /// a read error, or undecodable bytes; callers cannot tell these apart.
    pub async fn get(&self, key: &str) -> Option<DynamicImage> {
        let mut state = self.lock_ready().await;
        let CacheHandle::Open(store) = &mut state.handle else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        let mut snapshot = match store.get(key).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                debug!(key = %key, "Cache miss");
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Cache lookup failed");
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        let bytes = match snapshot.read_to_vec(VALUE_STREAM).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to read cached stream");
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };
        drop(state);

        match codec::decode(&bytes) {
            Some(image) => {
                debug!(key = %key, size = bytes.len(), "Cache hit");
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(image)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Encode `image` and store it under a freshly generated key.
    ///
    /// Returns the key on success so the caller can persist it for later
    /// [`ImageBlobCache::get`] calls, or `None` if the store is unusable or
    /// the write failed. A failed write aborts its edit and leaves no
    /// partially committed entry.
    pub async fn add(&self, image: &DynamicImage) -> Option<String> {
        let encoded = codec::encode(image)?;
        let key = Uuid::new_v4().to_string();
        self.add_encoded(&key, &encoded).await
    }

    async fn add_encoded(&self, key: &str, encoded: &[u8]) -> Option<String> {
        let mut state = self.lock_ready().await;
        let CacheHandle::Open(store) = &mut state.handle else {
            return None;
        };

        // Freshly generated keys collide only by astronomical accident;
        // fail the insert rather than overwrite an existing entry.
        match store.get(key).await {
            Ok(None) => {}
            Ok(Some(_)) => {
                warn!(key = %key, "Generated key already present, refusing to overwrite");
                return None;
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Cache lookup failed");
                return None;
            }
        }

        let mut editor = match store.edit(key).await {
            Ok(Some(editor)) => editor,
            Ok(None) => {
                warn!(key = %key, "Key already has an edit in flight");
                return None;
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to open cache edit");
                return None;
            }
        };

        if let Err(e) = editor.write(VALUE_STREAM, encoded).await {
            warn!(key = %key, error = %e, "Failed to write cache entry, aborting");
            if let Err(e) = editor.abort().await {
                warn!(key = %key, error = %e, "Failed to abort cache edit");
            }
            return None;
        }

        if let Err(e) = editor.commit().await {
            warn!(key = %key, error = %e, "Failed to commit cache entry");
            return None;
        }

        debug!(key = %key, size = encoded.len(), "Cached image");
        Some(key.to_string())
    }

    /// Close the store and delete the entire on-disk cache.
    ///
    /// Destructive and irreversible: all entries and the backing directory
    /// are removed, and the cache is unusable afterwards. If the store never
    /// opened, this is a no-op beyond attempting directory cleanup. Failures
    /// during teardown are logged and swallowed.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        match std::mem::replace(&mut state.handle, CacheHandle::Closed) {
            CacheHandle::Open(store) => {
                if let Err(e) = store.delete().await {
                    warn!(cache_dir = ?self.cache_dir, error = %e, "Failed to delete disk cache");
                }
            }
            CacheHandle::Uninitialized | CacheHandle::Closed => {
                if let Err(e) = tokio::fs::remove_dir_all(&self.cache_dir).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(cache_dir = ?self.cache_dir, error = %e, "Failed to remove cache directory");
                    }
                }
            }
        }
        info!(cache_dir = ?self.cache_dir, "Disk cache closed");
    }

    /// Current cache statistics. Does not wait for initialization; before
    /// startup resolves the store-derived fields read as zero.
    pub async fn stats(&self) -> CacheStats {
        let state = self.state.lock().await;
        let (entries, total_size) = match &state.handle {
            CacheHandle::Open(store) => (store.len(), store.size()),
            _ => (0, 0),
        };
        CacheStats {
            entries,
            total_size,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgba};
    use std::collections::HashSet;
    use tempfile::tempdir;

    fn test_image(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgba8(ImageBuffer::from_fn(width, height, |x, y| {
            Rgba([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8, 255])
        }))
    }

    #[tokio::test]
    async fn test_add_then_get_roundtrip() {
        let dir = tempdir().unwrap();
        let cache = ImageBlobCache::new(dir.path());

        let image = test_image(16, 16);
        let key = cache.add(&image).await.expect("add should succeed");
        let cached = cache.get(&key).await.expect("get should hit");

        assert_eq!(cached.to_rgba8().as_raw(), image.to_rgba8().as_raw());
    }

    #[tokio::test]
    async fn test_get_miss_is_none() {
        let dir = tempdir().unwrap();
        let cache = ImageBlobCache::new(dir.path());

        assert!(cache.get("no-such-key").await.is_none());

        let stats = cache.stats().await;
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 0);
    }

    #[tokio::test]
    async fn test_operations_issued_before_startup_complete() {
        // Fire gets the moment the constructor returns; every one must wait
        // out initialization and come back, none may observe a half-open
        // handle.
        let dir = tempdir().unwrap();
        let cache = Arc::new(ImageBlobCache::new(dir.path()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(
                async move { cache.get("missing").await.is_none() },
            ));
        }
        for handle in handles {
            assert!(handle.await.unwrap());
        }

        // The cache stays fully usable afterwards.
        let key = cache.add(&test_image(4, 4)).await.unwrap();
        assert!(cache.get(&key).await.is_some());
    }

    #[tokio::test]
    async fn test_concurrent_adds_yield_distinct_retrievable_keys() {
        let dir = tempdir().unwrap();
        let cache = Arc::new(ImageBlobCache::new(dir.path()));

        let mut handles = Vec::new();
        for i in 0..8u32 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                cache.add(&test_image(4 + i, 4 + i)).await
            }));
        }

        let mut keys = HashSet::new();
        for handle in handles {
            let key = handle.await.unwrap().expect("concurrent add should succeed");
            keys.insert(key);
        }
        assert_eq!(keys.len(), 8);

        for key in &keys {
            assert!(cache.get(key).await.is_some());
        }
    }

    #[tokio::test]
    async fn test_forced_key_collision_fails_second_insert() {
        let dir = tempdir().unwrap();
        let cache = ImageBlobCache::new(dir.path());

        let first = test_image(8, 8);
        let second = test_image(12, 12);
        let first_bytes = codec::encode(&first).unwrap();
        let second_bytes = codec::encode(&second).unwrap();

        assert!(cache.add_encoded("fixed-key", &first_bytes).await.is_some());
        assert!(cache.add_encoded("fixed-key", &second_bytes).await.is_none());

        // The original entry survives untouched.
        let cached = cache.get("fixed-key").await.unwrap();
        assert_eq!(cached.to_rgba8().as_raw(), first.to_rgba8().as_raw());
    }

    #[tokio::test]
    async fn test_close_deletes_directory() {
        let dir = tempdir().unwrap();
        let cache = ImageBlobCache::new(dir.path());

        let key = cache.add(&test_image(8, 8)).await.unwrap();
        cache.close().await;

        assert!(!dir.path().join("image_blob_cache").exists());

        // A fresh cache at the same base directory finds nothing.
        let fresh = ImageBlobCache::new(dir.path());
        assert!(fresh.get(&key).await.is_none());
        let stats = fresh.stats().await;
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.total_size, 0);
    }

    #[tokio::test]
    async fn test_closed_cache_degrades_to_none() {
        let dir = tempdir().unwrap();
        let cache = ImageBlobCache::new(dir.path());

        let key = cache.add(&test_image(8, 8)).await.unwrap();
        cache.close().await;

        assert!(cache.get(&key).await.is_none());
        assert!(cache.add(&test_image(8, 8)).await.is_none());
    }

    #[tokio::test]
    async fn test_close_immediately_after_construction() {
        // close() may land before or after the background open; either way
        // it must not panic and must leave no directory behind.
        let dir = tempdir().unwrap();
        let cache = ImageBlobCache::new(dir.path());
        cache.close().await;

        assert!(cache.get("anything").await.is_none());
        tokio::task::yield_now().await;
        // If the open lost the race it deletes its own store on completion;
        // waiting for the gate makes that deterministic.
        assert!(cache.add(&test_image(4, 4)).await.is_none());
        assert!(!dir.path().join("image_blob_cache").exists());
    }

    #[tokio::test]
    async fn test_failed_initialization_degrades_to_miss() {
        let dir = tempdir().unwrap();
        // Occupy the cache path with a regular file so the store cannot
        // create its directory.
        std::fs::write(dir.path().join("image_blob_cache"), b"in the way").unwrap();

        let cache = ImageBlobCache::new(dir.path());

        assert!(cache.get("anything").await.is_none());
        assert!(cache.add(&test_image(8, 8)).await.is_none());
        cache.close().await;
    }

    #[tokio::test]
    async fn test_several_images_within_bound_all_retrievable() {
        let dir = tempdir().unwrap();
        let cache = ImageBlobCache::new(dir.path());

        let mut keys = Vec::new();
        for i in 0..5 {
            let image = test_image(32 + i, 32 + i);
            keys.push((cache.add(&image).await.unwrap(), image));
        }

        for (key, image) in &keys {
            let cached = cache.get(key).await.expect("entry within bound should hit");
            assert_eq!(cached.to_rgba8().as_raw(), image.to_rgba8().as_raw());
        }

        let stats = cache.stats().await;
        assert_eq!(stats.entries, 5);
        assert!(stats.total_size > 0);
        assert_eq!(stats.hits, 5);
    }

    #[tokio::test]
    async fn test_stats_track_activity() {
        let dir = tempdir().unwrap();
        let cache = ImageBlobCache::new(dir.path());

        cache.get("missing").await;
        let key = cache.add(&test_image(8, 8)).await.unwrap();
        cache.get(&key).await;

        let stats = cache.stats().await;
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!(stats.total_size > 0);
    }
}
