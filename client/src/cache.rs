//! Image cache on removable storage
//!
//! Downloaded image bytes are kept under `cache/<filename>` so the last
//! shown image can be replayed when the network is down. Presence is the only
//! validity check. The number of entries is bounded: an insertion-ordered
//! manifest (`cache/_index.json`) records what was written, and the oldest
//! files are removed once the bound is exceeded.

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt::Debug;

use log::{debug, info, warn};

/// Directory that holds every cache file
pub const CACHE_DIR: &str = "cache";

/// Insertion-order manifest inside [`CACHE_DIR`]
const MANIFEST: &str = "_index.json";

/// Largest manifest we read back
const MANIFEST_MAX: usize = 4096;

/// Filesystem collaborator keyed by `dir/name` paths
pub trait CacheStore {
    type Error: Debug;

    /// False when no card is present or it failed to mount
    fn is_available(&self) -> bool;
    fn exists(&mut self, path: &str) -> bool;
    fn size(&mut self, path: &str) -> Result<usize, Self::Error>;
    /// Fill `buf` from the start of the file, returning bytes read
    fn read(&mut self, path: &str, buf: &mut [u8]) -> Result<usize, Self::Error>;
    /// Create or truncate the file and write `data`
    fn write(&mut self, path: &str, data: &[u8]) -> Result<(), Self::Error>;
    fn remove(&mut self, path: &str) -> Result<(), Self::Error>;
    /// Remove every file in `dir`, returning how many were removed
    fn clear_dir(&mut self, dir: &str) -> Result<usize, Self::Error>;
}

/// Cache error types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheError {
    /// No storage present
    Unavailable,
    /// Caching turned off in configuration
    Disabled,
    /// Filename empty after sanitizing
    InvalidName,
    /// Entry does not exist
    NotFound,
    /// Not enough memory to load the entry
    Allocation,
    /// Underlying store reported an error
    Store,
}

/// Replace path separators so every entry stays directly under [`CACHE_DIR`]
pub fn sanitize(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect()
}

fn entry_path(name: &str) -> Result<String, CacheError> {
    let name = sanitize(name);
    if name.is_empty() || name == MANIFEST || name == "." || name == ".." {
        return Err(CacheError::InvalidName);
    }
    let mut path = String::with_capacity(CACHE_DIR.len() + 1 + name.len());
    path.push_str(CACHE_DIR);
    path.push('/');
    path.push_str(&name);
    Ok(path)
}

fn manifest_path() -> String {
    let mut path = String::from(CACHE_DIR);
    path.push('/');
    path.push_str(MANIFEST);
    path
}

/// Bounded image cache over a [`CacheStore`]
pub struct ImageCache<C: CacheStore> {
    store: C,
    enabled: bool,
    max_entries: usize,
}

impl<C: CacheStore> ImageCache<C> {
    pub fn new(store: C, enabled: bool, max_entries: usize) -> Self {
        Self {
            store,
            enabled,
            max_entries: max_entries.max(1),
        }
    }

    pub fn is_available(&self) -> bool {
        self.store.is_available()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Entry exists on available storage
    pub fn contains(&mut self, name: &str) -> bool {
        if !self.store.is_available() {
            return false;
        }
        match entry_path(name) {
            Ok(path) => self.store.exists(&path),
            Err(_) => false,
        }
    }

    /// Write `bytes` under `name` and enforce the entry bound
    pub fn store(&mut self, name: &str, bytes: &[u8]) -> Result<(), CacheError> {
        if !self.enabled {
            return Err(CacheError::Disabled);
        }
        if !self.store.is_available() {
            return Err(CacheError::Unavailable);
        }
        let path = entry_path(name)?;
        self.store.write(&path, bytes).map_err(|e| {
            warn!("cache: write {} failed: {:?}", path, e);
            CacheError::Store
        })?;
        info!("cache: stored {} ({} bytes)", path, bytes.len());

        let key = sanitize(name);
        let mut entries = self.read_manifest();
        entries.retain(|entry| *entry != key);
        entries.push(key.clone());
        self.evict(&mut entries, &key);
        self.write_manifest(&entries);
        Ok(())
    }

    /// Read the whole entry into a freshly allocated buffer
    pub fn load(&mut self, name: &str) -> Result<Vec<u8>, CacheError> {
        if !self.store.is_available() {
            return Err(CacheError::Unavailable);
        }
        let path = entry_path(name)?;
        if !self.store.exists(&path) {
            return Err(CacheError::NotFound);
        }
        let size = self.store.size(&path).map_err(|_| CacheError::Store)?;

        let mut buf = Vec::new();
        buf.try_reserve_exact(size)
            .map_err(|_| CacheError::Allocation)?;
        buf.resize(size, 0);
        let read = self.store.read(&path, &mut buf).map_err(|e| {
            warn!("cache: read {} failed: {:?}", path, e);
            CacheError::Store
        })?;
        buf.truncate(read);
        info!("cache: loaded {} ({} bytes)", path, read);
        Ok(buf)
    }

    /// Enforce the entry bound now, never removing `protect`
    pub fn cleanup(&mut self, protect: Option<&str>) -> Result<usize, CacheError> {
        if !self.store.is_available() {
            return Err(CacheError::Unavailable);
        }
        let protect = protect.map(sanitize).unwrap_or_default();
        let mut entries = self.read_manifest();
        let before = entries.len();
        // Forget entries whose files vanished.
        entries.retain(|entry| {
            entry_path(entry)
                .map(|path| self.store.exists(&path))
                .unwrap_or(false)
        });
        let removed = self.evict(&mut entries, &protect);
        if entries.len() != before {
            self.write_manifest(&entries);
        }
        Ok(removed)
    }

    /// Remove every cache file including the manifest
    pub fn clear(&mut self) -> Result<usize, CacheError> {
        if !self.store.is_available() {
            return Err(CacheError::Unavailable);
        }
        let removed = self
            .store
            .clear_dir(CACHE_DIR)
            .map_err(|_| CacheError::Store)?;
        info!("cache: cleared {} files", removed);
        Ok(removed)
    }

    /// Cached filenames, oldest first
    pub fn entries(&mut self) -> Vec<String> {
        if !self.store.is_available() {
            return Vec::new();
        }
        self.read_manifest()
    }

    fn evict(&mut self, entries: &mut Vec<String>, protect: &str) -> usize {
        let mut removed = 0;
        while entries.len() > self.max_entries {
            let Some(index) = entries.iter().position(|entry| entry != protect) else {
                break;
            };
            let victim = entries.remove(index);
            if let Ok(path) = entry_path(&victim) {
                match self.store.remove(&path) {
                    Ok(()) => debug!("cache: evicted {}", path),
                    Err(e) => warn!("cache: evict {} failed: {:?}", path, e),
                }
            }
            removed += 1;
        }
        removed
    }

    fn read_manifest(&mut self) -> Vec<String> {
        let path = manifest_path();
        if !self.store.exists(&path) {
            return Vec::new();
        }
        let mut buf = vec![0u8; MANIFEST_MAX];
        let Ok(len) = self.store.read(&path, &mut buf) else {
            return Vec::new();
        };
        match serde_json_core::from_slice::<Vec<String>>(&buf[..len]) {
            Ok((entries, _)) => entries,
            Err(_) => {
                warn!("cache: manifest unreadable, starting over");
                Vec::new()
            }
        }
    }

    fn write_manifest(&mut self, entries: &[String]) {
        let estimate = entries.iter().map(|e| e.len() * 6 + 3).sum::<usize>() + 2;
        let mut buf = vec![0u8; estimate];
        let Ok(len) = serde_json_core::to_slice(&entries, &mut buf) else {
            warn!("cache: manifest encode failed");
            return;
        };
        if let Err(e) = self.store.write(&manifest_path(), &buf[..len]) {
            warn!("cache: manifest write failed: {:?}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryCache;
    use alloc::format;

    #[test]
    fn test_store_and_load() {
        let mut cache = ImageCache::new(MemoryCache::default(), true, 10);
        cache.store("plugin-1.png", b"abc").unwrap();
        assert!(cache.contains("plugin-1.png"));
        assert_eq!(cache.load("plugin-1.png").unwrap(), b"abc");
    }

    #[test]
    fn test_filename_is_flattened() {
        let store = MemoryCache::default();
        let mut cache = ImageCache::new(store.clone(), true, 10);
        cache.store("a/b.png", b"x").unwrap();
        assert!(store.has("cache/a_b.png"));
    }

    #[test]
    fn test_oldest_entries_evicted() {
        let store = MemoryCache::default();
        let mut cache = ImageCache::new(store.clone(), true, 3);
        for i in 0..5 {
            cache.store(&format!("img{}.png", i), b"data").unwrap();
        }
        assert!(!store.has("cache/img0.png"));
        assert!(!store.has("cache/img1.png"));
        assert!(store.has("cache/img4.png"));
        assert_eq!(cache.entries(), ["img2.png", "img3.png", "img4.png"]);
    }

    #[test]
    fn test_restore_moves_entry_to_newest() {
        let mut cache = ImageCache::new(MemoryCache::default(), true, 2);
        cache.store("a.png", b"1").unwrap();
        cache.store("b.png", b"2").unwrap();
        cache.store("a.png", b"3").unwrap();
        cache.store("c.png", b"4").unwrap();
        assert_eq!(cache.entries(), ["a.png", "c.png"]);
    }

    #[test]
    fn test_unavailable_store_is_silent() {
        let mut cache = ImageCache::new(MemoryCache::unavailable(), true, 10);
        assert!(!cache.contains("a.png"));
        assert_eq!(cache.store("a.png", b"1"), Err(CacheError::Unavailable));
        assert_eq!(cache.load("a.png"), Err(CacheError::Unavailable));
    }

    #[test]
    fn test_disabled_cache_does_not_write() {
        let store = MemoryCache::default();
        let mut cache = ImageCache::new(store.clone(), false, 10);
        assert_eq!(cache.store("a.png", b"1"), Err(CacheError::Disabled));
        assert!(!store.has("cache/a.png"));
    }

    #[test]
    fn test_clear_removes_everything() {
        let store = MemoryCache::default();
        let mut cache = ImageCache::new(store.clone(), true, 10);
        cache.store("a.png", b"1").unwrap();
        cache.store("b.png", b"2").unwrap();
        assert_eq!(cache.clear().unwrap(), 3);
        assert!(cache.entries().is_empty());
    }

    #[test]
    fn test_empty_name_rejected() {
        let mut cache = ImageCache::new(MemoryCache::default(), true, 10);
        assert_eq!(cache.store("", b"1"), Err(CacheError::InvalidName));
    }
}
