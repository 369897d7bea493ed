//! In-process caches backing repeated `ZarrStore` opens and chunk reads (§3 "Supplemented").
//!
//! Two distinct caches, both bounded, both below the GPU tile cache in the stack:
//! - [`MetadataCache`] avoids re-probing v2/v3 metadata for datasets sharing a root.
//! - [`ChunkCache`] avoids re-decoding a chunk fetched for one output tile when a different
//!   output tile (e.g. an adjacent zoom level during parent-fallback) needs the same chunk.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;

use super::metadata::ZarrVersion;

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct MetadataCacheKey {
    pub version: Option<&'static str>,
    pub source: String,
    pub subpath: String,
}

impl MetadataCacheKey {
    pub fn new(version: Option<ZarrVersion>, source: &str, subpath: &str) -> Self {
        Self {
            version: version.map(|v| match v {
                ZarrVersion::V2 => "v2",
                ZarrVersion::V3 => "v3",
            }),
            source: source.to_string(),
            subpath: subpath.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CachedMetadata {
    pub pyramid: PyramidKindCache,
}

/// A cloneable mirror of [`PyramidKind`] (which is not `Clone` because `ArrayMetadata`
/// carries `Vec`s we'd rather not duplicate per cache hit) — cache entries are cheap to
/// reconstruct from this since it's the same shape.
#[derive(Debug, Clone)]
pub enum PyramidKindCache {
    Tiled {
        level_paths: Vec<String>,
        tile_size: u32,
    },
    Untiled,
}

/// Per-process cache of resolved Zarr metadata, keyed by `(version, source, subpath)` (§4.B).
pub struct MetadataCache {
    inner: Mutex<LruCache<MetadataCacheKey, CachedMetadata>>,
}

impl MetadataCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity.max(1)).unwrap(),
            )),
        }
    }

    pub fn get(&self, key: &MetadataCacheKey) -> Option<CachedMetadata> {
        self.inner.lock().unwrap().get(key).cloned()
    }

    pub fn insert(&self, key: MetadataCacheKey, value: CachedMetadata) {
        self.inner.lock().unwrap().put(key, value);
    }
}

impl Default for MetadataCache {
    fn default() -> Self {
        Self::new(32)
    }
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct ChunkCacheKey {
    pub level_path: String,
    pub chunk_indices: Vec<u64>,
}

/// A decoded chunk, scale/offset-raw (not yet turned into a tile slice).
#[derive(Debug, Clone)]
pub struct ChunkData {
    pub values: Vec<f64>,
    pub shape: Vec<u64>,
}

/// Bounded-by-entry-count cache of decoded chunks, independent of (and below) the GPU tile
/// cache; sits between `zarr::ZarrStore` and the `tiles`/`untiled` managers so two output
/// tiles sharing a source chunk only decode it once.
pub struct ChunkCache {
    inner: Mutex<LruCache<ChunkCacheKey, ChunkData>>,
}

impl ChunkCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity.max(1)).unwrap(),
            )),
        }
    }

    pub fn get(&self, key: &ChunkCacheKey) -> Option<ChunkData> {
        self.inner.lock().unwrap().get(key).cloned()
    }

    pub fn insert(&self, key: ChunkCacheKey, value: ChunkData) {
        self.inner.lock().unwrap().put(key, value);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ChunkCache {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_cache_evicts_lru() {
        let cache = ChunkCache::new(2);
        let key = |i: u64| ChunkCacheKey {
            level_path: "0".to_string(),
            chunk_indices: vec![i, 0],
        };
        cache.insert(
            key(1),
            ChunkData {
                values: vec![1.0],
                shape: vec![1],
            },
        );
        cache.insert(
            key(2),
            ChunkData {
                values: vec![2.0],
                shape: vec![1],
            },
        );
        cache.insert(
            key(3),
            ChunkData {
                values: vec![3.0],
                shape: vec![1],
            },
        );
        assert!(cache.get(&key(1)).is_none());
        assert!(cache.get(&key(2)).is_some());
        assert!(cache.get(&key(3)).is_some());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn metadata_cache_keys_distinguish_subpaths() {
        let cache = MetadataCache::new(4);
        let a = MetadataCacheKey::new(None, "https://example.com/ds.zarr", "temp");
        let b = MetadataCacheKey::new(None, "https://example.com/ds.zarr", "precip");
        cache.insert(
            a.clone(),
            CachedMetadata {
                pyramid: PyramidKindCache::Untiled,
            },
        );
        assert!(cache.get(&a).is_some());
        assert!(cache.get(&b).is_none());
    }
}
