//! Tile data manager (§4.C): viewport -> visible tile set, chunk-to-tile slicing, and the
//! LRU cache of sliced tile data that `gpu_cache`/`render` upload from.
//!
//! This module is pure CPU-side bookkeeping: no GPU handles live here (those belong to
//! `gpu_cache::GpuTileCache`), and no network I/O happens directly (chunks come in through
//! `ChunkFetcher`, the `tile_fetcher.rs`-style async/drain pair below).

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use bevy::log::{debug, trace, warn};
use bevy::tasks::IoTaskPool;
use lru::LruCache;

use crate::error::{TileError, ZarrError};
use crate::mapmath::{self, GeoBounds, Tile};
use crate::selector::{Selector, SelectorValue};
use crate::zarr::cache::ChunkData;
use crate::zarr::metadata::PyramidLevel;
use crate::zarr::store::ZarrStore;

/// Per-selector-set resolved indices: for each non-spatial dimension the selector touches, the
/// concrete global index (or, for a list selector, one index per band entry) that dimension's
/// `SelectorValue` maps to, matched against the real coordinate array ahead of time (§3 "a
/// single value matched to the coordinate array", §4.B). Dims absent here sit at index 0.
#[derive(Debug, Clone, Default)]
pub struct ResolvedSelector(HashMap<String, Vec<u64>>);

impl ResolvedSelector {
    pub fn set(&mut self, dim: impl Into<String>, indices: Vec<u64>) {
        self.0.insert(dim.into(), indices);
    }

    /// The resolved global index for `dim`'s `band_index`-th entry, falling back to the first
    /// (and usually only) entry when `band_index` is out of range or `dim` isn't a list.
    pub fn index_for(&self, dim: &str, band_index: usize) -> u64 {
        self.0
            .get(dim)
            .and_then(|indices| indices.get(band_index).or_else(|| indices.first()))
            .copied()
            .unwrap_or(0)
    }

    /// Build a resolved selector straight from `Index`/`List` entries, no coordinate lookup
    /// needed: `List` entries fall back to their position in the list (the band dimension's
    /// own chunk size is 1 in every fixture that exercises this path, so position and global
    /// index coincide). Used wherever a caller has no live `ZarrStore` to resolve `Value`
    /// entries against (unit tests, previews before a store finishes opening).
    pub fn from_indices(selector: &Selector) -> Self {
        let mut resolved = Self::default();
        for dim in selector.dims() {
            match selector.get(dim) {
                Some(SelectorValue::Index(idx)) => resolved.set(dim, vec![*idx as u64]),
                Some(SelectorValue::List(values)) => {
                    resolved.set(dim, (0..values.len() as u64).collect());
                }
                _ => {}
            }
        }
        resolved
    }

    /// Resolve every dimension `selector` touches against `store`'s coordinate arrays.
    /// `Value`/`List` entries that fail to resolve (missing coordinate array, no matching
    /// label) default to index 0 and log a warning rather than failing the whole selector.
    pub fn resolve(store: &ZarrStore, selector: &Selector) -> Self {
        let mut resolved = Self::default();
        for dim in selector.dims() {
            match selector.get(dim) {
                Some(SelectorValue::Index(idx)) => resolved.set(dim, vec![*idx as u64]),
                Some(SelectorValue::Value(value)) => match store.resolve_coord_value(dim, value) {
                    Ok(idx) => resolved.set(dim, vec![idx]),
                    Err(err) => {
                        warn!(dim, %err, "could not resolve selector value against coordinate array, defaulting to index 0");
                        resolved.set(dim, vec![0]);
                    }
                },
                Some(SelectorValue::List(values)) => {
                    let indices = values
                        .iter()
                        .map(|value| match store.resolve_coord_value(dim, value) {
                            Ok(idx) => idx,
                            Err(err) => {
                                warn!(dim, %err, "could not resolve list selector entry, defaulting to index 0");
                                0
                            }
                        })
                        .collect();
                    resolved.set(dim, indices);
                }
                None => {}
            }
        }
        resolved
    }
}

/// What the host map reports each frame (§4.C step 1).
#[derive(Debug, Clone, Copy)]
pub struct Viewport {
    pub zoom: f64,
    pub bounds: GeoBounds,
}

/// A dense, fill-padded `tile_size x tile_size` slice, one per band (§3 "Tile render data").
/// Row-major `y` then `x`; row 0 is the tile's north edge unless `lat_is_ascending`.
#[derive(Debug, Clone)]
pub struct TileSlice {
    pub tile_size: u32,
    pub band_names: Vec<String>,
    pub bands: Vec<Vec<f32>>,
}

impl TileSlice {
    pub fn channels(&self) -> usize {
        self.bands.len()
    }
}

/// One tile's cache state: chunk identity, the decoded chunks backing it (kept so a selector
/// change can re-slice without refetching), and the sliced-and-padded render data.
struct TileCacheEntry {
    chunk_indices: Vec<Vec<u64>>,
    chunks: Vec<Option<ChunkData>>,
    data: Option<TileSlice>,
    selector_hash: Option<String>,
    loading: bool,
}

impl TileCacheEntry {
    fn empty(band_count: usize) -> Self {
        Self {
            chunk_indices: vec![Vec::new(); band_count.max(1)],
            chunks: vec![None; band_count.max(1)],
            data: None,
            selector_hash: None,
            loading: false,
        }
    }
}

/// Identifies one chunk fetch the manager still needs: the level path plus chunk indices.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChunkFetchKey {
    pub level_path: String,
    pub chunk_indices: Vec<u64>,
}

/// Outcome of [`TileDataManager::acquire`]: the tiles the layer should draw this frame (with
/// slices for the ones that are ready) plus chunk fetches still outstanding.
pub struct AcquireResult {
    pub ready: Vec<(Tile, TileSlice)>,
    pub pending: Vec<Tile>,
    pub fetches_needed: Vec<(Tile, ChunkFetchKey)>,
}

pub struct TileDataManager {
    levels: Vec<PyramidLevel>,
    tile_size: u32,
    min_render_zoom: f64,
    cache: LruCache<Tile, TileCacheEntry>,
    in_flight: HashSet<ChunkFetchKey>,
    selector: Selector,
    resolved: ResolvedSelector,
}

impl TileDataManager {
    pub fn new(levels: Vec<PyramidLevel>, tile_size: u32, min_render_zoom: f64, max_cached_tiles: usize) -> Self {
        Self {
            levels,
            tile_size,
            min_render_zoom,
            cache: LruCache::new(NonZeroUsize::new(max_cached_tiles.max(1)).unwrap()),
            in_flight: HashSet::new(),
            selector: Selector::new(),
            resolved: ResolvedSelector::default(),
        }
    }

    pub fn max_level(&self) -> u8 {
        self.levels.len().saturating_sub(1) as u8
    }

    pub fn len_cached(&self) -> usize {
        self.cache.len()
    }

    /// Changing the selector bumps every live tile's target hash. Tiles whose cached chunks
    /// still cover the new selector are re-sliced in place (no refetch); everything else has
    /// its `data`/`selector_hash` cleared so the next `acquire` triggers a fresh fetch (§4.C
    /// "Selector hash", §5 ordering guarantee).
    pub fn set_selector(&mut self, selector: Selector, resolved: ResolvedSelector) {
        self.selector = selector;
        self.resolved = resolved;
        let hash = self.selector.hash();
        let tile_size = self.tile_size;
        let level = self.max_level();
        for (tile, entry) in self.cache.iter_mut() {
            let level_meta = self.levels.get(tile.z.min(level) as usize);
            let Some(level_meta) = level_meta else { continue };
            let chunk_indices = chunk_indices_for_tile(*tile, &level_meta.metadata, &self.selector, &self.resolved);
            if entry.chunks.len() == chunk_indices.len()
                && entry
                    .chunks
                    .iter()
                    .zip(chunk_indices.iter())
                    .zip(entry.chunk_indices.iter())
                    .all(|((chunk, wanted), cached)| chunk.is_some() && wanted == cached)
            {
                entry.data = Some(slice_tile(
                    &entry.chunks,
                    &chunk_indices,
                    &level_meta.metadata,
                    &self.selector,
                    &self.resolved,
                    tile_size,
                ));
                entry.selector_hash = Some(hash.clone());
            } else {
                entry.data = None;
                entry.selector_hash = None;
                entry.chunk_indices = chunk_indices;
                entry.chunks = vec![None; entry.chunk_indices.len()];
            }
        }
    }

    pub fn selector_hash(&self) -> String {
        self.selector.hash()
    }

    /// §4.C steps 1-4: compute the visible tile set, reuse cached slices, and report which
    /// chunks still need fetching for the ones that are missing or stale.
    pub fn acquire(&mut self, viewport: Viewport) -> AcquireResult {
        if viewport.zoom < self.min_render_zoom || self.levels.is_empty() {
            return AcquireResult {
                ready: Vec::new(),
                pending: Vec::new(),
                fetches_needed: Vec::new(),
            };
        }

        let level = mapmath::zoom_to_level(viewport.zoom, self.max_level());
        let level_meta = &self.levels[level as usize];
        let visible = mapmath::tiles_at_zoom(level, viewport.bounds);

        let mut ready = Vec::new();
        let mut pending = Vec::new();
        let mut fetches_needed = Vec::new();
        let hash = self.selector.hash();

        for tile in visible {
            let chunk_indices = chunk_indices_for_tile(tile, &level_meta.metadata, &self.selector, &self.resolved);
            let band_count = chunk_indices.len();
            let entry = self
                .cache
                .get_or_insert_mut(tile, || TileCacheEntry::empty(band_count));

            if entry.data.is_some() && entry.selector_hash.as_deref() == Some(hash.as_str()) {
                ready.push((tile, entry.data.clone().unwrap()));
                continue;
            }

            if entry.chunk_indices == chunk_indices && entry.chunks.iter().all(Option::is_some) {
                // Same chunks as before, only the selector's in-chunk offset moved.
                entry.data = Some(slice_tile(
                    &entry.chunks,
                    &chunk_indices,
                    &level_meta.metadata,
                    &self.selector,
                    &self.resolved,
                    self.tile_size,
                ));
                entry.selector_hash = Some(hash.clone());
                ready.push((tile, entry.data.clone().unwrap()));
                continue;
            }

            entry.chunk_indices = chunk_indices.clone();
            entry.chunks = vec![None; band_count];
            entry.loading = true;
            pending.push(tile);
            for indices in &chunk_indices {
                let key = ChunkFetchKey {
                    level_path: level_meta.path.clone(),
                    chunk_indices: indices.clone(),
                };
                if self.in_flight.insert(key.clone()) {
                    fetches_needed.push((tile, key));
                }
            }
        }

        AcquireResult {
            ready,
            pending,
            fetches_needed,
        }
    }

    /// Install a fetched chunk, re-slicing every cache entry waiting on it (§4.C step 3,
    /// "re-slice from the cached chunk"). Stale results (selector moved on since the fetch was
    /// issued) are installed anyway since the chunk is still useful cache fodder, but no longer
    /// mark a tile ready unless its hash still matches — checked on the next `acquire`.
    pub fn install_chunk(&mut self, key: &ChunkFetchKey, data: ChunkData) {
        self.in_flight.remove(key);
        let level = self.levels.iter().find(|l| l.path == key.level_path);
        let Some(level) = level else { return };
        let tile_size = self.tile_size;
        let selector = self.selector.clone();
        let resolved = self.resolved.clone();

        for (_, entry) in self.cache.iter_mut() {
            for (i, indices) in entry.chunk_indices.iter().enumerate() {
                if indices == &key.chunk_indices {
                    entry.chunks[i] = Some(data.clone());
                }
            }
            if entry.chunks.iter().all(Option::is_some) && entry.data.is_none() {
                entry.data = Some(slice_tile(
                    &entry.chunks,
                    &entry.chunk_indices,
                    &level.metadata,
                    &selector,
                    &resolved,
                    tile_size,
                ));
                entry.selector_hash = Some(selector.hash());
                entry.loading = false;
            }
        }
    }
}

/// Per-tile chunk indices: spatial dims from `(x, y)`, non-spatial dims from the selector's
/// index for that dim. A list selector yields one chunk-index vector per band (§3 "Tile
/// identity").
pub(crate) fn chunk_indices_for_tile(
    tile: Tile,
    meta: &crate::zarr::metadata::ArrayMetadata,
    selector: &Selector,
    resolved: &ResolvedSelector,
) -> Vec<Vec<u64>> {
    let band_dim = selector.band_dim();
    let band_count = band_dim
        .map(|d| selector.band_names(d).len())
        .unwrap_or(1)
        .max(1);

    (0..band_count)
        .map(|band_index| {
            meta.dimension_names
                .iter()
                .enumerate()
                .map(|(i, name)| {
                    use crate::zarr::metadata::DimRole;
                    match meta.dim_roles[i] {
                        DimRole::Lon => tile.x as u64,
                        DimRole::Lat => tile.y as u64,
                        DimRole::Other => {
                            let chunk_dim = meta.chunks.get(i).copied().unwrap_or(1).max(1);
                            resolved.index_for(name, band_index) / chunk_dim
                        }
                    }
                })
                .collect()
        })
        .collect()
}

/// Dense `tile_size x tile_size` extraction from each band's chunk, padded with the
/// normalized fill value outside `min(chunk_dim, tile_size)` (§4.C "Slice extraction").
pub(crate) fn slice_tile(
    chunks: &[Option<ChunkData>],
    chunk_indices: &[Vec<u64>],
    meta: &crate::zarr::metadata::ArrayMetadata,
    selector: &Selector,
    resolved: &ResolvedSelector,
    tile_size: u32,
) -> TileSlice {
    use crate::zarr::metadata::DimRole;

    let fill = meta.fill_value.unwrap_or(f32::NAN as f64) as f32;
    let lat_dim = meta.lat_dim();
    let lon_dim = meta.lon_dim();
    let band_dim = selector.band_dim();
    let band_names = if let Some(dim) = band_dim {
        selector.band_names(dim)
    } else {
        vec!["value".to_string()]
    };

    let mut bands = Vec::with_capacity(chunks.len());
    for (band_index, chunk) in chunks.iter().enumerate() {
        let mut out = vec![fill; (tile_size * tile_size) as usize];
        if let Some(chunk) = chunk {
            let indices = &chunk_indices[band_index];
            let chunk_lat = lat_dim.and_then(|d| chunk.shape.get(d)).copied().unwrap_or(0);
            let chunk_lon = lon_dim.and_then(|d| chunk.shape.get(d)).copied().unwrap_or(0);
            let copy_h = chunk_lat.min(tile_size as u64) as u32;
            let copy_w = chunk_lon.min(tile_size as u64) as u32;

            // strides for the chunk's flat layout (row-major over its own dims)
            let strides = row_major_strides(&chunk.shape);

            for ty in 0..copy_h {
                for tx in 0..copy_w {
                    let mut flat = 0usize;
                    for (d, stride) in strides.iter().enumerate() {
                        let coord = if Some(d) == lat_dim {
                            ty as u64
                        } else if Some(d) == lon_dim {
                            tx as u64
                        } else {
                            let chunk_dim = meta.chunks.get(d).copied().unwrap_or(1).max(1);
                            let global = indices.get(d).copied().unwrap_or(0) * chunk_dim
                                + non_spatial_local_offset(meta, d, resolved, band_index);
                            let origin = indices.get(d).copied().unwrap_or(0) * chunk_dim;
                            (global.saturating_sub(origin)).min(chunk.shape.get(d).copied().unwrap_or(1).saturating_sub(1))
                        };
                        flat += coord as usize * *stride as usize;
                    }
                    if let Some(&raw) = chunk.values.get(flat) {
                        let value = if meta.fill_value.is_some_and(|f| raw == f) {
                            f32::NAN
                        } else {
                            (raw * meta.scale_factor + meta.add_offset) as f32
                        };
                        out[(ty * tile_size + tx) as usize] = value;
                    }
                }
            }
        }
        bands.push(out);
    }

    TileSlice {
        tile_size,
        band_names,
        bands,
    }
}

pub(crate) fn row_major_strides(shape: &[u64]) -> Vec<u64> {
    let mut strides = vec![1u64; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

/// The chunk-local offset a non-spatial dimension's selector resolves to, clamped into
/// `[0, chunk_dim)` (§4.C "non-spatial positions ... clamped").
pub(crate) fn non_spatial_local_offset(
    meta: &crate::zarr::metadata::ArrayMetadata,
    dim: usize,
    resolved: &ResolvedSelector,
    band_index: usize,
) -> u64 {
    let name = &meta.dimension_names[dim];
    let chunk_dim = meta.chunks.get(dim).copied().unwrap_or(1).max(1);
    resolved.index_for(name, band_index) % chunk_dim
}

/// Async chunk fetcher, mirroring `tile_fetcher.rs`'s request/drain pattern: one in-flight
/// task per key, results drained on a `PostUpdate` system and handed to
/// [`TileDataManager::install_chunk`].
pub struct ChunkFetcher {
    store: Arc<ZarrStore>,
    sender: mpsc::Sender<(ChunkFetchKey, Result<ChunkData, ZarrError>)>,
    receiver: Arc<Mutex<mpsc::Receiver<(ChunkFetchKey, Result<ChunkData, ZarrError>)>>>,
}

impl ChunkFetcher {
    pub fn new(store: Arc<ZarrStore>) -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            store,
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
        }
    }

    pub fn request(&self, key: ChunkFetchKey) {
        let store = Arc::clone(&self.store);
        let sender = self.sender.clone();
        let task_key = key.clone();
        IoTaskPool::get()
            .spawn(async move {
                let result = store.get_chunk(&task_key.level_path, &task_key.chunk_indices);
                let _ = sender.send((task_key, result));
            })
            .detach();
        trace!(level_path = %key.level_path, ?key.chunk_indices, "requested chunk fetch");
    }

    pub fn drain_ready(&self) -> Vec<(ChunkFetchKey, Result<ChunkData, ZarrError>)> {
        let receiver = self.receiver.lock().unwrap();
        let mut out = Vec::new();
        while let Ok(item) = receiver.try_recv() {
            out.push(item);
        }
        out
    }
}

/// Drain pending chunk fetches and install them, logging failures once per chunk (§7
/// propagation policy: fetch errors are retried as the viewport/selector changes, never
/// fatal).
pub fn apply_chunk_fetch_results(fetcher: &ChunkFetcher, manager: &mut TileDataManager) {
    for (key, result) in fetcher.drain_ready() {
        match result {
            Ok(data) => {
                debug!(level_path = %key.level_path, "chunk fetched");
                manager.install_chunk(&key, data);
            }
            Err(err) => {
                warn!(level_path = %key.level_path, error = %err, "chunk fetch failed, will retry on next viewport update");
                let _ = TileError::Zarr(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zarr::metadata::{ArrayMetadata, DimRole};

    fn meta() -> ArrayMetadata {
        ArrayMetadata {
            shape: vec![12, 256, 256],
            chunks: vec![1, 128, 128],
            dimension_names: vec!["time".into(), "lat".into(), "lon".into()],
            dim_roles: vec![DimRole::Other, DimRole::Lat, DimRole::Lon],
            fill_value: Some(-9999.0),
            scale_factor: 1.0,
            add_offset: 0.0,
        }
    }

    #[test]
    fn chunk_indices_substitute_xy_and_selector() {
        let mut selector = Selector::new();
        selector.set("time", crate::selector::SelectorValue::Index(3));
        let resolved = ResolvedSelector::from_indices(&selector);
        let indices = chunk_indices_for_tile(Tile::new(2, 1, 0), &meta(), &selector, &resolved);
        assert_eq!(indices, vec![vec![3, 0, 1]]);
    }

    #[test]
    fn list_selector_resolves_to_real_indices_not_position() {
        let mut selector = Selector::new();
        selector.set(
            "time",
            crate::selector::SelectorValue::List(vec![
                crate::selector::CoordValue::Number(6.0),
                crate::selector::CoordValue::Number(7.0),
            ]),
        );
        let mut resolved = ResolvedSelector::default();
        resolved.set("time", vec![6, 7]);
        let indices = chunk_indices_for_tile(Tile::new(2, 1, 0), &meta(), &selector, &resolved);
        assert_eq!(indices, vec![vec![6, 0, 1], vec![7, 0, 1]]);
    }

    #[test]
    fn slice_tile_pads_with_fill_outside_chunk() {
        let m = meta();
        let chunk_shape = vec![1u64, 2, 2];
        let chunk = ChunkData {
            values: vec![1.0, 2.0, 3.0, 4.0],
            shape: chunk_shape,
        };
        let selector = Selector::new();
        let resolved = ResolvedSelector::default();
        let slice = slice_tile(
            &[Some(chunk)],
            &[vec![0, 0, 0]],
            &m,
            &selector,
            &resolved,
            4,
        );
        assert_eq!(slice.bands[0][0], 1.0);
        assert_eq!(slice.bands[0][1], 2.0);
        // outside the 2x2 source region: padded with NaN (fill normalized)
        assert!(slice.bands[0][2].is_nan());
        assert!(slice.bands[0][15].is_nan());
    }

    #[test]
    fn fill_raw_value_normalizes_to_nan() {
        let m = meta();
        let chunk = ChunkData {
            values: vec![-9999.0, 5.0, 5.0, 5.0],
            shape: vec![1, 2, 2],
        };
        let selector = Selector::new();
        let resolved = ResolvedSelector::default();
        let slice = slice_tile(&[Some(chunk)], &[vec![0, 0, 0]], &m, &selector, &resolved, 2);
        assert!(slice.bands[0][0].is_nan());
        assert_eq!(slice.bands[0][1], 5.0);
    }

    #[test]
    fn cache_bound_respected() {
        let levels = vec![PyramidLevel {
            path: "0".into(),
            metadata: meta(),
        }];
        let mut mgr = TileDataManager::new(levels, 2, 0.0, 2);
        let result = mgr.acquire(Viewport {
            zoom: 0.0,
            bounds: GeoBounds::WORLD,
        });
        assert!(mgr.len_cached() <= 2);
        assert!(!result.fetches_needed.is_empty() || result.pending.is_empty());
    }
}
