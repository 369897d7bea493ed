//! Layer facade (§4.I): the public surface a host app builds against. `ZarrLayerOptions`
//! mirrors `MapPlugin`'s config-by-struct convention; `ZarrLayer` owns the lifecycle
//! (`on_add`/`render`/`prerender`/`on_remove`) and dispatches to `tiles`/`untiled` based on
//! what `zarr::ZarrStore::open` reports.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use bevy::log::{error, info, warn};
use bevy::prelude::*;
use bevy::tasks::IoTaskPool;

use crate::error::{ConfigError, LayerError, ZarrError};
use crate::gpu_cache::GpuTileCache;
use crate::mapmath::{GeoBounds, Tile};
use crate::render::{self, RegionBounds, RenderableRegion, ReprojectionUniforms, TileDrawCall};
use crate::selector::Selector;
use crate::shader::ProgramCache;
use crate::tiles::{ChunkFetcher, ResolvedSelector, TileDataManager, TileSlice, Viewport, apply_chunk_fetch_results};
use crate::untiled::RegionRenderData;
use crate::zarr::cache::{ChunkCache, MetadataCache};
use crate::zarr::metadata::{Crs, PyramidKind, ZarrVersion};
use crate::zarr::store::{OpenOptions, TransformRequestHook, ZarrStore};

/// `renderingMode` (§6): flat Mercator host vs. a 3D globe host (behind the `globe` feature).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenderingMode {
    #[default]
    Flat,
    Globe,
}

/// One RGB colormap stop, resolved (not authored) by this crate — palette *authoring* is the
/// external collaborator named in §1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorStop {
    pub r: f32,
    pub g: f32,
    pub b: f32,
}

/// What the `on_loading_state_change` callback reports (§6, §7): whether metadata is still
/// resolving, whether any chunk is in flight, and the OR of both as `loading`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LoadingState {
    pub loading: bool,
    pub metadata: bool,
    pub chunks: bool,
}

pub type LoadingStateCallback = Arc<dyn Fn(LoadingState) + Send + Sync>;
pub type UniformEffect = f32;

/// Superset options table from §6, with the same field names (snake_cased) as the spec's
/// option table.
#[derive(Clone)]
pub struct ZarrLayerOptions {
    pub id: String,
    pub source: String,
    pub variable: String,
    pub colormap: Vec<ColorStop>,
    pub clim: (f32, f32),
    pub selector: Selector,
    pub opacity: f32,
    pub zarr_version: Option<ZarrVersion>,
    pub minzoom: Option<f64>,
    pub maxzoom: Option<f64>,
    pub min_render_zoom: f64,
    pub fill_value: Option<f64>,
    pub spatial_dimensions: Option<(String, String)>,
    pub crs: Option<Crs>,
    pub proj4: Option<String>,
    pub bounds: Option<(f64, f64, f64, f64)>,
    pub lat_is_ascending: Option<bool>,
    pub rendering_mode: RenderingMode,
    pub custom_frag: Option<String>,
    pub uniforms: HashMap<String, UniformEffect>,
    pub on_loading_state_change: Option<LoadingStateCallback>,
    pub throttle_ms: u64,
    pub transform_request: Option<TransformRequestHook>,
    pub max_cached_tiles: usize,
}

impl Default for ZarrLayerOptions {
    fn default() -> Self {
        Self {
            id: String::new(),
            source: String::new(),
            variable: String::new(),
            colormap: Vec::new(),
            clim: (0.0, 1.0),
            selector: Selector::new(),
            opacity: 1.0,
            zarr_version: None,
            minzoom: None,
            maxzoom: None,
            min_render_zoom: 0.0,
            fill_value: None,
            spatial_dimensions: None,
            crs: None,
            proj4: None,
            bounds: None,
            lat_is_ascending: None,
            rendering_mode: RenderingMode::default(),
            custom_frag: None,
            uniforms: HashMap::new(),
            on_loading_state_change: None,
            throttle_ms: 0,
            transform_request: None,
            max_cached_tiles: 64,
        }
    }
}

impl ZarrLayerOptions {
    /// Fail fast on the configuration errors §7 requires before any data access is attempted.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source.is_empty() {
            return Err(ConfigError::MissingOption("source"));
        }
        if self.variable.is_empty() {
            return Err(ConfigError::MissingOption("variable"));
        }
        if self.colormap.is_empty() {
            return Err(ConfigError::EmptyColormap);
        }
        if let Some(crs) = &self.crs {
            if crate::untiled::requires_proj4(crs) && self.proj4.is_none() {
                return Err(ConfigError::CrsWithoutProj4 {
                    crs: format!("{crs:?}"),
                });
            }
        }
        Ok(())
    }
}

/// Which data manager a layer is driven by, chosen once at `on_add` based on whether the
/// store reports a multiscale pyramid (§1 control flow).
enum DataManagerKind {
    Tiled(TileDataManager),
    Untiled { regions: Vec<RegionRenderData> },
}

/// A single Zarr overlay's full lifecycle state (§4.I).
pub struct ZarrLayer {
    pub options: ZarrLayerOptions,
    store: Option<Arc<ZarrStore>>,
    manager: Option<DataManagerKind>,
    chunk_fetcher: Option<ChunkFetcher>,
    gpu_cache: GpuTileCache,
    program_cache: ProgramCache,
    inert: bool,
    removed: Arc<AtomicBool>,
    pending_selector: Option<(Selector, std::time::Instant)>,
    restore_render_world_copies: Option<bool>,
}

impl ZarrLayer {
    pub fn new(options: ZarrLayerOptions) -> Self {
        let max_cached_tiles = options.max_cached_tiles;
        Self {
            options,
            store: None,
            manager: None,
            chunk_fetcher: None,
            gpu_cache: GpuTileCache::new(max_cached_tiles),
            program_cache: ProgramCache::default(),
            inert: false,
            removed: Arc::new(AtomicBool::new(false)),
            pending_selector: None,
            restore_render_world_copies: None,
        }
    }

    pub fn is_inert(&self) -> bool {
        self.inert
    }

    fn notify_loading(&self, state: LoadingState) {
        if let Some(callback) = &self.options.on_loading_state_change {
            callback(state);
        }
    }

    /// Open the store synchronously and pick a data manager (§4.I `on_add`). The blocking
    /// metadata fetch itself should be run off the render thread by the caller (an
    /// `IoTaskPool` task, same convention as `start_layer_open` below); this method is the
    /// pure "what happens once bytes are in hand" half.
    pub fn install_store(&mut self, store: ZarrStore) {
        let store = Arc::new(store);
        let manager = match store.pyramid() {
            PyramidKind::Tiled { levels, tile_size, .. } => DataManagerKind::Tiled(TileDataManager::new(
                levels.clone(),
                *tile_size,
                self.options.min_render_zoom,
                self.options.max_cached_tiles,
            )),
            PyramidKind::Untiled { .. } => DataManagerKind::Untiled { regions: Vec::new() },
        };
        self.chunk_fetcher = Some(ChunkFetcher::new(Arc::clone(&store)));
        self.store = Some(store);
        self.manager = Some(manager);
        self.inert = false;
        self.notify_loading(LoadingState {
            loading: false,
            metadata: false,
            chunks: false,
        });
    }

    /// Metadata or shader failures mark the layer inert; no draws occur until the layer is
    /// recreated (§7 "Metadata and shader errors fail the layer initialization").
    pub fn mark_inert(&mut self, error: &LayerError) {
        warn!(layer = %self.options.id, %error, "layer marked inert");
        self.inert = true;
        self.notify_loading(LoadingState {
            loading: false,
            metadata: true,
            chunks: false,
        });
    }

    pub fn set_opacity(&mut self, opacity: f32) {
        self.options.opacity = opacity.clamp(0.0, 1.0);
    }

    pub fn set_clim(&mut self, clim: (f32, f32)) {
        self.options.clim = clim;
    }

    pub fn set_colormap(&mut self, colormap: Vec<ColorStop>) {
        self.options.colormap = colormap;
    }

    /// §4.I `set_uniforms`: a no-op without a custom fragment, since there are no declared
    /// uniforms to update otherwise.
    pub fn set_uniforms(&mut self, uniforms: HashMap<String, UniformEffect>) {
        if self.options.custom_frag.is_none() {
            return;
        }
        self.options.uniforms = uniforms;
    }

    /// Rapid `set_selector` calls coalesce into one pending target (§4.I "Throttling", §9
    /// "Async coalescing"). `throttle_ms == 0` applies immediately.
    pub fn set_selector(&mut self, selector: Selector) {
        if self.options.throttle_ms == 0 {
            self.apply_selector(selector);
            return;
        }
        self.pending_selector = Some((selector, std::time::Instant::now()));
    }

    fn apply_selector(&mut self, selector: Selector) {
        self.options.selector = selector.clone();
        if let Some(DataManagerKind::Tiled(manager)) = &mut self.manager {
            let resolved = match &self.store {
                Some(store) => ResolvedSelector::resolve(store, &selector),
                None => ResolvedSelector::from_indices(&selector),
            };
            manager.set_selector(selector, resolved);
        }
    }

    /// Flush a coalesced pending selector once `throttle_ms` has elapsed since it was set
    /// (§4.I "Throttling", §5 "Async coalescing": newer selectors overwrite the pending
    /// state, only the final one is applied).
    pub fn tick_throttle(&mut self) {
        let Some((_, set_at)) = &self.pending_selector else {
            return;
        };
        if set_at.elapsed().as_millis() as u64 >= self.options.throttle_ms {
            let (selector, _) = self.pending_selector.take().unwrap();
            self.apply_selector(selector);
        }
    }

    /// Per-frame working-set refresh (§4.I `prerender`): ask the active data manager for the
    /// tiles the current viewport needs and report any chunks that must be fetched.
    pub fn prerender(&mut self, viewport: Viewport) -> Vec<(crate::mapmath::Tile, crate::tiles::ChunkFetchKey)> {
        if self.inert {
            return Vec::new();
        }
        let fetches = match &mut self.manager {
            Some(DataManagerKind::Tiled(manager)) => {
                let result = manager.acquire(viewport);
                let any_loading = !result.pending.is_empty();
                self.notify_loading(LoadingState {
                    loading: any_loading,
                    metadata: false,
                    chunks: any_loading,
                });
                result.fetches_needed
            }
            _ => Vec::new(),
        };
        if let Some(fetcher) = &self.chunk_fetcher {
            for (_, key) in &fetches {
                fetcher.request(key.clone());
            }
        }
        fetches
    }

    /// Drain any chunk fetches that completed since the last frame (§5 suspension points).
    pub fn apply_pending_fetches(&mut self) {
        if let (Some(fetcher), Some(DataManagerKind::Tiled(manager))) = (&self.chunk_fetcher, &mut self.manager) {
            apply_chunk_fetch_results(fetcher, manager);
        }
    }

    /// §4.I `render`, the flat-map dispatch: upload this frame's ready tile slices into the
    /// GPU cache, fall back to a loaded ancestor/children for tiles still waiting on their own
    /// data, and emit the draw calls for the host to spawn or update entities with (§4.G, the
    /// same shared draw path `globe::render_to_tile` goes through for the 3D host).
    pub fn render(
        &mut self,
        ready: &[(Tile, TileSlice)],
        pending: &[Tile],
        dataset_max_zoom: u8,
        view_proj: [[f32; 4]; 4],
        reprojection: ReprojectionUniforms,
        world_offsets: &[f64],
        images: &mut Assets<Image>,
        meshes: &mut Assets<Mesh>,
    ) -> Vec<TileDrawCall> {
        if self.inert {
            return Vec::new();
        }

        for (tile, slice) in ready {
            let width = slice.tile_size;
            let height = slice.tile_size;
            self.gpu_cache.upsert(*tile, meshes);
            if slice.band_names.len() <= 1 {
                if let Some(band) = slice.bands.first() {
                    self.gpu_cache.install_texture(*tile, band, width, height, images);
                }
            } else {
                for (name, band) in slice.band_names.iter().zip(slice.bands.iter()) {
                    self.gpu_cache.ensure_band_texture(*tile, name, band, width, height, images);
                }
            }
        }
        self.gpu_cache.evict_excess(images, meshes);

        let mut calls = Vec::new();
        for (tile, _) in ready {
            if let Some(entry) = self.gpu_cache.get(tile) {
                let region = RenderableRegion {
                    bounds: tile_region_bounds(*tile),
                    ..RenderableRegion::default()
                };
                calls.extend(render::draw_region(&region, entry, view_proj, reprojection, 0.0, world_offsets));
            }
        }

        for tile in pending {
            match render::pick_fallback(*tile, &self.gpu_cache, dataset_max_zoom) {
                render::Fallback::Parent { tile: ancestor, tex_scale, tex_offset } => {
                    if let Some(entry) = self.gpu_cache.get(&ancestor) {
                        let region = RenderableRegion {
                            bounds: tile_region_bounds(*tile),
                            tex_scale,
                            tex_offset,
                            use_indexed_mesh: false,
                        };
                        calls.extend(render::draw_region(&region, entry, view_proj, reprojection, 0.0, world_offsets));
                    }
                }
                render::Fallback::Children(children) => {
                    for (child, region) in &children {
                        if let Some(entry) = self.gpu_cache.get(child) {
                            calls.extend(render::draw_region(region, entry, view_proj, reprojection, 0.0, world_offsets));
                        }
                    }
                }
                render::Fallback::None => {}
            }
        }

        calls
    }

    /// `renderWorldCopies` policy (§4.I): `false` on globe, host's prior value restored on
    /// flat maps or removal.
    pub fn on_projection_changed(&mut self, mode: RenderingMode, host_render_world_copies: bool) -> Option<bool> {
        match mode {
            RenderingMode::Globe => {
                if self.restore_render_world_copies.is_none() {
                    self.restore_render_world_copies = Some(host_render_world_copies);
                }
                self.gpu_cache.mark_geometry_dirty();
                Some(false)
            }
            RenderingMode::Flat => {
                self.gpu_cache.mark_geometry_dirty();
                self.restore_render_world_copies.take()
            }
        }
    }

    pub fn gpu_cache(&self) -> &GpuTileCache {
        &self.gpu_cache
    }

    pub fn gpu_cache_mut(&mut self) -> &mut GpuTileCache {
        &mut self.gpu_cache
    }

    pub fn program_cache_mut(&mut self) -> &mut ProgramCache {
        &mut self.program_cache
    }

    pub fn removed_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.removed)
    }

    /// Dispose GPU resources and mark in-flight async completions as cancellable
    /// (§4.I `on_remove`, §5 "Cancellation").
    pub fn on_remove(&mut self, images: &mut Assets<Image>, meshes: &mut Assets<Mesh>) {
        self.removed.store(true, Ordering::SeqCst);
        self.gpu_cache.clear(images, meshes);
        self.program_cache.remove_all();
    }

    /// `set_variable` (§4.I): disposes the current data manager before constructing the new
    /// one, matching §5 "Cancellation" ordering.
    pub fn begin_set_variable(&mut self, variable: String) {
        self.options.variable = variable;
        self.manager = None;
        self.store = None;
        self.chunk_fetcher = None;
        self.notify_loading(LoadingState {
            loading: true,
            metadata: true,
            chunks: false,
        });
    }
}

/// One pending async store-open task's result, drained by [`apply_layer_open_results`]
/// (mirrors `tile_fetcher.rs`'s request/drain convention, generalized from tile bytes to a
/// fully-opened `ZarrStore`).
pub struct LayerOpenChannel {
    sender: mpsc::Sender<(String, Result<ZarrStore, ZarrError>)>,
    receiver: Arc<Mutex<mpsc::Receiver<(String, Result<ZarrStore, ZarrError>)>>>,
}

impl Default for LayerOpenChannel {
    fn default() -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
        }
    }
}

impl LayerOpenChannel {
    pub fn drain(&self) -> Vec<(String, Result<ZarrStore, ZarrError>)> {
        let receiver = self.receiver.lock().unwrap();
        let mut out = Vec::new();
        while let Ok(item) = receiver.try_recv() {
            out.push(item);
        }
        out
    }
}

/// Spawn the async metadata-open task for `layer_id` (§5 "Suspension points: metadata
/// discovery"). Shared `metadata_cache`/`chunk_cache` let multiple layers on the same root
/// avoid re-probing v2/v3 (§4.B).
pub fn start_layer_open(
    layer_id: String,
    open_options: OpenOptions,
    metadata_cache: Arc<MetadataCache>,
    chunk_cache: Arc<ChunkCache>,
    channel: &LayerOpenChannel,
) {
    let sender = channel.sender.clone();
    IoTaskPool::get()
        .spawn(async move {
            let result = ZarrStore::open(open_options, &metadata_cache, chunk_cache);
            let _ = sender.send((layer_id, result));
        })
        .detach();
}

/// Install completed store-opens, or mark the corresponding layer inert on failure (§7
/// "Metadata ... errors fail the layer initialization").
pub fn apply_layer_open_results(channel: &LayerOpenChannel, layers: &mut HashMap<String, ZarrLayer>) {
    for (id, result) in channel.drain() {
        let Some(layer) = layers.get_mut(&id) else { continue };
        match result {
            Ok(store) => {
                info!(layer = %id, "zarr metadata opened");
                layer.install_store(store);
            }
            Err(err) => {
                layer.mark_inert(&LayerError::Zarr(err));
            }
        }
    }
}

/// A Bevy app builds against one or more of these; each registers its own resources and
/// systems the way `MapPlugin` registers the base host's (§4.I, §2 control flow).
pub struct ZarrLayerPlugin {
    pub options: ZarrLayerOptions,
}

impl Plugin for ZarrLayerPlugin {
    fn build(&self, app: &mut App) {
        if let Err(err) = self.options.validate() {
            error!(layer = %self.options.id, %err, "zarr layer configuration invalid, not installed");
            return;
        }

        app.init_resource::<LayerOpenChannel>()
            .init_resource::<ZarrLayerRegistry>();

        let options = self.options.clone();
        let layer_id = options.id.clone();
        app.add_systems(Startup, move |mut registry: ResMut<ZarrLayerRegistry>| {
            registry.0.insert(layer_id.clone(), ZarrLayer::new(options.clone()));
        });
    }
}

/// All layers currently attached to the app, keyed by `id` (§4.I supports more than one
/// overlay at once the way a slippy-map host supports more than one tile layer).
#[derive(Resource, Default)]
pub struct ZarrLayerRegistry(pub HashMap<String, ZarrLayer>);

/// Translate a generic geographic viewport + zoom into [`Viewport`] (§4.C step 1 input); kept
/// free of any particular camera type so non-Bevy hosts, or a globe camera, can supply it too.
pub fn viewport_from_bounds(zoom: f64, bounds: GeoBounds) -> Viewport {
    Viewport { zoom, bounds }
}

/// A tile's own Mercator-normalized footprint (§4.G step 1 input for the tile it actually
/// belongs to, as opposed to `render::tile_sub_region_bounds`'s fallback-crop variant).
fn tile_region_bounds(tile: Tile) -> RegionBounds {
    let n = (1u32 << tile.z) as f64;
    RegionBounds::Mercator {
        x0: tile.x as f64 / n,
        y0: tile.y as f64 / n,
        x1: (tile.x + 1) as f64 / n,
        y1: (tile.y + 1) as f64 / n,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_options() -> ZarrLayerOptions {
        ZarrLayerOptions {
            id: "t".into(),
            source: "file:///tmp/ds.zarr".into(),
            variable: "T".into(),
            colormap: vec![ColorStop { r: 0.0, g: 0.0, b: 0.0 }],
            ..Default::default()
        }
    }

    #[test]
    fn validate_requires_source_variable_and_colormap() {
        let mut opts = base_options();
        opts.source.clear();
        assert!(matches!(opts.validate(), Err(ConfigError::MissingOption("source"))));

        let mut opts = base_options();
        opts.variable.clear();
        assert!(matches!(opts.validate(), Err(ConfigError::MissingOption("variable"))));

        let mut opts = base_options();
        opts.colormap.clear();
        assert!(matches!(opts.validate(), Err(ConfigError::EmptyColormap)));
    }

    #[test]
    fn validate_requires_proj4_for_arbitrary_crs() {
        let mut opts = base_options();
        opts.crs = Some(Crs::Proj4("+proj=stere".into()));
        assert!(matches!(opts.validate(), Err(ConfigError::CrsWithoutProj4 { .. })));
        opts.proj4 = Some("+proj=stere".into());
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn set_uniforms_is_a_noop_without_custom_frag() {
        let mut layer = ZarrLayer::new(base_options());
        let mut uniforms = HashMap::new();
        uniforms.insert("u_x".to_string(), 2.0);
        layer.set_uniforms(uniforms.clone());
        assert!(layer.options.uniforms.is_empty());

        layer.options.custom_frag = Some("out_color = vec4<f32>(1.0);".into());
        layer.set_uniforms(uniforms.clone());
        assert_eq!(layer.options.uniforms, uniforms);
    }

    #[test]
    fn zero_throttle_applies_selector_immediately() {
        let mut layer = ZarrLayer::new(base_options());
        let mut selector = Selector::new();
        selector.set("time", crate::selector::SelectorValue::Index(1));
        layer.set_selector(selector.clone());
        assert_eq!(layer.options.selector, selector);
        assert!(layer.pending_selector.is_none());
    }

    #[test]
    fn throttled_selector_coalesces_to_latest() {
        let mut opts = base_options();
        opts.throttle_ms = 50;
        let mut layer = ZarrLayer::new(opts);

        let mut first = Selector::new();
        first.set("time", crate::selector::SelectorValue::Index(1));
        layer.set_selector(first);

        let mut second = Selector::new();
        second.set("time", crate::selector::SelectorValue::Index(2));
        layer.set_selector(second.clone());

        // not yet elapsed: still pending, live selector unchanged
        layer.tick_throttle();
        assert_ne!(layer.options.selector, second);

        layer.pending_selector = Some((second.clone(), std::time::Instant::now() - std::time::Duration::from_millis(100)));
        layer.tick_throttle();
        assert_eq!(layer.options.selector, second);
    }

    #[test]
    fn globe_projection_disables_then_restores_render_world_copies() {
        let mut layer = ZarrLayer::new(base_options());
        assert_eq!(layer.on_projection_changed(RenderingMode::Globe, true), Some(false));
        assert_eq!(layer.on_projection_changed(RenderingMode::Flat, true), Some(true));
    }
}
