//! GPU tile cache (§4.E): owns the `Handle<Image>`/`Handle<Mesh>` pairs the renderer binds
//! per visible tile, keyed by tile identity, LRU-evicted independently of the CPU-side
//! `tiles::TileDataManager` cache.
//!
//! Mirrors `tile_fetcher.rs`'s convention of handing `Assets<Image>` handles to entities
//! rather than holding raw `wgpu` resources directly — Bevy's asset server owns the GPU
//! objects, this cache owns which tile a handle belongs to and when it should be dropped.

use std::collections::HashMap;

use bevy::asset::RenderAssetUsages;
use bevy::prelude::*;
use bevy::render::mesh::{Indices, PrimitiveTopology};
use bevy::render::render_resource::{Extent3d, TextureDimension, TextureFormat};

use crate::mapmath::Tile;

/// GPU-side record for one tile: its base texture, any per-band textures (multi-band custom
/// fragment shaders, §4.F), and the mesh it's drawn with. `texture_uploaded`/
/// `band_textures_uploaded` gate re-upload: set on install, consumed on first bind (§5).
pub struct TileGpuEntry {
    pub texture: Option<Handle<Image>>,
    pub band_textures: HashMap<String, Handle<Image>>,
    pub mesh: Handle<Mesh>,
    pub texture_uploaded: bool,
    pub band_textures_uploaded: bool,
    pub geometry_dirty: bool,
    pub last_used: u64,
}

/// Owns GPU resources for visible tiles; evicting an entry removes its assets so GPU memory
/// is released immediately rather than waiting on Bevy's asset GC (§3 "Lifecycles": tile
/// render data destroyed on eviction).
#[derive(Resource, Default)]
pub struct GpuTileCache {
    entries: HashMap<Tile, TileGpuEntry>,
    max_entries: usize,
    clock: u64,
}

impl GpuTileCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            max_entries: max_entries.max(1),
            clock: 0,
        }
    }

    /// Return the entry for `key`, creating a flat quad mesh on first use. Touches recency.
    pub fn upsert(&mut self, key: Tile, meshes: &mut Assets<Mesh>) -> &mut TileGpuEntry {
        self.clock += 1;
        let clock = self.clock;
        let entry = self.entries.entry(key).or_insert_with(|| TileGpuEntry {
            texture: None,
            band_textures: HashMap::new(),
            mesh: meshes.add(flat_tile_quad()),
            texture_uploaded: false,
            band_textures_uploaded: false,
            geometry_dirty: false,
            last_used: clock,
        });
        entry.last_used = clock;
        entry
    }

    /// Install a fresh band sample buffer as a single-channel float texture, resetting the
    /// upload flag so the next draw re-binds it (§4.E policy).
    pub fn install_texture(&mut self, key: Tile, data: &[f32], width: u32, height: u32, images: &mut Assets<Image>) {
        if let Some(entry) = self.entries.get_mut(&key) {
            let image = single_channel_float_image(data, width, height);
            entry.texture = Some(images.add(image));
            entry.texture_uploaded = false;
        }
    }

    /// Allocate a per-band texture on first use of that band name (§4.E `ensureBandTexture`).
    pub fn ensure_band_texture(
        &mut self,
        key: Tile,
        band: &str,
        data: &[f32],
        width: u32,
        height: u32,
        images: &mut Assets<Image>,
    ) {
        if let Some(entry) = self.entries.get_mut(&key) {
            let image = single_channel_float_image(data, width, height);
            let handle = images.add(image);
            entry.band_textures.insert(band.to_string(), handle);
            entry.band_textures_uploaded = false;
        }
    }

    /// Force re-upload of vertex buffers on the next draw (projection change: globe needs a
    /// subdivided quad, flat Mercator uses one, §4.E `markGeometryDirty`).
    pub fn mark_geometry_dirty(&mut self) {
        for entry in self.entries.values_mut() {
            entry.geometry_dirty = true;
        }
    }

    /// Evict entries beyond `max_entries`, oldest-touched first, releasing their assets.
    pub fn evict_excess(&mut self, images: &mut Assets<Image>, meshes: &mut Assets<Mesh>) {
        while self.entries.len() > self.max_entries {
            let Some((&oldest, _)) = self.entries.iter().min_by_key(|(_, e)| e.last_used) else {
                break;
            };
            self.remove(oldest, images, meshes);
        }
    }

    fn remove(&mut self, key: Tile, images: &mut Assets<Image>, meshes: &mut Assets<Mesh>) {
        if let Some(entry) = self.entries.remove(&key) {
            if let Some(tex) = entry.texture {
                images.remove(&tex);
            }
            for (_, tex) in entry.band_textures {
                images.remove(&tex);
            }
            meshes.remove(&entry.mesh);
        }
    }

    /// Release every GPU resource this cache owns (§4.E `clear`, layer removal).
    pub fn clear(&mut self, images: &mut Assets<Image>, meshes: &mut Assets<Mesh>) {
        let keys: Vec<Tile> = self.entries.keys().copied().collect();
        for key in keys {
            self.remove(key, images, meshes);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &Tile) -> Option<&TileGpuEntry> {
        self.entries.get(key)
    }
}

/// A single flat `[-1,1]^2` quad; the globe adapter's per-tile transform is applied via a
/// separate uniform matrix rather than baking globe curvature into the mesh (§4.H).
fn flat_tile_quad() -> Mesh {
    let mut mesh = Mesh::new(PrimitiveTopology::TriangleList, RenderAssetUsages::default());
    let positions: Vec<[f32; 3]> = vec![
        [-1.0, -1.0, 0.0],
        [1.0, -1.0, 0.0],
        [1.0, 1.0, 0.0],
        [-1.0, 1.0, 0.0],
    ];
    let uvs: Vec<[f32; 2]> = vec![[0.0, 1.0], [1.0, 1.0], [1.0, 0.0], [0.0, 0.0]];
    mesh.insert_attribute(Mesh::ATTRIBUTE_POSITION, positions);
    mesh.insert_attribute(Mesh::ATTRIBUTE_UV_0, uvs);
    mesh.insert_indices(Indices::U32(vec![0, 1, 2, 0, 2, 3]));
    mesh
}

/// A single-channel `R32Float` texture carrying raw (pre-colormap) samples; `NaN` entries are
/// the normalized fill value and are `discard`ed in the fragment shader post-affine (§3).
fn single_channel_float_image(data: &[f32], width: u32, height: u32) -> Image {
    let bytes: Vec<u8> = data.iter().flat_map(|v| v.to_le_bytes()).collect();
    Image::new(
        Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
        TextureDimension::D2,
        bytes,
        TextureFormat::R32Float,
        RenderAssetUsages::default(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eviction_keeps_cache_within_bound() {
        let mut cache = GpuTileCache::new(2);
        let mut images = Assets::<Image>::default();
        let mut meshes = Assets::<Mesh>::default();
        for i in 0..5 {
            let tile = Tile::new(2, i, 0);
            cache.upsert(tile, &mut meshes);
            cache.evict_excess(&mut images, &mut meshes);
            assert!(cache.len() <= 2);
        }
    }

    #[test]
    fn clear_empties_cache() {
        let mut cache = GpuTileCache::new(8);
        let mut images = Assets::<Image>::default();
        let mut meshes = Assets::<Mesh>::default();
        cache.upsert(Tile::new(1, 0, 0), &mut meshes);
        cache.upsert(Tile::new(1, 1, 0), &mut meshes);
        cache.clear(&mut images, &mut meshes);
        assert!(cache.is_empty());
    }
}
