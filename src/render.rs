//! Render core (§4.G): the single per-region draw path both `tiles` (flat Mercator / globe
//! tiled) and `untiled` (flat Mercator / globe untiled) call through, plus the parent/child
//! tile fallback used while a target tile's own data is still loading.

use bevy::prelude::{Handle, Image, Mesh};
use bytemuck::{Pod, Zeroable};

use crate::gpu_cache::{GpuTileCache, TileGpuEntry};
use crate::mapmath::Tile;

/// Bounds a region is positioned by: WGS84 if the region carries them (untiled arbitrary-CRS
/// meshes, globe per-tile clip tests), Mercator-normalized otherwise (§4.G step 1).
#[derive(Debug, Clone, Copy)]
pub enum RegionBounds {
    Mercator { x0: f64, y0: f64, x1: f64, y1: f64 },
    Wgs84 { west: f64, south: f64, east: f64, north: f64 },
}

/// One thing `draw_region` can draw: a tile quad or an untiled region's mesh (§3 "Tile render
/// data" / "Region render data", unified at the draw boundary per §9's "collapse four render
/// dispatchers into one").
pub struct RenderableRegion {
    pub bounds: RegionBounds,
    pub use_indexed_mesh: bool,
    pub tex_scale: (f32, f32),
    pub tex_offset: (f32, f32),
}

impl Default for RenderableRegion {
    fn default() -> Self {
        Self {
            bounds: RegionBounds::Mercator {
                x0: 0.0,
                y0: 0.0,
                x1: 1.0,
                y1: 1.0,
            },
            use_indexed_mesh: false,
            tex_scale: (1.0, 1.0),
            tex_offset: (0.0, 0.0),
        }
    }
}

/// Common per-draw uniform block, laid out to match `shader::build_vertex_source`'s
/// `CommonUniforms` WGSL struct (§4.G step 1-3).
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CommonUniforms {
    pub view_proj: [[f32; 4]; 4],
    pub scale: [f32; 2],
    pub shift: [f32; 2],
    pub tex_scale: [f32; 2],
    pub tex_offset: [f32; 2],
    pub world_offset: f32,
    pub globe_transition: f32,
}

/// Fragment-side reprojection uniforms, gated by `u_reproject` (§4.G step 3, §4.F).
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ReprojectionUniforms {
    pub reproject: f32,
    pub lat_min: f32,
    pub lat_max: f32,
    pub lat_is_ascending: f32,
}

impl ReprojectionUniforms {
    pub const DISABLED: Self = Self {
        reproject: 0.0,
        lat_min: 0.0,
        lat_max: 0.0,
        lat_is_ascending: 0.0,
    };
}

/// `(scale, shift_x, shift_y)` mapping clip-space `[-1,1]^2` into this region's footprint
/// (§4.G step 1).
pub fn compute_scale_shift(bounds: &RegionBounds) -> ([f32; 2], [f32; 2]) {
    match *bounds {
        RegionBounds::Mercator { x0, y0, x1, y1 } => (
            [((x1 - x0) / 2.0) as f32, ((y1 - y0) / 2.0) as f32],
            [((x0 + x1) / 2.0) as f32, ((y0 + y1) / 2.0) as f32],
        ),
        RegionBounds::Wgs84 { west, south, east, north } => (
            [((east - west) / 2.0) as f32, ((north - south) / 2.0) as f32],
            [((west + east) / 2.0) as f32, ((south + north) / 2.0) as f32],
        ),
    }
}

/// Which fallback to draw for a tile whose own data hasn't loaded yet (§4.G "Parent/child
/// fallback"): an ancestor if one is cached, else the loaded children within
/// `dataset_max_zoom`, else nothing.
pub enum Fallback {
    Parent { tile: Tile, tex_scale: (f32, f32), tex_offset: (f32, f32) },
    Children(Vec<(Tile, RenderableRegion)>),
    None,
}

/// Walk ancestors of `target` looking for a loaded entry in `cache`; if found, compute the
/// `tex_scale`/`tex_offset` that crops the ancestor's texture to `target`'s footprint
/// (§4.G "(a) walk ancestors"). Otherwise collect loaded children within `dataset_max_zoom`
/// (§4.G "(b)"); otherwise `Fallback::None` (§4.G "(c)").
pub fn pick_fallback(target: Tile, cache: &GpuTileCache, dataset_max_zoom: u8) -> Fallback {
    for ancestor in target.ancestors() {
        if cache.get(&ancestor).is_some() {
            let delta = target.z - ancestor.z;
            let factor = 1u32 << delta;
            let local_x = target.x - ancestor.x * factor;
            let local_y = target.y - ancestor.y * factor;
            let scale = 1.0 / factor as f32;
            return Fallback::Parent {
                tile: ancestor,
                tex_scale: (scale, scale),
                tex_offset: (local_x as f32 * scale, local_y as f32 * scale),
            };
        }
    }

    let mut children = Vec::new();
    collect_loaded_children(target, cache, dataset_max_zoom, &mut children);
    if children.is_empty() {
        Fallback::None
    } else {
        Fallback::Children(children)
    }
}

fn collect_loaded_children(
    tile: Tile,
    cache: &GpuTileCache,
    dataset_max_zoom: u8,
    out: &mut Vec<(Tile, RenderableRegion)>,
) {
    if tile.z >= dataset_max_zoom {
        return;
    }
    for child in tile.children() {
        if cache.get(&child).is_some() {
            out.push((
                child,
                RenderableRegion {
                    bounds: tile_sub_region_bounds(tile, child),
                    use_indexed_mesh: false,
                    tex_scale: (1.0, 1.0),
                    tex_offset: (0.0, 0.0),
                },
            ));
        } else {
            collect_loaded_children(child, cache, dataset_max_zoom, out);
        }
    }
}

/// The Mercator-normalized footprint of `child` expressed as a sub-region of `parent`'s
/// bounds (used to draw a loaded child as part of the parent's still-missing area).
fn tile_sub_region_bounds(parent: Tile, child: Tile) -> RegionBounds {
    let n = (1u32 << child.z) as f64;
    let x0 = child.x as f64 / n;
    let x1 = (child.x + 1) as f64 / n;
    let y0 = child.y as f64 / n;
    let y1 = (child.y + 1) as f64 / n;
    let _ = parent;
    RegionBounds::Mercator { x0, y0, x1, y1 }
}

/// World copies to draw a region at, for map wrapping (§4.G step 6). A flat Mercator host
/// typically passes `[0.0]`; a host that renders wrapped copies passes one offset per copy.
pub fn world_offsets_for_wrap(wraps: i32) -> Vec<f64> {
    (-wraps..=wraps).map(|w| w as f64).collect()
}

/// One resolved draw: a mesh bound with its base/band textures and the uniform bundle the
/// fragment shader reads for one world-wrap offset (§4.G steps 4-6, "bind vertex/pixel/index
/// buffers; bind the single or per-band textures; set the offset uniform; issue the draw").
/// Bevy's render graph performs the literal GPU draw once a caller spawns or updates an entity
/// carrying these components — this is that bind-and-issue step expressed as data rather than
/// as a raw `drawArrays`/`drawElements` call.
#[derive(Clone)]
pub struct TileDrawCall {
    pub mesh: Handle<Mesh>,
    pub texture: Option<Handle<Image>>,
    pub band_textures: Vec<(String, Handle<Image>)>,
    pub uniforms: CommonUniforms,
    pub reprojection: ReprojectionUniforms,
}

/// §4.G steps 4-6, the core per-region draw: bind `entry`'s mesh and texture(s), compute the
/// scale/shift/tex uniforms from `region`, and emit one [`TileDrawCall`] per entry of
/// `world_offsets` (map-wrapping draws the same region at `x + world_offset` copies).
pub fn draw_region(
    region: &RenderableRegion,
    entry: &TileGpuEntry,
    view_proj: [[f32; 4]; 4],
    reprojection: ReprojectionUniforms,
    globe_transition: f32,
    world_offsets: &[f64],
) -> Vec<TileDrawCall> {
    let (scale, shift) = compute_scale_shift(&region.bounds);
    let band_textures: Vec<(String, Handle<Image>)> = entry
        .band_textures
        .iter()
        .map(|(name, handle)| (name.clone(), handle.clone()))
        .collect();

    world_offsets
        .iter()
        .map(|&world_offset| TileDrawCall {
            mesh: entry.mesh.clone(),
            texture: entry.texture.clone(),
            band_textures: band_textures.clone(),
            uniforms: CommonUniforms {
                view_proj,
                scale,
                shift,
                tex_scale: [region.tex_scale.0, region.tex_scale.1],
                tex_offset: [region.tex_offset.0, region.tex_offset.1],
                world_offset: world_offset as f32,
                globe_transition,
            },
            reprojection,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scale_shift_centers_mercator_region() {
        let (scale, shift) = compute_scale_shift(&RegionBounds::Mercator {
            x0: 0.25,
            y0: 0.25,
            x1: 0.75,
            y1: 0.75,
        });
        assert_eq!(scale, [0.25, 0.25]);
        assert_eq!(shift, [0.5, 0.5]);
    }

    #[test]
    fn fallback_is_none_when_cache_empty() {
        let cache = GpuTileCache::new(8);
        let fallback = pick_fallback(Tile::new(4, 3, 3), &cache, 10);
        assert!(matches!(fallback, Fallback::None));
    }

    #[test]
    fn fallback_prefers_nearest_loaded_ancestor() {
        let mut cache = GpuTileCache::new(8);
        let mut meshes = bevy::prelude::Assets::<bevy::prelude::Mesh>::default();
        let parent = Tile::new(2, 1, 1);
        cache.upsert(parent, &mut meshes);
        let target = Tile::new(4, 4, 4); // descendant of (2,1,1)
        match pick_fallback(target, &cache, 10) {
            Fallback::Parent { tile, .. } => assert_eq!(tile, parent),
            _ => panic!("expected a parent fallback"),
        }
    }

    #[test]
    fn world_offsets_include_zero_and_wraps() {
        let offsets = world_offsets_for_wrap(1);
        assert_eq!(offsets, vec![-1.0, 0.0, 1.0]);
    }

    #[test]
    fn draw_region_emits_one_call_per_world_offset() {
        let mut cache = GpuTileCache::new(4);
        let mut meshes = bevy::prelude::Assets::<bevy::prelude::Mesh>::default();
        let tile = Tile::new(3, 2, 2);
        cache.upsert(tile, &mut meshes);
        let entry = cache.get(&tile).unwrap();
        let region = RenderableRegion::default();
        let calls = draw_region(
            &region,
            entry,
            bevy::prelude::Mat4::IDENTITY.to_cols_array_2d(),
            ReprojectionUniforms::DISABLED,
            0.0,
            &world_offsets_for_wrap(1),
        );
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].uniforms.world_offset, -1.0);
        assert_eq!(calls[2].uniforms.world_offset, 1.0);
        assert_eq!(calls[1].mesh, entry.mesh);
    }
}
