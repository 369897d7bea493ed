//! Globe-tile adapter (§4.H): the host's per-tile render callback for a 3D globe projection,
//! reusing `render::draw_region` with a tile-local transform. Gated behind the `globe`
//! feature since it needs Bevy's PBR/3D render pipeline, which the flat-map path does not.
//!
//! The host's actual globe camera and ECEF projection matrices are an external collaborator
//! per §1; this module only defines the narrow [`GlobeHost`] seam a concrete 3D host wires in,
//! plus the overlap/fallback math that doesn't depend on which host implements it.

use std::collections::HashMap;

use crate::mapmath::{GeoBounds, Tile};
use crate::render::{Fallback, RenderableRegion, ReprojectionUniforms, TileDrawCall, draw_region, pick_fallback};
use crate::untiled::RegionRenderData;
use crate::gpu_cache::GpuTileCache;

/// The narrow interface to the host's globe camera (§9 "dynamic dispatch on mode", §1 "host
/// map library's own camera/projection code" stays external).
pub trait GlobeHost {
    /// A 4x4 matrix mapping this host tile's Mercator footprint to clip space.
    fn tile_matrix(&self, tile: Tile) -> [[f32; 4]; 4];
    /// `0.0` fully flat, `1.0` fully globe; blended into the Mapbox-globe vertex stage
    /// (§4.F `ProjectionMode::MapboxGlobe`).
    fn globe_transition(&self) -> f32;
}

/// Per-region cached "linear texture coordinates from vertices" buffer, weak-keyed by region
/// identity so it never keeps a disposed region alive (§4.H, §9 "weak back-references").
/// Modeled here as an ordinary map cleared explicitly on region disposal, since Rust has no
/// ambient GC to hook a true weak-map into — the owning `layer::ZarrLayer` calls
/// [`GlobeTileTexcoordCache::forget`] from its region-disposal path.
#[derive(Default)]
pub struct GlobeTileTexcoordCache {
    buffers: HashMap<usize, Vec<[f32; 2]>>,
}

impl GlobeTileTexcoordCache {
    pub fn get_or_compute(&mut self, region_id: usize, vertices: &[(f64, f64)]) -> &[[f32; 2]] {
        self.buffers
            .entry(region_id)
            .or_insert_with(|| vertices.iter().map(|&(lon, lat)| [lon as f32, lat as f32]).collect())
    }

    pub fn forget(&mut self, region_id: usize) {
        self.buffers.remove(&region_id);
    }
}

/// One untiled region, filtered to those overlapping a host tile (§4.H step 3).
pub fn regions_overlapping_tile(
    tile_bounds: GeoBounds,
    regions: &[(usize, RegionRenderData)],
) -> Vec<usize> {
    regions
        .iter()
        .filter(|(_, region)| {
            let bounds = region.wgs84_bounds.unwrap_or(region.mercator_bounds);
            let (west, south, east, north) = bounds;
            !(east < tile_bounds.west || west > tile_bounds.east || north < tile_bounds.south || south > tile_bounds.north)
        })
        .map(|(id, _)| *id)
        .collect()
}

/// EPSG:4326 tiled overlap (§4.H step 5): derive `tex_scale_x`/`tex_offset_x` from how much
/// of the Zarr tile's longitude span the host tile covers; `tex_scale_y=1, tex_offset_y=0`
/// since the fragment shader does the latitude reprojection via `u_reproject`.
pub fn longitude_overlap_tex_transform(zarr_tile: Tile, host_bounds: GeoBounds) -> ((f32, f32), (f32, f32)) {
    let n = (1u32 << zarr_tile.z) as f64;
    let tile_west = zarr_tile.x as f64 / n * 360.0 - 180.0;
    let tile_east = (zarr_tile.x + 1) as f64 / n * 360.0 - 180.0;
    let tile_span = (tile_east - tile_west).max(1e-12);

    let overlap_west = host_bounds.west.max(tile_west);
    let overlap_east = host_bounds.east.min(tile_east);
    let scale_x = ((overlap_east - overlap_west) / tile_span).max(0.0) as f32;
    let offset_x = ((overlap_west - tile_west) / tile_span) as f32;

    ((scale_x, 1.0), (offset_x, 0.0))
}

/// Render one host tile: wire the host's per-tile clip matrix and globe/flat blend into the
/// shared [`draw_region`] path (§4.H "apply the tile-local matrix and globe uniform bundle").
/// `host_bounds`, when the host dataset is EPSG:4326-tiled, crops the texture to the longitude
/// span this host tile actually covers (§4.H step 5); a Mercator-tiled host passes `None` and
/// draws the matching tile at full coverage.
///
/// Returns the draw calls to issue plus `true` if the tile still needs data and the host should
/// re-invoke later (§4.H "Return value", treated as an idempotent hint per §9's Open Question,
/// never as a strict contract).
pub fn render_to_tile<H: GlobeHost>(
    host: &H,
    tile: Tile,
    cache: &GpuTileCache,
    dataset_max_zoom: u8,
    host_bounds: Option<GeoBounds>,
) -> (Vec<TileDrawCall>, bool) {
    let matrix = host.tile_matrix(tile);
    let transition = host.globe_transition();
    let (tex_scale, tex_offset) = host_bounds
        .map(|bounds| longitude_overlap_tex_transform(tile, bounds))
        .unwrap_or(((1.0, 1.0), (0.0, 0.0)));

    if let Some(entry) = cache.get(&tile) {
        let region = RenderableRegion {
            tex_scale,
            tex_offset,
            ..RenderableRegion::default()
        };
        let calls = draw_region(&region, entry, matrix, ReprojectionUniforms::DISABLED, transition, &[0.0]);
        return (calls, false);
    }

    match pick_fallback(tile, cache, dataset_max_zoom) {
        Fallback::Parent {
            tile: ancestor,
            tex_scale: fb_scale,
            tex_offset: fb_offset,
        } => {
            let Some(entry) = cache.get(&ancestor) else {
                return (Vec::new(), true);
            };
            let region = RenderableRegion {
                tex_scale: fb_scale,
                tex_offset: fb_offset,
                ..RenderableRegion::default()
            };
            let calls = draw_region(&region, entry, matrix, ReprojectionUniforms::DISABLED, transition, &[0.0]);
            (calls, true)
        }
        Fallback::Children(children) => {
            let calls = children
                .iter()
                .filter_map(|(child, region)| cache.get(child).map(|entry| (region, entry)))
                .flat_map(|(region, entry)| draw_region(region, entry, matrix, ReprojectionUniforms::DISABLED, transition, &[0.0]))
                .collect();
            (calls, true)
        }
        Fallback::None => (Vec::new(), true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlap_filters_regions_outside_tile() {
        let tile_bounds = GeoBounds::new(-90.0, 0.0, 0.0, 45.0);
        let inside = RegionRenderData {
            mercator_bounds: (0.0, 0.0, 0.0, 0.0),
            wgs84_bounds: Some((-80.0, 5.0, -70.0, 20.0)),
            width: 1,
            height: 1,
            values: vec![0.0],
            use_indexed_mesh: false,
            vertices: vec![],
            indices: vec![],
        };
        let outside = RegionRenderData {
            wgs84_bounds: Some((100.0, 50.0, 110.0, 60.0)),
            ..inside.clone()
        };
        let regions = vec![(0usize, inside), (1usize, outside)];
        let ids = regions_overlapping_tile(tile_bounds, &regions);
        assert_eq!(ids, vec![0]);
    }

    #[test]
    fn longitude_overlap_full_coverage_is_identity() {
        let tile = Tile::new(2, 1, 1); // covers lon [-90, 0]
        let host_bounds = GeoBounds::new(-90.0, -45.0, 0.0, 0.0);
        let (scale, offset) = longitude_overlap_tex_transform(tile, host_bounds);
        assert!((scale.0 - 1.0).abs() < 1e-9);
        assert!(offset.0.abs() < 1e-9);
    }

    #[test]
    fn texcoord_cache_forgets_on_disposal() {
        let mut cache = GlobeTileTexcoordCache::default();
        cache.get_or_compute(1, &[(1.0, 2.0)]);
        cache.forget(1);
        assert!(cache.buffers.get(&1).is_none());
    }
}
