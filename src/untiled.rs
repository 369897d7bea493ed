//! Untiled data manager (§4.D): single/multi-region loading for non-pyramid datasets, CPU
//! Mercator resampling for EPSG:4326/3857 sources, and an adaptive triangle mesh for
//! arbitrary-CRS sources reprojected through `proj`.

use crate::error::UntiledError;
use crate::mapmath::MERCATOR_LAT_LIMIT;
use crate::zarr::metadata::Crs;

/// One loaded region in source space, ready to resample or mesh (§4.D).
#[derive(Debug, Clone)]
pub struct SourceRegion {
    /// `[west, south, east, north]` in source-CRS edge coordinates.
    pub bounds: (f64, f64, f64, f64),
    pub width: u32,
    pub height: u32,
    pub values: Vec<f32>,
    pub lat_is_ascending: bool,
}

/// Output of the untiled manager: one or more renderable regions (§3 "Region render data").
#[derive(Debug, Clone)]
pub struct RegionRenderData {
    pub mercator_bounds: (f64, f64, f64, f64),
    pub wgs84_bounds: Option<(f64, f64, f64, f64)>,
    pub width: u32,
    pub height: u32,
    pub values: Vec<f32>,
    pub use_indexed_mesh: bool,
    pub vertices: Vec<MeshVertex>,
    pub indices: Vec<u32>,
}

/// One adaptive-mesh vertex: its source-space position (for sampling) and WGS84 position
/// (for the vertex shader's Mercator projection), §4.D(ii).
#[derive(Debug, Clone, Copy)]
pub struct MeshVertex {
    pub source_xy: (f64, f64),
    pub lon: f64,
    pub lat: f64,
}

pub const DEFAULT_MESH_MAX_ERROR: f64 = 2.0;
pub const MIN_SUBDIVISIONS: u32 = 4;
pub const MAX_SUBDIVISIONS: u32 = 64;

/// Mode (i): nearest-neighbor resample an EPSG:4326 row-major raster to Web Mercator.
/// Edge-aligned sampling: pixel centers at `(i + 0.5) / n`; antimeridian-crossing bounds
/// (`west > east`) are shifted by 360 deg before sampling; rows outside
/// `+/- MERCATOR_LAT_LIMIT` are filled with `NaN` (§4.D(i)).
pub fn resample_equirect_to_mercator(
    region: &SourceRegion,
    out_width: u32,
    out_height: u32,
) -> RegionRenderData {
    use crate::mapmath::{lat_to_mercator_norm, mercator_norm_to_lat, mercator_norm_to_lon};

    let (mut west, south, mut east, north) = region.bounds;
    if west > east {
        east += 360.0;
    }

    let y0 = lat_to_mercator_norm(north);
    let y1 = lat_to_mercator_norm(south);
    let x0 = (west + 180.0) / 360.0;
    let x1 = (east + 180.0) / 360.0;

    let mut out = vec![f32::NAN; (out_width * out_height) as usize];
    for oy in 0..out_height {
        let v = y0 + (y1 - y0) * ((oy as f64 + 0.5) / out_height as f64);
        let lat = mercator_norm_to_lat(v);
        if lat.abs() > MERCATOR_LAT_LIMIT {
            continue;
        }
        let row_frac = (north - lat) / (north - south).max(1e-12);
        let src_row = (row_frac * region.height as f64).floor().clamp(0.0, (region.height - 1) as f64) as u32;
        let src_row = if region.lat_is_ascending {
            region.height - 1 - src_row
        } else {
            src_row
        };

        for ox in 0..out_width {
            let u = x0 + (x1 - x0) * ((ox as f64 + 0.5) / out_width as f64);
            let mut lon = mercator_norm_to_lon(u.rem_euclid(1.0));
            if lon < west - 1e-9 {
                lon += 360.0;
            }
            let col_frac = (lon - west) / (east - west).max(1e-12);
            let src_col = (col_frac * region.width as f64).floor().clamp(0.0, (region.width - 1) as f64) as u32;
            let src_idx = (src_row * region.width + src_col) as usize;
            if let Some(&value) = region.values.get(src_idx) {
                out[(oy * out_width + ox) as usize] = value;
            }
        }
    }

    RegionRenderData {
        mercator_bounds: (x0.rem_euclid(1.0), y0.min(y1), x1.rem_euclid(1.0).max(x0.rem_euclid(1.0)), y0.max(y1)),
        wgs84_bounds: None,
        width: out_width,
        height: out_height,
        values: out,
        use_indexed_mesh: false,
        vertices: Vec::new(),
        indices: Vec::new(),
    }
}

/// Mode (ii): build an adaptive triangle mesh over a regular source-CRS grid, subdividing
/// where the proj-inverse reprojection error (measured in output pixels, approximated here
/// by midpoint-vs-linear-interpolation deviation in degrees) exceeds `max_error_deg` (§4.D(ii)).
pub fn build_adaptive_mesh(
    bounds: (f64, f64, f64, f64),
    inverse: &dyn Fn(f64, f64) -> Option<(f64, f64)>,
    max_error_deg: f64,
) -> Result<(Vec<MeshVertex>, Vec<u32>), UntiledError> {
    let (x_min, y_min, x_max, y_max) = bounds;
    let mut subdivisions = MIN_SUBDIVISIONS;

    while subdivisions < MAX_SUBDIVISIONS {
        let error = max_reprojection_error(x_min, y_min, x_max, y_max, subdivisions, inverse)?;
        if error <= max_error_deg {
            break;
        }
        subdivisions *= 2;
    }
    let n = subdivisions.min(MAX_SUBDIVISIONS).max(MIN_SUBDIVISIONS);

    let mut vertices = Vec::with_capacity(((n + 1) * (n + 1)) as usize);
    for j in 0..=n {
        for i in 0..=n {
            let x = x_min + (x_max - x_min) * (i as f64 / n as f64);
            let y = y_min + (y_max - y_min) * (j as f64 / n as f64);
            let (lon, lat) = inverse(x, y).ok_or_else(|| {
                UntiledError::Proj(format!("inverse projection undefined at ({x}, {y})"))
            })?;
            vertices.push(MeshVertex {
                source_xy: (x, y),
                lon,
                lat,
            });
        }
    }

    let mut indices = Vec::with_capacity((n * n * 6) as usize);
    let stride = n + 1;
    for j in 0..n {
        for i in 0..n {
            let tl = j * stride + i;
            let tr = tl + 1;
            let bl = tl + stride;
            let br = bl + 1;
            indices.extend_from_slice(&[tl, bl, tr, tr, bl, br]);
        }
    }

    Ok((vertices, indices))
}

fn max_reprojection_error(
    x_min: f64,
    y_min: f64,
    x_max: f64,
    y_max: f64,
    n: u32,
    inverse: &dyn Fn(f64, f64) -> Option<(f64, f64)>,
) -> Result<f64, UntiledError> {
    let mut worst: f64 = 0.0;
    for j in 0..n {
        for i in 0..n {
            let cell = |fi: f64, fj: f64| -> Result<(f64, f64), UntiledError> {
                let x = x_min + (x_max - x_min) * fi;
                let y = y_min + (y_max - y_min) * fj;
                inverse(x, y).ok_or_else(|| UntiledError::Proj("inverse undefined".into()))
            };
            let step_i = 1.0 / n as f64;
            let step_j = 1.0 / n as f64;
            let fi0 = i as f64 * step_i;
            let fj0 = j as f64 * step_j;
            let a = cell(fi0, fj0)?;
            let b = cell(fi0 + step_i, fj0)?;
            let c = cell(fi0, fj0 + step_j)?;
            let d = cell(fi0 + step_i, fj0 + step_j)?;
            let mid_linear = ((a.0 + d.0) / 2.0, (a.1 + d.1) / 2.0);
            let mid_actual = cell(fi0 + step_i / 2.0, fj0 + step_j / 2.0)?;
            let err = ((mid_actual.0 - mid_linear.0).powi(2) + (mid_actual.1 - mid_linear.1).powi(2)).sqrt();
            worst = worst.max(err);
            let _ = (b, c);
        }
    }
    Ok(worst)
}

/// Whether `crs` requires a `proj4` string to build an arbitrary-CRS transform (§7
/// ConfigurationError: "crs without matching proj4").
pub fn requires_proj4(crs: &Crs) -> bool {
    !matches!(crs, Crs::Epsg4326 | Crs::Epsg3857)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resample_fills_poles_with_nan() {
        let region = SourceRegion {
            bounds: (-180.0, -90.0, 180.0, 90.0),
            width: 4,
            height: 4,
            values: vec![1.0; 16],
            lat_is_ascending: false,
        };
        let out = resample_equirect_to_mercator(&region, 8, 8);
        // top row maps to a latitude beyond the mercator limit -> NaN
        assert!(out.values[0].is_nan());
    }

    #[test]
    fn resample_handles_antimeridian_crossing_bounds() {
        let region = SourceRegion {
            bounds: (170.0, -10.0, -170.0, 10.0),
            width: 4,
            height: 2,
            values: vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0],
            lat_is_ascending: false,
        };
        let out = resample_equirect_to_mercator(&region, 4, 2);
        assert!(out.values.iter().any(|v| !v.is_nan()));
    }

    #[test]
    fn adaptive_mesh_respects_subdivision_bounds() {
        let identity = |x: f64, y: f64| Some((x, y));
        let (vertices, indices) =
            build_adaptive_mesh((-10.0, -10.0, 10.0, 10.0), &identity, DEFAULT_MESH_MAX_ERROR).unwrap();
        let side = (vertices.len() as f64).sqrt() as u32 - 1;
        assert!(side >= MIN_SUBDIVISIONS);
        assert_eq!(indices.len() as u32, side * side * 6);
    }

    #[test]
    fn requires_proj4_is_false_for_built_ins() {
        assert!(!requires_proj4(&Crs::Epsg4326));
        assert!(!requires_proj4(&Crs::Epsg3857));
        assert!(requires_proj4(&Crs::Proj4("+proj=stere".into())));
    }
}
