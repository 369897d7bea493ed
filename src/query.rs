//! Query engine (§4.J): point/polygon queries resolving to source-CRS pixels, with the same
//! scale/offset/fill semantics the renderer applies so reported values match what's on screen.

use std::collections::BTreeMap;

use geo::{BoundingRect, Contains, Geometry};

use crate::error::QueryError;
use crate::mapmath::{self, GeoBounds};
use crate::selector::Selector;
use crate::tiles::{ResolvedSelector, chunk_indices_for_tile, non_spatial_local_offset, row_major_strides};
use crate::zarr::cache::ChunkData;
use crate::zarr::metadata::{ArrayMetadata, PyramidKind, PyramidLevel};
use crate::zarr::store::ZarrStore;

/// A query result's values: flat when only spatial dims remain after the selector, nested by
/// non-spatial key (e.g. time index) otherwise (§4.J, §8 scenario 6).
#[derive(Debug, Clone)]
pub enum QueryValues {
    Flat(Vec<f64>),
    Nested(BTreeMap<String, Vec<f64>>),
}

#[derive(Debug, Clone)]
pub struct QueryResult {
    pub values: QueryValues,
    pub dimensions: Vec<String>,
    pub lat: Vec<f64>,
    pub lon: Vec<f64>,
}

/// One candidate sample: its lon/lat, raw value, and whether it's a non-spatial selector key
/// (used to build the nested-by-key shape for list selectors, §4.J / §8 scenario 6).
pub struct Sample {
    pub lon: f64,
    pub lat: f64,
    pub key: Option<String>,
    pub raw: f64,
}

/// Apply scale/offset and fill/NaN suppression the same way the renderer does (§4.J "Reported
/// values match what the renderer displays"), then group by `key` if any sample carries one.
pub fn build_query_result(
    samples: Vec<Sample>,
    fill_value: Option<f64>,
    scale_factor: f64,
    add_offset: f64,
    dimensions: Vec<String>,
) -> QueryResult {
    let mut lat = Vec::new();
    let mut lon = Vec::new();
    let mut flat = Vec::new();
    let mut nested: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    let mut any_keyed = false;

    for sample in samples {
        if fill_value.is_some_and(|f| sample.raw == f) || sample.raw.is_nan() {
            continue;
        }
        let value = sample.raw * scale_factor + add_offset;
        lat.push(sample.lat);
        lon.push(sample.lon);
        match &sample.key {
            Some(key) => {
                any_keyed = true;
                nested.entry(key.clone()).or_default().push(value);
            }
            None => flat.push(value),
        }
    }

    let values = if any_keyed {
        QueryValues::Nested(nested)
    } else {
        QueryValues::Flat(flat)
    };

    QueryResult {
        values,
        dimensions,
        lat,
        lon,
    }
}

/// `queryData(geometry, selectorOverride?)` (§4.J): resolve every tile/chunk overlapping
/// `geometry`'s bounding box at the dataset's native resolution, decode them, keep the pixels
/// actually inside `geometry`, and apply the same scale/offset/fill handling the renderer uses
/// so a query's numbers match what's drawn on screen.
pub fn query_data(
    store: &ZarrStore,
    geometry: &Geometry<f64>,
    selector_override: Option<&Selector>,
    live_selector: &Selector,
) -> Result<QueryResult, QueryError> {
    let limits = store.xy_limits();
    validate_bounds(geometry, (limits.x_min, limits.y_min, limits.x_max, limits.y_max))?;

    let selector = effective_selector(selector_override, live_selector);
    let resolved = ResolvedSelector::resolve(store, selector);

    match store.pyramid() {
        PyramidKind::Tiled { levels, tile_size, .. } => query_tiled(store, levels, *tile_size, geometry, selector, &resolved),
        PyramidKind::Untiled { metadata } => query_untiled(store, metadata, geometry, selector, &resolved),
    }
}

/// Tiled pyramid path (§4.J, §8 scenario 6): query at the pyramid's highest-resolution level,
/// reusing the same tile-to-chunk-index math `tiles::TileDataManager` uses to fetch render
/// data (§3 "Tile identity").
fn query_tiled(
    store: &ZarrStore,
    levels: &[PyramidLevel],
    tile_size: u32,
    geometry: &Geometry<f64>,
    selector: &Selector,
    resolved: &ResolvedSelector,
) -> Result<QueryResult, QueryError> {
    let level = levels.last().ok_or(QueryError::MissingSpatialDims)?;
    let meta = &level.metadata;
    require_spatial_dims(meta.lat_dim().is_some(), meta.lon_dim().is_some())?;

    let rect = geometry.bounding_rect().ok_or(QueryError::OutsideBounds)?;
    let bounds = GeoBounds::new(rect.min().x, rect.min().y, rect.max().x, rect.max().y);
    let z = (levels.len() - 1) as u8;
    let tiles = mapmath::tiles_at_zoom(z, bounds);

    let band_dim = selector.band_dim();
    let band_names = band_dim
        .map(|d| selector.band_names(d))
        .unwrap_or_else(|| vec!["value".to_string()]);

    let mut samples = Vec::new();
    for tile in tiles {
        let chunk_indices = chunk_indices_for_tile(tile, meta, selector, resolved);
        for (band_index, indices) in chunk_indices.iter().enumerate() {
            let Ok(chunk) = store.get_chunk(&level.path, indices) else {
                continue;
            };
            let key = (band_names.len() > 1).then(|| band_names[band_index].clone());
            collect_tile_samples(tile, tile_size, &chunk, meta, resolved, band_index, geometry, key.as_deref(), &mut samples);
        }
    }

    Ok(build_query_result(
        samples,
        meta.fill_value,
        meta.scale_factor,
        meta.add_offset,
        meta.dimension_names.clone(),
    ))
}

/// Extract in-geometry samples from one tile's one-band chunk, mapping each pixel's row/column
/// back to lon/lat through the tile's own Mercator footprint (§4.C tile identity, §4.G the
/// same `(x, y, z)` -> footprint math the renderer positions tiles with).
#[allow(clippy::too_many_arguments)]
fn collect_tile_samples(
    tile: mapmath::Tile,
    tile_size: u32,
    chunk: &ChunkData,
    meta: &ArrayMetadata,
    resolved: &ResolvedSelector,
    band_index: usize,
    geometry: &Geometry<f64>,
    key: Option<&str>,
    out: &mut Vec<Sample>,
) {
    let (Some(lat_dim), Some(lon_dim)) = (meta.lat_dim(), meta.lon_dim()) else {
        return;
    };
    let rows = chunk.shape.get(lat_dim).copied().unwrap_or(0).min(tile_size as u64) as u32;
    let cols = chunk.shape.get(lon_dim).copied().unwrap_or(0).min(tile_size as u64) as u32;
    let strides = row_major_strides(&chunk.shape);
    let n = (1u32 << tile.z) as f64;

    for row in 0..rows {
        let v = (tile.y as f64 + (row as f64 + 0.5) / rows.max(1) as f64) / n;
        let lat = mapmath::mercator_norm_to_lat(v);
        for col in 0..cols {
            let u = (tile.x as f64 + (col as f64 + 0.5) / cols.max(1) as f64) / n;
            let lon = mapmath::mercator_norm_to_lon(u);
            if !point_in_geometry(geometry, lon, lat) {
                continue;
            }
            let mut flat = 0usize;
            for (d, stride) in strides.iter().enumerate() {
                let coord = if d == lat_dim {
                    row as u64
                } else if d == lon_dim {
                    col as u64
                } else {
                    non_spatial_local_offset(meta, d, resolved, band_index)
                };
                flat += coord as usize * *stride as usize;
            }
            if let Some(&raw) = chunk.values.get(flat) {
                out.push(Sample {
                    lon,
                    lat,
                    key: key.map(str::to_string),
                    raw,
                });
            }
        }
    }
}

/// Untiled path (§4.J): no tile/zoom identity to resolve, just the array's own coordinate
/// arrays and chunk grid (§4.D "Untiled region", reused for the query side rather than the
/// render-mesh side).
fn query_untiled(
    store: &ZarrStore,
    meta: &ArrayMetadata,
    geometry: &Geometry<f64>,
    selector: &Selector,
    resolved: &ResolvedSelector,
) -> Result<QueryResult, QueryError> {
    let (Some(lat_dim), Some(lon_dim)) = (meta.lat_dim(), meta.lon_dim()) else {
        return Err(QueryError::MissingSpatialDims);
    };
    let lat_name = meta.dimension_names[lat_dim].clone();
    let lon_name = meta.dimension_names[lon_dim].clone();
    let lat_values = store.get_coordinate_array(&lat_name)?;
    let lon_values = store.get_coordinate_array(&lon_name)?;

    let band_dim = selector.band_dim();
    let band_count = band_dim.map(|d| selector.band_names(d).len()).unwrap_or(1).max(1);
    let band_names = band_dim
        .map(|d| selector.band_names(d))
        .unwrap_or_else(|| vec!["value".to_string()]);

    let chunk_counts: Vec<u64> = meta
        .shape
        .iter()
        .zip(meta.chunks.iter())
        .map(|(&shape, &chunk)| shape.div_ceil(chunk.max(1)))
        .collect();
    let lat_chunk_count = chunk_counts.get(lat_dim).copied().unwrap_or(1);
    let lon_chunk_count = chunk_counts.get(lon_dim).copied().unwrap_or(1);

    let mut samples = Vec::new();
    for band_index in 0..band_count {
        let key = (band_names.len() > 1).then(|| band_names[band_index].clone());
        for lat_chunk in 0..lat_chunk_count.max(1) {
            for lon_chunk in 0..lon_chunk_count.max(1) {
                let chunk_indices: Vec<u64> = meta
                    .dimension_names
                    .iter()
                    .enumerate()
                    .map(|(i, name)| {
                        if i == lat_dim {
                            lat_chunk
                        } else if i == lon_dim {
                            lon_chunk
                        } else {
                            let chunk_dim = meta.chunks.get(i).copied().unwrap_or(1).max(1);
                            resolved.index_for(name, band_index) / chunk_dim
                        }
                    })
                    .collect();
                let Ok(chunk) = store.get_chunk(store.variable(), &chunk_indices) else {
                    continue;
                };
                collect_untiled_samples(&chunk, meta, &chunk_indices, resolved, band_index, &lat_values, &lon_values, geometry, key.as_deref(), &mut samples);
            }
        }
    }

    Ok(build_query_result(
        samples,
        meta.fill_value,
        meta.scale_factor,
        meta.add_offset,
        meta.dimension_names.clone(),
    ))
}

#[allow(clippy::too_many_arguments)]
fn collect_untiled_samples(
    chunk: &ChunkData,
    meta: &ArrayMetadata,
    chunk_indices: &[u64],
    resolved: &ResolvedSelector,
    band_index: usize,
    lat_values: &[f64],
    lon_values: &[f64],
    geometry: &Geometry<f64>,
    key: Option<&str>,
    out: &mut Vec<Sample>,
) {
    let (Some(lat_dim), Some(lon_dim)) = (meta.lat_dim(), meta.lon_dim()) else {
        return;
    };
    let lat_chunk_dim = meta.chunks.get(lat_dim).copied().unwrap_or(1).max(1);
    let lon_chunk_dim = meta.chunks.get(lon_dim).copied().unwrap_or(1).max(1);
    let rows = chunk.shape.get(lat_dim).copied().unwrap_or(0);
    let cols = chunk.shape.get(lon_dim).copied().unwrap_or(0);
    let strides = row_major_strides(&chunk.shape);
    let lat_origin = chunk_indices.get(lat_dim).copied().unwrap_or(0) * lat_chunk_dim;
    let lon_origin = chunk_indices.get(lon_dim).copied().unwrap_or(0) * lon_chunk_dim;

    for row in 0..rows {
        let Some(&lat) = lat_values.get((lat_origin + row) as usize) else {
            continue;
        };
        for col in 0..cols {
            let Some(&lon) = lon_values.get((lon_origin + col) as usize) else {
                continue;
            };
            if !point_in_geometry(geometry, lon, lat) {
                continue;
            }
            let mut flat = 0usize;
            for (d, stride) in strides.iter().enumerate() {
                let coord = if d == lat_dim {
                    row
                } else if d == lon_dim {
                    col
                } else {
                    non_spatial_local_offset(meta, d, resolved, band_index)
                };
                flat += coord as usize * *stride as usize;
            }
            if let Some(&raw) = chunk.values.get(flat) {
                out.push(Sample {
                    lon,
                    lat,
                    key: key.map(str::to_string),
                    raw,
                });
            }
        }
    }
}

/// Whether `(lon, lat)` lies inside `geometry`, with an epsilon tolerance at region borders
/// (§9 "Floating-point tolerances at region borders") to avoid seams between adjacent
/// source chunks/regions.
pub fn point_in_geometry(geometry: &Geometry<f64>, lon: f64, lat: f64) -> bool {
    const EPS: f64 = 1e-9;
    let point = geo::Point::new(lon, lat);
    if geometry.contains(&point) {
        return true;
    }
    // retry on an epsilon-nudged point so border pixels aren't silently dropped.
    let nudged = geo::Point::new(lon + EPS, lat + EPS);
    geometry.contains(&nudged)
}

/// Validate `geometry` lies at least partially within `(x_min, y_min, x_max, y_max)` before
/// iterating pixels (§7 QueryError::OutsideBounds).
pub fn validate_bounds(geometry: &Geometry<f64>, bounds: (f64, f64, f64, f64)) -> Result<(), QueryError> {
    let (x_min, y_min, x_max, y_max) = bounds;
    let Some(rect) = geometry.bounding_rect() else {
        return Err(QueryError::OutsideBounds);
    };
    let (min, max) = (rect.min(), rect.max());
    if max.x < x_min || min.x > x_max || max.y < y_min || min.y > y_max {
        return Err(QueryError::OutsideBounds);
    }
    Ok(())
}

/// Confirm the dataset carries the spatial dimensions a query needs (§7
/// QueryError::MissingSpatialDims).
pub fn require_spatial_dims(has_lat: bool, has_lon: bool) -> Result<(), QueryError> {
    if has_lat && has_lon {
        Ok(())
    } else {
        Err(QueryError::MissingSpatialDims)
    }
}

/// Resolve a selector override for a query, falling back to the layer's live selector when
/// none is supplied (§4.J `queryData(geometry, selectorOverride?)`).
pub fn effective_selector<'a>(override_selector: Option<&'a Selector>, live: &'a Selector) -> &'a Selector {
    override_selector.unwrap_or(live)
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{Coord, LineString, Polygon};

    fn square() -> Geometry<f64> {
        let exterior = LineString::new(vec![
            Coord { x: -1.0, y: -1.0 },
            Coord { x: 1.0, y: -1.0 },
            Coord { x: 1.0, y: 1.0 },
            Coord { x: -1.0, y: 1.0 },
            Coord { x: -1.0, y: -1.0 },
        ]);
        Geometry::Polygon(Polygon::new(exterior, vec![]))
    }

    #[test]
    fn fill_and_nan_samples_are_suppressed() {
        let samples = vec![
            Sample { lon: 0.0, lat: 0.0, key: None, raw: -9999.0 },
            Sample { lon: 1.0, lat: 1.0, key: None, raw: f64::NAN },
            Sample { lon: 2.0, lat: 2.0, key: None, raw: 5.0 },
        ];
        let result = build_query_result(samples, Some(-9999.0), 1.0, 0.0, vec!["lat".into(), "lon".into()]);
        match result.values {
            QueryValues::Flat(values) => assert_eq!(values, vec![5.0]),
            _ => panic!("expected flat values"),
        }
    }

    #[test]
    fn keyed_samples_nest_by_key() {
        let samples = vec![
            Sample { lon: 0.0, lat: 0.0, key: Some("0".into()), raw: 1.0 },
            Sample { lon: 0.0, lat: 0.0, key: Some("1".into()), raw: 2.0 },
        ];
        let result = build_query_result(samples, None, 1.0, 0.0, vec!["time".into()]);
        match result.values {
            QueryValues::Nested(map) => {
                assert_eq!(map["0"], vec![1.0]);
                assert_eq!(map["1"], vec![2.0]);
            }
            _ => panic!("expected nested values"),
        }
    }

    #[test]
    fn point_inside_polygon() {
        assert!(point_in_geometry(&square(), 0.0, 0.0));
        assert!(!point_in_geometry(&square(), 5.0, 5.0));
    }

    #[test]
    fn bounds_validation_rejects_disjoint_geometry() {
        let err = validate_bounds(&square(), (10.0, 10.0, 20.0, 20.0));
        assert!(err.is_err());
        assert!(validate_bounds(&square(), (-5.0, -5.0, 5.0, 5.0)).is_ok());
    }

    #[test]
    fn missing_spatial_dims_errors() {
        assert!(require_spatial_dims(true, false).is_err());
        assert!(require_spatial_dims(true, true).is_ok());
    }
}
