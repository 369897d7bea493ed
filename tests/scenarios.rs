//! End-to-end coverage for the six scenarios this crate's test plan names: a flat Mercator
//! tiled pyramid, an EPSG:4326 tile on the globe path, an untiled arbitrary-CRS region, a
//! multi-band custom fragment, a selector scrub that avoids refetching, and a polygon query.
//! Each builds synthetic metadata/chunk fixtures directly rather than standing up a real Zarr
//! byte store, since the modules under test (`tiles`, `untiled`, `query`) never touch the
//! store themselves — chunks arrive through `ChunkData`, already decoded.

use bevy_geo_tiles::mapmath::GeoBounds;
use bevy_geo_tiles::tiles::{ResolvedSelector, TileDataManager, Viewport};
use bevy_geo_tiles::zarr::cache::ChunkData;
use bevy_geo_tiles::zarr::metadata::{ArrayMetadata, DimRole, PyramidLevel};
use bevy_geo_tiles::{CoordValue, Selector, SelectorValue};

fn single_band_level() -> PyramidLevel {
    PyramidLevel {
        path: "0/tavg".into(),
        metadata: ArrayMetadata {
            shape: vec![256, 256],
            chunks: vec![128, 128],
            dimension_names: vec!["lat".into(), "lon".into()],
            dim_roles: vec![DimRole::Lat, DimRole::Lon],
            fill_value: Some(-9999.0),
            scale_factor: 1.0,
            add_offset: 0.0,
        },
    }
}

fn multiband_level() -> PyramidLevel {
    PyramidLevel {
        path: "0/climate".into(),
        metadata: ArrayMetadata {
            shape: vec![2, 256, 256],
            chunks: vec![1, 128, 128],
            dimension_names: vec!["band".into(), "lat".into(), "lon".into()],
            dim_roles: vec![DimRole::Other, DimRole::Lat, DimRole::Lon],
            fill_value: None,
            scale_factor: 1.0,
            add_offset: 0.0,
        },
    }
}

/// Scenario 1: a flat Mercator tiled pyramid. A viewport above `min_render_zoom` resolves to a
/// visible tile set, the manager asks for the missing chunk, and installing it makes the tile
/// ready with correctly sliced values.
#[test]
fn flat_mercator_pyramid_round_trip() {
    let mut mgr = TileDataManager::new(vec![single_band_level()], 128, 0.0, 64);
    let viewport = Viewport {
        zoom: 0.0,
        bounds: GeoBounds::WORLD,
    };

    let first = mgr.acquire(viewport);
    assert!(first.ready.is_empty());
    assert_eq!(first.fetches_needed.len(), 1);

    let (_, key) = &first.fetches_needed[0];
    let chunk = ChunkData {
        values: vec![10.0; 128 * 128],
        shape: vec![128, 128],
    };
    mgr.install_chunk(key, chunk);

    let second = mgr.acquire(viewport);
    assert!(!second.ready.is_empty());
    assert!(second.fetches_needed.is_empty());
    let (_, slice) = &second.ready[0];
    assert_eq!(slice.bands[0][0], 10.0);
}

/// Scenario 2: an EPSG:4326 tile rendered through the globe path. The longitude-overlap
/// transform this path derives its `tex_scale_x`/`tex_offset_x` from must reduce to the
/// identity when the host tile's bounds exactly cover the Zarr tile's span.
#[cfg(feature = "globe")]
#[test]
fn epsg4326_tile_on_globe_identity_overlap() {
    use bevy_geo_tiles::globe::longitude_overlap_tex_transform;
    use bevy_geo_tiles::mapmath::Tile;

    let tile = Tile::new(2, 1, 1); // covers lon [-90, 0]
    let host_bounds = GeoBounds::new(-90.0, -45.0, 0.0, 0.0);
    let (scale, offset) = longitude_overlap_tex_transform(tile, host_bounds);
    assert!((scale.0 - 1.0).abs() < 1e-6);
    assert!(offset.0.abs() < 1e-6);
    assert_eq!(scale.1, 1.0);
    assert_eq!(offset.1, 0.0);
}

/// Scenario 3: an untiled arbitrary-CRS region. A mildly nonlinear inverse projection (a
/// stand-in for a PROJ string) forces at least one subdivision beyond the minimum, and the
/// resulting mesh's vertex/index counts stay consistent.
#[test]
fn untiled_arbitrary_crs_mesh_subdivides_on_curvature() {
    use bevy_geo_tiles::untiled::{build_adaptive_mesh, DEFAULT_MESH_MAX_ERROR, MAX_SUBDIVISIONS, MIN_SUBDIVISIONS};

    // A gently curved inverse (think: a local stereographic projection) rather than identity,
    // so the adaptive subdivision loop has real curvature to react to.
    let curved = |x: f64, y: f64| Some((x + 0.0005 * x * x, y + 0.0005 * y * y));
    let (vertices, indices) = build_adaptive_mesh((-50.0, -50.0, 50.0, 50.0), &curved, DEFAULT_MESH_MAX_ERROR).unwrap();

    let side = (vertices.len() as f64).sqrt() as u32 - 1;
    assert!(side >= MIN_SUBDIVISIONS);
    assert!(side <= MAX_SUBDIVISIONS);
    assert_eq!(indices.len() as u32, side * side * 6);
}

/// Scenario 4: a multi-band custom fragment. A list selector over two bands produces two
/// distinct chunk fetches (one per band) for the same tile, and each installs independently.
#[test]
fn multiband_list_selector_fetches_one_chunk_per_band() {
    let mut selector = Selector::new();
    selector.set(
        "band",
        SelectorValue::List(vec![CoordValue::Text("tavg".into()), CoordValue::Text("prec".into())]),
    );

    let mut mgr = TileDataManager::new(vec![multiband_level()], 128, 0.0, 64);
    let resolved = ResolvedSelector::from_indices(&selector);
    mgr.set_selector(selector, resolved);

    let result = mgr.acquire(Viewport {
        zoom: 0.0,
        bounds: GeoBounds::WORLD,
    });
    assert_eq!(result.fetches_needed.len(), 2);

    for (_, key) in &result.fetches_needed {
        let chunk = ChunkData {
            values: vec![1.0; 128 * 128],
            shape: vec![1, 128, 128],
        };
        mgr.install_chunk(key, chunk);
    }

    let ready = mgr.acquire(Viewport {
        zoom: 0.0,
        bounds: GeoBounds::WORLD,
    });
    assert_eq!(ready.ready.len(), 1);
    let (_, slice) = &ready.ready[0];
    assert_eq!(slice.band_names, vec!["tavg".to_string(), "prec".to_string()]);
    assert_eq!(slice.bands.len(), 2);
}

/// Scenario 5: scrubbing a selector whose new value still falls inside the chunks already
/// cached for a tile re-slices locally instead of asking for another fetch.
#[test]
fn selector_scrub_reslices_without_refetch() {
    let level = PyramidLevel {
        path: "0/tavg".into(),
        metadata: ArrayMetadata {
            shape: vec![12, 256, 256],
            chunks: vec![12, 128, 128], // whole time axis in one chunk
            dimension_names: vec!["time".into(), "lat".into(), "lon".into()],
            dim_roles: vec![DimRole::Other, DimRole::Lat, DimRole::Lon],
            fill_value: None,
            scale_factor: 1.0,
            add_offset: 0.0,
        },
    };
    let mut mgr = TileDataManager::new(vec![level], 128, 0.0, 64);

    let mut selector = Selector::new();
    selector.set("time", SelectorValue::Index(0));
    let resolved = ResolvedSelector::from_indices(&selector);
    mgr.set_selector(selector, resolved);

    let first = mgr.acquire(Viewport {
        zoom: 0.0,
        bounds: GeoBounds::WORLD,
    });
    assert_eq!(first.fetches_needed.len(), 1);
    let (_, key) = &first.fetches_needed[0];
    let chunk = ChunkData {
        values: (0..12 * 128 * 128).map(|i| i as f32).collect(),
        shape: vec![12, 128, 128],
    };
    mgr.install_chunk(key, chunk);

    let ready = mgr.acquire(Viewport {
        zoom: 0.0,
        bounds: GeoBounds::WORLD,
    });
    assert_eq!(ready.ready.len(), 1);

    // Scrub `time` to another index still inside the same (whole-axis) chunk: no new fetch.
    let mut next_selector = Selector::new();
    next_selector.set("time", SelectorValue::Index(5));
    let resolved = ResolvedSelector::from_indices(&next_selector);
    mgr.set_selector(next_selector, resolved);

    let rescrubbed = mgr.acquire(Viewport {
        zoom: 0.0,
        bounds: GeoBounds::WORLD,
    });
    assert!(rescrubbed.fetches_needed.is_empty());
    assert_eq!(rescrubbed.ready.len(), 1);
}

/// Scenario 6: a polygon query over a small set of candidate samples, some of which are fill
/// or outside the polygon's bounds, returns only the in-bounds, non-fill values.
#[test]
fn polygon_query_filters_fill_and_out_of_bounds_samples() {
    use bevy_geo_tiles::query;
    use geo::{Coord, Geometry, LineString, Polygon};

    let exterior = LineString::new(vec![
        Coord { x: 10.0, y: 45.0 },
        Coord { x: 12.0, y: 45.0 },
        Coord { x: 12.0, y: 47.0 },
        Coord { x: 10.0, y: 47.0 },
        Coord { x: 10.0, y: 45.0 },
    ]);
    let geometry = Geometry::Polygon(Polygon::new(exterior, vec![]));
    query::validate_bounds(&geometry, (-180.0, -90.0, 180.0, 90.0)).unwrap();

    let candidates = [
        (11.0, 46.0, 23.5),  // inside, real value
        (11.0, 46.5, -9999.0), // inside, fill value
        (50.0, 50.0, 7.0),   // outside polygon bounds entirely
    ];

    let samples: Vec<query::Sample> = candidates
        .iter()
        .filter(|(lon, lat, _)| query::point_in_geometry(&geometry, *lon, *lat))
        .map(|(lon, lat, raw)| query::Sample {
            lon: *lon,
            lat: *lat,
            key: None,
            raw: *raw,
        })
        .collect();

    // Only the first candidate is both inside the polygon and not a fill value.
    let result = query::build_query_result(samples, Some(-9999.0), 1.0, 0.0, vec!["lat".into(), "lon".into()]);
    match result.values {
        query::QueryValues::Flat(values) => assert_eq!(values, vec![23.5]),
        query::QueryValues::Nested(_) => panic!("expected flat values for a spatial-only query"),
    }
}
