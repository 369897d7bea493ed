//! Pure Web Mercator / slippy-map tile math, independent of any Bevy `World`.
//!
//! This is the free-function counterpart to [`crate::coord_conversions`]: that module reads
//! the camera through a `SystemParam`, this one takes explicit bounds so `zarr`, `tiles` and
//! `query` can use the same projection math without a `World` in scope.

use std::f64::consts::PI;

/// Maximum Web Mercator latitude (the point at which `y` would diverge to infinity).
pub const MERCATOR_LAT_LIMIT: f64 = 85.05112878;

/// A slippy-map tile identity, `0 <= x,y < 2^z`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tile {
    pub z: u8,
    pub x: u32,
    pub y: u32,
}

impl Tile {
    pub fn new(z: u8, x: u32, y: u32) -> Self {
        Self { z, x, y }
    }

    /// The tile's parent at `z - 1`, or `None` at the root.
    pub fn parent(&self) -> Option<Tile> {
        if self.z == 0 {
            return None;
        }
        Some(Tile::new(self.z - 1, self.x / 2, self.y / 2))
    }

    /// The tile's four children at `z + 1`.
    pub fn children(&self) -> [Tile; 4] {
        let (x, y, z) = (self.x * 2, self.y * 2, self.z + 1);
        [
            Tile::new(z, x, y),
            Tile::new(z, x + 1, y),
            Tile::new(z, x, y + 1),
            Tile::new(z, x + 1, y + 1),
        ]
    }

    /// Walk ancestors from `self.z - 1` down to 0, nearest first.
    pub fn ancestors(&self) -> impl Iterator<Item = Tile> + '_ {
        std::iter::successors(self.parent(), |t| t.parent())
    }
}

/// Geographic bounds, `[west, south, east, north]` in degrees. `west > east` is a valid
/// antimeridian-crossing box (see [`tiles_at_zoom`]).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoBounds {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl GeoBounds {
    pub fn new(west: f64, south: f64, east: f64, north: f64) -> Self {
        Self {
            west,
            south,
            east,
            north,
        }
    }

    pub const WORLD: GeoBounds = GeoBounds {
        west: -180.0,
        south: -MERCATOR_LAT_LIMIT,
        east: 180.0,
        north: MERCATOR_LAT_LIMIT,
    };

    /// `true` when `west > east`, i.e. the box wraps across +/-180.
    pub fn crosses_antimeridian(&self) -> bool {
        self.west > self.east
    }
}

/// Wrap a longitude into `[-180, 180]`.
pub fn wrap_lon(lon: f64) -> f64 {
    let wrapped = (lon + 180.0).rem_euclid(360.0) - 180.0;
    if wrapped == -180.0 { 180.0 } else { wrapped }
}

/// `(lon + 180) / 360`, wrapped to `[-180, 180]` first. Inverse of [`mercator_norm_to_lon`].
pub fn lon_to_mercator_norm(lon: f64) -> f64 {
    (wrap_lon(lon) + 180.0) / 360.0
}

/// Inverse of [`lon_to_mercator_norm`], defined on `u in [0, 1]`.
pub fn mercator_norm_to_lon(u: f64) -> f64 {
    u * 360.0 - 180.0
}

/// `(1 - ln(tan(pi/4 + phi/2)) / pi) / 2`, clamping `lat` to +/- [`MERCATOR_LAT_LIMIT`] first.
pub fn lat_to_mercator_norm(lat: f64) -> f64 {
    let clamped = lat.clamp(-MERCATOR_LAT_LIMIT, MERCATOR_LAT_LIMIT);
    let phi = clamped.to_radians();
    (1.0 - ((PI / 4.0 + phi / 2.0).tan().ln()) / PI) / 2.0
}

/// Inverse of [`lat_to_mercator_norm`], defined on `v in [0, 1]`.
pub fn mercator_norm_to_lat(v: f64) -> f64 {
    let y = PI * (1.0 - 2.0 * v);
    (2.0 * y.exp().atan() - PI / 2.0).to_degrees()
}

/// Enumerate the tiles at zoom `z` covering `bounds`, wrapping `x` modulo `2^z` and clamping
/// `y` to `[0, 2^z - 1]`. Antimeridian-crossing bounds (`west > east`) are handled by iterating
/// the column range past `2^z` and wrapping each column back into range, so no duplicate or
/// missing columns occur at the seam.
pub fn tiles_at_zoom(z: u8, bounds: GeoBounds) -> Vec<Tile> {
    let n = 1u32 << z;
    let x_of = |lon: f64| -> f64 { lon_to_mercator_norm(lon) * n as f64 };
    let y_of = |lat: f64| -> f64 { lat_to_mercator_norm(lat) * n as f64 };

    let y_min = y_of(bounds.north).floor().clamp(0.0, (n - 1) as f64) as u32;
    let y_max = y_of(bounds.south).floor().clamp(0.0, (n - 1) as f64) as u32;

    let (x_start, x_end) = if bounds.crosses_antimeridian() {
        let start = x_of(bounds.west).floor() as i64;
        let end = x_of(bounds.east).floor() as i64 + n as i64;
        (start, end)
    } else {
        let start = x_of(bounds.west).floor() as i64;
        let end = x_of(bounds.east).floor() as i64;
        (start, end.max(start))
    };

    let mut tiles = Vec::new();
    let mut seen_x = std::collections::HashSet::new();
    for raw_x in x_start..=x_end {
        let x = raw_x.rem_euclid(n as i64) as u32;
        if !seen_x.insert(x) && (x_end - x_start) as u64 >= n as u64 {
            // full wraparound already covered every column once; stop re-adding.
            continue;
        }
        for y in y_min..=y_max {
            tiles.push(Tile::new(z, x, y));
        }
    }
    tiles
}

/// Maps clip-space `[-1, 1]^2` to this tile's footprint in Mercator-normalized `[0, 1]^2`,
/// returned as `(scale, shift_x, shift_y)` where `mercator = clip * 0.5 * scale + shift`.
pub fn tile_to_scale(tile: Tile) -> (f64, f64, f64) {
    let n = (1u32 << tile.z) as f64;
    let scale = 1.0 / n;
    let shift_x = (tile.x as f64 + 0.5) / n;
    let shift_y = (tile.y as f64 + 0.5) / n;
    (scale, shift_x, shift_y)
}

/// Clamp `floor(zoom)` into `[0, max_level]`.
pub fn zoom_to_level(zoom: f64, max_level: u8) -> u8 {
    (zoom.floor().max(0.0) as u32).min(max_level as u32) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn lon_round_trip() {
        for lon in [-180.0, -90.0, -45.0, 0.0, 45.0, 90.0, 179.999] {
            let u = lon_to_mercator_norm(lon);
            assert_abs_diff_eq!(mercator_norm_to_lon(u), lon, epsilon = 1e-9);
        }
    }

    #[test]
    fn lat_round_trip_within_limit() {
        for lat in [-MERCATOR_LAT_LIMIT, -45.0, 0.0, 30.0, MERCATOR_LAT_LIMIT] {
            let v = lat_to_mercator_norm(lat);
            assert_abs_diff_eq!(mercator_norm_to_lat(v), lat, epsilon = 1e-6);
        }
    }

    #[test]
    fn lat_clamps_beyond_limit() {
        assert_abs_diff_eq!(
            lat_to_mercator_norm(89.9),
            lat_to_mercator_norm(MERCATOR_LAT_LIMIT),
            epsilon = 1e-12
        );
    }

    #[test]
    fn antimeridian_crossing_has_no_duplicate_or_missing_columns() {
        let z = 3;
        let bounds = GeoBounds::new(170.0, -10.0, -170.0, 10.0);
        let tiles = tiles_at_zoom(z, bounds);
        let n = 1u32 << z;
        let xs: std::collections::HashSet<u32> = tiles.iter().map(|t| t.x).collect();
        // The crossing window should cover exactly the two edge columns, not the whole row.
        assert!(xs.len() < n as usize);
        assert!(xs.contains(&(n - 1)));
        assert!(xs.contains(&0));
    }

    #[test]
    fn world_at_zoom_three_covers_all_64_tiles() {
        let tiles = tiles_at_zoom(3, GeoBounds::WORLD);
        let unique: std::collections::HashSet<_> = tiles.iter().copied().collect();
        assert_eq!(unique.len(), 64);
    }

    #[test]
    fn zoom_to_level_clamps() {
        assert_eq!(zoom_to_level(-1.0, 5), 0);
        assert_eq!(zoom_to_level(2.7, 5), 2);
        assert_eq!(zoom_to_level(9.0, 5), 5);
    }

    #[test]
    fn tile_to_scale_matches_tile_footprint() {
        let (scale, shift_x, shift_y) = tile_to_scale(Tile::new(2, 1, 1));
        assert_abs_diff_eq!(scale, 0.25);
        assert_abs_diff_eq!(shift_x, 0.375);
        assert_abs_diff_eq!(shift_y, 0.375);
    }

    #[test]
    fn parent_child_round_trip() {
        let tile = Tile::new(4, 5, 6);
        let parent = tile.parent().unwrap();
        assert_eq!(parent, Tile::new(3, 2, 3));
        assert!(parent.children().contains(&tile));
    }
}
