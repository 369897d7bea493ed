//! Zarr v2/v3 metadata discovery (§4.B): array shape/chunks/dimensions, fill-value
//! normalization, multiscale pyramid parsing, and lat/lon dimension tagging.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::ZarrError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZarrVersion {
    V2,
    V3,
}

/// Coordinate reference system: the two built-ins carry no parameters, anything else needs
/// an accompanying `proj4` string (§6 `crs`/`proj4` options).
#[derive(Debug, Clone, PartialEq)]
pub enum Crs {
    Epsg4326,
    Epsg3857,
    Proj4(String),
}

impl Crs {
    pub fn from_epsg_like(s: &str) -> Self {
        match s.trim() {
            "EPSG:4326" | "epsg:4326" | "4326" => Crs::Epsg4326,
            _ => Crs::Epsg3857,
        }
    }
}

/// Which role a dimension plays: spatial (`lat`/`lon`) or a named non-spatial axis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DimRole {
    Lat,
    Lon,
    Other,
}

const LAT_ALIASES: &[&str] = &["lat", "latitude", "y"];
const LON_ALIASES: &[&str] = &["lon", "longitude", "x", "lng"];

/// Tag `dimension_names` as lat/lon/other. Precedence: explicit `hints` >
/// CF `standard_name` found on the matching entry of `coord_standard_names` > the alias table.
pub fn resolve_dim_roles(
    dimension_names: &[String],
    hints: Option<&HashMap<String, String>>,
    coord_standard_names: &HashMap<String, String>,
) -> Vec<DimRole> {
    dimension_names
        .iter()
        .map(|name| {
            if let Some(hints) = hints {
                if hints.get("lat").map(String::as_str) == Some(name.as_str()) {
                    return DimRole::Lat;
                }
                if hints.get("lon").map(String::as_str) == Some(name.as_str()) {
                    return DimRole::Lon;
                }
            }
            if let Some(standard_name) = coord_standard_names.get(name) {
                match standard_name.as_str() {
                    "latitude" => return DimRole::Lat,
                    "longitude" => return DimRole::Lon,
                    _ => {}
                }
            }
            let lower = name.to_lowercase();
            if LAT_ALIASES.contains(&lower.as_str()) {
                DimRole::Lat
            } else if LON_ALIASES.contains(&lower.as_str()) {
                DimRole::Lon
            } else {
                DimRole::Other
            }
        })
        .collect()
}

/// Normalize a raw Zarr `fill_value` attribute: numeric passes through, `"NaN"` or anything
/// unparseable becomes `Some(NaN)`, `null` means "no fill" (§4.B).
pub fn normalize_fill_value(raw: Option<&Value>) -> Option<f64> {
    match raw {
        None | Some(Value::Null) => None,
        Some(Value::Number(n)) => n.as_f64().or(Some(f64::NAN)),
        Some(Value::String(s)) => {
            if s.eq_ignore_ascii_case("nan") {
                Some(f64::NAN)
            } else {
                Some(s.parse::<f64>().unwrap_or(f64::NAN))
            }
        }
        Some(_) => Some(f64::NAN),
    }
}

/// Array layout as discovered from Zarr metadata, before any chunk data is fetched.
#[derive(Debug, Clone)]
pub struct ArrayMetadata {
    pub shape: Vec<u64>,
    pub chunks: Vec<u64>,
    pub dimension_names: Vec<String>,
    pub dim_roles: Vec<DimRole>,
    pub fill_value: Option<f64>,
    pub scale_factor: f64,
    pub add_offset: f64,
}

impl ArrayMetadata {
    pub fn lat_dim(&self) -> Option<usize> {
        self.dim_roles.iter().position(|r| *r == DimRole::Lat)
    }

    pub fn lon_dim(&self) -> Option<usize> {
        self.dim_roles.iter().position(|r| *r == DimRole::Lon)
    }

    pub fn non_spatial_dims(&self) -> impl Iterator<Item = (usize, &str)> {
        self.dimension_names
            .iter()
            .enumerate()
            .filter(move |(i, _)| self.dim_roles[*i] == DimRole::Other)
            .map(|(i, name)| (i, name.as_str()))
    }
}

/// One level of a multiscale pyramid: its storage path and source-array shape, low to high
/// resolution ordered by `multiscales[0].datasets[]` (§4.B).
#[derive(Debug, Clone)]
pub struct PyramidLevel {
    pub path: String,
    pub metadata: ArrayMetadata,
}

impl PyramidLevel {
    /// Parse the trailing digits of the level path as the dataset's native zoom number, so
    /// overlap math in `render`/`globe` uses the real zoom rather than assuming level 0 == z0.
    pub fn native_zoom(&self) -> Option<u8> {
        let digits: String = self
            .path
            .chars()
            .rev()
            .take_while(|c| c.is_ascii_digit())
            .collect();
        if digits.is_empty() {
            return None;
        }
        digits.chars().rev().collect::<String>().parse().ok()
    }
}

#[derive(Debug, Clone)]
pub enum PyramidKind {
    Tiled {
        levels: Vec<PyramidLevel>,
        tile_size: u32,
        crs: Crs,
    },
    Untiled {
        metadata: ArrayMetadata,
    },
}

pub const DEFAULT_TILE_SIZE: u32 = 128;

/// Parse `multiscales[0].datasets[].path` from group attributes into ordered pyramid levels.
/// Returns `None` when the group carries no `multiscales` attribute (single-level/untiled).
pub fn parse_multiscales(attrs: &Value) -> Option<(Vec<String>, u32, Crs)> {
    let multiscales = attrs.get("multiscales")?.as_array()?;
    let first = multiscales.first()?;
    let datasets = first.get("datasets")?.as_array()?;
    let paths: Vec<String> = datasets
        .iter()
        .filter_map(|d| d.get("path")?.as_str().map(str::to_string))
        .collect();
    if paths.is_empty() {
        return None;
    }
    let tile_size = datasets
        .first()
        .and_then(|d| d.get("pixels_per_tile"))
        .and_then(Value::as_u64)
        .map(|v| v as u32)
        .unwrap_or(DEFAULT_TILE_SIZE);
    let crs = datasets
        .first()
        .and_then(|d| d.get("crs"))
        .and_then(Value::as_str)
        .map(Crs::from_epsg_like)
        .unwrap_or(Crs::Epsg3857);
    Some((paths, tile_size, crs))
}

/// Parse a `dim_labels` group attribute mapping a non-spatial dimension name to its ordered
/// coordinate label strings, e.g. `{"band": ["tavg", "prec"]}`. Lets text-valued selectors
/// resolve against a dimension with no numeric coordinate array of its own.
pub fn parse_dim_labels(attrs: &Value) -> HashMap<String, Vec<String>> {
    let Some(obj) = attrs.get("dim_labels").and_then(Value::as_object) else {
        return HashMap::new();
    };
    obj.iter()
        .filter_map(|(dim, labels)| {
            let labels: Vec<String> = labels
                .as_array()?
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect();
            Some((dim.clone(), labels))
        })
        .collect()
}

/// Parse `dimension_names` (v3) or `_ARRAY_DIMENSIONS` (v2) from array attributes/metadata.
pub fn parse_dimension_names(
    version: ZarrVersion,
    array_meta: &Value,
    array_attrs: &Value,
    rank: usize,
) -> Result<Vec<String>, ZarrError> {
    let names = match version {
        ZarrVersion::V3 => array_meta
            .get("dimension_names")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .enumerate()
                    .map(|(i, v)| {
                        v.as_str()
                            .map(str::to_string)
                            .unwrap_or_else(|| format!("dim_{i}"))
                    })
                    .collect::<Vec<_>>()
            }),
        ZarrVersion::V2 => array_attrs
            .get("_ARRAY_DIMENSIONS")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect::<Vec<_>>()
            }),
    };
    match names {
        Some(names) if names.len() == rank => Ok(names),
        _ => Err(ZarrError::MissingMetadata("dimension_names".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_value_variants() {
        assert_eq!(normalize_fill_value(None), None);
        assert_eq!(normalize_fill_value(Some(&Value::Null)), None);
        assert_eq!(
            normalize_fill_value(Some(&Value::from(-9999.0))),
            Some(-9999.0)
        );
        assert!(normalize_fill_value(Some(&Value::String("NaN".into())))
            .unwrap()
            .is_nan());
        assert!(normalize_fill_value(Some(&Value::String("garbage".into())))
            .unwrap()
            .is_nan());
    }

    #[test]
    fn dim_roles_prefer_hints_over_aliases() {
        let names = vec!["x".to_string(), "y".to_string(), "time".to_string()];
        let mut hints = HashMap::new();
        hints.insert("lat".to_string(), "x".to_string()); // deliberately perverse
        hints.insert("lon".to_string(), "y".to_string());
        let roles = resolve_dim_roles(&names, Some(&hints), &HashMap::new());
        assert_eq!(roles, vec![DimRole::Lat, DimRole::Lon, DimRole::Other]);
    }

    #[test]
    fn dim_roles_fall_back_to_aliases() {
        let names = vec!["time".to_string(), "lat".to_string(), "lon".to_string()];
        let roles = resolve_dim_roles(&names, None, &HashMap::new());
        assert_eq!(roles, vec![DimRole::Other, DimRole::Lat, DimRole::Lon]);
    }

    #[test]
    fn multiscales_parses_ordered_levels() {
        let attrs: Value = serde_json::json!({
            "multiscales": [{
                "datasets": [
                    {"path": "0", "pixels_per_tile": 256, "crs": "EPSG:4326"},
                    {"path": "1"},
                ]
            }]
        });
        let (paths, tile_size, crs) = parse_multiscales(&attrs).unwrap();
        assert_eq!(paths, vec!["0".to_string(), "1".to_string()]);
        assert_eq!(tile_size, 256);
        assert_eq!(crs, Crs::Epsg4326);
    }

    #[test]
    fn dim_labels_parses_band_names() {
        let attrs: Value = serde_json::json!({
            "dim_labels": {"band": ["tavg", "prec"]}
        });
        let labels = parse_dim_labels(&attrs);
        assert_eq!(labels.get("band"), Some(&vec!["tavg".to_string(), "prec".to_string()]));
    }

    #[test]
    fn no_multiscales_is_none() {
        let attrs: Value = serde_json::json!({});
        assert!(parse_multiscales(&attrs).is_none());
    }

    #[test]
    fn native_zoom_parses_trailing_digits() {
        let level = PyramidLevel {
            path: "datasets/level_3".to_string(),
            metadata: ArrayMetadata {
                shape: vec![],
                chunks: vec![],
                dimension_names: vec![],
                dim_roles: vec![],
                fill_value: None,
                scale_factor: 1.0,
                add_offset: 0.0,
            },
        };
        assert_eq!(level.native_zoom(), Some(3));
    }
}
