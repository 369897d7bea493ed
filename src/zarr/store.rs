//! `ZarrStore`: version-agnostic metadata discovery plus chunk/coordinate access (§4.B).
//!
//! Metadata discovery reads raw bytes off the storage backend directly (so it can tell a v3
//! group from a v2 consolidated store before any array is opened); once a level's path is
//! resolved, per-array access is handed to `zarrs::array::Array`, which already knows how to
//! decode both v2 and v3 chunks (including sharded v3 chunks) once pointed at the right key.

use std::collections::HashMap;
use std::sync::Arc;

use bevy::log::{debug, trace};
use serde_json::Value;
use zarrs::array::Array;
use zarrs::array_subset::ArraySubset;
use zarrs_storage::ReadableStorageTraits;
use zarrs_storage::storage_adapter::async_to_sync::AsyncToSyncStorageAdapter;

use crate::error::ZarrError;
use crate::selector::CoordValue;

use super::cache::{CachedMetadata, ChunkCache, ChunkCacheKey, ChunkData, MetadataCache, MetadataCacheKey, PyramidKindCache};
use super::metadata::{
    ArrayMetadata, Crs, DimRole, PyramidKind, PyramidLevel, ZarrVersion, normalize_fill_value,
    parse_dim_labels, parse_dimension_names, parse_multiscales, resolve_dim_roles,
};

pub type SharedStorage = Arc<dyn ReadableStorageTraits>;

/// Per-URL request rewrite/auth hook (§6 `transformRequest`). Kept intentionally narrow: the
/// object-store authentication plumbing itself is an external collaborator (§1).
#[derive(Clone)]
pub struct TransformRequestHook(pub Arc<dyn Fn(&str) -> (String, Vec<(String, String)>) + Send + Sync>);

impl std::fmt::Debug for TransformRequestHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TransformRequestHook(..)")
    }
}

#[derive(Debug, Clone)]
pub struct OpenOptions {
    pub source: String,
    pub version_hint: Option<ZarrVersion>,
    pub variable: String,
    pub dimension_hints: Option<HashMap<String, String>>,
    pub coordinate_keys: Option<Vec<String>>,
    pub lat_hint: Option<String>,
    pub bounds_override: Option<(f64, f64, f64, f64)>,
    pub fill_value_override: Option<f64>,
    pub lat_is_ascending_override: Option<bool>,
    pub transform_request: Option<TransformRequestHook>,
}

impl OpenOptions {
    pub fn new(source: impl Into<String>, variable: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            version_hint: None,
            variable: variable.into(),
            dimension_hints: None,
            coordinate_keys: None,
            lat_hint: None,
            bounds_override: None,
            fill_value_override: None,
            lat_is_ascending_override: None,
            transform_request: None,
        }
    }
}

/// XY extent of the dataset, in the source CRS's native lon/lat edge coordinates, plus the
/// detected row orientation (§4.B "XY limits").
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct XyLimits {
    pub x_min: f64,
    pub x_max: f64,
    pub y_min: f64,
    pub y_max: f64,
    pub lat_is_ascending: Option<bool>,
}

impl XyLimits {
    pub fn full_world() -> Self {
        Self {
            x_min: -180.0,
            x_max: 180.0,
            y_min: -90.0,
            y_max: 90.0,
            lat_is_ascending: None,
        }
    }
}

pub struct ZarrStore {
    storage: SharedStorage,
    source: String,
    variable: String,
    pyramid: PyramidKind,
    xy_limits: XyLimits,
    chunk_cache: Arc<ChunkCache>,
    array_cache: std::sync::Mutex<HashMap<String, Arc<Array<dyn ReadableStorageTraits>>>>,
    dim_labels: HashMap<String, Vec<String>>,
    /// Kept alive for as long as `storage` wraps an `AsyncToSyncStorageAdapter`: the adapter
    /// only holds a `Handle`, so the owning `Runtime` must outlive every `block_on` it makes.
    _async_runtime: Option<Arc<tokio::runtime::Runtime>>,
}

impl ZarrStore {
    /// Resolve metadata and return a ready store. Mirrors `ZarrGridProcessor::open`'s
    /// try-array-then-try-group fallback, generalized to a full v2/v3 + multiscale probe.
    pub fn open(
        options: OpenOptions,
        metadata_cache: &MetadataCache,
        chunk_cache: Arc<ChunkCache>,
    ) -> Result<Self, ZarrError> {
        let (storage, async_runtime) = build_storage(&options.source, options.transform_request.as_ref())?;

        let cache_key = MetadataCacheKey::new(options.version_hint, &options.source, &options.variable);
        let (version, group_attrs) = probe_version(&storage, options.version_hint)?;

        let multiscale = parse_multiscales(&group_attrs);
        let pyramid = match &multiscale {
            Some((paths, tile_size, crs)) => {
                let mut levels = Vec::with_capacity(paths.len());
                for path in paths {
                    let level_path = format!("{path}/{}", options.variable);
                    let metadata = open_array_metadata(
                        &storage,
                        version,
                        &level_path,
                        options.dimension_hints.as_ref(),
                        options.fill_value_override,
                    )?;
                    levels.push(PyramidLevel {
                        path: level_path,
                        metadata,
                    });
                }
                debug!(levels = levels.len(), tile_size, "opened zarr multiscale pyramid");
                PyramidKind::Tiled {
                    levels,
                    tile_size: *tile_size,
                    crs: crs.clone(),
                }
            }
            None => {
                let metadata = open_array_metadata(
                    &storage,
                    version,
                    &options.variable,
                    options.dimension_hints.as_ref(),
                    options.fill_value_override,
                )?;
                trace!("opened untiled zarr array");
                PyramidKind::Untiled { metadata }
            }
        };

        metadata_cache.insert(
            cache_key,
            CachedMetadata {
                pyramid: match &pyramid {
                    PyramidKind::Tiled { levels, tile_size, .. } => PyramidKindCache::Tiled {
                        level_paths: levels.iter().map(|l| l.path.clone()).collect(),
                        tile_size: *tile_size,
                    },
                    PyramidKind::Untiled { .. } => PyramidKindCache::Untiled,
                },
            },
        );

        let dim_labels = parse_dim_labels(&group_attrs);

        let mut store = Self {
            storage,
            source: options.source,
            variable: options.variable,
            pyramid,
            xy_limits: XyLimits::full_world(),
            chunk_cache,
            array_cache: std::sync::Mutex::new(HashMap::new()),
            dim_labels,
            _async_runtime: async_runtime,
        };

        store.xy_limits = match options.bounds_override {
            Some((x_min, y_min, x_max, y_max)) => XyLimits {
                x_min,
                x_max,
                y_min,
                y_max,
                lat_is_ascending: options.lat_is_ascending_override,
            },
            None => store
                .compute_xy_limits(options.lat_is_ascending_override)
                .unwrap_or_else(|_| XyLimits::full_world()),
        };

        Ok(store)
    }

    pub fn pyramid(&self) -> &PyramidKind {
        &self.pyramid
    }

    pub fn xy_limits(&self) -> XyLimits {
        self.xy_limits
    }

    pub fn variable(&self) -> &str {
        &self.variable
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Fetch and decode a chunk, serving from the shared `ChunkCache` when present.
    pub fn get_chunk(&self, level_path: &str, chunk_indices: &[u64]) -> Result<ChunkData, ZarrError> {
        let key = ChunkCacheKey {
            level_path: level_path.to_string(),
            chunk_indices: chunk_indices.to_vec(),
        };
        if let Some(cached) = self.chunk_cache.get(&key) {
            trace!(level_path, ?chunk_indices, "chunk cache hit");
            return Ok(cached);
        }

        let array = self.open_array(level_path)?;
        let subset = ArraySubset::new_with_shape(
            array
                .chunk_grid()
                .chunk_shape(chunk_indices, array.shape())
                .map_err(|e| ZarrError::Decode(e.to_string()))?
                .ok_or_else(|| ZarrError::Decode("missing chunk shape".into()))?
                .iter()
                .map(|n| n.get())
                .collect(),
        );
        let values: Vec<f64> = array
            .retrieve_chunk_elements(chunk_indices)
            .map_err(|e| ZarrError::Decode(e.to_string()))?;
        let shape = subset.shape().to_vec();
        let data = ChunkData { values, shape };
        self.chunk_cache.insert(key, data.clone());
        Ok(data)
    }

    fn open_array(&self, level_path: &str) -> Result<Arc<Array<dyn ReadableStorageTraits>>, ZarrError> {
        let mut cache = self.array_cache.lock().unwrap();
        if let Some(array) = cache.get(level_path) {
            return Ok(array.clone());
        }
        let array = Array::open(self.storage.clone(), level_path)
            .map_err(|e| ZarrError::MissingMetadata(format!("{level_path}: {e}")))?;
        let array = Arc::new(array);
        cache.insert(level_path.to_string(), array.clone());
        Ok(array)
    }

    /// Load a 1-D coordinate array fully, for value-based selectors and XY-limit detection.
    pub fn get_coordinate_array(&self, key: &str) -> Result<Vec<f64>, ZarrError> {
        let array = self.open_array(key)?;
        array
            .retrieve_array_subset_elements(&ArraySubset::new_with_shape(array.shape().to_vec()))
            .map_err(|e| ZarrError::Decode(e.to_string()))
    }

    /// Resolve a selector `value` to the position it occupies along `dim`'s coordinate array
    /// (§3 "a single value matched to the coordinate array", §4.B "coordinates loaded lazily
    /// for non-spatial dims used by value-based selectors"). Numeric values search `dim`'s own
    /// coordinate array for the nearest match; text values match against `dim_labels`, the
    /// ordered label strings parsed from the dataset's `dim_labels` group attribute, falling
    /// back to parsing the text as a number when no labels are present for `dim`.
    pub fn resolve_coord_value(&self, dim: &str, value: &CoordValue) -> Result<u64, ZarrError> {
        match value {
            CoordValue::Number(n) => {
                let coords = self.get_coordinate_array(dim)?;
                nearest_index(&coords, *n)
                    .ok_or_else(|| ZarrError::MissingMetadata(format!("{dim}: empty coordinate array")))
            }
            CoordValue::Text(label) => {
                if let Some(labels) = self.dim_labels.get(dim) {
                    return labels
                        .iter()
                        .position(|l| l == label)
                        .map(|i| i as u64)
                        .ok_or_else(|| ZarrError::MissingMetadata(format!("{dim}: no label {label:?}")));
                }
                let n: f64 = label
                    .parse()
                    .map_err(|_| ZarrError::MissingMetadata(format!("{dim}: non-numeric label {label:?}")))?;
                let coords = self.get_coordinate_array(dim)?;
                nearest_index(&coords, n)
                    .ok_or_else(|| ZarrError::MissingMetadata(format!("{dim}: empty coordinate array")))
            }
        }
    }

    /// Read the level-0 lat/lon coordinate arrays and compute `(x_min,x_max,y_min,y_max)` plus
    /// orientation (§4.B "XY limits"). Falls back to full-world when no coordinate arrays are
    /// resolvable — callers should treat that as "no caller-supplied bounds, no coordinates".
    fn compute_xy_limits(&self, ascending_override: Option<bool>) -> Result<XyLimits, ZarrError> {
        let metadata = match &self.pyramid {
            PyramidKind::Tiled { levels, .. } => levels
                .first()
                .map(|l| &l.metadata)
                .ok_or_else(|| ZarrError::MissingMetadata("pyramid level 0".into()))?,
            PyramidKind::Untiled { metadata } => metadata,
        };
        let (lat_idx, lon_idx) = match (metadata.lat_dim(), metadata.lon_dim()) {
            (Some(lat), Some(lon)) => (lat, lon),
            _ => return Ok(XyLimits::full_world()),
        };
        let lat_name = metadata.dimension_names[lat_idx].clone();
        let lon_name = metadata.dimension_names[lon_idx].clone();

        let lat_values = self.get_coordinate_array(&lat_name)?;
        let lon_values = self.get_coordinate_array(&lon_name)?;

        let (y_min, y_max) = min_max(&lat_values).unwrap_or((-90.0, 90.0));
        let (x_min, x_max) = min_max(&lon_values).unwrap_or((-180.0, 180.0));
        let lat_is_ascending = ascending_override.or_else(|| detect_lat_ascending(&lat_values));

        Ok(XyLimits {
            x_min,
            x_max,
            y_min,
            y_max,
            lat_is_ascending,
        })
    }
}

fn nearest_index(coords: &[f64], target: f64) -> Option<u64> {
    coords
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| (*a - target).abs().total_cmp(&(*b - target).abs()))
        .map(|(i, _)| i as u64)
}

fn min_max(values: &[f64]) -> Option<(f64, f64)> {
    if values.is_empty() {
        return None;
    }
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for &v in values {
        if v < min {
            min = v;
        }
        if v > max {
            max = v;
        }
    }
    Some((min, max))
}

fn probe_version(
    storage: &SharedStorage,
    hint: Option<ZarrVersion>,
) -> Result<(ZarrVersion, Value), ZarrError> {
    if let Some(version) = hint {
        let attrs = read_group_attrs(storage, version)?;
        return Ok((version, attrs));
    }

    match read_group_attrs(storage, ZarrVersion::V3) {
        Ok(attrs) => Ok((ZarrVersion::V3, attrs)),
        Err(_) => {
            let attrs = read_group_attrs(storage, ZarrVersion::V2)?;
            Ok((ZarrVersion::V2, attrs))
        }
    }
}

fn read_group_attrs(storage: &SharedStorage, version: ZarrVersion) -> Result<Value, ZarrError> {
    let key = match version {
        ZarrVersion::V3 => "zarr.json",
        ZarrVersion::V2 => ".zmetadata",
    };
    if let Some(bytes) = get_bytes(storage, key)? {
        let parsed: Value = serde_json::from_slice(&bytes)
            .map_err(|e| ZarrError::MissingMetadata(format!("{key}: {e}")))?;
        if version == ZarrVersion::V3 {
            if parsed.get("node_type").and_then(Value::as_str) != Some("group") {
                return Err(ZarrError::UnsupportedFormat);
            }
            return Ok(parsed.get("attributes").cloned().unwrap_or(Value::Null));
        }
        // consolidated v2: attributes live under "metadata"[".zattrs"] at the root.
        return Ok(parsed
            .get("metadata")
            .and_then(|m| m.get(".zattrs"))
            .cloned()
            .unwrap_or(Value::Null));
    }

    if version == ZarrVersion::V2 {
        if let Some(bytes) = get_bytes(storage, ".zattrs")? {
            return serde_json::from_slice(&bytes)
                .map_err(|e| ZarrError::MissingMetadata(format!(".zattrs: {e}")));
        }
    }

    Err(ZarrError::UnsupportedFormat)
}

fn open_array_metadata(
    storage: &SharedStorage,
    version: ZarrVersion,
    level_path: &str,
    hints: Option<&HashMap<String, String>>,
    fill_value_override: Option<f64>,
) -> Result<ArrayMetadata, ZarrError> {
    let (meta_key, attrs_key) = match version {
        ZarrVersion::V3 => (format!("{level_path}/zarr.json"), None),
        ZarrVersion::V2 => (
            format!("{level_path}/.zarray"),
            Some(format!("{level_path}/.zattrs")),
        ),
    };

    let meta_bytes = get_bytes(storage, &meta_key)?
        .ok_or_else(|| ZarrError::MissingMetadata(meta_key.clone()))?;
    let meta: Value = serde_json::from_slice(&meta_bytes)
        .map_err(|e| ZarrError::MissingMetadata(format!("{meta_key}: {e}")))?;

    let attrs: Value = match (version, attrs_key) {
        (ZarrVersion::V3, _) => meta.get("attributes").cloned().unwrap_or(Value::Null),
        (ZarrVersion::V2, Some(key)) => get_bytes(storage, &key)?
            .map(|b| serde_json::from_slice(&b).unwrap_or(Value::Null))
            .unwrap_or(Value::Null),
        _ => Value::Null,
    };

    let shape: Vec<u64> = meta
        .get("shape")
        .and_then(Value::as_array)
        .ok_or_else(|| ZarrError::MissingMetadata("shape".into()))?
        .iter()
        .filter_map(Value::as_u64)
        .collect();

    let chunks: Vec<u64> = match version {
        ZarrVersion::V3 => meta
            .get("chunk_grid")
            .and_then(|g| g.get("configuration"))
            .and_then(|c| c.get("chunk_shape"))
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_u64).collect())
            .ok_or_else(|| ZarrError::MissingMetadata("chunk_grid".into()))?,
        ZarrVersion::V2 => meta
            .get("chunks")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_u64).collect())
            .ok_or_else(|| ZarrError::MissingMetadata("chunks".into()))?,
    };

    let dimension_names = parse_dimension_names(version, &meta, &attrs, shape.len())?;

    let coord_standard_names = HashMap::new(); // populated lazily by callers that load coordinate arrays.
    let dim_roles = resolve_dim_roles(&dimension_names, hints, &coord_standard_names);

    let fill_value = fill_value_override.or_else(|| {
        let raw = match version {
            ZarrVersion::V3 => meta.get("fill_value"),
            ZarrVersion::V2 => meta.get("fill_value"),
        };
        normalize_fill_value(raw)
    });

    let scale_factor = attrs.get("scale_factor").and_then(Value::as_f64).unwrap_or(1.0);
    let add_offset = attrs.get("add_offset").and_then(Value::as_f64).unwrap_or(0.0);

    Ok(ArrayMetadata {
        shape,
        chunks,
        dimension_names,
        dim_roles,
        fill_value,
        scale_factor,
        add_offset,
    })
}

/// Detect ascending/descending orientation from consecutive differences; `None` if the
/// coordinate array is non-monotonic (§4.B).
pub fn detect_lat_ascending(values: &[f64]) -> Option<bool> {
    if values.len() < 2 {
        return None;
    }
    let mut ascending = None;
    for pair in values.windows(2) {
        let diff = pair[1] - pair[0];
        if diff == 0.0 {
            continue;
        }
        let this_ascending = diff > 0.0;
        match ascending {
            None => ascending = Some(this_ascending),
            Some(prev) if prev != this_ascending => return None,
            _ => {}
        }
    }
    ascending
}

fn get_bytes(storage: &SharedStorage, key: &str) -> Result<Option<Vec<u8>>, ZarrError> {
    let store_key = zarrs_storage::StoreKey::new(key.trim_start_matches('/'))
        .map_err(|e| ZarrError::Fetch(e.to_string()))?;
    storage
        .get(&store_key)
        .map(|maybe| maybe.map(|bytes| bytes.to_vec()))
        .map_err(|e| ZarrError::Fetch(e.to_string()))
}

/// Build the storage backend for `source`, applying `transform_request` to HTTP(S) sources
/// (§6). `file://`/bare paths use `zarrs_filesystem`; everything else goes through
/// `object_store` + `zarrs_object_store`, bridged to the synchronous `ReadableStorageTraits`
/// zarrs expects via `AsyncToSyncStorageAdapter` (chunk fetches are the only suspension point
/// per §5, so the adapter's internal `block_on` is confined to the IoTaskPool task that calls
/// into `ZarrStore`, never to a Bevy system itself).
fn build_storage(
    source: &str,
    transform_request: Option<&TransformRequestHook>,
) -> Result<(SharedStorage, Option<Arc<tokio::runtime::Runtime>>), ZarrError> {
    if let Some(path) = source.strip_prefix("file://") {
        let store = zarrs_filesystem::FilesystemStore::new(path)
            .map_err(|e| ZarrError::Fetch(e.to_string()))?;
        return Ok((Arc::new(store), None));
    }
    if !source.contains("://") {
        let store = zarrs_filesystem::FilesystemStore::new(source)
            .map_err(|e| ZarrError::Fetch(e.to_string()))?;
        return Ok((Arc::new(store), None));
    }

    let (effective_url, headers) = transform_request
        .map(|hook| (hook.0)(source))
        .unwrap_or_else(|| (source.to_string(), Vec::new()));

    let mut builder = object_store::http::HttpBuilder::new().with_url(effective_url.clone());
    if !headers.is_empty() {
        let mut client_options = object_store::ClientOptions::new();
        for (name, value) in &headers {
            client_options = client_options.with_header(name.clone(), value.clone());
        }
        builder = builder.with_client_options(client_options);
    }
    let object_store = builder
        .build()
        .map_err(|e| ZarrError::Fetch(e.to_string()))?;

    // Owned here and handed back to `ZarrStore` rather than dropped: the adapter below only
    // holds a `Handle`, which panics on `block_on` once its owning `Runtime` is gone.
    let runtime = Arc::new(
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| ZarrError::Fetch(e.to_string()))?,
    );
    let async_store = zarrs_object_store::AsyncObjectStore::new(object_store);
    let adapted = AsyncToSyncStorageAdapter::new(async_store, runtime.handle().clone());
    Ok((Arc::new(adapted), Some(runtime)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascending_detected() {
        assert_eq!(detect_lat_ascending(&[10.0, 20.0, 30.0]), Some(true));
    }

    #[test]
    fn descending_detected() {
        assert_eq!(detect_lat_ascending(&[30.0, 20.0, 10.0]), Some(false));
    }

    #[test]
    fn non_monotonic_is_none() {
        assert_eq!(detect_lat_ascending(&[10.0, 20.0, 15.0]), None);
    }

    #[test]
    fn single_value_is_none() {
        assert_eq!(detect_lat_ascending(&[10.0]), None);
    }
}
