//! Error taxonomy (§7). Each subsystem gets its own `thiserror` enum; [`LayerError`] roots
//! them at the `layer` facade boundary the way a layered Bevy plugin typically composes its
//! per-module errors into one public error for callers.

use thiserror::Error;

/// Zarr metadata discovery and chunk-access failures (module `zarr`).
#[derive(Error, Debug)]
pub enum ZarrError {
    #[error("missing required zarr metadata key: {0}")]
    MissingMetadata(String),
    #[error("unsupported zarr format: neither v3 zarr.json nor v2 .zattrs/.zmetadata loaded")]
    UnsupportedFormat,
    #[error("zarr store used before a successful open()")]
    NotInitialized,
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("chunk decode failed: {0}")]
    Decode(String),
}

/// Tile data manager failures (module `tiles`).
#[derive(Error, Debug)]
pub enum TileError {
    #[error(transparent)]
    Zarr(#[from] ZarrError),
    #[error("dimension {0:?} has no coordinate match for the current selector")]
    SelectorMismatch(String),
}

/// Untiled data manager failures (module `untiled`).
#[derive(Error, Debug)]
pub enum UntiledError {
    #[error(transparent)]
    Zarr(#[from] ZarrError),
    #[error("proj4 string required for crs {0}")]
    MissingProj4(String),
    #[error("failed to build proj4 transform: {0}")]
    Proj(String),
}

/// Shader composition / compilation failures (module `shader`).
#[derive(Error, Debug)]
pub enum ShaderError {
    #[error("invalid custom fragment snippet: {0}")]
    CustomFragInvalid(String),
    #[error("shader compilation failed for variant {variant}: {message}")]
    Compile { variant: String, message: String },
}

/// Point/polygon query failures (module `query`).
#[derive(Error, Debug)]
pub enum QueryError {
    #[error(transparent)]
    Zarr(#[from] ZarrError),
    #[error("query geometry lies outside the dataset bounds")]
    OutsideBounds,
    #[error("dataset is missing required spatial dimensions")]
    MissingSpatialDims,
}

/// Layer configuration failures, raised before any data access is attempted.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required option: {0}")]
    MissingOption(&'static str),
    #[error("crs {crs} requires a `proj4` definition")]
    CrsWithoutProj4 { crs: String },
    #[error("colormap must have at least one stop")]
    EmptyColormap,
}

/// Host did not provide a usable WebGL2/WGPU context or a required extension.
#[derive(Error, Debug)]
pub enum GlContextError {
    #[error("no WebGL2-equivalent render context available")]
    NoContext,
    #[error("linear filtering of float textures unavailable, falling back to nearest")]
    NoLinearFloatFilter,
}

/// Crate-level error rooted at the `layer` facade boundary (§7).
#[derive(Error, Debug)]
pub enum LayerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Zarr(#[from] ZarrError),
    #[error(transparent)]
    Tile(#[from] TileError),
    #[error(transparent)]
    Untiled(#[from] UntiledError),
    #[error(transparent)]
    Shader(#[from] ShaderError),
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error(transparent)]
    GlContext(#[from] GlContextError),
}

impl LayerError {
    /// Whether this error should mark the layer inert (metadata/shader failures) rather than
    /// be retried on the next viewport/selector update (fetch-class failures).
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            LayerError::Zarr(ZarrError::Fetch(_)) | LayerError::Tile(TileError::Zarr(ZarrError::Fetch(_)))
        )
    }
}
