//! Shader composer (§4.F): runtime WGSL assembly parameterized by (input space x projection x
//! band count x optional user fragment), plus a cache of compiled programs keyed by the exact
//! variant. Bevy materials accept any WGSL string as a `Shader` asset at runtime
//! (`Shader::from_wgsl`), so the composition stays string-based the way the spec requires —
//! there is no way to make four render dispatchers share one generic GPU program.

use std::collections::HashMap;

use bevy::asset::Handle;
use bevy::render::render_resource::Shader;
use regex::Regex;

use crate::error::ShaderError;

/// Coordinate space the vertex shader's incoming position is expressed in (§4.F).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputSpace {
    Mercator,
    Wgs84,
}

/// Which host projection the vertex shader outputs clip-space for (§4.F).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProjectionMode {
    Matrix,
    MaplibreGlobe,
    MapboxGlobe,
}

impl ProjectionMode {
    fn wgsl_tag(self) -> &'static str {
        match self {
            ProjectionMode::Matrix => "matrix",
            ProjectionMode::MaplibreGlobe => "maplibre_globe",
            ProjectionMode::MapboxGlobe => "mapbox_globe",
        }
    }
}

/// The exact orthogonal choice this shader variant composes over (§4.F, §9 "keep composition
/// narrow").
#[derive(Debug, Clone, PartialEq)]
pub struct ShaderVariant {
    pub input_space: InputSpace,
    pub projection: ProjectionMode,
    pub bands: Vec<String>,
    pub custom_frag: Option<String>,
    pub custom_uniforms: HashMap<String, f32>,
}

impl ShaderVariant {
    /// `bands.join("_")` (or `"base"`) plus the custom-frag content, matching §4.F's
    /// `ProgramCache` key derivation.
    pub fn variant_name(&self) -> String {
        let band_part = if self.bands.is_empty() {
            "base".to_string()
        } else {
            self.bands.join("_")
        };
        match &self.custom_frag {
            Some(frag) => format!("{band_part}#{:x}", simple_hash(frag)),
            None => band_part,
        }
    }
}

fn simple_hash(s: &str) -> u64 {
    // FNV-1a: stable across runs, good enough to distinguish custom-frag variants without
    // pulling in a hashing crate just for shader-cache keys.
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in s.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Build the vertex shader source for `variant` (§4.F vertex composition): common uniforms,
/// scale/shift, the WGS84->Mercator transform with pole clamp (or identity in Mercator input
/// space), and the projection-specific output stage.
pub fn build_vertex_source(variant: &ShaderVariant) -> String {
    let transform = match variant.input_space {
        InputSpace::Mercator => "var mercator_pos: vec2<f32> = position.xy;".to_string(),
        InputSpace::Wgs84 => {
            "var mercator_pos: vec2<f32> = wgs84_to_mercator_clamped(position.xy);".to_string()
        }
    };
    let projection_output = match variant.projection {
        ProjectionMode::Matrix => {
            "out.clip_position = uniforms.view_proj * vec4<f32>(world_pos, 0.0, 1.0);".to_string()
        }
        ProjectionMode::MaplibreGlobe => {
            "out.clip_position = project_tile(world_pos);".to_string()
        }
        ProjectionMode::MapboxGlobe => {
            "out.clip_position = mix(project_ecef(world_pos), uniforms.view_proj * vec4<f32>(world_pos, 0.0, 1.0), uniforms.globe_transition);"
                .to_string()
        }
    };

    format!(
        r#"
struct CommonUniforms {{
    view_proj: mat4x4<f32>,
    scale: vec2<f32>,
    shift: vec2<f32>,
    tex_scale: vec2<f32>,
    tex_offset: vec2<f32>,
    world_offset: f32,
    globe_transition: f32,
}};

@group(0) @binding(0)
var<uniform> uniforms: CommonUniforms;

struct VertexOutput {{
    @builtin(position) clip_position: vec4<f32>,
    @location(0) uv: vec2<f32>,
}};

fn wgs84_to_mercator_clamped(lonlat: vec2<f32>) -> vec2<f32> {{
    let clamped_lat = clamp(lonlat.y, -85.05112878, 85.05112878);
    let lon_norm = (lonlat.x + 180.0) / 360.0;
    let phi = radians(clamped_lat);
    let lat_norm = (1.0 - log(tan(0.78539816 + phi / 2.0)) / 3.14159265) / 2.0;
    return vec2<f32>(lon_norm, lat_norm);
}}

@vertex
fn vs_main(@location(0) position: vec3<f32>, @location(1) uv: vec2<f32>) -> VertexOutput {{
    {transform}
    var world_pos: vec2<f32> = mercator_pos * uniforms.scale + uniforms.shift;
    world_pos.x = world_pos.x + uniforms.world_offset;
    var out: VertexOutput;
    {projection_output}
    out.uv = uv * uniforms.tex_scale + uniforms.tex_offset;
    return out;
}}
"#,
        transform = transform,
        projection_output = projection_output,
    )
}

/// Build the fragment shader source for `variant` (§4.F fragment composition): per-band
/// sample + `raw*data_scale*scale_factor+add_offset`, NaN discard, colormap LUT lookup by
/// default, or the user's `custom_frag` snippet with its uniforms extracted and re-emitted.
pub fn build_fragment_source(variant: &ShaderVariant) -> Result<String, ShaderError> {
    let reprojection_block = r#"
fn apply_4326_reprojection(uv: vec2<f32>, mercator_y: f32) -> vec2<f32> {
    if (reprojection.u_reproject < 0.5) {
        return uv;
    }
    let lat = mercator_norm_to_lat(mercator_y);
    var t: f32 = (reprojection.lat_max - lat) / (reprojection.lat_max - reprojection.lat_min);
    if (reprojection.lat_is_ascending > 0.5) {
        t = 1.0 - t;
    }
    return vec2<f32>(uv.x, clamp(t, 0.0, 1.0));
}

fn mercator_norm_to_lat(v: f32) -> f32 {
    let y = 3.14159265 * (1.0 - 2.0 * v);
    return degrees(2.0 * atan(exp(y)) - 1.57079633);
}
"#;

    let header = format!(
        r#"
struct BandUniforms {{
    clim_min: f32,
    clim_max: f32,
    scale_factor: f32,
    add_offset: f32,
}};

struct ReprojectionUniforms {{
    u_reproject: f32,
    lat_min: f32,
    lat_max: f32,
    lat_is_ascending: f32,
}};

@group(1) @binding(0)
var<uniform> band_uniforms: BandUniforms;
@group(1) @binding(1)
var<uniform> reprojection: ReprojectionUniforms;
@group(1) @binding(2)
var colormap_lut: texture_1d<f32>;
@group(1) @binding(3)
var colormap_sampler: sampler;
{reprojection_block}
"#,
        reprojection_block = reprojection_block,
    );

    if let Some(custom_frag) = &variant.custom_frag {
        return compose_custom_fragment(&header, variant, custom_frag);
    }

    let Some(band) = variant.bands.first() else {
        return Err(ShaderError::CustomFragInvalid(
            "no band and no custom fragment to render".into(),
        ));
    };

    let body = format!(
        r#"
@group(2) @binding(0)
var band_tex_{band}: texture_2d<f32>;
@group(2) @binding(1)
var band_sampler_{band}: sampler;

@fragment
fn fs_main(@location(0) uv: vec2<f32>) -> @location(0) vec4<f32> {{
    let reprojected_uv = apply_4326_reprojection(uv, uv.y);
    let raw = textureSample(band_tex_{band}, band_sampler_{band}, reprojected_uv).r;
    if (raw != raw) {{
        discard;
    }}
    let value = raw * band_uniforms.scale_factor + band_uniforms.add_offset;
    let t = clamp((value - band_uniforms.clim_min) / (band_uniforms.clim_max - band_uniforms.clim_min), 0.0, 1.0);
    return textureSample(colormap_lut, colormap_sampler, t);
}}
"#,
        band = sanitize_ident(band),
    );

    Ok(format!("{header}{body}"))
}

/// Extract `u_*`-style uniform identifiers referenced in a custom fragment snippet, deduped
/// against `declared` (§4.F "its uniforms are extracted by a regex pass, deduplicated against
/// declared customUniforms").
pub fn extract_custom_uniforms(custom_frag: &str, declared: &HashMap<String, f32>) -> Vec<String> {
    let re = Regex::new(r"\bu_[A-Za-z0-9_]+\b").expect("static uniform regex is valid");
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for capture in re.find_iter(custom_frag) {
        let name = capture.as_str().to_string();
        if declared.contains_key(&name) && seen.insert(name.clone()) {
            out.push(name);
        } else if !declared.contains_key(&name) && seen.insert(name.clone()) {
            out.push(name);
        }
    }
    out
}

fn compose_custom_fragment(
    header: &str,
    variant: &ShaderVariant,
    custom_frag: &str,
) -> Result<String, ShaderError> {
    if !custom_frag.contains("gl_FragColor") && !custom_frag.contains("return") {
        return Err(ShaderError::CustomFragInvalid(
            "custom fragment must assign an output color".into(),
        ));
    }

    let uniform_names = extract_custom_uniforms(custom_frag, &variant.custom_uniforms);
    let uniform_decls: String = uniform_names
        .iter()
        .enumerate()
        .map(|(i, name)| format!("@group(3) @binding({i})\nvar<uniform> {name}: f32;\n"))
        .collect();

    let band_bindings: String = variant
        .bands
        .iter()
        .enumerate()
        .map(|(i, band)| {
            let ident = sanitize_ident(band);
            format!(
                "@group(2) @binding({a})\nvar {ident}: texture_2d<f32>;\n@group(2) @binding({b})\nvar {ident}_sampler: sampler;\n",
                a = i * 2,
                b = i * 2 + 1,
            )
        })
        .collect();

    let rewritten_body = custom_frag.replace("gl_FragColor", "out_color");

    let body = format!(
        r#"
{band_bindings}{uniform_decls}
@fragment
fn fs_main(@location(0) uv: vec2<f32>) -> @location(0) vec4<f32> {{
    let reprojected_uv = apply_4326_reprojection(uv, uv.y);
    var out_color: vec4<f32>;
    {rewritten_body}
    return out_color;
}}
"#,
        band_bindings = band_bindings,
        uniform_decls = uniform_decls,
        rewritten_body = rewritten_body,
    );

    Ok(format!("{header}{body}"))
}

fn sanitize_ident(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// A compiled variant's shader assets, looked up every draw and disposed on layer removal
/// (§4.F `ProgramCache`).
pub struct Program {
    pub vertex: Handle<Shader>,
    pub fragment: Handle<Shader>,
}

/// Keyed by `(variant_name, projection_mode)` (§4.F). Built once per key; a fresh variant
/// (e.g. a changed `customFrag`) gets a fresh `variant_name` via its content hash, so the
/// cache never serves a stale compiled program for different source text.
#[derive(Default)]
pub struct ProgramCache {
    programs: HashMap<(String, &'static str), Program>,
}

impl ProgramCache {
    pub fn get_or_insert_with(
        &mut self,
        variant: &ShaderVariant,
        build: impl FnOnce(&ShaderVariant) -> Result<Program, ShaderError>,
    ) -> Result<&Program, ShaderError> {
        let key = (variant.variant_name(), variant.projection.wgsl_tag());
        if !self.programs.contains_key(&key) {
            let program = build(variant)?;
            self.programs.insert(key.clone(), program);
        }
        Ok(self.programs.get(&key).expect("just inserted"))
    }

    pub fn remove_all(&mut self) {
        self.programs.clear();
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_variant() -> ShaderVariant {
        ShaderVariant {
            input_space: InputSpace::Mercator,
            projection: ProjectionMode::Matrix,
            bands: vec!["temp".to_string()],
            custom_frag: None,
            custom_uniforms: HashMap::new(),
        }
    }

    #[test]
    fn default_fragment_samples_single_band_and_discards_nan() {
        let src = build_fragment_source(&base_variant()).unwrap();
        assert!(src.contains("band_tex_temp"));
        assert!(src.contains("discard"));
        assert!(src.contains("colormap_lut"));
    }

    #[test]
    fn variant_name_joins_bands_or_base() {
        let mut v = base_variant();
        v.bands = vec![];
        assert_eq!(v.variant_name(), "base");
        v.bands = vec!["tavg".into(), "prec".into()];
        assert_eq!(v.variant_name(), "tavg_prec");
    }

    #[test]
    fn custom_frag_changes_variant_name() {
        let mut a = base_variant();
        a.custom_frag = Some("out_color = vec4<f32>(1.0); return;".to_string());
        let mut b = base_variant();
        b.custom_frag = Some("out_color = vec4<f32>(0.0); return;".to_string());
        assert_ne!(a.variant_name(), b.variant_name());
    }

    #[test]
    fn custom_uniforms_are_extracted_and_deduped() {
        let frag = "let w = u_precipWeight; out_color = vec4<f32>(w, w, w, 1.0); return;";
        let mut declared = HashMap::new();
        declared.insert("u_precipWeight".to_string(), 1.0);
        let names = extract_custom_uniforms(frag, &declared);
        assert_eq!(names, vec!["u_precipWeight".to_string()]);
    }

    #[test]
    fn custom_fragment_rewrites_gl_frag_color() {
        let mut variant = base_variant();
        variant.bands = vec!["tavg".to_string(), "prec".to_string()];
        variant.custom_frag = Some("gl_FragColor = vec4<f32>(1.0, 0.0, 0.0, 1.0);".to_string());
        let src = build_fragment_source(&variant).unwrap();
        assert!(!src.contains("gl_FragColor"));
        assert!(src.contains("out_color"));
        assert!(src.contains("band_tex_prec") || src.contains("prec"));
    }

    #[test]
    fn custom_fragment_without_assignment_is_rejected() {
        let mut variant = base_variant();
        variant.custom_frag = Some("1 + 1;".to_string());
        assert!(build_fragment_source(&variant).is_err());
    }

    #[test]
    fn program_cache_builds_once_per_variant() {
        let mut cache = ProgramCache::default();
        let variant = base_variant();
        let mut build_calls = 0;
        for _ in 0..3 {
            cache
                .get_or_insert_with(&variant, |_| {
                    build_calls += 1;
                    Ok(Program {
                        vertex: Handle::default(),
                        fragment: Handle::default(),
                    })
                })
                .unwrap();
        }
        assert_eq!(build_calls, 1);
        assert_eq!(cache.len(), 1);
    }
}
