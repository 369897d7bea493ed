use bevy::prelude::*;

use bevy_geo_tiles::{CoordValue, MapPlugin, Selector, SelectorValue, ZarrLayerOptions, ZarrLayerPlugin};

const CUSTOM_FRAG: &str = r#"
let tavg = textureSample(band_tavg, band_tavg_sampler, reprojected_uv).r;
let prec = textureSample(band_prec, band_prec_sampler, reprojected_uv).r;
if (tavg != tavg || prec != prec) {
    discard;
}
let dryness = clamp(1.0 - prec * u_precipWeight, 0.0, 1.0);
out_color = vec4<f32>(dryness, 1.0 - dryness, 0.2, 1.0);
"#;

fn main() {
    let mut selector = Selector::new();
    selector.set(
        "band",
        SelectorValue::List(vec![
            CoordValue::Text("tavg".to_string()),
            CoordValue::Text("prec".to_string()),
        ]),
    );

    let mut uniforms = std::collections::HashMap::new();
    uniforms.insert("u_precipWeight".to_string(), 0.05);

    App::new()
        .add_plugins(DefaultPlugins)
        .add_plugins(MapPlugin {
            initial_zoom: 4,
            initial_center: (13.4064, 52.51977).into(),
            tile_source: "https://tile.openstreetmap.org/{z}/{x}/{y}.png".to_string(),
            ..Default::default()
        })
        .add_plugins(ZarrLayerPlugin {
            options: ZarrLayerOptions {
                id: "climate".to_string(),
                source: "https://example.com/worldclim.zarr".to_string(),
                variable: "climate".to_string(),
                colormap: vec![bevy_geo_tiles::ColorStop { r: 1.0, g: 1.0, b: 1.0 }],
                clim: (0.0, 1.0),
                selector,
                opacity: 0.8,
                custom_frag: Some(CUSTOM_FRAG.to_string()),
                uniforms,
                ..Default::default()
            },
        })
        .run();
}
