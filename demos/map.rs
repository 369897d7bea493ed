use bevy::prelude::*;

use bevy_geo_tiles::{MapPlugin, Selector, ZarrLayerOptions, ZarrLayerPlugin};

fn main() {
    App::new()
        .add_plugins(DefaultPlugins)
        .add_plugins(MapPlugin {
            initial_zoom: 6,
            initial_center: (13.4064, 52.51977).into(),
            tile_source: "https://tile.openstreetmap.org/{z}/{x}/{y}.png".to_string(),
            ..Default::default()
        })
        .add_plugins(ZarrLayerPlugin {
            options: ZarrLayerOptions {
                id: "sst".to_string(),
                source: "https://example.com/sea-surface-temp.zarr".to_string(),
                variable: "sst".to_string(),
                colormap: bluered_colormap(),
                clim: (-2.0, 32.0),
                selector: Selector::new(),
                opacity: 0.9,
                ..Default::default()
            },
        })
        .run();
}

fn bluered_colormap() -> Vec<bevy_geo_tiles::ColorStop> {
    vec![
        bevy_geo_tiles::ColorStop { r: 0.02, g: 0.19, b: 0.38 },
        bevy_geo_tiles::ColorStop { r: 0.85, g: 0.85, b: 0.85 },
        bevy_geo_tiles::ColorStop { r: 0.70, g: 0.02, b: 0.06 },
    ]
}
