use bevy::{prelude::*, sprite::Anchor};

use bevy_geo_tiles::{MapPlugin, Selector, ZarrLayerOptions, ZarrLayerPlugin};

fn main() {
    App::new()
        .add_plugins(DefaultPlugins)
        .add_plugins(MapPlugin {
            initial_zoom: 14,
            initial_center: (13.4064, 52.51977).into(),
            tile_source: "https://tile.openstreetmap.org/{z}/{x}/{y}.png".to_string(),
            ..Default::default()
        })
        .add_plugins(ZarrLayerPlugin {
            options: ZarrLayerOptions {
                id: "elevation".to_string(),
                source: "https://example.com/elevation.zarr".to_string(),
                variable: "elevation".to_string(),
                colormap: vec![
                    bevy_geo_tiles::ColorStop { r: 0.1, g: 0.4, b: 0.1 },
                    bevy_geo_tiles::ColorStop { r: 0.9, g: 0.9, b: 0.6 },
                ],
                clim: (0.0, 500.0),
                selector: Selector::new(),
                opacity: 0.6,
                ..Default::default()
            },
        })
        .add_systems(Startup, add_marker)
        .run();
}

fn add_marker(mut commands: Commands, asset_server: Res<AssetServer>) {
    let marker = asset_server.load("examples/marker.png");

    commands.spawn((
        Sprite::from_image(marker.clone()),
        Anchor::BOTTOM_CENTER,
        bevy_geo_tiles::MercatorCoords::from_latlon(52.51977, 13.4064).with_z(5.0),
        bevy_geo_tiles::KeepDisplaySize,
    ));
}
