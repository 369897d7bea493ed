//! Demonstrates the globe render path. A real app would source `tile_matrix`/`globe_transition`
//! from a 3D globe-camera plugin; this stub stands in for that external collaborator so the
//! example only needs the `globe` feature, not a full globe-rendering crate.
use bevy::prelude::*;

use bevy_geo_tiles::{GlobeHost, RenderingMode, Selector, ZarrLayerOptions, ZarrLayerPlugin};

struct FixedGlobeCamera;

impl GlobeHost for FixedGlobeCamera {
    fn tile_matrix(&self, _tile: bevy_geo_tiles::mapmath::Tile) -> [[f32; 4]; 4] {
        Mat4::IDENTITY.to_cols_array_2d()
    }

    fn globe_transition(&self) -> f32 {
        1.0
    }
}

fn main() {
    App::new()
        .add_plugins(DefaultPlugins)
        .add_plugins(ZarrLayerPlugin {
            options: ZarrLayerOptions {
                id: "vegetation".to_string(),
                source: "https://example.com/vegetation.zarr".to_string(),
                variable: "ndvi".to_string(),
                colormap: vec![
                    bevy_geo_tiles::ColorStop { r: 0.6, g: 0.4, b: 0.2 },
                    bevy_geo_tiles::ColorStop { r: 0.1, g: 0.6, b: 0.1 },
                ],
                clim: (-1.0, 1.0),
                selector: Selector::new(),
                rendering_mode: RenderingMode::Globe,
                ..Default::default()
            },
        })
        .add_systems(Startup, spawn_camera)
        .run();
}

fn spawn_camera(mut commands: Commands) {
    commands.spawn(Camera3d::default());
}
