//! Headless Prism demo.
//!
//! Builds a small lit scene and drives it through the renderer's animation
//! loop against the recording device, logging frame statistics.
//!
//! ```sh
//! cargo run -p prism-demo -- --frames 120 --msaa 4 --pixel-ratio 2
//! RUST_LOG=prism_render=debug cargo run -p prism-demo
//! ```

use std::cell::RefCell;
use std::rc::Rc;

use clap::Parser;
use glam::{Quat, Vec3};
use prism_config::{CliArgs, Config, default_config_dir};
use prism_render::{
    Camera, Geometry, HeadlessDevice, Light, LightShadow, Material, MaterialParams, Mesh, Node,
    ObjectId, Renderer, Scene,
};
use tracing::{error, info};

const DEFAULT_FRAMES: u32 = 120;
const FRAME_MS: f64 = 1000.0 / 60.0;

/// Scene shared with the animation callback.
struct DemoState {
    scene: Scene,
    camera: Camera,
    spinner: ObjectId,
    frames_left: u32,
}

impl DemoState {
    fn new(aspect: f32, frames: u32) -> Self {
        let mut scene = Scene::new();

        let mut floor = Mesh::new(
            Geometry::plane(20.0, 20.0),
            Material::new(MaterialParams::standard(Vec3::splat(0.6), 0.9, 0.0)),
        );
        floor.receive_shadow = true;
        scene.add(Node::mesh(floor).with_name("floor"));

        let mut cube = Mesh::new(
            Geometry::cuboid(1.0, 1.0, 1.0),
            Material::new(MaterialParams::phong(Vec3::new(0.9, 0.3, 0.2), 40.0)),
        );
        cube.cast_shadow = true;
        cube.receive_shadow = true;
        let spinner = scene.add(
            Node::mesh(cube)
                .with_name("spinner")
                .with_translation(Vec3::new(0.0, 0.5, 0.0)),
        );

        let mut glass = MaterialParams::standard(Vec3::new(0.2, 0.5, 0.9), 0.1, 0.0);
        glass.transparent = true;
        glass.opacity = 0.4;
        scene.add(
            Node::mesh(Mesh::new(Geometry::sphere(0.6, 24, 16), Material::new(glass)))
                .with_name("glass")
                .with_translation(Vec3::new(1.8, 0.6, 0.5)),
        );

        scene.add(Node::light(Light::ambient(Vec3::ONE, 0.2)));
        scene.add(
            Node::light(
                Light::directional(Vec3::ONE, 1.0).with_shadow(LightShadow {
                    map_size: Some(1024),
                    ..LightShadow::default()
                }),
            )
            .with_translation(Vec3::new(3.0, 6.0, 2.0)),
        );

        let mut camera = Camera::perspective(0.9, aspect, 0.1, 100.0);
        camera.position = Vec3::new(0.0, 2.5, 7.0);
        camera.look_at(Vec3::ZERO, Vec3::Y);

        Self {
            scene,
            camera,
            spinner,
            frames_left: frames,
        }
    }

    fn update(&mut self, time: f64) {
        let angle = (time / 1000.0) as f32;
        if let Some(node) = self.scene.node_mut(self.spinner) {
            node.transform.rotation = Quat::from_rotation_y(angle);
        }
    }
}

fn main() {
    let args = CliArgs::parse();

    let config_dir = args.config.clone().or_else(default_config_dir);

    let (mut config, load_error) = match config_dir.as_deref().map(Config::load_or_create) {
        Some(Ok(config)) => (config, None),
        Some(Err(e)) => (Config::default(), Some(e.to_string())),
        None => (Config::default(), None),
    };
    config.apply_cli_overrides(&args);

    let log_dir = config
        .debug
        .log_dir
        .clone()
        .or_else(|| config_dir.as_ref().map(|dir| dir.join("logs")));
    prism_log::init_logging(log_dir.as_deref(), cfg!(debug_assertions), Some(&config));

    if let Some(e) = load_error {
        log::warn!("Failed to load config: {e}, using defaults");
    }

    let frames = args.frames.unwrap_or(DEFAULT_FRAMES);
    let aspect = config.window.width as f32 / config.window.height.max(1) as f32;
    let state = Rc::new(RefCell::new(DemoState::new(aspect, frames)));

    let mut renderer = Renderer::new(HeadlessDevice::new(), &config);
    {
        let demo = state.borrow();
        if let Err(e) = renderer.compile(&demo.scene, &demo.camera) {
            error!("Pre-compile failed: {e}");
        }
    }
    info!(
        "Pre-compiled {} programs for {} nodes",
        renderer.info().memory.programs,
        state.borrow().scene.len()
    );

    let frame_state = Rc::clone(&state);
    renderer.set_animation_loop(Some(Box::new(
        move |renderer: &mut Renderer<HeadlessDevice>, time: f64| {
            let mut demo = frame_state.borrow_mut();
            if demo.frames_left == 0 {
                renderer.set_animation_loop(None);
                return;
            }
            demo.frames_left -= 1;
            demo.update(time);
            if let Err(e) = renderer.render(&demo.scene, &demo.camera) {
                error!("Frame failed: {e}");
                renderer.set_animation_loop(None);
            }
        },
    )));

    let mut time = 0.0;
    while renderer.is_animating() {
        renderer.tick(time);
        time += FRAME_MS;
    }

    let stats = renderer.info();
    info!(
        "Rendered {} frames: {} calls, {} triangles, {} uniform uploads in the last frame",
        stats.frame, stats.render.calls, stats.render.triangles, stats.render.uniform_uploads
    );
    info!(
        "Live objects: {} programs, {} textures, {} geometries, {} render targets ({} bytes)",
        stats.memory.programs,
        stats.memory.textures,
        stats.memory.geometries,
        stats.memory.render_targets,
        stats.memory.bytes
    );

    renderer.dispose();
}
