//! Frame driver.
//!
//! [`Renderer`] owns every cache (device state, resources, programs, uniform
//! values) and walks a frame through a fixed sequence of phases:
//!
//! ```text
//! Idle -> BuildLists -> SetupLights -> [TransmissivePrepass] -> OpaquePass
//!      -> TransmissivePass -> TransparentPass -> Present -> Idle
//! ```
//!
//! Nothing that happens on the device aborts a frame. Programs that failed to
//! compile are still drawn with, allocation failures skip the affected target,
//! and a lost context drops every device-side cache until the device comes back.

use std::collections::HashMap;
use std::sync::Arc;

use glam::{Mat3, Mat4, Vec3, Vec4};
use log::{debug, info, warn};
use prism_config::{Config, OutputEncoding, Precision, RenderConfig, ToneMapping};

use crate::animation::{self, AnimationLoop, FrameCallback};
use crate::camera::Camera;
use crate::device::{Capabilities, ClearMask, CullState, Device, DrawCommand, Rect};
use crate::error::RenderError;
use crate::frustum::Frustum;
use crate::geometry::Geometry;
use crate::info::{MemoryStats, RenderInfo};
use crate::light::{LightState, ShadowCaster, ShadowKind};
use crate::material::{Material, MaterialFeatures, MaterialId, MaterialParams, Side};
use crate::program::{Program, ProgramCache, ProgramDiagnostics, ShaderError};
use crate::render_list::{RenderItem, RenderList, build_render_list, mesh_items};
use crate::render_target::{RenderTarget, RenderTargetDescriptor, RenderTargetId};
use crate::resource::ResourceManager;
use crate::scene::Scene;
use crate::shader::{ProgramContext, ProgramParameters};
use crate::shadow::{ShadowMaps, cube_face_camera};
use crate::state::{Blending, StateTracker};
use crate::texture::Texture;
use crate::uniforms::{DrawUniforms, FrameUniforms, ObjectUniforms, UniformBinder};

/// Uniform name of the refraction source rendered by the transmission prepass.
pub const TRANSMISSION_MAP: &str = "transmission_map";

/// Receives every shader compile failure.
pub type ShaderErrorCallback = Box<dyn FnMut(&ShaderError)>;

/// Where the renderer is inside `render()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePhase {
    Idle,
    BuildLists,
    SetupLights,
    TransmissivePrepass,
    OpaquePass,
    TransmissivePass,
    TransparentPass,
    Present,
}

/// Programs held by one material, keyed by cache key.
struct MaterialRecord {
    version: u64,
    programs: HashMap<String, Arc<Program>>,
    last: Option<Arc<Program>>,
}

impl MaterialRecord {
    fn new(version: u64) -> Self {
        Self {
            version,
            programs: HashMap::new(),
            last: None,
        }
    }
}

/// Renders scenes through a [`Device`].
pub struct Renderer<D: Device> {
    device: D,
    config: RenderConfig,
    precision: Precision,
    samples: u32,

    state: StateTracker,
    resources: ResourceManager,
    programs: ProgramCache,
    binder: UniformBinder,
    materials: HashMap<MaterialId, MaterialRecord>,
    render_list: RenderList,
    lights: LightState,
    shadow_maps: ShadowMaps,
    shadow_needs_update: bool,

    info: RenderInfo,
    phase: FramePhase,
    animation: AnimationLoop<Self>,
    shader_error_callback: Option<ShaderErrorCallback>,
    context_lost: bool,

    // Surface size and rectangles in CSS pixels.
    width: u32,
    height: u32,
    pixel_ratio: f32,
    viewport: Rect,
    scissor: Rect,
    scissor_test: bool,
    clear_color: Vec4,

    clipping_planes: Vec<Vec4>,
    clip_matrix: Mat4,
    global_clipping: Vec<f32>,

    render_target: Option<RenderTarget>,
    active_face: u32,
    current_target: Option<RenderTargetId>,
    surface_target: Option<RenderTarget>,
    transmission_target: Option<RenderTarget>,
    to_screen: bool,
    frame: FrameUniforms,
}

impl<D: Device> Renderer<D> {
    /// Create a renderer sized from the window section of `config`.
    pub fn new(device: D, config: &Config) -> Self {
        let render = config.render.clone();
        let capabilities = device.capabilities().clone();

        let precision = capabilities.clamp_precision(render.precision);
        if precision != render.precision {
            warn!(
                "Requested {:?} shader precision is not supported, using {:?}",
                render.precision, precision
            );
        }
        let samples = render.msaa_samples.clamp(1, capabilities.max_samples.max(1));
        if samples != render.msaa_samples {
            warn!(
                "Requested {} MSAA samples, device supports at most {}",
                render.msaa_samples, capabilities.max_samples
            );
        }
        let pixel_ratio = if render.pixel_ratio.is_finite() && render.pixel_ratio > 0.0 {
            render.pixel_ratio
        } else {
            1.0
        };
        let clear_color = Vec3::from_array(render.clear_color).extend(render.clear_alpha);
        let (width, height) = (config.window.width, config.window.height);

        let mut renderer = Self {
            device,
            config: render,
            precision,
            samples,
            state: StateTracker::new(capabilities.max_texture_units),
            resources: ResourceManager::new(),
            programs: ProgramCache::new(config.debug.check_shader_errors),
            binder: UniformBinder::new(),
            materials: HashMap::new(),
            render_list: RenderList::new(),
            lights: LightState::new(),
            shadow_maps: ShadowMaps::new(),
            shadow_needs_update: false,
            info: RenderInfo::new(),
            phase: FramePhase::Idle,
            animation: AnimationLoop::new(),
            shader_error_callback: None,
            context_lost: false,
            width,
            height,
            pixel_ratio,
            viewport: Rect::new(0, 0, width, height),
            scissor: Rect::new(0, 0, width, height),
            scissor_test: false,
            clear_color,
            clipping_planes: Vec::new(),
            clip_matrix: Mat4::IDENTITY,
            global_clipping: Vec::new(),
            render_target: None,
            active_face: 0,
            current_target: None,
            surface_target: None,
            transmission_target: None,
            to_screen: true,
            frame: FrameUniforms::default(),
        };
        let viewport = renderer.scaled(renderer.viewport);
        renderer.state.reset(&mut renderer.device, viewport);
        info!(
            "Renderer created: {}x{} @{}x, {} samples, {:?} precision",
            width, height, pixel_ratio, samples, precision
        );
        renderer
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn capabilities(&self) -> &Capabilities {
        self.device.capabilities()
    }

    pub fn config(&self) -> &RenderConfig {
        &self.config
    }

    /// Shader precision after clamping to the device.
    pub fn precision(&self) -> Precision {
        self.precision
    }

    pub fn phase(&self) -> FramePhase {
        self.phase
    }

    // -----------------------------------------------------------------------
    // Surface
    // -----------------------------------------------------------------------

    /// Resize the surface; viewport and scissor reset to cover it.
    pub fn set_size(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
        self.viewport = Rect::new(0, 0, width, height);
        self.scissor = Rect::new(0, 0, width, height);
        debug!(
            "Surface resized to {}x{} ({:?} device pixels)",
            width,
            height,
            self.drawing_buffer_size()
        );
    }

    /// Surface size in CSS pixels.
    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn set_pixel_ratio(&mut self, ratio: f32) -> Result<(), RenderError> {
        if !ratio.is_finite() || ratio <= 0.0 {
            return Err(RenderError::InvalidParameter(format!(
                "pixel ratio must be positive, got {ratio}"
            )));
        }
        self.pixel_ratio = ratio;
        self.set_size(self.width, self.height);
        Ok(())
    }

    pub fn pixel_ratio(&self) -> f32 {
        self.pixel_ratio
    }

    /// Surface size in device pixels.
    pub fn drawing_buffer_size(&self) -> (u32, u32) {
        (
            (self.width as f32 * self.pixel_ratio).floor() as u32,
            (self.height as f32 * self.pixel_ratio).floor() as u32,
        )
    }

    /// Viewport on the surface, in CSS pixels.
    pub fn set_viewport(&mut self, viewport: Rect) {
        self.viewport = viewport;
    }

    pub fn viewport(&self) -> Rect {
        self.viewport
    }

    /// Scissor rectangle on the surface, in CSS pixels.
    pub fn set_scissor(&mut self, scissor: Rect) {
        self.scissor = scissor;
    }

    pub fn scissor(&self) -> Rect {
        self.scissor
    }

    pub fn set_scissor_test(&mut self, enabled: bool) {
        self.scissor_test = enabled;
    }

    pub fn set_clear_color(&mut self, color: Vec3, alpha: f32) {
        self.clear_color = color.extend(alpha);
    }

    pub fn clear_color(&self) -> Vec4 {
        self.clear_color
    }

    pub fn set_auto_clear(&mut self, enabled: bool) {
        self.config.auto_clear = enabled;
    }

    /// Clear the buffers of the current output.
    pub fn clear(&mut self, mask: ClearMask) {
        if mask.is_empty() || !self.check_context() {
            return;
        }
        self.ensure_surface_target();
        if self.bind_output() {
            self.clear_bound(mask, self.clear_color);
        }
    }

    /// Render into `target` instead of the surface.
    pub fn set_render_target(&mut self, target: Option<RenderTarget>) {
        self.render_target = target;
        self.active_face = 0;
    }

    /// Select the cube face of the current render target drawn into.
    pub fn set_active_cube_face(&mut self, face: u32) -> Result<(), RenderError> {
        let layers = self
            .render_target
            .as_ref()
            .map(|target| target.descriptor().dimension.layers())
            .unwrap_or(1);
        if face >= layers {
            return Err(RenderError::InvalidParameter(format!(
                "cube face {face} out of range for a target with {layers} layers"
            )));
        }
        self.active_face = face;
        Ok(())
    }

    pub fn render_target(&self) -> Option<&RenderTarget> {
        self.render_target.as_ref()
    }

    // -----------------------------------------------------------------------
    // Frame settings
    // -----------------------------------------------------------------------

    /// World-space planes `(normal, constant)` clipping every material.
    pub fn set_clipping_planes(&mut self, planes: Vec<Vec4>) {
        self.clipping_planes = planes;
    }

    pub fn clipping_planes(&self) -> &[Vec4] {
        &self.clipping_planes
    }

    /// Honor per-material clipping planes.
    pub fn set_local_clipping(&mut self, enabled: bool) {
        self.config.local_clipping = enabled;
    }

    pub fn set_tone_mapping(&mut self, tone_mapping: ToneMapping) {
        self.config.tone_mapping = tone_mapping;
    }

    pub fn set_tone_mapping_exposure(&mut self, exposure: f32) {
        self.config.tone_mapping_exposure = exposure;
    }

    pub fn set_output_encoding(&mut self, encoding: OutputEncoding) {
        self.config.output_encoding = encoding;
    }

    pub fn set_sort_objects(&mut self, sort: bool) {
        self.config.sort_objects = sort;
    }

    pub fn set_shadows_enabled(&mut self, enabled: bool) {
        self.config.shadows.enabled = enabled;
    }

    /// Re-render shadow maps every frame.
    pub fn set_shadow_auto_update(&mut self, auto_update: bool) {
        self.config.shadows.auto_update = auto_update;
    }

    /// Render shadow maps on the next frame even when auto update is off.
    pub fn request_shadow_update(&mut self) {
        self.shadow_needs_update = true;
    }

    pub fn shadow_needs_update(&self) -> bool {
        self.shadow_needs_update
    }

    pub fn set_shader_error_callback(&mut self, callback: Option<ShaderErrorCallback>) {
        self.shader_error_callback = callback;
    }

    // -----------------------------------------------------------------------
    // Statistics
    // -----------------------------------------------------------------------

    /// Frame counters plus current device memory.
    pub fn info(&self) -> RenderInfo {
        let memory = self.resources.memory();
        RenderInfo {
            memory: MemoryStats {
                programs: self.programs.count(),
                textures: memory.textures,
                geometries: memory.geometries,
                render_targets: memory.render_targets,
                bytes: memory.bytes,
            },
            ..self.info
        }
    }

    /// Toggle `auto_reset` or reset the counters manually.
    pub fn info_mut(&mut self) -> &mut RenderInfo {
        &mut self.info
    }

    /// Program last used to draw `material`.
    pub fn material_program(&self, material: &Material) -> Option<Arc<Program>> {
        self.materials
            .get(&material.id())
            .and_then(|record| record.last.clone())
    }

    /// Compile outcome of the program last used to draw `material`.
    pub fn material_diagnostics(&self, material: &Material) -> Option<ProgramDiagnostics> {
        self.material_program(material)
            .map(|program| program.diagnostics().clone())
    }

    // -----------------------------------------------------------------------
    // Animation
    // -----------------------------------------------------------------------

    /// Install the per-frame callback, or stop the loop with `None`.
    pub fn set_animation_loop(&mut self, callback: Option<FrameCallback<Self>>) {
        self.animation.set(callback);
    }

    pub fn is_animating(&self) -> bool {
        self.animation.is_running()
    }

    /// Run one animation frame. Returns whether a callback ran.
    pub fn tick(&mut self, time: f64) -> bool {
        animation::tick(self, animation_loop::<D>, time)
    }

    // -----------------------------------------------------------------------
    // Pre-warm
    // -----------------------------------------------------------------------

    /// Compile the programs `scene` needs when seen through `camera`, without
    /// drawing.
    pub fn compile(&mut self, scene: &Scene, camera: &Camera) -> Result<(), RenderError> {
        self.ensure_idle()?;
        if !self.check_context() {
            return Ok(());
        }
        let mut list = std::mem::take(&mut self.render_list);
        let mut scene_lights = Vec::new();
        build_render_list(scene, camera, &mut list, &mut scene_lights, false);
        self.lights.setup(
            &scene_lights,
            &camera.view_matrix(),
            self.config.shadows.enabled,
            self.config.shadows.map_size,
        );
        self.to_screen = self.render_target.is_none();
        for item in list.items() {
            let state = item.material.read();
            let instancing = item.geometry.data().instances.is_some();
            self.program_for(&item.material, &state.params, state.features, instancing);
        }
        list.reset();
        self.lights.reset();
        self.render_list = list;
        Ok(())
    }

    /// Upload `texture` now instead of on first use.
    pub fn init_texture(&mut self, texture: &Texture) -> Result<(), RenderError> {
        self.resources
            .texture(&mut self.device, &mut self.state, texture, None)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Disposal
    // -----------------------------------------------------------------------

    pub fn dispose_texture(&mut self, texture: &Texture) {
        self.binder.forget_texture(texture.id());
        self.resources
            .dispose_texture(&mut self.device, &mut self.state, texture.id());
    }

    pub fn dispose_geometry(&mut self, geometry: &Geometry) {
        self.resources
            .dispose_geometry(&mut self.device, &mut self.state, geometry.id());
    }

    pub fn dispose_render_target(&mut self, target: &RenderTarget) {
        for texture in target.textures().iter().chain(target.depth_texture()) {
            self.binder.forget_texture(texture.id());
        }
        self.resources
            .dispose_render_target(&mut self.device, &mut self.state, target);
    }

    /// Release the programs held by `material` and its shadow variants.
    pub fn dispose_material(&mut self, material: &Material) {
        self.release_material(material.id());
        for derived in self.shadow_maps.forget_material(material.id()) {
            self.release_material(derived.id());
        }
    }

    /// Delete every device object owned by the renderer and stop the
    /// animation loop. The renderer stays usable; resources are recreated on
    /// demand.
    pub fn dispose(&mut self) {
        self.animation.set(None);
        let (shadow_targets, _) = self.shadow_maps.drain();
        for target in shadow_targets {
            self.dispose_render_target(&target);
        }
        for target in [self.transmission_target.take(), self.surface_target.take()]
            .into_iter()
            .flatten()
        {
            self.dispose_render_target(&target);
        }
        self.materials.clear();
        self.binder.clear();
        self.programs.clear(&mut self.device, &mut self.state);
        self.resources.clear(&mut self.device, &mut self.state);
        self.render_list = RenderList::new();
        self.frame.textures.clear();
        info!("Renderer disposed");
    }

    // -----------------------------------------------------------------------
    // Frame
    // -----------------------------------------------------------------------

    /// Draw `scene` as seen by `camera` into the current output.
    pub fn render(&mut self, scene: &Scene, camera: &Camera) -> Result<(), RenderError> {
        self.ensure_idle()?;
        if !self.check_context() {
            return Ok(());
        }
        if self.info.auto_reset {
            self.info.reset();
        }
        self.render_frame(scene, camera);
        self.phase = FramePhase::Idle;
        self.info.frame += 1;
        Ok(())
    }

    fn render_frame(&mut self, scene: &Scene, camera: &Camera) {
        self.phase = FramePhase::BuildLists;
        let mut list = std::mem::take(&mut self.render_list);
        let mut scene_lights = Vec::new();
        build_render_list(
            scene,
            camera,
            &mut list,
            &mut scene_lights,
            self.config.sort_objects,
        );

        self.phase = FramePhase::SetupLights;
        self.frame.textures.clear();
        self.lights.setup(
            &scene_lights,
            &camera.view_matrix(),
            self.config.shadows.enabled,
            self.config.shadows.map_size,
        );
        self.render_shadow_maps(scene);
        self.frame.lights.clear();
        self.frame.lights.extend_from_slice(self.lights.words());
        self.use_camera(camera);
        self.ensure_surface_target();

        if list.transmissive().next().is_some() {
            self.phase = FramePhase::TransmissivePrepass;
            self.render_transmission_source(&list);
        }

        self.to_screen = self.render_target.is_none();
        if self.bind_output() {
            if self.config.auto_clear {
                let color = scene.background.unwrap_or(self.clear_color);
                self.clear_bound(ClearMask::ALL, color);
            }
            self.phase = FramePhase::OpaquePass;
            for item in list.opaque() {
                self.draw_item(item, &item.material);
            }
            self.phase = FramePhase::TransmissivePass;
            for item in list.transmissive() {
                self.draw_item(item, &item.material);
            }
            self.phase = FramePhase::TransparentPass;
            for item in list.transparent() {
                self.draw_item(item, &item.material);
            }
            self.phase = FramePhase::Present;
            self.present();
        }
        self.phase = FramePhase::Present;
        list.reset();
        self.lights.reset();
        self.render_list = list;
    }

    fn ensure_idle(&self) -> Result<(), RenderError> {
        if self.phase != FramePhase::Idle {
            return Err(RenderError::InvalidParameter(format!(
                "render called while a frame is in {:?}",
                self.phase
            )));
        }
        Ok(())
    }

    /// Track context loss and recovery. Returns whether the device is usable.
    fn check_context(&mut self) -> bool {
        if self.device.is_context_lost() {
            if !self.context_lost {
                self.handle_context_loss();
            }
            return false;
        }
        if self.context_lost {
            self.handle_context_restore();
        }
        true
    }

    fn handle_context_loss(&mut self) {
        warn!("Device context lost; dropping device resources until it is restored");
        self.context_lost = true;
        self.state.invalidate();
        self.resources.forget_all();
        self.programs.forget_all();
        self.binder.clear();
        self.materials.clear();
    }

    fn handle_context_restore(&mut self) {
        info!("Device context restored; resources will be recreated on demand");
        self.context_lost = false;
        let viewport = self.scaled(self.viewport);
        self.state.reset(&mut self.device, viewport);
    }

    fn scaled(&self, rect: Rect) -> Rect {
        let ratio = self.pixel_ratio;
        Rect::new(
            (rect.x as f32 * ratio).floor() as i32,
            (rect.y as f32 * ratio).floor() as i32,
            (rect.width as f32 * ratio).floor() as u32,
            (rect.height as f32 * ratio).floor() as u32,
        )
    }

    /// Bind the render target (or the surface) draws of the frame land in.
    fn bind_output(&mut self) -> bool {
        match self.render_target.clone() {
            Some(target) => {
                let full = full_rect(&target);
                self.bind_target(Some(&target), self.active_face, full, full, false)
            }
            None => {
                let viewport = self.scaled(self.viewport);
                let scissor = self.scaled(self.scissor);
                let surface = self.surface_target.clone();
                self.bind_target(surface.as_ref(), 0, viewport, scissor, self.scissor_test)
            }
        }
    }

    fn bind_target(
        &mut self,
        target: Option<&RenderTarget>,
        face: u32,
        viewport: Rect,
        scissor: Rect,
        scissor_test: bool,
    ) -> bool {
        if let Err(err) =
            self.resources
                .bind_render_target(&mut self.device, &mut self.state, target, face)
        {
            warn!(
                "Skipping render target {:?} for this frame: {err}",
                target.map(|target| target.descriptor().label)
            );
            return false;
        }
        self.current_target = target.map(RenderTarget::id);
        self.frame.drawing_buffer = match target {
            Some(target) => target.size(),
            None => self.drawing_buffer_size(),
        };
        self.state.set_viewport(&mut self.device, viewport);
        self.state.set_scissor(&mut self.device, scissor);
        self.state.set_scissor_test(&mut self.device, scissor_test);
        true
    }

    fn clear_bound(&mut self, mask: ClearMask, color: Vec4) {
        if mask.color {
            self.state.set_clear_color(&mut self.device, color.to_array());
            self.state
                .set_color_mask(&mut self.device, wgpu::ColorWrites::ALL);
        }
        if mask.depth {
            let mut depth = self.state.snapshot().depth.unwrap_or_default();
            depth.write = true;
            self.state.set_depth(&mut self.device, depth);
        }
        self.device.clear(mask);
    }

    /// Multisampled offscreen surface, resolved onto the real one at present.
    fn ensure_surface_target(&mut self) {
        if self.samples <= 1 {
            if let Some(target) = self.surface_target.take() {
                self.dispose_render_target(&target);
            }
            return;
        }
        let (width, height) = self.drawing_buffer_size();
        if width == 0 || height == 0 {
            return;
        }
        if let Some(target) = &self.surface_target {
            if target.size() != (width, height)
                && let Err(err) = target.set_size(width, height)
            {
                warn!("Could not resize the multisampled surface: {err}");
            }
            return;
        }
        let mut descriptor = RenderTargetDescriptor::new("surface", width, height);
        descriptor.samples = self.samples;
        match RenderTarget::new(descriptor, self.device.capabilities()) {
            Ok(target) => self.surface_target = Some(target),
            Err(err) => warn!("Rendering without MSAA: {err}"),
        }
    }

    fn present(&mut self) {
        if let Some(target) = self.render_target.clone() {
            self.resources
                .finish_render_target(&mut self.device, &mut self.state, &target);
            return;
        }
        if let Some(surface) = &self.surface_target
            && let Some(framebuffer) = self.resources.render_targets().framebuffer(surface.id())
        {
            let (width, height) = surface.size();
            self.device
                .blit_framebuffer(framebuffer, None, width, height, ClearMask::COLOR);
        }
    }

    /// Frame uniforms and view-space clipping planes for `camera`.
    fn use_camera(&mut self, camera: &Camera) {
        let view = camera.view_matrix();
        self.frame.view_matrix = view;
        self.frame.projection_matrix = camera.projection_matrix();
        self.frame.camera_position = camera.position;
        self.frame.exposure = self.config.tone_mapping_exposure;
        self.clip_matrix = view.inverse().transpose();
        self.global_clipping.clear();
        for plane in &self.clipping_planes {
            self.global_clipping
                .extend_from_slice(&(self.clip_matrix * *plane).to_array());
        }
        self.frame.clipping.clone_from(&self.global_clipping);
    }

    fn update_clipping(&mut self, params: &MaterialParams) {
        let local = self.config.local_clipping && !params.clipping_planes.is_empty();
        if !local && self.frame.clipping.len() == self.global_clipping.len() {
            return;
        }
        self.frame.clipping.clone_from(&self.global_clipping);
        if local {
            for plane in &params.clipping_planes {
                self.frame
                    .clipping
                    .extend_from_slice(&(self.clip_matrix * *plane).to_array());
            }
        }
    }

    // -----------------------------------------------------------------------
    // Shadows
    // -----------------------------------------------------------------------

    fn render_shadow_maps(&mut self, scene: &Scene) {
        let casters = self.lights.casters().to_vec();
        for target in self
            .shadow_maps
            .retain_lights(|light| casters.iter().any(|caster| caster.light == light))
        {
            self.dispose_render_target(&target);
        }
        if casters.is_empty() {
            return;
        }

        let update = self.config.shadows.auto_update || self.shadow_needs_update;
        self.shadow_needs_update = false;
        let mut items: Option<Vec<RenderItem>> = None;
        self.to_screen = false;

        for caster in &casters {
            let target = match self.shadow_maps.target(caster, self.device.capabilities()) {
                Ok(target) => target,
                Err(err) => {
                    warn!("Skipping shadow map of light {}: {err}", caster.light.0);
                    continue;
                }
            };
            let fresh = self
                .resources
                .render_targets()
                .framebuffer(target.id())
                .is_none();
            if update || fresh {
                let items = items.get_or_insert_with(|| shadow_casters(scene));
                self.render_shadow_map(caster, &target, items);
            }
            if let Some(depth) = target.depth_texture() {
                self.frame
                    .textures
                    .insert(caster.kind.uniform_name(caster.slot), depth.clone());
            }
        }
    }

    fn render_shadow_map(&mut self, caster: &ShadowCaster, target: &RenderTarget, items: &[RenderItem]) {
        let faces = match caster.kind {
            ShadowKind::Point => 6,
            ShadowKind::Directional | ShadowKind::Spot => 1,
        };
        let full = full_rect(target);
        for face in 0..faces {
            let camera = match caster.kind {
                ShadowKind::Point => cube_face_camera(&caster.camera, face as usize),
                ShadowKind::Directional | ShadowKind::Spot => caster.camera.clone(),
            };
            if !self.bind_target(Some(target), face, full, full, false) {
                return;
            }
            self.clear_bound(ClearMask::DEPTH, Vec4::ONE);
            self.use_camera(&camera);
            self.frame.shadow_caster = caster.camera.position.extend(caster.camera.far);

            let frustum = Frustum::from_view_projection(&camera.view_projection_matrix());
            for item in items {
                let visible = item
                    .geometry
                    .bounding_sphere()
                    .is_none_or(|sphere| frustum.intersects_sphere(&sphere.transformed(&item.world)));
                if !visible {
                    continue;
                }
                let material = self.shadow_maps.depth_material(&item.material, caster.kind);
                self.draw_item(item, &material);
            }
        }
        self.resources
            .finish_render_target(&mut self.device, &mut self.state, target);
    }

    // -----------------------------------------------------------------------
    // Transmission
    // -----------------------------------------------------------------------

    fn render_transmission_source(&mut self, list: &RenderList) {
        let Some(target) = self.transmission_target() else {
            return;
        };
        self.to_screen = false;
        let full = full_rect(&target);
        if !self.bind_target(Some(&target), 0, full, full, false) {
            return;
        }
        self.clear_bound(ClearMask::ALL, self.clear_color);
        for item in list.opaque() {
            self.draw_item(item, &item.material);
        }
        self.resources
            .finish_render_target(&mut self.device, &mut self.state, &target);
        if let Some(texture) = target.texture() {
            self.frame
                .textures
                .insert(TRANSMISSION_MAP.to_string(), texture.clone());
        }
    }

    fn transmission_target(&mut self) -> Option<RenderTarget> {
        let (width, height) = self.drawing_buffer_size();
        let scale = self.config.transmission_resolution_scale.max(0.0);
        let width = ((width as f32 * scale) as u32).max(1);
        let height = ((height as f32 * scale) as u32).max(1);

        if let Some(target) = &self.transmission_target {
            if let Err(err) = target.set_size(width, height) {
                warn!("Skipping transmission prepass: {err}");
                return None;
            }
            return Some(target.clone());
        }

        let capabilities = self.device.capabilities();
        let mut descriptor = RenderTargetDescriptor::new("transmission", width, height);
        descriptor.color_format = if capabilities.float_render_targets {
            wgpu::TextureFormat::Rgba16Float
        } else {
            wgpu::TextureFormat::Rgba8Unorm
        };
        descriptor.generate_mipmaps = true;
        match RenderTarget::new(descriptor, capabilities) {
            Ok(target) => {
                self.transmission_target = Some(target.clone());
                Some(target)
            }
            Err(err) => {
                warn!("Skipping transmission prepass: {err}");
                None
            }
        }
    }

    // -----------------------------------------------------------------------
    // Draw
    // -----------------------------------------------------------------------

    fn draw_item(&mut self, item: &RenderItem, material: &Material) {
        let state = material.read();
        let params = &state.params;
        let instancing = item.geometry.data().instances.is_some();
        let Some(program) = self.program_for(material, params, state.features, instancing) else {
            return;
        };
        self.state.use_program(&mut self.device, Some(program.handle()));
        self.apply_material_state(params, &item.world);
        if let Err(err) = self
            .resources
            .bind_geometry(&mut self.device, &mut self.state, &item.geometry)
        {
            warn!("Skipping draw of object {}: {err}", item.object_id.0);
            return;
        }

        let model_view = self.frame.view_matrix * item.world;
        let object = ObjectUniforms {
            model_matrix: item.world,
            normal_matrix: Mat3::from_mat4(model_view).inverse().transpose(),
            receive_shadow: item.receive_shadow,
        };
        self.update_clipping(params);
        let uploads = self.binder.bind(
            &mut self.device,
            &mut self.state,
            &mut self.resources,
            &DrawUniforms {
                program: &program,
                material: params,
                object: &object,
                frame: &self.frame,
                target: self.current_target,
            },
        );
        self.info.render.uniform_uploads += uploads as u32;

        let data = item.geometry.data();
        let Some((first, count)) = data.draw_span(item.group.as_ref()) else {
            return;
        };
        if count == 0 {
            return;
        }
        let command = DrawCommand {
            topology: data.topology,
            first,
            count,
            indexed: data.indices.is_some(),
            instances: data.instance_count(),
        };
        self.device.draw(&command);
        self.info
            .update(command.topology, command.count, command.instances);
    }

    fn apply_material_state(&mut self, params: &MaterialParams, world: &Mat4) {
        let blending = match params.blending {
            Blending::Normal if !params.transparent => Blending::None,
            blending => blending,
        };
        let color_mask = if params.color_write {
            wgpu::ColorWrites::ALL
        } else {
            wgpu::ColorWrites::empty()
        };
        self.state
            .set_blending(&mut self.device, blending, params.premultiplied_alpha);
        self.state.set_depth(&mut self.device, params.depth_state());
        self.state.set_stencil(&mut self.device, params.stencil);
        self.state
            .set_polygon_offset(&mut self.device, params.polygon_offset);
        self.state.set_color_mask(&mut self.device, color_mask);
        let face = match params.side {
            Side::Front => Some(wgpu::Face::Back),
            Side::Back => Some(wgpu::Face::Front),
            Side::Double => None,
        };
        // Mirrored transforms flip the winding.
        let front_face = if world.determinant() < 0.0 {
            wgpu::FrontFace::Cw
        } else {
            wgpu::FrontFace::Ccw
        };
        self.state
            .set_cull(&mut self.device, CullState { face, front_face });
    }

    // -----------------------------------------------------------------------
    // Programs
    // -----------------------------------------------------------------------

    fn program_context(&self, params: &MaterialParams, instancing: bool) -> ProgramContext {
        let local = if self.config.local_clipping {
            params.clipping_planes.len()
        } else {
            0
        };
        let (tone_mapping, output_encoding) = if self.to_screen {
            (self.config.tone_mapping, self.config.output_encoding)
        } else {
            (ToneMapping::None, OutputEncoding::Linear)
        };
        ProgramContext {
            lights: self.lights.counts(),
            clipping_planes: (self.clipping_planes.len() + local) as u32,
            instancing,
            tone_mapping,
            output_encoding,
            precision: self.precision,
            shadow_type: self.config.shadows.shadow_type,
        }
    }

    /// Program drawing `material` in the current frame context. A version
    /// change releases every program the material held.
    fn program_for(
        &mut self,
        material: &Material,
        params: &MaterialParams,
        features: MaterialFeatures,
        instancing: bool,
    ) -> Option<Arc<Program>> {
        let parameters = ProgramParameters::new(params, features, &self.program_context(params, instancing));
        let key = parameters.cache_key();
        let id = material.id();
        let version = material.version();

        if self
            .materials
            .get(&id)
            .is_some_and(|record| record.version != version)
        {
            self.release_material(id);
        }
        let record = self
            .materials
            .entry(id)
            .or_insert_with(|| MaterialRecord::new(version));
        if let Some(program) = record.programs.get(&key) {
            record.last = Some(Arc::clone(program));
            return Some(Arc::clone(program));
        }

        let label = if params.name.is_empty() {
            params.kind.name()
        } else {
            params.name.as_str()
        };
        let program = match self.programs.get_program(&mut self.device, &parameters, label) {
            Ok(program) => program,
            Err(err) => {
                warn!("Skipping draws with material '{label}': {err}");
                return None;
            }
        };
        record.programs.insert(key, Arc::clone(&program));
        record.last = Some(Arc::clone(&program));
        self.report_shader_errors();
        Some(program)
    }

    fn release_material(&mut self, id: MaterialId) {
        let Some(record) = self.materials.remove(&id) else {
            return;
        };
        for program in record.programs.into_values() {
            if self
                .programs
                .release_program(&mut self.device, &mut self.state, &program)
            {
                self.binder.forget_program(program.id());
            }
        }
    }

    fn report_shader_errors(&mut self) {
        let errors = self.programs.drain_errors();
        if let Some(callback) = &mut self.shader_error_callback {
            for error in &errors {
                callback(error);
            }
        }
    }
}

fn animation_loop<D: Device>(renderer: &mut Renderer<D>) -> &mut AnimationLoop<Renderer<D>> {
    &mut renderer.animation
}

fn full_rect(target: &RenderTarget) -> Rect {
    let (width, height) = target.size();
    Rect::new(0, 0, width, height)
}

/// Every shadow-casting draw of `scene`, unculled.
fn shadow_casters(scene: &Scene) -> Vec<RenderItem> {
    let mut items = Vec::new();
    scene.traverse_visible(|visit| {
        if let Some(mesh) = visit.node.as_mesh()
            && mesh.cast_shadow
        {
            mesh_items(&visit, mesh, 0.0, |item| items.push(item));
        }
    });
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceCall, HeadlessDevice};
    use crate::light::{Light, LightShadow};
    use crate::material::MaterialParams;
    use crate::scene::{Mesh, Node};

    fn renderer() -> Renderer<HeadlessDevice> {
        let mut config = Config::default();
        config.window.width = 64;
        config.window.height = 32;
        Renderer::new(HeadlessDevice::new(), &config)
    }

    fn camera() -> Camera {
        let mut camera = Camera::perspective(1.0, 2.0, 0.1, 100.0);
        camera.position = Vec3::new(0.0, 0.0, 5.0);
        camera
    }

    fn cube(material: Material) -> Node {
        Node::mesh(Mesh::new(Geometry::cuboid(1.0, 1.0, 1.0), material))
    }

    #[test]
    fn test_invalid_pixel_ratio_rejected() {
        let mut renderer = renderer();
        assert!(matches!(
            renderer.set_pixel_ratio(0.0),
            Err(RenderError::InvalidParameter(_))
        ));
        assert!(renderer.set_pixel_ratio(f32::NAN).is_err());
        assert_eq!(renderer.pixel_ratio(), 1.0);
    }

    #[test]
    fn test_drawing_buffer_size_floors() {
        let mut renderer = renderer();
        renderer.set_size(101, 51);
        renderer.set_pixel_ratio(1.5).unwrap();
        assert_eq!(renderer.drawing_buffer_size(), (151, 76));
    }

    #[test]
    fn test_render_walks_phases_back_to_idle() {
        let mut renderer = renderer();
        let mut scene = Scene::new();
        scene.add(cube(Material::new(MaterialParams::basic(Vec3::ONE))));
        renderer.render(&scene, &camera()).unwrap();
        assert_eq!(renderer.phase(), FramePhase::Idle);
        assert_eq!(renderer.info().frame, 1);
        assert_eq!(renderer.info().render.calls, 1);
        assert_eq!(renderer.info().render.triangles, 12);
    }

    #[test]
    fn test_present_releases_list_and_lights() {
        let mut renderer = renderer();
        let mut scene = Scene::new();
        scene.add(cube(Material::new(MaterialParams::lambert(Vec3::ONE))));
        scene.add(Node::light(
            Light::directional(Vec3::ONE, 1.0).with_shadow(LightShadow::default()),
        ));
        renderer.render(&scene, &camera()).unwrap();

        assert_eq!(renderer.info().render.calls, 1);
        assert!(renderer.render_list.is_empty());
        assert!(renderer.render_list.capacity() >= 1);
        assert_eq!(renderer.lights.counts(), Default::default());
        assert!(renderer.lights.casters().is_empty());
        assert!(renderer.lights.words().is_empty());
    }

    #[test]
    fn test_auto_clear_uses_scene_background() {
        let mut renderer = renderer();
        let mut scene = Scene::new();
        scene.background = Some(Vec4::new(0.2, 0.3, 0.4, 1.0));
        renderer.render(&scene, &camera()).unwrap();
        assert_eq!(
            renderer.device().current_state().clear_color,
            [0.2, 0.3, 0.4, 1.0]
        );
        assert_eq!(
            renderer
                .device()
                .count_calls(|call| matches!(call, DeviceCall::Clear(_))),
            1
        );
    }

    #[test]
    fn test_material_update_releases_old_program() {
        let mut renderer = renderer();
        let material = Material::new(MaterialParams::basic(Vec3::ONE));
        let mut scene = Scene::new();
        scene.add(cube(material.clone()));

        renderer.render(&scene, &camera()).unwrap();
        let before = renderer.material_program(&material).unwrap();
        material.update(|params| params.custom_cache_key = "variant".into());
        renderer.render(&scene, &camera()).unwrap();
        let after = renderer.material_program(&material).unwrap();

        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(before.used_times(), 0);
        assert_eq!(renderer.info().memory.programs, 1);
    }

    #[test]
    fn test_shadow_maps_follow_auto_update() {
        let mut renderer = renderer();
        renderer.set_shadow_auto_update(false);
        let mut scene = Scene::new();
        let mut mesh = Mesh::new(
            Geometry::cuboid(1.0, 1.0, 1.0),
            Material::new(MaterialParams::lambert(Vec3::ONE)),
        );
        mesh.cast_shadow = true;
        mesh.receive_shadow = true;
        scene.add(Node::mesh(mesh));
        let light = Light::directional(Vec3::ONE, 1.0).with_shadow(LightShadow {
            map_size: Some(64),
            ..Default::default()
        });
        scene.add(Node::light(light).with_translation(Vec3::new(2.0, 4.0, 3.0)));

        // First frame allocates and fills the map, the second reuses it.
        renderer.render(&scene, &camera()).unwrap();
        assert_eq!(renderer.info().render.calls, 2);
        renderer.render(&scene, &camera()).unwrap();
        assert_eq!(renderer.info().render.calls, 1);

        renderer.request_shadow_update();
        assert!(renderer.shadow_needs_update());
        renderer.render(&scene, &camera()).unwrap();
        assert_eq!(renderer.info().render.calls, 2);
        assert!(!renderer.shadow_needs_update());
    }

    #[test]
    fn test_context_loss_skips_frame_and_recovers() {
        let mut renderer = renderer();
        let mut scene = Scene::new();
        scene.add(cube(Material::new(MaterialParams::basic(Vec3::ONE))));
        renderer.render(&scene, &camera()).unwrap();

        renderer.device_mut().lose_context();
        renderer.render(&scene, &camera()).unwrap();
        assert_eq!(renderer.info().frame, 1);
        assert_eq!(renderer.info().memory.programs, 0);

        renderer.device_mut().restore_context();
        renderer.device_mut().clear_calls();
        renderer.render(&scene, &camera()).unwrap();
        assert_eq!(renderer.device().draw_calls(), 1);
        assert_eq!(renderer.info().memory.programs, 1);
    }

    #[test]
    fn test_dispose_releases_everything() {
        let mut renderer = renderer();
        let mut scene = Scene::new();
        scene.add(cube(Material::new(MaterialParams::basic(Vec3::ONE))));
        renderer.render(&scene, &camera()).unwrap();
        renderer.dispose();
        let memory = renderer.info().memory;
        assert_eq!(memory.programs, 0);
        assert_eq!(memory.geometries, 0);
        assert_eq!(renderer.device().live_programs(), 0);
        assert_eq!(renderer.device().live_buffers(), 0);
    }

    #[test]
    fn test_cube_face_requires_cube_target() {
        let mut renderer = renderer();
        let target = RenderTarget::new(
            RenderTargetDescriptor::new("flat", 8, 8),
            &Capabilities::default(),
        )
        .unwrap();
        renderer.set_render_target(Some(target));
        assert!(renderer.set_active_cube_face(0).is_ok());
        assert!(matches!(
            renderer.set_active_cube_face(3),
            Err(RenderError::InvalidParameter(_))
        ));
    }
}
