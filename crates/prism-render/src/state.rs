//! Redundant-state elimination in front of the raw device.
//!
//! [`StateTracker`] mirrors the device's fixed-function and binding state in a
//! [`GpuStateSnapshot`]. Each axis has one setter that compares the requested
//! value with the snapshot and only forwards the call to the [`Device`] on a
//! mismatch. An axis whose value is not known (after construction, after
//! [`StateTracker::invalidate`], or after the bound object was deleted) always
//! forwards.
//!
//! The snapshot must equal the device's real state; every state-setting call
//! in the pipeline therefore goes through the tracker.

use log::debug;

use crate::device::{
    BlendConfig, BufferHandle, CullState, DepthState, Device, FramebufferHandle, PolygonOffset,
    ProgramHandle, Rect, StencilState, TextureHandle, VertexBinding,
};

/// Blend mode requested by a material.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Blending {
    /// Blending disabled.
    None,
    /// Standard "over" compositing.
    #[default]
    Normal,
    Additive,
    Subtractive,
    Multiply,
    /// Explicit blend equation.
    Custom(CustomBlending),
}

/// A fully specified blend equation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CustomBlending {
    pub color: wgpu::BlendComponent,
    pub alpha: wgpu::BlendComponent,
    pub constant: [f32; 4],
}

impl Blending {
    /// Short stable name, used in program cache keys.
    pub fn key_name(&self) -> &'static str {
        match self {
            Blending::None => "none",
            Blending::Normal => "normal",
            Blending::Additive => "additive",
            Blending::Subtractive => "subtractive",
            Blending::Multiply => "multiply",
            Blending::Custom(_) => "custom",
        }
    }

    /// Resolve to the device blend equation. `None` disables blending.
    pub fn resolve(&self, premultiplied_alpha: bool) -> Option<BlendConfig> {
        use wgpu::{BlendComponent, BlendFactor as F, BlendOperation};

        let component = |src_factor, dst_factor| BlendComponent {
            src_factor,
            dst_factor,
            operation: BlendOperation::Add,
        };

        let (color, alpha) = match (self, premultiplied_alpha) {
            (Blending::None, _) => return None,
            (Blending::Custom(custom), _) => {
                return Some(BlendConfig {
                    state: wgpu::BlendState {
                        color: custom.color,
                        alpha: custom.alpha,
                    },
                    constant: custom.constant,
                });
            }
            (Blending::Normal, false) => (
                component(F::SrcAlpha, F::OneMinusSrcAlpha),
                component(F::One, F::OneMinusSrcAlpha),
            ),
            (Blending::Normal, true) => (
                component(F::One, F::OneMinusSrcAlpha),
                component(F::One, F::OneMinusSrcAlpha),
            ),
            (Blending::Additive, false) => (component(F::SrcAlpha, F::One), component(F::One, F::One)),
            (Blending::Additive, true) => (component(F::One, F::One), component(F::One, F::One)),
            (Blending::Subtractive, false) => (
                component(F::Zero, F::OneMinusSrc),
                component(F::Zero, F::One),
            ),
            (Blending::Subtractive, true) => (
                component(F::Zero, F::OneMinusSrc),
                component(F::Zero, F::OneMinusSrcAlpha),
            ),
            (Blending::Multiply, _) => (component(F::Zero, F::Src), component(F::Zero, F::SrcAlpha)),
        };

        Some(BlendConfig {
            state: wgpu::BlendState { color, alpha },
            constant: [0.0; 4],
        })
    }
}

/// Cached view of device state. `None` on an axis means "unknown".
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GpuStateSnapshot {
    pub program: Option<Option<ProgramHandle>>,
    pub blending: Option<Option<BlendConfig>>,
    pub depth: Option<DepthState>,
    pub stencil: Option<Option<StencilState>>,
    pub cull: Option<CullState>,
    pub polygon_offset: Option<Option<PolygonOffset>>,
    pub color_mask: Option<wgpu::ColorWrites>,
    pub viewport: Option<Rect>,
    pub scissor: Option<Rect>,
    pub scissor_test: Option<bool>,
    pub clear_color: Option<[f32; 4]>,
    pub framebuffer: Option<Option<FramebufferHandle>>,
    pub active_unit: Option<u32>,
    /// Per texture unit.
    pub textures: Vec<Option<Option<TextureHandle>>>,
    pub vertex_binding: Option<VertexBinding>,
}

/// Store `value` in `slot`, returning whether it differed.
fn update<T: PartialEq>(slot: &mut Option<T>, value: T) -> bool {
    if slot.as_ref() == Some(&value) {
        false
    } else {
        *slot = Some(value);
        true
    }
}

/// Idempotent front end for device state calls.
pub struct StateTracker {
    snapshot: GpuStateSnapshot,
    texture_units: usize,
}

impl StateTracker {
    /// Create a tracker with every axis unknown.
    pub fn new(texture_units: u32) -> Self {
        let texture_units = texture_units as usize;
        Self {
            snapshot: GpuStateSnapshot {
                textures: vec![None; texture_units],
                ..Default::default()
            },
            texture_units,
        }
    }

    pub fn snapshot(&self) -> &GpuStateSnapshot {
        &self.snapshot
    }

    /// Current viewport, if known.
    pub fn viewport(&self) -> Option<Rect> {
        self.snapshot.viewport
    }

    /// Current scissor rectangle, if known.
    pub fn scissor(&self) -> Option<Rect> {
        self.snapshot.scissor
    }

    /// Currently bound framebuffer, `Some(None)` for the presentable surface.
    pub fn framebuffer(&self) -> Option<Option<FramebufferHandle>> {
        self.snapshot.framebuffer
    }

    /// Mark every axis unknown without touching the device.
    pub fn invalidate(&mut self) {
        self.snapshot = GpuStateSnapshot {
            textures: vec![None; self.texture_units],
            ..Default::default()
        };
    }

    /// Mark every axis unknown, then apply a known-good default state.
    pub fn reset(&mut self, device: &mut dyn Device, viewport: Rect) {
        debug!("Resetting device state, viewport {:?}", viewport);
        self.invalidate();
        self.use_program(device, None);
        self.set_blend_config(device, None);
        self.set_depth(device, DepthState::default());
        self.set_stencil(device, None);
        self.set_cull(device, CullState::default());
        self.set_polygon_offset(device, None);
        self.set_color_mask(device, wgpu::ColorWrites::ALL);
        self.set_viewport(device, viewport);
        self.set_scissor(device, viewport);
        self.set_scissor_test(device, false);
        self.set_clear_color(device, [0.0, 0.0, 0.0, 1.0]);
        self.bind_framebuffer(device, None);
        for unit in (0..self.texture_units as u32).rev() {
            self.bind_texture(device, unit, None);
        }
    }

    pub fn use_program(&mut self, device: &mut dyn Device, program: Option<ProgramHandle>) -> bool {
        if !update(&mut self.snapshot.program, program) {
            return false;
        }
        device.use_program(program);
        true
    }

    /// Apply a material blend mode.
    pub fn set_blending(
        &mut self,
        device: &mut dyn Device,
        blending: Blending,
        premultiplied_alpha: bool,
    ) -> bool {
        self.set_blend_config(device, blending.resolve(premultiplied_alpha))
    }

    pub fn set_blend_config(&mut self, device: &mut dyn Device, blend: Option<BlendConfig>) -> bool {
        if !update(&mut self.snapshot.blending, blend) {
            return false;
        }
        device.set_blend(blend.as_ref());
        true
    }

    pub fn set_depth(&mut self, device: &mut dyn Device, depth: DepthState) -> bool {
        if !update(&mut self.snapshot.depth, depth) {
            return false;
        }
        device.set_depth(&depth);
        true
    }

    pub fn set_stencil(&mut self, device: &mut dyn Device, stencil: Option<StencilState>) -> bool {
        if !update(&mut self.snapshot.stencil, stencil) {
            return false;
        }
        device.set_stencil(stencil.as_ref());
        true
    }

    pub fn set_cull(&mut self, device: &mut dyn Device, cull: CullState) -> bool {
        if !update(&mut self.snapshot.cull, cull) {
            return false;
        }
        device.set_cull(&cull);
        true
    }

    pub fn set_polygon_offset(
        &mut self,
        device: &mut dyn Device,
        offset: Option<PolygonOffset>,
    ) -> bool {
        if !update(&mut self.snapshot.polygon_offset, offset) {
            return false;
        }
        device.set_polygon_offset(offset.as_ref());
        true
    }

    pub fn set_color_mask(&mut self, device: &mut dyn Device, mask: wgpu::ColorWrites) -> bool {
        if !update(&mut self.snapshot.color_mask, mask) {
            return false;
        }
        device.set_color_mask(mask);
        true
    }

    pub fn set_viewport(&mut self, device: &mut dyn Device, rect: Rect) -> bool {
        if !update(&mut self.snapshot.viewport, rect) {
            return false;
        }
        device.set_viewport(&rect);
        true
    }

    pub fn set_scissor(&mut self, device: &mut dyn Device, rect: Rect) -> bool {
        if !update(&mut self.snapshot.scissor, rect) {
            return false;
        }
        device.set_scissor(&rect);
        true
    }

    pub fn set_scissor_test(&mut self, device: &mut dyn Device, enabled: bool) -> bool {
        if !update(&mut self.snapshot.scissor_test, enabled) {
            return false;
        }
        device.set_scissor_test(enabled);
        true
    }

    pub fn set_clear_color(&mut self, device: &mut dyn Device, color: [f32; 4]) -> bool {
        if !update(&mut self.snapshot.clear_color, color) {
            return false;
        }
        device.set_clear_color(color);
        true
    }

    pub fn bind_framebuffer(
        &mut self,
        device: &mut dyn Device,
        framebuffer: Option<FramebufferHandle>,
    ) -> bool {
        if !update(&mut self.snapshot.framebuffer, framebuffer) {
            return false;
        }
        device.bind_framebuffer(framebuffer);
        true
    }

    /// Select the active texture unit.
    pub fn active_texture(&mut self, device: &mut dyn Device, unit: u32) -> bool {
        if !update(&mut self.snapshot.active_unit, unit) {
            return false;
        }
        device.active_texture(unit);
        true
    }

    /// Bind `texture` on `unit`, switching the active unit only when the binding changes.
    pub fn bind_texture(
        &mut self,
        device: &mut dyn Device,
        unit: u32,
        texture: Option<TextureHandle>,
    ) -> bool {
        let index = unit as usize;
        if index >= self.snapshot.textures.len() {
            self.snapshot.textures.resize(index + 1, None);
        }
        if self.snapshot.textures[index] == Some(texture) {
            return false;
        }
        self.active_texture(device, unit);
        self.snapshot.textures[index] = Some(texture);
        device.bind_texture(texture);
        true
    }

    pub fn bind_vertex_buffers(&mut self, device: &mut dyn Device, binding: &VertexBinding) -> bool {
        if self.snapshot.vertex_binding.as_ref() == Some(binding) {
            return false;
        }
        self.snapshot.vertex_binding = Some(binding.clone());
        device.bind_vertex_buffers(binding);
        true
    }

    // --- Deleted objects ---

    /// A texture is about to be deleted; units holding it become unknown.
    pub fn forget_texture(&mut self, texture: TextureHandle) {
        for slot in &mut self.snapshot.textures {
            if *slot == Some(Some(texture)) {
                *slot = None;
            }
        }
    }

    pub fn forget_framebuffer(&mut self, framebuffer: FramebufferHandle) {
        if self.snapshot.framebuffer == Some(Some(framebuffer)) {
            self.snapshot.framebuffer = None;
        }
    }

    pub fn forget_program(&mut self, program: ProgramHandle) {
        if self.snapshot.program == Some(Some(program)) {
            self.snapshot.program = None;
        }
    }

    pub fn forget_buffer(&mut self, buffer: BufferHandle) {
        let uses_buffer = self.snapshot.vertex_binding.as_ref().is_some_and(|binding| {
            binding.streams.iter().any(|stream| stream.buffer == buffer)
                || binding.index.is_some_and(|(index, _)| index == buffer)
        });
        if uses_buffer {
            self.snapshot.vertex_binding = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceCall, HeadlessDevice};

    #[test]
    fn test_set_blending_twice_issues_one_call() {
        let mut device = HeadlessDevice::new();
        let mut state = StateTracker::new(16);
        assert!(state.set_blending(&mut device, Blending::Additive, false));
        assert!(!state.set_blending(&mut device, Blending::Additive, false));
        assert_eq!(
            device.count_calls(|call| matches!(call, DeviceCall::SetBlend(_))),
            1
        );
    }

    #[test]
    fn test_blending_change_issues_call() {
        let mut device = HeadlessDevice::new();
        let mut state = StateTracker::new(16);
        state.set_blending(&mut device, Blending::Normal, false);
        state.set_blending(&mut device, Blending::Normal, true);
        state.set_blending(&mut device, Blending::None, true);
        assert_eq!(
            device.count_calls(|call| matches!(call, DeviceCall::SetBlend(_))),
            3
        );
        assert_eq!(device.current_state().blend, None);
    }

    #[test]
    fn test_unknown_axis_always_forwards() {
        let mut device = HeadlessDevice::new();
        let mut state = StateTracker::new(16);
        state.set_depth(&mut device, DepthState::default());
        state.invalidate();
        assert!(state.set_depth(&mut device, DepthState::default()));
        assert_eq!(
            device.count_calls(|call| matches!(call, DeviceCall::SetDepth(_))),
            2
        );
    }

    #[test]
    fn test_bind_texture_switches_unit_only_on_change() {
        let mut device = HeadlessDevice::new();
        let mut state = StateTracker::new(4);
        let tex = TextureHandle(7);
        state.bind_texture(&mut device, 2, Some(tex));
        state.bind_texture(&mut device, 2, Some(tex));
        assert_eq!(
            device.count_calls(|call| matches!(call, DeviceCall::ActiveTexture(_))),
            1
        );
        assert_eq!(
            device.count_calls(|call| matches!(call, DeviceCall::BindTexture(_))),
            1
        );
        assert_eq!(device.current_state().textures.get(&2), Some(&tex));
    }

    #[test]
    fn test_reset_restores_known_state() {
        let mut device = HeadlessDevice::new();
        let mut state = StateTracker::new(2);
        let viewport = Rect::new(0, 0, 64, 32);
        state.reset(&mut device, viewport);

        let snapshot = state.snapshot();
        assert_eq!(snapshot.viewport, Some(viewport));
        assert_eq!(snapshot.scissor_test, Some(false));
        assert_eq!(snapshot.blending, Some(None));
        assert_eq!(snapshot.textures, vec![Some(None), Some(None)]);
        assert_eq!(snapshot.active_unit, Some(0));

        device.clear_calls();
        state.set_depth(&mut device, DepthState::default());
        state.set_cull(&mut device, CullState::default());
        state.set_viewport(&mut device, viewport);
        assert!(device.calls().is_empty());
    }

    #[test]
    fn test_snapshot_matches_device() {
        let mut device = HeadlessDevice::new();
        let mut state = StateTracker::new(4);
        state.reset(&mut device, Rect::new(0, 0, 8, 8));
        state.set_blending(&mut device, Blending::Multiply, false);
        state.set_viewport(&mut device, Rect::new(1, 2, 3, 4));
        state.bind_framebuffer(&mut device, Some(FramebufferHandle(9)));

        let mirror = device.current_state();
        assert_eq!(state.snapshot().blending, Some(mirror.blend));
        assert_eq!(state.snapshot().viewport, mirror.viewport);
        assert_eq!(state.snapshot().framebuffer, Some(mirror.framebuffer));
    }

    #[test]
    fn test_forget_texture_marks_unit_unknown() {
        let mut device = HeadlessDevice::new();
        let mut state = StateTracker::new(4);
        let tex = TextureHandle(3);
        state.bind_texture(&mut device, 1, Some(tex));
        state.forget_texture(tex);
        assert_eq!(state.snapshot().textures[1], None);
        assert!(state.bind_texture(&mut device, 1, Some(tex)));
    }

    #[test]
    fn test_normal_blending_factors() {
        let config = Blending::Normal.resolve(false).unwrap();
        assert_eq!(config.state.color.src_factor, wgpu::BlendFactor::SrcAlpha);
        assert_eq!(config.state.color.dst_factor, wgpu::BlendFactor::OneMinusSrcAlpha);
        let premultiplied = Blending::Normal.resolve(true).unwrap();
        assert_eq!(premultiplied.state.color.src_factor, wgpu::BlendFactor::One);
        assert!(Blending::None.resolve(false).is_none());
    }
}
