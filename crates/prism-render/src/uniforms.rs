//! Uniform values and the per-draw binder.
//!
//! [`UniformBinder::bind`] walks a program's reflected uniforms, resolves
//! each path against the frame, object and material, and uploads only the
//! values whose words differ from what that program last received. Texture
//! uniforms take units in location order starting from 0 on every draw.

use std::collections::{HashMap, HashSet};

use glam::{Mat3, Mat4, Vec2, Vec3, Vec4};
use log::warn;

use crate::device::{Device, UniformKind, UniformLocation};
use crate::material::MaterialParams;
use crate::program::{Program, ProgramId};
use crate::render_target::RenderTargetId;
use crate::resource::ResourceManager;
use crate::state::StateTracker;
use crate::texture::{Texture, TextureId};

/// A value a uniform can take.
#[derive(Debug, Clone)]
pub enum UniformValue {
    Float(f32),
    Vec2(Vec2),
    Vec3(Vec3),
    Vec4(Vec4),
    Int(i32),
    UInt(u32),
    Bool(bool),
    Mat3(Mat3),
    Mat4(Mat4),
    /// Raw floats, for arrays and blocks.
    Floats(Vec<f32>),
    Texture(Texture),
}

impl PartialEq for UniformValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (UniformValue::Texture(a), UniformValue::Texture(b)) => a.ptr_eq(b),
            (UniformValue::Texture(_), _) | (_, UniformValue::Texture(_)) => false,
            _ => self.words() == other.words() && std::mem::discriminant(self) == std::mem::discriminant(other),
        }
    }
}

impl UniformValue {
    /// Upload words; empty for textures.
    pub fn words(&self) -> Vec<u32> {
        let mut out = Vec::new();
        self.extend_words(&mut out);
        out
    }

    /// Append the upload words. Returns `false` for textures, which upload a
    /// unit index instead.
    fn extend_words(&self, out: &mut Vec<u32>) -> bool {
        match self {
            UniformValue::Float(v) => out.push(v.to_bits()),
            UniformValue::Vec2(v) => out.extend(v.to_array().map(f32::to_bits)),
            UniformValue::Vec3(v) => out.extend(v.to_array().map(f32::to_bits)),
            UniformValue::Vec4(v) => out.extend(v.to_array().map(f32::to_bits)),
            UniformValue::Int(v) => out.push(*v as u32),
            UniformValue::UInt(v) => out.push(*v),
            UniformValue::Bool(v) => out.push(u32::from(*v)),
            UniformValue::Mat3(m) => {
                // Columns are padded to vec4 in uniform buffers.
                for column in [m.x_axis, m.y_axis, m.z_axis] {
                    out.extend(column.extend(0.0).to_array().map(f32::to_bits));
                }
            }
            UniformValue::Mat4(m) => out.extend(m.to_cols_array().map(f32::to_bits)),
            UniformValue::Floats(values) => out.extend(values.iter().map(|v| v.to_bits())),
            UniformValue::Texture(_) => return false,
        }
        true
    }
}

/// Values shared by every draw of a pass.
#[derive(Debug, Clone, Default)]
pub struct FrameUniforms {
    pub view_matrix: Mat4,
    pub projection_matrix: Mat4,
    pub camera_position: Vec3,
    pub exposure: f32,
    /// Size of the current render target in device pixels.
    pub drawing_buffer: (u32, u32),
    /// Flattened light block.
    pub lights: Vec<f32>,
    /// Flattened clipping block (view-space planes).
    pub clipping: Vec<f32>,
    /// Light position and far distance while rendering a point shadow.
    pub shadow_caster: Vec4,
    /// Frame-owned textures by uniform name (shadow maps, transmission source).
    pub textures: HashMap<String, Texture>,
}

impl FrameUniforms {
    pub fn uniform(&self, leaf: &str) -> Option<UniformValue> {
        let value = match leaf {
            "view_matrix" => UniformValue::Mat4(self.view_matrix),
            "projection_matrix" => UniformValue::Mat4(self.projection_matrix),
            "camera_position" => UniformValue::Vec4(self.camera_position.extend(1.0)),
            "tone_mapping" => UniformValue::Vec4(Vec4::new(self.exposure, 0.0, 0.0, 0.0)),
            "drawing_buffer" => {
                let width = self.drawing_buffer.0.max(1) as f32;
                let height = self.drawing_buffer.1.max(1) as f32;
                UniformValue::Vec4(Vec4::new(width, height, 1.0 / width, 1.0 / height))
            }
            _ => return None,
        };
        Some(value)
    }
}

/// Per-object values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObjectUniforms {
    pub model_matrix: Mat4,
    /// Inverse transpose of the upper 3x3 of view * model.
    pub normal_matrix: Mat3,
    pub receive_shadow: bool,
}

impl Default for ObjectUniforms {
    fn default() -> Self {
        Self {
            model_matrix: Mat4::IDENTITY,
            normal_matrix: Mat3::IDENTITY,
            receive_shadow: false,
        }
    }
}

impl ObjectUniforms {
    pub fn uniform(&self, leaf: &str) -> Option<UniformValue> {
        let value = match leaf {
            "model_matrix" => UniformValue::Mat4(self.model_matrix),
            "normal_matrix" => UniformValue::Mat3(self.normal_matrix),
            "flags" => UniformValue::Vec4(Vec4::new(
                if self.receive_shadow { 1.0 } else { 0.0 },
                0.0,
                0.0,
                0.0,
            )),
            _ => return None,
        };
        Some(value)
    }
}

/// Everything one draw's uniforms are read from.
pub struct DrawUniforms<'a> {
    pub program: &'a Program,
    pub material: &'a MaterialParams,
    pub object: &'a ObjectUniforms,
    pub frame: &'a FrameUniforms,
    /// Render target being drawn into; its attachments are never sampled.
    pub target: Option<RenderTargetId>,
}

/// Per-program uniform diffing and upload.
#[derive(Default)]
pub struct UniformBinder {
    cache: HashMap<ProgramId, HashMap<UniformLocation, Vec<u32>>>,
    scratch: Vec<u32>,
    warned_units: HashSet<ProgramId>,
    warned_feedback: HashSet<TextureId>,
    warned_shape: HashSet<(ProgramId, UniformLocation)>,
}

impl UniformBinder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the uniforms of one draw. The program must already be in use.
    /// Returns the number of uploads issued.
    pub fn bind(
        &mut self,
        device: &mut dyn Device,
        state: &mut StateTracker,
        resources: &mut ResourceManager,
        draw: &DrawUniforms<'_>,
    ) -> usize {
        let Self {
            cache,
            scratch,
            warned_units,
            warned_feedback,
            warned_shape,
        } = self;
        let program_id = draw.program.id();
        let cache = cache.entry(program_id).or_default();
        let max_units = device.capabilities().max_texture_units;
        let mut next_unit = 0u32;
        let mut uploads = 0;

        for info in draw.program.uniforms().iter() {
            scratch.clear();
            if info.kind.is_texture() {
                let unit = next_unit;
                next_unit += 1;
                if unit >= max_units {
                    if warned_units.insert(program_id) {
                        warn!(
                            "Program {} uses more than {} texture units; '{}' left unbound",
                            draw.program.cache_key(),
                            max_units,
                            info.path
                        );
                    }
                    continue;
                }
                let handle = texture_for(&info.path, draw, warned_feedback).and_then(|texture| {
                    resources
                        .texture(device, state, texture, None)
                        .map_err(|err| warn!("Texture '{}' unavailable: {}", info.path, err))
                        .ok()
                });
                state.bind_texture(device, unit, handle);
                scratch.push(unit);
            } else if !resolve_words(&info.path, draw, scratch) {
                continue;
            }

            let expected = info.kind.word_count();
            if scratch.len() != expected {
                if matches!(info.kind, UniformKind::Block(_)) {
                    scratch.resize(expected, 0);
                } else {
                    if warned_shape.insert((program_id, info.location)) {
                        warn!(
                            "Uniform '{}' expects {} words, value has {}",
                            info.path,
                            expected,
                            scratch.len()
                        );
                    }
                    continue;
                }
            }

            if cache
                .get(&info.location)
                .is_some_and(|cached| cached == scratch)
            {
                continue;
            }
            device.upload_uniform(&info.location, info.kind, scratch);
            match cache.get_mut(&info.location) {
                Some(cached) => cached.clone_from(scratch),
                None => {
                    cache.insert(info.location, scratch.clone());
                }
            }
            uploads += 1;
        }
        uploads
    }

    /// Drop the cached values of an evicted program.
    pub fn forget_program(&mut self, program: ProgramId) {
        self.cache.remove(&program);
        self.warned_units.remove(&program);
        self.warned_shape.retain(|(id, _)| *id != program);
    }

    /// Drop per-texture bookkeeping of a disposed texture.
    pub fn forget_texture(&mut self, texture: TextureId) {
        self.warned_feedback.remove(&texture);
    }

    /// Forget everything; the next bind uploads every value.
    pub fn clear(&mut self) {
        self.cache.clear();
        self.warned_units.clear();
        self.warned_feedback.clear();
        self.warned_shape.clear();
    }
}

/// Texture sampled by `path`, unless it feeds the target being drawn into.
fn texture_for<'a>(
    path: &str,
    draw: &DrawUniforms<'a>,
    warned: &mut HashSet<TextureId>,
) -> Option<&'a Texture> {
    let texture = draw
        .frame
        .textures
        .get(path)
        .or_else(|| draw.material.texture(path))?;
    if draw.target.is_some() && texture.render_target() == draw.target {
        if warned.insert(texture.id()) {
            warn!(
                "Texture '{}' is attached to the active render target; not sampling it",
                path
            );
        }
        return None;
    }
    Some(texture)
}

/// Append the words of a non-texture uniform. `false` when nothing provides it.
fn resolve_words(path: &str, draw: &DrawUniforms<'_>, out: &mut Vec<u32>) -> bool {
    let frame = draw.frame;
    match path {
        "lights" => {
            out.extend_from_slice(bytemuck::cast_slice(&frame.lights));
            return true;
        }
        "clipping" => {
            out.extend_from_slice(bytemuck::cast_slice(&frame.clipping));
            return true;
        }
        _ => {}
    }
    let builtin = match path.split_once('.') {
        Some(("frame", leaf)) => frame.uniform(leaf),
        Some(("object", leaf)) => draw.object.uniform(leaf),
        Some(("material", leaf)) => draw.material.uniform(leaf),
        Some(("shadow_caster", "reference_point")) => Some(UniformValue::Vec4(frame.shadow_caster)),
        _ => None,
    };
    match builtin {
        Some(value) => value.extend_words(out),
        None => draw
            .material
            .uniforms
            .get(path)
            .is_some_and(|value| value.extend_words(out)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Capabilities, DeviceCall, HeadlessDevice};
    use crate::program::ProgramCache;
    use crate::render_target::{RenderTarget, RenderTargetDescriptor};
    use crate::shader::{ProgramContext, ProgramParameters};
    use crate::texture::{ImageSource, TextureDescriptor};
    use std::sync::Arc;

    fn texture() -> Texture {
        Texture::new(TextureDescriptor::new("t", ImageSource::new(1, 1, vec![0; 4]))).unwrap()
    }

    struct Fixture {
        device: HeadlessDevice,
        state: StateTracker,
        resources: ResourceManager,
        programs: ProgramCache,
        binder: UniformBinder,
    }

    impl Fixture {
        fn new(capabilities: Capabilities) -> Self {
            let units = capabilities.max_texture_units;
            Self {
                device: HeadlessDevice::with_capabilities(capabilities),
                state: StateTracker::new(units),
                resources: ResourceManager::new(),
                programs: ProgramCache::new(true),
                binder: UniformBinder::new(),
            }
        }

        fn program(&mut self, material: &MaterialParams) -> Arc<Program> {
            let parameters =
                ProgramParameters::new(material, material.features(), &ProgramContext::default());
            self.programs
                .get_program(&mut self.device, &parameters, "test")
                .unwrap()
        }

        fn bind(
            &mut self,
            program: &Program,
            material: &MaterialParams,
            frame: &FrameUniforms,
            target: Option<RenderTargetId>,
        ) -> usize {
            let draw = DrawUniforms {
                program,
                material,
                object: &ObjectUniforms::default(),
                frame,
                target,
            };
            self.binder
                .bind(&mut self.device, &mut self.state, &mut self.resources, &draw)
        }
    }

    #[test]
    fn test_second_bind_uploads_nothing() {
        let mut fx = Fixture::new(Capabilities::default());
        let mut material = MaterialParams::basic(Vec3::ONE);
        material.map = Some(texture());
        let program = fx.program(&material);
        let frame = FrameUniforms::default();

        // frame (5) + object (3) + material (5) + diffuse_map
        assert_eq!(fx.bind(&program, &material, &frame, None), 14);
        assert_eq!(fx.bind(&program, &material, &frame, None), 0);
    }

    #[test]
    fn test_changed_value_uploads_once() {
        let mut fx = Fixture::new(Capabilities::default());
        let mut material = MaterialParams::basic(Vec3::ONE);
        let program = fx.program(&material);
        let frame = FrameUniforms::default();
        fx.bind(&program, &material, &frame, None);

        material.color = Vec3::new(1.0, 0.0, 0.0);
        fx.device.clear_calls();
        assert_eq!(fx.bind(&program, &material, &frame, None), 1);
        let uploaded: Vec<&Vec<u32>> = fx
            .device
            .calls()
            .iter()
            .filter_map(|call| match call {
                DeviceCall::UploadUniform { data, .. } => Some(data),
                _ => None,
            })
            .collect();
        assert_eq!(uploaded, vec![&vec![1.0f32.to_bits(), 0, 0, 1.0f32.to_bits()]]);
    }

    #[test]
    fn test_texture_units_start_at_zero() {
        let mut fx = Fixture::new(Capabilities::default());
        let mut material = MaterialParams::basic(Vec3::ONE);
        material.map = Some(texture());
        material.alpha_map = Some(texture());
        let program = fx.program(&material);
        fx.bind(&program, &material, &FrameUniforms::default(), None);

        let bound = &fx.device.current_state().textures;
        assert!(bound.contains_key(&0));
        assert!(bound.contains_key(&1));
        assert!(!bound.contains_key(&2));
    }

    #[test]
    fn test_units_over_limit_are_skipped() {
        let mut fx = Fixture::new(Capabilities {
            max_texture_units: 1,
            ..Capabilities::default()
        });
        let mut material = MaterialParams::basic(Vec3::ONE);
        material.map = Some(texture());
        material.alpha_map = Some(texture());
        let program = fx.program(&material);
        fx.bind(&program, &material, &FrameUniforms::default(), None);

        let texture_uploads = fx.device.count_calls(|call| {
            matches!(call, DeviceCall::UploadUniform { kind, .. } if kind.is_texture())
        });
        assert_eq!(texture_uploads, 1);
    }

    #[test]
    fn test_render_target_texture_not_sampled_while_bound() {
        let mut fx = Fixture::new(Capabilities::default());
        let target = RenderTarget::new(
            RenderTargetDescriptor::new("rt", 4, 4),
            &Capabilities::default(),
        )
        .unwrap();
        let mut material = MaterialParams::basic(Vec3::ONE);
        material.map = target.texture().cloned();
        let program = fx.program(&material);

        fx.bind(&program, &material, &FrameUniforms::default(), Some(target.id()));
        assert!(!fx.device.current_state().textures.contains_key(&0));

        fx.bind(&program, &material, &FrameUniforms::default(), None);
        assert!(fx.device.current_state().textures.contains_key(&0));
    }

    #[test]
    fn test_forget_texture_drops_feedback_warning() {
        let mut fx = Fixture::new(Capabilities::default());
        let target = RenderTarget::new(
            RenderTargetDescriptor::new("rt", 4, 4),
            &Capabilities::default(),
        )
        .unwrap();
        let mut material = MaterialParams::basic(Vec3::ONE);
        material.map = target.texture().cloned();
        let program = fx.program(&material);
        let id = target.texture().unwrap().id();

        fx.bind(&program, &material, &FrameUniforms::default(), Some(target.id()));
        assert!(fx.binder.warned_feedback.contains(&id));

        fx.binder.forget_texture(id);
        assert!(fx.binder.warned_feedback.is_empty());
    }

    #[test]
    fn test_mat3_pads_columns() {
        let words = UniformValue::Mat3(Mat3::IDENTITY).words();
        assert_eq!(words.len(), UniformKind::Mat3.word_count());
        assert_eq!(words[3], 0);
        assert_eq!(words[5], 1.0f32.to_bits());
    }

    #[test]
    fn test_value_equality() {
        let a = texture();
        assert_eq!(UniformValue::Texture(a.clone()), UniformValue::Texture(a));
        assert_ne!(UniformValue::Texture(texture()), UniformValue::Texture(texture()));
        assert_ne!(UniformValue::Float(0.0), UniformValue::UInt(0));
        assert_eq!(UniformValue::Vec2(Vec2::ONE), UniformValue::Vec2(Vec2::ONE));
    }
}
