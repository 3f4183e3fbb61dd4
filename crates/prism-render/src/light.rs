//! Lights and the per-frame light block.
//!
//! [`Light`] is the CPU description stored in scene nodes. [`LightState::setup`]
//! gathers the visible lights once per render, transforms them into view space
//! and flattens them into the word layout of the `lights` uniform block. The
//! per-type GPU structs below are `Pod` so the block is a plain byte cast.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};

use crate::camera::Camera;
use crate::scene::ObjectId;
use crate::shader::LightCounts;

/// Shadow parameters of a shadow-casting light.
#[derive(Debug, Clone, PartialEq)]
pub struct LightShadow {
    /// Square map size in texels; `None` uses the renderer default.
    pub map_size: Option<u32>,
    /// Depth offset subtracted before comparison.
    pub bias: f32,
    /// Filter radius in texels.
    pub radius: f32,
    pub near: f32,
    pub far: f32,
    /// Half extent of the orthographic shadow volume of directional lights.
    pub extent: f32,
}

impl Default for LightShadow {
    fn default() -> Self {
        Self {
            map_size: None,
            bias: 0.0,
            radius: 1.0,
            near: 0.5,
            far: 500.0,
            extent: 5.0,
        }
    }
}

/// Light type and its type-specific parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum LightKind {
    Ambient,
    /// Parallel light shining from the node position towards `target`.
    Directional { target: Vec3 },
    /// `distance` of 0 means no cutoff.
    Point { distance: f32, decay: f32 },
    Spot {
        target: Vec3,
        distance: f32,
        decay: f32,
        /// Half angle of the cone in radians.
        angle: f32,
        /// Fraction of the cone that fades out, in `[0, 1]`.
        penumbra: f32,
    },
    /// Sky color from above, `ground_color` from below.
    Hemisphere { ground_color: Vec3 },
    /// Rectangle in the node's XY plane emitting along +Z.
    RectArea { width: f32, height: f32 },
}

/// A light attached to a scene node.
#[derive(Debug, Clone, PartialEq)]
pub struct Light {
    pub kind: LightKind,
    pub color: Vec3,
    pub intensity: f32,
    pub cast_shadow: bool,
    pub shadow: LightShadow,
}

impl Light {
    pub fn new(kind: LightKind, color: Vec3, intensity: f32) -> Self {
        Self {
            kind,
            color,
            intensity,
            cast_shadow: false,
            shadow: LightShadow::default(),
        }
    }

    pub fn ambient(color: Vec3, intensity: f32) -> Self {
        Self::new(LightKind::Ambient, color, intensity)
    }

    pub fn directional(color: Vec3, intensity: f32) -> Self {
        Self::new(LightKind::Directional { target: Vec3::ZERO }, color, intensity)
    }

    pub fn point(color: Vec3, intensity: f32, distance: f32, decay: f32) -> Self {
        Self::new(LightKind::Point { distance, decay }, color, intensity)
    }

    pub fn spot(color: Vec3, intensity: f32, distance: f32, angle: f32, penumbra: f32) -> Self {
        Self::new(
            LightKind::Spot {
                target: Vec3::ZERO,
                distance,
                decay: 2.0,
                angle,
                penumbra,
            },
            color,
            intensity,
        )
    }

    pub fn hemisphere(sky_color: Vec3, ground_color: Vec3, intensity: f32) -> Self {
        Self::new(LightKind::Hemisphere { ground_color }, sky_color, intensity)
    }

    pub fn rect_area(color: Vec3, intensity: f32, width: f32, height: f32) -> Self {
        Self::new(LightKind::RectArea { width, height }, color, intensity)
    }

    pub fn with_shadow(mut self, shadow: LightShadow) -> Self {
        self.cast_shadow = true;
        self.shadow = shadow;
        self
    }

    /// Only directional, point and spot lights render shadow maps.
    pub fn casts_shadow(&self) -> bool {
        self.cast_shadow
            && matches!(
                self.kind,
                LightKind::Directional { .. } | LightKind::Point { .. } | LightKind::Spot { .. }
            )
    }

    fn radiance(&self) -> Vec3 {
        self.color * self.intensity
    }
}

/// A visible light with its world transform.
#[derive(Debug, Clone, Copy)]
pub struct SceneLight<'a> {
    pub id: ObjectId,
    pub light: &'a Light,
    pub world: Mat4,
}

/// Shadow map flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShadowKind {
    Directional,
    Spot,
    /// Six-face distance cube.
    Point,
}

impl ShadowKind {
    /// Frame texture uniform the map of `slot` binds to.
    pub fn uniform_name(self, slot: u32) -> String {
        match self {
            ShadowKind::Directional => format!("directional_shadow_map_{slot}"),
            ShadowKind::Spot => format!("spot_shadow_map_{slot}"),
            ShadowKind::Point => format!("point_shadow_map_{slot}"),
        }
    }
}

/// One shadow map to render this frame.
#[derive(Debug, Clone)]
pub struct ShadowCaster {
    pub light: ObjectId,
    pub kind: ShadowKind,
    /// Index among the casters of the same kind.
    pub slot: u32,
    /// Light camera; for point lights the per-face orientation is applied by
    /// the shadow pass.
    pub camera: Camera,
    pub map_size: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct DirectionalLightGpu {
    /// View-space direction towards the light.
    direction: [f32; 4],
    color: [f32; 4],
    /// x = bias, y = radius, z = map size.
    shadow: [f32; 4],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct PointLightGpu {
    /// xyz = view-space position, w = cutoff distance.
    position: [f32; 4],
    /// xyz = radiance, w = decay.
    color: [f32; 4],
    shadow: [f32; 4],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct SpotLightGpu {
    position: [f32; 4],
    direction: [f32; 4],
    color: [f32; 4],
    /// x = cos outer angle, y = cos inner angle.
    cone: [f32; 4],
    shadow: [f32; 4],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct HemisphereLightGpu {
    direction: [f32; 4],
    sky_color: [f32; 4],
    ground_color: [f32; 4],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct RectAreaLightGpu {
    position: [f32; 4],
    half_width: [f32; 4],
    half_height: [f32; 4],
    color: [f32; 4],
}

/// Light block and shadow casters for one render.
#[derive(Debug, Default)]
pub struct LightState {
    counts: LightCounts,
    words: Vec<f32>,
    casters: Vec<ShadowCaster>,
    directional: Vec<DirectionalLightGpu>,
    point: Vec<PointLightGpu>,
    spot: Vec<SpotLightGpu>,
    hemisphere: Vec<HemisphereLightGpu>,
    rect_area: Vec<RectAreaLightGpu>,
}

impl LightState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counts(&self) -> LightCounts {
        self.counts
    }

    /// Flattened `lights` block.
    pub fn words(&self) -> &[f32] {
        &self.words
    }

    pub fn casters(&self) -> &[ShadowCaster] {
        &self.casters
    }

    /// Drop the frame's lights and casters, keeping allocations.
    pub fn reset(&mut self) {
        self.counts = LightCounts::default();
        self.words.clear();
        self.casters.clear();
        self.directional.clear();
        self.point.clear();
        self.spot.clear();
        self.hemisphere.clear();
        self.rect_area.clear();
    }

    /// Rebuild the block for `view`. Shadow-casting lights come first within
    /// their type so the shader can address their maps by index.
    pub fn setup(
        &mut self,
        lights: &[SceneLight<'_>],
        view: &Mat4,
        shadows_enabled: bool,
        default_map_size: u32,
    ) {
        self.reset();

        let mut ambient = Vec3::ZERO;
        let mut ordered: Vec<&SceneLight<'_>> = lights.iter().collect();
        let shadowed = |entry: &SceneLight<'_>| shadows_enabled && entry.light.casts_shadow();
        ordered.sort_by_key(|entry| !shadowed(*entry));

        let mut point_shadows = Vec::new();
        let mut directional_matrices = Vec::new();
        let mut spot_matrices = Vec::new();

        for entry in ordered {
            let light = entry.light;
            let position = entry.world.w_axis.truncate();
            let view_position = view.transform_point3(position);
            let radiance = light.radiance();
            let map_size = light.shadow.map_size.unwrap_or(default_map_size);
            let shadow_params = if shadowed(entry) {
                [light.shadow.bias, light.shadow.radius, map_size as f32, 0.0]
            } else {
                [0.0; 4]
            };

            match &light.kind {
                LightKind::Ambient => ambient += radiance,
                LightKind::Directional { target } => {
                    let direction = view_direction(view, position - *target);
                    self.directional.push(DirectionalLightGpu {
                        direction: direction.extend(0.0).to_array(),
                        color: radiance.extend(0.0).to_array(),
                        shadow: shadow_params,
                    });
                    self.counts.directional += 1;
                    if shadowed(entry) {
                        let mut camera = Camera::orthographic(
                            light.shadow.extent,
                            light.shadow.extent,
                            light.shadow.near,
                            light.shadow.far,
                        );
                        camera.position = position;
                        camera.look_at(*target, Vec3::Y);
                        directional_matrices.push(camera.view_projection_matrix());
                        self.push_caster(entry.id, ShadowKind::Directional, camera, map_size);
                        self.counts.directional_shadows += 1;
                    }
                }
                LightKind::Point { distance, decay } => {
                    self.point.push(PointLightGpu {
                        position: view_position.extend(*distance).to_array(),
                        color: radiance.extend(*decay).to_array(),
                        shadow: shadow_params,
                    });
                    self.counts.point += 1;
                    if shadowed(entry) {
                        let mut camera = Camera::perspective(
                            std::f32::consts::FRAC_PI_2,
                            1.0,
                            light.shadow.near,
                            light.shadow.far,
                        );
                        camera.position = position;
                        point_shadows.push(position.extend(light.shadow.far));
                        self.push_caster(entry.id, ShadowKind::Point, camera, map_size);
                        self.counts.point_shadows += 1;
                    }
                }
                LightKind::Spot {
                    target,
                    distance,
                    decay,
                    angle,
                    penumbra,
                } => {
                    let direction = view_direction(view, position - *target);
                    self.spot.push(SpotLightGpu {
                        position: view_position.extend(*distance).to_array(),
                        direction: direction.extend(0.0).to_array(),
                        color: radiance.extend(*decay).to_array(),
                        cone: [
                            angle.cos(),
                            (angle * (1.0 - penumbra.clamp(0.0, 1.0))).cos(),
                            0.0,
                            0.0,
                        ],
                        shadow: shadow_params,
                    });
                    self.counts.spot += 1;
                    if shadowed(entry) {
                        let far = if *distance > 0.0 {
                            *distance
                        } else {
                            light.shadow.far
                        };
                        let mut camera =
                            Camera::perspective(2.0 * angle, 1.0, light.shadow.near, far);
                        camera.position = position;
                        camera.look_at(*target, Vec3::Y);
                        spot_matrices.push(camera.view_projection_matrix());
                        self.push_caster(entry.id, ShadowKind::Spot, camera, map_size);
                        self.counts.spot_shadows += 1;
                    }
                }
                LightKind::Hemisphere { ground_color } => {
                    self.hemisphere.push(HemisphereLightGpu {
                        direction: view_direction(view, position).extend(0.0).to_array(),
                        sky_color: radiance.extend(0.0).to_array(),
                        ground_color: (*ground_color * light.intensity).extend(0.0).to_array(),
                    });
                    self.counts.hemisphere += 1;
                }
                LightKind::RectArea { width, height } => {
                    let half_width = entry.world.transform_vector3(Vec3::X * (width * 0.5));
                    let half_height = entry.world.transform_vector3(Vec3::Y * (height * 0.5));
                    self.rect_area.push(RectAreaLightGpu {
                        position: view_position.extend(1.0).to_array(),
                        half_width: view.transform_vector3(half_width).extend(0.0).to_array(),
                        half_height: view.transform_vector3(half_height).extend(0.0).to_array(),
                        color: radiance.extend(0.0).to_array(),
                    });
                    self.counts.rect_area += 1;
                }
            }
        }

        self.words.clear();
        self.words.extend_from_slice(&ambient.extend(0.0).to_array());
        self.words.extend_from_slice(bytemuck::cast_slice(self.directional.as_slice()));
        self.words.extend_from_slice(bytemuck::cast_slice(self.point.as_slice()));
        self.words.extend_from_slice(bytemuck::cast_slice(self.spot.as_slice()));
        self.words.extend_from_slice(bytemuck::cast_slice(self.hemisphere.as_slice()));
        self.words.extend_from_slice(bytemuck::cast_slice(self.rect_area.as_slice()));
        for matrix in directional_matrices.iter().chain(&spot_matrices) {
            self.words.extend_from_slice(&matrix.to_cols_array());
        }
        for reference in &point_shadows {
            self.words.extend_from_slice(&reference.to_array());
        }
    }

    fn push_caster(&mut self, light: ObjectId, kind: ShadowKind, camera: Camera, map_size: u32) {
        let slot = self.casters.iter().filter(|caster| caster.kind == kind).count() as u32;
        self.casters.push(ShadowCaster {
            light,
            kind,
            slot,
            camera,
            map_size,
        });
    }
}

/// Normalized view-space direction of a world-space vector.
fn view_direction(view: &Mat4, world: Vec3) -> Vec3 {
    view.transform_vector3(world).try_normalize().unwrap_or(Vec3::Z)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(lights: &[(Light, Vec3)], shadows: bool) -> LightState {
        let entries: Vec<SceneLight<'_>> = lights
            .iter()
            .enumerate()
            .map(|(index, (light, position))| SceneLight {
                id: ObjectId(index as u32),
                light,
                world: Mat4::from_translation(*position),
            })
            .collect();
        let mut state = LightState::new();
        state.setup(&entries, &Mat4::IDENTITY, shadows, 512);
        state
    }

    #[test]
    fn test_ambient_lights_sum() {
        let state = setup(
            &[
                (Light::ambient(Vec3::new(1.0, 0.0, 0.0), 0.5), Vec3::ZERO),
                (Light::ambient(Vec3::new(0.0, 1.0, 0.0), 0.25), Vec3::ZERO),
            ],
            false,
        );
        assert_eq!(&state.words()[..4], &[0.5, 0.25, 0.0, 0.0]);
        assert_eq!(state.counts().total(), 0);
    }

    #[test]
    fn test_block_size_matches_counts() {
        let state = setup(
            &[
                (Light::directional(Vec3::ONE, 1.0), Vec3::Y),
                (Light::point(Vec3::ONE, 1.0, 10.0, 2.0), Vec3::X),
                (Light::spot(Vec3::ONE, 1.0, 0.0, 0.5, 0.1), Vec3::Z),
                (Light::hemisphere(Vec3::ONE, Vec3::ZERO, 1.0), Vec3::Y),
                (Light::rect_area(Vec3::ONE, 1.0, 2.0, 1.0), Vec3::Y),
            ],
            false,
        );
        let counts = state.counts();
        assert_eq!(
            (counts.directional, counts.point, counts.spot, counts.hemisphere, counts.rect_area),
            (1, 1, 1, 1, 1)
        );
        assert_eq!(state.words().len(), 4 + 12 + 12 + 20 + 12 + 16);
    }

    #[test]
    fn test_shadow_casters_sort_first() {
        let state = setup(
            &[
                (Light::directional(Vec3::ONE, 1.0), Vec3::Y),
                (
                    Light::directional(Vec3::ONE, 1.0).with_shadow(LightShadow {
                        bias: 0.01,
                        ..Default::default()
                    }),
                    Vec3::X,
                ),
            ],
            true,
        );
        assert_eq!(state.counts().directional_shadows, 1);
        assert_eq!(state.casters().len(), 1);
        assert_eq!(state.casters()[0].light, ObjectId(1));
        assert_eq!(state.casters()[0].map_size, 512);
        // First directional entry carries the shadow parameters.
        assert_eq!(&state.words()[12..16], &[0.01, 1.0, 512.0, 0.0]);
        // Followed by one shadow matrix after both lights.
        assert_eq!(state.words().len(), 4 + 24 + 16);
    }

    #[test]
    fn test_shadows_disabled_drop_casters() {
        let light = Light::point(Vec3::ONE, 1.0, 0.0, 2.0).with_shadow(LightShadow::default());
        let state = setup(&[(light, Vec3::Y)], false);
        assert!(state.casters().is_empty());
        assert_eq!(state.counts().shadows(), 0);
        assert_eq!(state.words().len(), 4 + 12);
    }

    #[test]
    fn test_spot_cone_and_direction() {
        let angle = std::f32::consts::FRAC_PI_4;
        let mut light = Light::spot(Vec3::ONE, 2.0, 5.0, angle, 0.5);
        if let LightKind::Spot { target, .. } = &mut light.kind {
            *target = Vec3::ZERO;
        }
        let state = setup(&[(light, Vec3::new(0.0, 4.0, 0.0))], false);
        let words = state.words();
        // position, direction, color, cone
        assert_eq!(&words[4..8], &[0.0, 4.0, 0.0, 5.0]);
        assert_eq!(&words[8..11], &[0.0, 1.0, 0.0]);
        assert_eq!(&words[12..16], &[2.0, 2.0, 2.0, 2.0]);
        assert!((words[16] - angle.cos()).abs() < 1e-6);
        assert!((words[17] - (angle * 0.5).cos()).abs() < 1e-6);
    }

    #[test]
    fn test_point_shadow_reference_point() {
        let light = Light::point(Vec3::ONE, 1.0, 0.0, 2.0).with_shadow(LightShadow {
            far: 50.0,
            ..Default::default()
        });
        let state = setup(&[(light, Vec3::new(1.0, 2.0, 3.0))], true);
        let words = state.words();
        assert_eq!(&words[words.len() - 4..], &[1.0, 2.0, 3.0, 50.0]);
        assert_eq!(state.casters()[0].kind, ShadowKind::Point);
    }
}
