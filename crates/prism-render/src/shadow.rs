//! Shadow map storage.
//!
//! [`ShadowMaps`] owns one depth render target per shadow-casting light and
//! the derived depth / distance materials shadow passes draw with. Targets
//! are keyed by light node and resized when the light's map size changes;
//! derived materials are keyed by source material and re-synced whenever the
//! source version moves.

use std::collections::HashMap;

use glam::Vec3;

use crate::camera::Camera;
use crate::device::{Capabilities, TextureDimension};
use crate::error::RenderError;
use crate::light::{ShadowCaster, ShadowKind};
use crate::material::{Material, MaterialId, MaterialKind, MaterialParams};
use crate::render_target::{RenderTarget, RenderTargetDescriptor};
use crate::scene::ObjectId;
use crate::state::Blending;

/// Look direction and up vector of each cube face, in layer order
/// (+X, -X, +Y, -Y, +Z, -Z).
pub const CUBE_FACES: [(Vec3, Vec3); 6] = [
    (Vec3::X, Vec3::NEG_Y),
    (Vec3::NEG_X, Vec3::NEG_Y),
    (Vec3::Y, Vec3::Z),
    (Vec3::NEG_Y, Vec3::NEG_Z),
    (Vec3::Z, Vec3::NEG_Y),
    (Vec3::NEG_Z, Vec3::NEG_Y),
];

/// Camera for one face of a point light cube map.
pub fn cube_face_camera(base: &Camera, face: usize) -> Camera {
    let (direction, up) = CUBE_FACES[face % CUBE_FACES.len()];
    let mut camera = base.clone();
    camera.look_at(base.position + direction, up);
    camera
}

struct DerivedMaterial {
    source_version: u64,
    material: Material,
}

/// Per-light shadow targets plus derived shadow materials.
#[derive(Default)]
pub struct ShadowMaps {
    targets: HashMap<ObjectId, (ShadowKind, RenderTarget)>,
    derived: HashMap<(MaterialId, bool), DerivedMaterial>,
}

impl ShadowMaps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Depth target for `caster`, created or resized to its map size.
    pub fn target(
        &mut self,
        caster: &ShadowCaster,
        capabilities: &Capabilities,
    ) -> Result<RenderTarget, RenderError> {
        if let Some((kind, target)) = self.targets.get(&caster.light)
            && *kind == caster.kind
        {
            target.set_size(caster.map_size, caster.map_size)?;
            return Ok(target.clone());
        }
        let dimension = match caster.kind {
            ShadowKind::Point => TextureDimension::Cube,
            ShadowKind::Directional | ShadowKind::Spot => TextureDimension::D2,
        };
        let descriptor = RenderTargetDescriptor::depth_only(
            format!("shadow_map_{}", caster.light.0),
            caster.map_size,
            dimension,
        );
        let target = RenderTarget::new(descriptor, capabilities)?;
        self.targets
            .insert(caster.light, (caster.kind, target.clone()));
        Ok(target)
    }

    /// Depth (or distance, for point lights) material mirroring the parts of
    /// `source` that affect coverage: alpha maps, alpha test, side and clipping.
    pub fn depth_material(&mut self, source: &Material, kind: ShadowKind) -> Material {
        let distance = kind == ShadowKind::Point;
        let version = source.version();
        let entry = self
            .derived
            .entry((source.id(), distance))
            .or_insert_with(|| DerivedMaterial {
                source_version: 0,
                material: Material::new(MaterialParams::new(derived_kind(distance))),
            });
        if entry.source_version != version {
            let state = source.read();
            let params = &state.params;
            entry.material.update(|derived| sync_params(derived, params));
            entry.source_version = version;
        }
        entry.material.clone()
    }

    /// Drop the derived materials of `source`, returning them so their
    /// programs can be released.
    pub fn forget_material(&mut self, source: MaterialId) -> Vec<Material> {
        let mut removed = Vec::new();
        for distance in [false, true] {
            if let Some(derived) = self.derived.remove(&(source, distance)) {
                removed.push(derived.material);
            }
        }
        removed
    }

    /// Remove targets of lights that no longer cast shadows; the caller
    /// disposes the returned targets.
    pub fn retain_lights(&mut self, live: impl Fn(ObjectId) -> bool) -> Vec<RenderTarget> {
        let stale: Vec<ObjectId> = self
            .targets
            .keys()
            .copied()
            .filter(|id| !live(*id))
            .collect();
        stale
            .into_iter()
            .filter_map(|id| self.targets.remove(&id).map(|(_, target)| target))
            .collect()
    }

    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    /// Take every target and derived material.
    pub fn drain(&mut self) -> (Vec<RenderTarget>, Vec<Material>) {
        let targets = self.targets.drain().map(|(_, (_, target))| target).collect();
        let materials = self.derived.drain().map(|(_, derived)| derived.material).collect();
        (targets, materials)
    }
}

fn derived_kind(distance: bool) -> MaterialKind {
    if distance {
        MaterialKind::Distance
    } else {
        MaterialKind::Depth
    }
}

fn sync_params(derived: &mut MaterialParams, source: &MaterialParams) {
    derived.name = format!("{}_shadow", source.name);
    derived.map = source.map.clone();
    derived.alpha_map = source.alpha_map.clone();
    derived.alpha_test = source.alpha_test;
    derived.opacity = source.opacity;
    derived.side = source.side;
    derived.clipping_planes = source.clipping_planes.clone();
    derived.blending = Blending::None;
    derived.transparent = false;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::Camera;
    use crate::material::Side;

    fn caster(light: u32, kind: ShadowKind, map_size: u32) -> ShadowCaster {
        ShadowCaster {
            light: ObjectId(light),
            kind,
            slot: 0,
            camera: Camera::default(),
            map_size,
        }
    }

    #[test]
    fn test_target_reused_and_resized() {
        let caps = Capabilities::default();
        let mut maps = ShadowMaps::new();
        let first = maps.target(&caster(1, ShadowKind::Spot, 256), &caps).unwrap();
        let second = maps.target(&caster(1, ShadowKind::Spot, 512), &caps).unwrap();
        assert!(first.ptr_eq(&second));
        assert_eq!(second.size(), (512, 512));
        assert!(second.depth_texture().is_some());
    }

    #[test]
    fn test_point_light_uses_cube_target() {
        let caps = Capabilities::default();
        let mut maps = ShadowMaps::new();
        let target = maps.target(&caster(2, ShadowKind::Point, 128), &caps).unwrap();
        assert_eq!(
            target.depth_texture().map(|texture| texture.dimension()),
            Some(TextureDimension::Cube)
        );
    }

    #[test]
    fn test_derived_material_follows_source() {
        let mut maps = ShadowMaps::new();
        let source = Material::new(MaterialParams::lambert(Vec3::ONE));
        let derived = maps.depth_material(&source, ShadowKind::Directional);
        assert_eq!(derived.read().params.kind, MaterialKind::Depth);
        let version = derived.version();

        let again = maps.depth_material(&source, ShadowKind::Directional);
        assert!(again.ptr_eq(&derived));
        assert_eq!(again.version(), version);

        source.update(|params| {
            params.alpha_test = 0.5;
            params.side = Side::Double;
        });
        let synced = maps.depth_material(&source, ShadowKind::Directional);
        assert!(synced.version() > version);
        assert_eq!(synced.read().params.alpha_test, 0.5);
        assert_eq!(synced.read().params.side, Side::Double);
    }

    #[test]
    fn test_point_lights_get_distance_material() {
        let mut maps = ShadowMaps::new();
        let source = Material::new(MaterialParams::lambert(Vec3::ONE));
        let distance = maps.depth_material(&source, ShadowKind::Point);
        assert_eq!(distance.read().params.kind, MaterialKind::Distance);
        assert_eq!(maps.forget_material(source.id()).len(), 1);
    }

    #[test]
    fn test_retain_lights_returns_stale_targets() {
        let caps = Capabilities::default();
        let mut maps = ShadowMaps::new();
        maps.target(&caster(1, ShadowKind::Spot, 64), &caps).unwrap();
        maps.target(&caster(2, ShadowKind::Spot, 64), &caps).unwrap();
        let stale = maps.retain_lights(|id| id == ObjectId(1));
        assert_eq!(stale.len(), 1);
        assert_eq!(maps.target_count(), 1);
    }

    #[test]
    fn test_cube_faces_look_along_axes() {
        let base = Camera::perspective(std::f32::consts::FRAC_PI_2, 1.0, 0.1, 10.0);
        for (face, (direction, _)) in CUBE_FACES.iter().enumerate() {
            let camera = cube_face_camera(&base, face);
            assert!(camera.forward().abs_diff_eq(*direction, 1e-5));
        }
    }
}
