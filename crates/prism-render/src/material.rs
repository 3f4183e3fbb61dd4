//! Materials: surface parameters plus the render state they request.
//!
//! A [`Material`] is a shared handle. Mutations go through [`Material::update`],
//! which bumps the version and recomputes the [`MaterialFeatures`] bit-set once,
//! so per-draw code only compares integers to decide whether the program has to
//! be looked up again.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard};

use glam::{Vec3, Vec4};

use crate::device::{DepthState, PolygonOffset, StencilState, TextureDimension};
use crate::state::Blending;
use crate::sync;
use crate::texture::Texture;
use crate::uniforms::UniformValue;

static NEXT_MATERIAL_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a material. Also the tie-breaker when sorting opaque items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MaterialId(pub u64);

// ---------------------------------------------------------------------------
// Kinds
// ---------------------------------------------------------------------------

/// WGSL sources of a user-provided shader material.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShaderSource {
    pub vertex: String,
    pub fragment: String,
    /// Receive the scene light block.
    pub lights: bool,
}

/// Closed set of material kinds; each selects a shader template and lighting model.
#[derive(Debug, Clone, PartialEq)]
pub enum MaterialKind {
    /// Unlit color.
    Basic,
    /// Diffuse-only lighting.
    Lambert,
    /// Blinn-Phong lighting.
    Phong,
    /// Metallic-roughness PBR.
    Standard,
    /// PBR with transmission and index of refraction.
    Physical,
    /// Writes depth only (shadow maps).
    Depth,
    /// Writes normalized distance to a reference point (point light shadows).
    Distance,
    /// User WGSL run through the same template engine.
    Shader(Arc<ShaderSource>),
}

impl MaterialKind {
    /// Stable name used in cache keys.
    pub fn name(&self) -> &'static str {
        match self {
            MaterialKind::Basic => "basic",
            MaterialKind::Lambert => "lambert",
            MaterialKind::Phong => "phong",
            MaterialKind::Standard => "standard",
            MaterialKind::Physical => "physical",
            MaterialKind::Depth => "depth",
            MaterialKind::Distance => "distance",
            MaterialKind::Shader(_) => "shader",
        }
    }

    /// Whether the kind consumes scene lights.
    pub fn is_lit(&self) -> bool {
        match self {
            MaterialKind::Lambert
            | MaterialKind::Phong
            | MaterialKind::Standard
            | MaterialKind::Physical => true,
            MaterialKind::Shader(source) => source.lights,
            MaterialKind::Basic | MaterialKind::Depth | MaterialKind::Distance => false,
        }
    }

    fn is_pbr(&self) -> bool {
        matches!(self, MaterialKind::Standard | MaterialKind::Physical)
    }
}

/// Which faces a material renders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Side {
    #[default]
    Front,
    Back,
    Double,
}

// ---------------------------------------------------------------------------
// Features
// ---------------------------------------------------------------------------

/// Capability bit-set derived from material parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MaterialFeatures(u32);

impl MaterialFeatures {
    pub const MAP: Self = Self(1 << 0);
    pub const ALPHA_MAP: Self = Self(1 << 1);
    pub const NORMAL_MAP: Self = Self(1 << 2);
    pub const EMISSIVE_MAP: Self = Self(1 << 3);
    pub const ROUGHNESS_MAP: Self = Self(1 << 4);
    pub const METALNESS_MAP: Self = Self(1 << 5);
    pub const SPECULAR_MAP: Self = Self(1 << 6);
    pub const ENV_MAP: Self = Self(1 << 7);
    pub const ENV_MAP_CUBE: Self = Self(1 << 8);
    pub const VERTEX_COLORS: Self = Self(1 << 9);
    pub const ALPHA_TEST: Self = Self(1 << 10);
    pub const TRANSMISSION: Self = Self(1 << 11);
    pub const FLAT_SHADING: Self = Self(1 << 12);
    pub const DOUBLE_SIDED: Self = Self(1 << 13);
    pub const PREMULTIPLIED_ALPHA: Self = Self(1 << 14);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn set(&mut self, other: Self, enabled: bool) {
        if enabled {
            self.0 |= other.0;
        } else {
            self.0 &= !other.0;
        }
    }
}

impl std::ops::BitOr for MaterialFeatures {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// Everything a material can express.
#[derive(Debug, Clone)]
pub struct MaterialParams {
    pub kind: MaterialKind,
    pub name: String,

    pub color: Vec3,
    pub opacity: f32,
    pub transparent: bool,
    pub emissive: Vec3,
    pub emissive_intensity: f32,
    /// Phong specular color.
    pub specular: Vec3,
    pub shininess: f32,
    pub roughness: f32,
    pub metalness: f32,
    pub ior: f32,
    /// Fraction of light transmitted through the surface (physical only).
    pub transmission: f32,
    pub thickness: f32,
    /// Fragments with alpha below this are discarded; 0 disables the test.
    pub alpha_test: f32,
    pub env_map_intensity: f32,

    pub map: Option<Texture>,
    pub alpha_map: Option<Texture>,
    pub normal_map: Option<Texture>,
    pub emissive_map: Option<Texture>,
    pub roughness_map: Option<Texture>,
    pub metalness_map: Option<Texture>,
    pub specular_map: Option<Texture>,
    pub env_map: Option<Texture>,

    pub vertex_colors: bool,
    pub flat_shading: bool,

    pub side: Side,
    pub blending: Blending,
    pub premultiplied_alpha: bool,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_func: wgpu::CompareFunction,
    pub stencil: Option<StencilState>,
    pub polygon_offset: Option<PolygonOffset>,
    pub color_write: bool,
    /// World-space planes `(normal, constant)`; honoured when local clipping is on.
    pub clipping_planes: Vec<Vec4>,
    /// Apply the renderer tone mapping when drawing to the presentable surface.
    pub tone_mapped: bool,
    pub visible: bool,

    /// Uniforms for [`MaterialKind::Shader`], addressed by full uniform path.
    pub uniforms: BTreeMap<String, UniformValue>,
    /// Folded verbatim into the program cache key.
    pub custom_cache_key: String,
}

impl MaterialParams {
    pub fn new(kind: MaterialKind) -> Self {
        Self {
            kind,
            name: String::new(),
            color: Vec3::ONE,
            opacity: 1.0,
            transparent: false,
            emissive: Vec3::ZERO,
            emissive_intensity: 1.0,
            specular: Vec3::splat(0.067),
            shininess: 30.0,
            roughness: 1.0,
            metalness: 0.0,
            ior: 1.5,
            transmission: 0.0,
            thickness: 0.0,
            alpha_test: 0.0,
            env_map_intensity: 1.0,
            map: None,
            alpha_map: None,
            normal_map: None,
            emissive_map: None,
            roughness_map: None,
            metalness_map: None,
            specular_map: None,
            env_map: None,
            vertex_colors: false,
            flat_shading: false,
            side: Side::Front,
            blending: Blending::Normal,
            premultiplied_alpha: false,
            depth_test: true,
            depth_write: true,
            depth_func: wgpu::CompareFunction::LessEqual,
            stencil: None,
            polygon_offset: None,
            color_write: true,
            clipping_planes: Vec::new(),
            tone_mapped: true,
            visible: true,
            uniforms: BTreeMap::new(),
            custom_cache_key: String::new(),
        }
    }

    pub fn basic(color: Vec3) -> Self {
        Self {
            color,
            ..Self::new(MaterialKind::Basic)
        }
    }

    pub fn lambert(color: Vec3) -> Self {
        Self {
            color,
            ..Self::new(MaterialKind::Lambert)
        }
    }

    pub fn phong(color: Vec3, shininess: f32) -> Self {
        Self {
            color,
            shininess,
            ..Self::new(MaterialKind::Phong)
        }
    }

    pub fn standard(color: Vec3, roughness: f32, metalness: f32) -> Self {
        Self {
            color,
            roughness,
            metalness,
            ..Self::new(MaterialKind::Standard)
        }
    }

    pub fn physical(color: Vec3, roughness: f32, transmission: f32) -> Self {
        Self {
            color,
            roughness,
            transmission,
            ..Self::new(MaterialKind::Physical)
        }
    }

    pub fn shader(source: ShaderSource) -> Self {
        Self::new(MaterialKind::Shader(Arc::new(source)))
    }

    /// Depth state requested by the material.
    pub fn depth_state(&self) -> DepthState {
        DepthState {
            test: self.depth_test,
            write: self.depth_write,
            compare: self.depth_func,
        }
    }

    /// Value of a `material.<leaf>` uniform.
    pub fn uniform(&self, leaf: &str) -> Option<UniformValue> {
        let value = match leaf {
            "diffuse" => Vec4::from((self.color, self.opacity)),
            "emissive" => Vec4::from((self.emissive, self.emissive_intensity)),
            "specular" => Vec4::from((self.specular, self.shininess)),
            "pbr" => Vec4::new(self.roughness, self.metalness, self.ior, self.alpha_test),
            "extra" => Vec4::new(self.transmission, self.thickness, self.env_map_intensity, 0.0),
            _ => return None,
        };
        Some(UniformValue::Vec4(value))
    }

    /// Texture bound to a material sampler uniform.
    pub fn texture(&self, name: &str) -> Option<&Texture> {
        match name {
            "diffuse_map" => self.map.as_ref(),
            "alpha_map" => self.alpha_map.as_ref(),
            "normal_map" => self.normal_map.as_ref(),
            "emissive_map" => self.emissive_map.as_ref(),
            "roughness_map" => self.roughness_map.as_ref(),
            "metalness_map" => self.metalness_map.as_ref(),
            "specular_map" => self.specular_map.as_ref(),
            "env_map" => self.env_map.as_ref(),
            _ => match self.uniforms.get(name) {
                Some(UniformValue::Texture(texture)) => Some(texture),
                _ => None,
            },
        }
    }

    /// Derive the capability bit-set.
    pub fn features(&self) -> MaterialFeatures {
        let kind = &self.kind;
        let lit = kind.is_lit();
        let mut features = MaterialFeatures::empty();
        features.set(MaterialFeatures::MAP, self.map.is_some());
        features.set(MaterialFeatures::ALPHA_MAP, self.alpha_map.is_some());
        features.set(MaterialFeatures::NORMAL_MAP, lit && self.normal_map.is_some());
        features.set(MaterialFeatures::EMISSIVE_MAP, lit && self.emissive_map.is_some());
        features.set(
            MaterialFeatures::ROUGHNESS_MAP,
            kind.is_pbr() && self.roughness_map.is_some(),
        );
        features.set(
            MaterialFeatures::METALNESS_MAP,
            kind.is_pbr() && self.metalness_map.is_some(),
        );
        features.set(
            MaterialFeatures::SPECULAR_MAP,
            *kind == MaterialKind::Phong && self.specular_map.is_some(),
        );
        if let Some(env_map) = &self.env_map
            && !matches!(kind, MaterialKind::Depth | MaterialKind::Distance)
        {
            features.insert(MaterialFeatures::ENV_MAP);
            features.set(
                MaterialFeatures::ENV_MAP_CUBE,
                env_map.dimension() == TextureDimension::Cube,
            );
        }
        features.set(MaterialFeatures::VERTEX_COLORS, self.vertex_colors);
        features.set(MaterialFeatures::ALPHA_TEST, self.alpha_test > 0.0);
        features.set(
            MaterialFeatures::TRANSMISSION,
            *kind == MaterialKind::Physical && self.transmission > 0.0,
        );
        features.set(MaterialFeatures::FLAT_SHADING, lit && self.flat_shading);
        features.set(MaterialFeatures::DOUBLE_SIDED, self.side == Side::Double);
        features.set(MaterialFeatures::PREMULTIPLIED_ALPHA, self.premultiplied_alpha);
        features
    }
}

/// Parameters plus the bit-set computed from them.
#[derive(Debug)]
pub struct MaterialState {
    pub params: MaterialParams,
    pub features: MaterialFeatures,
}

struct MaterialInner {
    id: MaterialId,
    version: AtomicU64,
    state: RwLock<MaterialState>,
}

/// Shared handle to a material.
#[derive(Clone)]
pub struct Material {
    inner: Arc<MaterialInner>,
}

impl std::fmt::Debug for Material {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Material")
            .field("id", &self.inner.id)
            .field("version", &self.version())
            .finish()
    }
}

impl Material {
    pub fn new(params: MaterialParams) -> Self {
        let features = params.features();
        Self {
            inner: Arc::new(MaterialInner {
                id: MaterialId(NEXT_MATERIAL_ID.fetch_add(1, Ordering::Relaxed)),
                version: AtomicU64::new(1),
                state: RwLock::new(MaterialState { params, features }),
            }),
        }
    }

    pub fn id(&self) -> MaterialId {
        self.inner.id
    }

    /// Monotonic version; increases on every [`Material::update`].
    pub fn version(&self) -> u64 {
        self.inner.version.load(Ordering::Acquire)
    }

    /// Read access to parameters and features.
    pub fn read(&self) -> RwLockReadGuard<'_, MaterialState> {
        sync::read(&self.inner.state)
    }

    pub fn features(&self) -> MaterialFeatures {
        self.read().features
    }

    /// Mutate the parameters; recomputes features and bumps the version.
    pub fn update(&self, f: impl FnOnce(&mut MaterialParams)) {
        let mut state = sync::write(&self.inner.state);
        f(&mut state.params);
        state.features = state.params.features();
        self.inner.version.fetch_add(1, Ordering::AcqRel);
    }

    /// Transmissive materials render after the opaque list, sampling it.
    pub fn is_transmissive(&self) -> bool {
        self.read().features.contains(MaterialFeatures::TRANSMISSION)
    }

    pub fn is_transparent(&self) -> bool {
        self.read().params.transparent
    }

    pub fn ptr_eq(&self, other: &Material) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::texture::{ImageSource, TextureDescriptor};

    fn texture() -> Texture {
        Texture::new(TextureDescriptor::new("t", ImageSource::new(1, 1, vec![0; 4]))).unwrap()
    }

    #[test]
    fn test_update_bumps_version_and_features() {
        let material = Material::new(MaterialParams::standard(Vec3::ONE, 0.5, 0.0));
        let version = material.version();
        assert!(!material.features().contains(MaterialFeatures::MAP));

        material.update(|params| params.map = Some(texture()));
        assert!(material.version() > version);
        assert!(material.features().contains(MaterialFeatures::MAP));
    }

    #[test]
    fn test_features_respect_kind() {
        let mut params = MaterialParams::basic(Vec3::ONE);
        params.normal_map = Some(texture());
        params.roughness_map = Some(texture());
        params.transmission = 1.0;
        let features = params.features();
        assert!(!features.contains(MaterialFeatures::NORMAL_MAP));
        assert!(!features.contains(MaterialFeatures::ROUGHNESS_MAP));
        assert!(!features.contains(MaterialFeatures::TRANSMISSION));

        params.kind = MaterialKind::Physical;
        let features = params.features();
        assert!(features.contains(MaterialFeatures::NORMAL_MAP | MaterialFeatures::ROUGHNESS_MAP));
        assert!(features.contains(MaterialFeatures::TRANSMISSION));
    }

    #[test]
    fn test_env_map_cube_flag() {
        let cube = Texture::new(TextureDescriptor::new(
            "sky",
            ImageSource::cube(1, vec![0; 24]),
        ))
        .unwrap();
        let mut params = MaterialParams::phong(Vec3::ONE, 10.0);
        params.env_map = Some(cube);
        let features = params.features();
        assert!(features.contains(MaterialFeatures::ENV_MAP));
        assert!(features.contains(MaterialFeatures::ENV_MAP_CUBE));

        params.env_map = Some(texture());
        assert!(!params.features().contains(MaterialFeatures::ENV_MAP_CUBE));
    }

    #[test]
    fn test_uniform_leaves() {
        let mut params = MaterialParams::standard(Vec3::new(1.0, 0.5, 0.25), 0.3, 0.7);
        params.opacity = 0.5;
        assert_eq!(
            params.uniform("diffuse"),
            Some(UniformValue::Vec4(Vec4::new(1.0, 0.5, 0.25, 0.5)))
        );
        assert_eq!(
            params.uniform("pbr"),
            Some(UniformValue::Vec4(Vec4::new(0.3, 0.7, 1.5, 0.0)))
        );
        assert_eq!(params.uniform("unknown"), None);
    }

    #[test]
    fn test_transmissive_classification() {
        let glass = Material::new(MaterialParams::physical(Vec3::ONE, 0.1, 0.9));
        assert!(glass.is_transmissive());
        glass.update(|params| params.transmission = 0.0);
        assert!(!glass.is_transmissive());
    }

    #[test]
    fn test_feature_bits() {
        let mut features = MaterialFeatures::empty();
        features.insert(MaterialFeatures::ALPHA_TEST);
        assert_eq!(features.bits(), 1 << 10);
        features.set(MaterialFeatures::ALPHA_TEST, false);
        assert_eq!(features, MaterialFeatures::empty());
    }
}
