//! Logical geometry: vertex attributes, indices, draw range and groups.
//!
//! A [`Geometry`] is a shared handle; the resource manager uploads its buffers
//! on first draw and again whenever [`Geometry::version`] advances.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use glam::{Mat4, Vec3};

use crate::error::RenderError;
use crate::frustum::Sphere;
use crate::sync;

static NEXT_GEOMETRY_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GeometryId(pub u64);

/// Meaning of a vertex attribute; fixes its shader location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Semantic {
    Position,
    Normal,
    Uv,
    Color,
}

impl Semantic {
    /// Shader input location of this attribute.
    pub fn location(self) -> u32 {
        match self {
            Semantic::Position => 0,
            Semantic::Normal => 1,
            Semantic::Uv => 2,
            Semantic::Color => 3,
        }
    }

    /// Expected component count.
    pub fn components(self) -> u32 {
        match self {
            Semantic::Position | Semantic::Normal => 3,
            Semantic::Uv => 2,
            Semantic::Color => 4,
        }
    }
}

/// First shader location of the per-instance model matrix (four vec4 columns).
pub const INSTANCE_MATRIX_LOCATION: u32 = 4;

/// One vertex attribute stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub semantic: Semantic,
    pub data: Vec<f32>,
}

impl Attribute {
    pub fn new(semantic: Semantic, data: Vec<f32>) -> Self {
        Self { semantic, data }
    }

    pub fn count(&self) -> u32 {
        (self.data.len() / self.semantic.components() as usize) as u32
    }
}

/// A sub-range drawn with one material of a multi-material mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeometryGroup {
    pub start: u32,
    pub count: u32,
    pub material_index: usize,
}

/// Range of elements (indices, or vertices when non-indexed) to draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrawRange {
    pub start: u32,
    /// `None` draws to the end.
    pub count: Option<u32>,
}

/// Mutable geometry contents.
#[derive(Debug, Clone, PartialEq)]
pub struct GeometryData {
    pub attributes: Vec<Attribute>,
    pub indices: Option<Vec<u32>>,
    pub groups: Vec<GeometryGroup>,
    pub draw_range: DrawRange,
    pub topology: wgpu::PrimitiveTopology,
    /// Per-instance model matrices; `Some` draws instanced.
    pub instances: Option<Vec<Mat4>>,
}

impl GeometryData {
    /// Triangle list from positions and optional attributes.
    pub fn new(positions: Vec<f32>) -> Self {
        Self {
            attributes: vec![Attribute::new(Semantic::Position, positions)],
            indices: None,
            groups: Vec::new(),
            draw_range: DrawRange::default(),
            topology: wgpu::PrimitiveTopology::TriangleList,
            instances: None,
        }
    }

    pub fn with_attribute(mut self, semantic: Semantic, data: Vec<f32>) -> Self {
        self.attributes.retain(|attribute| attribute.semantic != semantic);
        self.attributes.push(Attribute::new(semantic, data));
        self
    }

    pub fn with_indices(mut self, indices: Vec<u32>) -> Self {
        self.indices = Some(indices);
        self
    }

    pub fn with_topology(mut self, topology: wgpu::PrimitiveTopology) -> Self {
        self.topology = topology;
        self
    }

    pub fn attribute(&self, semantic: Semantic) -> Option<&Attribute> {
        self.attributes
            .iter()
            .find(|attribute| attribute.semantic == semantic)
    }

    pub fn has(&self, semantic: Semantic) -> bool {
        self.attribute(semantic).is_some()
    }

    pub fn vertex_count(&self) -> u32 {
        self.attribute(Semantic::Position)
            .map(Attribute::count)
            .unwrap_or(0)
    }

    /// Number of drawable elements: indices when indexed, else vertices.
    pub fn element_count(&self) -> u32 {
        match &self.indices {
            Some(indices) => indices.len() as u32,
            None => self.vertex_count(),
        }
    }

    pub fn instance_count(&self) -> u32 {
        self.instances.as_ref().map_or(1, |instances| instances.len() as u32)
    }

    /// Resolve the element range for a draw, intersecting the draw range with
    /// an optional group. `None` when nothing is left to draw.
    pub fn draw_span(&self, group: Option<&GeometryGroup>) -> Option<(u32, u32)> {
        let total = self.element_count() as u64;
        let mut start = self.draw_range.start as u64;
        let mut end = match self.draw_range.count {
            Some(count) => start + count as u64,
            None => u64::MAX,
        };
        if let Some(group) = group {
            start = start.max(group.start as u64);
            end = end.min(group.start as u64 + group.count as u64);
        }
        end = end.min(total);
        if end <= start {
            return None;
        }
        Some((start as u32, (end - start) as u32))
    }

    fn validate(&self) -> Result<(), RenderError> {
        let invalid = |message: String| Err(RenderError::InvalidParameter(message));
        if !self.has(Semantic::Position) {
            return invalid("geometry has no position attribute".to_string());
        }
        let vertex_count = self.vertex_count();
        for attribute in &self.attributes {
            let components = attribute.semantic.components() as usize;
            if attribute.data.len() % components != 0 {
                return invalid(format!(
                    "{:?} attribute length {} is not a multiple of {components}",
                    attribute.semantic,
                    attribute.data.len()
                ));
            }
            if attribute.count() != vertex_count {
                return invalid(format!(
                    "{:?} attribute has {} elements, positions have {vertex_count}",
                    attribute.semantic,
                    attribute.count()
                ));
            }
        }
        if let Some(indices) = &self.indices
            && let Some(&max) = indices.iter().max()
            && max >= vertex_count
        {
            return invalid(format!(
                "index {max} out of range for {vertex_count} vertices"
            ));
        }
        Ok(())
    }

    fn bounding_sphere(&self) -> Option<Sphere> {
        let positions = &self.attribute(Semantic::Position)?.data;
        let local = Sphere::from_points(
            positions
                .chunks_exact(3)
                .map(|p| Vec3::new(p[0], p[1], p[2])),
        )?;
        match &self.instances {
            None => Some(local),
            Some(instances) => {
                let spheres: Vec<Sphere> = instances
                    .iter()
                    .map(|matrix| local.transformed(matrix))
                    .collect();
                let hull = Sphere::from_points(spheres.iter().map(|s| s.center))?;
                let radius = spheres
                    .iter()
                    .map(|s| s.center.distance(hull.center) + s.radius)
                    .fold(0.0f32, f32::max);
                Some(Sphere::new(hull.center, radius))
            }
        }
    }
}

struct GeometryInner {
    id: GeometryId,
    version: AtomicU64,
    data: RwLock<GeometryData>,
    bounding_sphere: RwLock<Option<Sphere>>,
}

/// Shared handle to geometry.
#[derive(Clone)]
pub struct Geometry {
    inner: Arc<GeometryInner>,
}

impl std::fmt::Debug for Geometry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Geometry")
            .field("id", &self.inner.id)
            .field("version", &self.version())
            .finish()
    }
}

impl Geometry {
    pub fn new(data: GeometryData) -> Result<Self, RenderError> {
        data.validate()?;
        let sphere = data.bounding_sphere();
        Ok(Self {
            inner: Arc::new(GeometryInner {
                id: GeometryId(NEXT_GEOMETRY_ID.fetch_add(1, Ordering::Relaxed)),
                version: AtomicU64::new(1),
                data: RwLock::new(data),
                bounding_sphere: RwLock::new(sphere),
            }),
        })
    }

    pub fn id(&self) -> GeometryId {
        self.inner.id
    }

    pub fn version(&self) -> u64 {
        self.inner.version.load(Ordering::Acquire)
    }

    /// Read access to the contents.
    pub fn data(&self) -> std::sync::RwLockReadGuard<'_, GeometryData> {
        sync::read(&self.inner.data)
    }

    /// Local-space bounding sphere (covering all instances when instanced).
    pub fn bounding_sphere(&self) -> Option<Sphere> {
        *sync::read(&self.inner.bounding_sphere)
    }

    /// Mutate the contents. The change is rejected, and nothing is modified,
    /// when the result is inconsistent.
    pub fn update(&self, f: impl FnOnce(&mut GeometryData)) -> Result<(), RenderError> {
        let mut data = sync::write(&self.inner.data);
        let mut updated = data.clone();
        f(&mut updated);
        updated.validate()?;
        *sync::write(&self.inner.bounding_sphere) = updated.bounding_sphere();
        *data = updated;
        self.inner.version.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    pub fn ptr_eq(&self, other: &Geometry) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // --- Primitives ---

    /// Axis-aligned box centered on the origin, 24 vertices with normals and uvs.
    pub fn cuboid(width: f32, height: f32, depth: f32) -> Self {
        let (hx, hy, hz) = (width * 0.5, height * 0.5, depth * 0.5);
        // (normal, u axis, v axis) per face
        let faces = [
            (Vec3::X, Vec3::NEG_Z, Vec3::Y),
            (Vec3::NEG_X, Vec3::Z, Vec3::Y),
            (Vec3::Y, Vec3::X, Vec3::NEG_Z),
            (Vec3::NEG_Y, Vec3::X, Vec3::Z),
            (Vec3::Z, Vec3::X, Vec3::Y),
            (Vec3::NEG_Z, Vec3::NEG_X, Vec3::Y),
        ];
        let half = Vec3::new(hx, hy, hz);
        let mut positions = Vec::with_capacity(72);
        let mut normals = Vec::with_capacity(72);
        let mut uvs = Vec::with_capacity(48);
        let mut indices = Vec::with_capacity(36);
        for (face, (normal, u_axis, v_axis)) in faces.iter().enumerate() {
            let base = face as u32 * 4;
            for (u, v) in [(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)] {
                let corner = (*normal + *u_axis * (u * 2.0 - 1.0) + *v_axis * (v * 2.0 - 1.0)) * half;
                positions.extend_from_slice(&corner.to_array());
                normals.extend_from_slice(&normal.to_array());
                uvs.extend_from_slice(&[u, 1.0 - v]);
            }
            indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }
        Self::from_valid(
            GeometryData::new(positions)
                .with_attribute(Semantic::Normal, normals)
                .with_attribute(Semantic::Uv, uvs)
                .with_indices(indices),
        )
    }

    /// Plane in the XZ plane facing +Y.
    pub fn plane(width: f32, depth: f32) -> Self {
        let (hx, hz) = (width * 0.5, depth * 0.5);
        let positions = vec![-hx, 0.0, hz, hx, 0.0, hz, hx, 0.0, -hz, -hx, 0.0, -hz];
        let normals = [0.0, 1.0, 0.0].repeat(4);
        let uvs = vec![0.0, 1.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0];
        Self::from_valid(
            GeometryData::new(positions)
                .with_attribute(Semantic::Normal, normals)
                .with_attribute(Semantic::Uv, uvs)
                .with_indices(vec![0, 1, 2, 0, 2, 3]),
        )
    }

    /// UV sphere; `segments` around the equator, `rings` pole to pole.
    pub fn sphere(radius: f32, segments: u32, rings: u32) -> Self {
        let segments = segments.max(3);
        let rings = rings.max(2);
        let mut positions = Vec::new();
        let mut normals = Vec::new();
        let mut uvs = Vec::new();
        for ring in 0..=rings {
            let v = ring as f32 / rings as f32;
            let theta = v * std::f32::consts::PI;
            for segment in 0..=segments {
                let u = segment as f32 / segments as f32;
                let phi = u * std::f32::consts::TAU;
                let normal = Vec3::new(-phi.cos() * theta.sin(), theta.cos(), phi.sin() * theta.sin());
                positions.extend_from_slice(&(normal * radius).to_array());
                normals.extend_from_slice(&normal.to_array());
                uvs.extend_from_slice(&[u, v]);
            }
        }
        let stride = segments + 1;
        let mut indices = Vec::new();
        for ring in 0..rings {
            for segment in 0..segments {
                let a = ring * stride + segment;
                let b = a + stride;
                if ring != 0 {
                    indices.extend_from_slice(&[a, b, a + 1]);
                }
                if ring != rings - 1 {
                    indices.extend_from_slice(&[a + 1, b, b + 1]);
                }
            }
        }
        Self::from_valid(
            GeometryData::new(positions)
                .with_attribute(Semantic::Normal, normals)
                .with_attribute(Semantic::Uv, uvs)
                .with_indices(indices),
        )
    }

    /// Primitive builders produce consistent data by construction.
    fn from_valid(data: GeometryData) -> Self {
        let sphere = data.bounding_sphere();
        Self {
            inner: Arc::new(GeometryInner {
                id: GeometryId(NEXT_GEOMETRY_ID.fetch_add(1, Ordering::Relaxed)),
                version: AtomicU64::new(1),
                data: RwLock::new(data),
                bounding_sphere: RwLock::new(sphere),
            }),
        }
    }
}

/// Number of primitives `count` elements form under `topology`.
pub fn primitive_count(topology: wgpu::PrimitiveTopology, count: u32) -> u32 {
    match topology {
        wgpu::PrimitiveTopology::TriangleList => count / 3,
        wgpu::PrimitiveTopology::TriangleStrip => count.saturating_sub(2),
        wgpu::PrimitiveTopology::LineList => count / 2,
        wgpu::PrimitiveTopology::LineStrip => count.saturating_sub(1),
        wgpu::PrimitiveTopology::PointList => count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triangle() -> GeometryData {
        GeometryData::new(vec![0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0])
    }

    #[test]
    fn test_missing_position_rejected() {
        let mut data = triangle();
        data.attributes.clear();
        assert!(Geometry::new(data).is_err());
    }

    #[test]
    fn test_mismatched_attribute_rejected() {
        let data = triangle().with_attribute(Semantic::Uv, vec![0.0; 4]);
        assert!(matches!(
            Geometry::new(data),
            Err(RenderError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_index_out_of_range_rejected() {
        let data = triangle().with_indices(vec![0, 1, 3]);
        assert!(Geometry::new(data).is_err());
    }

    #[test]
    fn test_draw_span_intersects_group_and_range() {
        let mut data = triangle().with_indices(vec![0, 1, 2, 0, 2, 1, 1, 2, 0]);
        assert_eq!(data.draw_span(None), Some((0, 9)));

        let group = GeometryGroup {
            start: 3,
            count: 6,
            material_index: 1,
        };
        assert_eq!(data.draw_span(Some(&group)), Some((3, 6)));

        data.draw_range = DrawRange {
            start: 6,
            count: Some(100),
        };
        assert_eq!(data.draw_span(Some(&group)), Some((6, 3)));

        data.draw_range = DrawRange {
            start: 9,
            count: None,
        };
        assert_eq!(data.draw_span(None), None);
    }

    #[test]
    fn test_update_bumps_version_and_sphere() {
        let geometry = Geometry::new(triangle()).unwrap();
        let version = geometry.version();
        geometry
            .update(|data| {
                data.attributes[0].data = vec![0.0, 0.0, 0.0, 10.0, 0.0, 0.0, 0.0, 10.0, 0.0];
            })
            .unwrap();
        assert!(geometry.version() > version);
        assert!(geometry.bounding_sphere().unwrap().radius > 5.0);
    }

    #[test]
    fn test_rejected_update_leaves_geometry_untouched() {
        let geometry = Geometry::new(triangle()).unwrap();
        let version = geometry.version();
        let result = geometry.update(|data| data.indices = Some(vec![7, 8, 9]));
        assert!(result.is_err());
        assert_eq!(geometry.version(), version);
        assert!(geometry.data().indices.is_none());
    }

    #[test]
    fn test_instanced_bounding_sphere_covers_instances() {
        let mut data = triangle();
        data.instances = Some(vec![
            Mat4::from_translation(Vec3::new(-50.0, 0.0, 0.0)),
            Mat4::from_translation(Vec3::new(50.0, 0.0, 0.0)),
        ]);
        let geometry = Geometry::new(data).unwrap();
        let sphere = geometry.bounding_sphere().unwrap();
        assert!(sphere.radius >= 50.0);
        assert_eq!(geometry.data().instance_count(), 2);
    }

    #[test]
    fn test_primitives_are_consistent() {
        let cuboid = Geometry::cuboid(1.0, 2.0, 3.0);
        assert_eq!(cuboid.data().vertex_count(), 24);
        assert_eq!(cuboid.data().element_count(), 36);

        let plane = Geometry::plane(10.0, 10.0);
        assert_eq!(plane.data().element_count(), 6);

        let sphere = Geometry::sphere(2.0, 8, 6);
        assert!(sphere.data().validate().is_ok());
        assert!((sphere.bounding_sphere().unwrap().radius - 2.0).abs() < 1e-3);
    }

    #[test]
    fn test_primitive_count() {
        assert_eq!(primitive_count(wgpu::PrimitiveTopology::TriangleList, 36), 12);
        assert_eq!(primitive_count(wgpu::PrimitiveTopology::TriangleStrip, 5), 3);
        assert_eq!(primitive_count(wgpu::PrimitiveTopology::LineList, 4), 2);
        assert_eq!(primitive_count(wgpu::PrimitiveTopology::PointList, 7), 7);
    }
}
