//! Render lists: collect, cull, bucket and sort the drawables of a frame.
//!
//! Items live in a pool that only grows. Each frame resets the cursor and
//! overwrites slots in place; the three buckets hold pool indices. Opaque and
//! transmissive items sort to cluster materials and draw roughly front to
//! back, transparent items sort strictly back to front.

use std::cmp::Ordering;

use glam::Mat4;

use crate::camera::Camera;
use crate::frustum::Frustum;
use crate::geometry::{Geometry, GeometryGroup};
use crate::light::SceneLight;
use crate::material::{Material, MaterialId};
use crate::scene::{Mesh, NodeKind, ObjectId, Scene, Visit};

/// One draw of one object with one material.
#[derive(Debug, Clone)]
pub struct RenderItem {
    pub object_id: ObjectId,
    pub geometry: Geometry,
    pub material: Material,
    pub material_id: MaterialId,
    /// Geometry group drawn; `None` draws the whole draw range.
    pub group: Option<GeometryGroup>,
    pub group_order: i32,
    pub render_order: i32,
    /// Projected depth of the object's bounding sphere center.
    pub z: f32,
    pub world: Mat4,
    pub cast_shadow: bool,
    pub receive_shadow: bool,
}

/// Bucket an item is drawn in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    Opaque,
    Transmissive,
    Transparent,
}

impl Bucket {
    /// Transmission wins over transparency.
    pub fn of(material: &Material) -> Self {
        if material.is_transmissive() {
            Bucket::Transmissive
        } else if material.is_transparent() {
            Bucket::Transparent
        } else {
            Bucket::Opaque
        }
    }
}

/// Pooled items of one frame split into draw buckets.
#[derive(Debug, Default)]
pub struct RenderList {
    pool: Vec<RenderItem>,
    cursor: usize,
    opaque: Vec<usize>,
    transmissive: Vec<usize>,
    transparent: Vec<usize>,
}

impl RenderList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rewind the cursor and empty the buckets. Pooled items are overwritten
    /// as the cursor advances.
    pub fn reset(&mut self) {
        self.cursor = 0;
        self.opaque.clear();
        self.transmissive.clear();
        self.transparent.clear();
    }

    pub fn push(&mut self, item: RenderItem, bucket: Bucket) {
        let index = self.cursor;
        match self.pool.get_mut(index) {
            Some(slot) => *slot = item,
            None => self.pool.push(item),
        }
        self.cursor += 1;
        match bucket {
            Bucket::Opaque => self.opaque.push(index),
            Bucket::Transmissive => self.transmissive.push(index),
            Bucket::Transparent => self.transparent.push(index),
        }
    }

    /// Stable sort of every bucket.
    pub fn sort(&mut self) {
        let pool = &self.pool;
        self.opaque
            .sort_by(|a, b| opaque_order(&pool[*a], &pool[*b]));
        self.transmissive
            .sort_by(|a, b| opaque_order(&pool[*a], &pool[*b]));
        self.transparent
            .sort_by(|a, b| transparent_order(&pool[*a], &pool[*b]));
    }

    pub fn opaque(&self) -> impl Iterator<Item = &RenderItem> {
        self.opaque.iter().map(|index| &self.pool[*index])
    }

    pub fn transmissive(&self) -> impl Iterator<Item = &RenderItem> {
        self.transmissive.iter().map(|index| &self.pool[*index])
    }

    pub fn transparent(&self) -> impl Iterator<Item = &RenderItem> {
        self.transparent.iter().map(|index| &self.pool[*index])
    }

    /// Items of the current frame in push order.
    pub fn items(&self) -> &[RenderItem] {
        &self.pool[..self.cursor]
    }

    pub fn len(&self) -> usize {
        self.cursor
    }

    pub fn is_empty(&self) -> bool {
        self.cursor == 0
    }

    /// Pool slots allocated so far; never shrinks.
    pub fn capacity(&self) -> usize {
        self.pool.len()
    }
}

fn opaque_order(a: &RenderItem, b: &RenderItem) -> Ordering {
    a.group_order
        .cmp(&b.group_order)
        .then(a.render_order.cmp(&b.render_order))
        .then(a.material_id.cmp(&b.material_id))
        .then(a.z.total_cmp(&b.z))
}

fn transparent_order(a: &RenderItem, b: &RenderItem) -> Ordering {
    a.group_order
        .cmp(&b.group_order)
        .then(a.render_order.cmp(&b.render_order))
        .then(b.z.total_cmp(&a.z))
}

/// Walk `scene`, culling meshes against `camera` and collecting lights.
pub fn build_render_list<'s>(
    scene: &'s Scene,
    camera: &Camera,
    list: &mut RenderList,
    lights: &mut Vec<SceneLight<'s>>,
    sort: bool,
) {
    list.reset();
    lights.clear();
    let view_projection = camera.view_projection_matrix();
    let frustum = Frustum::from_view_projection(&view_projection);

    scene.traverse_visible(|visit| match &visit.node.kind {
        NodeKind::Group => {}
        NodeKind::Light(light) => lights.push(SceneLight {
            id: visit.id,
            light,
            world: visit.world,
        }),
        NodeKind::Mesh(mesh) => {
            let sphere = mesh
                .geometry
                .bounding_sphere()
                .map(|sphere| sphere.transformed(&visit.world));
            if mesh.frustum_culled
                && let Some(sphere) = &sphere
                && !frustum.intersects_sphere(sphere)
            {
                return;
            }
            let z = if sort {
                let center = sphere
                    .map(|sphere| sphere.center)
                    .unwrap_or_else(|| visit.world.w_axis.truncate());
                view_projection.project_point3(center).z
            } else {
                0.0
            };
            mesh_items(&visit, mesh, z, |item| {
                let bucket = Bucket::of(&item.material);
                list.push(item, bucket);
            });
        }
    });

    if sort {
        list.sort();
    }
}

/// One item per visible (material, group) pair of `mesh`. Groups whose
/// material index is out of range are skipped.
pub fn mesh_items(visit: &Visit<'_>, mesh: &Mesh, z: f32, mut push: impl FnMut(RenderItem)) {
    let item = |material: &Material, group: Option<GeometryGroup>| RenderItem {
        object_id: visit.id,
        geometry: mesh.geometry.clone(),
        material: material.clone(),
        material_id: material.id(),
        group,
        group_order: visit.group_order,
        render_order: visit.node.render_order,
        z,
        world: visit.world,
        cast_shadow: mesh.cast_shadow,
        receive_shadow: mesh.receive_shadow,
    };

    let data = mesh.geometry.data();
    if data.groups.is_empty() {
        if let Some(material) = mesh.materials.first()
            && material.read().params.visible
        {
            push(item(material, None));
        }
        return;
    }
    for group in &data.groups {
        let Some(material) = mesh.materials.get(group.material_index) else {
            continue;
        };
        if material.read().params.visible {
            push(item(material, Some(*group)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::material::MaterialParams;
    use crate::scene::{Mesh, Node};
    use glam::Vec3;

    fn item(material: &Material, render_order: i32, z: f32) -> RenderItem {
        RenderItem {
            object_id: ObjectId(0),
            geometry: Geometry::cuboid(1.0, 1.0, 1.0),
            material: material.clone(),
            material_id: material.id(),
            group: None,
            group_order: 0,
            render_order,
            z,
            world: Mat4::IDENTITY,
            cast_shadow: false,
            receive_shadow: false,
        }
    }

    #[test]
    fn test_opaque_sort_by_render_order_then_z() {
        let material = Material::new(MaterialParams::basic(Vec3::ONE));
        let mut list = RenderList::new();
        list.reset();
        for (order, z) in [(2, 5.0), (1, 1.0), (2, 2.0)] {
            list.push(item(&material, order, z), Bucket::Opaque);
        }
        list.sort();
        let sorted: Vec<(i32, f32)> = list.opaque().map(|i| (i.render_order, i.z)).collect();
        assert_eq!(sorted, vec![(1, 1.0), (2, 2.0), (2, 5.0)]);
    }

    #[test]
    fn test_opaque_sort_clusters_materials_before_depth() {
        let first = Material::new(MaterialParams::basic(Vec3::ONE));
        let second = Material::new(MaterialParams::basic(Vec3::ONE));
        let mut list = RenderList::new();
        list.reset();
        list.push(item(&second, 0, 1.0), Bucket::Opaque);
        list.push(item(&first, 0, 9.0), Bucket::Opaque);
        list.sort();
        let ids: Vec<MaterialId> = list.opaque().map(|i| i.material_id).collect();
        assert_eq!(ids, vec![first.id(), second.id()]);
    }

    #[test]
    fn test_transparent_sort_back_to_front() {
        let first = Material::new(MaterialParams::basic(Vec3::ONE));
        let second = Material::new(MaterialParams::basic(Vec3::ONE));
        let mut list = RenderList::new();
        list.reset();
        list.push(item(&first, 0, 1.0), Bucket::Transparent);
        list.push(item(&second, 0, 5.0), Bucket::Transparent);
        list.push(item(&first, 0, 3.0), Bucket::Transparent);
        list.sort();
        let zs: Vec<f32> = list.transparent().map(|i| i.z).collect();
        assert_eq!(zs, vec![5.0, 3.0, 1.0]);
    }

    #[test]
    fn test_group_order_dominates_render_order() {
        let material = Material::new(MaterialParams::basic(Vec3::ONE));
        let mut list = RenderList::new();
        list.reset();
        let mut late = item(&material, -5, 0.0);
        late.group_order = 1;
        list.push(late, Bucket::Transparent);
        list.push(item(&material, 5, 0.0), Bucket::Transparent);
        list.sort();
        let orders: Vec<i32> = list.transparent().map(|i| i.render_order).collect();
        assert_eq!(orders, vec![5, -5]);
    }

    #[test]
    fn test_pool_reused_across_frames() {
        let material = Material::new(MaterialParams::basic(Vec3::ONE));
        let mut list = RenderList::new();
        list.reset();
        for z in 0..3 {
            list.push(item(&material, 0, z as f32), Bucket::Opaque);
        }
        list.reset();
        list.push(item(&material, 0, 7.0), Bucket::Opaque);
        assert_eq!(list.len(), 1);
        assert_eq!(list.capacity(), 3);
        assert_eq!(list.items()[0].z, 7.0);
    }

    fn scene_with(material: MaterialParams, translation: Vec3) -> Scene {
        let mut scene = Scene::new();
        scene.add(
            Node::mesh(Mesh::new(
                Geometry::cuboid(1.0, 1.0, 1.0),
                Material::new(material),
            ))
            .with_translation(translation),
        );
        scene
    }

    fn camera() -> Camera {
        let mut camera = Camera::perspective(std::f32::consts::FRAC_PI_2, 1.0, 0.1, 100.0);
        camera.position = Vec3::new(0.0, 0.0, 5.0);
        camera
    }

    #[test]
    fn test_frustum_culls_objects_behind_camera() {
        let scene = scene_with(MaterialParams::basic(Vec3::ONE), Vec3::new(0.0, 0.0, 50.0));
        let mut list = RenderList::new();
        let mut lights = Vec::new();
        build_render_list(&scene, &camera(), &mut list, &mut lights, true);
        assert!(list.is_empty());
    }

    #[test]
    fn test_culling_disabled_keeps_object() {
        let mut scene = scene_with(MaterialParams::basic(Vec3::ONE), Vec3::new(0.0, 0.0, 50.0));
        if let Some(mesh) = scene.node_mut(ObjectId(0)).and_then(|node| node.as_mesh_mut()) {
            mesh.frustum_culled = false;
        }
        let mut list = RenderList::new();
        let mut lights = Vec::new();
        build_render_list(&scene, &camera(), &mut list, &mut lights, true);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_buckets_follow_material() {
        let mut transparent = MaterialParams::basic(Vec3::ONE);
        transparent.transparent = true;
        let mut both = MaterialParams::physical(Vec3::ONE, 0.5, 0.8);
        both.transparent = true;

        for (params, expected) in [
            (MaterialParams::basic(Vec3::ONE), Bucket::Opaque),
            (transparent, Bucket::Transparent),
            (both, Bucket::Transmissive),
        ] {
            assert_eq!(Bucket::of(&Material::new(params)), expected);
        }
    }

    #[test]
    fn test_geometry_groups_pick_materials() {
        let geometry = Geometry::cuboid(1.0, 1.0, 1.0);
        geometry
            .update(|data| {
                data.groups = vec![
                    GeometryGroup {
                        start: 0,
                        count: 6,
                        material_index: 1,
                    },
                    GeometryGroup {
                        start: 6,
                        count: 6,
                        material_index: 0,
                    },
                    GeometryGroup {
                        start: 12,
                        count: 6,
                        material_index: 9,
                    },
                ];
            })
            .unwrap();
        let a = Material::new(MaterialParams::basic(Vec3::ONE));
        let b = Material::new(MaterialParams::basic(Vec3::ZERO));
        let mut scene = Scene::new();
        scene.add(Node::mesh(Mesh::multi(geometry, vec![a.clone(), b.clone()])));

        let mut list = RenderList::new();
        let mut lights = Vec::new();
        build_render_list(&scene, &camera(), &mut list, &mut lights, false);
        let drawn: Vec<MaterialId> = list.items().iter().map(|i| i.material_id).collect();
        assert_eq!(drawn, vec![b.id(), a.id()]);
        let starts: Vec<Option<u32>> =
            list.items().iter().map(|i| i.group.map(|g| g.start)).collect();
        assert_eq!(starts, vec![Some(0), Some(6)]);
    }
}
