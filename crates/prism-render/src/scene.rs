//! Scene graph.
//!
//! A [`Scene`] is an arena of [`Node`]s linked by parent/child indices. Each
//! node has a local transform; world matrices are composed during traversal,
//! so a scene can be rendered through a shared reference.

use glam::{Mat4, Quat, Vec3, Vec4};

use crate::error::RenderError;
use crate::geometry::Geometry;
use crate::light::Light;
use crate::material::Material;

/// Index of a node inside its scene.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub u32);

/// Translation, rotation and scale relative to the parent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub translation: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            translation: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
        }
    }
}

impl Transform {
    pub fn matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.translation)
    }
}

/// Drawable geometry with one material per geometry group.
#[derive(Debug, Clone)]
pub struct Mesh {
    pub geometry: Geometry,
    /// Indexed by `GeometryGroup::material_index`; the first entry is used
    /// when the geometry has no groups.
    pub materials: Vec<Material>,
    pub cast_shadow: bool,
    pub receive_shadow: bool,
    pub frustum_culled: bool,
}

impl Mesh {
    pub fn new(geometry: Geometry, material: Material) -> Self {
        Self::multi(geometry, vec![material])
    }

    pub fn multi(geometry: Geometry, materials: Vec<Material>) -> Self {
        Self {
            geometry,
            materials,
            cast_shadow: false,
            receive_shadow: false,
            frustum_culled: true,
        }
    }
}

/// What a node contributes to the frame.
#[derive(Debug, Clone)]
pub enum NodeKind {
    /// Pure transform. A non-zero render order on a group orders its whole
    /// subtree against the rest of the scene.
    Group,
    Mesh(Mesh),
    Light(Light),
}

/// One scene node.
#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub transform: Transform,
    pub visible: bool,
    pub render_order: i32,
    pub kind: NodeKind,
    parent: Option<ObjectId>,
    children: Vec<ObjectId>,
}

impl Node {
    pub fn new(kind: NodeKind) -> Self {
        Self {
            name: String::new(),
            transform: Transform::default(),
            visible: true,
            render_order: 0,
            kind,
            parent: None,
            children: Vec::new(),
        }
    }

    pub fn group() -> Self {
        Self::new(NodeKind::Group)
    }

    pub fn mesh(mesh: Mesh) -> Self {
        Self::new(NodeKind::Mesh(mesh))
    }

    pub fn light(light: Light) -> Self {
        Self::new(NodeKind::Light(light))
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_translation(mut self, translation: Vec3) -> Self {
        self.transform.translation = translation;
        self
    }

    pub fn with_rotation(mut self, rotation: Quat) -> Self {
        self.transform.rotation = rotation;
        self
    }

    pub fn with_scale(mut self, scale: Vec3) -> Self {
        self.transform.scale = scale;
        self
    }

    pub fn with_render_order(mut self, render_order: i32) -> Self {
        self.render_order = render_order;
        self
    }

    pub fn parent(&self) -> Option<ObjectId> {
        self.parent
    }

    pub fn children(&self) -> &[ObjectId] {
        &self.children
    }

    pub fn as_mesh(&self) -> Option<&Mesh> {
        match &self.kind {
            NodeKind::Mesh(mesh) => Some(mesh),
            _ => None,
        }
    }

    pub fn as_mesh_mut(&mut self) -> Option<&mut Mesh> {
        match &mut self.kind {
            NodeKind::Mesh(mesh) => Some(mesh),
            _ => None,
        }
    }

    pub fn as_light(&self) -> Option<&Light> {
        match &self.kind {
            NodeKind::Light(light) => Some(light),
            _ => None,
        }
    }

    pub fn as_light_mut(&mut self) -> Option<&mut Light> {
        match &mut self.kind {
            NodeKind::Light(light) => Some(light),
            _ => None,
        }
    }
}

/// A visible node reached by [`Scene::traverse_visible`].
#[derive(Debug, Clone, Copy)]
pub struct Visit<'a> {
    pub id: ObjectId,
    pub node: &'a Node,
    pub world: Mat4,
    /// Render order of the nearest ordered ancestor group.
    pub group_order: i32,
}

/// Node arena plus scene-wide settings.
#[derive(Debug, Clone, Default)]
pub struct Scene {
    nodes: Vec<Node>,
    roots: Vec<ObjectId>,
    /// Color the surface is cleared to before this scene renders, instead of
    /// the renderer clear color.
    pub background: Option<Vec4>,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a root node.
    pub fn add(&mut self, node: Node) -> ObjectId {
        let id = self.push(node, None);
        self.roots.push(id);
        id
    }

    /// Add a node under `parent`.
    pub fn add_child(&mut self, parent: ObjectId, node: Node) -> Result<ObjectId, RenderError> {
        if self.node(parent).is_none() {
            return Err(RenderError::InvalidParameter(format!(
                "parent node {} does not exist",
                parent.0
            )));
        }
        let id = self.push(node, Some(parent));
        if let Some(parent) = self.nodes.get_mut(parent.0 as usize) {
            parent.children.push(id);
        }
        Ok(id)
    }

    fn push(&mut self, mut node: Node, parent: Option<ObjectId>) -> ObjectId {
        let id = ObjectId(self.nodes.len() as u32);
        node.parent = parent;
        node.children.clear();
        self.nodes.push(node);
        id
    }

    pub fn node(&self, id: ObjectId) -> Option<&Node> {
        self.nodes.get(id.0 as usize)
    }

    pub fn node_mut(&mut self, id: ObjectId) -> Option<&mut Node> {
        self.nodes.get_mut(id.0 as usize)
    }

    pub fn roots(&self) -> &[ObjectId] {
        &self.roots
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Iterate every node in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (ObjectId, &Node)> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(index, node)| (ObjectId(index as u32), node))
    }

    /// World matrix of a node, composed from its ancestors.
    pub fn world_matrix(&self, id: ObjectId) -> Option<Mat4> {
        let mut node = self.node(id)?;
        let mut world = node.transform.matrix();
        while let Some(parent) = node.parent {
            node = self.node(parent)?;
            world = node.transform.matrix() * world;
        }
        Some(world)
    }

    /// Depth-first walk in child order. Invisible nodes hide their subtree.
    pub fn traverse_visible<'a>(&'a self, mut visit: impl FnMut(Visit<'a>)) {
        let mut stack: Vec<(ObjectId, Mat4, i32)> = self
            .roots
            .iter()
            .rev()
            .map(|id| (*id, Mat4::IDENTITY, 0))
            .collect();
        while let Some((id, parent_world, group_order)) = stack.pop() {
            let Some(node) = self.node(id) else {
                continue;
            };
            if !node.visible {
                continue;
            }
            let world = parent_world * node.transform.matrix();
            let group_order = match node.kind {
                NodeKind::Group if node.render_order != 0 => node.render_order,
                _ => group_order,
            };
            visit(Visit {
                id,
                node,
                world,
                group_order,
            });
            stack.extend(
                node.children
                    .iter()
                    .rev()
                    .map(|child| (*child, world, group_order)),
            );
        }
    }
}
