//! Uniform reflection.
//!
//! Walks the global variables of validated naga modules and flattens every
//! uniform buffer into leaf paths (`material.diffuse`, `object.model_matrix`)
//! with the byte offset the binder uploads to. Two buffers are kept whole:
//! the light block and the clipping block are rebuilt per frame as one word
//! array, so they are reflected as a single [`UniformKind::Block`].

use naga::{
    AddressSpace, ArraySize, Handle, ImageClass, ImageDimension, Module, ScalarKind, Type,
    TypeInner, VectorSize,
};

use crate::device::{UniformKind, UniformLocation};

/// Uniform buffers uploaded as one block.
pub const BLOCK_UNIFORMS: &[&str] = &["lights", "clipping"];

/// One active uniform of a program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniformInfo {
    pub path: String,
    pub kind: UniformKind,
    pub location: UniformLocation,
}

/// Active uniforms of a program, ordered by location.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UniformMap {
    entries: Vec<UniformInfo>,
}

impl UniformMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reflect the uniforms of every stage; a path used by several stages
    /// appears once.
    pub fn from_modules(modules: &[&Module]) -> Self {
        let mut map = Self::new();
        for module in modules {
            reflect_module(module, &mut map);
        }
        map.entries.sort_by_key(|info| info.location);
        map
    }

    pub fn get(&self, path: &str) -> Option<&UniformInfo> {
        self.entries.iter().find(|info| info.path == path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &UniformInfo> {
        self.entries.iter()
    }

    /// Texture uniforms in location order; this is the unit assignment order.
    pub fn textures(&self) -> impl Iterator<Item = &UniformInfo> {
        self.entries.iter().filter(|info| info.kind.is_texture())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn insert(&mut self, info: UniformInfo) {
        if !self.contains(&info.path) {
            self.entries.push(info);
        }
    }
}

fn reflect_module(module: &Module, map: &mut UniformMap) {
    for (_, variable) in module.global_variables.iter() {
        let (Some(name), Some(binding)) = (&variable.name, &variable.binding) else {
            continue;
        };
        let location = UniformLocation {
            group: binding.group,
            binding: binding.binding,
            offset: 0,
        };
        match variable.space {
            AddressSpace::Uniform if BLOCK_UNIFORMS.contains(&name.as_str()) => {
                let size = module.types[variable.ty].inner.size(module.to_ctx());
                map.insert(UniformInfo {
                    path: name.clone(),
                    kind: UniformKind::Block(size),
                    location,
                });
            }
            AddressSpace::Uniform => reflect_value(module, variable.ty, name.clone(), location, map),
            AddressSpace::Handle => {
                if let Some(kind) = texture_kind(&module.types[variable.ty].inner) {
                    map.insert(UniformInfo {
                        path: name.clone(),
                        kind,
                        location,
                    });
                }
            }
            _ => {}
        }
    }
}

fn reflect_value(
    module: &Module,
    ty: Handle<Type>,
    path: String,
    location: UniformLocation,
    map: &mut UniformMap,
) {
    match &module.types[ty].inner {
        TypeInner::Struct { members, .. } => {
            for member in members {
                let Some(member_name) = &member.name else {
                    continue;
                };
                let member_location = UniformLocation {
                    offset: location.offset + member.offset,
                    ..location
                };
                reflect_value(
                    module,
                    member.ty,
                    format!("{path}.{member_name}"),
                    member_location,
                    map,
                );
            }
        }
        TypeInner::Array {
            base,
            size: ArraySize::Constant(count),
            stride,
        } => {
            for index in 0..count.get() {
                let element_location = UniformLocation {
                    offset: location.offset + index * stride,
                    ..location
                };
                reflect_value(
                    module,
                    *base,
                    format!("{path}[{index}]"),
                    element_location,
                    map,
                );
            }
        }
        inner => match value_kind(inner) {
            Some(kind) => map.insert(UniformInfo {
                path,
                kind,
                location,
            }),
            None => log::debug!("Skipping uniform '{path}' of unsupported type"),
        },
    }
}

fn value_kind(inner: &TypeInner) -> Option<UniformKind> {
    let kind = match *inner {
        TypeInner::Scalar(scalar) => match scalar.kind {
            ScalarKind::Float => UniformKind::Float,
            ScalarKind::Sint => UniformKind::Int,
            ScalarKind::Uint => UniformKind::UInt,
            ScalarKind::Bool => UniformKind::Bool,
            _ => return None,
        },
        TypeInner::Vector { size, scalar } => match (scalar.kind, size) {
            (ScalarKind::Float, VectorSize::Bi) => UniformKind::Vec2,
            (ScalarKind::Float, VectorSize::Tri) => UniformKind::Vec3,
            (ScalarKind::Float, VectorSize::Quad) => UniformKind::Vec4,
            (ScalarKind::Sint | ScalarKind::Uint, VectorSize::Bi) => UniformKind::IVec2,
            (ScalarKind::Sint | ScalarKind::Uint, VectorSize::Tri) => UniformKind::IVec3,
            (ScalarKind::Sint | ScalarKind::Uint, VectorSize::Quad) => UniformKind::IVec4,
            _ => return None,
        },
        TypeInner::Matrix { columns, rows, .. } => match (columns, rows) {
            (VectorSize::Bi, VectorSize::Bi) => UniformKind::Mat2,
            (VectorSize::Tri, VectorSize::Tri) => UniformKind::Mat3,
            (VectorSize::Quad, VectorSize::Quad) => UniformKind::Mat4,
            _ => return None,
        },
        _ => return None,
    };
    Some(kind)
}

fn texture_kind(inner: &TypeInner) -> Option<UniformKind> {
    let TypeInner::Image {
        dim,
        arrayed: false,
        class,
    } = inner
    else {
        return None;
    };
    match (*dim, class) {
        (ImageDimension::D2, ImageClass::Sampled { .. }) => Some(UniformKind::Texture2d),
        (ImageDimension::Cube, ImageClass::Sampled { .. }) => Some(UniformKind::TextureCube),
        (ImageDimension::D2, ImageClass::Depth { .. }) => Some(UniformKind::TextureDepth2d),
        (ImageDimension::Cube, ImageClass::Depth { .. }) => Some(UniformKind::TextureDepthCube),
        _ => None,
    }
}
