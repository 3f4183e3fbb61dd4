//! Built-in WGSL chunks and stage templates, embedded at compile time.

/// Stage templates; each one is itself a chunk and can be included.
pub const MESH_VERTEX: &str = include_str!("wgsl/mesh_vertex.wgsl");
pub const MESH_FRAGMENT: &str = include_str!("wgsl/mesh_fragment.wgsl");
pub const DEPTH_FRAGMENT: &str = include_str!("wgsl/depth_fragment.wgsl");
pub const DISTANCE_FRAGMENT: &str = include_str!("wgsl/distance_fragment.wgsl");

/// Every name `#include <name>` accepts.
pub const NAMES: &[&str] = &[
    "common",
    "frame_uniforms",
    "object_uniforms",
    "material_uniforms",
    "varyings",
    "lights_uniforms",
    "lighting",
    "shadows",
    "clipping_uniforms",
    "clip_discard",
    "tone_mapping",
    "encoding",
    "env_map",
    "normal_map",
    "mesh_vertex",
    "mesh_fragment",
    "depth_fragment",
    "distance_fragment",
];

/// Source of the chunk called `name`.
pub fn get(name: &str) -> Option<&'static str> {
    let source = match name {
        "common" => include_str!("wgsl/common.wgsl"),
        "frame_uniforms" => include_str!("wgsl/frame_uniforms.wgsl"),
        "object_uniforms" => include_str!("wgsl/object_uniforms.wgsl"),
        "material_uniforms" => include_str!("wgsl/material_uniforms.wgsl"),
        "varyings" => include_str!("wgsl/varyings.wgsl"),
        "lights_uniforms" => include_str!("wgsl/lights_uniforms.wgsl"),
        "lighting" => include_str!("wgsl/lighting.wgsl"),
        "shadows" => include_str!("wgsl/shadows.wgsl"),
        "clipping_uniforms" => include_str!("wgsl/clipping_uniforms.wgsl"),
        "clip_discard" => include_str!("wgsl/clip_discard.wgsl"),
        "tone_mapping" => include_str!("wgsl/tone_mapping.wgsl"),
        "encoding" => include_str!("wgsl/encoding.wgsl"),
        "env_map" => include_str!("wgsl/env_map.wgsl"),
        "normal_map" => include_str!("wgsl/normal_map.wgsl"),
        "mesh_vertex" => MESH_VERTEX,
        "mesh_fragment" => MESH_FRAGMENT,
        "depth_fragment" => DEPTH_FRAGMENT,
        "distance_fragment" => DISTANCE_FRAGMENT,
        _ => return None,
    };
    Some(source)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_listed_chunk_resolves() {
        for name in NAMES {
            assert!(get(name).is_some(), "missing chunk {name}");
        }
        assert!(get("missing").is_none());
    }
}
