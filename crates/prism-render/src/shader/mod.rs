//! Shader assembly.
//!
//! A program variant goes through three steps: [`ProgramParameters`] produce
//! defines, [`template::expand`] turns the kind's templates into plain WGSL,
//! and [`compile_stage`] parses (and optionally validates) each stage with
//! naga so [`UniformMap`] can reflect the uniforms it actually uses.

pub mod chunks;
pub mod features;
pub mod reflect;
pub mod template;

pub use features::{LightCounts, ProgramContext, ProgramParameters};
pub use reflect::{UniformInfo, UniformMap};
pub use template::{Defines, TemplateError};

use naga::valid::{Capabilities, ValidationFlags, Validator};

/// Entry point names every stage template must define.
pub const VERTEX_ENTRY: &str = "vs_main";
pub const FRAGMENT_ENTRY: &str = "fs_main";

/// Expanded WGSL for both stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSources {
    pub vertex: String,
    pub fragment: String,
}

/// Expand the templates of `parameters` into stage sources.
pub fn assemble(parameters: &ProgramParameters) -> Result<StageSources, TemplateError> {
    let defines = parameters.defines();
    let (vertex, fragment) = parameters.templates();
    Ok(StageSources {
        vertex: template::expand(vertex, &defines)?,
        fragment: template::expand(fragment, &defines)?,
    })
}

/// Parse one stage and check its entry point. With `validate` the module also
/// goes through the naga validator. Errors carry a rendered diagnostic.
pub fn compile_stage(
    source: &str,
    stage: naga::ShaderStage,
    entry: &str,
    validate: bool,
) -> Result<naga::Module, String> {
    let module = naga::front::wgsl::parse_str(source).map_err(|err| err.emit_to_string(source))?;
    if validate {
        Validator::new(ValidationFlags::all(), Capabilities::default())
            .validate(&module)
            .map_err(|err| err.emit_to_string(source))?;
    }
    let found = module
        .entry_points
        .iter()
        .any(|point| point.stage == stage && point.name == entry);
    if !found {
        return Err(format!("missing {stage:?} entry point '{entry}'"));
    }
    Ok(module)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::material::{MaterialKind, MaterialParams, Side};
    use crate::texture::{ImageSource, Texture, TextureDescriptor};
    use glam::Vec3;
    use prism_config::{OutputEncoding, ShadowType, ToneMapping};

    fn texture() -> Texture {
        Texture::new(TextureDescriptor::new("t", ImageSource::new(1, 1, vec![0; 4]))).unwrap()
    }

    fn check(material: &MaterialParams, context: &ProgramContext) {
        let parameters = ProgramParameters::new(material, material.features(), context);
        let sources = assemble(&parameters).unwrap();
        if let Err(log) = compile_stage(&sources.vertex, naga::ShaderStage::Vertex, VERTEX_ENTRY, true) {
            panic!("{} vertex stage failed:\n{log}", parameters.cache_key());
        }
        if let Err(log) =
            compile_stage(&sources.fragment, naga::ShaderStage::Fragment, FRAGMENT_ENTRY, true)
        {
            panic!("{} fragment stage failed:\n{log}", parameters.cache_key());
        }
    }

    fn full_context() -> ProgramContext {
        ProgramContext {
            lights: LightCounts {
                directional: 2,
                point: 2,
                spot: 1,
                hemisphere: 1,
                rect_area: 1,
                directional_shadows: 1,
                point_shadows: 1,
                spot_shadows: 1,
            },
            clipping_planes: 2,
            instancing: true,
            tone_mapping: ToneMapping::AcesFilmic,
            output_encoding: OutputEncoding::Srgb,
            shadow_type: ShadowType::PcfSoft,
            ..Default::default()
        }
    }

    #[test]
    fn test_unlit_kinds_validate() {
        let context = ProgramContext::default();
        check(&MaterialParams::basic(Vec3::ONE), &context);
        check(&MaterialParams::new(MaterialKind::Depth), &context);
        check(&MaterialParams::new(MaterialKind::Distance), &full_context());
    }

    #[test]
    fn test_lit_kinds_validate_without_lights() {
        let context = ProgramContext::default();
        check(&MaterialParams::lambert(Vec3::ONE), &context);
        check(&MaterialParams::phong(Vec3::ONE, 30.0), &context);
        check(&MaterialParams::standard(Vec3::ONE, 0.5, 0.5), &context);
    }

    #[test]
    fn test_lit_kinds_validate_with_everything() {
        let context = full_context();
        for mut material in [
            MaterialParams::lambert(Vec3::ONE),
            MaterialParams::phong(Vec3::ONE, 30.0),
            MaterialParams::standard(Vec3::ONE, 0.5, 0.5),
            MaterialParams::physical(Vec3::ONE, 0.2, 0.8),
        ] {
            material.map = Some(texture());
            material.alpha_map = Some(texture());
            material.normal_map = Some(texture());
            material.emissive_map = Some(texture());
            material.roughness_map = Some(texture());
            material.metalness_map = Some(texture());
            material.specular_map = Some(texture());
            material.env_map = Some(texture());
            material.alpha_test = 0.5;
            material.vertex_colors = true;
            material.side = Side::Double;
            check(&material, &context);
        }
    }

    #[test]
    fn test_shadow_filters_validate() {
        for shadow_type in [ShadowType::Basic, ShadowType::Pcf, ShadowType::PcfSoft] {
            let context = ProgramContext {
                shadow_type,
                ..full_context()
            };
            check(&MaterialParams::standard(Vec3::ONE, 0.5, 0.0), &context);
        }
    }

    #[test]
    fn test_tone_mapping_operators_validate() {
        for tone_mapping in [
            ToneMapping::Linear,
            ToneMapping::Reinhard,
            ToneMapping::Cineon,
            ToneMapping::AcesFilmic,
        ] {
            let context = ProgramContext {
                tone_mapping,
                ..Default::default()
            };
            check(&MaterialParams::basic(Vec3::ONE), &context);
        }
    }

    #[test]
    fn test_missing_entry_point_is_reported() {
        let source = "@fragment fn main() -> @location(0) vec4<f32> { return vec4<f32>(1.0); }";
        let err = compile_stage(source, naga::ShaderStage::Fragment, FRAGMENT_ENTRY, true)
            .unwrap_err();
        assert!(err.contains("fs_main"));
    }

    #[test]
    fn test_parse_error_is_rendered() {
        let err = compile_stage("fn broken(", naga::ShaderStage::Fragment, FRAGMENT_ENTRY, false)
            .unwrap_err();
        assert!(!err.is_empty());
    }

    #[test]
    fn test_reflection_of_mesh_program() {
        let context = ProgramContext {
            clipping_planes: 1,
            ..full_context()
        };
        let mut material = MaterialParams::phong(Vec3::ONE, 30.0);
        material.map = Some(texture());
        let parameters = ProgramParameters::new(&material, material.features(), &context);
        let sources = assemble(&parameters).unwrap();
        let vertex =
            compile_stage(&sources.vertex, naga::ShaderStage::Vertex, VERTEX_ENTRY, true).unwrap();
        let fragment =
            compile_stage(&sources.fragment, naga::ShaderStage::Fragment, FRAGMENT_ENTRY, true)
                .unwrap();
        let map = UniformMap::from_modules(&[&vertex, &fragment]);

        assert_eq!(
            map.get("object.model_matrix").map(|info| info.kind),
            Some(crate::device::UniformKind::Mat4)
        );
        assert!(map.contains("material.diffuse"));
        assert!(map.contains("lights"));
        assert!(map.contains("clipping"));
        assert!(map.contains("diffuse_map"));
        assert!(map.contains("directional_shadow_map_0"));
        assert!(map.contains("point_shadow_map_0"));
        assert!(!map.contains("alpha_map"));
    }
}
