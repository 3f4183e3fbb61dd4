//! Program parameters.
//!
//! [`ProgramParameters`] is everything that selects a program variant. The
//! same declarative table produces both the template defines and the cache
//! key, so two parameter sets that expand to different shader text can never
//! share a key.

use std::hash::{DefaultHasher, Hash, Hasher};

use prism_config::{OutputEncoding, Precision, ShadowType, ToneMapping};

use super::chunks;
use super::template::Defines;
use crate::material::{MaterialFeatures, MaterialKind, MaterialParams};

/// Material capability bits and the define each one turns on.
const FEATURE_DEFINES: &[(MaterialFeatures, &str)] = &[
    (MaterialFeatures::MAP, "USE_MAP"),
    (MaterialFeatures::ALPHA_MAP, "USE_ALPHA_MAP"),
    (MaterialFeatures::NORMAL_MAP, "USE_NORMAL_MAP"),
    (MaterialFeatures::EMISSIVE_MAP, "USE_EMISSIVE_MAP"),
    (MaterialFeatures::ROUGHNESS_MAP, "USE_ROUGHNESS_MAP"),
    (MaterialFeatures::METALNESS_MAP, "USE_METALNESS_MAP"),
    (MaterialFeatures::SPECULAR_MAP, "USE_SPECULAR_MAP"),
    (MaterialFeatures::ENV_MAP, "USE_ENV_MAP"),
    (MaterialFeatures::ENV_MAP_CUBE, "USE_ENV_MAP_CUBE"),
    (MaterialFeatures::VERTEX_COLORS, "USE_COLOR"),
    (MaterialFeatures::ALPHA_TEST, "ALPHA_TEST"),
    (MaterialFeatures::TRANSMISSION, "USE_TRANSMISSION"),
    (MaterialFeatures::FLAT_SHADING, "FLAT_SHADING"),
    (MaterialFeatures::DOUBLE_SIDED, "DOUBLE_SIDED"),
    (MaterialFeatures::PREMULTIPLIED_ALPHA, "PREMULTIPLIED_ALPHA"),
];

/// Number of lights of each type in the frame, shadow casters counted separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LightCounts {
    pub directional: u32,
    pub point: u32,
    pub spot: u32,
    pub hemisphere: u32,
    pub rect_area: u32,
    /// Leading directional lights that cast shadows.
    pub directional_shadows: u32,
    pub point_shadows: u32,
    pub spot_shadows: u32,
}

impl LightCounts {
    pub fn total(&self) -> u32 {
        self.directional + self.point + self.spot + self.hemisphere + self.rect_area
    }

    pub fn shadows(&self) -> u32 {
        self.directional_shadows + self.point_shadows + self.spot_shadows
    }
}

/// Frame state outside the material that selects a program variant.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProgramContext {
    pub lights: LightCounts,
    pub clipping_planes: u32,
    pub instancing: bool,
    pub tone_mapping: ToneMapping,
    pub output_encoding: OutputEncoding,
    pub precision: Precision,
    pub shadow_type: ShadowType,
}

/// Complete description of one program variant.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgramParameters {
    pub kind: MaterialKind,
    pub features: MaterialFeatures,
    pub precision: Precision,
    pub instancing: bool,
    /// Alpha is forced to one.
    pub opaque: bool,
    pub blending: &'static str,
    /// Zero for kinds that ignore lights.
    pub lights: LightCounts,
    pub clipping_planes: u32,
    pub tone_mapping: ToneMapping,
    pub output_encoding: OutputEncoding,
    pub shadow_type: ShadowType,
    pub custom_cache_key: String,
}

impl ProgramParameters {
    /// Combine a material with the frame context, dropping context that the
    /// material's kind cannot observe so it does not fragment the cache.
    pub fn new(
        material: &MaterialParams,
        features: MaterialFeatures,
        context: &ProgramContext,
    ) -> Self {
        let lit = material.kind.is_lit();
        let writes_color = !matches!(material.kind, MaterialKind::Depth | MaterialKind::Distance);
        let lights = if lit {
            context.lights
        } else {
            LightCounts::default()
        };
        Self {
            kind: material.kind.clone(),
            features,
            precision: context.precision,
            instancing: context.instancing,
            opaque: writes_color && !material.transparent,
            blending: material.blending.key_name(),
            lights,
            clipping_planes: context.clipping_planes,
            tone_mapping: if writes_color && material.tone_mapped {
                context.tone_mapping
            } else {
                ToneMapping::None
            },
            output_encoding: if writes_color {
                context.output_encoding
            } else {
                OutputEncoding::Linear
            },
            shadow_type: if lights.shadows() > 0 {
                context.shadow_type
            } else {
                ShadowType::default()
            },
            custom_cache_key: material.custom_cache_key.clone(),
        }
    }

    /// Template defines for this variant.
    pub fn defines(&self) -> Defines {
        let mut defines = Defines::new();
        let mut set = |name: &str, value: String| {
            defines.insert(name.to_string(), value);
        };

        set(&format!("KIND_{}", self.kind.name().to_uppercase()), "1".into());
        let precision = match self.precision {
            Precision::Low => "low",
            Precision::Medium => "medium",
            Precision::High => "high",
        };
        set("PRECISION", precision.into());
        set(&format!("PRECISION_{}", precision.to_uppercase()), "1".into());

        for (feature, name) in FEATURE_DEFINES {
            if self.features.contains(*feature) {
                set(name, "1".into());
            }
        }
        if self.instancing {
            set("USE_INSTANCING", "1".into());
        }
        if self.opaque {
            set("OPAQUE", "1".into());
        }

        if self.kind.is_lit() {
            set("LIGHTS", "1".into());
            let model = match self.kind {
                MaterialKind::Lambert => Some("LIGHTING_LAMBERT"),
                MaterialKind::Phong => Some("LIGHTING_PHONG"),
                MaterialKind::Standard | MaterialKind::Physical => Some("LIGHTING_PHYSICAL"),
                _ => None,
            };
            if let Some(model) = model {
                set(model, "1".into());
            }
            let lights = &self.lights;
            set("NUM_DIR_LIGHTS", lights.directional.to_string());
            set("NUM_POINT_LIGHTS", lights.point.to_string());
            set("NUM_SPOT_LIGHTS", lights.spot.to_string());
            set("NUM_HEMI_LIGHTS", lights.hemisphere.to_string());
            set("NUM_RECT_AREA_LIGHTS", lights.rect_area.to_string());
            set("NUM_DIR_SHADOWS", lights.directional_shadows.to_string());
            set("NUM_POINT_SHADOWS", lights.point_shadows.to_string());
            set("NUM_SPOT_SHADOWS", lights.spot_shadows.to_string());
            if lights.shadows() > 0 {
                set("USE_SHADOWS", "1".into());
                let filter = match self.shadow_type {
                    ShadowType::Basic => "SHADOW_BASIC",
                    ShadowType::Pcf => "SHADOW_PCF",
                    ShadowType::PcfSoft => "SHADOW_PCF_SOFT",
                };
                set(filter, "1".into());
            }
        }

        set("NUM_CLIPPING_PLANES", self.clipping_planes.to_string());

        let tone_mapping = match self.tone_mapping {
            ToneMapping::None => None,
            ToneMapping::Linear => Some("TONE_MAPPING_LINEAR"),
            ToneMapping::Reinhard => Some("TONE_MAPPING_REINHARD"),
            ToneMapping::Cineon => Some("TONE_MAPPING_CINEON"),
            ToneMapping::AcesFilmic => Some("TONE_MAPPING_ACES"),
        };
        if let Some(operator) = tone_mapping {
            set("TONE_MAPPING", "1".into());
            set(operator, "1".into());
        }
        if self.output_encoding == OutputEncoding::Srgb {
            set("OUTPUT_SRGB", "1".into());
        }
        defines
    }

    /// Deterministic key; equal keys share one program.
    pub fn cache_key(&self) -> String {
        let mut parts = vec![self.kind.name().to_string()];
        if let MaterialKind::Shader(source) = &self.kind {
            let mut hasher = DefaultHasher::new();
            source.hash(&mut hasher);
            parts.push(format!("{:016x}", hasher.finish()));
        }
        parts.extend(
            self.defines()
                .into_iter()
                .map(|(name, value)| format!("{name}={value}")),
        );
        parts.push(format!("blend={}", self.blending));
        if !self.custom_cache_key.is_empty() {
            parts.push(format!("custom={}", self.custom_cache_key));
        }
        parts.join(";")
    }

    /// Vertex and fragment templates for the kind.
    pub fn templates(&self) -> (&str, &str) {
        match &self.kind {
            MaterialKind::Depth => (chunks::MESH_VERTEX, chunks::DEPTH_FRAGMENT),
            MaterialKind::Distance => (chunks::MESH_VERTEX, chunks::DISTANCE_FRAGMENT),
            MaterialKind::Shader(source) => (&source.vertex, &source.fragment),
            _ => (chunks::MESH_VERTEX, chunks::MESH_FRAGMENT),
        }
    }
}
