//! Configuration structs with sensible defaults and RON persistence.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level renderer configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Output surface settings.
    pub window: WindowConfig,
    /// Rendering settings.
    pub render: RenderConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Output surface configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WindowConfig {
    /// Surface width in CSS (logical) pixels.
    pub width: u32,
    /// Surface height in CSS (logical) pixels.
    pub height: u32,
    /// Surface title, used for log output.
    pub title: String,
}

/// Tone mapping operator applied when rendering to the presentable surface.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ToneMapping {
    /// Output radiance is written unchanged.
    #[default]
    None,
    /// Exposure scaling only.
    Linear,
    /// Reinhard `x / (1 + x)`.
    Reinhard,
    /// Optimized Haarm-Peter Duiker curve.
    Cineon,
    /// ACES filmic fit.
    AcesFilmic,
}

/// Color encoding of the final framebuffer write.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum OutputEncoding {
    /// Linear values are written unchanged.
    #[default]
    Linear,
    /// Linear values are converted with the sRGB transfer function.
    Srgb,
}

/// Shader float precision request.
///
/// The renderer clamps the request to what the device reports as supported.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub enum Precision {
    Low,
    Medium,
    #[default]
    High,
}

/// Shadow map filtering mode.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ShadowType {
    /// Single hardware comparison tap.
    Basic,
    /// Four-tap percentage-closer filtering.
    #[default]
    Pcf,
    /// Nine-tap percentage-closer filtering.
    PcfSoft,
}

/// Shadow map configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ShadowConfig {
    /// Render shadow maps for shadow-casting lights.
    pub enabled: bool,
    /// Default square shadow map size in texels (lights may override).
    pub map_size: u32,
    /// Filtering applied when sampling shadow maps.
    pub shadow_type: ShadowType,
    /// Re-render shadow maps every frame; when false they render only on request.
    pub auto_update: bool,
}

/// Rendering configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RenderConfig {
    /// MSAA sample count for the presentable surface (1, 2, 4).
    pub msaa_samples: u32,
    /// Device pixels per CSS pixel.
    pub pixel_ratio: f32,
    /// Tone mapping operator.
    pub tone_mapping: ToneMapping,
    /// Exposure multiplier fed to the tone mapping operator.
    pub tone_mapping_exposure: f32,
    /// Output color encoding.
    pub output_encoding: OutputEncoding,
    /// Requested shader precision.
    pub precision: Precision,
    /// Shadow map settings.
    pub shadows: ShadowConfig,
    /// Sort opaque and transparent lists every frame.
    pub sort_objects: bool,
    /// Resolution of the transmission prepass relative to the drawing buffer.
    pub transmission_resolution_scale: f32,
    /// Clear color (linear RGB).
    pub clear_color: [f32; 3],
    /// Clear alpha.
    pub clear_alpha: f32,
    /// Clear color, depth and stencil before each render.
    pub auto_clear: bool,
    /// Honour per-material clipping planes.
    pub local_clipping: bool,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
    /// Collect and report shader compile diagnostics.
    pub check_shader_errors: bool,
    /// Directory for JSON log files in debug builds.
    pub log_dir: Option<PathBuf>,
}

// --- Default implementations ---

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            title: "Prism".to_string(),
        }
    }
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            map_size: 1024,
            shadow_type: ShadowType::Pcf,
            auto_update: true,
        }
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            msaa_samples: 1,
            pixel_ratio: 1.0,
            tone_mapping: ToneMapping::None,
            tone_mapping_exposure: 1.0,
            output_encoding: OutputEncoding::Linear,
            precision: Precision::High,
            shadows: ShadowConfig::default(),
            sort_objects: true,
            transmission_resolution_scale: 1.0,
            clear_color: [0.0, 0.0, 0.0],
            clear_alpha: 1.0,
            auto_clear: true,
            local_clipping: false,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            check_shader_errors: true,
            log_dir: None,
        }
    }
}

// --- Load / Save / Reload ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join("config.ron");

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let config_path = config_dir.join("config.ron");
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(&config_path, serialized).map_err(ConfigError::WriteError)?;
        Ok(())
    }

    /// Hot-reload: returns `Some(new_config)` if the file changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let config_path = config_dir.join("config.ron");
        let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
        let new_config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_serializes() {
        let config = Config::default();
        let ron_str =
            ron::ser::to_string_pretty(&config, ron::ser::PrettyConfig::new().depth_limit(3))
                .unwrap();
        assert!(!ron_str.is_empty());
        assert!(ron_str.contains("width: 1280"));
        assert!(ron_str.contains("msaa_samples: 1"));
    }

    #[test]
    fn test_config_roundtrip() {
        let mut config = Config::default();
        config.render.tone_mapping = ToneMapping::AcesFilmic;
        config.render.output_encoding = OutputEncoding::Srgb;
        config.debug.log_dir = Some(PathBuf::from("/tmp/prism-logs"));
        let ron_str = ron::to_string(&config).unwrap();
        let deserialized: Config = ron::from_str(&ron_str).unwrap();
        assert_eq!(config, deserialized);
    }

    #[test]
    fn test_missing_field_uses_default() {
        // Config missing the `debug` section entirely
        let ron_str = "(window: (), render: (shadows: (map_size: 512)))";
        let config: Config = ron::from_str(ron_str).unwrap();
        assert_eq!(config.debug, DebugConfig::default());
        assert_eq!(config.render.shadows.map_size, 512);
        assert!(config.render.shadows.enabled);
    }

    #[test]
    fn test_enum_fields_parse() {
        let ron_str = "(render: (tone_mapping: Reinhard, precision: Medium, shadows: (shadow_type: PcfSoft)))";
        let config: Config = ron::from_str(ron_str).unwrap();
        assert_eq!(config.render.tone_mapping, ToneMapping::Reinhard);
        assert_eq!(config.render.precision, Precision::Medium);
        assert_eq!(config.render.shadows.shadow_type, ShadowType::PcfSoft);
    }

    #[test]
    fn test_extra_field_ignored() {
        let ron_str = "(future_setting: true)";
        // RON with #[serde(default)] and deny_unknown_fields not set should accept this
        let result: Result<Config, _> = ron::from_str(ron_str);
        assert!(result.is_ok());
    }

    #[test]
    fn test_precision_ordering() {
        assert!(Precision::Low < Precision::Medium);
        assert!(Precision::Medium < Precision::High);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.window.width = 1920;
        config.window.height = 1080;
        config.render.pixel_ratio = 2.0;

        config.save(dir.path()).unwrap();
        let loaded = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_load_or_create_writes_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, Config::default());
        assert!(dir.path().join("config.ron").exists());
    }

    #[test]
    fn test_reload_detects_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();

        let mut modified = config.clone();
        modified.render.msaa_samples = 4;
        modified.save(dir.path()).unwrap();

        let result = config.reload(dir.path()).unwrap();
        assert!(result.is_some());
        assert_eq!(result.unwrap().render.msaa_samples, 4);
    }

    #[test]
    fn test_reload_no_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();

        let result = config.reload(dir.path()).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_invalid_ron_produces_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.ron"), "{{not valid}}").unwrap();
        let result = Config::load_or_create(dir.path());
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }
}
