//! Command-line argument parsing for Prism binaries.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Prism command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "prism", about = "Prism headless renderer")]
pub struct CliArgs {
    /// Surface width in CSS pixels.
    #[arg(long)]
    pub width: Option<u32>,

    /// Surface height in CSS pixels.
    #[arg(long)]
    pub height: Option<u32>,

    /// Device pixels per CSS pixel.
    #[arg(long)]
    pub pixel_ratio: Option<f32>,

    /// MSAA sample count for the presentable surface.
    #[arg(long)]
    pub msaa: Option<u32>,

    /// Enable or disable shadow maps.
    #[arg(long)]
    pub shadows: Option<bool>,

    /// Number of frames to drive before exiting.
    #[arg(long)]
    pub frames: Option<u32>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(w) = args.width {
            self.window.width = w;
        }
        if let Some(h) = args.height {
            self.window.height = h;
        }
        if let Some(ratio) = args.pixel_ratio {
            self.render.pixel_ratio = ratio;
        }
        if let Some(samples) = args.msaa {
            self.render.msaa_samples = samples;
        }
        if let Some(enabled) = args.shadows {
            self.render.shadows.enabled = enabled;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_override() {
        let mut config = Config::default();
        let args = CliArgs {
            width: Some(1920),
            pixel_ratio: Some(2.0),
            shadows: Some(false),
            ..Default::default()
        };
        config.apply_cli_overrides(&args);
        assert_eq!(config.window.width, 1920);
        assert_eq!(config.render.pixel_ratio, 2.0);
        assert!(!config.render.shadows.enabled);
        // Non-overridden fields retain defaults
        assert_eq!(config.window.height, 720);
        assert_eq!(config.render.msaa_samples, 1);
    }

    #[test]
    fn test_cli_no_override() {
        let original = Config::default();
        let mut config = Config::default();
        config.apply_cli_overrides(&CliArgs::default());
        assert_eq!(config, original);
    }

    #[test]
    fn test_cli_parses_flags() {
        let args = CliArgs::parse_from(["prism", "--width", "640", "--frames", "3", "--msaa", "4"]);
        assert_eq!(args.width, Some(640));
        assert_eq!(args.frames, Some(3));
        assert_eq!(args.msaa, Some(4));
        assert!(args.config.is_none());
    }
}
