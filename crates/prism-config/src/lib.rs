//! Configuration system for the Prism renderer.
//!
//! Provides runtime-configurable settings that persist to disk as RON files.
//! Supports CLI overrides via clap, hot-reload detection, and forward/backward
//! compatible serialization. The rendering enums shared with `prism-render`
//! (tone mapping, output encoding, shader precision, shadow filtering) are
//! defined here so a config file maps directly onto renderer settings.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{
    Config, DebugConfig, OutputEncoding, Precision, RenderConfig, ShadowConfig, ShadowType,
    ToneMapping, WindowConfig,
};
pub use error::ConfigError;

/// Directory name used under the platform config directory.
pub const APP_DIR_NAME: &str = "prism";

/// Resolve the default configuration directory (`<platform config dir>/prism`).
///
/// Returns `None` when the platform has no notion of a per-user config directory.
pub fn default_config_dir() -> Option<std::path::PathBuf> {
    dirs::config_dir().map(|base| base.join(APP_DIR_NAME))
}
