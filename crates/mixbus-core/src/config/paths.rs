//! Path utilities for mixbus configuration files

use std::path::PathBuf;

/// Directory holding mixbus configuration
///
/// Returns: `<platform config dir>/mixbus`, or `./mixbus` when the platform
/// has no config directory.
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mixbus")
}

/// Default engine config file
///
/// Returns: `<platform config dir>/mixbus/config.yaml`
pub fn default_config_path() -> PathBuf {
    default_config_dir().join("config.yaml")
}
