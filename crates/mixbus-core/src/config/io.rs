//! YAML configuration loading
//!
//! Configuration is read-only: the engine never writes settings back.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use std::path::Path;

/// Load configuration from a YAML file, falling back to defaults
///
/// If the file doesn't exist, returns the default config.
/// If the file exists but is invalid, logs a warning and returns the default config.
///
/// # Example
///
/// ```ignore
/// let config: EngineConfig = load_config(Path::new("config.yaml"));
/// ```
pub fn load_config<T>(path: &Path) -> T
where
    T: DeserializeOwned + Default,
{
    log::info!("load_config: Loading from {:?}", path);

    if !path.exists() {
        log::info!("load_config: Config file doesn't exist, using defaults");
        return T::default();
    }

    match read_config(path) {
        Ok(config) => {
            log::info!("load_config: Successfully loaded config from {:?}", path);
            config
        }
        Err(e) => {
            log::warn!("load_config: {:#}, using defaults", e);
            T::default()
        }
    }
}

/// Read configuration from a YAML file, reporting any failure
///
/// Used when the user named the file explicitly and a silent fallback would
/// hide a typo.
pub fn read_config<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned,
{
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;
    serde_yaml::from_str::<T>(&contents)
        .with_context(|| format!("Failed to parse config file: {:?}", path))
}
