//! Engine configuration
//!
//! - [`EngineConfig`]: slot counts, stream format, timing and DSP options
//! - Generic YAML loading with fall-back to defaults
//! - Standard config path
//!
//! # Usage
//!
//! ```ignore
//! use mixbus_core::config::{default_config_path, load_config, EngineConfig};
//!
//! let config: EngineConfig = load_config(&default_config_path());
//! config.validate()?;
//! ```

mod engine;
mod io;
mod paths;

pub use engine::{BusNormalization, EngineConfig, FilterMemory, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};
pub use io::{load_config, read_config};
pub use paths::{default_config_dir, default_config_path};
