//! Mixbus Core - Real-time multi-input, multi-bus stereo mixing engine

pub mod audio;
pub mod config;
pub mod dsp;
pub mod engine;
pub mod types;

pub use types::*;
