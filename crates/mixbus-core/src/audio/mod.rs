//! Audio device layer for Mixbus
//!
//! Everything the engine needs from the platform, behind one trait:
//!
//! - **Devices**: enumeration across every host, filtered per direction to
//!   stereo-capable devices
//! - **Streams**: opening a capture or playback stream on a device with a raw
//!   interleaved f32 callback, and closing it again within a bound
//! - **Health**: per-stream fault counting and in-flight callback tracking
//!
//! # Backends
//!
//! - [`CpalBackend`]: ALSA, JACK, PulseAudio, CoreAudio, WASAPI... through cpal
//! - [`VirtualBackend`]: in-process devices driven by the caller (tests, simulation)
//!
//! # Example Usage
//!
//! ```ignore
//! use mixbus_core::audio::{AudioBackend, CpalBackend, Direction};
//!
//! let backend = CpalBackend::new();
//! for device in backend.devices()? {
//!     if device.supports(Direction::Output) {
//!         println!("{}", device.display_name());
//!     }
//! }
//! ```

mod backend;
mod cpal_backend;
mod device;
mod error;
mod virtual_backend;

pub use backend::{
    AudioBackend, AudioStream, CallbackGuard, CaptureCallback, PlaybackCallback, StreamFault,
    StreamHealth, StreamRequest,
};
pub use cpal_backend::{CpalBackend, CpalStream};
pub use device::{
    compatible_devices, enumerate_cpal_devices, find_cpal_device, AudioDevice, DeviceId,
};
pub use error::{AudioError, AudioResult, ErrorKind};
pub use virtual_backend::{VirtualBackend, VirtualStream, VIRTUAL_HOST};

pub use crate::types::Direction;
