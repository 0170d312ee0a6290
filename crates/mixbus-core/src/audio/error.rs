//! Audio engine error types

use std::fmt;

use thiserror::Error;

use crate::types::{Direction, SlotId};

/// Error categories reported to the UI collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Device list unavailable or too few compatible devices (fatal at startup)
    DeviceEnumerationFailure,
    /// A stream could not be opened; the engine rolled back to Idle
    StreamOpenFailure,
    /// A running stream reported an error or its callback panicked
    CallbackFault,
    /// Bad slot index, unknown device or invalid configuration
    InvalidRequest,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::DeviceEnumerationFailure => "device enumeration failure",
            ErrorKind::StreamOpenFailure => "stream open failure",
            ErrorKind::CallbackFault => "callback fault",
            ErrorKind::InvalidRequest => "invalid request",
        };
        f.write_str(name)
    }
}

/// Errors that can occur during audio operations
#[derive(Error, Debug)]
pub enum AudioError {
    /// The audio host could not list its devices
    #[error("Failed to enumerate audio devices: {0}")]
    Enumeration(String),

    /// Fewer compatible devices than the configuration requires
    #[error("Not enough stereo {direction} devices: found {found}, need {required}")]
    InsufficientDevices {
        direction: Direction,
        found: usize,
        required: usize,
    },

    /// Device not found
    #[error("Audio device not found: {0}")]
    DeviceNotFound(String),

    /// The device has no usable stream configuration
    #[error("Failed to get device config: {0}")]
    ConfigError(String),

    /// Failed to build audio stream
    #[error("Failed to build audio stream: {0}")]
    StreamBuildError(String),

    /// Failed to start/play stream
    #[error("Failed to start audio stream: {0}")]
    StreamPlayError(String),

    /// The stream did not open within the configured timeout
    #[error("Timed out opening audio stream after {0} ms")]
    StreamOpenTimeout(u64),

    /// A stream is already open on this device in this direction
    #[error("Audio device busy: {0}")]
    DeviceBusy(String),

    /// Opening the stream for a slot failed; the engine is back in Idle
    #[error("Could not open {slot} on '{device}': {source}")]
    StreamOpen {
        slot: SlotId,
        device: String,
        #[source]
        source: Box<AudioError>,
    },

    /// Stream error reported by the hardware layer, or a panicking callback
    #[error("Audio stream fault on {slot}: {message}")]
    CallbackFault { slot: SlotId, message: String },

    /// Repeated faults on a running stream
    #[error("{slot} failed after {faults} stream faults")]
    StreamFailed { slot: SlotId, faults: u32 },

    /// Unsupported sample format
    #[error("Unsupported sample format: {0}")]
    UnsupportedFormat(String),

    /// Slot index out of range
    #[error("No such {direction} slot: {index} (have {count})")]
    InvalidSlot {
        direction: Direction,
        index: usize,
        count: usize,
    },

    /// Invalid engine configuration
    #[error("Invalid engine configuration: {0}")]
    InvalidConfig(String),

    /// Fader, gain or routing value out of range
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}

impl AudioError {
    /// Category of this error for UI reporting
    pub fn kind(&self) -> ErrorKind {
        match self {
            AudioError::Enumeration(_) | AudioError::InsufficientDevices { .. } => {
                ErrorKind::DeviceEnumerationFailure
            }
            AudioError::ConfigError(_)
            | AudioError::StreamBuildError(_)
            | AudioError::StreamPlayError(_)
            | AudioError::StreamOpenTimeout(_)
            | AudioError::DeviceBusy(_)
            | AudioError::UnsupportedFormat(_)
            | AudioError::StreamOpen { .. }
            | AudioError::StreamFailed { .. } => ErrorKind::StreamOpenFailure,
            AudioError::CallbackFault { .. } => ErrorKind::CallbackFault,
            AudioError::DeviceNotFound(_)
            | AudioError::InvalidSlot { .. }
            | AudioError::InvalidConfig(_)
            | AudioError::InvalidParameter(_) => ErrorKind::InvalidRequest,
        }
    }
}

/// Result type for audio operations
pub type AudioResult<T> = Result<T, AudioError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_open_wraps_cause() {
        let err = AudioError::StreamOpen {
            slot: SlotId::output(2),
            device: "USB Audio".into(),
            source: Box::new(AudioError::StreamBuildError("device unplugged".into())),
        };

        assert_eq!(err.kind(), ErrorKind::StreamOpenFailure);
        assert_eq!(
            err.to_string(),
            "Could not open output 3 on 'USB Audio': Failed to build audio stream: device unplugged"
        );
    }

    #[test]
    fn test_kinds() {
        let insufficient = AudioError::InsufficientDevices {
            direction: Direction::Input,
            found: 1,
            required: 4,
        };
        assert_eq!(insufficient.kind(), ErrorKind::DeviceEnumerationFailure);
        assert_eq!(
            insufficient.to_string(),
            "Not enough stereo input devices: found 1, need 4"
        );

        let fault = AudioError::CallbackFault {
            slot: SlotId::input(0),
            message: "xrun".into(),
        };
        assert_eq!(fault.kind(), ErrorKind::CallbackFault);

        let slot = AudioError::InvalidSlot {
            direction: Direction::Output,
            index: 9,
            count: 6,
        };
        assert_eq!(slot.kind(), ErrorKind::InvalidRequest);
    }
}
