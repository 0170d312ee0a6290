//! CPAL audio backend implementation
//!
//! # Stream ownership
//!
//! cpal streams are not `Send` on every platform, so each stream lives on its
//! own owner thread:
//!
//! ```text
//!  Controller                    Owner thread (one per stream)
//!  ──────────                    ─────────────────────────────
//!  open_input() ──spawn────────► find device, build stream, play()
//!       │                              │
//!       │◄──── ready (Ok/Err) ─────────┤   recv_timeout(open_timeout)
//!       │                              │
//!  CpalStream handle                   │   park on close channel
//!       │                              │
//!  close()/drop ──close──────────────► drop(stream)   (callbacks stop here)
//!       │◄──── closed ─────────────────┘   join
//! ```
//!
//! If the device does not answer within the open timeout the opener returns
//! [`AudioError::StreamOpenTimeout`]; the owner thread notices the abandoned
//! ready channel and drops whatever it eventually built.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{
    BufferSize as CpalBufferSize, FromSample, Sample, SampleFormat, SizedSample, Stream,
    StreamConfig, SupportedBufferSize,
};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};

use super::backend::{
    AudioBackend, AudioStream, CaptureCallback, PlaybackCallback, StreamRequest,
};
use super::device::{enumerate_cpal_devices, find_cpal_device, AudioDevice, DeviceId};
use super::error::{AudioError, AudioResult};
use crate::types::{Direction, SlotId};

/// How long a dropped (not explicitly closed) stream waits for its owner thread
const DROP_CLOSE_TIMEOUT: Duration = Duration::from_millis(500);

/// Hardware backend over every cpal host
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }
}

impl AudioBackend for CpalBackend {
    fn name(&self) -> &'static str {
        "cpal"
    }

    fn devices(&self) -> AudioResult<Vec<AudioDevice>> {
        enumerate_cpal_devices()
    }

    fn open_input(
        &self,
        request: StreamRequest,
        callback: CaptureCallback,
    ) -> AudioResult<Box<dyn AudioStream>> {
        spawn_stream(request, Direction::Input, move |device, request| {
            build_capture_stream(device, request, callback)
        })
    }

    fn open_output(
        &self,
        request: StreamRequest,
        callback: PlaybackCallback,
    ) -> AudioResult<Box<dyn AudioStream>> {
        spawn_stream(request, Direction::Output, move |device, request| {
            build_playback_stream(device, request, callback)
        })
    }
}

/// Handle to a stream running on its owner thread
pub struct CpalStream {
    slot: SlotId,
    device: DeviceId,
    close_tx: Option<Sender<()>>,
    closed_rx: Receiver<()>,
    thread: Option<JoinHandle<()>>,
}

impl CpalStream {
    fn shutdown(&mut self, timeout: Duration) {
        // Dropping the sender wakes the owner thread
        if self.close_tx.take().is_none() {
            return;
        }
        match self.closed_rx.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(thread) = self.thread.take() {
                    let _ = thread.join();
                }
                log::debug!("Closed {} stream on {}", self.slot, self.device.display_label());
            }
            Err(RecvTimeoutError::Timeout) => {
                // Leave the owner thread detached; it exits once the driver lets go
                log::warn!(
                    "{} stream on {} did not close within {:?}",
                    self.slot,
                    self.device.display_label(),
                    timeout
                );
                self.thread.take();
            }
        }
    }
}

impl AudioStream for CpalStream {
    fn slot(&self) -> SlotId {
        self.slot
    }

    fn device(&self) -> &DeviceId {
        &self.device
    }

    fn close(mut self: Box<Self>, timeout: Duration) {
        self.shutdown(timeout);
    }
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        self.shutdown(DROP_CLOSE_TIMEOUT);
    }
}

/// Build and run a stream on a dedicated owner thread
fn spawn_stream<F>(
    request: StreamRequest,
    direction: Direction,
    build: F,
) -> AudioResult<Box<dyn AudioStream>>
where
    F: FnOnce(&cpal::Device, &StreamRequest) -> AudioResult<Stream> + Send + 'static,
{
    let (ready_tx, ready_rx) = channel::bounded::<AudioResult<()>>(1);
    let (close_tx, close_rx) = channel::bounded::<()>(1);
    let (closed_tx, closed_rx) = channel::bounded::<()>(1);

    let slot = request.slot;
    let device_id = request.device.clone();
    let open_timeout = request.open_timeout;

    let thread = thread::Builder::new()
        .name(format!("mixbus-{}-{}", direction, slot.display_number()))
        .spawn(move || {
            let stream = find_cpal_device(&request.device, direction)
                .and_then(|device| build(&device, &request))
                .and_then(|stream| {
                    stream
                        .play()
                        .map_err(|e| AudioError::StreamPlayError(e.to_string()))?;
                    Ok(stream)
                });

            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            if ready_tx.send(Ok(())).is_err() {
                // Opener timed out and went away
                return;
            }

            // Returns on explicit close or when the handle is dropped
            let _ = close_rx.recv();
            if let Err(e) = stream.pause() {
                log::debug!("Pausing {} stream failed: {}", request.slot, e);
            }
            drop(stream);
            let _ = closed_tx.send(());
        })
        .map_err(|e| AudioError::StreamBuildError(format!("failed to spawn stream thread: {}", e)))?;

    match ready_rx.recv_timeout(open_timeout) {
        Ok(Ok(())) => {
            log::info!("Opened {} on {}", slot, device_id.display_label());
            Ok(Box::new(CpalStream {
                slot,
                device: device_id,
                close_tx: Some(close_tx),
                closed_rx,
                thread: Some(thread),
            }))
        }
        Ok(Err(e)) => {
            let _ = thread.join();
            Err(e)
        }
        Err(RecvTimeoutError::Timeout) => Err(AudioError::StreamOpenTimeout(
            open_timeout.as_millis() as u64,
        )),
        Err(RecvTimeoutError::Disconnected) => Err(AudioError::StreamBuildError(
            "stream thread exited before the stream was ready".to_string(),
        )),
    }
}

/// Stream config for a request, using a fixed buffer size when the device allows it
fn stream_config(
    request: &StreamRequest,
    supported_buffer: &SupportedBufferSize,
) -> StreamConfig {
    let buffer_size = match supported_buffer {
        SupportedBufferSize::Range { min, max }
            if (*min..=*max).contains(&request.block_size) =>
        {
            CpalBufferSize::Fixed(request.block_size)
        }
        SupportedBufferSize::Range { min, max } => {
            log::warn!(
                "{} device buffer range {}..={} excludes {} frames, using device default",
                request.slot,
                min,
                max,
                request.block_size
            );
            CpalBufferSize::Default
        }
        SupportedBufferSize::Unknown => CpalBufferSize::Fixed(request.block_size),
    };

    StreamConfig {
        channels: request.channels,
        sample_rate: cpal::SampleRate(request.sample_rate),
        buffer_size,
    }
}

/// Scratch length for format conversion, in samples (frame aligned)
fn scratch_len(request: &StreamRequest) -> usize {
    request.block_size as usize * request.channels as usize
}

fn build_capture_stream(
    device: &cpal::Device,
    request: &StreamRequest,
    callback: CaptureCallback,
) -> AudioResult<Stream> {
    let supported = device
        .default_input_config()
        .map_err(|e| AudioError::ConfigError(e.to_string()))?;
    let config = stream_config(request, supported.buffer_size());

    log::debug!(
        "{}: {} channels, {}Hz, {:?}, {:?}",
        request.slot,
        config.channels,
        config.sample_rate.0,
        config.buffer_size,
        supported.sample_format()
    );

    match supported.sample_format() {
        SampleFormat::F32 => build_capture_typed::<f32>(device, &config, request, callback),
        SampleFormat::I16 => build_capture_typed::<i16>(device, &config, request, callback),
        SampleFormat::U16 => build_capture_typed::<u16>(device, &config, request, callback),
        SampleFormat::I32 => build_capture_typed::<i32>(device, &config, request, callback),
        other => Err(AudioError::UnsupportedFormat(format!("{:?}", other))),
    }
}

fn build_capture_typed<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    request: &StreamRequest,
    mut callback: CaptureCallback,
) -> AudioResult<Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let mut scratch = vec![0.0f32; scratch_len(request)];
    let health = request.health.clone();

    device
        .build_input_stream(
            config,
            move |data: &[T], _info: &cpal::InputCallbackInfo| {
                for chunk in data.chunks(scratch.len()) {
                    let converted = &mut scratch[..chunk.len()];
                    for (dst, src) in converted.iter_mut().zip(chunk) {
                        *dst = f32::from_sample(*src);
                    }
                    callback(converted);
                }
            },
            move |err| {
                health.report_fault(&err.to_string());
            },
            Some(request.open_timeout),
        )
        .map_err(|e| AudioError::StreamBuildError(e.to_string()))
}

fn build_playback_stream(
    device: &cpal::Device,
    request: &StreamRequest,
    callback: PlaybackCallback,
) -> AudioResult<Stream> {
    let supported = device
        .default_output_config()
        .map_err(|e| AudioError::ConfigError(e.to_string()))?;
    let config = stream_config(request, supported.buffer_size());

    log::debug!(
        "{}: {} channels, {}Hz, {:?}, {:?}",
        request.slot,
        config.channels,
        config.sample_rate.0,
        config.buffer_size,
        supported.sample_format()
    );

    match supported.sample_format() {
        SampleFormat::F32 => build_playback_typed::<f32>(device, &config, request, callback),
        SampleFormat::I16 => build_playback_typed::<i16>(device, &config, request, callback),
        SampleFormat::U16 => build_playback_typed::<u16>(device, &config, request, callback),
        SampleFormat::I32 => build_playback_typed::<i32>(device, &config, request, callback),
        other => Err(AudioError::UnsupportedFormat(format!("{:?}", other))),
    }
}

fn build_playback_typed<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    request: &StreamRequest,
    mut callback: PlaybackCallback,
) -> AudioResult<Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let mut scratch = vec![0.0f32; scratch_len(request)];
    let health = request.health.clone();

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _info: &cpal::OutputCallbackInfo| {
                for chunk in data.chunks_mut(scratch.len()) {
                    let rendered = &mut scratch[..chunk.len()];
                    callback(rendered);
                    for (dst, src) in chunk.iter_mut().zip(rendered.iter()) {
                        *dst = T::from_sample(*src);
                    }
                }
            },
            move |err| {
                health.report_fault(&err.to_string());
            },
            Some(request.open_timeout),
        )
        .map_err(|e| AudioError::StreamBuildError(e.to_string()))
}
