//! Platform audio input boundary and its cpal implementation.
//! The capture thread owns the stream; cpal's callback only forwards PCM
//! chunks through a bounded channel and the blocking `read` reassembles them
//! into fixed-size interleaved stereo blocks.

use std::collections::VecDeque;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel as cb;
use tracing::{debug, info, warn};

use super::{AudioConfig, CaptureError};

/// Output channel layout of every `AudioStream::read`: interleaved stereo.
pub const OUTPUT_CHANNELS: usize = 2;

/// An open capture stream. Lives on the capture thread only.
pub trait AudioStream {
    /// Fill `buf` with `frames` interleaved stereo i16 frames, blocking for at
    /// most the configured read timeout. Returns the number of frames read.
    fn read(&mut self, buf: &mut [i16], frames: usize) -> Result<usize, CaptureError>;

    /// Attempt to recover after a failed read. An error means the stream is unusable.
    fn recover(&mut self, err: &CaptureError) -> Result<(), CaptureError>;

    /// Release the hardware handle.
    fn close(&mut self);
}

/// Opens capture streams. Called on the capture thread.
pub trait InputDevice: Send + 'static {
    type Stream: AudioStream;

    fn open(&self, config: &AudioConfig) -> Result<Self::Stream, CaptureError>;
}

/// Callback chunks buffered between cpal and the capture thread.
const CHUNK_QUEUE_DEPTH: usize = 64;

/// cpal-backed input device selected by name preference.
#[derive(Debug, Clone, Default)]
pub struct CpalInput;

impl CpalInput {
    pub fn new() -> Self {
        Self
    }

    fn select_device(preferred: &[String]) -> Result<cpal::Device, CaptureError> {
        let host = cpal::default_host();

        if !preferred.is_empty() {
            let devices: Vec<cpal::Device> = host
                .input_devices()
                .map_err(|e| CaptureError::Open(e.to_string()))?
                .collect();
            for wanted in preferred {
                for device in &devices {
                    if let Ok(name) = device.name() {
                        if name == *wanted || name.contains(wanted.as_str()) {
                            info!(device = %name, "audio input device selected");
                            return Ok(device.clone());
                        }
                    }
                }
                debug!(device = %wanted, "preferred audio device not present");
            }
        }

        let device = host.default_input_device().ok_or(CaptureError::NoDevice)?;
        info!(
            device = %device.name().unwrap_or_else(|_| "<unknown>".into()),
            "using default audio input device"
        );
        Ok(device)
    }
}

impl InputDevice for CpalInput {
    type Stream = CpalStream;

    fn open(&self, config: &AudioConfig) -> Result<CpalStream, CaptureError> {
        let device = Self::select_device(&config.devices)?;

        // Stereo first, then mono (duplicated into both channels on read).
        let mut last_err = None;
        for channels in [config.channels, 1] {
            match build_stream(&device, config, channels) {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    warn!(channels, error = %e, "input stream configuration rejected");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or(CaptureError::NoDevice))
    }
}

fn build_stream(
    device: &cpal::Device,
    config: &AudioConfig,
    channels: u16,
) -> Result<CpalStream, CaptureError> {
    let stream_config = cpal::StreamConfig {
        channels,
        sample_rate: cpal::SampleRate(config.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let (tx, rx) = cb::bounded::<Vec<i16>>(CHUNK_QUEUE_DEPTH);
    let (err_tx, err_rx) = cb::bounded::<String>(8);

    let i16_tx = tx.clone();
    let i16_err = err_tx.clone();
    let stream = match device.build_input_stream(
        &stream_config,
        move |data: &[i16], _: &cpal::InputCallbackInfo| {
            // Overrun: drop the chunk rather than block the audio callback.
            let _ = i16_tx.try_send(data.to_vec());
        },
        move |err| {
            let _ = i16_err.try_send(err.to_string());
        },
        None,
    ) {
        Ok(stream) => stream,
        Err(first_err) => {
            debug!(error = %first_err, "i16 input unsupported, trying f32");
            device
                .build_input_stream(
                    &stream_config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        let pcm = data
                            .iter()
                            .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0) as i16)
                            .collect();
                        let _ = tx.try_send(pcm);
                    },
                    move |err| {
                        let _ = err_tx.try_send(err.to_string());
                    },
                    None,
                )
                .map_err(|e| CaptureError::Stream(e.to_string()))?
        }
    };

    stream
        .play()
        .map_err(|e| CaptureError::Stream(e.to_string()))?;
    info!(
        sample_rate = config.sample_rate,
        channels, "audio capture stream started"
    );

    Ok(CpalStream {
        stream,
        rx,
        err_rx,
        pending: VecDeque::with_capacity(config.awake_block_frames * channels as usize * 2),
        device_channels: channels.max(1) as usize,
        read_timeout: config.read_timeout,
    })
}

pub struct CpalStream {
    stream: cpal::Stream,
    rx: cb::Receiver<Vec<i16>>,
    err_rx: cb::Receiver<String>,
    pending: VecDeque<i16>,
    device_channels: usize,
    read_timeout: Duration,
}

impl AudioStream for CpalStream {
    fn read(&mut self, buf: &mut [i16], frames: usize) -> Result<usize, CaptureError> {
        if let Ok(msg) = self.err_rx.try_recv() {
            return Err(CaptureError::Fault(msg));
        }

        let frames = frames.min(buf.len() / OUTPUT_CHANNELS);
        let need = frames * self.device_channels;
        while self.pending.len() < need {
            match self.rx.recv_timeout(self.read_timeout) {
                Ok(chunk) => self.pending.extend(chunk),
                Err(cb::RecvTimeoutError::Timeout) => {
                    return Err(CaptureError::Timeout(self.read_timeout))
                }
                Err(cb::RecvTimeoutError::Disconnected) => return Err(CaptureError::Closed),
            }
        }

        let width = self.device_channels;
        for f in 0..frames {
            let left = self.pending.pop_front().unwrap_or(0);
            let right = if width > 1 {
                self.pending.pop_front().unwrap_or(0)
            } else {
                left
            };
            // Channels past the first two are discarded.
            for _ in OUTPUT_CHANNELS..width {
                self.pending.pop_front();
            }
            buf[f * OUTPUT_CHANNELS] = left;
            buf[f * OUTPUT_CHANNELS + 1] = right;
        }
        Ok(frames)
    }

    fn recover(&mut self, err: &CaptureError) -> Result<(), CaptureError> {
        match err {
            CaptureError::Closed => Err(CaptureError::Closed),
            _ => {
                while self.err_rx.try_recv().is_ok() {}
                self.pending.clear();
                self.stream
                    .play()
                    .map_err(|e| CaptureError::Fault(e.to_string()))
            }
        }
    }

    fn close(&mut self) {
        if let Err(e) = self.stream.pause() {
            debug!(error = %e, "pause on close failed");
        }
        info!("audio capture stream closed");
    }
}
