#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use oledviz::audio::device::{AudioStream, InputDevice};
use oledviz::audio::{AudioConfig, CaptureError};

/// Poll `cond` every 5ms until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// Knobs shared between a test and the stream running on the capture thread.
#[derive(Clone, Default)]
pub struct ToneControl {
    amplitude_bits: Arc<AtomicU32>,
    failing_reads: Arc<AtomicUsize>,
    reads: Arc<AtomicUsize>,
    last_block_frames: Arc<AtomicUsize>,
}

impl ToneControl {
    pub fn set_amplitude(&self, amplitude: f32) {
        self.amplitude_bits.store(amplitude.to_bits(), Ordering::SeqCst);
    }

    fn amplitude(&self) -> f32 {
        f32::from_bits(self.amplitude_bits.load(Ordering::SeqCst))
    }

    /// The next `n` reads fail with a recoverable fault.
    pub fn fail_reads(&self, n: usize) {
        self.failing_reads.store(n, Ordering::SeqCst);
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn last_block_frames(&self) -> usize {
        self.last_block_frames.load(Ordering::SeqCst)
    }
}

/// Sine generator standing in for the sound card. Each read takes
/// `block_delay` regardless of size.
pub struct ToneDevice {
    pub control: ToneControl,
    pub freq_hz: f32,
    pub block_delay: Duration,
}

impl ToneDevice {
    pub fn new(freq_hz: f32, amplitude: f32) -> (Self, ToneControl) {
        let control = ToneControl::default();
        control.set_amplitude(amplitude);
        (
            Self {
                control: control.clone(),
                freq_hz,
                block_delay: Duration::from_millis(2),
            },
            control,
        )
    }
}

pub struct ToneStream {
    control: ToneControl,
    freq_hz: f32,
    sample_rate: f32,
    block_delay: Duration,
    n: u64,
}

impl InputDevice for ToneDevice {
    type Stream = ToneStream;

    fn open(&self, config: &AudioConfig) -> Result<ToneStream, CaptureError> {
        Ok(ToneStream {
            control: self.control.clone(),
            freq_hz: self.freq_hz,
            sample_rate: config.sample_rate as f32,
            block_delay: self.block_delay,
            n: 0,
        })
    }
}

impl AudioStream for ToneStream {
    fn read(&mut self, buf: &mut [i16], frames: usize) -> Result<usize, CaptureError> {
        std::thread::sleep(self.block_delay);
        self.control.reads.fetch_add(1, Ordering::SeqCst);
        let failing = self.control.failing_reads.load(Ordering::SeqCst);
        if failing > 0 {
            self.control.failing_reads.store(failing - 1, Ordering::SeqCst);
            return Err(CaptureError::Fault("scripted xrun".into()));
        }

        let amplitude = self.control.amplitude();
        let frames = frames.min(buf.len() / 2);
        for f in 0..frames {
            let t = self.n as f32 / self.sample_rate;
            let v = amplitude * (2.0 * std::f32::consts::PI * self.freq_hz * t).sin();
            let s = (v * 32767.0) as i16;
            buf[2 * f] = s;
            buf[2 * f + 1] = s;
            self.n += 1;
        }
        self.control.last_block_frames.store(frames, Ordering::SeqCst);
        Ok(frames)
    }

    fn recover(&mut self, _err: &CaptureError) -> Result<(), CaptureError> {
        Ok(())
    }

    fn close(&mut self) {}
}

/// A device that is never there.
pub struct MissingDevice;

pub struct NeverStream;

impl AudioStream for NeverStream {
    fn read(&mut self, _buf: &mut [i16], _frames: usize) -> Result<usize, CaptureError> {
        Err(CaptureError::Closed)
    }

    fn recover(&mut self, _err: &CaptureError) -> Result<(), CaptureError> {
        Err(CaptureError::Closed)
    }

    fn close(&mut self) {}
}

impl InputDevice for MissingDevice {
    type Stream = NeverStream;

    fn open(&self, _config: &AudioConfig) -> Result<NeverStream, CaptureError> {
        Err(CaptureError::NoDevice)
    }
}
