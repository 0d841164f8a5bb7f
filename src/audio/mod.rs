//! Capture engine.
//! Manages: audio device → ring buffer, plus the silence timer that drives sleep.
//! Capture runs on a dedicated thread that blocks only inside the device read.
//! Awake: large blocks, every sample written to the ring buffer.
//! Asleep: small blocks for fast wake detection, ring buffer untouched.

pub mod activity;
pub mod device;
pub mod ring_buffer;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel as cb;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::cancellation::ShutdownSignal;
use crate::metrics::{metric_names, MetricsRegistry};
use crate::power::{PowerAware, PowerState};
use activity::{peak_amplitude, ActivityMonitor};
use device::{AudioStream, InputDevice, OUTPUT_CHANNELS};
use ring_buffer::{Sample, SampleStore};

/// Largest analysis window; the ring buffer holds two of them.
pub const BASS_FFT_SIZE: usize = 8192;

/// Back-off after a failed recovery so a dead stream does not spin the thread.
const RECOVER_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("no audio input device available")]
    NoDevice,
    #[error("failed to open input device: {0}")]
    Open(String),
    #[error("failed to build input stream: {0}")]
    Stream(String),
    #[error("audio read timed out after {0:?}")]
    Timeout(Duration),
    #[error("audio stream fault: {0}")]
    Fault(String),
    #[error("audio stream closed")]
    Closed,
    #[error("failed to spawn capture thread: {0}")]
    Spawn(String),
}

/// Capture configuration.
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Device names to try in order before falling back to the default input.
    pub devices: Vec<String>,
    pub sample_rate: u32,
    pub channels: u16,
    /// Frames per read while awake.
    pub awake_block_frames: usize,
    /// Frames per read while asleep.
    pub asleep_block_frames: usize,
    pub ring_capacity: usize,
    /// Upper bound on a single blocking read.
    pub read_timeout: Duration,
    pub silence_threshold: f32,
    pub silence_timeout: Duration,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            devices: vec!["cava".into(), "hw:Loopback,1".into()],
            sample_rate: 44100,
            channels: 2,
            awake_block_frames: 2048,
            asleep_block_frames: 256,
            ring_capacity: BASS_FFT_SIZE * 2,
            read_timeout: Duration::from_millis(250),
            silence_threshold: 0.001,
            silence_timeout: Duration::from_secs(10),
        }
    }
}

/// Running capture engine. Dropping it stops and joins the capture thread.
pub struct CaptureEngine {
    activity: Arc<ActivityMonitor>,
    sleeping: Arc<AtomicBool>,
    stop_flag: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

struct CaptureContext {
    config: AudioConfig,
    store: Arc<SampleStore>,
    activity: Arc<ActivityMonitor>,
    sleeping: Arc<AtomicBool>,
    stop_flag: Arc<AtomicBool>,
    shutdown: ShutdownSignal,
    metrics: Arc<MetricsRegistry>,
}

impl CaptureContext {
    fn should_stop(&self) -> bool {
        self.stop_flag.load(Ordering::Relaxed) || self.shutdown.is_requested()
    }
}

impl CaptureEngine {
    /// Open the device on a new capture thread and start reading. Returns
    /// only after the device opened; an open failure is returned here and
    /// leaves nothing running.
    pub fn start<D: InputDevice>(
        config: AudioConfig,
        device: D,
        store: Arc<SampleStore>,
        shutdown: ShutdownSignal,
        metrics: Arc<MetricsRegistry>,
    ) -> Result<Self, CaptureError> {
        let activity = Arc::new(ActivityMonitor::new(
            config.silence_threshold,
            config.silence_timeout,
        ));
        let sleeping = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::new(AtomicBool::new(false));

        let ctx = CaptureContext {
            config,
            store,
            activity: Arc::clone(&activity),
            sleeping: Arc::clone(&sleeping),
            stop_flag: Arc::clone(&stop_flag),
            shutdown,
            metrics,
        };

        let (ready_tx, ready_rx) = cb::bounded::<Result<(), CaptureError>>(1);
        let thread = std::thread::Builder::new()
            .name("audio-capture".into())
            .spawn(move || {
                let mut stream = match device.open(&ctx.config) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                run_capture_loop(&mut stream, &ctx);
                stream.close();
                info!("audio capture loop stopped");
            })
            .map_err(|e| CaptureError::Spawn(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(CaptureError::Spawn(
                    "capture thread exited before opening the device".into(),
                ));
            }
        }

        Ok(Self {
            activity,
            sleeping,
            stop_flag,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// True while the last above-threshold block is younger than the silence timeout.
    pub fn check_for_audio(&self) -> bool {
        self.activity.has_audio()
    }

    /// Peak amplitude of the most recent block.
    pub fn peak_amplitude(&self) -> f32 {
        self.activity.last_peak()
    }

    pub fn is_sleeping(&self) -> bool {
        self.sleeping.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.thread
            .lock()
            .as_ref()
            .map(|t| !t.is_finished())
            .unwrap_or(false)
    }

    /// Stop the capture thread and wait for it to release the device.
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                warn!("audio capture thread panicked");
            }
        }
    }
}

impl PowerAware for CaptureEngine {
    fn set_power_state(&self, state: PowerState) {
        let asleep = state == PowerState::Asleep;
        let was = self.sleeping.swap(asleep, Ordering::SeqCst);
        if !asleep {
            // A wake (including an explicit one) earns a full timeout before the next sleep.
            self.activity.touch(Instant::now());
        }
        if was != asleep {
            info!(state = %state, "capture_power_state");
        }
    }
}

impl Drop for CaptureEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Capture loop: block on the device, update the silence timer, and feed
/// the ring buffer while awake.
fn run_capture_loop<S: AudioStream>(stream: &mut S, ctx: &CaptureContext) {
    let awake_frames = ctx.config.awake_block_frames.max(1);
    let asleep_frames = ctx.config.asleep_block_frames.clamp(1, awake_frames);
    let mut pcm = vec![0i16; awake_frames * OUTPUT_CHANNELS];
    let mut block: Vec<Sample> = Vec::with_capacity(awake_frames);

    info!(awake_frames, asleep_frames, "audio capture loop started");

    while !ctx.should_stop() {
        let asleep = ctx.sleeping.load(Ordering::Relaxed);
        let frames = if asleep { asleep_frames } else { awake_frames };

        let span = ctx.metrics.span(metric_names::CAPTURE_READ);
        let read = match stream.read(&mut pcm[..frames * OUTPUT_CHANNELS], frames) {
            Ok(n) => n.min(frames),
            Err(err) => {
                debug!(error = %err, "audio read failed, recovering");
                if let Err(fatal) = stream.recover(&err) {
                    warn!(error = %fatal, "audio recovery failed, dropping block");
                    ctx.shutdown
                        .wait_for(RECOVER_BACKOFF, || ctx.stop_flag.load(Ordering::Relaxed));
                }
                continue;
            }
        };
        span.finish();

        let interleaved = &pcm[..read * OUTPUT_CHANNELS];
        let peak = peak_amplitude(interleaved);

        if !asleep {
            block.clear();
            block.extend(
                interleaved
                    .chunks_exact(OUTPUT_CHANNELS)
                    .map(|c| Sample::new(c[0] as f32 / 32768.0, c[1] as f32 / 32768.0)),
            );
            ctx.store.write(&block);
        }

        ctx.activity.observe(peak, Instant::now());
    }
}
