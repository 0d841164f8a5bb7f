mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{wait_until, MissingDevice, ToneDevice};
use oledviz::audio::CaptureError;
use oledviz::cancellation::ShutdownSignal;
use oledviz::config::VisualizerConfig;
use oledviz::controller::{control_channel, Cadence, ControlEvent, ControlLoop};
use oledviz::metrics::MetricsRegistry;
use oledviz::power::{PowerState, PowerTransition, TransitionCause};
use oledviz::render::{FrameSnapshot, RenderSink, Visualization};
use oledviz::{StartupError, Visualizer};

fn config(silence_timeout_secs: f64) -> VisualizerConfig {
    let mut config = VisualizerConfig::default();
    config.audio.silence_timeout_secs = silence_timeout_secs;
    config.mpd.enabled = false;
    config
}

fn start(config: &VisualizerConfig, device: ToneDevice) -> Visualizer {
    match Visualizer::start(
        config,
        device,
        ShutdownSignal::new(),
        Arc::new(MetricsRegistry::new()),
    ) {
        Ok(v) => v,
        Err(e) => panic!("start failed: {e}"),
    }
}

/// Tick until `state` is reached, returning every transition seen on the way.
fn tick_until(viz: &Visualizer, state: PowerState, timeout: Duration) -> Vec<PowerTransition> {
    let mut seen = Vec::new();
    let reached = wait_until(timeout, || {
        if let Some(t) = viz.tick() {
            seen.push(t);
        }
        viz.get_power_state() == state
    });
    assert!(reached, "never reached {state}");
    seen
}

#[test]
fn startup_fails_without_device() {
    let result = Visualizer::start(
        &config(10.0),
        MissingDevice,
        ShutdownSignal::new(),
        Arc::new(MetricsRegistry::new()),
    );
    match result {
        Err(StartupError::Capture(CaptureError::NoDevice)) => {}
        Err(e) => panic!("unexpected error {e}"),
        Ok(_) => panic!("start succeeded without a device"),
    }
}

#[test]
fn captured_tone_lands_in_its_band() {
    let (device, control) = ToneDevice::new(1000.0, 0.5);
    let viz = start(&config(10.0), device);
    assert!(wait_until(Duration::from_secs(2), || control.reads() >= 10));

    let mut levels = viz.get_band_levels();
    for _ in 0..5 {
        levels = viz.get_band_levels();
    }
    let top = (0..7).max_by_key(|&i| levels.left[i]).unwrap();
    assert_eq!(top, 3, "levels {:?}", levels.left);
    assert_eq!(levels.left, levels.right);

    let (left, right) = viz.get_waveform(64);
    assert_eq!(left.len(), 64);
    assert_eq!(left, right);
    assert!(left.iter().any(|v| v.abs() > 0.1));

    let stereo = viz.get_stereo_metric();
    assert!((stereo.correlation - 1.0).abs() < 1e-4);
}

#[test]
fn silence_sleeps_once_and_transient_wakes_once() {
    let (device, control) = ToneDevice::new(1000.0, 0.0);
    let viz = start(&config(0.3), device);

    let to_sleep = tick_until(&viz, PowerState::Asleep, Duration::from_secs(3));
    assert_eq!(to_sleep.len(), 1);
    assert_eq!(to_sleep[0].cause, TransitionCause::Silence);

    for _ in 0..30 {
        assert!(viz.tick().is_none());
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(viz.capture().is_sleeping());
    assert!(wait_until(Duration::from_secs(1), || control.last_block_frames() == 256));

    // Loud blocks read while asleep are measured but never reach the ring.
    let mut power = viz.subscribe_power();
    assert_eq!(*power.borrow_and_update(), PowerState::Asleep);
    control.set_amplitude(0.5);
    let reads = control.reads();
    assert!(wait_until(Duration::from_secs(1), || control.reads() >= reads + 10));
    assert!(viz.capture().peak_amplitude() > 0.4);
    let (left, right) = viz.get_waveform(256);
    assert!(left.iter().chain(&right).all(|v| *v == 0.0));

    let to_wake = tick_until(&viz, PowerState::Awake, Duration::from_secs(1));
    assert_eq!(to_wake.len(), 1);
    assert_eq!(to_wake[0].cause, TransitionCause::AudioDetected);
    assert!(power.has_changed().unwrap_or(false));
    assert_eq!(*power.borrow_and_update(), PowerState::Awake);
    assert!(wait_until(Duration::from_secs(1), || {
        viz.get_waveform(256).0.iter().any(|v| v.abs() > 0.1)
    }));

    for _ in 0..20 {
        assert!(viz.tick().is_none());
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(!viz.capture().is_sleeping());
}

#[test]
fn wake_request_wakes_silent_device_with_full_grace_period() {
    let (device, _control) = ToneDevice::new(1000.0, 0.0);
    let viz = start(&config(0.3), device);
    tick_until(&viz, PowerState::Asleep, Duration::from_secs(3));

    viz.request_wake();
    let t = viz.tick().expect("wake transition");
    assert_eq!(t.cause, TransitionCause::WakeRequest);
    assert!(viz.tick().is_none());
    assert_eq!(viz.get_power_state(), PowerState::Awake);

    let again = tick_until(&viz, PowerState::Asleep, Duration::from_secs(3));
    assert_eq!(again.len(), 1);
}

#[test]
fn capture_survives_recoverable_faults() {
    let (device, control) = ToneDevice::new(440.0, 0.5);
    control.fail_reads(5);
    let viz = start(&config(10.0), device);

    assert!(wait_until(Duration::from_secs(2), || control.reads() > 10));
    assert!(viz.capture().is_running());
    let (left, _) = viz.get_waveform(32);
    assert!(left.iter().any(|v| v.abs() > 0.1));
}

#[test]
fn stop_joins_capture_thread() {
    let (device, _control) = ToneDevice::new(440.0, 0.5);
    let viz = start(&config(10.0), device);
    assert!(viz.capture().is_running());
    viz.stop();
    assert!(!viz.capture().is_running());
    viz.stop();
}

#[derive(Default)]
struct RecordingSink {
    frames: Vec<(Visualization, u32, u32)>,
    edges: Vec<PowerState>,
}

impl RenderSink for RecordingSink {
    fn render(&mut self, frame: &FrameSnapshot) {
        self.frames
            .push((frame.visualization, frame.sensitivity, frame.noise_reduction));
    }

    fn power_changed(&mut self, state: PowerState) {
        self.edges.push(state);
    }
}

#[test]
fn control_events_reach_the_next_frame() {
    let (device, _control) = ToneDevice::new(1000.0, 0.5);
    let viz = start(&config(10.0), device);
    let (handle, events) = control_channel();
    let mut control_loop =
        ControlLoop::new(&viz, events, RecordingSink::default(), Cadence::default());

    assert!(handle.send(ControlEvent::NextVisualization));
    assert!(handle.send(ControlEvent::AdjustSensitivity(3)));
    assert!(handle.send(ControlEvent::AdjustNoiseReduction(-20)));
    assert!(control_loop.step());

    assert!(handle.send(ControlEvent::ResetSettings));
    assert!(control_loop.step());

    assert!(handle.request_shutdown());
    control_loop.run();
    assert!(viz.is_shutdown_requested());

    let sink = control_loop.into_sink();
    assert_eq!(sink.frames[0], (Visualization::Spectrum, 130, 0));
    assert_eq!(sink.frames[1], (Visualization::Spectrum, 100, 77));
    assert!(sink.edges.is_empty());
}
