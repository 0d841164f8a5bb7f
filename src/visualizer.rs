//! The running core: capture engine, analyzers, power coordinator and the
//! optional metadata client, wired together and exposed as the read/write
//! surface the render and input layers use.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::analysis::{
    self, BandLevels, SmoothingParams, SpectralAnalyzer, StereoAnalyzer, StereoMetric,
};
use crate::analysis::spectrum::{DEFAULT_NOISE_REDUCTION, DEFAULT_SENSITIVITY};
use crate::audio::device::InputDevice;
use crate::audio::ring_buffer::SampleStore;
use crate::audio::{CaptureEngine, BASS_FFT_SIZE};
use crate::cancellation::ShutdownSignal;
use crate::config::VisualizerConfig;
use crate::metadata::{Connector, MetadataSource, MetadataSyncClient};
use crate::metrics::{metric_names, MetricsRegistry};
use crate::power::{PowerAware, PowerCoordinator, PowerState, PowerTransition};
use crate::render::{FrameSnapshot, Visualization, WAVEFORM_WINDOW};
use crate::StartupError;

pub struct Visualizer {
    store: Arc<SampleStore>,
    capture: Arc<CaptureEngine>,
    spectrum: Mutex<SpectralAnalyzer>,
    stereo: Mutex<StereoAnalyzer>,
    power: PowerCoordinator,
    metadata: Option<Arc<dyn MetadataSource>>,
    visualization: Mutex<Visualization>,
    shutdown: ShutdownSignal,
    metrics: Arc<MetricsRegistry>,
}

impl Visualizer {
    /// Start capture on `device`. Fails, with nothing left running, if the
    /// device cannot be opened.
    pub fn start<D: InputDevice>(
        config: &VisualizerConfig,
        device: D,
        shutdown: ShutdownSignal,
        metrics: Arc<MetricsRegistry>,
    ) -> Result<Self, StartupError> {
        let audio = config.audio_config();
        let store = Arc::new(SampleStore::new(audio.ring_capacity));
        let sample_rate = audio.sample_rate;

        let capture = Arc::new(CaptureEngine::start(
            audio,
            device,
            Arc::clone(&store),
            shutdown.clone(),
            Arc::clone(&metrics),
        )?);

        let power = PowerCoordinator::new();
        power.register(capture.clone());

        let params =
            SmoothingParams::new(config.analyzer.sensitivity, config.analyzer.noise_reduction);
        info!(
            sensitivity = params.sensitivity,
            noise_reduction = params.noise_reduction,
            sample_rate,
            "visualizer started"
        );

        Ok(Self {
            store,
            capture,
            spectrum: Mutex::new(SpectralAnalyzer::with_params(
                BASS_FFT_SIZE,
                sample_rate,
                params,
            )),
            stereo: Mutex::new(StereoAnalyzer::new(config.analyzer.stereo_window)),
            power,
            metadata: None,
            visualization: Mutex::new(Visualization::default()),
            shutdown,
            metrics,
        })
    }

    /// Start a metadata client on `connector` and put it under power control.
    pub fn attach_metadata<C: Connector>(
        &mut self,
        config: &VisualizerConfig,
        connector: C,
    ) -> Result<(), StartupError> {
        let client = Arc::new(MetadataSyncClient::start(
            connector,
            config.sync_timing(),
            self.shutdown.clone(),
            Arc::clone(&self.metrics),
        )?);
        self.power.register(client.clone());
        if self.power.current() == PowerState::Asleep {
            client.set_power_state(PowerState::Asleep);
        }
        if let Some(previous) = self.metadata.replace(client) {
            previous.stop();
        }
        Ok(())
    }

    pub fn get_band_levels(&self) -> BandLevels {
        let span = self.metrics.span(metric_names::SPECTRUM_ANALYSIS);
        let levels = self.spectrum.lock().analyze(&self.store);
        span.finish();
        levels
    }

    pub fn get_stereo_metric(&self) -> StereoMetric {
        let span = self.metrics.span(metric_names::STEREO_ANALYSIS);
        let metric = self.stereo.lock().analyze(&self.store);
        span.finish();
        metric
    }

    /// Band average per channel. Runs one spectrum analysis.
    pub fn get_vu_levels(&self) -> (u8, u8) {
        self.get_band_levels().vu()
    }

    /// Most recent `count` raw samples per channel, oldest first.
    pub fn get_waveform(&self, count: usize) -> (Vec<f32>, Vec<f32>) {
        analysis::waveform(&self.store, count)
            .into_iter()
            .map(|s| (s.left, s.right))
            .unzip()
    }

    /// Empty when no metadata client is attached.
    pub fn get_formatted_track_text(&self) -> String {
        self.metadata
            .as_ref()
            .map(|m| m.formatted_track_text())
            .unwrap_or_default()
    }

    pub fn get_power_state(&self) -> PowerState {
        self.power.current()
    }

    pub fn subscribe_power(&self) -> tokio::sync::watch::Receiver<PowerState> {
        self.power.subscribe()
    }

    pub fn set_sensitivity(&self, value: u32) -> u32 {
        let applied = self.spectrum.lock().set_sensitivity(value);
        info!(sensitivity = applied, "sensitivity_set");
        applied
    }

    pub fn set_noise_reduction(&self, value: u32) -> u32 {
        let applied = self.spectrum.lock().set_noise_reduction(value);
        info!(noise_reduction = applied, "noise_reduction_set");
        applied
    }

    pub fn get_sensitivity(&self) -> u32 {
        self.spectrum.lock().params().sensitivity
    }

    pub fn get_noise_reduction(&self) -> u32 {
        self.spectrum.lock().params().noise_reduction
    }

    /// Back to sensitivity 100, noise reduction 77.
    pub fn reset_settings(&self) {
        self.set_sensitivity(DEFAULT_SENSITIVITY);
        self.set_noise_reduction(DEFAULT_NOISE_REDUCTION);
    }

    pub fn visualization(&self) -> Visualization {
        *self.visualization.lock()
    }

    pub fn next_visualization(&self) -> Visualization {
        let mut current = self.visualization.lock();
        *current = current.next();
        info!(visualization = current.name(), "visualization_changed");
        *current
    }

    /// Wake on the next `tick`, regardless of audio.
    pub fn request_wake(&self) {
        self.power.request_wake();
    }

    pub fn request_shutdown(&self) {
        self.shutdown.request();
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.is_requested()
    }

    pub fn capture(&self) -> &CaptureEngine {
        &self.capture
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    /// Evaluate the power rules once against the capture silence timer.
    pub fn tick(&self) -> Option<PowerTransition> {
        self.power.evaluate(self.capture.check_for_audio())
    }

    /// Everything a renderer needs for one frame.
    pub fn frame(&self, frame: u64) -> FrameSnapshot {
        let bands = self.get_band_levels();
        let params = self.spectrum.lock().params();
        FrameSnapshot {
            frame,
            visualization: self.visualization(),
            bands,
            vu: bands.vu(),
            stereo: self.get_stereo_metric(),
            waveform: analysis::waveform(&self.store, WAVEFORM_WINDOW),
            track_text: self.get_formatted_track_text(),
            sensitivity: params.sensitivity,
            noise_reduction: params.noise_reduction,
        }
    }

    /// Stop the metadata client, then capture. Idempotent.
    pub fn stop(&self) {
        if let Some(metadata) = &self.metadata {
            metadata.stop();
        }
        self.capture.stop();
    }
}

impl Drop for Visualizer {
    fn drop(&mut self) {
        self.stop();
    }
}
