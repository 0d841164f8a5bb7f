//! oledviz: dual-channel audio analyzer core for a small OLED music display.
//! Main library: component wiring, tracing setup, process lifecycle.

pub mod analysis;
pub mod audio;
pub mod cancellation;
pub mod config;
pub mod controller;
pub mod metadata;
pub mod metrics;
pub mod power;
pub mod render;
pub mod visualizer;

use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use audio::device::CpalInput;
use audio::CaptureError;
use cancellation::ShutdownSignal;
use config::{ConfigError, VisualizerConfig};
use controller::{control_channel, Cadence, ControlHandle, ControlLoop};
use metadata::MetadataError;
use metrics::MetricsRegistry;
use render::{LogSink, RenderSink};

pub use visualizer::Visualizer;

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("audio capture failed to start: {0}")]
    Capture(#[from] CaptureError),
    #[error("metadata client failed to start: {0}")]
    Metadata(#[from] MetadataError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to install signal handler: {0}")]
    Signal(String),
}

/// Install the global subscriber. Later calls are no-ops.
pub fn init_tracing(default_filter: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("oledviz=info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

/// Run until Ctrl-C or a `Shutdown` event, rendering to a logging sink.
pub fn run(config: VisualizerConfig) -> Result<(), StartupError> {
    run_with(config, CpalInput::new(), LogSink::default(), |_| {})
}

/// Like [`run`], with the audio device and render sink supplied by the
/// caller. `on_ready` receives a control handle once everything is running.
pub fn run_with<D, R>(
    config: VisualizerConfig,
    device: D,
    sink: R,
    on_ready: impl FnOnce(ControlHandle),
) -> Result<(), StartupError>
where
    D: audio::device::InputDevice,
    R: RenderSink,
{
    init_tracing(&config.logging.filter, config.logging.json);
    info!("oledviz starting");

    let shutdown = ShutdownSignal::new();
    let metrics = Arc::new(MetricsRegistry::new());

    let mut visualizer =
        Visualizer::start(&config, device, shutdown.clone(), Arc::clone(&metrics))?;
    if config.mpd.enabled {
        visualizer.attach_metadata(&config, config.mpd_connector())?;
    } else {
        info!("metadata sync disabled");
    }

    let (handle, events) = control_channel();
    let signal_thread = spawn_ctrl_c_handler(handle.clone(), shutdown.clone())?;
    on_ready(handle);

    let cadence = Cadence {
        awake: config.awake_frame_delay(),
        asleep: config.asleep_frame_delay(),
    };
    ControlLoop::new(&visualizer, events, sink, cadence).run();

    shutdown.request();
    visualizer.stop();
    if signal_thread.join().is_err() {
        warn!("signal thread panicked");
    }

    match serde_json::to_string(&metrics.summary()) {
        Ok(summary) => info!(summary = %summary, "metrics_summary"),
        Err(e) => warn!(error = %e, "metrics summary serialization failed"),
    }
    info!("oledviz stopped");
    Ok(())
}

/// Ctrl-C → `Shutdown` event. Runs a single-threaded tokio runtime on its own
/// thread and exits once shutdown is requested by any path.
fn spawn_ctrl_c_handler(
    handle: ControlHandle,
    shutdown: ShutdownSignal,
) -> Result<JoinHandle<()>, StartupError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| StartupError::Signal(e.to_string()))?;

    std::thread::Builder::new()
        .name("signal".into())
        .spawn(move || {
            runtime.block_on(async move {
                tokio::select! {
                    result = tokio::signal::ctrl_c() => match result {
                        Ok(()) => {
                            info!("ctrl_c_received");
                            if !handle.request_shutdown() {
                                shutdown.request();
                            }
                        }
                        Err(e) => warn!(error = %e, "ctrl-c handler unavailable"),
                    },
                    _ = shutdown.token().cancelled() => {}
                }
            });
        })
        .map_err(|e| StartupError::Signal(e.to_string()))
}
