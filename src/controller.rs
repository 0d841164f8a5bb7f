//! Control thread: drains user-intent events, evaluates the power rules,
//! and drives the render sink at the awake or asleep cadence.

use std::time::Duration;

use crossbeam_channel as cb;
use tracing::{debug, info, warn};

use crate::analysis::spectrum::{NOISE_REDUCTION_MAX, SENSITIVITY_MAX, SENSITIVITY_MIN};
use crate::metrics::metric_names;
use crate::power::PowerState;
use crate::render::RenderSink;
use crate::visualizer::Visualizer;

pub const SENSITIVITY_STEP: i64 = 10;
pub const NOISE_REDUCTION_STEP: i64 = 5;

/// Discrete user intents, as produced by the encoder/button decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    Wake,
    Shutdown,
    /// Encoder detents; each one moves sensitivity by 10.
    AdjustSensitivity(i32),
    /// Encoder detents; each one moves noise reduction by 5.
    AdjustNoiseReduction(i32),
    SetSensitivity(u32),
    SetNoiseReduction(u32),
    /// Cycle the visualization and wake.
    NextVisualization,
    /// Sensitivity 100, noise reduction 77, and wake.
    ResetSettings,
}

/// Cloneable sender side of the control channel.
#[derive(Clone)]
pub struct ControlHandle {
    tx: cb::Sender<ControlEvent>,
}

impl ControlHandle {
    /// Returns false if the control loop has gone away.
    pub fn send(&self, event: ControlEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn request_wake(&self) -> bool {
        self.send(ControlEvent::Wake)
    }

    pub fn request_shutdown(&self) -> bool {
        self.send(ControlEvent::Shutdown)
    }

    pub fn set_sensitivity(&self, value: u32) -> bool {
        self.send(ControlEvent::SetSensitivity(value))
    }

    pub fn set_noise_reduction(&self, value: u32) -> bool {
        self.send(ControlEvent::SetNoiseReduction(value))
    }
}

pub fn control_channel() -> (ControlHandle, cb::Receiver<ControlEvent>) {
    let (tx, rx) = cb::unbounded();
    (ControlHandle { tx }, rx)
}

fn step(current: u32, steps: i32, per_step: i64, min: u32, max: u32) -> u32 {
    (current as i64 + steps as i64 * per_step).clamp(min as i64, max as i64) as u32
}

/// Apply one event to the core.
pub fn apply_event(visualizer: &Visualizer, event: ControlEvent) {
    debug!(?event, "control_event");
    match event {
        ControlEvent::Wake => visualizer.request_wake(),
        ControlEvent::Shutdown => visualizer.request_shutdown(),
        ControlEvent::AdjustSensitivity(steps) => {
            let next = step(
                visualizer.get_sensitivity(),
                steps,
                SENSITIVITY_STEP,
                SENSITIVITY_MIN,
                SENSITIVITY_MAX,
            );
            visualizer.set_sensitivity(next);
        }
        ControlEvent::AdjustNoiseReduction(steps) => {
            let next = step(
                visualizer.get_noise_reduction(),
                steps,
                NOISE_REDUCTION_STEP,
                0,
                NOISE_REDUCTION_MAX,
            );
            visualizer.set_noise_reduction(next);
        }
        ControlEvent::SetSensitivity(v) => {
            visualizer.set_sensitivity(v);
        }
        ControlEvent::SetNoiseReduction(v) => {
            visualizer.set_noise_reduction(v);
        }
        ControlEvent::NextVisualization => {
            visualizer.next_visualization();
            visualizer.request_wake();
        }
        ControlEvent::ResetSettings => {
            visualizer.reset_settings();
            visualizer.request_wake();
        }
    }
}

#[derive(Debug, Clone)]
pub struct Cadence {
    pub awake: Duration,
    pub asleep: Duration,
}

impl Default for Cadence {
    fn default() -> Self {
        Self {
            awake: Duration::from_millis(10),
            asleep: Duration::from_millis(100),
        }
    }
}

pub struct ControlLoop<'a, R: RenderSink> {
    visualizer: &'a Visualizer,
    events: cb::Receiver<ControlEvent>,
    sink: R,
    cadence: Cadence,
    frame: u64,
}

impl<'a, R: RenderSink> ControlLoop<'a, R> {
    pub fn new(
        visualizer: &'a Visualizer,
        events: cb::Receiver<ControlEvent>,
        sink: R,
        cadence: Cadence,
    ) -> Self {
        Self {
            visualizer,
            events,
            sink,
            cadence,
            frame: 0,
        }
    }

    /// Frames rendered so far.
    pub fn frames(&self) -> u64 {
        self.frame
    }

    pub fn into_sink(self) -> R {
        self.sink
    }

    /// One iteration: pending events, power rules, and a frame if awake.
    /// Returns false once shutdown has been requested.
    pub fn step(&mut self) -> bool {
        while let Ok(event) = self.events.try_recv() {
            apply_event(self.visualizer, event);
        }
        if self.visualizer.is_shutdown_requested() {
            return false;
        }

        if let Some(transition) = self.visualizer.tick() {
            self.sink.power_changed(transition.to);
        }

        if self.visualizer.get_power_state() == PowerState::Awake {
            let span = self.visualizer.metrics().span(metric_names::FRAME);
            let snapshot = self.visualizer.frame(self.frame);
            self.sink.render(&snapshot);
            span.finish();
            self.frame += 1;
        }
        true
    }

    /// Run until shutdown. Waits between iterations on the event channel so
    /// input is handled without waiting out a full asleep period.
    pub fn run(&mut self) {
        info!(
            awake_ms = self.cadence.awake.as_millis() as u64,
            asleep_ms = self.cadence.asleep.as_millis() as u64,
            "control loop started"
        );
        let mut channel_open = true;

        while self.step() {
            let delay = match self.visualizer.get_power_state() {
                PowerState::Awake => self.cadence.awake,
                PowerState::Asleep => self.cadence.asleep,
            };
            if !channel_open {
                std::thread::sleep(delay);
                continue;
            }
            match self.events.recv_timeout(delay) {
                Ok(event) => apply_event(self.visualizer, event),
                Err(cb::RecvTimeoutError::Timeout) => {}
                Err(cb::RecvTimeoutError::Disconnected) => {
                    warn!("control channel closed; continuing without input");
                    channel_open = false;
                }
            }
        }
        info!(frames = self.frame, "control loop stopped");
    }
}
