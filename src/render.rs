//! Render contract: what the control loop hands to the display layer.
//! The core produces one `FrameSnapshot` per awake frame and never branches
//! on which visualization is active.

use serde::Serialize;
use tracing::{debug, info};

use crate::analysis::{BandLevels, StereoMetric};
use crate::audio::ring_buffer::Sample;
use crate::power::PowerState;

/// Samples carried in each snapshot for oscilloscope-style views.
pub const WAVEFORM_WINDOW: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
pub enum Visualization {
    #[default]
    VuMeter,
    Spectrum,
    EmptySpectrum,
    OutlineSpectrum,
    Waveform,
    StereoField,
}

impl Visualization {
    pub const ALL: [Visualization; 6] = [
        Visualization::VuMeter,
        Visualization::Spectrum,
        Visualization::EmptySpectrum,
        Visualization::OutlineSpectrum,
        Visualization::Waveform,
        Visualization::StereoField,
    ];

    /// The next variant, wrapping around.
    pub fn next(self) -> Self {
        let i = Self::ALL.iter().position(|v| *v == self).unwrap_or(0);
        Self::ALL[(i + 1) % Self::ALL.len()]
    }

    pub fn name(self) -> &'static str {
        match self {
            Visualization::VuMeter => "vu_meter",
            Visualization::Spectrum => "spectrum",
            Visualization::EmptySpectrum => "empty_spectrum",
            Visualization::OutlineSpectrum => "outline_spectrum",
            Visualization::Waveform => "waveform",
            Visualization::StereoField => "stereo_field",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FrameSnapshot {
    pub frame: u64,
    pub visualization: Visualization,
    pub bands: BandLevels,
    pub vu: (u8, u8),
    pub stereo: StereoMetric,
    #[serde(skip)]
    pub waveform: Vec<Sample>,
    pub track_text: String,
    pub sensitivity: u32,
    pub noise_reduction: u32,
}

/// Display-side consumer. Called only from the control thread.
pub trait RenderSink: Send {
    fn render(&mut self, frame: &FrameSnapshot);

    /// Display and LEDs off on Asleep, back on at Awake.
    fn power_changed(&mut self, _state: PowerState) {}
}

/// Logs a compact summary every `every` frames. Stands in for a display.
pub struct LogSink {
    every: u64,
}

impl LogSink {
    pub fn new(every: u64) -> Self {
        Self {
            every: every.max(1),
        }
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new(100)
    }
}

impl RenderSink for LogSink {
    fn render(&mut self, frame: &FrameSnapshot) {
        if frame.frame % self.every != 0 {
            return;
        }
        debug!(
            frame = frame.frame,
            visualization = frame.visualization.name(),
            left = ?frame.bands.left,
            right = ?frame.bands.right,
            vu_left = frame.vu.0,
            vu_right = frame.vu.1,
            phase = frame.stereo.phase,
            correlation = frame.stereo.correlation,
            track = %frame.track_text,
            "frame"
        );
    }

    fn power_changed(&mut self, state: PowerState) {
        info!(state = %state, "display_power");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn visualizations_cycle_through_all_six() {
        let mut v = Visualization::default();
        let mut seen = vec![v];
        for _ in 0..5 {
            v = v.next();
            seen.push(v);
        }
        assert_eq!(seen, Visualization::ALL.to_vec());
        assert_eq!(v.next(), Visualization::VuMeter);
    }
}
