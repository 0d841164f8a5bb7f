//! Signal analysis over the shared sample store.

pub mod spectrum;
pub mod stereo;

pub use spectrum::{BandLevels, SmoothingParams, SpectralAnalyzer, BAND_COUNT, FREQ_BANDS};
pub use stereo::{StereoAnalyzer, StereoMetric};

use crate::audio::ring_buffer::{Sample, SampleStore};

/// The most recent `count` raw samples, oldest first.
pub fn waveform(store: &SampleStore, count: usize) -> Vec<Sample> {
    store.snapshot(count)
}
