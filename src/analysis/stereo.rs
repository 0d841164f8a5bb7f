//! Stereo image: average phase angle and Pearson correlation between
//! channels over the latest window.

use serde::Serialize;

use crate::audio::ring_buffer::SampleStore;

pub const STEREO_WINDOW: usize = 512;

/// Only samples with both channels above this magnitude contribute to phase.
pub const PHASE_FLOOR: f32 = 0.01;

/// Variance product below which the channels count as constant.
const MIN_DENOMINATOR: f64 = 1e-12;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct StereoMetric {
    /// Mean of `atan2(right, left)` over samples with both channels above the
    /// floor, radians.
    pub phase: f32,
    /// In [-1, 1]; 0 when either channel is constant.
    pub correlation: f32,
}

pub struct StereoAnalyzer {
    left: Vec<f32>,
    right: Vec<f32>,
}

impl Default for StereoAnalyzer {
    fn default() -> Self {
        Self::new(STEREO_WINDOW)
    }
}

impl StereoAnalyzer {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            left: vec![0.0; window],
            right: vec![0.0; window],
        }
    }

    pub fn window(&self) -> usize {
        self.left.len()
    }

    pub fn analyze(&mut self, store: &SampleStore) -> StereoMetric {
        let n = store.snapshot_into(&mut self.left, &mut self.right);
        measure(&self.left[..n], &self.right[..n])
    }
}

/// Phase and correlation of two equally long channel windows.
pub fn measure(left: &[f32], right: &[f32]) -> StereoMetric {
    let n = left.len().min(right.len());
    if n == 0 {
        return StereoMetric::default();
    }
    let (left, right) = (&left[..n], &right[..n]);

    let mut phase_sum = 0.0f64;
    let mut phase_count = 0usize;
    for (&l, &r) in left.iter().zip(right) {
        if l.abs() > PHASE_FLOOR && r.abs() > PHASE_FLOOR {
            phase_sum += (r as f64).atan2(l as f64);
            phase_count += 1;
        }
    }
    let phase = if phase_count > 0 {
        (phase_sum / phase_count as f64) as f32
    } else {
        0.0
    };

    StereoMetric {
        phase,
        correlation: correlation(left, right),
    }
}

fn correlation(left: &[f32], right: &[f32]) -> f32 {
    let n = left.len() as f64;
    let mean_l = left.iter().map(|&v| v as f64).sum::<f64>() / n;
    let mean_r = right.iter().map(|&v| v as f64).sum::<f64>() / n;

    let (mut cov, mut var_l, mut var_r) = (0.0f64, 0.0f64, 0.0f64);
    for (&l, &r) in left.iter().zip(right) {
        let dl = l as f64 - mean_l;
        let dr = r as f64 - mean_r;
        cov += dl * dr;
        var_l += dl * dl;
        var_r += dr * dr;
    }

    let denom = (var_l * var_r).sqrt();
    if !denom.is_finite() || denom <= MIN_DENOMINATOR {
        return 0.0;
    }
    (cov / denom).clamp(-1.0, 1.0) as f32
}
