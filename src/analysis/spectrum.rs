//! Seven-band spectrum analyzer.
//!
//! One real FFT (bass window size) per channel per call: Hann window →
//! r2c transform → per-band RMS of bin magnitudes → sensitivity/correction
//! scaling → integral + gravity smoothing → 0-255.
//!
//! All FFT buffers are allocated once at construction and reused.

use std::sync::Arc;

use realfft::num_complex::Complex;
use realfft::{RealFftPlanner, RealToComplex};
use serde::Serialize;

use crate::audio::ring_buffer::SampleStore;

pub const BAND_COUNT: usize = 7;

pub const SENSITIVITY_MIN: u32 = 10;
pub const SENSITIVITY_MAX: u32 = 300;
pub const NOISE_REDUCTION_MAX: u32 = 100;
pub const DEFAULT_SENSITIVITY: u32 = 100;
pub const DEFAULT_NOISE_REDUCTION: u32 = 77;

/// A `[low, high)` frequency range in Hz with a per-band gain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrequencyBand {
    pub low_hz: u32,
    pub high_hz: u32,
    pub correction: f32,
}

/// Log-spaced bands. The correction lifts the upper bands, whose per-bin
/// energy is lower in typical program material.
pub const FREQ_BANDS: [FrequencyBand; BAND_COUNT] = [
    FrequencyBand { low_hz: 63, high_hz: 120, correction: 0.5 },
    FrequencyBand { low_hz: 120, high_hz: 350, correction: 1.0 },
    FrequencyBand { low_hz: 350, high_hz: 900, correction: 2.0 },
    FrequencyBand { low_hz: 900, high_hz: 2000, correction: 3.5 },
    FrequencyBand { low_hz: 2000, high_hz: 5000, correction: 5.0 },
    FrequencyBand { low_hz: 5000, high_hz: 10000, correction: 7.0 },
    FrequencyBand { low_hz: 10000, high_hz: 16000, correction: 10.0 },
];

/// Smoothed per-channel band levels, 0-255.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BandLevels {
    pub left: [u8; BAND_COUNT],
    pub right: [u8; BAND_COUNT],
}

impl BandLevels {
    /// Average level per channel, used by VU-style renderers.
    pub fn vu(&self) -> (u8, u8) {
        let avg = |bands: &[u8; BAND_COUNT]| {
            (bands.iter().map(|&b| b as u32).sum::<u32>() / BAND_COUNT as u32) as u8
        };
        (avg(&self.left), avg(&self.right))
    }
}

/// Factors derived from the two user-facing knobs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SmoothingParams {
    pub sensitivity: u32,
    pub noise_reduction: u32,
    pub integral_factor: f32,
    pub gravity_factor: f32,
    pub scale_factor: f32,
}

impl SmoothingParams {
    pub fn new(sensitivity: u32, noise_reduction: u32) -> Self {
        let sensitivity = sensitivity.clamp(SENSITIVITY_MIN, SENSITIVITY_MAX);
        let noise_reduction = noise_reduction.min(NOISE_REDUCTION_MAX);
        let nr = noise_reduction as f32 / 100.0;
        Self {
            sensitivity,
            noise_reduction,
            integral_factor: nr * 0.95,
            gravity_factor: (1.0 - nr * 0.8).max(0.2),
            scale_factor: sensitivity as f32 / 100.0 * 2.2,
        }
    }
}

impl Default for SmoothingParams {
    fn default() -> Self {
        Self::new(DEFAULT_SENSITIVITY, DEFAULT_NOISE_REDUCTION)
    }
}

/// FFT plan plus its working buffers and the precomputed band → bin map.
struct Transform {
    fft: Arc<dyn RealToComplex<f32>>,
    window: Vec<f32>,
    input: Vec<f32>,
    spectrum: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
    bins: [(usize, usize); BAND_COUNT],
}

impl Transform {
    fn new(fft_size: usize, sample_rate: u32) -> Self {
        let mut planner = RealFftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(fft_size);
        let input = fft.make_input_vec();
        let spectrum = fft.make_output_vec();
        let scratch = fft.make_scratch_vec();

        Self {
            window: hann_window(fft_size),
            bins: band_bins(fft_size, sample_rate),
            fft,
            input,
            spectrum,
            scratch,
        }
    }

    /// Unsmoothed level per band for one channel. `samples` shorter than the
    /// FFT size are zero-padded at the end.
    fn raw_levels(&mut self, samples: &[f32], scale_factor: f32) -> [f32; BAND_COUNT] {
        let n = samples.len().min(self.input.len());
        for (i, slot) in self.input.iter_mut().enumerate() {
            *slot = if i < n { samples[i] * self.window[i] } else { 0.0 };
        }

        let mut levels = [0.0f32; BAND_COUNT];
        if self
            .fft
            .process_with_scratch(&mut self.input, &mut self.spectrum, &mut self.scratch)
            .is_err()
        {
            return levels;
        }

        for (band, &(low, high)) in levels.iter_mut().zip(self.bins.iter()) {
            if high <= low {
                continue;
            }
            let energy: f32 = self.spectrum[low..high].iter().map(|c| c.norm_sqr()).sum();
            *band = (energy / (high - low) as f32).sqrt() * scale_factor;
        }
        for (level, band) in levels.iter_mut().zip(FREQ_BANDS.iter()) {
            *level *= band.correction;
        }
        levels
    }
}

/// Map each band to a `[low, high)` bin range via `bin = freq * N / sample_rate`,
/// clamped below Nyquist.
fn band_bins(fft_size: usize, sample_rate: u32) -> [(usize, usize); BAND_COUNT] {
    let nyquist_bin = fft_size / 2;
    let to_bin = |hz: u32| -> usize {
        if sample_rate == 0 {
            return 0;
        }
        ((hz as u64 * fft_size as u64) / sample_rate as u64) as usize
    };
    let mut bins = [(0usize, 0usize); BAND_COUNT];
    for (slot, band) in bins.iter_mut().zip(FREQ_BANDS.iter()) {
        let low = to_bin(band.low_hz).min(nyquist_bin);
        let high = to_bin(band.high_hz).min(nyquist_bin);
        *slot = (low, high.max(low));
    }
    bins
}

pub fn hann_window(size: usize) -> Vec<f32> {
    if size < 2 {
        return vec![1.0; size];
    }
    (0..size)
        .map(|i| 0.5 * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / (size - 1) as f32).cos()))
        .collect()
}

/// Applies the integral blend and, on a fall, gravity decay toward the
/// blended value. Not time-normalized: the decay rate is per call.
#[inline]
fn smooth(prev: &mut f32, raw: f32, params: &SmoothingParams) {
    let blended = params.integral_factor * *prev + (1.0 - params.integral_factor) * raw;
    if blended < *prev {
        let fall = (*prev - blended) * params.gravity_factor;
        *prev = (*prev - fall).max(blended);
    } else {
        *prev = blended;
    }
}

#[inline]
fn to_level(value: f32) -> u8 {
    value.clamp(0.0, 255.0) as u8
}

pub struct SpectralAnalyzer {
    transform: Transform,
    fft_size: usize,
    sample_rate: u32,
    left: Vec<f32>,
    right: Vec<f32>,
    params: SmoothingParams,
    prev_left: [f32; BAND_COUNT],
    prev_right: [f32; BAND_COUNT],
}

impl SpectralAnalyzer {
    pub fn new(fft_size: usize, sample_rate: u32) -> Self {
        Self::with_params(fft_size, sample_rate, SmoothingParams::default())
    }

    pub fn with_params(fft_size: usize, sample_rate: u32, params: SmoothingParams) -> Self {
        let fft_size = fft_size.max(2);
        Self {
            transform: Transform::new(fft_size, sample_rate),
            fft_size,
            sample_rate,
            left: vec![0.0; fft_size],
            right: vec![0.0; fft_size],
            params,
            prev_left: [0.0; BAND_COUNT],
            prev_right: [0.0; BAND_COUNT],
        }
    }

    /// Snapshot the latest FFT-size window from the store and analyze it.
    pub fn analyze(&mut self, store: &SampleStore) -> BandLevels {
        let n = store.snapshot_into(&mut self.left, &mut self.right);
        if n < self.fft_size {
            self.left[n..].fill(0.0);
            self.right[n..].fill(0.0);
        }
        let scale = self.params.scale_factor;
        let raw_left = self.transform.raw_levels(&self.left, scale);
        let raw_right = self.transform.raw_levels(&self.right, scale);
        self.apply_smoothing(&raw_left, &raw_right)
    }

    /// Analyze caller-provided channel windows (oldest sample first).
    pub fn process(&mut self, left: &[f32], right: &[f32]) -> BandLevels {
        let scale = self.params.scale_factor;
        let raw_left = self.transform.raw_levels(left, scale);
        let raw_right = self.transform.raw_levels(right, scale);
        self.apply_smoothing(&raw_left, &raw_right)
    }

    /// Unsmoothed, unclamped band levels for one channel. Does not touch
    /// the smoothing state.
    pub fn raw_levels(&mut self, samples: &[f32]) -> [f32; BAND_COUNT] {
        self.transform.raw_levels(samples, self.params.scale_factor)
    }

    fn apply_smoothing(
        &mut self,
        raw_left: &[f32; BAND_COUNT],
        raw_right: &[f32; BAND_COUNT],
    ) -> BandLevels {
        let mut out = BandLevels::default();
        for i in 0..BAND_COUNT {
            smooth(&mut self.prev_left[i], raw_left[i], &self.params);
            smooth(&mut self.prev_right[i], raw_right[i], &self.params);
            out.left[i] = to_level(self.prev_left[i]);
            out.right[i] = to_level(self.prev_right[i]);
        }
        out
    }

    /// Clamped to 10-300; effective on the next call. Returns the applied value.
    pub fn set_sensitivity(&mut self, value: u32) -> u32 {
        self.params = SmoothingParams::new(value, self.params.noise_reduction);
        self.params.sensitivity
    }

    /// Clamped to 0-100; effective on the next call. Returns the applied value.
    pub fn set_noise_reduction(&mut self, value: u32) -> u32 {
        self.params = SmoothingParams::new(self.params.sensitivity, value);
        self.params.noise_reduction
    }

    pub fn params(&self) -> SmoothingParams {
        self.params
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::ring_buffer::Sample;
    use proptest::prelude::*;

    const N: usize = 8192;
    const SR: u32 = 44100;

    fn tone(freq: f32, amplitude: f32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| amplitude * (2.0 * std::f32::consts::PI * freq * i as f32 / SR as f32).sin())
            .collect()
    }

    fn argmax(levels: &[f32]) -> usize {
        levels
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .map(|(i, _)| i)
            .unwrap()
    }

    #[test]
    fn params_follow_knob_formulas() {
        let p = SmoothingParams::new(100, 77);
        assert!((p.integral_factor - 0.7315).abs() < 1e-6);
        assert!((p.gravity_factor - 0.384).abs() < 1e-6);
        assert!((p.scale_factor - 2.2).abs() < 1e-6);

        let p = SmoothingParams::new(5, 250);
        assert_eq!(p.sensitivity, 10);
        assert_eq!(p.noise_reduction, 100);
        assert!((p.gravity_factor - 0.2).abs() < 1e-6);
    }

    #[test]
    fn band_bins_are_ordered_and_below_nyquist() {
        let bins = band_bins(N, SR);
        assert_eq!(bins[0], (63 * N / 44100, 120 * N / 44100));
        for &(lo, hi) in &bins {
            assert!(lo <= hi);
            assert!(hi <= N / 2);
        }
    }

    #[test]
    fn zero_width_band_reads_zero() {
        // 64-point FFT: the lowest bands collapse to zero bins.
        let mut analyzer = SpectralAnalyzer::new(64, SR);
        let raw = analyzer.raw_levels(&tone(100.0, 0.8, 64));
        assert_eq!(raw[0], 0.0);
        assert!(raw.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn one_khz_tone_peaks_in_900_2000_band() {
        let mut analyzer = SpectralAnalyzer::new(N, SR);
        let signal = tone(1000.0, 0.5, N);
        let raw = analyzer.raw_levels(&signal);
        assert_eq!(argmax(&raw), 3);

        let levels = analyzer.process(&signal, &signal);
        let top = levels.left.iter().enumerate().max_by_key(|&(_, v)| *v).unwrap().0;
        assert_eq!(top, 3);
        assert_eq!(levels.left, levels.right);
    }

    #[test]
    fn analyze_reads_latest_window_from_store() {
        let store = SampleStore::new(N * 2);
        let left = tone(1000.0, 0.5, N);
        let samples: Vec<Sample> = left.iter().map(|&l| Sample::new(l, 0.0)).collect();
        store.write(&samples);

        let mut analyzer = SpectralAnalyzer::new(N, SR);
        let levels = analyzer.analyze(&store);
        assert!(levels.left[3] > 0);
        assert_eq!(levels.right, [0; BAND_COUNT]);
    }

    #[test]
    fn rise_is_integral_blend_and_fall_uses_gravity() {
        let params = SmoothingParams::new(100, 50);
        let mut prev = 0.0;
        smooth(&mut prev, 100.0, &params);
        assert!((prev - 100.0 * (1.0 - params.integral_factor)).abs() < 1e-4);

        let before = prev;
        smooth(&mut prev, 0.0, &params);
        let blended = params.integral_factor * before;
        let expected = before - (before - blended) * params.gravity_factor;
        assert!((prev - expected).abs() < 1e-4);
        assert!(prev >= blended);
    }

    #[test]
    fn silence_converges_to_zero_within_gravity_bound() {
        let mut analyzer = SpectralAnalyzer::new(N, SR);
        let loud = tone(1000.0, 1.0, N);
        for _ in 0..20 {
            analyzer.process(&loud, &loud);
        }
        let peak = analyzer
            .prev_left
            .iter()
            .chain(analyzer.prev_right.iter())
            .cloned()
            .fold(0.0f32, f32::max);
        assert!(peak >= 1.0);

        // Each silent call keeps a fraction (1 - (1 - integral) * gravity) of the level.
        let p = analyzer.params();
        let keep = 1.0 - (1.0 - p.integral_factor) * p.gravity_factor;
        let bound = (peak.ln() / -keep.ln()).ceil() as usize + 2;

        let silence = vec![0.0f32; N];
        let mut calls = 0;
        let mut last = analyzer.process(&silence, &silence);
        calls += 1;
        while last != BandLevels::default() {
            assert!(calls <= bound, "still {:?} after {} calls", last, calls);
            last = analyzer.process(&silence, &silence);
            calls += 1;
        }
        assert!(analyzer.prev_left.iter().all(|&v| v >= 0.0));
    }

    #[test]
    fn sensitivity_change_applies_on_next_call() {
        let mut analyzer = SpectralAnalyzer::new(N, SR);
        let signal = tone(1000.0, 0.2, N);
        let a = analyzer.raw_levels(&signal)[3];
        assert_eq!(analyzer.set_sensitivity(200), 200);
        let b = analyzer.raw_levels(&signal)[3];
        assert!((b / a - 2.0).abs() < 1e-3);
        assert_eq!(analyzer.set_sensitivity(1000), SENSITIVITY_MAX);
    }

    #[test]
    fn vu_is_band_average() {
        let levels = BandLevels {
            left: [7, 7, 7, 7, 7, 7, 7],
            right: [0, 0, 0, 0, 0, 0, 14],
        };
        assert_eq!(levels.vu(), (7, 2));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]
        #[test]
        fn smoothing_state_stays_finite_and_non_negative(
            samples in prop::collection::vec(-1.0f32..=1.0, 0..1024),
            sensitivity in 10u32..=300,
            noise in 0u32..=100,
        ) {
            let params = SmoothingParams::new(sensitivity, noise);
            let mut analyzer = SpectralAnalyzer::with_params(1024, SR, params);
            for _ in 0..3 {
                analyzer.process(&samples, &samples);
            }
            prop_assert!(analyzer.prev_left.iter().all(|v| v.is_finite() && *v >= 0.0));
            prop_assert_eq!(analyzer.prev_left, analyzer.prev_right);
        }
    }
}
