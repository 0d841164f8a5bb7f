//! Silence detection: block peak amplitude against a fixed threshold.
//! Any block above the threshold refreshes the "last active" timestamp;
//! audio is considered present while that timestamp is younger than the timeout.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Peak absolute amplitude of interleaved i16 PCM, normalized to [0.0, 1.0].
#[inline]
pub fn peak_amplitude(samples: &[i16]) -> f32 {
    samples
        .iter()
        .map(|&s| (s as f32 / 32768.0).abs())
        .fold(0.0f32, f32::max)
}

/// Shared between the capture thread (writer) and the control loop (reader).
pub struct ActivityMonitor {
    threshold: f32,
    timeout: Duration,
    last_active: Mutex<Instant>,
    /// Peak of the latest block, stored as f32 bits.
    last_peak: AtomicU32,
}

impl ActivityMonitor {
    pub fn new(threshold: f32, timeout: Duration) -> Self {
        Self::starting_at(threshold, timeout, Instant::now())
    }

    pub fn starting_at(threshold: f32, timeout: Duration, now: Instant) -> Self {
        Self {
            threshold,
            timeout,
            last_active: Mutex::new(now),
            last_peak: AtomicU32::new(0f32.to_bits()),
        }
    }

    /// Record the peak of one block. Returns true if the block counted as audio.
    pub fn observe(&self, peak: f32, now: Instant) -> bool {
        self.last_peak.store(peak.to_bits(), Ordering::Relaxed);
        if peak > self.threshold {
            let mut last = self.last_active.lock();
            if now > *last {
                *last = now;
            }
            true
        } else {
            false
        }
    }

    /// Refresh the activity timestamp without a block (explicit wake).
    pub fn touch(&self, now: Instant) {
        let mut last = self.last_active.lock();
        if now > *last {
            *last = now;
        }
    }

    pub fn has_audio_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(*self.last_active.lock()) < self.timeout
    }

    pub fn has_audio(&self) -> bool {
        self.has_audio_at(Instant::now())
    }

    pub fn last_peak(&self) -> f32 {
        f32::from_bits(self.last_peak.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peak_is_normalized() {
        assert_eq!(peak_amplitude(&[]), 0.0);
        assert_eq!(peak_amplitude(&[0, 16384, -32768]), 1.0);
        assert_eq!(peak_amplitude(&[0, -16384, 100]), 0.5);
    }

    #[test]
    fn silence_expires_after_timeout() {
        let t0 = Instant::now();
        let mon = ActivityMonitor::starting_at(0.001, Duration::from_secs(10), t0);
        assert!(mon.has_audio_at(t0 + Duration::from_secs(9)));
        assert!(!mon.observe(0.0005, t0 + Duration::from_secs(5)));
        assert!(!mon.has_audio_at(t0 + Duration::from_secs(10)));
    }

    #[test]
    fn loud_block_refreshes_timestamp() {
        let t0 = Instant::now();
        let mon = ActivityMonitor::starting_at(0.001, Duration::from_secs(10), t0);
        let t_loud = t0 + Duration::from_secs(20);
        assert!(!mon.has_audio_at(t_loud));
        assert!(mon.observe(0.3, t_loud));
        assert!(mon.has_audio_at(t_loud));
        assert!(mon.has_audio_at(t_loud + Duration::from_secs(9)));
        assert_eq!(mon.last_peak(), 0.3);
    }

    #[test]
    fn threshold_is_exclusive() {
        let t0 = Instant::now();
        let mon = ActivityMonitor::starting_at(0.001, Duration::from_secs(1), t0);
        assert!(!mon.observe(0.001, t0 + Duration::from_secs(5)));
        assert!(!mon.has_audio_at(t0 + Duration::from_secs(5)));
    }
}
