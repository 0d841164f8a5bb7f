//! Stereo ring buffer: fixed pre-allocated circular store of normalized
//! left/right samples. Written by the capture thread, read by the analyzers.

use parking_lot::Mutex;

/// One stereo frame, each channel normalized to [-1.0, 1.0].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Sample {
    pub left: f32,
    pub right: f32,
}

impl Sample {
    pub fn new(left: f32, right: f32) -> Self {
        Self { left, right }
    }
}

/// Fixed-size stereo ring buffer. Pre-allocated, never grows.
pub struct RingBuffer {
    left: Box<[f32]>,
    right: Box<[f32]>,
    write_pos: usize,
    capacity: usize,
}

impl RingBuffer {
    /// Capacity is clamped to at least one frame.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            left: vec![0.0; capacity].into_boxed_slice(),
            right: vec![0.0; capacity].into_boxed_slice(),
            write_pos: 0,
            capacity,
        }
    }

    /// Append samples, overwriting the oldest data. Only the trailing
    /// `capacity` samples of an oversized write survive.
    #[inline]
    pub fn write(&mut self, samples: &[Sample]) {
        let skip = samples.len().saturating_sub(self.capacity);
        for s in &samples[skip..] {
            self.left[self.write_pos] = s.left;
            self.right[self.write_pos] = s.right;
            self.write_pos = (self.write_pos + 1) % self.capacity;
        }
    }

    /// Copy of the most recent `count` samples, oldest first. `count` is clamped to capacity.
    pub fn snapshot(&self, count: usize) -> Vec<Sample> {
        let n = count.min(self.capacity);
        let start = self.start_of_last(n);
        (0..n)
            .map(|i| {
                let idx = (start + i) % self.capacity;
                Sample::new(self.left[idx], self.right[idx])
            })
            .collect()
    }

    /// Fill `left`/`right` with the most recent samples, oldest first, without
    /// allocating. Both slices must have the same length; the copied length
    /// (clamped to capacity) is returned.
    pub fn snapshot_into(&self, left: &mut [f32], right: &mut [f32]) -> usize {
        let n = left.len().min(right.len()).min(self.capacity);
        let start = self.start_of_last(n);
        for i in 0..n {
            let idx = (start + i) % self.capacity;
            left[i] = self.left[idx];
            right[i] = self.right[idx];
        }
        n
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn write_pos(&self) -> usize {
        self.write_pos
    }

    #[inline]
    fn start_of_last(&self, n: usize) -> usize {
        (self.write_pos + self.capacity - n) % self.capacity
    }
}

/// The single synchronization boundary around the ring buffer. Cursor and
/// both channel arrays are updated under one lock, so readers never see a
/// torn window.
pub struct SampleStore {
    ring: Mutex<RingBuffer>,
}

impl SampleStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(RingBuffer::new(capacity)),
        }
    }

    pub fn write(&self, samples: &[Sample]) {
        self.ring.lock().write(samples);
    }

    pub fn snapshot(&self, count: usize) -> Vec<Sample> {
        self.ring.lock().snapshot(count)
    }

    pub fn snapshot_into(&self, left: &mut [f32], right: &mut [f32]) -> usize {
        self.ring.lock().snapshot_into(left, right)
    }

    pub fn capacity(&self) -> usize {
        self.ring.lock().capacity()
    }
}
