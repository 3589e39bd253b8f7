use std::sync::Mutex;

use nalgebra::Vector3;

use super::sample::{BiasState, InertialSample};
use crate::error::{Result, VioError};
use crate::types::TimestampNs;

const GRAVITY_EWMA_ALPHA: f64 = 0.05;
const STATIC_WINDOW_MAX: usize = 200;
const STATIC_GYRO_THRESHOLD: f64 = 0.04;
const STATIC_ACCEL_THRESHOLD: f64 = 0.5;

/// Fixed-capacity circular buffer of [`InertialSample`]s with interpolating
/// lookup and a low-pass gravity estimate.
///
/// `push` is the only mutator and is meant to be called exclusively by the
/// IMU producer; everything else only reads. The gravity estimate lives
/// behind its own mutex (`gravity`) so a consumer can snapshot it without
/// contending on buffer mutation.
pub struct InertialRingBuffer {
    capacity: usize,
    buf: Vec<Option<InertialSample>>,
    /// Logical index (mod capacity) of the next write slot.
    head: usize,
    /// Number of valid samples currently retained.
    len: usize,
    bias: BiasState,
    gravity: Mutex<Vector3<f64>>,
}

impl InertialRingBuffer {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 2, "ring buffer capacity must be at least 2");
        Self {
            capacity,
            buf: vec![None; capacity],
            head: 0,
            len: 0,
            bias: BiasState::zero(),
            gravity: Mutex::new(Vector3::zeros()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Oldest retained index, logical index 0.
    fn tail_phys(&self) -> usize {
        (self.head + self.capacity - self.len) % self.capacity
    }

    fn phys(&self, logical: usize) -> usize {
        (self.tail_phys() + logical) % self.capacity
    }

    /// Logical-index accessor; panics if out of range (callers always bound
    /// by `len()` first).
    fn at(&self, logical: usize) -> &InertialSample {
        self.buf[self.phys(logical)]
            .as_ref()
            .expect("logical index within len must be populated")
    }

    pub fn oldest(&self) -> Option<&InertialSample> {
        if self.len == 0 {
            None
        } else {
            Some(self.at(0))
        }
    }

    pub fn newest(&self) -> Option<&InertialSample> {
        if self.len == 0 {
            None
        } else {
            Some(self.at(self.len - 1))
        }
    }

    /// Push a new sample, advancing `head` (and `tail` once the buffer is
    /// full). Updates the low-pass gravity estimate. Timestamps must be
    /// strictly increasing; violating this is a caller bug and panics in
    /// debug builds.
    pub fn push(&mut self, sample: InertialSample) {
        if let Some(last) = self.newest() {
            debug_assert!(
                sample.t_ns > last.t_ns,
                "IMU samples must be strictly increasing in time"
            );
        }

        {
            let mut g = self.gravity.lock().expect("gravity mutex poisoned");
            if self.len == 0 {
                *g = sample.acc;
            } else {
                *g = *g * (1.0 - GRAVITY_EWMA_ALPHA) + sample.acc * GRAVITY_EWMA_ALPHA;
            }
        }

        let write_phys = self.head % self.capacity;
        self.buf[write_phys] = Some(sample);
        self.head = (self.head + 1) % self.capacity;
        if self.len < self.capacity {
            self.len += 1;
        }
    }

    pub fn gravity(&self) -> Vector3<f64> {
        *self.gravity.lock().expect("gravity mutex poisoned")
    }

    pub fn bias(&self) -> BiasState {
        self.bias
    }

    pub fn update_bias(&mut self, d_bg: Vector3<f64>, d_ba: Vector3<f64>) {
        self.bias.update(d_bg, d_ba);
    }

    pub fn set_zero_bias(&mut self) {
        self.bias = BiasState::zero();
    }

    /// Binary search for the logical index of the last sample with
    /// `t_ns <= t`. Returns `VioError::ImuStale` if `t` precedes the
    /// oldest retained sample, `VioError::ImuGap` (with `retries: 0`) if
    /// `t` is beyond the newest sample — callers decide whether/how to
    /// retry.
    pub fn index_leq(&self, t: TimestampNs) -> Result<usize> {
        if self.len == 0 {
            return Err(VioError::EmptyBuffer);
        }
        if t < self.at(0).t_ns {
            return Err(VioError::ImuStale {
                t0: t,
                oldest: self.at(0).t_ns,
            });
        }
        if t > self.at(self.len - 1).t_ns {
            return Err(VioError::ImuGap {
                t1: t,
                newest: self.at(self.len - 1).t_ns,
                retries: 0,
            });
        }

        let (mut lo, mut hi) = (0usize, self.len - 1);
        while lo < hi {
            let mid = (lo + hi + 1) / 2;
            if self.at(mid).t_ns <= t {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }
        Ok(lo)
    }

    /// Linearly-interpolated sample at timestamp `t`, bracketed by the two
    /// samples straddling it.
    pub fn get_by_timestamp(&self, t: TimestampNs) -> Result<InertialSample> {
        let idx = self.index_leq(t)?;
        let left = *self.at(idx);
        if left.t_ns == t || idx + 1 == self.len {
            return Ok(left);
        }
        let right = *self.at(idx + 1);
        let k = (t - left.t_ns) as f64 / (right.t_ns - left.t_ns) as f64;
        Ok(left.lerp(&right, k))
    }

    /// Returns `(logical_index, sample)` pairs for logical indices in
    /// `[from, to]` inclusive.
    pub fn range(&self, from: usize, to: usize) -> Vec<(usize, InertialSample)> {
        (from..=to).map(|i| (i, *self.at(i))).collect()
    }

    /// Static-frame detection: examine the last <=200 samples; true if
    /// both gyro and accel sample-wise mean-deviation lie below threshold.
    pub fn detect_static(&self) -> bool {
        if self.len < 10 {
            return false;
        }
        let window = self.len.min(STATIC_WINDOW_MAX);
        let start = self.len - window;

        let mut sum_acc = Vector3::zeros();
        let mut sum_gyro = Vector3::zeros();
        for i in start..self.len {
            let s = self.at(i);
            sum_acc += s.acc;
            sum_gyro += s.gyro;
        }
        let mean_acc = sum_acc / window as f64;
        let mean_gyro = sum_gyro / window as f64;

        let mut a_div = 0.0;
        let mut g_div = 0.0;
        for i in start..self.len {
            let s = self.at(i);
            a_div += (s.acc - mean_acc).norm();
            g_div += (s.gyro - mean_gyro).norm();
        }
        a_div /= window as f64;
        g_div /= window as f64;

        g_div < STATIC_GYRO_THRESHOLD && a_div < STATIC_ACCEL_THRESHOLD
    }

    /// Overwrites `bg` with the sample-mean gyro over the trailing
    /// window and zero `ba`, when the frame has been flagged static
    /// upstream. Leaves the rest of the buffer untouched.
    pub fn update_bias_by_static(&mut self) {
        if self.len == 0 {
            return;
        }
        let window = self.len.min(STATIC_WINDOW_MAX);
        let start = self.len - window;
        let mut sum_gyro = Vector3::zeros();
        for i in start..self.len {
            sum_gyro += self.at(i).gyro;
        }
        let mean_gyro = sum_gyro / window as f64;
        self.bias.set(mean_gyro, Vector3::zeros());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(t_ns: i64, g: f64, a: f64) -> InertialSample {
        InertialSample::new(
            t_ns,
            Vector3::new(g, g, g),
            Vector3::new(a, a, a + 9.81),
            0,
        )
    }

    #[test]
    fn monotone_and_wraps() {
        let mut buf = InertialRingBuffer::new(4);
        for i in 0..6 {
            buf.push(sample(i * 10, 0.0, 0.0));
        }
        assert_eq!(buf.len(), 4);
        assert_eq!(buf.oldest().unwrap().t_ns, 20);
        assert_eq!(buf.newest().unwrap().t_ns, 50);
        for i in 0..buf.len() - 1 {
            assert!(buf.at(i).t_ns < buf.at(i + 1).t_ns);
        }
    }

    #[test]
    fn index_leq_rejects_stale_and_future() {
        let mut buf = InertialRingBuffer::new(8);
        for i in 0..5 {
            buf.push(sample(i * 10, 0.0, 0.0));
        }
        assert!(matches!(buf.index_leq(-5), Err(VioError::ImuStale { .. })));
        assert!(matches!(buf.index_leq(1000), Err(VioError::ImuGap { .. })));
        assert_eq!(buf.index_leq(25).unwrap(), 2);
    }

    #[test]
    fn interpolates_linearly() {
        let mut buf = InertialRingBuffer::new(8);
        buf.push(InertialSample::new(
            0,
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(0.0, 0.0, 0.0),
            0,
        ));
        buf.push(InertialSample::new(
            10,
            Vector3::new(10.0, 0.0, 0.0),
            Vector3::new(0.0, 0.0, 0.0),
            0,
        ));
        let mid = buf.get_by_timestamp(5).unwrap();
        assert!((mid.gyro.x - 5.0).abs() < 1e-9);
    }

    #[test]
    fn detects_static_frame() {
        let mut buf = InertialRingBuffer::new(300);
        for i in 0..200 {
            buf.push(sample(i * 5_000_000, 0.001, 0.01));
        }
        assert!(buf.detect_static());
        buf.update_bias_by_static();
        assert!((buf.bias().bg.x - 0.001).abs() < 1e-6);
        assert_eq!(buf.bias().ba, Vector3::zeros());
    }

    #[test]
    fn moving_frame_is_not_static() {
        let mut buf = InertialRingBuffer::new(300);
        for i in 0..200 {
            let wobble = if i % 2 == 0 { 1.0 } else { -1.0 };
            buf.push(sample(i * 5_000_000, wobble, wobble));
        }
        assert!(!buf.detect_static());
    }

    #[test]
    fn gravity_tracks_accelerometer_ewma() {
        let mut buf = InertialRingBuffer::new(8);
        for i in 0..50 {
            buf.push(InertialSample::new(
                i * 1_000_000,
                Vector3::zeros(),
                Vector3::new(0.0, 0.0, 9.81),
                0,
            ));
        }
        assert!((buf.gravity().z - 9.81).abs() < 1e-6);
    }
}
