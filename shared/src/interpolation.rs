//! Render-time reconstruction of remotely controlled actors.
//!
//! Samples arrive at irregular intervals over the unreliable channel. Each
//! proxy keeps the last few of them and is drawn slightly in the past so
//! there is (almost) always a pair of samples to interpolate between.

use crate::math::Vector2f;

pub const INTERPOLATION_CAPACITY: usize = 8;
pub const DEFAULT_RENDER_DELAY_MS: i64 = 100;

/// Fixed-capacity ring that always holds `N` values.
///
/// It starts out filled with a seed value, so `latest` never fails.
/// `N` must be non-zero.
#[derive(Debug, Clone)]
pub struct RingBuffer<T, const N: usize> {
    slots: [T; N],
    cursor: usize,
}

impl<T: Copy, const N: usize> RingBuffer<T, N> {
    pub fn filled(value: T) -> Self {
        Self {
            slots: [value; N],
            cursor: 0,
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// Writes at the cursor and advances it, overwriting the oldest value.
    pub fn push(&mut self, value: T) {
        self.slots[self.cursor] = value;
        self.cursor = (self.cursor + 1) % N;
    }

    pub fn fill(&mut self, value: T) {
        self.slots = [value; N];
        self.cursor = 0;
    }

    pub fn latest(&self) -> &T {
        &self.slots[(self.cursor + N - 1) % N]
    }

    /// Oldest to newest.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + '_ {
        (0..N).map(move |i| &self.slots[(self.cursor + i) % N])
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StateSample {
    pub time_ms: i64,
    pub pos: Vector2f,
}

#[derive(Debug, Clone)]
pub struct InterpolationBuffer {
    samples: RingBuffer<StateSample, INTERPOLATION_CAPACITY>,
    render_delay_ms: i64,
}

impl InterpolationBuffer {
    pub fn new(now_ms: i64, pos: Vector2f) -> Self {
        Self {
            samples: RingBuffer::filled(StateSample { time_ms: now_ms, pos }),
            render_delay_ms: DEFAULT_RENDER_DELAY_MS,
        }
    }

    pub fn with_render_delay(mut self, render_delay_ms: i64) -> Self {
        self.render_delay_ms = render_delay_ms;
        self
    }

    pub fn render_delay_ms(&self) -> i64 {
        self.render_delay_ms
    }

    pub fn latest(&self) -> StateSample {
        *self.samples.latest()
    }

    pub fn samples(&self) -> impl Iterator<Item = &StateSample> + '_ {
        self.samples.iter()
    }

    /// Appends a sample. A clock that runs backwards is clamped so sample
    /// times stay non-decreasing.
    pub fn record(&mut self, now_ms: i64, pos: Vector2f) {
        let time_ms = now_ms.max(self.samples.latest().time_ms);
        self.samples.push(StateSample { time_ms, pos });
    }

    /// Replaces the whole history with a single sample, so the next
    /// reconstruction does not slide across a teleport.
    pub fn reset(&mut self, now_ms: i64, pos: Vector2f) {
        self.samples.fill(StateSample { time_ms: now_ms, pos });
    }

    /// Position at `now_ms - render_delay`.
    pub fn sample(&self, now_ms: i64) -> Vector2f {
        let render_time = now_ms - self.render_delay_ms;
        let latest = *self.samples.latest();
        if render_time >= latest.time_ms {
            return latest.pos;
        }

        let mut next = latest;
        for prev in self.samples.iter().rev().skip(1) {
            if prev.time_ms <= render_time {
                if next.time_ms == prev.time_ms {
                    return next.pos;
                }
                let alpha =
                    (render_time - prev.time_ms) as f32 / (next.time_ms - prev.time_ms) as f32;
                return prev.pos.lerp(next.pos, alpha);
            }
            next = *prev;
        }

        // Nothing old enough yet.
        latest.pos
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_ring_buffer_wraps_in_time_order() {
        let mut ring: RingBuffer<u32, 4> = RingBuffer::filled(0);
        for value in 1..=7 {
            ring.push(value);
        }
        let values: Vec<u32> = ring.iter().copied().collect();
        assert_eq!(values, vec![4, 5, 6, 7]);
        assert_eq!(*ring.latest(), 7);
        assert_eq!(ring.capacity(), 4);
    }

    #[test]
    fn test_interpolation_buffer_keeps_last_capacity_samples() {
        let mut buffer = InterpolationBuffer::new(0, Vector2f::ZERO);
        let extra = 3;
        for i in 1..=(INTERPOLATION_CAPACITY + extra) as i64 {
            buffer.record(i * 10, Vector2f::new(i as f32, 0.0));
        }
        let times: Vec<i64> = buffer.samples().map(|s| s.time_ms).collect();
        let expected: Vec<i64> = ((extra as i64 + 1)..=(INTERPOLATION_CAPACITY + extra) as i64)
            .map(|i| i * 10)
            .collect();
        assert_eq!(times, expected);
    }

    #[test]
    fn test_interpolates_between_bracketing_samples() {
        let p0 = Vector2f::new(0.0, 100.0);
        let p1 = Vector2f::new(50.0, 0.0);
        let mut buffer = InterpolationBuffer::new(1000, p0);
        buffer.record(1200, p1);

        for alpha in [0.0f32, 0.25, 0.5, 0.75, 1.0] {
            let render_time = 1000 + (alpha * 200.0) as i64;
            let pos = buffer.sample(render_time + DEFAULT_RENDER_DELAY_MS);
            assert_approx_eq!(pos.x, p0.x + alpha * (p1.x - p0.x), 1e-3);
            assert_approx_eq!(pos.y, p0.y + alpha * (p1.y - p0.y), 1e-3);
        }
    }

    #[test]
    fn test_picks_pair_around_render_time() {
        let mut buffer = InterpolationBuffer::new(0, Vector2f::ZERO).with_render_delay(0);
        buffer.record(100, Vector2f::new(10.0, 0.0));
        buffer.record(200, Vector2f::new(20.0, 0.0));
        buffer.record(300, Vector2f::new(40.0, 0.0));

        assert_approx_eq!(buffer.sample(150).x, 15.0);
        assert_approx_eq!(buffer.sample(250).x, 30.0);
        assert_approx_eq!(buffer.sample(350).x, 40.0);
    }

    #[test]
    fn test_equal_timestamps_use_newer_sample() {
        let mut buffer = InterpolationBuffer::new(500, Vector2f::new(1.0, 1.0)).with_render_delay(0);
        buffer.record(500, Vector2f::new(2.0, 2.0));
        buffer.record(600, Vector2f::new(3.0, 3.0));
        assert_approx_eq!(buffer.sample(500).x, 2.0);
    }

    #[test]
    fn test_young_buffer_holds_latest_position() {
        let mut buffer = InterpolationBuffer::new(1000, Vector2f::new(5.0, 5.0));
        buffer.record(1010, Vector2f::new(6.0, 6.0));
        // Render time 910 precedes every sample.
        let pos = buffer.sample(1010);
        assert_approx_eq!(pos.x, 6.0);
    }

    #[test]
    fn test_reset_disables_interpolation_across_warp() {
        let mut buffer = InterpolationBuffer::new(0, Vector2f::ZERO);
        buffer.record(100, Vector2f::new(10.0, 0.0));
        buffer.reset(200, Vector2f::new(500.0, 500.0));

        assert!(buffer.samples().all(|s| s.time_ms == 200));
        let pos = buffer.sample(250);
        assert_approx_eq!(pos.x, 500.0);
        assert_approx_eq!(pos.y, 500.0);
    }

    #[test]
    fn test_record_clamps_backwards_clock() {
        let mut buffer = InterpolationBuffer::new(1000, Vector2f::ZERO);
        buffer.record(900, Vector2f::new(1.0, 0.0));
        assert_eq!(buffer.latest().time_ms, 1000);
        assert_approx_eq!(buffer.latest().pos.x, 1.0);
    }
}
