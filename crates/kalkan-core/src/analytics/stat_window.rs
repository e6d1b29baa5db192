//! Running statistics over a fixed-capacity window
//!
//! Two views share one type:
//! - cumulative: count, mean, variance (Welford) and min/max over every sample
//!   ever accepted,
//! - windowed: percentiles and spread over only the most recent `N` samples.

/// Fixed-capacity ring of recent samples plus cumulative accumulators.
#[derive(Debug, Clone)]
pub struct StatWindow<const N: usize> {
    ring: [f32; N],
    head: usize,
    len: usize,
    count: u64,
    mean: f64,
    m2: f64,
    min: f32,
    max: f32,
}

impl<const N: usize> StatWindow<N> {
    pub const fn new() -> Self {
        Self {
            ring: [0.0; N],
            head: 0,
            len: 0,
            count: 0,
            mean: 0.0,
            m2: 0.0,
            min: f32::INFINITY,
            max: f32::NEG_INFINITY,
        }
    }

    /// Add a sample. Non-finite values are ignored, returns whether it was kept.
    pub fn push(&mut self, value: f32) -> bool {
        if !value.is_finite() || N == 0 {
            return false;
        }

        self.count += 1;
        let x = value as f64;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);

        self.min = self.min.min(value);
        self.max = self.max.max(value);

        self.ring[self.head] = value;
        self.head = (self.head + 1) % N;
        if self.len < N {
            self.len += 1;
        }
        true
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Samples accepted since construction or the last reset.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Samples currently held in the window (at most `N`).
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    pub fn mean(&self) -> f32 {
        self.mean as f32
    }

    /// Sample variance, zero until two samples have been seen.
    pub fn variance(&self) -> f32 {
        if self.count > 1 {
            (self.m2 / (self.count - 1) as f64) as f32
        } else {
            0.0
        }
    }

    pub fn stddev(&self) -> f32 {
        libm::sqrtf(self.variance())
    }

    /// Smallest sample ever accepted, zero when empty.
    pub fn min(&self) -> f32 {
        if self.count == 0 { 0.0 } else { self.min }
    }

    /// Largest sample ever accepted, zero when empty.
    pub fn max(&self) -> f32 {
        if self.count == 0 { 0.0 } else { self.max }
    }

    /// Window samples, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = f32> + '_ {
        let start = (self.head + N - self.len) % N.max(1);
        (0..self.len).map(move |i| self.ring[(start + i) % N])
    }

    /// Newest sample in the window.
    pub fn latest(&self) -> Option<f32> {
        if self.len == 0 {
            None
        } else {
            Some(self.ring[(self.head + N - 1) % N])
        }
    }

    /// `p`-th percentile (0..=100) of the window, by nearest rank.
    ///
    /// Selection runs on a scratch copy so the ring order is untouched.
    pub fn percentile(&self, p: f32) -> f32 {
        if self.len == 0 {
            return 0.0;
        }

        let mut scratch = [0.0f32; N];
        let values = &mut scratch[..self.len];
        values.copy_from_slice(&self.ring[..self.len]);

        let p = if p.is_finite() { p.clamp(0.0, 100.0) } else { 50.0 };
        let rank = libm::roundf(p / 100.0 * (self.len - 1) as f32) as usize;
        let rank = rank.min(self.len - 1);

        let (_, value, _) = values.select_nth_unstable_by(rank, |a, b| a.total_cmp(b));
        *value
    }

    pub fn median(&self) -> f32 {
        self.percentile(50.0)
    }

    /// Mean of the window only.
    pub fn window_mean(&self) -> f32 {
        if self.len == 0 {
            return 0.0;
        }
        self.ring[..self.len].iter().sum::<f32>() / self.len as f32
    }

    /// Population standard deviation of the window only.
    ///
    /// Used where the cumulative figure would remember turbulence long gone.
    pub fn window_stddev(&self) -> f32 {
        if self.len == 0 {
            return 0.0;
        }
        let mean = self.window_mean();
        let variance = self.ring[..self.len]
            .iter()
            .map(|v| {
                let d = v - mean;
                d * d
            })
            .sum::<f32>()
            / self.len as f32;
        libm::sqrtf(variance)
    }
}

impl<const N: usize> Default for StatWindow<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deterministic xorshift32 so failures reproduce.
    struct XorShift(u32);

    impl XorShift {
        fn next_f32(&mut self, scale: f32) -> f32 {
            let mut x = self.0;
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            self.0 = x;
            (x as f32 / u32::MAX as f32) * scale
        }
    }

    fn naive_nearest_rank(values: &[f32], p: f32) -> f32 {
        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let rank = ((p / 100.0) * (sorted.len() - 1) as f32).round() as usize;
        sorted[rank]
    }

    #[test]
    fn test_median_matches_naive_sort_of_last_n() {
        let mut rng = XorShift(0x1234_5678);
        let mut window: StatWindow<25> = StatWindow::new();
        let mut history = std::vec::Vec::new();

        for i in 0..500 {
            let v = rng.next_f32(100.0);
            window.push(v);
            history.push(v);

            if i >= 25 {
                let last_n = &history[history.len() - 25..];
                assert_eq!(
                    window.median(),
                    naive_nearest_rank(last_n, 50.0),
                    "Median diverged after {} pushes",
                    i + 1
                );
                assert_eq!(window.percentile(90.0), naive_nearest_rank(last_n, 90.0));
                assert_eq!(window.percentile(10.0), naive_nearest_rank(last_n, 10.0));
            }
        }
    }

    #[test]
    fn test_welford_matches_two_pass() {
        let mut rng = XorShift(0xDEAD_BEEF);
        let mut window: StatWindow<16> = StatWindow::new();
        let mut all = std::vec::Vec::new();

        for _ in 0..10_000 {
            // Large offset stresses cancellation in the naive formula
            let v = 10_000.0 + rng.next_f32(5.0);
            window.push(v);
            all.push(v as f64);
        }

        let n = all.len() as f64;
        let mean = all.iter().sum::<f64>() / n;
        let variance = all.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / (n - 1.0);

        assert_eq!(window.count(), 10_000);
        assert!(((window.mean() as f64) - mean).abs() < 1e-2, "Mean off");
        assert!(
            ((window.variance() as f64) - variance).abs() / variance < 1e-3,
            "Variance off: {} vs {}",
            window.variance(),
            variance
        );
    }

    #[test]
    fn test_non_finite_is_rejected() {
        let mut window: StatWindow<4> = StatWindow::new();
        assert!(window.push(1.0));
        assert!(!window.push(f32::NAN));
        assert!(!window.push(f32::INFINITY));
        assert!(window.push(3.0));

        assert_eq!(window.count(), 2);
        assert_eq!(window.len(), 2);
        assert_eq!(window.mean(), 2.0);
        assert_eq!(window.max(), 3.0);
    }

    #[test]
    fn test_percentile_leaves_order_untouched() {
        let mut window: StatWindow<5> = StatWindow::new();
        for v in [5.0, 1.0, 4.0, 2.0, 3.0, 9.0] {
            window.push(v);
        }
        let before: std::vec::Vec<f32> = window.iter().collect();
        assert_eq!(before, [1.0, 4.0, 2.0, 3.0, 9.0]);

        assert_eq!(window.percentile(0.0), 1.0);
        assert_eq!(window.percentile(100.0), 9.0);
        assert_eq!(window.median(), 3.0);

        let after: std::vec::Vec<f32> = window.iter().collect();
        assert_eq!(before, after);
        assert_eq!(window.latest(), Some(9.0));
    }

    #[test]
    fn test_cumulative_stats_outlive_window() {
        let mut window: StatWindow<3> = StatWindow::new();
        for v in [100.0, 1.0, 2.0, 3.0] {
            window.push(v);
        }
        // 100 has left the window but is still part of the cumulative view
        assert_eq!(window.max(), 100.0);
        assert_eq!(window.count(), 4);
        assert_eq!(window.percentile(100.0), 3.0);
        assert_eq!(window.window_mean(), 2.0);
    }

    #[test]
    fn test_empty_window() {
        let window: StatWindow<8> = StatWindow::new();
        assert_eq!(window.median(), 0.0);
        assert_eq!(window.variance(), 0.0);
        assert_eq!(window.min(), 0.0);
        assert_eq!(window.window_stddev(), 0.0);
        assert_eq!(window.latest(), None);
    }
}
