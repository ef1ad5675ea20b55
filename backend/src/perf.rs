use std::collections::VecDeque;

/// Samples contributing to each telemetry mean.
pub const PERF_WINDOW: usize = 10;

/// Rolling mean over the last [`PERF_WINDOW`] samples.
#[derive(Debug, Default)]
pub struct RollingMean {
    samples: VecDeque<f64>,
}

impl RollingMean {
    pub fn push(&mut self, sample: f64) {
        if self.samples.len() == PERF_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }
}

/// Rounds a telemetry value to two decimals for the dashboard feed.
pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_mean_is_zero() {
        assert_eq!(RollingMean::default().mean(), 0.0);
    }

    #[test]
    fn mean_over_partial_window() {
        let mut rolling = RollingMean::default();
        rolling.push(10.0);
        rolling.push(20.0);

        assert_eq!(rolling.mean(), 15.0);
    }

    #[test]
    fn window_keeps_only_last_ten() {
        let mut rolling = RollingMean::default();
        for i in 0..PERF_WINDOW {
            rolling.push(100.0 + i as f64);
        }
        rolling.push(1000.0);

        // 100.0 fell out, 1000.0 came in.
        let expected = (101.0 + 109.0) * 9.0 / 2.0 + 1000.0;
        assert_eq!(rolling.mean(), expected / PERF_WINDOW as f64);
    }

    #[test]
    fn round2_truncates_noise() {
        assert_eq!(round2(12.345_678), 12.35);
        assert_eq!(round2(0.0), 0.0);
    }
}
