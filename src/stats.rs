/// Per-run memory accumulator.
///
/// Owned by exactly one supervisor for the lifetime of one run. Samples are
/// folded in as they are taken; the running max and sum are kept alongside so
/// the final average never needs a second pass.
use serde::Serialize;

const BYTES_PER_MB: u64 = 1024 * 1024;

/// One memory observation, relative to the start of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemorySample {
    pub elapsed_secs: u64,
    pub resident_mb: u64,
}

/// Convert a resident-set reading to whole megabytes, rounding to nearest.
pub fn bytes_to_mb(bytes: u64) -> u64 {
    bytes.saturating_add(BYTES_PER_MB / 2) / BYTES_PER_MB
}

#[derive(Debug, Default)]
pub struct RunStatistics {
    samples: Vec<MemorySample>,
    sum_mb: u64,
    max_mb: u64,
}

impl RunStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a sample into the accumulator.
    ///
    /// Elapsed time is clamped so the recorded sequence stays non-decreasing
    /// even if a caller hands in an out-of-order reading.
    pub fn record(&mut self, mut sample: MemorySample) -> MemorySample {
        if let Some(last) = self.samples.last() {
            sample.elapsed_secs = sample.elapsed_secs.max(last.elapsed_secs);
        }
        self.sum_mb = self.sum_mb.saturating_add(sample.resident_mb);
        self.max_mb = self.max_mb.max(sample.resident_mb);
        self.samples.push(sample);
        sample
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn max_mb(&self) -> u64 {
        self.max_mb
    }

    /// Rounded mean of all samples; 0 when nothing was recorded.
    pub fn avg_mb(&self) -> u64 {
        let count = self.samples.len() as u64;
        if count == 0 {
            return 0;
        }
        self.sum_mb.saturating_add(count / 2) / count
    }

    pub fn samples(&self) -> &[MemorySample] {
        &self.samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(elapsed_secs: u64, resident_mb: u64) -> MemorySample {
        MemorySample {
            elapsed_secs,
            resident_mb,
        }
    }

    #[test]
    fn test_empty_statistics_have_zero_avg_and_max() {
        let stats = RunStatistics::new();
        assert_eq!(stats.sample_count(), 0);
        assert_eq!(stats.avg_mb(), 0);
        assert_eq!(stats.max_mb(), 0);
        assert!(stats.samples().is_empty());
    }

    #[test]
    fn test_max_tracks_largest_sample() {
        let mut stats = RunStatistics::new();
        for (t, mb) in [(0, 40), (2, 120), (4, 80), (6, 119)] {
            stats.record(sample(t, mb));
        }
        assert_eq!(stats.max_mb(), 120);
        assert_eq!(stats.sample_count(), 4);
    }

    #[test]
    fn test_avg_rounds_to_nearest() {
        let mut stats = RunStatistics::new();
        stats.record(sample(0, 10));
        stats.record(sample(1, 11));
        // 10.5 rounds up
        assert_eq!(stats.avg_mb(), 11);

        stats.record(sample(2, 10));
        // 31 / 3 = 10.33
        assert_eq!(stats.avg_mb(), 10);
    }

    #[test]
    fn test_single_sample_is_both_avg_and_max() {
        let mut stats = RunStatistics::new();
        stats.record(sample(0, 7));
        assert_eq!(stats.avg_mb(), 7);
        assert_eq!(stats.max_mb(), 7);
    }

    #[test]
    fn test_equal_elapsed_seconds_are_kept() {
        let mut stats = RunStatistics::new();
        stats.record(sample(3, 1));
        stats.record(sample(3, 2));
        assert_eq!(stats.samples(), &[sample(3, 1), sample(3, 2)]);
    }

    #[test]
    fn test_out_of_order_elapsed_is_clamped() {
        let mut stats = RunStatistics::new();
        stats.record(sample(5, 1));
        let stored = stats.record(sample(4, 2));
        assert_eq!(stored.elapsed_secs, 5);
    }

    #[test]
    fn test_bytes_to_mb_rounding() {
        assert_eq!(bytes_to_mb(0), 0);
        assert_eq!(bytes_to_mb(BYTES_PER_MB), 1);
        assert_eq!(bytes_to_mb(BYTES_PER_MB / 2 - 1), 0);
        assert_eq!(bytes_to_mb(BYTES_PER_MB / 2), 1);
        assert_eq!(bytes_to_mb(10 * BYTES_PER_MB + 3), 10);
        assert_eq!(bytes_to_mb(u64::MAX), u64::MAX / BYTES_PER_MB);
    }

    #[test]
    fn test_saturated_sum_does_not_overflow_avg() {
        let mut stats = RunStatistics::new();
        stats.record(sample(0, u64::MAX));
        stats.record(sample(1, u64::MAX));
        assert_eq!(stats.max_mb(), u64::MAX);
        assert_eq!(stats.avg_mb(), u64::MAX / 2);
    }
}
