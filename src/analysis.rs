/// Post-run analysis of a finalized sample sequence: summary statistics,
/// pattern detection, and optimization suggestions.
///
/// Everything here is a pure function of the samples; nothing touches the
/// filesystem or the process.
use crate::stats::MemorySample;
use serde::Serialize;

/// Fewer samples than this and no pattern is trusted.
const MIN_SAMPLES_FOR_PATTERNS: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryStats {
    pub count: usize,
    pub min_mb: u64,
    pub max_mb: u64,
    pub mean_mb: f64,
    pub median_mb: f64,
    pub p95_mb: u64,
    pub std_dev_mb: f64,
    pub first_mb: u64,
    pub last_mb: u64,
    pub span_secs: u64,
    /// Least-squares slope of memory over time.
    pub growth_mb_per_min: f64,
}

impl MemoryStats {
    /// `None` for an empty sequence.
    pub fn from_samples(samples: &[MemorySample]) -> Option<Self> {
        let first = samples.first()?;
        let last = samples.last()?;

        let mut sorted: Vec<u64> = samples.iter().map(|s| s.resident_mb).collect();
        sorted.sort_unstable();
        let count = sorted.len();

        let mean = sorted.iter().map(|&v| v as f64).sum::<f64>() / count as f64;
        let median = if count % 2 == 0 {
            (sorted[count / 2 - 1] as f64 + sorted[count / 2] as f64) / 2.0
        } else {
            sorted[count / 2] as f64
        };
        // Nearest-rank percentile
        let p95_rank = ((0.95 * count as f64).ceil() as usize).clamp(1, count);
        let variance = sorted
            .iter()
            .map(|&v| (v as f64 - mean).powi(2))
            .sum::<f64>()
            / count as f64;

        Some(Self {
            count,
            min_mb: sorted[0],
            max_mb: sorted[count - 1],
            mean_mb: mean,
            median_mb: median,
            p95_mb: sorted[p95_rank - 1],
            std_dev_mb: variance.sqrt(),
            first_mb: first.resident_mb,
            last_mb: last.resident_mb,
            span_secs: last.elapsed_secs.saturating_sub(first.elapsed_secs),
            growth_mb_per_min: slope_per_sec(samples) * 60.0,
        })
    }

    /// Coefficient of variation; 0 for an all-zero sequence.
    pub fn variation(&self) -> f64 {
        if self.mean_mb == 0.0 {
            0.0
        } else {
            self.std_dev_mb / self.mean_mb
        }
    }
}

fn slope_per_sec(samples: &[MemorySample]) -> f64 {
    let n = samples.len() as f64;
    if samples.len() < 2 {
        return 0.0;
    }
    let mean_t = samples.iter().map(|s| s.elapsed_secs as f64).sum::<f64>() / n;
    let mean_m = samples.iter().map(|s| s.resident_mb as f64).sum::<f64>() / n;
    let (mut cov, mut var) = (0.0, 0.0);
    for s in samples {
        let dt = s.elapsed_secs as f64 - mean_t;
        cov += dt * (s.resident_mb as f64 - mean_m);
        var += dt * dt;
    }
    if var == 0.0 {
        0.0
    } else {
        cov / var
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryPattern {
    Insufficient,
    Stable,
    Fluctuating,
    SteadyGrowth,
    Spiky,
    Sawtooth,
}

impl MemoryPattern {
    pub fn describe(self) -> &'static str {
        match self {
            MemoryPattern::Insufficient => "not enough samples to detect a pattern",
            MemoryPattern::Stable => "stable: memory stays flat",
            MemoryPattern::Fluctuating => "fluctuating: memory moves without a clear trend",
            MemoryPattern::SteadyGrowth => "steady growth: memory keeps climbing (possible leak)",
            MemoryPattern::Spiky => "spiky: short bursts well above the typical level",
            MemoryPattern::Sawtooth => "sawtooth: repeated build-up and release cycles",
        }
    }
}

/// Classify the shape of a sample sequence. Several patterns may apply.
pub fn detect_patterns(samples: &[MemorySample]) -> Vec<MemoryPattern> {
    let Some(stats) = MemoryStats::from_samples(samples) else {
        return vec![MemoryPattern::Insufficient];
    };
    if stats.count < MIN_SAMPLES_FOR_PATTERNS {
        return vec![MemoryPattern::Insufficient];
    }

    let mut patterns = Vec::new();
    let deltas: Vec<i128> = samples
        .windows(2)
        .map(|w| i128::from(w[1].resident_mb) - i128::from(w[0].resident_mb))
        .collect();

    let rising = deltas.iter().filter(|&&d| d >= 0).count();
    let net_growth = stats.last_mb as f64 - stats.first_mb as f64;
    if stats.growth_mb_per_min > 0.0
        && rising as f64 >= 0.7 * deltas.len() as f64
        && net_growth >= (0.2 * stats.first_mb as f64).max(5.0)
    {
        patterns.push(MemoryPattern::SteadyGrowth);
    }

    let spike_floor = (stats.median_mb * 1.5).max(stats.median_mb + 20.0);
    let spikes = samples
        .iter()
        .filter(|s| s.resident_mb as f64 > spike_floor)
        .count();
    if spikes > 0 && (spikes as f64) <= 0.25 * stats.count as f64 {
        patterns.push(MemoryPattern::Spiky);
    }

    // Drops of more than a fifth of the previous level
    let drops = deltas
        .iter()
        .zip(samples.iter())
        .filter(|(d, prev)| **d < 0 && (-**d) as f64 > 0.2 * prev.resident_mb as f64)
        .count();
    if drops >= 2 {
        patterns.push(MemoryPattern::Sawtooth);
    }

    if patterns.is_empty() {
        if stats.variation() < 0.15 {
            patterns.push(MemoryPattern::Stable);
        } else {
            patterns.push(MemoryPattern::Fluctuating);
        }
    }
    patterns
}

/// Human-readable advice, most important first.
pub fn suggestions(
    stats: Option<&MemoryStats>,
    patterns: &[MemoryPattern],
    limit_mb: Option<u64>,
) -> Vec<String> {
    let Some(stats) = stats else {
        return vec![
            "No memory samples were recorded. The job may have exited before the first check; \
             use a shorter --interval or lightweight mode (--interval 0)."
                .to_string(),
        ];
    };

    let mut out = Vec::new();
    if let Some(limit) = limit_mb.filter(|&l| l > 0) {
        let peak_ratio = stats.max_mb as f64 / limit as f64;
        if stats.max_mb > limit {
            out.push(format!(
                "Peak memory {}MB exceeded the {}MB limit by {:.0}%. Reduce batch sizes, \
                 stream input instead of loading it whole, or raise the limit.",
                stats.max_mb,
                limit,
                (peak_ratio - 1.0) * 100.0
            ));
        } else if peak_ratio >= 0.8 {
            out.push(format!(
                "Peak memory {}MB is within {:.0}% of the {}MB limit. Leave more headroom \
                 before data volumes grow.",
                stats.max_mb,
                (1.0 - peak_ratio) * 100.0,
                limit
            ));
        } else if peak_ratio < 0.3 && stats.max_mb > 0 {
            let suggested = ((stats.max_mb as f64 * 1.5).ceil() as u64).max(1);
            out.push(format!(
                "Peak memory {}MB uses under 30% of the {}MB limit. A limit near {}MB would \
                 catch regressions sooner.",
                stats.max_mb, limit, suggested
            ));
        }
    }

    for pattern in patterns {
        let advice = match pattern {
            MemoryPattern::SteadyGrowth => format!(
                "Memory grows about {:.1}MB/min from {}MB to {}MB without levelling off. Look for \
                 accumulating result lists, unbounded caches, or references kept across batches.",
                stats.growth_mb_per_min, stats.first_mb, stats.last_mb
            ),
            MemoryPattern::Spiky => format!(
                "Short spikes reach {}MB against a median of {:.0}MB. Large intermediate \
                 allocations (whole-file reads, big joins) are likely; process them in chunks.",
                stats.max_mb, stats.median_mb
            ),
            MemoryPattern::Sawtooth => "Memory repeatedly builds up and drops. Smaller batches \
                 or releasing buffers earlier would flatten the peaks."
                .to_string(),
            MemoryPattern::Fluctuating => format!(
                "Memory varies widely (std dev {:.1}MB around {:.0}MB). Check for uneven \
                 input sizes between stages.",
                stats.std_dev_mb, stats.mean_mb
            ),
            MemoryPattern::Insufficient => format!(
                "Only {} sample(s) were recorded. Use a shorter --interval for a more \
                 reliable picture.",
                stats.count
            ),
            MemoryPattern::Stable => format!(
                "Memory is stable around {:.0}MB. No action needed.",
                stats.mean_mb
            ),
        };
        out.push(advice);
    }
    out
}
