use crate::analysis::{self, MemoryPattern, MemoryStats};
use crate::sample_log;
use crate::stats::MemorySample;
use std::fmt::Write as _;
use std::path::Path;

const CHART_WIDTH: usize = 60;
const CHART_HEIGHT: usize = 12;
const SVG_WIDTH: f64 = 720.0;
const SVG_HEIGHT: f64 = 240.0;

/// Handle the `analyze` subcommand.
///
/// Reads the sample lines back from a run log and prints statistics, detected
/// patterns and suggestions. The limit falls back to the one recorded in the
/// log header when not given.
pub fn handle_analyze(
    log_path: &Path,
    limit_mb: Option<u64>,
    html_path: Option<&Path>,
    chart: bool,
) -> Result<(), String> {
    let text = std::fs::read_to_string(log_path)
        .map_err(|e| format!("Failed to read log {}: {e}", log_path.display()))?;
    let samples = sample_log::parse_samples(&text);
    let limit_mb = limit_mb.or_else(|| sample_log::parse_limit(&text));

    print!("{}", format_analysis(&samples, limit_mb, chart));

    if let Some(html_path) = html_path {
        let stats = MemoryStats::from_samples(&samples);
        let patterns = analysis::detect_patterns(&samples);
        let advice = analysis::suggestions(stats.as_ref(), &patterns, limit_mb);
        let title = format!("Memory report: {}", log_path.display());
        let html = render_html(&title, &samples, stats.as_ref(), &patterns, &advice);
        std::fs::write(html_path, html)
            .map_err(|e| format!("Failed to write {}: {e}", html_path.display()))?;
        println!("HTML report written to {}", html_path.display());
    }
    Ok(())
}

/// Terminal rendering of the full analysis.
pub fn format_analysis(samples: &[MemorySample], limit_mb: Option<u64>, chart: bool) -> String {
    let stats = MemoryStats::from_samples(samples);
    let patterns = analysis::detect_patterns(samples);
    let advice = analysis::suggestions(stats.as_ref(), &patterns, limit_mb);

    let mut out = String::new();
    let _ = writeln!(out, "Memory analysis");
    let _ = writeln!(out, "===============");
    match &stats {
        Some(s) => {
            let _ = writeln!(out, "Samples:   {} over {}s", s.count, s.span_secs);
            let _ = writeln!(out, "Min/Max:   {}MB / {}MB", s.min_mb, s.max_mb);
            let _ = writeln!(
                out,
                "Mean:      {:.1}MB (median {:.1}MB, p95 {}MB, std dev {:.1}MB)",
                s.mean_mb, s.median_mb, s.p95_mb, s.std_dev_mb
            );
            let _ = writeln!(out, "Growth:    {:+.1}MB/min", s.growth_mb_per_min);
        }
        None => {
            let _ = writeln!(out, "Samples:   0");
        }
    }
    if let Some(limit) = limit_mb {
        let _ = writeln!(out, "Limit:     {limit}MB");
    }

    let _ = writeln!(out, "\nPatterns:");
    for pattern in &patterns {
        let _ = writeln!(out, "  - {}", pattern.describe());
    }

    let _ = writeln!(out, "\nSuggestions:");
    for (i, line) in advice.iter().enumerate() {
        let _ = writeln!(out, "  {}. {line}", i + 1);
    }

    if chart && !samples.is_empty() {
        let _ = writeln!(out);
        out.push_str(&render_chart(samples, CHART_WIDTH, CHART_HEIGHT));
    }
    out
}

/// ASCII bar chart of memory over time.
///
/// Samples are bucketed into at most `width` columns; each column shows the
/// peak of its bucket. The top row is labelled with the overall peak.
pub fn render_chart(samples: &[MemorySample], width: usize, height: usize) -> String {
    if samples.is_empty() || width == 0 || height == 0 {
        return "(no samples)\n".to_string();
    }

    let peak = samples.iter().map(|s| s.resident_mb).max().unwrap_or(0).max(1);
    let cols = width.min(samples.len());
    let bars: Vec<usize> = (0..cols)
        .map(|c| {
            let start = c * samples.len() / cols;
            let end = ((c + 1) * samples.len() / cols).max(start + 1);
            let value = samples[start..end]
                .iter()
                .map(|s| s.resident_mb)
                .max()
                .unwrap_or(0);
            let scaled = (u128::from(value) * height as u128).div_ceil(u128::from(peak));
            usize::try_from(scaled).unwrap_or(height)
        })
        .collect();

    let mut out = String::new();
    for row in (1..=height).rev() {
        if row == height {
            let _ = write!(out, "{peak:>6}MB |");
        } else {
            out.push_str("         |");
        }
        for &bar in &bars {
            out.push(if bar >= row { '#' } else { ' ' });
        }
        out.push('\n');
    }
    let _ = writeln!(out, "         +{}", "-".repeat(cols));
    let last = samples.last().map(|s| s.elapsed_secs).unwrap_or(0);
    let _ = writeln!(out, "          0s .. {last}s");
    out
}

/// Self-contained HTML report with an inline SVG line chart.
pub fn render_html(
    title: &str,
    samples: &[MemorySample],
    stats: Option<&MemoryStats>,
    patterns: &[MemoryPattern],
    suggestions: &[String],
) -> String {
    let title = escape_html(title);
    let mut out = String::new();
    let _ = writeln!(out, "<!DOCTYPE html>");
    let _ = writeln!(out, "<html><head><meta charset=\"utf-8\"><title>{title}</title>");
    let _ = writeln!(
        out,
        "<style>body{{font-family:sans-serif;margin:2em}}table{{border-collapse:collapse}}\
         td,th{{padding:4px 12px;text-align:left}}polyline{{fill:none;stroke:#1f77b4;stroke-width:2}}</style>"
    );
    let _ = writeln!(out, "</head><body>");
    let _ = writeln!(out, "<h1>{title}</h1>");

    if let Some(s) = stats {
        let _ = writeln!(out, "<table>");
        for (label, value) in [
            ("Samples", s.count.to_string()),
            ("Span", format!("{}s", s.span_secs)),
            ("Min", format!("{}MB", s.min_mb)),
            ("Max", format!("{}MB", s.max_mb)),
            ("Mean", format!("{:.1}MB", s.mean_mb)),
            ("Median", format!("{:.1}MB", s.median_mb)),
            ("p95", format!("{}MB", s.p95_mb)),
            ("Std dev", format!("{:.1}MB", s.std_dev_mb)),
            ("Growth", format!("{:+.1}MB/min", s.growth_mb_per_min)),
        ] {
            let _ = writeln!(out, "<tr><th>{label}</th><td>{value}</td></tr>");
        }
        let _ = writeln!(out, "</table>");
    } else {
        let _ = writeln!(out, "<p>No memory samples recorded.</p>");
    }

    if !samples.is_empty() {
        let _ = writeln!(
            out,
            "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"{SVG_WIDTH}\" height=\"{SVG_HEIGHT}\" \
             viewBox=\"0 0 {SVG_WIDTH} {SVG_HEIGHT}\">"
        );
        let _ = writeln!(out, "<polyline points=\"{}\"/>", svg_points(samples));
        let _ = writeln!(out, "</svg>");
    }

    let _ = writeln!(out, "<h2>Patterns</h2><ul>");
    for pattern in patterns {
        let _ = writeln!(out, "<li>{}</li>", escape_html(pattern.describe()));
    }
    let _ = writeln!(out, "</ul>");

    let _ = writeln!(out, "<h2>Suggestions</h2><ol>");
    for line in suggestions {
        let _ = writeln!(out, "<li>{}</li>", escape_html(line));
    }
    let _ = writeln!(out, "</ol>");
    let _ = writeln!(out, "</body></html>");
    out
}

/// Scale samples into the SVG viewport. Memory grows upward.
fn svg_points(samples: &[MemorySample]) -> String {
    let peak = samples.iter().map(|s| s.resident_mb).max().unwrap_or(0).max(1) as f64;
    let span = samples.last().map(|s| s.elapsed_secs).unwrap_or(0);
    let steps = samples.len().saturating_sub(1).max(1) as f64;

    samples
        .iter()
        .enumerate()
        .map(|(i, s)| {
            // Same-second runs have no time axis to speak of; spread by index instead.
            let x = if span > 0 {
                s.elapsed_secs as f64 / span as f64 * SVG_WIDTH
            } else {
                i as f64 / steps * SVG_WIDTH
            };
            let y = SVG_HEIGHT - s.resident_mb as f64 / peak * SVG_HEIGHT;
            format!("{x:.1},{y:.1}")
        })
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn series(values: &[(u64, u64)]) -> Vec<MemorySample> {
        values
            .iter()
            .map(|&(elapsed_secs, resident_mb)| MemorySample {
                elapsed_secs,
                resident_mb,
            })
            .collect()
    }

    #[test]
    fn test_chart_bars_scale_to_peak() {
        let chart = render_chart(&series(&[(0, 0), (2, 5), (4, 10)]), 10, 2);
        let lines: Vec<&str> = chart.lines().collect();
        assert_eq!(lines[0], "    10MB |  #");
        assert_eq!(lines[1], "         | ##");
        assert_eq!(lines[2], "         +---");
        assert_eq!(lines[3], "          0s .. 4s");
    }

    #[test]
    fn test_chart_buckets_to_width() {
        let samples: Vec<MemorySample> = (0..100)
            .map(|i| MemorySample {
                elapsed_secs: i,
                resident_mb: i,
            })
            .collect();
        let chart = render_chart(&samples, 20, 4);
        let axis = chart.lines().nth(4).unwrap();
        assert_eq!(axis, format!("         +{}", "-".repeat(20)));
    }

    #[test]
    fn test_analysis_of_huge_log_values() {
        let samples =
            sample_log::parse_samples("[0s] Memory: 18446744073709551615MB\n[1s] Memory: 1MB\n");
        assert_eq!(samples.len(), 2);
        let text = format_analysis(&samples, None, true);
        assert!(text.contains("Min/Max:   1MB / 18446744073709551615MB"));

        let chart = render_chart(&samples, 10, 4);
        assert!(chart.starts_with("18446744073709551615MB |#"));
    }

    #[test]
    fn test_chart_without_samples() {
        assert_eq!(render_chart(&[], 10, 5), "(no samples)\n");
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(
            escape_html(r#"<script>alert("x&y")</script>'"#),
            "&lt;script&gt;alert(&quot;x&amp;y&quot;)&lt;/script&gt;&#39;"
        );
    }

    #[test]
    fn test_html_escapes_title_and_suggestions() {
        let samples = series(&[(0, 10), (2, 20)]);
        let stats = MemoryStats::from_samples(&samples);
        let html = render_html(
            "run <b>1</b>",
            &samples,
            stats.as_ref(),
            &[MemoryPattern::Insufficient],
            &["use a <Vec> & stream".to_string()],
        );
        assert!(html.contains("<title>run &lt;b&gt;1&lt;/b&gt;</title>"));
        assert!(html.contains("<li>use a &lt;Vec&gt; &amp; stream</li>"));
        assert!(!html.contains("<b>1</b>"));
        assert!(html.contains("<polyline points=\"0.0,120.0 720.0,0.0\"/>"));
    }

    #[test]
    fn test_html_without_samples_has_no_svg() {
        let html = render_html("empty", &[], None, &[MemoryPattern::Insufficient], &[]);
        assert!(html.contains("No memory samples recorded."));
        assert!(!html.contains("<svg"));
    }

    #[test]
    fn test_format_analysis_lists_limit_and_advice() {
        let samples = series(&[(0, 100), (2, 200), (4, 300), (6, 400), (8, 500)]);
        let text = format_analysis(&samples, Some(450), false);
        assert!(text.contains("Min/Max:   100MB / 500MB"));
        assert!(text.contains("Limit:     450MB"));
        assert!(text.contains("  1. Peak memory 500MB exceeded the 450MB limit"));
        assert!(!text.contains("0s .. "));
    }

    #[test]
    fn test_handle_analyze_reads_log_and_writes_html() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("run.log");
        std::fs::write(
            &log,
            "Starting ETL job at 2026-01-01T00:00:00+00:00\n\
             Memory limit set to 100MB\n\
             [0s] Memory: 10MB\n\
             [2s] Memory: 20MB\n\
             [4s] Memory: 30MB\n",
        )
        .unwrap();
        let html = dir.path().join("report.html");

        handle_analyze(&log, None, Some(&html), true).unwrap();
        let text = std::fs::read_to_string(&html).unwrap();
        assert!(text.starts_with("<!DOCTYPE html>"));
        assert!(text.contains("<polyline"));
    }

    #[test]
    fn test_handle_analyze_missing_log() {
        let err = handle_analyze(Path::new("/nonexistent/run.log"), None, None, false)
            .unwrap_err();
        assert!(err.starts_with("Failed to read log"));
    }
}
