//! Lightweight statistics sinks. Samples are recorded into an `hdrhistogram`
//! and summarized through `tracing` once per report interval.
use std::time::Duration;

use hdrhistogram::Histogram;
use minstant::Instant;

pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(10);

/// Collects samples and periodically reports their distribution.
#[derive(Debug)]
pub struct StatisticsCollector {
    name: String,
    hist: Histogram<u64>,
    report_interval: Duration,
    last_report: Instant,
    total_samples: u64,
}

impl StatisticsCollector {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self::with_interval(name, DEFAULT_REPORT_INTERVAL)
    }

    pub fn with_interval<S: Into<String>>(name: S, report_interval: Duration) -> Self {
        StatisticsCollector {
            name: name.into(),
            // auto-resizing histogram with 3 significant figures
            hist: Histogram::new(3).expect("3 significant figures is always valid"),
            report_interval,
            last_report: Instant::now(),
            total_samples: 0,
        }
    }

    #[inline]
    pub fn add_sample(&mut self, value: u64) {
        self.hist.saturating_record(value);
        self.total_samples += 1;
        if self.last_report.elapsed() >= self.report_interval {
            self.report();
        }
    }

    /// Samples recorded since the last report.
    #[inline]
    pub fn pending_samples(&self) -> u64 {
        self.hist.len()
    }

    #[inline]
    pub fn total_samples(&self) -> u64 {
        self.total_samples
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn report(&mut self) {
        if !self.hist.is_empty() {
            tracing::info!(
                "[STAT] {} n={} min={} p50={} p90={} p99={} p99.9={} max={}",
                self.name,
                self.hist.len(),
                self.hist.min(),
                self.hist.value_at_quantile(0.5),
                self.hist.value_at_quantile(0.9),
                self.hist.value_at_quantile(0.99),
                self.hist.value_at_quantile(0.999),
                self.hist.max(),
            );
            self.hist.reset();
        }
        self.last_report = Instant::now();
    }
}

/// A monotonically increasing event counter that reports its rate.
#[derive(Debug)]
pub struct Counter {
    name: String,
    value: u64,
    last_value: u64,
    report_interval: Duration,
    last_report: Instant,
}

impl Counter {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self::with_interval(name, DEFAULT_REPORT_INTERVAL)
    }

    pub fn with_interval<S: Into<String>>(name: S, report_interval: Duration) -> Self {
        Counter {
            name: name.into(),
            value: 0,
            last_value: 0,
            report_interval,
            last_report: Instant::now(),
        }
    }

    #[inline]
    pub fn tick(&mut self) {
        self.tick_n(1);
    }

    #[inline]
    pub fn tick_n(&mut self, n: u64) {
        self.value += n;
        let elapsed = self.last_report.elapsed();
        if elapsed >= self.report_interval {
            let delta = self.value - self.last_value;
            tracing::info!(
                "[STAT] {} value={} rate={:.2}/s",
                self.name,
                self.value,
                delta as f64 / elapsed.as_secs_f64(),
            );
            self.last_value = self.value;
            self.last_report = Instant::now();
        }
    }

    #[inline]
    pub fn value(&self) -> u64 {
        self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collector_resets_after_report() {
        let mut stat = StatisticsCollector::with_interval("bytes_per_read", Duration::from_secs(3600));
        for v in [64, 128, 4096] {
            stat.add_sample(v);
        }
        assert_eq!(stat.pending_samples(), 3);
        stat.report();
        assert_eq!(stat.pending_samples(), 0);
        assert_eq!(stat.total_samples(), 3);
    }

    #[test]
    fn collector_reports_on_interval() {
        let mut stat = StatisticsCollector::with_interval("write_size", Duration::ZERO);
        stat.add_sample(1);
        assert_eq!(stat.pending_samples(), 0);
        assert_eq!(stat.total_samples(), 1);
    }

    #[test]
    fn counter_counts() {
        let mut counter = Counter::with_interval("discarded_func_call", Duration::ZERO);
        counter.tick();
        counter.tick_n(4);
        assert_eq!(counter.value(), 5);
    }
}
