use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

use super::MetricsSummary;

/// A success-rate alert.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub success_rate: f64,
    pub threshold: f64,
    pub runs: usize,
    pub window_start: DateTime<Utc>,
}

impl std::fmt::Display for Alert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "success rate {:.0}% over {} run(s) is below {:.0}%",
            self.success_rate * 100.0,
            self.runs,
            self.threshold * 100.0
        )
    }
}

/// Fires at most once per window when the success rate drops below the
/// threshold. Windows are aligned to multiples of the window length since
/// the Unix epoch.
#[derive(Debug, Clone)]
pub struct AlertGate {
    threshold: f64,
    min_samples: usize,
    window: Duration,
    last_bucket: Option<i64>,
}

impl AlertGate {
    pub fn new(threshold: f64, min_samples: usize, window: Duration) -> Self {
        Self {
            threshold,
            min_samples,
            window,
            last_bucket: None,
        }
    }

    fn bucket(&self, now: DateTime<Utc>) -> i64 {
        let secs = self.window.as_secs().max(1) as i64;
        now.timestamp().div_euclid(secs)
    }

    pub fn evaluate(&mut self, summary: &MetricsSummary, now: DateTime<Utc>) -> Option<Alert> {
        let rate = summary.success_rate?;
        if summary.runs < self.min_samples || rate >= self.threshold {
            return None;
        }
        let bucket = self.bucket(now);
        if self.last_bucket == Some(bucket) {
            return None;
        }
        self.last_bucket = Some(bucket);

        let secs = self.window.as_secs().max(1) as i64;
        let window_start = DateTime::from_timestamp(bucket * secs, 0).unwrap_or(now);
        Some(Alert {
            success_rate: rate,
            threshold: self.threshold,
            runs: summary.runs,
            window_start,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(rate: f64, runs: usize) -> MetricsSummary {
        MetricsSummary {
            success_rate: Some(rate),
            runs,
            ..Default::default()
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn test_fires_once_per_window() {
        let mut gate = AlertGate::new(0.5, 3, Duration::from_secs(3600));
        assert!(gate.evaluate(&summary(0.2, 5), at(7200)).is_some());
        assert!(gate.evaluate(&summary(0.1, 6), at(7200 + 1800)).is_none());
        let next = gate.evaluate(&summary(0.1, 6), at(10800)).unwrap();
        assert_eq!(next.window_start, at(10800));
    }

    #[test]
    fn test_needs_minimum_samples() {
        let mut gate = AlertGate::new(0.5, 3, Duration::from_secs(3600));
        assert!(gate.evaluate(&summary(0.0, 2), at(0)).is_none());
        assert!(gate.evaluate(&summary(0.0, 3), at(0)).is_some());
    }

    #[test]
    fn test_healthy_rate_is_silent() {
        let mut gate = AlertGate::new(0.5, 1, Duration::from_secs(60));
        assert!(gate.evaluate(&summary(0.5, 10), at(0)).is_none());
        assert!(gate.evaluate(&MetricsSummary::default(), at(0)).is_none());
    }

    #[test]
    fn test_display() {
        let mut gate = AlertGate::new(0.5, 1, Duration::from_secs(60));
        let alert = gate.evaluate(&summary(0.25, 4), at(0)).unwrap();
        assert_eq!(alert.to_string(), "success rate 25% over 4 run(s) is below 50%");
    }
}
