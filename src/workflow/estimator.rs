//! Rolling per-stage time estimates
//!
//! Keeps the last 100 observed durations per stage (and per full workflow)
//! and estimates with the 90th percentile, so displayed estimates are
//! conservative rather than optimistic.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;

/// Observations retained per stage and for full workflows
const HISTORY_WINDOW: usize = 100;

/// Samples needed before an estimate is fully trusted
const FULL_CONFIDENCE_SAMPLES: f64 = 20.0;

/// Estimate for one stage with its supporting sample count
#[derive(Debug, Clone, Serialize)]
pub struct StageEstimate {
    /// 90th-percentile duration, or the one-second default when unsampled
    pub estimated: Duration,
    /// `min(1.0, samples / 20)`
    pub confidence: f64,
    /// Observations backing the estimate
    pub samples: usize,
}

/// Estimates stage and workflow durations from recent history
#[derive(Default)]
pub struct TimeEstimator {
    stage_history: Mutex<HashMap<String, VecDeque<Duration>>>,
    workflow_history: Mutex<VecDeque<Duration>>,
}

fn p90(ring: &VecDeque<Duration>) -> Option<Duration> {
    if ring.is_empty() {
        return None;
    }
    let mut sorted: Vec<Duration> = ring.iter().copied().collect();
    sorted.sort();
    let index = (sorted.len() * 9 / 10).min(sorted.len() - 1);
    Some(sorted[index])
}

fn push_bounded(ring: &mut VecDeque<Duration>, duration: Duration) {
    if ring.len() >= HISTORY_WINDOW {
        ring.pop_front();
    }
    ring.push_back(duration);
}

impl TimeEstimator {
    /// Creates an estimator with no history
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an observed stage duration
    pub fn record_stage_time(&self, stage: &str, duration: Duration) {
        let mut history = self.stage_history.lock().unwrap_or_else(|e| e.into_inner());
        push_bounded(history.entry(stage.to_owned()).or_default(), duration);
    }

    /// Records an observed full-workflow duration
    pub fn record_workflow_time(&self, duration: Duration) {
        let mut history = self
            .workflow_history
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        push_bounded(&mut history, duration);
    }

    /// 90th-percentile estimate for a stage; one second when unsampled
    #[must_use]
    pub fn estimate_stage_time(&self, stage: &str) -> Duration {
        let history = self.stage_history.lock().unwrap_or_else(|e| e.into_inner());
        history
            .get(stage)
            .and_then(p90)
            .unwrap_or(Duration::from_secs(1))
    }

    /// Estimate for a full workflow over the given stage labels.
    ///
    /// Prefers the 90th percentile of completed workflows; falls back to
    /// the sum of stage estimates when none have completed yet.
    #[must_use]
    pub fn estimate_workflow_time<'a>(
        &self,
        stages: impl IntoIterator<Item = &'a str>,
    ) -> Duration {
        let workflow_p90 = {
            let history = self
                .workflow_history
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            p90(&history)
        };
        match workflow_p90 {
            Some(estimate) => estimate,
            None => stages
                .into_iter()
                .map(|stage| self.estimate_stage_time(stage))
                .sum(),
        }
    }

    /// Confidence in a stage estimate, growing with sample count
    #[must_use]
    pub fn confidence(&self, stage: &str) -> f64 {
        let history = self.stage_history.lock().unwrap_or_else(|e| e.into_inner());
        let samples = history.get(stage).map(VecDeque::len).unwrap_or(0);
        (samples as f64 / FULL_CONFIDENCE_SAMPLES).min(1.0)
    }

    /// Estimate, confidence, and sample count for one stage
    #[must_use]
    pub fn stage_estimate(&self, stage: &str) -> StageEstimate {
        let samples = {
            let history = self.stage_history.lock().unwrap_or_else(|e| e.into_inner());
            history.get(stage).map(VecDeque::len).unwrap_or(0)
        };
        StageEstimate {
            estimated: self.estimate_stage_time(stage),
            confidence: self.confidence(stage),
            samples,
        }
    }

    /// Number of completed workflows in the history ring
    #[must_use]
    pub fn workflow_samples(&self) -> usize {
        self.workflow_history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsampled_stage_defaults_to_one_second() {
        let estimator = TimeEstimator::new();
        assert_eq!(
            estimator.estimate_stage_time("parsing"),
            Duration::from_secs(1)
        );
        assert_eq!(estimator.confidence("parsing"), 0.0);
    }

    #[test]
    fn estimate_is_the_ninetieth_percentile() {
        let estimator = TimeEstimator::new();
        for i in 1..=10 {
            estimator.record_stage_time("pricing_calculation", Duration::from_secs(i));
        }
        // index 9 of the sorted ten samples
        assert_eq!(
            estimator.estimate_stage_time("pricing_calculation"),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn history_ring_is_bounded() {
        let estimator = TimeEstimator::new();
        for i in 0..150 {
            estimator.record_stage_time("parsing", Duration::from_millis(i));
        }
        assert_eq!(estimator.stage_estimate("parsing").samples, HISTORY_WINDOW);
    }

    #[test]
    fn confidence_saturates_at_twenty_samples() {
        let estimator = TimeEstimator::new();
        for _ in 0..5 {
            estimator.record_stage_time("review", Duration::from_secs(1));
        }
        assert!((estimator.confidence("review") - 0.25).abs() < f64::EPSILON);
        for _ in 0..30 {
            estimator.record_stage_time("review", Duration::from_secs(1));
        }
        assert!((estimator.confidence("review") - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn workflow_estimate_falls_back_to_stage_sums() {
        let estimator = TimeEstimator::new();
        estimator.record_stage_time("parsing", Duration::from_secs(2));
        estimator.record_stage_time("sales_analysis", Duration::from_secs(3));

        let estimate = estimator.estimate_workflow_time(["parsing", "sales_analysis"]);
        assert_eq!(estimate, Duration::from_secs(5));

        estimator.record_workflow_time(Duration::from_secs(42));
        let estimate = estimator.estimate_workflow_time(["parsing", "sales_analysis"]);
        assert_eq!(estimate, Duration::from_secs(42));
    }
}
