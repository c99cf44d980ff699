/*!
# Load Predictor

Per-worker linear trend over recent utilization samples. The prediction only
tilts hybrid scoring; it is never a hard admission decision.
*/

use crate::task::Task;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

/// Samples kept per worker
const HISTORY_CAPACITY: usize = 50;

/// Task duration above which the complexity bump grows
const LONG_TASK_MS: u64 = 5 * 60 * 1000;

/// Memory hint above which the complexity bump grows
const LARGE_MEMORY_BYTES: u64 = 512 * 1024 * 1024;

/// Capability count above which the complexity bump grows
const MANY_CAPABILITIES: usize = 3;

/// A fitted trend for one worker
#[derive(Debug, Clone, Serialize)]
pub struct LoadPrediction {
    /// Predicted utilization at the next sample, clamped to [0,1]
    pub predicted: f64,
    /// Fitted slope per sample
    pub slope: f64,
    /// Fitted intercept
    pub intercept: f64,
    /// R² of the fit, in [0,1]
    pub confidence: f64,
    /// Samples the fit was computed over
    pub samples: usize,
}

/// Simple univariate regression over per-worker load history
pub struct LoadPredictor {
    histories: RwLock<HashMap<String, VecDeque<f64>>>,
}

impl LoadPredictor {
    /// Create an empty predictor
    pub fn new() -> Self {
        Self {
            histories: RwLock::new(HashMap::new()),
        }
    }

    /// Record a utilization sample for a worker
    pub fn record(&self, worker: &str, utilization: f64) {
        let mut histories = self.histories.write().unwrap();
        let history = histories.entry(worker.to_string()).or_default();
        if history.len() == HISTORY_CAPACITY {
            history.pop_front();
        }
        history.push_back(utilization.clamp(0.0, 1.0));
    }

    /// Drop a worker's history
    pub fn remove(&self, worker: &str) {
        self.histories.write().unwrap().remove(worker);
    }

    /// Fit `y = slope·x + intercept` over the history and extrapolate one
    /// sample ahead. Needs at least two samples.
    pub fn predict(&self, worker: &str) -> Option<LoadPrediction> {
        let histories = self.histories.read().unwrap();
        let history = histories.get(worker)?;
        let n = history.len();
        if n < 2 {
            return None;
        }

        let nf = n as f64;
        let mean_x = (nf - 1.0) / 2.0;
        let mean_y = history.iter().sum::<f64>() / nf;

        let mut ss_xy = 0.0;
        let mut ss_xx = 0.0;
        let mut ss_yy = 0.0;
        for (i, y) in history.iter().enumerate() {
            let dx = i as f64 - mean_x;
            let dy = y - mean_y;
            ss_xy += dx * dy;
            ss_xx += dx * dx;
            ss_yy += dy * dy;
        }

        let slope = if ss_xx == 0.0 { 0.0 } else { ss_xy / ss_xx };
        let intercept = mean_y - slope * mean_x;
        // A flat series is a perfect fit of a flat line
        let confidence = if ss_yy == 0.0 {
            1.0
        } else {
            ((ss_xy * ss_xy) / (ss_xx * ss_yy)).clamp(0.0, 1.0)
        };

        Some(LoadPrediction {
            predicted: (slope * nf + intercept).clamp(0.0, 1.0),
            slope,
            intercept,
            confidence,
            samples: n,
        })
    }

    /// Complexity of a prospective task, in [0,1]
    pub fn task_complexity(task: &Task) -> f64 {
        let mut complexity: f64 = 0.5;
        if task.timeout_ms > LONG_TASK_MS {
            complexity += 0.3;
        }
        if task.memory_hint_bytes.unwrap_or(0) > LARGE_MEMORY_BYTES {
            complexity += 0.2;
        }
        if task.required_capabilities.len() > MANY_CAPABILITIES {
            complexity += 0.2;
        }
        complexity.min(1.0)
    }

    /// Predicted utilization if the worker also took this task
    pub fn predict_with_task(&self, worker: &str, task: &Task) -> Option<f64> {
        let prediction = self.predict(worker)?;
        let bumped = prediction.predicted + 0.1 * Self::task_complexity(task);
        Some(bumped.clamp(0.0, 1.0))
    }
}

impl Default for LoadPredictor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskSpec;

    #[test]
    fn test_needs_two_samples() {
        let predictor = LoadPredictor::new();
        assert!(predictor.predict("w1").is_none());
        predictor.record("w1", 0.5);
        assert!(predictor.predict("w1").is_none());
        predictor.record("w1", 0.5);
        assert!(predictor.predict("w1").is_some());
    }

    #[test]
    fn test_rising_trend() {
        let predictor = LoadPredictor::new();
        for i in 0..10 {
            predictor.record("w1", 0.05 * i as f64);
        }
        let prediction = predictor.predict("w1").unwrap();
        assert!(prediction.slope > 0.0);
        // Perfectly linear data fits with full confidence
        assert!((prediction.confidence - 1.0).abs() < 1e-9);
        assert!((prediction.predicted - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_flat_series_confident() {
        let predictor = LoadPredictor::new();
        for _ in 0..5 {
            predictor.record("w1", 0.4);
        }
        let prediction = predictor.predict("w1").unwrap();
        assert_eq!(prediction.slope, 0.0);
        assert_eq!(prediction.confidence, 1.0);
        assert!((prediction.predicted - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_prediction_clamped() {
        let predictor = LoadPredictor::new();
        for i in 0..10 {
            predictor.record("w1", 0.2 * i as f64);
        }
        let prediction = predictor.predict("w1").unwrap();
        assert!(prediction.predicted <= 1.0);
    }

    #[test]
    fn test_complexity_bump() {
        let simple = Task::from_spec(TaskSpec::new("t"), 1000, 0);
        assert!((LoadPredictor::task_complexity(&simple) - 0.5).abs() < 1e-9);

        let heavy = Task::from_spec(
            TaskSpec::new("t")
                .with_timeout_ms(10 * 60 * 1000)
                .with_memory_hint(1024 * 1024 * 1024)
                .requires_capability("a")
                .requires_capability("b")
                .requires_capability("c")
                .requires_capability("d"),
            1000,
            0,
        );
        // 0.5 + 0.3 + 0.2 + 0.2 clamps to 1.0
        assert_eq!(LoadPredictor::task_complexity(&heavy), 1.0);

        let predictor = LoadPredictor::new();
        predictor.record("w1", 0.5);
        predictor.record("w1", 0.5);
        let with_task = predictor.predict_with_task("w1", &heavy).unwrap();
        assert!((with_task - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_history_bounded() {
        let predictor = LoadPredictor::new();
        for _ in 0..200 {
            predictor.record("w1", 0.5);
        }
        let prediction = predictor.predict("w1").unwrap();
        assert_eq!(prediction.samples, HISTORY_CAPACITY);
    }
}
