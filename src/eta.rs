use crate::history::OperationHistory;
use crate::models::{CommandSpec, OperationKey, Prediction};
use std::sync::Arc;

pub const DEFAULT_TOTAL_LINES: u32 = 50;
pub const MIN_TOTAL_LINES: u32 = 5;

/// Turns stored samples into median predictions and feeds observed runs back in.
#[derive(Clone)]
pub struct EtaModel {
    history: Arc<OperationHistory>,
}

impl EtaModel {
    pub fn new(history: Arc<OperationHistory>) -> Self {
        Self { history }
    }

    pub fn history(&self) -> &Arc<OperationHistory> {
        &self.history
    }

    pub fn predict(&self, spec: &CommandSpec) -> Prediction {
        self.predict_key(&spec.operation_key())
    }

    pub fn predict_key(&self, key: &OperationKey) -> Prediction {
        let samples = self.history.samples(key);
        let line_median = median(samples.lines.iter().map(|&lines| f64::from(lines)));

        Prediction {
            estimated_total_lines: line_median
                .map(|median| (median.floor() as u32).max(MIN_TOTAL_LINES))
                .unwrap_or(DEFAULT_TOTAL_LINES),
            estimated_duration: median(samples.durations.iter().copied()),
            has_line_history: line_median.is_some(),
        }
    }

    /// Persistence failures are logged and dropped.
    pub fn record(&self, spec: &CommandSpec, total_lines: u32, duration_secs: f64) {
        let key = spec.operation_key();
        match self.history.append(&key, total_lines, duration_secs) {
            Ok(()) => {
                tracing::debug!(key = %key, lines = total_lines, duration_secs, "recorded operation sample");
            }
            Err(error) => {
                tracing::warn!(key = %key, error = %error, "failed to persist operation history");
            }
        }
    }
}

pub fn median(values: impl Iterator<Item = f64>) -> Option<f64> {
    let mut sorted = values.filter(|value| value.is_finite()).collect::<Vec<_>>();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}
