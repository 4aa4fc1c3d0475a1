use crate::models::Prediction;
use serde::Serialize;

/// Highest percentage reported while the process is still running.
pub const MAX_RUNNING_PERCENT: u8 = 99;

const DURATION_MIN_ELAPSED_SECS: f64 = 0.5;
const DURATION_TRUSTED_PERCENT: u8 = 10;
const LINEAR_MIN_PERCENT: u8 = 2;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressTick {
    pub percent: u8,
    pub remaining_secs: Option<f64>,
    pub eta: Option<String>,
}

/// Blends the historical prediction with live line counts and elapsed time.
#[derive(Debug, Clone)]
pub struct ProgressEstimator {
    estimated_total_lines: u32,
    predicted_duration: Option<f64>,
    last_percent: u8,
}

impl ProgressEstimator {
    pub fn new(prediction: &Prediction, line_hint: Option<u32>) -> Self {
        let estimated_total_lines = prediction
            .estimated_total_lines
            .max(line_hint.unwrap_or(0))
            .max(1);
        Self {
            estimated_total_lines,
            predicted_duration: prediction.estimated_duration,
            last_percent: 0,
        }
    }

    pub fn estimated_total_lines(&self) -> u32 {
        self.estimated_total_lines
    }

    pub fn tick(&mut self, lines_seen: u32, elapsed_secs: f64) -> ProgressTick {
        let percent = self.percent(lines_seen);
        let remaining_secs = self.remaining(elapsed_secs, percent);
        ProgressTick {
            percent,
            remaining_secs,
            eta: remaining_secs.map(format_eta),
        }
    }

    /// Never decreases within a session and stays below 100 until exit.
    pub fn percent(&mut self, lines_seen: u32) -> u8 {
        let raw = u64::from(lines_seen) * 100 / u64::from(self.estimated_total_lines);
        let capped = raw.min(u64::from(MAX_RUNNING_PERCENT)) as u8;
        self.last_percent = self.last_percent.max(capped);
        self.last_percent
    }

    /// Weighted average of the duration-based and line-rate candidates, or
    /// `None` while neither has enough signal.
    pub fn remaining(&self, elapsed_secs: f64, percent: u8) -> Option<f64> {
        let mut candidates: Vec<(f64, f64)> = Vec::with_capacity(2);

        if let Some(predicted) = self.predicted_duration.filter(|value| *value > 0.0) {
            if elapsed_secs > DURATION_MIN_ELAPSED_SECS {
                let weight = if percent >= DURATION_TRUSTED_PERCENT { 2.0 } else { 1.0 };
                candidates.push(((predicted - elapsed_secs).max(0.0), weight));
            }
        }

        if percent > LINEAR_MIN_PERCENT {
            let percent = f64::from(percent);
            candidates.push(((elapsed_secs / percent) * (100.0 - percent), 1.0));
        }

        if candidates.is_empty() {
            return None;
        }
        let total_weight: f64 = candidates.iter().map(|(_, weight)| weight).sum();
        let weighted: f64 = candidates.iter().map(|(value, weight)| value * weight).sum();
        Some(weighted / total_weight)
    }
}

pub fn format_eta(remaining_secs: f64) -> String {
    let total = remaining_secs.max(0.0) as u64;
    format!("{}m {}s remaining", total / 60, total % 60)
}
