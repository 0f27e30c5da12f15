use snowtify_common::config::DetectionConfig;
use tracing::trace;

/// Impulse-response confidence filter over raw observation counts.
///
/// Growth per update is `count * sensitivity / max(value, 1)`, so the higher
/// the confidence already is, the more observations it takes to keep it
/// rising. A fixed `decay` is subtracted every update, so a run of empty
/// frames drains the value linearly down to `min`.
#[derive(Debug, Clone)]
pub struct ConfidenceSmoother {
    value: i64,
    min: i64,
    max: i64,
    decay: f64,
    sensitivity: f64,
}

impl ConfidenceSmoother {
    pub fn new(min: i64, max: i64, decay: f64, sensitivity: f64) -> Self {
        Self {
            value: min,
            min,
            max,
            decay,
            sensitivity,
        }
    }

    pub fn from_config(config: &DetectionConfig) -> Self {
        Self::new(config.min, config.max, config.decay, config.sensitivity)
    }

    /// Fold one frame's observation count in and return the new confidence.
    pub fn update(&mut self, observation_count: u32) -> i64 {
        let growth = (observation_count as f64 * self.sensitivity) / self.value.max(1) as f64;
        let delta = growth - self.decay;
        let next = (self.value as f64 + delta).clamp(self.min as f64, self.max as f64);
        // truncate toward zero after clamping
        self.value = next as i64;
        trace!(observation_count, growth, value = self.value, "confidence updated");
        self.value
    }

    pub fn value(&self) -> i64 {
        self.value
    }

    pub fn reset(&mut self) {
        self.value = self.min;
    }
}
