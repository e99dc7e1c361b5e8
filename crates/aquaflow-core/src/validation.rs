//! Plausibility checks on solver output and sensor readings.

use crate::solver::{RawStepResult, SolverFault};

#[derive(Debug, Clone, PartialEq)]
pub enum ReadingError {
    NonFinite,
    OutOfRange { value: f64, min: f64, max: f64 },
}

/// Rejects solver output containing NaN or infinite values.
pub fn validate_step(result: &RawStepResult) -> Result<(), SolverFault> {
    for (ty, values) in &result.readings {
        if let Some((id, v)) = values.iter().find(|(_, v)| !v.is_finite()) {
            return Err(SolverFault::new(format!("non-finite {ty} reading {v} at '{id}'")));
        }
    }
    Ok(())
}

/// Validate one reading against a plausible range.
pub fn validate_reading(value: f64, min: f64, max: f64) -> Result<(), ReadingError> {
    if !value.is_finite() {
        return Err(ReadingError::NonFinite);
    }
    if value < min || value > max {
        return Err(ReadingError::OutOfRange { value, min, max });
    }
    Ok(())
}

/// Stops acting on a signal after repeated implausible readings, for a
/// cooldown period in simulation seconds.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    failure_count: u32,
    last_failure: Option<u64>,
    threshold: u32,
    cooldown: u64,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self {
            failure_count: 0,
            last_failure: None,
            threshold: 3,
            cooldown: 3_600, // 1 hour
        }
    }
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: u64) -> Self {
        Self { threshold, cooldown, ..Self::default() }
    }

    pub fn trip(&mut self, now: u64) {
        self.failure_count += 1;
        self.last_failure = Some(now);
    }

    pub fn allow(&self, now: u64) -> bool {
        if let Some(last) = self.last_failure {
            if self.failure_count >= self.threshold && now.saturating_sub(last) < self.cooldown {
                return false;
            }
        }
        true
    }

    pub fn reset(&mut self) {
        self.failure_count = 0;
        self.last_failure = None;
    }
}
