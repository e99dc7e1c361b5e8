//! Simulation time: event windows and the discrete step/report grid.

use serde::{Deserialize, Serialize};

use crate::error::{SimError, SimResult};

pub const MINUTE: u64 = 60;
pub const HOUR: u64 = 3_600;
pub const DAY: u64 = 86_400;

/// Seconds since simulation start.
pub fn seconds(days: u64, hours: u64, minutes: u64) -> u64 {
    days * DAY + hours * HOUR + minutes * MINUTE
}

/// `(start, end)` in simulation seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: u64,
    pub end: u64,
}

impl TimeWindow {
    pub fn new(start: u64, end: u64) -> SimResult<Self> {
        if start >= end {
            return Err(SimError::config(format!(
                "time window must satisfy start < end, got [{start}, {end})"
            )));
        }
        Ok(Self { start, end })
    }

    /// Continuous-time membership, half-open `[start, end)`.
    pub fn contains(&self, t: u64) -> bool {
        t >= self.start && t < self.end
    }

    /// Report-sample membership: the reading taken exactly at `end` belongs to
    /// the window, so `[5h, 7h]` on a 30 min grid covers five samples.
    pub fn covers_sample(&self, t: u64) -> bool {
        t >= self.start && t <= self.end
    }

    pub fn duration(&self) -> u64 {
        self.end - self.start
    }

    /// Rejects windows that reach past the simulated horizon.
    pub fn check_within(&self, simulation_duration: u64) -> SimResult<()> {
        if self.start >= self.end {
            return Err(SimError::config(format!(
                "time window must satisfy start < end, got [{}, {})",
                self.start, self.end
            )));
        }
        if self.end > simulation_duration {
            return Err(SimError::config(format!(
                "time window [{}, {}) exceeds simulation duration {}s",
                self.start, self.end, simulation_duration
            )));
        }
        Ok(())
    }
}

/// Discrete hydraulic and reporting grid of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemporalGrid {
    duration: u64,
    hydraulic_step: u64,
    reporting_step: u64,
    quality_step: u64,
    reporting_start: u64,
}

impl TemporalGrid {
    pub fn new(
        duration: u64,
        hydraulic_step: u64,
        reporting_step: u64,
        quality_step: Option<u64>,
        reporting_start: u64,
    ) -> SimResult<Self> {
        if duration == 0 {
            return Err(SimError::config("simulation duration must be positive"));
        }
        for (name, step) in [("hydraulic", hydraulic_step), ("reporting", reporting_step)] {
            if step == 0 {
                return Err(SimError::config(format!("{name} time step must be positive")));
            }
            if step > duration {
                return Err(SimError::config(format!(
                    "{name} time step {step}s exceeds simulation duration {duration}s"
                )));
            }
        }
        if duration % reporting_step != 0 {
            return Err(SimError::config(format!(
                "simulation duration {duration}s is not a multiple of the reporting step {reporting_step}s"
            )));
        }
        if duration % hydraulic_step != 0 {
            return Err(SimError::config(format!(
                "simulation duration {duration}s is not a multiple of the hydraulic step {hydraulic_step}s"
            )));
        }
        if reporting_step % hydraulic_step != 0 {
            return Err(SimError::config(format!(
                "reporting step {reporting_step}s must be a multiple of the hydraulic step {hydraulic_step}s"
            )));
        }
        let quality_step = quality_step.unwrap_or(hydraulic_step);
        if quality_step == 0 || quality_step > hydraulic_step {
            return Err(SimError::config(format!(
                "quality step {quality_step}s must be positive and not exceed the hydraulic step"
            )));
        }
        if reporting_start >= duration || reporting_start % reporting_step != 0 {
            return Err(SimError::config(format!(
                "reporting start {reporting_start}s must lie on the reporting grid before the end of the run"
            )));
        }

        Ok(Self {
            duration,
            hydraulic_step,
            reporting_step,
            quality_step,
            reporting_start,
        })
    }

    pub fn duration(&self) -> u64 {
        self.duration
    }

    pub fn hydraulic_step(&self) -> u64 {
        self.hydraulic_step
    }

    pub fn reporting_step(&self) -> u64 {
        self.reporting_step
    }

    pub fn quality_step(&self) -> u64 {
        self.quality_step
    }

    pub fn reporting_start(&self) -> u64 {
        self.reporting_start
    }

    /// Number of report indices `N`.
    pub fn num_reports(&self) -> usize {
        ((self.duration - self.reporting_start) / self.reporting_step) as usize
    }

    /// Number of hydraulic steps, `D / h`.
    pub fn num_hydraulic_steps(&self) -> usize {
        (self.duration / self.hydraulic_step) as usize
    }

    pub fn report_time(&self, index: usize) -> u64 {
        self.reporting_start + index as u64 * self.reporting_step
    }

    pub fn hydraulic_time(&self, step: usize) -> u64 {
        step as u64 * self.hydraulic_step
    }

    pub fn report_times(&self) -> Vec<u64> {
        (0..self.num_reports()).map(|i| self.report_time(i)).collect()
    }

    pub fn hydraulic_times(&self) -> Vec<u64> {
        (0..self.num_hydraulic_steps()).map(|k| self.hydraulic_time(k)).collect()
    }

    pub fn is_report_time(&self, t: u64) -> bool {
        t >= self.reporting_start
            && t < self.duration
            && (t - self.reporting_start) % self.reporting_step == 0
    }

    pub fn report_index_of(&self, t: u64) -> Option<usize> {
        if self.is_report_time(t) {
            Some(((t - self.reporting_start) / self.reporting_step) as usize)
        } else {
            None
        }
    }

    /// Hydraulic step index for a time that lies exactly on the hydraulic grid.
    pub fn hydraulic_index_of(&self, t: u64) -> Option<usize> {
        if t < self.duration && t % self.hydraulic_step == 0 {
            Some((t / self.hydraulic_step) as usize)
        } else {
            None
        }
    }

    /// Report indices whose sample is covered by `window`.
    pub fn report_indices_in(&self, window: &TimeWindow) -> Vec<usize> {
        (0..self.num_reports())
            .filter(|&i| window.covers_sample(self.report_time(i)))
            .collect()
    }
}
