//! Leak emitter models.
//!
//! A leak is a time-varying orifice at a node. The simulation loop asks
//! every registered leak for its orifice area before each hydraulic step and
//! hands the non-zero ones to the solver as emitter overrides.

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use crate::config::NetworkTopology;
use crate::error::{SimError, SimResult};
use crate::time::{TemporalGrid, TimeWindow};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LeakSpec {
    /// Full area for the whole window.
    Abrupt {
        location_id: String,
        peak_area: f64,
        window: TimeWindow,
    },
    /// Area grows linearly from zero at `window.start` to `peak_area` at
    /// `peak_time`, then holds until `window.end`.
    Incipient {
        location_id: String,
        peak_area: f64,
        window: TimeWindow,
        peak_time: u64,
    },
}

/// Orifice area applied at one node for one hydraulic step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmitterOverride {
    pub location_id: String,
    pub area: f64,
}

/// Cross-sectional area of a circular hole, in square meters.
pub fn area_from_diameter(diameter: f64) -> f64 {
    PI * diameter * diameter / 4.0
}

impl LeakSpec {
    pub fn abrupt(location_id: impl Into<String>, peak_area: f64, window: TimeWindow) -> Self {
        LeakSpec::Abrupt { location_id: location_id.into(), peak_area, window }
    }

    pub fn incipient(location_id: impl Into<String>, peak_area: f64, window: TimeWindow, peak_time: u64) -> Self {
        LeakSpec::Incipient { location_id: location_id.into(), peak_area, window, peak_time }
    }

    pub fn abrupt_from_diameter(location_id: impl Into<String>, diameter: f64, window: TimeWindow) -> Self {
        Self::abrupt(location_id, area_from_diameter(diameter), window)
    }

    pub fn incipient_from_diameter(
        location_id: impl Into<String>,
        diameter: f64,
        window: TimeWindow,
        peak_time: u64,
    ) -> Self {
        Self::incipient(location_id, area_from_diameter(diameter), window, peak_time)
    }

    pub fn location_id(&self) -> &str {
        match self {
            LeakSpec::Abrupt { location_id, .. } | LeakSpec::Incipient { location_id, .. } => location_id,
        }
    }

    pub fn window(&self) -> &TimeWindow {
        match self {
            LeakSpec::Abrupt { window, .. } | LeakSpec::Incipient { window, .. } => window,
        }
    }

    pub fn peak_area(&self) -> f64 {
        match self {
            LeakSpec::Abrupt { peak_area, .. } | LeakSpec::Incipient { peak_area, .. } => *peak_area,
        }
    }

    /// Orifice area at time `t`. Zero outside `[start, end)`.
    pub fn area_at(&self, t: u64) -> f64 {
        match self {
            LeakSpec::Abrupt { peak_area, window, .. } => {
                if window.contains(t) {
                    *peak_area
                } else {
                    0.0
                }
            }
            LeakSpec::Incipient { peak_area, window, peak_time, .. } => {
                if !window.contains(t) {
                    0.0
                } else if t >= *peak_time {
                    *peak_area
                } else {
                    let ramp = (*peak_time - window.start) as f64;
                    peak_area * (t - window.start) as f64 / ramp
                }
            }
        }
    }

    pub fn emitter_at(&self, t: u64) -> Option<EmitterOverride> {
        let area = self.area_at(t);
        (area > 0.0).then(|| EmitterOverride { location_id: self.location_id().to_string(), area })
    }

    pub fn validate(&self, network: &NetworkTopology, grid: &TemporalGrid) -> SimResult<()> {
        if !network.has_node(self.location_id()) {
            return Err(SimError::config(format!("leak at unknown node '{}'", self.location_id())));
        }
        let area = self.peak_area();
        if !area.is_finite() || area <= 0.0 {
            return Err(SimError::config(format!("leak area must be positive, got {area}")));
        }
        let window = self.window();
        window.check_within(grid.duration())?;
        if let LeakSpec::Incipient { peak_time, .. } = self {
            if *peak_time < window.start || *peak_time > window.end {
                return Err(SimError::config(format!(
                    "incipient leak peak time {peak_time}s lies outside [{}, {}]",
                    window.start, window.end
                )));
            }
        }
        if !grid.hydraulic_times().iter().any(|&t| window.contains(t)) {
            log::warn!(
                "leak at '{}' never overlaps a hydraulic step and will have no effect",
                self.location_id()
            );
        }
        Ok(())
    }
}
