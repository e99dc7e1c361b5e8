//! The physics solver seam.
//!
//! The simulation loop drives a [`HydraulicSolver`] one hydraulic step at a
//! time. Solvers are exclusively owned by one run and always released
//! through a [`SolverHandle`], whichever way the run ends.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::FlowUnits;
use crate::controller::ActuatorCommand;
use crate::error::{SimError, SimResult};
use crate::leakage::EmitterOverride;
use crate::sensor::{SensorConfig, SensorType};
use crate::time::TemporalGrid;

/// Failure reported by a solver implementation.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{0}")]
pub struct SolverFault(pub String);

impl SolverFault {
    pub fn new(msg: impl Into<String>) -> Self {
        SolverFault(msg.into())
    }
}

/// Uncertain model parameters, keyed by element id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelParameters {
    pub base_demands: BTreeMap<String, f64>,
    pub demand_patterns: BTreeMap<String, Vec<f64>>,
    pub node_elevations: BTreeMap<String, f64>,
    pub pipe_lengths: BTreeMap<String, f64>,
    pub pipe_diameters: BTreeMap<String, f64>,
    pub pipe_roughness: BTreeMap<String, f64>,
}

/// Everything a solver needs before the first step of a run.
#[derive(Debug, Clone)]
pub struct SolverSetup {
    pub grid: TemporalGrid,
    pub sensors: SensorConfig,
    pub parameters: ModelParameters,
    pub flow_units: FlowUnits,
}

/// Sensor values computed by one solver step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawStepResult {
    pub time: u64,
    pub readings: BTreeMap<SensorType, BTreeMap<String, f64>>,
}

impl RawStepResult {
    pub fn new(time: u64) -> Self {
        Self { time, readings: BTreeMap::new() }
    }

    pub fn set(&mut self, sensor_type: SensorType, sensor_id: impl Into<String>, value: f64) {
        self.readings.entry(sensor_type).or_default().insert(sensor_id.into(), value);
    }

    pub fn get(&self, sensor_type: &SensorType, sensor_id: &str) -> Option<f64> {
        self.readings.get(sensor_type)?.get(sensor_id).copied()
    }
}

pub trait HydraulicSolver {
    /// Nominal parameters of the loaded model, before any uncertainty.
    fn model_parameters(&self) -> ModelParameters;

    /// Resets the solver to time zero with the given (possibly perturbed)
    /// parameters.
    fn configure(&mut self, setup: &SolverSetup) -> Result<(), SolverFault>;

    /// Applies the actuator commands and emitters, computes the state at the
    /// current time, and advances by one hydraulic step.
    fn step(
        &mut self,
        actuators: &[ActuatorCommand],
        emitters: &[EmitterOverride],
    ) -> Result<RawStepResult, SolverFault>;

    fn close(&mut self);
}

/// Scoped ownership of a solver. Releasing twice is a no-op and dropping the
/// handle releases it.
#[derive(Debug)]
pub struct SolverHandle<S: HydraulicSolver> {
    solver: Option<S>,
}

impl<S: HydraulicSolver> SolverHandle<S> {
    pub fn new(solver: S) -> Self {
        Self { solver: Some(solver) }
    }

    pub fn is_released(&self) -> bool {
        self.solver.is_none()
    }

    pub fn get(&self) -> SimResult<&S> {
        self.solver.as_ref().ok_or_else(|| SimError::state("solver already released"))
    }

    pub fn get_mut(&mut self) -> SimResult<&mut S> {
        self.solver.as_mut().ok_or_else(|| SimError::state("solver already released"))
    }

    pub fn release(&mut self) {
        if let Some(mut solver) = self.solver.take() {
            solver.close();
            log::debug!("solver released");
        }
    }
}

impl<S: HydraulicSolver> Drop for SolverHandle<S> {
    fn drop(&mut self) {
        self.release();
    }
}
