//! Ready-made control modules.

use serde::{Deserialize, Serialize};

use crate::controller::{
    check_command, ActuatorAction, ActuatorCommand, BoxError, ControlContext, ControlModule, ControlSnapshot,
};
use crate::safety::{EnvelopeConfig, SettingEnvelope};
use crate::sensor::SensorType;
use crate::validation::{validate_reading, CircuitBreaker};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    Above,
    Below,
}

fn check_actuator(ctx: &ControlContext<'_>, actuator_id: &str, action: &ActuatorAction) -> Result<(), BoxError> {
    Ok(check_command(ctx.network, actuator_id, action)?)
}

/// `IF reading ABOVE|BELOW threshold THEN action [ELSE action]`.
///
/// Reacts to the observed reading unless built with [`reading_raw`], and
/// only issues a command when the condition flips.
///
/// [`reading_raw`]: ThresholdControl::reading_raw
#[derive(Debug, Clone)]
pub struct ThresholdControl {
    name: String,
    sensor_type: SensorType,
    sensor_id: String,
    comparison: Comparison,
    threshold: f64,
    actuator_id: String,
    then_action: ActuatorAction,
    else_action: Option<ActuatorAction>,
    use_raw: bool,
    last: Option<bool>,
}

impl ThresholdControl {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        sensor_type: SensorType,
        sensor_id: impl Into<String>,
        comparison: Comparison,
        threshold: f64,
        actuator_id: impl Into<String>,
        then_action: ActuatorAction,
    ) -> Self {
        Self {
            name: name.into(),
            sensor_type,
            sensor_id: sensor_id.into(),
            comparison,
            threshold,
            actuator_id: actuator_id.into(),
            then_action,
            else_action: None,
            use_raw: false,
            last: None,
        }
    }

    pub fn with_else(mut self, action: ActuatorAction) -> Self {
        self.else_action = Some(action);
        self
    }

    pub fn reading_raw(mut self) -> Self {
        self.use_raw = true;
        self
    }
}

impl ControlModule for ThresholdControl {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&mut self, ctx: &ControlContext<'_>) -> Result<(), BoxError> {
        if !ctx.sensors.contains(&self.sensor_type, &self.sensor_id) {
            return Err(format!("no {} sensor at '{}'", self.sensor_type, self.sensor_id).into());
        }
        check_actuator(ctx, &self.actuator_id, &self.then_action)?;
        if let Some(a) = &self.else_action {
            check_actuator(ctx, &self.actuator_id, a)?;
        }
        self.last = None;
        Ok(())
    }

    fn step(&mut self, snapshot: &ControlSnapshot<'_>) -> Result<Vec<ActuatorCommand>, BoxError> {
        let value = if self.use_raw {
            snapshot.raw(&self.sensor_type, &self.sensor_id)
        } else {
            snapshot.observed(&self.sensor_type, &self.sensor_id)
        }
        .ok_or_else(|| format!("no reading for '{}'", self.sensor_id))?;

        let hit = match self.comparison {
            Comparison::Above => value > self.threshold,
            Comparison::Below => value < self.threshold,
        };
        if self.last == Some(hit) {
            return Ok(Vec::new());
        }
        self.last = Some(hit);
        let action = if hit { Some(self.then_action) } else { self.else_action };
        Ok(action
            .map(|a| vec![ActuatorCommand::new(self.actuator_id.clone(), a)])
            .unwrap_or_default())
    }
}

#[derive(Debug, Clone)]
pub struct SetpointConfig {
    /// Pressure to hold at the sensor, in meters.
    pub target: f64,
    /// Valve opening change per meter of pressure error.
    pub gain: f64,
    pub decision_epsilon: f64,
    pub min_decision_interval: u64,
    /// Readings outside this range trip the breaker.
    pub plausible_range: (f64, f64),
}

impl Default for SetpointConfig {
    fn default() -> Self {
        Self {
            target: 30.0,
            gain: 0.02,
            decision_epsilon: 0.01,
            min_decision_interval: 1_800,
            plausible_range: (0.0, 200.0),
        }
    }
}

/// Holds the observed pressure at one sensor near a target by throttling a
/// valve, inside a [`SettingEnvelope`]. Implausible readings trip a
/// [`CircuitBreaker`] that freezes the valve for the cooldown.
#[derive(Debug, Clone)]
pub struct PressureSetpointControl {
    sensor_id: String,
    valve_id: String,
    pub cfg: SetpointConfig,
    envelope: SettingEnvelope,
    breaker: CircuitBreaker,
    last_decision_time: Option<u64>,
    last_decision: Option<f64>,
}

impl PressureSetpointControl {
    pub fn new(sensor_id: impl Into<String>, valve_id: impl Into<String>, cfg: SetpointConfig) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            valve_id: valve_id.into(),
            cfg,
            envelope: SettingEnvelope::new(EnvelopeConfig::default()),
            breaker: CircuitBreaker::default(),
            last_decision_time: None,
            last_decision: None,
        }
    }

    pub fn with_envelope(mut self, cfg: EnvelopeConfig) -> Self {
        self.envelope = SettingEnvelope::new(cfg);
        self
    }

    pub fn with_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.breaker = breaker;
        self
    }

    /// Decide a valve opening from the observed pressure; returns (setting, changed)
    pub fn decide(&mut self, pressure: f64, t: u64) -> (f64, bool) {
        let base = self.last_decision.or(self.envelope.last_setting()).unwrap_or(1.0);
        let proposal = base - self.cfg.gain * (pressure - self.cfg.target);
        let Some(target) = self.envelope.limit(t, proposal) else {
            return (base, false);
        };
        let changed = match self.last_decision {
            Some(prev) => (prev - target).abs() > self.cfg.decision_epsilon,
            None => true,
        } && match self.last_decision_time {
            Some(last_t) => t.saturating_sub(last_t) >= self.cfg.min_decision_interval,
            None => true,
        };
        if changed {
            self.last_decision = Some(target);
            self.last_decision_time = Some(t);
            self.envelope.record_change(t, target);
        }
        (target, changed)
    }
}

impl ControlModule for PressureSetpointControl {
    fn name(&self) -> &str {
        "pressure-setpoint"
    }

    fn init(&mut self, ctx: &ControlContext<'_>) -> Result<(), BoxError> {
        if !ctx.sensors.contains(&SensorType::Pressure, &self.sensor_id) {
            return Err(format!("no pressure sensor at '{}'", self.sensor_id).into());
        }
        check_actuator(ctx, &self.valve_id, &ActuatorAction::ValveSetting(1.0))
    }

    fn step(&mut self, snapshot: &ControlSnapshot<'_>) -> Result<Vec<ActuatorCommand>, BoxError> {
        let t = snapshot.time;
        let pressure = snapshot
            .observed(&SensorType::Pressure, &self.sensor_id)
            .ok_or_else(|| format!("no reading for '{}'", self.sensor_id))?;
        let (lo, hi) = self.cfg.plausible_range;
        if let Err(e) = validate_reading(pressure, lo, hi) {
            log::warn!("pressure-setpoint: implausible reading at '{}' (t={t}s): {e:?}", self.sensor_id);
            self.breaker.trip(t);
            return Ok(Vec::new());
        }
        if !self.breaker.allow(t) {
            return Ok(Vec::new());
        }
        let (setting, changed) = self.decide(pressure, t);
        if !changed {
            return Ok(Vec::new());
        }
        Ok(vec![ActuatorCommand::new(self.valve_id.clone(), ActuatorAction::ValveSetting(setting))])
    }
}
