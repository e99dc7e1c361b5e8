//! Control module runtime.
//!
//! Control modules observe the network once per hydraulic step and answer
//! with actuator commands that take effect before the next step is computed.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::NetworkTopology;
use crate::error::{SimError, SimResult};
use crate::faults::{Sampling, SensorReadingEvent};
use crate::readings::RawReadings;
use crate::scada::observe_series;
use crate::sensor::{SensorConfig, SensorType};
use crate::time::TemporalGrid;
use crate::uncertainty::SensorNoise;

/// Error type returned by user control logic.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Open,
    Closed,
}

impl LinkState {
    /// Numeric encoding used by pump and valve state sensors.
    pub fn as_reading(&self) -> f64 {
        match self {
            LinkState::Open => 1.0,
            LinkState::Closed => 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ActuatorKind {
    PumpState,
    PumpSpeed,
    ValveState,
    ValveSetting,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "value", rename_all = "snake_case")]
pub enum ActuatorAction {
    PumpState(LinkState),
    /// Relative speed, 1.0 is nominal.
    PumpSpeed(f64),
    ValveState(LinkState),
    /// Opening fraction in `[0, 1]`.
    ValveSetting(f64),
}

impl ActuatorAction {
    pub fn kind(&self) -> ActuatorKind {
        match self {
            ActuatorAction::PumpState(_) => ActuatorKind::PumpState,
            ActuatorAction::PumpSpeed(_) => ActuatorKind::PumpSpeed,
            ActuatorAction::ValveState(_) => ActuatorKind::ValveState,
            ActuatorAction::ValveSetting(_) => ActuatorKind::ValveSetting,
        }
    }

    pub fn targets_pump(&self) -> bool {
        matches!(self, ActuatorAction::PumpState(_) | ActuatorAction::PumpSpeed(_))
    }

    fn check_value(&self) -> Result<(), String> {
        match *self {
            ActuatorAction::PumpSpeed(s) if !s.is_finite() || s < 0.0 => Err(format!("invalid pump speed {s}")),
            ActuatorAction::ValveSetting(s) if !s.is_finite() || !(0.0..=1.0).contains(&s) => {
                Err(format!("valve setting {s} outside [0, 1]"))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActuatorCommand {
    pub actuator_id: String,
    pub action: ActuatorAction,
    /// First hydraulic step whose computation sees this command.
    pub effective_step: usize,
}

impl ActuatorCommand {
    /// A command for the earliest step the runtime allows.
    pub fn new(actuator_id: impl Into<String>, action: ActuatorAction) -> Self {
        Self { actuator_id: actuator_id.into(), action, effective_step: 0 }
    }

    pub fn at_step(mut self, step: usize) -> Self {
        self.effective_step = step;
        self
    }

    pub fn key(&self) -> (String, ActuatorKind) {
        (self.actuator_id.clone(), self.action.kind())
    }
}

/// An actuator change scheduled at a fixed simulation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActuatorEvent {
    pub time: u64,
    pub actuator_id: String,
    #[serde(flatten)]
    pub action: ActuatorAction,
}

impl ActuatorEvent {
    pub fn new(time: u64, actuator_id: impl Into<String>, action: ActuatorAction) -> Self {
        Self { time, actuator_id: actuator_id.into(), action }
    }

    /// Events between grid points apply from the next hydraulic step.
    pub fn effective_step(&self, grid: &TemporalGrid) -> usize {
        self.time.div_ceil(grid.hydraulic_step()) as usize
    }

    pub fn to_command(&self, grid: &TemporalGrid) -> ActuatorCommand {
        ActuatorCommand::new(self.actuator_id.clone(), self.action).at_step(self.effective_step(grid))
    }

    pub fn validate(&self, network: &NetworkTopology, grid: &TemporalGrid) -> SimResult<()> {
        if self.time >= grid.duration() {
            return Err(SimError::config(format!(
                "actuator event at {}s is past the simulation end",
                self.time
            )));
        }
        check_command(network, &self.actuator_id, &self.action).map_err(SimError::config)
    }
}

/// The actuator must exist with the kind the action addresses, and the value
/// must be in range.
pub fn check_command(network: &NetworkTopology, actuator_id: &str, action: &ActuatorAction) -> Result<(), String> {
    let known = if action.targets_pump() {
        network.has_pump(actuator_id)
    } else {
        network.has_valve(actuator_id)
    };
    if !known {
        return Err(format!("{:?} targets unknown actuator '{}'", action.kind(), actuator_id));
    }
    action.check_value()
}

/// Merges commands so that the last write per `(actuator, kind)` wins.
/// Keys keep the position of their first occurrence.
pub fn merge_commands(commands: impl IntoIterator<Item = ActuatorCommand>) -> Vec<ActuatorCommand> {
    let mut slots: BTreeMap<(String, ActuatorKind), usize> = BTreeMap::new();
    let mut merged: Vec<ActuatorCommand> = Vec::new();
    for cmd in commands {
        match slots.get(&cmd.key()) {
            Some(&i) => merged[i] = cmd,
            None => {
                slots.insert(cmd.key(), merged.len());
                merged.push(cmd);
            }
        }
    }
    merged
}

/// Static scenario information handed to modules when they are attached.
#[derive(Debug, Clone, Copy)]
pub struct ControlContext<'a> {
    pub grid: &'a TemporalGrid,
    pub sensors: &'a SensorConfig,
    pub network: &'a NetworkTopology,
}

/// What a control module may see at step `k`: readings of steps `0..=k`.
pub struct ControlSnapshot<'a> {
    pub step: usize,
    pub time: u64,
    history: &'a RawReadings,
    events: &'a [SensorReadingEvent],
    noise: Option<&'a SensorNoise>,
    grid: Option<&'a TemporalGrid>,
}

impl<'a> ControlSnapshot<'a> {
    pub fn new(
        step: usize,
        time: u64,
        history: &'a RawReadings,
        events: &'a [SensorReadingEvent],
        noise: Option<&'a SensorNoise>,
    ) -> Self {
        Self { step, time, history, events, noise, grid: None }
    }

    /// Marks the history as sampled at every hydraulic step of `grid`, so
    /// positional events count its report samples only.
    pub fn on_grid(mut self, grid: &'a TemporalGrid) -> Self {
        self.grid = Some(grid);
        self
    }

    /// Raw readings at every hydraulic step so far.
    pub fn history(&self) -> &RawReadings {
        self.history
    }

    pub fn raw(&self, sensor_type: &SensorType, sensor_id: &str) -> Option<f64> {
        self.history.last(sensor_type, sensor_id)
    }

    pub fn raw_series(&self, sensor_type: &SensorType, sensor_id: &str) -> Option<&[f64]> {
        self.history.series(sensor_type, sensor_id)
    }

    /// The reading as the SCADA system receives it, with noise and sensor
    /// reading events applied to the prefix seen so far. At report times the
    /// values match the finished run's observed data.
    pub fn observed_series(&self, sensor_type: &SensorType, sensor_id: &str) -> Option<Vec<f64>> {
        let raw = self.history.series(sensor_type, sensor_id)?;
        let sampling = match self.grid {
            Some(grid) => Sampling::Grid(grid),
            None => Sampling::Every,
        };
        Some(observe_series(raw, self.history.times(), sensor_type, sensor_id, self.noise, self.events, sampling))
    }

    pub fn observed(&self, sensor_type: &SensorType, sensor_id: &str) -> Option<f64> {
        self.observed_series(sensor_type, sensor_id)?.last().copied()
    }
}

/// User-supplied control logic. Modules own their configuration and never
/// see each other.
pub trait ControlModule {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn init(&mut self, _ctx: &ControlContext<'_>) -> Result<(), BoxError> {
        Ok(())
    }

    fn step(&mut self, snapshot: &ControlSnapshot<'_>) -> Result<Vec<ActuatorCommand>, BoxError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    Constructed,
    Attached,
    Detached,
}

struct Slot {
    module: Box<dyn ControlModule>,
    state: ModuleState,
}

/// Owns the registered modules and invokes them in registration order.
#[derive(Default)]
pub struct ControlRuntime {
    slots: Vec<Slot>,
    invocations: usize,
    /// Actuators known to the attached scenario.
    network: NetworkTopology,
}

impl fmt::Debug for ControlRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlRuntime")
            .field("modules", &self.slots.iter().map(|s| (s.module.name(), s.state)).collect::<Vec<_>>())
            .field("invocations", &self.invocations)
            .finish()
    }
}

impl ControlRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, module: Box<dyn ControlModule>) {
        log::debug!("registered control module '{}'", module.name());
        self.slots.push(Slot { module, state: ModuleState::Constructed });
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn states(&self) -> Vec<ModuleState> {
        self.slots.iter().map(|s| s.state).collect()
    }

    /// Number of `step` calls per module since the last attach.
    pub fn invocations(&self) -> usize {
        self.invocations
    }

    pub fn attach(&mut self, ctx: &ControlContext<'_>) -> SimResult<()> {
        self.invocations = 0;
        self.network = ctx.network.clone();
        for slot in &mut self.slots {
            slot.module.init(ctx).map_err(|e| SimError::ControlModule {
                module: slot.module.name().to_string(),
                step: 0,
                message: e.to_string(),
            })?;
            slot.state = ModuleState::Attached;
        }
        Ok(())
    }

    pub fn detach(&mut self) {
        for slot in &mut self.slots {
            if slot.state == ModuleState::Attached {
                slot.state = ModuleState::Detached;
            }
        }
    }

    /// Runs every attached module once. Commands are stamped to take effect
    /// no earlier than the following step and merged last-write-wins. A
    /// command for an unknown actuator or with an out-of-range value fails
    /// the module that issued it.
    pub fn step_all(&mut self, snapshot: &ControlSnapshot<'_>) -> SimResult<Vec<ActuatorCommand>> {
        let next = snapshot.step + 1;
        let mut commands = Vec::new();
        for slot in self.slots.iter_mut().filter(|s| s.state == ModuleState::Attached) {
            let name = slot.module.name().to_string();
            let module_error =
                |message: String| SimError::ControlModule { module: name.clone(), step: snapshot.step, message };
            let issued = slot.module.step(snapshot).map_err(|e| module_error(e.to_string()))?;
            for cmd in &issued {
                check_command(&self.network, &cmd.actuator_id, &cmd.action).map_err(&module_error)?;
            }
            commands.extend(issued.into_iter().map(|mut c| {
                c.effective_step = c.effective_step.max(next);
                c
            }));
        }
        self.invocations += 1;
        Ok(merge_commands(commands))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::HOUR;

    struct Fixed(Vec<ActuatorCommand>);

    impl ControlModule for Fixed {
        fn step(&mut self, _s: &ControlSnapshot<'_>) -> Result<Vec<ActuatorCommand>, BoxError> {
            Ok(self.0.clone())
        }
    }

    struct Failing;

    impl ControlModule for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn step(&mut self, _s: &ControlSnapshot<'_>) -> Result<Vec<ActuatorCommand>, BoxError> {
            Err("sensor offline".into())
        }
    }

    fn ctx_parts() -> (TemporalGrid, SensorConfig, NetworkTopology) {
        let grid = TemporalGrid::new(4 * HOUR, HOUR, HOUR, None, 0).unwrap();
        let net = NetworkTopology { pumps: vec!["pu".into()], valves: vec!["v".into()], ..Default::default() };
        (grid, SensorConfig::default(), net)
    }

    #[test]
    fn later_module_wins_per_actuator_kind() {
        let (grid, sensors, network) = ctx_parts();
        let mut rt = ControlRuntime::new();
        rt.add(Box::new(Fixed(vec![
            ActuatorCommand::new("pu", ActuatorAction::PumpState(LinkState::Open)),
            ActuatorCommand::new("v", ActuatorAction::ValveSetting(0.4)),
        ])));
        rt.add(Box::new(Fixed(vec![ActuatorCommand::new("pu", ActuatorAction::PumpState(LinkState::Closed))])));
        rt.attach(&ControlContext { grid: &grid, sensors: &sensors, network: &network }).unwrap();

        let history = RawReadings::default();
        let snap = ControlSnapshot::new(2, 2 * HOUR, &history, &[], None);
        let cmds = rt.step_all(&snap).unwrap();
        assert_eq!(cmds.len(), 2);
        assert_eq!(cmds[0].action, ActuatorAction::PumpState(LinkState::Closed));
        assert!(cmds.iter().all(|c| c.effective_step == 3));
        assert_eq!(rt.invocations(), 1);
    }

    #[test]
    fn distinct_kinds_on_same_actuator_coexist() {
        let merged = merge_commands(vec![
            ActuatorCommand::new("pu", ActuatorAction::PumpSpeed(0.8)),
            ActuatorCommand::new("pu", ActuatorAction::PumpState(LinkState::Open)),
            ActuatorCommand::new("pu", ActuatorAction::PumpSpeed(0.9)),
        ]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].action, ActuatorAction::PumpSpeed(0.9));
    }

    #[test]
    fn module_error_carries_name_and_step() {
        let (grid, sensors, network) = ctx_parts();
        let mut rt = ControlRuntime::new();
        rt.add(Box::new(Failing));
        rt.attach(&ControlContext { grid: &grid, sensors: &sensors, network: &network }).unwrap();
        let history = RawReadings::default();
        let err = rt.step_all(&ControlSnapshot::new(5, 5 * HOUR, &history, &[], None)).unwrap_err();
        assert_eq!(
            err,
            SimError::ControlModule { module: "failing".into(), step: 5, message: "sensor offline".into() }
        );
    }

    #[test]
    fn issued_commands_are_checked_against_network() {
        let (grid, sensors, network) = ctx_parts();
        let cases = [
            (ActuatorCommand::new("pu", ActuatorAction::ValveSetting(0.5)), "unknown actuator 'pu'"),
            (ActuatorCommand::new("ghost", ActuatorAction::PumpSpeed(1.0)), "unknown actuator 'ghost'"),
            (ActuatorCommand::new("v", ActuatorAction::ValveSetting(1.5)), "outside [0, 1]"),
            (ActuatorCommand::new("pu", ActuatorAction::PumpSpeed(-0.2)), "invalid pump speed"),
        ];
        let history = RawReadings::default();
        for (cmd, expected) in cases {
            let mut rt = ControlRuntime::new();
            rt.add(Box::new(Fixed(vec![cmd])));
            rt.attach(&ControlContext { grid: &grid, sensors: &sensors, network: &network }).unwrap();
            match rt.step_all(&ControlSnapshot::new(1, HOUR, &history, &[], None)) {
                Err(SimError::ControlModule { step, message, .. }) => {
                    assert_eq!(step, 1);
                    assert!(message.contains(expected), "{message}");
                }
                other => panic!("expected module error, got {other:?}"),
            }
        }
    }

    #[test]
    fn lifecycle_states() {
        let (grid, sensors, network) = ctx_parts();
        let mut rt = ControlRuntime::new();
        rt.add(Box::new(Fixed(vec![])));
        assert_eq!(rt.states(), vec![ModuleState::Constructed]);
        rt.attach(&ControlContext { grid: &grid, sensors: &sensors, network: &network }).unwrap();
        assert_eq!(rt.states(), vec![ModuleState::Attached]);
        rt.detach();
        assert_eq!(rt.states(), vec![ModuleState::Detached]);
    }

    #[test]
    fn scheduled_event_validation_and_step() {
        let (grid, _, network) = ctx_parts();
        let ev = ActuatorEvent::new(HOUR + 1, "v", ActuatorAction::ValveState(LinkState::Closed));
        assert!(ev.validate(&network, &grid).is_ok());
        assert_eq!(ev.to_command(&grid).effective_step, 2);
        assert!(ActuatorEvent::new(0, "v", ActuatorAction::PumpSpeed(1.0)).validate(&network, &grid).is_err());
        assert!(ActuatorEvent::new(0, "v", ActuatorAction::ValveSetting(1.5)).validate(&network, &grid).is_err());
        assert!(ActuatorEvent::new(4 * HOUR, "pu", ActuatorAction::PumpSpeed(1.0)).validate(&network, &grid).is_err());
    }
}
