//! Scenario simulation control loop.
//!
//! A [`ScenarioSimulator`] owns one solver and one scenario. Events and
//! control modules are registered while the simulator is `Configured`;
//! [`run`](ScenarioSimulator::run) then drives the solver through every
//! hydraulic step exactly once:
//!
//! 1. leak emitters for the step's time are computed,
//! 2. due actuator commands are merged (scheduled events first, then control
//!    commands from the previous step),
//! 3. the solver advances,
//! 4. control modules run on the readings so far and queue commands for the
//!    next step,
//! 5. the step's report sample and event activity are recorded.
//!
//! A step whose solver call or control modules fail leaves no trace in the
//! results.

use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ScenarioConfig;
use crate::controller::{
    merge_commands, ActuatorCommand, ActuatorEvent, ControlContext, ControlModule, ControlRuntime, ControlSnapshot,
};
use crate::error::{SimError, SimResult};
use crate::faults::{EventClass, SensorReadingEvent};
use crate::leakage::{EmitterOverride, LeakSpec};
use crate::readings::RawReadings;
use crate::scada::{EventActivityLog, ScadaData};
use crate::solver::{HydraulicSolver, SolverHandle, SolverSetup};
use crate::time::TemporalGrid;
use crate::uncertainty::{run_rng, SensorNoise, UncertaintySpec};
use crate::validation::validate_step;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimulationState {
    Configured,
    Running,
    Completed,
    /// A solver or control module failed; the solver is already released.
    Failed,
    Closed,
}

/// Summary of one run, enough to replay it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub seed: u64,
    pub hydraulic_steps: usize,
    pub reports: usize,
    pub control_invocations: usize,
    /// blake3 digest of the raw readings.
    pub fingerprint: String,
    pub state: SimulationState,
}

impl RunReport {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Readings accumulated while a run is in progress.
#[derive(Default)]
struct RunBuffers {
    history: RawReadings,
    reports: RawReadings,
    activity: EventActivityLog,
    steps: usize,
}

pub struct ScenarioSimulator<S: HydraulicSolver> {
    config: ScenarioConfig,
    grid: TemporalGrid,
    solver: SolverHandle<S>,
    leakages: Vec<LeakSpec>,
    sensor_events: Vec<SensorReadingEvent>,
    actuator_events: Vec<ActuatorEvent>,
    controls: ControlRuntime,
    uncertainty: Option<UncertaintySpec>,
    sensor_noise: Option<SensorNoise>,
    seed: Option<u64>,
    state: SimulationState,
    retain_partial: bool,
    partial: Option<ScadaData>,
    report: Option<RunReport>,
}

impl<S: HydraulicSolver> ScenarioSimulator<S> {
    /// Validates the scenario and registers every event it declares.
    pub fn new(config: ScenarioConfig, solver: S) -> SimResult<Self> {
        let mut config = config;
        let grid = config.grid()?;
        config.sensors.validate(&config.network)?;

        let leakages = std::mem::take(&mut config.leakages);
        let sensor_events = std::mem::take(&mut config.sensor_reading_events);
        let actuator_events = std::mem::take(&mut config.actuator_events);
        let uncertainty = config.model_uncertainty.take();
        let sensor_noise = config.sensor_noise.take();
        let seed = config.general.seed;

        let mut sim = Self {
            config,
            grid,
            solver: SolverHandle::new(solver),
            leakages: Vec::new(),
            sensor_events: Vec::new(),
            actuator_events: Vec::new(),
            controls: ControlRuntime::new(),
            uncertainty: None,
            sensor_noise: None,
            seed,
            state: SimulationState::Configured,
            retain_partial: false,
            partial: None,
            report: None,
        };
        for leak in leakages {
            sim.add_leakage(leak)?;
        }
        for event in sensor_events {
            sim.add_sensor_reading_event(event)?;
        }
        for event in actuator_events {
            sim.add_actuator_event(event)?;
        }
        if let Some(spec) = uncertainty {
            sim.set_model_uncertainty(spec)?;
        }
        if let Some(noise) = sensor_noise {
            sim.set_sensor_noise(noise)?;
        }
        Ok(sim)
    }

    pub fn state(&self) -> SimulationState {
        self.state
    }

    pub fn config(&self) -> &ScenarioConfig {
        &self.config
    }

    pub fn grid(&self) -> &TemporalGrid {
        &self.grid
    }

    pub fn leakages(&self) -> &[LeakSpec] {
        &self.leakages
    }

    pub fn sensor_reading_events(&self) -> &[SensorReadingEvent] {
        &self.sensor_events
    }

    pub fn actuator_events(&self) -> &[ActuatorEvent] {
        &self.actuator_events
    }

    /// Report of the last finished run, successful or not.
    pub fn report(&self) -> Option<&RunReport> {
        self.report.as_ref()
    }

    fn ensure_configured(&self, what: &str) -> SimResult<()> {
        if self.state != SimulationState::Configured {
            return Err(SimError::state(format!("cannot {what} in state {:?}", self.state)));
        }
        Ok(())
    }

    pub fn add_leakage(&mut self, leak: LeakSpec) -> SimResult<()> {
        self.ensure_configured("add a leakage")?;
        leak.validate(&self.config.network, &self.grid)?;
        log::debug!("registered leak at '{}'", leak.location_id());
        self.leakages.push(leak);
        Ok(())
    }

    pub fn add_sensor_reading_event(&mut self, event: SensorReadingEvent) -> SimResult<()> {
        self.ensure_configured("add a sensor reading event")?;
        event.validate(&self.config.sensors, &self.grid)?;
        log::debug!(
            "registered {} on {} sensor '{}'",
            event.kind.name(),
            event.sensor_type,
            event.sensor_id
        );
        self.sensor_events.push(event);
        Ok(())
    }

    pub fn add_sensor_fault(&mut self, event: SensorReadingEvent) -> SimResult<()> {
        if event.kind.class() != EventClass::Fault {
            return Err(SimError::config(format!("{} is not a sensor fault", event.kind.name())));
        }
        self.add_sensor_reading_event(event)
    }

    pub fn add_sensor_reading_attack(&mut self, event: SensorReadingEvent) -> SimResult<()> {
        if event.kind.class() != EventClass::Attack {
            return Err(SimError::config(format!("{} is not a sensor reading attack", event.kind.name())));
        }
        self.add_sensor_reading_event(event)
    }

    pub fn add_actuator_event(&mut self, event: ActuatorEvent) -> SimResult<()> {
        self.ensure_configured("add an actuator event")?;
        event.validate(&self.config.network, &self.grid)?;
        log::debug!("scheduled {:?} on '{}' at {}s", event.action, event.actuator_id, event.time);
        self.actuator_events.push(event);
        Ok(())
    }

    pub fn add_control(&mut self, module: Box<dyn ControlModule>) -> SimResult<()> {
        self.ensure_configured("add a control module")?;
        self.controls.add(module);
        Ok(())
    }

    pub fn set_model_uncertainty(&mut self, spec: UncertaintySpec) -> SimResult<()> {
        self.ensure_configured("set model uncertainty")?;
        spec.validate()?;
        self.uncertainty = Some(spec);
        Ok(())
    }

    pub fn set_sensor_noise(&mut self, noise: SensorNoise) -> SimResult<()> {
        self.ensure_configured("set sensor noise")?;
        noise.uncertainty.validate()?;
        self.sensor_noise = Some(noise);
        Ok(())
    }

    pub fn set_seed(&mut self, seed: u64) -> SimResult<()> {
        self.ensure_configured("set the seed")?;
        self.seed = Some(seed);
        Ok(())
    }

    /// Hydraulic times at which at least one registered leak or sensor
    /// reading event is active. Known before the run; a completed run logs
    /// exactly these times.
    pub fn get_events_active_time_points(&self) -> Vec<u64> {
        self.grid
            .hydraulic_times()
            .into_iter()
            .filter(|&t| event_active_at(&self.leakages, &self.sensor_events, t))
            .collect()
    }

    /// Keep the readings of every step before a fatal error so they can be
    /// fetched with [`take_partial_results`](Self::take_partial_results).
    /// The failing step itself is never included.
    pub fn retain_partial_results(&mut self, retain: bool) {
        self.retain_partial = retain;
    }

    pub fn take_partial_results(&mut self) -> Option<ScadaData> {
        self.partial.take()
    }

    /// Runs the whole scenario. Only valid once, from `Configured`.
    pub fn run(&mut self) -> SimResult<ScadaData> {
        self.ensure_configured("run")?;
        self.state = SimulationState::Running;
        let run_id = Uuid::new_v4();
        let (mut rng, seed) = run_rng(self.seed);
        log::info!(
            "run {run_id}: {} hydraulic steps, {} reports, seed {seed}",
            self.grid.num_hydraulic_steps(),
            self.grid.num_reports()
        );

        let mut buffers = RunBuffers {
            history: RawReadings::new(&self.config.sensors),
            reports: RawReadings::new(&self.config.sensors),
            ..RunBuffers::default()
        };
        let outcome = self.execute(&mut rng, &mut buffers);
        self.controls.detach();
        self.solver.release();

        let state = match outcome {
            Ok(()) => SimulationState::Completed,
            Err(_) => SimulationState::Failed,
        };
        self.state = state;
        self.report = Some(RunReport {
            run_id,
            seed,
            hydraulic_steps: buffers.steps,
            reports: buffers.reports.len(),
            control_invocations: self.controls.invocations(),
            fingerprint: buffers.reports.fingerprint(),
            state,
        });

        match outcome {
            Ok(()) => {
                let data = self.assemble(buffers.reports, buffers.activity)?;
                log::info!("run {run_id}: completed, fingerprint {}", data.fingerprint());
                Ok(data)
            }
            Err(err) => {
                log::error!("run {run_id}: {err}");
                if self.retain_partial {
                    self.partial = Some(self.assemble_partial(buffers.reports, buffers.activity));
                }
                Err(err)
            }
        }
    }

    fn execute(&mut self, rng: &mut ChaCha8Rng, buffers: &mut RunBuffers) -> SimResult<()> {
        let grid = &self.grid;
        let solver = self.solver.get_mut()?;

        let nominal = solver.model_parameters();
        let parameters = match &self.uncertainty {
            Some(spec) => spec.apply(&nominal, rng),
            None => nominal,
        };
        let setup = SolverSetup {
            grid: grid.clone(),
            sensors: self.config.sensors.clone(),
            parameters,
            flow_units: self.config.general.flow_units,
        };
        solver
            .configure(&setup)
            .map_err(|f| SimError::Solver { step: 0, time: 0, message: f.to_string() })?;

        self.controls.attach(&ControlContext {
            grid,
            sensors: &self.config.sensors,
            network: &self.config.network,
        })?;

        let scheduled: Vec<ActuatorCommand> = self.actuator_events.iter().map(|e| e.to_command(grid)).collect();
        let mut pending: Vec<ActuatorCommand> = Vec::new();

        for k in 0..grid.num_hydraulic_steps() {
            let t = grid.hydraulic_time(k);
            let solver_error = |message: String| SimError::Solver { step: k, time: t, message };

            let emitters: Vec<EmitterOverride> = self.leakages.iter().filter_map(|l| l.emitter_at(t)).collect();

            let (due, later): (Vec<_>, Vec<_>) = pending.drain(..).partition(|c| c.effective_step <= k);
            pending = later;
            let actuators = merge_commands(
                scheduled.iter().filter(|c| c.effective_step == k).cloned().chain(due),
            );

            let result = solver.step(&actuators, &emitters).map_err(|f| solver_error(f.to_string()))?;
            validate_step(&result).map_err(|f| solver_error(f.to_string()))?;
            if result.time != t {
                return Err(solver_error(format!("solver reported t={}s", result.time)));
            }
            buffers.history.push(&result).map_err(|f| solver_error(f.to_string()))?;

            let snapshot =
                ControlSnapshot::new(k, t, &buffers.history, &self.sensor_events, self.sensor_noise.as_ref())
                    .on_grid(grid);
            let commands = self.controls.step_all(&snapshot)?;

            // the step counts as successful only once every module accepted it
            if grid.is_report_time(t) {
                buffers.reports.push(&result).map_err(|f| solver_error(f.to_string()))?;
            }
            if event_active_at(&self.leakages, &self.sensor_events, t) {
                buffers.activity.record(t);
            }
            buffers.steps = k + 1;

            if !commands.is_empty() {
                log::debug!("step {k}: {} actuator command(s) queued", commands.len());
            }
            pending.extend(commands);
        }
        Ok(())
    }

    fn assemble(&self, reports: RawReadings, activity: EventActivityLog) -> SimResult<ScadaData> {
        let mut data = ScadaData::new(reports).with_activity_log(activity);
        data.set_sensor_noise(self.sensor_noise)?;
        data.set_sensor_reading_events(self.sensor_events.clone())?;
        Ok(data)
    }

    /// Like `assemble`, but drops events that do not fit the truncated data.
    fn assemble_partial(&self, reports: RawReadings, activity: EventActivityLog) -> ScadaData {
        let mut data = ScadaData::new(reports).with_activity_log(activity);
        if data.set_sensor_noise(self.sensor_noise).is_err() {
            log::debug!("partial results: sensor noise dropped");
        }
        for event in &self.sensor_events {
            if data.add_sensor_reading_event(event.clone()).is_err() {
                log::debug!("partial results: {} on '{}' dropped", event.kind.name(), event.sensor_id);
            }
        }
        data
    }

    /// Releases the solver and detaches control modules. Closing twice is a
    /// no-op; nothing but partial-result retrieval works afterwards.
    pub fn close(&mut self) {
        if self.state == SimulationState::Closed {
            return;
        }
        self.solver.release();
        self.controls.detach();
        self.state = SimulationState::Closed;
        log::debug!("simulator closed");
    }
}

fn event_active_at(leakages: &[LeakSpec], events: &[SensorReadingEvent], t: u64) -> bool {
    leakages.iter().any(|l| l.window().contains(t)) || events.iter().any(|e| e.window.contains(t))
}
