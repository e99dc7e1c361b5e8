//! A small deterministic reference solver.
//!
//! The network is a tree fed by a single fixed-head source. Each step
//! propagates demand up the tree to get link flows, then head down the tree
//! using Hazen-Williams friction plus a fixed per-hop loss. Pumps add head,
//! valves throttle, tanks hold their own head and fill or drain towards the
//! head delivered at their inlet. Leaks are orifices driven by the previous
//! step's pressure. Water quality is a first-order decay over water age.

use std::collections::BTreeMap;
use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use crate::config::{FlowUnits, NetworkTopology};
use crate::controller::{ActuatorAction, ActuatorCommand, LinkState};
use crate::error::{SimError, SimResult};
use crate::leakage::EmitterOverride;
use crate::sensor::{ElementKind, SensorConfig, SensorType};
use crate::solver::{HydraulicSolver, ModelParameters, RawStepResult, SolverFault, SolverSetup};

// =============================================================================
// Constants
// =============================================================================

pub const GRAVITY: f64 = 9.81;

/// Discharge coefficient of a leak orifice.
pub const LEAK_DISCHARGE_COEFFICIENT: f64 = 0.75;

/// Head lost at every junction on the way from the source, in meters.
pub const PRESSURE_DROP_PER_HOP: f64 = 0.2;

/// Tank inflow per meter of head difference at the inlet, in m³/s.
pub const TANK_FILL_GAIN: f64 = 0.002;

/// A throttled valve never restricts below this opening.
pub const MIN_VALVE_OPENING: f64 = 0.05;

/// Water age reported for stagnant or disconnected parts of the network.
pub const MAX_WATER_AGE_SECS: f64 = 72.0 * 3_600.0;

const DEFAULT_ROUGHNESS: f64 = 130.0;

/// Hazen-Williams head loss in meters for flow `q` (m³/s).
pub fn hazen_williams_loss(q: f64, length: f64, diameter: f64, roughness: f64) -> f64 {
    10.67 * length * q.abs().powf(1.852) / (roughness.powf(1.852) * diameter.powf(4.87))
}

/// Orifice outflow `Cd · a · √(2 g p)` in m³/s for pressure head `p` in meters.
pub fn orifice_outflow(area: f64, pressure: f64) -> f64 {
    LEAK_DISCHARGE_COEFFICIENT * area * (2.0 * GRAVITY * pressure.max(0.0)).sqrt()
}

// =============================================================================
// Network description
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TankGeometry {
    /// Cross-section in m².
    pub area: f64,
    pub initial_level: f64,
    pub max_level: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurrogateNode {
    pub id: String,
    pub elevation: f64,
    /// m³/s before the demand pattern multiplier.
    pub base_demand: f64,
    pub pattern: Option<String>,
    pub tank: Option<TankGeometry>,
}

impl SurrogateNode {
    pub fn junction(id: impl Into<String>, elevation: f64, base_demand: f64) -> Self {
        Self { id: id.into(), elevation, base_demand, pattern: None, tank: None }
    }

    pub fn tank(id: impl Into<String>, elevation: f64, geometry: TankGeometry) -> Self {
        Self { id: id.into(), elevation, base_demand: 0.0, pattern: None, tank: Some(geometry) }
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LinkRole {
    Pipe,
    /// Head added at nominal speed; scales with speed squared.
    Pump { boost_head: f64 },
    Valve,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurrogateLink {
    pub id: String,
    /// Upstream node, `None` for the source.
    pub from: Option<String>,
    pub to: String,
    pub length: f64,
    pub diameter: f64,
    pub roughness: f64,
    pub role: LinkRole,
}

impl SurrogateLink {
    pub fn pipe(id: impl Into<String>, from: Option<&str>, to: impl Into<String>, length: f64, diameter: f64) -> Self {
        Self {
            id: id.into(),
            from: from.map(str::to_string),
            to: to.into(),
            length,
            diameter,
            roughness: DEFAULT_ROUGHNESS,
            role: LinkRole::Pipe,
        }
    }

    pub fn pump(id: impl Into<String>, from: Option<&str>, to: impl Into<String>, boost_head: f64) -> Self {
        Self { role: LinkRole::Pump { boost_head }, ..Self::pipe(id, from, to, 1.0, 0.5) }
    }

    pub fn valve(id: impl Into<String>, from: Option<&str>, to: impl Into<String>, diameter: f64) -> Self {
        Self { role: LinkRole::Valve, ..Self::pipe(id, from, to, 1.0, diameter) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpeciesDecay {
    pub source_concentration: f64,
    /// First-order decay rate per hour.
    pub decay_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurrogateNetwork {
    pub source_head: f64,
    /// Disinfectant concentration leaving the source (mg/L).
    pub source_quality: f64,
    /// Disinfectant decay rate per hour.
    pub quality_decay: f64,
    pub nodes: Vec<SurrogateNode>,
    pub links: Vec<SurrogateLink>,
    pub patterns: BTreeMap<String, Vec<f64>>,
    /// Seconds each pattern multiplier lasts.
    pub pattern_step: u64,
    pub bulk_species: BTreeMap<String, SpeciesDecay>,
    pub surface_species: Vec<String>,
}

impl SurrogateNetwork {
    pub fn new(source_head: f64) -> Self {
        Self {
            source_head,
            source_quality: 1.0,
            quality_decay: 0.1,
            nodes: Vec::new(),
            links: Vec::new(),
            patterns: BTreeMap::new(),
            pattern_step: 3_600,
            bulk_species: BTreeMap::new(),
            surface_species: Vec::new(),
        }
    }

    pub fn with_node(mut self, node: SurrogateNode) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_link(mut self, link: SurrogateLink) -> Self {
        self.links.push(link);
        self
    }

    pub fn with_pattern(mut self, id: impl Into<String>, multipliers: Vec<f64>) -> Self {
        self.patterns.insert(id.into(), multipliers);
        self
    }

    pub fn topology(&self) -> NetworkTopology {
        let mut t = NetworkTopology::default();
        for n in &self.nodes {
            if n.tank.is_some() {
                t.tanks.push(n.id.clone());
            } else {
                t.nodes.push(n.id.clone());
            }
        }
        for l in &self.links {
            match l.role {
                LinkRole::Pipe => t.links.push(l.id.clone()),
                LinkRole::Pump { .. } => t.pumps.push(l.id.clone()),
                LinkRole::Valve => t.valves.push(l.id.clone()),
            }
        }
        t.bulk_species = self.bulk_species.keys().cloned().collect();
        t.surface_species = self.surface_species.clone();
        t
    }
}

// =============================================================================
// Solver
// =============================================================================

#[derive(Debug, Clone)]
struct ActuatorState {
    open: bool,
    /// Pump speed or valve opening.
    setting: f64,
}

impl Default for ActuatorState {
    fn default() -> Self {
        Self { open: true, setting: 1.0 }
    }
}

/// Per-node hydraulic state of one step.
#[derive(Debug, Clone, Default)]
struct Hydraulics {
    supplied: Vec<bool>,
    outflow: Vec<f64>,
    flow: Vec<f64>,
    head: Vec<f64>,
    inlet_head: Vec<f64>,
    age: Vec<f64>,
}

#[derive(Debug)]
pub struct SurrogateSolver {
    network: SurrogateNetwork,
    node_index: BTreeMap<String, usize>,
    link_index: BTreeMap<String, usize>,
    /// Links sorted so every link comes after the link feeding its `from`.
    order: Vec<usize>,
    children: Vec<Vec<usize>>,
    from_node: Vec<Option<usize>>,
    to_node: Vec<usize>,

    active: SurrogateNetwork,
    flow_units: FlowUnits,
    sensors: SensorConfig,
    hydraulic_step: u64,
    num_steps: usize,
    step: usize,
    actuators: Vec<ActuatorState>,
    tank_level: Vec<f64>,
    last_pressure: Vec<f64>,
    last_inlet_head: Vec<f64>,
    closed: bool,
}

impl SurrogateSolver {
    pub fn new(network: SurrogateNetwork) -> SimResult<Self> {
        let mut node_index = BTreeMap::new();
        for (i, n) in network.nodes.iter().enumerate() {
            if node_index.insert(n.id.clone(), i).is_some() {
                return Err(SimError::config(format!("duplicate node '{}'", n.id)));
            }
        }
        let mut link_index = BTreeMap::new();
        let mut from_node = Vec::with_capacity(network.links.len());
        let mut to_node = Vec::with_capacity(network.links.len());
        let mut inlet: Vec<Option<usize>> = vec![None; network.nodes.len()];
        let mut children = vec![Vec::new(); network.nodes.len()];
        for (l, link) in network.links.iter().enumerate() {
            if link_index.insert(link.id.clone(), l).is_some() {
                return Err(SimError::config(format!("duplicate link '{}'", link.id)));
            }
            let to = *node_index
                .get(&link.to)
                .ok_or_else(|| SimError::config(format!("link '{}' ends at unknown node '{}'", link.id, link.to)))?;
            let from = match &link.from {
                Some(f) => Some(*node_index.get(f).ok_or_else(|| {
                    SimError::config(format!("link '{}' starts at unknown node '{f}'", link.id))
                })?),
                None => None,
            };
            if inlet[to].replace(l).is_some() {
                return Err(SimError::config(format!("node '{}' is fed by more than one link", link.to)));
            }
            if let Some(f) = from {
                children[f].push(l);
            }
            if link.length <= 0.0 || link.diameter <= 0.0 || link.roughness <= 0.0 {
                return Err(SimError::config(format!("link '{}' has non-positive geometry", link.id)));
            }
            from_node.push(from);
            to_node.push(to);
        }

        let mut order = Vec::with_capacity(network.links.len());
        let mut frontier: Vec<usize> = (0..network.links.len()).filter(|&l| from_node[l].is_none()).collect();
        while let Some(l) = frontier.pop() {
            order.push(l);
            frontier.extend(children[to_node[l]].iter().rev());
        }
        if let Some(n) = inlet.iter().position(Option::is_none) {
            return Err(SimError::config(format!("node '{}' is not fed by any link", network.nodes[n].id)));
        }
        if order.len() != network.links.len() {
            return Err(SimError::config("network contains a loop not connected to the source"));
        }

        let n_nodes = network.nodes.len();
        let n_links = network.links.len();
        Ok(Self {
            active: network.clone(),
            network,
            node_index,
            link_index,
            order,
            children,
            from_node,
            to_node,
            flow_units: FlowUnits::default(),
            sensors: SensorConfig::default(),
            hydraulic_step: 1,
            num_steps: 0,
            step: 0,
            actuators: vec![ActuatorState::default(); n_links],
            tank_level: vec![0.0; n_nodes],
            last_pressure: vec![0.0; n_nodes],
            last_inlet_head: vec![0.0; n_nodes],
            closed: false,
        })
    }

    pub fn network(&self) -> &SurrogateNetwork {
        &self.network
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn apply_parameters(&mut self, p: &ModelParameters) {
        self.active = self.network.clone();
        for n in &mut self.active.nodes {
            if let Some(&d) = p.base_demands.get(&n.id) {
                n.base_demand = d;
            }
            if let Some(&e) = p.node_elevations.get(&n.id) {
                n.elevation = e;
            }
        }
        for l in &mut self.active.links {
            if let Some(&v) = p.pipe_lengths.get(&l.id) {
                l.length = v.max(f64::EPSILON);
            }
            if let Some(&v) = p.pipe_diameters.get(&l.id) {
                l.diameter = v.max(f64::EPSILON);
            }
            if let Some(&v) = p.pipe_roughness.get(&l.id) {
                l.roughness = v.max(f64::EPSILON);
            }
        }
        for (id, pattern) in &p.demand_patterns {
            self.active.patterns.insert(id.clone(), pattern.clone());
        }
    }

    fn check_sensors(&self, sensors: &SensorConfig) -> Result<(), SolverFault> {
        for ty in sensors.sensor_types() {
            if let Some(species) = ty.species() {
                let known = match ty {
                    SensorType::SurfaceSpecies(_) => self.network.surface_species.iter().any(|s| s == species),
                    _ => self.network.bulk_species.contains_key(species),
                };
                if !known {
                    return Err(SolverFault::new(format!("species '{species}' is not modelled")));
                }
            }
            let on_nodes = matches!(ty.element_kind(), ElementKind::Node | ElementKind::Tank);
            for id in sensors.sensors(&ty) {
                let found = if on_nodes { self.node_index.contains_key(id) } else { self.link_index.contains_key(id) };
                if !found {
                    return Err(SolverFault::new(format!("{ty} sensor at unknown element '{id}'")));
                }
            }
        }
        Ok(())
    }

    fn apply_actuators(&mut self, commands: &[ActuatorCommand]) -> Result<(), SolverFault> {
        for cmd in commands {
            let l = *self
                .link_index
                .get(&cmd.actuator_id)
                .ok_or_else(|| SolverFault::new(format!("unknown actuator '{}'", cmd.actuator_id)))?;
            let is_pump = matches!(self.active.links[l].role, LinkRole::Pump { .. });
            let is_valve = matches!(self.active.links[l].role, LinkRole::Valve);
            let state = &mut self.actuators[l];
            match cmd.action {
                ActuatorAction::PumpState(s) if is_pump => state.open = s == LinkState::Open,
                ActuatorAction::PumpSpeed(v) if is_pump => state.setting = v.max(0.0),
                ActuatorAction::ValveState(s) if is_valve => state.open = s == LinkState::Open,
                ActuatorAction::ValveSetting(v) if is_valve => state.setting = v.clamp(0.0, 1.0),
                _ => {
                    return Err(SolverFault::new(format!(
                        "{:?} cannot be applied to '{}'",
                        cmd.action.kind(),
                        cmd.actuator_id
                    )))
                }
            }
        }
        Ok(())
    }

    fn link_open(&self, l: usize) -> bool {
        let a = &self.actuators[l];
        match self.active.links[l].role {
            LinkRole::Pipe => true,
            LinkRole::Pump { .. } | LinkRole::Valve => a.open && a.setting > 0.0,
        }
    }

    fn pattern_multiplier(&self, node: &SurrogateNode, t: u64) -> f64 {
        let pattern = node.pattern.as_ref().and_then(|p| self.active.patterns.get(p));
        match pattern {
            Some(m) if !m.is_empty() => {
                let step = self.active.pattern_step.max(1);
                m[((t / step) as usize) % m.len()]
            }
            _ => 1.0,
        }
    }

    fn solve(&self, t: u64, leak_area: &[f64]) -> Hydraulics {
        let n_nodes = self.active.nodes.len();
        let n_links = self.active.links.len();
        let dt = self.hydraulic_step as f64;
        let mut h = Hydraulics {
            supplied: vec![false; n_nodes],
            outflow: vec![0.0; n_nodes],
            flow: vec![0.0; n_links],
            head: vec![0.0; n_nodes],
            inlet_head: vec![0.0; n_nodes],
            age: vec![MAX_WATER_AGE_SECS; n_nodes],
        };

        for &l in &self.order {
            let upstream = self.from_node[l].map_or(true, |f| h.supplied[f]);
            h.supplied[self.to_node[l]] = upstream && self.link_open(l);
        }

        for (i, node) in self.active.nodes.iter().enumerate() {
            if !h.supplied[i] {
                continue;
            }
            let leak = orifice_outflow(leak_area[i], self.last_pressure[i]);
            let consumption = match &node.tank {
                Some(tank) => {
                    let level = self.tank_level[i];
                    let fill = TANK_FILL_GAIN * (self.last_inlet_head[i] - (node.elevation + level));
                    let max_fill = (tank.max_level - level) * tank.area / dt;
                    let max_drain = level * tank.area / dt;
                    fill.clamp(-max_drain, max_fill)
                }
                None => node.base_demand * self.pattern_multiplier(node, t),
            };
            h.outflow[i] = consumption + leak;
        }

        for &l in self.order.iter().rev() {
            let to = self.to_node[l];
            if h.supplied[to] {
                let downstream: f64 = self.children[to].iter().map(|&c| h.flow[c]).sum();
                h.flow[l] = h.outflow[to] + downstream;
            }
        }

        for &l in &self.order {
            let link = &self.active.links[l];
            let to = self.to_node[l];
            let node = &self.active.nodes[to];
            let (up_head, up_age) = match self.from_node[l] {
                Some(f) => (h.head[f], h.age[f]),
                None => (self.active.source_head, 0.0),
            };
            if !h.supplied[to] {
                h.head[to] = node.elevation;
                h.inlet_head[to] = node.elevation;
                continue;
            }
            let q = h.flow[l];
            let a = &self.actuators[l];
            let mut loss = hazen_williams_loss(q, link.length, link.diameter, link.roughness) + PRESSURE_DROP_PER_HOP;
            let mut boost = 0.0;
            match link.role {
                LinkRole::Pipe => {}
                LinkRole::Pump { boost_head } => boost = boost_head * a.setting * a.setting,
                LinkRole::Valve => {
                    let opening = a.setting.max(MIN_VALVE_OPENING);
                    loss /= opening * opening;
                }
            }
            let inlet = up_head + boost - loss;
            h.inlet_head[to] = inlet;
            h.head[to] = match &node.tank {
                Some(_) => node.elevation + self.tank_level[to],
                None => inlet.max(node.elevation),
            };
            let section = PI * link.diameter * link.diameter / 4.0;
            let velocity = q.abs() / section;
            h.age[to] = if velocity > 1e-9 {
                (up_age + link.length / velocity).min(MAX_WATER_AGE_SECS)
            } else {
                MAX_WATER_AGE_SECS
            };
        }
        h
    }

    fn decay(concentration: f64, rate_per_hour: f64, age: f64) -> f64 {
        concentration * (-rate_per_hour * age / 3_600.0).exp()
    }

    fn read(&self, ty: &SensorType, id: &str, h: &Hydraulics) -> Option<f64> {
        let units = self.flow_units.per_cubic_meter_per_second();
        let node = self.node_index.get(id).copied();
        let link = self.link_index.get(id).copied();
        let value = match ty {
            SensorType::Pressure => {
                let n = node?;
                match &self.active.nodes[n].tank {
                    Some(_) => self.tank_level[n],
                    None => h.head[n] - self.active.nodes[n].elevation,
                }
            }
            SensorType::Demand => h.outflow[node?] * units,
            SensorType::NodeQuality => Self::decay(self.active.source_quality, self.active.quality_decay, h.age[node?]),
            SensorType::TankVolume => {
                let n = node?;
                self.active.nodes[n].tank.as_ref()?.area * self.tank_level[n]
            }
            SensorType::Flow => h.flow[link?] * units,
            SensorType::LinkQuality => {
                let l = link?;
                let age = self.from_node[l].map_or(0.0, |f| h.age[f]);
                Self::decay(self.active.source_quality, self.active.quality_decay, age)
            }
            SensorType::PumpState | SensorType::ValveState => {
                let l = link?;
                if self.link_open(l) {
                    LinkState::Open.as_reading()
                } else {
                    LinkState::Closed.as_reading()
                }
            }
            SensorType::BulkSpeciesNode(s) => {
                let sp = self.active.bulk_species.get(s)?;
                Self::decay(sp.source_concentration, sp.decay_rate, h.age[node?])
            }
            SensorType::BulkSpeciesLink(s) => {
                let sp = self.active.bulk_species.get(s)?;
                let l = link?;
                let age = self.from_node[l].map_or(0.0, |f| h.age[f]);
                Self::decay(sp.source_concentration, sp.decay_rate, age)
            }
            SensorType::SurfaceSpecies(_) => {
                link?;
                0.0
            }
        };
        Some(value)
    }
}

impl HydraulicSolver for SurrogateSolver {
    fn model_parameters(&self) -> ModelParameters {
        let mut p = ModelParameters::default();
        for n in self.network.nodes.iter().filter(|n| n.tank.is_none()) {
            p.base_demands.insert(n.id.clone(), n.base_demand);
        }
        for n in &self.network.nodes {
            p.node_elevations.insert(n.id.clone(), n.elevation);
        }
        for l in self.network.links.iter().filter(|l| l.role == LinkRole::Pipe) {
            p.pipe_lengths.insert(l.id.clone(), l.length);
            p.pipe_diameters.insert(l.id.clone(), l.diameter);
            p.pipe_roughness.insert(l.id.clone(), l.roughness);
        }
        p.demand_patterns = self.network.patterns.clone();
        p
    }

    fn configure(&mut self, setup: &SolverSetup) -> Result<(), SolverFault> {
        if self.closed {
            return Err(SolverFault::new("solver is closed"));
        }
        self.check_sensors(&setup.sensors)?;
        self.apply_parameters(&setup.parameters);
        self.sensors = setup.sensors.clone();
        self.flow_units = setup.flow_units;
        self.hydraulic_step = setup.grid.hydraulic_step();
        self.num_steps = setup.grid.num_hydraulic_steps();
        self.step = 0;
        self.actuators = vec![ActuatorState::default(); self.active.links.len()];
        let source = self.active.source_head;
        for (i, node) in self.active.nodes.iter().enumerate() {
            self.tank_level[i] = node.tank.as_ref().map_or(0.0, |t| t.initial_level);
            self.last_pressure[i] = (source - node.elevation).max(0.0);
            self.last_inlet_head[i] = source;
        }
        log::debug!(
            "surrogate configured: {} nodes, {} links, {} steps",
            self.active.nodes.len(),
            self.active.links.len(),
            self.num_steps
        );
        Ok(())
    }

    fn step(&mut self, actuators: &[ActuatorCommand], emitters: &[EmitterOverride]) -> Result<RawStepResult, SolverFault> {
        if self.closed {
            return Err(SolverFault::new("solver is closed"));
        }
        if self.step >= self.num_steps {
            return Err(SolverFault::new("stepped past the end of the simulation"));
        }
        self.apply_actuators(actuators)?;
        let mut leak_area = vec![0.0; self.active.nodes.len()];
        for e in emitters {
            let n = *self
                .node_index
                .get(&e.location_id)
                .ok_or_else(|| SolverFault::new(format!("emitter at unknown node '{}'", e.location_id)))?;
            leak_area[n] += e.area;
        }

        let t = self.step as u64 * self.hydraulic_step;
        let h = self.solve(t, &leak_area);

        let mut result = RawStepResult::new(t);
        for ty in self.sensors.sensor_types() {
            for id in self.sensors.sensors(&ty) {
                let v = self
                    .read(&ty, id, &h)
                    .ok_or_else(|| SolverFault::new(format!("cannot compute {ty} at '{id}'")))?;
                result.set(ty.clone(), id.clone(), v);
            }
        }

        let dt = self.hydraulic_step as f64;
        for (i, node) in self.active.nodes.iter().enumerate() {
            if let Some(tank) = &node.tank {
                let consumption = h.outflow[i] - orifice_outflow(leak_area[i], self.last_pressure[i]);
                let level = self.tank_level[i] + consumption * dt / tank.area;
                self.tank_level[i] = level.clamp(0.0, tank.max_level);
            }
            self.last_pressure[i] = if node.tank.is_some() {
                self.tank_level[i]
            } else {
                h.head[i] - node.elevation
            };
            self.last_inlet_head[i] = h.inlet_head[i];
        }
        self.step += 1;
        Ok(result)
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::{TemporalGrid, HOUR};

    /// source -> pump -> J1 -> p1 -> J2 -> v1 -> J3, J1 -> p2 -> T1
    fn network() -> SurrogateNetwork {
        SurrogateNetwork::new(40.0)
            .with_node(SurrogateNode::junction("J1", 5.0, 0.002))
            .with_node(SurrogateNode::junction("J2", 8.0, 0.004).with_pattern("day"))
            .with_node(SurrogateNode::junction("J3", 10.0, 0.001))
            .with_node(SurrogateNode::tank("T1", 20.0, TankGeometry { area: 50.0, initial_level: 3.0, max_level: 6.0 }))
            .with_link(SurrogateLink::pump("pu", None, "J1", 15.0))
            .with_link(SurrogateLink::pipe("p1", Some("J1"), "J2", 400.0, 0.2))
            .with_link(SurrogateLink::valve("v1", Some("J2"), "J3", 0.15))
            .with_link(SurrogateLink::pipe("p2", Some("J1"), "T1", 200.0, 0.15))
            .with_pattern("day", vec![0.5, 1.0, 1.5])
    }

    fn setup(sensors: SensorConfig, solver: &SurrogateSolver) -> SolverSetup {
        SolverSetup {
            grid: TemporalGrid::new(6 * HOUR, HOUR, HOUR, None, 0).unwrap(),
            sensors,
            parameters: solver.model_parameters(),
            flow_units: FlowUnits::Lps,
        }
    }

    fn sensors() -> SensorConfig {
        let mut s = SensorConfig::default();
        s.set_sensors(SensorType::Pressure, vec!["J1".into(), "J2".into(), "J3".into()]);
        s.set_sensors(SensorType::Flow, vec!["pu".into(), "p1".into(), "v1".into()]);
        s.set_sensors(SensorType::ValveState, vec!["v1".into()]);
        s.set_sensors(SensorType::TankVolume, vec!["T1".into()]);
        s
    }

    #[test]
    fn rejects_malformed_trees() {
        let two_inlets = network().with_link(SurrogateLink::pipe("p9", Some("J1"), "J3", 10.0, 0.1));
        assert!(SurrogateSolver::new(two_inlets).is_err());
        let dangling = network().with_node(SurrogateNode::junction("J9", 0.0, 0.0));
        assert!(SurrogateSolver::new(dangling).is_err());
        let cycle = SurrogateNetwork::new(10.0)
            .with_node(SurrogateNode::junction("A", 0.0, 0.0))
            .with_node(SurrogateNode::junction("B", 0.0, 0.0))
            .with_link(SurrogateLink::pipe("ab", Some("A"), "B", 1.0, 0.1))
            .with_link(SurrogateLink::pipe("ba", Some("B"), "A", 1.0, 0.1));
        assert!(SurrogateSolver::new(cycle).is_err());
    }

    #[test]
    fn topology_sorts_element_families() {
        let t = network().topology();
        assert_eq!(t.nodes, ["J1", "J2", "J3"]);
        assert_eq!(t.tanks, ["T1"]);
        assert_eq!(t.pumps, ["pu"]);
        assert_eq!(t.valves, ["v1"]);
        assert_eq!(t.links, ["p1", "p2"]);
    }

    #[test]
    fn mass_balance_and_pressure_gradient() {
        let mut s = SurrogateSolver::new(network()).unwrap();
        s.configure(&setup(sensors(), &s)).unwrap();
        let r = s.step(&[], &[]).unwrap();
        let f = |id| r.get(&SensorType::Flow, id).unwrap();
        let p = |id| r.get(&SensorType::Pressure, id).unwrap();
        // J2 at pattern 0.5: 2 L/s, J3: 1 L/s
        assert!((f("v1") - 1.0).abs() < 1e-9);
        assert!((f("p1") - 3.0).abs() < 1e-9);
        assert!(f("pu") > f("p1"));
        assert!(p("J1") > p("J2"));
        assert_eq!(r.get(&SensorType::ValveState, "v1"), Some(1.0));
    }

    #[test]
    fn closed_valve_cuts_off_downstream() {
        let mut s = SurrogateSolver::new(network()).unwrap();
        s.configure(&setup(sensors(), &s)).unwrap();
        let close = ActuatorCommand::new("v1", ActuatorAction::ValveState(LinkState::Closed));
        let r = s.step(&[close], &[]).unwrap();
        assert_eq!(r.get(&SensorType::Flow, "v1"), Some(0.0));
        assert_eq!(r.get(&SensorType::Pressure, "J3"), Some(0.0));
        assert_eq!(r.get(&SensorType::ValveState, "v1"), Some(0.0));
        let bad = ActuatorCommand::new("p1", ActuatorAction::PumpSpeed(1.0));
        assert!(s.step(&[bad], &[]).is_err());
    }

    #[test]
    fn leak_increases_upstream_flow() {
        let mut a = SurrogateSolver::new(network()).unwrap();
        let mut b = SurrogateSolver::new(network()).unwrap();
        a.configure(&setup(sensors(), &a)).unwrap();
        b.configure(&setup(sensors(), &b)).unwrap();
        let leak = EmitterOverride { location_id: "J2".into(), area: 0.0005 };
        let ra = a.step(&[], &[]).unwrap();
        let rb = b.step(&[], &[leak]).unwrap();
        assert!(rb.get(&SensorType::Flow, "p1").unwrap() > ra.get(&SensorType::Flow, "p1").unwrap());
        assert!(rb.get(&SensorType::Pressure, "J2").unwrap() < ra.get(&SensorType::Pressure, "J2").unwrap());
    }

    #[test]
    fn tank_fills_and_runs_fixed_number_of_steps() {
        let mut s = SurrogateSolver::new(network()).unwrap();
        s.configure(&setup(sensors(), &s)).unwrap();
        let v0 = s.step(&[], &[]).unwrap().get(&SensorType::TankVolume, "T1").unwrap();
        assert_eq!(v0, 150.0);
        let mut last = v0;
        for _ in 1..6 {
            last = s.step(&[], &[]).unwrap().get(&SensorType::TankVolume, "T1").unwrap();
        }
        assert!(last != v0);
        assert!(s.step(&[], &[]).is_err());
    }

    #[test]
    fn perturbed_parameters_change_results() {
        let mut a = SurrogateSolver::new(network()).unwrap();
        let mut b = SurrogateSolver::new(network()).unwrap();
        a.configure(&setup(sensors(), &a)).unwrap();
        let mut su = setup(sensors(), &b);
        su.parameters.base_demands.insert("J3".into(), 0.003);
        b.configure(&su).unwrap();
        let ra = a.step(&[], &[]).unwrap();
        let rb = b.step(&[], &[]).unwrap();
        assert!((rb.get(&SensorType::Flow, "v1").unwrap() - 3.0).abs() < 1e-9);
        assert_ne!(ra, rb);
    }

    #[test]
    fn unknown_sensor_fails_configure() {
        let mut s = SurrogateSolver::new(network()).unwrap();
        let mut bad = sensors();
        bad.set_sensors(SensorType::Flow, vec!["nope".into()]);
        let su = setup(bad, &s);
        assert!(s.configure(&su).is_err());
    }
}
