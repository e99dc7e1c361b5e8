use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::controller::ActuatorEvent;
use crate::error::{SimError, SimResult};
use crate::faults::SensorReadingEvent;
use crate::leakage::LeakSpec;
use crate::sensor::{ElementKind, SensorConfig};
use crate::time::TemporalGrid;
use crate::uncertainty::{SensorNoise, UncertaintySpec};

/// Element and species ids of the network model.
///
/// Tanks are nodes and pumps and valves are links, so a pressure sensor may
/// sit on a tank and a flow sensor on a pump.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkTopology {
    pub nodes: Vec<String>,
    pub links: Vec<String>,
    pub pumps: Vec<String>,
    pub valves: Vec<String>,
    pub tanks: Vec<String>,
    pub bulk_species: Vec<String>,
    pub surface_species: Vec<String>,
}

impl NetworkTopology {
    pub fn has_node(&self, id: &str) -> bool {
        self.nodes.iter().chain(&self.tanks).any(|n| n == id)
    }

    pub fn has_link(&self, id: &str) -> bool {
        self.links.iter().chain(&self.pumps).chain(&self.valves).any(|l| l == id)
    }

    pub fn has_pump(&self, id: &str) -> bool {
        self.pumps.iter().any(|p| p == id)
    }

    pub fn has_valve(&self, id: &str) -> bool {
        self.valves.iter().any(|v| v == id)
    }

    pub fn has_tank(&self, id: &str) -> bool {
        self.tanks.iter().any(|t| t == id)
    }

    pub fn has_element(&self, kind: ElementKind, id: &str) -> bool {
        match kind {
            ElementKind::Node => self.has_node(id),
            ElementKind::Link => self.has_link(id),
            ElementKind::Pump => self.has_pump(id),
            ElementKind::Valve => self.has_valve(id),
            ElementKind::Tank => self.has_tank(id),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowUnits {
    /// Liters per second.
    #[default]
    Lps,
    /// Cubic meters per hour.
    Cmh,
    /// Cubic meters per second.
    Cms,
    /// US gallons per minute.
    Gpm,
}

impl FlowUnits {
    /// Multiplier converting cubic meters per second into these units.
    pub fn per_cubic_meter_per_second(&self) -> f64 {
        match self {
            FlowUnits::Lps => 1_000.0,
            FlowUnits::Cmh => 3_600.0,
            FlowUnits::Cms => 1.0,
            FlowUnits::Gpm => 15_850.323,
        }
    }
}

/// Timing and run-wide parameters. All times in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralParams {
    pub simulation_duration: u64,
    pub hydraulic_time_step: u64,
    pub reporting_time_step: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_time_step: Option<u64>,
    #[serde(default)]
    pub reporting_time_start: u64,
    #[serde(default)]
    pub flow_units: FlowUnits,
    /// Seed of the per-run RNG. Drawn from OS entropy when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl GeneralParams {
    pub fn new(simulation_duration: u64, hydraulic_time_step: u64, reporting_time_step: u64) -> Self {
        Self {
            simulation_duration,
            hydraulic_time_step,
            reporting_time_step,
            quality_time_step: None,
            reporting_time_start: 0,
            flow_units: FlowUnits::default(),
            seed: None,
        }
    }
}

/// Everything needed to set up a scenario. Immutable once handed to a
/// simulator; declared events are registered through the same validated
/// paths as programmatic ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioConfig {
    pub general: GeneralParams,
    pub network: NetworkTopology,
    #[serde(default)]
    pub sensors: SensorConfig,
    #[serde(default)]
    pub leakages: Vec<LeakSpec>,
    #[serde(default)]
    pub sensor_reading_events: Vec<SensorReadingEvent>,
    #[serde(default)]
    pub actuator_events: Vec<ActuatorEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_uncertainty: Option<UncertaintySpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensor_noise: Option<SensorNoise>,
}

impl ScenarioConfig {
    pub fn new(general: GeneralParams, network: NetworkTopology, sensors: SensorConfig) -> Self {
        Self {
            general,
            network,
            sensors,
            leakages: Vec::new(),
            sensor_reading_events: Vec::new(),
            actuator_events: Vec::new(),
            model_uncertainty: None,
            sensor_noise: None,
        }
    }

    /// Loads a scenario from a TOML file, layered with `AQUAFLOW__`-prefixed
    /// environment overrides (`AQUAFLOW__GENERAL__SEED=7`).
    pub fn load(path: impl AsRef<Path>) -> SimResult<Self> {
        let path = path.as_ref();
        let settings = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Toml))
            .add_source(
                config::Environment::with_prefix("AQUAFLOW")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let cfg: ScenarioConfig = settings.try_deserialize()?;
        cfg.validate()?;
        log::debug!("loaded scenario from {}", path.display());
        Ok(cfg)
    }

    pub fn from_toml_str(s: &str) -> SimResult<Self> {
        let cfg: ScenarioConfig = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn to_toml_string(&self) -> SimResult<String> {
        Ok(toml::to_string(self)?)
    }

    pub fn grid(&self) -> SimResult<TemporalGrid> {
        let g = &self.general;
        TemporalGrid::new(
            g.simulation_duration,
            g.hydraulic_time_step,
            g.reporting_time_step,
            g.quality_time_step,
            g.reporting_time_start,
        )
    }

    /// Checks the grid, sensor placement, and every declared event.
    pub fn validate(&self) -> SimResult<()> {
        let grid = self.grid()?;
        self.sensors.validate(&self.network)?;
        for leak in &self.leakages {
            leak.validate(&self.network, &grid)?;
        }
        for event in &self.sensor_reading_events {
            event.validate(&self.sensors, &grid)?;
        }
        for event in &self.actuator_events {
            event.validate(&self.network, &grid)?;
        }
        if let Some(spec) = &self.model_uncertainty {
            spec.validate()?;
        }
        if let Some(noise) = &self.sensor_noise {
            noise.uncertainty.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::SensorType;
    use std::io::Write;

    const SCENARIO: &str = r#"
[general]
simulation_duration = 172800
hydraulic_time_step = 1800
reporting_time_step = 1800

[network]
nodes = ["1", "2", "13"]
links = ["p1", "p2"]
pumps = ["pump1"]
tanks = ["T1"]

[sensors]
pressure = ["1", "13"]
flow = ["p1"]

[[sensor_reading_events]]
sensor_id = "1"
sensor_type = "pressure"
window = { start = 18000, end = 25200 }
kind = "override"
values = { constant = 42.0 }

[[leakages]]
type = "abrupt"
location_id = "2"
peak_area = 0.001
window = { start = 3600, end = 7200 }
"#;

    #[test]
    fn parses_and_validates_toml() {
        let cfg = ScenarioConfig::from_toml_str(SCENARIO).unwrap();
        assert_eq!(cfg.grid().unwrap().num_reports(), 96);
        assert_eq!(cfg.sensors.sensors(&SensorType::Pressure), ["1", "13"]);
        assert_eq!(cfg.sensor_reading_events.len(), 1);
        assert_eq!(cfg.leakages.len(), 1);
        assert_eq!(cfg.general.seed, None);
    }

    #[test]
    fn toml_round_trip_preserves_scenario() {
        let cfg = ScenarioConfig::from_toml_str(SCENARIO).unwrap();
        let text = cfg.to_toml_string().unwrap();
        assert_eq!(ScenarioConfig::from_toml_str(&text).unwrap(), cfg);
    }

    #[test]
    fn rejects_unknown_sensor_location() {
        let bad = SCENARIO.replace(r#"flow = ["p1"]"#, r#"flow = ["nope"]"#);
        let err = ScenarioConfig::from_toml_str(&bad).unwrap_err();
        assert!(matches!(err, SimError::Configuration(_)));
    }

    #[test]
    fn rejects_event_past_horizon() {
        let bad = SCENARIO.replace("end = 25200", "end = 999999");
        assert!(ScenarioConfig::from_toml_str(&bad).is_err());
    }

    #[test]
    fn loads_file_with_env_override() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(SCENARIO.as_bytes()).unwrap();
        std::env::set_var("AQUAFLOW__GENERAL__SEED", "7");
        let cfg = ScenarioConfig::load(file.path());
        std::env::remove_var("AQUAFLOW__GENERAL__SEED");
        let cfg = cfg.unwrap();
        assert_eq!(cfg.general.seed, Some(7));
        assert_eq!(cfg.network.pumps, ["pump1"]);
    }

    #[test]
    fn topology_element_families() {
        let net = NetworkTopology {
            nodes: vec!["1".into()],
            pumps: vec!["pu".into()],
            tanks: vec!["T".into()],
            ..Default::default()
        };
        assert!(net.has_node("T"));
        assert!(net.has_link("pu"));
        assert!(!net.has_valve("pu"));
        assert!(net.has_element(ElementKind::Tank, "T"));
        assert!(!net.has_element(ElementKind::Node, "pu"));
    }
}
