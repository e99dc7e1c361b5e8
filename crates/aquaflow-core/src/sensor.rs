//! Sensor kinds and sensor placement.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::NetworkTopology;
use crate::error::{SimError, SimResult};

/// What a sensor measures. Species sensors carry the species id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorType {
    Pressure,
    Flow,
    Demand,
    NodeQuality,
    LinkQuality,
    ValveState,
    PumpState,
    TankVolume,
    BulkSpeciesNode(String),
    BulkSpeciesLink(String),
    SurfaceSpecies(String),
}

/// Which element family a sensor of a given type is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    Node,
    Link,
    Pump,
    Valve,
    Tank,
}

impl SensorType {
    pub fn element_kind(&self) -> ElementKind {
        match self {
            SensorType::Pressure
            | SensorType::Demand
            | SensorType::NodeQuality
            | SensorType::BulkSpeciesNode(_) => ElementKind::Node,
            SensorType::Flow
            | SensorType::LinkQuality
            | SensorType::BulkSpeciesLink(_)
            | SensorType::SurfaceSpecies(_) => ElementKind::Link,
            SensorType::ValveState => ElementKind::Valve,
            SensorType::PumpState => ElementKind::Pump,
            SensorType::TankVolume => ElementKind::Tank,
        }
    }

    /// Discrete actuator states are exempt from sensor noise.
    pub fn is_state(&self) -> bool {
        matches!(self, SensorType::PumpState | SensorType::ValveState)
    }

    pub fn species(&self) -> Option<&str> {
        match self {
            SensorType::BulkSpeciesNode(s)
            | SensorType::BulkSpeciesLink(s)
            | SensorType::SurfaceSpecies(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for SensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorType::Pressure => write!(f, "pressure"),
            SensorType::Flow => write!(f, "flow"),
            SensorType::Demand => write!(f, "demand"),
            SensorType::NodeQuality => write!(f, "node quality"),
            SensorType::LinkQuality => write!(f, "link quality"),
            SensorType::ValveState => write!(f, "valve state"),
            SensorType::PumpState => write!(f, "pump state"),
            SensorType::TankVolume => write!(f, "tank volume"),
            SensorType::BulkSpeciesNode(s) => write!(f, "bulk species '{s}' (node)"),
            SensorType::BulkSpeciesLink(s) => write!(f, "bulk species '{s}' (link)"),
            SensorType::SurfaceSpecies(s) => write!(f, "surface species '{s}'"),
        }
    }
}

/// Sensor placement, one location list per sensor type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    pub pressure: Vec<String>,
    pub flow: Vec<String>,
    pub demand: Vec<String>,
    pub node_quality: Vec<String>,
    pub link_quality: Vec<String>,
    pub valve_state: Vec<String>,
    pub pump_state: Vec<String>,
    pub tank_volume: Vec<String>,
    pub bulk_species_node: BTreeMap<String, Vec<String>>,
    pub bulk_species_link: BTreeMap<String, Vec<String>>,
    pub surface_species: BTreeMap<String, Vec<String>>,
}

impl SensorConfig {
    /// Locations of all sensors of `sensor_type`, in configuration order.
    pub fn sensors(&self, sensor_type: &SensorType) -> &[String] {
        match sensor_type {
            SensorType::Pressure => &self.pressure,
            SensorType::Flow => &self.flow,
            SensorType::Demand => &self.demand,
            SensorType::NodeQuality => &self.node_quality,
            SensorType::LinkQuality => &self.link_quality,
            SensorType::ValveState => &self.valve_state,
            SensorType::PumpState => &self.pump_state,
            SensorType::TankVolume => &self.tank_volume,
            SensorType::BulkSpeciesNode(s) => species_sensors(&self.bulk_species_node, s),
            SensorType::BulkSpeciesLink(s) => species_sensors(&self.bulk_species_link, s),
            SensorType::SurfaceSpecies(s) => species_sensors(&self.surface_species, s),
        }
    }

    pub fn set_sensors(&mut self, sensor_type: SensorType, locations: Vec<String>) {
        match sensor_type {
            SensorType::Pressure => self.pressure = locations,
            SensorType::Flow => self.flow = locations,
            SensorType::Demand => self.demand = locations,
            SensorType::NodeQuality => self.node_quality = locations,
            SensorType::LinkQuality => self.link_quality = locations,
            SensorType::ValveState => self.valve_state = locations,
            SensorType::PumpState => self.pump_state = locations,
            SensorType::TankVolume => self.tank_volume = locations,
            SensorType::BulkSpeciesNode(s) => {
                self.bulk_species_node.insert(s, locations);
            }
            SensorType::BulkSpeciesLink(s) => {
                self.bulk_species_link.insert(s, locations);
            }
            SensorType::SurfaceSpecies(s) => {
                self.surface_species.insert(s, locations);
            }
        }
    }

    /// Sensor types that have at least one sensor, in a fixed canonical order.
    pub fn sensor_types(&self) -> Vec<SensorType> {
        let mut types = vec![
            SensorType::Pressure,
            SensorType::Flow,
            SensorType::Demand,
            SensorType::NodeQuality,
            SensorType::LinkQuality,
            SensorType::ValveState,
            SensorType::PumpState,
            SensorType::TankVolume,
        ];
        types.extend(self.bulk_species_node.keys().cloned().map(SensorType::BulkSpeciesNode));
        types.extend(self.bulk_species_link.keys().cloned().map(SensorType::BulkSpeciesLink));
        types.extend(self.surface_species.keys().cloned().map(SensorType::SurfaceSpecies));
        types.retain(|t| !self.sensors(t).is_empty());
        types
    }

    pub fn contains(&self, sensor_type: &SensorType, sensor_id: &str) -> bool {
        self.sensors(sensor_type).iter().any(|s| s == sensor_id)
    }

    pub fn position(&self, sensor_type: &SensorType, sensor_id: &str) -> Option<usize> {
        self.sensors(sensor_type).iter().position(|s| s == sensor_id)
    }

    pub fn total_sensors(&self) -> usize {
        self.sensor_types().iter().map(|t| self.sensors(t).len()).sum()
    }

    /// Every sensor must sit on an element of the matching kind, species
    /// sensors must name a declared species, and no location may repeat.
    pub fn validate(&self, network: &NetworkTopology) -> SimResult<()> {
        for sensor_type in self.sensor_types() {
            if let Some(species) = sensor_type.species() {
                let declared = match sensor_type {
                    SensorType::SurfaceSpecies(_) => &network.surface_species,
                    _ => &network.bulk_species,
                };
                if !declared.iter().any(|s| s == species) {
                    return Err(SimError::config(format!("unknown species '{species}'")));
                }
            }
            let locations = self.sensors(&sensor_type);
            for (i, id) in locations.iter().enumerate() {
                if !network.has_element(sensor_type.element_kind(), id) {
                    return Err(SimError::config(format!(
                        "{sensor_type} sensor placed at unknown location '{id}'"
                    )));
                }
                if locations[..i].contains(id) {
                    return Err(SimError::config(format!(
                        "duplicate {sensor_type} sensor at '{id}'"
                    )));
                }
            }
        }
        Ok(())
    }
}

fn species_sensors<'a>(map: &'a BTreeMap<String, Vec<String>>, species: &str) -> &'a [String] {
    map.get(species).map(|v| v.as_slice()).unwrap_or(&[])
}
