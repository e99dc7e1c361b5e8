//! AquaFlow core: scenario overlay for water distribution simulation.
//! Leaks, control modules and model uncertainty drive the solver; sensor
//! faults and attacks are applied to the recorded SCADA readings.

pub mod error;
pub mod time;
pub mod sensor;
pub mod config;
pub mod faults;
pub mod leakage;
pub mod uncertainty;
pub mod solver;
pub mod surrogate;
pub mod readings;
pub mod scada;
pub mod controller;
pub mod controls;
pub mod safety;
pub mod validation;
pub mod simulator;

pub use error::*;
pub use time::*;
pub use sensor::*;
pub use self::config::*;
pub use faults::*;
pub use leakage::*;
pub use uncertainty::*;
pub use solver::*;
pub use surrogate::*;
pub use readings::*;
pub use scada::*;
pub use controller::*;
pub use controls::*;
pub use safety::*;
pub use validation::*;
pub use simulator::*;

#[cfg(test)]
mod tests_scenarios;
#[cfg(test)]
mod tests_determinism;
