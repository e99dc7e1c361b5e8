use std::collections::BTreeMap;

use crate::error::{SimError, SimResult};
use crate::sensor::{SensorConfig, SensorType};
use crate::solver::{RawStepResult, SolverFault};

/// All sensors of one type, one column of values per sensor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SensorSeries {
    pub sensor_ids: Vec<String>,
    pub values: Vec<Vec<f64>>,
}

impl SensorSeries {
    pub fn column(&self, sensor_id: &str) -> Option<&[f64]> {
        let i = self.sensor_ids.iter().position(|s| s == sensor_id)?;
        Some(&self.values[i])
    }
}

/// Unmodified sensor values as produced by the solver, plus their times.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawReadings {
    times: Vec<u64>,
    series: BTreeMap<SensorType, SensorSeries>,
}

impl RawReadings {
    /// Empty readings with one column per configured sensor.
    pub fn new(sensors: &SensorConfig) -> Self {
        let series = sensors
            .sensor_types()
            .into_iter()
            .map(|ty| {
                let ids = sensors.sensors(&ty).to_vec();
                let values = vec![Vec::new(); ids.len()];
                (ty, SensorSeries { sensor_ids: ids, values })
            })
            .collect();
        Self { times: Vec::new(), series }
    }

    /// Builds readings from ready-made columns. Every column must have one
    /// value per time.
    pub fn from_parts(times: Vec<u64>, series: BTreeMap<SensorType, SensorSeries>) -> SimResult<Self> {
        if times.windows(2).any(|w| w[0] >= w[1]) {
            return Err(SimError::config("reading times must be strictly increasing"));
        }
        for (ty, s) in &series {
            if s.sensor_ids.len() != s.values.len() {
                return Err(SimError::config(format!("{ty}: {} ids but {} columns", s.sensor_ids.len(), s.values.len())));
            }
            if s.values.iter().any(|col| col.len() != times.len()) {
                return Err(SimError::config(format!("{ty}: column length differs from {} times", times.len())));
            }
        }
        Ok(Self { times, series })
    }

    /// Appends one solver step. Fails when the solver left out a configured
    /// sensor.
    pub fn push(&mut self, step: &RawStepResult) -> Result<(), SolverFault> {
        let mut row = Vec::with_capacity(self.series.len());
        for (ty, s) in &self.series {
            let mut values = Vec::with_capacity(s.sensor_ids.len());
            for id in &s.sensor_ids {
                let v = step
                    .get(ty, id)
                    .ok_or_else(|| SolverFault::new(format!("no {ty} reading for '{id}'")))?;
                values.push(v);
            }
            row.push(values);
        }
        for (s, values) in self.series.values_mut().zip(row) {
            for (col, v) in s.values.iter_mut().zip(values) {
                col.push(v);
            }
        }
        self.times.push(step.time);
        Ok(())
    }

    pub fn times(&self) -> &[u64] {
        &self.times
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn sensor_types(&self) -> impl Iterator<Item = &SensorType> {
        self.series.keys()
    }

    pub fn series_of(&self, sensor_type: &SensorType) -> Option<&SensorSeries> {
        self.series.get(sensor_type)
    }

    pub fn sensor_ids(&self, sensor_type: &SensorType) -> &[String] {
        self.series.get(sensor_type).map(|s| s.sensor_ids.as_slice()).unwrap_or(&[])
    }

    pub fn series(&self, sensor_type: &SensorType, sensor_id: &str) -> Option<&[f64]> {
        self.series.get(sensor_type)?.column(sensor_id)
    }

    pub fn last(&self, sensor_type: &SensorType, sensor_id: &str) -> Option<f64> {
        self.series(sensor_type, sensor_id)?.last().copied()
    }

    pub(crate) fn into_parts(self) -> (Vec<u64>, BTreeMap<SensorType, SensorSeries>) {
        (self.times, self.series)
    }

    /// blake3 digest of times, sensor ids and the exact bit patterns of
    /// every value.
    pub fn fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for t in &self.times {
            hasher.update(&t.to_le_bytes());
        }
        for (ty, s) in &self.series {
            hasher.update(ty.to_string().as_bytes());
            for (id, col) in s.sensor_ids.iter().zip(&s.values) {
                hasher.update(id.as_bytes());
                hasher.update(&[0]);
                for v in col {
                    hasher.update(&v.to_bits().to_le_bytes());
                }
            }
        }
        hasher.finalize().to_hex().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sensors() -> SensorConfig {
        let mut s = SensorConfig::default();
        s.set_sensors(SensorType::Pressure, vec!["1".into(), "2".into()]);
        s.set_sensors(SensorType::Flow, vec!["p".into()]);
        s
    }

    fn step(time: u64, p1: f64) -> RawStepResult {
        let mut r = RawStepResult::new(time);
        r.set(SensorType::Pressure, "1", p1);
        r.set(SensorType::Pressure, "2", 20.0);
        r.set(SensorType::Flow, "p", 3.0);
        r
    }

    #[test]
    fn push_and_query() {
        let mut raw = RawReadings::new(&sensors());
        raw.push(&step(0, 30.0)).unwrap();
        raw.push(&step(600, 31.0)).unwrap();
        assert_eq!(raw.times(), &[0, 600]);
        assert_eq!(raw.series(&SensorType::Pressure, "1").unwrap(), &[30.0, 31.0]);
        assert_eq!(raw.last(&SensorType::Flow, "p"), Some(3.0));
    }

    #[test]
    fn missing_reading_is_rejected_without_partial_row() {
        let mut raw = RawReadings::new(&sensors());
        let mut r = RawStepResult::new(0);
        r.set(SensorType::Flow, "p", 1.0);
        assert!(raw.push(&r).is_err());
        assert!(raw.is_empty());
        assert!(raw.series(&SensorType::Flow, "p").unwrap().is_empty());
    }

    #[test]
    fn fingerprint_tracks_values() {
        let mut a = RawReadings::new(&sensors());
        let mut b = RawReadings::new(&sensors());
        a.push(&step(0, 30.0)).unwrap();
        b.push(&step(0, 30.0)).unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
        b.push(&step(600, 30.0)).unwrap();
        a.push(&step(600, 30.000001)).unwrap();
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}
