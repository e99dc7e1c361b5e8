//! SCADA data container.
//!
//! Raw readings are stored once and never modified. The observed view is
//! derived from them by applying sensor noise and then every sensor reading
//! event in registration order; it is cached and rebuilt lazily after any
//! change to the noise or the events.

use std::cell::OnceCell;
use std::collections::BTreeMap;

use nalgebra::DMatrix;

use crate::error::{SimError, SimResult};
use crate::faults::{EventClass, OverrideValues, ReadingEventKind, Sampling, SensorReadingEvent};
use crate::readings::RawReadings;
use crate::sensor::SensorType;
use crate::uncertainty::{sensor_stream, SensorNoise};

/// Observed values of one sensor: noise first, then the sensor's events in
/// order. Pump and valve states never receive noise. The value at a time
/// does not depend on which other times `times` holds, as long as
/// `sampling` marks the report samples among them.
pub fn observe_series(
    raw: &[f64],
    times: &[u64],
    sensor_type: &SensorType,
    sensor_id: &str,
    noise: Option<&SensorNoise>,
    events: &[SensorReadingEvent],
    sampling: Sampling<'_>,
) -> Vec<f64> {
    let mut out = match noise {
        Some(n) if !sensor_type.is_state() => {
            n.apply_series(raw, times, sensor_stream(sensor_type, sensor_id))
        }
        _ => raw.to_vec(),
    };
    for event in events.iter().filter(|e| e.sensor_type == *sensor_type && e.sensor_id == sensor_id) {
        out = event.apply_sampled(&out, times, sampling);
    }
    out
}

/// Hydraulic times at which at least one leak or sensor reading event was
/// active during the run. Sorted and free of duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventActivityLog {
    times: Vec<u64>,
}

impl EventActivityLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `t`. Times are expected in increasing order; anything else is
    /// merged into place.
    pub fn record(&mut self, t: u64) {
        match self.times.last() {
            Some(&last) if last == t => {}
            Some(&last) if last > t => {
                if let Err(i) = self.times.binary_search(&t) {
                    self.times.insert(i, t);
                }
            }
            _ => self.times.push(t),
        }
    }

    pub fn times(&self) -> &[u64] {
        &self.times
    }

    pub fn contains(&self, t: u64) -> bool {
        self.times.binary_search(&t).is_ok()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn merge(&mut self, other: &EventActivityLog) {
        for &t in &other.times {
            self.record(t);
        }
    }
}

type ObservedColumns = BTreeMap<SensorType, Vec<Vec<f64>>>;

/// Sensor readings of one run together with the faults and attacks that
/// shape what the SCADA system sees.
#[derive(Debug, Clone)]
pub struct ScadaData {
    raw: RawReadings,
    events: Vec<SensorReadingEvent>,
    noise: Option<SensorNoise>,
    activity: EventActivityLog,
    observed: OnceCell<ObservedColumns>,
}

impl ScadaData {
    pub fn new(raw: RawReadings) -> Self {
        Self {
            raw,
            events: Vec::new(),
            noise: None,
            activity: EventActivityLog::new(),
            observed: OnceCell::new(),
        }
    }

    pub fn with_activity_log(mut self, activity: EventActivityLog) -> Self {
        self.activity = activity;
        self
    }

    pub fn raw(&self) -> &RawReadings {
        &self.raw
    }

    pub fn times(&self) -> &[u64] {
        self.raw.times()
    }

    pub fn events(&self) -> &[SensorReadingEvent] {
        &self.events
    }

    pub fn sensor_noise(&self) -> Option<&SensorNoise> {
        self.noise.as_ref()
    }

    pub fn activity_log(&self) -> &EventActivityLog {
        &self.activity
    }

    pub fn fingerprint(&self) -> String {
        self.raw.fingerprint()
    }

    fn invalidate(&mut self) {
        self.observed.take();
    }

    fn validate_event(&self, event: &SensorReadingEvent) -> SimResult<()> {
        if self.raw.series(&event.sensor_type, &event.sensor_id).is_none() {
            return Err(SimError::config(format!(
                "no {} sensor at '{}' in this data",
                event.sensor_type, event.sensor_id
            )));
        }
        let w = event.window;
        if w.start >= w.end {
            return Err(SimError::config(format!("malformed window [{}, {})", w.start, w.end)));
        }
        match &event.kind {
            ReadingEventKind::Override { values: OverrideValues::Sequence(values) } => {
                let covered = self.times().iter().filter(|&&t| w.covers_sample(t)).count();
                if values.len() != covered {
                    return Err(SimError::config(format!(
                        "override on '{}' supplies {} values but its window covers {} samples",
                        event.sensor_id,
                        values.len(),
                        covered
                    )));
                }
            }
            ReadingEventKind::Replay { source } => {
                if !self.times().iter().any(|&t| source.contains(t)) {
                    return Err(SimError::config(format!(
                        "replay source [{}, {}) contains no sample",
                        source.start, source.end
                    )));
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Appends an event after every event already registered.
    pub fn add_sensor_reading_event(&mut self, event: SensorReadingEvent) -> SimResult<()> {
        self.validate_event(&event)?;
        log::debug!("scada: added {} on {} '{}'", event.kind.name(), event.sensor_type, event.sensor_id);
        self.events.push(event);
        self.invalidate();
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

    /// Replaces the whole event sequence. Nothing changes if any event is
    /// invalid.
    pub fn set_sensor_reading_events(&mut self, events: Vec<SensorReadingEvent>) -> SimResult<()> {
        for e in &events {
            self.validate_event(e)?;
        }
        self.events = events;
        self.invalidate();
        Ok(())
    }

    pub fn clear_sensor_reading_events(&mut self) {
        self.events.clear();
        self.invalidate();
    }

    pub fn set_sensor_noise(&mut self, noise: Option<SensorNoise>) -> SimResult<()> {
        if let Some(n) = &noise {
            n.uncertainty.validate()?;
        }
        self.noise = noise;
        self.invalidate();
        Ok(())
    }

    fn observed(&self) -> &ObservedColumns {
        self.observed.get_or_init(|| {
            let times = self.raw.times();
            self.raw
                .sensor_types()
                .filter_map(|ty| self.raw.series_of(ty).map(|s| (ty, s)))
                .map(|(ty, s)| {
                    let cols = s
                        .sensor_ids
                        .iter()
                        .zip(&s.values)
                        .map(|(id, col)| {
                            observe_series(col, times, ty, id, self.noise.as_ref(), &self.events, Sampling::Every)
                        })
                        .collect();
                    (ty.clone(), cols)
                })
                .collect()
        })
    }

    fn select(
        &self,
        sensor_type: &SensorType,
        locations: Option<&[&str]>,
        columns: &[Vec<f64>],
    ) -> SimResult<DMatrix<f64>> {
        let ids = self.raw.sensor_ids(sensor_type);
        let picked: Vec<usize> = match locations {
            None => (0..ids.len()).collect(),
            Some(locs) => locs
                .iter()
                .map(|loc| {
                    ids.iter()
                        .position(|id| id == loc)
                        .ok_or_else(|| SimError::config(format!("no {sensor_type} sensor at '{loc}'")))
                })
                .collect::<SimResult<_>>()?,
        };
        Ok(DMatrix::from_fn(self.raw.len(), picked.len(), |r, c| columns[picked[c]][r]))
    }

    /// Observed `[time x sensor]` matrix for one sensor type. Columns follow
    /// `sensor_locations`, or configuration order when `None`.
    pub fn get_observed_data(
        &self,
        sensor_type: &SensorType,
        sensor_locations: Option<&[&str]>,
    ) -> SimResult<DMatrix<f64>> {
        let observed = self.observed();
        let columns = observed
            .get(sensor_type)
            .ok_or_else(|| SimError::config(format!("no {sensor_type} sensors in this data")))?;
        self.select(sensor_type, sensor_locations, columns)
    }

    /// Same as [`get_observed_data`](Self::get_observed_data) but ignoring
    /// noise and events.
    pub fn get_raw_data(
        &self,
        sensor_type: &SensorType,
        sensor_locations: Option<&[&str]>,
    ) -> SimResult<DMatrix<f64>> {
        let series = self
            .raw
            .series_of(sensor_type)
            .ok_or_else(|| SimError::config(format!("no {sensor_type} sensors in this data")))?;
        self.select(sensor_type, sensor_locations, &series.values)
    }

    pub fn get_data_pressures(&self, sensor_locations: Option<&[&str]>) -> SimResult<DMatrix<f64>> {
        self.get_observed_data(&SensorType::Pressure, sensor_locations)
    }

    pub fn get_data_flows(&self, sensor_locations: Option<&[&str]>) -> SimResult<DMatrix<f64>> {
        self.get_observed_data(&SensorType::Flow, sensor_locations)
    }

    pub fn get_data_demands(&self, sensor_locations: Option<&[&str]>) -> SimResult<DMatrix<f64>> {
        self.get_observed_data(&SensorType::Demand, sensor_locations)
    }

    pub fn get_data_nodes_quality(&self, sensor_locations: Option<&[&str]>) -> SimResult<DMatrix<f64>> {
        self.get_observed_data(&SensorType::NodeQuality, sensor_locations)
    }

    pub fn get_data_links_quality(&self, sensor_locations: Option<&[&str]>) -> SimResult<DMatrix<f64>> {
        self.get_observed_data(&SensorType::LinkQuality, sensor_locations)
    }

    pub fn get_data_pumps_state(&self, sensor_locations: Option<&[&str]>) -> SimResult<DMatrix<f64>> {
        self.get_observed_data(&SensorType::PumpState, sensor_locations)
    }

    pub fn get_data_valves_state(&self, sensor_locations: Option<&[&str]>) -> SimResult<DMatrix<f64>> {
        self.get_observed_data(&SensorType::ValveState, sensor_locations)
    }

    pub fn get_data_tanks_volume(&self, sensor_locations: Option<&[&str]>) -> SimResult<DMatrix<f64>> {
        self.get_observed_data(&SensorType::TankVolume, sensor_locations)
    }

    pub fn get_data_bulk_species_node_concentration(
        &self,
        species_id: &str,
        sensor_locations: Option<&[&str]>,
    ) -> SimResult<DMatrix<f64>> {
        self.get_observed_data(&SensorType::BulkSpeciesNode(species_id.to_string()), sensor_locations)
    }

    pub fn get_data_bulk_species_link_concentration(
        &self,
        species_id: &str,
        sensor_locations: Option<&[&str]>,
    ) -> SimResult<DMatrix<f64>> {
        self.get_observed_data(&SensorType::BulkSpeciesLink(species_id.to_string()), sensor_locations)
    }

    pub fn get_data_surface_species_concentration(
        &self,
        species_id: &str,
        sensor_locations: Option<&[&str]>,
    ) -> SimResult<DMatrix<f64>> {
        self.get_observed_data(&SensorType::SurfaceSpecies(species_id.to_string()), sensor_locations)
    }

    /// `(type, location)` of every column of [`get_data`](Self::get_data).
    pub fn column_labels(&self) -> Vec<(SensorType, String)> {
        self.raw
            .sensor_types()
            .flat_map(|ty| self.raw.sensor_ids(ty).iter().map(move |id| (ty.clone(), id.clone())))
            .collect()
    }

    /// Observed values of every sensor, one column per sensor, grouped by
    /// type in storage order.
    pub fn get_data(&self) -> DMatrix<f64> {
        let columns: Vec<&Vec<f64>> = self.observed().values().flatten().collect();
        DMatrix::from_fn(self.raw.len(), columns.len(), |r, c| columns[c][r])
    }

    /// Times at which any event was active: the run's activity log plus
    /// every sample covered by an event attached to this container.
    pub fn get_events_active_time_points(&self) -> Vec<u64> {
        let mut log = self.activity.clone();
        for &t in self.times() {
            if self.events.iter().any(|e| e.window.covers_sample(t)) {
                log.record(t);
            }
        }
        log.times().to_vec()
    }

    /// Appends `other`, which must hold the same sensors and start after
    /// this container ends. Events of `other` not present here are appended.
    pub fn concatenate(&mut self, other: ScadaData) -> SimResult<()> {
        if let (Some(&last), Some(&first)) = (self.times().last(), other.times().first()) {
            if first <= last {
                return Err(SimError::config(format!(
                    "cannot concatenate: other starts at {first}s, not after {last}s"
                )));
            }
        }
        let same_sensors = self.raw.sensor_types().eq(other.raw.sensor_types())
            && self.raw.sensor_types().all(|ty| self.raw.sensor_ids(ty) == other.raw.sensor_ids(ty));
        if !same_sensors {
            return Err(SimError::config("cannot concatenate: sensor configurations differ"));
        }
        if other.noise.is_some() && other.noise != self.noise {
            return Err(SimError::config("cannot concatenate: sensor noise differs"));
        }

        let (mut times, mut series) = std::mem::take(&mut self.raw).into_parts();
        let (other_times, other_series) = other.raw.into_parts();
        times.extend(other_times);
        for (ty, s) in series.iter_mut() {
            if let Some(o) = other_series.get(ty) {
                for (col, ocol) in s.values.iter_mut().zip(&o.values) {
                    col.extend_from_slice(ocol);
                }
            }
        }
        self.raw = RawReadings::from_parts(times, series)?;
        for e in other.events {
            if !self.events.contains(&e) {
                self.events.push(e);
            }
        }
        self.activity.merge(&other.activity);
        self.invalidate();
        Ok(())
    }

    /// Adds the sensors of `other`, which must share this container's time
    /// axis and hold no sensor already present here.
    pub fn join(&mut self, other: ScadaData) -> SimResult<()> {
        if self.times() != other.times() {
            return Err(SimError::config("cannot join: time axes differ"));
        }
        if let (Some(a), Some(b)) = (&self.noise, &other.noise) {
            if a != b {
                return Err(SimError::config("cannot join: sensor noise differs"));
            }
        }
        for ty in other.raw.sensor_types() {
            let existing = self.raw.sensor_ids(ty);
            if let Some(dup) = other.raw.sensor_ids(ty).iter().find(|id| existing.contains(id)) {
                return Err(SimError::config(format!("cannot join: duplicate {ty} sensor '{dup}'")));
            }
        }
        let (times, mut series) = std::mem::take(&mut self.raw).into_parts();
        let (_, other_series) = other.raw.into_parts();
        for (ty, o) in other_series {
            let entry = series.entry(ty).or_default();
            entry.sensor_ids.extend(o.sensor_ids);
            entry.values.extend(o.values);
        }
        self.raw = RawReadings::from_parts(times, series)?;
        if self.noise.is_none() {
            self.noise = other.noise;
        }
        self.events.extend(other.events);
        self.activity.merge(&other.activity);
        self.invalidate();
        Ok(())
    }
}
