//! Sensor faults and sensor reading attacks.
//!
//! Every transform is a pure function of an incoming series and its sample
//! times. Samples whose time is not covered by the event window are copied
//! through untouched. A `ScadaData` chains the registered events in
//! registration order, each one reading the previous one's output, so a
//! later event sees what earlier ones produced.
//!
//! Positional kinds (override sequences, replay, stuck-at) count report
//! samples only, so the value at a given time is the same whether the series
//! holds every hydraulic step or only the report samples.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::error::{SimError, SimResult};
use crate::sensor::{SensorConfig, SensorType};
use crate::time::{TemporalGrid, TimeWindow};
use crate::uncertainty::seek_to_time;

/// Which times of a series are report samples.
#[derive(Debug, Clone, Copy)]
pub enum Sampling<'a> {
    /// Every time in the series is a report sample.
    Every,
    /// Only the report times of this grid are.
    Grid(&'a TemporalGrid),
}

impl Sampling<'_> {
    pub fn is_sample(&self, t: u64) -> bool {
        match self {
            Sampling::Every => true,
            Sampling::Grid(grid) => grid.is_report_time(t),
        }
    }
}

/// Replacement values of an override attack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideValues {
    Constant(f64),
    /// One value per covered report sample, in time order.
    Sequence(Vec<f64>),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftShape {
    #[default]
    Linear,
    Quadratic,
}

impl DriftShape {
    fn offset(&self, coef: f64, elapsed: u64) -> f64 {
        let dt = elapsed as f64;
        match self {
            DriftShape::Linear => coef * dt,
            DriftShape::Quadratic => coef * dt * dt,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NoiseDistribution {
    Gaussian { mean: f64, std: f64 },
    Uniform { low: f64, high: f64 },
}

impl NoiseDistribution {
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        match *self {
            NoiseDistribution::Gaussian { mean, std } => match Normal::new(mean, std) {
                Ok(normal) if std > 0.0 => normal.sample(rng),
                _ => mean,
            },
            NoiseDistribution::Uniform { low, high } => {
                if low < high {
                    rng.gen_range(low..high)
                } else {
                    low
                }
            }
        }
    }

    fn check(&self) -> SimResult<()> {
        match *self {
            NoiseDistribution::Gaussian { mean, std } => {
                if !mean.is_finite() || !std.is_finite() || std < 0.0 {
                    return Err(SimError::config(format!(
                        "invalid gaussian noise (mean={mean}, std={std})"
                    )));
                }
            }
            NoiseDistribution::Uniform { low, high } => {
                if !low.is_finite() || !high.is_finite() || low > high {
                    return Err(SimError::config(format!(
                        "invalid uniform noise bounds [{low}, {high}]"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Kind-specific parameters of a sensor reading event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReadingEventKind {
    Override { values: OverrideValues },
    /// Replays the samples recorded in `source` (half-open) into the window.
    Replay { source: TimeWindow },
    Drift {
        coef: f64,
        #[serde(default)]
        shape: DriftShape,
    },
    StuckAt,
    StuckAtZero,
    Noise { distribution: NoiseDistribution, seed: u64 },
    ConstantShift { shift: f64 },
    Percentage { coef: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClass {
    /// Physical or electronic sensor malfunction.
    Fault,
    /// Deliberate manipulation of what the SCADA system receives.
    Attack,
}

impl ReadingEventKind {
    pub fn class(&self) -> EventClass {
        match self {
            ReadingEventKind::Override { .. } | ReadingEventKind::Replay { .. } => EventClass::Attack,
            _ => EventClass::Fault,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ReadingEventKind::Override { .. } => "override",
            ReadingEventKind::Replay { .. } => "replay",
            ReadingEventKind::Drift { .. } => "drift",
            ReadingEventKind::StuckAt => "stuck-at",
            ReadingEventKind::StuckAtZero => "stuck-at-zero",
            ReadingEventKind::Noise { .. } => "noise",
            ReadingEventKind::ConstantShift { .. } => "constant-shift",
            ReadingEventKind::Percentage { .. } => "percentage",
        }
    }
}

/// A time-windowed manipulation of one sensor's readings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReadingEvent {
    pub sensor_id: String,
    pub sensor_type: SensorType,
    pub window: TimeWindow,
    #[serde(flatten)]
    pub kind: ReadingEventKind,
}

impl SensorReadingEvent {
    pub fn new(
        sensor_id: impl Into<String>,
        sensor_type: SensorType,
        window: TimeWindow,
        kind: ReadingEventKind,
    ) -> Self {
        Self { sensor_id: sensor_id.into(), sensor_type, window, kind }
    }

    pub fn override_constant(
        sensor_id: impl Into<String>,
        sensor_type: SensorType,
        window: TimeWindow,
        value: f64,
    ) -> Self {
        let values = OverrideValues::Constant(value);
        Self::new(sensor_id, sensor_type, window, ReadingEventKind::Override { values })
    }

    pub fn override_sequence(
        sensor_id: impl Into<String>,
        sensor_type: SensorType,
        window: TimeWindow,
        values: Vec<f64>,
    ) -> Self {
        let values = OverrideValues::Sequence(values);
        Self::new(sensor_id, sensor_type, window, ReadingEventKind::Override { values })
    }

    pub fn replay(
        sensor_id: impl Into<String>,
        sensor_type: SensorType,
        window: TimeWindow,
        source: TimeWindow,
    ) -> Self {
        Self::new(sensor_id, sensor_type, window, ReadingEventKind::Replay { source })
    }

    pub fn drift(sensor_id: impl Into<String>, sensor_type: SensorType, window: TimeWindow, coef: f64) -> Self {
        let kind = ReadingEventKind::Drift { coef, shape: DriftShape::Linear };
        Self::new(sensor_id, sensor_type, window, kind)
    }

    pub fn stuck_at(sensor_id: impl Into<String>, sensor_type: SensorType, window: TimeWindow) -> Self {
        Self::new(sensor_id, sensor_type, window, ReadingEventKind::StuckAt)
    }

    pub fn noise(
        sensor_id: impl Into<String>,
        sensor_type: SensorType,
        window: TimeWindow,
        distribution: NoiseDistribution,
        seed: u64,
    ) -> Self {
        Self::new(sensor_id, sensor_type, window, ReadingEventKind::Noise { distribution, seed })
    }

    /// Applies this event to a series of report samples.
    pub fn apply(&self, series: &[f64], times: &[u64]) -> Vec<f64> {
        self.apply_sampled(series, times, Sampling::Every)
    }

    /// Applies this event to a series whose report samples are picked out by
    /// `sampling`.
    pub fn apply_sampled(&self, series: &[f64], times: &[u64], sampling: Sampling<'_>) -> Vec<f64> {
        let w = &self.window;
        match &self.kind {
            ReadingEventKind::Override { values } => override_values(series, times, w, values, sampling),
            ReadingEventKind::Replay { source } => replay(series, times, w, source, sampling),
            ReadingEventKind::Drift { coef, shape } => drift(series, times, w, *coef, *shape),
            ReadingEventKind::StuckAt => stuck_at(series, times, w, sampling),
            ReadingEventKind::StuckAtZero => map_window(series, times, w, |_, _| 0.0),
            ReadingEventKind::Noise { distribution, seed } => noise(series, times, w, distribution, *seed),
            ReadingEventKind::ConstantShift { shift } => map_window(series, times, w, |x, _| x + shift),
            ReadingEventKind::Percentage { coef } => map_window(series, times, w, |x, _| x * (1.0 + coef)),
        }
    }

    /// Registration-time checks against the sensor placement and the grid.
    pub fn validate(&self, sensors: &SensorConfig, grid: &TemporalGrid) -> SimResult<()> {
        if !sensors.contains(&self.sensor_type, &self.sensor_id) {
            return Err(SimError::config(format!(
                "no {} sensor at '{}'",
                self.sensor_type, self.sensor_id
            )));
        }
        self.window.check_within(grid.duration())?;

        match &self.kind {
            ReadingEventKind::Override { values: OverrideValues::Sequence(values) } => {
                let covered = grid.report_indices_in(&self.window).len();
                if values.len() != covered {
                    return Err(SimError::config(format!(
                        "override on '{}' supplies {} values but its window covers {} report samples",
                        self.sensor_id,
                        values.len(),
                        covered
                    )));
                }
                if values.iter().any(|v| !v.is_finite()) {
                    return Err(SimError::config("override values must be finite"));
                }
            }
            ReadingEventKind::Override { values: OverrideValues::Constant(c) } if !c.is_finite() => {
                return Err(SimError::config("override value must be finite"));
            }
            ReadingEventKind::Replay { source } => {
                source.check_within(grid.duration())?;
                if grid.report_times().iter().all(|t| !source.contains(*t)) {
                    return Err(SimError::config(format!(
                        "replay source [{}, {}) contains no report sample",
                        source.start, source.end
                    )));
                }
            }
            ReadingEventKind::Drift { coef, .. } if !coef.is_finite() => {
                return Err(SimError::config("drift coefficient must be finite"));
            }
            ReadingEventKind::Noise { distribution, .. } => distribution.check()?,
            ReadingEventKind::ConstantShift { shift } if !shift.is_finite() => {
                return Err(SimError::config("constant shift must be finite"));
            }
            ReadingEventKind::Percentage { coef } if !coef.is_finite() => {
                return Err(SimError::config("percentage coefficient must be finite"));
            }
            _ => {}
        }
        Ok(())
    }
}

fn map_window(series: &[f64], times: &[u64], window: &TimeWindow, mut f: impl FnMut(f64, u64) -> f64) -> Vec<f64> {
    series
        .iter()
        .zip(times)
        .map(|(&x, &t)| if window.covers_sample(t) { f(x, t) } else { x })
        .collect()
}

/// Number of covered report samples up to and including each time, or
/// `None` for times outside the window.
fn covered_ranks(times: &[u64], window: &TimeWindow, sampling: Sampling<'_>) -> Vec<Option<usize>> {
    let mut seen = 0;
    times
        .iter()
        .map(|&t| {
            if !window.covers_sample(t) {
                return None;
            }
            if sampling.is_sample(t) {
                seen += 1;
            }
            Some(seen)
        })
        .collect()
}

/// Replaces covered samples with a constant or with consecutive values of a
/// sequence, one per covered report sample. A sequence shorter than the
/// covered span repeats its last value.
pub fn override_values(
    series: &[f64],
    times: &[u64],
    window: &TimeWindow,
    values: &OverrideValues,
    sampling: Sampling<'_>,
) -> Vec<f64> {
    let ranks = covered_ranks(times, window, sampling);
    series
        .iter()
        .zip(ranks)
        .map(|(&x, rank)| match (rank, values) {
            (None, _) => x,
            (Some(_), OverrideValues::Constant(c)) => *c,
            (Some(n), OverrideValues::Sequence(seq)) => {
                seq.get(n.saturating_sub(1)).or(seq.last()).copied().unwrap_or(x)
            }
        })
        .collect()
}

/// Copies the report samples recorded inside `source` into the covered
/// samples, cycling through them when the source is shorter than the target.
pub fn replay(
    series: &[f64],
    times: &[u64],
    window: &TimeWindow,
    source: &TimeWindow,
    sampling: Sampling<'_>,
) -> Vec<f64> {
    let recorded: Vec<f64> = times
        .iter()
        .zip(series)
        .filter(|(t, _)| source.contains(**t) && sampling.is_sample(**t))
        .map(|(_, &x)| x)
        .collect();
    if recorded.is_empty() {
        return series.to_vec();
    }
    let ranks = covered_ranks(times, window, sampling);
    series
        .iter()
        .zip(ranks)
        .map(|(&x, rank)| match rank {
            Some(n) => recorded[n.saturating_sub(1) % recorded.len()],
            None => x,
        })
        .collect()
}

/// Adds `coef * g(t - start)` to every covered sample.
pub fn drift(series: &[f64], times: &[u64], window: &TimeWindow, coef: f64, shape: DriftShape) -> Vec<f64> {
    map_window(series, times, window, |x, t| x + shape.offset(coef, t - window.start))
}

/// Freezes the covered samples at the value of the first covered report
/// sample. Covered times before that sample keep their value.
pub fn stuck_at(series: &[f64], times: &[u64], window: &TimeWindow, sampling: Sampling<'_>) -> Vec<f64> {
    let first = times
        .iter()
        .position(|&t| window.covers_sample(t) && sampling.is_sample(t));
    match first {
        Some(i) => {
            let (from, v) = (times[i], series[i]);
            map_window(series, times, window, |x, t| if t >= from { v } else { x })
        }
        None => series.to_vec(),
    }
}

/// Adds seeded, independent perturbations to every covered sample. The draw
/// for a sample depends only on the seed and the sample time.
pub fn noise(
    series: &[f64],
    times: &[u64],
    window: &TimeWindow,
    distribution: &NoiseDistribution,
    seed: u64,
) -> Vec<f64> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    map_window(series, times, window, |x, t| {
        seek_to_time(&mut rng, t);
        x + distribution.sample(&mut rng)
    })
}
