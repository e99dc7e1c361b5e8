//! Model uncertainty and sensor noise.
//!
//! Every draw comes from a [`ChaCha8Rng`] owned by the caller, so a run is
//! reproducible from its seed alone.

use std::collections::BTreeMap;

use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::error::{SimError, SimResult};
use crate::sensor::SensorType;
use crate::solver::ModelParameters;

/// ChaCha words reserved for the draws made at one sample time.
const WORDS_PER_INSTANT: u128 = 64;

/// Shape of a perturbation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UncertaintyKind {
    /// `x + N(mean, scale²)`
    AbsoluteGaussian { mean: f64, scale: f64 },
    /// `x * (1 + N(0, scale²))`
    RelativeGaussian { scale: f64 },
    /// `x + U(low, high)`
    AbsoluteUniform { low: f64, high: f64 },
    /// `x * U(low, high)`
    RelativeUniform { low: f64, high: f64 },
    /// `x * U(1 - deviation, 1 + deviation)`, deviation in (0, 1)
    PercentageDeviation { deviation: f64 },
}

/// A perturbation followed by an optional clamp.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Uncertainty {
    #[serde(flatten)]
    pub kind: UncertaintyKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

impl From<UncertaintyKind> for Uncertainty {
    fn from(kind: UncertaintyKind) -> Self {
        Self { kind, min: None, max: None }
    }
}

fn gaussian<R: Rng + ?Sized>(rng: &mut R, mean: f64, std: f64) -> f64 {
    match Normal::new(mean, std) {
        Ok(n) if std > 0.0 => n.sample(rng),
        _ => mean,
    }
}

fn uniform<R: Rng + ?Sized>(rng: &mut R, low: f64, high: f64) -> f64 {
    if low < high {
        rng.gen_range(low..high)
    } else {
        low
    }
}

impl Uncertainty {
    pub fn clipped(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    pub fn apply<R: Rng + ?Sized>(&self, x: f64, rng: &mut R) -> f64 {
        let y = match self.kind {
            UncertaintyKind::AbsoluteGaussian { mean, scale } => x + gaussian(rng, mean, scale),
            UncertaintyKind::RelativeGaussian { scale } => x * (1.0 + gaussian(rng, 0.0, scale)),
            UncertaintyKind::AbsoluteUniform { low, high } => x + uniform(rng, low, high),
            UncertaintyKind::RelativeUniform { low, high } => x * uniform(rng, low, high),
            UncertaintyKind::PercentageDeviation { deviation } => {
                x * uniform(rng, 1.0 - deviation, 1.0 + deviation)
            }
        };
        self.clip(y)
    }

    fn clip(&self, mut y: f64) -> f64 {
        if let Some(lo) = self.min {
            y = y.max(lo);
        }
        if let Some(hi) = self.max {
            y = y.min(hi);
        }
        y
    }

    pub fn validate(&self) -> SimResult<()> {
        let ok = match self.kind {
            UncertaintyKind::AbsoluteGaussian { mean, scale } => mean.is_finite() && scale.is_finite() && scale >= 0.0,
            UncertaintyKind::RelativeGaussian { scale } => scale.is_finite() && scale >= 0.0,
            UncertaintyKind::AbsoluteUniform { low, high } | UncertaintyKind::RelativeUniform { low, high } => {
                low.is_finite() && high.is_finite() && low <= high
            }
            UncertaintyKind::PercentageDeviation { deviation } => deviation > 0.0 && deviation < 1.0,
        };
        if !ok {
            return Err(SimError::config(format!("invalid uncertainty parameters: {:?}", self.kind)));
        }
        if let (Some(lo), Some(hi)) = (self.min, self.max) {
            if lo > hi {
                return Err(SimError::config(format!("uncertainty clip bounds inverted: [{lo}, {hi}]")));
            }
        }
        Ok(())
    }
}

/// Model parameter families that can carry uncertainty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterClass {
    BaseDemand,
    DemandPattern,
    NodeElevation,
    PipeLength,
    PipeDiameter,
    PipeRoughness,
}

/// Per-class uncertainty, sampled once per run before the first step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UncertaintySpec(pub BTreeMap<ParameterClass, Uncertainty>);

impl UncertaintySpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, class: ParameterClass, uncertainty: impl Into<Uncertainty>) -> Self {
        self.0.insert(class, uncertainty.into());
        self
    }

    pub fn get(&self, class: ParameterClass) -> Option<&Uncertainty> {
        self.0.get(&class)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn validate(&self) -> SimResult<()> {
        self.0.values().try_for_each(Uncertainty::validate)
    }

    /// One independent draw per affected element. Classes and elements are
    /// visited in sorted order so the draw sequence only depends on the seed.
    pub fn apply<R: Rng + ?Sized>(&self, params: &ModelParameters, rng: &mut R) -> ModelParameters {
        let mut out = params.clone();
        for (class, u) in &self.0 {
            match class {
                ParameterClass::BaseDemand => perturb_all(&mut out.base_demands, u, rng),
                ParameterClass::NodeElevation => perturb_all(&mut out.node_elevations, u, rng),
                ParameterClass::PipeLength => perturb_all(&mut out.pipe_lengths, u, rng),
                ParameterClass::PipeDiameter => perturb_all(&mut out.pipe_diameters, u, rng),
                ParameterClass::PipeRoughness => perturb_all(&mut out.pipe_roughness, u, rng),
                ParameterClass::DemandPattern => {
                    for pattern in out.demand_patterns.values_mut() {
                        for m in pattern.iter_mut() {
                            *m = u.apply(*m, rng);
                        }
                    }
                }
            }
        }
        out
    }
}

fn perturb_all<R: Rng + ?Sized>(values: &mut BTreeMap<String, f64>, u: &Uncertainty, rng: &mut R) {
    for v in values.values_mut() {
        *v = u.apply(*v, rng);
    }
}

/// Measurement noise applied to every sample of every non-state sensor
/// before any sensor reading event.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorNoise {
    pub uncertainty: Uncertainty,
    pub seed: u64,
}

impl SensorNoise {
    pub fn new(uncertainty: impl Into<Uncertainty>, seed: u64) -> Self {
        Self { uncertainty: uncertainty.into(), seed }
    }

    /// Perturbs one sensor's series. Each sensor gets its own ChaCha stream
    /// and every sample draws from the block reserved for its time, so a
    /// sample's noise depends only on the seed, the sensor and the time.
    pub fn apply_series(&self, series: &[f64], times: &[u64], stream: u64) -> Vec<f64> {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        rng.set_stream(stream);
        series
            .iter()
            .zip(times)
            .map(|(&x, &t)| {
                seek_to_time(&mut rng, t);
                self.uncertainty.apply(x, &mut rng)
            })
            .collect()
    }
}

/// Stream id of a sensor, derived from its type and id only.
pub fn sensor_stream(sensor_type: &SensorType, sensor_id: &str) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(sensor_type.to_string().as_bytes());
    hasher.update(&[0]);
    hasher.update(sensor_id.as_bytes());
    let digest = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(head)
}

/// Moves `rng` to the block reserved for time `t`.
pub fn seek_to_time(rng: &mut ChaCha8Rng, t: u64) {
    rng.set_word_pos(u128::from(t) * WORDS_PER_INSTANT);
}

/// Creates the per-run RNG. Returns it with the seed actually used, drawing
/// a fresh one from OS entropy when none was configured.
pub fn run_rng(seed: Option<u64>) -> (ChaCha8Rng, u64) {
    let seed = seed.unwrap_or_else(|| rand::rngs::OsRng.next_u64());
    (ChaCha8Rng::seed_from_u64(seed), seed)
}
