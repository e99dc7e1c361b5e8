use thiserror::Error;

/// Errors raised by the scenario overlay.
///
/// Configuration errors are only ever produced while a scenario is being
/// assembled; solver and control-module errors are fatal to the run that
/// produced them. Nothing in this crate retries.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SimError {
    /// Invalid id reference, malformed time window, mismatched sequence length.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// The physics solver failed while computing a step.
    #[error("solver error at step {step} (t={time}s): {message}")]
    Solver { step: usize, time: u64, message: String },
    /// User-supplied control logic failed.
    #[error("control module '{module}' failed at step {step}: {message}")]
    ControlModule { module: String, step: usize, message: String },
    /// Operation not permitted in the current simulation state.
    #[error("invalid state: {0}")]
    State(String),
}

/// A type alias for `Result<T, SimError>`.
pub type SimResult<T> = Result<T, SimError>;

impl SimError {
    pub fn config(msg: impl Into<String>) -> Self {
        SimError::Configuration(msg.into())
    }

    pub fn state(msg: impl Into<String>) -> Self {
        SimError::State(msg.into())
    }

    /// True for the two failure kinds that abort a running simulation.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SimError::Solver { .. } | SimError::ControlModule { .. })
    }
}

impl From<config::ConfigError> for SimError {
    fn from(err: config::ConfigError) -> Self {
        SimError::Configuration(err.to_string())
    }
}

impl From<toml::de::Error> for SimError {
    fn from(err: toml::de::Error) -> Self {
        SimError::Configuration(err.to_string())
    }
}

impl From<toml::ser::Error> for SimError {
    fn from(err: toml::ser::Error) -> Self {
        SimError::Configuration(err.to_string())
    }
}
