//! Core domain types, configuration, and library-wide error structures.

pub mod config;
pub mod types;

pub use config::*;
pub use types::*;

/// Pipeline and model errors surfaced by the API.
///
/// Most error conditions inside the pipeline degrade to fallback models
/// rather than surfacing here; only repository-level misconfiguration (for
/// example, no usable input series at all) propagates to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimError {
    /// Input validation error.
    InvalidInput(String),
    /// Too few observations for stable fitting where no fallback exists.
    DataInsufficiency(String),
    /// Unequal dimensions that could not be reconciled by truncation.
    DimensionMismatch(String),
    /// A distribution parameter reached a sampler in an invalid state.
    InvalidDistributionParameter(String),
    /// An uncaught failure during path synthesis or diagnostics.
    SimulationFailure(String),
    /// An expected on-disk artifact, such as a trial log, was absent or
    /// unreadable.
    MissingArtifact(String),
}

impl std::fmt::Display for SimError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Self::DataInsufficiency(msg) => write!(f, "insufficient data: {msg}"),
            Self::DimensionMismatch(msg) => write!(f, "dimension mismatch: {msg}"),
            Self::InvalidDistributionParameter(msg) => {
                write!(f, "invalid distribution parameter: {msg}")
            }
            Self::SimulationFailure(msg) => write!(f, "simulation failure: {msg}"),
            Self::MissingArtifact(msg) => write!(f, "missing artifact: {msg}"),
        }
    }
}

impl std::error::Error for SimError {}
