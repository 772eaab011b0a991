//! Errors that can occur while building, training or persisting a flow.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    /// A configuration value is out of range, e.g. bin minimums that cannot sum to one.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Dimension mismatch: expected {expected}, found {found}")]
    DimensionMismatch { expected: usize, found: usize },

    /// A dimension is never transformed, or never conditioned on, by any layer.
    #[error("Dimension {dimension} is not covered by the masks: it must be transformed by one layer and conditioned on in another")]
    MaskCoverage { dimension: usize },

    #[error("Unknown {kind}: '{key}'")]
    UnknownKey { kind: &'static str, key: String },

    /// A stored checkpoint does not fit the structure of the flow.
    #[error("Checkpoint mismatch: {0}")]
    CheckpointMismatch(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, FlowError>;
