//! Error types for powerlens

use std::io;
use thiserror::Error;

use crate::device::DeviceRole;

/// Result type alias for powerlens operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// NVML error (NVIDIA GPUs)
    #[cfg(feature = "nvidia")]
    #[error("NVML error: {0}")]
    Nvml(#[from] nvml_wrapper::error::NvmlError),

    /// Two compiled-in backends claim the same name within one role
    #[error("multiple {role} backends attempting to register with name {name:?}")]
    DuplicateBackend { role: DeviceRole, name: String },

    /// Model weights do not fit the predictor family
    #[error("{family} predictor: invalid model weights: {reason}")]
    InvalidModelWeights { family: String, reason: String },

    /// Predictor family name is not known
    #[error("unknown predictor family {0:?}")]
    UnknownPredictor(String),

    /// Backend name is not registered
    #[error("unsupported device {name:?}; supported devices are {supported:?}")]
    UnsupportedType { name: String, supported: Vec<String> },

    /// Nothing matched a lookup
    #[error("not found: {0}")]
    NotFound(String),

    /// Backend or device does not provide the requested data
    #[error("not supported: {0}")]
    NotSupported(String),

    /// No counter path exists for an energy event
    #[error("could not read RAPL energy for {0}")]
    EventNotFound(String),

    /// Parse error
    #[error("parse error: {0}")]
    Parse(String),

    /// Start/stop failure of a backend
    #[error("lifecycle error: {0}")]
    Lifecycle(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Errors that indicate a broken build or deployment rather than a
    /// hardware capability difference. Callers should terminate on these.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::DuplicateBackend { .. }
                | Error::InvalidModelWeights { .. }
                | Error::UnknownPredictor(_)
                | Error::Config(_)
        )
    }

    /// Errors that only mean "this node does not have that capability".
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Error::UnsupportedType { .. }
                | Error::NotFound(_)
                | Error::NotSupported(_)
                | Error::EventNotFound(_)
        )
    }
}
