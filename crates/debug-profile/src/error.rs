//! Profile loading and validation errors

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while loading or validating a debug profile.
///
/// Every variant is fatal at startup: the controller refuses to run
/// with an invalid profile.
#[derive(Debug, Error)]
pub enum ProfileError {
    /// The config file could not be read
    #[error("Failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid YAML or has the wrong shape
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A required field is missing or empty
    #[error("{0} is required")]
    MissingField(&'static str),

    /// Neither a label selector nor a field selector was given
    #[error("labelSelector or fieldSelector is required")]
    MissingSelector,

    /// The debug port is outside the NodePort range
    #[error("debugPort must be in range 30001-32766, got {0}")]
    PortOutOfRange(i32),
}
