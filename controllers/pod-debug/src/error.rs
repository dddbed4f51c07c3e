//! Controller-specific error types.
//!
//! Kubernetes errors are classified where they enter the controller (see
//! [`ControllerError::from_kube`]). Write conflicts are retried locally; every
//! other failure is handed back to the controller runtime.

use kube::Error as KubeError;
use thiserror::Error;

/// Errors that can occur in the pod-debug controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error other than a write conflict
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// The object changed between read and write (HTTP 409)
    #[error("Write conflict on {0}")]
    Conflict(String),

    /// Conflict retry budget spent without a successful write
    #[error("Gave up after {attempts} conflicting writes: {last}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        last: Box<ControllerError>,
    },

    /// Reconciliation abandoned because of shutdown or deadline
    #[error("Reconciliation cancelled: {0}")]
    Cancelled(String),

    /// The owner reference could not be placed on the companion Service
    #[error("Owner reference could not be set: {0}")]
    OwnerReference(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),
}

impl ControllerError {
    /// Classifies a Kubernetes client error.
    ///
    /// HTTP 409 becomes [`ControllerError::Conflict`], everything else stays
    /// a [`ControllerError::Kube`].
    pub fn from_kube(error: KubeError) -> Self {
        match &error {
            KubeError::Api(response) if response.code == 409 => {
                ControllerError::Conflict(error.to_string())
            }
            _ => ControllerError::Kube(error),
        }
    }

    /// Whether this is a write conflict that may succeed on a fresh read.
    pub fn is_conflict(&self) -> bool {
        matches!(self, ControllerError::Conflict(_))
    }
}

