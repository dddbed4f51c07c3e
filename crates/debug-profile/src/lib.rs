//! Debug Profile
//!
//! The immutable configuration snapshot that drives the pod-debug controller:
//! which workload to act on, which container to relaunch under the debug agent,
//! where the debug binaries live on the node and which port to expose.
//!
//! A profile is loaded once at startup and shared read-only for the lifetime
//! of the process.

pub mod error;
pub mod profile;

pub use error::ProfileError;
pub use profile::*;
