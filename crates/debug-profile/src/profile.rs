//! DebugProfile definition
//!
//! Describes target selection, debug binary placement and network exposure.

use crate::error::ProfileError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// Lower bound of the NodePort range, exclusive.
pub const MIN_DEBUG_PORT: i32 = 30000;

/// Upper bound of the NodePort range, exclusive.
pub const MAX_DEBUG_PORT: i32 = 32767;

/// Node address written into the IDE attach descriptor when none is configured.
pub const DEFAULT_NODE_HOST: &str = "127.0.0.1";

/// The kind of workload the controller acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkloadKind {
    /// Replica-set style workload (`apps/v1 Deployment`)
    #[serde(rename = "deployment", alias = "replica-workload")]
    Deployment,

    /// Stable-identity workload (`apps/v1 StatefulSet`)
    #[serde(rename = "statefulset", alias = "stable-workload")]
    StatefulSet,
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkloadKind::Deployment => f.write_str("deployment"),
            WorkloadKind::StatefulSet => f.write_str("statefulset"),
        }
    }
}

/// Validated debug configuration.
///
/// Construct it with [`DebugProfile::load`] or [`DebugProfile::from_yaml_str`];
/// both run [`DebugProfile::validate`] before returning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugProfile {
    /// Debug session name, part of the companion Service name
    #[serde(default)]
    pub name: String,

    /// Namespace the target workload lives in
    #[serde(default)]
    pub namespace: String,

    /// Which workload kind to watch
    #[serde(rename = "type")]
    pub workload_kind: WorkloadKind,

    /// Label selector scoping the watch
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub label_selector: BTreeMap<String, String>,

    /// Field selector scoping the watch
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub field_selector: BTreeMap<String, String>,

    /// Name of the container to relaunch under the debug agent
    #[serde(default)]
    pub container_name: String,

    /// Original entrypoint followed by its arguments
    #[serde(default)]
    pub command_args: Vec<String>,

    /// Local project root, used for the IDE attach descriptor
    #[serde(default)]
    pub project_root_dir: String,

    /// Host path of the debug agent binary
    #[serde(default, alias = "dlvExePath")]
    pub debug_agent_host_path: String,

    /// Host path of an alternate executable to run under the debugger
    #[serde(default, alias = "debugExePath", skip_serializing_if = "Option::is_none")]
    pub replacement_executable_host_path: Option<String>,

    /// Node address the IDE attaches to
    #[serde(default = "default_node_host")]
    pub node_host: String,

    /// Debug agent listen port, also the Service node port
    #[serde(alias = "nodePort")]
    pub debug_port: i32,
}

fn default_node_host() -> String {
    DEFAULT_NODE_HOST.to_string()
}

impl DebugProfile {
    /// Read, parse and validate a profile from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ProfileError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ProfileError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&raw)
    }

    /// Parse and validate a profile from a YAML document.
    pub fn from_yaml_str(raw: &str) -> Result<Self, ProfileError> {
        let profile: DebugProfile = serde_yaml::from_str(raw)?;
        profile.validate()?;
        Ok(profile)
    }

    /// Check every field constraint.
    ///
    /// Required: `name`, `namespace`, `containerName`, `projectRootDir`,
    /// `commandArgs`, `debugAgentHostPath`, at least one selector, and a
    /// `debugPort` strictly between 30000 and 32767.
    pub fn validate(&self) -> Result<(), ProfileError> {
        let required = [
            ("name", &self.name),
            ("namespace", &self.namespace),
            ("containerName", &self.container_name),
            ("projectRootDir", &self.project_root_dir),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(ProfileError::MissingField(field));
            }
        }
        if self.command_args.is_empty() || self.command_args[0].trim().is_empty() {
            return Err(ProfileError::MissingField("commandArgs"));
        }
        if self.label_selector.is_empty() && self.field_selector.is_empty() {
            return Err(ProfileError::MissingSelector);
        }
        if self.debug_port <= MIN_DEBUG_PORT || self.debug_port >= MAX_DEBUG_PORT {
            return Err(ProfileError::PortOutOfRange(self.debug_port));
        }
        if self.debug_agent_host_path.trim().is_empty() {
            return Err(ProfileError::MissingField("debugAgentHostPath"));
        }
        Ok(())
    }

    /// The replacement executable host path, treating an empty string as unset.
    pub fn replacement_executable(&self) -> Option<&str> {
        self.replacement_executable_host_path
            .as_deref()
            .filter(|path| !path.trim().is_empty())
    }

    /// Label selector rendered as `k=v,k2=v2`, or `None` when empty.
    pub fn label_selector_query(&self) -> Option<String> {
        selector_query(&self.label_selector)
    }

    /// Field selector rendered as `k=v,k2=v2`, or `None` when empty.
    pub fn field_selector_query(&self) -> Option<String> {
        selector_query(&self.field_selector)
    }
}

fn selector_query(selector: &BTreeMap<String, String>) -> Option<String> {
    if selector.is_empty() {
        return None;
    }
    Some(
        selector
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(","),
    )
}
