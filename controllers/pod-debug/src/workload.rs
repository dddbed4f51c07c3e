//! Uniform view over the supported workload kinds.
//!
//! `Deployment` and `StatefulSet` are structurally identical as far as this
//! controller is concerned: both carry a pod template, replica status and
//! standard object metadata. The [`Workload`] trait captures exactly that so
//! the reconciler, mutator and service synchronizer are written once.

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::core::v1::PodTemplateSpec;
use kube::{Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fmt::{self, Debug};

/// Replica counts reported in a workload's status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplicaCounts {
    pub replicas: i32,
    pub ready: i32,
    pub available: i32,
}

/// A namespaced workload that owns a pod template.
///
/// Owner-reference capability comes from [`kube::Resource`]
/// (`controller_owner_ref`), which every implementor already provides.
pub trait Workload:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    /// The pod template, if the object carries a spec.
    fn pod_template(&self) -> Option<&PodTemplateSpec>;

    /// Mutable access to the pod template, if the object carries a spec.
    fn pod_template_mut(&mut self) -> Option<&mut PodTemplateSpec>;

    /// Replica, ready and available counts from the status.
    fn replica_counts(&self) -> ReplicaCounts;

    /// Labels of the pod template, used as the companion Service selector.
    fn template_labels(&self) -> BTreeMap<String, String> {
        self.pod_template()
            .and_then(|template| template.metadata.as_ref())
            .and_then(|metadata| metadata.labels.clone())
            .unwrap_or_default()
    }

    /// `name` + `image` of every container in the template, in order.
    fn container_summary(&self) -> Vec<ContainerSummary> {
        self.pod_template()
            .and_then(|template| template.spec.as_ref())
            .map(|spec| {
                spec.containers
                    .iter()
                    .map(|container| ContainerSummary {
                        name: container.name.clone(),
                        image: container.image.clone().unwrap_or_default(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Workload for Deployment {
    fn pod_template(&self) -> Option<&PodTemplateSpec> {
        self.spec.as_ref().map(|spec| &spec.template)
    }

    fn pod_template_mut(&mut self) -> Option<&mut PodTemplateSpec> {
        self.spec.as_mut().map(|spec| &mut spec.template)
    }

    fn replica_counts(&self) -> ReplicaCounts {
        self.status
            .as_ref()
            .map(|status| ReplicaCounts {
                replicas: status.replicas.unwrap_or_default(),
                ready: status.ready_replicas.unwrap_or_default(),
                available: status.available_replicas.unwrap_or_default(),
            })
            .unwrap_or_default()
    }
}

impl Workload for StatefulSet {
    fn pod_template(&self) -> Option<&PodTemplateSpec> {
        self.spec.as_ref().map(|spec| &spec.template)
    }

    fn pod_template_mut(&mut self) -> Option<&mut PodTemplateSpec> {
        self.spec.as_mut().map(|spec| &mut spec.template)
    }

    fn replica_counts(&self) -> ReplicaCounts {
        self.status
            .as_ref()
            .map(|status| ReplicaCounts {
                replicas: status.replicas,
                ready: status.ready_replicas.unwrap_or_default(),
                available: status.available_replicas.unwrap_or_default(),
            })
            .unwrap_or_default()
    }
}

/// A container's name and image, as logged by the observe step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub name: String,
    pub image: String,
}

impl fmt::Display for ContainerSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.image)
    }
}

/// Identity of a namespaced object, the key reconciliation is serialized on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of an existing object; objects without a namespace fall back to `default`.
    pub fn of<K: Resource>(object: &K) -> Self {
        Self::new(
            object.namespace().unwrap_or_else(|| "default".to_string()),
            object.name_any(),
        )
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
