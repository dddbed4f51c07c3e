//! Companion Service synchronization.
//!
//! Each reconciled workload gets exactly one NodePort Service exposing the
//! debug port on every node. The Service is controlled by the workload, so the
//! cluster garbage-collects it when the workload goes away.

use crate::backoff::ConflictBackoff;
use crate::client::ClusterClient;
use crate::error::ControllerError;
use crate::retry::retry_on_conflict;
use crate::workload::{ObjectKey, Workload};
use debug_profile::DebugProfile;
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Name of the single Service port.
pub const DEBUG_PORT_NAME: &str = "dlv";

/// Requeue delay while the owner has not been persisted yet.
pub const OWNER_PENDING_REQUEUE: Duration = Duration::from_secs(5);

/// Label marking Services managed by this controller.
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value of [`MANAGED_BY_LABEL`] on companion Services.
pub const MANAGED_BY_VALUE: &str = "pod-debug";

/// `<owner>-<profile name>-<debugPort>-dlv`
pub fn service_name(owner: &str, profile: &DebugProfile) -> String {
    format!("{}-{}-{}-dlv", owner, profile.name, profile.debug_port)
}

/// Companion Service labels: the pod selector plus the managed-by marker.
pub fn service_labels(selector_labels: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut labels = selector_labels.clone();
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());
    labels
}

/// Result of placing the owner's controller reference on a Service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnerRefOutcome {
    /// The Service is controlled by the owner
    Assigned,
    /// The owner is not persisted yet; try again later
    Retry(String),
    /// The Service cannot be owned by this owner
    Failed(String),
}

/// Makes `owner` the controller of `service`.
///
/// An existing controller reference with the owner's kind and name is taken
/// over (the owner may have been recreated under a new uid). A controller
/// reference to anything else is left alone and reported as `Failed`.
pub fn assign_controller_owner<W: Workload>(owner: &W, service: &mut Service) -> OwnerRefOutcome {
    let Some(owner_ref) = owner.controller_owner_ref(&()) else {
        return OwnerRefOutcome::Retry(format!(
            "{} {} has no uid yet",
            W::kind(&()),
            owner.name_any()
        ));
    };

    let owner_namespace = owner.namespace();
    let service_namespace = service.namespace();
    if owner_namespace != service_namespace {
        return OwnerRefOutcome::Failed(format!(
            "owner namespace {:?} differs from Service namespace {:?}",
            owner_namespace, service_namespace
        ));
    }

    let service_name = service.name_any();
    let references = service.metadata.owner_references.get_or_insert_with(Vec::new);
    match references.iter().position(|existing| existing.controller == Some(true)) {
        Some(index) => {
            let existing = &references[index];
            if existing.uid == owner_ref.uid {
                return OwnerRefOutcome::Assigned;
            }
            if existing.kind != owner_ref.kind || existing.name != owner_ref.name {
                return OwnerRefOutcome::Failed(format!(
                    "Service {} is already controlled by {} {}",
                    service_name,
                    existing.kind,
                    existing.name
                ));
            }
            references[index] = owner_ref;
        }
        None => references.push(owner_ref),
    }
    OwnerRefOutcome::Assigned
}

/// What an upsert did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Created,
    Updated,
    Unchanged,
    /// The owner is not ready to own anything yet
    RequeueAfter(Duration),
}

/// Upserts the companion Service of a workload.
#[derive(Debug, Clone)]
pub struct ServiceSynchronizer {
    profile: Arc<DebugProfile>,
    backoff: ConflictBackoff,
}

impl ServiceSynchronizer {
    pub fn new(profile: Arc<DebugProfile>, backoff: ConflictBackoff) -> Self {
        Self { profile, backoff }
    }

    /// Create or update the Service for `owner`, selecting pods by `selector_labels`.
    ///
    /// The read-modify-write runs under [`retry_on_conflict`]; a concurrent
    /// create of the same Service surfaces as a conflict and is retried as an
    /// update.
    pub async fn upsert<W, C>(
        &self,
        client: &C,
        owner: &W,
        selector_labels: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<SyncOutcome, ControllerError>
    where
        W: Workload,
        C: ClusterClient<W> + ?Sized,
    {
        let owner_key = ObjectKey::of(owner);
        let key = ObjectKey::new(
            owner_key.namespace.clone(),
            service_name(&owner_key.name, &self.profile),
        );
        let operation = format!("upsert Service {key}");
        let key = &key;

        let outcome = retry_on_conflict(&self.backoff, cancel, &operation, move || {
            self.sync_once(client, owner, key, selector_labels)
        })
        .await?;

        match outcome {
            SyncOutcome::Created => info!(service = %key, owner = %owner_key, "Created debug Service"),
            SyncOutcome::Updated => info!(service = %key, owner = %owner_key, "Updated debug Service"),
            SyncOutcome::Unchanged => debug!(service = %key, "Debug Service up to date"),
            SyncOutcome::RequeueAfter(_) => {}
        }
        Ok(outcome)
    }

    async fn sync_once<W, C>(
        &self,
        client: &C,
        owner: &W,
        key: &ObjectKey,
        selector_labels: &BTreeMap<String, String>,
    ) -> Result<SyncOutcome, ControllerError>
    where
        W: Workload,
        C: ClusterClient<W> + ?Sized,
    {
        let current = client.get_service(key).await?;
        let mut desired = current.clone().unwrap_or_else(|| Service {
            metadata: ObjectMeta {
                name: Some(key.name.clone()),
                namespace: Some(key.namespace.clone()),
                ..Default::default()
            },
            ..Default::default()
        });
        self.apply_desired_shape(&mut desired, selector_labels);

        match assign_controller_owner(owner, &mut desired) {
            OwnerRefOutcome::Assigned => {}
            OwnerRefOutcome::Retry(reason) => {
                debug!(service = %key, reason = %reason, "Owner not persisted yet, requeueing");
                return Ok(SyncOutcome::RequeueAfter(OWNER_PENDING_REQUEUE));
            }
            OwnerRefOutcome::Failed(reason) => {
                return Err(ControllerError::OwnerReference(reason));
            }
        }

        match current {
            None => {
                client.create_service(&desired).await?;
                Ok(SyncOutcome::Created)
            }
            Some(current) if current == desired => Ok(SyncOutcome::Unchanged),
            Some(_) => {
                client.replace_service(&desired).await?;
                Ok(SyncOutcome::Updated)
            }
        }
    }

    /// Overwrite labels, type, ports and selector; everything else the API
    /// server filled in (cluster IP and friends) is kept.
    fn apply_desired_shape(&self, service: &mut Service, selector_labels: &BTreeMap<String, String>) {
        let port = self.profile.debug_port;
        service.metadata.labels = Some(service_labels(selector_labels));

        let spec = service.spec.get_or_insert_with(ServiceSpec::default);
        spec.type_ = Some("NodePort".to_string());
        spec.selector = Some(selector_labels.clone());
        spec.ports = Some(vec![ServicePort {
            name: Some(DEBUG_PORT_NAME.to_string()),
            protocol: Some("TCP".to_string()),
            port,
            target_port: Some(IntOrString::Int(port)),
            node_port: Some(port),
            ..Default::default()
        }]);
    }
}
