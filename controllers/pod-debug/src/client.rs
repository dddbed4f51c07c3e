//! Cluster client seam.
//!
//! The reconciler talks to the API server only through [`ClusterClient`], so
//! unit tests can substitute an in-memory store with injectable conflicts.
//! [`KubeClusterClient`] is the production implementation on top of `kube::Api`.

use crate::error::ControllerError;
use crate::workload::{ObjectKey, Workload};
use k8s_openapi::api::core::v1::Service;
use kube::api::PostParams;
use kube::{Api, Client};

/// Read/write operations the controller needs against the cluster.
///
/// Writes are optimistic: `replace_*` carries the object's `resourceVersion`
/// and fails with [`ControllerError::Conflict`] if the stored object moved on.
#[async_trait::async_trait]
pub trait ClusterClient<W: Workload>: Send + Sync {
    /// Fetch a workload; `Ok(None)` if it does not exist.
    async fn get_workload(&self, key: &ObjectKey) -> Result<Option<W>, ControllerError>;

    /// Write a workload back.
    async fn replace_workload(&self, workload: &W) -> Result<W, ControllerError>;

    /// Fetch a Service; `Ok(None)` if it does not exist.
    async fn get_service(&self, key: &ObjectKey) -> Result<Option<Service>, ControllerError>;

    /// Create a Service. An existing Service of the same name is a conflict.
    async fn create_service(&self, service: &Service) -> Result<Service, ControllerError>;

    /// Write an existing Service back.
    async fn replace_service(&self, service: &Service) -> Result<Service, ControllerError>;
}

/// [`ClusterClient`] backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl<W: Workload> ClusterClient<W> for KubeClusterClient {
    async fn get_workload(&self, key: &ObjectKey) -> Result<Option<W>, ControllerError> {
        let api: Api<W> = Api::namespaced(self.client.clone(), &key.namespace);
        api.get_opt(&key.name).await.map_err(ControllerError::from_kube)
    }

    async fn replace_workload(&self, workload: &W) -> Result<W, ControllerError> {
        let key = ObjectKey::of(workload);
        let api: Api<W> = Api::namespaced(self.client.clone(), &key.namespace);
        api.replace(&key.name, &PostParams::default(), workload)
            .await
            .map_err(ControllerError::from_kube)
    }

    async fn get_service(&self, key: &ObjectKey) -> Result<Option<Service>, ControllerError> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), &key.namespace);
        api.get_opt(&key.name).await.map_err(ControllerError::from_kube)
    }

    async fn create_service(&self, service: &Service) -> Result<Service, ControllerError> {
        let key = ObjectKey::of(service);
        let api: Api<Service> = Api::namespaced(self.client.clone(), &key.namespace);
        api.create(&PostParams::default(), service)
            .await
            .map_err(ControllerError::from_kube)
    }

    async fn replace_service(&self, service: &Service) -> Result<Service, ControllerError> {
        let key = ObjectKey::of(service);
        let api: Api<Service> = Api::namespaced(self.client.clone(), &key.namespace);
        api.replace(&key.name, &PostParams::default(), service)
            .await
            .map_err(ControllerError::from_kube)
    }
}
