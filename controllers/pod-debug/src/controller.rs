//! Main controller implementation.
//!
//! This module contains the `Controller` struct that wires the Kubernetes
//! client, the reconciler and the watcher together for the workload kind named
//! by the debug profile.

use crate::client::KubeClusterClient;
use crate::error::ControllerError;
use crate::reconciler::Reconciler;
use crate::watcher::{watch_config, watch_workload};
use crate::workload::Workload;
use debug_profile::{DebugProfile, WorkloadKind};
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::Service;
use kube::{Api, Client};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Main controller for pod debug injection.
pub struct Controller {
    kind: WorkloadKind,
    watcher: JoinHandle<Result<(), ControllerError>>,
}

impl Controller {
    /// Creates a new controller instance and starts watching.
    pub async fn new(
        profile: Arc<DebugProfile>,
        observe_only: bool,
        shutdown: CancellationToken,
    ) -> Result<Self, ControllerError> {
        info!("Initializing pod debug controller");

        let kube_client = Client::try_default().await?;

        let kind = profile.workload_kind;
        let watcher = match kind {
            WorkloadKind::Deployment => {
                spawn_watcher::<Deployment>(kube_client, profile, observe_only, shutdown)
            }
            WorkloadKind::StatefulSet => {
                spawn_watcher::<StatefulSet>(kube_client, profile, observe_only, shutdown)
            }
        };

        Ok(Self { kind, watcher })
    }

    /// Runs until the watcher stops, either on shutdown or on failure.
    pub async fn run(self) -> Result<(), ControllerError> {
        info!(kind = %self.kind, "Controller running");

        self.watcher
            .await
            .map_err(|e| ControllerError::Watch(format!("{} watcher panicked: {}", self.kind, e)))?
            .map_err(|e| ControllerError::Watch(format!("{} watcher error: {}", self.kind, e)))?;

        info!("Controller stopped");
        Ok(())
    }
}

fn spawn_watcher<W: Workload>(
    kube_client: Client,
    profile: Arc<DebugProfile>,
    observe_only: bool,
    shutdown: CancellationToken,
) -> JoinHandle<Result<(), ControllerError>> {
    let workloads: Api<W> = Api::namespaced(kube_client.clone(), &profile.namespace);
    let services: Api<Service> = Api::namespaced(kube_client.clone(), &profile.namespace);
    let config = watch_config(&profile);

    info!(
        namespace = %profile.namespace,
        labels = ?config.label_selector,
        fields = ?config.field_selector,
        observe_only,
        "Watching {} workloads",
        W::kind(&())
    );

    let reconciler = Arc::new(Reconciler::<W, _>::new(
        Arc::new(KubeClusterClient::new(kube_client)),
        profile,
        observe_only,
        shutdown.clone(),
    ));

    tokio::spawn(watch_workload(workloads, services, config, reconciler, shutdown))
}
