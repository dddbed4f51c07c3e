//! Kubernetes resource watcher.
//!
//! Binds the reconciler to `kube_runtime::Controller`: the controller owns the
//! watch cache, deduplicates events per object and never runs two
//! reconciliations of the same object at once.

use crate::client::ClusterClient;
use crate::error::ControllerError;
use crate::reconciler::Reconciler;
use crate::service::{MANAGED_BY_LABEL, MANAGED_BY_VALUE};
use crate::workload::{ObjectKey, Workload};
use debug_profile::DebugProfile;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Service;
use kube::Api;
use kube_runtime::{Controller, controller::{Action, Config as ControllerConfig}, watcher};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Reconciliations running at once, across all objects.
pub const RECONCILE_CONCURRENCY: u16 = 4;

/// Upper bound on a single reconciliation pass.
pub const RECONCILE_DEADLINE: Duration = Duration::from_secs(60);

/// Watch configuration scoped by the profile's label and field selectors.
pub fn watch_config(profile: &DebugProfile) -> watcher::Config {
    let mut config = watcher::Config::default();
    if let Some(labels) = profile.label_selector_query() {
        config = config.labels(&labels);
    }
    if let Some(fields) = profile.field_selector_query() {
        config = config.fields(&fields);
    }
    config
}

/// Watch configuration for companion Services: only those carrying the
/// managed-by marker are cached.
pub fn owned_service_config() -> watcher::Config {
    watcher::Config::default().labels(&format!("{MANAGED_BY_LABEL}={MANAGED_BY_VALUE}"))
}

async fn reconcile_with_deadline<W, C>(
    reconciler: &Reconciler<W, C>,
    key: &ObjectKey,
    deadline: Duration,
) -> Result<Action, ControllerError>
where
    W: Workload,
    C: ClusterClient<W> + ?Sized,
{
    match tokio::time::timeout(deadline, reconciler.reconcile(key)).await {
        Ok(result) => result,
        Err(_) => Err(ControllerError::Cancelled(format!("{key} did not finish within {deadline:?}"))),
    }
}

/// Requeue a failed object after its Fibonacci backoff delay.
fn error_policy<W, C>(obj: Arc<W>, error: &ControllerError, ctx: Arc<Reconciler<W, C>>) -> Action
where
    W: Workload,
    C: ClusterClient<W> + ?Sized,
{
    let key = ObjectKey::of(obj.as_ref());
    let delay = ctx.requeue_after_error(&key);
    match error {
        ControllerError::Cancelled(_) => warn!(workload = %key, "Reconciliation cancelled: {}", error),
        _ => error!(workload = %key, "Reconciliation failed: {}", error),
    }
    debug!(workload = %key, requeue_secs = delay.as_secs(), "Requeueing after error");
    Action::requeue(delay)
}

/// Watch workloads of kind `W` and reconcile every change until `shutdown` fires.
///
/// Changes to owned Services re-trigger their owning workload.
pub async fn watch_workload<W, C>(
    api: Api<W>,
    services: Api<Service>,
    config: watcher::Config,
    reconciler: Arc<Reconciler<W, C>>,
    shutdown: CancellationToken,
) -> Result<(), ControllerError>
where
    W: Workload,
    C: ClusterClient<W> + ?Sized + 'static,
{
    let kind = W::kind(&()).to_string();
    info!(kind = %kind, "Starting workload watcher");

    let reconcile = |obj: Arc<W>, ctx: Arc<Reconciler<W, C>>| async move {
        let key = ObjectKey::of(obj.as_ref());
        reconcile_with_deadline(ctx.as_ref(), &key, RECONCILE_DEADLINE).await
    };

    let controller_config = ControllerConfig::default().concurrency(RECONCILE_CONCURRENCY);

    let events = Controller::new(api, config)
        .owns(services, owned_service_config())
        .with_config(controller_config)
        .run(reconcile, error_policy::<W, C>, reconciler)
        .for_each(|res| async move {
            match res {
                Ok((object, _)) => debug!("Reconciled {}", object),
                Err(e) => warn!("Controller error: {}", e),
            }
        });

    tokio::select! {
        () = events => {
            warn!(kind = %kind, "Workload watch stream ended");
            Err(ControllerError::Watch(format!("{kind} watch stream ended")))
        }
        () = shutdown.cancelled() => {
            info!(kind = %kind, "Shutdown requested, stopping workload watcher");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockClusterClient, container, deployment, profile};
    use k8s_openapi::api::apps::v1::Deployment;
    use std::collections::BTreeMap;

    type TestReconciler = Reconciler<Deployment, MockClusterClient<Deployment>>;

    fn reconciler(client: Arc<MockClusterClient<Deployment>>) -> Arc<TestReconciler> {
        Arc::new(Reconciler::new(client, Arc::new(profile()), false, CancellationToken::new()))
    }

    fn api_deployment() -> Deployment {
        deployment("api", "dev", vec![container("server", &["/app/server"])])
    }

    #[test]
    fn test_watch_config_renders_both_selectors() {
        let mut profile = profile();
        profile.label_selector =
            BTreeMap::from([("tier".to_string(), "web".to_string()), ("app".to_string(), "api".to_string())]);
        profile.field_selector = BTreeMap::from([("metadata.name".to_string(), "api".to_string())]);

        let config = watch_config(&profile);

        assert_eq!(config.label_selector.as_deref(), Some("app=api,tier=web"));
        assert_eq!(config.field_selector.as_deref(), Some("metadata.name=api"));
    }

    #[test]
    fn test_watch_config_skips_empty_selector() {
        let mut profile = profile();
        profile.field_selector.clear();

        let config = watch_config(&profile);

        assert_eq!(config.label_selector.as_deref(), Some("app=api"));
        assert!(config.field_selector.is_none());
    }

    #[test]
    fn test_owned_services_are_scoped_to_marker_label() {
        let config = owned_service_config();

        assert_eq!(
            config.label_selector.as_deref(),
            Some("app.kubernetes.io/managed-by=pod-debug")
        );
        assert!(config.field_selector.is_none());
    }

    #[tokio::test]
    async fn test_reconcile_past_deadline_is_cancelled() {
        let client = Arc::new(MockClusterClient::new().with_workload(api_deployment()));
        client.hang_next_get();
        let reconciler = reconciler(client.clone());

        let result =
            reconcile_with_deadline(reconciler.as_ref(), &ObjectKey::new("dev", "api"), Duration::from_millis(20))
                .await;

        assert!(matches!(result, Err(ControllerError::Cancelled(_))));
        assert_eq!(client.writes(), 0);
    }

    #[tokio::test]
    async fn test_reconcile_within_deadline_returns_action() {
        let client = Arc::new(MockClusterClient::new().with_workload(api_deployment()));
        let reconciler = reconciler(client.clone());

        let action = reconcile_with_deadline(reconciler.as_ref(), &ObjectKey::new("dev", "api"), RECONCILE_DEADLINE)
            .await
            .unwrap();

        assert_eq!(action, Action::await_change());
        assert_eq!(client.service_count(), 1);
    }

    #[test]
    fn test_error_policy_requeues_with_growing_delay() {
        let reconciler = reconciler(Arc::new(MockClusterClient::new()));
        let obj = Arc::new(api_deployment());
        let error = ControllerError::Cancelled("dev/api did not finish".to_string());

        let delays: Vec<Action> = (0..3)
            .map(|_| error_policy(obj.clone(), &error, reconciler.clone()))
            .collect();

        assert_eq!(
            delays,
            vec![
                Action::requeue(Duration::from_secs(5)),
                Action::requeue(Duration::from_secs(10)),
                Action::requeue(Duration::from_secs(15)),
            ]
        );
    }

    #[tokio::test]
    async fn test_error_policy_backoff_resets_after_success() {
        let client = Arc::new(MockClusterClient::new().with_workload(api_deployment()));
        let reconciler = reconciler(client);
        let obj = Arc::new(api_deployment());
        let error = ControllerError::Watch("stream reset".to_string());

        error_policy(obj.clone(), &error, reconciler.clone());
        error_policy(obj.clone(), &error, reconciler.clone());
        reconcile_with_deadline(reconciler.as_ref(), &ObjectKey::of(obj.as_ref()), RECONCILE_DEADLINE)
            .await
            .unwrap();

        assert_eq!(
            error_policy(obj, &error, reconciler),
            Action::requeue(Duration::from_secs(5))
        );
    }
}
