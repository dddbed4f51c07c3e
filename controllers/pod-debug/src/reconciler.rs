//! Reconciliation of one workload kind.
//!
//! A pass runs fetch, observe, gate, mutate-and-write, then Service sync.
//! Everything that touches the cluster goes through [`ClusterClient`], and
//! every write is an optimistic read-modify-write under [`retry_on_conflict`].

use crate::backoff::{ConflictBackoff, FibonacciBackoff};
use crate::client::ClusterClient;
use crate::error::ControllerError;
use crate::mutator;
use crate::retry::retry_on_conflict;
use crate::service::{ServiceSynchronizer, SyncOutcome};
use crate::workload::{ObjectKey, Workload};
use debug_profile::DebugProfile;
use kube_runtime::controller::Action;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Result of one mutate-and-write attempt.
#[derive(Debug)]
enum TemplateWrite<W> {
    /// The template changed and was written back
    Written(W),
    /// The template already carried the debug agent
    Unchanged(W),
    /// The target container is not in the template
    ContainerNotFound(W),
    /// The workload disappeared between fetch and re-fetch
    Gone,
}

/// Failure streak of one object key.
#[derive(Debug, Clone, Copy)]
struct ErrorRecord {
    count: u32,
    last_failure: Instant,
}

/// Reconciles workloads of kind `W` through client `C`.
pub struct Reconciler<W, C: ?Sized> {
    client: Arc<C>,
    profile: Arc<DebugProfile>,
    services: ServiceSynchronizer,
    observe_only: bool,
    conflict_backoff: ConflictBackoff,
    requeue_backoff: FibonacciBackoff,
    /// Consecutive failures per object key
    error_counts: Mutex<HashMap<ObjectKey, ErrorRecord>>,
    shutdown: CancellationToken,
    _kind: PhantomData<fn() -> W>,
}

impl<W, C> Reconciler<W, C>
where
    W: Workload,
    C: ClusterClient<W> + ?Sized,
{
    pub fn new(
        client: Arc<C>,
        profile: Arc<DebugProfile>,
        observe_only: bool,
        shutdown: CancellationToken,
    ) -> Self {
        let conflict_backoff = ConflictBackoff::default();
        Self {
            client,
            services: ServiceSynchronizer::new(profile.clone(), conflict_backoff),
            profile,
            observe_only,
            conflict_backoff,
            requeue_backoff: FibonacciBackoff::default(),
            error_counts: Mutex::new(HashMap::new()),
            shutdown,
            _kind: PhantomData,
        }
    }

    /// Use a different conflict retry schedule for both the workload and Service writes.
    #[cfg(test)]
    pub fn with_conflict_backoff(mut self, backoff: ConflictBackoff) -> Self {
        self.conflict_backoff = backoff;
        self.services = ServiceSynchronizer::new(self.profile.clone(), backoff);
        self
    }

    /// Run one reconciliation pass for `key`.
    ///
    /// A successful pass clears the key's error count, including the pass
    /// that finds the workload deleted.
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ControllerError> {
        let action = self.reconcile_inner(key).await?;
        self.clear_errors(key);
        Ok(action)
    }

    async fn reconcile_inner(&self, key: &ObjectKey) -> Result<Action, ControllerError> {
        let Some(workload) = self.client.get_workload(key).await? else {
            debug!(workload = %key, "Workload not found, nothing to do");
            return Ok(Action::await_change());
        };

        self.observe(key, &workload);

        if self.observe_only {
            return Ok(Action::await_change());
        }

        let operation = format!("update {} {key}", W::kind(&()));
        let write = retry_on_conflict(&self.conflict_backoff, &self.shutdown, &operation, move || {
            self.write_template(key)
        })
        .await?;

        let owner = match write {
            TemplateWrite::Gone => {
                debug!(workload = %key, "Workload deleted during reconciliation");
                return Ok(Action::await_change());
            }
            TemplateWrite::Written(owner) => {
                info!(workload = %key, container = %self.profile.container_name, "Injected debug agent");
                owner
            }
            TemplateWrite::Unchanged(owner) => {
                debug!(workload = %key, "Pod template already carries the debug agent");
                owner
            }
            TemplateWrite::ContainerNotFound(owner) => {
                warn!(
                    workload = %key,
                    container = %self.profile.container_name,
                    "Target container not found in pod template, skipping mutation"
                );
                owner
            }
        };

        let labels = owner.template_labels();
        match self
            .services
            .upsert(self.client.as_ref(), &owner, &labels, &self.shutdown)
            .await?
        {
            SyncOutcome::RequeueAfter(delay) => Ok(Action::requeue(delay)),
            _ => Ok(Action::await_change()),
        }
    }

    fn observe(&self, key: &ObjectKey, workload: &W) {
        let counts = workload.replica_counts();
        let labels = workload
            .template_labels()
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join(",");
        let containers = workload
            .container_summary()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");

        info!(
            kind = %W::kind(&()),
            workload = %key,
            replicas = counts.replicas,
            ready = counts.ready,
            available = counts.available,
            labels = %labels,
            containers = %containers,
            "Observed workload"
        );
    }

    /// Re-fetch, mutate and write back the pod template.
    async fn write_template(&self, key: &ObjectKey) -> Result<TemplateWrite<W>, ControllerError> {
        let Some(mut workload) = self.client.get_workload(key).await? else {
            return Ok(TemplateWrite::Gone);
        };
        let Some(template) = workload.pod_template_mut() else {
            return Ok(TemplateWrite::ContainerNotFound(workload));
        };

        if mutator::target_index(template, &self.profile).is_none() {
            return Ok(TemplateWrite::ContainerNotFound(workload));
        }
        let patched = mutator::apply(template, &self.profile);
        if patched == *template {
            return Ok(TemplateWrite::Unchanged(workload));
        }
        *template = patched;

        let written = self.client.replace_workload(&workload).await?;
        Ok(TemplateWrite::Written(written))
    }

    /// Record a failure for `key` and return how long to wait before retrying it.
    pub fn requeue_after_error(&self, key: &ObjectKey) -> Duration {
        self.record_error(key, Instant::now())
    }

    /// A key that keeps failing is retried within `max_delay` of its last
    /// failure, so records idle for twice that long are dropped.
    fn record_error(&self, key: &ObjectKey, now: Instant) -> Duration {
        let stale_after = self.requeue_backoff.max_delay() * 2;
        match self.error_counts.lock() {
            Ok(mut counts) => {
                counts.retain(|_, record| now.saturating_duration_since(record.last_failure) <= stale_after);
                let record = counts.entry(key.clone()).or_insert(ErrorRecord {
                    count: 0,
                    last_failure: now,
                });
                record.count = record.count.saturating_add(1);
                record.last_failure = now;
                self.requeue_backoff.for_error_count(record.count)
            }
            Err(e) => {
                warn!("Failed to lock error counts: {}, using maximum backoff", e);
                self.requeue_backoff.for_error_count(u32::MAX)
            }
        }
    }

    /// Forget the failures recorded for `key`.
    pub fn clear_errors(&self, key: &ObjectKey) {
        if let Ok(mut counts) = self.error_counts.lock() {
            counts.remove(key);
        }
    }

    #[cfg(test)]
    fn tracked_errors(&self) -> usize {
        self.error_counts.lock().map(|counts| counts.len()).unwrap_or(0)
    }
}

#[cfg(test)]
#[path = "reconciler_test.rs"]
mod reconciler_test;
