//! Test utilities for unit testing the mutator, synchronizer and reconciler
//!
//! Builders for workloads and profiles, plus an in-memory [`MockClusterClient`]
//! that enforces `resourceVersion` on writes and can inject conflicts.

use crate::backoff::ConflictBackoff;
use crate::client::ClusterClient;
use crate::error::ControllerError;
use crate::workload::{ObjectKey, Workload};
use debug_profile::{DebugProfile, WorkloadKind};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::{Resource, ResourceExt};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

/// Container with image `registry/<name>:1` and the given command
pub fn container(name: &str, command: &[&str]) -> Container {
    Container {
        name: name.to_string(),
        image: Some(format!("registry/{name}:1")),
        command: Some(command.iter().map(|part| part.to_string()).collect()),
        ..Default::default()
    }
}

fn app_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("app".to_string(), name.to_string())])
}

/// Pod template labelled `app=<name>`
pub fn pod_template(name: &str, containers: Vec<Container>) -> PodTemplateSpec {
    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(app_labels(name)),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            containers,
            ..Default::default()
        }),
    }
}

fn persisted_meta(name: &str, namespace: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        uid: Some(format!("uid-{namespace}-{name}")),
        resource_version: Some("1".to_string()),
        ..Default::default()
    }
}

/// Persisted Deployment (uid and resourceVersion set)
pub fn deployment(name: &str, namespace: &str, containers: Vec<Container>) -> Deployment {
    Deployment {
        metadata: persisted_meta(name, namespace),
        spec: Some(DeploymentSpec {
            selector: LabelSelector {
                match_labels: Some(app_labels(name)),
                ..Default::default()
            },
            template: pod_template(name, containers),
            ..Default::default()
        }),
        status: None,
    }
}

/// Persisted StatefulSet (uid and resourceVersion set)
pub fn statefulset(name: &str, namespace: &str, containers: Vec<Container>) -> StatefulSet {
    StatefulSet {
        metadata: persisted_meta(name, namespace),
        spec: Some(StatefulSetSpec {
            selector: LabelSelector {
                match_labels: Some(app_labels(name)),
                ..Default::default()
            },
            template: pod_template(name, containers),
            ..Default::default()
        }),
        status: None,
    }
}

/// Profile targeting container `server` on port 31000
pub fn profile() -> DebugProfile {
    DebugProfile {
        name: "session".to_string(),
        namespace: "dev".to_string(),
        workload_kind: WorkloadKind::Deployment,
        label_selector: BTreeMap::from([("app".to_string(), "api".to_string())]),
        field_selector: BTreeMap::new(),
        container_name: "server".to_string(),
        command_args: vec!["/app/server".to_string(), "--flag=1".to_string()],
        project_root_dir: "/home/dev/api".to_string(),
        debug_agent_host_path: "/opt/dlv/dlv".to_string(),
        replacement_executable_host_path: None,
        node_host: "127.0.0.1".to_string(),
        debug_port: 31000,
    }
}

/// Five-attempt conflict schedule with millisecond sleeps
pub fn fast_backoff() -> ConflictBackoff {
    ConflictBackoff {
        steps: 5,
        initial: Duration::from_millis(1),
        factor: 2,
        cap: Duration::from_millis(5),
    }
}

/// Consume one unit of an injected-failure budget.
fn take_one(budget: &AtomicU32) -> bool {
    budget
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
        .is_ok()
}

/// In-memory cluster with optimistic concurrency.
///
/// Every successful write bumps the stored `resourceVersion`. A write whose
/// `resourceVersion` differs from the stored one is rejected as a conflict.
pub struct MockClusterClient<W> {
    workloads: Mutex<HashMap<ObjectKey, W>>,
    services: Mutex<HashMap<ObjectKey, Service>>,
    /// Workload writes to reject with a conflict before accepting one
    injected_conflicts: AtomicU32,
    /// Service creates and replaces to reject with a conflict
    injected_service_conflicts: AtomicU32,
    fail_get: AtomicBool,
    hang_get: AtomicBool,
    hide_service: AtomicBool,
    pub workload_writes: AtomicU32,
    pub service_creates: AtomicU32,
    pub service_replaces: AtomicU32,
}

impl<W: Workload> MockClusterClient<W> {
    pub fn new() -> Self {
        Self {
            workloads: Mutex::new(HashMap::new()),
            services: Mutex::new(HashMap::new()),
            injected_conflicts: AtomicU32::new(0),
            injected_service_conflicts: AtomicU32::new(0),
            fail_get: AtomicBool::new(false),
            hang_get: AtomicBool::new(false),
            hide_service: AtomicBool::new(false),
            workload_writes: AtomicU32::new(0),
            service_creates: AtomicU32::new(0),
            service_replaces: AtomicU32::new(0),
        }
    }

    pub fn with_workload(self, workload: W) -> Self {
        self.workloads
            .lock()
            .unwrap()
            .insert(ObjectKey::of(&workload), workload);
        self
    }

    pub fn with_service(self, service: Service) -> Self {
        self.services
            .lock()
            .unwrap()
            .insert(ObjectKey::of(&service), service);
        self
    }

    /// Reject the next `count` workload writes with a conflict.
    pub fn inject_conflicts(&self, count: u32) {
        self.injected_conflicts.store(count, Ordering::SeqCst);
    }

    /// Reject the next `count` Service writes with a conflict.
    pub fn inject_service_conflicts(&self, count: u32) {
        self.injected_service_conflicts.store(count, Ordering::SeqCst);
    }

    /// Fail the next workload read with a transport error.
    pub fn fail_next_get(&self) {
        self.fail_get.store(true, Ordering::SeqCst);
    }

    /// Make the next workload read never complete.
    pub fn hang_next_get(&self) {
        self.hang_get.store(true, Ordering::SeqCst);
    }

    /// Report the next Service read as missing even if it exists, as a
    /// stale cache would while another writer creates it.
    pub fn hide_next_service_get(&self) {
        self.hide_service.store(true, Ordering::SeqCst);
    }

    pub fn remove_workload(&self, key: &ObjectKey) {
        self.workloads.lock().unwrap().remove(key);
    }

    pub fn workload(&self, key: &ObjectKey) -> Option<W> {
        self.workloads.lock().unwrap().get(key).cloned()
    }

    pub fn service(&self, key: &ObjectKey) -> Option<Service> {
        self.services.lock().unwrap().get(key).cloned()
    }

    pub fn service_count(&self) -> usize {
        self.services.lock().unwrap().len()
    }

    pub fn writes(&self) -> u32 {
        self.workload_writes.load(Ordering::SeqCst)
            + self.service_creates.load(Ordering::SeqCst)
            + self.service_replaces.load(Ordering::SeqCst)
    }
}

fn next_version<K: Resource>(stored: &K) -> String {
    let current: u64 = stored
        .resource_version()
        .and_then(|version| version.parse().ok())
        .unwrap_or(0);
    (current + 1).to_string()
}

fn check_version<K: Resource>(stored: &K, incoming: &K, key: &ObjectKey) -> Result<(), ControllerError> {
    if stored.resource_version() != incoming.resource_version() {
        return Err(ControllerError::Conflict(format!(
            "{key}: stored resourceVersion {:?}, write carried {:?}",
            stored.resource_version(),
            incoming.resource_version()
        )));
    }
    Ok(())
}

#[async_trait::async_trait]
impl<W: Workload> ClusterClient<W> for MockClusterClient<W> {
    async fn get_workload(&self, key: &ObjectKey) -> Result<Option<W>, ControllerError> {
        if self.fail_get.swap(false, Ordering::SeqCst) {
            return Err(ControllerError::Kube(kube::Error::Service(Box::new(
                std::io::Error::other("injected transport failure"),
            ))));
        }
        if self.hang_get.swap(false, Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(self.workloads.lock().unwrap().get(key).cloned())
    }

    async fn replace_workload(&self, workload: &W) -> Result<W, ControllerError> {
        let key = ObjectKey::of(workload);
        let mut workloads = self.workloads.lock().unwrap();
        let Some(stored) = workloads.get(&key) else {
            return Err(ControllerError::Kube(kube::Error::Service(Box::new(
                std::io::Error::other(format!("{key} not found")),
            ))));
        };

        if take_one(&self.injected_conflicts) {
            return Err(ControllerError::Conflict(format!("{key}: injected conflict")));
        }
        check_version(stored, workload, &key)?;

        let mut written = workload.clone();
        written.meta_mut().resource_version = Some(next_version(stored));
        workloads.insert(key, written.clone());
        self.workload_writes.fetch_add(1, Ordering::SeqCst);
        Ok(written)
    }

    async fn get_service(&self, key: &ObjectKey) -> Result<Option<Service>, ControllerError> {
        if self.hide_service.swap(false, Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(self.services.lock().unwrap().get(key).cloned())
    }

    async fn create_service(&self, service: &Service) -> Result<Service, ControllerError> {
        let key = ObjectKey::of(service);
        if take_one(&self.injected_service_conflicts) {
            return Err(ControllerError::Conflict(format!("{key}: injected conflict")));
        }
        let mut services = self.services.lock().unwrap();
        if services.contains_key(&key) {
            return Err(ControllerError::Conflict(format!("{key} already exists")));
        }

        let mut written = service.clone();
        written.meta_mut().resource_version = Some("1".to_string());
        written.meta_mut().uid = Some(format!("uid-service-{}", key.name));
        services.insert(key, written.clone());
        self.service_creates.fetch_add(1, Ordering::SeqCst);
        Ok(written)
    }

    async fn replace_service(&self, service: &Service) -> Result<Service, ControllerError> {
        let key = ObjectKey::of(service);
        let mut services = self.services.lock().unwrap();
        let Some(stored) = services.get(&key) else {
            return Err(ControllerError::Kube(kube::Error::Service(Box::new(
                std::io::Error::other(format!("{key} not found")),
            ))));
        };
        if take_one(&self.injected_service_conflicts) {
            return Err(ControllerError::Conflict(format!("{key}: injected conflict")));
        }
        check_version(stored, service, &key)?;

        let mut written = service.clone();
        written.meta_mut().resource_version = Some(next_version(stored));
        services.insert(key, written.clone());
        self.service_replaces.fetch_add(1, Ordering::SeqCst);
        Ok(written)
    }
}
