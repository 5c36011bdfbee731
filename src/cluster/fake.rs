//! In-memory [`ClusterApi`] for tests
//!
//! Behaves like a tiny API server: objects get a uid and resourceVersion on
//! create, a create carrying a resourceVersion is rejected, and `replace_*`
//! with a stale resourceVersion fails with a conflict. Every call is recorded
//! (stamped with the shared `MockClock` when one is attached) so tests can assert
//! on step ordering and on the absence of mutations.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::{ClusterApi, ClusterError};
use crate::controller::clock::{Clock, MockClock};
use crate::controller::labels::LabelMap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStatus, ReplicaSet};
use k8s_openapi::api::batch::v1::{CronJob, CronJobSpec, JobSpec, JobTemplateSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerStatus, Pod, PodSpec, PodStatus, PodTemplateSpec, Service, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::api::DeleteParams;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

/// Operations that change cluster state
const MUTATING_OPS: &[&str] = &[
    "create_deployment",
    "replace_deployment",
    "delete_deployment",
    "create_service",
    "replace_service",
    "delete_service",
    "replace_cronjob",
    "rollback_deployment",
];

/// A recorded call against the fake
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub op: &'static str,
    /// `namespace/name`, or the selector for `list_pods`
    pub target: String,
    pub dry_run: bool,
    pub at: DateTime<Utc>,
}

impl Call {
    pub fn is_mutation(&self) -> bool {
        !self.dry_run && MUTATING_OPS.contains(&self.op)
    }
}

/// Failure injected into the next call of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    Conflict,
    AlreadyExists,
    NotFound,
    Unexpected,
}

#[derive(Default)]
struct State {
    deployments: BTreeMap<Key, Deployment>,
    services: BTreeMap<Key, Service>,
    cronjobs: BTreeMap<Key, CronJob>,
    pods: Vec<(String, Pod)>,
    revisions: BTreeMap<Key, BTreeMap<i64, ReplicaSet>>,
    rollout_scripts: BTreeMap<Key, VecDeque<DeploymentStatus>>,
    failures: BTreeMap<&'static str, VecDeque<Failure>>,
    calls: Vec<Call>,
    next_version: u64,
}

impl State {
    fn bump(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }
}

#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<State>,
    clock: Option<Arc<MockClock>>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stamp recorded calls with the given clock
    pub fn with_clock(clock: Arc<MockClock>) -> Self {
        FakeCluster {
            state: Mutex::new(State::default()),
            clock: Some(clock),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        match &self.clock {
            Some(clock) => clock.now(),
            None => DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    fn record(&self, state: &mut State, op: &'static str, target: String, dry_run: bool) {
        state.calls.push(Call {
            op,
            target,
            dry_run,
            at: self.now(),
        });
    }

    fn injected(
        state: &mut State,
        op: &'static str,
        kind: &'static str,
        namespace: &str,
        name: &str,
    ) -> Result<(), ClusterError> {
        let failure = state.failures.get_mut(op).and_then(|queue| queue.pop_front());
        match failure {
            None => Ok(()),
            Some(Failure::Conflict) => Err(ClusterError::Conflict {
                kind,
                namespace: namespace.to_string(),
                name: name.to_string(),
                message: "the object has been modified".to_string(),
            }),
            Some(Failure::AlreadyExists) => Err(ClusterError::AlreadyExists {
                kind,
                namespace: namespace.to_string(),
                name: name.to_string(),
            }),
            Some(Failure::NotFound) => Err(not_found(kind, namespace, name)),
            Some(Failure::Unexpected) => Err(ClusterError::Unexpected(format!(
                "injected failure in {}",
                op
            ))),
        }
    }

    // ---- seeding -------------------------------------------------------

    pub fn insert_deployment(&self, deployment: Deployment) {
        let mut state = self.state.lock().unwrap();
        let mut deployment = deployment;
        let version = state.bump();
        deployment.metadata.resource_version = Some(version.clone());
        deployment.metadata.uid = Some(format!("uid-{}", version));
        let k = key(
            deployment.metadata.namespace.as_deref().unwrap_or("default"),
            deployment.metadata.name.as_deref().unwrap_or_default(),
        );
        state.deployments.insert(k, deployment);
    }

    pub fn insert_service(&self, service: Service) {
        let mut state = self.state.lock().unwrap();
        let mut service = service;
        service.metadata.resource_version = Some(state.bump());
        let k = key(
            service.metadata.namespace.as_deref().unwrap_or("default"),
            service.metadata.name.as_deref().unwrap_or_default(),
        );
        state.services.insert(k, service);
    }

    pub fn insert_cronjob(&self, cronjob: CronJob) {
        let mut state = self.state.lock().unwrap();
        let mut cronjob = cronjob;
        cronjob.metadata.resource_version = Some(state.bump());
        let k = key(
            cronjob.metadata.namespace.as_deref().unwrap_or("default"),
            cronjob.metadata.name.as_deref().unwrap_or_default(),
        );
        state.cronjobs.insert(k, cronjob);
    }

    pub fn insert_pod(&self, namespace: &str, pod: Pod) {
        self.state
            .lock()
            .unwrap()
            .pods
            .push((namespace.to_string(), pod));
    }

    pub fn insert_revision(&self, namespace: &str, name: &str, revision: i64, rs: ReplicaSet) {
        self.state
            .lock()
            .unwrap()
            .revisions
            .entry(key(namespace, name))
            .or_default()
            .insert(revision, rs);
    }

    /// Status sequence returned by successive `get_deployment` calls (the last one sticks)
    pub fn script_rollout(&self, namespace: &str, name: &str, statuses: Vec<DeploymentStatus>) {
        self.state
            .lock()
            .unwrap()
            .rollout_scripts
            .insert(key(namespace, name), statuses.into());
    }

    /// Fail the next call of `op` with `failure`
    pub fn fail_next(&self, op: &'static str, failure: Failure) {
        self.state
            .lock()
            .unwrap()
            .failures
            .entry(op)
            .or_default()
            .push_back(failure);
    }

    // ---- inspection ----------------------------------------------------

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn mutations(&self) -> Vec<Call> {
        self.calls().into_iter().filter(Call::is_mutation).collect()
    }

    /// Count of recorded calls of `op` (dry runs included)
    pub fn count(&self, op: &str) -> usize {
        self.calls().iter().filter(|c| c.op == op).count()
    }

    /// Index of the first non-dry-run call matching op and target
    pub fn position(&self, op: &str, target: &str) -> Option<usize> {
        self.calls()
            .iter()
            .position(|c| c.op == op && c.target == target && !c.dry_run)
    }

    pub fn find_call(&self, op: &str, target: &str) -> Option<Call> {
        self.calls()
            .into_iter()
            .find(|c| c.op == op && c.target == target && !c.dry_run)
    }

    pub fn deployment(&self, namespace: &str, name: &str) -> Option<Deployment> {
        self.state
            .lock()
            .unwrap()
            .deployments
            .get(&key(namespace, name))
            .cloned()
    }

    pub fn service(&self, namespace: &str, name: &str) -> Option<Service> {
        self.state
            .lock()
            .unwrap()
            .services
            .get(&key(namespace, name))
            .cloned()
    }

    pub fn cronjob(&self, namespace: &str, name: &str) -> Option<CronJob> {
        self.state
            .lock()
            .unwrap()
            .cronjobs
            .get(&key(namespace, name))
            .cloned()
    }
}

fn not_found(kind: &'static str, namespace: &str, name: &str) -> ClusterError {
    ClusterError::NotFound {
        kind,
        namespace: namespace.to_string(),
        name: name.to_string(),
    }
}

fn target(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

fn selector_matches(selector: &str, labels: &LabelMap) -> bool {
    selector
        .split(',')
        .filter(|s| !s.is_empty())
        .all(|pair| match pair.split_once('=') {
            Some((k, v)) => labels.get(k).map(String::as_str) == Some(v),
            None => false,
        })
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment, ClusterError> {
        let mut state = self.state.lock().unwrap();
        self.record(&mut state, "get_deployment", target(namespace, name), false);
        Self::injected(&mut state, "get_deployment", "Deployment", namespace, name)?;

        let k = key(namespace, name);
        let scripted = state.rollout_scripts.get_mut(&k).and_then(|script| {
            if script.len() > 1 {
                script.pop_front()
            } else {
                script.front().cloned()
            }
        });

        let deployment = state
            .deployments
            .get_mut(&k)
            .ok_or_else(|| not_found("Deployment", namespace, name))?;
        if let Some(status) = scripted {
            deployment.status = Some(status);
        }
        Ok(deployment.clone())
    }

    async fn list_deployments(
        &self,
        namespace: Option<&str>,
    ) -> Result<Vec<Deployment>, ClusterError> {
        let mut state = self.state.lock().unwrap();
        self.record(
            &mut state,
            "list_deployments",
            namespace.unwrap_or("*").to_string(),
            false,
        );
        Ok(state
            .deployments
            .iter()
            .filter(|((ns, _), _)| namespace.map_or(true, |wanted| wanted == ns))
            .map(|(_, d)| d.clone())
            .collect())
    }

    async fn create_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, ClusterError> {
        let name = deployment.metadata.name.clone().unwrap_or_default();
        let mut state = self.state.lock().unwrap();
        self.record(&mut state, "create_deployment", target(namespace, &name), false);
        Self::injected(&mut state, "create_deployment", "Deployment", namespace, &name)?;

        if deployment.metadata.resource_version.is_some() {
            return Err(ClusterError::Unexpected(
                "resourceVersion should not be set on objects to be created".to_string(),
            ));
        }
        let k = key(namespace, &name);
        if state.deployments.contains_key(&k) {
            return Err(ClusterError::AlreadyExists {
                kind: "Deployment",
                namespace: namespace.to_string(),
                name,
            });
        }

        let mut stored = deployment.clone();
        let version = state.bump();
        stored.metadata.namespace = Some(namespace.to_string());
        stored.metadata.resource_version = Some(version.clone());
        stored.metadata.uid = Some(format!("uid-{}", version));
        if !state.rollout_scripts.contains_key(&k) {
            let desired = stored.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
            stored.status = Some(converged_status(desired));
        }
        state.deployments.insert(k, stored.clone());
        Ok(stored)
    }

    async fn replace_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, ClusterError> {
        let name = deployment.metadata.name.clone().unwrap_or_default();
        let mut state = self.state.lock().unwrap();
        self.record(&mut state, "replace_deployment", target(namespace, &name), false);
        Self::injected(&mut state, "replace_deployment", "Deployment", namespace, &name)?;

        let k = key(namespace, &name);
        let current_version = state
            .deployments
            .get(&k)
            .ok_or_else(|| not_found("Deployment", namespace, &name))?
            .metadata
            .resource_version
            .clone();
        if current_version != deployment.metadata.resource_version {
            return Err(ClusterError::Conflict {
                kind: "Deployment",
                namespace: namespace.to_string(),
                name,
                message: "the object has been modified".to_string(),
            });
        }

        let mut stored = deployment.clone();
        stored.metadata.resource_version = Some(state.bump());
        state.deployments.insert(k, stored.clone());
        Ok(stored)
    }

    async fn delete_deployment(
        &self,
        namespace: &str,
        name: &str,
        params: &DeleteParams,
    ) -> Result<(), ClusterError> {
        let mut state = self.state.lock().unwrap();
        self.record(
            &mut state,
            "delete_deployment",
            target(namespace, name),
            params.dry_run,
        );
        Self::injected(&mut state, "delete_deployment", "Deployment", namespace, name)?;

        let k = key(namespace, name);
        if !state.deployments.contains_key(&k) {
            return Err(not_found("Deployment", namespace, name));
        }
        if !params.dry_run {
            state.deployments.remove(&k);
        }
        Ok(())
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, ClusterError> {
        let mut state = self.state.lock().unwrap();
        self.record(&mut state, "get_service", target(namespace, name), false);
        Self::injected(&mut state, "get_service", "Service", namespace, name)?;
        state
            .services
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| not_found("Service", namespace, name))
    }

    async fn create_service(
        &self,
        namespace: &str,
        service: &Service,
    ) -> Result<Service, ClusterError> {
        let name = service.metadata.name.clone().unwrap_or_default();
        let mut state = self.state.lock().unwrap();
        self.record(&mut state, "create_service", target(namespace, &name), false);
        Self::injected(&mut state, "create_service", "Service", namespace, &name)?;

        if service.metadata.resource_version.is_some() {
            return Err(ClusterError::Unexpected(
                "resourceVersion should not be set on objects to be created".to_string(),
            ));
        }
        let k = key(namespace, &name);
        if state.services.contains_key(&k) {
            return Err(ClusterError::AlreadyExists {
                kind: "Service",
                namespace: namespace.to_string(),
                name,
            });
        }
        let mut stored = service.clone();
        stored.metadata.namespace = Some(namespace.to_string());
        stored.metadata.resource_version = Some(state.bump());
        state.services.insert(k, stored.clone());
        Ok(stored)
    }

    async fn replace_service(
        &self,
        namespace: &str,
        service: &Service,
    ) -> Result<Service, ClusterError> {
        let name = service.metadata.name.clone().unwrap_or_default();
        let mut state = self.state.lock().unwrap();
        self.record(&mut state, "replace_service", target(namespace, &name), false);
        Self::injected(&mut state, "replace_service", "Service", namespace, &name)?;

        let k = key(namespace, &name);
        let current_version = state
            .services
            .get(&k)
            .ok_or_else(|| not_found("Service", namespace, &name))?
            .metadata
            .resource_version
            .clone();
        if current_version != service.metadata.resource_version {
            return Err(ClusterError::Conflict {
                kind: "Service",
                namespace: namespace.to_string(),
                name,
                message: "the object has been modified".to_string(),
            });
        }
        let mut stored = service.clone();
        stored.metadata.resource_version = Some(state.bump());
        state.services.insert(k, stored.clone());
        Ok(stored)
    }

    async fn delete_service(
        &self,
        namespace: &str,
        name: &str,
        params: &DeleteParams,
    ) -> Result<(), ClusterError> {
        let mut state = self.state.lock().unwrap();
        self.record(
            &mut state,
            "delete_service",
            target(namespace, name),
            params.dry_run,
        );
        Self::injected(&mut state, "delete_service", "Service", namespace, name)?;

        let k = key(namespace, name);
        if !state.services.contains_key(&k) {
            return Err(not_found("Service", namespace, name));
        }
        if !params.dry_run {
            state.services.remove(&k);
        }
        Ok(())
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>, ClusterError> {
        let mut state = self.state.lock().unwrap();
        self.record(&mut state, "list_pods", selector.to_string(), false);
        Self::injected(&mut state, "list_pods", "Pod", namespace, selector)?;
        Ok(state
            .pods
            .iter()
            .filter(|(ns, _)| ns == namespace)
            .filter(|(_, pod)| {
                let labels = pod.metadata.labels.clone().unwrap_or_default();
                selector_matches(selector, &labels)
            })
            .map(|(_, pod)| pod.clone())
            .collect())
    }

    async fn get_cronjob(&self, namespace: &str, name: &str) -> Result<CronJob, ClusterError> {
        let mut state = self.state.lock().unwrap();
        self.record(&mut state, "get_cronjob", target(namespace, name), false);
        Self::injected(&mut state, "get_cronjob", "CronJob", namespace, name)?;
        state
            .cronjobs
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| not_found("CronJob", namespace, name))
    }

    async fn replace_cronjob(
        &self,
        namespace: &str,
        cronjob: &CronJob,
    ) -> Result<CronJob, ClusterError> {
        let name = cronjob.metadata.name.clone().unwrap_or_default();
        let mut state = self.state.lock().unwrap();
        self.record(&mut state, "replace_cronjob", target(namespace, &name), false);
        Self::injected(&mut state, "replace_cronjob", "CronJob", namespace, &name)?;

        let k = key(namespace, &name);
        let current_version = state
            .cronjobs
            .get(&k)
            .ok_or_else(|| not_found("CronJob", namespace, &name))?
            .metadata
            .resource_version
            .clone();
        if current_version != cronjob.metadata.resource_version {
            return Err(ClusterError::Conflict {
                kind: "CronJob",
                namespace: namespace.to_string(),
                name,
                message: "the object has been modified".to_string(),
            });
        }
        let mut stored = cronjob.clone();
        stored.metadata.resource_version = Some(state.bump());
        state.cronjobs.insert(k, stored.clone());
        Ok(stored)
    }

    async fn deployment_revisions(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<i64, ReplicaSet>, ClusterError> {
        let mut state = self.state.lock().unwrap();
        self.record(&mut state, "deployment_revisions", target(namespace, name), false);
        Self::injected(&mut state, "deployment_revisions", "Deployment", namespace, name)?;
        let k = key(namespace, name);
        if !state.deployments.contains_key(&k) {
            return Err(not_found("Deployment", namespace, name));
        }
        Ok(state.revisions.get(&k).cloned().unwrap_or_default())
    }

    async fn rollback_deployment(
        &self,
        namespace: &str,
        name: &str,
        revision: i64,
    ) -> Result<(), ClusterError> {
        let mut state = self.state.lock().unwrap();
        self.record(
            &mut state,
            "rollback_deployment",
            format!("{}/{}@{}", namespace, name, revision),
            false,
        );
        Self::injected(&mut state, "rollback_deployment", "Deployment", namespace, name)?;
        let retained = state
            .revisions
            .get(&key(namespace, name))
            .is_some_and(|history| history.contains_key(&revision));
        if retained {
            Ok(())
        } else {
            Err(ClusterError::Unexpected(format!(
                "revision {} not retained",
                revision
            )))
        }
    }
}

// ---- fixtures --------------------------------------------------------------

pub fn labels(pairs: &[(&str, &str)]) -> LabelMap {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub fn status(desired: i32, updated: i32, ready: i32, available: i32) -> DeploymentStatus {
    DeploymentStatus {
        replicas: Some(desired),
        updated_replicas: Some(updated),
        ready_replicas: Some(ready),
        available_replicas: Some(available),
        ..Default::default()
    }
}

pub fn converged_status(replicas: i32) -> DeploymentStatus {
    status(replicas, replicas, replicas, replicas)
}

pub fn container(name: &str, image: &str) -> Container {
    Container {
        name: name.to_string(),
        image: Some(image.to_string()),
        ..Default::default()
    }
}

/// Deployment whose selector, template labels and object labels all equal `labels`
pub fn deployment(
    namespace: &str,
    name: &str,
    labels: &LabelMap,
    replicas: i32,
    containers: Vec<Container>,
) -> Deployment {
    Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            generation: Some(3),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels.clone()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers,
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: Some(converged_status(replicas)),
    }
}

pub fn service(namespace: &str, name: &str, selector: &LabelMap, type_: &str) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(selector.clone()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(selector.clone()),
            type_: Some(type_.to_string()),
            ..Default::default()
        }),
        status: None,
    }
}

pub fn cronjob(namespace: &str, name: &str, labels: &LabelMap) -> CronJob {
    CronJob {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(CronJobSpec {
            schedule: "*/5 * * * *".to_string(),
            job_template: JobTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels.clone()),
                    ..Default::default()
                }),
                spec: Some(JobSpec {
                    template: PodTemplateSpec {
                        metadata: Some(ObjectMeta {
                            labels: Some(labels.clone()),
                            ..Default::default()
                        }),
                        spec: Some(PodSpec {
                            containers: vec![container("job", "busybox:1.36")],
                            ..Default::default()
                        }),
                    },
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

pub fn pod(name: &str, labels: &LabelMap, ready: &[bool], restarts: i32) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: None,
        status: Some(PodStatus {
            container_statuses: Some(
                ready
                    .iter()
                    .enumerate()
                    .map(|(i, ready)| ContainerStatus {
                        name: format!("c{}", i),
                        ready: *ready,
                        restart_count: restarts,
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
    }
}
