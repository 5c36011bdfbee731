//! Convergence Waiter
//!
//! Polls the cluster until the deployment controller has caught up with a
//! mutation. Every tick goes through [`Clock::sleep`], so waits are virtual in
//! tests.
//!
//! Polls happen at elapsed 0, interval, 2·interval, ... for as long as the next
//! poll would still land inside the deadline.

use crate::cluster::{ClusterApi, ClusterError};
use crate::controller::clock::{elapsed_since, Clock};
use crate::controller::labels::{label_selector, labels_of};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum WaitError {
    #[error("{what} did not converge within {waited:?} (last observed: {last})")]
    Timeout {
        what: String,
        waited: Duration,
        last: String,
    },

    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

impl WaitError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, WaitError::Timeout { .. })
    }
}

/// Deadline and poll interval for one wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    pub timeout: Duration,
    pub interval: Duration,
}

impl WaitPolicy {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        WaitPolicy { timeout, interval }
    }

    /// Whether another poll fits before the deadline
    fn has_next_poll(&self, elapsed: Duration) -> bool {
        elapsed + self.interval <= self.timeout
    }
}

/// Replica counters from a deployment's spec and status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplicaCounts {
    pub desired: i32,
    pub updated: i32,
    pub ready: i32,
    pub available: i32,
}

impl ReplicaCounts {
    /// available == ready == updated == desired
    pub fn is_converged(&self) -> bool {
        self.available == self.ready && self.ready == self.updated && self.updated == self.desired
    }
}

impl fmt::Display for ReplicaCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "desired={} updated={} ready={} available={}",
            self.desired, self.updated, self.ready, self.available
        )
    }
}

/// Read replica counters; `spec.replicas` defaults to 1, missing status counters to 0
pub fn replica_counts(deployment: &Deployment) -> ReplicaCounts {
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.replicas)
        .unwrap_or(1);
    let status = deployment.status.clone().unwrap_or_default();

    ReplicaCounts {
        desired,
        updated: status.updated_replicas.unwrap_or(0),
        ready: status.ready_replicas.unwrap_or(0),
        available: status.available_replicas.unwrap_or(0),
    }
}

/// Wait until a deployment's replica counters converge
///
/// A failed fetch ends the wait with [`WaitError::Cluster`].
pub async fn wait_for_rollout(
    cluster: &dyn ClusterApi,
    clock: &dyn Clock,
    namespace: &str,
    name: &str,
    policy: WaitPolicy,
) -> Result<ReplicaCounts, WaitError> {
    let start = clock.now();

    loop {
        let deployment = cluster.get_deployment(namespace, name).await?;
        let counts = replica_counts(&deployment);

        if counts.is_converged() {
            info!(deployment = %name, namespace = %namespace, %counts, "Deployment converged");
            return Ok(counts);
        }

        let elapsed = elapsed_since(clock, start);
        if !policy.has_next_poll(elapsed) {
            return Err(WaitError::Timeout {
                what: format!("Deployment {}/{}", namespace, name),
                waited: policy.timeout,
                last: counts.to_string(),
            });
        }

        debug!(
            deployment = %name,
            namespace = %namespace,
            %counts,
            elapsed_secs = elapsed.as_secs(),
            "Waiting for rollout"
        );
        clock.sleep(policy.interval).await;
    }
}

fn pod_is_ready(pod: &Pod) -> bool {
    let statuses = pod
        .status
        .as_ref()
        .and_then(|status| status.container_statuses.as_ref());

    match statuses {
        Some(statuses) if !statuses.is_empty() => statuses.iter().all(|c| c.ready),
        _ => false,
    }
}

/// Wait until every container of every pod selected by the deployment is ready
///
/// The selector is re-read from the pod template on each poll. At least one
/// pod must match unless the deployment wants zero replicas. Pod list failures
/// are logged and the wait continues.
pub async fn wait_for_pods_ready(
    cluster: &dyn ClusterApi,
    clock: &dyn Clock,
    namespace: &str,
    name: &str,
    policy: WaitPolicy,
) -> Result<(), WaitError> {
    let start = clock.now();

    loop {
        let deployment = cluster.get_deployment(namespace, name).await?;
        if replica_counts(&deployment).desired == 0 {
            return Ok(());
        }

        let template_labels = labels_of(
            deployment
                .spec
                .as_ref()
                .and_then(|spec| spec.template.metadata.as_ref()),
        );
        let selector = label_selector(&template_labels);

        let last = match cluster.list_pods(namespace, &selector).await {
            Ok(pods) => {
                let ready = pods.iter().filter(|pod| pod_is_ready(pod)).count();
                if !pods.is_empty() && ready == pods.len() {
                    info!(deployment = %name, namespace = %namespace, pods = pods.len(), "Pods ready");
                    return Ok(());
                }
                format!("{}/{} pods ready", ready, pods.len())
            }
            Err(e) => {
                warn!(deployment = %name, namespace = %namespace, error = %e, "Failed to list pods");
                format!("pod list failed: {}", e)
            }
        };

        let elapsed = elapsed_since(clock, start);
        if !policy.has_next_poll(elapsed) {
            return Err(WaitError::Timeout {
                what: format!("pods of Deployment {}/{}", namespace, name),
                waited: policy.timeout,
                last,
            });
        }

        debug!(deployment = %name, selector = %selector, %last, "Waiting for pods");
        clock.sleep(policy.interval).await;
    }
}

/// Wait for a deleted deployment to disappear
///
/// Returns `Ok(false)` when the object is still present at the deadline: the
/// caller proceeds and lets the following create report any name clash.
pub async fn wait_for_deployment_deletion(
    cluster: &dyn ClusterApi,
    clock: &dyn Clock,
    namespace: &str,
    name: &str,
    policy: WaitPolicy,
) -> Result<bool, ClusterError> {
    let start = clock.now();

    loop {
        match cluster.get_deployment(namespace, name).await {
            Err(e) if e.is_not_found() => {
                debug!(deployment = %name, namespace = %namespace, "Deployment deleted");
                return Ok(true);
            }
            Err(e) => return Err(e),
            Ok(_) => {}
        }

        if !policy.has_next_poll(elapsed_since(clock, start)) {
            warn!(
                deployment = %name,
                namespace = %namespace,
                "Timeout waiting for deployment deletion, proceeding anyway"
            );
            return Ok(false);
        }

        debug!(deployment = %name, "Deployment still exists, waiting");
        clock.sleep(policy.interval).await;
    }
}
