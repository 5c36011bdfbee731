//! Unhealthy pod report for `get deployment`

use crate::cluster::{ClusterApi, ClusterError};
use crate::controller::labels::label_selector;
use crate::controller::wait::replica_counts;
use k8s_openapi::api::core::v1::Pod;
use tracing::debug;

/// A pod with a crash-looping container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnhealthyPod {
    pub namespace: String,
    pub deployment: String,
    pub pod: String,
    pub restarts: i32,
}

/// Highest restart count among not-ready containers above `threshold`
fn crash_looping_restarts(pod: &Pod, threshold: i32) -> Option<i32> {
    pod.status
        .as_ref()?
        .container_statuses
        .as_ref()?
        .iter()
        .filter(|c| !c.ready && c.restart_count > threshold)
        .map(|c| c.restart_count)
        .max()
}

/// Pods of non-converged deployments whose unready containers restarted more than `threshold` times
///
/// `namespace` of `None` scans every namespace.
pub async fn unhealthy_pods(
    cluster: &dyn ClusterApi,
    namespace: Option<&str>,
    threshold: i32,
) -> Result<Vec<UnhealthyPod>, ClusterError> {
    let mut report = Vec::new();

    for deployment in cluster.list_deployments(namespace).await? {
        if replica_counts(&deployment).is_converged() {
            continue;
        }

        let name = deployment.metadata.name.clone().unwrap_or_default();
        let ns = deployment
            .metadata
            .namespace
            .clone()
            .or_else(|| namespace.map(str::to_string))
            .unwrap_or_default();
        let Some(selector) = deployment
            .spec
            .as_ref()
            .and_then(|spec| spec.selector.match_labels.as_ref())
            .map(label_selector)
        else {
            continue;
        };

        debug!(deployment = %name, namespace = %ns, selector = %selector, "Checking pods");
        for pod in cluster.list_pods(&ns, &selector).await? {
            if let Some(restarts) = crash_looping_restarts(&pod, threshold) {
                report.push(UnhealthyPod {
                    namespace: ns.clone(),
                    deployment: name.clone(),
                    pod: pod.metadata.name.clone().unwrap_or_default(),
                    restarts,
                });
            }
        }
    }

    Ok(report)
}
