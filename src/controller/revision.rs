//! Revision Selector
//!
//! Undo picks the second-most-recent retained revision of a deployment and
//! delegates to the platform rollback primitive.

use crate::cluster::{ClusterApi, ClusterError};
use k8s_openapi::api::apps::v1::ReplicaSet;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::info;

/// Annotation the deployment controller stamps on every ReplicaSet it owns
pub const REVISION_ANNOTATION: &str = "deployment.kubernetes.io/revision";

/// Label the deployment controller adds to ReplicaSet templates
pub const POD_TEMPLATE_HASH_LABEL: &str = "pod-template-hash";

#[derive(Debug, Error)]
pub enum RevisionError {
    #[error("Deployment {namespace}/{name} has {retained} retained revision(s), need at least 2 to undo")]
    NotEnoughHistory {
        namespace: String,
        name: String,
        retained: usize,
    },

    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

/// Revision chosen by [`undo_deployment`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackSelection {
    pub revision: i64,
    pub replicaset: String,
}

/// Revision number of a ReplicaSet, if it carries a parsable annotation
pub fn revision_of(rs: &ReplicaSet) -> Option<i64> {
    rs.metadata
        .annotations
        .as_ref()?
        .get(REVISION_ANNOTATION)?
        .trim()
        .parse()
        .ok()
}

/// Second-most-recent revision in `history`, or `None` with fewer than two
///
/// The most recent revision is the one currently running and is never selected.
pub fn select_undo_revision<V>(history: &BTreeMap<i64, V>) -> Option<i64> {
    let mut revisions = history.keys().rev();
    revisions.next()?;
    revisions.next().copied()
}

/// Roll a deployment back to its previous revision
pub async fn undo_deployment(
    cluster: &dyn ClusterApi,
    namespace: &str,
    name: &str,
) -> Result<RollbackSelection, RevisionError> {
    let history = cluster.deployment_revisions(namespace, name).await?;

    let revision = select_undo_revision(&history).ok_or_else(|| RevisionError::NotEnoughHistory {
        namespace: namespace.to_string(),
        name: name.to_string(),
        retained: history.len(),
    })?;

    let replicaset = history
        .get(&revision)
        .and_then(|rs| rs.metadata.name.clone())
        .unwrap_or_default();

    info!(
        deployment = %name,
        namespace = %namespace,
        revision = revision,
        replicaset = %replicaset,
        "Rolling back deployment"
    );

    cluster
        .rollback_deployment(namespace, name, revision)
        .await?;

    Ok(RollbackSelection {
        revision,
        replicaset,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::cluster::fake::{self, FakeCluster};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn replicaset(name: &str, revision: Option<&str>) -> ReplicaSet {
        ReplicaSet {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                annotations: revision.map(|r| {
                    BTreeMap::from([(REVISION_ANNOTATION.to_string(), r.to_string())])
                }),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn seeded(revisions: &[i64]) -> FakeCluster {
        let cluster = FakeCluster::new();
        let labels = fake::labels(&[("app", "web")]);
        cluster.insert_deployment(fake::deployment("prod", "web", &labels, 2, vec![]));
        for revision in revisions {
            cluster.insert_revision(
                "prod",
                "web",
                *revision,
                replicaset(&format!("web-{}", revision), Some(&revision.to_string())),
            );
        }
        cluster
    }

    #[test]
    fn test_revision_of_parses_annotation() {
        assert_eq!(revision_of(&replicaset("a", Some("7"))), Some(7));
        assert_eq!(revision_of(&replicaset("a", Some("x"))), None);
        assert_eq!(revision_of(&replicaset("a", None)), None);
    }

    #[test]
    fn test_select_undo_revision() {
        let empty: BTreeMap<i64, ()> = BTreeMap::new();
        assert_eq!(select_undo_revision(&empty), None);

        let one = BTreeMap::from([(4, ())]);
        assert_eq!(select_undo_revision(&one), None);

        let two = BTreeMap::from([(4, ()), (9, ())]);
        assert_eq!(select_undo_revision(&two), Some(4));

        // keys are compared numerically, not lexically
        let five = BTreeMap::from([(2, ()), (10, ()), (3, ()), (9, ()), (1, ())]);
        assert_eq!(select_undo_revision(&five), Some(9));
    }

    #[tokio::test]
    async fn test_undo_fails_without_history() {
        for revisions in [&[][..], &[3][..]] {
            let cluster = seeded(revisions);
            let result = undo_deployment(&cluster, "prod", "web").await;

            assert!(matches!(
                result,
                Err(RevisionError::NotEnoughHistory { retained, .. }) if retained == revisions.len()
            ));
            assert_eq!(cluster.count("rollback_deployment"), 0);
        }
    }

    #[tokio::test]
    async fn test_undo_selects_previous_revision() {
        let cluster = seeded(&[1, 2, 3, 4, 5]);

        let selection = undo_deployment(&cluster, "prod", "web").await.unwrap();

        assert_eq!(
            selection,
            RollbackSelection {
                revision: 4,
                replicaset: "web-4".to_string(),
            }
        );
        assert!(cluster.find_call("rollback_deployment", "prod/web@4").is_some());
    }

    #[tokio::test]
    async fn test_undo_missing_deployment_is_not_found() {
        let cluster = FakeCluster::new();
        let result = undo_deployment(&cluster, "prod", "ghost").await;
        assert!(matches!(
            result,
            Err(RevisionError::Cluster(ref e)) if e.is_not_found()
        ));
    }
}
