//! Cluster access seam
//!
//! Every orchestrator in this crate talks to the API server exclusively through
//! [`ClusterApi`]. Production code uses [`KubeCluster`] (a thin wrapper over
//! `kube::Api`); tests use `FakeCluster`, an in-memory object store that records
//! every call so step ordering and "zero mutations" can be asserted.

mod client;

#[cfg(test)]
pub mod fake;

pub use client::KubeCluster;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::DeleteParams;
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors returned by the cluster seam
///
/// `kube::Error` is classified once, at the seam, so orchestrators can match on
/// intent (absent, name taken, stale resourceVersion) instead of status codes.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    #[error("{kind} {namespace}/{name} already exists")]
    AlreadyExists {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    #[error("conflicting update to {kind} {namespace}/{name}: {message}")]
    Conflict {
        kind: &'static str,
        namespace: String,
        name: String,
        message: String,
    },

    #[error("{kind} is missing metadata.name")]
    MissingName { kind: &'static str },

    #[error("Kubernetes API error: {0}")]
    Api(#[source] kube::Error),

    #[error("{0}")]
    Unexpected(String),
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, ClusterError::AlreadyExists { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ClusterError::Conflict { .. })
    }
}

/// Namespaced get/list/create/replace/delete over the object kinds this tool touches
///
/// `replace_*` is a full update carrying the object's resourceVersion, so a stale
/// copy fails with [`ClusterError::Conflict`].
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn get_deployment(&self, namespace: &str, name: &str)
        -> Result<Deployment, ClusterError>;

    /// List deployments in `namespace`, or across all namespaces when `None`
    async fn list_deployments(&self, namespace: Option<&str>)
        -> Result<Vec<Deployment>, ClusterError>;

    async fn create_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, ClusterError>;

    async fn replace_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, ClusterError>;

    async fn delete_deployment(
        &self,
        namespace: &str,
        name: &str,
        params: &DeleteParams,
    ) -> Result<(), ClusterError>;

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, ClusterError>;

    async fn create_service(
        &self,
        namespace: &str,
        service: &Service,
    ) -> Result<Service, ClusterError>;

    async fn replace_service(
        &self,
        namespace: &str,
        service: &Service,
    ) -> Result<Service, ClusterError>;

    async fn delete_service(
        &self,
        namespace: &str,
        name: &str,
        params: &DeleteParams,
    ) -> Result<(), ClusterError>;

    /// List pods matching a label selector string (`k=v,k=v`)
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>, ClusterError>;

    async fn get_cronjob(&self, namespace: &str, name: &str) -> Result<CronJob, ClusterError>;

    async fn replace_cronjob(
        &self,
        namespace: &str,
        cronjob: &CronJob,
    ) -> Result<CronJob, ClusterError>;

    /// Retained revision history of a deployment, keyed by revision number
    async fn deployment_revisions(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<i64, ReplicaSet>, ClusterError>;

    /// Roll a deployment back to a retained revision
    async fn rollback_deployment(
        &self,
        namespace: &str,
        name: &str,
        revision: i64,
    ) -> Result<(), ClusterError>;
}

/// Build `DeleteParams` with a grace period in seconds
pub fn delete_with_grace(grace_period_seconds: u32) -> DeleteParams {
    DeleteParams {
        grace_period_seconds: Some(grace_period_seconds),
        ..Default::default()
    }
}

/// Build server-side dry-run `DeleteParams`
pub fn delete_dry_run() -> DeleteParams {
    DeleteParams {
        dry_run: true,
        ..Default::default()
    }
}
