//! Copy a deployment and its Service into another namespace, and remove copies
//!
//! Copies always replace whatever already sits under the same name in the
//! destination. The copied Service is always `ClusterIP` with cluster IPs and
//! node ports cleared so the API server allocates fresh ones.

use crate::cluster::{delete_dry_run, delete_with_grace, ClusterError};
use crate::controller::context::Context;
use crate::controller::shadow::clear_identity;
use crate::controller::wait::{
    wait_for_deployment_deletion, wait_for_pods_ready, wait_for_rollout, WaitError,
};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum CopyError {
    #[error("source and destination namespace are both '{0}'")]
    SameNamespace(String),

    #[error("{kind} {namespace}/{name} not found; deploy it to {namespace} first")]
    SourceMissing {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    #[error("{action} failed: {source}")]
    Cluster {
        action: String,
        #[source]
        source: ClusterError,
    },

    #[error(transparent)]
    Wait(#[from] WaitError),
}

fn failed(action: impl Into<String>) -> impl FnOnce(ClusterError) -> CopyError {
    let action = action.into();
    move |source| CopyError::Cluster { action, source }
}

#[derive(Debug, Clone)]
pub struct CopyRequest {
    pub name: String,
    pub from: String,
    pub to: String,
    pub replicas: i32,
    /// New tag for the first container's image
    pub tag: Option<String>,
}

/// Replace the tag (or digest) of an image reference
///
/// A `:` inside the registry host (`registry:5000/app`) is not a tag separator.
pub fn retag_image(image: &str, tag: &str) -> String {
    let name_start = image.rfind('/').map_or(0, |i| i + 1);
    let repository = match image[name_start..].find(|c: char| c == ':' || c == '@') {
        Some(i) => &image[..name_start + i],
        None => image,
    };
    format!("{}:{}", repository, tag)
}

/// Service copy for `namespace`, stripped of allocated addresses and ports
pub fn build_service_copy(source: &Service, namespace: &str) -> Service {
    let mut copy = source.clone();
    clear_identity(&mut copy.metadata);
    copy.metadata.namespace = Some(namespace.to_string());
    copy.status = None;

    if let Some(spec) = copy.spec.as_mut() {
        spec.type_ = Some("ClusterIP".to_string());
        spec.cluster_ip = None;
        spec.cluster_ips = None;
        spec.external_traffic_policy = None;
        spec.health_check_node_port = None;
        for port in spec.ports.iter_mut().flatten() {
            port.node_port = None;
        }
    }
    copy
}

/// Deployment copy for `namespace` with replica count and image tag overrides
pub fn build_deployment_copy(
    source: &Deployment,
    namespace: &str,
    replicas: i32,
    tag: Option<&str>,
) -> Deployment {
    let mut copy = source.clone();
    clear_identity(&mut copy.metadata);
    copy.metadata.namespace = Some(namespace.to_string());
    copy.status = None;

    if let Some(spec) = copy.spec.as_mut() {
        spec.replicas = Some(replicas);
        let first = spec
            .template
            .spec
            .as_mut()
            .and_then(|pod| pod.containers.first_mut());
        if let (Some(tag), Some(container)) = (tag, first) {
            if let Some(image) = container.image.as_mut() {
                *image = retag_image(image, tag);
            }
        }
    }
    copy
}

async fn delete_service_copy(ctx: &Context, namespace: &str, name: &str) -> Result<bool, CopyError> {
    let cluster = ctx.cluster.as_ref();
    match cluster.delete_service(namespace, name, &delete_dry_run()).await {
        Err(e) if e.is_not_found() => return Ok(false),
        other => other.map_err(failed(format!("dry-run delete of Service {}/{}", namespace, name)))?,
    }
    cluster
        .delete_service(
            namespace,
            name,
            &delete_with_grace(ctx.settings.copy_grace_period_secs),
        )
        .await
        .map_err(failed(format!("delete of Service {}/{}", namespace, name)))?;
    info!(service = %name, namespace = %namespace, "Service deleted");
    Ok(true)
}

async fn delete_deployment_copy(
    ctx: &Context,
    namespace: &str,
    name: &str,
) -> Result<bool, CopyError> {
    let cluster = ctx.cluster.as_ref();
    match cluster
        .delete_deployment(namespace, name, &delete_dry_run())
        .await
    {
        Err(e) if e.is_not_found() => return Ok(false),
        other => other.map_err(failed(format!("dry-run delete of Deployment {}/{}", namespace, name)))?,
    }
    cluster
        .delete_deployment(
            namespace,
            name,
            &delete_with_grace(ctx.settings.copy_grace_period_secs),
        )
        .await
        .map_err(failed(format!("delete of Deployment {}/{}", namespace, name)))?;
    info!(deployment = %name, namespace = %namespace, "Deployment deleted");
    Ok(true)
}

/// Copy `name` from one namespace to another and wait for it to come up
pub async fn copy_deployment(ctx: &Context, req: &CopyRequest) -> Result<(), CopyError> {
    let cluster = ctx.cluster.as_ref();
    let name = req.name.as_str();

    if req.from == req.to {
        return Err(CopyError::SameNamespace(req.to.clone()));
    }

    let source_service = match cluster.get_service(&req.from, name).await {
        Ok(service) => service,
        Err(e) if e.is_not_found() => {
            return Err(CopyError::SourceMissing {
                kind: "Service",
                namespace: req.from.clone(),
                name: name.to_string(),
            })
        }
        Err(e) => return Err(failed("fetch of source Service")(e)),
    };
    if delete_service_copy(ctx, &req.to, name).await? {
        info!(service = %name, namespace = %req.to, "Replacing existing Service copy");
    }
    cluster
        .create_service(&req.to, &build_service_copy(&source_service, &req.to))
        .await
        .map_err(failed(format!("create of Service {}/{}", req.to, name)))?;
    info!(service = %name, from = %req.from, to = %req.to, "Service copied");

    let source_deployment = match cluster.get_deployment(&req.from, name).await {
        Ok(deployment) => deployment,
        Err(e) if e.is_not_found() => {
            return Err(CopyError::SourceMissing {
                kind: "Deployment",
                namespace: req.from.clone(),
                name: name.to_string(),
            })
        }
        Err(e) => return Err(failed("fetch of source Deployment")(e)),
    };
    if delete_deployment_copy(ctx, &req.to, name).await? {
        info!(deployment = %name, namespace = %req.to, "Replacing existing Deployment copy");
        wait_for_deployment_deletion(
            cluster,
            ctx.clock.as_ref(),
            &req.to,
            name,
            ctx.deletion_policy(),
        )
        .await
        .map_err(failed(format!("wait for deletion of Deployment {}/{}", req.to, name)))?;
    }
    let copy = build_deployment_copy(&source_deployment, &req.to, req.replicas, req.tag.as_deref());
    cluster
        .create_deployment(&req.to, &copy)
        .await
        .map_err(failed(format!("create of Deployment {}/{}", req.to, name)))?;
    info!(
        deployment = %name,
        from = %req.from,
        to = %req.to,
        replicas = req.replicas,
        "Deployment copied, waiting for rollout"
    );

    wait_for_rollout(cluster, ctx.clock.as_ref(), &req.to, name, ctx.rollout_policy()).await?;
    wait_for_pods_ready(cluster, ctx.clock.as_ref(), &req.to, name, ctx.pods_policy()).await?;
    Ok(())
}

/// Delete a copied deployment and its Service, each after a dry run
///
/// Objects that are already gone are skipped.
pub async fn delete_copy(ctx: &Context, namespace: &str, name: &str) -> Result<(), CopyError> {
    if !delete_deployment_copy(ctx, namespace, name).await? {
        info!(deployment = %name, namespace = %namespace, "Deployment already absent");
    }
    if !delete_service_copy(ctx, namespace, name).await? {
        info!(service = %name, namespace = %namespace, "Service already absent");
    }
    Ok(())
}
