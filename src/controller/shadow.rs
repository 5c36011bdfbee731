//! Drain-Aware Shadow Builder
//!
//! The shadow is a renamed deep copy of the original deployment. It keeps the
//! original labels, so its pods stay behind the existing Service while the
//! original is destroyed and recreated.

use crate::cluster::{delete_with_grace, ClusterError};
use crate::controller::context::Context;
use crate::controller::labels::LabelMap;
use crate::controller::revision::REVISION_ANNOTATION;
use crate::controller::wait::wait_for_deployment_deletion;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ExecAction, Lifecycle, LifecycleHandler};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::{info, warn};

pub const SHADOW_SUFFIX: &str = "-tmp";

/// Container that receives the termination-delay hook; falls back to the first
pub const PRIMARY_CONTAINER: &str = "app";

/// Keeps a terminating pod in endpoints long enough for them to resync
pub const PRE_STOP_COMMAND: [&str; 3] = ["/bin/sh", "-c", "sleep 5"];

pub fn shadow_name(name: &str) -> String {
    format!("{}{}", name, SHADOW_SUFFIX)
}

/// Strip server-assigned identity so the object can be created anew
pub fn clear_identity(meta: &mut ObjectMeta) {
    meta.uid = None;
    meta.resource_version = None;
    meta.creation_timestamp = None;
    meta.deletion_timestamp = None;
    meta.deletion_grace_period_seconds = None;
    meta.generation = None;
    meta.managed_fields = None;
    meta.self_link = None;

    if let Some(annotations) = meta.annotations.as_mut() {
        annotations.remove(REVISION_ANNOTATION);
    }
}

/// Set the termination-delay hook on the primary container
///
/// Other lifecycle handlers on that container are left as they are. A pod
/// template without containers is unchanged.
pub fn inject_pre_stop(deployment: &mut Deployment) {
    let Some(pod_spec) = deployment
        .spec
        .as_mut()
        .and_then(|spec| spec.template.spec.as_mut())
    else {
        return;
    };

    let index = pod_spec
        .containers
        .iter()
        .position(|c| c.name == PRIMARY_CONTAINER)
        .unwrap_or(0);

    let Some(container) = pod_spec.containers.get_mut(index) else {
        return;
    };

    let lifecycle = container.lifecycle.get_or_insert_with(Lifecycle::default);
    lifecycle.pre_stop = Some(LifecycleHandler {
        exec: Some(ExecAction {
            command: Some(PRE_STOP_COMMAND.iter().map(|s| s.to_string()).collect()),
        }),
        ..Default::default()
    });
}

/// Build the shadow of `original`: renamed, identity cleared, hook injected
pub fn build_shadow(original: &Deployment, name: &str) -> Deployment {
    let mut shadow = original.clone();
    clear_identity(&mut shadow.metadata);
    shadow.metadata.name = Some(shadow_name(name));
    shadow.status = None;
    inject_pre_stop(&mut shadow);
    shadow
}

/// Build the replacement for `original` carrying `labels` as its identity
///
/// Object labels, selector and pod-template labels are all replaced by
/// `labels`, so the selector keeps matching the template.
pub fn build_relabeled(original: &Deployment, labels: &LabelMap) -> Deployment {
    let mut relabeled = original.clone();
    clear_identity(&mut relabeled.metadata);
    relabeled.metadata.labels = Some(labels.clone());
    relabeled.status = None;

    if let Some(spec) = relabeled.spec.as_mut() {
        spec.selector.match_labels = Some(labels.clone());
        spec.selector.match_expressions = None;
        spec.template
            .metadata
            .get_or_insert_with(ObjectMeta::default)
            .labels = Some(labels.clone());
    }

    inject_pre_stop(&mut relabeled);
    relabeled
}

/// Create the shadow, replacing a stale one left by an earlier run
///
/// On `AlreadyExists` the stale shadow is deleted, its disappearance awaited,
/// and creation retried once. A second failure is returned as is.
pub async fn create_shadow(
    ctx: &Context,
    namespace: &str,
    shadow: &Deployment,
) -> Result<Deployment, ClusterError> {
    let name = shadow.metadata.name.clone().unwrap_or_default();

    match ctx.cluster.create_deployment(namespace, shadow).await {
        Ok(created) => {
            info!(deployment = %name, namespace = %namespace, "Shadow deployment created");
            return Ok(created);
        }
        Err(e) if e.is_already_exists() => {
            warn!(
                deployment = %name,
                namespace = %namespace,
                "Stale shadow deployment found, recreating it"
            );
        }
        Err(e) => return Err(e),
    }

    let params = delete_with_grace(ctx.settings.grace_period_secs);
    match ctx.cluster.delete_deployment(namespace, &name, &params).await {
        Ok(()) => {}
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e),
    }
    wait_for_deployment_deletion(
        ctx.cluster.as_ref(),
        ctx.clock.as_ref(),
        namespace,
        &name,
        ctx.deletion_policy(),
    )
    .await?;

    let created = ctx.cluster.create_deployment(namespace, shadow).await?;
    info!(deployment = %name, namespace = %namespace, "Shadow deployment recreated");
    Ok(created)
}
