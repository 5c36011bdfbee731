//! Migration Orchestrator (Deployment)
//!
//! A Deployment's selector is immutable, so new identity labels require
//! destroying and recreating the object. To keep serving while that happens a
//! shadow copy (`{name}-tmp`) carrying the old labels is brought up first and
//! torn down only after the Service has been cut over and endpoints drained.
//!
//! Checkpoints, in order:
//! 1. Resolve target labels (and fetch the Service for routed kinds)
//! 2. Fetch the original deployment
//! 3. Diff gate: stop here when nothing would change
//! 4. Confirm
//! 5. Snapshot to a backup file
//! 6. Create the shadow
//! 7. Wait for the shadow to converge
//! 8. Delete the original (point of no return)
//! 9. Recreate the original with the target labels
//! 10. Wait for the recreated original (timeout is advisory)
//! 11. Cut the Service selector over
//! 12. Confirm teardown
//! 13. Drain delay
//! 14. Delete the shadow

use crate::cluster::{delete_with_grace, ClusterError};
use crate::controller::backup::{to_backup_document, BackupError};
use crate::controller::confirm::PromptError;
use crate::controller::context::Context;
use crate::controller::labels::{
    labels_of, resolve_target_labels, LabelDiff, LabelError, LabelMap, LabelRequest,
    WorkloadKind,
};
use crate::controller::shadow::{build_relabeled, build_shadow, create_shadow, shadow_name};
use crate::controller::wait::{wait_for_deployment_deletion, wait_for_rollout, WaitError};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Exit code for invalid operator input
pub const EXIT_INPUT: u8 = 2;
/// Exit code for failures that need a human right now
pub const EXIT_EMERGENCY: u8 = 3;
pub const EXIT_FAILURE: u8 = 1;

/// Checkpoint of a label migration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Resolve,
    FetchOriginal,
    DiffGate,
    Confirm,
    Snapshot,
    ShadowUp,
    WaitShadowReady,
    DestroyOriginal,
    RecreateWithIdentity,
    WaitOriginalReady,
    CutoverRouting,
    ConfirmTeardown,
    DrainDelay,
    DestroyShadow,
}

impl Step {
    /// Whether the original deployment may already be gone at this step
    pub fn past_point_of_no_return(&self) -> bool {
        matches!(
            self,
            Step::RecreateWithIdentity
                | Step::WaitOriginalReady
                | Step::CutoverRouting
                | Step::ConfirmTeardown
                | Step::DrainDelay
                | Step::DestroyShadow
        )
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::Resolve => "resolve",
            Step::FetchOriginal => "fetch-original",
            Step::DiffGate => "diff-gate",
            Step::Confirm => "confirm",
            Step::Snapshot => "snapshot",
            Step::ShadowUp => "shadow-up",
            Step::WaitShadowReady => "wait-shadow-ready",
            Step::DestroyOriginal => "destroy-original",
            Step::RecreateWithIdentity => "recreate-with-identity",
            Step::WaitOriginalReady => "wait-original-ready",
            Step::CutoverRouting => "cutover-routing",
            Step::ConfirmTeardown => "confirm-teardown",
            Step::DrainDelay => "drain-delay",
            Step::DestroyShadow => "destroy-shadow",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("invalid input: {0}")]
    Input(#[from] LabelError),

    #[error("step {step} failed for {namespace}/{name}: {source}")]
    Step {
        step: Step,
        namespace: String,
        name: String,
        #[source]
        source: ClusterError,
    },

    #[error("step {step} failed for {namespace}/{name}: {source}")]
    Convergence {
        step: Step,
        namespace: String,
        name: String,
        #[source]
        source: WaitError,
    },

    #[error("backup failed, nothing was changed: {0}")]
    Backup(#[from] BackupError),

    #[error("confirmation at step {step} aborted for {namespace}/{name}: {source}")]
    Prompt {
        step: Step,
        namespace: String,
        name: String,
        #[source]
        source: PromptError,
    },

    #[error("CronJob {namespace}/{name} not relabeled after {attempts} attempts: {source}")]
    RetriesExhausted {
        namespace: String,
        name: String,
        attempts: u32,
        #[source]
        source: ClusterError,
    },
}

impl MigrationError {
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrationError::Input(_) => EXIT_INPUT,
            MigrationError::RetriesExhausted { .. } => EXIT_EMERGENCY,
            _ => EXIT_FAILURE,
        }
    }

    /// What the operator should do next
    pub fn remediation(&self) -> String {
        match self {
            MigrationError::Input(_) => {
                "fix the arguments and rerun; nothing was sent to the cluster".to_string()
            }
            MigrationError::Backup(_) => {
                "check that the backup directory is writable (RELABEL_BACKUP_DIR); nothing was changed"
                    .to_string()
            }
            MigrationError::RetriesExhausted {
                namespace, name, ..
            } => format!(
                "page the on-call operator: CronJob {}/{} may carry mixed labels; \
                 inspect it with `kubectl -n {} get cronjob {} -o yaml` and restore from the latest backup",
                namespace, name, namespace, name
            ),
            MigrationError::Step {
                step,
                namespace,
                name,
                ..
            }
            | MigrationError::Convergence {
                step,
                namespace,
                name,
                ..
            }
            | MigrationError::Prompt {
                step,
                namespace,
                name,
                ..
            } => step_remediation(*step, namespace, name),
        }
    }
}

fn step_remediation(step: Step, namespace: &str, name: &str) -> String {
    let shadow = shadow_name(name);
    match step {
        Step::Resolve => format!(
            "Service {}/{} is required for this --type; create it or use --type script",
            namespace, name
        ),
        Step::FetchOriginal | Step::DiffGate | Step::Confirm | Step::Snapshot => {
            "nothing was changed; check the name and namespace and rerun".to_string()
        }
        Step::ShadowUp | Step::WaitShadowReady => format!(
            "the original is untouched; inspect and delete `kubectl -n {} delete deployment {}`, then rerun",
            namespace, shadow
        ),
        Step::DestroyOriginal => format!(
            "shadow {} is serving alongside the original; rerun, or delete the shadow to abandon the migration",
            shadow
        ),
        Step::RecreateWithIdentity | Step::WaitOriginalReady => format!(
            "only shadow {} is serving traffic; recreate {}/{} from the latest {}-{}*.yaml backup with the new labels",
            shadow, namespace, name, namespace, name
        ),
        Step::CutoverRouting => format!(
            "Service {}/{} still selects the old labels (served by {}); update its selector by hand, \
             then `kubectl -n {} delete deployment {}`",
            namespace, name, shadow, namespace, shadow
        ),
        Step::ConfirmTeardown | Step::DrainDelay | Step::DestroyShadow => format!(
            "migration is complete but the shadow remains; clean up with `kubectl -n {} delete deployment {}`",
            namespace, shadow
        ),
    }
}

/// Relabel request for a Deployment
#[derive(Debug, Clone)]
pub struct DeploymentRelabel {
    pub namespace: String,
    pub name: String,
    pub kind: WorkloadKind,
    /// Raw `k=v,k=v`; empty or absent selects the stable label set
    pub labels: Option<String>,
    pub app: Option<String>,
    /// Delay between routing cutover and shadow teardown; zero skips it
    pub drain_delay: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelabelOutcome {
    /// Labels already matched; nothing was mutated
    Unchanged,
    Relabeled {
        backup: PathBuf,
        /// Non-fatal problems observed after the point of no return
        advisories: Vec<String>,
    },
}

fn at(step: Step, namespace: &str, name: &str) -> impl FnOnce(ClusterError) -> MigrationError {
    let namespace = namespace.to_string();
    let name = name.to_string();
    move |source| MigrationError::Step {
        step,
        namespace,
        name,
        source,
    }
}

fn waiting_at(step: Step, namespace: &str, name: &str) -> impl FnOnce(WaitError) -> MigrationError {
    let namespace = namespace.to_string();
    let name = name.to_string();
    move |source| MigrationError::Convergence {
        step,
        namespace,
        name,
        source,
    }
}

fn template_labels(deployment: &Deployment) -> LabelMap {
    labels_of(
        deployment
            .spec
            .as_ref()
            .and_then(|spec| spec.template.metadata.as_ref()),
    )
}

fn selector_labels(deployment: &Deployment) -> LabelMap {
    deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.selector.match_labels.clone())
        .unwrap_or_default()
}

fn service_selector(service: &Service) -> LabelMap {
    service
        .spec
        .as_ref()
        .and_then(|spec| spec.selector.clone())
        .unwrap_or_default()
}

/// Confirmation text shown before anything is changed
fn describe_plan(
    req: &DeploymentRelabel,
    original: &Deployment,
    target: &LabelMap,
    routing: Option<(&Service, &LabelMap)>,
) -> String {
    let mut plan = format!(
        "Relabel Deployment {}/{} (type {})\n  pod template labels:\n{}",
        req.namespace,
        req.name,
        req.kind,
        LabelDiff::between(&template_labels(original), target)
    );
    if let Some((service, routing)) = routing {
        plan.push_str(&format!(
            "  Service selector:\n{}",
            LabelDiff::between(&service_selector(service), routing)
        ));
    }
    plan.push_str("Proceed?");
    plan
}

/// Relabel a Deployment without downtime
pub async fn relabel_deployment(
    ctx: &Context,
    req: &DeploymentRelabel,
) -> Result<RelabelOutcome, MigrationError> {
    let ns = req.namespace.as_str();
    let name = req.name.as_str();

    info!(step = %Step::Resolve, deployment = %name, namespace = %ns, kind = %req.kind);
    let target = resolve_target_labels(
        req.kind,
        &LabelRequest {
            name: req.name.clone(),
            app: req.app.clone(),
            type_label: req.kind.type_label().to_string(),
            raw: req.labels.clone(),
        },
    )?;
    let service = if req.kind.has_routing() {
        Some(
            ctx.cluster
                .get_service(ns, name)
                .await
                .map_err(at(Step::Resolve, ns, name))?,
        )
    } else {
        None
    };

    info!(step = %Step::FetchOriginal, deployment = %name, namespace = %ns);
    let original = ctx
        .cluster
        .get_deployment(ns, name)
        .await
        .map_err(at(Step::FetchOriginal, ns, name))?;

    let workload_matches = template_labels(&original) == target.workload
        && selector_labels(&original) == target.workload;
    let routing_pair = service.as_ref().zip(target.routing.as_ref());
    let routing_matches = routing_pair.map_or(true, |(svc, routing)| service_selector(svc) == *routing);

    if workload_matches && routing_matches {
        info!(
            step = %Step::DiffGate,
            deployment = %name,
            namespace = %ns,
            "Labels already match, nothing to do"
        );
        return Ok(RelabelOutcome::Unchanged);
    }
    info!(
        step = %Step::DiffGate,
        deployment = %name,
        workload_matches,
        routing_matches,
        "Labels differ, full migration required"
    );

    let plan = describe_plan(req, &original, &target.workload, routing_pair);
    info!(step = %Step::Confirm, deployment = %name, "\n{}", plan);
    ctx.confirmer
        .confirm(&plan)
        .await
        .map_err(|source| MigrationError::Prompt {
            step: Step::Confirm,
            namespace: ns.to_string(),
            name: name.to_string(),
            source,
        })?;

    info!(step = %Step::Snapshot, deployment = %name, namespace = %ns);
    let mut documents = vec![to_backup_document(&original)?];
    if let Some(service) = service.as_ref() {
        documents.push(to_backup_document(service)?);
    }
    let backup = ctx.backups.write(ns, name, &documents, ctx.clock.now())?;

    let shadow = build_shadow(&original, name);
    let shadow_name = shadow_name(name);
    info!(step = %Step::ShadowUp, deployment = %shadow_name, namespace = %ns);
    create_shadow(ctx, ns, &shadow)
        .await
        .map_err(at(Step::ShadowUp, ns, name))?;

    info!(step = %Step::WaitShadowReady, deployment = %shadow_name, namespace = %ns);
    wait_for_rollout(
        ctx.cluster.as_ref(),
        ctx.clock.as_ref(),
        ns,
        &shadow_name,
        ctx.rollout_policy(),
    )
    .await
    .map_err(waiting_at(Step::WaitShadowReady, ns, name))?;

    info!(
        step = %Step::DestroyOriginal,
        deployment = %name,
        namespace = %ns,
        grace_period_secs = ctx.settings.grace_period_secs
    );
    ctx.cluster
        .delete_deployment(ns, name, &delete_with_grace(ctx.settings.grace_period_secs))
        .await
        .map_err(at(Step::DestroyOriginal, ns, name))?;

    info!(step = %Step::RecreateWithIdentity, deployment = %name, namespace = %ns);
    let relabeled = build_relabeled(&original, &target.workload);
    wait_for_deployment_deletion(
        ctx.cluster.as_ref(),
        ctx.clock.as_ref(),
        ns,
        name,
        ctx.deletion_policy(),
    )
    .await
    .map_err(at(Step::RecreateWithIdentity, ns, name))?;
    ctx.cluster
        .create_deployment(ns, &relabeled)
        .await
        .map_err(at(Step::RecreateWithIdentity, ns, name))?;

    let mut advisories = Vec::new();

    info!(step = %Step::WaitOriginalReady, deployment = %name, namespace = %ns);
    match wait_for_rollout(
        ctx.cluster.as_ref(),
        ctx.clock.as_ref(),
        ns,
        name,
        ctx.rollout_policy(),
    )
    .await
    {
        Ok(_) => {}
        Err(e) if e.is_timeout() => {
            warn!(
                step = %Step::WaitOriginalReady,
                deployment = %name,
                error = %e,
                "Recreated deployment not converged, continuing"
            );
            advisories.push(e.to_string());
        }
        Err(e) => return Err(waiting_at(Step::WaitOriginalReady, ns, name)(e)),
    }

    if let Some(routing) = target.routing.as_ref() {
        info!(step = %Step::CutoverRouting, service = %name, namespace = %ns);
        let mut current = ctx
            .cluster
            .get_service(ns, name)
            .await
            .map_err(at(Step::CutoverRouting, ns, name))?;
        current.metadata.labels = Some(routing.clone());
        if let Some(spec) = current.spec.as_mut() {
            spec.selector = Some(routing.clone());
        }
        ctx.cluster
            .replace_service(ns, &current)
            .await
            .map_err(at(Step::CutoverRouting, ns, name))?;
    } else {
        info!(
            step = %Step::CutoverRouting,
            deployment = %name,
            kind = %req.kind,
            "No Service for this type, skipping cutover"
        );
    }

    info!(step = %Step::ConfirmTeardown, deployment = %shadow_name, namespace = %ns);
    ctx.confirmer
        .confirm(&format!(
            "Delete shadow Deployment {}/{} after a {}s drain?",
            ns,
            shadow_name,
            req.drain_delay.as_secs()
        ))
        .await
        .map_err(|source| MigrationError::Prompt {
            step: Step::ConfirmTeardown,
            namespace: ns.to_string(),
            name: name.to_string(),
            source,
        })?;

    if req.drain_delay.is_zero() {
        info!(step = %Step::DrainDelay, "Drain delay is 0, deleting shadow immediately");
    } else {
        info!(
            step = %Step::DrainDelay,
            seconds = req.drain_delay.as_secs(),
            "Waiting for endpoints to drain"
        );
        ctx.clock.sleep(req.drain_delay).await;
    }

    info!(step = %Step::DestroyShadow, deployment = %shadow_name, namespace = %ns);
    ctx.cluster
        .delete_deployment(
            ns,
            &shadow_name,
            &delete_with_grace(ctx.settings.grace_period_secs),
        )
        .await
        .map_err(at(Step::DestroyShadow, ns, name))?;

    info!(
        deployment = %name,
        namespace = %ns,
        backup = %backup.display(),
        advisories = advisories.len(),
        "Relabel complete"
    );
    Ok(RelabelOutcome::Relabeled { backup, advisories })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
#[path = "migrate_test.rs"]
mod tests;
