//! In-Place Label Orchestrator (CronJob)
//!
//! CronJob labels are mutable, so no shadow is needed: diff, confirm, back up,
//! then overwrite the object, job-template and pod-template labels with a
//! bounded retry.

use crate::controller::backup::to_backup_document;
use crate::controller::context::Context;
use crate::controller::labels::{
    labels_of, resolve_target_labels, LabelDiff, LabelMap, LabelRequest, WorkloadKind,
};
use crate::controller::migrate::{MigrationError, RelabelOutcome, Step};
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::{info, warn};

/// Default `type` label for background jobs
pub const DEFAULT_CRONJOB_TYPE: &str = "cronjob";

/// Relabel request for a CronJob
#[derive(Debug, Clone)]
pub struct CronJobRelabel {
    pub namespace: String,
    pub name: String,
    /// Raw `k=v,k=v`; empty or absent selects the stable label set
    pub labels: Option<String>,
    pub app: Option<String>,
    /// `type` label for the stable set; `api` is rejected
    pub type_label: String,
}

/// Object, job-template and pod-template labels, in that order
fn label_maps(cronjob: &CronJob) -> [LabelMap; 3] {
    let job_template = cronjob.spec.as_ref().map(|spec| &spec.job_template);
    [
        labels_of(Some(&cronjob.metadata)),
        labels_of(job_template.and_then(|jt| jt.metadata.as_ref())),
        labels_of(
            job_template
                .and_then(|jt| jt.spec.as_ref())
                .and_then(|job| job.template.metadata.as_ref()),
        ),
    ]
}

/// Replace all three label maps with `labels`
pub fn apply_labels(cronjob: &mut CronJob, labels: &LabelMap) {
    cronjob.metadata.labels = Some(labels.clone());

    if let Some(spec) = cronjob.spec.as_mut() {
        let job_template = &mut spec.job_template;
        job_template
            .metadata
            .get_or_insert_with(ObjectMeta::default)
            .labels = Some(labels.clone());

        if let Some(job) = job_template.spec.as_mut() {
            job.template
                .metadata
                .get_or_insert_with(ObjectMeta::default)
                .labels = Some(labels.clone());
        }
    }
}

/// Relabel a CronJob in place
///
/// Each attempt re-fetches the object so it carries a fresh resourceVersion.
/// Any update failure counts as a failed attempt; once the attempts are used
/// up the last error is returned as [`MigrationError::RetriesExhausted`].
pub async fn relabel_cronjob(
    ctx: &Context,
    req: &CronJobRelabel,
) -> Result<RelabelOutcome, MigrationError> {
    let ns = req.namespace.as_str();
    let name = req.name.as_str();
    let target = resolve_target_labels(
        WorkloadKind::BackgroundJob,
        &LabelRequest {
            name: req.name.clone(),
            app: req.app.clone(),
            type_label: req.type_label.clone(),
            raw: req.labels.clone(),
        },
    )?
    .workload;

    let original = ctx
        .cluster
        .get_cronjob(ns, name)
        .await
        .map_err(|source| MigrationError::Step {
            step: Step::FetchOriginal,
            namespace: ns.to_string(),
            name: name.to_string(),
            source,
        })?;

    if label_maps(&original).iter().all(|labels| *labels == target) {
        info!(cronjob = %name, namespace = %ns, "Labels already match, nothing to do");
        return Ok(RelabelOutcome::Unchanged);
    }

    let plan = format!(
        "Relabel CronJob {}/{}\n  labels:\n{}Proceed?",
        ns,
        name,
        LabelDiff::between(&label_maps(&original)[0], &target)
    );
    info!(cronjob = %name, "\n{}", plan);
    ctx.confirmer
        .confirm(&plan)
        .await
        .map_err(|source| MigrationError::Prompt {
            step: Step::Confirm,
            namespace: ns.to_string(),
            name: name.to_string(),
            source,
        })?;

    let backup = ctx.backups.write(
        ns,
        name,
        &[to_backup_document(&original)?],
        ctx.clock.now(),
    )?;

    let attempts = ctx.settings.retry_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;

        let result = match ctx.cluster.get_cronjob(ns, name).await {
            Ok(mut current) => {
                apply_labels(&mut current, &target);
                ctx.cluster.replace_cronjob(ns, &current).await.map(|_| ())
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                info!(cronjob = %name, namespace = %ns, attempt, "CronJob relabeled");
                return Ok(RelabelOutcome::Relabeled {
                    backup,
                    advisories: Vec::new(),
                });
            }
            Err(source) if attempt >= attempts => {
                return Err(MigrationError::RetriesExhausted {
                    namespace: ns.to_string(),
                    name: name.to_string(),
                    attempts,
                    source,
                });
            }
            Err(e) => {
                warn!(
                    cronjob = %name,
                    namespace = %ns,
                    attempt,
                    error = %e,
                    "Label update failed, retrying"
                );
                ctx.clock.sleep(ctx.settings.retry_backoff).await;
            }
        }
    }
}
