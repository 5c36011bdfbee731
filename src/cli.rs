//! Command line surface
//!
//! `relabel <verb> <resource>` mirrors kubectl's shape: `get deployment`,
//! `copy deployment`, `update cronjob|deployment`, `delete deployment`,
//! `undo deployment`.

use crate::cluster::{ClusterError, KubeCluster};
use crate::config::{ConfigError, Settings};
use crate::controller::clock::SystemClock;
use crate::controller::confirm::{AutoConfirm, Confirmer, TerminalConfirmer};
use crate::controller::copy::{copy_deployment, delete_copy, CopyError, CopyRequest};
use crate::controller::cronjob::{relabel_cronjob, CronJobRelabel, DEFAULT_CRONJOB_TYPE};
use crate::controller::inspect::unhealthy_pods;
use crate::controller::labels::{LabelError, WorkloadKind};
use crate::controller::migrate::{
    relabel_deployment, DeploymentRelabel, MigrationError, Step, EXIT_FAILURE,
    EXIT_INPUT,
};
use crate::controller::resources::{
    update_resources, ResourceError, ResourceTarget, ResourceUpdate,
};
use crate::controller::revision::{undo_deployment, RevisionError};
use crate::controller::Context;
use clap::{Args, Parser, Subcommand};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Relabel Kubernetes workloads without dropping traffic
#[derive(Parser, Debug)]
#[command(name = "relabel")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to a kubeconfig file (default: $KUBECONFIG or ~/.kube/config)
    #[arg(long, global = true)]
    pub kubeconfig: Option<PathBuf>,

    /// Kubeconfig context to use
    #[arg(long, global = true)]
    pub context: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Report unhealthy pods
    Get {
        #[command(subcommand)]
        resource: GetResource,
    },
    /// Copy a deployment and its service to another namespace
    #[command(visible_alias = "cp")]
    Copy {
        #[command(subcommand)]
        resource: CopyResource,
    },
    /// Relabel workloads or change container resources
    Update {
        #[command(subcommand)]
        resource: UpdateResource,
    },
    /// Delete a copied deployment and its service
    #[command(visible_alias = "del")]
    Delete {
        #[command(subcommand)]
        resource: DeleteResource,
    },
    /// Roll a deployment back to its previous revision
    Undo {
        #[command(subcommand)]
        resource: UndoResource,
    },
}

#[derive(Subcommand, Debug)]
pub enum GetResource {
    /// Pods of unconverged deployments that keep crashing
    #[command(visible_alias = "deploy")]
    Deployment {
        /// Namespace to scan; empty or `all` scans every namespace
        #[arg(long, visible_alias = "ns")]
        namespace: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum CopyResource {
    #[command(visible_alias = "deploy")]
    Deployment(CopyDeploymentArgs),
}

#[derive(Args, Debug)]
pub struct CopyDeploymentArgs {
    /// Deployment (and service) name
    #[arg(long, short = 'n')]
    pub name: String,

    /// Source namespace
    #[arg(long, short = 'f')]
    pub from: String,

    /// Destination namespace
    #[arg(long, short = 't')]
    pub to: String,

    /// Replica count of the copy
    #[arg(long, default_value_t = 1)]
    pub replicas: i32,

    /// Image tag for the copy's first container
    #[arg(long)]
    pub tag: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum UpdateResource {
    /// Relabel a CronJob in place
    #[command(visible_alias = "cron")]
    Cronjob(UpdateCronJobArgs),
    /// Relabel a deployment through a shadow copy, or set container resources
    #[command(visible_alias = "deploy")]
    Deployment(UpdateDeploymentArgs),
}

/// Flags shared by both relabel flows
#[derive(Args, Debug)]
pub struct RelabelArgs {
    #[arg(long, short = 'n')]
    pub name: String,

    #[arg(long, visible_alias = "ns")]
    pub namespace: String,

    /// Target labels as `k=v,k=v`; omit for the stable set
    #[arg(long, short = 'l')]
    pub labels: Option<String>,

    /// `app` label for the stable set (defaults to the name)
    #[arg(long, short = 'a')]
    pub app: Option<String>,

    /// Skip confirmation prompts
    #[arg(long, visible_alias = "autocheck")]
    pub auto: bool,
}

#[derive(Args, Debug)]
pub struct UpdateCronJobArgs {
    #[command(flatten)]
    pub relabel: RelabelArgs,

    /// `type` label; anything but `api`
    #[arg(long = "type", short = 't', default_value = DEFAULT_CRONJOB_TYPE)]
    pub type_label: String,
}

#[derive(Args, Debug)]
pub struct UpdateDeploymentArgs {
    #[command(flatten)]
    pub relabel: RelabelArgs,

    /// Workload type: api, fe or script
    #[arg(long = "type", short = 't', default_value = "api")]
    pub type_label: String,

    /// Seconds between the service cutover and shadow teardown
    #[arg(long, visible_alias = "time", default_value_t = 10)]
    pub timeout: u64,

    /// CPU request for every container, e.g. 50m
    #[arg(long, visible_alias = "reqc")]
    pub request_cpu: Option<String>,

    /// Memory request for every container, e.g. 128Mi
    #[arg(long, visible_alias = "reqm")]
    pub request_mem: Option<String>,

    /// CPU limit for every container, e.g. 2000m
    #[arg(long, visible_alias = "limc")]
    pub limit_cpu: Option<String>,

    /// Memory limit for every container, e.g. 2048Mi
    #[arg(long, visible_alias = "limm")]
    pub limit_mem: Option<String>,
}

impl UpdateDeploymentArgs {
    /// Validated resource updates; empty when no resource flag was given
    fn resource_updates(&self) -> Result<Vec<ResourceUpdate>, ResourceError> {
        let mut updates = Vec::new();
        for (target, cpu, mem) in [
            (ResourceTarget::Requests, &self.request_cpu, &self.request_mem),
            (ResourceTarget::Limits, &self.limit_cpu, &self.limit_mem),
        ] {
            if cpu.is_some() || mem.is_some() {
                updates.push(ResourceUpdate::new(
                    target,
                    cpu.as_deref(),
                    mem.as_deref(),
                )?);
            }
        }
        Ok(updates)
    }

    /// Relabel request; `--timeout` becomes the drain delay
    fn relabel_request(&self) -> Result<DeploymentRelabel, LabelError> {
        Ok(DeploymentRelabel {
            namespace: self.relabel.namespace.clone(),
            name: self.relabel.name.clone(),
            kind: self.type_label.trim().parse()?,
            labels: self.relabel.labels.clone(),
            app: self.relabel.app.clone(),
            drain_delay: Duration::from_secs(self.timeout),
        })
    }
}

#[derive(Subcommand, Debug)]
pub enum DeleteResource {
    #[command(visible_alias = "deploy")]
    Deployment(TargetArgs),
}

#[derive(Subcommand, Debug)]
pub enum UndoResource {
    #[command(visible_alias = "deploy")]
    Deployment(TargetArgs),
}

#[derive(Args, Debug)]
pub struct TargetArgs {
    #[arg(long, short = 'n')]
    pub name: String,

    #[arg(long, visible_alias = "ns")]
    pub namespace: String,
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to connect to the cluster: {0}")]
    Connect(String),

    #[error(transparent)]
    Migration(#[from] MigrationError),

    #[error(transparent)]
    Copy(#[from] CopyError),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error(transparent)]
    Revision(#[from] RevisionError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

impl From<LabelError> for CommandError {
    fn from(e: LabelError) -> Self {
        CommandError::Migration(MigrationError::Input(e))
    }
}

impl CommandError {
    pub fn exit_code(&self) -> u8 {
        match self {
            CommandError::Config(_) => EXIT_INPUT,
            CommandError::Migration(e) => e.exit_code(),
            CommandError::Copy(CopyError::SameNamespace(_)) => EXIT_INPUT,
            CommandError::Resource(
                ResourceError::InvalidQuantity { .. } | ResourceError::Empty(_),
            ) => EXIT_INPUT,
            _ => EXIT_FAILURE,
        }
    }

    /// Step at which a migration stopped, if it got that far
    pub fn failed_step(&self) -> Option<Step> {
        match self {
            CommandError::Migration(
                MigrationError::Step { step, .. }
                | MigrationError::Convergence { step, .. }
                | MigrationError::Prompt { step, .. },
            ) => Some(*step),
            _ => None,
        }
    }

    /// What the operator should do next
    pub fn remediation(&self) -> String {
        match self {
            CommandError::Config(_) => "fix the RELABEL_* environment and rerun".to_string(),
            CommandError::Connect(_) => {
                "check --kubeconfig/--context and that the cluster is reachable".to_string()
            }
            CommandError::Migration(e) => e.remediation(),
            CommandError::Copy(CopyError::SameNamespace(_)) => {
                "pick a destination namespace different from the source".to_string()
            }
            CommandError::Copy(_) => {
                "inspect the destination namespace; rerunning the copy replaces partial copies"
                    .to_string()
            }
            CommandError::Resource(ResourceError::InvalidQuantity { .. })
            | CommandError::Resource(ResourceError::Empty(_)) => {
                "use Kubernetes quantities such as 50m, 2, 128Mi or 1.5Gi; nothing was sent to the cluster"
                    .to_string()
            }
            CommandError::Resource(_) | CommandError::Cluster(_) => {
                "check the name and namespace and rerun".to_string()
            }
            CommandError::Revision(RevisionError::NotEnoughHistory { .. }) => {
                "there is no earlier revision to return to; nothing was changed".to_string()
            }
            CommandError::Revision(_) => "check the name and namespace and rerun".to_string(),
        }
    }
}

/// Build a kube client from `--kubeconfig`/`--context`, else kube defaults
async fn connect(
    kubeconfig: Option<&PathBuf>,
    context: Option<&str>,
) -> Result<Client, CommandError> {
    if kubeconfig.is_none() && context.is_none() {
        return Client::try_default()
            .await
            .map_err(|e| CommandError::Connect(e.to_string()));
    }

    let kc = match kubeconfig {
        Some(path) => Kubeconfig::read_from(path).map_err(|e| {
            CommandError::Connect(format!("failed to read kubeconfig {}: {}", path.display(), e))
        })?,
        None => Kubeconfig::read()
            .map_err(|e| CommandError::Connect(format!("failed to read kubeconfig: {}", e)))?,
    };
    let options = KubeConfigOptions {
        context: context.map(str::to_string),
        ..Default::default()
    };
    let config = Config::from_custom_kubeconfig(kc, &options)
        .await
        .map_err(|e| CommandError::Connect(e.to_string()))?;
    Client::try_from(config).map_err(|e| CommandError::Connect(e.to_string()))
}

impl Cli {
    /// Run the selected command
    pub async fn run(self, settings: Settings) -> Result<(), CommandError> {
        let kubeconfig = self.kubeconfig;
        let context = self.context;
        let session = Session {
            kubeconfig: kubeconfig.as_ref(),
            context: context.as_deref(),
            settings,
        };

        match self.command {
            Commands::Get {
                resource: GetResource::Deployment { namespace },
            } => session.get_deployment(namespace).await,
            Commands::Copy {
                resource: CopyResource::Deployment(args),
            } => session.copy_deployment(args).await,
            Commands::Update {
                resource: UpdateResource::Cronjob(args),
            } => session.update_cronjob(args).await,
            Commands::Update {
                resource: UpdateResource::Deployment(args),
            } => session.update_deployment(args).await,
            Commands::Delete {
                resource: DeleteResource::Deployment(args),
            } => session.delete_deployment(args).await,
            Commands::Undo {
                resource: UndoResource::Deployment(args),
            } => session.undo_deployment(args).await,
        }
    }
}

struct Session<'a> {
    kubeconfig: Option<&'a PathBuf>,
    context: Option<&'a str>,
    settings: Settings,
}

impl Session<'_> {
    async fn cluster(&self) -> Result<KubeCluster, CommandError> {
        let client = connect(self.kubeconfig, self.context).await?;
        Ok(KubeCluster::new(client))
    }

    async fn context(&self, auto: bool, settings: Settings) -> Result<Context, CommandError> {
        let confirmer: Arc<dyn Confirmer> = if auto {
            Arc::new(AutoConfirm)
        } else {
            Arc::new(TerminalConfirmer::terminal())
        };
        Ok(Context::new(
            Arc::new(self.cluster().await?),
            Arc::new(SystemClock),
            confirmer,
            settings,
        ))
    }

    async fn get_deployment(&self, namespace: Option<String>) -> Result<(), CommandError> {
        let scope = namespace
            .map(|ns| ns.trim().to_string())
            .filter(|ns| !ns.is_empty() && ns != "all");
        let cluster = self.cluster().await?;

        let report =
            unhealthy_pods(&cluster, scope.as_deref(), self.settings.restart_threshold).await?;
        let scope = scope.as_deref().unwrap_or("all");
        if report.is_empty() {
            info!(namespace = %scope, "No unhealthy pods found");
            return Ok(());
        }
        for pod in &report {
            info!(
                namespace = %pod.namespace,
                deployment = %pod.deployment,
                pod = %pod.pod,
                restarts = pod.restarts,
                "Unhealthy pod"
            );
        }
        Ok(())
    }

    async fn copy_deployment(&self, args: CopyDeploymentArgs) -> Result<(), CommandError> {
        let req = CopyRequest {
            name: args.name,
            from: args.from,
            to: args.to,
            replicas: args.replicas,
            tag: args.tag,
        };
        if req.from == req.to {
            return Err(CopyError::SameNamespace(req.to).into());
        }
        let ctx = self.context(true, self.settings.clone()).await?;
        copy_deployment(&ctx, &req).await?;
        Ok(())
    }

    async fn update_cronjob(&self, args: UpdateCronJobArgs) -> Result<(), CommandError> {
        let req = CronJobRelabel {
            namespace: args.relabel.namespace,
            name: args.relabel.name,
            labels: args.relabel.labels,
            app: args.relabel.app,
            type_label: args.type_label,
        };
        let ctx = self.context(args.relabel.auto, self.settings.clone()).await?;
        relabel_cronjob(&ctx, &req).await?;
        Ok(())
    }

    async fn update_deployment(&self, args: UpdateDeploymentArgs) -> Result<(), CommandError> {
        let updates = args.resource_updates()?;
        if !updates.is_empty() {
            let cluster = self.cluster().await?;
            for update in &updates {
                update_resources(
                    &cluster,
                    &args.relabel.namespace,
                    &args.relabel.name,
                    update,
                )
                .await?;
            }
            return Ok(());
        }

        let req = args.relabel_request()?;
        let ctx = self.context(args.relabel.auto, self.settings.clone()).await?;
        relabel_deployment(&ctx, &req).await?;
        Ok(())
    }

    async fn delete_deployment(&self, args: TargetArgs) -> Result<(), CommandError> {
        let ctx = self.context(true, self.settings.clone()).await?;
        delete_copy(&ctx, &args.namespace, &args.name).await?;
        Ok(())
    }

    async fn undo_deployment(&self, args: TargetArgs) -> Result<(), CommandError> {
        let cluster = self.cluster().await?;
        let selection = undo_deployment(&cluster, &args.namespace, &args.name).await?;
        info!(
            deployment = %args.name,
            namespace = %args.namespace,
            revision = selection.revision,
            replicaset = %selection.replicaset,
            "Rolled back"
        );
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
#[path = "cli_test.rs"]
mod tests;
