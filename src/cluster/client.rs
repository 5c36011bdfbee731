use super::{ClusterApi, ClusterError};
use crate::controller::labels::label_selector;
use crate::controller::revision::{revision_of, POD_TEMPLATE_HASH_LABEL};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::Client;
use std::collections::BTreeMap;
use tracing::debug;

/// [`ClusterApi`] backed by a real API server
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        KubeCluster { client }
    }

    fn deployments(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn services(&self, namespace: &str) -> Api<Service> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Map a `kube::Error` for a named object onto [`ClusterError`]
fn classify(
    kind: &'static str,
    namespace: &str,
    name: &str,
) -> impl FnOnce(kube::Error) -> ClusterError {
    let namespace = namespace.to_string();
    let name = name.to_string();
    move |err| match err {
        kube::Error::Api(ref status) if status.code == 404 => ClusterError::NotFound {
            kind,
            namespace,
            name,
        },
        kube::Error::Api(ref status) if status.code == 409 && status.reason == "AlreadyExists" => {
            ClusterError::AlreadyExists {
                kind,
                namespace,
                name,
            }
        }
        kube::Error::Api(ref status) if status.code == 409 => ClusterError::Conflict {
            kind,
            namespace,
            name,
            message: status.message.clone(),
        },
        other => ClusterError::Api(other),
    }
}

fn object_name(meta_name: Option<&String>, kind: &'static str) -> Result<String, ClusterError> {
    meta_name
        .cloned()
        .ok_or(ClusterError::MissingName { kind })
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment, ClusterError> {
        self.deployments(namespace)
            .get(name)
            .await
            .map_err(classify("Deployment", namespace, name))
    }

    async fn list_deployments(
        &self,
        namespace: Option<&str>,
    ) -> Result<Vec<Deployment>, ClusterError> {
        let api: Api<Deployment> = match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(ClusterError::Api)?;
        Ok(list.items)
    }

    async fn create_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, ClusterError> {
        let name = object_name(deployment.metadata.name.as_ref(), "Deployment")?;
        self.deployments(namespace)
            .create(&PostParams::default(), deployment)
            .await
            .map_err(classify("Deployment", namespace, &name))
    }

    async fn replace_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, ClusterError> {
        let name = object_name(deployment.metadata.name.as_ref(), "Deployment")?;
        self.deployments(namespace)
            .replace(&name, &PostParams::default(), deployment)
            .await
            .map_err(classify("Deployment", namespace, &name))
    }

    async fn delete_deployment(
        &self,
        namespace: &str,
        name: &str,
        params: &DeleteParams,
    ) -> Result<(), ClusterError> {
        self.deployments(namespace)
            .delete(name, params)
            .await
            .map(|_| ())
            .map_err(classify("Deployment", namespace, name))
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, ClusterError> {
        self.services(namespace)
            .get(name)
            .await
            .map_err(classify("Service", namespace, name))
    }

    async fn create_service(
        &self,
        namespace: &str,
        service: &Service,
    ) -> Result<Service, ClusterError> {
        let name = object_name(service.metadata.name.as_ref(), "Service")?;
        self.services(namespace)
            .create(&PostParams::default(), service)
            .await
            .map_err(classify("Service", namespace, &name))
    }

    async fn replace_service(
        &self,
        namespace: &str,
        service: &Service,
    ) -> Result<Service, ClusterError> {
        let name = object_name(service.metadata.name.as_ref(), "Service")?;
        self.services(namespace)
            .replace(&name, &PostParams::default(), service)
            .await
            .map_err(classify("Service", namespace, &name))
    }

    async fn delete_service(
        &self,
        namespace: &str,
        name: &str,
        params: &DeleteParams,
    ) -> Result<(), ClusterError> {
        self.services(namespace)
            .delete(name, params)
            .await
            .map(|_| ())
            .map_err(classify("Service", namespace, name))
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>, ClusterError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = api
            .list(&ListParams::default().labels(selector))
            .await
            .map_err(ClusterError::Api)?;
        Ok(list.items)
    }

    async fn get_cronjob(&self, namespace: &str, name: &str) -> Result<CronJob, ClusterError> {
        let api: Api<CronJob> = Api::namespaced(self.client.clone(), namespace);
        api.get(name)
            .await
            .map_err(classify("CronJob", namespace, name))
    }

    async fn replace_cronjob(
        &self,
        namespace: &str,
        cronjob: &CronJob,
    ) -> Result<CronJob, ClusterError> {
        let name = object_name(cronjob.metadata.name.as_ref(), "CronJob")?;
        let api: Api<CronJob> = Api::namespaced(self.client.clone(), namespace);
        api.replace(&name, &PostParams::default(), cronjob)
            .await
            .map_err(classify("CronJob", namespace, &name))
    }

    async fn deployment_revisions(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<i64, ReplicaSet>, ClusterError> {
        let deployment = self.get_deployment(namespace, name).await?;
        let uid = deployment.metadata.uid.clone().unwrap_or_default();
        let selector = deployment
            .spec
            .as_ref()
            .and_then(|spec| spec.selector.match_labels.as_ref())
            .map(label_selector)
            .unwrap_or_default();

        let rs_api: Api<ReplicaSet> = Api::namespaced(self.client.clone(), namespace);
        let replicasets = rs_api
            .list(&ListParams::default().labels(&selector))
            .await
            .map_err(ClusterError::Api)?;

        let mut history = BTreeMap::new();
        for rs in replicasets.items {
            let owned = rs
                .metadata
                .owner_references
                .iter()
                .flatten()
                .any(|owner| owner.uid == uid);
            if !owned {
                continue;
            }
            match revision_of(&rs) {
                Some(revision) => {
                    history.insert(revision, rs);
                }
                None => debug!(
                    replicaset = ?rs.metadata.name,
                    "ReplicaSet has no revision annotation, skipping"
                ),
            }
        }

        Ok(history)
    }

    async fn rollback_deployment(
        &self,
        namespace: &str,
        name: &str,
        revision: i64,
    ) -> Result<(), ClusterError> {
        let history = self.deployment_revisions(namespace, name).await?;
        let rs = history.get(&revision).ok_or_else(|| {
            ClusterError::Unexpected(format!(
                "revision {} of Deployment {}/{} is no longer retained",
                revision, namespace, name
            ))
        })?;

        let mut template = rs
            .spec
            .as_ref()
            .and_then(|spec| spec.template.clone())
            .unwrap_or_default();
        if let Some(labels) = template
            .metadata
            .as_mut()
            .and_then(|meta| meta.labels.as_mut())
        {
            labels.remove(POD_TEMPLATE_HASH_LABEL);
        }

        let mut deployment = self.get_deployment(namespace, name).await?;
        if let Some(spec) = deployment.spec.as_mut() {
            spec.template = template;
        }
        self.replace_deployment(namespace, &deployment).await?;
        Ok(())
    }
}
