//! Container resource requests and limits
//!
//! Quantities are checked locally so a typo never reaches the API server.

use crate::cluster::{ClusterApi, ClusterError};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use tracing::info;

const BINARY_SUFFIXES: &[&str] = &["Ki", "Mi", "Gi", "Ti", "Pi", "Ei"];
const DECIMAL_SUFFIXES: &[&str] = &["", "m", "k", "M", "G", "T", "P", "E"];

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("invalid quantity '{value}' for {field}")]
    InvalidQuantity { field: &'static str, value: String },

    #[error("no {0} given; pass a cpu and/or memory quantity")]
    Empty(ResourceTarget),

    #[error("deployment {namespace}/{name} has no pod template")]
    NoPodSpec { namespace: String, name: String },

    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

/// Which half of `resources` is written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceTarget {
    Requests,
    Limits,
}

impl fmt::Display for ResourceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceTarget::Requests => write!(f, "requests"),
            ResourceTarget::Limits => write!(f, "limits"),
        }
    }
}

/// Validated cpu/memory quantities for one target
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceUpdate {
    pub target: ResourceTarget,
    pub cpu: Option<Quantity>,
    pub memory: Option<Quantity>,
}

impl ResourceUpdate {
    /// Validate raw flag values; blank values count as absent
    pub fn new(
        target: ResourceTarget,
        cpu: Option<&str>,
        memory: Option<&str>,
    ) -> Result<Self, ResourceError> {
        let cpu = parse_field("cpu", cpu)?;
        let memory = parse_field("memory", memory)?;
        if cpu.is_none() && memory.is_none() {
            return Err(ResourceError::Empty(target));
        }
        Ok(Self {
            target,
            cpu,
            memory,
        })
    }

    /// Merge into an existing quantity map, leaving other resource names alone
    fn merge_into(&self, map: &mut BTreeMap<String, Quantity>) {
        if let Some(cpu) = &self.cpu {
            map.insert("cpu".to_string(), cpu.clone());
        }
        if let Some(memory) = &self.memory {
            map.insert("memory".to_string(), memory.clone());
        }
    }
}

fn parse_field(field: &'static str, raw: Option<&str>) -> Result<Option<Quantity>, ResourceError> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) if is_valid_quantity(value) => Ok(Some(Quantity(value.to_string()))),
        Some(value) => Err(ResourceError::InvalidQuantity {
            field,
            value: value.to_string(),
        }),
    }
}

/// Non-negative Kubernetes quantity: `<number><suffix>`
///
/// Accepts binary SI (`Ki`..`Ei`), decimal SI (`m`, `k`..`E`) and decimal
/// exponents (`1e3`, `5E-2`).
pub fn is_valid_quantity(value: &str) -> bool {
    let value = value.strip_prefix('+').unwrap_or(value);
    let number_end = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value.len());
    let (number, suffix) = value.split_at(number_end);

    let mut parts = number.splitn(2, '.');
    let whole = parts.next().unwrap_or_default();
    let fraction = parts.next();
    let digits = whole.len() + fraction.map_or(0, str::len);
    if digits == 0 || fraction.is_some_and(|f| f.contains('.')) {
        return false;
    }

    if BINARY_SUFFIXES.contains(&suffix) || DECIMAL_SUFFIXES.contains(&suffix) {
        return true;
    }

    match suffix.strip_prefix(|c: char| c == 'e' || c == 'E') {
        Some(exponent) => {
            let exponent = exponent
                .strip_prefix(|c: char| c == '+' || c == '-')
                .unwrap_or(exponent);
            !exponent.is_empty() && exponent.chars().all(|c| c.is_ascii_digit())
        }
        None => false,
    }
}

/// Write `update` into every container of the deployment
pub async fn update_resources(
    cluster: &dyn ClusterApi,
    namespace: &str,
    name: &str,
    update: &ResourceUpdate,
) -> Result<Deployment, ResourceError> {
    let mut deployment = cluster.get_deployment(namespace, name).await?;

    let pod_spec = deployment
        .spec
        .as_mut()
        .and_then(|spec| spec.template.spec.as_mut())
        .ok_or_else(|| ResourceError::NoPodSpec {
            namespace: namespace.to_string(),
            name: name.to_string(),
        })?;

    for container in &mut pod_spec.containers {
        let resources = container.resources.get_or_insert_with(Default::default);
        let map = match update.target {
            ResourceTarget::Requests => &mut resources.requests,
            ResourceTarget::Limits => &mut resources.limits,
        };
        update.merge_into(map.get_or_insert_with(BTreeMap::new));
    }

    let updated = cluster.replace_deployment(namespace, &deployment).await?;
    info!(
        deployment = %name,
        namespace = %namespace,
        target = %update.target,
        cpu = ?update.cpu.as_ref().map(|q| q.0.as_str()),
        memory = ?update.memory.as_ref().map(|q| q.0.as_str()),
        "Container resources updated"
    );
    Ok(updated)
}
