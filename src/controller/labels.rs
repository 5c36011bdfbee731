//! Label Set Resolver
//!
//! Turns operator input (an explicit `k=v,k=v` string, or the stable naming
//! convention) into the target label map for a workload and, for externally
//! reachable workloads, the reduced selector map for its Service.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Label map as stored by the API server (ordering is irrelevant to equality)
pub type LabelMap = BTreeMap<String, String>;

pub const STABLE: &str = "stable";
pub const CICD_ENV_LABEL: &str = "cicd_env";
pub const VERSION_LABEL: &str = "version";

/// Type label a background job may never carry: `api` ties a workload to its Service
pub const API_TYPE: &str = "api";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LabelError {
    #[error("invalid label segment '{segment}': expected key=value (e.g. \"app=nginx,version=stable\")")]
    MalformedSegment { segment: String },

    #[error("label key '{key}' given more than once")]
    DuplicateKey { key: String },

    #[error("unknown workload type '{0}': expected one of api, fe, script")]
    UnknownType(String),

    #[error("CronJob cannot use type=api: that type binds the workload to a Service")]
    ApiTypeOnBackgroundJob,
}

/// Closed set of workload kinds this tool knows how to relabel
///
/// The kind decides whether a Service is part of the migration and how its
/// selector is derived from the workload labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadKind {
    /// `script`: Deployment with no Service in front of it
    Internal,
    /// `api`: Deployment behind a Service; selector drops `cicd_env` and `version`
    ExternalStable,
    /// `fe`: Deployment behind a Service; selector drops `version` only
    ExternalFrontend,
    /// CronJob; relabeled in place
    BackgroundJob,
}

impl WorkloadKind {
    /// Whether this kind is fronted by a Service that must be cut over
    pub fn has_routing(&self) -> bool {
        match self {
            WorkloadKind::ExternalStable | WorkloadKind::ExternalFrontend => true,
            WorkloadKind::Internal | WorkloadKind::BackgroundJob => false,
        }
    }

    /// Default `type` label value for this kind
    pub fn type_label(&self) -> &'static str {
        match self {
            WorkloadKind::Internal => "script",
            WorkloadKind::ExternalStable => API_TYPE,
            WorkloadKind::ExternalFrontend => "fe",
            WorkloadKind::BackgroundJob => "cronjob",
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_label())
    }
}

impl FromStr for WorkloadKind {
    type Err = LabelError;

    /// Parse a Deployment `--type` value
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "api" => Ok(WorkloadKind::ExternalStable),
            "fe" => Ok(WorkloadKind::ExternalFrontend),
            "script" => Ok(WorkloadKind::Internal),
            other => Err(LabelError::UnknownType(other.to_string())),
        }
    }
}

/// Operator input for label resolution
#[derive(Debug, Clone, Default)]
pub struct LabelRequest {
    /// Workload name; default for `name` and `app`
    pub name: String,
    /// Declared application name; overrides `app` in the stable set
    pub app: Option<String>,
    /// Value for the `type` label in the stable set
    pub type_label: String,
    /// Raw `k=v,k=v` string; empty or absent selects the stable set
    pub raw: Option<String>,
}

/// Resolved targets: workload labels plus the Service selector when the kind has one
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetLabels {
    pub workload: LabelMap,
    pub routing: Option<LabelMap>,
}

/// Parse `k=v,k=v` into a label map
///
/// Each comma-separated segment is split on its first `=`. Empty segments, a
/// missing `=`, an empty key or value, and repeated keys are all rejected.
pub fn parse_label_string(raw: &str) -> Result<LabelMap, LabelError> {
    let mut labels = LabelMap::new();

    for segment in raw.split(',') {
        let segment = segment.trim();
        let (key, value) = segment
            .split_once('=')
            .ok_or_else(|| LabelError::MalformedSegment {
                segment: segment.to_string(),
            })?;
        let (key, value) = (key.trim(), value.trim());

        if key.is_empty() || value.is_empty() {
            return Err(LabelError::MalformedSegment {
                segment: segment.to_string(),
            });
        }

        if labels.insert(key.to_string(), value.to_string()).is_some() {
            return Err(LabelError::DuplicateKey {
                key: key.to_string(),
            });
        }
    }

    Ok(labels)
}

/// Canonical stable label set: app, name, type, cicd_env=stable, version=stable
pub fn stable_labels(name: &str, app: Option<&str>, type_label: &str) -> LabelMap {
    let app = app.filter(|a| !a.is_empty()).unwrap_or(name);
    LabelMap::from([
        ("app".to_string(), app.to_string()),
        ("name".to_string(), name.to_string()),
        ("type".to_string(), type_label.to_string()),
        (CICD_ENV_LABEL.to_string(), STABLE.to_string()),
        (VERSION_LABEL.to_string(), STABLE.to_string()),
    ])
}

/// Derive the Service selector from workload labels
fn routing_labels(kind: WorkloadKind, workload: &LabelMap) -> Option<LabelMap> {
    let mut routing = workload.clone();
    match kind {
        WorkloadKind::ExternalFrontend => {
            routing.remove(VERSION_LABEL);
        }
        WorkloadKind::ExternalStable => {
            routing.remove(CICD_ENV_LABEL);
            routing.remove(VERSION_LABEL);
        }
        WorkloadKind::Internal | WorkloadKind::BackgroundJob => return None,
    }
    Some(routing)
}

/// Resolve target labels for a workload of the given kind
///
/// Pure: never touches the cluster, so every input error surfaces before any
/// API call is made.
pub fn resolve_target_labels(
    kind: WorkloadKind,
    request: &LabelRequest,
) -> Result<TargetLabels, LabelError> {
    if kind == WorkloadKind::BackgroundJob && request.type_label == API_TYPE {
        return Err(LabelError::ApiTypeOnBackgroundJob);
    }

    let workload = match request.raw.as_deref().map(str::trim) {
        Some(raw) if !raw.is_empty() => parse_label_string(raw)?,
        _ => stable_labels(&request.name, request.app.as_deref(), &request.type_label),
    };

    let routing = routing_labels(kind, &workload);

    Ok(TargetLabels { workload, routing })
}

/// Labels of an optional ObjectMeta; absent means empty
pub fn labels_of(meta: Option<&ObjectMeta>) -> LabelMap {
    meta.and_then(|m| m.labels.clone()).unwrap_or_default()
}

/// Render a label map as a selector string (`k=v,k=v`)
pub fn label_selector(labels: &LabelMap) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Difference between a current and a target label map
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelDiff {
    pub added: Vec<(String, String)>,
    pub removed: Vec<(String, String)>,
    /// (key, current value, target value)
    pub changed: Vec<(String, String, String)>,
}

impl LabelDiff {
    pub fn between(current: &LabelMap, target: &LabelMap) -> Self {
        let mut diff = LabelDiff::default();

        for (key, value) in target {
            match current.get(key) {
                None => diff.added.push((key.clone(), value.clone())),
                Some(old) if old != value => {
                    diff.changed
                        .push((key.clone(), old.clone(), value.clone()))
                }
                Some(_) => {}
            }
        }
        for (key, value) in current {
            if !target.contains_key(key) {
                diff.removed.push((key.clone(), value.clone()));
            }
        }

        diff
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

impl fmt::Display for LabelDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return writeln!(f, "    (unchanged)");
        }
        for (key, old, new) in &self.changed {
            writeln!(f, "    ~ {}: {} -> {}", key, old, new)?;
        }
        for (key, value) in &self.added {
            writeln!(f, "    + {}={}", key, value)?;
        }
        for (key, value) in &self.removed {
            writeln!(f, "    - {}={}", key, value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
#[path = "labels_test.rs"]
mod tests;
