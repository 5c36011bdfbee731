//! relabel: change the labels of live Kubernetes workloads without dropping traffic
//!
//! Deployment selectors are immutable, so a deployment is relabeled by standing
//! up a shadow copy, recreating the original with the new labels and moving
//! its Service across. CronJobs are relabeled in place.

pub mod cli;
pub mod cluster;
pub mod config;
pub mod controller;
