//! Kubernetes client plumbing shared by the operator binaries.

pub mod client;
pub mod metrics;
