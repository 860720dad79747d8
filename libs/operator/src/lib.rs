//! Someapp operator library.
//!
//! Reconciles `ops.some.cn/v1` Someapp resources into a deployment, an
//! optional horizontal autoscaler, an in-cluster service and a pair of
//! Istio traffic-steering objects, including the stable/canary route
//! lifecycle on the shared routing object.

pub mod controller;
pub mod crd;
pub mod error;
pub mod metrics;
pub mod someapp;
pub mod telemetry;
