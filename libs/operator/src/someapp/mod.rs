pub mod controller;
pub mod naming;
pub mod reconcile;
