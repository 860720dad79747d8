pub mod istio;
pub mod someapp;
