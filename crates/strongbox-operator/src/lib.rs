//! strongbox operator: database backup, restore and retention for Kubernetes

#![deny(missing_docs)]

/// Command line and environment configuration
pub mod config;
/// Controller futures, one per record kind
pub mod controller_runner;
/// CRD generation and installation
pub mod crds;
