//! kube-applier - GitOps reconciliation agent for Kubernetes
//!
//! kube-applier watches a git working tree (kept up to date by an external
//! mirror process) and applies the manifests it contains to the cluster, one
//! isolated run per namespace. Each namespace declares its reconciliation
//! policy through a Waybill custom resource that points at a subtree of the
//! repository and carries flags controlling dry-run, pruning, auto-apply and
//! the secrets used to decrypt and clone it.

pub mod client;
pub mod crd;
mod error;
pub mod git;
pub mod kubectl;
pub mod metrics;
pub mod run;
pub mod sysutil;
pub mod webserver;

pub use error::Error;
