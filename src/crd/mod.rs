//! Waybill Custom Resource Definition
//!
//! The Waybill CRD is the per-namespace declarative reconciliation record: it
//! points at a subtree of the git working tree and carries the flags that
//! control how that subtree is applied to the cluster.

mod waybill;

pub use waybill::{ObjectReference, Waybill, WaybillSpec, WaybillStatus, WaybillStatusRun};
