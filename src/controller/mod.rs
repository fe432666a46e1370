//! Controller implementation for DeceptionPolicy resources
//!
//! The reconciler follows the Kubernetes controller pattern: observe the
//! declared traps, diff them against the ledgers on the cluster's
//! workloads, deploy or remove decoys and captors, and publish the outcome
//! as status conditions.

pub mod cleanup;
pub mod conditions;
pub mod reconciler;
pub mod watch;

pub use reconciler::{error_policy, reconcile, Context};
pub use watch::{map_workload_event, WorkloadChangeTracker};
