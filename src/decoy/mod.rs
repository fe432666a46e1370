//! Decoy deployment
//!
//! A decoy is the artifact an attacker sees. Deployment and removal are
//! dispatched on the trap kind; only filesystem honeytokens are built
//! today.

pub mod filesystoken;

use crate::crd::{DeceptionPolicy, Trap, TrapKind, TrapRecord, TrapType};
use crate::kube_ops::KubeOps;
use crate::results::DecoyDeploymentResult;
use crate::workload::Workload;
use crate::{Error, Result};

/// Deploy the decoy for a trap, dispatching on the trap kind.
pub async fn deploy_decoy(
    ops: &dyn KubeOps,
    policy: &DeceptionPolicy,
    trap: &Trap,
) -> DecoyDeploymentResult {
    match &trap.kind {
        TrapKind::FilesystemHoneytoken(_) => filesystoken::deploy(ops, policy, trap).await,
        TrapKind::HttpEndpoint(_) => DecoyDeploymentResult {
            errors: vec![Error::not_implemented("HttpEndpoint traps")],
            ..Default::default()
        },
        TrapKind::HttpPayload(_) => DecoyDeploymentResult {
            errors: vec![Error::not_implemented("HttpPayload traps")],
            ..Default::default()
        },
    }
}

/// Remove a recorded decoy from a workload, dispatching on the recorded
/// trap kind.
pub async fn remove_decoy(
    ops: &dyn KubeOps,
    policy_name: &str,
    record: &TrapRecord,
    workload: &Workload,
) -> Result<()> {
    match record.trap_type() {
        Some(TrapType::FilesystemHoneytoken) => {
            filesystoken::remove(ops, policy_name, record, workload).await
        }
        // TODO: Implement once the HTTP trap kinds are built.
        Some(TrapType::HttpEndpoint) | Some(TrapType::HttpPayload) | None => Ok(()),
    }
}
