//! Trap cleanup
//!
//! Two cleanup flows share the same machinery: the finalizer removes every
//! recorded trap when a policy is deleted, and every reconciliation removes
//! traps whose identity no longer appears in the policy spec.

use tracing::info;

use crate::captor::tetragon;
use crate::crd::DeceptionPolicy;
use crate::decoy;
use crate::kube_ops::KubeOps;
use crate::ledger;
use crate::Result;

/// Remove every trap recorded on behalf of the policy, on every annotated
/// workload. Run by the finalizer before the policy may disappear.
pub async fn cleanup_policy(ops: &dyn KubeOps, policy: &DeceptionPolicy) -> Result<()> {
    let policy_name = policy.metadata.name.clone().unwrap_or_default();

    for workload in ledger::annotated_workloads(ops, &policy_name).await? {
        let change = ledger::change_for(&workload, &policy_name)?;
        for record in &change.traps {
            decoy::remove_decoy(ops, &policy_name, record, &workload).await?;
        }
    }

    Ok(())
}

/// Remove the decoys and captors of traps that were dropped from the
/// policy spec.
pub async fn cleanup_removed_traps(ops: &dyn KubeOps, policy: &DeceptionPolicy) -> Result<()> {
    cleanup_removed_captors(ops, policy).await?;
    cleanup_removed_decoys(ops, policy).await?;
    Ok(())
}

/// Delete tracing policies labeled with this policy whose deterministic
/// name no longer derives from any declared trap.
async fn cleanup_removed_captors(ops: &dyn KubeOps, policy: &DeceptionPolicy) -> Result<()> {
    let policy_name = policy.metadata.name.clone().unwrap_or_default();

    let tracing_policies = match ops.list_tracing_policies(policy_name).await {
        Ok(list) => list,
        // The tracing operator is not installed, so there is nothing of
        // ours to clean up either
        Err(e) if e.is_not_found() => return Ok(()),
        Err(e) => return Err(e),
    };

    let mut expected = Vec::with_capacity(policy.spec.traps.len());
    for trap in &policy.spec.traps {
        expected.push(tetragon::tracing_policy_name(trap)?);
    }

    for tracing_policy in tracing_policies {
        let name = tracing_policy.metadata.name.unwrap_or_default();
        if !expected.contains(&name) {
            info!(tracing_policy = %name, "deleting tracing policy for removed trap");
            ops.delete_tracing_policy(name).await?;
        }
    }

    Ok(())
}

/// Remove recorded decoys whose identity no longer matches any declared
/// trap, on every annotated workload.
async fn cleanup_removed_decoys(ops: &dyn KubeOps, policy: &DeceptionPolicy) -> Result<()> {
    let policy_name = policy.metadata.name.clone().unwrap_or_default();

    for workload in ledger::annotated_workloads(ops, &policy_name).await? {
        let change = ledger::change_for(&workload, &policy_name)?;
        for record in &change.traps {
            let still_declared = policy
                .spec
                .traps
                .iter()
                .any(|trap| ledger::are_the_same_trap(record, trap));
            if !still_declared {
                info!(workload = %workload.name(), "removing trap that was dropped from the policy");
                decoy::remove_decoy(ops, &policy_name, record, &workload).await?;
            }
        }
    }

    Ok(())
}
