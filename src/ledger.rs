//! The per-workload trap annotation (the "ledger")
//!
//! Koney records every installed trap in a JSON annotation on the mutated
//! workload. The ledger is the authoritative account of what the controller
//! has done: the reconciler diffs it against the policy spec, the cleanup
//! paths replay it backwards, and the finalizer only goes away once no
//! records survive anywhere.
//!
//! None of these functions persist the workload; the caller owns
//! persistence (wrapped in an optimistic-concurrency retry).

use chrono::{SecondsFormat, Utc};

use crate::crd::record::{HttpEndpointRecord, HttpPayloadRecord};
use crate::crd::{ChangeRecord, FilesystemHoneytokenRecord, Trap, TrapKind, TrapRecord};
use crate::fingerprint::hash;
use crate::kube_ops::KubeOps;
use crate::workload::Workload;
use crate::{Result, ANNOTATION_KEY_CHANGES};

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Decode the full ledger from a workload's annotation. An absent
/// annotation decodes to an empty ledger.
pub fn decode_changes(workload: &Workload) -> Result<Vec<ChangeRecord>> {
    match workload.annotation(ANNOTATION_KEY_CHANGES) {
        Some(raw) => Ok(serde_json::from_str(raw)?),
        None => Ok(Vec::new()),
    }
}

fn write_changes(workload: &mut Workload, changes: &[ChangeRecord]) -> Result<()> {
    workload.set_annotation(ANNOTATION_KEY_CHANGES, serde_json::to_string(changes)?);
    Ok(())
}

/// Convert a trap specification into a ledger record for the given
/// containers, stamped with the current time.
pub fn record_from_trap(trap: &Trap, containers: &[String]) -> TrapRecord {
    let mut record = TrapRecord {
        deployment_strategy: trap.decoy_deployment.strategy,
        containers: containers.to_vec(),
        created_at: now_rfc3339(),
        updated_at: None,
        filesystem_honeytoken: None,
        http_endpoint: None,
        http_payload: None,
    };

    match &trap.kind {
        TrapKind::FilesystemHoneytoken(token) => {
            record.filesystem_honeytoken = Some(FilesystemHoneytokenRecord {
                file_path: token.file_path.clone(),
                file_content_hash: hash(&token.file_content),
                read_only: token.read_only,
            });
        }
        TrapKind::HttpEndpoint(_) => {
            record.http_endpoint = Some(HttpEndpointRecord::default());
        }
        TrapKind::HttpPayload(_) => {
            record.http_payload = Some(HttpPayloadRecord::default());
        }
    }

    record
}

/// True if a ledger record and a trap specification describe the same
/// installed trap. The container list is ignored: a trap's identity is its
/// strategy, its kind, and the kind-specific fields (path, content hash,
/// read-only flag for filesystem honeytokens).
pub fn are_the_same_trap(record: &TrapRecord, trap: &Trap) -> bool {
    if record.deployment_strategy != trap.decoy_deployment.strategy {
        return false;
    }

    if record.trap_type() != Some(trap.trap_type()) {
        return false;
    }

    match &trap.kind {
        TrapKind::FilesystemHoneytoken(token) => {
            let Some(recorded) = &record.filesystem_honeytoken else {
                return false;
            };
            recorded.file_path == token.file_path
                && recorded.file_content_hash == hash(&token.file_content)
                && recorded.read_only == token.read_only
        }
        // TODO: Implement once the HTTP trap kinds are built.
        TrapKind::HttpEndpoint(_) => false,
        TrapKind::HttpPayload(_) => false,
    }
}

/// Record a trap in the workload's ledger.
///
/// If an identical trap (by identity, ignoring containers) is already
/// recorded for the policy, its `updatedAt` timestamp is refreshed and its
/// container list replaced; otherwise a new record is appended with
/// `createdAt` set to now.
pub fn add_trap(
    workload: &mut Workload,
    policy_name: &str,
    trap: &Trap,
    containers: &[String],
) -> Result<()> {
    let mut changes = decode_changes(workload)?;
    let record = record_from_trap(trap, containers);

    match changes
        .iter_mut()
        .find(|c| c.deception_policy_name == policy_name)
    {
        Some(change) => {
            match change
                .traps
                .iter_mut()
                .find(|r| are_the_same_trap(r, trap))
            {
                Some(existing) => {
                    existing.updated_at = Some(now_rfc3339());
                    existing.containers = containers.to_vec();
                }
                None => change.traps.push(record),
            }
        }
        None => changes.push(ChangeRecord {
            deception_policy_name: policy_name.to_string(),
            traps: vec![record],
        }),
    }

    write_changes(workload, &changes)
}

/// Replace the container list of a recorded trap.
///
/// The record is matched by identity (ignoring containers). If it is not
/// found under the policy's change, it is inserted with `createdAt` set to
/// now. If the policy has no change at all, nothing happens.
pub fn update_containers(
    workload: &mut Workload,
    policy_name: &str,
    record: &TrapRecord,
    containers: &[String],
) -> Result<()> {
    let mut changes = decode_changes(workload)?;

    for change in changes
        .iter_mut()
        .filter(|c| c.deception_policy_name == policy_name)
    {
        match change.traps.iter_mut().find(|r| r.equals(record, true)) {
            Some(existing) => {
                existing.updated_at = Some(now_rfc3339());
                existing.containers = containers.to_vec();
            }
            None => {
                let mut inserted = record.clone();
                inserted.created_at = now_rfc3339();
                inserted.containers = containers.to_vec();
                change.traps.push(inserted);
            }
        }
    }

    write_changes(workload, &changes)
}

/// Remove a recorded trap (matched exactly, containers included) from the
/// policy's change. Empty changes are dropped, and when no changes remain
/// the annotation key is deleted entirely.
pub fn remove_trap(workload: &mut Workload, policy_name: &str, record: &TrapRecord) -> Result<()> {
    let mut changes = decode_changes(workload)?;

    for change in changes
        .iter_mut()
        .filter(|c| c.deception_policy_name == policy_name)
    {
        change.traps.retain(|r| !r.equals(record, false));
    }
    changes.retain(|c| !c.traps.is_empty());

    if changes.is_empty() {
        workload.remove_annotation(ANNOTATION_KEY_CHANGES);
        return Ok(());
    }

    write_changes(workload, &changes)
}

/// The change recorded for a policy on a workload, or an empty record.
pub fn change_for(workload: &Workload, policy_name: &str) -> Result<ChangeRecord> {
    let changes = decode_changes(workload)?;
    Ok(changes
        .into_iter()
        .find(|c| c.deception_policy_name == policy_name)
        .unwrap_or_default())
}

/// Enumerate all workloads (pods and deployments) whose ledger mentions
/// the given policy.
pub async fn annotated_workloads(
    ops: &dyn KubeOps,
    policy_name: &str,
) -> Result<Vec<Workload>> {
    let mut annotated = Vec::new();

    for pod in ops.list_pods(None, None).await? {
        let workload = Workload::Pod(pod);
        if !change_for(&workload, policy_name)?.traps.is_empty() {
            annotated.push(workload);
        }
    }

    for deployment in ops.list_deployments(None, None).await? {
        let workload = Workload::Deployment(deployment);
        if !change_for(&workload, policy_name)?.traps.is_empty() {
            annotated.push(workload);
        }
    }

    Ok(annotated)
}
