//! DeceptionPolicy reconciliation
//!
//! One reconciliation drives a single policy toward its declared state:
//! finalizer handling, cleanup of removed traps, validation, the decoy and
//! captor passes, and a deferred status flush that runs regardless of how
//! the earlier steps went. Reconciliation is idempotent; the watch fan-out
//! may over-enqueue freely.

use std::sync::Arc;

use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{error, info, instrument, warn};

use super::cleanup;
use super::conditions::{
    apply_reconcile_result, CAPTORS_DEPLOYED_TYPE, CAPTORS_MESSAGE_MISSING_TETRAGON,
    CAPTORS_REASON_MISSING_TETRAGON, CAPTORS_REASON_PENDING, CAPTOR_STATUS_TEXTS,
    DECOYS_DEPLOYED_TYPE, DECOYS_REASON_PENDING, DECOY_STATUS_TEXTS, POLICY_VALID_REASON_INVALID,
    POLICY_VALID_REASON_PENDING, POLICY_VALID_REASON_VALID, POLICY_VALID_TYPE,
    RESOURCE_FOUND_MESSAGE_FOUND, RESOURCE_FOUND_REASON_FOUND, RESOURCE_FOUND_TYPE,
};
use crate::captor;
use crate::crd::{ConditionStatus, DeceptionPolicy, DeceptionPolicyCondition, Trap};
use crate::decoy;
use crate::error::join_errors;
use crate::kube_ops::{KubeClient, KubeOps};
use crate::results::TrapReconcileResult;
use crate::retry::{retry_on_conflict, RetryConfig};
use crate::{
    Error, Result, FINALIZER_NAME, NORMAL_FAILURE_RETRY_INTERVAL, SHORT_STATUS_CHECK_INTERVAL,
};

/// Controller context shared across all reconciliation calls.
pub struct Context {
    /// Cluster API operations (trait object for testability)
    pub ops: Arc<dyn KubeOps>,
    /// Retry configuration for optimistic-concurrency loops
    pub retry: RetryConfig,
}

impl Context {
    /// Create a context backed by the real Kubernetes client.
    pub fn new(client: Client) -> Self {
        Self {
            ops: Arc::new(KubeClient::new(client)),
            retry: RetryConfig::default(),
        }
    }

    /// Create a context with custom operations, primarily for tests.
    pub fn with_ops(ops: Arc<dyn KubeOps>) -> Self {
        Self {
            ops,
            retry: RetryConfig::default(),
        }
    }
}

/// The conditions staged during one reconciliation and flushed on exit.
struct StagedConditions {
    resource_found: DeceptionPolicyCondition,
    policy_valid: DeceptionPolicyCondition,
    decoys_deployed: DeceptionPolicyCondition,
    captors_deployed: DeceptionPolicyCondition,
}

impl StagedConditions {
    fn new() -> Self {
        Self {
            resource_found: DeceptionPolicyCondition::new(
                RESOURCE_FOUND_TYPE,
                ConditionStatus::True,
                RESOURCE_FOUND_REASON_FOUND,
                RESOURCE_FOUND_MESSAGE_FOUND,
            ),
            policy_valid: DeceptionPolicyCondition::new(
                POLICY_VALID_TYPE,
                ConditionStatus::Unknown,
                POLICY_VALID_REASON_PENDING,
                "",
            ),
            decoys_deployed: DeceptionPolicyCondition::new(
                DECOYS_DEPLOYED_TYPE,
                ConditionStatus::Unknown,
                DECOYS_REASON_PENDING,
                "",
            ),
            captors_deployed: DeceptionPolicyCondition::new(
                CAPTORS_DEPLOYED_TYPE,
                ConditionStatus::Unknown,
                CAPTORS_REASON_PENDING,
                "",
            ),
        }
    }

    fn all(&self) -> [&DeceptionPolicyCondition; 4] {
        [
            &self.resource_found,
            &self.policy_valid,
            &self.decoys_deployed,
            &self.captors_deployed,
        ]
    }
}

/// Reconcile a DeceptionPolicy.
///
/// Ordered steps: fetch, finalize-if-deleting, finalizer install, cleanup
/// of removed traps, validation, the decoy pass, the captor pass, the
/// requeue decision, and the deferred status flush.
#[instrument(skip(policy, ctx), fields(policy = %policy.name_any()))]
pub async fn reconcile(policy: Arc<DeceptionPolicy>, ctx: Arc<Context>) -> Result<Action> {
    let name = policy.name_any();
    info!("reconciling DeceptionPolicy");

    let Some(policy) = ctx.ops.get_policy(name.clone()).await? else {
        info!("DeceptionPolicy already deleted - stopping reconciliation");
        return Ok(Action::await_change());
    };

    // Do not reconcile a policy that is marked for deletion; run the
    // finalizer to clean up the deployed traps instead
    if policy.metadata.deletion_timestamp.is_some() {
        if has_finalizer(&policy) {
            cleanup::cleanup_policy(ctx.ops.as_ref(), &policy).await?;
            remove_finalizer(ctx.ops.as_ref(), &ctx.retry, &name).await?;
        }
        info!("DeceptionPolicy marked for deletion - stopping reconciliation");
        return Ok(Action::await_change());
    }

    // Adding the finalizer triggers a spec update, so another
    // reconciliation request will come; stop here either way
    if !has_finalizer(&policy) {
        put_finalizer(ctx.ops.as_ref(), &ctx.retry, &name).await?;
        info!("DeceptionPolicy initialized - will deploy traps next");
        return Ok(Action::await_change());
    }

    let mut staged = StagedConditions::new();
    let outcome = reconcile_traps(ctx.ops.as_ref(), &policy, &mut staged).await;

    // Deferred status flush, regardless of how reconciliation went
    let flush = update_status_conditions(ctx.ops.as_ref(), &ctx.retry, &name, &staged).await;

    let mut errors = Vec::new();
    let action = match outcome {
        Ok(action) => Some(action),
        Err(e) => {
            errors.push(e);
            None
        }
    };
    if let Err(e) = flush {
        warn!(error = %e, "status conditions cannot be set");
        errors.push(e);
    }

    match join_errors(errors) {
        Some(e) => Err(e),
        None => Ok(action.unwrap_or_else(Action::await_change)),
    }
}

/// Cleanup, validation, and the two deployment passes of one
/// reconciliation, staging condition updates along the way.
async fn reconcile_traps(
    ops: &dyn KubeOps,
    policy: &DeceptionPolicy,
    staged: &mut StagedConditions,
) -> Result<Action> {
    // If traps were removed from the policy, remove the decoys and
    // captors deployed for them first
    cleanup::cleanup_removed_traps(ops, policy).await?;

    let valid_traps: Vec<&Trap> = policy
        .spec
        .traps
        .iter()
        .filter(|trap| match trap.is_valid() {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "trap specification invalid");
                false
            }
        })
        .collect();

    let num_traps = policy.spec.traps.len();
    let num_valid = valid_traps.len();
    let num_invalid = num_traps - num_valid;

    if num_traps > 0 {
        staged.policy_valid.message = format!("{num_valid}/{num_traps} traps are valid");
        if num_invalid > 0 {
            staged.policy_valid.status = ConditionStatus::False;
            staged.policy_valid.reason = POLICY_VALID_REASON_INVALID.to_string();
        } else {
            staged.policy_valid.status = ConditionStatus::True;
            staged.policy_valid.reason = POLICY_VALID_REASON_VALID.to_string();
        }
    }

    if num_invalid > 0 {
        if policy.spec.strict_validation {
            info!(
                invalid = num_invalid,
                total = num_traps,
                "policy has invalid traps and strictValidation is enabled - stopping reconciliation"
            );
            return Ok(Action::await_change());
        }
        info!(
            invalid = num_invalid,
            valid = num_valid,
            "ignoring invalid traps - continuing with the valid ones"
        );
    }

    let decoy_result = reconcile_decoys(ops, policy, &valid_traps).await;
    apply_reconcile_result(&decoy_result, &mut staged.decoys_deployed, &DECOY_STATUS_TEXTS);

    let captor_result = reconcile_captors(ops, policy, &valid_traps).await;
    apply_reconcile_result(&captor_result, &mut staged.captors_deployed, &CAPTOR_STATUS_TEXTS);

    // We might have encountered resources that are not ready yet
    let should_requeue = decoy_result.should_requeue || captor_result.should_requeue;

    let mut errors = Vec::new();
    errors.extend(decoy_result.errors);
    errors.extend(captor_result.errors);
    if let Some(e) = join_errors(errors) {
        // Requeue after a while instead of failing hard, to avoid
        // hot-looping on persistent deployment errors
        error!(error = %e, "reconciliation failed - will retry after backoff");
        return Ok(Action::requeue(NORMAL_FAILURE_RETRY_INTERVAL));
    }
    if should_requeue {
        info!("some resources are not ready for traps yet - will retry soon");
        return Ok(Action::requeue(SHORT_STATUS_CHECK_INTERVAL));
    }

    info!("reconciliation successful");
    Ok(Action::await_change())
}

/// Deploy the decoys of all valid traps and summarize the per-trap
/// results.
async fn reconcile_decoys(
    ops: &dyn KubeOps,
    policy: &DeceptionPolicy,
    traps: &[&Trap],
) -> TrapReconcileResult {
    let mut summary = TrapReconcileResult {
        num_traps: traps.len(),
        ..Default::default()
    };

    for trap in traps {
        let result = decoy::deploy_decoy(ops, policy, trap).await;
        if result.implies_failure() {
            summary.num_failures += 1;
        } else if result.implies_success() {
            summary.num_successes += 1;
        }
        if result.implies_retry() {
            info!("encountered resources that are not ready for decoys yet - will retry soon");
            summary.should_requeue = true;
        }
        summary.errors.extend(result.errors);
    }

    summary
}

/// Deploy the captors of all valid traps and summarize the per-trap
/// results.
async fn reconcile_captors(
    ops: &dyn KubeOps,
    policy: &DeceptionPolicy,
    traps: &[&Trap],
) -> TrapReconcileResult {
    let mut summary = TrapReconcileResult {
        num_traps: traps.len(),
        ..Default::default()
    };

    for trap in traps {
        let result = captor::deploy_captor(ops, policy, trap).await;
        if result.implies_failure() {
            summary.num_failures += 1;
        } else if result.implies_success() {
            summary.num_successes += 1;
        }
        if result.missing_tracing_operator {
            // Without the tracing operator there is no point in retrying;
            // the override makes the condition explain the situation
            summary.override_reason = Some(CAPTORS_REASON_MISSING_TETRAGON);
            summary.override_message = Some(CAPTORS_MESSAGE_MISSING_TETRAGON);
        } else {
            summary.errors.extend(result.errors);
        }
    }

    summary
}

fn has_finalizer(policy: &DeceptionPolicy) -> bool {
    policy
        .metadata
        .finalizers
        .as_ref()
        .is_some_and(|finalizers| finalizers.iter().any(|f| f == FINALIZER_NAME))
}

/// Add the finalizer to the policy, retrying on conflicts.
async fn put_finalizer(ops: &dyn KubeOps, retry: &RetryConfig, name: &str) -> Result<()> {
    retry_on_conflict(retry, "add finalizer", || async {
        let Some(mut policy) = ops.get_policy(name.to_string()).await? else {
            return Ok(());
        };
        if has_finalizer(&policy) {
            return Ok(()); // already added
        }
        policy
            .metadata
            .finalizers
            .get_or_insert_with(Vec::new)
            .push(FINALIZER_NAME.to_string());
        ops.update_policy(policy).await
    })
    .await
}

/// Remove the finalizer from the policy, retrying on conflicts.
async fn remove_finalizer(ops: &dyn KubeOps, retry: &RetryConfig, name: &str) -> Result<()> {
    retry_on_conflict(retry, "remove finalizer", || async {
        let Some(mut policy) = ops.get_policy(name.to_string()).await? else {
            return Ok(());
        };
        if !has_finalizer(&policy) {
            return Ok(()); // already removed
        }
        if let Some(finalizers) = policy.metadata.finalizers.as_mut() {
            finalizers.retain(|f| f != FINALIZER_NAME);
        }
        ops.update_policy(policy).await
    })
    .await
}

/// Upsert the staged conditions into the policy status, retrying on
/// conflicts. If every condition already has its desired value, no update
/// is performed. A policy that disappeared mid-reconcile is a success.
async fn update_status_conditions(
    ops: &dyn KubeOps,
    retry: &RetryConfig,
    name: &str,
    staged: &StagedConditions,
) -> Result<()> {
    retry_on_conflict(retry, "update status conditions", || async {
        let Some(mut policy) = ops.get_policy(name.to_string()).await? else {
            return Ok(());
        };

        let mut status = policy.status.take().unwrap_or_default();
        let mut any_dirty = false;
        for condition in staged.all() {
            any_dirty |= status.put_condition(condition.clone());
        }
        policy.status = Some(status);

        if !any_dirty {
            return Ok(()); // all conditions already have their desired values
        }
        ops.update_policy_status(policy).await
    })
    .await
}

/// Called by the controller runtime when reconciliation fails; requeues
/// after the long backoff interval.
pub fn error_policy(policy: Arc<DeceptionPolicy>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(?error, policy = %policy.name_any(), "reconciliation failed");
    Action::requeue(NORMAL_FAILURE_RETRY_INTERVAL)
}
