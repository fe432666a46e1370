//! Status condition vocabulary and result translation
//!
//! The reconciler publishes four conditions, upserted by type. The decoy
//! and captor passes share one translation from a [`TrapReconcileResult`]
//! into a condition; only the reason/message vocabulary differs.

use crate::crd::{ConditionStatus, DeceptionPolicyCondition};
use crate::results::TrapReconcileResult;

/// Condition type reporting that the policy object was found.
pub const RESOURCE_FOUND_TYPE: &str = "ResourceFound";
/// Condition type reporting the outcome of trap validation.
pub const POLICY_VALID_TYPE: &str = "PolicyValid";
/// Condition type reporting the outcome of the decoy pass.
pub const DECOYS_DEPLOYED_TYPE: &str = "DecoysDeployed";
/// Condition type reporting the outcome of the captor pass.
pub const CAPTORS_DEPLOYED_TYPE: &str = "CaptorsDeployed";

/// Reason: the policy object was found.
pub const RESOURCE_FOUND_REASON_FOUND: &str = "ResourceFound";
/// Message: the policy object was found.
pub const RESOURCE_FOUND_MESSAGE_FOUND: &str = "DeceptionPolicy found and ready";

/// Reason: validation has not run yet.
pub const POLICY_VALID_REASON_PENDING: &str = "ValidationPending";
/// Reason: all traps are valid.
pub const POLICY_VALID_REASON_VALID: &str = "TrapsSpecValid";
/// Reason: at least one trap is invalid.
pub const POLICY_VALID_REASON_INVALID: &str = "TrapsSpecInvalid";

/// Reason: the decoy pass has not run yet.
pub const DECOYS_REASON_PENDING: &str = "DecoyDeploymentPending";
/// Reason: every declared decoy was deployed.
pub const DECOYS_REASON_SUCCESS: &str = "DecoyDeploymentSucceeded";
/// Reason: every attempted decoy was deployed, some were skipped.
pub const DECOYS_REASON_PARTIAL_SUCCESS: &str = "DecoyDeploymentSucceededPartially";
/// Reason: a decoy deployment failed.
pub const DECOYS_REASON_GENERIC_ERROR: &str = "DecoyDeploymentError";
/// Reason: no workloads matched the selection criteria.
pub const DECOYS_REASON_NO_OBJECTS: &str = "NoObjectsMatched";

/// Message: no workloads matched the selection criteria.
pub const TRAP_DEPLOYED_MESSAGE_NO_OBJECTS: &str = "No objects matching selection criteria";

/// Reason: the captor pass has not run yet.
pub const CAPTORS_REASON_PENDING: &str = "CaptorDeploymentPending";
/// Reason: every declared captor was deployed.
pub const CAPTORS_REASON_SUCCESS: &str = "CaptorDeploymentSucceeded";
/// Reason: every attempted captor was deployed, some were skipped.
pub const CAPTORS_REASON_PARTIAL_SUCCESS: &str = "CaptorDeploymentSucceededPartially";
/// Reason: a captor deployment failed.
pub const CAPTORS_REASON_GENERIC_ERROR: &str = "CaptorDeploymentError";
/// Reason: no workloads matched the selection criteria.
pub const CAPTORS_REASON_NO_OBJECTS: &str = "NoObjectsMatched";
/// Reason: the tracing operator is not installed.
pub const CAPTORS_REASON_MISSING_TETRAGON: &str = "TetragonNotInstalled";

/// Message: the tracing operator is not installed.
pub const CAPTORS_MESSAGE_MISSING_TETRAGON: &str = "Cannot deploy captors without Tetragon";

/// The reason/message vocabulary of one trap deployment condition, so that
/// decoy and captor conditions can be populated generically.
pub struct TrapStatusTexts {
    /// Name of the deployed objects (e.g., "decoys" or "captors")
    pub object_name: &'static str,
    /// Reason for a full success
    pub reason_success: &'static str,
    /// Reason for a success with skipped traps
    pub reason_partial_success: &'static str,
    /// Reason for a failure
    pub reason_error: &'static str,
    /// Reason when nothing matched
    pub reason_no_objects: &'static str,
    /// Message when nothing matched
    pub message_no_objects: &'static str,
}

/// Condition vocabulary for the decoy pass.
pub const DECOY_STATUS_TEXTS: TrapStatusTexts = TrapStatusTexts {
    object_name: "decoys",
    reason_success: DECOYS_REASON_SUCCESS,
    reason_partial_success: DECOYS_REASON_PARTIAL_SUCCESS,
    reason_error: DECOYS_REASON_GENERIC_ERROR,
    reason_no_objects: DECOYS_REASON_NO_OBJECTS,
    message_no_objects: TRAP_DEPLOYED_MESSAGE_NO_OBJECTS,
};

/// Condition vocabulary for the captor pass.
pub const CAPTOR_STATUS_TEXTS: TrapStatusTexts = TrapStatusTexts {
    object_name: "captors",
    reason_success: CAPTORS_REASON_SUCCESS,
    reason_partial_success: CAPTORS_REASON_PARTIAL_SUCCESS,
    reason_error: CAPTORS_REASON_GENERIC_ERROR,
    reason_no_objects: CAPTORS_REASON_NO_OBJECTS,
    message_no_objects: TRAP_DEPLOYED_MESSAGE_NO_OBJECTS,
};

/// Translate a reconcile summary into a status condition. With zero traps
/// the condition is left untouched (it stays Unknown/Pending).
pub fn apply_reconcile_result(
    result: &TrapReconcileResult,
    condition: &mut DeceptionPolicyCondition,
    texts: &TrapStatusTexts,
) {
    if result.num_traps == 0 {
        return;
    }

    condition.message = format!(
        "{}/{} {} deployed ({} skipped)",
        result.num_successes,
        result.num_tries(),
        texts.object_name,
        result.num_skipped()
    );

    if result.num_failures > 0 || !result.errors.is_empty() {
        condition.status = ConditionStatus::False;
        condition.reason = texts.reason_error.to_string();
    } else if result.num_tries() == 0 {
        condition.status = ConditionStatus::False;
        condition.reason = texts.reason_no_objects.to_string();
        condition.message = texts.message_no_objects.to_string();
    } else if result.num_successes == result.num_traps {
        condition.status = ConditionStatus::True;
        condition.reason = texts.reason_success.to_string();
    } else if result.num_successes == result.num_tries() {
        condition.status = ConditionStatus::True;
        condition.reason = texts.reason_partial_success.to_string();
    }

    // Respect overrides
    if let Some(reason) = result.override_reason {
        condition.reason = reason.to_string();
    }
    if let Some(message) = result.override_message {
        condition.message = message.to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    fn pending_condition() -> DeceptionPolicyCondition {
        DeceptionPolicyCondition::new(
            DECOYS_DEPLOYED_TYPE,
            ConditionStatus::Unknown,
            DECOYS_REASON_PENDING,
            "",
        )
    }

    #[test]
    fn zero_traps_leave_the_condition_pending() {
        let mut condition = pending_condition();
        apply_reconcile_result(
            &TrapReconcileResult::default(),
            &mut condition,
            &DECOY_STATUS_TEXTS,
        );
        assert_eq!(condition.status, ConditionStatus::Unknown);
        assert_eq!(condition.reason, DECOYS_REASON_PENDING);
    }

    #[test]
    fn full_success_reports_true() {
        let mut condition = pending_condition();
        apply_reconcile_result(
            &TrapReconcileResult {
                num_traps: 1,
                num_successes: 1,
                ..Default::default()
            },
            &mut condition,
            &DECOY_STATUS_TEXTS,
        );
        assert_eq!(condition.status, ConditionStatus::True);
        assert_eq!(condition.reason, DECOYS_REASON_SUCCESS);
        assert_eq!(condition.message, "1/1 decoys deployed (0 skipped)");
    }

    #[test]
    fn partial_success_reports_skipped_traps() {
        let mut condition = pending_condition();
        apply_reconcile_result(
            &TrapReconcileResult {
                num_traps: 3,
                num_successes: 2,
                ..Default::default()
            },
            &mut condition,
            &DECOY_STATUS_TEXTS,
        );
        assert_eq!(condition.status, ConditionStatus::True);
        assert_eq!(condition.reason, DECOYS_REASON_PARTIAL_SUCCESS);
        assert_eq!(condition.message, "2/2 decoys deployed (1 skipped)");
    }

    #[test]
    fn failures_win_over_everything_else() {
        let mut condition = pending_condition();
        apply_reconcile_result(
            &TrapReconcileResult {
                num_traps: 2,
                num_successes: 1,
                num_failures: 1,
                ..Default::default()
            },
            &mut condition,
            &DECOY_STATUS_TEXTS,
        );
        assert_eq!(condition.status, ConditionStatus::False);
        assert_eq!(condition.reason, DECOYS_REASON_GENERIC_ERROR);
        assert_eq!(condition.message, "1/2 decoys deployed (0 skipped)");
    }

    #[test]
    fn errors_without_failures_also_report_an_error() {
        let mut condition = pending_condition();
        apply_reconcile_result(
            &TrapReconcileResult {
                num_traps: 1,
                num_successes: 1,
                errors: vec![Error::exec("annotation write failed")],
                ..Default::default()
            },
            &mut condition,
            &DECOY_STATUS_TEXTS,
        );
        assert_eq!(condition.status, ConditionStatus::False);
        assert_eq!(condition.reason, DECOYS_REASON_GENERIC_ERROR);
    }

    #[test]
    fn nothing_tried_reports_no_objects() {
        let mut condition = pending_condition();
        apply_reconcile_result(
            &TrapReconcileResult {
                num_traps: 2,
                ..Default::default()
            },
            &mut condition,
            &DECOY_STATUS_TEXTS,
        );
        assert_eq!(condition.status, ConditionStatus::False);
        assert_eq!(condition.reason, DECOYS_REASON_NO_OBJECTS);
        assert_eq!(condition.message, TRAP_DEPLOYED_MESSAGE_NO_OBJECTS);
    }

    #[test]
    fn overrides_replace_reason_and_message() {
        let mut condition = pending_condition();
        apply_reconcile_result(
            &TrapReconcileResult {
                num_traps: 1,
                num_failures: 1,
                override_reason: Some(CAPTORS_REASON_MISSING_TETRAGON),
                override_message: Some(CAPTORS_MESSAGE_MISSING_TETRAGON),
                ..Default::default()
            },
            &mut condition,
            &CAPTOR_STATUS_TEXTS,
        );
        assert_eq!(condition.status, ConditionStatus::False);
        assert_eq!(condition.reason, CAPTORS_REASON_MISSING_TETRAGON);
        assert_eq!(condition.message, CAPTORS_MESSAGE_MISSING_TETRAGON);
    }
}
