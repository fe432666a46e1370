//! DeceptionPolicy Custom Resource Definition
//!
//! A DeceptionPolicy is a cluster-scoped resource declaring a list of traps.
//! The controller reports progress through four status conditions, upserted
//! by type: `ResourceFound`, `PolicyValid`, `DecoysDeployed`, and
//! `CaptorsDeployed`.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::trap::Trap;

/// Specification for a DeceptionPolicy
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "koney.dev",
    version = "v1alpha1",
    kind = "DeceptionPolicy",
    plural = "deceptionpolicies",
    status = "DeceptionPolicyStatus",
    printcolumn = r#"{"name":"Valid","type":"string","jsonPath":".status.conditions[?(@.type=='PolicyValid')].status"}"#,
    printcolumn = r#"{"name":"Decoys","type":"string","jsonPath":".status.conditions[?(@.type=='DecoysDeployed')].status"}"#,
    printcolumn = r#"{"name":"Captors","type":"string","jsonPath":".status.conditions[?(@.type=='CaptorsDeployed')].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DeceptionPolicySpec {
    /// Traps is the list of traps to be deployed by the deception policy.
    /// Each trap represents a cyber deception technique.
    #[serde(default)]
    pub traps: Vec<Trap>,

    /// StrictValidation indicates whether the policy should be strictly
    /// validated. If true, traps are deployed only if all traps in the
    /// policy are valid. If false, the valid traps are deployed even if
    /// some of the others are invalid.
    #[serde(default = "default_true")]
    pub strict_validation: bool,

    /// MutateExisting allows adding traps to resources that already existed
    /// before the policy was created. Depending on the deployment
    /// strategies, mutating a resource may restart its pods.
    #[serde(default = "default_true")]
    pub mutate_existing: bool,
}

fn default_true() -> bool {
    true
}

/// Status for a DeceptionPolicy
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeceptionPolicyStatus {
    /// Conditions the DeceptionPolicy can be in, keyed by type.
    #[serde(default)]
    pub conditions: Vec<DeceptionPolicyCondition>,
}

/// Status of a condition: True, False, or Unknown.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// The condition holds
    True,
    /// The condition does not hold
    False,
    /// The condition has not been evaluated yet
    #[default]
    Unknown,
}

/// One aspect of the state of a DeceptionPolicy at a certain point in time.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeceptionPolicyCondition {
    /// Type of deception policy condition
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition
    pub status: ConditionStatus,

    /// The last time the condition transitioned from one status to another,
    /// i.e., when the underlying condition changed.
    pub last_transition_time: Time,

    /// Reason indicates the reason for the condition's last transition.
    pub reason: String,

    /// Message is a human-readable explanation with details about the
    /// transition.
    pub message: String,
}

impl DeceptionPolicyCondition {
    /// Create a condition stamped with the current time.
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            last_transition_time: Time(chrono::Utc::now()),
            reason: reason.into(),
            message: message.into(),
        }
    }

    /// True if the conditions are equal, excluding LastTransitionTime.
    pub fn equals(&self, other: &DeceptionPolicyCondition) -> bool {
        self.type_ == other.type_
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
    }
}

impl DeceptionPolicyStatus {
    /// True if the status contains a condition with the provided type.
    pub fn contains_condition(&self, condition_type: &str) -> bool {
        self.get_condition(condition_type).is_some()
    }

    /// The first condition with the provided type, if it exists.
    pub fn get_condition(&self, condition_type: &str) -> Option<&DeceptionPolicyCondition> {
        self.conditions.iter().find(|c| c.type_ == condition_type)
    }

    /// Add a new condition, or update the existing condition of the same
    /// type. LastTransitionTime only changes when the condition itself
    /// changed (equality ignores the timestamp).
    ///
    /// Returns true if the conditions were modified.
    pub fn put_condition(&mut self, condition: DeceptionPolicyCondition) -> bool {
        match self
            .conditions
            .iter_mut()
            .find(|c| c.type_ == condition.type_)
        {
            None => {
                self.conditions.push(condition);
                true
            }
            Some(existing) if !condition.equals(existing) => {
                *existing = condition;
                true
            }
            Some(_) => false,
        }
    }
}
