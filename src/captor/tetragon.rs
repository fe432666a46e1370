//! Tetragon tracing policies for filesystem honeytokens
//!
//! The `security_file_permission` function is a common execution point for
//! system calls related to filesystem access, such as read, write, etc.
//! Instead of tracing all filesystem access, we can just trace this
//! function.
//!
//! Since processes can also access files by mapping them directly into
//! their virtual address space and it is difficult to trace such access, we
//! also monitor the `security_mmap_file` function, which is used when
//! mapping a file into the virtual address space of a process.
//!
//! We do not hook `security_path_truncate` because this results in BPF
//! compilation errors on some tested systems.
//!
//! See also: <https://tetragon.io/docs/use-cases/filename-access/#hooks>

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    LabelSelector, LabelSelectorRequirement, OwnerReference,
};
use kube::{CustomResource, Resource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::crd::{DeceptionPolicy, Trap};
use crate::fingerprint::hash;
use crate::kube_ops::KubeOps;
use crate::matching::container_selector_selects_all;
use crate::{Error, Result, LABEL_KEY_POLICY_REF, TETRAGON_WEBHOOK_URL};

/// Name prefix of the tracing policies Koney creates.
pub const TRACING_POLICY_NAME_PREFIX: &str = "koney-tracing-policy-";

/// Specification of a Tetragon TracingPolicy.
///
/// Koney does not own this CRD; the type mirrors the subset of the
/// cilium.io/v1alpha1 schema that the controller produces.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cilium.io",
    version = "v1alpha1",
    kind = "TracingPolicy",
    plural = "tracingpolicies"
)]
#[serde(rename_all = "camelCase")]
pub struct TracingPolicySpec {
    /// Selects the pods the policy applies to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_selector: Option<LabelSelector>,

    /// Selects the containers the policy applies to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_selector: Option<LabelSelector>,

    /// The kernel probes to install
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kprobes: Vec<KProbeSpec>,
}

/// One kernel probe of a tracing policy.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KProbeSpec {
    /// The kernel function to hook
    pub call: String,

    /// True if the call is a syscall rather than a kernel function
    pub syscall: bool,

    /// True to probe the function return instead of its entry
    #[serde(rename = "return")]
    pub return_: bool,

    /// The function arguments to extract
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<KProbeArg>,

    /// The return value to extract
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_arg: Option<KProbeArg>,

    /// The action to run on the extracted return value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_arg_action: Option<String>,

    /// Selectors filtering the events and binding actions to them
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub selectors: Vec<KProbeSelector>,
}

/// One extracted argument of a kernel probe.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KProbeArg {
    /// Position of the argument
    pub index: u32,

    /// Tetragon type of the argument (e.g., `file`, `int`)
    #[serde(rename = "type")]
    pub type_: String,
}

/// Event filter plus the actions to run on matching events.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KProbeSelector {
    /// Filters on the extracted arguments
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_args: Vec<ArgSelector>,

    /// Actions to run when the filters match
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_actions: Vec<ActionSelector>,
}

/// Filter on one extracted argument.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ArgSelector {
    /// Position of the argument to filter on
    pub index: u32,

    /// Match operator (e.g., `Equal`)
    pub operator: String,

    /// Values to match against
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

/// One action bound to a matching event.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActionSelector {
    /// The action to run (e.g., `GetUrl`)
    pub action: String,

    /// URL for the `GetUrl` action
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub arg_url: String,
}

/// The deterministic name of the tracing policy for a trap.
///
/// The name hashes the stable JSON encoding of the whole trap, so that
/// identical traps across policies deduplicate onto one document.
pub fn tracing_policy_name(trap: &Trap) -> Result<String> {
    let trap_json = serde_json::to_string(trap)?;
    Ok(format!("{TRACING_POLICY_NAME_PREFIX}{}", hash(&trap_json)))
}

/// Deploy the tracing policy for a filesystem honeytoken trap.
///
/// If a policy of the derived name already exists nothing is done, since
/// the name is unique for each unique trap.
pub async fn deploy(ops: &dyn KubeOps, policy: &DeceptionPolicy, trap: &Trap) -> Result<()> {
    let name = tracing_policy_name(trap)?;

    if ops.get_tracing_policy(name.clone()).await?.is_some() {
        return Ok(());
    }

    let tracing_policy = build_tracing_policy(policy, trap, &name)?;
    ops.create_tracing_policy(tracing_policy).await?;
    info!(policy = %name, "Tetragon tracing policy created");

    Ok(())
}

/// Build the tracing policy document for a filesystem honeytoken trap.
pub fn build_tracing_policy(
    policy: &DeceptionPolicy,
    trap: &Trap,
    name: &str,
) -> Result<TracingPolicy> {
    let token = trap
        .filesystem_honeytoken()
        .ok_or_else(|| Error::validation("tracing policies require a filesystem honeytoken"))?;

    let mut tracing_policy = TracingPolicy::new(
        name,
        TracingPolicySpec {
            pod_selector: Some(LabelSelector {
                match_labels: Some(pod_selector_labels(trap)),
                ..Default::default()
            }),
            container_selector: Some(LabelSelector {
                match_expressions: container_selector_expressions(trap),
                ..Default::default()
            }),
            kprobes: vec![
                file_access_probe("security_file_permission", &token.file_path),
                file_access_probe("security_mmap_file", &token.file_path),
            ],
        },
    );

    tracing_policy.metadata.labels = Some(BTreeMap::from([(
        LABEL_KEY_POLICY_REF.to_string(),
        policy.metadata.name.clone().unwrap_or_default(),
    )]));
    tracing_policy.metadata.owner_references = Some(vec![OwnerReference {
        api_version: DeceptionPolicy::api_version(&()).into_owned(),
        kind: DeceptionPolicy::kind(&()).into_owned(),
        name: policy.metadata.name.clone().unwrap_or_default(),
        uid: policy.metadata.uid.clone().unwrap_or_default(),
        block_owner_deletion: Some(true),
        controller: Some(true),
    }]);

    Ok(tracing_policy)
}

/// The union of all selector labels across the trap's filters. Namespaces
/// are not projected; captors are cluster-wide.
fn pod_selector_labels(trap: &Trap) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    for filter in &trap.match_resources.any {
        if let Some(match_labels) = filter.match_labels() {
            for (key, value) in match_labels {
                labels.insert(key.clone(), value.clone());
            }
        }
    }
    labels
}

/// The container selector expressions for the tracing policy.
///
/// If any filter selects all containers (`""`, `"*"`, or a selector with
/// glob metacharacters), all containers are matched and no expressions are
/// emitted. Otherwise the literal selector strings are collected into a
/// single `In` expression on the `name` key.
fn container_selector_expressions(trap: &Trap) -> Option<Vec<LabelSelectorRequirement>> {
    let mut values: Vec<String> = Vec::new();

    for filter in &trap.match_resources.any {
        let selector = &filter.container_selector;
        if container_selector_selects_all(selector) || has_glob_metacharacters(selector) {
            return None;
        }
        if !values.contains(selector) {
            values.push(selector.clone());
        }
    }

    if values.is_empty() {
        return None;
    }

    Some(vec![LabelSelectorRequirement {
        key: "name".to_string(),
        operator: "In".to_string(),
        values: Some(values),
    }])
}

fn has_glob_metacharacters(selector: &str) -> bool {
    selector.contains(['*', '?', '[', ']'])
}

/// A return-kprobe on a file-access hook, matching the honeytoken path and
/// POSTing matching events to the alert forwarder's webhook.
fn file_access_probe(call: &str, file_path: &str) -> KProbeSpec {
    KProbeSpec {
        call: call.to_string(),
        syscall: false,
        return_: true,
        args: vec![KProbeArg {
            index: 0,
            // A Linux file struct, from which Tetragon extracts the path
            type_: "file".to_string(),
        }],
        return_arg: Some(KProbeArg {
            index: 0,
            type_: "int".to_string(),
        }),
        return_arg_action: Some("Post".to_string()),
        selectors: vec![KProbeSelector {
            match_args: vec![ArgSelector {
                index: 0,
                operator: "Equal".to_string(),
                values: vec![file_path.to_string()],
            }],
            match_actions: vec![ActionSelector {
                action: "GetUrl".to_string(),
                arg_url: TETRAGON_WEBHOOK_URL.to_string(),
            }],
        }],
    }
}
