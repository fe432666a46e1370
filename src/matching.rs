//! Resolving trap selection criteria into concrete workloads
//!
//! The matcher turns a trap's `match.any` filters into the set of workloads
//! (and containers inside them) that the trap should be deployed to.
//! Filters compose with a logical OR; within one filter, namespaces and
//! label selector compose with a logical AND. The deployment strategy
//! decides the workload kind that is searched: pods for `containerExec`,
//! deployments for `volumeMount`.

use std::collections::{BTreeMap, HashSet};

use k8s_openapi::api::apps::v1::DeploymentStatus;
use k8s_openapi::api::core::v1::PodStatus;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

use crate::crd::{DecoyStrategy, MatchResources, ResourceFilter, Trap};
use crate::kube_ops::KubeOps;
use crate::workload::{Workload, WorkloadKind};
use crate::{Error, Result};

/// The outcome of resolving a trap's selection criteria.
#[derive(Debug, Default)]
pub struct MatchingResult {
    /// Workloads and their containers that traps can be deployed to
    /// (matched, not deleted, not filtered by the cutoff, and ready).
    /// Ordered by workload name.
    pub deployable: Vec<(Workload, Vec<String>)>,

    /// True if at least one workload matched the selection criteria,
    /// regardless of readiness. Workloads with a deletion timestamp are
    /// treated as if they were not there at all.
    pub any_matched: bool,

    /// True if no matched workload or container was dropped by the
    /// readiness filter. Meaningless when `any_matched` is false.
    pub all_ready: bool,
}

/// True if the container selector selects all containers.
pub fn container_selector_selects_all(selector: &str) -> bool {
    selector.is_empty() || selector == "*"
}

/// Resolve the workloads a trap should be deployed to.
///
/// Matching applies the trap's filters, then drops workloads with a
/// deletion timestamp and (when `created_after` is given) workloads not
/// created strictly after that cutoff. The readiness filter then splits
/// off workloads and containers that cannot take a trap yet: pods must be
/// running with ready containers, deployments must have the Available
/// condition set to True.
pub async fn deployable_workloads(
    ops: &dyn KubeOps,
    trap: &Trap,
    created_after: Option<&Time>,
) -> Result<MatchingResult> {
    let kind = match trap.decoy_deployment.strategy {
        DecoyStrategy::ContainerExec => WorkloadKind::Pod,
        DecoyStrategy::VolumeMount => WorkloadKind::Deployment,
        other => {
            return Err(Error::validation(format!(
                "invalid deployment strategy: {other}"
            )))
        }
    };

    let mut matching = matching_workloads(ops, kind, &trap.match_resources).await?;
    matching.retain(|_, (workload, _)| workload.deletion_timestamp().is_none());
    if let Some(cutoff) = created_after {
        matching.retain(|_, (workload, _)| {
            workload
                .creation_timestamp()
                .is_some_and(|created| cutoff.0 < created.0)
        });
    }

    let any_matched = !matching.is_empty();
    let (deployable, mut all_ready) = match kind {
        WorkloadKind::Pod => filter_pods_ready(matching),
        WorkloadKind::Deployment => filter_deployments_ready(matching),
    };

    // Avoid vacuous truth: if nothing is deployable, nothing was ready
    // (no caller should rely on the flag in this case anyway)
    if deployable.is_empty() {
        all_ready = false;
    }

    Ok(MatchingResult {
        deployable: deployable.into_values().collect(),
        any_matched,
        all_ready,
    })
}

/// Apply all filters of the trap (logical OR) and collect the matched
/// workloads with their selected containers, merged by workload name.
async fn matching_workloads(
    ops: &dyn KubeOps,
    kind: WorkloadKind,
    match_resources: &MatchResources,
) -> Result<BTreeMap<String, (Workload, Vec<String>)>> {
    let mut merged: BTreeMap<String, (Workload, Vec<String>)> = BTreeMap::new();

    for filter in &match_resources.any {
        for workload in match_by_namespaces_and_labels(ops, kind, filter).await? {
            let selected = select_containers(&workload, &filter.container_selector)?;
            if selected.is_empty() {
                // No containers match the containerSelector, skip the workload
                continue;
            }

            let name = workload.name().to_string();
            let entry = merged.entry(name).or_insert_with(|| (workload, Vec::new()));
            for container in selected {
                if !entry.1.contains(&container) {
                    entry.1.push(container);
                }
            }
        }
    }

    Ok(merged)
}

/// Apply one filter: namespaces and labels compose with a logical AND when
/// both are set, and act as the sole predicate when only one is set.
async fn match_by_namespaces_and_labels(
    ops: &dyn KubeOps,
    kind: WorkloadKind,
    filter: &ResourceFilter,
) -> Result<Vec<Workload>> {
    let mut by_namespace: Vec<Workload> = Vec::new();
    if !filter.namespaces.is_empty() {
        for namespace in &filter.namespaces {
            for workload in list_workloads(ops, kind, Some(namespace.clone()), None).await? {
                if !by_namespace.iter().any(|w| w.name() == workload.name()) {
                    by_namespace.push(workload);
                }
            }
        }
    }

    let mut by_labels: Vec<Workload> = Vec::new();
    if let Some(labels) = filter.match_labels() {
        for workload in list_workloads(ops, kind, None, Some(labels.clone())).await? {
            if !by_labels.iter().any(|w| w.name() == workload.name()) {
                by_labels.push(workload);
            }
        }
    }

    let has_namespaces = !filter.namespaces.is_empty();
    let has_labels = filter.match_labels().is_some();

    let matching = match (has_namespaces, has_labels) {
        // Neither set produces nothing; validation rejects this case upfront
        (false, _) => by_labels,
        (true, false) => by_namespace,
        (true, true) => {
            let labeled: HashSet<String> =
                by_labels.iter().map(|w| w.name().to_string()).collect();
            by_namespace
                .into_iter()
                .filter(|w| labeled.contains(w.name()))
                .collect()
        }
    };

    Ok(matching)
}

async fn list_workloads(
    ops: &dyn KubeOps,
    kind: WorkloadKind,
    namespace: Option<String>,
    labels: Option<BTreeMap<String, String>>,
) -> Result<Vec<Workload>> {
    match kind {
        WorkloadKind::Pod => Ok(ops
            .list_pods(namespace, labels)
            .await?
            .into_iter()
            .map(Workload::Pod)
            .collect()),
        WorkloadKind::Deployment => Ok(ops
            .list_deployments(namespace, labels)
            .await?
            .into_iter()
            .map(Workload::Deployment)
            .collect()),
    }
}

/// Select the containers of a workload matched by the containerSelector.
/// The selector supports shell-glob wildcards; `""` and `"*"` select all.
fn select_containers(workload: &Workload, selector: &str) -> Result<Vec<String>> {
    let names = workload.container_names();
    if container_selector_selects_all(selector) {
        return Ok(names);
    }

    let pattern = glob::Pattern::new(selector).map_err(|e| {
        Error::validation(format!("invalid container selector '{selector}': {e}"))
    })?;
    Ok(names.into_iter().filter(|n| pattern.matches(n)).collect())
}

fn pod_condition_status(status: &PodStatus, condition_type: &str) -> Option<String> {
    status
        .conditions
        .as_ref()?
        .iter()
        .find(|c| c.type_ == condition_type)
        .map(|c| c.status.clone())
}

fn deployment_condition_status(status: &DeploymentStatus, condition_type: &str) -> Option<String> {
    status
        .conditions
        .as_ref()?
        .iter()
        .find(|c| c.type_ == condition_type)
        .map(|c| c.status.clone())
}

/// Keep only pods that are running and, per pod, only the selected
/// containers that are running and ready. The returned flag is true only
/// if no pod or container was filtered out.
fn filter_pods_ready(
    objects: BTreeMap<String, (Workload, Vec<String>)>,
) -> (BTreeMap<String, (Workload, Vec<String>)>, bool) {
    let mut filtered = BTreeMap::new();
    let mut all_ready = true;

    for (name, (workload, containers)) in objects {
        let Some(pod) = workload.as_pod() else {
            continue;
        };
        let Some(status) = pod.status.clone() else {
            all_ready = false;
            continue;
        };

        if status.phase.as_deref() != Some("Running") {
            all_ready = false;
            continue; // skip entire pod
        }

        if pod_condition_status(&status, "ContainersReady").as_deref() != Some("True") {
            all_ready = false; // flag as not ready, but still check individual containers
        }

        let mut ready_containers = Vec::new();
        for container_status in status.container_statuses.unwrap_or_default() {
            if !containers.contains(&container_status.name) {
                continue; // ignore, name not even matching
            }
            let running = container_status
                .state
                .as_ref()
                .and_then(|s| s.running.as_ref())
                .is_some();
            if !running || !container_status.ready {
                all_ready = false;
                continue; // skip this container
            }
            ready_containers.push(container_status.name);
        }

        if !ready_containers.is_empty() {
            filtered.insert(name, (workload, ready_containers));
        }
    }

    (filtered, all_ready)
}

/// Keep only deployments with the Available condition set to True. The
/// container list is not filtered further. The returned flag is true only
/// if no deployment was filtered out.
fn filter_deployments_ready(
    objects: BTreeMap<String, (Workload, Vec<String>)>,
) -> (BTreeMap<String, (Workload, Vec<String>)>, bool) {
    let mut filtered = BTreeMap::new();
    let mut all_ready = true;

    for (name, (workload, containers)) in objects {
        let Some(deployment) = workload.as_deployment() else {
            continue;
        };

        let available = deployment
            .status
            .as_ref()
            .and_then(|s| deployment_condition_status(s, "Available"))
            .is_some_and(|s| s == "True");
        if !available {
            all_ready = false;
            continue; // skip entire deployment
        }

        filtered.insert(name, (workload, containers));
    }

    (filtered, all_ready)
}
