//! Watch fan-out
//!
//! Create and update events on pods and deployments are translated into
//! reconcile requests for every current DeceptionPolicy. Which workloads a
//! policy matches can only be known by running the matcher, so over-broad
//! enqueuing is intentional for simplicity; reconciliation is idempotent.
//!
//! Workload delete events are ignored: the controller must not change
//! anything when workloads go away, only the status conditions will lag
//! until the next reconciliation.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::reflector::{ObjectRef, Store};
use tracing::debug;

use crate::crd::DeceptionPolicy;
use crate::workload::WorkloadKind;

#[derive(PartialEq)]
struct ObservedWorkload {
    generation: Option<i64>,
    labels: BTreeMap<String, String>,
}

/// Tracks the last observed generation and labels per workload, so that
/// only meaningful changes fan out into reconcile requests:
///
/// - Generation changes mean spec changes, e.g., new container images
///   that need new decoys
/// - Label changes could affect what the deception policies match
///
/// Events for workloads that are about to be deleted are dropped.
#[derive(Default)]
pub struct WorkloadChangeTracker {
    seen: Mutex<HashMap<String, ObservedWorkload>>,
}

impl WorkloadChangeTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// True if this event should fan out into reconcile requests.
    pub fn should_enqueue(&self, kind: WorkloadKind, metadata: &ObjectMeta) -> bool {
        if metadata.deletion_timestamp.is_some() {
            return false;
        }

        let key = format!(
            "{kind}/{}/{}",
            metadata.namespace.as_deref().unwrap_or_default(),
            metadata.name.as_deref().unwrap_or_default()
        );
        let observed = ObservedWorkload {
            generation: metadata.generation,
            labels: metadata.labels.clone().unwrap_or_default(),
        };

        let Ok(mut seen) = self.seen.lock() else {
            return true;
        };
        match seen.get(&key) {
            Some(previous) if *previous == observed => false,
            _ => {
                seen.insert(key, observed);
                true
            }
        }
    }
}

/// Map a workload event to reconcile requests for every known policy.
pub fn map_workload_event(
    tracker: &WorkloadChangeTracker,
    store: &Store<DeceptionPolicy>,
    kind: WorkloadKind,
    metadata: &ObjectMeta,
) -> Vec<ObjectRef<DeceptionPolicy>> {
    if !tracker.should_enqueue(kind, metadata) {
        return Vec::new();
    }

    let requests: Vec<ObjectRef<DeceptionPolicy>> = store
        .state()
        .iter()
        .filter_map(|policy| policy.metadata.name.clone())
        .map(|name| ObjectRef::new(&name))
        .collect();

    if requests.is_empty() {
        debug!(
            workload = %metadata.name.as_deref().unwrap_or_default(),
            "no DeceptionPolicies to apply on changed workload"
        );
    }

    requests
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::DeceptionPolicySpec;
    use kube::runtime::reflector;
    use kube::runtime::watcher;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn metadata(name: &str, generation: Option<i64>, labels: &[(&str, &str)]) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            generation,
            labels: Some(
                labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    #[test]
    fn first_sighting_enqueues() {
        let tracker = WorkloadChangeTracker::new();
        assert!(tracker.should_enqueue(WorkloadKind::Pod, &metadata("web", Some(1), &[])));
    }

    #[test]
    fn unchanged_workloads_do_not_enqueue_again() {
        let tracker = WorkloadChangeTracker::new();
        let meta = metadata("web", Some(1), &[("app", "web")]);
        assert!(tracker.should_enqueue(WorkloadKind::Pod, &meta));
        assert!(!tracker.should_enqueue(WorkloadKind::Pod, &meta));
    }

    #[test]
    fn generation_changes_enqueue() {
        let tracker = WorkloadChangeTracker::new();
        assert!(tracker.should_enqueue(WorkloadKind::Deployment, &metadata("app", Some(1), &[])));
        assert!(tracker.should_enqueue(WorkloadKind::Deployment, &metadata("app", Some(2), &[])));
    }

    #[test]
    fn label_changes_enqueue() {
        let tracker = WorkloadChangeTracker::new();
        assert!(tracker.should_enqueue(WorkloadKind::Pod, &metadata("web", Some(1), &[])));
        assert!(tracker.should_enqueue(
            WorkloadKind::Pod,
            &metadata("web", Some(1), &[("demo.koney/honeytoken", "true")])
        ));
    }

    #[test]
    fn workloads_of_different_kinds_are_tracked_separately() {
        let tracker = WorkloadChangeTracker::new();
        assert!(tracker.should_enqueue(WorkloadKind::Pod, &metadata("web", Some(1), &[])));
        assert!(tracker.should_enqueue(WorkloadKind::Deployment, &metadata("web", Some(1), &[])));
    }

    #[test]
    fn deleting_workloads_are_dropped() {
        let tracker = WorkloadChangeTracker::new();
        let mut meta = metadata("web", Some(1), &[]);
        meta.deletion_timestamp = Some(Time(chrono::Utc::now()));
        assert!(!tracker.should_enqueue(WorkloadKind::Pod, &meta));
    }

    #[test]
    fn events_fan_out_to_every_policy() {
        let (reader, mut writer) = reflector::store::<DeceptionPolicy>();
        for name in ["policy-a", "policy-b"] {
            let mut policy = DeceptionPolicy::new(name, DeceptionPolicySpec::default());
            policy.metadata.name = Some(name.to_string());
            writer.apply_watcher_event(&watcher::Event::Apply(policy));
        }

        let tracker = WorkloadChangeTracker::new();
        let requests = map_workload_event(
            &tracker,
            &reader,
            WorkloadKind::Pod,
            &metadata("web", Some(1), &[]),
        );

        let mut names: Vec<String> = requests.iter().map(|r| r.name.clone()).collect();
        names.sort();
        assert_eq!(names, vec!["policy-a", "policy-b"]);
    }

    #[test]
    fn suppressed_events_fan_out_to_nothing() {
        let (reader, mut writer) = reflector::store::<DeceptionPolicy>();
        let mut policy = DeceptionPolicy::new("policy-a", DeceptionPolicySpec::default());
        policy.metadata.name = Some("policy-a".to_string());
        writer.apply_watcher_event(&watcher::Event::Apply(policy));

        let tracker = WorkloadChangeTracker::new();
        let meta = metadata("web", Some(1), &[]);
        assert_eq!(
            map_workload_event(&tracker, &reader, WorkloadKind::Pod, &meta).len(),
            1
        );
        assert!(map_workload_event(&tracker, &reader, WorkloadKind::Pod, &meta).is_empty());
    }
}
