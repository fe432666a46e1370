//! Pod/Deployment abstraction
//!
//! Traps target two kinds of workloads: pods (for the containerExec
//! strategy) and deployments (for the volumeMount strategy). This module
//! provides a tagged wrapper so the ledger, the matcher, and the cleanup
//! paths can treat both uniformly.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

/// The kind of a workload that can carry traps.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkloadKind {
    /// A core/v1 Pod
    Pod,
    /// An apps/v1 Deployment
    Deployment,
}

impl std::fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pod => write!(f, "pod"),
            Self::Deployment => write!(f, "deployment"),
        }
    }
}

/// A workload that traps can be deployed to.
#[derive(Clone, Debug)]
pub enum Workload {
    /// A core/v1 Pod
    Pod(Pod),
    /// An apps/v1 Deployment
    Deployment(Deployment),
}

impl From<Pod> for Workload {
    fn from(pod: Pod) -> Self {
        Self::Pod(pod)
    }
}

impl From<Deployment> for Workload {
    fn from(deployment: Deployment) -> Self {
        Self::Deployment(deployment)
    }
}

impl Workload {
    /// The kind of this workload.
    pub fn kind(&self) -> WorkloadKind {
        match self {
            Self::Pod(_) => WorkloadKind::Pod,
            Self::Deployment(_) => WorkloadKind::Deployment,
        }
    }

    /// The workload's object metadata.
    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            Self::Pod(pod) => &pod.metadata,
            Self::Deployment(deployment) => &deployment.metadata,
        }
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        match self {
            Self::Pod(pod) => &mut pod.metadata,
            Self::Deployment(deployment) => &mut deployment.metadata,
        }
    }

    /// The workload's name, or an empty string if unset.
    pub fn name(&self) -> &str {
        self.metadata().name.as_deref().unwrap_or_default()
    }

    /// The workload's namespace, or an empty string if unset.
    pub fn namespace(&self) -> &str {
        self.metadata().namespace.as_deref().unwrap_or_default()
    }

    /// The workload's annotations, if any.
    pub fn annotations(&self) -> Option<&BTreeMap<String, String>> {
        self.metadata().annotations.as_ref()
    }

    /// One annotation value, if present.
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations()
            .and_then(|a| a.get(key))
            .map(String::as_str)
    }

    /// Set an annotation, creating the annotation map if needed.
    pub fn set_annotation(&mut self, key: &str, value: String) {
        self.metadata_mut()
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value);
    }

    /// Remove an annotation if present.
    pub fn remove_annotation(&mut self, key: &str) {
        if let Some(annotations) = self.metadata_mut().annotations.as_mut() {
            annotations.remove(key);
        }
    }

    /// The workload's creation timestamp, if set.
    pub fn creation_timestamp(&self) -> Option<&Time> {
        self.metadata().creation_timestamp.as_ref()
    }

    /// The workload's deletion timestamp, if set.
    pub fn deletion_timestamp(&self) -> Option<&Time> {
        self.metadata().deletion_timestamp.as_ref()
    }

    /// The names of the declared containers: `spec.containers` for a pod,
    /// `spec.template.spec.containers` for a deployment.
    pub fn container_names(&self) -> Vec<String> {
        match self {
            Self::Pod(pod) => pod
                .spec
                .as_ref()
                .map(|spec| spec.containers.iter().map(|c| c.name.clone()).collect())
                .unwrap_or_default(),
            Self::Deployment(deployment) => deployment
                .spec
                .as_ref()
                .and_then(|spec| spec.template.spec.as_ref())
                .map(|spec| spec.containers.iter().map(|c| c.name.clone()).collect())
                .unwrap_or_default(),
        }
    }

    /// The inner pod, if this is one.
    pub fn as_pod(&self) -> Option<&Pod> {
        match self {
            Self::Pod(pod) => Some(pod),
            Self::Deployment(_) => None,
        }
    }

    /// The inner deployment, if this is one.
    pub fn as_deployment(&self) -> Option<&Deployment> {
        match self {
            Self::Pod(_) => None,
            Self::Deployment(deployment) => Some(deployment),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::DeploymentSpec;
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};

    fn pod_with_containers(names: &[&str]) -> Workload {
        Workload::Pod(Pod {
            metadata: ObjectMeta {
                name: Some("my-pod".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: names
                    .iter()
                    .map(|n| Container {
                        name: n.to_string(),
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    fn deployment_with_containers(names: &[&str]) -> Workload {
        Workload::Deployment(Deployment {
            metadata: ObjectMeta {
                name: Some("my-deployment".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                template: PodTemplateSpec {
                    spec: Some(PodSpec {
                        containers: names
                            .iter()
                            .map(|n| Container {
                                name: n.to_string(),
                                ..Default::default()
                            })
                            .collect(),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    #[test]
    fn container_names_come_from_the_right_spec_level() {
        assert_eq!(
            pod_with_containers(&["nginx", "sidecar"]).container_names(),
            vec!["nginx", "sidecar"]
        );
        assert_eq!(
            deployment_with_containers(&["app"]).container_names(),
            vec!["app"]
        );
    }

    #[test]
    fn annotations_are_created_on_demand() {
        let mut pod = pod_with_containers(&["nginx"]);
        assert!(pod.annotations().is_none());

        pod.set_annotation("koney/changes", "[]".to_string());
        assert_eq!(pod.annotation("koney/changes"), Some("[]"));

        pod.remove_annotation("koney/changes");
        assert_eq!(pod.annotation("koney/changes"), None);
    }

    #[test]
    fn kind_follows_the_variant() {
        assert_eq!(pod_with_containers(&[]).kind(), WorkloadKind::Pod);
        assert_eq!(
            deployment_with_containers(&[]).kind(),
            WorkloadKind::Deployment
        );
        assert_eq!(WorkloadKind::Pod.to_string(), "pod");
        assert_eq!(WorkloadKind::Deployment.to_string(), "deployment");
    }
}
