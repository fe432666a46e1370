//! Cluster API operations behind a mockable trait
//!
//! Every interaction the controller has with the cluster goes through
//! [`KubeOps`]. This allows mocking the Kubernetes client in tests while
//! using the real client in production.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::api::{Api, AttachParams, DeleteParams, ListParams, PostParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use tokio::io::AsyncReadExt;

#[cfg(test)]
use mockall::automock;

use crate::captor::tetragon::TracingPolicy;
use crate::crd::DeceptionPolicy;
use crate::workload::{Workload, WorkloadKind};
use crate::{Error, Result, LABEL_KEY_POLICY_REF};

/// Trait abstracting the Kubernetes client operations used by the
/// controller.
///
/// All arguments are owned so that call recording in tests stays simple.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeOps: Send + Sync {
    /// Get a DeceptionPolicy by name, or None if it does not exist.
    async fn get_policy(&self, name: String) -> Result<Option<DeceptionPolicy>>;

    /// Replace a DeceptionPolicy (spec and metadata). Conflicts surface as
    /// errors; callers wrap this in an optimistic-concurrency retry.
    async fn update_policy(&self, policy: DeceptionPolicy) -> Result<()>;

    /// Replace the status subresource of a DeceptionPolicy.
    async fn update_policy_status(&self, policy: DeceptionPolicy) -> Result<()>;

    /// List pods, optionally restricted to a namespace and/or an exact
    /// label match.
    async fn list_pods(
        &self,
        namespace: Option<String>,
        labels: Option<BTreeMap<String, String>>,
    ) -> Result<Vec<Pod>>;

    /// List deployments, optionally restricted to a namespace and/or an
    /// exact label match.
    async fn list_deployments(
        &self,
        namespace: Option<String>,
        labels: Option<BTreeMap<String, String>>,
    ) -> Result<Vec<Deployment>>;

    /// Get a workload by kind, namespace, and name, or None if gone.
    async fn get_workload(
        &self,
        kind: WorkloadKind,
        namespace: String,
        name: String,
    ) -> Result<Option<Workload>>;

    /// Replace a workload. Conflicts surface as errors; callers wrap this
    /// in an optimistic-concurrency retry.
    async fn update_workload(&self, workload: Workload) -> Result<()>;

    /// Get a secret, or None if it does not exist.
    async fn get_secret(&self, namespace: String, name: String) -> Result<Option<Secret>>;

    /// Create a secret in the namespace set in its metadata.
    async fn create_secret(&self, secret: Secret) -> Result<()>;

    /// Delete a secret.
    async fn delete_secret(&self, namespace: String, name: String) -> Result<()>;

    /// Execute a command in a container and return its stdout. A non-zero
    /// exit reports the stderr output through the error.
    ///
    /// Stdin is disabled and no TTY is allocated.
    async fn exec(
        &self,
        namespace: String,
        pod: String,
        container: String,
        command: Vec<String>,
    ) -> Result<String>;

    /// Get a tracing policy by name, or None if it does not exist.
    async fn get_tracing_policy(&self, name: String) -> Result<Option<TracingPolicy>>;

    /// Create a tracing policy. A 404 means the tracing operator (and with
    /// it the TracingPolicy kind) is not installed.
    async fn create_tracing_policy(&self, policy: TracingPolicy) -> Result<()>;

    /// Delete a tracing policy by name.
    async fn delete_tracing_policy(&self, name: String) -> Result<()>;

    /// List the tracing policies labeled as belonging to a DeceptionPolicy.
    /// A 404 means the tracing operator is not installed.
    async fn list_tracing_policies(&self, policy_name: String) -> Result<Vec<TracingPolicy>>;
}

/// Get a resource by name, returning None if not found.
///
/// Reduces boilerplate for the common pattern of handling 404 errors when
/// fetching resources that may or may not exist.
async fn get_optional<K>(api: &Api<K>, name: &str) -> Result<Option<K>>
where
    K: Resource + Clone + DeserializeOwned + std::fmt::Debug,
{
    match api.get(name).await {
        Ok(resource) => Ok(Some(resource)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn list_params(labels: Option<BTreeMap<String, String>>) -> ListParams {
    match labels {
        Some(labels) if !labels.is_empty() => {
            let selector = labels
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(",");
            ListParams::default().labels(&selector)
        }
        _ => ListParams::default(),
    }
}

/// Real Kubernetes client implementation of [`KubeOps`].
#[derive(Clone)]
pub struct KubeClient {
    client: Client,
}

impl KubeClient {
    /// Create a new KubeClient wrapping the given kube Client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn pods(&self, namespace: Option<&str>) -> Api<Pod> {
        match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    fn deployments(&self, namespace: Option<&str>) -> Api<Deployment> {
        match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }
}

#[async_trait]
impl KubeOps for KubeClient {
    async fn get_policy(&self, name: String) -> Result<Option<DeceptionPolicy>> {
        let api: Api<DeceptionPolicy> = Api::all(self.client.clone());
        get_optional(&api, &name).await
    }

    async fn update_policy(&self, policy: DeceptionPolicy) -> Result<()> {
        let api: Api<DeceptionPolicy> = Api::all(self.client.clone());
        let name = policy.metadata.name.clone().unwrap_or_default();
        api.replace(&name, &PostParams::default(), &policy).await?;
        Ok(())
    }

    async fn update_policy_status(&self, policy: DeceptionPolicy) -> Result<()> {
        let api: Api<DeceptionPolicy> = Api::all(self.client.clone());
        let name = policy.metadata.name.clone().unwrap_or_default();
        let data = serde_json::to_vec(&policy)?;
        api.replace_status(&name, &PostParams::default(), data)
            .await?;
        Ok(())
    }

    async fn list_pods(
        &self,
        namespace: Option<String>,
        labels: Option<BTreeMap<String, String>>,
    ) -> Result<Vec<Pod>> {
        let api = self.pods(namespace.as_deref());
        Ok(api.list(&list_params(labels)).await?.items)
    }

    async fn list_deployments(
        &self,
        namespace: Option<String>,
        labels: Option<BTreeMap<String, String>>,
    ) -> Result<Vec<Deployment>> {
        let api = self.deployments(namespace.as_deref());
        Ok(api.list(&list_params(labels)).await?.items)
    }

    async fn get_workload(
        &self,
        kind: WorkloadKind,
        namespace: String,
        name: String,
    ) -> Result<Option<Workload>> {
        match kind {
            WorkloadKind::Pod => {
                let api = self.pods(Some(&namespace));
                Ok(get_optional(&api, &name).await?.map(Workload::Pod))
            }
            WorkloadKind::Deployment => {
                let api = self.deployments(Some(&namespace));
                Ok(get_optional(&api, &name).await?.map(Workload::Deployment))
            }
        }
    }

    async fn update_workload(&self, workload: Workload) -> Result<()> {
        let namespace = workload.namespace().to_string();
        let name = workload.name().to_string();
        match workload {
            Workload::Pod(pod) => {
                let api = self.pods(Some(&namespace));
                api.replace(&name, &PostParams::default(), &pod).await?;
            }
            Workload::Deployment(deployment) => {
                let api = self.deployments(Some(&namespace));
                api.replace(&name, &PostParams::default(), &deployment)
                    .await?;
            }
        }
        Ok(())
    }

    async fn get_secret(&self, namespace: String, name: String) -> Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);
        get_optional(&api, &name).await
    }

    async fn create_secret(&self, secret: Secret) -> Result<()> {
        let namespace = secret.metadata.namespace.clone().unwrap_or_default();
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);
        api.create(&PostParams::default(), &secret).await?;
        Ok(())
    }

    async fn delete_secret(&self, namespace: String, name: String) -> Result<()> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);
        api.delete(&name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn exec(
        &self,
        namespace: String,
        pod: String,
        container: String,
        command: Vec<String>,
    ) -> Result<String> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
        let params = AttachParams::default()
            .container(container)
            .stdin(false)
            .stdout(true)
            .stderr(true)
            .tty(false);

        let mut attached = api.exec(&pod, command, &params).await?;

        let mut stdout_reader = attached
            .stdout()
            .ok_or_else(|| Error::exec("exec stdout stream unavailable"))?;
        let mut stderr_reader = attached
            .stderr()
            .ok_or_else(|| Error::exec("exec stderr stream unavailable"))?;
        let status_future = attached.take_status();

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let (stdout_read, stderr_read) = tokio::join!(
            stdout_reader.read_to_end(&mut stdout),
            stderr_reader.read_to_end(&mut stderr)
        );
        stdout_read.map_err(|e| Error::exec(format!("reading exec stdout: {e}")))?;
        stderr_read.map_err(|e| Error::exec(format!("reading exec stderr: {e}")))?;

        let status = match status_future {
            Some(future) => future.await,
            None => None,
        };

        attached
            .join()
            .await
            .map_err(|e| Error::exec(format!("exec stream error: {e}")))?;

        let stderr = String::from_utf8_lossy(&stderr).to_string();
        if let Some(status) = status {
            if status.status.as_deref() == Some("Failure") {
                let detail = status.message.unwrap_or(stderr);
                return Err(Error::exec(detail));
            }
        }

        Ok(String::from_utf8_lossy(&stdout).to_string())
    }

    async fn get_tracing_policy(&self, name: String) -> Result<Option<TracingPolicy>> {
        let api: Api<TracingPolicy> = Api::all(self.client.clone());
        get_optional(&api, &name).await
    }

    async fn create_tracing_policy(&self, policy: TracingPolicy) -> Result<()> {
        let api: Api<TracingPolicy> = Api::all(self.client.clone());
        api.create(&PostParams::default(), &policy).await?;
        Ok(())
    }

    async fn delete_tracing_policy(&self, name: String) -> Result<()> {
        let api: Api<TracingPolicy> = Api::all(self.client.clone());
        api.delete(&name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn list_tracing_policies(&self, policy_name: String) -> Result<Vec<TracingPolicy>> {
        let api: Api<TracingPolicy> = Api::all(self.client.clone());
        let params = ListParams::default().labels(&format!("{LABEL_KEY_POLICY_REF}={policy_name}"));
        Ok(api.list(&params).await?.items)
    }
}
