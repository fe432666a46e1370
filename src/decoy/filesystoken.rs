//! Filesystem honeytoken decoys
//!
//! Two strategies install the honeytoken file:
//!
//! - `containerExec` writes the file directly into the running containers
//!   of a pod. The content is smuggled through the shell as octal groups,
//!   read back for byte-exact verification, and every emitted command is
//!   marked with the controller's fingerprint so the alert forwarder can
//!   suppress self-alerts.
//! - `volumeMount` mounts a secret-backed volume into a deployment's pod
//!   template. Secret and volume names derive from the trap identity, so
//!   traps targeting the same file share the artifacts.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Secret, SecretVolumeSource, Volume, VolumeMount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use k8s_openapi::ByteString;
use tracing::{debug, info, warn};

use crate::crd::{DeceptionPolicy, DecoyStrategy, FilesystemHoneytoken, FilesystemHoneytokenRecord, Trap, TrapRecord};
use crate::error::join_errors;
use crate::fingerprint::{cat_fingerprint, echo_fingerprint, string_to_oct, KONEY_FINGERPRINT};
use crate::kube_ops::KubeOps;
use crate::ledger;
use crate::matching;
use crate::results::DecoyDeploymentResult;
use crate::retry::{retry_on_conflict, RetryConfig};
use crate::workload::{Workload, WorkloadKind};
use crate::{Error, Result};

/// Name prefix of the secrets backing volume-mounted honeytokens.
pub const SECRET_NAME_PREFIX: &str = "koney-secret-";

/// Name prefix of the volumes carrying honeytokens into pod templates.
pub const VOLUME_NAME_PREFIX: &str = "koney-volume-";

/// The deterministic secret name for a honeytoken.
///
/// The hash covers the file path and the content, so two traps writing
/// different content to the same path get different secrets.
pub fn secret_name(token: &FilesystemHoneytoken) -> String {
    let identity = format!("{}:{}", token.file_path, token.file_content);
    format!("{SECRET_NAME_PREFIX}{}", crate::fingerprint::hash(&identity))
}

/// The deterministic volume name for a honeytoken path.
///
/// The content is not part of the hash: two volumes can never be mounted
/// to the same path with different content anyway.
pub fn volume_name(file_path: &str) -> String {
    format!("{VOLUME_NAME_PREFIX}{}", crate::fingerprint::hash(file_path))
}

/// Deploy a filesystem honeytoken decoy to every matched workload.
///
/// The trap is only deployed to containers that do not already carry it
/// according to the workload's ledger. Partial failures do not block the
/// remaining containers or workloads.
pub async fn deploy(
    ops: &dyn KubeOps,
    policy: &DeceptionPolicy,
    trap: &Trap,
) -> DecoyDeploymentResult {
    let policy_name = policy.metadata.name.clone().unwrap_or_default();
    let Some(token) = trap.filesystem_honeytoken() else {
        return DecoyDeploymentResult {
            errors: vec![Error::validation("trap is not a filesystem honeytoken")],
            ..Default::default()
        };
    };

    // If we aren't allowed to mutate existing resources, avoid matching
    // resources created before the policy was created
    let created_after: Option<Time> = if policy.spec.mutate_existing {
        None
    } else {
        policy.metadata.creation_timestamp.clone()
    };

    let matched = match matching::deployable_workloads(ops, trap, created_after.as_ref()).await {
        Ok(matched) => matched,
        Err(e) => {
            warn!(error = %e, "unable to get matching resources");
            return DecoyDeploymentResult {
                errors: vec![e],
                ..Default::default()
            };
        }
    };
    if matched.deployable.is_empty() {
        return DecoyDeploymentResult {
            any_matched: matched.any_matched,
            all_ready: matched.all_ready,
            errors: vec![],
        };
    }

    let mut errors = Vec::new();

    for (workload, selected_containers) in &matched.deployable {
        // Which containers already carry this trap, per the ledger
        let change = match ledger::change_for(workload, &policy_name) {
            Ok(change) => change,
            Err(e) => {
                warn!(workload = %workload.name(), error = %e, "unable to decode trap annotations");
                errors.push(e);
                continue;
            }
        };
        let mut already_deployed: Vec<String> = Vec::new();
        for record in &change.traps {
            if ledger::are_the_same_trap(record, trap) {
                already_deployed.extend(record.containers.iter().cloned());
            }
        }

        // Containers that carry the trap once this pass is done. Cycling
        // through the selected containers (not the recorded ones) sheds
        // recorded containers that no longer exist.
        let mut deployed_containers: Vec<String> = Vec::new();

        for container in selected_containers {
            if already_deployed.contains(container) {
                debug!(
                    workload = %workload.name(),
                    container = %container,
                    "honeytoken already deployed to container"
                );
                deployed_containers.push(container.clone());
                continue;
            }

            match trap.decoy_deployment.strategy {
                DecoyStrategy::ContainerExec => {
                    if workload.as_pod().is_some() {
                        match deploy_with_container_exec(
                            ops,
                            token,
                            workload.namespace(),
                            workload.name(),
                            container,
                        )
                        .await
                        {
                            Ok(()) => deployed_containers.push(container.clone()),
                            Err(e) => {
                                warn!(
                                    workload = %workload.name(),
                                    container = %container,
                                    error = %e,
                                    "unable to deploy honeytoken with containerExec strategy"
                                );
                                errors.push(e);
                            }
                        }
                    }
                }
                DecoyStrategy::VolumeMount => {
                    if workload.as_deployment().is_some() {
                        match deploy_with_volume_mount(
                            ops,
                            token,
                            workload.namespace(),
                            workload.name(),
                            container,
                        )
                        .await
                        {
                            Ok(()) => deployed_containers.push(container.clone()),
                            Err(e) => {
                                warn!(
                                    workload = %workload.name(),
                                    container = %container,
                                    error = %e,
                                    "unable to deploy honeytoken with volumeMount strategy"
                                );
                                errors.push(e);
                            }
                        }
                    }
                }
                DecoyStrategy::KyvernoPolicy => {
                    errors.push(Error::not_implemented("kyvernoPolicy strategy"));
                }
            }
        }

        // Record the trap on the workload
        if !deployed_containers.is_empty() {
            let kind = workload.kind();
            let namespace = workload.namespace().to_string();
            let name = workload.name().to_string();
            let outcome = retry_on_conflict(
                &RetryConfig::default(),
                "record trap in annotations",
                || async {
                    let Some(mut fresh) =
                        ops.get_workload(kind, namespace.clone(), name.clone()).await?
                    else {
                        return Ok(()); // workload gone, the record goes with it
                    };
                    ledger::add_trap(&mut fresh, &policy_name, trap, &deployed_containers)?;
                    ops.update_workload(fresh).await
                },
            )
            .await;
            if let Err(e) = outcome {
                warn!(workload = %name, error = %e, "unable to update trap annotations");
                errors.push(e);
            }
        }
    }

    DecoyDeploymentResult {
        any_matched: matched.any_matched,
        all_ready: matched.all_ready,
        errors,
    }
}

/// Write the honeytoken into one running container.
///
/// Sequence: mkdir -> write -> readback -> chmod. The write encodes the
/// content as octal groups and reconstructs it with a shell loop; the
/// readback must match the expected content byte-for-byte (modulo one
/// trailing newline) for the deploy to count as successful.
async fn deploy_with_container_exec(
    ops: &dyn KubeOps,
    token: &FilesystemHoneytoken,
    namespace: &str,
    pod: &str,
    container: &str,
) -> Result<()> {
    let exec = |command: Vec<String>| {
        ops.exec(
            namespace.to_string(),
            pod.to_string(),
            container.to_string(),
            command,
        )
    };

    // Create the parent directory if it doesn't exist
    exec(mkdir_command(token)).await?;

    exec(write_command(token)).await?;

    let mut errors = Vec::new();

    // Check that the file was created with the expected content
    match exec(readback_command(token)).await {
        Err(e) => errors.push(e),
        Ok(output) => {
            let expected = token
                .file_content
                .strip_suffix('\n')
                .unwrap_or(token.file_content.as_str());
            let actual = output.strip_suffix('\n').unwrap_or(output.as_str());
            if actual != expected {
                errors.push(Error::exec(format!(
                    "file content in container '{container}' does not match the expected content"
                )));
            } else {
                info!(container = %container, "honeytoken deployed to container");
            }
        }
    }

    if token.read_only {
        if let Err(e) = exec(chmod_command(token)).await {
            errors.push(e);
        }
    }

    match join_errors(errors) {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn mkdir_command(token: &FilesystemHoneytoken) -> Vec<String> {
    vec![
        "mkdir".to_string(),
        "-p".to_string(),
        token.directory().to_string(),
    ]
}

fn write_command(token: &FilesystemHoneytoken) -> Vec<String> {
    let marker = echo_fingerprint(KONEY_FINGERPRINT);
    let script = if token.file_content.is_empty() {
        // Not touch: if the file already has content, touch would keep it
        format!("echo -e \"\\c {marker}\" > \"{}\"", token.file_path)
    } else {
        // The content is octal-encoded to survive special characters (no
        // quoting or command injection issues) and decoded by the loop.
        // $(which echo) avoids the shell built-in echo.
        let oct = string_to_oct(&token.file_content);
        format!(
            "oct_string=\"{oct}\"; i=1; while [ $i -lt ${{#oct_string}} ]; do $(which echo) -e \"\\0$(expr substr $oct_string $i 3)\\c {marker}\"; i=$(expr $i + 3); done > \"{}\"",
            token.file_path
        )
    };
    vec!["sh".to_string(), "-c".to_string(), script]
}

fn readback_command(token: &FilesystemHoneytoken) -> Vec<String> {
    let marker = cat_fingerprint(KONEY_FINGERPRINT);
    vec![
        "sh".to_string(),
        "-c".to_string(),
        format!("cat {marker} \"{}\"", token.file_path),
    ]
}

fn chmod_command(token: &FilesystemHoneytoken) -> Vec<String> {
    vec![
        "chmod".to_string(),
        "444".to_string(),
        token.file_path.clone(),
    ]
}

fn remove_command(file_path: &str) -> Vec<String> {
    vec!["rm".to_string(), file_path.to_string()]
}

fn existence_check_command(file_path: &str) -> Vec<String> {
    vec![
        "sh".to_string(),
        "-c".to_string(),
        format!("[ ! -f {file_path} ] && echo 'No such file' || echo 'File exists'"),
    ]
}

/// Mount the honeytoken into one container of a deployment.
///
/// Ensures the backing secret exists, then adds the volume to the pod
/// template and the volume mount to the container, persisting with an
/// optimistic-concurrency retry.
async fn deploy_with_volume_mount(
    ops: &dyn KubeOps,
    token: &FilesystemHoneytoken,
    namespace: &str,
    deployment: &str,
    container: &str,
) -> Result<()> {
    let file_name = token.file_name();
    if file_name.is_empty() {
        return Err(Error::validation(format!(
            "filePath must point to a file: '{}'",
            token.file_path
        )));
    }

    let secret = secret_name(token);
    ensure_secret(ops, namespace, &secret, file_name, &token.file_content).await?;

    let volume = volume_name(&token.file_path);
    retry_on_conflict(&RetryConfig::default(), "mount honeytoken volume", || async {
        let Some(fresh) = ops
            .get_workload(
                WorkloadKind::Deployment,
                namespace.to_string(),
                deployment.to_string(),
            )
            .await?
        else {
            return Ok(()); // deployment gone
        };
        let Workload::Deployment(mut fresh) = fresh else {
            return Err(Error::internal("expected a deployment"));
        };

        ensure_volume(&mut fresh, &volume, &secret);
        ensure_volume_mount(&mut fresh, container, &volume, token);
        ops.update_workload(Workload::Deployment(fresh)).await
    })
    .await?;

    info!(container = %container, volume = %volume, "honeytoken volume mounted");
    Ok(())
}

/// Create the backing secret if it is absent. A lost creation race against
/// another reconciliation is fine: the name is deterministic, so the
/// existing secret holds the same content.
async fn ensure_secret(
    ops: &dyn KubeOps,
    namespace: &str,
    name: &str,
    key: &str,
    content: &str,
) -> Result<()> {
    if ops
        .get_secret(namespace.to_string(), name.to_string())
        .await?
        .is_some()
    {
        return Ok(());
    }

    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            key.to_string(),
            ByteString(content.as_bytes().to_vec()),
        )])),
        ..Default::default()
    };

    match ops.create_secret(secret).await {
        Ok(()) => Ok(()),
        Err(e) if e.is_conflict() => Ok(()), // already exists
        Err(e) => Err(e),
    }
}

/// Add the honeytoken volume to the pod template unless it is already
/// declared.
fn ensure_volume(deployment: &mut Deployment, volume_name: &str, secret_name: &str) {
    let Some(pod_spec) = deployment
        .spec
        .as_mut()
        .and_then(|spec| spec.template.spec.as_mut())
    else {
        return;
    };

    let volumes = pod_spec.volumes.get_or_insert_with(Vec::new);
    if volumes.iter().any(|v| v.name == volume_name) {
        return;
    }

    volumes.push(Volume {
        name: volume_name.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret_name.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    });
}

/// Add the honeytoken volume mount to the targeted container unless it is
/// already mounted.
fn ensure_volume_mount(
    deployment: &mut Deployment,
    container_name: &str,
    volume_name: &str,
    token: &FilesystemHoneytoken,
) {
    let Some(pod_spec) = deployment
        .spec
        .as_mut()
        .and_then(|spec| spec.template.spec.as_mut())
    else {
        return;
    };

    for container in pod_spec
        .containers
        .iter_mut()
        .filter(|c| c.name == container_name)
    {
        let mounts = container.volume_mounts.get_or_insert_with(Vec::new);
        if mounts.iter().any(|m| m.name == volume_name) {
            continue;
        }

        mounts.push(VolumeMount {
            name: volume_name.to_string(),
            mount_path: token.file_path.clone(),
            sub_path: Some(token.file_name().to_string()),
            read_only: Some(token.read_only),
            ..Default::default()
        });
    }
}

/// Remove a recorded filesystem honeytoken from a workload.
///
/// Every recorded container is cleared with the strategy the record names.
/// If all containers were cleared, the record is removed from the ledger
/// entirely; otherwise the record keeps the residual containers. The
/// workload is persisted with an optimistic-concurrency retry.
pub async fn remove(
    ops: &dyn KubeOps,
    policy_name: &str,
    record: &TrapRecord,
    workload: &Workload,
) -> Result<()> {
    let Some(recorded) = record.filesystem_honeytoken.as_ref() else {
        return Err(Error::internal("record is not a filesystem honeytoken"));
    };

    let mut errors = Vec::new();
    let mut cleared: Vec<String> = Vec::new();

    for container in &record.containers {
        let outcome = match record.deployment_strategy {
            DecoyStrategy::ContainerExec => {
                if workload.as_pod().is_some() {
                    remove_with_container_exec(
                        ops,
                        recorded,
                        workload.namespace(),
                        workload.name(),
                        container,
                    )
                    .await
                } else {
                    Err(Error::internal(
                        "containerExec trap recorded on a non-pod workload",
                    ))
                }
            }
            DecoyStrategy::VolumeMount => {
                if workload.as_deployment().is_some() {
                    remove_with_volume_mount(
                        ops,
                        recorded,
                        workload.namespace(),
                        workload.name(),
                        container,
                    )
                    .await
                } else {
                    Err(Error::internal(
                        "volumeMount trap recorded on a non-deployment workload",
                    ))
                }
            }
            DecoyStrategy::KyvernoPolicy => Err(Error::not_implemented("kyvernoPolicy strategy")),
        };

        match outcome {
            Ok(()) => cleared.push(container.clone()),
            Err(e) => {
                warn!(
                    workload = %workload.name(),
                    container = %container,
                    error = %e,
                    "unable to remove honeytoken from container"
                );
                errors.push(e);
            }
        }
    }

    let kind = workload.kind();
    let namespace = workload.namespace().to_string();
    let name = workload.name().to_string();

    let ledger_update = if cleared.len() == record.containers.len() {
        // Cleared everywhere, drop the record from the ledger
        retry_on_conflict(&RetryConfig::default(), "remove trap from annotations", || async {
            let Some(mut fresh) = ops.get_workload(kind, namespace.clone(), name.clone()).await?
            else {
                return Ok(());
            };
            ledger::remove_trap(&mut fresh, policy_name, record)?;
            ops.update_workload(fresh).await
        })
        .await
    } else {
        // Keep the record, with the containers that still carry the trap
        let residual: Vec<String> = record
            .containers
            .iter()
            .filter(|c| !cleared.contains(*c))
            .cloned()
            .collect();
        retry_on_conflict(&RetryConfig::default(), "update trap annotations", || async {
            let Some(mut fresh) = ops.get_workload(kind, namespace.clone(), name.clone()).await?
            else {
                return Ok(());
            };
            ledger::update_containers(&mut fresh, policy_name, record, &residual)?;
            ops.update_workload(fresh).await
        })
        .await
    };
    if let Err(e) = ledger_update {
        warn!(workload = %name, error = %e, "unable to update trap annotations");
        errors.push(e);
    }

    match join_errors(errors) {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Delete the honeytoken file from one container and verify it is gone.
async fn remove_with_container_exec(
    ops: &dyn KubeOps,
    recorded: &FilesystemHoneytokenRecord,
    namespace: &str,
    pod: &str,
    container: &str,
) -> Result<()> {
    let exec = |command: Vec<String>| {
        ops.exec(
            namespace.to_string(),
            pod.to_string(),
            container.to_string(),
            command,
        )
    };

    exec(remove_command(&recorded.file_path)).await?;

    let output = exec(existence_check_command(&recorded.file_path)).await?;
    if output.contains("No such file") {
        info!(container = %container, "honeytoken removed from container");
        Ok(())
    } else {
        Err(Error::exec(format!(
            "honeytoken file '{}' was not removed from container '{container}'",
            recorded.file_path
        )))
    }
}

/// Unmount the honeytoken volume from one container of a deployment and
/// best-effort delete the backing secret.
async fn remove_with_volume_mount(
    ops: &dyn KubeOps,
    recorded: &FilesystemHoneytokenRecord,
    namespace: &str,
    deployment: &str,
    container: &str,
) -> Result<()> {
    let volume = volume_name(&recorded.file_path);

    let secret_to_delete = retry_on_conflict(
        &RetryConfig::default(),
        "unmount honeytoken volume",
        || async {
            let Some(fresh) = ops
                .get_workload(
                    WorkloadKind::Deployment,
                    namespace.to_string(),
                    deployment.to_string(),
                )
                .await?
            else {
                return Ok(None); // deployment gone
            };
            let Workload::Deployment(mut fresh) = fresh else {
                return Err(Error::internal("expected a deployment"));
            };

            strip_volume_mount(&mut fresh, container, &volume);
            let secret = strip_volume(&mut fresh, &volume);
            ops.update_workload(Workload::Deployment(fresh)).await?;
            Ok(secret)
        },
    )
    .await?;

    if let Some(secret) = secret_to_delete {
        // This may fail if the secret is still used by another workload
        if let Err(e) = ops.delete_secret(namespace.to_string(), secret).await {
            debug!(error = %e, "leaving honeytoken secret behind");
        }
    }

    info!(container = %container, volume = %volume, "honeytoken volume unmounted");
    Ok(())
}

/// Remove the honeytoken volume mount from the targeted container.
fn strip_volume_mount(deployment: &mut Deployment, container_name: &str, volume_name: &str) {
    let Some(pod_spec) = deployment
        .spec
        .as_mut()
        .and_then(|spec| spec.template.spec.as_mut())
    else {
        return;
    };

    for container in pod_spec
        .containers
        .iter_mut()
        .filter(|c| c.name == container_name)
    {
        if let Some(mounts) = container.volume_mounts.as_mut() {
            mounts.retain(|m| m.name != volume_name);
        }
    }
}

/// Remove the honeytoken volume from the pod template, returning the name
/// of the secret it referenced.
fn strip_volume(deployment: &mut Deployment, volume_name: &str) -> Option<String> {
    let pod_spec = deployment
        .spec
        .as_mut()
        .and_then(|spec| spec.template.spec.as_mut())?;
    let volumes = pod_spec.volumes.as_mut()?;

    let mut secret = None;
    volumes.retain(|v| {
        if v.name == volume_name {
            secret = v.secret.as_ref().and_then(|s| s.secret_name.clone());
            false
        } else {
            true
        }
    });
    secret
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        CaptorDeployment, DeceptionPolicySpec, DecoyDeployment, MatchResources, ResourceFilter,
        TrapKind,
    };
    use crate::kube_ops::MockKubeOps;
    use crate::ANNOTATION_KEY_CHANGES;
    use k8s_openapi::api::apps::v1::{DeploymentCondition, DeploymentSpec, DeploymentStatus};
    use k8s_openapi::api::core::v1::{
        Container, ContainerState, ContainerStateRunning, ContainerStatus, Pod, PodCondition,
        PodSpec, PodStatus, PodTemplateSpec,
    };
    use std::sync::{Arc, Mutex};

    fn token(path: &str, content: &str) -> FilesystemHoneytoken {
        FilesystemHoneytoken {
            file_path: path.to_string(),
            file_content: content.to_string(),
            read_only: true,
        }
    }

    fn exec_trap(path: &str, content: &str) -> Trap {
        Trap {
            kind: TrapKind::FilesystemHoneytoken(token(path, content)),
            decoy_deployment: DecoyDeployment {
                strategy: DecoyStrategy::ContainerExec,
            },
            captor_deployment: CaptorDeployment::default(),
            match_resources: MatchResources {
                any: vec![ResourceFilter {
                    namespaces: vec!["default".to_string()],
                    selector: None,
                    container_selector: "nginx".to_string(),
                }],
            },
        }
    }

    fn policy(name: &str) -> DeceptionPolicy {
        let mut policy = DeceptionPolicy::new(name, DeceptionPolicySpec::default());
        policy.metadata.name = Some(name.to_string());
        policy.spec.strict_validation = true;
        policy.spec.mutate_existing = true;
        policy
    }

    fn running_pod(name: &str, containers: &[&str]) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                creation_timestamp: Some(Time(chrono::Utc::now())),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: containers
                    .iter()
                    .map(|c| Container {
                        name: c.to_string(),
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                conditions: Some(vec![PodCondition {
                    type_: "ContainersReady".to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                }]),
                container_statuses: Some(
                    containers
                        .iter()
                        .map(|c| ContainerStatus {
                            name: c.to_string(),
                            ready: true,
                            state: Some(ContainerState {
                                running: Some(ContainerStateRunning::default()),
                                ..Default::default()
                            }),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn ready_deployment(name: &str, containers: &[&str]) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                creation_timestamp: Some(Time(chrono::Utc::now())),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                template: PodTemplateSpec {
                    spec: Some(PodSpec {
                        containers: containers
                            .iter()
                            .map(|c| Container {
                                name: c.to_string(),
                                ..Default::default()
                            })
                            .collect(),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            }),
            status: Some(DeploymentStatus {
                conditions: Some(vec![DeploymentCondition {
                    type_: "Available".to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    // =========================================================================
    // Derived names
    // =========================================================================

    #[test]
    fn derived_names_depend_only_on_identity_fields() {
        let a = token("/etc/secret/token", "x");
        let b = token("/etc/secret/token", "x");
        assert_eq!(secret_name(&a), secret_name(&b));
        assert_eq!(volume_name(&a.file_path), volume_name(&b.file_path));

        // Different content changes the secret but not the volume
        let c = token("/etc/secret/token", "y");
        assert_ne!(secret_name(&a), secret_name(&c));
        assert_eq!(volume_name(&a.file_path), volume_name(&c.file_path));

        let d = token("/other/path", "x");
        assert_ne!(secret_name(&a), secret_name(&d));
        assert_ne!(volume_name(&a.file_path), volume_name(&d.file_path));
    }

    #[test]
    fn derived_names_carry_the_koney_prefixes() {
        let t = token("/etc/secret/token", "x");
        assert!(secret_name(&t).starts_with(SECRET_NAME_PREFIX));
        assert!(volume_name(&t.file_path).starts_with(VOLUME_NAME_PREFIX));
        assert!(volume_name(&t.file_path).len() <= 63);
    }

    // =========================================================================
    // Emitted shell commands
    // =========================================================================

    #[test]
    fn write_command_encodes_content_as_octal_with_fingerprint() {
        let command = write_command(&token("/run/secrets/token", "abc"));
        assert_eq!(command[0], "sh");
        assert_eq!(command[1], "-c");

        let script = &command[2];
        assert!(script.contains("oct_string=\"141142143\""));
        assert!(script.contains("KONEY_FINGERPRINT_1337"));
        assert!(script.contains("> \"/run/secrets/token\""));
        assert!(script.contains("$(which echo)"));
    }

    #[test]
    fn write_command_for_empty_content_writes_an_empty_file() {
        let command = write_command(&token("/run/secrets/token", ""));
        let script = &command[2];
        assert!(!script.contains("oct_string"));
        assert!(script.contains("echo -e \"\\c KONEY_FINGERPRINT_1337\" > \"/run/secrets/token\""));
    }

    #[test]
    fn readback_command_carries_the_cat_fingerprint_flags() {
        let command = readback_command(&token("/run/secrets/token", "abc"));
        assert_eq!(
            command[2],
            "cat -uu -u -uu -u -u -uu -uu -uu -u -u -uu \"/run/secrets/token\""
        );
    }

    #[test]
    fn mkdir_and_chmod_commands_target_the_right_paths() {
        let t = token("/run/secrets/koney/service_token", "x");
        assert_eq!(mkdir_command(&t), vec!["mkdir", "-p", "/run/secrets/koney"]);
        assert_eq!(
            chmod_command(&t),
            vec!["chmod", "444", "/run/secrets/koney/service_token"]
        );
        assert_eq!(
            remove_command(&t.file_path),
            vec!["rm", "/run/secrets/koney/service_token"]
        );
    }

    // =========================================================================
    // Volume and mount mutations
    // =========================================================================

    #[test]
    fn ensure_volume_and_mount_shape_the_deployment() {
        let t = token("/etc/secret/token", "x");
        let mut deployment = ready_deployment("app", &["app"]);

        let volume = volume_name(&t.file_path);
        let secret = secret_name(&t);
        ensure_volume(&mut deployment, &volume, &secret);
        ensure_volume_mount(&mut deployment, "app", &volume, &t);

        let pod_spec = deployment.spec.as_ref().unwrap().template.spec.as_ref().unwrap();
        let volumes = pod_spec.volumes.as_ref().unwrap();
        assert_eq!(volumes.len(), 1);
        assert_eq!(volumes[0].name, volume);
        assert_eq!(
            volumes[0].secret.as_ref().unwrap().secret_name.as_deref(),
            Some(secret.as_str())
        );

        let mounts = pod_spec.containers[0].volume_mounts.as_ref().unwrap();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].name, volume);
        assert_eq!(mounts[0].mount_path, "/etc/secret/token");
        assert_eq!(mounts[0].sub_path.as_deref(), Some("token"));
        assert_eq!(mounts[0].read_only, Some(true));
    }

    #[test]
    fn ensure_volume_and_mount_are_idempotent() {
        let t = token("/etc/secret/token", "x");
        let mut deployment = ready_deployment("app", &["app"]);
        let volume = volume_name(&t.file_path);

        for _ in 0..2 {
            ensure_volume(&mut deployment, &volume, "secret");
            ensure_volume_mount(&mut deployment, "app", &volume, &t);
        }

        let pod_spec = deployment.spec.as_ref().unwrap().template.spec.as_ref().unwrap();
        assert_eq!(pod_spec.volumes.as_ref().unwrap().len(), 1);
        assert_eq!(pod_spec.containers[0].volume_mounts.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn strip_volume_returns_the_backing_secret_name() {
        let t = token("/etc/secret/token", "x");
        let mut deployment = ready_deployment("app", &["app"]);
        let volume = volume_name(&t.file_path);
        ensure_volume(&mut deployment, &volume, "the-secret");
        ensure_volume_mount(&mut deployment, "app", &volume, &t);

        strip_volume_mount(&mut deployment, "app", &volume);
        let secret = strip_volume(&mut deployment, &volume);

        assert_eq!(secret.as_deref(), Some("the-secret"));
        let pod_spec = deployment.spec.as_ref().unwrap().template.spec.as_ref().unwrap();
        assert!(pod_spec.volumes.as_ref().unwrap().is_empty());
        assert!(pod_spec.containers[0].volume_mounts.as_ref().unwrap().is_empty());
    }

    // =========================================================================
    // containerExec deployment stories
    // =========================================================================

    /// Records exec commands and answers the readback with the given
    /// content.
    fn mock_exec(ops: &mut MockKubeOps, readback: &'static str) -> Arc<Mutex<Vec<Vec<String>>>> {
        let commands: Arc<Mutex<Vec<Vec<String>>>> = Arc::new(Mutex::new(Vec::new()));
        let recorded = commands.clone();
        ops.expect_exec().returning(move |_, _, _, command| {
            let is_readback = command
                .get(2)
                .is_some_and(|script| script.starts_with("cat "));
            recorded.lock().unwrap().push(command);
            if is_readback {
                Ok(readback.to_string())
            } else {
                Ok(String::new())
            }
        });
        commands
    }

    #[tokio::test]
    async fn story_deploying_to_a_ready_pod_annotates_it() {
        let mut ops = MockKubeOps::new();
        let pod = running_pod("web", &["nginx"]);

        let listed = pod.clone();
        ops.expect_list_pods()
            .returning(move |_, _| Ok(vec![listed.clone()]));

        let commands = mock_exec(&mut ops, "someverysecrettoken");

        let fetched = pod.clone();
        ops.expect_get_workload()
            .returning(move |_, _, _| Ok(Some(Workload::Pod(fetched.clone()))));

        let updated: Arc<Mutex<Option<Workload>>> = Arc::new(Mutex::new(None));
        let captured = updated.clone();
        ops.expect_update_workload().returning(move |workload| {
            *captured.lock().unwrap() = Some(workload);
            Ok(())
        });

        let trap = exec_trap("/run/secrets/koney/service_token", "someverysecrettoken");
        let result = deploy(&ops, &policy("demo-policy"), &trap).await;

        assert!(result.implies_success(), "errors: {:?}", result.errors);

        // mkdir -> write -> readback -> chmod
        let commands = commands.lock().unwrap();
        assert_eq!(commands.len(), 4);
        assert_eq!(commands[0][0], "mkdir");
        assert!(commands[1][2].contains("oct_string"));
        assert!(commands[2][2].starts_with("cat "));
        assert_eq!(commands[3][0], "chmod");

        // The pod's ledger records the trap on the nginx container
        let updated = updated.lock().unwrap();
        let workload = updated.as_ref().expect("pod was not updated");
        let change = ledger::change_for(workload, "demo-policy").unwrap();
        assert_eq!(change.traps.len(), 1);
        assert_eq!(change.traps[0].containers, vec!["nginx"]);
        assert!(!change.traps[0].created_at.is_empty());
    }

    #[tokio::test]
    async fn story_readback_mismatch_fails_the_container() {
        let mut ops = MockKubeOps::new();
        let pod = running_pod("web", &["nginx"]);

        let listed = pod.clone();
        ops.expect_list_pods()
            .returning(move |_, _| Ok(vec![listed.clone()]));

        mock_exec(&mut ops, "tampered-content");

        let trap = exec_trap("/run/secrets/koney/service_token", "someverysecrettoken");
        let result = deploy(&ops, &policy("demo-policy"), &trap).await;

        assert!(result.implies_failure());
        assert!(result.errors[0]
            .to_string()
            .contains("does not match the expected content"));
    }

    #[tokio::test]
    async fn story_already_deployed_containers_are_not_touched_again() {
        let mut ops = MockKubeOps::new();
        let trap = exec_trap("/run/secrets/koney/service_token", "someverysecrettoken");

        // The pod already carries the trap in its ledger
        let mut annotated = Workload::Pod(running_pod("web", &["nginx"]));
        ledger::add_trap(&mut annotated, "demo-policy", &trap, &["nginx".to_string()]).unwrap();
        let Workload::Pod(pod) = annotated else {
            unreachable!()
        };

        let listed = pod.clone();
        ops.expect_list_pods()
            .returning(move |_, _| Ok(vec![listed.clone()]));

        // No exec expectation: any exec would panic the mock. Only the
        // annotation refresh happens.
        let fetched = pod.clone();
        ops.expect_get_workload()
            .returning(move |_, _, _| Ok(Some(Workload::Pod(fetched.clone()))));
        let updated: Arc<Mutex<Option<Workload>>> = Arc::new(Mutex::new(None));
        let captured = updated.clone();
        ops.expect_update_workload().returning(move |workload| {
            *captured.lock().unwrap() = Some(workload);
            Ok(())
        });

        let result = deploy(&ops, &policy("demo-policy"), &trap).await;
        assert!(result.implies_success(), "errors: {:?}", result.errors);

        let updated = updated.lock().unwrap();
        let change = ledger::change_for(updated.as_ref().unwrap(), "demo-policy").unwrap();
        assert_eq!(change.traps.len(), 1);
        assert!(change.traps[0].updated_at.is_some());
    }

    #[tokio::test]
    async fn story_nothing_matched_reports_no_objects() {
        let mut ops = MockKubeOps::new();
        ops.expect_list_pods().returning(|_, _| Ok(vec![]));

        let trap = exec_trap("/run/secrets/koney/service_token", "x");
        let result = deploy(&ops, &policy("demo-policy"), &trap).await;

        assert!(!result.any_matched);
        assert!(!result.implies_success());
        assert!(!result.implies_retry());
        assert!(result.errors.is_empty());
    }

    #[tokio::test]
    async fn story_mutate_existing_false_skips_preexisting_pods() {
        let mut ops = MockKubeOps::new();
        let pod = running_pod("web", &["nginx"]);
        let listed = pod.clone();
        ops.expect_list_pods()
            .returning(move |_, _| Ok(vec![listed.clone()]));

        let mut policy = policy("demo-policy");
        policy.spec.mutate_existing = false;
        // The policy is created after the pod
        policy.metadata.creation_timestamp = Some(Time(chrono::Utc::now() + chrono::Duration::hours(1)));

        let trap = exec_trap("/run/secrets/koney/service_token", "x");
        let result = deploy(&ops, &policy, &trap).await;

        assert!(!result.any_matched);
        assert!(result.errors.is_empty());
    }

    // =========================================================================
    // volumeMount deployment stories
    // =========================================================================

    #[tokio::test]
    async fn story_volume_mount_creates_secret_volume_and_mount() {
        let mut ops = MockKubeOps::new();
        let deployment = ready_deployment("app", &["app"]);

        let listed = deployment.clone();
        ops.expect_list_deployments()
            .returning(move |_, _| Ok(vec![listed.clone()]));

        ops.expect_get_secret().returning(|_, _| Ok(None));
        let created_secret: Arc<Mutex<Option<Secret>>> = Arc::new(Mutex::new(None));
        let captured_secret = created_secret.clone();
        ops.expect_create_secret().returning(move |secret| {
            *captured_secret.lock().unwrap() = Some(secret);
            Ok(())
        });

        let fetched = deployment.clone();
        ops.expect_get_workload()
            .returning(move |_, _, _| Ok(Some(Workload::Deployment(fetched.clone()))));

        let updates: Arc<Mutex<Vec<Workload>>> = Arc::new(Mutex::new(Vec::new()));
        let captured = updates.clone();
        ops.expect_update_workload().returning(move |workload| {
            captured.lock().unwrap().push(workload);
            Ok(())
        });

        let mut trap = exec_trap("/etc/secret/token", "x");
        trap.decoy_deployment.strategy = DecoyStrategy::VolumeMount;
        trap.match_resources.any[0].container_selector = "app".to_string();

        let result = deploy(&ops, &policy("demo-policy"), &trap).await;
        assert!(result.implies_success(), "errors: {:?}", result.errors);

        // The secret holds the file content under the filename key
        let secret = created_secret.lock().unwrap();
        let secret = secret.as_ref().expect("secret was not created");
        let t = token("/etc/secret/token", "x");
        assert_eq!(secret.metadata.name.as_deref(), Some(secret_name(&t).as_str()));
        assert_eq!(secret.metadata.namespace.as_deref(), Some("default"));
        let data = secret.data.as_ref().unwrap();
        assert_eq!(data["token"].0, b"x".to_vec());

        // First update mounts the volume, second update records the ledger
        let updates = updates.lock().unwrap();
        assert_eq!(updates.len(), 2);
        let Workload::Deployment(mounted) = &updates[0] else {
            panic!("expected a deployment update");
        };
        let pod_spec = mounted.spec.as_ref().unwrap().template.spec.as_ref().unwrap();
        assert_eq!(pod_spec.volumes.as_ref().unwrap()[0].name, volume_name("/etc/secret/token"));
        let mounts = pod_spec.containers[0].volume_mounts.as_ref().unwrap();
        assert_eq!(mounts[0].mount_path, "/etc/secret/token");
        assert_eq!(mounts[0].sub_path.as_deref(), Some("token"));
        assert_eq!(mounts[0].read_only, Some(true));

        let change = ledger::change_for(&updates[1], "demo-policy").unwrap();
        assert_eq!(change.traps.len(), 1);
        assert_eq!(change.traps[0].deployment_strategy, DecoyStrategy::VolumeMount);
        assert_eq!(change.traps[0].containers, vec!["app"]);
    }

    #[tokio::test]
    async fn story_existing_secret_is_reused() {
        let mut ops = MockKubeOps::new();
        let deployment = ready_deployment("app", &["app"]);

        let listed = deployment.clone();
        ops.expect_list_deployments()
            .returning(move |_, _| Ok(vec![listed.clone()]));

        // The secret already exists; create_secret must not be called
        ops.expect_get_secret()
            .returning(|_, _| Ok(Some(Secret::default())));

        let fetched = deployment.clone();
        ops.expect_get_workload()
            .returning(move |_, _, _| Ok(Some(Workload::Deployment(fetched.clone()))));
        ops.expect_update_workload().returning(|_| Ok(()));

        let mut trap = exec_trap("/etc/secret/token", "x");
        trap.decoy_deployment.strategy = DecoyStrategy::VolumeMount;
        trap.match_resources.any[0].container_selector = "app".to_string();

        let result = deploy(&ops, &policy("demo-policy"), &trap).await;
        assert!(result.implies_success(), "errors: {:?}", result.errors);
    }

    // =========================================================================
    // Removal stories
    // =========================================================================

    #[tokio::test]
    async fn story_removal_clears_the_file_and_the_ledger() {
        let trap = exec_trap("/run/secrets/koney/service_token", "x");
        let mut annotated = Workload::Pod(running_pod("web", &["nginx"]));
        ledger::add_trap(&mut annotated, "demo-policy", &trap, &["nginx".to_string()]).unwrap();
        let record = ledger::change_for(&annotated, "demo-policy").unwrap().traps[0].clone();

        let mut ops = MockKubeOps::new();
        let commands: Arc<Mutex<Vec<Vec<String>>>> = Arc::new(Mutex::new(Vec::new()));
        let recorded = commands.clone();
        ops.expect_exec().returning(move |_, _, _, command| {
            let is_check = command
                .get(2)
                .is_some_and(|script| script.starts_with("[ ! -f"));
            recorded.lock().unwrap().push(command);
            if is_check {
                Ok("No such file\n".to_string())
            } else {
                Ok(String::new())
            }
        });

        let fetched = annotated.clone();
        ops.expect_get_workload().returning(move |_, _, _| {
            let Workload::Pod(pod) = &fetched else {
                unreachable!()
            };
            Ok(Some(Workload::Pod(pod.clone())))
        });

        let updated: Arc<Mutex<Option<Workload>>> = Arc::new(Mutex::new(None));
        let captured = updated.clone();
        ops.expect_update_workload().returning(move |workload| {
            *captured.lock().unwrap() = Some(workload);
            Ok(())
        });

        remove(&ops, "demo-policy", &record, &annotated).await.unwrap();

        let commands = commands.lock().unwrap();
        assert_eq!(commands[0], vec!["rm", "/run/secrets/koney/service_token"]);
        assert!(commands[1][2].starts_with("[ ! -f"));

        // The annotation is gone entirely
        let updated = updated.lock().unwrap();
        assert_eq!(
            updated.as_ref().unwrap().annotation(ANNOTATION_KEY_CHANGES),
            None
        );
    }

    #[tokio::test]
    async fn story_surviving_file_keeps_the_record() {
        let trap = exec_trap("/run/secrets/koney/service_token", "x");
        let mut annotated = Workload::Pod(running_pod("web", &["nginx", "sidecar"]));
        ledger::add_trap(
            &mut annotated,
            "demo-policy",
            &trap,
            &["nginx".to_string(), "sidecar".to_string()],
        )
        .unwrap();
        let record = ledger::change_for(&annotated, "demo-policy").unwrap().traps[0].clone();

        let mut ops = MockKubeOps::new();
        // Removal succeeds in nginx but the file survives in sidecar
        ops.expect_exec().returning(move |_, _, container, command| {
            if command.get(2).is_some_and(|s| s.starts_with("[ ! -f")) {
                if container == "nginx" {
                    Ok("No such file\n".to_string())
                } else {
                    Ok("File exists\n".to_string())
                }
            } else {
                Ok(String::new())
            }
        });

        let fetched = annotated.clone();
        ops.expect_get_workload().returning(move |_, _, _| {
            let Workload::Pod(pod) = &fetched else {
                unreachable!()
            };
            Ok(Some(Workload::Pod(pod.clone())))
        });

        let updated: Arc<Mutex<Option<Workload>>> = Arc::new(Mutex::new(None));
        let captured = updated.clone();
        ops.expect_update_workload().returning(move |workload| {
            *captured.lock().unwrap() = Some(workload);
            Ok(())
        });

        let err = remove(&ops, "demo-policy", &record, &annotated).await;
        assert!(err.is_err());

        // The ledger keeps the container where the file survived
        let updated = updated.lock().unwrap();
        let change = ledger::change_for(updated.as_ref().unwrap(), "demo-policy").unwrap();
        assert_eq!(change.traps.len(), 1);
        assert_eq!(change.traps[0].containers, vec!["sidecar"]);
    }

    #[tokio::test]
    async fn story_volume_mount_removal_unmounts_and_deletes_the_secret() {
        let t = token("/etc/secret/token", "x");
        let mut deployment = ready_deployment("app", &["app"]);
        let volume = volume_name(&t.file_path);
        let secret = secret_name(&t);
        ensure_volume(&mut deployment, &volume, &secret);
        ensure_volume_mount(&mut deployment, "app", &volume, &t);

        let mut trap = exec_trap("/etc/secret/token", "x");
        trap.decoy_deployment.strategy = DecoyStrategy::VolumeMount;
        let mut annotated = Workload::Deployment(deployment.clone());
        ledger::add_trap(&mut annotated, "demo-policy", &trap, &["app".to_string()]).unwrap();
        let record = ledger::change_for(&annotated, "demo-policy").unwrap().traps[0].clone();

        let mut ops = MockKubeOps::new();
        let fetched = annotated.clone();
        ops.expect_get_workload().returning(move |_, _, _| {
            let Workload::Deployment(d) = &fetched else {
                unreachable!()
            };
            Ok(Some(Workload::Deployment(d.clone())))
        });

        let updates: Arc<Mutex<Vec<Workload>>> = Arc::new(Mutex::new(Vec::new()));
        let captured = updates.clone();
        ops.expect_update_workload().returning(move |workload| {
            captured.lock().unwrap().push(workload);
            Ok(())
        });

        let deleted_secret: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let captured_secret = deleted_secret.clone();
        ops.expect_delete_secret().returning(move |_, name| {
            *captured_secret.lock().unwrap() = Some(name);
            Ok(())
        });

        remove(&ops, "demo-policy", &record, &annotated).await.unwrap();

        assert_eq!(deleted_secret.lock().unwrap().as_deref(), Some(secret.as_str()));

        let updates = updates.lock().unwrap();
        let Workload::Deployment(unmounted) = &updates[0] else {
            panic!("expected a deployment update");
        };
        let pod_spec = unmounted.spec.as_ref().unwrap().template.spec.as_ref().unwrap();
        assert!(pod_spec.volumes.as_ref().unwrap().is_empty());
        assert!(pod_spec.containers[0].volume_mounts.as_ref().unwrap().is_empty());

        // The ledger record is gone
        assert_eq!(
            updates[1].annotation(ANNOTATION_KEY_CHANGES),
            None
        );
    }
}
