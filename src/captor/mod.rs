//! Captor deployment
//!
//! A captor is the probe that observes access to a decoy. The only
//! implemented strategy produces Tetragon tracing policies with kernel
//! return-probes on the file-access hooks; the documents are created in
//! the cluster and owned by the DeceptionPolicy.

pub mod tetragon;

use tracing::error;

use crate::crd::{CaptorStrategy, DeceptionPolicy, Trap, TrapKind};
use crate::kube_ops::KubeOps;
use crate::results::CaptorDeploymentResult;
use crate::Error;

/// Deploy the captor for a trap, dispatching on the trap kind and the
/// captor strategy.
pub async fn deploy_captor(
    ops: &dyn KubeOps,
    policy: &DeceptionPolicy,
    trap: &Trap,
) -> CaptorDeploymentResult {
    match &trap.kind {
        TrapKind::FilesystemHoneytoken(_) => match trap.captor_deployment.strategy {
            CaptorStrategy::Tetragon => match tetragon::deploy(ops, policy, trap).await {
                Ok(()) => CaptorDeploymentResult::default(),
                Err(e) => {
                    // A 404 on a list/create of the TracingPolicy kind means
                    // the Tetragon CRDs are not registered in the cluster
                    let missing_tracing_operator = e.is_not_found();
                    if missing_tracing_operator {
                        error!("Tetragon is not installed - cannot deploy captors with Tetragon");
                    }
                    CaptorDeploymentResult {
                        errors: vec![e],
                        missing_tracing_operator,
                    }
                }
            },
        },
        TrapKind::HttpEndpoint(_) => CaptorDeploymentResult {
            errors: vec![Error::not_implemented("HttpEndpoint captors")],
            missing_tracing_operator: false,
        },
        TrapKind::HttpPayload(_) => CaptorDeploymentResult {
            errors: vec![Error::not_implemented("HttpPayload captors")],
            missing_tracing_operator: false,
        },
    }
}
