//! Uniform result taxonomy for decoy and captor deployments
//!
//! Both deployer kinds report through a small result struct whose
//! predicates tell the reconciler whether a trap counts as a success, a
//! failure, or a candidate for a short-interval retry (matched workloads
//! that were not ready yet). Per-trap results are then summarized into a
//! [`TrapReconcileResult`] that drives the status conditions and the
//! requeue decision.

use crate::Error;

/// The outcome of deploying one decoy trap.
#[derive(Debug, Default)]
pub struct DecoyDeploymentResult {
    /// True if at least one workload matched the trap's selection criteria,
    /// regardless of readiness. Workloads with a deletion timestamp are not
    /// considered matched at all.
    pub any_matched: bool,

    /// True if all the workloads the trap should be deployed to were ready.
    /// Meaningless if nothing matched or errors occurred.
    pub all_ready: bool,

    /// The errors that happened during the deployment.
    pub errors: Vec<Error>,
}

impl DecoyDeploymentResult {
    /// A deployment happened, it was successful, and we should not retry.
    pub fn implies_success(&self) -> bool {
        self.any_matched && self.all_ready && self.errors.is_empty()
    }

    /// A deployment happened, but errors occurred.
    pub fn implies_failure(&self) -> bool {
        !self.errors.is_empty()
    }

    /// The deployment should be retried later: something matched, but not
    /// everything was ready yet.
    pub fn implies_retry(&self) -> bool {
        self.any_matched && !self.all_ready && self.errors.is_empty()
    }
}

/// The outcome of deploying one captor.
#[derive(Debug, Default)]
pub struct CaptorDeploymentResult {
    /// The errors that happened during the deployment.
    pub errors: Vec<Error>,

    /// True if we saw indications that the tracing operator is not
    /// installed in the cluster.
    pub missing_tracing_operator: bool,
}

impl CaptorDeploymentResult {
    /// The captor was deployed (or already existed).
    pub fn implies_success(&self) -> bool {
        self.errors.is_empty()
    }

    /// The captor could not be deployed.
    pub fn implies_failure(&self) -> bool {
        !self.errors.is_empty() || self.missing_tracing_operator
    }

    /// Captors never request a readiness retry.
    pub fn implies_retry(&self) -> bool {
        false
    }
}

/// Summary of reconciling all decoys (or all captors) of a policy.
#[derive(Debug, Default)]
pub struct TrapReconcileResult {
    /// Total number of traps that were passed for reconciliation
    pub num_traps: usize,
    /// Number of traps that were successfully reconciled
    pub num_successes: usize,
    /// Number of traps that had errors during reconciliation
    pub num_failures: usize,
    /// True if we encountered a situation that warrants a retry soon
    pub should_requeue: bool,
    /// A reason overriding the default one in the status condition
    pub override_reason: Option<&'static str>,
    /// A message overriding the default one in the status condition
    pub override_message: Option<&'static str>,
    /// All the errors that happened during reconciliation
    pub errors: Vec<Error>,
}

impl TrapReconcileResult {
    /// Number of traps for which a reconciliation was actually tried
    /// (successes + failures). Lower than `num_traps` when traps are
    /// skipped because nothing needs to be done for them.
    pub fn num_tries(&self) -> usize {
        self.num_successes + self.num_failures
    }

    /// Number of traps that were skipped during reconciliation.
    pub fn num_skipped(&self) -> usize {
        self.num_traps - self.num_successes - self.num_failures
    }
}
