//! Koney - Kubernetes operator for honeytokens and cyber deception
//!
//! Koney deploys deception traps (currently filesystem honeytokens) into
//! workloads running in a cluster, together with kernel-probe captors that
//! alert when a trap is touched. Users declare traps in a cluster-scoped
//! `DeceptionPolicy` resource; the controller continuously drives the cluster
//! toward a state where every declared trap is deployed, and cleans traps up
//! when they are removed from the policy or the policy is deleted.
//!
//! # Architecture
//!
//! - Decoys are the artifacts an attacker sees (e.g., the honeytoken file).
//!   They are installed either by exec'ing into running containers or by
//!   mounting a secret-backed volume into a deployment's pod template.
//! - Captors observe access to decoys. They are Tetragon tracing policies
//!   with kernel return-probes on the file-access hooks.
//! - Every workload that Koney mutates carries a JSON annotation (the
//!   "ledger") recording which traps are installed by which policy. The
//!   ledger and the cluster objects are the authoritative state; the
//!   controller stores nothing itself.
//!
//! # Modules
//!
//! - [`crd`] - DeceptionPolicy CRD, trap types, and ledger record types
//! - [`controller`] - Reconciliation loop, cleanup, and watch fan-out
//! - [`decoy`] - Decoy deployment/removal strategies
//! - [`captor`] - Captor (tracing policy) deployment
//! - [`matching`] - Trap selection criteria to (workload, containers) maps
//! - [`ledger`] - The per-workload trap annotation
//! - [`kube_ops`] - Cluster API operations behind a mockable trait
//! - [`workload`] - Pod/Deployment abstraction
//! - [`results`] - Uniform deployment result taxonomy
//! - [`fingerprint`] - Content hashing and command self-marking
//! - [`retry`] - Optimistic-concurrency retry
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod captor;
pub mod controller;
pub mod crd;
pub mod decoy;
pub mod error;
pub mod fingerprint;
pub mod kube_ops;
pub mod ledger;
pub mod matching;
pub mod results;
pub mod retry;
pub mod workload;

pub use error::Error;

use std::time::Duration;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Shared Constants
// =============================================================================
// These constants form the contract between the controller, the resources it
// mutates, and the alert forwarder. Keeping them here ensures the reconciler,
// the deployers, and the tests all agree on the exact literals.

/// Namespace where Koney itself is installed
pub const KONEY_NAMESPACE: &str = "koney-system";

/// Annotation key placed on resources that Koney has modified.
///
/// The value is the JSON-encoded trap ledger; see [`crd::record`]. Koney needs
/// this annotation when cleaning up or updating traps, and it makes modified
/// resources easy to spot.
pub const ANNOTATION_KEY_CHANGES: &str = "koney/changes";

/// Finalizer placed on each DeceptionPolicy.
///
/// Its presence means traps may still need to be cleaned up.
pub const FINALIZER_NAME: &str = "koney/finalizer";

/// Label key placed on resources Koney creates on behalf of a policy
/// (e.g., Tetragon tracing policies), pointing back at the policy name.
pub const LABEL_KEY_POLICY_REF: &str = "koney/deception-policy";

/// If reconciliation fails, retry after this interval.
pub const NORMAL_FAILURE_RETRY_INTERVAL: Duration = Duration::from_secs(60);

/// If resources are not ready yet for traps (e.g., containers still
/// starting), retry reconciliation after this shorter interval.
pub const SHORT_STATUS_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// URL of the alert forwarder that receives alerts from Tetragon.
pub const TETRAGON_WEBHOOK_URL: &str =
    "http://koney-alert-forwarder-service.koney-system.svc:8000/handlers/tetragon";
