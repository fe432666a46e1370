//! Custom resource definitions and wire types for Koney
//!
//! This module contains the DeceptionPolicy CRD, the trap specification
//! types embedded in it, and the ledger record types that Koney writes into
//! workload annotations.

pub mod policy;
pub mod record;
pub mod trap;

pub use policy::{
    ConditionStatus, DeceptionPolicy, DeceptionPolicyCondition, DeceptionPolicySpec,
    DeceptionPolicyStatus,
};
pub use record::{ChangeRecord, FilesystemHoneytokenRecord, TrapRecord};
pub use trap::{
    CaptorDeployment, CaptorStrategy, DecoyDeployment, DecoyStrategy, FilesystemHoneytoken,
    HttpEndpoint, HttpPayload, MatchResources, ResourceFilter, Trap, TrapKind, TrapType,
};
