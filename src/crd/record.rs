//! Ledger record types
//!
//! These are the JSON wire types stored in the trap annotation on mutated
//! workloads (see [`crate::ANNOTATION_KEY_CHANGES`]). They are intentionally
//! a flat blob on the workload, not a pointer graph; everything else is
//! re-derived from the cluster API.

use serde::{Deserialize, Serialize};

use super::trap::{DecoyStrategy, TrapType};

/// ChangeRecord stores the changes made by Koney to an object on behalf of
/// one DeceptionPolicy.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    /// Name of the DeceptionPolicy that was applied to the object
    pub deception_policy_name: String,

    /// The traps that were added to the object
    pub traps: Vec<TrapRecord>,
}

/// TrapRecord stores the information of one trap installed on an object.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrapRecord {
    /// The strategy used to deploy the trap
    pub deployment_strategy: DecoyStrategy,

    /// The containers where the trap is deployed. Names are unique.
    pub containers: Vec<String>,

    /// RFC 3339 time when the trap was installed
    pub created_at: String,

    /// RFC 3339 time when the trap was last updated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,

    /// The filesystem honeytoken deployment, if this records one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filesystem_honeytoken: Option<FilesystemHoneytokenRecord>,

    /// The HTTP endpoint deployment, if this records one (reserved)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_endpoint: Option<HttpEndpointRecord>,

    /// The HTTP payload deployment, if this records one (reserved)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_payload: Option<HttpPayloadRecord>,
}

/// A concrete deployment of a filesystem honeytoken trap.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FilesystemHoneytokenRecord {
    /// Absolute path of the honeytoken file
    pub file_path: String,

    /// Stable hash of the file content
    pub file_content_hash: String,

    /// True if the file is read-only
    pub read_only: bool,
}

/// A concrete deployment of an HTTP endpoint trap.
// TODO: Implement the HttpEndpoint trap kind.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct HttpEndpointRecord {}

/// A concrete deployment of an HTTP payload trap.
// TODO: Implement the HttpPayload trap kind.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct HttpPayloadRecord {}

impl TrapRecord {
    /// The trap type recorded in this record, derived from the populated
    /// kind sub-record.
    pub fn trap_type(&self) -> Option<TrapType> {
        if self.filesystem_honeytoken.is_some() {
            Some(TrapType::FilesystemHoneytoken)
        } else if self.http_endpoint.is_some() {
            Some(TrapType::HttpEndpoint)
        } else if self.http_payload.is_some() {
            Some(TrapType::HttpPayload)
        } else {
            None
        }
    }

    /// True if the records describe the same installed trap, excluding the
    /// timestamps. If `ignore_containers` is true, the container lists are
    /// ignored as well; otherwise they must match exactly (same order).
    pub fn equals(&self, other: &TrapRecord, ignore_containers: bool) -> bool {
        if self.deployment_strategy != other.deployment_strategy {
            return false;
        }

        if !ignore_containers && self.containers != other.containers {
            return false;
        }

        match self.trap_type() {
            Some(TrapType::FilesystemHoneytoken) => {
                self.filesystem_honeytoken == other.filesystem_honeytoken
            }
            Some(TrapType::HttpEndpoint) => self.http_endpoint == other.http_endpoint,
            Some(TrapType::HttpPayload) => self.http_payload == other.http_payload,
            None => false,
        }
    }
}
