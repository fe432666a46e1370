//! Trap specification types
//!
//! A trap describes one cyber deception technique: what the decoy looks
//! like, how it is deployed, how access to it is captured, and which
//! workloads it applies to.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::Error;

/// TrapType identifies the kind of a trap and can be used like an enum tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrapType {
    /// A filesystem honeytoken trap
    FilesystemHoneytoken,
    /// An HTTP endpoint trap (reserved)
    HttpEndpoint,
    /// An HTTP payload trap (reserved)
    HttpPayload,
}

impl std::fmt::Display for TrapType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FilesystemHoneytoken => write!(f, "FilesystemHoneytoken"),
            Self::HttpEndpoint => write!(f, "HttpEndpoint"),
            Self::HttpPayload => write!(f, "HttpPayload"),
        }
    }
}

/// Trap describes a cyber deception technique, also simply known as a trap.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Trap {
    /// The kind-specific trap configuration. Exactly one kind is populated;
    /// the tag is the field name in the serialized form (e.g.,
    /// `filesystemHoneytoken`).
    #[serde(flatten)]
    pub kind: TrapKind,

    /// DecoyDeployment configures how decoys (the entities that are
    /// attacked) are going to be deployed.
    #[serde(default)]
    pub decoy_deployment: DecoyDeployment,

    /// CaptorDeployment configures how captors (the entities that monitor
    /// access to the decoys) are going to be deployed.
    #[serde(default)]
    pub captor_deployment: CaptorDeployment,

    /// Match defines what Kubernetes resources to apply this trap to.
    /// Matching criteria are resource labels and/or namespaces.
    #[serde(rename = "match", default)]
    pub match_resources: MatchResources,
}

/// The kind-specific part of a trap, tagged by the populated field.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum TrapKind {
    /// Configuration for a filesystem honeytoken trap
    FilesystemHoneytoken(FilesystemHoneytoken),
    /// Configuration for an HTTP endpoint trap (reserved)
    HttpEndpoint(HttpEndpoint),
    /// Configuration for an HTTP payload trap (reserved)
    HttpPayload(HttpPayload),
}

impl Trap {
    /// Returns the type of this trap.
    pub fn trap_type(&self) -> TrapType {
        match &self.kind {
            TrapKind::FilesystemHoneytoken(_) => TrapType::FilesystemHoneytoken,
            TrapKind::HttpEndpoint(_) => TrapType::HttpEndpoint,
            TrapKind::HttpPayload(_) => TrapType::HttpPayload,
        }
    }

    /// Returns the filesystem honeytoken configuration, if this is one.
    pub fn filesystem_honeytoken(&self) -> Option<&FilesystemHoneytoken> {
        match &self.kind {
            TrapKind::FilesystemHoneytoken(token) => Some(token),
            _ => None,
        }
    }

    /// Checks if the trap specification is valid.
    ///
    /// The match criteria must include at least one resource filter, and
    /// each filter must set at least one of namespaces or selector labels.
    /// The kind-specific configuration is validated as well.
    pub fn is_valid(&self) -> Result<(), Error> {
        if self.match_resources.any.is_empty() {
            return Err(Error::validation("match.any must not be empty"));
        }

        for filter in &self.match_resources.any {
            let has_namespaces = !filter.namespaces.is_empty();
            let has_labels = filter
                .selector
                .as_ref()
                .and_then(|s| s.match_labels.as_ref())
                .is_some_and(|labels| !labels.is_empty());

            if !has_namespaces && !has_labels {
                return Err(Error::validation(
                    "a resource filter must set at least one of namespaces or selector labels",
                ));
            }
        }

        match &self.kind {
            TrapKind::FilesystemHoneytoken(token) => token.is_valid(),
            TrapKind::HttpEndpoint(endpoint) => endpoint.is_valid(),
            TrapKind::HttpPayload(payload) => payload.is_valid(),
        }
    }
}

/// FilesystemHoneytoken defines the configuration for a filesystem
/// honeytoken trap.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FilesystemHoneytoken {
    /// FilePath is the absolute path of the file to be created.
    pub file_path: String,

    /// FileContent is the content of the file to be created.
    #[serde(default)]
    pub file_content: String,

    /// ReadOnly is a flag to make the file read-only.
    #[serde(default = "default_true")]
    pub read_only: bool,
}

impl FilesystemHoneytoken {
    /// Checks if the filesystem honeytoken trap is valid.
    ///
    /// The file path must be absolute and must name a file, not a directory.
    pub fn is_valid(&self) -> Result<(), Error> {
        if !self.file_path.starts_with('/') {
            return Err(Error::validation(format!(
                "filePath is not absolute: '{}'",
                self.file_path
            )));
        }

        if self.file_name().is_empty() {
            return Err(Error::validation(format!(
                "filePath must point to a file: '{}'",
                self.file_path
            )));
        }

        Ok(())
    }

    /// The filename component of the file path (everything after the last
    /// slash).
    pub fn file_name(&self) -> &str {
        match self.file_path.rsplit_once('/') {
            Some((_, name)) => name,
            None => &self.file_path,
        }
    }

    /// The directory component of the file path (everything up to the last
    /// slash).
    pub fn directory(&self) -> &str {
        match self.file_path.rsplit_once('/') {
            Some((dir, _)) => dir,
            None => "",
        }
    }
}

/// HttpEndpoint is the configuration for an HTTP endpoint trap.
// TODO: Implement the HttpEndpoint trap kind.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpEndpoint {}

impl HttpEndpoint {
    /// Checks if the HTTP endpoint trap is valid.
    pub fn is_valid(&self) -> Result<(), Error> {
        Err(Error::not_implemented("HttpEndpoint traps"))
    }
}

/// HttpPayload is the configuration for an HTTP payload trap.
// TODO: Implement the HttpPayload trap kind.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpPayload {}

impl HttpPayload {
    /// Checks if the HTTP payload trap is valid.
    pub fn is_valid(&self) -> Result<(), Error> {
        Err(Error::not_implemented("HttpPayload traps"))
    }
}

/// DecoyDeployment configures how the decoy (the entity that is attacked)
/// is deployed.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DecoyDeployment {
    /// Strategy is the technical method to deploy the decoy.
    #[serde(default)]
    pub strategy: DecoyStrategy,
}

/// The technical method used to place a decoy inside a workload.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum DecoyStrategy {
    /// Mount a secret-backed volume into a deployment's pod template
    #[default]
    VolumeMount,
    /// Exec into the running containers of a pod and write the file
    ContainerExec,
    /// Inject via a Kyverno mutation policy (reserved)
    KyvernoPolicy,
}

impl std::fmt::Display for DecoyStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::VolumeMount => write!(f, "volumeMount"),
            Self::ContainerExec => write!(f, "containerExec"),
            Self::KyvernoPolicy => write!(f, "kyvernoPolicy"),
        }
    }
}

/// CaptorDeployment configures how the captor (the entity that monitors
/// access to the decoy) is deployed.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CaptorDeployment {
    /// Strategy is the technical method to deploy the captor.
    #[serde(default)]
    pub strategy: CaptorStrategy,
}

/// The technical method used to observe access to a decoy.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CaptorStrategy {
    /// Kernel-probe tracing policies handled by the Tetragon operator
    #[default]
    Tetragon,
}

impl std::fmt::Display for CaptorStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tetragon => write!(f, "tetragon"),
        }
    }
}

/// MatchResources specifies resource matching criteria for a trap.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MatchResources {
    /// Any is a list of resource filters, combined with a logical OR.
    #[serde(default)]
    pub any: Vec<ResourceFilter>,
}

/// ResourceFilter selects resources by namespace and/or labels, combined
/// with a logical AND when both are set.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceFilter {
    /// Namespaces is a list of namespace names. It does not support
    /// wildcards.
    #[serde(default)]
    pub namespaces: Vec<String>,

    /// Selector is a label selector. It does not support wildcards.
    /// Only matchLabels are honored; matchExpressions are ignored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,

    /// ContainerSelector filters the containers to inject the trap into.
    /// Shell-glob wildcards are supported; `""` and `"*"` select all
    /// containers.
    #[serde(default = "default_container_selector")]
    pub container_selector: String,
}

impl ResourceFilter {
    /// The selector's matchLabels, if any are set.
    pub fn match_labels(&self) -> Option<&std::collections::BTreeMap<String, String>> {
        self.selector
            .as_ref()
            .and_then(|s| s.match_labels.as_ref())
            .filter(|labels| !labels.is_empty())
    }
}

fn default_true() -> bool {
    true
}

fn default_container_selector() -> String {
    "*".to_string()
}
