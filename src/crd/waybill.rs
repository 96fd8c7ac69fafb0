//! Waybill resource types
//!
//! A Waybill defines the reconciliation policy for a single namespace. At
//! most one Waybill per namespace is honoured; the cluster client rejects
//! extras during listing.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Default run interval, in seconds, when the spec leaves it unset
const DEFAULT_RUN_INTERVAL: i64 = 3600;

fn default_delegate_secret_ref() -> String {
    "kube-applier-delegate".to_string()
}

/// Reference to a Secret, optionally in another namespace
///
/// Cross-namespace references are only honoured when the target Secret
/// allows the Waybill's namespace through its allowed-namespaces annotation.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    /// Name of the referenced Secret
    pub name: String,

    /// Namespace of the referenced Secret; defaults to the Waybill's own
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Specification for a Waybill
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kube-applier.io",
    version = "v1alpha1",
    kind = "Waybill",
    plural = "waybills",
    shortname = "wb",
    status = "WaybillStatus",
    namespaced,
    printcolumn = r#"{"name":"Success","type":"boolean","jsonPath":".status.lastRun.success"}"#,
    printcolumn = r#"{"name":"Commit","type":"string","jsonPath":".status.lastRun.commit"}"#,
    printcolumn = r#"{"name":"Last Applied","type":"date","jsonPath":".status.lastRun.finished"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct WaybillSpec {
    /// When false, only forced runs are applied for this namespace.
    /// Unset means true.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_apply: Option<bool>,

    /// Name of a service-account-token Secret in the Waybill's namespace
    /// whose bearer token is used for the apply and for prunable-resource
    /// discovery
    #[serde(default = "default_delegate_secret_ref")]
    pub delegate_service_account_secret_ref: String,

    /// Request server-side dry-run for this namespace
    #[serde(default)]
    pub dry_run: bool,

    /// Secret holding SSH keys used to clone remote bases referenced from
    /// the repository subtree
    #[serde(
        default,
        rename = "gitSSHSecretRef",
        skip_serializing_if = "Option::is_none"
    )]
    pub git_ssh_secret_ref: Option<ObjectReference>,

    /// Prune resources that are no longer present in the repository.
    /// Unset means true.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prune: Option<bool>,

    /// Also prune cluster-scoped resources
    #[serde(default)]
    pub prune_cluster_resources: bool,

    /// Resource kinds (group/version/Kind) excluded from pruning for this
    /// namespace, on top of the process-wide blacklist
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prune_blacklist: Vec<String>,

    /// Subtree of the working tree to apply; defaults to the namespace name
    #[serde(default)]
    pub repository_path: String,

    /// Seconds between scheduled runs; zero means 3600
    #[serde(default)]
    pub run_interval: i64,

    /// Seconds before a run is cancelled; zero is rejected as
    /// misconfiguration
    #[serde(default)]
    pub run_timeout: i64,

    /// Use server-side apply
    #[serde(default)]
    pub server_side_apply: bool,

    /// Secret holding a strongbox keyring or identity used to decrypt files
    /// in the subtree
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strongbox_keyring_secret_ref: Option<ObjectReference>,
}

/// Status for a Waybill
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WaybillStatus {
    /// Result of the last apply run for this Waybill
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<WaybillStatusRun>,
}

/// Outcome of a single apply run
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WaybillStatusRun {
    /// The command that was invoked, with credentials redacted
    #[serde(default)]
    pub command: String,

    /// Head commit of the subtree that was applied
    #[serde(default)]
    pub commit: String,

    /// Error message when the run failed
    #[serde(default)]
    pub error_message: String,

    /// When the run finished
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished: Option<Time>,

    /// Captured output of the apply pipeline
    #[serde(default)]
    pub output: String,

    /// When the run started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<Time>,

    /// Whether the run succeeded
    #[serde(default)]
    pub success: bool,

    /// The request kind that triggered the run
    #[serde(default, rename = "type")]
    pub type_: String,
}

impl Waybill {
    /// "namespace/name" identifier used in logs and events
    pub fn id(&self) -> String {
        format!(
            "{}/{}",
            self.metadata.namespace.as_deref().unwrap_or_default(),
            self.metadata.name.as_deref().unwrap_or_default()
        )
    }

    /// The Waybill's namespace; Waybills are namespaced so this is always
    /// present on server-provided objects
    pub fn namespace(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or_default()
    }

    /// The Waybill's name
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    /// Whether non-forced runs are applied for this Waybill
    pub fn auto_apply(&self) -> bool {
        self.spec.auto_apply.unwrap_or(true)
    }

    /// Whether pruning is enabled for this Waybill
    pub fn prune(&self) -> bool {
        self.spec.prune.unwrap_or(true)
    }

    /// The subtree to apply, falling back to the namespace name
    pub fn repository_path(&self) -> &str {
        if self.spec.repository_path.is_empty() {
            self.namespace()
        } else {
            &self.spec.repository_path
        }
    }

    /// Seconds between scheduled runs, with the default applied
    pub fn run_interval(&self) -> i64 {
        if self.spec.run_interval <= 0 {
            DEFAULT_RUN_INTERVAL
        } else {
            self.spec.run_interval
        }
    }
}
