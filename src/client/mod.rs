//! Typed access to the cluster: Waybills, Secrets, events and
//! prunable-resource discovery.
//!
//! The [`ClusterClient`] trait is the seam between the scheduler/runner and
//! the apiserver; the runner additionally derives a delegate-scoped client
//! from it so that prunable-resource discovery reflects the delegate's
//! rights rather than the applier's own.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::authorization::v1::{
    ResourceRule, SelfSubjectRulesReview, SelfSubjectRulesReviewSpec,
};
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, ListParams, PostParams};
use kube::discovery::{verbs, Discovery, Scope};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Config, Resource};
use secrecy::SecretString;
use tracing::warn;

#[cfg(test)]
use mockall::automock;

use crate::crd::Waybill;
use crate::Error;

/// Component name recorded as the source of emitted events
pub const EVENT_SOURCE_COMPONENT: &str = "kube-applier";

/// Typed cluster operations used by the scheduler and the runner
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// List all Waybills, keeping at most one per namespace.
    ///
    /// When a namespace carries more than one Waybill, the lexicographically
    /// first name wins and each rejected Waybill receives a Warning event
    /// naming the chosen one.
    async fn list_waybills(&self) -> Result<Vec<Waybill>, Error>;

    /// Fetch a single Waybill
    async fn get_waybill(&self, namespace: &str, name: &str) -> Result<Waybill, Error>;

    /// Persist the status subresource of the given Waybill
    async fn update_waybill_status(&self, waybill: &Waybill) -> Result<(), Error>;

    /// Fetch a Secret
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, Error>;

    /// Compute the (cluster-scoped, namespaced) lists of group/version/Kind
    /// strings that the client's identity may prune in the given namespace.
    /// Both lists are sorted lexicographically.
    async fn prunable_resource_gvks(
        &self,
        namespace: &str,
    ) -> Result<(Vec<String>, Vec<String>), Error>;

    /// Emit an event on the given Waybill. Emission failures are logged,
    /// never propagated.
    async fn emit_waybill_event(
        &self,
        waybill: &Waybill,
        type_: EventType,
        reason: &str,
        message: &str,
    );

    /// Derive a client whose identity is the given bearer token
    async fn delegate(&self, token: &str) -> Result<Arc<dyn ClusterClient>, Error>;
}

/// [`ClusterClient`] backed by the kube client
pub struct KubeClusterClient {
    client: Client,
    config: Config,
    reporter: Reporter,
}

impl KubeClusterClient {
    /// Build a client from the given kube configuration
    pub fn new(config: Config) -> Result<Self, Error> {
        let client = Client::try_from(config.clone())?;
        Ok(Self {
            client,
            config,
            reporter: Reporter {
                controller: EVENT_SOURCE_COMPONENT.into(),
                instance: None,
            },
        })
    }

    /// Build a client from the inferred (in-cluster or kubeconfig)
    /// configuration
    pub async fn try_default() -> Result<Self, Error> {
        let config = Config::infer()
            .await
            .map_err(|e| Error::config(format!("failed to infer kube config: {}", e)))?;
        Self::new(config)
    }

    fn waybills(&self) -> Api<Waybill> {
        Api::all(self.client.clone())
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn list_waybills(&self) -> Result<Vec<Waybill>, Error> {
        let list = self.waybills().list(&ListParams::default()).await?;
        let (kept, rejected) = dedupe_waybills(list.items);
        for (waybill, chosen_id) in &rejected {
            self.emit_waybill_event(
                waybill,
                EventType::Warning,
                "MultipleWaybillsFound",
                &format!(
                    "only one Waybill per namespace is applied, this namespace is managed by \"{}\"",
                    chosen_id
                ),
            )
            .await;
        }
        Ok(kept)
    }

    async fn get_waybill(&self, namespace: &str, name: &str) -> Result<Waybill, Error> {
        let api: Api<Waybill> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    async fn update_waybill_status(&self, waybill: &Waybill) -> Result<(), Error> {
        let api: Api<Waybill> = Api::namespaced(self.client.clone(), waybill.namespace());
        api.replace_status(
            waybill.name(),
            &PostParams::default(),
            serde_json::to_vec(waybill)
                .map_err(|e| Error::serialization(e.to_string()))?,
        )
        .await?;
        Ok(())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    async fn prunable_resource_gvks(
        &self,
        namespace: &str,
    ) -> Result<(Vec<String>, Vec<String>), Error> {
        let review = SelfSubjectRulesReview {
            spec: SelfSubjectRulesReviewSpec {
                namespace: Some(namespace.to_string()),
            },
            ..Default::default()
        };
        let api: Api<SelfSubjectRulesReview> = Api::all(self.client.clone());
        let response = api.create(&PostParams::default(), &review).await?;
        let rules = response
            .status
            .map(|s| s.resource_rules)
            .unwrap_or_default();

        let discovery = Discovery::new(self.client.clone()).run().await?;
        let mut cluster = BTreeSet::new();
        let mut namespaced = BTreeSet::new();
        for group in discovery.groups() {
            for (resource, caps) in group.recommended_resources() {
                if !caps.supports_operation(verbs::DELETE) {
                    continue;
                }
                if !rules_allow_prune(&rules, &resource.group, &resource.plural) {
                    continue;
                }
                let gvk = gvk_string(&resource.group, &resource.version, &resource.kind);
                match caps.scope {
                    Scope::Cluster => cluster.insert(gvk),
                    Scope::Namespaced => namespaced.insert(gvk),
                };
            }
        }
        Ok((
            cluster.into_iter().collect(),
            namespaced.into_iter().collect(),
        ))
    }

    async fn emit_waybill_event(
        &self,
        waybill: &Waybill,
        type_: EventType,
        reason: &str,
        message: &str,
    ) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone());
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(message.to_string()),
            action: reason.to_string(),
            secondary: None,
        };
        if let Err(e) = recorder.publish(&event, &waybill.object_ref(&())).await {
            warn!(waybill = %waybill.id(), reason, error = %e, "failed to emit event");
        }
    }

    async fn delegate(&self, token: &str) -> Result<Arc<dyn ClusterClient>, Error> {
        let mut config = self.config.clone();
        config.auth_info.token = Some(SecretString::from(token.to_string()));
        config.auth_info.token_file = None;
        Ok(Arc::new(Self::new(config)?))
    }
}

/// Keep one Waybill per namespace, preferring the lexicographically first
/// name, and report the rejected ones together with the chosen Waybill's id
fn dedupe_waybills(mut waybills: Vec<Waybill>) -> (Vec<Waybill>, Vec<(Waybill, String)>) {
    waybills.sort_by(|a, b| {
        a.namespace()
            .cmp(b.namespace())
            .then_with(|| a.name().cmp(b.name()))
    });
    let mut kept: Vec<Waybill> = Vec::new();
    let mut rejected = Vec::new();
    for wb in waybills {
        match kept.last() {
            Some(prev) if prev.namespace() == wb.namespace() => {
                let chosen = prev.id();
                rejected.push((wb, chosen));
            }
            _ => kept.push(wb),
        }
    }
    (kept, rejected)
}

/// Render `group/version/Kind`, with the core group spelled `core`
fn gvk_string(group: &str, version: &str, kind: &str) -> String {
    let group = if group.is_empty() { "core" } else { group };
    format!("{}/{}/{}", group, version, kind)
}

/// Whether the given rules grant get, list and delete on a resource without
/// restricting it to named objects.
///
/// Resources only reachable through resourceNames cannot be pruned, since
/// pruning addresses objects by label selection rather than by name.
fn rules_allow_prune(rules: &[ResourceRule], group: &str, plural: &str) -> bool {
    ["get", "list", "delete"]
        .iter()
        .all(|verb| rules.iter().any(|r| rule_covers(r, group, plural, verb)))
}

fn rule_covers(rule: &ResourceRule, group: &str, plural: &str, verb: &str) -> bool {
    if rule
        .resource_names
        .as_ref()
        .is_some_and(|names| !names.is_empty())
    {
        return false;
    }
    let group_matches = rule
        .api_groups
        .as_ref()
        .is_some_and(|groups| groups.iter().any(|g| g == "*" || g == group));
    let resource_matches = rule
        .resources
        .as_ref()
        .is_some_and(|resources| resources.iter().any(|r| r == "*" || r == plural));
    let verb_matches = rule.verbs.iter().any(|v| v == "*" || v == verb);
    group_matches && resource_matches && verb_matches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::WaybillSpec;
    use kube::core::ObjectMeta;

    fn waybill(namespace: &str, name: &str) -> Waybill {
        Waybill {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: WaybillSpec::default(),
            status: None,
        }
    }

    fn rule(groups: &[&str], resources: &[&str], verbs: &[&str]) -> ResourceRule {
        ResourceRule {
            api_groups: Some(groups.iter().map(|s| s.to_string()).collect()),
            resource_names: None,
            resources: Some(resources.iter().map(|s| s.to_string()).collect()),
            verbs: verbs.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn dedupe_keeps_the_lexicographically_first_name_per_namespace() {
        let (kept, rejected) = dedupe_waybills(vec![
            waybill("ns-0", "beta"),
            waybill("ns-1", "foo"),
            waybill("ns-0", "alpha"),
        ]);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].id(), "ns-0/alpha");
        assert_eq!(kept[1].id(), "ns-1/foo");
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].0.id(), "ns-0/beta");
        assert_eq!(rejected[0].1, "ns-0/alpha");
    }

    #[test]
    fn dedupe_passes_single_waybills_through() {
        let (kept, rejected) = dedupe_waybills(vec![waybill("ns-0", "main")]);
        assert_eq!(kept.len(), 1);
        assert!(rejected.is_empty());
    }

    #[test]
    fn core_group_renders_as_core() {
        assert_eq!(gvk_string("", "v1", "Pod"), "core/v1/Pod");
        assert_eq!(
            gvk_string("apps", "v1", "Deployment"),
            "apps/v1/Deployment"
        );
    }

    #[test]
    fn wildcard_rules_grant_pruning() {
        let rules = vec![rule(&[""], &["pods"], &["*"])];
        assert!(rules_allow_prune(&rules, "", "pods"));
        assert!(!rules_allow_prune(&rules, "apps", "deployments"));
    }

    #[test]
    fn all_three_verbs_are_required_for_pruning() {
        let rules = vec![rule(&[""], &["serviceaccounts"], &["delete"])];
        assert!(!rules_allow_prune(&rules, "", "serviceaccounts"));

        let rules = vec![rule(
            &["storage.k8s.io"],
            &["storageclasses"],
            &["get", "list", "delete"],
        )];
        assert!(rules_allow_prune(&rules, "storage.k8s.io", "storageclasses"));
    }

    #[test]
    fn verbs_can_be_granted_across_multiple_rules() {
        let rules = vec![
            rule(&["apps"], &["deployments"], &["get", "list"]),
            rule(&["apps"], &["deployments"], &["delete"]),
        ];
        assert!(rules_allow_prune(&rules, "apps", "deployments"));
    }

    #[test]
    fn name_restricted_rules_do_not_grant_pruning() {
        let mut restricted = rule(&[""], &["validatingwebhookconfigurations"], &["*"]);
        restricted.resource_names = Some(vec!["foobar".to_string()]);
        assert!(!rules_allow_prune(
            &[restricted],
            "",
            "validatingwebhookconfigurations"
        ));
    }
}
