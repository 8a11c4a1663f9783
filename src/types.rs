// Copyright Pit Kleyersburg <pitkley@googlemail.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified or distributed
// except according to those terms.

//! The types in this module make up the data model shared by every other module: the validated
//! operator-policy, the composition the engine reads/mutates, and the mirrors of the remote
//! control-plane resources.

use indexmap::{IndexMap, IndexSet};
use serde::Serialize;
use strum_macros::{Display, EnumString};

/// Name of the default tenant used when a service carries no tenant label.
pub const TENANT_DEFAULT: &str = "default";
/// Name of the default network used when a service carries no net attribute or network label.
pub const NETWORK_DEFAULT: &str = "dev";

/// Label key carrying the current user, auto-injected by `AutoGenLabels`.
pub const USER_LABEL: &str = "io.contiv.user";
/// Default label key carrying the tenant name, unless remapped by [`LabelMap`].
pub const TENANT_LABEL: &str = "io.contiv.tenant";
/// Label key carrying a network-name override.
pub const NETWORK_LABEL: &str = "io.contiv.network";
/// Label key auto-injected by `AutoGenLabels`, naming the isolation group (the service itself).
pub const NET_ISOLATION_GROUP_LABEL: &str = "io.contiv.group";
/// Default label key carrying a per-service network-policy override, unless remapped by
/// [`LabelMap`].
pub const NET_ISOLATION_POLICY_LABEL: &str = "io.contiv.policy";

/// Optional remapping of the label keys the engine looks for on services.
///
/// An absent field means "use the corresponding default constant".
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LabelMap {
    /// Remapped key for the tenant label, replacing [`TENANT_LABEL`].
    pub tenant_label_key: Option<String>,
    /// Remapped key for the network-policy label, replacing [`NET_ISOLATION_POLICY_LABEL`].
    pub policy_label_key: Option<String>,
}

/// One operator-defined user's network and network-policy entitlements.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UserPolicy {
    /// OS user name this entry applies to.
    pub user: String,
    /// Tenant used when a composition does not specify one, if any.
    pub default_tenant: Option<String>,
    /// Network used when a composition does not specify one, if any.
    pub default_network: Option<String>,
    /// Network-policy used when a service does not specify one, if any.
    pub default_network_policy: Option<String>,
    /// Networks this user may deploy into. Contains `"all"` to denote the universal set.
    pub allowed_networks: IndexSet<String>,
    /// Network-policies this user may apply. Contains `"all"` to denote the universal set.
    pub allowed_network_policies: IndexSet<String>,
}

impl UserPolicy {
    pub(crate) fn allows_network(&self, network: &str) -> bool {
        self.allowed_networks.contains("all") || self.allowed_networks.contains(network)
    }

    pub(crate) fn allows_network_policy(&self, policy: &str) -> bool {
        self.allowed_network_policies.contains("all")
            || self.allowed_network_policies.contains(policy)
    }
}

/// A single `tcp`/`udp`/`icmp`/`app`/`all` token out of a network-policy's rule list.
///
/// `deny` clauses are rejected while loading the operator policy and never reach this type; every
/// `RuleClause` is implicitly a `permit`.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ProtoPort {
    /// `permit tcp/<port>`.
    Tcp(u16),
    /// `permit udp/<port>`.
    Udp(u16),
    /// `permit icmp`; never carries a port at the rule level.
    Icmp,
    /// `permit app`; resolved against the target image's exposed ports before rule emission.
    App,
    /// `permit all`; short-circuits all other rule emission for the target service.
    All,
}

impl ProtoPort {
    /// `true` for the `all` token, which suppresses per-port rule emission entirely.
    pub fn is_all(self) -> bool {
        matches!(self, ProtoPort::All)
    }

    /// `true` for the `app` token, which must be expanded against image metadata before use.
    pub fn is_app(self) -> bool {
        matches!(self, ProtoPort::App)
    }

    /// The wire protocol name (`tcp`, `udp`, `icmp`), if this token carries one directly.
    ///
    /// Returns `None` for `app`, which has no protocol until expanded.
    pub fn protocol_name(self) -> Option<&'static str> {
        match self {
            ProtoPort::Tcp(_) => Some("tcp"),
            ProtoPort::Udp(_) => Some("udp"),
            ProtoPort::Icmp => Some("icmp"),
            ProtoPort::App => None,
            ProtoPort::All => None,
        }
    }
}

/// The fully validated, queryable operator-policy document.
///
/// Network-policy rule clauses are kept as their raw `"permit tcp/80"`-style strings: the grammar
/// in [`crate::ops::OperatorPolicyStore::get_rules`] is only applied when a policy is actually
/// looked up, matching the original's lazy validation (a malformed rule in a policy nobody
/// references never aborts a deployment).
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct OperatorPolicy {
    /// Label-key remapping.
    pub label_map: LabelMap,
    /// Per-user entitlements, in file order; first match wins.
    pub user_policies: Vec<UserPolicy>,
    /// Named network-policies, in file order, each an ordered list of raw rule-clause strings.
    pub network_policies: IndexMap<String, Vec<String>>,
}

/// The protocol/action direction of a firewall rule.
#[derive(Clone, Copy, Debug, Display, EnumString, Eq, PartialEq, Serialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Traffic entering the endpoint group.
    In,
    /// Traffic leaving the endpoint group.
    Out,
}

/// The verdict of a firewall rule.
#[derive(Clone, Copy, Debug, Display, EnumString, Eq, PartialEq, Serialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Permit the matched traffic.
    Allow,
    /// Drop the matched traffic.
    Deny,
}

/// A tenant: the top-level isolation scope on the control plane.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Tenant {
    /// Tenant name; the sole identity.
    #[serde(rename = "TenantName")]
    pub name: String,
}

/// A layer-3 network scoped to one tenant.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Network {
    /// Network name.
    #[serde(rename = "NetworkName")]
    pub name: String,
    /// Owning tenant.
    pub tenant: String,
}

/// A grouping of endpoint groups that compose one project.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct AppProfile {
    /// App-profile name; equal to the composition's project name.
    #[serde(rename = "AppProfileName")]
    pub name: String,
    /// Owning tenant.
    pub tenant: String,
    /// Owning network.
    pub network: String,
    /// Endpoint-group names, in composition order.
    #[serde(rename = "EndpointGroups")]
    pub epg_list: Vec<String>,
}

/// A set of endpoints that share policy; one per service.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct EndpointGroup {
    /// EPG name, see [`crate::naming::svc_short`].
    #[serde(rename = "GroupName")]
    pub name: String,
    /// Owning tenant.
    pub tenant: String,
    /// Owning network.
    pub network: String,
    /// Names of the policies (in and/or out) attached to this group.
    pub policies: Vec<String>,
    /// Fixed group identity used by the control plane; always `1` for this engine.
    #[serde(rename = "EndpointGroupId")]
    pub group_id: u32,
}

impl EndpointGroup {
    /// Builds an [`EndpointGroup`] with the fixed `group_id = 1` every EPG this engine creates
    /// uses.
    pub fn new(
        name: impl Into<String>,
        tenant: impl Into<String>,
        network: impl Into<String>,
        policies: Vec<String>,
    ) -> Self {
        EndpointGroup {
            name: name.into(),
            tenant: tenant.into(),
            network: network.into(),
            policies,
            group_id: 1,
        }
    }
}

/// A named, ordered list of [`Rule`]s attached to an [`EndpointGroup`] in one direction.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Policy {
    /// Policy name, see [`crate::naming::in_policy`]/[`crate::naming::out_policy`].
    #[serde(rename = "PolicyName")]
    pub name: String,
    /// Owning tenant.
    pub tenant: String,
}

/// A single firewall-style rule within a [`Policy`].
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Rule {
    /// Owning policy name.
    #[serde(rename = "PolicyName")]
    pub policy: String,
    /// Owning tenant.
    pub tenant: String,
    /// Decimal rule identity, unique within `(policy, tenant)`.
    #[serde(rename = "RuleId", serialize_with = "serialize_rule_id")]
    pub rule_id: u32,
    /// Priority; always equal to `rule_id` for this engine.
    pub priority: u32,
    /// `in` or `out`.
    pub direction: Direction,
    /// `allow` or `deny`.
    pub action: Action,
    /// Wire protocol, e.g. `tcp`, `udp`, `icmp`.
    pub protocol: String,
    /// Port number, absent for `icmp` and for deny-all/allow-all rules.
    pub port: Option<u16>,
    /// Source endpoint group, when the rule restricts traffic to one EPG.
    #[serde(rename = "FromEndpointGroup")]
    pub from_epg: Option<String>,
    /// Source network, scoping the rule to the target service's network.
    pub from_network: String,
}

fn serialize_rule_id<S>(rule_id: &u32, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&rule_id.to_string())
}

impl Rule {
    /// Renders [`Rule::rule_id`] as the decimal string the control plane expects.
    ///
    /// The original implementation this engine supersedes encoded the rule ID by adding the
    /// ASCII value of `'0'` to the raw integer, which silently corrupts any ID above 9. This
    /// engine always emits the decimal string instead; see `DESIGN.md` for the rationale.
    pub fn rule_id_str(&self) -> String {
        self.rule_id.to_string()
    }
}

/// One named tier of a composition; maps 1:1 to an [`EndpointGroup`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Service {
    /// Container image reference.
    pub image: String,
    /// Peer service names this service depends on/links to, in declaration order.
    pub links: Vec<String>,
    /// `host:container` published-port strings.
    pub ports: Vec<String>,
    /// Exposed-port strings (container-only, no host mapping).
    pub expose: Vec<String>,
    /// The `net` attribute; rewritten to the fully-qualified form by `AutoGenParams`.
    pub net: String,
    /// Labels attached to the service.
    pub labels: IndexMap<String, String>,
    /// DNS server addresses; filled by `AutoGenParams` when empty.
    pub dns: Vec<String>,
    /// DNS search domains; filled by `AutoGenParams` when empty.
    pub dns_search: Vec<String>,
}

/// A declarative, multi-service application description, handed to this engine by an external
/// composition parser (out of scope for this crate).
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Composition {
    /// Project name; also used as the `AppProfile` name.
    pub project_name: String,
    /// Services, in insertion/declaration order.
    pub services: IndexMap<String, Service>,
}

/// One control-plane mutation, as produced by [`crate::synthesizer::PolicySynthesizer`].
///
/// The engine never applies mutations as a side effect of computing them: synthesis returns a
/// [`Plan`] (an ordered `Vec<Mutation>`), and a separate pass feeds it to a
/// [`crate::control_plane::ControlPlane`] implementation. This keeps synthesis pure and
/// dry-runnable.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Mutation {
    /// Create or update a tenant.
    TenantUp(Tenant),
    /// Create or update a network.
    NetworkUp(Network),
    /// Create or update an endpoint group.
    EndpointGroupUp(EndpointGroup),
    /// Delete an endpoint group, identified by `(tenant, network, name)`.
    EndpointGroupDown {
        /// Owning tenant.
        tenant: String,
        /// Owning network.
        network: String,
        /// EPG name.
        name: String,
    },
    /// Create or update a policy.
    PolicyUp(Policy),
    /// Delete a policy, identified by `(tenant, name)`.
    PolicyDown {
        /// Owning tenant.
        tenant: String,
        /// Policy name.
        name: String,
    },
    /// Create or update a rule.
    RuleUp(Rule),
    /// Create or update an app profile.
    AppProfileUp(AppProfile),
    /// Delete an app profile, identified by `(tenant, network, name)`.
    AppProfileDown {
        /// Owning tenant.
        tenant: String,
        /// Owning network.
        network: String,
        /// App-profile name.
        name: String,
    },
}

/// An ordered sequence of control-plane mutations produced by one synthesis call.
pub type Plan = Vec<Mutation>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_policy_all_matches_anything() {
        let mut allowed = IndexSet::new();
        allowed.insert("all".to_owned());
        let user = UserPolicy {
            user: "vagrant".to_owned(),
            default_tenant: None,
            default_network: None,
            default_network_policy: None,
            allowed_networks: allowed,
            allowed_network_policies: IndexSet::new(),
        };
        assert!(user.allows_network("production"));
        assert!(!user.allows_network_policy("anything"));
    }

    #[test]
    fn rule_id_str_is_decimal_not_ascii_offset() {
        let rule = Rule {
            policy: "shop_web-in".to_owned(),
            tenant: TENANT_DEFAULT.to_owned(),
            rule_id: 12,
            priority: 12,
            direction: Direction::In,
            action: Action::Allow,
            protocol: "tcp".to_owned(),
            port: Some(80),
            from_epg: None,
            from_network: NETWORK_DEFAULT.to_owned(),
        };
        assert_eq!(rule.rule_id_str(), "12");
    }

    #[test]
    fn proto_port_classifies_all_and_app() {
        assert!(ProtoPort::All.is_all());
        assert!(ProtoPort::App.is_app());
        assert!(!ProtoPort::Tcp(80).is_all());
        assert_eq!(ProtoPort::Tcp(80).protocol_name(), Some("tcp"));
        assert_eq!(ProtoPort::App.protocol_name(), None);
    }
}
