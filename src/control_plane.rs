// Copyright Pit Kleyersburg <pitkley@googlemail.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified or distributed
// except according to those terms.

//! A typed wrapper over the control plane's REST surface, plus the trait ([`ControlPlane`]) that
//! lets [`crate::synthesizer::PolicySynthesizer`]'s output be applied against either the real
//! netmaster-like server or an in-memory fake for tests.

use crate::errors::{ErrorKind, Result};
use crate::types::{AppProfile, EndpointGroup, Mutation, Plan, Policy, Rule, Tenant, Network};
use serde::Serialize;
use slog::{debug, error, o, Logger};
use std::collections::HashSet;

/// Idempotent create-or-update/delete operations against the control plane's resource set.
///
/// Every `*_post` call must be equivalent to an update when the resource already exists. Delete
/// calls on resources that no longer exist are expected and must not be treated as failures by
/// callers applying a delete [`Plan`] (see [`apply_plan`]).
pub trait ControlPlane {
    /// Creates or updates a tenant.
    fn tenant_post(&self, tenant: &Tenant) -> Result<()>;
    /// Creates or updates a network.
    fn network_post(&self, network: &Network) -> Result<()>;
    /// Creates or updates an app profile.
    fn app_profile_post(&self, app_profile: &AppProfile) -> Result<()>;
    /// Deletes an app profile.
    fn app_profile_delete(&self, tenant: &str, network: &str, name: &str) -> Result<()>;
    /// Creates or updates an endpoint group.
    fn endpoint_group_post(&self, epg: &EndpointGroup) -> Result<()>;
    /// Deletes an endpoint group.
    fn endpoint_group_delete(&self, tenant: &str, network: &str, name: &str) -> Result<()>;
    /// Creates or updates a policy.
    fn policy_post(&self, policy: &Policy) -> Result<()>;
    /// Deletes a policy, cascading to every rule filed under it. The engine never deletes a
    /// rule on its own; a policy and its rules share one lifetime.
    fn policy_delete(&self, tenant: &str, name: &str) -> Result<()>;
    /// Creates or updates a rule.
    fn rule_post(&self, rule: &Rule) -> Result<()>;
}

/// Applies `plan` against `control_plane`, in order.
///
/// Create mutations (`*Up`) are fatal on the first failure, matching §7's "fatal on create"
/// semantics. Delete mutations (`*Down`) consult [`ErrorKind::is_tolerable`]: a `ControlPlane`
/// failure (the only kind these calls can produce, e.g. "not found") is logged and continued
/// past, matching "best-effort on delete" so a `stop` invocation tears down whatever it can and
/// moves on; anything that isn't tolerable is still propagated rather than silently swallowed.
pub fn apply_plan(control_plane: &dyn ControlPlane, plan: &Plan, logger: &Logger) -> Result<()> {
    for mutation in plan {
        match mutation {
            Mutation::TenantUp(tenant) => control_plane.tenant_post(tenant)?,
            Mutation::NetworkUp(network) => control_plane.network_post(network)?,
            Mutation::EndpointGroupUp(epg) => control_plane.endpoint_group_post(epg)?,
            Mutation::PolicyUp(policy) => control_plane.policy_post(policy)?,
            Mutation::RuleUp(rule) => control_plane.rule_post(rule)?,
            Mutation::AppProfileUp(app_profile) => control_plane.app_profile_post(app_profile)?,
            Mutation::EndpointGroupDown {
                tenant,
                network,
                name,
            } => tolerate(
                control_plane.endpoint_group_delete(tenant, network, name),
                "endpoint-group",
                name,
                logger,
            )?,
            Mutation::PolicyDown { tenant, name } => tolerate(
                control_plane.policy_delete(tenant, name),
                "policy",
                name,
                logger,
            )?,
            Mutation::AppProfileDown {
                tenant,
                network,
                name,
            } => tolerate(
                control_plane.app_profile_delete(tenant, network, name),
                "app-profile",
                name,
                logger,
            )?,
        }
    }

    Ok(())
}

/// Logs and swallows `result` when its error is [`ErrorKind::is_tolerable`]; re-raises anything
/// else, so a delete pass never masks a failure class the engine hasn't decided to tolerate.
fn tolerate(result: Result<()>, kind: &str, name: &str, logger: &Logger) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind().is_tolerable() => {
            debug!(logger, "ignoring delete failure";
                   o!("kind" => kind.to_owned(), "name" => name.to_owned(),
                      "error" => format!("{}", e)));
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// A blocking JSON REST client talking to a netmaster-like control plane at `base_url`.
pub struct HttpControlPlaneClient {
    base_url: url::Url,
    http: reqwest::blocking::Client,
    logger: Logger,
}

impl HttpControlPlaneClient {
    /// Builds a client targeting `base_url`, e.g. `http://netmaster:9999`.
    pub fn new(base_url: url::Url, logger: Logger) -> HttpControlPlaneClient {
        HttpControlPlaneClient {
            base_url,
            http: reqwest::blocking::Client::new(),
            logger,
        }
    }

    fn post<T: Serialize + ?Sized>(&self, object: &str, path: &str, body: &T) -> Result<()> {
        debug!(self.logger, "posting to control plane"; o!("path" => path.to_owned()));
        let url = self.base_url.join(path).map_err(|e| {
            ErrorKind::ControlPlane {
                object: object.to_owned(),
                detail: format!("invalid URL path '{}': {}", path, e),
            }
        })?;
        let response = self.http.post(url).json(body).send().map_err(|e| {
            ErrorKind::ControlPlane {
                object: object.to_owned(),
                detail: e.to_string(),
            }
        })?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            error!(self.logger, "control plane rejected POST";
                   o!("object" => object.to_owned(), "status" => status.as_u16() as i64));
            return Err(ErrorKind::ControlPlane {
                object: object.to_owned(),
                detail: format!("{}: {}", status, body),
            }
            .into());
        }
        Ok(())
    }

    fn delete(&self, object: &str, path: &str) -> Result<()> {
        debug!(self.logger, "deleting from control plane"; o!("path" => path.to_owned()));
        let url = self.base_url.join(path).map_err(|e| {
            ErrorKind::ControlPlane {
                object: object.to_owned(),
                detail: format!("invalid URL path '{}': {}", path, e),
            }
        })?;
        let response = self.http.delete(url).send().map_err(|e| {
            ErrorKind::ControlPlane {
                object: object.to_owned(),
                detail: e.to_string(),
            }
        })?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            return Err(ErrorKind::ControlPlane {
                object: object.to_owned(),
                detail: format!("{}: {}", status, body),
            }
            .into());
        }
        Ok(())
    }
}

impl ControlPlane for HttpControlPlaneClient {
    fn tenant_post(&self, tenant: &Tenant) -> Result<()> {
        self.post(
            &format!("tenant '{}'", tenant.name),
            &format!("api/v1/tenants/{}/", tenant.name),
            tenant,
        )
    }

    fn network_post(&self, network: &Network) -> Result<()> {
        self.post(
            &format!("network '{}'", network.name),
            &format!(
                "api/v1/networks/{}:{}/",
                network.tenant, network.name
            ),
            network,
        )
    }

    fn app_profile_post(&self, app_profile: &AppProfile) -> Result<()> {
        self.post(
            &format!("app profile '{}'", app_profile.name),
            &format!(
                "api/v1/appProfiles/{}:{}:{}/",
                app_profile.tenant, app_profile.network, app_profile.name
            ),
            app_profile,
        )
    }

    fn app_profile_delete(&self, tenant: &str, network: &str, name: &str) -> Result<()> {
        self.delete(
            &format!("app profile '{}'", name),
            &format!("api/v1/appProfiles/{}:{}:{}/", tenant, network, name),
        )
    }

    fn endpoint_group_post(&self, epg: &EndpointGroup) -> Result<()> {
        self.post(
            &format!("endpoint group '{}'", epg.name),
            &format!(
                "api/v1/endpointGroups/{}:{}:{}/",
                epg.tenant, epg.network, epg.name
            ),
            epg,
        )
    }

    fn endpoint_group_delete(&self, tenant: &str, network: &str, name: &str) -> Result<()> {
        self.delete(
            &format!("endpoint group '{}'", name),
            &format!("api/v1/endpointGroups/{}:{}:{}/", tenant, network, name),
        )
    }

    fn policy_post(&self, policy: &Policy) -> Result<()> {
        self.post(
            &format!("policy '{}'", policy.name),
            &format!("api/v1/policys/{}:{}/", policy.tenant, policy.name),
            policy,
        )
    }

    fn policy_delete(&self, tenant: &str, name: &str) -> Result<()> {
        self.delete(
            &format!("policy '{}'", name),
            &format!("api/v1/policys/{}:{}/", tenant, name),
        )
    }

    fn rule_post(&self, rule: &Rule) -> Result<()> {
        self.post(
            &format!("rule '{}/{}'", rule.policy, rule.rule_id_str()),
            &format!(
                "api/v1/rules/{}:{}:{}/",
                rule.tenant,
                rule.policy,
                rule.rule_id_str()
            ),
            rule,
        )
    }
}

/// An in-memory [`ControlPlane`] used by tests: tracks the set of live object identities instead
/// of talking to a real server.
///
/// Identities are tuples of `(kind, tenant, network-or-empty, name-or-rule-id)`, enough to
/// distinguish every resource the engine creates. [`FakeControlPlaneClient::live_objects`] is
/// what §8's property P7 (a start+stop cycle leaves no orphans) asserts against.
#[derive(Default)]
pub struct FakeControlPlaneClient {
    live: std::cell::RefCell<HashSet<String>>,
}

impl FakeControlPlaneClient {
    /// Builds an empty fake.
    pub fn new() -> Self {
        FakeControlPlaneClient::default()
    }

    /// The set of identities currently considered live, for test assertions.
    pub fn live_objects(&self) -> HashSet<String> {
        self.live.borrow().clone()
    }

    fn insert(&self, key: String) {
        self.live.borrow_mut().insert(key);
    }

    fn remove(&self, key: &str) {
        self.live.borrow_mut().remove(key);
    }
}

impl ControlPlane for FakeControlPlaneClient {
    fn tenant_post(&self, tenant: &Tenant) -> Result<()> {
        self.insert(format!("tenant:{}", tenant.name));
        Ok(())
    }

    fn network_post(&self, network: &Network) -> Result<()> {
        self.insert(format!("network:{}:{}", network.tenant, network.name));
        Ok(())
    }

    fn app_profile_post(&self, app_profile: &AppProfile) -> Result<()> {
        self.insert(format!(
            "appprofile:{}:{}:{}",
            app_profile.tenant, app_profile.network, app_profile.name
        ));
        Ok(())
    }

    fn app_profile_delete(&self, tenant: &str, network: &str, name: &str) -> Result<()> {
        let key = format!("appprofile:{}:{}:{}", tenant, network, name);
        if !self.live.borrow().contains(&key) {
            return Err(ErrorKind::ControlPlane {
                object: format!("app profile '{}'", name),
                detail: "not found".to_owned(),
            }
            .into());
        }
        self.remove(&key);
        Ok(())
    }

    fn endpoint_group_post(&self, epg: &EndpointGroup) -> Result<()> {
        self.insert(format!("epg:{}:{}:{}", epg.tenant, epg.network, epg.name));
        Ok(())
    }

    fn endpoint_group_delete(&self, tenant: &str, network: &str, name: &str) -> Result<()> {
        let key = format!("epg:{}:{}:{}", tenant, network, name);
        if !self.live.borrow().contains(&key) {
            return Err(ErrorKind::ControlPlane {
                object: format!("endpoint group '{}'", name),
                detail: "not found".to_owned(),
            }
            .into());
        }
        self.remove(&key);
        Ok(())
    }

    fn policy_post(&self, policy: &Policy) -> Result<()> {
        self.insert(format!("policy:{}:{}", policy.tenant, policy.name));
        Ok(())
    }

    fn policy_delete(&self, tenant: &str, name: &str) -> Result<()> {
        let key = format!("policy:{}:{}", tenant, name);
        if !self.live.borrow().contains(&key) {
            return Err(ErrorKind::ControlPlane {
                object: format!("policy '{}'", name),
                detail: "not found".to_owned(),
            }
            .into());
        }
        self.remove(&key);

        // A policy's rules are subresources of it on the real control plane: deleting the
        // policy cascades to every rule filed under it, so the fake mirrors that here rather
        // than leaving `rule:*` entries behind for a policy that no longer exists.
        let rule_prefix = format!("rule:{}:{}:", tenant, name);
        self.live
            .borrow_mut()
            .retain(|k| !k.starts_with(&rule_prefix));
        Ok(())
    }

    fn rule_post(&self, rule: &Rule) -> Result<()> {
        self.insert(format!(
            "rule:{}:{}:{}",
            rule.tenant,
            rule.policy,
            rule.rule_id_str()
        ));
        Ok(())
    }
}
