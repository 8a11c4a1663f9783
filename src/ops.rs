// Copyright Pit Kleyersburg <pitkley@googlemail.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified or distributed
// except according to those terms.

//! Loads and validates the operator-policy document, and answers every authorization and
//! default-lookup query the rest of the engine needs.
//!
//! The wire format (`Wire*` structs below) mirrors the JSON shape in the external interface
//! exactly: `PascalCase` keys, comma-joined `"a,b"` or `"all"` sets, and a flat list of
//! `"permit ..."` rule strings per named policy. [`OperatorPolicyStore::load`] turns that wire
//! format into the validated [`OperatorPolicy`] model the rest of the crate operates on.

use crate::errors::{Error, ErrorKind, Result};
use crate::types::{OperatorPolicy, ProtoPort, UserPolicy};
use indexmap::{IndexMap, IndexSet};
use serde::Deserialize;
use slog::{debug, o, Logger};
use std::fs;
use std::path::Path;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireLabelMap {
    #[serde(rename = "Tenant")]
    tenant: String,
    #[serde(rename = "NetworkIsolationPolicy")]
    network_isolation_policy: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireUserPolicy {
    #[serde(rename = "User")]
    user: String,
    #[serde(rename = "DefaultTenant")]
    default_tenant: String,
    #[serde(rename = "Networks")]
    networks: String,
    #[serde(rename = "DefaultNetwork")]
    default_network: String,
    #[serde(rename = "NetworkPolicies")]
    network_policies: String,
    #[serde(rename = "DefaultNetworkPolicy")]
    default_network_policy: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireNetworkPolicy {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Rules")]
    rules: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireOperatorPolicy {
    #[serde(rename = "LabelMap")]
    label_map: WireLabelMap,
    #[serde(rename = "UserPolicy")]
    user_policy: Vec<WireUserPolicy>,
    #[serde(rename = "NetworkPolicy")]
    network_policy: Vec<WireNetworkPolicy>,
}

fn parse_csv_set(csv: &str) -> IndexSet<String> {
    csv.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_owned())
    }
}

/// Loads, validates, and answers queries against the operator-policy document.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct OperatorPolicyStore {
    policy: OperatorPolicy,
}

impl OperatorPolicyStore {
    /// Reads the JSON document at `path`, validates it, and returns a queryable store.
    ///
    /// Fails with [`ErrorKind::ConfigLoad`] if the file cannot be read or parsed, or if any
    /// user's default network/network-policy is not itself among their allowed sets.
    pub fn load(path: impl AsRef<Path>, logger: &Logger) -> Result<OperatorPolicyStore> {
        let path = path.as_ref();
        let logger = logger.new(o!("component" => "ops"));

        let contents = fs::read_to_string(path).map_err(|e| {
            Error::from(ErrorKind::ConfigLoad {
                path: path.display().to_string(),
                detail: e.to_string(),
            })
        })?;

        let wire: WireOperatorPolicy = serde_json::from_str(&contents).map_err(|e| {
            Error::from(ErrorKind::ConfigLoad {
                path: path.display().to_string(),
                detail: e.to_string(),
            })
        })?;

        let user_policies: Vec<UserPolicy> = wire
            .user_policy
            .into_iter()
            .map(|u| UserPolicy {
                user: u.user,
                default_tenant: non_empty(&u.default_tenant),
                default_network: non_empty(&u.default_network),
                default_network_policy: non_empty(&u.default_network_policy),
                allowed_networks: parse_csv_set(&u.networks),
                allowed_network_policies: parse_csv_set(&u.network_policies),
            })
            .collect();

        let mut network_policies: IndexMap<String, Vec<String>> = IndexMap::new();
        for np in wire.network_policy {
            network_policies.insert(np.name, np.rules);
        }

        let policy = OperatorPolicy {
            label_map: crate::types::LabelMap {
                tenant_label_key: non_empty(&wire.label_map.tenant),
                policy_label_key: non_empty(&wire.label_map.network_isolation_policy),
            },
            user_policies,
            network_policies,
        };

        let store = OperatorPolicyStore { policy };
        store.validate_defaults(path)?;

        debug!(logger, "loaded operator policy";
               o!("users" => store.policy.user_policies.len(),
                  "network_policies" => store.policy.network_policies.len()));

        Ok(store)
    }

    fn validate_defaults(&self, path: &Path) -> Result<()> {
        for user in &self.policy.user_policies {
            if let Some(default_network) = &user.default_network {
                if !user.allows_network(default_network) {
                    return Err(ErrorKind::ConfigLoad {
                        path: path.display().to_string(),
                        detail: format!(
                            "user '{}': default network '{}' is not in allowed networks",
                            user.user, default_network
                        ),
                    }
                    .into());
                }
            }
            if let Some(default_policy) = &user.default_network_policy {
                if !user.allows_network_policy(default_policy) {
                    return Err(ErrorKind::ConfigLoad {
                        path: path.display().to_string(),
                        detail: format!(
                            "user '{}': default network-policy '{}' is not in allowed policies",
                            user.user, default_policy
                        ),
                    }
                    .into());
                }
            }
        }
        Ok(())
    }

    fn find_user(&self, user: &str) -> impl Iterator<Item = &UserPolicy> {
        self.policy
            .user_policies
            .iter()
            .filter(move |u| u.user == user)
    }

    /// The remapped tenant label key, or `None` to use [`crate::types::TENANT_LABEL`].
    pub fn tenant_label_key(&self) -> Option<&str> {
        self.policy.label_map.tenant_label_key.as_deref()
    }

    /// The remapped network-policy label key, or `None` to use
    /// [`crate::types::NET_ISOLATION_POLICY_LABEL`].
    pub fn policy_label_key(&self) -> Option<&str> {
        self.policy.label_map.policy_label_key.as_deref()
    }

    /// Succeeds iff some policy entry for `user` lists `network` among its allowed networks (or
    /// lists `"all"`).
    pub fn check_network_allowed(&self, user: &str, network: &str) -> Result<()> {
        if self.find_user(user).any(|u| u.allows_network(network)) {
            Ok(())
        } else {
            Err(ErrorKind::AuthzDenied {
                user: user.to_owned(),
                resource: format!("network '{}'", network),
            }
            .into())
        }
    }

    /// Succeeds iff some policy entry for `user` lists `policy` among its allowed
    /// network-policies (or lists `"all"`).
    pub fn check_network_policy_allowed(&self, user: &str, policy: &str) -> Result<()> {
        if self.find_user(user).any(|u| u.allows_network_policy(policy)) {
            Ok(())
        } else {
            Err(ErrorKind::AuthzDenied {
                user: user.to_owned(),
                resource: format!("network-policy '{}'", policy),
            }
            .into())
        }
    }

    /// The first matching user's non-empty default network-policy.
    pub fn default_network_policy(&self, user: &str) -> Result<String> {
        self.find_user(user)
            .find_map(|u| u.default_network_policy.clone())
            .ok_or_else(|| {
                ErrorKind::AuthzDenied {
                    user: user.to_owned(),
                    resource: "default network-policy (none configured)".to_owned(),
                }
                .into()
            })
    }

    /// The first matching user's non-empty default network.
    pub fn default_network(&self, user: &str) -> Result<String> {
        self.find_user(user)
            .find_map(|u| u.default_network.clone())
            .ok_or_else(|| {
                ErrorKind::AuthzDenied {
                    user: user.to_owned(),
                    resource: "default network (none configured)".to_owned(),
                }
                .into()
            })
    }

    /// The first matching user's non-empty default tenant.
    pub fn default_tenant(&self, user: &str) -> Result<String> {
        self.find_user(user)
            .find_map(|u| u.default_tenant.clone())
            .ok_or_else(|| {
                ErrorKind::AuthzDenied {
                    user: user.to_owned(),
                    resource: "default tenant (none configured)".to_owned(),
                }
                .into()
            })
    }

    /// Parses the named policy's rule list into an ordered sequence of [`ProtoPort`] tokens.
    ///
    /// Grammar per clause: `permit (tcp|udp)/<port>` | `permit icmp` | `permit app` |
    /// `permit all`. Ports are validated to be in `0..=65535`. `deny` clauses are rejected.
    pub fn get_rules(&self, policy_name: &str) -> Result<Vec<ProtoPort>> {
        let rules = self.policy.network_policies.get(policy_name).ok_or_else(|| {
            Error::from(ErrorKind::PolicyParse {
                policy: policy_name.to_owned(),
                detail: "unrecognized policy".to_owned(),
            })
        })?;

        rules
            .iter()
            .map(|clause| parse_clause(policy_name, clause))
            .collect()
    }
}

fn parse_clause(policy_name: &str, clause: &str) -> Result<ProtoPort> {
    let fail = |detail: &str| {
        Error::from(ErrorKind::PolicyParse {
            policy: policy_name.to_owned(),
            detail: detail.to_owned(),
        })
    };

    let mut words = clause.split_whitespace();
    match words.next() {
        Some("permit") => {}
        Some("deny") => return Err(fail("deny clauses are not supported")),
        _ => return Err(fail("invalid clause, expected 'permit ...'")),
    }

    let proto_port = words
        .next()
        .ok_or_else(|| fail("incomplete permit clause"))?;
    if words.next().is_some() {
        return Err(fail("trailing tokens after permit clause"));
    }

    let mut parts = proto_port.splitn(2, '/');
    let proto = parts.next().unwrap_or("");
    match proto {
        "tcp" | "udp" => {
            let port_str = parts
                .next()
                .ok_or_else(|| fail("missing port in permit clause"))?;
            let port: i32 = port_str
                .parse()
                .map_err(|_| fail("invalid port in permit clause"))?;
            if port < 0 || port > 65535 {
                return Err(fail("port out of range 0..65535"));
            }
            Ok(if proto == "tcp" {
                ProtoPort::Tcp(port as u16)
            } else {
                ProtoPort::Udp(port as u16)
            })
        }
        "icmp" => Ok(ProtoPort::Icmp),
        "app" => Ok(ProtoPort::App),
        "all" => Ok(ProtoPort::All),
        _ => Err(fail("invalid protocol in permit clause")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sloggers::{null::NullLoggerBuilder, Build};
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn test_logger() -> Logger {
        NullLoggerBuilder.build().unwrap()
    }

    fn write_fixture(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    const FIXTURE: &str = r#"
    {
      "LabelMap": {"Tenant": "tenant", "NetworkIsolationPolicy": ""},
      "UserPolicy": [
        {"User": "vagrant", "DefaultTenant": "default", "Networks": "dev,staging",
         "DefaultNetwork": "dev", "NetworkPolicies": "TrustApp,all",
         "DefaultNetworkPolicy": "TrustApp"}
      ],
      "NetworkPolicy": [
        {"Name": "TrustApp", "Rules": ["permit app"]},
        {"Name": "RedisDefault", "Rules": ["permit tcp/6379", "permit tcp/6378", "permit tcp/6377"]},
        {"Name": "OpenAll", "Rules": ["permit all"]}
      ]
    }
    "#;

    #[test]
    fn load_parses_fixture() {
        let file = write_fixture(FIXTURE);
        let store = OperatorPolicyStore::load(file.path(), &test_logger()).unwrap();
        assert_eq!(store.tenant_label_key(), Some("tenant"));
        assert_eq!(store.policy_label_key(), None);
    }

    #[test]
    fn check_network_allowed_respects_csv_set() {
        let file = write_fixture(FIXTURE);
        let store = OperatorPolicyStore::load(file.path(), &test_logger()).unwrap();
        assert!(store.check_network_allowed("vagrant", "dev").is_ok());
        assert!(store.check_network_allowed("vagrant", "production").is_err());
    }

    #[test]
    fn check_network_policy_allowed_respects_all_token() {
        let file = write_fixture(FIXTURE);
        let store = OperatorPolicyStore::load(file.path(), &test_logger()).unwrap();
        assert!(store
            .check_network_policy_allowed("vagrant", "AnythingGoes")
            .is_ok());
    }

    #[test]
    fn defaults_are_looked_up_first_match_wins() {
        let file = write_fixture(FIXTURE);
        let store = OperatorPolicyStore::load(file.path(), &test_logger()).unwrap();
        assert_eq!(store.default_network("vagrant").unwrap(), "dev");
        assert_eq!(store.default_network_policy("vagrant").unwrap(), "TrustApp");
        assert_eq!(store.default_tenant("vagrant").unwrap(), "default");
    }

    #[test]
    fn default_lookup_fails_for_unknown_user() {
        let file = write_fixture(FIXTURE);
        let store = OperatorPolicyStore::load(file.path(), &test_logger()).unwrap();
        assert!(store.default_network("nobody").is_err());
    }

    #[test]
    fn load_rejects_default_network_outside_allowed_set() {
        let bad = r#"
        {
          "UserPolicy": [
            {"User": "eve", "Networks": "dev", "DefaultNetwork": "production"}
          ]
        }
        "#;
        let file = write_fixture(bad);
        let err = OperatorPolicyStore::load(file.path(), &test_logger()).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::ConfigLoad { .. }));
    }

    #[test]
    fn load_rejects_default_network_policy_outside_allowed_set() {
        let bad = r#"
        {
          "UserPolicy": [
            {"User": "eve", "NetworkPolicies": "TrustApp", "DefaultNetworkPolicy": "Other"}
          ]
        }
        "#;
        let file = write_fixture(bad);
        let err = OperatorPolicyStore::load(file.path(), &test_logger()).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::ConfigLoad { .. }));
    }

    #[test]
    fn load_fails_on_missing_file() {
        let err = OperatorPolicyStore::load("/nonexistent/ops.json", &test_logger()).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::ConfigLoad { .. }));
    }

    #[test]
    fn get_rules_parses_grammar_in_order() {
        let file = write_fixture(FIXTURE);
        let store = OperatorPolicyStore::load(file.path(), &test_logger()).unwrap();
        let rules = store.get_rules("RedisDefault").unwrap();
        assert_eq!(
            rules,
            vec![ProtoPort::Tcp(6379), ProtoPort::Tcp(6378), ProtoPort::Tcp(6377)]
        );
    }

    #[test]
    fn get_rules_is_pure() {
        let file = write_fixture(FIXTURE);
        let store = OperatorPolicyStore::load(file.path(), &test_logger()).unwrap();
        assert_eq!(
            store.get_rules("TrustApp").unwrap(),
            store.get_rules("TrustApp").unwrap()
        );
    }

    #[test]
    fn get_rules_fails_on_unknown_policy() {
        let file = write_fixture(FIXTURE);
        let store = OperatorPolicyStore::load(file.path(), &test_logger()).unwrap();
        assert!(store.get_rules("NoSuchPolicy").is_err());
    }

    #[test]
    fn get_rules_fails_on_deny_clause() {
        let doc = r#"
        {"NetworkPolicy": [{"Name": "Bad", "Rules": ["deny tcp/80"]}]}
        "#;
        let file = write_fixture(doc);
        let store = OperatorPolicyStore::load(file.path(), &test_logger()).unwrap();
        assert!(store.get_rules("Bad").is_err());
    }

    #[test]
    fn get_rules_fails_on_out_of_range_port() {
        let doc = r#"
        {"NetworkPolicy": [{"Name": "Bad", "Rules": ["permit tcp/70000"]}]}
        "#;
        let file = write_fixture(doc);
        let store = OperatorPolicyStore::load(file.path(), &test_logger()).unwrap();
        assert!(store.get_rules("Bad").is_err());
    }

    #[test]
    fn get_rules_fails_on_invalid_protocol() {
        let doc = r#"
        {"NetworkPolicy": [{"Name": "Bad", "Rules": ["permit sctp/80"]}]}
        "#;
        let file = write_fixture(doc);
        let store = OperatorPolicyStore::load(file.path(), &test_logger()).unwrap();
        assert!(store.get_rules("Bad").is_err());
    }

    #[test]
    fn get_rules_recognizes_open_all() {
        let file = write_fixture(FIXTURE);
        let store = OperatorPolicyStore::load(file.path(), &test_logger()).unwrap();
        assert_eq!(store.get_rules("OpenAll").unwrap(), vec![ProtoPort::All]);
    }
}
