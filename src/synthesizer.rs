// Copyright Pit Kleyersburg <pitkley@googlemail.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified or distributed
// except according to those terms.

//! The heart of the engine: turns a [`CompositionView`] plus the operator policy and image
//! inspection into an ordered [`Plan`] of control-plane mutations. Synthesis never talks to the
//! control plane itself — [`crate::control_plane::apply_plan`] is a separate pass over the
//! returned [`Plan`], per the Design Notes' dry-run requirement.

use crate::composition::CompositionView;
use crate::errors::{Error, ErrorKind, Result};
use crate::naming;
use crate::ops::OperatorPolicyStore;
use crate::runtime::RuntimeInspect;
use crate::types::{
    Action, AppProfile, Direction, EndpointGroup, Mutation, Network, Plan, Policy, ProtoPort,
    Rule, Tenant, NET_ISOLATION_POLICY_LABEL,
};
use indexmap::IndexMap;
use slog::{debug, info, o, Logger};

/// Per-target-service synthesis scratch, tracking how far a service's in-policy has progressed.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
struct PolicyCreateRec {
    next_rule_id: u32,
    policy_applied: bool,
}

impl PolicyCreateRec {
    fn new() -> Self {
        PolicyCreateRec {
            next_rule_id: 1,
            policy_applied: false,
        }
    }
}

/// Produces [`Plan`]s for the `start`/`stop` lifecycle events from a composition, the operator
/// policy, and image inspection.
#[derive(Clone, Debug)]
pub struct PolicySynthesizer {
    /// Whether links-based allow rules name the concrete source EPG, see
    /// [`naming::from_epg_name`].
    pub contract_mode: bool,
    /// Whether phase (3) (default deny-in/allow-out for untouched services) is synthesized.
    pub default_policy_mode: bool,
}

impl PolicySynthesizer {
    /// Builds a synthesizer with the given mode toggles.
    pub fn new(contract_mode: bool, default_policy_mode: bool) -> Self {
        PolicySynthesizer {
            contract_mode,
            default_policy_mode,
        }
    }

    /// Synthesizes the full create [`Plan`] for a `start` (or post-clear `scale`) event: tenant
    /// and network, links-based rules, expose-based rules, the optional default policy, and the
    /// project's [`AppProfile`].
    pub fn create_plan(
        &self,
        view: &CompositionView,
        ops: &OperatorPolicyStore,
        runtime: &dyn RuntimeInspect,
        user: &str,
        logger: &Logger,
    ) -> Result<Plan> {
        let logger = logger.new(o!("component" => "synthesizer"));
        let project = view.project_name().to_owned();
        let tenant = view.tenant_name_from_project();
        let network = view.network_name_from_project();

        let mut plan: Plan = vec![
            Mutation::TenantUp(Tenant {
                name: tenant.clone(),
            }),
            Mutation::NetworkUp(Network {
                name: network.clone(),
                tenant: tenant.clone(),
            }),
        ];

        // Pre-create a bare endpoint group for every service so that the AppProfile synthesized
        // at the end always has a valid EPG to reference, even for services no link or expose
        // declaration ever touches.
        for service_name in view.service_names() {
            let svc = view
                .service(service_name)
                .expect("service_names() only yields names present in the composition");
            plan.push(Mutation::EndpointGroupUp(EndpointGroup::new(
                naming::svc_short(&project, service_name),
                tenant.clone(),
                view.network_name(svc),
                vec![],
            )));
        }

        let mut recs: IndexMap<String, PolicyCreateRec> = IndexMap::new();

        self.synthesize_links(view, ops, runtime, user, &project, &tenant, &mut recs, &mut plan, &logger)?;
        self.synthesize_expose(view, &project, &tenant, &mut recs, &mut plan);

        if self.default_policy_mode {
            self.synthesize_default(view, &project, &tenant, &recs, &mut plan);
        }

        let epg_list = view
            .service_names()
            .map(|name| naming::svc_short(&project, name))
            .collect();
        plan.push(Mutation::AppProfileUp(AppProfile {
            name: project,
            tenant,
            network,
            epg_list,
        }));

        Ok(plan)
    }

    #[allow(clippy::too_many_arguments)]
    fn synthesize_links(
        &self,
        view: &CompositionView,
        ops: &OperatorPolicyStore,
        runtime: &dyn RuntimeInspect,
        user: &str,
        project: &str,
        tenant: &str,
        recs: &mut IndexMap<String, PolicyCreateRec>,
        plan: &mut Plan,
        logger: &Logger,
    ) -> Result<()> {
        for (from_service, links) in view.service_links() {
            for to_service in links {
                let to_svc = view.service(&to_service).ok_or_else(|| {
                    Error::from(ErrorKind::CompositionInvariant {
                        detail: format!(
                            "service '{}' links to undeclared service '{}'",
                            from_service, to_service
                        ),
                    })
                })?;
                let network = view.network_name(to_svc);

                let policy_name = resolve_policy_name(ops, to_svc, user)?;
                ops.check_network_policy_allowed(user, &policy_name)?;
                let tokens = ops.get_rules(&policy_name)?;

                if tokens.iter().any(|t| t.is_all()) {
                    info!(logger, "allowing all traffic to service";
                          o!("service" => to_service.clone()));
                    continue;
                }

                let expanded = expand_tokens(&tokens, runtime, &to_svc.image)?;

                let rec = recs
                    .entry(to_service.clone())
                    .or_insert_with(PolicyCreateRec::new);
                let first_touch = !rec.policy_applied;

                if first_touch {
                    let policy_name = naming::in_policy(project, &to_service);
                    plan.push(Mutation::PolicyUp(Policy {
                        name: policy_name.clone(),
                        tenant: tenant.to_owned(),
                    }));
                    plan.push(Mutation::RuleUp(Rule {
                        policy: policy_name.clone(),
                        tenant: tenant.to_owned(),
                        rule_id: rec.next_rule_id,
                        priority: rec.next_rule_id,
                        direction: Direction::In,
                        action: Action::Deny,
                        protocol: "tcp".to_owned(),
                        port: None,
                        from_epg: None,
                        from_network: network.clone(),
                    }));
                    rec.next_rule_id += 1;
                    plan.push(Mutation::EndpointGroupUp(EndpointGroup::new(
                        naming::svc_short(project, &to_service),
                        tenant.to_owned(),
                        network.clone(),
                        vec![policy_name],
                    )));
                }

                let from_epg = naming::from_epg_name(self.contract_mode, project, &from_service);
                let policy_name = naming::in_policy(project, &to_service);
                for (protocol, port) in &expanded {
                    plan.push(Mutation::RuleUp(Rule {
                        policy: policy_name.clone(),
                        tenant: tenant.to_owned(),
                        rule_id: rec.next_rule_id,
                        priority: rec.next_rule_id,
                        direction: Direction::In,
                        action: Action::Allow,
                        protocol: protocol.clone(),
                        port: *port,
                        from_epg: if from_epg.is_empty() {
                            None
                        } else {
                            Some(from_epg.clone())
                        },
                        from_network: network.clone(),
                    }));
                    rec.next_rule_id += 1;
                }
                rec.policy_applied = true;

                debug!(logger, "applied links-based policy";
                       o!("from" => from_service.clone(), "to" => to_service.clone(),
                          "policy" => policy_name));
            }
        }
        Ok(())
    }

    fn synthesize_expose(
        &self,
        view: &CompositionView,
        project: &str,
        tenant: &str,
        recs: &mut IndexMap<String, PolicyCreateRec>,
        plan: &mut Plan,
    ) {
        for (service_name, ports) in view.service_ports() {
            let svc = view
                .service(&service_name)
                .expect("service_ports() only yields names present in the composition");
            let network = view.network_name(svc);

            let rec = recs
                .entry(service_name.clone())
                .or_insert_with(PolicyCreateRec::new);
            let policy_name = naming::in_policy(project, &service_name);

            if !rec.policy_applied {
                plan.push(Mutation::PolicyUp(Policy {
                    name: policy_name.clone(),
                    tenant: tenant.to_owned(),
                }));
                plan.push(Mutation::EndpointGroupUp(EndpointGroup::new(
                    naming::svc_short(project, &service_name),
                    tenant.to_owned(),
                    network.clone(),
                    vec![policy_name.clone()],
                )));
            }

            for port in ports {
                let port_num: u16 = match port.parse() {
                    Ok(p) => p,
                    Err(_) => continue,
                };
                plan.push(Mutation::RuleUp(Rule {
                    policy: policy_name.clone(),
                    tenant: tenant.to_owned(),
                    rule_id: rec.next_rule_id,
                    priority: rec.next_rule_id,
                    direction: Direction::In,
                    action: Action::Allow,
                    protocol: "tcp".to_owned(),
                    port: Some(port_num),
                    from_epg: None,
                    from_network: network.clone(),
                }));
                rec.next_rule_id += 1;
            }
            rec.policy_applied = true;
        }
    }

    fn synthesize_default(
        &self,
        view: &CompositionView,
        project: &str,
        tenant: &str,
        recs: &IndexMap<String, PolicyCreateRec>,
        plan: &mut Plan,
    ) {
        for service_name in view.service_names() {
            if recs.contains_key(service_name) {
                continue;
            }
            let svc = view
                .service(service_name)
                .expect("service_names() only yields names present in the composition");
            let network = view.network_name(svc);

            let in_policy = naming::in_policy(project, service_name);
            let out_policy = naming::out_policy(project, service_name);

            plan.push(Mutation::PolicyUp(Policy {
                name: in_policy.clone(),
                tenant: tenant.to_owned(),
            }));
            plan.push(Mutation::RuleUp(Rule {
                policy: in_policy.clone(),
                tenant: tenant.to_owned(),
                rule_id: 1,
                priority: 1,
                direction: Direction::In,
                action: Action::Deny,
                protocol: "tcp".to_owned(),
                port: None,
                from_epg: None,
                from_network: network.clone(),
            }));

            plan.push(Mutation::PolicyUp(Policy {
                name: out_policy.clone(),
                tenant: tenant.to_owned(),
            }));
            plan.push(Mutation::RuleUp(Rule {
                policy: out_policy.clone(),
                tenant: tenant.to_owned(),
                rule_id: 1,
                priority: 1,
                direction: Direction::Out,
                action: Action::Allow,
                protocol: "tcp".to_owned(),
                port: None,
                from_epg: None,
                from_network: network.clone(),
            }));

            plan.push(Mutation::EndpointGroupUp(EndpointGroup::new(
                naming::svc_short(project, service_name),
                tenant.to_owned(),
                network,
                vec![in_policy, out_policy],
            )));
        }
    }

    /// Synthesizes the teardown [`Plan`] for a `stop` event: the project's [`AppProfile`], then
    /// every service's endpoint group, in-policy and out-policy.
    pub fn delete_plan(&self, view: &CompositionView) -> Plan {
        let project = view.project_name().to_owned();
        let tenant = view.tenant_name_from_project();
        let network = view.network_name_from_project();

        let mut plan: Plan = vec![Mutation::AppProfileDown {
            tenant: tenant.clone(),
            network: network.clone(),
            name: project.clone(),
        }];

        for service_name in view.service_names() {
            let svc = view
                .service(service_name)
                .expect("service_names() only yields names present in the composition");
            let service_network = view.network_name(svc);

            plan.push(Mutation::EndpointGroupDown {
                tenant: tenant.clone(),
                network: service_network,
                name: naming::svc_short(&project, service_name),
            });
            plan.push(Mutation::PolicyDown {
                tenant: tenant.clone(),
                name: naming::in_policy(&project, service_name),
            });
            plan.push(Mutation::PolicyDown {
                tenant: tenant.clone(),
                name: naming::out_policy(&project, service_name),
            });
        }

        plan
    }
}

fn resolve_policy_name(
    ops: &OperatorPolicyStore,
    service: &crate::types::Service,
    user: &str,
) -> Result<String> {
    let key = ops.policy_label_key().unwrap_or(NET_ISOLATION_POLICY_LABEL);
    if let Some(name) = service.labels.get(key) {
        Ok(name.clone())
    } else {
        ops.default_network_policy(user)
    }
}

/// Expands a parsed rule-clause list into concrete `(protocol, port)` pairs, substituting image
/// inspection for `app` tokens. Callers must check for `ProtoPort::All` before calling this —
/// `all` never reaches rule emission.
fn expand_tokens(
    tokens: &[ProtoPort],
    runtime: &dyn RuntimeInspect,
    image: &str,
) -> Result<Vec<(String, Option<u16>)>> {
    let mut expanded = Vec::new();
    for token in tokens {
        match token {
            ProtoPort::Tcp(port) => expanded.push(("tcp".to_owned(), Some(*port))),
            ProtoPort::Udp(port) => expanded.push(("udp".to_owned(), Some(*port))),
            ProtoPort::Icmp => expanded.push(("icmp".to_owned(), None)),
            ProtoPort::App => {
                for (proto, port) in runtime.inspect_image(image)? {
                    expanded.push((proto, Some(port)));
                }
            }
            ProtoPort::All => unreachable!("callers must short-circuit on ProtoPort::All"),
        }
    }
    Ok(expanded)
}
