// Copyright Pit Kleyersburg <pitkley@googlemail.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified or distributed
// except according to those terms.

//! A read/write facade over a parsed [`Composition`]. This is the only component allowed to
//! mutate the composition; every other module reads services through it.

use crate::errors::{ErrorKind, Result};
use crate::types::{Composition, Service, NETWORK_DEFAULT, NETWORK_LABEL, TENANT_DEFAULT, TENANT_LABEL};

/// Wraps a composition, exposing the label/links/port derivations the rest of the engine needs
/// without ever owning the underlying value — the composition is parsed and ultimately persisted
/// by the external orchestrator, not by this crate.
pub struct CompositionView<'a> {
    composition: &'a mut Composition,
    tenant_label_key: Option<String>,
}

impl<'a> CompositionView<'a> {
    /// Wraps `composition`, using `tenant_label_key` (from `OperatorPolicyStore::tenant_label_key`)
    /// in place of [`crate::types::TENANT_LABEL`] when present.
    pub fn new(composition: &'a mut Composition, tenant_label_key: Option<String>) -> Self {
        CompositionView {
            composition,
            tenant_label_key,
        }
    }

    /// The composition's project name.
    pub fn project_name(&self) -> &str {
        &self.composition.project_name
    }

    /// Service names, in insertion order.
    pub fn service_names(&self) -> impl Iterator<Item = &str> {
        self.composition.services.keys().map(String::as_str)
    }

    /// Borrows one service by name.
    pub fn service(&self, name: &str) -> Option<&Service> {
        self.composition.services.get(name)
    }

    fn tenant_label(&self) -> &str {
        self.tenant_label_key
            .as_deref()
            .unwrap_or(TENANT_LABEL)
    }

    /// The network name for `service`: its `net` attribute, else the network label, else
    /// [`NETWORK_DEFAULT`].
    pub fn network_name(&self, service: &Service) -> String {
        if let Some(label) = service.labels.get(NETWORK_LABEL) {
            return label.clone();
        }
        if !service.net.is_empty() {
            return service.net.clone();
        }
        NETWORK_DEFAULT.to_owned()
    }

    /// The tenant name for `service`: the (possibly remapped) tenant label, else
    /// [`TENANT_DEFAULT`].
    pub fn tenant_name(&self, service: &Service) -> String {
        service
            .labels
            .get(self.tenant_label())
            .cloned()
            .unwrap_or_else(|| TENANT_DEFAULT.to_owned())
    }

    /// The network name of the project's first service, used once invariant B has been checked.
    pub fn network_name_from_project(&self) -> String {
        self.composition
            .services
            .values()
            .next()
            .map(|s| self.network_name(s))
            .unwrap_or_else(|| NETWORK_DEFAULT.to_owned())
    }

    /// The tenant name of the project's first service, used once invariant A has been checked.
    pub fn tenant_name_from_project(&self) -> String {
        self.composition
            .services
            .values()
            .next()
            .map(|s| self.tenant_name(s))
            .unwrap_or_else(|| TENANT_DEFAULT.to_owned())
    }

    /// Checks that every service agrees on network name (invariant A) and tenant name
    /// (invariant B). Fails with [`ErrorKind::CompositionInvariant`] on the first mismatch found.
    pub fn validate_project(&self) -> Result<()> {
        let net_name = self.network_name_from_project();
        for service in self.composition.services.values() {
            let this_net = self.network_name(service);
            if this_net != net_name {
                return Err(ErrorKind::CompositionInvariant {
                    detail: format!(
                        "mismatching networks '{}' vs '{}' for services not allowed",
                        net_name, this_net
                    ),
                }
                .into());
            }
        }

        let tenant_name = self.tenant_name_from_project();
        for service in self.composition.services.values() {
            let this_tenant = self.tenant_name(service);
            if this_tenant != tenant_name {
                return Err(ErrorKind::CompositionInvariant {
                    detail: format!(
                        "mismatching tenants '{}' vs '{}' for services not allowed",
                        tenant_name, this_tenant
                    ),
                }
                .into());
            }
        }

        Ok(())
    }

    /// Links declared by every service, keyed by the declaring service name, in declaration
    /// order. Mirrors the original's per-service link map used to drive links-based synthesis.
    pub fn service_links(&self) -> Vec<(String, Vec<String>)> {
        self.composition
            .services
            .iter()
            .map(|(name, svc)| (name.clone(), svc.links.clone()))
            .collect()
    }

    /// Published `ports` for every service that declares any, with each `"host:container"` entry
    /// reduced to its trailing container-port field.
    pub fn service_ports(&self) -> Vec<(String, Vec<String>)> {
        self.composition
            .services
            .iter()
            .filter(|(_, svc)| !svc.ports.is_empty())
            .map(|(name, svc)| {
                let ports = svc.ports.iter().map(|p| extract_port(p)).collect();
                (name.clone(), ports)
            })
            .collect()
    }

    /// Clears `links` on every service.
    pub fn clear_svc_links(&mut self) {
        for service in self.composition.services.values_mut() {
            service.links.clear();
        }
    }

    /// Clears `ports` and `expose` on every service.
    pub fn clear_exposed_ports(&mut self) {
        for service in self.composition.services.values_mut() {
            service.ports.clear();
            service.expose.clear();
        }
    }

    /// Sets a label on `service`.
    pub fn set_label(&mut self, service: &str, key: &str, value: &str) {
        if let Some(svc) = self.composition.services.get_mut(service) {
            svc.labels.insert(key.to_owned(), value.to_owned());
        }
    }

    /// Overwrites `dns` on `service`.
    pub fn set_dns(&mut self, service: &str, dns: Vec<String>) {
        if let Some(svc) = self.composition.services.get_mut(service) {
            svc.dns = dns;
        }
    }

    /// Overwrites `dns_search` on `service`.
    pub fn set_dns_search(&mut self, service: &str, dns_search: Vec<String>) {
        if let Some(svc) = self.composition.services.get_mut(service) {
            svc.dns_search = dns_search;
        }
    }

    /// Overwrites `net` on `service`.
    pub fn set_net(&mut self, service: &str, net: String) {
        if let Some(svc) = self.composition.services.get_mut(service) {
            svc.net = net;
        }
    }
}

fn extract_port(port_spec: &str) -> String {
    match port_spec.rfind(':') {
        Some(idx) => port_spec[idx + 1..].to_owned(),
        None => port_spec.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Service;
    use indexmap::IndexMap;

    fn service(net: &str, labels: &[(&str, &str)]) -> Service {
        Service {
            net: net.to_owned(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Service::default()
        }
    }

    fn composition(services: Vec<(&str, Service)>) -> Composition {
        let mut map = IndexMap::new();
        for (name, svc) in services {
            map.insert(name.to_owned(), svc);
        }
        Composition {
            project_name: "basic".to_owned(),
            services: map,
        }
    }

    #[test]
    fn network_name_falls_back_through_net_then_label_then_default() {
        let mut comp = composition(vec![("web", service("", &[]))]);
        let view = CompositionView::new(&mut comp, None);
        assert_eq!(view.network_name(view.service("web").unwrap()), NETWORK_DEFAULT);
    }

    #[test]
    fn network_label_overrides_net_attribute() {
        let mut comp = composition(vec![("web", service("custom", &[(NETWORK_LABEL, "foo")]))]);
        let view = CompositionView::new(&mut comp, None);
        assert_eq!(view.network_name(view.service("web").unwrap()), "foo");
    }

    #[test]
    fn tenant_name_uses_remapped_label_key() {
        let mut comp = composition(vec![("web", service("", &[("tenant", "blue")]))]);
        let view = CompositionView::new(&mut comp, Some("tenant".to_owned()));
        assert_eq!(view.tenant_name(view.service("web").unwrap()), "blue");
    }

    #[test]
    fn validate_project_passes_when_all_services_agree() {
        let mut comp = composition(vec![
            ("web", service("dev", &[])),
            ("redis", service("dev", &[])),
        ]);
        let view = CompositionView::new(&mut comp, None);
        assert!(view.validate_project().is_ok());
    }

    #[test]
    fn validate_project_fails_on_mismatching_network() {
        let mut comp = composition(vec![
            ("web", service("dev", &[])),
            ("redis", service("prod", &[])),
        ]);
        let view = CompositionView::new(&mut comp, None);
        let err = view.validate_project().unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::CompositionInvariant { .. }));
    }

    #[test]
    fn validate_project_fails_on_mismatching_tenant() {
        let mut comp = composition(vec![
            ("web", service("dev", &[(TENANT_LABEL, "blue")])),
            ("redis", service("dev", &[(TENANT_LABEL, "green")])),
        ]);
        let view = CompositionView::new(&mut comp, None);
        let err = view.validate_project().unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::CompositionInvariant { .. }));
    }

    #[test]
    fn extract_port_keeps_trailing_field() {
        assert_eq!(extract_port("8080:80"), "80");
        assert_eq!(extract_port("80"), "80");
        assert_eq!(extract_port("0.0.0.0:8080:80"), "80");
    }

    #[test]
    fn clear_exposed_ports_empties_both_ports_and_expose() {
        let mut svc = service("", &[]);
        svc.ports = vec!["80:80".to_owned()];
        svc.expose = vec!["443".to_owned()];
        let mut comp = composition(vec![("web", svc)]);
        let mut view = CompositionView::new(&mut comp, None);
        view.clear_exposed_ports();
        let svc = view.service("web").unwrap();
        assert!(svc.ports.is_empty());
        assert!(svc.expose.is_empty());
    }

    #[test]
    fn clear_svc_links_empties_links() {
        let mut svc = service("", &[]);
        svc.links = vec!["redis".to_owned()];
        let mut comp = composition(vec![("web", svc)]);
        let mut view = CompositionView::new(&mut comp, None);
        view.clear_svc_links();
        assert!(view.service("web").unwrap().links.is_empty());
    }
}
