// Copyright Pit Kleyersburg <pitkley@googlemail.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified or distributed
// except according to those terms.

//! Container-runtime queries: recovering a service's exposed ports from its image, and a tenant's
//! DNS container's address on a given network. This is the engine's only non-deterministic input,
//! so it is expressed as a trait ([`RuntimeInspect`]) with one real implementation
//! ([`DockerRuntimeInspector`]) and one fixed-table fake used by tests.

use crate::errors::{ErrorKind, Result};
use crate::types::TENANT_DEFAULT;
use crate::util::FutureExt;
use indexmap::IndexMap;
use shiplift::Docker;
use slog::{debug, o, Logger};

/// Image and DNS-container inspection, independent of each other.
pub trait RuntimeInspect {
    /// Exposed `(protocol, port)` pairs declared by `image`, in the order the runtime reports
    /// them. Used to expand `permit app` clauses (§4.1) during links-based synthesis.
    fn inspect_image(&self, image: &str) -> Result<Vec<(String, u16)>>;

    /// The IP address of the `<tenant>dns` container on the attachment whose network name equals
    /// `network` (or `network/tenant` when `tenant` is not the default tenant).
    fn inspect_dns_container(&self, tenant: &str, network: &str) -> Result<String>;
}

/// Queries a real Docker-compatible daemon through [`shiplift::Docker`].
pub struct DockerRuntimeInspector {
    docker: Docker,
    logger: Logger,
}

impl DockerRuntimeInspector {
    /// Builds an inspector against the daemon reachable at `docker_host`, or the client's own
    /// environment-derived default when `None`.
    pub fn new(docker_host: Option<&str>, logger: Logger) -> Result<DockerRuntimeInspector> {
        let docker = match docker_host {
            Some(host) => {
                let uri = host.parse().map_err(|e| ErrorKind::RuntimeInspect {
                    detail: format!("invalid docker host '{}': {}", host, e),
                })?;
                Docker::host(uri)
            }
            None => Docker::new(),
        };
        Ok(DockerRuntimeInspector {
            docker,
            logger: logger.new(o!("component" => "runtime")),
        })
    }
}

impl RuntimeInspect for DockerRuntimeInspector {
    fn inspect_image(&self, image: &str) -> Result<Vec<(String, u16)>> {
        debug!(self.logger, "inspecting image"; o!("image" => image.to_owned()));

        let details = self
            .docker
            .images()
            .get(image)
            .inspect()
            .sync()
            .map_err(|e| ErrorKind::RuntimeInspect {
                detail: format!("inspecting image '{}': {}", image, e),
            })?;

        let exposed = details
            .container_config
            .exposed_ports
            .unwrap_or_default();

        let mut ports = Vec::with_capacity(exposed.len());
        for key in exposed.keys() {
            if let Some((port_str, proto)) = key.split_once('/') {
                if let Ok(port) = port_str.parse() {
                    ports.push((proto.to_owned(), port));
                }
            }
        }
        Ok(ports)
    }

    fn inspect_dns_container(&self, tenant: &str, network: &str) -> Result<String> {
        let container_name = format!("{}dns", tenant);
        let target_network = if tenant == TENANT_DEFAULT {
            network.to_owned()
        } else {
            format!("{}/{}", network, tenant)
        };

        debug!(self.logger, "inspecting dns container";
               o!("container" => container_name.clone(), "network" => target_network.clone()));

        let details = self
            .docker
            .containers()
            .get(&container_name)
            .inspect()
            .sync()
            .map_err(|e| ErrorKind::RuntimeInspect {
                detail: format!("inspecting dns container '{}': {}", container_name, e),
            })?;

        let networks = details.network_settings.networks;
        if networks.is_empty() {
            return Err(ErrorKind::RuntimeInspect {
                detail: format!(
                    "dns container '{}' has no network attachments",
                    container_name
                ),
            }
            .into());
        }

        networks
            .get(&target_network)
            .map(|attachment| attachment.ip_address.clone())
            .ok_or_else(|| {
                ErrorKind::RuntimeInspect {
                    detail: format!(
                        "dns container '{}' is not attached to network '{}'",
                        container_name, target_network
                    ),
                }
                .into()
            })
    }
}

/// A fixed in-memory [`RuntimeInspect`] used by tests, avoiding any real daemon.
#[derive(Clone, Debug, Default)]
pub struct FakeRuntimeInspector {
    images: IndexMap<String, Vec<(String, u16)>>,
    dns: IndexMap<(String, String), String>,
}

impl FakeRuntimeInspector {
    /// Builds an empty fake with no fixtures.
    pub fn new() -> Self {
        FakeRuntimeInspector::default()
    }

    /// Registers the exposed ports an image inspection should return.
    pub fn with_image(mut self, image: impl Into<String>, ports: Vec<(&str, u16)>) -> Self {
        self.images.insert(
            image.into(),
            ports.into_iter().map(|(p, n)| (p.to_owned(), n)).collect(),
        );
        self
    }

    /// Registers the DNS-container IP for a `(tenant, network)` pair.
    pub fn with_dns(
        mut self,
        tenant: impl Into<String>,
        network: impl Into<String>,
        ip: impl Into<String>,
    ) -> Self {
        self.dns.insert((tenant.into(), network.into()), ip.into());
        self
    }
}

impl RuntimeInspect for FakeRuntimeInspector {
    fn inspect_image(&self, image: &str) -> Result<Vec<(String, u16)>> {
        self.images.get(image).cloned().ok_or_else(|| {
            ErrorKind::RuntimeInspect {
                detail: format!("no fixture registered for image '{}'", image),
            }
            .into()
        })
    }

    fn inspect_dns_container(&self, tenant: &str, network: &str) -> Result<String> {
        self.dns
            .get(&(tenant.to_owned(), network.to_owned()))
            .cloned()
            .ok_or_else(|| {
                ErrorKind::RuntimeInspect {
                    detail: format!(
                        "no dns fixture registered for tenant '{}' network '{}'",
                        tenant, network
                    ),
                }
                .into()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_returns_registered_image_ports() {
        let inspector = FakeRuntimeInspector::new().with_image("redis:5", vec![("tcp", 6379)]);
        assert_eq!(
            inspector.inspect_image("redis:5").unwrap(),
            vec![("tcp".to_owned(), 6379)]
        );
    }

    #[test]
    fn fake_fails_on_unregistered_image() {
        let inspector = FakeRuntimeInspector::new();
        assert!(inspector.inspect_image("nginx:latest").is_err());
    }

    #[test]
    fn fake_returns_registered_dns_address() {
        let inspector = FakeRuntimeInspector::new().with_dns("default", "dev", "10.0.0.5");
        assert_eq!(
            inspector.inspect_dns_container("default", "dev").unwrap(),
            "10.0.0.5"
        );
    }

    #[test]
    fn fake_fails_on_unregistered_dns_pair() {
        let inspector = FakeRuntimeInspector::new();
        assert!(inspector.inspect_dns_container("default", "dev").is_err());
    }
}
