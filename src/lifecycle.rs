// Copyright Pit Kleyersburg <pitkley@googlemail.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified or distributed
// except according to those terms.

//! Dispatches one container-orchestration event (`start`/`scale`/`stop`) against a composition,
//! threading the operator policy, runtime inspection and control plane through every step. This
//! is the only module that sequences the other components together; each step it performs is a
//! thin call into [`crate::composition`], [`crate::synthesizer`] or [`crate::control_plane`].

use crate::composition::CompositionView;
use crate::control_plane::{apply_plan, ControlPlane};
use crate::errors::{ErrorKind, Result};
use crate::naming;
use crate::ops::OperatorPolicyStore;
use crate::runtime::RuntimeInspect;
use crate::synthesizer::PolicySynthesizer;
use crate::types::{NET_ISOLATION_GROUP_LABEL, USER_LABEL};
use slog::{info, o, warn, Logger};
use std::process::Command;

/// Process exit code the out-of-scope CLI entry point should use when a `start` event fails.
pub const FATAL_EXIT_CODE: i32 = 10;

/// The lifecycle events this engine reacts to, mapped from the surrounding orchestrator's
/// vocabulary.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Event {
    /// A composition is coming up for the first time.
    Start,
    /// A running composition's container count is changing; re-synthesizes nothing, only clears
    /// transient per-container view state.
    Scale,
    /// A composition is being torn down.
    Stop,
}

impl Event {
    /// Recognizes the orchestrator's synonyms for each event, case-insensitively: start
    /// `up`/`start`; stop `down`/`delete`/`kill`/`rm`/`stop`; scale `scale`. Every other event
    /// name (`create`, `build`, `ps`, `port`, `pull`, `log`, `restart`, and anything else the
    /// orchestrator might dispatch) is not an error — it is simply ignored, returning `None`, the
    /// same way the original's `getEvent` falls through to `noEvent` for them.
    ///
    /// This is a plain associated function rather than a [`std::str::FromStr`] impl because an
    /// unrecognized event name isn't a parse failure to propagate, it's a no-op to perform.
    pub fn parse(raw: &str) -> Option<Event> {
        match raw.to_ascii_lowercase().as_str() {
            "up" | "start" => Some(Event::Start),
            "scale" => Some(Event::Scale),
            "down" | "delete" | "kill" | "rm" | "stop" => Some(Event::Stop),
            _ => None,
        }
    }
}

/// Looks up the OS user running the current process via `id -u -n`, the same identity the
/// operator policy's `UserPolicy::User` entries are keyed on.
///
/// Exposed as a free function rather than read implicitly inside [`LifecycleDriver::run`] so the
/// driver itself stays a pure function of its arguments and is testable without shelling out.
pub fn current_user() -> Result<String> {
    let output = Command::new("id")
        .arg("-u")
        .arg("-n")
        .output()
        .map_err(|e| ErrorKind::RuntimeInspect {
            detail: format!("running 'id -u -n': {}", e),
        })?;

    if !output.status.success() {
        return Err(ErrorKind::RuntimeInspect {
            detail: format!("'id -u -n' exited with {}", output.status),
        }
        .into());
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
}

/// Drives one [`Event`] against a composition, wiring together the operator policy, runtime
/// inspection, synthesizer and control plane.
pub struct LifecycleDriver<'a> {
    ops: &'a OperatorPolicyStore,
    runtime: &'a dyn RuntimeInspect,
    control_plane: &'a dyn ControlPlane,
    synthesizer: PolicySynthesizer,
    logger: Logger,
}

impl<'a> LifecycleDriver<'a> {
    /// Builds a driver over the given collaborators.
    pub fn new(
        ops: &'a OperatorPolicyStore,
        runtime: &'a dyn RuntimeInspect,
        control_plane: &'a dyn ControlPlane,
        synthesizer: PolicySynthesizer,
        logger: Logger,
    ) -> Self {
        LifecycleDriver {
            ops,
            runtime,
            control_plane,
            synthesizer,
            logger: logger.new(o!("component" => "lifecycle")),
        }
    }

    /// Dispatches `event` against `view` on behalf of `user`.
    ///
    /// `start` and `scale` failures (synthesis, authorization, or runtime inspection) are fatal
    /// and returned to the caller immediately; a `stop` always attempts every teardown mutation
    /// via [`apply_plan`], which logs and continues past tolerable per-object control-plane
    /// failures, but a teardown-level error (if any survives) is still returned rather than
    /// swallowed.
    pub fn run(&self, event: Event, view: &mut CompositionView, user: &str) -> Result<()> {
        match event {
            Event::Start => self.start(view, user),
            Event::Scale => self.scale(view, user),
            Event::Stop => self.stop(view),
        }
    }

    fn start(&self, view: &mut CompositionView, user: &str) -> Result<()> {
        info!(self.logger, "starting composition"; o!("project" => view.project_name().to_owned()));

        view.validate_project()?;

        let network = view.network_name_from_project();
        self.ops.check_network_allowed(user, &network)?;

        let plan = self
            .synthesizer
            .create_plan(view, self.ops, self.runtime, user, &self.logger)?;
        apply_plan(self.control_plane, &plan, &self.logger)?;

        view.clear_svc_links();
        view.clear_exposed_ports();

        self.auto_gen_labels(view, user);
        self.auto_gen_params(view)?;

        info!(self.logger, "composition started";
              o!("project" => view.project_name().to_owned(), "mutations" => plan.len()));
        Ok(())
    }

    fn scale(&self, view: &mut CompositionView, user: &str) -> Result<()> {
        info!(self.logger, "scaling composition"; o!("project" => view.project_name().to_owned()));

        // Scaling does not re-synthesize policy or reconcile the control plane: the policy graph
        // is treated as immutable across a scale event. Only the transient per-container view
        // state is cleared, then relabeled/reparameterized exactly as a `start` would.
        view.clear_svc_links();
        view.clear_exposed_ports();

        self.auto_gen_labels(view, user);
        if let Err(e) = self.auto_gen_params(view) {
            if !e.kind().is_tolerable() {
                return Err(e);
            }
            warn!(self.logger, "continuing scale past runtime-inspection failure";
                  o!("project" => view.project_name().to_owned(), "error" => e.to_string()));
        }
        Ok(())
    }

    fn stop(&self, view: &mut CompositionView) -> Result<()> {
        info!(self.logger, "stopping composition"; o!("project" => view.project_name().to_owned()));

        let plan = self.synthesizer.delete_plan(view);
        let result = apply_plan(self.control_plane, &plan, &self.logger);
        if let Err(ref e) = result {
            warn!(self.logger, "teardown did not complete cleanly";
                  o!("project" => view.project_name().to_owned(), "error" => e.to_string()));
        }
        result
    }

    /// Stamps every service with the `io.contiv.user` and `io.contiv.group` labels
    /// `AutoGenLabels` injects before synthesis runs.
    fn auto_gen_labels(&self, view: &mut CompositionView, user: &str) {
        let project = view.project_name().to_owned();
        let service_names: Vec<String> = view.service_names().map(str::to_owned).collect();
        for service_name in &service_names {
            view.set_label(service_name, USER_LABEL, user);
            view.set_label(
                service_name,
                NET_ISOLATION_GROUP_LABEL,
                &naming::svc_short(&project, service_name),
            );
        }
    }

    /// Rewrites every service's `net` attribute to its fully-qualified form
    /// ([`naming::svc_full`]), and fills in `dns`/`dns_search` when the service declared neither.
    ///
    /// Mirrors the nesting of the original's DNS defaulting: DNS addresses are filled whenever a
    /// service's `dns` is empty; DNS search entries are filled only when `dns` was *also* empty
    /// before this ran and `dns_search` is empty. The `net` rewrite always happens, independent of
    /// the DNS branch.
    fn auto_gen_params(&self, view: &mut CompositionView) -> Result<()> {
        let project = view.project_name().to_owned();
        let tenant = view.tenant_name_from_project();
        let network = view.network_name_from_project();

        let service_names: Vec<String> = view.service_names().map(str::to_owned).collect();
        for service_name in &service_names {
            let svc = view
                .service(service_name)
                .expect("service_names() only yields names present in the composition")
                .clone();

            if svc.dns.is_empty() {
                let dns_ip = self.runtime.inspect_dns_container(&tenant, &network)?;
                view.set_dns(service_name, vec![dns_ip]);

                if svc.dns_search.is_empty() {
                    let search_domain = if tenant == crate::types::TENANT_DEFAULT {
                        network.clone()
                    } else {
                        format!("{}.{}", network, tenant)
                    };
                    view.set_dns_search(service_name, vec![search_domain]);
                }
            }

            let full_net = naming::svc_full(&project, service_name, &network, &tenant);
            view.set_net(service_name, full_net);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_plane::FakeControlPlaneClient;
    use crate::runtime::FakeRuntimeInspector;
    use crate::types::{Composition, Service};
    use indexmap::IndexMap;
    use sloggers::{null::NullLoggerBuilder, Build};
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn test_logger() -> Logger {
        NullLoggerBuilder.build().unwrap()
    }

    fn write_ops(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    const OPS_FIXTURE: &str = r#"
    {
      "UserPolicy": [
        {"User": "vagrant", "DefaultTenant": "default", "Networks": "dev",
         "DefaultNetwork": "dev", "NetworkPolicies": "TrustApp",
         "DefaultNetworkPolicy": "TrustApp"}
      ],
      "NetworkPolicy": [
        {"Name": "TrustApp", "Rules": ["permit app"]}
      ]
    }
    "#;

    fn basic_composition() -> Composition {
        let mut services = IndexMap::new();
        services.insert(
            "web".to_owned(),
            Service {
                image: "web:latest".to_owned(),
                links: vec!["redis".to_owned()],
                ..Service::default()
            },
        );
        services.insert(
            "redis".to_owned(),
            Service {
                image: "redis:5".to_owned(),
                ..Service::default()
            },
        );
        Composition {
            project_name: "basic".to_owned(),
            services,
        }
    }

    #[test]
    fn event_parse_recognizes_synonyms() {
        assert_eq!(Event::parse("start"), Some(Event::Start));
        assert_eq!(Event::parse("UP"), Some(Event::Start));
        assert_eq!(Event::parse("scale"), Some(Event::Scale));
        assert_eq!(Event::parse("stop"), Some(Event::Stop));
        assert_eq!(Event::parse("down"), Some(Event::Stop));
        assert_eq!(Event::parse("delete"), Some(Event::Stop));
        assert_eq!(Event::parse("kill"), Some(Event::Stop));
        assert_eq!(Event::parse("RM"), Some(Event::Stop));
    }

    #[test]
    fn event_parse_ignores_everything_else() {
        assert_eq!(Event::parse("create"), None);
        assert_eq!(Event::parse("build"), None);
        assert_eq!(Event::parse("ps"), None);
        assert_eq!(Event::parse("port"), None);
        assert_eq!(Event::parse("pull"), None);
        assert_eq!(Event::parse("log"), None);
        assert_eq!(Event::parse("restart"), None);
        assert_eq!(Event::parse("nonsense"), None);
    }

    #[test]
    fn auto_gen_labels_stamps_user_and_group() {
        let ops_file = write_ops(OPS_FIXTURE);
        let ops = OperatorPolicyStore::load(ops_file.path(), &test_logger()).unwrap();
        let runtime = FakeRuntimeInspector::new();
        let control_plane = FakeControlPlaneClient::default();
        let driver = LifecycleDriver::new(
            &ops,
            &runtime,
            &control_plane,
            PolicySynthesizer::new(true, false),
            test_logger(),
        );

        let mut comp = basic_composition();
        let mut view = CompositionView::new(&mut comp, None);
        driver.auto_gen_labels(&mut view, "vagrant");

        let web = view.service("web").unwrap();
        assert_eq!(web.labels.get(USER_LABEL), Some(&"vagrant".to_owned()));
        assert_eq!(
            web.labels.get(NET_ISOLATION_GROUP_LABEL),
            Some(&"basic_web".to_owned())
        );
    }

    #[test]
    fn auto_gen_params_fills_dns_only_when_absent() {
        let ops_file = write_ops(OPS_FIXTURE);
        let ops = OperatorPolicyStore::load(ops_file.path(), &test_logger()).unwrap();
        let runtime = FakeRuntimeInspector::new().with_dns("default", "dev", "10.0.0.9");
        let control_plane = FakeControlPlaneClient::default();
        let driver = LifecycleDriver::new(
            &ops,
            &runtime,
            &control_plane,
            PolicySynthesizer::new(true, false),
            test_logger(),
        );

        let mut comp = basic_composition();
        comp.services.get_mut("web").unwrap().dns = vec!["8.8.8.8".to_owned()];
        let mut view = CompositionView::new(&mut comp, None);
        driver.auto_gen_params(&mut view).unwrap();

        let web = view.service("web").unwrap();
        assert_eq!(web.dns, vec!["8.8.8.8".to_owned()]);
        assert!(web.dns_search.is_empty());
        assert_eq!(web.net, "basic_web.dev");

        let redis = view.service("redis").unwrap();
        assert_eq!(redis.dns, vec!["10.0.0.9".to_owned()]);
        assert_eq!(redis.dns_search, vec!["dev".to_owned()]);
        assert_eq!(redis.net, "basic_redis.dev");
    }

    #[test]
    fn auto_gen_params_skips_dns_search_when_caller_set_it() {
        let ops_file = write_ops(OPS_FIXTURE);
        let ops = OperatorPolicyStore::load(ops_file.path(), &test_logger()).unwrap();
        let runtime = FakeRuntimeInspector::new().with_dns("default", "dev", "10.0.0.9");
        let control_plane = FakeControlPlaneClient::default();
        let driver = LifecycleDriver::new(
            &ops,
            &runtime,
            &control_plane,
            PolicySynthesizer::new(true, false),
            test_logger(),
        );

        let mut comp = basic_composition();
        comp.services.get_mut("redis").unwrap().dns_search = vec!["custom.example".to_owned()];
        let mut view = CompositionView::new(&mut comp, None);
        driver.auto_gen_params(&mut view).unwrap();

        let redis = view.service("redis").unwrap();
        assert_eq!(redis.dns, vec!["10.0.0.9".to_owned()]);
        assert_eq!(redis.dns_search, vec!["custom.example".to_owned()]);
    }

    #[test]
    fn start_then_stop_leaves_no_orphaned_objects() {
        let ops_file = write_ops(OPS_FIXTURE);
        let ops = OperatorPolicyStore::load(ops_file.path(), &test_logger()).unwrap();
        let runtime = FakeRuntimeInspector::new()
            .with_image("redis:5", vec![("tcp", 6379)])
            .with_dns("default", "dev", "10.0.0.9");
        let control_plane = FakeControlPlaneClient::default();
        let driver = LifecycleDriver::new(
            &ops,
            &runtime,
            &control_plane,
            PolicySynthesizer::new(true, false),
            test_logger(),
        );

        // Each event is its own process invocation against whatever the external orchestrator
        // hands the hook that time; `start`'s in-memory `net`/`dns` rewrites are never persisted
        // back to the composition file, so `stop` here re-parses the same fixture `start` began
        // from rather than reusing `start`'s mutated `Composition`.
        let mut start_comp = basic_composition();
        {
            let mut view = CompositionView::new(&mut start_comp, None);
            driver.run(Event::Start, &mut view, "vagrant").unwrap();
        }
        let live_after_start = control_plane.live_objects();
        assert!(!live_after_start.is_empty());

        let mut stop_comp = basic_composition();
        {
            let mut view = CompositionView::new(&mut stop_comp, None);
            driver.run(Event::Stop, &mut view, "vagrant").unwrap();
        }

        // `stop` only ever tears down the project's own app profile, endpoint groups, policies
        // and rules; the shared tenant/network stay up for whatever else lives on them, matching
        // the original's design of never deleting tenants or networks from a compose hook. So the
        // "no orphans" guarantee is scoped to what `delete_plan` actually targets, not to that
        // shared infra.
        let leftover_project_objects: Vec<&String> = control_plane
            .live_objects()
            .iter()
            .filter(|key| {
                key.starts_with("appprofile:") || key.starts_with("epg:") || key.starts_with("policy:") || key.starts_with("rule:")
            })
            .collect();
        assert!(
            leftover_project_objects.is_empty(),
            "expected no leftover project objects, found {:?}",
            leftover_project_objects
        );
        assert!(control_plane.live_objects().contains("tenant:default"));
        assert!(control_plane
            .live_objects()
            .contains("network:default:dev"));
    }

    #[test]
    fn start_fails_fast_when_network_not_authorized() {
        let ops_file = write_ops(OPS_FIXTURE);
        let ops = OperatorPolicyStore::load(ops_file.path(), &test_logger()).unwrap();
        let runtime = FakeRuntimeInspector::new();
        let control_plane = FakeControlPlaneClient::default();
        let driver = LifecycleDriver::new(
            &ops,
            &runtime,
            &control_plane,
            PolicySynthesizer::new(true, false),
            test_logger(),
        );

        let mut comp = basic_composition();
        comp.services
            .get_mut("web")
            .unwrap()
            .net = "production".to_owned();
        comp.services
            .get_mut("redis")
            .unwrap()
            .net = "production".to_owned();
        let mut view = CompositionView::new(&mut comp, None);

        let err = driver.run(Event::Start, &mut view, "vagrant").unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::AuthzDenied { .. }));
        assert!(control_plane.live_objects().is_empty());
    }

    #[test]
    fn start_rejects_mixed_networks_before_any_mutation() {
        let ops_file = write_ops(OPS_FIXTURE);
        let ops = OperatorPolicyStore::load(ops_file.path(), &test_logger()).unwrap();
        let runtime = FakeRuntimeInspector::new();
        let control_plane = FakeControlPlaneClient::default();
        let driver = LifecycleDriver::new(
            &ops,
            &runtime,
            &control_plane,
            PolicySynthesizer::new(true, false),
            test_logger(),
        );

        let mut comp = basic_composition();
        comp.services.get_mut("redis").unwrap().net = "staging".to_owned();
        let mut view = CompositionView::new(&mut comp, None);

        let err = driver.run(Event::Start, &mut view, "vagrant").unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::CompositionInvariant { .. }));
        assert!(control_plane.live_objects().is_empty());
    }

    #[test]
    fn scale_clears_links_and_exposed_ports_without_touching_control_plane() {
        let ops_file = write_ops(OPS_FIXTURE);
        let ops = OperatorPolicyStore::load(ops_file.path(), &test_logger()).unwrap();
        let runtime = FakeRuntimeInspector::new().with_dns("default", "dev", "10.0.0.9");
        let control_plane = FakeControlPlaneClient::default();
        let driver = LifecycleDriver::new(
            &ops,
            &runtime,
            &control_plane,
            PolicySynthesizer::new(true, false),
            test_logger(),
        );

        let mut comp = basic_composition();
        comp.services.get_mut("web").unwrap().expose = vec!["9000".to_owned()];
        let mut view = CompositionView::new(&mut comp, None);
        driver.run(Event::Scale, &mut view, "vagrant").unwrap();

        assert!(view.service("web").unwrap().links.is_empty());
        assert!(view.service("web").unwrap().expose.is_empty());
        assert!(control_plane.live_objects().is_empty());
    }
}
