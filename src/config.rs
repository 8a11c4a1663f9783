// Copyright Pit Kleyersburg <pitkley@googlemail.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified or distributed
// except according to those terms.

//! Process-wide engine configuration, threaded explicitly into [`crate::lifecycle::LifecycleDriver`]
//! rather than read from a singleton. Generalizes the `Defaults`/global-options config section the
//! rest of the crate's sibling projects carry.

use derive_builder::Builder;
use std::path::PathBuf;

/// Default base URL the control plane is reachable at, per §6.
pub const DEFAULT_CONTROL_PLANE_URL: &str = "http://netmaster:9999";
/// Default path the operator-policy document is read from, per §6.
pub const DEFAULT_OPS_PATH: &str = "./ops.json";

/// Engine-wide configuration: where the control plane lives, where the operator-policy document
/// is, and the toggles the Design Notes call out (default-policy mode, contract-mode naming).
///
/// Built via [`EngineConfigBuilder`] so an entry-point only needs to override the fields it cares
/// about; every other field falls back to [`EngineConfig::default`].
#[derive(Builder, Clone, Debug, Eq, PartialEq)]
#[builder(default, setter(into))]
pub struct EngineConfig {
    /// Base URL of the control-plane REST surface, e.g. `http://netmaster:9999`.
    pub control_plane_url: String,
    /// Path to the operator-policy JSON document.
    pub operator_policy_path: PathBuf,
    /// Whether the default-deny-in/allow-all-out fallback policy (§4.5, phase 3) is synthesized
    /// for services untouched by links- or expose-based rules. Off by default, matching the
    /// original; see `DESIGN.md`.
    pub default_policy_mode: bool,
    /// Whether links-based allow rules name the concrete source endpoint group
    /// (`Naming::from_epg_name`) or leave the rule scoped only by `from_network`.
    pub contract_mode: bool,
    /// Optional override for the container-runtime connection (e.g. `unix:///var/run/docker.sock`
    /// or a TCP `DOCKER_HOST`-style address); `None` uses the runtime client's own default.
    #[builder(setter(into, strip_option))]
    pub docker_host: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            control_plane_url: DEFAULT_CONTROL_PLANE_URL.to_owned(),
            operator_policy_path: PathBuf::from(DEFAULT_OPS_PATH),
            default_policy_mode: false,
            contract_mode: true,
            docker_host: None,
        }
    }
}
