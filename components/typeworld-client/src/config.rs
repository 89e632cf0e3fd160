/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use crate::mothership::MOTHERSHIP;
use std::path::PathBuf;

/// Static configuration of a client instance.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Base URL of the central coordination server.
    pub mothership: String,
    /// Application identifier sent to publisher endpoints, checked
    /// against `allowedCommercialApps` for commercial builds.
    pub app_id: String,
    /// Version reported to the mothership and compared against breaking
    /// API versions.
    pub client_version: String,
    /// Go online during construction: download settings and open the
    /// push channel if required.
    pub online: bool,
    /// Subscribe to live update notifications over the message queue.
    pub live_notifications: bool,
    /// Testing mode; forwarded to the mothership and forces the push
    /// channel requirement.
    pub testing: bool,
    /// Commercial builds must be allow-listed by publisher endpoints.
    pub commercial: bool,
    /// Server probed by reachability checks.
    pub online_probe_url: String,
    /// Override for the per-OS fonts folder policy.
    pub fonts_folder: Option<PathBuf>,
    /// Shared secret for account creation on non-production motherships.
    pub secret_server_auth_key: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            mothership: MOTHERSHIP.to_string(),
            app_id: "world.type.headless".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            online: false,
            live_notifications: false,
            testing: false,
            commercial: false,
            online_probe_url: "https://type.world".to_string(),
            fonts_folder: None,
            secret_server_auth_key: None,
        }
    }
}
