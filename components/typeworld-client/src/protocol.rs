/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The pluggable protocol capability.
//!
//! A [`Protocol`] knows how to talk to one flavor of publisher endpoint:
//! discover endpoint metadata, list installable fonts, push-install and
//! push-uninstall fonts, and refresh its cached catalog. The core treats
//! a protocol as an opaque handle attached to a subscription and never
//! parses wire payloads itself. Implementations are selected through the
//! [`ProtocolRegistry`] by the inner protocol token of the subscription
//! URL and instantiated lazily.

use crate::catalog::{
    EndpointCommand, InstallFontsResponse, InstallableFontsCommand, RootCommand,
    UninstallFontsResponse,
};
use crate::error::{ClientError, Result};
use crate::keyring::KeyringHandle;
use crate::prefs::Preferences;
use crate::urls::SubscriptionUrl;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Client-side facilities handed to a protocol at construction, so an
/// implementation can persist its command caches next to the rest of the
/// subscription record and keep endpoint secrets in the keyring.
#[derive(Clone)]
pub struct ProtocolContext {
    pub prefs: Preferences,
    pub keyring: KeyringHandle,
}

/// Identity material passed along with the pre-add health probe.
pub struct HealthProbe<'a> {
    pub anonymous_app_id: &'a str,
    pub anonymous_user_id: &'a str,
    pub access_token: &'a str,
    pub test_scenario: Option<&'a str>,
}

pub trait Protocol: Send {
    fn url(&self) -> &SubscriptionUrl;

    /// The secret form of this subscription's URL. Implementations that
    /// keep the secret in the keyring substitute it back in here; the
    /// default only works while the parsed URL still carries the secret.
    fn secret_url(&self) -> String {
        self.url().secret_url()
    }

    /// Health check run before a subscription is added; a failure aborts
    /// the add.
    fn about_to_add_subscription(&mut self, probe: &HealthProbe<'_>) -> Result<()>;

    fn endpoint_command(&mut self) -> Result<EndpointCommand>;

    fn root_command(&mut self) -> Result<RootCommand>;

    /// The current catalog, served from the local cache.
    fn installable_fonts_command(&mut self) -> Result<InstallableFontsCommand>;

    /// Request font binaries for `(font id, version)` pairs.
    /// `update_subscription` is set when any target takes part in seat
    /// accounting, so the endpoint refreshes its records.
    fn install_fonts(
        &mut self,
        fonts: &[(String, String)],
        update_subscription: bool,
    ) -> Result<InstallFontsResponse>;

    /// Report font removals to the endpoint (seat bookkeeping for
    /// protected fonts).
    fn remove_fonts(
        &mut self,
        font_ids: &[String],
        update_subscription: bool,
    ) -> Result<UninstallFontsResponse>;

    /// Refresh the cached catalog from the endpoint. Returns whether the
    /// catalog changed.
    fn update(&mut self) -> Result<bool>;

    fn set_secret_key(&mut self, secret: &str) -> Result<()>;

    fn delete_secret_key(&mut self) -> Result<()>;

    /// Called once after the owning subscription has been added and saved.
    fn subscription_added(&mut self) {}
}

impl std::fmt::Debug for dyn Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Protocol")
            .field("url", self.url())
            .finish()
    }
}

/// A protocol attached to a subscription, shared between the orchestrator
/// and the push listener.
pub type SharedProtocol = Arc<Mutex<Box<dyn Protocol>>>;

pub trait ProtocolFactory: Send + Sync {
    fn create(&self, url: &SubscriptionUrl, context: ProtocolContext) -> Result<Box<dyn Protocol>>;
}

impl<F> ProtocolFactory for F
where
    F: Fn(&SubscriptionUrl, ProtocolContext) -> Result<Box<dyn Protocol>> + Send + Sync,
{
    fn create(&self, url: &SubscriptionUrl, context: ProtocolContext) -> Result<Box<dyn Protocol>> {
        self(url, context)
    }
}

/// Maps inner protocol tokens (`json`, ...) to factories. The registry is
/// seeded by the embedding application; resolving an unregistered token
/// is an error.
#[derive(Default)]
pub struct ProtocolRegistry {
    factories: Mutex<HashMap<String, Arc<dyn ProtocolFactory>>>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, factory: Arc<dyn ProtocolFactory>) {
        self.factories.lock().insert(name.into(), factory);
    }

    pub fn knows(&self, name: &str) -> bool {
        self.factories.lock().contains_key(name)
    }

    pub fn create(&self, url: &SubscriptionUrl, context: ProtocolContext) -> Result<Box<dyn Protocol>> {
        let factory = self
            .factories
            .lock()
            .get(&url.protocol)
            .cloned()
            .ok_or_else(|| ClientError::UnknownProtocol(url.protocol.clone()))?;
        factory.create(url, context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FixturePublisher;

    #[test]
    fn test_unknown_protocol_is_rejected() {
        let registry = ProtocolRegistry::new();
        let url = SubscriptionUrl::parse("typeworld://json+https//fonts.example.com/api/").unwrap();
        let context = ProtocolContext {
            prefs: Preferences::in_memory(),
            keyring: KeyringHandle::in_memory(),
        };
        let err = registry.create(&url, context).unwrap_err();
        assert!(matches!(err, ClientError::UnknownProtocol(name) if name == "json"));
    }

    #[test]
    fn test_registered_factory_resolves() {
        let registry = ProtocolRegistry::new();
        let publisher = FixturePublisher::new("https://fonts.example.com/api/");
        registry.register("json", publisher.factory());
        assert!(registry.knows("json"));

        let url = SubscriptionUrl::parse("typeworld://json+https//fonts.example.com/api/").unwrap();
        let context = ProtocolContext {
            prefs: Preferences::in_memory(),
            keyring: KeyringHandle::in_memory(),
        };
        let mut protocol = registry.create(&url, context).unwrap();
        assert_eq!(
            protocol.endpoint_command().unwrap().canonical_url,
            "https://fonts.example.com/api/"
        );
    }
}
