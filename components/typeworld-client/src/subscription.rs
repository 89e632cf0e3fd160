/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The subscription engine.
//!
//! A subscription is one credentialed channel to a publisher, identified
//! by its unsecret URL. It installs and uninstalls font binaries,
//! derives installation state from the filesystem, refreshes its cached
//! catalog through its protocol, and reacts to push notifications.
//!
//! An installed font lives at `<fonts folder>/<uniqueID>-<filename>`,
//! where `uniqueID` is this subscription's persisted ten-character id.
//! That prefix is the only attribution between files and subscriptions;
//! there is no separate index.

use crate::catalog::{EndpointCommand, Family, Font, InstallableFontsCommand};
use crate::client::{ClientInner, TypeWorldClient};
use crate::error::{ClientError, Result};
use crate::protocol::SharedProtocol;
use crate::publisher::Publisher;
use crate::push;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Clone)]
pub struct Subscription {
    pub(crate) inner: Arc<ClientInner>,
    canonical_url: String,
    url: String,
    pub(crate) protocol: SharedProtocol,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("canonical_url", &self.canonical_url)
            .field("url", &self.url)
            .finish()
    }
}

impl Subscription {
    pub(crate) fn new(
        inner: Arc<ClientInner>,
        canonical_url: String,
        url: String,
        protocol: SharedProtocol,
    ) -> Self {
        Subscription {
            inner,
            canonical_url,
            url,
            protocol,
        }
    }

    /// The unsecret URL, the identity of this subscription.
    pub fn unsecret_url(&self) -> &str {
        &self.url
    }

    pub fn publisher(&self) -> Publisher {
        Publisher::new(self.inner.clone(), self.canonical_url.clone())
    }

    fn record_key(&self) -> String {
        format!("subscription({})", self.url)
    }

    pub(crate) fn get_value(&self, key: &str) -> Option<Value> {
        self.inner.prefs.get_object(&self.record_key()).get(key).cloned()
    }

    pub(crate) fn set_value(&self, key: &str, value: Value) {
        let mut record = self.inner.prefs.get_object(&self.record_key());
        record.insert(key.to_string(), value);
        self.inner.prefs.set(&self.record_key(), Value::Object(record));
    }

    /// Persisted opaque id prefixed to every installed font file.
    /// Assigned on first use.
    pub fn unique_id(&self) -> String {
        if let Some(id) = self.get_value("uniqueID").and_then(|v| v.as_str().map(str::to_string)) {
            return id;
        }
        let id: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(10)
            .map(char::from)
            .collect();
        self.set_value("uniqueID", Value::String(id.clone()));
        id
    }

    pub fn accepted_terms_of_service(&self) -> bool {
        self.get_value("acceptedTermsOfService")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    pub fn set_accepted_terms_of_service(&self, accepted: bool) {
        self.set_value("acceptedTermsOfService", Value::Bool(accepted));
    }

    pub fn reveal_identity(&self) -> bool {
        self.get_value("revealIdentity")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    pub fn set_reveal_identity(&self, reveal: bool) {
        self.set_value("revealIdentity", Value::Bool(reveal));
    }

    pub fn server_timestamp(&self) -> Option<i64> {
        self.get_value("serverTimestamp").and_then(|v| v.as_i64())
    }

    pub(crate) fn set_server_timestamp(&self, timestamp: i64) {
        self.set_value("serverTimestamp", Value::Number(timestamp.into()));
    }

    /// Message-queue topic for this subscription's live notifications.
    pub fn push_topic(&self) -> String {
        let short = self.protocol.lock().url().short_unsecret_url();
        push::subscription_topic(&short)
    }

    pub(crate) fn secret_url(&self) -> String {
        self.protocol.lock().secret_url()
    }

    pub fn endpoint_command(&self) -> Result<EndpointCommand> {
        self.protocol.lock().endpoint_command()
    }

    fn catalog(&self) -> Result<InstallableFontsCommand> {
        self.protocol.lock().installable_fonts_command()
    }

    pub fn name(&self, locales: &[&str]) -> String {
        match self.catalog() {
            Ok(catalog) => {
                let name = catalog.name.get(locales);
                if name.is_empty() {
                    "#(Unnamed)".to_string()
                } else {
                    name.to_string()
                }
            }
            Err(_) => "#(Unnamed)".to_string(),
        }
    }

    pub fn foundries(&self) -> Result<Vec<crate::catalog::Foundry>> {
        Ok(self.catalog()?.foundries)
    }

    pub fn family_by_id(&self, family_id: &str) -> Result<Option<Family>> {
        Ok(self.catalog()?.family_by_id(family_id).cloned())
    }

    pub fn font_by_id(&self, font_id: &str) -> Result<Option<Font>> {
        Ok(self.catalog()?.font_by_id(font_id).map(|(_, font)| font.clone()))
    }

    pub fn has_protected_fonts(&self) -> Result<bool> {
        Ok(self.catalog()?.fonts().any(|(_, font)| font.protected))
    }

    /// Cached resource fetch, recorded in this subscription's membership
    /// list for cascading deletion.
    pub fn resource_by_url(
        &self,
        url: &str,
        binary: bool,
        update: bool,
    ) -> Result<(String, String)> {
        let result = self.inner.cache.resource_by_url(url, binary, update)?;
        let mut resources = self
            .get_value("resources")
            .and_then(|v| v.as_array().cloned())
            .unwrap_or_default();
        if !resources.iter().any(|existing| existing.as_str() == Some(url)) {
            resources.push(Value::String(url.to_string()));
            self.set_value("resources", Value::Array(resources));
        }
        Ok(result)
    }

    // -- Installation state ------------------------------------------------

    fn font_path(&self, folder: &Path, font: &Font, version: &str) -> PathBuf {
        folder.join(format!("{}-{}", self.unique_id(), font.filename(version)))
    }

    fn installed_version(&self, folder: &Path, family: &Family, font: &Font) -> Option<String> {
        for version in family.versions_for(font) {
            if self.font_path(folder, font, &version.number).exists() {
                return Some(version.number.clone());
            }
        }
        None
    }

    /// The installed version of a font, derived from filesystem
    /// presence, or `None` when the font is not installed.
    pub fn installed_font_version(&self, font_id: &str) -> Result<Option<String>> {
        let catalog = self.catalog()?;
        let folder = self.publisher().folder();
        Ok(catalog
            .font_by_id(font_id)
            .and_then(|(family, font)| self.installed_version(&folder, family, font)))
    }

    pub fn installed_fonts(&self) -> Result<Vec<Font>> {
        let catalog = self.catalog()?;
        let folder = self.publisher().folder();
        Ok(catalog
            .fonts()
            .filter(|(family, font)| self.installed_version(&folder, family, font).is_some())
            .map(|(_, font)| font.clone())
            .collect())
    }

    pub fn amount_installed_fonts(&self) -> Result<usize> {
        Ok(self.installed_fonts()?.len())
    }

    /// Installed fonts that carry an expiry date.
    pub fn expiring_installed_fonts(&self) -> Result<Vec<Font>> {
        let catalog = self.catalog()?;
        let folder = self.publisher().folder();
        Ok(catalog
            .fonts()
            .filter(|(family, font)| {
                font.expiry.is_some()
                    && self.installed_version(&folder, family, font).is_some()
            })
            .map(|(_, font)| font.clone())
            .collect())
    }

    /// Ids of installed fonts whose installed version is no longer the
    /// newest the publisher advertises.
    pub fn outdated_fonts(&self) -> Result<Vec<String>> {
        let catalog = self.catalog()?;
        let folder = self.publisher().folder();
        let mut ids = Vec::new();
        for (family, font) in catalog.fonts() {
            if let Some(installed) = self.installed_version(&folder, family, font) {
                let latest = family
                    .versions_for(font)
                    .last()
                    .map(|v| v.number.clone())
                    .unwrap_or_default();
                if installed != latest && !ids.contains(&font.unique_id) {
                    ids.push(font.unique_id.clone());
                }
            }
        }
        Ok(ids)
    }

    pub fn amount_outdated_fonts(&self) -> Result<usize> {
        Ok(self.outdated_fonts()?.len())
    }

    // -- Install / uninstall -----------------------------------------------

    /// Install `(font id, version)` pairs.
    ///
    /// Requires previously accepted terms of service. The endpoint is
    /// told to refresh its subscription records whenever any target
    /// takes part in seat accounting (protected or expiring fonts).
    pub fn install_fonts(&self, fonts: &[(String, String)]) -> Result<()> {
        if !self.accepted_terms_of_service() {
            return Err(ClientError::response("termsOfServiceNotAccepted"));
        }

        let catalog = self.catalog()?;
        let folder = self.publisher().folder();
        let mut requires_seat_accounting = false;
        let mut targets: Vec<(Font, String, PathBuf)> = Vec::new();

        for (font_id, version) in fonts {
            let (_, font) = catalog.font_by_id(font_id).ok_or_else(|| {
                ClientError::message(format!("Font {} not found in catalog", font_id))
            })?;
            if font.protected || font.expiry.is_some() || font.expiry_duration.is_some() {
                requires_seat_accounting = true;
            }
            let path = self.font_path(&folder, font, version);
            self.inner.delegate.font_will_install(font);

            if let Err(e) = probe_write_permission(&path) {
                log::warn!("write probe failed for {:?}: {}", path, e);
                let err = ClientError::message("Insufficient permission to install font.");
                self.inner.delegate.font_has_installed(false, Some(&err), font);
                return Err(err);
            }
            targets.push((font.clone(), version.clone(), path));
        }

        let response = self
            .protocol
            .lock()
            .install_fonts(fonts, requires_seat_accounting);
        let payload = match response {
            Ok(payload) => payload,
            Err(e) => {
                for (font, _, _) in &targets {
                    self.inner.delegate.font_has_installed(false, Some(&e), font);
                }
                return Err(e);
            }
        };

        if payload.assets.is_empty() {
            return Err(ClientError::message(format!(
                "No fonts to install in .assets, expected {} assets",
                targets.len()
            )));
        }
        for (font_id, version) in fonts {
            let present = payload
                .assets
                .iter()
                .any(|asset| &asset.unique_id == font_id && &asset.version == version);
            if !present {
                return Err(ClientError::message(format!(
                    "Font {} with version {} not found in assets",
                    font_id, version
                )));
            }
        }

        for asset in &payload.assets {
            let Some((font, _, path)) = targets
                .iter()
                .find(|(font, _, _)| font.unique_id == asset.unique_id)
            else {
                continue;
            };

            if asset.response == "error" {
                return Err(ClientError::message(
                    asset.error_message.clone().unwrap_or_default(),
                ));
            }
            if asset.response != "success" {
                return Err(ClientError::response(asset.response.clone()));
            }

            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            if let (Some(data), Some(_)) = (&asset.data, &asset.encoding) {
                let binary = BASE64
                    .decode(data)
                    .map_err(|e| ClientError::message(format!("Base64 decode error: {}", e)))?;
                std::fs::write(path, binary)?;
            } else if let Some(data_url) = &asset.data_url {
                let response = self.inner.http.get(data_url).send()?;
                if !response.status().is_success() {
                    return Err(ClientError::HttpStatus(response.status().as_u16()));
                }
                std::fs::write(path, response.bytes()?)?;
            } else {
                return Err(ClientError::message(format!(
                    "Font {} came with neither data nor dataURL",
                    asset.unique_id
                )));
            }
            self.inner.delegate.font_has_installed(true, None, font);
        }

        self.register_endpoint_once();
        Ok(())
    }

    /// Uninstall fonts by id.
    pub fn remove_fonts(&self, font_ids: &[String]) -> Result<()> {
        self.remove_fonts_opts(font_ids, false, true)
    }

    /// Uninstall with explicit options. Protected fonts are reported to
    /// the publisher first; only assets the server confirms are removed
    /// locally. `dry_run` skips all filesystem mutation and is used when
    /// the server already considers this app instance revoked.
    pub(crate) fn remove_fonts_opts(
        &self,
        font_ids: &[String],
        dry_run: bool,
        update_subscription: bool,
    ) -> Result<()> {
        let catalog = self.catalog()?;
        let folder = self.publisher().folder();

        let mut protected_ids: Vec<String> = Vec::new();
        let mut unprotected_ids: Vec<String> = Vec::new();

        for font_id in font_ids {
            let (family, font) = catalog.font_by_id(font_id).ok_or_else(|| {
                ClientError::message(format!("Font {} not found in catalog", font_id))
            })?;
            let path = self
                .installed_version(&folder, family, font)
                .map(|version| self.font_path(&folder, font, &version));
            if path.is_none() && !dry_run {
                return Err(ClientError::message(
                    "Font path couldn’t be determined (preflight)",
                ));
            }

            self.inner.delegate.font_will_uninstall(font);

            if !dry_run {
                if let Some(path) = &path {
                    if let Err(e) = probe_write_permission(path) {
                        log::warn!("write probe failed for {:?}: {}", path, e);
                        let err =
                            ClientError::message("Insufficient permission to uninstall font.");
                        self.inner.delegate.font_has_uninstalled(false, Some(&err), font);
                        return Err(err);
                    }
                }
            }

            if font.protected {
                protected_ids.push(font_id.clone());
            } else {
                unprotected_ids.push(font_id.clone());
            }
        }

        // Protected fonts round-trip through the publisher before any
        // local file goes away.
        if !protected_ids.is_empty() {
            let response = self
                .protocol
                .lock()
                .remove_fonts(&protected_ids, update_subscription);
            let payload = match response {
                Ok(payload) => payload,
                Err(e) => {
                    for font_id in &protected_ids {
                        if let Some((_, font)) = catalog.font_by_id(font_id) {
                            self.inner.delegate.font_has_uninstalled(false, Some(&e), font);
                        }
                    }
                    return Err(e);
                }
            };

            if payload.assets.is_empty() {
                return Err(ClientError::message(format!(
                    "No fonts to uninstall in .assets, expected {} assets",
                    protected_ids.len()
                )));
            }

            for asset in &payload.assets {
                if !font_ids.iter().any(|id| id == &asset.unique_id) {
                    continue;
                }
                match asset.response.as_str() {
                    // The server no longer knows the installation; the
                    // font is as gone as it will get.
                    "unknownInstallation" | "unknownFont" => {}
                    "error" => {
                        return Err(ClientError::message(
                            asset.error_message.clone().unwrap_or_default(),
                        ))
                    }
                    "success" => {
                        let (family, font) = catalog
                            .font_by_id(&asset.unique_id)
                            .expect("asset id was matched against the request");
                        let path = self
                            .installed_version(&folder, family, font)
                            .map(|version| self.font_path(&folder, font, &version));
                        if path.is_none() && !dry_run {
                            return Err(ClientError::message(
                                "Font path couldn’t be determined (deleting protected fonts)",
                            ));
                        }
                        if !dry_run {
                            std::fs::remove_file(path.expect("checked above"))?;
                        }
                        self.inner.delegate.font_has_uninstalled(true, None, font);
                    }
                    other => return Err(ClientError::response(other.to_string())),
                }
            }
        }

        // Unprotected fonts come off disk unconditionally.
        for font_id in &unprotected_ids {
            let (family, font) = catalog
                .font_by_id(font_id)
                .expect("partitioned from the request");
            let path = self
                .installed_version(&folder, family, font)
                .map(|version| self.font_path(&folder, font, &version));
            if path.is_none() && !dry_run {
                return Err(ClientError::message(
                    "Font path couldn’t be determined (deleting unprotected fonts)",
                ));
            }
            if !dry_run {
                std::fs::remove_file(path.expect("checked above"))?;
            }
            self.inner.delegate.font_has_uninstalled(true, None, font);
        }

        Ok(())
    }

    // -- Updates -----------------------------------------------------------

    /// Refresh the cached catalog. Updates for the same subscription are
    /// serialized, whether they come from the user, a queue drain, or a
    /// push notification.
    pub fn update(&self) -> Result<bool> {
        let guard = self.inner.update_guard(&self.url);
        let _serialized = guard.lock();
        self.inner.updating.lock().insert(self.url.clone());

        let domain = {
            let protocol = self.protocol.lock();
            protocol.url().rest.clone()
        };
        let domain = domain.split('/').next().unwrap_or_default().to_string();

        let client = TypeWorldClient::from_inner(self.inner.clone());
        if !client.online(Some(&domain)) {
            self.inner.updating.lock().remove(&self.url);
            let problem = ClientError::response("serverNotReachable");
            self.inner
                .updating_problems
                .lock()
                .insert(self.url.clone(), problem.to_string());
            self.inner
                .delegate
                .subscription_has_been_updated(&self.url, false, Some(&problem), false);
            return Err(problem);
        }

        self.inner.delegate.subscription_will_update(&self.url);
        self.register_endpoint_once();

        let result = self.protocol.lock().update();
        self.inner.updating.lock().remove(&self.url);
        self.inner.updating_problems.lock().remove(&self.url);

        match result {
            Ok(changes) => {
                if changes {
                    self.save();
                }
                self.inner
                    .delegate
                    .subscription_has_been_updated(&self.url, true, None, changes);
                Ok(changes)
            }
            Err(e) => {
                self.inner
                    .delegate
                    .subscription_has_been_updated(&self.url, false, Some(&e), false);
                Err(e)
            }
        }
    }

    pub fn still_updating(&self) -> bool {
        self.inner.updating.lock().contains(&self.url)
    }

    pub fn updating_problem(&self) -> Option<String> {
        self.inner.updating_problems.lock().get(&self.url).cloned()
    }

    // -- Invitations -------------------------------------------------------

    /// Invite another user to this subscription.
    pub fn invite_user(&self, target_email: &str) -> Result<()> {
        let client = TypeWorldClient::from_inner(self.inner.clone());
        if !client.online(None) {
            return Err(ClientError::response("notOnline"));
        }
        let source_email = client
            .user_email()
            .ok_or_else(|| ClientError::message("No source user linked."))?;
        self.inner.mothership.invite_user_to_subscription(
            &client.request_context(),
            target_email,
            &source_email,
            &self.secret_url(),
        )
    }

    /// Take a previously granted invitation back.
    pub fn revoke_user(&self, target_email: &str) -> Result<()> {
        let client = TypeWorldClient::from_inner(self.inner.clone());
        if !client.online(None) {
            return Err(ClientError::response("notOnline"));
        }
        let source_email = client.user_email().unwrap_or_default();
        self.inner.mothership.revoke_subscription_invitation(
            &client.request_context(),
            target_email,
            &source_email,
            &self.secret_url(),
        )
    }

    /// Whether this subscription arrived through an accepted invitation.
    pub fn invitation_accepted(&self) -> bool {
        let client = TypeWorldClient::from_inner(self.inner.clone());
        if client.user().is_empty() {
            return false;
        }
        client
            .accepted_invitations()
            .iter()
            .any(|invitation| invitation.url == self.url)
    }

    // -- Lifecycle ---------------------------------------------------------

    /// Record this subscription under its publisher and subscribe its
    /// push topic.
    pub(crate) fn save(&self) {
        self.publisher().add_subscription_url(&self.url);
        if self.inner.config.live_notifications {
            self.inner.push.register_topic(&self.push_topic());
        }
    }

    /// Touch `registerAPIEndpoint` once per endpoint for discoverability.
    /// Fire-and-forget; failures are logged, never surfaced.
    pub(crate) fn register_endpoint_once(&self) {
        let client = TypeWorldClient::from_inner(self.inner.clone());
        if !client.user().is_empty() {
            return;
        }
        {
            let mut registered = self.inner.endpoints_registered.lock();
            if registered.contains(&self.canonical_url) {
                return;
            }
            registered.insert(self.canonical_url.clone());
        }
        let token = {
            let protocol = self.protocol.lock();
            protocol.url().protocol.clone()
        };
        let endpoint_url = format!(
            "typeworld://{}+{}",
            token,
            self.canonical_url.replace("://", "//")
        );
        let inner = self.inner.clone();
        std::thread::spawn(move || {
            let context = TypeWorldClient::from_inner(inner.clone()).request_context();
            if let Err(e) = inner.mothership.register_api_endpoint(&context, &endpoint_url) {
                log::info!("registerAPIEndpoint for {} failed: {}", endpoint_url, e);
            }
        });
    }

    /// Delete this subscription: uninstall its fonts, drop its secret,
    /// unsubscribe its push topic, purge cached resources, and detach
    /// from the publisher.
    pub fn delete(&self) -> Result<()> {
        self.delete_opts(false, true)
    }

    pub(crate) fn delete_opts(
        &self,
        called_from_parent: bool,
        update_subscriptions_on_server: bool,
    ) -> Result<()> {
        if let Ok(catalog) = self.catalog() {
            for (_, font) in catalog.fonts() {
                let _ = self.remove_fonts(&[font.unique_id.clone()]);
            }
        }

        {
            let _ = self.protocol.lock().delete_secret_key();
        }

        self.inner.push.unregister_topic(&self.push_topic());

        let resources: Vec<String> = self
            .get_value("resources")
            .and_then(|v| v.as_array().cloned())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        self.inner.cache.delete_resources(&resources);

        self.inner.prefs.remove(&self.record_key());

        let publisher = self.publisher();
        publisher.remove_subscription_url(&self.url);
        self.inner.protocols.lock().remove(&self.url);

        if publisher.subscription_urls().is_empty() && !called_from_parent {
            publisher.delete()?;
        }

        self.inner.delegate.subscription_has_been_deleted(&self.url);

        let client = TypeWorldClient::from_inner(self.inner.clone());
        client.manage_message_queue_connection();
        if update_subscriptions_on_server {
            let _ = client.upload_subscriptions();
        }
        Ok(())
    }
}

/// Verify we may write at `path` by creating and deleting a probe file
/// next to it.
fn probe_write_permission(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let probe = PathBuf::from(format!("{}.test", path.display()));
    std::fs::write(&probe, "test")?;
    std::fs::remove_file(&probe)?;
    Ok(())
}
