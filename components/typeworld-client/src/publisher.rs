/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Publisher aggregation.
//!
//! A publisher groups the subscriptions that share one canonical
//! endpoint URL. It is a thin materialization of its preference record:
//! handles are hydrated on read and every mutation goes straight back to
//! the preferences store. A publisher exists exactly while it appears in
//! the `publishers` list and has at least one subscription.

use crate::client::{ClientInner, TypeWorldClient};
use crate::error::Result;
use crate::subscription::Subscription;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

/// The OS-conventional folder that installed font binaries go to.
pub fn default_fonts_folder() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        let windir = std::env::var("WINDIR").unwrap_or_else(|_| "C:\\Windows".to_string());
        return PathBuf::from(windir).join("Fonts");
    }
    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Fonts")
                .join("Type.World App");
        }
    }
    #[allow(unreachable_code)]
    std::env::temp_dir()
}

#[derive(Clone)]
pub struct Publisher {
    pub(crate) inner: Arc<ClientInner>,
    canonical_url: String,
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("canonical_url", &self.canonical_url)
            .finish()
    }
}

impl Publisher {
    pub(crate) fn new(inner: Arc<ClientInner>, canonical_url: impl Into<String>) -> Self {
        Publisher {
            inner,
            canonical_url: canonical_url.into(),
        }
    }

    pub fn canonical_url(&self) -> &str {
        &self.canonical_url
    }

    fn record_key(&self) -> String {
        format!("publisher({})", self.canonical_url)
    }

    pub(crate) fn get_value(&self, key: &str) -> Option<Value> {
        self.inner.prefs.get_object(&self.record_key()).get(key).cloned()
    }

    pub(crate) fn set_value(&self, key: &str, value: Value) {
        let mut record = self.inner.prefs.get_object(&self.record_key());
        record.insert(key.to_string(), value);
        self.inner.prefs.set(&self.record_key(), Value::Object(record));
    }

    /// Folder installed fonts are written to; an explicit configuration
    /// override wins over the per-OS policy.
    pub fn folder(&self) -> PathBuf {
        self.inner
            .config
            .fonts_folder
            .clone()
            .unwrap_or_else(default_fonts_folder)
    }

    /// Display name, taken from the first subscription's endpoint.
    pub fn name(&self, locales: &[&str]) -> String {
        for subscription in self.subscriptions() {
            if let Ok(command) = subscription.endpoint_command() {
                return command.name.get(locales).to_string();
            }
        }
        String::new()
    }

    pub(crate) fn subscription_urls(&self) -> Vec<String> {
        self.get_value("subscriptions")
            .and_then(|v| v.as_array().cloned())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub(crate) fn add_subscription_url(&self, url: &str) {
        let mut urls = self.subscription_urls();
        if !urls.iter().any(|existing| existing == url) {
            urls.push(url.to_string());
        }
        self.set_value("subscriptions", serde_json::json!(urls));
    }

    pub(crate) fn remove_subscription_url(&self, url: &str) {
        let urls: Vec<String> = self
            .subscription_urls()
            .into_iter()
            .filter(|existing| existing != url)
            .collect();
        self.set_value("subscriptions", serde_json::json!(urls));
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        let mut subscriptions = Vec::new();
        for url in self.subscription_urls() {
            match self.inner.protocol_for(&url) {
                Ok(protocol) => subscriptions.push(Subscription::new(
                    self.inner.clone(),
                    self.canonical_url.clone(),
                    url,
                    protocol,
                )),
                Err(e) => log::warn!("skipping subscription {}: {}", url, e),
            }
        }
        subscriptions
    }

    pub fn subscription(&self, unsecret_url: &str) -> Option<Subscription> {
        self.subscriptions()
            .into_iter()
            .find(|subscription| subscription.unsecret_url() == unsecret_url)
    }

    /// True while any of this publisher's subscriptions is mid-update.
    pub fn still_updating(&self) -> bool {
        let updating = self.inner.updating.lock();
        self.subscription_urls()
            .iter()
            .any(|url| updating.contains(url))
    }

    /// Distinct update problems across subscriptions, if any.
    pub fn updating_problem(&self) -> Option<Vec<String>> {
        let mut problems = Vec::new();
        for subscription in self.subscriptions() {
            if let Some(problem) = subscription.updating_problem() {
                if !problems.contains(&problem) {
                    problems.push(problem);
                }
            }
        }
        (!problems.is_empty()).then_some(problems)
    }

    /// Deduplicated union of installed fonts across subscriptions.
    pub fn installed_fonts(&self) -> Result<Vec<crate::catalog::Font>> {
        let mut fonts: Vec<crate::catalog::Font> = Vec::new();
        for subscription in self.subscriptions() {
            for font in subscription.installed_fonts()? {
                if !fonts.iter().any(|f| f.unique_id == font.unique_id) {
                    fonts.push(font);
                }
            }
        }
        Ok(fonts)
    }

    pub fn amount_installed_fonts(&self) -> Result<usize> {
        Ok(self.installed_fonts()?.len())
    }

    /// Deduplicated ids of installed fonts with a newer version in the
    /// catalog.
    pub fn outdated_fonts(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = Vec::new();
        for subscription in self.subscriptions() {
            for id in subscription.outdated_fonts()? {
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
        }
        Ok(ids)
    }

    pub fn amount_outdated_fonts(&self) -> Result<usize> {
        Ok(self.outdated_fonts()?.len())
    }

    /// Update every subscription; the first failure short-circuits.
    pub fn update(&self) -> Result<bool> {
        let client = TypeWorldClient::from_inner(self.inner.clone());
        if !client.online(None) {
            return Err(crate::error::ClientError::response("notOnline"));
        }
        let mut changes = false;
        for subscription in self.subscriptions() {
            changes |= subscription.update()?;
        }
        Ok(changes)
    }

    /// Cached resource fetch, recorded in this publisher's membership
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

    /// Record this publisher in the `publishers` list.
    pub(crate) fn save(&self) {
        let mut publishers = self.inner.prefs.get_string_list("publishers");
        if !publishers.iter().any(|url| url == &self.canonical_url) {
            publishers.push(self.canonical_url.clone());
        }
        self.inner.prefs.set("publishers", serde_json::json!(publishers));
    }

    /// Delete this publisher and everything it owns.
    pub fn delete(&self) -> Result<()> {
        for subscription in self.subscriptions() {
            subscription.delete_opts(true, false)?;
        }

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
        let publishers: Vec<String> = self
            .inner
            .prefs
            .get_string_list("publishers")
            .into_iter()
            .filter(|url| url != &self.canonical_url)
            .collect();
        self.inner.prefs.set("publishers", serde_json::json!(publishers));

        let client = TypeWorldClient::from_inner(self.inner.clone());
        let _ = client.upload_subscriptions();
        self.inner.delegate.publisher_has_been_deleted(&self.canonical_url);
        client.manage_message_queue_connection();
        Ok(())
    }
}
