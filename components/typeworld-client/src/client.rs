/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The client orchestrator.
//!
//! [`TypeWorldClient`] is the top-level object: it owns the preferences,
//! the keyring, the protocol registry, the mothership connection, the
//! deferred command queue, and the push channel, and it materializes
//! publishers and subscriptions on demand. All mothership-bound work
//! funnels through [`TypeWorldClient::perform_commands`], which no-ops
//! while offline and otherwise drains the queue in its fixed order.

use crate::cache::ResourceCache;
use crate::catalog::{EndpointCommand, Font};
use crate::config::ClientConfig;
use crate::delegate::{Delegate, DelegateCallbacks};
use crate::error::{ClientError, Result};
use crate::keyring::{self, Keyring, KeyringHandle};
use crate::mothership::{
    AppInstance, DownloadSubscriptionsResponse, DownloadedSettings, Mothership, RequestContext,
};
use crate::prefs::{PreferenceBackend, Preferences};
use crate::protocol::{
    HealthProbe, Protocol, ProtocolContext, ProtocolFactory, ProtocolRegistry, SharedProtocol,
};
use crate::publisher::Publisher;
use crate::push::{self, InMemoryBroker, MessageTransport, PushChannel, PushMessage};
use crate::queue::{self, CommandKind, CommandQueue};
use crate::subscription::Subscription;
use crate::urls::{url_is_valid, SubscriptionUrl};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// A successful reachability probe is trusted for this long.
const ONLINE_CHECK_TTL: Duration = Duration::from_secs(10);

/// An invitation record as mirrored from the mothership. Fields the
/// server sent as `null` are normalized to empty strings before storage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Invitation {
    pub url: String,
    #[serde(rename = "ID")]
    pub id: String,
    pub invited_by_user_name: String,
    pub invited_by_user_email: String,
    #[serde(rename = "canonicalURL")]
    pub canonical_url: String,
    pub publisher_name: String,
    pub subscription_name: String,
    #[serde(rename = "logoURL")]
    pub logo_url: String,
    pub time: Value,
}

pub(crate) struct ClientInner {
    pub(crate) config: ClientConfig,
    pub(crate) prefs: Preferences,
    pub(crate) keyring: KeyringHandle,
    pub(crate) delegate: Arc<Delegate>,
    pub(crate) registry: ProtocolRegistry,
    pub(crate) mothership: Mothership,
    pub(crate) http: reqwest::blocking::Client,
    pub(crate) cache: ResourceCache,
    pub(crate) queue: CommandQueue,
    pub(crate) push: PushChannel,
    /// Protocol instances, lazily created and cached per unsecret URL.
    pub(crate) protocols: Mutex<HashMap<String, SharedProtocol>>,
    /// Serializes updates per subscription URL.
    update_guards: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    pub(crate) updating: Mutex<HashSet<String>>,
    pub(crate) updating_problems: Mutex<HashMap<String, String>>,
    sync_problems: Mutex<Vec<String>>,
    online_checks: Mutex<HashMap<String, Instant>>,
    pub(crate) endpoints_registered: Mutex<HashSet<String>>,
    test_scenario: Mutex<Option<String>>,
}

impl ClientInner {
    pub(crate) fn protocol_context(&self) -> ProtocolContext {
        ProtocolContext {
            prefs: self.prefs.clone(),
            keyring: self.keyring.clone(),
        }
    }

    /// The cached protocol for a stored subscription, hydrating it
    /// through the registry on first use.
    pub(crate) fn protocol_for(&self, unsecret_url: &str) -> Result<SharedProtocol> {
        if let Some(protocol) = self.protocols.lock().get(unsecret_url) {
            return Ok(protocol.clone());
        }
        let parsed = SubscriptionUrl::parse(unsecret_url)?;
        let protocol = self.registry.create(&parsed, self.protocol_context())?;
        let shared: SharedProtocol = Arc::new(Mutex::new(protocol));
        self.protocols
            .lock()
            .insert(unsecret_url.to_string(), shared.clone());
        Ok(shared)
    }

    pub(crate) fn store_protocol(
        &self,
        unsecret_url: &str,
        protocol: Box<dyn Protocol>,
    ) -> SharedProtocol {
        let shared: SharedProtocol = Arc::new(Mutex::new(protocol));
        self.protocols
            .lock()
            .insert(unsecret_url.to_string(), shared.clone());
        shared
    }

    pub(crate) fn update_guard(&self, url: &str) -> Arc<Mutex<()>> {
        self.update_guards
            .lock()
            .entry(url.to_string())
            .or_default()
            .clone()
    }
}

pub struct ClientBuilder {
    config: ClientConfig,
    preferences: Option<Box<dyn PreferenceBackend>>,
    keyring: Option<Box<dyn Keyring>>,
    registry: ProtocolRegistry,
    transport: Option<Box<dyn MessageTransport>>,
    callbacks: DelegateCallbacks,
}

impl ClientBuilder {
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn preferences(mut self, backend: Box<dyn PreferenceBackend>) -> Self {
        self.preferences = Some(backend);
        self
    }

    pub fn keyring(mut self, keyring: Box<dyn Keyring>) -> Self {
        self.keyring = Some(keyring);
        self
    }

    pub fn register_protocol(
        self,
        name: impl Into<String>,
        factory: Arc<dyn ProtocolFactory>,
    ) -> Self {
        self.registry.register(name, factory);
        self
    }

    pub fn transport(mut self, transport: Box<dyn MessageTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn callbacks(mut self, callbacks: DelegateCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn build(self) -> Result<TypeWorldClient> {
        let prefs = Preferences::new(
            self.preferences
                .unwrap_or_else(|| Box::new(crate::prefs::MemoryBackend::new())),
        );
        let keyring = self
            .keyring
            .map(KeyringHandle::new)
            .unwrap_or_else(KeyringHandle::in_memory);
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        let mothership = Mothership::new(self.config.mothership.clone(), http.clone());
        let cache = ResourceCache::new(prefs.clone(), http.clone());
        let queue = CommandQueue::new(prefs.clone());
        let transport = self
            .transport
            .unwrap_or_else(|| InMemoryBroker::new().transport());

        let inner = Arc::new(ClientInner {
            config: self.config,
            prefs,
            keyring,
            delegate: Arc::new(Delegate::new(self.callbacks)),
            registry: self.registry,
            mothership,
            http,
            cache,
            queue,
            push: PushChannel::new(transport),
            protocols: Mutex::new(HashMap::new()),
            update_guards: Mutex::new(HashMap::new()),
            updating: Mutex::new(HashSet::new()),
            updating_problems: Mutex::new(HashMap::new()),
            sync_problems: Mutex::new(Vec::new()),
            online_checks: Mutex::new(HashMap::new()),
            endpoints_registered: Mutex::new(HashSet::new()),
            test_scenario: Mutex::new(None),
        });

        {
            let delegate = inner.delegate.clone();
            inner
                .prefs
                .set_observer(Box::new(move |key, _| delegate.client_preference_changed(key)));
        }
        {
            let weak = Arc::downgrade(&inner);
            inner.delegate.set_panic_sink(Box::new(move |event, description| {
                if let Some(inner) = weak.upgrade() {
                    TypeWorldClient::from_inner(inner).handle_traceback(event, description);
                }
            }));
        }

        let client = TypeWorldClient { inner };
        if client.inner.config.online {
            client.went_online()?;
            client.manage_message_queue_connection();
        }
        Ok(client)
    }
}

#[derive(Clone)]
pub struct TypeWorldClient {
    pub(crate) inner: Arc<ClientInner>,
}

impl TypeWorldClient {
    pub fn builder() -> ClientBuilder {
        ClientBuilder {
            config: ClientConfig::default(),
            preferences: None,
            keyring: None,
            registry: ProtocolRegistry::new(),
            transport: None,
            callbacks: DelegateCallbacks::default(),
        }
    }

    pub(crate) fn from_inner(inner: Arc<ClientInner>) -> Self {
        TypeWorldClient { inner }
    }

    /// Download settings and verify they carry what online operation
    /// needs: a message queue endpoint and the breaking version list.
    fn went_online(&self) -> Result<()> {
        self.perform_download_settings()?;
        let settings = self.downloaded_settings();
        if settings.messaging_queue.is_empty() || settings.breaking_api_versions.is_empty() {
            return Err(ClientError::message("Downloaded settings are incomplete."));
        }
        Ok(())
    }

    fn downloaded_settings(&self) -> DownloadedSettings {
        DownloadedSettings::from_value(
            &self.inner.prefs.get("downloadedSettings").unwrap_or_default(),
        )
    }

    /// Override used by tests and scripted QA runs; forwarded to the
    /// mothership with every request.
    pub fn set_test_scenario(&self, scenario: Option<&str>) {
        *self.inner.test_scenario.lock() = scenario.map(str::to_string);
    }

    fn test_scenario(&self) -> Option<String> {
        self.inner.test_scenario.lock().clone()
    }

    pub(crate) fn request_context(&self) -> RequestContext {
        RequestContext {
            source_anonymous_app_id: self.anonymous_app_id(),
            client_version: self.inner.config.client_version.clone(),
            testing: self.inner.config.testing,
            test_scenario: self.test_scenario(),
        }
    }

    // -- Identity ----------------------------------------------------------

    /// Per-installation UUID, assigned on first use.
    pub fn anonymous_app_id(&self) -> String {
        if let Some(id) = self.inner.prefs.get_string("anonymousAppID") {
            if !id.is_empty() {
                return id;
            }
        }
        let id = uuid::Uuid::new_v4().to_string();
        self.inner.prefs.set("anonymousAppID", json!(id));
        id
    }

    /// The linked user account id, or the empty string.
    pub fn user(&self) -> String {
        self.inner
            .prefs
            .get_string("typeworldUserAccount")
            .unwrap_or_default()
    }

    fn user_keychain_key(&self, user_id: &str) -> String {
        keyring::user_keychain_key(user_id, &self.anonymous_app_id())
    }

    pub(crate) fn secret_key_for(&self, user_id: &str) -> Option<String> {
        self.inner
            .keyring
            .get_password(&self.user_keychain_key(user_id), "secretKey")
    }

    fn secret_key(&self) -> String {
        self.secret_key_for(&self.user()).unwrap_or_default()
    }

    pub fn user_email(&self) -> Option<String> {
        self.inner
            .keyring
            .get_password(&self.user_keychain_key(&self.user()), "userEmail")
    }

    pub fn user_name(&self) -> Option<String> {
        self.inner
            .keyring
            .get_password(&self.user_keychain_key(&self.user()), "userName")
    }

    // -- Reachability ------------------------------------------------------

    /// Probe a server, caching success for a short while. Defaults to
    /// the configured probe host.
    pub fn online(&self, server: Option<&str>) -> bool {
        if self.test_scenario().as_deref() == Some("simulateNotOnline") {
            return false;
        }
        let mut server = server
            .unwrap_or(&self.inner.config.online_probe_url)
            .to_string();
        if !server.starts_with("http") {
            server = format!("http://{}", server);
        }

        if let Some(checked) = self.inner.online_checks.lock().get(&server) {
            if checked.elapsed() < ONLINE_CHECK_TTL {
                return true;
            }
        }

        // HTTP error statuses still prove reachability; only transport
        // failures mean offline.
        match self.inner.http.get(&server).send() {
            Ok(_) => {
                self.inner
                    .online_checks
                    .lock()
                    .insert(server, Instant::now());
                true
            }
            Err(e) => {
                log::debug!("reachability probe of {} failed: {}", server, e);
                false
            }
        }
    }

    // -- Publishers and subscriptions --------------------------------------

    pub fn publisher(&self, canonical_url: &str) -> Publisher {
        Publisher::new(self.inner.clone(), canonical_url)
    }

    /// Publishers that exist: listed and holding at least one
    /// subscription.
    pub fn publishers(&self) -> Vec<Publisher> {
        self.inner
            .prefs
            .get_string_list("publishers")
            .into_iter()
            .map(|url| self.publisher(&url))
            .filter(|publisher| !publisher.subscription_urls().is_empty())
            .collect()
    }

    pub fn find_subscription(&self, unsecret_url: &str) -> Option<Subscription> {
        for publisher in self.publishers() {
            if let Some(subscription) = publisher.subscription(unsecret_url) {
                return Some(subscription);
            }
        }
        None
    }

    /// Secret URLs of every held subscription, for server sync.
    pub fn secret_subscription_urls(&self) -> Vec<String> {
        self.publishers()
            .iter()
            .flat_map(|publisher| publisher.subscriptions())
            .map(|subscription| subscription.secret_url())
            .collect()
    }

    pub fn unsecret_subscription_urls(&self) -> Vec<String> {
        self.publishers()
            .iter()
            .flat_map(|publisher| publisher.subscriptions())
            .map(|subscription| subscription.unsecret_url().to_string())
            .collect()
    }

    /// Resolve and fetch the endpoint metadata behind a subscription
    /// URL, without adding anything.
    pub fn endpoint_command(&self, url: &str) -> Result<EndpointCommand> {
        url_is_valid(url)?;
        let parsed = SubscriptionUrl::parse(url)?;
        let mut protocol = self
            .inner
            .registry
            .create(&parsed, self.inner.protocol_context())?;
        protocol.endpoint_command()
    }

    /// Subscribe to a publisher endpoint.
    pub fn add_subscription(&self, url: &str) -> Result<(Publisher, Subscription)> {
        self.add_subscription_opts(url, true)
    }

    pub(crate) fn add_subscription_opts(
        &self,
        url: &str,
        update_subscriptions_on_server: bool,
    ) -> Result<(Publisher, Subscription)> {
        url_is_valid(url)?;
        let parsed = SubscriptionUrl::parse(url)?;
        let mut protocol = self
            .inner
            .registry
            .create(&parsed, self.inner.protocol_context())?;
        let unsecret_url = parsed.unsecret_url();

        let known = self.unsecret_subscription_urls().contains(&unsecret_url);
        let (publisher, subscription) = if known {
            // Secret rotation: same subscription, new credentials.
            let endpoint = protocol.endpoint_command()?;
            protocol.set_secret_key(&parsed.secret_key)?;
            let shared = self.inner.store_protocol(&unsecret_url, protocol);
            let publisher = self.publisher(&endpoint.canonical_url);
            let subscription = Subscription::new(
                self.inner.clone(),
                endpoint.canonical_url.clone(),
                unsecret_url,
                shared,
            );
            (publisher, subscription)
        } else {
            protocol.about_to_add_subscription(&HealthProbe {
                anonymous_app_id: &self.anonymous_app_id(),
                anonymous_user_id: &self.user(),
                access_token: &parsed.access_token,
                test_scenario: self.test_scenario().as_deref(),
            })?;

            let endpoint = protocol.endpoint_command()?;
            self.check_breaking_api_versions(&mut *protocol)?;

            if self.inner.config.commercial
                && !endpoint
                    .allowed_commercial_apps
                    .contains(&self.inner.config.app_id)
            {
                return Err(ClientError::response("commercialAppNotAllowed"));
            }

            let shared = self.inner.store_protocol(&unsecret_url, protocol);
            let publisher = self.publisher(&endpoint.canonical_url);
            let subscription = Subscription::new(
                self.inner.clone(),
                endpoint.canonical_url.clone(),
                unsecret_url,
                shared,
            );
            subscription.save();
            publisher.save();
            subscription.register_endpoint_once();
            self.manage_message_queue_connection();
            (publisher, subscription)
        };

        if update_subscriptions_on_server {
            self.upload_subscriptions()?;
        }

        subscription.protocol.lock().subscription_added();
        Ok((publisher, subscription))
    }

    /// Refuse endpoints that speak an API version beyond a published
    /// breaking version that is itself beyond us.
    fn check_breaking_api_versions(&self, protocol: &mut dyn Protocol) -> Result<()> {
        let settings = self.inner.prefs.get("downloadedSettings").unwrap_or_default();
        if settings.get("breakingAPIVersions").is_none() {
            return Ok(());
        }
        let breaking_versions = self.downloaded_settings().breaking_api_versions;
        let local = match crate::catalog::parse_version(&self.inner.config.client_version) {
            Some(version) => version,
            None => return Ok(()),
        };
        let incoming = protocol.root_command()?.version;
        let incoming = match crate::catalog::parse_version(&incoming) {
            Some(version) => version,
            None => return Ok(()),
        };
        for breaking in &breaking_versions {
            if let Some(breaking) = crate::catalog::parse_version(breaking) {
                if breaking > local && incoming > breaking {
                    return Err(ClientError::response("appUpdateRequired"));
                }
            }
        }
        Ok(())
    }

    // -- Deferred commands -------------------------------------------------

    /// Replay all queued commands in the fixed drain order. Handlers that
    /// fail leave their payloads queued; the first problem is returned
    /// and the full list is kept in [`TypeWorldClient::sync_problems`].
    pub fn perform_commands(&self) -> Result<()> {
        self.inner.sync_problems.lock().clear();

        if !self.online(None) {
            self.inner
                .sync_problems
                .lock()
                .push("#(response.notOnline)".to_string());
            return Err(ClientError::response("notOnline"));
        }

        let mut problems: Vec<ClientError> = Vec::new();
        for kind in CommandKind::DRAIN_ORDER {
            let payloads = self.inner.queue.pending(kind);
            if payloads.is_empty() {
                continue;
            }
            let result = match kind {
                CommandKind::UnlinkUser => self.perform_unlink_user(),
                CommandKind::LinkUser => self.perform_link_user(&payloads[0]),
                CommandKind::SyncSubscriptions => self.perform_sync_subscriptions(&payloads),
                CommandKind::UploadSubscriptions => self.perform_upload_subscriptions(&payloads),
                CommandKind::AcceptInvitation => self.perform_accept_invitations(&payloads),
                CommandKind::DeclineInvitation => self.perform_decline_invitations(&payloads),
                CommandKind::DownloadSubscriptions => self.perform_download_subscriptions(),
                CommandKind::DownloadSettings => self.perform_download_settings(),
            };
            match result {
                Ok(()) => self.inner.queue.clear(kind),
                Err(e) => problems.push(e),
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            let mut recorded = self.inner.sync_problems.lock();
            for problem in &problems {
                recorded.push(problem.to_string());
            }
            Err(problems.remove(0))
        }
    }

    /// Problems accumulated by the most recent drain.
    pub fn sync_problems(&self) -> Vec<String> {
        self.inner.sync_problems.lock().clone()
    }

    /// Push the local subscription list to the server and pull back the
    /// authoritative state, deferring both while offline.
    pub fn upload_subscriptions(&self) -> Result<()> {
        let urls = self.secret_subscription_urls();
        let payloads = if urls.is_empty() {
            vec![queue::EMPTY.to_string()]
        } else {
            urls
        };
        self.inner.queue.append(CommandKind::UploadSubscriptions, &payloads);
        self.inner.queue.append_pending(CommandKind::DownloadSubscriptions);
        self.perform_commands()
    }

    pub fn sync_subscriptions(&self) -> Result<()> {
        let urls = self.secret_subscription_urls();
        let payloads = if urls.is_empty() {
            vec![queue::EMPTY.to_string()]
        } else {
            urls
        };
        self.inner.queue.append(CommandKind::SyncSubscriptions, &payloads);
        self.perform_commands()
    }

    pub fn download_subscriptions(&self) -> Result<()> {
        if self.user().is_empty() {
            return Ok(());
        }
        self.inner.queue.append_pending(CommandKind::DownloadSubscriptions);
        self.perform_commands()
    }

    /// Pull settings now, or defer the pull to the next drain.
    pub fn download_settings(&self, now: bool) -> Result<()> {
        if now {
            self.perform_download_settings()
        } else {
            self.inner.queue.append_pending(CommandKind::DownloadSettings);
            Ok(())
        }
    }

    fn stamp_last_server_sync(&self) {
        self.inner.prefs.set("lastServerSync", json!(unix_time()));
    }

    fn perform_link_user(&self, user_id: &str) -> Result<()> {
        let secret_key = self
            .secret_key_for(user_id)
            .ok_or_else(|| ClientError::message("No secret key stored for this user."))?;

        let linked = self.inner.mothership.link_user_account(
            &self.request_context(),
            &self.anonymous_app_id(),
            user_id,
            &secret_key,
            &machine_parameters(),
        )?;

        self.inner.prefs.set("typeworldUserAccount", json!(user_id));
        self.inner.push.register_topic(&push::user_topic(user_id));

        let service = self.user_keychain_key(user_id);
        if let Some(email) = linked.user_email {
            self.inner.keyring.set_password(&service, "userEmail", &email);
        }
        if let Some(name) = linked.user_name {
            self.inner.keyring.set_password(&service, "userName", &name);
        }
        Ok(())
    }

    fn perform_unlink_user(&self) -> Result<()> {
        let user_id = self.user();

        self.uninstall_all_protected_fonts(false)?;

        self.inner.mothership.unlink_user_account(
            &self.request_context(),
            &self.anonymous_app_id(),
            &user_id,
            &self.secret_key(),
        )?;

        self.inner.prefs.set("typeworldUserAccount", json!(""));
        self.inner.prefs.set("userAccountEmailIsVerified", json!(""));
        self.inner.prefs.remove("acceptedInvitations");
        self.inner.prefs.remove("pendingInvitations");
        self.inner.prefs.remove("sentInvitations");

        self.inner.push.unregister_topic(&push::user_topic(&user_id));

        let service = self.user_keychain_key(&user_id);
        self.inner.keyring.delete_password(&service, "secretKey");
        self.inner.keyring.delete_password(&service, "userEmail");
        self.inner.keyring.delete_password(&service, "userName");
        Ok(())
    }

    fn perform_sync_subscriptions(&self, payloads: &[String]) -> Result<()> {
        if self.user().is_empty() {
            return Ok(());
        }
        let urls: Vec<String> = if payloads == [queue::PENDING.to_string()] {
            vec![queue::EMPTY.to_string()]
        } else {
            payloads.to_vec()
        };
        self.stamp_last_server_sync();

        let server_urls = self.inner.mothership.sync_user_subscriptions(
            &self.request_context(),
            &self.anonymous_app_id(),
            &self.user(),
            &self.secret_key(),
            &urls,
        )?;
        for url in server_urls {
            if !urls.contains(&url) {
                self.add_subscription_opts(&url, false)?;
            }
        }
        Ok(())
    }

    fn perform_upload_subscriptions(&self, payloads: &[String]) -> Result<()> {
        if self.user().is_empty() {
            return Ok(());
        }
        let urls: Vec<String> = if payloads == [queue::PENDING.to_string()] {
            vec![queue::EMPTY.to_string()]
        } else {
            payloads.to_vec()
        };
        self.stamp_last_server_sync();
        self.inner.mothership.upload_user_subscriptions(
            &self.request_context(),
            &self.anonymous_app_id(),
            &self.user(),
            &self.secret_key(),
            &urls,
        )
    }

    fn invitation_ids_for(&self, urls: &[String]) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for invitation in self.pending_invitations() {
            for url in urls {
                if &invitation.url == url && !ids.contains(&invitation.id) {
                    ids.push(invitation.id.clone());
                }
            }
        }
        if ids.len() != urls.len() {
            return Err(ClientError::message(
                "Not every invitation URL matches a pending invitation.",
            ));
        }
        Ok(ids)
    }

    fn perform_accept_invitations(&self, urls: &[String]) -> Result<()> {
        if self.user().is_empty() {
            return Ok(());
        }
        let ids = self.invitation_ids_for(urls)?;
        self.stamp_last_server_sync();
        let response = self.inner.mothership.accept_invitations(
            &self.request_context(),
            &self.anonymous_app_id(),
            &self.user(),
            &self.secret_key(),
            &ids,
        )?;
        self.execute_download_subscriptions(&response)
    }

    fn perform_decline_invitations(&self, urls: &[String]) -> Result<()> {
        if self.user().is_empty() {
            return Ok(());
        }
        let ids = self.invitation_ids_for(urls)?;
        self.stamp_last_server_sync();
        let response = self.inner.mothership.decline_invitations(
            &self.request_context(),
            &self.anonymous_app_id(),
            &self.user(),
            &self.secret_key(),
            &ids,
        )?;
        self.execute_download_subscriptions(&response)
    }

    fn perform_download_subscriptions(&self) -> Result<()> {
        if self.user().is_empty() {
            return Ok(());
        }
        let response = self.inner.mothership.download_user_subscriptions(
            &self.request_context(),
            &self.anonymous_app_id(),
            &self.user(),
            &self.secret_key(),
            timezone(),
        )?;
        self.stamp_last_server_sync();
        self.execute_download_subscriptions(&response)
    }

    fn perform_download_settings(&self) -> Result<()> {
        let user = self.user();
        let secret_key = self.secret_key();
        let user = (!user.is_empty()).then(|| (user.as_str(), secret_key.as_str()));
        let settings = self
            .inner
            .mothership
            .download_settings(&self.request_context(), user)?;
        self.inner.prefs.set("downloadedSettings", settings);
        self.inner.prefs.set("lastSettingsDownloaded", json!(unix_time()));
        Ok(())
    }

    /// Reconcile local state against the authoritative account state.
    fn execute_download_subscriptions(
        &self,
        response: &DownloadSubscriptionsResponse,
    ) -> Result<()> {
        // The server already considers every protected font of this
        // instance uninstalled; notify publishers without touching disk.
        if response.app_instance_is_revoked {
            self.uninstall_all_protected_fonts(true)?;
        }

        if let Some(verified) = &response.user_account_email_is_verified {
            self.inner
                .prefs
                .set("userAccountEmailIsVerified", verified.clone());
        }
        if let Some(status) = &response.user_account_status {
            self.inner.prefs.set("userAccountStatus", json!(status));
        }
        if let Some(token) = &response.type_world_website_token {
            self.inner.keyring.set_password(
                &self.user_keychain_key(&self.user()),
                "typeWorldWebsiteToken",
                token,
            );
        }

        let old_urls = self.secret_subscription_urls();
        for held in &response.held_subscriptions {
            if !old_urls.contains(&held.url) {
                let (_, subscription) = self
                    .add_subscription_opts(&held.url, false)
                    .map_err(|e| {
                        ClientError::message(format!(
                            "Received from addSubscription() for {}: {}",
                            held.url, e
                        ))
                    })?;
                if let Some(timestamp) = held.server_timestamp {
                    subscription.set_server_timestamp(timestamp);
                }
                self.inner
                    .delegate
                    .subscription_has_been_added(subscription.unsecret_url());
            } else if let Some(incoming) = held.server_timestamp {
                let unsecret = SubscriptionUrl::parse(&held.url)?.unsecret_url();
                if let Some(subscription) = self.find_subscription(&unsecret) {
                    let behind = subscription
                        .server_timestamp()
                        .map_or(true, |local| incoming > local);
                    if behind && subscription.update().is_ok() {
                        subscription.set_server_timestamp(incoming);
                    }
                }
            }
        }

        self.inner.prefs.set(
            "acceptedInvitations",
            normalize_invitation_list(&response.accepted_invitations),
        );
        self.inner.prefs.set(
            "pendingInvitations",
            normalize_invitation_list(&response.pending_invitations),
        );
        self.inner.prefs.set(
            "sentInvitations",
            normalize_invitation_list(&response.sent_invitations),
        );

        let held: HashSet<&str> = response
            .held_subscriptions
            .iter()
            .map(|held| held.url.as_str())
            .collect();
        for publisher in self.publishers() {
            for subscription in publisher.subscriptions() {
                if !held.contains(subscription.secret_url().as_str()) {
                    subscription.delete_opts(false, false)?;
                }
            }
        }

        self.inner.delegate.user_account_has_been_updated();
        Ok(())
    }

    // -- Invitations -------------------------------------------------------

    fn invitations(&self, key: &str) -> Vec<Invitation> {
        self.inner
            .prefs
            .get(key)
            .and_then(|v| v.as_array().cloned())
            .unwrap_or_default()
            .into_iter()
            .filter_map(|value| serde_json::from_value(value).ok())
            .collect()
    }

    pub fn pending_invitations(&self) -> Vec<Invitation> {
        self.invitations("pendingInvitations")
    }

    pub fn accepted_invitations(&self) -> Vec<Invitation> {
        self.invitations("acceptedInvitations")
    }

    pub fn sent_invitations(&self) -> Vec<Invitation> {
        self.invitations("sentInvitations")
    }

    pub fn accept_invitation(&self, url: &str) -> Result<()> {
        if !self.user().is_empty() {
            self.inner
                .queue
                .append(CommandKind::AcceptInvitation, &[url.to_string()]);
        }
        self.perform_commands()
    }

    pub fn decline_invitation(&self, url: &str) -> Result<()> {
        if !self.user().is_empty() {
            self.inner
                .queue
                .append(CommandKind::DeclineInvitation, &[url.to_string()]);
        }
        self.perform_commands()
    }

    // -- User account ------------------------------------------------------

    pub fn create_user_account(
        &self,
        name: &str,
        email: &str,
        password: &str,
        password_confirmation: &str,
    ) -> Result<()> {
        if !self.online(None) {
            return Err(ClientError::response("notOnline"));
        }
        if name.is_empty() || email.is_empty() || password.is_empty() {
            return Err(ClientError::message("#(RequiredFieldEmpty)"));
        }
        if password != password_confirmation {
            return Err(ClientError::message("#(PasswordsDontMatch)"));
        }
        let credentials = self.inner.mothership.create_user_account(
            &self.request_context(),
            name,
            email,
            password,
            self.inner.config.secret_server_auth_key.as_deref(),
        )?;
        self.link_user(&credentials.anonymous_user_id, &credentials.secret_key)
    }

    pub fn log_in_user_account(&self, email: &str, password: &str) -> Result<()> {
        if email.is_empty() || password.is_empty() {
            return Err(ClientError::message("#(RequiredFieldEmpty)"));
        }
        let credentials = self.inner.mothership.log_in_user_account(
            &self.request_context(),
            email,
            password,
        )?;
        self.link_user(&credentials.anonymous_user_id, &credentials.secret_key)
    }

    pub fn delete_user_account(&self, email: &str, password: &str) -> Result<()> {
        if !self.online(None) {
            return Err(ClientError::response("notOnline"));
        }
        if email.is_empty() || password.is_empty() {
            return Err(ClientError::message("#(RequiredFieldEmpty)"));
        }
        if self.user_email().as_deref() == Some(email) {
            self.perform_unlink_user()?;
        }
        self.inner
            .mothership
            .delete_user_account(&self.request_context(), email, password)
    }

    pub fn resend_email_verification(&self) -> Result<()> {
        let email = self.user_email().unwrap_or_default();
        self.inner
            .mothership
            .resend_email_verification(&self.request_context(), &email)
    }

    /// Link a user account to this app instance. The secret key goes to
    /// the keyring first so that a deferred link never leaves it in
    /// serialized preferences.
    pub fn link_user(&self, user_id: &str, secret_key: &str) -> Result<()> {
        self.inner.keyring.set_password(
            &self.user_keychain_key(user_id),
            "secretKey",
            secret_key,
        );

        self.inner
            .queue
            .append(CommandKind::LinkUser, &[user_id.to_string()]);
        self.inner.queue.append_pending(CommandKind::SyncSubscriptions);
        self.inner.queue.append_pending(CommandKind::DownloadSubscriptions);
        self.perform_commands()
    }

    /// Unlink the current user: protected fonts are actually
    /// uninstalled before the server is told.
    pub fn unlink_user(&self) -> Result<()> {
        self.inner.queue.append_pending(CommandKind::UnlinkUser);
        self.perform_commands()
    }

    pub fn linked_app_instances(&self) -> Result<Vec<AppInstance>> {
        if self.user().is_empty() {
            return Err(ClientError::message("No user"));
        }
        self.inner.mothership.user_app_instances(
            &self.request_context(),
            &self.anonymous_app_id(),
            &self.user(),
            &self.secret_key(),
        )
    }

    pub fn revoke_app_instance(&self, anonymous_app_id: Option<&str>) -> Result<()> {
        if self.user().is_empty() {
            return Err(ClientError::message("No user"));
        }
        let app_id = anonymous_app_id
            .map(str::to_string)
            .unwrap_or_else(|| self.anonymous_app_id());
        self.inner.mothership.revoke_app_instance(
            &self.request_context(),
            &app_id,
            &self.user(),
            &self.secret_key(),
        )
    }

    pub fn reactivate_app_instance(&self, anonymous_app_id: Option<&str>) -> Result<()> {
        if self.user().is_empty() {
            return Err(ClientError::message("No user"));
        }
        let app_id = anonymous_app_id
            .map(str::to_string)
            .unwrap_or_else(|| self.anonymous_app_id());
        self.inner.mothership.reactivate_app_instance(
            &self.request_context(),
            &app_id,
            &self.user(),
            &self.secret_key(),
        )
    }

    // -- Fonts across all subscriptions ------------------------------------

    /// Remove every protected font through its publisher. With
    /// `dry_run`, publishers are notified but local files stay on disk
    /// (used when the server reports this instance as revoked).
    pub fn uninstall_all_protected_fonts(&self, dry_run: bool) -> Result<()> {
        for publisher in self.publishers() {
            for subscription in publisher.subscriptions() {
                let catalog = subscription.protocol.lock().installable_fonts_command()?;
                let mut font_ids = Vec::new();
                for (_, font) in catalog.fonts() {
                    if !font.protected {
                        continue;
                    }
                    if dry_run {
                        font_ids.push(font.unique_id.clone());
                    } else if subscription
                        .installed_font_version(&font.unique_id)?
                        .is_some()
                    {
                        font_ids.push(font.unique_id.clone());
                    }
                }
                if !font_ids.is_empty() {
                    subscription.remove_fonts_opts(&font_ids, dry_run, false)?;
                }
            }
        }
        Ok(())
    }

    pub fn expiring_installed_fonts(&self) -> Result<Vec<Font>> {
        let mut fonts = Vec::new();
        for publisher in self.publishers() {
            for subscription in publisher.subscriptions() {
                fonts.extend(subscription.expiring_installed_fonts()?);
            }
        }
        Ok(fonts)
    }

    pub fn amount_outdated_fonts(&self) -> Result<usize> {
        let mut amount = 0;
        for publisher in self.publishers() {
            amount += publisher.amount_outdated_fonts()?;
        }
        Ok(amount)
    }

    pub fn all_subscriptions_updated(&self) -> bool {
        self.inner.updating.lock().is_empty()
    }

    // -- Push channel ------------------------------------------------------

    fn holds_subscription_with_live_notifications(&self) -> bool {
        for publisher in self.publishers() {
            for subscription in publisher.subscriptions() {
                if let Ok(command) = subscription.endpoint_command() {
                    if command.sends_live_notifications {
                        return true;
                    }
                }
            }
        }
        false
    }

    /// Whether this client needs the live message-queue connection.
    /// Evaluated on subscription mutations and user-state changes.
    pub fn requires_message_queue_connection(&self) -> bool {
        (!self.user().is_empty()
            && self.inner.prefs.get_string("userAccountStatus").as_deref() == Some("pro"))
            || self.holds_subscription_with_live_notifications()
            || self.inner.config.testing
    }

    /// Open or close the push channel according to
    /// [`TypeWorldClient::requires_message_queue_connection`].
    pub fn manage_message_queue_connection(&self) {
        if !(self.inner.config.online && self.inner.config.live_notifications) {
            return;
        }
        let requires = self.requires_message_queue_connection();

        if requires && !self.inner.push.is_running() {
            let settings = self.downloaded_settings();
            if settings.messaging_queue.is_empty() {
                log::warn!("no message queue endpoint in downloaded settings");
                return;
            }

            let user = self.user();
            if !user.is_empty() {
                self.inner.push.register_topic(&push::user_topic(&user));
            }
            for publisher in self.publishers() {
                for subscription in publisher.subscriptions() {
                    self.inner.push.register_topic(&subscription.push_topic());
                }
            }

            let weak = Arc::downgrade(&self.inner);
            let handler = Arc::new(move |message: PushMessage| {
                if let Some(inner) = weak.upgrade() {
                    TypeWorldClient::from_inner(inner).handle_push_message(message);
                }
            });
            match self.inner.push.connect(&settings.messaging_queue, handler) {
                Ok(()) => self.inner.delegate.message_queue_connected(),
                Err(e) => log::warn!("could not connect message queue: {}", e),
            }
        } else if !requires && self.inner.push.is_running() {
            if self.inner.push.quit() {
                self.inner.delegate.message_queue_disconnected();
            }
        }
    }

    /// Tear down background machinery. Call before dropping the last
    /// handle.
    pub fn quit(&self) {
        if self.inner.push.quit() {
            self.inner.delegate.message_queue_disconnected();
        }
    }

    pub(crate) fn handle_push_message(&self, message: PushMessage) {
        let data: Value = match serde_json::from_str(&message.body) {
            Ok(data) => data,
            Err(e) => {
                log::warn!("undecodable push message on {}: {}", message.topic, e);
                return;
            }
        };
        if data["command"].as_str() != Some("pullUpdates") {
            return;
        }
        // Self-echo suppression: our own writes come back over the
        // queue and must not trigger another pull.
        if let Some(source) = data["sourceAnonymousAppID"].as_str() {
            if source == self.anonymous_app_id() {
                return;
            }
        }

        if message.topic.starts_with("user-") {
            self.inner
                .delegate
                .user_account_update_notification_has_been_received();
        } else if message.topic.starts_with("subscription-") {
            for publisher in self.publishers() {
                for subscription in publisher.subscriptions() {
                    if subscription.push_topic() != message.topic {
                        continue;
                    }
                    self.inner
                        .delegate
                        .subscription_update_notification_has_been_received(
                            subscription.unsecret_url(),
                        );
                    if subscription.update().is_ok() {
                        if let Some(timestamp) = data["serverTimestamp"].as_i64() {
                            subscription.set_server_timestamp(timestamp);
                        }
                    }
                    return;
                }
            }
        }
    }

    // -- Diagnostics -------------------------------------------------------

    /// Assemble a diagnostics payload for an unexpected fault, POST it
    /// to the mothership from a one-shot worker, and log it locally.
    /// Returns the error to hand back to the caller.
    pub(crate) fn handle_traceback(&self, source_method: &str, description: &str) -> ClientError {
        let backtrace = std::backtrace::Backtrace::force_capture().to_string();
        let payload = format!(
            "Version: {}\n{}\n{}",
            self.inner.config.client_version,
            description,
            normalize_backtrace(&backtrace)
        );
        let supplementary = json!({
            "os": std::env::consts::OS,
            "preferences": self.inner.prefs.snapshot(),
            "sourceMethodSignature": source_method,
        });

        let inner = self.inner.clone();
        let worker_payload = payload.clone();
        std::thread::spawn(move || {
            let client = TypeWorldClient::from_inner(inner.clone());
            let context = client.request_context();
            if let Err(e) =
                inner
                    .mothership
                    .handle_traceback(&context, &worker_payload, &supplementary.to_string())
            {
                log::warn!("handleTraceback() error on server: {}", e);
            }
        });

        log::error!("{} failed:\n{}", source_method, payload);
        ClientError::Message(payload)
    }
}

fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn timezone() -> &'static str {
    // The server only uses this for statistics; the client has no
    // locale machinery of its own.
    "UTC"
}

fn machine_parameters() -> Vec<(String, String)> {
    let mut parameters = Vec::new();
    let node_name = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_default();
    if !node_name.is_empty() {
        parameters.push(("machineNodeName".to_string(), node_name));
    }
    parameters.push((
        "machineOSVersion".to_string(),
        std::env::consts::OS.to_string(),
    ));
    parameters
}

/// Replace `null` field values with empty strings so the serialized
/// lists are uniform.
fn normalize_invitation_list(records: &[Value]) -> Value {
    Value::Array(
        records
            .iter()
            .map(|record| match record {
                Value::Object(map) => {
                    let mut normalized = map.clone();
                    for value in normalized.values_mut() {
                        if value.is_null() {
                            *value = Value::String(String::new());
                        }
                    }
                    Value::Object(normalized)
                }
                other => other.clone(),
            })
            .collect(),
    )
}

/// Strip machine-specific path prefixes from backtrace lines so
/// identical faults collapse into one report upstream.
fn normalize_backtrace(backtrace: &str) -> String {
    backtrace
        .lines()
        .map(|line| match line.find("src/") {
            Some(index) if line.trim_start().starts_with("at ") => {
                format!("             at {}", &line[index..])
            }
            _ => line.to_string(),
        })
        .collect::<Vec<String>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FixturePublisher;
    use crossbeam_channel::Receiver;

    /// mockito's server is shared between tests; anything that registers
    /// mocks with response bodies takes this lock.
    static MOCK_SERVER: Mutex<()> = Mutex::new(());

    const REGULAR: &str = "awesomefonts-sans-regular";
    const BOLD: &str = "awesomefonts-sans-bold";
    const FAMILY: &str = "awesomefonts-sans";

    struct Harness {
        client: TypeWorldClient,
        fixture: FixturePublisher,
        fonts_dir: tempfile::TempDir,
        subscription_url: String,
        canonical_url: String,
        events: Receiver<String>,
    }

    fn server_host() -> String {
        mockito::server_url()
            .trim_start_matches("http://")
            .to_string()
    }

    fn event_callbacks() -> (DelegateCallbacks, Receiver<String>) {
        let (sender, receiver) = crossbeam_channel::unbounded::<String>();
        let mut callbacks = DelegateCallbacks::default();
        let s = sender.clone();
        callbacks.subscription_has_been_added =
            Some(Box::new(move |url| drop(s.send(format!("added {}", url)))));
        let s = sender.clone();
        callbacks.subscription_has_been_deleted =
            Some(Box::new(move |url| drop(s.send(format!("deleted {}", url)))));
        let s = sender.clone();
        callbacks.subscription_update_notification_has_been_received = Some(Box::new(move |url| {
            drop(s.send(format!("updateNotification {}", url)))
        }));
        let s = sender.clone();
        callbacks.message_queue_connected =
            Some(Box::new(move || drop(s.send("mqConnected".to_string()))));
        let s = sender.clone();
        callbacks.message_queue_disconnected =
            Some(Box::new(move || drop(s.send("mqDisconnected".to_string()))));
        let s = sender;
        callbacks.font_has_installed = Some(Box::new(move |success, _, font| {
            drop(s.send(format!("installed {} {}", font.unique_id, success)))
        }));
        (callbacks, receiver)
    }

    fn build_harness(configure: impl FnOnce(&mut ClientConfig) -> ()) -> Harness {
        let canonical_url = format!("{}/api/", mockito::server_url());
        let fixture = FixturePublisher::new(&canonical_url);
        build_harness_with_fixture(fixture, configure, None)
    }

    fn build_harness_with_fixture(
        fixture: FixturePublisher,
        configure: impl FnOnce(&mut ClientConfig) -> (),
        transport: Option<Box<dyn MessageTransport>>,
    ) -> Harness {
        let canonical_url = format!("{}/api/", mockito::server_url());
        let fonts_dir = tempfile::tempdir().unwrap();
        let mut config = ClientConfig::default();
        config.mothership = mockito::server_url();
        config.online_probe_url = mockito::server_url();
        config.fonts_folder = Some(fonts_dir.path().to_path_buf());
        configure(&mut config);

        let (callbacks, events) = event_callbacks();
        let mut builder = TypeWorldClient::builder()
            .config(config)
            .callbacks(callbacks)
            .register_protocol("json", fixture.factory());
        if let Some(transport) = transport {
            builder = builder.transport(transport);
        }
        let client = builder.build().unwrap();

        Harness {
            client,
            fixture,
            fonts_dir,
            subscription_url: format!(
                "typeworld://json+http//s9lWvayTEOaB:ITudMgJq0T@{}/api/",
                server_host()
            ),
            canonical_url,
            events,
        }
    }

    fn order(font_id: &str) -> Vec<(String, String)> {
        vec![(font_id.to_string(), "1.0".to_string())]
    }

    fn link_user_directly(harness: &Harness, user_id: &str, secret: &str) {
        harness
            .client
            .inner
            .prefs
            .set("typeworldUserAccount", json!(user_id));
        let service = keyring::user_keychain_key(user_id, &harness.client.anonymous_app_id());
        harness
            .client
            .inner
            .keyring
            .set_password(&service, "secretKey", secret);
    }

    fn empty_account_body(held: &[(&str, Option<i64>)]) -> String {
        let held: Vec<Value> = held
            .iter()
            .map(|(url, timestamp)| json!({"url": url, "serverTimestamp": timestamp}))
            .collect();
        json!({
            "response": "success",
            "appInstanceIsRevoked": false,
            "heldSubscriptions": held,
            "acceptedInvitations": [],
            "pendingInvitations": [],
            "sentInvitations": [],
        })
        .to_string()
    }

    #[test]
    fn test_add_free_subscription() {
        let harness = build_harness(|_| {});
        let (publisher, subscription) = harness
            .client
            .add_subscription(&harness.subscription_url)
            .unwrap();

        assert_eq!(publisher.canonical_url(), harness.canonical_url);
        assert_eq!(harness.client.publishers().len(), 1);
        assert_eq!(publisher.subscriptions().len(), 1);
        assert_eq!(subscription.foundries().unwrap().len(), 1);
        assert_eq!(
            harness.client.unsecret_subscription_urls(),
            vec![SubscriptionUrl::parse(&harness.subscription_url)
                .unwrap()
                .unsecret_url()]
        );
    }

    #[test]
    fn test_add_rejects_unknown_protocol() {
        let harness = build_harness(|_| {});
        let url = harness.subscription_url.replace("json", "ufo");
        let err = harness.client.add_subscription(&url).unwrap_err();
        assert!(matches!(err, ClientError::UnknownProtocol(_)));
    }

    #[test]
    fn test_failed_health_probe_aborts_add() {
        let harness = build_harness(|_| {});
        harness.fixture.reject_new_subscriptions(Some("loginRequired"));
        let err = harness
            .client
            .add_subscription(&harness.subscription_url)
            .unwrap_err();
        assert!(err.is_response("loginRequired"));
        assert!(harness.client.publishers().is_empty());
    }

    #[test]
    fn test_install_gated_by_terms_and_identity() {
        let harness = build_harness(|_| {});
        harness.fixture.require_reveal_identity(true);
        let (_, subscription) = harness
            .client
            .add_subscription(&harness.subscription_url)
            .unwrap();

        let err = subscription.install_fonts(&order(BOLD)).unwrap_err();
        assert!(err.is_response("termsOfServiceNotAccepted"));

        subscription.set_accepted_terms_of_service(true);
        let err = subscription.install_fonts(&order(BOLD)).unwrap_err();
        assert!(err.is_response("revealedUserIdentityRequired"));

        subscription.set_reveal_identity(true);
        subscription.install_fonts(&order(BOLD)).unwrap();

        let path = harness.fonts_dir.path().join(format!(
            "{}-AwesomeSans-Bold_1.0.otf",
            subscription.unique_id()
        ));
        assert!(path.exists());
        assert_eq!(
            subscription
                .installed_font_version(BOLD)
                .unwrap()
                .as_deref(),
            Some("1.0")
        );
    }

    #[test]
    fn test_installation_state_is_the_filesystem() {
        let harness = build_harness(|_| {});
        let (_, subscription) = harness
            .client
            .add_subscription(&harness.subscription_url)
            .unwrap();
        subscription.set_accepted_terms_of_service(true);

        assert_eq!(subscription.installed_font_version(REGULAR).unwrap(), None);
        subscription.install_fonts(&order(REGULAR)).unwrap();
        assert_eq!(
            subscription
                .installed_font_version(REGULAR)
                .unwrap()
                .as_deref(),
            Some("1.0")
        );
        assert_eq!(subscription.amount_installed_fonts().unwrap(), 1);

        // Deleting the file is all it takes to uninstall.
        let path = harness.fonts_dir.path().join(format!(
            "{}-AwesomeSans-Regular_1.0.otf",
            subscription.unique_id()
        ));
        std::fs::remove_file(path).unwrap();
        assert_eq!(subscription.installed_font_version(REGULAR).unwrap(), None);
    }

    #[test]
    fn test_seat_enforcement_across_two_app_instances() {
        let canonical_url = format!("{}/api/", mockito::server_url());
        let fixture = FixturePublisher::new(&canonical_url);
        fixture.set_seat_allowance(BOLD, 1);

        let first = build_harness_with_fixture(fixture.clone(), |_| {}, None);
        let second = build_harness_with_fixture(fixture.clone(), |_| {}, None);

        let (_, subscription_one) = first
            .client
            .add_subscription(&first.subscription_url)
            .unwrap();
        subscription_one.set_accepted_terms_of_service(true);
        let (_, subscription_two) = second
            .client
            .add_subscription(&second.subscription_url)
            .unwrap();
        subscription_two.set_accepted_terms_of_service(true);

        subscription_one.install_fonts(&order(BOLD)).unwrap();
        assert_eq!(fixture.seats_taken(BOLD), 1);

        let err = subscription_two.install_fonts(&order(BOLD)).unwrap_err();
        assert!(err.is_response("seatAllowanceReached"));

        subscription_one
            .remove_fonts(&[BOLD.to_string()])
            .unwrap();
        assert_eq!(fixture.seats_taken(BOLD), 0);
        assert_eq!(
            subscription_one.installed_font_version(BOLD).unwrap(),
            None
        );

        subscription_two.install_fonts(&order(BOLD)).unwrap();
        assert_eq!(fixture.seats_taken(BOLD), 1);
    }

    #[test]
    fn test_outdated_detection() {
        let harness = build_harness(|_| {});
        let (_, subscription) = harness
            .client
            .add_subscription(&harness.subscription_url)
            .unwrap();
        subscription.set_accepted_terms_of_service(true);
        subscription.install_fonts(&order(REGULAR)).unwrap();
        assert_eq!(harness.client.amount_outdated_fonts().unwrap(), 0);

        harness.fixture.add_family_version(FAMILY, "1.1");
        assert!(subscription.update().unwrap());

        assert_eq!(subscription.outdated_fonts().unwrap(), vec![REGULAR.to_string()]);
        assert_eq!(harness.client.amount_outdated_fonts().unwrap(), 1);
    }

    #[test]
    fn test_breaking_api_version_guard() {
        let harness = build_harness(|config| config.client_version = "1.5.0".to_string());
        harness.client.inner.prefs.set(
            "downloadedSettings",
            json!({"messagingQueue": "inproc://queue", "breakingAPIVersions": ["2.0.0"]}),
        );

        harness.fixture.set_api_version("2.1.0");
        let err = harness
            .client
            .add_subscription(&harness.subscription_url)
            .unwrap_err();
        assert!(err.is_response("appUpdateRequired"));
        assert!(harness.client.publishers().is_empty());

        harness.fixture.set_api_version("1.9.0");
        harness
            .client
            .add_subscription(&harness.subscription_url)
            .unwrap();
    }

    #[test]
    fn test_revoked_app_instance_dry_runs_protected_uninstall() {
        let _server = MOCK_SERVER.lock();
        let harness = build_harness(|_| {});
        let (_, subscription) = harness
            .client
            .add_subscription(&harness.subscription_url)
            .unwrap();
        subscription.set_accepted_terms_of_service(true);
        subscription.install_fonts(&order(BOLD)).unwrap();
        assert_eq!(harness.fixture.seats_taken(BOLD), 1);
        let path = harness.fonts_dir.path().join(format!(
            "{}-AwesomeSans-Bold_1.0.otf",
            subscription.unique_id()
        ));
        assert!(path.exists());

        link_user_directly(&harness, "user-1", "ukeF92k");
        let body = json!({
            "response": "success",
            "appInstanceIsRevoked": true,
            "heldSubscriptions": [{"url": subscription.secret_url(), "serverTimestamp": null}],
            "acceptedInvitations": [],
            "pendingInvitations": [],
            "sentInvitations": [],
        });
        let _m = mockito::mock("POST", "/downloadUserSubscriptions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body.to_string())
            .create();

        harness.client.download_subscriptions().unwrap();

        // The publisher was told, the local file was left for a later
        // cleanup pass.
        assert_eq!(harness.fixture.seats_taken(BOLD), 0);
        assert!(path.exists());
        assert_eq!(
            harness.client.unsecret_subscription_urls(),
            vec![subscription.unsecret_url().to_string()]
        );
    }

    #[test]
    fn test_reconciliation_converges_on_held_subscriptions() {
        let _server = MOCK_SERVER.lock();
        let harness = build_harness(|_| {});

        let local_url = harness.subscription_url.clone();
        harness
            .client
            .add_subscription_opts(&local_url, false)
            .unwrap();
        link_user_directly(&harness, "user-1", "ukeF92k");

        let held_url = format!(
            "typeworld://json+http//p0Tr3mBq1L:JXGhhBkq2Z@{}/api/",
            server_host()
        );
        let _m = mockito::mock("POST", "/downloadUserSubscriptions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(empty_account_body(&[(held_url.as_str(), Some(1610000000))]))
            .create();

        harness.client.download_subscriptions().unwrap();

        let held_unsecret = SubscriptionUrl::parse(&held_url).unwrap().unsecret_url();
        assert_eq!(
            harness.client.unsecret_subscription_urls(),
            vec![held_unsecret.clone()]
        );
        let subscription = harness.client.find_subscription(&held_unsecret).unwrap();
        assert_eq!(subscription.server_timestamp(), Some(1610000000));

        let events: Vec<String> = harness.events.try_iter().collect();
        assert!(events.iter().any(|event| event == &format!("added {}", held_unsecret)));
        let local_unsecret = SubscriptionUrl::parse(&local_url).unwrap().unsecret_url();
        assert!(events
            .iter()
            .any(|event| event == &format!("deleted {}", local_unsecret)));
    }

    #[test]
    fn test_offline_commands_are_retained_and_replayed() {
        let _server = MOCK_SERVER.lock();
        let harness = build_harness(|_| {});

        harness.client.set_test_scenario(Some("simulateNotOnline"));
        let err = harness.client.link_user("user-7", "Fq2hh0Xz").unwrap_err();
        assert!(err.is_response("notOnline"));
        assert_eq!(
            harness.client.sync_problems(),
            vec!["#(response.notOnline)".to_string()]
        );
        assert_eq!(harness.client.user(), "");
        assert_eq!(
            harness.client.inner.queue.pending(CommandKind::LinkUser),
            vec!["user-7".to_string()]
        );

        // The secret key went to the keyring right away and never into
        // the serialized preferences.
        let snapshot = serde_json::to_string(&harness.client.inner.prefs.snapshot()).unwrap();
        assert!(!snapshot.contains("Fq2hh0Xz"));

        harness.client.set_test_scenario(None);
        let _link = mockito::mock("POST", "/linkTypeWorldUserAccount")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"response": "success", "userEmail": "user7@example.com", "userName": "User Seven"}"#,
            )
            .create();
        let _sync = mockito::mock("POST", "/syncUserSubscriptions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"response": "success", "subscriptions": []}"#)
            .create();
        let _download = mockito::mock("POST", "/downloadUserSubscriptions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(empty_account_body(&[]))
            .create();

        harness.client.perform_commands().unwrap();
        assert_eq!(harness.client.user(), "user-7");
        assert_eq!(
            harness.client.user_email().as_deref(),
            Some("user7@example.com")
        );
        assert!(harness
            .client
            .inner
            .queue
            .pending(CommandKind::LinkUser)
            .is_empty());
        assert!(harness.client.sync_problems().is_empty());
    }

    #[test]
    fn test_switch_user_drains_unlink_before_link() {
        let _server = MOCK_SERVER.lock();
        let harness = build_harness(|_| {});
        link_user_directly(&harness, "user-old", "oldSecret0");

        harness.client.set_test_scenario(Some("simulateNotOnline"));
        assert!(harness.client.unlink_user().is_err());
        assert!(harness.client.link_user("user-new", "newSecret0").is_err());
        harness.client.set_test_scenario(None);

        let _unlink = mockito::mock("POST", "/unlinkTypeWorldUserAccount")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"response": "success"}"#)
            .create();
        let _link = mockito::mock("POST", "/linkTypeWorldUserAccount")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"response": "success"}"#)
            .create();
        let _sync = mockito::mock("POST", "/syncUserSubscriptions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"response": "success", "subscriptions": []}"#)
            .create();
        let _download = mockito::mock("POST", "/downloadUserSubscriptions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(empty_account_body(&[]))
            .create();

        harness.client.perform_commands().unwrap();

        // Had the link drained first, the unlink would have wiped it
        // again; the fixed order makes switch-user flows land on the
        // new account.
        assert_eq!(harness.client.user(), "user-new");
        let old_service =
            keyring::user_keychain_key("user-old", &harness.client.anonymous_app_id());
        assert!(harness
            .client
            .inner
            .keyring
            .get_password(&old_service, "secretKey")
            .is_none());
    }

    #[test]
    fn test_push_notifications_update_subscription_and_ignore_self_echo() {
        let _server = MOCK_SERVER.lock();
        let broker = InMemoryBroker::new();
        let _settings = mockito::mock("POST", "/downloadSettings")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"response": "success", "settings": {
                    "messagingQueue": "inproc://fixture",
                    "breakingAPIVersions": ["0.1.0"]
                }}"#,
            )
            .create();

        let canonical_url = format!("{}/api/", mockito::server_url());
        let fixture = FixturePublisher::new(&canonical_url);
        let harness = build_harness_with_fixture(
            fixture,
            |config| {
                config.online = true;
                config.live_notifications = true;
                config.testing = true;
            },
            Some(broker.transport()),
        );
        assert_eq!(
            harness.events.recv_timeout(Duration::from_secs(2)).unwrap(),
            "mqConnected"
        );

        let (_, subscription) = harness
            .client
            .add_subscription(&harness.subscription_url)
            .unwrap();
        let topic = subscription.push_topic();

        // Our own echo is dropped before any callback runs.
        broker.publish(
            &topic,
            &json!({
                "command": "pullUpdates",
                "sourceAnonymousAppID": harness.client.anonymous_app_id(),
            })
            .to_string(),
        );
        assert!(harness
            .events
            .recv_timeout(Duration::from_millis(300))
            .is_err());

        broker.publish(
            &topic,
            &json!({
                "command": "pullUpdates",
                "sourceAnonymousAppID": "some-other-app",
                "serverTimestamp": 42,
            })
            .to_string(),
        );
        let event = harness.events.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(
            event,
            format!("updateNotification {}", subscription.unsecret_url())
        );

        // The update carried the new server timestamp.
        let deadline = Instant::now() + Duration::from_secs(2);
        while subscription.server_timestamp() != Some(42) {
            assert!(Instant::now() < deadline, "timestamp was never stored");
            std::thread::sleep(Duration::from_millis(20));
        }

        harness.client.quit();
        let remaining: Vec<String> = harness.events.try_iter().collect();
        assert!(remaining.contains(&"mqDisconnected".to_string()));
    }

    #[test]
    fn test_subscription_delete_cascades() {
        let harness = build_harness(|_| {});
        let (_, subscription) = harness
            .client
            .add_subscription(&harness.subscription_url)
            .unwrap();
        subscription.set_accepted_terms_of_service(true);
        subscription.install_fonts(&order(REGULAR)).unwrap();
        let unique_id = subscription.unique_id();

        subscription.delete().unwrap();

        assert!(harness.client.publishers().is_empty());
        assert!(harness
            .client
            .inner
            .prefs
            .get_string_list("publishers")
            .is_empty());
        assert!(harness
            .client
            .inner
            .prefs
            .get(&format!(
                "subscription({})",
                SubscriptionUrl::parse(&harness.subscription_url)
                    .unwrap()
                    .unsecret_url()
            ))
            .is_none());
        // Installed files are gone too.
        let leftovers: Vec<_> = std::fs::read_dir(harness.fonts_dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with(&unique_id)
            })
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_secret_rotation_keeps_single_subscription() {
        let harness = build_harness(|_| {});
        harness
            .client
            .add_subscription(&harness.subscription_url)
            .unwrap();

        let rotated = harness.subscription_url.replace("ITudMgJq0T", "newSecret99");
        let (_, subscription) = harness.client.add_subscription(&rotated).unwrap();

        assert_eq!(harness.client.unsecret_subscription_urls().len(), 1);
        assert!(subscription.secret_url().contains("newSecret99"));
    }

    #[test]
    fn test_secrets_never_reach_preferences() {
        let harness = build_harness(|_| {});
        harness
            .client
            .add_subscription(&harness.subscription_url)
            .unwrap();
        link_user_directly(&harness, "user-1", "aVerySecretKey123");

        let snapshot = serde_json::to_string(&harness.client.inner.prefs.snapshot()).unwrap();
        assert!(!snapshot.contains("ITudMgJq0T"));
        assert!(!snapshot.contains("aVerySecretKey123"));
    }

    #[test]
    fn test_commercial_app_needs_allow_listing() {
        let harness = build_harness(|config| {
            config.commercial = true;
            config.app_id = "world.type.commercial".to_string();
        });
        let err = harness
            .client
            .add_subscription(&harness.subscription_url)
            .unwrap_err();
        assert!(err.is_response("commercialAppNotAllowed"));

        harness.fixture.allow_commercial_app("world.type.commercial");
        harness
            .client
            .add_subscription(&harness.subscription_url)
            .unwrap();
    }

    #[test]
    fn test_expiring_fonts_are_reported() {
        let canonical_url = format!("{}/api/", mockito::server_url());
        let fixture = FixturePublisher::new(&canonical_url);
        let mut catalog = crate::testing::sample_catalog();
        catalog.foundries[0].families[0].fonts[1].expiry = Some(4102444800);
        fixture.set_catalog(catalog);

        let harness = build_harness_with_fixture(fixture, |_| {}, None);
        let (_, subscription) = harness
            .client
            .add_subscription(&harness.subscription_url)
            .unwrap();
        subscription.set_accepted_terms_of_service(true);
        subscription.install_fonts(&order(BOLD)).unwrap();

        let expiring = harness.client.expiring_installed_fonts().unwrap();
        assert_eq!(expiring.len(), 1);
        assert_eq!(expiring[0].unique_id, BOLD);
    }
}
