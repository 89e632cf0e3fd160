/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! A scriptable in-process publisher endpoint.
//!
//! [`FixturePublisher`] simulates one publisher server: it serves a
//! catalog, enforces seat allowances per protected font across app
//! instances, and can be reconfigured mid-test (new versions, rejected
//! probes, identity requirements). Its [`FixturePublisher::factory`]
//! plugs into the protocol registry under any token, so tests exercise
//! the real subscription machinery end to end without a network.

use crate::catalog::{
    EndpointCommand, Family, Font, FontVersion, Foundry, InstallFontAsset, InstallFontsResponse,
    InstallableFontsCommand, LocalizedText, RootCommand, UninstallFontAsset,
    UninstallFontsResponse,
};
use crate::error::{ClientError, Result};
use crate::protocol::{HealthProbe, Protocol, ProtocolContext, ProtocolFactory};
use crate::urls::SubscriptionUrl;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// A small catalog most tests can share: one foundry, one family at
/// version 1.0, one free font and one protected font.
pub fn sample_catalog() -> InstallableFontsCommand {
    InstallableFontsCommand {
        name: LocalizedText::en("Awesome Fonts"),
        foundries: vec![Foundry {
            unique_id: "awesomefonts".into(),
            name: LocalizedText::en("Awesome Fonts"),
            families: vec![Family {
                unique_id: "awesomefonts-sans".into(),
                name: LocalizedText::en("Awesome Sans"),
                versions: vec![FontVersion {
                    number: "1.0".into(),
                    ..Default::default()
                }],
                fonts: vec![
                    Font {
                        unique_id: "awesomefonts-sans-regular".into(),
                        name: LocalizedText::en("Awesome Sans Regular"),
                        post_script_name: "AwesomeSans-Regular".into(),
                        format: "otf".into(),
                        ..Default::default()
                    },
                    Font {
                        unique_id: "awesomefonts-sans-bold".into(),
                        name: LocalizedText::en("Awesome Sans Bold"),
                        post_script_name: "AwesomeSans-Bold".into(),
                        format: "otf".into(),
                        protected: true,
                        ..Default::default()
                    },
                ],
            }],
        }],
    }
}

struct FixtureState {
    canonical_url: String,
    name: LocalizedText,
    api_version: String,
    sends_live_notifications: bool,
    allowed_commercial_apps: Vec<String>,
    requires_reveal_identity: bool,
    reject_probe: Option<String>,
    catalog: InstallableFontsCommand,
    seat_allowances: HashMap<String, usize>,
    seats: HashMap<String, HashSet<String>>,
}

/// Shared state of a simulated publisher endpoint. Clone handles freely;
/// every protocol instance created through [`FixturePublisher::factory`]
/// talks to the same state, so several clients can share one "server".
#[derive(Clone)]
pub struct FixturePublisher {
    state: Arc<Mutex<FixtureState>>,
}

impl FixturePublisher {
    pub fn new(canonical_url: impl Into<String>) -> Self {
        FixturePublisher {
            state: Arc::new(Mutex::new(FixtureState {
                canonical_url: canonical_url.into(),
                name: LocalizedText::en("Awesome Fonts"),
                api_version: "0.2.9".into(),
                sends_live_notifications: false,
                allowed_commercial_apps: vec![],
                requires_reveal_identity: false,
                reject_probe: None,
                catalog: sample_catalog(),
                seat_allowances: HashMap::new(),
                seats: HashMap::new(),
            })),
        }
    }

    pub fn factory(&self) -> Arc<dyn ProtocolFactory> {
        let state = self.state.clone();
        Arc::new(
            move |url: &SubscriptionUrl, context: ProtocolContext| -> Result<Box<dyn Protocol>> {
                Ok(Box::new(FixtureProtocol::new(
                    state.clone(),
                    url.clone(),
                    context,
                )))
            },
        )
    }

    pub fn set_catalog(&self, catalog: InstallableFontsCommand) {
        self.state.lock().catalog = catalog;
    }

    /// Advertise a new version of a family, as a publisher would after
    /// a release.
    pub fn add_family_version(&self, family_id: &str, number: &str) {
        let mut state = self.state.lock();
        for foundry in &mut state.catalog.foundries {
            for family in &mut foundry.families {
                if family.unique_id == family_id {
                    family.versions.push(FontVersion {
                        number: number.into(),
                        ..Default::default()
                    });
                }
            }
        }
    }

    pub fn set_api_version(&self, version: &str) {
        self.state.lock().api_version = version.into();
    }

    pub fn set_sends_live_notifications(&self, sends: bool) {
        self.state.lock().sends_live_notifications = sends;
    }

    pub fn allow_commercial_app(&self, app_id: &str) {
        self.state.lock().allowed_commercial_apps.push(app_id.into());
    }

    pub fn require_reveal_identity(&self, required: bool) {
        self.state.lock().requires_reveal_identity = required;
    }

    /// Make the pre-add health probe fail with a reply code.
    pub fn reject_new_subscriptions(&self, code: Option<&str>) {
        self.state.lock().reject_probe = code.map(str::to_string);
    }

    /// Limit the number of app instances a protected font may be
    /// installed on.
    pub fn set_seat_allowance(&self, font_id: &str, seats: usize) {
        self.state
            .lock()
            .seat_allowances
            .insert(font_id.to_string(), seats);
    }

    /// How many app instances currently hold a seat for a font.
    pub fn seats_taken(&self, font_id: &str) -> usize {
        self.state
            .lock()
            .seats
            .get(font_id)
            .map(HashSet::len)
            .unwrap_or(0)
    }
}

struct FixtureProtocol {
    state: Arc<Mutex<FixtureState>>,
    url: SubscriptionUrl,
    context: ProtocolContext,
    catalog: Option<InstallableFontsCommand>,
}

impl FixtureProtocol {
    fn new(state: Arc<Mutex<FixtureState>>, url: SubscriptionUrl, context: ProtocolContext) -> Self {
        // Real protocols park the endpoint secret in the keyring right
        // away; mirror that so hydrated instances can rebuild the
        // secret URL after a restart.
        if !url.secret_key.is_empty() && url.secret_key != "secretKey" {
            context
                .keyring
                .set_password(&url.unsecret_url(), "secretKey", &url.secret_key);
        }
        FixtureProtocol {
            state,
            url,
            context,
            catalog: None,
        }
    }

    fn app_id(&self) -> String {
        self.context
            .prefs
            .get_string("anonymousAppID")
            .unwrap_or_default()
    }

    fn subscription_flag(&self, key: &str) -> bool {
        self.context
            .prefs
            .get_object(&format!("subscription({})", self.url.unsecret_url()))
            .get(key)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    fn font_bytes(font_id: &str) -> Vec<u8> {
        format!("OTTO-fixture-{}", font_id).into_bytes()
    }
}

impl Protocol for FixtureProtocol {
    fn url(&self) -> &SubscriptionUrl {
        &self.url
    }

    fn secret_url(&self) -> String {
        match self
            .context
            .keyring
            .get_password(&self.url.unsecret_url(), "secretKey")
        {
            Some(secret) => {
                let mut url = self.url.clone();
                url.secret_key = secret;
                url.secret_url()
            }
            None => self.url.secret_url(),
        }
    }

    fn about_to_add_subscription(&mut self, _probe: &HealthProbe<'_>) -> Result<()> {
        match &self.state.lock().reject_probe {
            Some(code) => Err(ClientError::response(code.clone())),
            None => Ok(()),
        }
    }

    fn endpoint_command(&mut self) -> Result<EndpointCommand> {
        let state = self.state.lock();
        Ok(EndpointCommand {
            canonical_url: state.canonical_url.clone(),
            name: state.name.clone(),
            admin_email: "hello@awesomefonts.example".into(),
            allowed_commercial_apps: state.allowed_commercial_apps.clone(),
            sends_live_notifications: state.sends_live_notifications,
        })
    }

    fn root_command(&mut self) -> Result<RootCommand> {
        Ok(RootCommand {
            version: self.state.lock().api_version.clone(),
        })
    }

    fn installable_fonts_command(&mut self) -> Result<InstallableFontsCommand> {
        if self.catalog.is_none() {
            self.catalog = Some(self.state.lock().catalog.clone());
        }
        Ok(self.catalog.clone().expect("catalog was just filled"))
    }

    fn install_fonts(
        &mut self,
        fonts: &[(String, String)],
        _update_subscription: bool,
    ) -> Result<InstallFontsResponse> {
        let app_id = self.app_id();
        let reveal = self.subscription_flag("revealIdentity");
        let mut state = self.state.lock();
        let mut assets = Vec::new();

        for (font_id, version) in fonts {
            let font = state.catalog.font_by_id(font_id).map(|(_, font)| font.clone());
            let Some(font) = font else {
                assets.push(InstallFontAsset {
                    unique_id: font_id.clone(),
                    version: version.clone(),
                    response: "unknownFont".into(),
                    ..Default::default()
                });
                continue;
            };

            if font.protected {
                if state.requires_reveal_identity && !reveal {
                    return Err(ClientError::response("revealedUserIdentityRequired"));
                }
                let allowance = state.seat_allowances.get(font_id).copied();
                let seats = state.seats.entry(font_id.clone()).or_default();
                if !seats.contains(&app_id)
                    && allowance.map_or(false, |allowance| seats.len() >= allowance)
                {
                    assets.push(InstallFontAsset {
                        unique_id: font_id.clone(),
                        version: version.clone(),
                        response: "seatAllowanceReached".into(),
                        ..Default::default()
                    });
                    continue;
                }
                seats.insert(app_id.clone());
            }

            assets.push(InstallFontAsset {
                unique_id: font_id.clone(),
                version: version.clone(),
                response: "success".into(),
                data: Some(BASE64.encode(Self::font_bytes(font_id))),
                encoding: Some("base64".into()),
                ..Default::default()
            });
        }

        Ok(InstallFontsResponse { assets })
    }

    fn remove_fonts(
        &mut self,
        font_ids: &[String],
        _update_subscription: bool,
    ) -> Result<UninstallFontsResponse> {
        let app_id = self.app_id();
        let mut state = self.state.lock();
        let mut assets = Vec::new();

        for font_id in font_ids {
            let held = state
                .seats
                .get_mut(font_id)
                .map(|seats| seats.remove(&app_id))
                .unwrap_or(false);
            assets.push(UninstallFontAsset {
                unique_id: font_id.clone(),
                response: if held {
                    "success".into()
                } else {
                    "unknownInstallation".into()
                },
                error_message: None,
            });
        }

        Ok(UninstallFontsResponse { assets })
    }

    fn update(&mut self) -> Result<bool> {
        let fresh = self.state.lock().catalog.clone();
        let changed = match &self.catalog {
            Some(cached) => {
                serde_json::to_string(cached).ok() != serde_json::to_string(&fresh).ok()
            }
            None => true,
        };
        self.catalog = Some(fresh);
        Ok(changed)
    }

    fn set_secret_key(&mut self, secret: &str) -> Result<()> {
        self.context
            .keyring
            .set_password(&self.url.unsecret_url(), "secretKey", secret);
        Ok(())
    }

    fn delete_secret_key(&mut self) -> Result<()> {
        self.context
            .keyring
            .delete_password(&self.url.unsecret_url(), "secretKey");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyring::KeyringHandle;
    use crate::prefs::Preferences;

    fn protocol(publisher: &FixturePublisher, url: &str) -> Box<dyn Protocol> {
        let url = SubscriptionUrl::parse(url).unwrap();
        publisher
            .factory()
            .create(
                &url,
                ProtocolContext {
                    prefs: Preferences::in_memory(),
                    keyring: KeyringHandle::in_memory(),
                },
            )
            .unwrap()
    }

    #[test]
    fn test_secret_round_trips_through_keyring() {
        let publisher = FixturePublisher::new("https://awesomefonts.example/api/");
        let full = "typeworld://json+https//sub:s3cr3t@awesomefonts.example/api/";
        let mut protocol = protocol(&publisher, full);
        assert_eq!(protocol.secret_url(), full);

        protocol.set_secret_key("rotated").unwrap();
        assert_eq!(
            protocol.secret_url(),
            "typeworld://json+https//sub:rotated@awesomefonts.example/api/"
        );
        protocol.delete_secret_key().unwrap();
        assert!(protocol.secret_url().contains("secretKey"));
    }

    #[test]
    fn test_update_reports_changes_once() {
        let publisher = FixturePublisher::new("https://awesomefonts.example/api/");
        let mut protocol = protocol(
            &publisher,
            "typeworld://json+https//sub:k@awesomefonts.example/api/",
        );
        protocol.installable_fonts_command().unwrap();
        assert!(!protocol.update().unwrap());
        publisher.add_family_version("awesomefonts-sans", "1.1");
        assert!(protocol.update().unwrap());
        assert!(!protocol.update().unwrap());
    }

    #[test]
    fn test_seat_allowance_across_instances() {
        let publisher = FixturePublisher::new("https://awesomefonts.example/api/");
        publisher.set_seat_allowance("awesomefonts-sans-bold", 1);

        let context_a = ProtocolContext {
            prefs: Preferences::in_memory(),
            keyring: KeyringHandle::in_memory(),
        };
        context_a.prefs.set("anonymousAppID", serde_json::json!("app-a"));
        let context_b = ProtocolContext {
            prefs: Preferences::in_memory(),
            keyring: KeyringHandle::in_memory(),
        };
        context_b.prefs.set("anonymousAppID", serde_json::json!("app-b"));

        let url =
            SubscriptionUrl::parse("typeworld://json+https//sub:k@awesomefonts.example/api/")
                .unwrap();
        let mut protocol_a = publisher.factory().create(&url, context_a).unwrap();
        let mut protocol_b = publisher.factory().create(&url, context_b).unwrap();

        let order = vec![("awesomefonts-sans-bold".to_string(), "1.0".to_string())];
        let first = protocol_a.install_fonts(&order, true).unwrap();
        assert_eq!(first.assets[0].response, "success");

        let second = protocol_b.install_fonts(&order, true).unwrap();
        assert_eq!(second.assets[0].response, "seatAllowanceReached");

        protocol_a
            .remove_fonts(&["awesomefonts-sans-bold".to_string()], true)
            .unwrap();
        let retry = protocol_b.install_fonts(&order, true).unwrap();
        assert_eq!(retry.assets[0].response, "success");
    }
}
