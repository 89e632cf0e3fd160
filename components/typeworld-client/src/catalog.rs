/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Read-only view into a publisher's current catalog.
//!
//! These types mirror the payloads a protocol implementation decodes from
//! the wire: the endpoint description, the root command, and the
//! installable-fonts tree (foundries → families → fonts → versions).
//! Installation state is never stored here; it is derived from the
//! filesystem by the subscription engine.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A piece of text keyed by language code, with `en` as the fallback.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalizedText(pub HashMap<String, String>);

impl LocalizedText {
    pub fn en(text: impl Into<String>) -> Self {
        let mut map = HashMap::new();
        map.insert("en".to_string(), text.into());
        LocalizedText(map)
    }

    /// Resolve against a locale preference list, falling back to `en`,
    /// then to any entry at all.
    pub fn get(&self, locales: &[&str]) -> &str {
        for locale in locales {
            if let Some(text) = self.0.get(*locale) {
                return text;
            }
        }
        if let Some(text) = self.0.get("en") {
            return text;
        }
        self.0.values().next().map(String::as_str).unwrap_or("")
    }
}

/// Endpoint metadata, served once per publisher endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EndpointCommand {
    #[serde(rename = "canonicalURL")]
    pub canonical_url: String,
    pub name: LocalizedText,
    pub admin_email: String,
    pub allowed_commercial_apps: Vec<String>,
    pub sends_live_notifications: bool,
}

/// The root response of an endpoint; carries the API version the server
/// speaks, which feeds the breaking-version guard.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RootCommand {
    pub version: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InstallableFontsCommand {
    pub name: LocalizedText,
    pub foundries: Vec<Foundry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Foundry {
    #[serde(rename = "uniqueID")]
    pub unique_id: String,
    pub name: LocalizedText,
    pub families: Vec<Family>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Family {
    #[serde(rename = "uniqueID")]
    pub unique_id: String,
    pub name: LocalizedText,
    /// Versions shared by all fonts of the family.
    pub versions: Vec<FontVersion>,
    pub fonts: Vec<Font>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Font {
    #[serde(rename = "uniqueID")]
    pub unique_id: String,
    pub name: LocalizedText,
    pub post_script_name: String,
    /// File format suffix, e.g. `otf`.
    pub format: String,
    pub protected: bool,
    /// Unix timestamp after which an installed font expires.
    pub expiry: Option<i64>,
    /// Expiry in seconds counted from installation.
    pub expiry_duration: Option<i64>,
    /// Font-specific versions, in addition to the family's.
    pub versions: Vec<FontVersion>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FontVersion {
    pub number: String,
    pub description: LocalizedText,
}

impl Font {
    /// On-disk filename for one version of this font. An installed file is
    /// always prefixed with the owning subscription's unique id, so the
    /// name built here is only the second half of the path.
    pub fn filename(&self, version: &str) -> String {
        format!("{}_{}.{}", self.post_script_name, version, self.format)
    }
}

impl Family {
    /// Family-wide and font-specific versions combined, sorted ascending.
    /// The last entry is the most recent release.
    pub fn versions_for<'a>(&'a self, font: &'a Font) -> Vec<&'a FontVersion> {
        let mut versions: Vec<&FontVersion> =
            self.versions.iter().chain(font.versions.iter()).collect();
        versions.sort_by(|a, b| compare_version_numbers(&a.number, &b.number));
        versions
    }
}

impl InstallableFontsCommand {
    pub fn font_by_id(&self, font_id: &str) -> Option<(&Family, &Font)> {
        for foundry in &self.foundries {
            for family in &foundry.families {
                for font in &family.fonts {
                    if font.unique_id == font_id {
                        return Some((family, font));
                    }
                }
            }
        }
        None
    }

    pub fn family_by_id(&self, family_id: &str) -> Option<&Family> {
        self.foundries
            .iter()
            .flat_map(|foundry| foundry.families.iter())
            .find(|family| family.unique_id == family_id)
    }

    pub fn fonts(&self) -> impl Iterator<Item = (&Family, &Font)> {
        self.foundries.iter().flat_map(|foundry| {
            foundry
                .families
                .iter()
                .flat_map(|family| family.fonts.iter().map(move |font| (family, font)))
        })
    }
}

/// Parse a possibly short version number (`1.1`) into semver by padding
/// missing components with zeroes.
pub fn parse_version(number: &str) -> Option<semver::Version> {
    let mut parts: Vec<&str> = number.trim().split('.').collect();
    while parts.len() < 3 {
        parts.push("0");
    }
    semver::Version::parse(&parts.join(".")).ok()
}

fn compare_version_numbers(a: &str, b: &str) -> std::cmp::Ordering {
    match (parse_version(a), parse_version(b)) {
        (Some(a), Some(b)) => a.cmp(&b),
        _ => a.cmp(b),
    }
}

/// Per-font entry of a protocol `installFonts` response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InstallFontAsset {
    #[serde(rename = "uniqueID")]
    pub unique_id: String,
    pub version: String,
    /// `success`, `error`, or a predefined reply code.
    pub response: String,
    pub error_message: Option<String>,
    /// Inline font binary, base64-encoded when `encoding` is `base64`.
    pub data: Option<String>,
    pub encoding: Option<String>,
    /// Alternative to `data`: fetch the binary from here.
    #[serde(rename = "dataURL")]
    pub data_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InstallFontsResponse {
    pub assets: Vec<InstallFontAsset>,
}

/// Per-font entry of a protocol `removeFonts` response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UninstallFontAsset {
    #[serde(rename = "uniqueID")]
    pub unique_id: String,
    pub response: String,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UninstallFontsResponse {
    pub assets: Vec<UninstallFontAsset>,
}
