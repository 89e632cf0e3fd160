/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! HTTP resource cache.
//!
//! Caches text and binary resources (logos, background images, font
//! previews) in the preferences store, keyed by URL plus a binary flag.
//! The MIME type is stored alongside the content so cached entries can be
//! served without a network round trip. Publishers and subscriptions keep
//! their own membership lists of cached URLs, which drive a targeted
//! purge when one of them is deleted.

use crate::error::{ClientError, Result};
use crate::prefs::Preferences;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde_json::Value;
use std::time::Duration;

const RESOURCES_KEY: &str = "resources";

pub struct ResourceCache {
    prefs: Preferences,
    http: reqwest::blocking::Client,
}

impl ResourceCache {
    pub fn new(prefs: Preferences, http: reqwest::blocking::Client) -> Self {
        ResourceCache { prefs, http }
    }

    /// Fetch or serve a resource. Returns `(content, mime type)`; binary
    /// content is returned base64-encoded. `update` forces a refetch.
    pub fn resource_by_url(&self, url: &str, binary: bool, update: bool) -> Result<(String, String)> {
        let key = format!("{},binary={}", url, binary);
        let mut resources = self.prefs.get_object(RESOURCES_KEY);

        if update || !resources.contains_key(&key) {
            let response = self
                .http
                .get(url)
                .timeout(Duration::from_secs(30))
                .send()?;
            if !response.status().is_success() {
                return Err(ClientError::HttpStatus(response.status().as_u16()));
            }
            let mime = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("application/octet-stream")
                .to_string();
            let content = if binary {
                BASE64.encode(response.bytes()?)
            } else {
                response.text()?
            };

            resources.insert(key, Value::String(format!("{},{}", mime, content)));
            self.prefs.set(RESOURCES_KEY, Value::Object(resources));
            return Ok((content, mime));
        }

        let entry = resources
            .get(&key)
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        match entry.split_once(',') {
            Some((mime, content)) => Ok((content.to_string(), mime.to_string())),
            None => Err(ClientError::message(format!(
                "Malformed cache entry for {}",
                url
            ))),
        }
    }

    /// Drop every cached entry belonging to one of `urls`, regardless of
    /// the binary flag it was fetched with.
    pub fn delete_resources(&self, urls: &[String]) {
        let mut resources = self.prefs.get_object(RESOURCES_KEY);
        resources.retain(|key, _| !urls.iter().any(|url| key.starts_with(url.as_str())));
        self.prefs.set(RESOURCES_KEY, Value::Object(resources));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> ResourceCache {
        ResourceCache::new(Preferences::in_memory(), reqwest::blocking::Client::new())
    }

    #[test]
    fn test_fetch_and_serve_from_cache() {
        let _m = mockito::mock("GET", "/logo.svg")
            .with_status(200)
            .with_header("content-type", "image/svg+xml")
            .with_body("<svg/>")
            .expect(1)
            .create();

        let cache = cache();
        let url = format!("{}/logo.svg", mockito::server_url());

        let (content, mime) = cache.resource_by_url(&url, false, false).unwrap();
        assert_eq!(content, "<svg/>");
        assert_eq!(mime, "image/svg+xml");

        // Second read must come from the cache; the mock expects one hit.
        let (content, mime) = cache.resource_by_url(&url, false, false).unwrap();
        assert_eq!(content, "<svg/>");
        assert_eq!(mime, "image/svg+xml");
        _m.assert();
    }

    #[test]
    fn test_binary_content_is_base64() {
        let _m = mockito::mock("GET", "/font.otf")
            .with_status(200)
            .with_header("content-type", "font/otf")
            .with_body(&[0u8, 1, 2, 3][..])
            .create();

        let cache = cache();
        let url = format!("{}/font.otf", mockito::server_url());
        let (content, mime) = cache.resource_by_url(&url, true, false).unwrap();
        assert_eq!(BASE64.decode(content).unwrap(), vec![0u8, 1, 2, 3]);
        assert_eq!(mime, "font/otf");
    }

    #[test]
    fn test_update_refetches() {
        let m1 = mockito::mock("GET", "/logo.svg")
            .with_status(200)
            .with_header("content-type", "image/svg+xml")
            .with_body("old")
            .create();

        let cache = cache();
        let url = format!("{}/logo.svg", mockito::server_url());
        cache.resource_by_url(&url, false, false).unwrap();
        drop(m1);

        let _m2 = mockito::mock("GET", "/logo.svg")
            .with_status(200)
            .with_header("content-type", "image/svg+xml")
            .with_body("new")
            .create();
        let (content, _) = cache.resource_by_url(&url, false, true).unwrap();
        assert_eq!(content, "new");
    }

    #[test]
    fn test_delete_resources_purges_all_flavors() {
        let _m = mockito::mock("GET", "/logo.svg")
            .with_status(200)
            .with_header("content-type", "image/svg+xml")
            .with_body("<svg/>")
            .expect(3)
            .create();

        let cache = cache();
        let url = format!("{}/logo.svg", mockito::server_url());
        cache.resource_by_url(&url, false, false).unwrap();
        cache.resource_by_url(&url, true, false).unwrap();
        cache.delete_resources(&[url.clone()]);

        // Both entries are gone, so the next read hits the network again.
        cache.resource_by_url(&url, false, false).unwrap();
        _m.assert();
    }

    #[test]
    fn test_http_error_is_surfaced() {
        let _m = mockito::mock("GET", "/missing.svg").with_status(404).create();
        let cache = cache();
        let url = format!("{}/missing.svg", mockito::server_url());
        let err = cache.resource_by_url(&url, false, false).unwrap_err();
        assert!(matches!(err, ClientError::HttpStatus(404)));
    }
}
