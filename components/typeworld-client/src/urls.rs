/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Parsing of the custom `typeworld://` subscription URL scheme.
//!
//! `typeworld://<protocol>+<http|https>//[<sub>[:<secret>[:<token>]]@]<rest>`
//!
//! The unsecret form (secret replaced by the literal `secretKey`) is the
//! identity under which a subscription is stored everywhere; the secret
//! form is only ever handed to the protocol and the keyring.

use crate::error::{ClientError, Result};

pub const CUSTOM_SCHEME: &str = "typeworld://";

/// A parsed subscription URL. `Debug` redacts the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct SubscriptionUrl {
    /// Inner protocol token, e.g. `json`.
    pub protocol: String,
    /// `http://` or `https://`.
    pub transport: String,
    pub subscription_id: String,
    pub secret_key: String,
    pub access_token: String,
    /// Everything after the credentials, e.g. `fonts.example.com/api/`.
    pub rest: String,
}

/// Check a raw URL for structural validity without fully parsing it.
pub fn url_is_valid(url: &str) -> Result<()> {
    let scheme = url.find(CUSTOM_SCHEME);
    let plus = url.find('+');
    let http = url.find("http");
    let slashes = http.and_then(|h| url[h..].find("//").map(|i| i + h));
    let ordered = match (scheme, plus, http, slashes) {
        (Some(a), Some(b), Some(c), Some(d)) => a < b && b < c && c < d,
        _ => false,
    };
    if !ordered {
        return Err(ClientError::InvalidUrl("URL is malformed.".into()));
    }

    if url.matches('@').count() > 1 {
        return Err(ClientError::InvalidUrl(
            "URL contains more than one @ sign, so don’t know how to parse it.".into(),
        ));
    }

    if !url.starts_with(CUSTOM_SCHEME) {
        return Err(ClientError::InvalidUrl(format!(
            "Unknown custom protocol, known are: {:?}",
            [CUSTOM_SCHEME.trim_end_matches("://")]
        )));
    }

    if url.matches("://").count() > 1 {
        return Err(ClientError::InvalidUrl(
            "URL contains more than one :// combination, so don’t know how to parse it.".into(),
        ));
    }

    Ok(())
}

impl SubscriptionUrl {
    pub fn parse(url: &str) -> Result<Self> {
        url_is_valid(url)?;

        let url = url.replacen(CUSTOM_SCHEME, "", 1);
        let protocol = url.split('+').next().unwrap_or_default().to_string();
        let url = url.replacen(&format!("{}+", protocol), "", 1);

        // The double slash after the transport token is part of the custom
        // scheme; restore the usual `://` before looking at the rest.
        let url = url
            .replacen("https//", "https://", 1)
            .replacen("http//", "http://", 1)
            .replacen("HTTPS//", "https://", 1)
            .replacen("HTTP//", "http://", 1);

        let transport = if url.starts_with("https://") {
            "https://"
        } else if url.starts_with("http://") {
            "http://"
        } else {
            return Err(ClientError::InvalidUrl("URL is malformed.".into()));
        };
        let url_rest = &url[transport.len()..];

        let mut subscription_id = String::new();
        let mut secret_key = String::new();
        let mut access_token = String::new();
        let rest;

        if let Some((credentials, domain)) = url_rest.split_once('@') {
            let parts: Vec<&str> = credentials.split(':').collect();
            match parts.len() {
                3 => {
                    subscription_id = parts[0].into();
                    secret_key = parts[1].into();
                    access_token = parts[2].into();
                }
                2 => {
                    subscription_id = parts[0].into();
                    secret_key = parts[1].into();
                }
                1 => subscription_id = parts[0].into(),
                _ => {
                    return Err(ClientError::InvalidUrl(
                        "URL credentials are malformed.".into(),
                    ))
                }
            }
            rest = domain.to_string();
        } else {
            rest = url_rest.to_string();
        }

        Ok(SubscriptionUrl {
            protocol,
            transport: transport.to_string(),
            subscription_id,
            secret_key,
            access_token,
            rest,
        })
    }

    fn assemble(&self, credentials: Option<String>) -> String {
        let mut out = format!(
            "{}{}+{}",
            CUSTOM_SCHEME,
            self.protocol,
            self.transport.replace("://", "//")
        );
        if let Some(credentials) = credentials {
            out.push_str(&credentials);
            out.push('@');
        }
        out.push_str(&self.rest);
        out
    }

    /// Full form including the secret key. Never persisted or logged.
    pub fn secret_url(&self) -> String {
        if !self.subscription_id.is_empty() && !self.secret_key.is_empty() {
            self.assemble(Some(format!("{}:{}", self.subscription_id, self.secret_key)))
        } else if !self.subscription_id.is_empty() {
            self.assemble(Some(self.subscription_id.clone()))
        } else {
            self.assemble(None)
        }
    }

    /// Storage identity: the secret replaced by the literal `secretKey`.
    pub fn unsecret_url(&self) -> String {
        if !self.subscription_id.is_empty() && !self.secret_key.is_empty() {
            self.assemble(Some(format!("{}:secretKey", self.subscription_id)))
        } else if !self.subscription_id.is_empty() {
            self.assemble(Some(self.subscription_id.clone()))
        } else {
            self.assemble(None)
        }
    }

    /// Secret omitted entirely; used for push topics.
    pub fn short_unsecret_url(&self) -> String {
        if !self.subscription_id.is_empty() {
            self.assemble(Some(self.subscription_id.clone()))
        } else {
            self.assemble(None)
        }
    }

    /// Plain transport URL of the endpoint.
    pub fn http_url(&self) -> String {
        format!("{}{}", self.transport, self.rest)
    }
}

impl std::fmt::Debug for SubscriptionUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.unsecret_url())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = "typeworld://json+https//s9lWvayTEOaB:mF4We4ckexqKtPx8@fonts.example.com/api/";

    #[test]
    fn test_parse_full_credentials() {
        let url = SubscriptionUrl::parse(FULL).unwrap();
        assert_eq!(url.protocol, "json");
        assert_eq!(url.transport, "https://");
        assert_eq!(url.subscription_id, "s9lWvayTEOaB");
        assert_eq!(url.secret_key, "mF4We4ckexqKtPx8");
        assert_eq!(url.access_token, "");
        assert_eq!(url.rest, "fonts.example.com/api/");
    }

    #[test]
    fn test_parse_access_token() {
        let url = SubscriptionUrl::parse(
            "typeworld://json+https//sub:secret:token@fonts.example.com/api/",
        )
        .unwrap();
        assert_eq!(url.access_token, "token");
    }

    #[test]
    fn test_parse_no_credentials() {
        let url = SubscriptionUrl::parse("typeworld://json+https//fonts.example.com/api/").unwrap();
        assert_eq!(url.subscription_id, "");
        assert_eq!(url.unsecret_url(), "typeworld://json+https//fonts.example.com/api/");
    }

    #[test]
    fn test_canonical_forms() {
        let url = SubscriptionUrl::parse(FULL).unwrap();
        assert_eq!(url.secret_url(), FULL);
        assert_eq!(
            url.unsecret_url(),
            "typeworld://json+https//s9lWvayTEOaB:secretKey@fonts.example.com/api/"
        );
        assert_eq!(
            url.short_unsecret_url(),
            "typeworld://json+https//s9lWvayTEOaB@fonts.example.com/api/"
        );
        assert_eq!(url.http_url(), "https://fonts.example.com/api/");
    }

    #[test]
    fn test_identity_is_stable() {
        // unsecretURL(secretURL(u)) == unsecretURL(u)
        let url = SubscriptionUrl::parse(FULL).unwrap();
        let reparsed = SubscriptionUrl::parse(&url.secret_url()).unwrap();
        assert_eq!(reparsed.unsecret_url(), url.unsecret_url());
        let unsecret = SubscriptionUrl::parse(&url.unsecret_url()).unwrap();
        assert_eq!(unsecret.unsecret_url(), url.unsecret_url());
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(SubscriptionUrl::parse("https://example.com").is_err());
        assert!(SubscriptionUrl::parse("typeworld://json+ftp//example.com").is_err());
        assert!(SubscriptionUrl::parse("typeworld://json+https//a@b@example.com").is_err());
        assert!(
            SubscriptionUrl::parse("typeworld://json+https://sub@https://example.com").is_err()
        );
    }

    #[test]
    fn test_debug_redacts_secret() {
        let url = SubscriptionUrl::parse(FULL).unwrap();
        let debug = format!("{:?}", url);
        assert!(!debug.contains("mF4We4ckexqKtPx8"));
        assert!(debug.contains("secretKey"));
    }
}
