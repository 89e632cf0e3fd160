/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Low-level API for talking to the central coordination server.
//!
//! This module is responsible for the HTTP traffic to the mothership:
//! serializing request parameters and deserializing response envelopes
//! into typed objects the rest of the crate can inspect. Every endpoint
//! is one JSON POST returning `{"response": "success" | <code>, ...}`.
//!
//! Requests are retried up to ten times because the server's autoscaled
//! instances may drop a single connection mid-request. Parameter echoes
//! in error messages redact any key whose lowercase name ends in `key`
//! or `secret`.

use crate::error::{ClientError, Result};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

/// Production mothership endpoint.
pub const MOTHERSHIP: &str = "https://api.type.world/v1";

const REQUEST_ATTEMPTS: usize = 10;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-request client identity, attached to every parameter set.
#[derive(Clone)]
pub struct RequestContext {
    pub source_anonymous_app_id: String,
    pub client_version: String,
    pub testing: bool,
    pub test_scenario: Option<String>,
}

pub struct Mothership {
    base_url: String,
    http: reqwest::blocking::Client,
}

type Params = Vec<(String, String)>;

fn param(key: &str, value: impl Into<String>) -> (String, String) {
    (key.to_string(), value.into())
}

/// Replace secret-bearing values for log or error echoes.
fn redact(params: &Params) -> Params {
    params
        .iter()
        .map(|(key, value)| {
            let lower = key.to_lowercase();
            if lower.ends_with("key") || lower.ends_with("secret") {
                (key.clone(), "*****".to_string())
            } else {
                (key.clone(), value.clone())
            }
        })
        .collect()
}

impl Mothership {
    pub fn new(base_url: impl Into<String>, http: reqwest::blocking::Client) -> Self {
        Mothership {
            base_url: base_url.into(),
            http,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// One POST with the retry loop. Returns the raw body on HTTP 200.
    fn request(&self, url: &str, params: &Params) -> Result<Vec<u8>> {
        let mut last_error = None;
        for attempt in 1..=REQUEST_ATTEMPTS {
            match self
                .http
                .post(url)
                .timeout(REQUEST_TIMEOUT)
                .form(params)
                .send()
            {
                Ok(response) => {
                    if response.status().as_u16() != 200 {
                        return Err(ClientError::HttpStatus(response.status().as_u16()));
                    }
                    return Ok(response.bytes()?.to_vec());
                }
                Err(e) => {
                    log::debug!("request to {} failed (attempt {}): {}", url, attempt, e);
                    last_error = Some((attempt, e));
                }
            }
        }
        let (attempts, error) = last_error.expect("no attempt recorded");
        Err(ClientError::Message(format!(
            "Response from {} with parameters {:?} after {} tries: {}",
            url,
            redact(params),
            attempts,
            error
        )))
    }

    /// POST to an endpoint and parse the response envelope. Reply codes
    /// in `tolerate` pass through instead of failing.
    fn post(
        &self,
        endpoint: &str,
        mut params: Params,
        context: &RequestContext,
        tolerate: &[&str],
    ) -> Result<Value> {
        params.push(param(
            "sourceAnonymousAppID",
            context.source_anonymous_app_id.clone(),
        ));
        params.push(param("clientVersion", context.client_version.clone()));
        if context.testing {
            params.push(param("testing", "true"));
        }
        if let Some(scenario) = &context.test_scenario {
            params.push(param("testScenario", scenario.clone()));
        }

        let url = format!("{}/{}", self.base_url, endpoint);
        let body = self.request(&url, &params)?;
        let value: Value = serde_json::from_slice(&body)?;

        let code = value["response"].as_str().unwrap_or_default().to_string();
        if code != "success" && !tolerate.contains(&code.as_str()) {
            return Err(ClientError::Response(code));
        }
        Ok(value)
    }

    // -- User accounts -----------------------------------------------------

    pub fn create_user_account(
        &self,
        context: &RequestContext,
        name: &str,
        email: &str,
        password: &str,
        secret_server_auth_key: Option<&str>,
    ) -> Result<UserCredentials> {
        let mut params = vec![
            param("name", name),
            param("email", email),
            param("password", password),
        ];
        if let Some(key) = secret_server_auth_key {
            params.push(param("SECRETKEY", key));
        }
        let value = self.post("createUserAccount", params, context, &[])?;
        Ok(serde_json::from_value(value)?)
    }

    pub fn log_in_user_account(
        &self,
        context: &RequestContext,
        email: &str,
        password: &str,
    ) -> Result<UserCredentials> {
        let params = vec![param("email", email), param("password", password)];
        let value = self.post("logInUserAccount", params, context, &[])?;
        Ok(serde_json::from_value(value)?)
    }

    pub fn delete_user_account(
        &self,
        context: &RequestContext,
        email: &str,
        password: &str,
    ) -> Result<()> {
        let params = vec![param("email", email), param("password", password)];
        self.post("deleteUserAccount", params, context, &[])?;
        Ok(())
    }

    pub fn resend_email_verification(&self, context: &RequestContext, email: &str) -> Result<()> {
        self.post(
            "resendEmailVerification",
            vec![param("email", email)],
            context,
            &[],
        )?;
        Ok(())
    }

    pub fn link_user_account(
        &self,
        context: &RequestContext,
        anonymous_app_id: &str,
        anonymous_user_id: &str,
        secret_key: &str,
        machine: &[(String, String)],
    ) -> Result<LinkedUser> {
        let mut params = vec![
            param("anonymousAppID", anonymous_app_id),
            param("anonymousUserID", anonymous_user_id),
            param("secretKey", secret_key),
        ];
        params.extend(machine.iter().cloned());
        let value = self.post("linkTypeWorldUserAccount", params, context, &[])?;
        Ok(serde_json::from_value(value)?)
    }

    /// `userUnknown` is tolerated: unlinking an account the server no
    /// longer knows should still clear local state.
    pub fn unlink_user_account(
        &self,
        context: &RequestContext,
        anonymous_app_id: &str,
        anonymous_user_id: &str,
        secret_key: &str,
    ) -> Result<()> {
        self.post(
            "unlinkTypeWorldUserAccount",
            vec![
                param("anonymousAppID", anonymous_app_id),
                param("anonymousUserID", anonymous_user_id),
                param("secretKey", secret_key),
            ],
            context,
            &["userUnknown"],
        )?;
        Ok(())
    }

    pub fn user_app_instances(
        &self,
        context: &RequestContext,
        anonymous_app_id: &str,
        anonymous_user_id: &str,
        secret_key: &str,
    ) -> Result<Vec<AppInstance>> {
        let value = self.post(
            "userAppInstances",
            vec![
                param("anonymousAppID", anonymous_app_id),
                param("anonymousUserID", anonymous_user_id),
                param("secretKey", secret_key),
            ],
            context,
            &[],
        )?;
        let instances = value
            .get("appInstances")
            .cloned()
            .unwrap_or_else(|| Value::Array(vec![]));
        Ok(serde_json::from_value(instances)?)
    }

    pub fn revoke_app_instance(
        &self,
        context: &RequestContext,
        anonymous_app_id: &str,
        anonymous_user_id: &str,
        secret_key: &str,
    ) -> Result<()> {
        self.post(
            "revokeAppInstance",
            vec![
                param("anonymousAppID", anonymous_app_id),
                param("anonymousUserID", anonymous_user_id),
                param("secretKey", secret_key),
            ],
            context,
            &[],
        )?;
        Ok(())
    }

    pub fn reactivate_app_instance(
        &self,
        context: &RequestContext,
        anonymous_app_id: &str,
        anonymous_user_id: &str,
        secret_key: &str,
    ) -> Result<()> {
        self.post(
            "reactivateAppInstance",
            vec![
                param("anonymousAppID", anonymous_app_id),
                param("anonymousUserID", anonymous_user_id),
                param("secretKey", secret_key),
            ],
            context,
            &[],
        )?;
        Ok(())
    }

    // -- Subscription state ------------------------------------------------

    pub fn upload_user_subscriptions(
        &self,
        context: &RequestContext,
        anonymous_app_id: &str,
        anonymous_user_id: &str,
        secret_key: &str,
        subscription_urls: &[String],
    ) -> Result<()> {
        self.post(
            "uploadUserSubscriptions",
            vec![
                param("anonymousAppID", anonymous_app_id),
                param("anonymousUserID", anonymous_user_id),
                param("subscriptionURLs", subscription_urls.join(",")),
                param("secretKey", secret_key),
            ],
            context,
            &[],
        )?;
        Ok(())
    }

    pub fn download_user_subscriptions(
        &self,
        context: &RequestContext,
        anonymous_app_id: &str,
        anonymous_user_id: &str,
        secret_key: &str,
        user_timezone: &str,
    ) -> Result<DownloadSubscriptionsResponse> {
        let value = self.post(
            "downloadUserSubscriptions",
            vec![
                param("anonymousAppID", anonymous_app_id),
                param("anonymousUserID", anonymous_user_id),
                param("userTimezone", user_timezone),
                param("secretKey", secret_key),
            ],
            context,
            &[],
        )?;
        Ok(serde_json::from_value(value)?)
    }

    pub fn sync_user_subscriptions(
        &self,
        context: &RequestContext,
        anonymous_app_id: &str,
        anonymous_user_id: &str,
        secret_key: &str,
        subscription_urls: &[String],
    ) -> Result<Vec<String>> {
        let value = self.post(
            "syncUserSubscriptions",
            vec![
                param("anonymousAppID", anonymous_app_id),
                param("anonymousUserID", anonymous_user_id),
                param("subscriptionURLs", subscription_urls.join(",")),
                param("secretKey", secret_key),
            ],
            context,
            &[],
        )?;
        let urls = value
            .get("subscriptions")
            .cloned()
            .unwrap_or_else(|| Value::Array(vec![]));
        Ok(serde_json::from_value(urls)?)
    }

    // -- Invitations -------------------------------------------------------

    pub fn accept_invitations(
        &self,
        context: &RequestContext,
        anonymous_app_id: &str,
        anonymous_user_id: &str,
        secret_key: &str,
        invitation_ids: &[String],
    ) -> Result<DownloadSubscriptionsResponse> {
        let value = self.post(
            "acceptInvitations",
            vec![
                param("anonymousAppID", anonymous_app_id),
                param("anonymousUserID", anonymous_user_id),
                param("subscriptionIDs", invitation_ids.join(",")),
                param("secretKey", secret_key),
            ],
            context,
            &[],
        )?;
        Ok(serde_json::from_value(value)?)
    }

    pub fn decline_invitations(
        &self,
        context: &RequestContext,
        anonymous_app_id: &str,
        anonymous_user_id: &str,
        secret_key: &str,
        invitation_ids: &[String],
    ) -> Result<DownloadSubscriptionsResponse> {
        let value = self.post(
            "declineInvitations",
            vec![
                param("anonymousAppID", anonymous_app_id),
                param("anonymousUserID", anonymous_user_id),
                param("subscriptionIDs", invitation_ids.join(",")),
                param("secretKey", secret_key),
            ],
            context,
            &[],
        )?;
        Ok(serde_json::from_value(value)?)
    }

    pub fn invite_user_to_subscription(
        &self,
        context: &RequestContext,
        target_user_email: &str,
        source_user_email: &str,
        subscription_url: &str,
    ) -> Result<()> {
        self.post(
            "inviteUserToSubscription",
            vec![
                param("targetUserEmail", target_user_email),
                param("sourceUserEmail", source_user_email),
                param("subscriptionURL", subscription_url),
            ],
            context,
            &[],
        )?;
        Ok(())
    }

    pub fn revoke_subscription_invitation(
        &self,
        context: &RequestContext,
        target_user_email: &str,
        source_user_email: &str,
        subscription_url: &str,
    ) -> Result<()> {
        self.post(
            "revokeSubscriptionInvitation",
            vec![
                param("targetUserEmail", target_user_email),
                param("sourceUserEmail", source_user_email),
                param("subscriptionURL", subscription_url),
            ],
            context,
            &[],
        )?;
        Ok(())
    }

    // -- Settings and diagnostics ------------------------------------------

    /// Make a publisher endpoint discoverable. Fired once per
    /// subscription lifetime from a background worker.
    pub fn register_api_endpoint(&self, context: &RequestContext, url: &str) -> Result<()> {
        self.post("registerAPIEndpoint", vec![param("url", url)], context, &[])?;
        Ok(())
    }

    pub fn download_settings(
        &self,
        context: &RequestContext,
        user: Option<(&str, &str)>,
    ) -> Result<Value> {
        let mut params = vec![];
        if let Some((user_id, secret_key)) = user {
            params.push(param("anonymousUserID", user_id));
            params.push(param("secretKey", secret_key));
        }
        let value = self.post("downloadSettings", params, context, &[])?;
        Ok(value.get("settings").cloned().unwrap_or_default())
    }

    pub fn handle_traceback(
        &self,
        context: &RequestContext,
        payload: &str,
        supplementary: &str,
    ) -> Result<()> {
        self.post(
            "handleTraceback",
            vec![
                param("payload", payload),
                param("supplementary", supplementary),
            ],
            context,
            &[],
        )?;
        Ok(())
    }
}

// -- Response payloads -----------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct UserCredentials {
    #[serde(rename = "anonymousUserID")]
    pub anonymous_user_id: String,
    #[serde(rename = "secretKey")]
    pub secret_key: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LinkedUser {
    pub user_email: Option<String>,
    pub user_name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppInstance {
    #[serde(rename = "anonymousAppID")]
    pub anonymous_app_id: String,
    pub machine_human_readable_name: String,
    pub machine_node_name: String,
    #[serde(rename = "machineOSVersion")]
    pub machine_os_version: String,
    pub revoked: bool,
    pub last_used: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeldSubscription {
    pub url: String,
    pub server_timestamp: Option<i64>,
}

/// The authoritative account state returned by `downloadUserSubscriptions`
/// (and by the invitation-response endpoints, which piggyback on it).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DownloadSubscriptionsResponse {
    pub held_subscriptions: Vec<HeldSubscription>,
    pub accepted_invitations: Vec<Value>,
    pub pending_invitations: Vec<Value>,
    pub sent_invitations: Vec<Value>,
    pub user_account_email_is_verified: Option<Value>,
    pub user_account_status: Option<String>,
    pub type_world_website_token: Option<String>,
    pub app_instance_is_revoked: bool,
}

/// Settings pulled from the mothership, kept raw in the preferences and
/// viewed through this lens.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DownloadedSettings {
    pub messaging_queue: String,
    #[serde(rename = "breakingAPIVersions")]
    pub breaking_api_versions: Vec<String>,
}

impl DownloadedSettings {
    pub fn from_value(value: &Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> RequestContext {
        RequestContext {
            source_anonymous_app_id: "app-1".into(),
            client_version: "0.1.0".into(),
            testing: false,
            test_scenario: None,
        }
    }

    fn mothership() -> Mothership {
        Mothership::new(mockito::server_url(), reqwest::blocking::Client::new())
    }

    #[test]
    fn test_redaction() {
        let params = vec![
            param("secretKey", "abc"),
            param("SECRETKEY", "def"),
            param("anonymousUserID", "uid"),
            param("serverSecret", "ghi"),
        ];
        let redacted = redact(&params);
        assert_eq!(redacted[0].1, "*****");
        assert_eq!(redacted[1].1, "*****");
        assert_eq!(redacted[2].1, "uid");
        assert_eq!(redacted[3].1, "*****");
    }

    #[test]
    fn test_envelope_error_becomes_response_code() {
        let _m = mockito::mock("POST", "/downloadSettings")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"response": "userUnknown"}"#)
            .create();
        let err = mothership()
            .download_settings(&context(), None)
            .unwrap_err();
        assert!(err.is_response("userUnknown"));
    }

    #[test]
    fn test_download_settings_returns_settings_object() {
        let _m = mockito::mock("POST", "/downloadSettings")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"response": "success", "settings": {
                    "messagingQueue": "tcp://messagequeue.type.world:8529",
                    "breakingAPIVersions": ["0.2.9-beta"]
                }}"#,
            )
            .create();
        let settings = mothership().download_settings(&context(), None).unwrap();
        let settings = DownloadedSettings::from_value(&settings);
        assert_eq!(settings.messaging_queue, "tcp://messagequeue.type.world:8529");
        assert_eq!(settings.breaking_api_versions, vec!["0.2.9-beta".to_string()]);
    }

    #[test]
    fn test_unlink_tolerates_user_unknown() {
        let _m = mockito::mock("POST", "/unlinkTypeWorldUserAccount")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"response": "userUnknown"}"#)
            .create();
        mothership()
            .unlink_user_account(&context(), "app-1", "user-1", "secret")
            .unwrap();
    }

    #[test]
    fn test_download_subscriptions_parses_held_subscriptions() {
        let _m = mockito::mock("POST", "/downloadUserSubscriptions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"response": "success",
                    "appInstanceIsRevoked": false,
                    "heldSubscriptions": [
                        {"url": "typeworld://json+https//sub:key@fonts.example.com/api/",
                         "serverTimestamp": 1610000000}
                    ],
                    "acceptedInvitations": [], "pendingInvitations": [],
                    "sentInvitations": [],
                    "userAccountStatus": "pro"}"#,
            )
            .create();
        let response = mothership()
            .download_user_subscriptions(&context(), "app-1", "user-1", "secret", "UTC")
            .unwrap();
        assert_eq!(response.held_subscriptions.len(), 1);
        assert_eq!(
            response.held_subscriptions[0].server_timestamp,
            Some(1610000000)
        );
        assert_eq!(response.user_account_status.as_deref(), Some("pro"));
        assert!(!response.app_instance_is_revoked);
    }

    #[test]
    fn test_http_error_is_surfaced() {
        let _m = mockito::mock("POST", "/registerAPIEndpoint")
            .with_status(500)
            .create();
        let err = mothership()
            .register_api_endpoint(&context(), "typeworld://json+https//fonts.example.com/api/")
            .unwrap_err();
        assert!(matches!(err, ClientError::HttpStatus(500)));
    }

    #[test]
    fn test_transport_error_is_redacted() {
        // Nothing listens on this port.
        let mothership = Mothership::new(
            "http://127.0.0.1:9",
            reqwest::blocking::Client::new(),
        );
        let err = mothership
            .upload_user_subscriptions(&context(), "app-1", "user-1", "s3cr3t", &[])
            .unwrap_err();
        let text = err.to_string();
        assert!(!text.contains("s3cr3t"), "secret leaked into: {}", text);
        assert!(text.contains("*****"));
    }
}
