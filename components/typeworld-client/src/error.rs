/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Error type shared by every public operation of this crate.
//!
//! Errors come in two flavors. Infrastructure problems (I/O, malformed
//! data, transport failures) carry an English message. Server replies
//! carry the raw reply code and render as the localization-ready pair
//! `["#(response.<code>)", "#(response.<code>.headline)"]` so that a UI
//! can resolve them against its string catalog.

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// A reply code from the central server or a publisher endpoint,
    /// e.g. `seatAllowanceReached` or `termsOfServiceNotAccepted`.
    #[error("#(response.{0})")]
    Response(String),

    /// Infrastructure error with a human-readable description.
    #[error("{0}")]
    Message(String),

    #[error("{0}")]
    InvalidUrl(String),

    #[error("Protocol {0} doesn’t exist in this app (yet).")]
    UnknownProtocol(String),

    #[error("HTTP Error {0}")]
    HttpStatus(u16),

    #[error("Network error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Malformed URL error: {0}")]
    MalformedUrl(#[from] url::ParseError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Version parse error: {0}")]
    Version(#[from] semver::Error),
}

impl ClientError {
    /// Wrap a server reply code.
    pub fn response(code: impl Into<String>) -> Self {
        ClientError::Response(code.into())
    }

    pub fn message(text: impl std::fmt::Display) -> Self {
        ClientError::Message(text.to_string())
    }

    /// True if this is the server reply `code`.
    pub fn is_response(&self, code: &str) -> bool {
        matches!(self, ClientError::Response(c) if c == code)
    }

    /// The `["#(response.<code>)", "#(response.<code>.headline)"]` pair
    /// for UI consumption, if this error is a server reply.
    pub fn localization_pair(&self) -> Option<[String; 2]> {
        match self {
            ClientError::Response(code) => Some([
                format!("#(response.{})", code),
                format!("#(response.{}.headline)", code),
            ]),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_localization_pair() {
        let err = ClientError::response("seatAllowanceReached");
        assert_eq!(
            err.localization_pair().unwrap(),
            [
                "#(response.seatAllowanceReached)".to_string(),
                "#(response.seatAllowanceReached.headline)".to_string(),
            ]
        );
        assert!(err.is_response("seatAllowanceReached"));
        assert!(!err.is_response("notOnline"));
        assert!(ClientError::message("boom").localization_pair().is_none());
    }
}
