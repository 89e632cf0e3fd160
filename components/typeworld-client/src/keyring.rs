/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Named-secret storage behind a small trait so OS keychains can be
//! plugged in by the embedding application. Secrets held here (the user
//! account's `secretKey`, mirrored account email/name, the website token)
//! must never reach the preferences store or any log line.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

pub trait Keyring: Send {
    fn set_password(&mut self, service: &str, field: &str, value: &str);
    fn get_password(&self, service: &str, field: &str) -> Option<String>;
    fn delete_password(&mut self, service: &str, field: &str);
}

/// In-process keyring for headless and CI use, where real keychain
/// backends are unavailable or flaky.
#[derive(Default)]
pub struct MemoryKeyring {
    entries: HashMap<(String, String), String>,
}

impl MemoryKeyring {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Keyring for MemoryKeyring {
    fn set_password(&mut self, service: &str, field: &str, value: &str) {
        self.entries
            .insert((service.to_string(), field.to_string()), value.to_string());
    }

    fn get_password(&self, service: &str, field: &str) -> Option<String> {
        self.entries
            .get(&(service.to_string(), field.to_string()))
            .cloned()
    }

    fn delete_password(&mut self, service: &str, field: &str) {
        self.entries
            .remove(&(service.to_string(), field.to_string()));
    }
}

/// Shared handle over a [`Keyring`] implementation.
#[derive(Clone)]
pub struct KeyringHandle {
    inner: Arc<Mutex<Box<dyn Keyring>>>,
}

impl KeyringHandle {
    pub fn new(keyring: Box<dyn Keyring>) -> Self {
        KeyringHandle {
            inner: Arc::new(Mutex::new(keyring)),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryKeyring::new()))
    }

    pub fn set_password(&self, service: &str, field: &str, value: &str) {
        self.inner.lock().set_password(service, field, value);
    }

    pub fn get_password(&self, service: &str, field: &str) -> Option<String> {
        self.inner.lock().get_password(service, field)
    }

    pub fn delete_password(&self, service: &str, field: &str) {
        self.inner.lock().delete_password(service, field);
    }
}

/// Keychain entry id for a user account on this installation.
pub fn user_keychain_key(user_id: &str, anonymous_app_id: &str) -> String {
    format!("https://{}@{}.type.world", user_id, anonymous_app_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_and_delete() {
        let keyring = KeyringHandle::in_memory();
        let service = user_keychain_key("user1", "app1");
        keyring.set_password(&service, "secretKey", "s3cr3t");
        assert_eq!(
            keyring.get_password(&service, "secretKey").unwrap(),
            "s3cr3t"
        );
        keyring.delete_password(&service, "secretKey");
        assert!(keyring.get_password(&service, "secretKey").is_none());
    }

    #[test]
    fn test_fields_are_separate() {
        let keyring = KeyringHandle::in_memory();
        keyring.set_password("svc", "userEmail", "a@example.com");
        keyring.set_password("svc", "userName", "A");
        assert_eq!(keyring.get_password("svc", "userEmail").unwrap(), "a@example.com");
        assert_eq!(keyring.get_password("svc", "userName").unwrap(), "A");
        assert!(keyring.get_password("svc", "secretKey").is_none());
    }

    #[test]
    fn test_keychain_key_format() {
        assert_eq!(
            user_keychain_key("uid", "appid"),
            "https://uid@appid.type.world"
        );
    }
}
