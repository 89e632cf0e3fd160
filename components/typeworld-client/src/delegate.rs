/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! User-observable lifecycle events.
//!
//! The embedding application registers closures for the events it cares
//! about; unset callbacks are no-ops. Every dispatch runs behind a panic
//! boundary so a misbehaving callback can never abort the operation that
//! triggered it; panics are routed to the traceback reporter instead.

use crate::catalog::Font;
use crate::error::ClientError;
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// The set of callbacks an application can register. Font events carry
/// the catalog entry; subscription and publisher events carry the
/// identity URL of the object concerned.
#[derive(Default)]
pub struct DelegateCallbacks {
    pub font_will_install: Option<Box<dyn Fn(&Font) + Send + Sync>>,
    pub font_has_installed: Option<Box<dyn Fn(bool, Option<&ClientError>, &Font) + Send + Sync>>,
    pub font_will_uninstall: Option<Box<dyn Fn(&Font) + Send + Sync>>,
    pub font_has_uninstalled: Option<Box<dyn Fn(bool, Option<&ClientError>, &Font) + Send + Sync>>,
    pub subscription_has_been_added: Option<Box<dyn Fn(&str) + Send + Sync>>,
    pub subscription_will_update: Option<Box<dyn Fn(&str) + Send + Sync>>,
    pub subscription_has_been_updated:
        Option<Box<dyn Fn(&str, bool, Option<&ClientError>, bool) + Send + Sync>>,
    pub subscription_has_been_deleted: Option<Box<dyn Fn(&str) + Send + Sync>>,
    pub subscription_update_notification_has_been_received:
        Option<Box<dyn Fn(&str) + Send + Sync>>,
    pub publisher_has_been_deleted: Option<Box<dyn Fn(&str) + Send + Sync>>,
    pub user_account_update_notification_has_been_received: Option<Box<dyn Fn() + Send + Sync>>,
    pub user_account_has_been_updated: Option<Box<dyn Fn() + Send + Sync>>,
    pub client_preference_changed: Option<Box<dyn Fn(&str) + Send + Sync>>,
    pub message_queue_connected: Option<Box<dyn Fn() + Send + Sync>>,
    pub message_queue_disconnected: Option<Box<dyn Fn() + Send + Sync>>,
}

type PanicSink = Box<dyn Fn(&str, &str) + Send + Sync>;

pub(crate) struct Delegate {
    callbacks: DelegateCallbacks,
    panic_sink: Mutex<Option<PanicSink>>,
}

impl Delegate {
    pub fn new(callbacks: DelegateCallbacks) -> Self {
        Delegate {
            callbacks,
            panic_sink: Mutex::new(None),
        }
    }

    /// Route callback panics somewhere (the orchestrator wires this to
    /// its traceback reporter).
    pub fn set_panic_sink(&self, sink: PanicSink) {
        *self.panic_sink.lock() = Some(sink);
    }

    fn guarded(&self, event: &str, call: impl FnOnce()) {
        if let Err(panic) = catch_unwind(AssertUnwindSafe(call)) {
            let description = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            log::warn!("delegate callback {} panicked: {}", event, description);
            if let Some(sink) = &*self.panic_sink.lock() {
                sink(event, &description);
            }
        }
    }

    pub fn font_will_install(&self, font: &Font) {
        self.guarded("fontWillInstall", || {
            if let Some(cb) = &self.callbacks.font_will_install {
                cb(font)
            }
        });
    }

    pub fn font_has_installed(&self, success: bool, message: Option<&ClientError>, font: &Font) {
        self.guarded("fontHasInstalled", || {
            if let Some(cb) = &self.callbacks.font_has_installed {
                cb(success, message, font)
            }
        });
    }

    pub fn font_will_uninstall(&self, font: &Font) {
        self.guarded("fontWillUninstall", || {
            if let Some(cb) = &self.callbacks.font_will_uninstall {
                cb(font)
            }
        });
    }

    pub fn font_has_uninstalled(&self, success: bool, message: Option<&ClientError>, font: &Font) {
        self.guarded("fontHasUninstalled", || {
            if let Some(cb) = &self.callbacks.font_has_uninstalled {
                cb(success, message, font)
            }
        });
    }

    pub fn subscription_has_been_added(&self, url: &str) {
        self.guarded("subscriptionHasBeenAdded", || {
            if let Some(cb) = &self.callbacks.subscription_has_been_added {
                cb(url)
            }
        });
    }

    pub fn subscription_will_update(&self, url: &str) {
        self.guarded("subscriptionWillUpdate", || {
            if let Some(cb) = &self.callbacks.subscription_will_update {
                cb(url)
            }
        });
    }

    pub fn subscription_has_been_updated(
        &self,
        url: &str,
        success: bool,
        message: Option<&ClientError>,
        changes: bool,
    ) {
        self.guarded("subscriptionHasBeenUpdated", || {
            if let Some(cb) = &self.callbacks.subscription_has_been_updated {
                cb(url, success, message, changes)
            }
        });
    }

    pub fn subscription_has_been_deleted(&self, url: &str) {
        self.guarded("subscriptionHasBeenDeleted", || {
            if let Some(cb) = &self.callbacks.subscription_has_been_deleted {
                cb(url)
            }
        });
    }

    pub fn subscription_update_notification_has_been_received(&self, url: &str) {
        self.guarded("subscriptionUpdateNotificationHasBeenReceived", || {
            if let Some(cb) = &self
                .callbacks
                .subscription_update_notification_has_been_received
            {
                cb(url)
            }
        });
    }

    pub fn publisher_has_been_deleted(&self, canonical_url: &str) {
        self.guarded("publisherHasBeenDeleted", || {
            if let Some(cb) = &self.callbacks.publisher_has_been_deleted {
                cb(canonical_url)
            }
        });
    }

    pub fn user_account_update_notification_has_been_received(&self) {
        self.guarded("userAccountUpdateNotificationHasBeenReceived", || {
            if let Some(cb) = &self
                .callbacks
                .user_account_update_notification_has_been_received
            {
                cb()
            }
        });
    }

    pub fn user_account_has_been_updated(&self) {
        self.guarded("userAccountHasBeenUpdated", || {
            if let Some(cb) = &self.callbacks.user_account_has_been_updated {
                cb()
            }
        });
    }

    pub fn client_preference_changed(&self, key: &str) {
        self.guarded("clientPreferenceChanged", || {
            if let Some(cb) = &self.callbacks.client_preference_changed {
                cb(key)
            }
        });
    }

    pub fn message_queue_connected(&self) {
        self.guarded("messageQueueConnected", || {
            if let Some(cb) = &self.callbacks.message_queue_connected {
                cb()
            }
        });
    }

    pub fn message_queue_disconnected(&self) {
        self.guarded("messageQueueDisconnected", || {
            if let Some(cb) = &self.callbacks.message_queue_disconnected {
                cb()
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_unset_callbacks_are_noops() {
        let delegate = Delegate::new(DelegateCallbacks::default());
        delegate.user_account_has_been_updated();
        delegate.message_queue_connected();
    }

    #[test]
    fn test_panic_is_contained_and_reported() {
        let mut callbacks = DelegateCallbacks::default();
        callbacks.user_account_has_been_updated = Some(Box::new(|| panic!("callback exploded")));
        let delegate = Delegate::new(callbacks);

        let reports = Arc::new(AtomicUsize::new(0));
        let reports2 = reports.clone();
        delegate.set_panic_sink(Box::new(move |event, description| {
            assert_eq!(event, "userAccountHasBeenUpdated");
            assert!(description.contains("callback exploded"));
            reports2.fetch_add(1, Ordering::SeqCst);
        }));

        // Must not propagate the panic.
        delegate.user_account_has_been_updated();
        assert_eq!(reports.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_callback_receives_arguments() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let mut callbacks = DelegateCallbacks::default();
        callbacks.subscription_has_been_updated = Some(Box::new(move |url, success, _, changes| {
            seen2.lock().push((url.to_string(), success, changes));
        }));
        let delegate = Delegate::new(callbacks);
        delegate.subscription_has_been_updated("typeworld://json+https//x@y/", true, None, true);
        assert_eq!(
            *seen.lock(),
            vec![("typeworld://json+https//x@y/".to_string(), true, true)]
        );
    }
}
