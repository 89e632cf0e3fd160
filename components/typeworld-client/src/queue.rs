/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Deferred command queue.
//!
//! Account and subscription actions taken while offline (or while the
//! mothership is briefly unreachable) are appended here and replayed in a
//! fixed order once the client is online again. The queue is persisted
//! under the `pendingOnlineCommands` preference so deferred work survives
//! restarts. This module owns storage and ordering; the orchestrator owns
//! the per-kind handlers and the drain itself.

use crate::prefs::Preferences;
use serde_json::Value;

const QUEUE_KEY: &str = "pendingOnlineCommands";

/// Placeholder payload for commands whose payload is derived at drain
/// time.
pub const PENDING: &str = "pending";
/// Marker for an intentionally empty subscription list upload.
pub const EMPTY: &str = "empty";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    UnlinkUser,
    LinkUser,
    SyncSubscriptions,
    UploadSubscriptions,
    AcceptInvitation,
    DeclineInvitation,
    DownloadSubscriptions,
    DownloadSettings,
}

impl CommandKind {
    /// Fixed drain order: unlink before link (switch-user flows), state
    /// syncs before downloads, invitation responses before the sync that
    /// would observe them.
    pub const DRAIN_ORDER: [CommandKind; 8] = [
        CommandKind::UnlinkUser,
        CommandKind::LinkUser,
        CommandKind::SyncSubscriptions,
        CommandKind::UploadSubscriptions,
        CommandKind::AcceptInvitation,
        CommandKind::DeclineInvitation,
        CommandKind::DownloadSubscriptions,
        CommandKind::DownloadSettings,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::UnlinkUser => "unlinkUser",
            CommandKind::LinkUser => "linkUser",
            CommandKind::SyncSubscriptions => "syncSubscriptions",
            CommandKind::UploadSubscriptions => "uploadSubscriptions",
            CommandKind::AcceptInvitation => "acceptInvitation",
            CommandKind::DeclineInvitation => "declineInvitation",
            CommandKind::DownloadSubscriptions => "downloadSubscriptions",
            CommandKind::DownloadSettings => "downloadSettings",
        }
    }
}

#[derive(Clone)]
pub struct CommandQueue {
    prefs: Preferences,
}

impl CommandQueue {
    pub fn new(prefs: Preferences) -> Self {
        CommandQueue { prefs }
    }

    /// Append payloads to a queue, skipping any already present.
    pub fn append(&self, kind: CommandKind, payloads: &[String]) {
        let mut queues = self.prefs.get_object(QUEUE_KEY);
        let entry = queues
            .entry(kind.as_str().to_string())
            .or_insert_with(|| Value::Array(vec![]));
        if !entry.is_array() {
            *entry = Value::Array(vec![]);
        }
        let list = entry.as_array_mut().expect("just ensured an array");
        for payload in payloads {
            if !list.iter().any(|existing| existing.as_str() == Some(payload)) {
                list.push(Value::String(payload.clone()));
            }
        }
        self.prefs.set(QUEUE_KEY, Value::Object(queues));
    }

    /// Append the `pending` placeholder.
    pub fn append_pending(&self, kind: CommandKind) {
        self.append(kind, &[PENDING.to_string()]);
    }

    /// Queued payloads for one kind, in insertion order.
    pub fn pending(&self, kind: CommandKind) -> Vec<String> {
        self.prefs
            .get_object(QUEUE_KEY)
            .get(kind.as_str())
            .and_then(|v| v.as_array().cloned())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Clear a kind's slot after its handler succeeded.
    pub fn clear(&self, kind: CommandKind) {
        let mut queues = self.prefs.get_object(QUEUE_KEY);
        queues.insert(kind.as_str().to_string(), Value::Array(vec![]));
        self.prefs.set(QUEUE_KEY, Value::Object(queues));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> CommandQueue {
        CommandQueue::new(Preferences::in_memory())
    }

    #[test]
    fn test_append_is_idempotent() {
        let queue = queue();
        queue.append(CommandKind::LinkUser, &["user-1".to_string()]);
        queue.append(CommandKind::LinkUser, &["user-1".to_string()]);
        assert_eq!(queue.pending(CommandKind::LinkUser), vec!["user-1".to_string()]);
    }

    #[test]
    fn test_insertion_order_is_preserved() {
        let queue = queue();
        queue.append(
            CommandKind::AcceptInvitation,
            &["url-b".to_string(), "url-a".to_string()],
        );
        queue.append(CommandKind::AcceptInvitation, &["url-c".to_string()]);
        assert_eq!(
            queue.pending(CommandKind::AcceptInvitation),
            vec!["url-b".to_string(), "url-a".to_string(), "url-c".to_string()]
        );
    }

    #[test]
    fn test_clear_leaves_other_kinds_alone() {
        let queue = queue();
        queue.append_pending(CommandKind::DownloadSubscriptions);
        queue.append_pending(CommandKind::DownloadSettings);
        queue.clear(CommandKind::DownloadSubscriptions);
        assert!(queue.pending(CommandKind::DownloadSubscriptions).is_empty());
        assert_eq!(
            queue.pending(CommandKind::DownloadSettings),
            vec![PENDING.to_string()]
        );
    }

    #[test]
    fn test_queue_survives_reload() {
        let prefs = Preferences::in_memory();
        CommandQueue::new(prefs.clone()).append(CommandKind::UnlinkUser, &[PENDING.to_string()]);
        // A fresh queue over the same store sees the entry.
        assert_eq!(
            CommandQueue::new(prefs).pending(CommandKind::UnlinkUser),
            vec![PENDING.to_string()]
        );
    }

    #[test]
    fn test_drain_order() {
        let names: Vec<&str> = CommandKind::DRAIN_ORDER.iter().map(|k| k.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "unlinkUser",
                "linkUser",
                "syncSubscriptions",
                "uploadSubscriptions",
                "acceptInvitation",
                "declineInvitation",
                "downloadSubscriptions",
                "downloadSettings",
            ]
        );
    }
}
